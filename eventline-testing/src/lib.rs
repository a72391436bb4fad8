//! Testing utilities for Eventline
//!
//! - [`chaos`]: an [`EventStore`](eventline_types::EventStore) wrapper that
//!   injects failures and conflicts, either at random or scripted per
//!   operation, and records every call it forwards.
//! - [`contract`]: behavioral scenarios every event store backend must pass,
//!   plus the [`event_store_contract_tests!`] macro that turns them into tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod chaos;
pub mod contract;
