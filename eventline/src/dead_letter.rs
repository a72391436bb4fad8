//! Contract for recording events a process gave up on.

use crate::process::ProcessName;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventline_types::{EventStoreResult, StoredEvent};
use serde::{Deserialize, Serialize};

/// An event permanently skipped by a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The process that skipped the event.
    pub process_name: ProcessName,
    /// The skipped event.
    pub event: StoredEvent,
    /// When the event was dead-lettered.
    pub recorded_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Creates a dead letter stamped with the current time.
    pub fn new(process_name: ProcessName, event: StoredEvent) -> Self {
        Self {
            process_name,
            event,
            recorded_at: Utc::now(),
        }
    }
}

/// Durable log of dead letters, kept for inspection.
#[async_trait]
pub trait DeadLetterLog: Send + Sync {
    /// Appends `letter` to the log.
    async fn record(&self, letter: DeadLetter) -> EventStoreResult<()>;
}
