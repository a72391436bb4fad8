//! Per-process durable metadata and the cluster-wide process lock.

use crate::errors::MetadataResult;
use crate::process::ProcessName;
use async_trait::async_trait;
use eventline_types::Token;
use std::sync::Arc;
use tokio::sync::watch;

/// Ownership state of a process lock as seen by one metadata handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockState {
    /// Not held and not requested.
    Unlocked,
    /// Requested; another owner holds it.
    Waiting,
    /// Held by this handle.
    Locked,
}

/// Checkpoint, version tag and lock of one named process.
///
/// At most one handle per process name holds the lock at any time across the
/// cluster. Implementations publish every lock state change through
/// [`lock_state`](Self::lock_state), including involuntary loss.
#[async_trait]
pub trait ProcessMetadata: Send + Sync {
    /// Resolves once this handle holds the lock.
    ///
    /// Dropping the returned future abandons the request; callers follow up
    /// with [`unlock`](Self::unlock).
    async fn wait_for_lock(&self) -> MetadataResult<()>;

    /// Releases the lock or abandons a pending request. A no-op when neither.
    async fn unlock(&self) -> MetadataResult<()>;

    /// Subscribes to this handle's lock state.
    fn lock_state(&self) -> watch::Receiver<LockState>;

    /// True while a lock request is pending.
    fn waits_for_lock(&self) -> bool {
        *self.lock_state().borrow() == LockState::Waiting
    }

    /// True while this handle holds the lock.
    fn is_locked(&self) -> bool {
        *self.lock_state().borrow() == LockState::Locked
    }

    /// The persisted checkpoint; `Token::Initial` when none was saved.
    async fn get_token(&self) -> MetadataResult<Token>;

    /// Persists the checkpoint.
    async fn set_token(&self, token: Token) -> MetadataResult<()>;

    /// The persisted version tag, if any.
    async fn get_version(&self) -> MetadataResult<Option<String>>;

    /// Persists the version tag.
    async fn set_version(&self, version: &str) -> MetadataResult<()>;
}

/// Hands out metadata handles by process name.
pub trait MetadataProvider: Send + Sync {
    /// A new handle on the metadata of `process_name`.
    fn metadata(&self, process_name: &ProcessName) -> Arc<dyn ProcessMetadata>;
}
