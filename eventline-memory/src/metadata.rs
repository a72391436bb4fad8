use async_trait::async_trait;
use eventline::{
    LockState, MetadataError, MetadataProvider, MetadataResult, ProcessMetadata, ProcessName,
    Token,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Process metadata and cluster-wide locks kept in memory.
///
/// Every call to [`MetadataProvider::metadata`] returns a new handle, so two
/// handles on the same name behave like two nodes competing for one lock.
#[derive(Clone)]
pub struct InMemoryMetadataProvider {
    shared: Arc<Shared>,
}

struct Shared {
    records: Mutex<HashMap<ProcessName, Record>>,
    next_handle: AtomicU64,
    // Bumped whenever a lock is released
    released: watch::Sender<u64>,
}

#[derive(Default)]
struct Record {
    token: String,
    version: Option<String>,
    owner: Option<Owner>,
    failures_left: u32,
}

struct Owner {
    handle: u64,
    state: Arc<watch::Sender<LockState>>,
}

impl InMemoryMetadataProvider {
    /// Creates an empty provider.
    pub fn new() -> Self {
        let (released, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                records: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
                released,
            }),
        }
    }

    /// A new concrete handle on the metadata of `process_name`.
    pub fn handle(&self, process_name: &ProcessName) -> InMemoryProcessMetadata {
        let (state, _) = watch::channel(LockState::Unlocked);
        InMemoryProcessMetadata {
            name: process_name.clone(),
            handle: self.shared.next_handle.fetch_add(1, Ordering::Relaxed),
            shared: Arc::clone(&self.shared),
            state: Arc::new(state),
        }
    }

    /// Makes the next `count` metadata operations on `process_name` fail.
    pub fn fail_next(&self, process_name: &ProcessName, count: u32) {
        self.shared
            .records
            .lock()
            .entry(process_name.clone())
            .or_default()
            .failures_left = count;
    }

    /// Hands the lock of `process_name` to a new handle, whoever holds it.
    ///
    /// The previous holder observes `LockState::Unlocked`.
    pub fn take_over(&self, process_name: &ProcessName) -> InMemoryProcessMetadata {
        let usurper = self.handle(process_name);
        let previous = {
            let mut records = self.shared.records.lock();
            let record = records.entry(process_name.clone()).or_default();
            record.owner.replace(Owner {
                handle: usurper.handle,
                state: Arc::clone(&usurper.state),
            })
        };
        let _ = usurper.state.send_replace(LockState::Locked);
        if let Some(previous) = previous {
            debug!(process = %process_name, "lock taken over");
            let _ = previous.state.send_replace(LockState::Unlocked);
        }
        usurper
    }

    /// The checkpoint currently stored for `process_name`.
    pub fn stored_token(&self, process_name: &ProcessName) -> Token {
        self.shared
            .records
            .lock()
            .get(process_name)
            .and_then(|record| record.token.parse().ok())
            .unwrap_or_default()
    }

    /// The version tag currently stored for `process_name`.
    pub fn stored_version(&self, process_name: &ProcessName) -> Option<String> {
        self.shared
            .records
            .lock()
            .get(process_name)
            .and_then(|record| record.version.clone())
    }
}

impl Default for InMemoryMetadataProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataProvider for InMemoryMetadataProvider {
    fn metadata(&self, process_name: &ProcessName) -> Arc<dyn ProcessMetadata> {
        Arc::new(self.handle(process_name))
    }
}

/// One handle on a process's in-memory metadata.
pub struct InMemoryProcessMetadata {
    name: ProcessName,
    handle: u64,
    shared: Arc<Shared>,
    state: Arc<watch::Sender<LockState>>,
}

impl InMemoryProcessMetadata {
    /// Runs `operation` on the record, consuming an injected failure first.
    fn with_record<T>(&self, operation: impl FnOnce(&mut Record) -> T) -> MetadataResult<T> {
        let mut records = self.shared.records.lock();
        let record = records.entry(self.name.clone()).or_default();
        if record.failures_left > 0 {
            record.failures_left -= 1;
            return Err(MetadataError::Unavailable {
                process: self.name.to_string(),
                detail: "injected failure".to_owned(),
            });
        }
        Ok(operation(record))
    }

    /// Claims the lock if it is free; true when this handle holds it.
    fn try_lock(&self) -> MetadataResult<bool> {
        self.with_record(|record| match &record.owner {
            Some(owner) if owner.handle != self.handle => false,
            Some(_) => true,
            None => {
                record.owner = Some(Owner {
                    handle: self.handle,
                    state: Arc::clone(&self.state),
                });
                true
            }
        })
    }
}

#[async_trait]
impl ProcessMetadata for InMemoryProcessMetadata {
    async fn wait_for_lock(&self) -> MetadataResult<()> {
        let mut released = self.shared.released.subscribe();
        loop {
            if self.try_lock()? {
                let _ = self.state.send_replace(LockState::Locked);
                debug!(process = %self.name, handle = self.handle, "lock acquired");
                return Ok(());
            }
            let _ = self.state.send_replace(LockState::Waiting);
            if released.changed().await.is_err() {
                return Err(MetadataError::Unavailable {
                    process: self.name.to_string(),
                    detail: "lock provider dropped".to_owned(),
                });
            }
        }
    }

    async fn unlock(&self) -> MetadataResult<()> {
        let released = {
            let mut records = self.shared.records.lock();
            records.get_mut(&self.name).is_some_and(|record| {
                let held = record
                    .owner
                    .as_ref()
                    .is_some_and(|owner| owner.handle == self.handle);
                if held {
                    record.owner = None;
                }
                held
            })
        };
        let _ = self.state.send_replace(LockState::Unlocked);
        if released {
            debug!(process = %self.name, handle = self.handle, "lock released");
            self.shared.released.send_modify(|generation| *generation += 1);
        }
        Ok(())
    }

    fn lock_state(&self) -> watch::Receiver<LockState> {
        self.state.subscribe()
    }

    async fn get_token(&self) -> MetadataResult<Token> {
        let text = self.with_record(|record| record.token.clone())?;
        Ok(text.parse()?)
    }

    async fn set_token(&self, token: Token) -> MetadataResult<()> {
        self.with_record(|record| record.token = token.to_string())
    }

    async fn get_version(&self) -> MetadataResult<Option<String>> {
        self.with_record(|record| record.version.clone())
    }

    async fn set_version(&self, version: &str) -> MetadataResult<()> {
        self.with_record(|record| record.version = Some(version.to_owned()))
    }
}
