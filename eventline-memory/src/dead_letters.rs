use async_trait::async_trait;
use eventline::{DeadLetter, DeadLetterLog, EventStoreResult, ProcessName};
use parking_lot::Mutex;
use std::sync::Arc;

/// Dead-letter log kept in memory for inspection in tests.
///
/// Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeadLetters {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetters {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded dead letter, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }

    /// Dead letters recorded by `process_name`.
    pub fn for_process(&self, process_name: &ProcessName) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .iter()
            .filter(|letter| &letter.process_name == process_name)
            .cloned()
            .collect()
    }

    /// Number of recorded dead letters.
    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    /// True when nothing was dead-lettered.
    pub fn is_empty(&self) -> bool {
        self.letters.lock().is_empty()
    }
}

#[async_trait]
impl DeadLetterLog for InMemoryDeadLetters {
    async fn record(&self, letter: DeadLetter) -> EventStoreResult<()> {
        self.letters.lock().push(letter);
        Ok(())
    }
}
