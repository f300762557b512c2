//! Saga instance persistence.
//!
//! # The Contract
//!
//! 1. **Load by correlation id.** `find_by_id` returns the latest saved
//!    instance or `None`.
//! 2. **Versioned save.** `save_and_flush` succeeds only if the stored version
//!    still equals `instance.version` (zero meaning "not stored yet") and
//!    returns the new version. Otherwise it fails with [`StoreError::Conflict`]
//!    and stores nothing.
//! 3. **Durable on return.** Once `save_and_flush` returns, the write is
//!    visible to every other reader.
//!
//! The engine relies on (2) to process the events of one saga one at a time
//! without holding locks: a concurrent writer loses the race, gets a conflict
//! and the engine reprocesses its event against fresh state.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::StoreError;
use crate::state::{SagaData, SagaInstance};

/// Operational counts over all stored instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SagaCounts {
    /// Neither completed nor cancelled.
    pub active: u64,
    pub completed: u64,
    pub cancelled: u64,
}

impl SagaCounts {
    pub fn total(&self) -> u64 {
        self.active + self.completed + self.cancelled
    }

    fn tally<D>(instances: &[SagaInstance<D>]) -> Self {
        instances.iter().fold(Self::default(), |mut counts, instance| {
            if instance.cancelled {
                counts.cancelled += 1;
            } else if instance.completed {
                counts.completed += 1;
            } else {
                counts.active += 1;
            }
            counts
        })
    }
}

/// Storage for saga instances with optimistic concurrency.
#[async_trait]
pub trait SagaRepository<D: SagaData>: Send + Sync + 'static {
    async fn find_by_id(&self, id: &str) -> Result<Option<SagaInstance<D>>, StoreError>;

    async fn find_all(&self) -> Result<Vec<SagaInstance<D>>, StoreError>;

    /// Save if the stored version equals `instance.version`; returns the new version.
    async fn save_and_flush(&self, instance: &SagaInstance<D>) -> Result<u64, StoreError>;

    /// Active, completed and cancelled totals.
    ///
    /// The default implementation scans [`find_all`](Self::find_all).
    async fn counts(&self) -> Result<SagaCounts, StoreError> {
        let all = self.find_all().await?;
        Ok(SagaCounts::tally(&all))
    }
}

/// Process-local repository on a concurrent map.
pub struct InMemorySagaRepository<D> {
    instances: DashMap<String, SagaInstance<D>>,
}

impl<D: SagaData> InMemorySagaRepository<D> {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl<D: SagaData> Default for InMemorySagaRepository<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<D: SagaData> SagaRepository<D> for InMemorySagaRepository<D> {
    async fn find_by_id(&self, id: &str) -> Result<Option<SagaInstance<D>>, StoreError> {
        Ok(self.instances.get(id).map(|entry| entry.value().clone()))
    }

    async fn find_all(&self) -> Result<Vec<SagaInstance<D>>, StoreError> {
        Ok(self
            .instances
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn save_and_flush(&self, instance: &SagaInstance<D>) -> Result<u64, StoreError> {
        let next = instance.version + 1;
        match self.instances.entry(instance.id.clone()) {
            Entry::Occupied(mut stored) => {
                if stored.get().version != instance.version {
                    return Err(StoreError::Conflict);
                }
                let mut saved = instance.clone();
                saved.version = next;
                stored.insert(saved);
            }
            Entry::Vacant(vacant) => {
                if !instance.is_new() {
                    return Err(StoreError::Conflict);
                }
                let mut saved = instance.clone();
                saved.version = next;
                vacant.insert(saved);
            }
        }
        Ok(next)
    }
}

impl<D> std::fmt::Debug for InMemorySagaRepository<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySagaRepository")
            .field("instances", &self.instances.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_versioned_save() {
        let repo = InMemorySagaRepository::<u32>::new();
        let mut instance = SagaInstance::new("s-1");

        instance.version = repo.save_and_flush(&instance).await.unwrap();
        assert_eq!(instance.version, 1);

        let stale = instance.clone();
        instance.data = 7;
        instance.version = repo.save_and_flush(&instance).await.unwrap();
        assert_eq!(instance.version, 2);

        assert!(matches!(
            repo.save_and_flush(&stale).await,
            Err(StoreError::Conflict)
        ));
        let stored = repo.find_by_id("s-1").await.unwrap().unwrap();
        assert_eq!(stored.data, 7);
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn test_concurrent_creation_conflicts() {
        let repo = InMemorySagaRepository::<u32>::new();
        let first = SagaInstance::new("s-1");
        let second = SagaInstance::new("s-1");

        assert!(repo.save_and_flush(&first).await.is_ok());
        assert!(matches!(
            repo.save_and_flush(&second).await,
            Err(StoreError::Conflict)
        ));
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn test_counts() {
        let repo = InMemorySagaRepository::<()>::new();
        for (id, completed, cancelled) in [("a", false, false), ("b", true, false), ("c", false, true)] {
            let mut instance = SagaInstance::new(id);
            instance.completed = completed;
            instance.cancelled = cancelled;
            repo.save_and_flush(&instance).await.unwrap();
        }

        let counts = repo.counts().await.unwrap();
        assert_eq!(
            counts,
            SagaCounts {
                active: 1,
                completed: 1,
                cancelled: 1
            }
        );
        assert_eq!(counts.total(), 3);
    }
}
