use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::FlagError;
use crate::evaluation::{evaluate_flag, process_new_rule_chain, FlagEvaluation};
use crate::flags::{Record, RuleChain, Tag};
use crate::query::Update;
use crate::store::{FlagReader, FlagWriter};

/// Serializes read-modify-write cycles per flag id within this process.
#[derive(Default)]
struct FlagLocks {
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl FlagLocks {
    async fn lock(&self, id: &str) -> FlagGuard<'_> {
        // clone out of the shard before awaiting
        let lock = self.locks.entry(id.to_string()).or_default().clone();
        FlagGuard {
            locks: self,
            id: id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }
}

struct FlagGuard<'a> {
    locks: &'a FlagLocks,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // only the map's own handle left: nobody holds or waits on it
        self.locks
            .locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Manages feature flags on top of a record reader and writer.
pub struct FlagService {
    reader: Arc<dyn FlagReader>,
    writer: Arc<dyn FlagWriter>,
    locks: FlagLocks,
}

#[derive(Default)]
pub struct FlagServiceBuilder {
    reader: Option<Arc<dyn FlagReader>>,
    writer: Option<Arc<dyn FlagWriter>>,
}

impl FlagServiceBuilder {
    pub fn reader(mut self, reader: Arc<dyn FlagReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn writer(mut self, writer: Arc<dyn FlagWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Fails listing every missing collaborator, not just the first.
    pub fn build(self) -> Result<FlagService, FlagError> {
        match (self.reader, self.writer) {
            (Some(reader), Some(writer)) => Ok(FlagService {
                reader,
                writer,
                locks: FlagLocks::default(),
            }),
            (reader, writer) => {
                let mut missing = Vec::new();
                if reader.is_none() {
                    missing.push("flags reader");
                }
                if writer.is_none() {
                    missing.push("flags writer");
                }
                Err(FlagError::MissingDependencies(missing))
            }
        }
    }
}

impl FlagService {
    pub fn builder() -> FlagServiceBuilder {
        FlagServiceBuilder::default()
    }

    /// Build a service whose reader and writer are the same store.
    pub fn with_store<S>(store: Arc<S>) -> Self
    where
        S: FlagReader + FlagWriter + 'static,
    {
        Self {
            reader: store.clone(),
            writer: store,
            locks: FlagLocks::default(),
        }
    }

    /// Create a flag with a fresh id and no rule blocks.
    pub async fn new_flag(&self, name: &str, default_value: bool) -> Result<Record, FlagError> {
        let record = Record {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            default_value,
            rule_blocks: None,
        };

        self.writer.create(&record).await.map_err(|e| {
            error!(error = %e, flag = name, "unable to create flag");
            e
        })?;
        info!(id = %record.id, flag = name, "created new flag");

        Ok(record)
    }

    pub async fn get_flag(&self, id: &str) -> Result<Record, FlagError> {
        Ok(self.reader.get(id).await?)
    }

    /// Removes the flag; removing a missing flag succeeds.
    pub async fn delete_flag(&self, id: &str) -> Result<(), FlagError> {
        self.writer.delete(id).await.map_err(|e| {
            error!(error = %e, id, "unable to delete flag");
            e
        })?;
        info!(id, "deleted flag");
        Ok(())
    }

    /// Create a new rule block or append the chain to an existing one.
    pub async fn add_rule_chain(&self, id: &str, chain: RuleChain) -> Result<(), FlagError> {
        let _guard = self.locks.lock(id).await;

        let mut record = self.reader.get(id).await.map_err(|e| {
            warn!(error = %e, id, "unable to find flag");
            e
        })?;

        let mut blocks = record.rule_blocks.take().unwrap_or_default();
        let key = process_new_rule_chain(&mut blocks, chain).map_err(|e| {
            warn!(error = %e, id, "unable to process new rule chain");
            e
        })?;

        let value = serde_json::to_value(&blocks).map_err(|e| FlagError::Store(e.into()))?;
        self.writer
            .update_fields(id, &[Update::new("ruleBlocks", value)])
            .await
            .map_err(|e| {
                error!(error = %e, id, "unable to update flag with new rule chain");
                e
            })?;
        info!(id, block = %key, "added rule chain");

        Ok(())
    }

    /// Persist a new default value. A set default overrides every rule.
    pub async fn set_default_flag_value(&self, id: &str, default_value: bool) -> Result<(), FlagError> {
        let _guard = self.locks.lock(id).await;

        self.writer
            .update_fields(id, &[Update::new("defaultValue", Value::Bool(default_value))])
            .await
            .map_err(|e| {
                error!(error = %e, id, "unable to update record");
                e
            })?;
        info!(id, default_value, "updated flag default value");

        Ok(())
    }

    /// Whether the flag is on for the given caller tags.
    pub async fn check_flag_rule(&self, id: &str, tags: &[Tag]) -> Result<bool, FlagError> {
        Ok(self.evaluate_flag_rule(id, tags).await?.enabled)
    }

    /// Like [`Self::check_flag_rule`], with the reason for the outcome.
    pub async fn evaluate_flag_rule(&self, id: &str, tags: &[Tag]) -> Result<FlagEvaluation, FlagError> {
        let record = self.reader.get(id).await.map_err(|e| {
            warn!(error = %e, id, "unable to get flag record");
            e
        })?;

        evaluate_flag(&record, tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{ChainOp, Rule, RuleOp};
    use crate::store::memory::MemoryStore;
    use crate::store::StoreError;
    use async_trait::async_trait;

    fn service() -> (Arc<MemoryStore>, FlagService) {
        let store = Arc::new(MemoryStore::new());
        let service = FlagService::builder()
            .reader(store.clone())
            .writer(store.clone())
            .build()
            .unwrap();
        (store, service)
    }

    fn env_dev() -> RuleChain {
        RuleChain::single(Rule::new("env", RuleOp::Equals, "dev"))
    }

    struct FailingReader;

    #[async_trait]
    impl FlagReader for FailingReader {
        async fn get(&self, _id: &str) -> Result<Record, StoreError> {
            Err(StoreError::Backend {
                code: 1080,
                message: "timeout".to_string(),
            })
        }
    }

    #[test]
    fn test_builder_reports_every_missing_dependency() {
        match FlagService::builder().build() {
            Err(FlagError::MissingDependencies(missing)) => {
                assert_eq!(missing, vec!["flags reader", "flags writer"])
            }
            _ => panic!("expected missing dependencies"),
        }

        let store = Arc::new(MemoryStore::new());
        match FlagService::builder().reader(store).build() {
            Err(FlagError::MissingDependencies(missing)) => assert_eq!(missing, vec!["flags writer"]),
            _ => panic!("expected missing writer"),
        }
    }

    #[tokio::test]
    async fn test_new_flag() {
        let (store, service) = service();
        let record = service.new_flag("ff", false).await.unwrap();
        assert!(Uuid::parse_str(&record.id).is_ok());
        assert!(record.rule_blocks.is_none());
        assert_eq!(store.get(&record.id).await.unwrap(), record);

        let other = service.new_flag("ff", false).await.unwrap();
        assert_ne!(record.id, other.id);
    }

    #[tokio::test]
    async fn test_add_rule_chain_persists_blocks() {
        let (_, service) = service();
        let record = service.new_flag("ff", false).await.unwrap();

        service.add_rule_chain(&record.id, env_dev()).await.unwrap();
        service
            .add_rule_chain(
                &record.id,
                RuleChain::pair(
                    Rule::new("org", RuleOp::StartsWith, "internal"),
                    ChainOp::And,
                    Rule::new("env", RuleOp::Equals, "dev"),
                ),
            )
            .await
            .unwrap();

        let stored = service.get_flag(&record.id).await.unwrap();
        let blocks = stored.rule_blocks.unwrap();
        assert_eq!(blocks.keys().collect::<Vec<_>>(), vec!["env", "env+org"]);
    }

    #[tokio::test]
    async fn test_add_duplicate_rule_chain() {
        let (_, service) = service();
        let record = service.new_flag("ff", false).await.unwrap();

        service.add_rule_chain(&record.id, env_dev()).await.unwrap();
        assert!(matches!(
            service.add_rule_chain(&record.id, env_dev()).await,
            Err(FlagError::DuplicateChain(_))
        ));
    }

    #[tokio::test]
    async fn test_add_rule_chain_to_missing_flag() {
        let (_, service) = service();
        assert!(matches!(
            service.add_rule_chain("missing", env_dev()).await,
            Err(FlagError::NotFound(id)) if id == "missing"
        ));
    }

    #[tokio::test]
    async fn test_add_invalid_rule_chain() {
        let (_, service) = service();
        let record = service.new_flag("ff", false).await.unwrap();
        let chain = RuleChain {
            primary: Rule::new("test", RuleOp::Equals, "value"),
            secondary: Some(Rule::new("tag2", RuleOp::Equals, "value2")),
            chain_op: None,
        };
        assert!(matches!(
            service.add_rule_chain(&record.id, chain).await,
            Err(FlagError::Validation(_))
        ));
        assert!(service.get_flag(&record.id).await.unwrap().rule_blocks.is_none());
    }

    #[tokio::test]
    async fn test_set_default_flag_value() {
        let (_, service) = service();
        let record = service.new_flag("ff", true).await.unwrap();

        service.set_default_flag_value(&record.id, false).await.unwrap();
        assert!(!service.get_flag(&record.id).await.unwrap().default_value);
    }

    #[tokio::test]
    async fn test_check_flag_rule() {
        let (_, service) = service();
        let record = service.new_flag("ff", false).await.unwrap();
        let env = |v: &str| vec![Tag::new("env", v)];

        // no rule blocks yet
        assert!(!service.check_flag_rule(&record.id, &env("dev")).await.unwrap());

        service.add_rule_chain(&record.id, env_dev()).await.unwrap();
        assert!(service.check_flag_rule(&record.id, &env("dev")).await.unwrap());
        assert!(!service.check_flag_rule(&record.id, &env("prod")).await.unwrap());

        service.set_default_flag_value(&record.id, true).await.unwrap();
        assert!(service.check_flag_rule(&record.id, &env("prod")).await.unwrap());
    }

    #[tokio::test]
    async fn test_check_flag_rule_with_too_many_tags() {
        let (_, service) = service();
        let record = service.new_flag("ff", false).await.unwrap();
        let tags = vec![Tag::new("a", "1"), Tag::new("b", "2"), Tag::new("c", "3")];
        assert!(matches!(
            service.check_flag_rule(&record.id, &tags).await,
            Err(FlagError::Validation(_))
        ));

        service.set_default_flag_value(&record.id, true).await.unwrap();
        assert!(service.check_flag_rule(&record.id, &tags).await.unwrap());
    }

    #[tokio::test]
    async fn test_reader_failures_are_not_downgraded() {
        let store = Arc::new(MemoryStore::new());
        let service = FlagService::builder()
            .reader(Arc::new(FailingReader))
            .writer(store)
            .build()
            .unwrap();

        assert!(matches!(
            service.check_flag_rule("id", &[Tag::new("env", "dev")]).await,
            Err(FlagError::Store(StoreError::Backend { code: 1080, .. }))
        ));
    }

    #[tokio::test]
    async fn test_delete_flag_is_idempotent() {
        let (_, service) = service();
        let record = service.new_flag("ff", false).await.unwrap();

        service.delete_flag(&record.id).await.unwrap();
        service.delete_flag(&record.id).await.unwrap();
        assert!(matches!(
            service.get_flag(&record.id).await,
            Err(FlagError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_rule_chain_appends_are_not_lost() {
        let store = Arc::new(MemoryStore::new());
        let service = Arc::new(FlagService::with_store(store));
        let record = service.new_flag("ff", false).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let service = service.clone();
            let id = record.id.clone();
            handles.push(tokio::spawn(async move {
                let chain = RuleChain::single(Rule::new("env", RuleOp::Equals, format!("env-{}", i)));
                service.add_rule_chain(&id, chain).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let blocks = service.get_flag(&record.id).await.unwrap().rule_blocks.unwrap();
        assert_eq!(blocks.get("env").map(|c| c.len()), Some(8));
        assert!(service.locks.locks.is_empty());
    }

    #[tokio::test]
    async fn test_flag_lock_is_released_and_pruned() {
        let locks = FlagLocks::default();

        let guard = locks.lock("a").await;
        let waiter = locks.locks.get("a").map(|l| l.value().clone()).unwrap();
        assert!(waiter.try_lock().is_err());
        drop(waiter);
        drop(guard);
        assert!(locks.locks.get("a").is_none());

        let first = locks.lock("a").await;
        let second = locks.lock("b").await;
        assert_eq!(locks.locks.len(), 2);
        drop(first);
        drop(second);
        assert!(locks.locks.is_empty());
    }
}
