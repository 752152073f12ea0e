//! 已下载列表读缓存
//!
//! 由元数据读取 + 一轮对账联合构建的派生投影，时间窗 + 显式失效双重控制：
//! - TTL 内且未失效：直接返回缓存数据，不触碰存储
//! - 过期或被失效：先跑一轮对账再重查存储重建
//!
//! 读取不持有编排器的锁，属于最终一致（由 TTL 和失效事件约束时滞）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::Mutex;
use tracing::debug;

use crate::reconciler::Reconciler;
use crate::store::{TalkRecord, TalkStore};

/// 缓存的列表快照
struct CachedListing {
    records: Vec<TalkRecord>,
    built_at: Instant,
    valid: bool,
    /// 失效代次；重建窗口期间的 invalidate 会让本轮重建结果不被标记有效
    generation: u64,
}

/// 已下载列表缓存
pub struct ListingCache {
    ttl: Duration,
    inner: Mutex<CachedListing>,
}

impl ListingCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(CachedListing {
                records: Vec::new(),
                built_at: Instant::now(),
                valid: false,
                generation: 0,
            }),
        }
    }

    /// 标记缓存失效（任何完成/删除等变更事件后调用）
    pub fn invalidate(&self) {
        let mut guard = self.inner.lock();
        guard.valid = false;
        guard.generation += 1;
        debug!("已下载列表缓存已失效");
    }

    /// 读取已下载列表，必要时重建
    pub async fn get(
        &self,
        reconciler: &Reconciler,
        store: &Arc<TalkStore>,
    ) -> Result<Vec<TalkRecord>> {
        let generation = {
            let guard = self.inner.lock();
            if guard.valid && guard.built_at.elapsed() < self.ttl {
                debug!("缓存命中: {} 条记录", guard.records.len());
                return Ok(guard.records.clone());
            }
            guard.generation
        };

        // 重建前先对账，保证投影与磁盘一致
        reconciler.reconcile().await?;
        let records = store.downloaded_talks()?;

        let mut guard = self.inner.lock();
        guard.records = records.clone();
        guard.built_at = Instant::now();
        // 重建窗口内发生过 invalidate 时快照可能已过时，保持无效，
        // 下一次读取重新构建
        if guard.generation == generation {
            guard.valid = true;
            debug!("缓存已重建: {} 条记录", records.len());
        } else {
            debug!("重建期间缓存再次失效，快照不标记有效");
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogClient, TalkItem};
    use crate::estimator::BitrateEstimator;
    use crate::storage::StorageLayout;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct OfflineCatalog;

    #[async_trait]
    impl CatalogClient for OfflineCatalog {
        async fn fetch_item_metadata(&self, _id: &str) -> Result<TalkItem> {
            anyhow::bail!("offline")
        }
    }

    fn setup() -> (TempDir, Arc<TalkStore>, Reconciler) {
        let temp_dir = TempDir::new().unwrap();
        let layout = StorageLayout::from_root(temp_dir.path());
        layout.ensure_dirs().unwrap();

        let store = Arc::new(TalkStore::in_memory().unwrap());
        let reconciler = Reconciler::new(
            store.clone(),
            layout,
            Arc::new(OfflineCatalog),
            Arc::new(BitrateEstimator::default()),
        );

        (temp_dir, store, reconciler)
    }

    fn insert_downloaded(store: &TalkStore, temp_dir: &TempDir, id: &str) {
        let path = temp_dir.path().join("audio").join(format!("{}.mp3", id));
        std::fs::write(&path, vec![0u8; 1500]).unwrap();

        let mut record = crate::store::TalkRecord::placeholder(
            id.to_string(),
            id.to_string(),
            "S".to_string(),
            60,
        );
        record.is_downloaded = true;
        record.local_path = Some(path);
        store.upsert_talk(&record).unwrap();
    }

    #[tokio::test]
    async fn test_cache_hit_within_ttl() {
        let (temp_dir, store, reconciler) = setup();
        let cache = ListingCache::new(Duration::from_secs(300));

        insert_downloaded(&store, &temp_dir, "a");
        let first = cache.get(&reconciler, &store).await.unwrap();
        assert_eq!(first.len(), 1);

        // 绕过缓存直接写存储；TTL 内未失效的读取仍返回旧快照
        insert_downloaded(&store, &temp_dir, "b");
        let second = cache.get(&reconciler, &store).await.unwrap();
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn test_invalidation_forces_rebuild() {
        let (temp_dir, store, reconciler) = setup();
        let cache = ListingCache::new(Duration::from_secs(300));

        insert_downloaded(&store, &temp_dir, "a");
        assert_eq!(cache.get(&reconciler, &store).await.unwrap().len(), 1);

        insert_downloaded(&store, &temp_dir, "b");
        cache.invalidate();

        // TTL 尚未过期，但失效标记强制重建
        let rebuilt = cache.get(&reconciler, &store).await.unwrap();
        assert_eq!(rebuilt.len(), 2);
    }

    #[tokio::test]
    async fn test_ttl_expiry_rebuilds() {
        let (temp_dir, store, reconciler) = setup();
        let cache = ListingCache::new(Duration::from_millis(0));

        insert_downloaded(&store, &temp_dir, "a");
        assert_eq!(cache.get(&reconciler, &store).await.unwrap().len(), 1);

        insert_downloaded(&store, &temp_dir, "b");
        // TTL 为 0：每次读取都重建
        assert_eq!(cache.get(&reconciler, &store).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rebuild_runs_reconciliation() {
        let (temp_dir, store, reconciler) = setup();
        let cache = ListingCache::new(Duration::from_secs(300));

        // 孤儿文件直接落盘，未写元数据
        std::fs::write(
            temp_dir.path().join("audio").join("orphan.mp3"),
            vec![0u8; 1500],
        )
        .unwrap();

        // 重建路径先对账，孤儿文件被收养后出现在列表中
        let records = cache.get(&reconciler, &store).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "orphan");
    }

    /// 在对账访问目录服务时触发失效，模拟重建窗口内的并发变更
    struct InvalidatingCatalog {
        cache: Arc<ListingCache>,
    }

    #[async_trait]
    impl CatalogClient for InvalidatingCatalog {
        async fn fetch_item_metadata(&self, _id: &str) -> Result<TalkItem> {
            self.cache.invalidate();
            anyhow::bail!("offline")
        }
    }

    #[tokio::test]
    async fn test_invalidation_during_rebuild_is_not_lost() {
        let temp_dir = TempDir::new().unwrap();
        let layout = StorageLayout::from_root(temp_dir.path());
        layout.ensure_dirs().unwrap();

        let store = Arc::new(TalkStore::in_memory().unwrap());
        let cache = Arc::new(ListingCache::new(Duration::from_secs(300)));
        let reconciler = Reconciler::new(
            store.clone(),
            layout,
            Arc::new(InvalidatingCatalog {
                cache: cache.clone(),
            }),
            Arc::new(BitrateEstimator::default()),
        );

        // 孤儿文件迫使重建路径调用目录服务，失效发生在重建窗口内
        std::fs::write(
            temp_dir.path().join("audio").join("orphan.mp3"),
            vec![0u8; 1500],
        )
        .unwrap();

        assert_eq!(cache.get(&reconciler, &store).await.unwrap().len(), 1);

        // 重建期间的失效不能被 valid=true 覆盖：
        // TTL 内的下一次读取必须重查存储，看到之后写入的记录
        insert_downloaded(&store, &temp_dir, "late");
        let records = cache.get(&reconciler, &store).await.unwrap();
        assert_eq!(records.len(), 2);
    }
}
