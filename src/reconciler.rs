//! 文件系统与元数据对账模块
//!
//! 双向自愈：
//! - 孤儿文件（磁盘上有、元数据里没有）：尽力从目录回填元数据，
//!   离线时合成占位元数据，然后标记为已下载
//! - 脏记录（元数据标记已下载、磁盘上文件不存在）：清除下载标记
//!
//! 对账以固定批次处理文件，批间协作式让出，避免长时间独占执行器。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::catalog::CatalogClient;
use crate::estimator::MetadataEstimator;
use crate::storage::StorageLayout;
use crate::store::{MediaKind, TalkRecord, TalkStore};

/// 每批处理的文件数
const RECONCILE_BATCH_SIZE: usize = 10;

/// 对账结果摘要
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// 被收养的孤儿文件数（新建或更新为已下载）
    pub orphans_adopted: usize,
    /// 被清除的脏记录数
    pub stale_cleared: usize,
}

/// 文件系统对账器
pub struct Reconciler {
    store: Arc<TalkStore>,
    layout: StorageLayout,
    catalog: Arc<dyn CatalogClient>,
    estimator: Arc<dyn MetadataEstimator>,
}

impl Reconciler {
    pub fn new(
        store: Arc<TalkStore>,
        layout: StorageLayout,
        catalog: Arc<dyn CatalogClient>,
        estimator: Arc<dyn MetadataEstimator>,
    ) -> Self {
        Self {
            store,
            layout,
            catalog,
            estimator,
        }
    }

    /// 执行一轮完整对账
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let files = self.collect_media_files();
        debug!("对账扫描到 {} 个媒体文件", files.len());

        for batch in files.chunks(RECONCILE_BATCH_SIZE) {
            for (path, kind) in batch {
                if self.adopt_orphan(path, *kind).await? {
                    report.orphans_adopted += 1;
                }
            }
            // 批间让出，避免饿死并发的下载操作和缓存读取
            tokio::task::yield_now().await;
        }

        report.stale_cleared = self.clear_stale_records()?;

        if report.orphans_adopted > 0 || report.stale_cleared > 0 {
            info!(
                "对账完成: 收养孤儿文件 {} 个，清除脏记录 {} 条",
                report.orphans_adopted, report.stale_cleared
            );
        }

        Ok(report)
    }

    /// 枚举两个存储根目录下的媒体文件
    fn collect_media_files(&self) -> Vec<(PathBuf, MediaKind)> {
        let mut files = Vec::new();

        for (root, kind) in self.layout.media_roots() {
            if !root.exists() {
                continue;
            }

            for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.into_path();
                // 只认本类型的扩展名，其他文件不属于本子系统
                let matches = path
                    .extension()
                    .map(|ext| ext == kind.extension())
                    .unwrap_or(false);
                if matches {
                    files.push((path, kind));
                }
            }
        }

        files
    }

    /// 处理单个文件：已有匹配记录则跳过，否则收养为已下载条目
    ///
    /// 返回是否发生了收养
    async fn adopt_orphan(&self, path: &PathBuf, kind: MediaKind) -> Result<bool> {
        let Some(item_id) = path.file_stem().and_then(|s| s.to_str()) else {
            warn!("无法从文件名解析条目 ID，跳过: {:?}", path);
            return Ok(false);
        };

        let existing = self.store.get_talk(item_id)?;

        // 记录存在、已下载且路径一致 -> 无需处理
        if let Some(record) = &existing {
            if record.is_downloaded && record.local_path.as_deref() == Some(path.as_path()) {
                return Ok(false);
            }
        }

        let file_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

        // 已有记录只翻下载位，原有元数据保留；
        // 全新条目尽力从目录回填，离线失败时降级为占位元数据
        let mut record = match existing {
            Some(record) => record,
            None => match self.catalog.fetch_item_metadata(item_id).await {
                Ok(item) => {
                    debug!("孤儿文件元数据回填成功: {}", item_id);
                    TalkRecord::from_item(&item)
                }
                Err(e) => {
                    debug!("目录查询失败，使用占位元数据: {}: {:#}", item_id, e);
                    let placeholder = self.estimator.estimate(item_id, kind, file_size);
                    TalkRecord::placeholder(
                        item_id.to_string(),
                        placeholder.title,
                        placeholder.speaker,
                        placeholder.duration_secs,
                    )
                }
            },
        };

        record.is_downloaded = true;
        record.local_path = Some(path.clone());
        record.file_size_bytes = file_size;
        self.store.upsert_talk(&record)?;

        info!("已收养孤儿文件: {} -> {:?}", item_id, path);
        Ok(true)
    }

    /// 清除文件已丢失的已下载记录
    fn clear_stale_records(&self) -> Result<usize> {
        let mut cleared = 0;

        for record in self.store.downloaded_talks()? {
            let exists = record
                .local_path
                .as_ref()
                .map(|p| p.exists())
                .unwrap_or(false);

            if !exists {
                warn!(
                    "已下载记录的本地文件不存在，清除标记: {} ({:?})",
                    record.id, record.local_path
                );
                self.store.clear_downloaded(&record.id)?;
                cleared += 1;
            }
        }

        Ok(cleared)
    }
}
