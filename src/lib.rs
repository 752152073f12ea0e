//! TalkVault - 讲座音视频离线下载子系统
//!
//! 为播放端提供可离线使用的讲座媒体库：
//! - 可暂停/恢复/取消的后台下载（HTTP 流式传输 + 不透明续传令牌）
//! - SQLite 元数据存储，跨重启恢复未完成任务
//! - 文件系统与元数据的双向对账自愈
//! - TTL + 显式失效的已下载列表缓存
//! - 存储占用统计与过期下载清理

pub mod cache;
pub mod catalog;
pub mod config;
pub mod downloader;
pub mod error;
pub mod estimator;
pub mod logging;
pub mod reconciler;
pub mod storage;
pub mod store;

pub use cache::ListingCache;
pub use catalog::{CatalogClient, HttpCatalogClient, TalkItem};
pub use config::AppConfig;
pub use downloader::{
    DownloadEvent, DownloadManager, DownloadTask, HttpTransferEngine, TaskStatus, TransferEngine,
};
pub use error::DownloadError;
pub use estimator::{BitrateEstimator, MetadataEstimator, PlaceholderMetadata};
pub use reconciler::{ReconcileReport, Reconciler};
pub use storage::{StorageAccountant, StorageLayout};
pub use store::{MediaKind, TalkRecord, TalkStore};
