//! 下载编排器
//!
//! 持有活动任务集与状态机，对外提供 start/pause/resume/cancel/delete 操作，
//! 消费传输引擎的异步事件并据此更新元数据存储、驱动读缓存失效。
//!
//! ## 并发模型
//!
//! - 活动任务集：`RwLock<HashMap<item_id, Arc<Mutex<DownloadTask>>>>`，
//!   单个任务的状态变更通过其自身的 Mutex 线性化
//! - 引擎事件由每任务一个的消费循环送入 `apply_event`；应用任何事件前
//!   先校验活动集成员资格，过期事件（例如并发取消后迟到的完成）直接丢弃
//! - start/resume 的每个 await 间隙后都重新确认活动位仍由本次调用的任务
//!   占用（`Arc::ptr_eq`），任务行的持久化与成员校验在同一把锁内完成，
//!   并发取消不会被启动流程覆盖
//! - 所有操作只做本地状态与校验工作后立即返回，不会阻塞到传输结束

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::cache::ListingCache;
use crate::catalog::{CatalogClient, TalkItem};
use crate::config::{AppConfig, DownloadConfig};
use crate::downloader::engine::{ResumeToken, TransferEngine, TransferEvent};
use crate::downloader::events::DownloadEvent;
use crate::downloader::task::{DownloadTask, TaskStatus};
use crate::error::DownloadError;
use crate::estimator::{BitrateEstimator, MetadataEstimator};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::storage::{StorageAccountant, StorageLayout};
use crate::store::{MediaKind, TalkRecord, TalkStore};

/// 事件广播通道容量
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 下载管理器
pub struct DownloadManager {
    /// 活动任务集（item_id -> 任务；终态任务立即移除，暂停任务保留）
    tasks: Arc<RwLock<HashMap<String, Arc<Mutex<DownloadTask>>>>>,
    /// 活动传输句柄（item_id -> handle_id；暂停后移除）
    engine_handles: Arc<RwLock<HashMap<String, String>>>,
    /// 传输引擎
    engine: Arc<dyn TransferEngine>,
    /// 元数据存储
    store: Arc<TalkStore>,
    /// 存储布局
    layout: StorageLayout,
    /// 占位元数据估算器
    estimator: Arc<dyn MetadataEstimator>,
    /// 文件系统对账器
    reconciler: Reconciler,
    /// 已下载列表缓存
    cache: ListingCache,
    /// 存储空间统计
    accountant: StorageAccountant,
    /// 事件广播发送端
    event_tx: broadcast::Sender<DownloadEvent>,
    /// 下载配置
    config: DownloadConfig,
}

impl DownloadManager {
    /// 创建下载管理器
    ///
    /// 显式构造并注入依赖，生命周期由调用方控制（`shutdown` 结束）
    pub fn new(
        config: &AppConfig,
        store: Arc<TalkStore>,
        engine: Arc<dyn TransferEngine>,
        catalog: Arc<dyn CatalogClient>,
    ) -> Result<Arc<Self>> {
        let layout = StorageLayout::from_root(&config.storage.root);
        layout.ensure_dirs()?;

        let estimator: Arc<dyn MetadataEstimator> = Arc::new(BitrateEstimator::default());
        let reconciler = Reconciler::new(
            store.clone(),
            layout.clone(),
            catalog,
            estimator.clone(),
        );
        let cache = ListingCache::new(Duration::from_secs(config.cache.ttl_secs));
        let accountant = StorageAccountant::new(layout.clone());
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!("创建下载管理器: 存储根目录={:?}", config.storage.root);

        Ok(Arc::new(Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            engine_handles: Arc::new(RwLock::new(HashMap::new())),
            engine,
            store,
            layout,
            estimator,
            reconciler,
            cache,
            accountant,
            event_tx,
            config: config.download.clone(),
        }))
    }

    /// 订阅下载事件
    pub fn subscribe_events(&self) -> broadcast::Receiver<DownloadEvent> {
        self.event_tx.subscribe()
    }

    /// 发布下载事件（无订阅者时静默丢弃）
    fn emit(&self, event: DownloadEvent) {
        let _ = self.event_tx.send(event);
    }

    fn store_err(e: anyhow::Error) -> DownloadError {
        DownloadError::Store(format!("{:#}", e))
    }

    // ========================================================================
    // 公开操作
    // ========================================================================

    /// 开始下载
    ///
    /// 幂等保证：条目已下载完成或已有活动任务时为 no-op（返回 Ok）。
    /// 前置校验（URL、可达性）失败时同步返回错误，不会留下任务。
    pub async fn start_download(
        self: &Arc<Self>,
        item: &TalkItem,
        kind: MediaKind,
    ) -> Result<(), DownloadError> {
        // 已完成的条目不重复下载
        if self.is_downloaded(&item.id).await? {
            info!("条目已下载，跳过: {}", item.id);
            return Ok(());
        }

        let url = item
            .media_url(kind)
            .ok_or_else(|| DownloadError::NoDownloadableContent(item.id.clone()))?
            .to_string();

        let parsed: reqwest::Url = url
            .parse()
            .map_err(|_| DownloadError::InvalidUrl(url.clone()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::InvalidUrl(url));
        }

        // 预留活动位：并发的重复 start 在这里被挡掉（至多一个活动任务）
        let task = {
            let mut tasks = self.tasks.write().await;
            if tasks.contains_key(&item.id) {
                info!("条目已有活动任务，跳过: {}", item.id);
                return Ok(());
            }
            let task = Arc::new(Mutex::new(DownloadTask::new(
                item.id.clone(),
                url.clone(),
                kind,
                0,
            )));
            tasks.insert(item.id.clone(), task.clone());
            task
        };

        // 确保讲座记录存在
        if let Err(e) = self.ensure_talk_record(item) {
            self.release_reservation(&item.id, &task).await;
            return Err(Self::store_err(e));
        }

        // 可达性预检：失败则撤销预留，调用方看到错误而不是一个 Failed 任务
        let preflight = timeout(
            Duration::from_secs(self.config.preflight_timeout_secs),
            self.engine.preflight(&url),
        )
        .await;

        let total_bytes = match preflight {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                self.release_reservation(&item.id, &task).await;
                return Err(DownloadError::NetworkError(format!("{:#}", e)));
            }
            Err(_) => {
                self.release_reservation(&item.id, &task).await;
                return Err(DownloadError::NetworkError(format!(
                    "可达性检查超时: {}",
                    url
                )));
            }
        };

        {
            let mut t = task.lock().await;
            t.total_bytes = total_bytes;
        }

        // 预检是无锁等待点，期间任务可能已被并发取消；
        // 任务行只在预留仍然有效时落盘，取消后不得复活
        match self.persist_if_active(&item.id, &task).await {
            Ok(true) => {}
            Ok(false) => {
                info!("任务在预检期间被取消，放弃启动: {}", item.id);
                return Ok(());
            }
            Err(e) => {
                self.release_reservation(&item.id, &task).await;
                return Err(e);
            }
        }

        let handle = match self.engine.begin(&url).await {
            Ok(h) => h,
            Err(e) => {
                // 预留已易主时任务行也属于新任务，不能删
                if self.release_reservation(&item.id, &task).await {
                    let _ = self.store.delete_task(&item.id);
                }
                return Err(DownloadError::NetworkError(format!("{:#}", e)));
            }
        };

        if !self.register_handle_if_active(&item.id, &task, &handle.id).await {
            // 启动传输期间被取消：立刻停掉新传输并丢弃续传数据
            if let Some(token) = self.engine.stop(&handle.id).await {
                if let Some(decoded) = ResumeToken::decode(&token) {
                    let _ = std::fs::remove_file(&decoded.temp_path);
                }
            }
            info!("任务在启动传输期间被取消: {}", item.id);
            return Ok(());
        }

        let task_id = {
            let mut t = task.lock().await;
            t.mark_downloading();
            t.id.clone()
        };
        match self.persist_if_active(&item.id, &task).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("任务在登记句柄后被取消: {}", item.id);
                return Ok(());
            }
            Err(e) => warn!("持久化任务状态失败: {}: {}", item.id, e),
        }

        info!(
            "下载任务已启动: item={}, task={}, url={}, 总大小={}",
            item.id, task_id, url, total_bytes
        );

        self.emit(DownloadEvent::Started {
            item_id: item.id.clone(),
            task_id,
            total_bytes,
        });

        self.spawn_event_loop(item.id.clone(), handle.events);

        Ok(())
    }

    /// 暂停下载
    ///
    /// 任务离开引擎的活动工作集但保留在编排器的跟踪集中；
    /// 引擎尽力产生续传令牌并持久化
    pub async fn pause_download(&self, item_id: &str) -> Result<(), DownloadError> {
        let task = self
            .tasks
            .read()
            .await
            .get(item_id)
            .cloned()
            .ok_or_else(|| DownloadError::TaskNotFound(item_id.to_string()))?;

        {
            let t = task.lock().await;
            if t.status != TaskStatus::Downloading {
                return Err(DownloadError::TaskNotFound(item_id.to_string()));
            }
        }

        let handle_id = self.engine_handles.write().await.remove(item_id);
        let token = match handle_id {
            Some(h) => self.engine.stop(&h).await,
            None => None,
        };

        {
            let mut t = task.lock().await;
            // stop 期间完成/失败/取消可能抢先终结任务，此时不再回写
            if t.status != TaskStatus::Downloading {
                return Err(DownloadError::TaskNotFound(item_id.to_string()));
            }
            if token.is_some() {
                t.resume_token = token;
            }
            t.mark_paused();
        }

        if !self.persist_if_active(item_id, &task).await? {
            return Err(DownloadError::TaskNotFound(item_id.to_string()));
        }

        info!("下载已暂停: {}", item_id);
        Ok(())
    }

    /// 恢复下载
    ///
    /// 有续传令牌时续传，令牌失效或缺失时从头开始
    pub async fn resume_download(self: &Arc<Self>, item_id: &str) -> Result<(), DownloadError> {
        let task = self
            .tasks
            .read()
            .await
            .get(item_id)
            .cloned()
            .ok_or_else(|| DownloadError::TaskNotFound(item_id.to_string()))?;

        let (token, url) = {
            let mut t = task.lock().await;
            if t.status != TaskStatus::Paused {
                return Err(DownloadError::TaskNotFound(item_id.to_string()));
            }
            // 状态检查与占位在同一把锁内完成：并发的第二个 resume 在这里被挡掉，
            // 同一条目不会出现两路并行传输
            t.mark_downloading();
            (t.resume_token.clone(), t.source_url.clone())
        };

        let begun = match token {
            Some(tok) => match self.engine.begin_with_resume_token(&tok).await {
                Ok(h) => Ok(h),
                Err(e) => {
                    warn!("续传令牌不可用，改为全新下载: {}: {:#}", item_id, e);
                    self.engine.begin(&url).await
                }
            },
            None => self.engine.begin(&url).await,
        };

        let handle = match begun {
            Ok(h) => h,
            Err(e) => {
                // 启动失败回退为暂停态，任务保留
                task.lock().await.mark_paused();
                return Err(DownloadError::NetworkError(format!("{:#}", e)));
            }
        };

        if !self.register_handle_if_active(item_id, &task, &handle.id).await {
            // 恢复期间被取消：停掉新传输并丢弃续传数据
            if let Some(token) = self.engine.stop(&handle.id).await {
                if let Some(decoded) = ResumeToken::decode(&token) {
                    let _ = std::fs::remove_file(&decoded.temp_path);
                }
            }
            info!("任务在恢复期间被取消: {}", item_id);
            return Ok(());
        }

        match self.persist_if_active(item_id, &task).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("任务在登记句柄后被取消: {}", item_id);
                return Ok(());
            }
            Err(e) => warn!("持久化任务状态失败: {}: {}", item_id, e),
        }

        info!("下载已恢复: {}", item_id);
        self.spawn_event_loop(item_id.to_string(), handle.events);

        Ok(())
    }

    /// 取消下载（终态，不保留任务）
    ///
    /// 停止引擎（续传数据丢弃）并删除部分下载的临时文件
    pub async fn cancel_download(&self, item_id: &str) -> Result<(), DownloadError> {
        let task = self
            .tasks
            .write()
            .await
            .remove(item_id)
            .ok_or_else(|| DownloadError::TaskNotFound(item_id.to_string()))?;

        let handle_id = self.engine_handles.write().await.remove(item_id);
        let stop_token = match handle_id {
            Some(h) => self.engine.stop(&h).await,
            None => None,
        };

        let paused_token = {
            let mut t = task.lock().await;
            t.mark_cancelled();
            t.resume_token.take()
        };

        // 停止令牌与历史暂停令牌里都可能记录着临时文件路径
        for token in [stop_token, paused_token].into_iter().flatten() {
            if let Some(decoded) = ResumeToken::decode(&token) {
                let _ = std::fs::remove_file(&decoded.temp_path);
            }
        }

        if let Err(e) = self.store.delete_task(item_id) {
            warn!("删除任务行失败: {}: {:#}", item_id, e);
        }

        info!("下载已取消: {}", item_id);
        Ok(())
    }

    /// 删除本地下载
    ///
    /// 有活动任务时先取消，然后删除两种媒体文件、清除下载标记并失效缓存
    pub async fn delete_download(&self, item_id: &str) -> Result<(), DownloadError> {
        if self.tasks.read().await.contains_key(item_id) {
            match self.cancel_download(item_id).await {
                // 与并发取消竞争时任务可能已被移除
                Ok(()) | Err(DownloadError::TaskNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        for kind in [MediaKind::Audio, MediaKind::Video] {
            let path = self.layout.media_path(kind, item_id);
            if path.exists() {
                std::fs::remove_file(&path)?;
                debug!("已删除本地文件: {:?}", path);
            }
        }

        self.store
            .clear_downloaded(item_id)
            .map_err(Self::store_err)?;
        self.cache.invalidate();

        info!("本地下载已删除: {}", item_id);
        self.emit(DownloadEvent::Deleted {
            item_id: item_id.to_string(),
        });

        Ok(())
    }

    /// 条目是否已下载（存储确认：标记与路径都有效）
    pub async fn is_downloaded(&self, item_id: &str) -> Result<bool, DownloadError> {
        let record = self.store.get_talk(item_id).map_err(Self::store_err)?;
        Ok(record
            .map(|r| r.is_downloaded && r.local_path.is_some())
            .unwrap_or(false))
    }

    /// 条目是否已下载（仅查文件系统的快速检查，不保证元数据一致）
    pub fn is_downloaded_on_disk(&self, item_id: &str) -> bool {
        [MediaKind::Audio, MediaKind::Video]
            .iter()
            .any(|kind| self.layout.media_path(*kind, item_id).exists())
    }

    /// 获取已下载讲座列表（缓存支撑，重建时先对账）
    pub async fn downloaded_talks(&self) -> Result<Vec<TalkRecord>, DownloadError> {
        self.cache
            .get(&self.reconciler, &self.store)
            .await
            .map_err(Self::store_err)
    }

    /// 单独执行一轮文件系统对账
    pub async fn reconcile(&self) -> Result<ReconcileReport, DownloadError> {
        self.reconciler.reconcile().await.map_err(Self::store_err)
    }

    /// 统计本地存储占用（字节）
    pub fn total_storage_used(&self) -> u64 {
        self.accountant.used_bytes()
    }

    /// 更新条目的最后访问时间（播放层在访问时调用，影响过期清理）
    pub fn touch_accessed(&self, item_id: &str) {
        if let Err(e) = self.store.touch_last_accessed(item_id) {
            warn!("更新最后访问时间失败: {}: {:#}", item_id, e);
        }
    }

    /// 清理过期下载：删除最后访问早于 `max_age_days` 天前的条目
    ///
    /// 返回清理的条目数
    pub async fn cleanup_expired_downloads(
        &self,
        max_age_days: u32,
    ) -> Result<usize, DownloadError> {
        let cutoff = chrono::Utc::now().timestamp() - max_age_days as i64 * 86_400;
        let expired = self
            .store
            .expired_downloads(cutoff)
            .map_err(Self::store_err)?;

        let mut cleaned = 0;
        for item_id in expired {
            match self.delete_download(&item_id).await {
                Ok(()) => cleaned += 1,
                Err(e) => warn!("清理过期下载失败: {}: {}", item_id, e),
            }
        }

        if cleaned > 0 {
            info!("过期清理完成: 删除 {} 个条目", cleaned);
        }
        Ok(cleaned)
    }

    /// 活动任务快照（含暂停任务）
    pub async fn active_tasks(&self) -> Vec<DownloadTask> {
        let tasks = self.tasks.read().await;
        let mut snapshot = Vec::with_capacity(tasks.len());
        for task in tasks.values() {
            snapshot.push(task.lock().await.clone());
        }
        snapshot
    }

    /// 启动恢复：加载持久化的任务行重建跟踪集
    ///
    /// `Pending`/`Downloading` 的行降级为 `Paused`（崩溃时引擎工作已丢失，
    /// 最坏情况从零续传），由调用方决定何时恢复；终态残留行直接清除
    pub async fn recover_persisted_tasks(&self) -> Result<usize, DownloadError> {
        let rows = self.store.load_active_tasks().map_err(Self::store_err)?;
        let mut recovered = 0;

        for mut task in rows {
            if task.status.is_terminal() {
                let _ = self.store.delete_task(&task.item_id);
                continue;
            }

            if task.status != TaskStatus::Paused {
                task.mark_paused();
                self.store.save_task(&task).map_err(Self::store_err)?;
            }

            let item_id = task.item_id.clone();
            self.tasks
                .write()
                .await
                .insert(item_id, Arc::new(Mutex::new(task)));
            recovered += 1;
        }

        if recovered > 0 {
            info!("启动恢复: 重建 {} 个任务（均为暂停态）", recovered);
        }
        Ok(recovered)
    }

    /// 关闭：暂停所有在途传输并持久化续传令牌
    pub async fn shutdown(&self) {
        let item_ids: Vec<String> = self.tasks.read().await.keys().cloned().collect();

        for item_id in item_ids {
            match self.pause_download(&item_id).await {
                Ok(()) => {}
                // 非下载中的任务（等待/已暂停）无需处理
                Err(DownloadError::TaskNotFound(_)) => {}
                Err(e) => warn!("关闭时暂停任务失败: {}: {}", item_id, e),
            }
        }

        info!("下载管理器已关闭");
    }

    // ========================================================================
    // 并发一致性辅助
    // ========================================================================

    /// 活动位仍由该任务占用时持久化任务行
    ///
    /// 成员校验与写入在同一把读锁内完成（取消需要写锁，期间被排除），
    /// 任务已被移除时拒绝写入，避免幽灵任务行
    async fn persist_if_active(
        &self,
        item_id: &str,
        task: &Arc<Mutex<DownloadTask>>,
    ) -> Result<bool, DownloadError> {
        let tasks = self.tasks.read().await;
        let owned = tasks
            .get(item_id)
            .map(|current| Arc::ptr_eq(current, task))
            .unwrap_or(false);
        if !owned {
            return Ok(false);
        }
        let snapshot = task.lock().await.clone();
        self.store.save_task(&snapshot).map_err(Self::store_err)?;
        Ok(true)
    }

    /// 撤销 start 过程中的预留；预留已被并发取消移除（或已易主）时不动
    async fn release_reservation(&self, item_id: &str, task: &Arc<Mutex<DownloadTask>>) -> bool {
        let mut tasks = self.tasks.write().await;
        match tasks.get(item_id) {
            Some(current) if Arc::ptr_eq(current, task) => {
                tasks.remove(item_id);
                true
            }
            _ => false,
        }
    }

    /// 活动位仍由该任务占用时登记传输句柄
    async fn register_handle_if_active(
        &self,
        item_id: &str,
        task: &Arc<Mutex<DownloadTask>>,
        handle_id: &str,
    ) -> bool {
        let tasks = self.tasks.read().await;
        let owned = tasks
            .get(item_id)
            .map(|current| Arc::ptr_eq(current, task))
            .unwrap_or(false);
        if owned {
            self.engine_handles
                .write()
                .await
                .insert(item_id.to_string(), handle_id.to_string());
        }
        owned
    }

    // ========================================================================
    // 引擎事件处理
    // ========================================================================

    /// 为一次传输启动事件消费循环
    fn spawn_event_loop(
        self: &Arc<Self>,
        item_id: String,
        mut events: mpsc::UnboundedReceiver<TransferEvent>,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                manager.apply_event(&item_id, event).await;
            }
            debug!("传输事件流结束: {}", item_id);
        });
    }

    /// 应用单个引擎事件
    ///
    /// 先校验活动集成员资格：任务已被取消/完成移除时事件作废
    async fn apply_event(&self, item_id: &str, event: TransferEvent) {
        let task = {
            let tasks = self.tasks.read().await;
            tasks.get(item_id).cloned()
        };

        let Some(task) = task else {
            // 迟到的完成事件还带着部分下载的临时文件，丢弃时一并清理
            if let TransferEvent::Completed { temp_path } = &event {
                let _ = std::fs::remove_file(temp_path);
            }
            debug!("丢弃过期传输事件: {}", item_id);
            return;
        };

        match event {
            TransferEvent::Progress {
                bytes_written,
                bytes_expected,
            } => {
                self.on_progress(item_id, &task, bytes_written, bytes_expected)
                    .await;
            }
            TransferEvent::Completed { temp_path } => {
                self.on_completed(item_id, &task, &temp_path).await;
            }
            TransferEvent::Failed { error } => {
                warn!("传输失败: {}: {}", item_id, error);
                self.finish_failed(item_id, &task, error).await;
            }
        }
    }

    async fn on_progress(
        &self,
        item_id: &str,
        task: &Arc<Mutex<DownloadTask>>,
        bytes_written: u64,
        bytes_expected: u64,
    ) {
        let (downloaded, total, progress, persist) = {
            let mut t = task.lock().await;
            t.apply_progress(bytes_written, bytes_expected);
            let percent = t.percent();
            let persist =
                percent >= t.last_persisted_percent.saturating_add(self.config.persist_progress_percent);
            if persist {
                t.last_persisted_percent = percent;
            }
            (t.downloaded_bytes, t.total_bytes, t.progress(), persist)
        };

        // 进度按固定步进落盘，崩溃后最坏从零续传
        if persist {
            if let Err(e) = self.store.update_task_progress(item_id, downloaded, total) {
                warn!("持久化进度失败: {}: {:#}", item_id, e);
            }
        }

        self.emit(DownloadEvent::Progress {
            item_id: item_id.to_string(),
            downloaded_bytes: downloaded,
            total_bytes: total,
            progress,
        });
    }

    /// 处理完成事件
    ///
    /// 临时文件的有效期仅限本回调，移动必须在返回前同步完成
    async fn on_completed(&self, item_id: &str, task: &Arc<Mutex<DownloadTask>>, temp_path: &Path) {
        let (kind, total_bytes) = {
            let t = task.lock().await;
            (t.media_kind, t.total_bytes)
        };

        let final_path = self.layout.media_path(kind, item_id);

        if let Err(e) = move_file(temp_path, &final_path) {
            error!("移动下载文件失败: {:?} -> {:?}: {}", temp_path, final_path, e);
            let _ = std::fs::remove_file(temp_path);
            self.finish_failed(item_id, task, format!("移动文件失败: {}", e))
                .await;
            return;
        }

        let file_size = match validate_file(&final_path, total_bytes, &self.config) {
            Ok(size) => size,
            Err(reason) => {
                warn!("下载文件校验失败: {}: {}", item_id, reason);
                let _ = std::fs::remove_file(&final_path);
                self.finish_failed(item_id, task, reason.to_string()).await;
                return;
            }
        };

        // 时长未知时用估算器补全（非权威值）
        let duration_secs = match self.store.get_talk(item_id) {
            Ok(Some(record)) if record.duration_secs > 0 => record.duration_secs,
            _ => self.estimator.estimate(item_id, kind, file_size).duration_secs,
        };

        if let Err(e) = self
            .store
            .mark_downloaded(item_id, &final_path, file_size, duration_secs)
        {
            error!("更新讲座记录失败: {}: {:#}", item_id, e);
            self.finish_failed(item_id, task, format!("存储错误: {:#}", e))
                .await;
            return;
        }

        {
            let mut t = task.lock().await;
            t.mark_completed();
        }

        // 终态任务不保留
        let _ = self.store.delete_task(item_id);
        self.tasks.write().await.remove(item_id);
        self.engine_handles.write().await.remove(item_id);
        self.cache.invalidate();

        info!(
            "下载完成: {} -> {:?} ({} 字节)",
            item_id, final_path, file_size
        );
        self.emit(DownloadEvent::Completed {
            item_id: item_id.to_string(),
            local_path: final_path.to_string_lossy().to_string(),
            file_size_bytes: file_size,
        });
    }

    /// 任务进入失败终态：移除跟踪、清理任务行、广播 Failed
    async fn finish_failed(&self, item_id: &str, task: &Arc<Mutex<DownloadTask>>, error: String) {
        {
            let mut t = task.lock().await;
            t.mark_failed(error.clone());
        }

        let _ = self.store.delete_task(item_id);
        self.tasks.write().await.remove(item_id);
        self.engine_handles.write().await.remove(item_id);

        self.emit(DownloadEvent::Failed {
            item_id: item_id.to_string(),
            error,
        });
    }

    /// 确保讲座记录存在（不覆盖已有记录）
    fn ensure_talk_record(&self, item: &TalkItem) -> Result<()> {
        if self.store.get_talk(&item.id)?.is_none() {
            self.store.upsert_talk(&TalkRecord::from_item(item))?;
        }
        Ok(())
    }
}

/// 移动文件，跨文件系统时退回复制后删除源文件
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }

    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)?;
            Ok(())
        }
    }
}

/// 校验下载完成的文件
///
/// 通过时返回实际大小，否则返回拒绝原因
fn validate_file(
    path: &Path,
    expected_total: u64,
    config: &DownloadConfig,
) -> Result<u64, DownloadError> {
    let meta = std::fs::metadata(path).map_err(|e| {
        DownloadError::ValidationFailed(format!("文件不存在或不可读: {:?}: {}", path, e))
    })?;
    let size = meta.len();

    if size < config.min_valid_file_bytes {
        return Err(DownloadError::ValidationFailed(format!(
            "文件过小: {} 字节（最小 {} 字节）",
            size, config.min_valid_file_bytes
        )));
    }

    if expected_total > 0 {
        let diff = size.abs_diff(expected_total);
        if diff > config.size_tolerance_bytes {
            return Err(DownloadError::ValidationFailed(format!(
                "文件大小偏差过大: 实际 {} 字节，预期 {} 字节",
                size, expected_total
            )));
        }
    }

    Ok(size)
}
