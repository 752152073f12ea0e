//! 讲座元数据 SQLite 数据库模块
//!
//! 跨重启的唯一事实来源，两张表：
//! - talk_records: 讲座元数据与下载状态
//! - download_tasks: 活动中（含暂停）的传输任务，终态任务会被移除

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::types::{MediaKind, TalkRecord};
use crate::downloader::task::{DownloadTask, TaskStatus};

/// 讲座元数据存储
pub struct TalkStore {
    /// SQLite 连接
    conn: Mutex<Connection>,
}

impl TalkStore {
    /// 打开（或创建）数据库
    pub fn new(db_path: &Path) -> Result<Self> {
        // 确保父目录存在
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };

        store.init_tables()?;
        info!("元数据库已打开: {:?}", db_path);

        Ok(store)
    }

    /// 内存数据库（测试用）
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_tables()?;
        Ok(store)
    }

    /// 初始化数据库表
    fn init_tables(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS talk_records (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                speaker TEXT NOT NULL,
                series TEXT,
                duration_secs INTEGER NOT NULL DEFAULT 0,
                file_size_bytes INTEGER NOT NULL DEFAULT 0,
                local_path TEXT,
                is_downloaded INTEGER NOT NULL DEFAULT 0,
                last_accessed_at INTEGER,
                created_at INTEGER NOT NULL,
                artwork_url TEXT,
                artwork_thumb_url TEXT
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_talk_records_downloaded ON talk_records(is_downloaded)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_talk_records_accessed ON talk_records(is_downloaded, last_accessed_at)",
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS download_tasks (
                id TEXT PRIMARY KEY,
                item_id TEXT NOT NULL UNIQUE,
                source_url TEXT NOT NULL,
                media_kind TEXT NOT NULL,
                status TEXT NOT NULL,
                total_bytes INTEGER NOT NULL DEFAULT 0,
                downloaded_bytes INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                completed_at INTEGER,
                resume_token BLOB,
                error_msg TEXT
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_download_tasks_status ON download_tasks(status)",
            [],
        )?;

        Ok(())
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("获取数据库锁失败: {}", e))
    }

    // ========================================================================
    // talk_records
    // ========================================================================

    /// 插入或更新讲座记录
    pub fn upsert_talk(&self, record: &TalkRecord) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"
            INSERT INTO talk_records (
                id, title, speaker, series, duration_secs, file_size_bytes,
                local_path, is_downloaded, last_accessed_at, created_at,
                artwork_url, artwork_thumb_url
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                speaker = excluded.speaker,
                series = excluded.series,
                duration_secs = excluded.duration_secs,
                file_size_bytes = excluded.file_size_bytes,
                local_path = excluded.local_path,
                is_downloaded = excluded.is_downloaded,
                last_accessed_at = excluded.last_accessed_at,
                artwork_url = excluded.artwork_url,
                artwork_thumb_url = excluded.artwork_thumb_url
            "#,
            params![
                record.id,
                record.title,
                record.speaker,
                record.series,
                record.duration_secs,
                record.file_size_bytes as i64,
                record.local_path.as_ref().map(|p| p.to_string_lossy().to_string()),
                record.is_downloaded as i64,
                record.last_accessed_at,
                record.created_at,
                record.artwork_url,
                record.artwork_thumb_url,
            ],
        )?;

        debug!("已写入讲座记录: {}", record.id);
        Ok(())
    }

    /// 按 ID 查询讲座记录
    pub fn get_talk(&self, id: &str) -> Result<Option<TalkRecord>> {
        let conn = self.lock_conn()?;

        let record = conn
            .query_row(
                "SELECT id, title, speaker, series, duration_secs, file_size_bytes,
                        local_path, is_downloaded, last_accessed_at, created_at,
                        artwork_url, artwork_thumb_url
                 FROM talk_records WHERE id = ?1",
                params![id],
                Self::row_to_talk,
            )
            .optional()?;

        Ok(record)
    }

    /// 查询所有已下载的讲座记录
    pub fn downloaded_talks(&self) -> Result<Vec<TalkRecord>> {
        let conn = self.lock_conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, title, speaker, series, duration_secs, file_size_bytes,
                    local_path, is_downloaded, last_accessed_at, created_at,
                    artwork_url, artwork_thumb_url
             FROM talk_records WHERE is_downloaded = 1 ORDER BY created_at DESC",
        )?;

        let records = stmt
            .query_map([], Self::row_to_talk)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// 标记为已下载并记录本地路径、大小和时长
    pub fn mark_downloaded(
        &self,
        id: &str,
        local_path: &Path,
        file_size_bytes: u64,
        duration_secs: u32,
    ) -> Result<()> {
        let conn = self.lock_conn()?;

        let updated = conn.execute(
            "UPDATE talk_records SET
                is_downloaded = 1,
                local_path = ?2,
                file_size_bytes = ?3,
                duration_secs = ?4,
                last_accessed_at = ?5
             WHERE id = ?1",
            params![
                id,
                local_path.to_string_lossy().to_string(),
                file_size_bytes as i64,
                duration_secs,
                chrono::Utc::now().timestamp(),
            ],
        )?;

        if updated == 0 {
            return Err(anyhow!("讲座记录不存在: {}", id));
        }

        debug!("已标记下载完成: {} -> {:?}", id, local_path);
        Ok(())
    }

    /// 清除下载标记（删除文件或检测到文件丢失时调用）
    pub fn clear_downloaded(&self, id: &str) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            "UPDATE talk_records SET is_downloaded = 0, local_path = NULL WHERE id = ?1",
            params![id],
        )?;

        debug!("已清除下载标记: {}", id);
        Ok(())
    }

    /// 更新最后访问时间
    pub fn touch_last_accessed(&self, id: &str) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            "UPDATE talk_records SET last_accessed_at = ?2 WHERE id = ?1",
            params![id, chrono::Utc::now().timestamp()],
        )?;

        Ok(())
    }

    /// 查询过期的已下载条目 ID（最后访问早于 cutoff）
    pub fn expired_downloads(&self, cutoff_ts: i64) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;

        let mut stmt = conn.prepare(
            "SELECT id FROM talk_records
             WHERE is_downloaded = 1
               AND last_accessed_at IS NOT NULL
               AND last_accessed_at < ?1",
        )?;

        let ids = stmt
            .query_map(params![cutoff_ts], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(ids)
    }

    fn row_to_talk(row: &rusqlite::Row<'_>) -> rusqlite::Result<TalkRecord> {
        Ok(TalkRecord {
            id: row.get(0)?,
            title: row.get(1)?,
            speaker: row.get(2)?,
            series: row.get(3)?,
            duration_secs: row.get(4)?,
            file_size_bytes: row.get::<_, i64>(5)? as u64,
            local_path: row.get::<_, Option<String>>(6)?.map(PathBuf::from),
            is_downloaded: row.get::<_, i64>(7)? != 0,
            last_accessed_at: row.get(8)?,
            created_at: row.get(9)?,
            artwork_url: row.get(10)?,
            artwork_thumb_url: row.get(11)?,
        })
    }

    // ========================================================================
    // download_tasks
    // ========================================================================

    /// 插入或更新任务行（同一条目最多一个任务行）
    pub fn save_task(&self, task: &DownloadTask) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"
            INSERT INTO download_tasks (
                id, item_id, source_url, media_kind, status, total_bytes,
                downloaded_bytes, created_at, started_at, completed_at,
                resume_token, error_msg
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(item_id) DO UPDATE SET
                id = excluded.id,
                source_url = excluded.source_url,
                media_kind = excluded.media_kind,
                status = excluded.status,
                total_bytes = excluded.total_bytes,
                downloaded_bytes = excluded.downloaded_bytes,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                resume_token = excluded.resume_token,
                error_msg = excluded.error_msg
            "#,
            params![
                task.id,
                task.item_id,
                task.source_url,
                task.media_kind.as_str(),
                task.status.as_str(),
                task.total_bytes as i64,
                task.downloaded_bytes as i64,
                task.created_at,
                task.started_at,
                task.completed_at,
                task.resume_token,
                task.error,
            ],
        )?;

        Ok(())
    }

    /// 更新任务进度（进度持久化步进由调用方控制）
    pub fn update_task_progress(
        &self,
        item_id: &str,
        downloaded_bytes: u64,
        total_bytes: u64,
    ) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            "UPDATE download_tasks SET downloaded_bytes = ?2, total_bytes = ?3 WHERE item_id = ?1",
            params![item_id, downloaded_bytes as i64, total_bytes as i64],
        )?;

        Ok(())
    }

    /// 删除任务行
    pub fn delete_task(&self, item_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            "DELETE FROM download_tasks WHERE item_id = ?1",
            params![item_id],
        )?;

        debug!("已删除任务行: item_id={}", item_id);
        Ok(())
    }

    /// 加载所有持久化的任务行（启动恢复用）
    pub fn load_active_tasks(&self) -> Result<Vec<DownloadTask>> {
        let conn = self.lock_conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, item_id, source_url, media_kind, status, total_bytes,
                    downloaded_bytes, created_at, started_at, completed_at,
                    resume_token, error_msg
             FROM download_tasks ORDER BY created_at",
        )?;

        let tasks = stmt
            .query_map([], |row| {
                let kind_str: String = row.get(3)?;
                let status_str: String = row.get(4)?;
                Ok(DownloadTask {
                    id: row.get(0)?,
                    item_id: row.get(1)?,
                    source_url: row.get(2)?,
                    media_kind: MediaKind::parse(&kind_str).unwrap_or(MediaKind::Audio),
                    status: TaskStatus::parse(&status_str).unwrap_or(TaskStatus::Paused),
                    total_bytes: row.get::<_, i64>(5)? as u64,
                    downloaded_bytes: row.get::<_, i64>(6)? as u64,
                    created_at: row.get(7)?,
                    started_at: row.get(8)?,
                    completed_at: row.get(9)?,
                    resume_token: row.get(10)?,
                    error: row.get(11)?,
                    last_persisted_percent: 0,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(tasks)
    }
}
