use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::MediaKind;

/// 下载任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// 等待中
    Pending,
    /// 下载中
    Downloading,
    /// 已暂停
    Paused,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl TaskStatus {
    /// 是否为终态（终态任务不保留在活动集中）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// 数据库中的文本表示
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// 从数据库文本解析
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "downloading" => Some(TaskStatus::Downloading),
            "paused" => Some(TaskStatus::Paused),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

/// 下载任务
///
/// 一次传输尝试的记录。活动期间持久化，终态后从存储中移除。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    /// 任务ID
    pub id: String,
    /// 条目 ID
    pub item_id: String,
    /// 下载源地址
    pub source_url: String,
    /// 媒体类型
    pub media_kind: MediaKind,
    /// 文件总大小（未知时为 0）
    pub total_bytes: u64,
    /// 已下载大小
    pub downloaded_bytes: u64,
    /// 任务状态
    pub status: TaskStatus,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
    /// 续传令牌（暂停/中断时由传输引擎产生，内容对编排器不透明）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<Vec<u8>>,
    /// 错误信息
    pub error: Option<String>,

    /// 最近一次持久化进度时的整数百分比（运行时字段，不序列化）
    #[serde(skip)]
    pub last_persisted_percent: u8,
}

impl DownloadTask {
    pub fn new(
        item_id: String,
        source_url: String,
        media_kind: MediaKind,
        total_bytes: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            item_id,
            source_url,
            media_kind,
            total_bytes,
            downloaded_bytes: 0,
            status: TaskStatus::Pending,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
            resume_token: None,
            error: None,
            last_persisted_percent: 0,
        }
    }

    /// 计算进度（0.0 ~ 1.0）
    pub fn progress(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.downloaded_bytes as f64 / self.total_bytes as f64).min(1.0)
    }

    /// 整数百分比（用于进度持久化步进判断）
    pub fn percent(&self) -> u8 {
        (self.progress() * 100.0) as u8
    }

    /// 应用进度事件
    ///
    /// 单次传输尝试内进度单调不减：回退的字节数直接忽略
    pub fn apply_progress(&mut self, bytes_written: u64, bytes_expected: u64) {
        if bytes_written < self.downloaded_bytes {
            return;
        }
        self.downloaded_bytes = bytes_written;
        if bytes_expected > 0 {
            self.total_bytes = bytes_expected;
        }
    }

    /// 标记为下载中
    pub fn mark_downloading(&mut self) {
        self.status = TaskStatus::Downloading;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 标记为暂停
    pub fn mark_paused(&mut self) {
        self.status = TaskStatus::Paused;
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        if self.total_bytes > 0 {
            self.downloaded_bytes = self.total_bytes;
        }
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) {
        self.status = TaskStatus::Failed;
        self.error = Some(error);
    }

    /// 标记为已取消
    pub fn mark_cancelled(&mut self) {
        self.status = TaskStatus::Cancelled;
    }
}
