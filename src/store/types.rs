//! 元数据存储类型定义

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::catalog::TalkItem;

/// 媒体类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// 音频
    Audio,
    /// 视频
    Video,
}

impl MediaKind {
    /// 存储子目录名
    pub fn dir_name(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    /// 文件扩展名
    pub fn extension(&self) -> &'static str {
        match self {
            MediaKind::Audio => "mp3",
            MediaKind::Video => "mp4",
        }
    }

    /// 按条目 ID 生成文件名：`{item_id}.{ext}`
    pub fn file_name(&self, item_id: &str) -> String {
        format!("{}.{}", item_id, self.extension())
    }

    /// 数据库中的文本表示
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    /// 从数据库文本解析
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

/// 讲座记录（持久化，存储层所有）
///
/// 不变式：`is_downloaded == true` 时 `local_path` 必须有值。
/// 外部篡改（手动删文件等）会短暂打破该不变式，由 Reconciler 负责修复。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TalkRecord {
    /// 条目 ID
    pub id: String,
    /// 标题
    pub title: String,
    /// 讲者
    pub speaker: String,
    /// 所属系列
    pub series: Option<String>,
    /// 时长（秒）
    pub duration_secs: u32,
    /// 文件大小（字节）
    pub file_size_bytes: u64,
    /// 本地文件路径
    pub local_path: Option<PathBuf>,
    /// 是否已下载
    pub is_downloaded: bool,
    /// 最后访问时间 (Unix timestamp)
    pub last_accessed_at: Option<i64>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 封面图地址
    pub artwork_url: Option<String>,
    /// 封面缩略图地址
    pub artwork_thumb_url: Option<String>,
}

impl TalkRecord {
    /// 从目录条目构建记录（未下载状态）
    pub fn from_item(item: &TalkItem) -> Self {
        Self {
            id: item.id.clone(),
            title: item.title.clone(),
            speaker: item.speaker.clone(),
            series: item.series.clone(),
            duration_secs: item.duration_secs,
            file_size_bytes: 0,
            local_path: None,
            is_downloaded: false,
            last_accessed_at: None,
            created_at: chrono::Utc::now().timestamp(),
            artwork_url: item.artwork_url.clone(),
            artwork_thumb_url: item.artwork_thumb_url.clone(),
        }
    }

    /// 构建占位记录（目录不可用时由 Reconciler 合成）
    pub fn placeholder(id: String, title: String, speaker: String, duration_secs: u32) -> Self {
        Self {
            id,
            title,
            speaker,
            series: None,
            duration_secs,
            file_size_bytes: 0,
            local_path: None,
            is_downloaded: false,
            last_accessed_at: None,
            created_at: chrono::Utc::now().timestamp(),
            artwork_url: None,
            artwork_thumb_url: None,
        }
    }
}
