//! 下载事件类型定义
//!
//! 编排器对外（展示层）广播的事件。传输中途的失败不会回抛给
//! `start_download` 的调用方，只能通过这里的 `Failed` 事件观察到。

use serde::{Deserialize, Serialize};

/// 下载事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DownloadEvent {
    /// 任务开始传输
    Started {
        item_id: String,
        task_id: String,
        total_bytes: u64,
    },
    /// 进度更新
    Progress {
        item_id: String,
        downloaded_bytes: u64,
        total_bytes: u64,
        progress: f64,
    },
    /// 下载完成（文件已落盘并通过校验）
    Completed {
        item_id: String,
        local_path: String,
        file_size_bytes: u64,
    },
    /// 下载失败（传输错误或校验失败）
    Failed { item_id: String, error: String },
    /// 本地下载已删除
    Deleted { item_id: String },
}

impl DownloadEvent {
    /// 事件关联的条目 ID
    pub fn item_id(&self) -> &str {
        match self {
            DownloadEvent::Started { item_id, .. }
            | DownloadEvent::Progress { item_id, .. }
            | DownloadEvent::Completed { item_id, .. }
            | DownloadEvent::Failed { item_id, .. }
            | DownloadEvent::Deleted { item_id } => item_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_tag() {
        let event = DownloadEvent::Completed {
            item_id: "t1".to_string(),
            local_path: "/data/audio/t1.mp3".to_string(),
            file_size_bytes: 2048,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event_type":"completed""#));
        assert_eq!(event.item_id(), "t1");
    }
}
