//! 下载子系统
//!
//! - `task`: 下载任务与状态机
//! - `engine`: 后台传输引擎（HTTP 流式下载 + 续传令牌）
//! - `events`: 对外广播的下载事件
//! - `manager`: 编排器，对外的操作入口

pub mod engine;
pub mod events;
pub mod manager;
pub mod task;

pub use engine::{HttpTransferEngine, ResumeToken, TransferEngine, TransferEvent, TransferHandle};
pub use events::DownloadEvent;
pub use manager::DownloadManager;
pub use task::{DownloadTask, TaskStatus};
