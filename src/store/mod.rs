//! 持久化元数据存储模块
//!
//! 讲座记录与活动任务的唯一事实来源（SQLite），跨进程重启保持一致

pub mod db;
pub mod types;

pub use db::TalkStore;
pub use types::{MediaKind, TalkRecord};
