//! 下载子系统错误类型定义
//!
//! 区分两类错误传播路径：
//! - 前置校验错误（URL、可达性等）同步返回给 `start_download` 的调用方，不创建任务
//! - 传输中途的错误只通过 `DownloadEvent::Failed` 事件对外暴露

use thiserror::Error;

/// 下载错误类型
#[derive(Debug, Error)]
pub enum DownloadError {
    /// 无效的下载链接
    #[error("无效的下载链接: {0}")]
    InvalidUrl(String),

    /// 条目没有可下载的媒体资源（例如仅限特定平台播放的视频）
    #[error("条目没有可下载的媒体资源: {0}")]
    NoDownloadableContent(String),

    /// 网络错误（下载前的可达性检查失败）
    #[error("网络错误: {0}")]
    NetworkError(String),

    /// 文件系统错误（移动/复制失败）
    #[error("文件系统错误: {0}")]
    FileSystemError(#[from] std::io::Error),

    /// 下载完成后的文件校验失败（不存在或大小异常）
    #[error("文件校验失败: {0}")]
    ValidationFailed(String),

    /// 指定条目没有匹配的活动任务
    #[error("任务不存在: {0}")]
    TaskNotFound(String),

    /// 元数据存储错误
    #[error("存储错误: {0}")]
    Store(String),
}
