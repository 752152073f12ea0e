//! 占位元数据估算器
//!
//! 目录不可用（离线）时，Reconciler 用它为孤儿文件合成占位元数据。
//! 估算结果明确是非权威的，只保证"可展示"，不得当作真实值使用。

use crate::store::MediaKind;

/// 估算时长的下限（30 秒）
const MIN_DURATION_SECS: u32 = 30;

/// 估算时长的上限（4 小时）
const MAX_DURATION_SECS: u32 = 4 * 60 * 60;

/// 合成的占位元数据
#[derive(Debug, Clone)]
pub struct PlaceholderMetadata {
    /// 标题（从文件名推断或默认值）
    pub title: String,
    /// 讲者（默认值）
    pub speaker: String,
    /// 估算时长（秒）
    pub duration_secs: u32,
}

/// 元数据估算接口
pub trait MetadataEstimator: Send + Sync {
    /// 根据条目 ID、媒体类型和文件大小合成占位元数据
    fn estimate(&self, item_id: &str, kind: MediaKind, file_size_bytes: u64) -> PlaceholderMetadata;
}

/// 按假定码率估算时长的实现
#[derive(Debug, Clone)]
pub struct BitrateEstimator {
    /// 音频假定码率（kbps）
    pub audio_kbps: u32,
    /// 视频假定码率（kbps）
    pub video_kbps: u32,
}

impl Default for BitrateEstimator {
    fn default() -> Self {
        Self {
            audio_kbps: 64,
            video_kbps: 1200,
        }
    }
}

impl MetadataEstimator for BitrateEstimator {
    fn estimate(&self, item_id: &str, kind: MediaKind, file_size_bytes: u64) -> PlaceholderMetadata {
        let kbps = match kind {
            MediaKind::Audio => self.audio_kbps,
            MediaKind::Video => self.video_kbps,
        } as u64;

        // 时长 ≈ 字节数 * 8 / 码率，钳制在 [30s, 4h]
        let raw_secs = if kbps > 0 {
            file_size_bytes.saturating_mul(8) / (kbps * 1000)
        } else {
            0
        };
        let duration_secs = (raw_secs as u32).clamp(MIN_DURATION_SECS, MAX_DURATION_SECS);

        let title = if item_id.is_empty() {
            "Unknown Talk".to_string()
        } else {
            format!("Talk {}", item_id)
        };

        PlaceholderMetadata {
            title,
            speaker: "Unknown Speaker".to_string(),
            duration_secs,
        }
    }
}
