//! 远程目录（catalog）客户端
//!
//! 编排器只消费"按 ID 获取条目元数据"这一个能力：
//! - `start_download` 的入参 `TalkItem` 由上层从目录获取
//! - Reconciler 发现孤儿文件时用它兜底回填元数据，允许离线失败

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::store::MediaKind;

/// 目录中的讲座条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TalkItem {
    /// 条目 ID
    pub id: String,
    /// 标题
    pub title: String,
    /// 讲者
    pub speaker: String,
    /// 所属系列
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<String>,
    /// 时长（秒）
    #[serde(default)]
    pub duration_secs: u32,
    /// 音频下载地址
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    /// 视频下载地址（仅限特定平台播放时为 None）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    /// 封面图地址
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork_url: Option<String>,
    /// 封面缩略图地址
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artwork_thumb_url: Option<String>,
}

impl TalkItem {
    /// 按媒体类型取下载地址
    pub fn media_url(&self, kind: MediaKind) -> Option<&str> {
        match kind {
            MediaKind::Audio => self.audio_url.as_deref(),
            MediaKind::Video => self.video_url.as_deref(),
        }
    }
}

/// 目录查询接口
///
/// 实现方只需要提供按 ID 查询，失败会被调用方容忍（降级为占位元数据）
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// 按条目 ID 获取元数据
    async fn fetch_item_metadata(&self, id: &str) -> Result<TalkItem>;
}

/// 基于 HTTP JSON API 的目录客户端
pub struct HttpCatalogClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCatalogClient {
    /// 创建目录客户端
    ///
    /// `base_url` 形如 `https://api.example.org/v1`，不带结尾斜杠
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn fetch_item_metadata(&self, id: &str) -> Result<TalkItem> {
        let url = format!("{}/talks/{}", self.base_url, id);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("请求目录失败: {}", url))?;

        if !response.status().is_success() {
            anyhow::bail!("目录返回错误状态: {} ({})", response.status(), url);
        }

        let item: TalkItem = response
            .json()
            .await
            .with_context(|| format!("解析目录响应失败: {}", url))?;

        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_url_selection() {
        let item = TalkItem {
            id: "talk-1".to_string(),
            title: "On Stillness".to_string(),
            speaker: "S. Hartley".to_string(),
            series: None,
            duration_secs: 1800,
            audio_url: Some("https://cdn.example.org/talk-1.mp3".to_string()),
            video_url: None,
            artwork_url: None,
            artwork_thumb_url: None,
        };

        assert!(item.media_url(MediaKind::Audio).is_some());
        assert!(item.media_url(MediaKind::Video).is_none());
    }

    #[test]
    fn test_item_deserialization_with_missing_fields() {
        let json = r#"{"id": "t", "title": "T", "speaker": "S"}"#;
        let item: TalkItem = serde_json::from_str(json).unwrap();
        assert_eq!(item.duration_secs, 0);
        assert!(item.audio_url.is_none());
    }
}
