// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 存储配置
    #[serde(default)]
    pub storage: StorageConfig,
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 缓存配置
    #[serde(default)]
    pub cache: CacheConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 本地存储根目录（audio/、video/、tmp/ 均在其下）
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    /// 元数据库文件路径
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("talkvault")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("talkvault/talkvault.sqlite")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            db_path: default_db_path(),
        }
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 完成文件的最小有效大小（字节），小于该值视为损坏
    #[serde(default = "default_min_valid_file_bytes")]
    pub min_valid_file_bytes: u64,
    /// 已知总大小时允许的大小偏差（字节）
    #[serde(default = "default_size_tolerance_bytes")]
    pub size_tolerance_bytes: u64,
    /// 下载前可达性检查的超时时间（秒）
    #[serde(default = "default_preflight_timeout_secs")]
    pub preflight_timeout_secs: u64,
    /// 进度持久化的最小步进（百分点）
    #[serde(default = "default_persist_progress_percent")]
    pub persist_progress_percent: u8,
}

fn default_min_valid_file_bytes() -> u64 {
    1000
}

fn default_size_tolerance_bytes() -> u64 {
    10 * 1024
}

fn default_preflight_timeout_secs() -> u64 {
    10
}

fn default_persist_progress_percent() -> u8 {
    10
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            min_valid_file_bytes: default_min_valid_file_bytes(),
            size_tolerance_bytes: default_size_tolerance_bytes(),
            preflight_timeout_secs: default_preflight_timeout_secs(),
            persist_progress_percent: default_persist_progress_percent(),
        }
    }
}

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 已下载列表缓存的有效期（秒）
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_cache_ttl_secs() -> u64 {
    5 * 60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    false
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// 从 TOML 文件加载配置，文件不存在时返回默认配置
    pub async fn load(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;

        let config: AppConfig =
            toml::from_str(&content).with_context(|| format!("解析配置文件失败: {:?}", path))?;

        Ok(config)
    }

    /// 保存配置到 TOML 文件
    pub async fn save(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("创建配置目录失败")?;
        }

        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        fs::write(path, content)
            .await
            .with_context(|| format!("写入配置文件失败: {:?}", path))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.download.min_valid_file_bytes, 1000);
        assert_eq!(config.download.size_tolerance_bytes, 10 * 1024);
        assert_eq!(config.cache.ttl_secs, 300);
        assert_eq!(config.log.level, "info");
    }

    #[tokio::test]
    async fn test_load_missing_file_returns_default() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("missing.toml");

        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.download.persist_progress_percent, 10);
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut config = AppConfig::default();
        config.cache.ttl_secs = 60;
        config.storage.root = PathBuf::from("/data/talks");
        config.save(&path).await.unwrap();

        let loaded = AppConfig::load(&path).await.unwrap();
        assert_eq!(loaded.cache.ttl_secs, 60);
        assert_eq!(loaded.storage.root, PathBuf::from("/data/talks"));
    }

    #[tokio::test]
    async fn test_partial_config_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("partial.toml");

        tokio::fs::write(&path, "[cache]\nttl_secs = 42\n")
            .await
            .unwrap();

        let loaded = AppConfig::load(&path).await.unwrap();
        assert_eq!(loaded.cache.ttl_secs, 42);
        assert_eq!(loaded.download.min_valid_file_bytes, 1000);
    }
}
