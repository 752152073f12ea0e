//! 本地存储布局与空间统计
//!
//! 固定两个存储根目录：`audio/` 与 `video/`，文件名为 `{item_id}.{ext}`；
//! 传输中的临时文件在 `tmp/` 下，不计入占用统计。

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::store::MediaKind;

/// 存储布局
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// 音频根目录
    pub audio_root: PathBuf,
    /// 视频根目录
    pub video_root: PathBuf,
    /// 传输临时目录
    pub tmp_dir: PathBuf,
}

impl StorageLayout {
    /// 在指定根目录下构建布局
    pub fn from_root(root: &Path) -> Self {
        Self {
            audio_root: root.join("audio"),
            video_root: root.join("video"),
            tmp_dir: root.join("tmp"),
        }
    }

    /// 确保所有目录存在
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.audio_root, &self.video_root, &self.tmp_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("创建存储目录失败: {:?}", dir))?;
        }
        Ok(())
    }

    /// 按媒体类型取根目录
    pub fn root_for(&self, kind: MediaKind) -> &Path {
        match kind {
            MediaKind::Audio => &self.audio_root,
            MediaKind::Video => &self.video_root,
        }
    }

    /// 条目的持久存储路径：`{audio|video}/{item_id}.{ext}`
    pub fn media_path(&self, kind: MediaKind, item_id: &str) -> PathBuf {
        self.root_for(kind).join(kind.file_name(item_id))
    }

    /// 两个媒体根目录（不含 tmp）
    pub fn media_roots(&self) -> [(&Path, MediaKind); 2] {
        [
            (self.audio_root.as_path(), MediaKind::Audio),
            (self.video_root.as_path(), MediaKind::Video),
        ]
    }
}

/// 存储空间统计
#[derive(Debug, Clone)]
pub struct StorageAccountant {
    layout: StorageLayout,
}

impl StorageAccountant {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// 统计两个存储根目录下的文件总大小（字节）
    ///
    /// 不可读的条目按 0 计并记录日志，不中断统计
    pub fn used_bytes(&self) -> u64 {
        let mut total = 0u64;

        for (root, _) in self.layout.media_roots() {
            if !root.exists() {
                continue;
            }

            for entry in WalkDir::new(root).into_iter() {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("遍历存储目录失败，跳过: {}", e);
                        continue;
                    }
                };

                if !entry.file_type().is_file() {
                    continue;
                }

                match entry.metadata() {
                    Ok(meta) => total += meta.len(),
                    Err(e) => {
                        warn!("读取文件大小失败，按 0 计: {:?}: {}", entry.path(), e);
                    }
                }
            }
        }

        debug!("存储占用统计: {} 字节", total);
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_media_path_layout() {
        let layout = StorageLayout::from_root(Path::new("/data/talks"));
        assert_eq!(
            layout.media_path(MediaKind::Audio, "t1"),
            PathBuf::from("/data/talks/audio/t1.mp3")
        );
        assert_eq!(
            layout.media_path(MediaKind::Video, "t1"),
            PathBuf::from("/data/talks/video/t1.mp4")
        );
    }

    #[test]
    fn test_used_bytes_sums_both_roots() {
        let temp_dir = TempDir::new().unwrap();
        let layout = StorageLayout::from_root(temp_dir.path());
        layout.ensure_dirs().unwrap();

        std::fs::write(layout.audio_root.join("a.mp3"), vec![0u8; 1000]).unwrap();
        std::fs::write(layout.audio_root.join("b.mp3"), vec![0u8; 2000]).unwrap();
        std::fs::write(layout.video_root.join("c.mp4"), vec![0u8; 3000]).unwrap();

        // tmp 下的部分文件不计入
        std::fs::write(layout.tmp_dir.join("d.part"), vec![0u8; 512]).unwrap();

        let accountant = StorageAccountant::new(layout);
        assert_eq!(accountant.used_bytes(), 6000);
    }

    #[test]
    fn test_used_bytes_missing_roots() {
        let temp_dir = TempDir::new().unwrap();
        let layout = StorageLayout::from_root(&temp_dir.path().join("nonexistent"));
        let accountant = StorageAccountant::new(layout);
        assert_eq!(accountant.used_bytes(), 0);
    }
}
