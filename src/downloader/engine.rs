//! 后台传输引擎
//!
//! 把字节传输从编排器的控制流中剥离出来：引擎在后台任务里执行可恢复的
//! HTTP 流式下载，通过每个句柄独立的事件通道异步上报进度与终态。
//!
//! ## 契约
//!
//! - 每个句柄恰好产生一个终态事件（`Completed` 或 `Failed`），除非被 `stop` 显式停止
//! - `stop` 可能与在途终态事件竞争，调用方必须容忍两者都到达
//! - `stop` 尽力返回续传令牌；令牌对调用方不透明

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 传输事件（每个句柄一条独立事件流）
#[derive(Debug)]
pub enum TransferEvent {
    /// 进度更新
    Progress { bytes_written: u64, bytes_expected: u64 },
    /// 传输完成，临时文件路径仅在回调处理期间有效
    Completed { temp_path: PathBuf },
    /// 传输失败
    Failed { error: String },
}

/// 传输句柄：ID + 该次传输的事件接收端
#[derive(Debug)]
pub struct TransferHandle {
    /// 句柄 ID
    pub id: String,
    /// 事件接收端
    pub events: mpsc::UnboundedReceiver<TransferEvent>,
}

/// 传输引擎抽象
#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// 可达性预检（HEAD 等价），成功时返回内容大小（未知为 0）
    async fn preflight(&self, url: &str) -> Result<u64>;

    /// 开始一次新传输
    async fn begin(&self, url: &str) -> Result<TransferHandle>;

    /// 用续传令牌恢复传输；令牌无法解码时返回错误，由调用方退回全新传输
    async fn begin_with_resume_token(&self, token: &[u8]) -> Result<TransferHandle>;

    /// 停止传输，尽力返回续传令牌
    ///
    /// 句柄已终结（完成/失败）时返回 None
    async fn stop(&self, handle_id: &str) -> Option<Vec<u8>>;
}

/// 续传令牌内容（JSON 编码后对外不透明）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeToken {
    /// 下载源地址
    pub url: String,
    /// 部分下载的临时文件
    pub temp_path: PathBuf,
    /// 已写入字节数
    pub bytes_downloaded: u64,
    /// 总大小（未知为 0）
    pub total_bytes: u64,
}

impl ResumeToken {
    /// 编码为不透明字节串
    pub fn encode(&self) -> Vec<u8> {
        // 结构体全部字段可序列化，不会失败
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// 解码，失败返回 None
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// 单次传输的共享状态（stop 时据此生成续传令牌）
struct TransferSession {
    url: String,
    temp_path: PathBuf,
    bytes_written: AtomicU64,
    bytes_expected: AtomicU64,
    cancel: CancellationToken,
}

/// 基于 reqwest 的 HTTP 传输引擎实现
pub struct HttpTransferEngine {
    client: reqwest::Client,
    /// 临时文件目录
    tmp_dir: PathBuf,
    /// 活动会话（handle_id -> 会话状态）
    sessions: Arc<RwLock<HashMap<String, Arc<TransferSession>>>>,
}

impl HttpTransferEngine {
    /// 创建引擎，临时文件写入 `tmp_dir`
    pub fn new(tmp_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&tmp_dir).context("创建临时下载目录失败")?;

        Ok(Self {
            client: reqwest::Client::new(),
            tmp_dir,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// 启动一次传输（offset > 0 表示从临时文件续传）
    async fn spawn_transfer(
        &self,
        url: String,
        temp_path: PathBuf,
        offset: u64,
        total_bytes: u64,
    ) -> Result<TransferHandle> {
        let handle_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let session = Arc::new(TransferSession {
            url: url.clone(),
            temp_path: temp_path.clone(),
            bytes_written: AtomicU64::new(offset),
            bytes_expected: AtomicU64::new(total_bytes),
            cancel: CancellationToken::new(),
        });

        self.sessions
            .write()
            .await
            .insert(handle_id.clone(), session.clone());

        let client = self.client.clone();
        let sessions = self.sessions.clone();
        let id = handle_id.clone();

        tokio::spawn(async move {
            let result = run_transfer(&client, &session, offset, &tx).await;

            // 被 stop 取消时不发终态事件，会话由 stop 负责清理
            if session.cancel.is_cancelled() {
                debug!("传输已被停止，跳过终态事件: handle={}", id);
                return;
            }

            sessions.write().await.remove(&id);

            match result {
                Ok(()) => {
                    let _ = tx.send(TransferEvent::Completed {
                        temp_path: session.temp_path.clone(),
                    });
                }
                Err(e) => {
                    warn!("传输失败: handle={}, url={}, 错误: {:#}", id, session.url, e);
                    // 失败的临时文件不保留
                    let _ = tokio::fs::remove_file(&session.temp_path).await;
                    let _ = tx.send(TransferEvent::Failed {
                        error: format!("{:#}", e),
                    });
                }
            }
        });

        info!("传输已启动: handle={}, url={}, offset={}", handle_id, url, offset);

        Ok(TransferHandle {
            id: handle_id,
            events: rx,
        })
    }
}

/// 执行 HTTP 流式下载
async fn run_transfer(
    client: &reqwest::Client,
    session: &TransferSession,
    mut offset: u64,
    tx: &mpsc::UnboundedSender<TransferEvent>,
) -> Result<()> {
    let mut request = client.get(&session.url);
    if offset > 0 {
        request = request.header(reqwest::header::RANGE, format!("bytes={}-", offset));
    }

    let response = request.send().await.context("发送下载请求失败")?;
    let status = response.status();

    if !status.is_success() {
        anyhow::bail!("服务器返回错误状态: {}", status);
    }

    // 服务器不支持 Range 时退回全量下载
    if offset > 0 && status != reqwest::StatusCode::PARTIAL_CONTENT {
        warn!("服务器忽略 Range 请求，从头下载: {}", session.url);
        offset = 0;
        session.bytes_written.store(0, Ordering::Relaxed);
    }

    let content_length = response.content_length().unwrap_or(0);
    if content_length > 0 {
        session
            .bytes_expected
            .store(offset + content_length, Ordering::Relaxed);
    }
    let bytes_expected = session.bytes_expected.load(Ordering::Relaxed);

    let mut file = open_temp_file(&session.temp_path, offset).await?;
    let mut stream = response.bytes_stream();

    loop {
        let chunk = tokio::select! {
            _ = session.cancel.cancelled() => {
                // 停止前把已写入数据刷盘，保证续传令牌有效
                file.flush().await.context("刷写临时文件失败")?;
                return Ok(());
            }
            chunk = stream.next() => chunk,
        };

        let Some(chunk) = chunk else {
            break;
        };
        let chunk = chunk.context("读取响应数据失败")?;

        file.write_all(&chunk).await.context("写入临时文件失败")?;

        let written = session
            .bytes_written
            .fetch_add(chunk.len() as u64, Ordering::Relaxed)
            + chunk.len() as u64;

        let _ = tx.send(TransferEvent::Progress {
            bytes_written: written,
            bytes_expected,
        });
    }

    file.flush().await.context("刷写临时文件失败")?;
    Ok(())
}

/// 续传起点以临时文件的实际长度为准
///
/// 令牌里的字节计数在 stop 与写入线程竞争时可能滞后于磁盘内容，
/// 以它为起点会在 append 模式下重复写入尾部数据；文件长度不会。
/// 临时文件已丢失则从零开始，沿用令牌中的路径。
async fn resume_offset(token: &ResumeToken) -> u64 {
    match tokio::fs::metadata(&token.temp_path).await {
        Ok(meta) => meta.len(),
        Err(_) => {
            warn!("续传临时文件不存在，从头下载: {:?}", token.temp_path);
            0
        }
    }
}

/// 打开临时文件：续传时追加，全新传输时截断
async fn open_temp_file(path: &Path, offset: u64) -> Result<File> {
    let file = if offset > 0 && path.exists() {
        OpenOptions::new()
            .append(true)
            .open(path)
            .await
            .context("打开临时文件失败")?
    } else {
        File::create(path).await.context("创建临时文件失败")?
    };
    Ok(file)
}

#[async_trait]
impl TransferEngine for HttpTransferEngine {
    async fn preflight(&self, url: &str) -> Result<u64> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .with_context(|| format!("可达性检查失败: {}", url))?;

        if !response.status().is_success() {
            anyhow::bail!("可达性检查返回错误状态: {} ({})", response.status(), url);
        }

        Ok(response.content_length().unwrap_or(0))
    }

    async fn begin(&self, url: &str) -> Result<TransferHandle> {
        let temp_path = self.tmp_dir.join(format!("{}.part", Uuid::new_v4()));
        self.spawn_transfer(url.to_string(), temp_path, 0, 0).await
    }

    async fn begin_with_resume_token(&self, token: &[u8]) -> Result<TransferHandle> {
        let token = ResumeToken::decode(token).context("续传令牌无法解码")?;
        let offset = resume_offset(&token).await;

        self.spawn_transfer(token.url, token.temp_path, offset, token.total_bytes)
            .await
    }

    async fn stop(&self, handle_id: &str) -> Option<Vec<u8>> {
        let session = self.sessions.write().await.remove(handle_id)?;

        session.cancel.cancel();

        let token = ResumeToken {
            url: session.url.clone(),
            temp_path: session.temp_path.clone(),
            bytes_downloaded: session.bytes_written.load(Ordering::Relaxed),
            total_bytes: session.bytes_expected.load(Ordering::Relaxed),
        };

        info!(
            "传输已停止: handle={}, 已下载 {} 字节",
            handle_id, token.bytes_downloaded
        );

        Some(token.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_token_roundtrip() {
        let token = ResumeToken {
            url: "https://cdn.example.org/t1.mp3".to_string(),
            temp_path: PathBuf::from("/tmp/abc.part"),
            bytes_downloaded: 4096,
            total_bytes: 10_000,
        };

        let encoded = token.encode();
        let decoded = ResumeToken::decode(&encoded).unwrap();
        assert_eq!(decoded.url, token.url);
        assert_eq!(decoded.temp_path, token.temp_path);
        assert_eq!(decoded.bytes_downloaded, 4096);
        assert_eq!(decoded.total_bytes, 10_000);
    }

    #[test]
    fn test_resume_token_decode_garbage() {
        assert!(ResumeToken::decode(b"not a token").is_none());
        assert!(ResumeToken::decode(&[]).is_none());
    }

    #[tokio::test]
    async fn test_stop_unknown_handle_returns_none() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let engine = HttpTransferEngine::new(temp_dir.path().to_path_buf()).unwrap();
        assert!(engine.stop("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn test_resume_offset_uses_file_length_over_lagging_counter() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let temp_path = temp_dir.path().join("t1.part");
        tokio::fs::write(&temp_path, vec![0u8; 4096]).await.unwrap();

        // 令牌计数落后于磁盘内容（stop 与写入竞争时会发生）
        let token = ResumeToken {
            url: "https://cdn.example.org/t1.mp3".to_string(),
            temp_path: temp_path.clone(),
            bytes_downloaded: 3000,
            total_bytes: 10_000,
        };

        // 起点按文件长度算，否则 append 会重复尾部数据
        assert_eq!(resume_offset(&token).await, 4096);
    }

    #[tokio::test]
    async fn test_resume_offset_zero_when_temp_file_missing() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let token = ResumeToken {
            url: "https://cdn.example.org/t1.mp3".to_string(),
            temp_path: temp_dir.path().join("gone.part"),
            bytes_downloaded: 4096,
            total_bytes: 10_000,
        };

        assert_eq!(resume_offset(&token).await, 0);
    }
}
