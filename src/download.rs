use crate::config::Config;
use futures_util::StreamExt;
use std::path::Path;
use std::time::Instant;
use tokio::io::AsyncWriteExt;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("HTTP {status} from {url}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("file from {url} exceeds the size limit of {limit} bytes")]
    TooLarge { url: String, limit: u64 },

    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// ダウンロード結果
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub bytes: u64,
    pub elapsed_ms: u64,
}

/// 音声ファイル取得用の HTTP クライアント
/// - 1 ファイルごとのタイムアウトとサイズ上限を持つ
#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
    max_file_size: u64,
}

impl Downloader {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.download_timeout())
            .connect_timeout(config.connect_timeout())
            .user_agent(concat!("audio-merger/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| anyhow::anyhow!("HTTPクライアントの作成に失敗しました: {}", e))?;

        Ok(Self {
            client,
            max_file_size: config.max_file_size_bytes(),
        })
    }

    /// URL の内容を `dest` に保存する
    /// - 成功ステータス以外は即エラー（リトライなし）
    /// - Content-Length と実際の受信量の両方でサイズ上限を確認
    pub async fn fetch_to_file(&self, url: &str, dest: &Path) -> Result<DownloadedFile, DownloadError> {
        let start = Instant::now();
        let network = |source: reqwest::Error| DownloadError::Network {
            url: url.to_string(),
            source,
        };
        let io = |source: std::io::Error| DownloadError::Io {
            path: dest.display().to_string(),
            source,
        };

        let response = self.client.get(url).send().await.map_err(network)?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                url: url.to_string(),
                status,
            });
        }

        if let Some(length) = response.content_length() {
            if length > self.max_file_size {
                return Err(self.too_large(url));
            }
        }

        let mut file = tokio::fs::File::create(dest).await.map_err(io)?;
        let mut written = 0u64;
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(network)?;
            written += chunk.len() as u64;
            if written > self.max_file_size {
                return Err(self.too_large(url));
            }
            file.write_all(&chunk).await.map_err(io)?;
        }

        file.flush().await.map_err(io)?;

        Ok(DownloadedFile {
            bytes: written,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }

    fn too_large(&self, url: &str) -> DownloadError {
        DownloadError::TooLarge {
            url: url.to_string(),
            limit: self.max_file_size,
        }
    }
}

/// URL のパスから保存用の拡張子を推定する（不明な場合は mp3）
pub fn source_extension(url: &str) -> String {
    const KNOWN: &[&str] = &["mp3", "wav", "flac", "ogg", "m4a", "aac", "mp4"];

    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|segments| segments.last().map(|s| s.to_string()))
        })
        .and_then(|name| {
            Path::new(&name)
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.to_lowercase())
        })
        .filter(|ext| KNOWN.contains(&ext.as_str()))
        .unwrap_or_else(|| "mp3".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_from_url_path() {
        assert_eq!(source_extension("http://a/1.mp3"), "mp3");
        assert_eq!(source_extension("https://a/b/track.WAV?sig=1"), "wav");
        assert_eq!(source_extension("http://a/stream"), "mp3");
        assert_eq!(source_extension("http://a/file.exe"), "mp3");
    }

    #[test]
    fn status_error_message_names_url() {
        let err = DownloadError::Status {
            url: "http://a/bad.mp3".to_string(),
            status: reqwest::StatusCode::NOT_FOUND,
        };
        assert_eq!(err.to_string(), "HTTP 404 Not Found from http://a/bad.mp3");
    }
}
