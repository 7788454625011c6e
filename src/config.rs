use crate::audio::bitrate_from_kbps;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub download: DownloadConfig,
    pub audio: AudioConfig,
    pub performance: PerformanceConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "ServerConfig::default_service_name")]
    pub service_name: String,
    #[serde(default = "ServerConfig::default_max_request_size_kb")]
    pub max_request_size_kb: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    pub timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub max_file_size_mb: u64,
    pub max_urls: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub bitrate_kbps: u32,
    #[serde(default = "AudioConfig::default_encode_chunk_frames")]
    pub encode_chunk_frames: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// 未指定の場合は OS の一時ディレクトリを使う
    #[serde(default)]
    pub temp_dir: Option<String>,
}

impl ServerConfig {
    fn default_service_name() -> String {
        "audio-merger".to_string()
    }

    const fn default_max_request_size_kb() -> usize {
        1024
    }
}

impl AudioConfig {
    const fn default_encode_chunk_frames() -> usize {
        4096
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 5000,
                service_name: ServerConfig::default_service_name(),
                max_request_size_kb: ServerConfig::default_max_request_size_kb(),
            },
            download: DownloadConfig {
                timeout_seconds: 60,
                connect_timeout_seconds: 10,
                max_file_size_mb: 100,
                max_urls: 50,
            },
            audio: AudioConfig {
                bitrate_kbps: 128,
                encode_chunk_frames: AudioConfig::default_encode_chunk_frames(),
            },
            performance: PerformanceConfig {
                request_timeout_seconds: 600, // 10 minutes
            },
            paths: PathsConfig::default(),
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// 設定ファイルがあれば読み込み、なければデフォルト設定を使う
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load_from_file(path)
                .map_err(|e| anyhow::anyhow!("設定ファイルの読み込みに失敗しました: {} - {}", path.display(), e))
        } else {
            log::info!("設定ファイルが見つかりません: {}. デフォルト設定を使用します", path.display());
            Ok(Self::default())
        }
    }

    /// 環境変数による上書き (PORT, AUDIO_MERGER_TEMP_DIR)
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("無効なPORT環境変数: {} - {}", port, e))?;
        }

        if let Some(dir) = lookup("AUDIO_MERGER_TEMP_DIR") {
            if !dir.trim().is_empty() {
                self.paths.temp_dir = Some(dir);
            }
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        // ポート番号の検証
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("無効なポート番号: {}", self.server.port));
        }

        if self.server.service_name.trim().is_empty() {
            return Err(anyhow::anyhow!("サービス名が設定されていません"));
        }

        if self.server.max_request_size_kb == 0 {
            return Err(anyhow::anyhow!("最大リクエストサイズは1KB以上である必要があります"));
        }

        // ダウンロード設定の検証
        if self.download.timeout_seconds == 0 || self.download.connect_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("ダウンロードのタイムアウトは1秒以上である必要があります"));
        }

        if self.download.max_file_size_mb == 0 {
            return Err(anyhow::anyhow!("最大ファイルサイズは1MB以上である必要があります"));
        }

        if self.download.max_urls == 0 {
            return Err(anyhow::anyhow!("最大URL数は1以上である必要があります"));
        }

        // エンコード設定の検証
        bitrate_from_kbps(self.audio.bitrate_kbps)?;

        if self.audio.encode_chunk_frames == 0 {
            return Err(anyhow::anyhow!("エンコードのチャンクサイズは1以上である必要があります"));
        }

        if self.performance.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("リクエストのタイムアウトは1秒以上である必要があります"));
        }

        // 一時ディレクトリの作成
        if let Some(dir) = &self.paths.temp_dir {
            if !Path::new(dir).exists() {
                fs::create_dir_all(dir)
                    .map_err(|e| anyhow::anyhow!("ディレクトリの作成に失敗: {} - {}", dir, e))?;
            }
        }

        Ok(())
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.download.max_file_size_mb * 1024 * 1024
    }

    pub fn max_request_size_bytes(&self) -> usize {
        self.server.max_request_size_kb * 1024
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download.timeout_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.download.connect_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.performance.request_timeout_seconds)
    }

    /// ワークスペースを作成するルートディレクトリ
    pub fn temp_root(&self) -> PathBuf {
        self.paths
            .temp_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir)
    }
}
