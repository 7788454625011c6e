use crate::audio::{format_file_size, AudioProcessor};
use crate::config::Config;
use crate::download::{source_extension, DownloadError, Downloader};
use crate::models::*;
use crate::workspace::Workspace;
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Application State
// - ハンドラ間で共有する情報（設定、HTTP クライアント）
// - リクエスト間で共有する可変状態は持たない
// =============================================================================

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub downloader: Downloader,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let downloader = Downloader::new(&config)?;
        Ok(Self {
            config: Arc::new(config),
            downloader,
        })
    }
}

// =============================================================================
// Error Handling
// - 型安全な API エラーを定義し、`IntoResponse` で `{"error": ...}` へ変換
// =============================================================================

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.code {
            ApiErrorCode::InvalidInput => StatusCode::BAD_REQUEST,
            ApiErrorCode::DownloadFailed => StatusCode::BAD_REQUEST,
            ApiErrorCode::NoValidAudio => StatusCode::BAD_REQUEST,
            ApiErrorCode::FileTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiErrorCode::ProcessingFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ApiErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::new(ApiErrorCode::ProcessingFailed, err.to_string())
    }
}

impl From<DownloadError> for ApiError {
    fn from(err: DownloadError) -> Self {
        match &err {
            DownloadError::Status { url, .. } => {
                ApiError::new(ApiErrorCode::DownloadFailed, download_failed_message(url))
            }
            DownloadError::TooLarge { url, limit } => ApiError::new(
                ApiErrorCode::FileTooLarge,
                format!(
                    "File from {} exceeds the maximum size of {}",
                    url,
                    format_file_size(*limit)
                ),
            ),
            DownloadError::Network { .. } | DownloadError::Io { .. } => {
                ApiError::new(ApiErrorCode::ProcessingFailed, err.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        match rejection {
            // 構文は正しいが形が違う（urls がない、型が違う、余計なフィールド）
            JsonRejection::JsonDataError(_) => {
                ApiError::new(ApiErrorCode::InvalidInput, MSG_NON_EMPTY_URL_LIST)
            }
            JsonRejection::BytesRejection(ref inner)
                if inner.status() == StatusCode::PAYLOAD_TOO_LARGE =>
            {
                ApiError::new(ApiErrorCode::FileTooLarge, "Request body is too large")
            }
            _ => ApiError::new(ApiErrorCode::InvalidInput, MSG_REQUEST_MUST_BE_JSON),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let response = ErrorResponse {
            error: self.message,
        };

        (status_code, Json(response)).into_response()
    }
}

// =============================================================================
// Request Handlers
// =============================================================================

/// ヘルスチェックエンドポイント
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: state.config.server.service_name.clone(),
    })
}

/// 音声結合エンドポイント
/// - ダウンロード → デコード/連結 → エンコード → ストリーミング応答
/// - ワークスペースは応答ボディの送信完了後に削除される
pub async fn merge_audio(
    State(state): State<AppState>,
    payload: Result<Json<MergeRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let request_id = uuid::Uuid::new_v4().simple().to_string();

    let result = handle_merge(&state, &request_id, payload).await;
    if let Err(e) = &result {
        if e.status_code().is_server_error() {
            log::error!("[{}] 結合に失敗しました: {}", request_id, e.message);
        } else {
            log::warn!("[{}] リクエストを拒否しました: {}", request_id, e.message);
        }
    }

    result
}

async fn handle_merge(
    state: &AppState,
    request_id: &str,
    payload: Result<Json<MergeRequest>, JsonRejection>,
) -> ApiResult<Response> {
    // リクエストの検証
    let Json(request) = payload?;
    let urls = request
        .validate(state.config.download.max_urls)
        .map_err(|msg| ApiError::new(ApiErrorCode::InvalidInput, msg))?;

    log::info!("[{}] 結合リクエストを受信: {} 件のURL", request_id, urls.len());

    // ワークスペースの確保
    let mut workspace = Workspace::create(state.config.temp_root())
        .await
        .map_err(|e| ApiError::new(ApiErrorCode::InternalError, e.to_string()))?;

    // 全体のデッドライン付きでパイプラインを実行
    let pipeline = run_pipeline(state, request_id, &urls, &mut workspace);
    let outcome = match tokio::time::timeout(state.config.request_timeout(), pipeline).await {
        Ok(result) => result,
        Err(_) => Err(ApiError::new(
            ApiErrorCode::ProcessingFailed,
            format!(
                "Request timed out after {} seconds",
                state.config.performance.request_timeout_seconds
            ),
        )),
    };

    // ダウンロードしたファイルは成功/失敗に関わらず削除
    let removed = workspace.remove_sources().await;
    log::debug!("[{}] 一時ファイルを {} 件削除しました", request_id, removed);

    // 失敗時はエラー応答の前にディレクトリごと削除
    if let Err(e) = outcome {
        workspace.close().await;
        return Err(e);
    }

    let stream = workspace.into_output_stream().await?;
    let content_length = stream.len();

    log::info!(
        "[{}] 結合ファイルを送信します ({})",
        request_id,
        format_file_size(content_length)
    );

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, MERGED_MIME_TYPE)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", MERGED_FILE_NAME),
        )
        .header(header::CONTENT_LENGTH, content_length)
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::new(ApiErrorCode::InternalError, e.to_string()))?;

    Ok(response)
}

/// ダウンロードから出力ファイルの書き出しまで
async fn run_pipeline(
    state: &AppState,
    request_id: &str,
    urls: &[String],
    workspace: &mut Workspace,
) -> ApiResult<()> {
    // 入力順に 1 件ずつダウンロード（並列化しない）
    for (i, url) in urls.iter().enumerate() {
        let path = workspace.source_path(i, &source_extension(url));
        // 途中で失敗しても削除対象になるよう先に登録
        workspace.register_source(path.clone());

        let downloaded = state.downloader.fetch_to_file(url, &path).await?;
        log::info!(
            "[{}] ダウンロード完了 {}/{}: {} ({}, {}ms)",
            request_id,
            i + 1,
            urls.len(),
            url,
            format_file_size(downloaded.bytes),
            downloaded.elapsed_ms
        );
    }

    if workspace.sources().is_empty() {
        return Err(ApiError::new(ApiErrorCode::NoValidAudio, MSG_NO_VALID_AUDIO));
    }

    let sources: Vec<PathBuf> = workspace.sources().to_vec();
    let output = workspace.allocate_output();
    let processor = AudioProcessor::new(&state.config);
    let request_id_owned = request_id.to_string();

    run_blocking(move |cancel| {
        let processor = processor.with_cancellation(cancel);
        let start = Instant::now();
        let merged = processor.merge_files(&sources)?;
        let track = merged.track();
        log::info!(
            "[{}] {} 件を結合しました: {:.2}秒, {}Hz, {}ch",
            request_id_owned,
            merged.segments().len(),
            merged.duration_seconds(),
            track.sample_rate,
            track.channels
        );

        let written = processor.encode_to_file(&merged, &output)?;
        log::info!(
            "[{}] エンコード完了: {} ({}ms)",
            request_id_owned,
            format_file_size(written),
            start.elapsed().as_millis()
        );
        Ok(())
    })
    .await
}

/// CPU 集約的な処理をブロッキングスレッドで実行
/// - 待機中の future がドロップされる（デッドライン超過など）とトークンがキャンセルされ、処理は次の区切りで止まる
async fn run_blocking<F, T>(task: F) -> ApiResult<T>
where
    F: FnOnce(CancellationToken) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();

    let joined = tokio::task::spawn_blocking(move || task(cancel)).await;
    guard.disarm();

    let result = joined.map_err(|e| {
        ApiError::new(ApiErrorCode::InternalError, format!("処理スレッドエラー: {}", e))
    })?;
    Ok(result?)
}
