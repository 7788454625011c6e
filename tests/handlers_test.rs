use audio_merger::{config::Config, handlers::AppState, models::*};
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

#[cfg(test)]
mod handlers_tests {
    use super::*;

    /// テスト用のアプリケーションを作成（ワークスペースは temp_dir 配下）
    fn create_test_app(temp_dir: &TempDir) -> Router {
        let mut config = Config::default();
        config.paths.temp_dir = Some(temp_dir.path().to_string_lossy().to_string());
        config.download.max_urls = 3;

        audio_merger::create_app(AppState::new(config).unwrap())
    }

    fn merge_request(body: impl Into<Body>, content_type: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(Method::POST).uri("/merge");
        if let Some(content_type) = content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        builder.body(body.into()).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn is_empty_dir(temp_dir: &TempDir) -> bool {
        std::fs::read_dir(temp_dir.path()).unwrap().next().is_none()
    }

    /// ヘルスチェック
    #[tokio::test]
    async fn test_health_check() {
        let temp_dir = TempDir::new().unwrap();
        let app = create_test_app(&temp_dir);

        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json, json!({"status": "healthy", "service": "audio-merger"}));
    }

    /// JSON 以外のボディは 400
    #[tokio::test]
    async fn test_non_json_body() {
        let temp_dir = TempDir::new().unwrap();
        let app = create_test_app(&temp_dir);

        let response = app
            .oneshot(merge_request("urls=http://a/1.mp3", Some("text/plain")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let json = json_body(response).await;
        assert_eq!(json, json!({"error": MSG_REQUEST_MUST_BE_JSON}));
        assert!(is_empty_dir(&temp_dir));
    }

    /// Content-Type が JSON でも構文エラーなら 400
    #[tokio::test]
    async fn test_malformed_json() {
        let temp_dir = TempDir::new().unwrap();
        let app = create_test_app(&temp_dir);

        let response = app
            .oneshot(merge_request("{\"urls\": [", Some("application/json")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], MSG_REQUEST_MUST_BE_JSON);
    }

    /// 空の URL リストは 400
    #[tokio::test]
    async fn test_empty_url_list() {
        let temp_dir = TempDir::new().unwrap();
        let app = create_test_app(&temp_dir);

        let body = json!({"urls": []}).to_string();
        let response = app
            .oneshot(merge_request(body, Some("application/json")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let json = json_body(response).await;
        let message = json["error"].as_str().unwrap();
        assert!(message.contains("non-empty list"));
        assert!(is_empty_dir(&temp_dir));
    }

    /// urls フィールドの欠落・型違い・余分なフィールドは 400
    #[tokio::test]
    async fn test_invalid_payload_shapes() {
        let temp_dir = TempDir::new().unwrap();

        let payloads = [
            json!({}),
            json!({"urls": "http://a/1.mp3"}),
            json!({"urls": [1, 2]}),
            json!({"urls": ["http://a/1.mp3"], "format": "wav"}),
            json!(["http://a/1.mp3"]),
        ];

        for payload in payloads {
            let app = create_test_app(&temp_dir);
            let response = app
                .oneshot(merge_request(payload.to_string(), Some("application/json")))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "payload: {}", payload);
            assert_eq!(json_body(response).await["error"], MSG_NON_EMPTY_URL_LIST);
        }

        assert!(is_empty_dir(&temp_dir));
    }

    /// URL 数の上限
    #[tokio::test]
    async fn test_too_many_urls() {
        let temp_dir = TempDir::new().unwrap();
        let app = create_test_app(&temp_dir);

        let body = json!({"urls": ["http://a/1.mp3", "http://a/2.mp3", "http://a/3.mp3", "http://a/4.mp3"]})
            .to_string();
        let response = app
            .oneshot(merge_request(body, Some("application/json")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let json = json_body(response).await;
        assert!(json["error"].as_str().unwrap().contains("Too many URLs"));
    }

    /// http/https 以外の URL は 400
    #[tokio::test]
    async fn test_invalid_url_scheme() {
        let temp_dir = TempDir::new().unwrap();
        let app = create_test_app(&temp_dir);

        let body = json!({"urls": ["file:///etc/passwd"]}).to_string();
        let response = app
            .oneshot(merge_request(body, Some("application/json")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await["error"],
            "Invalid URL: file:///etc/passwd"
        );
    }

    /// 接続できない URL は 500（処理エラー扱い）
    #[tokio::test]
    async fn test_unreachable_url() {
        let temp_dir = TempDir::new().unwrap();
        let app = create_test_app(&temp_dir);

        // 一度バインドして閉じたポートには接続できない
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let body = json!({"urls": [format!("http://127.0.0.1:{}/1.mp3", port)]}).to_string();

        let response = app
            .oneshot(merge_request(body, Some("application/json")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json_body(response).await["error"].is_string());
        assert!(is_empty_dir(&temp_dir));
    }

    /// CORS プリフライト
    #[tokio::test]
    async fn test_cors_preflight() {
        let temp_dir = TempDir::new().unwrap();
        let app = create_test_app(&temp_dir);

        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/merge")
            .header(header::ORIGIN, "http://example.com")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
    }

    /// 通常リクエストにも CORS ヘッダーが付く
    #[tokio::test]
    async fn test_cors_header_on_health() {
        let temp_dir = TempDir::new().unwrap();
        let app = create_test_app(&temp_dir);

        let request = Request::builder()
            .uri("/")
            .header(header::ORIGIN, "http://example.com")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "*"
        );
    }

    /// GET /merge は許可されていない
    #[tokio::test]
    async fn test_merge_requires_post() {
        let temp_dir = TempDir::new().unwrap();
        let app = create_test_app(&temp_dir);

        let request = Request::builder().uri("/merge").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
