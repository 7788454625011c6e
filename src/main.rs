use audio_merger::{config::Config, handlers::AppState};
use std::net::SocketAddr;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ログの初期化（RUST_LOG 未指定時は info）
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("audio-merger を起動中...");

    // 設定ファイルの読み込み + 環境変数での上書き
    let config_path =
        std::env::var("AUDIO_MERGER_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let mut config = Config::load_or_default(&config_path)?;
    config.apply_env_overrides()?;

    // 設定の検証
    config.validate()?;

    log::info!("サーバーアドレス: {}", config.server_address());
    log::info!("一時ディレクトリ: {}", config.temp_root().display());
    log::info!(
        "ダウンロード制限: {}件 / {}MB / {}秒",
        config.download.max_urls,
        config.download.max_file_size_mb,
        config.download.timeout_seconds
    );
    log::info!("出力ビットレート: {}kbps", config.audio.bitrate_kbps);

    let app_state = AppState::new(config.clone())?;
    let app = audio_merger::create_app(app_state);

    // サーバーアドレスの解析
    let addr: SocketAddr = config
        .server_address()
        .parse()
        .map_err(|e| anyhow::anyhow!("無効なサーバーアドレス: {}", e))?;

    log::info!("サーバーを起動します: http://{}", addr);
    log::info!("API エンドポイント:");
    log::info!("  GET  /      - ヘルスチェック");
    log::info!("  POST /merge - 音声ファイルの結合");

    // サーバーの起動
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("サーバーの起動に失敗: {}", e))?;

    Ok(())
}
