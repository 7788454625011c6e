use anyhow::Result;
use futures_util::Stream;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tempfile::TempDir;
use bytes::Bytes;
use tokio_util::io::ReaderStream;

// =============================================================================
// Workspace
// - リクエストごとに専用の一時ディレクトリを確保する
// - Drop 時にディレクトリごと削除される（成功/失敗に関わらず）
// - ハンドラからのファイル操作はブロッキングスレッドで行う
// =============================================================================

pub struct Workspace {
    dir: TempDir,
    sources: Vec<PathBuf>,
    output: Option<PathBuf>,
}

impl Workspace {
    /// `root` 配下に一意な名前のワークスペースを作成
    pub async fn create(root: PathBuf) -> Result<Self> {
        tokio::task::spawn_blocking(move || -> Result<Self> {
            let dir = tempfile::Builder::new()
                .prefix("merge-")
                .tempdir_in(&root)
                .map_err(|e| {
                    anyhow::anyhow!("一時ディレクトリの作成に失敗: {} - {}", root.display(), e)
                })?;

            Ok(Self {
                dir,
                sources: Vec::new(),
                output: None,
            })
        })
        .await?
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// i 番目のダウンロードファイルの保存先
    pub fn source_path(&self, index: usize, extension: &str) -> PathBuf {
        self.dir.path().join(format!("audio_{}.{}", index, extension))
    }

    /// ダウンロード済みファイルとして登録（入力順を保持）
    pub fn register_source(&mut self, path: PathBuf) {
        self.sources.push(path);
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// 出力ファイル名を払い出す
    pub fn allocate_output(&mut self) -> PathBuf {
        let path = self
            .dir
            .path()
            .join(format!("merged_{}.mp3", uuid::Uuid::new_v4().simple()));
        self.output = Some(path.clone());
        path
    }

    pub fn output(&self) -> Option<&Path> {
        self.output.as_deref()
    }

    /// ダウンロード済みファイルを削除する
    /// - 何度呼んでもよい。既に存在しないファイルは無視
    pub async fn remove_sources(&mut self) -> usize {
        let paths: Vec<PathBuf> = self.sources.drain(..).collect();
        if paths.is_empty() {
            return 0;
        }

        match tokio::task::spawn_blocking(move || remove_files(&paths)).await {
            Ok(removed) => removed,
            Err(e) => {
                log::warn!("一時ファイルの削除スレッドエラー: {}", e);
                0
            }
        }
    }

    /// ワークスペースをディレクトリごと削除する
    pub async fn close(self) {
        let dir = self.dir;
        let path = dir.path().to_path_buf();
        match tokio::task::spawn_blocking(move || dir.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("ワークスペースの削除に失敗: {} - {}", path.display(), e),
            Err(e) => log::warn!("ワークスペースの削除スレッドエラー: {}", e),
        }
    }

    /// 出力ファイルを読み出すストリームに変換する
    /// - ワークスペースの所有権はストリームへ移り、送信完了（またはドロップ）時に削除される
    pub async fn into_output_stream(self) -> Result<OutputStream> {
        let path = self
            .output
            .clone()
            .ok_or_else(|| anyhow::anyhow!("出力ファイルが作成されていません"))?;

        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| anyhow::anyhow!("出力ファイルを開けません: {} - {}", path.display(), e))?;
        let len = file.metadata().await?.len();

        Ok(OutputStream {
            reader: ReaderStream::new(file),
            len,
            _workspace: self,
        })
    }
}

fn remove_files(paths: &[PathBuf]) -> usize {
    let mut removed = 0;
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                log::warn!("一時ファイルの削除に失敗: {} - {}", path.display(), e);
            }
        }
    }
    removed
}

// =============================================================================
// OutputStream
// =============================================================================

pub struct OutputStream {
    reader: ReaderStream<tokio::fs::File>,
    len: u64,
    _workspace: Workspace,
}

impl OutputStream {
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Stream for OutputStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().reader).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    async fn workspace_in(root: &TempDir) -> Workspace {
        Workspace::create(root.path().to_path_buf()).await.unwrap()
    }

    #[tokio::test]
    async fn workspace_is_removed_on_drop() {
        let root = TempDir::new().unwrap();
        let path = {
            let mut ws = workspace_in(&root).await;
            let source = ws.source_path(0, "mp3");
            std::fs::write(&source, b"data").unwrap();
            ws.register_source(source);
            ws.path().to_path_buf()
        };

        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn close_removes_directory() {
        let root = TempDir::new().unwrap();
        let mut ws = workspace_in(&root).await;
        let source = ws.source_path(0, "mp3");
        std::fs::write(&source, b"data").unwrap();
        ws.register_source(source);
        let path = ws.path().to_path_buf();

        ws.close().await;
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn create_fails_for_missing_root() {
        let root = TempDir::new().unwrap();
        let missing = root.path().join("missing");
        assert!(Workspace::create(missing).await.is_err());
    }

    #[tokio::test]
    async fn workspaces_are_unique() {
        let root = TempDir::new().unwrap();
        let a = workspace_in(&root).await;
        let b = workspace_in(&root).await;
        assert_ne!(a.path(), b.path());
    }

    #[tokio::test]
    async fn remove_sources_is_idempotent() {
        let root = TempDir::new().unwrap();
        let mut ws = workspace_in(&root).await;
        for i in 0..3 {
            let source = ws.source_path(i, "mp3");
            std::fs::write(&source, b"data").unwrap();
            ws.register_source(source);
        }
        std::fs::remove_file(ws.source_path(1, "mp3")).unwrap();

        assert_eq!(ws.remove_sources().await, 2);
        assert_eq!(ws.remove_sources().await, 0);
        assert!(ws.sources().is_empty());
        assert_eq!(std::fs::read_dir(ws.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn output_names_do_not_collide_with_sources() {
        let root = TempDir::new().unwrap();
        let mut ws = workspace_in(&root).await;
        let output = ws.allocate_output();
        assert!(output.starts_with(ws.path()));
        assert_ne!(output, ws.source_path(0, "mp3"));
        assert_eq!(ws.output(), Some(output.as_path()));
    }

    #[tokio::test]
    async fn output_stream_keeps_workspace_until_dropped() {
        let root = TempDir::new().unwrap();
        let mut ws = workspace_in(&root).await;
        let output = ws.allocate_output();
        std::fs::write(&output, b"merged-bytes").unwrap();
        let dir = ws.path().to_path_buf();

        let mut stream = ws.into_output_stream().await.unwrap();
        assert_eq!(stream.len(), 12);
        assert!(dir.exists());

        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(body, b"merged-bytes");

        drop(stream);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn output_stream_requires_output() {
        let root = TempDir::new().unwrap();
        let ws = workspace_in(&root).await;
        assert!(ws.into_output_stream().await.is_err());
    }
}
