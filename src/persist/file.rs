use super::{admit, PersistStore};
use crate::config::PersistStrategy;
use crate::error::{EngineError, EngineResult};
use crate::transport::{OutboundPacket, RequestToken};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::fs as async_fs;
use tracing::warn;

const EXTENSION: &str = "mqtt";

/// One JSON file per packet, named `<token>.mqtt`, written through on every save
///
/// The directory is scanned once when the store is opened; afterwards the
/// set of stored tokens is tracked in memory and all file I/O goes through
/// `tokio::fs`.
#[derive(Debug)]
pub struct FilePersist {
    dir: PathBuf,
    strategy: PersistStrategy,
    tokens: Mutex<BTreeSet<RequestToken>>,
}

impl FilePersist {
    pub fn open(dir: impl AsRef<Path>, strategy: PersistStrategy) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let tokens = scan_tokens(&dir)?;
        Ok(Self {
            dir,
            strategy,
            tokens: Mutex::new(tokens),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, token: RequestToken) -> PathBuf {
        self.dir.join(format!("{}.{EXTENSION}", token.0))
    }

    fn tokens(&self) -> MutexGuard<'_, BTreeSet<RequestToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn scan_tokens(dir: &Path) -> io::Result<BTreeSet<RequestToken>> {
    let mut tokens = BTreeSet::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
            continue;
        }
        match path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            Some(raw) => {
                tokens.insert(RequestToken(raw));
            }
            None => warn!(path = %path.display(), "ignoring unrecognised file in persist dir"),
        }
    }
    Ok(tokens)
}

fn io_error(action: &str, path: &Path, error: impl std::fmt::Display) -> EngineError {
    EngineError::persistence(format!("{action} {}: {error}", path.display()))
}

async fn remove_if_present(path: &Path) -> EngineResult<()> {
    match async_fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error("remove", path, e)),
    }
}

#[async_trait]
impl PersistStore for FilePersist {
    fn name(&self) -> &'static str {
        "file"
    }

    fn last_token(&self) -> Option<RequestToken> {
        self.tokens().last().copied()
    }

    async fn save(&self, token: RequestToken, packet: &OutboundPacket) -> EngineResult<()> {
        let path = self.path_for(token);
        let bytes = serde_json::to_vec(packet).map_err(|e| io_error("encode", &path, e))?;
        {
            let mut tokens = self.tokens();
            if !admit(&self.strategy, tokens.len(), tokens.contains(&token))? {
                return Ok(());
            }
            tokens.insert(token);
        }

        if let Err(e) = async_fs::write(&path, bytes).await {
            self.tokens().remove(&token);
            return Err(io_error("write", &path, e));
        }
        Ok(())
    }

    async fn ack(&self, token: RequestToken) -> EngineResult<()> {
        if !self.tokens().remove(&token) {
            return Ok(());
        }
        remove_if_present(&self.path_for(token)).await
    }

    async fn load_pending(&self) -> EngineResult<Vec<(RequestToken, OutboundPacket)>> {
        let tokens: Vec<RequestToken> = self.tokens().iter().copied().collect();
        let mut pending = Vec::with_capacity(tokens.len());
        for token in tokens {
            let path = self.path_for(token);
            let bytes = match async_fs::read(&path).await {
                Ok(bytes) => bytes,
                // acknowledged while we were reading
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error("read", &path, e)),
            };
            let packet =
                serde_json::from_slice(&bytes).map_err(|e| io_error("decode", &path, e))?;
            pending.push((token, packet));
        }
        Ok(pending)
    }

    async fn destroy(&self) -> EngineResult<()> {
        let tokens = std::mem::take(&mut *self.tokens());
        for token in tokens {
            remove_if_present(&self.path_for(token)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::QoS;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn publish(token: u64) -> OutboundPacket {
        OutboundPacket::Publish {
            token: RequestToken(token),
            topic: "a/b".to_string(),
            qos: QoS::ExactlyOnce,
            retain: true,
            payload: Bytes::from(vec![0u8, 159, 146, 150]),
        }
    }

    #[tokio::test]
    async fn test_packets_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FilePersist::open(dir.path(), PersistStrategy::default()).unwrap();
            store.save(RequestToken(10), &publish(10)).await.unwrap();
            store.save(RequestToken(3), &publish(3)).await.unwrap();
        }

        let reopened = FilePersist::open(dir.path(), PersistStrategy::default()).unwrap();
        let pending = reopened.load_pending().await.unwrap();
        assert_eq!(
            pending,
            vec![(RequestToken(3), publish(3)), (RequestToken(10), publish(10))]
        );
        assert!(dir.path().join("3.mqtt").exists());
    }

    #[tokio::test]
    async fn test_ack_removes_file() {
        let dir = TempDir::new().unwrap();
        let store = FilePersist::open(dir.path(), PersistStrategy::default()).unwrap();
        store.save(RequestToken(1), &publish(1)).await.unwrap();
        store.ack(RequestToken(1)).await.unwrap();
        store.ack(RequestToken(1)).await.unwrap();
        assert!(store.load_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_files_ignored() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        fs::write(dir.path().join("abc.mqtt"), b"{}").unwrap();
        let store = FilePersist::open(dir.path(), PersistStrategy::default()).unwrap();
        assert!(store.load_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_index_built_from_directory() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("7.mqtt"), b"not json").unwrap();
        fs::write(dir.path().join("12.mqtt"), b"not json").unwrap();
        let store = FilePersist::open(dir.path(), PersistStrategy::default()).unwrap();
        assert_eq!(store.last_token(), Some(RequestToken(12)));

        store.ack(RequestToken(12)).await.unwrap();
        assert_eq!(store.last_token(), Some(RequestToken(7)));
        assert!(!dir.path().join("12.mqtt").exists());

        store.destroy().await.unwrap();
        assert_eq!(store.last_token(), None);
        assert!(!dir.path().join("7.mqtt").exists());
    }

    #[tokio::test]
    async fn test_corrupt_packet_reported() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("5.mqtt"), b"not json").unwrap();
        let store = FilePersist::open(dir.path(), PersistStrategy::default()).unwrap();
        let error = store.load_pending().await.unwrap_err();
        assert!(matches!(error, EngineError::Persistence { .. }));
    }

    #[tokio::test]
    async fn test_strategy_limit() {
        let dir = TempDir::new().unwrap();
        let store = FilePersist::open(
            dir.path(),
            PersistStrategy {
                max_count: 1,
                drop_on_exceed: true,
                duplicate_replace: true,
            },
        )
        .unwrap();
        store.save(RequestToken(1), &publish(1)).await.unwrap();
        assert!(store.save(RequestToken(2), &publish(2)).await.is_err());
        store.destroy().await.unwrap();
        store.save(RequestToken(2), &publish(2)).await.unwrap();
        assert_eq!(store.load_pending().await.unwrap().len(), 1);
    }
}
