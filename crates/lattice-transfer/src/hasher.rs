//! Bounded piece-hashing pool.
//!
//! Hashing a shared file is CPU- and disk-bound, so jobs run on blocking
//! threads behind a semaphore sized to the CPU core count. A file can only
//! be queued once at a time.

use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha512};
use tokio::sync::Semaphore;
use tracing::debug;

use lattice_shared::error::TransferError;

use crate::events::{TransferEvent, TransferEvents};

/// Result of hashing one local file.
#[derive(Debug, Clone)]
pub struct HashedPieces {
    pub info_hash: String,
    pub piece_length: u32,
    pub pieces: Vec<String>,
    pub size: u64,
}

pub struct ShareHasher {
    permits: Arc<Semaphore>,
    worker_count: usize,
    queued: Mutex<HashSet<PathBuf>>,
    events: TransferEvents,
}

impl ShareHasher {
    pub fn new(events: TransferEvents) -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            permits: Arc::new(Semaphore::new(worker_count)),
            worker_count,
            queued: Mutex::new(HashSet::new()),
            events,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Number of files queued or being hashed right now.
    pub fn files_remaining(&self) -> usize {
        self.queued.lock().unwrap().len()
    }

    /// Hash a file into fixed-size piece digests.
    ///
    /// Waits for a worker slot, then runs on a blocking thread. Fails
    /// immediately if the same path is already queued.
    pub async fn hash_file(
        &self,
        path: &Path,
        piece_length: u32,
    ) -> Result<HashedPieces, TransferError> {
        {
            let mut queued = self.queued.lock().unwrap();
            if !queued.insert(path.to_path_buf()) {
                return Err(TransferError::AlreadyQueued(path.display().to_string()));
            }
        }

        let result = self.hash_file_inner(path, piece_length).await;
        self.queued.lock().unwrap().remove(path);
        result
    }

    async fn hash_file_inner(
        &self,
        path: &Path,
        piece_length: u32,
    ) -> Result<HashedPieces, TransferError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TransferError::Hashing("hashing pool closed".to_string()))?;

        let display_path = path.display().to_string();
        debug!(path = %display_path, "Hashing shared file");
        self.events.publish(TransferEvent::HashingStarted {
            path: display_path.clone(),
        });

        let owned = path.to_path_buf();
        let result = tokio::task::spawn_blocking(move || hash_pieces(&owned, piece_length))
            .await
            .map_err(|e| TransferError::Hashing(e.to_string()))?;

        self.events
            .publish(TransferEvent::HashingFinished { path: display_path });

        result
    }
}

fn hash_pieces(path: &Path, piece_length: u32) -> Result<HashedPieces, TransferError> {
    if piece_length == 0 {
        return Err(TransferError::Hashing("piece length must be non-zero".to_string()));
    }

    let mut file =
        std::fs::File::open(path).map_err(|e| TransferError::Hashing(e.to_string()))?;

    let mut pieces = Vec::new();
    let mut identity = Sha512::new();
    let mut buf = vec![0u8; piece_length as usize];
    let mut size: u64 = 0;

    loop {
        // Fill a whole piece; reads may return short.
        let mut filled = 0;
        while filled < buf.len() {
            let n = file
                .read(&mut buf[filled..])
                .map_err(|e| TransferError::Hashing(e.to_string()))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }

        size += filled as u64;
        let digest = Sha512::digest(&buf[..filled]);
        identity.update(digest);
        pieces.push(hex::encode(digest));

        if filled < buf.len() {
            break;
        }
    }

    // The file identity covers every piece digest, so any content change
    // changes the info hash.
    let info_hash = hex::encode(identity.finalize());

    Ok(HashedPieces {
        info_hash,
        piece_length,
        pieces,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file(contents: &[u8]) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("lattice-hash-test-{}", uuid::Uuid::new_v4()));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        path
    }

    #[tokio::test]
    async fn test_hash_small_file() {
        let path = temp_file(b"piece one piece two");
        let hasher = ShareHasher::new(TransferEvents::new());

        let hashed = hasher.hash_file(&path, 8).await.unwrap();
        assert_eq!(hashed.size, 19);
        assert_eq!(hashed.pieces.len(), 3);
        assert_eq!(hashed.info_hash.len(), 128);

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_hash_is_deterministic() {
        let path = temp_file(b"same content");
        let hasher = ShareHasher::new(TransferEvents::new());

        let first = hasher.hash_file(&path, 4).await.unwrap();
        let second = hasher.hash_file(&path, 4).await.unwrap();
        assert_eq!(first.info_hash, second.info_hash);
        assert_eq!(first.pieces, second.pieces);

        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_different_content_different_identity() {
        let a = temp_file(b"content a");
        let b = temp_file(b"content b");
        let hasher = ShareHasher::new(TransferEvents::new());

        let ha = hasher.hash_file(&a, 4).await.unwrap();
        let hb = hasher.hash_file(&b, 4).await.unwrap();
        assert_ne!(ha.info_hash, hb.info_hash);

        std::fs::remove_file(&a).ok();
        std::fs::remove_file(&b).ok();
    }

    #[tokio::test]
    async fn test_worker_count_matches_cpus() {
        let hasher = ShareHasher::new(TransferEvents::new());
        assert!(hasher.worker_count() >= 1);
    }

    #[tokio::test]
    async fn test_missing_file_fails() {
        let hasher = ShareHasher::new(TransferEvents::new());
        let missing = Path::new("/nonexistent/lattice-file");
        assert!(hasher.hash_file(missing, 4).await.is_err());
    }
}
