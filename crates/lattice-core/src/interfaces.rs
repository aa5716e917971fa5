//! Collaborator interfaces.
//!
//! Settings persistence and the share index live outside the core; these
//! traits are the narrow surface the core calls into. The in-memory
//! implementations back tests and embedders that bring no persistence of
//! their own.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};

use lattice_shared::constants::DEFAULT_TCP_PORT;
use lattice_shared::protocol::{MemoInfo, SharedDirectoryInfo, SharedFileListing};
use lattice_shared::types::NodeId;

use crate::trust::TrustedNodeInfo;

/// Persisted per-network state handed back and forth with settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub name: String,
    pub trusted_nodes: Vec<TrustedNodeInfo>,
    pub memos: Vec<MemoInfo>,
}

/// The settings/persistence collaborator.
pub trait Settings: Send + Sync {
    fn nickname(&self) -> String;
    fn tcp_listen_port(&self) -> u16;
    fn autoconnect_count(&self) -> usize;
    fn network_infos(&self) -> Vec<NetworkInfo>;
    /// Update the stored snapshot for one network.
    fn sync_network_info(&self, info: NetworkInfo);
    /// Update the stored snapshot and flush it to durable storage.
    fn sync_network_info_and_save(&self, info: NetworkInfo);
    /// Where completed downloads land, if downloads are kept at all.
    fn download_dir(&self) -> Option<PathBuf>;
}

/// A locally shared file with its on-disk location.
#[derive(Debug, Clone)]
pub struct IndexedFile {
    pub listing: SharedFileListing,
    pub local_path: PathBuf,
}

/// The share-index collaborator (virtual filesystem of shared files).
pub trait ShareIndex: Send + Sync {
    fn get_directory(&self, path: &str) -> Option<SharedDirectoryInfo>;
    fn get_file(&self, path: &str) -> Option<IndexedFile>;
    /// Files and directories matching a query.
    fn search(&self, query: &str) -> (Vec<SharedFileListing>, Vec<String>);
    /// A remote directory listing arrived for an outstanding request.
    fn process_dir_listing(&self, network_id: &str, from: &NodeId, listing: &SharedDirectoryInfo);
    /// Remote file details arrived for an outstanding request.
    fn process_file_details(&self, network_id: &str, from: &NodeId, details: &SharedFileListing);
    fn file_count(&self) -> u64;
    fn byte_count(&self) -> u64;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

pub struct InMemorySettings {
    pub nickname: String,
    pub tcp_listen_port: u16,
    pub autoconnect_count: usize,
    pub download_dir: Option<PathBuf>,
    networks: RwLock<HashMap<String, NetworkInfo>>,
    saves: Mutex<usize>,
}

impl InMemorySettings {
    pub fn new(nickname: &str) -> Self {
        Self {
            nickname: nickname.to_string(),
            tcp_listen_port: DEFAULT_TCP_PORT,
            autoconnect_count: 3,
            download_dir: None,
            networks: RwLock::new(HashMap::new()),
            saves: Mutex::new(0),
        }
    }

    pub fn with_network(self, info: NetworkInfo) -> Self {
        self.networks
            .write()
            .unwrap()
            .insert(info.name.clone(), info);
        self
    }

    /// How many times a save was requested. Test hook.
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap()
    }
}

impl Settings for InMemorySettings {
    fn nickname(&self) -> String {
        self.nickname.clone()
    }

    fn tcp_listen_port(&self) -> u16 {
        self.tcp_listen_port
    }

    fn autoconnect_count(&self) -> usize {
        self.autoconnect_count
    }

    fn network_infos(&self) -> Vec<NetworkInfo> {
        self.networks.read().unwrap().values().cloned().collect()
    }

    fn sync_network_info(&self, info: NetworkInfo) {
        self.networks
            .write()
            .unwrap()
            .insert(info.name.clone(), info);
    }

    fn sync_network_info_and_save(&self, info: NetworkInfo) {
        self.sync_network_info(info);
        *self.saves.lock().unwrap() += 1;
    }

    fn download_dir(&self) -> Option<PathBuf> {
        self.download_dir.clone()
    }
}

#[derive(Default)]
pub struct InMemoryShareIndex {
    files: RwLock<HashMap<String, IndexedFile>>,
    remote_listings: Mutex<Vec<SharedDirectoryInfo>>,
    remote_details: Mutex<Vec<SharedFileListing>>,
}

impl InMemoryShareIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, file: IndexedFile) {
        self.files
            .write()
            .unwrap()
            .insert(file.listing.full_path.clone(), file);
    }

    /// Remote listings received so far. Test hook.
    pub fn remote_listings(&self) -> Vec<SharedDirectoryInfo> {
        self.remote_listings.lock().unwrap().clone()
    }

    /// Remote file details received so far. Test hook.
    pub fn remote_details(&self) -> Vec<SharedFileListing> {
        self.remote_details.lock().unwrap().clone()
    }
}

impl ShareIndex for InMemoryShareIndex {
    fn get_directory(&self, path: &str) -> Option<SharedDirectoryInfo> {
        let files = self.files.read().unwrap();
        let prefix = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{path}/")
        };

        let matching: Vec<SharedFileListing> = files
            .values()
            .filter(|f| {
                f.listing.full_path.starts_with(&prefix)
                    && !f.listing.full_path[prefix.len()..].contains('/')
            })
            .map(|f| f.listing.clone())
            .collect();

        if matching.is_empty() && !files.keys().any(|k| k.starts_with(&prefix)) {
            return None;
        }

        let mut directories: Vec<String> = files
            .keys()
            .filter_map(|k| {
                let rest = k.strip_prefix(&prefix)?;
                let (dir, _) = rest.split_once('/')?;
                Some(format!("{prefix}{dir}"))
            })
            .collect();
        directories.sort();
        directories.dedup();

        Some(SharedDirectoryInfo {
            full_path: path.trim_end_matches('/').to_string(),
            directories,
            files: matching,
        })
    }

    fn get_file(&self, path: &str) -> Option<IndexedFile> {
        self.files.read().unwrap().get(path).cloned()
    }

    fn search(&self, query: &str) -> (Vec<SharedFileListing>, Vec<String>) {
        let needle = query.to_lowercase();
        let files: Vec<SharedFileListing> = self
            .files
            .read()
            .unwrap()
            .values()
            .filter(|f| f.listing.name.to_lowercase().contains(&needle))
            .map(|f| f.listing.clone())
            .collect();
        (files, Vec::new())
    }

    fn process_dir_listing(
        &self,
        _network_id: &str,
        _from: &NodeId,
        listing: &SharedDirectoryInfo,
    ) {
        self.remote_listings.lock().unwrap().push(listing.clone());
    }

    fn process_file_details(&self, _network_id: &str, _from: &NodeId, details: &SharedFileListing) {
        self.remote_details.lock().unwrap().push(details.clone());
    }

    fn file_count(&self) -> u64 {
        self.files.read().unwrap().len() as u64
    }

    fn byte_count(&self) -> u64 {
        self.files
            .read()
            .unwrap()
            .values()
            .map(|f| f.listing.size)
            .sum()
    }
}
