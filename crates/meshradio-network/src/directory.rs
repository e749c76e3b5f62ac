//! Local discovery directory
//!
//! When no rendezvous server is reachable, nodes that share a directory
//! announce themselves in it and try to reach every other live entry. The
//! store is a JSON list of `{id, timestamp}` records, updated by
//! read-append-prune-write with no cross-instance locking.
//!
//! Backends may also offer a [`SignalMailbox`] so negotiation messages can
//! travel between nodes while the rendezvous is down.

use crate::error::{NetworkError, Result};
use meshradio_protocol::{announce_and_prune, live_peers, NodeId, PeerRecord, SignalMessage};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Shared store of discovery records
#[async_trait::async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn read(&self) -> Result<Vec<PeerRecord>>;

    async fn write(&self, records: &[PeerRecord]) -> Result<()>;

    /// Negotiation relay, if this backend has one
    fn mailbox(&self) -> Option<&dyn SignalMailbox> {
        None
    }

    fn describe(&self) -> String;
}

/// Store-and-forward relay for negotiation messages
#[async_trait::async_trait]
pub trait SignalMailbox: Send + Sync {
    /// Leave `message` for its target
    async fn post(&self, message: &SignalMessage) -> Result<()>;

    /// Remove and return everything waiting for `recipient`
    async fn take(&self, recipient: &NodeId) -> Result<Vec<SignalMessage>>;
}

/// Announce `local` in the directory and return the other live nodes
pub async fn announce(
    directory: &dyn PeerDirectory,
    local: &NodeId,
    now: u64,
    window_ms: u64,
) -> Result<Vec<NodeId>> {
    let records = directory.read().await?;
    let records = announce_and_prune(records, local, now, window_ms);
    directory.write(&records).await?;
    Ok(live_peers(&records, local, now, window_ms))
}

fn mailbox_target(message: &SignalMessage) -> Result<&NodeId> {
    message.target().ok_or_else(|| {
        NetworkError::Directory(format!("{} has no target", message.type_name()))
    })
}

/// Directory held in memory, shareable between nodes of one process
#[derive(Default)]
pub struct MemoryDirectory {
    records: RwLock<Vec<PeerRecord>>,
    mailbox: RwLock<HashMap<NodeId, Vec<SignalMessage>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PeerDirectory for MemoryDirectory {
    async fn read(&self) -> Result<Vec<PeerRecord>> {
        Ok(self.records.read().await.clone())
    }

    async fn write(&self, records: &[PeerRecord]) -> Result<()> {
        *self.records.write().await = records.to_vec();
        Ok(())
    }

    fn mailbox(&self) -> Option<&dyn SignalMailbox> {
        Some(self)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[async_trait::async_trait]
impl SignalMailbox for MemoryDirectory {
    async fn post(&self, message: &SignalMessage) -> Result<()> {
        let target = mailbox_target(message)?.clone();
        self.mailbox
            .write()
            .await
            .entry(target)
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn take(&self, recipient: &NodeId) -> Result<Vec<SignalMessage>> {
        Ok(self
            .mailbox
            .write()
            .await
            .remove(recipient)
            .unwrap_or_default())
    }
}

/// Directory kept in a JSON file that several nodes on one host share
///
/// The mailbox lives next to it in `<file>.mailbox`.
pub struct FileDirectory {
    path: PathBuf,
    mailbox_path: PathBuf,
    // Serializes read-modify-write cycles within this process
    mailbox_lock: tokio::sync::Mutex<()>,
}

impl FileDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut mailbox_path = path.clone().into_os_string();
        mailbox_path.push(".mailbox");
        FileDirectory {
            path,
            mailbox_path: PathBuf::from(mailbox_path),
            mailbox_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_mailbox(&self) -> Result<BTreeMap<NodeId, Vec<SignalMessage>>> {
        Ok(read_json(&self.mailbox_path).await?.unwrap_or_default())
    }
}

/// Read a JSON document, treating a missing or corrupt file as absent
async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!("Ignoring corrupt directory file {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

/// Replace `path` atomically with `value` as JSON
async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let mut tmp = path.to_path_buf().into_os_string();
    tmp.push(format!(".{}.tmp", std::process::id()));
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, serde_json::to_vec(value)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait::async_trait]
impl PeerDirectory for FileDirectory {
    async fn read(&self) -> Result<Vec<PeerRecord>> {
        Ok(read_json(&self.path).await?.unwrap_or_default())
    }

    async fn write(&self, records: &[PeerRecord]) -> Result<()> {
        write_json(&self.path, &records).await?;
        debug!("Wrote {} discovery record(s) to {}", records.len(), self.path.display());
        Ok(())
    }

    fn mailbox(&self) -> Option<&dyn SignalMailbox> {
        Some(self)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[async_trait::async_trait]
impl SignalMailbox for FileDirectory {
    async fn post(&self, message: &SignalMessage) -> Result<()> {
        let target = mailbox_target(message)?.clone();
        let _guard = self.mailbox_lock.lock().await;
        let mut mailbox = self.read_mailbox().await?;
        mailbox.entry(target).or_default().push(message.clone());
        write_json(&self.mailbox_path, &mailbox).await
    }

    async fn take(&self, recipient: &NodeId) -> Result<Vec<SignalMessage>> {
        let _guard = self.mailbox_lock.lock().await;
        let mut mailbox = self.read_mailbox().await?;
        let Some(messages) = mailbox.remove(recipient) else {
            return Ok(Vec::new());
        };
        write_json(&self.mailbox_path, &mailbox).await?;
        Ok(messages)
    }
}
