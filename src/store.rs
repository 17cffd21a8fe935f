//! Persistent interface store
//!
//! A single JSON file holding two namespaces: `docker-cni-state` maps a
//! container id to its last-known OCI state, `docker-cni-add-output` maps
//! it to the recorded interface descriptor. Concurrent hook invocations
//! serialize on an exclusive lock held for the whole invocation; the data
//! file itself is replaced atomically on every write so a crashed writer
//! leaves the previous document intact.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{HookError, HookErrorCode};
use crate::oci::ContainerState;

/// Default bound on waiting for the store lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval while waiting for the lock
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Recorded container-side interface configuration
///
/// Enough to rebuild the veth pair and its addressing without re-running
/// the CNI plugin (which would allocate a fresh address).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    /// Interface name in the container netns
    pub ifname: String,

    /// Host-side veth peer name, as chosen by the original CNI plugin
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host_ifname: String,

    /// MAC address observed on the container-side interface
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,

    /// Assigned addresses, CIDR or plain form; order determines route order
    #[serde(default)]
    pub ips: Vec<String>,

    /// Routes captured from the container netns, `dst=<cidr|default> via=<gw|empty>`
    #[serde(default)]
    pub routes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreDocument {
    #[serde(rename = "docker-cni-state", default)]
    container_state: BTreeMap<String, ContainerState>,

    #[serde(rename = "docker-cni-add-output", default)]
    interface_info: BTreeMap<String, InterfaceInfo>,
}

/// Handle on the open store; the lock is held until `close` or drop
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    lock_file: Option<File>,
    doc: StoreDocument,
}

impl Store {
    /// Open the store with the default lock timeout
    pub fn open(path: &Path) -> Result<Self, HookError> {
        Self::open_with_timeout(path, DEFAULT_LOCK_TIMEOUT)
    }

    /// Open the store, waiting up to `timeout` for exclusive access
    pub fn open_with_timeout(path: &Path, timeout: Duration) -> Result<Self, HookError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                HookError::store_error(&format!(
                    "failed to create store directory: {}",
                    parent.display()
                ))
                .with_details(&e.to_string())
            })?;
        }

        let lock_file = acquire_lock(&lock_path(path), timeout)?;
        let doc = load_document(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            lock_file: Some(lock_file),
            doc,
        })
    }

    /// Release the store lock
    pub fn close(&mut self) {
        if let Some(lock) = self.lock_file.take() {
            let _ = lock.unlock();
        }
    }

    /// Record the interface descriptor for a container
    pub fn put_interface_info(&mut self, id: &str, info: &InterfaceInfo) -> Result<(), HookError> {
        let previous = self
            .doc
            .interface_info
            .insert(id.to_string(), info.clone());

        if let Err(e) = self.save() {
            restore_entry(&mut self.doc.interface_info, id, previous);
            return Err(e);
        }
        Ok(())
    }

    /// Record the OCI state for a container
    pub fn put_container_state(
        &mut self,
        id: &str,
        state: &ContainerState,
    ) -> Result<(), HookError> {
        let previous = self
            .doc
            .container_state
            .insert(id.to_string(), state.clone());

        if let Err(e) = self.save() {
            restore_entry(&mut self.doc.container_state, id, previous);
            return Err(e);
        }
        Ok(())
    }

    /// Look up the interface descriptor; absent is not an error
    pub fn get_interface_info(&self, id: &str) -> Option<&InterfaceInfo> {
        self.doc.interface_info.get(id)
    }

    /// Look up the recorded OCI state; absent is not an error
    pub fn get_container_state(&self, id: &str) -> Option<&ContainerState> {
        self.doc.container_state.get(id)
    }

    /// Remove every container not present in `alive`, atomically
    ///
    /// Returns the prior OCI state of each removed container. Interface
    /// descriptors without a matching state entry (orphans from a failed
    /// ADD) are swept as well. If the commit fails nothing is removed.
    pub fn delete_missing(
        &mut self,
        alive: &HashSet<String>,
    ) -> Result<BTreeMap<String, ContainerState>, HookError> {
        let before = self.doc.clone();

        let departed: Vec<String> = self
            .doc
            .container_state
            .keys()
            .filter(|id| !alive.contains(*id))
            .cloned()
            .collect();

        let mut removed = BTreeMap::new();
        for id in &departed {
            if let Some(state) = self.doc.container_state.remove(id) {
                removed.insert(id.clone(), state);
            }
            self.doc.interface_info.remove(id);
        }

        let orphans: Vec<String> = self
            .doc
            .interface_info
            .keys()
            .filter(|id| !self.doc.container_state.contains_key(*id))
            .cloned()
            .collect();
        for id in orphans {
            self.doc.interface_info.remove(&id);
        }

        if removed.is_empty() && self.doc.interface_info.len() == before.interface_info.len() {
            return Ok(removed);
        }

        if let Err(e) = self.save() {
            self.doc = before;
            return Err(e);
        }
        Ok(removed)
    }

    /// Number of recorded container states (test support)
    #[cfg(test)]
    pub fn container_state_len(&self) -> usize {
        self.doc.container_state.len()
    }

    /// Number of recorded interface descriptors (test support)
    #[cfg(test)]
    pub fn interface_info_len(&self) -> usize {
        self.doc.interface_info.len()
    }

    /// Persist the in-memory document with tmp-file + atomic rename
    fn save(&self) -> Result<(), HookError> {
        let tmp_path = tmp_path(&self.path);

        let json = serde_json::to_string(&self.doc).map_err(|e| {
            HookError::store_error("failed to serialize store document")
                .with_details(&e.to_string())
        })?;

        let mut file = File::create(&tmp_path).map_err(|e| {
            HookError::store_error(&format!(
                "failed to create store temp file: {}",
                tmp_path.display()
            ))
            .with_details(&e.to_string())
        })?;

        file.write_all(json.as_bytes()).map_err(|e| {
            HookError::store_error("failed to write store temp file")
                .with_details(&e.to_string())
        })?;

        file.sync_all().map_err(|e| {
            HookError::store_error("failed to sync store temp file")
                .with_details(&e.to_string())
        })?;

        fs::rename(&tmp_path, &self.path).map_err(|e| {
            HookError::store_error(&format!(
                "failed to replace store file: {}",
                self.path.display()
            ))
            .with_details(&e.to_string())
        })?;

        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.close();
    }
}

fn restore_entry<V>(map: &mut BTreeMap<String, V>, id: &str, previous: Option<V>) {
    match previous {
        Some(value) => {
            map.insert(id.to_string(), value);
        }
        None => {
            map.remove(id);
        }
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = std::ffi::OsString::new();
    if let Some(file_name) = path.file_name() {
        name.push(file_name);
    }
    name.push(".lock");
    path.with_file_name(name)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = std::ffi::OsString::from(".");
    if let Some(file_name) = path.file_name() {
        name.push(file_name);
    }
    name.push(".tmp");
    path.with_file_name(name)
}

fn acquire_lock(lock_path: &Path, timeout: Duration) -> Result<File, HookError> {
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)
        .map_err(|e| {
            HookError::store_error(&format!(
                "failed to open store lock file: {}",
                lock_path.display()
            ))
            .with_details(&e.to_string())
        })?;

    let deadline = Instant::now() + timeout;
    loop {
        match lock_file.try_lock_exclusive() {
            Ok(()) => return Ok(lock_file),
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(HookError::new(
                        HookErrorCode::StoreBusy,
                        &format!(
                            "store lock not acquired within {:?}: {}",
                            timeout,
                            lock_path.display()
                        ),
                    ));
                }
                thread::sleep(LOCK_RETRY_INTERVAL);
            }
            Err(e) => {
                return Err(HookError::store_error(&format!(
                    "failed to lock store file: {}",
                    lock_path.display()
                ))
                .with_details(&e.to_string()));
            }
        }
    }
}

fn load_document(path: &Path) -> Result<StoreDocument, HookError> {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).map_err(|e| {
            HookError::new(
                HookErrorCode::StoreCorrupt,
                &format!("store file is damaged: {}", path.display()),
            )
            .with_details(&e.to_string())
        }),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(StoreDocument::default()),
        Err(e) => Err(HookError::store_error(&format!(
            "failed to read store file: {}",
            path.display()
        ))
        .with_details(&e.to_string())),
    }
}
