//! CLEAN sweep
//!
//! Reconciles the store against the container engine's on-disk container
//! directory: every recorded container that no longer exists there has
//! its entries removed and its CNI resources released.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use tracing::{error, info};

use crate::cli::CleanArgs;
use crate::cni::{CniRunner, CniTool};
use crate::commands::DOCKER_CONTAINERS_DIR;
use crate::config::HookConfig;
use crate::error::HookError;
use crate::logging;
use crate::store::Store;

/// Run the `clean` subcommand
pub fn run(args: &CleanArgs) -> Result<(), HookError> {
    let conf = HookConfig::load(&args.config)?;
    let _log_guard = logging::setup(&conf.log_driver, &conf.log_level)?;

    let mut store = Store::open(Path::new(&conf.store_file))?;
    let cni = CniTool::new(&conf);

    info!("running clean sweep");
    let result = sweep(&mut store, &cni, Path::new(DOCKER_CONTAINERS_DIR));
    store.close();
    result
}

/// Remove state for departed containers and release their CNI resources
///
/// Store removal is transactional; the per-container CNI DEL that follows
/// is best-effort. One stuck container must not block cleanup of the
/// rest, so the first DEL error is remembered and returned after the
/// whole sweep ran.
pub fn sweep(
    store: &mut Store,
    cni: &dyn CniRunner,
    containers_dir: &Path,
) -> Result<(), HookError> {
    let alive = list_container_ids(containers_dir)?;
    let removed = store.delete_missing(&alive)?;

    let mut first_error = None;
    for (id, state) in removed {
        info!("cleaning up CNI resources for container {}", id);
        if let Err(e) = cni.del(&state) {
            error!(
                "failed to clean up container {}'s CNI resources: {}",
                id,
                e.chain()
            );
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Live container ids: the immediate subdirectory names of the engine dir
fn list_container_ids(containers_dir: &Path) -> Result<HashSet<String>, HookError> {
    let entries = fs::read_dir(containers_dir).map_err(|e| {
        HookError::io_error(&format!(
            "failed to read container directory: {}",
            containers_dir.display()
        ))
        .with_details(&e.to_string())
    })?;

    let mut ids = HashSet::new();
    for entry in entries.filter_map(|entry| entry.ok()) {
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir {
            ids.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }

    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::{assert_code, sample_state, MockBackend, MockCni};
    use crate::error::HookErrorCode;

    fn seeded_store(dir: &Path, ids: &[(&str, i32)]) -> Store {
        let mut store = Store::open(&dir.join("store.db")).unwrap();
        for (id, pid) in ids {
            store
                .put_interface_info(id, &MockBackend::canned_info())
                .unwrap();
            store
                .put_container_state(id, &sample_state(id, *pid))
                .unwrap();
        }
        store
    }

    fn containers_dir(base: &Path, ids: &[&str]) -> std::path::PathBuf {
        let dir = base.join("containers");
        fs::create_dir_all(&dir).unwrap();
        for id in ids {
            fs::create_dir(dir.join(id)).unwrap();
        }
        dir
    }

    #[test]
    fn test_sweep_releases_departed_container() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded_store(dir.path(), &[("c1", 1), ("c2", 2), ("c3", 3)]);
        let containers = containers_dir(dir.path(), &["c1", "c3"]);
        let cni = MockCni::new();

        sweep(&mut store, &cni, &containers).unwrap();

        // exactly one DEL, for the departed container, with its stored pid
        assert_eq!(cni.del_calls.borrow().as_slice(), ["c2"]);
        assert!(store.get_container_state("c2").is_none());
        assert!(store.get_interface_info("c2").is_none());
        assert!(store.get_container_state("c1").is_some());
        assert!(store.get_interface_info("c3").is_some());
    }

    #[test]
    fn test_sweep_continues_past_del_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = seeded_store(dir.path(), &[("c1", 1), ("c2", 2), ("c4", 4)]);
        let containers = containers_dir(dir.path(), &["c1"]);
        let cni = MockCni::failing_del("c2");

        let err = sweep(&mut store, &cni, &containers).unwrap_err();
        assert_code(&err, HookErrorCode::CniInvocation);

        // both departed containers saw a DEL attempt
        assert_eq!(cni.del_calls.borrow().len(), 2);
        // and the failing one is still gone from the store
        assert!(store.get_container_state("c2").is_none());
        assert!(store.get_container_state("c4").is_none());
    }

    #[test]
    fn test_sweep_with_nothing_recorded_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(&dir.path().join("store.db")).unwrap();
        let containers = containers_dir(dir.path(), &["c1"]);
        let cni = MockCni::new();

        sweep(&mut store, &cni, &containers).unwrap();
        assert!(cni.del_calls.borrow().is_empty());
    }

    #[test]
    fn test_sweep_missing_engine_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(&dir.path().join("store.db")).unwrap();
        let cni = MockCni::new();

        let err = sweep(&mut store, &cni, &dir.path().join("missing")).unwrap_err();
        assert_code(&err, HookErrorCode::Io);
    }

    #[test]
    fn test_list_container_ids_skips_files() {
        let dir = tempfile::tempdir().unwrap();
        let containers = containers_dir(dir.path(), &["c1", "c2"]);
        fs::write(containers.join("stray-file"), "x").unwrap();

        let ids = list_container_ids(&containers).unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("c1"));
        assert!(ids.contains("c2"));
    }
}
