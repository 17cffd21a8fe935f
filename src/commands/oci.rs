//! ADD/DEL lifecycle handling
//!
//! The fixed-IP state machine: the first ADD for a container runs the
//! real CNI plugin and records what it produced; every later ADD rebuilds
//! the recorded interface instead, so the container keeps its address.
//! DEL preserves resources; CLEAN reclaims them once the engine forgets
//! the container.

use std::io;
use std::path::Path;

use tracing::{error, info};

use crate::cli::OciArgs;
use crate::cni::{CniRunner, CniTool};
use crate::commands::{clean, DOCKER_CONTAINERS_DIR};
use crate::config::HookConfig;
use crate::error::{HookError, HookErrorCode};
use crate::logging;
use crate::network::{Backend, NetworkBackend};
use crate::oci::ContainerState;
use crate::store::Store;

/// Run a hook invocation for the `oci` subcommand
pub fn run(args: &OciArgs) -> Result<(), HookError> {
    let conf = HookConfig::load(&args.config)?;
    let _log_guard = logging::setup(&conf.log_driver, &conf.log_level)?;

    let mut store = Store::open(Path::new(&conf.store_file))?;
    let state = ContainerState::from_reader(io::stdin())?;

    // from here on, everything this process (and the runtime after it)
    // prints lands in the CNI log
    let _cni_log = logging::redirect_stdio(&conf.cni_log)?;

    let cni = CniTool::new(&conf);

    let result = match args.command.to_uppercase().as_str() {
        "ADD" => oci_add(&conf, &mut store, &cni, &state),
        "DEL" => oci_del(&conf, &cni, &state),
        other => Err(HookError::input_error(&format!(
            "unknown hook command: {}",
            other
        ))),
    };

    store.close();
    result
}

fn oci_add(
    conf: &HookConfig,
    store: &mut Store,
    cni: &dyn CniRunner,
    state: &ContainerState,
) -> Result<(), HookError> {
    if !conf.fixed_ip {
        cni.add(state)?;
        return Ok(());
    }

    let backend = Backend::for_type(&conf.cni_type)?;
    handle_fixed_add(
        conf,
        store,
        cni,
        &backend,
        Path::new(DOCKER_CONTAINERS_DIR),
        state,
    )
}

fn oci_del(
    conf: &HookConfig,
    cni: &dyn CniRunner,
    state: &ContainerState,
) -> Result<(), HookError> {
    if !conf.fixed_ip {
        return cni.del(state);
    }

    // resources stay put so the next ADD can restore them; CLEAN releases
    // them once the container is truly removed
    info!(
        "fixed-ip mode preserves CNI resources for container {}",
        state.id
    );
    Ok(())
}

/// The fixed-IP ADD path
pub(crate) fn handle_fixed_add(
    conf: &HookConfig,
    store: &mut Store,
    cni: &dyn CniRunner,
    network: &dyn NetworkBackend,
    containers_dir: &Path,
    state: &ContainerState,
) -> Result<(), HookError> {
    // best-effort preflight sweep keeps stale entries from piling up and
    // host veth name collisions unlikely
    if let Err(e) = clean::sweep(store, cni, containers_dir) {
        error!("[hook] failed to clean up: {}", e.chain());
    }

    match store.get_container_state(&state.id) {
        None => {
            // new container: run the real CNI ADD and record what it made
            let result = cni.add(state)?;
            match serde_json::to_string(&result) {
                Ok(json) => info!("CNI ADD result: {}", json),
                Err(e) => error!("failed to render CNI ADD result: {}", e),
            }

            let info = network.extract(conf, state)?;
            info!("extracted interface info: {:?}", info);

            // II first; an orphan II from a failed CS write is swept by
            // a later CLEAN
            store.put_interface_info(&state.id, &info)?;
            store.put_container_state(&state.id, state)?;
            Ok(())
        }
        Some(_) => {
            // restart of a known container: re-running the plugin would
            // allocate a fresh address, so rebuild from the record
            let info = store
                .get_interface_info(&state.id)
                .cloned()
                .ok_or_else(|| {
                    HookError::new(
                        HookErrorCode::StoreCorrupt,
                        &format!("no interface record for known container {}", state.id),
                    )
                })?;

            network.simulate_add(&info, state)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::{assert_code, sample_state, MockBackend, MockCni};

    fn fixed_conf(store_file: &Path) -> HookConfig {
        HookConfig {
            store_file: store_file.display().to_string(),
            ..HookConfig::default()
        }
    }

    fn setup() -> (tempfile::TempDir, HookConfig, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store_file = dir.path().join("store.db");
        let conf = fixed_conf(&store_file);
        let store = Store::open(&store_file).unwrap();
        (dir, conf, store)
    }

    fn containers_dir(base: &tempfile::TempDir, ids: &[&str]) -> std::path::PathBuf {
        let dir = base.path().join("containers");
        std::fs::create_dir_all(&dir).unwrap();
        for id in ids {
            std::fs::create_dir(dir.join(id)).unwrap();
        }
        dir
    }

    #[test]
    fn test_plain_add_invokes_cni_and_leaves_store_alone() {
        let (_dir, mut conf, mut store) = setup();
        conf.fixed_ip = false;
        let cni = MockCni::new();
        let state = sample_state("c1", 100);

        oci_add(&conf, &mut store, &cni, &state).unwrap();

        assert_eq!(cni.add_calls.borrow().as_slice(), ["c1"]);
        assert!(store.get_container_state("c1").is_none());
        assert!(store.get_interface_info("c1").is_none());
    }

    #[test]
    fn test_cold_fixed_add_records_state_and_interface() {
        let (dir, conf, mut store) = setup();
        let containers = containers_dir(&dir, &["c2"]);
        let cni = MockCni::new();
        let backend = MockBackend::new();
        let state = sample_state("c2", 200);

        handle_fixed_add(&conf, &mut store, &cni, &backend, &containers, &state).unwrap();

        assert_eq!(cni.add_calls.borrow().len(), 1);
        assert_eq!(*backend.extract_calls.borrow(), 1);
        assert!(backend.simulate_calls.borrow().is_empty());

        let info = store.get_interface_info("c2").unwrap();
        assert_eq!(info.ifname, "eth0");
        assert_eq!(info.host_ifname, "vethAAAA");
        assert_eq!(store.get_container_state("c2").unwrap().pid, 200);
    }

    #[test]
    fn test_second_add_reconstructs_instead_of_reinvoking() {
        let (dir, conf, mut store) = setup();
        let containers = containers_dir(&dir, &["c2"]);
        let cni = MockCni::new();
        let backend = MockBackend::new();

        let first = sample_state("c2", 200);
        handle_fixed_add(&conf, &mut store, &cni, &backend, &containers, &first).unwrap();

        // restart: same id, new pid and netns
        let second = sample_state("c2", 201);
        handle_fixed_add(&conf, &mut store, &cni, &backend, &containers, &second).unwrap();

        // exactly one real CNI ADD and one persisted record
        assert_eq!(cni.add_calls.borrow().len(), 1);
        assert_eq!(*backend.extract_calls.borrow(), 1);
        assert_eq!(store.interface_info_len(), 1);

        // the restart replayed the recorded interface
        let simulated = backend.simulate_calls.borrow();
        assert_eq!(simulated.len(), 1);
        assert_eq!(simulated[0], MockBackend::canned_info());
    }

    #[test]
    fn test_warm_add_without_interface_record_fails() {
        let (dir, conf, mut store) = setup();
        let containers = containers_dir(&dir, &["c3"]);
        let cni = MockCni::new();
        let backend = MockBackend::new();
        let state = sample_state("c3", 300);

        store.put_container_state("c3", &state).unwrap();

        let err =
            handle_fixed_add(&conf, &mut store, &cni, &backend, &containers, &state).unwrap_err();
        assert_code(&err, HookErrorCode::StoreCorrupt);
        assert!(cni.add_calls.borrow().is_empty());
    }

    #[test]
    fn test_preflight_clean_failure_is_not_fatal() {
        let (dir, conf, mut store) = setup();
        // nonexistent containers dir makes the preflight sweep fail
        let missing = dir.path().join("no-such-dir");
        let cni = MockCni::new();
        let backend = MockBackend::new();
        let state = sample_state("c4", 400);

        handle_fixed_add(&conf, &mut store, &cni, &backend, &missing, &state).unwrap();

        assert_eq!(cni.add_calls.borrow().len(), 1);
        assert!(store.get_interface_info("c4").is_some());
    }

    #[test]
    fn test_preflight_clean_releases_departed_containers() {
        let (dir, conf, mut store) = setup();
        // c9 is recorded but no longer in the engine's directory
        let gone = sample_state("c9", 900);
        store.put_interface_info("c9", &MockBackend::canned_info()).unwrap();
        store.put_container_state("c9", &gone).unwrap();

        let containers = containers_dir(&dir, &["c5"]);
        let cni = MockCni::new();
        let backend = MockBackend::new();
        let state = sample_state("c5", 500);

        handle_fixed_add(&conf, &mut store, &cni, &backend, &containers, &state).unwrap();

        assert_eq!(cni.del_calls.borrow().as_slice(), ["c9"]);
        assert!(store.get_container_state("c9").is_none());
        assert!(store.get_container_state("c5").is_some());
    }

    #[test]
    fn test_fixed_del_is_a_noop() {
        let (_dir, conf, store) = setup();
        let cni = MockCni::new();
        let state = sample_state("c2", 200);

        oci_del(&conf, &cni, &state).unwrap();

        assert!(cni.del_calls.borrow().is_empty());
        drop(store);
    }

    #[test]
    fn test_plain_del_invokes_cni() {
        let (_dir, mut conf, _store) = setup();
        conf.fixed_ip = false;
        let cni = MockCni::new();
        let state = sample_state("c2", 200);

        oci_del(&conf, &cni, &state).unwrap();

        assert_eq!(cni.del_calls.borrow().as_slice(), ["c2"]);
    }

    #[test]
    fn test_unsupported_backend_fails_fixed_add() {
        let (_dir, mut conf, mut store) = setup();
        conf.cni_type = "flannel".to_string();
        let cni = MockCni::new();
        let state = sample_state("c6", 600);

        let err = oci_add(&conf, &mut store, &cni, &state).unwrap_err();
        assert_code(&err, HookErrorCode::UnsupportedCniType);
        assert!(cni.add_calls.borrow().is_empty());
    }
}
