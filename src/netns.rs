//! Network namespace operations
//!
//! Scoped entry into a container's network namespace with guaranteed
//! return to the host namespace on every exit path.

use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};

use nix::sched::{setns, CloneFlags};
use tracing::error;

use crate::error::HookError;

/// Guard that saves the current network namespace and restores it on drop
///
/// The saved descriptor doubles as a handle on the host namespace, so
/// links can be pushed back out while inside the container namespace.
#[derive(Debug)]
pub struct NetnsGuard {
    original_ns: File,
}

impl NetnsGuard {
    /// Enter a network namespace, saving the current one for restoration
    pub fn enter(netns_path: &str) -> Result<Self, HookError> {
        let original_ns = File::open("/proc/self/ns/net").map_err(|e| {
            HookError::namespace_error("failed to open current network namespace")
                .with_details(&e.to_string())
        })?;

        let target_ns = File::open(netns_path).map_err(|e| {
            HookError::namespace_error(&format!(
                "failed to open target network namespace: {}",
                netns_path
            ))
            .with_details(&e.to_string())
        })?;

        setns(target_ns.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| {
            HookError::namespace_error(&format!(
                "failed to enter network namespace: {}",
                netns_path
            ))
            .with_details(&e.to_string())
        })?;

        Ok(Self { original_ns })
    }

    /// Raw descriptor of the host namespace this guard came from
    pub fn host_fd(&self) -> RawFd {
        self.original_ns.as_raw_fd()
    }

    /// Restore the original namespace, consuming the guard
    pub fn restore(self) -> Result<(), HookError> {
        setns(self.original_ns.as_raw_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| {
            HookError::namespace_error("failed to restore original network namespace")
                .with_details(&e.to_string())
        })?;
        // Drop must not restore a second time
        std::mem::forget(self);
        Ok(())
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        // A process stranded in a foreign namespace would corrupt every
        // operation that follows; failing to return is fatal.
        if setns(self.original_ns.as_raw_fd(), CloneFlags::CLONE_NEWNET).is_err() {
            error!("failed to restore the host network namespace, aborting");
            std::process::abort();
        }
    }
}

/// Execute a closure inside a network namespace
///
/// The closure receives the guard so it can reach the host namespace
/// descriptor (for pushing links back out). The host namespace is
/// restored on every exit path, including panics.
pub fn with_netns<T, F>(netns_path: &str, f: F) -> Result<T, HookError>
where
    F: FnOnce(&NetnsGuard) -> Result<T, HookError>,
{
    let guard = NetnsGuard::enter(netns_path)?;
    let result = f(&guard);
    guard.restore()?;
    result
}
