//! Hook error types
//!
//! Every failure class maps to one stable exit code so the container
//! engine can distinguish, say, a busy store from a CNI plugin failure.

use thiserror::Error;

/// Error classes surfaced by the hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HookErrorCode {
    /// 2: Configuration file missing or malformed
    Config = 2,

    /// 3: Stdin was not a valid OCI state document, or bad CLI input
    Input = 3,

    /// 5: Miscellaneous I/O failure (container dir, CNI log, ...)
    Io = 5,

    /// 10: Store lock not acquired within the timeout
    StoreBusy = 10,

    /// 11: Store file is structurally damaged
    StoreCorrupt = 11,

    /// 12: Store read/write failure
    StoreIo = 12,

    /// 20: CNI plugin returned non-zero or unparseable output
    CniInvocation = 20,

    /// 30: Kernel-side link/address/route operation failed
    Netlink = 30,

    /// 31: A host route for a recorded IP exists on another interface
    RouteConflict = 31,

    /// 40: Cannot enter, leave, or resolve a network namespace
    Namespace = 40,

    /// 41: Sysctl write failed or was short
    SysctlWrite = 41,

    /// 42: IPv6 address recorded but host-side veth has no v6 address
    NoHostV6 = 42,

    /// 50: Configured `cni_type` has no backend implementation
    UnsupportedCniType = 50,
}

/// Hook error with class, message, and optional details
#[derive(Debug, Error)]
#[error("{msg}")]
pub struct HookError {
    code: HookErrorCode,
    msg: String,
    details: Option<String>,
}

impl HookError {
    /// Create a new hook error
    pub fn new(code: HookErrorCode, msg: &str) -> Self {
        Self {
            code,
            msg: msg.to_string(),
            details: None,
        }
    }

    /// Add details to the error
    pub fn with_details(mut self, details: &str) -> Self {
        self.details = Some(details.to_string());
        self
    }

    /// Get the error class
    pub fn code(&self) -> HookErrorCode {
        self.code
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Get the error details
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Render the full message chain for the `[hook] failed to proceed` line
    pub fn chain(&self) -> String {
        match &self.details {
            Some(details) => format!("{}: {}", self.msg, details),
            None => self.msg.clone(),
        }
    }
}

// Convenience constructors for common errors

impl HookError {
    /// Create a configuration error
    pub fn config_error(msg: &str) -> Self {
        Self::new(HookErrorCode::Config, msg)
    }

    /// Create an input error
    pub fn input_error(msg: &str) -> Self {
        Self::new(HookErrorCode::Input, msg)
    }

    /// Create an IO error
    pub fn io_error(msg: &str) -> Self {
        Self::new(HookErrorCode::Io, msg)
    }

    /// Create a store IO error
    pub fn store_error(msg: &str) -> Self {
        Self::new(HookErrorCode::StoreIo, msg)
    }

    /// Create a CNI invocation error
    pub fn cni_error(msg: &str) -> Self {
        Self::new(HookErrorCode::CniInvocation, msg)
    }

    /// Create a netlink error
    pub fn netlink_error(msg: &str) -> Self {
        Self::new(HookErrorCode::Netlink, msg)
    }

    /// Create a namespace error
    pub fn namespace_error(msg: &str) -> Self {
        Self::new(HookErrorCode::Namespace, msg)
    }
}
