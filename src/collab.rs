//! External collaborator contracts.
//!
//! The engine orchestrates transfers; the host owns everything around them:
//! how symbolic file descriptors map to concrete paths, where success
//! notifications go, what the connectivity situation is, and the execution
//! context listener callbacks run on. Each of those is a trait here, with a
//! plain default implementation where one makes sense.

use std::path::{Path, PathBuf};

use serde::Serialize;

/// A concrete file location produced by [`PathResolver::resolve_path`].
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    /// Absolute path to the file.
    pub full_path: PathBuf,
    /// True when the path names a read-only bundled resource. Such sources
    /// can be read (request bodies) but never written (response targets).
    pub is_resource_file: bool,
}

/// Resolves symbolic file descriptors (filename + logical base-directory
/// token) into concrete filesystem paths.
///
/// `ensure_writable` is the hook for externally-enforced write permissions:
/// destinations outside the host's sandboxed storage area must be refused
/// here so the engine can surface a permission error instead of silently
/// doing nothing.
pub trait PathResolver: Send + Sync {
    /// Resolves a logical file location. The error string is host-provided
    /// detail and ends up in the validation diagnostic.
    fn resolve_path(
        &self,
        filename: &str,
        base_directory: Option<&str>,
    ) -> Result<ResolvedPath, String>;

    /// Checks that a resolved response destination may be written.
    fn ensure_writable(&self, _path: &Path) -> Result<(), String> {
        Ok(())
    }
}

/// Resolves filenames against a fixed root directory, treating the
/// base-directory token as a subdirectory name.
///
/// The plain resolver for hosts without a sandbox scheme of their own.
#[derive(Debug, Clone)]
pub struct DirectoryResolver {
    root: PathBuf,
}

impl DirectoryResolver {
    /// Creates a resolver rooted at the given directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PathResolver for DirectoryResolver {
    fn resolve_path(
        &self,
        filename: &str,
        base_directory: Option<&str>,
    ) -> Result<ResolvedPath, String> {
        let mut path = self.root.clone();
        if let Some(base) = base_directory {
            path.push(base);
        }
        path.push(filename);
        Ok(ResolvedPath {
            full_path: path,
            is_resource_file: false,
        })
    }
}

/// Receives post-success notification descriptors.
///
/// Fire-and-forget; invoked only after a fully successful, non-cancelled,
/// 2xx response. The descriptor is opaque to the engine.
pub trait NotificationSink: Send + Sync {
    /// Hands the descriptor to the host's notification machinery.
    fn post(&self, descriptor: &serde_json::Value);
}

/// A sink that drops every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifications;

impl NotificationSink for NoopNotifications {
    fn post(&self, _descriptor: &serde_json::Value) {}
}

/// Connectivity status reported by the host.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    /// Whether any network is connected or connecting.
    pub is_connected: bool,
    /// Whether the active network is metered (not Wi-Fi, typically).
    pub is_metered: bool,
}

/// Answers connectivity-status queries.
pub trait ConnectivityProbe: Send + Sync {
    /// Returns the current connectivity status.
    fn status(&self) -> ConnectionStatus;
}

/// A probe that always reports an unmetered, connected network.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl ConnectivityProbe for AlwaysOnline {
    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            is_connected: true,
            is_metered: false,
        }
    }
}

/// A unit of work posted into a delivery context.
pub type DeliveryTask = Box<dyn FnOnce() + Send + 'static>;

/// The host-owned, single-threaded execution context listener callbacks run
/// on.
///
/// The engine never invokes listeners on its own tasks: accepted deliveries
/// are posted here and run asynchronously relative to the transfer, in post
/// order, serialized among themselves by the context. A context may become
/// unavailable (host runtime shut down); `is_alive` lets the engine fall
/// back to the most recently known live context at submit time.
pub trait DeliveryContext: Send + Sync {
    /// Enqueues a task for asynchronous execution on the context.
    ///
    /// Must not run the caller's task synchronously on a transfer thread in
    /// production contexts; the delivery guarantees assume the listener runs
    /// elsewhere.
    fn post(&self, task: DeliveryTask);

    /// Whether the context can still run tasks.
    fn is_alive(&self) -> bool {
        true
    }
}
