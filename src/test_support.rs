//! Shared doubles for unit tests: delivery contexts, a recording listener,
//! and collaborator stand-ins.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, mpsc};

use tokio::sync::Notify;

use crate::callback::RequestListener;
use crate::collab::{DeliveryContext, DeliveryTask, NotificationSink, PathResolver, ResolvedPath};
use crate::state::{Phase, RequestEvent};

/// Context that runs every posted task immediately on the posting thread.
///
/// Only suitable for tests: production contexts must run listeners off the
/// transfer task.
pub(crate) struct InlineContext;

impl DeliveryContext for InlineContext {
    fn post(&self, task: DeliveryTask) {
        task();
    }
}

/// Single-threaded queue context: tasks run in post order on one background
/// thread, like a host event loop.
pub(crate) struct QueueContext {
    sender: Mutex<Option<mpsc::Sender<DeliveryTask>>>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl QueueContext {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = mpsc::channel::<DeliveryTask>();
        let worker = std::thread::spawn(move || {
            while let Ok(task) = receiver.recv() {
                task();
            }
        });
        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }
}

impl DeliveryContext for QueueContext {
    fn post(&self, task: DeliveryTask) {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = guard.as_ref() {
            let _ = sender.send(task);
        }
    }

    fn is_alive(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Drop for QueueContext {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = worker.join();
        }
    }
}

/// Captures delivered events and signals when the terminal one arrives.
pub(crate) struct Recorder {
    events: Arc<Mutex<Vec<RequestEvent>>>,
    ended: Arc<Notify>,
}

impl Recorder {
    pub(crate) fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            ended: Arc::new(Notify::new()),
        }
    }

    pub(crate) fn listener(&self) -> Box<dyn RequestListener> {
        let events = Arc::clone(&self.events);
        let ended = Arc::clone(&self.ended);
        Box::new(move |event: RequestEvent| {
            let is_final = event.phase == Phase::Ended;
            events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event);
            if is_final {
                ended.notify_one();
            }
        })
    }

    pub(crate) fn events(&self) -> Vec<RequestEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Waits until the `ended` snapshot has been delivered.
    pub(crate) async fn wait_ended(&self) {
        self.ended.notified().await;
    }
}

/// Resolver rooted at a test directory, with switches for the failure modes
/// validation must surface.
pub(crate) struct TestResolver {
    pub(crate) root: PathBuf,
    pub(crate) resource_files: bool,
    pub(crate) deny_write: bool,
}

impl TestResolver {
    pub(crate) fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            resource_files: false,
            deny_write: false,
        }
    }
}

impl PathResolver for TestResolver {
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
            is_resource_file: self.resource_files,
        })
    }

    fn ensure_writable(&self, path: &Path) -> Result<(), String> {
        if self.deny_write {
            Err(format!("write access denied for {}", path.display()))
        } else {
            Ok(())
        }
    }
}

/// Notification sink that records posted descriptors.
#[derive(Default)]
pub(crate) struct RecordingNotifications {
    posted: Mutex<Vec<serde_json::Value>>,
}

impl RecordingNotifications {
    pub(crate) fn posted(&self) -> Vec<serde_json::Value> {
        self.posted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl NotificationSink for RecordingNotifications {
    fn post(&self, descriptor: &serde_json::Value) {
        self.posted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(descriptor.clone());
    }
}
