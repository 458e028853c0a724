//! Mock collaborators for testing and development.
//!
//! [`MockDomain`] simulates the hypervisor-domain capability in memory and
//! [`MockExecutor`] replays scripted tool results, so the image and snapshot
//! state machines can be exercised without libvirt, LVM, or qemu-img
//! installed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::domain::{DiskSource, Domain, SnapshotHandle};
use crate::error::{Result, StorageError};
use crate::exec::{CmdOutput, ExecError, Executor};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory stand-in for a hypervisor domain.
pub struct MockDomain {
    active: bool,
    disks: Vec<DiskSource>,
    created: Mutex<Vec<String>>,
    deletes: Arc<AtomicUsize>,
}

impl MockDomain {
    /// Create an inactive domain with no disks.
    pub fn new() -> Self {
        Self {
            active: false,
            disks: Vec::new(),
            created: Mutex::new(Vec::new()),
            deletes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Set whether the domain reports itself as running.
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Set the disk devices the domain reports.
    pub fn with_disk_sources(mut self, disks: Vec<DiskSource>) -> Self {
        self.disks = disks;
        self
    }

    /// XML fragments passed to `snapshot_create`, in call order.
    pub fn created_snapshots(&self) -> Vec<String> {
        lock(&self.created).clone()
    }

    /// Number of snapshot-handle delete calls observed so far.
    pub fn snapshot_delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

impl Default for MockDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl Domain for MockDomain {
    fn disk_sources(&self) -> Result<Vec<DiskSource>> {
        Ok(self.disks.clone())
    }

    fn is_active(&self) -> Result<bool> {
        Ok(self.active)
    }

    fn snapshot_create(&self, xml: &str) -> Result<Box<dyn SnapshotHandle>> {
        lock(&self.created).push(xml.to_string());
        Ok(Box::new(MockSnapshotHandle {
            deletes: Arc::clone(&self.deletes),
        }))
    }
}

/// Snapshot handle returned by [`MockDomain`]; counts delete calls.
struct MockSnapshotHandle {
    deletes: Arc<AtomicUsize>,
}

impl SnapshotHandle for MockSnapshotHandle {
    fn delete(&self) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// One recorded [`MockExecutor`] invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    /// Full argument vector, program first.
    pub argv: Vec<String>,
    /// Whether privilege escalation was requested.
    pub run_as_root: bool,
}

/// Executor that records calls and replays scripted results.
///
/// Results are consumed in FIFO order; once the script is exhausted every
/// further call succeeds with empty output.
pub struct MockExecutor {
    calls: Mutex<Vec<ExecCall>>,
    results: Mutex<VecDeque<std::result::Result<CmdOutput, ExecError>>>,
}

impl MockExecutor {
    /// Create an executor whose every call succeeds with empty output.
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            results: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a successful result with the given stdout.
    pub fn push_success(&self, stdout: &str) {
        lock(&self.results).push_back(Ok(CmdOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
        }));
    }

    /// Queue a nonzero-exit failure.
    pub fn push_failure(&self, status: i32, stderr: &str) {
        lock(&self.results).push_back(Err(ExecError::Failed {
            command: String::new(),
            status,
            stderr: stderr.to_string(),
        }));
    }

    /// All recorded calls, in order.
    pub fn calls(&self) -> Vec<ExecCall> {
        lock(&self.calls).clone()
    }

    /// Number of recorded calls.
    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Argument vectors of all recorded calls, flattened to strings.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .map(|call| call.argv.join(" "))
            .collect()
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for MockExecutor {
    fn execute(&self, argv: &[&str], run_as_root: bool) -> std::result::Result<CmdOutput, ExecError> {
        lock(&self.calls).push(ExecCall {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            run_as_root,
        });
        match lock(&self.results).pop_front() {
            Some(result) => result,
            None => Ok(CmdOutput::default()),
        }
    }
}

/// Domain whose snapshot handles fail to delete; used to exercise the
/// guard's failure logging.
pub struct FailingSnapshotDomain {
    inner: MockDomain,
}

impl FailingSnapshotDomain {
    /// Wrap a [`MockDomain`].
    pub fn new(inner: MockDomain) -> Self {
        Self { inner }
    }
}

impl Domain for FailingSnapshotDomain {
    fn disk_sources(&self) -> Result<Vec<DiskSource>> {
        self.inner.disk_sources()
    }

    fn is_active(&self) -> Result<bool> {
        self.inner.is_active()
    }

    fn snapshot_create(&self, _xml: &str) -> Result<Box<dyn SnapshotHandle>> {
        Ok(Box::new(FailingSnapshotHandle))
    }
}

struct FailingSnapshotHandle;

impl SnapshotHandle for FailingSnapshotHandle {
    fn delete(&self) -> Result<()> {
        Err(StorageError::Hypervisor("snapshot delete failed".into()))
    }
}
