//! Registry of running step processes
//!
//! Every spawned step registers here for the lifetime of its process so an
//! interrupt can take the whole tree down instead of leaving orphans.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exit code used when the tool is interrupted by a signal
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

struct ActiveProcess {
    label: String,
    pid: Option<u32>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    processes: Mutex<HashMap<u64, ActiveProcess>>,
}

/// Shared set of live step processes
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<RegistryInner>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a process until the returned guard is dropped
    pub fn register(
        &self,
        label: impl Into<String>,
        pid: Option<u32>,
        cancel: CancellationToken,
    ) -> ProcessGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let label = label.into();
        debug!(id, %label, ?pid, "Registered process");
        self.lock().insert(id, ActiveProcess { label, pid, cancel });
        ProcessGuard {
            registry: self.clone(),
            id,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.lock().values().map(|p| p.label.clone()).collect();
        labels.sort();
        labels
    }

    /// Cancel and kill every registered process, returning how many there were
    pub fn terminate_all(&self) -> usize {
        let processes: Vec<(String, Option<u32>, CancellationToken)> = self
            .lock()
            .values()
            .map(|p| (p.label.clone(), p.pid, p.cancel.clone()))
            .collect();

        for (label, pid, cancel) in &processes {
            debug!(%label, ?pid, "Terminating process");
            cancel.cancel();
            if let Some(pid) = pid {
                kill_process_tree(*pid);
            }
        }
        processes.len()
    }

    fn unregister(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ActiveProcess>> {
        // A panic while holding the lock leaves the map itself consistent
        self.inner
            .processes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Unregisters its process on drop
pub struct ProcessGuard {
    registry: ProcessRegistry,
    id: u64,
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

/// Kill a step's whole process group
#[cfg(unix)]
pub fn kill_process_tree(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(pid, "killpg failed: {}", e);
    }
}

/// Without process groups the child handle's own kill is all there is
#[cfg(not(unix))]
pub fn kill_process_tree(_pid: u32) {}

/// Terminate every registered process and exit on ctrl-c or SIGTERM
pub fn install_shutdown_hook(registry: ProcessRegistry) -> JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let killed = registry.terminate_all();
        warn!(killed, "Interrupted, terminated running steps");
        std::process::exit(INTERRUPTED_EXIT_CODE);
    })
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        debug!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c() => debug!("Received SIGINT"),
                _ = sigterm.recv() => debug!("Received SIGTERM"),
            }
        }
        Err(e) => {
            debug!("Failed to install SIGTERM handler: {}", e);
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_unregisters_on_drop() {
        let registry = ProcessRegistry::new();
        let guard = registry.register("lint", None, CancellationToken::new());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.labels(), vec!["lint".to_string()]);

        drop(guard);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_terminate_all_cancels_tokens() {
        let registry = ProcessRegistry::new();
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        let _ga = registry.register("a", None, a.clone());
        let _gb = registry.register("b", None, b.clone());

        assert_eq!(registry.terminate_all(), 2);
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_all_kills_live_children() {
        use crate::executor::{StepExecutor, StepOptions, GENERIC_FAILURE_EXIT_CODE};
        use std::time::{Duration, Instant};

        let registry = ProcessRegistry::new();
        let executor = StepExecutor::with_registry(registry.clone());
        let started = Instant::now();
        let step = tokio::spawn(async move {
            executor
                .run("sleep 10", &StepOptions::new(std::env::temp_dir()))
                .await
        });

        while registry.is_empty() {
            assert!(started.elapsed() < Duration::from_secs(5), "step never registered");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(registry.terminate_all(), 1);

        let out = step.await.unwrap().unwrap();
        assert!(out.terminated);
        assert_eq!(out.exit_code, GENERIC_FAILURE_EXIT_CODE);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clones_share_state() {
        let registry = ProcessRegistry::new();
        let other = registry.clone();
        let _guard = other.register("build", None, CancellationToken::new());
        assert_eq!(registry.len(), 1);
    }
}
