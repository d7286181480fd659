use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// A started worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerHandle {
    pub worker_id: usize,
    pub pid: Option<u32>,
}

/// Trait for starting and stopping worker processes
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, worker_id: usize) -> Result<WorkerHandle>;

    /// Stop a worker if it is still running
    fn terminate(&self, handle: WorkerHandle) -> Result<()>;
}

/// Spawns `<exe> worker --id N` child processes
pub struct ProcessLauncher {
    exe: PathBuf,
    config_path: Option<PathBuf>,
    children: Mutex<HashMap<usize, Child>>,
}

impl ProcessLauncher {
    pub fn new(exe: PathBuf, config_path: Option<PathBuf>) -> Self {
        Self {
            exe,
            config_path,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Launch workers from the running binary
    pub fn from_current_exe(config_path: Option<PathBuf>) -> Result<Self> {
        let exe = std::env::current_exe().context("Failed to locate the current executable")?;
        Ok(Self::new(exe, config_path))
    }

    fn command_for(&self, worker_id: usize) -> Command {
        let mut command = Command::new(&self.exe);
        command.arg("worker").arg("--id").arg(worker_id.to_string());
        if let Some(path) = &self.config_path {
            command.arg("--config").arg(path);
        }
        command.stdin(Stdio::null());
        command
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, worker_id: usize) -> Result<WorkerHandle> {
        let child = self
            .command_for(worker_id)
            .spawn()
            .context(format!("Failed to execute: {}", self.exe.display()))?;
        let pid = child.id();
        info!(worker = worker_id, pid, "worker process started");

        let mut children = self.children.lock().unwrap();
        if let Some(mut previous) = children.insert(worker_id, child) {
            warn!(worker = worker_id, "replacing a worker process that was still tracked");
            let _ = previous.kill();
            let _ = previous.wait();
        }
        Ok(WorkerHandle {
            worker_id,
            pid: Some(pid),
        })
    }

    fn terminate(&self, handle: WorkerHandle) -> Result<()> {
        let Some(mut child) = self.children.lock().unwrap().remove(&handle.worker_id) else {
            return Ok(());
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(worker = handle.worker_id, %status, "worker already exited");
                Ok(())
            }
            Ok(None) => {
                child
                    .kill()
                    .context(format!("Failed to kill worker {}", handle.worker_id))?;
                let _ = child.wait();
                debug!(worker = handle.worker_id, "worker process killed");
                Ok(())
            }
            Err(e) => Err(e).context(format!("Failed to check worker {}", handle.worker_id)),
        }
    }
}

impl Drop for ProcessLauncher {
    fn drop(&mut self) {
        let children = self.children.get_mut().map(std::mem::take).unwrap_or_default();
        for (_, mut child) in children {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// For workers started elsewhere; launching only hands out ids
#[derive(Debug, Default)]
pub struct NoopLauncher;

impl WorkerLauncher for NoopLauncher {
    fn launch(&self, worker_id: usize) -> Result<WorkerHandle> {
        Ok(WorkerHandle {
            worker_id,
            pid: None,
        })
    }

    fn terminate(&self, _handle: WorkerHandle) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_command_line() {
        let launcher = ProcessLauncher::new(PathBuf::from("/bin/gaussnet"), Some(PathBuf::from("net.json")));
        let command = launcher.command_for(3);
        let args: Vec<_> = command.get_args().map(|a| a.to_string_lossy().into_owned()).collect();

        assert_eq!(command.get_program(), "/bin/gaussnet");
        assert_eq!(args, vec!["worker", "--id", "3", "--config", "net.json"]);
    }

    #[test]
    fn test_missing_executable_fails_to_launch() {
        let launcher = ProcessLauncher::new(PathBuf::from("/nonexistent/gaussnet-worker"), None);
        let err = launcher.launch(0).unwrap_err();
        assert!(err.to_string().contains("Failed to execute"));
    }

    #[test]
    fn test_terminate_unknown_worker_is_ok() {
        let launcher = ProcessLauncher::new(PathBuf::from("/bin/true"), None);
        assert!(launcher
            .terminate(WorkerHandle {
                worker_id: 9,
                pid: None,
            })
            .is_ok());
    }

    #[test]
    fn test_noop_launcher() {
        let handle = NoopLauncher.launch(2).unwrap();
        assert_eq!(handle.worker_id, 2);
        assert!(handle.pid.is_none());
        assert!(NoopLauncher.terminate(handle).is_ok());
    }
}
