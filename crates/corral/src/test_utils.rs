//! Helpers shared by the lifecycle tests: a launcher backed by plain child processes and a
//! factory rooted in a scratch directory with cgroup fixtures.
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use corral_cgroups::CgroupDriver;
use nix::unistd::Pid;
use tempfile::TempDir;

use crate::config::Config;
use crate::container::Factory;
use crate::process::{LaunchContext, LaunchError, Process, ProcessLauncher};

// the child blocks on the fifo like a real init does before executing the user program
const INIT_SCRIPT: &str = r#"while [ -e "$1" ]; do sleep 0.05; done; echo 0 > "$2"; shift 2; exec "$@""#;

#[derive(Debug, Default)]
struct LauncherState {
    children: Vec<Child>,
    skip_exec_fifo: bool,
    gate: Option<PathBuf>,
}

/// Runs `process.args` on the host. Init processes write to the exec fifo first.
#[derive(Debug, Default)]
pub struct TestLauncher {
    state: Mutex<LauncherState>,
}

impl TestLauncher {
    /// The next init process runs its command without touching the exec fifo.
    pub fn skip_exec_fifo(&self) {
        self.lock().skip_exec_fifo = true;
    }

    /// Init processes wait for `release_exec_fifo` before writing to the exec fifo.
    pub fn hold_exec_fifo(&self) {
        let gate = std::env::temp_dir().join(format!("corral-gate-{}", std::process::id()));
        if fs::write(&gate, "").is_ok() {
            self.lock().gate = Some(gate);
        }
    }

    pub fn release_exec_fifo(&self) {
        if let Some(gate) = self.lock().gate.take() {
            let _ = fs::remove_file(gate);
        }
    }

    /// Pids of the launched processes, oldest first.
    pub fn pids(&self) -> Vec<Pid> {
        self.lock()
            .children
            .iter()
            .map(|child| Pid::from_raw(child.id() as i32))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LauncherState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProcessLauncher for TestLauncher {
    fn launch(&self, ctx: &LaunchContext<'_>) -> Result<Pid, LaunchError> {
        let process = ctx.process;
        if process.args.is_empty() {
            return Err(LaunchError::NoCommand);
        }

        let mut state = self.lock();
        let mut command = if process.init && !state.skip_exec_fifo {
            let gate = state
                .gate
                .clone()
                .unwrap_or_else(|| PathBuf::from("/nonexistent-gate"));
            let mut command = Command::new("sh");
            command
                .arg("-c")
                .arg(INIT_SCRIPT)
                .arg("sh")
                .arg(gate)
                .arg(ctx.exec_fifo)
                .args(&process.args);
            command
        } else {
            let mut command = Command::new(&process.args[0]);
            command.args(&process.args[1..]);
            command
        };
        state.skip_exec_fifo = false;

        let stdio = |fd: &Option<std::os::fd::OwnedFd>| -> Result<Stdio, LaunchError> {
            match fd {
                Some(fd) => Ok(Stdio::from(fd.try_clone().map_err(|err| {
                    LaunchError::Spawn {
                        command: process.command(),
                        source: err,
                    }
                })?)),
                None => Ok(Stdio::null()),
            }
        };
        command
            .stdin(stdio(&process.stdin)?)
            .stdout(stdio(&process.stdout)?)
            .stderr(stdio(&process.stderr)?);

        let child = command.spawn().map_err(|err| LaunchError::Spawn {
            command: process.command(),
            source: err,
        })?;
        let pid = Pid::from_raw(child.id() as i32);
        state.children.push(child);
        Ok(pid)
    }
}

impl Drop for TestLauncher {
    fn drop(&mut self) {
        self.release_exec_fifo();
        for child in &mut self.lock().children {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// A factory with its state root and cgroup root in one scratch directory.
pub struct TestFactory {
    pub tmp: TempDir,
    pub launcher: Arc<TestLauncher>,
    pub factory: Factory,
}

impl TestFactory {
    pub fn new() -> Result<Self> {
        let tmp = tempfile::tempdir()?;
        let launcher = Arc::new(TestLauncher::default());
        fs::create_dir(tmp.path().join("cgroup"))?;
        let factory = Factory::new(tmp.path().join("state"), launcher.clone())
            .with_cgroup_root(tmp.path().join("cgroup"));

        Ok(Self {
            tmp,
            launcher,
            factory,
        })
    }

    pub fn state_root(&self) -> PathBuf {
        self.tmp.path().join("state")
    }

    pub fn cgroup_root(&self) -> PathBuf {
        self.tmp.path().join("cgroup")
    }

    /// Creates the files a unified hierarchy provides for the cgroup of `id`. The freezer
    /// reports every freeze as completed.
    pub fn cgroup_dir(&self, id: &str) -> Result<PathBuf> {
        let root = self.cgroup_root();
        set_fixture(&root, "cgroup.controllers", "")?;
        set_fixture(&root, "cgroup.subtree_control", "")?;

        let dir = root.join(id);
        fs::create_dir_all(&dir)?;
        for (file, content) in [
            ("cgroup.procs", ""),
            ("cgroup.freeze", "0"),
            ("cgroup.events", "populated 1\nfrozen 1\n"),
            ("pids.max", ""),
        ] {
            set_fixture(&dir, file, content)?;
        }
        Ok(dir)
    }
}

pub fn set_fixture(dir: &Path, file: &str, content: &str) -> Result<PathBuf> {
    let path = dir.join(file);
    fs::write(&path, content).with_context(|| format!("failed to write {path:?}"))?;
    Ok(path)
}

/// A config as produced by the translator for a bundle at `/srv/bundle`, with its cgroup named
/// after the container.
pub fn container_config(id: &str) -> Config {
    let mut config = Config {
        rootfs: PathBuf::from("/srv/bundle/rootfs"),
        hostname: id.to_owned(),
        labels: vec!["bundle=/srv/bundle".to_owned()],
        version: "1.0".to_owned(),
        ..Default::default()
    };
    if let Ok(path) = CgroupDriver::CgroupFs.resolve("", id) {
        config.cgroups.path = path;
    }
    config
}

pub fn init_process(args: &[&str]) -> Process {
    Process {
        args: args.iter().map(|arg| arg.to_string()).collect(),
        init: true,
        ..Default::default()
    }
}

/// Polls `condition` for up to five seconds.
pub fn wait_for<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
