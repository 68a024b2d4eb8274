use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use corral_cgroups::common::CgroupManager;
use nix::sys::signal::{self, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{self, Pid};

use super::container::process_alive;
use super::{Container, ContainerStatus};
use crate::error::{LibcorralError, Operation};
use crate::process::{LaunchContext, Process};

pub const EXEC_FIFO: &str = "exec.fifo";

impl Container {
    /// Starts `process` in the container. The init process is released from the exec fifo
    /// before this returns, any other process joins the running container.
    pub fn start(&mut self, process: Process) -> Result<(), LibcorralError> {
        self.launch(process, Operation::Start)
    }

    /// Like `start`, but returns as soon as the init process is launched. The exec fifo is
    /// opened from a background thread.
    pub fn run(&mut self, process: Process) -> Result<(), LibcorralError> {
        self.launch(process, Operation::Run)
    }

    fn launch(&mut self, process: Process, op: Operation) -> Result<(), LibcorralError> {
        self.refresh_status();
        let allowed = if process.init {
            self.status().can_start() && self.state.pid.is_none()
        } else {
            self.status() == ContainerStatus::Running
        };
        if !allowed {
            return Err(self.incorrect_status(op));
        }

        let init = process.init;
        let exec_fifo = self.root.join(EXEC_FIFO);
        if init {
            unistd::mkfifo(&exec_fifo, Mode::from_bits_truncate(0o622))?;
        }

        let launched = {
            let ctx = LaunchContext {
                id: self.id(),
                config: &self.config,
                process: &process,
                exec_fifo: &exec_fifo,
            };
            self.launcher.launch(&ctx)
        };
        // closes the descriptors handed to the process
        drop(process);
        let pid = match launched {
            Ok(pid) => pid,
            Err(err) => {
                tracing::error!(id = self.id(), %err, "failed to launch process");
                if init {
                    remove_exec_fifo(&exec_fifo);
                }
                return Err(err.into());
            }
        };
        tracing::debug!(id = self.id(), %pid, init, "process launched");

        if let Err(err) = self.join_cgroup(pid, init) {
            if let Err(kill_err) = signal::kill(pid, Signal::SIGKILL) {
                tracing::warn!(%pid, err = %kill_err, "failed to kill process");
            }
            if init {
                remove_exec_fifo(&exec_fifo);
            }
            return Err(err);
        }

        if !init {
            return Ok(());
        }

        self.state.pid = Some(pid.as_raw());
        self.save()?;

        if op == Operation::Run {
            let id = self.id().to_owned();
            thread::spawn(move || {
                if let Err(err) = wait_exec_fifo(&id, &exec_fifo, pid) {
                    tracing::error!(%id, %err, "failed to release init process");
                }
            });
        } else {
            wait_exec_fifo(self.id(), &exec_fifo, pid)?;
        }

        self.set_status(ContainerStatus::Running).save()?;
        tracing::debug!(id = self.id(), "container {}", op);
        Ok(())
    }

    fn join_cgroup(&self, pid: Pid, init: bool) -> Result<(), LibcorralError> {
        let manager = self.cgroup_manager()?;
        self.check_cgroup_result(manager.add_task(pid))?;
        if init {
            self.check_cgroup_result(manager.apply(&self.config.cgroups.resources))?;
        }
        Ok(())
    }
}

/// Blocks until the init process wrote to the fifo, then removes it. Fails if the process
/// exits before that.
fn wait_exec_fifo(id: &str, path: &Path, pid: Pid) -> Result<(), LibcorralError> {
    let other_io = |op, err| LibcorralError::OtherIO {
        op,
        path: PathBuf::from(path),
        source: err,
    };
    // a non blocking open of the read end succeeds before any writer shows up
    let mut fifo = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|err| other_io("open exec fifo", err))?;

    let mut buf = [0u8; 1];
    loop {
        match fifo.read(&mut buf) {
            Ok(n) if n > 0 => break,
            // no writer yet
            Ok(_) => {
                if !process_alive(pid) {
                    remove_exec_fifo(path);
                    return Err(LibcorralError::InitExited(id.to_owned()));
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => return Err(other_io("read exec fifo", err)),
        }
        thread::sleep(Duration::from_millis(10));
    }

    remove_exec_fifo(path);
    Ok(())
}

fn remove_exec_fifo(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != ErrorKind::NotFound {
            tracing::warn!(?path, %err, "failed to remove exec fifo");
        }
    }
}
