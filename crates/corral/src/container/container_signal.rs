use corral_cgroups::common::{CgroupManager, FreezerState};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use super::{Container, ContainerStatus};
use crate::error::{LibcorralError, Operation};

impl Container {
    /// Sends `sig` to the init process, or to every process of the container when `all` is
    /// set. Processes that are already gone are skipped.
    pub fn signal(&mut self, sig: Signal, all: bool) -> Result<(), LibcorralError> {
        self.refresh_status();
        // just like runc, allow signalling all processes even if the container is stopped
        if !self.status().can_signal() && !(all && self.status() == ContainerStatus::Stopped) {
            return Err(self.incorrect_status(Operation::Signal));
        }

        if all {
            self.signal_all_processes(sig)
        } else {
            self.signal_init(sig)
        }
    }

    fn signal_init(&self, sig: Signal) -> Result<(), LibcorralError> {
        let pid = match self.pid() {
            Some(pid) => pid,
            None => return Err(self.incorrect_status(Operation::Signal)),
        };

        tracing::debug!(%sig, %pid, "signal init process");
        send_signal(pid, sig)
    }

    fn signal_all_processes(&self, sig: Signal) -> Result<(), LibcorralError> {
        let manager = self.cgroup_manager()?;
        // a paused container stays frozen
        let freeze = self.status() != ContainerStatus::Paused;
        if freeze {
            if let Err(err) = manager.freeze(FreezerState::Frozen) {
                tracing::warn!(id = self.id(), %err, "failed to freeze container");
            }
        }

        let pids = manager.get_all_pids();
        let sent = pids.map_err(LibcorralError::from).and_then(|pids| {
            pids.into_iter().try_for_each(|pid| {
                tracing::debug!(%sig, %pid, "signal container process");
                send_signal(pid, sig)
            })
        });

        if freeze {
            if let Err(err) = manager.freeze(FreezerState::Thawed) {
                tracing::warn!(id = self.id(), %err, "failed to thaw container");
            }
        }
        sent
    }
}

fn send_signal(pid: Pid, sig: Signal) -> Result<(), LibcorralError> {
    match signal::kill(pid, sig) {
        // the process does not exist, which is what we want
        Err(Errno::ESRCH) => Ok(()),
        res => Ok(res?),
    }
}
