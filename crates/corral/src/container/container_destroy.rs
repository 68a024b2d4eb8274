use std::fs;

use corral_cgroups::common::CgroupManager;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};

use super::{Container, ContainerStatus};
use crate::error::{LibcorralError, Operation};

impl Container {
    /// Removes the cgroup and every file of the container. A running container has to be
    /// signalled and a paused one resumed first. Destroying twice is not an error.
    pub fn destroy(&mut self) -> Result<(), LibcorralError> {
        if !self.root.exists() {
            tracing::debug!(id = self.id(), "container is already destroyed");
            self.set_status(ContainerStatus::Stopped);
            return Ok(());
        }

        self.refresh_status();
        if !self.status().can_destroy() {
            return Err(self.incorrect_status(Operation::Destroy));
        }

        // an init process still waiting on the exec fifo never ran the user program
        if let Some(pid) = self.pid() {
            if self.status() == ContainerStatus::Created {
                match signal::kill(pid, Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }

        let manager = self.cgroup_manager()?;
        if manager.exists() {
            self.check_cgroup_result(manager.remove())?;
        }

        fs::remove_dir_all(&self.root).map_err(|err| {
            tracing::error!(root = ?self.root, %err, "failed to remove container directory");
            LibcorralError::OtherIO {
                op: "remove container directory",
                path: self.root.to_owned(),
                source: err,
            }
        })?;

        self.set_status(ContainerStatus::Stopped);
        tracing::debug!("container {} destroyed", self.id());
        Ok(())
    }
}
