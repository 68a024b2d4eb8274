use corral_cgroups::common::{CgroupManager, FreezerState};

use super::{Container, ContainerStatus};
use crate::error::{LibcorralError, Operation};

impl Container {
    /// Freezes every process of the container. The container reads as pausing until the
    /// freeze completed. Pausing a paused container does nothing.
    pub fn pause(&mut self) -> Result<(), LibcorralError> {
        self.refresh_status();
        if self.status() == ContainerStatus::Paused {
            tracing::debug!(id = self.id(), "container is already paused");
            return Ok(());
        }
        if !self.status().can_pause() || self.pid().is_none() {
            return Err(self.incorrect_status(Operation::Pause));
        }

        let manager = self.cgroup_manager()?;
        let previous = self.status();
        self.set_status(ContainerStatus::Pausing).save()?;

        if let Err(err) = manager.freeze(FreezerState::Frozen) {
            tracing::error!(id = self.id(), %err, "failed to freeze container");
            self.set_status(previous).save()?;
            return Err(err.into());
        }

        self.set_status(ContainerStatus::Paused).save()?;
        tracing::debug!("container {} paused", self.id());
        Ok(())
    }
}
