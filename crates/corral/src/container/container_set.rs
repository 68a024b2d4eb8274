use corral_cgroups::common::CgroupManager;

use super::{Container, ContainerStatus};
use crate::config::Config;
use crate::error::{LibcorralError, Operation};

impl Container {
    /// Applies the resource limits of `config` to the running container and keeps it as the
    /// new configuration. `None` applies the stored configuration again.
    pub fn set(&mut self, config: Option<Config>) -> Result<(), LibcorralError> {
        // may race with destroy
        if !self.root.exists() {
            return Err(LibcorralError::NotFound(self.id().to_owned()));
        }

        self.refresh_status();
        if self.status() == ContainerStatus::Stopped {
            return Err(self.incorrect_status(Operation::Set));
        }

        let manager = self.cgroup_manager()?;
        let resources = match &config {
            Some(config) => &config.cgroups.resources,
            None => &self.config.cgroups.resources,
        };
        self.check_cgroup_result(manager.apply(resources))?;

        if let Some(config) = config {
            config.save(&self.root)?;
            self.config = config;
        }

        tracing::debug!(id = self.id(), "container resources updated");
        Ok(())
    }
}
