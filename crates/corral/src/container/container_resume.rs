use corral_cgroups::common::{CgroupManager, FreezerState};

use super::{Container, ContainerStatus};
use crate::error::{LibcorralError, Operation};

impl Container {
    /// Thaws a paused container. Resuming a running container does nothing.
    pub fn resume(&mut self) -> Result<(), LibcorralError> {
        self.refresh_status();
        if self.status() == ContainerStatus::Running {
            tracing::debug!(id = self.id(), "container is already running");
            return Ok(());
        }
        if !self.status().can_resume() {
            return Err(self.incorrect_status(Operation::Resume));
        }

        let manager = self.cgroup_manager()?;
        manager.freeze(FreezerState::Thawed)?;

        tracing::debug!("saving running status");
        self.set_status(ContainerStatus::Running).save()?;

        tracing::debug!("container {} resumed", self.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use anyhow::Result;
    use serial_test::serial;

    use super::*;
    use crate::test_utils::{container_config, init_process, TestFactory};

    #[test]
    #[serial]
    fn test_resume() -> Result<()> {
        let t = TestFactory::new()?;
        let cgroup = t.cgroup_dir("ct1")?;
        let mut container = t.factory.create("ct1", container_config("ct1"))?;
        container.start(init_process(&["sleep", "30"]))?;

        // already running
        container.resume()?;
        assert_eq!(container.status(), ContainerStatus::Running);

        container.pause()?;
        container.resume()?;
        assert_eq!(container.status(), ContainerStatus::Running);
        assert_eq!(fs::read_to_string(cgroup.join("cgroup.freeze"))?, "0");
        assert_eq!(t.factory.load("ct1")?.status(), ContainerStatus::Running);
        Ok(())
    }

    #[test]
    fn test_resume_created_container() -> Result<()> {
        let t = TestFactory::new()?;
        let mut container = t.factory.create("ct1", container_config("ct1"))?;

        let err = container.resume().unwrap_err();
        assert!(err.is_incorrect_status());
        Ok(())
    }
}
