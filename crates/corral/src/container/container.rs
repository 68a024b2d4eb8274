use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use corral_cgroups::common::{
    create_cgroup_manager, AnyCgroupManager, AnyManagerError, CgroupManager, FreezerState,
};
use corral_cgroups::systemd::client::SystemdClient;
use nix::unistd::Pid;
use procfs::process::ProcState;

use super::{ContainerStatus, State};
use crate::config::Config;
use crate::error::{LibcorralError, Operation};
use crate::process::ProcessLauncher;

/// A container managed by a [`Factory`](super::Factory). Every operation refreshes the status
/// from the init process first, so a container whose init has exited reads as stopped.
pub struct Container {
    pub(super) state: State,
    pub(super) root: PathBuf,
    pub(super) config: Config,
    pub(super) cgroup_root: PathBuf,
    pub(super) systemd_client: Option<Arc<dyn SystemdClient>>,
    pub(super) launcher: Arc<dyn ProcessLauncher>,
}

// custom debug impl as the client and the launcher are trait objects
impl Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("state", &self.state)
            .field("root", &self.root)
            .field("cgroup_root", &self.cgroup_root)
            .field("systemd", &self.systemd_client.is_some())
            .finish_non_exhaustive()
    }
}

impl Container {
    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn status(&self) -> ContainerStatus {
        self.state.status
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn pid(&self) -> Option<Pid> {
        self.state.pid.map(Pid::from_raw)
    }

    pub fn bundle(&self) -> &Path {
        &self.state.bundle
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.state.created
    }

    /// Directory holding the state, the config and the exec fifo.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The configuration the container was created with, or the last one passed to `set`.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Pids of every process in the cgroup of the container.
    pub fn processes(&self) -> Result<Vec<Pid>, LibcorralError> {
        let manager = self.cgroup_manager()?;
        Ok(manager.get_all_pids()?)
    }

    pub(super) fn set_status(&mut self, status: ContainerStatus) -> &mut Self {
        self.state.status = status;
        self
    }

    pub fn refresh_status(&mut self) {
        let new_status = match self.pid() {
            Some(pid) if !process_alive(pid) => ContainerStatus::Stopped,
            Some(_) => match self.status() {
                ContainerStatus::Created => ContainerStatus::Created,
                ContainerStatus::Pausing | ContainerStatus::Paused => self.status_from_freezer(),
                _ => ContainerStatus::Running,
            },
            // not started yet
            None if self.status() == ContainerStatus::Created => ContainerStatus::Created,
            None => ContainerStatus::Stopped,
        };

        self.set_status(new_status);
    }

    /// A pause interrupted half way is resolved by what the freezer reports.
    fn status_from_freezer(&self) -> ContainerStatus {
        let state = self
            .cgroup_manager()
            .and_then(|manager| Ok(manager.freezer_state()?));
        match state {
            Ok(FreezerState::Frozen) => ContainerStatus::Paused,
            Ok(FreezerState::Thawed) => ContainerStatus::Running,
            Ok(FreezerState::Undefined) if self.status() == ContainerStatus::Paused => {
                ContainerStatus::Paused
            }
            Ok(FreezerState::Undefined) => ContainerStatus::Running,
            Err(err) => {
                tracing::warn!(id = self.id(), %err, "failed to read freezer state");
                match self.status() {
                    ContainerStatus::Paused => ContainerStatus::Paused,
                    _ => ContainerStatus::Running,
                }
            }
        }
    }

    pub fn save(&self) -> Result<(), LibcorralError> {
        tracing::debug!("save container status: {:?} in {:?}", self.state, self.root);
        self.state.save(&self.root)?;

        Ok(())
    }

    pub(super) fn incorrect_status(&self, requested: Operation) -> LibcorralError {
        tracing::error!(id = self.id(), status = %self.status(), %requested, "refused transition");
        LibcorralError::IncorrectStatus {
            id: self.id().to_owned(),
            current: self.status(),
            requested,
        }
    }

    pub(super) fn cgroup_manager(&self) -> Result<AnyCgroupManager, LibcorralError> {
        Ok(create_cgroup_manager(
            &self.cgroup_root,
            &self.config.cgroups,
            self.systemd_client.clone(),
        )?)
    }

    /// Containers without control over their cgroup only log cgroup failures.
    pub(super) fn check_cgroup_result(
        &self,
        res: Result<(), AnyManagerError>,
    ) -> Result<(), LibcorralError> {
        match res {
            Err(err) if self.config.rootless_cgroups => {
                tracing::warn!(id = self.id(), %err, "ignoring cgroup error of rootless container");
                Ok(())
            }
            res => Ok(res?),
        }
    }
}

/// The process exists and has not exited yet. Zombies count as exited.
pub(crate) fn process_alive(pid: Pid) -> bool {
    let state = procfs::process::Process::new(pid.as_raw())
        .and_then(|p| p.stat())
        .and_then(|stat| stat.state());

    !matches!(
        state,
        Err(_) | Ok(ProcState::Zombie) | Ok(ProcState::Dead)
    )
}
