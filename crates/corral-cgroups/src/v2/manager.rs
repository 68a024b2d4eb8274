use std::{
    fs::{self},
    os::unix::fs::PermissionsExt,
    path::{Component::RootDir, Path, PathBuf},
    time::Duration,
};

use nix::unistd::Pid;

use super::{
    controller::Controller,
    controller_type::{ControllerType, CONTROLLER_TYPES},
    cpu::{Cpu, V2CpuControllerError},
    cpuset::CpuSet,
    freezer::{self, V2FreezerError},
    hugetlb::{HugeTlb, V2HugeTlbControllerError},
    io::{Io, V2IoControllerError},
    memory::{Memory, V2MemoryControllerError},
    pids::Pids,
    unified::{self, V2UnifiedError},
    util::{self, V2UtilError, CGROUP_SUBTREE_CONTROL},
};
use crate::{
    common::{
        self, CgroupManager, FreezerState, JoinSafelyError, PathBufExt, WrapIoResult,
        WrappedIoError, CGROUP_PROCS,
    },
    resources::Resources,
};

pub const CGROUP_KILL: &str = "cgroup.kill";

#[derive(thiserror::Error, Debug)]
pub enum V2ManagerError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("while joining paths: {0}")]
    JoinSafely(#[from] JoinSafelyError),
    #[error(transparent)]
    V2Util(#[from] V2UtilError),
    #[error("invalid pid {0} in cgroup.procs")]
    InvalidPid(String),

    #[error(transparent)]
    CpuController(#[from] V2CpuControllerError),
    #[error(transparent)]
    HugeTlbController(#[from] V2HugeTlbControllerError),
    #[error(transparent)]
    IoController(#[from] V2IoControllerError),
    #[error(transparent)]
    MemoryController(#[from] V2MemoryControllerError),
    #[error(transparent)]
    FreezerController(#[from] V2FreezerError),
    #[error(transparent)]
    UnifiedController(#[from] V2UnifiedError),
}

#[derive(Debug)]
pub struct Manager {
    root_path: PathBuf,
    cgroup_path: PathBuf,
    full_path: PathBuf,
}

impl Manager {
    /// Constructs a new cgroup manager with root path being the mount point
    /// of a cgroup v2 fs and cgroup path being a relative path from the root
    pub fn new(root_path: PathBuf, cgroup_path: PathBuf) -> Result<Self, V2ManagerError> {
        let full_path = root_path.join_safely(&cgroup_path)?;

        Ok(Self {
            root_path,
            cgroup_path,
            full_path,
        })
    }

    fn create_unified_cgroup(&self, pid: Pid) -> Result<(), V2ManagerError> {
        let controllers: Vec<String> = util::available_controllers(&self.root_path)?
            .iter()
            .map(|c| format!("+{c}"))
            .collect();

        Self::write_controllers(&self.root_path, &controllers)?;

        let mut current_path = self.root_path.clone();
        let mut components = self
            .cgroup_path
            .components()
            .filter(|c| c.ne(&RootDir))
            .peekable();
        while let Some(component) = components.next() {
            current_path = current_path.join(component);
            if !current_path.exists() {
                fs::create_dir(&current_path).wrap_create_dir(&current_path)?;
                fs::metadata(&current_path)
                    .wrap_other(&current_path)?
                    .permissions()
                    .set_mode(0o755);
            }

            // last component cannot have subtree_control enabled due to internal process constraint
            // if this were set, writing to the cgroups.procs file will fail with Erno 16 (device or resource busy)
            if components.peek().is_some() {
                Self::write_controllers(&current_path, &controllers)?;
            }
        }

        common::write_cgroup_file(self.full_path.join(CGROUP_PROCS), pid)?;
        Ok(())
    }

    fn write_controllers(path: &Path, controllers: &[String]) -> Result<(), WrappedIoError> {
        for controller in controllers {
            common::write_cgroup_file(path.join(CGROUP_SUBTREE_CONTROL), controller)?;
        }

        Ok(())
    }
}

impl CgroupManager for Manager {
    type Error = V2ManagerError;

    fn add_task(&self, pid: Pid) -> Result<(), Self::Error> {
        self.create_unified_cgroup(pid)
    }

    fn apply(&self, resources: &Resources) -> Result<(), Self::Error> {
        for controller in CONTROLLER_TYPES {
            match controller {
                ControllerType::Cpu => Cpu::apply(resources, &self.full_path)?,
                ControllerType::CpuSet => CpuSet::apply(resources, &self.full_path)?,
                ControllerType::HugeTlb => HugeTlb::apply(resources, &self.full_path)?,
                ControllerType::Io => Io::apply(resources, &self.full_path)?,
                ControllerType::Memory => Memory::apply(resources, &self.full_path)?,
                ControllerType::Pids => Pids::apply(resources, &self.full_path)?,
            }
        }

        if !resources.unified.is_empty() {
            unified::apply(
                resources,
                &self.full_path,
                &util::available_controllers(&self.root_path)?,
            )?;
        }

        Ok(())
    }

    fn remove(&self) -> Result<(), Self::Error> {
        if self.full_path.exists() {
            tracing::debug!("remove cgroup {:?}", self.full_path);
            let kill_file = self.full_path.join(CGROUP_KILL);
            if kill_file.exists() {
                fs::write(&kill_file, "1").wrap_write(&kill_file, "1")?;
            } else {
                let procs_path = self.full_path.join(CGROUP_PROCS);
                let procs = common::read_cgroup_file(&procs_path)?;

                for line in procs.lines().filter(|l| !l.trim().is_empty()) {
                    let pid: i32 = line
                        .trim()
                        .parse()
                        .map_err(|_| V2ManagerError::InvalidPid(line.to_owned()))?;
                    let _ = nix::sys::signal::kill(Pid::from_raw(pid), nix::sys::signal::SIGKILL);
                }
            }

            common::delete_with_retry(&self.full_path, 4, Duration::from_millis(100))?;
        }

        Ok(())
    }

    fn freeze(&self, state: FreezerState) -> Result<(), Self::Error> {
        Ok(freezer::set_state(&self.full_path, state)?)
    }

    fn freezer_state(&self) -> Result<FreezerState, Self::Error> {
        Ok(freezer::state(&self.full_path)?)
    }

    fn get_all_pids(&self) -> Result<Vec<Pid>, Self::Error> {
        Ok(common::get_all_pids(&self.full_path)?)
    }

    fn exists(&self) -> bool {
        self.full_path.exists()
    }

    fn path(&self) -> &Path {
        &self.full_path
    }
}
