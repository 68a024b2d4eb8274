use std::{
    fmt::{Debug, Display},
    path::{Path, PathBuf},
    sync::Arc,
};

use nix::unistd::Pid;

use super::client::{SystemdClient, SystemdClientError};
use crate::{
    common::{CgroupManager, FreezerState, JoinSafelyError, PathBufExt},
    config::SystemdProperty,
    resources::Resources,
    v2::manager::{Manager as FsManager, V2ManagerError},
};

const SYSTEM_SLICE: &str = "system.slice";
const USER_SLICE: &str = "user.slice";

#[derive(thiserror::Error, Debug)]
pub enum SystemdManagerError {
    #[error("invalid slice name: {0}")]
    InvalidSliceName(String),
    #[error(transparent)]
    JoinSafely(#[from] JoinSafelyError),
    #[error("systemd client: {0}")]
    Client(#[from] SystemdClientError),
    #[error(transparent)]
    V2(#[from] V2ManagerError),
}

/// Represents the systemd cgroups path:
/// It should be of the form [slice]:[scope_prefix]:[name].
/// The slice is the "parent" and should be expanded properly,
/// see expand_slice below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupsPath {
    pub parent: String,
    pub prefix: String,
    pub name: String,
}

impl Display for CgroupsPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.parent, self.prefix, self.name)
    }
}

/// Places the container in a systemd scope. Resource limits are written through the unified
/// hierarchy below the scope's cgroup directory.
pub struct Manager {
    /// Path relative to the root path e.g. /system.slice/runc-569d5ce3afe1.scope
    cgroups_path: PathBuf,
    destructured_path: CgroupsPath,
    /// Parent slice unit, e.g. system.slice
    parent_unit: String,
    /// Name of the systemd unit e.g. runc-569d5ce3afe1.scope
    unit_name: String,
    properties: Vec<SystemdProperty>,
    client: Option<Arc<dyn SystemdClient>>,
    fs_manager: FsManager,
}

// custom debug impl as the client is a trait object
impl Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("cgroups_path", &self.cgroups_path)
            .field("destructured_path", &self.destructured_path)
            .field("unit_name", &self.unit_name)
            .field("properties", &self.properties)
            .field("has_client", &self.client.is_some())
            .finish()
    }
}

impl Manager {
    pub fn new(
        root_path: PathBuf,
        destructured_path: CgroupsPath,
        properties: Vec<SystemdProperty>,
        client: Option<Arc<dyn SystemdClient>>,
    ) -> Result<Self, SystemdManagerError> {
        let use_system = match &client {
            Some(client) => {
                if !super::booted() {
                    tracing::warn!("systemd cgroup driver selected on a host not booted with systemd");
                }
                client.is_system()
            }
            None => nix::unistd::geteuid().is_root(),
        };

        let (cgroups_path, parent_unit) =
            Self::construct_cgroups_path(&destructured_path, use_system)?;
        let fs_manager = FsManager::new(root_path, cgroups_path.clone())?;

        Ok(Manager {
            cgroups_path,
            parent_unit,
            unit_name: Self::get_unit_name(&destructured_path),
            destructured_path,
            properties,
            client,
            fs_manager,
        })
    }

    /// get_unit_name returns the unit (scope) name from the path provided by the user
    /// for example: foo:docker:bar returns in 'docker-bar.scope'
    fn get_unit_name(cgroups_path: &CgroupsPath) -> String {
        // By default we create a scope unless specified explicitly.
        if !cgroups_path.name.ends_with(".slice") {
            return format!("{}-{}.scope", cgroups_path.prefix, cgroups_path.name);
        }
        cgroups_path.name.clone()
    }

    // an example of the final path: "/system.slice/docker-foo.scope"
    fn construct_cgroups_path(
        cgroups_path: &CgroupsPath,
        use_system: bool,
    ) -> Result<(PathBuf, String), SystemdManagerError> {
        let parent_unit = if cgroups_path.parent.is_empty() {
            match use_system {
                true => SYSTEM_SLICE.to_owned(),
                false => USER_SLICE.to_owned(),
            }
        } else {
            cgroups_path.parent.clone()
        };

        let parent = Self::expand_slice(&parent_unit)?;
        let unit_name = Self::get_unit_name(cgroups_path);
        let cgroups_path = parent.join_safely(&unit_name)?;
        Ok((cgroups_path, parent_unit))
    }

    // systemd represents slice hierarchy using `-`, so we need to follow suit when
    // generating the path of slice. For example, 'test-a-b.slice' becomes
    // '/test.slice/test-a.slice/test-a-b.slice'.
    fn expand_slice(slice: &str) -> Result<PathBuf, SystemdManagerError> {
        let suffix = ".slice";
        if slice.len() <= suffix.len() || !slice.ends_with(suffix) || slice.contains('/') {
            return Err(SystemdManagerError::InvalidSliceName(slice.into()));
        }

        let slice_name = slice.trim_end_matches(suffix);
        // if input was -.slice, we should just return root now
        if slice_name == "-" {
            return Ok(PathBuf::from("/"));
        }

        let mut path = String::new();
        let mut prefix = String::new();
        for component in slice_name.split('-') {
            if component.is_empty() {
                return Err(SystemdManagerError::InvalidSliceName(slice.into()));
            }
            path = format!("{path}/{prefix}{component}{suffix}");
            prefix = format!("{prefix}{component}-");
        }
        Ok(PathBuf::from(path))
    }

    pub fn unit_name(&self) -> &str {
        &self.unit_name
    }
}

impl CgroupManager for Manager {
    type Error = SystemdManagerError;

    fn add_task(&self, pid: Pid) -> Result<(), Self::Error> {
        // Dont attach any pid to the cgroup if -1 is specified as a pid
        if pid.as_raw() == -1 {
            return Ok(());
        }

        match &self.client {
            Some(client) => {
                tracing::debug!(unit = %self.unit_name, %pid, "starting transient unit");
                client.start_transient_unit(
                    &self.destructured_path.name,
                    pid.as_raw() as u32,
                    &self.parent_unit,
                    &self.unit_name,
                    &self.properties,
                )?;
            }
            None => {
                tracing::debug!(path = ?self.cgroups_path, "no systemd client, creating scope directory directly");
                self.fs_manager.add_task(pid)?;
            }
        }

        Ok(())
    }

    fn apply(&self, resources: &Resources) -> Result<(), Self::Error> {
        Ok(self.fs_manager.apply(resources)?)
    }

    fn remove(&self) -> Result<(), Self::Error> {
        tracing::debug!("remove {}", self.unit_name);
        if let Some(client) = &self.client {
            client.stop_transient_unit(&self.unit_name)?;
        }

        Ok(self.fs_manager.remove()?)
    }

    fn freeze(&self, state: FreezerState) -> Result<(), Self::Error> {
        Ok(self.fs_manager.freeze(state)?)
    }

    fn freezer_state(&self) -> Result<FreezerState, Self::Error> {
        Ok(self.fs_manager.freezer_state()?)
    }

    fn get_all_pids(&self) -> Result<Vec<Pid>, Self::Error> {
        Ok(self.fs_manager.get_all_pids()?)
    }

    fn exists(&self) -> bool {
        self.fs_manager.exists()
    }

    fn path(&self) -> &Path {
        self.fs_manager.path()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::Result;

    use super::*;
    use crate::config::SystemdPropertyValue;

    #[derive(Default)]
    struct TestSystemdClient {
        started: Mutex<Vec<(String, u32, String, String, usize)>>,
        stopped: Mutex<Vec<String>>,
    }

    impl SystemdClient for TestSystemdClient {
        fn is_system(&self) -> bool {
            true
        }

        fn start_transient_unit(
            &self,
            container_name: &str,
            pid: u32,
            parent: &str,
            unit_name: &str,
            properties: &[SystemdProperty],
        ) -> Result<(), SystemdClientError> {
            self.started.lock().unwrap().push((
                container_name.to_owned(),
                pid,
                parent.to_owned(),
                unit_name.to_owned(),
                properties.len(),
            ));
            Ok(())
        }

        fn stop_transient_unit(&self, unit_name: &str) -> Result<(), SystemdClientError> {
            self.stopped.lock().unwrap().push(unit_name.to_owned());
            Ok(())
        }
    }

    fn path(parent: &str, prefix: &str, name: &str) -> CgroupsPath {
        CgroupsPath {
            parent: parent.to_owned(),
            prefix: prefix.to_owned(),
            name: name.to_owned(),
        }
    }

    #[test]
    fn expand_slice_works() -> Result<()> {
        assert_eq!(
            Manager::expand_slice("test-a-b.slice")?,
            PathBuf::from("/test.slice/test-a.slice/test-a-b.slice"),
        );
        assert_eq!(Manager::expand_slice("-.slice")?, PathBuf::from("/"));

        Ok(())
    }

    #[test]
    fn expand_slice_rejects_bad_names() {
        for slice in [".slice", "foo", "a/b.slice", "a--b.slice"] {
            assert!(
                matches!(
                    Manager::expand_slice(slice),
                    Err(SystemdManagerError::InvalidSliceName(_))
                ),
                "{slice} should be rejected"
            );
        }
    }

    #[test]
    fn get_cgroups_path_works_with_a_complex_slice() -> Result<()> {
        let cgroups_path = path("test-a-b.slice", "docker", "foo");

        assert_eq!(
            Manager::construct_cgroups_path(&cgroups_path, true)?.0,
            PathBuf::from("/test.slice/test-a.slice/test-a-b.slice/docker-foo.scope"),
        );

        Ok(())
    }

    #[test]
    fn get_cgroups_path_works_with_a_simple_slice() -> Result<()> {
        let cgroups_path = path("machine.slice", "libpod", "foo");

        assert_eq!(
            Manager::construct_cgroups_path(&cgroups_path, true)?.0,
            PathBuf::from("/machine.slice/libpod-foo.scope"),
        );

        Ok(())
    }

    #[test]
    fn get_cgroups_path_works_with_scope() -> Result<()> {
        let cgroups_path = path("", "docker", "foo");

        assert_eq!(
            Manager::construct_cgroups_path(&cgroups_path, true)?,
            (
                PathBuf::from("/system.slice/docker-foo.scope"),
                "system.slice".to_owned()
            ),
        );
        assert_eq!(
            Manager::construct_cgroups_path(&cgroups_path, false)?.0,
            PathBuf::from("/user.slice/docker-foo.scope"),
        );

        Ok(())
    }

    #[test]
    fn slice_name_is_kept_as_unit() {
        assert_eq!(
            Manager::get_unit_name(&path("", "runc", "ct.slice")),
            "ct.slice"
        );
        assert_eq!(
            Manager::get_unit_name(&path("", "runc", "ct")),
            "runc-ct.scope"
        );
    }

    #[test]
    fn add_task_and_remove_go_through_client() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let client = Arc::new(TestSystemdClient::default());
        let props = vec![SystemdProperty {
            name: "TimeoutStopUSec".to_owned(),
            value: SystemdPropertyValue::UInt(5_000_000),
        }];
        let manager = Manager::new(
            tmp.path().to_path_buf(),
            path("", "runc", "ct1"),
            props,
            Some(client.clone()),
        )?;
        assert_eq!(
            manager.path(),
            tmp.path().join("system.slice/runc-ct1.scope")
        );

        manager.add_task(Pid::from_raw(42))?;
        manager.remove()?;

        assert_eq!(
            client.started.lock().unwrap().as_slice(),
            &[(
                "ct1".to_owned(),
                42,
                "system.slice".to_owned(),
                "runc-ct1.scope".to_owned(),
                1
            )]
        );
        assert_eq!(
            client.stopped.lock().unwrap().as_slice(),
            &["runc-ct1.scope".to_owned()]
        );
        Ok(())
    }
}
