//! Controller discovery on the unified hierarchy.
use std::path::{Path, PathBuf};

use super::controller_type::ControllerType;
use crate::common::{self, WrappedIoError};

pub const CGROUP_CONTROLLERS: &str = "cgroup.controllers";
pub const CGROUP_SUBTREE_CONTROL: &str = "cgroup.subtree_control";

#[derive(thiserror::Error, Debug)]
pub enum V2UtilError {
    #[error(transparent)]
    WrappedIo(#[from] WrappedIoError),
    #[error("{0:?} not found, the cgroup root is not a unified hierarchy")]
    NotUnified(PathBuf),
}

/// Controllers the kernel offers below `root`, in the order it lists them. Controllers this
/// crate has no writer for are skipped.
pub fn available_controllers(root: &Path) -> Result<Vec<ControllerType>, V2UtilError> {
    let file = root.join(CGROUP_CONTROLLERS);
    if !file.exists() {
        return Err(V2UtilError::NotUnified(file));
    }

    let listed = common::read_cgroup_file(&file)?;
    let controllers = listed
        .split_whitespace()
        .filter_map(|name| {
            let controller = ControllerType::from_name(name);
            if controller.is_none() {
                tracing::debug!(name, "skipping controller without a writer");
            }
            controller
        })
        .collect();
    Ok(controllers)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;
    use crate::test::set_fixture;

    #[test]
    fn test_available_controllers() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        set_fixture(tmp.path(), CGROUP_CONTROLLERS, "cpuset cpu io memory rdma pids\n")?;

        assert_eq!(
            available_controllers(tmp.path())?,
            [
                ControllerType::CpuSet,
                ControllerType::Cpu,
                ControllerType::Io,
                ControllerType::Memory,
                ControllerType::Pids,
            ]
        );

        set_fixture(tmp.path(), CGROUP_CONTROLLERS, "")?;
        assert!(available_controllers(tmp.path())?.is_empty());
        Ok(())
    }

    #[test]
    fn test_root_without_controllers_file() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        assert!(matches!(
            available_controllers(tmp.path()),
            Err(V2UtilError::NotUnified(path)) if path.ends_with(CGROUP_CONTROLLERS)
        ));
        Ok(())
    }
}
