//! Writes of the raw `unified` overrides, keyed by cgroup file name.
use std::path::Path;

use super::controller_type::ControllerType;
use crate::common::{self, WrappedIoError};
use crate::resources::Resources;

#[derive(thiserror::Error, Debug)]
pub enum V2UnifiedError {
    #[error(transparent)]
    WrappedIo(#[from] WrappedIoError),
    #[error("cannot write {file}, controller {controller} is not enabled")]
    ControllerNotEnabled {
        file: String,
        controller: String,
        source: WrappedIoError,
    },
}

/// Writes every override into `cgroup`. A file that cannot be written because its controller
/// is missing from `enabled` is reported as such.
pub fn apply(
    resources: &Resources,
    cgroup: &Path,
    enabled: &[ControllerType],
) -> Result<(), V2UnifiedError> {
    for (file, value) in &resources.unified {
        tracing::debug!(file, value, "writing unified override");
        let Err(err) = common::write_cgroup_file(cgroup.join(file), value) else {
            continue;
        };

        // "memory.high" belongs to "memory", "cgroup.*" files have no controller
        let controller = file.split('.').next().unwrap_or_default();
        let is_enabled = ControllerType::from_name(controller)
            .map(|c| enabled.contains(&c))
            .unwrap_or(controller == "cgroup");
        if is_enabled {
            return Err(err.into());
        }
        return Err(V2UnifiedError::ControllerNotEnabled {
            file: file.clone(),
            controller: controller.to_owned(),
            source: err,
        });
    }

    Ok(())
}
