use std::path::{Path, PathBuf};

use super::controller::Controller;
use crate::common::{self, WrappedIoError};
use crate::resources::{Resources, ThrottleDevice};

const CGROUP_BFQ_IO_WEIGHT: &str = "io.bfq.weight";
const CGROUP_IO_WEIGHT: &str = "io.weight";
const CGROUP_IO_MAX: &str = "io.max";

#[derive(thiserror::Error, Debug)]
pub enum V2IoControllerError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("cannot set leaf_weight with cgroupv2")]
    LeafWeight,
}

pub struct Io {}

impl Controller for Io {
    type Error = V2IoControllerError;

    fn apply(resources: &Resources, root_path: &Path) -> Result<(), Self::Error> {
        tracing::debug!("Apply io cgroup v2 config");
        for wd in &resources.blkio_weight_device {
            if wd.weight > 0 {
                common::write_cgroup_file(
                    root_path.join(CGROUP_BFQ_IO_WEIGHT),
                    format!("{}:{} {}", wd.major, wd.minor, wd.weight),
                )?;
            }
        }

        if let Some(leaf_weight) = resources.blkio_leaf_weight {
            if leaf_weight > 0 {
                return Err(V2IoControllerError::LeafWeight);
            }
        }

        if let Some(io_weight) = resources.blkio_weight {
            if io_weight > 0 {
                let cgroup_file = root_path.join(CGROUP_BFQ_IO_WEIGHT);
                if cgroup_file.exists() {
                    common::write_cgroup_file(cgroup_file, io_weight)?;
                } else {
                    common::write_cgroup_file(
                        root_path.join(CGROUP_IO_WEIGHT),
                        Self::convert_cfq_io_weight_to_bfq(io_weight),
                    )?;
                }
            }
        }

        Self::throttle(root_path, "rbps", &resources.blkio_throttle_read_bps_device)?;
        Self::throttle(root_path, "wbps", &resources.blkio_throttle_write_bps_device)?;
        Self::throttle(root_path, "riops", &resources.blkio_throttle_read_iops_device)?;
        Self::throttle(root_path, "wiops", &resources.blkio_throttle_write_iops_device)?;

        Ok(())
    }
}

impl Io {
    // cfq weights are in [10, 1000], the unified io.weight is in [1, 10000]
    fn convert_cfq_io_weight_to_bfq(v: u16) -> u64 {
        if v == 0 {
            return 0;
        }
        1 + u64::from(v.saturating_sub(10)) * 9999 / 990
    }

    fn io_max_path(path: &Path) -> PathBuf {
        path.join(CGROUP_IO_MAX)
    }

    fn throttle(
        root_path: &Path,
        key: &str,
        devices: &[ThrottleDevice],
    ) -> Result<(), WrappedIoError> {
        for device in devices {
            common::write_cgroup_file(
                Self::io_max_path(root_path),
                format!("{}:{} {}={}", device.major, device.minor, key, device.rate),
            )?;
        }
        Ok(())
    }
}
