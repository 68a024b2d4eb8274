use std::borrow::Cow;
use std::path::Path;

use super::controller::Controller;
use crate::common::{self, WrappedIoError};
use crate::resources::{convert_shares_to_cgroup2, Resources};

const CGROUP_CPU_WEIGHT: &str = "cpu.weight";
const CGROUP_CPU_MAX: &str = "cpu.max";
const UNRESTRICTED_QUOTA: &str = "max";

#[derive(thiserror::Error, Debug)]
pub enum V2CpuControllerError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("realtime is not supported on v2 yet")]
    RealtimeV2,
}

pub struct Cpu {}

impl Controller for Cpu {
    type Error = V2CpuControllerError;

    fn apply(resources: &Resources, path: &Path) -> Result<(), Self::Error> {
        if resources.cpu_rt_period.is_some() || resources.cpu_rt_runtime.is_some() {
            return Err(V2CpuControllerError::RealtimeV2);
        }

        let weight = resources
            .cpu_weight
            .or_else(|| resources.cpu_shares.map(convert_shares_to_cgroup2));
        if let Some(weight) = weight {
            if weight != 0 {
                // will result in Erno 34 (numerical result out of range) otherwise
                common::write_cgroup_file(path.join(CGROUP_CPU_WEIGHT), weight)?;
            }
        }

        let cpu_max_file = path.join(CGROUP_CPU_MAX);
        let new_cpu_max: Option<Cow<str>> = match (resources.cpu_quota, resources.cpu_period) {
            (None, Some(period)) => Self::create_period_only_value(&cpu_max_file, period)?,
            (Some(quota), None) if quota > 0 => Some(quota.to_string().into()),
            (Some(_), None) => Some(UNRESTRICTED_QUOTA.into()),
            (Some(quota), Some(period)) if quota > 0 => Some(format!("{quota} {period}").into()),
            (Some(_), Some(period)) => Some(format!("{UNRESTRICTED_QUOTA} {period}").into()),
            (None, None) => None,
        };

        // format is 'quota period'
        // the kernel default is 'max 100000'
        // 250000 250000 -> 1 CPU worth of runtime every 250ms
        // 10000 50000 -> 20% of one CPU every 50ms
        if let Some(cpu_max) = new_cpu_max {
            common::write_cgroup_file(&cpu_max_file, cpu_max)?;
        }

        Ok(())
    }
}

impl Cpu {
    // keeps the current quota when only the period changes
    fn create_period_only_value(
        cpu_max_file: &Path,
        period: u64,
    ) -> Result<Option<Cow<'static, str>>, V2CpuControllerError> {
        let old_cpu_max = common::read_cgroup_file(cpu_max_file)?;
        if let Some(old_quota) = old_cpu_max.split_whitespace().next() {
            return Ok(Some(format!("{old_quota} {period}").into()));
        }
        Ok(None)
    }
}
