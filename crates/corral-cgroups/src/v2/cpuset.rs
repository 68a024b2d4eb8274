use std::path::Path;

use super::controller::Controller;
use crate::common::{self, WrappedIoError};
use crate::resources::Resources;

const CGROUP_CPUSET_CPUS: &str = "cpuset.cpus";
const CGROUP_CPUSET_MEMS: &str = "cpuset.mems";

pub struct CpuSet {}

impl Controller for CpuSet {
    type Error = WrappedIoError;

    fn apply(resources: &Resources, cgroup_path: &Path) -> Result<(), Self::Error> {
        if let Some(cpus) = &resources.cpuset_cpus {
            common::write_cgroup_file(cgroup_path.join(CGROUP_CPUSET_CPUS), cpus)?;
        }

        if let Some(mems) = &resources.cpuset_mems {
            common::write_cgroup_file(cgroup_path.join(CGROUP_CPUSET_MEMS), mems)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test::setup;

    #[test]
    fn test_set_cpus() {
        // arrange
        let (tmp, cpus) = setup(CGROUP_CPUSET_CPUS);
        let resources = Resources {
            cpuset_cpus: Some("1-3".to_owned()),
            ..Default::default()
        };

        // act
        CpuSet::apply(&resources, tmp.path()).expect("apply cpuset");

        // assert
        let content = fs::read_to_string(cpus)
            .unwrap_or_else(|_| panic!("read {CGROUP_CPUSET_CPUS} file content"));
        assert_eq!(content, "1-3");
    }

    #[test]
    fn test_set_mems() {
        let (tmp, mems) = setup(CGROUP_CPUSET_MEMS);
        let resources = Resources {
            cpuset_mems: Some("1-3".to_owned()),
            ..Default::default()
        };

        CpuSet::apply(&resources, tmp.path()).expect("apply cpuset");

        let content = fs::read_to_string(mems)
            .unwrap_or_else(|_| panic!("read {CGROUP_CPUSET_MEMS} file content"));
        assert_eq!(content, "1-3");
    }
}
