use std::path::Path;

use super::controller::Controller;
use crate::common::{self, WrappedIoError};
use crate::resources::{HugepageLimit, Resources};

#[derive(thiserror::Error, Debug)]
pub enum V2HugeTlbControllerError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("malformed page size {0}: must be in the format of 2^(integer) followed by a unit")]
    MalformedPageSize(String),
}

pub struct HugeTlb {}

impl Controller for HugeTlb {
    type Error = V2HugeTlbControllerError;

    fn apply(resources: &Resources, cgroup_root: &Path) -> Result<(), Self::Error> {
        tracing::debug!("Apply hugetlb cgroup v2 config");
        for hugetlb in &resources.hugetlb_limit {
            Self::apply_limit(cgroup_root, hugetlb)?
        }
        Ok(())
    }
}

impl HugeTlb {
    fn apply_limit(
        root_path: &Path,
        hugetlb: &HugepageLimit,
    ) -> Result<(), V2HugeTlbControllerError> {
        let page_size_raw: String = hugetlb
            .pagesize
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        match page_size_raw.parse::<u64>() {
            Ok(page_size) if Self::is_power_of_two(page_size) => {}
            _ => {
                return Err(V2HugeTlbControllerError::MalformedPageSize(
                    hugetlb.pagesize.clone(),
                ))
            }
        }

        common::write_cgroup_file(
            root_path.join(format!("hugetlb.{}.max", hugetlb.pagesize)),
            hugetlb.limit,
        )?;

        let rsvd_file_path = root_path.join(format!("hugetlb.{}.rsvd.max", hugetlb.pagesize));
        if rsvd_file_path.exists() {
            common::write_cgroup_file(rsvd_file_path, hugetlb.limit)?;
        }

        Ok(())
    }

    fn is_power_of_two(number: u64) -> bool {
        (number != 0) && (number & (number.saturating_sub(1))) == 0
    }
}

#[cfg(test)]
mod tests {
    use std::fs::read_to_string;

    use super::*;
    use crate::test::set_fixture;

    fn limit(pagesize: &str, limit: u64) -> Resources {
        Resources {
            hugetlb_limit: vec![HugepageLimit {
                pagesize: pagesize.to_owned(),
                limit,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_set_hugetlb() {
        let page_file_name = "hugetlb.2MB.max";
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), page_file_name, "0").expect("Set fixture for 2 MB page size");

        HugeTlb::apply(&limit("2MB", 16384), tmp.path()).expect("apply hugetlb");
        let content =
            read_to_string(tmp.path().join(page_file_name)).expect("Read hugetlb file content");
        assert_eq!("16384", content);
    }

    #[test]
    fn test_set_hugetlb_with_invalid_page_size() {
        let tmp = tempfile::tempdir().unwrap();

        let result = HugeTlb::apply(&limit("3MB", 16384), tmp.path());
        assert!(
            matches!(result, Err(V2HugeTlbControllerError::MalformedPageSize(_))),
            "page size that is not a power of two should be an error"
        );
    }

    #[test]
    fn test_set_rsvd_hugetlb() {
        let page_file_name = "hugetlb.2MB.max";
        let rsvd_page_file_name = "hugetlb.2MB.rsvd.max";
        let tmp = tempfile::tempdir().unwrap();
        set_fixture(tmp.path(), page_file_name, "0").expect("Set fixture for 2 MB page size");
        set_fixture(tmp.path(), rsvd_page_file_name, "0")
            .expect("Set fixture for 2 MB rsvd page size");

        HugeTlb::apply(&limit("2MB", 16384), tmp.path()).expect("apply hugetlb");

        let content = read_to_string(tmp.path().join(rsvd_page_file_name))
            .expect("Read hugetlb rsvd file content");
        assert_eq!("16384", content);
    }
}
