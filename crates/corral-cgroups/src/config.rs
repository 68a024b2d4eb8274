//! Cgroup placement and the driver that decides how a configured path is interpreted.
use std::fmt::Display;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::resources::Resources;

/// Scope prefix used by the systemd driver when no path is configured.
pub const DEFAULT_SCOPE_PREFIX: &str = "runc";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CgroupPathError {
    #[error("expected cgroupsPath to be of format \"slice:prefix:name\" for systemd cgroups, got {0:?} instead")]
    MalformedSystemdPath(String),
}

/// How a container's cgroup is named and created.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CgroupDriver {
    /// Paths are directories below the cgroup filesystem root.
    #[default]
    CgroupFs,
    /// Paths are `slice:prefix:name` triples handed to systemd.
    Systemd,
}

impl CgroupDriver {
    /// Resolves the configured cgroups path for the container `name`.
    pub fn resolve(&self, cgroups_path: &str, name: &str) -> Result<CgroupPath, CgroupPathError> {
        match self {
            CgroupDriver::Systemd => {
                if cgroups_path.is_empty() {
                    return Ok(CgroupPath::Systemd {
                        parent: String::new(),
                        scope_prefix: DEFAULT_SCOPE_PREFIX.to_owned(),
                        name: name.to_owned(),
                    });
                }

                let parts: Vec<&str> = cgroups_path.split(':').collect();
                match parts.as_slice() {
                    [parent, prefix, unit] => Ok(CgroupPath::Systemd {
                        parent: (*parent).to_owned(),
                        scope_prefix: (*prefix).to_owned(),
                        name: (*unit).to_owned(),
                    }),
                    _ => Err(CgroupPathError::MalformedSystemdPath(
                        cgroups_path.to_owned(),
                    )),
                }
            }
            CgroupDriver::CgroupFs => {
                let path = clean_path(cgroups_path);
                let name = if path.is_empty() {
                    name.to_owned()
                } else {
                    String::new()
                };
                Ok(CgroupPath::CgroupFs {
                    path: PathBuf::from(path),
                    name,
                })
            }
        }
    }
}

impl Display for CgroupDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match self {
            CgroupDriver::CgroupFs => "cgroupfs",
            CgroupDriver::Systemd => "systemd",
        };
        write!(f, "{print}")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CgroupPath {
    /// `path` is relative to the cgroup root. When it is empty the cgroup is named `name`.
    CgroupFs { path: PathBuf, name: String },
    Systemd {
        /// Parent slice, empty for the driver default
        parent: String,
        scope_prefix: String,
        name: String,
    },
}

impl Default for CgroupPath {
    fn default() -> Self {
        CgroupPath::CgroupFs {
            path: PathBuf::new(),
            name: String::new(),
        }
    }
}

impl CgroupPath {
    pub fn driver(&self) -> CgroupDriver {
        match self {
            CgroupPath::CgroupFs { .. } => CgroupDriver::CgroupFs,
            CgroupPath::Systemd { .. } => CgroupDriver::Systemd,
        }
    }
}

/// Value of a systemd unit property passed through from annotations.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SystemdPropertyValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
}

impl Display for SystemdPropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SystemdProperty {
    pub name: String,
    pub value: SystemdPropertyValue,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Cgroup {
    pub path: CgroupPath,
    pub resources: Resources,
    /// Extra unit properties, only honoured by the systemd driver.
    #[serde(default)]
    pub systemd_props: Vec<SystemdProperty>,
}

/// Lexically cleans a cgroup path so that it can never climb above the hierarchy root.
///
/// An empty path stays empty. Absolute paths stay absolute. Relative paths are resolved as if
/// rooted at `/` and returned relative again, so `../../a` becomes `a`.
pub fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }

    let mut cleaned = path_clean::clean(path);
    if !cleaned.starts_with('/') {
        let rooted = path_clean::clean(&format!("/{cleaned}"));
        cleaned = match rooted.trim_start_matches('/') {
            "" => ".".to_owned(),
            rest => rest.to_owned(),
        };
    }

    path_clean::clean(&cleaned)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path(""), "");
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path("/../../../../../"), "/");
        assert_eq!(clean_path("/a/b/../c/"), "/a/c");
        assert_eq!(clean_path("../../../etc/passwd"), "etc/passwd");
        assert_eq!(clean_path("a/./b//c"), "a/b/c");
        assert_eq!(clean_path(".."), ".");
    }

    #[test]
    fn test_systemd_default_path() -> Result<()> {
        let path = CgroupDriver::Systemd.resolve("", "ct1")?;
        assert_eq!(
            path,
            CgroupPath::Systemd {
                parent: String::new(),
                scope_prefix: "runc".to_owned(),
                name: "ct1".to_owned(),
            }
        );
        Ok(())
    }

    #[test]
    fn test_systemd_triple() -> Result<()> {
        let path = CgroupDriver::Systemd.resolve("system.slice:docker:1234", "ct1")?;
        assert_eq!(
            path,
            CgroupPath::Systemd {
                parent: "system.slice".to_owned(),
                scope_prefix: "docker".to_owned(),
                name: "1234".to_owned(),
            }
        );
        Ok(())
    }

    #[test]
    fn test_systemd_malformed_path() {
        for path in ["system.slice:docker", "a:b:c:d", "/machine/ct1"] {
            let err = CgroupDriver::Systemd.resolve(path, "ct1").unwrap_err();
            assert_eq!(err, CgroupPathError::MalformedSystemdPath(path.to_owned()));
            assert!(err.to_string().contains("slice:prefix:name"));
        }
    }

    #[test]
    fn test_cgroupfs_paths() -> Result<()> {
        assert_eq!(
            CgroupDriver::CgroupFs.resolve("", "ct1")?,
            CgroupPath::CgroupFs {
                path: PathBuf::new(),
                name: "ct1".to_owned(),
            }
        );
        assert_eq!(
            CgroupDriver::CgroupFs.resolve("/machine/../ct1", "ct1")?,
            CgroupPath::CgroupFs {
                path: PathBuf::from("/ct1"),
                name: String::new(),
            }
        );
        Ok(())
    }
}
