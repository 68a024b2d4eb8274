//! Device nodes created inside the container and the cgroup rules that go with them.
use std::path::PathBuf;

use corral_cgroups::resources::{DeviceRule, DeviceType};
use nix::sys::stat::SFlag;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::registry::Registry;
use crate::spec::Linux;

const DEFAULT_FILE_MODE: u32 = 0o666;

/// A device node. Entries with an empty path only contribute their cgroup rule.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Device {
    #[serde(flatten)]
    pub rule: DeviceRule,
    pub path: PathBuf,
    /// Permission bits only, the file type comes from the rule.
    pub file_mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl Device {
    /// Node for `mknod`, e.g. `/dev/null` as `c 1:3`.
    pub fn node(
        typ: DeviceType,
        path: &str,
        major: i64,
        minor: i64,
        permissions: &str,
    ) -> Self {
        Self {
            rule: DeviceRule {
                typ,
                major,
                minor,
                permissions: permissions.to_owned(),
                allow: true,
            },
            path: PathBuf::from(path),
            file_mode: DEFAULT_FILE_MODE,
            uid: 0,
            gid: 0,
        }
    }

    /// A rule without a node.
    pub fn rule_only(typ: DeviceType, major: i64, minor: i64, permissions: &str) -> Self {
        Self {
            rule: DeviceRule {
                typ,
                major,
                minor,
                permissions: permissions.to_owned(),
                allow: true,
            },
            path: PathBuf::new(),
            file_mode: 0,
            uid: 0,
            gid: 0,
        }
    }

    pub fn has_path(&self) -> bool {
        !self.path.as_os_str().is_empty()
    }

    /// File type bits passed to `mknod`.
    pub fn file_type(&self) -> SFlag {
        match self.rule.typ {
            DeviceType::Wildcard => SFlag::S_IFBLK | SFlag::S_IFCHR | SFlag::S_IFIFO,
            DeviceType::Block => SFlag::S_IFBLK,
            DeviceType::Char => SFlag::S_IFCHR,
            DeviceType::Fifo => SFlag::S_IFIFO,
        }
    }
}

/// Output of [`create_devices`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledDevices {
    /// The default devices that survived deduplication, path-less rules included. Their rules
    /// end up in the cgroup device list.
    pub defaults: Vec<Device>,
    /// Nodes to create in the container, defaults first.
    pub devices: Vec<Device>,
}

/// Merges the registry's allowed devices with the devices of the `Spec`.
///
/// A spec device replaces the default with the same path. Defaults without a path are rules
/// only and are always kept.
pub fn create_devices(
    registry: &Registry,
    linux: Option<&Linux>,
) -> Result<CompiledDevices, ValidationError> {
    let spec_devices = linux.map(|l| l.devices.as_slice()).unwrap_or_default();
    let mut compiled = CompiledDevices::default();

    for allowed in registry.allowed_devices() {
        if allowed.has_path() && spec_devices.iter().any(|d| d.path == allowed.path) {
            tracing::debug!(path = ?allowed.path, "default device overridden by spec");
            continue;
        }

        compiled.defaults.push(allowed.clone());
        if allowed.has_path() {
            compiled.devices.push(allowed.clone());
        }
    }

    for d in spec_devices {
        let typ = device_type(&d.typ)?;
        let file_mode = d
            .file_mode
            .map(|mode| mode & !SFlag::S_IFMT.bits())
            .unwrap_or(DEFAULT_FILE_MODE);

        compiled.devices.push(Device {
            rule: DeviceRule {
                typ,
                major: d.major,
                minor: d.minor,
                permissions: String::new(),
                allow: false,
            },
            path: d.path.clone(),
            file_mode,
            uid: d.uid.unwrap_or(0),
            gid: d.gid.unwrap_or(0),
        });
    }

    Ok(compiled)
}

/// Device node type of a `Spec` device. `u` is an unbuffered character device.
fn device_type(s: &str) -> Result<DeviceType, ValidationError> {
    match s {
        "p" => Ok(DeviceType::Fifo),
        "u" | "c" => Ok(DeviceType::Char),
        "b" => Ok(DeviceType::Block),
        _ => Err(ValidationError::InvalidDeviceType(s.to_owned())),
    }
}

/// Device type of a cgroup rule of a `Spec`. Fifos cannot be restricted by the devices
/// controller.
pub fn cgroup_device_type(s: &str) -> Result<DeviceType, ValidationError> {
    match s {
        "a" => Ok(DeviceType::Wildcard),
        "b" => Ok(DeviceType::Block),
        "c" => Ok(DeviceType::Char),
        _ => Err(ValidationError::InvalidCgroupDeviceType(s.to_owned())),
    }
}
