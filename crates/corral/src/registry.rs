//! Defaults shared by every translation, built once and passed around explicitly.
use corral_cgroups::resources::{DeviceType, WILDCARD};

use crate::devices::Device;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registry {
    allowed_devices: Vec<Device>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(default_allowed_devices())
    }
}

impl Registry {
    pub fn new(allowed_devices: Vec<Device>) -> Self {
        Self { allowed_devices }
    }

    /// Devices every container gets unless the `Spec` overrides them by path.
    pub fn allowed_devices(&self) -> &[Device] {
        &self.allowed_devices
    }
}

fn default_allowed_devices() -> Vec<Device> {
    vec![
        // allow mknod for any device
        Device::rule_only(DeviceType::Char, WILDCARD, WILDCARD, "m"),
        Device::rule_only(DeviceType::Block, WILDCARD, WILDCARD, "m"),
        Device::node(DeviceType::Char, "/dev/null", 1, 3, "rwm"),
        Device::node(DeviceType::Char, "/dev/random", 1, 8, "rwm"),
        Device::node(DeviceType::Char, "/dev/full", 1, 7, "rwm"),
        Device::node(DeviceType::Char, "/dev/tty", 5, 0, "rwm"),
        Device::node(DeviceType::Char, "/dev/zero", 1, 5, "rwm"),
        Device::node(DeviceType::Char, "/dev/urandom", 1, 9, "rwm"),
        // /dev/pts/*
        Device::rule_only(DeviceType::Char, 136, WILDCARD, "rwm"),
        // /dev/ptmx
        Device::rule_only(DeviceType::Char, 5, 2, "rwm"),
        // tuntap
        Device::rule_only(DeviceType::Char, 10, 200, "rwm"),
    ]
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_default_table() {
        let registry = Registry::default();
        let devices = registry.allowed_devices();
        assert_eq!(devices.len(), 11);
        assert!(devices.iter().all(|d| d.rule.allow));
        assert_eq!(devices[0].rule.to_cgroup_string(), "c *:* m");
        assert_eq!(devices[2].path, PathBuf::from("/dev/null"));
        assert_eq!(devices[2].file_mode, 0o666);
        assert_eq!(devices[8].rule.to_cgroup_string(), "c 136:* rwm");
    }

    #[test]
    fn test_custom_registry() {
        let registry = Registry::new(vec![Device::node(
            DeviceType::Char,
            "/dev/null",
            1,
            3,
            "rwm",
        )]);
        assert_eq!(registry.allowed_devices().len(), 1);
    }
}
