//! Builds the cgroup configuration of a container from the resources block of its spec.
use std::collections::HashMap;

use corral_cgroups::resources::{
    DeviceRule, HugepageLimit, IfPrioMap, ThrottleDevice, WeightDevice, WILDCARD,
};
use corral_cgroups::{
    convert_shares_to_cgroup2, Cgroup, CgroupDriver, Resources, SystemdProperty,
    SystemdPropertyValue,
};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::devices::{cgroup_device_type, Device};
use crate::error::ValidationError;
use crate::spec::{LinuxResources, LinuxThrottleDevice, Spec};

const SYSTEMD_PROPERTY_PREFIX: &str = "org.systemd.property.";
const USEC_PER_SEC: u64 = 1_000_000;

static VALID_PROPERTY_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z]{3,}$").expect("valid regex"));
static SEC_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"[a-z]Sec$").expect("valid regex"));

/// Creates the cgroup of container `name`.
///
/// `default_devices` are appended to the device rules of the `Spec`, so a `Spec` rule is
/// evaluated first.
pub fn create_cgroup_config(
    spec: &Spec,
    driver: CgroupDriver,
    name: &str,
    default_devices: &[Device],
) -> Result<Cgroup, ValidationError> {
    let mut cgroup = Cgroup::default();

    if driver == CgroupDriver::Systemd {
        cgroup.systemd_props = systemd_properties(&spec.annotations)?;
    }

    let cgroups_path = spec
        .linux
        .as_ref()
        .map(|l| l.cgroups_path.as_str())
        .unwrap_or_default();
    cgroup.path = driver.resolve(cgroups_path, name)?;

    if let Some(r) = spec.linux.as_ref().and_then(|l| l.resources.as_ref()) {
        cgroup.resources = translate_resources(r)?;
    }

    cgroup.resources.devices.extend(
        default_devices
            .iter()
            .map(|device| device.rule.clone()),
    );

    Ok(cgroup)
}

fn translate_resources(r: &LinuxResources) -> Result<Resources, ValidationError> {
    let mut resources = Resources::default();

    for (i, d) in r.devices.iter().enumerate() {
        if d.access.is_empty() {
            return Err(ValidationError::EmptyDeviceAccess(i));
        }
        let typ = if d.typ.is_empty() { "a" } else { d.typ.as_str() };
        resources.devices.push(DeviceRule {
            typ: cgroup_device_type(typ)?,
            major: d.major.unwrap_or(WILDCARD),
            minor: d.minor.unwrap_or(WILDCARD),
            permissions: d.access.clone(),
            allow: d.allow,
        });
    }

    if let Some(memory) = &r.memory {
        resources.memory = memory.limit;
        resources.memory_reservation = memory.reservation;
        resources.memory_swap = memory.swap;
        if memory.kernel.is_some() || memory.kernel_tcp.is_some() {
            tracing::warn!("kernel memory settings are ignored and will be removed");
        }
        resources.memory_swappiness = memory.swappiness;
        resources.oom_kill_disable = memory.disable_oom_killer;
    }

    if let Some(cpu) = &r.cpu {
        if let Some(shares) = cpu.shares {
            resources.cpu_shares = Some(shares);
            resources.cpu_weight = Some(convert_shares_to_cgroup2(shares));
        }
        resources.cpu_quota = cpu.quota;
        resources.cpu_period = cpu.period;
        resources.cpu_rt_runtime = cpu.realtime_runtime;
        resources.cpu_rt_period = cpu.realtime_period;
        resources.cpuset_cpus = Some(cpu.cpus.clone()).filter(|s| !s.is_empty());
        resources.cpuset_mems = Some(cpu.mems.clone()).filter(|s| !s.is_empty());
    }

    if let Some(pids) = &r.pids {
        resources.pids_limit = Some(pids.limit);
    }

    if let Some(block_io) = &r.block_io {
        resources.blkio_weight = block_io.weight;
        resources.blkio_leaf_weight = block_io.leaf_weight;
        resources.blkio_weight_device = block_io
            .weight_device
            .iter()
            .map(|wd| {
                WeightDevice::new(
                    wd.major,
                    wd.minor,
                    wd.weight.unwrap_or_default(),
                    wd.leaf_weight.unwrap_or_default(),
                )
            })
            .collect();
        resources.blkio_throttle_read_bps_device =
            throttle_devices(&block_io.throttle_read_bps_device);
        resources.blkio_throttle_write_bps_device =
            throttle_devices(&block_io.throttle_write_bps_device);
        resources.blkio_throttle_read_iops_device =
            throttle_devices(&block_io.throttle_read_iops_device);
        resources.blkio_throttle_write_iops_device =
            throttle_devices(&block_io.throttle_write_iops_device);
    }

    resources.hugetlb_limit = r
        .hugepage_limits
        .iter()
        .map(|l| HugepageLimit {
            pagesize: l.page_size.clone(),
            limit: l.limit,
        })
        .collect();

    if let Some(network) = &r.network {
        resources.net_cls_classid = network.class_id;
        resources.net_prio_ifpriomap = network
            .priorities
            .iter()
            .map(|p| IfPrioMap {
                interface: p.name.clone(),
                priority: i64::from(p.priority),
            })
            .collect();
    }

    resources.unified = r.unified.clone();

    Ok(resources)
}

fn throttle_devices(devices: &[LinuxThrottleDevice]) -> Vec<ThrottleDevice> {
    devices
        .iter()
        .map(|td| ThrottleDevice::new(td.major, td.minor, td.rate))
        .collect()
}

/// Collects unit properties from `org.systemd.property.<Name>` annotations, sorted by
/// annotation key. A `<name>Sec` property is passed to systemd as `<name>USec`.
pub fn systemd_properties(
    annotations: &HashMap<String, String>,
) -> Result<Vec<SystemdProperty>, ValidationError> {
    let mut keys: Vec<&String> = annotations.keys().collect();
    keys.sort();

    let mut properties = Vec::new();
    for key in keys {
        let name = match key.strip_prefix(SYSTEMD_PROPERTY_PREFIX) {
            Some(name) => name,
            None => continue,
        };
        if !VALID_PROPERTY_NAME.is_match(name) {
            return Err(ValidationError::InvalidSystemdPropertyName {
                key: key.clone(),
                name: name.to_owned(),
            });
        }

        let raw = &annotations[key];
        let parse_error = |reason: &str| ValidationError::InvalidSystemdPropertyValue {
            key: key.clone(),
            value: raw.clone(),
            reason: reason.to_owned(),
        };

        let mut value = parse_property_value(raw).ok_or_else(|| parse_error("invalid value"))?;
        let mut name = name.to_owned();
        if SEC_SUFFIX.is_match(&name) {
            name = format!("{}USec", &name[..name.len() - "Sec".len()]);
            value = sec_to_usec(&value).ok_or_else(|| parse_error("not a number"))?;
        }

        properties.push(SystemdProperty { name, value });
    }

    Ok(properties)
}

/// Parses a property value in D-Bus variant text form: booleans, numbers with an optional
/// type prefix (`uint64 10`), and quoted strings.
fn parse_property_value(raw: &str) -> Option<SystemdPropertyValue> {
    let raw = raw.trim();
    match raw {
        "true" => return Some(SystemdPropertyValue::Bool(true)),
        "false" => return Some(SystemdPropertyValue::Bool(false)),
        _ => {}
    }

    if let Some((typ, number)) = raw.split_once(' ') {
        let number = number.trim();
        return match typ {
            "byte" | "uint16" | "uint32" | "uint64" => {
                number.parse().ok().map(SystemdPropertyValue::UInt)
            }
            "int16" | "int32" | "int64" => number.parse().ok().map(SystemdPropertyValue::Int),
            "double" => number.parse().ok().map(SystemdPropertyValue::Float),
            _ => None,
        };
    }

    if raw.len() >= 2
        && ((raw.starts_with('\'') && raw.ends_with('\''))
            || (raw.starts_with('"') && raw.ends_with('"')))
    {
        return Some(SystemdPropertyValue::Str(raw[1..raw.len() - 1].to_owned()));
    }

    if let Ok(v) = raw.parse::<i64>() {
        return Some(SystemdPropertyValue::Int(v));
    }
    if let Ok(v) = raw.parse::<u64>() {
        return Some(SystemdPropertyValue::UInt(v));
    }
    raw.parse::<f64>().ok().map(SystemdPropertyValue::Float)
}

fn sec_to_usec(value: &SystemdPropertyValue) -> Option<SystemdPropertyValue> {
    let usec = match value {
        SystemdPropertyValue::Int(v) => u64::try_from(*v).ok()?.checked_mul(USEC_PER_SEC)?,
        SystemdPropertyValue::UInt(v) => v.checked_mul(USEC_PER_SEC)?,
        SystemdPropertyValue::Float(v) if *v >= 0.0 => (v * USEC_PER_SEC as f64) as u64,
        _ => return None,
    };
    Some(SystemdPropertyValue::UInt(usec))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use anyhow::Result;
    use corral_cgroups::resources::DeviceType;
    use corral_cgroups::{CgroupPath, CgroupPathError};

    use super::*;
    use crate::registry::Registry;
    use crate::spec::{
        Linux, LinuxBlockIo, LinuxCpu, LinuxDeviceCgroup, LinuxMemory, LinuxNetwork, LinuxPids,
        LinuxInterfacePriority,
    };

    fn spec_with(cgroups_path: &str, resources: Option<LinuxResources>) -> Spec {
        Spec {
            linux: Some(Linux {
                cgroups_path: cgroups_path.to_owned(),
                resources,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_cgroupfs_path_is_cleaned() -> Result<()> {
        let spec = spec_with("../../../escape/me", None);
        let cgroup = create_cgroup_config(&spec, CgroupDriver::CgroupFs, "ct1", &[])?;
        assert_eq!(
            cgroup.path,
            CgroupPath::CgroupFs {
                path: PathBuf::from("escape/me"),
                name: String::new(),
            }
        );
        assert!(cgroup.systemd_props.is_empty());
        Ok(())
    }

    #[test]
    fn test_systemd_paths() -> Result<()> {
        let cgroup = create_cgroup_config(&Spec::default(), CgroupDriver::Systemd, "ct1", &[])?;
        assert_eq!(
            cgroup.path,
            CgroupPath::Systemd {
                parent: String::new(),
                scope_prefix: "runc".to_owned(),
                name: "ct1".to_owned(),
            }
        );

        let spec = spec_with("machine.slice:corral:ct1", None);
        let cgroup = create_cgroup_config(&spec, CgroupDriver::Systemd, "ignored", &[])?;
        assert_eq!(
            cgroup.path,
            CgroupPath::Systemd {
                parent: "machine.slice".to_owned(),
                scope_prefix: "corral".to_owned(),
                name: "ct1".to_owned(),
            }
        );

        let spec = spec_with("machine.slice:ct1", None);
        let err = create_cgroup_config(&spec, CgroupDriver::Systemd, "ct1", &[]).unwrap_err();
        assert_eq!(
            err,
            ValidationError::CgroupPath(CgroupPathError::MalformedSystemdPath(
                "machine.slice:ct1".to_owned()
            ))
        );
        Ok(())
    }

    #[test]
    fn test_absent_limits_stay_unset() -> Result<()> {
        let resources = LinuxResources {
            memory: Some(LinuxMemory {
                limit: Some(1 << 20),
                ..Default::default()
            }),
            cpu: Some(LinuxCpu {
                quota: Some(50000),
                ..Default::default()
            }),
            ..Default::default()
        };
        let cgroup = create_cgroup_config(
            &spec_with("", Some(resources)),
            CgroupDriver::CgroupFs,
            "ct1",
            &[],
        )?;
        let r = &cgroup.resources;
        assert_eq!(r.memory, Some(1 << 20));
        assert_eq!(r.memory_swap, None);
        assert_eq!(r.memory_swappiness, None);
        assert_eq!(r.oom_kill_disable, None);
        assert_eq!(r.cpu_quota, Some(50000));
        assert_eq!(r.cpu_shares, None);
        assert_eq!(r.cpu_weight, None);
        assert_eq!(r.cpuset_cpus, None);
        assert_eq!(r.pids_limit, None);
        Ok(())
    }

    #[test]
    fn test_huge_cpu_shares_saturate() -> Result<()> {
        let spec: Spec = serde_json::from_str(
            r#"{"linux": {"resources": {"cpu": {"shares": 18446744073709551}}}}"#,
        )?;
        let cgroup = create_cgroup_config(&spec, CgroupDriver::CgroupFs, "ct1", &[])?;
        assert_eq!(cgroup.resources.cpu_shares, Some(18446744073709551));
        assert_eq!(cgroup.resources.cpu_weight, Some(10000));
        Ok(())
    }

    #[test]
    fn test_resource_translation() -> Result<()> {
        let resources = LinuxResources {
            cpu: Some(LinuxCpu {
                shares: Some(1024),
                cpus: "0-3".to_owned(),
                ..Default::default()
            }),
            pids: Some(LinuxPids { limit: 0 }),
            block_io: Some(LinuxBlockIo {
                weight: Some(500),
                weight_device: vec![crate::spec::LinuxWeightDevice {
                    major: 8,
                    minor: 0,
                    weight: Some(300),
                    leaf_weight: None,
                }],
                throttle_write_bps_device: vec![LinuxThrottleDevice {
                    major: 8,
                    minor: 0,
                    rate: 1024,
                }],
                ..Default::default()
            }),
            network: Some(LinuxNetwork {
                class_id: Some(0x100001),
                priorities: vec![LinuxInterfacePriority {
                    name: "eth0".to_owned(),
                    priority: 5,
                }],
            }),
            unified: HashMap::from([("memory.high".to_owned(), "1G".to_owned())]),
            ..Default::default()
        };
        let cgroup = create_cgroup_config(
            &spec_with("", Some(resources)),
            CgroupDriver::CgroupFs,
            "ct1",
            &[],
        )?;
        let r = &cgroup.resources;
        assert_eq!(r.cpu_shares, Some(1024));
        assert_eq!(r.cpu_weight, Some(39));
        assert_eq!(r.cpuset_cpus.as_deref(), Some("0-3"));
        assert_eq!(r.pids_limit, Some(0));
        assert_eq!(r.blkio_weight, Some(500));
        assert_eq!(r.blkio_weight_device, vec![WeightDevice::new(8, 0, 300, 0)]);
        assert_eq!(
            r.blkio_throttle_write_bps_device,
            vec![ThrottleDevice::new(8, 0, 1024)]
        );
        assert!(r.blkio_throttle_read_bps_device.is_empty());
        assert_eq!(r.net_cls_classid, Some(0x100001));
        assert_eq!(r.net_prio_ifpriomap[0].priority, 5);
        assert_eq!(r.unified["memory.high"], "1G");
        Ok(())
    }

    #[test]
    fn test_device_rules_come_before_defaults() -> Result<()> {
        let resources = LinuxResources {
            devices: vec![
                LinuxDeviceCgroup {
                    allow: false,
                    access: "rwm".to_owned(),
                    ..Default::default()
                },
                LinuxDeviceCgroup {
                    allow: true,
                    typ: "c".to_owned(),
                    major: Some(10),
                    minor: Some(229),
                    access: "rw".to_owned(),
                },
            ],
            ..Default::default()
        };
        let registry = Registry::default();
        let cgroup = create_cgroup_config(
            &spec_with("", Some(resources)),
            CgroupDriver::CgroupFs,
            "ct1",
            registry.allowed_devices(),
        )?;
        let devices = &cgroup.resources.devices;
        assert_eq!(devices.len(), 2 + registry.allowed_devices().len());
        assert_eq!(devices[0].to_cgroup_string(), "a *:* rwm");
        assert!(!devices[0].allow);
        assert_eq!(devices[1].typ, DeviceType::Char);
        assert_eq!(devices[1].to_cgroup_string(), "c 10:229 rw");
        assert_eq!(devices[2], registry.allowed_devices()[0].rule);
        Ok(())
    }

    #[test]
    fn test_device_rule_errors() {
        let resources = LinuxResources {
            devices: vec![
                LinuxDeviceCgroup {
                    access: "r".to_owned(),
                    ..Default::default()
                },
                LinuxDeviceCgroup::default(),
            ],
            ..Default::default()
        };
        let err = create_cgroup_config(
            &spec_with("", Some(resources)),
            CgroupDriver::CgroupFs,
            "ct1",
            &[],
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::EmptyDeviceAccess(1));

        let resources = LinuxResources {
            devices: vec![LinuxDeviceCgroup {
                typ: "p".to_owned(),
                access: "r".to_owned(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let err = create_cgroup_config(
            &spec_with("", Some(resources)),
            CgroupDriver::CgroupFs,
            "ct1",
            &[],
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::InvalidCgroupDeviceType("p".to_owned()));
    }

    #[test]
    fn test_systemd_properties() -> Result<()> {
        let annotations = HashMap::from([
            (
                "org.systemd.property.TimeoutStopSec".to_owned(),
                "10".to_owned(),
            ),
            (
                "org.systemd.property.CollectMode".to_owned(),
                "'inactive-or-failed'".to_owned(),
            ),
            (
                "org.systemd.property.CPUQuotaPeriodSec".to_owned(),
                "double 0.5".to_owned(),
            ),
            ("com.example.other".to_owned(), "x".to_owned()),
        ]);
        let properties = systemd_properties(&annotations)?;
        assert_eq!(
            properties,
            vec![
                SystemdProperty {
                    name: "CPUQuotaPeriodUSec".to_owned(),
                    value: SystemdPropertyValue::UInt(500_000),
                },
                SystemdProperty {
                    name: "CollectMode".to_owned(),
                    value: SystemdPropertyValue::Str("inactive-or-failed".to_owned()),
                },
                SystemdProperty {
                    name: "TimeoutStopUSec".to_owned(),
                    value: SystemdPropertyValue::UInt(10_000_000),
                },
            ]
        );
        Ok(())
    }

    #[test]
    fn test_systemd_properties_only_for_systemd_driver() -> Result<()> {
        let spec = Spec {
            annotations: HashMap::from([(
                "org.systemd.property.TimeoutStopSec".to_owned(),
                "10".to_owned(),
            )]),
            ..Default::default()
        };
        let cgroup = create_cgroup_config(&spec, CgroupDriver::CgroupFs, "ct1", &[])?;
        assert!(cgroup.systemd_props.is_empty());
        let cgroup = create_cgroup_config(&spec, CgroupDriver::Systemd, "ct1", &[])?;
        assert_eq!(cgroup.systemd_props.len(), 1);
        Ok(())
    }

    #[test]
    fn test_invalid_systemd_properties() {
        let annotations = HashMap::from([("org.systemd.property.Ab".to_owned(), "1".to_owned())]);
        assert!(matches!(
            systemd_properties(&annotations),
            Err(ValidationError::InvalidSystemdPropertyName { .. })
        ));

        let annotations = HashMap::from([(
            "org.systemd.property.TimeoutStopSec".to_owned(),
            "'ten'".to_owned(),
        )]);
        assert!(matches!(
            systemd_properties(&annotations),
            Err(ValidationError::InvalidSystemdPropertyValue { .. })
        ));

        let annotations = HashMap::from([(
            "org.systemd.property.Delegate".to_owned(),
            "maybe so".to_owned(),
        )]);
        assert!(matches!(
            systemd_properties(&annotations),
            Err(ValidationError::InvalidSystemdPropertyValue { .. })
        ));
    }

    #[test]
    fn test_parse_property_value() {
        assert_eq!(
            parse_property_value("true"),
            Some(SystemdPropertyValue::Bool(true))
        );
        assert_eq!(
            parse_property_value("-3"),
            Some(SystemdPropertyValue::Int(-3))
        );
        assert_eq!(
            parse_property_value("uint64 18446744073709551615"),
            Some(SystemdPropertyValue::UInt(u64::MAX))
        );
        assert_eq!(
            parse_property_value("\"quoted\""),
            Some(SystemdPropertyValue::Str("quoted".to_owned()))
        );
        assert_eq!(parse_property_value("bare"), None);
    }
}
