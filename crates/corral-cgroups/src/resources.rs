//! Resource limits applied to a container cgroup.
//!
//! Every limit is optional. A field that is `None` was not configured and must not be written
//! to the cgroup filesystem, which keeps "unset" distinct from an explicit zero.
use std::collections::HashMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Wildcard value for device major/minor numbers.
pub const WILDCARD: i64 = -1;

const MAX_CPU_WEIGHT: u64 = 10000;
const MAX_CPU_SHARES: u64 = 262144;

/// Kind of device a rule applies to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceType {
    #[serde(rename = "a")]
    Wildcard,
    #[serde(rename = "b")]
    Block,
    #[serde(rename = "c")]
    Char,
    #[serde(rename = "p")]
    Fifo,
}

impl DeviceType {
    pub fn as_char(&self) -> char {
        match self {
            Self::Wildcard => 'a',
            Self::Block => 'b',
            Self::Char => 'c',
            Self::Fifo => 'p',
        }
    }
}

impl Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// A device access rule in the cgroup v1 `devices.allow` format.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceRule {
    #[serde(rename = "type")]
    pub typ: DeviceType,
    pub major: i64,
    pub minor: i64,
    /// Any combination of "rwm".
    pub permissions: String,
    pub allow: bool,
}

impl DeviceRule {
    /// Renders the rule as written to `devices.allow`/`devices.deny`, e.g. `c 1:3 rwm`.
    pub fn to_cgroup_string(&self) -> String {
        let number = |n: i64| {
            if n == WILDCARD {
                "*".to_owned()
            } else {
                n.to_string()
            }
        };

        format!(
            "{} {}:{} {}",
            self.typ,
            number(self.major),
            number(self.minor),
            self.permissions
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WeightDevice {
    pub major: i64,
    pub minor: i64,
    pub weight: u16,
    pub leaf_weight: u16,
}

impl WeightDevice {
    pub fn new(major: i64, minor: i64, weight: u16, leaf_weight: u16) -> Self {
        Self {
            major,
            minor,
            weight,
            leaf_weight,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ThrottleDevice {
    pub major: i64,
    pub minor: i64,
    pub rate: u64,
}

impl ThrottleDevice {
    pub fn new(major: i64, minor: i64, rate: u64) -> Self {
        Self { major, minor, rate }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HugepageLimit {
    /// Hugepage size, e.g. "2MB"
    pub pagesize: String,
    pub limit: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IfPrioMap {
    pub interface: String,
    pub priority: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Resources {
    /// Device rules, evaluated in order.
    pub devices: Vec<DeviceRule>,

    // memory
    pub memory: Option<i64>,
    pub memory_reservation: Option<i64>,
    pub memory_swap: Option<i64>,
    pub memory_swappiness: Option<u64>,
    pub oom_kill_disable: Option<bool>,

    // cpu
    pub cpu_shares: Option<u64>,
    /// cgroup v2 weight derived from `cpu_shares`
    pub cpu_weight: Option<u64>,
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<u64>,
    pub cpu_rt_runtime: Option<i64>,
    pub cpu_rt_period: Option<u64>,
    pub cpuset_cpus: Option<String>,
    pub cpuset_mems: Option<String>,

    pub pids_limit: Option<i64>,

    // block io
    pub blkio_weight: Option<u16>,
    pub blkio_leaf_weight: Option<u16>,
    pub blkio_weight_device: Vec<WeightDevice>,
    pub blkio_throttle_read_bps_device: Vec<ThrottleDevice>,
    pub blkio_throttle_write_bps_device: Vec<ThrottleDevice>,
    pub blkio_throttle_read_iops_device: Vec<ThrottleDevice>,
    pub blkio_throttle_write_iops_device: Vec<ThrottleDevice>,

    pub hugetlb_limit: Vec<HugepageLimit>,

    // network
    pub net_cls_classid: Option<u32>,
    pub net_prio_ifpriomap: Vec<IfPrioMap>,

    /// Raw cgroup v2 key/value overrides, e.g. "memory.high" -> "1G".
    pub unified: HashMap<String, String>,
}

/// Converts a cgroup v1 cpu.shares value in [2, 262144] to a cgroup v2 cpu.weight value in
/// [1, 10000]. Zero means "not set" and converts to zero. Larger share values saturate at the
/// maximum weight.
pub fn convert_shares_to_cgroup2(shares: u64) -> u64 {
    if shares == 0 {
        return 0;
    }

    let shares = shares.min(MAX_CPU_SHARES);
    1 + shares.saturating_sub(2) * (MAX_CPU_WEIGHT - 1) / (MAX_CPU_SHARES - 2)
}
