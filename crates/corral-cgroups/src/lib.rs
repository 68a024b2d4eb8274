//! Control groups provide a way of controlling groups of processes.
//! This crate holds the cgroup configuration a container is translated to, resolves where the
//! cgroup lives for the cgroupfs and systemd drivers, and manages the cgroup on a unified
//! (v2) hierarchy.

pub mod common;
pub mod config;
pub mod resources;
pub mod systemd;
pub mod v2;

pub use config::{
    clean_path, Cgroup, CgroupDriver, CgroupPath, CgroupPathError, SystemdProperty,
    SystemdPropertyValue,
};
pub use resources::{convert_shares_to_cgroup2, Resources};
