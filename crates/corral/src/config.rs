//! The fully resolved configuration of a container, produced by the translator and persisted
//! next to the container state.
use std::collections::HashMap;
use std::fs;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use corral_cgroups::Cgroup;
use nix::mount::MsFlags;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::devices::Device;
use crate::mount::{self, ConfigMount};
use crate::namespaces::Namespaces;
use crate::seccomp::Seccomp;
use crate::user_ns::IdMap;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to open container config file {path:?}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse container config file {path:?}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write container config file {path:?}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, ConfigError>;

/// Capability names, e.g. `CAP_NET_BIND_SERVICE`, per set.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub bounding: Vec<String>,
    pub effective: Vec<String>,
    pub inheritable: Vec<String>,
    pub permitted: Vec<String>,
    pub ambient: Vec<String>,
}

/// A network interface to set up inside the network namespace.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Network {
    /// Driver name, "loopback" for the interface every new namespace gets.
    #[serde(rename = "type")]
    pub typ: String,
    pub name: String,
    pub bridge: String,
    pub mac_address: String,
    pub address: String,
    pub gateway: String,
    pub ipv6_address: String,
    pub ipv6_gateway: String,
    pub mtu: u32,
    pub txqueuelen: u32,
    pub host_interface_name: String,
    pub hairpin_mode: bool,
}

impl Network {
    pub fn loopback() -> Self {
        Self {
            typ: "loopback".to_owned(),
            ..Default::default()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct IntelRdt {
    pub l3_cache_schema: String,
    pub mem_bw_schema: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Use `MS_MOVE` and chroot instead of pivot_root.
    pub no_pivot_root: bool,
    pub parent_death_signal: i32,
    pub rootfs: PathBuf,
    pub umask: Option<u32>,
    pub readonlyfs: bool,
    #[serde(with = "mount::ms_flags")]
    pub root_propagation: MsFlags,
    pub mounts: Vec<ConfigMount>,
    pub devices: Vec<Device>,
    pub mount_label: String,
    pub hostname: String,
    pub namespaces: Namespaces,
    pub capabilities: Option<Capabilities>,
    pub networks: Vec<Network>,
    pub cgroups: Cgroup,
    pub process_label: String,
    pub oom_score_adj: Option<i32>,
    pub uid_mappings: Vec<IdMap>,
    pub gid_mappings: Vec<IdMap>,
    pub mask_paths: Vec<String>,
    pub readonly_paths: Vec<String>,
    pub sysctl: HashMap<String, String>,
    /// `None` disables syscall filtering.
    pub seccomp: Option<Seccomp>,
    pub no_new_privileges: bool,
    pub version: String,
    /// `key=value` pairs, the last one is `bundle=<path>`.
    pub labels: Vec<String>,
    pub no_new_keyring: bool,
    pub intel_rdt: Option<IntelRdt>,
    pub rootless_euid: bool,
    /// Cgroup errors are logged and ignored.
    pub rootless_cgroups: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            no_pivot_root: false,
            parent_death_signal: 0,
            rootfs: PathBuf::new(),
            umask: None,
            readonlyfs: false,
            root_propagation: MsFlags::empty(),
            mounts: Vec::new(),
            devices: Vec::new(),
            mount_label: String::new(),
            hostname: String::new(),
            namespaces: Namespaces::default(),
            capabilities: None,
            networks: Vec::new(),
            cgroups: Cgroup::default(),
            process_label: String::new(),
            oom_score_adj: None,
            uid_mappings: Vec::new(),
            gid_mappings: Vec::new(),
            mask_paths: Vec::new(),
            readonly_paths: Vec::new(),
            sysctl: HashMap::new(),
            seccomp: None,
            no_new_privileges: false,
            version: String::new(),
            labels: Vec::new(),
            no_new_keyring: false,
            intel_rdt: None,
            rootless_euid: false,
            rootless_cgroups: false,
        }
    }
}

impl Config {
    const CONFIG_FILE_PATH: &'static str = "config.json";

    /// Value of the `bundle=` label.
    pub fn bundle(&self) -> Option<&str> {
        self.labels
            .iter()
            .rev()
            .find_map(|label| label.strip_prefix("bundle="))
    }

    #[instrument(level = "trace", skip(self))]
    pub fn save(&self, container_root: &Path) -> Result<()> {
        let path = Self::file_path(container_root);
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|err| {
                tracing::error!(?path, %err, "failed to open container config file");
                ConfigError::Open {
                    path: path.to_owned(),
                    source: err,
                }
            })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self).map_err(|err| {
            tracing::error!(?path, %err, "failed to serialize container config");
            ConfigError::Parse {
                path: path.to_owned(),
                source: err,
            }
        })?;
        writer.flush().map_err(|err| {
            tracing::error!(?path, %err, "failed to write container config file");
            ConfigError::Write {
                path: path.to_owned(),
                source: err,
            }
        })?;

        Ok(())
    }

    #[instrument(level = "trace")]
    pub fn load(container_root: &Path) -> Result<Self> {
        let path = Self::file_path(container_root);
        let file = File::open(&path).map_err(|err| {
            tracing::error!(?path, %err, "failed to open container config file");
            ConfigError::Open {
                path: path.to_owned(),
                source: err,
            }
        })?;
        let config = serde_json::from_reader(BufReader::new(file)).map_err(|err| {
            tracing::error!(?path, %err, "failed to parse container config file");
            ConfigError::Parse {
                path: path.to_owned(),
                source: err,
            }
        })?;

        Ok(config)
    }

    pub fn file_path(container_root: &Path) -> PathBuf {
        container_root.join(Self::CONFIG_FILE_PATH)
    }
}
