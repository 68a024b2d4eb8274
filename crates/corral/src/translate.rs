//! Turns an input spec into the [`Config`] a container is created from.
use std::path::{Path, PathBuf};

use corral_cgroups::CgroupDriver;
use nix::mount::MsFlags;

use crate::cgroups::create_cgroup_config;
use crate::config::{Capabilities, Config, IntelRdt, Network};
use crate::devices::create_devices;
use crate::error::{LibcorralError, ValidationError};
use crate::mount::{create_config_mount, propagation_flag};
use crate::namespaces::NamespaceType;
use crate::registry::Registry;
use crate::seccomp::setup_seccomp;
use crate::spec::{Linux, Process, Spec};
use crate::user_ns::setup_user_namespace;

const CONFIG_VERSION: &str = "1.0";

#[derive(Debug, Clone)]
pub struct CreateOpts<'a> {
    /// Cgroup name used when the `Spec` does not configure a cgroups path, usually the
    /// container id.
    pub cgroup_name: String,
    pub use_systemd_cgroup: bool,
    pub no_pivot_root: bool,
    pub no_new_keyring: bool,
    pub spec: &'a Spec,
    pub rootless_euid: bool,
    pub rootless_cgroups: bool,
    /// Directory relative paths of the `Spec` are resolved against. Defaults to the current
    /// working directory.
    pub bundle: Option<PathBuf>,
}

impl<'a> CreateOpts<'a> {
    pub fn new(cgroup_name: &str, spec: &'a Spec) -> Self {
        Self {
            cgroup_name: cgroup_name.to_owned(),
            use_systemd_cgroup: false,
            no_pivot_root: false,
            no_new_keyring: false,
            spec,
            rootless_euid: false,
            rootless_cgroups: false,
            bundle: None,
        }
    }

    pub fn cgroup_driver(&self) -> CgroupDriver {
        if self.use_systemd_cgroup {
            CgroupDriver::Systemd
        } else {
            CgroupDriver::CgroupFs
        }
    }
}

fn bundle_dir(bundle: Option<&Path>) -> Result<PathBuf, LibcorralError> {
    let cwd = std::env::current_dir().map_err(|err| LibcorralError::OtherIO {
        op: "get current directory",
        path: PathBuf::from("."),
        source: err,
    })?;
    Ok(match bundle {
        Some(bundle) if bundle.is_absolute() => bundle.to_owned(),
        Some(bundle) => cwd.join(bundle),
        None => cwd,
    })
}

fn root_propagation(value: &str) -> Result<MsFlags, ValidationError> {
    if value.is_empty() {
        return Ok(MsFlags::empty());
    }
    propagation_flag(value)
        .ok_or_else(|| ValidationError::UnsupportedRootPropagation(value.to_owned()))
}

/// Builds the container config. Nothing is touched on the host.
pub fn create_config(registry: &Registry, opts: &CreateOpts) -> Result<Config, LibcorralError> {
    let spec = opts.spec;
    let cwd = bundle_dir(opts.bundle.as_deref())?;

    let root = spec.root.as_ref().ok_or(ValidationError::MissingRoot)?;
    let rootfs = if root.path.is_absolute() {
        root.path.clone()
    } else {
        cwd.join(&root.path)
    };

    let mut labels: Vec<String> = spec
        .annotations
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    labels.sort();
    labels.push(format!("bundle={}", cwd.display()));

    let mut config = Config {
        rootfs,
        no_pivot_root: opts.no_pivot_root,
        readonlyfs: root.readonly,
        hostname: spec.hostname.clone(),
        labels,
        no_new_keyring: opts.no_new_keyring,
        rootless_euid: opts.rootless_euid,
        rootless_cgroups: opts.rootless_cgroups,
        ..Default::default()
    };

    for m in &spec.mounts {
        if !m.destination.is_absolute() {
            tracing::warn!(
                destination = ?m.destination,
                "mount destination is not absolute, support for this will be removed",
            );
        }
        config.mounts.push(create_config_mount(&cwd, m));
    }

    let compiled = create_devices(registry, spec.linux.as_ref())?;
    config.devices = compiled.devices;

    config.cgroups = create_cgroup_config(
        spec,
        opts.cgroup_driver(),
        &opts.cgroup_name,
        &compiled.defaults,
    )?;

    if let Some(linux) = &spec.linux {
        apply_linux(linux, &mut config)?;
    }

    if let Some(process) = &spec.process {
        apply_process(process, &mut config);
    }

    config.version = CONFIG_VERSION.to_owned();
    tracing::debug!(rootfs = ?config.rootfs, namespaces = config.namespaces.len(), "translated spec");
    Ok(config)
}

fn apply_linux(linux: &Linux, config: &mut Config) -> Result<(), LibcorralError> {
    config.root_propagation = root_propagation(&linux.rootfs_propagation)?;
    if config.no_pivot_root && config.root_propagation.contains(MsFlags::MS_PRIVATE) {
        return Err(ValidationError::UnsafePropagation.into());
    }

    for ns in &linux.namespaces {
        let typ = NamespaceType::from_spec_kind(&ns.typ)
            .ok_or_else(|| ValidationError::UnknownNamespace(ns.typ.clone()))?;
        if config.namespaces.contains(typ) {
            return Err(ValidationError::DuplicatedNamespace(ns.typ.clone()).into());
        }
        config.namespaces.add(typ, ns.path.as_str());
    }

    if config.namespaces.contains(NamespaceType::Net)
        && config.namespaces.path_of(NamespaceType::Net).is_empty()
    {
        config.networks = vec![Network::loopback()];
    }

    if config.namespaces.contains(NamespaceType::User) {
        setup_user_namespace(Some(linux), config)?;
    }

    config.mask_paths = linux.masked_paths.clone();
    config.readonly_paths = linux.readonly_paths.clone();
    config.mount_label = linux.mount_label.clone();
    config.sysctl = linux.sysctl.clone();
    config.seccomp = setup_seccomp(linux.seccomp.as_ref())?;
    config.intel_rdt = linux.intel_rdt.as_ref().map(|rdt| IntelRdt {
        l3_cache_schema: rdt.l3_cache_schema.clone(),
        mem_bw_schema: rdt.mem_bw_schema.clone(),
    });

    Ok(())
}

fn apply_process(process: &Process, config: &mut Config) {
    config.oom_score_adj = process.oom_score_adj;
    config.no_new_privileges = process.no_new_privileges;
    config.umask = process.user.umask;
    config.process_label = process.selinux_label.clone();
    config.capabilities = process.capabilities.as_ref().map(|caps| Capabilities {
        bounding: caps.bounding.clone(),
        effective: caps.effective.clone(),
        inheritable: caps.inheritable.clone(),
        permitted: caps.permitted.clone(),
        ambient: caps.ambient.clone(),
    });
}
