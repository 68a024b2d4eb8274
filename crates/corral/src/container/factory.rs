use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use corral_cgroups::common::DEFAULT_CGROUP_ROOT;
use corral_cgroups::systemd::client::SystemdClient;
use once_cell::sync::Lazy;
use regex::Regex;

use super::{Container, State};
use crate::config::Config;
use crate::error::{ErrInvalidId, LibcorralError};
use crate::process::ProcessLauncher;

const MAX_ID_LEN: usize = 1024;

static ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_+.-]+$").expect("valid regex"));

/// Creates containers under a state root and loads them back, one directory per id.
pub struct Factory {
    root: PathBuf,
    cgroup_root: PathBuf,
    systemd_client: Option<Arc<dyn SystemdClient>>,
    launcher: Arc<dyn ProcessLauncher>,
}

impl Factory {
    pub fn new<P: Into<PathBuf>>(root: P, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            root: root.into(),
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            systemd_client: None,
            launcher,
        }
    }

    /// Mount point of the unified cgroup hierarchy.
    pub fn with_cgroup_root<P: Into<PathBuf>>(mut self, cgroup_root: P) -> Self {
        self.cgroup_root = cgroup_root.into();
        self
    }

    /// Needed by containers whose cgroup is resolved with the systemd driver.
    pub fn with_systemd_client(mut self, client: Arc<dyn SystemdClient>) -> Self {
        self.systemd_client = Some(client);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persists `config` under a new container directory. Either the container is fully
    /// created or nothing is left behind.
    pub fn create(&self, id: &str, config: Config) -> Result<Container, LibcorralError> {
        validate_id(id)?;

        fs::create_dir_all(&self.root).map_err(|err| LibcorralError::OtherIO {
            op: "create state root",
            path: self.root.to_owned(),
            source: err,
        })?;
        let container_root = self.root.join(id);
        match fs::create_dir(&container_root) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                tracing::error!(id, ?container_root, "container already exists");
                return Err(LibcorralError::Exist(id.to_owned()));
            }
            Err(err) => {
                return Err(LibcorralError::OtherIO {
                    op: "create container directory",
                    path: container_root,
                    source: err,
                })
            }
        }

        let mut state = State::new(id, config.bundle().map(PathBuf::from).unwrap_or_default());
        state.annotations = annotations(&config);
        state.rootless = config.rootless_euid;

        let container = Container {
            state,
            root: container_root,
            config,
            cgroup_root: self.cgroup_root.clone(),
            systemd_client: self.systemd_client.clone(),
            launcher: self.launcher.clone(),
        };

        let persisted = container
            .config
            .save(&container.root)
            .map_err(LibcorralError::from)
            .and_then(|_| container.save());
        if let Err(err) = persisted {
            if let Err(cleanup) = fs::remove_dir_all(&container.root) {
                tracing::warn!(
                    root = ?container.root,
                    err = %cleanup,
                    "failed to clean up partially created container",
                );
            }
            return Err(err);
        }

        tracing::debug!(id, root = ?container.root, "container created");
        Ok(container)
    }

    /// Loads a container created earlier, possibly by another process.
    pub fn load(&self, id: &str) -> Result<Container, LibcorralError> {
        validate_id(id)?;

        let container_root = self.root.join(id);
        if !container_root.exists() {
            return Err(LibcorralError::NotFound(id.to_owned()));
        }

        let state = State::load(&container_root)?;
        let config = Config::load(&container_root)?;
        let mut container = Container {
            state,
            root: container_root,
            config,
            cgroup_root: self.cgroup_root.clone(),
            systemd_client: self.systemd_client.clone(),
            launcher: self.launcher.clone(),
        };
        container.refresh_status();
        Ok(container)
    }
}

pub fn validate_id(id: &str) -> Result<(), ErrInvalidId> {
    if id.is_empty() {
        return Err(ErrInvalidId::Empty);
    }
    if id.len() > MAX_ID_LEN {
        return Err(ErrInvalidId::TooLong(id.len()));
    }

    // the id becomes a directory name
    if !ID_REGEX.is_match(id) || id == "." || id == ".." {
        return Err(ErrInvalidId::InvalidFormat(id.to_owned()));
    }

    Ok(())
}

fn annotations(config: &Config) -> HashMap<String, String> {
    config
        .labels
        .iter()
        .filter_map(|label| label.split_once('='))
        .filter(|(key, _)| *key != "bundle")
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .collect()
}
