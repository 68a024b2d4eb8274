//! Information about status and state of the container
use std::collections::HashMap;
use std::fmt::Display;
use std::fs;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

/// Indicates status of the container
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ContainerStatus {
    // The container exists and its init process, if any, waits on the exec fifo
    #[default]
    Created,
    // The init process runs the user program
    Running,
    // A freeze was requested and has not completed yet
    Pausing,
    // Every process of the container is frozen
    Paused,
    // The init process has exited or the container was destroyed
    Stopped,
}

impl ContainerStatus {
    pub fn can_start(&self) -> bool {
        matches!(self, ContainerStatus::Created)
    }

    pub fn can_signal(&self) -> bool {
        use ContainerStatus::*;
        match self {
            Stopped => false,
            Created | Running | Pausing | Paused => true,
        }
    }

    pub fn can_pause(&self) -> bool {
        matches!(self, ContainerStatus::Created | ContainerStatus::Running)
    }

    pub fn can_resume(&self) -> bool {
        matches!(self, ContainerStatus::Paused)
    }

    pub fn can_destroy(&self) -> bool {
        matches!(self, ContainerStatus::Created | ContainerStatus::Stopped)
    }
}

impl Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match *self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        };

        write!(f, "{print}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to open container state file {state_file_path:?}")]
    OpenStateFile {
        state_file_path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse container state file {state_file_path:?}")]
    ParseStateFile {
        state_file_path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write container state file {state_file_path:?}")]
    WriteStateFile {
        state_file_path: PathBuf,
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, StateError>;

/// Stores the state information of the container
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct State {
    pub id: String,
    pub status: ContainerStatus,
    // Pid of the init process as seen by the runtime, set by the first start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    pub bundle: PathBuf,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub rootless: bool,
}

impl State {
    const STATE_FILE_PATH: &'static str = "state.json";

    pub fn new(container_id: &str, bundle: PathBuf) -> Self {
        Self {
            id: container_id.to_owned(),
            status: ContainerStatus::Created,
            pid: None,
            bundle,
            created: Utc::now(),
            annotations: HashMap::new(),
            rootless: false,
        }
    }

    #[instrument(level = "trace")]
    pub fn save(&self, container_root: &Path) -> Result<()> {
        let state_file_path = Self::file_path(container_root);
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&state_file_path)
            .map_err(|err| {
                tracing::error!(
                    ?state_file_path,
                    %err,
                    "failed to open container state file",
                );
                StateError::OpenStateFile {
                    state_file_path: state_file_path.to_owned(),
                    source: err,
                }
            })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self).map_err(|err| {
            tracing::error!(
                ?state_file_path,
                %err,
                "failed to serialize container state",
            );
            StateError::ParseStateFile {
                state_file_path: state_file_path.to_owned(),
                source: err,
            }
        })?;
        writer.flush().map_err(|err| {
            tracing::error!(
                ?state_file_path,
                %err,
                "failed to write container state file",
            );
            StateError::WriteStateFile {
                state_file_path: state_file_path.to_owned(),
                source: err,
            }
        })?;

        Ok(())
    }

    #[instrument(level = "trace")]
    pub fn load(container_root: &Path) -> Result<Self> {
        let state_file_path = Self::file_path(container_root);
        let state_file = File::open(&state_file_path).map_err(|err| {
            tracing::error!(
                ?state_file_path,
                %err,
                "failed to open container state file",
            );
            StateError::OpenStateFile {
                state_file_path: state_file_path.to_owned(),
                source: err,
            }
        })?;

        let state: Self = serde_json::from_reader(BufReader::new(state_file)).map_err(|err| {
            tracing::error!(
                ?state_file_path,
                %err,
                "failed to parse container state file",
            );
            StateError::ParseStateFile {
                state_file_path: state_file_path.to_owned(),
                source: err,
            }
        })?;

        Ok(state)
    }

    /// Returns the path to the state JSON file for the provided `container_root`.
    ///
    /// ```
    /// # use std::path::Path;
    /// # use corral::container::State;
    ///
    /// let container_root = Path::new("/run/corral/container");
    /// let state_file = State::file_path(&container_root);
    /// assert_eq!(state_file.to_str(), Some("/run/corral/container/state.json"));
    /// ```
    pub fn file_path(container_root: &Path) -> PathBuf {
        container_root.join(Self::STATE_FILE_PATH)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    #[test]
    fn test_created_status() {
        let cstatus = ContainerStatus::default();
        assert!(cstatus.can_start());
        assert!(cstatus.can_signal());
        assert!(cstatus.can_pause());
        assert!(!cstatus.can_resume());
        assert!(cstatus.can_destroy());
    }

    #[test]
    fn test_running_status() {
        let cstatus = ContainerStatus::Running;
        assert!(!cstatus.can_start());
        assert!(cstatus.can_signal());
        assert!(cstatus.can_pause());
        assert!(!cstatus.can_resume());
        assert!(!cstatus.can_destroy());
    }

    #[test]
    fn test_pausing_status() {
        let cstatus = ContainerStatus::Pausing;
        assert!(!cstatus.can_start());
        assert!(cstatus.can_signal());
        assert!(!cstatus.can_pause());
        assert!(!cstatus.can_resume());
        assert!(!cstatus.can_destroy());
    }

    #[test]
    fn test_paused_status() {
        let cstatus = ContainerStatus::Paused;
        assert!(!cstatus.can_start());
        assert!(cstatus.can_signal());
        assert!(!cstatus.can_pause());
        assert!(cstatus.can_resume());
        assert!(!cstatus.can_destroy());
    }

    #[test]
    fn test_stopped_status() {
        let cstatus = ContainerStatus::Stopped;
        assert!(!cstatus.can_start());
        assert!(!cstatus.can_signal());
        assert!(!cstatus.can_pause());
        assert!(!cstatus.can_resume());
        assert!(cstatus.can_destroy());
    }

    #[test]
    fn test_save_and_load() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut state = State::new("ct1", PathBuf::from("/srv/bundle"));
        state.pid = Some(42);
        state.status = ContainerStatus::Paused;
        state
            .annotations
            .insert("com.example.key".to_owned(), "value".to_owned());

        state.save(tmp.path())?;
        let raw = fs::read_to_string(State::file_path(tmp.path()))?;
        assert!(raw.contains("\"status\":\"paused\""));

        assert_eq!(State::load(tmp.path())?, state);
        Ok(())
    }

    #[test]
    fn test_load_missing() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            State::load(tmp.path()),
            Err(StateError::OpenStateFile { .. })
        ));
    }
}
