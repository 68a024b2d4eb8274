use std::fmt::Display;
use std::path::PathBuf;

use corral_cgroups::common::{AnyManagerError, CreateCgroupSetupError};
use corral_cgroups::CgroupPathError;

use crate::config::ConfigError;
use crate::container::{ContainerStatus, StateError};
use crate::fd::ProtocolError;
use crate::process::LaunchError;
use crate::tty::TtyError;
use crate::user_ns::MappingError;

/// Problems with the input specification. These are reported to the caller as is and retrying
/// with the same input will fail the same way.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Root must be specified")]
    MissingRoot,
    #[error(transparent)]
    CgroupPath(#[from] CgroupPathError),
    #[error("seccomp flags are not yet supported: {0:?}")]
    UnsupportedSeccompFlags(Vec<String>),
    #[error("string {0} is not a valid action for seccomp")]
    UnknownSeccompAction(String),
    #[error("string {0} is not a valid operator for seccomp")]
    UnknownSeccompOperator(String),
    #[error("string {0} is not a valid arch for seccomp")]
    UnknownSeccompArch(String),
    #[error("invalid device type {0:?}")]
    InvalidDeviceType(String),
    #[error("invalid cgroup device type {0:?}")]
    InvalidCgroupDeviceType(String),
    #[error("device access at {0} field cannot be empty")]
    EmptyDeviceAccess(usize),
    #[error("namespace {0:?} does not exist")]
    UnknownNamespace(String),
    #[error("malformed spec file: duplicated ns {0:?}")]
    DuplicatedNamespace(String),
    #[error("rootfsPropagation={0} is not supported")]
    UnsupportedRootPropagation(String),
    #[error("rootfsPropagation of [r]private is not safe without pivot_root")]
    UnsafePropagation,
    #[error("annotation {key} name incorrect: {name}")]
    InvalidSystemdPropertyName { key: String, name: String },
    #[error("annotation {key}={value} value parse error: {reason}")]
    InvalidSystemdPropertyValue {
        key: String,
        value: String,
        reason: String,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ErrInvalidId {
    #[error("container id can't be empty")]
    Empty,
    #[error("container id is {0} characters long, the limit is 1024")]
    TooLong(usize),
    #[error("invalid container id format {0:?}")]
    InvalidFormat(String),
}

/// Lifecycle operations, used to report which transition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Run,
    Signal,
    Pause,
    Resume,
    Destroy,
    Set,
}

impl Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match self {
            Self::Start => "start",
            Self::Run => "run",
            Self::Signal => "signal",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Destroy => "destroy",
            Self::Set => "set",
        };

        write!(f, "{print}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LibcorralError {
    #[error("cannot {requested} container {id} while it is {current}")]
    IncorrectStatus {
        id: String,
        current: ContainerStatus,
        requested: Operation,
    },
    #[error("container {0} does not exist")]
    NotFound(String),
    #[error("container {0} already exists")]
    Exist(String),
    #[error("init process of container {0} exited before it was started")]
    InitExited(String),
    #[error(transparent)]
    InvalidId(#[from] ErrInvalidId),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Tty(#[from] TtyError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Cgroup(#[from] AnyManagerError),
    #[error(transparent)]
    CreateCgroupManager(#[from] CreateCgroupSetupError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to {op} {path:?}")]
    OtherIO {
        op: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    OtherSyscall(#[from] nix::Error),
}

impl LibcorralError {
    /// The container id is unknown, there is nothing to retry.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// The container exists but is not in a state that allows the operation. The caller may
    /// change the state first (signal, resume) and try again.
    pub fn is_incorrect_status(&self) -> bool {
        matches!(self, Self::IncorrectStatus { .. })
    }
}
