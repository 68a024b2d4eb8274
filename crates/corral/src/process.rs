//! The process to run in a container and the seam to whatever forks and executes it.
use std::os::fd::OwnedFd;
use std::path::Path;

use nix::unistd::Pid;

use crate::config::Config;
use crate::spec;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("process has no command to run")]
    NoCommand,
    #[error("failed to spawn {command:?}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
}

/// A process started in the container, either the init process or one joining it later.
///
/// A new one is handed to every start, so the descriptors it holds are closed once the
/// launcher is done with them.
#[derive(Debug, Default)]
pub struct Process {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub uid: u32,
    pub gid: u32,
    pub additional_gids: Vec<u32>,
    /// The first process of the container. It waits on the exec fifo before running `args`.
    pub init: bool,
    pub no_new_privileges: bool,
    pub oom_score_adj: Option<i32>,
    /// Path of a namespace to join instead of the ones of the container.
    pub namespace: Option<String>,
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

impl Process {
    /// Process described by a `Spec`. `args` wins over `command_line`, which is split on
    /// whitespace.
    pub fn from_spec(p: &spec::Process, init: bool) -> Self {
        let args = if p.args.is_empty() {
            p.command_line
                .split_whitespace()
                .map(str::to_owned)
                .collect()
        } else {
            p.args.clone()
        };

        Self {
            args,
            env: p.env.clone(),
            cwd: p.cwd.clone(),
            uid: p.user.uid,
            gid: p.user.gid,
            additional_gids: p.user.additional_gids.clone(),
            init,
            no_new_privileges: p.no_new_privileges,
            oom_score_adj: p.oom_score_adj,
            namespace: p.namespace.clone().filter(|ns| !ns.is_empty()),
            ..Default::default()
        }
    }

    /// The command line as a single string, for logs.
    pub fn command(&self) -> String {
        self.args.join(" ")
    }
}

/// What a launcher gets to start a process.
#[derive(Debug)]
pub struct LaunchContext<'a> {
    pub id: &'a str,
    pub config: &'a Config,
    pub process: &'a Process,
    /// For an init process: opened for writing by the child before it executes, which blocks
    /// until the container is started.
    pub exec_fifo: &'a Path,
}

/// Forks the process into the namespaces of the container and executes it. Returns the pid
/// of the process as seen from the caller.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, ctx: &LaunchContext<'_>) -> Result<Pid, LaunchError>;
}
