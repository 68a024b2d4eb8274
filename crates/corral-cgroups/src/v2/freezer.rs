//! Pause and resume of a unified cgroup through `cgroup.freeze`.
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use crate::common::{self, FreezerState, WrappedIoError};

const FREEZE_FILE: &str = "cgroup.freeze";
const EVENTS_FILE: &str = "cgroup.events";

const FROZEN_POLL_INTERVAL: Duration = Duration::from_millis(10);
const FROZEN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum V2FreezerError {
    #[error(transparent)]
    WrappedIo(#[from] WrappedIoError),
    #[error("cgroup has no freezer: {0}")]
    NotSupported(#[source] WrappedIoError),
    #[error("freezer reports {actual:?} after {requested:?} was requested")]
    Mismatch {
        requested: FreezerState,
        actual: FreezerState,
    },
    #[error("unexpected content {0:?} in cgroup.freeze")]
    UnknownState(String),
    #[error("cgroup did not report frozen within {0:?}")]
    Timeout(Duration),
}

/// Requests `requested` and returns once the cgroup reports it. `Undefined` leaves the
/// freezer alone.
pub fn set_state(cgroup: &Path, requested: FreezerState) -> Result<(), V2FreezerError> {
    let value = match requested {
        FreezerState::Undefined => return Ok(()),
        FreezerState::Frozen => "1",
        FreezerState::Thawed => "0",
    };

    let freeze_file = cgroup.join(FREEZE_FILE);
    if !freeze_file.exists() {
        // nothing to thaw in a cgroup that cannot be frozen
        if requested == FreezerState::Thawed {
            return Ok(());
        }
        let err = std::io::Error::from(std::io::ErrorKind::NotFound);
        return Err(V2FreezerError::NotSupported(WrappedIoError::Open {
            err,
            path: freeze_file,
        }));
    }
    common::write_cgroup_file(&freeze_file, value)?;

    let actual = read_state(cgroup)?;
    if actual != requested {
        return Err(V2FreezerError::Mismatch { requested, actual });
    }
    tracing::debug!(?cgroup, state = ?actual, "freezer updated");
    Ok(())
}

/// State of the freezer, `Undefined` for a cgroup without `cgroup.freeze`.
pub fn state(cgroup: &Path) -> Result<FreezerState, V2FreezerError> {
    if !cgroup.join(FREEZE_FILE).exists() {
        return Ok(FreezerState::Undefined);
    }
    read_state(cgroup)
}

fn read_state(cgroup: &Path) -> Result<FreezerState, V2FreezerError> {
    let content = common::read_cgroup_file(cgroup.join(FREEZE_FILE))?;
    match content.trim() {
        "0" => Ok(FreezerState::Thawed),
        "1" => wait_frozen(cgroup),
        other => Err(V2FreezerError::UnknownState(other.to_owned())),
    }
}

/// `cgroup.freeze` holds the requested state. The kernel sets `frozen 1` in `cgroup.events`
/// once every task is stopped.
fn wait_frozen(cgroup: &Path) -> Result<FreezerState, V2FreezerError> {
    let events = cgroup.join(EVENTS_FILE);
    let deadline = Instant::now() + FROZEN_TIMEOUT;
    loop {
        match frozen_key(&common::read_cgroup_file(&events)?) {
            Some(true) => return Ok(FreezerState::Frozen),
            Some(false) => {}
            None => return Ok(FreezerState::Undefined),
        }
        if Instant::now() >= deadline {
            return Err(V2FreezerError::Timeout(FROZEN_TIMEOUT));
        }
        thread::sleep(FROZEN_POLL_INTERVAL);
    }
}

fn frozen_key(events: &str) -> Option<bool> {
    events
        .lines()
        .find_map(|line| line.strip_prefix("frozen "))
        .map(|value| value.trim() == "1")
}
