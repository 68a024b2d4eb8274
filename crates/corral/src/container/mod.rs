//! Container management
/// A [`Factory`] creates containers from a translated [`Config`](crate::config::Config) and
/// loads them back by id. A [`Container`] moves through the statuses of [`ContainerStatus`]
/// by starting its init process, being paused and resumed, and finally being destroyed.
#[allow(clippy::module_inception)]
mod container;
mod container_destroy;
mod container_pause;
mod container_resume;
mod container_set;
mod container_signal;
mod container_start;
mod factory;
pub mod state;

pub use container::Container;
pub use container_start::EXEC_FIFO;
pub use factory::{validate_id, Factory};
pub use state::{ContainerStatus, State, StateError};
