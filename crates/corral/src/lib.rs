//! Compiles a declarative container specification into a fully resolved container
//! configuration and manages the lifecycle of containers created from it.
pub mod cgroups;
pub mod config;
pub mod container;
pub mod devices;
pub mod error;
pub mod fd;
pub mod mount;
pub mod namespaces;
pub mod process;
pub mod registry;
pub mod seccomp;
pub mod spec;
pub mod translate;
pub mod tty;
pub mod user_ns;

#[cfg(test)]
mod test_utils;
