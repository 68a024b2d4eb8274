//! Translation of container uids and gids to host ids under a user namespace.
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::namespaces::{NamespaceType, Namespaces};
use crate::spec::{Linux, LinuxIdMapping};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("user namespaces enabled, but no uid mappings found")]
    NoUidMappings,
    #[error("user namespaces enabled, but no user mapping found for uid {0}")]
    NoUserMapping(u32),
    #[error("user namespaces enabled, but no gid mappings found")]
    NoGidMappings,
    #[error("user namespaces enabled, but no group mapping found for gid {0}")]
    NoGroupMapping(u32),
}

/// A contiguous range of ids: `container_id..container_id + size` maps to
/// `host_id..host_id + size`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

impl From<&LinuxIdMapping> for IdMap {
    fn from(m: &LinuxIdMapping) -> Self {
        Self {
            container_id: m.container_id,
            host_id: m.host_id,
            size: m.size,
        }
    }
}

impl IdMap {
    fn lookup(&self, id: u32) -> Option<u32> {
        let start = u64::from(self.container_id);
        let id = u64::from(id);
        if id < start || id >= start + u64::from(self.size) {
            return None;
        }
        u32::try_from(u64::from(self.host_id) + (id - start)).ok()
    }
}

/// First range containing `id` wins, so overlapping ranges resolve by order.
fn host_id_from_mapping(id: u32, maps: &[IdMap]) -> Option<u32> {
    maps.iter().find_map(|m| m.lookup(id))
}

/// Host uid for a container uid. Without a user namespace the ids are the same.
pub fn host_uid(id: u32, namespaces: &Namespaces, maps: &[IdMap]) -> Result<u32, MappingError> {
    if !namespaces.contains(NamespaceType::User) {
        return Ok(id);
    }
    if maps.is_empty() {
        return Err(MappingError::NoUidMappings);
    }
    host_id_from_mapping(id, maps).ok_or(MappingError::NoUserMapping(id))
}

/// Host gid for a container gid. Without a user namespace the ids are the same.
pub fn host_gid(id: u32, namespaces: &Namespaces, maps: &[IdMap]) -> Result<u32, MappingError> {
    if !namespaces.contains(NamespaceType::User) {
        return Ok(id);
    }
    if maps.is_empty() {
        return Err(MappingError::NoGidMappings);
    }
    host_id_from_mapping(id, maps).ok_or(MappingError::NoGroupMapping(id))
}

impl Config {
    pub fn host_uid(&self, id: u32) -> Result<u32, MappingError> {
        host_uid(id, &self.namespaces, &self.uid_mappings)
    }

    pub fn host_gid(&self, id: u32) -> Result<u32, MappingError> {
        host_gid(id, &self.namespaces, &self.gid_mappings)
    }

    pub fn host_root_uid(&self) -> Result<u32, MappingError> {
        self.host_uid(0)
    }

    pub fn host_root_gid(&self) -> Result<u32, MappingError> {
        self.host_gid(0)
    }
}

/// Copies the id mappings into the config and hands every device node to the mapped root.
/// Must run after the namespaces and devices of the config are populated.
pub fn setup_user_namespace(linux: Option<&Linux>, config: &mut Config) -> Result<(), MappingError> {
    if let Some(linux) = linux {
        config
            .uid_mappings
            .extend(linux.uid_mappings.iter().map(IdMap::from));
        config
            .gid_mappings
            .extend(linux.gid_mappings.iter().map(IdMap::from));
    }

    let root_uid = config.host_root_uid()?;
    let root_gid = config.host_root_gid()?;
    for device in config.devices.iter_mut() {
        device.uid = root_uid;
        device.gid = root_gid;
    }
    tracing::debug!(root_uid, root_gid, "device nodes owned by mapped root");

    Ok(())
}
