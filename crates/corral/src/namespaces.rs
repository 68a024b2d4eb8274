//! Namespaces provide isolation of resources for processes at a kernel level.
//! A container either creates a namespace of a kind or joins an existing one by path.
use std::fmt::Display;
use std::path::PathBuf;

use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NamespaceType {
    #[serde(rename = "NEWNET")]
    Net,
    #[serde(rename = "NEWPID")]
    Pid,
    #[serde(rename = "NEWNS")]
    Mount,
    #[serde(rename = "NEWUTS")]
    Uts,
    #[serde(rename = "NEWIPC")]
    Ipc,
    #[serde(rename = "NEWUSER")]
    User,
    #[serde(rename = "NEWCGROUP")]
    Cgroup,
}

impl NamespaceType {
    /// Maps the namespace kind used in bundle configs ("network", "mount", ...).
    pub fn from_spec_kind(kind: &str) -> Option<Self> {
        match kind {
            "pid" => Some(Self::Pid),
            "network" => Some(Self::Net),
            "mount" => Some(Self::Mount),
            "user" => Some(Self::User),
            "ipc" => Some(Self::Ipc),
            "uts" => Some(Self::Uts),
            "cgroup" => Some(Self::Cgroup),
            _ => None,
        }
    }

    pub fn clone_flag(&self) -> CloneFlags {
        match self {
            Self::Net => CloneFlags::CLONE_NEWNET,
            Self::Pid => CloneFlags::CLONE_NEWPID,
            Self::Mount => CloneFlags::CLONE_NEWNS,
            Self::Uts => CloneFlags::CLONE_NEWUTS,
            Self::Ipc => CloneFlags::CLONE_NEWIPC,
            Self::User => CloneFlags::CLONE_NEWUSER,
            Self::Cgroup => CloneFlags::CLONE_NEWCGROUP,
        }
    }

    /// Name of the namespace file under `/proc/<pid>/ns/`.
    pub fn ns_name(&self) -> &'static str {
        match self {
            Self::Net => "net",
            Self::Pid => "pid",
            Self::Mount => "mnt",
            Self::Uts => "uts",
            Self::Ipc => "ipc",
            Self::User => "user",
            Self::Cgroup => "cgroup",
        }
    }
}

impl Display for NamespaceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let print = match self {
            Self::Net => "NEWNET",
            Self::Pid => "NEWPID",
            Self::Mount => "NEWNS",
            Self::Uts => "NEWUTS",
            Self::Ipc => "NEWIPC",
            Self::User => "NEWUSER",
            Self::Cgroup => "NEWCGROUP",
        };

        write!(f, "{print}")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    #[serde(rename = "type")]
    pub typ: NamespaceType,
    /// Empty to create a new namespace, otherwise the namespace file to join.
    pub path: String,
}

impl Namespace {
    /// Where the namespace of a running process can be joined from.
    pub fn path_for(&self, pid: i32) -> PathBuf {
        PathBuf::from(format!("/proc/{}/ns/{}", pid, self.typ.ns_name()))
    }
}

/// At most one entry per namespace type, in insertion order.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Namespaces(Vec<Namespace>);

impl Namespaces {
    fn index(&self, typ: NamespaceType) -> Option<usize> {
        self.0.iter().position(|ns| ns.typ == typ)
    }

    pub fn contains(&self, typ: NamespaceType) -> bool {
        self.index(typ).is_some()
    }

    /// Adds the namespace, or updates the path if the type is already present.
    pub fn add(&mut self, typ: NamespaceType, path: impl Into<String>) {
        let path = path.into();
        match self.index(typ) {
            Some(i) => self.0[i].path = path,
            None => self.0.push(Namespace { typ, path }),
        }
    }

    /// Returns false if the type was not present.
    pub fn remove(&mut self, typ: NamespaceType) -> bool {
        match self.index(typ) {
            Some(i) => {
                self.0.remove(i);
                true
            }
            None => false,
        }
    }

    /// Path to join, empty when the namespace is absent or created fresh.
    pub fn path_of(&self, typ: NamespaceType) -> &str {
        self.index(typ).map(|i| self.0[i].path.as_str()).unwrap_or("")
    }

    /// Flags for the namespaces that have to be created rather than joined.
    pub fn clone_flags(&self) -> CloneFlags {
        self.0
            .iter()
            .filter(|ns| ns.path.is_empty())
            .fold(CloneFlags::empty(), |flags, ns| flags | ns.typ.clone_flag())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Namespace> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
