//! Mount option parsing and the mount entries of the translated configuration.
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use nix::mount::MsFlags;
use serde::{Deserialize, Serialize};

use crate::spec;

bitflags! {
    /// Mount behaviour that has no kernel flag and is implemented by the runtime.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct MountExtensions: u32 {
        /// Copy the content under the mount point into a freshly mounted tmpfs.
        const COPYUP = 0b0001;
    }
}

/// Result of [`parse_mount_options`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMountOptions {
    pub flags: MsFlags,
    /// Propagation changes, applied one by one after the mount in this order.
    pub propagation_flags: Vec<MsFlags>,
    /// Filesystem specific options, comma separated.
    pub data: String,
    pub extensions: MountExtensions,
}

impl Default for ParsedMountOptions {
    fn default() -> Self {
        Self {
            flags: MsFlags::empty(),
            propagation_flags: Vec::new(),
            data: String::new(),
            extensions: MountExtensions::empty(),
        }
    }
}

/// A mount of the translated configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConfigMount {
    /// Filesystem type, or "bind" for bind mounts.
    pub device: String,
    pub source: String,
    pub destination: PathBuf,
    #[serde(with = "ms_flags")]
    pub flags: MsFlags,
    #[serde(with = "ms_flags_list")]
    pub propagation_flags: Vec<MsFlags>,
    pub data: String,
    pub relabel: String,
    pub extensions: MountExtensions,
}

impl Default for ConfigMount {
    fn default() -> Self {
        Self {
            device: String::new(),
            source: String::new(),
            destination: PathBuf::new(),
            flags: MsFlags::empty(),
            propagation_flags: Vec::new(),
            data: String::new(),
            relabel: String::new(),
            extensions: MountExtensions::empty(),
        }
    }
}

fn mount_flag(option: &str) -> Option<(bool, MsFlags)> {
    // (clear, flag)
    match option {
        "acl" => Some((false, MsFlags::MS_POSIXACL)),
        "async" => Some((true, MsFlags::MS_SYNCHRONOUS)),
        "atime" => Some((true, MsFlags::MS_NOATIME)),
        "bind" => Some((false, MsFlags::MS_BIND)),
        "defaults" => Some((false, MsFlags::empty())),
        "dev" => Some((true, MsFlags::MS_NODEV)),
        "diratime" => Some((true, MsFlags::MS_NODIRATIME)),
        "dirsync" => Some((false, MsFlags::MS_DIRSYNC)),
        "exec" => Some((true, MsFlags::MS_NOEXEC)),
        "iversion" => Some((false, MsFlags::MS_I_VERSION)),
        "lazytime" => Some((false, MsFlags::MS_LAZYTIME)),
        "loud" => Some((true, MsFlags::MS_SILENT)),
        "mand" => Some((false, MsFlags::MS_MANDLOCK)),
        "noacl" => Some((true, MsFlags::MS_POSIXACL)),
        "noatime" => Some((false, MsFlags::MS_NOATIME)),
        "nodev" => Some((false, MsFlags::MS_NODEV)),
        "nodiratime" => Some((false, MsFlags::MS_NODIRATIME)),
        "noexec" => Some((false, MsFlags::MS_NOEXEC)),
        "noiversion" => Some((true, MsFlags::MS_I_VERSION)),
        "nolazytime" => Some((true, MsFlags::MS_LAZYTIME)),
        "nomand" => Some((true, MsFlags::MS_MANDLOCK)),
        "norelatime" => Some((true, MsFlags::MS_RELATIME)),
        "nostrictatime" => Some((true, MsFlags::MS_STRICTATIME)),
        "nosuid" => Some((false, MsFlags::MS_NOSUID)),
        "rbind" => Some((false, MsFlags::MS_BIND | MsFlags::MS_REC)),
        "relatime" => Some((false, MsFlags::MS_RELATIME)),
        "remount" => Some((false, MsFlags::MS_REMOUNT)),
        "ro" => Some((false, MsFlags::MS_RDONLY)),
        "rw" => Some((true, MsFlags::MS_RDONLY)),
        "silent" => Some((false, MsFlags::MS_SILENT)),
        "strictatime" => Some((false, MsFlags::MS_STRICTATIME)),
        "suid" => Some((true, MsFlags::MS_NOSUID)),
        "sync" => Some((false, MsFlags::MS_SYNCHRONOUS)),
        _ => None,
    }
}

/// Maps a propagation keyword to its flags. Used for mount options and for the rootfs
/// propagation setting.
pub fn propagation_flag(option: &str) -> Option<MsFlags> {
    match option {
        "private" => Some(MsFlags::MS_PRIVATE),
        "rprivate" => Some(MsFlags::MS_PRIVATE | MsFlags::MS_REC),
        "shared" => Some(MsFlags::MS_SHARED),
        "rshared" => Some(MsFlags::MS_SHARED | MsFlags::MS_REC),
        "slave" => Some(MsFlags::MS_SLAVE),
        "rslave" => Some(MsFlags::MS_SLAVE | MsFlags::MS_REC),
        "unbindable" => Some(MsFlags::MS_UNBINDABLE),
        "runbindable" => Some(MsFlags::MS_UNBINDABLE | MsFlags::MS_REC),
        _ => None,
    }
}

fn extension_flag(option: &str) -> Option<(bool, MountExtensions)> {
    match option {
        "tmpcopyup" => Some((false, MountExtensions::COPYUP)),
        _ => None,
    }
}

/// Splits mount options into kernel flags, propagation changes, filesystem data and runtime
/// extensions.
///
/// Options are applied in order, so a later `rw` clears an earlier `ro`. Anything that is not
/// a known keyword, including `defaults`, is passed through as filesystem data.
pub fn parse_mount_options<S: AsRef<str>>(options: &[S]) -> ParsedMountOptions {
    let mut parsed = ParsedMountOptions::default();
    let mut data = Vec::new();

    for option in options.iter().map(AsRef::as_ref) {
        match mount_flag(option) {
            Some((clear, flag)) if !flag.is_empty() => {
                if clear {
                    parsed.flags &= !flag;
                } else {
                    parsed.flags |= flag;
                }
                continue;
            }
            _ => {}
        }

        if let Some(flag) = propagation_flag(option) {
            parsed.propagation_flags.push(flag);
            continue;
        }

        if let Some((clear, ext)) = extension_flag(option) {
            if clear {
                parsed.extensions &= !ext;
            } else {
                parsed.extensions |= ext;
            }
            continue;
        }

        data.push(option);
    }

    parsed.data = data.join(",");
    parsed
}

/// Translates a mount of the input spec. `bundle` is the directory relative bind sources are
/// resolved against.
pub fn create_config_mount(bundle: &Path, m: &spec::Mount) -> ConfigMount {
    let parsed = parse_mount_options(&m.options);
    let mut source = m.source.clone();
    let mut device = m.typ.clone();

    if parsed.flags.contains(MsFlags::MS_BIND) {
        device = "bind".to_owned();
        if !Path::new(&source).is_absolute() {
            source = bundle.join(&source).to_string_lossy().into_owned();
        }
    }

    ConfigMount {
        device,
        source,
        destination: m.destination.clone(),
        flags: parsed.flags,
        propagation_flags: parsed.propagation_flags,
        data: parsed.data,
        relabel: String::new(),
        extensions: parsed.extensions,
    }
}

pub(crate) mod ms_flags {
    use nix::mount::MsFlags;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(flags: &MsFlags, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(flags.bits() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<MsFlags, D::Error> {
        let bits = u64::deserialize(deserializer)?;
        Ok(MsFlags::from_bits_retain(bits as libc::c_ulong))
    }
}

pub(crate) mod ms_flags_list {
    use nix::mount::MsFlags;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(flags: &[MsFlags], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(flags.len()))?;
        for flag in flags {
            seq.serialize_element(&(flag.bits() as u64))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<MsFlags>, D::Error> {
        let bits = Vec::<u64>::deserialize(deserializer)?;
        Ok(bits
            .into_iter()
            .map(|b| MsFlags::from_bits_retain(b as libc::c_ulong))
            .collect())
    }
}
