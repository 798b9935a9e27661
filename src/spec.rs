use crate::error::SandboxError;
use nix::unistd::{Gid, Uid};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

pub const DEFAULT_TMPFS_SIZE: u64 = 64 * 1024 * 1024;
pub const DEFAULT_PRELOAD_PATH: &str = "/usr/lib/warden/libwardenpreload.so";

/// Everything one invocation asks the sandbox to do.
///
/// Built once from the command line, validated once, then handed read-only
/// to the engine and the launch dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    pub namespaces: Namespaces,
    pub root: Option<RootChange>,
    pub capabilities: CapabilityPolicy,
    pub binds: Vec<BindMount>,
    pub mounts: Vec<MountSpec>,
    pub filesystem: FilesystemExtras,
    pub rlimits: Vec<Rlimit>,
    pub identity: Identity,
    pub uid_map: Option<IdMapRequest>,
    pub gid_map: Option<IdMapRequest>,
    pub id_maps: IdMaps,
    pub seccomp: SeccompPolicy,
    pub lifecycle: Lifecycle,
    pub pid_file: Option<PathBuf>,
    pub elf_type: ElfType,
    pub log_target: LogTarget,
    pub preload: PathBuf,
}

impl Default for SandboxSpec {
    fn default() -> Self {
        Self {
            namespaces: Namespaces::default(),
            root: None,
            capabilities: CapabilityPolicy::default(),
            binds: Vec::new(),
            mounts: Vec::new(),
            filesystem: FilesystemExtras::default(),
            rlimits: Vec::new(),
            identity: Identity::default(),
            uid_map: None,
            gid_map: None,
            id_maps: IdMaps::default(),
            seccomp: SeccompPolicy::default(),
            lifecycle: Lifecycle::default(),
            pid_file: None,
            elf_type: ElfType::Unknown,
            log_target: LogTarget::Syslog,
            preload: PathBuf::from(DEFAULT_PRELOAD_PATH),
        }
    }
}

impl SandboxSpec {
    /// Maps a path as seen inside the sandbox back to where it lives on the
    /// host: through the bind mounts first, then through the new root.
    pub fn host_path(&self, path: &Path) -> PathBuf {
        for bind in &self.binds {
            if let Ok(rest) = path.strip_prefix(&bind.destination) {
                return join_inside(&bind.source, rest);
            }
        }

        match &self.root {
            Some(root) => join_inside(root.path(), path),
            None => path.to_path_buf(),
        }
    }

    /// Whether the child will live in a new mount namespace, counting every
    /// option that implies one.
    pub fn needs_mount_namespace(&self) -> bool {
        self.namespaces.mount
            || self.namespaces.pid
            || matches!(self.root, Some(RootChange::PivotRoot(_)))
            || self.filesystem.tmpfs_size.is_some()
            || self.filesystem.mount_dev
            || self.filesystem.remount_proc_readonly
    }
}

/// Joins `path` under `root`, treating an absolute `path` as relative.
pub fn join_inside(root: &Path, path: &Path) -> PathBuf {
    let relative = path.strip_prefix("/").unwrap_or(path);
    if relative.as_os_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Namespaces {
    /// Explicitly requested with `-v`; implied mount namespaces do not count.
    pub mount: bool,
    pub enter_mount: Option<PathBuf>,
    pub pid: bool,
    pub net: bool,
    pub enter_net: Option<PathBuf>,
    pub user: bool,
    pub ipc: bool,
    pub uts: bool,
    pub hostname: Option<String>,
    pub cgroup: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootChange {
    Chroot(PathBuf),
    PivotRoot(PathBuf),
}

impl RootChange {
    pub fn path(&self) -> &Path {
        match self {
            Self::Chroot(path) | Self::PivotRoot(path) => path,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityPolicy {
    pub mask: Option<u64>,
    pub ambient: bool,
    pub securebits_skip: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilesystemExtras {
    pub tmpfs_size: Option<u64>,
    pub mount_dev: bool,
    pub remount_proc_readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub writable: bool,
}

impl FromStr for BindMount {
    type Err = SandboxError;

    /// `source,destination[,writable]`, with `writable` in decimal.
    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        let bad = || SandboxError::BadBinding(arg.to_string());
        let mut fields = tokens(arg);

        let source = fields.next().ok_or_else(bad)?;
        let destination = fields.next().ok_or_else(bad)?;
        let writable = match fields.next() {
            Some(flag) => flag.parse::<i64>().map_err(|_| bad())? != 0,
            None => false,
        };

        Ok(Self {
            source: source.into(),
            destination: destination.into(),
            writable,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: String,
    pub destination: PathBuf,
    pub fstype: String,
    /// Raw `mount(2)` flag bits.
    pub flags: u64,
    pub data: Option<String>,
}

impl FromStr for MountSpec {
    type Err = SandboxError;

    /// `source,destination,fstype[,flags][,data]`, with `flags` in hexadecimal.
    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        let bad = || SandboxError::BadMount(arg.to_string());
        let mut fields = tokens(arg);

        let source = fields.next().ok_or_else(bad)?;
        let destination = fields.next().ok_or_else(bad)?;
        let fstype = fields.next().ok_or_else(bad)?;
        let flags = match fields.next() {
            Some(flags) => parse_hex(flags).ok_or_else(bad)?,
            None => 0,
        };
        let data = fields.next().map(str::to_string);

        Ok(Self {
            source: source.to_string(),
            destination: destination.into(),
            fstype: fstype.to_string(),
            flags,
            data,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rlimit {
    pub resource: i32,
    pub soft: u64,
    pub hard: u64,
}

impl FromStr for Rlimit {
    type Err = SandboxError;

    /// `type,current,maximum`, all decimal.
    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        let bad = || SandboxError::BadRlimit(arg.to_string());
        let mut fields = tokens(arg);

        let resource = fields.next().ok_or_else(bad)?;
        let soft = fields.next().ok_or_else(bad)?;
        let hard = fields.next().ok_or_else(bad)?;

        let limit = |value: &str| match value {
            "unlimited" => Some(libc::RLIM_INFINITY as u64),
            value => value.parse::<u64>().ok(),
        };

        Ok(Self {
            resource: resource.parse().map_err(|_| bad())?,
            soft: limit(soft).ok_or_else(bad)?,
            hard: limit(hard).ok_or_else(bad)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SupplementaryGroups {
    /// Dropped when the uid or gid changes.
    #[default]
    Default,
    /// Taken from the target user's group memberships (`-G`).
    Inherit,
    /// Left exactly as the caller had them (`-y`).
    Keep,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub uid: Option<Uid>,
    pub gid: Option<Gid>,
    /// Set when `-u` named a user; carries that user's primary gid.
    pub user: Option<(String, Gid)>,
    pub group: Option<String>,
    pub supplementary: SupplementaryGroups,
    /// A named `-u` followed `-g`, so its primary group is the one mapped.
    pub user_group_last: bool,
}

impl Identity {
    /// Id that a synthesized uid map places inside the namespace.
    pub fn mapped_uid(&self) -> Uid {
        self.uid.unwrap_or_else(|| Uid::from_raw(0))
    }

    /// Id that a synthesized gid map places inside the namespace.
    pub fn mapped_gid(&self) -> Gid {
        let user_gid = self.user.as_ref().map(|(_, gid)| *gid);
        let mapped = if self.user_group_last {
            user_gid.or(self.gid)
        } else {
            self.gid.or(user_gid)
        };
        mapped.unwrap_or_else(|| Gid::from_raw(0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdMapRequest {
    Synthesize,
    Explicit(String),
}

impl From<Option<String>> for IdMapRequest {
    fn from(map: Option<String>) -> Self {
        map.map_or(Self::Synthesize, Self::Explicit)
    }
}

/// Maps as they will be written for the child, after validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdMaps {
    pub uid_map: Option<String>,
    pub gid_map: Option<String>,
    pub disable_setgroups: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SeccompMode {
    #[default]
    None,
    Strict,
    Filter(PathBuf),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeccompPolicy {
    pub mode: SeccompMode,
    pub log_failures: bool,
    pub tsync: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifecycle {
    pub exit_immediately: bool,
    pub run_as_init: bool,
    pub forward_signals: bool,
    pub skip_remount_private: bool,
    pub new_session_keyring: bool,
    pub no_new_privs: bool,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            exit_immediately: false,
            run_as_init: false,
            forward_signals: true,
            skip_remount_private: false,
            new_session_keyring: false,
            no_new_privs: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ElfType {
    #[default]
    Unknown,
    Static,
    Dynamic,
}

impl FromStr for ElfType {
    type Err = SandboxError;

    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        match arg {
            "static" => Ok(Self::Static),
            "dynamic" => Ok(Self::Dynamic),
            other => Err(SandboxError::BadElfType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogTarget {
    #[default]
    Syslog,
    Stderr,
}

impl FromStr for LogTarget {
    type Err = SandboxError;

    fn from_str(arg: &str) -> Result<Self, Self::Err> {
        match arg {
            "syslog" => Ok(Self::Syslog),
            "stderr" => Ok(Self::Stderr),
            other => Err(SandboxError::BadLogTarget(other.to_string())),
        }
    }
}

impl fmt::Display for LogTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Syslog => f.write_str("syslog"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Parses a capability mask: hexadecimal, no trailing characters.
pub fn parse_capability_mask(arg: &str) -> Result<u64, SandboxError> {
    parse_hex(arg).ok_or_else(|| SandboxError::BadCapabilityMask(arg.to_string()))
}

/// Parses a securebits skip mask: hexadecimal, no trailing characters.
pub fn parse_securebits_mask(arg: &str) -> Result<u64, SandboxError> {
    parse_hex(arg).ok_or_else(|| SandboxError::BadSecurebitsMask(arg.to_string()))
}

/// Parses a size such as `4096`, `512K` or `64M` (binary multiples).
pub fn parse_size(arg: &str) -> Result<u64, SandboxError> {
    let bad = || SandboxError::BadTmpfsSize(arg.to_string());

    let split = arg
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(arg.len());
    let (digits, suffix) = arg.split_at(split);
    let value = digits.parse::<u64>().map_err(|_| bad())?;

    let shift = match suffix {
        "" => 0,
        "K" | "k" => 10,
        "M" | "m" => 20,
        "G" | "g" => 30,
        "T" | "t" => 40,
        "P" | "p" => 50,
        "E" | "e" => 60,
        _ => return Err(bad()),
    };

    value.checked_mul(1u64 << shift).ok_or_else(bad)
}

fn parse_hex(arg: &str) -> Option<u64> {
    let digits = arg
        .strip_prefix("0x")
        .or_else(|| arg.strip_prefix("0X"))
        .unwrap_or(arg);
    u64::from_str_radix(digits, 16).ok()
}

/// Comma separated fields; empty fields are skipped like `strtok(3)` does.
fn tokens(arg: &str) -> impl Iterator<Item = &str> {
    arg.split(',').filter(|field| !field.is_empty())
}
