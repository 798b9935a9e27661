use crate::spec::{
    BindMount, DEFAULT_PRELOAD_PATH, ElfType, LogTarget, MountSpec, Rlimit, parse_capability_mask,
    parse_securebits_mask, parse_size,
};
use clap::{Args, Parser};
use std::path::PathBuf;

const HEADING_NAMESPACES: &str = "Namespaces";
const HEADING_FILESYSTEM: &str = "Filesystem";
const HEADING_USER: &str = "User";
const HEADING_SECURITY: &str = "Security";
const HEADING_PROCESS: &str = "Process";
const HEADING_LOGGING: &str = "Logging";

/// Raw command line. Every field is a plain record of what was typed;
/// names are resolved and combinations checked by [`crate::parser`].
#[derive(Parser, Debug)]
#[command(
    name = "warden",
    about = "Run a program inside a Linux sandbox",
    args_override_self = true
)]
pub struct Config {
    #[command(flatten)]
    pub namespace: NamespaceOptions,

    #[command(flatten)]
    pub filesystem: FilesystemOptions,

    #[command(flatten)]
    pub user: UserOptions,

    #[command(flatten)]
    pub security: SecurityOptions,

    #[command(flatten)]
    pub process: ProcessOptions,

    #[command(flatten)]
    pub logging: LoggingOptions,

    /// Program to run, followed by its arguments
    #[arg(value_name = "PROGRAM", trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct NamespaceOptions {
    #[arg(
        short = 'v',
        long = "mount-ns",
        help = "Enter new mount namespace",
        help_heading = HEADING_NAMESPACES
    )]
    pub mount_ns: bool,

    #[arg(
        short = 'V',
        long = "enter-mount-ns",
        value_name = "FILE",
        help = "Enter the mount namespace at <FILE>",
        help_heading = HEADING_NAMESPACES
    )]
    pub enter_mount_ns: Option<PathBuf>,

    #[arg(
        short = 'p',
        long = "pid-ns",
        help = "Enter new pid namespace (implies a mount namespace and read-only /proc)",
        help_heading = HEADING_NAMESPACES
    )]
    pub pid_ns: bool,

    #[arg(
        short = 'e',
        long = "net-ns",
        value_name = "FILE",
        require_equals = true,
        help = "Enter new network namespace, or the existing one at <FILE>",
        help_heading = HEADING_NAMESPACES
    )]
    pub net_ns: Option<Option<PathBuf>>,

    #[arg(
        short = 'l',
        long = "ipc-ns",
        help = "Enter new IPC namespace",
        help_heading = HEADING_NAMESPACES
    )]
    pub ipc_ns: bool,

    #[arg(
        short = 'U',
        long = "user-ns",
        help = "Enter new user namespace (implies -p)",
        help_heading = HEADING_NAMESPACES
    )]
    pub user_ns: bool,

    #[arg(
        short = 'N',
        long = "cgroup-ns",
        help = "Enter new cgroup namespace",
        help_heading = HEADING_NAMESPACES
    )]
    pub cgroup_ns: bool,

    #[arg(
        long = "uts",
        value_name = "HOSTNAME",
        require_equals = true,
        help = "Enter new UTS namespace, optionally setting the hostname",
        help_heading = HEADING_NAMESPACES
    )]
    pub uts: Option<Option<String>>,
}

#[derive(Args, Debug)]
pub struct FilesystemOptions {
    #[arg(
        short = 'C',
        long = "chroot",
        value_name = "DIR",
        help = "chroot(2) to <DIR> (not compatible with -P)",
        help_heading = HEADING_FILESYSTEM
    )]
    pub chroot: Option<PathBuf>,

    #[arg(
        short = 'P',
        long = "pivot-root",
        value_name = "DIR",
        help = "pivot_root(2) to <DIR> (not compatible with -C)",
        help_heading = HEADING_FILESYSTEM
    )]
    pub pivot_root: Option<PathBuf>,

    #[arg(
        short = 'b',
        long = "bind",
        value_name = "SRC,DEST[,WRITABLE]",
        help = "Bind <SRC> to <DEST>; may be repeated",
        help_heading = HEADING_FILESYSTEM
    )]
    pub binds: Vec<BindMount>,

    #[arg(
        short = 'k',
        long = "mount",
        value_name = "SRC,DEST,TYPE[,FLAGS][,DATA]",
        help = "Mount <SRC> at <DEST>; <FLAGS> is a hexadecimal mount(2) mask; may be repeated",
        help_heading = HEADING_FILESYSTEM
    )]
    pub mounts: Vec<MountSpec>,

    #[arg(
        short = 't',
        long = "tmpfs",
        value_name = "SIZE",
        require_equals = true,
        value_parser = parse_size,
        help = "Mount tmpfs at /tmp (default size 64M)",
        help_heading = HEADING_FILESYSTEM
    )]
    pub tmpfs: Option<Option<u64>>,

    #[arg(
        short = 'd',
        long = "mount-dev",
        help = "Create a new /dev with a minimal set of device nodes",
        help_heading = HEADING_FILESYSTEM
    )]
    pub mount_dev: bool,

    #[arg(
        short = 'r',
        long = "remount-proc-ro",
        help = "Remount /proc read-only",
        help_heading = HEADING_FILESYSTEM
    )]
    pub remount_proc_readonly: bool,

    #[arg(
        short = 'K',
        long = "skip-remount-private",
        help = "Don't mark all existing mounts as MS_PRIVATE",
        help_heading = HEADING_FILESYSTEM
    )]
    pub skip_remount_private: bool,
}

#[derive(Args, Debug)]
pub struct UserOptions {
    #[arg(
        short = 'u',
        long = "user",
        value_name = "USER",
        help = "Change uid to <USER> (name or number)",
        help_heading = HEADING_USER
    )]
    pub user: Option<String>,

    #[arg(
        short = 'g',
        long = "group",
        value_name = "GROUP",
        help = "Change gid to <GROUP> (name or number)",
        help_heading = HEADING_USER
    )]
    pub group: Option<String>,

    #[arg(
        short = 'G',
        long = "inherit-groups",
        help = "Inherit supplementary groups from <USER> (not compatible with -y)",
        help_heading = HEADING_USER
    )]
    pub inherit_groups: bool,

    #[arg(
        short = 'y',
        long = "keep-groups",
        help = "Keep the caller's supplementary groups (not compatible with -G)",
        help_heading = HEADING_USER
    )]
    pub keep_groups: bool,

    #[arg(
        short = 'm',
        long = "uid-map",
        value_name = "MAP",
        require_equals = true,
        help = "Set the uid map of the user namespace (implies -pU); defaults to mapping the caller's uid",
        help_heading = HEADING_USER
    )]
    pub uid_map: Option<Option<String>>,

    #[arg(
        short = 'M',
        long = "gid-map",
        value_name = "MAP",
        require_equals = true,
        help = "Set the gid map of the user namespace (implies -pU); defaults to mapping the caller's gid",
        help_heading = HEADING_USER
    )]
    pub gid_map: Option<Option<String>>,
}

#[derive(Args, Debug)]
pub struct SecurityOptions {
    #[arg(
        short = 'c',
        long = "caps",
        value_name = "MASK",
        value_parser = parse_capability_mask,
        help = "Restrict capabilities to the hexadecimal <MASK>",
        help_heading = HEADING_SECURITY
    )]
    pub caps: Option<u64>,

    #[arg(
        long = "ambient",
        help = "Raise ambient capabilities (requires -c)",
        help_heading = HEADING_SECURITY
    )]
    pub ambient: bool,

    #[arg(
        short = 'B',
        long = "skip-securebits",
        value_name = "MASK",
        value_parser = parse_securebits_mask,
        help = "Skip setting the securebits in the hexadecimal <MASK> when restricting capabilities",
        help_heading = HEADING_SECURITY
    )]
    pub skip_securebits: Option<u64>,

    #[arg(
        short = 'n',
        long = "no-new-privs",
        help = "Set no_new_privs",
        help_heading = HEADING_SECURITY
    )]
    pub no_new_privs: bool,

    #[arg(
        short = 's',
        long = "seccomp-strict",
        help = "Use seccomp strict mode (not compatible with -S)",
        help_heading = HEADING_SECURITY
    )]
    pub seccomp_strict: bool,

    #[arg(
        short = 'S',
        long = "seccomp-filter",
        value_name = "FILE",
        help = "Install the seccomp policy in <FILE> (not compatible with -s)",
        help_heading = HEADING_SECURITY
    )]
    pub seccomp_filter: Option<PathBuf>,

    #[arg(
        short = 'L',
        long = "log-seccomp",
        help = "Log blocked syscalls instead of killing the process",
        help_heading = HEADING_SECURITY
    )]
    pub log_seccomp: bool,

    #[arg(
        short = 'Y',
        long = "seccomp-tsync",
        help = "Synchronize seccomp filters across the thread group",
        help_heading = HEADING_SECURITY
    )]
    pub seccomp_tsync: bool,

    #[arg(
        short = 'T',
        long = "elf-type",
        value_name = "TYPE",
        help = "Assume <PROGRAM> is a 'static' or 'dynamic' ELF binary instead of inspecting it",
        help_heading = HEADING_SECURITY
    )]
    pub elf_type: Option<ElfType>,

    #[arg(
        long = "preload",
        value_name = "PATH",
        env = "WARDEN_PRELOAD",
        default_value = DEFAULT_PRELOAD_PATH,
        help = "Library injected into dynamically linked programs",
        help_heading = HEADING_SECURITY
    )]
    pub preload: PathBuf,
}

#[derive(Args, Debug)]
pub struct ProcessOptions {
    #[arg(
        short = 'i',
        long = "exit-immediately",
        help = "Exit immediately after launching (do not act as init)",
        help_heading = HEADING_PROCESS
    )]
    pub exit_immediately: bool,

    #[arg(
        short = 'I',
        long = "init",
        help = "Run <PROGRAM> as init (pid 1) inside a new pid namespace (implies -p)",
        help_heading = HEADING_PROCESS
    )]
    pub run_as_init: bool,

    #[arg(
        short = 'z',
        long = "no-forward-signals",
        help = "Don't forward signals to the sandboxed process",
        help_heading = HEADING_PROCESS
    )]
    pub no_forward_signals: bool,

    #[arg(
        short = 'w',
        long = "session-keyring",
        help = "Create and join a new anonymous session keyring",
        help_heading = HEADING_PROCESS
    )]
    pub session_keyring: bool,

    #[arg(
        short = 'f',
        long = "pid-file",
        value_name = "FILE",
        help = "Write the pid of the sandboxed process to <FILE>",
        help_heading = HEADING_PROCESS
    )]
    pub pid_file: Option<PathBuf>,

    #[arg(
        short = 'R',
        long = "rlimit",
        value_name = "TYPE,CUR,MAX",
        help = "Set a resource limit; may be repeated",
        help_heading = HEADING_PROCESS
    )]
    pub rlimits: Vec<Rlimit>,
}

#[derive(Args, Debug)]
pub struct LoggingOptions {
    #[arg(
        long = "logging",
        value_name = "TARGET",
        default_value_t = LogTarget::Syslog,
        help = "Log to 'syslog' or 'stderr'",
        help_heading = HEADING_LOGGING
    )]
    pub target: LogTarget,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_is_well_formed() {
        Config::command().debug_assert();
    }

    #[test]
    fn optional_values_need_equals() -> anyhow::Result<()> {
        let config = Config::try_parse_from(["warden", "-m", "/bin/true"])?;
        assert_eq!(config.user.uid_map, Some(None));
        assert_eq!(config.command, ["/bin/true"]);

        let config = Config::try_parse_from(["warden", "-m=0 1000 1", "/bin/true"])?;
        assert_eq!(config.user.uid_map, Some(Some("0 1000 1".to_string())));
        Ok(())
    }

    #[test]
    fn arguments_after_the_program_belong_to_it() -> anyhow::Result<()> {
        let config = Config::try_parse_from(["warden", "-v", "/bin/ls", "-v", "--uts"])?;
        assert!(config.namespace.mount_ns);
        assert_eq!(config.namespace.uts, None);
        assert_eq!(config.command, ["/bin/ls", "-v", "--uts"]);
        Ok(())
    }

    #[test]
    fn program_is_required() {
        assert!(Config::try_parse_from(["warden", "-v"]).is_err());
    }

    #[test]
    fn grouped_short_flags() -> anyhow::Result<()> {
        let config = Config::try_parse_from(["warden", "-vlN", "/bin/true"])?;
        assert!(config.namespace.mount_ns && config.namespace.ipc_ns && config.namespace.cgroup_ns);
        Ok(())
    }
}
