use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = SandboxError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SandboxError {
    /// Unknown flag, missing program, malformed value, or a help request.
    #[error(transparent)]
    Usage(#[from] clap::Error),

    #[error("Bad binding: '{0}'")]
    BadBinding(String),

    #[error("Bad mount: '{0}'")]
    BadMount(String),

    #[error("Bad rlimit: '{0}'")]
    BadRlimit(String),

    #[error("Invalid cap set: '{0}'")]
    BadCapabilityMask(String),

    #[error("Invalid securebit mask: '{0}'")]
    BadSecurebitsMask(String),

    #[error("ELF type must be 'static' or 'dynamic', got '{0}'")]
    BadElfType(String),

    #[error("Logging target must be 'syslog' or 'stderr', got '{0}'")]
    BadLogTarget(String),

    #[error("Invalid /tmp tmpfs size: '{0}'")]
    BadTmpfsSize(String),

    #[error("Could not build id map: '{0}'")]
    IdMap(String),

    #[error("{second} cannot be used together with {first}")]
    Conflict {
        first: &'static str,
        second: &'static str,
    },

    #[error("Bind mounts (-b) require a chroot (-C), pivot_root (-P), or new mount namespace (-v)")]
    BindWithoutMountNamespace,

    #[error("Can't skip marking mounts as MS_PRIVATE (-K) without mount namespaces (-v)")]
    SkipRemountWithoutMountNamespace,

    #[error(
        "Can't set ambient capabilities (--ambient) without actually using capabilities (-c)"
    )]
    AmbientWithoutCapabilities,

    #[error(
        "Can't run statically-linked binaries with capabilities (-c) without also setting \
         ambient capabilities. Try passing --ambient"
    )]
    StaticWithoutAmbient,

    #[error("Bad user: '{0}'")]
    BadUser(String),

    #[error("Bad group: '{0}'")]
    BadGroup(String),

    #[error("Target program '{}' is not accessible", .0.display())]
    ProgramNotAccessible(PathBuf),

    #[error("Target program '{}' is not a valid ELF file", .0.display())]
    InvalidElf(PathBuf),

    #[error("{action}: {cause:#}")]
    Engine {
        action: &'static str,
        cause: anyhow::Error,
    },

    #[error("Could not query system identity: {0:#}")]
    Identity(anyhow::Error),

    #[error("dlopen(): {0}")]
    PreloadUnavailable(String),

    #[error("setpgid(0, 0) failed: {0}")]
    ProcessGroup(nix::Error),
}

impl SandboxError {
    /// Wraps a collaborator failure with the step that was being performed.
    pub fn engine(action: &'static str) -> impl FnOnce(anyhow::Error) -> Self {
        move |cause| Self::Engine { action, cause }
    }

    /// Exit status `main` reports for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(error) if !error.use_stderr() => 0,
            _ => 1,
        }
    }
}
