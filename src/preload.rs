use anyhow::{Context, Result, ensure};
use bincode::{Decode, Encode};
use nix::{
    fcntl::{FcntlArg, FdFlag, fcntl},
    sys::socket::{AddressFamily, SockFlag, SockType, socketpair},
    unistd::write,
};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Environment variable naming the descriptor the payload can be read from.
pub const PRELOAD_FD_ENV: &str = "WARDEN_PRELOAD_FD";

/// Upper bound for one payload: a maximal BPF program plus the flags.
const MAX_PAYLOAD: usize = 64 * 1024;

/// Restrictions the injected library applies once the program is loaded,
/// after `execve(2)` has already happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct PreloadPayload {
    /// Capability mask for the effective, permitted and inheritable sets.
    pub capabilities: Option<u64>,
    pub ambient: bool,
    pub seccomp_strict: bool,
    /// BPF instructions packed one per word.
    pub seccomp_filter: Option<Vec<u64>>,
    pub seccomp_tsync: bool,
}

impl PreloadPayload {
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_none() && !self.seccomp_strict && self.seccomp_filter.is_none()
    }
}

/// A socket holding one encoded payload, waiting to be inherited.
///
/// The payload is queued before the sandboxed process exists, so the write
/// never blocks on the reader.
#[derive(Debug)]
pub struct PreloadChannel {
    inherited: OwnedFd,
}

impl PreloadChannel {
    pub fn new(payload: &PreloadPayload) -> Result<Self> {
        let (sender, inherited) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .context("Failed to create preload socketpair")?;

        let buf = bincode::encode_to_vec(payload, bincode::config::standard())
            .context("Failed to encode preload payload")?;
        ensure!(buf.len() <= MAX_PAYLOAD, "preload payload is too large");
        write(&sender, &buf).context("Failed to queue preload payload")?;

        Ok(Self { inherited })
    }

    /// Descriptor number the sandboxed process will see.
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.inherited.as_raw_fd()
    }

    /// Lets the descriptor survive `execve(2)`. Runs in the child.
    pub fn inherit(&self) -> Result<()> {
        fcntl(&self.inherited, FcntlArg::F_SETFD(FdFlag::empty()))
            .context("Failed to clear FD_CLOEXEC on the preload socket")?;
        Ok(())
    }
}

impl AsFd for PreloadChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inherited.as_fd()
    }
}
