use anyhow::{Context, Result, bail};
use nix::{
    errno::Errno,
    fcntl::OFlag,
    unistd::{pipe2, read, write},
};
use std::os::fd::{AsRawFd, OwnedFd};

/// Carries a setup failure from the cloned child back to the parent.
///
/// Both ends are close-on-exec: a successful `execve(2)` closes the
/// writer, so the parent reads end-of-file and knows the program started.
#[derive(Debug)]
pub struct ErrorReporter {
    reader: OwnedFd,
    writer: OwnedFd,
}

impl ErrorReporter {
    pub fn new() -> Result<Self> {
        let (reader, writer) = pipe2(OFlag::O_CLOEXEC)
            .context("Failed to create pipe for process error reporting")?;

        Ok(Self { reader, writer })
    }

    /// Sends `error` to the parent. Runs in the child, right before it exits.
    pub fn report(&self, error: &anyhow::Error) {
        let message = format!("{error:#}");
        let mut bytes = message.as_bytes();

        while !bytes.is_empty() {
            match write(&self.writer, bytes) {
                Ok(n) => bytes = &bytes[n..],
                Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }
    }

    /// Closes this process's copy of the writer. Used by a forked init
    /// process, which must not keep the parent waiting.
    pub fn detach(&self) {
        // SAFETY: only called in a child that never drops this value, so the
        // descriptor is not closed twice.
        unsafe { libc::close(self.writer.as_raw_fd()) };
    }

    /// Waits until the child either reports an error or gets to `execve(2)`.
    /// Runs in the parent.
    pub fn collect(self) -> Result<()> {
        let Self { reader, writer } = self;
        drop(writer);

        let mut message = Vec::new();
        let mut buffer = [0u8; 512];
        loop {
            match read(&reader, &mut buffer) {
                Ok(0) => break,
                Ok(n) => message.extend_from_slice(&buffer[..n]),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno).context("Failed to read child error report"),
            }
        }

        if !message.is_empty() {
            bail!("{}", String::from_utf8_lossy(&message));
        }
        Ok(())
    }
}
