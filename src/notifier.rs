use anyhow::{Context, Result, ensure};
use core::fmt;
use nix::{
    sys::eventfd::{EfdFlags, EventFd},
    unistd::{read, write},
};

/// One-shot gate between the parent and the cloned child.
///
/// The child blocks in [`Notifier::wait`] until the parent has written the
/// id maps and calls [`Notifier::release`].
pub struct Notifier {
    inner: EventFd,
}

impl Notifier {
    pub fn new() -> Result<Self> {
        let inner = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC)
            .context("Failed to create EventFd")?;

        Ok(Self { inner })
    }

    pub fn wait(&self) -> Result<()> {
        let mut buffer = 0u64.to_ne_bytes();
        let n = read(&self.inner, &mut buffer).context("Failed to wait for the parent")?;
        ensure!(
            n == buffer.len() && u64::from_ne_bytes(buffer) > 0,
            "parent released the gate without a value"
        );
        Ok(())
    }

    pub fn release(&self) -> Result<()> {
        write(&self.inner, &1u64.to_ne_bytes()).context("Failed to release the child")?;
        Ok(())
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier").field("fd", &self.inner).finish()
    }
}
