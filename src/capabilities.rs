use anyhow::{Context, Result, bail};
use caps::CapsHashSet;
use nix::libc::{PR_SET_SECUREBITS, prctl};

pub(crate) use caps::{CapSet, Capability};

const SECURE_NOROOT: u64 = 1 << 0;
const SECURE_NOROOT_LOCKED: u64 = 1 << 1;
const SECURE_NO_SETUID_FIXUP: u64 = 1 << 2;
const SECURE_NO_SETUID_FIXUP_LOCKED: u64 = 1 << 3;
const SECURE_KEEP_CAPS: u64 = 1 << 4;
const SECURE_KEEP_CAPS_LOCKED: u64 = 1 << 5;

/// Securebits set when capabilities are restricted, before the skip mask.
pub const DEFAULT_SECUREBITS: u64 = SECURE_NOROOT
    | SECURE_NOROOT_LOCKED
    | SECURE_NO_SETUID_FIXUP
    | SECURE_NO_SETUID_FIXUP_LOCKED
    | SECURE_KEEP_CAPS
    | SECURE_KEEP_CAPS_LOCKED;

/// Restricts the calling process to a capability mask.
///
/// The work is split in two because the uid change sits in the middle:
/// [`CapabilityManager::lock_bounding`] runs while the process still holds
/// `CAP_SETPCAP`, [`CapabilityManager::apply_sets`] runs after the uid and
/// gid have changed.
#[derive(Debug)]
pub(crate) struct CapabilityManager {
    retained: CapsHashSet,
    ambient: bool,
    securebits: u64,
}

impl CapabilityManager {
    pub fn new(mask: u64, ambient: bool, securebits_skip: u64) -> Self {
        Self {
            retained: capabilities_from_mask(mask),
            ambient,
            securebits: DEFAULT_SECUREBITS & !securebits_skip,
        }
    }

    /// Drops everything outside the mask from the bounding set and locks the
    /// securebits so the upcoming uid change keeps the retained capabilities.
    pub fn lock_bounding(&self) -> Result<()> {
        for capability in caps::runtime::thread_all_supported() {
            if !self.retained.contains(&capability) {
                caps::drop(None, CapSet::Bounding, capability).with_context(|| {
                    format!("Failed to drop bounding capability: {capability}")
                })?;
            }
        }

        if self.securebits != 0 {
            let ret = unsafe { prctl(PR_SET_SECUREBITS, self.securebits, 0, 0, 0) };
            if ret != 0 {
                return Err(std::io::Error::last_os_error())
                    .with_context(|| format!("Failed to set securebits {:#x}", self.securebits));
            }
        }

        Ok(())
    }

    /// Sets the effective, permitted and inheritable sets to the mask, and
    /// raises the ambient set when asked to.
    pub fn apply_sets(&self) -> Result<()> {
        // Inheritable first: it must be a subset of the current permitted set.
        Self::set(CapSet::Inheritable, &self.retained)?;
        Self::set(CapSet::Effective, &self.retained)?;
        Self::set(CapSet::Permitted, &self.retained)?;

        if self.ambient {
            for capability in &self.retained {
                caps::raise(None, CapSet::Ambient, *capability)
                    .with_context(|| format!("Failed to raise ambient capability {capability}"))?;
            }
        }

        self.validate()
    }

    fn set(cap_set: CapSet, capabilities: &CapsHashSet) -> Result<()> {
        caps::set(None, cap_set, capabilities)
            .with_context(|| format!("Failed to set {cap_set:?} capability set"))
    }

    fn validate(&self) -> Result<()> {
        let current = caps::read(None, CapSet::Effective)
            .context("Failed to read effective capabilities")?;

        if current != self.retained {
            bail!("required: {:?}, current: {:?}", self.retained, current);
        }

        Ok(())
    }
}

/// Expands a `CAP_*` bit mask into the capabilities this kernel knows about.
pub fn capabilities_from_mask(mask: u64) -> CapsHashSet {
    caps::all()
        .into_iter()
        .filter(|capability| mask & capability.bitmask() != 0)
        .collect()
}
