use crate::capabilities::{CapSet, Capability};
use anyhow::{Context, Result};
use nix::unistd::{Gid, Group, Uid, User, getgid, getuid};

/// Identity questions the option parser needs answered about the host.
pub trait SystemIdentity {
    /// Looks up a user by name, returning its uid and primary gid.
    fn resolve_user(&self, name: &str) -> Result<Option<(Uid, Gid)>>;

    /// Looks up a group by name.
    fn resolve_group(&self, name: &str) -> Result<Option<Gid>>;

    /// Whether `capability` is in the caller's effective set.
    fn has_effective_capability(&self, capability: Capability) -> Result<bool>;

    /// Real uid and gid of the caller.
    fn caller_ids(&self) -> (Uid, Gid);
}

/// Answers from the running process and the system user database.
#[derive(Debug, Clone, Copy)]
pub struct HostIdentity {
    ruid: Uid,
    rgid: Gid,
}

impl HostIdentity {
    pub fn new() -> Self {
        Self {
            ruid: getuid(),
            rgid: getgid(),
        }
    }
}

impl Default for HostIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemIdentity for HostIdentity {
    fn resolve_user(&self, name: &str) -> Result<Option<(Uid, Gid)>> {
        let user = User::from_name(name).with_context(|| format!("Failed to look up user {name}"))?;
        Ok(user.map(|user| (user.uid, user.gid)))
    }

    fn resolve_group(&self, name: &str) -> Result<Option<Gid>> {
        let group =
            Group::from_name(name).with_context(|| format!("Failed to look up group {name}"))?;
        Ok(group.map(|group| group.gid))
    }

    fn has_effective_capability(&self, capability: Capability) -> Result<bool> {
        if !caps::runtime::thread_all_supported().contains(&capability) {
            return Ok(false);
        }

        caps::has_cap(None, CapSet::Effective, capability)
            .with_context(|| format!("Could not get the value of {capability}"))
    }

    #[inline]
    fn caller_ids(&self) -> (Uid, Gid) {
        (self.ruid, self.rgid)
    }
}
