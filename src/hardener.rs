//! Steps the cloned child runs on itself before `execve(2)`.

use crate::spec::{
    BindMount, Identity, MountSpec, RootChange, Rlimit, SupplementaryGroups, join_inside,
};
use anyhow::{Context, Result, bail};
use nix::{
    errno::Errno,
    libc::{PR_SET_NO_NEW_PRIVS, prctl},
    mount::{MntFlags, MsFlags, mount, umount2},
    sched::{CloneFlags, setns},
    sys::statvfs::{FsFlags, statvfs},
    unistd::{chdir, chroot, initgroups, pivot_root, sethostname, setgroups, setresgid, setresuid},
};
use std::{
    ffi::CString,
    fs::{File, OpenOptions},
    os::{fd::RawFd, unix::fs::symlink},
    path::{Path, PathBuf},
};

const KEYCTL_JOIN_SESSION_KEYRING: libc::c_long = 1;

/// Device nodes bind mounted from the host into a fresh `/dev`.
const DEV_NODES: [&str; 6] = ["full", "null", "random", "tty", "urandom", "zero"];

const DEV_LINKS: [(&str, &str); 5] = [
    ("fd", "/proc/self/fd"),
    ("stdin", "/proc/self/fd/0"),
    ("stdout", "/proc/self/fd/1"),
    ("stderr", "/proc/self/fd/2"),
    ("ptmx", "pts/ptmx"),
];

/// The process and its children are prevented from gaining new privileges via `execve()`
pub(crate) fn apply_no_new_privs() -> Result<()> {
    let ret = unsafe { prctl(PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        Err(std::io::Error::last_os_error()).context("Failed to set no_new_privs")
    } else {
        Ok(())
    }
}

/// Joins the namespace of type `flag` that `path` refers to.
pub fn enter_namespace(path: &Path, flag: CloneFlags) -> Result<()> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open namespace {}", path.display()))?;
    setns(&file, flag).with_context(|| format!("Failed to enter namespace {}", path.display()))
}

/// Recursively marks every mount as private so nothing done in the new
/// mount namespace propagates back to the host.
pub fn make_mounts_private() -> Result<()> {
    let flags = MsFlags::MS_REC | MsFlags::MS_PRIVATE;
    mount::<str, str, str, str>(None, "/", None, flags, None)
        .context("Failed to mark mounts private")
}

pub fn set_hostname(name: &str) -> Result<()> {
    sethostname(name).with_context(|| format!("Failed to set hostname to {name}"))
}

/// Where `path` inside the sandbox lives before the root changes.
fn staged(root: Option<&Path>, path: &Path) -> PathBuf {
    match root {
        Some(root) => join_inside(root, path),
        None => path.to_path_buf(),
    }
}

pub fn bind_mount(bind: &BindMount, root: Option<&Path>) -> Result<()> {
    let target = staged(root, &bind.destination);
    let flags = MsFlags::MS_BIND | MsFlags::MS_REC;

    mount::<Path, Path, str, str>(Some(bind.source.as_path()), &target, None, flags, None)
        .with_context(|| {
            format!(
                "Failed to bind {} to {}",
                bind.source.display(),
                target.display()
            )
        })?;

    if !bind.writable {
        remount_read_only(&target)?;
    }
    Ok(())
}

/// Remounts a bind mount read-only, carrying over the flags the kernel
/// refuses to clear inside a user namespace.
fn remount_read_only(target: &Path) -> Result<()> {
    let current = statvfs(target)
        .with_context(|| format!("Failed to stat {}", target.display()))?
        .flags();

    let mut flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY;
    for (locked, flag) in [
        (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
        (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
        (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
        (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
        (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
        (FsFlags::ST_RELATIME, MsFlags::MS_RELATIME),
    ] {
        if current.contains(locked) {
            flags |= flag;
        }
    }

    mount::<str, Path, str, str>(None, target, None, flags, None)
        .with_context(|| format!("Failed to remount {} read-only", target.display()))
}

pub fn mount_filesystem(spec: &MountSpec, root: Option<&Path>) -> Result<()> {
    let target = staged(root, &spec.destination);
    let flags = MsFlags::from_bits_truncate(spec.flags as libc::c_ulong);

    mount::<str, Path, str, str>(
        Some(spec.source.as_str()),
        &target,
        Some(spec.fstype.as_str()),
        flags,
        spec.data.as_deref(),
    )
    .with_context(|| {
        format!(
            "Failed to mount {} ({}) at {}",
            spec.source,
            spec.fstype,
            target.display()
        )
    })
}

pub fn mount_tmp(root: Option<&Path>, size: u64) -> Result<()> {
    let target = staged(root, Path::new("/tmp"));
    let flags = MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID;
    let data = format!("size={size},mode=1777");

    mount::<str, Path, str, str>(
        Some("tmpfs"),
        &target,
        Some("tmpfs"),
        flags,
        Some(data.as_str()),
    )
    .with_context(|| format!("Failed to mount tmpfs at {}", target.display()))
}

/// Builds a minimal `/dev` under the new root.
pub fn mount_dev(root: &Path) -> Result<()> {
    let dev = join_inside(root, Path::new("/dev"));
    let flags = MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC;

    mount::<str, Path, str, str>(
        Some("tmpfs"),
        &dev,
        Some("tmpfs"),
        flags,
        Some("size=512K,mode=0755"),
    )
    .with_context(|| format!("Failed to mount tmpfs at {}", dev.display()))?;

    for node in DEV_NODES {
        let source = Path::new("/dev").join(node);
        let target = dev.join(node);

        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&target)
            .with_context(|| format!("Failed to create {}", target.display()))?;
        let flags = MsFlags::MS_BIND;
        mount::<Path, Path, str, str>(Some(source.as_path()), &target, None, flags, None)
            .with_context(|| format!("Failed to bind {}", source.display()))?;
    }

    for (link, target) in DEV_LINKS {
        symlink(target, dev.join(link))
            .with_context(|| format!("Failed to link /dev/{link} to {target}"))?;
    }

    Ok(())
}

/// `pivot_root(2)` needs the new root to be a mount point.
pub fn bind_mount_self(path: &Path) -> Result<()> {
    let flags = MsFlags::MS_BIND | MsFlags::MS_REC;
    mount::<Path, Path, str, str>(Some(path), path, None, flags, None)
        .with_context(|| format!("Failed to bind {} onto itself", path.display()))
}

pub fn enter_root(root: &RootChange) -> Result<()> {
    match root {
        RootChange::Chroot(path) => {
            chroot(path).with_context(|| format!("Failed to chroot to {}", path.display()))?;
        }
        RootChange::PivotRoot(path) => {
            chdir(path).with_context(|| format!("Failed to chdir to {}", path.display()))?;
            // Stack the old root on top of the new one, then detach it.
            pivot_root(".", ".")
                .with_context(|| format!("Failed to pivot_root to {}", path.display()))?;
            umount2(".", MntFlags::MNT_DETACH).context("Failed to detach the old root")?;
        }
    }

    chdir("/").context("Failed to chdir to the new root")?;
    Ok(())
}

/// Mounts a read-only `/proc` for the current pid namespace.
pub fn mount_proc() -> Result<()> {
    let flags =
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_RDONLY;
    mount::<str, str, str, str>(Some("proc"), "/proc", Some("proc"), flags, None)
        .context("Failed to mount /proc")
}

pub fn set_rlimit(rlimit: &Rlimit) -> Result<()> {
    let limit = libc::rlimit {
        rlim_cur: rlimit.soft as libc::rlim_t,
        rlim_max: rlimit.hard as libc::rlim_t,
    };

    // SAFETY: `limit` is a valid rlimit for the duration of the call.
    let ret = unsafe { libc::setrlimit(rlimit.resource as _, &limit) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("Failed to set rlimit {}", rlimit.resource));
    }
    Ok(())
}

/// Creates and joins a new anonymous session keyring.
pub fn join_session_keyring() -> Result<()> {
    // SAFETY: a NULL name asks for an anonymous keyring.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_keyctl,
            KEYCTL_JOIN_SESSION_KEYRING,
            std::ptr::null::<libc::c_char>(),
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error())
            .context("Failed to join a new session keyring");
    }
    Ok(())
}

/// Applies supplementary groups, gid and uid, in that order.
pub fn change_identity(identity: &Identity, setgroups_denied: bool) -> Result<()> {
    let changing = identity.uid.is_some() || identity.gid.is_some();

    match identity.supplementary {
        SupplementaryGroups::Keep => {}
        SupplementaryGroups::Inherit => {
            let Some((name, gid)) = &identity.user else {
                bail!("Inheriting supplementary groups (-G) requires a user name (-u)");
            };
            let name = CString::new(name.as_str()).context("User name contains a NUL byte")?;
            initgroups(&name, *gid)
                .with_context(|| format!("Failed to initialize groups for {name:?}"))?;
        }
        SupplementaryGroups::Default if changing && !setgroups_denied => {
            setgroups(&[]).context("Failed to drop supplementary groups")?;
        }
        SupplementaryGroups::Default => {}
    }

    if let Some(gid) = identity.gid {
        setresgid(gid, gid, gid).with_context(|| format!("Failed to change gid to {gid}"))?;
    }
    if let Some(uid) = identity.uid {
        setresuid(uid, uid, uid).with_context(|| format!("Failed to change uid to {uid}"))?;
    }
    Ok(())
}

/// Makes `parent` visible as `child` across `execve(2)`.
pub fn preserve_fd(parent: RawFd, child: RawFd) -> Result<()> {
    if parent == child {
        // SAFETY: F_SETFD on a descriptor number has no memory effects.
        let ret = unsafe { libc::fcntl(child, libc::F_SETFD, 0) };
        Errno::result(ret).with_context(|| format!("Failed to keep fd {child} open"))?;
    } else {
        // SAFETY: dup2 only manipulates the descriptor table.
        let ret = unsafe { libc::dup2(parent, child) };
        Errno::result(ret).with_context(|| format!("Failed to move fd {parent} to {child}"))?;
    }
    Ok(())
}
