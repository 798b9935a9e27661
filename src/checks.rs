use anyhow::{Context, Result, ensure};
use nix::sched::CloneFlags;
use std::{fs, path::Path};

const MAX_USER_NAMESPACES: &str = "/proc/sys/user/max_user_namespaces";

pub fn is_namespace_supported(flag: CloneFlags) -> bool {
    fn exists(ns: &str) -> bool {
        Path::new("/proc/self/ns").join(ns).exists()
    }

    match flag {
        CloneFlags::CLONE_NEWCGROUP => exists("cgroup"),
        CloneFlags::CLONE_NEWIPC => exists("ipc"),
        CloneFlags::CLONE_NEWNET => exists("net"),
        CloneFlags::CLONE_NEWNS => exists("mnt"),
        CloneFlags::CLONE_NEWPID => exists("pid"),
        CloneFlags::CLONE_NEWUSER => exists("user"),
        CloneFlags::CLONE_NEWUTS => exists("uts"),
        _ => false,
    }
}

/// Fails early when user namespaces exist but have been disabled by the
/// administrator.
pub fn ensure_user_namespaces_enabled() -> Result<()> {
    let Ok(limit) = fs::read_to_string(MAX_USER_NAMESPACES) else {
        // Older kernels have no limit to report.
        return Ok(());
    };

    let limit: u64 = limit
        .trim()
        .parse()
        .with_context(|| format!("Unexpected contents in {MAX_USER_NAMESPACES}"))?;
    ensure!(limit > 0, "User namespaces are disabled ({MAX_USER_NAMESPACES} is 0)");
    Ok(())
}

/// Clone flags for every namespace in `requested`, refusing the ones this
/// kernel lacks.
pub fn namespace_flags(requested: &[(bool, CloneFlags)]) -> Result<CloneFlags> {
    let mut flags = CloneFlags::empty();

    for &(enabled, flag) in requested {
        if !enabled {
            continue;
        }
        ensure!(is_namespace_supported(flag), "Kernel doesn't support {flag:?}");
        if flag == CloneFlags::CLONE_NEWUSER {
            ensure_user_namespaces_enabled()?;
        }
        flags.insert(flag);
    }

    Ok(flags)
}
