use crate::{
    checks,
    engine::SandboxEngine,
    jailer::{JailHandle, Jailer},
    preload::PreloadPayload,
    seccomp::{self, SeccompProgram},
    spec::{
        BindMount, IdMaps, Identity, MountSpec, Namespaces, RootChange, Rlimit, SeccompMode,
        SupplementaryGroups,
    },
};
use anyhow::{Context, Result, ensure};
use nix::{sched::CloneFlags, unistd::Pid};
use std::{
    os::fd::RawFd,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// Everything the native engine was told before launch.
#[derive(Debug, Default)]
pub struct JailConfig {
    pub namespaces: Namespaces,
    pub skip_remount_private: bool,
    pub root: Option<RootChange>,
    pub binds: Vec<BindMount>,
    pub mounts: Vec<MountSpec>,
    pub tmpfs_size: Option<u64>,
    pub mount_dev: bool,
    pub remount_proc_readonly: bool,
    /// Capability mask and whether to raise it into the ambient set.
    pub capabilities: Option<(u64, bool)>,
    pub securebits_skip: u64,
    pub rlimits: Vec<Rlimit>,
    pub identity: Identity,
    pub id_maps: IdMaps,
    pub no_new_privs: bool,
    pub seccomp: Option<SeccompProgram>,
    pub seccomp_log: bool,
    pub seccomp_tsync: bool,
    pub pid_file: Option<PathBuf>,
    pub forward_signals: bool,
    pub run_as_init: bool,
    pub session_keyring: bool,
    pub preserved_fds: Vec<(RawFd, RawFd)>,
}

impl JailConfig {
    pub fn clone_flags(&self) -> Result<CloneFlags> {
        let ns = &self.namespaces;
        checks::namespace_flags(&[
            (ns.user, CloneFlags::CLONE_NEWUSER),
            (ns.mount, CloneFlags::CLONE_NEWNS),
            (ns.pid, CloneFlags::CLONE_NEWPID),
            (ns.net, CloneFlags::CLONE_NEWNET),
            (ns.ipc, CloneFlags::CLONE_NEWIPC),
            (ns.uts, CloneFlags::CLONE_NEWUTS),
            (ns.cgroup, CloneFlags::CLONE_NEWCGROUP),
        ])
    }

    /// Restrictions the injected library applies after `execve(2)`.
    pub fn preload_payload(&self) -> PreloadPayload {
        let (capabilities, ambient) = match self.capabilities {
            Some((mask, ambient)) => (Some(mask), ambient),
            None => (None, false),
        };

        PreloadPayload {
            capabilities,
            ambient,
            seccomp_strict: matches!(self.seccomp, Some(SeccompProgram::Strict)),
            seccomp_filter: match &self.seccomp {
                Some(SeccompProgram::Filter(program)) => Some(seccomp::pack(program)),
                _ => None,
            },
            seccomp_tsync: self.seccomp_tsync,
        }
    }
}

/// The native engine: records configuration, then clones the sandboxed
/// process on launch.
#[derive(Debug, Default)]
pub struct Jail {
    config: JailConfig,
    handle: Option<JailHandle>,
}

impl Jail {
    pub fn new() -> Self {
        Self::default()
    }

    fn launch(&mut self, program: &Path, argv: &[String], preload: Option<&Path>) -> Result<Pid> {
        ensure!(self.handle.is_none(), "a program was already launched");
        ensure!(
            preload.is_some() || !matches!(self.config.seccomp, Some(SeccompProgram::Strict)),
            "Seccomp strict mode (-s) needs a dynamically linked program"
        );
        ensure!(
            !self.config.mount_dev || self.config.root.is_some(),
            "Creating /dev (-d) requires chroot (-C) or pivot_root (-P)"
        );

        let flags = self.config.clone_flags()?;
        debug!(?flags, injected = preload.is_some(), "launching {}", program.display());

        let handle = Jailer::new(&self.config, program, argv, preload)?.spawn(flags)?;
        let pid = handle.pid();
        info!(%pid, "started {}", program.display());

        self.handle = Some(handle);
        Ok(pid)
    }
}

impl SandboxEngine for Jail {
    fn namespaces(&mut self, namespaces: &Namespaces) -> Result<()> {
        if let Some(name) = &namespaces.hostname {
            ensure!(namespaces.uts, "hostname {name} needs a UTS namespace");
        }
        self.config.namespaces = namespaces.clone();
        Ok(())
    }

    fn skip_remount_private(&mut self) -> Result<()> {
        self.config.skip_remount_private = true;
        Ok(())
    }

    fn enter_root(&mut self, root: &RootChange) -> Result<()> {
        let path = root.path();
        ensure!(path.is_dir(), "{} is not a directory", path.display());
        self.config.root = Some(root.clone());
        Ok(())
    }

    fn bind(&mut self, bind: &BindMount) -> Result<()> {
        ensure!(
            bind.destination.is_absolute(),
            "bind destination {} must be absolute",
            bind.destination.display()
        );
        self.config.binds.push(bind.clone());
        Ok(())
    }

    fn mount(&mut self, mount: &MountSpec) -> Result<()> {
        ensure!(
            mount.destination.is_absolute(),
            "mount destination {} must be absolute",
            mount.destination.display()
        );
        self.config.mounts.push(mount.clone());
        Ok(())
    }

    fn mount_tmp(&mut self, size: u64) -> Result<()> {
        self.config.tmpfs_size = Some(size);
        Ok(())
    }

    fn mount_dev(&mut self) -> Result<()> {
        self.config.mount_dev = true;
        Ok(())
    }

    fn remount_proc_readonly(&mut self) -> Result<()> {
        self.config.remount_proc_readonly = true;
        Ok(())
    }

    fn use_capabilities(&mut self, mask: u64, ambient: bool) -> Result<()> {
        self.config.capabilities = Some((mask, ambient));
        Ok(())
    }

    fn skip_securebits(&mut self, mask: u64) -> Result<()> {
        self.config.securebits_skip = mask;
        Ok(())
    }

    fn rlimit(&mut self, rlimit: &Rlimit) -> Result<()> {
        ensure!(
            rlimit.soft <= rlimit.hard,
            "rlimit {} has a soft limit above its hard limit",
            rlimit.resource
        );
        self.config.rlimits.push(*rlimit);
        Ok(())
    }

    fn change_identity(&mut self, identity: &Identity) -> Result<()> {
        ensure!(
            identity.supplementary != SupplementaryGroups::Inherit || identity.user.is_some(),
            "Inheriting supplementary groups (-G) requires a user name (-u)"
        );
        self.config.identity = identity.clone();
        Ok(())
    }

    fn id_maps(&mut self, maps: &IdMaps) -> Result<()> {
        self.config.id_maps = maps.clone();
        Ok(())
    }

    fn no_new_privs(&mut self) -> Result<()> {
        self.config.no_new_privs = true;
        Ok(())
    }

    fn log_seccomp_failures(&mut self) -> Result<()> {
        self.config.seccomp_log = true;
        Ok(())
    }

    fn seccomp_tsync(&mut self) -> Result<()> {
        self.config.seccomp_tsync = true;
        Ok(())
    }

    fn seccomp(&mut self, mode: &SeccompMode) -> Result<()> {
        self.config.seccomp = match mode {
            SeccompMode::None => None,
            SeccompMode::Strict => Some(SeccompProgram::Strict),
            SeccompMode::Filter(path) => Some(SeccompProgram::Filter(seccomp::compile_policy(
                path,
                self.config.seccomp_log,
            )?)),
        };
        Ok(())
    }

    fn pid_file(&mut self, path: &Path) -> Result<()> {
        self.config.pid_file = Some(path.to_path_buf());
        Ok(())
    }

    fn forward_signals(&mut self) -> Result<()> {
        self.config.forward_signals = true;
        Ok(())
    }

    fn run_as_init(&mut self) -> Result<()> {
        self.config.run_as_init = true;
        Ok(())
    }

    fn new_session_keyring(&mut self) -> Result<()> {
        self.config.session_keyring = true;
        Ok(())
    }

    fn preserve_fd(&mut self, parent: RawFd, child: RawFd) -> Result<()> {
        ensure!(parent >= 0 && child >= 0, "invalid descriptor pair {parent} -> {child}");
        self.config.preserved_fds.push((parent, child));
        Ok(())
    }

    fn launch_with_injection(
        &mut self,
        program: &Path,
        argv: &[String],
        preload: &Path,
    ) -> Result<Pid> {
        self.launch(program, argv, Some(preload))
    }

    fn launch_without_injection(&mut self, program: &Path, argv: &[String]) -> Result<Pid> {
        self.launch(program, argv, None)
    }

    fn wait(&mut self) -> Result<i32> {
        let handle = self.handle.as_ref().context("no program was launched")?;
        handle.wait(self.config.forward_signals)
    }
}
