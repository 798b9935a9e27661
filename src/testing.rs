//! In-process stand-ins for the host, the classifier and the engine.

use crate::{
    capabilities::Capability,
    elf::{BinaryClassifier, Linkage},
    engine::SandboxEngine,
    identity::SystemIdentity,
    spec::{
        BindMount, IdMaps, Identity, MountSpec, Namespaces, RootChange, Rlimit, SeccompMode,
    },
};
use anyhow::{Result, bail};
use nix::unistd::{Gid, Pid, Uid};
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    os::fd::RawFd,
    path::{Path, PathBuf},
};

#[derive(Debug)]
pub struct FakeIdentity {
    pub users: HashMap<String, (Uid, Gid)>,
    pub groups: HashMap<String, Gid>,
    pub cap_setgid: bool,
    pub caller: (Uid, Gid),
    pub lookups: RefCell<Vec<String>>,
}

impl Default for FakeIdentity {
    fn default() -> Self {
        Self {
            users: HashMap::from([("alice".to_string(), (Uid::from_raw(1001), Gid::from_raw(100)))]),
            groups: HashMap::from([("staff".to_string(), Gid::from_raw(50))]),
            cap_setgid: false,
            caller: (Uid::from_raw(1000), Gid::from_raw(1000)),
            lookups: RefCell::new(Vec::new()),
        }
    }
}

impl SystemIdentity for FakeIdentity {
    fn resolve_user(&self, name: &str) -> Result<Option<(Uid, Gid)>> {
        self.lookups.borrow_mut().push(name.to_string());
        Ok(self.users.get(name).copied())
    }

    fn resolve_group(&self, name: &str) -> Result<Option<Gid>> {
        self.lookups.borrow_mut().push(name.to_string());
        Ok(self.groups.get(name).copied())
    }

    fn has_effective_capability(&self, capability: Capability) -> Result<bool> {
        Ok(capability == Capability::CAP_SETGID && self.cap_setgid)
    }

    fn caller_ids(&self) -> (Uid, Gid) {
        self.caller
    }
}

#[derive(Debug)]
pub struct FakeClassifier {
    pub linkage: Option<Linkage>,
    pub calls: RefCell<Vec<PathBuf>>,
}

impl FakeClassifier {
    pub fn returning(linkage: Linkage) -> Self {
        Self {
            linkage: Some(linkage),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            linkage: None,
            calls: RefCell::new(Vec::new()),
        }
    }
}

impl BinaryClassifier for FakeClassifier {
    fn classify(&self, path: &Path) -> Result<Linkage> {
        self.calls.borrow_mut().push(path.to_path_buf());
        match self.linkage {
            Some(linkage) => Ok(linkage),
            None => bail!("missing ELF magic"),
        }
    }
}

/// How the recording engine was asked to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launched {
    WithInjection { program: PathBuf, preload: PathBuf },
    WithoutInjection { program: PathBuf },
}

/// Records every configuration call in order and pretends to launch.
#[derive(Debug, Default)]
pub struct RecordingEngine {
    pub calls: Vec<&'static str>,
    pub namespaces: Option<Namespaces>,
    pub binds: Vec<BindMount>,
    pub id_maps: Option<IdMaps>,
    pub preserved: Vec<(RawFd, RawFd)>,
    pub launched: Option<Launched>,
    pub exit_status: i32,
    pub waited: Cell<bool>,
    pub fail_on: Option<&'static str>,
}

impl RecordingEngine {
    fn record(&mut self, call: &'static str) -> Result<()> {
        self.calls.push(call);
        if self.fail_on == Some(call) {
            bail!("{call} refused");
        }
        Ok(())
    }
}

impl SandboxEngine for RecordingEngine {
    fn namespaces(&mut self, namespaces: &Namespaces) -> Result<()> {
        self.namespaces = Some(namespaces.clone());
        self.record("namespaces")
    }

    fn skip_remount_private(&mut self) -> Result<()> {
        self.record("skip_remount_private")
    }

    fn enter_root(&mut self, _root: &RootChange) -> Result<()> {
        self.record("enter_root")
    }

    fn bind(&mut self, bind: &BindMount) -> Result<()> {
        self.binds.push(bind.clone());
        self.record("bind")
    }

    fn mount(&mut self, _mount: &MountSpec) -> Result<()> {
        self.record("mount")
    }

    fn mount_tmp(&mut self, _size: u64) -> Result<()> {
        self.record("mount_tmp")
    }

    fn mount_dev(&mut self) -> Result<()> {
        self.record("mount_dev")
    }

    fn remount_proc_readonly(&mut self) -> Result<()> {
        self.record("remount_proc_readonly")
    }

    fn use_capabilities(&mut self, _mask: u64, _ambient: bool) -> Result<()> {
        self.record("use_capabilities")
    }

    fn skip_securebits(&mut self, _mask: u64) -> Result<()> {
        self.record("skip_securebits")
    }

    fn rlimit(&mut self, _rlimit: &Rlimit) -> Result<()> {
        self.record("rlimit")
    }

    fn change_identity(&mut self, _identity: &Identity) -> Result<()> {
        self.record("change_identity")
    }

    fn id_maps(&mut self, maps: &IdMaps) -> Result<()> {
        self.id_maps = Some(maps.clone());
        self.record("id_maps")
    }

    fn no_new_privs(&mut self) -> Result<()> {
        self.record("no_new_privs")
    }

    fn log_seccomp_failures(&mut self) -> Result<()> {
        self.record("log_seccomp_failures")
    }

    fn seccomp_tsync(&mut self) -> Result<()> {
        self.record("seccomp_tsync")
    }

    fn seccomp(&mut self, _mode: &SeccompMode) -> Result<()> {
        self.record("seccomp")
    }

    fn pid_file(&mut self, _path: &Path) -> Result<()> {
        self.record("pid_file")
    }

    fn forward_signals(&mut self) -> Result<()> {
        self.record("forward_signals")
    }

    fn run_as_init(&mut self) -> Result<()> {
        self.record("run_as_init")
    }

    fn new_session_keyring(&mut self) -> Result<()> {
        self.record("new_session_keyring")
    }

    fn preserve_fd(&mut self, parent: RawFd, child: RawFd) -> Result<()> {
        self.preserved.push((parent, child));
        self.record("preserve_fd")
    }

    fn launch_with_injection(
        &mut self,
        program: &Path,
        _argv: &[String],
        preload: &Path,
    ) -> Result<Pid> {
        self.record("launch_with_injection")?;
        self.launched = Some(Launched::WithInjection {
            program: program.to_path_buf(),
            preload: preload.to_path_buf(),
        });
        Ok(Pid::from_raw(4242))
    }

    fn launch_without_injection(&mut self, program: &Path, _argv: &[String]) -> Result<Pid> {
        self.record("launch_without_injection")?;
        self.launched = Some(Launched::WithoutInjection {
            program: program.to_path_buf(),
        });
        Ok(Pid::from_raw(4242))
    }

    fn wait(&mut self) -> Result<i32> {
        self.record("wait")?;
        self.waited.set(true);
        Ok(self.exit_status)
    }
}
