use crate::{
    capabilities::CapabilityManager,
    hardener,
    jail::JailConfig,
    notifier::Notifier,
    preload::{PRELOAD_FD_ENV, PreloadChannel},
    report::ErrorReporter,
    seccomp::{self, SeccompProgram},
    spec::RootChange,
    stack::GuardedStack,
};
use anyhow::{Context, Result};
use nix::{
    errno::Errno,
    sched::{CloneCb, CloneFlags, clone},
    sys::{
        signal::{
            SaFlags, SigAction, SigHandler, SigSet,
            Signal::{self, SIGHUP, SIGINT, SIGKILL, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2},
            kill, sigaction,
        },
        wait::{WaitStatus, waitpid},
    },
    unistd::{ForkResult, Pid, execve, fork},
};
use std::{
    cell::Cell,
    convert::Infallible,
    ffi::{CString, OsString},
    fs,
    os::unix::ffi::{OsStrExt, OsStringExt},
    path::Path,
    sync::atomic::{AtomicI32, Ordering},
};
use tracing::{debug, warn};

const STACK_SIZE: usize = 1024 * 1024;
const LD_PRELOAD: &str = "LD_PRELOAD";

/// Signals relayed to the sandboxed process while waiting on it.
const FORWARDED_SIGNALS: [Signal; 6] = [SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2];

static FORWARD_TO: AtomicI32 = AtomicI32::new(0);

/// One launch: the program, its environment, and the channels shared with
/// the cloned child.
pub struct Jailer<'jailer> {
    config: &'jailer JailConfig,
    program: CString,
    argv: Vec<CString>,
    env: Vec<CString>,
    preload: Option<PreloadChannel>,
    notifier: Notifier,
    report: ErrorReporter,
}

impl<'jailer> Jailer<'jailer> {
    pub fn new(
        config: &'jailer JailConfig,
        program: &Path,
        argv: &[String],
        preload: Option<&Path>,
    ) -> Result<Self> {
        let program = CString::new(program.as_os_str().as_bytes())
            .context("Program path contains a NUL byte")?;
        let argv = argv
            .iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .context("Program argument contains a NUL byte")?;

        let mut overrides = Vec::new();
        let preload = match preload {
            Some(library) => {
                let payload = config.preload_payload();
                debug!(restricted = !payload.is_empty(), "preparing preload payload");
                let channel = PreloadChannel::new(&payload)?;

                overrides.push((LD_PRELOAD, preload_list(library)));
                overrides.push((PRELOAD_FD_ENV, OsString::from(channel.fd().to_string())));
                Some(channel)
            }
            None => None,
        };

        Ok(Self {
            config,
            program,
            argv,
            env: environment(&overrides)?,
            preload,
            notifier: Notifier::new()?,
            report: ErrorReporter::new()?,
        })
    }

    /// Clones the child, finishes the parent's half of the setup and waits
    /// until the child has either reached `execve(2)` or failed.
    pub fn spawn(self, flags: CloneFlags) -> Result<JailHandle> {
        let mut stack = GuardedStack::new(STACK_SIZE)?;

        let callback: CloneCb = Box::new(|| -> isize {
            match self.child_main() {
                Ok(never) => match never {},
                Err(error) => {
                    self.report.report(&error);
                    1
                }
            }
        });

        let signal = Some(Signal::SIGCHLD as i32);
        // SAFETY: the child gets its own copy of the address space and only
        // runs `child_main`, which ends in execve or exit.
        let pid = unsafe { clone(callback, stack.as_mut_slice(), flags, signal) }
            .context("Failed to clone the sandboxed process")?;
        let handle = JailHandle::new(pid);

        if let Err(error) = self.parent_setup(pid) {
            handle.terminate();
            return Err(error.context("Parent setup failed"));
        }

        let Self { report, .. } = self;
        if let Err(error) = report.collect() {
            handle.terminate();
            return Err(error);
        }

        Ok(handle)
    }

    fn parent_setup(&self, pid: Pid) -> Result<()> {
        let maps = &self.config.id_maps;
        let proc = Path::new("/proc").join(pid.to_string());

        if maps.disable_setgroups {
            fs::write(proc.join("setgroups"), "deny").context("Failed to disable setgroups")?;
        }
        if let Some(map) = &maps.uid_map {
            fs::write(proc.join("uid_map"), kernel_map(map)).context("Could not set uid map")?;
        }
        if let Some(map) = &maps.gid_map {
            fs::write(proc.join("gid_map"), kernel_map(map)).context("Could not set gid map")?;
        }

        if let Some(path) = &self.config.pid_file {
            fs::write(path, format!("{pid}\n"))
                .with_context(|| format!("Could not write pid file {}", path.display()))?;
        }

        self.notifier.release()
    }

    fn child_main(&self) -> Result<Infallible> {
        self.notifier.wait()?;

        let config = self.config;
        let ns = &config.namespaces;

        if let Some(path) = &ns.enter_net {
            hardener::enter_namespace(path, CloneFlags::CLONE_NEWNET)?;
        }
        if let Some(path) = &ns.enter_mount {
            hardener::enter_namespace(path, CloneFlags::CLONE_NEWNS)?;
        }
        if ns.mount && !config.skip_remount_private {
            hardener::make_mounts_private()?;
        }
        if let Some(name) = &ns.hostname {
            hardener::set_hostname(name)?;
        }

        self.build_filesystem()?;

        for rlimit in &config.rlimits {
            hardener::set_rlimit(rlimit)?;
        }
        if config.session_keyring {
            hardener::join_session_keyring()?;
        }

        let capabilities = config
            .capabilities
            .map(|(mask, ambient)| CapabilityManager::new(mask, ambient, config.securebits_skip));
        if let Some(manager) = &capabilities {
            manager.lock_bounding()?;
        }

        hardener::change_identity(&config.identity, config.id_maps.disable_setgroups)?;

        match &self.preload {
            Some(channel) => channel.inherit()?,
            None => {
                if let Some(manager) = &capabilities {
                    manager.apply_sets()?;
                }
            }
        }

        if config.no_new_privs {
            hardener::apply_no_new_privs()?;
        }

        for &(parent, child) in &config.preserved_fds {
            hardener::preserve_fd(parent, child)?;
        }

        if ns.pid && !config.run_as_init {
            self.become_init()?;
        }

        if self.preload.is_none() {
            if let Some(SeccompProgram::Filter(program)) = &config.seccomp {
                seccomp::install(program, config.seccomp_tsync)?;
            }
        }

        match execve(&self.program, &self.argv, &self.env) {
            Ok(never) => match never {},
            Err(errno) => Err(errno).with_context(|| {
                format!("Failed to execute {}", self.program.to_string_lossy())
            }),
        }
    }

    /// Mounts everything under the new root, then switches into it.
    fn build_filesystem(&self) -> Result<()> {
        let config = self.config;
        let root = config.root.as_ref().map(RootChange::path);

        if let Some(RootChange::PivotRoot(path)) = &config.root {
            hardener::bind_mount_self(path)?;
        }
        for bind in &config.binds {
            hardener::bind_mount(bind, root)?;
        }
        for mount in &config.mounts {
            hardener::mount_filesystem(mount, root)?;
        }
        if let Some(size) = config.tmpfs_size {
            hardener::mount_tmp(root, size)?;
        }
        if let (true, Some(root)) = (config.mount_dev, root) {
            hardener::mount_dev(root)?;
        }
        if let Some(change) = &config.root {
            hardener::enter_root(change)?;
        }
        if config.namespaces.pid || config.remount_proc_readonly {
            hardener::mount_proc()?;
        }

        Ok(())
    }

    /// Splits pid 1 off from the program: the current process stays behind
    /// to reap orphans and the forked one goes on to `execve(2)`.
    fn become_init(&self) -> Result<()> {
        // SAFETY: the cloned child is single threaded.
        match unsafe { fork() }.context("Failed to fork the init process")? {
            ForkResult::Child => Ok(()),
            ForkResult::Parent { child } => {
                self.report.detach();
                // A failure only means signals reach init instead.
                let _ = install_forwarding(child);
                let status = reap_all(child);
                // SAFETY: leaves without unwinding into the clone trampoline.
                unsafe { libc::_exit(status) }
            }
        }
    }
}

/// `LD_PRELOAD` with `library` in front of anything already preloaded.
fn preload_list(library: &Path) -> OsString {
    let mut list = library.as_os_str().to_owned();
    if let Some(existing) = std::env::var_os(LD_PRELOAD).filter(|value| !value.is_empty()) {
        list.push(" ");
        list.push(existing);
    }
    list
}

/// The current environment with `overrides` replacing variables of the
/// same name.
fn environment(overrides: &[(&str, OsString)]) -> Result<Vec<CString>> {
    let mut vars: Vec<(OsString, OsString)> = std::env::vars_os()
        .filter(|(key, _)| !overrides.iter().any(|(name, _)| key == name))
        .collect();
    vars.extend(
        overrides
            .iter()
            .map(|(name, value)| (OsString::from(name), value.clone())),
    );

    vars.into_iter()
        .map(|(key, value)| {
            let mut entry = key.into_vec();
            entry.push(b'=');
            entry.extend(value.into_vec());
            CString::new(entry).context("Environment variable contains a NUL byte")
        })
        .collect()
}

/// The kernel takes one mapping per line; the command line separates them
/// with commas.
fn kernel_map(map: &str) -> String {
    map.split(',').collect::<Vec<_>>().join("\n")
}

/// Reaps children until none are left. Returns the exit status of `target`.
fn reap_all(target: Pid) -> i32 {
    let mut status = 0;
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(WaitStatus::Exited(pid, code)) if pid == target => status = code,
            Ok(WaitStatus::Signaled(pid, signal, _)) if pid == target => {
                status = 128 + signal as i32;
            }
            Ok(_) | Err(Errno::EINTR) => {}
            Err(_) => return status,
        }
    }
}

extern "C" fn forward_signal(signal: libc::c_int) {
    let pid = FORWARD_TO.load(Ordering::Relaxed);
    if pid > 0 {
        // SAFETY: kill(2) is async-signal-safe.
        unsafe { libc::kill(pid, signal) };
    }
}

fn install_forwarding(pid: Pid) -> Result<()> {
    FORWARD_TO.store(pid.as_raw(), Ordering::Relaxed);

    let action = SigAction::new(
        SigHandler::Handler(forward_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in FORWARDED_SIGNALS {
        // SAFETY: the handler only reads an atomic and calls kill(2).
        unsafe { sigaction(signal, &action) }
            .with_context(|| format!("Failed to forward {signal:?}"))?;
    }
    Ok(())
}

#[derive(Debug)]
pub struct JailHandle {
    /// PID of the child process
    pid: Pid,

    // Track if the process has been waited on
    waited: Cell<bool>,
}

impl JailHandle {
    #[inline]
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            waited: Cell::new(false),
        }
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Waits for the child, relaying signals to it when asked to. Death by
    /// signal is reported as 128 plus the signal number.
    pub fn wait(&self, forward_signals: bool) -> Result<i32> {
        if forward_signals {
            install_forwarding(self.pid)?;
        }

        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    self.waited.set(true);
                    return Ok(code);
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    self.waited.set(true);
                    return Ok(128 + signal as i32);
                }
                Ok(_) | Err(Errno::EINTR) => {}
                Err(errno) => {
                    return Err(errno)
                        .with_context(|| format!("Failed to wait for process {}", self.pid));
                }
            }
        }
    }

    /// Kills and reaps a child whose launch is being abandoned.
    pub fn terminate(&self) {
        if self.waited.get() {
            return;
        }

        if let Err(errno) = kill(self.pid, SIGKILL) {
            warn!(pid = %self.pid, "Failed to kill abandoned child: {errno}");
        }
        let _ = waitpid(self.pid, None);
        self.waited.set(true);
    }
}

impl Drop for JailHandle {
    fn drop(&mut self) {
        if !self.waited.get() {
            debug!(pid = %self.pid, "leaving sandboxed process running");
        }
    }
}
