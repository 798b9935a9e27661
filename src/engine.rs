use crate::{
    error::{Result, SandboxError},
    spec::{
        BindMount, IdMaps, Identity, LogTarget, MountSpec, Namespaces, RootChange, Rlimit,
        SandboxSpec, SeccompMode,
    },
};
use nix::unistd::Pid;
use std::{
    os::fd::{AsRawFd, RawFd},
    path::Path,
};
use tracing::debug;

/// The mechanism that actually builds the sandbox and runs the program.
///
/// Configuration calls may arrive in any order and only record intent;
/// nothing touches the system until one of the launch methods runs.
pub trait SandboxEngine {
    fn namespaces(&mut self, namespaces: &Namespaces) -> anyhow::Result<()>;
    fn skip_remount_private(&mut self) -> anyhow::Result<()>;
    fn enter_root(&mut self, root: &RootChange) -> anyhow::Result<()>;
    fn bind(&mut self, bind: &BindMount) -> anyhow::Result<()>;
    fn mount(&mut self, mount: &MountSpec) -> anyhow::Result<()>;
    fn mount_tmp(&mut self, size: u64) -> anyhow::Result<()>;
    fn mount_dev(&mut self) -> anyhow::Result<()>;
    fn remount_proc_readonly(&mut self) -> anyhow::Result<()>;
    fn use_capabilities(&mut self, mask: u64, ambient: bool) -> anyhow::Result<()>;
    fn skip_securebits(&mut self, mask: u64) -> anyhow::Result<()>;
    fn rlimit(&mut self, rlimit: &Rlimit) -> anyhow::Result<()>;
    fn change_identity(&mut self, identity: &Identity) -> anyhow::Result<()>;
    fn id_maps(&mut self, maps: &IdMaps) -> anyhow::Result<()>;
    fn no_new_privs(&mut self) -> anyhow::Result<()>;
    fn log_seccomp_failures(&mut self) -> anyhow::Result<()>;
    fn seccomp_tsync(&mut self) -> anyhow::Result<()>;
    /// Takes effect with whatever logging and tsync settings were recorded
    /// before it.
    fn seccomp(&mut self, mode: &SeccompMode) -> anyhow::Result<()>;
    fn pid_file(&mut self, path: &Path) -> anyhow::Result<()>;
    fn forward_signals(&mut self) -> anyhow::Result<()>;
    fn run_as_init(&mut self) -> anyhow::Result<()>;
    fn new_session_keyring(&mut self) -> anyhow::Result<()>;
    /// Makes `parent` available as `child` in the sandboxed process.
    fn preserve_fd(&mut self, parent: RawFd, child: RawFd) -> anyhow::Result<()>;

    /// Launches a dynamically linked program with `preload` injected.
    fn launch_with_injection(
        &mut self,
        program: &Path,
        argv: &[String],
        preload: &Path,
    ) -> anyhow::Result<Pid>;

    /// Launches a program whose restrictions must all be in place before
    /// `execve(2)`.
    fn launch_without_injection(&mut self, program: &Path, argv: &[String])
    -> anyhow::Result<Pid>;

    /// Blocks until the launched process exits and returns its status.
    fn wait(&mut self) -> anyhow::Result<i32>;
}

/// Hands every restriction in `spec` to `engine`.
pub fn apply(spec: &SandboxSpec, engine: &mut dyn SandboxEngine) -> Result<()> {
    let step = SandboxError::engine;

    let mut namespaces = spec.namespaces.clone();
    namespaces.mount = spec.needs_mount_namespace();
    engine
        .namespaces(&namespaces)
        .map_err(step("Could not configure namespaces"))?;

    if spec.lifecycle.skip_remount_private {
        engine
            .skip_remount_private()
            .map_err(step("Could not skip remounting mounts private"))?;
    }

    if let Some(root) = &spec.root {
        let action = match root {
            RootChange::Chroot(_) => "Could not set chroot",
            RootChange::PivotRoot(_) => "Could not set pivot_root",
        };
        engine.enter_root(root).map_err(step(action))?;
    }

    for bind in &spec.binds {
        engine.bind(bind).map_err(step("Could not add bind mount"))?;
    }
    for mount in &spec.mounts {
        engine.mount(mount).map_err(step("Could not add mount"))?;
    }

    let filesystem = &spec.filesystem;
    if let Some(size) = filesystem.tmpfs_size {
        engine.mount_tmp(size).map_err(step("Could not mount /tmp"))?;
    }
    if filesystem.mount_dev {
        engine.mount_dev().map_err(step("Could not mount /dev"))?;
    }
    if filesystem.remount_proc_readonly {
        engine
            .remount_proc_readonly()
            .map_err(step("Could not remount /proc read-only"))?;
    }

    let capabilities = spec.capabilities;
    if let Some(mask) = capabilities.mask {
        engine
            .use_capabilities(mask, capabilities.ambient)
            .map_err(step("Could not restrict capabilities"))?;
    }
    if capabilities.securebits_skip != 0 {
        engine
            .skip_securebits(capabilities.securebits_skip)
            .map_err(step("Could not skip securebits"))?;
    }

    for rlimit in &spec.rlimits {
        engine.rlimit(rlimit).map_err(step("Could not set rlimit"))?;
    }

    let identity = &spec.identity;
    if *identity != Identity::default() {
        engine
            .change_identity(identity)
            .map_err(step("Could not change user or group"))?;
    }

    if spec.id_maps.uid_map.is_some() || spec.id_maps.gid_map.is_some() {
        engine
            .id_maps(&spec.id_maps)
            .map_err(step("Could not set id maps"))?;
    }

    if spec.lifecycle.no_new_privs {
        engine
            .no_new_privs()
            .map_err(step("Could not set no_new_privs"))?;
    }

    let seccomp = &spec.seccomp;
    if seccomp.log_failures {
        engine
            .log_seccomp_failures()
            .map_err(step("Could not log seccomp failures"))?;
    }
    if seccomp.tsync {
        engine
            .seccomp_tsync()
            .map_err(step("Could not synchronize seccomp filters"))?;
    }
    if seccomp.mode != SeccompMode::None {
        engine
            .seccomp(&seccomp.mode)
            .map_err(step("Could not use seccomp filter"))?;
    }

    if let Some(path) = &spec.pid_file {
        engine
            .pid_file(path)
            .map_err(step("Could not write pid file"))?;
    }

    let lifecycle = spec.lifecycle;
    if lifecycle.forward_signals && !lifecycle.exit_immediately {
        engine
            .forward_signals()
            .map_err(step("Could not forward signals"))?;
    }
    if lifecycle.run_as_init {
        engine
            .run_as_init()
            .map_err(step("Could not run program as init"))?;
    }
    if lifecycle.new_session_keyring {
        engine
            .new_session_keyring()
            .map_err(step("Could not create session keyring"))?;
    }

    if spec.log_target == LogTarget::Stderr {
        let stderr = std::io::stderr().as_raw_fd();
        engine
            .preserve_fd(stderr, stderr)
            .map_err(step("Could not preserve stderr"))?;
    }

    debug!("sandbox configured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{CapabilityPolicy, FilesystemExtras, SeccompPolicy};
    use crate::testing::RecordingEngine;

    #[test]
    fn empty_spec_only_sets_namespaces_and_signals() -> Result<()> {
        let mut engine = RecordingEngine::default();
        apply(&SandboxSpec::default(), &mut engine)?;
        assert_eq!(engine.calls, ["namespaces", "forward_signals"]);
        Ok(())
    }

    #[test]
    fn implied_mount_namespace_reaches_the_engine() -> Result<()> {
        let spec = SandboxSpec {
            filesystem: FilesystemExtras {
                tmpfs_size: Some(1 << 20),
                ..FilesystemExtras::default()
            },
            ..SandboxSpec::default()
        };
        let mut engine = RecordingEngine::default();
        apply(&spec, &mut engine)?;

        assert!(engine.namespaces.as_ref().is_some_and(|ns| ns.mount));
        assert!(engine.calls.contains(&"mount_tmp"));
        Ok(())
    }

    #[test]
    fn seccomp_settings_precede_the_filter() -> Result<()> {
        let spec = SandboxSpec {
            seccomp: SeccompPolicy {
                mode: SeccompMode::Filter("/etc/policy.json".into()),
                log_failures: true,
                tsync: true,
            },
            ..SandboxSpec::default()
        };
        let mut engine = RecordingEngine::default();
        apply(&spec, &mut engine)?;

        let position = |call| engine.calls.iter().position(|c| *c == call);
        assert!(position("log_seccomp_failures") < position("seccomp"));
        assert!(position("seccomp_tsync") < position("seccomp"));
        Ok(())
    }

    #[test]
    fn stderr_logging_keeps_stderr_open() -> Result<()> {
        let spec = SandboxSpec {
            log_target: LogTarget::Stderr,
            ..SandboxSpec::default()
        };
        let mut engine = RecordingEngine::default();
        apply(&spec, &mut engine)?;
        assert_eq!(engine.preserved, [(2, 2)]);
        Ok(())
    }

    #[test]
    fn exit_immediately_does_not_forward_signals() -> Result<()> {
        let mut spec = SandboxSpec::default();
        spec.lifecycle.exit_immediately = true;
        let mut engine = RecordingEngine::default();
        apply(&spec, &mut engine)?;
        assert!(!engine.calls.contains(&"forward_signals"));
        Ok(())
    }

    #[test]
    fn engine_refusals_name_the_step() {
        let spec = SandboxSpec {
            capabilities: CapabilityPolicy {
                mask: Some(0x3),
                ..CapabilityPolicy::default()
            },
            ..SandboxSpec::default()
        };
        let mut engine = RecordingEngine {
            fail_on: Some("use_capabilities"),
            ..RecordingEngine::default()
        };

        let error = apply(&spec, &mut engine).expect_err("engine refused");
        assert!(
            error
                .to_string()
                .starts_with("Could not restrict capabilities: use_capabilities refused")
        );
    }
}
