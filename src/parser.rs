use crate::{
    capabilities::Capability,
    config::Config,
    elf::{BinaryClassifier, Linkage},
    error::{Result, SandboxError},
    identity::SystemIdentity,
    idmap::build_idmap,
    spec::{
        CapabilityPolicy, DEFAULT_TMPFS_SIZE, ElfType, FilesystemExtras, IdMapRequest, Identity,
        Lifecycle, Namespaces, RootChange, SandboxSpec, SeccompMode, SeccompPolicy,
        SupplementaryGroups,
    },
};
use clap::{ArgMatches, CommandFactory, FromArgMatches, error::ErrorKind};
use nix::unistd::{AccessFlags, Gid, Uid, access};
use std::{ffi::OsString, path::Path};
use tracing::debug;

/// A validated sandbox request and the program it should run.
#[derive(Debug)]
pub struct ParsedArgs {
    pub spec: SandboxSpec,
    /// The program followed by its own arguments.
    pub command: Vec<String>,
    /// Position of the program within the original argument vector.
    pub program_index: usize,
}

impl ParsedArgs {
    pub fn program(&self) -> &Path {
        Path::new(&self.command[0])
    }
}

/// Turns the command line into a validated [`SandboxSpec`].
///
/// Checks run in a fixed order so that the same command line always fails
/// with the same message: conflicting options as they are scanned, then id
/// maps, ambient capabilities, bind mounts, `-K`, ELF classification and
/// finally the static-binary capability check.
pub fn parse_args<I, T>(
    args: I,
    identity: &dyn SystemIdentity,
    classifier: &dyn BinaryClassifier,
) -> Result<ParsedArgs>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    let matches = Config::command().try_get_matches_from(args.iter())?;
    let config = Config::from_arg_matches(&matches)?;

    let Some(program) = config.command.first() else {
        return Err(Config::command()
            .error(ErrorKind::MissingRequiredArgument, "no program specified")
            .into());
    };
    let program = Path::new(program).to_path_buf();

    let mut spec = build_spec(&config, &matches, identity)?;
    validate(&mut spec, identity)?;
    classify(&mut spec, &program, classifier)?;
    check_static_capabilities(&spec)?;

    let program_index = args.len() - config.command.len();
    debug!(program = %program.display(), program_index, "parsed sandbox request");

    Ok(ParsedArgs {
        spec,
        command: config.command,
        program_index,
    })
}

fn build_spec(
    config: &Config,
    matches: &ArgMatches,
    identity: &dyn SystemIdentity,
) -> Result<SandboxSpec> {
    check_conflicts(config, matches)?;

    let ns = &config.namespace;
    let fs = &config.filesystem;
    let security = &config.security;
    let process = &config.process;

    let root = match (&fs.chroot, &fs.pivot_root) {
        (Some(dir), _) => Some(RootChange::Chroot(dir.clone())),
        (None, Some(dir)) => Some(RootChange::PivotRoot(dir.clone())),
        (None, None) => None,
    };

    let mode = match &security.seccomp_filter {
        Some(path) => SeccompMode::Filter(path.clone()),
        None if security.seccomp_strict => SeccompMode::Strict,
        None => SeccompMode::None,
    };

    Ok(SandboxSpec {
        namespaces: Namespaces {
            mount: ns.mount_ns,
            enter_mount: ns.enter_mount_ns.clone(),
            pid: ns.pid_ns || ns.user_ns || process.run_as_init,
            net: matches!(ns.net_ns, Some(None)),
            enter_net: ns.net_ns.clone().flatten(),
            user: ns.user_ns,
            ipc: ns.ipc_ns,
            uts: ns.uts.is_some(),
            hostname: ns.uts.clone().flatten(),
            cgroup: ns.cgroup_ns,
        },
        root,
        capabilities: CapabilityPolicy {
            mask: security.caps,
            ambient: security.ambient,
            securebits_skip: security.skip_securebits.unwrap_or(0),
        },
        binds: fs.binds.clone(),
        mounts: fs.mounts.clone(),
        filesystem: FilesystemExtras {
            tmpfs_size: fs.tmpfs.map(|size| size.unwrap_or(DEFAULT_TMPFS_SIZE)),
            mount_dev: fs.mount_dev,
            remount_proc_readonly: fs.remount_proc_readonly,
        },
        rlimits: process.rlimits.clone(),
        identity: resolve_identity(config, matches, identity)?,
        uid_map: config.user.uid_map.clone().map(IdMapRequest::from),
        gid_map: config.user.gid_map.clone().map(IdMapRequest::from),
        id_maps: Default::default(),
        seccomp: SeccompPolicy {
            mode,
            log_failures: security.log_seccomp,
            tsync: security.seccomp_tsync,
        },
        lifecycle: Lifecycle {
            exit_immediately: process.exit_immediately,
            run_as_init: process.run_as_init,
            forward_signals: !process.no_forward_signals,
            skip_remount_private: fs.skip_remount_private,
            new_session_keyring: process.session_keyring,
            no_new_privs: security.no_new_privs,
        },
        pid_file: process.pid_file.clone(),
        elf_type: security.elf_type.unwrap_or_default(),
        log_target: config.logging.target,
        preload: security.preload.clone(),
    })
}

/// Mutually exclusive option pairs: clap id and the flag shown to the user.
const EXCLUSIVE: [[(&str, &str); 2]; 3] = [
    [("chroot", "-C"), ("pivot_root", "-P")],
    [("seccomp_strict", "-s"), ("seccomp_filter", "-S")],
    [("inherit_groups", "-G"), ("keep_groups", "-y")],
];

/// Reports the conflict a left-to-right scan would hit first, naming the
/// options in the order they were given.
fn check_conflicts(config: &Config, matches: &ArgMatches) -> Result<()> {
    let present = [
        [config.filesystem.chroot.is_some(), config.filesystem.pivot_root.is_some()],
        [
            config.security.seccomp_strict,
            config.security.seccomp_filter.is_some(),
        ],
        [config.user.inherit_groups, config.user.keep_groups],
    ];
    let position = |id: &str| matches.index_of(id).unwrap_or(usize::MAX);

    let conflict = EXCLUSIVE
        .iter()
        .zip(present)
        .filter(|(_, present)| present.iter().all(|given| *given))
        .map(|([a, b], _)| {
            if position(a.0) <= position(b.0) {
                (position(b.0), a.1, b.1)
            } else {
                (position(a.0), b.1, a.1)
            }
        })
        .min_by_key(|(detected_at, _, _)| *detected_at);

    match conflict {
        Some((_, first, second)) => Err(SandboxError::Conflict { first, second }),
        None => Ok(()),
    }
}

fn resolve_identity(
    config: &Config,
    matches: &ArgMatches,
    identity: &dyn SystemIdentity,
) -> Result<Identity> {
    let mut resolved = Identity {
        supplementary: match (config.user.inherit_groups, config.user.keep_groups) {
            (true, _) => SupplementaryGroups::Inherit,
            (false, true) => SupplementaryGroups::Keep,
            (false, false) => SupplementaryGroups::Default,
        },
        ..Identity::default()
    };

    if let Some(user) = &config.user.user {
        if is_numeric(user) {
            let uid = user.parse().map_err(|_| SandboxError::BadUser(user.clone()))?;
            resolved.uid = Some(Uid::from_raw(uid));
        } else {
            let (uid, gid) = identity
                .resolve_user(user)
                .ok()
                .flatten()
                .ok_or_else(|| SandboxError::BadUser(user.clone()))?;
            resolved.uid = Some(uid);
            resolved.user = Some((user.clone(), gid));
        }
    }

    if let Some(group) = &config.user.group {
        if is_numeric(group) {
            let gid = group.parse().map_err(|_| SandboxError::BadGroup(group.clone()))?;
            resolved.gid = Some(Gid::from_raw(gid));
        } else {
            let gid = identity
                .resolve_group(group)
                .ok()
                .flatten()
                .ok_or_else(|| SandboxError::BadGroup(group.clone()))?;
            resolved.gid = Some(gid);
            resolved.group = Some(group.clone());
        }
    }

    // A named user resets the gid to its primary group, so whichever of -u
    // and -g came last decides the gid a synthesized map targets.
    if resolved.user.is_some() && resolved.gid.is_some() {
        resolved.user_group_last = matches.index_of("user") > matches.index_of("group");
    }

    Ok(resolved)
}

/// Whether `arg` is an id given entirely in decimal digits. Such ids are
/// never looked up as names, even when they overflow.
fn is_numeric(arg: &str) -> bool {
    !arg.is_empty() && arg.bytes().all(|byte| byte.is_ascii_digit())
}

/// Derives the id maps and enforces the cross-option rules on a spec.
pub fn validate(spec: &mut SandboxSpec, identity: &dyn SystemIdentity) -> Result<()> {
    derive_id_maps(spec, identity)?;

    if spec.capabilities.ambient && spec.capabilities.mask.is_none() {
        return Err(SandboxError::AmbientWithoutCapabilities);
    }

    if !spec.binds.is_empty() && spec.root.is_none() && !spec.namespaces.mount {
        return Err(SandboxError::BindWithoutMountNamespace);
    }

    if spec.lifecycle.skip_remount_private && !spec.namespaces.mount {
        return Err(SandboxError::SkipRemountWithoutMountNamespace);
    }

    Ok(())
}

fn derive_id_maps(spec: &mut SandboxSpec, identity: &dyn SystemIdentity) -> Result<()> {
    let (caller_uid, caller_gid) = identity.caller_ids();

    if let Some(request) = &spec.uid_map {
        spec.namespaces.user = true;
        spec.namespaces.pid = true;
        spec.id_maps.uid_map = Some(match request {
            IdMapRequest::Explicit(map) => map.clone(),
            IdMapRequest::Synthesize => {
                build_idmap(spec.identity.mapped_uid().as_raw(), caller_uid.as_raw())?
            }
        });
    }

    if let Some(request) = &spec.gid_map {
        spec.namespaces.user = true;
        spec.namespaces.pid = true;
        spec.id_maps.gid_map = Some(match request {
            IdMapRequest::Explicit(map) => map.clone(),
            IdMapRequest::Synthesize => {
                build_idmap(spec.identity.mapped_gid().as_raw(), caller_gid.as_raw())?
            }
        });

        // Without CAP_SETGID the kernel only accepts a gid map once
        // setgroups(2) is denied for the namespace.
        let can_setgid = identity
            .has_effective_capability(Capability::CAP_SETGID)
            .map_err(SandboxError::Identity)?;
        if !can_setgid {
            spec.id_maps.disable_setgroups = true;
        }
    }

    Ok(())
}

/// Fills in the ELF type of `program` unless it was given with `-T`.
pub fn classify(
    spec: &mut SandboxSpec,
    program: &Path,
    classifier: &dyn BinaryClassifier,
) -> Result<()> {
    if spec.elf_type != ElfType::Unknown {
        return Ok(());
    }

    let host_path = spec.host_path(program);
    if access(&host_path, AccessFlags::X_OK).is_err() {
        return Err(SandboxError::ProgramNotAccessible(program.to_path_buf()));
    }

    let linkage = classifier.classify(&host_path).map_err(|error| {
        debug!(path = %host_path.display(), "classification failed: {error:#}");
        SandboxError::InvalidElf(program.to_path_buf())
    })?;

    spec.elf_type = match linkage {
        Linkage::Static => ElfType::Static,
        Linkage::Dynamic => ElfType::Dynamic,
    };
    Ok(())
}

/// Capabilities only reach a static binary through the ambient set.
pub fn check_static_capabilities(spec: &SandboxSpec) -> Result<()> {
    if spec.elf_type == ElfType::Static
        && spec.capabilities.mask.is_some()
        && !spec.capabilities.ambient
    {
        return Err(SandboxError::StaticWithoutAmbient);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeClassifier, FakeIdentity};
    use std::path::PathBuf;

    fn test_binary() -> String {
        std::env::current_exe()
            .expect("current exe")
            .to_string_lossy()
            .into_owned()
    }

    fn parse(args: &[&str]) -> Result<ParsedArgs> {
        parse_with(args, &FakeIdentity::default(), &FakeClassifier::returning(Linkage::Dynamic))
    }

    fn parse_with(
        args: &[&str],
        identity: &FakeIdentity,
        classifier: &FakeClassifier,
    ) -> Result<ParsedArgs> {
        let program = test_binary();
        let mut argv = vec!["warden"];
        argv.extend_from_slice(args);
        argv.push(&program);
        parse_args(argv, identity, classifier)
    }

    fn conflict(result: Result<ParsedArgs>) -> (&'static str, &'static str) {
        match result {
            Err(SandboxError::Conflict { first, second }) => (first, second),
            other => panic!("expected a conflict, got {other:?}"),
        }
    }

    #[test]
    fn chroot_and_pivot_root_conflict_in_either_order() {
        assert_eq!(conflict(parse(&["-C", "/a", "-P", "/b"])), ("-C", "-P"));
        assert_eq!(conflict(parse(&["-P", "/b", "-C", "/a"])), ("-P", "-C"));
    }

    #[test]
    fn seccomp_modes_conflict_in_either_order() {
        assert_eq!(conflict(parse(&["-s", "-S", "/policy"])), ("-s", "-S"));
        assert_eq!(conflict(parse(&["-S", "/policy", "-s"])), ("-S", "-s"));
    }

    #[test]
    fn group_policies_conflict_in_either_order() {
        assert_eq!(conflict(parse(&["-G", "-y"])), ("-G", "-y"));
        assert_eq!(conflict(parse(&["-y", "-G"])), ("-y", "-G"));
    }

    #[test]
    fn earliest_conflict_wins() {
        assert_eq!(
            conflict(parse(&["-y", "-G", "-C", "/a", "-P", "/b"])),
            ("-y", "-G")
        );
    }

    #[test]
    fn malformed_values_are_reported_before_conflicts() {
        assert!(matches!(
            parse(&["-C", "/a", "-P", "/b", "-c", "zz"]),
            Err(SandboxError::Usage(_))
        ));
    }

    #[test]
    fn bind_needs_a_mount_namespace_or_root_change() -> Result<()> {
        assert!(matches!(
            parse(&["-b", "/src,/dst"]),
            Err(SandboxError::BindWithoutMountNamespace)
        ));

        let parsed = parse(&["-b", "/src,/dst,1", "-v"])?;
        assert_eq!(parsed.spec.binds.len(), 1);
        assert!(parsed.spec.binds[0].writable);
        assert!(parsed.spec.namespaces.mount);
        Ok(())
    }

    #[test]
    fn implied_mount_namespaces_do_not_satisfy_bind_checks() {
        // -p implies a mount namespace for the engine, but bind checks only
        // count an explicit -v.
        assert!(matches!(
            parse(&["-p", "-b", "/src,/dst"]),
            Err(SandboxError::BindWithoutMountNamespace)
        ));
    }

    #[test]
    fn skip_remount_private_needs_mount_namespace() -> Result<()> {
        assert!(matches!(
            parse(&["-K"]),
            Err(SandboxError::SkipRemountWithoutMountNamespace)
        ));
        assert!(parse(&["-K", "-v"])?.spec.lifecycle.skip_remount_private);
        Ok(())
    }

    #[test]
    fn ambient_needs_capabilities() {
        assert!(matches!(
            parse(&["--ambient"]),
            Err(SandboxError::AmbientWithoutCapabilities)
        ));
    }

    #[test]
    fn numeric_ids_are_not_looked_up() -> Result<()> {
        let identity = FakeIdentity::default();
        let classifier = FakeClassifier::returning(Linkage::Dynamic);
        let parsed = parse_with(&["-u", "1000", "-g", "1000"], &identity, &classifier)?;

        assert_eq!(parsed.spec.identity.uid, Some(Uid::from_raw(1000)));
        assert_eq!(parsed.spec.identity.gid, Some(Gid::from_raw(1000)));
        assert!(identity.lookups.borrow().is_empty());
        Ok(())
    }

    #[test]
    fn overflowing_numeric_ids_are_rejected_without_lookup() {
        let identity = FakeIdentity::default();
        let classifier = FakeClassifier::returning(Linkage::Dynamic);

        assert!(matches!(
            parse_with(&["-u", "99999999999"], &identity, &classifier),
            Err(SandboxError::BadUser(user)) if user == "99999999999"
        ));
        assert!(matches!(
            parse_with(&["-g", "4294967296"], &identity, &classifier),
            Err(SandboxError::BadGroup(group)) if group == "4294967296"
        ));
        assert!(identity.lookups.borrow().is_empty());
    }

    #[test]
    fn last_of_user_and_group_picks_the_mapped_gid() -> Result<()> {
        let user_last = parse(&["-g", "5", "-u", "alice", "-M"])?;
        assert_eq!(user_last.spec.id_maps.gid_map.as_deref(), Some("100 1000 1"));

        let group_last = parse(&["-u", "alice", "-g", "5", "-M"])?;
        assert_eq!(group_last.spec.id_maps.gid_map.as_deref(), Some("5 1000 1"));
        Ok(())
    }

    #[test]
    fn names_are_resolved() -> Result<()> {
        let parsed = parse(&["-u", "alice", "-g", "staff"])?;
        let identity = &parsed.spec.identity;

        assert_eq!(identity.uid, Some(Uid::from_raw(1001)));
        assert_eq!(identity.user, Some(("alice".to_string(), Gid::from_raw(100))));
        assert_eq!(identity.gid, Some(Gid::from_raw(50)));
        assert_eq!(identity.group.as_deref(), Some("staff"));
        Ok(())
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert!(matches!(parse(&["-u", "mallory"]), Err(SandboxError::BadUser(user)) if user == "mallory"));
        assert!(matches!(parse(&["-g", "wheel"]), Err(SandboxError::BadGroup(group)) if group == "wheel"));
    }

    #[test]
    fn synthesized_maps_target_the_caller() -> Result<()> {
        let parsed = parse(&["-u", "0", "-m", "-M"])?;
        let maps = &parsed.spec.id_maps;

        assert_eq!(maps.uid_map.as_deref(), Some("0 1000 1"));
        assert_eq!(maps.gid_map.as_deref(), Some("0 1000 1"));
        assert!(parsed.spec.namespaces.user);
        assert!(parsed.spec.namespaces.pid);
        Ok(())
    }

    #[test]
    fn gid_map_without_setgid_disables_setgroups() -> Result<()> {
        let parsed = parse(&["-M"])?;
        assert!(parsed.spec.id_maps.disable_setgroups);

        let identity = FakeIdentity {
            cap_setgid: true,
            ..FakeIdentity::default()
        };
        let parsed = parse_with(&["-M"], &identity, &FakeClassifier::returning(Linkage::Dynamic))?;
        assert!(!parsed.spec.id_maps.disable_setgroups);
        Ok(())
    }

    #[test]
    fn uid_map_alone_leaves_setgroups_alone() -> Result<()> {
        let parsed = parse(&["-m=0 0 1"])?;
        assert_eq!(parsed.spec.id_maps.uid_map.as_deref(), Some("0 0 1"));
        assert_eq!(parsed.spec.id_maps.gid_map, None);
        assert!(!parsed.spec.id_maps.disable_setgroups);
        Ok(())
    }

    #[test]
    fn last_map_option_wins() -> Result<()> {
        let parsed = parse(&["-m=0 0 1", "-m"])?;
        assert_eq!(parsed.spec.uid_map, Some(IdMapRequest::Synthesize));
        assert_eq!(parsed.spec.id_maps.uid_map.as_deref(), Some("0 1000 1"));
        Ok(())
    }

    #[test]
    fn static_binaries_need_ambient_capabilities() -> Result<()> {
        let identity = FakeIdentity::default();
        let classifier = FakeClassifier::returning(Linkage::Static);

        assert!(matches!(
            parse_with(&["-c", "3"], &identity, &classifier),
            Err(SandboxError::StaticWithoutAmbient)
        ));

        let parsed = parse_with(&["-c", "3", "--ambient"], &identity, &classifier)?;
        assert_eq!(parsed.spec.elf_type, ElfType::Static);
        assert_eq!(parsed.spec.capabilities.mask, Some(3));
        Ok(())
    }

    #[test]
    fn explicit_elf_type_skips_classification() {
        let identity = FakeIdentity::default();
        let classifier = FakeClassifier::returning(Linkage::Dynamic);
        let result = parse_args(
            ["warden", "-c", "3", "-T", "static", "/no/such/program"],
            &identity,
            &classifier,
        );

        assert!(matches!(result, Err(SandboxError::StaticWithoutAmbient)));
        assert!(classifier.calls.borrow().is_empty());
    }

    #[test]
    fn classification_uses_the_host_path() -> Result<()> {
        let program = PathBuf::from(test_binary());
        let directory = program.parent().expect("test binary directory");
        let name = program.file_name().expect("test binary name");
        let inside = Path::new("/sandbox").join(name);

        let identity = FakeIdentity::default();
        let classifier = FakeClassifier::returning(Linkage::Dynamic);
        let bind = format!("{},/sandbox", directory.display());
        let parsed = parse_args(
            [
                "warden",
                "-b",
                bind.as_str(),
                "-v",
                inside.to_str().expect("utf-8 path"),
                "--flag",
            ],
            &identity,
            &classifier,
        )?;

        assert_eq!(*classifier.calls.borrow(), [program]);
        assert_eq!(parsed.spec.elf_type, ElfType::Dynamic);
        assert_eq!(parsed.program(), inside);
        assert_eq!(parsed.program_index, 4);
        assert_eq!(parsed.command[1], "--flag");
        Ok(())
    }

    #[test]
    fn classifies_the_real_binary() -> Result<()> {
        let program = test_binary();
        let parsed = parse_args(
            ["warden", "-b", "/src,/dst,1", "-v", program.as_str()],
            &FakeIdentity::default(),
            &crate::elf::ElfClassifier,
        )?;
        assert_ne!(parsed.spec.elf_type, ElfType::Unknown);
        Ok(())
    }

    #[test]
    fn missing_or_unreadable_programs_are_reported() {
        let result = parse_args(
            ["warden", "/no/such/program"],
            &FakeIdentity::default(),
            &FakeClassifier::returning(Linkage::Dynamic),
        );
        assert!(matches!(result, Err(SandboxError::ProgramNotAccessible(_))));

        let result = parse_with(&[], &FakeIdentity::default(), &FakeClassifier::failing());
        assert!(matches!(result, Err(SandboxError::InvalidElf(_))));
    }

    #[test]
    fn namespace_options_are_recorded() -> Result<()> {
        let parsed = parse(&["-e", "-l", "-N", "--uts=sandbox", "-I"])?;
        let ns = &parsed.spec.namespaces;

        assert!(ns.net && ns.enter_net.is_none());
        assert!(ns.ipc && ns.cgroup && ns.uts);
        assert_eq!(ns.hostname.as_deref(), Some("sandbox"));
        assert!(ns.pid);
        assert!(parsed.spec.lifecycle.run_as_init);
        Ok(())
    }

    #[test]
    fn entering_an_existing_net_namespace_is_not_a_new_one() -> Result<()> {
        let parsed = parse(&["-e=/run/netns/box"])?;
        assert!(!parsed.spec.namespaces.net);
        assert_eq!(
            parsed.spec.namespaces.enter_net.as_deref(),
            Some(Path::new("/run/netns/box"))
        );
        Ok(())
    }

    #[test]
    fn user_namespace_implies_pid_namespace() -> Result<()> {
        let parsed = parse(&["-U"])?;
        assert!(parsed.spec.namespaces.user && parsed.spec.namespaces.pid);
        Ok(())
    }

    #[test]
    fn defaults_are_filled_in() -> Result<()> {
        let parsed = parse(&["-t", "-z"])?;
        assert_eq!(parsed.spec.filesystem.tmpfs_size, Some(DEFAULT_TMPFS_SIZE));
        assert!(!parsed.spec.lifecycle.forward_signals);
        assert_eq!(parsed.program_index, 3);

        let parsed = parse(&["-t=1M"])?;
        assert_eq!(parsed.spec.filesystem.tmpfs_size, Some(1 << 20));
        Ok(())
    }

    #[test]
    fn malformed_values_are_usage_errors() {
        for args in [&["-b", "/only"][..], &["-c", "3,0"], &["-R", "1,2"], &["-T", "elf"]] {
            assert!(
                matches!(parse(args), Err(SandboxError::Usage(_))),
                "{args:?} should be rejected"
            );
        }
    }

    #[test]
    fn help_is_not_a_failure() {
        let error = parse_args(
            ["warden", "--help"],
            &FakeIdentity::default(),
            &FakeClassifier::failing(),
        )
        .expect_err("help short-circuits parsing");
        assert_eq!(error.exit_code(), 0);
    }
}
