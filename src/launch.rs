use crate::{
    engine::SandboxEngine,
    error::{Result, SandboxError},
    parser::ParsedArgs,
    spec::ElfType,
};
use nix::{
    errno::Errno,
    unistd::{Pid, setpgid},
};
use std::{
    ffi::{CStr, CString},
    os::unix::ffi::OsStrExt,
    path::Path,
};
use tracing::{debug, info};

/// Starts the program the way its linkage allows and, unless asked to exit
/// immediately, waits for it. Returns the status `main` should exit with.
pub fn launch(parsed: &ParsedArgs, engine: &mut dyn SandboxEngine) -> Result<i32> {
    // Put the sandbox and this process in one group so both can be killed
    // together. EPERM only means we already lead a group.
    match setpgid(Pid::from_raw(0), Pid::from_raw(0)) {
        Ok(()) | Err(Errno::EPERM) => {}
        Err(errno) => return Err(SandboxError::ProcessGroup(errno)),
    }

    let spec = &parsed.spec;
    let program = parsed.program();
    let argv = &parsed.command;

    let pid = match spec.elf_type {
        ElfType::Static => engine
            .launch_without_injection(program, argv)
            .map_err(SandboxError::engine("Could not launch program"))?,
        ElfType::Dynamic => {
            probe_preload(&spec.preload)?;
            engine
                .launch_with_injection(program, argv, &spec.preload)
                .map_err(SandboxError::engine("Could not launch program"))?
        }
        ElfType::Unknown => return Err(SandboxError::InvalidElf(program.to_path_buf())),
    };
    debug!(%pid, program = %program.display(), "launched");

    if spec.lifecycle.exit_immediately {
        info!("not running init loop, exiting immediately");
        return Ok(0);
    }

    engine
        .wait()
        .map_err(SandboxError::engine("Could not wait for program"))
}

/// Checks that the injection library can be loaded at all.
fn probe_preload(path: &Path) -> Result<()> {
    let path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| SandboxError::PreloadUnavailable(format!("{}: invalid path", path.display())))?;

    // SAFETY: `path` is NUL-terminated; the handle is only closed again.
    let handle = unsafe { libc::dlopen(path.as_ptr(), libc::RTLD_LAZY | libc::RTLD_LOCAL) };
    if handle.is_null() {
        return Err(SandboxError::PreloadUnavailable(last_dl_error()));
    }

    // SAFETY: `handle` came from the successful dlopen above.
    unsafe { libc::dlclose(handle) };
    Ok(())
}

fn last_dl_error() -> String {
    // SAFETY: dlerror returns NULL or a thread-local NUL-terminated string
    // that stays valid until the next dl* call on this thread.
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        return "unknown dynamic loader error".to_string();
    }
    unsafe { CStr::from_ptr(message) }
        .to_string_lossy()
        .into_owned()
}
