mod capabilities;
mod checks;
mod config;
mod elf;
mod engine;
mod error;
mod hardener;
mod identity;
mod idmap;
mod jail;
mod jailer;
mod launch;
mod logging;
mod notifier;
mod parser;
mod preload;
mod report;
mod seccomp;
mod spec;
mod stack;
#[cfg(test)]
mod testing;

use elf::ElfClassifier;
use error::SandboxError;
use identity::HostIdentity;
use jail::Jail;
use spec::LogTarget;
use tracing::{debug, error};

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let identity = HostIdentity::new();
    let parsed = match parser::parse_args(std::env::args_os(), &identity, &ElfClassifier) {
        Ok(parsed) => parsed,
        Err(SandboxError::Usage(usage)) => {
            let code = if usage.use_stderr() { 1 } else { 0 };
            // Nothing useful to do if the terminal is gone.
            let _ = usage.print();
            return code;
        }
        Err(error) => {
            eprintln!("warden: {error}");
            return error.exit_code();
        }
    };

    if let Err(error) = logging::init(parsed.spec.log_target) {
        eprintln!("warden: {error:#}");
        return 1;
    }
    debug!(spec = ?parsed.spec, "starting sandbox");

    let mut jail = Jail::new();
    let status = engine::apply(&parsed.spec, &mut jail)
        .and_then(|()| launch::launch(&parsed, &mut jail));

    match status {
        Ok(status) => status,
        Err(failure) => {
            error!("{failure}");
            if parsed.spec.log_target != LogTarget::Stderr {
                eprintln!("warden: {failure}");
            }
            failure.exit_code()
        }
    }
}
