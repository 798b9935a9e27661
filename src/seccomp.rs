//! Seccomp policies in seccompiler's JSON format.
//!
//! A policy file holds one or more named filters:
//!
//! ```json
//! {
//!     "main": {
//!         "mismatch_action": "kill_process",
//!         "match_action": "allow",
//!         "filter": [{ "syscall": "read" }, { "syscall": "exit_group" }]
//!     }
//! }
//! ```
//!
//! A file with a single filter uses it whatever its name; otherwise the
//! filter called `main` is installed.

use anyhow::{Context, Result, anyhow, bail};
use seccompiler::{BpfProgram, TargetArch};
use serde_json::Value;
use std::{collections::HashMap, fs, path::Path};
use tracing::debug;

const MAIN_FILTER: &str = "main";

/// Actions that stop the process; `-L` turns them into a log entry.
const FATAL_ACTIONS: [&str; 3] = ["kill_process", "kill_thread", "trap"];

/// What gets installed in the sandboxed process.
#[derive(Debug, Clone)]
pub enum SeccompProgram {
    Strict,
    Filter(BpfProgram),
}

/// Reads and compiles the policy at `path` for the running architecture.
pub fn compile_policy(path: &Path, log_failures: bool) -> Result<BpfProgram> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read seccomp policy {}", path.display()))?;
    let mut policy: Value = serde_json::from_str(&text)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;

    if log_failures {
        log_instead_of_failing(&mut policy);
    }

    let arch = TargetArch::try_from(std::env::consts::ARCH)
        .map_err(|error| anyhow!("Unsupported architecture for seccomp filter: {error}"))?;
    let filters = seccompiler::compile_from_json(policy.to_string().as_bytes(), arch)
        .with_context(|| format!("Failed to compile seccomp policy {}", path.display()))?;

    let program = select_filter(filters)?;
    debug!(path = %path.display(), instructions = program.len(), "compiled seccomp policy");
    Ok(program)
}

fn select_filter(mut filters: HashMap<String, BpfProgram>) -> Result<BpfProgram> {
    if filters.len() == 1 {
        if let Some(program) = filters.into_values().next() {
            return Ok(program);
        }
        bail!("seccomp policy defines no filters");
    }

    filters.remove(MAIN_FILTER).with_context(|| {
        format!(
            "seccomp policy defines {} filters but none is named '{MAIN_FILTER}'",
            filters.len()
        )
    })
}

/// Rewrites every fatal action in the policy to `log`.
fn log_instead_of_failing(policy: &mut Value) {
    let Some(filters) = policy.as_object_mut() else {
        return;
    };

    for filter in filters.values_mut() {
        for key in ["mismatch_action", "match_action"] {
            if let Some(action) = filter.get_mut(key) {
                if action.as_str().is_some_and(|name| FATAL_ACTIONS.contains(&name)) {
                    *action = Value::from("log");
                }
            }
        }
    }
}

/// Installs `program` on the calling thread, or on every thread with `tsync`.
pub fn install(program: &BpfProgram, tsync: bool) -> Result<()> {
    if tsync {
        seccompiler::apply_filter_all_threads(program)
            .context("Failed to install seccomp filter on all threads")
    } else {
        seccompiler::apply_filter(program).context("Failed to install seccomp filter")
    }
}

/// Packs a compiled program into the words the preload library expects.
pub fn pack(program: &BpfProgram) -> Vec<u64> {
    program
        .iter()
        .map(|insn| {
            u64::from(insn.code)
                | u64::from(insn.jt) << 16
                | u64::from(insn.jf) << 24
                | u64::from(insn.k) << 32
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn policy_file(policy: &Value) -> Result<tempfile::NamedTempFile> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(policy.to_string().as_bytes())?;
        Ok(file)
    }

    fn filter(mismatch: &str) -> Value {
        json!({
            "mismatch_action": mismatch,
            "match_action": "allow",
            "filter": [{ "syscall": "read" }, { "syscall": "exit_group" }]
        })
    }

    #[test]
    fn single_filter_is_used_whatever_its_name() -> Result<()> {
        let file = policy_file(&json!({ "worker": filter("kill_process") }))?;
        assert!(!compile_policy(file.path(), false)?.is_empty());
        Ok(())
    }

    #[test]
    fn several_filters_need_a_main_one() -> Result<()> {
        let file = policy_file(&json!({
            "one": filter("kill_process"),
            "two": filter("kill_process"),
        }))?;
        assert!(compile_policy(file.path(), false).is_err());

        let file = policy_file(&json!({
            "main": filter("kill_process"),
            "other": filter("kill_thread"),
        }))?;
        assert!(compile_policy(file.path(), false).is_ok());
        Ok(())
    }

    #[test]
    fn logging_replaces_fatal_actions() {
        let mut policy = json!({
            "main": filter("kill_process"),
            "errno": filter("trap"),
            "other": { "mismatch_action": { "errno": 1 }, "match_action": "allow", "filter": [] }
        });
        log_instead_of_failing(&mut policy);

        assert_eq!(policy["main"]["mismatch_action"], "log");
        assert_eq!(policy["errno"]["mismatch_action"], "log");
        assert_eq!(policy["main"]["match_action"], "allow");
        assert_eq!(policy["other"]["mismatch_action"], json!({ "errno": 1 }));
    }

    #[test]
    fn logging_changes_the_compiled_program() -> Result<()> {
        let file = policy_file(&json!({ "main": filter("kill_process") }))?;
        let strict = compile_policy(file.path(), false)?;
        let logged = compile_policy(file.path(), true)?;
        assert_ne!(pack(&strict), pack(&logged));
        Ok(())
    }

    #[test]
    fn unreadable_policies_are_errors() {
        assert!(compile_policy(Path::new("/no/such/policy.json"), false).is_err());
    }

    #[test]
    fn packed_words_keep_every_field() {
        let program = vec![seccompiler::sock_filter {
            code: 0x06,
            jt: 1,
            jf: 2,
            k: 0x7fff_0000,
        }];
        assert_eq!(pack(&program), [0x7fff_0000_0201_0006]);
    }
}
