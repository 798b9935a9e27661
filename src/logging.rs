use crate::spec::LogTarget;
use anyhow::{Result, anyhow};
use std::{
    ffi::CString,
    io::{self, Write},
    sync::Once,
};
use tracing::{Level, Metadata};
use tracing_subscriber::{EnvFilter, fmt::MakeWriter};

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "WARDEN_LOG";

const DEFAULT_DIRECTIVES: &str = "info";

/// Installs the global subscriber, writing either to stderr or to syslog.
pub fn init(target: LogTarget) -> Result<()> {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false);

    let installed = match target {
        LogTarget::Stderr => builder.with_writer(io::stderr).try_init(),
        // syslog stamps messages itself.
        LogTarget::Syslog => builder.without_time().with_writer(Syslog::open()).try_init(),
    };

    installed.map_err(|error| anyhow!("Could not install log subscriber: {error}"))
}

/// Hands formatted events to `syslog(3)` under the `warden` ident.
#[derive(Debug, Clone, Copy)]
pub struct Syslog;

impl Syslog {
    pub fn open() -> Self {
        static OPEN: Once = Once::new();
        // SAFETY: the ident is a static C string that outlives every call.
        OPEN.call_once(|| unsafe {
            libc::openlog(c"warden".as_ptr(), libc::LOG_PID, libc::LOG_USER);
        });
        Self
    }
}

impl<'a> MakeWriter<'a> for Syslog {
    type Writer = SyslogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogWriter::new(libc::LOG_INFO)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        SyslogWriter::new(priority(meta.level()))
    }
}

fn priority(level: &Level) -> libc::c_int {
    if *level == Level::ERROR {
        libc::LOG_ERR
    } else if *level == Level::WARN {
        libc::LOG_WARNING
    } else if *level == Level::INFO {
        libc::LOG_INFO
    } else {
        libc::LOG_DEBUG
    }
}

/// Buffers one event and sends it when dropped.
#[derive(Debug)]
pub struct SyslogWriter {
    priority: libc::c_int,
    buffer: Vec<u8>,
}

impl SyslogWriter {
    fn new(priority: libc::c_int) -> Self {
        Self {
            priority,
            buffer: Vec::new(),
        }
    }

    /// The buffered event as syslog should see it: one line, no NULs.
    fn message(&self) -> Option<CString> {
        let text: Vec<u8> = self
            .buffer
            .trim_ascii_end()
            .iter()
            .copied()
            .filter(|&byte| byte != 0)
            .collect();

        if text.is_empty() {
            return None;
        }
        CString::new(text).ok()
    }
}

impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogWriter {
    fn drop(&mut self) {
        if let Some(message) = self.message() {
            // SAFETY: both strings are NUL-terminated and the format
            // consumes exactly one argument.
            unsafe { libc::syslog(self.priority, c"%s".as_ptr(), message.as_ptr()) };
        }
    }
}
