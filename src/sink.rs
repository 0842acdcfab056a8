//! Destinations for lines written to a daemon's tied output streams.

use crate::error::{Error, Result};

use std::{
    fmt::{self, Debug, Formatter},
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
    sync::Mutex,
};

/// Severity attached to each forwarded line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// Used for standard output.
    Info,
    /// Used for standard error.
    Err,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Err => "err",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that accepts whole lines of output.
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str, severity: Severity) -> io::Result<()>;
}

impl Debug for dyn LogSink {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("LogSink")
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn write_line(&self, _line: &str, _severity: Severity) -> io::Result<()> {
        Ok(())
    }
}

/// Appends `"<severity>: <line>"` records to a file.
#[derive(Debug)]
pub struct FileSink(Mutex<File>);

impl FileSink {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map(|file| Self(Mutex::new(file)))
            .map_err(|err| {
                Error::LogSinkUnavailable(format!(
                    "failed to open '{}': {err}",
                    path.display()
                ))
            })
    }
}

impl LogSink for FileSink {
    fn write_line(&self, line: &str, severity: Severity) -> io::Result<()> {
        let mut file = self
            .0
            .lock()
            .map_err(|_| io::Error::other("file sink lock poisoned"))?;

        writeln!(file, "{severity}: {line}")
    }
}

#[cfg(feature = "syslog")]
pub use syslog::Syslog;

#[cfg(feature = "syslog")]
mod syslog {
    use super::{LogSink, Severity};
    use crate::error::{Error, Result};

    use nix::libc;
    use std::{ffi::CString, io};

    /// Sends lines to the system logger with the `daemon` facility.
    ///
    /// Opening the sink calls `openlog(3)`, which is process-wide; only one
    /// `Syslog` should be live at a time.
    #[derive(Debug)]
    pub struct Syslog {
        // openlog keeps a pointer to the identity for as long as it is used.
        ident: CString,
    }

    impl Syslog {
        pub fn open(name: &str) -> Result<Self> {
            let ident = CString::new(name).map_err(|_| {
                Error::LogSinkUnavailable(format!(
                    "syslog identity '{}' contains a NUL byte",
                    name.escape_default()
                ))
            })?;

            // SAFETY: `ident` is stored in the returned value and outlives
            // every syslog call made through it.
            unsafe {
                libc::openlog(ident.as_ptr(), libc::LOG_PID, libc::LOG_DAEMON)
            };

            Ok(Self { ident })
        }

        pub fn ident(&self) -> &str {
            self.ident.to_str().unwrap_or_default()
        }
    }

    impl LogSink for Syslog {
        fn write_line(&self, line: &str, severity: Severity) -> io::Result<()> {
            let priority = match severity {
                Severity::Info => libc::LOG_INFO,
                Severity::Err => libc::LOG_ERR,
            };

            let message = CString::new(line.replace('\0', "\\0"))
                .map_err(io::Error::other)?;

            // SAFETY: the format string is a literal and consumes exactly one
            // C string argument.
            unsafe {
                libc::syslog(
                    libc::LOG_DAEMON | priority,
                    c"%s".as_ptr(),
                    message.as_ptr(),
                )
            };

            Ok(())
        }
    }

    impl Drop for Syslog {
        fn drop(&mut self) {
            // SAFETY: no further syslog calls use `ident` after this.
            unsafe { libc::closelog() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    #[test]
    fn null_accepts_everything() {
        NullSink.write_line("hello", Severity::Info).unwrap();
        NullSink.write_line("world", Severity::Err).unwrap();
    }

    #[test]
    fn file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sink.log");

        fs::write(&path, "existing\n").unwrap();

        let sink = FileSink::open(&path).unwrap();
        sink.write_line("out", Severity::Info).unwrap();
        sink.write_line("oops", Severity::Err).unwrap();

        assert_eq!(
            "existing\ninfo: out\nerr: oops\n",
            fs::read_to_string(&path).unwrap()
        );
    }

    #[test]
    fn file_sink_unavailable() {
        let dir = tempfile::tempdir().unwrap();

        let err = FileSink::open(dir.path().join("no").join("sink.log"))
            .unwrap_err();

        assert!(!err.is_fatal());
    }

    #[cfg(feature = "syslog")]
    #[test]
    fn syslog_rejects_nul() {
        let err = Syslog::open("bad\0name").unwrap_err();

        assert!(matches!(err, Error::LogSinkUnavailable(_)));
    }
}
