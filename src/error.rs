use std::{io, path::PathBuf, process::exit};

/// Errors produced while configuring, daemonizing or restarting a process.
///
/// Every variant except [`Error::LogSinkUnavailable`] is fatal: the sequence
/// that produced it has been aborted and nothing was rolled back.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed configuration, detected before any OS-level step runs.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to drop privileges: {0}")]
    Privilege(String),

    /// Another process holds the lock on the pid file.
    #[error(
        "another instance is already running: lock on pidfile '{}' is held",
        path.display()
    )]
    AlreadyRunning { path: PathBuf },

    #[error("pidfile '{}': {source}", path.display())]
    Pidfile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to fork off for the {which} time: {source}")]
    Fork {
        which: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("failed to become session leader: {0}")]
    Session(#[source] nix::Error),

    #[error(
        "failed to change working directory to '{}': {source}",
        path.display()
    )]
    Chdir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to redirect {stream}: {source}")]
    Redirect {
        stream: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("signal: {0}")]
    Signal(String),

    /// The log sink could not be set up. Daemonization degrades to the null
    /// sink instead of failing.
    #[error("log sink unavailable: {0}")]
    LogSinkUnavailable(String),

    /// The process image could not be replaced. The caller must terminate.
    #[error("failed to re-execute '{}': {source}", path.display())]
    RestartExec {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub(crate) fn pidfile(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Pidfile {
            path: path.into(),
            source,
        }
    }

    /// Returns true if the error reports contention on the pid file lock.
    ///
    /// Callers typically exit quietly in this case instead of raising an
    /// alarm.
    pub fn is_already_running(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. })
    }

    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::LogSinkUnavailable(_))
    }

    /// Prints the error prefixed with `name` to stderr and exits with a
    /// non-zero status. A stderr tied to a log sink is drained on exit.
    pub fn terminate(self, name: &str) -> ! {
        eprintln!("{name}: {self}");
        exit(1);
    }
}

pub type Result<T> = std::result::Result<T, Error>;
