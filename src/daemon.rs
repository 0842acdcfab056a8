use crate::{
    argv,
    config::DaemonConfig,
    error::{Error, Result},
    fork,
    pidfile::{self, PidLock},
    signal::{self, RESTART_SIGNAL},
    sink::{FileSink, LogSink},
    stdio::{self, Outputs},
};

use log::{debug, error, info, warn};
use nix::{
    libc::mode_t,
    sys::{
        signal::Signal,
        stat::{self, Mode},
    },
    unistd::{self, Pid},
};
use std::{
    convert::Infallible,
    env,
    ffi::{CString, OsStr, OsString},
    fs, io,
    os::unix::ffi::OsStringExt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// Turns the calling process into a daemon and can later re-execute it.
///
/// The `Daemonizer` owns the pid file lock once it has been acquired. The lock
/// is never shared: it lives as long as the process does, or is handed to the
/// next process image by [`Daemonizer::restart`].
#[derive(Debug)]
pub struct Daemonizer {
    config: DaemonConfig,
    name: String,
    restart_signals: Vec<Signal>,
    lock: Option<PidLock>,
    sink: Option<Arc<dyn LogSink>>,
    restart_requested: Arc<AtomicBool>,
}

impl Daemonizer {
    /// Validates `config` and prepares to daemonize.
    ///
    /// The restart signal is unmasked here unconditionally, so that a process
    /// started by a previous image's restart does not keep it blocked. Without
    /// a pid file, a lock handed over by a previous image is released.
    pub fn new(config: DaemonConfig) -> Result<Self> {
        argv::capture();

        let restart_signals = config.validate()?;

        signal::unmask_signals(&[RESTART_SIGNAL])?;

        if config.pidfile.is_none() {
            pidfile::release_inherited();
        }

        let name = config
            .name
            .clone()
            .or_else(argv::program_name)
            .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_owned());

        Ok(Self {
            config,
            name,
            restart_signals,
            lock: None,
            sink: None,
            restart_requested: Default::default(),
        })
    }

    /// Shorthand for [`DaemonConfig::from_flat`] followed by [`Self::new`].
    pub fn from_flat<S: AsRef<str>>(list: &[S]) -> Result<Self> {
        Self::new(DaemonConfig::from_flat(list)?)
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pid file lock, once [`Self::daemonize`] has acquired it.
    pub fn lock(&self) -> Option<&PidLock> {
        self.lock.as_ref()
    }

    pub fn pid(&self) -> Pid {
        unistd::getpid()
    }

    /// Returns true once one of the configured restart signals has arrived.
    pub fn restart_requested(&self) -> bool {
        self.restart_requested.load(Ordering::Relaxed)
    }

    /// Runs the daemonization sequence.
    ///
    /// Returns only in the final daemon process; every intermediate parent
    /// exits with status zero. Privilege and lock failures are reported
    /// before the first fork. Nothing is rolled back on failure.
    pub fn daemonize(&mut self) -> Result<()> {
        if let Some(privileges) = &self.config.privileges {
            privileges.drop_privileges()?;
            debug!("privileges dropped");
        }

        self.attempt_lock()?;

        check_dir(&self.config.workdir)?;

        let mask = Mode::from_bits_truncate(self.config.umask as mode_t);
        stat::umask(mask);
        debug!("umask set to {:#o}", self.config.umask);

        fork::detach(self.config.fork_count)?;

        if let Some(lock) = &mut self.lock {
            lock.reconfirm()?;
            lock.write_pid(unistd::getpid())?;
        }

        env::set_current_dir(&self.config.workdir).map_err(|source| {
            Error::Chdir {
                path: self.config.workdir.clone(),
                source,
            }
        })?;

        self.sink = self.log_sink();
        self.redirect()?;

        signal::register_restart(&self.restart_signals, &self.restart_requested)?;

        info!("{} running as pid {}", self.name, unistd::getpid());

        Ok(())
    }

    fn attempt_lock(&mut self) -> Result<()> {
        match (&self.lock, &self.config.pidfile) {
            (Some(lock), _) => lock.reconfirm(),
            (None, Some(path)) => {
                self.lock = Some(PidLock::acquire(path)?);
                Ok(())
            }
            (None, None) => Ok(()),
        }
    }

    fn redirect(&self) -> Result<()> {
        stdio::redirect(&Outputs {
            name: &self.name,
            stdout: self.config.stdout.as_deref(),
            stderr: self.config.stderr.as_deref(),
            debug: self.config.debug.as_deref(),
            sink: self.sink.clone(),
        })
    }

    /// The sink for tied streams, or `None` if output is to be discarded.
    fn log_sink(&self) -> Option<Arc<dyn LogSink>> {
        let config = &self.config;

        if !config.tie || (config.stdout.is_some() && config.stderr.is_some()) {
            return None;
        }

        let sink = match (&config.log_sink, &config.log_file) {
            (Some(sink), _) => Ok(Arc::clone(sink)),
            (None, Some(path)) => FileSink::open(path)
                .map(|sink| Arc::new(sink) as Arc<dyn LogSink>),
            (None, None) => default_sink(&self.name),
        };

        match sink {
            Ok(sink) => Some(sink),
            Err(err) => {
                warn!("{err}; discarding output instead");
                None
            }
        }
    }

    /// Replaces the process image with a fresh copy of the running
    /// executable.
    ///
    /// `args` excludes the program name; when `None`, the arguments the
    /// process was originally started with are used. A held pid file lock
    /// stays open across the `exec` and is adopted by the next image's
    /// [`Self::daemonize`]. Tied streams are drained into the log sink and
    /// pointed at `/dev/null` first.
    ///
    /// Returns only on failure, with [`Error::RestartExec`] or an error from
    /// preparing the restart. The process is then in an indeterminate state
    /// and must terminate; see [`Self::restart_or_exit`].
    pub fn restart(&mut self, args: Option<Vec<OsString>>) -> Result<Infallible> {
        let path = current_exe()?;

        let program = argv::program()
            .map(OsStr::to_os_string)
            .unwrap_or_else(|| path.clone().into_os_string());
        let args = args.unwrap_or_else(|| argv::args().to_vec());

        let c_path = to_cstring(path.clone().into_os_string(), &path)?;
        let c_args = std::iter::once(program)
            .chain(args)
            .map(|arg| to_cstring(arg, &path))
            .collect::<Result<Vec<_>>>()?;

        let mut unmask = vec![RESTART_SIGNAL];
        unmask.extend_from_slice(&self.restart_signals);
        signal::unmask_signals(&unmask)?;

        if let Some(lock) = &self.lock {
            lock.handoff()?;
        }

        info!("{} restarting as '{}'", self.name, path.display());

        let drained = stdio::drain();

        let err = match unistd::execv(&c_path, &c_args) {
            Ok(never) => match never {},
            Err(err) => err,
        };

        if drained && let Err(retie) = self.redirect() {
            warn!("{retie}");
        }

        if let Some(lock) = &self.lock
            && let Err(reclaim) = lock.reclaim()
        {
            warn!("{reclaim}");
        }

        error!("failed to re-execute '{}': {err}", path.display());

        Err(Error::RestartExec {
            path,
            source: err.into(),
        })
    }

    /// Like [`Self::restart`], but reports a failure and terminates.
    pub fn restart_or_exit(&mut self, args: Option<Vec<OsString>>) -> ! {
        match self.restart(args) {
            Ok(never) => match never {},
            Err(err) => err.terminate(&self.name),
        }
    }
}

#[cfg(feature = "syslog")]
fn default_sink(name: &str) -> Result<Arc<dyn LogSink>> {
    Ok(Arc::new(crate::sink::Syslog::open(name)?))
}

#[cfg(not(feature = "syslog"))]
fn default_sink(_name: &str) -> Result<Arc<dyn LogSink>> {
    Err(Error::LogSinkUnavailable(
        "built without syslog support and no sink was given".into(),
    ))
}

// The working directory is only entered after forking; checking it here lets
// a bad path fail while the caller can still see the error.
fn check_dir(path: &Path) -> Result<()> {
    let metadata = fs::metadata(path).map_err(|source| Error::Chdir {
        path: path.to_path_buf(),
        source,
    })?;

    if !metadata.is_dir() {
        return Err(Error::Chdir {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::NotADirectory, "not a directory"),
        });
    }

    Ok(())
}

fn current_exe() -> Result<PathBuf> {
    env::current_exe()
        .and_then(fs::canonicalize)
        .map_err(|source| Error::RestartExec {
            path: argv::program().map(PathBuf::from).unwrap_or_default(),
            source,
        })
}

fn to_cstring(value: OsString, path: &Path) -> Result<CString> {
    CString::new(value.into_vec()).map_err(|err| Error::RestartExec {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidInput, err),
    })
}
