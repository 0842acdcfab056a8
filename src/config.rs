//! Daemon configuration.

use crate::{
    error::{Error, Result},
    fork::ForkCount,
    signal,
    sink::LogSink,
    user::Privileges,
};

use nix::sys::signal::Signal;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Largest value accepted for the file mode creation mask.
const UMASK_MAX: u32 = 0o7777;

/// Everything a [`Daemonizer`](crate::Daemonizer) needs to know.
///
/// Values are checked once, when the configuration is handed to
/// [`Daemonizer::new`](crate::Daemonizer::new), and never change afterwards.
#[derive(Clone, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Deserialize),
    serde(default, deny_unknown_fields)
)]
pub struct DaemonConfig {
    pub(crate) name: Option<String>,
    pub(crate) umask: u32,
    #[cfg_attr(feature = "serde", serde(alias = "working_dir"))]
    pub(crate) workdir: PathBuf,
    #[cfg_attr(feature = "serde", serde(rename = "fork"))]
    pub(crate) fork_count: ForkCount,
    pub(crate) pidfile: Option<PathBuf>,
    pub(crate) privileges: Option<Privileges>,
    pub(crate) restart_signals: Vec<String>,
    pub(crate) stdout: Option<PathBuf>,
    pub(crate) stderr: Option<PathBuf>,
    pub(crate) tie: bool,
    pub(crate) debug: Option<PathBuf>,
    pub(crate) log_file: Option<PathBuf>,
    #[cfg_attr(feature = "serde", serde(skip))]
    pub(crate) log_sink: Option<Arc<dyn LogSink>>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            name: None,
            umask: 0,
            workdir: "/".into(),
            fork_count: ForkCount::Two,
            pidfile: None,
            privileges: None,
            restart_signals: Vec::new(),
            stdout: None,
            stderr: None,
            tie: true,
            debug: None,
            log_file: None,
            log_sink: None,
        }
    }
}

impl DaemonConfig {
    pub fn new() -> Self {
        Default::default()
    }

    /// Builds a configuration from a flat `key, value, key, value, ...` list.
    ///
    /// Unknown keys and an odd number of elements are errors.
    ///
    /// # Examples
    ///
    /// ```
    /// use daemonix::DaemonConfig;
    ///
    /// let config = DaemonConfig::from_flat(&[
    ///     "pidfile", "/tmp/d.pid",
    ///     "fork", "2",
    ///     "workdir", "/tmp",
    /// ])
    /// .unwrap();
    ///
    /// assert_eq!(config.forks(), 2);
    /// assert!(DaemonConfig::from_flat(&["pidfile"]).is_err());
    /// ```
    pub fn from_flat<S: AsRef<str>>(list: &[S]) -> Result<Self> {
        if list.len() % 2 != 0 {
            return Err(Error::config(format!(
                "odd number of elements ({}) in configuration list",
                list.len()
            )));
        }

        let mut config = Self::default();

        for pair in list.chunks_exact(2) {
            config.set(pair[0].as_ref(), pair[1].as_ref())?;
        }

        Ok(config)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "name" => self.name = Some(value.into()),
            "umask" => self.umask = parse_umask(value)?,
            "workdir" | "working_dir" => self.workdir = value.into(),
            "fork" => {
                let count = value.trim().parse::<u32>().map_err(|_| {
                    Error::config(format!("invalid fork count '{value}'"))
                })?;
                self.fork_count = count.into();
            }
            "pidfile" => self.pidfile = Some(value.into()),
            "uid" | "gid" | "euid" | "egid" => self
                .privileges
                .get_or_insert_with(Default::default)
                .set(key, value)?,
            "user" => {
                let Privileges { uid, gid, .. } = value.into();
                let privileges =
                    self.privileges.get_or_insert_with(Default::default);

                privileges.uid = uid;
                if gid.is_some() {
                    privileges.gid = gid;
                }
            }
            "restart_signals" => {
                self.restart_signals = value
                    .split(|c: char| c == ',' || c.is_whitespace())
                    .filter(|name| !name.is_empty())
                    .map(str::to_owned)
                    .collect();
            }
            "stdout" => self.stdout = Some(value.into()),
            "stderr" => self.stderr = Some(value.into()),
            "tie" => self.tie = parse_bool(key, value)?,
            "debug" => self.debug = Some(value.into()),
            "log_file" => self.log_file = Some(value.into()),
            _ => {
                return Err(Error::config(format!(
                    "unknown configuration key '{key}'"
                )));
            }
        }

        Ok(())
    }

    /// Sets the label used for the log sink and in messages.
    ///
    /// Defaults to the file name of the program's invocation name.
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    pub fn umask(mut self, mask: u32) -> Self {
        self.umask = mask;
        self
    }

    pub fn chdir<P: AsRef<Path>>(mut self, workdir: Option<P>) -> Self {
        self.workdir = workdir
            .as_ref()
            .map(|path| path.as_ref())
            .unwrap_or(Path::new("/"))
            .to_path_buf();

        self
    }

    /// Sets how many times to fork: 0, 1, or 2. Other values mean 2.
    pub fn fork_count(mut self, count: u32) -> Self {
        self.fork_count = count.into();
        self
    }

    pub fn pidfile<P: AsRef<Path>>(mut self, path: Option<P>) -> Self {
        self.pidfile = path.map(|path| path.as_ref().to_path_buf());
        self
    }

    pub fn privileges(mut self, privileges: Option<Privileges>) -> Self {
        self.privileges = privileges.filter(|privileges| !privileges.is_empty());
        self
    }

    /// Parses `user[:group]` into the privileges to drop to.
    pub fn permissions(self, perms: Option<&str>) -> Self {
        self.privileges(perms.map(Privileges::from))
    }

    /// Signals that request a restart once the daemon is running.
    pub fn restart_signals<I, S>(mut self, signals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.restart_signals = signals.into_iter().map(Into::into).collect();
        self
    }

    pub fn stdout<P: AsRef<Path>>(mut self, path: Option<P>) -> Self {
        self.stdout = path.map(|path| path.as_ref().to_path_buf());
        self
    }

    pub fn stderr<P: AsRef<Path>>(mut self, path: Option<P>) -> Self {
        self.stderr = path.map(|path| path.as_ref().to_path_buf());
        self
    }

    /// Whether standard output and error without an explicit path are tied
    /// to the log sink (`true`, the default) or discarded.
    pub fn tie(mut self, tie: bool) -> Self {
        self.tie = tie;
        self
    }

    /// A file receiving discarded output instead of `/dev/null`.
    pub fn debug<P: AsRef<Path>>(mut self, path: Option<P>) -> Self {
        self.debug = path.map(|path| path.as_ref().to_path_buf());
        self
    }

    /// Appends tied output to a file instead of the system logger.
    ///
    /// A file that cannot be opened at daemonization time leaves the output
    /// discarded.
    pub fn log_file<P: AsRef<Path>>(mut self, path: Option<P>) -> Self {
        self.log_file = path.map(|path| path.as_ref().to_path_buf());
        self
    }

    /// Uses `sink` instead of the system logger for tied streams. Takes
    /// precedence over [`Self::log_file`].
    pub fn log_sink(mut self, sink: Option<Arc<dyn LogSink>>) -> Self {
        self.log_sink = sink;
        self
    }

    pub fn pidfile_path(&self) -> Option<&Path> {
        self.pidfile.as_deref()
    }

    pub fn working_directory(&self) -> &Path {
        &self.workdir
    }

    pub fn forks(&self) -> u32 {
        self.fork_count.get()
    }

    pub fn get_umask(&self) -> u32 {
        self.umask
    }

    pub fn get_privileges(&self) -> Option<&Privileges> {
        self.privileges.as_ref()
    }

    /// Checks the values that cannot be checked while building, returning
    /// the parsed restart signals.
    pub(crate) fn validate(&self) -> Result<Vec<Signal>> {
        if self.umask > UMASK_MAX {
            return Err(Error::config(format!(
                "umask {:#o} is out of range",
                self.umask
            )));
        }

        if let Some(name) = &self.name
            && (name.is_empty() || name.contains('\0'))
        {
            return Err(Error::config(format!("invalid name {name:?}")));
        }

        if self.workdir.as_os_str().is_empty() {
            return Err(Error::config("working directory is empty"));
        }

        if self
            .pidfile
            .as_ref()
            .is_some_and(|path| path.as_os_str().is_empty())
        {
            return Err(Error::config("pidfile path is empty"));
        }

        self.restart_signals
            .iter()
            .map(|name| signal::parse_signal(name))
            .collect()
    }
}

fn parse_umask(value: &str) -> Result<u32> {
    let value = value.trim();
    let digits = value.strip_prefix("0o").unwrap_or(value);

    u32::from_str_radix(digits, 8)
        .map_err(|_| Error::config(format!("invalid umask '{value}'")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(Error::config(format!(
            "invalid boolean '{value}' for '{key}'"
        ))),
    }
}
