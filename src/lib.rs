//! Turn a running process into a well-behaved UNIX daemon.
//!
//! A [`Daemonizer`] drops privileges, takes an exclusive lock on a pid file,
//! double-forks into a new session, records its pid, changes directory and
//! redirects its standard streams. It can later re-execute itself with
//! [`Daemonizer::restart`] without ever releasing the pid file lock.
//!
//! ```no_run
//! use daemonix::{DaemonConfig, Daemonizer};
//!
//! let config = DaemonConfig::new()
//!     .pidfile(Some("/tmp/d.pid"))
//!     .chdir(Some("/tmp"))
//!     .restart_signals(["HUP"]);
//!
//! let mut daemon = Daemonizer::new(config).unwrap_or_else(|err| err.terminate("d"));
//!
//! if let Err(err) = daemon.daemonize() {
//!     if err.is_already_running() {
//!         std::process::exit(0);
//!     }
//!     err.terminate(daemon.name());
//! }
//!
//! loop {
//!     if daemon.restart_requested() {
//!         daemon.restart_or_exit(None);
//!     }
//!     std::thread::sleep(std::time::Duration::from_secs(1));
//! }
//! ```

pub mod argv;
mod config;
mod daemon;
mod error;
mod fork;
pub mod pidfile;
pub mod signal;
pub mod sink;
mod stdio;
pub mod user;

#[cfg(feature = "serde")]
mod serde;

pub use config::DaemonConfig;
pub use daemon::Daemonizer;
pub use error::{Error, Result};
pub use fork::ForkCount;
pub use pidfile::PidLock;
pub use user::{Group, Privileges, User, drop_privileges};

pub use nix;
