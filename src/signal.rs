//! Signal mask handling and restart-request registration.

use crate::error::{Error, Result};

use log::debug;
use nix::sys::signal::{
    self, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};
use std::{
    str::FromStr,
    sync::{Arc, atomic::AtomicBool},
};

/// The signal conventionally used to ask a daemon to restart.
pub const RESTART_SIGNAL: Signal = Signal::SIGHUP;

/// Translates a signal reference into a [`Signal`].
///
/// Accepts bare names (`"hup"`), prefixed names (`"SIGHUP"`), any casing of
/// either, and decimal signal numbers.
///
/// # Examples
///
/// ```
/// use daemonix::signal::parse_signal;
/// use nix::sys::signal::Signal;
///
/// assert_eq!(Signal::SIGHUP, parse_signal("hup").unwrap());
/// assert_eq!(Signal::SIGUSR1, parse_signal("SigUsr1").unwrap());
/// assert_eq!(Signal::SIGTERM, parse_signal("15").unwrap());
/// ```
pub fn parse_signal(name: &str) -> Result<Signal> {
    let trimmed = name.trim();

    if let Ok(number) = trimmed.parse::<i32>() {
        return Signal::try_from(number)
            .map_err(|_| Error::config(format!("unknown signal number {number}")));
    }

    let upper = trimmed.to_ascii_uppercase();
    let bare = upper.strip_prefix("SIG").unwrap_or(&upper);

    if bare.is_empty() {
        return Err(Error::config(format!("invalid signal name '{name}'")));
    }

    Signal::from_str(&format!("SIG{bare}"))
        .map_err(|_| Error::config(format!("unknown signal '{name}'")))
}

/// Removes the named signals from the process's blocked-signal set.
///
/// Fails with [`Error::Config`] if `names` is empty or any name is unknown.
pub fn unmask<S: AsRef<str>>(names: &[S]) -> Result<()> {
    if names.is_empty() {
        return Err(Error::config("no signals given to unmask"));
    }

    let mut set = SigSet::empty();

    for name in names {
        set.add(parse_signal(name.as_ref())?);
    }

    unblock(&set)
}

pub(crate) fn unmask_signals(signals: &[Signal]) -> Result<()> {
    let mut set = SigSet::empty();

    for signal in signals {
        set.add(*signal);
    }

    unblock(&set)
}

fn unblock(set: &SigSet) -> Result<()> {
    signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(set), None)
        .map_err(|err| Error::Signal(format!("failed to unblock signals: {err}")))
}

/// Ignores the restart signal until dropped, then restores the previous
/// disposition.
pub(crate) struct IgnoreRestart(SigAction);

impl IgnoreRestart {
    pub(crate) fn new() -> Result<Self> {
        let ignore =
            SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());

        // SAFETY: installing SIG_IGN does not run any code in signal context.
        let previous = unsafe { signal::sigaction(RESTART_SIGNAL, &ignore) }
            .map_err(|err| {
                Error::Signal(format!(
                    "failed to ignore {RESTART_SIGNAL} across fork: {err}"
                ))
            })?;

        Ok(Self(previous))
    }
}

impl Drop for IgnoreRestart {
    fn drop(&mut self) {
        // SAFETY: restores exactly the disposition that was installed before.
        if let Err(err) = unsafe { signal::sigaction(RESTART_SIGNAL, &self.0) } {
            debug!("failed to restore {RESTART_SIGNAL} disposition: {err}");
        }
    }
}

/// Sets `flag` whenever one of `signals` is delivered.
pub(crate) fn register_restart(
    signals: &[Signal],
    flag: &Arc<AtomicBool>,
) -> Result<()> {
    for signal in signals {
        signal_hook::flag::register(*signal as i32, Arc::clone(flag)).map_err(
            |err| {
                Error::Signal(format!(
                    "failed to register restart handler for {signal}: {err}"
                ))
            },
        )?;

        debug!("restart requested on {signal}");
    }

    Ok(())
}
