use crate::{
    error::{Error, Result},
    signal::IgnoreRestart,
};

use log::debug;
use nix::unistd::{self, ForkResult, setsid};
use std::process::exit;

/// How many times to fork while detaching.
///
/// Two forks guarantee the daemon is not a session leader and can never
/// reacquire a controlling terminal; one fork leaves it as session leader;
/// zero keeps the calling process in the foreground.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ForkCount {
    Zero,
    One,
    #[default]
    Two,
}

impl ForkCount {
    /// Any value other than 0 or 1 means two forks.
    pub fn new(count: u32) -> Self {
        match count {
            0 => Self::Zero,
            1 => Self::One,
            _ => Self::Two,
        }
    }

    pub fn get(self) -> u32 {
        match self {
            Self::Zero => 0,
            Self::One => 1,
            Self::Two => 2,
        }
    }
}

impl From<u32> for ForkCount {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

/// Forks once, ending the parent with status zero.
///
/// Only the child returns. The restart signal is ignored across the call so
/// that the child cannot receive it before it is ready to.
fn fork_once(which: &'static str) -> Result<()> {
    let ignore = IgnoreRestart::new()?;

    // SAFETY: daemonization runs before the process starts any threads.
    match unsafe { unistd::fork() } {
        Ok(ForkResult::Parent { child }) => {
            debug!("forked off {which} child {child}");
            exit(0);
        }
        Ok(ForkResult::Child) => {
            drop(ignore);
            Ok(())
        }
        Err(source) => Err(Error::Fork { which, source }),
    }
}

/// Detaches from the caller: fork, become session leader, fork again.
///
/// Returns only in the final process.
pub(crate) fn detach(count: ForkCount) -> Result<()> {
    if count == ForkCount::Zero {
        return Ok(());
    }

    fork_once("first")?;

    setsid().map_err(Error::Session)?;
    debug!("became session leader");

    if count == ForkCount::Two {
        fork_once("second")?;
    }

    Ok(())
}
