//! Helpers for tests that run daemons in forked children.
//!
//! Children must never return into the test harness: every path through a
//! child ends in `exit`.

#![allow(dead_code)]

use daemonix::{DaemonConfig, Daemonizer, Error, PidLock};
use nix::{
    sys::{
        signal::{Signal, kill},
        wait::{WaitStatus, waitpid},
    },
    unistd::{ForkResult, Pid, fork},
};
use std::{
    fs,
    path::Path,
    process::exit,
    thread,
    time::{Duration, Instant},
};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Exit status of a child whose `Daemonizer::new` failed.
pub const EXIT_NEW: i32 = 2;

/// Exit status of a child whose `daemonize` failed for lock contention.
pub const EXIT_RUNNING: i32 = 3;

/// Exit status of a child whose `daemonize` failed for any other reason.
pub const EXIT_DAEMONIZE: i32 = 4;

pub fn config(pidfile: &Path, workdir: &Path, forks: u32) -> DaemonConfig {
    DaemonConfig::new()
        .name("daemonix-test")
        .pidfile(Some(pidfile))
        .chdir(Some(workdir))
        .fork_count(forks)
        .tie(false)
}

/// Maps a daemonization failure onto this module's exit statuses.
pub fn exit_with(err: &Error) -> ! {
    if err.is_already_running() {
        exit(EXIT_RUNNING);
    }

    exit(EXIT_DAEMONIZE);
}

/// Runs `child` in a forked process and returns its pid.
pub fn spawn(child: impl FnOnce()) -> Pid {
    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            child();
            exit(0);
        }
        ForkResult::Parent { child } => child,
    }
}

/// Daemonizes the calling child, exiting on failure.
pub fn daemonize(config: DaemonConfig) -> Daemonizer {
    let mut daemon = match Daemonizer::new(config) {
        Ok(daemon) => daemon,
        Err(_) => exit(EXIT_NEW),
    };

    if let Err(err) = daemon.daemonize() {
        exit_with(&err);
    }

    daemon
}

/// Daemonizes the calling child and keeps it running.
pub fn launch(config: DaemonConfig) -> ! {
    let _daemon = daemonize(config);
    idle();
}

/// Keeps a daemonized child alive until it is killed.
pub fn idle() -> ! {
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}

pub fn wait_exit(child: Pid) -> i32 {
    match waitpid(child, None).unwrap() {
        WaitStatus::Exited(_, code) => code,
        status => panic!("unexpected wait status for {child}: {status:?}"),
    }
}

/// Polls until `condition` returns a value or the timeout elapses.
pub fn eventually<T>(mut condition: impl FnMut() -> Option<T>) -> T {
    let start = Instant::now();

    loop {
        if let Some(value) = condition() {
            return value;
        }

        assert!(start.elapsed() < TIMEOUT, "timed out waiting");
        thread::sleep(Duration::from_millis(20));
    }
}

/// Waits for the pid file to hold a pid and returns it.
pub fn read_pid(path: &Path) -> Pid {
    eventually(|| {
        fs::read_to_string(path)
            .ok()
            .and_then(|content| content.parse::<i32>().ok())
            .map(Pid::from_raw)
    })
}

/// Asserts that nobody else can take the lock right now.
pub fn assert_locked(path: &Path) {
    match PidLock::acquire(path) {
        Ok(_) => panic!("lock on '{}' was free", path.display()),
        Err(err) => assert!(err.is_already_running(), "{err}"),
    }
}

/// Kills `pid` and waits until its lock on `path` is released.
pub fn stop(pid: Pid, path: &Path) {
    kill(pid, Signal::SIGKILL).unwrap();

    eventually(|| PidLock::acquire(path).ok());
}
