//! The pid file lock.
//!
//! Holding an exclusive `flock` on the pid file is what makes a daemon the
//! single running instance. The lock is attempted once before forking, for
//! early feedback, and once more right after the final fork because some
//! platforms do not carry `flock` locks across `fork`.

use crate::error::{Error, Result};

use log::{debug, warn};
use nix::{
    errno::Errno,
    fcntl::{FcntlArg, FdFlag, fcntl},
    libc,
    unistd::Pid,
};
use std::{
    env,
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, RawFd},
        unix::fs::OpenOptionsExt,
    },
    path::{Path, PathBuf},
};

// Tests across the crate share the process environment through HANDOFF_VAR.
#[cfg(test)]
pub(crate) static ENV: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Environment variable carrying the descriptor of a locked pid file across
/// `exec`.
pub const HANDOFF_VAR: &str = "DAEMONIX_PIDFILE_FD";

/// An open pid file on which this process holds an exclusive lock.
///
/// The lock lasts until the process exits, or until the value is dropped.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    file: File,
}

impl PidLock {
    /// Opens and locks the pid file at `path`, truncating it once the lock is
    /// held.
    ///
    /// If a previous process image handed over its descriptor through
    /// [`HANDOFF_VAR`], that descriptor is adopted instead of opening `path`.
    ///
    /// Fails with [`Error::AlreadyRunning`] if another process holds the lock.
    pub fn acquire<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = match inherited() {
            Some(file) => file,
            None => open(path)?,
        };

        let lock = Self {
            path: path.to_path_buf(),
            file,
        };

        lock.reconfirm()?;

        lock.file
            .set_len(0)
            .map_err(|err| Error::pidfile(path, err))?;

        debug!("acquired lock on pidfile '{}'", path.display());

        Ok(lock)
    }

    /// Attempts the exclusive lock again on the already open descriptor.
    pub fn reconfirm(&self) -> Result<()> {
        // SAFETY: the descriptor is owned by `self.file` and open.
        let result = Errno::result(unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB)
        });

        match result {
            Ok(_) => Ok(()),
            Err(err) if err == Errno::EWOULDBLOCK => Err(Error::AlreadyRunning {
                path: self.path.clone(),
            }),
            Err(err) => Err(Error::pidfile(&self.path, err.into())),
        }
    }

    /// Replaces the file's contents with the decimal `pid`.
    pub fn write_pid(&mut self, pid: Pid) -> Result<()> {
        let path = &self.path;

        self.file
            .set_len(0)
            .and_then(|_| self.file.seek(SeekFrom::Start(0)))
            .and_then(|_| self.file.write_all(pid.to_string().as_bytes()))
            .map_err(|err| Error::pidfile(path, err))?;

        debug!("wrote pid {pid} to '{}'", path.display());

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Sets or clears the descriptor's close-on-exec flag.
    pub fn set_cloexec(&self, enabled: bool) -> Result<()> {
        set_cloexec(&self.file, enabled)
            .map_err(|err| Error::pidfile(&self.path, err.into()))
    }

    /// Keeps the descriptor open across `exec` and advertises its number in
    /// [`HANDOFF_VAR`].
    pub fn handoff(&self) -> Result<()> {
        self.set_cloexec(false)?;

        // SAFETY: called right before `exec`; no other thread reads the
        // environment at that point.
        unsafe { env::set_var(HANDOFF_VAR, self.as_raw_fd().to_string()) };

        debug!("handing off pidfile descriptor {}", self.as_raw_fd());

        Ok(())
    }

    /// Undoes [`PidLock::handoff`] after an `exec` that did not happen.
    pub fn reclaim(&self) -> Result<()> {
        // SAFETY: see `handoff`.
        unsafe { env::remove_var(HANDOFF_VAR) };

        self.set_cloexec(true)
    }
}

fn open(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o644)
        .open(path)
        .map_err(|err| Error::pidfile(path, err))
}

/// Takes ownership of a descriptor handed over by a previous process image.
fn inherited() -> Option<File> {
    let value = env::var_os(HANDOFF_VAR)?;

    // SAFETY: the variable must not leak to children, and is removed before
    // the daemon starts any threads.
    unsafe { env::remove_var(HANDOFF_VAR) };

    let Some(fd) = value
        .to_str()
        .and_then(|value| value.trim().parse::<RawFd>().ok())
        .filter(|fd| *fd > libc::STDERR_FILENO)
    else {
        warn!("ignoring invalid {HANDOFF_VAR} value {value:?}");
        return None;
    };

    // SAFETY: only descriptor flags are touched; a descriptor that is not
    // open makes fcntl fail with EBADF.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };

    if let Err(err) = set_cloexec(borrowed, true) {
        warn!("ignoring inherited pidfile descriptor {fd}: {err}");
        return None;
    }

    debug!("adopting inherited pidfile descriptor {fd}");

    // SAFETY: the descriptor is open and was handed to this process image to
    // own; nothing else in this process refers to it.
    Some(unsafe { File::from_raw_fd(fd) })
}

/// Closes a descriptor handed over by a previous process image when this
/// image has no pid file to adopt it for, releasing its lock.
pub(crate) fn release_inherited() {
    if let Some(file) = inherited() {
        debug!("releasing inherited pidfile descriptor {}", file.as_raw_fd());
    }
}

pub(crate) fn set_cloexec<Fd: AsFd>(fd: Fd, enabled: bool) -> nix::Result<()> {
    let mut flags = FdFlag::from_bits_retain(fcntl(&fd, FcntlArg::F_GETFD)?);
    flags.set(FdFlag::FD_CLOEXEC, enabled);

    fcntl(&fd, FcntlArg::F_SETFD(flags)).map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{fs, mem};

    fn cloexec(fd: RawFd) -> bool {
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();

        FdFlag::from_bits_retain(flags).contains(FdFlag::FD_CLOEXEC)
    }

    #[test]
    fn acquire_creates_file() {
        let _env = ENV.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");

        let lock = PidLock::acquire(&path).unwrap();

        assert!(path.exists());
        assert_eq!(path, lock.path());
        assert!(cloexec(lock.as_raw_fd()));
    }

    #[test]
    fn second_acquire_is_already_running() {
        let _env = ENV.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");

        let _lock = PidLock::acquire(&path).unwrap();
        fs::write(&path, "1234").unwrap();

        let err = PidLock::acquire(&path).unwrap_err();

        assert!(err.is_already_running(), "{err}");
        assert!(err.to_string().contains("lock on pidfile"));
        assert_eq!("1234", fs::read_to_string(&path).unwrap());
    }

    #[test]
    fn acquire_after_release() {
        let _env = ENV.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");

        drop(PidLock::acquire(&path).unwrap());

        PidLock::acquire(&path).unwrap();
    }

    #[test]
    fn reconfirm_held_lock() {
        let _env = ENV.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();

        let lock = PidLock::acquire(dir.path().join("test.pid")).unwrap();

        lock.reconfirm().unwrap();
        lock.reconfirm().unwrap();
    }

    #[test]
    fn write_pid_replaces_contents() {
        let _env = ENV.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");

        let mut lock = PidLock::acquire(&path).unwrap();

        lock.write_pid(Pid::from_raw(123456)).unwrap();
        lock.write_pid(Pid::from_raw(42)).unwrap();

        assert_eq!("42", fs::read_to_string(&path).unwrap());
    }

    #[test]
    fn acquire_missing_directory() {
        let _env = ENV.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("test.pid");

        let err = PidLock::acquire(&path).unwrap_err();

        assert!(matches!(err, Error::Pidfile { .. }), "{err}");
    }

    #[test]
    fn handoff_and_adopt() {
        let _env = ENV.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");

        let lock = PidLock::acquire(&path).unwrap();
        let fd = lock.as_raw_fd();

        lock.handoff().unwrap();

        assert!(!cloexec(fd));
        assert_eq!(fd.to_string(), env::var(HANDOFF_VAR).unwrap());

        // The replacement image owns the descriptor from here on.
        mem::forget(lock);

        let adopted = PidLock::acquire(&path).unwrap();

        assert_eq!(fd, adopted.as_raw_fd());
        assert!(cloexec(fd));
        assert!(env::var_os(HANDOFF_VAR).is_none());

        let err = PidLock::acquire(&path).unwrap_err();
        assert!(err.is_already_running());
    }

    #[test]
    fn reclaim_restores_cloexec() {
        let _env = ENV.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();

        let lock = PidLock::acquire(dir.path().join("test.pid")).unwrap();

        lock.handoff().unwrap();
        lock.reclaim().unwrap();

        assert!(cloexec(lock.as_raw_fd()));
        assert!(env::var_os(HANDOFF_VAR).is_none());
    }

    #[test]
    fn invalid_handoff_value_is_ignored() {
        let _env = ENV.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");

        unsafe { env::set_var(HANDOFF_VAR, "not a number") };

        PidLock::acquire(&path).unwrap();

        assert!(env::var_os(HANDOFF_VAR).is_none());
    }

    #[test]
    fn release_inherited_unlocks() {
        let _env = ENV.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.pid");

        let lock = PidLock::acquire(&path).unwrap();
        lock.handoff().unwrap();
        mem::forget(lock);

        release_inherited();

        assert!(env::var_os(HANDOFF_VAR).is_none());
        PidLock::acquire(&path).unwrap();
    }

    #[test]
    fn release_without_handoff() {
        let _env = ENV.lock().unwrap();

        release_inherited();

        assert!(env::var_os(HANDOFF_VAR).is_none());
    }
}
