//! Snapshot of the original command line.
//!
//! The snapshot is taken on first access and never changes afterwards. Call
//! [`capture`] at the top of `main` to pin it before anything else runs;
//! constructing a [`Daemonizer`](crate::Daemonizer) also captures it.

use std::{
    env,
    ffi::{OsStr, OsString},
    path::Path,
    sync::LazyLock,
};

static SAVED: LazyLock<Vec<OsString>> = LazyLock::new(|| env::args_os().collect());

/// Captures the argument snapshot if it has not been captured yet.
pub fn capture() {
    LazyLock::force(&SAVED);
}

/// The full argument vector as the process was invoked, including `argv[0]`.
pub fn saved() -> &'static [OsString] {
    &SAVED
}

/// The program invocation name (`argv[0]`), if there was one.
pub fn program() -> Option<&'static OsStr> {
    SAVED.first().map(OsString::as_os_str)
}

/// The arguments following `argv[0]`.
pub fn args() -> &'static [OsString] {
    SAVED.get(1..).unwrap_or_default()
}

/// The last path component of the invocation name.
pub(crate) fn program_name() -> Option<String> {
    program()
        .map(Path::new)
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_matches_env() {
        capture();

        let expected: Vec<OsString> = env::args_os().collect();

        assert_eq!(expected, saved());
        assert_eq!(&expected[1..], args());
    }

    #[test]
    fn program_name_is_file_name() {
        let name = program_name().unwrap();

        assert!(!name.contains('/'));
    }
}
