mod support;

use support::*;

use std::{
    fs,
    io::{self, Write},
    path::Path,
    process::exit,
};

fn write_and_exit(config: daemonix::DaemonConfig, line: &str) -> ! {
    let _daemon = daemonize(config);

    let _ = writeln!(io::stderr(), "{line}");
    exit(0);
}

#[test]
fn discarded_output_goes_to_debug_file() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().canonicalize().unwrap();
    let debug = workdir.join("debug.out");

    let base = || {
        daemonix::DaemonConfig::new()
            .name("discard")
            .chdir(Some(&workdir))
            .fork_count(0)
            .debug(Some(&debug))
    };

    // Untied output is discarded into the debug file.
    let child = spawn(|| write_and_exit(base().tie(false), "untied line"));
    assert_eq!(0, wait_exit(child));

    // A log file that cannot be opened leaves tied output discarded too,
    // without failing daemonization.
    let unusable = workdir.join("missing").join("sink.log");
    let child = spawn(|| {
        write_and_exit(base().log_file(Some(&unusable)), "degraded line")
    });
    assert_eq!(0, wait_exit(child));

    let content = fs::read_to_string(&debug).unwrap();
    assert_eq!("untied line\ndegraded line\n", content);
    assert!(!Path::new(&unusable).exists());
}
