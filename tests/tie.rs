mod support;

use support::*;

use daemonix::{
    DaemonConfig,
    sink::{FileSink, LogSink},
};
use std::{
    fs,
    io::{self, Write},
    process::exit,
    sync::Arc,
};

const CHILDREN: usize = 10;

#[test]
fn tied_output_survives_exit() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = dir.path().canonicalize().unwrap();

    for i in 0..CHILDREN {
        let log = workdir.join(format!("sink-{i}.log"));

        let child = spawn(|| {
            let sink: Arc<dyn LogSink> = match FileSink::open(&log) {
                Ok(sink) => Arc::new(sink),
                Err(_) => exit(EXIT_NEW),
            };

            let config = DaemonConfig::new()
                .name("tied")
                .chdir(Some(&workdir))
                .fork_count(0)
                .log_sink(Some(sink));

            let _daemon = daemonize(config);

            // Written straight to the descriptors, past the harness's
            // output capture.
            let _ = writeln!(io::stdout(), "last words {i}");
            let _ = writeln!(io::stderr(), "fatal: child {i} failed");

            exit(1);
        });

        assert_eq!(1, wait_exit(child));

        let lines = fs::read_to_string(&log).unwrap();

        assert!(lines.contains(&format!("info: last words {i}\n")), "{lines:?}");
        assert!(
            lines.contains(&format!("err: fatal: child {i} failed\n")),
            "{lines:?}"
        );
    }
}
