use clap::Parser;
use daemonix::{DaemonConfig, Daemonizer, Privileges};
use std::{
    ffi::OsString,
    path::PathBuf,
    process::ExitCode,
    thread,
    time::Duration,
};

/// Starts a server that prints a heartbeat every few seconds
///
/// Sending the restart signal (SIGHUP by default) makes the server re-execute
/// itself with an incremented generation number, keeping its pidfile locked
/// throughout. Output goes to the system log unless --stdout or --stderr are
/// given.
#[derive(Debug, Parser)]
#[command(max_term_width = 80)]
struct Cli {
    /// Run the server as a daemon process
    #[arg(short, long)]
    daemon: bool,

    /// Daemon process owner and optional group
    #[arg(short, long, value_name = "OWNER:[GROUP]", requires = "daemon")]
    user: Option<String>,

    /// Daemon working directory
    #[arg(short = 'w', long, value_name = "DIRECTORY", default_value = "/")]
    workdir: PathBuf,

    /// Path to the pidfile
    #[arg(short, long, value_name = "FILE")]
    pidfile: Option<PathBuf>,

    /// File receiving standard output
    #[arg(long, value_name = "FILE")]
    stdout: Option<PathBuf>,

    /// File receiving standard error
    #[arg(long, value_name = "FILE")]
    stderr: Option<PathBuf>,

    /// Signals that trigger a restart
    #[arg(long, value_name = "SIGNAL", default_value = "HUP")]
    restart_signal: Vec<String>,

    /// Seconds between heartbeats
    #[arg(long, value_name = "SECONDS", default_value_t = 5)]
    interval: u64,

    /// Number of restarts that led to this process
    #[arg(long, hide = true, default_value_t = 0)]
    generation: u32,
}

impl Cli {
    fn config(&self) -> DaemonConfig {
        DaemonConfig::new()
            .name("heartbeat")
            .fork_count(if self.daemon { 2 } else { 0 })
            .privileges(self.user.as_deref().map(Privileges::from))
            .chdir(Some(&self.workdir))
            .pidfile(self.pidfile.as_ref())
            .stdout(self.stdout.as_ref())
            .stderr(self.stderr.as_ref())
            .tie(self.daemon || self.generation > 0)
            .restart_signals(self.restart_signal.iter().cloned())
    }

    // The next image is already detached and must not fork again.
    fn restart_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--workdir".into(),
            self.workdir.clone().into(),
            "--interval".into(),
            self.interval.to_string().into(),
            "--generation".into(),
            (self.generation + 1).to_string().into(),
        ];

        for (flag, path) in [
            ("--pidfile", &self.pidfile),
            ("--stdout", &self.stdout),
            ("--stderr", &self.stderr),
        ] {
            if let Some(path) = path {
                args.push(flag.into());
                args.push(path.clone().into());
            }
        }

        for signal in &self.restart_signal {
            args.push("--restart-signal".into());
            args.push(signal.into());
        }

        args
    }
}

fn main() -> ExitCode {
    daemonix::argv::capture();

    let cli = Cli::parse();

    let mut daemon = match Daemonizer::new(cli.config()) {
        Ok(daemon) => daemon,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = daemon.daemonize() {
        if err.is_already_running() {
            eprintln!("{}: already running", daemon.name());
            return ExitCode::SUCCESS;
        }

        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    println!(
        "server process started: pid {}, generation {}",
        daemon.pid(),
        cli.generation
    );

    let mut beat = 0u64;

    loop {
        if daemon.restart_requested() {
            println!("restart requested");
            daemon.restart_or_exit(Some(cli.restart_args()));
        }

        beat += 1;
        println!("heartbeat {beat}");

        thread::sleep(Duration::from_secs(cli.interval));
    }
}
