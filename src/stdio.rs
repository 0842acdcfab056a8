use crate::{
    error::{Error, Result},
    pidfile,
    sink::{LogSink, Severity},
};

use log::{debug, warn};
use nix::{
    fcntl::{self, OFlag},
    libc,
    sys::stat::Mode,
    unistd::{self, Pid, dup2_stderr, dup2_stdin, dup2_stdout},
};
use std::{
    fs::File,
    io::{self, BufRead, BufReader, Write},
    mem,
    os::fd::OwnedFd,
    path::Path,
    sync::{
        Arc, Mutex, MutexGuard, Once, PoisonError,
        mpsc::{self, Receiver, RecvTimeoutError},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

const DEV_NULL: &str = "/dev/null";

/// How long to wait for a forwarding thread to pass on what is left in its
/// pipe. Children that inherited the stream can keep the pipe open forever.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Forwarding threads started by this process.
static FORWARDERS: Mutex<Vec<Forwarder>> = Mutex::new(Vec::new());

static DRAIN_AT_EXIT: Once = Once::new();

struct Forwarder {
    pid: Pid,
    stream: Stream,
    thread: JoinHandle<()>,
    /// Disconnects when the thread has forwarded its last line.
    done: Receiver<()>,
}

enum Rw {
    ReadOnly,
    WriteOnly,
}

use Rw::*;

#[derive(Clone, Copy, Debug)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn name(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }

    fn severity(self) -> Severity {
        match self {
            Self::Stdout => Severity::Info,
            Self::Stderr => Severity::Err,
        }
    }

    fn replace(self, fd: OwnedFd) -> nix::Result<()> {
        match self {
            Self::Stdout => {
                let _ = io::stdout().flush();
                dup2_stdout(fd)
            }
            Self::Stderr => dup2_stderr(fd),
        }
    }

    fn error(self, source: io::Error) -> Error {
        Error::Redirect {
            stream: self.name(),
            source,
        }
    }
}

/// Where standard output and standard error should go.
#[derive(Debug)]
pub(crate) struct Outputs<'a> {
    pub name: &'a str,
    pub stdout: Option<&'a Path>,
    pub stderr: Option<&'a Path>,
    pub debug: Option<&'a Path>,
    /// The sink to tie streams without an explicit path to, if any.
    pub sink: Option<Arc<dyn LogSink>>,
}

pub(crate) fn redirect(outputs: &Outputs<'_>) -> Result<()> {
    redirect_stdin()?;

    for (stream, path) in [
        (Stream::Stdout, outputs.stdout),
        (Stream::Stderr, outputs.stderr),
    ] {
        match (path, &outputs.sink) {
            (Some(path), _) => redirect_to_file(stream, path)?,
            (None, Some(sink)) => tie(stream, outputs.name, Arc::clone(sink))?,
            (None, None) => discard(stream, outputs.debug)?,
        }
    }

    Ok(())
}

fn redirect_stdin() -> Result<()> {
    open(Path::new(DEV_NULL), ReadOnly)
        .and_then(|fd| dup2_stdin(fd).map_err(io::Error::from))
        .map_err(|source| Error::Redirect {
            stream: "stdin",
            source,
        })
}

fn redirect_to_file(stream: Stream, path: &Path) -> Result<()> {
    open(path, WriteOnly)
        .and_then(|fd| stream.replace(fd).map_err(io::Error::from))
        .map_err(|err| {
            stream.error(io::Error::new(
                err.kind(),
                format!("'{}': {err}", path.display()),
            ))
        })?;

    debug!("{} redirected to '{}'", stream.name(), path.display());

    Ok(())
}

fn discard(stream: Stream, debug: Option<&Path>) -> Result<()> {
    redirect_to_file(stream, debug.unwrap_or(Path::new(DEV_NULL)))
}

/// Replaces the stream with a pipe whose lines are forwarded to `sink`.
fn tie(stream: Stream, name: &str, sink: Arc<dyn LogSink>) -> Result<()> {
    let (read, write) = unistd::pipe().map_err(|err| stream.error(err.into()))?;

    pidfile::set_cloexec(&read, true).map_err(|err| stream.error(err.into()))?;

    let reader = BufReader::new(File::from(read));
    let severity = stream.severity();
    let (finished, done) = mpsc::channel::<()>();

    let thread = thread::Builder::new()
        .name(format!("{name}-{}", stream.name()))
        .spawn(move || {
            forward(reader, sink.as_ref(), severity);
            drop(finished);
        })
        .map_err(|err| stream.error(err))?;

    stream.replace(write).map_err(|err| stream.error(err.into()))?;

    forwarders().push(Forwarder {
        pid: unistd::getpid(),
        stream,
        thread,
        done,
    });

    DRAIN_AT_EXIT.call_once(|| {
        // SAFETY: `drain_at_exit` is a plain function that never unwinds.
        if unsafe { libc::atexit(drain_at_exit) } != 0 {
            warn!("failed to register output drain at exit");
        }
    });

    debug!("{} tied to log sink as '{name}'", stream.name());

    Ok(())
}

fn forwarders() -> MutexGuard<'static, Vec<Forwarder>> {
    FORWARDERS.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Points tied streams at `/dev/null` and waits for their forwarding threads
/// to pass the remaining output on to the sink.
///
/// Returns true if any stream was tied.
pub(crate) fn drain() -> bool {
    let tied = mem::take(&mut *forwarders());

    if tied.is_empty() {
        return false;
    }

    let _ = io::stdout().flush();
    let pid = unistd::getpid();

    for forwarder in tied {
        // Threads of a parent process do not exist in a forked child.
        if forwarder.pid != pid {
            mem::forget(forwarder.thread);
            continue;
        }

        let stream = forwarder.stream;

        // The pipe reaches end of file once the stream lets go of its
        // write end.
        if let Err(err) = open(Path::new(DEV_NULL), WriteOnly)
            .and_then(|fd| stream.replace(fd).map_err(io::Error::from))
        {
            warn!("failed to detach {}: {err}", stream.name());
            continue;
        }

        match forwarder.done.recv_timeout(DRAIN_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = forwarder.thread.join();
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("{} is still held open elsewhere", stream.name());
            }
        }
    }

    true
}

extern "C" fn drain_at_exit() {
    drain();
}

fn forward<R: BufRead>(mut reader: R, sink: &dyn LogSink, severity: Severity) {
    let mut buf = Vec::new();

    loop {
        buf.clear();

        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);

                // There is nowhere left to report a failing sink.
                let _ = sink.write_line(line, severity);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

fn open(file: &Path, rw: Rw) -> io::Result<OwnedFd> {
    let flags = match rw {
        ReadOnly => OFlag::O_RDONLY,
        WriteOnly => OFlag::O_WRONLY | OFlag::O_APPEND,
    };

    fcntl::open(
        file,
        flags | OFlag::O_CREAT,
        Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IWGRP,
    )
    .map_err(io::Error::from)
}
