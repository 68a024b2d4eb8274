//! tty (teletype) for user-system interaction
//!
//! Bridges the stdio of the host to a container process, either over three pipes or over a
//! pseudo terminal whose master is received from the container through a unix socket.
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::termios::{self, OutputFlags, SetArg, Termios};
use nix::unistd::{fchown, pipe, pipe2, Gid, Uid};

use crate::fd::{recv_fd, ProtocolError};
use crate::process::Process;

const CONSOLE: Token = Token(0);
const SHUTDOWN: Token = Token(1);
const INTERRUPT: Token = Token(2);
const BUF_SIZE: usize = 32 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TtyError {
    #[error("failed to create pipe")]
    Pipe(#[source] nix::Error),
    #[error("failed to change owner of stdio pipes to {uid}:{gid}")]
    Chown {
        uid: u32,
        gid: u32,
        source: nix::Error,
    },
    #[error("failed to duplicate descriptor")]
    Dup(#[source] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("not a terminal")]
    NotAConsole,
    #[error("unable to get console")]
    Console(#[source] nix::Error),
    #[error("failed to open /dev/tty")]
    OpenTty(#[source] io::Error),
    #[error("failed to clear ONLCR on the console")]
    ClearOnlcr(#[source] nix::Error),
    #[error("failed to make the console non-blocking")]
    NonBlocking(#[source] nix::Error),
    #[error("failed to set up console poller")]
    Poller(#[source] io::Error),
    #[error("failed to set the terminal from the stdin to raw mode")]
    SetRaw(#[source] nix::Error),
    #[error("failed to resize the console")]
    Resize(#[source] io::Error),
    #[error("failed to install the SIGINT handler")]
    SignalHandler(#[source] nix::Error),
    #[error("SIGINT is already handled by another session")]
    InterruptBusy,
    #[error("failed to spawn {name} worker")]
    Spawn { name: &'static str, source: io::Error },
}

type Result<T> = std::result::Result<T, TtyError>;

/// The streams of the host the container process is connected to.
pub struct HostStdio {
    pub stdin: Box<dyn Read + Send>,
    pub stdout: Box<dyn Write + Send>,
    pub stderr: Box<dyn Write + Send>,
}

/// A descriptor shared with copy workers that can be closed while a worker still holds it.
#[derive(Debug, Clone)]
struct SharedFile(Arc<Mutex<Option<File>>>);

impl SharedFile {
    fn new(file: File) -> Self {
        Self(Arc::new(Mutex::new(Some(file))))
    }

    fn with<R>(&self, f: impl FnOnce(&File) -> io::Result<R>) -> io::Result<R> {
        let guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(file) => f(file),
            None => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        }
    }

    fn close(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// Terminal the runtime was started from, with the attributes to restore.
#[derive(Debug)]
pub struct HostConsole {
    fd: OwnedFd,
    original: Termios,
}

impl HostConsole {
    pub fn from_fd<Fd: AsFd>(fd: Fd) -> Result<Self> {
        let original = match termios::tcgetattr(&fd) {
            Ok(original) => original,
            Err(Errno::ENOTTY) | Err(Errno::EINVAL) => return Err(TtyError::NotAConsole),
            Err(err) => return Err(TtyError::Console(err)),
        };
        let fd = fd.as_fd().try_clone_to_owned().map_err(TtyError::Dup)?;
        Ok(Self { fd, original })
    }

    fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            fd: self.fd.try_clone().map_err(TtyError::Dup)?,
            original: self.original.clone(),
        })
    }

    pub fn set_raw(&self) -> Result<()> {
        let mut raw = self.original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&self.fd, SetArg::TCSANOW, &raw).map_err(TtyError::SetRaw)
    }

    pub fn reset(&self) -> nix::Result<()> {
        termios::tcsetattr(&self.fd, SetArg::TCSANOW, &self.original)
    }
}

/// Finds the terminal of the host. Any of the stdio streams may be redirected, so all are
/// tried before falling back to the controlling terminal.
pub fn init_host_console() -> Result<HostConsole> {
    let stderr = io::stderr();
    let stdout = io::stdout();
    let stdin = io::stdin();
    for fd in [stderr.as_fd(), stdout.as_fd(), stdin.as_fd()] {
        match HostConsole::from_fd(fd) {
            Ok(console) => return Ok(console),
            Err(TtyError::NotAConsole) => continue,
            Err(err) => return Err(err),
        }
    }

    let tty = File::options()
        .read(true)
        .write(true)
        .open("/dev/tty")
        .map_err(TtyError::OpenTty)?;
    HostConsole::from_fd(&tty)
}

/// Connects the process to the stdio of the caller.
pub fn inherit_stdio(process: &mut Process) -> Result<()> {
    process.stdin = Some(dup(io::stdin().as_fd())?);
    process.stdout = Some(dup(io::stdout().as_fd())?);
    process.stderr = Some(dup(io::stderr().as_fd())?);
    Ok(())
}

fn dup<Fd: AsFd>(fd: Fd) -> Result<OwnedFd> {
    fd.as_fd().try_clone_to_owned().map_err(TtyError::Dup)
}

struct PtyConsole {
    file: SharedFile,
    fd: RawFd,
    waker: Waker,
}

type Worker = JoinHandle<io::Result<()>>;

/// Copies between the host and a container process until [`Tty::close`].
#[derive(Default)]
pub struct Tty {
    console: Option<PtyConsole>,
    host_console: Option<HostConsole>,
    closers: Vec<SharedFile>,
    post_start: Vec<OwnedFd>,
    workers: Vec<Worker>,
    interrupt: Option<InterruptHandler>,
}

impl Tty {
    /// A bridge that puts `host_console` in raw mode once a console arrives, usually the one
    /// found by [`init_host_console`].
    pub fn with_host_console(host_console: HostConsole) -> Self {
        Self {
            host_console: Some(host_console),
            ..Default::default()
        }
    }

    /// Connects the process to three fresh pipes owned by `root_uid`:`root_gid`, so that a
    /// process in a user namespace can open them. All descriptors are closed again if any
    /// step fails.
    pub fn setup_process_pipes(
        process: &mut Process,
        root_uid: u32,
        root_gid: u32,
        host: HostStdio,
    ) -> Result<Self> {
        let (stdin_r, stdin_w) = pipe().map_err(TtyError::Pipe)?;
        let (stdout_r, stdout_w) = pipe().map_err(TtyError::Pipe)?;
        let (stderr_r, stderr_w) = pipe().map_err(TtyError::Pipe)?;

        for fd in [&stdin_r, &stdin_w, &stdout_r, &stdout_w, &stderr_r, &stderr_w] {
            fchown(
                fd.as_raw_fd(),
                Some(Uid::from_raw(root_uid)),
                Some(Gid::from_raw(root_gid)),
            )
            .map_err(|err| TtyError::Chown {
                uid: root_uid,
                gid: root_gid,
                source: err,
            })?;
        }

        let child_stdin = dup(&stdin_r)?;
        let child_stdout = dup(&stdout_w)?;
        let child_stderr = dup(&stderr_w)?;
        process.stdin = Some(child_stdin);
        process.stdout = Some(child_stdout);
        process.stderr = Some(child_stderr);

        let mut tty = Tty {
            post_start: vec![stdin_r, stdout_w, stderr_w],
            ..Default::default()
        };

        let stdin = SharedFile::new(File::from(stdin_w));
        tty.closers.push(stdin.clone());

        let HostStdio {
            stdin: host_stdin,
            stdout: host_stdout,
            stderr: host_stderr,
        } = host;

        // not waited for, it only ends once the host stdin does
        spawn("stdin", move || {
            let result = copy_into(host_stdin, &stdin, None);
            stdin.close();
            result
        })?;
        tty.workers.push(spawn("stdout", move || {
            copy_pipe(File::from(stdout_r), host_stdout)
        })?);
        tty.workers.push(spawn("stderr", move || {
            copy_pipe(File::from(stderr_r), host_stderr)
        })?);

        Ok(tty)
    }

    /// Receives the pty master of the container over `socket` and starts proxying it to the
    /// host stdio.
    pub fn recv_tty<S: AsRawFd>(&mut self, socket: &S, host: HostStdio) -> Result<()> {
        let received = recv_fd(socket)?;
        tracing::debug!(name = %received.name, "received console");
        let console = received.fd;

        let mut attrs = termios::tcgetattr(&console).map_err(TtyError::ClearOnlcr)?;
        attrs.output_flags.remove(OutputFlags::ONLCR);
        termios::tcsetattr(&console, SetArg::TCSANOW, &attrs).map_err(TtyError::ClearOnlcr)?;

        let fd = console.as_raw_fd();
        let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(TtyError::NonBlocking)?;
        fcntl(
            fd,
            FcntlArg::F_SETFL(OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK),
        )
        .map_err(TtyError::NonBlocking)?;

        let poll = Poll::new().map_err(TtyError::Poller)?;
        poll.registry()
            .register(&mut SourceFd(&fd), CONSOLE, Interest::READABLE)
            .map_err(TtyError::Poller)?;
        let waker = Waker::new(poll.registry(), SHUTDOWN).map_err(TtyError::Poller)?;

        let file = SharedFile::new(File::from(console));
        let HostStdio {
            stdin: host_stdin,
            stdout: host_stdout,
            ..
        } = host;

        let writer = file.clone();
        spawn("console stdin", move || {
            let writable = Poll::new()?;
            writable
                .registry()
                .register(&mut SourceFd(&fd), CONSOLE, Interest::WRITABLE)?;
            copy_into(host_stdin, &writer, Some(writable))
        })?;
        let reader = file.clone();
        self.workers.push(spawn("console stdout", move || {
            copy_console(&reader, host_stdout, poll)
        })?);

        self.closers = vec![file.clone()];
        self.console = Some(PtyConsole { file, fd, waker });

        if let Some(host_console) = &self.host_console {
            let console = host_console.try_clone()?;
            self.interrupt = Some(InterruptHandler::install(move || {
                if let Err(err) = console.reset() {
                    tracing::warn!(%err, "failed to reset host terminal");
                }
                std::process::exit(0);
            })?);
            host_console.set_raw()?;
        }

        Ok(())
    }

    /// Closes our copies of the descriptors handed to the process. Call once it started.
    pub fn close_post_start(&mut self) {
        self.post_start.clear();
    }

    /// Closes all descriptors of the bridge and restores the host terminal. Pending output is
    /// copied before the console is closed.
    pub fn close(&mut self) {
        self.post_start.clear();

        if let Some(console) = &self.console {
            if let Err(err) = console.waker.wake() {
                tracing::warn!(%err, "failed to shut down console");
            }
        }

        for worker in self.workers.drain(..) {
            match worker.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(%err, "stdio copy failed"),
                Err(_) => tracing::warn!("stdio copy worker panicked"),
            }
        }

        for closer in self.closers.drain(..) {
            closer.close();
        }
        self.console = None;

        if let Some(host_console) = self.host_console.take() {
            if let Err(err) = host_console.reset() {
                tracing::warn!(%err, "failed to reset host terminal");
            }
        }
        // only once the terminal is restored
        drop(self.interrupt.take());
    }

    /// Copies the window size of the host terminal to the console.
    pub fn resize(&self) -> Result<()> {
        let (console, host_console) = match (&self.console, &self.host_console) {
            (Some(console), Some(host_console)) => (console, host_console),
            _ => return Ok(()),
        };

        let mut ws = libc::winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: both descriptors are open and `ws` outlives the calls.
        if unsafe { libc::ioctl(host_console.fd.as_raw_fd(), libc::TIOCGWINSZ, &mut ws) } < 0 {
            return Err(TtyError::Resize(io::Error::last_os_error()));
        }
        console
            .file
            .with(|_| {
                if unsafe { libc::ioctl(console.fd, libc::TIOCSWINSZ, &ws) } < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            })
            .map_err(TtyError::Resize)
    }
}

fn spawn<F>(name: &'static str, f: F) -> Result<Worker>
where
    F: FnOnce() -> io::Result<()> + Send + 'static,
{
    thread::Builder::new()
        .name(format!("tty-{name}"))
        .spawn(f)
        .map_err(|err| TtyError::Spawn { name, source: err })
}

// write end of the pipe the SIGINT handler reports to, -1 while no session handles SIGINT
static INTERRUPT_PIPE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn report_interrupt(_: libc::c_int) {
    let fd = INTERRUPT_PIPE.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = [1u8];
        // SAFETY: write(2) is async-signal-safe and `byte` outlives the call.
        unsafe { libc::write(fd, byte.as_ptr().cast(), 1) };
    }
}

/// Process wide SIGINT handler of a console session. The signal handler only writes to a
/// pipe, `on_interrupt` runs on a worker polling that pipe.
struct InterruptHandler {
    previous: SigAction,
    waker: Waker,
    worker: Option<Worker>,
    // keeps the descriptor stored in INTERRUPT_PIPE open
    _pipe: OwnedFd,
}

impl InterruptHandler {
    fn install<F>(on_interrupt: F) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let (read_end, write_end) =
            pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).map_err(TtyError::Pipe)?;
        if INTERRUPT_PIPE
            .compare_exchange(-1, write_end.as_raw_fd(), Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TtyError::InterruptBusy);
        }

        match Self::start(read_end, on_interrupt) {
            Ok((waker, worker, previous)) => Ok(Self {
                previous,
                waker,
                worker: Some(worker),
                _pipe: write_end,
            }),
            Err(err) => {
                INTERRUPT_PIPE.store(-1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn start<F>(read_end: OwnedFd, on_interrupt: F) -> Result<(Waker, Worker, SigAction)>
    where
        F: FnOnce() + Send + 'static,
    {
        let poll = Poll::new().map_err(TtyError::Poller)?;
        poll.registry()
            .register(
                &mut SourceFd(&read_end.as_raw_fd()),
                INTERRUPT,
                Interest::READABLE,
            )
            .map_err(TtyError::Poller)?;
        let waker = Waker::new(poll.registry(), SHUTDOWN).map_err(TtyError::Poller)?;
        let worker = spawn("interrupt", move || {
            wait_interrupt(poll, read_end, on_interrupt)
        })?;

        let action = SigAction::new(
            SigHandler::Handler(report_interrupt),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        // SAFETY: the handler only loads an atomic and writes to a pipe.
        match unsafe { sigaction(Signal::SIGINT, &action) } {
            Ok(previous) => Ok((waker, worker, previous)),
            Err(err) => {
                stop_worker(&waker, worker);
                Err(TtyError::SignalHandler(err))
            }
        }
    }
}

impl Drop for InterruptHandler {
    /// Restores the SIGINT disposition found at install time and stops the worker.
    fn drop(&mut self) {
        // SAFETY: `previous` was returned by sigaction for the same signal.
        if let Err(err) = unsafe { sigaction(Signal::SIGINT, &self.previous) } {
            tracing::warn!(%err, "failed to restore SIGINT disposition");
        }
        INTERRUPT_PIPE.store(-1, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            stop_worker(&self.waker, worker);
        }
    }
}

fn stop_worker(waker: &Waker, worker: Worker) {
    if let Err(err) = waker.wake() {
        tracing::warn!(%err, "failed to wake interrupt worker");
        return;
    }
    match worker.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::warn!(%err, "interrupt worker failed"),
        Err(_) => tracing::warn!("interrupt worker panicked"),
    }
}

fn wait_interrupt<F: FnOnce()>(mut poll: Poll, _pipe: OwnedFd, on_interrupt: F) -> io::Result<()> {
    let mut events = Events::with_capacity(2);
    loop {
        if let Err(err) = poll.poll(&mut events, None) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if events.iter().any(|event| event.token() == SHUTDOWN) {
            return Ok(());
        }
        if events.iter().any(|event| event.token() == INTERRUPT) {
            on_interrupt();
            return Ok(());
        }
    }
}

fn copy_pipe(mut from: File, mut to: Box<dyn Write + Send>) -> io::Result<()> {
    io::copy(&mut from, &mut to)?;
    to.flush()
}

/// Copies `from` into `to`. When `to` is non-blocking, `writable` is polled for room.
fn copy_into(
    mut from: Box<dyn Read + Send>,
    to: &SharedFile,
    mut writable: Option<Poll>,
) -> io::Result<()> {
    let mut events = Events::with_capacity(4);
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = match from.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };

        let mut data = &buf[..n];
        while !data.is_empty() {
            match to.with(|mut file| file.write(data)) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(written) => data = &data[written..],
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => match writable.as_mut() {
                    Some(poll) => poll.poll(&mut events, None)?,
                    None => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
    }
}

/// Copies console output to `to` until the console hangs up or shutdown is requested. Output
/// that is already buffered is copied before a shutdown takes effect.
fn copy_console(
    from: &SharedFile,
    mut to: Box<dyn Write + Send>,
    mut poll: Poll,
) -> io::Result<()> {
    let mut events = Events::with_capacity(8);
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        if let Err(err) = poll.poll(&mut events, None) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        let shutdown = events.iter().any(|event| event.token() == SHUTDOWN);

        loop {
            match from.with(|mut file| file.read(&mut buf)) {
                Ok(0) => return to.flush(),
                Ok(n) => to.write_all(&buf[..n])?,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                // the other side of the pty is gone
                Err(err) if err.raw_os_error() == Some(libc::EIO) => return to.flush(),
                Err(err) => return Err(err),
            }
        }
        to.flush()?;

        if shutdown {
            return Ok(());
        }
    }
}
