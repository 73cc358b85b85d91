//! # Sandbox Runner
//!
//! Runs a single test body in an isolated child process: stdio is
//! redirected through pipes, a listening socket carries the result back,
//! fatal signals are trapped and reported, and a timeout escalates to
//! `SIGKILL` if the child never answers.
//!
//! The child's result is framed as either a `COMPLETE` payload (packed by
//! the caller), an `ERROR` payload (a panic's message), or — for signals,
//! which cannot safely go through the ordinary codec — a fixed five-byte
//! `SIGNAL_TRAP` record written with a raw `libc::write` from inside the
//! handler, since a signal handler must stay async-signal-safe and cannot
//! take the tracker's mutex or allocate.

use crate::transport::{Listener, Transport};
use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::os::fd::{AsRawFd, RawFd};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

const TAG_COMPLETE: u8 = 0;
const TAG_ERROR: u8 = 1;
const TAG_SIGNAL_TRAP: u8 = 2;

/// Outcome of one sandboxed run, before the caller unpacks a `Complete`
/// payload into its own result type.
pub enum Outcome {
    Complete(Vec<u8>),
    Error(String),
    Timeout,
}

pub struct SandboxOptions {
    pub fork: bool,
    pub input_bytes: Vec<u8>,
    pub timeout: Duration,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        SandboxOptions { fork: true, input_bytes: Vec::new(), timeout: Duration::from_secs(30) }
    }
}

pub struct SandboxResult {
    pub outcome: Outcome,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Run `body` in a sandbox per `options`, returning its framed result.
///
/// `body` must pack its own success payload (the caller decides the
/// `COMPLETE` wire shape); a panic inside `body` is caught and reported as
/// `Error` with the panic's message.
pub fn run_sandboxed<F>(body: F, options: SandboxOptions) -> Result<SandboxResult>
where
    F: FnOnce() -> Result<Vec<u8>> + Send + 'static,
{
    let mut listener = Listener::bind_ephemeral().context("bind sandbox result listener")?;
    let addr = listener.local_addr()?;

    let stdio = StdioRedirect::install(&options.input_bytes)?;

    if !options.fork {
        // In-process execution: still redirect stdio and connect a loopback
        // client so the receive path is identical to the forked case.
        let result = run_body_in_process(body, addr);
        let captured = stdio.restore();
        return Ok(SandboxResult { outcome: result?, stdout: captured.0, stderr: captured.1 });
    }

    // SAFETY: fork() is inherently unsafe — no locks may be held across it
    // that the child might need, and the child must not touch Rust runtime
    // state that assumes a single process. We fork before spawning any
    // extra threads in the child and the child's only job from here is to
    // run `body` and report, then exit.
    match unsafe { fork() }.context("fork")? {
        ForkResult::Child => {
            install_signal_handlers();
            let exit_code = run_body_in_child(body, addr);
            // Async-signal-safe exit: never unwind back through the parent's
            // Rust runtime state in a forked child.
            unsafe { libc::_exit(exit_code) };
        }
        ForkResult::Parent { child } => {
            let deadline = Instant::now() + options.timeout.max(Duration::from_secs(2));
            let outcome = wait_for_result(&mut listener, child, deadline)?;
            let captured = stdio.restore();
            Ok(SandboxResult { outcome, stdout: captured.0, stderr: captured.1 })
        }
    }
}

fn run_body_in_process(body: impl FnOnce() -> Result<Vec<u8>>, addr: std::net::SocketAddr) -> Result<Outcome> {
    let result = catch_unwind(AssertUnwindSafe(body));
    let mut client = Transport::connect(addr)?;
    match result {
        Ok(Ok(payload)) => {
            write_frame(&mut client, TAG_COMPLETE, &payload)?;
            Ok(Outcome::Complete(payload))
        }
        Ok(Err(e)) => {
            let msg = format!("{e:#}");
            write_frame(&mut client, TAG_ERROR, msg.as_bytes())?;
            Ok(Outcome::Error(msg))
        }
        Err(payload) => {
            let msg = panic_message(&payload);
            write_frame(&mut client, TAG_ERROR, msg.as_bytes())?;
            Ok(Outcome::Error(msg))
        }
    }
}

fn run_body_in_child(body: impl FnOnce() -> Result<Vec<u8>>, addr: std::net::SocketAddr) -> i32 {
    let mut client = match Transport::connect(addr) {
        Ok(c) => c,
        Err(_) => return 3,
    };
    set_signal_target(client.as_raw_fd());
    let result = catch_unwind(AssertUnwindSafe(body));
    match result {
        Ok(Ok(payload)) => {
            let _ = write_frame(&mut client, TAG_COMPLETE, &payload);
            0
        }
        Ok(Err(e)) => {
            let msg = format!("{e:#}");
            let _ = write_frame(&mut client, TAG_ERROR, msg.as_bytes());
            1
        }
        Err(payload) => {
            let msg = panic_message(&payload);
            let _ = write_frame(&mut client, TAG_ERROR, msg.as_bytes());
            1
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

fn write_frame(transport: &mut Transport, tag: u8, payload: &[u8]) -> Result<()> {
    let mut framed = Vec::with_capacity(9 + payload.len());
    framed.push(tag);
    framed.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    framed.extend_from_slice(payload);
    transport.send(&framed)
}

fn read_frame(transport: &mut Transport) -> Result<(u8, Vec<u8>)> {
    let mut tag_buf = [0u8; 1];
    transport.recv_exact(&mut tag_buf)?;
    let tag = tag_buf[0];
    if tag == TAG_SIGNAL_TRAP {
        let mut rest = [0u8; 4];
        transport.recv_exact(&mut rest)?;
        let signum = i32::from_le_bytes(rest);
        return Ok((tag, signum.to_le_bytes().to_vec()));
    }
    let mut len_buf = [0u8; 8];
    transport.recv_exact(&mut len_buf)?;
    let len = u64::from_le_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    if len > 0 {
        transport.recv_exact(&mut payload)?;
    }
    Ok((tag, payload))
}

fn wait_for_result(listener: &mut Listener, child: Pid, deadline: Instant) -> Result<Outcome> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            kill_and_reap(child);
            return Ok(Outcome::Timeout);
        }
        let poll_slice = remaining.min(Duration::from_millis(200));
        match listener.poll_or_accept(poll_slice)? {
            Some(idx) => {
                let transport = listener.connection(idx);
                let frame = read_frame(transport);
                listener.dispose(idx);
                match frame {
                    Ok((TAG_COMPLETE, payload)) => {
                        reap_child(child);
                        return Ok(Outcome::Complete(payload));
                    }
                    Ok((TAG_ERROR, payload)) => {
                        reap_child(child);
                        return Ok(Outcome::Error(String::from_utf8_lossy(&payload).into_owned()));
                    }
                    Ok((TAG_SIGNAL_TRAP, payload)) => {
                        let signum = i32::from_le_bytes(payload.try_into().unwrap());
                        reap_child(child);
                        let name = Signal::try_from(signum).map(|s| s.to_string()).unwrap_or_else(|_| signum.to_string());
                        return Ok(Outcome::Error(format!("fatal signal: {name}")));
                    }
                    Ok((other, _)) => return Err(anyhow!("unexpected sandbox frame tag {other}")),
                    Err(e) => return Err(e),
                }
            }
            None => {
                // Nothing readable this round; if the child has already
                // exited without sending anything, report it as an error
                // rather than waiting out the full timeout.
                if let Ok(WaitStatus::Exited(_, code)) = waitpid(child, Some(WaitPidFlag::WNOHANG)) {
                    return Ok(Outcome::Error(format!("sandbox exited without a result (code {code})")));
                }
            }
        }
        if Instant::now() >= deadline {
            kill_and_reap(child);
            return Ok(Outcome::Timeout);
        }
    }
}

fn reap_child(child: Pid) {
    let _ = waitpid(child, None);
}

fn kill_and_reap(child: Pid) {
    let _ = nix::sys::signal::kill(child, Signal::SIGKILL);
    let _ = waitpid(child, None);
}

/// The connected fd a trapped signal writes its report to. Populated by
/// the child right after it connects back to the parent, before running
/// the test body, so the handler always has a valid target.
static SIGNAL_TARGET_FD: AtomicI32 = AtomicI32::new(-1);

fn install_signal_handlers() {
    // The socket used to report the trap is connected lazily by the body
    // runner; the handler writes to whatever fd is currently registered.
    // SIGKILL is deliberately not installed: it cannot be caught, so doing
    // so would be a silent no-op rather than the defense it looks like.
    for sig in [Signal::SIGSEGV, Signal::SIGABRT, Signal::SIGPIPE] {
        let action = SigAction::new(SigHandler::Handler(handle_fatal_signal), SaFlags::SA_NODEFER, SigSet::empty());
        unsafe { sigaction(sig, &action) }.expect("install signal handler");
    }
}

/// Register the fd a fatal-signal report should be written to. Call this
/// once the sandboxed child has connected its result socket.
pub fn set_signal_target(fd: RawFd) {
    SIGNAL_TARGET_FD.store(fd, Ordering::SeqCst);
}

extern "C" fn handle_fatal_signal(signum: i32) {
    let fd = SIGNAL_TARGET_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let mut frame = [0u8; 5];
        frame[0] = TAG_SIGNAL_TRAP;
        frame[1..5].copy_from_slice(&signum.to_le_bytes());
        unsafe {
            libc::write(fd, frame.as_ptr() as *const libc::c_void, frame.len());
        }
    }
    unsafe { libc::_exit(128 + signum) };
}

/// RAII stdio redirection: swaps fd 0/1/2 for pipes, feeds `input_bytes`
/// into the new stdin, and restores the originals (capturing whatever was
/// written) on [`restore`].
struct StdioRedirect {
    saved_stdin: RawFd,
    saved_stdout: RawFd,
    saved_stderr: RawFd,
    out_reader: os_pipe::PipeReader,
    err_reader: os_pipe::PipeReader,
}

impl StdioRedirect {
    fn install(input_bytes: &[u8]) -> Result<Self> {
        use std::io::Write as _;

        let saved_stdin = unsafe { libc::dup(0) };
        let saved_stdout = unsafe { libc::dup(1) };
        let saved_stderr = unsafe { libc::dup(2) };

        let (in_reader, mut in_writer) = os_pipe::pipe()?;
        in_writer.write_all(input_bytes)?;
        drop(in_writer);
        unsafe { libc::dup2(in_reader.as_raw_fd(), 0) };

        let (out_reader, out_writer) = os_pipe::pipe()?;
        unsafe { libc::dup2(out_writer.as_raw_fd(), 1) };
        drop(out_writer);

        let (err_reader, err_writer) = os_pipe::pipe()?;
        unsafe { libc::dup2(err_writer.as_raw_fd(), 2) };
        drop(err_writer);

        Ok(StdioRedirect { saved_stdin, saved_stdout, saved_stderr, out_reader, err_reader })
    }

    fn restore(self) -> (Vec<u8>, Vec<u8>) {
        use std::io::Read as _;

        unsafe {
            libc::dup2(self.saved_stdin, 0);
            libc::dup2(self.saved_stdout, 1);
            libc::dup2(self.saved_stderr, 2);
            libc::close(self.saved_stdin);
            libc::close(self.saved_stdout);
            libc::close(self.saved_stderr);
        }
        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut out_reader = self.out_reader;
        let mut err_reader = self.err_reader;
        let _ = out_reader.read_to_end(&mut out);
        let _ = err_reader.read_to_end(&mut err);
        (out, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_process_body_completes_successfully() {
        let result = run_sandboxed(
            || Ok(b"ok".to_vec()),
            SandboxOptions { fork: false, input_bytes: Vec::new(), timeout: Duration::from_secs(5) },
        )
        .unwrap();
        match result.outcome {
            Outcome::Complete(payload) => assert_eq!(payload, b"ok"),
            _ => panic!("expected Complete"),
        }
    }

    #[test]
    fn in_process_panic_is_reported_as_error() {
        let result = run_sandboxed(
            || panic!("boom"),
            SandboxOptions { fork: false, input_bytes: Vec::new(), timeout: Duration::from_secs(5) },
        )
        .unwrap();
        match result.outcome {
            Outcome::Error(msg) => assert_eq!(msg, "boom"),
            _ => panic!("expected Error"),
        }
    }

    #[test]
    fn forked_body_completes_and_is_reaped() {
        let result = run_sandboxed(
            || Ok(b"forked-ok".to_vec()),
            SandboxOptions { fork: true, input_bytes: Vec::new(), timeout: Duration::from_secs(5) },
        )
        .unwrap();
        match result.outcome {
            Outcome::Complete(payload) => assert_eq!(payload, b"forked-ok"),
            Outcome::Error(msg) => panic!("expected Complete, got Error({msg})"),
            Outcome::Timeout => panic!("expected Complete, got Timeout"),
        }
    }

    #[test]
    fn forked_body_exceeding_timeout_is_killed() {
        let result = run_sandboxed(
            || {
                std::thread::sleep(Duration::from_secs(30));
                Ok(Vec::new())
            },
            SandboxOptions { fork: true, input_bytes: Vec::new(), timeout: Duration::from_millis(300) },
        )
        .unwrap();
        assert!(matches!(result.outcome, Outcome::Timeout));
    }
}
