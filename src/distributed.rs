//! # Driver / Worker Contexts
//!
//! The distributed test protocol (C9, §4.9/§6). Two channels per worker
//! avoid head-of-line blocking: a persistent worker-initiated connection
//! used for lifecycle and rendezvous traffic headed *to* the driver
//! (`WORKER_STARTED`, `FINISHED_TEST`, `NOTIFY`, `USER_MESSAGE`), and a
//! fresh driver-initiated connection to each worker's own listener, made
//! once per message, used for traffic headed *to* the worker (`RUN_TEST`,
//! `NOTIFY`, `TERMINATE`, `USER_MESSAGE`). This is a structural
//! simplification of the original's user-socket/super-socket split —
//! grounded in the same goal (lifecycle traffic never queues behind a slow
//! rendezvous message) but split by direction instead of by message type,
//! since that maps more naturally onto one dedicated connection per worker.

use crate::codec::Buffer;
use crate::report::{duration_to_ns, PhaseDurations, TestReport, WorkerReport};
use crate::test::{Registry, Status, TestDescriptor};
use crate::tracker::{self, ResourceSnapshot};
use crate::transport::{Listener, Transport};
use anyhow::{anyhow, Context, Result};
use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
enum Opcode {
    Nop = 0,
    WorkerStarted = 1,
    RunTest = 2,
    FinishedTest = 3,
    Notify = 4,
    Terminate = 5,
    UserMessage = 6,
}

impl Opcode {
    fn from_u16(v: u16) -> Result<Self> {
        Ok(match v {
            0 => Opcode::Nop,
            1 => Opcode::WorkerStarted,
            2 => Opcode::RunTest,
            3 => Opcode::FinishedTest,
            4 => Opcode::Notify,
            5 => Opcode::Terminate,
            6 => Opcode::UserMessage,
            other => return Err(anyhow!("unknown opcode {other}")),
        })
    }
}

fn send_frame(transport: &mut Transport, opcode: Opcode, build: impl FnOnce(&mut Buffer)) -> Result<()> {
    let mut buf = Buffer::new();
    buf.write_u16(opcode as u16);
    build(&mut buf);
    transport.send(&buf.finish())
}

/// Blocking read of one length-prefixed frame.
fn recv_frame(transport: &mut Transport) -> Result<(Opcode, Buffer)> {
    let mut header = [0u8; 8];
    transport.recv_exact(&mut header)?;
    let total = u64::from_le_bytes(header) as usize;
    if total < 8 {
        return Err(anyhow!("frame shorter than its own header"));
    }
    let mut rest = vec![0u8; total - 8];
    if !rest.is_empty() {
        transport.recv_exact(&mut rest)?;
    }
    let mut full = header.to_vec();
    full.extend(rest);
    let mut buf = Buffer::from_received(full);
    let opcode = Opcode::from_u16(buf.read_u16()?)?;
    Ok((opcode, buf))
}

/// Non-blocking attempt to pull one complete frame out of `pending`,
/// topping it up from a non-blocking read first. `Ok(None)` means "not a
/// full frame yet", not "connection closed".
fn try_recv_frame(transport: &mut Transport, pending: &mut Vec<u8>) -> Result<Option<(Opcode, Buffer)>> {
    let mut chunk = [0u8; 4096];
    let n = transport.try_recv(&mut chunk)?;
    if n > 0 {
        pending.extend_from_slice(&chunk[..n]);
    }
    if pending.len() < 8 {
        return Ok(None);
    }
    let total = u64::from_le_bytes(pending[0..8].try_into().unwrap()) as usize;
    if pending.len() < total {
        return Ok(None);
    }
    let frame: Vec<u8> = pending.drain(0..total).collect();
    let mut buf = Buffer::from_received(frame);
    let opcode = Opcode::from_u16(buf.read_u16()?)?;
    Ok(Some((opcode, buf)))
}

fn status_to_code(s: Status) -> u8 {
    match s {
        Status::Pass => 0,
        Status::PassWithMemoryLeak => 1,
        Status::MemoryLimitExceeded => 2,
        Status::Skip => 3,
        Status::TooSlow => 4,
        Status::Timeout => 5,
        Status::Fail => 6,
        Status::Pending => 7,
    }
}

fn status_from_code(code: u8) -> Result<Status> {
    Ok(match code {
        0 => Status::Pass,
        1 => Status::PassWithMemoryLeak,
        2 => Status::MemoryLimitExceeded,
        3 => Status::Skip,
        4 => Status::TooSlow,
        5 => Status::Timeout,
        6 => Status::Fail,
        7 => Status::Pending,
        other => return Err(anyhow!("unknown status code {other}")),
    })
}

// ---------------------------------------------------------------- driver --

struct WorkerHandle {
    id: u32,
    child: std::process::Child,
    worker_listen_addr: SocketAddr,
    from_worker: Transport,
    from_worker_pending: Vec<u8>,
    /// Set once a `FINISHED_TEST` frame has been demultiplexed out of
    /// `from_worker` by [`pump_worker`], for [`try_recv_finished`] to claim.
    finished: Option<WorkerReport>,
}

/// Driver-side rendezvous state shared by every allocated worker: which
/// workers have sent `NOTIFY` since the last [`DriverContext::wait`], and
/// user messages forwarded from workers awaiting [`DriverContext::get_user_message`].
#[derive(Default)]
struct DriverShared {
    notified: HashSet<u32>,
    messages: VecDeque<Vec<u8>>,
}

struct WorkerPoolInner {
    workers: Vec<WorkerHandle>,
    super_listener: Listener,
    next_id: u32,
    driver_shared: Arc<Mutex<DriverShared>>,
}

/// Process-wide, lazily-initialized worker pool. Growth is monotonic
/// within one driver process: `ensure_workers` only ever spawns more,
/// never fewer, and the pool is torn down exclusively by
/// [`shutdown_workers`] at driver exit.
static POOL: OnceLock<Mutex<WorkerPoolInner>> = OnceLock::new();

fn pool() -> &'static Mutex<WorkerPoolInner> {
    POOL.get_or_init(|| {
        let super_listener = Listener::bind_ephemeral().expect("bind driver super socket");
        Mutex::new(WorkerPoolInner { workers: Vec::new(), super_listener, next_id: 1, driver_shared: Arc::new(Mutex::new(DriverShared::default())) })
    })
}

fn driver_shared_handle() -> Arc<Mutex<DriverShared>> {
    pool().lock().unwrap().driver_shared.clone()
}

fn ensure_workers(count: usize) -> Result<Vec<u32>> {
    let mut guard = pool().lock().unwrap();
    let super_addr = guard.super_listener.local_addr()?;

    while guard.workers.len() < count {
        let id = guard.next_id;
        guard.next_id += 1;
        let exe = std::env::current_exe().context("resolve current executable for worker spawn")?;
        let child = std::process::Command::new(exe)
            .arg("--dtest-worker")
            .arg("--worker-id")
            .arg(id.to_string())
            .arg("--driver-super-addr")
            .arg(super_addr.to_string())
            .spawn()
            .with_context(|| format!("spawn worker {id}"))?;

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut accepted = None;
        while Instant::now() < deadline {
            if let Some(idx) = guard.super_listener.poll_or_accept(Duration::from_millis(250))? {
                accepted = Some(guard.super_listener.dispose(idx));
                break;
            }
        }
        let mut from_worker = accepted.ok_or_else(|| anyhow!("worker {id} never connected"))?;
        let (opcode, mut payload) = recv_frame(&mut from_worker)?;
        if opcode != Opcode::WorkerStarted {
            return Err(anyhow!("expected WORKER_STARTED from worker {id}, got {opcode:?}"));
        }
        let reported_id = payload.read_u32()?;
        let port = payload.read_u16()?;
        if reported_id != id {
            warn!(expected = id, got = reported_id, "worker reported unexpected id");
        }
        let worker_listen_addr: SocketAddr = format!("127.0.0.1:{port}").parse()?;

        guard.workers.push(WorkerHandle { id, child, worker_listen_addr, from_worker, from_worker_pending: Vec::new(), finished: None });
        info!(worker_id = id, %worker_listen_addr, "worker ready");
    }

    Ok(guard.workers.iter().take(count).map(|w| w.id).collect())
}

fn send_to_worker(id: u32, opcode: Opcode, build: impl Fn(&mut Buffer)) -> Result<()> {
    let addr = {
        let guard = pool().lock().unwrap();
        let worker = guard.workers.iter().find(|w| w.id == id).ok_or_else(|| anyhow!("unknown worker {id}"))?;
        worker.worker_listen_addr
    };
    let mut transport = Transport::connect(addr)?;
    send_frame(&mut transport, opcode, |buf| build(buf))
}

fn broadcast_to_workers(ids: &[u32], opcode: Opcode, build: impl Fn(&mut Buffer)) -> Result<()> {
    for &id in ids {
        send_to_worker(id, opcode, &build)?;
    }
    Ok(())
}

/// Drain every complete frame currently buffered for `worker` without
/// blocking. `NOTIFY`/`USER_MESSAGE` update the shared barrier/FIFO state;
/// `FINISHED_TEST` is stashed on the handle for [`try_recv_finished`] to
/// claim — this is what lets rendezvous traffic and the terminal frame
/// share the same connection (§4.9).
fn pump_worker(worker: &mut WorkerHandle, shared: &Mutex<DriverShared>) -> Result<()> {
    while let Some((opcode, mut buf)) = try_recv_frame(&mut worker.from_worker, &mut worker.from_worker_pending)? {
        match opcode {
            Opcode::Notify => {
                shared.lock().unwrap().notified.insert(worker.id);
            }
            Opcode::UserMessage => {
                if let Ok(bytes) = buf.read_byte_string() {
                    let mut state = shared.lock().unwrap();
                    state.messages.push_back(bytes);
                    crate::test::warn_if_queue_too_deep("driver", state.messages.len());
                }
            }
            Opcode::FinishedTest => {
                let worker_id = buf.read_u32()?;
                let status = status_from_code(buf.read_u8()?)?;
                let errors_len = buf.read_u64()? as usize;
                let mut errors = Vec::with_capacity(errors_len);
                for _ in 0..errors_len {
                    errors.push(buf.read_str()?);
                }
                let worker_body_ns = buf.read_u64()?;
                let resources = crate::unit_test::unpack_snapshot(&mut buf)?;
                worker.finished = Some(WorkerReport { worker_id, status, resources, errors, worker_body_ns });
            }
            Opcode::Nop | Opcode::WorkerStarted | Opcode::RunTest | Opcode::Terminate => {}
        }
    }
    Ok(())
}

/// Pump every worker in `ids` once. Called both by the barrier/FIFO waits
/// on [`DriverContext`] and by [`try_recv_finished`], so no frame is ever
/// read by two different paths.
fn pump_workers(ids: &[u32], shared: &Mutex<DriverShared>) {
    let mut guard = pool().lock().unwrap();
    for &id in ids {
        if let Some(worker) = guard.workers.iter_mut().find(|w| w.id == id) {
            if let Err(e) = pump_worker(worker, shared) {
                warn!(worker_id = id, error = %e, "failed to pump worker connection");
            }
        }
    }
}

fn try_recv_finished(id: u32, shared: &Mutex<DriverShared>) -> Result<Option<WorkerReport>> {
    let mut guard = pool().lock().unwrap();
    let worker = guard.workers.iter_mut().find(|w| w.id == id).ok_or_else(|| anyhow!("unknown worker {id}"))?;
    pump_worker(worker, shared)?;
    Ok(worker.finished.take())
}

/// Wait for `FINISHED_TEST` from each of `ids`, in order. Each worker gets
/// its own share of the wall-clock budget so one slow worker can't starve
/// the poll of the others beyond the overall deadline.
fn join_workers(ids: &[u32], overall_timeout: Duration) -> Vec<WorkerReport> {
    let shared = driver_shared_handle();
    let deadline = Instant::now() + overall_timeout;
    let mut reports = Vec::with_capacity(ids.len());
    for &id in ids {
        let report = loop {
            match try_recv_finished(id, &shared) {
                Ok(Some(report)) => break report,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        break WorkerReport {
                            worker_id: id,
                            status: Status::Timeout,
                            resources: ResourceSnapshot::default(),
                            errors: vec!["worker did not report within the join timeout".to_string()],
                            worker_body_ns: 0,
                        };
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    break WorkerReport { worker_id: id, status: Status::Fail, resources: ResourceSnapshot::default(), errors: vec![e.to_string()], worker_body_ns: 0 }
                }
            }
        };
        reports.push(report);
    }
    reports
}

/// Handed to a distributed test's driver body (§4.9) so it can rendezvous
/// with every worker allocated to this run via `notify`/`wait` and exchange
/// user-defined messages. Unlike [`WorkerContext`], there is no background
/// listener thread on the driver side: each call actively pumps the
/// allocated workers' connections, matching the polling style already used
/// by [`join_workers`].
pub struct DriverContext {
    ids: Vec<u32>,
    shared: Arc<Mutex<DriverShared>>,
}

impl DriverContext {
    fn new(ids: Vec<u32>) -> Self {
        DriverContext { ids, shared: driver_shared_handle() }
    }

    /// Broadcast a `NOTIFY` frame to every worker allocated to this test.
    pub fn notify(&self) -> Result<()> {
        broadcast_to_workers(&self.ids, Opcode::Notify, |_| {})
    }

    /// Block until `n` distinct allocated workers have sent `NOTIFY` since
    /// the last `wait`, then consume those `n` workers' entries.
    pub fn wait(&self, n: u32) {
        let n = (n as usize).max(1).min(self.ids.len().max(1));
        loop {
            pump_workers(&self.ids, &self.shared);
            let mut state = self.shared.lock().unwrap();
            if state.notified.len() >= n {
                let drained: Vec<u32> = state.notified.iter().take(n).copied().collect();
                for id in drained {
                    state.notified.remove(&id);
                }
                return;
            }
            drop(state);
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Broadcast a pre-built user message to every allocated worker.
    pub fn send_user_message(&self, payload: &[u8]) -> Result<()> {
        broadcast_to_workers(&self.ids, Opcode::UserMessage, |buf| buf.write_byte_string(payload))
    }

    /// Block until a user message forwarded by a worker is available, then
    /// pop it from the FIFO.
    pub fn get_user_message(&self) -> Vec<u8> {
        loop {
            pump_workers(&self.ids, &self.shared);
            let mut state = self.shared.lock().unwrap();
            if let Some(msg) = state.messages.pop_front() {
                return msg;
            }
            drop(state);
            std::thread::sleep(Duration::from_millis(20));
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

/// Runs the driver-side body, if any, on its own thread so a `wait`/
/// `get_user_message` call that blocks on worker traffic can't starve the
/// driver's own timeout accounting. Returns `(status, errors, elapsed_ns)`;
/// a descriptor with no driver body reports an immediate pass.
fn run_driver_body(test: &TestDescriptor, ids: &[u32]) -> (Status, Vec<String>, u64) {
    let Some(driver_body) = test.driver_body.clone() else {
        return (Status::Pass, Vec::new(), 0);
    };
    let context = DriverContext::new(ids.to_vec());
    let timeout = test.timeout.max(Duration::from_secs(2));

    let (tx, rx) = mpsc::channel();
    let start = Instant::now();
    std::thread::spawn(move || {
        let result = catch_unwind(AssertUnwindSafe(|| driver_body(&context)));
        let _ = tx.send(result);
    });

    match rx.recv_timeout(timeout + Duration::from_millis(250)) {
        Ok(Ok(Ok(()))) => {
            let elapsed = start.elapsed();
            if elapsed > test.timeout {
                (Status::Timeout, vec!["driver body exceeded timeout".to_string()], duration_to_ns(elapsed))
            } else {
                (Status::Pass, Vec::new(), duration_to_ns(elapsed))
            }
        }
        Ok(Ok(Err(e))) => (Status::Fail, vec![e.to_string()], duration_to_ns(start.elapsed())),
        Ok(Err(payload)) => (Status::Fail, vec![panic_message(&*payload)], duration_to_ns(start.elapsed())),
        Err(_timed_out) => (Status::Timeout, vec!["driver body did not complete within the timeout".to_string()], duration_to_ns(start.elapsed())),
    }
}

/// Run a distributed test from the driver's side: allocate workers,
/// dispatch `RUN_TEST`, run the driver body (if any) against a
/// [`DriverContext`], then join on every assigned worker's result.
pub fn run_distributed_test(test: &TestDescriptor) -> TestReport {
    let (worker_count, _worker_body) = test.distributed.clone().expect("distributed descriptor");

    let ids = match ensure_workers(worker_count) {
        Ok(ids) => ids,
        Err(e) => {
            return TestReport::new(test, Status::Fail, ResourceSnapshot::default(), vec![format!("failed to allocate workers: {e}")], Default::default(), Vec::new(), Vec::new());
        }
    };

    let module = test.module.clone();
    let name = test.name.clone();
    if let Err(e) = broadcast_to_workers(&ids, Opcode::RunTest, move |buf| {
        buf.write_str(&module);
        buf.write_str(&name);
    }) {
        return TestReport::new(test, Status::Fail, ResourceSnapshot::default(), vec![format!("failed to dispatch to workers: {e}")], Default::default(), Vec::new(), Vec::new());
    }

    let (driver_status, driver_errors, driver_body_ns) = run_driver_body(test, &ids);
    let worker_reports = join_workers(&ids, test.timeout.max(Duration::from_secs(2)) + Duration::from_secs(5));

    let status = worker_reports.iter().map(|w| w.status).fold(driver_status, |acc, s| acc.max(s));
    let durations = PhaseDurations { body_ns: driver_body_ns, ..Default::default() };
    let mut record = TestReport::new(test, status, ResourceSnapshot::default(), driver_errors, durations, Vec::new(), Vec::new());
    record.success = record.status == test.expected;
    record.with_workers(worker_reports)
}

/// Tear down every pooled worker: send `TERMINATE`, then wait for exit.
/// Call once at driver shutdown.
pub fn shutdown_workers() {
    let Some(lock) = POOL.get() else { return };
    let ids: Vec<u32> = lock.lock().unwrap().workers.iter().map(|w| w.id).collect();
    for id in &ids {
        let _ = send_to_worker(*id, Opcode::Terminate, |_| {});
    }
    let mut guard = lock.lock().unwrap();
    for worker in &mut guard.workers {
        let _ = worker.child.wait();
    }
    guard.workers.clear();
}

// ---------------------------------------------------------------- worker --

#[derive(Default)]
struct WorkerShared {
    notify_count: u32,
    messages: VecDeque<Vec<u8>>,
}

/// Handed to a worker test body so it can rendezvous with the driver via
/// `notify`/`wait` and exchange user-defined messages, without the body
/// needing to know anything about sockets.
pub struct WorkerContext {
    to_driver: Mutex<Transport>,
    shared: Arc<(Mutex<WorkerShared>, Condvar)>,
}

impl WorkerContext {
    /// Send a `NOTIFY` frame to the driver.
    pub fn notify(&self) -> Result<()> {
        let mut t = self.to_driver.lock().unwrap();
        send_frame(&mut t, Opcode::Notify, |_| {})
    }

    /// Block until this worker's local notify counter (fed by `NOTIFY`
    /// frames the driver pushes to this worker's own listener) reaches
    /// `n`, then consume `n`.
    pub fn wait(&self, n: u32) {
        let (lock, cvar) = &*self.shared;
        let mut state = lock.lock().unwrap();
        while state.notify_count < n {
            state = cvar.wait(state).unwrap();
        }
        state.notify_count -= n;
    }

    pub fn send_user_message(&self, payload: &[u8]) -> Result<()> {
        let mut t = self.to_driver.lock().unwrap();
        send_frame(&mut t, Opcode::UserMessage, |buf| buf.write_byte_string(payload))
    }

    /// Block until a user message arrives from the driver, then pop it.
    pub fn get_user_message(&self) -> Vec<u8> {
        let (lock, cvar) = &*self.shared;
        let mut state = lock.lock().unwrap();
        while state.messages.is_empty() {
            state = cvar.wait(state).unwrap();
        }
        state.messages.pop_front().unwrap()
    }
}

enum WorkerEvent {
    RunTest(String, String),
    Shutdown,
}

/// Background loop servicing a worker's own listener: applies `NOTIFY`/
/// `UserMessage` directly to shared state and forwards `RunTest` to the
/// main thread, so rendezvous traffic keeps flowing while a test body is
/// running on the main thread.
fn worker_listener_loop(mut listener: Listener, shared: Arc<(Mutex<WorkerShared>, Condvar)>, events: mpsc::Sender<WorkerEvent>) {
    loop {
        let idx = match listener.poll_or_accept(Duration::from_millis(500)) {
            Ok(Some(idx)) => idx,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "worker listener poll failed");
                continue;
            }
        };
        let frame = recv_frame(listener.connection(idx));
        listener.dispose(idx);
        let (opcode, mut payload) = match frame {
            Ok(v) => v,
            Err(_) => continue,
        };
        match opcode {
            Opcode::RunTest => {
                let module = match payload.read_str() {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                let name = match payload.read_str() {
                    Ok(n) => n,
                    Err(_) => continue,
                };
                if events.send(WorkerEvent::RunTest(module, name)).is_err() {
                    return;
                }
            }
            Opcode::Notify => {
                let (lock, cvar) = &*shared;
                lock.lock().unwrap().notify_count += 1;
                cvar.notify_all();
            }
            Opcode::UserMessage => {
                if let Ok(bytes) = payload.read_byte_string() {
                    let (lock, cvar) = &*shared;
                    let mut state = lock.lock().unwrap();
                    state.messages.push_back(bytes);
                    crate::test::warn_if_queue_too_deep("worker", state.messages.len());
                    cvar.notify_all();
                }
            }
            Opcode::Terminate => {
                let _ = events.send(WorkerEvent::Shutdown);
                return;
            }
            Opcode::Nop | Opcode::WorkerStarted | Opcode::FinishedTest => {}
        }
    }
}

/// Entry point for a spawned worker process: connects back to the driver,
/// announces itself, then services assigned tests until told to stop.
pub fn run_worker_main(registry: &Registry, driver_super_addr: SocketAddr, worker_id: u32) -> Result<()> {
    let listener = Listener::bind_ephemeral()?;
    let listen_port = listener.local_addr()?.port();

    let mut to_driver = Transport::connect(driver_super_addr)?;
    send_frame(&mut to_driver, Opcode::WorkerStarted, |buf| {
        buf.write_u32(worker_id);
        buf.write_u16(listen_port);
    })?;

    let shared = Arc::new((Mutex::new(WorkerShared::default()), Condvar::new()));
    let context = Arc::new(WorkerContext { to_driver: Mutex::new(to_driver.try_clone()?), shared: shared.clone() });

    let (tx, rx) = mpsc::channel::<WorkerEvent>();
    let listener_thread = {
        let shared = shared.clone();
        std::thread::spawn(move || worker_listener_loop(listener, shared, tx))
    };

    for event in rx {
        match event {
            WorkerEvent::RunTest(module, name) => {
                if let Err(e) = run_assigned_test(registry, &context, &module, &name) {
                    warn!(error = %e, module, name, "worker test run failed");
                }
            }
            WorkerEvent::Shutdown => break,
        }
    }

    let _ = listener_thread.join();
    Ok(())
}

fn run_assigned_test(registry: &Registry, context: &Arc<WorkerContext>, module: &str, name: &str) -> Result<()> {
    let descriptor = registry.find(module, name).ok_or_else(|| anyhow!("worker has no descriptor for {module}::{name}"))?;
    let Some((_, worker_body)) = &descriptor.distributed else {
        return Err(anyhow!("{module}::{name} is not a distributed test"));
    };

    tracker::clear();
    tracker::disable_faulty_network();
    if let Some((chance, hole)) = descriptor.faulty_network {
        tracker::configure_faulty_network(chance, hole);
    }
    let mut series = tracker::SnapshotSeries::new();
    let guard = tracker::TrackingGuard::new();

    let start = Instant::now();
    let result = worker_body(context);
    let elapsed = start.elapsed();

    drop(guard);
    let snapshot = series.snapshot();

    let (status, errors) = match result {
        Ok(()) if elapsed > descriptor.timeout => (Status::Timeout, vec!["worker body exceeded timeout".to_string()]),
        Ok(()) => (crate::unit_test::apply_leak_and_limit_rules(Status::Pass, &snapshot, descriptor.ignore_memory_leak, descriptor.memory_bytes_limit, descriptor.memory_blocks_limit), Vec::new()),
        Err(e) => (Status::Fail, vec![e.to_string()]),
    };

    let mut to_driver = context.to_driver.lock().unwrap();
    send_frame(&mut to_driver, Opcode::FinishedTest, |buf| {
        buf.write_u32(0);
        buf.write_u8(status_to_code(status));
        buf.write_u64(errors.len() as u64);
        for e in &errors {
            buf.write_str(e);
        }
        buf.write_u64(duration_to_ns(elapsed));
        crate::unit_test::pack_snapshot(buf, &snapshot);
    })?;
    Ok(())
}
