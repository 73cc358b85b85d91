//! Drives a real worker process loop (`run_worker_main`) against a
//! hand-built "driver" that speaks the wire protocol directly, without
//! going through the worker-pool's own process-spawn path. This exercises
//! the actual frame encoding, the worker's rendezvous primitives
//! (`notify`/`wait`), and `FINISHED_TEST` reporting end to end.

use dtest_rs::codec::Buffer;
use dtest_rs::distributed::{run_worker_main, WorkerContext};
use dtest_rs::test::{Registry, Status, TestBuilder};
use dtest_rs::transport::{Listener, Transport};
use std::net::SocketAddr;

const OP_WORKER_STARTED: u16 = 1;
const OP_RUN_TEST: u16 = 2;
const OP_FINISHED_TEST: u16 = 3;
const OP_NOTIFY: u16 = 4;
const OP_TERMINATE: u16 = 5;

fn send_raw(transport: &mut Transport, opcode: u16, build: impl FnOnce(&mut Buffer)) {
    let mut buf = Buffer::new();
    buf.write_u16(opcode);
    build(&mut buf);
    transport.send(&buf.finish()).unwrap();
}

fn recv_raw(transport: &mut Transport) -> (u16, Buffer) {
    let mut header = [0u8; 8];
    transport.recv_exact(&mut header).unwrap();
    let total = u64::from_le_bytes(header) as usize;
    let mut rest = vec![0u8; total - 8];
    if !rest.is_empty() {
        transport.recv_exact(&mut rest).unwrap();
    }
    let mut full = header.to_vec();
    full.extend(rest);
    let mut buf = Buffer::from_received(full);
    (buf.read_u16().unwrap(), buf)
}

#[test]
fn worker_rendezvous_and_reports_status_over_the_wire() {
    let mut registry = Registry::new();
    registry.register(
        TestBuilder::unit("distmod", "rendezvous", || Ok(()))
            .distributed(1, |ctx: &WorkerContext| {
                ctx.notify()?;
                ctx.wait(1);
                Ok(())
            })
            .build(),
    );

    let mut super_listener = Listener::bind_ephemeral().unwrap();
    let super_addr = super_listener.local_addr().unwrap();

    let worker_thread = std::thread::spawn(move || {
        run_worker_main(&registry, super_addr, 42).unwrap();
    });

    let mut from_worker = super_listener.accept_blocking().unwrap();

    let (opcode, mut payload) = recv_raw(&mut from_worker);
    assert_eq!(opcode, OP_WORKER_STARTED);
    let reported_id = payload.read_u32().unwrap();
    let port = payload.read_u16().unwrap();
    assert_eq!(reported_id, 42);
    let worker_addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    send_raw(&mut Transport::connect(worker_addr).unwrap(), OP_RUN_TEST, |buf| {
        buf.write_str("distmod");
        buf.write_str("rendezvous");
    });

    let (opcode, _) = recv_raw(&mut from_worker);
    assert_eq!(opcode, OP_NOTIFY);

    send_raw(&mut Transport::connect(worker_addr).unwrap(), OP_NOTIFY, |_| {});

    let (opcode, mut payload) = recv_raw(&mut from_worker);
    assert_eq!(opcode, OP_FINISHED_TEST);
    let _worker_id = payload.read_u32().unwrap();
    let status_code = payload.read_u8().unwrap();
    assert_eq!(status_code, 0, "expected Pass (code 0)");
    let errors_len = payload.read_u64().unwrap();
    assert_eq!(errors_len, 0);

    send_raw(&mut Transport::connect(worker_addr).unwrap(), OP_TERMINATE, |_| {});
    worker_thread.join().unwrap();

    // Sanity check the status ordering the merge logic in `test.rs` relies
    // on: Pass is the least severe outcome.
    assert!(Status::Pass < Status::Fail);
}
