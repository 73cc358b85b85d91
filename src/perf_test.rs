//! # Performance Test Harness
//!
//! Inherits the unit test's leak/limit/timeout checks (C8) and additionally
//! times a `baseline` thunk, failing the test with `TooSlow` when the body
//! doesn't clear the configured margin over the baseline.

use crate::report::{duration_to_ns, PhaseDurations, TestReport};
use crate::sandbox::{run_sandboxed, Outcome, SandboxOptions};
use crate::test::{PerformanceMargin, Status, TestDescriptor};
use crate::tracker::{self, ResourceSnapshot};
use crate::unit_test::{apply_leak_and_limit_rules, pack_snapshot, unpack_snapshot, MIN_PROCESS_TIMEOUT};
use std::sync::Arc;
use std::time::Instant;

type BodyFn = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

pub fn run_performance_test(test: &TestDescriptor, baseline: BodyFn, margin: PerformanceMargin) -> TestReport {
    let init = test.init.clone();
    let body = test.body.clone();
    let complete = test.complete.clone();
    let memory_bytes_limit = test.memory_bytes_limit;
    let memory_blocks_limit = test.memory_blocks_limit;
    let ignore_leak = test.ignore_memory_leak;
    let body_timeout = test.timeout;
    let faulty_network = test.faulty_network;

    let options = SandboxOptions {
        fork: !test.in_process,
        input_bytes: test.input_bytes.clone(),
        timeout: body_timeout.max(MIN_PROCESS_TIMEOUT),
    };

    let packed = run_sandboxed(
        move || {
            tracker::clear();
            tracker::disable_faulty_network();
            if let Some((chance, hole)) = faulty_network {
                tracker::configure_faulty_network(chance, hole);
            }
            let mut series = tracker::SnapshotSeries::new();
            let guard = tracker::TrackingGuard::new();

            let init_start = Instant::now();
            if let Some(init_fn) = &init {
                init_fn()?;
            }
            let init_ns = duration_to_ns(init_start.elapsed());

            let baseline_start = Instant::now();
            baseline()?;
            let baseline_elapsed = baseline_start.elapsed();

            let body_start = Instant::now();
            let body_result = body();
            let body_elapsed = body_start.elapsed();

            body_result?;
            if body_elapsed > body_timeout {
                anyhow::bail!("__TIMEOUT__");
            }

            let complete_start = Instant::now();
            if let Some(complete_fn) = &complete {
                complete_fn()?;
            }
            let complete_ns = duration_to_ns(complete_start.elapsed());

            drop(guard);
            let snapshot = series.snapshot();

            let mut out = crate::codec::Buffer::new();
            out.write_u64(init_ns);
            out.write_u64(duration_to_ns(body_elapsed));
            out.write_u64(complete_ns);
            out.write_u64(duration_to_ns(baseline_elapsed));
            pack_snapshot(&mut out, &snapshot);
            Ok(out.finish())
        },
        options,
    );

    match packed {
        Ok(result) => interpret(test, result.outcome, result.stdout, result.stderr, memory_bytes_limit, memory_blocks_limit, ignore_leak, margin),
        Err(e) => TestReport::new(test, Status::Fail, ResourceSnapshot::default(), vec![e.to_string()], PhaseDurations::default(), Vec::new(), Vec::new()),
    }
}

fn margin_satisfied(body_ns: u64, baseline_ns: u64, margin: PerformanceMargin) -> bool {
    match margin {
        PerformanceMargin::Absolute(extra) => body_ns <= baseline_ns.saturating_add(extra.as_nanos() as u64),
        PerformanceMargin::Ratio(ratio) => (body_ns as f64) <= (baseline_ns as f64) * ratio,
    }
}

fn interpret(
    test: &TestDescriptor,
    outcome: Outcome,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    memory_bytes_limit: Option<u64>,
    memory_blocks_limit: Option<u64>,
    ignore_leak: bool,
    margin: PerformanceMargin,
) -> TestReport {
    match outcome {
        Outcome::Timeout => TestReport::new(test, Status::Timeout, ResourceSnapshot::default(), vec!["exceeded timeout".to_string()], PhaseDurations::default(), stdout, stderr),
        Outcome::Error(msg) if msg == "__TIMEOUT__" => {
            TestReport::new(test, Status::Timeout, ResourceSnapshot::default(), vec![format!("exceeded body timeout of {:?}", test.timeout)], PhaseDurations::default(), stdout, stderr)
        }
        Outcome::Error(msg) => TestReport::new(test, Status::Fail, ResourceSnapshot::default(), vec![msg], PhaseDurations::default(), stdout, stderr),
        Outcome::Complete(payload) => {
            let mut buf = crate::codec::Buffer::from_received(payload);
            let parsed: anyhow::Result<(u64, u64, u64, u64, ResourceSnapshot)> = (|| {
                let init_ns = buf.read_u64()?;
                let body_ns = buf.read_u64()?;
                let complete_ns = buf.read_u64()?;
                let baseline_ns = buf.read_u64()?;
                let snapshot = unpack_snapshot(&mut buf)?;
                Ok((init_ns, body_ns, complete_ns, baseline_ns, snapshot))
            })();
            match parsed {
                Ok((init_ns, body_ns, complete_ns, baseline_ns, snapshot)) => {
                    let mut status = apply_leak_and_limit_rules(Status::Pass, &snapshot, ignore_leak, memory_bytes_limit, memory_blocks_limit);
                    let mut errors = Vec::new();
                    if status == Status::Pass && !margin_satisfied(body_ns, baseline_ns, margin) {
                        status = Status::TooSlow;
                        errors.push(format!("body took {body_ns}ns, baseline {baseline_ns}ns, margin not met"));
                    }
                    let durations = PhaseDurations { init_ns, body_ns, complete_ns, baseline_ns, worker_body_ns: 0 };
                    TestReport::new(test, status, snapshot, errors, durations, stdout, stderr)
                }
                Err(e) => TestReport::new(test, Status::Fail, ResourceSnapshot::default(), vec![format!("malformed sandbox result: {e}")], PhaseDurations::default(), stdout, stderr),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::TestBuilder;
    use std::time::Duration;

    #[test]
    fn fast_body_beats_slow_baseline() {
        let descriptor = TestBuilder::unit("perf_mod", "fast", || Ok(()))
            .in_process()
            .performance(
                || {
                    std::thread::sleep(Duration::from_millis(20));
                    Ok(())
                },
                PerformanceMargin::Ratio(1.0),
            )
            .build();
        let (baseline, margin) = descriptor.performance.clone().unwrap();
        let report = run_performance_test(&descriptor, baseline, margin);
        assert_eq!(report.status, Status::Pass);
    }

    #[test]
    fn slow_body_misses_margin_and_is_too_slow() {
        let descriptor = TestBuilder::unit("perf_mod", "slow", || {
            std::thread::sleep(Duration::from_millis(40));
            Ok(())
        })
        .expect(Status::TooSlow)
        .in_process()
        .performance(|| Ok(()), PerformanceMargin::Absolute(Duration::from_millis(1)))
        .build();
        let (baseline, margin) = descriptor.performance.clone().unwrap();
        let report = run_performance_test(&descriptor, baseline, margin);
        assert_eq!(report.status, Status::TooSlow);
    }
}
