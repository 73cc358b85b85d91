//! # Driver / Worker Entry Point
//!
//! `dtest-rs` re-execs itself into hidden worker processes (see
//! [`dtest_rs::config::Args::dtest_worker`]), so this binary has two faces:
//! a human-facing driver that registers tests, runs the scheduler, and
//! writes the report, and an internal worker that services `RUN_TEST`
//! until told to stop. Both share the same logging and registry setup.

use anyhow::{Context, Result};
use clap::Parser;
use dtest_rs::config::{Args, EngineConfig};
use dtest_rs::distributed;
use dtest_rs::logging::ColorizedFormatter;
use dtest_rs::report::ResultsManager;
use dtest_rs::test::{PerformanceMargin, Registry, Scheduler, TestBuilder};
use tracing::{info, warn};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

fn init_logging(config: &EngineConfig) {
    let log_level = match config.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let file_appender = tracing_appender::rolling::daily(".", "dtest-rs.log");
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);
    // Leaked intentionally: the guard must outlive every log call for the
    // life of the process, and this process has no later point to drop it.
    Box::leak(Box::new(guard));

    let detailed_log_layer = tracing_subscriber::fmt::layer().with_writer(non_blocking_writer).with_ansi(false).with_filter(log_level);

    let stdout_log = if !config.quiet {
        Some(tracing_subscriber::fmt::layer().with_writer(std::io::stdout).event_format(ColorizedFormatter).with_filter(log_level))
    } else {
        None
    };

    tracing_subscriber::registry().with(detailed_log_layer).with(stdout_log).init();
}

/// Registers the engine's own sample suite: one unit test, one performance
/// test, and one two-worker distributed test exercising `notify`/`wait`.
/// A real deployment links this crate as a library and registers its own
/// tests the same way; these exist so the binary is runnable standalone.
fn register_demo_tests(registry: &mut Registry) {
    registry.register(TestBuilder::unit("demo", "addition_is_commutative", || {
        anyhow::ensure!(2 + 2 == 4, "arithmetic is broken");
        Ok(())
    }).build());

    registry.register(
        TestBuilder::unit("demo", "sorted_vec_stays_sorted", || {
            let mut v = vec![5, 3, 1, 4, 2];
            v.sort();
            anyhow::ensure!(v.windows(2).all(|w| w[0] <= w[1]), "sort produced disorder");
            Ok(())
        })
        .build(),
    );

    registry.register(
        TestBuilder::unit("demo", "vec_extend_beats_naive_push", || {
            let mut v = Vec::with_capacity(10_000);
            v.extend(0..10_000u32);
            anyhow::ensure!(v.len() == 10_000, "unexpected length");
            Ok(())
        })
        .performance(
            || {
                let mut v = Vec::new();
                for i in 0..10_000u32 {
                    v.push(i);
                }
                std::hint::black_box(&v);
                Ok(())
            },
            PerformanceMargin::Ratio(2.0),
        )
        .build(),
    );

    registry.register(
        TestBuilder::unit("demo", "workers_rendezvous_via_notify", || Ok(()))
            .distributed(2, |ctx: &distributed::WorkerContext| {
                ctx.notify()?;
                ctx.wait(1);
                Ok(())
            })
            .driver(|ctx: &distributed::DriverContext| {
                ctx.wait(2);
                ctx.notify()?;
                Ok(())
            })
            .build(),
    );
}

fn run_driver(config: EngineConfig) -> Result<()> {
    let mut registry = Registry::new();
    register_demo_tests(&mut registry);

    let mut scheduler = Scheduler::new(&registry);
    if let Some(modules) = config.modules.clone() {
        scheduler = scheduler.with_module_filter(modules);
    }

    info!(tests = registry.len(), "starting run");
    let summary = scheduler.run_all();

    let mut manager = ResultsManager::new(&config.output, serde_json::json!({ "max_workers": config.max_workers }));
    for record in summary.records {
        manager.add_record(record);
    }
    manager.finalize().context("writing report")?;
    if !config.quiet {
        manager.print_summary();
    }

    distributed::shutdown_workers();

    if !summary.all_succeeded {
        anyhow::bail!("one or more tests did not match their expected status");
    }
    Ok(())
}

fn run_worker(args: &Args) -> Result<()> {
    let worker_id = args.worker_id.context("--dtest-worker requires --worker-id")?;
    let driver_addr = args.driver_super_addr.context("--dtest-worker requires --driver-super-addr")?;

    let mut registry = Registry::new();
    register_demo_tests(&mut registry);

    distributed::run_worker_main(&registry, driver_addr, worker_id)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = EngineConfig::from(&args);
    init_logging(&config);

    if args.dtest_worker {
        if let Err(e) = run_worker(&args) {
            warn!(error = %e, "worker exited with an error");
            return Err(e);
        }
        return Ok(());
    }

    run_driver(config)
}
