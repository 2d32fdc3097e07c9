use std::time::Instant;

use cinder_core::config::SchedulerConfig;
use cinder_core::ops::{CommandReply, TableId};
use cinder_core::scheduler::{Scheduler, SchedulerStats};
use cinder_core::server::Server;
use cinder_core::testutil::{
    RecordingRowOperator,
    SignalCounts,
    TestCollaborators,
    insert_commit_graph,
};
use cinder_core::trx::Driver;
use cinder_error::{DbError, Result, ResultExt};
use clap::Parser;
use serde::Serialize;
use tracing::info;

#[derive(Parser)]
#[clap(name = "bench_scheduler")]
struct Arguments {
    /// Number of insert+commit transactions to run.
    #[clap(long, short, default_value = "1000")]
    count: usize,
    /// Rows inserted per transaction.
    #[clap(long, default_value = "100")]
    rows: u64,
    /// Rows processed per row operator call.
    #[clap(long, default_value = "10")]
    batch_size: u64,
    /// Transactions are spread over this many tables. Fewer tables means
    /// more lock contention.
    #[clap(long, default_value = "8")]
    tables: u64,
    /// Scheduler settings as `name=value`, e.g. `round_robin_limit=500`.
    #[clap(long = "set", short = 's')]
    settings: Vec<String>,
    #[clap(long, env = "BENCH_LOG_JSON")]
    json_logs: bool,
}

#[derive(Debug, Serialize)]
struct BenchReport {
    transactions: usize,
    failed: usize,
    elapsed_ms: u64,
    trx_per_sec: f64,
    stats: SchedulerStats,
    signals: SignalCounts,
}

fn main() {
    let args = Arguments::parse();
    let format = if args.json_logs {
        logutil::LogFormat::Json
    } else {
        logutil::LogFormat::HumanReadable
    };
    logutil::configure_global_logger(tracing::Level::WARN, format, std::io::stderr);

    if let Err(e) = run(args) {
        println!("ERROR: {e}");
        std::process::exit(1);
    }
}

fn run(args: Arguments) -> Result<()> {
    let mut config = SchedulerConfig::default();
    for setting in &args.settings {
        let (name, value) = setting.split_once('=').ok_or_else(|| {
            DbError::new("Setting must be of the form name=value").with_field("setting", setting)
        })?;
        config.set_from_str(name.trim(), value.trim())?;
    }
    config.validate()?;
    let num_workers = config.worker_threads;

    let collab = TestCollaborators::new(RecordingRowOperator::new(args.batch_size));
    let scheduler = Scheduler::try_new(config, collab.collaborators())?;
    let server = Server::new(scheduler.clone());
    server.create_worker_pool(num_workers)?;
    server.start_lock_wait_monitor()?;
    info!(count = args.count, num_workers, "starting benchmark");

    let start = Instant::now();
    let mut replies = Vec::with_capacity(args.count);
    for idx in 0..args.count {
        let trx = scheduler.begin_transaction(Driver::Pool);
        let table = TableId(idx as u64 % args.tables.max(1));
        let reply = CommandReply::new();
        let fork = scheduler.create_fork(trx, insert_commit_graph(table, args.rows), reply.clone())?;
        scheduler.submit(fork)?;
        replies.push((trx, fork, reply));
    }

    let mut failed = 0;
    for (trx, fork, reply) in replies {
        if reply.wait().is_failed() {
            failed += 1;
        }
        scheduler.detach_fork(trx)?;
        scheduler.free_fork(fork)?;
        scheduler.end_transaction(trx)?;
    }
    let elapsed = start.elapsed();
    server.shutdown();

    let report = BenchReport {
        transactions: args.count,
        failed,
        elapsed_ms: elapsed.as_millis() as u64,
        trx_per_sec: args.count as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        stats: scheduler.stats(),
        signals: collab.signals.counts(),
    };
    let out = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
    println!("{out}");

    Ok(())
}
