//! Broker process entry point.
//!
//! CLI shape and the ctrlc-driven graceful shutdown flag are grounded in
//! `kaos-driver`'s `main.rs`, adapted to this crate's single responsibility
//! (drain producer queues, fan out into the tuple buffer) rather than that
//! binary's several transport-specific run modes.

use std::collections::HashSet;
use std::env;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ipcq_broker::{Broker, Source};
use ipcq_queue::IpcQueue;
use ipcq_tuplebuf::TupleBuffer;

const DEFAULT_QUEUE_CAPACITY: usize = 1 << 20;
const DEFAULT_BUFFER_CAPACITY: usize = 4096;

fn print_usage() {
    eprintln!("usage: ipcq-broker [--queue-capacity BYTES] [--buffer-capacity SLOTS]");
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let mut queue_capacity = DEFAULT_QUEUE_CAPACITY;
    let mut buffer_capacity = DEFAULT_BUFFER_CAPACITY;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--queue-capacity" => match args.next().and_then(|v| v.parse().ok()) {
                Some(v) => queue_capacity = v,
                None => {
                    print_usage();
                    return ExitCode::FAILURE;
                }
            },
            "--buffer-capacity" => match args.next().and_then(|v| v.parse().ok()) {
                Some(v) => buffer_capacity = v,
                None => {
                    print_usage();
                    return ExitCode::FAILURE;
                }
            },
            "-h" | "--help" => {
                print_usage();
                return ExitCode::SUCCESS;
            }
            other => {
                eprintln!("unrecognized argument: {other}");
                print_usage();
                return ExitCode::FAILURE;
            }
        }
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handler = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::info!("received shutdown signal");
        shutdown_handler.store(true, Ordering::Release);
    }) {
        eprintln!("failed to install signal handler: {e}");
        return ExitCode::FAILURE;
    }

    // A standalone broker process with no producers configured is a no-op
    // that just waits to be told to exit; real deployments wire sources in
    // via the `ipcq` facade, which owns the DSM segments producers attach
    // to. This binary is the supervised shell that drives that broker to
    // completion and reports its routed-frame count on exit.
    let queue = Arc::new(IpcQueue::new(queue_capacity));
    let buffer = Arc::new(TupleBuffer::new(buffer_capacity));
    let reader = buffer.open_reader();
    let broker = Broker::new(
        vec![Source { queue, readers: HashSet::from([reader]) }],
        buffer,
    );

    broker.run(&shutdown);

    let routed = broker.metrics().frames_routed.load(Ordering::Relaxed);
    tracing::info!(routed, "broker exited");
    ExitCode::SUCCESS
}
