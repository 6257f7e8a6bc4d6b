//! # trawl - Main Entry Point
//!
//! Runs one capture of a target process:
//! - an in-process producer relays the target's modules and thread names, and,
//!   when trawl captures itself, its user-API scopes and instrumented calls
//! - `--socket <PATH>` additionally accepts external producers over framed
//!   Unix-socket streams
//! - the capture stops on Ctrl+C, `--duration` or target exit, after which the
//!   summary is printed (and exported with `--export`)

#![allow(clippy::too_many_lines, clippy::cast_precision_loss)]

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::fs::File;
use std::io::BufWriter;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use trawl_common::CaptureOptions;

use trawl::api::ApiEventProducer;
use trawl::cli::Args;
use trawl::client::{
    CaptureConsumer, CaptureData, CaptureSummary, MajorityStartFilter, Supermajority,
    DEFAULT_MERGE_WINDOW_NS,
};
use trawl::domain::{CallstackDataError, Pid, ServiceError, TransportError};
use trawl::instrumentation::{DynamicInstrumentationManager, SoftwareProbeBackend};
use trawl::preflight::{run_preflight_checks, targets_own_process};
use trawl::process::{find_process_by_name, read_process, ProcessSnapshotProducer};
use trawl::producer::{CaptureEventProducer, ProducerConfig, ProducerHooks};
use trawl::service::{
    in_process_channel, FramedUnixStream, ProducerSideService, QueueingEventProcessor,
    ServiceConfig,
};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if matches!(err.downcast_ref::<ServiceError>(), Some(ServiceError::InvalidOptions(_)))
        || matches!(
            err.downcast_ref::<CallstackDataError>(),
            Some(CallstackDataError::InvalidSupermajority { .. })
        )
    {
        return EXIT_USAGE;
    }
    let msg = err.to_string().to_lowercase();
    if msg.contains("permission denied") {
        EXIT_NOPERM
    } else if msg.contains("missing required argument") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

/// Resolve the target from `PROCESS` or `--pid`.
fn resolve_target(args: &Args) -> Result<(Pid, String)> {
    if let Some(ref name) = args.process {
        if args.pid.is_some() {
            anyhow::bail!(
                "Cannot use PROCESS argument with --pid.\n\n\
                 Use either:\n  \
                 trawl my-app            (by name)\n  \
                 trawl --pid 1234        (explicit PID)"
            );
        }
        let info = find_process_by_name(name)?;
        return Ok((info.pid, info.name));
    }

    if let Some(pid) = args.pid {
        let info = read_process(Pid(pid))?;
        return Ok((info.pid, info.name));
    }

    anyhow::bail!(
        "Missing required argument: PROCESS or --pid\n\n\
         Usage:\n  \
         trawl my-app            Capture a process by name\n  \
         trawl --pid 1234        Capture an explicit PID\n\n\
         Run 'trawl --help' for more options"
    )
}

fn capture_options(args: &Args, pid: Pid) -> CaptureOptions {
    let instrumented_functions = args
        .instrument
        .iter()
        .cloned()
        .zip(1..)
        .map(|(mut function, id)| {
            function.function_id = id;
            function
        })
        .collect();

    CaptureOptions {
        pid: pid.0,
        samples_per_second: args.sampling_rate,
        unwinding_method: args.unwinding.into(),
        trace_thread_state: args.trace_thread_state,
        enable_api: !args.no_api,
        instrumented_functions,
        ..CaptureOptions::default()
    }
}

/// Accept loop for external producers on a Unix socket.
struct SocketServer {
    path: PathBuf,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl SocketServer {
    fn start(path: &Path, service: Arc<ProducerSideService>) -> Result<Self> {
        let listener =
            UnixListener::bind(path).with_context(|| format!("Failed to bind {}", path.display()))?;
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("trawl-accept".to_string())
                .spawn(move || accept_loop(&listener, &service, &stop))?
        };
        Ok(Self { path: path.to_path_buf(), stop, handle })
    }

    fn shutdown(self) {
        self.stop.store(true, Ordering::Release);
        // Wake the blocking accept
        let _ = UnixStream::connect(&self.path);
        if self.handle.join().is_err() {
            warn!("Accept thread panicked");
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to remove {}: {e}", self.path.display());
        }
    }
}

fn accept_loop(listener: &UnixListener, service: &Arc<ProducerSideService>, stop: &AtomicBool) {
    for connection in listener.incoming() {
        if stop.load(Ordering::Acquire) {
            break;
        }
        let framed = connection.map_err(TransportError::from).and_then(FramedUnixStream::new);
        let stream = match framed {
            Ok(stream) => Arc::new(stream),
            Err(e) => {
                warn!("Rejected producer connection: {e}");
                continue;
            }
        };
        let service = Arc::clone(service);
        let spawned = std::thread::Builder::new().name("trawl-rpc".to_string()).spawn(move || {
            if let Err(e) = service.receive_commands_and_send_events(stream) {
                warn!("Producer connection closed: {e}");
            }
        });
        if let Err(e) = spawned {
            warn!("Failed to spawn producer handler: {e}");
        }
    }
}

fn print_summary(summary: &CaptureSummary, elapsed: Duration, exit_reason: &str) {
    eprintln!(
        "\n{exit_reason}: {:.1}s, {} timers on {} threads, \
         {} callstack samples ({} unique), {} tracepoint events",
        elapsed.as_secs_f64(),
        summary.timers,
        summary.threads_with_timers,
        summary.callstack_samples,
        summary.unique_callstacks,
        summary.tracepoint_events,
    );
    eprintln!(
        "modules: {}, threads named: {}, out-of-order discarded: {}, majority filter dropped: {}",
        summary.modules,
        summary.thread_names.len(),
        summary.out_of_order_discarded,
        summary.majority_filter_dropped,
    );
    for warning in &summary.warnings {
        eprintln!("warning: {warning}");
    }
    for error in &summary.errors {
        eprintln!("capture error: {error}");
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;

    let (pid, process_name) = resolve_target(&args)?;
    run_preflight_checks(pid.0, &args.instrument, args.socket.as_deref(), quiet)?;
    let supermajority = Supermajority::new(args.supermajority.0, args.supermajority.1)?;

    if !quiet {
        println!("trawl v{}", env!("CARGO_PKG_VERSION"));
        println!("target: {process_name}");
        println!("pid: {}", pid.0);
    }

    let options = capture_options(&args, pid);
    let service = Arc::new(ProducerSideService::new(ServiceConfig {
        max_wait_for_all_events_sent: Duration::from_millis(args.max_wait_ms),
    }));

    // ── Client side: queue → consumer → CaptureData ─────────────────────
    let (queue, queue_rx) = QueueingEventProcessor::new();
    let capture_data = CaptureData::new(pid, process_name);
    let consumer = CaptureConsumer::spawn(queue_rx, capture_data, DEFAULT_MERGE_WINDOW_NS)
        .context("Failed to start capture consumer")?;

    // ── In-process producer ─────────────────────────────────────────────
    let (server_end, producer_end) = in_process_channel();
    let local_handler = {
        let service = Arc::clone(&service);
        std::thread::Builder::new()
            .name("trawl-rpc-local".to_string())
            .spawn(move || service.receive_commands_and_send_events(Arc::new(server_end)))?
    };
    let mut hooks: Vec<Arc<dyn ProducerHooks>> = vec![Arc::new(ProcessSnapshotProducer::new())];
    if targets_own_process(pid.0) {
        hooks.push(Arc::new(ApiEventProducer::new()));
        hooks.push(Arc::new(DynamicInstrumentationManager::new(Arc::new(
            SoftwareProbeBackend::new(),
        ))));
    } else {
        info!(
            "User API and instrumented functions of PID:{} are served by socket producers only",
            pid.0
        );
    }
    let producer = CaptureEventProducer::connect(
        Arc::new(producer_end),
        ProducerConfig {
            max_batch_size: args.batch_size,
            flush_interval: Duration::from_millis(args.flush_interval_ms),
        },
        hooks,
    )
    .context("Failed to start in-process producer")?;

    let socket_server = args
        .socket
        .as_deref()
        .map(|path| SocketServer::start(path, Arc::clone(&service)))
        .transpose()?;
    if !quiet {
        if let Some(ref path) = args.socket {
            println!("socket: {}", path.display());
        }
    }

    // ── Capture ─────────────────────────────────────────────────────────
    queue.notify_capture_started(options.clone());
    service.on_capture_start_requested(options, queue.clone())?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let capture_start = Instant::now();
    let duration_limit = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    let proc_path = format!("/proc/{}", pid.0);
    let mut last_status_time = Instant::now();
    let mut exit_reason = "interrupted";

    loop {
        if duration_limit.is_some_and(|limit| capture_start.elapsed() >= limit) {
            exit_reason = "duration limit reached";
            break;
        }
        if !Path::new(&proc_path).exists() {
            exit_reason = "process exited";
            break;
        }
        if last_status_time.elapsed() > Duration::from_secs(10) {
            info!(
                "Capturing: {} producer(s) connected, {} events sent by the local producer",
                service.connected_producers(),
                producer.events_sent()
            );
            last_status_time = Instant::now();
        }

        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(100)) => {}
            _ = &mut ctrl_c => {
                break;
            }
        }
    }

    // ── Stop: wait for producers, then drain the consumer ───────────────
    let missing = {
        let service = Arc::clone(&service);
        tokio::task::spawn_blocking(move || service.on_capture_stop_requested()).await?
    };
    if missing > 0 {
        warn!("{missing} producer(s) did not flush before the capture finished");
    }
    queue.notify_end_of_capture();
    let capture = tokio::task::spawn_blocking(move || consumer.join()).await?;

    {
        let service = Arc::clone(&service);
        tokio::task::spawn_blocking(move || service.finish_and_disallow_rpc()).await?;
    }
    producer.shutdown();
    if let Ok(Err(e)) = local_handler.join() {
        warn!("Local producer connection: {e}");
    }
    if let Some(server) = socket_server {
        server.shutdown();
    }

    let filter = MajorityStartFilter { supermajority, ..MajorityStartFilter::default() };
    let dropped = capture.filter_callstacks_by_majority_start(&filter);
    info!("Majority-start filter dropped {dropped} callstack sample(s)");
    let summary = capture.summary();

    if !quiet {
        print_summary(&summary, capture_start.elapsed(), exit_reason);
    }

    if let Some(ref export_path) = args.export {
        let file = File::create(export_path).context("Failed to create summary output file")?;
        serde_json::to_writer_pretty(BufWriter::new(file), &summary)
            .context("Failed to export summary")?;
        if !quiet {
            println!("saved: {}", export_path.display());
        }
    }

    Ok(())
}
