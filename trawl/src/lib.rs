//! # trawl - Capture Service Core
//!
//! trawl collects timestamped events from one or more producers during a
//! capture of a target process, orders them by time, and indexes them into
//! queryable capture data (timers, callstacks, tracepoints, modules).
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────┐     ┌──────────────────────────────┐
//! │  Target process              │     │  External producers          │
//! │  • user API scopes           │     │  (framed Unix-socket stream) │
//! │  • instrumented functions    │     └──────────────┬───────────────┘
//! └──────────────┬───────────────┘                    │
//!                │ CaptureEventProducer               │
//!                ▼                                    ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    ProducerSideService                           │
//! │   StartCapture / StopCapture / CaptureFinished  ──▶ producers    │
//! │   BufferedCaptureEvents / AllEventsSent         ◀── producers    │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ ProducerEventProcessor (queue)
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  CaptureConsumer ──▶ EventMerger ──▶ CaptureEventProcessor       │
//! │                      (time order)    (interning, API scopes)     │
//! │                                             │                    │
//! │                                             ▼                    │
//! │                        CaptureListener (CaptureData)             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`service`]: the producer-facing service, per-connection state and the
//!   bidirectional stream abstraction (in-process channels, Unix sockets)
//! - [`producer`]: the producer half of a link, with batching and the hooks
//!   that sources plug into
//! - [`api`]: in-process user instrumentation (scopes, async scopes, values)
//!   and the tracing listener that relays them
//! - [`instrumentation`]: dynamic function instrumentation and file-I/O
//!   hook classification
//! - [`process`]: `/proc` inspection (modules, process list, thread names)
//! - [`client`]: event ordering, decoding and the capture data model
//! - [`concurrency`]: the elastic thread pool behind the tracing listener
//! - [`containers`]: append-only block storage for capture data
//! - [`clock`]: monotonic timestamps and thread identity
//! - [`domain`]: newtype ids and structured errors
//! - [`cli`], [`preflight`]: the `trawl` binary's arguments and checks
//!
//! ## Typical Usage
//!
//! ```bash
//! # Capture a process by name for ten seconds
//! ./trawl my-app --duration 10
//!
//! # Accept external producers and export the capture summary
//! ./trawl --pid <PID> --socket /tmp/trawl.sock --export summary.json
//! ```

pub mod api;
pub mod cli;
pub mod client;
pub mod clock;
pub mod concurrency;
pub mod containers;
pub mod domain;
pub mod instrumentation;
pub mod preflight;
pub mod process;
pub mod producer;
pub mod service;
