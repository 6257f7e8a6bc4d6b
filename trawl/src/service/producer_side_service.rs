//! The service end of the producer link.
//!
//! Each producer connection runs [`ProducerSideService::receive_commands_and_send_events`]
//! on its own thread. That call reads producer messages on the calling thread
//! and spawns one scoped thread that turns service-wide [`CaptureStatus`]
//! changes into commands for that producer.
//!
//! # Capture lifecycle
//!
//! 1. [`ProducerSideService::on_capture_start_requested`] validates the options
//!    and moves to `Started`; every connected producer owes an `AllEventsSent`.
//! 2. [`ProducerSideService::on_capture_stop_requested`] moves to `Stopping`
//!    and waits for those producers (bounded by
//!    [`ServiceConfig::max_wait_for_all_events_sent`]).
//! 3. The status becomes `Finished` and every producer receives `CaptureFinished`.
//!
//! A producer whose stream ends counts as having sent all its events.

use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use trawl_common::{CaptureOptions, ProducerMessage, ServerCommand};

use super::producer_event_processor::ProducerEventProcessor;
use super::producer_state::{command_sequence, CommandKind, ProducerInput, ProducerState};
use super::stream::BidiStream;
use crate::clock::lock;
use crate::domain::{ProducerId, ServiceError};

pub const DEFAULT_MAX_WAIT_FOR_ALL_EVENTS_SENT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureStatus {
    Started,
    Stopping,
    #[default]
    Finished,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub max_wait_for_all_events_sent: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { max_wait_for_all_events_sent: DEFAULT_MAX_WAIT_FOR_ALL_EVENTS_SENT }
    }
}

pub type ProducerStream = dyn BidiStream<ServerCommand, ProducerMessage>;

struct Connection {
    stream: Arc<ProducerStream>,
    closed: bool,
}

struct ServiceState {
    status: CaptureStatus,
    /// Bumped on every status change.
    generation: u64,
    options: Option<CaptureOptions>,
    processor: Option<Arc<dyn ProducerEventProcessor>>,
    connections: HashMap<ProducerId, Connection>,
    awaiting_all_events: HashSet<ProducerId>,
    rpc_allowed: bool,
}

impl ServiceState {
    fn set_status(&mut self, status: CaptureStatus) {
        self.status = status;
        self.generation += 1;
    }

    fn is_closed(&self, id: ProducerId) -> bool {
        self.connections.get(&id).map_or(true, |c| c.closed)
    }
}

pub struct ProducerSideService {
    config: ServiceConfig,
    state: Mutex<ServiceState>,
    changed: Condvar,
    next_producer_id: AtomicU64,
}

impl Default for ProducerSideService {
    fn default() -> Self {
        Self::new(ServiceConfig::default())
    }
}

impl ProducerSideService {
    #[must_use]
    pub fn new(config: ServiceConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ServiceState {
                status: CaptureStatus::Finished,
                generation: 0,
                options: None,
                processor: None,
                connections: HashMap::new(),
                awaiting_all_events: HashSet::new(),
                rpc_allowed: true,
            }),
            changed: Condvar::new(),
            next_producer_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn capture_status(&self) -> CaptureStatus {
        lock(&self.state).status
    }

    /// Producers whose stream is still open.
    #[must_use]
    pub fn connected_producers(&self) -> usize {
        lock(&self.state).connections.values().filter(|c| !c.closed).count()
    }

    /// Serve one producer until its stream ends or is cancelled.
    ///
    /// # Errors
    /// `RpcDisallowed` after [`Self::finish_and_disallow_rpc`].
    pub fn receive_commands_and_send_events<S>(&self, stream: Arc<S>) -> Result<(), ServiceError>
    where
        S: BidiStream<ServerCommand, ProducerMessage> + 'static,
    {
        let stream: Arc<ProducerStream> = stream;
        let id = ProducerId(self.next_producer_id.fetch_add(1, Ordering::Relaxed));
        {
            let mut state = lock(&self.state);
            if !state.rpc_allowed {
                return Err(ServiceError::RpcDisallowed);
            }
            state.connections.insert(id, Connection { stream: Arc::clone(&stream), closed: false });
            if state.status != CaptureStatus::Finished {
                state.awaiting_all_events.insert(id);
            }
        }
        info!("{id} connected");

        let producer_state = Mutex::new(ProducerState::Idle);
        std::thread::scope(|scope| {
            let sender = std::thread::Builder::new()
                .name(format!("trawl-send-{}", id.0))
                .spawn_scoped(scope, || self.send_commands(id, stream.as_ref(), &producer_state));
            if let Err(e) = sender {
                error!("Failed to spawn command sender for {id}: {e}");
                stream.try_cancel();
            }
            self.receive_events(id, stream.as_ref(), &producer_state);
            self.mark_disconnected(id, &producer_state);
        });

        lock(&self.state).connections.remove(&id);
        self.changed.notify_all();
        info!("{id} disconnected");
        Ok(())
    }

    /// # Errors
    /// `InvalidOptions` if the options do not validate, `CaptureInProgress`
    /// unless the previous capture has finished.
    pub fn on_capture_start_requested(
        &self,
        options: CaptureOptions,
        processor: Arc<dyn ProducerEventProcessor>,
    ) -> Result<(), ServiceError> {
        options.validate()?;

        let mut state = lock(&self.state);
        if state.status != CaptureStatus::Finished {
            return Err(ServiceError::CaptureInProgress);
        }
        let open: HashSet<ProducerId> =
            state.connections.iter().filter(|(_, c)| !c.closed).map(|(&id, _)| id).collect();
        info!("Starting capture of PID:{} with {} producer(s)", options.pid, open.len());
        state.awaiting_all_events = open;
        state.options = Some(options);
        state.processor = Some(processor);
        state.set_status(CaptureStatus::Started);
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    /// Stop the capture and wait for producers to flush.
    ///
    /// Returns the number of producers that neither sent `AllEventsSent` nor
    /// disconnected within the configured wait.
    pub fn on_capture_stop_requested(&self) -> usize {
        let mut state = lock(&self.state);
        if state.status != CaptureStatus::Started {
            debug!("Stop requested while {:?}, ignoring", state.status);
            return 0;
        }
        state.set_status(CaptureStatus::Stopping);
        self.changed.notify_all();

        let (mut state, _) = self
            .changed
            .wait_timeout_while(state, self.config.max_wait_for_all_events_sent, |s| {
                !s.awaiting_all_events.is_empty()
            })
            .unwrap_or_else(PoisonError::into_inner);

        let missing = state.awaiting_all_events.len();
        if missing > 0 {
            warn!(
                "{missing} producer(s) did not send AllEventsSent within {:?}",
                self.config.max_wait_for_all_events_sent
            );
        }
        state.awaiting_all_events.clear();
        state.set_status(CaptureStatus::Finished);
        drop(state);
        self.changed.notify_all();
        info!("Capture finished");
        missing
    }

    /// Cancel every connection and reject new ones until [`Self::allow_rpc`].
    pub fn finish_and_disallow_rpc(&self) {
        let mut state = lock(&self.state);
        state.rpc_allowed = false;
        for connection in state.connections.values() {
            connection.stream.try_cancel();
        }
        let state = self
            .changed
            .wait_while(state, |s| !s.connections.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        debug!("All producer connections closed (status {:?})", state.status);
    }

    pub fn allow_rpc(&self) {
        lock(&self.state).rpc_allowed = true;
    }

    fn wait_for_change(
        &self,
        id: ProducerId,
        seen_generation: u64,
    ) -> MutexGuard<'_, ServiceState> {
        self.changed
            .wait_while(lock(&self.state), |s| s.generation == seen_generation && !s.is_closed(id))
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn send_commands(
        &self,
        id: ProducerId,
        stream: &ProducerStream,
        producer_state: &Mutex<ProducerState>,
    ) {
        let mut prev = CaptureStatus::Finished;
        let mut seen_generation = 0;

        loop {
            let (curr, options, cycled) = {
                let state = self.wait_for_change(id, seen_generation);
                if state.is_closed(id) {
                    return;
                }
                let cycled = state.generation > seen_generation + 1;
                seen_generation = state.generation;
                (state.status, state.options.clone(), cycled)
            };

            for kind in command_sequence(prev, curr, cycled) {
                let command = match kind {
                    CommandKind::Start => ServerCommand::StartCapture {
                        capture_options: options.clone().unwrap_or_default(),
                    },
                    CommandKind::Stop => ServerCommand::StopCapture,
                    CommandKind::CaptureFinished => ServerCommand::CaptureFinished,
                };
                if let Err(violation) = lock(producer_state).apply(ProducerInput::from(&command)) {
                    warn!("{id}: {violation}");
                }
                debug!("Sending {kind:?} to {id}");
                if !stream.write(command) {
                    debug!("{id}: stream closed while sending commands");
                    return;
                }
            }
            prev = curr;
        }
    }

    fn receive_events(
        &self,
        id: ProducerId,
        stream: &ProducerStream,
        producer_state: &Mutex<ProducerState>,
    ) {
        while let Some(message) = stream.read() {
            match message {
                ProducerMessage::BufferedCaptureEvents { events } => {
                    if let Err(violation) = lock(producer_state).apply(ProducerInput::Events) {
                        warn!("{id}: {violation}, dropping {} events", events.len());
                        continue;
                    }
                    let Some(processor) = lock(&self.state).processor.clone() else {
                        continue;
                    };
                    for event in events {
                        processor.process_event(id, event);
                    }
                }
                ProducerMessage::AllEventsSent => {
                    match lock(producer_state).apply(ProducerInput::AllEventsSent) {
                        Ok(()) => {
                            debug!("{id} sent all events");
                            self.mark_done(id);
                        }
                        Err(violation) => warn!("{id}: {violation}"),
                    }
                }
            }
        }
    }

    fn mark_done(&self, id: ProducerId) {
        lock(&self.state).awaiting_all_events.remove(&id);
        self.changed.notify_all();
    }

    fn mark_disconnected(&self, id: ProducerId, producer_state: &Mutex<ProducerState>) {
        // Never fails: disconnect is accepted from every state.
        let _ = lock(producer_state).apply(ProducerInput::Disconnected);
        {
            let mut state = lock(&self.state);
            state.awaiting_all_events.remove(&id);
            if let Some(connection) = state.connections.get_mut(&id) {
                connection.closed = true;
            }
        }
        self.changed.notify_all();
    }
}
