//! Per-producer capture state machine.
//!
//! ```text
//!         Start            Stop             AllEventsSent           CaptureFinished
//!  Idle ─────────▶ Capturing ────▶ Stopping ──────────────▶ Finishing ──────────────▶ Idle
//!                                     │                                                ▲
//!                                     └──────────────── CaptureFinished ───────────────┘
//!  Disconnected: any state ──▶ Idle
//! ```
//!
//! Commands arriving in a state that already satisfies them (`Start` while
//! capturing, `Stop` while idle) remain in place. Inputs that indicate a
//! confused peer fail without changing state.

use std::fmt;

use crate::service::CaptureStatus;
use trawl_common::ServerCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProducerState {
    #[default]
    Idle,
    Capturing,
    Stopping,
    Finishing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerInput {
    Start,
    Stop,
    CaptureFinished,
    Events,
    AllEventsSent,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    EventsOutsideCapture,
    UnexpectedAllEventsSent,
    StartBeforeFinished,
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolViolation::EventsOutsideCapture => {
                write!(f, "events received outside a capture")
            }
            ProtocolViolation::UnexpectedAllEventsSent => write!(f, "unexpected AllEventsSent"),
            ProtocolViolation::StartBeforeFinished => {
                write!(f, "capture started before the previous one finished")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Remain,
    Advance(ProducerState),
    Fail(ProtocolViolation),
}

impl ProducerState {
    #[must_use]
    pub fn on(self, input: ProducerInput) -> Transition {
        use ProducerInput as I;
        use ProducerState as S;
        use Transition::{Advance, Fail, Remain};

        match (self, input) {
            (S::Idle, I::Disconnected) => Remain,
            (_, I::Disconnected) => Advance(S::Idle),

            (S::Idle, I::Start) => Advance(S::Capturing),
            (S::Capturing, I::Start) => Remain,
            (S::Stopping | S::Finishing, I::Start) => Fail(ProtocolViolation::StartBeforeFinished),

            (S::Capturing, I::Stop) => Advance(S::Stopping),
            (S::Idle | S::Stopping | S::Finishing, I::Stop) => Remain,

            (S::Capturing | S::Stopping, I::Events) => Remain,
            (S::Idle | S::Finishing, I::Events) => Fail(ProtocolViolation::EventsOutsideCapture),

            (S::Stopping, I::AllEventsSent) => Advance(S::Finishing),
            (S::Idle | S::Capturing | S::Finishing, I::AllEventsSent) => {
                Fail(ProtocolViolation::UnexpectedAllEventsSent)
            }

            (S::Stopping | S::Finishing | S::Capturing, I::CaptureFinished) => Advance(S::Idle),
            (S::Idle, I::CaptureFinished) => Remain,
        }
    }

    /// Apply `input`, returning the violation if the input was rejected.
    pub fn apply(&mut self, input: ProducerInput) -> Result<(), ProtocolViolation> {
        match self.on(input) {
            Transition::Remain => Ok(()),
            Transition::Advance(next) => {
                *self = next;
                Ok(())
            }
            Transition::Fail(violation) => Err(violation),
        }
    }
}

impl From<&ServerCommand> for ProducerInput {
    fn from(command: &ServerCommand) -> Self {
        match command {
            ServerCommand::StartCapture { .. } => ProducerInput::Start,
            ServerCommand::StopCapture => ProducerInput::Stop,
            ServerCommand::CaptureFinished => ProducerInput::CaptureFinished,
        }
    }
}

/// Kind of command a connection owes its producer for a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Start,
    Stop,
    CaptureFinished,
}

/// Commands that move a producer from `prev` to `curr`. `cycled` means the
/// service went through a full capture cycle in between, so an unchanged
/// status still owes the producer a finish and a restart.
#[must_use]
pub fn command_sequence(
    prev: CaptureStatus,
    curr: CaptureStatus,
    cycled: bool,
) -> Vec<CommandKind> {
    use CaptureStatus::{Finished, Started, Stopping};
    use CommandKind::{CaptureFinished, Start, Stop};

    match (prev, curr) {
        (Finished, Finished) => Vec::new(),
        (Finished, Started) => vec![Start],
        (Finished, Stopping) => vec![Start, Stop],
        (Started, Started) if cycled => vec![Stop, CaptureFinished, Start],
        (Started, Started) => Vec::new(),
        (Started, Stopping) => vec![Stop],
        (Started, Finished) => vec![Stop, CaptureFinished],
        (Stopping, Stopping) if cycled => vec![CaptureFinished, Start, Stop],
        (Stopping, Stopping) => Vec::new(),
        (Stopping, Finished) => vec![CaptureFinished],
        (Stopping, Started) => vec![CaptureFinished, Start],
    }
}
