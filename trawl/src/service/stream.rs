//! Bidirectional message streams between the service and its producers.
//!
//! [`BidiStream`] is the whole transport contract: blocking `read`, `write`
//! that reports whether the peer can still be reached, and `try_cancel` to
//! abort both directions from any thread. Two implementations ship:
//!
//! - [`in_process_channel`]: a pair of crossbeam channels, for producers living
//!   in the service process and for tests
//! - [`FramedUnixStream`]: length-delimited JSON frames over a Unix socket

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use trawl_common::{FrameReader, FrameWriter};

use crate::clock::lock;
use crate::domain::TransportError;

pub trait BidiStream<Out, In>: Send + Sync {
    /// Send one message. Returns false once the stream is closed or cancelled.
    fn write(&self, message: Out) -> bool;

    /// Block for the next message. `None` on end of stream or cancellation.
    fn read(&self) -> Option<In>;

    /// Abort the stream in both directions. Idempotent.
    fn try_cancel(&self);
}

struct CancelSignal {
    cancelled: AtomicBool,
    /// Dropped on cancel; readers select on the matching receiver.
    trigger: Mutex<Option<Sender<()>>>,
    fired: Receiver<()>,
}

impl CancelSignal {
    fn new() -> Self {
        let (trigger, fired) = unbounded();
        Self { cancelled: AtomicBool::new(false), trigger: Mutex::new(Some(trigger)), fired }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        lock(&self.trigger).take();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// One end of an in-process stream.
pub struct ChannelStream<Out, In> {
    tx: Sender<Out>,
    rx: Receiver<In>,
    cancel: Arc<CancelSignal>,
}

/// Create two connected ends. Cancelling either end cancels the link.
#[must_use]
pub fn in_process_channel<A: Send, B: Send>() -> (ChannelStream<A, B>, ChannelStream<B, A>) {
    let (a_tx, a_rx) = unbounded();
    let (b_tx, b_rx) = unbounded();
    let cancel = Arc::new(CancelSignal::new());
    (
        ChannelStream { tx: a_tx, rx: b_rx, cancel: Arc::clone(&cancel) },
        ChannelStream { tx: b_tx, rx: a_rx, cancel },
    )
}

impl<Out: Send, In: Send> BidiStream<Out, In> for ChannelStream<Out, In> {
    fn write(&self, message: Out) -> bool {
        !self.cancel.is_cancelled() && self.tx.send(message).is_ok()
    }

    fn read(&self) -> Option<In> {
        if self.cancel.is_cancelled() {
            return None;
        }
        select! {
            recv(self.rx) -> message => message.ok(),
            recv(self.cancel.fired) -> _ => None,
        }
    }

    fn try_cancel(&self) {
        self.cancel.cancel();
    }
}

/// Framed JSON over a Unix socket.
pub struct FramedUnixStream<Out, In> {
    reader: Mutex<FrameReader<UnixStream, In>>,
    writer: Mutex<FrameWriter<UnixStream>>,
    control: UnixStream,
    _marker: PhantomData<fn(Out)>,
}

impl<Out, In: DeserializeOwned> FramedUnixStream<Out, In> {
    /// # Errors
    /// Fails if the socket cannot be cloned for independent read/write halves.
    pub fn new(stream: UnixStream) -> Result<Self, TransportError> {
        let reader = FrameReader::new(stream.try_clone()?);
        let writer = FrameWriter::new(stream.try_clone()?);
        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            control: stream,
            _marker: PhantomData,
        })
    }

    /// # Errors
    /// Connection or clone failures.
    pub fn connect(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        Self::new(UnixStream::connect(path)?)
    }
}

impl<Out, In> BidiStream<Out, In> for FramedUnixStream<Out, In>
where
    Out: Serialize,
    In: DeserializeOwned,
{
    fn write(&self, message: Out) -> bool {
        let mut writer = lock(&self.writer);
        match writer.write_message(&message) {
            Ok(()) => true,
            Err(e) => {
                debug!("Stream write failed: {e}");
                false
            }
        }
    }

    fn read(&self) -> Option<In> {
        let mut reader = lock(&self.reader);
        match reader.read_message() {
            Ok(message) => message,
            Err(e) => {
                warn!("Stream read failed: {e}");
                None
            }
        }
    }

    fn try_cancel(&self) {
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            debug!("Socket shutdown: {e}");
        }
    }
}
