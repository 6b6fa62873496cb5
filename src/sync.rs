//! Completion tokens for asynchronous stage work.
//!
//! A stage hands back a [`SyncPoint`] for every output it produces; whoever
//! completes the work (the stage itself, or a worker thread it owns) holds
//! the matching [`SyncSignal`].

use std::fmt;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};

use crate::classifier::FrameType;
use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedUnit {
    pub sequence: u64,
    pub pts: i64,
    pub frame_type: FrameType,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// A surface-producing stage finished; carries the frame's timestamp.
    Frame { pts: i64 },
    /// The encoder finished one output unit.
    Unit(EncodedUnit),
}

type Outcome = Result<Completion, String>;

pub struct SyncPoint {
    rx: Receiver<Outcome>,
}

pub struct SyncSignal {
    tx: Sender<Outcome>,
}

impl SyncPoint {
    pub fn pending() -> (SyncSignal, SyncPoint) {
        let (tx, rx) = bounded(1);
        (SyncSignal { tx }, SyncPoint { rx })
    }

    pub fn ready(completion: Completion) -> Self {
        let (signal, sync) = Self::pending();
        signal.complete(completion);
        sync
    }

    pub fn failed(message: impl Into<String>) -> Self {
        let (signal, sync) = Self::pending();
        signal.fail(message);
        sync
    }

    pub fn is_signalled(&self) -> bool {
        !self.rx.is_empty()
    }

    pub fn wait(self, operation: &str, timeout: Duration) -> PipelineResult<Completion> {
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(completion)) => Ok(completion),
            Ok(Err(message)) => Err(PipelineError::stage(operation, message)),
            Err(RecvTimeoutError::Timeout) => Err(PipelineError::SyncTimeout {
                operation: operation.to_string(),
                waited: timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(PipelineError::stage(
                operation,
                "completion signal dropped before it fired",
            )),
        }
    }
}

impl SyncSignal {
    pub fn complete(self, completion: Completion) {
        let _ = self.tx.send(Ok(completion));
    }

    pub fn fail(self, message: impl Into<String>) {
        let _ = self.tx.send(Err(message.into()));
    }
}

impl fmt::Debug for SyncPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncPoint")
            .field("signalled", &self.is_signalled())
            .finish()
    }
}
