//! Recording transport for session-layer tests.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    OutputReceiver, Transport, TransportError, TransportEvent, OUTPUT_CHANNEL_CAPACITY,
};
use crate::protocol::SignalName;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MockOp {
    Write(Vec<u8>),
    Resize(u16, u16),
    Signal(SignalName),
    Close,
}

/// Transport that records every operation in submission order and lets the
/// test inject output events.
pub(crate) struct MockTransport {
    pub ops: Arc<Mutex<Vec<MockOp>>>,
}

impl MockTransport {
    pub fn open() -> (Self, OutputReceiver, mpsc::Sender<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        (
            Self {
                ops: Arc::new(Mutex::new(Vec::new())),
            },
            event_rx,
            event_tx,
        )
    }

    pub fn recorded(&self) -> Arc<Mutex<Vec<MockOp>>> {
        self.ops.clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        self.ops.lock().push(MockOp::Write(data.to_vec()));
        Ok(())
    }

    async fn resize(&self, rows: u16, cols: u16) -> Result<(), TransportError> {
        self.ops.lock().push(MockOp::Resize(rows, cols));
        Ok(())
    }

    async fn signal(&self, signal: SignalName) -> Result<(), TransportError> {
        self.ops.lock().push(MockOp::Signal(signal));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.ops.lock().push(MockOp::Close);
        Ok(())
    }
}
