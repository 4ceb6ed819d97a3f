use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

const RETRY_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Debug)]
pub enum SendState {
    Sent,
    /// Queue full; the payload is handed back for the retry.
    Full(Bytes),
    Closed,
}

/// Non-blocking enqueue over the bounded response queue shared with
/// the broker-facing pump.
pub trait QueueSink: Send + Sync {
    fn try_send(&self, payload: Bytes) -> SendState;
}

impl QueueSink for mpsc::Sender<Bytes> {
    fn try_send(&self, payload: Bytes) -> SendState {
        match mpsc::Sender::try_send(self, payload) {
            Ok(()) => SendState::Sent,
            Err(mpsc::error::TrySendError::Full(payload)) => SendState::Full(payload),
            Err(mpsc::error::TrySendError::Closed(_)) => SendState::Closed,
        }
    }
}

/// Spin until the payload is accepted, backing off briefly between
/// attempts so a stalled consumer does not pin a core. Returns false
/// only when the consumer is gone for good.
pub fn send_blocking(sink: &dyn QueueSink, payload: Bytes) -> bool {
    let mut payload = payload;
    loop {
        match sink.try_send(payload) {
            SendState::Sent => return true,
            SendState::Closed => return false,
            SendState::Full(returned) => {
                payload = returned;
                std::thread::sleep(RETRY_BACKOFF);
            }
        }
    }
}
