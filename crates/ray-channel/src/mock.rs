use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use ray_core::{ChannelError, OutboundTurn, RemoteChannel, StopAck, StopRequest};

/// Pre-programmed replies for deterministic testing without a live agent.
pub enum MockReply {
    /// Return this payload from send_turn.
    Json(Value),
    /// Return an error from the send_turn call itself.
    Error(ChannelError),
    /// Wait a duration, then yield the inner reply.
    Delayed(Duration, Box<MockReply>),
}

impl MockReply {
    /// Convenience: a final turn carrying only text.
    pub fn final_text(text: &str) -> Self {
        Self::Json(json!({"message": text, "is_final": true}))
    }

    /// Convenience: an in-progress status update.
    pub fn working(text: &str) -> Self {
        Self::Json(json!({"message": text, "status": "working"}))
    }

    /// Convenience: an empty ack body (the real reply arrives via webhook).
    pub fn ack() -> Self {
        Self::Json(Value::Null)
    }

    /// Convenience: wrap any reply with a delay.
    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delayed(delay, Box::new(inner))
    }
}

/// Mock channel that returns pre-programmed replies in sequence and
/// records everything sent through it.
pub struct MockChannel {
    replies: Mutex<VecDeque<MockReply>>,
    sent: Mutex<Vec<OutboundTurn>>,
    stops: Mutex<Vec<StopRequest>>,
    stop_ack: Mutex<StopAck>,
}

impl MockChannel {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            sent: Mutex::new(Vec::new()),
            stops: Mutex::new(Vec::new()),
            stop_ack: Mutex::new(StopAck {
                status: "ok".into(),
                cancelled: true,
                task_id: None,
                chat_id: None,
            }),
        }
    }

    /// Queue another reply after construction.
    pub fn push_reply(&self, reply: MockReply) {
        self.replies.lock().push_back(reply);
    }

    /// Everything delivered through send_turn, in order.
    pub fn sent(&self) -> Vec<OutboundTurn> {
        self.sent.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Every stop request received, in order.
    pub fn stops(&self) -> Vec<StopRequest> {
        self.stops.lock().clone()
    }

    pub fn set_stop_ack(&self, ack: StopAck) {
        *self.stop_ack.lock() = ack;
    }
}

#[async_trait]
impl RemoteChannel for MockChannel {
    async fn send_turn(&self, turn: &OutboundTurn) -> Result<Value, ChannelError> {
        self.sent.lock().push(turn.clone());

        let Some(reply) = self.replies.lock().pop_front() else {
            return Err(ChannelError::Network("no reply configured".into()));
        };

        // Unroll nested delays iteratively to avoid recursive async.
        let mut current = reply;
        loop {
            match current {
                MockReply::Json(value) => return Ok(value),
                MockReply::Error(e) => return Err(e),
                MockReply::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    current = *inner;
                }
            }
        }
    }

    async fn request_stop(&self, request: StopRequest) -> Result<StopAck, ChannelError> {
        self.stops.lock().push(request);
        Ok(self.stop_ack.lock().clone())
    }
}
