//! Fan-out of decoded results to subscribers
//!
//! Every decoded message is cached as the last result, even with no
//! subscribers, then pushed to each live subscriber channel in arrival order.
//! The dispatcher also holds the session's best recognized text:
//!
//! - **Hypothesis**: provisional, replaced by the next hypothesis
//! - **Phrase**: final display text for the utterance

use tokio::sync::mpsc;

use super::protocol::InboundResult;

/// Routes results to subscribers and tracks the recognized text
#[derive(Debug, Default)]
pub struct ResultDispatcher {
    subscribers: Vec<mpsc::UnboundedSender<InboundResult>>,
    last_result: Option<InboundResult>,
    recognized_text: Option<String>,
    dispatched: u64,
}

impl ResultDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new consumer. It sees results dispatched from now on.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<InboundResult> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Cache `result` and deliver it to every subscriber still listening
    pub fn dispatch(&mut self, result: InboundResult) {
        self.subscribers.retain(|tx| tx.send(result.clone()).is_ok());
        self.last_result = Some(result);
        self.dispatched += 1;

        if self.dispatched % 10 == 0 {
            log::debug!(
                "ResultDispatcher: {} results dispatched, {} subscribers",
                self.dispatched,
                self.subscribers.len()
            );
        }
    }

    /// Replace the recognized text; `None` clears it
    pub fn set_recognized_text(&mut self, text: Option<String>) {
        self.recognized_text = text;
    }

    pub fn recognized_text(&self) -> Option<&str> {
        self.recognized_text.as_deref()
    }

    pub fn last_result(&self) -> Option<&InboundResult> {
        self.last_result.as_ref()
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
