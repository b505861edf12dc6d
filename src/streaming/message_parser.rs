//! Inbound message handling
//!
//! Decodes a text message and works out what it means for the job:
//! hypotheses update the recognized text, a phrase sets the final text and
//! completes the job. Every other path is informational.

use super::dispatcher::ResultDispatcher;
use super::frame_codec::decode_text_message;
use super::protocol::{InboundResult, SpeechMessagePath};
use super::SpeechError;
use crate::state_machine::{reduce, JobEvent, JobState};

/// A decoded message together with its effect on the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub result: InboundResult,
    /// `Some` when this message replaces the recognized text. The inner value
    /// is `None` for results without text (e.g. `NoMatch` phrases).
    pub text_update: Option<Option<String>>,
    /// This is the final result for the request id
    pub completes_job: bool,
}

/// Decode `text` and derive its side effects
pub fn parse_message(text: &str) -> Result<ParsedMessage, SpeechError> {
    let result = decode_text_message(text)?;
    let body = result.body.as_ref();

    let (text_update, completes_job) = match result.path {
        SpeechMessagePath::SpeechHypothesis => (Some(body.and_then(|b| b.text.clone())), false),
        SpeechMessagePath::SpeechPhrase => (Some(body.and_then(|b| b.display_text.clone())), true),
        _ => (None, false),
    };

    Ok(ParsedMessage {
        result,
        text_update,
        completes_job,
    })
}

impl ParsedMessage {
    /// Apply this message to the session: text first, then state, then fan-out.
    /// Returns the state after the message.
    pub fn apply(self, state: &mut JobState, dispatcher: &mut ResultDispatcher) -> JobState {
        if let Some(text) = self.text_update {
            dispatcher.set_recognized_text(text);
        }
        if self.completes_job {
            *state = reduce(*state, &JobEvent::PhraseReceived);
        }
        dispatcher.dispatch(self.result);
        *state
    }
}
