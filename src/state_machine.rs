//! Job state machine for a recognition session
//!
//! All transitions go through the `reduce()` function. The sender and receiver
//! loops both feed it events; the session serialises those calls behind one
//! lock.
//!
//! ```text
//! Initializing ─▶ Ready ─▶ PreparingJob ─┬─▶ ProcessingAudio ──────┬─▶ Completed
//!                                        └─▶ ReadyForAudioPackets ─┘
//!            (any non-terminal state) ─▶ Error
//! ```

/// State of the single job a session carries.
/// `Ready` and `Completed` are both idle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobState {
    #[default]
    Initializing,
    Ready,
    PreparingJob,
    ReadyForAudioPackets,
    ProcessingAudio,
    Completed,
    Error,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Initializing => "initializing",
            JobState::Ready => "ready",
            JobState::PreparingJob => "preparing_job",
            JobState::ReadyForAudioPackets => "ready_for_audio_packets",
            JobState::ProcessingAudio => "processing_audio",
            JobState::Completed => "completed",
            JobState::Error => "error",
        }
    }

    /// No further sends are allowed once a job is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Error)
    }

    /// Idle states, in which no job is running
    pub fn is_idle(&self) -> bool {
        matches!(self, JobState::Ready | JobState::Completed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of job being run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Finite audio source sent in full by the session
    File,
    /// Live audio fed by the caller through `send_audio_packet`
    Voice,
}

/// Events that can trigger job state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    /// Session finished construction
    Constructed,
    /// Caller started a job
    JobRequested,
    /// Socket is open and `speech.config` went out
    ConfigSent { kind: JobKind },
    /// Zero-length RIFF header went out (voice jobs)
    PlaceholderSent,
    /// Empty audio message went out
    TerminatorSent,
    /// Final `speech.phrase` received
    PhraseReceived,
    /// Send, receive or parse failure
    Failed { reason: String },
}

/// Reducer function: (state, event) -> next_state
///
/// Transitions only move forward along the job path; `Error` is reachable from
/// every non-terminal state. Events that do not apply leave the state as is.
pub fn reduce(state: JobState, event: &JobEvent) -> JobState {
    use JobEvent::*;
    use JobState::*;

    match (state, event) {
        (Initializing, Constructed) => Ready,

        (Ready, JobRequested) => PreparingJob,

        (PreparingJob, ConfigSent { kind: JobKind::File }) => ProcessingAudio,
        // voice jobs wait for the placeholder header before accepting audio
        (PreparingJob, ConfigSent { kind: JobKind::Voice }) => PreparingJob,
        (PreparingJob, PlaceholderSent) => ReadyForAudioPackets,

        (ProcessingAudio | ReadyForAudioPackets, TerminatorSent) => Completed,
        (PreparingJob | ProcessingAudio | ReadyForAudioPackets, PhraseReceived) => Completed,

        (s, Failed { .. }) if !s.is_terminal() => Error,

        _ => state,
    }
}
