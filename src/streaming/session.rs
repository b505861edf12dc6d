//! Connection session: one socket, one recognition job
//!
//! # Job Flow
//!
//! 1. `connect()` - Open the WebSocket (connection id + bearer token headers)
//! 2. `run_file_job()` / `run_voice_job()` - Sender and receiver run concurrently
//! 3. `send_audio_packet()` / `end_audio()` - Live audio for voice jobs
//! 4. `close()` - Start the close handshake; the receive loop exits once the
//!    peer answers and the job call returns
//!
//! # Failure Strategy
//!
//! Any send, receive or parse failure is terminal for the job: the state moves
//! to `Error`, the socket is closed, and the job call returns `false`. Nothing
//! is retried; a new job needs a new session.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::dispatcher::ResultDispatcher;
use super::frame_codec::{check_frame_size, MAX_FRAME_BYTES};
use super::message_builder::MessageBuilder;
use super::message_parser::parse_message;
use super::protocol::{Endpoint, InboundResult, RequestId};
use super::transport::{connect_websocket, Frame, FrameSink, FrameSource};
use super::SpeechError;
use crate::audio::WavCapture;
use crate::state_machine::{reduce, JobEvent, JobKind, JobState};

/// State shared by the sender, the receiver and the caller
#[derive(Debug, Default)]
struct SessionShared {
    state: JobState,
    dispatcher: ResultDispatcher,
    last_error: Option<SpeechError>,
}

/// Handle to a speech socket carrying a single recognition job
///
/// All methods take `&self`; wrap the session in an `Arc` to feed live audio
/// from another task while `run_voice_job` is running.
pub struct ConnectionSession {
    connection_id: String,
    builder: MessageBuilder,
    max_frame_bytes: usize,
    /// Write half, used by the sender side (and close handshakes)
    sink: tokio::sync::Mutex<Box<dyn FrameSink>>,
    /// Read half, taken by the receive loop
    source: Mutex<Option<Box<dyn FrameSource>>>,
    shared: Mutex<SessionShared>,
    /// Mirrors `shared.state` for callers waiting on a transition
    state_tx: watch::Sender<JobState>,
    open: AtomicBool,
    close_sent: AtomicBool,
    terminator_sent: AtomicBool,
    capture: Mutex<Option<WavCapture>>,
}

impl ConnectionSession {
    /// Connect to the speech service
    ///
    /// # Returns
    /// * `Ok(ConnectionSession)` - Socket open, session `Ready`
    /// * `Err(SpeechError::ConnectFailed)` - Handshake failed
    pub async fn connect(endpoint: &Endpoint, token: &str) -> Result<Self, SpeechError> {
        let (sink, source, connection_id) = connect_websocket(&endpoint.url(), token).await?;
        Ok(Self::build(Box::new(sink), Box::new(source), connection_id))
    }

    /// Build a session over an already open transport
    pub fn with_transport(
        sink: impl FrameSink + 'static,
        source: impl FrameSource + 'static,
    ) -> Self {
        Self::build(
            Box::new(sink),
            Box::new(source),
            Uuid::new_v4().simple().to_string(),
        )
    }

    fn build(
        sink: Box<dyn FrameSink>,
        source: Box<dyn FrameSource>,
        connection_id: String,
    ) -> Self {
        let session = Self {
            connection_id,
            builder: MessageBuilder::new(RequestId::new()),
            max_frame_bytes: MAX_FRAME_BYTES,
            sink: tokio::sync::Mutex::new(sink),
            source: Mutex::new(Some(source)),
            shared: Mutex::new(SessionShared::default()),
            state_tx: watch::Sender::new(JobState::default()),
            open: AtomicBool::new(true),
            close_sent: AtomicBool::new(false),
            terminator_sent: AtomicBool::new(false),
            capture: Mutex::new(None),
        };
        session.transition(JobEvent::Constructed);
        session
    }

    /// Lower the per-frame size limit (never above 8192 bytes)
    pub fn with_max_frame_bytes(mut self, limit: usize) -> Self {
        self.max_frame_bytes = limit.min(MAX_FRAME_BYTES);
        self
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Request id stamped on every frame of this session's job
    pub fn request_id(&self) -> &RequestId {
        self.builder.request_id()
    }

    pub fn state(&self) -> JobState {
        self.shared().state
    }

    /// Follow state transitions, e.g. to wait for `ReadyForAudioPackets`
    pub fn watch_state(&self) -> watch::Receiver<JobState> {
        self.state_tx.subscribe()
    }

    pub fn recognized_text(&self) -> Option<String> {
        self.shared().dispatcher.recognized_text().map(str::to_string)
    }

    /// Most recent decoded message, kept even when nobody subscribed
    pub fn last_result(&self) -> Option<InboundResult> {
        self.shared().dispatcher.last_result().cloned()
    }

    /// First failure that ended the job, if any
    pub fn last_error(&self) -> Option<SpeechError> {
        self.shared().last_error.clone()
    }

    /// Receive every result decoded from now on, in arrival order
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<InboundResult> {
        self.shared().dispatcher.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Record every PCM byte sent as audio into `capture`
    pub fn set_capture(&self, capture: WavCapture) {
        *self.capture.lock().unwrap_or_else(|e| e.into_inner()) = Some(capture);
    }

    /// Detach the capture sink so it can be finalized
    pub fn take_capture(&self) -> Option<WavCapture> {
        self.capture.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    // ------------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------------

    /// Send a finite audio file: config, chunked audio, terminator
    ///
    /// Returns `true` once both loops finished and the job is `Completed`.
    pub async fn run_file_job(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        match tokio::fs::File::open(path).await {
            Ok(file) => {
                log::info!("Preparing to send audio file {:?}", path);
                self.run_job_from_reader(file).await
            }
            Err(e) => {
                if self.begin_job(JobKind::File) {
                    self.fail(&SpeechError::Io(format!("open {:?}: {}", path, e)));
                    self.close().await;
                }
                false
            }
        }
    }

    /// File job over any byte source
    pub async fn run_job_from_reader<R>(&self, reader: R) -> bool
    where
        R: AsyncRead + Unpin + Send,
    {
        if !self.begin_job(JobKind::File) {
            return false;
        }

        let sending = async {
            let result = self.send_file_audio(reader).await;
            self.guard_sender(result).await
        };
        let (sent, received) = tokio::join!(sending, self.receive_loop());
        self.finish_job(sent, received).await
    }

    /// Live job: config and a zero-length WAV header, then audio arrives via
    /// [`send_audio_packet`](Self::send_audio_packet)
    ///
    /// Moves to `ReadyForAudioPackets` once the header is out and returns when
    /// the receive loop ends (peer or caller closed the socket).
    pub async fn run_voice_job(&self, resolution: u16, channels: u16, rate: u32) -> bool {
        if !self.begin_job(JobKind::Voice) {
            return false;
        }

        let sending = async {
            let result = self.send_voice_preamble(resolution, channels, rate).await;
            self.guard_sender(result).await
        };
        let (sent, received) = tokio::join!(sending, self.receive_loop());
        self.finish_job(sent, received).await
    }

    /// Frame and send one live audio packet
    ///
    /// Dropped when the socket is closed or the job is not accepting audio.
    /// Failures end the job; they show up in `state()` and the job result.
    pub async fn send_audio_packet(&self, pcm: &[u8]) {
        if !self.can_send() {
            log::debug!("Dropping {} byte audio packet: socket closed", pcm.len());
            return;
        }
        if self.state() != JobState::ReadyForAudioPackets
            || self.terminator_sent.load(Ordering::SeqCst)
        {
            log::debug!(
                "Dropping {} byte audio packet: job is {}",
                pcm.len(),
                self.state()
            );
            return;
        }

        match self.send_audio_frame(pcm).await {
            Ok(true) => log::debug!("Sent {} byte audio packet", pcm.len()),
            Ok(false) => {
                log::debug!("Dropping {} byte audio packet: end of audio sent", pcm.len())
            }
            Err(e) => {
                self.fail(&e);
                self.close().await;
            }
        }
    }

    /// Mark the end of live audio by sending the terminator (once)
    pub async fn end_audio(&self) {
        if self.state() != JobState::ReadyForAudioPackets {
            log::debug!("Ignoring end of audio: job is {}", self.state());
            return;
        }
        if let Err(e) = self.send_terminator().await {
            self.fail(&e);
            self.close().await;
        }
    }

    /// Start the close handshake. Idempotent.
    pub async fn close(&self) {
        if self.close_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        log::info!("Closing WebSocket (connection {})", self.connection_id);
        if let Err(e) = self.sink.lock().await.close().await {
            log::debug!("Close handshake: {}", e);
        }
    }

    // ------------------------------------------------------------------------
    // Sender side
    // ------------------------------------------------------------------------

    async fn send_file_audio<R>(&self, mut reader: R) -> Result<(), SpeechError>
    where
        R: AsyncRead + Unpin,
    {
        if !self.send_config(JobKind::File).await? {
            return Ok(());
        }

        let payload_limit = self.builder.max_audio_payload(self.max_frame_bytes)?;
        let mut chunk = vec![0u8; payload_limit];
        let mut chunks_sent = 0u64;
        let mut bytes_sent = 0u64;

        loop {
            let filled = read_chunk(&mut reader, &mut chunk).await?;
            if filled == 0 {
                break;
            }
            if !self.can_send() {
                log::info!(
                    "Stopping audio after {} chunks: socket closed or job {}",
                    chunks_sent,
                    self.state()
                );
                return Ok(());
            }

            if !self.send_audio_frame(&chunk[..filled]).await? {
                log::info!("Socket closed, stopping audio after {} chunks", chunks_sent);
                return Ok(());
            }
            chunks_sent += 1;
            bytes_sent += filled as u64;
            log::debug!("Sent audio chunk {} ({} bytes)", chunks_sent, filled);

            if chunks_sent % 50 == 0 {
                log::debug!("Sent {} audio chunks ({} bytes)", chunks_sent, bytes_sent);
            }
            if filled < chunk.len() {
                break;
            }
        }

        log::info!("Audio sent: {} bytes in {} chunks", bytes_sent, chunks_sent);
        self.send_terminator().await
    }

    async fn send_voice_preamble(
        &self,
        resolution: u16,
        channels: u16,
        rate: u32,
    ) -> Result<(), SpeechError> {
        if !self.send_config(JobKind::Voice).await? {
            return Ok(());
        }

        if !self.can_send() {
            log::info!("Socket closed or job {}, skipping WAV header", self.state());
            return Ok(());
        }
        let header = self.builder.wav_placeholder(resolution, channels, rate)?;
        self.send_binary(header).await?;
        log::info!(
            "WAV header sent ({} Hz, {} ch, {} bit), ready for audio packets",
            rate,
            channels,
            resolution
        );
        self.transition(JobEvent::PlaceholderSent);
        Ok(())
    }

    /// Send `speech.config`. Returns `false` if the socket was already closed.
    async fn send_config(&self, kind: JobKind) -> Result<bool, SpeechError> {
        if !self.can_send() {
            log::warn!("Socket closed before speech.config could be sent");
            return Ok(false);
        }

        let config = self.builder.config_message()?;
        log::info!("Sending speech.config...");
        self.send_text(config).await?;
        log::info!("speech.config sent");
        self.transition(JobEvent::ConfigSent { kind });
        Ok(true)
    }

    /// Frame and send `pcm`. Returns `false` if the audio was dropped because
    /// the socket closed or the terminator already went out.
    async fn send_audio_frame(&self, pcm: &[u8]) -> Result<bool, SpeechError> {
        let frame = self.builder.audio_chunk(pcm)?;
        check_frame_size(frame.len(), self.max_frame_bytes)?;

        // checked under the sink lock: no audio may follow the terminator
        let mut sink = self.sink.lock().await;
        if self.terminator_sent.load(Ordering::SeqCst) || !self.can_send() {
            return Ok(false);
        }
        if let Err(e) = sink.send_binary(frame).await {
            self.open.store(false, Ordering::SeqCst);
            return Err(e);
        }
        drop(sink);

        self.capture_pcm(pcm);
        Ok(true)
    }

    async fn send_terminator(&self) -> Result<(), SpeechError> {
        let frame = self.builder.terminator()?;

        let mut sink = self.sink.lock().await;
        if !self.can_send() {
            log::info!("Socket closed or job finished, skipping end of audio");
            return Ok(());
        }
        if self.terminator_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = sink.send_binary(frame).await {
            self.open.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.transition(JobEvent::TerminatorSent);
        drop(sink);

        log::info!("End of audio sent for request {}", self.request_id());
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<(), SpeechError> {
        let result = self.sink.lock().await.send_text(text).await;
        if result.is_err() {
            self.open.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn send_binary(&self, bytes: Vec<u8>) -> Result<(), SpeechError> {
        let result = self.sink.lock().await.send_binary(bytes).await;
        if result.is_err() {
            self.open.store(false, Ordering::SeqCst);
        }
        result
    }

    /// On a sender failure, fail the job and close so the receive loop ends
    async fn guard_sender(&self, result: Result<(), SpeechError>) -> Result<(), SpeechError> {
        if let Err(e) = &result {
            self.fail(e);
            self.close().await;
        }
        result
    }

    fn capture_pcm(&self, pcm: &[u8]) {
        let mut capture = self.capture.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(writer) = capture.as_mut() {
            if let Err(e) = writer.write_pcm(pcm) {
                log::warn!("Audio capture disabled: {}", e);
                *capture = None;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Receiver side
    // ------------------------------------------------------------------------

    async fn receive_loop(&self) -> Result<(), SpeechError> {
        let source = self.source.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut source) = source else {
            let err = SpeechError::ReceiveFailed("socket reader already in use".to_string());
            self.fail(&err);
            return Err(err);
        };

        let result = self.drain_source(source.as_mut()).await;
        self.open.store(false, Ordering::SeqCst);
        if let Err(e) = &result {
            self.fail(e);
        }
        log::debug!("Receive loop exiting");
        result
    }

    async fn drain_source(&self, source: &mut dyn FrameSource) -> Result<(), SpeechError> {
        while let Some(frame) = source.receive().await {
            match frame? {
                Frame::Text(text) => self.handle_text(&text)?,
                Frame::Binary(bytes) => {
                    log::warn!(
                        "Dropping {} byte binary message: binary results are not supported",
                        bytes.len()
                    );
                }
                Frame::Close(reason) => {
                    log::info!(
                        "WebSocket closed by peer: {}",
                        reason.as_deref().unwrap_or("no reason")
                    );
                    self.open.store(false, Ordering::SeqCst);
                    // answer the handshake unless we started it
                    if !self.close_sent.swap(true, Ordering::SeqCst) {
                        if let Err(e) = self.sink.lock().await.close().await {
                            log::debug!("Close acknowledgement: {}", e);
                        }
                    }
                    return Ok(());
                }
            }
        }
        log::debug!("Socket stream ended without a close frame");
        Ok(())
    }

    fn handle_text(&self, text: &str) -> Result<(), SpeechError> {
        let parsed = parse_message(text)?;
        log::debug!(
            "Received {:?} (request {})",
            parsed.result.path,
            parsed.result.request_id.as_deref().unwrap_or("-")
        );
        if let Some(id) = parsed.result.request_id.as_deref() {
            if !id.eq_ignore_ascii_case(self.request_id().as_str()) {
                log::debug!(
                    "Inbound request id {} differs from job request {}",
                    id,
                    self.request_id()
                );
            }
        }

        let mut shared = self.shared();
        let SessionShared {
            state, dispatcher, ..
        } = &mut *shared;
        let previous = *state;
        let next = parsed.apply(state, dispatcher);
        if next != previous {
            log::info!("Job state transition: {} -> {} (phrase)", previous, next);
            self.state_tx.send_replace(next);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    fn shared(&self) -> MutexGuard<'_, SessionShared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, event: JobEvent) -> JobState {
        let mut shared = self.shared();
        let previous = shared.state;
        shared.state = reduce(previous, &event);
        if shared.state != previous {
            log::info!(
                "Job state transition: {} -> {} ({:?})",
                previous,
                shared.state,
                event
            );
            self.state_tx.send_replace(shared.state);
        }
        shared.state
    }

    fn begin_job(&self, kind: JobKind) -> bool {
        let mut shared = self.shared();
        if shared.state != JobState::Ready {
            log::warn!(
                "Cannot start {:?} job while session is {}: a session carries one job",
                kind,
                shared.state
            );
            return false;
        }
        shared.state = reduce(shared.state, &JobEvent::JobRequested);
        self.state_tx.send_replace(shared.state);
        log::info!(
            "Starting {:?} job {} on connection {}",
            kind,
            self.builder.request_id(),
            self.connection_id
        );
        true
    }

    fn fail(&self, err: &SpeechError) {
        let mut shared = self.shared();
        if shared.last_error.is_none() {
            shared.last_error = Some(err.clone());
        }
        let previous = shared.state;
        shared.state = reduce(
            previous,
            &JobEvent::Failed {
                reason: err.to_string(),
            },
        );
        if shared.state != previous {
            log::warn!("Job failed in state {}: {}", previous, err);
            self.state_tx.send_replace(shared.state);
        }
    }

    fn can_send(&self) -> bool {
        self.is_open() && !self.state().is_terminal()
    }

    async fn finish_job(
        &self,
        sent: Result<(), SpeechError>,
        received: Result<(), SpeechError>,
    ) -> bool {
        let mut ok = true;
        for (side, result) in [("sender", &sent), ("receiver", &received)] {
            if let Err(e) = result {
                log::error!("Job {} {} failed: {}", self.request_id(), side, e);
                ok = false;
            }
        }

        let state = self.state();
        if ok && !state.is_terminal() {
            self.fail(&SpeechError::ReceiveFailed(format!(
                "socket closed while job was {}",
                state
            )));
        }

        let state = self.state();
        let ok = ok && state == JobState::Completed;
        if !ok {
            self.close().await;
        }
        log::info!(
            "Job {} finished: {} (recognized: {:?})",
            self.request_id(),
            state,
            self.recognized_text()
        );
        ok
    }
}

/// Fill `buf` from `reader`; fewer bytes only at end of input
async fn read_chunk<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize, SpeechError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
