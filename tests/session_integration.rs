//! Integration tests for the connection session
//!
//! A fake speech service sits behind an in-memory transport: it records every
//! frame the session sends and replies from a script (on `speech.config` and
//! on the end-of-audio terminator), then answers the close handshake.
//!
//! ```bash
//! cargo test --test session_integration
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use speech_socket::audio::{riff_wav_header, WavCapture};
use speech_socket::streaming::{
    decode_binary_frame, decode_text_frame, Frame, FrameSink, FrameSource, MessageBuilder,
    MessagePath, OutboundFrame, MAX_FRAME_BYTES,
};
use speech_socket::{ConnectionSession, JobState, SpeechError, SpeechMessagePath};

// ============================================================================
// In-memory transport
// ============================================================================

#[derive(Debug, Clone)]
enum Sent {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

struct ChannelSink {
    tx: mpsc::UnboundedSender<Sent>,
    sends: usize,
    /// Index of the send that fails (0 = speech.config)
    fail_on: Option<usize>,
}

impl ChannelSink {
    async fn push(&mut self, item: Sent) -> Result<(), SpeechError> {
        // let the receive loop and the fake service run between sends
        tokio::task::yield_now().await;
        let index = self.sends;
        self.sends += 1;
        if self.fail_on == Some(index) {
            return Err(SpeechError::SendFailed("connection reset".to_string()));
        }
        self.tx
            .send(item)
            .map_err(|_| SpeechError::SendFailed("service gone".to_string()))
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_text(&mut self, text: String) -> Result<(), SpeechError> {
        self.push(Sent::Text(text)).await
    }

    async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), SpeechError> {
        self.push(Sent::Binary(bytes)).await
    }

    async fn close(&mut self) -> Result<(), SpeechError> {
        self.tx
            .send(Sent::Close)
            .map_err(|_| SpeechError::SendFailed("service gone".to_string()))
    }
}

struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn receive(&mut self) -> Option<Result<Frame, SpeechError>> {
        self.rx.recv().await.map(Ok)
    }
}

// ============================================================================
// Fake service
// ============================================================================

#[derive(Default)]
struct Script {
    /// Frames queued before the job starts
    preload: Vec<Frame>,
    on_config: Vec<Frame>,
    on_terminator: Vec<Frame>,
    fail_on: Option<usize>,
}

struct Harness {
    session: Arc<ConnectionSession>,
    service: JoinHandle<Vec<Sent>>,
}

fn start(script: Script) -> Harness {
    let (sent_tx, sent_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();

    for frame in &script.preload {
        reply_tx.send(frame.clone()).unwrap();
    }

    let session = ConnectionSession::with_transport(
        ChannelSink {
            tx: sent_tx,
            sends: 0,
            fail_on: script.fail_on,
        },
        ChannelSource { rx: reply_rx },
    );
    let service = tokio::spawn(fake_service(sent_rx, reply_tx, script));

    Harness {
        session: Arc::new(session),
        service,
    }
}

async fn fake_service(
    mut sent: mpsc::UnboundedReceiver<Sent>,
    replies: mpsc::UnboundedSender<Frame>,
    script: Script,
) -> Vec<Sent> {
    let mut recorded = Vec::new();
    let mut close_sent = script
        .preload
        .iter()
        .any(|f| matches!(f, Frame::Close(_)));

    let reply = |frames: &[Frame], close_sent: &mut bool| {
        for frame in frames {
            *close_sent |= matches!(frame, Frame::Close(_));
            // the session may already have stopped reading
            let _ = replies.send(frame.clone());
        }
    };

    while let Some(item) = sent.recv().await {
        recorded.push(item.clone());
        match item {
            Sent::Text(_) => reply(&script.on_config, &mut close_sent),
            Sent::Binary(bytes) => {
                let frame = decode_binary_frame(&bytes).unwrap();
                if frame.body.is_empty() {
                    reply(&script.on_terminator, &mut close_sent);
                }
            }
            Sent::Close => {
                if !close_sent {
                    reply(&[Frame::Close(None)], &mut close_sent);
                }
                break;
            }
        }
    }
    recorded
}

fn service_message(path: &str, body: &str) -> Frame {
    Frame::Text(format!(
        "X-RequestId:5e4b4a0c9d8f4e2b8a1c3d5e7f901234\r\nContent-Type:application/json; charset=utf-8\r\nPath:{}\r\n\r\n{}",
        path, body
    ))
}

fn hypothesis(text: &str) -> Frame {
    service_message(
        "speech.hypothesis",
        &format!(r#"{{"Text":"{}","Offset":0,"Duration":1000}}"#, text),
    )
}

fn phrase(status: &str, display_text: &str) -> Frame {
    service_message(
        "speech.phrase",
        &format!(
            r#"{{"RecognitionStatus":"{}","DisplayText":"{}","Offset":0,"Duration":1000}}"#,
            status, display_text
        ),
    )
}

/// The usual service behaviour: hypothesis, final phrase, close
fn recognizes(text: &str) -> Script {
    Script {
        on_terminator: vec![
            service_message("turn.start", r#"{"context":{"serviceTag":"abc"}}"#),
            hypothesis(&text.to_lowercase()),
            phrase("Success", text),
            Frame::Close(None),
        ],
        ..Default::default()
    }
}

fn audio(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn audio_frames(recorded: &[Sent]) -> Vec<(usize, OutboundFrame)> {
    recorded
        .iter()
        .filter_map(|s| match s {
            Sent::Binary(bytes) => Some((bytes.len(), decode_binary_frame(bytes).unwrap())),
            _ => None,
        })
        .collect()
}

// ============================================================================
// File jobs
// ============================================================================

#[tokio::test]
async fn file_job_sends_config_audio_and_terminator() {
    let harness = start(recognizes("Hello world."));
    let mut results = harness.session.subscribe();
    let data = audio(20_000);

    assert_eq!(harness.session.state(), JobState::Ready);
    assert!(harness.session.run_job_from_reader(&data[..]).await);
    assert_eq!(harness.session.state(), JobState::Completed);
    assert_eq!(
        harness.session.recognized_text().as_deref(),
        Some("Hello world.")
    );
    assert!(!harness.session.is_open());

    let recorded = harness.service.await.unwrap();

    // config first
    let Sent::Text(config) = &recorded[0] else {
        panic!("first frame must be speech.config, got {:?}", recorded[0]);
    };
    let config = decode_text_frame(config).unwrap();
    assert_eq!(config.path, MessagePath::SpeechConfig);
    assert_eq!(&config.request_id, harness.session.request_id());

    // audio covers the input exactly, terminator last
    let frames = audio_frames(&recorded);
    assert!(frames.len() >= 4);
    let mut sent_audio = Vec::new();
    for (size, frame) in &frames {
        assert!(*size <= MAX_FRAME_BYTES);
        assert_eq!(frame.path, MessagePath::Audio);
        assert_eq!(&frame.request_id, harness.session.request_id());
        sent_audio.extend_from_slice(&frame.body);
    }
    assert_eq!(sent_audio, data);
    assert!(frames.last().unwrap().1.body.is_empty());
    assert!(frames[..frames.len() - 1]
        .iter()
        .all(|(_, f)| !f.body.is_empty()));

    // close acknowledged
    assert!(matches!(recorded.last(), Some(Sent::Close)));

    let paths: Vec<SpeechMessagePath> = std::iter::from_fn(|| results.try_recv().ok())
        .map(|r| r.path)
        .collect();
    assert_eq!(
        paths,
        vec![
            SpeechMessagePath::TurnStart,
            SpeechMessagePath::SpeechHypothesis,
            SpeechMessagePath::SpeechPhrase,
        ]
    );
    assert_eq!(
        harness.session.last_result().map(|r| r.path),
        Some(SpeechMessagePath::SpeechPhrase)
    );
}

#[tokio::test]
async fn lower_frame_limit_is_honored() {
    let harness = start(recognizes("Chunked."));
    let session = Arc::try_unwrap(harness.session)
        .ok()
        .unwrap()
        .with_max_frame_bytes(1024);
    let data = audio(5000);

    assert!(session.run_job_from_reader(&data[..]).await);

    let recorded = harness.service.await.unwrap();
    let frames = audio_frames(&recorded);
    assert!(frames.iter().all(|(size, _)| *size <= 1024));
    let total: usize = frames.iter().map(|(_, f)| f.body.len()).sum();
    assert_eq!(total, 5000);
}

#[tokio::test]
async fn input_filling_whole_chunks_ends_with_a_single_terminator() {
    let harness = start(recognizes("Even."));
    let payload = MessageBuilder::new(harness.session.request_id().clone())
        .max_audio_payload(MAX_FRAME_BYTES)
        .unwrap();
    let data = audio(payload * 3);

    assert!(harness.session.run_job_from_reader(&data[..]).await);

    let recorded = harness.service.await.unwrap();
    let frames = audio_frames(&recorded);
    assert_eq!(frames.len(), 4);
    for (size, frame) in &frames[..3] {
        assert_eq!(frame.body.len(), payload);
        assert!(*size <= MAX_FRAME_BYTES);
    }
    assert!(frames[3].1.body.is_empty());
    let sent: Vec<u8> = frames.iter().flat_map(|(_, f)| f.body.clone()).collect();
    assert_eq!(sent, data);
}

#[tokio::test]
async fn empty_input_sends_config_then_terminator() {
    let harness = start(Script {
        on_terminator: vec![
            phrase("InitialSilenceTimeout", ""),
            Frame::Close(None),
        ],
        ..Default::default()
    });

    assert!(harness.session.run_job_from_reader(&b""[..]).await);
    assert_eq!(harness.session.state(), JobState::Completed);

    let recorded = harness.service.await.unwrap();
    assert!(matches!(recorded[0], Sent::Text(_)));
    let frames = audio_frames(&recorded);
    assert_eq!(frames.len(), 1);
    assert!(frames[0].1.body.is_empty());
}

#[tokio::test]
async fn file_job_reads_from_disk_and_captures_audio() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("utterance.raw");
    let capture_path = dir.path().join("sent.wav");
    let data = audio(10_000);
    std::fs::write(&input, &data).unwrap();

    let harness = start(recognizes("Captured."));
    harness
        .session
        .set_capture(WavCapture::create(&capture_path, 16, 1, 16000).unwrap());

    assert!(harness.session.run_file_job(&input).await);

    let capture = harness.session.take_capture().unwrap();
    assert_eq!(capture.bytes_written(), 10_000);
    capture.finalize().unwrap();

    let reader = hound::WavReader::open(&capture_path).unwrap();
    assert_eq!(reader.spec().sample_rate, 16000);
    assert_eq!(reader.len(), 5000);

    let bytes = std::fs::read(&capture_path).unwrap();
    assert_eq!(&bytes[..44], &riff_wav_header(5000, 16, 1, 16000).unwrap()[..]);
    assert_eq!(&bytes[44..], &data[..]);
}

#[tokio::test]
async fn missing_file_fails_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let harness = start(Script::default());

    assert!(!harness.session.run_file_job(dir.path().join("absent.wav")).await);
    assert_eq!(harness.session.state(), JobState::Error);
    assert!(matches!(
        harness.session.last_error(),
        Some(SpeechError::Io(_))
    ));
}

#[tokio::test]
async fn session_carries_a_single_job() {
    let harness = start(recognizes("Once."));
    let data = audio(1000);

    assert!(harness.session.run_job_from_reader(&data[..]).await);
    assert!(!harness.session.run_job_from_reader(&data[..]).await);
    assert_eq!(harness.session.state(), JobState::Completed);
    assert!(!harness.session.run_voice_job(16, 1, 16000).await);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn send_failure_ends_job_in_error() {
    let harness = start(Script {
        fail_on: Some(1),
        ..recognizes("never")
    });

    assert!(!harness.session.run_job_from_reader(&audio(20_000)[..]).await);
    assert_eq!(harness.session.state(), JobState::Error);
    assert!(matches!(
        harness.session.last_error(),
        Some(SpeechError::SendFailed(_))
    ));
    assert!(harness.session.recognized_text().is_none());

    // config went out, no audio did
    let recorded = harness.service.await.unwrap();
    assert!(matches!(recorded[0], Sent::Text(_)));
    assert!(audio_frames(&recorded).is_empty());
}

#[tokio::test]
async fn peer_close_before_completion_fails_the_job() {
    let harness = start(Script {
        preload: vec![Frame::Close(Some("1011 server error".to_string()))],
        ..Default::default()
    });

    assert!(!harness.session.run_job_from_reader(&audio(50_000)[..]).await);
    assert_eq!(harness.session.state(), JobState::Error);
    assert!(!harness.session.is_open());

    let recorded = harness.service.await.unwrap();
    let frames = audio_frames(&recorded);
    assert!(frames.iter().all(|(_, f)| !f.body.is_empty()));
}

#[tokio::test]
async fn malformed_result_body_fails_the_job() {
    let harness = start(Script {
        on_config: vec![service_message("speech.hypothesis", "{\"Text\": oops")],
        ..Default::default()
    });

    assert!(!harness.session.run_voice_job(16, 1, 16000).await);
    assert_eq!(harness.session.state(), JobState::Error);
    assert!(matches!(
        harness.session.last_error(),
        Some(SpeechError::ParseFailed(_))
    ));
}

#[tokio::test]
async fn binary_results_are_dropped() {
    let mut script = recognizes("Still fine.");
    script.on_config = vec![Frame::Binary(vec![1, 2, 3])];
    let harness = start(script);
    let mut results = harness.session.subscribe();

    assert!(harness.session.run_job_from_reader(&audio(3000)[..]).await);

    let paths: Vec<SpeechMessagePath> = std::iter::from_fn(|| results.try_recv().ok())
        .map(|r| r.path)
        .collect();
    assert_eq!(paths.len(), 3);
    assert_eq!(paths.last(), Some(&SpeechMessagePath::SpeechPhrase));
}

#[tokio::test]
async fn no_match_phrase_clears_the_hypothesis() {
    let harness = start(Script {
        on_terminator: vec![
            hypothesis("hello wor"),
            service_message("speech.phrase", r#"{"RecognitionStatus":"NoMatch","Offset":0}"#),
            Frame::Close(None),
        ],
        ..Default::default()
    });

    assert!(harness.session.run_job_from_reader(&audio(4000)[..]).await);
    assert_eq!(harness.session.state(), JobState::Completed);
    assert!(harness.session.recognized_text().is_none());
}

// ============================================================================
// Voice jobs
// ============================================================================

#[tokio::test]
async fn voice_job_streams_live_packets() {
    let harness = start(recognizes("Live audio."));
    let session = Arc::clone(&harness.session);
    let mut states = session.watch_state();

    let job = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.run_voice_job(16, 1, 16000).await }
    });

    states
        .wait_for(|s| *s == JobState::ReadyForAudioPackets)
        .await
        .unwrap();

    let packets = [audio(3200), audio(3200), audio(1600)];
    for packet in &packets {
        session.send_audio_packet(packet).await;
    }
    session.end_audio().await;
    // a second end of audio is ignored
    session.end_audio().await;

    assert!(job.await.unwrap());
    assert_eq!(session.state(), JobState::Completed);
    assert_eq!(session.recognized_text().as_deref(), Some("Live audio."));

    let recorded = harness.service.await.unwrap();
    let frames = audio_frames(&recorded);
    assert_eq!(frames.len(), 5);
    assert_eq!(frames[0].1.body, riff_wav_header(0, 16, 1, 16000).unwrap().to_vec());
    for (i, packet) in packets.iter().enumerate() {
        assert_eq!(&frames[i + 1].1.body, packet);
    }
    assert!(frames[4].1.body.is_empty());

    // socket is gone: further audio is a no-op
    session.send_audio_packet(&audio(320)).await;
    assert_eq!(session.state(), JobState::Completed);
    assert!(session.last_error().is_none());
}

#[tokio::test]
async fn caller_close_ends_voice_job() {
    let harness = start(Script {
        on_config: vec![hypothesis("partial")],
        ..Default::default()
    });
    let session = Arc::clone(&harness.session);
    let mut states = session.watch_state();

    let job = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.run_voice_job(16, 1, 16000).await }
    });

    states
        .wait_for(|s| *s == JobState::ReadyForAudioPackets)
        .await
        .unwrap();
    session.send_audio_packet(&audio(640)).await;
    session.close().await;

    // no terminator and no phrase: the job did not complete
    assert!(!job.await.unwrap());
    assert_eq!(session.state(), JobState::Error);

    let recorded = harness.service.await.unwrap();
    assert!(matches!(recorded.last(), Some(Sent::Close)));
}

#[tokio::test]
async fn audio_before_job_is_dropped() {
    let harness = start(recognizes("Nothing yet."));

    harness.session.send_audio_packet(&audio(100)).await;
    harness.session.end_audio().await;
    assert_eq!(harness.session.state(), JobState::Ready);

    harness.session.close().await;
    let recorded = harness.service.await.unwrap();
    assert_eq!(recorded.len(), 1);
    assert!(matches!(recorded[0], Sent::Close));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn packets_racing_end_of_audio_never_follow_the_terminator() {
    let harness = start(recognizes("Raced."));
    let session = Arc::clone(&harness.session);
    let mut states = session.watch_state();

    let job = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.run_voice_job(16, 1, 16000).await }
    });
    states
        .wait_for(|s| *s == JobState::ReadyForAudioPackets)
        .await
        .unwrap();

    let senders: Vec<_> = (0..8)
        .map(|_| {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                for _ in 0..20 {
                    session.send_audio_packet(&audio(320)).await;
                }
            })
        })
        .collect();
    session.end_audio().await;
    for sender in senders {
        sender.await.unwrap();
    }

    assert!(job.await.unwrap());
    let recorded = harness.service.await.unwrap();
    let frames = audio_frames(&recorded);
    let terminators = frames.iter().filter(|(_, f)| f.body.is_empty()).count();
    assert_eq!(terminators, 1);
    assert!(frames.last().unwrap().1.body.is_empty());
}

#[tokio::test]
async fn voice_header_overflow_fails_the_job() {
    let harness = start(Script::default());

    assert!(!harness.session.run_voice_job(32, u16::MAX, 16000).await);
    assert_eq!(harness.session.state(), JobState::Error);
    assert!(matches!(
        harness.session.last_error(),
        Some(SpeechError::AudioFormat(_))
    ));

    // config went out, the header did not
    let recorded = harness.service.await.unwrap();
    assert!(matches!(recorded[0], Sent::Text(_)));
    assert!(audio_frames(&recorded).is_empty());
}
