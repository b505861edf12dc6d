use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use speech_socket::audio::WavCapture;
use speech_socket::settings::SUBSCRIPTION_KEY_ENV;
use speech_socket::{
    load_settings, ClientSettings, ConnectionSession, InboundResult, JobState, SpeechError,
    SpeechMessagePath, StaticToken, StsTokenClient, TokenProvider,
};

/// Bytes of stdin PCM per voice packet (100 ms of 16 kHz 16-bit mono)
const VOICE_PACKET_BYTES: usize = 3200;

#[derive(Parser, Debug)]
#[command(name = "speech-socket")]
#[command(version)]
#[command(about = "Stream audio to a speech recognition socket and print the results")]
struct Cli {
    /// Settings file (JSON); missing file means defaults
    #[arg(long, default_value = "speech-socket.json")]
    settings: PathBuf,

    /// Bearer token, skips the token endpoint
    #[arg(long, env = "SPEECH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Subscription key exchanged for a bearer token
    #[arg(long, hide_env_values = true)]
    key: Option<String>,

    /// Also write the audio sent over the socket to this WAV file
    #[arg(long)]
    capture: Option<PathBuf>,

    /// Stream raw PCM from stdin as a live voice job
    #[arg(long)]
    voice: bool,

    /// Sample rate of the audio
    #[arg(long, default_value_t = 16000)]
    rate: u32,

    /// Bits per sample
    #[arg(long, default_value_t = 16)]
    bits: u16,

    #[arg(long, default_value_t = 1)]
    channels: u16,

    /// Audio file to recognize (WAV, sent as-is)
    #[arg(required_unless_present = "voice", conflicts_with = "voice")]
    file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool, SpeechError> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("TLS crypto provider already installed");
    }

    let mut settings = load_settings(&cli.settings);
    settings.apply_env_overrides();
    log::info!(
        "Region {}, language {}, mode {}{}",
        settings.region,
        settings.language,
        settings.mode.as_str(),
        if settings.legacy_endpoint { " (legacy endpoint)" } else { "" }
    );

    let (provider, renewal) = token_provider(&cli, &settings).await?;
    let token = provider
        .current_token()
        .ok_or_else(|| SpeechError::Auth("no token available".to_string()))?;

    let session = Arc::new(
        ConnectionSession::connect(&settings.endpoint(), &token)
            .await?
            .with_max_frame_bytes(settings.frame_limit()),
    );
    if let Some(path) = &cli.capture {
        session.set_capture(WavCapture::create(path, cli.bits, cli.channels, cli.rate)?);
    }

    let printer = tokio::spawn(print_results(Arc::clone(&session), session.subscribe()));

    let ok = if cli.voice {
        run_voice(&session, &cli).await
    } else if let Some(file) = &cli.file {
        session.run_file_job(file).await
    } else {
        false
    };

    if !printer.is_finished() {
        printer.abort();
    }
    if let Some(handle) = renewal {
        handle.abort();
    }

    if let Some(capture) = session.take_capture() {
        let path = capture.finalize()?;
        log::info!("Captured audio written to {:?}", path);
    }

    match session.recognized_text() {
        Some(text) if ok => println!("{}", text),
        None if ok => log::info!("No speech recognized"),
        _ => {
            if let Some(e) = session.last_error() {
                log::error!("Recognition failed: {}", e);
            } else {
                log::error!("Recognition ended in state {}", session.state());
            }
        }
    }
    Ok(ok)
}

async fn token_provider(
    cli: &Cli,
    settings: &ClientSettings,
) -> Result<(Box<dyn TokenProvider>, Option<JoinHandle<()>>), SpeechError> {
    if let Some(token) = &cli.token {
        return Ok((Box::new(StaticToken(token.clone())), None));
    }

    let key = cli
        .key
        .clone()
        .or_else(|| settings.subscription_key.clone())
        .ok_or_else(|| {
            SpeechError::Auth(format!(
                "no credentials: pass --token or --key, or set {}",
                SUBSCRIPTION_KEY_ENV
            ))
        })?;

    let client = StsTokenClient::authenticate(&key, &settings.region, settings.legacy_endpoint)
        .await?;
    let interval = Duration::from_secs(settings.token_refresh_minutes.max(1) * 60);
    let renewal = client.spawn_renewal(interval);
    Ok((Box::new(client), Some(renewal)))
}

/// Voice job fed from stdin; the session closes once the final phrase arrives
async fn run_voice(session: &Arc<ConnectionSession>, cli: &Cli) -> bool {
    let mut states = session.watch_state();
    let job = tokio::spawn({
        let session = Arc::clone(session);
        let (bits, channels, rate) = (cli.bits, cli.channels, cli.rate);
        async move { session.run_voice_job(bits, channels, rate).await }
    });

    let ready = states
        .wait_for(|s| !matches!(s, JobState::Ready | JobState::PreparingJob))
        .await
        .map(|s| *s);

    if matches!(ready, Ok(JobState::ReadyForAudioPackets)) {
        if let Err(e) = stream_stdin(session).await {
            log::error!("Reading audio from stdin: {}", e);
        }
        session.end_audio().await;
    }

    match job.await {
        Ok(ok) => ok,
        Err(e) => {
            log::error!("Voice job task failed: {}", e);
            false
        }
    }
}

async fn stream_stdin(session: &ConnectionSession) -> Result<(), SpeechError> {
    let mut stdin = tokio::io::stdin();
    let mut packet = vec![0u8; VOICE_PACKET_BYTES];
    let mut total = 0usize;

    loop {
        let n = stdin.read(&mut packet).await?;
        if n == 0 || !session.is_open() {
            break;
        }
        session.send_audio_packet(&packet[..n]).await;
        total += n;
    }
    log::info!("Streamed {} bytes of audio from stdin", total);
    Ok(())
}

async fn print_results(
    session: Arc<ConnectionSession>,
    mut results: mpsc::UnboundedReceiver<InboundResult>,
) {
    while let Some(result) = results.recv().await {
        match result.path {
            SpeechMessagePath::SpeechHypothesis => {
                if let Some(text) = result.text() {
                    eprintln!("... {}", text);
                }
            }
            SpeechMessagePath::SpeechPhrase => {
                let status = result
                    .body
                    .as_ref()
                    .and_then(|b| b.recognition_status.as_deref())
                    .unwrap_or("Unknown");
                eprintln!("[{}] {}", status, result.text().unwrap_or(""));
                session.close().await;
                return;
            }
            other => log::debug!("Service message: {:?}", other),
        }
    }
}
