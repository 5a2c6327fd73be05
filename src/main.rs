use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use realtime_bridge::config::{BridgeConfig, YamlConfig};
use realtime_bridge::core::audio::{AudioFrame, ChannelTrack, DEFAULT_PTIME_MS, i16_to_bytes};
use realtime_bridge::errors::BridgeResult;
use realtime_bridge::{BridgeEvent, BridgeEventKind, ModelSessionController};

/// Realtime audio bridge to a speech-to-speech model
#[derive(Parser, Debug)]
#[command(name = "realtime-bridge")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream a PCM16 WAV file to the model and record its spoken reply
    Run {
        /// Input WAV file (16-bit PCM)
        #[arg(short = 'i', long = "input", value_name = "WAV")]
        input: PathBuf,

        /// Where to write the model's audio
        #[arg(short = 'o', long = "output", value_name = "WAV")]
        output: PathBuf,

        /// How long to keep the session open
        #[arg(short = 'd', long = "duration-secs", default_value_t = 30)]
        duration_secs: u64,
    },

    /// Print the effective configuration and check it
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Must be installed before any TLS connection is attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    match cli.command {
        Commands::CheckConfig => check_config(cli.config.as_deref()),
        Commands::Run {
            input,
            output,
            duration_secs,
        } => {
            let config = match cli.config {
                Some(path) => {
                    info!("Loading configuration from {}", path.display());
                    BridgeConfig::from_file(&path)?
                }
                None => {
                    let config = BridgeConfig::from_env();
                    config.validate()?;
                    config
                }
            };
            run(config, &input, &output, Duration::from_secs(duration_secs)).await
        }
    }
}

fn check_config(path: Option<&Path>) -> anyhow::Result<()> {
    let mut config = BridgeConfig::from_env();
    if let Some(path) = path {
        let yaml = YamlConfig::from_file(path).map_err(|e| anyhow!(e))?;
        config.merge_yaml(yaml);
    }

    println!("{}", config.to_yaml()?);
    match config.validate() {
        Ok(()) => {
            println!("Configuration is valid");
            Ok(())
        }
        Err(e) => Err(anyhow!("Configuration is invalid: {e}")),
    }
}

async fn run(
    config: BridgeConfig,
    input: &Path,
    output: &Path,
    duration: Duration,
) -> anyhow::Result<()> {
    let reader = hound::WavReader::open(input)
        .with_context(|| format!("Failed to open {}", input.display()))?;
    let format = reader.spec();
    if format.bits_per_sample != 16 || format.sample_format != hound::SampleFormat::Int {
        anyhow::bail!(
            "{} must be 16-bit PCM, found {}-bit {:?}",
            input.display(),
            format.bits_per_sample,
            format.sample_format
        );
    }
    let samples = reader
        .into_samples::<i16>()
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to read samples from {}", input.display()))?;
    info!(
        sample_rate = format.sample_rate,
        channels = format.channels,
        seconds = samples.len() as f64 / (format.sample_rate as f64 * format.channels as f64),
        "input loaded"
    );

    let playback = config.playback;
    let controller = build_controller(config);
    subscribe_logging(&controller);

    let (track, frames) = ChannelTrack::new(64);
    controller.conversation().add_track("input", Arc::new(track))?;
    controller.connect().await?;

    let cancel = CancellationToken::new();
    let feeder = tokio::spawn(feed_track(
        samples,
        format.sample_rate,
        format.channels,
        frames,
        cancel.clone(),
    ));

    let mut writer = hound::WavWriter::create(
        output,
        hound::WavSpec {
            channels: playback.channels,
            sample_rate: playback.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        },
    )
    .with_context(|| format!("Failed to create {}", output.display()))?;

    let mut source = controller.playback_source();
    let deadline = Instant::now() + duration;
    let mut written = 0usize;
    loop {
        let frame = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            frame = source.recv() => frame,
        };
        let Some(frame) = frame else {
            warn!(
                reason = %controller.last_error().unwrap_or_default(),
                "playback ended early"
            );
            break;
        };
        for sample in frame.to_i16()? {
            writer.write_sample(sample)?;
        }
        written += frame.samples();
    }

    cancel.cancel();
    let _ = feeder.await;
    controller.close().await;
    writer.finalize()?;

    info!(
        samples = written,
        seconds = written as f64 / playback.sample_rate as f64,
        "Wrote {}",
        output.display()
    );
    Ok(())
}

#[cfg(feature = "hq-resampling")]
fn build_controller(config: BridgeConfig) -> ModelSessionController {
    use realtime_bridge::ConversationSession;
    use realtime_bridge::core::audio::{AudioFormat, AudioResampler, FftConverter};

    let target = AudioFormat::mono(config.session.input_audio_format.sample_rate());
    let resampler = AudioResampler::with_converter(Box::new(FftConverter::new(target)));
    let conversation =
        ConversationSession::with_resampler(uuid::Uuid::new_v4().to_string(), resampler);
    ModelSessionController::with_conversation(config, Arc::new(conversation))
}

#[cfg(not(feature = "hq-resampling"))]
fn build_controller(config: BridgeConfig) -> ModelSessionController {
    ModelSessionController::new(config)
}

fn subscribe_logging(controller: &ModelSessionController) {
    controller.subscribe(BridgeEventKind::TurnChanged, |event| {
        if let BridgeEvent::TurnChanged { from, to } = event {
            info!(%from, %to, "turn");
        }
        Ok(())
    });
    controller.subscribe(BridgeEventKind::Transcript, |event| {
        if let BridgeEvent::Transcript(transcript) = event {
            if transcript.is_final {
                info!(role = %transcript.role, "{}", transcript.text);
            }
        }
        Ok(())
    });
    controller.subscribe(BridgeEventKind::ApiError, |event| {
        if let BridgeEvent::ApiError(api_error) = event {
            warn!(error = %api_error, "model reported an error");
        }
        Ok(())
    });
    controller.subscribe(BridgeEventKind::Failed, |event| {
        if let BridgeEvent::Failed { reason } = event {
            error!(%reason, "session failed");
        }
        Ok(())
    });
}

/// Feed `samples` into the track in real time, then keep sending silence so
/// server-side turn detection can close the user's turn.
async fn feed_track(
    samples: Vec<i16>,
    sample_rate: u32,
    channels: u16,
    frames: mpsc::Sender<BridgeResult<AudioFrame>>,
    cancel: CancellationToken,
) {
    let frame_len = (sample_rate * DEFAULT_PTIME_MS / 1000) as usize * channels as usize;
    let mut ticker = tokio::time::interval(Duration::from_millis(DEFAULT_PTIME_MS as u64));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut chunks = samples.chunks(frame_len.max(1));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let frame = match chunks.next() {
            Some(chunk) => AudioFrame::new(i16_to_bytes(chunk), sample_rate, channels),
            None => Ok(AudioFrame::silence(
                frame_len / channels.max(1) as usize,
                sample_rate,
                channels,
            )),
        };
        if frames.send(frame).await.is_err() {
            break;
        }
    }
}
