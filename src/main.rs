use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use companion_call::call::HttpUplink;
use companion_call::config::VoiceConfig;
use companion_call::db::{self, TranscriptRepo};
use companion_call::providers::{ReplyClient, SpeechToText, SttProvider, TextToSpeech, TtsProvider};
use companion_call::voice::{
    BeepTones, CpalMicrophone, MicStream, Microphone, SpeakerFactory, calculate_energy,
    play_samples_blocking,
};
use companion_call::{
    ApiServerBuilder, CallDevices, CallEvent, CallSessionController, CallSettings, CallState,
    Config, PersonaRegistry, PipelineSettings, VoicePipeline,
};

/// Companion - real-time voice calls with AI companions
#[derive(Parser)]
#[command(name = "companion", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the call endpoint (default)
    Serve {
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
    },
    /// Call a companion through a running server
    Call {
        /// Server base URL
        #[arg(long, env = "COMPANION_SERVER_URL")]
        server: Option<String>,
        /// Persona to call
        #[arg(short, long)]
        persona: Option<String>,
        /// Language hint for transcription and synthesis
        #[arg(short, long)]
        language: Option<String>,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Print the stored transcript of a call
    Transcript {
        /// Session identifier, e.g. call-1718000000000
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,companion_call=info",
        1 => "info,companion_call=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config).await
        }
        Command::Call {
            server,
            persona,
            language,
        } => call(config, server, persona, language).await,
        Command::TestMic { duration } => test_mic(duration).await,
        Command::TestSpeaker => test_speaker().await,
        Command::Transcript { session_id } => print_transcript(&config, &session_id),
    }
}

/// Build the pipeline from configuration and serve until Ctrl-C
async fn serve(config: Config) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;
    let pool = db::init(config.database_path())?;

    let personas = match config.persona_dir() {
        Some(dir) => PersonaRegistry::load(dir)?,
        None => PersonaRegistry::builtin()?,
    };

    let pipeline = VoicePipeline::new(
        Arc::new(build_transcriber(&config)?),
        Arc::new(build_generator(&config)?),
        Arc::new(build_synthesizer(&config)?),
        TranscriptRepo::new(pool.clone()),
        Arc::new(personas),
        PipelineSettings {
            fallback_reply: config.voice.fallback_reply.clone(),
            history_limit: config.voice.history_limit,
            default_voice: config.voice.tts_voice.clone(),
            default_language: config.call.language.clone(),
        },
    );

    tracing::info!(
        stt = ?config.voice.stt_provider,
        llm = ?config.voice.llm_provider,
        tts = ?config.voice.tts_provider,
        "voice pipeline ready"
    );

    let server = ApiServerBuilder::new(pool, Arc::new(pipeline))
        .bind(config.server.host.clone(), config.server.port)
        .static_dir(config.server.static_dir.clone())
        .max_upload_bytes(config.server.max_upload_bytes)
        .build();

    tokio::select! {
        result = server.run() => result?,
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("shutting down");
        }
    }

    Ok(())
}

fn build_transcriber(config: &Config) -> anyhow::Result<SpeechToText> {
    let VoiceConfig {
        stt_provider,
        stt_model,
        ..
    } = &config.voice;
    let key = config
        .api_keys
        .stt(*stt_provider)
        .with_context(|| format!("no API key configured for {stt_provider:?} transcription"))?;

    Ok(match stt_provider {
        SttProvider::Whisper => SpeechToText::new_whisper(key, stt_model.clone())?,
        SttProvider::Deepgram => SpeechToText::new_deepgram(key, stt_model.clone())?,
    })
}

fn build_generator(config: &Config) -> anyhow::Result<ReplyClient> {
    let voice = &config.voice;
    let provider = voice.llm_provider;
    let key = config
        .api_keys
        .llm(provider)
        .with_context(|| format!("no API key configured for {provider:?} replies"))?;

    Ok(ReplyClient::new(
        provider,
        key,
        voice.llm_model.clone(),
        voice.max_tokens,
        voice.temperature,
    )?)
}

fn build_synthesizer(config: &Config) -> anyhow::Result<TextToSpeech> {
    let VoiceConfig {
        tts_provider,
        tts_model,
        ..
    } = &config.voice;
    let key = config
        .api_keys
        .tts(*tts_provider)
        .with_context(|| format!("no API key configured for {tts_provider:?} speech"))?;

    Ok(match tts_provider {
        TtsProvider::OpenAI => TextToSpeech::new_openai(key, tts_model.clone(), 1.0)?,
        TtsProvider::ElevenLabs => TextToSpeech::new_elevenlabs(key, tts_model.clone())?,
    })
}

/// Live call from this machine's microphone and speaker
async fn call(
    config: Config,
    server: Option<String>,
    persona: Option<String>,
    language: Option<String>,
) -> anyhow::Result<()> {
    let mut settings = CallSettings::from(&config.call);
    if let Some(persona) = persona {
        settings.persona = persona;
    }
    if let Some(language) = language {
        settings.language = language;
    }
    let server_url = server.unwrap_or_else(|| config.call.server_url.clone());

    let devices = CallDevices {
        microphone: Arc::new(CpalMicrophone),
        sinks: Arc::new(SpeakerFactory),
        uplink: Arc::new(HttpUplink::new(&server_url)?),
        tones: Arc::new(BeepTones),
    };
    let controller = Arc::new(CallSessionController::new(devices, settings));

    let mut events = controller.events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Ctrl-C works while the microphone is still opening
    let session = tokio::select! {
        started = controller.start_call() => started?,
        result = tokio::signal::ctrl_c() => {
            result?;
            controller.hang_up().await;
            println!("Call ended");
            return Ok(());
        }
    };
    println!("Calling {} (session {})", session.persona, session.id);
    println!("Press Enter to stop talking early or to allow playback, Ctrl-C to hang up.\n");

    // Enter counts as a user interaction
    let input = Arc::clone(&controller);
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(_)) = lines.next_line().await {
            input.interact();
        }
    });

    let mut state = controller.subscribe();
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = state.wait_for(|s| *s == CallState::Idle) => {
            println!("Call dropped");
        }
    }

    controller.hang_up().await;
    println!("Call ended");
    Ok(())
}

fn print_event(event: &CallEvent) {
    match event {
        CallEvent::State(state) => println!("[{state}]"),
        CallEvent::UtteranceSent { bytes } => println!("  sent {bytes} bytes"),
        CallEvent::TurnRejected { message, .. } => println!("  {message}"),
        CallEvent::TurnFailed(e) => println!("  turn failed: {e}"),
        CallEvent::ReplyPlayed { .. } => {}
        CallEvent::ToneFailed(e) => println!("  (no tone: {e})"),
        CallEvent::SetupFailed(e) | CallEvent::Dropped(e) => println!("  call failed: {e}"),
    }
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut stream = CpalMicrophone.open().await?;
    println!("Sample rate: {} Hz", stream.sample_rate());
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = stream.take_samples();
        let energy = calculate_energy(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    stream.close();

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (std::f32::consts::TAU * frequency * t).sin() * 0.3
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);
    tokio::task::spawn_blocking(move || play_samples_blocking(samples, sample_rate)).await??;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Print a stored call transcript
fn print_transcript(config: &Config, session_id: &str) -> anyhow::Result<()> {
    let pool = db::init(config.database_path())?;
    let repo = TranscriptRepo::new(pool);

    let Some(session) = repo.find_session(session_id)? else {
        anyhow::bail!("no call found with session id {session_id}");
    };

    println!(
        "Call {} with {} ({})",
        session.id,
        session.persona_id,
        session.created_at.format("%Y-%m-%d %H:%M")
    );
    for entry in repo.transcript(session_id)? {
        println!(
            "[{}] {}: {}",
            entry.timestamp.format("%H:%M:%S"),
            entry.role.as_str(),
            entry.content
        );
    }

    Ok(())
}
