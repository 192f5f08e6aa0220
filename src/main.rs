use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use parley_speech::voice::capture::CaptureSession;
use parley_speech::voice::endpoint::calculate_energy;
use parley_speech::voice::playback::{AudioClip, AudioSink, CpalPlayback, PLAYBACK_SAMPLE_RATE};
use parley_speech::voice::{CpalMicrophone, ToolCall};
use parley_speech::{
    Config, Error, FinishedTurn, InputLanguage, SequenceOutcome, SpeechChunk, SpeechController,
    SpeechEvents, SttProviderId, TtsProviderId,
};

/// Parley - speech layer for a spoken language tutor
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Speech input provider (manual, streaming, full-duplex)
    #[arg(long, env = "PARLEY_STT_PROVIDER")]
    stt: Option<SttProviderId>,

    /// Speech output provider (device, openai, elevenlabs, full-duplex)
    #[arg(long, env = "PARLEY_TTS_PROVIDER")]
    tts: Option<TtsProviderId>,

    /// Language being learned (e.g. "fr")
    #[arg(long, env = "PARLEY_LEARNING_LANGUAGE")]
    learning: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Speak text through the selected output provider
    Say {
        /// One chunk per argument
        #[arg(required = true)]
        text: Vec<String>,
        /// Two-letter language tag for every chunk (defaults to the learning language)
        #[arg(short, long)]
        language: Option<String>,
    },
    /// Listen for one turn and print the transcript
    Listen {
        /// Recognize the learning language instead of the native one
        #[arg(long)]
        learning_input: bool,
    },
    /// Listen, then speak the reply typed on stdin, until Ctrl-C
    Converse {
        /// Recognize the learning language instead of the native one
        #[arg(long)]
        learning_input: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,parley_speech=info",
        1 => "info,parley_speech=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::TestMic { duration } => return test_mic(duration).await,
        Command::TestSpeaker => return test_speaker().await,
        _ => {}
    }

    let mut config = Config::load()?;
    if let Some(learning) = &cli.learning {
        config.languages.learning.clone_from(learning);
    }
    tracing::debug!(?config, "loaded configuration");

    let (tx, rx) = mpsc::unbounded_channel();
    let controller = SpeechController::from_config(&config, Arc::new(CliEvents { tx }))?;
    if let Some(stt) = cli.stt {
        controller.set_stt_provider(stt).await?;
    }
    if let Some(tts) = cli.tts {
        controller.set_tts_provider(tts).await?;
    }
    tracing::info!(
        stt = %controller.stt_provider(),
        tts = %controller.tts_provider(),
        learning = %config.languages.learning,
        "speech controller ready"
    );

    let result = match cli.command {
        Command::Say { text, language } => {
            let language = language.unwrap_or_else(|| config.languages.learning.to_uppercase());
            say(&controller, &text, &language).await
        }
        Command::Listen { learning_input } => {
            listen(&controller, rx, input_language(learning_input)).await
        }
        Command::Converse { learning_input } => {
            let language = input_language(learning_input);
            if controller.stt_provider() == SttProviderId::FullDuplex {
                converse_duplex(&controller, rx, language).await
            } else {
                converse(&controller, rx, language, &config.languages.learning).await
            }
        }
        Command::TestMic { .. } | Command::TestSpeaker => Ok(()),
    };

    controller.shutdown().await;
    result
}

const fn input_language(learning: bool) -> InputLanguage {
    if learning {
        InputLanguage::Learning
    } else {
        InputLanguage::English
    }
}

/// What the CLI waits on
enum CliEvent {
    TurnComplete(FinishedTurn),
    ListenFailed(String),
}

/// Prints progress and forwards the events the CLI waits on
struct CliEvents {
    tx: mpsc::UnboundedSender<CliEvent>,
}

impl SpeechEvents for CliEvents {
    fn on_user_speak_start(&self, _message_id: &str, language: InputLanguage) {
        eprintln!("[listening: {language:?}]");
    }

    fn on_user_transcript(&self, text: &str, is_final: bool) {
        if is_final {
            eprintln!("  … {text}");
        } else {
            eprintln!("  ~ {text}");
        }
    }

    fn on_user_speak_complete(&self, turn: FinishedTurn) {
        let _ = self.tx.send(CliEvent::TurnComplete(turn));
    }

    fn on_agent_speak_start(&self, message_id: &str) {
        tracing::debug!(message_id, "speaking chunk");
    }

    fn on_agent_transcript(&self, text: &str) {
        println!("tutor: {text}");
    }

    fn on_error(&self, error: &Error, context: Option<&str>) {
        eprintln!("error ({}): {error}", context.unwrap_or("speech"));
        if context == Some("listening") {
            let _ = self.tx.send(CliEvent::ListenFailed(error.to_string()));
        }
    }

    fn on_tool_call(&self, call: &ToolCall) {
        eprintln!("[tool call {} ignored: {}]", call.name, call.args);
    }
}

/// Speak each argument as one chunk
async fn say(controller: &SpeechController, text: &[String], language: &str) -> anyhow::Result<()> {
    // Running the command is the user gesture
    if let Err(e) = controller.unlock_audio().await {
        tracing::warn!(error = %e, "audio unlock failed");
    }

    let chunks: Vec<SpeechChunk> = text
        .iter()
        .enumerate()
        .map(|(i, t)| SpeechChunk::new(t.as_str(), Some(language), format!("say-{}", i + 1)))
        .collect();

    println!("Speaking {} chunk(s) via {}...", chunks.len(), controller.tts_provider());
    let outcome = controller.speak(chunks).await;
    if outcome != SequenceOutcome::Completed {
        anyhow::bail!("speech ended early: {outcome:?}");
    }
    Ok(())
}

/// Wait for the current turn to finish, stopping it on Ctrl-C
async fn wait_for_turn(
    controller: &SpeechController,
    rx: &mut mpsc::UnboundedReceiver<CliEvent>,
) -> anyhow::Result<FinishedTurn> {
    let mut stopping = false;
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(CliEvent::TurnComplete(turn)) => return Ok(turn),
                Some(CliEvent::ListenFailed(e)) => anyhow::bail!("listening failed: {e}"),
                None => anyhow::bail!("event channel closed"),
            },
            _ = tokio::signal::ctrl_c(), if !stopping => {
                stopping = true;
                controller.stop_listening(true).await;
            }
        }
    }
}

/// Run one listening turn
async fn listen(
    controller: &SpeechController,
    mut rx: mpsc::UnboundedReceiver<CliEvent>,
    language: InputLanguage,
) -> anyhow::Result<()> {
    println!("Listening via {} (Ctrl-C to stop)...", controller.stt_provider());
    controller.start_listening(Some(language)).await?;

    let turn = wait_for_turn(controller, &mut rx).await?;
    println!("{}", turn.transcript);
    tracing::info!(
        message_id = %turn.message_id,
        audio_bytes = turn.audio.len(),
        user_initiated = turn.user_initiated,
        "turn complete"
    );
    Ok(())
}

/// Listen, print, read a reply from stdin, speak it; repeat until EOF or Ctrl-C
async fn converse(
    controller: &SpeechController,
    mut rx: mpsc::UnboundedReceiver<CliEvent>,
    language: InputLanguage,
    learning: &str,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let tag = learning.to_uppercase();
    let mut turn_number = 0_u32;

    if let Err(e) = controller.unlock_audio().await {
        tracing::warn!(error = %e, "audio unlock failed");
    }

    loop {
        controller.start_listening(Some(language)).await?;
        let turn = wait_for_turn(controller, &mut rx).await?;
        println!("you: {}", turn.transcript);
        if turn.user_initiated && turn.transcript.is_empty() {
            break;
        }

        controller.set_processing(true);
        println!("reply> ");
        let reply = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        controller.set_processing(false);
        let Some(reply) = reply else { break };

        turn_number += 1;
        let chunks = SpeechChunk::sentences(&reply, Some(&tag), &format!("reply{turn_number}"));
        if chunks.is_empty() {
            continue;
        }
        let outcome = tokio::select! {
            outcome = controller.speak(chunks) => outcome,
            _ = tokio::signal::ctrl_c() => {
                controller.cancel_speaking();
                break;
            }
        };
        tracing::debug!(?outcome, "reply spoken");
    }
    Ok(())
}

/// Full-duplex: the session runs until Ctrl-C; typed lines become text turns
async fn converse_duplex(
    controller: &SpeechController,
    mut rx: mpsc::UnboundedReceiver<CliEvent>,
    language: InputLanguage,
) -> anyhow::Result<()> {
    println!("Full-duplex session (type to send text, Ctrl-C to end)...");
    controller.start_listening(Some(language)).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = rx.recv() => match event {
                Some(CliEvent::TurnComplete(turn)) => println!("you: {}", turn.transcript),
                Some(CliEvent::ListenFailed(e)) => anyhow::bail!("session failed: {e}"),
                None => break,
            },
            line = lines.next_line(), if stdin_open => match line? {
                Some(text) if !text.trim().is_empty() => {
                    if let Err(e) = controller.send_text(&text) {
                        controller.report(&e, Some("text turn"));
                    }
                }
                Some(_) => {}
                None => stdin_open = false,
            },
        }
    }
    Ok(())
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mic = CpalMicrophone::new();
    let capture = CaptureSession::start_block(&mic, parley_speech::voice::SAMPLE_RATE, None)?;
    println!("Sample rate: {} Hz", parley_speech::voice::SAMPLE_RATE);
    println!("---");

    let mut seen = 0;
    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = capture.snapshot();
        let second = samples.get(seen..).unwrap_or_default();
        seen = samples.len();
        let energy = calculate_energy(second);
        let peak = second.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]",
            i + 1,
            energy,
            peak,
            meter
        );
    }

    let recording = capture.finish();

    println!("\n---");
    println!(
        "Captured {} samples in {} blocks.",
        recording.sample_count(),
        recording.segment_count()
    );
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

    let playback = CpalPlayback::new()?;

    let frequency = 440.0_f32;
    let duration_secs = 2.0_f32;
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let num_samples = (PLAYBACK_SAMPLE_RATE as f32 * duration_secs) as usize;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / PLAYBACK_SAMPLE_RATE as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    println!(
        "Playing {} samples at {} Hz...",
        samples.len(),
        PLAYBACK_SAMPLE_RATE
    );

    playback
        .play(AudioClip::new(samples, PLAYBACK_SAMPLE_RATE))
        .await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}
