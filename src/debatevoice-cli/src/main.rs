//! DebateVoice CLI - spoken AI debates
//!
//! Speaks single utterances or whole generated debates through a streaming
//! speech-synthesis backend.

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use debatevoice_core::scheduler::EventSender;
use debatevoice_core::{
    AudioOutput, ChatCompletionGenerator, Config, NullOutput, Side, SpeechError, SpeechEvent,
    SpeechService, TextGenerator, Transcript, WavRecorder, default_config,
};
use std::path::PathBuf;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "debatevoice",
    version,
    about = "DebateVoice - hear AIs debate",
    long_about = "Streams synthesized speech for two debate sides, one speaker at a time."
)]
struct Cli {
    /// TOML configuration file (defaults are used when omitted)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Also record everything spoken to this WAV file
    #[arg(short, long, global = true, value_name = "WAV")]
    output: Option<PathBuf>,

    /// Do not open an audio device
    #[arg(long, global = true)]
    no_playback: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Speak one utterance and wait for it to finish
    Speak {
        /// Which side's voice to use
        #[arg(short, long, value_enum, default_value_t = SideArg::Positive)]
        side: SideArg,

        /// The text to speak
        #[arg(value_name = "TEXT")]
        text: String,
    },
    /// Generate and speak a debate on a topic
    Debate {
        /// The topic to debate
        #[arg(value_name = "TOPIC")]
        topic: String,

        /// Number of rounds (each side speaks once per round)
        #[arg(short, long, default_value = "3", value_name = "ROUNDS")]
        rounds: u32,

        /// Record to "DebateVoice - <topic>.wav" when --output is not given
        #[arg(long)]
        record: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SideArg {
    Positive,
    Negative,
}

impl From<SideArg> for Side {
    fn from(side: SideArg) -> Self {
        match side {
            SideArg::Positive => Side::Positive,
            SideArg::Negative => Side::Negative,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => default_config(),
    };
    config.apply_env();

    let output_path = match &cli.command {
        Command::Debate {
            topic,
            record: true,
            ..
        } if cli.output.is_none() => Some(PathBuf::from(generate_output_filename(topic))),
        _ => cli.output.clone(),
    };

    let (callback, events) = console_callback();
    let sample_rate = config.speech.sample_rate;
    let no_playback = cli.no_playback;
    let service = SpeechService::spawn(
        &config,
        move |tx| build_output(tx, no_playback, output_path, sample_rate),
        Some(callback),
    )?;
    let mut turns = TurnTracker::new(events, config.speech.enabled);

    match cli.command {
        Command::Speak { side, text } => {
            service.submit(text, side.into())?;
            turns.wait_until_idle_after(1).await;
        }
        Command::Debate { topic, rounds, .. } => {
            print_header(&topic, rounds);
            run_debate(&config, &service, &mut turns, &topic, rounds).await?;

            println!();
            println!("{}", "═".repeat(70).bright_blue());
            println!("{}", "  Debate concluded.".bright_green().bold());
            println!("{}", "═".repeat(70).bright_blue());
            println!();
        }
    }

    service.shutdown().await;
    Ok(())
}

/// Generate each turn while the previous one is still being spoken.
async fn run_debate(
    config: &Config,
    service: &SpeechService,
    turns: &mut TurnTracker,
    topic: &str,
    rounds: u32,
) -> Result<(), SpeechError> {
    let generator = ChatCompletionGenerator::new(config);
    let mut transcript = Transcript::new(topic);
    let mut submitted = 0;
    let mut side = Side::Positive;

    // Each round is one turn per side.
    for _ in 0..rounds.max(1).saturating_mul(2) {
        let text = generator.generate_text(&transcript, side).await;

        println!(
            "{} {}",
            "▶".bright_cyan(),
            side.display_name().bright_cyan().bold()
        );
        for line in wrap_words(&text, 66) {
            println!("  {}", line);
        }
        println!();

        transcript.push(side, text.clone());

        // Only one utterance can wait behind the current one.
        turns.wait_until_started(submitted).await;
        service.submit(text, side)?;
        submitted += 1;
        side = side.opponent();
    }

    turns.wait_until_idle_after(submitted).await;
    Ok(())
}

fn build_output(
    tx: EventSender,
    no_playback: bool,
    record_to: Option<PathBuf>,
    sample_rate: u32,
) -> Result<Box<dyn AudioOutput>, SpeechError> {
    let device: Box<dyn AudioOutput> = if no_playback {
        Box::new(NullOutput::new(tx))
    } else {
        open_device(tx)?
    };

    match record_to {
        Some(path) => {
            let recorder: Box<dyn AudioOutput> =
                Box::new(WavRecorder::create(path, sample_rate, device)?);
            Ok(recorder)
        }
        None => Ok(device),
    }
}

#[cfg(feature = "playback")]
fn open_device(tx: EventSender) -> Result<Box<dyn AudioOutput>, SpeechError> {
    let device: Box<dyn AudioOutput> = Box::new(debatevoice_core::RodioOutput::open(tx)?);
    Ok(device)
}

#[cfg(not(feature = "playback"))]
fn open_device(tx: EventSender) -> Result<Box<dyn AudioOutput>, SpeechError> {
    tracing::warn!("Built without audio playback; audio is discarded");
    let device: Box<dyn AudioOutput> = Box::new(NullOutput::new(tx));
    Ok(device)
}

/// Follows turn notifications so the CLI knows when speech has finished.
struct TurnTracker {
    events: UnboundedReceiver<SpeechEvent>,
    enabled: bool,
    started: usize,
    idle: bool,
}

impl TurnTracker {
    fn new(events: UnboundedReceiver<SpeechEvent>, enabled: bool) -> Self {
        Self {
            events,
            enabled,
            started: 0,
            idle: true,
        }
    }

    async fn next(&mut self) -> bool {
        match self.events.recv().await {
            Some(SpeechEvent::TurnStarted { .. }) => {
                self.started += 1;
                self.idle = false;
                true
            }
            Some(SpeechEvent::TurnEnded { .. }) => {
                self.idle = true;
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Wait until `count` submissions have begun speaking.
    async fn wait_until_started(&mut self, count: usize) {
        while self.enabled && self.started < count {
            if !self.next().await {
                return;
            }
        }
    }

    /// Wait until `count` submissions have started and playback is idle again.
    async fn wait_until_idle_after(&mut self, count: usize) {
        self.wait_until_started(count).await;
        while self.enabled && !self.idle {
            if !self.next().await {
                return;
            }
        }
    }
}

/// Create a callback that prints speech events and forwards them to the tracker.
fn console_callback() -> (
    Box<dyn Fn(SpeechEvent) + Send + Sync>,
    UnboundedReceiver<SpeechEvent>,
) {
    let (tx, rx) = unbounded_channel();
    let callback: Box<dyn Fn(SpeechEvent) + Send + Sync> = Box::new(move |event: SpeechEvent| {
        match &event {
            SpeechEvent::TurnStarted { side } => {
                println!(
                    "{}",
                    format!("  🔊 {} speaking", side.display_name()).dimmed()
                );
            }
            SpeechEvent::TurnEnded { side } => {
                let who = side.map(|s| s.display_name().to_string()).unwrap_or_default();
                println!("{}", format!("  ■ {} finished", who).dimmed());
            }
            SpeechEvent::SessionFailed { side, reason } => {
                eprintln!(
                    "{} {} audio failed: {}",
                    "Warning:".yellow().bold(),
                    side.display_name(),
                    reason
                );
            }
        }
        let _ = tx.send(event);
    });
    (callback, rx)
}

fn print_header(topic: &str, rounds: u32) {
    println!();
    println!("{}", "═".repeat(70).bright_blue());
    println!(
        "{}",
        format!("  {} - {} rounds", "DebateVoice".bold(), rounds)
            .bright_blue()
            .bold()
    );
    println!("{}", "═".repeat(70).bright_blue());
    println!();
    println!("{} {}", "Topic:".bold(), topic.bright_white());
    println!();
    println!("{}", "─".repeat(70).dimmed());
}

/// Generate filename for debate output.
fn generate_output_filename(topic: &str) -> String {
    // Sanitize topic for filename
    let sanitized: String = topic
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == ' ' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let truncated: String = sanitized.chars().take(50).collect();

    format!("DebateVoice - {}.wav", truncated.trim())
}

/// Greedily pack words into lines of at most `width` characters.
///
/// A single word longer than `width` gets a line of its own.
fn wrap_words(text: &str, width: usize) -> Vec<String> {
    text.split_whitespace().fold(Vec::new(), |mut lines, word| {
        match lines.last_mut() {
            Some(line) if line.chars().count() + 1 + word.chars().count() <= width => {
                line.push(' ');
                line.push_str(word);
            }
            _ => lines.push(word.to_string()),
        }
        lines
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_output_filename() {
        assert_eq!(
            generate_output_filename("Should AI be open source?"),
            "DebateVoice - Should AI be open source_.wav"
        );
    }

    #[test]
    fn test_generate_output_filename_long() {
        let filename = generate_output_filename(&"A".repeat(100));
        assert!(filename.len() < 70);
    }

    #[test]
    fn test_wrap_words() {
        assert_eq!(
            wrap_words("one two three four five", 9),
            vec!["one two", "three", "four five"]
        );
        assert_eq!(wrap_words("tiny supercalifragilistic", 5), vec!["tiny", "supercalifragilistic"]);
        assert!(wrap_words("   ", 10).is_empty());
    }

    #[tokio::test]
    async fn test_tracker_waits_for_last_turn() {
        let (tx, rx) = unbounded_channel();
        let mut tracker = TurnTracker::new(rx, true);

        tx.send(SpeechEvent::TurnStarted { side: Side::Positive }).unwrap();
        tx.send(SpeechEvent::TurnEnded { side: Some(Side::Positive) }).unwrap();
        tx.send(SpeechEvent::TurnStarted { side: Side::Negative }).unwrap();
        tx.send(SpeechEvent::TurnEnded { side: Some(Side::Negative) }).unwrap();

        tracker.wait_until_idle_after(2).await;
        assert_eq!(tracker.started, 2);
        assert!(tracker.idle);
        assert!(tracker.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_tracker_disabled_never_waits() {
        let (_tx, rx) = unbounded_channel();
        let mut tracker = TurnTracker::new(rx, false);
        tracker.wait_until_idle_after(5).await;
        assert_eq!(tracker.started, 0);
    }
}
