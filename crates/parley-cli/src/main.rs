//! parley CLI — talk to a local model and hear it answer.
//!
//! ```text
//! parley chat [--base-url http://127.0.0.1:1234] [-v af_bella] [--text-only]
//! parley presets
//! parley download [--models-dir ...]
//! ```

use std::error::Error;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use parley_core::types::{ChatSettings, DownloadProgress, SamplingParams, VoiceConfig};
use parley_lib::completion::LmStudioClient;
use parley_lib::context::{LaunchOptions, VoiceContext};
use parley_lib::coordinator::StreamCoordinator;
use parley_lib::download;
use parley_lib::preset::{self, Preset};
use parley_lib::transcript::TranscriptEvent;

/// parley — voice chat with a locally hosted language model
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start an interactive chat session
    Chat(ChatArgs),
    /// List saved presets
    Presets,
    /// Download the Kokoro model and voices
    Download {
        /// Directory holding the Kokoro model files
        #[arg(long, env = "KOKORO_MODEL_DIR")]
        models_dir: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ChatArgs {
    /// Model identifier sent to the server
    #[arg(long, default_value = "lmstudio")]
    model: String,
    /// Model server URL
    #[arg(long, default_value = "http://127.0.0.1:1234")]
    base_url: String,
    /// System prompt (overrides the preset)
    #[arg(long)]
    system: Option<String>,
    /// Name attached to user messages (overrides the preset)
    #[arg(long)]
    user_role: Option<String>,
    /// Name attached to assistant messages (overrides the preset)
    #[arg(long)]
    assistant_role: Option<String>,
    /// Kokoro voice
    #[arg(short, long, default_value = "af_bella")]
    voice: String,
    /// Speech speed
    #[arg(short, long, default_value = "1.0")]
    speed: f32,
    /// Sampling temperature
    #[arg(long, default_value = "0.7")]
    temperature: f32,
    /// Sampling seed
    #[arg(long)]
    seed: Option<u64>,
    /// Maximum tokens per reply (0 = no limit)
    #[arg(long, default_value = "0")]
    max_tokens: u32,
    /// Seconds to wait for the server to connect or send more data
    #[arg(long, default_value = "120")]
    timeout: u64,
    /// Do not speak replies
    #[arg(long)]
    text_only: bool,
    /// Kokoro TTS server URL
    #[arg(long, default_value = "http://127.0.0.1:3001")]
    kokoro_url: String,
    /// Start a local Kokoro server if none is running
    #[arg(long)]
    launch_kokoro: bool,
    /// Directory holding the Kokoro model files
    #[arg(long, env = "KOKORO_MODEL_DIR")]
    models_dir: Option<PathBuf>,
    /// Fetch missing Kokoro model files
    #[arg(
        long,
        env = "KOKORO_ALLOW_DOWNLOAD",
        default_value_t = true,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    allow_download: bool,
    /// Preset file to load
    #[arg(long)]
    preset: Option<PathBuf>,
    /// Longest stretch of unpunctuated text spoken as one unit
    #[arg(long, default_value = "200")]
    max_unit_len: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley_lib=info,parley_cli=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Chat(args) => chat(args).await,
        Command::Presets => {
            let dir = preset::default_preset_dir()?;
            let names = preset::list_presets(&dir)?;
            if names.is_empty() {
                println!("no presets in {}", dir.display());
            }
            for name in names {
                println!("{name}");
            }
            Ok(())
        }
        Command::Download { models_dir } => {
            let dir = resolve_models_dir(models_dir)?;
            let (model, voices) = download::ensure_kokoro_models(&dir, true, print_progress).await?;
            eprintln!();
            println!("{}", model.display());
            println!("{}", voices.display());
            Ok(())
        }
    }
}

fn resolve_models_dir(explicit: Option<PathBuf>) -> Result<PathBuf, Box<dyn Error>> {
    explicit
        .or_else(download::default_models_dir)
        .ok_or_else(|| "no cache directory; pass --models-dir".into())
}

fn print_progress(p: DownloadProgress) {
    eprint!(
        "\r{}: {:5.1}% ({} / {} bytes)",
        p.model, p.percent, p.bytes_done, p.bytes_total
    );
}

fn load_preset(path: Option<PathBuf>) -> Result<Preset, Box<dyn Error>> {
    if let Some(path) = path {
        return Ok(preset::load_preset(&path)?);
    }
    match preset::default_preset_dir() {
        Ok(dir) => Ok(preset::load_preset(&dir.join(preset::DEFAULT_PRESET_FILE))?),
        Err(e) => {
            warn!("{e}; using built-in defaults");
            Ok(Preset::default())
        }
    }
}

/// Role names only travel to the server when they differ from the plain ones.
fn role_alias(role: String, plain: &str) -> Option<String> {
    (!role.is_empty() && role != plain).then_some(role)
}

async fn chat(args: ChatArgs) -> Result<(), Box<dyn Error>> {
    let preset = load_preset(args.preset.clone())?;
    let assistant_label = args
        .assistant_role
        .clone()
        .unwrap_or_else(|| preset.assistant_role.clone());

    let settings = ChatSettings {
        model: args.model.clone(),
        system_prompt: args.system.clone().unwrap_or(preset.system_prompt),
        user_name: role_alias(args.user_role.clone().unwrap_or(preset.user_role), "user"),
        assistant_name: role_alias(assistant_label.clone(), "assistant"),
        params: SamplingParams {
            temperature: args.temperature,
            seed: args.seed,
            max_tokens: (args.max_tokens > 0).then_some(args.max_tokens),
            stop: preset.stop_sequences,
        },
        audio_enabled: !args.text_only,
    };

    let voice = if args.text_only {
        None
    } else {
        start_voice(&args).await
    };

    let client = LmStudioClient::new(&args.base_url, Duration::from_secs(args.timeout))?;
    let (coordinator, events) =
        StreamCoordinator::new(Arc::new(client), voice.clone(), settings);

    let printer = tokio::spawn(print_transcript(events, assistant_label));

    println!("connected to {} — /stop, /audio on|off, /quit", args.base_url);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                coordinator.stop().await;
                continue;
            }
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();

        match line {
            "" => {}
            "/quit" | "/exit" => break,
            "/stop" => coordinator.stop().await,
            "/audio on" if voice.is_none() => {
                println!("(speech is not available this session)");
            }
            "/audio on" => coordinator.set_audio_enabled(true),
            "/audio off" => coordinator.set_audio_enabled(false),
            "/audio" => println!(
                "(audio {})",
                if coordinator.audio_enabled() { "on" } else { "off" }
            ),
            text => {
                coordinator.send(text).await;
            }
        }
    }

    info!("shutting down");
    coordinator.stop().await;
    if let Some(voice) = voice {
        voice.shutdown().await;
    }
    printer.abort();
    Ok(())
}

async fn start_voice(args: &ChatArgs) -> Option<Arc<VoiceContext>> {
    let config = VoiceConfig {
        kokoro_url: args.kokoro_url.clone(),
        voice: args.voice.clone(),
        speed: args.speed,
        max_unit_len: args.max_unit_len,
    };

    let launch = if args.launch_kokoro {
        match resolve_models_dir(args.models_dir.clone()) {
            Ok(models_dir) => Some(LaunchOptions {
                models_dir,
                allow_download: args.allow_download,
            }),
            Err(e) => {
                warn!("not launching kokoro: {e}");
                None
            }
        }
    } else {
        None
    };

    match VoiceContext::startup(config, launch, print_progress).await {
        Ok(voice) => Some(Arc::new(voice)),
        Err(e) => {
            warn!("speech disabled: {e}");
            None
        }
    }
}

async fn print_transcript(
    mut events: tokio::sync::mpsc::UnboundedReceiver<TranscriptEvent>,
    assistant_label: String,
) {
    let mut stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            TranscriptEvent::User(_) => {}
            TranscriptEvent::AssistantBegin => print!("{assistant_label}: "),
            TranscriptEvent::Fragment(text) => print!("{text}"),
            TranscriptEvent::AssistantEnd => println!(),
            TranscriptEvent::Notice(text) => println!("{text}"),
            TranscriptEvent::Status(text) => println!("({text})"),
        }
        let _ = stdout.flush();
    }
}
