//! LocaLM bridge - terminal chat
//!
//! Loads a GGUF model through the llama runtime and chats with it, streaming replies.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use localm_bridge::native::llama::{LlamaRuntime, LlamaRuntimeConfig};
use localm_bridge::{
    settings, Backend, Conversation, Engine, InferenceEvent, Message, NativeRuntime,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Cpu,
    Gpu,
}

impl From<BackendArg> for Backend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Cpu => Backend::Cpu,
            BackendArg::Gpu => Backend::Gpu,
        }
    }
}

#[derive(Debug, Parser)]
#[command(version, about = "Chat with an on-device model")]
struct Cli {
    /// GGUF model file (defaults to the saved settings)
    #[arg(short, long)]
    model: Option<PathBuf>,

    #[arg(short, long, value_enum)]
    backend: Option<BackendArg>,

    /// Context size in tokens
    #[arg(long)]
    max_tokens: Option<u32>,

    #[arg(long)]
    temperature: Option<f64>,

    /// System prompt for the conversation
    #[arg(short, long)]
    system: Option<String>,

    /// Wait for each full reply instead of streaming it
    #[arg(long)]
    no_stream: bool,

    /// Give up if the model is not ready after this many seconds
    #[arg(long, default_value_t = 120)]
    init_timeout: u64,

    /// Persist the effective settings
    #[arg(long)]
    save: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("localm_bridge=info".parse()?))
        .init();

    info!("Starting LocaLM bridge v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let mut settings = settings::load_settings();
    if let Some(model) = cli.model {
        settings.model_path = model;
    }
    if let Some(backend) = cli.backend {
        settings.backend = backend.into();
    }
    if let Some(max_tokens) = cli.max_tokens {
        settings.max_tokens = max_tokens;
    }
    if let Some(temperature) = cli.temperature {
        settings.temperature = temperature;
    }
    if let Some(system) = cli.system {
        settings.system_prompt = system;
    }
    settings.validate();
    if cli.save {
        settings::save_settings(&settings)?;
    }

    let runtime: Arc<dyn NativeRuntime> = LlamaRuntime::new(LlamaRuntimeConfig {
        gpu_layers: settings.gpu_layers,
    });

    let init_token = CancellationToken::new();
    let timeout_token = init_token.clone();
    let timeout = Duration::from_secs(cli.init_timeout);
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        timeout_token.cancel();
    });

    let engine = Engine::create_async(
        runtime.clone(),
        &settings.engine_options(),
        settings.poll_interval(),
        &init_token,
    )
    .await?;

    let sampler = settings.sampler_config(&runtime)?;
    let system = settings
        .system_prompt()
        .map(|prompt| Message::text(&runtime, prompt))
        .transpose()?;
    let conversation = engine.create_conversation(system.as_ref(), Some(&sampler))?;

    eprintln!("Model ready. Type a message, Ctrl-C stops a reply, Ctrl-D exits.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let message = Message::text(&runtime, line)?;
        if cli.no_stream {
            match conversation.send_sync(&message) {
                Ok(reply) => println!("{reply}"),
                Err(e) => eprintln!("error: {e}"),
            }
        } else {
            stream_reply(&conversation, &message).await?;
        }
        message.release();
    }

    conversation.release();
    sampler.release();
    if let Some(system) = system {
        system.release();
    }
    engine.release();
    Ok(())
}

/// Streams one reply to stdout. Ctrl-C cancels both the native request and the stream.
async fn stream_reply(
    conversation: &Conversation,
    message: &Message,
) -> Result<(), Box<dyn std::error::Error>> {
    let (subscription, mut events) = conversation.events()?;
    let token = CancellationToken::new();
    let mut stream = conversation.stream_send(message, token.clone())?;
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            fragment = stream.next() => match fragment {
                Some(fragment) => {
                    print!("{fragment}");
                    stdout.flush()?;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !token.is_cancelled() => {
                conversation.cancel()?;
                token.cancel();
            }
        }
    }
    println!();

    drop(subscription);
    while let Ok(event) = events.try_recv() {
        if let InferenceEvent::Error(message) = event {
            eprintln!("error: {}", message.as_deref().unwrap_or("inference failed"));
        }
    }
    Ok(())
}
