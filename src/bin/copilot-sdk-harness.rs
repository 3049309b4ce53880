use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use copilot_sdk::harness::{
    ApprovalPolicy, HarnessEventFlags, init_logger, init_transcript, print_tee, resolve_level,
};
use copilot_sdk::{
    ClientOptions, CopilotClient, HandlerError, ResumeSessionConfig, SessionConfig,
    SessionEvent, SessionEventKind, Tool, ToolInvocation,
};
use parking_lot::Mutex;

macro_rules! println {
    () => {
        copilot_sdk::harness::println_tee(format_args!(""))
    };
    ($($arg:tt)*) => {
        copilot_sdk::harness::println_tee(format_args!($($arg)*))
    };
}

const DEFAULT_PROMPT: &str = "Summarize what this directory contains in two sentences.";

#[derive(Debug, Parser)]
#[command(
    name = "copilot-sdk-harness",
    about = "Drive a Copilot engine end to end: start, open a session, send a prompt, print the event stream"
)]
struct Args {
    /// TOML client options (defaults to the per-user config file if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Engine executable (overrides the config file and COPILOT_CLI_PATH)
    #[arg(long)]
    cli_path: Option<String>,

    /// Connect to an already running engine instead of spawning one
    #[arg(long)]
    cli_url: Option<String>,

    /// Working directory for a spawned engine
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Model for a new session
    #[arg(long)]
    model: Option<String>,

    /// Prompt to send
    #[arg(long)]
    prompt: Option<String>,

    /// Resume this session id instead of creating a new session
    #[arg(long)]
    resume: Option<String>,

    /// Request streamed deltas (default: true)
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    streaming: bool,

    /// Approve permission requests automatically (default: true)
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    auto_approve: bool,

    /// Permission kinds to always deny (repeatable), e.g. --deny-kind shell
    #[arg(long = "deny-kind")]
    deny_kinds: Vec<String>,

    /// Register a `harness_echo` tool that returns its `text` argument
    #[arg(long)]
    echo_tool: bool,

    /// Overall timeout for the turn
    #[arg(long, default_value_t = 120)]
    timeout_seconds: u64,

    /// Log level (0-5 or off/error/warn/info/debug/trace); falls back to COPILOT_SDK_LOG
    #[arg(long)]
    log_level: Option<String>,

    /// Print the engine status, auth status and models, then exit
    #[arg(long)]
    status: bool,

    /// Print persisted sessions and exit
    #[arg(long)]
    list_sessions: bool,

    /// Write a copy of harness output to a transcript file
    #[arg(long)]
    transcript_file: Option<PathBuf>,
}

fn load_options(args: &Args) -> anyhow::Result<ClientOptions> {
    let config_path = args
        .config
        .clone()
        .or_else(|| ClientOptions::default_config_path().filter(|p| p.exists()));
    let mut options = match &config_path {
        Some(path) => ClientOptions::load(path)?,
        None => ClientOptions::default(),
    };
    if let Some(path) = &args.cli_path {
        options = options.with_cli_path(path.clone());
    }
    if let Some(url) = &args.cli_url {
        options = options.with_cli_url(url.clone());
    }
    if let Some(cwd) = &args.cwd {
        options = options.with_cwd(cwd.clone());
    }
    Ok(options)
}

fn echo_tool() -> Tool {
    Tool::new("harness_echo", |invocation: ToolInvocation| async move {
        let text = invocation.arguments["text"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        Ok::<_, HandlerError>(text)
    })
    .with_description("Echo the `text` argument back")
    .with_parameters(serde_json::json!({
        "type": "object",
        "properties": {"text": {"type": "string"}},
        "required": ["text"]
    }))
}

fn print_event(event: &SessionEvent, streaming: bool) {
    match event.kind() {
        SessionEventKind::AssistantMessageDelta { delta_content, .. } => {
            print_tee(format_args!("{delta_content}"));
        }
        SessionEventKind::AssistantMessage { content, .. } => {
            if streaming {
                println!();
            } else {
                println!("{content}");
            }
        }
        SessionEventKind::AssistantReasoningDelta { .. } => {}
        SessionEventKind::ToolExecutionStart { tool_name, .. } => {
            println!("[tool] {tool_name} ...");
        }
        SessionEventKind::ToolExecutionComplete {
            tool_call_id,
            success,
        } => {
            println!("[tool] {tool_call_id} {}", if success { "ok" } else { "FAILED" });
        }
        SessionEventKind::SessionError { message, .. } => println!("[error] {message}"),
        SessionEventKind::Abort { reason } => {
            println!("[abort] {}", reason.unwrap_or_default());
        }
        SessionEventKind::Unknown { event_type } => log::debug!("event {event_type}"),
        _ => log::debug!("event {}", event.event_type),
    }
}

async fn print_status(client: &CopilotClient) -> anyhow::Result<()> {
    let status = client.get_status().await?;
    println!("engine: {} (protocol {})", status.version, status.protocol_version);
    let auth = client.get_auth_status().await?;
    println!(
        "auth: {} {}",
        if auth.is_authenticated { "authenticated" } else { "not authenticated" },
        auth.login.unwrap_or_default()
    );
    for model in client.list_models().await? {
        println!("model: {} ({})", model.id, model.name);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logger(resolve_level(args.log_level.as_deref()));
    if let Some(path) = &args.transcript_file {
        init_transcript(path)
            .with_context(|| format!("Failed to open transcript {}", path.display()))?;
        println!("[transcript] {}", path.display());
    }

    let options = load_options(&args)?;
    let client = CopilotClient::new(options)?;
    println!("copilot-sdk harness");
    println!("endpoint: {:?}", client.endpoint());

    client.start().await.context("Engine failed to start")?;

    if args.status || args.list_sessions {
        if args.status {
            print_status(&client).await?;
        }
        if args.list_sessions {
            for meta in client.list_sessions().await? {
                println!(
                    "session: {} modified {} {}",
                    meta.session_id,
                    meta.modified_time,
                    meta.summary.unwrap_or_default()
                );
            }
        }
        for err in client.stop().await {
            eprintln!("cleanup: {}", err.message);
        }
        return Ok(());
    }

    let policy = ApprovalPolicy {
        auto_approve: args.auto_approve,
        deny_kinds: args.deny_kinds.clone(),
    };
    let session = match &args.resume {
        Some(id) => {
            let mut config = ResumeSessionConfig::new()
                .with_streaming(args.streaming)
                .with_permission_handler(policy.into_handler());
            if args.echo_tool {
                config = config.with_tool(echo_tool());
            }
            client.resume_session(id, config).await?
        }
        None => {
            let mut config = SessionConfig::new()
                .with_streaming(args.streaming)
                .with_permission_handler(policy.into_handler());
            if let Some(model) = &args.model {
                config = config.with_model(model.clone());
            }
            if args.echo_tool {
                config = config.with_tool(echo_tool());
            }
            client.create_session(config).await?
        }
    };
    println!("session: {}", session.id());

    let flags = Arc::new(Mutex::new(HarnessEventFlags::default()));
    let listener_flags = Arc::clone(&flags);
    let streaming = args.streaming;
    let subscription = session.on(move |event| {
        listener_flags.lock().record(event);
        print_event(event, streaming);
    });

    let prompt = args.prompt.clone().unwrap_or_else(|| DEFAULT_PROMPT.to_string());
    println!("== sending prompt ==\n{prompt}\n");
    let outcome = session
        .send_and_wait(prompt.as_str(), Some(Duration::from_secs(args.timeout_seconds)))
        .await;
    subscription.unsubscribe();

    let flags = flags.lock().clone();
    println!();
    println!(
        "== done: {} assistant message(s), failed tool: {}, session error: {} ==",
        flags.assistant_messages, flags.saw_failed_tool, flags.saw_session_error
    );

    let cleanup = client.stop().await;
    for err in &cleanup {
        eprintln!("cleanup: {}", err.message);
    }

    match outcome {
        Ok(Some(_)) => Ok(()),
        Ok(None) => bail!("Turn finished without an assistant message"),
        Err(err) => Err(err).context("Turn failed"),
    }
}
