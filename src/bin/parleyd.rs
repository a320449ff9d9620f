//! parley daemon - runs the session engine behind a Unix socket intake
//!
//! A transport process (long-polling or webhook fetcher) connects to the
//! socket and streams events as JSON lines; outbound requests produced by
//! sessions are written to stdout as JSON lines for the transport to send.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (socket at /tmp/parley.sock)
//! parleyd start
//!
//! # Start with a config file and a custom socket
//! parleyd start --config parley.toml --socket /run/parley.sock
//!
//! # Print the default configuration
//! parleyd config
//! ```

use std::env;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use parley_core::{EngineConfig, Event, EventKind, FloodAction, FloodRule, SessionKind};
use parleyd::outbox::{JsonLinesOutbox, OutboundRequest};
use parleyd::registry::RemovalReason;
use parleyd::routes::{command_name, RouteNode, RouteTree};
use parleyd::server::{IntakeServer, DEFAULT_SOCKET_PATH};
use parleyd::{EngineBuilder, RegistryBuilder, SessionContext, SessionHandler};

/// parley daemon - chat-bot session engine
#[derive(Parser, Debug)]
#[command(name = "parleyd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon in the foreground
    Start {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Socket path (overrides PARLEY_SOCKET)
        #[arg(short, long)]
        socket: Option<PathBuf>,
    },
    /// Print the default configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        config: None,
        socket: None,
    });

    match command {
        Command::Start { config, socket } => {
            let config = load_config(config)?;
            let socket = socket
                .or_else(|| env::var("PARLEY_SOCKET").ok().map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));
            run_daemon(config, socket)
        }
        Command::Config => {
            let rendered = toml::to_string_pretty(&EngineConfig::default())
                .context("Failed to render default configuration")?;
            println!("{rendered}");
            Ok(())
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("parley").join("config.toml"))
}

/// Reads the given file, or the per-user default if it exists, or falls
/// back to built-in defaults.
fn load_config(path: Option<PathBuf>) -> Result<EngineConfig> {
    let path = match path {
        Some(path) => path,
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => path,
            None => return Ok(EngineConfig::default()),
        },
    };

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("Invalid config file {}", path.display()))
}

#[tokio::main]
async fn run_daemon(config: EngineConfig, socket: PathBuf) -> Result<()> {
    // Logs go to stderr; stdout carries outbound requests.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("parleyd=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "parley daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let engine = EngineBuilder::new(config)
        .outbox(Arc::new(JsonLinesOutbox::new(tokio::io::stdout())))
        .registry(RegistryBuilder::<ChatBot>::new("chats").idle_timeout(Duration::from_secs(600)))
        .registry(
            RegistryBuilder::<UserGuard>::new("users")
                .kind(SessionKind::User)
                .idle_timeout(Duration::from_secs(3600))
                .flood(FloodRule {
                    event_kinds: vec![EventKind::Message, EventKind::CallbackQuery],
                    threshold: 20,
                    window_secs: 10,
                    action: FloodAction::Notify,
                }),
        )
        .start(cancel_token.clone())
        .context("Failed to start engine")?;

    let server = IntakeServer::new(&socket, engine.clone(), cancel_token);
    info!(socket = %socket.display(), "Starting server");

    let result = server.run().await;
    let removed = engine.shutdown().await;
    info!(sessions_removed = removed, "parley daemon stopped");

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

// ============================================================================
// Demo handlers
// ============================================================================

/// Per-chat conversation: `/start`, `/echo`, `/remind`, greetings.
#[derive(Default)]
struct ChatBot {
    chat: Option<i64>,
    started: bool,
}

impl ChatBot {
    async fn reply(&self, ctx: &SessionContext, text: impl Into<String>) {
        let Some(chat) = self.chat else { return };
        if let Err(e) = ctx.send(OutboundRequest::send_message(chat, text)).await {
            warn!(session = %ctx.tag(), error = %e, "Reply failed");
        }
    }
}

/// Text after the command word.
fn command_args(event: &Event) -> &str {
    let text = event.text().trim_start();
    match text.split_once(char::is_whitespace) {
        Some((_, rest)) => rest.trim(),
        None => "",
    }
}

#[async_trait]
impl SessionHandler for ChatBot {
    fn routes(&self) -> RouteTree<Self> {
        let mut tree = RouteTree::new()
            .with(RouteNode::<Self>::command(["start"], |bot, ctx, event| {
                bot.chat = event.chat_id;
                bot.started = true;
                async move {
                    bot.reply(ctx, "Hi! Try /echo, /remind <secs> <text> or just say hello.")
                        .await;
                    true
                }
                .boxed()
            }))
            .with(RouteNode::<Self>::command(["echo"], |bot, ctx, event| {
                async move {
                    let args = command_args(event);
                    if args.is_empty() {
                        return false;
                    }
                    bot.reply(ctx, args).await;
                    true
                }
                .boxed()
            }))
            .with(RouteNode::<Self>::command(["remind"], |bot, ctx, event| {
                async move {
                    let args = command_args(event);
                    let Some((secs, text)) = args.split_once(char::is_whitespace) else {
                        bot.reply(ctx, "Usage: /remind <secs> <text>").await;
                        return true;
                    };
                    match secs.parse::<u64>() {
                        Ok(secs) => {
                            ctx.schedule_wake(Duration::from_secs(secs), text.trim());
                            bot.reply(ctx, format!("Okay, in {secs}s.")).await;
                        }
                        Err(_) => bot.reply(ctx, "Usage: /remind <secs> <text>").await,
                    }
                    true
                }
                .boxed()
            }))
            .with(RouteNode::<Self>::command(["stop"], |bot, ctx, _| {
                async move {
                    bot.reply(ctx, "Bye!").await;
                    ctx.close();
                    true
                }
                .boxed()
            }));

        match RouteNode::<Self>::content(r"(?i)^\s*(hello|hi|hey)\b", |bot, ctx, _| {
            async move {
                bot.reply(ctx, "Hello there!").await;
                true
            }
            .boxed()
        }) {
            Ok(node) => tree.push(node),
            Err(e) => warn!(error = %e, "Greeting route disabled"),
        }

        tree.with(RouteNode::<Self>::fallback(|bot, ctx, event| {
            async move {
                if !bot.started {
                    bot.reply(ctx, "Send /start to begin.").await;
                } else if command_name(event.text()).is_some() {
                    bot.reply(ctx, "Unknown command or missing arguments.").await;
                }
                true
            }
            .boxed()
        }))
    }

    async fn on_start(&mut self, ctx: &mut SessionContext) {
        self.chat = ctx.identifier().as_int();
    }

    async fn on_wake(&mut self, key: &str, ctx: &mut SessionContext) {
        self.reply(ctx, format!("Reminder: {key}")).await;
    }

    async fn on_idle(&mut self, ctx: &mut SessionContext) {
        if self.started {
            self.reply(ctx, "Closing this conversation after inactivity.").await;
        }
    }

    async fn on_close(&mut self, reason: RemovalReason, ctx: &mut SessionContext) {
        info!(session = %ctx.tag(), reason = %reason, "Chat session closed");
    }
}

/// Per-user guard: counts activity across chats and warns on floods.
#[derive(Default)]
struct UserGuard {
    seen: u64,
    last_chat: Option<i64>,
}

#[async_trait]
impl SessionHandler for UserGuard {
    fn routes(&self) -> RouteTree<Self> {
        RouteTree::new().with(RouteNode::<Self>::fallback(|guard, _, event| {
            guard.seen += 1;
            guard.last_chat = event.chat_id.or(guard.last_chat);
            async { true }.boxed()
        }))
    }

    async fn on_flood(&mut self, rule: &FloodRule, ctx: &mut SessionContext) {
        warn!(session = %ctx.tag(), seen = self.seen, threshold = rule.threshold, "User is flooding");
        if let Some(chat) = self.last_chat {
            let request =
                OutboundRequest::send_message(chat, "Slow down a little, please.");
            if let Err(e) = ctx.send(request).await {
                warn!(session = %ctx.tag(), error = %e, "Flood warning failed");
            }
        }
    }
}
