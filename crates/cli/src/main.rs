mod demo;

use std::{path::PathBuf, sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    clap::{Parser, Subcommand},
    parley_flows::{
        ChatId, Error as FlowError, FlowData, FlowEngine, FlowRegistry, TemplateRenderer, UserId,
        command_word,
    },
    parley_telegram::{TelegramAccountConfig, TelegramTransport, Unhandled, UpdateFallback},
    secrecy::Secret,
    teloxide::{Bot, requests::Requester},
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "parley", about = "Parley: conversational flows for Telegram bots")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot with the bundled signup flow.
    Run {
        /// Bot config file (TOML or JSON). Defaults apply when omitted.
        #[arg(long, env = "PARLEY_CONFIG")]
        config: Option<PathBuf>,
        /// Bot token (overrides the config value).
        #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
        token: Option<String>,
        /// Cancel flows idle for longer than this many seconds (0 disables).
        #[arg(long, default_value_t = 3600)]
        idle_timeout_secs: u64,
    },
    /// Load a config file and print it with secrets redacted.
    CheckConfig {
        #[arg(long, env = "PARLEY_CONFIG")]
        config: PathBuf,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

/// Handles `/start` and `/help` outside of a flow.
struct BotCommands {
    engine: Arc<FlowEngine>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BotCommand {
    Start,
    Help,
}

impl BotCommand {
    /// `/start`, `/START@parley_bot ref` and the like.
    fn parse(text: &str) -> Option<Self> {
        let word = command_word(text)?;
        if word.eq_ignore_ascii_case("/start") {
            Some(Self::Start)
        } else if word.eq_ignore_ascii_case("/help") {
            Some(Self::Help)
        } else {
            None
        }
    }
}

#[async_trait]
impl UpdateFallback for BotCommands {
    async fn handle(&self, bot: &Bot, update: Unhandled) -> anyhow::Result<()> {
        let Unhandled::Message(msg) = update else {
            return Ok(());
        };
        let (Some(from), Some(text)) = (msg.from.as_ref(), msg.text()) else {
            return Ok(());
        };
        let user_id = UserId(from.id.0);
        let chat_id = ChatId(msg.chat.id.0);

        match BotCommand::parse(text) {
            Some(BotCommand::Start) => {
                match self
                    .engine
                    .start_flow(user_id, chat_id, demo::SIGNUP_FLOW, FlowData::new())
                    .await
                {
                    Ok(_) => {},
                    Err(FlowError::AlreadyInFlow { .. }) => {
                        bot.send_message(msg.chat.id, "You're already signing up. Send /cancel to stop.")
                            .await?;
                    },
                    Err(e) => return Err(e.into()),
                }
            },
            Some(BotCommand::Help) => {
                bot.send_message(msg.chat.id, "/start - sign up\n/cancel - stop the current conversation")
                    .await?;
            },
            None => {},
        }
        Ok(())
    }
}

async fn run(
    config: Option<PathBuf>,
    token: Option<String>,
    idle_timeout_secs: u64,
) -> anyhow::Result<()> {
    let mut config = match config {
        Some(path) => TelegramAccountConfig::load(&path)?,
        None => TelegramAccountConfig::default(),
    };
    if let Some(token) = token {
        config.token = Secret::new(token);
    }

    let bot = parley_telegram::connect(&config).await?;
    let engine = Arc::new(FlowEngine::new(
        Arc::new(FlowRegistry::new()),
        Arc::new(TemplateRenderer),
        Arc::new(TelegramTransport::new(bot.clone())),
        config.flows.clone(),
    ));
    engine.register_flow(demo::signup_flow()?);

    let fallback = Arc::new(BotCommands {
        engine: Arc::clone(&engine),
    });
    let cancel = parley_telegram::start_polling(bot, &config, Arc::clone(&engine), fallback);

    if idle_timeout_secs > 0 {
        let max_idle = Duration::from_secs(idle_timeout_secs);
        let registry = Arc::clone(engine.registry());
        let stop = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(max_idle.min(Duration::from_secs(60)));
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        let expired = registry.expire_idle(max_idle).await;
                        if !expired.is_empty() {
                            info!(count = expired.len(), "expired idle flows");
                        }
                    },
                }
            }
        });
    }

    tokio::select! {
        _ = cancel.cancelled() => warn!("telegram polling ended"),
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("shutting down");
            cancel.cancel();
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "parley starting");

    match cli.command {
        Commands::Run {
            config,
            token,
            idle_timeout_secs,
        } => run(config, token, idle_timeout_secs).await,
        Commands::CheckConfig { config } => {
            let config = TelegramAccountConfig::load(&config)?;
            println!("{config:#?}");
            if !config.has_token() {
                warn!("no bot token configured; set TELEGRAM_BOT_TOKEN or pass --token");
            }
            Ok(())
        },
    }
}
