use std::{sync::Arc, time::Duration};

use {
    secrecy::ExposeSecret,
    teloxide::{
        ApiError, RequestError,
        prelude::*,
        types::{AllowedUpdate, BotCommand, UpdateKind},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use parley_flows::FlowEngine;

#[cfg(feature = "metrics")]
use parley_metrics::{counter, telegram as tg_metrics};

use crate::{
    config::TelegramAccountConfig,
    error::{Error, Result},
    handlers::{self, UpdateFallback},
};

/// Headroom on top of the long-poll timeout so the HTTP client never aborts
/// a `getUpdates` call before Telegram answers it.
const CLIENT_TIMEOUT_MARGIN_SECS: u64 = 15;

/// Build a bot for `config`, verify its token and prepare it for long
/// polling: the webhook is cleared and the configured commands registered.
pub async fn connect(config: &TelegramAccountConfig) -> Result<Bot> {
    if !config.has_token() {
        return Err(Error::message("telegram bot token is not configured"));
    }
    let client = teloxide::net::default_reqwest_settings()
        .timeout(Duration::from_secs(
            u64::from(config.poll_timeout_secs) + CLIENT_TIMEOUT_MARGIN_SECS,
        ))
        .build()?;
    let bot = Bot::with_client(config.token.expose_secret(), client);

    let me = bot.get_me().await?;
    bot.delete_webhook().send().await?;

    if !config.commands.is_empty() {
        let commands = config
            .commands
            .iter()
            .map(|c| BotCommand::new(c.command.trim_start_matches('/'), &c.description))
            .collect::<Vec<_>>();
        if let Err(e) = bot.set_my_commands(commands).await {
            warn!("failed to register bot commands: {e}");
        }
    }

    info!(username = ?me.username, "telegram bot connected (webhook cleared)");
    Ok(bot)
}

/// Spawn the long-polling loop.
///
/// Every update runs in its own task; the engine serializes events of the
/// same user. The loop stops when the returned token is cancelled, or when
/// Telegram reports that another process is polling with the same token.
pub fn start_polling(
    bot: Bot,
    config: &TelegramAccountConfig,
    engine: Arc<FlowEngine>,
    fallback: Arc<dyn UpdateFallback>,
) -> CancellationToken {
    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    let poll_timeout = config.poll_timeout_secs;
    let retry_delay = Duration::from_secs(config.retry_delay_secs);

    tokio::spawn(async move {
        info!("starting telegram polling loop");
        let mut offset: i32 = 0;

        loop {
            let request = bot
                .get_updates()
                .offset(offset)
                .timeout(poll_timeout)
                .allowed_updates(vec![AllowedUpdate::Message, AllowedUpdate::CallbackQuery]);
            let result = tokio::select! {
                _ = stop.cancelled() => break,
                result = request.send() => result,
            };

            match result {
                Ok(updates) => {
                    debug!(count = updates.len(), "got telegram updates");
                    for update in updates {
                        offset = update.id.as_offset();
                        dispatch(update.kind, &bot, &engine, &fallback);
                    }
                },
                Err(RequestError::Api(ApiError::TerminatedByOtherGetUpdates)) => {
                    warn!("telegram polling stopped: another instance is already running with this token");
                    stop.cancel();
                    break;
                },
                Err(e) => {
                    #[cfg(feature = "metrics")]
                    counter!(tg_metrics::POLLING_ERRORS_TOTAL).increment(1);
                    warn!(error = %e, "telegram getUpdates failed");
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(retry_delay) => {},
                    }
                },
            }
        }
        info!("telegram polling stopped");
    });

    cancel
}

fn dispatch(
    kind: UpdateKind,
    bot: &Bot,
    engine: &Arc<FlowEngine>,
    fallback: &Arc<dyn UpdateFallback>,
) {
    let (bot, engine, fallback) = (bot.clone(), Arc::clone(engine), Arc::clone(fallback));
    match kind {
        UpdateKind::Message(msg) => {
            tokio::spawn(async move {
                let chat_id = msg.chat.id.0;
                if let Err(e) =
                    handlers::handle_message(msg, &bot, &engine, fallback.as_ref()).await
                {
                    error!(chat_id, error = %e, "error handling telegram message");
                }
            });
        },
        UpdateKind::CallbackQuery(query) => {
            tokio::spawn(async move {
                let user_id = query.from.id.0;
                if let Err(e) =
                    handlers::handle_callback_query(query, &bot, &engine, fallback.as_ref()).await
                {
                    error!(user_id, error = %e, "error handling telegram callback query");
                }
            });
        },
        other => debug!("ignoring unsupported update: {other:?}"),
    }
}
