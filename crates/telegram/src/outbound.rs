use std::{future::Future, time::Duration};

use {
    async_trait::async_trait,
    teloxide::{
        ApiError, Bot, RequestError,
        payloads::{AnswerCallbackQuerySetters, SendMessageSetters, SendPhotoSetters},
        requests::Requester,
        types::{
            ChatId as TelegramChatId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile,
            MessageId,
        },
    },
    tracing::{debug, warn},
};

use parley_flows::{FlowTransport, InlineButton, MessageRef, OutboundMessage};

#[cfg(feature = "metrics")]
use parley_metrics::{counter, telegram as tg_metrics};

use crate::{
    error::{Error, Result},
    text::{CAPTION_LIMIT, MAX_MESSAGE_LEN, chunk_text},
};

const TELEGRAM_RETRY_AFTER_MAX_RETRIES: usize = 4;

/// [`FlowTransport`] backed by the Telegram Bot API.
#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> &Bot {
        &self.bot
    }

    async fn send_text(
        &self,
        chat_id: TelegramChatId,
        text: &str,
        markup: Option<InlineKeyboardMarkup>,
    ) -> Result<MessageId> {
        let chunks = chunk_text(text, MAX_MESSAGE_LEN);
        let Some((last, leading)) = chunks.split_last() else {
            return Err(Error::message("refusing to send an empty message"));
        };

        for chunk in leading {
            self.with_retry(chat_id, "send message", || {
                let req = self.bot.send_message(chat_id, chunk.clone());
                async move { req.await }
            })
            .await?;
        }

        // Buttons go on the last chunk so they sit under the full text.
        let sent = self
            .with_retry(chat_id, "send message", || {
                let mut req = self.bot.send_message(chat_id, last.clone());
                if let Some(markup) = &markup {
                    req = req.reply_markup(markup.clone());
                }
                async move { req.await }
            })
            .await?;
        Ok(sent.id)
    }

    async fn send_photo(
        &self,
        chat_id: TelegramChatId,
        image: &str,
        text: &str,
        markup: Option<InlineKeyboardMarkup>,
    ) -> Result<MessageId> {
        let url = reqwest::Url::parse(image)
            .map_err(|e| Error::external(format!("invalid image url {image:?}"), e))?;

        let fits_caption = text.chars().count() <= CAPTION_LIMIT;
        let sent = self
            .with_retry(chat_id, "send photo", || {
                let mut req = self.bot.send_photo(chat_id, InputFile::url(url.clone()));
                if fits_caption && !text.is_empty() {
                    req = req.caption(text);
                }
                if fits_caption && let Some(markup) = &markup {
                    req = req.reply_markup(markup.clone());
                }
                async move { req.await }
            })
            .await?;

        if fits_caption {
            Ok(sent.id)
        } else {
            self.send_text(chat_id, text, markup).await
        }
    }

    async fn with_retry<T, F, Fut>(
        &self,
        chat_id: TelegramChatId,
        operation: &'static str,
        mut request: F,
    ) -> std::result::Result<T, RequestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, RequestError>>,
    {
        let mut retries = 0usize;

        loop {
            match request().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let Some(wait) = retry_after_duration(&err) else {
                        return Err(err);
                    };

                    if retries >= TELEGRAM_RETRY_AFTER_MAX_RETRIES {
                        warn!(
                            chat_id = chat_id.0,
                            operation,
                            retries,
                            retry_after_secs = wait.as_secs(),
                            "telegram rate limit persisted after retries"
                        );
                        return Err(err);
                    }

                    retries += 1;
                    warn!(
                        chat_id = chat_id.0,
                        operation,
                        retries,
                        retry_after_secs = wait.as_secs(),
                        "telegram rate limited, waiting before retry"
                    );
                    tokio::time::sleep(wait).await;
                },
            }
        }
    }
}

#[async_trait]
impl FlowTransport for TelegramTransport {
    async fn send(&self, message: OutboundMessage) -> anyhow::Result<Option<MessageRef>> {
        let chat_id = TelegramChatId(message.chat_id.0);
        let markup = keyboard_markup(&message.keyboard);

        let sent = match message.image.as_deref() {
            Some(image) => {
                self.send_photo(chat_id, image, &message.text, markup)
                    .await
            },
            None => self.send_text(chat_id, &message.text, markup).await,
        };

        match sent {
            Ok(id) => {
                #[cfg(feature = "metrics")]
                counter!(tg_metrics::MESSAGES_SENT_TOTAL).increment(1);
                debug!(
                    chat_id = chat_id.0,
                    message_id = id.0,
                    buttons = message.keyboard.iter().map(Vec::len).sum::<usize>(),
                    "telegram prompt sent"
                );
                Ok(Some(MessageRef::new(message.chat_id, id.0)))
            },
            Err(e) => {
                #[cfg(feature = "metrics")]
                counter!(tg_metrics::MESSAGE_SEND_ERRORS_TOTAL).increment(1);
                Err(e.into())
            },
        }
    }

    async fn acknowledge(&self, callback_id: &str, notice: Option<&str>) -> anyhow::Result<()> {
        let mut req = self.bot.answer_callback_query(callback_id.to_owned());
        if let Some(notice) = notice {
            req = req.text(notice);
        }
        req.await?;
        Ok(())
    }

    async fn delete_message(&self, message: MessageRef) -> anyhow::Result<()> {
        let result = self
            .bot
            .delete_message(
                TelegramChatId(message.chat_id.0),
                MessageId(message.message_id),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_already_gone(&e) => {
                debug!(chat_id = message.chat_id.0, message_id = message.message_id, "message already deleted");
                Ok(())
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn clear_keyboard(&self, message: MessageRef) -> anyhow::Result<()> {
        let result = self
            .bot
            .edit_message_reply_markup(
                TelegramChatId(message.chat_id.0),
                MessageId(message.message_id),
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_already_gone(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Inline keyboard whose callback data is the token of each button.
fn keyboard_markup(rows: &[Vec<InlineButton>]) -> Option<InlineKeyboardMarkup> {
    if rows.iter().all(Vec::is_empty) {
        return None;
    }
    Some(InlineKeyboardMarkup::new(rows.iter().map(|row| {
        row.iter()
            .map(|button| InlineKeyboardButton::callback(button.label.clone(), button.token.clone()))
            .collect::<Vec<_>>()
    })))
}

fn retry_after_duration(error: &RequestError) -> Option<Duration> {
    match error {
        RequestError::RetryAfter(wait) => Some(wait.duration()),
        _ => None,
    }
}

/// The target message no longer exists or no longer has what we wanted to
/// remove.
fn is_already_gone(error: &RequestError) -> bool {
    matches!(
        error,
        RequestError::Api(
            ApiError::MessageToDeleteNotFound
                | ApiError::MessageCantBeDeleted
                | ApiError::MessageNotModified
                | ApiError::MessageToEditNotFound
        )
    )
}
