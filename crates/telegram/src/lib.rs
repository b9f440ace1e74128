//! Telegram transport for the parley flow engine.
//!
//! Receives updates by long polling with teloxide, feeds them to a
//! [`parley_flows::FlowEngine`] and delivers prompts as messages with inline
//! keyboards whose callback data is the engine's opaque token.

pub mod bot;
pub mod config;
pub mod error;
pub mod handlers;
pub mod outbound;
pub mod text;

pub use {
    bot::{connect, start_polling},
    config::{BotCommandConfig, TelegramAccountConfig},
    error::{Error, Result},
    handlers::{IgnoreUnhandled, Unhandled, UpdateFallback},
    outbound::TelegramTransport,
};
