//! Identifiers and error plumbing shared by every parley crate.

pub mod error;
pub mod types;

pub use {
    error::FromMessage,
    types::{ChatId, MessageRef, UserId},
};
