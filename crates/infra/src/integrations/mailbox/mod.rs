//! Shared mailbox integration.

pub mod client;
pub mod normalizer;

pub use client::{MailboxBackfill, MailboxClient};
pub use normalizer::MailboxNormalizer;
