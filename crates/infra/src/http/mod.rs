//! HTTP client wrapper and the webhook receiver.

pub mod client;
pub mod parsers;
pub mod server;
pub mod signature;

pub use client::{HttpClient, HttpClientBuilder};
pub use parsers::{default_parsers, WebhookEvent, WebhookParser};
pub use server::{WebhookServer, WebhookServerState};
pub use signature::{sign_payload, verify_signature};
