//! Webhook auto-registration with the upstream systems.

pub mod registration;

pub use registration::WebhookRegistrar;
