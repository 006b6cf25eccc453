//! Document store integration.

pub mod client;
pub mod normalizer;

pub use client::DocsClient;
pub use normalizer::DocsNormalizer;
