//! Task tracker integration.

pub mod client;
pub mod normalizer;

pub use client::{TrackerBackfill, TrackerClient, TrackerTaskResponse};
pub use normalizer::TrackerNormalizer;
