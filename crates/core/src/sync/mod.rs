//! Reconciliation and session ports

pub mod ports;
