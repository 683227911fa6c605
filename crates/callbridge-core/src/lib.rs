//! Core types, config, errors, and telephony wire protocol for callbridge.

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;
