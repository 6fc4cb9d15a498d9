//! RAMS control CLI - thin HTTP client for ramsd.

pub mod cli;
pub mod client;
pub mod commands;
