//! RAMS daemon - HTTP service for the rescue dispatch engines.

pub mod routes;
pub mod server;
