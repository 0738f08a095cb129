pub mod config;
pub mod events;
pub mod logging;
pub mod models;
pub mod redact;
pub mod tasks;
