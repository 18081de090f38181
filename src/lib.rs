//! frpdeck - a web dashboard that supervises frp processes
//!
//! This library provides:
//! - A desired-state supervisor for one frps server and any number of named
//!   frpc client instances, with a self-healing reconciliation loop each
//! - A JSON settings store for binary paths, config bindings and instances
//! - Config file management inside operator-chosen directories
//! - A JSON HTTP API tying the above together

pub mod api;
pub mod config;
pub mod error;
pub mod launcher;
pub mod settings;
pub mod supervisor;
pub mod workspace;
