//! Core domain + application logic for the group-admin chat bot.
//!
//! This crate is intentionally framework-agnostic. The protocol client and the
//! credential backend live behind ports (traits) implemented in adapter crates.

pub mod admin;
pub mod audit;
pub mod commands;
pub mod config;
pub mod console;
pub mod credentials;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod logging;
pub mod router;
pub mod session;
pub mod transport;

pub use errors::{Error, Result};
