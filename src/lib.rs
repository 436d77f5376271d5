// ABOUTME: Main library entry point for the DuraChat streaming backend
// ABOUTME: Chat orchestration, provider adapters, and credit metering over WebSocket
//
// SPDX-License-Identifier: MIT OR Apache-2.0

#![deny(unsafe_code)]

//! # DuraChat Server
//!
//! Streaming chat orchestration with per-token credit metering. The server
//! accepts WebSocket sessions, streams model output from AI providers live
//! to every connection watching a conversation, persists the transcript,
//! and settles the cost of each turn against a credit ledger.
//!
//! ## Architecture
//!
//! - **Providers**: normalized streaming adapters for Google Gemini and
//!   `OpenAI`, plus the registry and per-user key resolution
//! - **Chat**: the turn orchestrator and the WebSocket wire contract
//! - **Store**: SQLite persistence for conversations, messages, usage,
//!   attachments, and the credit ledger
//! - **Credits / Pricing**: token pricing tables and atomic balance
//!   settlement with system-key markup
//! - **Session**: live connection registry with conversation fan-out
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use durachat::config::ServerConfig;
//! use durachat::errors::AppResult;
//!
//! fn main() -> AppResult<()> {
//!     let config = ServerConfig::from_env()?;
//!     println!("DuraChat configured for port {}", config.http_port);
//!     Ok(())
//! }
//! ```

pub mod chat;
pub mod config;
pub mod credits;
pub mod crypto;
pub mod errors;
pub mod logging;
pub mod pricing;
pub mod providers;
pub mod server;
pub mod session;
pub mod store;
