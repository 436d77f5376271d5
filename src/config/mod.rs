// ABOUTME: Configuration module root re-exporting environment-driven server config
// ABOUTME: All runtime configuration comes from environment variables
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration management

pub mod environment;

pub use environment::{BillingConfig, ServerConfig, StreamingConfig, SystemKeys};
