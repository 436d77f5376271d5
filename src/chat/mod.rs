// ABOUTME: Chat module root wiring wire events to the turn orchestrator
// ABOUTME: Re-exports the orchestrator and the WebSocket message types
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Chat turn orchestration and its wire contract

pub mod events;
pub mod orchestrator;

pub use events::{ClientMessage, ServerEvent};
pub use orchestrator::{ChatOrchestrator, TurnRequest};
