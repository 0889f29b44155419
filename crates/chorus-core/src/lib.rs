//! # chorus-core
//!
//! The connection hub and per-connection pumps of the Chorus broadcast relay.
//!
//! This crate provides:
//!
//! - **Hub** - the single owner of the live client set; serializes
//!   registration, deregistration and broadcast fan-out through one loop
//! - **Client** - the reader/writer pump pair bound to one connection
//! - **Message** - payload normalization and outbound coalescing
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  broadcast   ┌─────────┐  try_send   ┌──────────┐
//! │  reader  │─────────────▶│   Hub   │────────────▶│  queue   │
//! │  pump    │  register /  │  loop   │  (evict on  │ (bounded)│
//! └──────────┘  unregister  └─────────┘    full)    └────┬─────┘
//!      ▲                                                 │
//!      │ frames                                          ▼
//! ┌────┴─────────────────────────────────────────┐  ┌──────────┐
//! │                 connection                   │◀─│  writer  │
//! └──────────────────────────────────────────────┘  │  pump    │
//!                                                   └──────────┘
//! ```
//!
//! No locks guard the client set: every mutation is a message into the hub
//! loop, and each queue has exactly one producer (the hub) and one consumer
//! (its writer pump).

pub mod client;
pub mod hub;
pub mod message;
pub mod metrics;

pub use client::{Client, ClientId, ConfigError, PumpConfig, PumpError};
pub use hub::{Delivery, Hub, HubCommands, HubError, HubHandle, HubStats};
pub use message::{coalesce, normalize};
