//! `ipp-core` — the inter-processor messaging core for a dual-processor
//! power-supply controller: a framed binary protocol, a message-granular
//! channel over a raw shared-memory-style transport, the application-side
//! device proxy and its supervisory-point adapters, and the MCU-side
//! sampling and dispatch tasks.
//!
//! The split mirrors the two processors this crate sits between:
//! [`app`] runs on the application processor and talks to the supervisory
//! record layer; [`mcu`] runs on the real-time co-processor and talks to
//! the analog front end over SPI. Both sides share [`proto`], [`channel`],
//! and [`transport`].

pub mod app;
pub mod channel;
pub mod config;
pub mod error;
pub mod mcu;
pub mod proto;
pub mod transport;
