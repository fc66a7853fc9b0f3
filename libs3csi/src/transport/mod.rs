//! QUIC transport layer for CSI messages.
//!
//! This module provides [`CsiClient`] and [`CsiServer`] that communicate
//! [`CsiMessage`](crate::CsiMessage) values over QUIC bi-directional streams
//! using `quinn`.

pub mod client;
pub mod server;

pub use client::CsiClient;
pub use server::CsiServer;
