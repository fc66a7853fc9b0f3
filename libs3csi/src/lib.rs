//! # libs3csi - S3 buckets as CSI volumes over QUIC
//!
//! `libs3csi` is a [Container Storage Interface][csi] plugin that provisions
//! one S3 bucket per volume and exposes it to workloads through a FUSE
//! mount helper (`s3fs`, `rclone` or `goofys`).  Requests travel over QUIC
//! (via [`quinn`]) instead of gRPC.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Volume`, `VolumeId`, capabilities, requests. |
//! | [`error`] | [`CsiError`] enum covering all failure modes. |
//! | [`config`] | Driver configuration and per-request S3 settings. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery & health. |
//! | [`controller`] | [`CsiController`] trait: provisioning and listing. |
//! | [`node`] | [`CsiNode`] trait: stage, publish, unpublish, stats. |
//! | [`registry`] | Read-only view of the orchestrator's persistent volumes. |
//! | [`s3`] | Object-store client and the per-bucket metadata repository. |
//! | [`mounter`] | FUSE helpers and the mount-process supervisor. |
//! | [`transport`] | QUIC client/server built on `quinn`. |
//! | [`backend`] | The [`S3Driver`] tying the pieces together. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod backend;
pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod message;
pub mod mounter;
pub mod node;
pub mod registry;
pub mod s3;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::s3::S3Driver;
pub use controller::CsiController;
pub use error::CsiError;
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::CsiNode;
pub use types::*;
