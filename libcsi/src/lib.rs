//! # libcsi: simplified CSI over unix sockets
//!
//! `libcsi` implements a lightweight [Container Storage Interface][csi] layer
//! that frames JSON messages over a unix domain socket instead of gRPC.
//! Servers run every call through an interceptor chain before it reaches
//! the registered Identity, Controller or Node service.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Volume`, `VolumeId`, capabilities, requests. |
//! | [`error`] | [`CsiError`] enum covering all failure modes. |
//! | [`message`] | [`CsiMessage`] protocol envelope. |
//! | [`identity`] | [`CsiIdentity`] trait: plugin discovery and health. |
//! | [`controller`] | [`CsiController`] trait: volume create/delete/attach. |
//! | [`node`] | [`CsiNode`] trait: stage, publish, unpublish, unstage. |
//! | [`transport`] | Unix-socket client/server and the interceptor chain. |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod controller;
pub mod error;
pub mod identity;
pub mod message;
pub mod node;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use controller::CsiController;
pub use error::CsiError;
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::CsiNode;
pub use types::*;
