//! Unix-socket transport layer for CSI messages.
//!
//! This module provides [`CsiClient`] and [`CsiServer`] that exchange
//! [`CsiMessage`](crate::CsiMessage) values as length-delimited JSON frames
//! over a unix domain socket, plus the [`Interceptor`] chain the server runs
//! every call through.

pub mod client;
pub mod interceptor;
pub mod server;

pub use client::CsiClient;
pub use interceptor::{CallResult, Dispatch, Interceptor, Next, RequestLogger};
pub use server::CsiServer;

use tokio_util::codec::LengthDelimitedCodec;

/// Upper bound on a single encoded message.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Frame codec shared by client and server: a 4-byte big-endian length
/// prefix followed by the JSON payload.
pub(crate) fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}
