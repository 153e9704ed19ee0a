#![forbid(unsafe_code)]
//! Asynchronous TNFS protocol engine for Rust.
//!
//! This crate implements the TNFS network file system protocol: a compact binary
//! request/response protocol that lets a client open, read, write, stat and list files
//! on a server-exposed file tree over UDP or TCP.
//!
//! # Overview
//!
//! The engine is made of a handful of layers, leaves first:
//!
//! - [`fcall`] and [`serialize`]: the wire types and the binary codec.
//! - [`error`]: the local error taxonomy and its mapping onto TNFS result codes.
//! - [`handle`]: per-session tables of open file and directory cursors.
//! - [`session`]: per-connection state, including the byte-transform pipeline.
//! - [`secure`]: Diffie-Hellman key agreement feeding a block cipher (secure mount).
//! - [`scram`]: SCRAM mutual authentication run on top of a plain or secure channel.
//! - [`srv`] and [`handlers`]: the command registry, dispatcher and transports.
//! - [`client`]: the mirror image of the server, used by front ends and tests.
//!
//! File-system backends and authenticators plug in through the traits in [`fs`].
//! An in-memory backend lives in [`memfs`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tnfs::{memfs::MemFs, srv::{Server, ServerConfig, srv_async}};
//!
//! #[tokio::main]
//! async fn main() -> tnfs::Result<()> {
//!     let server = Server::new(ServerConfig::default())
//!         .with_mount("/", Arc::new(MemFs::new()), None);
//!     srv_async(Arc::new(server), "udp!0.0.0.0!16384").await
//! }
//! ```
//!
//! # Message Flow
//!
//! 1. **Capabilities** (optional): the client learns the offered SCRAM mechanisms.
//! 2. **Secure mount** (optional): DH key agreement installs a cipher on the session.
//! 3. **Mount**: plain `MOUNT` with optional credentials, or the two SCRAM round trips.
//! 4. **Operations**: open/read/write/stat/list and friends against the mount.
//! 5. **Unmount**: the session and all its handles are released.
//!
//! # Error Handling
//!
//! Handlers return [`error::Error`]. The dispatcher maps every error onto a single
//! [`fcall::ResultCode`] byte; nothing else crosses the wire on failure.
pub mod client;
pub mod error;
pub mod fcall;
pub mod fs;
pub mod handle;
pub mod handlers;
pub mod memfs;
pub mod scram;
pub mod secure;
pub mod serialize;
pub mod session;
pub mod srv;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::fcall::*;
pub use crate::utils::Result;
