//! # Onion Dataplane
//!
//! Client-side data plane of the Tor onion-routing protocol.
//!
//! This crate turns an already-established link to a guard relay into
//! multi-hop circuits and application streams. Everything below the link
//! (TLS, sockets) and above path selection (directory consensus, guard
//! policy) is supplied by the caller.
//!
//! ## Architecture
//!
//! ```text
//! CircuitBuilder
//!   ↓  CREATE / EXTEND, one hop at a time
//! Circuit ──── Stream (AsyncRead + AsyncWrite)
//!   ↓  layered AES-CTR, running SHA-1 digests
//! Connection (caller's link) ←── run_reader loop
//!   ↓
//! Tor Network
//! ```
//!
//! ## Features
//!
//! - **Three handshakes**: CREATE_FAST, TAP and ntor, each with its relay side
//! - **Runtime-agnostic**: timers come from any `tor_rtcompat::SleepProvider`
//! - **Flow control**: per-hop and per-stream SENDME windows with backpressure
//! - **Secure**: key material zeroized on drop, constant-time verification
//!
//! ## Example
//!
//! ```ignore
//! let builder = CircuitBuilder::new(runtime, CircuitConfig::default());
//! let circuit = builder.build_circuit(conn, &path, &NoopHandler).await?;
//! let mut stream = circuit.connect("example.com", 80).await?;
//! stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await?;
//! ```

pub mod config;
mod error;
pub mod protocol;
pub mod runtime;


pub use config::CircuitConfig;
pub use error::{ErrorCode, Result, TorError};
pub use protocol::{
    Cell, CellCommand, Circuit, CircuitBuildHandler, CircuitBuilder, CircuitPurpose, CircuitState,
    CircuitTable, Connection, DestroyReason, EndReason, FixedPath, HandshakeKind, NoopHandler,
    PathChooser, RelayCell, RelayCommand, ResolvedAddress, Router, Stream, StreamTarget,
};
pub use runtime::ThreadSleeper;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
