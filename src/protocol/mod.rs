//! Tor protocol implementation
//!
//! This module implements the client data plane:
//! - Cell protocol (fixed and variable-length cells, relay cells)
//! - Per-hop onion crypto (AES-128-CTR + running SHA-1 digests)
//! - Handshakes (CREATE_FAST, TAP, ntor)
//! - Circuit building and extension
//! - Flow control (SENDME windows)
//! - Stream management and DNS resolution

mod cell;
mod circuit;
mod circuit_builder;
mod connection;
pub mod crypto;
pub mod flow_control;
pub mod handshake;
mod node;
mod relay_cell;
mod resolve;
mod router;
mod stream;

pub use cell::{
    parse_created2_body, Cell, CellCommand, DestroyReason, CELL_LEN, CIRC_ID_LEN, PAYLOAD_LEN,
};
pub use circuit::{Circuit, CircuitCore, CircuitState, RELAY_EARLY_BUDGET};
pub use circuit_builder::{CircuitBuildHandler, CircuitBuilder, NoopHandler};
pub use connection::{read_cell, run_reader, CircuitTable, Connection};
pub use crypto::{HopCryptoState, HopKeys, KdfKind};
pub use handshake::{ClientHandshake, HandshakeKind};
pub use node::CircuitNode;
pub use relay_cell::{
    EndReason, HopIndex, RelayCell, RelayCommand, RELAY_DATA_LEN, RELAY_HEADER_LEN,
};
pub use resolve::{parse_resolved, ResolvedAddress};
pub use router::{CircuitPurpose, FixedPath, PathChooser, Router};
pub use stream::{Stream, StreamTarget};
