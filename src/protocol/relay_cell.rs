//! Relay cell framing
//!
//! A relay cell lives inside the 509-byte payload of a RELAY or RELAY_EARLY
//! cell:
//!
//! ```text
//! relay_command:u8 | recognized:u16 | stream_id:u16 | digest:u32 | length:u16 | data[498]
//! ```
//!
//! Recognition of an inbound cell needs the zero-then-restore digest check in
//! [`digest_matches`]: the wire bytes must stay untouched on a mismatch so the
//! next hop's peel sees the same buffer.

use super::cell::PAYLOAD_LEN;
use crate::error::{Result, TorError};
use sha1::Digest;
use std::fmt;
use std::ops::Range;
use subtle::ConstantTimeEq;

/// Size of the relay sub-header
pub const RELAY_HEADER_LEN: usize = 11;

/// Maximum data bytes carried by one relay cell
pub const RELAY_DATA_LEN: usize = PAYLOAD_LEN - RELAY_HEADER_LEN;

const COMMAND: usize = 0;
const RECOGNIZED: Range<usize> = 1..3;
const STREAM_ID: Range<usize> = 3..5;
const DIGEST: Range<usize> = 5..9;
const LENGTH: Range<usize> = 9..11;

/// Index of a hop in circuit path order (0 = first hop)
pub type HopIndex = usize;

/// Relay command types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayCommand {
    /// BEGIN - open stream
    Begin,
    /// DATA - relay data
    Data,
    /// END - close stream
    End,
    /// CONNECTED - stream connected
    Connected,
    /// SENDME - flow control credit
    Sendme,
    /// EXTEND - extend circuit (TAP)
    Extend,
    /// EXTENDED - circuit extended (TAP)
    Extended,
    /// TRUNCATE - truncate circuit
    Truncate,
    /// TRUNCATED - circuit truncated
    Truncated,
    /// DROP - long-range padding
    Drop,
    /// RESOLVE - DNS resolve
    Resolve,
    /// RESOLVED - DNS answer
    Resolved,
    /// BEGIN_DIR - begin directory connection
    BeginDir,
    /// EXTEND2 - extend circuit (extensible handshake)
    Extend2,
    /// EXTENDED2
    Extended2,
    /// Any relay command byte without a known meaning
    Unrecognized(u8),
}

impl From<u8> for RelayCommand {
    fn from(cmd: u8) -> Self {
        match cmd {
            1 => RelayCommand::Begin,
            2 => RelayCommand::Data,
            3 => RelayCommand::End,
            4 => RelayCommand::Connected,
            5 => RelayCommand::Sendme,
            6 => RelayCommand::Extend,
            7 => RelayCommand::Extended,
            8 => RelayCommand::Truncate,
            9 => RelayCommand::Truncated,
            10 => RelayCommand::Drop,
            11 => RelayCommand::Resolve,
            12 => RelayCommand::Resolved,
            13 => RelayCommand::BeginDir,
            14 => RelayCommand::Extend2,
            15 => RelayCommand::Extended2,
            other => RelayCommand::Unrecognized(other),
        }
    }
}

impl From<RelayCommand> for u8 {
    fn from(cmd: RelayCommand) -> u8 {
        match cmd {
            RelayCommand::Begin => 1,
            RelayCommand::Data => 2,
            RelayCommand::End => 3,
            RelayCommand::Connected => 4,
            RelayCommand::Sendme => 5,
            RelayCommand::Extend => 6,
            RelayCommand::Extended => 7,
            RelayCommand::Truncate => 8,
            RelayCommand::Truncated => 9,
            RelayCommand::Drop => 10,
            RelayCommand::Resolve => 11,
            RelayCommand::Resolved => 12,
            RelayCommand::BeginDir => 13,
            RelayCommand::Extend2 => 14,
            RelayCommand::Extended2 => 15,
            RelayCommand::Unrecognized(other) => other,
        }
    }
}

/// Reason carried by RELAY_END
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndReason(u8);

impl EndReason {
    pub const MISC: EndReason = EndReason(1);
    pub const CONNECTREFUSED: EndReason = EndReason(3);
    pub const DONE: EndReason = EndReason(6);
    pub const TIMEOUT: EndReason = EndReason(7);
    pub const TORPROTOCOL: EndReason = EndReason(13);

    /// Canonical reason name
    pub fn name(self) -> &'static str {
        match self.0 {
            1 => "MISC",
            2 => "RESOLVEFAILED",
            3 => "CONNECTREFUSED",
            4 => "EXITPOLICY",
            5 => "DESTROY",
            6 => "DONE",
            7 => "TIMEOUT",
            8 => "NOROUTE",
            9 => "HIBERNATING",
            10 => "INTERNAL",
            11 => "RESOURCELIMIT",
            12 => "CONNRESET",
            13 => "TORPROTOCOL",
            14 => "NOTDIRECTORY",
            _ => "UNKNOWN",
        }
    }

    /// Read the reason from an END body (an empty body means MISC)
    pub fn from_body(body: &[u8]) -> Self {
        body.first().map_or(EndReason::MISC, |code| EndReason(*code))
    }
}

impl From<u8> for EndReason {
    fn from(code: u8) -> Self {
        EndReason(code)
    }
}

impl From<EndReason> for u8 {
    fn from(reason: EndReason) -> u8 {
        reason.0
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}

/// A relay cell under construction or freshly recognized
///
/// The buffer is always a full [`PAYLOAD_LEN`] bytes so the running digest is
/// computed over exactly what goes on the wire, padding included.
#[derive(Clone)]
pub struct RelayCell {
    payload: Vec<u8>,
    written: usize,
    hop: HopIndex,
}

impl RelayCell {
    /// Start a relay cell addressed to `hop`, with recognized, digest and
    /// length all zero
    pub fn new(command: RelayCommand, stream_id: u16, hop: HopIndex) -> Self {
        let mut payload = vec![0u8; PAYLOAD_LEN];
        payload[COMMAND] = command.into();
        payload[STREAM_ID].copy_from_slice(&stream_id.to_be_bytes());
        Self {
            payload,
            written: 0,
            hop,
        }
    }

    /// Build a finalized relay cell with the given body
    pub fn with_body(
        command: RelayCommand,
        stream_id: u16,
        hop: HopIndex,
        body: &[u8],
    ) -> Result<Self> {
        if body.len() > RELAY_DATA_LEN {
            return Err(TorError::Internal(format!(
                "Relay body too long: {} > {}",
                body.len(),
                RELAY_DATA_LEN
            )));
        }
        let mut cell = Self::new(command, stream_id, hop);
        cell.put(body);
        cell.finalize();
        Ok(cell)
    }

    /// Wrap a recognized payload that originated at `hop`
    pub fn from_payload(payload: Vec<u8>, hop: HopIndex) -> Result<Self> {
        if payload.len() != PAYLOAD_LEN {
            return Err(TorError::protocol(format!(
                "Relay payload is {} bytes, expected {}",
                payload.len(),
                PAYLOAD_LEN
            )));
        }
        let length = usize::from(u16::from_be_bytes([payload[LENGTH.start], payload[LENGTH.start + 1]]));
        if length > RELAY_DATA_LEN {
            return Err(TorError::protocol(format!(
                "Relay length field {} exceeds {}",
                length, RELAY_DATA_LEN
            )));
        }
        Ok(Self {
            payload,
            written: length,
            hop,
        })
    }

    /// Append data, returning how many bytes fit
    pub fn put(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.remaining());
        let start = RELAY_HEADER_LEN + self.written;
        self.payload[start..start + n].copy_from_slice(&data[..n]);
        self.written += n;
        n
    }

    /// Data bytes still available in this cell
    pub fn remaining(&self) -> usize {
        RELAY_DATA_LEN - self.written
    }

    /// Write the length field from the bytes actually put
    pub fn finalize(&mut self) {
        // written never exceeds RELAY_DATA_LEN, which fits in u16
        let len = self.written as u16;
        self.payload[LENGTH].copy_from_slice(&len.to_be_bytes());
    }

    /// Write the 4-byte digest field
    pub fn embed_digest(&mut self, digest: [u8; 4]) {
        self.payload[DIGEST].copy_from_slice(&digest);
    }

    /// Zero the digest field ahead of computing a forward digest
    pub(crate) fn clear_digest(&mut self) {
        self.payload[DIGEST].fill(0);
    }

    pub fn command(&self) -> RelayCommand {
        RelayCommand::from(self.payload[COMMAND])
    }

    pub fn recognized(&self) -> u16 {
        u16::from_be_bytes([self.payload[RECOGNIZED.start], self.payload[RECOGNIZED.start + 1]])
    }

    pub fn stream_id(&self) -> u16 {
        u16::from_be_bytes([self.payload[STREAM_ID.start], self.payload[STREAM_ID.start + 1]])
    }

    pub fn digest(&self) -> [u8; 4] {
        let mut digest = [0u8; 4];
        digest.copy_from_slice(&self.payload[DIGEST]);
        digest
    }

    /// Value of the length field
    pub fn length(&self) -> usize {
        usize::from(u16::from_be_bytes([self.payload[LENGTH.start], self.payload[LENGTH.start + 1]]))
    }

    /// The data bytes declared by the length field
    pub fn body(&self) -> &[u8] {
        let len = self.length().min(RELAY_DATA_LEN);
        &self.payload[RELAY_HEADER_LEN..RELAY_HEADER_LEN + len]
    }

    /// Hop this cell is addressed to (outbound) or came from (inbound)
    pub fn hop(&self) -> HopIndex {
        self.hop
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

impl fmt::Debug for RelayCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayCell")
            .field("command", &self.command())
            .field("stream_id", &self.stream_id())
            .field("length", &self.length())
            .field("hop", &self.hop)
            .finish()
    }
}

/// Test whether `payload` is addressed to the owner of `running`
///
/// Requires `recognized == 0`, then zeroes the digest field, hashes the full
/// payload into a clone of the running digest and compares the first four
/// bytes with the value read before zeroing. The original digest bytes are
/// always written back. On a match the advanced clone is returned for the
/// caller to commit; `running` itself is never modified.
pub fn digest_matches<D: Digest + Clone>(payload: &mut [u8], running: &D) -> Option<D> {
    if payload.len() != PAYLOAD_LEN || payload[RECOGNIZED] != [0, 0] {
        return None;
    }

    let mut received = [0u8; 4];
    received.copy_from_slice(&payload[DIGEST]);
    payload[DIGEST].fill(0);

    let mut candidate = running.clone();
    candidate.update(&*payload);
    let computed = candidate.clone().finalize();

    payload[DIGEST].copy_from_slice(&received);

    let matched: bool = computed[..4].ct_eq(&received).into();
    matched.then_some(candidate)
}
