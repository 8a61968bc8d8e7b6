//! Cell framing
//!
//! Cells are the basic unit exchanged over a link. Most are fixed-size
//! (512 bytes with 2-byte circuit ids); VERSIONS and every command >= 128
//! use the variable-length encoding with an explicit length prefix.

use crate::error::{Result, TorError};
use std::fmt;

/// Circuit id width on the wire
pub const CIRC_ID_LEN: usize = 2;

/// Payload size for fixed-length cells
pub const PAYLOAD_LEN: usize = 509;

/// Total size of a fixed-length cell
pub const CELL_LEN: usize = CIRC_ID_LEN + 1 + PAYLOAD_LEN;

/// Header size of a variable-length cell (circ id, command, length)
pub const VAR_HEADER_LEN: usize = CIRC_ID_LEN + 1 + 2;

/// Cell command types
///
/// Unknown command bytes are kept as [`CellCommand::Unrecognized`] so that a
/// structurally valid cell with a command we do not speak can be ignored
/// instead of tearing down the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellCommand {
    /// PADDING - link padding
    Padding,
    /// CREATE - TAP circuit creation
    Create,
    /// CREATED - TAP circuit created
    Created,
    /// RELAY - relay cell
    Relay,
    /// DESTROY - destroy a circuit
    Destroy,
    /// CREATE_FAST - first-hop creation without public-key crypto
    CreateFast,
    /// CREATED_FAST
    CreatedFast,
    /// VERSIONS - negotiate versions (variable-length)
    Versions,
    /// NETINFO - network info exchange
    Netinfo,
    /// RELAY_EARLY - relay cell counted against the early budget
    RelayEarly,
    /// CREATE2 - extensible circuit creation
    Create2,
    /// CREATED2
    Created2,
    /// PADDING_NEGOTIATE
    PaddingNegotiate,
    /// VPADDING - variable-length padding
    Vpadding,
    /// CERTS
    Certs,
    /// AUTH_CHALLENGE
    AuthChallenge,
    /// AUTHENTICATE
    Authenticate,
    /// AUTHORIZE
    Authorize,
    /// Any command byte without a known meaning
    Unrecognized(u8),
}

impl From<u8> for CellCommand {
    fn from(cmd: u8) -> Self {
        match cmd {
            0 => CellCommand::Padding,
            1 => CellCommand::Create,
            2 => CellCommand::Created,
            3 => CellCommand::Relay,
            4 => CellCommand::Destroy,
            5 => CellCommand::CreateFast,
            6 => CellCommand::CreatedFast,
            7 => CellCommand::Versions,
            8 => CellCommand::Netinfo,
            9 => CellCommand::RelayEarly,
            10 => CellCommand::Create2,
            11 => CellCommand::Created2,
            12 => CellCommand::PaddingNegotiate,
            128 => CellCommand::Vpadding,
            129 => CellCommand::Certs,
            130 => CellCommand::AuthChallenge,
            131 => CellCommand::Authenticate,
            132 => CellCommand::Authorize,
            other => CellCommand::Unrecognized(other),
        }
    }
}

impl From<CellCommand> for u8 {
    fn from(cmd: CellCommand) -> u8 {
        match cmd {
            CellCommand::Padding => 0,
            CellCommand::Create => 1,
            CellCommand::Created => 2,
            CellCommand::Relay => 3,
            CellCommand::Destroy => 4,
            CellCommand::CreateFast => 5,
            CellCommand::CreatedFast => 6,
            CellCommand::Versions => 7,
            CellCommand::Netinfo => 8,
            CellCommand::RelayEarly => 9,
            CellCommand::Create2 => 10,
            CellCommand::Created2 => 11,
            CellCommand::PaddingNegotiate => 12,
            CellCommand::Vpadding => 128,
            CellCommand::Certs => 129,
            CellCommand::AuthChallenge => 130,
            CellCommand::Authenticate => 131,
            CellCommand::Authorize => 132,
            CellCommand::Unrecognized(other) => other,
        }
    }
}

impl CellCommand {
    /// Whether cells with this command use the length-prefixed encoding
    pub fn is_variable_length(self) -> bool {
        let code = u8::from(self);
        code == 7 || code >= 128
    }

    /// Whether this is one of the CREATED-class responses
    pub fn is_created(self) -> bool {
        matches!(
            self,
            CellCommand::Created | CellCommand::CreatedFast | CellCommand::Created2
        )
    }
}

/// Reason carried by DESTROY and RELAY_TRUNCATED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DestroyReason(u8);

impl DestroyReason {
    pub const NONE: DestroyReason = DestroyReason(0);
    pub const PROTOCOL: DestroyReason = DestroyReason(1);
    pub const INTERNAL: DestroyReason = DestroyReason(2);
    pub const REQUESTED: DestroyReason = DestroyReason(3);
    pub const FINISHED: DestroyReason = DestroyReason(9);
    pub const TIMEOUT: DestroyReason = DestroyReason(10);

    /// Canonical reason name
    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "NONE",
            1 => "PROTOCOL",
            2 => "INTERNAL",
            3 => "REQUESTED",
            4 => "HIBERNATING",
            5 => "RESOURCELIMIT",
            6 => "CONNECTFAILED",
            7 => "OR_IDENTITY",
            8 => "CHANNEL_CLOSED",
            9 => "FINISHED",
            10 => "TIMEOUT",
            11 => "DESTROYED",
            12 => "NOSUCHSERVICE",
            _ => "UNKNOWN",
        }
    }

    /// Read the reason from the first payload byte (missing byte means NONE)
    pub fn from_payload(payload: &[u8]) -> Self {
        DestroyReason(payload.first().copied().unwrap_or(0))
    }
}

impl From<u8> for DestroyReason {
    fn from(code: u8) -> Self {
        DestroyReason(code)
    }
}

impl From<DestroyReason> for u8 {
    fn from(reason: DestroyReason) -> u8 {
        reason.0
    }
}

impl fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.name())
    }
}

/// A single link cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Circuit ID (2 bytes on the wire)
    pub circuit_id: u16,

    /// Command
    pub command: CellCommand,

    /// Payload (exactly 509 bytes for fixed-length cells)
    pub payload: Vec<u8>,
}

impl Cell {
    /// Create a new cell
    ///
    /// Fixed-length payloads shorter than [`PAYLOAD_LEN`] are zero-padded.
    pub fn new(circuit_id: u16, command: CellCommand, mut payload: Vec<u8>) -> Self {
        if !command.is_variable_length() && payload.len() < PAYLOAD_LEN {
            payload.resize(PAYLOAD_LEN, 0);
        }
        Self {
            circuit_id,
            command,
            payload,
        }
    }

    /// Create a DESTROY cell
    pub fn destroy(circuit_id: u16, reason: DestroyReason) -> Self {
        Self::new(circuit_id, CellCommand::Destroy, vec![reason.into()])
    }

    /// Create a CREATE2 cell: HTYPE | HLEN | HDATA
    pub fn create2(circuit_id: u16, htype: u16, hdata: &[u8]) -> Result<Self> {
        let hlen = u16::try_from(hdata.len())
            .ok()
            .filter(|len| usize::from(*len) + 4 <= PAYLOAD_LEN)
            .ok_or_else(|| TorError::Internal("CREATE2 handshake too long".into()))?;
        let mut payload = Vec::with_capacity(PAYLOAD_LEN);
        payload.extend_from_slice(&htype.to_be_bytes());
        payload.extend_from_slice(&hlen.to_be_bytes());
        payload.extend_from_slice(hdata);
        Ok(Self::new(circuit_id, CellCommand::Create2, payload))
    }

    /// Serialize cell to bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf;
        if self.command.is_variable_length() {
            let len = u16::try_from(self.payload.len()).map_err(|_| {
                TorError::Internal(format!(
                    "Variable cell payload too long: {}",
                    self.payload.len()
                ))
            })?;
            buf = Vec::with_capacity(VAR_HEADER_LEN + self.payload.len());
            buf.extend_from_slice(&self.circuit_id.to_be_bytes());
            buf.push(self.command.into());
            buf.extend_from_slice(&len.to_be_bytes());
            buf.extend_from_slice(&self.payload);
        } else {
            if self.payload.len() > PAYLOAD_LEN {
                return Err(TorError::Internal(format!(
                    "Cell payload too long: {} > {}",
                    self.payload.len(),
                    PAYLOAD_LEN
                )));
            }
            buf = Vec::with_capacity(CELL_LEN);
            buf.extend_from_slice(&self.circuit_id.to_be_bytes());
            buf.push(self.command.into());
            buf.extend_from_slice(&self.payload);
            buf.resize(CELL_LEN, 0);
        }
        Ok(buf)
    }

    /// Parse exactly one cell from `data`
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (cell, used) = Self::decode_prefix(data)?;
        if used != data.len() {
            return Err(TorError::protocol(format!(
                "{} trailing bytes after cell",
                data.len() - used
            )));
        }
        Ok(cell)
    }

    /// Parse one cell from the front of `data`, returning it and the number
    /// of bytes it occupied
    pub fn decode_prefix(data: &[u8]) -> Result<(Self, usize)> {
        let header = data
            .get(..CIRC_ID_LEN + 1)
            .ok_or_else(|| TorError::protocol("Truncated cell header"))?;
        let circuit_id = u16::from_be_bytes([header[0], header[1]]);
        let command = CellCommand::from(header[2]);

        let total = Self::wire_len(command, data)
            .ok_or_else(|| TorError::protocol("Truncated variable cell header"))?;
        if data.len() < total {
            return Err(TorError::protocol(format!(
                "Truncated cell: need {} bytes, have {}",
                total,
                data.len()
            )));
        }

        let body_start = if command.is_variable_length() {
            VAR_HEADER_LEN
        } else {
            CIRC_ID_LEN + 1
        };
        let payload = data[body_start..total].to_vec();
        Ok((
            Self {
                circuit_id,
                command,
                payload,
            },
            total,
        ))
    }

    /// Total wire length of the cell starting at `header`, if enough of the
    /// header is present to tell
    pub fn wire_len(command: CellCommand, header: &[u8]) -> Option<usize> {
        if !command.is_variable_length() {
            return Some(CELL_LEN);
        }
        header
            .get(CIRC_ID_LEN + 1..VAR_HEADER_LEN)
            .map(|len| VAR_HEADER_LEN + usize::from(u16::from_be_bytes([len[0], len[1]])))
    }
}

/// Extract HDATA from a CREATED2 payload or RELAY_EXTENDED2 body: HLEN | HDATA
pub fn parse_created2_body(body: &[u8]) -> Result<&[u8]> {
    if body.len() < 2 {
        return Err(TorError::protocol("CREATED2 body too short"));
    }
    let hlen = usize::from(u16::from_be_bytes([body[0], body[1]]));
    body.get(2..2 + hlen)
        .ok_or_else(|| TorError::protocol(format!("CREATED2 HLEN {} exceeds body", hlen)))
}
