//! RELAY_RESOLVED answers
//!
//! ```text
//! answer = type:u8 | len:u8 | value[len] | ttl:u32
//! ```

use crate::error::{Result, TorError};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const TYPE_HOSTNAME: u8 = 0x00;
const TYPE_IPV4: u8 = 0x04;
const TYPE_IPV6: u8 = 0x06;
const TYPE_ERROR_TRANSIENT: u8 = 0xF0;
const TYPE_ERROR_NONTRANSIENT: u8 = 0xF1;

/// One answer from an exit's resolver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAddress {
    Ip { addr: IpAddr, ttl: u32 },
    Hostname { name: String, ttl: u32 },
    /// Resolution failed; asking again later may work
    TransientError { ttl: u32 },
    /// Resolution failed for good
    NontransientError { ttl: u32 },
}

/// Parse a RESOLVED body into its answers
///
/// Answer types we don't know are skipped.
pub fn parse_resolved(mut body: &[u8]) -> Result<Vec<ResolvedAddress>> {
    let mut answers = Vec::new();
    while !body.is_empty() {
        if body.len() < 2 {
            return Err(TorError::protocol("RESOLVED answer header truncated"));
        }
        let (kind, len) = (body[0], usize::from(body[1]));
        let rest = &body[2..];
        if rest.len() < len + 4 {
            return Err(TorError::protocol(format!(
                "RESOLVED answer of type {:#04x} truncated",
                kind
            )));
        }
        let value = &rest[..len];
        let ttl = u32::from_be_bytes([rest[len], rest[len + 1], rest[len + 2], rest[len + 3]]);
        body = &rest[len + 4..];

        let answer = match kind {
            TYPE_IPV4 => {
                let octets: [u8; 4] = value
                    .try_into()
                    .map_err(|_| TorError::protocol("RESOLVED IPv4 answer is not 4 bytes"))?;
                ResolvedAddress::Ip {
                    addr: IpAddr::V4(Ipv4Addr::from(octets)),
                    ttl,
                }
            }
            TYPE_IPV6 => {
                let octets: [u8; 16] = value
                    .try_into()
                    .map_err(|_| TorError::protocol("RESOLVED IPv6 answer is not 16 bytes"))?;
                ResolvedAddress::Ip {
                    addr: IpAddr::V6(Ipv6Addr::from(octets)),
                    ttl,
                }
            }
            TYPE_HOSTNAME => ResolvedAddress::Hostname {
                name: String::from_utf8_lossy(value).into_owned(),
                ttl,
            },
            TYPE_ERROR_TRANSIENT => ResolvedAddress::TransientError { ttl },
            TYPE_ERROR_NONTRANSIENT => ResolvedAddress::NontransientError { ttl },
            other => {
                log::debug!("Skipping RESOLVED answer of unknown type {:#04x}", other);
                continue;
            }
        };
        answers.push(answer);
    }
    Ok(answers)
}
