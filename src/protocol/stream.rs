//! Streams
//!
//! A stream is a byte channel multiplexed over a circuit and bound to the
//! circuit's last hop at open time. Reads and writes go through
//! `futures::io::{AsyncRead, AsyncWrite}`:
//!
//! - Writes are packed into RELAY_DATA cells of up to 498 bytes, sent when a
//!   cell is full or on flush. Each cell takes one unit from both the stream
//!   window (500, +50 per SENDME) and the hop window (1000, +100 per SENDME);
//!   a writer with no credit parks until a SENDME arrives.
//! - Reads drain inbound DATA cells in order. Every 50 cells consumed, the
//!   stream answers with its own SENDME.

use super::circuit::CircuitCore;
use super::relay_cell::{EndReason, HopIndex, RelayCell, RelayCommand, RELAY_DATA_LEN};
use crate::error::{Result, TorError};
use crate::runtime;
use futures::channel::mpsc;
use futures::io::{AsyncRead, AsyncWrite};
use futures::{ready, StreamExt};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tor_rtcompat::SleepProvider;

/// Where a stream goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTarget {
    /// RELAY_BEGIN to `host:port` through the exit
    Exit { host: String, port: u16 },
    /// RELAY_BEGIN_DIR to the last hop's directory service
    Directory,
}

/// Parse a CONNECTED body: IPv4 | TTL, or 0.0.0.0 | 6 | IPv6 | TTL
///
/// Empty bodies (BEGIN_DIR) and malformed ones yield `None`.
fn parse_connected(body: &[u8]) -> Option<(IpAddr, u32)> {
    let ttl = |b: &[u8]| b.get(..4).map(|t| u32::from_be_bytes([t[0], t[1], t[2], t[3]]));
    let v4: [u8; 4] = body.get(..4)?.try_into().ok()?;
    if v4 != [0, 0, 0, 0] {
        return Some((IpAddr::V4(Ipv4Addr::from(v4)), ttl(&body[4..]).unwrap_or(0)));
    }
    if body.get(4) != Some(&6) {
        return None;
    }
    let v6: [u8; 16] = body.get(5..21)?.try_into().ok()?;
    Some((IpAddr::V6(Ipv6Addr::from(v6)), ttl(&body[21..]).unwrap_or(0)))
}

/// An open stream
pub struct Stream {
    core: Arc<CircuitCore>,
    id: u16,
    hop: HopIndex,
    inbound: mpsc::Receiver<RelayCell>,
    /// Unread part of the current DATA cell
    read_buf: Vec<u8>,
    read_pos: usize,
    /// Bytes not yet packed into a DATA cell
    outbound: Vec<u8>,
    end_received: bool,
    closed: bool,
    connected_addr: Option<(IpAddr, u32)>,
}

impl Stream {
    /// Send BEGIN and wait for CONNECTED, END or the timeout, whichever
    /// comes first
    pub(crate) async fn open<R: SleepProvider>(
        core: Arc<CircuitCore>,
        rt: &R,
        target: StreamTarget,
        timeout: Duration,
        queue_len: usize,
    ) -> Result<Self> {
        let (id, hop, mut inbound) = core.begin_stream(&target, queue_len)?;
        let pending = PendingOpen {
            core: core.clone(),
            id,
            armed: true,
        };

        let waited = runtime::timeout(rt, timeout, inbound.next()).await;
        pending.disarm();
        let reply = match waited {
            Ok(reply) => reply,
            Err(runtime::Elapsed) => {
                log::warn!("Stream {} to {:?} timed out after {:?}", id, target, timeout);
                core.end_stream(id, EndReason::TIMEOUT);
                return Err(TorError::StreamTimeout);
            }
        };

        let cell = match reply {
            Some(cell) => cell,
            None => return Err(core.closed_error()),
        };
        match cell.command() {
            RelayCommand::Connected => {
                let connected_addr = parse_connected(cell.body());
                log::info!("Stream {} opened to {:?}", id, target);
                Ok(Self {
                    core,
                    id,
                    hop,
                    inbound,
                    read_buf: Vec::new(),
                    read_pos: 0,
                    outbound: Vec::with_capacity(RELAY_DATA_LEN),
                    end_received: false,
                    closed: false,
                    connected_addr,
                })
            }
            RelayCommand::End => {
                let reason = EndReason::from_body(cell.body());
                log::info!("Stream {} to {:?} refused: {}", id, target, reason);
                Err(TorError::StreamConnectFailed(reason))
            }
            other => {
                core.end_stream(id, EndReason::TORPROTOCOL);
                Err(TorError::protocol(format!(
                    "unexpected {:?} while opening stream {}",
                    other, id
                )))
            }
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Hop the stream is bound to
    pub fn hop(&self) -> HopIndex {
        self.hop
    }

    /// Address and TTL reported in CONNECTED, if any
    pub fn connected_addr(&self) -> Option<(IpAddr, u32)> {
        self.connected_addr
    }

    /// Whether the far end sent END
    pub fn is_ended(&self) -> bool {
        self.end_received
    }

    /// Send at most one DATA cell from the front of `outbound`
    fn poll_send_chunk(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let len = self.outbound.len().min(RELAY_DATA_LEN);
        ready!(self.core.poll_send_data(cx, self.id, &self.outbound[..len]))?;
        self.outbound.drain(..len);
        Poll::Ready(Ok(()))
    }

    fn ensure_writable(&self) -> io::Result<()> {
        if self.closed {
            return Err(TorError::StreamClosed.into());
        }
        if self.end_received {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream ended by peer"));
        }
        Ok(())
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        loop {
            if this.read_pos < this.read_buf.len() {
                let n = buf.len().min(this.read_buf.len() - this.read_pos);
                buf[..n].copy_from_slice(&this.read_buf[this.read_pos..this.read_pos + n]);
                this.read_pos += n;
                return Poll::Ready(Ok(n));
            }
            if this.end_received {
                return Poll::Ready(Ok(0));
            }

            match ready!(this.inbound.poll_next_unpin(cx)) {
                Some(cell) => match cell.command() {
                    RelayCommand::Data => {
                        this.core.stream_consumed(this.id)?;
                        this.read_buf.clear();
                        this.read_buf.extend_from_slice(cell.body());
                        this.read_pos = 0;
                    }
                    RelayCommand::End => {
                        log::debug!(
                            "Stream {} ended by peer: {}",
                            this.id,
                            EndReason::from_body(cell.body())
                        );
                        this.end_received = true;
                    }
                    other => log::debug!("Stream {}: ignoring {:?}", this.id, other),
                },
                None => {
                    // queue closed without END: circuit gone or stream reset
                    this.end_received = true;
                    let err = if this.closed {
                        TorError::StreamClosed
                    } else {
                        this.core.closed_error()
                    };
                    return Poll::Ready(Err(err.into()));
                }
            }
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        this.ensure_writable()?;
        if this.outbound.len() >= RELAY_DATA_LEN {
            ready!(this.poll_send_chunk(cx))?;
        }
        let n = buf.len().min(RELAY_DATA_LEN - this.outbound.len());
        this.outbound.extend_from_slice(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        while !this.outbound.is_empty() {
            this.ensure_writable()?;
            ready!(this.poll_send_chunk(cx))?;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        if !self.end_received {
            ready!(self.as_mut().poll_flush(cx))?;
        }
        let this = &mut *self;
        this.closed = true;
        this.core.end_stream(this.id, EndReason::DONE);
        Poll::Ready(Ok(()))
    }
}

/// Ends a stream whose opener went away before CONNECTED or END arrived
struct PendingOpen {
    core: Arc<CircuitCore>,
    id: u16,
    armed: bool,
}

impl PendingOpen {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingOpen {
    fn drop(&mut self) {
        if self.armed {
            log::debug!("Stream {}: open abandoned", self.id);
            self.core.end_stream(self.id, EndReason::MISC);
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if !self.closed {
            if !self.outbound.is_empty() {
                log::warn!(
                    "Stream {} dropped with {} unflushed bytes",
                    self.id,
                    self.outbound.len()
                );
            }
            self.core.end_stream(self.id, EndReason::DONE);
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("hop", &self.hop)
            .field("end_received", &self.end_received)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connected_v4() {
        let body = [93, 184, 216, 34, 0, 0, 0x0E, 0x10];
        assert_eq!(
            parse_connected(&body),
            Some((IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)), 3600))
        );
    }

    #[test]
    fn test_parse_connected_v6() {
        let mut body = vec![0, 0, 0, 0, 6];
        body.extend(Ipv6Addr::LOCALHOST.octets());
        body.extend([0, 0, 0, 30]);
        assert_eq!(
            parse_connected(&body),
            Some((IpAddr::V6(Ipv6Addr::LOCALHOST), 30))
        );
    }

    #[test]
    fn test_parse_connected_empty() {
        assert_eq!(parse_connected(&[]), None);
        assert_eq!(parse_connected(&[0, 0, 0, 0, 4]), None);
    }
}
