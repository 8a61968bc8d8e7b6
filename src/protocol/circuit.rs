//! Circuits
//!
//! A circuit is an ordered chain of [`CircuitNode`]s over one
//! [`Connection`]. Its mutable state (nodes, streams, windows) sits behind a
//! single mutex in [`CircuitCore`], shared between the user-facing
//! [`Circuit`], its [`Stream`]s and the connection's reader loop.
//!
//! ## Cell routing
//!
//! - **Outbound** to hop `k`: hop `k` computes the digest, then every hop
//!   from `k` back to `0` adds its keystream layer.
//! - **Inbound**: hops `0..len` peel in order; the first to recognize the
//!   cell owns it. A cell nobody recognizes destroys the circuit.
//!
//! The reader loop never waits here. Everything it hands over goes through
//! `try_send` on bounded channels, and senders waiting for window credit park
//! their wakers on the circuit.

use super::cell::{Cell, CellCommand, DestroyReason, PAYLOAD_LEN};
use super::connection::Connection;
use super::flow_control::{DeliverWindow, SendWindow};
use super::node::CircuitNode;
use super::relay_cell::{EndReason, HopIndex, RelayCell, RelayCommand, RELAY_DATA_LEN};
use super::resolve::{parse_resolved, ResolvedAddress};
use super::router::Router;
use super::stream::{Stream, StreamTarget};
use crate::config::CircuitConfig;
use crate::error::{Result, TorError};
use crate::runtime;
use futures::channel::{mpsc, oneshot};
use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tor_rtcompat::SleepProvider;

/// RELAY_EARLY cells a circuit may send in its lifetime
pub const RELAY_EARLY_BUDGET: u8 = 8;

/// Circuit lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Not yet bound to a connection
    Unconnected,
    /// Handshakes in progress
    Building,
    /// Every hop keyed; streams may be opened
    Open,
    /// Build aborted
    Failed,
    /// Closed after being open (explicit close, DESTROY or link loss)
    Destroyed,
}

/// Replies the builder waits for
#[derive(Debug)]
pub(crate) enum CtrlMsg {
    /// CREATED, CREATED_FAST or CREATED2
    Created(Cell),
    /// EXTENDED, EXTENDED2 or TRUNCATED
    Relay(RelayCell),
}

struct StreamEntry {
    hop: HopIndex,
    package: SendWindow,
    deliver: DeliverWindow,
    tx: mpsc::Sender<RelayCell>,
}

struct CircuitInner {
    state: CircuitState,
    nodes: Vec<CircuitNode>,
    streams: HashMap<u16, StreamEntry>,
    resolves: HashMap<u16, oneshot::Sender<RelayCell>>,
    next_stream_id: u16,
    control_tx: Option<mpsc::Sender<CtrlMsg>>,
    /// Senders parked on window credit
    waiters: Vec<Waker>,
    relay_early_remaining: u8,
    closed_reason: Option<TorError>,
}

impl CircuitInner {
    fn check_open(&self) -> Result<()> {
        if let Some(err) = &self.closed_reason {
            return Err(err.clone());
        }
        if self.state != CircuitState::Open {
            return Err(TorError::InvalidState(format!(
                "circuit is {:?}, not open",
                self.state
            )));
        }
        Ok(())
    }

    fn last_hop(&self) -> Result<HopIndex> {
        self.nodes
            .len()
            .checked_sub(1)
            .ok_or_else(|| TorError::InvalidState("circuit has no hops".into()))
    }

    /// Next free stream id from the wrapping counter (never 0)
    fn allocate_stream_id(&mut self) -> Result<u16> {
        for _ in 0..u16::MAX {
            self.next_stream_id = self.next_stream_id.wrapping_add(1);
            let id = self.next_stream_id;
            if id != 0 && !self.streams.contains_key(&id) && !self.resolves.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(TorError::InvalidState("no free stream ids".into()))
    }

    fn forward_control(&mut self, msg: CtrlMsg) {
        match self.control_tx.as_mut() {
            Some(tx) => {
                if let Err(e) = tx.try_send(msg) {
                    if e.is_full() {
                        log::warn!("Control queue full, dropping {:?}", e.into_inner());
                    } else {
                        log::debug!("No builder listening, dropping {:?}", e.into_inner());
                    }
                }
            }
            None => log::debug!("Dropping late control reply {:?}", msg),
        }
    }

    fn park(&mut self, waker: &Waker) {
        if !self.waiters.iter().any(|w| w.will_wake(waker)) {
            self.waiters.push(waker.clone());
        }
    }

    fn wake_all(&mut self) {
        for waker in self.waiters.drain(..) {
            waker.wake();
        }
    }
}

/// Reason to put in the DESTROY cell we send for `err`
fn destroy_reason(err: &TorError) -> DestroyReason {
    match err {
        TorError::ProtocolViolation(_) | TorError::HandshakeFailed(_) => DestroyReason::PROTOCOL,
        TorError::Timeout(_) => DestroyReason::TIMEOUT,
        TorError::CircuitClosed => DestroyReason::REQUESTED,
        TorError::Internal(_) | TorError::Crypto(_) => DestroyReason::INTERNAL,
        _ => DestroyReason::NONE,
    }
}

/// Shared circuit state
pub struct CircuitCore {
    /// 0 until bound to a connection
    id: AtomicU16,
    conn: Weak<dyn Connection>,
    inner: Mutex<CircuitInner>,
    control_rx: Mutex<Option<mpsc::Receiver<CtrlMsg>>>,
}

impl CircuitCore {
    pub(crate) fn new(conn: Weak<dyn Connection>, control_queue_len: usize) -> Arc<Self> {
        let (control_tx, control_rx) = mpsc::channel(control_queue_len);
        Arc::new(Self {
            id: AtomicU16::new(0),
            conn,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Unconnected,
                nodes: Vec::new(),
                streams: HashMap::new(),
                resolves: HashMap::new(),
                next_stream_id: 0,
                control_tx: Some(control_tx),
                waiters: Vec::new(),
                relay_early_remaining: RELAY_EARLY_BUDGET,
                closed_reason: None,
            }),
            control_rx: Mutex::new(Some(control_rx)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn bind(&self, id: u16) {
        self.id.store(id, Ordering::Release);
    }

    pub fn id(&self) -> u16 {
        self.id.load(Ordering::Acquire)
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub(crate) fn hop_count(&self) -> usize {
        self.lock().nodes.len()
    }

    pub(crate) fn routers(&self) -> Vec<Arc<Router>> {
        self.lock().nodes.iter().map(|n| n.router().clone()).collect()
    }

    pub(crate) fn relay_early_remaining(&self) -> u8 {
        self.lock().relay_early_remaining
    }

    /// Error to report for an operation on a closed circuit
    pub(crate) fn closed_error(&self) -> TorError {
        self.lock()
            .closed_reason
            .clone()
            .unwrap_or(TorError::CircuitClosed)
    }

    /// Enter `Building`; only an unconnected circuit may be built
    pub(crate) fn start_build(&self) -> Result<mpsc::Receiver<CtrlMsg>> {
        {
            let mut inner = self.lock();
            if inner.state != CircuitState::Unconnected {
                return Err(TorError::InvalidState(format!(
                    "cannot build a circuit that is {:?}",
                    inner.state
                )));
            }
            inner.state = CircuitState::Building;
        }
        self.control_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TorError::InvalidState("circuit already built".into()))
    }

    /// Append a keyed hop; returns its index
    pub(crate) fn push_node(&self, node: CircuitNode) -> Result<HopIndex> {
        let mut inner = self.lock();
        if let Some(err) = &inner.closed_reason {
            return Err(err.clone());
        }
        if !node.is_keyed() {
            return Err(TorError::Internal("appending an unkeyed hop".into()));
        }
        inner.nodes.push(node);
        Ok(inner.nodes.len() - 1)
    }

    pub(crate) fn mark_open(&self) -> Result<()> {
        let mut inner = self.lock();
        if let Some(err) = &inner.closed_reason {
            return Err(err.clone());
        }
        inner.state = CircuitState::Open;
        inner.control_tx = None;
        Ok(())
    }

    fn transmit(&self, cell: Cell) -> Result<()> {
        let conn = self
            .conn
            .upgrade()
            .ok_or_else(|| TorError::ConnectionFailed("connection dropped".into()))?;
        conn.send_cell(cell)
    }

    /// Send a cell that bypasses relay crypto (CREATE-class)
    pub(crate) fn send_control_cell(&self, cell: Cell) -> Result<()> {
        if let Some(err) = &self.lock().closed_reason {
            return Err(err.clone());
        }
        self.transmit(cell)
    }

    /// Encrypt and send a relay cell to its hop
    ///
    /// `early` asks for RELAY_EARLY while the budget lasts.
    pub(crate) fn send_relay(&self, cell: RelayCell, early: bool) -> Result<()> {
        let mut inner = self.lock();
        if let Some(err) = &inner.closed_reason {
            return Err(err.clone());
        }
        self.send_relay_locked(&mut inner, cell, early)
    }

    fn send_relay_locked(&self, inner: &mut CircuitInner, mut cell: RelayCell, early: bool) -> Result<()> {
        let hop = cell.hop();
        let target = inner
            .nodes
            .get_mut(hop)
            .ok_or_else(|| TorError::Internal(format!("no hop {} on this circuit", hop)))?;
        target.crypto_mut()?.originate(&mut cell);

        let command = cell.command();
        let mut payload = cell.into_payload();
        let mut next = Some(hop);
        while let Some(index) = next {
            let node = &mut inner.nodes[index];
            node.crypto_mut()?.encrypt_forward(&mut payload);
            next = node.previous();
        }

        let cell_command = if early && inner.relay_early_remaining > 0 {
            inner.relay_early_remaining -= 1;
            CellCommand::RelayEarly
        } else {
            CellCommand::Relay
        };
        log::trace!("Circuit {}: sending {:?} to hop {}", self.id(), command, hop);
        self.transmit(Cell::new(self.id(), cell_command, payload))
    }

    /// Entry point for the connection's reader loop
    pub(crate) fn handle_cell(&self, cell: Cell) {
        match cell.command {
            CellCommand::Relay | CellCommand::RelayEarly => {
                if let Err(e) = self.handle_relay(cell.payload) {
                    log::warn!("Circuit {}: {}", self.id(), e);
                    let reason = destroy_reason(&e);
                    self.shutdown(e, Some(reason));
                }
            }
            CellCommand::Created | CellCommand::CreatedFast | CellCommand::Created2 => {
                self.lock().forward_control(CtrlMsg::Created(cell));
            }
            CellCommand::Destroy => {
                let reason = DestroyReason::from_payload(&cell.payload);
                log::info!("Circuit {} destroyed by relay: {}", self.id(), reason);
                self.shutdown(TorError::CircuitDestroyed { reason }, None);
            }
            CellCommand::Padding | CellCommand::Vpadding => {}
            other => log::debug!("Circuit {}: ignoring {:?} cell", self.id(), other),
        }
    }

    fn handle_relay(&self, mut payload: Vec<u8>) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.closed_reason.is_some() {
            return Ok(());
        }
        if payload.len() != PAYLOAD_LEN {
            return Err(TorError::protocol(format!(
                "relay payload of {} bytes",
                payload.len()
            )));
        }

        let mut origin = None;
        for (index, node) in inner.nodes.iter_mut().enumerate() {
            if node.crypto_mut()?.decrypt_backward(&mut payload) {
                origin = Some(index);
                break;
            }
        }
        let hop = origin.ok_or_else(|| TorError::protocol("relay cell not recognized by any hop"))?;
        let cell = RelayCell::from_payload(payload, hop)?;
        log::trace!("Circuit {}: {:?} from hop {}", self.id(), cell, hop);

        match cell.command() {
            RelayCommand::Extended | RelayCommand::Extended2 | RelayCommand::Truncated => {
                if inner.state == CircuitState::Building {
                    inner.forward_control(CtrlMsg::Relay(cell));
                } else if cell.command() == RelayCommand::Truncated {
                    return Err(TorError::CircuitTruncated {
                        hop,
                        reason: DestroyReason::from_payload(cell.body()),
                    });
                } else {
                    log::debug!("Circuit {}: unexpected {:?}", self.id(), cell.command());
                }
            }
            RelayCommand::Resolved => match inner.resolves.remove(&cell.stream_id()) {
                Some(tx) => {
                    let _ = tx.send(cell);
                }
                None => log::debug!("RESOLVED for unknown request {}", cell.stream_id()),
            },
            RelayCommand::Data => {
                if inner.nodes[hop].deliver_window.on_deliver()? {
                    log::debug!("Circuit {}: hop {} deliver window low, sending SENDME", self.id(), hop);
                    let sendme = RelayCell::new(RelayCommand::Sendme, 0, hop);
                    self.send_relay_locked(inner, sendme, false)?;
                }
                self.deliver_to_stream(inner, cell)?;
            }
            RelayCommand::Connected | RelayCommand::End => self.deliver_to_stream(inner, cell)?,
            RelayCommand::Sendme => {
                let stream_id = cell.stream_id();
                if stream_id == 0 {
                    inner.nodes[hop].package_window.credit()?;
                } else if let Some(entry) = inner.streams.get_mut(&stream_id) {
                    if let Err(e) = entry.package.credit() {
                        log::warn!("Stream {}: ignoring SENDME: {}", stream_id, e);
                    }
                }
                inner.wake_all();
            }
            RelayCommand::Drop => {}
            other => log::debug!("Circuit {}: ignoring relay {:?}", self.id(), other),
        }
        Ok(())
    }

    fn deliver_to_stream(&self, inner: &mut CircuitInner, cell: RelayCell) -> Result<()> {
        let stream_id = cell.stream_id();
        let is_end = cell.command() == RelayCommand::End;
        let Some(entry) = inner.streams.get_mut(&stream_id) else {
            log::debug!("Dropping {:?} for unknown stream {}", cell.command(), stream_id);
            return Ok(());
        };
        if entry.hop != cell.hop() {
            log::warn!(
                "Stream {}: dropping {:?} from hop {}, expected hop {}",
                stream_id,
                cell.command(),
                cell.hop(),
                entry.hop
            );
            return Ok(());
        }

        let hop = entry.hop;
        match entry.tx.try_send(cell) {
            Ok(()) if is_end => {
                inner.streams.remove(&stream_id);
                inner.wake_all();
            }
            Ok(()) => {}
            Err(e) if e.is_full() => {
                log::warn!("Stream {}: peer overran the inbound queue", stream_id);
                inner.streams.remove(&stream_id);
                inner.wake_all();
                let end = RelayCell::with_body(
                    RelayCommand::End,
                    stream_id,
                    hop,
                    &[EndReason::TORPROTOCOL.into()],
                )?;
                self.send_relay_locked(inner, end, false)?;
            }
            Err(_) => {
                // reader side already dropped
                inner.streams.remove(&stream_id);
            }
        }
        Ok(())
    }

    /// Tear the circuit down
    ///
    /// Idempotent. Drops every stream, wakes every parked sender, fails any
    /// pending build and deregisters from the connection. `destroy` sends a
    /// DESTROY with that reason, best-effort.
    pub(crate) fn shutdown(&self, err: TorError, destroy: Option<DestroyReason>) {
        let id = self.id();
        {
            let mut inner = self.lock();
            if inner.closed_reason.is_some() {
                return;
            }
            inner.state = match inner.state {
                CircuitState::Building => CircuitState::Failed,
                _ => CircuitState::Destroyed,
            };
            log::debug!("Circuit {} -> {:?}: {}", id, inner.state, err);
            inner.closed_reason = Some(err);
            inner.streams.clear();
            inner.resolves.clear();
            inner.control_tx = None;
            inner.wake_all();
        }

        if id == 0 {
            return;
        }
        if let Some(reason) = destroy {
            if let Err(e) = self.transmit(Cell::destroy(id, reason)) {
                log::debug!("Circuit {}: DESTROY not sent: {}", id, e);
            }
        }
        if let Some(conn) = self.conn.upgrade() {
            conn.circuits().deregister(id);
        }
    }

    /// Close with a DESTROY whose reason follows from `err`
    pub(crate) fn fail(&self, err: TorError) {
        let reason = destroy_reason(&err);
        self.shutdown(err, Some(reason));
    }

    /// Register a stream on the last hop and send its BEGIN
    pub(crate) fn begin_stream(
        &self,
        target: &StreamTarget,
        queue_len: usize,
    ) -> Result<(u16, HopIndex, mpsc::Receiver<RelayCell>)> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.check_open()?;
        let hop = inner.last_hop()?;
        let id = inner.allocate_stream_id()?;

        let cell = match target {
            StreamTarget::Exit { host, port } => {
                let mut body = if host.parse::<Ipv6Addr>().is_ok() {
                    format!("[{}]:{}", host, port).into_bytes()
                } else {
                    format!("{}:{}", host, port).into_bytes()
                };
                body.push(0);
                RelayCell::with_body(RelayCommand::Begin, id, hop, &body)?
            }
            StreamTarget::Directory => RelayCell::new(RelayCommand::BeginDir, id, hop),
        };

        let (tx, rx) = mpsc::channel(queue_len);
        inner.streams.insert(
            id,
            StreamEntry {
                hop,
                package: SendWindow::stream(),
                deliver: DeliverWindow::stream(),
                tx,
            },
        );
        if let Err(e) = self.send_relay_locked(inner, cell, false) {
            inner.streams.remove(&id);
            return Err(e);
        }
        log::debug!("Circuit {}: stream {} -> {:?}", self.id(), id, target);
        Ok((id, hop, rx))
    }

    /// Detach a stream, sending END unless the peer already ended it
    pub(crate) fn end_stream(&self, stream_id: u16, reason: EndReason) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(entry) = inner.streams.remove(&stream_id) else {
            return;
        };
        inner.wake_all();
        if inner.closed_reason.is_some() {
            return;
        }
        let sent = RelayCell::with_body(RelayCommand::End, stream_id, entry.hop, &[reason.into()])
            .and_then(|end| self.send_relay_locked(inner, end, false));
        if let Err(e) = sent {
            log::debug!("Stream {}: END not sent: {}", stream_id, e);
        }
    }

    /// The application consumed one DATA cell from `stream_id`
    pub(crate) fn stream_consumed(&self, stream_id: u16) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let Some(entry) = inner.streams.get_mut(&stream_id) else {
            return Ok(());
        };
        let hop = entry.hop;
        match entry.deliver.on_deliver() {
            Ok(false) => Ok(()),
            Ok(true) => {
                log::debug!("Stream {}: sending SENDME", stream_id);
                self.send_relay_locked(inner, RelayCell::new(RelayCommand::Sendme, stream_id, hop), false)
            }
            Err(e) => {
                inner.streams.remove(&stream_id);
                let end = RelayCell::with_body(
                    RelayCommand::End,
                    stream_id,
                    hop,
                    &[EndReason::TORPROTOCOL.into()],
                )?;
                self.send_relay_locked(inner, end, false)?;
                Err(e)
            }
        }
    }

    /// Send one DATA cell once both the stream and hop windows allow it
    ///
    /// Returning `Pending` leaves both windows untouched, so dropping the
    /// waiting future is always safe.
    pub(crate) fn poll_send_data(
        &self,
        cx: &mut Context<'_>,
        stream_id: u16,
        data: &[u8],
    ) -> Poll<Result<()>> {
        if data.len() > RELAY_DATA_LEN {
            return Poll::Ready(Err(TorError::Internal("DATA chunk too large".into())));
        }
        let mut guard = self.lock();
        let inner = &mut *guard;
        if let Some(err) = &inner.closed_reason {
            return Poll::Ready(Err(err.clone()));
        }
        let Some(entry) = inner.streams.get_mut(&stream_id) else {
            return Poll::Ready(Err(TorError::StreamClosed));
        };
        let hop = entry.hop;
        let Some(node) = inner.nodes.get_mut(hop) else {
            return Poll::Ready(Err(TorError::Internal(format!("stream on missing hop {}", hop))));
        };

        if !entry.package.can_send() || !node.package_window.can_send() {
            log::trace!(
                "Stream {} blocked: stream window {}, hop window {}",
                stream_id,
                entry.package.window(),
                node.package_window.window()
            );
            inner.park(cx.waker());
            return Poll::Pending;
        }
        entry.package.take();
        node.package_window.take();

        let cell = match RelayCell::with_body(RelayCommand::Data, stream_id, hop, data) {
            Ok(cell) => cell,
            Err(e) => return Poll::Ready(Err(e)),
        };
        Poll::Ready(self.send_relay_locked(inner, cell, false))
    }

    pub(crate) fn begin_resolve(&self, hostname: &str) -> Result<(u16, oneshot::Receiver<RelayCell>)> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.check_open()?;
        let hop = inner.last_hop()?;
        let id = inner.allocate_stream_id()?;

        let mut body = hostname.as_bytes().to_vec();
        body.push(0);
        let cell = RelayCell::with_body(RelayCommand::Resolve, id, hop, &body)?;

        let (tx, rx) = oneshot::channel();
        inner.resolves.insert(id, tx);
        if let Err(e) = self.send_relay_locked(inner, cell, false) {
            inner.resolves.remove(&id);
            return Err(e);
        }
        Ok((id, rx))
    }

    pub(crate) fn cancel_resolve(&self, id: u16) {
        self.lock().resolves.remove(&id);
    }
}

/// A circuit over one connection
///
/// Dropping a circuit closes it, and with it every stream it carries.
pub struct Circuit<R: SleepProvider> {
    pub(crate) core: Arc<CircuitCore>,
    pub(crate) conn: Arc<dyn Connection>,
    pub(crate) runtime: R,
    pub(crate) config: CircuitConfig,
}

impl<R: SleepProvider> Circuit<R> {
    /// Create an unconnected circuit on `conn`
    pub fn new(conn: Arc<dyn Connection>, runtime: R, config: CircuitConfig) -> Self {
        let core = CircuitCore::new(Arc::downgrade(&conn), config.control_queue_len);
        Self {
            core,
            conn,
            runtime,
            config,
        }
    }

    /// Circuit id, once bound to the connection
    pub fn id(&self) -> Option<u16> {
        match self.core.id() {
            0 => None,
            id => Some(id),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.core.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn hop_count(&self) -> usize {
        self.core.hop_count()
    }

    /// Routers of the established hops, in path order
    pub fn routers(&self) -> Vec<Arc<Router>> {
        self.core.routers()
    }

    pub fn relay_early_remaining(&self) -> u8 {
        self.core.relay_early_remaining()
    }

    /// Why the circuit closed, if it has
    pub fn closed_reason(&self) -> Option<TorError> {
        match self.state() {
            CircuitState::Failed | CircuitState::Destroyed => Some(self.core.closed_error()),
            _ => None,
        }
    }

    /// Open a stream through the last hop
    ///
    /// The first of CONNECTED, END or `timeout` decides the outcome. A
    /// failed open leaves the circuit and its other streams untouched.
    pub async fn open_stream(&self, target: StreamTarget, timeout: Duration) -> Result<Stream> {
        Stream::open(
            self.core.clone(),
            &self.runtime,
            target,
            timeout,
            self.config.stream_queue_len,
        )
        .await
    }

    /// Open an exit stream to `host:port` with the configured timeout
    pub async fn connect(&self, host: &str, port: u16) -> Result<Stream> {
        let target = StreamTarget::Exit {
            host: host.to_string(),
            port,
        };
        self.open_stream(target, self.config.stream_timeout).await
    }

    /// Open a BEGIN_DIR stream to the last hop's directory service
    pub async fn begin_dir(&self) -> Result<Stream> {
        self.open_stream(StreamTarget::Directory, self.config.stream_timeout)
            .await
    }

    /// Ask the exit to resolve `hostname`
    pub async fn resolve(&self, hostname: &str, timeout: Duration) -> Result<Vec<ResolvedAddress>> {
        let (id, reply) = self.core.begin_resolve(hostname)?;
        // forgets the request if this future is dropped before an answer
        let _pending = PendingResolve {
            core: &self.core,
            id,
        };
        match runtime::timeout(&self.runtime, timeout, reply).await {
            Ok(Ok(cell)) => parse_resolved(cell.body()),
            Ok(Err(_canceled)) => Err(self.core.closed_error()),
            Err(runtime::Elapsed) => Err(TorError::Timeout(format!("resolving {}", hostname))),
        }
    }

    /// Send DESTROY and tear the circuit down
    pub fn close(&self) {
        log::info!("Closing circuit {:?}", self.id());
        self.core.shutdown(TorError::CircuitClosed, Some(DestroyReason::REQUESTED));
    }
}

struct PendingResolve<'a> {
    core: &'a CircuitCore,
    id: u16,
}

impl Drop for PendingResolve<'_> {
    fn drop(&mut self) {
        self.core.cancel_resolve(self.id);
    }
}

impl<R: SleepProvider> Drop for Circuit<R> {
    fn drop(&mut self) {
        self.core
            .shutdown(TorError::CircuitClosed, Some(DestroyReason::REQUESTED));
    }
}

impl<R: SleepProvider> std::fmt::Debug for Circuit<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("hops", &self.hop_count())
            .finish()
    }
}
