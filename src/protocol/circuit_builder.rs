//! Circuit construction
//!
//! Builds a circuit hop by hop over an existing [`Connection`]:
//!
//! 1. Bind to the connection, which allocates the circuit id
//! 2. First hop: CREATE_FAST, CREATE (TAP) or CREATE2 (ntor), then wait for
//!    the matching CREATED-class cell
//! 3. Each further hop: EXTEND (TAP) or EXTEND2 (ntor) in a RELAY_EARLY cell
//!    to the current last hop, then wait for EXTENDED/EXTENDED2 or TRUNCATED
//! 4. Every hop keyed → `Open`
//!
//! All waits share one deadline. Any failure aborts the whole build: the
//! circuit goes to `Failed`, a DESTROY is sent and the circuit leaves the
//! connection's table. Retrying with a different path is the caller's call.

use super::cell::{parse_created2_body, Cell, CellCommand, DestroyReason};
use super::circuit::{Circuit, CtrlMsg};
use super::connection::Connection;
use super::handshake::ntor::NTOR_HTYPE;
use super::handshake::tap::TAP_S_HANDSHAKE_LEN;
use super::handshake::HandshakeKind;
use super::node::CircuitNode;
use super::relay_cell::{HopIndex, RelayCell, RelayCommand};
use super::router::{CircuitPurpose, PathChooser, Router};
use crate::config::CircuitConfig;
use crate::error::{Result, TorError};
use crate::runtime::{Deadline, Elapsed};
use futures::channel::mpsc;
use futures::StreamExt;
use rand::rngs::OsRng;
use std::net::IpAddr;
use std::sync::Arc;
use tor_rtcompat::SleepProvider;

/// Link specifier types used in EXTEND2
const LS_IPV4: u8 = 0x00;
const LS_IPV6: u8 = 0x01;
const LS_LEGACY_ID: u8 = 0x02;

/// Build progress callbacks
///
/// Every method has a no-op default.
pub trait CircuitBuildHandler: Send + Sync {
    /// The circuit is bound to its connection under `circuit_id`
    fn connection_completed(&self, _circuit_id: u16) {}

    /// Hop `index` finished its handshake
    fn node_added(&self, _router: &Router, _index: HopIndex) {}

    fn build_completed(&self) {}

    fn build_failed(&self, _error: &TorError) {}
}

/// A handler that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

impl CircuitBuildHandler for NoopHandler {}

/// Builds circuits with a shared runtime and configuration
#[derive(Clone)]
pub struct CircuitBuilder<R: SleepProvider> {
    runtime: R,
    config: CircuitConfig,
}

impl<R: SleepProvider> CircuitBuilder<R> {
    pub fn new(runtime: R, config: CircuitConfig) -> Self {
        Self { runtime, config }
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// An unconnected circuit on `conn`, to be built later
    pub fn circuit(&self, conn: Arc<dyn Connection>) -> Circuit<R> {
        Circuit::new(conn, self.runtime.clone(), self.config.clone())
    }

    /// Build a circuit through `path`
    pub async fn build_circuit(
        &self,
        conn: Arc<dyn Connection>,
        path: &[Arc<Router>],
        handler: &dyn CircuitBuildHandler,
    ) -> Result<Circuit<R>> {
        let circuit = self.circuit(conn);
        circuit.build(path, handler).await?;
        Ok(circuit)
    }

    /// Ask `chooser` for a path for `purpose`, then build it
    pub async fn build_with(
        &self,
        conn: Arc<dyn Connection>,
        chooser: &dyn PathChooser,
        purpose: CircuitPurpose,
        handler: &dyn CircuitBuildHandler,
    ) -> Result<Circuit<R>> {
        let path = chooser.choose_path(purpose)?;
        log::debug!("Path for {:?}: {} hops", purpose, path.len());
        self.build_circuit(conn, &path, handler).await
    }
}

impl<R: SleepProvider> Circuit<R> {
    /// Run the build protocol through `path`
    ///
    /// Reports progress to `handler`; exactly one of `build_completed` and
    /// `build_failed` fires at the end.
    ///
    /// A circuit that is not `Unconnected` is refused with `InvalidState`
    /// and left as it was.
    pub async fn build(&self, path: &[Arc<Router>], handler: &dyn CircuitBuildHandler) -> Result<()> {
        let control = self.core.start_build()?;
        let outcome = self.run_build(path, control, handler).await;
        match outcome {
            Ok(()) => {
                log::info!(
                    "✅ Circuit {:?} open with {} hops",
                    self.id(),
                    self.hop_count()
                );
                handler.build_completed();
                Ok(())
            }
            Err(e) => {
                log::warn!("❌ Circuit {:?} build failed: {}", self.id(), e);
                self.core.fail(e.clone());
                handler.build_failed(&e);
                Err(e)
            }
        }
    }

    async fn run_build(
        &self,
        path: &[Arc<Router>],
        mut control: mpsc::Receiver<CtrlMsg>,
        handler: &dyn CircuitBuildHandler,
    ) -> Result<()> {
        if path.is_empty() {
            return Err(TorError::InvalidRelay("empty path".into()));
        }
        let deadline = Deadline::after(&self.runtime, self.config.build_timeout);

        let id = self.conn.circuits().register(self.core.clone())?;
        log::info!("🔨 Building circuit {} through {} hops", id, path.len());
        handler.connection_completed(id);

        for (index, router) in path.iter().enumerate() {
            let kind = self.choose_handshake(index, router)?;
            let mut node = CircuitNode::new(router.clone(), index.checked_sub(1));
            let onionskin = node.begin_handshake(kind, &mut OsRng)?;

            let reply = if index == 0 {
                log::debug!("  Creating hop 0 ({}) with {:?}", router.nickname, kind);
                self.core.send_control_cell(create_cell(id, kind, onionskin)?)?;
                self.await_created(kind, &mut control, &deadline).await?
            } else {
                log::info!("  📡 Extending circuit {} to {} with {:?}", id, router.nickname, kind);
                let extend = extend_cell(index - 1, kind, router, &onionskin)?;
                self.core.send_relay(extend, true)?;
                self.await_extended(index, kind, &mut control, &deadline).await?
            };

            node.complete_handshake(&reply)?;
            self.core.push_node(node)?;
            handler.node_added(router, index);
        }

        self.core.mark_open()
    }

    /// Handshake for hop `index`
    fn choose_handshake(&self, index: HopIndex, router: &Router) -> Result<HandshakeKind> {
        if index == 0 && self.config.use_create_fast {
            return Ok(HandshakeKind::Fast);
        }
        router
            .preferred_handshake(self.config.prefer_ntor)
            .ok_or_else(|| TorError::InvalidRelay(format!("{} has no onion key", router.nickname)))
    }

    async fn next_control(
        &self,
        control: &mut mpsc::Receiver<CtrlMsg>,
        deadline: &Deadline,
        waiting_for: &str,
    ) -> Result<CtrlMsg> {
        match deadline.run(&self.runtime, control.next()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(self.core.closed_error()),
            Err(Elapsed) => Err(TorError::Timeout(format!("waiting for {}", waiting_for))),
        }
    }

    async fn await_created(
        &self,
        kind: HandshakeKind,
        control: &mut mpsc::Receiver<CtrlMsg>,
        deadline: &Deadline,
    ) -> Result<Vec<u8>> {
        let expected = match kind {
            HandshakeKind::Fast => CellCommand::CreatedFast,
            HandshakeKind::Tap => CellCommand::Created,
            HandshakeKind::Ntor => CellCommand::Created2,
        };
        let msg = self
            .next_control(control, deadline, &format!("{:?}", expected))
            .await?;
        let cell = match msg {
            CtrlMsg::Created(cell) if cell.command == expected => cell,
            other => {
                return Err(TorError::protocol(format!(
                    "expected {:?}, got {:?}",
                    expected, other
                )))
            }
        };
        match kind {
            HandshakeKind::Ntor => Ok(parse_created2_body(&cell.payload)?.to_vec()),
            // fixed-size replies sit at the front of the padded payload
            HandshakeKind::Fast | HandshakeKind::Tap => Ok(cell.payload),
        }
    }

    async fn await_extended(
        &self,
        index: HopIndex,
        kind: HandshakeKind,
        control: &mut mpsc::Receiver<CtrlMsg>,
        deadline: &Deadline,
    ) -> Result<Vec<u8>> {
        let msg = self
            .next_control(control, deadline, &format!("EXTENDED for hop {}", index))
            .await?;
        let cell = match msg {
            CtrlMsg::Relay(cell) => cell,
            other => return Err(TorError::protocol(format!("expected EXTENDED, got {:?}", other))),
        };
        let from = index - 1;
        if cell.hop() != from {
            return Err(TorError::protocol(format!(
                "{:?} from hop {}, expected hop {}",
                cell.command(),
                cell.hop(),
                from
            )));
        }

        match (cell.command(), kind) {
            (RelayCommand::Extended2, HandshakeKind::Ntor) => {
                Ok(parse_created2_body(cell.body())?.to_vec())
            }
            (RelayCommand::Extended, HandshakeKind::Tap) => {
                if cell.body().len() < TAP_S_HANDSHAKE_LEN {
                    return Err(TorError::protocol("EXTENDED body too short"));
                }
                Ok(cell.body().to_vec())
            }
            (RelayCommand::Truncated, _) => {
                let reason = cell
                    .body()
                    .first()
                    .copied()
                    .map(Into::into)
                    .unwrap_or(DestroyReason::NONE);
                if reason == DestroyReason::PROTOCOL {
                    Err(TorError::protocol(format!(
                        "hop {} reported a protocol violation while extending",
                        from
                    )))
                } else {
                    Err(TorError::CircuitTruncated { hop: from, reason })
                }
            }
            (other, _) => Err(TorError::protocol(format!(
                "unexpected {:?} while extending with {:?}",
                other, kind
            ))),
        }
    }
}

/// CREATE-class cell for the first hop
fn create_cell(circuit_id: u16, kind: HandshakeKind, onionskin: Vec<u8>) -> Result<Cell> {
    match kind {
        HandshakeKind::Fast => Ok(Cell::new(circuit_id, CellCommand::CreateFast, onionskin)),
        HandshakeKind::Tap => Ok(Cell::new(circuit_id, CellCommand::Create, onionskin)),
        HandshakeKind::Ntor => Cell::create2(circuit_id, NTOR_HTYPE, &onionskin),
    }
}

/// EXTEND or EXTEND2 addressed to hop `via`
fn extend_cell(via: HopIndex, kind: HandshakeKind, router: &Router, onionskin: &[u8]) -> Result<RelayCell> {
    match kind {
        HandshakeKind::Ntor => {
            RelayCell::with_body(RelayCommand::Extend2, 0, via, &extend2_body(router, onionskin)?)
        }
        HandshakeKind::Tap => RelayCell::with_body(RelayCommand::Extend, 0, via, &extend_body(router, onionskin)?),
        HandshakeKind::Fast => Err(TorError::Internal(
            "CREATE_FAST cannot extend a circuit".into(),
        )),
    }
}

/// Legacy EXTEND: IPv4 | port | onion skin | identity
fn extend_body(router: &Router, onionskin: &[u8]) -> Result<Vec<u8>> {
    let IpAddr::V4(addr) = router.address else {
        return Err(TorError::InvalidRelay(format!(
            "{} has no IPv4 address for EXTEND",
            router.nickname
        )));
    };
    let mut body = Vec::with_capacity(6 + onionskin.len() + 20);
    body.extend_from_slice(&addr.octets());
    body.extend_from_slice(&router.or_port.to_be_bytes());
    body.extend_from_slice(onionskin);
    body.extend_from_slice(&router.identity);
    Ok(body)
}

/// EXTEND2: NSPEC | link specifiers | HTYPE | HLEN | HDATA
fn extend2_body(router: &Router, onionskin: &[u8]) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(64 + onionskin.len());
    body.push(2); // NSPEC

    match router.address {
        IpAddr::V4(addr) => {
            body.push(LS_IPV4);
            body.push(6);
            body.extend_from_slice(&addr.octets());
        }
        IpAddr::V6(addr) => {
            body.push(LS_IPV6);
            body.push(18);
            body.extend_from_slice(&addr.octets());
        }
    }
    body.extend_from_slice(&router.or_port.to_be_bytes());

    body.push(LS_LEGACY_ID);
    body.push(20);
    body.extend_from_slice(&router.identity);

    let hlen = u16::try_from(onionskin.len())
        .map_err(|_| TorError::Internal("EXTEND2 handshake too long".into()))?;
    body.extend_from_slice(&NTOR_HTYPE.to_be_bytes());
    body.extend_from_slice(&hlen.to_be_bytes());
    body.extend_from_slice(onionskin);
    Ok(body)
}
