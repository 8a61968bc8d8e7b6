//! In-memory link that plays every relay on a path
//!
//! `MockLink` implements [`Connection`]: cells the client sends are handled
//! synchronously by a relay simulator, and the simulator's answers are
//! pushed through a byte channel into the crate's own `run_reader` loop on a
//! helper thread, exactly as a real link would deliver them.

#![allow(dead_code)]

use futures::channel::mpsc;
use futures::executor::block_on;
use futures::{StreamExt, TryStreamExt};
use onion_dataplane::protocol::handshake::{fast, ntor, tap};
use onion_dataplane::protocol::{
    run_reader, Cell, CellCommand, CircuitTable, Connection, DestroyReason, HopCryptoState,
    RelayCell, RelayCommand, Router,
};
use onion_dataplane::{Result, TorError};
use rand::rngs::OsRng;
use rsa::RsaPrivateKey;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use x25519_dalek::{PublicKey, StaticSecret};

/// A relay the simulator can answer for
pub struct TestRelay {
    pub router: Arc<Router>,
    ntor_secret: StaticSecret,
    tap_key: Option<RsaPrivateKey>,
}

impl TestRelay {
    /// Relay with only an ntor key
    pub fn ntor(index: u8) -> Self {
        let ntor_secret = StaticSecret::random_from_rng(OsRng);
        let router = Router::new(
            format!("relay{}", index),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, index)),
            9001,
            [index; 20],
        )
        .with_ntor_key(PublicKey::from(&ntor_secret).to_bytes());
        Self {
            router: Arc::new(router),
            ntor_secret,
            tap_key: None,
        }
    }

    /// Relay with only a TAP onion key
    pub fn tap(index: u8) -> Self {
        let tap_key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let router = Router::new(
            format!("tap{}", index),
            IpAddr::V4(Ipv4Addr::new(10, 0, 1, index)),
            9001,
            [index; 20],
        )
        .with_onion_key(tap_key.to_public_key());
        Self {
            router: Arc::new(router),
            ntor_secret: StaticSecret::random_from_rng(OsRng),
            tap_key: Some(tap_key),
        }
    }
}

/// How the relay at a given path index answers when asked to join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopBehavior {
    Accept,
    /// The previous hop answers the EXTEND with TRUNCATED(reason)
    Truncate(u8),
    /// The circuit is torn down with DESTROY(reason)
    Destroy(u8),
    /// No answer at all
    Silent,
}

/// How the exit answers BEGIN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitBehavior {
    Connect,
    Refuse(u8),
    Silent,
}

/// A relay cell as recognized by the relay it was addressed to
#[derive(Debug, Clone)]
pub struct SeenRelay {
    pub circuit_id: u16,
    pub hop: usize,
    pub early: bool,
    pub command: RelayCommand,
    pub stream_id: u16,
    pub body: Vec<u8>,
}

struct RelaySim {
    path: Vec<Arc<TestRelay>>,
    behaviors: Vec<HopBehavior>,
    exit: ExitBehavior,
    /// Relay-side hop state per circuit, in path order
    circuits: HashMap<u16, Vec<HopCryptoState>>,
    sent: Vec<Cell>,
    relay_log: Vec<SeenRelay>,
    unrecognized: usize,
}

impl RelaySim {
    fn behavior(&self, index: usize) -> HopBehavior {
        self.behaviors.get(index).copied().unwrap_or(HopBehavior::Accept)
    }

    fn relay_by_identity(&self, identity: &[u8]) -> Option<Arc<TestRelay>> {
        self.path
            .iter()
            .find(|r| r.router.identity[..] == *identity)
            .cloned()
    }

    /// Relay cell originated by `hop`, layered for the trip back
    fn reply_from(&mut self, circuit_id: u16, hop: usize, command: RelayCommand, stream_id: u16, body: &[u8]) -> Cell {
        let hops = self.circuits.get_mut(&circuit_id).unwrap();
        let mut cell = RelayCell::with_body(command, stream_id, hop, body).unwrap();
        hops[hop].originate(&mut cell);
        let mut payload = cell.into_payload();
        for state in hops[..=hop].iter_mut().rev() {
            state.encrypt_forward(&mut payload);
        }
        Cell::new(circuit_id, CellCommand::Relay, payload)
    }

    fn handle(&mut self, cell: Cell) -> Vec<Cell> {
        self.sent.push(cell.clone());
        let id = cell.circuit_id;
        match cell.command {
            CellCommand::CreateFast | CellCommand::Create | CellCommand::Create2 => self.create(cell),
            CellCommand::Relay | CellCommand::RelayEarly => self.relay(cell),
            CellCommand::Destroy => {
                self.circuits.remove(&id);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn create(&mut self, cell: Cell) -> Vec<Cell> {
        let id = cell.circuit_id;
        match self.behavior(0) {
            HopBehavior::Accept => {}
            HopBehavior::Silent => return Vec::new(),
            HopBehavior::Destroy(r) | HopBehavior::Truncate(r) => {
                return vec![Cell::destroy(id, DestroyReason::from(r))]
            }
        }
        let guard = self.path[0].clone();
        let (command, body, keys) = match cell.command {
            CellCommand::CreateFast => {
                let (reply, keys) = fast::server_reply(&mut OsRng, &cell.payload).unwrap();
                (CellCommand::CreatedFast, reply, keys)
            }
            CellCommand::Create => {
                let key = guard.tap_key.as_ref().unwrap();
                let (reply, keys) = tap::server_reply(&mut OsRng, key, &cell.payload).unwrap();
                (CellCommand::Created, reply, keys)
            }
            _ => {
                let p = &cell.payload;
                assert_eq!(u16::from_be_bytes([p[0], p[1]]), ntor::NTOR_HTYPE);
                let hlen = usize::from(u16::from_be_bytes([p[2], p[3]]));
                let (reply, keys) = ntor::server_reply(
                    &mut OsRng,
                    &guard.router.identity,
                    &guard.ntor_secret,
                    &p[4..4 + hlen],
                )
                .unwrap();
                (CellCommand::Created2, with_hlen(&reply), keys)
            }
        };
        self.circuits.insert(id, vec![HopCryptoState::new(&keys)]);
        vec![Cell::new(id, command, body)]
    }

    fn relay(&mut self, cell: Cell) -> Vec<Cell> {
        let id = cell.circuit_id;
        let early = cell.command == CellCommand::RelayEarly;
        let Some(hops) = self.circuits.get_mut(&id) else {
            return Vec::new();
        };
        let mut payload = cell.payload;
        let mut origin = None;
        for (index, state) in hops.iter_mut().enumerate() {
            if state.decrypt_backward(&mut payload) {
                origin = Some(index);
                break;
            }
        }
        let Some(hop) = origin else {
            self.unrecognized += 1;
            return Vec::new();
        };
        let last = hops.len() - 1;
        let relay = RelayCell::from_payload(payload, hop).unwrap();
        self.relay_log.push(SeenRelay {
            circuit_id: id,
            hop,
            early,
            command: relay.command(),
            stream_id: relay.stream_id(),
            body: relay.body().to_vec(),
        });

        let stream_id = relay.stream_id();
        match relay.command() {
            RelayCommand::Extend | RelayCommand::Extend2 => self.extend(id, hop, &relay),
            RelayCommand::Begin if hop == last => match self.exit {
                ExitBehavior::Connect => {
                    let body = [93, 184, 216, 34, 0, 0, 0x0E, 0x10];
                    vec![self.reply_from(id, hop, RelayCommand::Connected, stream_id, &body)]
                }
                ExitBehavior::Refuse(reason) => {
                    vec![self.reply_from(id, hop, RelayCommand::End, stream_id, &[reason])]
                }
                ExitBehavior::Silent => Vec::new(),
            },
            RelayCommand::BeginDir => {
                vec![self.reply_from(id, hop, RelayCommand::Connected, stream_id, &[])]
            }
            RelayCommand::Resolve => {
                let answer = [4, 4, 10, 0, 0, 1, 0, 0, 0, 60];
                vec![self.reply_from(id, hop, RelayCommand::Resolved, stream_id, &answer)]
            }
            _ => Vec::new(),
        }
    }

    fn extend(&mut self, id: u16, hop: usize, relay: &RelayCell) -> Vec<Cell> {
        let joining = hop + 1;
        match self.behavior(joining) {
            HopBehavior::Accept => {}
            HopBehavior::Silent => return Vec::new(),
            HopBehavior::Destroy(r) => return vec![Cell::destroy(id, DestroyReason::from(r))],
            HopBehavior::Truncate(r) => {
                return vec![self.reply_from(id, hop, RelayCommand::Truncated, 0, &[r])]
            }
        }

        let body = relay.body();
        let (reply_command, reply, keys) = if relay.command() == RelayCommand::Extend2 {
            let (identity, hdata) = parse_extend2(body);
            let next = self.relay_by_identity(identity).unwrap();
            let (reply, keys) =
                ntor::server_reply(&mut OsRng, &next.router.identity, &next.ntor_secret, hdata).unwrap();
            (RelayCommand::Extended2, with_hlen(&reply), keys)
        } else {
            let onionskin = &body[6..6 + tap::TAP_C_HANDSHAKE_LEN];
            let identity = &body[6 + tap::TAP_C_HANDSHAKE_LEN..];
            let next = self.relay_by_identity(identity).unwrap();
            let key = next.tap_key.as_ref().unwrap();
            let (reply, keys) = tap::server_reply(&mut OsRng, key, onionskin).unwrap();
            (RelayCommand::Extended, reply, keys)
        };
        self.circuits.get_mut(&id).unwrap().push(HopCryptoState::new(&keys));
        vec![self.reply_from(id, hop, reply_command, 0, &reply)]
    }
}

/// HLEN | HDATA
fn with_hlen(hdata: &[u8]) -> Vec<u8> {
    let mut body = (hdata.len() as u16).to_be_bytes().to_vec();
    body.extend_from_slice(hdata);
    body
}

/// Identity link specifier and HDATA out of an EXTEND2 body
fn parse_extend2(body: &[u8]) -> (&[u8], &[u8]) {
    let nspec = body[0];
    let mut pos = 1;
    let mut identity: &[u8] = &[];
    for _ in 0..nspec {
        let (kind, len) = (body[pos], usize::from(body[pos + 1]));
        if kind == 2 {
            identity = &body[pos + 2..pos + 2 + len];
        }
        pos += 2 + len;
    }
    assert_eq!(u16::from_be_bytes([body[pos], body[pos + 1]]), ntor::NTOR_HTYPE);
    let hlen = usize::from(u16::from_be_bytes([body[pos + 2], body[pos + 3]]));
    (identity, &body[pos + 4..pos + 4 + hlen])
}

pub struct MockLink {
    table: CircuitTable,
    sim: Mutex<RelaySim>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl MockLink {
    /// Start a link whose relays are `path`, in order
    pub fn start(path: Vec<TestRelay>, behaviors: Vec<HopBehavior>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded::<Vec<u8>>();
        let link = Arc::new(Self {
            table: CircuitTable::new(),
            sim: Mutex::new(RelaySim {
                path: path.into_iter().map(Arc::new).collect(),
                behaviors,
                exit: ExitBehavior::Connect,
                circuits: HashMap::new(),
                sent: Vec::new(),
                relay_log: Vec::new(),
                unrecognized: 0,
            }),
            inbound: Mutex::new(Some(tx)),
        });

        let reader = link.clone();
        thread::spawn(move || {
            let bytes = rx.map(Ok::<_, io::Error>).into_async_read();
            let _ = block_on(run_reader(bytes, reader.circuits()));
        });
        link
    }

    /// Three ntor relays that accept everything
    pub fn three_hops() -> (Arc<Self>, Vec<Arc<Router>>) {
        let relays: Vec<TestRelay> = (1..=3).map(TestRelay::ntor).collect();
        let path = relays.iter().map(|r| r.router.clone()).collect();
        (Self::start(relays, Vec::new()), path)
    }

    pub fn conn(self: &Arc<Self>) -> Arc<dyn Connection> {
        self.clone()
    }

    fn sim(&self) -> MutexGuard<'_, RelaySim> {
        self.sim.lock().unwrap()
    }

    pub fn set_exit(&self, exit: ExitBehavior) {
        self.sim().exit = exit;
    }

    fn push(&self, cell: Cell) {
        let bytes = cell.encode().unwrap();
        if let Some(tx) = self.inbound.lock().unwrap().as_ref() {
            let _ = tx.unbounded_send(bytes);
        }
    }

    /// Deliver a raw cell to the client
    pub fn inject(&self, cell: Cell) {
        self.push(cell);
    }

    /// Relay cell from `hop` of circuit `circuit_id` to the client
    pub fn send_from_hop(&self, circuit_id: u16, hop: usize, command: RelayCommand, stream_id: u16, body: &[u8]) {
        // encrypt and enqueue under one lock so wire order matches cipher order
        let mut sim = self.sim();
        let cell = sim.reply_from(circuit_id, hop, command, stream_id, body);
        self.push(cell);
    }

    /// Close the link: the reader sees EOF
    pub fn drop_link(&self) {
        self.inbound.lock().unwrap().take();
    }

    pub fn sent_commands(&self) -> Vec<CellCommand> {
        self.sim().sent.iter().map(|c| c.command).collect()
    }

    pub fn sent_cells(&self) -> Vec<Cell> {
        self.sim().sent.clone()
    }

    pub fn relay_log(&self) -> Vec<SeenRelay> {
        self.sim().relay_log.clone()
    }

    /// Recognized relay cells of one command
    pub fn seen(&self, command: RelayCommand) -> Vec<SeenRelay> {
        self.relay_log()
            .into_iter()
            .filter(|r| r.command == command)
            .collect()
    }

    /// Relay cells no relay on the path recognized
    pub fn unrecognized(&self) -> usize {
        self.sim().unrecognized
    }

    /// Whether the client still has `id` registered on this link
    pub fn circuits_contains(&self, id: u16) -> bool {
        self.table.contains(id)
    }

    /// Relay-side hop count for a circuit
    pub fn relay_hops(&self, circuit_id: u16) -> usize {
        self.sim().circuits.get(&circuit_id).map_or(0, Vec::len)
    }
}

impl Connection for MockLink {
    fn send_cell(&self, cell: Cell) -> Result<()> {
        if self.inbound.lock().unwrap().is_none() {
            return Err(TorError::ConnectionFailed("link closed".into()));
        }
        let mut sim = self.sim();
        let replies = sim.handle(cell);
        for reply in replies {
            self.push(reply);
        }
        Ok(())
    }

    fn circuits(&self) -> &CircuitTable {
        &self.table
    }
}

/// Poll `cond` until it holds or two seconds pass
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
