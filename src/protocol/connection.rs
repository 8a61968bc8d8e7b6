//! Link-side seam: the [`Connection`] trait, its circuit table and the
//! single reader loop that feeds circuits
//!
//! The link itself (TLS, version negotiation, NETINFO) belongs to the caller.
//! All this module needs is a way to queue a cell for transmission and a byte
//! source to frame inbound cells from.

use super::cell::{Cell, CellCommand, CIRC_ID_LEN, VAR_HEADER_LEN};
use super::circuit::CircuitCore;
use crate::error::{Result, TorError};
use futures::io::{AsyncRead, AsyncReadExt};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, PoisonError};

/// An established link to the first hop
pub trait Connection: Send + Sync {
    /// Queue a cell for transmission
    ///
    /// Must not block on flow control: circuits call this while holding
    /// their own state lock so that cipher order matches wire order.
    fn send_cell(&self, cell: Cell) -> Result<()>;

    /// Circuits multiplexed over this link
    fn circuits(&self) -> &CircuitTable;
}

struct TableInner {
    circuits: HashMap<u16, Arc<CircuitCore>>,
    next_id: u16,
    closed: Option<TorError>,
}

/// Circuit ids in use on one connection
pub struct CircuitTable {
    inner: Mutex<TableInner>,
}

impl CircuitTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                circuits: HashMap::new(),
                next_id: 1,
                closed: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh id for `core` and register it
    ///
    /// Ids are non-zero and handed out from a wrapping counter, skipping ids
    /// still in use.
    pub(crate) fn register(&self, core: Arc<CircuitCore>) -> Result<u16> {
        let mut inner = self.lock();
        if let Some(err) = &inner.closed {
            return Err(err.clone());
        }
        for _ in 0..u16::MAX {
            let id = inner.next_id;
            inner.next_id = inner.next_id.checked_add(1).unwrap_or(1);
            if id != 0 && !inner.circuits.contains_key(&id) {
                core.bind(id);
                inner.circuits.insert(id, core);
                return Ok(id);
            }
        }
        Err(TorError::ConnectionFailed("no free circuit ids".into()))
    }

    /// Remove a circuit; unknown ids are ignored
    pub fn deregister(&self, id: u16) {
        if self.lock().circuits.remove(&id).is_some() {
            log::debug!("Circuit {} deregistered", id);
        }
    }

    /// Hand an inbound cell to its circuit
    pub fn dispatch(&self, cell: Cell) {
        if cell.circuit_id == 0 {
            log::debug!("Dropping link-level {:?} cell", cell.command);
            return;
        }
        let core = self.lock().circuits.get(&cell.circuit_id).cloned();
        match core {
            Some(core) => core.handle_cell(cell),
            None => log::debug!(
                "Dropping {:?} cell for unknown circuit {}",
                cell.command,
                cell.circuit_id
            ),
        }
    }

    /// Tear down every circuit after the link is lost
    pub fn close_all(&self, err: TorError) {
        let circuits: Vec<_> = {
            let mut inner = self.lock();
            inner.closed = Some(err.clone());
            inner.circuits.drain().map(|(_, core)| core).collect()
        };
        if !circuits.is_empty() {
            log::warn!("Link lost, closing {} circuit(s): {}", circuits.len(), err);
        }
        for core in circuits {
            core.shutdown(err.clone(), None);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: u16) -> bool {
        self.lock().circuits.contains_key(&id)
    }
}

impl Default for CircuitTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Read one cell, or `None` on a clean end of stream at a cell boundary
pub async fn read_cell<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Cell>> {
    let mut header = [0u8; VAR_HEADER_LEN];
    let fixed_header = CIRC_ID_LEN + 1;

    match reader.read_exact(&mut header[..fixed_header]).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TorError::ConnectionFailed(format!("link read failed: {}", e))),
    }

    let command = CellCommand::from(header[CIRC_ID_LEN]);
    let mut header_len = fixed_header;
    if command.is_variable_length() {
        reader
            .read_exact(&mut header[fixed_header..])
            .await
            .map_err(|e| TorError::protocol(format!("truncated variable cell header: {}", e)))?;
        header_len = VAR_HEADER_LEN;
    }

    let total = Cell::wire_len(command, &header[..header_len])
        .ok_or_else(|| TorError::protocol("truncated cell header"))?;
    let mut buf = vec![0u8; total];
    buf[..header_len].copy_from_slice(&header[..header_len]);
    reader
        .read_exact(&mut buf[header_len..])
        .await
        .map_err(|e| TorError::protocol(format!("truncated {:?} cell: {}", command, e)))?;

    Cell::decode(&buf).map(Some)
}

/// Frame cells off `reader` and dispatch them until the link ends
///
/// On end of stream or a framing error every circuit in `circuits` is torn
/// down. Returns `Ok(())` for a clean end of stream.
pub async fn run_reader<R: AsyncRead + Unpin>(mut reader: R, circuits: &CircuitTable) -> Result<()> {
    let outcome = loop {
        match read_cell(&mut reader).await {
            Ok(Some(cell)) => circuits.dispatch(cell),
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    match &outcome {
        Ok(()) => {
            log::info!("Link closed by peer");
            circuits.close_all(TorError::ConnectionFailed("link closed".into()));
        }
        Err(e) => {
            log::error!("❌ Link reader failed: {}", e);
            circuits.close_all(e.clone());
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cell::{DestroyReason, CELL_LEN};
    use futures::executor::block_on;

    #[test]
    fn test_read_cells_in_sequence() {
        let mut wire = Cell::destroy(5, DestroyReason::REQUESTED).encode().unwrap();
        wire.extend(Cell::new(0, CellCommand::Versions, vec![0, 4]).encode().unwrap());
        let mut reader = futures::io::Cursor::new(wire);

        let first = block_on(read_cell(&mut reader)).unwrap().unwrap();
        assert_eq!(first.circuit_id, 5);
        assert_eq!(first.command, CellCommand::Destroy);

        let second = block_on(read_cell(&mut reader)).unwrap().unwrap();
        assert_eq!(second.command, CellCommand::Versions);
        assert_eq!(second.payload, vec![0, 4]);

        assert!(block_on(read_cell(&mut reader)).unwrap().is_none());
    }

    #[test]
    fn test_truncated_cell_is_protocol_violation() {
        let wire = Cell::destroy(5, DestroyReason::PROTOCOL).encode().unwrap();
        let mut reader = futures::io::Cursor::new(wire[..CELL_LEN - 10].to_vec());
        assert!(matches!(
            block_on(read_cell(&mut reader)),
            Err(TorError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_run_reader_closes_table() {
        struct Nowhere(CircuitTable);
        impl Connection for Nowhere {
            fn send_cell(&self, _cell: Cell) -> Result<()> {
                Ok(())
            }
            fn circuits(&self) -> &CircuitTable {
                &self.0
            }
        }

        let conn: Arc<dyn Connection> = Arc::new(Nowhere(CircuitTable::new()));
        let first = CircuitCore::new(Arc::downgrade(&conn), 4);
        assert_eq!(conn.circuits().register(first.clone()).unwrap(), 1);

        let wire = Cell::destroy(9, DestroyReason::PROTOCOL).encode().unwrap();
        let reader = futures::io::Cursor::new(wire);
        assert!(block_on(run_reader(reader, conn.circuits())).is_ok());
        assert!(conn.circuits().is_empty());
        assert!(matches!(first.closed_error(), TorError::ConnectionFailed(_)));

        let late = CircuitCore::new(Arc::downgrade(&conn), 4);
        assert!(matches!(
            conn.circuits().register(late),
            Err(TorError::ConnectionFailed(_))
        ));
    }
}
