//! Streams, flow control and circuit teardown on an open circuit

mod common;

use common::{wait_until, ExitBehavior, MockLink};
use futures::executor::block_on;
use futures::{AsyncReadExt, AsyncWriteExt, FutureExt};
use onion_dataplane::protocol::{Cell, CellCommand, RelayCommand, RELAY_DATA_LEN};
use onion_dataplane::{
    Circuit, CircuitBuilder, CircuitConfig, CircuitState, DestroyReason, EndReason, NoopHandler,
    ResolvedAddress, StreamTarget, ThreadSleeper, TorError,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

const EXIT: usize = 2;

fn open_circuit() -> (Arc<MockLink>, Circuit<ThreadSleeper>) {
    let (link, path) = MockLink::three_hops();
    let builder = CircuitBuilder::new(ThreadSleeper::new(), CircuitConfig::default());
    let circuit = block_on(builder.build_circuit(link.conn(), &path, &NoopHandler)).unwrap();
    (link, circuit)
}

fn data_cells(link: &MockLink, stream_id: u16) -> Vec<Vec<u8>> {
    link.seen(RelayCommand::Data)
        .into_iter()
        .filter(|r| r.stream_id == stream_id)
        .map(|r| r.body)
        .collect()
}

#[test]
fn connect_sends_begin_to_exit() {
    let (link, circuit) = open_circuit();
    let stream = block_on(circuit.connect("example.com", 80)).unwrap();

    assert_eq!(stream.hop(), EXIT);
    assert_eq!(
        stream.connected_addr(),
        Some((IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)), 3600))
    );
    let begins = link.seen(RelayCommand::Begin);
    assert_eq!(begins.len(), 1);
    assert_eq!(begins[0].hop, EXIT);
    assert_eq!(begins[0].stream_id, stream.id());
    assert_eq!(begins[0].body, b"example.com:80\0");
    assert!(!begins[0].early);
}

#[test]
fn begin_dir_has_empty_body() {
    let (link, circuit) = open_circuit();
    let stream = block_on(circuit.begin_dir()).unwrap();

    assert_eq!(stream.connected_addr(), None);
    let begins = link.seen(RelayCommand::BeginDir);
    assert_eq!(begins.len(), 1);
    assert!(begins[0].body.is_empty());
}

#[test]
fn streams_get_distinct_ids() {
    let (_link, circuit) = open_circuit();
    let a = block_on(circuit.connect("a.example", 443)).unwrap();
    let b = block_on(circuit.connect("b.example", 443)).unwrap();
    assert_ne!(a.id(), b.id());
    assert_ne!(a.id(), 0);
}

#[test]
fn end_before_connected_fails_stream_only() {
    let (link, circuit) = open_circuit();
    link.set_exit(ExitBehavior::Refuse(3));

    let err = block_on(circuit.connect("example.com", 80)).unwrap_err();
    match err {
        TorError::StreamConnectFailed(reason) => assert_eq!(reason, EndReason::CONNECTREFUSED),
        other => panic!("unexpected error {:?}", other),
    }

    // the circuit and later streams are unaffected
    assert!(circuit.is_open());
    link.set_exit(ExitBehavior::Connect);
    assert!(block_on(circuit.connect("example.com", 80)).is_ok());
}

#[test]
fn silent_exit_times_out_independently_of_build_timeout() {
    let (link, circuit) = open_circuit();
    link.set_exit(ExitBehavior::Silent);

    let target = StreamTarget::Exit {
        host: "example.com".into(),
        port: 80,
    };
    let started = Instant::now();
    let err = block_on(circuit.open_stream(target, Duration::from_millis(200))).unwrap_err();

    assert!(matches!(err, TorError::StreamTimeout));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(circuit.is_open());

    // the abandoned stream is ended at the exit
    let ends = link.seen(RelayCommand::End);
    assert_eq!(ends.len(), 1);
    assert_eq!(ends[0].body, vec![u8::from(EndReason::TIMEOUT)]);
}

#[test]
fn abandoned_open_ends_the_stream() {
    let (link, circuit) = open_circuit();
    link.set_exit(ExitBehavior::Silent);

    let target = StreamTarget::Exit {
        host: "example.com".into(),
        port: 80,
    };
    let opening = circuit.open_stream(target, Duration::from_secs(30));
    assert!(opening.now_or_never().is_none());

    assert!(wait_until(|| link.seen(RelayCommand::End).len() == 1));
    let begins = link.seen(RelayCommand::Begin);
    let ends = link.seen(RelayCommand::End);
    assert_eq!(begins.len(), 1);
    assert_eq!(ends[0].stream_id, begins[0].stream_id);
    assert_eq!(ends[0].hop, EXIT);
    assert_eq!(ends[0].body, vec![u8::from(EndReason::MISC)]);

    // a late CONNECTED for the abandoned id is dropped and the circuit carries on
    link.send_from_hop(circuit.id().unwrap(), EXIT, RelayCommand::Connected, begins[0].stream_id, &[]);
    link.set_exit(ExitBehavior::Connect);
    let stream = block_on(circuit.connect("example.com", 80)).unwrap();
    assert_ne!(stream.id(), begins[0].stream_id);
    assert!(circuit.is_open());
    assert_eq!(link.seen(RelayCommand::End).len(), 1);
}

#[test]
fn writes_are_packed_into_full_cells() {
    let (link, circuit) = open_circuit();
    let mut stream = block_on(circuit.connect("example.com", 80)).unwrap();

    let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
    block_on(async {
        stream.write_all(&data).await.unwrap();
        stream.flush().await.unwrap();
    });

    let cells = data_cells(&link, stream.id());
    let sizes: Vec<_> = cells.iter().map(Vec::len).collect();
    assert_eq!(sizes, [RELAY_DATA_LEN, RELAY_DATA_LEN, 1000 - 2 * RELAY_DATA_LEN]);
    assert_eq!(cells.concat(), data);
}

#[test]
fn stream_window_blocks_until_sendme() {
    let (link, circuit) = open_circuit();
    let mut stream = block_on(circuit.connect("example.com", 80)).unwrap();
    let cell = vec![0x42u8; RELAY_DATA_LEN];

    block_on(async {
        for _ in 0..500 {
            stream.write_all(&cell).await.unwrap();
        }
        stream.flush().await.unwrap();
    });
    assert_eq!(data_cells(&link, stream.id()).len(), 500);

    // cell 501 has no credit
    block_on(stream.write_all(&cell)).unwrap();
    assert!(stream.flush().now_or_never().is_none());
    assert_eq!(data_cells(&link, stream.id()).len(), 500);

    let id = circuit.id().unwrap();
    link.send_from_hop(id, EXIT, RelayCommand::Sendme, stream.id(), &[]);
    block_on(stream.flush()).unwrap();
    assert_eq!(data_cells(&link, stream.id()).len(), 501);
}

#[test]
fn hop_window_blocks_across_streams() {
    let (link, circuit) = open_circuit();
    let cell = vec![7u8; RELAY_DATA_LEN];

    // two streams use up the hop's 1000 cells between them
    let mut first = block_on(circuit.connect("a.example", 80)).unwrap();
    let mut second = block_on(circuit.connect("b.example", 80)).unwrap();
    block_on(async {
        for stream in [&mut first, &mut second] {
            for _ in 0..500 {
                stream.write_all(&cell).await.unwrap();
            }
            stream.flush().await.unwrap();
        }
    });

    // a fresh stream has its own credit but the hop has none
    let mut third = block_on(circuit.connect("c.example", 80)).unwrap();
    block_on(third.write_all(b"x")).unwrap();
    assert!(third.flush().now_or_never().is_none());
    assert!(data_cells(&link, third.id()).is_empty());

    let id = circuit.id().unwrap();
    link.send_from_hop(id, EXIT, RelayCommand::Sendme, 0, &[]);
    block_on(third.flush()).unwrap();
    assert_eq!(data_cells(&link, third.id()), vec![b"x".to_vec()]);
}

#[test]
fn reading_sends_stream_and_hop_sendmes() {
    let (link, circuit) = open_circuit();
    let mut stream = block_on(circuit.connect("example.com", 80)).unwrap();
    let id = circuit.id().unwrap();

    for i in 0..100u8 {
        link.send_from_hop(id, EXIT, RelayCommand::Data, stream.id(), &[i; RELAY_DATA_LEN]);
    }
    let mut received = vec![0u8; 100 * RELAY_DATA_LEN];
    block_on(stream.read_exact(&mut received)).unwrap();
    for (i, chunk) in received.chunks(RELAY_DATA_LEN).enumerate() {
        assert!(chunk.iter().all(|&b| b == i as u8));
    }

    let sendmes = link.seen(RelayCommand::Sendme);
    let stream_level = sendmes.iter().filter(|s| s.stream_id == stream.id()).count();
    let hop_level: Vec<_> = sendmes.iter().filter(|s| s.stream_id == 0).collect();
    assert_eq!(stream_level, 2);
    assert_eq!(hop_level.len(), 1);
    assert_eq!(hop_level[0].hop, EXIT);
}

#[test]
fn end_from_exit_is_eof() {
    let (link, circuit) = open_circuit();
    let mut stream = block_on(circuit.connect("example.com", 80)).unwrap();
    let id = circuit.id().unwrap();

    link.send_from_hop(id, EXIT, RelayCommand::Data, stream.id(), b"hello");
    link.send_from_hop(id, EXIT, RelayCommand::End, stream.id(), &[6]);

    let mut body = Vec::new();
    block_on(stream.read_to_end(&mut body)).unwrap();
    assert_eq!(body, b"hello");
    assert!(stream.is_ended());
    assert!(block_on(stream.write_all(b"late")).is_err());

    // no END goes back for a stream the exit already ended
    drop(stream);
    assert!(link.seen(RelayCommand::End).is_empty());
}

#[test]
fn data_from_wrong_hop_is_dropped() {
    let (link, circuit) = open_circuit();
    let mut stream = block_on(circuit.connect("example.com", 80)).unwrap();
    let id = circuit.id().unwrap();

    link.send_from_hop(id, 1, RelayCommand::Data, stream.id(), b"spoofed");
    link.send_from_hop(id, EXIT, RelayCommand::Data, stream.id(), b"ok");
    link.send_from_hop(id, EXIT, RelayCommand::End, stream.id(), &[6]);

    let mut body = Vec::new();
    block_on(stream.read_to_end(&mut body)).unwrap();
    assert_eq!(body, b"ok");
    assert!(circuit.is_open());
}

#[test]
fn close_sends_end_done() {
    let (link, circuit) = open_circuit();
    let mut stream = block_on(circuit.connect("example.com", 80)).unwrap();

    block_on(async {
        stream.write_all(b"bye").await.unwrap();
        stream.close().await.unwrap();
    });

    assert_eq!(data_cells(&link, stream.id()), vec![b"bye".to_vec()]);
    let ends = link.seen(RelayCommand::End);
    assert_eq!(ends.len(), 1);
    assert_eq!(ends[0].stream_id, stream.id());
    assert_eq!(ends[0].body, vec![u8::from(EndReason::DONE)]);
}

#[test]
fn dropping_stream_sends_end() {
    let (link, circuit) = open_circuit();
    let stream = block_on(circuit.connect("example.com", 80)).unwrap();
    let stream_id = stream.id();

    drop(stream);

    let ends = link.seen(RelayCommand::End);
    assert_eq!(ends.len(), 1);
    assert_eq!(ends[0].stream_id, stream_id);
}

#[test]
fn resolve_returns_answers() {
    let (link, circuit) = open_circuit();
    let answers = block_on(circuit.resolve("example.com", Duration::from_secs(5))).unwrap();

    assert_eq!(
        answers,
        vec![ResolvedAddress::Ip {
            addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            ttl: 60
        }]
    );
    let resolves = link.seen(RelayCommand::Resolve);
    assert_eq!(resolves[0].body, b"example.com\0");
    assert_eq!(resolves[0].hop, EXIT);
}

#[test]
fn unrecognized_cell_destroys_circuit() {
    let (link, circuit) = open_circuit();
    let mut stream = block_on(circuit.connect("example.com", 80)).unwrap();
    let id = circuit.id().unwrap();

    link.inject(Cell::new(id, CellCommand::Relay, vec![0xA5; 509]));

    assert!(wait_until(|| circuit.state() == CircuitState::Destroyed));
    assert!(matches!(
        circuit.closed_reason(),
        Some(TorError::ProtocolViolation(_))
    ));
    let last = link.sent_cells().into_iter().last().unwrap();
    assert_eq!(last.command, CellCommand::Destroy);
    assert_eq!(last.payload[0], u8::from(DestroyReason::PROTOCOL));

    let mut buf = [0u8; 16];
    assert!(block_on(stream.read(&mut buf)).is_err());
}

#[test]
fn destroy_on_open_circuit() {
    let (link, circuit) = open_circuit();
    let id = circuit.id().unwrap();

    link.inject(Cell::destroy(id, DestroyReason::from(9)));

    assert!(wait_until(|| circuit.state() == CircuitState::Destroyed));
    assert!(matches!(
        circuit.closed_reason(),
        Some(TorError::CircuitDestroyed { .. })
    ));
    assert!(!link.circuits_contains(id));
    assert!(block_on(circuit.connect("example.com", 80)).is_err());
}

#[test]
fn truncated_on_open_circuit() {
    let (link, circuit) = open_circuit();
    let id = circuit.id().unwrap();

    link.send_from_hop(id, 1, RelayCommand::Truncated, 0, &[6]);

    assert!(wait_until(|| circuit.state() == CircuitState::Destroyed));
    assert!(matches!(
        circuit.closed_reason(),
        Some(TorError::CircuitTruncated { hop: 1, .. })
    ));
}

#[test]
fn link_loss_fails_circuit_and_streams() {
    let (link, circuit) = open_circuit();
    let mut stream = block_on(circuit.connect("example.com", 80)).unwrap();

    link.drop_link();

    assert!(wait_until(|| circuit.state() == CircuitState::Destroyed));
    assert!(matches!(
        circuit.closed_reason(),
        Some(TorError::ConnectionFailed(_))
    ));
    let mut buf = [0u8; 16];
    assert!(block_on(stream.read(&mut buf)).is_err());
    assert!(block_on(stream.write_all(&[1u8; 600])).is_err());
}

#[test]
fn blocked_writer_wakes_on_teardown() {
    let (link, circuit) = open_circuit();
    let mut stream = block_on(circuit.connect("example.com", 80)).unwrap();
    let cell = vec![1u8; RELAY_DATA_LEN];
    block_on(async {
        for _ in 0..500 {
            stream.write_all(&cell).await.unwrap();
        }
        stream.flush().await.unwrap();
    });

    block_on(stream.write_all(b"stuck")).unwrap();
    let id = circuit.id().unwrap();
    let killer = link.clone();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        killer.inject(Cell::destroy(id, DestroyReason::from(9)));
    });

    assert!(block_on(stream.flush()).is_err());
}

#[test]
fn dropping_circuit_sends_destroy() {
    let (link, circuit) = open_circuit();
    let id = circuit.id().unwrap();

    drop(circuit);

    let last = link.sent_cells().into_iter().last().unwrap();
    assert_eq!(last.command, CellCommand::Destroy);
    assert_eq!(last.circuit_id, id);
    assert!(!link.circuits_contains(id));
}
