//! Two-device scenarios over the in-memory broadcast medium, exercising the full stack:
//! facade, session, codec, framing and the datagram transport underneath.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use eminent::config::SdkConfig;
use eminent::physical::{InMemoryMedium, InMemoryPhysical, PhysicalTransport};
use eminent::sdk::EminentSdk;
use eminent::types::{
    ConnectionEvent, ConnectionId, ConnectionObserver, ConnectionStatus, DeviceId, MessageFormat,
    SdkHost,
};

const STEP: Duration = Duration::from_secs(2);

fn fast_config() -> SdkConfig {
    SdkConfig {
        retransmit_interval: Duration::from_millis(50),
        session_tick_interval: Duration::from_millis(5),
        ..SdkConfig::default()
    }
}

struct ChannelObserver {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ChannelObserver {
    fn new() -> (Arc<ChannelObserver>, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelObserver { tx }), rx)
    }
}

impl ConnectionObserver for ChannelObserver {
    fn on_event(&self, event: ConnectionEvent) {
        let _ = self.tx.send(event);
    }
}

struct ChannelHost {
    accept: bool,
    established_tx: mpsc::UnboundedSender<(ConnectionId, DeviceId)>,
}

impl ChannelHost {
    fn accepting() -> (Arc<ChannelHost>, mpsc::UnboundedReceiver<(ConnectionId, DeviceId)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(ChannelHost {
                accept: true,
                established_tx: tx,
            }),
            rx,
        )
    }

    fn rejecting() -> (Arc<ChannelHost>, mpsc::UnboundedReceiver<(ConnectionId, DeviceId)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(ChannelHost {
                accept: false,
                established_tx: tx,
            }),
            rx,
        )
    }
}

impl SdkHost for ChannelHost {
    fn decide_incoming(&self, _remote: DeviceId, _raw_payload: &[u8]) -> bool {
        self.accept
    }

    fn on_established(&self, conn_id: ConnectionId, remote: DeviceId) {
        let _ = self.established_tx.send((conn_id, remote));
    }
}

/// Wraps a transport and, while armed, tampers with outgoing datagrams: either corrupting
///  the next one (single shot) or dropping everything.
struct FaultyTransport {
    inner: InMemoryPhysical,
    corrupt_next: AtomicBool,
    drop_all: AtomicBool,
}

impl FaultyTransport {
    fn new(inner: InMemoryPhysical) -> Arc<FaultyTransport> {
        Arc::new(FaultyTransport {
            inner,
            corrupt_next: AtomicBool::new(false),
            drop_all: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl PhysicalTransport for FaultyTransport {
    async fn send_datagram(&self, datagram: &[u8]) -> Result<()> {
        if self.drop_all.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.corrupt_next.swap(false, Ordering::SeqCst) {
            let mut corrupted = datagram.to_vec();
            *corrupted.last_mut().expect("datagram is never empty") ^= 0xFF;
            return self.inner.send_datagram(&corrupted).await;
        }
        self.inner.send_datagram(datagram).await
    }

    async fn recv_datagram(&self) -> Result<Vec<u8>> {
        self.inner.recv_datagram().await
    }
}

struct Pair {
    a: Arc<EminentSdk>,
    b: Arc<EminentSdk>,
    established_b: mpsc::UnboundedReceiver<(ConnectionId, DeviceId)>,
    fault_a: Arc<FaultyTransport>,
}

/// Starts devices 1 and 2 on a fresh medium; device 1's transport can inject faults.
async fn start_pair(config: SdkConfig) -> Pair {
    let medium = InMemoryMedium::new();
    let fault_a = FaultyTransport::new(medium.attach(1).unwrap());
    let physical_b = Arc::new(medium.attach(2).unwrap());

    let (host_a, _established_a) = ChannelHost::accepting();
    let (host_b, established_b) = ChannelHost::accepting();

    let a = EminentSdk::start(1, config.clone(), host_a, fault_a.clone())
        .await
        .unwrap();
    let b = EminentSdk::start(2, config, host_b, physical_b).await.unwrap();

    Pair {
        a,
        b,
        established_b,
        fault_a,
    }
}

/// Runs the three-leg handshake from device 1 to device 2 and returns the combined
///  connection id plus the event streams on both sides.
async fn establish(
    pair: &mut Pair,
) -> (
    ConnectionId,
    mpsc::UnboundedReceiver<ConnectionEvent>,
    mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    let (observer_a, mut events_a) = ChannelObserver::new();
    let (conn_id, acked) = pair.a.connect(2, 0, observer_a).await.unwrap();
    assert_eq!(conn_id, 2, "first prime of a fresh initiator");

    let connected = timeout(STEP, events_a.recv()).await.unwrap().unwrap();
    let combined = match connected {
        ConnectionEvent::Connected(id) => id,
        other => panic!("expected Connected, got {:?}", other),
    };

    timeout(STEP, acked)
        .await
        .expect("handshake request must be acknowledged")
        .unwrap();

    let (established_id, remote) = timeout(STEP, pair.established_b.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(established_id, combined);
    assert_eq!(remote, 1);

    let (observer_b, events_b) = ChannelObserver::new();
    pair.b.set_observer(combined, observer_b).unwrap();

    (combined, events_a, events_b)
}

fn summary_of(sdk: &EminentSdk, conn_id: ConnectionId) -> eminent::sdk::ConnectionSummary {
    sdk.summary()
        .connections
        .into_iter()
        .find(|c| c.id == conn_id)
        .expect("connection present in summary")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handshake_derives_prime_product_on_both_sides() {
    let mut pair = start_pair(fast_config()).await;
    let (combined, _events_a, _events_b) = establish(&mut pair).await;

    // initiator prime 2, responder prime 3
    assert_eq!(combined, 6);

    let on_a = summary_of(&pair.a, 6);
    let on_b = summary_of(&pair.b, 6);
    assert_eq!(on_a.status, ConnectionStatus::Active);
    assert_eq!(on_b.status, ConnectionStatus::Active);
    assert_eq!(on_a.special_code, on_b.special_code);
    assert_eq!(on_a.remote_id, 2);
    assert_eq!(on_b.remote_id, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_short_reliable_roundtrip() {
    let mut pair = start_pair(fast_config()).await;
    let (combined, _events_a, mut events_b) = establish(&mut pair).await;

    let delivered = pair
        .a
        .send(combined, Bytes::from_static(b"hello"), MessageFormat::Json, 0, true)
        .await
        .unwrap();

    let event = timeout(STEP, events_b.recv()).await.unwrap().unwrap();
    match event {
        ConnectionEvent::Message(msg) => {
            assert_eq!(msg.payload.as_ref(), b"hello");
            assert_eq!(msg.conn_id, combined);
        }
        other => panic!("expected Message, got {:?}", other),
    }

    timeout(STEP, delivered)
        .await
        .expect("delivery notification must fire")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fragmented_message_arrives_whole() {
    let config = SdkConfig {
        max_packet_size: 5,
        ..fast_config()
    };
    let mut pair = start_pair(config).await;
    let (combined, _events_a, mut events_b) = establish(&mut pair).await;

    let delivered = pair
        .a
        .send(
            combined,
            Bytes::from_static(b"HelloWorld"),
            MessageFormat::Json,
            0,
            true,
        )
        .await
        .unwrap();

    let event = timeout(STEP, events_b.recv()).await.unwrap().unwrap();
    match event {
        ConnectionEvent::Message(msg) => assert_eq!(msg.payload.as_ref(), b"HelloWorld"),
        other => panic!("expected Message, got {:?}", other),
    }
    timeout(STEP, delivered).await.unwrap().unwrap();

    // exactly one delivery - nothing further arrives
    assert!(events_b.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_corrupted_datagram_is_recovered_by_retransmission() {
    let mut pair = start_pair(fast_config()).await;
    let (combined, _events_a, mut events_b) = establish(&mut pair).await;

    // flip a byte of the next datagram leaving device 1 - the receiver's CRC check drops
    //  it, and the retransmission succeeds
    pair.fault_a.corrupt_next.store(true, Ordering::SeqCst);

    let delivered = pair
        .a
        .send(combined, Bytes::from_static(b"resilient"), MessageFormat::Json, 0, true)
        .await
        .unwrap();

    let event = timeout(STEP, events_b.recv()).await.unwrap().unwrap();
    match event {
        ConnectionEvent::Message(msg) => assert_eq!(msg.payload.as_ref(), b"resilient"),
        other => panic!("expected Message, got {:?}", other),
    }
    timeout(STEP, delivered).await.unwrap().unwrap();
    assert!(events_b.try_recv().is_err(), "the message arrives exactly once");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_retransmit_exhaustion_raises_trouble_once() {
    let mut pair = start_pair(fast_config()).await;
    let (combined, mut events_a, mut events_b) = establish(&mut pair).await;

    pair.fault_a.drop_all.store(true, Ordering::SeqCst);

    let delivered = pair
        .a
        .send(combined, Bytes::from_static(b"lost"), MessageFormat::Json, 0, true)
        .await
        .unwrap();

    let event = timeout(STEP, events_a.recv()).await.unwrap().unwrap();
    match event {
        ConnectionEvent::Trouble(reason) => {
            assert!(reason.contains("retransmit"), "unexpected reason: {}", reason)
        }
        other => panic!("expected Trouble, got {:?}", other),
    }

    // the delivery notification is abandoned, not resolved
    assert!(timeout(STEP, delivered).await.unwrap().is_err());

    // trouble fires exactly once, and nothing ever reached device 2
    assert!(events_a.try_recv().is_err());
    assert!(events_b.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rejected_handshake_creates_no_connection() {
    let medium = InMemoryMedium::new();
    let physical_a = Arc::new(medium.attach(1).unwrap());
    let physical_b = Arc::new(medium.attach(2).unwrap());

    let (host_a, _established_a) = ChannelHost::accepting();
    let (host_b, mut established_b) = ChannelHost::rejecting();

    let a = EminentSdk::start(1, fast_config(), host_a, physical_a).await.unwrap();
    let b = EminentSdk::start(2, fast_config(), host_b, physical_b).await.unwrap();

    let (observer_a, mut events_a) = ChannelObserver::new();
    let (_conn_id, _acked) = a.connect(2, 0, observer_a).await.unwrap();

    // give the initiator time to retransmit into the void a few times
    assert!(timeout(Duration::from_millis(200), events_a.recv()).await.is_err());
    assert!(established_b.try_recv().is_err());
    assert_eq!(b.summary().total_connections, 0);
    assert_eq!(summary_of(&a, 2).status, ConnectionStatus::Pending);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_out_of_width_fields_never_reach_the_wire() {
    let mut pair = start_pair(fast_config()).await;
    let (combined, _events_a, mut events_b) = establish(&mut pair).await;

    // priority 99 does not fit the 4-bit width - rejected synchronously
    let result = pair
        .a
        .send(combined, Bytes::from_static(b"x"), MessageFormat::Json, 99, true)
        .await;
    assert!(result.is_err());
    assert!(events_b.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_connections_between_the_same_pair() {
    let mut pair = start_pair(fast_config()).await;
    let (first, _events_a1, mut events_b1) = establish(&mut pair).await;
    assert_eq!(first, 6);

    // second handshake: initiator prime 3, responder prime 5
    let (observer_a, mut events_a) = ChannelObserver::new();
    let (conn_id, _acked) = pair.a.connect(2, 0, observer_a).await.unwrap();
    assert_eq!(conn_id, 3);

    let second = match timeout(STEP, events_a.recv()).await.unwrap().unwrap() {
        ConnectionEvent::Connected(id) => id,
        other => panic!("expected Connected, got {:?}", other),
    };
    assert_eq!(second, 15);

    let (established_id, _) = timeout(STEP, pair.established_b.recv()).await.unwrap().unwrap();
    assert_eq!(established_id, 15);
    let (observer_b2, mut events_b2) = ChannelObserver::new();
    pair.b.set_observer(15, observer_b2).unwrap();

    // traffic on the two connections stays separate
    let d1 = pair
        .a
        .send(6, Bytes::from_static(b"on six"), MessageFormat::Json, 0, true)
        .await
        .unwrap();
    let d2 = pair
        .a
        .send(15, Bytes::from_static(b"on fifteen"), MessageFormat::Json, 0, true)
        .await
        .unwrap();

    match timeout(STEP, events_b1.recv()).await.unwrap().unwrap() {
        ConnectionEvent::Message(msg) => {
            assert_eq!(msg.conn_id, 6);
            assert_eq!(msg.payload.as_ref(), b"on six");
        }
        other => panic!("expected Message, got {:?}", other),
    }
    match timeout(STEP, events_b2.recv()).await.unwrap().unwrap() {
        ConnectionEvent::Message(msg) => {
            assert_eq!(msg.conn_id, 15);
            assert_eq!(msg.payload.as_ref(), b"on fifteen");
        }
        other => panic!("expected Message, got {:?}", other),
    }
    timeout(STEP, d1).await.unwrap().unwrap();
    timeout(STEP, d2).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_tears_down_and_notifies() {
    let mut pair = start_pair(fast_config()).await;
    let (combined, mut events_a, _events_b) = establish(&mut pair).await;

    pair.a.close(combined);
    match timeout(STEP, events_a.recv()).await.unwrap().unwrap() {
        ConnectionEvent::Disconnected => {}
        other => panic!("expected Disconnected, got {:?}", other),
    }

    // sending on the closed connection fails synchronously
    let result = pair
        .a
        .send(combined, Bytes::from_static(b"x"), MessageFormat::Json, 0, false)
        .await;
    assert!(result.is_err());
}
