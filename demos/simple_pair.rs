//! Two devices talking over UDP on localhost: device 1 dials device 2, and once the
//! connection is established both directions exchange a greeting.
//!
//! Run with `cargo run --example simple_pair`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use eminent::config::{SdkConfig, ValidationConfig};
use eminent::framing::FrameLimits;
use eminent::physical::UdpPhysical;
use eminent::sdk::EminentSdk;
use eminent::types::{
    ConnectionEvent, ConnectionId, ConnectionObserver, DeviceId, MessageFormat, SdkHost,
};

struct PrintingObserver {
    name: &'static str,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionObserver for PrintingObserver {
    fn on_event(&self, event: ConnectionEvent) {
        match &event {
            ConnectionEvent::Connected(id) => println!("[{}] connected on {}", self.name, id),
            ConnectionEvent::Disconnected => println!("[{}] disconnected", self.name),
            ConnectionEvent::Trouble(reason) => println!("[{}] trouble: {}", self.name, reason),
            ConnectionEvent::Message(msg) => println!(
                "[{}] message on {}: {}",
                self.name,
                msg.conn_id,
                String::from_utf8_lossy(&msg.payload)
            ),
        }
        let _ = self.events.send(event);
    }
}

struct AcceptingHost {
    name: &'static str,
    established: mpsc::UnboundedSender<(ConnectionId, DeviceId)>,
}

impl SdkHost for AcceptingHost {
    fn decide_incoming(&self, remote: DeviceId, _raw_payload: &[u8]) -> bool {
        println!("[{}] accepting handshake from device {}", self.name, remote);
        true
    }

    fn on_established(&self, conn_id: ConnectionId, remote: DeviceId) {
        println!(
            "[{}] connection {} with device {} established",
            self.name, conn_id, remote
        );
        let _ = self.established.send((conn_id, remote));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = SdkConfig::default();
    let recv_buf = FrameLimits::new(&ValidationConfig::default()).max_datagram_len;

    let physical_1 = Arc::new(UdpPhysical::bind(40_801, "127.0.0.1:40802".parse()?, recv_buf).await?);
    let physical_2 = Arc::new(UdpPhysical::bind(40_802, "127.0.0.1:40801".parse()?, recv_buf).await?);

    let (established_tx, _established_rx) = mpsc::unbounded_channel();
    let device_1 = EminentSdk::start(
        1,
        config.clone(),
        Arc::new(AcceptingHost {
            name: "device 1",
            established: established_tx,
        }),
        physical_1,
    )
    .await?;

    let (established_tx_2, mut established_rx_2) = mpsc::unbounded_channel();
    let device_2 = EminentSdk::start(
        2,
        config,
        Arc::new(AcceptingHost {
            name: "device 2",
            established: established_tx_2,
        }),
        physical_2,
    )
    .await?;

    let (events_tx_1, mut events_rx_1) = mpsc::unbounded_channel();
    let (conn_id, acked) = device_1
        .connect(
            2,
            0,
            Arc::new(PrintingObserver {
                name: "device 1",
                events: events_tx_1,
            }),
        )
        .await?;
    println!("[device 1] dialing on connection id {}", conn_id);

    acked.await?;
    let combined = loop {
        match events_rx_1.recv().await {
            Some(ConnectionEvent::Connected(id)) => break id,
            Some(_) => continue,
            None => anyhow::bail!("device 1 observer closed"),
        }
    };

    let (established_id, _) = established_rx_2
        .recv()
        .await
        .ok_or_else(|| anyhow::anyhow!("device 2 never established"))?;
    let (events_tx_2, mut events_rx_2) = mpsc::unbounded_channel();
    device_2.set_observer(
        established_id,
        Arc::new(PrintingObserver {
            name: "device 2",
            events: events_tx_2,
        }),
    )?;

    let delivered = device_1
        .send(
            combined,
            Bytes::from_static(br#"{"text": "hello from device 1"}"#),
            MessageFormat::Json,
            0,
            true,
        )
        .await?;
    delivered.await?;

    while let Some(event) = events_rx_2.recv().await {
        if matches!(event, ConnectionEvent::Message(_)) {
            break;
        }
    }

    let delivered_back = device_2
        .send(
            established_id,
            Bytes::from_static(br#"{"text": "hello back from device 2"}"#),
            MessageFormat::Json,
            0,
            true,
        )
        .await?;
    delivered_back.await?;

    while let Some(event) = events_rx_1.recv().await {
        if matches!(event, ConnectionEvent::Message(_)) {
            break;
        }
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    device_1.close(combined);
    device_2.close(established_id);
    device_1.shutdown();
    device_2.shutdown();
    Ok(())
}
