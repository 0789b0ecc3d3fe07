use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{error, trace};

use crate::types::DeviceId;

/// The datagram transport underneath the protocol stack: one datagram per sealed frame, no
///  ordering or delivery guarantees. Introduced as a capability trait so the stack can run
///  over UDP in production and over an in-memory medium in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PhysicalTransport: Send + Sync + 'static {
    async fn send_datagram(&self, datagram: &[u8]) -> anyhow::Result<()>;

    /// Blocks until the next datagram arrives. `Err` means the transport is closed for good;
    ///  implementations deal with transient conditions internally.
    async fn recv_datagram(&self) -> anyhow::Result<Vec<u8>>;
}

/// Point-to-point UDP endpoint: binds a local port and addresses every outgoing datagram to
///  one fixed remote.
pub struct UdpPhysical {
    socket: UdpSocket,
    remote: SocketAddr,
    recv_buf_len: usize,
}

impl UdpPhysical {
    pub async fn bind(
        local_port: u16,
        remote: SocketAddr,
        recv_buf_len: usize,
    ) -> anyhow::Result<UdpPhysical> {
        let socket = UdpSocket::bind(("0.0.0.0", local_port)).await?;
        trace!("bound datagram socket to {:?}", socket.local_addr()?);
        Ok(UdpPhysical {
            socket,
            remote,
            recv_buf_len,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl PhysicalTransport for UdpPhysical {
    async fn send_datagram(&self, datagram: &[u8]) -> anyhow::Result<()> {
        let sent = self.socket.send_to(datagram, self.remote).await?;
        if sent != datagram.len() {
            bail!("short UDP send: {} of {} bytes", sent, datagram.len());
        }
        Ok(())
    }

    async fn recv_datagram(&self) -> anyhow::Result<Vec<u8>> {
        let mut buf = vec![0u8; self.recv_buf_len];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    trace!("received {} byte datagram from {:?}", len, from);
                    buf.truncate(len);
                    return Ok(buf);
                }
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            }
        }
    }
}

/// A broadcast medium connecting several in-process devices: every datagram one participant
///  sends is delivered to all others. Stands in for the network in tests and demos.
#[derive(Default)]
pub struct InMemoryMedium {
    participants: Mutex<FxHashMap<DeviceId, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl InMemoryMedium {
    pub fn new() -> Arc<InMemoryMedium> {
        Arc::new(InMemoryMedium::default())
    }

    /// Registers a participant and returns its endpoint. At most one endpoint per device id.
    pub fn attach(self: &Arc<Self>, device: DeviceId) -> anyhow::Result<InMemoryPhysical> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut participants = self.participants.lock().expect("medium lock poisoned");
        if participants.contains_key(&device) {
            bail!("device {} is already attached to the medium", device);
        }
        participants.insert(device, tx);
        Ok(InMemoryPhysical {
            medium: self.clone(),
            self_id: device,
            inbox: tokio::sync::Mutex::new(rx),
        })
    }

    fn broadcast(&self, from: DeviceId, datagram: &[u8]) {
        let participants = self.participants.lock().expect("medium lock poisoned");
        for (&device, inbox) in participants.iter() {
            if device == from {
                continue;
            }
            // a closed inbox just means that participant is gone
            let _ = inbox.send(datagram.to_vec());
        }
    }

    fn detach(&self, device: DeviceId) {
        self.participants
            .lock()
            .expect("medium lock poisoned")
            .remove(&device);
    }
}

/// One participant's endpoint on an [InMemoryMedium].
pub struct InMemoryPhysical {
    medium: Arc<InMemoryMedium>,
    self_id: DeviceId,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl Drop for InMemoryPhysical {
    fn drop(&mut self) {
        self.medium.detach(self.self_id);
    }
}

#[async_trait]
impl PhysicalTransport for InMemoryPhysical {
    async fn send_datagram(&self, datagram: &[u8]) -> anyhow::Result<()> {
        self.medium.broadcast(self.self_id, datagram);
        Ok(())
    }

    async fn recv_datagram(&self) -> anyhow::Result<Vec<u8>> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| anyhow!("in-memory medium closed"))
    }
}
