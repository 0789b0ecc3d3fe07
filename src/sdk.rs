use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail};
use bytes::Bytes;
use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::{SdkConfig, ValidationConfig};
use crate::framing::{FrameLimits, FramingLayer};
use crate::handshake::{HandshakePayload, PrimeAllocator};
use crate::physical::PhysicalTransport;
use crate::session::{SessionManager, SessionUpcall};
use crate::transport::{TransportCodec, TransportLayer};
use crate::types::{
    ConnectionEvent, ConnectionId, ConnectionObserver, ConnectionStatus, DeliveryReceiver,
    DeviceId, Message, MessageFormat, MessageId, Priority, SdkHost,
};

/// One entry of the connection table. The single observer replaces the per-callback slots
///  of a classic callback-soup connection record; events are delivered as
///  [ConnectionEvent] values.
struct Connection {
    id: ConnectionId,
    remote_id: DeviceId,
    default_priority: Priority,
    status: ConnectionStatus,
    special_code: u32,
    observer: Option<Arc<dyn ConnectionObserver>>,
}

/// Snapshot of one connection for diagnostics.
#[derive(Debug, Clone)]
pub struct ConnectionSummary {
    pub id: ConnectionId,
    pub remote_id: DeviceId,
    pub default_priority: Priority,
    pub status: ConnectionStatus,
    pub special_code: u32,
    pub has_observer: bool,
}

/// Snapshot of the whole SDK instance for diagnostics.
#[derive(Debug, Clone)]
pub struct SdkSummary {
    pub device_id: DeviceId,
    pub total_connections: usize,
    pub active_connections: usize,
    pub connections: Vec<ConnectionSummary>,
}

struct SdkInner {
    connections: FxHashMap<ConnectionId, Connection>,
    primes: PrimeAllocator,
    next_message_id: u64,
}

impl SdkInner {
    fn allocate_message_id(&mut self, validation: &ValidationConfig) -> anyhow::Result<MessageId> {
        if self.next_message_id > ValidationConfig::max_value(validation.message_id_bits) {
            bail!("unable to allocate message id: range exhausted");
        }
        let id = self.next_message_id as MessageId;
        self.next_message_id += 1;
        Ok(id)
    }
}

/// The SDK facade: this is the place where all parts of the protocol stack come together.
///
/// One instance per device multiplexes any number of logical connections over a single
///  datagram endpoint. The stack underneath is a linear pipeline of worker tasks
///  (session -> codec -> framing -> physical) joined by bounded channels in both
///  directions; the facade owns the connection table and drives the handshake state
///  machine from the dispatch worker.
pub struct EminentSdk {
    config: Arc<SdkConfig>,
    device_id: DeviceId,
    inner: Arc<Mutex<SdkInner>>,
    msg_tx: mpsc::Sender<Message>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EminentSdk {
    /// Validates the configuration and the local device id, spins up the worker tasks and
    ///  returns the running SDK.
    pub async fn start(
        self_id: DeviceId,
        config: SdkConfig,
        host: Arc<dyn SdkHost>,
        physical: Arc<dyn PhysicalTransport>,
    ) -> anyhow::Result<Arc<EminentSdk>> {
        config.validate()?;
        config.validation.validate_device_id(self_id)?;
        let config = Arc::new(config);
        let cap = config.queue_capacity;

        let (msg_tx, msg_rx) = mpsc::channel(cap);
        let (pkg_out_tx, pkg_out_rx) = mpsc::channel(cap);
        let (frame_out_tx, frame_out_rx) = mpsc::channel(cap);
        let (datagram_out_tx, mut datagram_out_rx) = mpsc::channel(cap);
        let (datagram_in_tx, datagram_in_rx) = mpsc::channel(cap);
        let (frame_in_tx, frame_in_rx) = mpsc::channel(cap);
        let (pkg_in_tx, pkg_in_rx) = mpsc::channel(cap);
        let (upcall_tx, upcall_rx) = mpsc::channel(cap);

        let session = SessionManager::new(config.clone(), msg_rx, pkg_in_rx, pkg_out_tx, upcall_tx);
        let transport = TransportLayer::new(
            TransportCodec::new(config.validation.clone()),
            pkg_out_rx,
            frame_out_tx,
            frame_in_rx,
            pkg_in_tx,
        );
        let framing = FramingLayer::new(
            FrameLimits::new(&config.validation),
            frame_out_rx,
            datagram_out_tx,
            datagram_in_rx,
            frame_in_tx,
        );

        let inner = Arc::new(Mutex::new(SdkInner {
            connections: FxHashMap::default(),
            primes: PrimeAllocator::default(),
            next_message_id: 1,
        }));

        let mut workers = vec![
            tokio::spawn(session.run()),
            tokio::spawn(transport.run()),
            tokio::spawn(framing.run()),
        ];

        let send_physical = physical.clone();
        workers.push(tokio::spawn(async move {
            while let Some(datagram) = datagram_out_rx.recv().await {
                if let Err(e) = send_physical.send_datagram(&datagram).await {
                    warn!("error sending datagram: {}", e);
                }
            }
            trace!("datagram send pump shutting down");
        }));

        workers.push(tokio::spawn(async move {
            loop {
                match physical.recv_datagram().await {
                    Ok(datagram) => {
                        if datagram_in_tx.send(datagram).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("datagram transport closed: {}", e);
                        break;
                    }
                }
            }
            trace!("datagram receive pump shutting down");
        }));

        let dispatcher = Dispatcher {
            config: config.clone(),
            device_id: self_id,
            inner: inner.clone(),
            msg_tx: msg_tx.clone(),
            host,
            upcall_rx,
        };
        workers.push(tokio::spawn(dispatcher.run()));

        info!("SDK started for device {}", self_id);
        Ok(Arc::new(EminentSdk {
            config,
            device_id: self_id,
            inner,
            msg_tx,
            workers: Mutex::new(workers),
        }))
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// Starts an outbound handshake towards `target`. Returns the prime connection id the
    ///  connection is initially keyed under (it is re-keyed to the prime product once the
    ///  responder answers) and a receiver that resolves when the handshake request has been
    ///  acknowledged by the peer. The observer sees `Connected` when the connection reaches
    ///  ACTIVE, and every message delivered on it afterwards.
    pub async fn connect(
        &self,
        target: DeviceId,
        default_priority: Priority,
        observer: Arc<dyn ConnectionObserver>,
    ) -> anyhow::Result<(ConnectionId, DeliveryReceiver)> {
        self.config.validation.validate_device_id(target)?;
        self.config.validation.validate_priority(default_priority)?;

        let (acked_tx, acked_rx) = oneshot::channel();
        let (conn_id, message) = {
            let mut inner = self.inner.lock().expect("sdk lock poisoned");
            let conn_id = inner.primes.next_prime(&self.config.validation)?;
            let special_code = generate_special_code(&self.config.validation);
            let message_id = inner.allocate_message_id(&self.config.validation)?;

            inner.connections.insert(
                conn_id,
                Connection {
                    id: conn_id,
                    remote_id: target,
                    default_priority,
                    status: ConnectionStatus::Pending,
                    special_code,
                    observer: Some(observer),
                },
            );

            let message = Message {
                id: message_id,
                conn_id,
                payload: HandshakePayload::request(self.device_id as u64, special_code as u64)
                    .encode(),
                format: MessageFormat::Handshake,
                priority: default_priority,
                require_ack: true,
                delivered: Some(acked_tx),
            };
            (conn_id, message)
        };

        if let Err(e) = self.config.validation.validate_message(&message) {
            self.inner.lock().expect("sdk lock poisoned").connections.remove(&conn_id);
            return Err(e);
        }
        if self.msg_tx.send(message).await.is_err() {
            self.inner.lock().expect("sdk lock poisoned").connections.remove(&conn_id);
            bail!("session layer is not running");
        }

        info!(
            "initiating handshake to device {} on connection id {}",
            target, conn_id
        );
        Ok((conn_id, acked_rx))
    }

    /// Queues a message on an established connection. The returned receiver resolves when
    ///  every package of the message has been acknowledged - immediately after enqueueing
    ///  when `require_ack` is false - and is dropped unresolved when delivery is abandoned.
    pub async fn send(
        &self,
        conn_id: ConnectionId,
        payload: Bytes,
        format: MessageFormat,
        priority: Priority,
        require_ack: bool,
    ) -> anyhow::Result<DeliveryReceiver> {
        let (delivered_tx, delivered_rx) = oneshot::channel();
        let message = {
            let mut inner = self.inner.lock().expect("sdk lock poisoned");
            let status = match inner.connections.get(&conn_id) {
                Some(conn) => conn.status,
                None => bail!("send failed: unknown connection id {}", conn_id),
            };
            if status == ConnectionStatus::Pending {
                bail!("send failed: connection {} is still pending", conn_id);
            }
            self.config.validation.validate_priority(priority)?;

            Message {
                id: inner.allocate_message_id(&self.config.validation)?,
                conn_id,
                payload,
                format,
                priority,
                require_ack,
                delivered: Some(delivered_tx),
            }
        };
        self.config.validation.validate_message(&message)?;

        let message_id = message.id;
        if self.msg_tx.send(message).await.is_err() {
            bail!("session layer is not running");
        }
        debug!("queued message id={} on connection {}", message_id, conn_id);
        Ok(delivered_rx)
    }

    /// Removes the connection and tells its observer. Unknown ids are ignored.
    pub fn close(&self, conn_id: ConnectionId) {
        let removed = self
            .inner
            .lock()
            .expect("sdk lock poisoned")
            .connections
            .remove(&conn_id);
        if let Some(conn) = removed {
            if let Some(observer) = &conn.observer {
                observer.on_event(ConnectionEvent::Disconnected);
            }
            info!("connection {} closed", conn_id);
        }
    }

    pub fn set_default_priority(
        &self,
        conn_id: ConnectionId,
        priority: Priority,
    ) -> anyhow::Result<()> {
        self.config.validation.validate_priority(priority)?;
        let mut inner = self.inner.lock().expect("sdk lock poisoned");
        let conn = inner
            .connections
            .get_mut(&conn_id)
            .ok_or_else(|| anyhow!("connection {} not found", conn_id))?;
        conn.default_priority = priority;
        debug!("connection {} default priority set to {}", conn_id, priority);
        Ok(())
    }

    /// Attaches (or replaces) the observer of a connection - the responder side starts
    ///  without one and typically attaches it from the establishment callback.
    pub fn set_observer(
        &self,
        conn_id: ConnectionId,
        observer: Arc<dyn ConnectionObserver>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("sdk lock poisoned");
        let conn = inner
            .connections
            .get_mut(&conn_id)
            .ok_or_else(|| anyhow!("connection {} not found", conn_id))?;
        conn.observer = Some(observer);
        Ok(())
    }

    pub fn summary(&self) -> SdkSummary {
        let inner = self.inner.lock().expect("sdk lock poisoned");
        let connections: Vec<ConnectionSummary> = inner
            .connections
            .values()
            .map(|conn| ConnectionSummary {
                id: conn.id,
                remote_id: conn.remote_id,
                default_priority: conn.default_priority,
                status: conn.status,
                special_code: conn.special_code,
                has_observer: conn.observer.is_some(),
            })
            .collect();
        let active = connections
            .iter()
            .filter(|c| c.status == ConnectionStatus::Active)
            .count();
        SdkSummary {
            device_id: self.device_id,
            total_connections: connections.len(),
            active_connections: active,
            connections,
        }
    }

    /// Stops all worker tasks. Messages whose delivery notification has not fired are
    ///  abandoned; their receivers observe cancellation.
    pub fn shutdown(&self) {
        for handle in self.workers.lock().expect("sdk lock poisoned").drain(..) {
            handle.abort();
        }
        debug!("SDK workers for device {} stopped", self.device_id);
    }
}

impl Drop for EminentSdk {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn generate_special_code(validation: &ValidationConfig) -> u32 {
    let max = ValidationConfig::max_value(validation.special_code_bits);
    rand::thread_rng().gen_range(0..=max) as u32
}

/// The shared connection id of an established link is the product of the two independently
///  chosen primes; the handshake fails if the product does not fit the configured width.
fn combined_id(
    initiator: ConnectionId,
    responder: ConnectionId,
    validation: &ValidationConfig,
) -> anyhow::Result<ConnectionId> {
    let product = initiator as u64 * responder as u64;
    let id = ConnectionId::try_from(product)
        .map_err(|_| anyhow!("combined connection id {} overflows the platform integer", product))?;
    validation.validate_connection_id(id)?;
    Ok(id)
}

/// The protocol worker behind the facade: consumes session upcalls, advances the handshake
///  state machine, and forwards data messages and trouble to the per-connection observers.
struct Dispatcher {
    config: Arc<SdkConfig>,
    device_id: DeviceId,
    inner: Arc<Mutex<SdkInner>>,
    msg_tx: mpsc::Sender<Message>,
    host: Arc<dyn SdkHost>,
    upcall_rx: mpsc::Receiver<SessionUpcall>,
}

impl Dispatcher {
    async fn run(mut self) {
        while let Some(upcall) = self.upcall_rx.recv().await {
            match upcall {
                SessionUpcall::Deliver(msg) => self.on_message(msg).await,
                SessionUpcall::Trouble { conn_id, reason } => self.on_trouble(conn_id, reason),
            }
        }
        trace!("dispatch worker shutting down");
    }

    fn on_trouble(&self, conn_id: ConnectionId, reason: String) {
        let observer = self.observer_of(conn_id);
        match observer {
            Some(observer) => observer.on_event(ConnectionEvent::Trouble(reason)),
            None => warn!("trouble on connection {} without observer: {}", conn_id, reason),
        }
    }

    fn observer_of(&self, conn_id: ConnectionId) -> Option<Arc<dyn ConnectionObserver>> {
        self.inner
            .lock()
            .expect("sdk lock poisoned")
            .connections
            .get(&conn_id)
            .and_then(|conn| conn.observer.clone())
    }

    async fn on_message(&mut self, msg: Message) {
        debug!("message received: {:?}", msg);
        match msg.format {
            MessageFormat::Handshake => self.on_handshake(msg).await,
            MessageFormat::Confirmation => {
                warn!("confirmation message surfaced above the session layer - ignoring")
            }
            MessageFormat::Json | MessageFormat::Video => self.deliver(msg),
        }
    }

    fn deliver(&self, msg: Message) {
        let known = {
            let inner = self.inner.lock().expect("sdk lock poisoned");
            inner.connections.contains_key(&msg.conn_id)
        };
        if !known {
            warn!("message for unknown connection id {} - dropping", msg.conn_id);
            return;
        }
        match self.observer_of(msg.conn_id) {
            Some(observer) => observer.on_event(ConnectionEvent::Message(msg)),
            None => warn!("no observer attached to connection {} - dropping message", msg.conn_id),
        }
    }

    async fn on_handshake(&mut self, msg: Message) {
        let payload = match HandshakePayload::decode(&msg.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to parse handshake payload: {}", e);
                return;
            }
        };

        if payload.final_confirmation == Some(true) {
            self.on_final_confirmation(msg, payload);
        } else if payload.new_id.is_some() {
            self.on_handshake_response(msg, payload).await;
        } else {
            self.on_handshake_request(msg, payload).await;
        }
    }

    fn checked_device_id(&self, raw: u64) -> anyhow::Result<DeviceId> {
        let id = DeviceId::try_from(raw).map_err(|_| anyhow!("device id {} out of range", raw))?;
        self.config.validation.validate_device_id(id)?;
        Ok(id)
    }

    fn checked_special_code(&self, raw: u64) -> anyhow::Result<u32> {
        let code = u32::try_from(raw).map_err(|_| anyhow!("special code {} out of range", raw))?;
        self.config.validation.validate_special_code(code)?;
        Ok(code)
    }

    fn checked_connection_id(&self, raw: u64) -> anyhow::Result<ConnectionId> {
        let id = ConnectionId::try_from(raw)
            .map_err(|_| anyhow!("connection id {} out of range", raw))?;
        self.config.validation.validate_connection_id(id)?;
        Ok(id)
    }

    /// First leg, responder side: consult the host, pick our own prime, record the
    ///  connection under the prime product in state ACCEPTED and answer with `newId`.
    async fn on_handshake_request(&mut self, msg: Message, payload: HandshakePayload) {
        let validation = self.config.validation.clone();
        let (remote, special_code) = match (
            validation.validate_connection_id(msg.conn_id),
            self.checked_device_id(payload.device_id),
            self.checked_special_code(payload.special_code),
        ) {
            (Ok(()), Ok(remote), Ok(code)) => (remote, code),
            (conn, device, code) => {
                warn!(
                    "handshake request rejected: {}",
                    [
                        conn.err().map(|e| e.to_string()),
                        device.err().map(|e| e.to_string()),
                        code.err().map(|e| e.to_string()),
                    ]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join("; ")
                );
                return;
            }
        };

        if !self.host.decide_incoming(remote, &msg.payload) {
            info!("handshake on connection {} rejected by host decision", msg.conn_id);
            return;
        }

        let response = {
            let mut inner = self.inner.lock().expect("sdk lock poisoned");
            // never echo the initiator's own prime: the squared product would collide with
            //  the id a simultaneous reverse-direction handshake of the same pair derives
            let my_prime = loop {
                match inner.primes.next_prime(&validation) {
                    Ok(prime) if prime != msg.conn_id => break prime,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("cannot answer handshake: {}", e);
                        return;
                    }
                }
            };
            let combined = match combined_id(msg.conn_id, my_prime, &validation) {
                Ok(combined) => combined,
                Err(e) => {
                    warn!("handshake combined connection id invalid: {}", e);
                    return;
                }
            };
            if inner.connections.contains_key(&combined) {
                warn!(
                    "handshake combined connection id {} collides with an existing connection - dropping",
                    combined
                );
                return;
            }

            inner.connections.insert(
                combined,
                Connection {
                    id: combined,
                    remote_id: remote,
                    default_priority: 0,
                    status: ConnectionStatus::Accepted,
                    special_code,
                    observer: None,
                },
            );
            debug!("connection {} created in state ACCEPTED", combined);

            let message_id = match inner.allocate_message_id(&validation) {
                Ok(id) => id,
                Err(e) => {
                    warn!("failed to queue handshake response: {}", e);
                    inner.connections.remove(&combined);
                    return;
                }
            };
            Message {
                id: message_id,
                conn_id: msg.conn_id,
                payload: HandshakePayload::response(
                    self.device_id as u64,
                    special_code as u64,
                    my_prime as u64,
                )
                .encode(),
                format: MessageFormat::Handshake,
                priority: 0,
                require_ack: false,
                delivered: None,
            }
        };

        if self.msg_tx.send(response).await.is_err() {
            warn!("session layer gone - cannot answer handshake");
        }
    }

    /// Second leg, initiator side: re-key the pending connection to the prime product,
    ///  upgrade it to ACTIVE and confirm to the responder.
    async fn on_handshake_response(&mut self, msg: Message, payload: HandshakePayload) {
        let validation = self.config.validation.clone();
        let new_id = payload.new_id.expect("dispatch guarantees newId is present");
        let (remote, special_code, responder_prime) = match (
            validation.validate_connection_id(msg.conn_id),
            self.checked_device_id(payload.device_id),
            self.checked_special_code(payload.special_code),
            self.checked_connection_id(new_id),
        ) {
            (Ok(()), Ok(remote), Ok(code), Ok(prime)) => (remote, code, prime),
            _ => {
                warn!("handshake response invalid - dropping");
                return;
            }
        };

        let (confirmation, observer, combined) = {
            let mut inner = self.inner.lock().expect("sdk lock poisoned");
            let Some(mut conn) = inner.connections.remove(&msg.conn_id) else {
                warn!("handshake response for unknown connection id {}", msg.conn_id);
                return;
            };
            let observer = conn.observer.clone();

            let combined = match combined_id(msg.conn_id, responder_prime, &validation) {
                Ok(combined) if !inner.connections.contains_key(&combined) => combined,
                Ok(combined) => {
                    warn!(
                        "handshake combined connection id {} collides with an existing connection",
                        combined
                    );
                    conn.status = ConnectionStatus::Failed;
                    inner.connections.insert(msg.conn_id, conn);
                    drop(inner);
                    if let Some(observer) = observer {
                        observer.on_event(ConnectionEvent::Trouble(format!(
                            "handshake failed: combined connection id {} already in use",
                            combined
                        )));
                    }
                    return;
                }
                Err(e) => {
                    warn!("handshake response combined connection id invalid: {}", e);
                    conn.status = ConnectionStatus::Failed;
                    inner.connections.insert(msg.conn_id, conn);
                    drop(inner);
                    if let Some(observer) = observer {
                        observer.on_event(ConnectionEvent::Trouble(format!(
                            "handshake failed: {}",
                            e
                        )));
                    }
                    return;
                }
            };

            conn.id = combined;
            conn.remote_id = remote;
            conn.special_code = special_code;
            conn.status = ConnectionStatus::Active;
            inner.connections.insert(combined, conn);
            info!("connection {} is now ACTIVE", combined);

            let message_id = match inner.allocate_message_id(&validation) {
                Ok(id) => id,
                Err(e) => {
                    warn!("failed to queue final handshake confirmation: {}", e);
                    inner.connections.remove(&combined);
                    return;
                }
            };
            let confirmation = Message {
                id: message_id,
                conn_id: combined,
                payload: HandshakePayload::confirmation(self.device_id as u64, special_code as u64)
                    .encode(),
                format: MessageFormat::Handshake,
                priority: 0,
                require_ack: false,
                delivered: None,
            };
            (confirmation, observer, combined)
        };

        if let Some(observer) = &observer {
            observer.on_event(ConnectionEvent::Connected(combined));
        }
        if self.msg_tx.send(confirmation).await.is_err() {
            warn!("session layer gone - cannot confirm handshake");
        }
    }

    /// Third leg, responder side: upgrade ACCEPTED to ACTIVE. Repeats are tolerated - the
    ///  establishment callback fires only on the first transition.
    fn on_final_confirmation(&mut self, msg: Message, payload: HandshakePayload) {
        let (remote, special_code) = match (
            self.config.validation.validate_connection_id(msg.conn_id),
            self.checked_device_id(payload.device_id),
            self.checked_special_code(payload.special_code),
        ) {
            (Ok(()), Ok(remote), Ok(code)) => (remote, code),
            _ => {
                warn!("final confirmation invalid - dropping");
                return;
            }
        };

        let (observer, newly_established, conn_id) = {
            let mut inner = self.inner.lock().expect("sdk lock poisoned");
            let Some(conn) = inner.connections.get_mut(&msg.conn_id) else {
                warn!("final confirmation for unknown connection id {}", msg.conn_id);
                return;
            };
            conn.remote_id = remote;
            conn.special_code = special_code;
            let was_active = conn.status == ConnectionStatus::Active;
            conn.status = ConnectionStatus::Active;
            (conn.observer.clone(), !was_active, conn.id)
        };

        if newly_established {
            info!("connection {} marked ACTIVE after final confirmation", conn_id);
            self.host.on_established(conn_id, remote);
        }
        if let Some(observer) = observer {
            observer.on_event(ConnectionEvent::Connected(conn_id));
        }
    }
}
