use std::sync::Arc;

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::config::{SdkConfig, ValidationConfig};
use crate::types::{
    ConnectionId, DeliveryNotifier, Message, MessageFormat, MessageId, Package, PackageId,
    PackageStatus, Priority,
};

/// Traffic from the session layer up to the SDK facade: fully reassembled messages, and
///  trouble conditions that belong to a specific connection.
#[derive(Debug)]
pub enum SessionUpcall {
    Deliver(Message),
    Trouble {
        conn_id: ConnectionId,
        reason: String,
    },
}

/// Acknowledgement body carried in a CONFIRMATION package.
#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct AckPayload {
    #[serde(rename = "ackPackageId")]
    ack_package_id: u64,
}

/// One unacknowledged package retained for retransmission.
#[derive(Debug)]
struct PendingPackage {
    pkg: Package,
    last_sent: Instant,
    attempts: u32,
}

/// A message sent with `require_ack` whose packages are not all acknowledged yet.
#[derive(Debug)]
struct PendingMessage {
    conn_id: ConnectionId,
    delivered: Option<DeliveryNotifier>,
    packages: FxHashMap<PackageId, PendingPackage>,
}

/// The session layer: fragments outgoing messages into packages, allocates package ids,
///  tracks in-flight packages and retransmits them on a timer, emits and absorbs
///  acknowledgements, and reassembles inbound fragments into whole messages.
///
/// All state is owned by the single worker task; the bounded channels at both edges are the
///  only thing shared with the adjacent layers.
pub struct SessionManager {
    config: Arc<SdkConfig>,
    msg_rx: mpsc::Receiver<Message>,
    pkg_in_rx: mpsc::Receiver<Package>,
    pkg_out_tx: mpsc::Sender<Package>,
    upcall_tx: mpsc::Sender<SessionUpcall>,

    next_package_id: u64,
    /// ack message ids are allocated downward from the top of the message id range so they
    ///  never collide with the ascending data message ids
    next_ack_message_id: u64,
    pending_messages: FxHashMap<MessageId, PendingMessage>,
    package_to_message: FxHashMap<PackageId, MessageId>,
    reassembly: FxHashMap<MessageId, Vec<Package>>,
}

impl SessionManager {
    pub fn new(
        config: Arc<SdkConfig>,
        msg_rx: mpsc::Receiver<Message>,
        pkg_in_rx: mpsc::Receiver<Package>,
        pkg_out_tx: mpsc::Sender<Package>,
        upcall_tx: mpsc::Sender<SessionUpcall>,
    ) -> SessionManager {
        let next_ack_message_id = ValidationConfig::max_value(config.validation.message_id_bits);
        SessionManager {
            config,
            msg_rx,
            pkg_in_rx,
            pkg_out_tx,
            upcall_tx,
            next_package_id: 1,
            next_ack_message_id,
            pending_messages: FxHashMap::default(),
            package_to_message: FxHashMap::default(),
            reassembly: FxHashMap::default(),
        }
    }

    pub async fn run(mut self) {
        let mut tick = interval(self.config.session_tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                msg = self.msg_rx.recv() => match msg {
                    Some(msg) => self.process_outgoing(msg).await,
                    None => break,
                },
                pkg = self.pkg_in_rx.recv() => match pkg {
                    Some(pkg) => self.process_incoming(pkg).await,
                    None => break,
                },
                _ = tick.tick() => self.retransmit_due(Instant::now()).await,
            }
        }
        trace!("session worker shutting down");
    }

    async fn process_outgoing(&mut self, mut msg: Message) {
        if let Err(e) = self.config.validation.validate_message(&msg) {
            warn!("dropping outgoing message due to validation failure: {}", e);
            return;
        }

        let max_packet = self.config.max_packet_size;
        let total = ((msg.payload.len() + max_packet - 1) / max_packet).max(1) as u32;

        if !self.fragments_fit(total) {
            warn!(
                "dropping message id={} because its {} fragments exceed the configured bit widths",
                msg.id, total
            );
            if let Some(notifier) = msg.delivered.take() {
                let _ = notifier.send(());
            }
            return;
        }

        let packages = match self.fragment_message(&msg, total) {
            Ok(packages) => packages,
            Err(e) => {
                warn!("message id={} could not be sent: {}", msg.id, e);
                let _ = self
                    .upcall_tx
                    .send(SessionUpcall::Trouble {
                        conn_id: msg.conn_id,
                        reason: format!("message {} could not be sent: {}", msg.id, e),
                    })
                    .await;
                return;
            }
        };

        if msg.require_ack {
            let now = Instant::now();
            let mut pending = PendingMessage {
                conn_id: msg.conn_id,
                delivered: msg.delivered.take(),
                packages: FxHashMap::default(),
            };
            for pkg in &packages {
                let mut retained = pkg.clone();
                retained.status = PackageStatus::Sent;
                pending.packages.insert(
                    pkg.package_id,
                    PendingPackage {
                        pkg: retained,
                        last_sent: now,
                        attempts: 1,
                    },
                );
                self.package_to_message.insert(pkg.package_id, msg.id);
            }
            self.pending_messages.insert(msg.id, pending);
        }

        for pkg in packages {
            if self.pkg_out_tx.send(pkg).await.is_err() {
                warn!("transport layer gone - discarding outgoing package");
            }
        }

        // without an ack requirement the message counts as delivered once it is enqueued
        if let Some(notifier) = msg.delivered.take() {
            let _ = notifier.send(());
        }
    }

    fn fragment_message(&mut self, msg: &Message, total: u32) -> anyhow::Result<Vec<Package>> {
        let max_packet = self.config.max_packet_size;
        let mut packages = Vec::with_capacity(total as usize);
        for frag in 0..total {
            let start = frag as usize * max_packet;
            let end = (start + max_packet).min(msg.payload.len());
            let pkg = Package {
                package_id: self.allocate_package_id()?,
                message_id: msg.id,
                conn_id: msg.conn_id,
                fragment_id: frag,
                fragments_count: total,
                payload: msg.payload.slice(start..end),
                format: msg.format,
                priority: msg.priority,
                require_ack: msg.require_ack,
                status: PackageStatus::Queued,
            };
            self.config.validation.validate_package(&pkg)?;
            packages.push(pkg);
        }
        Ok(packages)
    }

    fn fragments_fit(&self, total: u32) -> bool {
        total as u64 <= ValidationConfig::max_value(self.config.validation.fragments_count_bits)
            && (total - 1) as u64 <= ValidationConfig::max_value(self.config.validation.fragment_id_bits)
    }

    /// Scans all pending packages; re-enqueues those whose retransmit interval elapsed, and
    ///  evicts those whose transmission budget is exhausted. A message whose last package is
    ///  evicted is dropped with a trouble event, and its delivery notification never fires.
    async fn retransmit_due(&mut self, now: Instant) {
        let retransmit_interval = self.config.retransmit_interval;
        let max_attempts = self.config.max_retransmit_attempts;

        let mut resends = Vec::new();
        let mut troubles = Vec::new();

        let package_index = &mut self.package_to_message;
        self.pending_messages.retain(|&message_id, pending| {
            let mut evicted = false;
            pending.packages.retain(|&package_id, info| {
                if now.duration_since(info.last_sent) < retransmit_interval {
                    return true;
                }
                if info.attempts >= max_attempts {
                    debug!(
                        "evicting package {} of message {} after reaching its retransmit budget",
                        package_id, message_id
                    );
                    package_index.remove(&package_id);
                    evicted = true;
                    return false;
                }
                info.attempts += 1;
                info.last_sent = now;
                resends.push(info.pkg.clone());
                true
            });

            if pending.packages.is_empty() {
                if evicted {
                    troubles.push((
                        pending.conn_id,
                        format!("message {} abandoned after retransmit budget was exhausted", message_id),
                    ));
                }
                return false;
            }
            true
        });

        for pkg in resends {
            trace!("retransmitting package id={}", pkg.package_id);
            if self.pkg_out_tx.send(pkg).await.is_err() {
                warn!("transport layer gone - discarding retransmission");
            }
        }
        for (conn_id, reason) in troubles {
            let _ = self
                .upcall_tx
                .send(SessionUpcall::Trouble { conn_id, reason })
                .await;
        }
    }

    async fn process_incoming(&mut self, pkg: Package) {
        if pkg.format == MessageFormat::Confirmation {
            self.handle_ack(pkg).await;
            return;
        }

        trace!(
            "received package id={} msg={} fragment={}/{}",
            pkg.package_id,
            pkg.message_id,
            pkg.fragment_id,
            pkg.fragments_count
        );

        if pkg.require_ack {
            self.send_ack_for(&pkg).await;
        }
        self.reassemble(pkg).await;
    }

    async fn send_ack_for(&mut self, pkg: &Package) {
        let max_priority = ValidationConfig::max_value(self.config.validation.priority_bits);
        let ack_priority = (pkg.priority as u64 + 1).min(max_priority) as Priority;

        match self.build_ack(pkg, ack_priority) {
            Ok(ack) => {
                if self.pkg_out_tx.send(ack).await.is_err() {
                    warn!("transport layer gone - discarding acknowledgement");
                }
            }
            Err(e) => {
                warn!("failed to enqueue ack for package {}: {}", pkg.package_id, e);
            }
        }
    }

    fn build_ack(&mut self, pkg: &Package, priority: Priority) -> anyhow::Result<Package> {
        let payload = serde_json::to_vec(&AckPayload {
            ack_package_id: pkg.package_id as u64,
        })?;
        let ack = Package {
            package_id: self.allocate_package_id()?,
            message_id: self.allocate_ack_message_id()?,
            conn_id: pkg.conn_id,
            fragment_id: 0,
            fragments_count: 1,
            payload: Bytes::from(payload),
            format: MessageFormat::Confirmation,
            priority,
            require_ack: false,
            status: PackageStatus::Queued,
        };
        self.config.validation.validate_package(&ack)?;
        Ok(ack)
    }

    async fn handle_ack(&mut self, pkg: Package) {
        let ack_id = match Self::parse_ack_payload(&pkg.payload) {
            Ok(id) => id,
            Err(e) => {
                warn!("failed to parse ack payload: {}", e);
                return;
            }
        };

        let Some(message_id) = self.package_to_message.remove(&ack_id) else {
            debug!("ack for unknown package id={} - ignoring", ack_id);
            return;
        };
        let Some(pending) = self.pending_messages.get_mut(&message_id) else {
            return;
        };
        pending.packages.remove(&ack_id);

        if pending.packages.is_empty() {
            let pending = self
                .pending_messages
                .remove(&message_id)
                .expect("pending message was just looked up");
            trace!("message {} fully acknowledged", message_id);
            if let Some(notifier) = pending.delivered {
                let _ = notifier.send(());
            }
        }
    }

    fn parse_ack_payload(payload: &[u8]) -> anyhow::Result<PackageId> {
        let ack: AckPayload = serde_json::from_slice(payload)?;
        if ack.ack_package_id == 0 || ack.ack_package_id > u32::MAX as u64 {
            bail!("ack package id {} out of range", ack.ack_package_id);
        }
        Ok(ack.ack_package_id as PackageId)
    }

    async fn reassemble(&mut self, pkg: Package) {
        let message_id = pkg.message_id;
        let fragments_count = pkg.fragments_count as usize;

        let buffered = self.reassembly.entry(message_id).or_default();
        buffered.push(pkg);
        trace!(
            "fragments buffered for message {}: {}/{}",
            message_id,
            buffered.len(),
            fragments_count
        );
        if buffered.len() < fragments_count {
            return;
        }

        let mut fragments = self
            .reassembly
            .remove(&message_id)
            .expect("reassembly entry was just filled");
        fragments.sort_by_key(|p| p.fragment_id);

        for (i, fragment) in fragments.iter().enumerate() {
            if fragment.fragment_id != i as u32 {
                warn!(
                    "fragment index mismatch for message {}: expected {}, got {}",
                    message_id, i, fragment.fragment_id
                );
                let _ = self
                    .upcall_tx
                    .send(SessionUpcall::Trouble {
                        conn_id: fragments[0].conn_id,
                        reason: format!("fragment mismatch while reassembling message {}", message_id),
                    })
                    .await;
                return;
            }
        }

        let mut payload = BytesMut::with_capacity(fragments.iter().map(|f| f.payload.len()).sum());
        for fragment in &fragments {
            payload.extend_from_slice(&fragment.payload);
        }

        let first = &fragments[0];
        let message = Message {
            id: message_id,
            conn_id: first.conn_id,
            payload: payload.freeze(),
            format: first.format,
            priority: first.priority,
            require_ack: first.require_ack,
            delivered: None,
        };
        debug!(
            "all fragments received - delivering message {} ({} bytes)",
            message_id,
            message.payload.len()
        );
        if self.upcall_tx.send(SessionUpcall::Deliver(message)).await.is_err() {
            warn!("dispatch worker gone - discarding reassembled message");
        }
    }

    fn allocate_package_id(&mut self) -> anyhow::Result<PackageId> {
        if self.next_package_id > ValidationConfig::max_value(self.config.validation.package_id_bits) {
            bail!("package id overflow: exceeds configured bit width");
        }
        let id = self.next_package_id as PackageId;
        self.next_package_id += 1;
        Ok(id)
    }

    fn allocate_ack_message_id(&mut self) -> anyhow::Result<MessageId> {
        if self.next_ack_message_id == 0 {
            bail!("ack message id underflow: exceeds configured bit width");
        }
        let id = self.next_ack_message_id as MessageId;
        self.next_ack_message_id -= 1;
        Ok(id)
    }
}
