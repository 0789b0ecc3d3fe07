use std::time::Duration;

use anyhow::bail;

use crate::types::{ConnectionId, DeviceId, Message, MessageId, Package, PackageId, Priority};

/// The bit-width schema that governs both in-memory validation and the on-wire encoding.
///
/// Peers must share the same schema for interoperability - there is no version byte on the
///  wire, so a mismatch shows up as decode errors or silently misread fields. The config is
///  immutable after SDK construction and shared read-only across the stack.
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub device_id_bits: u8,
    pub connection_id_bits: u8,
    pub message_id_bits: u8,
    pub package_id_bits: u8,
    pub fragment_id_bits: u8,
    pub fragments_count_bits: u8,
    pub priority_bits: u8,
    pub special_code_bits: u8,
}

impl Default for ValidationConfig {
    fn default() -> ValidationConfig {
        ValidationConfig {
            device_id_bits: 16,
            connection_id_bits: 16,
            message_id_bits: 24,
            package_id_bits: 24,
            fragment_id_bits: 8,
            fragments_count_bits: 8,
            priority_bits: 4,
            special_code_bits: 16,
        }
    }
}

impl ValidationConfig {
    /// fixed-width trailer fields that are not configurable
    pub const FORMAT_FIELD_BYTES: usize = 1;
    pub const REQUIRE_ACK_FIELD_BYTES: usize = 1;
    pub const PAYLOAD_LENGTH_FIELD_BYTES: usize = 2;
    pub const CRC_FIELD_BYTES: usize = 4;

    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, bits) in [
            ("device id", self.device_id_bits),
            ("connection id", self.connection_id_bits),
            ("message id", self.message_id_bits),
            ("package id", self.package_id_bits),
            ("fragment id", self.fragment_id_bits),
            ("fragments count", self.fragments_count_bits),
            ("priority", self.priority_bits),
            ("special code", self.special_code_bits),
        ] {
            if bits == 0 || bits > 32 {
                bail!("{} bit width must be between 1 and 32, was {}", name, bits);
            }
        }
        Ok(())
    }

    /// The highest value representable in `bits` bits (callers have validated `1 <= bits <= 32`).
    pub fn max_value(bits: u8) -> u64 {
        if bits >= 32 {
            u32::MAX as u64
        } else {
            (1u64 << bits) - 1
        }
    }

    fn fits(value: u64, bits: u8) -> bool {
        value <= Self::max_value(bits)
    }

    pub fn validate_device_id(&self, device_id: DeviceId) -> anyhow::Result<()> {
        if device_id == 0 || !Self::fits(device_id as u64, self.device_id_bits) {
            bail!("device id {} outside allowed bit width", device_id);
        }
        Ok(())
    }

    pub fn validate_connection_id(&self, conn_id: ConnectionId) -> anyhow::Result<()> {
        if conn_id == 0 || !Self::fits(conn_id as u64, self.connection_id_bits) {
            bail!("connection id {} outside allowed bit width", conn_id);
        }
        Ok(())
    }

    pub fn validate_message_id(&self, message_id: MessageId) -> anyhow::Result<()> {
        if message_id == 0 || !Self::fits(message_id as u64, self.message_id_bits) {
            bail!("message id {} outside allowed bit width", message_id);
        }
        Ok(())
    }

    pub fn validate_package_id(&self, package_id: PackageId) -> anyhow::Result<()> {
        if package_id == 0 || !Self::fits(package_id as u64, self.package_id_bits) {
            bail!("package id {} outside allowed bit width", package_id);
        }
        Ok(())
    }

    pub fn validate_priority(&self, priority: Priority) -> anyhow::Result<()> {
        if !Self::fits(priority as u64, self.priority_bits) {
            bail!("priority {} outside allowed bit width", priority);
        }
        Ok(())
    }

    pub fn validate_special_code(&self, special_code: u32) -> anyhow::Result<()> {
        if !Self::fits(special_code as u64, self.special_code_bits) {
            bail!("special code {} outside allowed bit width", special_code);
        }
        Ok(())
    }

    pub fn validate_message(&self, message: &Message) -> anyhow::Result<()> {
        self.validate_message_id(message.id)?;
        self.validate_connection_id(message.conn_id)?;
        self.validate_priority(message.priority)?;
        if message.payload.len() > u16::MAX as usize {
            bail!(
                "message payload of {} bytes exceeds the encodable maximum of {}",
                message.payload.len(),
                u16::MAX
            );
        }
        Ok(())
    }

    pub fn validate_package(&self, package: &Package) -> anyhow::Result<()> {
        self.validate_package_id(package.package_id)?;
        self.validate_message_id(package.message_id)?;
        self.validate_connection_id(package.conn_id)?;
        if !Self::fits(package.fragment_id as u64, self.fragment_id_bits) {
            bail!("fragment id {} outside allowed bit width", package.fragment_id);
        }
        if package.fragments_count == 0
            || !Self::fits(package.fragments_count as u64, self.fragments_count_bits)
        {
            bail!(
                "fragments count {} outside allowed bit width",
                package.fragments_count
            );
        }
        self.validate_priority(package.priority)?;
        if package.payload.len() > u16::MAX as usize {
            bail!(
                "package payload of {} bytes exceeds the encodable maximum of {}",
                package.payload.len(),
                u16::MAX
            );
        }
        Ok(())
    }
}

/// Tuning knobs for one SDK instance. The bit-width schema travels inside so that a single
///  value configures the whole stack.
#[derive(Debug, Clone)]
pub struct SdkConfig {
    pub validation: ValidationConfig,

    /// Maximum payload bytes per fragment. Messages longer than this are split across
    ///  packages and reassembled on the receiving side.
    pub max_packet_size: usize,

    /// How long an unacknowledged package stays in flight before it is sent again.
    pub retransmit_interval: Duration,

    /// Total number of transmissions per package (the initial send counts as the first).
    ///  When the budget is exhausted the owning message is evicted and a trouble event is
    ///  raised on its connection.
    pub max_retransmit_attempts: u32,

    /// Cadence of the session worker's retransmission scan.
    pub session_tick_interval: Duration,

    /// Capacity of the bounded queues between adjacent layers.
    pub queue_capacity: usize,
}

impl Default for SdkConfig {
    fn default() -> SdkConfig {
        SdkConfig {
            validation: ValidationConfig::default(),
            max_packet_size: 256,
            retransmit_interval: Duration::from_millis(500),
            max_retransmit_attempts: 5,
            session_tick_interval: Duration::from_millis(20),
            queue_capacity: 1024,
        }
    }
}

impl SdkConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.validation.validate()?;
        if self.max_packet_size == 0 || self.max_packet_size > u16::MAX as usize {
            bail!(
                "max packet size must be between 1 and {}, was {}",
                u16::MAX,
                self.max_packet_size
            );
        }
        if self.max_retransmit_attempts == 0 {
            bail!("max retransmit attempts must be at least 1");
        }
        if self.queue_capacity == 0 {
            bail!("queue capacity must be positive");
        }
        Ok(())
    }
}
