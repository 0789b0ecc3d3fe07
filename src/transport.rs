use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::config::ValidationConfig;
use crate::types::{MessageFormat, Package, PackageStatus};

/// One fixed-width field of the wire layout: its on-wire size in whole bytes and the highest
///  value its configured bit width admits.
#[derive(Debug, Clone, Copy)]
struct Field {
    bytes: usize,
    max: u64,
}

impl Field {
    fn for_bits(bits: u8) -> Field {
        Field {
            bytes: ((bits as usize) + 7) / 8,
            max: ValidationConfig::max_value(bits),
        }
    }
}

/// Bit-exact codec between [Package] and its byte frame.
///
/// The layout is strictly ordered, big-endian and byte-aligned; each configurable field
///  occupies `ceil(bits / 8)` bytes:
///
/// ```ascii
/// packageId | messageId | connId | fragmentId | fragmentsCount |
/// format (1 byte) | priority | requireAck (1 byte) |
/// payload length (2 bytes) | payload
/// ```
///
/// There is no magic number and no version byte - both peers must be built with the same
///  [ValidationConfig] for the fields to line up.
#[derive(Debug, Clone)]
pub struct TransportCodec {
    validation: ValidationConfig,
    package_id: Field,
    message_id: Field,
    conn_id: Field,
    fragment_id: Field,
    fragments_count: Field,
    priority: Field,
}

impl TransportCodec {
    pub fn new(validation: ValidationConfig) -> TransportCodec {
        TransportCodec {
            package_id: Field::for_bits(validation.package_id_bits),
            message_id: Field::for_bits(validation.message_id_bits),
            conn_id: Field::for_bits(validation.connection_id_bits),
            fragment_id: Field::for_bits(validation.fragment_id_bits),
            fragments_count: Field::for_bits(validation.fragments_count_bits),
            priority: Field::for_bits(validation.priority_bits),
            validation,
        }
    }

    /// Serialized size of everything before the payload.
    pub fn header_len(&self) -> usize {
        self.package_id.bytes
            + self.message_id.bytes
            + self.conn_id.bytes
            + self.fragment_id.bytes
            + self.fragments_count.bytes
            + ValidationConfig::FORMAT_FIELD_BYTES
            + self.priority.bytes
            + ValidationConfig::REQUIRE_ACK_FIELD_BYTES
            + ValidationConfig::PAYLOAD_LENGTH_FIELD_BYTES
    }

    pub fn ser(&self, pkg: &Package, buf: &mut BytesMut) -> anyhow::Result<()> {
        self.validation.validate_package(pkg)?;

        Self::put_field(buf, "package id", pkg.package_id as u64, self.package_id)?;
        Self::put_field(buf, "message id", pkg.message_id as u64, self.message_id)?;
        Self::put_field(buf, "connection id", pkg.conn_id as u64, self.conn_id)?;
        Self::put_field(buf, "fragment id", pkg.fragment_id as u64, self.fragment_id)?;
        Self::put_field(buf, "fragments count", pkg.fragments_count as u64, self.fragments_count)?;
        buf.put_u8(pkg.format.to_byte());
        Self::put_field(buf, "priority", pkg.priority as u64, self.priority)?;
        buf.put_u8(pkg.require_ack as u8);
        if pkg.payload.len() > u16::MAX as usize {
            bail!("payload of {} bytes too large to encode", pkg.payload.len());
        }
        buf.put_u16(pkg.payload.len() as u16);
        buf.put_slice(&pkg.payload);
        Ok(())
    }

    fn put_field(buf: &mut BytesMut, name: &str, value: u64, field: Field) -> anyhow::Result<()> {
        if value > field.max {
            bail!("{} {} exceeds its encoding width", name, value);
        }
        buf.put_uint(value, field.bytes);
        Ok(())
    }

    pub fn deser(&self, frame: &[u8]) -> anyhow::Result<Package> {
        let mut buf = frame;

        let package_id = Self::get_field(&mut buf, self.package_id)? as u32;
        let message_id = Self::get_field(&mut buf, self.message_id)? as u32;
        let conn_id = Self::get_field(&mut buf, self.conn_id)? as u32;
        let fragment_id = Self::get_field(&mut buf, self.fragment_id)? as u32;
        let fragments_count = Self::get_field(&mut buf, self.fragments_count)? as u32;
        if buf.remaining() < ValidationConfig::FORMAT_FIELD_BYTES {
            bail!("frame truncated");
        }
        let format = MessageFormat::try_from_byte(buf.get_u8())?;
        let priority = Self::get_field(&mut buf, self.priority)? as u32;
        if buf.remaining() < ValidationConfig::REQUIRE_ACK_FIELD_BYTES {
            bail!("frame truncated");
        }
        let require_ack = buf.get_u8() != 0;
        if buf.remaining() < ValidationConfig::PAYLOAD_LENGTH_FIELD_BYTES {
            bail!("frame truncated");
        }
        let payload_len = buf.get_u16() as usize;
        if buf.remaining() < payload_len {
            bail!("frame truncated while reading payload");
        }
        let payload = bytes::Bytes::copy_from_slice(&buf[..payload_len]);
        buf.advance(payload_len);
        if buf.has_remaining() {
            bail!("{} trailing bytes after payload", buf.remaining());
        }

        let pkg = Package {
            package_id,
            message_id,
            conn_id,
            fragment_id,
            fragments_count,
            payload,
            format,
            priority,
            require_ack,
            status: PackageStatus::Queued,
        };
        self.validation.validate_package(&pkg)?;
        Ok(pkg)
    }

    fn get_field(buf: &mut &[u8], field: Field) -> anyhow::Result<u64> {
        if buf.remaining() < field.bytes {
            bail!("frame truncated");
        }
        Ok(buf.get_uint(field.bytes))
    }
}

/// The codec worker: drains outgoing packages into encoded frames, and decodes stripped
///  inbound frames back into packages for the session layer. Malformed input in either
///  direction is logged and dropped without disturbing any other state.
pub struct TransportLayer {
    codec: TransportCodec,
    pkg_rx: mpsc::Receiver<Package>,
    frame_tx: mpsc::Sender<BytesMut>,
    frame_rx: mpsc::Receiver<Vec<u8>>,
    pkg_tx: mpsc::Sender<Package>,
}

impl TransportLayer {
    pub fn new(
        codec: TransportCodec,
        pkg_rx: mpsc::Receiver<Package>,
        frame_tx: mpsc::Sender<BytesMut>,
        frame_rx: mpsc::Receiver<Vec<u8>>,
        pkg_tx: mpsc::Sender<Package>,
    ) -> TransportLayer {
        TransportLayer {
            codec,
            pkg_rx,
            frame_tx,
            frame_rx,
            pkg_tx,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                pkg = self.pkg_rx.recv() => match pkg {
                    Some(pkg) => self.encode_outgoing(pkg).await,
                    None => break,
                },
                frame = self.frame_rx.recv() => match frame {
                    Some(frame) => self.decode_incoming(frame).await,
                    None => break,
                },
            }
        }
        trace!("transport worker shutting down");
    }

    async fn encode_outgoing(&mut self, pkg: Package) {
        let mut buf = BytesMut::with_capacity(self.codec.header_len() + pkg.payload.len());
        match self.codec.ser(&pkg, &mut buf) {
            Ok(()) => {
                trace!(
                    "encoded package id={} msg={} fragment={}/{} into {} bytes",
                    pkg.package_id,
                    pkg.message_id,
                    pkg.fragment_id,
                    pkg.fragments_count,
                    buf.len()
                );
                if self.frame_tx.send(buf).await.is_err() {
                    warn!("framing layer gone - discarding encoded frame");
                }
            }
            Err(e) => {
                warn!("cannot encode package id={}, dropping: {}", pkg.package_id, e);
            }
        }
    }

    async fn decode_incoming(&mut self, frame: Vec<u8>) {
        match self.codec.deser(&frame) {
            Ok(pkg) => {
                trace!(
                    "decoded frame into package id={} msg={} fragment={}/{}",
                    pkg.package_id,
                    pkg.message_id,
                    pkg.fragment_id,
                    pkg.fragments_count
                );
                if self.pkg_tx.send(pkg).await.is_err() {
                    warn!("session layer gone - discarding decoded package");
                }
            }
            Err(e) => {
                warn!("received frame with unparsable header, dropping: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::rstest;

    fn codec() -> TransportCodec {
        TransportCodec::new(ValidationConfig::default())
    }

    fn package(payload: &[u8]) -> Package {
        Package {
            package_id: 1,
            message_id: 2,
            conn_id: 3,
            fragment_id: 0,
            fragments_count: 1,
            payload: Bytes::copy_from_slice(payload),
            format: MessageFormat::Json,
            priority: 5,
            require_ack: true,
            status: PackageStatus::Queued,
        }
    }

    #[test]
    fn test_header_len_for_default_widths() {
        // 3 + 3 + 2 + 1 + 1 + 1 + 1 + 1 + 2
        assert_eq!(codec().header_len(), 15);
    }

    #[test]
    fn test_ser_exact_bytes() {
        let mut buf = BytesMut::new();
        codec().ser(&package(b"ab"), &mut buf).unwrap();

        assert_eq!(
            buf.as_ref(),
            &[
                0, 0, 1, // package id
                0, 0, 2, // message id
                0, 3, // connection id
                0, // fragment id
                1, // fragments count
                0, // format = JSON
                5, // priority
                1, // require ack
                0, 2, // payload length
                b'a', b'b',
            ]
        );
    }

    #[rstest]
    #[case::empty(b"".to_vec())]
    #[case::short(b"hello".to_vec())]
    #[case::binary((0u8..=255).collect::<Vec<_>>())]
    fn test_roundtrip(#[case] payload: Vec<u8>) {
        let codec = codec();
        let original = package(&payload);

        let mut buf = BytesMut::new();
        codec.ser(&original, &mut buf).unwrap();
        let decoded = codec.deser(buf.as_ref()).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_ser_rejects_field_exceeding_width() {
        let mut pkg = package(b"x");
        pkg.fragments_count = 300; // fragment count width is 8 bits
        let mut buf = BytesMut::new();
        assert!(codec().ser(&pkg, &mut buf).is_err());
    }

    #[test]
    fn test_deser_rejects_truncation_at_every_field() {
        let codec = codec();
        let mut buf = BytesMut::new();
        codec.ser(&package(b"hello"), &mut buf).unwrap();

        for len in 0..buf.len() {
            assert!(
                codec.deser(&buf[..len]).is_err(),
                "truncation to {} bytes must fail",
                len
            );
        }
    }

    #[test]
    fn test_deser_rejects_trailing_bytes() {
        let codec = codec();
        let mut buf = BytesMut::new();
        codec.ser(&package(b"hello"), &mut buf).unwrap();
        buf.put_u8(0);

        assert!(codec.deser(buf.as_ref()).is_err());
    }

    #[test]
    fn test_deser_rejects_unknown_format() {
        let codec = codec();
        let mut buf = BytesMut::new();
        codec.ser(&package(b""), &mut buf).unwrap();
        buf[10] = 9; // format byte

        assert!(codec.deser(buf.as_ref()).is_err());
    }

    #[test]
    fn test_deser_rejects_decoded_value_outside_width() {
        // 20-bit connection ids occupy 3 bytes on the wire, so a raw frame can carry a
        //  value the schema does not admit
        let codec = TransportCodec::new(ValidationConfig {
            connection_id_bits: 20,
            ..ValidationConfig::default()
        });

        let mut buf = BytesMut::new();
        codec.ser(&package(b""), &mut buf).unwrap();
        // overwrite the connection id field (offset 6, 3 bytes) with 2^20
        buf[6] = 0x10;
        buf[7] = 0x00;
        buf[8] = 0x00;

        assert!(codec.deser(buf.as_ref()).is_err());
    }

    #[tokio::test]
    async fn test_worker_roundtrip_through_channels() {
        let (pkg_out_tx, pkg_out_rx) = mpsc::channel(8);
        let (frame_out_tx, mut frame_out_rx) = mpsc::channel(8);
        let (frame_in_tx, frame_in_rx) = mpsc::channel(8);
        let (pkg_in_tx, mut pkg_in_rx) = mpsc::channel(8);

        let layer = TransportLayer::new(codec(), pkg_out_rx, frame_out_tx, frame_in_rx, pkg_in_tx);
        let handle = tokio::spawn(layer.run());

        let pkg = package(b"roundtrip");
        pkg_out_tx.send(pkg.clone()).await.unwrap();
        let frame = frame_out_rx.recv().await.unwrap();

        frame_in_tx.send(frame.to_vec()).await.unwrap();
        let decoded = pkg_in_rx.recv().await.unwrap();
        assert_eq!(decoded, pkg);

        drop(pkg_out_tx);
        drop(frame_in_tx);
        handle.await.unwrap();
    }
}
