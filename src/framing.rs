use anyhow::bail;
use bytes::{BufMut, BytesMut};
use crc::Crc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::ValidationConfig;
use crate::transport::TransportCodec;

/// CRC-32 with the reflected polynomial 0xEDB88320, initial register 0xFFFFFFFF and final
///  XOR 0xFFFFFFFF - the classic IEEE checksum, appended big-endian as a 4-byte trailer.
const FRAME_CRC: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Frame size bounds derived from the bit-width schema. Anything outside these bounds is
///  rejected before it reaches the wire or the codec.
#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub header_len: usize,
    /// header plus the largest encodable payload
    pub max_frame_len: usize,
    /// [Self::max_frame_len] plus the CRC trailer
    pub max_datagram_len: usize,
}

impl FrameLimits {
    pub fn new(validation: &ValidationConfig) -> FrameLimits {
        let header_len = TransportCodec::new(validation.clone()).header_len();
        let max_payload = (1usize << (ValidationConfig::PAYLOAD_LENGTH_FIELD_BYTES * 8)) - 1;
        let max_frame_len = header_len + max_payload;
        FrameLimits {
            header_len,
            max_frame_len,
            max_datagram_len: max_frame_len + ValidationConfig::CRC_FIELD_BYTES,
        }
    }
}

/// Appends the CRC-32 trailer to an encoded frame, turning it into the transmitted datagram.
pub fn seal_frame(frame: &mut BytesMut) {
    let crc = FRAME_CRC.checksum(frame.as_ref());
    frame.put_u32(crc);
}

/// Splits the trailing CRC off a received datagram, recomputes the checksum over the prefix
///  and returns the stripped frame. A mismatch is indistinguishable from a lost packet for
///  the layers above.
pub fn verify_and_strip(mut datagram: Vec<u8>) -> anyhow::Result<Vec<u8>> {
    if datagram.len() < ValidationConfig::CRC_FIELD_BYTES {
        bail!("datagram of {} bytes too short to carry a CRC trailer", datagram.len());
    }
    let payload_len = datagram.len() - ValidationConfig::CRC_FIELD_BYTES;
    let received = u32::from_be_bytes(
        datagram[payload_len..]
            .try_into()
            .expect("CRC trailer is exactly four bytes"),
    );
    let computed = FRAME_CRC.checksum(&datagram[..payload_len]);
    if received != computed {
        bail!("CRC mismatch: received {:08x}, computed {:08x}", received, computed);
    }
    datagram.truncate(payload_len);
    Ok(datagram)
}

/// The integrity worker at the edge between the codec and the datagram transport: seals
///  outgoing frames with the CRC trailer, verifies and strips incoming datagrams, and
///  enforces the frame size bounds in both directions.
pub struct FramingLayer {
    limits: FrameLimits,
    frame_rx: mpsc::Receiver<BytesMut>,
    datagram_tx: mpsc::Sender<BytesMut>,
    datagram_rx: mpsc::Receiver<Vec<u8>>,
    frame_tx: mpsc::Sender<Vec<u8>>,
}

impl FramingLayer {
    pub fn new(
        limits: FrameLimits,
        frame_rx: mpsc::Receiver<BytesMut>,
        datagram_tx: mpsc::Sender<BytesMut>,
        datagram_rx: mpsc::Receiver<Vec<u8>>,
        frame_tx: mpsc::Sender<Vec<u8>>,
    ) -> FramingLayer {
        FramingLayer {
            limits,
            frame_rx,
            datagram_tx,
            datagram_rx,
            frame_tx,
        }
    }

    pub async fn run(mut self) {
        loop {
            tokio::select! {
                frame = self.frame_rx.recv() => match frame {
                    Some(frame) => self.seal_outgoing(frame).await,
                    None => break,
                },
                datagram = self.datagram_rx.recv() => match datagram {
                    Some(datagram) => self.verify_incoming(datagram).await,
                    None => break,
                },
            }
        }
        trace!("framing worker shutting down");
    }

    async fn seal_outgoing(&mut self, mut frame: BytesMut) {
        if frame.len() < self.limits.header_len || frame.len() > self.limits.max_frame_len {
            warn!(
                "outgoing frame of {} bytes outside bounds [{}, {}], dropping",
                frame.len(),
                self.limits.header_len,
                self.limits.max_frame_len
            );
            return;
        }
        seal_frame(&mut frame);
        if self.datagram_tx.send(frame).await.is_err() {
            warn!("datagram transport gone - discarding sealed frame");
        }
    }

    async fn verify_incoming(&mut self, datagram: Vec<u8>) {
        if datagram.len() > self.limits.max_datagram_len {
            warn!(
                "received datagram of {} bytes exceeds limit {}, dropping",
                datagram.len(),
                self.limits.max_datagram_len
            );
            return;
        }
        match verify_and_strip(datagram) {
            Ok(frame) => {
                if self.frame_tx.send(frame).await.is_err() {
                    warn!("codec layer gone - discarding verified frame");
                }
            }
            Err(e) => {
                debug!("dropping received datagram: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_crc_check_value() {
        // the standard check input for CRC-32/ISO-HDLC
        assert_eq!(FRAME_CRC.checksum(b"123456789"), 0xCBF4_3926);
    }

    #[rstest]
    #[case::empty(b"".to_vec())]
    #[case::short(b"hello".to_vec())]
    #[case::binary((0u8..=255).collect::<Vec<_>>())]
    fn test_seal_verify_roundtrip(#[case] frame: Vec<u8>) {
        let mut sealed = BytesMut::from(frame.as_slice());
        seal_frame(&mut sealed);
        assert_eq!(sealed.len(), frame.len() + 4);

        let stripped = verify_and_strip(sealed.to_vec()).unwrap();
        assert_eq!(stripped, frame);
    }

    #[test]
    fn test_any_flipped_bit_is_detected() {
        let mut sealed = BytesMut::from(&b"integrity"[..]);
        seal_frame(&mut sealed);

        for byte in 0..sealed.len() {
            for bit in 0..8 {
                let mut corrupted = sealed.to_vec();
                corrupted[byte] ^= 1 << bit;
                assert!(
                    verify_and_strip(corrupted).is_err(),
                    "flipping bit {} of byte {} must be detected",
                    bit,
                    byte
                );
            }
        }
    }

    #[rstest]
    #[case::empty(0)]
    #[case::three_bytes(3)]
    fn test_too_short_for_trailer(#[case] len: usize) {
        assert!(verify_and_strip(vec![0; len]).is_err());
    }

    #[test]
    fn test_limits_for_default_widths() {
        let limits = FrameLimits::new(&ValidationConfig::default());
        assert_eq!(limits.header_len, 15);
        assert_eq!(limits.max_frame_len, 15 + 65_535);
        assert_eq!(limits.max_datagram_len, 15 + 65_535 + 4);
    }

    #[tokio::test]
    async fn test_worker_drops_undersized_outgoing_frame() {
        let limits = FrameLimits::new(&ValidationConfig::default());
        let (frame_out_tx, frame_out_rx) = mpsc::channel(8);
        let (datagram_out_tx, mut datagram_out_rx) = mpsc::channel(8);
        let (datagram_in_tx, datagram_in_rx) = mpsc::channel::<Vec<u8>>(8);
        let (frame_in_tx, _frame_in_rx) = mpsc::channel(8);

        let layer = FramingLayer::new(limits, frame_out_rx, datagram_out_tx, datagram_in_rx, frame_in_tx);
        let handle = tokio::spawn(layer.run());

        // shorter than the transport header - must never reach the wire
        frame_out_tx.send(BytesMut::from(&b"tiny"[..])).await.unwrap();

        let mut ok = BytesMut::from(vec![0u8; limits.header_len].as_slice());
        frame_out_tx.send(ok.clone()).await.unwrap();

        let sent = datagram_out_rx.recv().await.unwrap();
        seal_frame(&mut ok);
        assert_eq!(sent, ok);

        drop(frame_out_tx);
        drop(datagram_in_tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_silently_drops_corrupted_datagram() {
        let limits = FrameLimits::new(&ValidationConfig::default());
        let (frame_out_tx, frame_out_rx) = mpsc::channel(8);
        let (datagram_out_tx, _datagram_out_rx) = mpsc::channel(8);
        let (datagram_in_tx, datagram_in_rx) = mpsc::channel(8);
        let (frame_in_tx, mut frame_in_rx) = mpsc::channel(8);

        let layer = FramingLayer::new(limits, frame_out_rx, datagram_out_tx, datagram_in_rx, frame_in_tx);
        let handle = tokio::spawn(layer.run());

        let mut sealed = BytesMut::from(&b"payload"[..]);
        seal_frame(&mut sealed);
        let mut corrupted = sealed.to_vec();
        *corrupted.last_mut().unwrap() ^= 0xFF;
        datagram_in_tx.send(corrupted).await.unwrap();

        // an intact datagram afterwards still comes through
        datagram_in_tx.send(sealed.to_vec()).await.unwrap();
        assert_eq!(frame_in_rx.recv().await.unwrap(), b"payload".to_vec());

        drop(frame_out_tx);
        drop(datagram_in_tx);
        handle.await.unwrap();
    }
}
