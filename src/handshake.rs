use anyhow::{anyhow, bail};
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use crate::config::ValidationConfig;
use crate::types::ConnectionId;

/// The three handshake legs all carry this record as a small JSON object:
///
/// 1. request:            `{"deviceId": A, "specialCode": S}`
/// 2. response:           `{"deviceId": B, "specialCode": S, "newId": pB}`
/// 3. final confirmation: `{"deviceId": A, "specialCode": S, "finalConfirmation": true}`
///
/// The decoder accepts exactly this record shape - numeric fields may arrive as JSON
///  numbers or as decimal strings, everything else (unknown keys, missing required fields,
///  non-object payloads) is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandshakePayload {
    #[serde(rename = "deviceId")]
    pub device_id: u64,
    #[serde(rename = "specialCode")]
    pub special_code: u64,
    #[serde(rename = "newId", skip_serializing_if = "Option::is_none")]
    pub new_id: Option<u64>,
    #[serde(rename = "finalConfirmation", skip_serializing_if = "Option::is_none")]
    pub final_confirmation: Option<bool>,
}

impl HandshakePayload {
    pub fn request(device_id: u64, special_code: u64) -> HandshakePayload {
        HandshakePayload {
            device_id,
            special_code,
            new_id: None,
            final_confirmation: None,
        }
    }

    pub fn response(device_id: u64, special_code: u64, new_id: u64) -> HandshakePayload {
        HandshakePayload {
            device_id,
            special_code,
            new_id: Some(new_id),
            final_confirmation: None,
        }
    }

    pub fn confirmation(device_id: u64, special_code: u64) -> HandshakePayload {
        HandshakePayload {
            device_id,
            special_code,
            new_id: None,
            final_confirmation: Some(true),
        }
    }

    pub fn encode(&self) -> Bytes {
        Bytes::from(serde_json::to_vec(self).expect("handshake payload serialization cannot fail"))
    }

    pub fn decode(raw: &[u8]) -> anyhow::Result<HandshakePayload> {
        let value: Value = serde_json::from_slice(raw)?;
        let object = value
            .as_object()
            .ok_or_else(|| anyhow!("handshake payload is not a JSON object"))?;

        for key in object.keys() {
            if !matches!(key.as_str(), "deviceId" | "specialCode" | "newId" | "finalConfirmation") {
                bail!("handshake payload carries unknown field '{}'", key);
            }
        }

        let device_id = int_field(object, "deviceId")?
            .ok_or_else(|| anyhow!("handshake payload is missing 'deviceId'"))?;
        let special_code = int_field(object, "specialCode")?
            .ok_or_else(|| anyhow!("handshake payload is missing 'specialCode'"))?;
        let new_id = int_field(object, "newId")?;
        let final_confirmation = match object.get("finalConfirmation") {
            None => None,
            Some(Value::Bool(b)) => Some(*b),
            Some(other) => bail!("'finalConfirmation' must be a boolean, was {}", other),
        };

        Ok(HandshakePayload {
            device_id,
            special_code,
            new_id,
            final_confirmation,
        })
    }
}

/// Numeric handshake fields may be sent as integers or as decimal strings.
fn int_field(object: &serde_json::Map<String, Value>, key: &str) -> anyhow::Result<Option<u64>> {
    match object.get(key) {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| anyhow!("'{}' must be a non-negative integer, was {}", key, n)),
        Some(Value::String(s)) => s
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("'{}' must be a non-negative integer, was '{}'", key, s)),
        Some(other) => bail!("'{}' must be an integer, was {}", key, other),
    }
}

/// Allocates connection ids for the handshake. Ids are primes so that both peers can derive
///  the shared id of an established connection as the product of their independently chosen
///  halves.
///
/// Two independent handshakes whose prime products coincide would collide in the connection
///  table; the allocator does not guard against that, the handshake fails at insertion time.
#[derive(Debug)]
pub struct PrimeAllocator {
    next: u64,
}

impl Default for PrimeAllocator {
    fn default() -> PrimeAllocator {
        PrimeAllocator { next: 2 }
    }
}

impl PrimeAllocator {
    /// The next prime at or above the running counter that still fits the configured
    ///  connection id width; advances the counter past it.
    pub fn next_prime(&mut self, validation: &ValidationConfig) -> anyhow::Result<ConnectionId> {
        let max = ValidationConfig::max_value(validation.connection_id_bits);
        let mut candidate = self.next;
        loop {
            if candidate > max {
                bail!("unable to allocate connection id: prime range exhausted");
            }
            if is_prime(candidate) {
                self.next = candidate + 1;
                return Ok(candidate as ConnectionId);
            }
            candidate += 1;
        }
    }
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    let mut i = 2;
    while i * i <= n {
        if n % i == 0 {
            return false;
        }
        i += 1;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_encode_request() {
        let encoded = HandshakePayload::request(7, 4711).encode();
        assert_eq!(&encoded[..], br#"{"deviceId":7,"specialCode":4711}"#);
    }

    #[test]
    fn test_encode_response() {
        let encoded = HandshakePayload::response(8, 4711, 3).encode();
        assert_eq!(&encoded[..], br#"{"deviceId":8,"specialCode":4711,"newId":3}"#);
    }

    #[test]
    fn test_encode_confirmation() {
        let encoded = HandshakePayload::confirmation(7, 4711).encode();
        assert_eq!(
            &encoded[..],
            br#"{"deviceId":7,"specialCode":4711,"finalConfirmation":true}"#
        );
    }

    #[rstest]
    #[case::request(br#"{"deviceId": 7, "specialCode": 4711}"#.to_vec(), HandshakePayload::request(7, 4711))]
    #[case::response(br#"{"deviceId": 8, "specialCode": 4711, "newId": 3}"#.to_vec(), HandshakePayload::response(8, 4711, 3))]
    #[case::confirmation(br#"{"deviceId": 7, "specialCode": 4711, "finalConfirmation": true}"#.to_vec(), HandshakePayload::confirmation(7, 4711))]
    #[case::string_numbers(br#"{"deviceId": "7", "specialCode": "4711"}"#.to_vec(), HandshakePayload::request(7, 4711))]
    fn test_decode_valid(#[case] raw: Vec<u8>, #[case] expected: HandshakePayload) {
        assert_eq!(HandshakePayload::decode(&raw).unwrap(), expected);
    }

    #[rstest]
    #[case::not_json(b"deviceId 7".to_vec())]
    #[case::not_an_object(b"[1, 2]".to_vec())]
    #[case::missing_device_id(br#"{"specialCode": 4711}"#.to_vec())]
    #[case::missing_special_code(br#"{"deviceId": 7}"#.to_vec())]
    #[case::unknown_field(br#"{"deviceId": 7, "specialCode": 4711, "extra": 1}"#.to_vec())]
    #[case::negative_device_id(br#"{"deviceId": -7, "specialCode": 4711}"#.to_vec())]
    #[case::non_numeric_string(br#"{"deviceId": "abc", "specialCode": 4711}"#.to_vec())]
    #[case::non_boolean_confirmation(br#"{"deviceId": 7, "specialCode": 4711, "finalConfirmation": 1}"#.to_vec())]
    fn test_decode_rejects(#[case] raw: Vec<u8>) {
        assert!(HandshakePayload::decode(&raw).is_err());
    }

    #[test]
    fn test_decode_roundtrip() {
        let original = HandshakePayload::response(300, 65_535, 17);
        let decoded = HandshakePayload::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[rstest]
    #[case(0, false)]
    #[case(1, false)]
    #[case(2, true)]
    #[case(3, true)]
    #[case(4, false)]
    #[case(17, true)]
    #[case(25, false)]
    #[case(7919, true)]
    fn test_is_prime(#[case] n: u64, #[case] expected: bool) {
        assert_eq!(is_prime(n), expected);
    }

    #[test]
    fn test_allocator_yields_ascending_primes() {
        let validation = ValidationConfig::default();
        let mut allocator = PrimeAllocator::default();

        let primes: Vec<ConnectionId> = (0..5)
            .map(|_| allocator.next_prime(&validation).unwrap())
            .collect();
        assert_eq!(primes, vec![2, 3, 5, 7, 11]);
    }

    #[test]
    fn test_allocator_exhausts_at_width_boundary() {
        let validation = ValidationConfig {
            connection_id_bits: 3, // primes up to 7
            ..ValidationConfig::default()
        };
        let mut allocator = PrimeAllocator::default();

        assert_eq!(allocator.next_prime(&validation).unwrap(), 2);
        assert_eq!(allocator.next_prime(&validation).unwrap(), 3);
        assert_eq!(allocator.next_prime(&validation).unwrap(), 5);
        assert_eq!(allocator.next_prime(&validation).unwrap(), 7);
        assert!(allocator.next_prime(&validation).is_err());
    }
}
