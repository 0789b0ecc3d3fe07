//! A connection-oriented messaging SDK for peer devices on an IP network, multiplexing many
//!  logical connections over a single datagram endpoint.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data) with
//!   optional reliable delivery - not byte streams
//! * One SDK instance per device; any number of logical connections share the device's one
//!   datagram endpoint, multiplexed by a numeric connection id
//! * Connections are negotiated by a three-step handshake; both peers derive the shared
//!   connection id deterministically from two independently chosen primes
//! * Messages larger than the configured packet size are fragmented into *packages* and
//!   reassembled on the receiving side - reassembly is order-independent, and no delivery
//!   order is guaranteed between packages or between messages
//! * Packages sent with an ack requirement are retained and retransmitted on a timer until
//!   acknowledged or until the transmission budget is exhausted
//! * There is a CRC-32 checksum per datagram; a corrupt datagram is indistinguishable from
//!   a lost one
//! * Explicitly *not* provided: congestion control, flow control windows, ordering,
//!   encryption or authentication --> different trade-offs
//!
//! ## Wire format
//!
//! One datagram per frame. All numbers in network byte order (BE); each configurable field
//!  occupies `ceil(bits / 8)` bytes of its width in the shared [config::ValidationConfig]:
//!
//! ```ascii
//! 0: package id      (default 24 bits -> 3 bytes)
//! *: message id      (default 24 bits -> 3 bytes)
//! *: connection id   (default 16 bits -> 2 bytes)
//! *: fragment id     (default  8 bits -> 1 byte)
//! *: fragments count (default  8 bits -> 1 byte)
//! *: format          (1 byte: JSON=0, VIDEO=1, HANDSHAKE=2, CONFIRMATION=3)
//! *: priority        (default  4 bits -> 1 byte)
//! *: require ack     (1 byte: 0 or 1)
//! *: payload length  (2 bytes)
//! *: payload         (payload length bytes)
//! *: CRC-32          (4 bytes, reflected 0xEDB88320, init and xorout 0xFFFFFFFF)
//! ```
//!
//! There is no magic number and no version byte - interoperability rests entirely on both
//!  peers sharing the same width schema.
//!
//! ## Handshake
//!
//! Handshake legs are HANDSHAKE-format messages with small JSON payloads:
//!
//! 1. The initiator picks a prime `pA` and a random special code `S`, records the connection
//!    as PENDING under `pA`, and sends `{"deviceId": A, "specialCode": S}` on `pA` with an
//!    ack requirement.
//! 2. The responder consults its host, picks its own prime `pB`, records the connection as
//!    ACCEPTED under `pA * pB`, and answers `{"deviceId": B, "specialCode": S, "newId": pB}`
//!    on `pA`.
//! 3. The initiator re-keys its connection to `pA * pB`, upgrades it to ACTIVE, and sends
//!    `{"deviceId": A, "specialCode": S, "finalConfirmation": true}` on the combined id;
//!    receiving it upgrades the responder to ACTIVE as well.
//!
//! Acknowledgements are CONFIRMATION-format packages carrying `{"ackPackageId": N}`, with
//!  message ids allocated downward from the top of the message id range so they never
//!  collide with data messages.
//!
//! ## Layering
//!
//! The stack is a linear pipeline of worker tasks joined by bounded channels, mirrored for
//!  the inbound direction:
//!
//! ```ascii
//! facade -> session (fragment, ack, retransmit) -> transport (fixed-width codec)
//!        -> framing (CRC-32 trailer, size bounds) -> datagram transport
//! ```
//!
//! The datagram transport is a capability trait ([physical::PhysicalTransport]) with a UDP
//!  implementation for production use and an in-memory broadcast medium for tests.

pub mod config;
pub mod framing;
pub mod handshake;
pub mod physical;
pub mod sdk;
pub mod session;
pub mod transport;
pub mod types;
