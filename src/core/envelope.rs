//! # Envelope Codec
//!
//! Signs and verifies opaque payloads for transit between relays.
//!
//! ## Wire Format
//! ```text
//! [MAC(32)] [Serial(4, big-endian)] [Payload(N)]
//! ```
//! The MAC is HMAC-SHA-256 under the shared secret over `Serial || Payload`.
//! The channel name travels outside the envelope and is never signed.
//!
//! ## Verification
//! Verification fails for one of two independent reasons: the MAC does not
//! match (`InvalidSignature`), or the MAC matches but the serial was never
//! issued, was already consumed, or expired (`UnknownSerial` / `ExpiredSerial`).
//! The MAC comparison is constant time.

use crate::error::{PortalError, Result};
use crate::utils::serial_registry::{Serial, SerialRegistry};
use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// Length of the HMAC-SHA-256 tag
pub const MAC_LEN: usize = 32;

/// Length of the big-endian serial
pub const SERIAL_LEN: usize = 4;

/// Bytes preceding the payload
pub const HEADER_LEN: usize = MAC_LEN + SERIAL_LEN;

/// Largest payload the codec will sign
pub const MAX_PAYLOAD_LEN: usize = (i32::MAX / 2) as usize;

/// Shared HMAC key, wiped from memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for SharedSecret {
    fn from(secret: &str) -> Self {
        Self(secret.as_bytes().to_vec())
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedSecret([redacted; {}])", self.0.len())
    }
}

/// Payload recovered from a verified envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opened {
    pub serial: Serial,
    pub payload: Bytes,
}

fn compute_mac(secret: &SharedSecret, inner: &[u8]) -> Result<[u8; MAC_LEN]> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| PortalError::ConfigError("HMAC key rejected".into()))?;
    mac.update(inner);
    Ok(mac.finalize().into_bytes().into())
}

/// Build `MAC || serial || payload`.
///
/// Payloads over `MAX_PAYLOAD_LEN` are a caller bug and fail with `OversizedPayload`.
pub fn sign(secret: &SharedSecret, serial: Serial, payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(PortalError::OversizedPayload(payload.len()));
    }

    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_bytes(0, MAC_LEN);
    out.put_u32(serial);
    out.put_slice(payload);

    let tag = compute_mac(secret, &out[MAC_LEN..])?;
    out[..MAC_LEN].copy_from_slice(&tag);
    Ok(out.freeze())
}

/// Check the MAC and split the envelope, without touching any serial registry
pub fn open<'a>(secret: &SharedSecret, envelope: &'a [u8]) -> Result<(Serial, &'a [u8])> {
    if envelope.len() < HEADER_LEN {
        return Err(PortalError::MalformedEnvelope(envelope.len()));
    }

    let (mac_ref, inner) = envelope.split_at(MAC_LEN);
    let expected = compute_mac(secret, inner)?;
    if !bool::from(expected[..].ct_eq(mac_ref)) {
        return Err(PortalError::InvalidSignature);
    }

    let (serial_bytes, payload) = inner.split_at(SERIAL_LEN);
    let mut serial = [0u8; SERIAL_LEN];
    serial.copy_from_slice(serial_bytes);
    Ok((Serial::from_be_bytes(serial), payload))
}

/// Verify the MAC, then consume the serial in `registry`
pub fn verify(secret: &SharedSecret, registry: &SerialRegistry, envelope: &[u8]) -> Result<Opened> {
    let (serial, payload) = open(secret, envelope)?;
    registry.void_serial(serial)?;
    Ok(Opened {
        serial,
        payload: Bytes::copy_from_slice(payload),
    })
}

/// Secret plus serial source, the form the multiplexer uses
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    secret: SharedSecret,
    registry: Arc<SerialRegistry>,
}

impl EnvelopeCodec {
    pub fn new(secret: SharedSecret, registry: Arc<SerialRegistry>) -> Self {
        Self { secret, registry }
    }

    pub fn registry(&self) -> &Arc<SerialRegistry> {
        &self.registry
    }

    /// Sign `payload` under a freshly issued serial
    pub fn seal(&self, payload: &[u8]) -> Result<Bytes> {
        let serial = self.registry.next_serial()?;
        let envelope = sign(&self.secret, serial, payload)?;
        debug!(serial, bytes = envelope.len(), "Envelope sealed");
        Ok(envelope)
    }

    /// Verify and unwrap an envelope, consuming its serial
    pub fn unseal(&self, envelope: &[u8]) -> Result<Opened> {
        verify(&self.secret, &self.registry, envelope).inspect_err(|e| {
            warn!(error = %e, bytes = envelope.len(), "Envelope rejected");
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use std::time::Duration;

    const REFERENCE_MAC: &str = "38e03d68579a4a29ddf5bed38d0edd694bf7e49a7bc23a82a8ae6e23cc9a2a45";
    const REFERENCE_PAYLOAD: &[u8] = b"this is only a test";

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn reference_envelope() -> Bytes {
        sign(&SharedSecret::from("foobar"), 1, REFERENCE_PAYLOAD).unwrap()
    }

    #[test]
    fn test_reference_vector() {
        let envelope = reference_envelope();
        assert_eq!(envelope.len(), HEADER_LEN + REFERENCE_PAYLOAD.len());
        assert_eq!(hex(&envelope[..MAC_LEN]), REFERENCE_MAC);
        assert_eq!(&envelope[MAC_LEN..HEADER_LEN], &[0, 0, 0, 1]);
        assert_eq!(&envelope[HEADER_LEN..], REFERENCE_PAYLOAD);
    }

    #[test]
    fn test_open_reference_vector() {
        let envelope = reference_envelope();
        let (serial, payload) = open(&SharedSecret::from("foobar"), &envelope).unwrap();
        assert_eq!(serial, 1);
        assert_eq!(payload, REFERENCE_PAYLOAD);
    }

    #[test]
    fn test_open_borrows_payload_from_envelope() {
        let envelope = reference_envelope();
        let payload = {
            let secret = SharedSecret::from("foobar");
            open(&secret, &envelope).unwrap().1
        };
        // The secret is gone; the payload still points into the envelope
        assert_eq!(payload.as_ptr(), envelope[HEADER_LEN..].as_ptr());
        assert_eq!(payload, REFERENCE_PAYLOAD);
    }

    #[test]
    fn test_tamper_mac_serial_payload() {
        let secret = SharedSecret::from("foobar");
        let envelope = reference_envelope();
        for index in [2, MAC_LEN + 2, HEADER_LEN + 2] {
            let mut tampered = envelope.to_vec();
            tampered[index] = 23;
            assert!(
                matches!(open(&secret, &tampered), Err(PortalError::InvalidSignature)),
                "tampering byte {index} must be detected"
            );
        }
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let envelope = reference_envelope();
        assert!(matches!(
            open(&SharedSecret::from("barfoo"), &envelope),
            Err(PortalError::InvalidSignature)
        ));
    }

    #[test]
    fn test_short_envelope_is_malformed() {
        let secret = SharedSecret::from("foobar");
        assert!(matches!(
            open(&secret, &[0u8; HEADER_LEN - 1]),
            Err(PortalError::MalformedEnvelope(35))
        ));
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let secret = SharedSecret::from("k");
        let envelope = sign(&secret, 9, &[]).unwrap();
        let (serial, payload) = open(&secret, &envelope).unwrap();
        assert_eq!(serial, 9);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_codec_rejects_replay() {
        let registry = Arc::new(SerialRegistry::new(Duration::from_secs(60)));
        let codec = EnvelopeCodec::new(SharedSecret::from("foobar"), registry.clone());

        let envelope = codec.seal(b"diamond").unwrap();
        let opened = codec.unseal(&envelope).unwrap();
        assert_eq!(&opened.payload[..], b"diamond");
        assert_eq!(opened.serial, 1);

        let replay = codec.unseal(&envelope).unwrap_err();
        assert!(matches!(replay, PortalError::UnknownSerial(1)));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_unissued_serial_rejected_after_valid_mac() {
        let registry = SerialRegistry::new(Duration::from_secs(60));
        let secret = SharedSecret::from("foobar");
        let envelope = sign(&secret, 77, b"forged serial").unwrap();
        assert!(matches!(
            verify(&secret, &registry, &envelope),
            Err(PortalError::UnknownSerial(77))
        ));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let rendered = format!("{:?}", SharedSecret::from("hunter2"));
        assert!(!rendered.contains("hunter2"));
    }
}
