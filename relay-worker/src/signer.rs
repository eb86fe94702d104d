//! Webhook payload signing.
//!
//! Outbound deliveries are signed with HMAC-SHA256 over the exact body bytes.
//! The hex digest travels in the `X-Webhook-Signature` header; receivers
//! recompute it with their copy of the subscription secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex-encoded HMAC of the body.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Header carrying the event type.
pub const EVENT_HEADER: &str = "X-Webhook-Event";

/// Header carrying the delivery attempt id.
pub const DELIVERY_HEADER: &str = "X-Webhook-Delivery";

fn keyed_mac(secret: &[u8]) -> HmacSha256 {
    <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC can take key of any size")
}

/// Sign a canonical payload.
///
/// Returns the lowercase hex HMAC-SHA256 of `payload` under `secret`.
pub fn sign(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = keyed_mac(secret);
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex signature over `payload`.
///
/// The digest comparison runs in constant time. Any change to the payload
/// after signing makes this return `false`.
pub fn verify(secret: &[u8], payload: &[u8], signature: &str) -> bool {
    if signature.is_empty() {
        warn!("webhook_signature_missing");
        return false;
    }

    let provided = match hex::decode(signature.trim()) {
        Ok(bytes) => bytes,
        Err(_) => {
            warn!(signature_length = signature.len(), "webhook_signature_not_hex");
            return false;
        }
    };

    let mut mac = keyed_mac(secret);
    mac.update(payload);

    let valid = mac.verify_slice(&provided).is_ok();
    if !valid {
        warn!(
            payload_length = payload.len(),
            signature_length = signature.len(),
            "webhook_signature_mismatch"
        );
    }
    valid
}
