use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const DELIVERY_HEADER: &str = "X-Webhook-Delivery";
pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const WEBHOOK_ID_HEADER: &str = "X-Webhook-Id";

const SIGNATURE_PREFIX: &str = "sha256=";

/// Headers the dispatcher owns. Custom headers may not replace them.
pub const RESERVED_HEADERS: [&str; 5] = [
    "content-type",
    "x-webhook-signature",
    "x-webhook-delivery",
    "x-webhook-event",
    "x-webhook-id",
];

fn mac_for(secret: &[u8]) -> HmacSha256 {
    match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA256 accepts keys of any length"),
    }
}

/// Hex-encoded HMAC-SHA256 of `payload` under `secret`.
///
/// `payload` must be the exact buffer that goes on the wire.
pub fn sign(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = mac_for(secret);
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Value of the signature header: `sha256=<hex mac>`.
pub fn signature_header_value(secret: &[u8], payload: &[u8]) -> String {
    format!("{}{}", SIGNATURE_PREFIX, sign(secret, payload))
}

/// Verify a received signature header value in constant time.
///
/// Accepts the value with or without the `sha256=` prefix.
pub fn verify_signature(secret: &[u8], payload: &[u8], signature: &str) -> bool {
    let hex_part = signature.strip_prefix(SIGNATURE_PREFIX).unwrap_or(signature);
    let Ok(expected) = hex::decode(hex_part) else {
        return false;
    };

    let mut mac = mac_for(secret);
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug, Clone, Default)]
pub struct ParsedSignature {
    pub signature: Option<String>,
    pub delivery_id: Option<String>,
    pub event: Option<String>,
    pub webhook_id: Option<String>,
}

/// Pick the delivery headers out of a header list, case-insensitively.
pub fn parse_signature_headers<'a, I>(headers: I) -> ParsedSignature
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut parsed = ParsedSignature::default();

    for (name, value) in headers {
        let value = Some(value.to_string());
        if name.eq_ignore_ascii_case(SIGNATURE_HEADER) {
            parsed.signature = value;
        } else if name.eq_ignore_ascii_case(DELIVERY_HEADER) {
            parsed.delivery_id = value;
        } else if name.eq_ignore_ascii_case(EVENT_HEADER) {
            parsed.event = value;
        } else if name.eq_ignore_ascii_case(WEBHOOK_ID_HEADER) {
            parsed.webhook_id = value;
        }
    }

    parsed
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    MissingDeliveryId,
    InvalidSignature,
}

/// Verify an incoming webhook request in one call.
///
/// Returns the delivery id, which receivers should use to drop duplicates.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    payload: &[u8],
    secret: &[u8],
) -> Result<String, VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let parsed = parse_signature_headers(headers);
    let signature = parsed.signature.ok_or(VerificationError::MissingSignature)?;
    let delivery_id = parsed.delivery_id.ok_or(VerificationError::MissingDeliveryId)?;

    if verify_signature(secret, payload, &signature) {
        Ok(delivery_id)
    } else {
        Err(VerificationError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2
        let mac = sign(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            mac,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn header_value_is_prefixed() {
        let value = signature_header_value(b"secret", br#"{"taskId":"123"}"#);
        assert!(value.starts_with("sha256="));
        assert_eq!(value.len(), "sha256=".len() + 64);
    }

    #[test]
    fn verify_detects_tampering() {
        let payload = br#"{"taskId":"123"}"#;
        let header = signature_header_value(b"secret", payload);
        assert!(verify_signature(b"secret", payload, &header));
        assert!(!verify_signature(b"secret", br#"{"taskId": "123"}"#, &header));
        assert!(!verify_signature(b"other", payload, &header));
        assert!(!verify_signature(b"secret", payload, "sha256=zz"));
    }

    #[test]
    fn verify_request_returns_delivery_id() {
        let payload = br#"{"id":1}"#;
        let sig = signature_header_value(b"k", payload);
        let headers = vec![
            ("x-webhook-signature", sig.as_str()),
            ("X-Webhook-Delivery", "d-1"),
        ];
        assert_eq!(
            verify_webhook_request(headers.iter().copied(), payload, b"k"),
            Ok("d-1".to_string())
        );

        let missing = vec![("X-Webhook-Delivery", "d-1")];
        assert_eq!(
            verify_webhook_request(missing.iter().copied(), payload, b"k"),
            Err(VerificationError::MissingSignature)
        );
    }
}
