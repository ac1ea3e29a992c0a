use webhook_relay::{signature_header_value, verify_webhook_request, VerificationError};

fn main() {
    let secret = b"supersecret";
    let payload = br#"{"id":123}"#;
    let signature = signature_header_value(secret, payload);

    let headers = vec![
        ("X-Webhook-Signature", signature.as_str()),
        ("X-Webhook-Delivery", "9b2f6c1e-8a52-4c7e-b1a4-3f0d5e6a7b8c"),
        ("X-Webhook-Event", "order.created"),
        ("X-Webhook-Id", "orders"),
    ];

    match verify_webhook_request(headers.iter().copied(), payload, secret) {
        Ok(delivery_id) => println!("verified delivery {}", delivery_id),
        Err(VerificationError::InvalidSignature) => println!("signature mismatch"),
        Err(e) => println!("rejected: {:?}", e),
    }

    let tampered = br#"{"id":124}"#;
    assert_eq!(
        verify_webhook_request(headers.iter().copied(), tampered, secret),
        Err(VerificationError::InvalidSignature)
    );
}
