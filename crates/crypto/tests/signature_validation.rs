use neuron_crypto::{verify_signature, KeyError, KeyPair, Keystore};
use neuron_types::{MessageHeader, RequestKind, SignedRequest};

const DETERMINISTIC_SEED: [u8; 32] = [42u8; 32];

#[test]
fn ed25519_signature_roundtrip_succeeds() {
    let key_pair = KeyPair::generate();
    let message = b"neuron::crypto::signature::roundtrip";

    let signature = key_pair.sign(message);
    assert!(key_pair.verify(message, &signature).is_ok());
}

#[test]
fn ed25519_signature_rejects_tampered_signature() {
    let key_pair = KeyPair::generate();
    let message = b"neuron::crypto::signature::tamper-check";

    let mut signature = key_pair.sign(message);
    signature[0] ^= 0xFF;

    assert!(key_pair.verify(message, &signature).is_err());
}

#[test]
fn deterministic_keypair_generation_is_reproducible() {
    let first = KeyPair::from_secret_bytes(&DETERMINISTIC_SEED);
    let again = KeyPair::from_secret_bytes(&DETERMINISTIC_SEED);
    assert_eq!(first.public_key(), again.public_key());

    let message = b"neuron::crypto::deterministic-keypair";
    assert_eq!(first.sign(message), again.sign(message));

    let alternative = KeyPair::from_secret_bytes(&[7u8; 32]);
    assert_ne!(first.public_key(), alternative.public_key());
}

#[test]
fn keystore_signed_request_verifies_against_sender_key() {
    let keystore = Keystore::new(KeyPair::from_secret_bytes(&DETERMINISTIC_SEED));
    let header = MessageHeader {
        sender: keystore.public_identifier().unwrap(),
        nonce: 1,
        timestamp_ms: 1_700_000_000_000,
    };
    let message = SignedRequest::signing_bytes(&header, &RequestKind::OPTIMIZE, b"{}");
    let signature = keystore.sign(&message).unwrap();

    assert!(verify_signature(&header.sender, &message, &signature).is_ok());

    let stranger = KeyPair::generate().public_key();
    assert!(matches!(
        verify_signature(&stranger, &message, &signature),
        Err(KeyError::InvalidSignature)
    ));
}
