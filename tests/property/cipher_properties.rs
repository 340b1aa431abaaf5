//! Property tests for the message cipher and its wire framing.
//!
//! 1. Any plaintext survives encrypt → wire string → decrypt.
//! 2. A different key never opens a sealed message.
//! 3. Any blob shorter than a nonce is rejected, never panics.
//! 4. Arbitrary base64 input never panics `decode_wire`.

use chrono::Utc;
use proptest::prelude::*;
use sealchat::crypto::{CryptoError, NONCE_SIZE};
use sealchat::crypto::cipher::{self, EncryptedMessage};
use sealchat::crypto::key::GlobalKey;
use sealchat_proto::message::MessageKind;

fn arb_key() -> impl Strategy<Value = GlobalKey> {
    any::<[u8; 32]>().prop_map(|bytes| GlobalKey::from_bytes(bytes, Utc::now()))
}

fn arb_kind() -> impl Strategy<Value = MessageKind> {
    prop_oneof![Just(MessageKind::Text), Just(MessageKind::File)]
}

proptest! {
    /// Sealing then opening returns the original bytes.
    #[test]
    fn round_trip_through_wire_string(
        key in arb_key(),
        kind in arb_kind(),
        plaintext in prop::collection::vec(any::<u8>(), 0..2048),
    ) {
        let sealed = cipher::encrypt("alice", kind, &plaintext, &key).expect("encrypt");
        let wire = cipher::encode_wire(&sealed);

        let reopened = EncryptedMessage::from_wire_string("alice", sealed.created_at, kind, &wire)
            .expect("wire string should parse");
        prop_assert_eq!(reopened.nonce, sealed.nonce);

        let opened = cipher::decrypt(&reopened, &key).expect("decrypt");
        prop_assert_eq!(opened, plaintext);
    }

    /// A message sealed under one key fails to open under any other.
    #[test]
    fn wrong_key_never_decrypts(
        a in any::<[u8; 32]>(),
        b in any::<[u8; 32]>(),
        plaintext in prop::collection::vec(any::<u8>(), 1..256),
    ) {
        prop_assume!(a != b);
        let key_a = GlobalKey::from_bytes(a, Utc::now());
        let key_b = GlobalKey::from_bytes(b, Utc::now());

        let sealed = cipher::encrypt("alice", MessageKind::Text, &plaintext, &key_a).expect("encrypt");
        let result = cipher::decrypt(&sealed, &key_b);
        prop_assert!(matches!(result, Err(CryptoError::Decryption { .. })), "expected Decryption error, got {:?}", result);
    }

    /// Blobs shorter than a nonce are rejected with their length.
    #[test]
    fn short_blobs_rejected(blob in prop::collection::vec(any::<u8>(), 0..NONCE_SIZE)) {
        let len = blob.len();
        let result = EncryptedMessage::from_wire_bytes("bob", Utc::now(), MessageKind::Text, &blob);
        prop_assert!(
            matches!(result, Err(CryptoError::CiphertextTooShort { len: l }) if l == len),
            "expected CiphertextTooShort, got {:?}", result
        );
    }

    /// Arbitrary text never panics the wire decoder.
    #[test]
    fn decode_wire_never_panics(text in "\\PC{0,64}") {
        let _ = cipher::decode_wire(&text);
    }
}
