//! # encore-crypto
//!
//! Hybride Ende-zu-Ende Verschluesselung fuer Encore-Gruppen.
//!
//! ## Module
//! - `keystore` - X25519 Mitglieds-Schluessel und Key-Wrapping
//! - `cipher` - Inhalts-Verschluesselung (AEAD mit Associated Data)
//! - `kdf` - HKDF und Schluessel-Fingerprints
//! - `types` - Gemeinsame Typen (SymmetricKey, Nonce, SealedMessage, etc.)
//! - `error` - Fehlertypen

pub mod cipher;
pub mod error;
pub mod kdf;
pub mod keystore;
pub mod types;

// Bequeme Re-Exports
pub use cipher::{decrypt_message, encrypt_message, encrypt_message_mit};
pub use error::{CryptoError, CryptoResult};
pub use keystore::{
    generate_member_keypair, unwrap, wrap_for_members, wrap_for_recipient, KeyStore,
    PrivateKeyHandle,
};
pub use types::{
    AssociatedData, CipherAlgorithm, Nonce, PublicKey, SealedMessage, SymmetricKey,
    WrappedKeyBlob, MAX_ATTACHMENT_REF_LEN, NONCE_LEN, TAG_LEN,
};
