//! Nachricht versiegeln
//!
//! ```text
//! key   = 32 zufaellige Bytes (pro Nachricht)
//! nonce = 12 zufaellige Bytes
//! (ciphertext, tag) = AEAD(key, nonce, plaintext, ad.to_bytes())
//! ```

use aes_gcm::{aead::AeadInPlace, aead::KeyInit, Aes256Gcm, Key, Nonce as AesNonce};
use chacha20poly1305::{ChaCha20Poly1305, Key as ChaChaKey, Nonce as ChaChaNonce};

use crate::error::{CryptoError, CryptoResult};
use crate::types::{AssociatedData, CipherAlgorithm, Nonce, SealedMessage, SymmetricKey, TAG_LEN};

/// Verschluesselt einen Klartext mit dem Standard-Algorithmus (AES-256-GCM)
///
/// Gibt die versiegelte Nachricht und den frisch erzeugten Schluessel
/// zurueck. Der Schluessel verlaesst diese Funktion nur, damit der
/// Aufrufer ihn fuer die Empfaenger einwickeln kann.
pub fn encrypt_message(
    plaintext: &[u8],
    ad: &AssociatedData,
) -> CryptoResult<(SealedMessage, SymmetricKey)> {
    encrypt_message_mit(plaintext, ad, CipherAlgorithm::default())
}

/// Wie [`encrypt_message`], mit explizit gewaehltem Algorithmus
pub fn encrypt_message_mit(
    plaintext: &[u8],
    ad: &AssociatedData,
    algorithm: CipherAlgorithm,
) -> CryptoResult<(SealedMessage, SymmetricKey)> {
    let key = SymmetricKey::generieren();
    let nonce = Nonce::zufaellig();
    let aad = ad.to_bytes();

    let mut buffer = plaintext.to_vec();
    let tag = match algorithm {
        CipherAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
            cipher
                .encrypt_in_place_detached(AesNonce::from_slice(nonce.as_bytes()), &aad, &mut buffer)
                .map_err(|e| CryptoError::Verschluesselung(e.to_string()))?
        }
        CipherAlgorithm::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new(ChaChaKey::from_slice(key.as_bytes()));
            cipher
                .encrypt_in_place_detached(
                    ChaChaNonce::from_slice(nonce.as_bytes()),
                    &aad,
                    &mut buffer,
                )
                .map_err(|e| CryptoError::Verschluesselung(e.to_string()))?
        }
    };

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok((
        SealedMessage {
            algorithm,
            nonce,
            ciphertext: buffer,
            tag: tag_bytes,
        },
        key,
    ))
}
