//! Nachricht pruefen und entschluesseln

use aes_gcm::{aead::AeadInPlace, aead::KeyInit, Aes256Gcm, Key, Nonce as AesNonce, Tag};
use chacha20poly1305::{ChaCha20Poly1305, Key as ChaChaKey, Nonce as ChaChaNonce};

use crate::error::{CryptoError, CryptoResult};
use crate::types::{AssociatedData, CipherAlgorithm, SealedMessage, SymmetricKey};

/// Prueft den Auth-Tag und entschluesselt
///
/// Jede Abweichung in Ciphertext, Tag, Nonce oder Associated Data ergibt
/// `AuthenticationFailure`. Teilweise entschluesselte Daten werden nie
/// herausgegeben.
pub fn decrypt_message(
    sealed: &SealedMessage,
    key: &SymmetricKey,
    ad: &AssociatedData,
) -> CryptoResult<Vec<u8>> {
    let aad = ad.to_bytes();
    let mut buffer = sealed.ciphertext.clone();
    let tag = Tag::from_slice(&sealed.tag);

    let result = match sealed.algorithm {
        CipherAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
            cipher.decrypt_in_place_detached(
                AesNonce::from_slice(sealed.nonce.as_bytes()),
                &aad,
                &mut buffer,
                tag,
            )
        }
        CipherAlgorithm::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new(ChaChaKey::from_slice(key.as_bytes()));
            cipher.decrypt_in_place_detached(
                ChaChaNonce::from_slice(sealed.nonce.as_bytes()),
                &aad,
                &mut buffer,
                chacha20poly1305::Tag::from_slice(&sealed.tag),
            )
        }
    };

    match result {
        Ok(()) => Ok(buffer),
        Err(_) => {
            buffer.iter_mut().for_each(|b| *b = 0);
            Err(CryptoError::AuthenticationFailure)
        }
    }
}
