//! KeyStore – Mitglieds-Schluesselpaare und Key-Wrapping
//!
//! Jedes Mitglied besitzt ein X25519-Schluesselpaar. Der private Teil bleibt
//! als opaker `PrivateKeyHandle` beim Mitglied und wird nie serialisiert.
//!
//! Pro Nachricht wird ein frischer symmetrischer Schluessel erzeugt und fuer
//! jeden Empfaenger einzeln eingewickelt (ECIES-aehnlich):
//! 1. Ephemeres X25519-Schluessel-Paar generieren
//! 2. DH mit Empfaenger-Public-Key
//! 3. HKDF -> Wrapping Key
//! 4. AES-256-GCM verschluesseln
//!
//! ## Blob-Format
//! ```text
//! [version(1)] [fingerprint(8)] [ephemeral_public(32)] [nonce(12)] [ciphertext + tag(48)]
//! ```
//!
//! ## Rotation
//! Bei einem Epoch-Wechsel wird nichts neu eingewickelt. Nur neue Nachrichten
//! bekommen Wrapped Keys fuer die neue Mitgliederliste. Entfernte Mitglieder
//! behalten damit Zugriff auf Nachrichten, die bereits fuer sie eingewickelt
//! wurden (Forward Secrecy erst ab der naechsten Nachricht).

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce as AesNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use rayon::prelude::*;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};

use crate::error::{CryptoError, CryptoResult};
use crate::kdf::{fingerprint, hkdf_derive};
use crate::types::{PublicKey, SymmetricKey, WrappedKeyBlob, SYMMETRIC_KEY_LEN};

const WRAP_VERSION: u8 = 1;
const WRAP_INFO: &[u8] = b"encore-key-wrap-v1";
const HEADER_LEN: usize = 1 + 8 + 32;
const WRAP_NONCE_LEN: usize = 12;
const WRAPPED_LEN: usize = HEADER_LEN + WRAP_NONCE_LEN + SYMMETRIC_KEY_LEN + 16;

/// Ab dieser Empfaengerzahl wird parallel eingewickelt
const PARALLEL_AB: usize = 16;

/// Opaker Handle auf den privaten Schluessel eines Mitglieds
///
/// Bewusst weder `Clone` noch `Serialize`.
pub struct PrivateKeyHandle {
    secret: StaticSecret,
    public: PublicKey,
}

impl PrivateKeyHandle {
    /// Oeffentlicher Schluessel zu diesem Handle
    pub fn public_key(&self) -> PublicKey {
        self.public
    }
}

impl std::fmt::Debug for PrivateKeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKeyHandle {{ secret: [REDACTED] }}")
    }
}

/// Erzeugt ein neues X25519-Schluesselpaar fuer ein Mitglied
pub fn generate_member_keypair() -> (PublicKey, PrivateKeyHandle) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
    (public, PrivateKeyHandle { secret, public })
}

/// Wickelt einen Nachrichten-Schluessel fuer einen Empfaenger ein
///
/// Jeder Aufruf nutzt ein neues ephemeres Schluesselpaar und eine neue
/// Nonce, zwei Blobs fuer denselben Schluessel sind daher nie gleich.
pub fn wrap_for_recipient(
    key: &SymmetricKey,
    recipient: &PublicKey,
) -> CryptoResult<WrappedKeyBlob> {
    let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

    let recipient_pk = X25519PublicKey::from(*recipient.as_bytes());
    let dh_output = ephemeral_secret.diffie_hellman(&recipient_pk);

    let wrapping_key = hkdf_derive(dh_output.as_bytes(), recipient.as_bytes(), WRAP_INFO, 32)?;

    let mut header = Vec::with_capacity(HEADER_LEN);
    header.push(WRAP_VERSION);
    header.extend_from_slice(&fingerprint(recipient.as_bytes()));
    header.extend_from_slice(ephemeral_public.as_bytes());

    let mut nonce_bytes = [0u8; WRAP_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&wrapping_key));
    let ciphertext = cipher
        .encrypt(
            AesNonce::from_slice(&nonce_bytes),
            Payload {
                msg: key.as_bytes(),
                aad: &header,
            },
        )
        .map_err(|e| CryptoError::Verschluesselung(e.to_string()))?;

    let mut out = header;
    out.reserve(WRAP_NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(WrappedKeyBlob(out))
}

/// Packt einen Wrapped Key mit dem eigenen privaten Schluessel aus
///
/// - `KeyMismatch`: der Blob wurde fuer einen anderen Schluessel erstellt
/// - `Corrupt`: Format kaputt oder Integritaetspruefung fehlgeschlagen
pub fn unwrap(blob: &WrappedKeyBlob, own: &PrivateKeyHandle) -> CryptoResult<SymmetricKey> {
    let bytes = blob.as_bytes();
    if bytes.len() != WRAPPED_LEN {
        return Err(CryptoError::Corrupt(format!(
            "Laenge {} statt {}",
            bytes.len(),
            WRAPPED_LEN
        )));
    }
    if bytes[0] != WRAP_VERSION {
        return Err(CryptoError::Corrupt(format!("Unbekannte Version {}", bytes[0])));
    }
    if bytes[1..9] != fingerprint(own.public.as_bytes()) {
        return Err(CryptoError::KeyMismatch);
    }

    let header = &bytes[..HEADER_LEN];
    let mut ephemeral_bytes = [0u8; 32];
    ephemeral_bytes.copy_from_slice(&bytes[9..HEADER_LEN]);
    let nonce_bytes = &bytes[HEADER_LEN..HEADER_LEN + WRAP_NONCE_LEN];
    let ciphertext = &bytes[HEADER_LEN + WRAP_NONCE_LEN..];

    let dh_output = own
        .secret
        .diffie_hellman(&X25519PublicKey::from(ephemeral_bytes));
    let wrapping_key = hkdf_derive(dh_output.as_bytes(), own.public.as_bytes(), WRAP_INFO, 32)?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&wrapping_key));
    let plaintext = cipher
        .decrypt(
            AesNonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad: header,
            },
        )
        .map_err(|_| CryptoError::Corrupt("Integritaetspruefung fehlgeschlagen".to_string()))?;

    SymmetricKey::from_bytes(plaintext)
}

/// Wickelt einen Schluessel fuer eine ganze Mitgliederliste ein
///
/// Jeder Wrapped Key ist unabhaengig; grosse Listen werden ueber rayon
/// parallel verarbeitet. Die Reihenfolge der Eingabe bleibt erhalten.
pub fn wrap_for_members<I>(
    key: &SymmetricKey,
    recipients: &[(I, PublicKey)],
) -> CryptoResult<Vec<(I, WrappedKeyBlob)>>
where
    I: Clone + Send + Sync,
{
    let einwickeln = |(id, pk): &(I, PublicKey)| {
        wrap_for_recipient(key, pk).map(|blob| (id.clone(), blob))
    };

    let ergebnis: CryptoResult<Vec<_>> = if recipients.len() >= PARALLEL_AB {
        recipients.par_iter().map(einwickeln).collect()
    } else {
        recipients.iter().map(einwickeln).collect()
    };
    tracing::trace!(empfaenger = recipients.len(), "Nachrichten-Schluessel eingewickelt");
    ergebnis
}

/// Lokaler Schluesselspeicher eines einzelnen Mitglieds
///
/// Haelt den privaten Schluessel exklusiv; nach aussen geht nur der
/// oeffentliche Teil.
#[derive(Debug)]
pub struct KeyStore {
    handle: PrivateKeyHandle,
}

impl KeyStore {
    /// Erzeugt einen KeyStore mit frischem Schluesselpaar
    pub fn generieren() -> Self {
        let (_, handle) = generate_member_keypair();
        Self { handle }
    }

    /// Uebernimmt einen bestehenden Handle
    pub fn aus_handle(handle: PrivateKeyHandle) -> Self {
        Self { handle }
    }

    pub fn public_key(&self) -> PublicKey {
        self.handle.public
    }

    /// Packt einen an dieses Mitglied adressierten Wrapped Key aus
    pub fn unwrap(&self, blob: &WrappedKeyBlob) -> CryptoResult<SymmetricKey> {
        unwrap(blob, &self.handle)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_und_unwrap_roundtrip() {
        let (public, handle) = generate_member_keypair();
        let key = SymmetricKey::generieren();

        let wrapped = wrap_for_recipient(&key, &public).unwrap();
        assert_eq!(wrapped.as_bytes().len(), WRAPPED_LEN);

        let unwrapped = unwrap(&wrapped, &handle).unwrap();
        assert_eq!(unwrapped.as_bytes(), key.as_bytes());
    }

    #[test]
    fn wrap_ist_nicht_deterministisch() {
        let (public, _) = generate_member_keypair();
        let key = SymmetricKey::generieren();

        let a = wrap_for_recipient(&key, &public).unwrap();
        let b = wrap_for_recipient(&key, &public).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn fremder_schluessel_ergibt_key_mismatch() {
        let (public, _) = generate_member_keypair();
        let (_, fremd) = generate_member_keypair();
        let key = SymmetricKey::generieren();

        let wrapped = wrap_for_recipient(&key, &public).unwrap();
        let result = unwrap(&wrapped, &fremd);
        assert!(matches!(result, Err(CryptoError::KeyMismatch)));
    }

    #[test]
    fn manipulierter_blob_ergibt_corrupt() {
        let (public, handle) = generate_member_keypair();
        let key = SymmetricKey::generieren();

        let mut wrapped = wrap_for_recipient(&key, &public).unwrap();
        let letzter = wrapped.0.len() - 1;
        wrapped.0[letzter] ^= 0x01;

        assert!(matches!(unwrap(&wrapped, &handle), Err(CryptoError::Corrupt(_))));
    }

    #[test]
    fn manipulierter_header_ergibt_corrupt() {
        let (public, handle) = generate_member_keypair();
        let key = SymmetricKey::generieren();

        let mut wrapped = wrap_for_recipient(&key, &public).unwrap();
        // Ephemeren Public Key veraendern
        wrapped.0[20] ^= 0x80;

        assert!(matches!(unwrap(&wrapped, &handle), Err(CryptoError::Corrupt(_))));
    }

    #[test]
    fn zu_kurzer_blob_ergibt_corrupt() {
        let (_, handle) = generate_member_keypair();
        let result = unwrap(&WrappedKeyBlob(vec![1u8; 10]), &handle);
        assert!(matches!(result, Err(CryptoError::Corrupt(_))));
    }

    #[test]
    fn wrap_for_members_behaelt_reihenfolge() {
        let key = SymmetricKey::generieren();
        let paare: Vec<_> = (0..40).map(|_| generate_member_keypair()).collect();
        let empfaenger: Vec<(usize, PublicKey)> =
            paare.iter().enumerate().map(|(i, (pk, _))| (i, *pk)).collect();

        let wrapped = wrap_for_members(&key, &empfaenger).unwrap();
        assert_eq!(wrapped.len(), 40);

        for (i, (id, blob)) in wrapped.iter().enumerate() {
            assert_eq!(*id, i);
            let unwrapped = unwrap(blob, &paare[i].1).unwrap();
            assert_eq!(unwrapped.as_bytes(), key.as_bytes());
        }
    }

    #[test]
    fn keystore_debug_verraet_nichts() {
        let store = KeyStore::generieren();
        let dbg = format!("{store:?}");
        assert!(dbg.contains("REDACTED"));
    }

    #[test]
    fn keystore_unwrap() {
        let store = KeyStore::generieren();
        let key = SymmetricKey::generieren();
        let wrapped = wrap_for_recipient(&key, &store.public_key()).unwrap();
        assert_eq!(store.unwrap(&wrapped).unwrap().as_bytes(), key.as_bytes());
    }
}
