//! Gemeinsame Typen fuer das Kryptografie-Subsystem

use encore_core::{GroupId, MemberId};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{CryptoError, CryptoResult};

/// Laenge eines symmetrischen Nachrichten-Schluessels
pub const SYMMETRIC_KEY_LEN: usize = 32;

/// Laenge einer Content-Nonce (AES-GCM und ChaCha20-Poly1305)
pub const NONCE_LEN: usize = 12;

/// Laenge des Auth-Tags
pub const TAG_LEN: usize = 16;

/// Maximale Laenge einer Anhang-Referenz in Bytes
pub const MAX_ATTACHMENT_REF_LEN: usize = 256;

/// Domain-Separator der Associated Data
const AD_DOMAIN: &[u8] = b"encore-ad-v1";

/// Oeffentlicher X25519-Schluessel eines Mitglieds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let arr: [u8; 32] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::UngueltigeSchluesselLaenge {
                    erwartet: 32,
                    erhalten: bytes.len(),
                })?;
        Ok(Self(arr))
    }
}

/// Sicherer Schluessel-Container (wird beim Drop genullt)
#[derive(Clone)]
pub struct SecretBytes(Vec<u8>);

impl Drop for SecretBytes {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBytes([REDACTED] {} bytes)", self.0.len())
    }
}

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Einmaliger symmetrischer Schluessel einer einzelnen Nachricht
#[derive(Debug, Clone)]
pub struct SymmetricKey(SecretBytes);

impl SymmetricKey {
    /// Erzeugt einen frischen Zufallsschluessel
    pub fn generieren() -> Self {
        let mut bytes = vec![0u8; SYMMETRIC_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(SecretBytes::new(bytes))
    }

    /// Uebernimmt Rohbytes, prueft die Laenge
    pub fn from_bytes(bytes: Vec<u8>) -> CryptoResult<Self> {
        if bytes.len() != SYMMETRIC_KEY_LEN {
            return Err(CryptoError::UngueltigeSchluesselLaenge {
                erwartet: SYMMETRIC_KEY_LEN,
                erhalten: bytes.len(),
            });
        }
        Ok(Self(SecretBytes::new(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// Algorithmus fuer die Inhalts-Verschluesselung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CipherAlgorithm {
    #[default]
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl std::str::FromStr for CipherAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aes256gcm" | "AES256_GCM" => Ok(Self::Aes256Gcm),
            "chacha20poly1305" | "CHA_CHA20_POLY1305" => Ok(Self::ChaCha20Poly1305),
            other => Err(format!("Unbekannter Algorithmus: '{other}'")),
        }
    }
}

/// Zufaellige 12-Byte-Nonce
///
/// Jede Nachricht hat ihren eigenen Schluessel, eine Wiederholung unter
/// demselben Schluessel ist damit ausgeschlossen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce(pub [u8; NONCE_LEN]);

impl Nonce {
    pub fn zufaellig() -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> CryptoResult<Self> {
        let arr: [u8; NONCE_LEN] = bytes.try_into().map_err(|_| CryptoError::UngueltigeNonce {
            erwartet: NONCE_LEN,
            erhalten: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

/// Associated Data einer Nachricht
///
/// Bindet Gruppe, Epoch, Position und Absender an den Auth-Tag. Ein
/// Ciphertext kann dadurch nicht unbemerkt in eine andere Gruppe, Epoch
/// oder Sequenz-Position verschoben werden.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociatedData {
    pub group_id: GroupId,
    pub epoch: u64,
    pub sequence: u64,
    pub sender_id: MemberId,
    /// Opaque Referenz auf einen extern gehaltenen Anhang
    pub attachment: Option<String>,
}

impl AssociatedData {
    /// Kanonische Byte-Kodierung
    ///
    /// ```text
    /// "encore-ad-v1" | group_id(16) | epoch(8 BE) | sequence(8 BE) | sender_id(16)
    ///   | has_attachment(1) [| attachment_len(8 BE) | attachment]
    /// ```
    ///
    /// Die Anhang-Referenz wird vollstaendig gebunden. Die Laengen-Grenze
    /// `MAX_ATTACHMENT_REF_LEN` prueft `Envelope::validieren`, nicht diese
    /// Kodierung.
    pub fn to_bytes(&self) -> Vec<u8> {
        let anhang = self.attachment.as_deref().map(str::as_bytes);
        let mut out = Vec::with_capacity(
            AD_DOMAIN.len() + 16 + 8 + 8 + 16 + 1 + anhang.map_or(0, |a| 8 + a.len()),
        );
        out.extend_from_slice(AD_DOMAIN);
        out.extend_from_slice(self.group_id.as_bytes());
        out.extend_from_slice(&self.epoch.to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(self.sender_id.as_bytes());
        match anhang {
            Some(a) => {
                out.push(1);
                out.extend_from_slice(&(a.len() as u64).to_be_bytes());
                out.extend_from_slice(a);
            }
            None => out.push(0),
        }
        out
    }
}

/// Ergebnis der Inhalts-Verschluesselung (Nonce + Ciphertext + Auth-Tag)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedMessage {
    pub algorithm: CipherAlgorithm,
    pub nonce: Nonce,
    /// Ciphertext ohne Tag (gleiche Laenge wie der Klartext)
    pub ciphertext: Vec<u8>,
    /// 16 Bytes Auth-Tag (detached)
    pub tag: [u8; TAG_LEN],
}

/// Ein fuer genau einen Empfaenger eingewickelter Nachrichten-Schluessel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKeyBlob(pub Vec<u8>);

impl WrappedKeyBlob {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}
