//! HKDF-SHA256 Key Derivation

use hkdf::Hkdf;
use sha2::{Digest, Sha256};

use crate::error::{CryptoError, CryptoResult};

/// HKDF-basierte Key Derivation (allgemein verwendbar)
pub fn hkdf_derive(ikm: &[u8], salt: &[u8], info: &[u8], len: usize) -> CryptoResult<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; len];
    hk.expand(info, &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(okm)
}

/// Kurzer Fingerprint eines oeffentlichen Schluessels (erste 8 Bytes SHA-256)
pub fn fingerprint(public_key: &[u8; 32]) -> [u8; 8] {
    let digest = Sha256::digest(public_key);
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hkdf_derive_deterministisch() {
        let key1 = hkdf_derive(b"ikm", b"salt", b"info", 32).unwrap();
        let key2 = hkdf_derive(b"ikm", b"salt", b"info", 32).unwrap();
        assert_eq!(key1, key2);
        assert_eq!(key1.len(), 32);
    }

    #[test]
    fn hkdf_verschiedene_infos_geben_verschiedene_keys() {
        let key1 = hkdf_derive(b"ikm", b"salt", b"info-1", 32).unwrap();
        let key2 = hkdf_derive(b"ikm", b"salt", b"info-2", 32).unwrap();
        assert_ne!(key1, key2);
    }

    #[test]
    fn hkdf_zu_lange_ausgabe_schlaegt_fehl() {
        // HKDF-SHA256 erlaubt maximal 255 * 32 Bytes
        assert!(hkdf_derive(b"ikm", b"salt", b"info", 255 * 32 + 1).is_err());
    }

    #[test]
    fn fingerprint_unterscheidet_schluessel() {
        assert_ne!(fingerprint(&[1u8; 32]), fingerprint(&[2u8; 32]));
        assert_eq!(fingerprint(&[7u8; 32]), fingerprint(&[7u8; 32]));
    }
}
