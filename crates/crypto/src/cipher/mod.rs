//! Cipher Engine – Inhalts-Verschluesselung einzelner Nachrichten
//!
//! Jede Nachricht bekommt einen frischen symmetrischen Schluessel und eine
//! zufaellige Nonce. Der Auth-Tag wird getrennt vom Ciphertext gefuehrt und
//! deckt zusaetzlich die Associated Data ab.
//!
//! ## Module
//! - `encrypt` - Nachricht versiegeln
//! - `decrypt` - Nachricht pruefen und entschluesseln

pub mod decrypt;
pub mod encrypt;

pub use decrypt::decrypt_message;
pub use encrypt::{encrypt_message, encrypt_message_mit};
