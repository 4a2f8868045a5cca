//! Cipher and digest capability descriptors shared by the control-channel
//! wrappers and the data-channel suites.
//!
//! Algorithms are plain value-carrying enums: a slot holds the descriptor and
//! the key bytes, never a trait object.

use crate::{error::Error, static_key::StaticKey};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Which half of a key vault this endpoint encrypts with.
///
/// The two endpoints must pick opposite directions unless the key is used
/// bidirectionally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyDirection {
    /// Same subkeys both ways.
    Bidirectional,
    /// `key-direction 0`.
    Normal,
    /// `key-direction 1` (the usual client setting).
    Inverse,
}

impl KeyDirection {
    /// The vault slice specifier for this endpoint's `role` subkey on the
    /// encrypt or decrypt side.
    pub fn specifier(&self, role: u8, encrypt: bool) -> u8 {
        match self {
            Self::Bidirectional => role | StaticKey::ENCRYPT,
            Self::Normal => {
                role | if encrypt {
                    StaticKey::ENCRYPT
                } else {
                    StaticKey::DECRYPT
                }
            }
            Self::Inverse => {
                role | StaticKey::INVERSE
                    | if encrypt {
                        StaticKey::ENCRYPT
                    } else {
                        StaticKey::DECRYPT
                    }
            }
        }
    }
}

/// HMAC digest used for packet authentication.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthAlg {
    Sha1,
    Sha256,
}

impl AuthAlg {
    /// Tag and key length in bytes.
    pub fn size(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Parse a configuration name (as in `--auth`).
    pub fn parse(name: &str) -> Result<Self, Error> {
        match name.to_ascii_uppercase().as_str() {
            "SHA1" => Ok(Self::Sha1),
            "SHA256" => Ok(Self::Sha256),
            _ => Err(Error::Config("unsupported auth digest")),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
        }
    }
}

/// Data-channel cipher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherAlg {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
    Aes256Cbc,
}

impl CipherAlg {
    pub fn key_len(&self) -> usize {
        match self {
            Self::Aes128Gcm => 16,
            Self::Aes256Gcm | Self::ChaCha20Poly1305 | Self::Aes256Cbc => 32,
        }
    }

    /// AEAD suites carry their own tag and need no separate HMAC.
    pub fn is_aead(&self) -> bool {
        !matches!(self, Self::Aes256Cbc)
    }

    /// Parse a configuration name (as in `--cipher`).
    pub fn parse(name: &str) -> Result<Self, Error> {
        match name.to_ascii_uppercase().as_str() {
            "AES-128-GCM" => Ok(Self::Aes128Gcm),
            "AES-256-GCM" => Ok(Self::Aes256Gcm),
            "CHACHA20-POLY1305" => Ok(Self::ChaCha20Poly1305),
            "AES-256-CBC" => Ok(Self::Aes256Cbc),
            _ => Err(Error::Config("unsupported cipher")),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Aes128Gcm => "AES-128-GCM",
            Self::Aes256Gcm => "AES-256-GCM",
            Self::ChaCha20Poly1305 => "CHACHA20-POLY1305",
            Self::Aes256Cbc => "AES-256-CBC",
        }
    }
}

/// HMAC over a list of byte slices.
pub fn hmac_tag(alg: AuthAlg, key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    match alg {
        AuthAlg::Sha1 => {
            let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key).expect("hmac accepts any key");
            for part in parts {
                mac.update(part);
            }
            mac.finalize().into_bytes().to_vec()
        }
        AuthAlg::Sha256 => {
            let mut mac =
                <Hmac<Sha256> as Mac>::new_from_slice(key).expect("hmac accepts any key");
            for part in parts {
                mac.update(part);
            }
            mac.finalize().into_bytes().to_vec()
        }
    }
}

/// Constant-time tag comparison.
pub fn hmac_verify(alg: AuthAlg, key: &[u8], parts: &[&[u8]], tag: &[u8]) -> bool {
    let expected = hmac_tag(alg, key, parts);
    expected.len() == tag.len() && bool::from(expected.ct_eq(tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alg_parse() {
        assert_eq!(AuthAlg::parse("sha1").unwrap(), AuthAlg::Sha1);
        assert_eq!(AuthAlg::parse("SHA256").unwrap(), AuthAlg::Sha256);
        assert!(AuthAlg::parse("md5").is_err());

        assert_eq!(CipherAlg::parse("aes-256-gcm").unwrap(), CipherAlg::Aes256Gcm);
        assert!(CipherAlg::parse("bf-cbc").is_err());
        assert!(!CipherAlg::Aes256Cbc.is_aead());
        assert!(CipherAlg::ChaCha20Poly1305.is_aead());
    }

    #[test]
    fn test_hmac_round_trip() {
        let key = [7u8; 20];
        let tag = hmac_tag(AuthAlg::Sha1, &key, &[b"hello", b" world"]);
        assert_eq!(tag.len(), 20);
        assert!(hmac_verify(AuthAlg::Sha1, &key, &[b"hello", b" world"], &tag));
        assert!(!hmac_verify(AuthAlg::Sha1, &key, &[b"hello"], &tag));

        let mut bad = tag.clone();
        bad[0] ^= 1;
        assert!(!hmac_verify(AuthAlg::Sha1, &key, &[b"hello", b" world"], &bad));
    }

    #[test]
    fn test_hmac_split_invariance() {
        let key = [1u8; 32];
        let joined = hmac_tag(AuthAlg::Sha256, &key, &[b"ab cd"]);
        let split = hmac_tag(AuthAlg::Sha256, &key, &[b"ab", b" ", b"cd"]);
        assert_eq!(joined, split);
    }
}
