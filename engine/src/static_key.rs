//! The 256-byte static key vault used by tls-auth and tls-crypt wrapping,
//! and as the output container for data-channel key expansion.
//!
//! A vault is sliced into four 64-byte quadrants. The 3-bit slice specifier
//! (cipher/hmac, encrypt/decrypt, normal/inverse) indexes a fixed permutation
//! table so the two endpoints agree on which quadrant serves which role.

use crate::error::Error;
use commonware_utils::{from_hex, hex};
use rand::{CryptoRng, Rng};
use zeroize::Zeroizing;

/// Vault size in bytes.
pub const KEY_SIZE: usize = 256;

/// Size of one direction slice in bytes.
pub const SLICE_SIZE: usize = KEY_SIZE / 4;

const PEM_HEAD: &str = "-----BEGIN OpenVPN Static key V1-----";
const PEM_FOOT: &str = "-----END OpenVPN Static key V1-----";

/// Quadrant selection per specifier. Indexed by the 3-bit specifier.
const SLICE_TABLE: [usize; 8] = [0, 1, 2, 3, 2, 3, 0, 1];

/// Bytes rendered per line.
const RENDER_LINE: usize = 16;

/// A 64-byte subkey cut from the vault. Zeroized on drop.
pub struct KeySlice(Zeroizing<[u8; SLICE_SIZE]>);

impl KeySlice {
    pub fn as_bytes(&self) -> &[u8; SLICE_SIZE] {
        &self.0
    }

    /// The leading `n` bytes of the slice, for algorithms with shorter keys.
    pub fn truncated(&self, n: usize) -> &[u8] {
        &self.0[..n.min(SLICE_SIZE)]
    }
}

impl AsRef<[u8]> for KeySlice {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

/// The full 256-byte vault. Zeroized on drop.
pub struct StaticKey(Zeroizing<[u8; KEY_SIZE]>);

impl StaticKey {
    /// Select the cipher subkey.
    pub const CIPHER: u8 = 0;
    /// Select the HMAC subkey.
    pub const HMAC: u8 = 1 << 0;
    /// Subkey for the encrypt side.
    pub const ENCRYPT: u8 = 0;
    /// Subkey for the decrypt side.
    pub const DECRYPT: u8 = 1 << 1;
    /// Normal key direction.
    pub const NORMAL: u8 = 0;
    /// Inverse key direction (the peer's view of ours).
    pub const INVERSE: u8 = 1 << 2;

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Build a vault from a slice; anything but exactly 256 bytes is refused.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, Error> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| Error::StaticKeyBadSize)?;
        Ok(Self::from_bytes(bytes))
    }

    /// Fresh random vault.
    pub fn random<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    /// Parse the PEM-bracketed hex rendering.
    ///
    /// Lines outside the BEGIN/END markers are ignored (comments, directives).
    /// Whitespace inside the body is irrelevant; the body must decode to
    /// exactly 256 bytes.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut bytes = Zeroizing::new(Vec::with_capacity(KEY_SIZE));
        let mut in_body = false;
        let mut seen_body = false;
        for line in text.lines() {
            let line = line.trim();
            if line == PEM_HEAD {
                in_body = true;
                seen_body = true;
            } else if line == PEM_FOOT {
                in_body = false;
            } else if in_body && !line.is_empty() {
                let chunk = from_hex(line).ok_or(Error::StaticKeyParse)?;
                bytes.extend_from_slice(&chunk);
                if bytes.len() > KEY_SIZE {
                    return Err(Error::StaticKeyParse);
                }
            }
        }
        if in_body || !seen_body || bytes.len() != KEY_SIZE {
            return Err(Error::StaticKeyParse);
        }
        Self::try_from_slice(&bytes).map_err(|_| Error::StaticKeyParse)
    }

    /// Render as PEM-bracketed hex, 16 bytes per line.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(KEY_SIZE * 2 + 128);
        out.push_str(PEM_HEAD);
        out.push('\n');
        for chunk in self.0.chunks(RENDER_LINE) {
            out.push_str(&hex(chunk));
            out.push('\n');
        }
        out.push_str(PEM_FOOT);
        out.push('\n');
        out
    }

    /// Cut the 64-byte subkey selected by `specifier`.
    pub fn slice(&self, specifier: u8) -> KeySlice {
        let start = SLICE_TABLE[(specifier & 7) as usize] * SLICE_SIZE;
        let mut slice = Zeroizing::new([0u8; SLICE_SIZE]);
        slice.copy_from_slice(&self.0[start..start + SLICE_SIZE]);
        KeySlice(slice)
    }

    /// Combine with another vault in place.
    pub fn xor(&mut self, other: &StaticKey) {
        for (a, b) in self.0.iter_mut().zip(other.0.iter()) {
            *a ^= b;
        }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn counting_key() -> StaticKey {
        let mut bytes = [0u8; KEY_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = i as u8;
        }
        StaticKey::from_bytes(bytes)
    }

    fn counting_text() -> String {
        let mut text = String::new();
        text.push_str(PEM_HEAD);
        text.push('\n');
        for line in 0..16 {
            for i in 0..16 {
                text.push_str(&format!("{:02x}", line * 16 + i));
            }
            text.push('\n');
        }
        text.push_str(PEM_FOOT);
        text.push('\n');
        text
    }

    #[test]
    fn test_parse_render_round_trip() {
        let text = counting_text();
        let key = StaticKey::parse(&text).unwrap();
        assert_eq!(key.as_bytes()[..], counting_key().as_bytes()[..]);
        assert_eq!(key.render(), text);
    }

    #[test]
    fn test_render_parse_identity() {
        let mut rng = StdRng::seed_from_u64(7);
        let key = StaticKey::random(&mut rng);
        let round = StaticKey::parse(&key.render()).unwrap();
        assert_eq!(round.as_bytes()[..], key.as_bytes()[..]);
    }

    #[test]
    fn test_parse_ignores_surrounding_noise() {
        let text = format!("# comment\ndirection 1\n{}trailing garbage\n", counting_text());
        let key = StaticKey::parse(&text).unwrap();
        assert_eq!(key.as_bytes()[..], counting_key().as_bytes()[..]);
    }

    #[test]
    fn test_parse_failures() {
        // Missing markers.
        assert!(matches!(
            StaticKey::parse("00ff\n"),
            Err(Error::StaticKeyParse)
        ));

        // Unterminated body.
        let mut text = counting_text();
        text = text.replace(PEM_FOOT, "");
        assert!(matches!(StaticKey::parse(&text), Err(Error::StaticKeyParse)));

        // Non-hex body.
        let text = format!("{PEM_HEAD}\nzz\n{PEM_FOOT}\n");
        assert!(matches!(StaticKey::parse(&text), Err(Error::StaticKeyParse)));

        // Wrong length.
        let text = format!("{PEM_HEAD}\n0011\n{PEM_FOOT}\n");
        assert!(matches!(StaticKey::parse(&text), Err(Error::StaticKeyParse)));
    }

    #[test]
    fn test_try_from_slice_size() {
        assert!(matches!(
            StaticKey::try_from_slice(&[0u8; 255]),
            Err(Error::StaticKeyBadSize)
        ));
        assert!(StaticKey::try_from_slice(&[0u8; 256]).is_ok());
    }

    #[test]
    fn test_slice_quadrants() {
        let key = counting_key();

        // The permutation maps (cipher, encrypt, normal) to quadrant 0 and
        // its inverse view to quadrant 2, so the two directions agree.
        let q0 = key.slice(StaticKey::CIPHER | StaticKey::ENCRYPT | StaticKey::NORMAL);
        let q1 = key.slice(StaticKey::HMAC | StaticKey::ENCRYPT | StaticKey::NORMAL);
        let q2 = key.slice(StaticKey::CIPHER | StaticKey::DECRYPT | StaticKey::NORMAL);
        let q3 = key.slice(StaticKey::HMAC | StaticKey::DECRYPT | StaticKey::NORMAL);
        assert_eq!(q0.as_bytes()[0], 0);
        assert_eq!(q1.as_bytes()[0], 64);
        assert_eq!(q2.as_bytes()[0], 128);
        assert_eq!(q3.as_bytes()[0], 192);

        let inv_enc = key.slice(StaticKey::CIPHER | StaticKey::ENCRYPT | StaticKey::INVERSE);
        let inv_dec = key.slice(StaticKey::CIPHER | StaticKey::DECRYPT | StaticKey::INVERSE);
        assert_eq!(inv_enc.as_bytes()[..], q2.as_bytes()[..]);
        assert_eq!(inv_dec.as_bytes()[..], q0.as_bytes()[..]);
    }

    #[test]
    fn test_slice_truncated() {
        let key = counting_key();
        let slice = key.slice(StaticKey::HMAC | StaticKey::ENCRYPT);
        assert_eq!(slice.truncated(20).len(), 20);
        assert_eq!(slice.truncated(20)[0], 64);
    }

    #[test]
    fn test_xor() {
        let mut a = counting_key();
        let b = counting_key();
        a.xor(&b);
        assert!(a.as_bytes().iter().all(|&byte| byte == 0));
    }
}
