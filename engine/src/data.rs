//! Data-channel packet processing: per-slot cipher contexts, the outbound
//! encrypt/authenticate pipeline, and the inbound verify → replay-check →
//! decrypt pipeline.
//!
//! Body layouts by suite:
//!
//! - AEAD: `[packet-id, ciphertext, tag]`, nonce = packet-id ‖ implicit IV
//!   (eight bytes cut from the HMAC subkey), header and packet-id bound as
//!   associated data.
//! - CBC:  `[packet-id, IV, ciphertext, HMAC]`, HMAC over header ‖
//!   packet-id ‖ IV ‖ ciphertext, random IV per packet.

use crate::{
    crypto::{self, AuthAlg, CipherAlg, KeyDirection},
    error::Error,
    packet_id::{self, ReplayWindow},
    static_key::StaticKey,
    types::DataRecord,
};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes_gcm::{
    aead::{Aead, Payload},
    Aes128Gcm, Aes256Gcm, KeyInit,
};
use bytes::{BufMut, Bytes, BytesMut};
use chacha20poly1305::ChaCha20Poly1305;
use rand::{CryptoRng, Rng};
use zeroize::Zeroizing;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AEAD nonce length: 4-byte packet-id plus 8 bytes of implicit IV.
const NONCE_LEN: usize = 12;
const IMPLICIT_IV_LEN: usize = 8;
const AEAD_TAG_LEN: usize = 16;
const CBC_IV_LEN: usize = 16;
const PACKET_ID_LEN: usize = 4;

/// Keepalive ping payload; filtered from tun delivery on receipt.
pub const PING: [u8; 16] = [
    0x2a, 0x18, 0x7b, 0xf3, 0x64, 0x1e, 0xb4, 0xcb, 0x07, 0xed, 0x2d, 0x0a, 0x98, 0x1f, 0xc7,
    0x48,
];

/// Whether a decrypted payload is the keepalive ping.
pub fn is_ping(payload: &[u8]) -> bool {
    payload == PING
}

/// Symmetric state for one key slot: cipher and HMAC keys per direction,
/// the outbound packet-id sender, and the inbound replay window.
pub struct KeyContext {
    cipher: CipherAlg,
    auth: AuthAlg,
    enc_key: Zeroizing<Vec<u8>>,
    dec_key: Zeroizing<Vec<u8>>,
    enc_hmac: Zeroizing<Vec<u8>>,
    dec_hmac: Zeroizing<Vec<u8>>,
    sender: packet_id::Sender,
    replay: ReplayWindow,
    tx_packets: u64,
    tx_bytes: u64,
    rx_packets: u64,
}

impl KeyContext {
    /// Cut per-direction keys from an expanded key vault.
    pub fn from_vault(
        cipher: CipherAlg,
        auth: AuthAlg,
        vault: &StaticKey,
        direction: KeyDirection,
        replay_width: usize,
    ) -> Self {
        let cut = |specifier: u8, len: usize| {
            Zeroizing::new(vault.slice(specifier).truncated(len).to_vec())
        };
        // The HMAC subkey doubles as the implicit-IV source for AEAD suites.
        let hmac_len = auth.size().max(IMPLICIT_IV_LEN);
        Self {
            cipher,
            auth,
            enc_key: cut(
                direction.specifier(StaticKey::CIPHER, true),
                cipher.key_len(),
            ),
            dec_key: cut(
                direction.specifier(StaticKey::CIPHER, false),
                cipher.key_len(),
            ),
            enc_hmac: cut(direction.specifier(StaticKey::HMAC, true), hmac_len),
            dec_hmac: cut(direction.specifier(StaticKey::HMAC, false), hmac_len),
            sender: packet_id::Sender::new(),
            replay: ReplayWindow::new(replay_width),
            tx_packets: 0,
            tx_bytes: 0,
            rx_packets: 0,
        }
    }

    /// Whether the outbound id space is used up (renegotiate before sending
    /// more).
    pub fn exhausted(&self) -> bool {
        self.sender.exhausted()
    }

    /// Outbound packets and bytes since installation.
    pub fn tx_stats(&self) -> (u64, u64) {
        (self.tx_packets, self.tx_bytes)
    }

    pub fn rx_packets(&self) -> u64 {
        self.rx_packets
    }

    fn nonce(packet_id: u32, implicit: &[u8]) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..PACKET_ID_LEN].copy_from_slice(&packet_id.to_be_bytes());
        nonce[PACKET_ID_LEN..].copy_from_slice(&implicit[..IMPLICIT_IV_LEN]);
        nonce
    }

    fn aead_encrypt(&self, nonce: &[u8; NONCE_LEN], payload: Payload) -> Result<Vec<u8>, Error> {
        let result = match self.cipher {
            CipherAlg::Aes128Gcm => Aes128Gcm::new_from_slice(&self.enc_key)
                .map_err(|_| Error::EncryptFailed)?
                .encrypt(nonce.into(), payload),
            CipherAlg::Aes256Gcm => Aes256Gcm::new_from_slice(&self.enc_key)
                .map_err(|_| Error::EncryptFailed)?
                .encrypt(nonce.into(), payload),
            CipherAlg::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(&self.enc_key)
                .map_err(|_| Error::EncryptFailed)?
                .encrypt(nonce.into(), payload),
            CipherAlg::Aes256Cbc => return Err(Error::EncryptFailed),
        };
        result.map_err(|_| Error::EncryptFailed)
    }

    fn aead_decrypt(&self, nonce: &[u8; NONCE_LEN], payload: Payload) -> Result<Vec<u8>, Error> {
        let result = match self.cipher {
            CipherAlg::Aes128Gcm => Aes128Gcm::new_from_slice(&self.dec_key)
                .map_err(|_| Error::DecryptFailed)?
                .decrypt(nonce.into(), payload),
            CipherAlg::Aes256Gcm => Aes256Gcm::new_from_slice(&self.dec_key)
                .map_err(|_| Error::DecryptFailed)?
                .decrypt(nonce.into(), payload),
            CipherAlg::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(&self.dec_key)
                .map_err(|_| Error::DecryptFailed)?
                .decrypt(nonce.into(), payload),
            CipherAlg::Aes256Cbc => return Err(Error::DecryptFailed),
        };
        // An AEAD open failure is an authentication failure.
        result.map_err(|_| Error::HmacMismatch)
    }

    /// Encrypt and frame one outbound packet under this slot's key.
    pub fn encrypt<R: Rng + CryptoRng>(
        &mut self,
        key_id: u8,
        peer_id: Option<u32>,
        plaintext: &[u8],
        rng: &mut R,
    ) -> Result<DataRecord, Error> {
        let packet_id = self
            .sender
            .next()
            .map_err(|_| Error::PacketIdExhausted)?;
        let header = DataRecord {
            key_id,
            peer_id,
            body: Bytes::new(),
        }
        .header_bytes();

        let mut body = BytesMut::new();
        body.put_u32(packet_id);
        if self.cipher.is_aead() {
            let mut ad = header;
            ad.extend_from_slice(&packet_id.to_be_bytes());
            let nonce = Self::nonce(packet_id, &self.enc_hmac);
            let ciphertext = self.aead_encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: &ad,
                },
            )?;
            body.put_slice(&ciphertext);
        } else {
            let mut iv = [0u8; CBC_IV_LEN];
            rng.fill_bytes(&mut iv);
            let ciphertext = Aes256CbcEnc::new_from_slices(&self.enc_key, &iv)
                .map_err(|_| Error::EncryptFailed)?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
            let tag = crypto::hmac_tag(
                self.auth,
                &self.enc_hmac[..self.auth.size()],
                &[&header, &packet_id.to_be_bytes(), &iv, &ciphertext],
            );
            body.put_slice(&iv);
            body.put_slice(&ciphertext);
            body.put_slice(&tag);
        }

        self.tx_packets += 1;
        self.tx_bytes += body.len() as u64;
        Ok(DataRecord {
            key_id,
            peer_id,
            body: body.freeze(),
        })
    }

    /// Authenticate, replay-check, and decrypt one inbound record.
    pub fn decrypt(&mut self, record: &DataRecord) -> Result<(u32, Bytes), Error> {
        if record.body.len() < PACKET_ID_LEN {
            return Err(Error::MalformedRecord("short data body"));
        }
        let packet_id = u32::from_be_bytes(record.body[..PACKET_ID_LEN].try_into().unwrap());
        let rest = &record.body[PACKET_ID_LEN..];
        let header = record.header_bytes();

        let plaintext = if self.cipher.is_aead() {
            if rest.len() < AEAD_TAG_LEN {
                return Err(Error::MalformedRecord("short aead body"));
            }
            let mut ad = header;
            ad.extend_from_slice(&packet_id.to_be_bytes());
            let nonce = Self::nonce(packet_id, &self.dec_hmac);
            let plaintext = self.aead_decrypt(
                &nonce,
                Payload {
                    msg: rest,
                    aad: &ad,
                },
            )?;
            self.replay.accept(packet_id as u64)?;
            plaintext
        } else {
            let tag_len = self.auth.size();
            if rest.len() < CBC_IV_LEN + tag_len {
                return Err(Error::MalformedRecord("short cbc body"));
            }
            let (iv, rest) = rest.split_at(CBC_IV_LEN);
            let (ciphertext, tag) = rest.split_at(rest.len() - tag_len);
            if !crypto::hmac_verify(
                self.auth,
                &self.dec_hmac[..tag_len],
                &[&header, &packet_id.to_be_bytes(), iv, ciphertext],
                tag,
            ) {
                return Err(Error::HmacMismatch);
            }
            self.replay.accept(packet_id as u64)?;
            Aes256CbcDec::new_from_slices(&self.dec_key, iv)
                .map_err(|_| Error::DecryptFailed)?
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| Error::DecryptFailed)?
        };

        self.rx_packets += 1;
        Ok((packet_id, Bytes::from(plaintext)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn pair(cipher: CipherAlg, auth: AuthAlg) -> (KeyContext, KeyContext) {
        let mut rng = StdRng::seed_from_u64(11);
        let vault = StaticKey::random(&mut rng);
        let client = KeyContext::from_vault(cipher, auth, &vault, KeyDirection::Normal, 64);
        let server = KeyContext::from_vault(cipher, auth, &vault, KeyDirection::Inverse, 64);
        (client, server)
    }

    fn round_trip(cipher: CipherAlg, auth: AuthAlg) {
        let (mut client, mut server) = pair(cipher, auth);
        let mut rng = StdRng::seed_from_u64(12);

        let record = client
            .encrypt(1, Some(0x0102), b"ip packet bytes", &mut rng)
            .unwrap();
        assert_ne!(&record.body[..], b"ip packet bytes");

        let (packet_id, plaintext) = server.decrypt(&record).unwrap();
        assert_eq!(packet_id, 1);
        assert_eq!(plaintext, Bytes::from_static(b"ip packet bytes"));

        // Ids keep climbing on the same slot.
        let record = client.encrypt(1, Some(0x0102), b"next", &mut rng).unwrap();
        let (packet_id, _) = server.decrypt(&record).unwrap();
        assert_eq!(packet_id, 2);
    }

    #[test]
    fn test_round_trip_aes_128_gcm() {
        round_trip(CipherAlg::Aes128Gcm, AuthAlg::Sha1);
    }

    #[test]
    fn test_round_trip_aes_256_gcm() {
        round_trip(CipherAlg::Aes256Gcm, AuthAlg::Sha1);
    }

    #[test]
    fn test_round_trip_chacha20_poly1305() {
        round_trip(CipherAlg::ChaCha20Poly1305, AuthAlg::Sha1);
    }

    #[test]
    fn test_round_trip_aes_256_cbc_sha256() {
        round_trip(CipherAlg::Aes256Cbc, AuthAlg::Sha256);
    }

    #[test]
    fn test_tampered_record_fails_closed() {
        for (cipher, auth) in [
            (CipherAlg::Aes256Gcm, AuthAlg::Sha1),
            (CipherAlg::Aes256Cbc, AuthAlg::Sha1),
        ] {
            let (mut client, mut server) = pair(cipher, auth);
            let mut rng = StdRng::seed_from_u64(13);
            let record = client.encrypt(0, None, b"payload", &mut rng).unwrap();

            let mut body = record.body.to_vec();
            let last = body.len() - 1;
            body[last] ^= 1;
            let tampered = DataRecord {
                body: Bytes::from(body),
                ..record
            };
            assert!(matches!(
                server.decrypt(&tampered),
                Err(Error::HmacMismatch)
            ));
        }
    }

    #[test]
    fn test_header_is_authenticated() {
        let (mut client, mut server) = pair(CipherAlg::Aes256Gcm, AuthAlg::Sha1);
        let mut rng = StdRng::seed_from_u64(14);
        let record = client.encrypt(2, None, b"payload", &mut rng).unwrap();

        // Same body under a different key-id must not authenticate.
        let moved = DataRecord {
            key_id: 3,
            ..record
        };
        assert!(matches!(server.decrypt(&moved), Err(Error::HmacMismatch)));
    }

    #[test]
    fn test_replayed_record_rejected() {
        let (mut client, mut server) = pair(CipherAlg::ChaCha20Poly1305, AuthAlg::Sha1);
        let mut rng = StdRng::seed_from_u64(15);
        let record = client.encrypt(0, None, b"payload", &mut rng).unwrap();
        server.decrypt(&record).unwrap();
        assert!(matches!(server.decrypt(&record), Err(Error::Replay(_))));
    }

    #[test]
    fn test_exhaustion_reports_not_wraps() {
        let (mut client, _server) = pair(CipherAlg::Aes256Gcm, AuthAlg::Sha1);
        let mut rng = StdRng::seed_from_u64(16);
        client.sender.prime(u32::MAX);

        // The last id is usable...
        client.encrypt(0, None, b"last", &mut rng).unwrap();
        assert!(client.exhausted());

        // ...the next draw refuses instead of wrapping.
        assert!(matches!(
            client.encrypt(0, None, b"over", &mut rng),
            Err(Error::PacketIdExhausted)
        ));
    }

    #[test]
    fn test_tx_stats_accumulate() {
        let (mut client, _server) = pair(CipherAlg::Aes256Gcm, AuthAlg::Sha1);
        let mut rng = StdRng::seed_from_u64(17);
        client.encrypt(0, None, b"one", &mut rng).unwrap();
        client.encrypt(0, None, b"two", &mut rng).unwrap();
        let (packets, bytes) = client.tx_stats();
        assert_eq!(packets, 2);
        assert!(bytes > 0);
    }

    #[test]
    fn test_ping_magic() {
        assert!(is_ping(&PING));
        assert!(!is_ping(b"not a ping"));
        assert_eq!(PING.len(), 16);
    }
}
