//! Control-channel wrapping: tls-auth (authenticate), tls-crypt
//! (authenticate + encrypt), and tls-crypt-v2 (tls-crypt under a per-client
//! key delivered to the server in a wrapped bundle).
//!
//! Every reliable-layer record passes through exactly one wrap on egress and
//! one unwrap on ingress. The wrapped wire layout keeps the first byte and
//! sender session id in the clear, then inserts a packet-id, a timestamp,
//! and the authentication tag ahead of the (possibly encrypted) remainder:
//!
//! `[op|key-id, SID, packet-id, time, tag, remainder]`

use crate::{
    crypto::{self, AuthAlg, KeyDirection},
    error::Error,
    packet_id::{ReplayWindow, TimeSender},
    static_key::StaticKey,
    types::{split_first_byte, Opcode},
};
use aes::Aes256;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};
use ctr::{
    cipher::{KeyIvInit, StreamCipher},
    Ctr128BE,
};
use zeroize::Zeroizing;

type Aes256Ctr = Ctr128BE<Aes256>;

/// Cleartext prefix length: first byte plus sender session id.
const PREFIX_LEN: usize = 9;

/// Packet-id plus timestamp.
const ID_TIME_LEN: usize = 8;

/// tls-crypt always authenticates with HMAC-SHA256.
const TLS_CRYPT_TAG_LEN: usize = 32;

/// tls-crypt cipher and HMAC key length (AES-256-CTR, HMAC-SHA256).
const TLS_CRYPT_KEY_LEN: usize = 32;

const V2_CLIENT_KEY_HEAD: &str = "-----BEGIN OpenVPN tls-crypt-v2 client key-----";
const V2_CLIENT_KEY_FOOT: &str = "-----END OpenVPN tls-crypt-v2 client key-----";

/// tls-auth: prepend an HMAC plus anti-replay packet-id to every control
/// record.
pub struct TlsAuth {
    alg: AuthAlg,
    send_key: Zeroizing<Vec<u8>>,
    recv_key: Zeroizing<Vec<u8>>,
    ids: TimeSender,
    replay: ReplayWindow,
}

impl TlsAuth {
    pub fn new(
        key: &StaticKey,
        alg: AuthAlg,
        direction: KeyDirection,
        replay_width: usize,
        time_slack: u32,
    ) -> Self {
        let send = key.slice(direction.specifier(StaticKey::HMAC, true));
        let recv = key.slice(direction.specifier(StaticKey::HMAC, false));
        Self {
            alg,
            send_key: Zeroizing::new(send.truncated(alg.size()).to_vec()),
            recv_key: Zeroizing::new(recv.truncated(alg.size()).to_vec()),
            ids: TimeSender::new(),
            replay: ReplayWindow::with_time(replay_width, time_slack),
        }
    }

    fn wrap(&mut self, record: &[u8], now: u32) -> Result<Bytes, Error> {
        if record.len() < PREFIX_LEN {
            return Err(Error::MalformedRecord("short record"));
        }
        let (prefix, rest) = record.split_at(PREFIX_LEN);
        let (time, id) = self.ids.next(now).map_err(|_| Error::PacketIdExhausted)?;
        let id_time = [id.to_be_bytes(), time.to_be_bytes()].concat();
        let tag = crypto::hmac_tag(self.alg, &self.send_key, &[prefix, &id_time, rest]);

        let mut out = BytesMut::with_capacity(record.len() + ID_TIME_LEN + tag.len());
        out.put_slice(prefix);
        out.put_slice(&id_time);
        out.put_slice(&tag);
        out.put_slice(rest);
        Ok(out.freeze())
    }

    fn unwrap(&mut self, wire: &[u8]) -> Result<Bytes, Error> {
        let tag_len = self.alg.size();
        if wire.len() < PREFIX_LEN + ID_TIME_LEN + tag_len {
            return Err(Error::MalformedRecord("short tls-auth record"));
        }
        let (prefix, after) = wire.split_at(PREFIX_LEN);
        let (id_time, after) = after.split_at(ID_TIME_LEN);
        let (tag, rest) = after.split_at(tag_len);
        if !crypto::hmac_verify(self.alg, &self.recv_key, &[prefix, id_time, rest], tag) {
            return Err(Error::HmacMismatch);
        }

        let id = u32::from_be_bytes(id_time[0..4].try_into().unwrap());
        let time = u32::from_be_bytes(id_time[4..8].try_into().unwrap());
        self.replay.accept_with_time(time, id)?;

        let mut out = BytesMut::with_capacity(PREFIX_LEN + rest.len());
        out.put_slice(prefix);
        out.put_slice(rest);
        Ok(out.freeze())
    }
}

/// tls-crypt: authenticate and encrypt every control record under static
/// AES-256-CTR + HMAC-SHA256 keys. The IV is taken from the tag, so the
/// construction is deterministic and self-contained per packet.
pub struct TlsCrypt {
    send_cipher: Zeroizing<Vec<u8>>,
    recv_cipher: Zeroizing<Vec<u8>>,
    send_hmac: Zeroizing<Vec<u8>>,
    recv_hmac: Zeroizing<Vec<u8>>,
    ids: TimeSender,
    replay: ReplayWindow,
    /// tls-crypt-v2 wrapped client key, appended to the first client packet.
    client_key_tail: Option<Bytes>,
}

impl TlsCrypt {
    pub fn new(
        key: &StaticKey,
        direction: KeyDirection,
        replay_width: usize,
        time_slack: u32,
    ) -> Self {
        let take = |specifier: u8| {
            Zeroizing::new(key.slice(specifier).truncated(TLS_CRYPT_KEY_LEN).to_vec())
        };
        Self {
            send_cipher: take(direction.specifier(StaticKey::CIPHER, true)),
            recv_cipher: take(direction.specifier(StaticKey::CIPHER, false)),
            send_hmac: take(direction.specifier(StaticKey::HMAC, true)),
            recv_hmac: take(direction.specifier(StaticKey::HMAC, false)),
            ids: TimeSender::new(),
            replay: ReplayWindow::with_time(replay_width, time_slack),
            client_key_tail: None,
        }
    }

    /// Build from a tls-crypt-v2 client key bundle: the 256-byte client key
    /// plus the server-wrapped copy (WKc) that rides on the first packet.
    pub fn from_v2_client_key(
        text: &str,
        direction: KeyDirection,
        replay_width: usize,
        time_slack: u32,
    ) -> Result<Self, Error> {
        let (key, tail) = parse_v2_client_key(text)?;
        let mut wrapper = Self::new(&key, direction, replay_width, time_slack);
        wrapper.client_key_tail = Some(tail);
        Ok(wrapper)
    }

    pub fn client_key_tail(&self) -> Option<Bytes> {
        self.client_key_tail.clone()
    }

    fn wrap(&mut self, record: &[u8], now: u32) -> Result<Bytes, Error> {
        if record.len() < PREFIX_LEN {
            return Err(Error::MalformedRecord("short record"));
        }
        let (prefix, rest) = record.split_at(PREFIX_LEN);
        let (time, id) = self.ids.next(now).map_err(|_| Error::PacketIdExhausted)?;
        let id_time = [id.to_be_bytes(), time.to_be_bytes()].concat();

        // Tag over the cleartext; the tag then seeds the cipher IV.
        let tag =
            crypto::hmac_tag(AuthAlg::Sha256, &self.send_hmac, &[prefix, &id_time, rest]);
        let mut body = rest.to_vec();
        let mut cipher = Aes256Ctr::new_from_slices(&self.send_cipher, &tag[..16])
            .map_err(|_| Error::EncryptFailed)?;
        cipher.apply_keystream(&mut body);

        let mut out =
            BytesMut::with_capacity(record.len() + ID_TIME_LEN + TLS_CRYPT_TAG_LEN);
        out.put_slice(prefix);
        out.put_slice(&id_time);
        out.put_slice(&tag);
        out.put_slice(&body);
        Ok(out.freeze())
    }

    fn unwrap(&mut self, wire: &[u8]) -> Result<Bytes, Error> {
        if wire.len() < PREFIX_LEN + ID_TIME_LEN + TLS_CRYPT_TAG_LEN {
            return Err(Error::MalformedRecord("short tls-crypt record"));
        }
        let (prefix, after) = wire.split_at(PREFIX_LEN);
        let (id_time, after) = after.split_at(ID_TIME_LEN);
        let (tag, body) = after.split_at(TLS_CRYPT_TAG_LEN);

        // Decrypt first; the tag authenticates the plaintext.
        let mut rest = body.to_vec();
        let mut cipher = Aes256Ctr::new_from_slices(&self.recv_cipher, &tag[..16])
            .map_err(|_| Error::DecryptFailed)?;
        cipher.apply_keystream(&mut rest);

        if !crypto::hmac_verify(
            AuthAlg::Sha256,
            &self.recv_hmac,
            &[prefix, id_time, &rest],
            tag,
        ) {
            return Err(Error::HmacMismatch);
        }

        let id = u32::from_be_bytes(id_time[0..4].try_into().unwrap());
        let time = u32::from_be_bytes(id_time[4..8].try_into().unwrap());
        self.replay.accept_with_time(time, id)?;

        let mut out = BytesMut::with_capacity(PREFIX_LEN + rest.len());
        out.put_slice(prefix);
        out.put_slice(&rest);
        Ok(out.freeze())
    }
}

/// The configured control-channel envelope.
pub enum Wrapper {
    None,
    TlsAuth(TlsAuth),
    TlsCrypt(Box<TlsCrypt>),
}

impl Wrapper {
    /// Apply the envelope to an encoded control record.
    pub fn wrap(&mut self, record: Bytes, now: u32) -> Result<Bytes, Error> {
        match self {
            Self::None => Ok(record),
            Self::TlsAuth(inner) => inner.wrap(&record, now),
            Self::TlsCrypt(inner) => inner.wrap(&record, now),
        }
    }

    /// Strip and verify the envelope, returning the plain control record.
    pub fn unwrap(&mut self, wire: Bytes) -> Result<Bytes, Error> {
        match self {
            Self::None => Ok(wire),
            Self::TlsAuth(inner) => inner.unwrap(&wire),
            Self::TlsCrypt(inner) => inner.unwrap(&wire),
        }
    }

    /// The tls-crypt-v2 bundle to append to the first client packet, if any.
    pub fn client_key_tail(&self) -> Option<Bytes> {
        match self {
            Self::TlsCrypt(inner) => inner.client_key_tail(),
            _ => None,
        }
    }

    /// Opcode opening the session under this envelope.
    pub fn hard_reset_opcode(&self) -> Opcode {
        if self.client_key_tail().is_some() {
            Opcode::HardResetClientV3
        } else {
            Opcode::HardResetClient
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Parse a tls-crypt-v2 client key bundle: PEM brackets around base64 of
/// the 256-byte client key followed by WKc, whose trailing two bytes give
/// the WKc length.
pub fn parse_v2_client_key(text: &str) -> Result<(StaticKey, Bytes), Error> {
    let mut body = String::new();
    let mut in_body = false;
    let mut seen = false;
    for line in text.lines() {
        let line = line.trim();
        if line == V2_CLIENT_KEY_HEAD {
            in_body = true;
            seen = true;
        } else if line == V2_CLIENT_KEY_FOOT {
            in_body = false;
        } else if in_body {
            body.push_str(line);
        }
    }
    if in_body || !seen {
        return Err(Error::TlsCryptV2ClientKey);
    }
    let bytes = BASE64
        .decode(body.as_bytes())
        .map_err(|_| Error::TlsCryptV2ClientKey)?;
    if bytes.len() < crate::static_key::KEY_SIZE + 2 {
        return Err(Error::TlsCryptV2ClientKey);
    }
    let (key_bytes, tail) = bytes.split_at(crate::static_key::KEY_SIZE);
    let declared =
        u16::from_be_bytes(bytes[bytes.len() - 2..].try_into().unwrap()) as usize;
    if declared != tail.len() {
        return Err(Error::TlsCryptV2ClientKey);
    }
    let key = StaticKey::try_from_slice(key_bytes).map_err(|_| Error::TlsCryptV2ClientKey)?;
    Ok((key, Bytes::copy_from_slice(tail)))
}

/// Split the wrapped client key bundle off a HARD_RESET_CLIENT_V3 packet.
///
/// The bundle length rides in its own last two bytes, so the receiver can
/// separate it before unwrapping the record proper.
pub fn split_client_key(wire: &[u8]) -> Result<(&[u8], &[u8]), Error> {
    let (opcode, _) = split_first_byte(*wire.first().ok_or(Error::MalformedRecord("empty"))?)?;
    if opcode != Opcode::HardResetClientV3 {
        return Err(Error::MalformedRecord("not a v3 hard reset"));
    }
    if wire.len() < 2 {
        return Err(Error::TlsCryptMetadata);
    }
    let tail_len = u16::from_be_bytes(wire[wire.len() - 2..].try_into().unwrap()) as usize;
    if tail_len < 2 || tail_len > wire.len() - 1 {
        return Err(Error::TlsCryptMetadata);
    }
    Ok(wire.split_at(wire.len() - tail_len))
}
