//! The key-method-2 exchange: random contributions, option string, optional
//! credentials, and peer-info, exchanged over the control channel after the
//! TLS handshake completes.

use bytes::{Buf, BufMut};
use commonware_codec::{EncodeSize, Error as CodecError, Read, ReadExt, Write};
use rand::{CryptoRng, Rng};
use zeroize::Zeroizing;

/// Client-only pre-master secret length.
pub const PRE_MASTER_LEN: usize = 48;

/// Per-stage random contribution length.
pub const RANDOM_LEN: usize = 32;

/// Key method discriminator on the wire.
const KEY_METHOD: u8 = 2;

/// Longest accepted embedded string (options, credentials, peer-info).
const MAX_STRING: usize = 1 << 16;

/// Which side of the exchange a message belongs to. The client contributes
/// the pre-master secret; the server does not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Random key material contributed by one side.
pub struct Randoms {
    /// Present on the client side only.
    pub pre_master: Option<Zeroizing<[u8; PRE_MASTER_LEN]>>,
    /// Mixed into the master secret.
    pub random1: [u8; RANDOM_LEN],
    /// Mixed into the key expansion.
    pub random2: [u8; RANDOM_LEN],
}

impl Randoms {
    pub fn generate<R: Rng + CryptoRng>(role: Role, rng: &mut R) -> Self {
        let pre_master = match role {
            Role::Client => {
                let mut bytes = Zeroizing::new([0u8; PRE_MASTER_LEN]);
                rng.fill_bytes(bytes.as_mut());
                Some(bytes)
            }
            Role::Server => None,
        };
        let mut random1 = [0u8; RANDOM_LEN];
        let mut random2 = [0u8; RANDOM_LEN];
        rng.fill_bytes(&mut random1);
        rng.fill_bytes(&mut random2);
        Self {
            pre_master,
            random1,
            random2,
        }
    }
}

/// One key-method-2 message.
///
/// Wire layout: a four-byte zero literal, the key-method byte, the random
/// contributions (pre-master on the client side), then the NUL-terminated
/// length-prefixed strings: options, username, password, peer-info.
pub struct KeyMethod2 {
    pub randoms: Randoms,
    pub options: String,
    pub username: String,
    pub password: Zeroizing<String>,
    /// `key=value` lines, newline separated on the wire.
    pub peer_info: Vec<(String, String)>,
}

impl KeyMethod2 {
    pub fn new(randoms: Randoms, options: impl Into<String>) -> Self {
        Self {
            randoms,
            options: options.into(),
            username: String::new(),
            password: Zeroizing::new(String::new()),
            peer_info: Vec::new(),
        }
    }

    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.username = username;
        self.password = Zeroizing::new(password);
        self
    }

    pub fn with_peer_info(mut self, peer_info: Vec<(String, String)>) -> Self {
        self.peer_info = peer_info;
        self
    }

    fn peer_info_string(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.peer_info {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }

    fn parse_peer_info(text: &str) -> Vec<(String, String)> {
        text.lines()
            .filter_map(|line| {
                line.split_once('=')
                    .map(|(key, value)| (key.to_string(), value.to_string()))
            })
            .collect()
    }
}

fn write_string(value: &str, buf: &mut impl BufMut) {
    if value.is_empty() {
        0u16.write(buf);
        return;
    }
    ((value.len() + 1) as u16).write(buf);
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

fn string_size(value: &str) -> usize {
    if value.is_empty() {
        2
    } else {
        2 + value.len() + 1
    }
}

fn read_string(buf: &mut impl Buf) -> Result<String, CodecError> {
    let len = u16::read(buf)? as usize;
    if len == 0 {
        return Ok(String::new());
    }
    if len > MAX_STRING {
        return Err(CodecError::InvalidLength(len));
    }
    if buf.remaining() < len {
        return Err(CodecError::EndOfBuffer);
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    if bytes.pop() != Some(0) {
        return Err(CodecError::Invalid("KeyMethod2", "missing terminator"));
    }
    String::from_utf8(bytes).map_err(|_| CodecError::Invalid("KeyMethod2", "non-utf8 string"))
}

impl Write for KeyMethod2 {
    fn write(&self, buf: &mut impl BufMut) {
        0u32.write(buf);
        KEY_METHOD.write(buf);
        if let Some(pre_master) = &self.randoms.pre_master {
            buf.put_slice(pre_master.as_ref());
        }
        buf.put_slice(&self.randoms.random1);
        buf.put_slice(&self.randoms.random2);
        write_string(&self.options, buf);
        write_string(&self.username, buf);
        write_string(&self.password, buf);
        write_string(&self.peer_info_string(), buf);
    }
}

impl EncodeSize for KeyMethod2 {
    fn encode_size(&self) -> usize {
        4 + 1
            + self
                .randoms
                .pre_master
                .as_ref()
                .map_or(0, |_| PRE_MASTER_LEN)
            + 2 * RANDOM_LEN
            + string_size(&self.options)
            + string_size(&self.username)
            + string_size(&self.password)
            + string_size(&self.peer_info_string())
    }
}

impl Read for KeyMethod2 {
    /// The role of the *sender* of the message being read.
    type Cfg = Role;

    fn read_cfg(buf: &mut impl Buf, sender: &Role) -> Result<Self, CodecError> {
        let literal = u32::read(buf)?;
        if literal != 0 {
            return Err(CodecError::Invalid("KeyMethod2", "bad leading literal"));
        }
        let method = u8::read(buf)?;
        if method != KEY_METHOD {
            return Err(CodecError::Invalid("KeyMethod2", "unsupported key method"));
        }
        let pre_master = match sender {
            Role::Client => {
                let bytes = <[u8; PRE_MASTER_LEN]>::read(buf)?;
                Some(Zeroizing::new(bytes))
            }
            Role::Server => None,
        };
        let random1 = <[u8; RANDOM_LEN]>::read(buf)?;
        let random2 = <[u8; RANDOM_LEN]>::read(buf)?;
        let options = read_string(buf)?;
        let username = read_string(buf)?;
        let password = Zeroizing::new(read_string(buf)?);
        let peer_info = Self::parse_peer_info(&read_string(buf)?);
        Ok(Self {
            randoms: Randoms {
                pre_master,
                random1,
                random2,
            },
            options,
            username,
            password,
            peer_info,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_codec::Encode;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_client_round_trip() {
        let mut rng = StdRng::seed_from_u64(1);
        let message = KeyMethod2::new(
            Randoms::generate(Role::Client, &mut rng),
            "V4,dev-type tun,cipher AES-256-GCM",
        )
        .with_credentials("user".into(), "secret".into())
        .with_peer_info(vec![
            ("IV_VER".into(), "2.7".into()),
            ("IV_PROTO".into(), "990".into()),
        ]);

        let encoded = message.encode();
        assert_eq!(encoded.len(), message.encode_size());

        let decoded = KeyMethod2::read_cfg(&mut encoded.as_ref(), &Role::Client).unwrap();
        assert!(decoded.randoms.pre_master.is_some());
        assert_eq!(
            decoded.randoms.pre_master.as_ref().unwrap().as_ref(),
            message.randoms.pre_master.as_ref().unwrap().as_ref()
        );
        assert_eq!(decoded.randoms.random1, message.randoms.random1);
        assert_eq!(decoded.randoms.random2, message.randoms.random2);
        assert_eq!(decoded.options, message.options);
        assert_eq!(decoded.username, "user");
        assert_eq!(decoded.password.as_str(), "secret");
        assert_eq!(decoded.peer_info.len(), 2);
        assert_eq!(decoded.peer_info[0].0, "IV_VER");
    }

    #[test]
    fn test_server_has_no_pre_master() {
        let mut rng = StdRng::seed_from_u64(2);
        let message = KeyMethod2::new(Randoms::generate(Role::Server, &mut rng), "V4");
        let encoded = message.encode();
        let decoded = KeyMethod2::read_cfg(&mut encoded.as_ref(), &Role::Server).unwrap();
        assert!(decoded.randoms.pre_master.is_none());
        assert_eq!(decoded.username, "");
        assert!(decoded.peer_info.is_empty());
    }

    #[test]
    fn test_bad_leading_literal() {
        let mut rng = StdRng::seed_from_u64(3);
        let message = KeyMethod2::new(Randoms::generate(Role::Server, &mut rng), "V4");
        let mut encoded = message.encode().to_vec();
        encoded[0] = 1;
        assert!(KeyMethod2::read_cfg(&mut encoded.as_slice(), &Role::Server).is_err());
    }

    #[test]
    fn test_unknown_key_method() {
        let mut rng = StdRng::seed_from_u64(4);
        let message = KeyMethod2::new(Randoms::generate(Role::Server, &mut rng), "V4");
        let mut encoded = message.encode().to_vec();
        encoded[4] = 1;
        assert!(KeyMethod2::read_cfg(&mut encoded.as_slice(), &Role::Server).is_err());
    }

    #[test]
    fn test_truncated_message() {
        let mut rng = StdRng::seed_from_u64(5);
        let message = KeyMethod2::new(Randoms::generate(Role::Client, &mut rng), "V4");
        let encoded = message.encode();
        let truncated = &encoded[..encoded.len() - 3];
        assert!(KeyMethod2::read_cfg(&mut &truncated[..], &Role::Client).is_err());
    }

    #[test]
    fn test_missing_terminator_rejected() {
        let mut rng = StdRng::seed_from_u64(6);
        let message = KeyMethod2::new(Randoms::generate(Role::Server, &mut rng), "V4");
        let mut encoded = message.encode().to_vec();
        // Corrupt the options string terminator.
        let options_end = 4 + 1 + 2 * RANDOM_LEN + 2 + 2;
        encoded[options_end] = b'x';
        assert!(KeyMethod2::read_cfg(&mut encoded.as_slice(), &Role::Server).is_err());
    }
}
