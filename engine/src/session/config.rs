//! Immutable session configuration, validated before the session starts.

use crate::{
    crypto::{AuthAlg, CipherAlg, KeyDirection},
    error::Error,
    packet_id,
    static_key::StaticKey,
    wrap::{TlsAuth, TlsCrypt, Wrapper},
};
use std::time::Duration;

/// Transport protocol hint for the host's socket layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Proto {
    Udp,
    Tcp,
}

/// One remote endpoint candidate.
#[derive(Clone, Debug)]
pub struct Remote {
    pub host: String,
    pub port: u16,
    pub proto: Proto,
}

/// Credentials provided before start.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Static/dynamic challenge response, if the server demanded one.
    pub response: Option<String>,
}

/// Session configuration.
///
/// # Warning
///
/// The cipher, auth, and control-channel settings must match the server;
/// mismatches surface as handshake or decrypt failures, not as negotiation.
#[derive(Clone)]
pub struct Config {
    /// Remote candidates, tried in order by the host transport.
    pub remotes: Vec<Remote>,

    /// Data-channel cipher.
    pub cipher: CipherAlg,

    /// Data-channel HMAC digest (CBC suites) and tls-auth digest.
    pub auth: AuthAlg,

    /// Renegotiate the data-channel key after this long.
    pub reneg_interval: Duration,

    /// Renegotiate after this many encrypted bytes, if set.
    pub reneg_bytes: Option<u64>,

    /// Renegotiate after this many outbound packets; a per-suite default
    /// applies when unset.
    pub reneg_packets: Option<u64>,

    /// Send a keepalive ping when no data has been sent for this long.
    pub keepalive_ping: Duration,

    /// Fail the session when nothing has been received for this long
    /// (typically twice the ping interval).
    pub keepalive_timeout: Duration,

    /// Tear down after this long without user-plane traffic, if set.
    pub inactive: Option<Duration>,

    /// Deadline for reaching the steady state from session start.
    pub handshake_timeout: Duration,

    /// Grace during which a displaced primary key still decrypts.
    pub expiring_grace: Duration,

    /// tls-auth static key (PEM text) and its direction.
    pub tls_auth: Option<(String, KeyDirection)>,

    /// tls-crypt static key (PEM text).
    pub tls_crypt: Option<String>,

    /// tls-crypt-v2 client key bundle (PEM text).
    pub tls_crypt_v2: Option<String>,

    /// Derive data keys from the TLS exporter instead of the key-method-2
    /// PRF.
    pub tls_ekm: bool,

    /// Minimum accepted TLS version, forwarded to the TLS engine.
    pub tls_version_min: Option<String>,

    /// TLS certificate profile, forwarded to the TLS engine.
    pub tls_cert_profile: Option<String>,

    /// Expected peer certificate x509 name, forwarded to the TLS engine.
    pub verify_x509_name: Option<String>,

    /// Require server certificate key usage (`remote-cert-tls server`).
    pub remote_cert_tls: Option<String>,

    /// Legacy netscape certificate type check.
    pub ns_cert_type: Option<String>,

    /// Data-channel replay window width (in packets).
    pub replay_window: usize,

    /// Control-channel replay time slack (seconds).
    pub replay_window_time: u32,

    /// 24-bit peer-id for DATA_V2 framing, when the server assigned one.
    pub peer_id: Option<u32>,

    /// Options string advertised in the key-method-2 exchange.
    pub options: String,

    /// Peer-info advertised in the key-method-2 exchange.
    pub peer_info: Vec<(String, String)>,

    /// Credentials, when the profile requires them.
    pub credentials: Option<Credentials>,

    /// Largest accepted wire record.
    pub max_record: usize,

    /// Control mailbox backlog.
    pub mailbox_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remotes: Vec::new(),
            cipher: CipherAlg::Aes256Gcm,
            auth: AuthAlg::Sha1,
            reneg_interval: Duration::from_secs(3600),
            reneg_bytes: None,
            reneg_packets: None,
            keepalive_ping: Duration::from_secs(10),
            keepalive_timeout: Duration::from_secs(60),
            inactive: None,
            handshake_timeout: Duration::from_secs(60),
            expiring_grace: Duration::from_secs(5),
            tls_auth: None,
            tls_crypt: None,
            tls_crypt_v2: None,
            tls_ekm: false,
            tls_version_min: None,
            tls_cert_profile: None,
            verify_x509_name: None,
            remote_cert_tls: None,
            ns_cert_type: None,
            replay_window: packet_id::DEFAULT_WINDOW,
            replay_window_time: 15,
            peer_id: None,
            options: "V4,dev-type tun".into(),
            peer_info: vec![("IV_VER".into(), "3.10".into()), ("IV_PROTO".into(), "2".into())],
            credentials: None,
            max_record: 1 << 16,
            mailbox_size: 64,
        }
    }
}

impl Config {
    /// Validate the configuration and build the control-channel wrapper.
    ///
    /// All configuration errors surface here, before the session starts.
    pub fn build_wrapper(&self) -> Result<Wrapper, Error> {
        let wrappers_configured = [
            self.tls_auth.is_some(),
            self.tls_crypt.is_some(),
            self.tls_crypt_v2.is_some(),
        ]
        .iter()
        .filter(|&&set| set)
        .count();
        if wrappers_configured > 1 {
            return Err(Error::Config(
                "tls-auth, tls-crypt, and tls-crypt-v2 are mutually exclusive",
            ));
        }

        if let Some((text, direction)) = &self.tls_auth {
            let key = StaticKey::parse(text)?;
            return Ok(Wrapper::TlsAuth(TlsAuth::new(
                &key,
                self.auth,
                *direction,
                self.replay_window,
                self.replay_window_time,
            )));
        }
        if let Some(text) = &self.tls_crypt {
            let key = StaticKey::parse(text)?;
            return Ok(Wrapper::TlsCrypt(Box::new(TlsCrypt::new(
                &key,
                KeyDirection::Inverse,
                self.replay_window,
                self.replay_window_time,
            ))));
        }
        if let Some(text) = &self.tls_crypt_v2 {
            return Ok(Wrapper::TlsCrypt(Box::new(TlsCrypt::from_v2_client_key(
                text,
                KeyDirection::Inverse,
                self.replay_window,
                self.replay_window_time,
            )?)));
        }
        Ok(Wrapper::None)
    }

    /// Validate timer and window settings.
    pub fn validate(&self) -> Result<(), Error> {
        if self.keepalive_timeout <= self.keepalive_ping {
            return Err(Error::Config("keepalive timeout must exceed ping interval"));
        }
        if self.replay_window == 0 {
            return Err(Error::Config("replay window must be non-zero"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(Error::Config("handshake timeout must be non-zero"));
        }
        if self.peer_id.is_some_and(|id| id > 0x00FF_FFFF) {
            return Err(Error::Config("peer-id exceeds 24 bits"));
        }
        self.build_wrapper().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn static_key_text() -> String {
        let mut rng = StdRng::seed_from_u64(1);
        StaticKey::random(&mut rng).render()
    }

    #[test]
    fn test_default_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_mutually_exclusive_wrappers() {
        let config = Config {
            tls_auth: Some((static_key_text(), KeyDirection::Inverse)),
            tls_crypt: Some(static_key_text()),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_tls_auth_wrapper_built() {
        let config = Config {
            tls_auth: Some((static_key_text(), KeyDirection::Inverse)),
            ..Config::default()
        };
        assert!(!config.build_wrapper().unwrap().is_none());
    }

    #[test]
    fn test_bad_static_key_surfaces_before_start() {
        let config = Config {
            tls_crypt: Some("not a key".into()),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::StaticKeyParse)));
    }

    #[test]
    fn test_keepalive_sanity() {
        let config = Config {
            keepalive_ping: Duration::from_secs(60),
            keepalive_timeout: Duration::from_secs(30),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_peer_id_range() {
        let config = Config {
            peer_id: Some(1 << 24),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
