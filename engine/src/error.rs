//! Error taxonomy, structured events, and the session error bus.

use commonware_codec::Error as CodecError;
use futures::channel::mpsc;
use std::collections::BTreeMap;
use thiserror::Error;

/// Stable error codes surfaced to the host.
///
/// Codes are grouped by origin (network, crypto, TLS, session lifecycle,
/// auth, protocol). The numeric discriminants are not part of the API;
/// hosts should match on the variant or its [`ErrorCode::name`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    // Transport / network
    Resolve,
    Transport,
    TcpOverflow,
    NetworkRecv,
    NetworkSend,
    NetworkEof,
    NetworkUnavailable,

    // Crypto
    DecryptError,
    HmacError,
    PktidInvalid,
    PktidBacktrack,
    PktidExpire,
    PktidReplay,
    PktidTimeBacktrack,

    // TLS
    SslError,
    CertVerifyFail,
    TlsVersionMin,
    TlsAlertProtocolVersion,
    TlsAlertUnknownCa,
    TlsAlertHandshakeFailure,
    TlsAlertBadCertificate,
    TlsAlertCertificateExpired,
    TlsAlertCertificateRevoked,
    TlsAlertMisc,
    TlsAuthFail,
    TlsCryptMetaFail,

    // Session lifecycle
    HandshakeTimeout,
    KeepaliveTimeout,
    InactiveTimeout,
    ConnectionTimeout,
    PrimaryExpire,

    // Auth / identity
    AuthFailed,
    PemPasswordFail,
    EpkiSignError,
    EpkiCertError,
    NeedCreds,
    SessionExpired,

    // Protocol / control
    CcError,
    KeyStateError,
    KevNegotiateError,
    KevPendingError,
    KeyExpansionError,
    BadSrcAddr,
    ClientHalt,
    ClientRestart,
}

impl ErrorCode {
    /// Stable wire-independent name, matching the reference implementation's
    /// error table.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Resolve => "RESOLVE_ERROR",
            Self::Transport => "TRANSPORT_ERROR",
            Self::TcpOverflow => "TCP_OVERFLOW",
            Self::NetworkRecv => "NETWORK_RECV_ERROR",
            Self::NetworkSend => "NETWORK_SEND_ERROR",
            Self::NetworkEof => "NETWORK_EOF_ERROR",
            Self::NetworkUnavailable => "NETWORK_UNAVAILABLE",
            Self::DecryptError => "DECRYPT_ERROR",
            Self::HmacError => "HMAC_ERROR",
            Self::PktidInvalid => "PKTID_INVALID",
            Self::PktidBacktrack => "PKTID_BACKTRACK",
            Self::PktidExpire => "PKTID_EXPIRE",
            Self::PktidReplay => "PKTID_REPLAY",
            Self::PktidTimeBacktrack => "PKTID_TIME_BACKTRACK",
            Self::SslError => "SSL_ERROR",
            Self::CertVerifyFail => "CERT_VERIFY_FAIL",
            Self::TlsVersionMin => "TLS_VERSION_MIN",
            Self::TlsAlertProtocolVersion => "TLS_ALERT_PROTOCOL_VERSION",
            Self::TlsAlertUnknownCa => "TLS_ALERT_UNKNOWN_CA",
            Self::TlsAlertHandshakeFailure => "TLS_ALERT_HANDSHAKE_FAILURE",
            Self::TlsAlertBadCertificate => "TLS_ALERT_BAD_CERTIFICATE",
            Self::TlsAlertCertificateExpired => "TLS_ALERT_CERTIFICATE_EXPIRED",
            Self::TlsAlertCertificateRevoked => "TLS_ALERT_CERTIFICATE_REVOKED",
            Self::TlsAlertMisc => "TLS_ALERT_MISC",
            Self::TlsAuthFail => "TLS_AUTH_FAIL",
            Self::TlsCryptMetaFail => "TLS_CRYPT_META_FAIL",
            Self::HandshakeTimeout => "HANDSHAKE_TIMEOUT",
            Self::KeepaliveTimeout => "KEEPALIVE_TIMEOUT",
            Self::InactiveTimeout => "INACTIVE_TIMEOUT",
            Self::ConnectionTimeout => "CONNECTION_TIMEOUT",
            Self::PrimaryExpire => "PRIMARY_EXPIRE",
            Self::AuthFailed => "AUTH_FAILED",
            Self::PemPasswordFail => "PEM_PASSWORD_FAIL",
            Self::EpkiSignError => "EPKI_SIGN_ERROR",
            Self::EpkiCertError => "EPKI_CERT_ERROR",
            Self::NeedCreds => "NEED_CREDS",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::CcError => "CC_ERROR",
            Self::KeyStateError => "KEY_STATE_ERROR",
            Self::KevNegotiateError => "KEV_NEGOTIATE_ERROR",
            Self::KevPendingError => "KEV_PENDING_ERROR",
            Self::KeyExpansionError => "KEY_EXPANSION_ERROR",
            Self::BadSrcAddr => "BAD_SRC_ADDR",
            Self::ClientHalt => "CLIENT_HALT",
            Self::ClientRestart => "CLIENT_RESTART",
        }
    }

    /// Whether an occurrence of this code is fatal to the session by default.
    ///
    /// Per-packet crypto failures are counted and suppressed; they only become
    /// fatal when a drop threshold is breached (the session raises them with
    /// an explicit fatal flag in that case).
    pub fn default_fatal(&self) -> bool {
        !matches!(
            self,
            Self::DecryptError
                | Self::HmacError
                | Self::PktidInvalid
                | Self::PktidBacktrack
                | Self::PktidExpire
                | Self::PktidReplay
                | Self::PktidTimeBacktrack
                | Self::KeyStateError
                | Self::NetworkUnavailable
                | Self::BadSrcAddr
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A structured event surfaced to the host on every transition out of the
/// steady state (and on counted drops when they breach a threshold).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub code: ErrorCode,
    pub info: String,
    pub fatal: bool,
}

impl Event {
    pub fn new(code: ErrorCode, info: impl Into<String>) -> Self {
        Self {
            fatal: code.default_fatal(),
            code,
            info: info.into(),
        }
    }

    pub fn fatal(code: ErrorCode, info: impl Into<String>) -> Self {
        Self {
            code,
            info: info.into(),
            fatal: true,
        }
    }

    pub fn non_fatal(code: ErrorCode, info: impl Into<String>) -> Self {
        Self {
            code,
            info: info.into(),
            fatal: false,
        }
    }
}

/// Ordered queue of typed error events.
///
/// The first fatal event seals the bus: later events are counted but no
/// longer delivered, so the host observes exactly one terminal event.
pub struct Bus {
    sender: mpsc::UnboundedSender<Event>,
    counts: BTreeMap<ErrorCode, u64>,
    sealed: bool,
}

impl Bus {
    /// Create a bus and the receiving half handed to the host.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded();
        (
            Self {
                sender,
                counts: BTreeMap::new(),
                sealed: false,
            },
            receiver,
        )
    }

    /// Count an occurrence without emitting an event.
    pub fn count(&mut self, code: ErrorCode) -> u64 {
        let entry = self.counts.entry(code).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Push an event. Returns true if the event sealed the bus.
    pub fn push(&mut self, event: Event) -> bool {
        self.count(event.code);
        if self.sealed {
            return false;
        }
        let fatal = event.fatal;
        // The host may have dropped its receiver; counting still works.
        let _ = self.sender.unbounded_send(event);
        if fatal {
            self.sealed = true;
        }
        fatal
    }

    pub fn sealed(&self) -> bool {
        self.sealed
    }

    /// Occurrences of a code since session start.
    pub fn occurrences(&self, code: ErrorCode) -> u64 {
        self.counts.get(&code).copied().unwrap_or(0)
    }

    /// Snapshot of all non-zero counters.
    pub fn snapshot(&self) -> Vec<(ErrorCode, u64)> {
        self.counts.iter().map(|(c, n)| (*c, *n)).collect()
    }
}

/// Errors produced while driving a session.
#[derive(Error, Debug)]
pub enum Error {
    #[error("unable to decode: {0}")]
    UnableToDecode(#[from] CodecError),
    #[error("unknown opcode: {0}")]
    UnknownOpcode(u8),
    #[error("malformed control record: {0}")]
    MalformedRecord(&'static str),
    #[error("static key parse error")]
    StaticKeyParse,
    #[error("static key bad size")]
    StaticKeyBadSize,
    #[error("packet-id replay: {0}")]
    Replay(#[from] crate::packet_id::ReplayError),
    #[error("outbound packet-id space exhausted")]
    PacketIdExhausted,
    #[error("send window full")]
    WindowFull,
    #[error("receive window saturated")]
    ReceiveWindowFull,
    #[error("session id mismatch")]
    SidMismatch,
    #[error("hmac verification failed")]
    HmacMismatch,
    #[error("tls-crypt metadata verification failed")]
    TlsCryptMetadata,
    #[error("tls-crypt-v2 client key malformed")]
    TlsCryptV2ClientKey,
    #[error("handshake timeout")]
    HandshakeTimeout,
    #[error("tls: {0}")]
    Tls(&'static str),
    #[error("tls ciphertext queue overflow")]
    CiphertextOverflow,
    #[error("peer closed tls channel")]
    TlsClosed,
    #[error("no key installed for key-id {0}")]
    KeyState(u8),
    #[error("key negotiation failed: {0}")]
    KeyNegotiation(&'static str),
    #[error("key expansion failed")]
    KeyExpansion,
    #[error("encrypt failed")]
    EncryptFailed,
    #[error("decrypt failed")]
    DecryptFailed,
    #[error("no active data-channel key")]
    NoActiveKey,
    #[error("invalid configuration: {0}")]
    Config(&'static str),
    #[error("credentials required before start")]
    NeedCredentials,
    #[error("server halt: {0}")]
    Halt(String),
    #[error("server restart: {0}")]
    Restart(String),
    #[error("transport send failed")]
    TransportSend,
    #[error("transport receive failed")]
    TransportRecv,
    #[error("session stopped")]
    Stopped,
}

impl Error {
    /// Map an error to the taxonomy code reported on the bus.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnableToDecode(_) | Self::UnknownOpcode(_) | Self::MalformedRecord(_) => {
                ErrorCode::CcError
            }
            Self::StaticKeyParse | Self::StaticKeyBadSize | Self::Config(_) => ErrorCode::CcError,
            Self::Replay(e) => e.code(),
            Self::PacketIdExhausted => ErrorCode::PktidExpire,
            Self::WindowFull | Self::ReceiveWindowFull => ErrorCode::TcpOverflow,
            Self::SidMismatch => ErrorCode::BadSrcAddr,
            Self::HmacMismatch => ErrorCode::HmacError,
            Self::TlsCryptMetadata | Self::TlsCryptV2ClientKey => ErrorCode::TlsCryptMetaFail,
            Self::HandshakeTimeout => ErrorCode::HandshakeTimeout,
            Self::Tls(_) | Self::CiphertextOverflow | Self::TlsClosed => ErrorCode::SslError,
            Self::KeyState(_) => ErrorCode::KeyStateError,
            Self::KeyNegotiation(_) => ErrorCode::KevNegotiateError,
            Self::KeyExpansion => ErrorCode::KeyExpansionError,
            Self::EncryptFailed | Self::DecryptFailed => ErrorCode::DecryptError,
            Self::NoActiveKey => ErrorCode::NetworkUnavailable,
            Self::NeedCredentials => ErrorCode::NeedCreds,
            Self::Halt(_) => ErrorCode::ClientHalt,
            Self::Restart(_) => ErrorCode::ClientRestart,
            Self::TransportSend => ErrorCode::NetworkSend,
            Self::TransportRecv => ErrorCode::NetworkRecv,
            Self::Stopped => ErrorCode::CcError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_first_fatal_seals() {
        let (mut bus, mut receiver) = Bus::new();
        assert!(!bus.push(Event::non_fatal(ErrorCode::HmacError, "drop")));
        assert!(bus.push(Event::fatal(ErrorCode::HandshakeTimeout, "deadline")));
        assert!(bus.sealed());

        // Anything after the seal is counted but not delivered.
        assert!(!bus.push(Event::fatal(ErrorCode::KeepaliveTimeout, "late")));
        assert_eq!(bus.occurrences(ErrorCode::KeepaliveTimeout), 1);

        drop(bus);
        let delivered: Vec<_> = futures::executor::block_on(async {
            let mut out = Vec::new();
            while let Some(event) = receiver.next().await {
                out.push(event);
            }
            out
        });
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[1].code, ErrorCode::HandshakeTimeout);
        assert!(delivered[1].fatal);
    }

    #[test]
    fn test_counts() {
        let (mut bus, _receiver) = Bus::new();
        for _ in 0..3 {
            bus.count(ErrorCode::PktidReplay);
        }
        assert_eq!(bus.occurrences(ErrorCode::PktidReplay), 3);
        assert_eq!(bus.occurrences(ErrorCode::DecryptError), 0);
    }

    #[test]
    fn test_names_are_stable() {
        assert_eq!(ErrorCode::PktidTimeBacktrack.name(), "PKTID_TIME_BACKTRACK");
        assert_eq!(ErrorCode::TlsCryptMetaFail.name(), "TLS_CRYPT_META_FAIL");
        assert_eq!(ErrorCode::KevNegotiateError.name(), "KEV_NEGOTIATE_ERROR");
    }

    #[test]
    fn test_default_fatality() {
        assert!(ErrorCode::HandshakeTimeout.default_fatal());
        assert!(ErrorCode::SslError.default_fatal());
        assert!(!ErrorCode::PktidReplay.default_fatal());
        assert!(!ErrorCode::HmacError.default_fatal());
    }
}
