//! The TLS library seam: a streaming oracle with a cleartext pipe and a
//! ciphertext pipe, plus the adapter that shuttles ciphertext between the
//! reliable layer and the oracle.
//!
//! Real TLS bindings live with the host; this crate only defines the trait
//! and ships a scripted mock for tests.

pub mod mocks;

use crate::error::Error;
use bytes::Bytes;
use std::collections::VecDeque;
use thiserror::Error as ThisError;
use zeroize::Zeroizing;

/// Ceiling on queued inbound ciphertext records. A peer that outruns the
/// oracle this far is amplifying, not handshaking.
pub const MAX_QUEUED_RECORDS: usize = 64;

/// Exporter label for data-channel key material.
pub const EXPORTER_LABEL: &str = "EXPORTER-OpenVPN-datakeys";

/// Exporter output length: one full key vault.
pub const EXPORTER_LEN: usize = crate::static_key::KEY_SIZE;

/// Failures surfaced by a TLS engine. Would-block conditions are not errors;
/// they are expressed through the `Option`/consumed-length returns.
#[derive(ThisError, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsError {
    #[error("peer sent close-notify")]
    CloseNotify,
    #[error("tls alert: {0}")]
    Alert(&'static str),
    #[error("tls failure: {0}")]
    Failed(&'static str),
    #[error("exporter unavailable")]
    ExporterUnavailable,
}

/// Peer certificate identity metadata, surfaced without policy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Identity {
    pub common_name: String,
    pub subject_alt_names: Vec<String>,
    pub fingerprint_sha256: Vec<u8>,
    pub serial: String,
}

/// A streaming TLS oracle.
///
/// The engine never blocks: writes report how many bytes were consumed
/// (zero meaning "try again after a pump") and reads return `None` when
/// nothing is available.
pub trait Engine {
    /// Feed one inbound ciphertext record. Returns the number of bytes
    /// consumed; zero means the engine cannot take the record yet.
    fn push_ciphertext(&mut self, record: &[u8]) -> Result<usize, TlsError>;

    /// Drain the next outbound ciphertext record, if the engine produced one.
    fn pull_ciphertext(&mut self) -> Result<Option<Bytes>, TlsError>;

    /// Write application cleartext. Returns bytes consumed; zero on
    /// would-block.
    fn write_cleartext(&mut self, data: &[u8]) -> Result<usize, TlsError>;

    /// Read application cleartext surfaced by the engine.
    fn read_cleartext(&mut self) -> Result<Option<Bytes>, TlsError>;

    /// Whether the handshake has completed.
    fn is_established(&self) -> bool;

    /// Export keying material once established.
    fn export_keying_material(
        &self,
        label: &str,
        len: usize,
    ) -> Result<Zeroizing<Vec<u8>>, TlsError>;

    /// Peer certificate identity, once known.
    fn peer_identity(&self) -> Option<Identity>;
}

/// Everything one pump turn produced.
#[derive(Debug, Default)]
pub struct Pumped {
    /// Ciphertext records for the reliable layer to send.
    pub ciphertext_out: Vec<Bytes>,
    /// Cleartext surfaced by the engine (handshake-layer messages).
    pub cleartext_in: Vec<Bytes>,
    /// The handshake completed during this pump.
    pub newly_established: bool,
    /// The peer closed the channel cleanly during steady state.
    pub peer_closed: bool,
}

/// Shuttles bytes between the reliable layer and a TLS engine, buffering
/// around would-block on either pipe.
pub struct Adapter<T: Engine> {
    engine: T,
    inbound: VecDeque<Bytes>,
    outbound_cleartext: VecDeque<Bytes>,
    established_seen: bool,
}

impl<T: Engine> Adapter<T> {
    pub fn new(engine: T) -> Self {
        Self {
            engine,
            inbound: VecDeque::new(),
            outbound_cleartext: VecDeque::new(),
            established_seen: false,
        }
    }

    /// Queue an inbound ciphertext record drained from a reliable payload.
    pub fn enqueue_ciphertext(&mut self, record: Bytes) -> Result<(), Error> {
        if self.inbound.len() >= MAX_QUEUED_RECORDS {
            return Err(Error::CiphertextOverflow);
        }
        self.inbound.push_back(record);
        Ok(())
    }

    /// Queue application cleartext (key exchange payloads) for the engine.
    pub fn queue_cleartext(&mut self, data: Bytes) {
        self.outbound_cleartext.push_back(data);
    }

    /// Drive the engine: feed queued ciphertext and cleartext, drain
    /// whatever it produced.
    ///
    /// Close-notify during the handshake is fatal; in steady state it is
    /// reported as a graceful close.
    pub fn pump(&mut self) -> Result<Pumped, Error> {
        let mut pumped = Pumped::default();

        // Inbound ciphertext, stopping at the first would-block.
        while let Some(record) = self.inbound.front() {
            match self.engine.push_ciphertext(record) {
                Ok(0) => break,
                Ok(consumed) => {
                    if consumed < record.len() {
                        let remainder = record.slice(consumed..);
                        self.inbound.pop_front();
                        self.inbound.push_front(remainder);
                        break;
                    }
                    self.inbound.pop_front();
                }
                Err(error) => return self.close_or_fail(error, &mut pumped),
            }
        }

        // Outbound cleartext.
        while let Some(data) = self.outbound_cleartext.front() {
            match self.engine.write_cleartext(data) {
                Ok(0) => break,
                Ok(consumed) => {
                    if consumed < data.len() {
                        let remainder = data.slice(consumed..);
                        self.outbound_cleartext.pop_front();
                        self.outbound_cleartext.push_front(remainder);
                        break;
                    }
                    self.outbound_cleartext.pop_front();
                }
                Err(error) => return self.close_or_fail(error, &mut pumped),
            }
        }

        // Drain engine output on both pipes.
        loop {
            match self.engine.pull_ciphertext() {
                Ok(Some(record)) => pumped.ciphertext_out.push(record),
                Ok(None) => break,
                Err(error) => return self.close_or_fail(error, &mut pumped),
            }
        }
        loop {
            match self.engine.read_cleartext() {
                Ok(Some(data)) => pumped.cleartext_in.push(data),
                Ok(None) => break,
                Err(error) => return self.close_or_fail(error, &mut pumped),
            }
        }

        if !self.established_seen && self.engine.is_established() {
            self.established_seen = true;
            pumped.newly_established = true;
        }
        Ok(pumped)
    }

    fn close_or_fail(&mut self, error: TlsError, pumped: &mut Pumped) -> Result<Pumped, Error> {
        match error {
            TlsError::CloseNotify if self.established_seen => {
                pumped.peer_closed = true;
                Ok(std::mem::take(pumped))
            }
            TlsError::CloseNotify => Err(Error::TlsClosed),
            TlsError::Alert(reason) | TlsError::Failed(reason) => Err(Error::Tls(reason)),
            TlsError::ExporterUnavailable => Err(Error::Tls("exporter unavailable")),
        }
    }

    pub fn is_established(&self) -> bool {
        self.established_seen
    }

    /// Exporter-derived seed for key negotiation.
    pub fn export_seed(&self) -> Result<Zeroizing<Vec<u8>>, Error> {
        self.engine
            .export_keying_material(EXPORTER_LABEL, EXPORTER_LEN)
            .map_err(|_| Error::Tls("exporter unavailable"))
    }

    pub fn peer_identity(&self) -> Option<Identity> {
        self.engine.peer_identity()
    }

    pub fn queued_records(&self) -> usize {
        self.inbound.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{mocks, *};

    #[test]
    fn test_handshake_completes_through_adapters() {
        let (client, server) = mocks::Session::pair(2, [7u8; 32]);
        let mut client = Adapter::new(client);
        let mut server = Adapter::new(server);

        // Shuttle records between the two adapters until both establish.
        let mut rounds = 0;
        while !(client.is_established() && server.is_established()) {
            let pumped = client.pump().unwrap();
            for record in pumped.ciphertext_out {
                server.enqueue_ciphertext(record).unwrap();
            }
            let pumped = server.pump().unwrap();
            for record in pumped.ciphertext_out {
                client.enqueue_ciphertext(record).unwrap();
            }
            rounds += 1;
            assert!(rounds < 16, "handshake did not converge");
        }

        // Both ends derive the same exporter seed.
        let client_seed = client.export_seed().unwrap();
        let server_seed = server.export_seed().unwrap();
        assert_eq!(client_seed.as_slice(), server_seed.as_slice());
        assert_eq!(client_seed.len(), EXPORTER_LEN);

        // Identity metadata flows through without interpretation.
        assert_eq!(
            client.peer_identity().unwrap().common_name,
            mocks::SERVER_COMMON_NAME
        );
    }

    #[test]
    fn test_cleartext_round_trip() {
        let (client, server) = mocks::Session::pair(1, [1u8; 32]);
        let mut client = Adapter::new(client);
        let mut server = Adapter::new(server);

        client.queue_cleartext(Bytes::from_static(b"key exchange payload"));
        for _ in 0..4 {
            let pumped = client.pump().unwrap();
            for record in pumped.ciphertext_out {
                server.enqueue_ciphertext(record).unwrap();
            }
            let pumped = server.pump().unwrap();
            if pumped
                .cleartext_in
                .iter()
                .any(|data| data.as_ref() == b"key exchange payload")
            {
                return;
            }
            for record in pumped.ciphertext_out {
                client.enqueue_ciphertext(record).unwrap();
            }
        }
        panic!("cleartext never surfaced");
    }

    #[test]
    fn test_ciphertext_ceiling() {
        let (client, _server) = mocks::Session::pair(1, [0u8; 32]);
        let mut adapter = Adapter::new(client);
        for _ in 0..MAX_QUEUED_RECORDS {
            adapter
                .enqueue_ciphertext(Bytes::from_static(b"r"))
                .unwrap();
        }
        assert!(matches!(
            adapter.enqueue_ciphertext(Bytes::from_static(b"r")),
            Err(Error::CiphertextOverflow)
        ));
    }

    #[test]
    fn test_close_notify_during_handshake_is_fatal() {
        let (client, _server) = mocks::Session::pair(4, [0u8; 32]);
        let mut adapter = Adapter::new(client);
        adapter.engine.close();
        assert!(matches!(adapter.pump(), Err(Error::TlsClosed)));
    }

    #[test]
    fn test_close_notify_in_steady_state_is_graceful() {
        let (client, server) = mocks::Session::pair(1, [0u8; 32]);
        let mut client = Adapter::new(client);
        let mut server = Adapter::new(server);
        for _ in 0..4 {
            let pumped = client.pump().unwrap();
            for record in pumped.ciphertext_out {
                server.enqueue_ciphertext(record).unwrap();
            }
            let pumped = server.pump().unwrap();
            for record in pumped.ciphertext_out {
                client.enqueue_ciphertext(record).unwrap();
            }
        }
        assert!(client.is_established());

        client.engine.close();
        let pumped = client.pump().unwrap();
        assert!(pumped.peer_closed);
    }

    #[test]
    fn test_exporter_before_established_fails() {
        let (client, _server) = mocks::Session::pair(2, [0u8; 32]);
        let adapter = Adapter::new(client);
        assert!(adapter.export_seed().is_err());
    }

    #[test]
    fn test_would_block_leaves_ciphertext_queued() {
        let (client, _server) = mocks::Session::pair(1, [0u8; 32]);
        let mut adapter = Adapter::new(client);
        adapter.engine.block_pushes(true);
        // A server handshake record in the mock's framing.
        adapter
            .enqueue_ciphertext(Bytes::from_static(&[0x16, b's', 0]))
            .unwrap();
        adapter.pump().unwrap();
        assert_eq!(adapter.queued_records(), 1);

        adapter.engine.block_pushes(false);
        adapter.pump().unwrap();
        assert_eq!(adapter.queued_records(), 0);
    }
}
