//! A scripted in-memory TLS engine for tests.
//!
//! The mock speaks a toy record protocol: handshake records tagged `0x16`,
//! application records tagged `0x17`. Each side establishes after receiving a
//! configured number of handshake records, then both derive identical
//! exporter output from a shared seed.

use super::{Engine, Identity, TlsError};
use crate::crypto::{self, AuthAlg};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use zeroize::Zeroizing;

/// Identity presented by the mock server.
pub const SERVER_COMMON_NAME: &str = "mock-vpn-server";

const HANDSHAKE_TAG: u8 = 0x16;
const APPDATA_TAG: u8 = 0x17;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Role {
    Client,
    Server,
}

/// One side of a scripted TLS session.
pub struct Session {
    role: Role,
    rounds: usize,
    received: usize,
    established: bool,
    closed: bool,
    block_pushes: bool,
    secret: [u8; 32],
    outbox: VecDeque<Bytes>,
    cleartext_in: VecDeque<Bytes>,
    pending_cleartext: VecDeque<Bytes>,
    peer_identity: Identity,
}

impl Session {
    /// A connected client/server pair sharing an exporter seed. Each side
    /// establishes after receiving `rounds` handshake records.
    pub fn pair(rounds: usize, secret: [u8; 32]) -> (Session, Session) {
        let server_identity = Identity {
            common_name: SERVER_COMMON_NAME.into(),
            subject_alt_names: vec!["vpn.example.net".into()],
            fingerprint_sha256: vec![0xAB; 32],
            serial: "01".into(),
        };
        let client_identity = Identity {
            common_name: "mock-vpn-client".into(),
            ..Identity::default()
        };
        let mut client = Session::new(Role::Client, rounds, secret, server_identity);
        let server = Session::new(Role::Server, rounds, secret, client_identity);

        // The client opens with its hello.
        let hello = client.handshake_record(0);
        client.outbox.push_back(hello);
        (client, server)
    }

    fn new(role: Role, rounds: usize, secret: [u8; 32], peer_identity: Identity) -> Self {
        Self {
            role,
            rounds: rounds.max(1),
            received: 0,
            established: false,
            closed: false,
            block_pushes: false,
            secret,
            outbox: VecDeque::new(),
            cleartext_in: VecDeque::new(),
            pending_cleartext: VecDeque::new(),
            peer_identity,
        }
    }

    fn handshake_record(&self, counter: usize) -> Bytes {
        let mut record = BytesMut::with_capacity(3);
        record.put_u8(HANDSHAKE_TAG);
        record.put_u8(match self.role {
            Role::Client => b'c',
            Role::Server => b's',
        });
        record.put_u8(counter as u8);
        record.freeze()
    }

    /// Simulate a peer close-notify.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Make `push_ciphertext` report would-block.
    pub fn block_pushes(&mut self, block: bool) {
        self.block_pushes = block;
    }

    fn flush_pending_cleartext(&mut self) {
        while let Some(data) = self.pending_cleartext.pop_front() {
            let mut record = BytesMut::with_capacity(1 + data.len());
            record.put_u8(APPDATA_TAG);
            record.put_slice(&data);
            self.outbox.push_back(record.freeze());
        }
    }
}

impl Engine for Session {
    fn push_ciphertext(&mut self, record: &[u8]) -> Result<usize, TlsError> {
        if self.closed {
            return Err(TlsError::CloseNotify);
        }
        if self.block_pushes {
            return Ok(0);
        }
        let Some((&tag, body)) = record.split_first() else {
            return Err(TlsError::Failed("empty record"));
        };
        match tag {
            HANDSHAKE_TAG => {
                self.received += 1;
                if self.received >= self.rounds {
                    self.established = true;
                    self.flush_pending_cleartext();
                }
                // Keep answering until the peer must also be done.
                if self.received <= self.rounds {
                    let reply = self.handshake_record(self.received);
                    self.outbox.push_back(reply);
                }
            }
            APPDATA_TAG => {
                if !self.established {
                    return Err(TlsError::Failed("appdata before establishment"));
                }
                self.cleartext_in.push_back(Bytes::copy_from_slice(body));
            }
            _ => return Err(TlsError::Failed("unknown record tag")),
        }
        Ok(record.len())
    }

    fn pull_ciphertext(&mut self) -> Result<Option<Bytes>, TlsError> {
        if self.closed {
            return Err(TlsError::CloseNotify);
        }
        Ok(self.outbox.pop_front())
    }

    fn write_cleartext(&mut self, data: &[u8]) -> Result<usize, TlsError> {
        if self.closed {
            return Err(TlsError::CloseNotify);
        }
        if self.established {
            let mut record = BytesMut::with_capacity(1 + data.len());
            record.put_u8(APPDATA_TAG);
            record.put_slice(data);
            self.outbox.push_back(record.freeze());
        } else {
            // Buffered until the handshake completes.
            self.pending_cleartext.push_back(Bytes::copy_from_slice(data));
        }
        Ok(data.len())
    }

    fn read_cleartext(&mut self) -> Result<Option<Bytes>, TlsError> {
        Ok(self.cleartext_in.pop_front())
    }

    fn is_established(&self) -> bool {
        self.established
    }

    fn export_keying_material(
        &self,
        label: &str,
        len: usize,
    ) -> Result<Zeroizing<Vec<u8>>, TlsError> {
        if !self.established {
            return Err(TlsError::ExporterUnavailable);
        }
        // Deterministic expansion both sides agree on.
        let mut out = Zeroizing::new(Vec::with_capacity(len));
        let mut counter = 0u32;
        while out.len() < len {
            let block = crypto::hmac_tag(
                AuthAlg::Sha256,
                &self.secret,
                &[label.as_bytes(), &counter.to_be_bytes()],
            );
            let take = block.len().min(len - out.len());
            out.extend_from_slice(&block[..take]);
            counter += 1;
        }
        Ok(out)
    }

    fn peer_identity(&self) -> Option<Identity> {
        self.established.then(|| self.peer_identity.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_converges() {
        let (mut client, mut server) = Session::pair(3, [9u8; 32]);
        let mut hops = 0;
        while !(client.established && server.established) {
            while let Some(record) = client.pull_ciphertext().unwrap() {
                server.push_ciphertext(&record).unwrap();
            }
            while let Some(record) = server.pull_ciphertext().unwrap() {
                client.push_ciphertext(&record).unwrap();
            }
            hops += 1;
            assert!(hops < 20);
        }
    }

    #[test]
    fn test_appdata_rejected_before_establishment() {
        let (_client, mut server) = Session::pair(2, [0u8; 32]);
        let mut record = vec![APPDATA_TAG];
        record.extend_from_slice(b"early");
        assert!(matches!(
            server.push_ciphertext(&record),
            Err(TlsError::Failed(_))
        ));
    }

    #[test]
    fn test_exporter_matches_between_sides() {
        let (mut client, mut server) = Session::pair(1, [5u8; 32]);
        while !(client.established && server.established) {
            while let Some(record) = client.pull_ciphertext().unwrap() {
                server.push_ciphertext(&record).unwrap();
            }
            while let Some(record) = server.pull_ciphertext().unwrap() {
                client.push_ciphertext(&record).unwrap();
            }
        }
        let a = client.export_keying_material("label", 100).unwrap();
        let b = server.export_keying_material("label", 100).unwrap();
        assert_eq!(a.as_slice(), b.as_slice());
        let c = server.export_keying_material("other", 100).unwrap();
        assert_ne!(a.as_slice(), c.as_slice());
    }
}
