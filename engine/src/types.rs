//! Wire-level types shared by the control and data channels: session ids,
//! opcodes, and the record codecs.
//!
//! Field ordering is fixed by the published protocol; every codec here must
//! stay byte-compatible with it.

use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{EncodeSize, Error as CodecError, Read, ReadExt, Write};
use rand::{CryptoRng, Rng};

/// Maximum number of acknowledgements carried by one control record.
pub const ACK_MAX: usize = 4;

/// Number of peer-id bytes in a DATA_V2 header.
const PEER_ID_LEN: usize = 3;

/// Opaque 8-byte session identifier; one per endpoint per session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SessionId(pub [u8; 8]);

impl SessionId {
    pub fn random<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 8];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl std::fmt::Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionId({})", commonware_utils::hex(&self.0))
    }
}

impl Write for SessionId {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }
}

impl Read for SessionId {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let bytes = <[u8; 8]>::read(buf)?;
        Ok(Self(bytes))
    }
}

impl EncodeSize for SessionId {
    fn encode_size(&self) -> usize {
        8
    }
}

/// Record opcodes. The wire carries the opcode in the top five bits of the
/// first byte, with the 3-bit key-id below it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// In-session renegotiation request; session ids are preserved.
    SoftReset = 3,
    /// Control-channel payload (TLS ciphertext, key exchange).
    Control = 4,
    /// Standalone acknowledgement record.
    Ack = 5,
    /// Data-channel record, legacy header.
    DataV1 = 6,
    /// Client side of a fresh session.
    HardResetClient = 7,
    /// Server side of a fresh session.
    HardResetServer = 8,
    /// Data-channel record with a 24-bit peer-id.
    DataV2 = 9,
    /// Client hard reset carrying a tls-crypt-v2 client key bundle.
    HardResetClientV3 = 10,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Result<Self, crate::error::Error> {
        match value {
            3 => Ok(Self::SoftReset),
            4 => Ok(Self::Control),
            5 => Ok(Self::Ack),
            6 => Ok(Self::DataV1),
            7 => Ok(Self::HardResetClient),
            8 => Ok(Self::HardResetServer),
            9 => Ok(Self::DataV2),
            10 => Ok(Self::HardResetClientV3),
            other => Err(crate::error::Error::UnknownOpcode(other)),
        }
    }

    /// Whether records with this opcode belong to the reliable layer.
    pub fn is_control(&self) -> bool {
        !self.is_data()
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Self::DataV1 | Self::DataV2)
    }

    /// Whether this opcode opens (or reopens) a TLS exchange.
    pub fn is_reset(&self) -> bool {
        matches!(
            self,
            Self::SoftReset | Self::HardResetClient | Self::HardResetServer | Self::HardResetClientV3
        )
    }
}

/// Split a record's first byte into opcode and key-id.
pub fn split_first_byte(byte: u8) -> Result<(Opcode, u8), crate::error::Error> {
    Ok((Opcode::from_u8(byte >> 3)?, byte & 0x07))
}

/// Join opcode and key-id into a record's first byte.
pub fn join_first_byte(opcode: Opcode, key_id: u8) -> u8 {
    ((opcode as u8) << 3) | (key_id & 0x07)
}

/// One control-channel record as seen by the reliable layer, before any
/// tls-auth / tls-crypt wrapping.
///
/// Layout: first byte (opcode | key-id), sender session id, ACK vector
/// (count byte then 4-byte ids), the remote session id whenever the ACK
/// vector is non-empty, the record's own packet id (absent for ACK_V1),
/// then the payload running to the end of the datagram.
#[derive(Clone, Debug, PartialEq)]
pub struct ControlRecord {
    pub opcode: Opcode,
    pub key_id: u8,
    pub session_id: SessionId,
    pub acks: Vec<u32>,
    pub remote_session_id: Option<SessionId>,
    pub packet_id: Option<u32>,
    pub payload: Bytes,
}

impl ControlRecord {
    /// A standalone ACK_V1 record.
    pub fn ack(
        session_id: SessionId,
        remote_session_id: SessionId,
        acks: Vec<u32>,
    ) -> Self {
        Self {
            opcode: Opcode::Ack,
            key_id: 0,
            session_id,
            acks,
            remote_session_id: Some(remote_session_id),
            packet_id: None,
            payload: Bytes::new(),
        }
    }
}

impl Write for ControlRecord {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u8(join_first_byte(self.opcode, self.key_id));
        self.session_id.write(buf);
        buf.put_u8(self.acks.len() as u8);
        for ack in &self.acks {
            ack.write(buf);
        }
        if !self.acks.is_empty() {
            if let Some(remote) = &self.remote_session_id {
                remote.write(buf);
            }
        }
        if let Some(packet_id) = self.packet_id {
            packet_id.write(buf);
        }
        buf.put_slice(&self.payload);
    }
}

impl EncodeSize for ControlRecord {
    fn encode_size(&self) -> usize {
        let mut size = 1 + 8 + 1 + self.acks.len() * 4;
        if !self.acks.is_empty() {
            size += 8;
        }
        if self.packet_id.is_some() {
            size += 4;
        }
        size + self.payload.len()
    }
}

impl Read for ControlRecord {
    /// Maximum accepted payload length.
    type Cfg = usize;

    fn read_cfg(buf: &mut impl Buf, max_payload: &usize) -> Result<Self, CodecError> {
        let first = u8::read(buf)?;
        let opcode = Opcode::from_u8(first >> 3)
            .map_err(|_| CodecError::Invalid("ControlRecord", "unknown opcode"))?;
        if opcode.is_data() {
            return Err(CodecError::Invalid("ControlRecord", "data opcode"));
        }
        let key_id = first & 0x07;
        let session_id = SessionId::read(buf)?;
        let ack_count = u8::read(buf)? as usize;
        if ack_count > ACK_MAX {
            return Err(CodecError::Invalid("ControlRecord", "ack vector too long"));
        }
        let mut acks = Vec::with_capacity(ack_count);
        for _ in 0..ack_count {
            acks.push(u32::read(buf)?);
        }
        let remote_session_id = if ack_count > 0 {
            Some(SessionId::read(buf)?)
        } else {
            None
        };
        let packet_id = if opcode == Opcode::Ack {
            None
        } else {
            Some(u32::read(buf)?)
        };
        let remaining = buf.remaining();
        if remaining > *max_payload {
            return Err(CodecError::InvalidLength(remaining));
        }
        if opcode == Opcode::Ack && remaining != 0 {
            return Err(CodecError::Invalid("ControlRecord", "payload on ack"));
        }
        let payload = buf.copy_to_bytes(remaining);
        Ok(Self {
            opcode,
            key_id,
            session_id,
            acks,
            remote_session_id,
            packet_id,
            payload,
        })
    }
}

/// One data-channel record header plus its opaque crypto body.
///
/// The body layout (packet id, IV, ciphertext, tag) is owned by the
/// data-channel suite; this type only frames the opcode, key-id, and the
/// optional 24-bit peer-id of the V2 header.
#[derive(Clone, Debug, PartialEq)]
pub struct DataRecord {
    pub key_id: u8,
    /// 24-bit peer-id; present on DATA_V2 records.
    pub peer_id: Option<u32>,
    pub body: Bytes,
}

impl DataRecord {
    pub fn opcode(&self) -> Opcode {
        if self.peer_id.is_some() {
            Opcode::DataV2
        } else {
            Opcode::DataV1
        }
    }

    /// The bytes the data-channel suites authenticate as associated data.
    pub fn header_bytes(&self) -> Vec<u8> {
        let mut header = Vec::with_capacity(1 + PEER_ID_LEN);
        header.push(join_first_byte(self.opcode(), self.key_id));
        if let Some(peer_id) = self.peer_id {
            header.extend_from_slice(&peer_id.to_be_bytes()[1..]);
        }
        header
    }
}

impl Write for DataRecord {
    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u8(join_first_byte(self.opcode(), self.key_id));
        if let Some(peer_id) = self.peer_id {
            buf.put_slice(&peer_id.to_be_bytes()[1..]);
        }
        buf.put_slice(&self.body);
    }
}

impl EncodeSize for DataRecord {
    fn encode_size(&self) -> usize {
        1 + if self.peer_id.is_some() { PEER_ID_LEN } else { 0 } + self.body.len()
    }
}

impl Read for DataRecord {
    /// Maximum accepted body length.
    type Cfg = usize;

    fn read_cfg(buf: &mut impl Buf, max_body: &usize) -> Result<Self, CodecError> {
        let first = u8::read(buf)?;
        let opcode = Opcode::from_u8(first >> 3)
            .map_err(|_| CodecError::Invalid("DataRecord", "unknown opcode"))?;
        let key_id = first & 0x07;
        let peer_id = match opcode {
            Opcode::DataV1 => None,
            Opcode::DataV2 => {
                let bytes = <[u8; PEER_ID_LEN]>::read(buf)?;
                Some(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
            }
            _ => return Err(CodecError::Invalid("DataRecord", "control opcode")),
        };
        let remaining = buf.remaining();
        if remaining > *max_body {
            return Err(CodecError::InvalidLength(remaining));
        }
        let body = buf.copy_to_bytes(remaining);
        Ok(Self {
            key_id,
            peer_id,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_codec::Encode;
    use rand::{rngs::StdRng, SeedableRng};

    const MAX: usize = 1 << 16;

    #[test]
    fn test_session_id_random() {
        let mut rng = StdRng::seed_from_u64(0);
        let a = SessionId::random(&mut rng);
        let b = SessionId::random(&mut rng);
        assert_ne!(a, b);
    }

    #[test]
    fn test_first_byte_layout() {
        assert_eq!(join_first_byte(Opcode::Control, 5), (4 << 3) | 5);
        assert_eq!(
            split_first_byte((9 << 3) | 2).unwrap(),
            (Opcode::DataV2, 2)
        );
        assert!(split_first_byte(0xFF).is_err());
    }

    #[test]
    fn test_control_record_round_trip() {
        let record = ControlRecord {
            opcode: Opcode::Control,
            key_id: 1,
            session_id: SessionId([1; 8]),
            acks: vec![7, 8],
            remote_session_id: Some(SessionId([2; 8])),
            packet_id: Some(42),
            payload: Bytes::from_static(b"tls bytes"),
        };
        let encoded = record.encode();
        assert_eq!(encoded.len(), record.encode_size());
        let decoded = ControlRecord::read_cfg(&mut encoded.as_ref(), &MAX).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_control_record_exact_bytes() {
        let record = ControlRecord {
            opcode: Opcode::HardResetClient,
            key_id: 0,
            session_id: SessionId([0xAA; 8]),
            acks: vec![],
            remote_session_id: None,
            packet_id: Some(1),
            payload: Bytes::new(),
        };
        let encoded = record.encode();
        let mut expected = vec![7 << 3];
        expected.extend_from_slice(&[0xAA; 8]);
        expected.push(0); // ack count
        expected.extend_from_slice(&1u32.to_be_bytes());
        assert_eq!(&encoded[..], &expected[..]);
    }

    #[test]
    fn test_ack_record() {
        let record = ControlRecord::ack(SessionId([1; 8]), SessionId([2; 8]), vec![3, 4, 5]);
        let encoded = record.encode();
        let decoded = ControlRecord::read_cfg(&mut encoded.as_ref(), &MAX).unwrap();
        assert_eq!(decoded.opcode, Opcode::Ack);
        assert_eq!(decoded.packet_id, None);
        assert_eq!(decoded.acks, vec![3, 4, 5]);
        assert_eq!(decoded.remote_session_id, Some(SessionId([2; 8])));
    }

    #[test]
    fn test_ack_with_payload_rejected() {
        let mut record = ControlRecord::ack(SessionId([1; 8]), SessionId([2; 8]), vec![3]);
        record.payload = Bytes::from_static(b"bad");
        let encoded = record.encode();
        assert!(ControlRecord::read_cfg(&mut encoded.as_ref(), &MAX).is_err());
    }

    #[test]
    fn test_ack_vector_too_long() {
        let record = ControlRecord::ack(
            SessionId([1; 8]),
            SessionId([2; 8]),
            vec![1, 2, 3, 4, 5],
        );
        let encoded = record.encode();
        assert!(ControlRecord::read_cfg(&mut encoded.as_ref(), &MAX).is_err());
    }

    #[test]
    fn test_payload_bound() {
        let record = ControlRecord {
            opcode: Opcode::Control,
            key_id: 0,
            session_id: SessionId([1; 8]),
            acks: vec![],
            remote_session_id: None,
            packet_id: Some(1),
            payload: Bytes::from(vec![0u8; 100]),
        };
        let encoded = record.encode();
        assert!(ControlRecord::read_cfg(&mut encoded.as_ref(), &99).is_err());
        assert!(ControlRecord::read_cfg(&mut record.encode().as_ref(), &100).is_ok());
    }

    #[test]
    fn test_data_record_v1_v2() {
        let v1 = DataRecord {
            key_id: 3,
            peer_id: None,
            body: Bytes::from_static(b"ciphertext"),
        };
        let encoded = v1.encode();
        assert_eq!(encoded[0], (6 << 3) | 3);
        let decoded = DataRecord::read_cfg(&mut encoded.as_ref(), &MAX).unwrap();
        assert_eq!(decoded, v1);

        let v2 = DataRecord {
            key_id: 1,
            peer_id: Some(0x0A0B0C),
            body: Bytes::from_static(b"ciphertext"),
        };
        let encoded = v2.encode();
        assert_eq!(encoded[0], (9 << 3) | 1);
        assert_eq!(&encoded[1..4], &[0x0A, 0x0B, 0x0C]);
        let decoded = DataRecord::read_cfg(&mut encoded.as_ref(), &MAX).unwrap();
        assert_eq!(decoded, v2);
    }

    #[test]
    fn test_data_record_header_bytes() {
        let v2 = DataRecord {
            key_id: 1,
            peer_id: Some(0x0A0B0C),
            body: Bytes::new(),
        };
        assert_eq!(v2.header_bytes(), vec![(9 << 3) | 1, 0x0A, 0x0B, 0x0C]);
    }

    #[test]
    fn test_data_record_rejects_control_opcode() {
        let bytes = [(4u8 << 3), 0, 0, 0];
        assert!(DataRecord::read_cfg(&mut &bytes[..], &MAX).is_err());
    }
}
