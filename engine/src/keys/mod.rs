//! Key negotiation and lifecycle: expansion of exchanged secrets into
//! per-direction data-channel keys, key-id arbitration, and the
//! primary/secondary slot rotation.

pub mod prf;
pub mod source;

use crate::{
    crypto::{AuthAlg, CipherAlg, KeyDirection},
    data::KeyContext,
    error::Error,
    static_key::{StaticKey, KEY_SIZE},
    types::SessionId,
};
use source::Randoms;
use std::time::{Duration, SystemTime};

/// PRF label for the master-secret stage.
pub const MASTER_SECRET_LABEL: &[u8] = b"OpenVPN master secret";

/// PRF label for the key-expansion stage.
pub const KEY_EXPANSION_LABEL: &[u8] = b"OpenVPN key expansion";

const MASTER_SECRET_LEN: usize = 48;

/// Number of distinct key ids on the wire.
const KEY_ID_SPACE: u8 = 8;

/// Expand the exchanged secrets into a key vault via the two-stage PRF.
///
/// The first stage folds both sides' first randoms into a master secret; the
/// second folds the second randoms and both session ids into the vault.
pub fn expand_vault(
    client: &Randoms,
    server: &Randoms,
    client_sid: &SessionId,
    server_sid: &SessionId,
) -> Result<StaticKey, Error> {
    let pre_master = client
        .pre_master
        .as_ref()
        .ok_or(Error::KeyNegotiation("missing pre-master secret"))?;

    let mut seed1 = Vec::with_capacity(2 * source::RANDOM_LEN);
    seed1.extend_from_slice(&client.random1);
    seed1.extend_from_slice(&server.random1);
    let master = prf::tls1_prf(
        pre_master.as_ref(),
        MASTER_SECRET_LABEL,
        &seed1,
        MASTER_SECRET_LEN,
    );

    let mut seed2 = Vec::with_capacity(2 * source::RANDOM_LEN + 16);
    seed2.extend_from_slice(&client.random2);
    seed2.extend_from_slice(&server.random2);
    seed2.extend_from_slice(client_sid.as_bytes());
    seed2.extend_from_slice(server_sid.as_bytes());
    let expansion = prf::tls1_prf(&master, KEY_EXPANSION_LABEL, &seed2, KEY_SIZE);

    StaticKey::try_from_slice(&expansion).map_err(|_| Error::KeyExpansion)
}

/// Build a key vault directly from TLS exporter output.
pub fn vault_from_exporter(seed: &[u8]) -> Result<StaticKey, Error> {
    StaticKey::try_from_slice(seed).map_err(|_| Error::KeyExpansion)
}

/// Renegotiation triggers for an installed key.
#[derive(Clone, Copy, Debug)]
pub struct RenegLimits {
    /// Renegotiate after this long on one key.
    pub interval: Duration,
    /// Renegotiate after this many encrypted bytes, if set.
    pub bytes: Option<u64>,
    /// Renegotiate after this many outbound packets.
    pub packets: u64,
}

impl RenegLimits {
    /// Packet cap default for AEAD suites: nearly the whole id space, with
    /// enough margin to finish renegotiating before the counter runs out.
    const AEAD_PACKETS: u64 = (1 << 32) - (1 << 20);

    /// Conservative birthday-bound cap for 128-bit-block CBC suites.
    const CBC_PACKETS: u64 = 1 << 20;

    pub fn for_suite(
        cipher: CipherAlg,
        interval: Duration,
        bytes: Option<u64>,
        packets: Option<u64>,
    ) -> Self {
        let default_packets = if cipher.is_aead() {
            Self::AEAD_PACKETS
        } else {
            Self::CBC_PACKETS
        };
        Self {
            interval,
            bytes,
            packets: packets.unwrap_or(default_packets),
        }
    }
}

/// Lifecycle of an installed key slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Installed, decrypts inbound, not yet preferred for outbound.
    ActiveSecondary,
    /// Preferred for outbound; decrypts inbound.
    ActivePrimary,
    /// Demoted: still decrypts inbound during the grace period, never
    /// encrypts outbound.
    Expiring,
}

/// One installed data-channel key.
pub struct Slot {
    pub key_id: u8,
    pub state: SlotState,
    pub crypto: KeyContext,
    pub installed_at: SystemTime,
    /// Set when the slot enters [SlotState::Expiring].
    pub retire_at: Option<SystemTime>,
}

/// The per-session key slots: at most one primary, one secondary, and one
/// key-id reserved for an in-flight negotiation.
pub struct Chain {
    slots: Vec<Slot>,
    negotiating: Option<u8>,
    last_key_id: Option<u8>,
    grace: Duration,
}

impl Chain {
    pub fn new(grace: Duration) -> Self {
        Self {
            slots: Vec::with_capacity(3),
            negotiating: None,
            last_key_id: None,
            grace,
        }
    }

    fn id_live(&self, key_id: u8) -> bool {
        self.slots.iter().any(|slot| slot.key_id == key_id)
    }

    /// Reserve the key id for a new negotiation.
    ///
    /// The first negotiation uses id 0; later ones increment through 1..7,
    /// wrapping past 0 and skipping ids still installed.
    pub fn begin_negotiation(&mut self) -> Result<u8, Error> {
        if self.negotiating.is_some() {
            return Err(Error::KeyNegotiation("negotiation already pending"));
        }
        let key_id = match self.last_key_id {
            None => 0,
            Some(last) => {
                let mut candidate = (last + 1) % KEY_ID_SPACE;
                let mut hops = 0;
                while (candidate == 0 || self.id_live(candidate)) && hops < KEY_ID_SPACE {
                    candidate = (candidate + 1) % KEY_ID_SPACE;
                    hops += 1;
                }
                if self.id_live(candidate) {
                    return Err(Error::KeyNegotiation("key-id space exhausted"));
                }
                candidate
            }
        };
        self.negotiating = Some(key_id);
        Ok(key_id)
    }

    /// Reserve a specific key id chosen by the peer (server-initiated
    /// renegotiation).
    pub fn begin_negotiation_with(&mut self, key_id: u8) -> Result<u8, Error> {
        if self.negotiating.is_some() {
            return Err(Error::KeyNegotiation("negotiation already pending"));
        }
        if key_id >= KEY_ID_SPACE || self.id_live(key_id) {
            return Err(Error::KeyNegotiation("peer key-id unavailable"));
        }
        self.negotiating = Some(key_id);
        Ok(key_id)
    }

    /// The key id reserved by [Chain::begin_negotiation], if any.
    pub fn negotiating(&self) -> Option<u8> {
        self.negotiating
    }

    /// Abandon an in-flight negotiation (failed exchange, teardown).
    pub fn abort_negotiation(&mut self) {
        self.negotiating = None;
    }

    /// Install freshly derived keys for the pending negotiation as the
    /// active secondary. Any previous secondary is dropped; promotion to
    /// primary happens on the first valid inbound packet.
    pub fn install(&mut self, crypto: KeyContext, now: SystemTime) -> Result<u8, Error> {
        let key_id = self.negotiating.take().ok_or(Error::KeyNegotiation(
            "no negotiation pending at install",
        ))?;
        self.slots
            .retain(|slot| slot.state != SlotState::ActiveSecondary);
        self.slots.push(Slot {
            key_id,
            state: SlotState::ActiveSecondary,
            crypto,
            installed_at: now,
            retire_at: None,
        });
        self.last_key_id = Some(key_id);
        Ok(key_id)
    }

    /// Record a valid inbound packet under `key_id`.
    ///
    /// The first one promotes a secondary to primary; the displaced primary
    /// enters its expiring grace window. Returns true on promotion.
    pub fn note_valid_inbound(&mut self, key_id: u8, now: SystemTime) -> bool {
        let Some(index) = self.slots.iter().position(|slot| slot.key_id == key_id) else {
            return false;
        };
        if self.slots[index].state != SlotState::ActiveSecondary {
            return false;
        }
        for slot in self.slots.iter_mut() {
            if slot.state == SlotState::ActivePrimary {
                slot.state = SlotState::Expiring;
                slot.retire_at = Some(now + self.grace);
            }
        }
        self.slots[index].state = SlotState::ActivePrimary;
        true
    }

    /// The slot used for outbound encryption.
    pub fn outbound_mut(&mut self) -> Option<&mut Slot> {
        self.slots
            .iter_mut()
            .find(|slot| slot.state == SlotState::ActivePrimary)
    }

    /// The slot decrypting inbound records with `key_id`; any installed
    /// state may decrypt.
    pub fn inbound_mut(&mut self, key_id: u8) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|slot| slot.key_id == key_id)
    }

    /// Drop expiring slots whose grace has elapsed. Key material is
    /// overwritten as the slots fall out of scope. Returns retired ids.
    pub fn retire(&mut self, now: SystemTime) -> Vec<u8> {
        let mut retired = Vec::new();
        self.slots.retain(|slot| {
            let done = matches!(slot.retire_at, Some(at) if at <= now);
            if done {
                retired.push(slot.key_id);
            }
            !done
        });
        retired
    }

    /// Earliest pending retirement deadline.
    pub fn next_retirement(&self) -> Option<SystemTime> {
        self.slots.iter().filter_map(|slot| slot.retire_at).min()
    }

    /// When the current primary was installed, if one exists.
    pub fn primary_installed_at(&self) -> Option<SystemTime> {
        self.slots
            .iter()
            .find(|slot| slot.state == SlotState::ActivePrimary)
            .map(|slot| slot.installed_at)
    }

    /// Whether the primary key has hit any renegotiation trigger.
    pub fn reneg_due(&self, now: SystemTime, limits: &RenegLimits) -> bool {
        let Some(primary) = self
            .slots
            .iter()
            .find(|slot| slot.state == SlotState::ActivePrimary)
        else {
            return false;
        };
        if self.negotiating.is_some() {
            return false;
        }
        let age = now
            .duration_since(primary.installed_at)
            .unwrap_or(Duration::ZERO);
        if age >= limits.interval {
            return true;
        }
        let (packets, bytes) = primary.crypto.tx_stats();
        if packets >= limits.packets {
            return true;
        }
        if primary.crypto.exhausted() {
            return true;
        }
        matches!(limits.bytes, Some(cap) if bytes >= cap)
    }

    /// Tear down every slot, overwriting key material. Key-id allocation
    /// restarts from zero, as for a fresh session.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.negotiating = None;
        self.last_key_id = None;
    }

    /// (key id, state) for every installed slot.
    pub fn states(&self) -> Vec<(u8, SlotState)> {
        self.slots.iter().map(|slot| (slot.key_id, slot.state)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Derive a full data-channel [KeyContext] from exchanged key material.
pub fn derive_context(
    cipher: CipherAlg,
    auth: AuthAlg,
    vault: &StaticKey,
    role: source::Role,
    replay_width: usize,
) -> KeyContext {
    // The client keys from the normal half; the server mirrors it.
    let direction = match role {
        source::Role::Client => KeyDirection::Normal,
        source::Role::Server => KeyDirection::Inverse,
    };
    KeyContext::from_vault(cipher, auth, vault, direction, replay_width)
}
