//! The session core: one event loop owning the reliable layer, the
//! control-channel wrapper, the TLS adapter, the key chain, all timers, and
//! the error bus.
//!
//! Everything is serialized on the loop. Host commands arrive through the
//! [Mailbox]; tunnel traffic crosses through the [TunHandle]; typed events
//! leave through the receiver returned by [Session::new].

pub mod config;
mod ingress;

pub use config::{Config, Credentials, Proto, Remote};
pub use ingress::Mailbox;

use crate::{
    data,
    error::{Bus, Error, ErrorCode, Event},
    keys::{
        self,
        source::{KeyMethod2, Randoms, Role},
        Chain, RenegLimits, SlotState,
    },
    metrics::{self, Metrics},
    reliable,
    tls::{Adapter, Engine as TlsEngine, Identity},
    types::{split_first_byte, ControlRecord, DataRecord, Opcode, SessionId},
    wrap::Wrapper,
};
use bytes::{BufMut, Bytes, BytesMut};
use commonware_codec::{Encode, Read};
use commonware_macros::select;
use commonware_runtime::{Clock, Handle, Metrics as RuntimeMetrics, Sink, Spawner, Stream};
use commonware_utils::SystemTimeExt;
use futures::{channel::mpsc, StreamExt};
use rand::{CryptoRng, Rng};
use std::{
    collections::VecDeque,
    time::{Duration, SystemTime},
};
use tracing::{debug, info, warn};

/// Counted per-packet crypto drops become fatal at this many occurrences.
const CRYPTO_DROP_THRESHOLD: u64 = 100;

/// Dropped egress packets surface NETWORK_UNAVAILABLE at this count.
const UNAVAILABLE_THRESHOLD: u64 = 64;

/// Egress packets parked while a renegotiation replaces an exhausted key.
const EGRESS_QUEUE: usize = 64;

/// Session lifecycle. Renegotiation overlaps [State::Active]; it is tracked
/// separately and never leaves it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Initial,
    ResetSent,
    AuthWait,
    GetConfig,
    Active,
    Stopping,
    Dead,
}

/// Counter and state snapshot returned by [Mailbox::stats].
#[derive(Clone, Debug)]
pub struct Stats {
    pub state: State,
    pub renegotiating: bool,
    pub paused: bool,
    pub control_sent: u64,
    pub control_received: u64,
    pub retransmits: u64,
    pub data_sent: u64,
    pub data_received: u64,
    pub pings_sent: u64,
    pub drops_replay: u64,
    pub drops_hmac: u64,
    pub drops_decrypt: u64,
    pub drops_key_state: u64,
    pub negotiations: u64,
    pub pauses: u64,
    pub reconnects: u64,
    pub key_limit_renegotiations: u64,
    pub slots: Vec<(u8, SlotState)>,
    pub session_token: Option<String>,
    pub peer_identity: Option<Identity>,
    pub last_received: Option<SystemTime>,
}

/// Host side of the tunnel plumbing: push IP packets in, read decrypted
/// packets out.
pub struct TunHandle {
    pub sender: mpsc::Sender<Bytes>,
    pub receiver: mpsc::Receiver<Bytes>,
}

/// One key negotiation in flight (initial handshake or soft reset): its
/// reliable pair, its TLS adapter, and the key-method-2 exchange state.
struct Negotiation<T: TlsEngine> {
    key_id: u8,
    sender: reliable::Sender,
    receiver: reliable::Receiver,
    tls: Adapter<T>,
    /// TLS records waiting for room in the reliable send window.
    outbox: VecDeque<Bytes>,
    local_randoms: Option<Randoms>,
    km2_sent: bool,
    km2_received: bool,
}

impl<T: TlsEngine> Negotiation<T> {
    fn new(key_id: u8, engine: T) -> Self {
        Self {
            key_id,
            sender: reliable::Sender::new(reliable::DEFAULT_WINDOW),
            receiver: reliable::Receiver::new(reliable::DEFAULT_REORDER),
            tls: Adapter::new(engine),
            outbox: VecDeque::new(),
            local_randoms: None,
            km2_sent: false,
            km2_received: false,
        }
    }
}

/// The session actor.
pub struct Session<E, T, F>
where
    E: Clock + Spawner + RuntimeMetrics + Rng + CryptoRng + Clone,
    T: TlsEngine,
    F: FnMut() -> T,
{
    context: E,
    config: Config,
    tls_factory: F,
    wrapper: Wrapper,
    control: Option<mpsc::Receiver<ingress::Message>>,
    tun_in: Option<mpsc::Receiver<Bytes>>,
    tun_out: mpsc::Sender<Bytes>,
    bus: Bus,
    metrics: Metrics,

    state: State,
    renegotiating: bool,
    paused: bool,
    local_sid: SessionId,
    remote_sid: Option<SessionId>,
    chain: Chain,
    limits: RenegLimits,
    current: Option<Negotiation<T>>,
    pending: Option<Negotiation<T>>,
    parked_egress: VecDeque<Bytes>,
    credentials: Option<Credentials>,
    session_token: Option<String>,
    peer_identity: Option<Identity>,

    handshake_deadline: Option<SystemTime>,
    reconnect_at: Option<SystemTime>,
    last_data_sent: SystemTime,
    last_received: Option<SystemTime>,
    last_user_traffic: SystemTime,

    pauses: u64,
    reconnects: u64,
    key_limit_renegotiations: u64,
    dropped_egress: u64,
}

impl<E, T, F> Session<E, T, F>
where
    E: Clock + Spawner + RuntimeMetrics + Rng + CryptoRng + Clone,
    T: TlsEngine,
    F: FnMut() -> T + Send + 'static,
    T: Send + 'static,
{
    /// Validate the configuration and assemble a session.
    ///
    /// Returns the actor, the command mailbox, the event stream, and the
    /// tunnel plumbing. Configuration errors surface here, before anything
    /// runs.
    #[allow(clippy::type_complexity)]
    pub fn new(
        context: E,
        config: Config,
        tls_factory: F,
    ) -> Result<
        (
            Self,
            Mailbox,
            mpsc::UnboundedReceiver<Event>,
            TunHandle,
        ),
        Error,
    > {
        config.validate()?;
        let wrapper = config.build_wrapper()?;
        let (bus, events) = Bus::new();
        let metrics = Metrics::init(&context);

        let (command_sender, command_receiver) = mpsc::channel(config.mailbox_size);
        let (tun_out_sender, tun_out_receiver) = mpsc::channel(1024);
        let (tun_in_sender, tun_in_receiver) = mpsc::channel(1024);

        let mut context = context;
        let local_sid = SessionId::random(&mut context);
        let now = context.current();
        let limits = RenegLimits::for_suite(
            config.cipher,
            config.reneg_interval,
            config.reneg_bytes,
            config.reneg_packets,
        );
        let chain = Chain::new(config.expiring_grace);
        let credentials = config.credentials.clone();

        Ok((
            Self {
                context,
                config,
                tls_factory,
                wrapper,
                control: Some(command_receiver),
                tun_in: Some(tun_in_receiver),
                tun_out: tun_out_sender,
                bus,
                metrics,
                state: State::Initial,
                renegotiating: false,
                paused: false,
                local_sid,
                remote_sid: None,
                chain,
                limits,
                current: None,
                pending: None,
                parked_egress: VecDeque::new(),
                credentials,
                session_token: None,
                peer_identity: None,
                handshake_deadline: None,
                reconnect_at: None,
                last_data_sent: now,
                last_received: None,
                last_user_traffic: now,
                pauses: 0,
                reconnects: 0,
                key_limit_renegotiations: 0,
                dropped_egress: 0,
            },
            Mailbox::new(command_sender),
            events,
            TunHandle {
                sender: tun_in_sender,
                receiver: tun_out_receiver,
            },
        ))
    }

    /// Spawn the session loop onto the runtime.
    pub fn start<Si: Sink, St: Stream>(self, sink: Si, stream: St) -> Handle<()> {
        self.context
            .clone()
            .with_label("session")
            .spawn(move |_| self.run(sink, stream))
    }

    /// Drive the session until it stops or dies.
    pub async fn run<Si: Sink, St: Stream>(mut self, mut sink: Si, mut stream: St) {
        let (Some(mut commands), Some(mut tun_in)) = (self.control.take(), self.tun_in.take())
        else {
            return;
        };
        let mut tun_open = true;

        if let Err(error) = self.open(&mut sink).await {
            self.fail(error);
        }

        while self.state != State::Dead {
            let deadline = self.next_deadline();
            let tun_ready = tun_open && self.state == State::Active && !self.paused;
            let tun_next = async {
                if tun_ready {
                    tun_in.next().await
                } else {
                    futures::future::pending().await
                }
            };
            select! {
                command = commands.next() => {
                    match command {
                        Some(command) => self.handle_command(command, &mut sink).await,
                        // Host dropped every handle: tear down.
                        None => self.stop(&mut sink).await,
                    }
                },
                packet = tun_next => {
                    match packet {
                        Some(packet) => {
                            if let Err(error) = self.handle_egress(packet, &mut sink).await {
                                self.fail(error);
                            }
                        }
                        None => tun_open = false,
                    }
                },
                frame = stream.recv() => {
                    match frame {
                        Ok(frame) => {
                            if let Err(error) = self.handle_frame(frame, &mut sink).await {
                                self.fail(error);
                            }
                        }
                        Err(_) => {
                            if self.state != State::Stopping {
                                self.fail(Error::TransportRecv);
                            } else {
                                self.state = State::Dead;
                            }
                        }
                    }
                },
                _ = self.context.sleep_until(deadline) => {
                    if let Err(error) = self.handle_tick(&mut sink).await {
                        self.fail(error);
                    }
                },
            }
        }

        self.teardown();
    }

    /// Send the opening hard reset and arm the handshake timer.
    async fn open<Si: Sink>(&mut self, sink: &mut Si) -> Result<(), Error> {
        let now = self.context.current();
        self.handshake_deadline = Some(now + self.config.handshake_timeout);
        self.state = State::ResetSent;
        info!(sid = ?self.local_sid, "session starting");
        self.start_negotiation(None, sink).await
    }

    /// Begin a key negotiation: the initial handshake when no keys exist,
    /// a soft reset otherwise. `forced_key_id` carries a server-chosen id.
    async fn start_negotiation<Si: Sink>(
        &mut self,
        forced_key_id: Option<u8>,
        sink: &mut Si,
    ) -> Result<(), Error> {
        let key_id = match forced_key_id {
            Some(id) => self.chain.begin_negotiation_with(id)?,
            None => self.chain.begin_negotiation()?,
        };
        let initial = self.current.is_none();
        let mut negotiation = Negotiation::new(key_id, (self.tls_factory)());
        let opcode = if initial {
            self.wrapper.hard_reset_opcode()
        } else {
            Opcode::SoftReset
        };
        negotiation
            .sender
            .send(opcode, Bytes::new(), self.context.current())?;
        if !initial {
            self.renegotiating = true;
            debug!(key_id, "soft reset");
        }
        self.pending = Some(negotiation);
        self.flush(sink).await
    }

    /// Transmit everything due on both negotiations: queued TLS records,
    /// retransmits, and standalone ACKs.
    async fn flush<Si: Sink>(&mut self, sink: &mut Si) -> Result<(), Error> {
        if self.paused {
            return Ok(());
        }
        let now = self.context.current();
        let mut pending = self.pending.take();
        if let Some(negotiation) = pending.as_mut() {
            self.flush_negotiation(negotiation, now, sink).await?;
        }
        self.pending = pending;
        let mut current = self.current.take();
        if let Some(negotiation) = current.as_mut() {
            self.flush_negotiation(negotiation, now, sink).await?;
        }
        self.current = current;
        Ok(())
    }

    async fn flush_negotiation<Si: Sink>(
        &mut self,
        negotiation: &mut Negotiation<T>,
        now: SystemTime,
        sink: &mut Si,
    ) -> Result<(), Error> {
        // Move queued TLS records into the send window as room opens.
        while negotiation.sender.has_room() {
            let Some(payload) = negotiation.outbox.pop_front() else {
                break;
            };
            negotiation.sender.send(Opcode::Control, payload, now)?;
        }

        let wall = now.epoch().as_secs() as u32;
        for (opcode, packet_id, payload, attempt) in negotiation.sender.due(now) {
            let acks = negotiation.receiver.take_acks();
            let record = ControlRecord {
                opcode,
                key_id: negotiation.key_id,
                session_id: self.local_sid,
                remote_session_id: if acks.is_empty() {
                    None
                } else {
                    self.remote_sid
                },
                acks,
                packet_id: Some(packet_id),
                payload,
            };
            let mut wire = self.wrapper.wrap(record.encode().freeze(), wall)?;
            if opcode == Opcode::HardResetClientV3 {
                if let Some(tail) = self.wrapper.client_key_tail() {
                    let mut extended = BytesMut::with_capacity(wire.len() + tail.len());
                    extended.put_slice(&wire);
                    extended.put_slice(&tail);
                    wire = extended.freeze();
                }
            }
            sink.send(wire.to_vec())
                .await
                .map_err(|_| Error::TransportSend)?;
            if attempt == 0 {
                self.metrics.control_sent.inc();
            } else {
                self.metrics.retransmits.inc();
            }
        }

        // Acknowledgements with no outbound record to ride on.
        while negotiation.receiver.has_acks() {
            let Some(remote) = self.remote_sid else {
                break;
            };
            let acks = negotiation.receiver.take_acks();
            let record = ControlRecord::ack(self.local_sid, remote, acks);
            let wire = self.wrapper.wrap(record.encode().freeze(), wall)?;
            sink.send(wire.to_vec())
                .await
                .map_err(|_| Error::TransportSend)?;
        }
        Ok(())
    }

    /// Route one wire frame.
    async fn handle_frame<Si: Sink>(&mut self, frame: Bytes, sink: &mut Si) -> Result<(), Error> {
        let Some(&first) = frame.first() else {
            self.count_drop(ErrorCode::CcError, "empty frame");
            return Ok(());
        };
        let Ok((opcode, _key_id)) = split_first_byte(first) else {
            self.count_drop(ErrorCode::CcError, "unknown opcode");
            return Ok(());
        };
        if opcode.is_data() {
            self.handle_data(frame, sink).await?;
        } else {
            self.handle_control(frame, sink).await?;
        }
        Ok(())
    }

    async fn handle_data<Si: Sink>(&mut self, frame: Bytes, sink: &mut Si) -> Result<(), Error> {
        let record = match DataRecord::read_cfg(&mut frame.clone(), &self.config.max_record) {
            Ok(record) => record,
            Err(_) => {
                self.count_drop(ErrorCode::CcError, "malformed data record");
                return Ok(());
            }
        };
        let Some(slot) = self.chain.inbound_mut(record.key_id) else {
            self.count_drop(ErrorCode::KeyStateError, "unknown key-id");
            return Ok(());
        };
        match slot.crypto.decrypt(&record) {
            Ok((_packet_id, plaintext)) => {
                let now = self.context.current();
                self.last_received = Some(now);
                if self.chain.note_valid_inbound(record.key_id, now) {
                    debug!(key_id = record.key_id, "key promoted to primary");
                    self.renegotiating = false;
                    // Egress parked during the key swap can move again.
                    while let Some(parked) = self.parked_egress.pop_front() {
                        self.handle_egress(parked, sink).await?;
                    }
                }
                self.metrics.data_received.inc();
                if data::is_ping(&plaintext) {
                    return Ok(());
                }
                self.last_user_traffic = now;
                // Best-effort delivery; a saturated host drops the packet.
                if self.tun_out.try_send(plaintext).is_err() {
                    self.count_drop(ErrorCode::TcpOverflow, "tun backlog");
                }
            }
            Err(error) => self.count_crypto_drop(error),
        }
        Ok(())
    }

    async fn handle_control<Si: Sink>(
        &mut self,
        frame: Bytes,
        sink: &mut Si,
    ) -> Result<(), Error> {
        let plain = match self.wrapper.unwrap(frame) {
            Ok(plain) => plain,
            Err(Error::HmacMismatch) => {
                self.count_drop(ErrorCode::TlsAuthFail, "control hmac failure");
                if self.bus.occurrences(ErrorCode::TlsAuthFail) >= CRYPTO_DROP_THRESHOLD {
                    return Err(Error::HmacMismatch);
                }
                return Ok(());
            }
            Err(Error::Replay(error)) => {
                self.count_drop(error.code(), "control replay");
                return Ok(());
            }
            Err(_) => {
                self.count_drop(ErrorCode::CcError, "malformed wrapped record");
                return Ok(());
            }
        };

        let record = match ControlRecord::read_cfg(&mut plain.clone(), &self.config.max_record) {
            Ok(record) => record,
            Err(_) => {
                self.count_drop(ErrorCode::CcError, "malformed control record");
                return Ok(());
            }
        };

        // Session-id correlation. The first server reset teaches us the
        // remote id; anything inconsistent afterwards is dropped silently.
        match self.remote_sid {
            None => {
                if record.opcode != Opcode::HardResetServer {
                    self.count_drop(ErrorCode::CcError, "no session established");
                    return Ok(());
                }
                self.remote_sid = Some(record.session_id);
                self.state = State::AuthWait;
                debug!(remote = ?record.session_id, "peer session learned");
            }
            Some(remote) => {
                if record.session_id != remote {
                    self.bus.count(ErrorCode::BadSrcAddr);
                    return Ok(());
                }
            }
        }
        if let Some(claimed) = record.remote_session_id {
            if claimed != self.local_sid {
                self.bus.count(ErrorCode::BadSrcAddr);
                return Ok(());
            }
        }
        self.last_received = Some(self.context.current());

        // Server-initiated renegotiation.
        if record.opcode == Opcode::SoftReset
            && self.pending.is_none()
            && self.chain.inbound_mut(record.key_id).is_none()
        {
            self.start_negotiation(Some(record.key_id), sink).await?;
        }

        // Route to the negotiation owning this key-id.
        let key_id = record.key_id;
        let (mut negotiation, from_pending) = if let Some(negotiation) = self
            .pending
            .take_if(|negotiation| negotiation.key_id == key_id)
        {
            (negotiation, true)
        } else if let Some(negotiation) = self
            .current
            .take_if(|negotiation| negotiation.key_id == key_id)
        {
            (negotiation, false)
        } else {
            self.count_drop(ErrorCode::KeyStateError, "control for unknown key-id");
            return Ok(());
        };

        let installed = match self.drive_negotiation(&mut negotiation, record).await {
            Ok(installed) => installed,
            Err(error) => {
                // A broken negotiation is fatal for the session.
                self.chain.abort_negotiation();
                return Err(error);
            }
        };

        if from_pending {
            if installed {
                // The fresh TLS channel takes over control duties.
                self.current = Some(negotiation);
                self.metrics.negotiations.inc();
                if self.state != State::Active {
                    self.state = State::Active;
                    self.handshake_deadline = None;
                    info!("session active");
                }
            } else {
                self.pending = Some(negotiation);
            }
        } else {
            self.current = Some(negotiation);
        }

        self.flush(sink).await
    }

    /// Feed a control record through a negotiation's reliable layer and TLS
    /// adapter, progressing the key exchange. Returns true once data keys
    /// were installed by this record.
    async fn drive_negotiation(
        &mut self,
        negotiation: &mut Negotiation<T>,
        record: ControlRecord,
    ) -> Result<bool, Error> {
        if !record.acks.is_empty() {
            negotiation.sender.acked(&record.acks);
        }
        if let Some(packet_id) = record.packet_id {
            match negotiation.receiver.receive(packet_id, record.payload) {
                Ok(()) => self.metrics.control_received.inc(),
                Err(Error::ReceiveWindowFull) => {
                    // Drop without ACK; the peer retransmits later.
                    self.count_drop(ErrorCode::TcpOverflow, "reorder buffer full");
                    return Ok(false);
                }
                Err(error) => return Err(error),
            };
        }
        while let Some(payload) = negotiation.receiver.pop() {
            if payload.is_empty() {
                continue;
            }
            negotiation.tls.enqueue_ciphertext(payload)?;
        }

        let mut installed = false;
        let pumped = negotiation.tls.pump()?;
        for record in pumped.ciphertext_out {
            negotiation.outbox.push_back(record);
        }
        if pumped.peer_closed {
            return Err(Error::TlsClosed);
        }
        if pumped.newly_established && !negotiation.km2_sent {
            self.send_key_method_2(negotiation)?;
        }
        for cleartext in pumped.cleartext_in {
            if !negotiation.km2_received {
                self.receive_key_method_2(negotiation, cleartext)?;
                installed = true;
            } else {
                self.handle_control_message(&cleartext)?;
            }
        }

        // Anything the km2 write produced.
        let pumped = negotiation.tls.pump()?;
        for record in pumped.ciphertext_out {
            negotiation.outbox.push_back(record);
        }
        Ok(installed)
    }

    /// Queue our key-method-2 contribution onto the fresh TLS channel.
    fn send_key_method_2(&mut self, negotiation: &mut Negotiation<T>) -> Result<(), Error> {
        let mut context = self.context.clone();
        let randoms = Randoms::generate(Role::Client, &mut context);
        let mut message = KeyMethod2::new(
            Randoms {
                pre_master: randoms.pre_master.clone(),
                random1: randoms.random1,
                random2: randoms.random2,
            },
            self.config.options.clone(),
        )
        .with_peer_info(self.config.peer_info.clone());
        if let Some(credentials) = &self.credentials {
            message = message.with_credentials(
                credentials.username.clone(),
                credentials.password.clone(),
            );
        }
        negotiation.local_randoms = Some(randoms);
        negotiation.km2_sent = true;
        negotiation.tls.queue_cleartext(message.encode().freeze());
        if self.state == State::AuthWait {
            self.state = State::GetConfig;
        }
        debug!(key_id = negotiation.key_id, "key exchange sent");
        Ok(())
    }

    /// Parse the server's key-method-2 reply and install the derived keys.
    fn receive_key_method_2(
        &mut self,
        negotiation: &mut Negotiation<T>,
        cleartext: Bytes,
    ) -> Result<(), Error> {
        let server = KeyMethod2::read_cfg(&mut cleartext.clone(), &Role::Server)
            .map_err(|_| Error::KeyNegotiation("malformed server key exchange"))?;
        let remote_sid = self
            .remote_sid
            .ok_or(Error::KeyNegotiation("no peer session id"))?;
        let local_randoms = negotiation
            .local_randoms
            .as_ref()
            .ok_or(Error::KeyNegotiation("own contribution missing"))?;

        let vault = if self.config.tls_ekm {
            keys::vault_from_exporter(&negotiation.tls.export_seed()?)?
        } else {
            keys::expand_vault(
                local_randoms,
                &server.randoms,
                &self.local_sid,
                &remote_sid,
            )?
        };
        let crypto = keys::derive_context(
            self.config.cipher,
            self.config.auth,
            &vault,
            Role::Client,
            self.config.replay_window,
        );
        let key_id = self.chain.install(crypto, self.context.current())?;
        negotiation.km2_received = true;
        self.peer_identity = negotiation.tls.peer_identity();
        info!(key_id, cipher = self.config.cipher.name(), "data keys installed");
        Ok(())
    }

    /// Steady-state control-channel text messages from the server.
    fn handle_control_message(&mut self, cleartext: &[u8]) -> Result<(), Error> {
        let Ok(text) = std::str::from_utf8(cleartext) else {
            self.count_drop(ErrorCode::CcError, "non-utf8 control message");
            return Ok(());
        };
        let text = text.trim_end_matches('\0').trim();
        if let Some(reason) = text.strip_prefix("HALT") {
            return Err(Error::Halt(reason.trim_start_matches(',').trim().into()));
        }
        if let Some(reason) = text.strip_prefix("RESTART") {
            return Err(Error::Restart(reason.trim_start_matches(',').trim().into()));
        }
        if text.starts_with("AUTH_FAILED") {
            self.bus.push(Event::fatal(ErrorCode::AuthFailed, text));
            self.state = State::Dead;
            return Ok(());
        }
        if let Some(token) = text.strip_prefix("AUTH_TOKEN ") {
            self.session_token = Some(token.trim().to_string());
            debug!("session token updated");
            return Ok(());
        }
        debug!(message = text, "ignored control message");
        Ok(())
    }

    /// Encrypt and emit one egress IP packet.
    async fn handle_egress<Si: Sink>(
        &mut self,
        packet: Bytes,
        sink: &mut Si,
    ) -> Result<(), Error> {
        let now = self.context.current();
        let peer_id = self.config.peer_id;
        let mut context = self.context.clone();
        let outcome = match self.chain.outbound_mut() {
            Some(slot) if !slot.crypto.exhausted() => {
                let key_id = slot.key_id;
                Some(slot.crypto.encrypt(key_id, peer_id, &packet, &mut context))
            }
            Some(_) => None,
            None => {
                self.drop_unavailable();
                return Ok(());
            }
        };
        let record = match outcome {
            Some(Ok(record)) => record,
            // The id space ran out: park the packet and replace the key
            // before sending more.
            Some(Err(Error::PacketIdExhausted)) | None => {
                if self.parked_egress.len() < EGRESS_QUEUE {
                    self.parked_egress.push_back(packet);
                } else {
                    self.drop_unavailable();
                }
                if self.pending.is_none() {
                    self.key_limit_renegotiations += 1;
                    self.start_negotiation(None, sink).await?;
                }
                return Ok(());
            }
            Some(Err(error)) => return Err(error),
        };
        sink.send(record.encode())
            .await
            .map_err(|_| Error::TransportSend)?;
        self.metrics.data_sent.inc();
        self.last_data_sent = now;
        self.last_user_traffic = now;
        Ok(())
    }

    /// Send the keepalive ping over the data channel.
    async fn send_ping<Si: Sink>(&mut self, sink: &mut Si) -> Result<(), Error> {
        let peer_id = self.config.peer_id;
        let mut context = self.context.clone();
        let Some(slot) = self.chain.outbound_mut() else {
            return Ok(());
        };
        if slot.crypto.exhausted() {
            return Ok(());
        }
        let key_id = slot.key_id;
        let record = slot.crypto.encrypt(key_id, peer_id, &data::PING, &mut context)?;
        sink.send(record.encode())
            .await
            .map_err(|_| Error::TransportSend)?;
        self.metrics.pings_sent.inc();
        self.last_data_sent = self.context.current();
        Ok(())
    }

    async fn handle_command<Si: Sink>(&mut self, command: ingress::Message, sink: &mut Si) {
        match command {
            ingress::Message::Stop => self.stop(sink).await,
            ingress::Message::Pause { reason } => {
                if !self.paused {
                    self.paused = true;
                    self.pauses += 1;
                    info!(%reason, "session paused");
                }
            }
            ingress::Message::Resume => {
                if self.paused {
                    self.paused = false;
                    // Timers restart from now.
                    let now = self.context.current();
                    self.last_data_sent = now;
                    self.last_received = Some(now);
                    self.last_user_traffic = now;
                    info!("session resumed");
                }
            }
            ingress::Message::Reconnect { after } => {
                self.reconnect_at = Some(self.context.current() + after);
                info!(?after, "reconnect scheduled");
            }
            ingress::Message::Credentials {
                username,
                password,
                response,
            } => {
                self.credentials = Some(Credentials {
                    username,
                    password,
                    response,
                });
            }
            ingress::Message::Stats { response } => {
                let _ = response.send(self.stats());
            }
            ingress::Message::SessionToken { response } => {
                let _ = response.send(self.session_token.clone());
            }
        }
    }

    /// Idempotent teardown entry: drain what we can, then die.
    async fn stop<Si: Sink>(&mut self, sink: &mut Si) {
        if matches!(self.state, State::Stopping | State::Dead) {
            return;
        }
        self.state = State::Stopping;
        // Best-effort drain of outstanding acknowledgements.
        let _ = self.flush(sink).await;
        self.state = State::Dead;
    }

    async fn handle_tick<Si: Sink>(&mut self, sink: &mut Si) -> Result<(), Error> {
        let now = self.context.current();

        if let Some(at) = self.reconnect_at {
            if now >= at {
                self.restart(sink).await?;
                return Ok(());
            }
        }
        if self.paused {
            return Ok(());
        }

        if let Some(deadline) = self.handshake_deadline {
            if self.state != State::Active && now >= deadline {
                return Err(Error::HandshakeTimeout);
            }
        }

        if self.state == State::Active {
            if let Some(received) = self.last_received {
                if now.duration_since(received).unwrap_or_default()
                    >= self.config.keepalive_timeout
                {
                    self.bus.push(Event::fatal(
                        ErrorCode::KeepaliveTimeout,
                        "no traffic from peer",
                    ));
                    self.state = State::Dead;
                    return Ok(());
                }
            }
            if let Some(limit) = self.config.inactive {
                if now.duration_since(self.last_user_traffic).unwrap_or_default() >= limit {
                    self.bus.push(Event::fatal(
                        ErrorCode::InactiveTimeout,
                        "no user traffic",
                    ));
                    self.state = State::Dead;
                    return Ok(());
                }
            }
            if now.duration_since(self.last_data_sent).unwrap_or_default()
                >= self.config.keepalive_ping
            {
                self.send_ping(sink).await?;
            }
            // A primary that outlives two renegotiation intervals means the
            // replacement never arrived.
            if let Some(installed) = self.chain.primary_installed_at() {
                if now.duration_since(installed).unwrap_or_default()
                    >= self.limits.interval * 2
                {
                    self.bus.push(Event::fatal(
                        ErrorCode::PrimaryExpire,
                        "primary key expired before replacement",
                    ));
                    self.state = State::Dead;
                    return Ok(());
                }
            }
            if self.pending.is_none() && self.chain.reneg_due(now, &self.limits) {
                self.start_negotiation(None, sink).await?;
            }
        }

        for key_id in self.chain.retire(now) {
            debug!(key_id, "expired key retired");
        }

        self.flush(sink).await
    }

    /// Tear down and restart a fresh session over the same transport.
    async fn restart<Si: Sink>(&mut self, sink: &mut Si) -> Result<(), Error> {
        info!("reconnecting");
        self.reconnect_at = None;
        self.reconnects += 1;
        self.chain.clear();
        self.current = None;
        self.pending = None;
        self.parked_egress.clear();
        self.renegotiating = false;
        self.remote_sid = None;
        self.session_token = None;
        let mut context = self.context.clone();
        self.local_sid = SessionId::random(&mut context);
        let now = self.context.current();
        self.handshake_deadline = Some(now + self.config.handshake_timeout);
        self.last_data_sent = now;
        self.last_received = None;
        self.last_user_traffic = now;
        self.state = State::ResetSent;
        self.start_negotiation(None, sink).await
    }

    /// Earliest deadline any timer cares about.
    fn next_deadline(&self) -> SystemTime {
        let now = self.context.current();
        let mut deadline: Option<SystemTime> = self.reconnect_at;
        let mut consider = |candidate: Option<SystemTime>| {
            if let Some(candidate) = candidate {
                deadline = Some(match deadline {
                    Some(current) => current.min(candidate),
                    None => candidate,
                });
            }
        };

        if !self.paused {
            if self.state != State::Active {
                consider(self.handshake_deadline);
            }
            consider(self.pending.as_ref().and_then(|n| n.sender.next_deadline()));
            consider(self.current.as_ref().and_then(|n| n.sender.next_deadline()));
            if self.state == State::Active {
                consider(Some(self.last_data_sent + self.config.keepalive_ping));
                consider(
                    self.last_received
                        .map(|received| received + self.config.keepalive_timeout),
                );
                consider(
                    self.config
                        .inactive
                        .map(|limit| self.last_user_traffic + limit),
                );
                if let Some(installed) = self.chain.primary_installed_at() {
                    if self.pending.is_none() {
                        consider(Some(installed + self.limits.interval));
                    }
                    consider(Some(installed + self.limits.interval * 2));
                }
            }
            consider(self.chain.next_retirement());
        }
        deadline.unwrap_or(now + Duration::from_secs(3600))
    }

    fn stats(&self) -> Stats {
        Stats {
            state: self.state,
            renegotiating: self.renegotiating,
            paused: self.paused,
            control_sent: self.metrics.control_sent.get(),
            control_received: self.metrics.control_received.get(),
            retransmits: self.metrics.retransmits.get(),
            data_sent: self.metrics.data_sent.get(),
            data_received: self.metrics.data_received.get(),
            pings_sent: self.metrics.pings_sent.get(),
            drops_replay: self.bus.occurrences(ErrorCode::PktidReplay),
            drops_hmac: self.bus.occurrences(ErrorCode::HmacError)
                + self.bus.occurrences(ErrorCode::TlsAuthFail),
            drops_decrypt: self.bus.occurrences(ErrorCode::DecryptError),
            drops_key_state: self.bus.occurrences(ErrorCode::KeyStateError),
            negotiations: self.metrics.negotiations.get(),
            pauses: self.pauses,
            reconnects: self.reconnects,
            key_limit_renegotiations: self.key_limit_renegotiations,
            slots: self.chain.states(),
            session_token: self.session_token.clone(),
            peer_identity: self.peer_identity.clone(),
            last_received: self.last_received,
        }
    }

    /// Count a suppressed per-packet drop.
    fn count_drop(&mut self, code: ErrorCode, cause: &'static str) {
        self.bus.count(code);
        self.metrics
            .drops
            .get_or_create(&metrics::DropCause::new(cause))
            .inc();
    }

    /// Count a data-channel crypto drop; breach the threshold and the
    /// session dies.
    fn count_crypto_drop(&mut self, error: Error) {
        let code = error.code();
        let cause = match code {
            ErrorCode::HmacError => "hmac",
            ErrorCode::DecryptError => "decrypt",
            ErrorCode::CcError => "malformed",
            _ => "replay",
        };
        self.count_drop(code, cause);
        let occurrences = self.bus.occurrences(code);
        if occurrences == CRYPTO_DROP_THRESHOLD
            && matches!(code, ErrorCode::HmacError | ErrorCode::DecryptError)
        {
            self.bus.push(Event::fatal(code, "drop threshold breached"));
            self.state = State::Dead;
        }
    }

    fn drop_unavailable(&mut self) {
        self.dropped_egress += 1;
        self.bus.count(ErrorCode::NetworkUnavailable);
        if self.dropped_egress == UNAVAILABLE_THRESHOLD {
            self.bus.push(Event::non_fatal(
                ErrorCode::NetworkUnavailable,
                "no usable data-channel key",
            ));
        }
    }

    /// Emit the fatal event and seal the session.
    fn fail(&mut self, error: Error) {
        if self.state == State::Dead {
            return;
        }
        warn!(%error, "session failed");
        self.bus
            .push(Event::fatal(error.code(), error.to_string()));
        self.state = State::Dead;
    }

    fn teardown(&mut self) {
        // Key material is overwritten as the slots drop.
        self.chain.clear();
        self.current = None;
        self.pending = None;
        self.parked_egress.clear();
        self.state = State::Dead;
        info!("session closed");
    }
}
