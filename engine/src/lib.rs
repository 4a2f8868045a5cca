//! An OpenVPN client protocol engine.
//!
//! This crate implements the data/control channel core of an OpenVPN client:
//! the reliable control-channel transport carrying an embedded TLS handshake,
//! the data-channel encryption pipeline with anti-replay, and the key
//! negotiation state machine that provisions and rotates data-channel keys.
//!
//! Everything around it is a host concern with a clean seam: sockets are
//! [commonware_runtime::Sink]/[commonware_runtime::Stream] pairs, the TLS
//! library is a streaming oracle behind [tls::Engine], and tun devices sit on
//! the other side of the [session::TunHandle] plumbing.
//!
//! # Example
//!
//! ```ignore
//! use commonware_runtime::{deterministic, Runner};
//! use ovpn_engine::{session, tls};
//!
//! let executor = deterministic::Runner::default();
//! executor.start(|context| async move {
//!     let config = session::Config::default();
//!     let (session, mut mailbox, mut events, tun) =
//!         session::Session::new(context, config, || my_tls_engine()).unwrap();
//!     session.start(sink, stream);
//!     // ... feed tun.sender, read tun.receiver, watch events ...
//!     mailbox.stop().await;
//! });
//! ```

pub mod crypto;
pub mod data;
pub mod error;
pub mod keys;
pub mod metrics;
pub mod packet_id;
pub mod reliable;
pub mod session;
pub mod static_key;
pub mod tls;
pub mod types;
pub mod wrap;

pub use error::{Error, ErrorCode, Event};
pub use session::{Config, Mailbox, Session, State, Stats, TunHandle};
pub use types::SessionId;
