//! Mixclient
//!
//! Node-side engine of a peer-to-peer coin mixing protocol. Wallets advertise outputs they
//! want mixed as pair requests; nodes holding compatible requests deterministically group
//! them into a session and run a multi-phase protocol over it. A run that cannot finish
//! ends in a blame verdict, and the session is retried without the blamed peers until it
//! completes or too few remain.
//!
//! ## Overview
//!
//! Every run walks the same phases in a fixed order:
//!
//! ```text
//! PairRequest -> KeyExchange -> Ciphertext -> SlotReservation -> DcExchange -> Confirmation -> Done
//! ```
//!
//! Each phase has a deadline measured from the start of the run. A phase that is still
//! incomplete at its deadline blames the run; so does a malformed, duplicate or
//! out-of-order message once the phase can no longer complete cleanly.
//!
//! ## Key Components
//!
//! - **Expiry**: how long a pair request stays eligible, in blocks
//! - **SessionRun**: the phase state machine of one epoch
//! - **BlameAssigner**: which peers a failed epoch is attributed to
//! - **PairedSessions**: the request pool, session formation and the output lock set
//! - **Client**: drives runs concurrently and reports outcomes to the wallet
//!
//! The cryptography of the mix is supplied by a [`MixCrypto`] implementation and the
//! network by a [`PeerNotifier`]; the engine treats both as opaque.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use mixclient::{
//!     ChainParams, Client, Denomination, DigestCrypto, MemoryRelay, MixConfig, NoopObserver,
//!     OutputCommitment, PairRequest, PeerId, PhaseBudgets,
//! };
//!
//! # async fn run() -> Result<(), mixclient::MixError> {
//! let config = MixConfig::new(
//!     3,
//!     PhaseBudgets::uniform(Duration::from_secs(30)),
//!     ChainParams::new(Duration::from_secs(150)),
//! );
//! let relay = MemoryRelay::new();
//! let local = PeerId([1; 32]);
//! let (handle, inbound) = relay.connect(local);
//! let (client, mut outcomes) = Client::new(
//!     local,
//!     config,
//!     Arc::new(DigestCrypto),
//!     Arc::new(handle),
//!     Arc::new(NoopObserver),
//! )?;
//! client.attach(inbound);
//! client.set_tip(800_000).await;
//!
//! let expiry = client.max_expiry().await;
//! let request = PairRequest::new(
//!     local,
//!     vec![OutputCommitment([7; 32])],
//!     Denomination(100_000),
//!     expiry,
//! )?;
//! client.submit(request).await?;
//! client.spawn_pairing_loop();
//!
//! if let Some(outcome) = outcomes.recv().await {
//!     println!("{:?}", outcome);
//! }
//! # Ok(())
//! # }
//! ```

pub mod blame;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod expiry;
pub mod hooks;
pub mod message;
pub mod notifier;
pub mod paired;
pub mod peer;
pub mod phase;
pub mod relay;
pub mod run;
pub mod types;

pub use blame::{BlameAssigner, BlameReason, BlameVerdict};
pub use client::{Client, FailureReason, MixOutcome};
pub use config::MixConfig;
pub use crypto::{DeriveFault, DigestCrypto, MixCrypto, PhaseOutput, RunContext, TxCandidate};
pub use error::{MixError, PeerFault};
pub use expiry::{is_expired, max_expiry, ChainParams, PAIR_REQUEST_WINDOW};
pub use hooks::{HookAction, HookPoint, NoopObserver, RunObserver};
pub use message::{MixMessage, PairRequest, PhaseMessage};
pub use notifier::{ChannelNotifier, PeerNotifier};
pub use paired::{FormedSession, NextRun, PairedSessions, Session};
pub use phase::{Phase, PhaseBudgets, RunState};
pub use relay::{MemoryRelay, RelayHandle};
pub use run::{RunFailure, SessionRun, Submission};
pub use types::{Denomination, OutputCommitment, PairRequestId, PeerId, SessionId};
