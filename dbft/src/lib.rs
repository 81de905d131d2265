//! dBFT consensus engine with an anti-MEV pre-commit extension.
//!
//! This crate implements delegated Byzantine Fault Tolerance: a fixed set of
//! N validators, of which at most F = (N - 1) / 3 may be faulty, agrees on
//! one block per height with single-block finality. Each height proceeds in
//! views; every view has one primary chosen round-robin.
//!
//! 1. **Prepare**: the primary broadcasts a PrepareRequest naming the
//!    block's transactions; backups answer with PrepareResponses.
//! 2. **PreCommit** (anti-MEV extension only): on M = N - F preparations,
//!    validators exchange PreCommits carrying data for a pre-block.
//! 3. **Commit**: validators sign the final header; M Commits accept the
//!    block.
//! 4. **ChangeView**: on timeout, validators ask to move to the next view;
//!    M requests for a view switch to it.
//!
//! RecoveryRequest and RecoveryMessage let a lagging validator catch up
//! with what its peers have seen.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                    Dbft                      │
//! │  ┌─────────┐  ┌──────────┐  ┌─────────────┐  │
//! │  │ Config  │  │ Message  │  │  Evidence   │  │
//! │  │         │  │  Cache   │  │  Collector  │  │
//! │  └─────────┘  └──────────┘  └─────────────┘  │
//! │  ┌──────────────────────────────────────┐    │
//! │  │              Context                 │    │
//! │  │  height, view, slots, proposal, block│    │
//! │  └──────────────────────────────────────┘    │
//! │  ┌──────────┐  ┌───────┐  ┌──────────────┐   │
//! │  │   Host   │  │ Timer │  │ PreBlockHooks│   │
//! │  └──────────┘  └───────┘  └──────────────┘   │
//! └──────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod host;
pub mod message;
pub mod proposer;
pub mod quorum;
pub mod recovery;
pub mod rtt;
pub mod service;
#[cfg(any(test, feature = "dev-context-only-utils"))]
pub mod testing;
pub mod timer;
pub mod types;

// Re-exports for convenience
pub use config::{ConfigError, DbftConfig};
pub use context::Context;
pub use engine::{Dbft, DbftBuilder};
pub use error::{Error, HostError};
pub use evidence::{EquivocationEvidence, EvidenceCollector, EvidenceKind};
pub use host::{Host, PreBlockHooks};
pub use message::{ChangeViewReason, ConsensusPayload, Message, MessageType};
pub use recovery::RecoveryMessage;
pub use service::{ConsensusService, ServiceChannels};
pub use timer::{ChannelTimer, Timer};
pub use types::{Block, ConsensusHash, HeightView, PreBlock, Transaction};
