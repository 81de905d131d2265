//! Callbacks the engine uses to reach the rest of the node.
//!
//! Networking, the transaction pool, block construction and signing live
//! outside the engine. Every callback is synchronous and must not block for
//! long, since the engine calls them while handling an event.

use {
    crate::{
        context::Context,
        error::HostError,
        message::ConsensusPayload,
        types::{Block, ConsensusHash, PreBlock, Transaction},
    },
    std::fmt,
};

pub trait Host: Sized {
    type Hash: ConsensusHash;
    type PublicKey: Clone + Eq + fmt::Debug;
    type PrivateKey;
    type Transaction: Transaction<Self::Hash>;
    type Block: Block<Self::Hash, Self::Transaction>;
    type PreBlock: PreBlock<Self::Transaction>;

    /// Height of the last accepted block.
    fn current_height(&self) -> u32;

    /// Hash of the last accepted block.
    fn current_block_hash(&self) -> Self::Hash;

    /// Validators for the next block. With `Some(txs)`, the validators
    /// resulting from applying `txs` (used for the next-consensus check).
    /// An empty list is a fatal misconfiguration.
    fn get_validators(&self, txs: Option<&[Self::Transaction]>) -> Vec<Self::PublicKey>;

    /// This node's position in `validators` and its key pair, or `None` for a
    /// non-validator.
    fn get_key_pair(
        &self,
        validators: &[Self::PublicKey],
    ) -> Option<(usize, Self::PrivateKey, Self::PublicKey)>;

    /// Forces watch-only mode even when this node holds a validator key.
    fn watch_only(&self) -> bool {
        false
    }

    /// Looks a transaction up in the pool.
    fn get_tx(&self, hash: &Self::Hash) -> Option<Self::Transaction>;

    /// Verified transactions for a new proposal.
    fn get_verified(&self) -> Vec<Self::Transaction>;

    /// Asks peers for transactions this node is missing.
    fn request_tx(&mut self, hashes: &[Self::Hash]);

    /// Starts forwarding newly arrived transactions to the engine while the
    /// primary waits for a non-empty block.
    fn subscribe_for_txs(&mut self) {}

    /// Ends a subscription started with `subscribe_for_txs`.
    fn stop_tx_flow(&mut self) {}

    /// Looks up an accepted block. Not used by the state machine.
    fn get_block(&self, _hash: &Self::Hash) -> Option<Self::Block> {
        None
    }

    /// Next-consensus address for a validator list.
    fn consensus_address(&self, validators: &[Self::PublicKey]) -> Self::Hash;

    /// Payload identity: covers type, height, view and body, but not the
    /// validator index.
    fn payload_hash(&self, payload: &ConsensusPayload<Self::Hash>) -> Self::Hash;

    /// Builds a block header (no transactions attached) from the context.
    fn new_block(&self, context: &Context<Self>) -> Self::Block;

    fn sign_block(&self, block: &Self::Block, key: &Self::PrivateKey) -> Result<Vec<u8>, HostError>;

    fn verify_block_signature(
        &self,
        block: &Self::Block,
        key: &Self::PublicKey,
        signature: &[u8],
    ) -> bool;

    /// Semantic check of a proposed block with all transactions attached.
    fn verify_block(&self, _block: &Self::Block) -> bool {
        true
    }

    fn verify_prepare_request(
        &self,
        _payload: &ConsensusPayload<Self::Hash>,
    ) -> Result<(), HostError> {
        Ok(())
    }

    fn verify_prepare_response(
        &self,
        _payload: &ConsensusPayload<Self::Hash>,
    ) -> Result<(), HostError> {
        Ok(())
    }

    fn verify_pre_commit(&self, _payload: &ConsensusPayload<Self::Hash>) -> Result<(), HostError> {
        Ok(())
    }

    fn verify_commit(&self, _payload: &ConsensusPayload<Self::Hash>) -> Result<(), HostError> {
        Ok(())
    }

    /// Sends a payload to every peer.
    fn broadcast(&mut self, payload: ConsensusPayload<Self::Hash>);

    /// Persists an accepted block. A failure stops the engine unless the
    /// anti-MEV extension is active for the block, in which case processing
    /// is retried on the next Commit.
    fn process_block(&mut self, block: &Self::Block) -> Result<(), HostError>;
}

/// Callbacks of the anti-MEV pre-commit phase. Supplied exactly when the
/// extension is enabled in the configuration.
pub trait PreBlockHooks<A: Host> {
    /// Builds a pre-block header (no transactions attached) from the context.
    fn new_pre_block(&self, context: &Context<A>) -> A::PreBlock;

    /// Data this node contributes in its PreCommit.
    fn pre_commit_data(
        &self,
        pre_header: &A::PreBlock,
        key: &A::PrivateKey,
    ) -> Result<Vec<u8>, HostError>;

    fn verify_pre_commit_data(&self, pre_header: &A::PreBlock, key: &A::PublicKey, data: &[u8])
        -> bool;

    /// Semantic check of a proposed pre-block with all transactions attached.
    fn verify_pre_block(&self, _pre_block: &A::PreBlock) -> bool {
        true
    }

    /// Consumes a pre-block once a PreCommit quorum exists. An error means
    /// the collected PreCommit data is not sufficient yet; the call is
    /// repeated on the next PreCommit.
    fn process_pre_block(
        &mut self,
        pre_block: &A::PreBlock,
        context: &Context<A>,
    ) -> Result<(), HostError>;
}
