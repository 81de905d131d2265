//! In-memory host, hooks, timer and network for exercising the engine
//! without a node around it.

use {
    crate::{
        config::DbftConfig,
        context::Context,
        engine::Dbft,
        error::{Error, HostError},
        host::{Host, PreBlockHooks},
        message::{ConsensusPayload, Message},
        timer::Timer,
        types::{Block, HeightView, PreBlock, Transaction},
    },
    crossbeam_channel::Sender,
    parking_lot::Mutex,
    solana_hash::Hash,
    solana_keypair::Keypair,
    solana_pubkey::Pubkey,
    solana_sha256_hasher::{hash, hashv},
    solana_signature::Signature,
    solana_signer::Signer,
    std::{
        collections::{HashMap, HashSet},
        sync::Arc,
        time::{Duration, SystemTime, UNIX_EPOCH},
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestTransaction {
    pub hash: Hash,
    pub data: Vec<u8>,
}

impl TestTransaction {
    pub fn new(data: &[u8]) -> Self {
        Self {
            hash: hash(data),
            data: data.to_vec(),
        }
    }
}

impl Transaction<Hash> for TestTransaction {
    fn hash(&self) -> Hash {
        self.hash
    }
}

/// Block whose hash covers the header fields but not the attached
/// transaction bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestBlock {
    pub index: u32,
    pub timestamp: u64,
    pub prev_hash: Hash,
    pub nonce: u64,
    pub next_consensus: Hash,
    pub transaction_hashes: Vec<Hash>,
    /// Digest of the processed pre-block, when the block follows one.
    pub pre_block_digest: Option<Hash>,
    pub transactions: Vec<TestTransaction>,
    hash: Hash,
}

impl TestBlock {
    pub fn from_context(context: &Context<TestHost>) -> Self {
        let transaction_hashes = context.transaction_hashes.clone().unwrap_or_default();
        let pre_block_digest = context.pre_block.as_ref().map(|pre_block| pre_block.digest);
        let mut block = Self {
            index: context.block_index,
            timestamp: context.timestamp,
            prev_hash: context.prev_hash.unwrap_or_default(),
            nonce: context.nonce,
            next_consensus: context.next_consensus.unwrap_or_default(),
            transaction_hashes,
            pre_block_digest,
            transactions: Vec::new(),
            hash: Hash::default(),
        };
        block.hash = block.compute_hash();
        block
    }

    fn compute_hash(&self) -> Hash {
        let index = self.index.to_le_bytes();
        let timestamp = self.timestamp.to_le_bytes();
        let nonce = self.nonce.to_le_bytes();
        let digest = self.pre_block_digest.unwrap_or_default();
        let mut parts: Vec<&[u8]> = vec![
            b"block".as_slice(),
            index.as_slice(),
            timestamp.as_slice(),
            self.prev_hash.as_ref(),
            nonce.as_slice(),
            self.next_consensus.as_ref(),
            digest.as_ref(),
        ];
        parts.extend(self.transaction_hashes.iter().map(|h| h.as_ref()));
        hashv(&parts)
    }
}

impl Block<Hash, TestTransaction> for TestBlock {
    fn hash(&self) -> Hash {
        self.hash
    }

    fn index(&self) -> u32 {
        self.index
    }

    fn timestamp(&self) -> u64 {
        self.timestamp
    }

    fn transactions(&self) -> &[TestTransaction] {
        &self.transactions
    }

    fn set_transactions(&mut self, txs: Vec<TestTransaction>) {
        self.transactions = txs;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestPreBlock {
    pub index: u32,
    pub digest: Hash,
    pub transactions: Vec<TestTransaction>,
}

impl TestPreBlock {
    pub fn from_context(context: &Context<TestHost>) -> Self {
        let index = context.block_index.to_le_bytes();
        let timestamp = context.timestamp.to_le_bytes();
        let nonce = context.nonce.to_le_bytes();
        let prev_hash = context.prev_hash.unwrap_or_default();
        let mut parts: Vec<&[u8]> = vec![
            b"pre-block".as_slice(),
            index.as_slice(),
            timestamp.as_slice(),
            nonce.as_slice(),
            prev_hash.as_ref(),
        ];
        parts.extend(
            context
                .transaction_hashes
                .iter()
                .flatten()
                .map(|h| h.as_ref()),
        );
        Self {
            index: context.block_index,
            digest: hashv(&parts),
            transactions: Vec::new(),
        }
    }
}

impl PreBlock<TestTransaction> for TestPreBlock {
    fn set_transactions(&mut self, txs: Vec<TestTransaction>) {
        self.transactions = txs;
    }
}

/// Host backed by plain collections. Everything the engine sends or asks
/// for is recorded for inspection.
pub struct TestHost {
    pub validators: Vec<Pubkey>,
    /// Validators reported when transactions are supplied, e.g. to simulate
    /// a proposal that changes the validator set.
    pub next_validators: Option<Vec<Pubkey>>,
    pub keypair: Option<Arc<Keypair>>,
    pub height: u32,
    pub block_hash: Hash,
    /// Transactions known to the pool.
    pub pool: HashMap<Hash, TestTransaction>,
    /// Transactions offered for new proposals.
    pub verified: Vec<TestTransaction>,
    pub outbox: Vec<ConsensusPayload<Hash>>,
    pub requested: Vec<Hash>,
    pub processed: Vec<TestBlock>,
    pub subscribed: bool,
    pub watch_only: bool,
    pub reject_blocks: bool,
    pub fail_process_block: bool,
    pub block_notifier: Option<Sender<TestBlock>>,
}

impl TestHost {
    pub fn new(validators: Vec<Pubkey>, keypair: Option<Arc<Keypair>>) -> Self {
        Self {
            validators,
            next_validators: None,
            keypair,
            height: 0,
            block_hash: Hash::default(),
            pool: HashMap::new(),
            verified: Vec::new(),
            outbox: Vec::new(),
            requested: Vec::new(),
            processed: Vec::new(),
            subscribed: false,
            watch_only: false,
            reject_blocks: false,
            fail_process_block: false,
            block_notifier: None,
        }
    }

    /// Adds `tx` to the pool and to the verified set.
    pub fn add_transaction(&mut self, tx: TestTransaction) {
        self.pool.insert(tx.hash, tx.clone());
        self.verified.push(tx);
    }

    /// Payloads broadcast so far that carry a message of `kind`.
    pub fn sent<'a>(
        &'a self,
        kind: crate::message::MessageType,
    ) -> impl Iterator<Item = &'a ConsensusPayload<Hash>> + 'a {
        self.outbox.iter().filter(move |p| p.message_type() == kind)
    }
}

/// Canonical byte encoding of a payload without its validator index.
pub fn encode_payload(payload: &ConsensusPayload<Hash>) -> Vec<u8> {
    fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
        buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(bytes);
    }

    let mut buf = vec![payload.message_type() as u8];
    buf.extend_from_slice(&payload.height.to_le_bytes());
    buf.push(payload.view_number);
    match &payload.message {
        Message::ChangeView(cv) => {
            buf.push(cv.new_view_number);
            buf.extend_from_slice(&cv.timestamp.to_le_bytes());
            buf.push(cv.reason as u8);
        }
        Message::PrepareRequest(request) => {
            buf.extend_from_slice(&request.timestamp.to_le_bytes());
            buf.extend_from_slice(&request.nonce.to_le_bytes());
            buf.extend_from_slice(request.next_consensus.as_ref());
            buf.extend_from_slice(&(request.transaction_hashes.len() as u32).to_le_bytes());
            for hash in &request.transaction_hashes {
                buf.extend_from_slice(hash.as_ref());
            }
        }
        Message::PrepareResponse(response) => {
            buf.extend_from_slice(response.preparation_hash.as_ref());
        }
        Message::PreCommit(pre_commit) => put_bytes(&mut buf, &pre_commit.data),
        Message::Commit(commit) => put_bytes(&mut buf, &commit.signature),
        Message::RecoveryRequest(request) => {
            buf.extend_from_slice(&request.timestamp.to_le_bytes());
        }
        Message::RecoveryMessage(recovery) => {
            for cv in &recovery.change_views {
                buf.extend_from_slice(&cv.validator_index.to_le_bytes());
                buf.push(cv.original_view_number);
                buf.extend_from_slice(&cv.timestamp.to_le_bytes());
            }
            if let Some(hash) = &recovery.preparation_hash {
                buf.extend_from_slice(hash.as_ref());
            }
            for preparation in &recovery.preparations {
                buf.extend_from_slice(&preparation.validator_index.to_le_bytes());
            }
            for pre_commit in &recovery.pre_commits {
                buf.extend_from_slice(&pre_commit.validator_index.to_le_bytes());
                put_bytes(&mut buf, &pre_commit.data);
            }
            for commit in &recovery.commits {
                buf.extend_from_slice(&commit.validator_index.to_le_bytes());
                put_bytes(&mut buf, &commit.signature);
            }
        }
    }
    buf
}

fn verify_signature(key: &Pubkey, message: &[u8], signature: &[u8]) -> bool {
    <[u8; 64]>::try_from(signature)
        .map(Signature::from)
        .is_ok_and(|signature| signature.verify(key.as_ref(), message))
}

impl Host for TestHost {
    type Hash = Hash;
    type PublicKey = Pubkey;
    type PrivateKey = Arc<Keypair>;
    type Transaction = TestTransaction;
    type Block = TestBlock;
    type PreBlock = TestPreBlock;

    fn current_height(&self) -> u32 {
        self.height
    }

    fn current_block_hash(&self) -> Hash {
        self.block_hash
    }

    fn get_validators(&self, txs: Option<&[TestTransaction]>) -> Vec<Pubkey> {
        match (&self.next_validators, txs) {
            (Some(next), Some(_)) => next.clone(),
            _ => self.validators.clone(),
        }
    }

    fn get_key_pair(&self, validators: &[Pubkey]) -> Option<(usize, Arc<Keypair>, Pubkey)> {
        let keypair = self.keypair.as_ref()?;
        let pubkey = keypair.pubkey();
        let index = validators.iter().position(|v| *v == pubkey)?;
        Some((index, keypair.clone(), pubkey))
    }

    fn watch_only(&self) -> bool {
        self.watch_only
    }

    fn get_tx(&self, hash: &Hash) -> Option<TestTransaction> {
        self.pool.get(hash).cloned()
    }

    fn get_verified(&self) -> Vec<TestTransaction> {
        self.verified.clone()
    }

    fn request_tx(&mut self, hashes: &[Hash]) {
        self.requested.extend_from_slice(hashes);
    }

    fn subscribe_for_txs(&mut self) {
        self.subscribed = true;
    }

    fn stop_tx_flow(&mut self) {
        self.subscribed = false;
    }

    fn get_block(&self, hash: &Hash) -> Option<TestBlock> {
        self.processed.iter().find(|b| b.hash == *hash).cloned()
    }

    fn consensus_address(&self, validators: &[Pubkey]) -> Hash {
        let keys: Vec<&[u8]> = validators.iter().map(|v| v.as_ref()).collect();
        hashv(&keys)
    }

    fn payload_hash(&self, payload: &ConsensusPayload<Hash>) -> Hash {
        hash(&encode_payload(payload))
    }

    fn new_block(&self, context: &Context<Self>) -> TestBlock {
        TestBlock::from_context(context)
    }

    fn sign_block(&self, block: &TestBlock, key: &Arc<Keypair>) -> Result<Vec<u8>, HostError> {
        Ok(key.sign_message(block.hash.as_ref()).as_ref().to_vec())
    }

    fn verify_block_signature(&self, block: &TestBlock, key: &Pubkey, signature: &[u8]) -> bool {
        verify_signature(key, block.hash.as_ref(), signature)
    }

    fn verify_block(&self, _block: &TestBlock) -> bool {
        !self.reject_blocks
    }

    fn broadcast(&mut self, payload: ConsensusPayload<Hash>) {
        self.outbox.push(payload);
    }

    fn process_block(&mut self, block: &TestBlock) -> Result<(), HostError> {
        if self.fail_process_block {
            return Err(format!("cannot persist block {}", block.index).into());
        }
        self.height = block.index;
        self.block_hash = block.hash;
        self.processed.push(block.clone());
        if let Some(notifier) = &self.block_notifier {
            let _ = notifier.send(block.clone());
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct PreBlockHookState {
    /// Number of upcoming `process_pre_block` calls that fail.
    pub failures_left: usize,
    pub reject_pre_blocks: bool,
    pub processed: Vec<TestPreBlock>,
}

/// Pre-commit hooks signing the pre-block digest. State is shared so a
/// test keeps a handle after moving the hooks into the engine.
#[derive(Debug, Clone, Default)]
pub struct TestPreBlockHooks {
    pub state: Arc<Mutex<PreBlockHookState>>,
}

impl PreBlockHooks<TestHost> for TestPreBlockHooks {
    fn new_pre_block(&self, context: &Context<TestHost>) -> TestPreBlock {
        TestPreBlock::from_context(context)
    }

    fn pre_commit_data(
        &self,
        pre_header: &TestPreBlock,
        key: &Arc<Keypair>,
    ) -> Result<Vec<u8>, HostError> {
        Ok(key.sign_message(pre_header.digest.as_ref()).as_ref().to_vec())
    }

    fn verify_pre_commit_data(&self, pre_header: &TestPreBlock, key: &Pubkey, data: &[u8]) -> bool {
        verify_signature(key, pre_header.digest.as_ref(), data)
    }

    fn verify_pre_block(&self, _pre_block: &TestPreBlock) -> bool {
        !self.state.lock().reject_pre_blocks
    }

    fn process_pre_block(
        &mut self,
        pre_block: &TestPreBlock,
        _context: &Context<TestHost>,
    ) -> Result<(), HostError> {
        let mut state = self.state.lock();
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err("not enough pre-commit data".into());
        }
        state.processed.push(pre_block.clone());
        Ok(())
    }
}

/// Timer driven by the test: time only moves through `advance` and `fire`.
#[derive(Debug, Clone)]
pub struct ManualTimer {
    now: SystemTime,
    hv: HeightView,
    started: SystemTime,
    delay: Duration,
    armed: bool,
}

impl ManualTimer {
    pub fn new() -> Self {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        Self {
            now,
            hv: HeightView::default(),
            started: now,
            delay: Duration::ZERO,
            armed: false,
        }
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Delay of the pending firing as last set or extended.
    pub fn delay(&self) -> Option<Duration> {
        self.armed.then_some(self.delay)
    }

    /// Moves the clock to the pending deadline and returns the firing tag.
    pub fn fire(&mut self) -> Option<HeightView> {
        if !self.armed {
            return None;
        }
        if let Some(deadline) = self.started.checked_add(self.delay) {
            if deadline > self.now {
                self.now = deadline;
            }
        }
        self.armed = false;
        Some(self.hv)
    }
}

impl Default for ManualTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for ManualTimer {
    fn now(&self) -> SystemTime {
        self.now
    }

    fn reset(&mut self, hv: HeightView, delay: Duration) {
        self.hv = hv;
        self.started = self.now;
        self.delay = delay;
        self.armed = true;
    }

    fn extend(&mut self, delay: Duration) {
        if self.armed {
            self.delay = self.delay.saturating_add(delay);
        }
    }

    fn stop(&mut self) {
        self.armed = false;
    }

    fn height_view(&self) -> HeightView {
        self.hv
    }
}

pub type TestNode = Dbft<TestHost, ManualTimer>;

/// A set of engines exchanging payloads through their hosts' outboxes.
pub struct TestNetwork {
    pub nodes: Vec<TestNode>,
    pub keypairs: Vec<Arc<Keypair>>,
    pub hooks: Vec<TestPreBlockHooks>,
    /// Nodes that neither send nor receive.
    pub offline: HashSet<usize>,
}

impl TestNetwork {
    pub fn new(n: usize, config: DbftConfig) -> Self {
        let keypairs: Vec<_> = (0..n).map(|_| Arc::new(Keypair::new())).collect();
        let validators: Vec<_> = keypairs.iter().map(|k| k.pubkey()).collect();
        let anti_mev = config.anti_mev_extension_enabling_height >= 0;
        let mut hooks = Vec::new();
        let nodes = keypairs
            .iter()
            .map(|keypair| {
                let host = TestHost::new(validators.clone(), Some(keypair.clone()));
                let builder = Dbft::builder(config.clone(), host, ManualTimer::new());
                let builder = if anti_mev {
                    let node_hooks = TestPreBlockHooks::default();
                    hooks.push(node_hooks.clone());
                    builder.pre_block_hooks(node_hooks)
                } else {
                    builder
                };
                builder.build().unwrap()
            })
            .collect();
        Self {
            nodes,
            keypairs,
            hooks,
            offline: HashSet::new(),
        }
    }

    pub fn validators(&self) -> Vec<Pubkey> {
        self.keypairs.iter().map(|k| k.pubkey()).collect()
    }

    pub fn primary(&self) -> usize {
        self.nodes[0].context().primary_index
    }

    /// Offers `tx` to every node's pool.
    pub fn add_transaction(&mut self, tx: TestTransaction) {
        for node in &mut self.nodes {
            node.host_mut().add_transaction(tx.clone());
        }
    }

    pub fn start_all(&mut self) -> Result<(), Error> {
        for (index, node) in self.nodes.iter_mut().enumerate() {
            if !self.offline.contains(&index) {
                node.start(0)?;
            }
        }
        Ok(())
    }

    /// Drains every outbox, dropping payloads from offline nodes.
    pub fn take_pending(&mut self) -> Vec<(usize, ConsensusPayload<Hash>)> {
        let mut pending = Vec::new();
        for (index, node) in self.nodes.iter_mut().enumerate() {
            let outbox = std::mem::take(&mut node.host_mut().outbox);
            if !self.offline.contains(&index) {
                pending.extend(outbox.into_iter().map(|p| (index, p)));
            }
        }
        pending
    }

    /// Delivers `payload` from `from` to every other online node.
    pub fn deliver(&mut self, from: usize, payload: &ConsensusPayload<Hash>) -> Result<(), Error> {
        for (index, node) in self.nodes.iter_mut().enumerate() {
            if index != from && !self.offline.contains(&index) {
                node.on_receive(payload.clone())?;
            }
        }
        Ok(())
    }

    /// Delivers payloads until no node has anything left to send. Returns
    /// the number of payloads delivered.
    pub fn deliver_all(&mut self) -> Result<usize, Error> {
        let mut delivered = 0;
        for _ in 0..1_000 {
            let pending = self.take_pending();
            if pending.is_empty() {
                return Ok(delivered);
            }
            for (from, payload) in &pending {
                self.deliver(*from, payload)?;
            }
            delivered += pending.len();
        }
        panic!("network did not settle");
    }

    /// Fires node `index`'s timer and hands the firing to the engine.
    pub fn fire_timer(&mut self, index: usize) -> Result<Option<HeightView>, Error> {
        let node = &mut self.nodes[index];
        let fired = node.timer_mut().fire();
        if let Some(hv) = fired {
            node.on_timeout(hv)?;
        }
        Ok(fired)
    }

    /// Fires the timers of all online nodes.
    pub fn fire_all_timers(&mut self) -> Result<(), Error> {
        for index in 0..self.nodes.len() {
            if !self.offline.contains(&index) {
                self.fire_timer(index)?;
            }
        }
        Ok(())
    }

    pub fn advance_all(&mut self, by: Duration) {
        for node in &mut self.nodes {
            node.timer_mut().advance(by);
        }
    }

    /// Last block each node persisted.
    pub fn last_blocks(&self) -> Vec<Option<&TestBlock>> {
        self.nodes
            .iter()
            .map(|node| node.host().processed.last())
            .collect()
    }

    /// Moves every online node that accepted a block on to the next height.
    pub fn reset_accepted(&mut self) -> Result<(), Error> {
        for (index, node) in self.nodes.iter_mut().enumerate() {
            if self.offline.contains(&index) || !node.context().block_sent() {
                continue;
            }
            let timestamp = node.block().map_or(0, |b| b.timestamp());
            node.reset(timestamp)?;
        }
        Ok(())
    }
}
