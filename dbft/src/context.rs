//! Per-epoch consensus state.
//!
//! The context holds everything known about the current (height, view)
//! attempt: validators, one message slot per validator for each message
//! kind, and the proposed block's content. It is reset in place by the
//! engine at every new height (full reset) and every view change (partial).

use {
    crate::{
        host::Host,
        message::ConsensusPayload,
        proposer, quorum,
        types::HeightView,
    },
    std::{collections::HashMap, time::SystemTime},
};

type Slots<H> = Vec<Option<ConsensusPayload<H>>>;

pub struct Context<A: Host> {
    /// Height being decided.
    pub block_index: u32,
    pub view_number: u8,
    pub validators: Vec<A::PublicKey>,
    /// This node's position in `validators`, `None` for a non-validator.
    pub my_index: Option<usize>,
    pub primary_index: usize,
    pub priv_key: Option<A::PrivateKey>,
    pub pub_key: Option<A::PublicKey>,

    pub prev_hash: Option<A::Hash>,
    /// Proposed block timestamp in milliseconds.
    pub timestamp: u64,
    pub nonce: u64,
    pub next_consensus: Option<A::Hash>,
    pub transactions: HashMap<A::Hash, A::Transaction>,
    /// `None` until a PrepareRequest is made or received.
    pub transaction_hashes: Option<Vec<A::Hash>>,
    pub missing_transactions: Vec<A::Hash>,

    /// PrepareRequest (primary's slot) and PrepareResponses.
    pub preparation_payloads: Slots<A::Hash>,
    pub pre_commit_payloads: Slots<A::Hash>,
    /// Kept across views of one height.
    pub commit_payloads: Slots<A::Hash>,
    pub change_view_payloads: Slots<A::Hash>,
    /// ChangeViews that led to the current view, kept for recovery.
    pub last_change_view_payloads: Slots<A::Hash>,
    /// Latest (height, view) seen from each validator. Never reset.
    pub last_seen_message: Vec<Option<HeightView>>,

    pub header: Option<A::Block>,
    pub block: Option<A::Block>,
    pub pre_header: Option<A::PreBlock>,
    pub pre_block: Option<A::PreBlock>,
    pub block_processed: bool,
    pub pre_block_processed: bool,

    pub last_block_index: Option<u32>,
    pub last_block_time: Option<SystemTime>,
    /// Timestamp of the last accepted block in milliseconds.
    pub last_block_timestamp: u64,
    pub prepare_sent_time: Option<SystemTime>,
    pub tx_subscription_on: bool,
}

impl<A: Host> Default for Context<A> {
    fn default() -> Self {
        Self {
            block_index: 0,
            view_number: 0,
            validators: Vec::new(),
            my_index: None,
            primary_index: 0,
            priv_key: None,
            pub_key: None,
            prev_hash: None,
            timestamp: 0,
            nonce: 0,
            next_consensus: None,
            transactions: HashMap::new(),
            transaction_hashes: None,
            missing_transactions: Vec::new(),
            preparation_payloads: Vec::new(),
            pre_commit_payloads: Vec::new(),
            commit_payloads: Vec::new(),
            change_view_payloads: Vec::new(),
            last_change_view_payloads: Vec::new(),
            last_seen_message: Vec::new(),
            header: None,
            block: None,
            pre_header: None,
            pre_block: None,
            block_processed: false,
            pre_block_processed: false,
            last_block_index: None,
            last_block_time: None,
            last_block_timestamp: 0,
            prepare_sent_time: None,
            tx_subscription_on: false,
        }
    }
}

fn own_slot<H>(slots: &Slots<H>, my_index: Option<usize>) -> Option<&ConsensusPayload<H>> {
    my_index.and_then(|i| slots.get(i)).and_then(Option::as_ref)
}

impl<A: Host> Context<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn n(&self) -> usize {
        self.validators.len()
    }

    pub fn f(&self) -> usize {
        quorum::max_faulty(self.n())
    }

    pub fn m(&self) -> usize {
        quorum::quorum(self.n())
    }

    pub fn height_view(&self) -> HeightView {
        HeightView::new(self.block_index, self.view_number)
    }

    pub fn get_primary_index(&self, view: u8) -> usize {
        proposer::primary_index(self.block_index, view, self.n())
    }

    pub fn is_primary(&self) -> bool {
        self.my_index == Some(self.primary_index)
    }

    pub fn is_backup(&self) -> bool {
        self.my_index.is_some_and(|i| i != self.primary_index)
    }

    pub fn request_sent_or_received(&self) -> bool {
        self.preparation_payloads
            .get(self.primary_index)
            .is_some_and(Option::is_some)
    }

    pub fn response_sent(&self) -> bool {
        own_slot(&self.preparation_payloads, self.my_index).is_some()
    }

    pub fn pre_commit_sent(&self) -> bool {
        own_slot(&self.pre_commit_payloads, self.my_index).is_some()
    }

    pub fn commit_sent(&self) -> bool {
        own_slot(&self.commit_payloads, self.my_index).is_some()
    }

    pub fn block_sent(&self) -> bool {
        self.block_processed
    }

    /// Target view of this node's own pending ChangeView, if any.
    pub fn own_change_view_target(&self) -> Option<u8> {
        own_slot(&self.change_view_payloads, self.my_index)
            .and_then(|p| p.change_view())
            .map(|cv| cv.new_view_number)
    }

    /// True when this node already asked to leave the current view.
    pub fn view_changing(&self) -> bool {
        self.own_change_view_target()
            .is_some_and(|target| target > self.view_number)
    }

    /// Commits from any view of this height.
    pub fn count_committed(&self) -> usize {
        self.commit_payloads.iter().flatten().count()
    }

    /// Validators not heard from for more than one height.
    pub fn count_failed(&self) -> usize {
        self.last_seen_message
            .iter()
            .take(self.n())
            .filter(|seen| {
                seen.map_or(true, |hv| hv.height.saturating_add(1) < self.block_index)
            })
            .count()
    }

    /// While this holds, a timeout must not push the node to a new view:
    /// too many peers are committed or gone for a new view to gather a quorum.
    pub fn more_than_f_nodes_committed_or_lost(&self) -> bool {
        self.count_committed() + self.count_failed() > self.f()
    }

    /// Number of filled slots at the current view.
    pub fn count_at_current_view(&self, slots: &Slots<A::Hash>) -> usize {
        slots
            .iter()
            .flatten()
            .filter(|p| p.view_number == self.view_number)
            .count()
    }

    pub fn has_all_transactions(&self) -> bool {
        let expected = self.transaction_hashes.as_ref().map_or(0, Vec::len);
        expected == self.transactions.len()
    }

    /// Proposed transaction hashes not yet resolved.
    pub fn missing_hashes(&self) -> Vec<A::Hash> {
        self.transaction_hashes
            .iter()
            .flatten()
            .filter(|h| !self.transactions.contains_key(h))
            .copied()
            .collect()
    }

    /// Proposed transactions in proposal order. Only complete once
    /// `has_all_transactions` holds.
    pub fn ordered_transactions(&self) -> Vec<A::Transaction> {
        self.transaction_hashes
            .iter()
            .flatten()
            .filter_map(|h| self.transactions.get(h).cloned())
            .collect()
    }

    /// Public key of validator `index`.
    pub fn validator(&self, index: usize) -> Option<&A::PublicKey> {
        self.validators.get(index)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            message::{ChangeView, ChangeViewReason, Commit, Message},
            testing::{TestHost, TestTransaction},
        },
        solana_hash::Hash,
        solana_pubkey::Pubkey,
        test_case::test_case,
    };

    fn make_context(n: usize, block_index: u32, my_index: Option<usize>) -> Context<TestHost> {
        let mut ctx = Context::new();
        ctx.validators = (0..n).map(|_| Pubkey::new_unique()).collect();
        ctx.block_index = block_index;
        ctx.my_index = my_index;
        ctx.primary_index = ctx.get_primary_index(0);
        ctx.preparation_payloads = vec![None; n];
        ctx.pre_commit_payloads = vec![None; n];
        ctx.commit_payloads = vec![None; n];
        ctx.change_view_payloads = vec![None; n];
        ctx.last_change_view_payloads = vec![None; n];
        ctx.last_seen_message = vec![None; n];
        ctx
    }

    fn make_commit(validator: u16, height: u32, view: u8) -> ConsensusPayload<Hash> {
        ConsensusPayload::new(
            validator,
            height,
            view,
            Message::Commit(Commit {
                signature: vec![validator as u8],
            }),
        )
    }

    fn make_change_view(validator: u16, height: u32, view: u8, target: u8) -> ConsensusPayload<Hash> {
        ConsensusPayload::new(
            validator,
            height,
            view,
            Message::ChangeView(ChangeView {
                new_view_number: target,
                timestamp: 0,
                reason: ChangeViewReason::Timeout,
            }),
        )
    }

    #[test_case(1, 0, 1)]
    #[test_case(4, 1, 3)]
    #[test_case(7, 2, 5)]
    fn test_quorum_sizes(n: usize, f: usize, m: usize) {
        let ctx = make_context(n, 1, None);
        assert_eq!(ctx.n(), n);
        assert_eq!(ctx.f(), f);
        assert_eq!(ctx.m(), m);
    }

    #[test]
    fn test_primary_rotation() {
        let ctx = make_context(4, 5, Some(1));
        assert_eq!(ctx.get_primary_index(0), 1);
        assert_eq!(ctx.get_primary_index(1), 0);
        assert!(ctx.is_primary());
        assert!(!ctx.is_backup());
    }

    #[test]
    fn test_roles() {
        let ctx = make_context(4, 5, Some(2));
        assert!(!ctx.is_primary());
        assert!(ctx.is_backup());

        let ctx = make_context(4, 5, None);
        assert!(!ctx.is_primary());
        assert!(!ctx.is_backup());
        assert!(!ctx.commit_sent());
        assert!(!ctx.response_sent());
    }

    #[test]
    fn test_count_committed_includes_other_views() {
        let mut ctx = make_context(4, 5, Some(0));
        ctx.view_number = 1;
        ctx.commit_payloads[1] = Some(make_commit(1, 5, 0));
        ctx.commit_payloads[2] = Some(make_commit(2, 5, 1));
        assert_eq!(ctx.count_committed(), 2);
        assert_eq!(ctx.count_at_current_view(&ctx.commit_payloads), 1);
        assert!(!ctx.commit_sent());
        ctx.commit_payloads[0] = Some(make_commit(0, 5, 1));
        assert!(ctx.commit_sent());
    }

    #[test]
    fn test_count_failed() {
        let mut ctx = make_context(4, 10, Some(0));
        // Never seen counts as failed.
        assert_eq!(ctx.count_failed(), 4);
        ctx.last_seen_message[0] = Some(HeightView::new(10, 0));
        ctx.last_seen_message[1] = Some(HeightView::new(9, 3));
        ctx.last_seen_message[2] = Some(HeightView::new(8, 0));
        assert_eq!(ctx.count_failed(), 2);
    }

    #[test]
    fn test_more_than_f_committed_or_lost() {
        let mut ctx = make_context(4, 10, Some(0));
        for i in 0..4 {
            ctx.last_seen_message[i] = Some(HeightView::new(10, 0));
        }
        assert!(!ctx.more_than_f_nodes_committed_or_lost());
        ctx.commit_payloads[3] = Some(make_commit(3, 10, 0));
        assert!(!ctx.more_than_f_nodes_committed_or_lost());
        ctx.last_seen_message[2] = None;
        assert!(ctx.more_than_f_nodes_committed_or_lost());
    }

    #[test]
    fn test_view_changing() {
        let mut ctx = make_context(4, 10, Some(0));
        assert!(!ctx.view_changing());
        ctx.change_view_payloads[0] = Some(make_change_view(0, 10, 0, 1));
        assert!(ctx.view_changing());
        assert_eq!(ctx.own_change_view_target(), Some(1));
        ctx.view_number = 1;
        assert!(!ctx.view_changing());
    }

    #[test]
    fn test_transactions_tracking() {
        let mut ctx = make_context(1, 1, Some(0));
        assert!(ctx.has_all_transactions());

        let a = TestTransaction::new(b"a");
        let b = TestTransaction::new(b"b");
        ctx.transaction_hashes = Some(vec![b.hash, a.hash]);
        assert!(!ctx.has_all_transactions());
        assert_eq!(ctx.missing_hashes(), vec![b.hash, a.hash]);

        ctx.transactions.insert(a.hash, a.clone());
        assert_eq!(ctx.missing_hashes(), vec![b.hash]);
        ctx.transactions.insert(b.hash, b.clone());
        assert!(ctx.has_all_transactions());
        assert_eq!(ctx.ordered_transactions(), vec![b, a]);
    }
}
