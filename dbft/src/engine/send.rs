//! Building and broadcasting this node's own payloads.

use {
    super::Dbft,
    crate::{
        error::Error,
        host::Host,
        message::{
            ChangeView, ChangeViewReason, Commit, ConsensusPayload, Message, PreCommit,
            PrepareRequest, PrepareResponse, RecoveryRequest,
        },
        recovery::RecoveryMessage,
        timer::Timer,
        types::{Block, PreBlock, Transaction},
    },
    log::*,
    std::time::{Duration, SystemTime, UNIX_EPOCH},
};

/// `time_per_block << shift`, saturating.
pub(super) fn shifted_timeout(time_per_block: Duration, shift: u32) -> Duration {
    1u32.checked_shl(shift)
        .and_then(|factor| time_per_block.checked_mul(factor))
        .unwrap_or(Duration::MAX)
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

impl<A: Host, T: Timer> Dbft<A, T> {
    pub(super) fn now(&self) -> SystemTime {
        self.timer.now()
    }

    pub(super) fn change_timer(&mut self, delay: Duration) {
        let hv = self.context.height_view();
        trace!("timer for {hv} set to {delay:?}");
        self.timer.reset(hv, delay);
    }

    /// Gives the round `count` extra shares of `time_per_block / M` while it
    /// is still making progress.
    pub(super) fn extend_timer(&mut self, count: u32) {
        if self.context.commit_sent() || self.view_changing() {
            return;
        }
        let m = u32::try_from(self.context.m().max(1)).unwrap_or(u32::MAX);
        let delay = self.config.time_per_block.saturating_mul(count) / m;
        trace!("extending timer by {delay:?}");
        self.timer.extend(delay);
    }

    pub(super) fn stop_tx_subscription(&mut self) {
        if self.context.tx_subscription_on {
            self.context.tx_subscription_on = false;
            self.host.stop_tx_flow();
        }
    }

    fn new_payload(&self, message: Message<A::Hash>) -> Option<ConsensusPayload<A::Hash>> {
        let index = u16::try_from(self.context.my_index?).ok()?;
        Some(ConsensusPayload::new(
            index,
            self.context.block_index,
            self.context.view_number,
            message,
        ))
    }

    /// Stores `payload` in this node's slot of `slots` and broadcasts it.
    fn store_and_broadcast(&mut self, payload: ConsensusPayload<A::Hash>, slot: SlotKind) {
        let index = payload.validator();
        let ctx = &mut self.context;
        let slots = match slot {
            SlotKind::Preparation => &mut ctx.preparation_payloads,
            SlotKind::PreCommit => &mut ctx.pre_commit_payloads,
            SlotKind::Commit => &mut ctx.commit_payloads,
            SlotKind::ChangeView => &mut ctx.change_view_payloads,
        };
        if let Some(own) = slots.get_mut(index) {
            *own = Some(payload.clone());
        }
        self.host.broadcast(payload);
    }

    /// Selects the proposal: verified transactions from the pool, the next
    /// consensus address, a random nonce and a timestamp strictly after the
    /// previous block's.
    pub(super) fn fill(&mut self) {
        let txs = self.host.get_verified();
        let ctx = &mut self.context;
        ctx.transactions.clear();
        ctx.missing_transactions.clear();
        ctx.header = None;
        ctx.block = None;
        ctx.pre_header = None;
        ctx.pre_block = None;

        let mut hashes = Vec::with_capacity(txs.len());
        for tx in txs {
            let hash = tx.hash();
            if ctx.transactions.insert(hash, tx).is_none() {
                hashes.push(hash);
            }
        }
        ctx.transaction_hashes = Some(hashes);

        let ordered = self.context.ordered_transactions();
        let validators = self.host.get_validators(Some(&ordered));
        self.context.next_consensus = Some(self.host.consensus_address(&validators));
        self.context.nonce = rand::random();
        let earliest = self
            .context
            .last_block_timestamp
            .saturating_add(self.config.timestamp_increment_ms);
        self.context.timestamp = unix_millis(self.now()).max(earliest);
    }

    /// Builds the header once the proposal is known and, under the anti-MEV
    /// extension, the pre-block has been processed.
    pub(super) fn make_header(&mut self) -> bool {
        if self.context.header.is_some() {
            return true;
        }
        if self.context.transaction_hashes.is_none() {
            return false;
        }
        if self.anti_mev_active() && !self.context.pre_block_processed {
            return false;
        }
        let header = self.host.new_block(&self.context);
        self.context.header = Some(header);
        true
    }

    pub(super) fn create_block(&mut self) -> bool {
        if self.context.block.is_some() {
            return true;
        }
        if !self.make_header() || !self.context.has_all_transactions() {
            return false;
        }
        let Some(mut block) = self.context.header.clone() else {
            return false;
        };
        block.set_transactions(self.context.ordered_transactions());
        self.context.block = Some(block);
        true
    }

    pub(super) fn make_pre_header(&mut self) -> bool {
        if self.context.pre_header.is_some() {
            return true;
        }
        if self.context.transaction_hashes.is_none() {
            return false;
        }
        let Some(hooks) = self.pre_block_hooks.as_ref() else {
            return false;
        };
        let pre_header = hooks.new_pre_block(&self.context);
        self.context.pre_header = Some(pre_header);
        true
    }

    pub(super) fn create_pre_block(&mut self) -> bool {
        if self.context.pre_block.is_some() {
            return true;
        }
        if !self.make_pre_header() || !self.context.has_all_transactions() {
            return false;
        }
        let Some(mut pre_block) = self.context.pre_header.clone() else {
            return false;
        };
        pre_block.set_transactions(self.context.ordered_transactions());
        self.context.pre_block = Some(pre_block);
        true
    }

    /// Proposes a block. Without `force`, an empty proposal is postponed
    /// while `max_time_per_block` allows waiting for transactions.
    pub(super) fn send_prepare_request(&mut self, force: bool) -> Result<(), Error> {
        self.fill();

        if let Some(max_time_per_block) = self.config.max_time_per_block {
            let empty = self
                .context
                .transaction_hashes
                .as_ref()
                .map_or(true, Vec::is_empty);
            let elapsed = self
                .context
                .last_block_time
                .map(|time| self.now().duration_since(time).unwrap_or_default())
                .unwrap_or(max_time_per_block);
            if !force && empty && elapsed < max_time_per_block {
                if !self.context.tx_subscription_on {
                    self.context.tx_subscription_on = true;
                    self.host.subscribe_for_txs();
                }
                let wait = max_time_per_block.saturating_sub(elapsed);
                debug!(
                    "no transactions at {}, waiting up to {wait:?}",
                    self.context.height_view()
                );
                self.change_timer(wait);
                return Ok(());
            }
        }
        self.stop_tx_subscription();

        let Some(next_consensus) = self.context.next_consensus else {
            return Ok(());
        };
        let transaction_hashes = self.context.transaction_hashes.clone().unwrap_or_default();
        let tx_count = transaction_hashes.len();
        let Some(payload) = self.new_payload(Message::PrepareRequest(PrepareRequest {
            timestamp: self.context.timestamp,
            nonce: self.context.nonce,
            next_consensus,
            transaction_hashes,
        })) else {
            return Ok(());
        };

        info!(
            "sending PrepareRequest at {} with {tx_count} transactions",
            self.context.height_view()
        );
        self.store_and_broadcast(payload, SlotKind::Preparation);
        self.context.prepare_sent_time = Some(self.now());

        let view = self.context.view_number;
        let time_per_block = self.config.time_per_block;
        let mut timeout = shifted_timeout(time_per_block, u32::from(view) + 1);
        if view == 0 {
            timeout = timeout.saturating_sub(time_per_block);
        }
        self.change_timer(timeout);

        // Commits and pre-commits that arrived before the proposal were
        // stored unchecked.
        self.verify_commits_against_header();
        if self.anti_mev_active() {
            self.verify_pre_commits_against_pre_header();
        }
        self.check_prepare()
    }

    pub(super) fn send_prepare_response(&mut self) {
        let primary = self.context.primary_index;
        let Some(request) = self.context.preparation_payloads[primary].as_ref() else {
            return;
        };
        let preparation_hash = self.host.payload_hash(request);
        let Some(payload) =
            self.new_payload(Message::PrepareResponse(PrepareResponse { preparation_hash }))
        else {
            return;
        };
        info!(
            "sending PrepareResponse at {}",
            self.context.height_view()
        );
        self.store_and_broadcast(payload, SlotKind::Preparation);
    }

    /// Asks to move to the next view. A timeout while more than F validators
    /// are committed or unreachable sends a recovery request instead.
    pub(super) fn send_change_view(&mut self, reason: ChangeViewReason) -> Result<(), Error> {
        if self.watch_only() {
            return Ok(());
        }
        let Some(new_view) = self.context.view_number.checked_add(1) else {
            warn!(
                "cannot change view past {} at height {}",
                self.context.view_number, self.context.block_index
            );
            return Ok(());
        };
        self.change_timer(shifted_timeout(
            self.config.time_per_block,
            u32::from(new_view) + 1,
        ));

        if reason == ChangeViewReason::Timeout && self.context.more_than_f_nodes_committed_or_lost()
        {
            info!(
                "not changing view at {}: {} committed, {} failed; requesting recovery",
                self.context.height_view(),
                self.context.count_committed(),
                self.context.count_failed()
            );
            self.send_recovery_request();
            return Ok(());
        }

        let reason = if reason == ChangeViewReason::Timeout && !self.context.has_all_transactions()
        {
            ChangeViewReason::TxNotFound
        } else {
            reason
        };
        let Some(payload) = self.new_payload(Message::ChangeView(ChangeView {
            new_view_number: new_view,
            timestamp: unix_millis(self.now()),
            reason,
        })) else {
            return Ok(());
        };
        info!(
            "sending ChangeView to view {new_view} reason {reason} at {}",
            self.context.height_view()
        );
        self.store_and_broadcast(payload, SlotKind::ChangeView);
        self.check_change_view(new_view)
    }

    /// Stores and broadcasts the ChangeView agreeing to `view` on behalf of
    /// a quorum this node joins late.
    pub(super) fn send_change_agreement(&mut self, view: u8) {
        let Some(payload) = self.new_payload(Message::ChangeView(ChangeView {
            new_view_number: view,
            timestamp: unix_millis(self.now()),
            reason: ChangeViewReason::ChangeAgreement,
        })) else {
            return;
        };
        info!("sending ChangeView agreement to view {view}");
        self.store_and_broadcast(payload, SlotKind::ChangeView);
    }

    pub(super) fn send_pre_commit(&mut self) {
        if let Some(existing) = self.own_payload(SlotKind::PreCommit) {
            debug!("resending PreCommit at {}", self.context.height_view());
            self.host.broadcast(existing);
            return;
        }
        if !self.make_pre_header() {
            warn!(
                "cannot build pre-block header at {}",
                self.context.height_view()
            );
            return;
        }
        let data = match (
            self.pre_block_hooks.as_ref(),
            self.context.pre_header.as_ref(),
            self.context.priv_key.as_ref(),
        ) {
            (Some(hooks), Some(pre_header), Some(key)) => hooks.pre_commit_data(pre_header, key),
            _ => return,
        };
        let data = match data {
            Ok(data) => data,
            Err(err) => {
                warn!("failed to produce PreCommit data: {err}");
                return;
            }
        };
        let Some(payload) = self.new_payload(Message::PreCommit(PreCommit { data })) else {
            return;
        };
        info!("sending PreCommit at {}", self.context.height_view());
        self.store_and_broadcast(payload, SlotKind::PreCommit);
    }

    /// Signs the header and broadcasts the Commit. A node that already
    /// committed at this height rebroadcasts its existing Commit.
    pub(super) fn send_commit(&mut self) {
        if let Some(existing) = self.own_payload(SlotKind::Commit) {
            debug!("resending Commit at {}", self.context.height_view());
            self.host.broadcast(existing);
            return;
        }
        if !self.make_header() {
            warn!("cannot build block header at {}", self.context.height_view());
            return;
        }
        let signature = match (self.context.header.as_ref(), self.context.priv_key.as_ref()) {
            (Some(header), Some(key)) => self.host.sign_block(header, key),
            _ => return,
        };
        let signature = match signature {
            Ok(signature) => signature,
            Err(err) => {
                warn!("failed to sign block: {err}");
                return;
            }
        };
        let Some(payload) = self.new_payload(Message::Commit(Commit { signature })) else {
            return;
        };
        info!("sending Commit at {}", self.context.height_view());
        self.store_and_broadcast(payload, SlotKind::Commit);
    }

    pub(super) fn send_recovery_request(&mut self) {
        if self.watch_only() {
            return;
        }
        let Some(payload) = self.new_payload(Message::RecoveryRequest(RecoveryRequest {
            timestamp: unix_millis(self.now()),
        })) else {
            return;
        };
        info!("sending RecoveryRequest at {}", self.context.height_view());
        self.host.broadcast(payload);
    }

    pub(super) fn send_recovery_message(&mut self) {
        if self.watch_only() {
            return;
        }
        let recovery = self.make_recovery_message();
        let Some(payload) = self.new_payload(Message::RecoveryMessage(recovery)) else {
            return;
        };
        debug!("sending RecoveryMessage at {}", self.context.height_view());
        self.host.broadcast(payload);
    }

    /// Everything a lagging peer needs to catch up with this node: the
    /// preparations, the change views that led to the current view and,
    /// once this node is locked, the pre-commits and commits.
    pub(super) fn make_recovery_message(&self) -> RecoveryMessage<A::Hash> {
        let ctx = &self.context;
        let mut recovery = RecoveryMessage::default();
        for payload in ctx.preparation_payloads.iter().flatten() {
            recovery.add_payload(payload);
        }
        for payload in ctx.last_change_view_payloads.iter().flatten() {
            recovery.add_payload(payload);
        }
        if self.is_locked() {
            for payload in ctx.pre_commit_payloads.iter().flatten() {
                recovery.add_payload(payload);
            }
            for payload in ctx.commit_payloads.iter().flatten() {
                recovery.add_payload(payload);
            }
        }
        recovery
    }

    fn own_payload(&self, slot: SlotKind) -> Option<ConsensusPayload<A::Hash>> {
        let ctx = &self.context;
        let slots = match slot {
            SlotKind::Preparation => &ctx.preparation_payloads,
            SlotKind::PreCommit => &ctx.pre_commit_payloads,
            SlotKind::Commit => &ctx.commit_payloads,
            SlotKind::ChangeView => &ctx.change_view_payloads,
        };
        ctx.my_index
            .and_then(|index| slots.get(index))
            .and_then(Option::clone)
    }
}

#[derive(Clone, Copy)]
enum SlotKind {
    Preparation,
    PreCommit,
    Commit,
    ChangeView,
}

#[cfg(test)]
mod tests {
    use {super::*, test_case::test_case};

    #[test_case(0 => Duration::from_secs(15); "one")]
    #[test_case(1 => Duration::from_secs(30); "double")]
    #[test_case(3 => Duration::from_secs(120); "eightfold")]
    #[test_case(40 => Duration::MAX; "overflowing shift saturates")]
    fn test_shifted_timeout(shift: u32) -> Duration {
        shifted_timeout(Duration::from_secs(15), shift)
    }

    #[test]
    fn test_unix_millis() {
        assert_eq!(unix_millis(UNIX_EPOCH), 0);
        assert_eq!(
            unix_millis(UNIX_EPOCH + Duration::from_millis(1_700_000_000_123)),
            1_700_000_000_123
        );
    }
}
