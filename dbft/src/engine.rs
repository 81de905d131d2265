//! The dBFT state machine.
//!
//! The engine reacts to three kinds of events: a consensus payload from a
//! peer, a transaction from the pool and a timer firing. Each event is handled
//! to completion before returning, calling back into the [`Host`] to
//! broadcast payloads, fetch transactions and persist blocks. The engine owns
//! no threads; the caller serializes events (see `ConsensusService`).

mod check;
mod send;

use {
    crate::{
        cache::MessageCache,
        config::{ConfigError, DbftConfig},
        context::Context,
        error::Error,
        evidence::{EquivocationEvidence, EvidenceCollector, EvidenceKind},
        host::{Host, PreBlockHooks},
        message::{ChangeViewReason, ConsensusPayload, Message},
        rtt::RoundTripTimes,
        timer::Timer,
        types::{HeightView, Transaction},
    },
    log::*,
    std::{collections::HashSet, time::Duration},
};

/// Evidence is kept this many heights for the host to drain.
pub const EVIDENCE_RETENTION_HEIGHTS: u32 = 100;

/// Builder for [`Dbft`]. Validates the configuration and the anti-MEV wiring.
pub struct DbftBuilder<A: Host, T: Timer> {
    config: DbftConfig,
    host: A,
    timer: T,
    pre_block_hooks: Option<Box<dyn PreBlockHooks<A> + Send>>,
}

impl<A: Host, T: Timer> DbftBuilder<A, T> {
    /// Callbacks for the pre-commit phase. Required iff
    /// `anti_mev_extension_enabling_height` is non-negative.
    pub fn pre_block_hooks<P>(mut self, hooks: P) -> Self
    where
        P: PreBlockHooks<A> + Send + 'static,
    {
        self.pre_block_hooks = Some(Box::new(hooks));
        self
    }

    pub fn build(self) -> Result<Dbft<A, T>, ConfigError> {
        self.config.validate()?;
        let enabling_height = self.config.anti_mev_extension_enabling_height;
        match (enabling_height >= 0, self.pre_block_hooks.is_some()) {
            (true, false) => return Err(ConfigError::MissingPreBlockHooks(enabling_height)),
            (false, true) => return Err(ConfigError::UnexpectedPreBlockHooks),
            _ => {}
        }
        Ok(Dbft {
            rtt: RoundTripTimes::new(self.config.rtt_capacity),
            config: self.config,
            host: self.host,
            timer: self.timer,
            pre_block_hooks: self.pre_block_hooks,
            context: Context::new(),
            cache: MessageCache::new(),
            evidence: EvidenceCollector::new(),
            recovering: false,
        })
    }
}

/// dBFT consensus engine for one validator.
pub struct Dbft<A: Host, T: Timer> {
    config: DbftConfig,
    host: A,
    timer: T,
    pre_block_hooks: Option<Box<dyn PreBlockHooks<A> + Send>>,
    context: Context<A>,
    cache: MessageCache<A::Hash>,
    rtt: RoundTripTimes,
    evidence: EvidenceCollector<A::Hash>,
    /// Set while a RecoveryMessage is being replayed.
    recovering: bool,
}

impl<A: Host, T: Timer> Dbft<A, T> {
    pub fn builder(config: DbftConfig, host: A, timer: T) -> DbftBuilder<A, T> {
        DbftBuilder {
            config,
            host,
            timer,
            pre_block_hooks: None,
        }
    }

    /// Starts consensus for the first time. `timestamp` is the timestamp of
    /// the last accepted block in milliseconds. A primary proposes right away.
    pub fn start(&mut self, timestamp: u64) -> Result<(), Error> {
        self.cache = MessageCache::new();
        self.initialize_consensus(0, timestamp)?;
        if self.is_primary_awaiting_request() {
            self.send_prepare_request(true)?;
        }
        Ok(())
    }

    /// Moves to the height after the host's current one, e.g. once the
    /// accepted block has been persisted. The primary proposes when its
    /// timer fires.
    pub fn reset(&mut self, timestamp: u64) -> Result<(), Error> {
        self.initialize_consensus(0, timestamp)
    }

    /// Resets the context for `view` (a new height when `view` is 0), arms
    /// the timer and replays messages cached for this height.
    pub fn initialize_consensus(&mut self, view: u8, timestamp: u64) -> Result<(), Error> {
        self.reset_context(view, timestamp)?;
        let height = self.context.block_index;
        if view == 0 {
            self.cache.prune_below(height);
            self.evidence
                .prune(height.saturating_sub(EVIDENCE_RETENTION_HEIGHTS));
        }

        if self.watch_only() {
            info!("initializing dbft as watch-only at height {height} view {view}");
            self.timer.stop();
        } else {
            let is_primary = self.context.is_primary();
            info!(
                "initializing dbft at height {height} view {view}: index {:?} role {} primary {}",
                self.context.my_index,
                if is_primary { "Primary" } else { "Backup" },
                self.context.primary_index,
            );

            let time_per_block = self.config.time_per_block;
            let mut timeout = if is_primary && !self.recovering && view == 0 {
                time_per_block
            } else {
                send::shifted_timeout(time_per_block, u32::from(view) + 1)
            };
            if let Some(elapsed) = self.elapsed_since_previous_block() {
                timeout = timeout.saturating_sub(elapsed);
                if is_primary {
                    timeout = timeout.saturating_sub(self.rtt.average() / 2);
                }
            }
            self.change_timer(timeout);

            if is_primary && !self.recovering && view > 0 {
                self.send_prepare_request(true)?;
            }
        }

        if let Some(inbox) = self.cache.get_height(height) {
            debug!("replaying {} cached messages for height {height}", inbox.len());
            for payload in inbox.into_payloads() {
                self.on_receive(payload)?;
            }
        }
        Ok(())
    }

    /// Handles a payload received from the network.
    pub fn on_receive(&mut self, payload: ConsensusPayload<A::Hash>) -> Result<(), Error> {
        let index = payload.validator();
        let message_type = payload.message_type();
        if index >= self.context.n() {
            warn!(
                "dropping {message_type} from invalid validator index {index} ({} validators)",
                self.context.n()
            );
            return Ok(());
        }
        trace!(
            "received {message_type} from {index} for {} at {}",
            payload.height_view(),
            self.context.height_view()
        );

        let current = self.context.height_view();
        if payload.height < current.height {
            debug!(
                "dropping stale {message_type} from {index} for height {}",
                payload.height
            );
            return Ok(());
        }
        let any_view = matches!(
            payload.message,
            Message::ChangeView(_) | Message::RecoveryMessage(_)
        );
        if payload.height > current.height || (payload.view_number > current.view && !any_view) {
            debug!(
                "caching {message_type} from {index} for {}",
                payload.height_view()
            );
            self.cache.add_message(payload);
            return Ok(());
        }

        let hv = payload.height_view();
        if let Some(seen) = self.context.last_seen_message.get_mut(index) {
            if seen.map_or(true, |seen| seen < hv) {
                *seen = Some(hv);
            }
        }

        if self.context.block_sent() {
            if let Message::RecoveryRequest(_) = payload.message {
                return self.on_recovery_request(&payload);
            }
            debug!(
                "block already accepted at height {}, dropping {message_type} from {index}",
                current.height
            );
            return Ok(());
        }

        match payload.message {
            Message::ChangeView(_) => self.on_change_view(payload),
            Message::PrepareRequest(_) => self.on_prepare_request(payload),
            Message::PrepareResponse(_) => self.on_prepare_response(payload),
            Message::PreCommit(_) => self.on_pre_commit(payload),
            Message::Commit(_) => self.on_commit(payload),
            Message::RecoveryRequest(_) => self.on_recovery_request(&payload),
            Message::RecoveryMessage(_) => self.on_recovery_message(&payload),
        }
    }

    /// Handles a firing of the timer tagged `hv`.
    pub fn on_timeout(&mut self, hv: HeightView) -> Result<(), Error> {
        if self.watch_only() || self.context.block_sent() {
            return Ok(());
        }
        if hv != self.context.height_view() {
            debug!(
                "ignoring stale timeout {hv} at {}",
                self.context.height_view()
            );
            return Ok(());
        }
        debug!("timeout at {hv}");

        if self.is_primary_awaiting_request() {
            return self.send_prepare_request(false);
        }
        if self.is_locked() {
            debug!("timeout after commit at {hv}, resending recovery");
            self.send_recovery_message();
            self.change_timer(self.config.time_per_block);
            return Ok(());
        }
        self.send_change_view(ChangeViewReason::Timeout)
    }

    /// Handles a transaction that arrived in the pool.
    pub fn on_transaction(&mut self, tx: A::Transaction) -> Result<(), Error> {
        if self.context.tx_subscription_on && self.is_primary_awaiting_request() {
            debug!("transaction arrived while waiting for a non-empty block");
            return self.send_prepare_request(true);
        }
        if self.watch_only()
            || !self.context.is_backup()
            || (self.view_changing() && !self.context.more_than_f_nodes_committed_or_lost())
            || !self.context.request_sent_or_received()
            || self.context.response_sent()
            || self.context.block_sent()
        {
            return Ok(());
        }

        let hash = tx.hash();
        let Some(position) = self
            .context
            .missing_transactions
            .iter()
            .position(|missing| *missing == hash)
        else {
            return Ok(());
        };
        self.context.missing_transactions.swap_remove(position);
        self.context.transactions.insert(hash, tx);
        if !self.context.missing_transactions.is_empty() {
            return Ok(());
        }

        debug!(
            "received all transactions for height {}",
            self.context.block_index
        );
        if !self.create_and_check_block()? {
            return Ok(());
        }
        self.send_prepare_response();
        self.check_prepare()
    }

    pub fn context(&self) -> &Context<A> {
        &self.context
    }

    /// Header of the block being decided, once it can be built.
    pub fn header(&self) -> Option<&A::Block> {
        self.context.header.as_ref()
    }

    pub fn pre_header(&self) -> Option<&A::PreBlock> {
        self.context.pre_header.as_ref()
    }

    /// The block accepted (or being accepted) at the current height.
    pub fn block(&self) -> Option<&A::Block> {
        self.context.block.as_ref()
    }

    pub fn evidence(&self) -> &EvidenceCollector<A::Hash> {
        &self.evidence
    }

    pub fn evidence_mut(&mut self) -> &mut EvidenceCollector<A::Hash> {
        &mut self.evidence
    }

    pub fn rtt_average(&self) -> Duration {
        self.rtt.average()
    }

    pub fn config(&self) -> &DbftConfig {
        &self.config
    }

    pub fn host(&self) -> &A {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut A {
        &mut self.host
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }

    pub fn timer_mut(&mut self) -> &mut T {
        &mut self.timer
    }

    pub fn watch_only(&self) -> bool {
        self.context.my_index.is_none() || self.host.watch_only()
    }

    pub fn view_changing(&self) -> bool {
        !self.watch_only() && self.context.view_changing()
    }

    /// Whether the pre-commit phase runs at the current height.
    pub fn anti_mev_active(&self) -> bool {
        self.pre_block_hooks.is_some() && self.config.anti_mev_enabled_at(self.context.block_index)
    }

    /// A node that sent its Commit (or its PreCommit under the anti-MEV
    /// extension) no longer changes view at this height.
    fn is_locked(&self) -> bool {
        self.context.commit_sent() || (self.anti_mev_active() && self.context.pre_commit_sent())
    }

    fn is_primary_awaiting_request(&self) -> bool {
        !self.watch_only()
            && self.context.is_primary()
            && !self.context.request_sent_or_received()
            && !self.context.block_sent()
    }

    fn elapsed_since_previous_block(&self) -> Option<Duration> {
        let last_index = self.context.last_block_index?;
        if last_index.checked_add(1) != Some(self.context.block_index) {
            return None;
        }
        let last_time = self.context.last_block_time?;
        Some(self.now().duration_since(last_time).unwrap_or_default())
    }

    fn reset_context(&mut self, view: u8, timestamp: u64) -> Result<(), Error> {
        if view == 0 {
            let height = self.host.current_height().saturating_add(1);
            let validators = self.host.get_validators(None);
            if validators.is_empty() {
                error!("host returned no validators for height {height}");
                return Err(Error::NoValidators { height });
            }
            self.stop_tx_subscription();

            let n = validators.len();
            let ctx = &mut self.context;
            ctx.prev_hash = Some(self.host.current_block_hash());
            ctx.block_index = height;
            ctx.validators = validators;
            ctx.last_change_view_payloads = vec![None; n];
            ctx.commit_payloads = vec![None; n];
            ctx.last_seen_message.resize(n, None);
            ctx.last_block_timestamp = timestamp;
            ctx.block_processed = false;
        } else {
            let ctx = &mut self.context;
            ctx.last_change_view_payloads = ctx
                .change_view_payloads
                .iter()
                .map(|slot| {
                    slot.as_ref()
                        .filter(|p| p.change_view().is_some_and(|cv| cv.new_view_number >= view))
                        .cloned()
                })
                .collect();
        }

        let ctx = &mut self.context;
        let n = ctx.n();
        match self.host.get_key_pair(&ctx.validators) {
            Some((index, priv_key, pub_key)) if index < n => {
                ctx.my_index = Some(index);
                ctx.priv_key = Some(priv_key);
                ctx.pub_key = Some(pub_key);
            }
            other => {
                if let Some((index, ..)) = other {
                    warn!("key pair index {index} out of range for {n} validators");
                }
                ctx.my_index = None;
                ctx.priv_key = None;
                ctx.pub_key = None;
            }
        }

        ctx.view_number = view;
        ctx.primary_index = ctx.get_primary_index(view);
        ctx.header = None;
        ctx.block = None;
        ctx.pre_header = None;
        ctx.pre_block = None;
        ctx.pre_block_processed = false;
        ctx.preparation_payloads = vec![None; n];
        ctx.pre_commit_payloads = vec![None; n];
        ctx.change_view_payloads = vec![None; n];
        ctx.transactions.clear();
        ctx.transaction_hashes = None;
        ctx.missing_transactions.clear();
        ctx.next_consensus = None;
        ctx.nonce = 0;
        ctx.timestamp = 0;
        ctx.prepare_sent_time = None;
        if let Some(index) = ctx.my_index {
            ctx.last_seen_message[index] = Some(ctx.height_view());
        }
        Ok(())
    }

    fn on_change_view(&mut self, payload: ConsensusPayload<A::Hash>) -> Result<(), Error> {
        let index = payload.validator();
        let Some(cv) = payload.change_view().cloned() else {
            return Ok(());
        };

        if cv.new_view_number <= self.context.view_number {
            debug!(
                "stale ChangeView from {index} to view {} at view {}",
                cv.new_view_number, self.context.view_number
            );
            if self.recovering {
                return Ok(());
            }
            return self.on_recovery_request(&payload);
        }

        if self.is_locked() {
            debug!("ChangeView from {index} after commit, sending recovery");
            self.send_recovery_message();
            return Ok(());
        }

        let stored_target = self.context.change_view_payloads[index]
            .as_ref()
            .and_then(|p| p.change_view())
            .map(|stored| stored.new_view_number);
        if stored_target.is_some_and(|target| target > cv.new_view_number) {
            debug!(
                "ignoring ChangeView from {index} to view {}: already asked for view {:?}",
                cv.new_view_number, stored_target
            );
            return Ok(());
        }

        info!(
            "received ChangeView from {index} to view {} reason {} at {}",
            cv.new_view_number,
            cv.reason,
            self.context.height_view()
        );
        self.context.change_view_payloads[index] = Some(payload);
        self.check_change_view(cv.new_view_number)
    }

    fn on_prepare_request(&mut self, payload: ConsensusPayload<A::Hash>) -> Result<(), Error> {
        let index = payload.validator();
        if self.context.request_sent_or_received() {
            debug!("ignoring PrepareRequest from {index}: already have one");
            return Ok(());
        }
        if payload.view_number != self.context.view_number || index != self.context.primary_index
        {
            debug!(
                "ignoring PrepareRequest from {index} at view {}: primary is {} at view {}",
                payload.view_number, self.context.primary_index, self.context.view_number
            );
            return Ok(());
        }
        let Some(request) = payload.prepare_request().cloned() else {
            return Ok(());
        };

        if let Err(err) = self.host.verify_prepare_request(&payload) {
            warn!("rejecting PrepareRequest from {index}: {err}");
            return self.send_change_view(ChangeViewReason::BlockRejectedByPolicy);
        }
        let unique = request.transaction_hashes.iter().collect::<HashSet<_>>().len();
        if unique != request.transaction_hashes.len() {
            warn!("rejecting PrepareRequest from {index}: duplicate transactions");
            return self.send_change_view(ChangeViewReason::BlockRejectedByPolicy);
        }

        info!(
            "received PrepareRequest from {index} with {} transactions at {}",
            request.transaction_hashes.len(),
            self.context.height_view()
        );
        self.extend_timer(2);

        let ctx = &mut self.context;
        ctx.timestamp = request.timestamp;
        ctx.nonce = request.nonce;
        ctx.next_consensus = Some(request.next_consensus);
        ctx.transaction_hashes = Some(request.transaction_hashes);
        ctx.transactions.clear();
        ctx.missing_transactions.clear();

        self.process_missing_tx();
        self.update_existing_payloads(&payload);
        self.context.preparation_payloads[index] = Some(payload);

        if !self.context.has_all_transactions() || !self.create_and_check_block()? {
            return Ok(());
        }
        if self.watch_only() {
            return Ok(());
        }
        self.extend_timer(2);
        // A primary that gets its own request back only stores it.
        if !self.context.is_primary() {
            self.send_prepare_response();
        }
        self.check_prepare()
    }

    fn process_missing_tx(&mut self) {
        let hashes = self.context.transaction_hashes.clone().unwrap_or_default();
        let mut missing = Vec::new();
        for hash in hashes {
            match self.host.get_tx(&hash) {
                Some(tx) => {
                    self.context.transactions.insert(hash, tx);
                }
                None => missing.push(hash),
            }
        }
        if !missing.is_empty() {
            debug!(
                "missing {} transactions at {}, requesting",
                missing.len(),
                self.context.height_view()
            );
            self.host.request_tx(&missing);
        }
        self.context.missing_transactions = missing;
    }

    /// Drops responses to a different request and re-checks everything that
    /// could only be trusted provisionally before the request was known.
    fn update_existing_payloads(&mut self, request: &ConsensusPayload<A::Hash>) {
        let preparation_hash = self.host.payload_hash(request);
        for (index, slot) in self.context.preparation_payloads.iter_mut().enumerate() {
            let mismatch = slot
                .as_ref()
                .and_then(|p| p.prepare_response())
                .is_some_and(|resp| resp.preparation_hash != preparation_hash);
            if mismatch {
                debug!("dropping PrepareResponse from {index}: different preparation hash");
                *slot = None;
            }
        }
        self.verify_commits_against_header();
        if self.anti_mev_active() {
            self.verify_pre_commits_against_pre_header();
        }
    }

    fn on_prepare_response(&mut self, payload: ConsensusPayload<A::Hash>) -> Result<(), Error> {
        let index = payload.validator();
        if payload.view_number != self.context.view_number {
            debug!(
                "ignoring PrepareResponse from {index} for view {}",
                payload.view_number
            );
            return Ok(());
        }
        if index == self.context.primary_index {
            debug!("ignoring PrepareResponse from primary {index}");
            return Ok(());
        }
        if self.context.preparation_payloads[index].is_some() {
            debug!("ignoring duplicate PrepareResponse from {index}");
            return Ok(());
        }
        if self.view_changing() && !self.context.more_than_f_nodes_committed_or_lost() {
            debug!("ignoring PrepareResponse from {index} while changing view");
            return Ok(());
        }
        if let Err(err) = self.host.verify_prepare_response(&payload) {
            warn!("invalid PrepareResponse from {index}: {err}");
            return Ok(());
        }
        let Some(preparation_hash) = payload.prepare_response().map(|r| r.preparation_hash) else {
            return Ok(());
        };
        if let Some(request) = &self.context.preparation_payloads[self.context.primary_index] {
            if self.host.payload_hash(request) != preparation_hash {
                warn!("PrepareResponse from {index} acknowledges a different PrepareRequest");
                return Ok(());
            }
        }

        info!(
            "received PrepareResponse from {index} at {}",
            self.context.height_view()
        );
        self.context.preparation_payloads[index] = Some(payload);

        if self.context.is_primary() && !self.recovering {
            if let Some(sent) = self.context.prepare_sent_time {
                let rtt = self.now().duration_since(sent).unwrap_or_default();
                self.rtt.add_time(rtt);
            }
        }

        self.extend_timer(2);
        if !self.watch_only() && !self.is_locked() && self.context.request_sent_or_received() {
            self.check_prepare()?;
        }
        Ok(())
    }

    /// Keeps the first payload from a validator; a different one is recorded
    /// as equivocation. Returns `true` if a payload was already present.
    fn check_existing(&mut self, payload: &ConsensusPayload<A::Hash>, kind: EvidenceKind) -> bool {
        let slots = match kind {
            EvidenceKind::ConflictingCommit => &self.context.commit_payloads,
            EvidenceKind::ConflictingPreCommit => &self.context.pre_commit_payloads,
        };
        let Some(existing) = &slots[payload.validator()] else {
            return false;
        };
        let existing_hash = self.host.payload_hash(existing);
        let hash = self.host.payload_hash(payload);
        if existing_hash != hash {
            warn!(
                "{kind} from validator {} at height {}: keeping {existing_hash} (view {}), \
                 rejecting {hash} (view {})",
                payload.validator_index,
                payload.height,
                existing.view_number,
                payload.view_number
            );
            self.evidence.report(EquivocationEvidence {
                validator_index: payload.validator_index,
                height: payload.height,
                kind,
                first: (existing.view_number, existing_hash),
                second: (payload.view_number, hash),
            });
        }
        true
    }

    fn on_pre_commit(&mut self, payload: ConsensusPayload<A::Hash>) -> Result<(), Error> {
        let index = payload.validator();
        if !self.anti_mev_active() {
            debug!(
                "dropping PreCommit from {index}: extension inactive at height {}",
                self.context.block_index
            );
            return Ok(());
        }
        if self.check_existing(&payload, EvidenceKind::ConflictingPreCommit) {
            return Ok(());
        }
        if payload.view_number != self.context.view_number {
            debug!(
                "received PreCommit from {index} for view {}",
                payload.view_number
            );
            self.context.pre_commit_payloads[index] = Some(payload);
            return Ok(());
        }
        if let Err(err) = self.host.verify_pre_commit(&payload) {
            warn!("invalid PreCommit from {index}: {err}");
            return Ok(());
        }

        info!(
            "received PreCommit from {index} at {}",
            self.context.height_view()
        );
        self.extend_timer(4);
        let data = payload
            .pre_commit()
            .map(|pc| pc.data.clone())
            .unwrap_or_default();
        self.context.pre_commit_payloads[index] = Some(payload);

        if !self.make_pre_header() {
            // Verified once the PrepareRequest arrives.
            return Ok(());
        }
        let valid = match (
            self.pre_block_hooks.as_ref(),
            self.context.pre_header.as_ref(),
            self.context.validator(index),
        ) {
            (Some(hooks), Some(pre_header), Some(key)) => {
                hooks.verify_pre_commit_data(pre_header, key, &data)
            }
            _ => false,
        };
        if valid {
            return self.check_pre_commit();
        }
        warn!("invalid PreCommit data from {index}");
        self.context.pre_commit_payloads[index] = None;
        Ok(())
    }

    fn on_commit(&mut self, payload: ConsensusPayload<A::Hash>) -> Result<(), Error> {
        let index = payload.validator();
        if self.check_existing(&payload, EvidenceKind::ConflictingCommit) {
            return Ok(());
        }
        if payload.view_number != self.context.view_number {
            debug!(
                "received Commit from {index} for view {}",
                payload.view_number
            );
            self.context.commit_payloads[index] = Some(payload);
            return Ok(());
        }
        if let Err(err) = self.host.verify_commit(&payload) {
            warn!("invalid Commit from {index}: {err}");
            return Ok(());
        }

        info!(
            "received Commit from {index} at {}",
            self.context.height_view()
        );
        self.extend_timer(4);
        let signature = payload
            .commit()
            .map(|c| c.signature.clone())
            .unwrap_or_default();
        self.context.commit_payloads[index] = Some(payload);

        if !self.make_header() {
            // Verified once the header can be built.
            return Ok(());
        }
        let valid = match (
            self.context.header.as_ref(),
            self.context.validator(index),
        ) {
            (Some(header), Some(key)) => self.host.verify_block_signature(header, key, &signature),
            _ => false,
        };
        if valid {
            return self.check_commit();
        }
        warn!("invalid Commit signature from {index}");
        self.context.commit_payloads[index] = None;
        Ok(())
    }

    fn on_recovery_request(&mut self, payload: &ConsensusPayload<A::Hash>) -> Result<(), Error> {
        if !self.is_locked() {
            // Only F + 1 validators following the requester answer it.
            let Some(my_index) = self.context.my_index else {
                return Ok(());
            };
            let n = self.context.n();
            let sender = payload.validator();
            let assigned = (1..=self.context.f() + 1).any(|i| (sender + i) % n == my_index);
            if !assigned {
                trace!("not answering recovery request from {sender}");
                return Ok(());
            }
        }
        debug!(
            "answering {} from {} with recovery",
            payload.message_type(),
            payload.validator_index
        );
        self.send_recovery_message();
        Ok(())
    }

    fn on_recovery_message(&mut self, payload: &ConsensusPayload<A::Hash>) -> Result<(), Error> {
        self.recovering = true;
        let result = self.replay_recovery_message(payload);
        self.recovering = false;
        result
    }

    fn replay_recovery_message(&mut self, payload: &ConsensusPayload<A::Hash>) -> Result<(), Error> {
        let Message::RecoveryMessage(recovery) = &payload.message else {
            return Ok(());
        };
        let height = payload.height;
        let view = payload.view_number;
        info!(
            "received RecoveryMessage from {} at view {view}: {} change views, {} preparations, \
             {} pre-commits, {} commits",
            payload.validator_index,
            recovery.change_views.len(),
            recovery.preparations.len() + usize::from(recovery.prepare_request.is_some()),
            recovery.pre_commits.len(),
            recovery.commits.len()
        );

        if view > self.context.view_number && !self.is_locked() {
            for cv in recovery.change_view_payloads(height) {
                self.on_receive(cv)?;
            }
        }

        if view == self.context.view_number
            && !(self.view_changing() && !self.context.more_than_f_nodes_committed_or_lost())
            && !self.is_locked()
        {
            let primary = u16::try_from(self.context.get_primary_index(view)).unwrap_or(u16::MAX);
            let request = recovery.prepare_request_payload(height, view, primary);
            let preparation_hash = match &request {
                Some(request) => Some(self.host.payload_hash(request)),
                None => recovery.preparation_hash,
            };
            if let Some(request) = request {
                if !self.context.request_sent_or_received() {
                    self.on_receive(request)?;
                }
            }
            if let Some(preparation_hash) = preparation_hash {
                for response in recovery.prepare_response_payloads(height, view, &preparation_hash) {
                    self.on_receive(response)?;
                }
            }
        }

        if view <= self.context.view_number {
            for pre_commit in recovery.pre_commit_payloads(height) {
                self.on_receive(pre_commit)?;
            }
            for commit in recovery.commit_payloads(height) {
                self.on_receive(commit)?;
            }
        }
        Ok(())
    }
}
