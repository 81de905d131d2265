//! Quorum checks that move the round forward.

use {
    super::Dbft,
    crate::{
        error::Error,
        host::Host,
        message::ChangeViewReason,
        timer::Timer,
        types::Block,
    },
    log::*,
};

impl<A: Host, T: Timer> Dbft<A, T> {
    /// M preparations with the PrepareRequest among them: pre-commit (or
    /// commit when the extension is inactive).
    pub(super) fn check_prepare(&mut self) -> Result<(), Error> {
        if !self.context.has_all_transactions() {
            return Ok(());
        }
        let ctx = &self.context;
        let has_request = ctx
            .preparation_payloads
            .get(ctx.primary_index)
            .and_then(Option::as_ref)
            .is_some_and(|p| p.prepare_request().is_some() && p.view_number == ctx.view_number);
        let count = ctx.count_at_current_view(&ctx.preparation_payloads);
        if !has_request || count < ctx.m() {
            return Ok(());
        }

        debug!(
            "preparation quorum at {} ({count}/{})",
            ctx.height_view(),
            ctx.n()
        );
        let time_per_block = self.config.time_per_block;
        if self.anti_mev_active() {
            self.send_pre_commit();
            self.change_timer(time_per_block);
            self.check_pre_commit()
        } else {
            self.send_commit();
            self.change_timer(time_per_block);
            self.check_commit()
        }
    }

    /// M pre-commits: process the pre-block, then commit to the final header.
    pub(super) fn check_pre_commit(&mut self) -> Result<(), Error> {
        if !self.context.has_all_transactions() {
            return Ok(());
        }
        let count = self
            .context
            .count_at_current_view(&self.context.pre_commit_payloads);
        if count < self.context.m() {
            return Ok(());
        }

        if !self.context.pre_block_processed {
            if !self.create_pre_block() {
                return Ok(());
            }
            let (Some(hooks), Some(pre_block)) = (
                self.pre_block_hooks.as_mut(),
                self.context.pre_block.as_ref(),
            ) else {
                return Ok(());
            };
            if let Err(err) = hooks.process_pre_block(pre_block, &self.context) {
                warn!(
                    "cannot process pre-block at {} with {count} pre-commits: {err}",
                    self.context.height_view()
                );
                return Ok(());
            }
            self.context.pre_block_processed = true;
            info!("pre-block processed at {}", self.context.height_view());
        }

        if !self.context.pre_commit_sent() {
            debug!("pre-commit quorum at {} before own PreCommit", self.context.height_view());
            return Ok(());
        }
        if self.context.commit_sent() {
            return Ok(());
        }
        self.verify_commits_against_header();
        self.send_commit();
        self.change_timer(self.config.time_per_block);
        self.check_commit()
    }

    /// M commits at the current view: build, persist and accept the block.
    /// Runs at most once per height.
    pub(super) fn check_commit(&mut self) -> Result<(), Error> {
        if !self.context.has_all_transactions() || self.context.block_sent() {
            return Ok(());
        }
        let count = self
            .context
            .count_at_current_view(&self.context.commit_payloads);
        if count < self.context.m() {
            return Ok(());
        }

        let height = self.context.block_index;
        self.context.last_block_index = Some(height);
        self.context.last_block_time = Some(self.now());

        if !self.create_block() {
            warn!("commit quorum at {} but the block cannot be built", self.context.height_view());
            return Ok(());
        }
        let Some(block) = self.context.block.as_ref() else {
            return Ok(());
        };
        let hash = block.hash();
        info!(
            "approving block {hash} at height {height} view {} with {} transactions",
            self.context.view_number,
            block.transactions().len()
        );
        if let Err(err) = self.host.process_block(block) {
            if self.anti_mev_active() {
                warn!(
                    "failed to process block {hash} at height {height}: {err}, \
                     waiting for more commits"
                );
                return Ok(());
            }
            error!("failed to process block {hash} at height {height}: {err}");
            return Err(Error::BlockProcessing {
                height,
                source: err,
            });
        }
        self.context.block_processed = true;
        Ok(())
    }

    /// M change views targeting `view` or later move this node to `view`.
    pub(super) fn check_change_view(&mut self, view: u8) -> Result<(), Error> {
        if self.context.view_number >= view {
            return Ok(());
        }
        let count = self
            .context
            .change_view_payloads
            .iter()
            .flatten()
            .filter(|p| p.change_view().is_some_and(|cv| cv.new_view_number >= view))
            .count();
        if count < self.context.m() {
            return Ok(());
        }

        if !self.watch_only()
            && self
                .context
                .own_change_view_target()
                .is_some_and(|target| target < view)
        {
            self.send_change_agreement(view);
        }
        info!(
            "changing view {} -> {view} at height {} ({count} change views)",
            self.context.view_number, self.context.block_index
        );
        self.initialize_consensus(view, self.context.last_block_timestamp)
    }

    /// Checks the proposal against the host: next consensus address and
    /// block (or pre-block) validity. A rejected proposal triggers a
    /// ChangeView and returns `false`.
    pub(super) fn create_and_check_block(&mut self) -> Result<bool, Error> {
        let txs = self.context.ordered_transactions();
        let validators = self.host.get_validators(Some(&txs));
        let expected = self.host.consensus_address(&validators);
        if self.context.next_consensus != Some(expected) {
            warn!(
                "proposal at {} has next consensus {:?}, expected {expected}",
                self.context.height_view(),
                self.context.next_consensus
            );
            self.send_change_view(ChangeViewReason::BlockRejectedByPolicy)?;
            return Ok(false);
        }

        let valid = if self.anti_mev_active() {
            self.create_pre_block()
                && match (self.pre_block_hooks.as_ref(), self.context.pre_block.as_ref()) {
                    (Some(hooks), Some(pre_block)) => hooks.verify_pre_block(pre_block),
                    _ => false,
                }
        } else {
            self.create_block()
                && self
                    .context
                    .block
                    .as_ref()
                    .is_some_and(|block| self.host.verify_block(block))
        };
        if !valid {
            warn!("proposal at {} failed verification", self.context.height_view());
            self.send_change_view(ChangeViewReason::TxInvalid)?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Drops same-view commits whose signature does not match the header.
    pub(super) fn verify_commits_against_header(&mut self) {
        if !self.make_header() {
            return;
        }
        let view = self.context.view_number;
        let ctx = &mut self.context;
        let Some(header) = ctx.header.as_ref() else {
            return;
        };
        for (index, slot) in ctx.commit_payloads.iter_mut().enumerate() {
            let Some(payload) = slot.as_ref().filter(|p| p.view_number == view) else {
                continue;
            };
            let valid = match (payload.commit(), ctx.validators.get(index)) {
                (Some(commit), Some(key)) => {
                    self.host
                        .verify_block_signature(header, key, &commit.signature)
                }
                _ => false,
            };
            if !valid {
                warn!("dropping Commit from {index}: signature does not match header");
                *slot = None;
            }
        }
    }

    /// Drops same-view pre-commits whose data does not match the pre-header.
    pub(super) fn verify_pre_commits_against_pre_header(&mut self) {
        if !self.make_pre_header() {
            return;
        }
        let view = self.context.view_number;
        let ctx = &mut self.context;
        let (Some(hooks), Some(pre_header)) = (self.pre_block_hooks.as_ref(), ctx.pre_header.as_ref())
        else {
            return;
        };
        for (index, slot) in ctx.pre_commit_payloads.iter_mut().enumerate() {
            let Some(payload) = slot.as_ref().filter(|p| p.view_number == view) else {
                continue;
            };
            let valid = match (payload.pre_commit(), ctx.validators.get(index)) {
                (Some(pre_commit), Some(key)) => {
                    hooks.verify_pre_commit_data(pre_header, key, &pre_commit.data)
                }
                _ => false,
            };
            if !valid {
                warn!("dropping PreCommit from {index}: data does not match pre-block");
                *slot = None;
            }
        }
    }
}
