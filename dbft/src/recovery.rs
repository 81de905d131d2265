//! Compact recovery message.
//!
//! A recovery message carries just enough of every known preparation,
//! change-view, pre-commit and commit payload for a lagging validator to
//! rebuild them. Rebuilt payloads are fed through the normal receive path.

use crate::message::{
    ChangeView, ChangeViewReason, Commit, ConsensusPayload, Message, PreCommit, PrepareRequest,
    PrepareResponse,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeViewCompact {
    pub validator_index: u16,
    pub original_view_number: u8,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparationCompact {
    pub validator_index: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreCommitCompact {
    pub validator_index: u16,
    pub view_number: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitCompact {
    pub validator_index: u16,
    pub view_number: u8,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryMessage<H> {
    pub change_views: Vec<ChangeViewCompact>,
    pub prepare_request: Option<PrepareRequest<H>>,
    /// Hash the PrepareResponses acknowledge, kept for when the request
    /// itself is not included.
    pub preparation_hash: Option<H>,
    pub preparations: Vec<PreparationCompact>,
    pub pre_commits: Vec<PreCommitCompact>,
    pub commits: Vec<CommitCompact>,
}

impl<H> Default for RecoveryMessage<H> {
    fn default() -> Self {
        Self {
            change_views: Vec::new(),
            prepare_request: None,
            preparation_hash: None,
            preparations: Vec::new(),
            pre_commits: Vec::new(),
            commits: Vec::new(),
        }
    }
}

impl<H: Clone> RecoveryMessage<H> {
    /// Record `payload` in compact form. Recovery requests and nested recovery
    /// messages are not recorded.
    pub fn add_payload(&mut self, payload: &ConsensusPayload<H>) {
        match &payload.message {
            Message::ChangeView(cv) => self.change_views.push(ChangeViewCompact {
                validator_index: payload.validator_index,
                original_view_number: payload.view_number,
                timestamp: cv.timestamp,
            }),
            Message::PrepareRequest(req) => self.prepare_request = Some(req.clone()),
            Message::PrepareResponse(resp) => {
                if self.preparation_hash.is_none() {
                    self.preparation_hash = Some(resp.preparation_hash.clone());
                }
                self.preparations.push(PreparationCompact {
                    validator_index: payload.validator_index,
                });
            }
            Message::PreCommit(pc) => self.pre_commits.push(PreCommitCompact {
                validator_index: payload.validator_index,
                view_number: payload.view_number,
                data: pc.data.clone(),
            }),
            Message::Commit(c) => self.commits.push(CommitCompact {
                validator_index: payload.validator_index,
                view_number: payload.view_number,
                signature: c.signature.clone(),
            }),
            Message::RecoveryRequest(_) | Message::RecoveryMessage(_) => {}
        }
    }

    /// ChangeView payloads, each at its original view and targeting the next.
    pub fn change_view_payloads(&self, height: u32) -> Vec<ConsensusPayload<H>> {
        self.change_views
            .iter()
            .map(|cv| {
                ConsensusPayload::new(
                    cv.validator_index,
                    height,
                    cv.original_view_number,
                    Message::ChangeView(ChangeView {
                        new_view_number: cv.original_view_number.saturating_add(1),
                        timestamp: cv.timestamp,
                        reason: ChangeViewReason::Timeout,
                    }),
                )
            })
            .collect()
    }

    /// The PrepareRequest as sent by `primary_index` at `view`.
    pub fn prepare_request_payload(
        &self,
        height: u32,
        view: u8,
        primary_index: u16,
    ) -> Option<ConsensusPayload<H>> {
        self.prepare_request.as_ref().map(|req| {
            ConsensusPayload::new(
                primary_index,
                height,
                view,
                Message::PrepareRequest(req.clone()),
            )
        })
    }

    /// PrepareResponses acknowledging `preparation_hash`.
    pub fn prepare_response_payloads(
        &self,
        height: u32,
        view: u8,
        preparation_hash: &H,
    ) -> Vec<ConsensusPayload<H>> {
        self.preparations
            .iter()
            .map(|p| {
                ConsensusPayload::new(
                    p.validator_index,
                    height,
                    view,
                    Message::PrepareResponse(PrepareResponse {
                        preparation_hash: preparation_hash.clone(),
                    }),
                )
            })
            .collect()
    }

    pub fn pre_commit_payloads(&self, height: u32) -> Vec<ConsensusPayload<H>> {
        self.pre_commits
            .iter()
            .map(|pc| {
                ConsensusPayload::new(
                    pc.validator_index,
                    height,
                    pc.view_number,
                    Message::PreCommit(PreCommit {
                        data: pc.data.clone(),
                    }),
                )
            })
            .collect()
    }

    pub fn commit_payloads(&self, height: u32) -> Vec<ConsensusPayload<H>> {
        self.commits
            .iter()
            .map(|c| {
                ConsensusPayload::new(
                    c.validator_index,
                    height,
                    c.view_number,
                    Message::Commit(Commit {
                        signature: c.signature.clone(),
                    }),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::message::RecoveryRequest};

    type H = [u8; 2];

    fn make_request() -> PrepareRequest<H> {
        PrepareRequest {
            timestamp: 1_000,
            nonce: 7,
            next_consensus: [9, 9],
            transaction_hashes: vec![[1, 1], [2, 2]],
        }
    }

    fn make_recovery() -> RecoveryMessage<H> {
        let mut rec = RecoveryMessage::default();
        rec.add_payload(&ConsensusPayload::new(
            3,
            20,
            0,
            Message::ChangeView(ChangeView {
                new_view_number: 1,
                timestamp: 500,
                reason: ChangeViewReason::TxNotFound,
            }),
        ));
        rec.add_payload(&ConsensusPayload::new(
            1,
            20,
            1,
            Message::PrepareRequest(make_request()),
        ));
        rec.add_payload(&ConsensusPayload::new(
            2,
            20,
            1,
            Message::PrepareResponse(PrepareResponse {
                preparation_hash: [4, 4],
            }),
        ));
        rec.add_payload(&ConsensusPayload::new(
            2,
            20,
            1,
            Message::Commit(Commit {
                signature: vec![5; 4],
            }),
        ));
        rec.add_payload(&ConsensusPayload::new(
            0,
            20,
            0,
            Message::PreCommit(PreCommit { data: vec![6] }),
        ));
        rec.add_payload(&ConsensusPayload::new(
            0,
            20,
            1,
            Message::RecoveryRequest(RecoveryRequest { timestamp: 1 }),
        ));
        rec
    }

    #[test]
    fn test_add_payload_records_compact_entries() {
        let rec = make_recovery();
        assert_eq!(rec.change_views.len(), 1);
        assert_eq!(rec.change_views[0].original_view_number, 0);
        assert_eq!(rec.prepare_request, Some(make_request()));
        assert_eq!(rec.preparation_hash, Some([4, 4]));
        assert_eq!(rec.preparations, vec![PreparationCompact { validator_index: 2 }]);
        assert_eq!(rec.commits.len(), 1);
        assert_eq!(rec.pre_commits.len(), 1);
    }

    #[test]
    fn test_change_views_target_next_view() {
        let payloads = make_recovery().change_view_payloads(20);
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].validator_index, 3);
        assert_eq!(payloads[0].view_number, 0);
        assert_eq!(payloads[0].change_view().map(|cv| cv.new_view_number), Some(1));
    }

    #[test]
    fn test_prepare_payloads_use_given_primary_and_hash() {
        let rec = make_recovery();
        let req = rec.prepare_request_payload(20, 1, 1).unwrap();
        assert_eq!(req.validator_index, 1);
        assert_eq!(req.prepare_request(), Some(&make_request()));

        let responses = rec.prepare_response_payloads(20, 1, &[8, 8]);
        assert_eq!(responses.len(), 1);
        assert_eq!(
            responses[0].prepare_response().map(|r| r.preparation_hash),
            Some([8, 8])
        );
    }

    #[test]
    fn test_commits_keep_their_views() {
        let rec = make_recovery();
        let commits = rec.commit_payloads(20);
        assert_eq!(commits[0].view_number, 1);
        assert_eq!(commits[0].commit().map(|c| c.signature.len()), Some(4));
        let pre_commits = rec.pre_commit_payloads(20);
        assert_eq!(pre_commits[0].view_number, 0);
        assert_eq!(pre_commits[0].height, 20);
    }

    #[test]
    fn test_empty_recovery_without_request() {
        let rec: RecoveryMessage<H> = RecoveryMessage::default();
        assert!(rec.prepare_request_payload(1, 0, 0).is_none());
        assert!(rec.change_view_payloads(1).is_empty());
    }
}
