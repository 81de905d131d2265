//! Equivocation evidence.
//!
//! A validator must not sign two different Commits (or PreCommits) for the
//! same height. The engine keeps the first payload it saw in the validator's
//! slot and reports the conflicting one here, so the host can act on it.

use std::{collections::HashSet, fmt};

/// Evidence of a validator sending two different payloads of the same kind
/// for one height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EquivocationEvidence<H> {
    /// Index of the offending validator in the height's validator list.
    pub validator_index: u16,
    pub height: u32,
    pub kind: EvidenceKind,
    /// View and payload hash of the first payload seen (the one retained).
    pub first: (u8, H),
    /// View and payload hash of the conflicting payload.
    pub second: (u8, H),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvidenceKind {
    ConflictingCommit,
    ConflictingPreCommit,
}

impl fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvidenceKind::ConflictingCommit => write!(f, "ConflictingCommit"),
            EvidenceKind::ConflictingPreCommit => write!(f, "ConflictingPreCommit"),
        }
    }
}

/// Collects equivocation evidence, one entry per (height, validator, kind).
#[derive(Debug)]
pub struct EvidenceCollector<H> {
    evidence: Vec<EquivocationEvidence<H>>,
    reported: HashSet<(u32, u16, EvidenceKind)>,
}

impl<H> EvidenceCollector<H> {
    pub fn new() -> Self {
        Self {
            evidence: Vec::new(),
            reported: HashSet::new(),
        }
    }

    /// Records `evidence`. Returns `false` if the same offence at the same
    /// height was already recorded.
    pub fn report(&mut self, evidence: EquivocationEvidence<H>) -> bool {
        let key = (evidence.height, evidence.validator_index, evidence.kind);
        if !self.reported.insert(key) {
            return false;
        }
        self.evidence.push(evidence);
        true
    }

    /// Drops offences and collected evidence below `min_height`.
    pub fn prune(&mut self, min_height: u32) {
        self.reported.retain(|(height, _, _)| *height >= min_height);
        self.evidence.retain(|e| e.height >= min_height);
    }

    pub fn evidence(&self) -> &[EquivocationEvidence<H>] {
        &self.evidence
    }

    pub fn drain_evidence(&mut self) -> Vec<EquivocationEvidence<H>> {
        std::mem::take(&mut self.evidence)
    }

    pub fn has_evidence_against(&self, validator_index: u16) -> bool {
        self.evidence
            .iter()
            .any(|e| e.validator_index == validator_index)
    }
}

impl<H> Default for EvidenceCollector<H> {
    fn default() -> Self {
        Self::new()
    }
}
