//! Cache for messages that arrive ahead of the local node.

use {
    crate::message::{ConsensusPayload, Message},
    log::*,
    std::collections::{BTreeMap, HashMap},
};

/// Messages parked for one height, keyed by validator index.
#[derive(Debug)]
pub struct Inbox<H> {
    pub prepare: BTreeMap<u16, ConsensusPayload<H>>,
    pub change_views: BTreeMap<u16, ConsensusPayload<H>>,
    pub commits: BTreeMap<u16, ConsensusPayload<H>>,
}

impl<H> Default for Inbox<H> {
    fn default() -> Self {
        Self {
            prepare: BTreeMap::new(),
            change_views: BTreeMap::new(),
            commits: BTreeMap::new(),
        }
    }
}

impl<H> Inbox<H> {
    pub fn len(&self) -> usize {
        self.prepare.len() + self.change_views.len() + self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All parked payloads in replay order: preparations, then change views,
    /// then commits.
    pub fn into_payloads(self) -> impl Iterator<Item = ConsensusPayload<H>> {
        self.prepare
            .into_values()
            .chain(self.change_views.into_values())
            .chain(self.commits.into_values())
    }
}

/// Future-height message cache. Each height's inbox is drained exactly once.
#[derive(Debug)]
pub struct MessageCache<H> {
    inboxes: HashMap<u32, Inbox<H>>,
}

impl<H> Default for MessageCache<H> {
    fn default() -> Self {
        Self {
            inboxes: HashMap::new(),
        }
    }
}

impl<H> MessageCache<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Files `payload` under its height. A later message from the same
    /// validator for the same slot replaces the earlier one. Returns `false`
    /// for message types that are never cached.
    pub fn add_message(&mut self, payload: ConsensusPayload<H>) -> bool {
        match payload.message {
            Message::PrepareRequest(_)
            | Message::PrepareResponse(_)
            | Message::ChangeView(_)
            | Message::Commit(_) => {}
            _ => {
                debug!(
                    "not caching {} from validator {} for height {}",
                    payload.message_type(),
                    payload.validator_index,
                    payload.height
                );
                return false;
            }
        }
        let inbox = self.inboxes.entry(payload.height).or_default();
        let slot = match payload.message {
            Message::PrepareRequest(_) | Message::PrepareResponse(_) => &mut inbox.prepare,
            Message::ChangeView(_) => &mut inbox.change_views,
            _ => &mut inbox.commits,
        };
        slot.insert(payload.validator_index, payload);
        true
    }

    /// Removes and returns the inbox for `height`.
    pub fn get_height(&mut self, height: u32) -> Option<Inbox<H>> {
        self.inboxes.remove(&height)
    }

    /// Drops inboxes for heights below `height`; they can never be replayed.
    pub fn prune_below(&mut self, height: u32) {
        self.inboxes.retain(|h, _| *h >= height);
    }

    pub fn len(&self) -> usize {
        self.inboxes.values().map(Inbox::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inboxes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::message::{
            ChangeView, ChangeViewReason, Commit, MessageType, PrepareResponse, RecoveryRequest,
        },
    };

    type H = [u8; 1];

    fn make_payload(validator: u16, height: u32, message: Message<H>) -> ConsensusPayload<H> {
        ConsensusPayload::new(validator, height, 0, message)
    }

    fn make_commit(validator: u16, height: u32, sig: u8) -> ConsensusPayload<H> {
        make_payload(
            validator,
            height,
            Message::Commit(Commit {
                signature: vec![sig],
            }),
        )
    }

    fn make_change_view(validator: u16, height: u32) -> ConsensusPayload<H> {
        make_payload(
            validator,
            height,
            Message::ChangeView(ChangeView {
                new_view_number: 1,
                timestamp: 0,
                reason: ChangeViewReason::Timeout,
            }),
        )
    }

    fn make_response(validator: u16, height: u32) -> ConsensusPayload<H> {
        make_payload(
            validator,
            height,
            Message::PrepareResponse(PrepareResponse {
                preparation_hash: [0],
            }),
        )
    }

    #[test]
    fn test_drain_order_is_prepare_change_view_commit() {
        let mut cache = MessageCache::new();
        cache.add_message(make_commit(0, 5, 1));
        cache.add_message(make_change_view(2, 5));
        cache.add_message(make_response(3, 5));
        cache.add_message(make_response(1, 5));

        let types: Vec<_> = cache
            .get_height(5)
            .unwrap()
            .into_payloads()
            .map(|p| (p.message_type(), p.validator_index))
            .collect();
        assert_eq!(
            types,
            vec![
                (MessageType::PrepareResponse, 1),
                (MessageType::PrepareResponse, 3),
                (MessageType::ChangeView, 2),
                (MessageType::Commit, 0),
            ]
        );
    }

    #[test]
    fn test_height_drained_once() {
        let mut cache = MessageCache::new();
        cache.add_message(make_commit(0, 7, 1));
        assert!(cache.get_height(6).is_none());
        assert_eq!(cache.get_height(7).map(|inbox| inbox.len()), Some(1));
        assert!(cache.get_height(7).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_last_write_wins_per_validator() {
        let mut cache = MessageCache::new();
        cache.add_message(make_commit(0, 3, 1));
        cache.add_message(make_commit(0, 3, 2));
        let inbox = cache.get_height(3).unwrap();
        assert_eq!(inbox.commits.len(), 1);
        assert_eq!(inbox.commits[&0].commit().unwrap().signature, vec![2]);
    }

    #[test]
    fn test_uncached_types_rejected() {
        let mut cache = MessageCache::new();
        let request = make_payload(
            0,
            3,
            Message::RecoveryRequest(RecoveryRequest { timestamp: 0 }),
        );
        assert!(!cache.add_message(request));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_prune_below() {
        let mut cache = MessageCache::new();
        cache.add_message(make_commit(0, 3, 1));
        cache.add_message(make_commit(0, 4, 1));
        cache.add_message(make_commit(0, 5, 1));
        cache.prune_below(4);
        assert_eq!(cache.len(), 2);
        assert!(cache.get_height(3).is_none());
    }
}
