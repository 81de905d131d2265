//! Consensus messages and the payload envelope that carries them.

use {
    crate::{recovery::RecoveryMessage, types::HeightView},
    std::fmt,
};

/// Wire-level message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    ChangeView = 0x00,
    PrepareRequest = 0x20,
    PrepareResponse = 0x21,
    Commit = 0x30,
    PreCommit = 0x31,
    RecoveryRequest = 0x40,
    RecoveryMessage = 0x41,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChangeView => "ChangeView",
            Self::PrepareRequest => "PrepareRequest",
            Self::PrepareResponse => "PrepareResponse",
            Self::Commit => "Commit",
            Self::PreCommit => "PreCommit",
            Self::RecoveryRequest => "RecoveryRequest",
            Self::RecoveryMessage => "RecoveryMessage",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0x00 => Self::ChangeView,
            0x20 => Self::PrepareRequest,
            0x21 => Self::PrepareResponse,
            0x30 => Self::Commit,
            0x31 => Self::PreCommit,
            0x40 => Self::RecoveryRequest,
            0x41 => Self::RecoveryMessage,
            other => return Err(other),
        })
    }
}

/// Why a validator asks to leave the current view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChangeViewReason {
    #[default]
    Timeout = 0x00,
    ChangeAgreement = 0x01,
    TxNotFound = 0x02,
    TxRejectedByPolicy = 0x03,
    TxInvalid = 0x04,
    BlockRejectedByPolicy = 0x05,
    Unknown = 0xff,
}

impl From<u8> for ChangeViewReason {
    fn from(code: u8) -> Self {
        match code {
            0x00 => Self::Timeout,
            0x01 => Self::ChangeAgreement,
            0x02 => Self::TxNotFound,
            0x03 => Self::TxRejectedByPolicy,
            0x04 => Self::TxInvalid,
            0x05 => Self::BlockRejectedByPolicy,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ChangeViewReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timeout => "Timeout",
            Self::ChangeAgreement => "ChangeAgreement",
            Self::TxNotFound => "TxNotFound",
            Self::TxRejectedByPolicy => "TxRejectedByPolicy",
            Self::TxInvalid => "TxInvalid",
            Self::BlockRejectedByPolicy => "BlockRejectedByPolicy",
            Self::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeView {
    pub new_view_number: u8,
    /// Milliseconds.
    pub timestamp: u64,
    pub reason: ChangeViewReason,
}

/// Block proposal sent by the primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareRequest<H> {
    /// Milliseconds.
    pub timestamp: u64,
    pub nonce: u64,
    pub next_consensus: H,
    pub transaction_hashes: Vec<H>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareResponse<H> {
    /// Payload hash of the PrepareRequest being acknowledged.
    pub preparation_hash: H,
}

/// Opaque data produced from the pre-block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreCommit {
    pub data: Vec<u8>,
}

/// Signature over the block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryRequest {
    /// Milliseconds.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message<H> {
    ChangeView(ChangeView),
    PrepareRequest(PrepareRequest<H>),
    PrepareResponse(PrepareResponse<H>),
    PreCommit(PreCommit),
    Commit(Commit),
    RecoveryRequest(RecoveryRequest),
    RecoveryMessage(RecoveryMessage<H>),
}

impl<H> Message<H> {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ChangeView(_) => MessageType::ChangeView,
            Self::PrepareRequest(_) => MessageType::PrepareRequest,
            Self::PrepareResponse(_) => MessageType::PrepareResponse,
            Self::PreCommit(_) => MessageType::PreCommit,
            Self::Commit(_) => MessageType::Commit,
            Self::RecoveryRequest(_) => MessageType::RecoveryRequest,
            Self::RecoveryMessage(_) => MessageType::RecoveryMessage,
        }
    }
}

/// Envelope for a consensus message.
///
/// The payload hash (computed by the host) covers the type, height, view and
/// body but not `validator_index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusPayload<H> {
    pub validator_index: u16,
    pub height: u32,
    pub view_number: u8,
    pub message: Message<H>,
}

impl<H> ConsensusPayload<H> {
    pub fn new(validator_index: u16, height: u32, view_number: u8, message: Message<H>) -> Self {
        Self {
            validator_index,
            height,
            view_number,
            message,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }

    pub fn height_view(&self) -> HeightView {
        HeightView::new(self.height, self.view_number)
    }

    pub fn validator(&self) -> usize {
        usize::from(self.validator_index)
    }

    pub fn change_view(&self) -> Option<&ChangeView> {
        match &self.message {
            Message::ChangeView(cv) => Some(cv),
            _ => None,
        }
    }

    pub fn prepare_request(&self) -> Option<&PrepareRequest<H>> {
        match &self.message {
            Message::PrepareRequest(req) => Some(req),
            _ => None,
        }
    }

    pub fn prepare_response(&self) -> Option<&PrepareResponse<H>> {
        match &self.message {
            Message::PrepareResponse(resp) => Some(resp),
            _ => None,
        }
    }

    pub fn pre_commit(&self) -> Option<&PreCommit> {
        match &self.message {
            Message::PreCommit(pc) => Some(pc),
            _ => None,
        }
    }

    pub fn commit(&self) -> Option<&Commit> {
        match &self.message {
            Message::Commit(c) => Some(c),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, test_case::test_case};

    #[test_case(MessageType::ChangeView, 0x00)]
    #[test_case(MessageType::PrepareRequest, 0x20)]
    #[test_case(MessageType::PrepareResponse, 0x21)]
    #[test_case(MessageType::Commit, 0x30)]
    #[test_case(MessageType::PreCommit, 0x31)]
    #[test_case(MessageType::RecoveryRequest, 0x40)]
    #[test_case(MessageType::RecoveryMessage, 0x41)]
    fn test_message_type_codes(message_type: MessageType, code: u8) {
        assert_eq!(message_type as u8, code);
        assert_eq!(MessageType::try_from(code), Ok(message_type));
    }

    #[test]
    fn test_unknown_message_type_code() {
        assert_eq!(MessageType::try_from(0x22), Err(0x22));
    }

    #[test]
    fn test_change_view_reason_codes() {
        assert_eq!(ChangeViewReason::from(0x05), ChangeViewReason::BlockRejectedByPolicy);
        assert_eq!(ChangeViewReason::from(0x42), ChangeViewReason::Unknown);
        assert_eq!(ChangeViewReason::TxNotFound as u8, 0x02);
        assert_eq!(ChangeViewReason::default(), ChangeViewReason::Timeout);
    }

    #[test]
    fn test_payload_accessors() {
        let payload: ConsensusPayload<[u8; 4]> = ConsensusPayload::new(
            2,
            10,
            1,
            Message::Commit(Commit {
                signature: vec![1, 2, 3],
            }),
        );
        assert_eq!(payload.message_type(), MessageType::Commit);
        assert_eq!(payload.height_view(), HeightView::new(10, 1));
        assert_eq!(payload.validator(), 2);
        assert!(payload.commit().is_some());
        assert!(payload.change_view().is_none());
        assert!(payload.prepare_request().is_none());
    }
}
