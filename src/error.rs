use thiserror::Error;

/// Broad class of a [`NetError`], used by callers to decide what to do with
/// the connection that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller bug on the sending side. Fatal to the call, never retried.
    Contract,
    /// Malformed or mismatched peer. The connection is desynchronized.
    Protocol,
    /// A type with no codec path. Integration defect.
    Unsupported,
    /// The byte channel itself failed.
    Transport,
}

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Member '{0}' is not nullable but holds no value")]
    NullInNonNullable(String),

    #[error("Enum {name} has {count} enumerators, ordinal {ordinal} is out of range")]
    EnumOutOfRange { name: String, ordinal: u64, count: usize },

    #[error("Value {value} does not fit in {width} byte(s)")]
    ValueOutOfRange { value: u64, width: usize },

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("RPC argument mismatch for {rpc}: {reason}")]
    ArgumentMismatch { rpc: String, reason: String },

    #[error("Unknown RPC name: {0}")]
    UnknownRpcName(String),

    #[error("No handler bound for RPC {0}")]
    UnboundRpc(String),

    #[error("Member index {index} out of range for {type_name}")]
    MemberOutOfRange { type_name: String, index: usize },

    #[error("Unexpected end of buffer: needed {needed} byte(s), {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("Unknown RPC id: {0}")]
    UnknownRpc(u8),

    #[error("RPC {name} executes on the {expected:?} but this peer is the {actual:?}")]
    WrongPeerRole {
        name: String,
        expected: crate::rpc::PeerRole,
        actual: crate::rpc::PeerRole,
    },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Length {length} exceeds limit {limit}")]
    LengthLimitExceeded { length: usize, limit: usize },

    #[error("Nesting depth {depth} exceeds limit {limit}")]
    NestingTooDeep { depth: usize, limit: usize },

    #[error("Unknown state {type_name}#{id}")]
    UnknownState { type_name: String, id: u32 },

    #[error("Peer registry does not match the local registry")]
    RegistryMismatch,

    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    #[error("Type {type_name} has {count} members, at most {max} are supported")]
    TooManyMembers { type_name: String, count: usize, max: usize },

    #[error("At most {max} RPCs are supported")]
    TooManyRpcs { max: usize },

    #[error("Type {0} is already registered with a different descriptor")]
    DuplicateType(String),

    #[error("RPC {0} is already registered")]
    DuplicateRpc(String),

    #[error("Type {0} has no u32 Id member")]
    MissingIdMember(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),
}

impl NetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetError::TypeMismatch { .. }
            | NetError::NullInNonNullable(_)
            | NetError::EnumOutOfRange { .. }
            | NetError::ValueOutOfRange { .. }
            | NetError::InvalidValue(_)
            | NetError::ArgumentMismatch { .. }
            | NetError::UnknownRpcName(_)
            | NetError::UnboundRpc(_)
            | NetError::MemberOutOfRange { .. } => ErrorKind::Contract,

            NetError::UnexpectedEof { .. }
            | NetError::UnknownRpc(_)
            | NetError::WrongPeerRole { .. }
            | NetError::InvalidMessage(_)
            | NetError::LengthLimitExceeded { .. }
            | NetError::NestingTooDeep { .. }
            | NetError::UnknownState { .. }
            | NetError::RegistryMismatch
            | NetError::Bincode(_) => ErrorKind::Protocol,

            NetError::UnsupportedType(_)
            | NetError::TooManyMembers { .. }
            | NetError::TooManyRpcs { .. }
            | NetError::DuplicateType(_)
            | NetError::DuplicateRpc(_)
            | NetError::MissingIdMember(_)
            | NetError::Json(_) => ErrorKind::Unsupported,

            NetError::Transport(_) | NetError::ConnectionClosed | NetError::Io(_) => {
                ErrorKind::Transport
            }
        }
    }

    /// True when the connection that produced this error can no longer be
    /// trusted and must be torn down.
    pub fn is_desync(&self) -> bool {
        matches!(self.kind(), ErrorKind::Protocol | ErrorKind::Transport)
    }

    pub(crate) fn mismatch(expected: impl ToString, actual: impl ToString) -> Self {
        NetError::TypeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, NetError>;
