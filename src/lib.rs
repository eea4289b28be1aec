//! Registry-driven binary codec for game state synchronization.
//!
//! Synchronized types are registered once, in a fixed member order, on every
//! peer. Objects are then written as little-endian binary with no embedded
//! type information, updates carry a 32-bit change mask naming the members
//! that follow, and remote procedure calls travel as a one-byte id followed
//! by their arguments.

pub mod macros;
pub mod types;
pub mod primitive;
pub mod value;
pub mod schema;
pub mod codec;
pub mod delta;
pub mod rpc;
pub mod registry;
pub mod protocol;
pub mod snapshot;
pub mod transport;
pub mod sync;
pub mod debug;
pub mod error;

pub use types::{
    Decimal, Vec2, Vec3,
};

pub use primitive::{
    CodecLimits, NetReader, NetWriter,
};

pub use value::{
    CustomValue, MemberShape, NetSerializable, NetValue, Value, WireType,
};

pub use schema::{
    EnumDescriptor, MemberDescriptor, TypeDescriptor, TypeRegistry, TypeRegistryBuilder,
    MAX_MEMBERS,
};

pub use codec::ObjectCodec;

pub use delta::{
    ChangeMask, DeltaCodec, DynamicState, NetState, StateObject,
};

pub use rpc::{
    PeerRole, RpcArgs, RpcCall, RpcDescriptor, RpcDispatcher, RpcHandler, RpcId, RpcRegistry,
    MAX_RPCS,
};

pub use registry::{
    NetRegistry, RegistryManifest,
};

pub use protocol::{
    Channel, Message, MessageType, StateId,
};

pub use snapshot::{
    AppliedDelta, SnapshotCodec, StateSink, StateSource, WorldSnapshot,
};

pub use transport::{
    MemoryTransport, StreamTransport, Transport,
};

pub use sync::{
    apply_typed, ApplyServerState, SyncConfig, SyncEvent, SyncManager, SyncMode, SyncStats,
};

pub use error::{
    ErrorKind, NetError, Result,
};

pub use debug::{
    init_debug_mode, is_debug_enabled, is_trace_enabled,
    log_manifest, log_snapshot, trace_message,
    format_bytes, hex_dump, message_summary,
};
