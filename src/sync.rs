use crate::debug;
use crate::delta::{DynamicState, NetState, StateObject};
use crate::error::{NetError, Result};
use crate::primitive::{CodecLimits, NetReader, NetWriter};
use crate::protocol::{Channel, Message, MessageType, StateId};
use crate::registry::{NetRegistry, RegistryManifest};
use crate::rpc::{PeerRole, RpcArgs, RpcDispatcher, RpcId};
use crate::snapshot::{SnapshotCodec, StateSink, StateSource, WorldSnapshot};
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Every send is a complete snapshot on the state channel.
    Full,
    /// Sends carry only what changed since the previous send.
    Delta,
    /// Nothing is sent by [`SyncManager::send_state`].
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub mode: SyncMode,
    pub sync_interval_ms: u64,
    /// Refuse every message until the peer's registry manifest matched.
    pub require_handshake: bool,
    pub limits: CodecLimits,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Delta,
            sync_interval_ms: 50,
            require_handshake: true,
            limits: CodecLimits::default(),
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON object; missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_handshake(mut self, required: bool) -> Self {
        self.require_handshake = required;
        self
    }

    pub fn with_limits(mut self, limits: CodecLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }
}

/// Receives server state as its concrete Rust type.
pub trait ApplyServerState<S: NetState> {
    fn apply_server_state(&mut self, state: S) -> Result<()>;
}

/// Converts a decoded state and hands it to `target`.
pub fn apply_typed<S, A>(target: &mut A, state: DynamicState) -> Result<()>
where
    S: NetState,
    A: ApplyServerState<S> + ?Sized,
{
    target.apply_server_state(state.into_typed::<S>()?)
}

#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub full_states_sent: u64,
    pub deltas_sent: u64,
    pub rpcs_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub desyncs: u64,
    pub last_sync: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    ManifestVerified,
    FullState { instances: usize },
    DeltaState { updated: usize, removed: usize },
    FullStateRequested,
    Rpc { id: RpcId, name: &'static str },
}

/// One connection's synchronization session: sends local state and RPCs,
/// and applies what the peer sends.
pub struct SyncManager<T: Transport> {
    transport: T,
    registry: Arc<NetRegistry>,
    role: PeerRole,
    config: SyncConfig,
    sent_baseline: Option<WorldSnapshot>,
    received: Option<WorldSnapshot>,
    peer_verified: bool,
    full_state_requested: bool,
    stats: SyncStats,
}

impl<T: Transport> SyncManager<T> {
    pub fn new(transport: T, registry: Arc<NetRegistry>, role: PeerRole, config: SyncConfig) -> Self {
        Self {
            transport,
            registry,
            role,
            config,
            sent_baseline: None,
            received: None,
            peer_verified: false,
            full_state_requested: false,
            stats: SyncStats::default(),
        }
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn registry(&self) -> &Arc<NetRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    pub fn is_peer_verified(&self) -> bool {
        self.peer_verified
    }

    /// The peer's state as reconstructed from received messages.
    pub fn received_state(&self) -> Option<&WorldSnapshot> {
        self.received.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn close(&mut self) -> Result<()> {
        self.transport.close()
    }

    pub fn should_sync(&self) -> bool {
        if self.config.mode == SyncMode::Manual {
            return false;
        }
        match self.stats.last_sync {
            Some(last) => last.elapsed() >= self.config.sync_interval(),
            None => true,
        }
    }

    pub fn send_manifest(&mut self) -> Result<()> {
        let body = self.registry.manifest().to_bytes()?;
        self.send(Message::manifest(body))
    }

    /// Sends according to the configured mode. A pending full-state request
    /// from the peer is answered first.
    pub fn send_state(&mut self, source: &dyn StateSource) -> Result<()> {
        if self.full_state_requested {
            return self.send_full_state(source);
        }
        match self.config.mode {
            SyncMode::Full => self.send_full_state(source),
            SyncMode::Delta => self.send_delta_state(source).map(|_| ()),
            SyncMode::Manual => Ok(()),
        }
    }

    pub fn send_full_state(&mut self, source: &dyn StateSource) -> Result<()> {
        let snapshot = WorldSnapshot::capture(self.registry.types(), source)?;
        let mut writer = NetWriter::new();
        SnapshotCodec::new(self.registry.types()).encode_full(&snapshot, &mut writer)?;

        self.send(Message::full_state(writer.freeze()))?;

        self.sent_baseline = Some(snapshot);
        self.full_state_requested = false;
        self.stats.full_states_sent += 1;
        self.stats.last_sync = Some(Instant::now());
        Ok(())
    }

    /// Sends changes since the previous send. The first delta is relative to
    /// an empty world. Returns `false` when nothing changed and nothing was
    /// sent.
    pub fn send_delta_state(&mut self, source: &dyn StateSource) -> Result<bool> {
        let types = self.registry.types();
        let current = WorldSnapshot::capture(types, source)?;
        let baseline = self
            .sent_baseline
            .take()
            .unwrap_or_else(|| WorldSnapshot::empty(types));

        let mut writer = NetWriter::new();
        let changes = SnapshotCodec::new(types).encode_delta(&baseline, &current, &mut writer);
        let changes = match changes {
            Ok(changes) => changes,
            Err(e) => {
                self.sent_baseline = Some(baseline);
                return Err(e);
            }
        };

        self.sent_baseline = Some(current);
        self.stats.last_sync = Some(Instant::now());
        if changes == 0 {
            return Ok(false);
        }

        self.send(Message::delta_state(writer.freeze()))?;
        self.stats.deltas_sent += 1;
        Ok(true)
    }

    pub fn request_full_state(&mut self) -> Result<()> {
        self.send(Message::request_full_state())
    }

    pub fn call_rpc(&mut self, name: &str, args: &RpcArgs) -> Result<()> {
        let call = self.registry.serialize_call(name, args)?;
        self.send(Message::rpc(call))?;
        self.stats.rpcs_sent += 1;
        Ok(())
    }

    /// Processes at most one incoming message. Channels are polled in the
    /// order of [`Channel::ALL`]. A protocol or transport failure closes the
    /// connection before the error is returned.
    pub fn receive<C>(
        &mut self,
        sink: &mut dyn StateSink,
        dispatcher: &RpcDispatcher<C>,
        ctx: &mut C,
    ) -> Result<Option<SyncEvent>> {
        if !self.transport.is_connected() {
            return Err(NetError::ConnectionClosed);
        }

        let result = self.poll(sink, dispatcher, ctx);
        if let Err(e) = &result {
            if e.is_desync() {
                log::warn!("closing desynchronized connection: {}", e);
                self.stats.desyncs += 1;
                self.sent_baseline = None;
                self.received = None;
                self.peer_verified = false;
                self.transport.close()?;
            }
        }
        result
    }

    fn poll<C>(
        &mut self,
        sink: &mut dyn StateSink,
        dispatcher: &RpcDispatcher<C>,
        ctx: &mut C,
    ) -> Result<Option<SyncEvent>> {
        for channel in Channel::ALL {
            if let Some(message) = self.transport.receive(channel)? {
                debug::trace_message("recv", channel, &message);
                self.stats.messages_received += 1;
                self.stats.bytes_received += 1 + message.body.len() as u64;
                return self.process(message, sink, dispatcher, ctx).map(Some);
            }
        }
        Ok(None)
    }

    fn process<C>(
        &mut self,
        message: Message,
        sink: &mut dyn StateSink,
        dispatcher: &RpcDispatcher<C>,
        ctx: &mut C,
    ) -> Result<SyncEvent> {
        if self.config.require_handshake
            && !self.peer_verified
            && message.msg_type != MessageType::Manifest
        {
            return Err(NetError::InvalidMessage(format!(
                "{:?} received before the registry handshake",
                message.msg_type
            )));
        }

        let mut reader = NetReader::with_limits(&message.body, self.config.limits);
        match message.msg_type {
            MessageType::Manifest => {
                let manifest = RegistryManifest::from_bytes(&message.body)?;
                debug::log_manifest("peer", &manifest);
                self.registry.verify_manifest(&manifest)?;
                self.peer_verified = true;
                log::debug!("peer registry verified");
                Ok(SyncEvent::ManifestVerified)
            }
            MessageType::FullState => {
                let snapshot = SnapshotCodec::new(self.registry.types()).decode_full(&mut reader)?;

                if let Some(previous) = &self.received {
                    for type_snapshot in previous.types() {
                        for (id, _) in type_snapshot.iter() {
                            if snapshot.get(type_snapshot.type_name(), *id).is_none() {
                                sink.remove_state(type_snapshot.type_name(), *id)?;
                            }
                        }
                    }
                }
                for type_snapshot in snapshot.types() {
                    for (_, state) in type_snapshot.iter() {
                        sink.apply_state(state.clone())?;
                    }
                }

                debug::log_snapshot("received", &snapshot);
                let instances = snapshot.instance_count();
                self.received = Some(snapshot);
                log::debug!("applied full state: {} instances", instances);
                Ok(SyncEvent::FullState { instances })
            }
            MessageType::DeltaState => {
                let types = self.registry.types();
                let baseline = self
                    .received
                    .get_or_insert_with(|| WorldSnapshot::empty(types));
                let applied = SnapshotCodec::new(types).apply_delta(baseline, &mut reader)?;

                for (type_name, id) in &applied.updated {
                    if let Some(state) = baseline.get(type_name, *id) {
                        sink.apply_state(state.clone())?;
                    }
                }
                for (type_name, id) in &applied.removed {
                    sink.remove_state(type_name, *id)?;
                }

                Ok(SyncEvent::DeltaState {
                    updated: applied.updated.len(),
                    removed: applied.removed.len(),
                })
            }
            MessageType::RequestFullState => {
                self.full_state_requested = true;
                Ok(SyncEvent::FullStateRequested)
            }
            MessageType::Rpc => {
                let call = dispatcher.dispatch(ctx, &message.body)?;
                Ok(SyncEvent::Rpc {
                    id: call.id,
                    name: call.name,
                })
            }
        }
    }

    fn send(&mut self, message: Message) -> Result<()> {
        if !self.transport.is_connected() {
            return Err(NetError::ConnectionClosed);
        }
        let channel = message.channel(self.config.mode);
        debug::trace_message("send", channel, &message);
        self.transport.send(channel, &message)?;
        self.stats.bytes_sent += 1 + message.body.len() as u64;
        Ok(())
    }
}

/// Looks up the game-side id of a synchronized object.
pub fn state_id(registry: &NetRegistry, state: &dyn StateObject) -> Result<StateId> {
    registry.delta().state_id(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{RpcCall, RpcDescriptor, RpcRegistry};
    use crate::schema::TypeRegistry;
    use crate::transport::MemoryTransport;
    use crate::{net_enum, net_state, Vec3};
    use ahash::AHashMap;

    #[derive(Debug, Clone, Copy, PartialEq, Default)]
    enum GrenadeType {
        #[default]
        Frag,
        Smoke,
    }

    net_enum!(GrenadeType as "GrenadeType" { Frag, Smoke });

    #[derive(Debug, Clone, Default, PartialEq)]
    struct GrenadeState {
        id: u32,
        kind: GrenadeType,
        position: Vec3,
        fuse_left: f32,
    }

    net_state!(GrenadeState as "GrenadeState" { id, kind, position, fuse_left });

    #[derive(Default)]
    struct ServerWorld {
        grenades: Vec<GrenadeState>,
        throws: u32,
    }

    impl StateSource for ServerWorld {
        fn states(&self, type_name: &str) -> Vec<&dyn StateObject> {
            match type_name {
                "GrenadeState" => self.grenades.iter().map(|g| g as &dyn StateObject).collect(),
                _ => Vec::new(),
            }
        }
    }

    #[derive(Default)]
    struct ClientWorld {
        grenades: AHashMap<u32, GrenadeState>,
    }

    impl ApplyServerState<GrenadeState> for ClientWorld {
        fn apply_server_state(&mut self, state: GrenadeState) -> Result<()> {
            self.grenades.insert(state.id, state);
            Ok(())
        }
    }

    impl StateSink for ClientWorld {
        fn apply_state(&mut self, state: DynamicState) -> Result<()> {
            match state.descriptor().name {
                "GrenadeState" => apply_typed::<GrenadeState, _>(self, state),
                other => Err(NetError::UnsupportedType(other.to_string())),
            }
        }

        fn remove_state(&mut self, _type_name: &'static str, id: StateId) -> Result<()> {
            self.grenades.remove(&id);
            Ok(())
        }
    }

    fn registry() -> Arc<NetRegistry> {
        let types = TypeRegistry::builder()
            .with_state::<GrenadeState>()
            .unwrap()
            .build()
            .unwrap();
        let rpcs = RpcRegistry::builder()
            .with_rpc(RpcDescriptor::new("ThrowGrenade", PeerRole::Server).with_param::<GrenadeType>("kind"))
            .build()
            .unwrap();
        Arc::new(NetRegistry::new(types, rpcs).unwrap())
    }

    fn grenade(id: u32) -> GrenadeState {
        GrenadeState {
            id,
            kind: GrenadeType::Frag,
            position: Vec3::new(0.0, 1.0, 0.0),
            fuse_left: 3.0,
        }
    }

    struct Session {
        server: SyncManager<MemoryTransport>,
        client: SyncManager<MemoryTransport>,
        server_rpcs: RpcDispatcher<ServerWorld>,
        client_rpcs: RpcDispatcher<()>,
    }

    fn session(config: SyncConfig) -> Session {
        let registry = registry();
        let (a, b) = MemoryTransport::pair();
        let server_rpcs = RpcDispatcher::new(Arc::clone(&registry), PeerRole::Server)
            .with_handler("ThrowGrenade", |world: &mut ServerWorld, call: &RpcCall| {
                let kind: GrenadeType = call.get("kind")?;
                let id = world.grenades.len() as u32 + 1;
                world.grenades.push(GrenadeState { kind, ..grenade(id) });
                world.throws += 1;
                Ok(())
            })
            .unwrap();
        Session {
            server: SyncManager::new(a, Arc::clone(&registry), PeerRole::Server, config.clone()),
            client: SyncManager::new(b, Arc::clone(&registry), PeerRole::Client, config),
            server_rpcs,
            client_rpcs: RpcDispatcher::new(registry, PeerRole::Client),
        }
    }

    impl Session {
        fn client_receive(&mut self, world: &mut ClientWorld) -> Result<Option<SyncEvent>> {
            self.client.receive(world, &self.client_rpcs, &mut ())
        }

        fn server_receive(&mut self, world: &mut ServerWorld) -> Result<Option<SyncEvent>> {
            let mut sink = ClientWorld::default();
            self.server.receive(&mut sink, &self.server_rpcs, world)
        }
    }

    #[test]
    fn test_config_from_json() {
        let config = SyncConfig::from_json_str(
            r#"{ "mode": "full", "limits": { "max_string_len": 256 } }"#,
        )
        .unwrap();
        assert_eq!(config.mode, SyncMode::Full);
        assert_eq!(config.limits.max_string_len, 256);
        assert_eq!(config.limits.max_collection_len, CodecLimits::default().max_collection_len);
        assert_eq!(config.sync_interval(), Duration::from_millis(50));
        assert!(SyncConfig::from_json_str("{ \"mode\": 3 }").is_err());
    }

    #[test]
    fn test_delta_session() {
        let mut s = session(SyncConfig::new().with_handshake(false));
        let mut server_world = ServerWorld {
            grenades: vec![grenade(1), grenade(2)],
            ..Default::default()
        };
        let mut client_world = ClientWorld::default();

        assert!(s.server.send_delta_state(&server_world).unwrap());
        assert_eq!(
            s.client_receive(&mut client_world).unwrap(),
            Some(SyncEvent::DeltaState { updated: 2, removed: 0 })
        );
        assert_eq!(client_world.grenades[&2], grenade(2));

        server_world.grenades[0].fuse_left = 1.5;
        server_world.grenades.remove(1);
        assert!(s.server.send_delta_state(&server_world).unwrap());
        assert_eq!(
            s.client_receive(&mut client_world).unwrap(),
            Some(SyncEvent::DeltaState { updated: 1, removed: 1 })
        );
        assert_eq!(client_world.grenades[&1].fuse_left, 1.5);
        assert!(!client_world.grenades.contains_key(&2));

        assert!(!s.server.send_delta_state(&server_world).unwrap());
        assert_eq!(s.client_receive(&mut client_world).unwrap(), None);
        assert_eq!(s.server.stats().deltas_sent, 2);
    }

    #[test]
    fn test_full_state_request() {
        let mut s = session(SyncConfig::new().with_handshake(false));
        let server_world = ServerWorld {
            grenades: vec![grenade(4)],
            ..Default::default()
        };
        let mut client_world = ClientWorld::default();

        s.client.request_full_state().unwrap();
        assert_eq!(
            s.server_receive(&mut ServerWorld::default()).unwrap(),
            Some(SyncEvent::FullStateRequested)
        );

        s.server.send_state(&server_world).unwrap();
        assert_eq!(s.server.stats().full_states_sent, 1);
        assert_eq!(
            s.client_receive(&mut client_world).unwrap(),
            Some(SyncEvent::FullState { instances: 1 })
        );
        assert_eq!(client_world.grenades[&4], grenade(4));
        assert_eq!(s.client.received_state().unwrap().instance_count(), 1);
    }

    #[test]
    fn test_rpc_over_session() {
        let mut s = session(SyncConfig::new().with_handshake(false));
        let mut server_world = ServerWorld::default();

        s.client
            .call_rpc("ThrowGrenade", &RpcArgs::new().with("kind", GrenadeType::Smoke))
            .unwrap();
        let event = s.server_receive(&mut server_world).unwrap();
        assert_eq!(event, Some(SyncEvent::Rpc { id: 1, name: "ThrowGrenade" }));
        assert_eq!(server_world.throws, 1);
        assert_eq!(server_world.grenades[0].kind, GrenadeType::Smoke);
    }

    #[test]
    fn test_handshake_gates_messages() {
        let mut s = session(SyncConfig::new());
        let mut client_world = ClientWorld::default();

        s.server.send_manifest().unwrap();
        assert_eq!(
            s.client_receive(&mut client_world).unwrap(),
            Some(SyncEvent::ManifestVerified)
        );
        assert!(s.client.is_peer_verified());

        let mut s = session(SyncConfig::new());
        s.server
            .send_full_state(&ServerWorld::default())
            .unwrap();
        let err = s.client_receive(&mut client_world).unwrap_err();
        assert!(err.is_desync());
        assert!(!s.client.is_connected());
        assert_eq!(s.client.stats().desyncs, 1);
    }

    #[test]
    fn test_malformed_delta_closes_connection() {
        let mut s = session(SyncConfig::new().with_handshake(false));
        let mut client_world = ClientWorld::default();

        s.server
            .send(Message::delta_state(vec![1u8, 0, 0].into()))
            .unwrap();
        assert!(s.client_receive(&mut client_world).is_err());
        assert!(!s.server.is_connected());
        assert!(matches!(
            s.client_receive(&mut client_world),
            Err(NetError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_wrong_role_rpc_is_rejected() {
        let mut s = session(SyncConfig::new().with_handshake(false));
        // The server sends a server-executed RPC to the client.
        s.server
            .call_rpc("ThrowGrenade", &RpcArgs::new().with("kind", GrenadeType::Frag))
            .unwrap();
        let err = s.client_receive(&mut ClientWorld::default()).unwrap_err();
        assert!(matches!(err, NetError::WrongPeerRole { .. }));
    }
}
