use crate::codec::ObjectCodec;
use crate::error::{NetError, Result};
use crate::primitive::{CodecLimits, NetReader, NetWriter};
use crate::registry::NetRegistry;
use crate::value::{NetValue, Value, WireType};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// One byte on the wire, assigned densely from 1.
pub type RpcId = u8;

pub const MAX_RPCS: usize = u8::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerRole {
    Server,
    Client,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Server => write!(f, "server"),
            PeerRole::Client => write!(f, "client"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RpcParam {
    pub name: &'static str,
    pub ty: WireType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RpcDescriptor {
    pub id: RpcId,
    pub name: &'static str,
    pub execute_on: PeerRole,
    params: Vec<RpcParam>,
}

impl RpcDescriptor {
    /// The id is assigned when the registry is built.
    pub fn new(name: &'static str, execute_on: PeerRole) -> Self {
        Self {
            id: 0,
            name,
            execute_on,
            params: Vec::new(),
        }
    }

    pub fn with_param<T: NetValue>(self, name: &'static str) -> Self {
        self.with_param_type(name, T::wire_type())
    }

    pub fn with_param_type(mut self, name: &'static str, ty: WireType) -> Self {
        self.params.push(RpcParam { name, ty });
        self
    }

    pub fn params(&self) -> &[RpcParam] {
        &self.params
    }
}

pub struct RpcRegistry {
    by_id: Vec<RpcDescriptor>,
    by_name: AHashMap<&'static str, RpcId>,
}

impl RpcRegistry {
    pub fn builder() -> RpcRegistryBuilder {
        RpcRegistryBuilder::default()
    }

    pub fn empty() -> Self {
        Self {
            by_id: Vec::new(),
            by_name: AHashMap::new(),
        }
    }

    pub fn id_of(&self, name: &str) -> Result<RpcId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| NetError::UnknownRpcName(name.to_string()))
    }

    /// Unknown ids come from the peer, so this is a protocol error.
    pub fn get(&self, id: RpcId) -> Result<&RpcDescriptor> {
        (id as usize)
            .checked_sub(1)
            .and_then(|i| self.by_id.get(i))
            .ok_or(NetError::UnknownRpc(id))
    }

    pub fn by_name(&self, name: &str) -> Result<&RpcDescriptor> {
        let id = self.id_of(name)?;
        self.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RpcDescriptor> + '_ {
        self.by_id.iter()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Writes `[u8 id][arg]*` with arguments in declared parameter order.
    /// The named arguments must match the parameter list exactly.
    pub fn serialize_call(
        &self,
        codec: &ObjectCodec<'_>,
        id: RpcId,
        args: &RpcArgs,
        writer: &mut NetWriter,
    ) -> Result<()> {
        let descriptor = self.get(id).map_err(|_| NetError::ArgumentMismatch {
            rpc: format!("#{}", id),
            reason: "no such RPC".to_string(),
        })?;

        let mismatch = |reason: String| NetError::ArgumentMismatch {
            rpc: descriptor.name.to_string(),
            reason,
        };

        if args.len() != descriptor.params.len() {
            return Err(mismatch(format!(
                "expected {} argument(s), got {}",
                descriptor.params.len(),
                args.len()
            )));
        }

        let mut ordered = Vec::with_capacity(descriptor.params.len());
        for param in &descriptor.params {
            let mut matching = args.values.iter().filter(|a| a.name == param.name);
            let arg = matching
                .next()
                .ok_or_else(|| mismatch(format!("missing argument '{}'", param.name)))?;
            if matching.next().is_some() {
                return Err(mismatch(format!("argument '{}' given twice", param.name)));
            }
            if arg.ty != param.ty {
                return Err(mismatch(format!(
                    "argument '{}' is {}, expected {}",
                    param.name, arg.ty, param.ty
                )));
            }
            ordered.push((param, &arg.value));
        }

        writer.write_u8(descriptor.id);
        for (param, value) in ordered {
            codec.encode(value, &param.ty, false, false, writer)?;
        }

        log::trace!("serialized RPC {} ({} bytes)", descriptor.name, writer.len());
        Ok(())
    }

    /// Reads the id and every argument. The whole buffer must be consumed.
    pub fn deserialize_call(&self, codec: &ObjectCodec<'_>, reader: &mut NetReader<'_>) -> Result<RpcCall> {
        let id = reader.read_u8()?;
        let descriptor = self.get(id)?;
        let mut args = Vec::with_capacity(descriptor.params.len());
        for param in &descriptor.params {
            args.push((param.name, codec.decode(&param.ty, false, false, reader)?));
        }
        reader.expect_end()?;
        Ok(RpcCall {
            id,
            name: descriptor.name,
            execute_on: descriptor.execute_on,
            args,
        })
    }
}

#[derive(Default)]
pub struct RpcRegistryBuilder {
    rpcs: Vec<RpcDescriptor>,
}

impl RpcRegistryBuilder {
    pub fn with_rpc(mut self, descriptor: RpcDescriptor) -> Self {
        self.rpcs.push(descriptor);
        self
    }

    /// Assigns ids in registration order.
    pub fn build(self) -> Result<RpcRegistry> {
        if self.rpcs.len() > MAX_RPCS {
            return Err(NetError::TooManyRpcs { max: MAX_RPCS });
        }

        let mut by_id = Vec::with_capacity(self.rpcs.len());
        let mut by_name = AHashMap::with_capacity(self.rpcs.len());
        for (index, mut descriptor) in self.rpcs.into_iter().enumerate() {
            let id = (index + 1) as RpcId;
            if by_name.insert(descriptor.name, id).is_some() {
                return Err(NetError::DuplicateRpc(descriptor.name.to_string()));
            }
            descriptor.id = id;
            by_id.push(descriptor);
        }

        Ok(RpcRegistry { by_id, by_name })
    }
}

#[derive(Debug, Clone)]
struct RpcArg {
    name: String,
    ty: WireType,
    value: Value,
}

/// Named call arguments.
#[derive(Debug, Clone, Default)]
pub struct RpcArgs {
    values: Vec<RpcArg>,
}

impl RpcArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: NetValue>(self, name: impl Into<String>, value: T) -> Self {
        self.with_value(name, T::wire_type(), value.to_value())
    }

    pub fn with_value(mut self, name: impl Into<String>, ty: WireType, value: Value) -> Self {
        self.values.push(RpcArg {
            name: name.into(),
            ty,
            value,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A decoded call with its arguments in parameter order.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcCall {
    pub id: RpcId,
    pub name: &'static str,
    pub execute_on: PeerRole,
    args: Vec<(&'static str, Value)>,
}

impl RpcCall {
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.args.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn get<T: NetValue>(&self, name: &str) -> Result<T> {
        let value = self.value(name).ok_or_else(|| NetError::ArgumentMismatch {
            rpc: self.name.to_string(),
            reason: format!("no parameter named '{}'", name),
        })?;
        T::from_value(value.clone())
    }

    pub fn args(&self) -> &[(&'static str, Value)] {
        &self.args
    }
}

pub type RpcHandler<C> = Box<dyn Fn(&mut C, &RpcCall) -> Result<()>>;

/// Decodes incoming calls and runs the handler bound for this peer's role.
/// `C` is the server or client context handed to every handler.
pub struct RpcDispatcher<C> {
    registry: Arc<NetRegistry>,
    role: PeerRole,
    limits: CodecLimits,
    handlers: AHashMap<RpcId, RpcHandler<C>>,
}

impl<C> RpcDispatcher<C> {
    pub fn new(registry: Arc<NetRegistry>, role: PeerRole) -> Self {
        Self {
            registry,
            role,
            limits: CodecLimits::default(),
            handlers: AHashMap::new(),
        }
    }

    pub fn with_limits(mut self, limits: CodecLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn bind<F>(&mut self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(&mut C, &RpcCall) -> Result<()> + 'static,
    {
        let id = self.registry.rpcs().id_of(name)?;
        self.handlers.insert(id, Box::new(handler));
        Ok(())
    }

    pub fn with_handler<F>(mut self, name: &str, handler: F) -> Result<Self>
    where
        F: Fn(&mut C, &RpcCall) -> Result<()> + 'static,
    {
        self.bind(name, handler)?;
        Ok(self)
    }

    /// RPCs this role executes that have no handler yet.
    pub fn unbound(&self) -> Vec<&'static str> {
        self.registry
            .rpcs()
            .iter()
            .filter(|d| d.execute_on == self.role && !self.handlers.contains_key(&d.id))
            .map(|d| d.name)
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        match self.unbound().first() {
            Some(name) => Err(NetError::UnboundRpc(name.to_string())),
            None => Ok(()),
        }
    }

    pub fn decode_call(&self, bytes: &[u8]) -> Result<RpcCall> {
        let mut reader = NetReader::with_limits(bytes, self.limits);
        self.registry
            .rpcs()
            .deserialize_call(&self.registry.codec(), &mut reader)
    }

    /// Decodes and executes one call. Fails without running anything if the
    /// call is malformed or addressed to the other role.
    pub fn dispatch(&self, ctx: &mut C, bytes: &[u8]) -> Result<RpcCall> {
        let call = self.decode_call(bytes)?;
        if call.execute_on != self.role {
            return Err(NetError::WrongPeerRole {
                name: call.name.to_string(),
                expected: call.execute_on,
                actual: self.role,
            });
        }

        let handler = self
            .handlers
            .get(&call.id)
            .ok_or_else(|| NetError::UnboundRpc(call.name.to_string()))?;
        handler(ctx, &call)?;

        log::debug!("Executed RPC {}", call.name);
        Ok(call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TypeRegistry;
    use crate::types::Vec3;

    fn registry() -> Arc<NetRegistry> {
        let rpcs = RpcRegistry::builder()
            .with_rpc(
                RpcDescriptor::new("ThrowGrenade", PeerRole::Server)
                    .with_param::<Vec3>("direction")
                    .with_param::<f32>("force"),
            )
            .with_rpc(
                RpcDescriptor::new("ShowMessage", PeerRole::Client)
                    .with_param::<Option<String>>("text"),
            )
            .build()
            .unwrap();
        let types = TypeRegistry::builder().build().unwrap();
        Arc::new(NetRegistry::new(types, rpcs).unwrap())
    }

    #[derive(Default)]
    struct Server {
        thrown: Vec<(Vec3, f32)>,
    }

    fn server_dispatcher(registry: Arc<NetRegistry>) -> RpcDispatcher<Server> {
        RpcDispatcher::new(registry, PeerRole::Server)
            .with_handler("ThrowGrenade", |server: &mut Server, call: &RpcCall| {
                server
                    .thrown
                    .push((call.get("direction")?, call.get("force")?));
                Ok(())
            })
            .unwrap()
    }

    #[test]
    fn test_dense_ids_in_registration_order() {
        let registry = registry();
        assert_eq!(registry.rpcs().id_of("ThrowGrenade").unwrap(), 1);
        assert_eq!(registry.rpcs().id_of("ShowMessage").unwrap(), 2);
        assert!(matches!(registry.rpcs().get(0), Err(NetError::UnknownRpc(0))));
        assert!(matches!(registry.rpcs().get(3), Err(NetError::UnknownRpc(3))));
    }

    #[test]
    fn test_duplicate_rpc_name() {
        let result = RpcRegistry::builder()
            .with_rpc(RpcDescriptor::new("Jump", PeerRole::Server))
            .with_rpc(RpcDescriptor::new("Jump", PeerRole::Client))
            .build();
        assert!(matches!(result, Err(NetError::DuplicateRpc(_))));
    }

    #[test]
    fn test_call_layout_and_dispatch() {
        let registry = registry();
        // Arguments are reordered into parameter order.
        let args = RpcArgs::new()
            .with("force", 12.5f32)
            .with("direction", Vec3::new(0.0, 1.0, 0.0));
        let bytes = registry.serialize_call("ThrowGrenade", &args).unwrap();
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes.len(), 1 + 12 + 4);
        assert_eq!(&bytes[13..], &12.5f32.to_le_bytes());

        let dispatcher = server_dispatcher(registry);
        let mut server = Server::default();
        let call = dispatcher.dispatch(&mut server, &bytes).unwrap();
        assert_eq!(call.name, "ThrowGrenade");
        assert_eq!(server.thrown, vec![(Vec3::new(0.0, 1.0, 0.0), 12.5)]);
    }

    #[test]
    fn test_argument_mismatch() {
        let registry = registry();

        let missing = RpcArgs::new().with("direction", Vec3::ZERO);
        assert!(matches!(
            registry.serialize_call("ThrowGrenade", &missing),
            Err(NetError::ArgumentMismatch { .. })
        ));

        let renamed = RpcArgs::new()
            .with("direction", Vec3::ZERO)
            .with("power", 1.0f32);
        assert!(matches!(
            registry.serialize_call("ThrowGrenade", &renamed),
            Err(NetError::ArgumentMismatch { .. })
        ));

        let wrong_type = RpcArgs::new()
            .with("direction", Vec3::ZERO)
            .with("force", 1.0f64);
        assert!(matches!(
            registry.serialize_call("ThrowGrenade", &wrong_type),
            Err(NetError::ArgumentMismatch { .. })
        ));

        let duplicated = RpcArgs::new()
            .with("force", 1.0f32)
            .with("force", 2.0f32);
        assert!(registry.serialize_call("ThrowGrenade", &duplicated).is_err());

        assert!(matches!(
            registry.serialize_call("Teleport", &RpcArgs::new()),
            Err(NetError::UnknownRpcName(_))
        ));
    }

    #[test]
    fn test_unknown_id_is_rejected() {
        let registry = registry();
        let dispatcher = server_dispatcher(registry);
        let err = dispatcher.dispatch(&mut Server::default(), &[9]).unwrap_err();
        assert!(matches!(err, NetError::UnknownRpc(9)));
        assert!(err.is_desync());
    }

    #[test]
    fn test_wrong_role_and_unbound() {
        let registry = registry();
        let bytes = registry
            .serialize_call("ShowMessage", &RpcArgs::new().with("text", Some("hi".to_string())))
            .unwrap();

        let dispatcher = server_dispatcher(Arc::clone(&registry));
        let mut server = Server::default();
        assert!(matches!(
            dispatcher.dispatch(&mut server, &bytes),
            Err(NetError::WrongPeerRole { expected: PeerRole::Client, .. })
        ));

        let client: RpcDispatcher<()> = RpcDispatcher::new(registry, PeerRole::Client);
        assert_eq!(client.unbound(), vec!["ShowMessage"]);
        assert!(matches!(client.dispatch(&mut (), &bytes), Err(NetError::UnboundRpc(_))));
        assert!(client.validate().is_err());
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        let registry = registry();
        let mut bytes = registry
            .serialize_call("ShowMessage", &RpcArgs::new().with("text", None::<String>))
            .unwrap()
            .to_vec();
        assert_eq!(bytes, vec![2, 0]);
        bytes.push(0);

        let client: RpcDispatcher<()> = RpcDispatcher::new(registry, PeerRole::Client)
            .with_handler("ShowMessage", |_, _| Ok(()))
            .unwrap();
        assert!(client.dispatch(&mut (), &bytes).is_err());
    }
}
