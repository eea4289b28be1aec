use crate::codec::ObjectCodec;
use crate::delta::DeltaCodec;
use crate::error::{NetError, Result};
use crate::primitive::NetWriter;
use crate::rpc::{PeerRole, RpcArgs, RpcId, RpcRegistry};
use crate::schema::TypeRegistry;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The type registry and RPC table of one build. Created at startup, then
/// shared read-only (usually behind an `Arc`).
pub struct NetRegistry {
    types: TypeRegistry,
    rpcs: RpcRegistry,
}

impl NetRegistry {
    /// Fails if an RPC parameter names a type the type registry lacks.
    pub fn new(types: TypeRegistry, rpcs: RpcRegistry) -> Result<Self> {
        for rpc in rpcs.iter() {
            for param in rpc.params() {
                types.check(&param.ty)?;
            }
        }

        log::debug!(
            "net registry ready: {} synchronized types, {} RPCs",
            types.synchronized_count(),
            rpcs.len()
        );

        Ok(Self { types, rpcs })
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn rpcs(&self) -> &RpcRegistry {
        &self.rpcs
    }

    pub fn codec(&self) -> ObjectCodec<'_> {
        ObjectCodec::new(&self.types)
    }

    pub fn delta(&self) -> DeltaCodec<'_> {
        DeltaCodec::new(&self.types)
    }

    pub fn serialize_call(&self, name: &str, args: &RpcArgs) -> Result<Bytes> {
        let id = self.rpcs.id_of(name)?;
        self.serialize_call_id(id, args)
    }

    pub fn serialize_call_id(&self, id: RpcId, args: &RpcArgs) -> Result<Bytes> {
        let mut writer = NetWriter::new();
        self.rpcs
            .serialize_call(&self.codec(), id, args, &mut writer)?;
        Ok(writer.freeze())
    }

    /// Everything both peers must agree on, in a stable order.
    pub fn manifest(&self) -> RegistryManifest {
        let mut types: Vec<TypeManifest> = self
            .types
            .composites()
            .map(|descriptor| TypeManifest {
                name: descriptor.name.to_string(),
                members: descriptor
                    .members()
                    .iter()
                    .map(|m| MemberManifest {
                        name: m.name.to_string(),
                        ty: m.ty.to_string(),
                        is_nullable: m.is_nullable,
                        elements_nullable: m.elements_nullable,
                    })
                    .collect(),
            })
            .collect();
        types.sort_by(|a, b| a.name.cmp(&b.name));

        let mut enums: Vec<EnumManifest> = self
            .types
            .enums()
            .map(|e| EnumManifest {
                name: e.name.to_string(),
                count: e.count() as u64,
            })
            .collect();
        enums.sort_by(|a, b| a.name.cmp(&b.name));

        let mut customs: Vec<String> = self.types.custom_names().map(str::to_string).collect();
        customs.sort();

        let synchronized = self
            .types
            .synchronized_types()
            .map(|d| d.name.to_string())
            .collect();

        let rpcs = self
            .rpcs
            .iter()
            .map(|rpc| RpcManifest {
                id: rpc.id,
                name: rpc.name.to_string(),
                execute_on: rpc.execute_on,
                params: rpc
                    .params()
                    .iter()
                    .map(|p| (p.name.to_string(), p.ty.to_string()))
                    .collect(),
            })
            .collect();

        RegistryManifest {
            types,
            enums,
            customs,
            synchronized,
            rpcs,
        }
    }

    pub fn verify_manifest(&self, remote: &RegistryManifest) -> Result<()> {
        if self.manifest() != *remote {
            log::warn!("peer registry manifest differs from the local build");
            return Err(NetError::RegistryMismatch);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberManifest {
    pub name: String,
    pub ty: String,
    pub is_nullable: bool,
    pub elements_nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeManifest {
    pub name: String,
    pub members: Vec<MemberManifest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumManifest {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcManifest {
    pub id: RpcId,
    pub name: String,
    pub execute_on: PeerRole,
    pub params: Vec<(String, String)>,
}

/// Summary of a registry exchanged once per connection. Peers running
/// different builds are refused rather than allowed to desync later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryManifest {
    pub types: Vec<TypeManifest>,
    pub enums: Vec<EnumManifest>,
    pub customs: Vec<String>,
    pub synchronized: Vec<String>,
    pub rpcs: Vec<RpcManifest>,
}

impl RegistryManifest {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcDescriptor;
    use crate::schema::{EnumDescriptor, MemberDescriptor, TypeDescriptor};
    use crate::value::WireType;

    fn build(extra_member: bool) -> NetRegistry {
        let mut grenade = TypeDescriptor::new("GrenadeState")
            .with_member(MemberDescriptor::new("id", WireType::U32))
            .with_member(MemberDescriptor::new("kind", WireType::Enum("GrenadeType")));
        if extra_member {
            grenade = grenade.with_member(MemberDescriptor::new("fuse", WireType::F32));
        }

        let mut builder = TypeRegistry::builder()
            .with_type(grenade)
            .unwrap()
            .with_enum(EnumDescriptor::new("GrenadeType", ["Frag", "Smoke"]))
            .unwrap();
        builder.mark_synchronized("GrenadeState").unwrap();

        let rpcs = RpcRegistry::builder()
            .with_rpc(
                RpcDescriptor::new("Detonate", PeerRole::Client)
                    .with_param_type("grenade", WireType::U32),
            )
            .build()
            .unwrap();

        NetRegistry::new(builder.build().unwrap(), rpcs).unwrap()
    }

    #[test]
    fn test_manifest_exchange() {
        let local = build(false);
        let bytes = local.manifest().to_bytes().unwrap();
        let remote = RegistryManifest::from_bytes(&bytes).unwrap();
        local.verify_manifest(&remote).unwrap();

        let other = build(true);
        let err = other.verify_manifest(&remote).unwrap_err();
        assert!(matches!(err, NetError::RegistryMismatch));
        assert!(err.is_desync());
    }

    #[test]
    fn test_manifest_contents() {
        let manifest = build(false).manifest();
        assert_eq!(manifest.synchronized, vec!["GrenadeState".to_string()]);
        assert_eq!(manifest.types[0].members[1].ty, "enum GrenadeType");
        assert_eq!(manifest.enums[0].count, 2);
        assert_eq!(manifest.rpcs[0].id, 1);
    }

    #[test]
    fn test_rpc_parameter_types_must_resolve() {
        let rpcs = RpcRegistry::builder()
            .with_rpc(
                RpcDescriptor::new("Equip", PeerRole::Server)
                    .with_param_type("slot", WireType::Composite("WeaponSlot")),
            )
            .build()
            .unwrap();
        let types = TypeRegistry::builder().build().unwrap();
        assert!(matches!(
            NetRegistry::new(types, rpcs),
            Err(NetError::UnsupportedType(_))
        ));
    }

    #[test]
    fn test_nested_option_parameter_is_rejected() {
        let rpcs = RpcRegistry::builder()
            .with_rpc(
                RpcDescriptor::new("Reload", PeerRole::Server).with_param_type(
                    "magazine",
                    WireType::option(WireType::option(WireType::U8)),
                ),
            )
            .build()
            .unwrap();
        let types = TypeRegistry::builder().build().unwrap();
        assert!(matches!(
            NetRegistry::new(types, rpcs),
            Err(NetError::UnsupportedType(_))
        ));
    }

    #[test]
    fn test_garbage_manifest_is_protocol_error() {
        let err = RegistryManifest::from_bytes(&[0xFF]).unwrap_err();
        assert!(err.is_desync());
    }
}
