use crate::error::{NetError, Result};
use crate::value::{decode_custom, CustomDecodeFn, MemberShape, NetSerializable, NetValue, WireType};
use ahash::AHashMap;
use serde::Serialize;
use std::any::TypeId;
use std::sync::Arc;

/// Change masks are 32 bits wide.
pub const MAX_MEMBERS: usize = 32;

/// Name of the member that correlates a state object across peers.
pub const ID_MEMBER: &str = "id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberDescriptor {
    pub name: &'static str,
    pub ty: WireType,
    pub is_nullable: bool,
    pub elements_nullable: bool,
}

impl MemberDescriptor {
    /// Reference-like members (strings, collections, composites, custom
    /// types) and `Option` types default to nullable, as do the elements of
    /// a collection of such types.
    pub fn new(name: &'static str, ty: WireType) -> Self {
        let is_nullable = matches!(ty, WireType::Option(_)) || ty.is_reference_like();
        let elements_nullable = match &ty {
            WireType::List(element) => {
                matches!(**element, WireType::Option(_)) || element.is_reference_like()
            }
            _ => false,
        };
        Self {
            name,
            ty,
            is_nullable,
            elements_nullable,
        }
    }

    pub fn from_shape(name: &'static str, shape: MemberShape) -> Self {
        Self {
            name,
            ty: shape.ty,
            is_nullable: shape.nullable,
            elements_nullable: shape.elements_nullable,
        }
    }

    pub fn of<T: NetValue>(name: &'static str) -> Self {
        Self::from_shape(name, T::member_shape())
    }

    pub fn non_nullable(mut self) -> Self {
        self.is_nullable = false;
        self
    }

    pub fn non_nullable_elements(mut self) -> Self {
        self.elements_nullable = false;
        self
    }
}

/// Ordered member list of a composite type. Member order is the bit order of
/// its change mask and must be identical on every peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TypeDescriptor {
    pub name: &'static str,
    members: Vec<MemberDescriptor>,
}

impl TypeDescriptor {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            members: Vec::new(),
        }
    }

    pub fn with_member(mut self, member: MemberDescriptor) -> Self {
        self.members.push(member);
        self
    }

    pub fn members(&self) -> &[MemberDescriptor] {
        &self.members
    }

    pub fn member(&self, index: usize) -> Result<&MemberDescriptor> {
        self.members.get(index).ok_or_else(|| NetError::MemberOutOfRange {
            type_name: self.name.to_string(),
            index,
        })
    }

    pub fn member_index(&self, name: &str) -> Option<usize> {
        self.members.iter().position(|m| m.name == name)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Index of the `u32` id member, if the type has one.
    pub fn id_member(&self) -> Option<usize> {
        self.members
            .iter()
            .position(|m| m.name.eq_ignore_ascii_case(ID_MEMBER) && m.ty == WireType::U32)
    }

    fn validate(&self) -> Result<()> {
        if self.members.len() > MAX_MEMBERS {
            return Err(NetError::TooManyMembers {
                type_name: self.name.to_string(),
                count: self.members.len(),
                max: MAX_MEMBERS,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnumDescriptor {
    pub name: &'static str,
    enumerators: Vec<String>,
}

impl EnumDescriptor {
    pub fn new<I, S>(name: &'static str, enumerators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name,
            enumerators: enumerators.into_iter().map(Into::into).collect(),
        }
    }

    pub fn enumerators(&self) -> &[String] {
        &self.enumerators
    }

    pub fn count(&self) -> usize {
        self.enumerators.len()
    }

    /// Bytes used for an ordinal on the wire.
    pub fn width(&self) -> usize {
        enum_width(self.enumerators.len())
    }
}

/// Smallest `w` in `{1, 2, 4, 8}` with `2^(8w) >= count`.
pub fn enum_width(count: usize) -> usize {
    let count = count as u128;
    [1usize, 2, 4]
        .into_iter()
        .find(|w| count <= 1u128 << (8 * w))
        .unwrap_or(8)
}

#[derive(Clone, Copy)]
struct CustomEntry {
    type_id: TypeId,
    decode: CustomDecodeFn,
}

/// Every composite, enum and custom type known to this build. Constructed
/// once at startup and read-only afterwards.
pub struct TypeRegistry {
    composites: AHashMap<&'static str, Arc<TypeDescriptor>>,
    enums: AHashMap<&'static str, EnumDescriptor>,
    customs: AHashMap<&'static str, CustomEntry>,
    synchronized: Vec<&'static str>,
}

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::new()
    }

    /// Descriptor of a composite type.
    pub fn describe(&self, name: &str) -> Result<&Arc<TypeDescriptor>> {
        self.composites
            .get(name)
            .ok_or_else(|| NetError::UnsupportedType(name.to_string()))
    }

    pub fn enum_descriptor(&self, name: &str) -> Result<&EnumDescriptor> {
        self.enums
            .get(name)
            .ok_or_else(|| NetError::UnsupportedType(format!("enum {}", name)))
    }

    pub(crate) fn custom_decoder(&self, name: &str) -> Result<CustomDecodeFn> {
        self.customs
            .get(name)
            .map(|entry| entry.decode)
            .ok_or_else(|| NetError::UnsupportedType(format!("custom {}", name)))
    }

    pub fn has_custom(&self, name: &str) -> bool {
        self.customs.contains_key(name)
    }

    /// Synchronized state types in registration order.
    pub fn synchronized_types(&self) -> impl Iterator<Item = &Arc<TypeDescriptor>> + '_ {
        self.synchronized
            .iter()
            .filter_map(move |name| self.composites.get(name))
    }

    pub fn synchronized_count(&self) -> usize {
        self.synchronized.len()
    }

    pub fn composites(&self) -> impl Iterator<Item = &Arc<TypeDescriptor>> + '_ {
        self.composites.values()
    }

    pub fn enums(&self) -> impl Iterator<Item = &EnumDescriptor> + '_ {
        self.enums.values()
    }

    pub fn custom_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.customs.keys().copied()
    }

    /// Fails with `UnsupportedType` if `ty` names a type this registry does
    /// not know or nests one `Option` directly inside another.
    pub fn check(&self, ty: &WireType) -> Result<()> {
        if ty.has_nested_option() {
            return Err(NetError::UnsupportedType(ty.to_string()));
        }
        for name in ty.referenced_names() {
            let known = match find_named(ty, name) {
                Some(WireType::Enum(_)) => self.enums.contains_key(name),
                Some(WireType::Composite(_)) => self.composites.contains_key(name),
                Some(WireType::Custom(_)) => self.customs.contains_key(name),
                _ => false,
            };
            if !known {
                return Err(NetError::UnsupportedType(name.to_string()));
            }
        }
        Ok(())
    }
}

fn find_named<'t>(ty: &'t WireType, name: &str) -> Option<&'t WireType> {
    match ty {
        WireType::Option(inner) | WireType::List(inner) => find_named(inner, name),
        WireType::Enum(n) | WireType::Composite(n) | WireType::Custom(n) if *n == name => Some(ty),
        _ => None,
    }
}

#[derive(Default)]
pub struct TypeRegistryBuilder {
    composites: AHashMap<&'static str, Arc<TypeDescriptor>>,
    enums: AHashMap<&'static str, EnumDescriptor>,
    customs: AHashMap<&'static str, CustomEntry>,
    synchronized: Vec<&'static str>,
}

impl TypeRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.composites.contains_key(name)
            || self.enums.contains_key(name)
            || self.customs.contains_key(name)
    }

    /// Adds a composite. Returns `false` if an identical descriptor was
    /// already present.
    pub fn insert_composite(&mut self, descriptor: TypeDescriptor) -> Result<bool> {
        descriptor.validate()?;
        if let Some(existing) = self.composites.get(descriptor.name) {
            if **existing == descriptor {
                return Ok(false);
            }
            return Err(NetError::DuplicateType(descriptor.name.to_string()));
        }
        if self.enums.contains_key(descriptor.name) || self.customs.contains_key(descriptor.name) {
            return Err(NetError::DuplicateType(descriptor.name.to_string()));
        }
        self.composites
            .insert(descriptor.name, Arc::new(descriptor));
        Ok(true)
    }

    pub fn insert_enum(&mut self, descriptor: EnumDescriptor) -> Result<bool> {
        if let Some(existing) = self.enums.get(descriptor.name) {
            if *existing == descriptor {
                return Ok(false);
            }
            return Err(NetError::DuplicateType(descriptor.name.to_string()));
        }
        if self.composites.contains_key(descriptor.name) || self.customs.contains_key(descriptor.name) {
            return Err(NetError::DuplicateType(descriptor.name.to_string()));
        }
        self.enums.insert(descriptor.name, descriptor);
        Ok(true)
    }

    pub fn insert_custom<T: NetSerializable>(&mut self) -> Result<bool> {
        let name = T::TYPE_NAME;
        if let Some(existing) = self.customs.get(name) {
            if existing.type_id == TypeId::of::<T>() {
                return Ok(false);
            }
            return Err(NetError::DuplicateType(name.to_string()));
        }
        if self.composites.contains_key(name) || self.enums.contains_key(name) {
            return Err(NetError::DuplicateType(name.to_string()));
        }
        self.customs.insert(
            name,
            CustomEntry {
                type_id: TypeId::of::<T>(),
                decode: decode_custom::<T>,
            },
        );
        Ok(true)
    }

    pub fn with_type(mut self, descriptor: TypeDescriptor) -> Result<Self> {
        self.insert_composite(descriptor)?;
        Ok(self)
    }

    pub fn with_enum(mut self, descriptor: EnumDescriptor) -> Result<Self> {
        self.insert_enum(descriptor)?;
        Ok(self)
    }

    pub fn with_custom<T: NetSerializable>(mut self) -> Result<Self> {
        self.insert_custom::<T>()?;
        Ok(self)
    }

    /// Registers a Rust type and everything it refers to.
    pub fn with<T: NetValue>(mut self) -> Result<Self> {
        T::register_types(&mut self)?;
        Ok(self)
    }

    /// Registers a synchronized state type. It must be a composite with a
    /// `u32` id member.
    pub fn with_state<T: NetValue>(mut self) -> Result<Self> {
        T::register_types(&mut self)?;
        let name = match T::wire_type() {
            WireType::Composite(name) => name,
            other => return Err(NetError::UnsupportedType(other.to_string())),
        };
        self.mark_synchronized(name)?;
        Ok(self)
    }

    /// Marks an already registered composite as a synchronized state type.
    pub fn mark_synchronized(&mut self, name: &'static str) -> Result<()> {
        let descriptor = self
            .composites
            .get(name)
            .ok_or_else(|| NetError::UnsupportedType(name.to_string()))?;
        if descriptor.id_member().is_none() {
            return Err(NetError::MissingIdMember(name.to_string()));
        }
        if !self.synchronized.contains(&name) {
            self.synchronized.push(name);
        }
        Ok(())
    }

    /// Freezes the registry after checking that every referenced type
    /// resolves.
    pub fn build(self) -> Result<TypeRegistry> {
        let registry = TypeRegistry {
            composites: self.composites,
            enums: self.enums,
            customs: self.customs,
            synchronized: self.synchronized,
        };

        for descriptor in registry.composites.values() {
            for member in descriptor.members() {
                registry.check(&member.ty)?;
            }
        }

        log::debug!(
            "type registry built: {} composites ({} synchronized), {} enums, {} custom",
            registry.composites.len(),
            registry.synchronized.len(),
            registry.enums.len(),
            registry.customs.len()
        );

        Ok(registry)
    }
}
