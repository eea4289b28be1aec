//! Static wire types, tagged member values, and the bridge from Rust types.

use crate::error::{NetError, Result};
use crate::primitive::{NetReader, NetWriter};
use crate::schema::TypeRegistryBuilder;
use crate::types::{Decimal, Vec2, Vec3};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Declared type of a member, parameter or collection element. Chooses the
/// encode/decode path; the runtime shape of a value never does.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum WireType {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Decimal,
    Char,
    String,
    Vec2,
    Vec3,
    /// Presence flag then the inner value. Usable at any nesting depth,
    /// but never directly inside another `Option`.
    Option(Box<WireType>),
    /// `u32` count then each element.
    List(Box<WireType>),
    Enum(&'static str),
    Composite(&'static str),
    Custom(&'static str),
}

impl WireType {
    pub fn option(inner: WireType) -> Self {
        WireType::Option(Box::new(inner))
    }

    pub fn list(element: WireType) -> Self {
        WireType::List(Box::new(element))
    }

    pub fn is_primitive(&self) -> bool {
        !matches!(
            self,
            WireType::Option(_)
                | WireType::List(_)
                | WireType::Enum(_)
                | WireType::Composite(_)
                | WireType::Custom(_)
        )
    }

    /// Types that default to nullable when declared as a member.
    pub fn is_reference_like(&self) -> bool {
        matches!(
            self,
            WireType::String | WireType::List(_) | WireType::Composite(_) | WireType::Custom(_)
        )
    }

    /// True if an `Option` directly wraps another `Option` anywhere in
    /// this type. One presence flag cannot tell `Some(None)` from `None`.
    pub fn has_nested_option(&self) -> bool {
        match self {
            WireType::Option(inner) => {
                matches!(**inner, WireType::Option(_)) || inner.has_nested_option()
            }
            WireType::List(inner) => inner.has_nested_option(),
            _ => false,
        }
    }

    /// Every registry name this type depends on, outermost first.
    pub fn referenced_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names(&self, names: &mut Vec<&'static str>) {
        match self {
            WireType::Option(inner) | WireType::List(inner) => inner.collect_names(names),
            WireType::Enum(name) | WireType::Composite(name) | WireType::Custom(name) => {
                names.push(name)
            }
            _ => {}
        }
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireType::Option(inner) => write!(f, "Option<{}>", inner),
            WireType::List(inner) => write!(f, "List<{}>", inner),
            WireType::Enum(name) => write!(f, "enum {}", name),
            WireType::Composite(name) => write!(f, "{}", name),
            WireType::Custom(name) => write!(f, "custom {}", name),
            primitive => write!(f, "{:?}", primitive),
        }
    }
}

/// A member value tagged with its concrete shape.
///
/// Equality is wire equality: floats compare by bit pattern, so a `NaN`
/// that did not change is not retransmitted and `-0.0` survives a round trip.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Decimal(Decimal),
    Char(char),
    String(String),
    Vec2(Vec2),
    Vec3(Vec3),
    /// Enumerator ordinal in declaration order.
    Enum(u64),
    List(Vec<Value>),
    /// Members in descriptor order.
    Composite(Vec<Value>),
    Custom(CustomValue),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::I8(_) => "I8",
            Value::U8(_) => "U8",
            Value::I16(_) => "I16",
            Value::U16(_) => "U16",
            Value::I32(_) => "I32",
            Value::U32(_) => "U32",
            Value::I64(_) => "I64",
            Value::U64(_) => "U64",
            Value::F32(_) => "F32",
            Value::F64(_) => "F64",
            Value::Decimal(_) => "Decimal",
            Value::Char(_) => "Char",
            Value::String(_) => "String",
            Value::Vec2(_) => "Vec2",
            Value::Vec3(_) => "Vec3",
            Value::Enum(_) => "Enum",
            Value::List(_) => "List",
            Value::Composite(_) => "Composite",
            Value::Custom(_) => "Custom",
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (I8(a), I8(b)) => a == b,
            (U8(a), U8(b)) => a == b,
            (I16(a), I16(b)) => a == b,
            (U16(a), U16(b)) => a == b,
            (I32(a), I32(b)) => a == b,
            (U32(a), U32(b)) => a == b,
            (I64(a), I64(b)) => a == b,
            (U64(a), U64(b)) => a == b,
            (F32(a), F32(b)) => a.to_bits() == b.to_bits(),
            (F64(a), F64(b)) => a.to_bits() == b.to_bits(),
            (Decimal(a), Decimal(b)) => a == b,
            (Char(a), Char(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Vec2(a), Vec2(b)) => a.bits() == b.bits(),
            (Vec3(a), Vec3(b)) => a.bits() == b.bits(),
            (Enum(a), Enum(b)) => a == b,
            (List(a), List(b)) | (Composite(a), Composite(b)) => a == b,
            (Custom(a), Custom(b)) => a == b,
            _ => false,
        }
    }
}

/// Capability of a type that encodes itself instead of being walked member
/// by member.
pub trait NetSerializable: fmt::Debug + Clone + PartialEq + Send + Sync + 'static {
    const TYPE_NAME: &'static str;

    fn serialize(&self, writer: &mut NetWriter) -> Result<()>;

    fn deserialize(reader: &mut NetReader<'_>) -> Result<Self>;
}

trait ErasedCustom: fmt::Debug + Send + Sync {
    fn type_name(&self) -> &'static str;
    fn serialize(&self, writer: &mut NetWriter) -> Result<()>;
    fn as_any(&self) -> &dyn Any;
    fn eq_erased(&self, other: &dyn ErasedCustom) -> bool;
}

impl<T: NetSerializable> ErasedCustom for T {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn serialize(&self, writer: &mut NetWriter) -> Result<()> {
        NetSerializable::serialize(self, writer)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_erased(&self, other: &dyn ErasedCustom) -> bool {
        other.as_any().downcast_ref::<T>() == Some(self)
    }
}

/// Type-erased value of a [`NetSerializable`] type.
#[derive(Debug, Clone)]
pub struct CustomValue(Arc<dyn ErasedCustom>);

impl CustomValue {
    pub fn new<T: NetSerializable>(value: T) -> Self {
        CustomValue(Arc::new(value))
    }

    pub fn type_name(&self) -> &'static str {
        self.0.type_name()
    }

    pub fn downcast_ref<T: NetSerializable>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    pub(crate) fn serialize(&self, writer: &mut NetWriter) -> Result<()> {
        self.0.serialize(writer)
    }
}

impl PartialEq for CustomValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_erased(other.0.as_ref())
    }
}

pub(crate) type CustomDecodeFn = fn(&mut NetReader<'_>) -> Result<CustomValue>;

pub(crate) fn decode_custom<T: NetSerializable>(reader: &mut NetReader<'_>) -> Result<CustomValue> {
    T::deserialize(reader).map(CustomValue::new)
}

/// How a Rust type appears as a member: its declared static type and the
/// two nullability flags recorded in its descriptor. `Option` stays part of
/// the type, so the flags never add a second presence byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberShape {
    pub ty: WireType,
    pub nullable: bool,
    pub elements_nullable: bool,
}

impl MemberShape {
    pub fn plain(ty: WireType) -> Self {
        Self {
            ty,
            nullable: false,
            elements_nullable: false,
        }
    }
}

/// Maps a Rust type onto a static [`WireType`] and tagged [`Value`]s.
pub trait NetValue: Sized {
    fn wire_type() -> WireType;

    fn to_value(&self) -> Value;

    fn from_value(value: Value) -> Result<Self>;

    fn member_shape() -> MemberShape {
        MemberShape::plain(Self::wire_type())
    }

    /// Registers every enum, composite and custom type this type refers to.
    fn register_types(_builder: &mut TypeRegistryBuilder) -> Result<()> {
        Ok(())
    }
}

macro_rules! impl_net_value_copy {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl NetValue for $ty {
                fn wire_type() -> WireType {
                    WireType::$variant
                }

                fn to_value(&self) -> Value {
                    Value::$variant(*self)
                }

                fn from_value(value: Value) -> Result<Self> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        other => Err(NetError::mismatch(WireType::$variant, other.kind_name())),
                    }
                }
            }
        )*
    };
}

impl_net_value_copy!(
    bool => Bool,
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    Decimal => Decimal,
    char => Char,
    Vec2 => Vec2,
    Vec3 => Vec3,
);

impl NetValue for String {
    fn wire_type() -> WireType {
        WireType::String
    }

    fn to_value(&self) -> Value {
        Value::String(self.clone())
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::String(v) => Ok(v),
            other => Err(NetError::mismatch(WireType::String, other.kind_name())),
        }
    }
}

impl<T: NetValue> NetValue for Option<T> {
    fn wire_type() -> WireType {
        WireType::option(T::wire_type())
    }

    fn to_value(&self) -> Value {
        match self {
            Some(v) => v.to_value(),
            None => Value::Null,
        }
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            v => T::from_value(v).map(Some),
        }
    }

    fn member_shape() -> MemberShape {
        MemberShape {
            ty: Self::wire_type(),
            nullable: true,
            elements_nullable: T::member_shape().elements_nullable,
        }
    }

    fn register_types(builder: &mut TypeRegistryBuilder) -> Result<()> {
        if matches!(T::wire_type(), WireType::Option(_)) {
            return Err(NetError::UnsupportedType(Self::wire_type().to_string()));
        }
        T::register_types(builder)
    }
}

fn list_shape(element: WireType) -> MemberShape {
    MemberShape {
        elements_nullable: matches!(element, WireType::Option(_)),
        ty: WireType::list(element),
        nullable: false,
    }
}

fn list_from_value<T: NetValue>(value: Value) -> Result<Vec<T>> {
    match value {
        Value::List(items) => items.into_iter().map(T::from_value).collect(),
        other => Err(NetError::mismatch(
            WireType::list(T::wire_type()),
            other.kind_name(),
        )),
    }
}

impl<T: NetValue> NetValue for Vec<T> {
    fn wire_type() -> WireType {
        WireType::list(T::wire_type())
    }

    fn to_value(&self) -> Value {
        Value::List(self.iter().map(NetValue::to_value).collect())
    }

    fn from_value(value: Value) -> Result<Self> {
        list_from_value(value)
    }

    fn member_shape() -> MemberShape {
        list_shape(T::wire_type())
    }

    fn register_types(builder: &mut TypeRegistryBuilder) -> Result<()> {
        T::register_types(builder)
    }
}

impl<T: NetValue, const N: usize> NetValue for [T; N] {
    fn wire_type() -> WireType {
        WireType::list(T::wire_type())
    }

    fn to_value(&self) -> Value {
        Value::List(self.iter().map(NetValue::to_value).collect())
    }

    fn from_value(value: Value) -> Result<Self> {
        let items = list_from_value::<T>(value)?;
        let len = items.len();
        items.try_into().map_err(|_| {
            NetError::InvalidValue(format!("expected {} elements, got {}", N, len))
        })
    }

    fn member_shape() -> MemberShape {
        list_shape(T::wire_type())
    }

    fn register_types(builder: &mut TypeRegistryBuilder) -> Result<()> {
        T::register_types(builder)
    }
}
