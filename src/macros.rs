//! Static registration of synchronized types.
//!
//! The macros list members explicitly, so member order (and therefore the
//! change-mask bit layout) is fixed at compile time and identical on every
//! peer built from the same source.

use crate::error::Result;
use crate::schema::TypeRegistryBuilder;
use crate::value::{MemberShape, NetValue};

#[doc(hidden)]
pub fn shape_of<T: NetValue>(_: Option<&T>) -> MemberShape {
    T::member_shape()
}

#[doc(hidden)]
pub fn register_of<T: NetValue>(builder: &mut TypeRegistryBuilder, _: Option<&T>) -> Result<()> {
    T::register_types(builder)
}

/// Implements [`StateObject`](crate::StateObject), [`NetValue`](crate::NetValue)
/// and [`NetState`](crate::NetState) for a struct. Listed fields are
/// synchronized in the given order; unlisted fields are left at their
/// `Default` value on decode.
///
/// ```ignore
/// #[derive(Debug, Clone, Default, PartialEq)]
/// struct PlayerState { id: u32, name: String, health: f32 }
///
/// net_state!(PlayerState as "PlayerState" { id, name, health });
/// ```
#[macro_export]
macro_rules! net_state {
    ($ty:ident as $name:literal { $($field:ident),+ $(,)? }) => {
        impl $crate::StateObject for $ty {
            fn type_name(&self) -> &'static str {
                $name
            }

            #[allow(unused_assignments)]
            fn member(&self, index: usize) -> $crate::Result<$crate::Value> {
                let mut i = 0usize;
                $(
                    if index == i {
                        return Ok($crate::NetValue::to_value(&self.$field));
                    }
                    i += 1;
                )+
                Err($crate::NetError::MemberOutOfRange {
                    type_name: $name.to_string(),
                    index,
                })
            }

            #[allow(unused_assignments)]
            fn set_member(&mut self, index: usize, value: $crate::Value) -> $crate::Result<()> {
                let mut i = 0usize;
                $(
                    if index == i {
                        self.$field = $crate::NetValue::from_value(value)?;
                        return Ok(());
                    }
                    i += 1;
                )+
                Err($crate::NetError::MemberOutOfRange {
                    type_name: $name.to_string(),
                    index,
                })
            }
        }

        impl $crate::NetValue for $ty {
            fn wire_type() -> $crate::WireType {
                $crate::WireType::Composite($name)
            }

            fn to_value(&self) -> $crate::Value {
                $crate::Value::Composite(vec![$($crate::NetValue::to_value(&self.$field)),+])
            }

            fn from_value(value: $crate::Value) -> $crate::Result<Self> {
                let members = match value {
                    $crate::Value::Composite(members) => members,
                    other => {
                        return Err($crate::NetError::TypeMismatch {
                            expected: $name.to_string(),
                            actual: other.kind_name().to_string(),
                        })
                    }
                };
                let count = members.len();
                let mut members = members.into_iter();
                let mut state = <$ty as Default>::default();
                $(
                    state.$field = match members.next() {
                        Some(v) => $crate::NetValue::from_value(v)?,
                        None => {
                            return Err($crate::NetError::TypeMismatch {
                                expected: $name.to_string(),
                                actual: format!("composite with {} members", count),
                            })
                        }
                    };
                )+
                if members.next().is_some() {
                    return Err($crate::NetError::TypeMismatch {
                        expected: $name.to_string(),
                        actual: format!("composite with {} members", count),
                    });
                }
                Ok(state)
            }

            fn register_types(builder: &mut $crate::TypeRegistryBuilder) -> $crate::Result<()> {
                // Insert first so self-referencing types terminate.
                if builder.insert_composite(<$ty as $crate::NetState>::describe())? {
                    $(
                        $crate::macros::register_of(builder, None::<&$ty>.map(|s| &s.$field))?;
                    )+
                }
                Ok(())
            }
        }

        impl $crate::NetState for $ty {
            const TYPE_NAME: &'static str = $name;

            fn describe() -> $crate::TypeDescriptor {
                $crate::TypeDescriptor::new($name)
                    $(
                        .with_member($crate::MemberDescriptor::from_shape(
                            stringify!($field),
                            $crate::macros::shape_of(None::<&$ty>.map(|s| &s.$field)),
                        ))
                    )+
            }
        }
    };
}

/// Implements [`NetValue`](crate::NetValue) for a fieldless enum. Variants
/// are numbered in the listed order and sent in the narrowest width that
/// holds them all.
#[macro_export]
macro_rules! net_enum {
    ($ty:ident as $name:literal { $($variant:ident),+ $(,)? }) => {
        impl $crate::NetValue for $ty {
            fn wire_type() -> $crate::WireType {
                $crate::WireType::Enum($name)
            }

            #[allow(unused_assignments)]
            fn to_value(&self) -> $crate::Value {
                let mut ordinal = 0u64;
                $(
                    if matches!(self, $ty::$variant) {
                        return $crate::Value::Enum(ordinal);
                    }
                    ordinal += 1;
                )+
                // Unlisted variant; rejected by the encoder as out of range.
                $crate::Value::Enum(u64::MAX)
            }

            fn from_value(value: $crate::Value) -> $crate::Result<Self> {
                let variants = [$($ty::$variant),+];
                let count = variants.len();
                match value {
                    $crate::Value::Enum(ordinal) => usize::try_from(ordinal)
                        .ok()
                        .and_then(|i| variants.into_iter().nth(i))
                        .ok_or_else(|| $crate::NetError::EnumOutOfRange {
                            name: $name.to_string(),
                            ordinal,
                            count,
                        }),
                    other => Err($crate::NetError::TypeMismatch {
                        expected: format!("enum {}", $name),
                        actual: other.kind_name().to_string(),
                    }),
                }
            }

            fn register_types(builder: &mut $crate::TypeRegistryBuilder) -> $crate::Result<()> {
                builder.insert_enum($crate::EnumDescriptor::new(
                    $name,
                    [$(stringify!($variant)),+],
                ))?;
                Ok(())
            }
        }
    };
}

/// Implements [`NetValue`](crate::NetValue) for a
/// [`NetSerializable`](crate::NetSerializable) type.
#[macro_export]
macro_rules! net_custom {
    ($ty:ty) => {
        impl $crate::NetValue for $ty {
            fn wire_type() -> $crate::WireType {
                $crate::WireType::Custom(<$ty as $crate::NetSerializable>::TYPE_NAME)
            }

            fn to_value(&self) -> $crate::Value {
                $crate::Value::Custom($crate::CustomValue::new(self.clone()))
            }

            fn from_value(value: $crate::Value) -> $crate::Result<Self> {
                let actual = value.kind_name();
                let decoded = match value {
                    $crate::Value::Custom(custom) => custom.downcast_ref::<$ty>().cloned(),
                    _ => None,
                };
                decoded.ok_or_else(|| $crate::NetError::TypeMismatch {
                    expected: <$ty as $crate::NetSerializable>::TYPE_NAME.to_string(),
                    actual: actual.to_string(),
                })
            }

            fn register_types(builder: &mut $crate::TypeRegistryBuilder) -> $crate::Result<()> {
                builder.insert_custom::<$ty>()?;
                Ok(())
            }
        }
    };
}
