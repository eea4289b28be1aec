//! Recursive object codec.
//!
//! Walks a [`Value`] against its declared [`WireType`]: presence flag for
//! nullable slots, primitives straight to the writer, custom types through
//! their own serializer, collections as `u32` count then elements, enums as
//! their minimal-width ordinal, composites member by member in descriptor
//! order.

use crate::error::{NetError, Result};
use crate::primitive::{NetReader, NetWriter};
use crate::schema::{MemberDescriptor, TypeRegistry};
use crate::value::{NetValue, Value, WireType};

#[derive(Clone, Copy)]
pub struct ObjectCodec<'r> {
    registry: &'r TypeRegistry,
}

impl<'r> ObjectCodec<'r> {
    pub fn new(registry: &'r TypeRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &'r TypeRegistry {
        self.registry
    }

    /// Encodes `value` as `ty`. `nullable` only applies to this outermost
    /// slot; `elements_nullable` only to the elements of a collection at
    /// this level.
    pub fn encode(
        &self,
        value: &Value,
        ty: &WireType,
        nullable: bool,
        elements_nullable: bool,
        writer: &mut NetWriter,
    ) -> Result<()> {
        if nullable {
            self.encode_present(value, ty, elements_nullable, writer)
        } else {
            self.encode_value(value, ty, elements_nullable, writer)
        }
    }

    pub fn decode(
        &self,
        ty: &WireType,
        nullable: bool,
        elements_nullable: bool,
        reader: &mut NetReader<'_>,
    ) -> Result<Value> {
        if nullable {
            self.decode_present(ty, elements_nullable, reader)
        } else {
            self.decode_value(ty, elements_nullable, reader)
        }
    }

    pub fn encode_member(
        &self,
        member: &MemberDescriptor,
        value: &Value,
        writer: &mut NetWriter,
    ) -> Result<()> {
        self.encode(
            value,
            &member.ty,
            member.is_nullable,
            member.elements_nullable,
            writer,
        )
        .map_err(|e| match e {
            NetError::NullInNonNullable(_) => NetError::NullInNonNullable(member.name.to_string()),
            e => e,
        })
    }

    pub fn decode_member(
        &self,
        member: &MemberDescriptor,
        reader: &mut NetReader<'_>,
    ) -> Result<Value> {
        self.decode(&member.ty, member.is_nullable, member.elements_nullable, reader)
    }

    pub fn encode_typed<T: NetValue>(&self, value: &T, writer: &mut NetWriter) -> Result<()> {
        self.encode(&value.to_value(), &T::wire_type(), false, false, writer)
    }

    pub fn decode_typed<T: NetValue>(&self, reader: &mut NetReader<'_>) -> Result<T> {
        T::from_value(self.decode(&T::wire_type(), false, false, reader)?)
    }

    fn encode_present(
        &self,
        value: &Value,
        ty: &WireType,
        elements_nullable: bool,
        writer: &mut NetWriter,
    ) -> Result<()> {
        // An Option type in a nullable slot shares the one presence flag.
        let ty = present_type(ty)?;
        if value.is_null() {
            writer.write_bool(false);
            return Ok(());
        }
        writer.write_bool(true);
        self.encode_value(value, ty, elements_nullable, writer)
    }

    fn decode_present(
        &self,
        ty: &WireType,
        elements_nullable: bool,
        reader: &mut NetReader<'_>,
    ) -> Result<Value> {
        let ty = present_type(ty)?;
        if !reader.read_bool()? {
            return Ok(Value::Null);
        }
        self.decode_value(ty, elements_nullable, reader)
    }

    fn encode_value(
        &self,
        value: &Value,
        ty: &WireType,
        elements_nullable: bool,
        writer: &mut NetWriter,
    ) -> Result<()> {
        match (ty, value) {
            (WireType::Option(_), _) => {
                return self.encode_present(value, ty, elements_nullable, writer)
            }
            (_, Value::Null) => return Err(NetError::NullInNonNullable(ty.to_string())),

            (WireType::Bool, Value::Bool(v)) => writer.write_bool(*v),
            (WireType::I8, Value::I8(v)) => writer.write_i8(*v),
            (WireType::U8, Value::U8(v)) => writer.write_u8(*v),
            (WireType::I16, Value::I16(v)) => writer.write_i16(*v),
            (WireType::U16, Value::U16(v)) => writer.write_u16(*v),
            (WireType::I32, Value::I32(v)) => writer.write_i32(*v),
            (WireType::U32, Value::U32(v)) => writer.write_u32(*v),
            (WireType::I64, Value::I64(v)) => writer.write_i64(*v),
            (WireType::U64, Value::U64(v)) => writer.write_u64(*v),
            (WireType::F32, Value::F32(v)) => writer.write_f32(*v),
            (WireType::F64, Value::F64(v)) => writer.write_f64(*v),
            (WireType::Decimal, Value::Decimal(v)) => writer.write_decimal(*v),
            (WireType::Char, Value::Char(v)) => writer.write_char(*v),
            (WireType::String, Value::String(v)) => writer.write_string(v)?,
            (WireType::Vec2, Value::Vec2(v)) => writer.write_vec2(*v),
            (WireType::Vec3, Value::Vec3(v)) => writer.write_vec3(*v),

            (WireType::Custom(name), Value::Custom(custom)) => {
                if !self.registry.has_custom(name) {
                    return Err(NetError::UnsupportedType(ty.to_string()));
                }
                if custom.type_name() != *name {
                    return Err(NetError::mismatch(ty, format!("custom {}", custom.type_name())));
                }
                custom.serialize(writer)?;
            }

            (WireType::List(element), Value::List(items)) => {
                writer.write_len(items.len())?;
                for item in items {
                    self.encode(item, element, elements_nullable, false, writer)?;
                }
            }

            (WireType::Enum(name), Value::Enum(ordinal)) => {
                let descriptor = self.registry.enum_descriptor(name)?;
                if *ordinal >= descriptor.count() as u64 {
                    return Err(NetError::EnumOutOfRange {
                        name: name.to_string(),
                        ordinal: *ordinal,
                        count: descriptor.count(),
                    });
                }
                writer.write_uint(*ordinal, descriptor.width())?;
            }

            (WireType::Composite(name), Value::Composite(members)) => {
                let descriptor = self.registry.describe(name)?;
                if members.len() != descriptor.len() {
                    return Err(NetError::mismatch(
                        format!("{} with {} members", name, descriptor.len()),
                        format!("{} members", members.len()),
                    ));
                }
                for (member, value) in descriptor.members().iter().zip(members) {
                    self.encode(value, &member.ty, false, false, writer)?;
                }
            }

            (ty, value) => return Err(NetError::mismatch(ty, value.kind_name())),
        }
        Ok(())
    }

    fn decode_value(
        &self,
        ty: &WireType,
        elements_nullable: bool,
        reader: &mut NetReader<'_>,
    ) -> Result<Value> {
        let value = match ty {
            WireType::Option(_) => return self.decode_present(ty, elements_nullable, reader),

            WireType::Bool => Value::Bool(reader.read_bool()?),
            WireType::I8 => Value::I8(reader.read_i8()?),
            WireType::U8 => Value::U8(reader.read_u8()?),
            WireType::I16 => Value::I16(reader.read_i16()?),
            WireType::U16 => Value::U16(reader.read_u16()?),
            WireType::I32 => Value::I32(reader.read_i32()?),
            WireType::U32 => Value::U32(reader.read_u32()?),
            WireType::I64 => Value::I64(reader.read_i64()?),
            WireType::U64 => Value::U64(reader.read_u64()?),
            WireType::F32 => Value::F32(reader.read_f32()?),
            WireType::F64 => Value::F64(reader.read_f64()?),
            WireType::Decimal => Value::Decimal(reader.read_decimal()?),
            WireType::Char => Value::Char(reader.read_char()?),
            WireType::String => Value::String(reader.read_string()?),
            WireType::Vec2 => Value::Vec2(reader.read_vec2()?),
            WireType::Vec3 => Value::Vec3(reader.read_vec3()?),

            WireType::Custom(name) => {
                let decode = self.registry.custom_decoder(name)?;
                Value::Custom(decode(reader)?)
            }

            WireType::List(element) => {
                reader.enter()?;
                let count = reader.read_len()?;
                // Every element takes at least one byte.
                let mut items = Vec::with_capacity(count.min(reader.remaining()));
                for _ in 0..count {
                    items.push(self.decode(element, elements_nullable, false, reader)?);
                }
                reader.leave();
                Value::List(items)
            }

            WireType::Enum(name) => {
                let descriptor = self.registry.enum_descriptor(name)?;
                let ordinal = reader.read_uint(descriptor.width())?;
                if ordinal >= descriptor.count() as u64 {
                    return Err(NetError::InvalidMessage(format!(
                        "ordinal {} out of range for enum {} ({} enumerators)",
                        ordinal,
                        name,
                        descriptor.count()
                    )));
                }
                Value::Enum(ordinal)
            }

            WireType::Composite(name) => {
                let descriptor = self.registry.describe(name)?;
                reader.enter()?;
                let mut members = Vec::with_capacity(descriptor.len());
                for member in descriptor.members() {
                    members.push(self.decode(&member.ty, false, false, reader)?);
                }
                reader.leave();
                Value::Composite(members)
            }
        };
        Ok(value)
    }
}

/// Strips the one `Option` layer a presence flag stands for. A second layer
/// would need its own flag that `Value::Null` cannot express.
fn present_type(ty: &WireType) -> Result<&WireType> {
    match ty {
        WireType::Option(inner) if matches!(**inner, WireType::Option(_)) => {
            Err(NetError::UnsupportedType(ty.to_string()))
        }
        WireType::Option(inner) => Ok(inner.as_ref()),
        other => Ok(other),
    }
}
