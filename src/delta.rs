use crate::codec::ObjectCodec;
use crate::error::{NetError, Result};
use crate::primitive::{NetReader, NetWriter};
use crate::schema::{TypeDescriptor, TypeRegistry};
use crate::value::{NetValue, Value};
use std::fmt;
use std::sync::Arc;

/// Bit `i` set means member `i` differs from the baseline.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChangeMask(u32);

impl ChangeMask {
    pub const NONE: ChangeMask = ChangeMask(0);
    /// Mask used for full-state writes.
    pub const ALL: ChangeMask = ChangeMask(u32::MAX);

    pub const fn from_bits(bits: u32) -> Self {
        ChangeMask(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn is_set(self, index: usize) -> bool {
        index < 32 && self.0 & (1 << index) != 0
    }

    pub fn set(&mut self, index: usize) {
        if index < 32 {
            self.0 |= 1 << index;
        }
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_full(self) -> bool {
        self.0 == u32::MAX
    }

    /// True when every member of a `len`-member type is set.
    pub fn covers(self, len: usize) -> bool {
        self.indices(len).count() == len.min(32)
    }

    /// Set bits below `len`, in member order.
    pub fn indices(self, len: usize) -> impl Iterator<Item = usize> {
        (0..len.min(32)).filter(move |i| self.is_set(*i))
    }
}

impl fmt::Debug for ChangeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChangeMask({:#034b})", self.0)
    }
}

/// Member-indexed access to a synchronized object. Indices follow the
/// type's descriptor order.
pub trait StateObject {
    fn type_name(&self) -> &'static str;

    fn member(&self, index: usize) -> Result<Value>;

    fn set_member(&mut self, index: usize, value: Value) -> Result<()>;
}

/// A Rust type registered as a composite with a fixed member list,
/// usually implemented through [`net_state!`](crate::net_state).
pub trait NetState: StateObject + NetValue + Default + Clone + 'static {
    const TYPE_NAME: &'static str;

    fn describe() -> TypeDescriptor;
}

/// State object held as tagged member values. Used on the receiving side
/// when the concrete Rust type lives in the game layer.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicState {
    descriptor: Arc<TypeDescriptor>,
    members: Vec<Value>,
}

impl DynamicState {
    /// Instance with every member unset, to be filled by a full-mask read.
    pub fn empty(descriptor: Arc<TypeDescriptor>) -> Self {
        let members = vec![Value::Null; descriptor.len()];
        Self {
            descriptor,
            members,
        }
    }

    pub fn capture(descriptor: Arc<TypeDescriptor>, source: &dyn StateObject) -> Result<Self> {
        if source.type_name() != descriptor.name {
            return Err(NetError::mismatch(descriptor.name, source.type_name()));
        }
        let members = (0..descriptor.len())
            .map(|i| source.member(i))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            descriptor,
            members,
        })
    }

    pub fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.descriptor
    }

    pub fn members(&self) -> &[Value] {
        &self.members
    }

    pub fn id(&self) -> Option<u32> {
        self.descriptor
            .id_member()
            .and_then(|i| self.members.get(i))
            .and_then(Value::as_u32)
    }

    /// Converts into the registered Rust type.
    pub fn into_typed<S: NetState>(self) -> Result<S> {
        if self.descriptor.name != S::TYPE_NAME {
            return Err(NetError::mismatch(S::TYPE_NAME, self.descriptor.name));
        }
        S::from_value(Value::Composite(self.members))
    }

    /// Copies every member into `target`.
    pub fn apply_to(&self, target: &mut dyn StateObject) -> Result<()> {
        for (i, value) in self.members.iter().enumerate() {
            target.set_member(i, value.clone())?;
        }
        Ok(())
    }
}

impl StateObject for DynamicState {
    fn type_name(&self) -> &'static str {
        self.descriptor.name
    }

    fn member(&self, index: usize) -> Result<Value> {
        self.members
            .get(index)
            .cloned()
            .ok_or_else(|| NetError::MemberOutOfRange {
                type_name: self.descriptor.name.to_string(),
                index,
            })
    }

    fn set_member(&mut self, index: usize, value: Value) -> Result<()> {
        let slot = self
            .members
            .get_mut(index)
            .ok_or_else(|| NetError::MemberOutOfRange {
                type_name: self.descriptor.name.to_string(),
                index,
            })?;
        *slot = value;
        Ok(())
    }
}

/// Change-mask encoding of synchronized objects:
/// `[u32 mask][member value for each set bit, in member order]`.
#[derive(Clone, Copy)]
pub struct DeltaCodec<'r> {
    codec: ObjectCodec<'r>,
}

impl<'r> DeltaCodec<'r> {
    pub fn new(registry: &'r TypeRegistry) -> Self {
        Self {
            codec: ObjectCodec::new(registry),
        }
    }

    pub fn object_codec(&self) -> ObjectCodec<'r> {
        self.codec
    }

    pub fn descriptor_of(&self, state: &dyn StateObject) -> Result<&'r Arc<TypeDescriptor>> {
        self.codec.registry().describe(state.type_name())
    }

    /// Reads the `u32` id member.
    pub fn state_id(&self, state: &dyn StateObject) -> Result<u32> {
        let descriptor = self.descriptor_of(state)?;
        let index = descriptor
            .id_member()
            .ok_or_else(|| NetError::MissingIdMember(descriptor.name.to_string()))?;
        match state.member(index)? {
            Value::U32(id) => Ok(id),
            other => Err(NetError::mismatch("U32", other.kind_name())),
        }
    }

    pub fn compute_change_mask(
        &self,
        old: &dyn StateObject,
        new: &dyn StateObject,
    ) -> Result<ChangeMask> {
        if old.type_name() != new.type_name() {
            return Err(NetError::mismatch(old.type_name(), new.type_name()));
        }
        let descriptor = self.descriptor_of(new)?;
        let mut mask = ChangeMask::NONE;
        for i in 0..descriptor.len() {
            if old.member(i)? != new.member(i)? {
                mask.set(i);
            }
        }
        Ok(mask)
    }

    pub fn write_delta(
        &self,
        state: &dyn StateObject,
        mask: ChangeMask,
        writer: &mut NetWriter,
    ) -> Result<()> {
        let descriptor = self.descriptor_of(state)?;
        writer.write_u32(mask.bits());
        for i in mask.indices(descriptor.len()) {
            self.codec
                .encode_member(descriptor.member(i)?, &state.member(i)?, writer)?;
        }
        Ok(())
    }

    pub fn write_full(&self, state: &dyn StateObject, writer: &mut NetWriter) -> Result<()> {
        self.write_delta(state, ChangeMask::ALL, writer)
    }

    /// Diffs and writes in one step. Returns the mask that was written.
    pub fn write_changes(
        &self,
        old: &dyn StateObject,
        new: &dyn StateObject,
        writer: &mut NetWriter,
    ) -> Result<ChangeMask> {
        let mask = self.compute_change_mask(old, new)?;
        self.write_delta(new, mask, writer)?;
        Ok(mask)
    }

    /// Overwrites the members named by the mask in place. Unlisted members
    /// keep their values. Bits past the last member are ignored.
    pub fn read_delta(
        &self,
        target: &mut dyn StateObject,
        reader: &mut NetReader<'_>,
    ) -> Result<ChangeMask> {
        let descriptor = self.descriptor_of(target)?;
        let mask = ChangeMask::from_bits(reader.read_u32()?);
        for i in mask.indices(descriptor.len()) {
            let value = self.codec.decode_member(descriptor.member(i)?, reader)?;
            target.set_member(i, value)?;
        }
        Ok(mask)
    }

    /// Decodes a full-mask object into a fresh [`DynamicState`].
    pub fn read_new(
        &self,
        descriptor: &Arc<TypeDescriptor>,
        reader: &mut NetReader<'_>,
    ) -> Result<DynamicState> {
        let mut state = DynamicState::empty(Arc::clone(descriptor));
        let mask = self.read_delta(&mut state, reader)?;
        if !mask.covers(descriptor.len()) {
            return Err(NetError::InvalidMessage(format!(
                "new {} instance sent with partial mask {:?}",
                descriptor.name, mask
            )));
        }
        Ok(state)
    }
}
