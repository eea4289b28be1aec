//! World snapshots of every synchronized type and their full and delta
//! encodings.
//!
//! Full snapshot, per synchronized type in registration order:
//! `[u32 count]` then each instance as a full-mask delta.
//!
//! Delta snapshot, per synchronized type:
//! `[u32 updated]` then `[u32 id][mask][changed members]` per updated
//! instance (new instances carry the full mask), then
//! `[u32 removed][u32 id]*`. Unchanged instances are omitted.

use crate::delta::{ChangeMask, DeltaCodec, DynamicState, StateObject};
use crate::error::{NetError, Result};
use crate::primitive::{NetReader, NetWriter};
use crate::protocol::StateId;
use crate::schema::{TypeDescriptor, TypeRegistry};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Supplies the live state objects of each synchronized type.
pub trait StateSource {
    fn states(&self, type_name: &str) -> Vec<&dyn StateObject>;
}

/// Receives decoded state and pushes it into the owning game objects.
pub trait StateSink {
    fn apply_state(&mut self, state: DynamicState) -> Result<()>;

    fn remove_state(&mut self, type_name: &'static str, id: StateId) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeSnapshot {
    descriptor: Arc<TypeDescriptor>,
    instances: BTreeMap<StateId, DynamicState>,
}

impl TypeSnapshot {
    fn new(descriptor: Arc<TypeDescriptor>) -> Self {
        Self {
            descriptor,
            instances: BTreeMap::new(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.descriptor.name
    }

    pub fn get(&self, id: StateId) -> Option<&DynamicState> {
        self.instances.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StateId, &DynamicState)> + '_ {
        self.instances.iter()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    fn insert(&mut self, id: StateId, state: DynamicState) -> Result<()> {
        if self.instances.insert(id, state).is_some() {
            return Err(NetError::InvalidMessage(format!(
                "duplicate {} id {}",
                self.descriptor.name, id
            )));
        }
        Ok(())
    }
}

/// Captured member values of every synchronized instance, keyed by
/// `(type, id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldSnapshot {
    types: Vec<TypeSnapshot>,
}

impl WorldSnapshot {
    pub fn empty(registry: &TypeRegistry) -> Self {
        Self {
            types: registry
                .synchronized_types()
                .map(|d| TypeSnapshot::new(Arc::clone(d)))
                .collect(),
        }
    }

    pub fn capture(registry: &TypeRegistry, source: &dyn StateSource) -> Result<Self> {
        let delta = DeltaCodec::new(registry);
        let mut snapshot = Self::empty(registry);
        for type_snapshot in &mut snapshot.types {
            let descriptor = Arc::clone(&type_snapshot.descriptor);
            for state in source.states(descriptor.name) {
                let id = delta.state_id(state)?;
                let captured = DynamicState::capture(Arc::clone(&descriptor), state)?;
                type_snapshot
                    .insert(id, captured)
                    .map_err(|_| NetError::InvalidValue(format!(
                        "two live {} objects share id {}",
                        descriptor.name, id
                    )))?;
            }
        }
        Ok(snapshot)
    }

    pub fn types(&self) -> &[TypeSnapshot] {
        &self.types
    }

    pub fn of_type(&self, type_name: &str) -> Option<&TypeSnapshot> {
        self.types.iter().find(|t| t.type_name() == type_name)
    }

    pub fn get(&self, type_name: &str, id: StateId) -> Option<&DynamicState> {
        self.of_type(type_name).and_then(|t| t.get(id))
    }

    pub fn instance_count(&self) -> usize {
        self.types.iter().map(TypeSnapshot::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.instance_count() == 0
    }
}

/// What a decoded delta changed, in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedDelta {
    pub updated: Vec<(&'static str, StateId)>,
    pub removed: Vec<(&'static str, StateId)>,
}

impl AppliedDelta {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Clone, Copy)]
pub struct SnapshotCodec<'r> {
    registry: &'r TypeRegistry,
    delta: DeltaCodec<'r>,
}

impl<'r> SnapshotCodec<'r> {
    pub fn new(registry: &'r TypeRegistry) -> Self {
        Self {
            registry,
            delta: DeltaCodec::new(registry),
        }
    }

    pub fn encode_full(&self, snapshot: &WorldSnapshot, writer: &mut NetWriter) -> Result<()> {
        self.check_layout(snapshot)?;
        for type_snapshot in &snapshot.types {
            writer.write_len(type_snapshot.len())?;
            for state in type_snapshot.instances.values() {
                self.delta.write_full(state, writer)?;
            }
        }
        log::trace!(
            "encoded full state: {} instances, {} bytes",
            snapshot.instance_count(),
            writer.len()
        );
        Ok(())
    }

    pub fn decode_full(&self, reader: &mut NetReader<'_>) -> Result<WorldSnapshot> {
        let mut snapshot = WorldSnapshot::empty(self.registry);
        for type_snapshot in &mut snapshot.types {
            let count = reader.read_len()?;
            for _ in 0..count {
                let state = self.delta.read_new(&type_snapshot.descriptor, reader)?;
                let id = state.id().ok_or_else(|| {
                    NetError::InvalidMessage(format!("{} without id", type_snapshot.type_name()))
                })?;
                type_snapshot.insert(id, state)?;
            }
        }
        reader.expect_end()?;
        Ok(snapshot)
    }

    /// Writes the difference from `baseline` to `current`. Returns the
    /// number of updated plus removed instances.
    pub fn encode_delta(
        &self,
        baseline: &WorldSnapshot,
        current: &WorldSnapshot,
        writer: &mut NetWriter,
    ) -> Result<usize> {
        self.check_layout(baseline)?;
        self.check_layout(current)?;

        let mut changes = 0;
        for (old, new) in baseline.types.iter().zip(&current.types) {
            let mut updates = Vec::new();
            for (id, state) in &new.instances {
                let mask = match old.get(*id) {
                    Some(previous) => self.delta.compute_change_mask(previous, state)?,
                    None => ChangeMask::ALL,
                };
                if !mask.is_empty() {
                    updates.push((*id, state, mask));
                }
            }

            writer.write_len(updates.len())?;
            for (id, state, mask) in &updates {
                writer.write_u32(*id);
                self.delta.write_delta(*state, *mask, writer)?;
            }

            let removed: Vec<StateId> = old
                .instances
                .keys()
                .filter(|id| new.get(**id).is_none())
                .copied()
                .collect();
            writer.write_len(removed.len())?;
            for id in &removed {
                writer.write_u32(*id);
            }

            changes += updates.len() + removed.len();
        }

        log::trace!("encoded delta state: {} changes, {} bytes", changes, writer.len());
        Ok(changes)
    }

    /// Applies a delta snapshot to `baseline` in place.
    pub fn apply_delta(
        &self,
        baseline: &mut WorldSnapshot,
        reader: &mut NetReader<'_>,
    ) -> Result<AppliedDelta> {
        self.check_layout(baseline)?;

        let mut applied = AppliedDelta::default();
        for type_snapshot in &mut baseline.types {
            let type_name = type_snapshot.type_name();

            let updated = reader.read_len()?;
            for _ in 0..updated {
                let id = reader.read_u32()?;
                match type_snapshot.instances.get_mut(&id) {
                    Some(state) => {
                        self.delta.read_delta(state, reader)?;
                    }
                    None => {
                        let mut state = DynamicState::empty(Arc::clone(&type_snapshot.descriptor));
                        let mask = self.delta.read_delta(&mut state, reader)?;
                        if !mask.covers(type_snapshot.descriptor.len()) {
                            return Err(NetError::UnknownState {
                                type_name: type_name.to_string(),
                                id,
                            });
                        }
                        type_snapshot.instances.insert(id, state);
                    }
                }
                let decoded_id = type_snapshot.get(id).and_then(DynamicState::id);
                if decoded_id != Some(id) {
                    return Err(NetError::InvalidMessage(format!(
                        "{} delta for id {} carries id {:?}",
                        type_name, id, decoded_id
                    )));
                }
                applied.updated.push((type_name, id));
            }

            let removed = reader.read_len()?;
            for _ in 0..removed {
                let id = reader.read_u32()?;
                if type_snapshot.instances.remove(&id).is_none() {
                    return Err(NetError::UnknownState {
                        type_name: type_name.to_string(),
                        id,
                    });
                }
                applied.removed.push((type_name, id));
            }
        }
        reader.expect_end()?;

        log::debug!(
            "applied delta state: {} updated, {} removed",
            applied.updated.len(),
            applied.removed.len()
        );
        Ok(applied)
    }

    fn check_layout(&self, snapshot: &WorldSnapshot) -> Result<()> {
        let matches = snapshot.types.len() == self.registry.synchronized_count()
            && snapshot
                .types
                .iter()
                .zip(self.registry.synchronized_types())
                .all(|(t, d)| t.type_name() == d.name);
        if !matches {
            return Err(NetError::mismatch(
                "snapshot of this registry's synchronized types",
                "snapshot of another registry",
            ));
        }
        Ok(())
    }
}
