//! Generator units: the audio-rate processors bound to a script hash.
//!
//! A unit never waits for its VM. While a compile is in flight (or after one
//! failed) the unit writes silence to all of its output channels; as soon as a
//! pipeline's real-time publication stage installs a VM, the next block is
//! produced by the script. All unit state is owned and mutated on the
//! real-time thread; the only field that travels is the stub, and that goes
//! through the pipeline payloads.

use std::sync::Arc;

use crate::error::WorldError;
use crate::registry::EntryId;
use crate::stub::UnitStub;
use crate::vm::DspVm;

/// Handle to a live unit slot. Stable for the unit's whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitId(u32);

impl UnitId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Self(index as u32)
    }
}

/// Construction-time inputs of a unit, the crate's rendition of the host's
/// UGen input channel layout `[codeID, updateFlag, useAudioThread, numInputs,
/// numParameters, ...audioInputs, ...(paramIndex, paramValue)*]`. The
/// parameter indices are read once here; the parameter *values* arrive with
/// every processed block.
#[derive(Debug, Clone)]
pub struct UnitConfig {
    /// The script hash this unit binds to.
    pub code_id: i32,
    /// When false, a republished script leaves this unit's running VM alone
    /// until the unit itself is rebuilt. Only consulted once a VM is
    /// installed; the first publication always lands.
    pub auto_update: bool,
    /// Compile the first VM synchronously on the audio thread instead of
    /// deferring to the helper thread. Saves one block of latency until first
    /// sound, at the cost of running a compiler inside the audio callback.
    /// Risky by design, off by default.
    pub use_audio_thread: bool,
    pub num_inputs: usize,
    pub num_outputs: usize,
    /// One entry per parameter slot, each resolving into the script's
    /// parameter-name table.
    pub param_indices: Vec<i32>,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            code_id: 0,
            auto_update: true,
            use_audio_thread: false,
            num_inputs: 0,
            num_outputs: 1,
            param_indices: Vec::new(),
        }
    }
}

/// Observable lifecycle state of a unit, derived from its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Bound to a hash with no published script yet. Emits silence.
    MissingScript,
    /// An init pipeline is in flight. A previously installed VM (if any) keeps
    /// running until the swap lands.
    Compiling,
    /// A VM is installed and producing output.
    Active,
    /// The last compile failed, or a real-time pool allocation failed. Emits
    /// silence until the script is republished.
    Failed,
}

pub(crate) struct GeneratorUnit {
    pub code_id: i32,
    pub active_vm: Option<Box<dyn DspVm>>,
    pub stub: Arc<UnitStub>,
    /// The registry entry this unit is linked into, `None` when entry
    /// allocation failed.
    pub entry: Option<EntryId>,
    /// Intrusive links of the entry's unit list.
    pub prev: Option<UnitId>,
    pub next: Option<UnitId>,
    pub param_indices: Vec<i32>,
    pub auto_update: bool,
    pub num_inputs: usize,
    pub num_outputs: usize,
    /// Set while an init pipeline for this unit is in flight.
    pub awaiting_compile: bool,
    /// Set when the last compile aborted or a pool allocation failed.
    pub failed: bool,
}

impl GeneratorUnit {
    pub fn new(config: &UnitConfig, stub: Arc<UnitStub>) -> Self {
        Self {
            code_id: config.code_id,
            active_vm: None,
            stub,
            entry: None,
            prev: None,
            next: None,
            param_indices: config.param_indices.clone(),
            auto_update: config.auto_update,
            num_inputs: config.num_inputs,
            num_outputs: config.num_outputs,
            awaiting_compile: false,
            failed: false,
        }
    }

    pub fn state(&self) -> UnitState {
        if self.awaiting_compile {
            UnitState::Compiling
        } else if self.active_vm.is_some() {
            UnitState::Active
        } else if self.failed {
            UnitState::Failed
        } else {
            UnitState::MissingScript
        }
    }

    /// Produce one block. Without a VM this clears the outputs instead.
    pub fn process(&mut self, inputs: &[&[f32]], outputs: &mut [&mut [f32]], params: &[f32]) {
        match &mut self.active_vm {
            Some(vm) => vm.process(inputs, outputs, params),
            None => {
                for channel in outputs.iter_mut() {
                    channel.fill(0.0);
                }
            }
        }
    }
}

/// Bounded slab of unit slots, standing in for the host's real-time allocator.
/// Slot indices stay stable for a unit's lifetime, which is what makes the
/// intrusive list links and the stub's owner slot meaningful.
pub(crate) struct UnitPool {
    slots: Vec<Option<GeneratorUnit>>,
    free: Vec<u32>,
}

impl UnitPool {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            free: (0..capacity as u32).rev().collect(),
        }
    }

    /// Allocate a slot and build the unit in place. The builder receives the
    /// slot's id so the unit's stub can be created pointing at it.
    pub fn insert_with(
        &mut self,
        build: impl FnOnce(UnitId) -> GeneratorUnit,
    ) -> Result<UnitId, WorldError> {
        let index = self
            .free
            .pop()
            .ok_or(WorldError::PoolExhausted { what: "unit slot" })?;
        let id = UnitId(index);
        self.slots[id.index()] = Some(build(id));
        Ok(id)
    }

    pub fn remove(&mut self, id: UnitId) -> Option<GeneratorUnit> {
        let unit = self.slots.get_mut(id.index())?.take();
        if unit.is_some() {
            self.free.push(id.0);
        }
        unit
    }

    pub fn get(&self, id: UnitId) -> Option<&GeneratorUnit> {
        self.slots.get(id.index())?.as_ref()
    }

    pub fn get_mut(&mut self, id: UnitId) -> Option<&mut GeneratorUnit> {
        self.slots.get_mut(id.index())?.as_mut()
    }

    /// Number of live units.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (UnitId, &GeneratorUnit)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| Some((UnitId::from_index(index), slot.as_ref()?)))
    }
}
