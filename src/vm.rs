//! The contract between the lifecycle core and a scripting VM implementation.
//!
//! The core never looks inside a VM: it constructs one on the non-real-time
//! thread through a [`VmBackend`], swaps it into a unit on the real-time
//! thread, calls [`DspVm::process()`] from the audio callback, and ships it
//! back to the non-real-time thread for destruction. The bundled
//! [`expr::ExprBackend`] is a small reference implementation of this contract;
//! a full scripting engine can be dropped in without touching the core.

use crate::error::CompileError;
use crate::script::ScriptRecord;

pub mod expr;

/// Everything a backend needs to know about the unit a VM is being built for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VmSpec {
    pub num_inputs: usize,
    pub num_outputs: usize,
    pub sample_rate: f64,
    pub block_size: usize,
}

/// A compiled, runnable script instance.
///
/// `process()` is called from the audio thread and must not allocate, block,
/// or otherwise leave real-time territory. Construction and destruction happen
/// on the non-real-time thread; the `Send` bound is what lets the core move
/// the instance between the two.
pub trait DspVm: Send {
    /// Process one block. `inputs` and `outputs` carry one slice per channel,
    /// all of the same length. `params` carries the current value for each of
    /// the unit's parameter slots, in slot order.
    fn process(&mut self, inputs: &[&[f32]], outputs: &mut [&mut [f32]], params: &[f32]);
}

/// A factory for [`DspVm`] instances. Called on the non-real-time thread only.
pub trait VmBackend: Send + Sync {
    /// Build and compile a VM for `script`.
    ///
    /// `param_indices` maps each of the unit's parameter slots to a position
    /// in the script's parameter-name table. An out-of-range index is not a
    /// compile error: the backend logs it and compiles the slot with a null
    /// binding, so the value written to that slot at block rate goes nowhere.
    fn compile(
        &self,
        script: &ScriptRecord,
        param_indices: &[i32],
        spec: &VmSpec,
    ) -> Result<Box<dyn DspVm>, CompileError>;
}
