//! Hot-swappable script-driven DSP generator units for a real-time synthesis
//! server.
//!
//! Clients publish small expression-language scripts under a numeric hash,
//! bind generator units to those hashes, and republish at will: every running
//! unit sharing the hash gets the new code without an audio dropout. The crate
//! is the lifecycle and concurrency core making that safe — the scripting VM
//! itself sits behind the [`vm::VmBackend`] seam (a small reference backend is
//! bundled as [`vm::expr::ExprBackend`]), and the host's command transport
//! sits in front of [`world::World::command()`].
//!
//! All cross-thread work runs through four-stage pipelines:
//!
//! ```text
//! stage 1 (RT)   command decoded, payload captured, pipeline submitted
//! stage 2 (NRT)  script parsed / VM built and compiled
//! stage 3 (RT)   new pointers published into the registry and units,
//!                between audio blocks
//! stage 4 (NRT)  displaced VMs and script records destroyed
//! cleanup (RT)   payload released, completion message relayed
//! ```
//!
//! The audio thread never blocks and never fails: a unit whose VM is still
//! compiling (or whose compile failed) produces silence until the next
//! successful publication. Units that die mid-compile are detected through
//! their ref-counted [`stub::UnitStub`] and the freshly built VM is rerouted
//! to destruction without ever being installed.

pub mod commands;
pub mod error;
mod pipeline;
mod registry;
mod runner;
pub mod script;
pub mod stub;
pub mod unit;
pub mod vm;
pub mod world;

/// Everything needed to embed the crate. Import with
/// `use scriptgen::prelude::*;`.
pub mod prelude {
    pub use crate::commands::Command;
    pub use crate::error::{CommandError, CompileError, ScriptError, WorldError};
    pub use crate::script::{ScriptRecord, ScriptSections};
    pub use crate::stub::UnitStub;
    pub use crate::unit::{UnitConfig, UnitId, UnitState};
    pub use crate::vm::expr::ExprBackend;
    pub use crate::vm::{DspVm, VmBackend, VmSpec};
    pub use crate::world::{World, WorldOptions, WorldStats};
}
