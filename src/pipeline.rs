//! The four-stage pipeline payloads and their per-stage behavior.
//!
//! Each pipeline kind is one variant of [`Task`]; the runner moves the whole
//! task value between threads, so ownership of everything inside it transfers
//! with the stage handoff. The stage schedule is fixed:
//!
//! ```text
//! stage 2 (NRT)  →  stage 3 (RT)  →  stage 4 (NRT)  →  cleanup (RT)
//! ```
//!
//! A stage returning `false` short-circuits the remaining stages; cleanup
//! always runs. The destroy-VM and free-script pipelines use that
//! deliberately: they do their work in stage 2 and return `false` because
//! there is nothing left to do on the other thread.
//!
//! Heap objects owned by the non-real-time side (VMs, script records) are only
//! ever dropped inside stage 2 or stage 4 so their deallocation never lands on
//! the audio thread. The exception paths that would violate this (queue
//! overflow during a handoff) are logged as errors.

use std::fs;
use std::mem;
use std::path::PathBuf;
use std::sync::Arc;

use log::error;

use crate::script::ScriptRecord;
use crate::stub::UnitStub;
use crate::vm::{DspVm, VmBackend, VmSpec};
use crate::world::RtContext;

/// One in-flight pipeline.
pub(crate) enum Task {
    /// Compile a VM for one unit and swap it in.
    Init(InitTask),
    /// Publish a script and fan it out to every unit bound to its hash.
    Fanout(FanoutTask),
    /// Destroy a VM displaced by a dying unit. Stage-2-only.
    DestroyVm(DestroyVmTask),
    /// Destroy a freed script record. Stage-2-only.
    FreeScript(FreeScriptTask),
}

/// Pipeline kind tag, used for bookkeeping after the task has been consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskKind {
    Init,
    Fanout,
    DestroyVm,
    FreeScript,
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::Init(_) => TaskKind::Init,
            Task::Fanout(_) => TaskKind::Fanout,
            Task::DestroyVm(_) => TaskKind::DestroyVm,
            Task::FreeScript(_) => TaskKind::FreeScript,
        }
    }

    /// Stage 2, non-real-time: construction, parsing, compilation, and the
    /// destruction work of the stage-2-only pipelines.
    pub fn stage2(&mut self, backend: &dyn VmBackend) -> bool {
        match self {
            Task::Init(task) => task.create_and_compile(backend),
            Task::Fanout(task) => task.load_and_parse(backend),
            Task::DestroyVm(task) => {
                task.vm = None;
                false
            }
            Task::FreeScript(task) => {
                task.script = None;
                false
            }
        }
    }

    /// Stage 3, real-time, between blocks: publication into units and the
    /// registry.
    pub fn stage3(&mut self, ctx: &mut RtContext<'_>) -> bool {
        match self {
            Task::Init(task) => task.publish(ctx),
            Task::Fanout(task) => task.registry_swap(ctx),
            // Stage-2-only pipelines never reach this point
            Task::DestroyVm(_) | Task::FreeScript(_) => true,
        }
    }

    /// Stage 4, non-real-time: destroy whatever stage 3 displaced.
    pub fn stage4(&mut self) -> bool {
        match self {
            Task::Init(task) => {
                task.old_vm = None;
                task.script = None;
                true
            }
            Task::Fanout(task) => {
                task.parsed = None;
                task.old_script = None;
                true
            }
            Task::DestroyVm(_) | Task::FreeScript(_) => true,
        }
    }

    /// Cleanup, real-time. Always runs, also after a short-circuit. Dropping
    /// the task here releases the stub reference an init pipeline holds.
    /// Returns the completion message to relay to the client, if any.
    pub fn cleanup(self, ctx: &mut RtContext<'_>, aborted: bool) -> Option<Vec<u8>> {
        match self {
            Task::Init(task) => {
                task.finish(ctx, aborted);
                None
            }
            Task::Fanout(mut task) => task.completion.take(),
            Task::DestroyVm(_) | Task::FreeScript(_) => None,
        }
    }
}

/// Payload of the per-unit compile-then-swap pipeline. The stub reference is
/// acquired (cloned) on the real-time thread before submission and released
/// when the task is dropped during cleanup.
pub(crate) struct InitTask {
    pub stub: Arc<UnitStub>,
    /// The script this VM is compiled from. Dropped in stage 4 (or inside a
    /// failing stage 2) so the record's deallocation stays off the audio
    /// thread.
    pub script: Option<Arc<ScriptRecord>>,
    pub spec: VmSpec,
    pub param_indices: Vec<i32>,
    pub new_vm: Option<Box<dyn DspVm>>,
    pub old_vm: Option<Box<dyn DspVm>>,
}

impl InitTask {
    /// Stage 2: build and compile the new VM.
    fn create_and_compile(&mut self, backend: &dyn VmBackend) -> bool {
        let Some(script) = &self.script else {
            return false;
        };
        match backend.compile(script, &self.param_indices, &self.spec) {
            Ok(vm) => {
                self.new_vm = Some(vm);
                true
            }
            Err(err) => {
                error!("{err}");
                // Release our script reference here on the helper thread; the
                // running VM (if any) stays untouched
                self.script = None;
                false
            }
        }
    }

    /// Stage 3: swap the new VM into the unit — unless the unit died while we
    /// were compiling, in which case the new VM takes the "old VM" seat so
    /// stage 4 destroys it.
    fn publish(&mut self, ctx: &mut RtContext<'_>) -> bool {
        let unit = match self.stub.owner() {
            Some(id) => ctx.units.get_mut(id),
            None => None,
        };
        match unit {
            Some(unit) => {
                self.old_vm = mem::replace(&mut unit.active_vm, self.new_vm.take());
                unit.awaiting_compile = false;
                unit.failed = false;
            }
            None => {
                self.old_vm = self.new_vm.take();
            }
        }
        true
    }

    /// Cleanup: mark the unit failed if its compile aborted and it has nothing
    /// to play. Dropping `self` afterwards is the stub release.
    fn finish(self, ctx: &mut RtContext<'_>, aborted: bool) {
        if aborted {
            let unit = match self.stub.owner() {
                Some(id) => ctx.units.get_mut(id),
                None => None,
            };
            if let Some(unit) = unit {
                unit.awaiting_compile = false;
                if unit.active_vm.is_none() {
                    unit.failed = true;
                }
            }
        }
    }
}

/// Where a published script's text comes from.
pub(crate) enum ScriptSource {
    File(PathBuf),
    Inline(String),
}

/// Payload of the publish-and-hot-swap pipeline.
pub(crate) struct FanoutTask {
    pub hash: i32,
    pub source: ScriptSource,
    /// Parameter names copied out of the command on the real-time thread;
    /// consumed into the record in stage 2.
    pub param_names: Vec<String>,
    /// Spec used for the stage-2 test compile.
    pub test_spec: VmSpec,
    pub parsed: Option<Arc<ScriptRecord>>,
    pub old_script: Option<Arc<ScriptRecord>>,
    pub completion: Option<Vec<u8>>,
}

impl FanoutTask {
    /// Stage 2: read (or take) the source text, parse the sections, and test
    /// compile so a broken script never replaces a working one.
    fn load_and_parse(&mut self, backend: &dyn VmBackend) -> bool {
        let source = match &mut self.source {
            ScriptSource::File(path) => match fs::read_to_string(path.as_path()) {
                Ok(text) => text,
                Err(err) => {
                    error!("could not read script file {}: {err}", path.display());
                    return false;
                }
            },
            ScriptSource::Inline(text) => mem::take(text),
        };

        let record = match ScriptRecord::parse(&source, mem::take(&mut self.param_names)) {
            Ok(record) => record,
            Err(err) => {
                error!("script for hash {} rejected: {err}", self.hash);
                return false;
            }
        };

        if let Err(err) = backend.compile(&record, &[], &self.test_spec) {
            error!("script for hash {} rejected: {err}", self.hash);
            return false;
        }

        self.parsed = Some(Arc::new(record));
        true
    }

    /// Stage 3: install the script in the registry and kick off one init
    /// pipeline per bound unit. Those pipelines capture the *new* record, so a
    /// concurrent older fanout freeing its displaced record in stage 4 can
    /// never pull text out from under them.
    fn registry_swap(&mut self, ctx: &mut RtContext<'_>) -> bool {
        let Some(script) = self.parsed.clone() else {
            return false;
        };

        match ctx.registry.find(self.hash) {
            None => match ctx.registry.insert_or_get(self.hash) {
                Ok(id) => {
                    ctx.registry.publish(id, script);
                }
                Err(err) => {
                    error!("could not register script {}: {err}", self.hash);
                }
            },
            Some(id) => {
                self.old_script = ctx.registry.publish(id, Arc::clone(&script));
                let mut current = ctx.registry.get(id).and_then(|entry| entry.units_head);
                while let Some(unit_id) = current {
                    current = ctx.units.get(unit_id).and_then(|unit| unit.next);
                    ctx.update_unit_code(unit_id, &script);
                }
            }
        }
        true
    }
}

/// Stage-2-only payload carrying a dying unit's VM to its destruction.
pub(crate) struct DestroyVmTask {
    pub vm: Option<Box<dyn DspVm>>,
}

/// Stage-2-only payload carrying a freed script record to its destruction.
pub(crate) struct FreeScriptTask {
    pub script: Option<Arc<ScriptRecord>>,
}
