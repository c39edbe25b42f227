//! The world: the explicit context object owning all real-time state.
//!
//! The original plugin keeps its registry in a process-wide global; here the
//! whole thing — registry, unit slots, the command runner — is one injected
//! value the embedding server threads through its calls. Everything except
//! [`World::pump_nrt()`] is meant to be called from the real-time thread:
//! commands are stage 1 of their pipelines, [`World::handle_deferred()`] is
//! where stage 3 and cleanup callbacks run between audio blocks, and block
//! processing never overlaps either of them.

use std::sync::{Arc, Weak};

use log::error;
use rosc::OscType;
use serde::{Deserialize, Serialize};

use crate::commands::Command;
use crate::error::{CommandError, WorldError};
use crate::pipeline::{
    DestroyVmTask, FanoutTask, FreeScriptTask, InitTask, ScriptSource, Task, TaskKind,
};
use crate::registry::Registry;
use crate::runner::{CommandRunner, RtJob, Submitter};
use crate::script::ScriptRecord;
use crate::stub::UnitStub;
use crate::unit::{GeneratorUnit, UnitConfig, UnitId, UnitPool, UnitState};
use crate::vm::{VmBackend, VmSpec};

/// Sizing and rate configuration, fixed at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldOptions {
    pub sample_rate: f64,
    pub block_size: usize,
    /// Capacity of the unit slab. Allocation failures degrade the affected
    /// unit to silence, they never fail the audio thread.
    pub max_units: usize,
    /// Capacity of the registry slab.
    pub max_scripts: usize,
    /// Capacity of both runner queues.
    pub task_queue_capacity: usize,
}

impl Default for WorldOptions {
    fn default() -> Self {
        Self {
            sample_rate: 48_000.0,
            block_size: 64,
            max_units: 1024,
            max_scripts: 256,
            task_queue_capacity: 4096,
        }
    }
}

/// Pipeline bookkeeping, readable at any time from the real-time thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorldStats {
    pub init_submitted: u64,
    pub fanout_submitted: u64,
    pub destroy_submitted: u64,
    pub free_submitted: u64,
    /// Pipelines whose cleanup ran after all stages completed.
    pub completed: u64,
    /// Init/fanout pipelines that short-circuited on a failure.
    pub aborted: u64,
}

/// The split-borrow view of the world a real-time stage operates on.
pub(crate) struct RtContext<'a> {
    pub registry: &'a mut Registry,
    pub units: &'a mut UnitPool,
    pub submitter: &'a Submitter,
    pub stats: &'a mut WorldStats,
    pub sample_rate: f64,
    pub block_size: usize,
}

impl RtContext<'_> {
    /// Submit an init pipeline compiling `script` for `unit_id`. Called at
    /// unit construction and from a fanout's stage 3. A unit that already has
    /// a VM and opted out of updates keeps running its old code; a unit with
    /// no VM always takes the publication.
    pub fn update_unit_code(&mut self, unit_id: UnitId, script: &Arc<ScriptRecord>) {
        let Some(unit) = self.units.get_mut(unit_id) else {
            return;
        };
        if unit.active_vm.is_some() && !unit.auto_update {
            return;
        }

        let task = Task::Init(InitTask {
            stub: Arc::clone(&unit.stub),
            script: Some(Arc::clone(script)),
            spec: VmSpec {
                num_inputs: unit.num_inputs,
                num_outputs: unit.num_outputs,
                sample_rate: self.sample_rate,
                block_size: self.block_size,
            },
            param_indices: unit.param_indices.clone(),
            new_vm: None,
            old_vm: None,
        });

        unit.awaiting_compile = true;
        if self.submitter.submit(task) {
            self.stats.init_submitted += 1;
        } else {
            unit.awaiting_compile = false;
            error!("task queue unavailable, unit keeps its current code");
        }
    }
}

/// See the module docs.
pub struct World {
    options: WorldOptions,
    registry: Registry,
    units: UnitPool,
    runner: CommandRunner,
    backend: Arc<dyn VmBackend>,
    stats: WorldStats,
    completion_hook: Option<Box<dyn FnMut(Vec<u8>) + Send>>,
}

impl World {
    /// Build a world whose non-real-time stages run on a dedicated helper
    /// thread.
    pub fn new(options: WorldOptions, backend: Arc<dyn VmBackend>) -> Self {
        let runner = CommandRunner::spawn(Arc::clone(&backend), options.task_queue_capacity);
        Self::build(options, backend, runner)
    }

    /// Build a world without a helper thread; the embedder pumps queued
    /// non-real-time work through [`pump_nrt()`][Self::pump_nrt()]. This is
    /// what the test harness uses to control stage interleaving exactly.
    pub fn new_manual(options: WorldOptions, backend: Arc<dyn VmBackend>) -> Self {
        let runner = CommandRunner::manual(Arc::clone(&backend), options.task_queue_capacity);
        Self::build(options, backend, runner)
    }

    fn build(options: WorldOptions, backend: Arc<dyn VmBackend>, runner: CommandRunner) -> Self {
        Self {
            registry: Registry::with_capacity(options.max_scripts),
            units: UnitPool::with_capacity(options.max_units),
            runner,
            backend,
            stats: WorldStats::default(),
            completion_hook: None,
            options,
        }
    }

    pub fn options(&self) -> &WorldOptions {
        &self.options
    }

    pub fn stats(&self) -> WorldStats {
        self.stats
    }

    /// Invoked with the completion message of a finished `add-file` /
    /// `add-script` command, so the host can relay it to the client.
    pub fn set_completion_hook(&mut self, hook: impl FnMut(Vec<u8>) + Send + 'static) {
        self.completion_hook = Some(Box::new(hook));
    }

    // ---------------------------------------------------------------------
    // Commands (stage 1, real-time)
    // ---------------------------------------------------------------------

    /// Decode and run a plugin command. A malformed argument list is logged
    /// and rejected without submitting anything.
    pub fn command(&mut self, name: &str, args: &[OscType]) -> Result<(), CommandError> {
        match Command::parse(name, args) {
            Ok(command) => {
                self.run_command(command);
                Ok(())
            }
            Err(err) => {
                error!("bad \"{name}\" command: {err}");
                Err(err)
            }
        }
    }

    pub fn run_command(&mut self, command: Command) {
        match command {
            Command::AddFile {
                hash,
                path,
                param_names,
                completion,
            } => self.submit_fanout(hash, ScriptSource::File(path), param_names, completion),
            Command::AddScript {
                hash,
                source,
                param_names,
                completion,
            } => self.submit_fanout(hash, ScriptSource::Inline(source), param_names, completion),
            Command::Free { hash } => self.free_script(hash),
            Command::FreeAll => self.free_all_scripts(),
        }
    }

    fn submit_fanout(
        &mut self,
        hash: i32,
        source: ScriptSource,
        param_names: Vec<String>,
        completion: Option<Vec<u8>>,
    ) {
        let task = Task::Fanout(FanoutTask {
            hash,
            source,
            param_names,
            test_spec: VmSpec {
                num_inputs: 0,
                num_outputs: 0,
                sample_rate: self.options.sample_rate,
                block_size: self.options.block_size,
            },
            parsed: None,
            old_script: None,
            completion,
        });
        if self.runner.submitter().submit(task) {
            self.stats.fanout_submitted += 1;
        } else {
            error!("task queue unavailable, dropping script update for hash {hash}");
        }
    }

    /// Unlink the hash's entry from the chain immediately and defer the
    /// script's destruction to the helper thread. Units bound to the entry
    /// keep playing their installed VMs; the entry's slot is recycled when the
    /// last of them goes away.
    pub fn free_script(&mut self, hash: i32) {
        match self.registry.find(hash) {
            None => error!("could not free script {hash}: not found"),
            Some(id) => {
                if let Some(script) = self.registry.begin_free(id) {
                    let task = Task::FreeScript(FreeScriptTask {
                        script: Some(script),
                    });
                    if self.runner.submitter().submit(task) {
                        self.stats.free_submitted += 1;
                    } else {
                        error!("task queue unavailable, freeing script {hash} on the audio thread");
                    }
                }
            }
        }
    }

    pub fn free_all_scripts(&mut self) {
        while let Some(id) = self.registry.head() {
            if let Some(script) = self.registry.begin_free(id) {
                let task = Task::FreeScript(FreeScriptTask {
                    script: Some(script),
                });
                if self.runner.submitter().submit(task) {
                    self.stats.free_submitted += 1;
                } else {
                    error!("task queue unavailable, freeing a script on the audio thread");
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Units (driven by the embedding server, real-time)
    // ---------------------------------------------------------------------

    /// Construct a unit bound to `config.code_id`. The unit exists and
    /// processes (possibly silence) from this point on, whatever happens to
    /// its script; only unit-slot exhaustion is a hard error.
    pub fn spawn_unit(&mut self, config: &UnitConfig) -> Result<UnitId, WorldError> {
        let unit_id = self
            .units
            .insert_with(|id| GeneratorUnit::new(config, UnitStub::new(id)))?;

        let entry = match self.registry.insert_or_get(config.code_id) {
            Ok(entry) => Some(entry),
            Err(err) => {
                error!("unit degraded to silence: {err}");
                None
            }
        };
        match entry {
            Some(entry) => self.registry.link_unit(&mut self.units, entry, unit_id),
            None => {
                if let Some(unit) = self.units.get_mut(unit_id) {
                    unit.failed = true;
                }
            }
        }

        let script = entry
            .and_then(|entry| self.registry.get(entry))
            .and_then(|entry| entry.script.clone());
        match script {
            Some(script) if config.use_audio_thread => {
                // Synchronous compile on the audio thread. Explicitly opted
                // into: trades one block of latency for running a compiler
                // inside the callback.
                let spec = VmSpec {
                    num_inputs: config.num_inputs,
                    num_outputs: config.num_outputs,
                    sample_rate: self.options.sample_rate,
                    block_size: self.options.block_size,
                };
                match self.backend.compile(&script, &config.param_indices, &spec) {
                    Ok(vm) => {
                        if let Some(unit) = self.units.get_mut(unit_id) {
                            unit.active_vm = Some(vm);
                        }
                    }
                    Err(err) => {
                        error!("{err}");
                        if let Some(unit) = self.units.get_mut(unit_id) {
                            unit.failed = true;
                        }
                    }
                }
            }
            Some(script) => {
                let mut ctx = self.rt_context();
                ctx.update_unit_code(unit_id, &script);
            }
            None => {
                if entry.is_some() {
                    // The script may well be published later; the fanout will
                    // pick this unit up then
                    error!("no script with hash {} yet, unit stays silent", config.code_id);
                }
            }
        }

        Ok(unit_id)
    }

    /// Tear a unit down. The stub is orphaned first so any in-flight pipeline
    /// reroutes its VM to destruction; the installed VM (if any) is shipped to
    /// the helper thread for the same reason.
    pub fn free_unit(&mut self, unit_id: UnitId) {
        let entry = match self.units.get(unit_id) {
            Some(unit) => {
                unit.stub.orphan();
                unit.entry
            }
            None => {
                error!("attempted to free an unknown unit");
                return;
            }
        };

        if let Some(entry) = entry {
            self.registry.unlink_unit(&mut self.units, entry, unit_id);
            self.registry.release_if_unused(entry);
        }

        if let Some(mut unit) = self.units.remove(unit_id) {
            if let Some(vm) = unit.active_vm.take() {
                let task = Task::DestroyVm(DestroyVmTask { vm: Some(vm) });
                if self.runner.submitter().submit(task) {
                    self.stats.destroy_submitted += 1;
                } else {
                    error!("task queue unavailable, destroying a VM on the audio thread");
                }
            }
            // Dropping the unit releases its stub reference; the stub itself
            // lives on while pipelines still hold it
        }
    }

    /// Produce one block for `unit_id`. A unit with no VM — still compiling,
    /// failed, or missing its script — writes silence.
    pub fn process_block(
        &mut self,
        unit_id: UnitId,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        params: &[f32],
    ) {
        match self.units.get_mut(unit_id) {
            Some(unit) => unit.process(inputs, outputs, params),
            None => {
                for channel in outputs.iter_mut() {
                    channel.fill(0.0);
                }
            }
        }
    }

    // ---------------------------------------------------------------------
    // Stage scheduling
    // ---------------------------------------------------------------------

    /// Run every pending stage-3 and cleanup callback. Call between audio
    /// blocks on the real-time thread; never concurrently with
    /// [`process_block()`][Self::process_block()]. Returns the number of jobs
    /// handled.
    pub fn handle_deferred(&mut self) -> usize {
        let mut handled = 0;
        while let Some(job) = self.runner.try_recv_rt() {
            handled += 1;
            match job {
                RtJob::Stage3(mut task) => {
                    let ok = {
                        let mut ctx = self.rt_context();
                        task.stage3(&mut ctx)
                    };
                    if ok {
                        if let Err(mut task) = self.runner.dispatch_stage4(task) {
                            // Handoff failed: run the reap here so the
                            // pipeline still finishes instead of leaking
                            let _ = task.stage4();
                            self.finish_task(task, false);
                        }
                    } else {
                        self.finish_task(task, true);
                    }
                }
                RtJob::Cleanup { task, aborted } => self.finish_task(task, aborted),
            }
        }
        handled
    }

    /// Manual mode only: run queued non-real-time stages on the calling
    /// thread. Returns the number of jobs executed.
    pub fn pump_nrt(&mut self) -> usize {
        self.runner.pump_nrt()
    }

    /// Manual mode only: alternate the two queues until every in-flight
    /// pipeline has run to completion.
    pub fn settle(&mut self) {
        debug_assert!(self.runner.is_manual());
        loop {
            let ran_nrt = self.runner.pump_nrt();
            let ran_rt = self.handle_deferred();
            if ran_nrt == 0 && ran_rt == 0 {
                return;
            }
        }
    }

    /// Plugin unload: run in-flight pipelines out as far as possible, then
    /// synchronously free every registry entry and script. Synchronous because
    /// the host gives no ordering guarantee between plugin unload and graph
    /// teardown, so nothing may be left to asynchronous machinery.
    pub fn shutdown(mut self) {
        if self.runner.is_manual() {
            self.settle();
        } else {
            // Joining drains every submission queued before the shutdown
            self.runner.join_worker();
        }

        // Whatever made it back to the real-time queue still gets its
        // remaining stages, inline — thread affinity no longer matters here
        while let Some(job) = self.runner.try_recv_rt() {
            match job {
                RtJob::Stage3(mut task) => {
                    let ok = {
                        let mut ctx = self.rt_context();
                        task.stage3(&mut ctx)
                    };
                    if ok {
                        let _ = task.stage4();
                    }
                    self.finish_task(task, !ok);
                }
                RtJob::Cleanup { task, aborted } => self.finish_task(task, aborted),
            }
        }

        while let Some(id) = self.registry.head() {
            let _ = self.registry.begin_free(id);
        }
        // Remaining units and their VMs are dropped with the world
    }

    fn rt_context(&mut self) -> RtContext<'_> {
        RtContext {
            registry: &mut self.registry,
            units: &mut self.units,
            submitter: self.runner.submitter(),
            stats: &mut self.stats,
            sample_rate: self.options.sample_rate,
            block_size: self.options.block_size,
        }
    }

    fn finish_task(&mut self, task: Task, aborted: bool) {
        let kind = task.kind();
        let completion = {
            let mut ctx = self.rt_context();
            task.cleanup(&mut ctx, aborted)
        };
        // The stage-2-only pipelines short-circuit by design; only init and
        // fanout short-circuits are failures
        if aborted && matches!(kind, TaskKind::Init | TaskKind::Fanout) {
            self.stats.aborted += 1;
        } else {
            self.stats.completed += 1;
        }
        if let Some(message) = completion {
            if let Some(hook) = &mut self.completion_hook {
                hook(message);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------------

    pub fn unit_state(&self, unit_id: UnitId) -> Option<UnitState> {
        self.units.get(unit_id).map(GeneratorUnit::state)
    }

    /// A weak handle to the unit's stub, for observing its lifetime from
    /// tests and diagnostics.
    pub fn unit_stub(&self, unit_id: UnitId) -> Option<Weak<UnitStub>> {
        self.units
            .get(unit_id)
            .map(|unit| Arc::downgrade(&unit.stub))
    }

    /// Hashes currently reachable through the registry chain, head first.
    pub fn registered_hashes(&self) -> Vec<i32> {
        self.registry
            .chain()
            .filter_map(|id| self.registry.get(id).map(|entry| entry.hash))
            .collect()
    }

    /// The currently published script for `hash`.
    pub fn script_for(&self, hash: i32) -> Option<Arc<ScriptRecord>> {
        let id = self.registry.find(hash)?;
        self.registry.get(id)?.script.clone()
    }

    /// Number of units bound to `hash`'s chain entry.
    pub fn unit_count_for(&self, hash: i32) -> usize {
        let Some(id) = self.registry.find(hash) else {
            return 0;
        };
        let mut count = 0;
        let mut current = self.registry.get(id).and_then(|entry| entry.units_head);
        while let Some(unit_id) = current {
            count += 1;
            current = self.units.get(unit_id).and_then(|unit| unit.next);
        }
        count
    }

    pub fn live_units(&self) -> usize {
        self.units.len()
    }

    /// Occupied registry slots, including freed-but-still-referenced entries
    /// that are no longer on the chain.
    pub fn live_entries(&self) -> usize {
        self.registry.live_slots()
    }

    /// Check the structural invariants that must hold at quiescence. Panics
    /// on violation; intended for tests and debug harnesses.
    pub fn assert_consistent(&self) {
        for (unit_id, unit) in self.units.iter() {
            assert_eq!(
                unit.stub.owner(),
                Some(unit_id),
                "stub owner back-reference is broken"
            );
            if let Some(entry_id) = unit.entry {
                let entry = self
                    .registry
                    .get(entry_id)
                    .expect("unit references a recycled registry entry");
                assert_eq!(entry.hash, unit.code_id, "unit is linked under the wrong hash");
            }
        }
        for entry_id in self.registry.chain() {
            let Some(entry) = self.registry.get(entry_id) else {
                continue;
            };
            assert!(
                !entry.should_be_freed,
                "freed entry is still on the registry chain"
            );
            let mut current = entry.units_head;
            while let Some(unit_id) = current {
                let unit = self
                    .units
                    .get(unit_id)
                    .expect("entry's unit list references a dead unit");
                assert_eq!(unit.code_id, entry.hash);
                assert_eq!(unit.entry, Some(entry_id));
                current = unit.next;
            }
        }
    }
}
