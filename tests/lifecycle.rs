//! End-to-end lifecycle scenarios, driven deterministically: the world runs
//! without a helper thread and the tests pump the non-real-time queue by
//! hand, which gives exact control over how pipeline stages interleave.

use std::io::Write;
use std::sync::Arc;

use approx::assert_relative_eq;
use rosc::OscType;
use scriptgen::prelude::*;

const BLOCK: usize = 64;

fn world() -> World {
    let _ = simplelog::SimpleLogger::init(
        log::LevelFilter::Debug,
        simplelog::Config::default(),
    );
    World::new_manual(WorldOptions::default(), Arc::new(ExprBackend))
}

fn publish(world: &mut World, hash: i32, source: &str) {
    world
        .command(
            "add-script",
            &[
                OscType::Int(hash),
                OscType::String(source.to_owned()),
                OscType::Int(0),
            ],
        )
        .unwrap();
}

fn mono_unit(code_id: i32) -> UnitConfig {
    UnitConfig {
        code_id,
        num_inputs: 1,
        num_outputs: 1,
        ..UnitConfig::default()
    }
}

/// Run the between-blocks stage drain, then process one block of a constant
/// input signal.
fn run_block(world: &mut World, unit: UnitId, input_value: f32) -> Vec<f32> {
    run_block_with_params(world, unit, input_value, &[])
}

fn run_block_with_params(
    world: &mut World,
    unit: UnitId,
    input_value: f32,
    params: &[f32],
) -> Vec<f32> {
    world.handle_deferred();
    let input = vec![input_value; BLOCK];
    let mut output = vec![0.0_f32; BLOCK];
    world.process_block(unit, &[&input], &mut [&mut output], params);
    output
}

fn assert_all(block: &[f32], expected: f32) {
    for sample in block {
        assert_relative_eq!(*sample, expected);
    }
}

#[test]
fn basic_add_and_run() {
    let mut world = world();
    publish(&mut world, 42, "out0 = in0 * 0.5");
    world.settle();

    let unit = world.spawn_unit(&mono_unit(42)).unwrap();
    assert_eq!(world.unit_state(unit), Some(UnitState::Compiling));

    // The compile has not run yet, so the first block is silence
    let first = run_block(&mut world, unit, 1.0);
    assert_all(&first, 0.0);

    world.pump_nrt();
    for _ in 0..3 {
        let block = run_block(&mut world, unit, 1.0);
        assert_all(&block, 0.5);
    }
    assert_eq!(world.unit_state(unit), Some(UnitState::Active));

    world.settle();
    world.assert_consistent();
}

#[test]
fn hot_swap_without_dropout() {
    let mut world = world();
    publish(&mut world, 42, "out0 = in0 * 0.5");
    world.settle();
    let unit = world.spawn_unit(&mono_unit(42)).unwrap();
    world.settle();
    assert_all(&run_block(&mut world, unit, 1.0), 0.5);

    publish(&mut world, 42, "out0 = in0 * 2.0");
    // Until the new VM's swap lands, the old one keeps playing
    assert_all(&run_block(&mut world, unit, 1.0), 0.5);

    world.settle();
    assert_all(&run_block(&mut world, unit, 1.0), 2.0);
    world.assert_consistent();
}

#[test]
fn unit_dying_mid_compile_reroutes_the_vm() {
    let mut world = world();
    publish(&mut world, 9, "out0 = in0");
    world.settle();

    // The init pipeline is submitted but its compile stage has not run yet
    let unit = world.spawn_unit(&mono_unit(9)).unwrap();
    let stub = world.unit_stub(unit).unwrap();
    world.free_unit(unit);

    // The in-flight pipeline still holds the orphaned stub
    let held = stub.upgrade().expect("pipeline should keep the stub alive");
    assert!(held.is_orphaned());
    drop(held);

    // Stage 3 detects the orphan, stage 4 destroys the never-installed VM,
    // cleanup releases the stub
    world.settle();
    assert!(stub.upgrade().is_none());
    assert_eq!(world.live_units(), 0);
    assert_eq!(world.stats().aborted, 0);
    world.assert_consistent();
}

#[test]
fn out_of_order_sections_reject_the_publication() {
    let mut world = world();
    publish(&mut world, 5, "@block\nx = 1\n@init\ny = 2\n@sample\nout0 = 0\n");
    world.settle();

    assert!(world.registered_hashes().is_empty());
    assert_eq!(world.stats().aborted, 1);
    world.assert_consistent();
}

#[test]
fn uncompilable_script_never_reaches_the_registry() {
    let mut world = world();
    publish(&mut world, 6, "out0 = (((");
    world.settle();

    assert!(world.registered_hashes().is_empty());
    assert_eq!(world.stats().aborted, 1);
}

#[test]
fn fanout_updates_every_bound_unit() {
    let mut world = world();
    publish(&mut world, 77, "out0 = in0 * 0.5");
    world.settle();

    let units: Vec<UnitId> = (0..100)
        .map(|_| world.spawn_unit(&mono_unit(77)).unwrap())
        .collect();
    world.settle();
    assert_eq!(world.stats().init_submitted, 100);
    assert_eq!(world.unit_count_for(77), 100);

    let weak_old = Arc::downgrade(&world.script_for(77).unwrap());

    publish(&mut world, 77, "out0 = in0 * 2.0");
    world.settle();

    // Exactly one init pipeline per bound unit
    assert_eq!(world.stats().init_submitted, 200);
    for &unit in &units {
        assert_all(&run_block(&mut world, unit, 1.0), 2.0);
    }
    // The displaced record is gone
    assert!(weak_old.upgrade().is_none());
    world.assert_consistent();
}

#[test]
fn freed_script_keeps_live_units_running() {
    let mut world = world();
    publish(&mut world, 11, "out0 = in0 * 0.5");
    world.settle();
    let units: Vec<UnitId> = (0..3)
        .map(|_| world.spawn_unit(&mono_unit(11)).unwrap())
        .collect();
    world.settle();

    world.command("free", &[OscType::Int(11)]).unwrap();
    // Off the chain immediately; the entry itself survives its units
    assert!(world.registered_hashes().is_empty());
    world.settle();
    assert_eq!(world.live_entries(), 1);

    for &unit in &units {
        assert_all(&run_block(&mut world, unit, 1.0), 0.5);
    }

    world.free_unit(units[0]);
    world.free_unit(units[1]);
    assert_eq!(world.live_entries(), 1);
    world.free_unit(units[2]);
    assert_eq!(world.live_entries(), 0);

    world.settle();
    world.assert_consistent();
}

#[test]
fn free_during_inflight_fanout_reinserts() {
    let mut world = world();
    publish(&mut world, 3, "out0 = in0 * 0.5");
    world.settle();
    let unit = world.spawn_unit(&mono_unit(3)).unwrap();
    world.settle();

    publish(&mut world, 3, "out0 = in0 * 2.0");
    // Let the fanout parse on the helper side, but hold back its swap stage
    world.pump_nrt();
    world.command("free", &[OscType::Int(3)]).unwrap();
    assert!(world.registered_hashes().is_empty());

    // The fanout's swap no longer finds the entry and inserts a fresh one
    // containing the incoming script; the unit stays on the freed entry with
    // its old code
    world.settle();
    assert_eq!(world.registered_hashes(), vec![3]);
    assert_eq!(world.unit_count_for(3), 0);
    assert_eq!(world.live_entries(), 2);
    assert_all(&run_block(&mut world, unit, 1.0), 0.5);
    world.assert_consistent();
}

#[test]
fn publishing_twice_is_idempotent() {
    let mut world = world();
    publish(&mut world, 8, "out0 = in0 * 0.5");
    world.settle();
    let unit = world.spawn_unit(&mono_unit(8)).unwrap();
    world.settle();

    publish(&mut world, 8, "out0 = in0 * 0.5");
    world.settle();

    assert_eq!(world.registered_hashes(), vec![8]);
    assert_eq!(world.unit_state(unit), Some(UnitState::Active));
    assert_all(&run_block(&mut world, unit, 1.0), 0.5);
    world.assert_consistent();
}

#[test]
fn newest_publication_wins() {
    let mut world = world();
    publish(&mut world, 4, "out0 = in0 * 0.5");
    world.settle();
    let unit = world.spawn_unit(&mono_unit(4)).unwrap();
    world.settle();

    // A burst of publications with no synchronization in between
    for gain in [2, 3, 4, 5] {
        publish(&mut world, 4, &format!("out0 = in0 * {gain}"));
    }
    world.settle();

    assert_all(&run_block(&mut world, unit, 1.0), 5.0);
    world.assert_consistent();
}

#[test]
fn unit_on_unpublished_hash_picks_up_the_script_later() {
    let mut world = world();
    let unit = world.spawn_unit(&mono_unit(13)).unwrap();
    assert_eq!(world.unit_state(unit), Some(UnitState::MissingScript));
    assert_all(&run_block(&mut world, unit, 1.0), 0.0);

    publish(&mut world, 13, "out0 = in0 * 0.5");
    world.settle();
    assert_eq!(world.unit_state(unit), Some(UnitState::Active));
    assert_all(&run_block(&mut world, unit, 1.0), 0.5);
    world.assert_consistent();
}

#[test]
fn update_flag_off_keeps_the_running_code() {
    let mut world = world();
    publish(&mut world, 21, "out0 = in0 * 0.5");
    world.settle();

    let config = UnitConfig {
        auto_update: false,
        ..mono_unit(21)
    };
    // The first publication still installs: there is no VM to protect yet
    let unit = world.spawn_unit(&config).unwrap();
    world.settle();
    assert_all(&run_block(&mut world, unit, 1.0), 0.5);

    publish(&mut world, 21, "out0 = in0 * 2.0");
    world.settle();
    assert_all(&run_block(&mut world, unit, 1.0), 0.5);
    world.assert_consistent();
}

#[test]
fn audio_thread_compile_makes_sound_immediately() {
    let mut world = world();
    publish(&mut world, 30, "out0 = in0 * 0.5");
    world.settle();

    let config = UnitConfig {
        use_audio_thread: true,
        ..mono_unit(30)
    };
    let unit = world.spawn_unit(&config).unwrap();
    assert_eq!(world.unit_state(unit), Some(UnitState::Active));
    assert_all(&run_block(&mut world, unit, 1.0), 0.5);
    world.assert_consistent();
}

#[test]
fn parameters_flow_from_block_inputs_into_the_script() {
    let mut world = world();
    world
        .command(
            "add-script",
            &[
                OscType::Int(50),
                OscType::String("out0 = in0 * gain".to_owned()),
                OscType::Int(1),
                OscType::String("gain".to_owned()),
            ],
        )
        .unwrap();
    world.settle();

    let config = UnitConfig {
        param_indices: vec![0],
        ..mono_unit(50)
    };
    let unit = world.spawn_unit(&config).unwrap();
    world.settle();

    assert_all(&run_block_with_params(&mut world, unit, 1.0, &[0.25]), 0.25);
    assert_all(&run_block_with_params(&mut world, unit, 1.0, &[0.75]), 0.75);
}

#[test]
fn out_of_range_parameter_index_still_compiles() {
    let mut world = world();
    world
        .command(
            "add-script",
            &[
                OscType::Int(51),
                OscType::String("out0 = in0 * 0.5".to_owned()),
                OscType::Int(1),
                OscType::String("gain".to_owned()),
            ],
        )
        .unwrap();
    world.settle();

    let config = UnitConfig {
        param_indices: vec![12],
        ..mono_unit(51)
    };
    let unit = world.spawn_unit(&config).unwrap();
    world.settle();
    assert_eq!(world.unit_state(unit), Some(UnitState::Active));
    assert_all(&run_block_with_params(&mut world, unit, 1.0, &[9.0]), 0.5);
}

#[test]
fn add_file_reads_the_script_from_disk() {
    let mut world = world();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "@init\ngain = 0.5\n@sample\nout0 = in0 * gain\n").unwrap();

    world
        .command(
            "add-file",
            &[
                OscType::Int(60),
                OscType::String(file.path().to_str().unwrap().to_owned()),
                OscType::Int(0),
            ],
        )
        .unwrap();
    world.settle();

    let unit = world.spawn_unit(&mono_unit(60)).unwrap();
    world.settle();
    assert_all(&run_block(&mut world, unit, 1.0), 0.5);
}

#[test]
fn missing_file_aborts_the_publication() {
    let mut world = world();
    world
        .command(
            "add-file",
            &[
                OscType::Int(61),
                OscType::String("/nonexistent/definitely-not-here.dsp".to_owned()),
                OscType::Int(0),
            ],
        )
        .unwrap();
    world.settle();
    assert!(world.registered_hashes().is_empty());
    assert_eq!(world.stats().aborted, 1);
}

#[test]
fn free_all_empties_the_world() {
    let mut world = world();
    for hash in [1, 2, 3] {
        publish(&mut world, hash, "out0 = in0 * 0.5");
    }
    world.settle();
    let units: Vec<UnitId> = [1, 2, 3]
        .iter()
        .map(|&hash| world.spawn_unit(&mono_unit(hash)).unwrap())
        .collect();
    world.settle();

    let weak_scripts: Vec<_> = [1, 2, 3]
        .iter()
        .map(|&hash| Arc::downgrade(&world.script_for(hash).unwrap()))
        .collect();

    world.command("free-all", &[]).unwrap();
    assert!(world.registered_hashes().is_empty());
    for unit in units {
        world.free_unit(unit);
    }
    world.settle();

    assert_eq!(world.live_entries(), 0);
    assert_eq!(world.live_units(), 0);
    for weak in weak_scripts {
        assert!(weak.upgrade().is_none());
    }
    // No outstanding pipeline descriptors
    let stats = world.stats();
    let submitted =
        stats.init_submitted + stats.fanout_submitted + stats.destroy_submitted + stats.free_submitted;
    assert_eq!(stats.completed + stats.aborted, submitted);
    world.assert_consistent();
}

#[test]
fn malformed_commands_change_nothing() {
    let mut world = world();
    assert!(world
        .command("add-script", &[OscType::Float(1.0)])
        .is_err());
    assert!(world.command("free", &[]).is_err());
    assert!(world.command("does-not-exist", &[]).is_err());
    world.settle();

    assert!(world.registered_hashes().is_empty());
    assert_eq!(world.stats().fanout_submitted, 0);
}

#[test]
fn unit_slab_exhaustion_is_reported() {
    let _ = simplelog::SimpleLogger::init(
        log::LevelFilter::Debug,
        simplelog::Config::default(),
    );
    let options = WorldOptions {
        max_units: 2,
        ..WorldOptions::default()
    };
    let mut world = World::new_manual(options, Arc::new(ExprBackend));
    publish(&mut world, 1, "out0 = 0");
    world.settle();

    world.spawn_unit(&mono_unit(1)).unwrap();
    world.spawn_unit(&mono_unit(1)).unwrap();
    assert!(matches!(
        world.spawn_unit(&mono_unit(1)),
        Err(WorldError::PoolExhausted { .. })
    ));
}

#[test]
fn registry_slab_exhaustion_degrades_the_unit() {
    let _ = simplelog::SimpleLogger::init(
        log::LevelFilter::Debug,
        simplelog::Config::default(),
    );
    let options = WorldOptions {
        max_scripts: 1,
        ..WorldOptions::default()
    };
    let mut world = World::new_manual(options, Arc::new(ExprBackend));
    publish(&mut world, 1, "out0 = 0");
    world.settle();
    assert_eq!(world.registered_hashes(), vec![1]);

    // A second hash no longer fits; the publication is dropped in its swap
    // stage and the unit bound to it fails over to silence
    publish(&mut world, 2, "out0 = 1");
    world.settle();
    assert_eq!(world.registered_hashes(), vec![1]);

    let unit = world.spawn_unit(&mono_unit(2)).unwrap();
    world.settle();
    assert_eq!(world.unit_state(unit), Some(UnitState::Failed));
    assert_all(&run_block(&mut world, unit, 1.0), 0.0);
}
