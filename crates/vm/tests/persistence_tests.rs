//! Round trips through the state-serialization subsystem: value graphs,
//! iteration order, shared upvalue identity, and whole suspended tasks
//! moved between engines.

mod common;

use ares_vm::{
    ExecutionEngine, Resumption, Table, Value, VmConfig, VmError,
};
use common::{engine_with_instance, finished, global_fn, run, string_of, test_image};

fn second_engine_with_image() -> (ExecutionEngine, ares_vm::ThreadRef) {
    let mut engine = ExecutionEngine::new(VmConfig::default()).unwrap();
    engine.load_base_image(&test_image(), "test-image").unwrap();
    let instance = engine.fork_instance(None).unwrap();
    (engine, instance)
}

fn table_keys_as_strings(engine: &ExecutionEngine, t: ares_vm::value::TableRef) -> Vec<String> {
    let mut keys = Vec::new();
    let mut key = Value::Nil;
    while let Some((k, _)) = engine.heap().table(t).next_after(key).unwrap() {
        keys.push(match k {
            Value::String(s) => engine.heap().string_lossy(s).into_owned(),
            other => format!("{other:?}"),
        });
        key = k;
    }
    keys
}

#[test]
fn test_primitive_round_trips() {
    let mut engine = ExecutionEngine::new(VmConfig::default()).unwrap();
    for value in [
        Value::Nil,
        Value::Boolean(true),
        Value::Boolean(false),
        Value::Number(std::f64::consts::PI),
        Value::Vector([1.0, 2.0, 3.0, 0.0]),
        Value::LightUserdata { data: 77, tag: 9 },
    ] {
        let bytes = engine.persist_value(value).unwrap();
        assert_eq!(engine.restore_value(&bytes).unwrap(), value);
    }
}

#[test]
fn test_string_round_trip_reinterns() {
    let mut engine = ExecutionEngine::new(VmConfig::default()).unwrap();
    let original = engine.intern_value("persistent words").unwrap();
    let bytes = engine.persist_value(original).unwrap();
    let restored = engine.restore_value(&bytes).unwrap();
    // Interning makes equality handle equality, even after a round trip
    // through the stream.
    assert_eq!(restored, original);
}

#[test]
fn test_cyclic_table_round_trip() {
    let mut engine = ExecutionEngine::new(VmConfig::default()).unwrap();
    let t = engine.heap_mut().new_table(Table::new()).unwrap();
    engine
        .heap_mut()
        .table_set(t, Value::Number(1.0), Value::Table(t))
        .unwrap();

    let bytes = engine.persist_value(Value::Table(t)).unwrap();
    let restored = engine.restore_value(&bytes).unwrap();
    let Value::Table(rt) = restored else {
        panic!("expected a table");
    };
    // The self-reference is preserved as identity, not as a copy.
    assert_eq!(
        engine.heap().table(rt).get(Value::Number(1.0)),
        Value::Table(rt)
    );
}

#[test]
fn test_iteration_order_survives_engine_move() {
    let mut source = ExecutionEngine::new(VmConfig::default()).unwrap();
    let t = source.heap_mut().new_table(Table::new()).unwrap();
    for (i, name) in ["delta", "alpha", "omega", "beta", "kappa"].iter().enumerate() {
        let key = source.intern_value(name).unwrap();
        source
            .heap_mut()
            .table_set(t, key, Value::Number(i as f64))
            .unwrap();
    }
    let original_order = table_keys_as_strings(&source, t);
    let bytes = source.persist_value(Value::Table(t)).unwrap();

    // A different engine interns the keys in different slots, so their
    // hash buckets differ; the explicit order vector must compensate.
    let mut target = ExecutionEngine::new(VmConfig::default()).unwrap();
    let Value::Table(restored) = target.restore_value(&bytes).unwrap() else {
        panic!("expected a table");
    };
    assert!(target.heap().table(restored).has_pinned_order());
    assert_eq!(table_keys_as_strings(&target, restored), original_order);
}

#[test]
fn test_restored_order_drops_on_key_set_change() {
    let mut engine = ExecutionEngine::new(VmConfig::default()).unwrap();
    let t = engine.heap_mut().new_table(Table::new()).unwrap();
    for name in ["one", "two", "three"] {
        let key = engine.intern_value(name).unwrap();
        engine
            .heap_mut()
            .table_set(t, key, Value::Number(1.0))
            .unwrap();
    }
    let bytes = engine.persist_value(Value::Table(t)).unwrap();
    let Value::Table(restored) = engine.restore_value(&bytes).unwrap() else {
        panic!("expected a table");
    };

    // In-place update keeps the pin; a fresh key drops it.
    let existing = engine.intern_value("two").unwrap();
    engine
        .heap_mut()
        .table_set(restored, existing, Value::Number(9.0))
        .unwrap();
    assert!(engine.heap().table(restored).has_pinned_order());

    let fresh = engine.intern_value("four").unwrap();
    engine
        .heap_mut()
        .table_set(restored, fresh, Value::Number(4.0))
        .unwrap();
    assert!(!engine.heap().table(restored).has_pinned_order());
}

#[test]
fn test_shared_upvalue_identity_round_trip() {
    let (mut engine, instance) = engine_with_instance();
    let getter = global_fn(&mut engine, instance, "getter");
    let setter = global_fn(&mut engine, instance, "setter");

    // One request serializing both closures preserves the shared cell.
    let bundle = engine.heap_mut().new_table(Table::new()).unwrap();
    engine
        .heap_mut()
        .table_set(bundle, Value::Number(1.0), getter)
        .unwrap();
    engine
        .heap_mut()
        .table_set(bundle, Value::Number(2.0), setter)
        .unwrap();
    let bytes = engine.persist_value(Value::Table(bundle)).unwrap();

    let (mut target, target_instance) = second_engine_with_image();
    let Value::Table(restored) = target.restore_value(&bytes).unwrap() else {
        panic!("expected a table");
    };
    let getter2 = target.heap().table(restored).get(Value::Number(1.0));
    let setter2 = target.heap().table(restored).get(Value::Number(2.0));

    finished(run(
        &mut target,
        target_instance,
        setter2,
        &[Value::Number(42.0)],
    ));
    let values = finished(run(&mut target, target_instance, getter2, &[]));
    assert_eq!(values, vec![Value::Number(42.0)]);
}

#[test]
fn test_suspended_generator_round_trip() {
    let (mut engine, instance) = engine_with_instance();
    let gen = global_fn(&mut engine, instance, "gen");
    let setword = global_fn(&mut engine, instance, "setword");

    let task = engine.spawn_task(instance, gen).unwrap();
    let Resumption::Yield(first) = engine.resume(task, &[]).unwrap() else {
        panic!("expected first yield");
    };
    assert_eq!(string_of(&engine, first[0]), "k1");

    // Mutate the shared upvalue between the first and second yield, then
    // capture the suspended task.
    let word = engine.intern_value("z2").unwrap();
    finished(run(&mut engine, instance, setword, &[word]));
    let bytes = engine.persist_task(task).unwrap();

    // The stream resumes identically on another engine with the same base
    // image loaded.
    let (mut target, _target_instance) = second_engine_with_image();
    let moved = target.restore_task(&bytes).unwrap();
    let Resumption::Yield(second) = target.resume(moved, &[]).unwrap() else {
        panic!("expected second yield after restore");
    };
    assert_eq!(string_of(&target, second[0]), "z2");
    let Resumption::Yield(third) = target.resume(moved, &[]).unwrap() else {
        panic!("expected third yield after restore");
    };
    assert_eq!(string_of(&target, third[0]), "z3");
    assert!(matches!(
        target.resume(moved, &[]).unwrap(),
        Resumption::Finished(_)
    ));

    // The original task is untouched by serialization.
    let Resumption::Yield(second_original) = engine.resume(task, &[]).unwrap() else {
        panic!("expected original task to continue");
    };
    assert_eq!(string_of(&engine, second_original[0]), "z2");
}

#[test]
fn test_mid_iteration_round_trip_visits_each_key_once() {
    let (mut engine, instance) = engine_with_instance();
    let iter_yield = global_fn(&mut engine, instance, "iter_yield");

    let make_table = |engine: &mut ExecutionEngine| {
        let t = engine.heap_mut().new_table(Table::new()).unwrap();
        for (i, name) in ["aa", "bb", "cc", "dd", "ee"].iter().enumerate() {
            let key = engine.intern_value(name).unwrap();
            engine
                .heap_mut()
                .table_set(t, key, Value::Number(i as f64))
                .unwrap();
        }
        t
    };

    // Reference: iterate to completion without any round trip.
    let reference_table = make_table(&mut engine);
    let reference_task = engine.spawn_task(instance, iter_yield).unwrap();
    let mut reference = Vec::new();
    let mut r = engine
        .resume(reference_task, &[Value::Table(reference_table)])
        .unwrap();
    while let Resumption::Yield(values) = r {
        reference.push(string_of(&engine, values[0]));
        r = engine.resume(reference_task, &[]).unwrap();
    }
    assert_eq!(reference.len(), 5);

    // Interrupted: two keys, then serialize, move, and finish elsewhere.
    let table = make_table(&mut engine);
    let task = engine.spawn_task(instance, iter_yield).unwrap();
    let mut visited = Vec::new();
    let Resumption::Yield(values) = engine.resume(task, &[Value::Table(table)]).unwrap()
    else {
        panic!("expected yield");
    };
    visited.push(string_of(&engine, values[0]));
    let Resumption::Yield(values) = engine.resume(task, &[]).unwrap() else {
        panic!("expected yield");
    };
    visited.push(string_of(&engine, values[0]));

    let bytes = engine.persist_task(task).unwrap();
    let (mut target, _) = second_engine_with_image();
    let moved = target.restore_task(&bytes).unwrap();
    let mut r = target.resume(moved, &[]).unwrap();
    while let Resumption::Yield(values) = r {
        visited.push(string_of(&target, values[0]));
        r = target.resume(moved, &[]).unwrap();
    }

    assert_eq!(visited, reference);
}

#[test]
fn test_unregistered_native_is_rejected() {
    fn secret(
        _: &mut ExecutionEngine,
        _: ares_vm::NativeCall,
    ) -> ares_vm::VmResult<ares_vm::NativeControl> {
        Ok(ares_vm::NativeControl::Return(0))
    }

    let mut engine = ExecutionEngine::new(VmConfig::default()).unwrap();
    engine
        .register_native("test.secret", secret, None, false)
        .unwrap();
    let closure = engine.make_native_closure("test.secret", Vec::new()).unwrap();
    assert!(matches!(
        engine.persist_value(closure),
        Err(VmError::ForbiddenNative { .. })
    ));
}

#[test]
fn test_kernel_task_is_rejected() {
    let mut engine = ExecutionEngine::new(VmConfig::default()).unwrap();
    let grandparent = engine.grandparent();
    assert!(matches!(
        engine.persist_task(grandparent),
        Err(VmError::Persist { .. })
    ));
}

#[test]
fn test_corrupted_streams_are_rejected() {
    let mut engine = ExecutionEngine::new(VmConfig::default()).unwrap();
    let t = engine.heap_mut().new_table(Table::new()).unwrap();
    engine
        .heap_mut()
        .table_set(t, Value::Number(1.0), Value::Number(2.0))
        .unwrap();
    let bytes = engine.persist_value(Value::Table(t)).unwrap();

    let mut bad_magic = bytes.clone();
    bad_magic[0] = b'X';
    assert!(matches!(
        engine.restore_value(&bad_magic),
        Err(VmError::Restore { .. })
    ));

    let truncated = &bytes[..bytes.len() - 3];
    assert!(engine.restore_value(truncated).is_err());
}

#[test]
fn test_permanents_size_mismatch_is_rejected() {
    let (mut engine, instance) = engine_with_instance();
    let getter = global_fn(&mut engine, instance, "getter");
    let bytes = engine.persist_value(getter).unwrap();

    // An engine without the base image has a smaller permanents table; the
    // stream's expectation marker catches the divergence.
    let mut bare = ExecutionEngine::new(VmConfig::default()).unwrap();
    let error = bare.restore_value(&bytes).unwrap_err();
    assert!(error.to_string().contains("permanents"));
}

#[test]
fn test_instance_round_trip_with_services() {
    let (mut engine, instance) = engine_with_instance();

    // Give the instance a log and subscribe one handler.
    let log = engine.heap_mut().new_table(Table::new()).unwrap();
    engine.set_global(instance, "log", Value::Table(log)).unwrap();
    let make_handler = global_fn(&mut engine, instance, "make_handler");
    let marker = engine.intern_value("persisted").unwrap();
    let handler = finished(run(&mut engine, instance, make_handler, &[marker]))[0];
    engine.event_on(instance, "touch", handler, false).unwrap();

    let bytes = engine.persist_instance(instance).unwrap();

    let mut target = ExecutionEngine::new(VmConfig::default()).unwrap();
    target.load_base_image(&test_image(), "test-image").unwrap();
    let moved = target.restore_instance(&bytes).unwrap();

    // The subscription and the globals both made the trip.
    assert_eq!(target.event_names(moved).unwrap().contains(&"touch".to_string()), true);
    let r = target.dispatch_event(moved, "touch", &[]).unwrap();
    assert!(matches!(r, Resumption::Finished(_)));

    let Value::Table(moved_log) = target.get_global(moved, "log").unwrap() else {
        panic!("log table should survive");
    };
    let entry = target.heap().table(moved_log).get(Value::Number(1.0));
    assert_eq!(string_of(&target, entry), "persisted");
}
