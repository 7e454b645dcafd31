//! End-to-end interpreter behavior: calls, closures, iteration, the
//! yield/break distinction, and error propagation.

mod common;

use std::cell::Cell;
use std::rc::Rc;

use ares_vm::{
    InterruptAction, Resumption, Table, ThreadStatus, Value, VmError, Yieldability,
};
use common::{engine_with_instance, finished, global_fn, run, string_of};

#[test]
fn test_arithmetic_call() {
    let (mut engine, instance) = engine_with_instance();
    let add = global_fn(&mut engine, instance, "add");
    let values = finished(run(
        &mut engine,
        instance,
        add,
        &[Value::Number(3.0), Value::Number(4.0)],
    ));
    assert_eq!(values, vec![Value::Number(7.0)]);
}

#[test]
fn test_vararg_sum() {
    let (mut engine, instance) = engine_with_instance();
    let vsum = global_fn(&mut engine, instance, "vsum");
    let values = finished(run(
        &mut engine,
        instance,
        vsum,
        &[Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)],
    ));
    assert_eq!(values, vec![Value::Number(6.0)]);
}

#[test]
fn test_counted_loop_with_back_edges() {
    let (mut engine, instance) = engine_with_instance();
    let count_loop = global_fn(&mut engine, instance, "count_loop");
    let values = finished(run(&mut engine, instance, count_loop, &[]));
    assert_eq!(values, vec![Value::Number(100.0)]);
}

#[test]
fn test_table_iteration_sum() {
    let (mut engine, instance) = engine_with_instance();
    let sum_table = global_fn(&mut engine, instance, "sum_table");

    let t = engine.heap_mut().new_table(Table::new()).unwrap();
    for (i, v) in [10.0, 20.0, 30.0].iter().enumerate() {
        engine
            .heap_mut()
            .table_set(t, Value::Number((i + 1) as f64), Value::Number(*v))
            .unwrap();
    }
    let values = finished(run(&mut engine, instance, sum_table, &[Value::Table(t)]));
    assert_eq!(values, vec![Value::Number(60.0)]);
}

#[test]
fn test_delete_during_iteration_visits_every_key() {
    let (mut engine, instance) = engine_with_instance();
    let visit_and_delete = global_fn(&mut engine, instance, "visit_and_delete");

    let t = engine.heap_mut().new_table(Table::new()).unwrap();
    for name in ["a", "b", "c"] {
        let key = engine.intern_value(name).unwrap();
        engine
            .heap_mut()
            .table_set(t, key, Value::Number(1.0))
            .unwrap();
    }
    let values = finished(run(
        &mut engine,
        instance,
        visit_and_delete,
        &[Value::Table(t)],
    ));
    assert_eq!(values, vec![Value::Number(3.0)]);

    // Every key is gone, and resuming an explicit iteration from a nil-ed
    // key is rejected.
    let a = engine.intern_value("a").unwrap();
    assert_eq!(engine.heap().table(t).get(a), Value::Nil);
    assert!(engine.heap().table(t).next_after(a).is_err());
}

#[test]
fn test_instance_globals_are_private() {
    let (mut engine, first) = engine_with_instance();
    let second = engine.fork_instance(None).unwrap();

    engine.set_global(first, "shared", Value::Number(5.0)).unwrap();
    assert_eq!(
        engine.get_global(first, "shared").unwrap(),
        Value::Number(5.0)
    );
    assert_eq!(engine.get_global(second, "shared").unwrap(), Value::Nil);
    // Both still see the base image's bindings through the chain.
    assert!(matches!(
        engine.get_global(second, "add").unwrap(),
        Value::Closure(_)
    ));
}

#[test]
fn test_generator_yield_sequence() {
    let (mut engine, instance) = engine_with_instance();
    let gen = global_fn(&mut engine, instance, "gen");
    let task = engine.spawn_task(instance, gen).unwrap();

    let r1 = engine.resume(task, &[]).unwrap();
    let Resumption::Yield(v1) = r1 else {
        panic!("expected yield, got {r1:?}");
    };
    assert_eq!(string_of(&engine, v1[0]), "k1");
    assert_eq!(engine.task_status(task), ThreadStatus::Suspended);

    let Resumption::Yield(v2) = engine.resume(task, &[]).unwrap() else {
        panic!("expected second yield");
    };
    assert_eq!(string_of(&engine, v2[0]), "b2");

    let Resumption::Yield(v3) = engine.resume(task, &[]).unwrap() else {
        panic!("expected third yield");
    };
    assert_eq!(string_of(&engine, v3[0]), "z3");

    assert!(matches!(
        engine.resume(task, &[]).unwrap(),
        Resumption::Finished(_)
    ));
    // A finished task cannot come back.
    assert!(matches!(
        engine.resume(task, &[]),
        Err(VmError::InvalidThreadState { .. })
    ));
}

#[test]
fn test_shared_upvalue_across_closures_and_tasks() {
    let (mut engine, instance) = engine_with_instance();
    let gen = global_fn(&mut engine, instance, "gen");
    let setword = global_fn(&mut engine, instance, "setword");

    let task = engine.spawn_task(instance, gen).unwrap();
    let Resumption::Yield(first) = engine.resume(task, &[]).unwrap() else {
        panic!("expected yield");
    };
    assert_eq!(string_of(&engine, first[0]), "k1");

    // Mutate the upvalue shared between `gen` and `setword` while the
    // generator is suspended.
    let word = engine.intern_value("z2").unwrap();
    finished(run(&mut engine, instance, setword, &[word]));

    let Resumption::Yield(second) = engine.resume(task, &[]).unwrap() else {
        panic!("expected yield");
    };
    assert_eq!(string_of(&engine, second[0]), "z2");
}

#[test]
fn test_break_is_distinct_from_yield() {
    let (mut engine, instance) = engine_with_instance();
    let count_loop = global_fn(&mut engine, instance, "count_loop");
    let task = engine.spawn_task(instance, count_loop).unwrap();

    let fired = Rc::new(Cell::new(false));
    let fired_in_cb = Rc::clone(&fired);
    engine.callbacks.interrupt = Some(Box::new(move |_, hint, _| {
        if hint == -1 && !fired_in_cb.get() {
            fired_in_cb.set(true);
            InterruptAction::Break
        } else {
            InterruptAction::Continue
        }
    }));

    let r = engine.resume(task, &[]).unwrap();
    assert_eq!(r, Resumption::Break);
    assert_eq!(engine.task_status(task), ThreadStatus::BreakSuspended);

    // Resuming after a break continues transparently to completion.
    let values = finished(engine.resume(task, &[]).unwrap());
    assert_eq!(values, vec![Value::Number(100.0)]);
}

#[test]
fn test_interrupt_yield_carries_no_values() {
    let (mut engine, instance) = engine_with_instance();
    let count_loop = global_fn(&mut engine, instance, "count_loop");
    let task = engine.spawn_task(instance, count_loop).unwrap();

    let fired = Rc::new(Cell::new(false));
    let fired_in_cb = Rc::clone(&fired);
    engine.callbacks.interrupt = Some(Box::new(move |_, hint, probe| {
        if hint == -1 && !fired_in_cb.get() && probe.is_suspendable(true) {
            fired_in_cb.set(true);
            InterruptAction::Yield
        } else {
            InterruptAction::Continue
        }
    }));

    let r = engine.resume(task, &[]).unwrap();
    assert_eq!(r, Resumption::Yield(Vec::new()));
    assert_eq!(engine.task_status(task), ThreadStatus::Suspended);

    let values = finished(engine.resume(task, &[]).unwrap());
    assert_eq!(values, vec![Value::Number(100.0)]);
}

#[test]
fn test_unbounded_recursion_hits_depth_ceiling() {
    let (mut engine, instance) = engine_with_instance();
    let recurse = global_fn(&mut engine, instance, "recurse");
    let r = run(&mut engine, instance, recurse, &[]);
    let Resumption::Error(value) = r else {
        panic!("expected an error, got {r:?}");
    };
    assert!(string_of(&engine, value).contains("stack overflow"));
}

#[test]
fn test_pcall_catches_script_error() {
    let (mut engine, instance) = engine_with_instance();
    let probe = global_fn(&mut engine, instance, "pcall_probe");
    let values = finished(run(&mut engine, instance, probe, &[]));
    assert_eq!(values[0], Value::Boolean(false));
    assert_eq!(string_of(&engine, values[1]), "boom");
}

#[test]
fn test_call_protected_from_host() {
    let (mut engine, instance) = engine_with_instance();

    let add = global_fn(&mut engine, instance, "add");
    let (ok, values) = engine
        .call_protected(instance, add, &[Value::Number(2.0), Value::Number(5.0)])
        .unwrap();
    assert!(ok);
    assert_eq!(values, vec![Value::Number(7.0)]);

    let raiser = global_fn(&mut engine, instance, "raise_error");
    let (ok, values) = engine.call_protected(instance, raiser, &[]).unwrap();
    assert!(!ok);
    assert_eq!(string_of(&engine, values[0]), "boom");

    // Suspension cannot cross the protected boundary.
    let gen = global_fn(&mut engine, instance, "gen");
    let (ok, values) = engine.call_protected(instance, gen, &[]).unwrap();
    assert!(!ok);
    assert!(string_of(&engine, values[0]).contains("suspend"));
}

#[test]
fn test_uncaught_error_and_close() {
    let (mut engine, instance) = engine_with_instance();
    let raiser = global_fn(&mut engine, instance, "raise_error");
    let task = engine.spawn_task(instance, raiser).unwrap();

    let Resumption::Error(value) = engine.resume(task, &[]).unwrap() else {
        panic!("expected error");
    };
    assert_eq!(string_of(&engine, value), "boom");
    assert_eq!(engine.task_status(task), ThreadStatus::Error);

    let (ok, error) = engine.close_task(task).unwrap();
    assert!(!ok);
    assert_eq!(string_of(&engine, error.unwrap()), "boom");
    assert_eq!(engine.task_status(task), ThreadStatus::Finished);
}

#[test]
fn test_yieldability_probe() {
    let (mut engine, instance) = engine_with_instance();
    let gen = global_fn(&mut engine, instance, "gen");
    let task = engine.spawn_task(instance, gen).unwrap();

    // No frames yet: not a suspendable point.
    assert_eq!(engine.probe_yieldability(task), Yieldability::BadFrame);

    // Suspended inside the yield native, which has a continuation.
    engine.resume(task, &[]).unwrap();
    assert_eq!(engine.probe_yieldability(task), Yieldability::Ok);
}

#[test]
fn test_traceback_of_suspended_task() {
    let (mut engine, instance) = engine_with_instance();
    let gen = global_fn(&mut engine, instance, "gen");
    let task = engine.spawn_task(instance, gen).unwrap();
    engine.resume(task, &[]).unwrap();

    let trace = engine.traceback(task);
    // Innermost frame is the yield native, below it the generator with its
    // source position.
    assert!(trace.contains("[native]: in 'task.yield'"));
    assert!(trace.contains("test-image:"));
}

#[test]
fn test_wrapper_is_callable_and_transparent() {
    let (mut engine, instance) = engine_with_instance();
    let gen = global_fn(&mut engine, instance, "gen");
    let inner = engine.spawn_task(instance, gen).unwrap();
    let wrapper = engine.wrap_task(inner).unwrap();

    // Each call of the wrapper surfaces the next yield as return values.
    let first = finished(run(&mut engine, instance, wrapper, &[]));
    assert_eq!(string_of(&engine, first[0]), "k1");
    let second = finished(run(&mut engine, instance, wrapper, &[]));
    assert_eq!(string_of(&engine, second[0]), "b2");
}
