//! The event channel and timer wheel driven end-to-end: ordered dispatch,
//! the between-handlers interrupt, re-entrancy guards, the state-switch
//! pattern, and catch-up clamping against a controlled clock.

mod common;

use std::cell::Cell;
use std::rc::Rc;

use ares_vm::bytecode::proto::ProtoFlags;
use ares_vm::bytecode::{FunctionBuilder, Instr, ModuleBuilder, OpCode};
use ares_vm::{
    ExecutionEngine, InterruptAction, NativeCall, NativeControl, Resumption, Table, ThreadStatus,
    Value, VmConfig, VmResult,
};
use common::{engine_with_instance, finished, global_fn, run, string_of};

/// Installs a `log` table on the instance and returns it.
fn install_log(engine: &mut ExecutionEngine, instance: ares_vm::ThreadRef) -> ares_vm::value::TableRef {
    let log = engine.heap_mut().new_table(Table::new()).unwrap();
    engine.set_global(instance, "log", Value::Table(log)).unwrap();
    log
}

/// Builds a marker-appending handler through the image's factory.
fn handler(
    engine: &mut ExecutionEngine,
    instance: ares_vm::ThreadRef,
    marker: &str,
) -> Value {
    let factory = global_fn(engine, instance, "make_handler");
    let marker = engine.intern_value(marker).unwrap();
    finished(run(engine, instance, factory, &[marker]))[0]
}

fn log_entries(engine: &ExecutionEngine, log: ares_vm::value::TableRef) -> Vec<String> {
    let mut entries = Vec::new();
    let mut i = 1.0;
    loop {
        match engine.heap().table(log).get(Value::Number(i)) {
            Value::Nil => break,
            Value::String(s) => entries.push(engine.heap().string_lossy(s).into_owned()),
            Value::Number(n) => entries.push(format!("{n}")),
            other => entries.push(format!("{other:?}")),
        }
        i += 1.0;
    }
    entries
}

#[test]
fn test_dispatch_invokes_in_registration_order_with_args() {
    let (mut engine, instance) = engine_with_instance();
    let log = install_log(&mut engine, instance);

    let h1 = handler(&mut engine, instance, "h1");
    let recorder = global_fn(&mut engine, instance, "arg_recorder");
    let h2 = handler(&mut engine, instance, "h2");
    engine.event_on(instance, "e", h1, false).unwrap();
    engine.event_on(instance, "e", recorder, false).unwrap();
    engine.event_on(instance, "e", h2, false).unwrap();

    let r = engine
        .dispatch_event(instance, "e", &[Value::Number(42.0)])
        .unwrap();
    assert!(matches!(r, Resumption::Finished(_)));
    assert_eq!(log_entries(&engine, log), vec!["h1", "42", "h2"]);
}

#[test]
fn test_once_handler_fires_exactly_once() {
    let (mut engine, instance) = engine_with_instance();
    let log = install_log(&mut engine, instance);

    let once = handler(&mut engine, instance, "once");
    let always = handler(&mut engine, instance, "always");
    engine.event_on(instance, "e", once, true).unwrap();
    engine.event_on(instance, "e", always, false).unwrap();

    engine.dispatch_event(instance, "e", &[]).unwrap();
    engine.dispatch_event(instance, "e", &[]).unwrap();
    assert_eq!(log_entries(&engine, log), vec!["once", "always", "always"]);
}

#[test]
fn test_off_and_listeners() {
    let (mut engine, instance) = engine_with_instance();
    install_log(&mut engine, instance);

    let h1 = handler(&mut engine, instance, "h1");
    let h2 = handler(&mut engine, instance, "h2");
    let handle1 = engine.event_on(instance, "e", h1, false).unwrap();
    engine.event_on(instance, "e", h2, false).unwrap();

    assert_eq!(engine.event_listeners(instance, "e").unwrap().len(), 2);
    assert!(engine.event_off(instance, "e", handle1).unwrap());
    assert!(!engine.event_off(instance, "e", handle1).unwrap());
    assert_eq!(engine.event_listeners(instance, "e").unwrap(), vec![h2]);
    assert!(engine
        .event_names(instance)
        .unwrap()
        .contains(&"e".to_string()));
}

#[test]
fn test_registration_filter_rejects_names() {
    let (mut engine, instance) = engine_with_instance();
    install_log(&mut engine, instance);
    engine.callbacks.register_filter = Some(Box::new(|_, name, _| name != "secret"));

    let h = handler(&mut engine, instance, "h");
    assert!(engine.event_on(instance, "secret", h, false).is_err());
    // The rejection leaves the manager usable.
    engine.event_on(instance, "open", h, false).unwrap();
    let names = engine.event_names(instance).unwrap();
    assert!(names.contains(&"open".to_string()));
    assert!(!names.contains(&"secret".to_string()));
}

#[test]
fn test_method_style_handler_rejected() {
    // A separate image whose handler was declared method-style.
    let mut m = ModuleBuilder::new();
    let mut meth = FunctionBuilder::new(1, 2);
    meth.flags |= ProtoFlags::SELF_PARAM;
    meth.emit(Instr::abc(OpCode::Return, 0, 0, 0));
    let f_meth = m.add_function(meth);

    let mut main = FunctionBuilder::new(0, 3);
    let key = main.constant(m.string_constant("meth"));
    let child = main.child(f_meth);
    main.emit(Instr::abx(OpCode::Closure, 0, child));
    main.emit(Instr::abx(OpCode::SetGlobal, 0, key));
    main.emit(Instr::abc(OpCode::Return, 0, 0, 0));
    let f_main = m.add_function(main);

    let mut engine = ExecutionEngine::new(VmConfig::default()).unwrap();
    engine.load_base_image(&m.build(f_main), "methods").unwrap();
    let instance = engine.fork_instance(None).unwrap();

    let meth = engine.get_global(instance, "meth").unwrap();
    let error = engine.event_on(instance, "e", meth, false).unwrap_err();
    assert!(error.to_string().contains("method-style"));
}

#[test]
fn test_dispatch_gate_rejects_external_dispatch() {
    let (mut engine, instance) = engine_with_instance();
    install_log(&mut engine, instance);
    let h = handler(&mut engine, instance, "h");
    engine.event_on(instance, "e", h, false).unwrap();

    engine.callbacks.may_handle_event = Some(Box::new(|_| false));
    assert!(engine.dispatch_event(instance, "e", &[]).is_err());

    engine.callbacks.may_handle_event = Some(Box::new(|_| true));
    assert!(engine.dispatch_event(instance, "e", &[]).is_ok());
}

#[test]
fn test_between_handler_interrupt_yields_n_minus_one_times() {
    let (mut engine, instance) = engine_with_instance();
    let log = install_log(&mut engine, instance);
    for marker in ["h1", "h2", "h3"] {
        let h = handler(&mut engine, instance, marker);
        engine.event_on(instance, "e", h, false).unwrap();
    }

    let boundaries = Rc::new(Cell::new(0u32));
    let seen = Rc::clone(&boundaries);
    engine.callbacks.interrupt = Some(Box::new(move |_, hint, _| {
        if hint == -2 {
            seen.set(seen.get() + 1);
            InterruptAction::Yield
        } else {
            InterruptAction::Continue
        }
    }));

    // Three handlers: the dispatch suspends at both boundaries and
    // completes on the third resume.
    let r1 = engine.dispatch_event(instance, "e", &[]).unwrap();
    assert_eq!(r1, Resumption::Yield(Vec::new()));
    let r2 = engine.resume_dispatch(instance, &[]).unwrap();
    assert_eq!(r2, Resumption::Yield(Vec::new()));
    let r3 = engine.resume_dispatch(instance, &[]).unwrap();
    assert!(matches!(r3, Resumption::Finished(_)));

    assert_eq!(boundaries.get(), 2);
    assert_eq!(log_entries(&engine, log), vec!["h1", "h2", "h3"]);
}

#[test]
fn test_handler_error_interrupts_dispatch_but_not_manager() {
    let (mut engine, instance) = engine_with_instance();
    let log = install_log(&mut engine, instance);

    let raiser = global_fn(&mut engine, instance, "raise_error");
    let after = handler(&mut engine, instance, "after");
    let raiser_handle = engine.event_on(instance, "e", raiser, false).unwrap();
    engine.event_on(instance, "e", after, false).unwrap();

    let r = engine.dispatch_event(instance, "e", &[]).unwrap();
    let Resumption::Error(value) = r else {
        panic!("expected the dispatch to fail, got {r:?}");
    };
    assert_eq!(string_of(&engine, value), "boom");

    // State is intact: drop the failing handler and dispatch again.
    engine.event_off(instance, "e", raiser_handle).unwrap();
    let r = engine.dispatch_event(instance, "e", &[]).unwrap();
    assert!(matches!(r, Resumption::Finished(_)));
    assert_eq!(log_entries(&engine, log), vec!["after"]);
}

fn redispatch(engine: &mut ExecutionEngine, ctx: NativeCall) -> VmResult<NativeControl> {
    let Value::Thread(instance) = engine.native_upvalue(ctx.thread, 0) else {
        unreachable!("instance upvalue");
    };
    // Re-entering dispatch from inside a handler must fail.
    engine.dispatch_event(instance, "other", &[])?;
    Ok(NativeControl::Return(0))
}

#[test]
fn test_recursive_dispatch_rejected() {
    let (mut engine, instance) = engine_with_instance();
    install_log(&mut engine, instance);
    engine
        .register_native("test.redispatch", redispatch, None, false)
        .unwrap();
    let reenter = engine
        .make_native_closure("test.redispatch", vec![Value::Thread(instance)])
        .unwrap();
    engine.event_on(instance, "e", reenter, false).unwrap();

    let r = engine.dispatch_event(instance, "e", &[]).unwrap();
    let Resumption::Error(value) = r else {
        panic!("expected recursive dispatch to fail, got {r:?}");
    };
    assert!(string_of(&engine, value).contains("recursive event dispatch"));

    // The guard resets once the failed dispatch unwinds.
    let r = engine.dispatch_event(instance, "e", &[]).unwrap();
    assert!(matches!(r, Resumption::Error(_)));
}

#[test]
fn test_state_switch_via_yield_payload() {
    let (mut engine, instance) = engine_with_instance();
    install_log(&mut engine, instance);

    let state_handler = global_fn(&mut engine, instance, "state_handler");
    engine.event_on(instance, "touch", state_handler, false).unwrap();

    // The handler yields the integer 2: the embedder reads it as "switch
    // to state 2".
    let r = engine.dispatch_event(instance, "touch", &[]).unwrap();
    let Resumption::Yield(values) = r else {
        panic!("expected a state-switch yield, got {r:?}");
    };
    assert_eq!(values, vec![Value::Number(2.0)]);
    let old_handler = engine.current_handler(instance).unwrap();

    // Discard the in-flight handler thread and bind a fresh one to the new
    // state's entry point; the instance itself is untouched.
    let entry = global_fn(&mut engine, instance, "count_loop");
    let new_handler = engine.spawn_handler(instance, entry).unwrap();
    assert_ne!(old_handler, new_handler);
    let values = finished(engine.resume(new_handler, &[]).unwrap());
    assert_eq!(values, vec![Value::Number(100.0)]);

    // The abandoned dispatch left no guard behind.
    let r = engine.dispatch_event(instance, "touch", &[]).unwrap();
    assert!(matches!(r, Resumption::Yield(_)));
}

#[test]
fn test_handler_thread_is_reaped_after_dispatch() {
    let (mut engine, instance) = engine_with_instance();
    install_log(&mut engine, instance);
    let h = handler(&mut engine, instance, "h");
    engine.event_on(instance, "e", h, false).unwrap();

    engine.dispatch_event(instance, "e", &[]).unwrap();
    assert!(engine.current_handler(instance).is_none());
}

// ---- timers --------------------------------------------------------------

fn clocked_engine() -> (ExecutionEngine, ares_vm::ThreadRef, Rc<Cell<f64>>) {
    let (mut engine, instance) = engine_with_instance();
    let clock = Rc::new(Cell::new(0.0f64));
    let source = Rc::clone(&clock);
    engine.callbacks.clock = Some(Box::new(move || source.get()));
    (engine, instance, clock)
}

#[test]
fn test_negative_interval_rejected_zero_allowed() {
    let (mut engine, instance, _clock) = clocked_engine();
    install_log(&mut engine, instance);
    let h = handler(&mut engine, instance, "t");
    assert!(engine.timer_on(instance, -0.5, h, false).is_err());
    assert!(engine.timer_on(instance, 0.0, h, false).is_ok());
}

#[test]
fn test_periodic_timer_catchup_clamping() {
    let (mut engine, instance, clock) = clocked_engine();
    let log = install_log(&mut engine, instance);
    let h = handler(&mut engine, instance, "t");
    engine.timer_on(instance, 0.1, h, false).unwrap();

    let mut fire = |engine: &mut ExecutionEngine, at: f64| {
        clock.set(at);
        let r = engine.tick_timers(instance).unwrap();
        assert!(matches!(r, Resumption::Finished(_)), "tick at {at}");
    };

    fire(&mut engine, 0.05); // before due: nothing
    fire(&mut engine, 0.101); // one firing
    fire(&mut engine, 3.0); // far behind: one firing, due snaps to now
    fire(&mut engine, 3.101); // one firing

    assert_eq!(log_entries(&engine, log).len(), 3);
}

#[test]
fn test_zero_interval_fires_every_tick() {
    let (mut engine, instance, clock) = clocked_engine();
    let log = install_log(&mut engine, instance);
    let h = handler(&mut engine, instance, "z");
    engine.timer_on(instance, 0.0, h, false).unwrap();

    for step in 1..=4 {
        clock.set(step as f64 * 0.1);
        engine.tick_timers(instance).unwrap();
    }
    assert_eq!(log_entries(&engine, log).len(), 4);
}

#[test]
fn test_one_shot_timer_and_off() {
    let (mut engine, instance, clock) = clocked_engine();
    let log = install_log(&mut engine, instance);

    let once = handler(&mut engine, instance, "once");
    let periodic = handler(&mut engine, instance, "periodic");
    engine.timer_on(instance, 0.1, once, true).unwrap();
    let periodic_handle = engine.timer_on(instance, 0.1, periodic, false).unwrap();

    clock.set(0.2);
    engine.tick_timers(instance).unwrap();
    clock.set(0.35);
    engine.tick_timers(instance).unwrap();
    assert_eq!(
        log_entries(&engine, log),
        vec!["once", "periodic", "periodic"]
    );

    assert!(engine.timer_off(instance, periodic_handle).unwrap());
    clock.set(1.0);
    engine.tick_timers(instance).unwrap();
    assert_eq!(log_entries(&engine, log).len(), 3);
}

#[test]
fn test_timer_due_hint_reaches_embedder() {
    let (mut engine, instance, _clock) = clocked_engine();
    install_log(&mut engine, instance);

    let hinted = Rc::new(Cell::new(f64::NAN));
    let sink = Rc::clone(&hinted);
    engine.callbacks.timer_due = Some(Box::new(move |_, dt| sink.set(dt)));

    let h = handler(&mut engine, instance, "t");
    engine.timer_on(instance, 0.25, h, false).unwrap();
    assert!((hinted.get() - 0.25).abs() < 1e-9);
}

#[test]
fn test_timer_handlers_share_interrupt_discipline() {
    let (mut engine, instance, clock) = clocked_engine();
    let log = install_log(&mut engine, instance);
    for marker in ["t1", "t2"] {
        let h = handler(&mut engine, instance, marker);
        engine.timer_on(instance, 0.1, h, false).unwrap();
    }

    engine.callbacks.interrupt = Some(Box::new(|_, hint, _| {
        if hint == -2 {
            InterruptAction::Yield
        } else {
            InterruptAction::Continue
        }
    }));

    clock.set(0.5);
    // Two due handlers: one boundary, so one yield, then completion.
    let r = engine.tick_timers(instance).unwrap();
    assert_eq!(r, Resumption::Yield(Vec::new()));
    let r = engine.resume_dispatch(instance, &[]).unwrap();
    assert!(matches!(r, Resumption::Finished(_)));
    assert_eq!(log_entries(&engine, log), vec!["t1", "t2"]);
}

#[test]
fn test_tick_without_clock_fails_cleanly() {
    let (mut engine, instance) = engine_with_instance();
    install_log(&mut engine, instance);
    let r = engine.tick_timers(instance).unwrap();
    let Resumption::Error(value) = r else {
        panic!("expected missing clock to fail the tick, got {r:?}");
    };
    assert!(string_of(&engine, value).contains("no clock source"));
}

#[test]
fn test_handler_suspension_status_is_visible() {
    let (mut engine, instance) = engine_with_instance();
    install_log(&mut engine, instance);
    let state_handler = global_fn(&mut engine, instance, "state_handler");
    engine.event_on(instance, "touch", state_handler, false).unwrap();

    engine.dispatch_event(instance, "touch", &[]).unwrap();
    let handler_thread = engine.current_handler(instance).unwrap();
    assert_eq!(
        engine.task_status(handler_thread),
        ThreadStatus::Suspended
    );
}
