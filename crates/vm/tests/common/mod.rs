//! Shared fixture: a compiled module exercising calls, closures over
//! shared locals, generic iteration, yields, and error paths, assembled
//! through the bytecode builder the way an external compiler would emit
//! it.

#![allow(dead_code)]

use ares_vm::bytecode::proto::{Capture, Constant, ProtoFlags};
use ares_vm::bytecode::{FunctionBuilder, Instr, ModuleBuilder, OpCode};
use ares_vm::{ExecutionEngine, Resumption, Value, VmConfig};

/// Builds the shared test image. Globals defined by its initializer:
///
/// - `add(a, b)`, `vsum(...)` — arithmetic
/// - `gen()` — yields "k1", the shared `word` upvalue, then "z3"
/// - `setword(v)` — mutates the upvalue shared with `gen`
/// - `getter()` / `setter(v)` — share a second upvalue cell
/// - `sum_table(t)`, `visit_and_delete(t)`, `iter_yield(t)` — iteration
/// - `count_loop()` — a plain counted loop with back-edge safepoints
/// - `state_handler()` — yields the number 2 (state-switch payload)
/// - `raise_error()` — raises the string "boom"
/// - `recurse()` — unbounded recursion
/// - `make_handler(marker)` — returns a closure appending `marker` to the
///   global `log` table
/// - `arg_recorder(x)` — appends its first argument to `log`
/// - `pcall_probe()` — returns `pcall(raise_error)`
pub fn test_image() -> Vec<u8> {
    let mut m = ModuleBuilder::new();

    // 0: add(a, b)
    let mut add = FunctionBuilder::new(2, 4);
    add.emit(Instr::abc(OpCode::Add, 2, 0, 1));
    add.emit(Instr::abc(OpCode::Return, 2, 1, 0));
    let f_add = m.add_function(add);

    // 1: gen() — upvalue 0 is the parent's `word` local
    let mut gen = FunctionBuilder::new(0, 3);
    let k_yield = m.string_constant("yield");
    let k_k1 = m.string_constant("k1");
    let k_z3 = m.string_constant("z3");
    {
        let ky = gen.constant(k_yield.clone());
        let kk1 = gen.constant(k_k1.clone());
        let kz3 = gen.constant(k_z3.clone());
        gen.capture(Capture::Local(0));
        gen.emit(Instr::abx(OpCode::GetGlobal, 0, ky));
        gen.emit(Instr::abx(OpCode::LoadConst, 1, kk1));
        gen.emit(Instr::abc(OpCode::Call, 0, 1, 0));
        gen.emit(Instr::abx(OpCode::GetGlobal, 0, ky));
        gen.emit(Instr::abc(OpCode::GetUpvalue, 1, 0, 0));
        gen.emit(Instr::abc(OpCode::Call, 0, 1, 0));
        gen.emit(Instr::abx(OpCode::GetGlobal, 0, ky));
        gen.emit(Instr::abx(OpCode::LoadConst, 1, kz3));
        gen.emit(Instr::abc(OpCode::Call, 0, 1, 0));
        gen.emit(Instr::abc(OpCode::Return, 0, 0, 0));
    }
    let f_gen = m.add_function(gen);

    // 2: setword(v)
    let mut setword = FunctionBuilder::new(1, 2);
    setword.capture(Capture::Local(0));
    setword.emit(Instr::abc(OpCode::SetUpvalue, 0, 0, 0));
    setword.emit(Instr::abc(OpCode::Return, 0, 0, 0));
    let f_setword = m.add_function(setword);

    // 3: getter()
    let mut getter = FunctionBuilder::new(0, 2);
    getter.capture(Capture::Local(1));
    getter.emit(Instr::abc(OpCode::GetUpvalue, 0, 0, 0));
    getter.emit(Instr::abc(OpCode::Return, 0, 1, 0));
    let f_getter = m.add_function(getter);

    // 4: setter(v)
    let mut setter = FunctionBuilder::new(1, 2);
    setter.capture(Capture::Local(1));
    setter.emit(Instr::abc(OpCode::SetUpvalue, 0, 0, 0));
    setter.emit(Instr::abc(OpCode::Return, 0, 0, 0));
    let f_setter = m.add_function(setter);

    // 5: sum_table(t)
    let mut sum = FunctionBuilder::new(1, 8);
    {
        let k0 = sum.constant(Constant::Number(0.0));
        sum.emit(Instr::abx(OpCode::LoadConst, 1, k0)); // sum
        sum.emit(Instr::abc(OpCode::Move, 2, 0, 0)); // iterated table
        let prep = sum.emit_jump(OpCode::ForGenPrep, 2);
        let body = sum.here();
        sum.emit(Instr::abc(OpCode::Add, 1, 1, 5)); // sum += value
        let loop_pc = sum.here();
        sum.emit_jump(OpCode::ForGenLoop, 2);
        sum.patch_jump(prep, loop_pc);
        sum.patch_jump(loop_pc, body);
        sum.emit(Instr::abc(OpCode::Return, 1, 1, 0));
    }
    let f_sum = m.add_function(sum);

    // 6: visit_and_delete(t) — deletes the visited key, counts visits
    let mut vdel = FunctionBuilder::new(1, 8);
    {
        let k0 = vdel.constant(Constant::Number(0.0));
        let k1 = vdel.constant(Constant::Number(1.0));
        vdel.emit(Instr::abx(OpCode::LoadConst, 1, k0)); // count
        vdel.emit(Instr::abx(OpCode::LoadConst, 6, k1)); // one
        vdel.emit(Instr::abc(OpCode::LoadNil, 7, 0, 0));
        vdel.emit(Instr::abc(OpCode::Move, 2, 0, 0));
        let prep = vdel.emit_jump(OpCode::ForGenPrep, 2);
        let body = vdel.here();
        vdel.emit(Instr::abc(OpCode::Add, 1, 1, 6)); // count += 1
        vdel.emit(Instr::abc(OpCode::SetTable, 2, 4, 7)); // t[key] = nil
        let loop_pc = vdel.here();
        vdel.emit_jump(OpCode::ForGenLoop, 2);
        vdel.patch_jump(prep, loop_pc);
        vdel.patch_jump(loop_pc, body);
        vdel.emit(Instr::abc(OpCode::Return, 1, 1, 0));
    }
    let f_vdel = m.add_function(vdel);

    // 7: count_loop()
    let mut cl = FunctionBuilder::new(0, 4);
    {
        let k0 = cl.constant(Constant::Number(0.0));
        let k100 = cl.constant(Constant::Number(100.0));
        let k1 = cl.constant(Constant::Number(1.0));
        cl.emit(Instr::abx(OpCode::LoadConst, 0, k0));
        cl.emit(Instr::abx(OpCode::LoadConst, 1, k100));
        cl.emit(Instr::abx(OpCode::LoadConst, 2, k1));
        let body = cl.here();
        cl.emit(Instr::abc(OpCode::Add, 0, 0, 2));
        cl.emit(Instr::abc(OpCode::Lt, 3, 0, 1));
        let jump = cl.emit_jump(OpCode::JumpIf, 3);
        cl.patch_jump(jump, body);
        cl.emit(Instr::abc(OpCode::Return, 0, 1, 0));
    }
    let f_count = m.add_function(cl);

    // 8: state_handler() — yields the integer 2
    let mut sh = FunctionBuilder::new(0, 3);
    {
        let ky = sh.constant(k_yield.clone());
        let k2 = sh.constant(Constant::Number(2.0));
        sh.emit(Instr::abx(OpCode::GetGlobal, 0, ky));
        sh.emit(Instr::abx(OpCode::LoadConst, 1, k2));
        sh.emit(Instr::abc(OpCode::Call, 0, 1, 0));
        sh.emit(Instr::abc(OpCode::Return, 0, 0, 0));
    }
    let f_state = m.add_function(sh);

    // 9: raise_error()
    let mut re = FunctionBuilder::new(0, 3);
    {
        let ke = re.constant(m.string_constant("error"));
        let kb = re.constant(m.string_constant("boom"));
        re.emit(Instr::abx(OpCode::GetGlobal, 0, ke));
        re.emit(Instr::abx(OpCode::LoadConst, 1, kb));
        re.emit(Instr::abc(OpCode::Call, 0, 1, 0));
        re.emit(Instr::abc(OpCode::Return, 0, 0, 0));
    }
    let f_raise = m.add_function(re);

    // 10: recurse()
    let mut rec = FunctionBuilder::new(0, 2);
    {
        let kr = rec.constant(m.string_constant("recurse"));
        rec.emit(Instr::abx(OpCode::GetGlobal, 0, kr));
        rec.emit(Instr::abc(OpCode::Call, 0, 0, 0));
        rec.emit(Instr::abc(OpCode::Return, 0, 0, 0));
    }
    let f_recurse = m.add_function(rec);

    // 11: appender() — child of make_handler; upvalue 0 is the marker
    let mut app = FunctionBuilder::new(0, 6);
    {
        let kl = app.constant(m.string_constant("log"));
        let k1 = app.constant(Constant::Number(1.0));
        app.capture(Capture::Local(0));
        app.emit(Instr::abx(OpCode::GetGlobal, 0, kl));
        app.emit(Instr::abc(OpCode::Len, 1, 0, 0));
        app.emit(Instr::abx(OpCode::LoadConst, 2, k1));
        app.emit(Instr::abc(OpCode::Add, 1, 1, 2));
        app.emit(Instr::abc(OpCode::GetUpvalue, 2, 0, 0));
        app.emit(Instr::abc(OpCode::SetTable, 0, 1, 2));
        app.emit(Instr::abc(OpCode::Return, 0, 0, 0));
    }
    let f_app = m.add_function(app);

    // 12: make_handler(marker)
    let mut mk = FunctionBuilder::new(1, 3);
    {
        let child = mk.child(f_app);
        mk.emit(Instr::abx(OpCode::Closure, 1, child));
        mk.emit(Instr::abc(OpCode::Return, 1, 1, 0));
    }
    let f_make = m.add_function(mk);

    // 13: arg_recorder(x)
    let mut ar = FunctionBuilder::new(1, 6);
    {
        let kl = ar.constant(m.string_constant("log"));
        let k1 = ar.constant(Constant::Number(1.0));
        ar.emit(Instr::abx(OpCode::GetGlobal, 1, kl));
        ar.emit(Instr::abc(OpCode::Len, 2, 1, 0));
        ar.emit(Instr::abx(OpCode::LoadConst, 3, k1));
        ar.emit(Instr::abc(OpCode::Add, 2, 2, 3));
        ar.emit(Instr::abc(OpCode::SetTable, 1, 2, 0));
        ar.emit(Instr::abc(OpCode::Return, 0, 0, 0));
    }
    let f_rec = m.add_function(ar);

    // 14: pcall_probe()
    let mut pp = FunctionBuilder::new(0, 4);
    {
        let kp = pp.constant(m.string_constant("pcall"));
        let kr = pp.constant(m.string_constant("raise_error"));
        pp.emit(Instr::abx(OpCode::GetGlobal, 0, kp));
        pp.emit(Instr::abx(OpCode::GetGlobal, 1, kr));
        pp.emit(Instr::abc(OpCode::Call, 0, 1, 2));
        pp.emit(Instr::abc(OpCode::Return, 0, 2, 0));
    }
    let f_pcall = m.add_function(pp);

    // 15: iter_yield(t) — yields every key in iteration order
    let mut iy = FunctionBuilder::new(1, 8);
    {
        let ky = iy.constant(k_yield.clone());
        iy.emit(Instr::abc(OpCode::Move, 2, 0, 0));
        let prep = iy.emit_jump(OpCode::ForGenPrep, 2);
        let body = iy.here();
        iy.emit(Instr::abx(OpCode::GetGlobal, 6, ky));
        iy.emit(Instr::abc(OpCode::Move, 7, 4, 0)); // key
        iy.emit(Instr::abc(OpCode::Call, 6, 1, 0));
        let loop_pc = iy.here();
        iy.emit_jump(OpCode::ForGenLoop, 2);
        iy.patch_jump(prep, loop_pc);
        iy.patch_jump(loop_pc, body);
        iy.emit(Instr::abc(OpCode::Return, 0, 0, 0));
    }
    let f_iter = m.add_function(iy);

    // 16: vsum(...) — sum of the first three varargs
    let mut vs = FunctionBuilder::new(0, 6);
    vs.flags |= ProtoFlags::VARARG;
    vs.emit(Instr::abc(OpCode::Vararg, 0, 3, 0));
    vs.emit(Instr::abc(OpCode::Add, 3, 0, 1));
    vs.emit(Instr::abc(OpCode::Add, 3, 3, 2));
    vs.emit(Instr::abc(OpCode::Return, 3, 1, 0));
    let f_vsum = m.add_function(vs);

    // 17: main — the one-shot initializer
    let mut main = FunctionBuilder::new(0, 8);
    {
        let k_word = main.constant(m.string_constant("b2"));
        let k_one = main.constant(Constant::Number(1.0));
        main.emit(Instr::abx(OpCode::LoadConst, 0, k_word)); // word
        main.emit(Instr::abx(OpCode::LoadConst, 1, k_one)); // cell

        let bindings: Vec<(&str, u32)> = vec![
            ("add", f_add),
            ("gen", f_gen),
            ("setword", f_setword),
            ("getter", f_getter),
            ("setter", f_setter),
            ("sum_table", f_sum),
            ("visit_and_delete", f_vdel),
            ("count_loop", f_count),
            ("state_handler", f_state),
            ("raise_error", f_raise),
            ("recurse", f_recurse),
            ("make_handler", f_make),
            ("arg_recorder", f_rec),
            ("pcall_probe", f_pcall),
            ("iter_yield", f_iter),
            ("vsum", f_vsum),
        ];
        for (name, index) in bindings {
            let child = main.child(index);
            let key = main.constant(m.string_constant(name));
            main.emit(Instr::abx(OpCode::Closure, 2, child));
            main.emit(Instr::abx(OpCode::SetGlobal, 2, key));
        }
        main.emit(Instr::abc(OpCode::Return, 0, 0, 0));
    }
    let f_main = m.add_function(main);

    m.build(f_main)
}

/// Engine with the test image loaded and one instance forked.
pub fn engine_with_instance() -> (ExecutionEngine, ares_vm::ThreadRef) {
    let mut engine = ExecutionEngine::new(VmConfig::default()).expect("engine");
    engine
        .load_base_image(&test_image(), "test-image")
        .expect("base image");
    let instance = engine.fork_instance(None).expect("instance");
    (engine, instance)
}

/// Looks a function up through the instance's globals chain.
pub fn global_fn(engine: &mut ExecutionEngine, instance: ares_vm::ThreadRef, name: &str) -> Value {
    let v = engine.get_global(instance, name).expect("global lookup");
    assert!(
        matches!(v, Value::Closure(_)),
        "global '{name}' should be a function, got {}",
        v.type_name()
    );
    v
}

/// Spawns a task for `func` under `instance` and resumes it once.
pub fn run(
    engine: &mut ExecutionEngine,
    instance: ares_vm::ThreadRef,
    func: Value,
    args: &[Value],
) -> Resumption {
    let task = engine.spawn_task(instance, func).expect("spawn");
    let result = engine.resume(task, args).expect("resume");
    engine.discard_task(task);
    result
}

/// Extracts the finished values or panics with the actual resumption.
pub fn finished(resumption: Resumption) -> Vec<Value> {
    match resumption {
        Resumption::Finished(values) => values,
        other => panic!("expected task to finish, got {other:?}"),
    }
}

/// Renders a string value through the engine's heap.
pub fn string_of(engine: &ExecutionEngine, value: Value) -> String {
    match value {
        Value::String(s) => engine.heap().string_lossy(s).into_owned(),
        other => panic!("expected a string, got {other:?}"),
    }
}
