//! Language compliance tests.
//!
//! Drives the public `Engine` API end to end: closures and upvalues, scope
//! hygiene, classes and inheritance, generators, namespaces, interceptors,
//! and garbage-collector liveness.

use vesper_engine::runtime::object::{InterceptorKind, ObjData};
use vesper_engine::{Engine, Error, NativeError, Value, Vm};

fn eval(engine: &mut Engine, source: &str) -> Value {
    engine.eval(source).expect("evaluation failed")
}

fn eval_str(engine: &mut Engine, source: &str) -> String {
    let value = eval(engine, source);
    engine.render(&value)
}

// ---- closures and upvalues -------------------------------------------------

#[test]
fn test_captured_variable_mutation_across_calls() {
    let mut engine = Engine::new();
    eval(
        &mut engine,
        "function makeCounter() { \
           let x = 1; \
           return function() { x = x + 1; return x; }; \
         }\n\
         let f = makeCounter();",
    );
    assert_eq!(eval(&mut engine, "f();"), Value::Int(2));
    assert_eq!(eval(&mut engine, "f();"), Value::Int(3));
}

#[test]
fn test_closures_share_one_upvalue_per_slot() {
    let mut engine = Engine::new();
    // While the scope is open, both closures see each other's mutations;
    // after it closes they keep sharing the same (now heap-allocated) cell.
    let result = eval_str(
        &mut engine,
        "function build() { \
           let observed = 0; \
           let inc = nil; \
           let read = nil; \
           { \
             let captured = 10; \
             inc = function() { captured = captured + 1; }; \
             read = function() { return captured; }; \
             inc(); \
             observed = read(); \
           } \
           inc(); \
           return \"${observed},${read()}\"; \
         }\n\
         build();",
    );
    assert_eq!(result, "11,12");
}

#[test]
fn test_scope_shadowing_restores_outer_binding() {
    let mut engine = Engine::new();
    let result = eval_str(
        &mut engine,
        "function probe() { \
           let a = \"outer\"; \
           let seen = nil; \
           { let a = \"inner\"; seen = a; } \
           return \"${seen},${a}\"; \
         }\n\
         probe();",
    );
    assert_eq!(result, "inner,outer");
}

#[test]
fn test_shadowed_declaration_in_same_scope_is_rejected() {
    let mut engine = Engine::new();
    match engine.eval("function f() { let a = 1; let a = 2; }") {
        Err(Error::Compile(diagnostics)) => {
            assert!(diagnostics[0].message.contains("already declared"));
        }
        other => panic!("expected a compile error, got {:?}", other.map(|_| ())),
    }
}

// ---- arity and variadics ---------------------------------------------------

#[test]
fn test_fixed_arity_is_enforced() {
    let mut engine = Engine::new();
    eval(&mut engine, "function two(a, b) { return a + b; }");
    match engine.eval("two(1);") {
        Err(Error::Runtime(error)) => {
            assert!(error.message.contains("expected 2 arguments but got 1"));
        }
        other => panic!("expected a runtime error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_variadic_packs_all_arguments() {
    let mut engine = Engine::new();
    eval(&mut engine, "function pack(...args) { return args; }");
    assert_eq!(eval(&mut engine, "pack().length;"), Value::Int(0));
    assert_eq!(eval(&mut engine, "pack(1, 2, 3).length;"), Value::Int(3));
    assert_eq!(eval(&mut engine, "pack(7, 8)[1];"), Value::Int(8));
}

// ---- classes ---------------------------------------------------------------

#[test]
fn test_method_resolution_uses_dynamic_class() {
    let mut engine = Engine::new();
    eval(
        &mut engine,
        "class A { function get() { return 1; } }\n\
         class B : A { function get() { return 2; } }",
    );
    assert_eq!(eval(&mut engine, "B().get();"), Value::Int(2));
    // A bound method invoked later still resolves on the dynamic class.
    assert_eq!(eval(&mut engine, "let m = B().get; m();"), Value::Int(2));
    assert_eq!(eval(&mut engine, "A().get();"), Value::Int(1));
}

#[test]
fn test_inherit_copies_superclass_tables_at_creation_time() {
    // Mutating a superclass after a subclass was created must not affect
    // the subclass: `inherit` copies by snapshot.
    let mut engine = Engine::new();
    eval(
        &mut engine,
        "class A { function get() { return 1; } }\n\
         class B : A { }",
    );
    assert_eq!(eval(&mut engine, "B().get();"), Value::Int(1));

    fn ninety_nine(_vm: &mut Vm, _receiver: Value, _args: &[Value]) -> Result<Value, NativeError> {
        Ok(Value::Int(99))
    }
    let class_a = engine
        .vm()
        .lookup_global("A")
        .and_then(|value| value.as_handle())
        .expect("class A");
    engine.vm().define_method(class_a, "get", 0, ninety_nine);

    assert_eq!(eval(&mut engine, "A().get();"), Value::Int(99));
    assert_eq!(eval(&mut engine, "B().get();"), Value::Int(1));
}

#[test]
fn test_super_dispatch() {
    let mut engine = Engine::new();
    let result = eval_str(
        &mut engine,
        "class Animal { \
           function speak() { return \"...\"; } \
           function describe() { return \"animal says ${this.speak()}\"; } \
         }\n\
         class Dog : Animal { \
           function speak() { return \"woof\"; } \
           function describe() { return super.describe() + \"!\"; } \
         }\n\
         Dog().describe();",
    );
    assert_eq!(result, "animal says woof!");
}

#[test]
fn test_initializer_and_field_defaults() {
    let mut engine = Engine::new();
    eval(
        &mut engine,
        "class Config { \
           let retries = 3; \
           function init(host) { this.host = host; } \
         }\n\
         class Wider : Config { }",
    );
    assert_eq!(eval(&mut engine, "Config(\"a\").retries;"), Value::Int(3));
    assert_eq!(eval_str(&mut engine, "Config(\"srv\").host;"), "srv");
    // Field defaults are inherited by copy like methods.
    assert_eq!(eval(&mut engine, "Wider(\"b\").retries;"), Value::Int(3));
}

#[test]
fn test_getters_and_setters() {
    let mut engine = Engine::new();
    eval(
        &mut engine,
        "class Temp { \
           function init() { this.celsius = 0; } \
           get fahrenheit() { return this.celsius * 9 / 5 + 32; } \
           set fahrenheit(v) { this.celsius = (v - 32) * 5 / 9; } \
         }\n\
         let t = Temp();",
    );
    assert_eq!(eval(&mut engine, "t.fahrenheit;"), Value::Int(32));
    eval(&mut engine, "t.fahrenheit = 212;");
    assert_eq!(eval(&mut engine, "t.celsius;"), Value::Int(100));
}

#[test]
fn test_equality_override_via_equals_method() {
    let mut engine = Engine::new();
    eval(
        &mut engine,
        "class Pt { \
           function init(x) { this.x = x; } \
           function equals(other) { return this.x == other.x; } \
         }\n\
         class Raw { function init(x) { this.x = x; } }",
    );
    assert_eq!(eval(&mut engine, "Pt(1) == Pt(1);"), Value::Bool(true));
    assert_eq!(eval(&mut engine, "Pt(1) == Pt(2);"), Value::Bool(false));
    // Without an override, instances compare by identity.
    assert_eq!(eval(&mut engine, "Raw(1) == Raw(1);"), Value::Bool(false));
    assert_eq!(
        eval(&mut engine, "let r = Raw(1); r == r;"),
        Value::Bool(true)
    );
}

// ---- interceptors ----------------------------------------------------------

#[test]
fn test_undefined_property_interceptor() {
    let mut engine = Engine::new();
    let result = eval_str(
        &mut engine,
        "class Flexible { \
           function undefinedProperty(name) { return \"missing:\" + name; } \
         }\n\
         Flexible().whatever;",
    );
    assert_eq!(result, "missing:whatever");
}

#[test]
fn test_undefined_method_interceptor_receives_arguments() {
    let mut engine = Engine::new();
    eval(
        &mut engine,
        "class Flexible { \
           function undefinedMethod(name, args) { return args.length; } \
         }",
    );
    assert_eq!(eval(&mut engine, "Flexible().anything(1, 2, 3);"), Value::Int(3));
}

#[test]
fn test_property_access_hooks_fire() {
    let mut engine = Engine::new();
    eval(
        &mut engine,
        "let log = \"\";\n\
         class Watched { \
           let x = 7; \
           function willGetProperty(name) { log = log + \"get:\" + name + \";\"; } \
           function willSetProperty(name, value) { log = log + \"set:\" + name + \";\"; } \
         }\n\
         let w = Watched();",
    );
    assert_eq!(eval(&mut engine, "w.x;"), Value::Int(7));
    eval(&mut engine, "w.x = 8;");
    assert_eq!(eval(&mut engine, "w.x;"), Value::Int(8));
    assert_eq!(eval_str(&mut engine, "log;"), "get:x;set:x;get:x;");
}

#[test]
fn test_undefined_property_without_interceptor_faults() {
    let mut engine = Engine::new();
    eval(&mut engine, "class Bare { }");
    match engine.eval("Bare().nope;") {
        Err(Error::Runtime(error)) => {
            assert!(error.message.contains("undefined property 'nope'"));
        }
        other => panic!("expected a runtime error, got {:?}", other.map(|_| ())),
    }
}

// ---- generators ------------------------------------------------------------

#[test]
fn test_generator_suspends_and_resumes() {
    let mut engine = Engine::new();
    eval(
        &mut engine,
        "function pair() { yield 1; yield 2; }\n\
         let g = pair();",
    );
    assert_eq!(eval(&mut engine, "g.done;"), Value::Bool(false));
    assert_eq!(eval(&mut engine, "g.next();"), Value::Int(1));
    assert_eq!(eval(&mut engine, "g.next();"), Value::Int(2));
    assert_eq!(eval(&mut engine, "g.next();"), Value::Nil);
    assert_eq!(eval(&mut engine, "g.done;"), Value::Bool(true));
}

#[test]
fn test_generator_keeps_locals_across_suspensions() {
    let mut engine = Engine::new();
    eval(
        &mut engine,
        "function upTo(n) { \
           let i = 0; \
           while (i < n) { yield i; i = i + 1; } \
         }\n\
         let g = upTo(3);",
    );
    assert_eq!(eval(&mut engine, "g.next();"), Value::Int(0));
    assert_eq!(eval(&mut engine, "g.next();"), Value::Int(1));
    assert_eq!(eval(&mut engine, "g.next();"), Value::Int(2));
    assert_eq!(eval(&mut engine, "g.next();"), Value::Nil);
}

// ---- namespaces ------------------------------------------------------------

#[test]
fn test_namespace_definition_and_qualified_access() {
    let mut engine = Engine::new();
    eval(
        &mut engine,
        "namespace geo { \
           function dist2(x, y) { return x * x + y * y; } \
           class Point { function init(x) { this.x = x; } } \
         }",
    );
    assert_eq!(eval(&mut engine, "geo.dist2(3, 4);"), Value::Int(25));
    assert_eq!(eval(&mut engine, "geo.Point(5).x;"), Value::Int(5));
}

#[test]
fn test_nested_namespaces() {
    let mut engine = Engine::new();
    eval(
        &mut engine,
        "namespace app { \
           namespace math { function sq(x) { return x * x; } } \
         }",
    );
    assert_eq!(eval(&mut engine, "app.math.sq(4);"), Value::Int(16));
}

#[test]
fn test_using_imports_bindings() {
    let mut engine = Engine::new();
    eval(
        &mut engine,
        "namespace geo { function dist2(x, y) { return x * x + y * y; } }\n\
         using geo;",
    );
    assert_eq!(eval(&mut engine, "dist2(1, 2);"), Value::Int(5));
}

// ---- control flow ----------------------------------------------------------

#[test]
fn test_break_and_continue() {
    let mut engine = Engine::new();
    let value = eval(
        &mut engine,
        "let total = 0; \
         for (let i = 0; i < 10; i = i + 1) { \
           if (i == 3) { continue; } \
           if (i == 6) { break; } \
           total = total + i; \
         } \
         total;",
    );
    assert_eq!(value, Value::Int(12));
}

#[test]
fn test_while_with_block_locals_and_break() {
    let mut engine = Engine::new();
    let value = eval(
        &mut engine,
        "let n = 0; \
         while (true) { let next = n + 1; n = next; if (n > 4) { break; } } \
         n;",
    );
    assert_eq!(value, Value::Int(5));
}

#[test]
fn test_logical_operators_short_circuit() {
    let mut engine = Engine::new();
    let value = eval(
        &mut engine,
        "let calls = 0; \
         function bump() { calls = calls + 1; return true; } \
         let a = false && bump(); \
         let b = true || bump(); \
         calls;",
    );
    assert_eq!(value, Value::Int(0));
}

// ---- garbage collection ----------------------------------------------------

#[test]
fn test_collection_preserves_reachable_cycles() {
    let mut engine = Engine::new();
    eval(
        &mut engine,
        "class Holder { }\n\
         function build() { \
           let obj = Holder(); \
           obj.myself = function() { return obj; }; \
           return obj; \
         }\n\
         let kept = build();",
    );
    engine.collect_garbage();
    // The instance is part of a cycle (instance -> closure -> upvalue ->
    // instance) and must survive as long as a root reaches it.
    assert_eq!(
        eval(&mut engine, "kept.myself() == kept;"),
        Value::Bool(true)
    );
}

#[test]
fn test_collection_reclaims_unreachable_cycles() {
    let mut engine = Engine::new();
    eval(
        &mut engine,
        "class Node { }\n\
         function cycle() { \
           let a = Node(); \
           let b = Node(); \
           a.next = b; \
           b.next = a; \
           return a; \
         }\n\
         let keep = cycle();",
    );
    engine.collect_garbage();
    let with_cycle = engine.heap_stats().live_objects;

    eval(&mut engine, "keep = nil;");
    engine.collect_garbage();
    let without_cycle = engine.heap_stats().live_objects;
    assert!(
        without_cycle + 2 <= with_cycle,
        "cyclic pair should have been reclaimed: {} -> {}",
        with_cycle,
        without_cycle
    );
}

#[test]
fn test_class_method_closure_instance_cycle_is_traced() {
    let mut engine = Engine::new();
    eval(
        &mut engine,
        "let registry = nil;\n\
         class Widget { \
           function init(tag) { \
             this.tag = tag; \
             registry = function() { return this; }; \
           } \
         }\n\
         let w = Widget(\"root\"); w = nil;",
    );
    engine.collect_garbage();
    // The instance is only reachable through the closure captured in init.
    assert_eq!(eval_str(&mut engine, "registry().tag;"), "root");
}

// ---- native extension ABI --------------------------------------------------

#[test]
fn test_native_namespace_registration() {
    fn shout(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value, NativeError> {
        let text = format!("{}!", vm.format_value(&args[0]));
        Ok(vm.intern(&text))
    }

    let mut engine = Engine::new();
    let namespace = engine.vm().define_namespace("host.text");
    engine.vm().define_function(Some(namespace), "shout", 1, shout);
    engine.vm().define_constant(None, "VERSION", Value::Int(3));

    assert_eq!(eval_str(&mut engine, "host.text.shout(\"hey\");"), "hey!");
    assert_eq!(eval(&mut engine, "VERSION;"), Value::Int(3));
    // Registered constants are write-once.
    assert!(engine.eval("VERSION = 4;").is_err());
}

#[test]
fn test_native_interceptor_registration() {
    fn fallback(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value, NativeError> {
        let name = vm.format_value(&args[0]);
        Ok(vm.intern(&format!("native:{}", name)))
    }

    let mut engine = Engine::new();
    eval(&mut engine, "class Opaque { }");
    let class = engine
        .vm()
        .lookup_global("Opaque")
        .and_then(|value| value.as_handle())
        .expect("class Opaque");
    engine
        .vm()
        .define_interceptor(class, InterceptorKind::UndefinedProperty, fallback);

    assert_eq!(eval_str(&mut engine, "Opaque().anything;"), "native:anything");
}

#[test]
fn test_promise_settles_through_the_native_api() {
    let mut engine = Engine::new();
    eval(
        &mut engine,
        "let p = Promise(); \
         let seen = nil; \
         function onDone(v) { seen = v; }",
    );
    let promise = engine
        .vm()
        .lookup_global("p")
        .and_then(|value| value.as_handle())
        .expect("promise");
    let callback = engine.vm().lookup_global("onDone").expect("callback");

    engine.vm().promise_on_settle(promise, callback).unwrap();
    assert_eq!(eval(&mut engine, "seen;"), Value::Nil);

    engine
        .vm()
        .settle_promise(promise, Value::Int(5), true)
        .unwrap();
    assert_eq!(eval(&mut engine, "seen;"), Value::Int(5));
    assert_eq!(eval_str(&mut engine, "typeOf(p);"), "promise");
}

// ---- values ----------------------------------------------------------------

#[test]
fn test_string_interning_makes_equality_structural() {
    let mut engine = Engine::new();
    assert_eq!(
        eval(&mut engine, "\"ab\" == \"a\" + \"b\";"),
        Value::Bool(true)
    );
    assert_eq!(eval(&mut engine, "\"ab\" == \"ac\";"), Value::Bool(false));
}

#[test]
fn test_numeric_literals() {
    let mut engine = Engine::new();
    assert_eq!(eval(&mut engine, "0xff;"), Value::Int(255));
    assert_eq!(eval(&mut engine, "0o17;"), Value::Int(15));
    assert_eq!(eval(&mut engine, "0b101;"), Value::Int(5));
    assert_eq!(eval(&mut engine, "1.5e2;"), Value::Float(150.0));
    assert_eq!(eval_str(&mut engine, "\"\\u0041\\U0001F600\";"), "A\u{1F600}");
}

#[test]
fn test_dictionary_values_are_traced() {
    let mut engine = Engine::new();
    eval(
        &mut engine,
        "let table = {\"k\": [1, 2, 3]};",
    );
    engine.collect_garbage();
    assert_eq!(eval(&mut engine, "table[\"k\"][2];"), Value::Int(3));
}

#[test]
fn test_subscript_assignment() {
    let mut engine = Engine::new();
    assert_eq!(
        eval(&mut engine, "let a = [1, 2]; a[0] = 9; a[0];"),
        Value::Int(9)
    );
    assert_eq!(
        eval(&mut engine, "let d = {}; d[\"k\"] = 4; d[\"k\"];"),
        Value::Int(4)
    );
}

#[test]
fn test_heap_objects_have_kind_names() {
    // Spot-check the kind tags the engine reports for diagnostics.
    let mut engine = Engine::new();
    assert_eq!(eval_str(&mut engine, "typeOf(nil);"), "nil");
    assert_eq!(eval_str(&mut engine, "typeOf({});"), "dictionary");
    assert_eq!(eval_str(&mut engine, "typeOf(1..2);"), "range");
    assert_eq!(eval_str(&mut engine, "class T { } typeOf(T());"), "instance");
    let handle = eval(&mut engine, "[];").as_handle().unwrap();
    assert!(matches!(
        engine.vm().heap().get(handle).data,
        ObjData::Array(_)
    ));
}
