//! Exception-handling compliance tests.
//!
//! Covers handler matching order, finally semantics on every exit path,
//! stack-trace capture, the unified fault policy, and stack-overflow
//! recovery.

use vesper_engine::{Engine, Error, Value};

fn eval(engine: &mut Engine, source: &str) -> Value {
    engine.eval(source).expect("evaluation failed")
}

fn eval_str(engine: &mut Engine, source: &str) -> String {
    let value = eval(engine, source);
    engine.render(&value)
}

fn eval_err(engine: &mut Engine, source: &str) -> vesper_engine::RuntimeError {
    match engine.eval(source) {
        Err(Error::Runtime(error)) => error,
        other => panic!("expected a runtime error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_throw_and_catch_by_class() {
    let mut engine = Engine::new();
    let result = eval_str(
        &mut engine,
        "class E : Exception { }\n\
         function f() { \
           try { throw E(\"x\"); } catch (E e) { return e.message; } \
         }\n\
         f();",
    );
    assert_eq!(result, "x");
}

#[test]
fn test_catch_matches_subclass_against_base_filter() {
    let mut engine = Engine::new();
    eval(
        &mut engine,
        "class Base : Exception { }\n\
         class Specific : Base { }",
    );
    let result = eval_str(
        &mut engine,
        "function f() { \
           try { throw Specific(\"s\"); } catch (Base e) { return \"base:\" + e.message; } \
         }\n\
         f();",
    );
    assert_eq!(result, "base:s");
}

#[test]
fn test_innermost_matching_handler_wins() {
    let mut engine = Engine::new();
    eval(
        &mut engine,
        "class Base : Exception { }\n\
         class Specific : Base { }",
    );
    let result = eval_str(
        &mut engine,
        "let log = \"\";\n\
         try { \
           try { throw Specific(\"s\"); } catch (Specific e) { log = log + \"inner;\"; } \
         } catch (Base e) { \
           log = log + \"outer;\"; \
         }\n\
         log;",
    );
    assert_eq!(result, "inner;");
}

#[test]
fn test_non_matching_filter_propagates_outward() {
    let mut engine = Engine::new();
    eval(
        &mut engine,
        "class A : Exception { }\n\
         class B : Exception { }",
    );
    let result = eval_str(
        &mut engine,
        "let log = \"\";\n\
         try { \
           try { throw B(\"b\"); } catch (A e) { log = log + \"wrong;\"; } \
         } catch (B e) { \
           log = log + \"right;\"; \
         }\n\
         log;",
    );
    assert_eq!(result, "right;");
}

#[test]
fn test_finally_runs_once_on_normal_exit() {
    let mut engine = Engine::new();
    let value = eval(
        &mut engine,
        "let effects = 0;\n\
         try { 1 + 1; } finally { effects = effects + 1; }\n\
         effects;",
    );
    assert_eq!(value, Value::Int(1));
}

#[test]
fn test_finally_runs_once_on_exceptional_exit_then_rethrows() {
    let mut engine = Engine::new();
    let result = eval_str(
        &mut engine,
        "let log = \"\";\n\
         function f() { \
           try { \
             try { throw Exception(\"boom\"); } finally { log = log + \"F\"; } \
           } catch (e) { \
             log = log + \"C\"; \
           } \
         }\n\
         f();\n\
         log;",
    );
    assert_eq!(result, "FC");
}

#[test]
fn test_finally_runs_once_when_catch_returns() {
    // The full end-to-end scenario: the catch returns, and the finally
    // still runs exactly once before the return completes.
    let mut engine = Engine::new();
    eval(
        &mut engine,
        "let effects = 0;\n\
         function sideEffect() { effects = effects + 1; }\n\
         class E : Exception { }\n\
         function f() { \
           try { throw E(\"x\"); } \
           catch (E e) { return e.message; } \
           finally { sideEffect(); } \
         }",
    );
    assert_eq!(eval_str(&mut engine, "f();"), "x");
    assert_eq!(eval(&mut engine, "effects;"), Value::Int(1));
}

#[test]
fn test_finally_runs_when_try_returns() {
    let mut engine = Engine::new();
    let result = eval_str(
        &mut engine,
        "let log = \"\";\n\
         function f() { \
           try { log = log + \"T\"; return \"r\"; } finally { log = log + \"F\"; } \
         }\n\
         let r = f();\n\
         log + r;",
    );
    assert_eq!(result, "TFr");
}

#[test]
fn test_throw_in_catch_body_still_runs_finally() {
    let mut engine = Engine::new();
    let result = eval_str(
        &mut engine,
        "let log = \"\";\n\
         function f() { \
           try { \
             try { throw Exception(\"one\"); } \
             catch (e) { throw Exception(\"two\"); } \
             finally { log = log + \"F\"; } \
           } catch (e) { \
             log = log + e.message; \
           } \
         }\n\
         f();\n\
         log;",
    );
    assert_eq!(result, "Ftwo");
}

#[test]
fn test_unwinding_pops_frames_without_handlers() {
    let mut engine = Engine::new();
    let result = eval_str(
        &mut engine,
        "class E : Exception { }\n\
         function inner() { throw E(\"deep\"); }\n\
         function middle() { inner(); return \"unreached\"; }\n\
         function outer() { \
           try { middle(); } catch (E e) { return e.message; } \
         }\n\
         outer();",
    );
    assert_eq!(result, "deep");
}

#[test]
fn test_uncaught_exception_reports_trace_innermost_first() {
    let mut engine = Engine::new();
    let error = eval_err(
        &mut engine,
        "function inner() { throw Exception(\"lost\"); }\n\
         function outer() { inner(); }\n\
         outer();",
    );
    assert_eq!(error.message, "Exception: lost");
    assert!(error.trace.len() >= 3);
    assert!(error.trace[0].contains("in inner()"));
    assert!(error.trace[1].contains("in outer()"));
    assert!(error.trace.last().unwrap().contains("in script()"));
}

#[test]
fn test_trace_is_readable_through_the_exception_object() {
    let mut engine = Engine::new();
    let value = eval(
        &mut engine,
        "function f() { throw Exception(\"t\"); }\n\
         let lines = nil;\n\
         try { f(); } catch (e) { lines = e.trace; }\n\
         lines.length;",
    );
    assert!(matches!(value, Value::Int(n) if n >= 2));
}

#[test]
fn test_thrown_non_exception_values_are_wrapped() {
    let mut engine = Engine::new();
    let result = eval_str(
        &mut engine,
        "let r = nil;\n\
         try { throw 42; } catch (Exception e) { r = e.message; }\n\
         r;",
    );
    assert_eq!(result, "42");
}

#[test]
fn test_runtime_faults_are_catchable_exceptions() {
    // The unified policy: type mismatches, bad arity, bad subscripts, and
    // division by zero all raise catchable exceptions.
    let mut engine = Engine::new();
    let value = eval(
        &mut engine,
        "function caught(f) { \
           try { f(); } catch (Exception e) { return true; } \
           return false; \
         }\n\
         let results = [ \
           caught(function() { return 1 + \"x\"; }), \
           caught(function() { return [1][9]; }), \
           caught(function() { return 1 / 0; }), \
           caught(function() { missingGlobal; return nil; }) \
         ];\n\
         results[0] == true && results[1] == true \
           && results[2] == true && results[3] == true;",
    );
    assert_eq!(value, Value::Bool(true));
}

#[test]
fn test_deep_recursion_is_a_reported_stack_overflow() {
    let mut engine = Engine::new();
    let error = eval_err(
        &mut engine,
        "function recurse(n) { return recurse(n + 1); }\n\
         recurse(0);",
    );
    assert_eq!(error.message, "Exception: stack overflow");
    assert!(!error.trace.is_empty());
}

#[test]
fn test_stack_overflow_is_recoverable_by_catch() {
    let mut engine = Engine::new();
    let result = eval_str(
        &mut engine,
        "function recurse(n) { return recurse(n + 1); }\n\
         let r = nil;\n\
         try { recurse(0); } catch (e) { r = e.message; }\n\
         r;",
    );
    assert_eq!(result, "stack overflow");

    // The engine is still usable afterwards.
    assert_eq!(eval(&mut engine, "1 + 1;"), Value::Int(2));
}

#[test]
fn test_will_throw_hook_observes_the_exception() {
    let mut engine = Engine::new();
    let result = eval_str(
        &mut engine,
        "let observed = \"\";\n\
         class Audited : Exception { \
           function willThrow() { observed = this.message; } \
         }\n\
         try { throw Audited(\"seen\"); } catch (e) { }\n\
         observed;",
    );
    assert_eq!(result, "seen");
}

#[test]
fn test_exception_state_is_reset_between_units() {
    let mut engine = Engine::new();
    assert!(engine.eval("throw Exception(\"first\");").is_err());
    assert_eq!(eval(&mut engine, "2 + 2;"), Value::Int(4));
}

#[test]
fn test_handler_disarms_on_fallthrough() {
    // A throw after a completed try region must not resume its handler.
    let mut engine = Engine::new();
    let error = eval_err(
        &mut engine,
        "function f() { \
           try { 1; } catch (e) { return \"stale\"; } \
           throw Exception(\"after\"); \
         }\n\
         f();",
    );
    assert_eq!(error.message, "Exception: after");
}
