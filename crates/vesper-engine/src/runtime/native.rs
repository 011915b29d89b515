//! The native extension ABI.
//!
//! A native function is a plain function pointer taking the VM, the call
//! receiver (nil for free functions), and the argument slice. Failure is
//! signaled by returning a [`NativeError`]: either a message the VM wraps
//! into an exception, or an already-built exception value. Packages register
//! functions, methods, classes, constants, namespaces, and interceptors
//! through the `define_*` calls on [`Vm`]; this is the whole contract the
//! standard-library packages build on.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::runtime::value::Value;
use crate::vm::Vm;

/// A native function or method.
pub type NativeFn = fn(&mut Vm, Value, &[Value]) -> Result<Value, NativeError>;

/// Failure signaled by native code.
#[derive(Debug)]
pub enum NativeError {
    /// A message the VM wraps into a base-class exception
    Message(String),
    /// An exception value to throw as-is
    Thrown(Value),
}

impl From<String> for NativeError {
    fn from(message: String) -> Self {
        NativeError::Message(message)
    }
}

impl From<&str> for NativeError {
    fn from(message: &str) -> Self {
        NativeError::Message(message.to_string())
    }
}

/// Registers the engine's baseline: `print`, `clock`, `typeOf`, and the
/// initializer of the built-in `Exception` class. Everything else belongs
/// to external packages.
pub fn register_core(vm: &mut Vm) {
    vm.define_function(None, "print", -1, native_print);
    vm.define_function(None, "clock", 0, native_clock);
    vm.define_function(None, "typeOf", 1, native_type_of);

    let exception_class = vm.exception_class();
    vm.define_method(exception_class, "init", 1, native_exception_init);
}

/// print(...values) — writes the values separated by spaces.
fn native_print(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value, NativeError> {
    let rendered: Vec<String> = args.iter().map(|arg| vm.format_value(arg)).collect();
    println!("{}", rendered.join(" "));
    Ok(Value::Nil)
}

/// clock() — seconds since the Unix epoch, as a float.
fn native_clock(_vm: &mut Vm, _receiver: Value, _args: &[Value]) -> Result<Value, NativeError> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| NativeError::Message(format!("clock unavailable: {}", e)))?;
    Ok(Value::Float(elapsed.as_secs_f64()))
}

/// typeOf(value) — the value's type name as a string.
fn native_type_of(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value, NativeError> {
    let name = vm.type_name(&args[0]);
    Ok(vm.intern(name))
}

/// Exception(message) — stores the message on the new exception object.
fn native_exception_init(
    vm: &mut Vm,
    receiver: Value,
    args: &[Value],
) -> Result<Value, NativeError> {
    let message = vm.format_value(&args[0]);
    vm.set_exception_message(receiver, &message);
    Ok(receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;

    fn eval(vm: &mut Vm, source: &str) -> Value {
        let function = compile(source, vm.heap_mut()).expect("compile error");
        vm.interpret(function).expect("runtime error")
    }

    #[test]
    fn test_type_of() {
        let mut vm = Vm::new();
        let value = eval(&mut vm, "typeOf(1);");
        assert_eq!(vm.format_value(&value), "int");
        let value = eval(&mut vm, "typeOf([1]);");
        assert_eq!(vm.format_value(&value), "array");
        let value = eval(&mut vm, "typeOf(typeOf);");
        assert_eq!(vm.format_value(&value), "function");
    }

    #[test]
    fn test_clock_returns_float() {
        let mut vm = Vm::new();
        let value = eval(&mut vm, "clock();");
        assert!(matches!(value, Value::Float(f) if f > 0.0));
    }

    #[test]
    fn test_exception_constructor_sets_message() {
        let mut vm = Vm::new();
        let value = eval(&mut vm, "Exception(\"boom\").message;");
        assert_eq!(vm.format_value(&value), "boom");
    }

    #[test]
    fn test_native_arity_mismatch_is_catchable() {
        let mut vm = Vm::new();
        let value = eval(
            &mut vm,
            "let r = nil; try { typeOf(1, 2); } catch (e) { r = e.message; } r;",
        );
        assert!(vm.format_value(&value).contains("expected 1 arguments"));
    }

    #[test]
    fn test_registered_native_can_reenter_the_vm() {
        fn call_twice(vm: &mut Vm, _receiver: Value, args: &[Value]) -> Result<Value, NativeError> {
            let callee = args[0];
            let first = vm
                .call_function(callee, &[Value::Int(1)])
                .map_err(|e| NativeError::Message(e.message))?;
            let second = vm
                .call_function(callee, &[first])
                .map_err(|e| NativeError::Message(e.message))?;
            Ok(second)
        }

        let mut vm = Vm::new();
        vm.define_function(None, "callTwice", 1, call_twice);
        let value = eval(
            &mut vm,
            "function inc(x) { return x + 1; } callTwice(inc);",
        );
        assert_eq!(value, Value::Int(3));
    }
}
