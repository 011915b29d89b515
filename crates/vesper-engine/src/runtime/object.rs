//! Heap object representation.
//!
//! Every heap allocation is an [`Obj`]: a small header (owning class, GC
//! mark) plus one [`ObjData`] payload variant. Objects reference each other
//! exclusively through [`Handle`]s, so the collector can trace the graph
//! without raw pointers.

use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::compiler::Chunk;
use crate::gc::Handle;
use crate::runtime::native::NativeFn;
use crate::runtime::value::Value;
use crate::vm::frame::Handler;

/// A heap object: header plus payload.
#[derive(Debug)]
pub struct Obj {
    /// The owning class, if the object has a user-visible one. Raw strings,
    /// functions, and other engine-internal kinds carry `None`.
    pub class: Option<Handle>,
    /// Mark bit for the tracing collector
    pub marked: bool,
    /// The payload
    pub data: ObjData,
}

impl Obj {
    /// Creates a new unmarked object.
    pub fn new(class: Option<Handle>, data: ObjData) -> Self {
        Self {
            class,
            marked: false,
            data,
        }
    }

    /// Appends every handle this object references to `out`.
    ///
    /// This is the single source of truth for the collector's blacken step;
    /// each payload kind lists exactly the references it holds.
    pub fn trace_refs(&self, out: &mut Vec<Handle>) {
        fn push_value(out: &mut Vec<Handle>, value: &Value) {
            if let Value::Obj(handle) = value {
                out.push(*handle);
            }
        }

        if let Some(class) = self.class {
            out.push(class);
        }

        match &self.data {
            ObjData::Str(_) | ObjData::Range(_) | ObjData::Native(_) => {}
            ObjData::Function(function) => {
                for constant in &function.chunk.constants {
                    push_value(out, constant);
                }
            }
            ObjData::Closure(closure) => {
                out.push(closure.function);
                out.extend(closure.upvalues.iter().copied());
            }
            ObjData::Upvalue(upvalue) => {
                if let UpvalueState::Closed(value) = &upvalue.state {
                    push_value(out, value);
                }
            }
            ObjData::Class(class) => {
                if let Some(namespace) = class.namespace {
                    out.push(namespace);
                }
                if let Some(superclass) = class.superclass {
                    out.push(superclass);
                }
                for value in class
                    .methods
                    .values()
                    .chain(class.getters.values())
                    .chain(class.setters.values())
                    .chain(class.field_defaults.values())
                {
                    push_value(out, value);
                }
                for value in class.interceptors.slots() {
                    push_value(out, &value);
                }
            }
            ObjData::Instance(instance) => {
                for value in instance.fields.values() {
                    push_value(out, value);
                }
            }
            ObjData::BoundMethod(bound) => {
                push_value(out, &bound.receiver);
                push_value(out, &bound.method);
            }
            ObjData::Array(elements) => {
                for value in elements {
                    push_value(out, value);
                }
            }
            ObjData::Dict(entries) => {
                for value in entries.values() {
                    push_value(out, value);
                }
            }
            ObjData::Exception(exception) => {
                for value in exception.fields.values() {
                    push_value(out, value);
                }
            }
            ObjData::Generator(generator) => {
                out.push(generator.closure);
                for value in &generator.slots {
                    push_value(out, value);
                }
            }
            ObjData::Promise(promise) => {
                push_value(out, &promise.value);
                for value in &promise.callbacks {
                    push_value(out, value);
                }
            }
            ObjData::Namespace(namespace) => {
                if let Some(parent) = namespace.parent {
                    out.push(parent);
                }
                for value in namespace.bindings.values() {
                    push_value(out, value);
                }
            }
        }
    }

    /// Returns the approximate size of this object in bytes, used for the
    /// collector's allocation accounting.
    pub fn size_bytes(&self) -> usize {
        let base = std::mem::size_of::<Self>();
        let payload = match &self.data {
            ObjData::Str(s) => s.len(),
            ObjData::Function(function) => {
                function.chunk.code.len()
                    + function.chunk.lines.len() * 4
                    + function.chunk.constants.len() * std::mem::size_of::<Value>()
            }
            ObjData::Closure(closure) => closure.upvalues.len() * std::mem::size_of::<Handle>(),
            ObjData::Upvalue(_) | ObjData::Range(_) | ObjData::Native(_) => 0,
            ObjData::Class(class) => {
                (class.methods.len()
                    + class.getters.len()
                    + class.setters.len()
                    + class.field_defaults.len())
                    * table_entry_size()
            }
            ObjData::Instance(instance) => instance.fields.len() * table_entry_size(),
            ObjData::BoundMethod(_) => 0,
            ObjData::Array(elements) => elements.len() * std::mem::size_of::<Value>(),
            ObjData::Dict(entries) => entries.len() * table_entry_size(),
            ObjData::Exception(exception) => {
                exception.message.len()
                    + exception.trace.iter().map(String::len).sum::<usize>()
                    + exception.fields.len() * table_entry_size()
            }
            ObjData::Generator(generator) => generator.slots.len() * std::mem::size_of::<Value>(),
            ObjData::Promise(promise) => promise.callbacks.len() * std::mem::size_of::<Value>(),
            ObjData::Namespace(namespace) => namespace.bindings.len() * table_entry_size(),
        };
        base + payload
    }
}

fn table_entry_size() -> usize {
    std::mem::size_of::<String>() + std::mem::size_of::<Value>()
}

/// The payload of a heap object.
#[derive(Debug)]
pub enum ObjData {
    /// An interned string
    Str(String),
    /// A compiled function (bytecode template for closures)
    Function(ObjFunction),
    /// A runtime closure: function plus captured upvalues
    Closure(ObjClosure),
    /// A captured variable, open (stack slot) or closed (copied value)
    Upvalue(ObjUpvalue),
    /// A class descriptor
    Class(ObjClass),
    /// An instance with an open field table
    Instance(ObjInstance),
    /// A method bound to a receiver
    BoundMethod(ObjBoundMethod),
    /// An array of values
    Array(Vec<Value>),
    /// A string-keyed dictionary
    Dict(FxHashMap<String, Value>),
    /// A half-open integer range
    Range(ObjRange),
    /// An exception with message and captured stack trace
    Exception(ObjException),
    /// A suspended or running generator
    Generator(ObjGenerator),
    /// A promise settled by the host's event loop through the native ABI
    Promise(ObjPromise),
    /// A hierarchical named binding scope
    Namespace(ObjNamespace),
    /// A native (Rust) function or method
    Native(ObjNative),
}

impl ObjData {
    /// Returns the kind name used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ObjData::Str(_) => "string",
            ObjData::Function(_) => "function",
            ObjData::Closure(_) => "function",
            ObjData::Upvalue(_) => "upvalue",
            ObjData::Class(_) => "class",
            ObjData::Instance(_) => "instance",
            ObjData::BoundMethod(_) => "method",
            ObjData::Array(_) => "array",
            ObjData::Dict(_) => "dictionary",
            ObjData::Range(_) => "range",
            ObjData::Exception(_) => "exception",
            ObjData::Generator(_) => "generator",
            ObjData::Promise(_) => "promise",
            ObjData::Namespace(_) => "namespace",
            ObjData::Native(_) => "function",
        }
    }
}

/// A compiled function.
#[derive(Debug)]
pub struct ObjFunction {
    /// The function name; empty for the top-level script
    pub name: String,
    /// Number of declared parameters
    pub arity: u8,
    /// Whether the single `...` parameter packs all arguments into an array
    pub is_variadic: bool,
    /// Whether the body contains `yield`
    pub is_generator: bool,
    /// Number of upvalues captured by closures over this function
    pub upvalue_count: usize,
    /// The compiled bytecode
    pub chunk: Rc<Chunk>,
}

impl ObjFunction {
    /// Returns the name to show in stack traces.
    pub fn trace_name(&self) -> &str {
        if self.name.is_empty() {
            "script"
        } else {
            &self.name
        }
    }
}

/// A runtime closure.
#[derive(Debug)]
pub struct ObjClosure {
    /// The compiled function
    pub function: Handle,
    /// Captured upvalues, in resolution order
    pub upvalues: Vec<Handle>,
}

/// A captured variable.
#[derive(Debug)]
pub struct ObjUpvalue {
    /// Open (live stack slot) or closed (copied value)
    pub state: UpvalueState,
}

/// The open/closed state of an upvalue. An upvalue transitions open→closed
/// exactly once, when its owning frame pops.
#[derive(Debug)]
pub enum UpvalueState {
    /// Points at a live absolute stack slot
    Open(usize),
    /// The slot's value, copied out when the frame popped
    Closed(Value),
}

/// What calling a class constructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassKind {
    /// Ordinary instances
    Plain,
    /// Exception objects (message + captured trace)
    Exception,
    /// Promise objects
    Promise,
}

/// A class descriptor.
#[derive(Debug)]
pub struct ObjClass {
    /// The class name
    pub name: String,
    /// The namespace the class was defined in, if any
    pub namespace: Option<Handle>,
    /// The superclass, if any
    pub superclass: Option<Handle>,
    /// What instances of this class are; inherited by copy like the tables
    pub kind: ClassKind,
    /// Method table
    pub methods: FxHashMap<String, Value>,
    /// Getter table
    pub getters: FxHashMap<String, Value>,
    /// Setter table
    pub setters: FxHashMap<String, Value>,
    /// Instance-field defaults, evaluated once at class-creation time
    pub field_defaults: FxHashMap<String, Value>,
    /// Optional lifecycle hooks
    pub interceptors: Interceptors,
}

impl ObjClass {
    /// Creates a new empty class.
    pub fn new(name: String) -> Self {
        Self {
            name,
            namespace: None,
            superclass: None,
            kind: ClassKind::Plain,
            methods: FxHashMap::default(),
            getters: FxHashMap::default(),
            setters: FxHashMap::default(),
            field_defaults: FxHashMap::default(),
            interceptors: Interceptors::default(),
        }
    }
}

/// The lifecycle hooks a class may define.
///
/// Each hook is a capability slot holding the handler closure (or native)
/// when present; the VM's property/invoke/throw paths check presence before
/// falling back to default behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptorKind {
    /// Reading a property that neither fields nor methods define
    UndefinedProperty,
    /// Invoking a method the class does not define
    UndefinedMethod,
    /// Before a property read
    WillGetProperty,
    /// After a property read
    DidGetProperty,
    /// Before a property write
    WillSetProperty,
    /// After a property write
    DidSetProperty,
    /// Before a method invocation
    WillInvoke,
    /// After a method invocation
    DidInvoke,
    /// Before an exception of this class starts unwinding
    WillThrow,
    /// After an exception of this class was caught
    DidThrow,
}

impl InterceptorKind {
    /// Maps a reserved method name to its hook, if it is one.
    pub fn from_method_name(name: &str) -> Option<InterceptorKind> {
        let kind = match name {
            "undefinedProperty" => InterceptorKind::UndefinedProperty,
            "undefinedMethod" => InterceptorKind::UndefinedMethod,
            "willGetProperty" => InterceptorKind::WillGetProperty,
            "didGetProperty" => InterceptorKind::DidGetProperty,
            "willSetProperty" => InterceptorKind::WillSetProperty,
            "didSetProperty" => InterceptorKind::DidSetProperty,
            "willInvoke" => InterceptorKind::WillInvoke,
            "didInvoke" => InterceptorKind::DidInvoke,
            "willThrow" => InterceptorKind::WillThrow,
            "didThrow" => InterceptorKind::DidThrow,
            _ => return None,
        };
        Some(kind)
    }
}

/// Interceptor capability slots.
#[derive(Debug, Default, Clone)]
pub struct Interceptors {
    undefined_property: Option<Value>,
    undefined_method: Option<Value>,
    will_get_property: Option<Value>,
    did_get_property: Option<Value>,
    will_set_property: Option<Value>,
    did_set_property: Option<Value>,
    will_invoke: Option<Value>,
    did_invoke: Option<Value>,
    will_throw: Option<Value>,
    did_throw: Option<Value>,
}

impl Interceptors {
    /// Installs a handler for the given hook.
    pub fn set(&mut self, kind: InterceptorKind, handler: Value) {
        *self.slot_mut(kind) = Some(handler);
    }

    /// Returns the handler for the given hook, if installed.
    pub fn get(&self, kind: InterceptorKind) -> Option<Value> {
        match kind {
            InterceptorKind::UndefinedProperty => self.undefined_property,
            InterceptorKind::UndefinedMethod => self.undefined_method,
            InterceptorKind::WillGetProperty => self.will_get_property,
            InterceptorKind::DidGetProperty => self.did_get_property,
            InterceptorKind::WillSetProperty => self.will_set_property,
            InterceptorKind::DidSetProperty => self.did_set_property,
            InterceptorKind::WillInvoke => self.will_invoke,
            InterceptorKind::DidInvoke => self.did_invoke,
            InterceptorKind::WillThrow => self.will_throw,
            InterceptorKind::DidThrow => self.did_throw,
        }
    }

    fn slot_mut(&mut self, kind: InterceptorKind) -> &mut Option<Value> {
        match kind {
            InterceptorKind::UndefinedProperty => &mut self.undefined_property,
            InterceptorKind::UndefinedMethod => &mut self.undefined_method,
            InterceptorKind::WillGetProperty => &mut self.will_get_property,
            InterceptorKind::DidGetProperty => &mut self.did_get_property,
            InterceptorKind::WillSetProperty => &mut self.will_set_property,
            InterceptorKind::DidSetProperty => &mut self.did_set_property,
            InterceptorKind::WillInvoke => &mut self.will_invoke,
            InterceptorKind::DidInvoke => &mut self.did_invoke,
            InterceptorKind::WillThrow => &mut self.will_throw,
            InterceptorKind::DidThrow => &mut self.did_throw,
        }
    }

    /// Returns every installed handler, for GC tracing.
    pub fn slots(&self) -> impl Iterator<Item = Value> + '_ {
        [
            self.undefined_property,
            self.undefined_method,
            self.will_get_property,
            self.did_get_property,
            self.will_set_property,
            self.did_set_property,
            self.will_invoke,
            self.did_invoke,
            self.will_throw,
            self.did_throw,
        ]
        .into_iter()
        .flatten()
    }
}

/// An instance with an open, string-keyed field table. The owning class
/// lives in the object header.
#[derive(Debug, Default)]
pub struct ObjInstance {
    /// The instance's fields
    pub fields: FxHashMap<String, Value>,
}

/// A method bound to its receiver.
#[derive(Debug)]
pub struct ObjBoundMethod {
    /// The receiver the method was read from
    pub receiver: Value,
    /// The underlying closure or native
    pub method: Value,
}

/// A half-open integer range `start..end`.
#[derive(Debug, Clone, Copy)]
pub struct ObjRange {
    /// Inclusive start
    pub start: i64,
    /// Exclusive end
    pub end: i64,
}

impl ObjRange {
    /// Number of elements in the range.
    pub fn len(&self) -> i64 {
        (self.end - self.start).max(0)
    }

    /// Returns whether the range is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An exception: message, captured stack trace, and an open field table for
/// user subclasses. The owning class lives in the object header.
#[derive(Debug, Default)]
pub struct ObjException {
    /// The message
    pub message: String,
    /// Formatted frames, innermost first; empty until the exception is thrown
    pub trace: Vec<String>,
    /// Extra fields set by user initializers
    pub fields: FxHashMap<String, Value>,
}

/// Lifecycle of a generator object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    /// Created or suspended at a `yield`
    Suspended,
    /// Currently executing on the VM stack
    Running,
    /// Returned; further resumes produce nil
    Done,
}

/// A generator: a suspended call frame stored on the heap.
///
/// Suspending copies the frame's live stack-slot window (callee + locals)
/// and armed handlers into the object; resuming copies them back and
/// restarts the dispatch loop at the saved instruction offset.
#[derive(Debug)]
pub struct ObjGenerator {
    /// The generator body's closure
    pub closure: Handle,
    /// Saved instruction offset
    pub ip: usize,
    /// Saved frame slots (callee value followed by locals)
    pub slots: Vec<Value>,
    /// Saved armed try regions
    pub handlers: Vec<Handler>,
    /// Current lifecycle state
    pub state: GeneratorState,
}

/// Settlement state of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    /// Not yet settled
    Pending,
    /// Settled with a value
    Fulfilled,
    /// Settled with an error value
    Rejected,
}

/// A promise. The engine only stores state; scheduling is owned by the
/// host's event loop, which settles promises through the native ABI.
#[derive(Debug)]
pub struct ObjPromise {
    /// Settlement state
    pub state: PromiseState,
    /// The settlement value (nil while pending)
    pub value: Value,
    /// Callables to invoke on settlement
    pub callbacks: Vec<Value>,
}

impl Default for ObjPromise {
    fn default() -> Self {
        Self {
            state: PromiseState::Pending,
            value: Value::Nil,
            callbacks: Vec::new(),
        }
    }
}

/// A hierarchical, dot-qualified named binding scope.
#[derive(Debug)]
pub struct ObjNamespace {
    /// The namespace's own name (unqualified)
    pub name: String,
    /// The enclosing namespace, if nested
    pub parent: Option<Handle>,
    /// Bindings: classes, functions, constants, nested namespaces
    pub bindings: FxHashMap<String, Value>,
}

impl ObjNamespace {
    /// Creates a new empty namespace.
    pub fn new(name: String, parent: Option<Handle>) -> Self {
        Self {
            name,
            parent,
            bindings: FxHashMap::default(),
        }
    }
}

/// A native (Rust) function or method.
pub struct ObjNative {
    /// The name, for diagnostics and traces
    pub name: String,
    /// Declared arity; -1 accepts any argument count
    pub arity: i8,
    /// The function pointer
    pub function: NativeFn,
}

impl std::fmt::Debug for ObjNative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjNative({})", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interceptor_reserved_names() {
        assert_eq!(
            InterceptorKind::from_method_name("undefinedProperty"),
            Some(InterceptorKind::UndefinedProperty)
        );
        assert_eq!(
            InterceptorKind::from_method_name("willThrow"),
            Some(InterceptorKind::WillThrow)
        );
        assert_eq!(InterceptorKind::from_method_name("init"), None);
    }

    #[test]
    fn test_interceptor_slots() {
        let mut interceptors = Interceptors::default();
        assert!(interceptors.get(InterceptorKind::UndefinedProperty).is_none());
        assert_eq!(interceptors.slots().count(), 0);

        interceptors.set(InterceptorKind::UndefinedProperty, Value::Int(1));
        interceptors.set(InterceptorKind::DidThrow, Value::Int(2));
        assert_eq!(
            interceptors.get(InterceptorKind::UndefinedProperty),
            Some(Value::Int(1))
        );
        assert_eq!(interceptors.slots().count(), 2);
    }

    #[test]
    fn test_range_len() {
        assert_eq!(ObjRange { start: 2, end: 7 }.len(), 5);
        assert!(ObjRange { start: 3, end: 3 }.is_empty());
        assert!(ObjRange { start: 5, end: 1 }.is_empty());
    }

    #[test]
    fn test_trace_refs_covers_containers() {
        let child = Handle::from_raw(7, 0);
        let mut obj = Obj::new(None, ObjData::Array(vec![Value::Obj(child), Value::Int(1)]));
        let mut refs = Vec::new();
        obj.trace_refs(&mut refs);
        assert_eq!(refs, vec![child]);

        obj.class = Some(Handle::from_raw(9, 0));
        refs.clear();
        obj.trace_refs(&mut refs);
        assert_eq!(refs.len(), 2);
    }
}
