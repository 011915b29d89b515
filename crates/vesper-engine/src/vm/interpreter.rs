//! The bytecode virtual machine.
//!
//! One [`Vm`] owns the value stack, the call-frame stack, both global
//! tables, the open-upvalue list, and the heap: there is no ambient global
//! state, and several independent interpreters can coexist. The dispatch
//! loop fetches one opcode per iteration; every runtime fault is raised as a
//! catchable exception, and only the host decides whether an uncaught one
//! terminates the process.

use rustc_hash::FxHashMap;

use crate::compiler::{NO_TARGET, OpCode};
use crate::gc::{Handle, Heap};
use crate::runtime::native::{NativeError, NativeFn};
use crate::runtime::object::{
    ClassKind, GeneratorState, InterceptorKind, ObjBoundMethod, ObjClass, ObjClosure, ObjData,
    ObjException, ObjGenerator, ObjInstance, ObjNamespace, ObjNative, ObjPromise, ObjRange,
    ObjUpvalue, PromiseState, UpvalueState,
};
use crate::runtime::value::Value;
use crate::vm::frame::{CallFrame, Handler, MAX_FRAMES, MAX_HANDLERS};

/// Control tags pushed under `finally` bodies so `EndFinally` knows how the
/// region was entered.
const TAG_NORMAL: i64 = 0;
const TAG_THROW: i64 = 1;
const TAG_RETURN: i64 = 2;

/// An uncaught runtime exception, surfaced to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    /// "Class: message"
    pub message: String,
    /// Formatted frames, innermost first
    pub trace: Vec<String>,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.message)?;
        for frame in &self.trace {
            writeln!(f, "    {}", frame)?;
        }
        Ok(())
    }
}

/// The virtual machine.
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    /// Reassignable globals, consulted first on reads
    globals: FxHashMap<String, Value>,
    /// Write-once globals, consulted second
    constants: FxHashMap<String, Value>,
    /// Open upvalues ordered by descending stack slot; one per captured slot
    open_upvalues: Vec<Handle>,
    /// The built-in base exception class
    exception_class: Handle,
    /// The built-in promise class
    promise_class: Handle,
    /// Reentrancy floor: unwinding and returns never cross below this frame
    /// count, so native callbacks always observe a balanced stack
    frame_floor: usize,
    /// The exception behind the most recent uncaught error, for re-throwing
    /// across a reentrant boundary
    pending_exception: Option<Value>,
}

impl Vm {
    /// Creates a VM with the core classes and natives registered.
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let exception_class = heap.allocate(None, {
            let mut class = ObjClass::new("Exception".to_string());
            class.kind = ClassKind::Exception;
            ObjData::Class(class)
        });
        let promise_class = heap.allocate(None, {
            let mut class = ObjClass::new("Promise".to_string());
            class.kind = ClassKind::Promise;
            ObjData::Class(class)
        });

        let mut vm = Self {
            heap,
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(64),
            globals: FxHashMap::default(),
            constants: FxHashMap::default(),
            open_upvalues: Vec::new(),
            exception_class,
            promise_class,
            frame_floor: 0,
            pending_exception: None,
        };
        vm.constants
            .insert("Exception".to_string(), Value::Obj(exception_class));
        vm.constants
            .insert("Promise".to_string(), Value::Obj(promise_class));
        crate::runtime::native::register_core(&mut vm);
        vm
    }

    /// Read access to the heap, for hosts formatting or inspecting values.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Mutable heap access, for the compiler and native extensions.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// The built-in base exception class.
    pub fn exception_class(&self) -> Handle {
        self.exception_class
    }

    /// The built-in promise class.
    pub fn promise_class(&self) -> Handle {
        self.promise_class
    }

    /// Interns a string and returns it as a value.
    pub fn intern(&mut self, text: &str) -> Value {
        Value::Obj(self.heap.intern(text))
    }

    /// Forces a full collection cycle: marks every VM root, then lets the
    /// heap trace and sweep.
    pub fn collect_garbage(&mut self) {
        for i in 0..self.stack.len() {
            let value = self.stack[i];
            self.heap.mark_value(value);
        }
        for i in 0..self.frames.len() {
            let closure = self.frames[i].closure;
            self.heap.mark_handle(closure);
            if let Some(generator) = self.frames[i].generator {
                self.heap.mark_handle(generator);
            }
        }
        for i in 0..self.open_upvalues.len() {
            let upvalue = self.open_upvalues[i];
            self.heap.mark_handle(upvalue);
        }
        let globals: Vec<Value> = self.globals.values().copied().collect();
        for value in globals {
            self.heap.mark_value(value);
        }
        let constants: Vec<Value> = self.constants.values().copied().collect();
        for value in constants {
            self.heap.mark_value(value);
        }
        self.heap.mark_handle(self.exception_class);
        self.heap.mark_handle(self.promise_class);
        if let Some(pending) = self.pending_exception {
            self.heap.mark_value(pending);
        }
        self.heap.finish_collection();
    }

    /// Allocates through the collection trigger. Values the new object will
    /// reference must be reachable from a root (usually the VM stack) before
    /// calling this.
    fn alloc(&mut self, class: Option<Handle>, data: ObjData) -> Handle {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.allocate(class, data)
    }

    // ---- stack primitives --------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active frame");
        let byte = frame.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let frame = self.frames.last_mut().expect("no active frame");
        let value = frame.chunk.read_u16(frame.ip);
        frame.ip += 2;
        value
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_u16() as usize;
        self.frames.last().unwrap().chunk.constants[index]
    }

    /// Reads a name operand: a constant that is always an interned string.
    fn read_name(&mut self) -> String {
        let value = self.read_constant();
        let Value::Obj(handle) = value else {
            panic!("name constant is not a string")
        };
        self.heap.string(handle).to_string()
    }

    // ---- entry points ------------------------------------------------------

    /// Runs a compiled unit: wraps it in a closure and calls it with zero
    /// arguments at the top level.
    pub fn interpret(&mut self, function: Handle) -> Result<Value, RuntimeError> {
        self.heap.push_root(Value::Obj(function));
        let closure = self.alloc(
            None,
            ObjData::Closure(ObjClosure {
                function,
                upvalues: Vec::new(),
            }),
        );
        self.heap.pop_root();

        let chunk = match &self.heap.get(function).data {
            ObjData::Function(f) => f.chunk.clone(),
            _ => panic!("interpret expects a function"),
        };
        self.push(Value::Obj(closure));
        self.frames.push(CallFrame::new(closure, chunk, 0));

        let outcome = self.run();
        self.pending_exception = None;
        match outcome {
            Ok(value) => {
                self.pop();
                debug_assert!(self.stack.is_empty());
                Ok(value)
            }
            Err(error) => {
                self.stack.clear();
                self.frames.clear();
                self.open_upvalues.clear();
                Err(error)
            }
        }
    }

    /// Calls a callable value from native code, reentrantly.
    ///
    /// This is the only legal way for native code to re-enter the
    /// interpreter: the stack and frame depth are snapshotted and restored,
    /// so the surrounding native code (and a collection running during the
    /// call) always observes a balanced stack.
    pub fn call_function(&mut self, callee: Value, args: &[Value]) -> Result<Value, RuntimeError> {
        let base = self.stack.len();
        self.push(callee);
        for arg in args {
            self.push(*arg);
        }
        let argc = args.len();
        self.reentrant_call(base, move |vm| vm.call_value(argc))
    }

    /// Calls a method value against an explicit receiver, reentrantly.
    pub fn call_with_receiver(
        &mut self,
        method: Value,
        receiver: Value,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        let base = self.stack.len();
        self.push(receiver);
        for arg in args {
            self.push(*arg);
        }
        let argc = args.len();
        self.reentrant_call(base, move |vm| vm.call_method_value(method, argc))
    }

    fn reentrant_call(
        &mut self,
        base: usize,
        begin: impl FnOnce(&mut Vm) -> Result<(), RuntimeError>,
    ) -> Result<Value, RuntimeError> {
        let saved_floor = self.frame_floor;
        let saved_frames = self.frames.len();
        self.frame_floor = saved_frames;

        let mut result = begin(&mut *self);
        if result.is_ok() && self.frames.len() > saved_frames {
            result = self.run().map(|_| ());
        }
        self.frame_floor = saved_floor;

        match result {
            Ok(()) => {
                let value = self.pop();
                debug_assert_eq!(self.stack.len(), base);
                Ok(value)
            }
            Err(error) => {
                self.frames.truncate(saved_frames);
                self.stack.truncate(base);
                Err(error)
            }
        }
    }

    /// Re-raises the exception behind a reentrant failure in the current
    /// context, so a `try` around the original call site can still catch it.
    fn rethrow(&mut self, error: RuntimeError) -> Result<(), RuntimeError> {
        match self.pending_exception.take() {
            Some(exception) => self.throw_value(exception),
            None => Err(error),
        }
    }

    // ---- the dispatch loop -------------------------------------------------

    /// Executes until the frame count returns to the current floor. The
    /// finishing frame's result is left on the stack and also returned.
    fn run(&mut self) -> Result<Value, RuntimeError> {
        loop {
            let byte = self.read_byte();
            let op = OpCode::from_byte(byte).expect("invalid opcode");
            match op {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::Dup => {
                    let value = self.peek(0);
                    self.push(value);
                }

                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().base;
                    let value = self.stack[base + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().unwrap().base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.current_upvalue(index);
                    let value = match &self.heap.get(upvalue).data {
                        ObjData::Upvalue(u) => match u.state {
                            UpvalueState::Open(slot) => self.stack[slot],
                            UpvalueState::Closed(value) => value,
                        },
                        _ => unreachable!("closure upvalue is not an upvalue"),
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let upvalue = self.current_upvalue(index);
                    let value = self.peek(0);
                    let open_slot = match &mut self.heap.get_mut(upvalue).data {
                        ObjData::Upvalue(u) => match u.state {
                            UpvalueState::Open(slot) => Some(slot),
                            UpvalueState::Closed(_) => {
                                u.state = UpvalueState::Closed(value);
                                None
                            }
                        },
                        _ => unreachable!("closure upvalue is not an upvalue"),
                    };
                    if let Some(slot) = open_slot {
                        self.stack[slot] = value;
                    }
                }
                OpCode::GetGlobal => {
                    let name = self.read_name();
                    let value = self
                        .globals
                        .get(&name)
                        .or_else(|| self.constants.get(&name))
                        .copied();
                    match value {
                        Some(value) => self.push(value),
                        None => self.fault(format!("undefined variable '{}'", name))?,
                    }
                }
                OpCode::SetGlobal => {
                    let name = self.read_name();
                    if self.constants.contains_key(&name) {
                        self.fault(format!("cannot reassign constant '{}'", name))?;
                    } else if self.globals.contains_key(&name) {
                        let value = self.peek(0);
                        self.globals.insert(name, value);
                    } else {
                        self.fault(format!("undefined variable '{}'", name))?;
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_name();
                    if self.constants.contains_key(&name) {
                        self.fault(format!("'{}' is already defined as a constant", name))?;
                    } else {
                        let value = self.pop();
                        self.globals.insert(name, value);
                    }
                }
                OpCode::DefineConst => {
                    let name = self.read_name();
                    if self.constants.contains_key(&name) || self.globals.contains_key(&name) {
                        self.fault(format!("'{}' is already defined", name))?;
                    } else {
                        let value = self.pop();
                        self.constants.insert(name, value);
                    }
                }

                OpCode::Equal => self.equality(false)?,
                OpCode::NotEqual => self.equality(true)?,
                OpCode::Less
                | OpCode::LessEqual
                | OpCode::Greater
                | OpCode::GreaterEqual => self.comparison(op)?,

                OpCode::Add => self.add()?,
                OpCode::Subtract | OpCode::Multiply | OpCode::Divide | OpCode::Modulo => {
                    self.arithmetic(op)?
                }
                OpCode::Negate => {
                    let value = self.pop();
                    match value {
                        Value::Int(i) => match i.checked_neg() {
                            Some(negated) => self.push(Value::Int(negated)),
                            None => self.fault("integer overflow".to_string())?,
                        },
                        Value::Float(f) => self.push(Value::Float(-f)),
                        other => {
                            let kind = self.type_name(&other);
                            self.fault(format!("cannot negate a {}", kind))?
                        }
                    }
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(!value.is_truthy()));
                }

                OpCode::BitAnd | OpCode::BitOr | OpCode::BitXor | OpCode::ShiftLeft
                | OpCode::ShiftRight => self.bitwise(op)?,
                OpCode::BitNot => {
                    let value = self.pop();
                    match value {
                        Value::Int(i) => self.push(Value::Int(!i)),
                        other => {
                            let kind = self.type_name(&other);
                            self.fault(format!("bitwise operand must be an int, not {}", kind))?
                        }
                    }
                }

                OpCode::Stringify => {
                    let value = self.pop();
                    let text = self.format_value(&value);
                    let handle = self.heap.intern(&text);
                    self.push(Value::Obj(handle));
                }

                OpCode::Jump => {
                    let target = self.read_u16() as usize;
                    self.frames.last_mut().unwrap().ip = target;
                }
                OpCode::JumpIfFalse => {
                    let target = self.read_u16() as usize;
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().unwrap().ip = target;
                    }
                }
                OpCode::Loop => {
                    let target = self.read_u16() as usize;
                    self.frames.last_mut().unwrap().ip = target;
                }

                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    self.call_value(argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_name();
                    let argc = self.read_byte() as usize;
                    self.invoke(&name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_name();
                    let argc = self.read_byte() as usize;
                    let superclass = self.pop();
                    self.super_invoke(superclass, &name, argc)?;
                }

                OpCode::Closure => {
                    self.make_closure();
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                OpCode::Class => {
                    let name = self.read_name();
                    let class = self.alloc(None, ObjData::Class(ObjClass::new(name)));
                    self.push(Value::Obj(class));
                }
                OpCode::Inherit => self.inherit()?,
                OpCode::Method => {
                    let name = self.read_name();
                    self.bind_member(&name, MemberKind::Method)?;
                }
                OpCode::Getter => {
                    let name = self.read_name();
                    self.bind_member(&name, MemberKind::Getter)?;
                }
                OpCode::Setter => {
                    let name = self.read_name();
                    self.bind_member(&name, MemberKind::Setter)?;
                }
                OpCode::FieldDefault => {
                    let name = self.read_name();
                    self.bind_member(&name, MemberKind::FieldDefault)?;
                }

                OpCode::GetProperty => {
                    let name = self.read_name();
                    self.get_property(&name)?;
                }
                OpCode::SetProperty => {
                    let name = self.read_name();
                    self.set_property(&name)?;
                }
                OpCode::GetSuper => {
                    let name = self.read_name();
                    self.get_super(&name)?;
                }

                OpCode::Array => {
                    let count = self.read_u16() as usize;
                    let start = self.stack.len() - count;
                    let elements = self.stack[start..].to_vec();
                    let array = self.alloc(None, ObjData::Array(elements));
                    self.stack.truncate(start);
                    self.push(Value::Obj(array));
                }
                OpCode::Dict => {
                    self.make_dict()?;
                }
                OpCode::Range => {
                    let end = self.pop();
                    let start = self.pop();
                    match (start, end) {
                        (Value::Int(start), Value::Int(end)) => {
                            let range = self.alloc(None, ObjData::Range(ObjRange { start, end }));
                            self.push(Value::Obj(range));
                        }
                        _ => self.fault("range endpoints must be ints".to_string())?,
                    }
                }

                OpCode::GetIndex => self.get_index()?,
                OpCode::SetIndex => self.set_index()?,

                OpCode::Namespace => {
                    let name = self.read_name();
                    let nested = self.read_byte() == 1;
                    self.enter_namespace(&name, nested)?;
                }
                OpCode::NamespaceBind => {
                    let name = self.read_name();
                    self.namespace_bind(&name)?;
                }
                OpCode::Using => {
                    let value = self.pop();
                    let bindings = value.as_handle().and_then(|h| {
                        match &self.heap.get(h).data {
                            ObjData::Namespace(namespace) => Some(
                                namespace
                                    .bindings
                                    .iter()
                                    .map(|(k, v)| (k.clone(), *v))
                                    .collect::<Vec<_>>(),
                            ),
                            _ => None,
                        }
                    });
                    match bindings {
                        Some(bindings) => {
                            for (name, value) in bindings {
                                self.globals.insert(name, value);
                            }
                        }
                        None => self.fault("'using' expects a namespace".to_string())?,
                    }
                }

                OpCode::SetupTry => {
                    let filter = self.read_u16();
                    let handler_ip = self.read_u16();
                    let finally_ip = self.read_u16();
                    let stack_depth = self.stack.len();
                    if self.frames.last().unwrap().handlers.len() >= MAX_HANDLERS {
                        self.fault("too many nested try regions".to_string())?;
                    } else {
                        self.frames.last_mut().unwrap().handlers.push(Handler {
                            filter: (filter != NO_TARGET).then_some(filter),
                            handler_ip: (handler_ip != NO_TARGET).then_some(handler_ip as usize),
                            finally_ip: (finally_ip != NO_TARGET).then_some(finally_ip as usize),
                            stack_depth,
                        });
                    }
                }
                OpCode::PopTry => {
                    self.frames
                        .last_mut()
                        .unwrap()
                        .handlers
                        .pop()
                        .expect("unbalanced try region");
                }
                OpCode::Throw => {
                    let value = self.pop();
                    self.throw_value(value)?;
                }
                OpCode::EndFinally => {
                    let tag = self.pop();
                    let value = self.pop();
                    match tag {
                        Value::Int(TAG_NORMAL) => {}
                        Value::Int(TAG_THROW) => self.throw_value(value)?,
                        Value::Int(TAG_RETURN) => {
                            if let Some(result) = self.do_return(value)? {
                                return Ok(result);
                            }
                        }
                        _ => panic!("corrupt finally control tag"),
                    }
                }

                OpCode::Yield => {
                    let value = self.pop();
                    if let Some(result) = self.do_yield(value)? {
                        return Ok(result);
                    }
                }

                OpCode::Return => {
                    let value = self.pop();
                    if let Some(result) = self.do_return(value)? {
                        return Ok(result);
                    }
                }
                OpCode::ReturnNonLocal => {
                    let depth = self.read_byte() as usize;
                    let value = self.pop();
                    if let Some(result) = self.do_return_non_local(value, depth)? {
                        return Ok(result);
                    }
                }
            }
        }
    }

    // ---- closures and upvalues ---------------------------------------------

    fn current_upvalue(&self, index: usize) -> Handle {
        let closure = self.frames.last().unwrap().closure;
        match &self.heap.get(closure).data {
            ObjData::Closure(c) => c.upvalues[index],
            _ => unreachable!("frame closure is not a closure"),
        }
    }

    fn make_closure(&mut self) {
        let function_value = self.read_constant();
        let Value::Obj(function) = function_value else {
            panic!("closure operand is not a function")
        };
        let upvalue_count = match &self.heap.get(function).data {
            ObjData::Function(f) => f.upvalue_count,
            _ => panic!("closure operand is not a function"),
        };

        let mut upvalues = Vec::with_capacity(upvalue_count);
        for _ in 0..upvalue_count {
            let is_local = self.read_byte() == 1;
            let index = self.read_byte() as usize;
            if is_local {
                let base = self.frames.last().unwrap().base;
                upvalues.push(self.capture_upvalue(base + index));
            } else {
                upvalues.push(self.current_upvalue(index));
            }
        }
        let closure = self.alloc(None, ObjData::Closure(ObjClosure { function, upvalues }));
        self.push(Value::Obj(closure));
    }

    fn open_slot_of(&self, upvalue: Handle) -> usize {
        match &self.heap.get(upvalue).data {
            ObjData::Upvalue(u) => match u.state {
                UpvalueState::Open(slot) => slot,
                UpvalueState::Closed(_) => unreachable!("closed upvalue in open list"),
            },
            _ => unreachable!("open list entry is not an upvalue"),
        }
    }

    /// Finds or creates the single upvalue for a stack slot, keeping the
    /// open list ordered by descending slot.
    fn capture_upvalue(&mut self, slot: usize) -> Handle {
        let mut insert_at = self.open_upvalues.len();
        for i in 0..self.open_upvalues.len() {
            let open_slot = self.open_slot_of(self.open_upvalues[i]);
            if open_slot == slot {
                return self.open_upvalues[i];
            }
            if open_slot < slot {
                insert_at = i;
                break;
            }
        }
        let upvalue = self.alloc(
            None,
            ObjData::Upvalue(ObjUpvalue {
                state: UpvalueState::Open(slot),
            }),
        );
        self.open_upvalues.insert(insert_at, upvalue);
        upvalue
    }

    /// Closes every open upvalue at or above `from`, copying the live slot
    /// into the upvalue object.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(&handle) = self.open_upvalues.first() {
            let slot = self.open_slot_of(handle);
            if slot < from {
                break;
            }
            let value = self.stack[slot];
            match &mut self.heap.get_mut(handle).data {
                ObjData::Upvalue(u) => u.state = UpvalueState::Closed(value),
                _ => unreachable!(),
            }
            self.open_upvalues.remove(0);
        }
    }

    // ---- calls -------------------------------------------------------------

    /// Single dispatch point for calls: the callee sits below `argc`
    /// arguments on the stack.
    fn call_value(&mut self, argc: usize) -> Result<(), RuntimeError> {
        let callee = self.peek(argc);
        let Value::Obj(handle) = callee else {
            let kind = self.type_name(&callee);
            return self.fault(format!("cannot call a {}", kind));
        };
        enum Plan {
            Closure,
            Native,
            Class,
            Bound(Value, Value),
            Fail(&'static str),
        }
        let plan = match &self.heap.get(handle).data {
            ObjData::Closure(_) => Plan::Closure,
            ObjData::Native(_) => Plan::Native,
            ObjData::Class(_) => Plan::Class,
            ObjData::BoundMethod(bound) => Plan::Bound(bound.receiver, bound.method),
            other => Plan::Fail(other.kind_name()),
        };
        match plan {
            Plan::Closure => self.call_closure(handle, argc),
            Plan::Native => self.call_native(handle, argc, Value::Nil),
            Plan::Class => self.call_class(handle, argc),
            Plan::Bound(receiver, method) => {
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = receiver;
                self.call_method_value(method, argc)
            }
            Plan::Fail(kind) => self.fault(format!("cannot call a {}", kind)),
        }
    }

    /// Calls a closure or native whose receiver already occupies the callee
    /// slot.
    fn call_method_value(&mut self, method: Value, argc: usize) -> Result<(), RuntimeError> {
        let Value::Obj(handle) = method else {
            return self.fault("method is not callable".to_string());
        };
        enum Plan {
            Closure,
            Native,
            Fail(&'static str),
        }
        let plan = match &self.heap.get(handle).data {
            ObjData::Closure(_) => Plan::Closure,
            ObjData::Native(_) => Plan::Native,
            other => Plan::Fail(other.kind_name()),
        };
        match plan {
            Plan::Closure => self.call_closure(handle, argc),
            Plan::Native => {
                let receiver = self.peek(argc);
                self.call_native(handle, argc, receiver)
            }
            Plan::Fail(kind) => self.fault(format!("cannot call a {}", kind)),
        }
    }

    fn call_closure(&mut self, closure: Handle, argc: usize) -> Result<(), RuntimeError> {
        let function = match &self.heap.get(closure).data {
            ObjData::Closure(c) => c.function,
            _ => unreachable!(),
        };
        let (arity, is_variadic, is_generator, chunk) = match &self.heap.get(function).data {
            ObjData::Function(f) => {
                (f.arity as usize, f.is_variadic, f.is_generator, f.chunk.clone())
            }
            _ => unreachable!(),
        };

        let mut argc = argc;
        if is_variadic {
            // Pack every argument into the single array parameter.
            let start = self.stack.len() - argc;
            let elements = self.stack[start..].to_vec();
            let array = self.alloc(None, ObjData::Array(elements));
            self.stack.truncate(start);
            self.push(Value::Obj(array));
            argc = 1;
        } else if argc != arity {
            return self.fault(format!("expected {} arguments but got {}", arity, argc));
        }

        if is_generator {
            // Calling a generator function builds the generator object; the
            // body only runs when it is resumed.
            let base = self.stack.len() - argc - 1;
            let slots = self.stack[base..].to_vec();
            let generator = self.alloc(
                None,
                ObjData::Generator(ObjGenerator {
                    closure,
                    ip: 0,
                    slots,
                    handlers: Vec::new(),
                    state: GeneratorState::Suspended,
                }),
            );
            self.stack.truncate(base);
            self.push(Value::Obj(generator));
            return Ok(());
        }

        if self.frames.len() >= MAX_FRAMES {
            return self.fault("stack overflow".to_string());
        }
        let base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame::new(closure, chunk, base));
        Ok(())
    }

    fn call_native(
        &mut self,
        native: Handle,
        argc: usize,
        receiver: Value,
    ) -> Result<(), RuntimeError> {
        let (function, arity, name): (NativeFn, i8, String) = match &self.heap.get(native).data {
            ObjData::Native(n) => (n.function, n.arity, n.name.clone()),
            _ => unreachable!(),
        };
        if arity >= 0 && argc != arity as usize {
            return self.fault(format!(
                "{}() expected {} arguments but got {}",
                name, arity, argc
            ));
        }
        let start = self.stack.len() - argc;
        let args = self.stack[start..].to_vec();
        match function(self, receiver, &args) {
            Ok(result) => {
                // Splice the result over the callee and its arguments.
                self.stack.truncate(start - 1);
                self.push(result);
                Ok(())
            }
            Err(NativeError::Message(message)) => self.fault(message),
            Err(NativeError::Thrown(value)) => {
                self.stack.truncate(start - 1);
                self.throw_value(value)
            }
        }
    }

    fn call_class(&mut self, class: Handle, argc: usize) -> Result<(), RuntimeError> {
        let (kind, init, defaults) = match &self.heap.get(class).data {
            ObjData::Class(c) => (
                c.kind,
                c.methods.get("init").copied(),
                c.field_defaults.clone(),
            ),
            _ => unreachable!(),
        };

        let instance = match kind {
            ClassKind::Plain => self.alloc(
                Some(class),
                ObjData::Instance(ObjInstance { fields: defaults }),
            ),
            ClassKind::Exception => self.alloc(
                Some(class),
                ObjData::Exception(ObjException {
                    message: String::new(),
                    trace: Vec::new(),
                    fields: defaults,
                }),
            ),
            ClassKind::Promise => self.alloc(Some(class), ObjData::Promise(ObjPromise::default())),
        };

        let slot = self.stack.len() - argc - 1;
        self.stack[slot] = Value::Obj(instance);

        match init {
            Some(init) => self.call_method_value(init, argc),
            None if argc != 0 => self.fault(format!("expected 0 arguments but got {}", argc)),
            None => Ok(()),
        }
    }

    // ---- invoke and properties ---------------------------------------------

    /// Fused property-get + call: avoids materializing a bound method on the
    /// hot path.
    fn invoke(&mut self, name: &str, argc: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc);
        let Value::Obj(handle) = receiver else {
            let kind = self.type_name(&receiver);
            return self.fault(format!("cannot invoke '{}' on a {}", name, kind));
        };

        enum Plan {
            ClassPath {
                field: Option<Value>,
                class: Option<Handle>,
            },
            ResumeGenerator,
            NamespaceCall(Option<Value>, String),
            Fail(String),
        }
        let plan = {
            let obj = self.heap.get(handle);
            match &obj.data {
                ObjData::Instance(instance) => Plan::ClassPath {
                    field: instance.fields.get(name).copied(),
                    class: obj.class,
                },
                ObjData::Exception(exception) => Plan::ClassPath {
                    field: exception.fields.get(name).copied(),
                    class: obj.class,
                },
                ObjData::Promise(_) => Plan::ClassPath {
                    field: None,
                    class: obj.class,
                },
                ObjData::Generator(_) => {
                    if name == "next" {
                        Plan::ResumeGenerator
                    } else {
                        Plan::Fail(format!("generator has no method '{}'", name))
                    }
                }
                ObjData::Namespace(namespace) => Plan::NamespaceCall(
                    namespace.bindings.get(name).copied(),
                    namespace.name.clone(),
                ),
                other => Plan::Fail(format!("cannot invoke '{}' on a {}", name, other.kind_name())),
            }
        };

        match plan {
            Plan::ClassPath { field, class } => {
                self.invoke_on_class(receiver, class, field, name, argc)
            }
            Plan::ResumeGenerator => self.resume_generator(handle, argc),
            Plan::NamespaceCall(Some(value), _) => {
                let slot = self.stack.len() - argc - 1;
                self.stack[slot] = value;
                self.call_value(argc)
            }
            Plan::NamespaceCall(None, namespace) => {
                self.fault(format!("'{}' is not defined in namespace {}", name, namespace))
            }
            Plan::Fail(message) => self.fault(message),
        }
    }

    /// Looks up `name` in a class's method, getter, and setter tables.
    fn class_tables(
        &self,
        class: Option<Handle>,
        name: &str,
    ) -> (Option<Value>, Option<Value>, Option<Value>) {
        match class {
            Some(class) => match &self.heap.get(class).data {
                ObjData::Class(c) => (
                    c.methods.get(name).copied(),
                    c.getters.get(name).copied(),
                    c.setters.get(name).copied(),
                ),
                _ => (None, None, None),
            },
            None => (None, None, None),
        }
    }

    fn interceptor(&self, class: Option<Handle>, kind: InterceptorKind) -> Option<Value> {
        let class = class?;
        match &self.heap.get(class).data {
            ObjData::Class(c) => c.interceptors.get(kind),
            _ => None,
        }
    }

    fn invoke_on_class(
        &mut self,
        receiver: Value,
        class: Option<Handle>,
        field: Option<Value>,
        name: &str,
        argc: usize,
    ) -> Result<(), RuntimeError> {
        // A field holding a callable shadows methods.
        if let Some(value) = field {
            let slot = self.stack.len() - argc - 1;
            self.stack[slot] = value;
            return self.call_value(argc);
        }

        let (method, _, _) = self.class_tables(class, name);
        let will = self.interceptor(class, InterceptorKind::WillInvoke);
        let did = self.interceptor(class, InterceptorKind::DidInvoke);

        if let Some(method) = method {
            if will.is_some() || did.is_some() {
                return self.invoke_intercepted(receiver, method, will, did, name, argc);
            }
            return self.call_method_value(method, argc);
        }

        if let Some(hook) = self.interceptor(class, InterceptorKind::UndefinedMethod) {
            // Pack the arguments so the hook sees the full call.
            let start = self.stack.len() - argc;
            let elements = self.stack[start..].to_vec();
            let args_array = self.alloc(None, ObjData::Array(elements));
            self.stack.truncate(start - 1);
            let name_value = self.intern(name);
            match self.call_with_receiver(hook, receiver, &[name_value, Value::Obj(args_array)]) {
                Ok(result) => {
                    self.push(result);
                    Ok(())
                }
                Err(error) => self.rethrow(error),
            }
        } else {
            self.fault(format!("undefined method '{}'", name))
        }
    }

    /// Runs a method reentrantly so the will/did invoke hooks can wrap it.
    fn invoke_intercepted(
        &mut self,
        receiver: Value,
        method: Value,
        will: Option<Value>,
        did: Option<Value>,
        name: &str,
        argc: usize,
    ) -> Result<(), RuntimeError> {
        let name_value = self.intern(name);
        if let Some(hook) = will {
            if let Err(error) = self.call_with_receiver(hook, receiver, &[name_value]) {
                return self.rethrow(error);
            }
        }
        let start = self.stack.len() - argc;
        let args = self.stack[start..].to_vec();
        self.stack.truncate(start - 1);
        let result = match self.call_with_receiver(method, receiver, &args) {
            Ok(result) => result,
            Err(error) => return self.rethrow(error),
        };
        if let Some(hook) = did {
            self.push(result); // keep rooted across the hook call
            if let Err(error) = self.call_with_receiver(hook, receiver, &[name_value, result]) {
                self.pop();
                return self.rethrow(error);
            }
            self.pop();
        }
        self.push(result);
        Ok(())
    }

    fn super_invoke(
        &mut self,
        superclass: Value,
        name: &str,
        argc: usize,
    ) -> Result<(), RuntimeError> {
        let method = superclass.as_handle().and_then(|h| {
            match &self.heap.get(h).data {
                ObjData::Class(c) => Some(c.methods.get(name).copied()),
                _ => None,
            }
        });
        match method {
            Some(Some(method)) => self.call_method_value(method, argc),
            Some(None) => self.fault(format!("undefined superclass method '{}'", name)),
            None => self.fault("'super' is not a class".to_string()),
        }
    }

    /// Property read fallthrough: fields, then methods, then getters, then
    /// the undefined-property interceptor, then a fault.
    fn get_property(&mut self, name: &str) -> Result<(), RuntimeError> {
        let receiver = self.peek(0);
        let Value::Obj(handle) = receiver else {
            let kind = self.type_name(&receiver);
            return self.fault(format!("cannot read property '{}' of a {}", name, kind));
        };

        enum Plan {
            Immediate(Value),
            Text(String),
            TraceLines(Vec<String>),
            ClassPath {
                field: Option<Value>,
                class: Option<Handle>,
            },
            Fail(String),
        }
        let plan = {
            let obj = self.heap.get(handle);
            match &obj.data {
                ObjData::Instance(instance) => Plan::ClassPath {
                    field: instance.fields.get(name).copied(),
                    class: obj.class,
                },
                ObjData::Exception(exception) => match name {
                    "message" => Plan::Text(exception.message.clone()),
                    "trace" => Plan::TraceLines(exception.trace.clone()),
                    _ => Plan::ClassPath {
                        field: exception.fields.get(name).copied(),
                        class: obj.class,
                    },
                },
                ObjData::Array(elements) => match name {
                    "length" => Plan::Immediate(Value::Int(elements.len() as i64)),
                    _ => Plan::Fail(format!("array has no property '{}'", name)),
                },
                ObjData::Dict(entries) => match name {
                    "length" => Plan::Immediate(Value::Int(entries.len() as i64)),
                    _ => Plan::Fail(format!("dictionary has no property '{}'", name)),
                },
                ObjData::Str(text) => match name {
                    "length" => Plan::Immediate(Value::Int(text.chars().count() as i64)),
                    _ => Plan::Fail(format!("string has no property '{}'", name)),
                },
                ObjData::Range(range) => match name {
                    "start" => Plan::Immediate(Value::Int(range.start)),
                    "end" => Plan::Immediate(Value::Int(range.end)),
                    "length" => Plan::Immediate(Value::Int(range.len())),
                    _ => Plan::Fail(format!("range has no property '{}'", name)),
                },
                ObjData::Generator(generator) => match name {
                    "done" => Plan::Immediate(Value::Bool(
                        generator.state == GeneratorState::Done,
                    )),
                    _ => Plan::Fail(format!("generator has no property '{}'", name)),
                },
                ObjData::Class(class) => match name {
                    "name" => Plan::Text(class.name.clone()),
                    _ => Plan::Fail(format!("class has no property '{}'", name)),
                },
                ObjData::Promise(_) => Plan::ClassPath {
                    field: None,
                    class: obj.class,
                },
                ObjData::Namespace(namespace) => match namespace.bindings.get(name).copied() {
                    Some(value) => Plan::Immediate(value),
                    None => Plan::Fail(format!(
                        "'{}' is not defined in namespace {}",
                        name, namespace.name
                    )),
                },
                other => Plan::Fail(format!(
                    "cannot read property '{}' of a {}",
                    name,
                    other.kind_name()
                )),
            }
        };

        match plan {
            Plan::Immediate(value) => {
                self.pop();
                self.push(value);
                Ok(())
            }
            Plan::Text(text) => {
                let value = self.intern(&text);
                self.pop();
                self.push(value);
                Ok(())
            }
            Plan::TraceLines(lines) => {
                let mut elements = Vec::with_capacity(lines.len());
                for line in &lines {
                    elements.push(Value::Obj(self.heap.intern(line)));
                }
                // Direct allocation: the freshly interned lines are not yet
                // reachable from any root, so the trigger must not run here.
                let array = self.heap.allocate(None, ObjData::Array(elements));
                self.pop();
                self.push(Value::Obj(array));
                Ok(())
            }
            Plan::ClassPath { field, class } => {
                self.get_property_on_class(receiver, class, field, name)
            }
            Plan::Fail(message) => self.fault(message),
        }
    }

    fn get_property_on_class(
        &mut self,
        receiver: Value,
        class: Option<Handle>,
        field: Option<Value>,
        name: &str,
    ) -> Result<(), RuntimeError> {
        let (method, getter, _) = self.class_tables(class, name);
        let will = self.interceptor(class, InterceptorKind::WillGetProperty);
        let did = self.interceptor(class, InterceptorKind::DidGetProperty);

        let name_value = self.intern(name);
        if let Some(hook) = will {
            if let Err(error) = self.call_with_receiver(hook, receiver, &[name_value]) {
                return self.rethrow(error);
            }
        }

        if let Some(value) = field {
            self.pop();
            self.push(value);
            return self.did_get(did, receiver, name_value, value);
        }

        if let Some(method) = method {
            // The receiver stays on the stack, rooting it across the
            // allocation.
            let bound = self.alloc(
                None,
                ObjData::BoundMethod(ObjBoundMethod { receiver, method }),
            );
            self.pop();
            self.push(Value::Obj(bound));
            return self.did_get(did, receiver, name_value, Value::Obj(bound));
        }

        if let Some(getter) = getter {
            if did.is_some() {
                self.pop();
                let result = match self.call_with_receiver(getter, receiver, &[]) {
                    Ok(result) => result,
                    Err(error) => return self.rethrow(error),
                };
                self.push(result);
                return self.did_get(did, receiver, name_value, result);
            }
            // In-place call: the receiver slot becomes the getter frame's
            // base, so the result replaces it.
            return self.call_method_value(getter, 0);
        }

        if let Some(hook) = self.interceptor(class, InterceptorKind::UndefinedProperty) {
            self.pop();
            match self.call_with_receiver(hook, receiver, &[name_value]) {
                Ok(result) => {
                    self.push(result);
                    self.did_get(did, receiver, name_value, result)
                }
                Err(error) => self.rethrow(error),
            }
        } else {
            self.fault(format!("undefined property '{}'", name))
        }
    }

    fn did_get(
        &mut self,
        hook: Option<Value>,
        receiver: Value,
        name: Value,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let Some(hook) = hook else { return Ok(()) };
        match self.call_with_receiver(hook, receiver, &[name, value]) {
            Ok(_) => Ok(()),
            Err(error) => self.rethrow(error),
        }
    }

    /// Property write: willSet hook, then setters, then the field table.
    fn set_property(&mut self, name: &str) -> Result<(), RuntimeError> {
        let value = self.peek(0);
        let receiver = self.peek(1);
        let Value::Obj(handle) = receiver else {
            let kind = self.type_name(&receiver);
            return self.fault(format!("cannot set property '{}' on a {}", name, kind));
        };

        let class = self.heap.get(handle).class;
        let (_, _, setter) = self.class_tables(class, name);
        let will = self.interceptor(class, InterceptorKind::WillSetProperty);
        let did = self.interceptor(class, InterceptorKind::DidSetProperty);

        let name_value = self.intern(name);
        if let Some(hook) = will {
            if let Err(error) = self.call_with_receiver(hook, receiver, &[name_value, value]) {
                return self.rethrow(error);
            }
        }

        if let Some(setter) = setter {
            // Stack is [receiver, value]: exactly a one-argument method call.
            return self.call_method_value(setter, 1);
        }

        let message_text = self.format_value(&value);
        let stored = match &mut self.heap.get_mut(handle).data {
            ObjData::Instance(instance) => {
                instance.fields.insert(name.to_string(), value);
                true
            }
            ObjData::Exception(exception) => {
                if name == "message" {
                    exception.message = message_text;
                } else {
                    exception.fields.insert(name.to_string(), value);
                }
                true
            }
            _ => false,
        };
        if !stored {
            return self.fault(format!("cannot set property '{}' on this value", name));
        }

        // `a.b = v` evaluates to v.
        self.pop();
        self.pop();
        self.push(value);

        if let Some(hook) = did {
            if let Err(error) = self.call_with_receiver(hook, receiver, &[name_value, value]) {
                return self.rethrow(error);
            }
        }
        Ok(())
    }

    fn get_super(&mut self, name: &str) -> Result<(), RuntimeError> {
        let superclass = self.peek(0);
        let receiver = self.peek(1);
        let method = superclass.as_handle().and_then(|h| {
            match &self.heap.get(h).data {
                ObjData::Class(c) => Some(c.methods.get(name).copied()),
                _ => None,
            }
        });
        match method {
            Some(Some(method)) => {
                let bound = self.alloc(
                    None,
                    ObjData::BoundMethod(ObjBoundMethod { receiver, method }),
                );
                self.pop();
                self.pop();
                self.push(Value::Obj(bound));
                Ok(())
            }
            Some(None) => self.fault(format!("undefined superclass method '{}'", name)),
            None => self.fault("'super' is not a class".to_string()),
        }
    }

    // ---- classes -----------------------------------------------------------

    fn inherit(&mut self) -> Result<(), RuntimeError> {
        let subclass = self.peek(0);
        let superclass = self.peek(1);
        let (Some(sub), Some(sup)) = (subclass.as_handle(), superclass.as_handle()) else {
            return self.fault("superclass must be a class".to_string());
        };
        if !matches!(self.heap.get(sup).data, ObjData::Class(_))
            || !matches!(self.heap.get(sub).data, ObjData::Class(_))
        {
            return self.fault("superclass must be a class".to_string());
        }
        let copied = match &self.heap.get(sup).data {
            ObjData::Class(c) => (
                c.methods.clone(),
                c.getters.clone(),
                c.setters.clone(),
                c.field_defaults.clone(),
                c.interceptors.clone(),
                c.kind,
            ),
            _ => unreachable!(),
        };
        match &mut self.heap.get_mut(sub).data {
            ObjData::Class(c) => {
                // Snapshot semantics: later superclass mutation is not
                // observed by this subclass.
                c.methods = copied.0;
                c.getters = copied.1;
                c.setters = copied.2;
                c.field_defaults = copied.3;
                c.interceptors = copied.4;
                c.kind = copied.5;
                c.superclass = Some(sup);
            }
            _ => unreachable!(),
        }
        self.pop(); // the subclass; the superclass stays as the `super` local
        Ok(())
    }

    fn bind_member(&mut self, name: &str, kind: MemberKind) -> Result<(), RuntimeError> {
        let value = self.peek(0);
        let class_value = self.peek(1);
        let class = class_value.as_handle();
        if !class.is_some_and(|h| matches!(self.heap.get(h).data, ObjData::Class(_))) {
            return self.fault("class member outside of a class".to_string());
        }
        match &mut self.heap.get_mut(class.unwrap()).data {
            ObjData::Class(c) => match kind {
                MemberKind::Method => {
                    c.methods.insert(name.to_string(), value);
                    if let Some(hook) = InterceptorKind::from_method_name(name) {
                        c.interceptors.set(hook, value);
                    }
                }
                MemberKind::Getter => {
                    c.getters.insert(name.to_string(), value);
                }
                MemberKind::Setter => {
                    c.setters.insert(name.to_string(), value);
                }
                MemberKind::FieldDefault => {
                    c.field_defaults.insert(name.to_string(), value);
                }
            },
            _ => unreachable!(),
        }
        self.pop();
        Ok(())
    }

    // ---- namespaces --------------------------------------------------------

    fn enter_namespace(&mut self, name: &str, nested: bool) -> Result<(), RuntimeError> {
        if nested {
            let parent_value = self.peek(0);
            let Some(parent) = parent_value.as_handle() else {
                return self.fault("nested namespace outside of a namespace".to_string());
            };
            let existing = match &self.heap.get(parent).data {
                ObjData::Namespace(ns) => Some(ns.bindings.get(name).copied()),
                _ => None,
            };
            let Some(existing) = existing else {
                return self.fault("nested namespace outside of a namespace".to_string());
            };
            let child = match existing {
                Some(Value::Obj(h))
                    if matches!(self.heap.get(h).data, ObjData::Namespace(_)) =>
                {
                    h
                }
                Some(_) => {
                    return self
                        .fault(format!("'{}' is already defined and not a namespace", name));
                }
                None => {
                    // The parent is still on the stack, rooting it across
                    // this allocation.
                    let child = self.alloc(
                        None,
                        ObjData::Namespace(ObjNamespace::new(name.to_string(), Some(parent))),
                    );
                    match &mut self.heap.get_mut(parent).data {
                        ObjData::Namespace(ns) => {
                            ns.bindings.insert(name.to_string(), Value::Obj(child));
                        }
                        _ => unreachable!(),
                    }
                    child
                }
            };
            self.pop();
            self.push(Value::Obj(child));
        } else {
            let existing = self
                .globals
                .get(name)
                .or_else(|| self.constants.get(name))
                .copied();
            let namespace = match existing {
                Some(Value::Obj(h))
                    if matches!(self.heap.get(h).data, ObjData::Namespace(_)) =>
                {
                    h
                }
                Some(_) => {
                    return self
                        .fault(format!("'{}' is already defined and not a namespace", name));
                }
                None => {
                    let namespace = self.alloc(
                        None,
                        ObjData::Namespace(ObjNamespace::new(name.to_string(), None)),
                    );
                    self.globals
                        .insert(name.to_string(), Value::Obj(namespace));
                    namespace
                }
            };
            self.push(Value::Obj(namespace));
        }
        Ok(())
    }

    fn namespace_bind(&mut self, name: &str) -> Result<(), RuntimeError> {
        let value = self.peek(0);
        let ns_value = self.peek(1);
        let namespace = ns_value.as_handle();
        if !namespace.is_some_and(|h| matches!(self.heap.get(h).data, ObjData::Namespace(_))) {
            return self.fault("namespace binding outside of a namespace".to_string());
        }
        let namespace = namespace.unwrap();
        match &mut self.heap.get_mut(namespace).data {
            ObjData::Namespace(ns) => {
                ns.bindings.insert(name.to_string(), value);
            }
            _ => unreachable!(),
        }
        // Record the defining namespace on classes bound into it.
        if let Some(handle) = value.as_handle() {
            if matches!(self.heap.get(handle).data, ObjData::Class(_)) {
                match &mut self.heap.get_mut(handle).data {
                    ObjData::Class(c) => {
                        if c.namespace.is_none() {
                            c.namespace = Some(namespace);
                        }
                    }
                    _ => unreachable!(),
                }
            }
        }
        self.pop();
        self.pop();
        Ok(())
    }

    // ---- operators ---------------------------------------------------------

    fn equality(&mut self, negate: bool) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);

        // A class can override `==` with an `equals` method.
        if !negate {
            if let (Value::Obj(ha), Value::Obj(_)) = (a, b) {
                let is_instance = matches!(self.heap.get(ha).data, ObjData::Instance(_));
                if is_instance {
                    let class = self.heap.get(ha).class;
                    let equals = class.and_then(|class| match &self.heap.get(class).data {
                        ObjData::Class(c) => c.methods.get("equals").copied(),
                        _ => None,
                    });
                    if let Some(equals) = equals {
                        // The stack already holds [receiver, argument].
                        return self.call_method_value(equals, 1);
                    }
                }
            }
        }

        let b = self.pop();
        let a = self.pop();
        let equal = a == b;
        self.push(Value::Bool(if negate { !equal } else { equal }));
        Ok(())
    }

    fn comparison(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        let (Some(x), Some(y)) = (a.as_number(), b.as_number()) else {
            let (ka, kb) = (self.type_name(&a), self.type_name(&b));
            return self.fault(format!("cannot compare {} and {}", ka, kb));
        };
        let result = match op {
            OpCode::Less => x < y,
            OpCode::LessEqual => x <= y,
            OpCode::Greater => x > y,
            OpCode::GreaterEqual => x >= y,
            _ => unreachable!(),
        };
        self.push(Value::Bool(result));
        Ok(())
    }

    fn add(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);

        // `+` concatenates when both operands are strings.
        if let (Value::Obj(ha), Value::Obj(hb)) = (a, b) {
            let joined = match (&self.heap.get(ha).data, &self.heap.get(hb).data) {
                (ObjData::Str(sa), ObjData::Str(sb)) => Some(format!("{}{}", sa, sb)),
                _ => None,
            };
            if let Some(joined) = joined {
                let handle = self.heap.intern(&joined);
                self.pop();
                self.pop();
                self.push(Value::Obj(handle));
                return Ok(());
            }
        }

        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => match x.checked_add(y) {
                Some(sum) => self.push(Value::Int(sum)),
                None => return self.fault("integer overflow".to_string()),
            },
            (Value::Float(x), Value::Float(y)) => self.push(Value::Float(x + y)),
            (Value::Int(x), Value::Float(y)) => self.push(Value::Float(x as f64 + y)),
            (Value::Float(x), Value::Int(y)) => self.push(Value::Float(x + y as f64)),
            (a, b) => {
                let (ka, kb) = (self.type_name(&a), self.type_name(&b));
                return self.fault(format!("cannot add {} and {}", ka, kb));
            }
        }
        Ok(())
    }

    fn arithmetic(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => {
                let result = match op {
                    OpCode::Subtract => x.checked_sub(y),
                    OpCode::Multiply => x.checked_mul(y),
                    OpCode::Divide => {
                        if y == 0 {
                            return self.fault("division by zero".to_string());
                        }
                        x.checked_div(y)
                    }
                    OpCode::Modulo => {
                        if y == 0 {
                            return self.fault("division by zero".to_string());
                        }
                        x.checked_rem(y)
                    }
                    _ => unreachable!(),
                };
                match result {
                    Some(value) => self.push(Value::Int(value)),
                    None => return self.fault("integer overflow".to_string()),
                }
            }
            (a, b) => {
                let (Some(x), Some(y)) = (a.as_number(), b.as_number()) else {
                    let (ka, kb) = (self.type_name(&a), self.type_name(&b));
                    return self.fault(format!("operands must be numbers, not {} and {}", ka, kb));
                };
                let value = match op {
                    OpCode::Subtract => x - y,
                    OpCode::Multiply => x * y,
                    OpCode::Divide => x / y,
                    OpCode::Modulo => x % y,
                    _ => unreachable!(),
                };
                self.push(Value::Float(value));
            }
        }
        Ok(())
    }

    fn bitwise(&mut self, op: OpCode) -> Result<(), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        let (Value::Int(x), Value::Int(y)) = (a, b) else {
            let (ka, kb) = (self.type_name(&a), self.type_name(&b));
            return self.fault(format!("bitwise operands must be ints, not {} and {}", ka, kb));
        };
        let result = match op {
            OpCode::BitAnd => x & y,
            OpCode::BitOr => x | y,
            OpCode::BitXor => x ^ y,
            OpCode::ShiftLeft | OpCode::ShiftRight => {
                if !(0..64).contains(&y) {
                    return self.fault("shift amount out of range".to_string());
                }
                if op == OpCode::ShiftLeft {
                    x << y
                } else {
                    x >> y
                }
            }
            _ => unreachable!(),
        };
        self.push(Value::Int(result));
        Ok(())
    }

    // ---- literals and subscripts -------------------------------------------

    fn make_dict(&mut self) -> Result<(), RuntimeError> {
        let count = self.read_u16() as usize;
        let start = self.stack.len() - count * 2;
        let mut entries = FxHashMap::default();
        for i in 0..count {
            let key = self.stack[start + i * 2];
            let value = self.stack[start + i * 2 + 1];
            let Some(ObjData::Str(text)) = key.as_handle().map(|h| &self.heap.get(h).data)
            else {
                return self.fault("dictionary keys must be strings".to_string());
            };
            entries.insert(text.clone(), value);
        }
        let dict = self.alloc(None, ObjData::Dict(entries));
        self.stack.truncate(start);
        self.push(Value::Obj(dict));
        Ok(())
    }

    fn get_index(&mut self) -> Result<(), RuntimeError> {
        let index = self.peek(0);
        let receiver = self.peek(1);
        let Some(handle) = receiver.as_handle() else {
            let kind = self.type_name(&receiver);
            return self.fault(format!("a {} is not subscriptable", kind));
        };

        enum Plan {
            Value(Value),
            Char(char),
            Fail(String),
        }
        let plan = match &self.heap.get(handle).data {
            ObjData::Array(elements) => match index {
                Value::Int(i) if i >= 0 && (i as usize) < elements.len() => {
                    Plan::Value(elements[i as usize])
                }
                Value::Int(i) => Plan::Fail(format!("array index {} out of range", i)),
                _ => Plan::Fail("array index must be an int".to_string()),
            },
            ObjData::Dict(entries) => match index.as_handle().map(|h| &self.heap.get(h).data) {
                Some(ObjData::Str(key)) => {
                    Plan::Value(entries.get(key.as_str()).copied().unwrap_or(Value::Nil))
                }
                _ => Plan::Fail("dictionary key must be a string".to_string()),
            },
            ObjData::Str(text) => match index {
                Value::Int(i) if i >= 0 => match text.chars().nth(i as usize) {
                    Some(ch) => Plan::Char(ch),
                    None => Plan::Fail(format!("string index {} out of range", i)),
                },
                Value::Int(i) => Plan::Fail(format!("string index {} out of range", i)),
                _ => Plan::Fail("string index must be an int".to_string()),
            },
            ObjData::Range(range) => match index {
                Value::Int(i) if i >= 0 && i < range.len() => Plan::Value(Value::Int(range.start + i)),
                Value::Int(i) => Plan::Fail(format!("range index {} out of range", i)),
                _ => Plan::Fail("range index must be an int".to_string()),
            },
            other => Plan::Fail(format!("a {} is not subscriptable", other.kind_name())),
        };

        match plan {
            Plan::Value(value) => {
                self.pop();
                self.pop();
                self.push(value);
                Ok(())
            }
            Plan::Char(ch) => {
                let value = self.intern(&ch.to_string());
                self.pop();
                self.pop();
                self.push(value);
                Ok(())
            }
            Plan::Fail(message) => self.fault(message),
        }
    }

    fn set_index(&mut self) -> Result<(), RuntimeError> {
        let value = self.peek(0);
        let index = self.peek(1);
        let receiver = self.peek(2);
        let Some(handle) = receiver.as_handle() else {
            let kind = self.type_name(&receiver);
            return self.fault(format!("a {} is not subscriptable", kind));
        };

        enum Plan {
            Array(usize),
            Dict(String),
            Fail(String),
        }
        let plan = match &self.heap.get(handle).data {
            ObjData::Array(elements) => match index {
                Value::Int(i) if i >= 0 && (i as usize) < elements.len() => {
                    Plan::Array(i as usize)
                }
                Value::Int(i) => Plan::Fail(format!("array index {} out of range", i)),
                _ => Plan::Fail("array index must be an int".to_string()),
            },
            ObjData::Dict(_) => match index.as_handle().map(|h| &self.heap.get(h).data) {
                Some(ObjData::Str(key)) => Plan::Dict(key.clone()),
                _ => Plan::Fail("dictionary key must be a string".to_string()),
            },
            other => Plan::Fail(format!("cannot assign into a {}", other.kind_name())),
        };

        match plan {
            Plan::Array(i) => {
                match &mut self.heap.get_mut(handle).data {
                    ObjData::Array(elements) => elements[i] = value,
                    _ => unreachable!(),
                }
                self.pop();
                self.pop();
                self.pop();
                self.push(value);
                Ok(())
            }
            Plan::Dict(key) => {
                match &mut self.heap.get_mut(handle).data {
                    ObjData::Dict(entries) => {
                        entries.insert(key, value);
                    }
                    _ => unreachable!(),
                }
                self.pop();
                self.pop();
                self.pop();
                self.push(value);
                Ok(())
            }
            Plan::Fail(message) => self.fault(message),
        }
    }

    // ---- generators --------------------------------------------------------

    /// Resumes a suspended generator: its saved slots are copied back onto
    /// the stack and the dispatch loop restarts at the saved offset.
    fn resume_generator(&mut self, handle: Handle, argc: usize) -> Result<(), RuntimeError> {
        if argc != 0 {
            return self.fault("next() expected 0 arguments".to_string());
        }
        if self.frames.len() >= MAX_FRAMES {
            return self.fault("stack overflow".to_string());
        }

        let state = match &self.heap.get(handle).data {
            ObjData::Generator(generator) => generator.state,
            _ => unreachable!(),
        };
        match state {
            GeneratorState::Done => {
                let top = self.stack.len() - 1;
                self.stack[top] = Value::Nil;
                return Ok(());
            }
            GeneratorState::Running => {
                return self.fault("generator is already running".to_string());
            }
            GeneratorState::Suspended => {}
        }

        let (closure, ip, slots, handlers) = match &mut self.heap.get_mut(handle).data {
            ObjData::Generator(generator) => {
                generator.state = GeneratorState::Running;
                (
                    generator.closure,
                    generator.ip,
                    std::mem::take(&mut generator.slots),
                    std::mem::take(&mut generator.handlers),
                )
            }
            _ => unreachable!(),
        };

        let chunk = {
            let function = match &self.heap.get(closure).data {
                ObjData::Closure(c) => c.function,
                _ => unreachable!(),
            };
            match &self.heap.get(function).data {
                ObjData::Function(f) => f.chunk.clone(),
                _ => unreachable!(),
            }
        };

        let base = self.stack.len();
        self.stack.extend(slots);
        let mut frame = CallFrame::new(closure, chunk, base);
        frame.ip = ip;
        frame.handlers = handlers;
        frame.generator = Some(handle);
        self.frames.push(frame);
        Ok(())
    }

    /// Suspends the current generator frame, leaving the yielded value for
    /// the resumer.
    fn do_yield(&mut self, value: Value) -> Result<Option<Value>, RuntimeError> {
        let frame = self.frames.pop().expect("yield outside of a frame");
        let Some(handle) = frame.generator else {
            self.frames.push(frame);
            self.fault("'yield' outside of a generator".to_string())?;
            return Ok(None);
        };

        self.close_upvalues(frame.base);
        let slots = self.stack[frame.base..].to_vec();
        self.stack.truncate(frame.base);
        // The receiver (the generator) sits just below the frame window.
        self.pop();
        self.push(value);

        match &mut self.heap.get_mut(handle).data {
            ObjData::Generator(generator) => {
                generator.ip = frame.ip;
                generator.slots = slots;
                generator.handlers = frame.handlers;
                generator.state = GeneratorState::Suspended;
            }
            _ => unreachable!(),
        }

        if self.frames.len() == self.frame_floor {
            return Ok(Some(value));
        }
        Ok(None)
    }

    // ---- returns and unwinding ---------------------------------------------

    /// Completes a return: pending `finally` blocks run first, then the
    /// frame pops, its open upvalues close, and the result replaces the
    /// callee. Returns the result when the frame floor is reached.
    fn do_return(&mut self, value: Value) -> Result<Option<Value>, RuntimeError> {
        // A return leaving armed try regions runs their finallys first.
        loop {
            let Some(handler) = self.frames.last_mut().unwrap().handlers.pop() else {
                break;
            };
            if let Some(finally_ip) = handler.finally_ip {
                self.stack.truncate(handler.stack_depth);
                self.push(value);
                self.push(Value::Int(TAG_RETURN));
                self.frames.last_mut().unwrap().ip = finally_ip;
                return Ok(None);
            }
        }

        let frame = self.frames.pop().unwrap();
        self.close_upvalues(frame.base);

        if let Some(generator) = frame.generator {
            self.stack.truncate(frame.base);
            self.pop(); // the generator receiver
            self.push(value);
            match &mut self.heap.get_mut(generator).data {
                ObjData::Generator(g) => {
                    g.state = GeneratorState::Done;
                    g.slots = Vec::new();
                    g.handlers = Vec::new();
                }
                _ => unreachable!(),
            }
        } else {
            self.stack.truncate(frame.base);
            self.push(value);
        }

        if self.frames.len() == self.frame_floor {
            return Ok(Some(value));
        }
        Ok(None)
    }

    /// Non-local return: unwinds `depth` extra frames before completing.
    /// Pending finallys of the popped frames do not run.
    fn do_return_non_local(
        &mut self,
        value: Value,
        depth: usize,
    ) -> Result<Option<Value>, RuntimeError> {
        for _ in 0..depth {
            if self.frames.len() <= self.frame_floor + 1 {
                break;
            }
            let frame = self.frames.pop().unwrap();
            self.close_upvalues(frame.base);
            self.stack.truncate(frame.base);
        }
        self.do_return(value)
    }

    // ---- exceptions --------------------------------------------------------

    /// Builds a catchable exception for a runtime fault and starts
    /// unwinding. All operator/type/arity faults funnel through here.
    fn fault(&mut self, message: String) -> Result<(), RuntimeError> {
        let exception = self.make_exception(&message);
        self.throw_value(Value::Obj(exception))
    }

    fn make_exception(&mut self, message: &str) -> Handle {
        let trace = self.capture_trace();
        self.alloc(
            Some(self.exception_class),
            ObjData::Exception(ObjException {
                message: message.to_string(),
                trace,
                fields: FxHashMap::default(),
            }),
        )
    }

    /// Formats the live frame stack, innermost first.
    fn capture_trace(&self) -> Vec<String> {
        self.frames
            .iter()
            .rev()
            .map(|frame| {
                let name = match &self.heap.get(frame.closure).data {
                    ObjData::Closure(closure) => match &self.heap.get(closure.function).data {
                        ObjData::Function(f) => f.trace_name().to_string(),
                        _ => "script".to_string(),
                    },
                    _ => "script".to_string(),
                };
                let line = frame.chunk.line_at(frame.ip.saturating_sub(1));
                format!("in {}() at line {}", name, line)
            })
            .collect()
    }

    /// Throws a value: wraps non-exception values, records the trace, runs
    /// the willThrow hook, and walks frames innermost-out scanning each
    /// handler stack newest-first.
    fn throw_value(&mut self, thrown: Value) -> Result<(), RuntimeError> {
        let exception = self.ensure_exception(thrown);

        let will = self.interceptor(
            self.heap.get(exception).class,
            InterceptorKind::WillThrow,
        );
        if let Some(hook) = will {
            // The exception is not yet on the stack; keep it rooted while
            // the hook runs.
            self.heap.push_root(Value::Obj(exception));
            let outcome = self.call_with_receiver(hook, Value::Obj(exception), &[]);
            self.heap.pop_root();
            outcome?;
        }

        loop {
            if self.frames.len() == self.frame_floor {
                return Err(self.uncaught(exception));
            }

            while let Some(handler) = self.frames.last_mut().unwrap().handlers.pop() {
                let matches = match handler.filter {
                    None => true,
                    Some(filter) => self.filter_matches(filter, exception),
                };

                if matches {
                    if let Some(handler_ip) = handler.handler_ip {
                        // Re-arm a follow-on region so a finally still
                        // covers the catch body (and a return out of it).
                        self.frames.last_mut().unwrap().handlers.push(Handler {
                            filter: None,
                            handler_ip: None,
                            finally_ip: handler.finally_ip,
                            stack_depth: handler.stack_depth,
                        });
                        self.stack.truncate(handler.stack_depth);
                        self.push(Value::Obj(exception));
                        self.frames.last_mut().unwrap().ip = handler_ip;
                        self.run_did_throw(exception)?;
                        return Ok(());
                    }
                }

                if let Some(finally_ip) = handler.finally_ip {
                    self.stack.truncate(handler.stack_depth);
                    self.push(Value::Obj(exception));
                    self.push(Value::Int(TAG_THROW));
                    self.frames.last_mut().unwrap().ip = finally_ip;
                    return Ok(());
                }
            }

            // No matching handler in this frame: discard it and continue in
            // the caller. Locals are simply dropped; captured ones close.
            let frame = self.frames.pop().unwrap();
            self.close_upvalues(frame.base);
            if let Some(generator) = frame.generator {
                self.stack.truncate(frame.base);
                self.pop();
                match &mut self.heap.get_mut(generator).data {
                    ObjData::Generator(g) => {
                        g.state = GeneratorState::Done;
                        g.slots = Vec::new();
                        g.handlers = Vec::new();
                    }
                    _ => unreachable!(),
                }
            } else {
                self.stack.truncate(frame.base);
            }
        }
    }

    fn run_did_throw(&mut self, exception: Handle) -> Result<(), RuntimeError> {
        let did = self.interceptor(self.heap.get(exception).class, InterceptorKind::DidThrow);
        let Some(hook) = did else { return Ok(()) };
        match self.call_with_receiver(hook, Value::Obj(exception), &[]) {
            Ok(_) => Ok(()),
            Err(error) => self.rethrow(error),
        }
    }

    /// Returns the thrown value as an exception object, wrapping any other
    /// value into the base exception class.
    fn ensure_exception(&mut self, thrown: Value) -> Handle {
        if let Some(handle) = thrown.as_handle() {
            let needs_trace = match &self.heap.get(handle).data {
                ObjData::Exception(e) => Some(e.trace.is_empty()),
                _ => None,
            };
            if let Some(needs_trace) = needs_trace {
                if needs_trace {
                    let trace = self.capture_trace();
                    match &mut self.heap.get_mut(handle).data {
                        ObjData::Exception(e) => e.trace = trace,
                        _ => unreachable!(),
                    }
                }
                return handle;
            }
        }
        let message = self.format_value(&thrown);
        self.make_exception(&message)
    }

    /// Whether the exception's class chain contains the filter class named
    /// by the constant.
    fn filter_matches(&self, filter: u16, exception: Handle) -> bool {
        let chunk = &self.frames.last().unwrap().chunk;
        let Value::Obj(name_handle) = chunk.constants[filter as usize] else {
            return false;
        };
        let name = match &self.heap.get(name_handle).data {
            ObjData::Str(s) => s.as_str(),
            _ => return false,
        };
        let Some(target) = self
            .globals
            .get(name)
            .or_else(|| self.constants.get(name))
            .and_then(Value::as_handle)
        else {
            return false;
        };
        if !matches!(self.heap.get(target).data, ObjData::Class(_)) {
            return false;
        }

        let mut current = self.heap.get(exception).class;
        while let Some(class) = current {
            if class == target {
                return true;
            }
            current = match &self.heap.get(class).data {
                ObjData::Class(c) => c.superclass,
                _ => None,
            };
        }
        false
    }

    fn uncaught(&mut self, exception: Handle) -> RuntimeError {
        let class_name = self
            .heap
            .get(exception)
            .class
            .map(|class| match &self.heap.get(class).data {
                ObjData::Class(c) => c.name.clone(),
                _ => "Exception".to_string(),
            })
            .unwrap_or_else(|| "Exception".to_string());
        let (message, trace) = match &self.heap.get(exception).data {
            ObjData::Exception(e) => (e.message.clone(), e.trace.clone()),
            _ => (String::new(), Vec::new()),
        };
        self.pending_exception = Some(Value::Obj(exception));
        RuntimeError {
            message: format!("{}: {}", class_name, message),
            trace,
        }
    }

    // ---- formatting --------------------------------------------------------

    /// The user-facing type name of a value.
    pub fn type_name(&self, value: &Value) -> &'static str {
        match value {
            Value::Obj(handle) => self.heap.get(*handle).data.kind_name(),
            other => other.tag_name(),
        }
    }

    /// Renders a value for display, following references into the heap.
    pub fn format_value(&self, value: &Value) -> String {
        self.format_value_depth(value, 0)
    }

    fn format_value_depth(&self, value: &Value, depth: usize) -> String {
        let Value::Obj(handle) = value else {
            return value.to_string();
        };
        if depth > 4 {
            return "...".to_string();
        }
        match &self.heap.get(*handle).data {
            ObjData::Str(s) => s.clone(),
            ObjData::Array(elements) => {
                let inner: Vec<String> = elements
                    .iter()
                    .map(|element| self.format_value_depth(element, depth + 1))
                    .collect();
                format!("[{}]", inner.join(", "))
            }
            ObjData::Dict(entries) => {
                let mut keys: Vec<&String> = entries.keys().collect();
                keys.sort();
                let inner: Vec<String> = keys
                    .iter()
                    .map(|key| {
                        format!(
                            "{}: {}",
                            key,
                            self.format_value_depth(&entries[*key], depth + 1)
                        )
                    })
                    .collect();
                format!("{{{}}}", inner.join(", "))
            }
            ObjData::Range(range) => format!("{}..{}", range.start, range.end),
            ObjData::Function(f) => format!("<function {}>", f.trace_name()),
            ObjData::Closure(c) => match &self.heap.get(c.function).data {
                ObjData::Function(f) => format!("<function {}>", f.trace_name()),
                _ => "<function>".to_string(),
            },
            ObjData::Native(n) => format!("<native {}>", n.name),
            ObjData::BoundMethod(_) => "<method>".to_string(),
            ObjData::Class(c) => format!("<class {}>", c.name),
            ObjData::Instance(_) => {
                let class_name = self.class_name_of(*handle);
                format!("<{} instance>", class_name)
            }
            ObjData::Exception(e) => {
                let class_name = self.class_name_of(*handle);
                format!("{}: {}", class_name, e.message)
            }
            ObjData::Generator(_) => "<generator>".to_string(),
            ObjData::Promise(_) => "<promise>".to_string(),
            ObjData::Namespace(ns) => format!("<namespace {}>", ns.name),
            ObjData::Upvalue(_) => "<upvalue>".to_string(),
        }
    }

    fn class_name_of(&self, handle: Handle) -> String {
        self.heap
            .get(handle)
            .class
            .map(|class| match &self.heap.get(class).data {
                ObjData::Class(c) => c.name.clone(),
                _ => "object".to_string(),
            })
            .unwrap_or_else(|| "object".to_string())
    }

    // ---- native registration API -------------------------------------------

    /// Defines a native function, either inside a namespace or as a global.
    pub fn define_function(
        &mut self,
        namespace: Option<Handle>,
        name: &str,
        arity: i8,
        function: NativeFn,
    ) {
        let native = self.heap.allocate(
            None,
            ObjData::Native(ObjNative {
                name: name.to_string(),
                arity,
                function,
            }),
        );
        self.bind_registered(namespace, name, Value::Obj(native));
    }

    /// Defines a constant, either inside a namespace or as a write-once
    /// global.
    pub fn define_constant(&mut self, namespace: Option<Handle>, name: &str, value: Value) {
        match namespace {
            Some(namespace) => self.bind_registered(Some(namespace), name, value),
            None => {
                self.constants.insert(name.to_string(), value);
            }
        }
    }

    fn bind_registered(&mut self, namespace: Option<Handle>, name: &str, value: Value) {
        match namespace {
            Some(namespace) => match &mut self.heap.get_mut(namespace).data {
                ObjData::Namespace(ns) => {
                    ns.bindings.insert(name.to_string(), value);
                }
                _ => panic!("registration target is not a namespace"),
            },
            None => {
                self.globals.insert(name.to_string(), value);
            }
        }
    }

    /// Defines (or reopens) a dot-qualified namespace chain and returns the
    /// innermost namespace.
    pub fn define_namespace(&mut self, path: &str) -> Handle {
        let mut parent: Option<Handle> = None;
        for segment in path.split('.') {
            let existing = match parent {
                Some(parent) => match &self.heap.get(parent).data {
                    ObjData::Namespace(ns) => {
                        ns.bindings.get(segment).and_then(Value::as_handle)
                    }
                    _ => None,
                },
                None => self
                    .globals
                    .get(segment)
                    .copied()
                    .and_then(|value| value.as_handle()),
            };
            let namespace = match existing {
                Some(h) if matches!(self.heap.get(h).data, ObjData::Namespace(_)) => h,
                _ => {
                    let namespace = self.heap.allocate(
                        None,
                        ObjData::Namespace(ObjNamespace::new(segment.to_string(), parent)),
                    );
                    match parent {
                        Some(parent) => match &mut self.heap.get_mut(parent).data {
                            ObjData::Namespace(ns) => {
                                ns.bindings
                                    .insert(segment.to_string(), Value::Obj(namespace));
                            }
                            _ => unreachable!(),
                        },
                        None => {
                            self.globals
                                .insert(segment.to_string(), Value::Obj(namespace));
                        }
                    }
                    namespace
                }
            };
            parent = Some(namespace);
        }
        parent.expect("namespace path must not be empty")
    }

    /// Defines a class, optionally inheriting an existing one, and binds it
    /// either into a namespace or as a global constant.
    pub fn define_class(
        &mut self,
        namespace: Option<Handle>,
        name: &str,
        kind: ClassKind,
        superclass: Option<Handle>,
    ) -> Handle {
        let mut class = ObjClass::new(name.to_string());
        class.kind = kind;
        class.namespace = namespace;
        if let Some(superclass) = superclass {
            if let ObjData::Class(parent) = &self.heap.get(superclass).data {
                class.methods = parent.methods.clone();
                class.getters = parent.getters.clone();
                class.setters = parent.setters.clone();
                class.field_defaults = parent.field_defaults.clone();
                class.interceptors = parent.interceptors.clone();
                class.kind = parent.kind;
                class.superclass = Some(superclass);
            }
        }
        let handle = self.heap.allocate(None, ObjData::Class(class));
        match namespace {
            Some(namespace) => match &mut self.heap.get_mut(namespace).data {
                ObjData::Namespace(ns) => {
                    ns.bindings.insert(name.to_string(), Value::Obj(handle));
                }
                _ => unreachable!(),
            },
            None => {
                self.constants.insert(name.to_string(), Value::Obj(handle));
            }
        }
        handle
    }

    /// Defines a native method on a class.
    pub fn define_method(&mut self, class: Handle, name: &str, arity: i8, function: NativeFn) {
        let native = self.heap.allocate(
            None,
            ObjData::Native(ObjNative {
                name: name.to_string(),
                arity,
                function,
            }),
        );
        match &mut self.heap.get_mut(class).data {
            ObjData::Class(c) => {
                c.methods.insert(name.to_string(), Value::Obj(native));
                if let Some(hook) = InterceptorKind::from_method_name(name) {
                    c.interceptors.set(hook, Value::Obj(native));
                }
            }
            _ => panic!("define_method expects a class"),
        }
    }

    /// Installs an interceptor hook on a class.
    pub fn define_interceptor(&mut self, class: Handle, kind: InterceptorKind, function: NativeFn) {
        let native = self.heap.allocate(
            None,
            ObjData::Native(ObjNative {
                name: format!("{:?}", kind),
                arity: -1,
                function,
            }),
        );
        match &mut self.heap.get_mut(class).data {
            ObjData::Class(c) => c.interceptors.set(kind, Value::Obj(native)),
            _ => panic!("define_interceptor expects a class"),
        }
    }

    /// Reads a named field from an instance or exception object.
    pub fn get_field(&self, receiver: Value, name: &str) -> Option<Value> {
        let handle = receiver.as_handle()?;
        match &self.heap.get(handle).data {
            ObjData::Instance(instance) => instance.fields.get(name).copied(),
            ObjData::Exception(exception) => exception.fields.get(name).copied(),
            _ => None,
        }
    }

    /// Writes a named field on an instance or exception object.
    pub fn set_field(&mut self, receiver: Value, name: &str, value: Value) -> bool {
        let Some(handle) = receiver.as_handle() else {
            return false;
        };
        match &mut self.heap.get_mut(handle).data {
            ObjData::Instance(instance) => {
                instance.fields.insert(name.to_string(), value);
                true
            }
            ObjData::Exception(exception) => {
                exception.fields.insert(name.to_string(), value);
                true
            }
            _ => false,
        }
    }

    /// Returns the message of an exception object.
    pub fn exception_message(&self, value: Value) -> Option<String> {
        let handle = value.as_handle()?;
        match &self.heap.get(handle).data {
            ObjData::Exception(e) => Some(e.message.clone()),
            _ => None,
        }
    }

    /// Sets the message of an exception object.
    pub fn set_exception_message(&mut self, value: Value, message: &str) {
        if let Some(handle) = value.as_handle() {
            if let ObjData::Exception(e) = &mut self.heap.get_mut(handle).data {
                e.message = message.to_string();
            }
        }
    }

    /// Builds an exception value natives can return through
    /// [`NativeError::Thrown`].
    pub fn new_exception(&mut self, message: &str) -> Value {
        let handle = self.make_exception(message);
        Value::Obj(handle)
    }

    /// Allocates a pending promise.
    pub fn new_promise(&mut self) -> Handle {
        self.alloc(
            Some(self.promise_class),
            ObjData::Promise(ObjPromise::default()),
        )
    }

    /// Settles a promise, invoking its registered callbacks reentrantly.
    pub fn settle_promise(
        &mut self,
        promise: Handle,
        value: Value,
        fulfilled: bool,
    ) -> Result<(), RuntimeError> {
        let callbacks = match &mut self.heap.get_mut(promise).data {
            ObjData::Promise(p) => {
                if p.state != PromiseState::Pending {
                    return Ok(());
                }
                p.state = if fulfilled {
                    PromiseState::Fulfilled
                } else {
                    PromiseState::Rejected
                };
                p.value = value;
                std::mem::take(&mut p.callbacks)
            }
            _ => panic!("settle_promise expects a promise"),
        };
        for callback in callbacks {
            self.call_function(callback, &[value])?;
        }
        Ok(())
    }

    /// Registers a callback to run when the promise settles; runs it
    /// immediately if it already has.
    pub fn promise_on_settle(
        &mut self,
        promise: Handle,
        callback: Value,
    ) -> Result<(), RuntimeError> {
        let settled = match &mut self.heap.get_mut(promise).data {
            ObjData::Promise(p) => {
                if p.state == PromiseState::Pending {
                    p.callbacks.push(callback);
                    None
                } else {
                    Some(p.value)
                }
            }
            _ => panic!("promise_on_settle expects a promise"),
        };
        if let Some(value) = settled {
            self.call_function(callback, &[value])?;
        }
        Ok(())
    }

    /// Heap statistics, for hosts and liveness tests.
    pub fn heap_stats(&self) -> crate::gc::HeapStats {
        self.heap.stats()
    }

    /// Looks up a global or constant by name.
    pub fn lookup_global(&self, name: &str) -> Option<Value> {
        self.globals
            .get(name)
            .or_else(|| self.constants.get(name))
            .copied()
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Which class table a member-binding opcode targets.
#[derive(Debug, Clone, Copy)]
enum MemberKind {
    Method,
    Getter,
    Setter,
    FieldDefault,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{Chunk, compile};
    use crate::runtime::object::ObjFunction;
    use std::rc::Rc;

    fn eval(vm: &mut Vm, source: &str) -> Result<Value, RuntimeError> {
        let function = compile(source, vm.heap_mut()).expect("compile error");
        vm.interpret(function)
    }

    #[test]
    fn test_arithmetic_and_comparison() {
        let mut vm = Vm::new();
        assert_eq!(eval(&mut vm, "1 + 2 * 3;").unwrap(), Value::Int(7));
        assert_eq!(eval(&mut vm, "7 % 3;").unwrap(), Value::Int(1));
        assert_eq!(eval(&mut vm, "1.5 + 1;").unwrap(), Value::Float(2.5));
        assert_eq!(eval(&mut vm, "2 < 3;").unwrap(), Value::Bool(true));
        assert_eq!(eval(&mut vm, "2 >= 3;").unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_bitwise() {
        let mut vm = Vm::new();
        assert_eq!(eval(&mut vm, "6 & 3;").unwrap(), Value::Int(2));
        assert_eq!(eval(&mut vm, "6 | 3;").unwrap(), Value::Int(7));
        assert_eq!(eval(&mut vm, "6 ^ 3;").unwrap(), Value::Int(5));
        assert_eq!(eval(&mut vm, "1 << 4;").unwrap(), Value::Int(16));
        assert_eq!(eval(&mut vm, "~0;").unwrap(), Value::Int(-1));
    }

    #[test]
    fn test_string_concatenation_requires_strings() {
        let mut vm = Vm::new();
        let joined = eval(&mut vm, "\"a\" + \"b\";").unwrap();
        assert_eq!(vm.format_value(&joined), "ab");
        let error = eval(&mut vm, "\"a\" + 1;").unwrap_err();
        assert!(error.message.contains("cannot add"));
    }

    #[test]
    fn test_type_mismatch_is_catchable() {
        let mut vm = Vm::new();
        let result = eval(
            &mut vm,
            "let r = nil; try { 1 + \"x\"; } catch (e) { r = \"caught\"; } r;",
        )
        .unwrap();
        assert_eq!(vm.format_value(&result), "caught");
    }

    #[test]
    fn test_undefined_variable_fault() {
        let mut vm = Vm::new();
        let error = eval(&mut vm, "missing;").unwrap_err();
        assert!(error.message.contains("undefined variable"));
        assert!(!error.trace.is_empty());
    }

    #[test]
    fn test_constant_reassignment_fault() {
        let mut vm = Vm::new();
        eval(&mut vm, "const K = 1;").unwrap();
        let error = eval(&mut vm, "K = 2;").unwrap_err();
        assert!(error.message.contains("cannot reassign constant"));
    }

    #[test]
    fn test_interpolation() {
        let mut vm = Vm::new();
        let value = eval(&mut vm, "let x = 41; \"x = ${x + 1}!\";").unwrap();
        assert_eq!(vm.format_value(&value), "x = 42!");
    }

    #[test]
    fn test_array_and_dict_literals() {
        let mut vm = Vm::new();
        assert_eq!(eval(&mut vm, "[1, 2, 3][1];").unwrap(), Value::Int(2));
        assert_eq!(eval(&mut vm, "[1, 2, 3].length;").unwrap(), Value::Int(3));
        let value = eval(&mut vm, "let d = {\"a\": 1}; d[\"a\"];").unwrap();
        assert_eq!(value, Value::Int(1));
        let error = eval(&mut vm, "[1][5];").unwrap_err();
        assert!(error.message.contains("out of range"));
    }

    #[test]
    fn test_range_values() {
        let mut vm = Vm::new();
        assert_eq!(eval(&mut vm, "(2..7).start;").unwrap(), Value::Int(2));
        assert_eq!(eval(&mut vm, "(2..7)[3];").unwrap(), Value::Int(5));
        assert_eq!(eval(&mut vm, "(2..7).length;").unwrap(), Value::Int(5));
    }

    #[test]
    fn test_reentrant_call_keeps_stack_balanced() {
        let mut vm = Vm::new();
        eval(&mut vm, "function double(x) { return x * 2; }").unwrap();
        let callee = vm.lookup_global("double").unwrap();
        let before = vm.stack.len();
        let result = vm.call_function(callee, &[Value::Int(21)]).unwrap();
        assert_eq!(result, Value::Int(42));
        assert_eq!(vm.stack.len(), before);
        assert_eq!(vm.frames.len(), 0);
    }

    #[test]
    fn test_reentrant_call_error_keeps_stack_balanced() {
        let mut vm = Vm::new();
        eval(&mut vm, "function boom() { throw Exception(\"bang\"); }").unwrap();
        let callee = vm.lookup_global("boom").unwrap();
        let before = vm.stack.len();
        let error = vm.call_function(callee, &[]).unwrap_err();
        assert!(error.message.contains("bang"));
        assert_eq!(vm.stack.len(), before);
        assert_eq!(vm.frames.len(), 0);
    }

    #[test]
    fn test_hand_assembled_dup_and_non_local_return() {
        // Dup and ReturnNonLocal have no surface syntax yet; drive them with
        // a hand-assembled chunk: the script calls g(), and g() returns 7
        // across the intermediate frame in one instruction.
        let mut vm = Vm::new();

        let mut inner = Chunk::new();
        let seven = inner.add_constant(Value::Int(7));
        inner.write_op(OpCode::Constant, 1);
        inner.write_u16(seven, 1);
        inner.write_op(OpCode::Dup, 1);
        inner.write_op(OpCode::Pop, 1);
        inner.write_op(OpCode::ReturnNonLocal, 1);
        inner.write_u8(1, 1);
        let inner_fn = vm.heap_mut().allocate(
            None,
            ObjData::Function(ObjFunction {
                name: "g".to_string(),
                arity: 0,
                is_variadic: false,
                is_generator: false,
                upvalue_count: 0,
                chunk: Rc::new(inner),
            }),
        );

        let mut middle = Chunk::new();
        let g_const = middle.add_function_constant(Value::Obj(inner_fn));
        middle.write_op(OpCode::Closure, 1);
        middle.write_u16(g_const, 1);
        middle.write_op(OpCode::Call, 1);
        middle.write_u8(0, 1);
        // Unreachable: the non-local return skips this frame's epilogue.
        let unreached = middle.add_constant(Value::Int(0));
        middle.write_op(OpCode::Constant, 2);
        middle.write_u16(unreached, 2);
        middle.write_op(OpCode::Return, 2);
        let middle_fn = vm.heap_mut().allocate(
            None,
            ObjData::Function(ObjFunction {
                name: "f".to_string(),
                arity: 0,
                is_variadic: false,
                is_generator: false,
                upvalue_count: 0,
                chunk: Rc::new(middle),
            }),
        );

        let mut outer = Chunk::new();
        let f_const = outer.add_function_constant(Value::Obj(middle_fn));
        outer.write_op(OpCode::Closure, 1);
        outer.write_u16(f_const, 1);
        outer.write_op(OpCode::Call, 1);
        outer.write_u8(0, 1);
        outer.write_op(OpCode::Return, 1);
        let script = vm.heap_mut().allocate(
            None,
            ObjData::Function(ObjFunction {
                name: String::new(),
                arity: 0,
                is_variadic: false,
                is_generator: false,
                upvalue_count: 0,
                chunk: Rc::new(outer),
            }),
        );

        assert_eq!(vm.interpret(script).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_collection_during_execution_preserves_live_data() {
        let mut vm = Vm::new();
        let value = eval(
            &mut vm,
            "let parts = []; \
             for (let i = 0; i < 200; i = i + 1) { parts = [parts, \"chunk ${i}\"]; } \
             parts.length;",
        )
        .unwrap();
        assert_eq!(value, Value::Int(2));
        vm.collect_garbage();
        let survived = eval(&mut vm, "parts.length;").unwrap();
        assert_eq!(survived, Value::Int(2));
    }
}
