//! Single-pass compilation of source text to bytecode.
//!
//! The compiler is a precedence-climbing parser that emits instructions as
//! it parses; there is no AST. A stack of [`FunctionCompiler`] contexts
//! mirrors the nesting of function bodies, each with its own locals table,
//! upvalue table, and loop contexts. Errors use panic-mode recovery: the
//! first error in a statement is reported, subsequent ones are suppressed
//! until a statement boundary, and compilation always continues so every
//! diagnostic is collected in one pass.

use std::fmt;
use std::rc::Rc;

use crate::compiler::chunk::{Chunk, NO_TARGET};
use crate::compiler::opcode::OpCode;
use crate::gc::{Handle, Heap};
use crate::lexer::{Scanner, Token, TokenKind};
use crate::runtime::object::{ObjData, ObjFunction};
use crate::runtime::value::Value;

/// Maximum number of locals per function (one-byte slot operands).
const MAX_LOCALS: usize = 256;

/// Maximum number of upvalues per function.
const MAX_UPVALUES: usize = 256;

/// Maximum call arity.
const MAX_ARITY: usize = 255;

/// A compile-time error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// What went wrong
    pub message: String,
    /// 1-based source line
    pub line: u32,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] error: {}", self.line, self.message)
    }
}

/// Compiles a source unit into a function object on the heap.
///
/// On failure, every syntax error found is returned; nothing was executed.
pub fn compile(source: &str, heap: &mut Heap) -> Result<Handle, Vec<Diagnostic>> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.match_token(&TokenKind::Eof) {
        compiler.declaration();
    }
    let (script, _) = compiler.finish_function();
    if compiler.had_error {
        Err(compiler.diagnostics)
    } else {
        Ok(script)
    }
}

/// Expression precedence, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // ||
    And,        // &&
    Equality,   // == !=
    Comparison, // < > <= >=
    Range,      // ..
    BitOr,      // |
    BitXor,     // ^
    BitAnd,     // &
    Shift,      // << >>
    Term,       // + -
    Factor,     // * / %
    Unary,      // ! - ~
    Call,       // . () []
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Range,
            Precedence::Range => Precedence::BitOr,
            Precedence::BitOr => Precedence::BitXor,
            Precedence::BitXor => Precedence::BitAnd,
            Precedence::BitAnd => Precedence::Shift,
            Precedence::Shift => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'a> = fn(&mut Compiler<'a>, bool);

struct Rule<'a> {
    prefix: Option<ParseFn<'a>>,
    infix: Option<ParseFn<'a>>,
    precedence: Precedence,
}

impl<'a> Rule<'a> {
    const fn new(prefix: Option<ParseFn<'a>>, infix: Option<ParseFn<'a>>, precedence: Precedence) -> Self {
        Self {
            prefix,
            infix,
            precedence,
        }
    }
}

/// The parse rule for a token kind: prefix handler, infix handler, and the
/// infix precedence.
fn rule<'a>(kind: &TokenKind) -> Rule<'a> {
    use Precedence as P;
    match kind {
        TokenKind::LeftParen => Rule::new(Some(Compiler::grouping), Some(Compiler::call), P::Call),
        TokenKind::LeftBracket => Rule::new(Some(Compiler::array), Some(Compiler::index), P::Call),
        TokenKind::LeftBrace => Rule::new(Some(Compiler::dict), None, P::None),
        TokenKind::Dot => Rule::new(None, Some(Compiler::dot), P::Call),
        TokenKind::DotDot => Rule::new(None, Some(Compiler::range), P::Range),
        TokenKind::Minus => Rule::new(Some(Compiler::unary), Some(Compiler::binary), P::Term),
        TokenKind::Plus => Rule::new(None, Some(Compiler::binary), P::Term),
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => {
            Rule::new(None, Some(Compiler::binary), P::Factor)
        }
        TokenKind::Bang => Rule::new(Some(Compiler::unary), None, P::None),
        TokenKind::Tilde => Rule::new(Some(Compiler::unary), None, P::None),
        TokenKind::EqualEqual | TokenKind::BangEqual => {
            Rule::new(None, Some(Compiler::binary), P::Equality)
        }
        TokenKind::Less
        | TokenKind::LessEqual
        | TokenKind::Greater
        | TokenKind::GreaterEqual => Rule::new(None, Some(Compiler::binary), P::Comparison),
        TokenKind::Amp => Rule::new(None, Some(Compiler::binary), P::BitAnd),
        TokenKind::Pipe => Rule::new(None, Some(Compiler::binary), P::BitOr),
        TokenKind::Caret => Rule::new(None, Some(Compiler::binary), P::BitXor),
        TokenKind::LessLess | TokenKind::GreaterGreater => {
            Rule::new(None, Some(Compiler::binary), P::Shift)
        }
        TokenKind::AmpAmp => Rule::new(None, Some(Compiler::and_op), P::And),
        TokenKind::PipePipe => Rule::new(None, Some(Compiler::or_op), P::Or),
        TokenKind::Int(_) | TokenKind::Float(_) => {
            Rule::new(Some(Compiler::number), None, P::None)
        }
        TokenKind::Str(_) => Rule::new(Some(Compiler::string), None, P::None),
        TokenKind::Interpolation(_) => Rule::new(Some(Compiler::interpolation), None, P::None),
        TokenKind::Identifier(_) => Rule::new(Some(Compiler::variable), None, P::None),
        TokenKind::True | TokenKind::False | TokenKind::Nil => {
            Rule::new(Some(Compiler::literal), None, P::None)
        }
        TokenKind::This => Rule::new(Some(Compiler::this), None, P::None),
        TokenKind::Super => Rule::new(Some(Compiler::super_), None, P::None),
        TokenKind::Function => Rule::new(Some(Compiler::lambda), None, P::None),
        _ => Rule::new(None, None, P::None),
    }
}

/// What kind of body a [`FunctionCompiler`] is building.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// A local variable slot.
struct Local {
    name: String,
    /// Scope depth; -1 while the initializer is still being compiled
    depth: i32,
    /// Whether any closure captures this slot
    captured: bool,
    /// false for `const` locals
    mutable: bool,
}

/// A compiled upvalue descriptor: capture from the parent's local slot or
/// forward one of the parent's own upvalues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompiledUpvalue {
    /// Slot (is_local) or parent upvalue index
    pub index: u8,
    /// Capture a parent local rather than forwarding a parent upvalue
    pub is_local: bool,
    mutable: bool,
}

/// The innermost loop being compiled.
struct LoopContext {
    /// Where `continue` jumps (the condition, or a for-loop's increment)
    continue_target: usize,
    /// Scope depth at loop entry; break/continue discard deeper locals
    scope_depth: i32,
    /// Armed try regions at loop entry; break/continue disarm deeper ones
    try_depth: usize,
    /// Pending break jumps, patched once the loop end is known
    breaks: Vec<usize>,
}

/// Per-function compilation state.
struct FunctionCompiler {
    kind: FunctionKind,
    name: String,
    arity: u8,
    is_variadic: bool,
    is_generator: bool,
    chunk: Chunk,
    locals: Vec<Local>,
    scope_depth: i32,
    upvalues: Vec<CompiledUpvalue>,
    loops: Vec<LoopContext>,
    /// Armed try regions at the current statement
    try_depth: usize,
}

impl FunctionCompiler {
    fn new(kind: FunctionKind, name: &str) -> Self {
        // Slot 0 is the callee; in methods it is the receiver binding.
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            _ => "",
        };
        Self {
            kind,
            name: name.to_string(),
            arity: 0,
            is_variadic: false,
            is_generator: false,
            chunk: Chunk::new(),
            locals: vec![Local {
                name: slot_zero.to_string(),
                depth: 0,
                captured: false,
                mutable: false,
            }],
            scope_depth: 0,
            upvalues: Vec::new(),
            loops: Vec::new(),
            try_depth: 0,
        }
    }
}

struct ClassContext {
    has_superclass: bool,
}

struct NamespaceContext {
    /// Local slot holding the namespace object
    slot: u8,
    /// Scope depth of the namespace body
    depth: i32,
}

/// The compiler driver.
pub struct Compiler<'a> {
    scanner: Scanner<'a>,
    heap: &'a mut Heap,
    current: Token,
    previous: Token,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
    functions: Vec<FunctionCompiler>,
    classes: Vec<ClassContext>,
    namespaces: Vec<NamespaceContext>,
}

impl<'a> Compiler<'a> {
    fn new(source: &'a str, heap: &'a mut Heap) -> Self {
        Self {
            scanner: Scanner::new(source),
            heap,
            current: Token::eof(),
            previous: Token::eof(),
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
            functions: vec![FunctionCompiler::new(FunctionKind::Script, "")],
            classes: Vec::new(),
            namespaces: Vec::new(),
        }
    }

    // ---- token plumbing ----------------------------------------------------

    fn advance(&mut self) {
        self.previous = std::mem::replace(&mut self.current, Token::eof());
        loop {
            self.current = self.scanner.next_token();
            if let TokenKind::Error(message) = self.current.kind.clone() {
                self.error_at_current(&message);
            } else {
                break;
            }
        }
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.current.kind) == std::mem::discriminant(kind)
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(&kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn consume_identifier(&mut self, message: &str) -> String {
        if let TokenKind::Identifier(name) = &self.current.kind {
            let name = name.clone();
            self.advance();
            name
        } else {
            self.error_at_current(message);
            String::new()
        }
    }

    // ---- error reporting ---------------------------------------------------

    fn error_at_current(&mut self, message: &str) {
        let line = self.current.line;
        self.error_at(line, message);
    }

    fn error(&mut self, message: &str) {
        let line = self.previous.line;
        self.error_at(line, message);
    }

    fn error_at(&mut self, line: u32, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.diagnostics.push(Diagnostic {
            message: message.to_string(),
            line,
        });
    }

    /// Skips forward to a statement boundary after an error.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Function
                | TokenKind::Let
                | TokenKind::Const
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Return
                | TokenKind::Break
                | TokenKind::Continue
                | TokenKind::Try
                | TokenKind::Throw
                | TokenKind::Yield
                | TokenKind::Namespace
                | TokenKind::Using => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- emission helpers --------------------------------------------------

    fn fun(&mut self) -> &mut FunctionCompiler {
        self.functions.last_mut().unwrap()
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.functions.last_mut().unwrap().chunk
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.chunk_mut().write_op(op, line);
    }

    fn emit_u8(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk_mut().write_u8(byte, line);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.previous.line;
        self.chunk_mut().write_u16(value, line);
    }

    fn make_constant(&mut self, value: Value) -> u16 {
        if self.functions.last().unwrap().chunk.constants.len() >= u16::MAX as usize {
            self.error("too many constants in one chunk");
            return 0;
        }
        self.chunk_mut().add_constant(value)
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op(OpCode::Constant);
        self.emit_u16(index);
    }

    fn identifier_constant(&mut self, name: &str) -> u16 {
        let handle = self.heap.intern(name);
        self.make_constant(Value::Obj(handle))
    }

    /// Emits a jump and returns the offset of its operand for patching.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        let offset = self.functions.last().unwrap().chunk.len();
        self.emit_u16(NO_TARGET);
        offset
    }

    /// Patches a jump operand to target the next instruction.
    fn patch_jump(&mut self, operand: usize) {
        let target = self.functions.last().unwrap().chunk.len();
        if target > u16::MAX as usize {
            self.error("function body too large");
            return;
        }
        self.chunk_mut().patch_u16(operand, target as u16);
    }

    /// Emits a backward jump to `target`.
    fn emit_loop(&mut self, target: usize) {
        self.emit_op(OpCode::Loop);
        if target > u16::MAX as usize {
            self.error("function body too large");
        }
        self.emit_u16(target as u16);
    }

    fn emit_implicit_return(&mut self) {
        match self.functions.last().unwrap().kind {
            FunctionKind::Initializer => {
                self.emit_op(OpCode::GetLocal);
                self.emit_u8(0);
            }
            _ => self.emit_op(OpCode::Nil),
        }
        self.emit_op(OpCode::Return);
    }

    /// Ends the current function context, allocating its function object.
    fn finish_function(&mut self) -> (Handle, Vec<CompiledUpvalue>) {
        self.emit_implicit_return();
        let fc = self.functions.pop().unwrap();
        let function = ObjFunction {
            name: fc.name,
            arity: fc.arity,
            is_variadic: fc.is_variadic,
            is_generator: fc.is_generator,
            upvalue_count: fc.upvalues.len(),
            chunk: Rc::new(fc.chunk),
        };
        let handle = self.heap.allocate(None, ObjData::Function(function));
        (handle, fc.upvalues)
    }

    // ---- scopes and variables ----------------------------------------------

    fn begin_scope(&mut self) {
        self.fun().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.fun().scope_depth -= 1;
        loop {
            let fc = self.functions.last().unwrap();
            let Some(local) = fc.locals.last() else { break };
            if local.depth <= fc.scope_depth {
                break;
            }
            let captured = local.captured;
            self.fun().locals.pop();
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    /// Emits pops for locals deeper than `depth` without forgetting them,
    /// used by break/continue which jump out of scopes the compiler is still
    /// inside of.
    fn discard_locals(&mut self, depth: i32) {
        let flags: Vec<bool> = self
            .functions
            .last()
            .unwrap()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > depth)
            .map(|local| local.captured)
            .collect();
        for captured in flags {
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn add_local(&mut self, name: &str, mutable: bool) {
        if self.functions.last().unwrap().locals.len() >= MAX_LOCALS {
            self.error("too many local variables in function");
            return;
        }
        // Declared but uninitialized until the initializer is compiled.
        self.fun().locals.push(Local {
            name: name.to_string(),
            depth: -1,
            captured: false,
            mutable,
        });
    }

    fn mark_initialized(&mut self) {
        let depth = self.fun().scope_depth;
        if let Some(local) = self.fun().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn declare_variable(&mut self, name: &str, mutable: bool) {
        if self.fun().scope_depth == 0 {
            return; // globals are late-bound
        }
        let fc = self.functions.last().unwrap();
        for local in fc.locals.iter().rev() {
            if local.depth != -1 && local.depth < fc.scope_depth {
                break;
            }
            if local.name == name {
                let message = format!("variable '{}' already declared in this scope", name);
                self.error(&message);
                break;
            }
        }
        self.add_local(name, mutable);
    }

    /// Defines the variable declared by [`Compiler::declare_variable`]:
    /// locals become visible, globals are emitted.
    fn define_variable(&mut self, name_constant: u16, mutable: bool) {
        if self.fun().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        if mutable {
            self.emit_op(OpCode::DefineGlobal);
        } else {
            self.emit_op(OpCode::DefineConst);
        }
        self.emit_u16(name_constant);
    }

    fn resolve_local(&mut self, fidx: usize, name: &str) -> Option<(u8, bool)> {
        let fc = &self.functions[fidx];
        let found = fc
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)
            .map(|(slot, local)| (slot as u8, local.mutable, local.depth == -1));
        if let Some((slot, mutable, uninitialized)) = found {
            if uninitialized {
                self.error("cannot read a variable in its own initializer");
            }
            return Some((slot, mutable));
        }
        None
    }

    fn add_upvalue(&mut self, fidx: usize, index: u8, is_local: bool, mutable: bool) -> u8 {
        let fc = &self.functions[fidx];
        for (i, upvalue) in fc.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return i as u8;
            }
        }
        if fc.upvalues.len() >= MAX_UPVALUES {
            self.error("too many captured variables in function");
            return 0;
        }
        self.functions[fidx].upvalues.push(CompiledUpvalue {
            index,
            is_local,
            mutable,
        });
        (self.functions[fidx].upvalues.len() - 1) as u8
    }

    /// Resolves a free variable by asking the enclosing context for it,
    /// producing a chain of upvalue captures.
    fn resolve_upvalue(&mut self, fidx: usize, name: &str) -> Option<(u8, bool)> {
        if fidx == 0 {
            return None;
        }
        if let Some((slot, mutable)) = self.resolve_local(fidx - 1, name) {
            self.functions[fidx - 1].locals[slot as usize].captured = true;
            let index = self.add_upvalue(fidx, slot, true, mutable);
            return Some((index, mutable));
        }
        if let Some((upvalue, mutable)) = self.resolve_upvalue(fidx - 1, name) {
            let index = self.add_upvalue(fidx, upvalue, false, mutable);
            return Some((index, mutable));
        }
        None
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let fidx = self.functions.len() - 1;
        let (get_op, set_op, arg, mutable) =
            if let Some((slot, mutable)) = self.resolve_local(fidx, name) {
                (OpCode::GetLocal, OpCode::SetLocal, u16::from(slot), mutable)
            } else if let Some((index, mutable)) = self.resolve_upvalue(fidx, name) {
                (
                    OpCode::GetUpvalue,
                    OpCode::SetUpvalue,
                    u16::from(index),
                    mutable,
                )
            } else {
                let constant = self.identifier_constant(name);
                (OpCode::GetGlobal, OpCode::SetGlobal, constant, true)
            };

        if can_assign && self.match_token(&TokenKind::Equal) {
            if !mutable {
                let message = format!("cannot assign to constant '{}'", name);
                self.error(&message);
            }
            self.expression();
            self.emit_op(set_op);
            if matches!(set_op, OpCode::SetLocal | OpCode::SetUpvalue) {
                self.emit_u8(arg as u8);
            } else {
                self.emit_u16(arg);
            }
        } else {
            self.emit_op(get_op);
            if matches!(get_op, OpCode::GetLocal | OpCode::GetUpvalue) {
                self.emit_u8(arg as u8);
            } else {
                self.emit_u16(arg);
            }
        }
    }

    // ---- declarations ------------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(&TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(&TokenKind::Function) {
            self.fun_declaration();
        } else if self.match_token(&TokenKind::Let) {
            self.var_declaration(true);
        } else if self.match_token(&TokenKind::Const) {
            self.var_declaration(false);
        } else if self.match_token(&TokenKind::Namespace) {
            self.namespace_declaration();
        } else if self.match_token(&TokenKind::Using) {
            self.using_statement();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    /// Binds the most recently defined local into the enclosing namespace,
    /// when the declaration sits directly in a namespace body.
    fn maybe_namespace_bind(&mut self, name: &str) {
        let Some(context) = self.namespaces.last() else {
            return;
        };
        if self.functions.len() != 1
            || self.functions.last().unwrap().scope_depth != context.depth
        {
            return;
        }
        let ns_slot = context.slot;
        let value_slot = (self.functions.last().unwrap().locals.len() - 1) as u8;
        let constant = self.identifier_constant(name);
        self.emit_op(OpCode::GetLocal);
        self.emit_u8(ns_slot);
        self.emit_op(OpCode::GetLocal);
        self.emit_u8(value_slot);
        self.emit_op(OpCode::NamespaceBind);
        self.emit_u16(constant);
    }

    fn var_declaration(&mut self, mutable: bool) {
        let name = self.consume_identifier("expected variable name");
        self.declare_variable(&name, mutable);

        if self.match_token(&TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "expected ';' after variable declaration");

        let constant = if self.fun().scope_depth == 0 {
            self.identifier_constant(&name)
        } else {
            0
        };
        self.define_variable(constant, mutable);
        self.maybe_namespace_bind(&name);
    }

    fn fun_declaration(&mut self) {
        let name = self.consume_identifier("expected function name");
        self.declare_variable(&name, false);
        // Visible inside its own body, so it can recurse.
        if self.fun().scope_depth > 0 {
            self.mark_initialized();
        }
        self.function(FunctionKind::Function, &name);
        let constant = if self.fun().scope_depth == 0 {
            self.identifier_constant(&name)
        } else {
            0
        };
        self.define_variable(constant, false);
        self.maybe_namespace_bind(&name);
    }

    /// Compiles a function body in a fresh context and emits the closure in
    /// the enclosing one.
    fn function(&mut self, kind: FunctionKind, name: &str) {
        self.functions.push(FunctionCompiler::new(kind, name));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "expected '(' after function name");
        if !self.check(&TokenKind::RightParen) {
            if self.match_token(&TokenKind::Ellipsis) {
                // The single `...` parameter packs every call argument.
                let param = self.consume_identifier("expected parameter name after '...'");
                self.declare_variable(&param, true);
                self.mark_initialized();
                self.fun().arity = 1;
                self.fun().is_variadic = true;
            } else {
                loop {
                    if self.functions.last().unwrap().arity as usize >= MAX_ARITY {
                        self.error_at_current("too many parameters");
                    }
                    let param = self.consume_identifier("expected parameter name");
                    self.declare_variable(&param, true);
                    self.mark_initialized();
                    self.fun().arity += 1;
                    if !self.match_token(&TokenKind::Comma) {
                        break;
                    }
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after parameters");
        self.consume(TokenKind::LeftBrace, "expected '{' before function body");
        self.block();

        let (function, upvalues) = self.finish_function();
        let constant = self.chunk_mut().add_function_constant(Value::Obj(function));
        self.emit_op(OpCode::Closure);
        self.emit_u16(constant);
        for upvalue in upvalues {
            self.emit_u8(upvalue.is_local as u8);
            self.emit_u8(upvalue.index);
        }
    }

    fn class_declaration(&mut self) {
        let name = self.consume_identifier("expected class name");
        let name_constant = self.identifier_constant(&name);
        self.declare_variable(&name, false);

        self.emit_op(OpCode::Class);
        self.emit_u16(name_constant);
        self.define_variable(name_constant, false);

        self.classes.push(ClassContext {
            has_superclass: false,
        });

        let has_superclass = self.match_token(&TokenKind::Colon);
        if has_superclass {
            let superclass = self.consume_identifier("expected superclass name");
            if superclass == name {
                self.error("a class cannot inherit from itself");
            }
            // The superclass value lives in a scoped `super` local so method
            // closures can capture it.
            self.begin_scope();
            self.named_variable(&superclass, false);
            self.add_local("super", false);
            self.mark_initialized();

            self.named_variable(&name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        // Keep the class on the stack while members bind to it.
        self.named_variable(&name, false);
        self.consume(TokenKind::LeftBrace, "expected '{' before class body");
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            self.class_member();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after class body");
        self.emit_op(OpCode::Pop);

        if has_superclass {
            self.end_scope();
        }
        self.classes.pop();
        self.maybe_namespace_bind(&name);
    }

    fn class_member(&mut self) {
        if self.match_token(&TokenKind::Function) {
            let name = self.consume_identifier("expected method name");
            let constant = self.identifier_constant(&name);
            let kind = if name == "init" {
                FunctionKind::Initializer
            } else {
                FunctionKind::Method
            };
            self.function(kind, &name);
            self.emit_op(OpCode::Method);
            self.emit_u16(constant);
        } else if self.match_token(&TokenKind::Let) {
            // Instance-field default, evaluated once at class-creation time.
            let name = self.consume_identifier("expected field name");
            let constant = self.identifier_constant(&name);
            self.consume(TokenKind::Equal, "expected '=' after field name");
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after field default");
            self.emit_op(OpCode::FieldDefault);
            self.emit_u16(constant);
        } else if self.check_identifier("get") {
            self.advance();
            let name = self.consume_identifier("expected getter name");
            let constant = self.identifier_constant(&name);
            self.function(FunctionKind::Method, &name);
            self.emit_op(OpCode::Getter);
            self.emit_u16(constant);
        } else if self.check_identifier("set") {
            self.advance();
            let name = self.consume_identifier("expected setter name");
            let constant = self.identifier_constant(&name);
            self.function(FunctionKind::Method, &name);
            self.emit_op(OpCode::Setter);
            self.emit_u16(constant);
        } else {
            self.error_at_current("expected method, getter, setter, or field declaration");
            self.advance();
        }
    }

    fn check_identifier(&self, text: &str) -> bool {
        matches!(&self.current.kind, TokenKind::Identifier(name) if name == text)
    }

    fn namespace_declaration(&mut self) {
        let name = self.consume_identifier("expected namespace name");
        let name_constant = self.identifier_constant(&name);

        let nested = if let Some(parent) = self.namespaces.last() {
            let parent_slot = parent.slot;
            self.emit_op(OpCode::GetLocal);
            self.emit_u8(parent_slot);
            true
        } else {
            false
        };
        self.emit_op(OpCode::Namespace);
        self.emit_u16(name_constant);
        self.emit_u8(nested as u8);

        // The namespace object becomes a scoped local named after itself, so
        // members can refer to it (and each other) unqualified in the body.
        self.begin_scope();
        self.add_local(&name, false);
        self.mark_initialized();
        let slot = (self.functions.last().unwrap().locals.len() - 1) as u8;
        let depth = self.functions.last().unwrap().scope_depth;
        self.namespaces.push(NamespaceContext { slot, depth });

        self.consume(TokenKind::LeftBrace, "expected '{' after namespace name");
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after namespace body");

        self.namespaces.pop();
        self.end_scope();
    }

    fn using_statement(&mut self) {
        let root = self.consume_identifier("expected namespace name after 'using'");
        self.named_variable(&root, false);
        while self.match_token(&TokenKind::Dot) {
            let segment = self.consume_identifier("expected name after '.'");
            let constant = self.identifier_constant(&segment);
            self.emit_op(OpCode::GetProperty);
            self.emit_u16(constant);
        }
        self.consume(TokenKind::Semicolon, "expected ';' after using");
        self.emit_op(OpCode::Using);
    }

    // ---- statements --------------------------------------------------------

    fn statement(&mut self) {
        if self.match_token(&TokenKind::If) {
            self.if_statement();
        } else if self.match_token(&TokenKind::While) {
            self.while_statement();
        } else if self.match_token(&TokenKind::For) {
            self.for_statement();
        } else if self.match_token(&TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(&TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(&TokenKind::Continue) {
            self.continue_statement();
        } else if self.match_token(&TokenKind::Throw) {
            self.throw_statement();
        } else if self.match_token(&TokenKind::Try) {
            self.try_statement();
        } else if self.match_token(&TokenKind::Yield) {
            self.yield_statement();
        } else if self.match_token(&TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "expected '}' after block");
    }

    fn expression_statement(&mut self) {
        self.expression();
        let at_top_level = self.functions.len() == 1
            && self.functions.last().unwrap().scope_depth == 0
            && self.namespaces.is_empty();

        if self.match_token(&TokenKind::Semicolon) {
            if at_top_level && self.check(&TokenKind::Eof) {
                // A trailing expression is the unit's value (REPL echo).
                self.emit_op(OpCode::Return);
            } else {
                self.emit_op(OpCode::Pop);
            }
        } else if at_top_level && self.check(&TokenKind::Eof) {
            self.emit_op(OpCode::Return);
        } else {
            self.error_at_current("expected ';' after expression");
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "expected '(' after 'if'");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after condition");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(&TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.functions.last().unwrap().chunk.len();
        self.consume(TokenKind::LeftParen, "expected '(' after 'while'");
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after condition");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);

        let scope_depth = self.functions.last().unwrap().scope_depth;
        let try_depth = self.functions.last().unwrap().try_depth;
        self.fun().loops.push(LoopContext {
            continue_target: loop_start,
            scope_depth,
            try_depth,
            breaks: Vec::new(),
        });

        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);

        let pending = self.fun().loops.pop().unwrap();
        for site in pending.breaks {
            self.patch_jump(site);
        }
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "expected '(' after 'for'");

        // Initializer clause
        if self.match_token(&TokenKind::Semicolon) {
            // none
        } else if self.match_token(&TokenKind::Let) {
            self.var_declaration(true);
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after loop initializer");
            self.emit_op(OpCode::Pop);
        }

        let mut loop_start = self.functions.last().unwrap().chunk.len();

        // Condition clause
        let mut exit_jump = None;
        if !self.match_token(&TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after loop condition");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        // Increment clause runs after the body, so jump over it.
        if !self.match_token(&TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.functions.last().unwrap().chunk.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "expected ')' after for clauses");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        let scope_depth = self.functions.last().unwrap().scope_depth;
        let try_depth = self.functions.last().unwrap().try_depth;
        self.fun().loops.push(LoopContext {
            continue_target: loop_start,
            scope_depth,
            try_depth,
            breaks: Vec::new(),
        });

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(OpCode::Pop);
        }

        let pending = self.fun().loops.pop().unwrap();
        for site in pending.breaks {
            self.patch_jump(site);
        }
        self.end_scope();
    }

    fn break_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "expected ';' after 'break'");
        let Some(context) = self.functions.last().unwrap().loops.last() else {
            self.error("'break' outside of a loop");
            return;
        };
        let scope_depth = context.scope_depth;
        let loop_try_depth = context.try_depth;
        self.discard_locals(scope_depth);
        let armed = self.functions.last().unwrap().try_depth - loop_try_depth;
        for _ in 0..armed {
            self.emit_op(OpCode::PopTry);
        }
        let site = self.emit_jump(OpCode::Jump);
        self.fun().loops.last_mut().unwrap().breaks.push(site);
    }

    fn continue_statement(&mut self) {
        self.consume(TokenKind::Semicolon, "expected ';' after 'continue'");
        let Some(context) = self.functions.last().unwrap().loops.last() else {
            self.error("'continue' outside of a loop");
            return;
        };
        let scope_depth = context.scope_depth;
        let loop_try_depth = context.try_depth;
        let target = context.continue_target;
        self.discard_locals(scope_depth);
        let armed = self.functions.last().unwrap().try_depth - loop_try_depth;
        for _ in 0..armed {
            self.emit_op(OpCode::PopTry);
        }
        self.emit_loop(target);
    }

    fn return_statement(&mut self) {
        if self.match_token(&TokenKind::Semicolon) {
            self.emit_implicit_return();
            return;
        }
        if self.functions.last().unwrap().kind == FunctionKind::Initializer {
            self.error("cannot return a value from an initializer");
        }
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after return value");
        self.emit_op(OpCode::Return);
    }

    fn throw_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after throw value");
        self.emit_op(OpCode::Throw);
    }

    fn yield_statement(&mut self) {
        if self.functions.last().unwrap().kind == FunctionKind::Script {
            self.error("'yield' outside of a function");
        }
        self.fun().is_generator = true;
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after yield value");
        self.emit_op(OpCode::Yield);
    }

    /// Compiles `try { .. } [catch (Filter name) { .. }] [finally { .. }]`.
    ///
    /// One handler is armed per region, carrying the filter-class constant,
    /// the catch address, and the finally address. The normal path and the
    /// catch fallthrough both funnel into the finally body behind a pushed
    /// control tag; the unwinder enters the finally address directly with
    /// its own tag.
    fn try_statement(&mut self) {
        self.emit_op(OpCode::SetupTry);
        let filter_operand = self.functions.last().unwrap().chunk.len();
        self.emit_u16(NO_TARGET);
        let handler_operand = self.functions.last().unwrap().chunk.len();
        self.emit_u16(NO_TARGET);
        let finally_operand = self.functions.last().unwrap().chunk.len();
        self.emit_u16(NO_TARGET);

        self.fun().try_depth += 1;
        self.consume(TokenKind::LeftBrace, "expected '{' after 'try'");
        self.begin_scope();
        self.block();
        self.end_scope();
        self.emit_op(OpCode::PopTry);
        self.fun().try_depth -= 1;

        let exit_jump = self.emit_jump(OpCode::Jump);

        let has_catch = self.match_token(&TokenKind::Catch);
        if has_catch {
            self.patch_jump(handler_operand);
            self.consume(TokenKind::LeftParen, "expected '(' after 'catch'");
            let first = self.consume_identifier("expected exception class or binding name");
            let binder = if self.check(&TokenKind::Identifier(String::new())) {
                // Typed: `catch (Filter name)`
                let filter = self.identifier_constant(&first);
                self.chunk_mut().patch_u16(filter_operand, filter);
                self.consume_identifier("expected binding name")
            } else {
                first
            };
            self.consume(TokenKind::RightParen, "expected ')' after catch binding");

            // The unwinder re-arms a follow-on handler so a finally still
            // covers the catch body; its disarm is emitted below.
            self.fun().try_depth += 1;
            self.begin_scope();
            self.add_local(&binder, false);
            self.mark_initialized();
            self.consume(TokenKind::LeftBrace, "expected '{' after catch binding");
            self.block();
            self.end_scope();
            self.emit_op(OpCode::PopTry);
            self.fun().try_depth -= 1;
        }

        let has_finally = self.match_token(&TokenKind::Finally);
        if !has_catch && !has_finally {
            self.error_at_current("expected 'catch' or 'finally' after try block");
        }

        self.patch_jump(exit_jump);
        if has_finally {
            // Normal entry: no exception in flight.
            self.emit_op(OpCode::Nil);
            self.emit_constant(Value::Int(0));
            let target = self.functions.last().unwrap().chunk.len();
            self.chunk_mut().patch_u16(finally_operand, target as u16);
            self.consume(TokenKind::LeftBrace, "expected '{' after 'finally'");
            self.begin_scope();
            self.block();
            self.end_scope();
            self.emit_op(OpCode::EndFinally);
        }
    }

    // ---- expressions -------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(&self.previous.kind).prefix else {
            self.error("expected expression");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(&self.current.kind).precedence {
            self.advance();
            let infix = rule(&self.previous.kind).infix.unwrap();
            infix(self, can_assign);
        }

        if can_assign && self.match_token(&TokenKind::Equal) {
            self.error("invalid assignment target");
        }
    }

    fn number(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::Int(value) => self.emit_constant(Value::Int(value)),
            TokenKind::Float(value) => self.emit_constant(Value::Float(value)),
            _ => unreachable!(),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        if let TokenKind::Str(text) = self.previous.kind.clone() {
            let handle = self.heap.intern(&text);
            self.emit_constant(Value::Obj(handle));
        }
    }

    /// Compiles an interpolated string as segment/expression concatenation.
    fn interpolation(&mut self, _can_assign: bool) {
        let TokenKind::Interpolation(segment) = self.previous.kind.clone() else {
            unreachable!()
        };
        let handle = self.heap.intern(&segment);
        self.emit_constant(Value::Obj(handle));

        loop {
            self.expression();
            self.emit_op(OpCode::Stringify);
            self.emit_op(OpCode::Add);

            match self.current.kind.clone() {
                TokenKind::Interpolation(segment) => {
                    self.advance();
                    if !segment.is_empty() {
                        let handle = self.heap.intern(&segment);
                        self.emit_constant(Value::Obj(handle));
                        self.emit_op(OpCode::Add);
                    }
                }
                TokenKind::Str(segment) => {
                    self.advance();
                    if !segment.is_empty() {
                        let handle = self.heap.intern(&segment);
                        self.emit_constant(Value::Obj(handle));
                        self.emit_op(OpCode::Add);
                    }
                    return;
                }
                _ => {
                    self.error_at_current("unterminated string interpolation");
                    return;
                }
            }
        }
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        if let TokenKind::Identifier(name) = self.previous.kind.clone() {
            self.named_variable(&name, can_assign);
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "expected ')' after expression");
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind.clone();
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            TokenKind::Tilde => self.emit_op(OpCode::BitNot),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind.clone();
        let precedence = rule(&operator).precedence;
        self.parse_precedence(precedence.next());

        let op = match operator {
            TokenKind::Plus => OpCode::Add,
            TokenKind::Minus => OpCode::Subtract,
            TokenKind::Star => OpCode::Multiply,
            TokenKind::Slash => OpCode::Divide,
            TokenKind::Percent => OpCode::Modulo,
            TokenKind::EqualEqual => OpCode::Equal,
            TokenKind::BangEqual => OpCode::NotEqual,
            TokenKind::Less => OpCode::Less,
            TokenKind::LessEqual => OpCode::LessEqual,
            TokenKind::Greater => OpCode::Greater,
            TokenKind::GreaterEqual => OpCode::GreaterEqual,
            TokenKind::Amp => OpCode::BitAnd,
            TokenKind::Pipe => OpCode::BitOr,
            TokenKind::Caret => OpCode::BitXor,
            TokenKind::LessLess => OpCode::ShiftLeft,
            TokenKind::GreaterGreater => OpCode::ShiftRight,
            _ => unreachable!(),
        };
        self.emit_op(op);
    }

    fn and_op(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_op(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn range(&mut self, _can_assign: bool) {
        self.parse_precedence(Precedence::Range.next());
        self.emit_op(OpCode::Range);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_u8(argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: usize = 0;
        if !self.check(&TokenKind::RightParen) {
            loop {
                self.expression();
                argc += 1;
                if argc > MAX_ARITY {
                    self.error("too many arguments");
                }
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expected ')' after arguments");
        argc.min(MAX_ARITY) as u8
    }

    fn dot(&mut self, can_assign: bool) {
        let name = self.consume_identifier("expected property name after '.'");
        let constant = self.identifier_constant(&name);

        if can_assign && self.match_token(&TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetProperty);
            self.emit_u16(constant);
        } else if self.match_token(&TokenKind::LeftParen) {
            // Fused get + call keeps the hot path free of bound methods.
            let argc = self.argument_list();
            self.emit_op(OpCode::Invoke);
            self.emit_u16(constant);
            self.emit_u8(argc);
        } else {
            self.emit_op(OpCode::GetProperty);
            self.emit_u16(constant);
        }
    }

    fn index(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "expected ']' after index");
        if can_assign && self.match_token(&TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetIndex);
        } else {
            self.emit_op(OpCode::GetIndex);
        }
    }

    fn array(&mut self, _can_assign: bool) {
        let mut count: usize = 0;
        if !self.check(&TokenKind::RightBracket) {
            loop {
                self.expression();
                count += 1;
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "expected ']' after array elements");
        self.emit_op(OpCode::Array);
        self.emit_u16(count.min(u16::MAX as usize) as u16);
    }

    fn dict(&mut self, _can_assign: bool) {
        let mut count: usize = 0;
        if !self.check(&TokenKind::RightBrace) {
            loop {
                self.expression();
                self.consume(TokenKind::Colon, "expected ':' after dictionary key");
                self.expression();
                count += 1;
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "expected '}' after dictionary entries");
        self.emit_op(OpCode::Dict);
        self.emit_u16(count.min(u16::MAX as usize) as u16);
    }

    fn lambda(&mut self, _can_assign: bool) {
        self.function(FunctionKind::Function, "anonymous");
    }

    fn this(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("'this' outside of a class");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.classes.last() {
            None => self.error("'super' outside of a class"),
            Some(context) if !context.has_superclass => {
                self.error("'super' in a class with no superclass")
            }
            _ => {}
        }
        self.consume(TokenKind::Dot, "expected '.' after 'super'");
        let name = self.consume_identifier("expected superclass method name");
        let constant = self.identifier_constant(&name);

        self.named_variable("this", false);
        if self.match_token(&TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit_op(OpCode::SuperInvoke);
            self.emit_u16(constant);
            self.emit_u8(argc);
        } else {
            self.named_variable("super", false);
            self.emit_op(OpCode::GetSuper);
            self.emit_u16(constant);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> (Heap, Handle) {
        let mut heap = Heap::new();
        let function = compile(source, &mut heap).expect("expected source to compile");
        (heap, function)
    }

    fn compile_err(source: &str) -> Vec<Diagnostic> {
        let mut heap = Heap::new();
        compile(source, &mut heap).expect_err("expected source to fail")
    }

    fn script_ops(heap: &Heap, function: Handle) -> Vec<OpCode> {
        let ObjData::Function(function) = &heap.get(function).data else {
            panic!("expected function");
        };
        let chunk = &function.chunk;
        let mut ops = Vec::new();
        let mut offset = 0;
        while offset < chunk.code.len() {
            let op = OpCode::from_byte(chunk.code[offset]).unwrap();
            ops.push(op);
            offset += 1 + operand_width(op);
        }
        ops
    }

    fn operand_width(op: OpCode) -> usize {
        match op {
            OpCode::Constant
            | OpCode::GetGlobal
            | OpCode::SetGlobal
            | OpCode::DefineGlobal
            | OpCode::DefineConst
            | OpCode::Jump
            | OpCode::JumpIfFalse
            | OpCode::Loop
            | OpCode::Class
            | OpCode::Method
            | OpCode::Getter
            | OpCode::Setter
            | OpCode::FieldDefault
            | OpCode::GetProperty
            | OpCode::SetProperty
            | OpCode::GetSuper
            | OpCode::Array
            | OpCode::Dict
            | OpCode::NamespaceBind => 2,
            OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetUpvalue
            | OpCode::SetUpvalue
            | OpCode::Call
            | OpCode::ReturnNonLocal => 1,
            OpCode::Invoke | OpCode::SuperInvoke | OpCode::Namespace => 3,
            OpCode::SetupTry => 6,
            // The tests below only decode closures without upvalue pairs.
            OpCode::Closure => 2,
            _ => 0,
        }
    }

    #[test]
    fn test_expression_chunk_shape() {
        let (heap, function) = compile_ok("1 + 2;");
        // The trailing expression becomes the script's return value.
        assert_eq!(
            script_ops(&heap, function),
            vec![
                OpCode::Constant,
                OpCode::Constant,
                OpCode::Add,
                OpCode::Return,
                OpCode::Nil,
                OpCode::Return,
            ]
        );
    }

    #[test]
    fn test_global_declaration() {
        let (heap, function) = compile_ok("let x = 1; const K = 2;");
        let ops = script_ops(&heap, function);
        assert!(ops.contains(&OpCode::DefineGlobal));
        assert!(ops.contains(&OpCode::DefineConst));
    }

    #[test]
    fn test_lines_parallel_to_code() {
        let (heap, function) = compile_ok("let a = 1;\nlet b = 2;\n");
        let ObjData::Function(function) = &heap.get(function).data else {
            panic!("expected function");
        };
        assert_eq!(function.chunk.code.len(), function.chunk.lines.len());
        assert!(function.chunk.lines.contains(&1));
        assert!(function.chunk.lines.contains(&2));
    }

    #[test]
    fn test_jump_targets_inside_chunk() {
        let (heap, function) = compile_ok("if (true) { 1; } else { 2; }");
        let ObjData::Function(function) = &heap.get(function).data else {
            panic!("expected function");
        };
        let chunk = &function.chunk;
        let mut offset = 0;
        while offset < chunk.code.len() {
            let op = OpCode::from_byte(chunk.code[offset]).unwrap();
            if matches!(op, OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop) {
                let target = chunk.read_u16(offset + 1) as usize;
                assert!(target < chunk.code.len(), "jump target out of chunk");
            }
            offset += 1 + operand_width(op);
        }
    }

    #[test]
    fn test_every_error_is_collected() {
        let diagnostics = compile_err("let = 1; let y 2; 1 +;");
        assert!(diagnostics.len() >= 2, "panic mode should recover per statement");
    }

    #[test]
    fn test_assignment_to_const_local_is_an_error() {
        let diagnostics = compile_err("function f() { const k = 1; k = 2; } ");
        assert!(diagnostics[0].message.contains("cannot assign to constant"));
    }

    #[test]
    fn test_duplicate_local_is_an_error() {
        let diagnostics = compile_err("function f() { let a = 1; let a = 2; }");
        assert!(diagnostics[0].message.contains("already declared"));
    }

    #[test]
    fn test_shadowing_in_nested_scope_is_allowed() {
        compile_ok("function f() { let a = 1; { let a = 2; } return a; }");
    }

    #[test]
    fn test_this_outside_class_is_an_error() {
        let diagnostics = compile_err("this;");
        assert!(diagnostics[0].message.contains("'this'"));
    }

    #[test]
    fn test_super_without_superclass_is_an_error() {
        let diagnostics = compile_err("class A { function f() { return super.f(); } }");
        assert!(diagnostics[0].message.contains("no superclass"));
    }

    #[test]
    fn test_break_outside_loop_is_an_error() {
        let diagnostics = compile_err("break;");
        assert!(diagnostics[0].message.contains("outside of a loop"));
    }

    #[test]
    fn test_try_requires_catch_or_finally() {
        let diagnostics = compile_err("try { 1; }");
        assert!(diagnostics[0].message.contains("'catch' or 'finally'"));
    }

    #[test]
    fn test_yield_marks_generator() {
        let (heap, function) = compile_ok("function g() { yield 1; }");
        let ObjData::Function(script) = &heap.get(function).data else {
            panic!("expected function");
        };
        let nested = script
            .chunk
            .constants
            .iter()
            .find_map(|constant| match constant {
                Value::Obj(handle) => match &heap.get(*handle).data {
                    ObjData::Function(f) if f.name == "g" => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .expect("nested function constant");
        assert!(nested.is_generator);
    }

    #[test]
    fn test_variadic_function() {
        let (heap, function) = compile_ok("function f(...args) { return args; }");
        let ObjData::Function(script) = &heap.get(function).data else {
            panic!("expected function");
        };
        let nested = script
            .chunk
            .constants
            .iter()
            .find_map(|constant| match constant {
                Value::Obj(handle) => match &heap.get(*handle).data {
                    ObjData::Function(f) if f.name == "f" => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .expect("nested function constant");
        assert!(nested.is_variadic);
        assert_eq!(nested.arity, 1);
    }

    #[test]
    fn test_setup_try_operands_are_patched() {
        let (heap, function) =
            compile_ok("try { 1; } catch (e) { 2; } finally { 3; }");
        let ObjData::Function(script) = &heap.get(function).data else {
            panic!("expected function");
        };
        let chunk = &script.chunk;
        assert_eq!(OpCode::from_byte(chunk.code[0]), Some(OpCode::SetupTry));
        let filter = chunk.read_u16(1);
        let handler = chunk.read_u16(3);
        let finally = chunk.read_u16(5);
        assert_eq!(filter, NO_TARGET); // untyped catch
        assert_ne!(handler, NO_TARGET);
        assert_ne!(finally, NO_TARGET);
        assert!((handler as usize) < chunk.code.len());
        assert!((finally as usize) < chunk.code.len());
    }
}
