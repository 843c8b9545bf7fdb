// I found https://matklad.github.io/2020/04/13/simple-but-powerful-pratt-parsing.html
// to be a very helpful guide to writing a Pratt parser in Rust.
//
// This is a single pass compiler: there is no syntax tree, every parse function emits bytecode into the chunk of the
// function currently being compiled as soon as it has recognized enough of the input.

use std::borrow::Cow;
use std::rc::Rc;

use crate::{
    chunk::{Chunk, Instruction},
    error::{CompileError, Diagnostic},
    heap::{Heap, HeapRef, Marker, Roots},
    object::{Function, Object},
    scanner::{Scanner, Token, TokenType},
    value::Value,
};

// Slot, constant and upvalue indices are all one byte.
const UINT8_COUNT: usize = u8::MAX as usize + 1;
const MAX_ARITY: usize = u8::MAX as usize;

mod precedence {
    // The book uses a C enum. The key, really, is a comparable enum, thus we derive Ord.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    pub enum Precedence {
        Bottom,
        Assignment,
        Or,
        And,
        Equality,
        Comparison,
        Term,
        Factor,
        Unary,
        Call,
        Primary,
        Top,
    }
    use Precedence::*;

    impl Precedence {
        /// One level tighter. Left-associative operators parse their right operand at this level.
        pub fn next(&self) -> Precedence {
            match self {
                Bottom => Assignment,
                Assignment => Or,
                Or => And,
                And => Equality,
                Equality => Comparison,
                Comparison => Term,
                Term => Factor,
                Factor => Unary,
                Unary => Call,
                Call => Primary,
                Primary => Top,
                Top => Top,
            }
        }
    }
}

use precedence::Precedence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug)]
struct Local<'a> {
    name: Cow<'a, str>,
    // None between declaration and the end of the initializer.
    depth: Option<usize>,
    is_captured: bool,
}

/// Where a closure gets one of its upvalues from when it's created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueCapture {
    index: u8,
    // A local slot of the enclosing function if true, otherwise one of the enclosing function's own upvalues.
    is_local: bool,
}

// Everything about a function that's still being compiled.
#[derive(Debug)]
struct FunctionState<'a> {
    kind: FunctionKind,
    name: Option<HeapRef>,
    arity: usize,
    chunk: Chunk,
    locals: Vec<Local<'a>>,
    upvalues: Vec<UpvalueCapture>,
    scope_depth: usize,
}

impl<'a> FunctionState<'a> {
    fn new(kind: FunctionKind, name: Option<HeapRef>) -> Self {
        // Slot zero holds the receiver in methods, and the called function otherwise; it can't be named by user code.
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            FunctionKind::Function | FunctionKind::Script => "",
        };
        FunctionState {
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![Local {
                name: Cow::Borrowed(slot_zero),
                depth: Some(0),
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

#[derive(Debug)]
struct ClassState {
    has_superclass: bool,
}

// Objects reachable from the functions under construction, which only exist as Rust values until they're finished.
struct CompilerRoots<'r, 'a> {
    current: &'r FunctionState<'a>,
    enclosing: &'r [FunctionState<'a>],
    outer: &'r dyn Roots,
}

impl Roots for CompilerRoots<'_, '_> {
    fn mark_roots(&self, marker: &mut Marker) {
        self.outer.mark_roots(marker);
        for function in self.enclosing.iter().chain(std::iter::once(self.current)) {
            if let Some(name) = &function.name {
                marker.mark_object(name);
            }
            for constant in function.chunk.constants() {
                marker.mark_value(constant);
            }
        }
    }
}

type ParseFn<'a, 'h> = fn(&mut Parser<'a, 'h>, bool);

struct ParseRule<'a, 'h> {
    prefix: Option<ParseFn<'a, 'h>>,
    infix: Option<ParseFn<'a, 'h>>,
    precedence: Precedence,
}

// Parser takes a source of tokens, and spits out a function.
// Errors are collected rather than printed; the public API for Parser is the compile() function.
struct Parser<'a, 'h> {
    tokens: Scanner<'a>,
    current_token: Token<'a>,
    previous_token: Token<'a>,
    heap: &'h mut Heap,
    outer_roots: &'h dyn Roots,
    function: FunctionState<'a>,
    enclosing: Vec<FunctionState<'a>>,
    classes: Vec<ClassState>,
    diagnostics: Vec<Diagnostic>,
    in_panic_mode: bool,
    print_code: bool,
}

impl<'a, 'h> Parser<'a, 'h> {
    fn new(source: &'a str, heap: &'h mut Heap, outer_roots: &'h dyn Roots) -> Self {
        Parser {
            tokens: Scanner::new(source),
            current_token: Token::synthetic(TokenType::Eof, "", 1),
            previous_token: Token::synthetic(TokenType::Eof, "", 1),
            heap,
            outer_roots,
            function: FunctionState::new(FunctionKind::Script, None),
            enclosing: Vec::new(),
            classes: Vec::new(),
            diagnostics: Vec::new(),
            in_panic_mode: false,
            print_code: false,
        }
    }

    // The book uses an array indexed by the token type, but that's really just a match statement.
    fn rule(typ: TokenType) -> ParseRule<'a, 'h> {
        let (prefix, infix, precedence): (Option<ParseFn<'a, 'h>>, Option<ParseFn<'a, 'h>>, _) =
            match typ {
                TokenType::LeftParen => (Some(Self::grouping), Some(Self::call), Precedence::Call),
                TokenType::Dot => (None, Some(Self::dot), Precedence::Call),
                TokenType::Minus => (Some(Self::unary), Some(Self::binary), Precedence::Term),
                TokenType::Plus => (None, Some(Self::binary), Precedence::Term),
                TokenType::Slash | TokenType::Star => {
                    (None, Some(Self::binary), Precedence::Factor)
                }
                TokenType::Bang => (Some(Self::unary), None, Precedence::Bottom),
                TokenType::BangEqual | TokenType::EqualEqual => {
                    (None, Some(Self::binary), Precedence::Equality)
                }
                TokenType::Greater
                | TokenType::GreaterEqual
                | TokenType::Less
                | TokenType::LessEqual => (None, Some(Self::binary), Precedence::Comparison),
                TokenType::Identifier => (Some(Self::variable), None, Precedence::Bottom),
                TokenType::String => (Some(Self::string), None, Precedence::Bottom),
                TokenType::Number => (Some(Self::number), None, Precedence::Bottom),
                TokenType::And => (None, Some(Self::and), Precedence::And),
                TokenType::Or => (None, Some(Self::or), Precedence::Or),
                TokenType::False | TokenType::Nil | TokenType::True => {
                    (Some(Self::literal), None, Precedence::Bottom)
                }
                TokenType::Super => (Some(Self::super_), None, Precedence::Bottom),
                TokenType::This => (Some(Self::this), None, Precedence::Bottom),
                _ => (None, None, Precedence::Bottom),
            };
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }

    fn compile(mut self) -> Result<HeapRef, CompileError> {
        self.advance();
        while !self.match_token(TokenType::Eof) {
            self.declaration();
        }
        if !self.diagnostics.is_empty() {
            return Err(CompileError {
                diagnostics: self.diagnostics,
            });
        }
        let (script, _) = self.end_function();
        Ok(script)
    }

    // --- tokens ---

    fn advance(&mut self) {
        let line = self.current_token.line;
        let next = loop {
            let next = self
                .tokens
                .next()
                .unwrap_or_else(|| Token::synthetic(TokenType::Eof, "", line));
            if let TokenType::Error = next.typ {
                self.error_at(&next, &next.raw);
            } else {
                break next;
            }
        };
        self.previous_token = std::mem::replace(&mut self.current_token, next);
    }

    fn check(&self, typ: TokenType) -> bool {
        self.current_token.typ == typ
    }

    fn match_token(&mut self, typ: TokenType) -> bool {
        if self.check(typ) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, expected_type: TokenType, message_if_missing: &str) {
        if self.check(expected_type) {
            self.advance();
        } else {
            self.error_at_current(message_if_missing);
        }
    }

    // --- emitting ---

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.function.chunk
    }

    fn write_instruction(&mut self, instruction: Instruction) -> usize {
        let line = self.previous_token.line;
        self.current_chunk().write_instruction(instruction, line)
    }

    fn write_byte(&mut self, byte: u8) {
        let line = self.previous_token.line;
        self.current_chunk().write_byte(byte, line)
    }

    fn emit_return(&mut self) {
        if self.function.kind == FunctionKind::Initializer {
            self.write_instruction(Instruction::GetLocal(0));
        } else {
            self.write_instruction(Instruction::Nil);
        }
        self.write_instruction(Instruction::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.current_chunk().add_constant(value) {
            Ok(idx) => idx,
            Err(_) => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.write_instruction(Instruction::Constant(idx));
    }

    // Emits a forward jump with a placeholder offset and returns where the offset lives, for patch_jump.
    fn emit_jump(&mut self, jump: fn(u16) -> Instruction) -> usize {
        self.write_instruction(jump(u16::MAX)) + 1
    }

    fn patch_jump(&mut self, operand_offset: usize) {
        // -2 for the operand itself, the VM has read it by the time it jumps
        let distance = self.current_chunk().len() - operand_offset - 2;
        match u16::try_from(distance) {
            Ok(distance) => self.current_chunk().patch_u16(operand_offset, distance),
            Err(_) => self.error("Too much code to jump over."),
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        // +3 for the loop instruction itself
        let distance = self.current_chunk().len() + 3 - loop_start;
        match u16::try_from(distance) {
            Ok(distance) => {
                self.write_instruction(Instruction::Loop(distance));
            }
            Err(_) => self.error("Loop body too large."),
        }
    }

    // --- allocation ---

    fn intern(&mut self, chars: &str) -> HeapRef {
        let roots = CompilerRoots {
            current: &self.function,
            enclosing: &self.enclosing,
            outer: self.outer_roots,
        };
        self.heap.intern(chars, &roots)
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let string = self.intern(name);
        self.make_constant(Value::Object(string))
    }

    // --- functions and scopes ---

    fn begin_function(&mut self, kind: FunctionKind, name: HeapRef) {
        let outer = std::mem::replace(&mut self.function, FunctionState::new(kind, Some(name)));
        self.enclosing.push(outer);
    }

    // Finish the current function, move it onto the heap and go back to compiling the enclosing one.
    fn end_function(&mut self) -> (HeapRef, Vec<UpvalueCapture>) {
        self.emit_return();
        let finished = match self.enclosing.pop() {
            Some(outer) => std::mem::replace(&mut self.function, outer),
            None => std::mem::replace(
                &mut self.function,
                FunctionState::new(FunctionKind::Script, None),
            ),
        };
        if self.print_code && self.diagnostics.is_empty() {
            let title = match &finished.name {
                Some(name) => name.string_contents(),
                None => "<script>".to_string(),
            };
            tracing::debug!("\n{}", finished.chunk.disassemble(&title));
        }

        let function = Function {
            arity: finished.arity,
            chunk: Rc::new(finished.chunk),
            name: finished.name,
            upvalue_count: finished.upvalues.len(),
        };
        let roots = CompilerRoots {
            current: &self.function,
            enclosing: &self.enclosing,
            outer: self.outer_roots,
        };
        let function = self.heap.alloc(Object::Function(function), &roots);
        (function, finished.upvalues)
    }

    fn begin_scope(&mut self) {
        self.function.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.function.scope_depth -= 1;
        let depth = self.function.scope_depth;
        while let Some(local) = self.function.locals.last() {
            if local.depth.map_or(true, |d| d <= depth) {
                break;
            }
            let instruction = if local.is_captured {
                Instruction::CloseUpvalue
            } else {
                Instruction::Pop
            };
            self.function.locals.pop();
            self.write_instruction(instruction);
        }
    }

    fn add_local(&mut self, name: Cow<'a, str>) {
        if self.function.locals.len() == UINT8_COUNT {
            self.error("Too many local variables in function.");
            return;
        }
        self.function.locals.push(Local {
            name,
            depth: None,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.function.scope_depth == 0 {
            return;
        }
        let name = self.previous_token.raw.clone();
        let depth = self.function.scope_depth;
        let already_declared = self
            .function
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth.map_or(true, |d| d >= depth))
            .any(|local| local.name == name);
        if already_declared {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenType::Identifier, message);
        self.declare_variable();
        if self.function.scope_depth > 0 {
            return 0;
        }
        let name = self.previous_token.raw.clone();
        self.identifier_constant(&name)
    }

    fn mark_initialized(&mut self) {
        let depth = self.function.scope_depth;
        if depth == 0 {
            return;
        }
        if let Some(local) = self.function.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.function.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.write_instruction(Instruction::DefineGlobal(global));
    }

    // `level` counts functions from the outermost (the script) inwards; the current function is at enclosing.len().
    fn function_at(&mut self, level: usize) -> &mut FunctionState<'a> {
        if level == self.enclosing.len() {
            &mut self.function
        } else {
            &mut self.enclosing[level]
        }
    }

    fn resolve_local(&mut self, level: usize, name: &str) -> Option<u8> {
        let found = self
            .function_at(level)
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)
            .map(|(slot, local)| (slot, local.depth.is_none()));
        let (slot, uninitialized) = found?;
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        // at most UINT8_COUNT locals, so the slot always fits
        u8::try_from(slot).ok()
    }

    fn resolve_upvalue(&mut self, level: usize, name: &str) -> Option<u8> {
        if level == 0 {
            return None;
        }
        if let Some(slot) = self.resolve_local(level - 1, name) {
            self.function_at(level - 1).locals[usize::from(slot)].is_captured = true;
            return Some(self.add_upvalue(level, slot, true));
        }
        let index = self.resolve_upvalue(level - 1, name)?;
        Some(self.add_upvalue(level, index, false))
    }

    fn add_upvalue(&mut self, level: usize, index: u8, is_local: bool) -> u8 {
        let capture = UpvalueCapture { index, is_local };
        let upvalues = &self.function_at(level).upvalues;
        if let Some(existing) = upvalues.iter().position(|u| *u == capture) {
            return existing as u8;
        }
        if upvalues.len() == UINT8_COUNT {
            self.error("Too many closure variables in function.");
            return 0;
        }
        let upvalues = &mut self.function_at(level).upvalues;
        upvalues.push(capture);
        (upvalues.len() - 1) as u8
    }

    // --- declarations and statements ---

    fn declaration(&mut self) {
        if self.match_token(TokenType::Class) {
            self.class_declaration();
        } else if self.match_token(TokenType::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenType::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.in_panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect class name.");
        let class_name = self.previous_token.raw.clone();
        let name_constant = self.identifier_constant(&class_name);
        self.declare_variable();

        self.write_instruction(Instruction::Class(name_constant));
        self.define_variable(name_constant);

        self.classes.push(ClassState {
            has_superclass: false,
        });

        if self.match_token(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expect superclass name.");
            self.variable(false);
            if self.previous_token.raw == class_name {
                self.error("A class can't inherit from itself.");
            }

            // The superclass lives in a local named `super` for as long as the class body, so that methods can
            // capture it as an upvalue.
            self.begin_scope();
            self.add_local(Cow::Borrowed("super"));
            self.define_variable(0);

            self.named_variable(&class_name, false);
            self.write_instruction(Instruction::Inherit);
            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(&class_name, false);
        self.consume(TokenType::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.method();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after class body.");
        self.write_instruction(Instruction::Pop);

        if self.classes.pop().map_or(false, |c| c.has_superclass) {
            self.end_scope();
        }
    }

    fn method(&mut self) {
        self.consume(TokenType::Identifier, "Expect method name.");
        let name = self.previous_token.raw.clone();
        let constant = self.identifier_constant(&name);
        let kind = if name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.write_instruction(Instruction::Method(constant));
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // A function may refer to itself, so it's usable as soon as it's declared.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = self.previous_token.raw.clone();
        let name = self.intern(&name);
        self.begin_function(kind, name);
        self.begin_scope();

        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenType::RightParen) {
            loop {
                self.function.arity += 1;
                if self.function.arity > MAX_ARITY {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block();

        // No end_scope: the frame's slots all go away when it returns.
        let (function, upvalues) = self.end_function();
        let constant = self.make_constant(Value::Object(function));
        self.write_instruction(Instruction::Closure(constant));
        for upvalue in upvalues {
            self.write_byte(u8::from(upvalue.is_local));
            self.write_byte(upvalue.index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenType::Equal) {
            self.expression();
        } else {
            self.write_instruction(Instruction::Nil);
        }
        self.consume(
            TokenType::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.match_token(TokenType::Print) {
            self.print_statement();
        } else if self.match_token(TokenType::For) {
            self.for_statement();
        } else if self.match_token(TokenType::If) {
            self.if_statement();
        } else if self.match_token(TokenType::Return) {
            self.return_statement();
        } else if self.match_token(TokenType::While) {
            self.while_statement();
        } else if self.match_token(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        self.write_instruction(Instruction::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.write_instruction(Instruction::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(Instruction::JumpIfFalse);
        self.write_instruction(Instruction::Pop);
        self.statement();
        let else_jump = self.emit_jump(Instruction::Jump);

        self.patch_jump(then_jump);
        self.write_instruction(Instruction::Pop);
        if self.match_token(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();
        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Instruction::JumpIfFalse);
        self.write_instruction(Instruction::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.write_instruction(Instruction::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenType::Semicolon) {
            // no initializer
        } else if self.match_token(TokenType::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump = None;
        if !self.match_token(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Instruction::JumpIfFalse));
            self.write_instruction(Instruction::Pop);
        }

        // The increment clause comes before the body in the source but runs after it, so jump over it now and
        // loop back to it from the end of the body.
        if !self.match_token(TokenType::RightParen) {
            let body_jump = self.emit_jump(Instruction::Jump);
            let increment_start = self.current_chunk().len();
            self.expression();
            self.write_instruction(Instruction::Pop);
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.write_instruction(Instruction::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.function.kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenType::Semicolon) {
            self.emit_return();
        } else {
            if self.function.kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.write_instruction(Instruction::Return);
        }
    }

    // Skip tokens until something that looks like the start of a statement, so one mistake doesn't cascade.
    fn synchronize(&mut self) {
        self.in_panic_mode = false;
        while !self.check(TokenType::Eof) {
            if self.previous_token.typ == TokenType::Semicolon {
                return;
            }
            match self.current_token.typ {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return => return,
                _ => self.advance(),
            }
        }
    }

    // --- expressions ---

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    // The contract of this function is to consume an expression whose operators all bind at least as tightly as
    // `min_precedence`, and emit bytecode for it to the chunk, e.g. for 1 + 2 two constant instructions then an add.
    fn parse_precedence(&mut self, min_precedence: Precedence) {
        self.advance();
        let prefix = match Self::rule(self.previous_token.typ).prefix {
            Some(prefix) => prefix,
            None => {
                self.error("Expect expression.");
                return;
            }
        };
        // Only a low-precedence context may treat a following `=` as assignment, otherwise `a * b = c` would parse.
        let can_assign = min_precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while min_precedence <= Self::rule(self.current_token.typ).precedence {
            self.advance();
            if let Some(infix) = Self::rule(self.previous_token.typ).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        match self.previous_token.raw.parse::<f64>() {
            Ok(number) => self.emit_constant(Value::Number(number)),
            Err(_) => self.error("Invalid number literal."),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        let contents = self.previous_token.string_contents().to_string();
        let string = self.intern(&contents);
        self.emit_constant(Value::Object(string));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous_token.typ {
            TokenType::False => self.write_instruction(Instruction::False),
            TokenType::True => self.write_instruction(Instruction::True),
            _ => self.write_instruction(Instruction::Nil),
        };
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous_token.typ;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenType::Bang => self.write_instruction(Instruction::Not),
            _ => self.write_instruction(Instruction::Negate),
        };
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous_token.typ;
        self.parse_precedence(Self::rule(operator).precedence.next());
        let (first, negate) = match operator {
            TokenType::BangEqual => (Instruction::Equal, true),
            TokenType::EqualEqual => (Instruction::Equal, false),
            TokenType::Greater => (Instruction::Greater, false),
            TokenType::GreaterEqual => (Instruction::Less, true),
            TokenType::Less => (Instruction::Less, false),
            TokenType::LessEqual => (Instruction::Greater, true),
            TokenType::Plus => (Instruction::Add, false),
            TokenType::Minus => (Instruction::Subtract, false),
            TokenType::Star => (Instruction::Multiply, false),
            _ => (Instruction::Divide, false),
        };
        self.write_instruction(first);
        if negate {
            self.write_instruction(Instruction::Not);
        }
    }

    fn and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(Instruction::JumpIfFalse);
        self.write_instruction(Instruction::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(Instruction::JumpIfFalse);
        let end_jump = self.emit_jump(Instruction::Jump);
        self.patch_jump(else_jump);
        self.write_instruction(Instruction::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous_token.raw.clone();
        self.named_variable(&name, can_assign);
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let level = self.enclosing.len();
        let (get, set) = if let Some(slot) = self.resolve_local(level, name) {
            (Instruction::GetLocal(slot), Instruction::SetLocal(slot))
        } else if let Some(index) = self.resolve_upvalue(level, name) {
            (Instruction::GetUpvalue(index), Instruction::SetUpvalue(index))
        } else {
            let constant = self.identifier_constant(name);
            (Instruction::GetGlobal(constant), Instruction::SetGlobal(constant))
        };

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.write_instruction(set);
        } else {
            self.write_instruction(get);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if count == MAX_ARITY {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        u8::try_from(count).unwrap_or(u8::MAX)
    }

    fn call(&mut self, _can_assign: bool) {
        let count = self.argument_list();
        self.write_instruction(Instruction::Call(count));
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenType::Identifier, "Expect property name after '.'.");
        let name = self.previous_token.raw.clone();
        let name = self.identifier_constant(&name);

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.write_instruction(Instruction::SetProperty(name));
        } else if self.match_token(TokenType::LeftParen) {
            let count = self.argument_list();
            self.write_instruction(Instruction::Invoke(name, count));
        } else {
            self.write_instruction(Instruction::GetProperty(name));
        }
    }

    fn this(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.classes.last().map(|class| class.has_superclass) {
            None => self.error("Can't use 'super' outside of a class."),
            Some(false) => self.error("Can't use 'super' in a class with no superclass."),
            Some(true) => {}
        }
        self.consume(TokenType::Dot, "Expect '.' after 'super'.");
        self.consume(TokenType::Identifier, "Expect superclass method name.");
        let name = self.previous_token.raw.clone();
        let name = self.identifier_constant(&name);

        self.named_variable("this", false);
        if self.match_token(TokenType::LeftParen) {
            let count = self.argument_list();
            self.named_variable("super", false);
            self.write_instruction(Instruction::SuperInvoke(name, count));
        } else {
            self.named_variable("super", false);
            self.write_instruction(Instruction::GetSuper(name));
        }
    }

    // --- errors ---

    fn error(&mut self, message: &str) {
        // This clone is a bit ugly, but error_at needs &mut self to record the diagnostic
        let token = self.previous_token.clone();
        self.error_at(&token, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current_token.clone();
        self.error_at(&token, message);
    }

    fn error_at(&mut self, token: &Token<'a>, message: &str) {
        if self.in_panic_mode {
            return;
        }
        self.in_panic_mode = true;
        let location = match token.typ {
            TokenType::Eof => " at end".to_string(),
            TokenType::Error => String::new(),
            _ => format!(" at '{}'", token.raw),
        };
        self.diagnostics.push(Diagnostic {
            line: token.line,
            location,
            message: message.to_string(),
        });
    }
}

/// Compile a whole program into its top-level function.
///
/// Strings and functions are allocated on `heap` as they're compiled. If that triggers a collection, whatever `roots`
/// marks survives along with everything the compiler itself holds on to. If any diagnostic was reported, no function
/// is returned.
pub fn compile(source: &str, heap: &mut Heap, roots: &dyn Roots) -> Result<HeapRef, CompileError> {
    compile_with_listing(source, heap, roots, false)
}

/// Same as compile, but optionally logs the disassembly of each finished function at debug level.
pub fn compile_with_listing(
    source: &str,
    heap: &mut Heap,
    roots: &dyn Roots,
    print_code: bool,
) -> Result<HeapRef, CompileError> {
    let mut parser = Parser::new(source, heap, roots);
    parser.print_code = print_code;
    parser.compile()
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn compile_errors(source: &str) -> Vec<String> {
        let mut heap = Heap::new();
        match compile(source, &mut heap, &()) {
            Ok(_) => vec![],
            Err(e) => e.diagnostics.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn script_chunk(source: &str) -> String {
        let mut heap = Heap::new();
        let script = compile(source, &mut heap, &()).expect("compiling succeeds");
        script.with(|o| o.as_function().unwrap().chunk.disassemble("test"))
    }

    #[test]
    fn test_arithmetic_precedence() {
        let listing = script_chunk("print (1 + 3) / -(-1 + -2) * 2;");
        let ops: Vec<&str> = listing
            .lines()
            .skip(1)
            .map(|l| l.split_whitespace().nth(2).unwrap())
            .collect();
        assert_eq!(
            ops,
            vec![
                "OP_CONSTANT",
                "OP_CONSTANT",
                "OP_ADD",
                "OP_CONSTANT",
                "OP_NEGATE",
                "OP_CONSTANT",
                "OP_NEGATE",
                "OP_ADD",
                "OP_NEGATE",
                "OP_DIVIDE",
                "OP_CONSTANT",
                "OP_MULTIPLY",
                "OP_PRINT",
                "OP_NIL",
                "OP_RETURN",
            ]
        );
    }

    #[test]
    fn closures_record_captures() {
        let mut heap = Heap::new();
        let script = compile(
            "fun outer() { var a = 1; var b = 2; fun inner() { return b + a + b; } return inner; }",
            &mut heap,
            &(),
        )
        .unwrap();
        // outer is the first function constant of the script, inner the first of outer
        let find_function = |f: &HeapRef| -> HeapRef {
            f.with(|o| {
                o.as_function()
                    .unwrap()
                    .chunk
                    .constants()
                    .iter()
                    .filter_map(Value::as_object)
                    .find(|c| c.with(|o| o.as_function().is_some()))
                    .cloned()
                    .unwrap()
            })
        };
        let outer = find_function(&script);
        let inner = find_function(&outer);
        assert_eq!(inner.with(|o| o.as_function().unwrap().upvalue_count), 2);
        assert_eq!(outer.with(|o| o.as_function().unwrap().upvalue_count), 0);
        let listing = outer.with(|o| o.as_function().unwrap().chunk.disassemble("outer"));
        assert!(listing.contains("local 2"), "{}", listing);
        assert!(listing.contains("local 1"), "{}", listing);
    }

    #[test]
    fn reports_several_errors_in_one_pass() {
        let errors = compile_errors("print 1 +;\nvar = 3;\nprint (2;");
        assert_eq!(
            errors,
            vec![
                "[line 1] Error at ';': Expect expression.",
                "[line 2] Error at '=': Expect variable name.",
                "[line 3] Error at ';': Expect ')' after expression.",
            ]
        );
    }

    #[test]
    fn error_at_end_and_lexical_errors() {
        assert_eq!(
            compile_errors("print 1"),
            vec!["[line 1] Error at end: Expect ';' after value."]
        );
        assert_eq!(
            compile_errors("print \"oops;"),
            vec!["[line 1] Error: Unterminated string."]
        );
    }

    #[test]
    fn invalid_assignment_target() {
        assert_eq!(
            compile_errors("var a; var b; a + b = 3;"),
            vec!["[line 1] Error at '=': Invalid assignment target."]
        );
    }

    #[test]
    fn too_many_constants() {
        let ok: String = (0..256).map(|i| format!("print {};", i)).collect();
        assert_eq!(compile_errors(&ok), Vec::<String>::new());

        let too_many: String = (0..257).map(|i| format!("print {};", i)).collect();
        let errors = compile_errors(&too_many);
        assert_eq!(errors.len(), 1);
        assert!(
            errors[0].ends_with("Too many constants in one chunk."),
            "{:?}",
            errors
        );

        // the same literal over and over is a single constant
        let repeated: String = (0..1000).map(|_| "print 1;").collect();
        assert_eq!(compile_errors(&repeated), Vec::<String>::new());
    }

    #[test]
    fn too_many_parameters() {
        let params: Vec<String> = (0..257).map(|i| format!("p{}", i)).collect();
        let source = format!("fun f({}) {{}}", params.join(", "));
        let errors = compile_errors(&source);
        assert_eq!(errors.len(), 1);
        assert!(
            errors[0].ends_with("Can't have more than 255 parameters."),
            "{:?}",
            errors
        );

        let params: Vec<String> = (0..255).map(|i| format!("p{}", i)).collect();
        let source = format!("fun f({}) {{}}", params.join(", "));
        assert_eq!(compile_errors(&source), Vec::<String>::new());
    }

    #[test]
    fn too_many_arguments() {
        let args: Vec<String> = (0..256).map(|_| "nil".to_string()).collect();
        let source = format!("fun f() {{}} f({});", args.join(", "));
        let errors = compile_errors(&source);
        assert!(
            errors[0].ends_with("Can't have more than 255 arguments."),
            "{:?}",
            errors
        );
    }

    #[test]
    fn too_many_locals() {
        let vars: String = (0..256).map(|i| format!("var v{};", i)).collect();
        let errors = compile_errors(&format!("fun f() {{ {} }}", vars));
        assert_eq!(errors.len(), 1);
        assert!(
            errors[0].ends_with("Too many local variables in function."),
            "{:?}",
            errors
        );

        let vars: String = (0..255).map(|i| format!("var v{};", i)).collect();
        assert_eq!(
            compile_errors(&format!("fun f() {{ {} }}", vars)),
            Vec::<String>::new()
        );
    }

    #[test]
    fn too_many_upvalues() {
        let outer_vars: String = (0..200).map(|i| format!("var a{};", i)).collect();
        let middle_vars: String = (0..100).map(|i| format!("var b{};", i)).collect();
        let uses: String = (0..200)
            .map(|i| format!("a{};", i))
            .chain((0..100).map(|i| format!("b{};", i)))
            .collect();
        let source = format!(
            "fun outer() {{ {} fun middle() {{ {} fun inner() {{ {} }} }} }}",
            outer_vars, middle_vars, uses
        );
        let errors = compile_errors(&source);
        assert!(!errors.is_empty());
        assert!(
            errors
                .iter()
                .all(|e| e.ends_with("Too many closure variables in function.")),
            "{:?}",
            errors
        );
    }

    #[test]
    fn static_errors() {
        let cases = [
            ("return 1;", "Can't return from top-level code."),
            (
                "class A { init() { return 1; } }",
                "Can't return a value from an initializer.",
            ),
            ("class A < A {}", "A class can't inherit from itself."),
            ("print this;", "Can't use 'this' outside of a class."),
            ("fun f() { super.x(); }", "Can't use 'super' outside of a class."),
            (
                "class A { f() { super.f(); } }",
                "Can't use 'super' in a class with no superclass.",
            ),
            (
                "{ var a = 1; var a = 2; }",
                "Already a variable with this name in this scope.",
            ),
            (
                "{ var a = a; }",
                "Can't read local variable in its own initializer.",
            ),
        ];
        for (source, message) in cases {
            let errors = compile_errors(source);
            assert_eq!(errors.len(), 1, "{}: {:?}", source, errors);
            assert!(errors[0].ends_with(message), "{}: {:?}", source, errors);
        }
    }

    #[test]
    fn bare_return_in_initializer_is_fine() {
        assert_eq!(
            compile_errors("class A { init() { return; } }"),
            Vec::<String>::new()
        );
    }

    #[test]
    fn collection_during_compile_keeps_constants() {
        let mut heap = Heap::with_config(crate::config::GcConfig {
            stress: true,
            ..Default::default()
        });
        let script = compile(
            "var greeting = \"hello\"; fun f(a) { return a + \" world\"; } print f(greeting);",
            &mut heap,
            &(),
        )
        .unwrap();
        // every string the script refers to is still alive
        script.with(|o| {
            for constant in o.as_function().unwrap().chunk.constants() {
                if let Value::Object(r) = constant {
                    assert!(r.is_live());
                }
            }
        });
    }
}
