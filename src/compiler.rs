use once_cell::sync::Lazy;

use crate::chunk::{Chunk, OpCode};
use crate::gc::GcRoots;
use crate::objects::object::Object;
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_manager::ObjectManager;
use crate::scanner::{Scanner, Token, TokenType};
use crate::table::Table;
use crate::value::{make_number_value, make_object_value, Value};

/// Single-pass compiler: a Pratt parser that emits bytecode as it goes, plus
/// the scope and up-value bookkeeping for the chain of functions currently
/// being compiled. The chain's function objects live on the heap from the
/// moment a level opens, so a collection in the middle of compilation sees
/// every half-built chunk as a root.
pub struct Parser<'a> {
    current: Token<'a>,
    previous: Token<'a>,
    scanner: Option<Scanner<'a>>,
    has_error: bool,
    panic_mode: bool,
    compilers: Vec<Compiler<'a>>,
    heap: &'a mut ObjectManager,
    globals: &'a Table,
}

struct Local<'a> {
    name: Token<'a>,
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy, PartialEq)]
struct Upvalue {
    index: u8,
    is_local: bool,
}

#[derive(Clone, Copy, PartialEq)]
enum FunctionType {
    Function,
    Script,
}

struct Compiler<'a> {
    function: *mut ObjectFunction,
    function_type: FunctionType,
    locals: Vec<Local<'a>>,
    upvalues: Vec<Upvalue>,
    scope_depth: i32,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl From<u8> for Precedence {
    fn from(value: u8) -> Self {
        match value {
            0 => Precedence::None,
            1 => Precedence::Assignment,
            2 => Precedence::Or,
            3 => Precedence::And,
            4 => Precedence::Equality,
            5 => Precedence::Comparison,
            6 => Precedence::Term,
            7 => Precedence::Factor,
            8 => Precedence::Unary,
            9 => Precedence::Call,
            10 => Precedence::Primary,
            _ => unreachable!("Invalid precedence value: {}", value),
        }
    }
}

type ParserFn = fn(&mut Parser<'_>, bool);

#[derive(Clone, Copy)]
struct ParseRule {
    prefix: Option<ParserFn>,
    infix: Option<ParserFn>,
    precedence: Precedence,
}

impl ParseRule {
    const fn new(
        prefix: Option<ParserFn>,
        infix: Option<ParserFn>,
        precedence: Precedence,
    ) -> Self {
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }
}

const RULE_COUNT: usize = TokenType::Eof as usize + 1;

static RULES: Lazy<[ParseRule; RULE_COUNT]> = Lazy::new(|| {
    let mut rules = [ParseRule::new(None, None, Precedence::None); RULE_COUNT];

    rules[TokenType::LeftParen as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.grouping()),
        Some(|parser, _can_assign| parser.call()),
        Precedence::Call,
    );

    rules[TokenType::Minus as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.unary()),
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Term,
    );

    rules[TokenType::Plus as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Term,
    );

    rules[TokenType::Slash as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Factor,
    );

    rules[TokenType::Star as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Factor,
    );

    rules[TokenType::Number as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.number()),
        None,
        Precedence::None,
    );

    rules[TokenType::String as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.string()),
        None,
        Precedence::None,
    );

    rules[TokenType::False as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.literal()),
        None,
        Precedence::None,
    );

    rules[TokenType::True as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.literal()),
        None,
        Precedence::None,
    );

    rules[TokenType::Nil as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.literal()),
        None,
        Precedence::None,
    );

    rules[TokenType::Bang as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.unary()),
        None,
        Precedence::None,
    );

    rules[TokenType::BangEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Equality,
    );

    rules[TokenType::EqualEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Equality,
    );

    rules[TokenType::Greater as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );

    rules[TokenType::GreaterEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );

    rules[TokenType::Less as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );

    rules[TokenType::LessEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );

    rules[TokenType::Identifier as usize] = ParseRule::new(
        Some(|parser, can_assign| parser.variable(can_assign)),
        None,
        Precedence::None,
    );

    rules[TokenType::And as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.and()),
        Precedence::And,
    );

    rules[TokenType::Or as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.or()),
        Precedence::Or,
    );

    rules
});

impl<'a> Parser<'a> {
    pub fn new(heap: &'a mut ObjectManager, globals: &'a Table) -> Parser<'a> {
        let mut parser = Parser {
            current: Token::empty(),
            previous: Token::empty(),
            scanner: None,
            has_error: false,
            panic_mode: false,
            compilers: vec![],
            heap,
            globals,
        };
        parser.init_compiler(FunctionType::Script);
        parser
    }

    /// Compile a whole program. Returns the top-level function, or `None` if
    /// any error was reported along the way.
    pub fn compile(&mut self, source: &'a str) -> Option<*mut ObjectFunction> {
        self.scanner = Some(Scanner::new(source));

        self.advance();
        while !self.match_token(TokenType::Eof) {
            self.declaration();
        }

        let function = self.end_compiler();
        if self.has_error {
            None
        } else {
            Some(function)
        }
    }

    fn specific_compiler(&self, compiler_index: usize) -> &Compiler<'a> {
        self.compilers
            .get(compiler_index)
            .expect("compiler index is invalid")
    }

    fn specific_compiler_mut(&mut self, compiler_index: usize) -> &mut Compiler<'a> {
        self.compilers
            .get_mut(compiler_index)
            .expect("compiler index is invalid")
    }

    fn current_compiler(&self) -> &Compiler<'a> {
        self.compilers.last().expect("no open compiler")
    }

    fn current_compiler_mut(&mut self) -> &mut Compiler<'a> {
        self.compilers.last_mut().expect("no open compiler")
    }

    fn current_function(&self) -> &ObjectFunction {
        unsafe { &*self.current_compiler().function }
    }

    fn current_function_mut(&mut self) -> &mut ObjectFunction {
        unsafe { &mut *self.current_compiler().function }
    }

    fn current_chunk(&self) -> &Chunk {
        &self.current_function().chunk
    }

    fn current_chunk_mut(&mut self) -> &mut Chunk {
        &mut self.current_function_mut().chunk
    }

    fn current_locals(&self) -> &Vec<Local<'a>> {
        &self.current_compiler().locals
    }

    fn current_locals_mut(&mut self) -> &mut Vec<Local<'a>> {
        &mut self.current_compiler_mut().locals
    }

    /// Compilation allocates: identifier and literal strings, and one
    /// function object per compiler level. Before each of those allocations
    /// the heap gets a chance to collect with the compile-time roots — the
    /// globals (a REPL session keeps them across lines) and every open
    /// compiler's function.
    fn collect_if_needed(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let functions: Vec<*mut ObjectFunction> =
            self.compilers.iter().map(|compiler| compiler.function).collect();
        self.heap.collect(GcRoots {
            stack: &[],
            frames: &[],
            open_upvalues: std::ptr::null_mut(),
            globals: self.globals,
            compiler_functions: &functions,
        });
    }

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            let scanner = self.scanner.as_mut().expect("scanner not initialized");
            self.current = scanner.scan_token();
            if self.current.token_type != TokenType::Error {
                break;
            }
            self.error_at_current(self.current.value);
        }
    }

    fn match_token(&mut self, token_type: TokenType) -> bool {
        if !self.check(token_type) {
            return false;
        }
        self.advance();
        true
    }

    fn check(&self, token_type: TokenType) -> bool {
        self.current.token_type == token_type
    }

    fn consume(&mut self, token_type: TokenType, message: &str) {
        if self.current.token_type == token_type {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk_mut().write(byte, line);
    }

    fn emit_bytes(&mut self, byte1: u8, byte2: u8) {
        self.emit_byte(byte1);
        self.emit_byte(byte2);
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_bytes(OpCode::Constant.to_byte(), constant);
    }

    fn emit_return(&mut self) {
        self.emit_byte(OpCode::Nil.to_byte());
        self.emit_byte(OpCode::Return.to_byte());
    }

    fn init_compiler(&mut self, function_type: FunctionType) {
        // When compiling a function declaration this runs right after the
        // name was parsed, so the name is the previous token.
        let name = if function_type == FunctionType::Script {
            String::new()
        } else {
            self.previous.value.to_string()
        };
        self.collect_if_needed();
        let function = self.heap.alloc_function(name);

        let mut compiler = Compiler {
            function,
            function_type,
            locals: vec![],
            upvalues: vec![],
            scope_depth: 0,
        };
        // Slot zero is reserved for the callee so local slot N matches stack
        // offset N inside the frame's window.
        compiler.locals.push(Local {
            name: Token::empty(),
            depth: 0,
            is_captured: false,
        });
        self.compilers.push(compiler);
    }

    fn end_compiler(&mut self) -> *mut ObjectFunction {
        self.emit_return();
        debug_feature::disassemble_compiler(self);
        let compiler = self.compilers.pop().expect("compiler stack underflow");
        compiler.function
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        if let Some(index) = self.current_chunk().find_constant(value) {
            return index as u8;
        }

        let constant_index = self.current_chunk_mut().add_constant(value);
        if constant_index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        constant_index as u8
    }

    fn number(&mut self) {
        let value = self.previous.value.parse::<f64>().unwrap_or(0.0);
        self.emit_constant(make_number_value(value));
    }

    fn string(&mut self) {
        // Trim the surrounding quotation marks.
        let lexeme = self.previous.value;
        let content = &lexeme[1..lexeme.len() - 1];
        self.collect_if_needed();
        let string = self.heap.copy_string(content);
        self.emit_constant(make_object_value(string as *mut Object));
    }

    fn declaration(&mut self) {
        if self.match_token(TokenType::Var) {
            self.variable_declaration();
        } else if self.match_token(TokenType::Fun) {
            self.function_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn variable_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.match_token(TokenType::Equal) {
            self.expression();
        } else {
            self.emit_byte(OpCode::Nil.to_byte());
        }
        self.consume(
            TokenType::Semicolon,
            "Expect ';' after variable declaration.",
        );

        self.define_variable(global);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenType::Identifier, message);

        self.declare_variable();
        if self.current_compiler().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.clone())
    }

    fn declare_variable(&mut self) {
        if self.current_compiler().scope_depth == 0 {
            return;
        }

        let variable_name = self.previous.clone();
        let scope_depth = self.current_compiler().scope_depth;
        let mut duplicate = false;
        for local in self.current_locals().iter().rev() {
            if local.depth != -1 && local.depth < scope_depth {
                break;
            }
            if Self::identifiers_equal(&variable_name, &local.name) {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }

        self.add_local(variable_name);
    }

    fn add_local(&mut self, variable_name: Token<'a>) {
        if self.current_locals().len() == 256 {
            self.error("Too many local variables in function.");
            return;
        }

        // Depth -1 marks the variable as declared but not yet initialized;
        // reading it before `mark_initialized` runs is an error.
        self.current_locals_mut().push(Local {
            name: variable_name,
            depth: -1,
            is_captured: false,
        });
    }

    fn function_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // Initialized eagerly so the body may refer to the function itself.
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn function(&mut self, function_type: FunctionType) {
        self.init_compiler(function_type);

        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenType::RightParen) {
            loop {
                let arity = self.current_function().arity;
                if arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.current_function_mut().arity = arity + 1;
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

        // No end_scope here: the whole frame is discarded by RETURN, which
        // also closes any captured locals.
        let upvalues = self.current_compiler().upvalues.clone();
        let function = self.end_compiler();

        let constant = self.make_constant(make_object_value(function as *mut Object));
        self.emit_bytes(OpCode::Closure.to_byte(), constant);
        for upvalue in &upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut argument_count: u32 = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if argument_count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argument_count += 1;

                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        argument_count.min(255) as u8
    }

    fn identifier_constant(&mut self, name: Token<'_>) -> u8 {
        self.collect_if_needed();
        let string = self.heap.copy_string(name.value);
        self.make_constant(make_object_value(string as *mut Object))
    }

    fn define_variable(&mut self, global: u8) {
        // Inside a scope the value simply stays where it is on the stack.
        if self.current_compiler().scope_depth > 0 {
            self.mark_initialized();
            return;
        }

        self.emit_bytes(OpCode::DefineGlobal.to_byte(), global);
    }

    fn mark_initialized(&mut self) {
        let scope_depth = self.current_compiler().scope_depth;
        if scope_depth == 0 {
            return;
        }
        self.current_locals_mut()
            .last_mut()
            .expect("no local to initialize")
            .depth = scope_depth;
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous.clone(), can_assign);
    }

    fn named_variable(&mut self, name: Token<'a>, can_assign: bool) {
        let mut opcode_get = OpCode::GetLocal.to_byte();
        let mut opcode_set = OpCode::SetLocal.to_byte();
        let current_compiler_index = self.compilers.len() - 1;
        let mut index = self.resolve_local(current_compiler_index, &name);
        if index == -1 {
            index = self.resolve_upvalue(current_compiler_index, &name);
            if index == -1 {
                // Neither local nor captured: refer to a global by name.
                index = self.identifier_constant(name) as i32;
                opcode_get = OpCode::GetGlobal.to_byte();
                opcode_set = OpCode::SetGlobal.to_byte();
            } else {
                opcode_get = OpCode::GetUpvalue.to_byte();
                opcode_set = OpCode::SetUpvalue.to_byte();
            }
        }

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.emit_bytes(opcode_set, index as u8);
        } else {
            self.emit_bytes(opcode_get, index as u8);
        }
    }

    fn resolve_local(&mut self, compiler_index: usize, name: &Token<'_>) -> i32 {
        let mut found = -1;
        let mut in_own_initializer = false;
        {
            let compiler = self.specific_compiler(compiler_index);
            for (index, local) in compiler.locals.iter().enumerate().rev() {
                if Self::identifiers_equal(name, &local.name) {
                    in_own_initializer = local.depth == -1;
                    found = index as i32;
                    break;
                }
            }
        }
        if in_own_initializer {
            self.error("Can't read local variable in its own initializer.");
        }
        found
    }

    fn identifiers_equal(left: &Token<'_>, right: &Token<'_>) -> bool {
        left.token_type == right.token_type && left.value == right.value
    }

    fn resolve_upvalue(&mut self, compiler_index: usize, name: &Token<'_>) -> i32 {
        if compiler_index == 0 {
            return -1;
        }

        let local = self.resolve_local(compiler_index - 1, name);
        if local != -1 {
            self.specific_compiler_mut(compiler_index - 1).locals[local as usize].is_captured =
                true;
            return self.add_upvalue(compiler_index, local as u8, true);
        }

        let upvalue = self.resolve_upvalue(compiler_index - 1, name);
        if upvalue != -1 {
            return self.add_upvalue(compiler_index, upvalue as u8, false);
        }

        -1
    }

    fn add_upvalue(&mut self, compiler_index: usize, index: u8, is_local: bool) -> i32 {
        let candidate = Upvalue { index, is_local };
        {
            let compiler = self.specific_compiler(compiler_index);
            for (existing_index, upvalue) in compiler.upvalues.iter().enumerate() {
                if *upvalue == candidate {
                    return existing_index as i32;
                }
            }
        }

        if self.specific_compiler(compiler_index).upvalues.len() == 256 {
            self.error("Too many closure variables in function.");
            return 0;
        }

        let compiler = self.specific_compiler_mut(compiler_index);
        compiler.upvalues.push(candidate);
        let count = compiler.upvalues.len();
        unsafe {
            (*compiler.function).upvalue_count = count;
        }
        (count - 1) as i32
    }

    fn and(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_byte(OpCode::Pop.to_byte());
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_byte(OpCode::Pop.to_byte());
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn statement(&mut self) {
        if self.match_token(TokenType::If) {
            self.if_statement();
        } else if self.match_token(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else if self.match_token(TokenType::While) {
            self.while_statement();
        } else if self.match_token(TokenType::For) {
            self.for_statement();
        } else if self.match_token(TokenType::Return) {
            self.return_statement();
        } else if self.match_token(TokenType::Print) {
            self.print_statement();
        } else {
            self.expression_statement();
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        // JumpIfFalse leaves the condition on the stack, so both arms pop it
        // explicitly.
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_byte(OpCode::Pop.to_byte());
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_byte(OpCode::Pop.to_byte());

        if self.match_token(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    /// Emit a jump with a two-byte placeholder operand; returns the offset of
    /// the operand for later patching.
    fn emit_jump(&mut self, instruction: OpCode) -> usize {
        self.emit_byte(instruction.to_byte());
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the operand bytes the VM has already read when it
        // applies the offset.
        let jump = self.current_chunk().len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }

        let chunk = self.current_chunk_mut();
        chunk.write_by_offset(offset, ((jump >> 8) & 0xff) as u8);
        chunk.write_by_offset(offset + 1, (jump & 0xff) as u8);
    }

    fn begin_scope(&mut self) {
        self.current_compiler_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_compiler_mut().scope_depth -= 1;

        loop {
            let (close_upvalue, done) = {
                let compiler = self.current_compiler();
                match compiler.locals.last() {
                    Some(local) if local.depth > compiler.scope_depth => {
                        (local.is_captured, false)
                    }
                    _ => (false, true),
                }
            };
            if done {
                break;
            }
            if close_upvalue {
                self.emit_byte(OpCode::CloseUpvalue.to_byte());
            } else {
                self.emit_byte(OpCode::Pop.to_byte());
            }
            self.current_locals_mut().pop();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn return_statement(&mut self) {
        if self.current_compiler().function_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }

        if self.match_token(TokenType::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.emit_byte(OpCode::Return.to_byte());
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        self.emit_byte(OpCode::Print.to_byte());
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();

        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_byte(OpCode::Pop.to_byte());

        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_byte(OpCode::Pop.to_byte());
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_byte(OpCode::Loop.to_byte());

        // +2 skips the operand of the Loop instruction itself.
        let offset = self.current_chunk().len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }

        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenType::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenType::Var) {
            self.variable_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump = None;
        if !self.match_token(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");

            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_byte(OpCode::Pop.to_byte());
        }

        if !self.match_token(TokenType::RightParen) {
            // The increment runs after the body: jump over it now, loop back
            // to it from the body's end.
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().len();
            self.expression();
            self.emit_byte(OpCode::Pop.to_byte());
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_byte(OpCode::Pop.to_byte());
        }
        self.end_scope();
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit_byte(OpCode::Pop.to_byte());
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn unary(&mut self) {
        let operator_type = self.previous.token_type;

        self.parse_precedence(Precedence::Unary);

        match operator_type {
            TokenType::Bang => self.emit_byte(OpCode::Not.to_byte()),
            TokenType::Minus => self.emit_byte(OpCode::Negate.to_byte()),
            _ => unreachable!("Expect unary operator."),
        }
    }

    fn binary(&mut self) {
        let operator_type = self.previous.token_type;
        let rule = &RULES[operator_type as usize];
        self.parse_precedence((rule.precedence as u8 + 1).into());

        match operator_type {
            TokenType::BangEqual => {
                self.emit_bytes(OpCode::Equal.to_byte(), OpCode::Not.to_byte())
            }
            TokenType::EqualEqual => self.emit_byte(OpCode::Equal.to_byte()),
            TokenType::Greater => self.emit_byte(OpCode::Greater.to_byte()),
            TokenType::GreaterEqual => {
                self.emit_bytes(OpCode::Less.to_byte(), OpCode::Not.to_byte())
            }
            TokenType::Less => self.emit_byte(OpCode::Less.to_byte()),
            TokenType::LessEqual => {
                self.emit_bytes(OpCode::Greater.to_byte(), OpCode::Not.to_byte())
            }
            TokenType::Plus => self.emit_byte(OpCode::Add.to_byte()),
            TokenType::Minus => self.emit_byte(OpCode::Subtract.to_byte()),
            TokenType::Star => self.emit_byte(OpCode::Multiply.to_byte()),
            TokenType::Slash => self.emit_byte(OpCode::Divide.to_byte()),
            _ => unreachable!("Unexpected binary operator: {}", operator_type),
        }
    }

    fn literal(&mut self) {
        match self.previous.token_type {
            TokenType::False => self.emit_byte(OpCode::False.to_byte()),
            TokenType::True => self.emit_byte(OpCode::True.to_byte()),
            TokenType::Nil => self.emit_byte(OpCode::Nil.to_byte()),
            _ => unreachable!("Unexpected literal: {}", self.previous.token_type),
        }
    }

    fn call(&mut self) {
        let argument_count = self.argument_list();
        self.emit_bytes(OpCode::Call.to_byte(), argument_count);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();

        // Only an expression parsed at assignment level may claim a `=`.
        let can_assign = precedence <= Precedence::Assignment;
        match RULES[self.previous.token_type as usize].prefix {
            Some(prefix) => prefix(self, can_assign),
            None => {
                self.error("Expect expression.");
                return;
            }
        }

        while precedence as u8 <= RULES[self.current.token_type as usize].precedence as u8 {
            self.advance();
            if let Some(infix) = RULES[self.previous.token_type as usize].infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.token_type != TokenType::Eof {
            if self.previous.token_type == TokenType::Semicolon {
                return;
            }

            match self.current.token_type {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return => return,
                _ => (),
            }

            self.advance();
        }
    }

    fn error(&mut self, message: &str) {
        self.error_at(&self.previous.clone(), message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(&self.current.clone(), message);
    }

    fn error_at(&mut self, token: &Token<'_>, message: &str) {
        // Panic mode swallows the cascade after the first error; synchronize
        // clears it at the next statement boundary.
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;

        eprint!("[line {}] Error", token.line);
        match token.token_type {
            TokenType::Eof => eprint!(" at end"),
            TokenType::Error => {}
            _ => eprint!(" at '{}'", token.value),
        }
        eprintln!(": {}", message);
        self.has_error = true;
    }
}

#[cfg(feature = "debug_print_code")]
mod debug_feature {
    use super::*;

    pub fn disassemble_compiler(parser: &Parser<'_>) {
        if parser.has_error {
            return;
        }
        let function = parser.current_function();
        let name = if function.name.is_empty() {
            "<script>"
        } else {
            &function.name
        };
        crate::debug::disassemble_chunk(&function.chunk, name);
    }
}

#[cfg(not(feature = "debug_print_code"))]
mod debug_feature {
    use super::*;

    pub fn disassemble_compiler(_parser: &Parser<'_>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{as_function, is_function, values_equal};

    fn compile(source: &str) -> (ObjectManager, Option<*mut ObjectFunction>) {
        let mut heap = ObjectManager::new();
        let globals = Table::new();
        let function = {
            let mut parser = Parser::new(&mut heap, &globals);
            parser.compile(source)
        };
        (heap, function)
    }

    /// Decode a chunk into opcodes, honoring each instruction's operand
    /// width.
    fn opcodes_of(chunk: &Chunk) -> Vec<OpCode> {
        let mut ops = vec![];
        let mut offset = 0;
        while offset < chunk.len() {
            let op = OpCode::from_byte(chunk.code[offset]).expect("invalid opcode in chunk");
            ops.push(op);
            offset += 1;
            offset += match op {
                OpCode::Constant
                | OpCode::GetLocal
                | OpCode::SetLocal
                | OpCode::GetGlobal
                | OpCode::DefineGlobal
                | OpCode::SetGlobal
                | OpCode::GetUpvalue
                | OpCode::SetUpvalue
                | OpCode::Call => 1,
                OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop => 2,
                OpCode::Closure => {
                    let constant = chunk.code[offset] as usize;
                    let function = as_function(chunk.get_constant(constant));
                    1 + 2 * unsafe { (*function).upvalue_count }
                }
                _ => 0,
            };
        }
        ops
    }

    #[test]
    fn expression_statement_bytecode() {
        let (_heap, function) = compile("!(5 - 4 > 3 * 2 == !nil);");
        let function = function.expect("compilation should succeed");
        let chunk = unsafe { &(*function).chunk };

        assert!(values_equal(
            chunk.get_constant(0),
            &make_number_value(5.0)
        ));
        assert!(values_equal(
            chunk.get_constant(1),
            &make_number_value(4.0)
        ));

        let expected = [
            OpCode::Constant.to_byte(),
            0,
            OpCode::Constant.to_byte(),
            1,
            OpCode::Subtract.to_byte(),
            OpCode::Constant.to_byte(),
            2,
            OpCode::Constant.to_byte(),
            3,
            OpCode::Multiply.to_byte(),
            OpCode::Greater.to_byte(),
            OpCode::Nil.to_byte(),
            OpCode::Not.to_byte(),
            OpCode::Equal.to_byte(),
            OpCode::Not.to_byte(),
            OpCode::Pop.to_byte(),
            OpCode::Nil.to_byte(),
            OpCode::Return.to_byte(),
        ];
        assert_eq!(chunk.code, expected);
    }

    #[test]
    fn string_literals_are_interned_across_programs() {
        let mut heap = ObjectManager::new();
        let globals = Table::new();

        let first = {
            let mut parser = Parser::new(&mut heap, &globals);
            parser.compile("\"this is a test string\";")
        };
        assert!(first.is_some());

        let second = {
            let mut parser = Parser::new(&mut heap, &globals);
            parser.compile("\"this is a test string\";")
        };
        assert!(second.is_some());

        assert_eq!(heap.strings.len(), 1);
    }

    #[test]
    fn if_statement_patches_both_jumps() {
        let (_heap, function) = compile("if (true) print 1;");
        let function = function.expect("compilation should succeed");
        let chunk = unsafe { &(*function).chunk };

        // 0 True; 1 JumpIfFalse 2,3; 4 Pop; 5 Constant 6; 7 Print;
        // 8 Jump 9,10; 11 Pop; 12 Nil; 13 Return
        assert_eq!(chunk.code[1], OpCode::JumpIfFalse.to_byte());
        assert_eq!(&chunk.code[2..4], &[0x00, 0x07]);
        assert_eq!(chunk.code[8], OpCode::Jump.to_byte());
        assert_eq!(&chunk.code[9..11], &[0x00, 0x01]);
    }

    #[test]
    fn while_statement_loops_back_to_the_condition() {
        let (_heap, function) = compile("while (false) print 1;");
        let function = function.expect("compilation should succeed");
        let chunk = unsafe { &(*function).chunk };

        // 0 False; 1 JumpIfFalse 2,3; 4 Pop; 5 Constant 6; 7 Print;
        // 8 Loop 9,10; 11 Pop; 12 Nil; 13 Return
        assert_eq!(chunk.code[8], OpCode::Loop.to_byte());
        assert_eq!(&chunk.code[9..11], &[0x00, 0x0b]);
        assert_eq!(&chunk.code[2..4], &[0x00, 0x07]);
    }

    #[test]
    fn function_declarations_emit_a_closure() {
        let (_heap, function) = compile(
            "fun greet() {
                print \"hi\";
            }
            greet();",
        );
        let function = function.expect("compilation should succeed");
        let chunk = unsafe { &(*function).chunk };

        let ops = opcodes_of(chunk);
        assert!(ops.contains(&OpCode::Closure));
        assert!(ops.contains(&OpCode::Call));

        let inner = chunk
            .constants
            .iter()
            .find(|constant| is_function(constant))
            .expect("function constant missing");
        let inner = as_function(inner);
        unsafe {
            assert_eq!((*inner).name, "greet");
            assert_eq!((*inner).arity, 0);
            assert_eq!((*inner).upvalue_count, 0);
        }
    }

    #[test]
    fn captured_locals_become_upvalues() {
        let (_heap, function) = compile(
            "fun outer() {
                var x = 1;
                fun inner() {
                    print x;
                }
            }",
        );
        let function = function.expect("compilation should succeed");
        let script_chunk = unsafe { &(*function).chunk };

        let outer = script_chunk
            .constants
            .iter()
            .find(|constant| is_function(constant))
            .expect("outer function missing");
        let outer_chunk = unsafe { &(*as_function(outer)).chunk };

        let inner = outer_chunk
            .constants
            .iter()
            .find(|constant| is_function(constant))
            .expect("inner function missing");
        unsafe {
            assert_eq!((*as_function(inner)).upvalue_count, 1);
        }

        let ops = opcodes_of(unsafe { &(*as_function(inner)).chunk });
        assert!(ops.contains(&OpCode::GetUpvalue));
    }

    #[test]
    fn captured_block_locals_close_at_scope_exit() {
        let (_heap, function) = compile(
            "fun f() {
                {
                    var captured = 1;
                    fun g() { return captured; }
                }
            }",
        );
        let function = function.expect("compilation should succeed");
        let script_chunk = unsafe { &(*function).chunk };

        let f = script_chunk
            .constants
            .iter()
            .find(|constant| is_function(constant))
            .expect("f missing");
        let ops = opcodes_of(unsafe { &(*as_function(f)).chunk });
        assert!(ops.contains(&OpCode::CloseUpvalue));
    }

    #[test]
    fn return_at_top_level_is_rejected() {
        let (_heap, function) = compile("return 1;");
        assert!(function.is_none());
    }

    #[test]
    fn duplicate_declaration_in_one_scope_is_rejected() {
        let (_heap, function) = compile("{ var a = 1; var a = 2; }");
        assert!(function.is_none());
    }

    #[test]
    fn reading_a_local_in_its_own_initializer_is_rejected() {
        let (_heap, function) = compile("{ var a = a; }");
        assert!(function.is_none());
    }

    #[test]
    fn invalid_assignment_targets_are_rejected() {
        let (_heap, function) = compile("var a = 1; var b = 2; a + b = 3;");
        assert!(function.is_none());
    }

    #[test]
    fn missing_expression_is_rejected() {
        let (_heap, function) = compile("1 +;");
        assert!(function.is_none());
    }

    #[test]
    fn shadowing_in_an_inner_scope_is_allowed() {
        let (_heap, function) = compile("{ var a = 1; { var a = 2; print a; } }");
        assert!(function.is_some());
    }
}
