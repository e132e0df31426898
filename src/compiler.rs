use super::chunk::{Chunk, Instruction};
use super::object::{Function, Heap, Obj, ObjRef};
use super::reporter::{Report, Reporter};
use super::table::Table;
use super::token::{Token, TokenType, BOUNDARIES};
use super::tokenizer::Tokenizer;
use super::value::Value;

const MAX_LOCALS: usize = 256;
const MAX_UP_VALUES: usize = 256;

/// Binding powers, weakest first. `parse_precedence(p)` consumes every
/// infix operator whose precedence is at least `p`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
enum Precedence {
    None,
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
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Unary,
            Self::Unary => Self::Call,
            Self::Call => Self::Primary,
            Self::Primary => Self::Primary,
        }
    }
}

/// The closed set of parse handlers. The rule table maps token types to
/// these tags and `apply` dispatches with a match, so the table stays
/// data-driven without function pointers.
#[derive(Debug, Clone, Copy)]
enum ParseFn {
    Grouping,
    Unary,
    Binary,
    Number,
    String,
    Literal,
    Variable,
    And,
    Or,
    Call,
}

struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

fn get_rule(typ: TokenType) -> ParseRule {
    let (prefix, infix, precedence) = match typ {
        TokenType::OParen => (Some(ParseFn::Grouping), Some(ParseFn::Call), Precedence::Call),
        TokenType::Minus => (Some(ParseFn::Unary), Some(ParseFn::Binary), Precedence::Term),
        TokenType::Plus => (None, Some(ParseFn::Binary), Precedence::Term),
        TokenType::Slash | TokenType::Star => (None, Some(ParseFn::Binary), Precedence::Factor),
        TokenType::Bang => (Some(ParseFn::Unary), None, Precedence::None),
        TokenType::BangEqual | TokenType::DEqual => {
            (None, Some(ParseFn::Binary), Precedence::Equality)
        }
        TokenType::Greater
        | TokenType::GreaterEqual
        | TokenType::Less
        | TokenType::LessEqual => (None, Some(ParseFn::Binary), Precedence::Comparison),
        TokenType::Identifier => (Some(ParseFn::Variable), None, Precedence::None),
        TokenType::String => (Some(ParseFn::String), None, Precedence::None),
        TokenType::Number => (Some(ParseFn::Number), None, Precedence::None),
        TokenType::And => (None, Some(ParseFn::And), Precedence::And),
        TokenType::Or => (None, Some(ParseFn::Or), Precedence::Or),
        TokenType::True | TokenType::False | TokenType::Nil => {
            (Some(ParseFn::Literal), None, Precedence::None)
        }
        _ => (None, None, Precedence::None),
    };
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
}

#[derive(Debug, Clone, Copy)]
struct Local<'a> {
    name: &'a str,
    /// -1 until the initializer finishes, then the owning scope's depth.
    depth: i32,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct UpValueDesc {
    pub index: u8,
    pub is_local: bool,
}

/// One function being compiled. States form a stack, innermost last; the
/// enclosing function is simply the previous element.
struct CompilerState<'a> {
    typ: FunctionType,
    function: Function,
    locals: Vec<Local<'a>>,
    up_values: Vec<UpValueDesc>,
    scope_depth: i32,
}

impl<'a> CompilerState<'a> {
    fn new(typ: FunctionType, name: Option<ObjRef>) -> Self {
        Self {
            typ,
            function: Function::new(name),
            // Slot 0 holds the callee for the frame's lifetime.
            locals: vec![Local {
                name: "",
                depth: 0,
                is_captured: false,
            }],
            up_values: Vec::new(),
            scope_depth: 0,
        }
    }
}

/// Single-pass compiler: tokenizes, parses by Pratt precedence, resolves
/// names, and emits bytecode in one walk over the source. There is no AST.
pub struct Compiler<'a, 'b> {
    tokenizer: Tokenizer<'a>,
    previous: Token<'a>,
    current: Token<'a>,
    had_error: bool,
    panic_mode: bool,
    states: Vec<CompilerState<'a>>,
    heap: &'b mut Heap,
    strings: &'b mut Table,
    reporter: &'b mut dyn Reporter,
}

impl<'a, 'b> Compiler<'a, 'b> {
    pub fn new(
        source: &'a str,
        heap: &'b mut Heap,
        strings: &'b mut Table,
        reporter: &'b mut dyn Reporter,
    ) -> Self {
        Compiler {
            tokenizer: Tokenizer::new(source),
            previous: Token::empty(),
            current: Token::empty(),
            had_error: false,
            panic_mode: false,
            states: vec![CompilerState::new(FunctionType::Script, None)],
            heap,
            strings,
            reporter,
        }
    }

    pub fn compile(mut self) -> Result<ObjRef, ()> {
        self.advance();
        while !self.matches(TokenType::Eof) {
            self.declaration();
        }

        let (function, _) = self.end_state();
        if self.had_error {
            Err(())
        } else {
            Ok(function)
        }
    }

    //>> Error reporting

    fn error_at(&mut self, token: Token<'a>, msg: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        let location = match token.typ {
            TokenType::Error => None,
            _ => Some(token.to_string()),
        };
        self.reporter
            .error(Report::compile(msg.to_string(), token.line, location));
    }

    fn error(&mut self, msg: &str) {
        self.error_at(self.previous, msg);
    }

    fn error_at_current(&mut self, msg: &str) {
        self.error_at(self.current, msg);
    }

    /// Skips to the next statement boundary after a parse error.
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.typ != TokenType::Eof {
            if self.previous.typ == TokenType::Semicolon {
                return;
            }
            if BOUNDARIES.contains(&self.current.typ) {
                return;
            }
            self.advance();
        }
    }

    //<<

    //>> Token plumbing

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.tokenizer.next_token();
            if self.current.typ != TokenType::Error {
                break;
            }
            let msg = self.current.lexeme;
            self.error_at_current(msg);
        }
    }

    fn consume(&mut self, typ: TokenType, msg: &str) -> Result<(), ()> {
        if self.current.typ == typ {
            self.advance();
            Ok(())
        } else {
            self.error_at_current(msg);
            Err(())
        }
    }

    fn check(&self, typ: TokenType) -> bool {
        self.current.typ == typ
    }

    fn matches(&mut self, typ: TokenType) -> bool {
        if self.check(typ) {
            self.advance();
            true
        } else {
            false
        }
    }

    //<<

    //>> State and emission

    fn state(&self) -> &CompilerState<'a> {
        self.states.last().unwrap()
    }

    fn state_mut(&mut self) -> &mut CompilerState<'a> {
        self.states.last_mut().unwrap()
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.state_mut().function.chunk
    }

    fn emit(&mut self, instr: Instruction) {
        let line = self.previous.line;
        self.chunk_mut().write_instr(instr, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk_mut().write(byte, line);
    }

    fn emit_return(&mut self) {
        self.emit(Instruction::Nil);
        self.emit(Instruction::Return);
    }

    fn emit_const(&mut self, value: Value) {
        let line = self.previous.line;
        if self.chunk_mut().emit_const(value, line).is_err() {
            self.error("Too many constants in one chunk.");
        }
    }

    fn emit_jump(&mut self, instr: Instruction) -> usize {
        let line = self.previous.line;
        self.chunk_mut().emit_jump(instr, line)
    }

    fn patch_jump(&mut self, index: usize) {
        if self.chunk_mut().patch_jump(index).is_err() {
            self.error("Too much code to jump over.");
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.previous.line;
        if self.chunk_mut().emit_loop(loop_start, line).is_err() {
            self.error("Loop body too large.");
        }
    }

    /// A one-byte constant index, for operands that cannot take the long
    /// form (names, function references).
    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.chunk_mut().add_constant(value);
        if index > 0xff {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let string = self.strings.intern(self.heap, name.to_string());
        self.make_constant(Value::Obj(string))
    }

    /// Seals the innermost function and hands back its heap reference plus
    /// the upvalue descriptors the `Closure` instruction has to encode.
    fn end_state(&mut self) -> (ObjRef, Vec<UpValueDesc>) {
        self.emit_return();
        let state = self.states.pop().unwrap();
        let mut function = state.function;
        function.up_values_count = state.up_values.len();

        if cfg!(feature = "debug-bytecode") && !self.had_error {
            let name = match function.name {
                Some(name) => self.heap.str_chars(name).to_string(),
                None => "<script>".to_string(),
            };
            print!("{}", function.chunk.disassemble(self.heap, &name));
        }

        (self.heap.alloc(Obj::Function(function)), state.up_values)
    }

    //<<

    //>> Scopes and variables

    fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state_mut().scope_depth -= 1;

        while let Some(local) = self.state().locals.last() {
            if local.depth <= self.state().scope_depth {
                break;
            }
            let captured = local.is_captured;
            if captured {
                self.emit(Instruction::CloseUpValue);
            } else {
                self.emit(Instruction::Pop);
            }
            self.state_mut().locals.pop();
        }
    }

    fn add_local(&mut self, name: &'a str) {
        if self.state().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.state_mut().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }

        let name = self.previous.lexeme;
        let scope_depth = self.state().scope_depth;
        let mut duplicate = false;
        for local in self.state().locals.iter().rev() {
            if local.depth != -1 && local.depth < scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with same name in this scope.");
        }

        self.add_local(name);
    }

    fn parse_variable(&mut self, msg: &str) -> Result<u8, ()> {
        self.consume(TokenType::Identifier, msg)?;
        self.declare_variable();
        if self.state().scope_depth > 0 {
            return Ok(0);
        }
        let name = self.previous.lexeme;
        Ok(self.identifier_constant(name))
    }

    fn mark_initialized(&mut self) {
        let state = self.state_mut();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth;
        state.locals.last_mut().unwrap().depth = depth;
    }

    fn define_variable(&mut self, global: u8) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit(Instruction::DefineGlobal);
        self.emit_byte(global);
    }

    fn resolve_local(&mut self, state_index: usize, name: &str) -> Option<u8> {
        let mut result = None;
        let mut uninitialized = false;
        for (index, local) in self.states[state_index].locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    uninitialized = true;
                }
                result = Some(index as u8);
                break;
            }
        }
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        result
    }

    /// Registers an upvalue descriptor, reusing an identical existing one.
    fn add_up_value(&mut self, state_index: usize, index: u8, is_local: bool) -> u8 {
        for (i, up_value) in self.states[state_index].up_values.iter().enumerate() {
            if up_value.index == index && up_value.is_local == is_local {
                return i as u8;
            }
        }

        if self.states[state_index].up_values.len() == MAX_UP_VALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.states[state_index]
            .up_values
            .push(UpValueDesc { index, is_local });
        (self.states[state_index].up_values.len() - 1) as u8
    }

    /// Looks for `name` in enclosing functions: a local there gets captured
    /// directly, anything further out is reached through the enclosing
    /// function's own upvalue.
    fn resolve_up_value(&mut self, state_index: usize, name: &str) -> Option<u8> {
        if state_index == 0 {
            return None;
        }
        let enclosing = state_index - 1;

        if let Some(local) = self.resolve_local(enclosing, name) {
            self.states[enclosing].locals[local as usize].is_captured = true;
            return Some(self.add_up_value(state_index, local, true));
        }
        if let Some(up_value) = self.resolve_up_value(enclosing, name) {
            return Some(self.add_up_value(state_index, up_value, false));
        }
        None
    }

    fn named_variable(&mut self, name: &'a str, can_assign: bool) -> Result<(), ()> {
        let top = self.states.len() - 1;
        let (get_op, set_op, arg) = if let Some(index) = self.resolve_local(top, name) {
            (Instruction::GetLocal, Instruction::SetLocal, index)
        } else if let Some(index) = self.resolve_up_value(top, name) {
            (Instruction::GetUpValue, Instruction::SetUpValue, index)
        } else {
            let index = self.identifier_constant(name);
            (Instruction::GetGlobal, Instruction::SetGlobal, index)
        };

        if can_assign && self.matches(TokenType::Equal) {
            self.expression()?;
            self.emit(set_op);
        } else {
            self.emit(get_op);
        }
        self.emit_byte(arg);
        Ok(())
    }

    //<<

    //>> Expressions

    fn expression(&mut self) -> Result<(), ()> {
        self.parse_precedence(Precedence::Assignment)
    }

    fn parse_precedence(&mut self, precedence: Precedence) -> Result<(), ()> {
        self.advance();
        let prefix = match get_rule(self.previous.typ).prefix {
            Some(rule) => rule,
            None => {
                self.error("Expect expression.");
                return Err(());
            }
        };
        let can_assign = precedence <= Precedence::Assignment;
        self.apply(prefix, can_assign)?;

        while precedence <= get_rule(self.current.typ).precedence {
            self.advance();
            let infix = get_rule(self.previous.typ).infix.unwrap();
            self.apply(infix, can_assign)?;
        }

        if can_assign && self.matches(TokenType::Equal) {
            self.error("Invalid assignment target.");
            return Err(());
        }
        Ok(())
    }

    fn apply(&mut self, rule: ParseFn, can_assign: bool) -> Result<(), ()> {
        match rule {
            ParseFn::Grouping => self.grouping(),
            ParseFn::Unary => self.unary(),
            ParseFn::Binary => self.binary(),
            ParseFn::Number => self.number(),
            ParseFn::String => self.string(),
            ParseFn::Literal => self.literal(),
            ParseFn::Variable => self.variable(can_assign),
            ParseFn::And => self.and(),
            ParseFn::Or => self.or(),
            ParseFn::Call => self.call(),
        }
    }

    fn grouping(&mut self) -> Result<(), ()> {
        self.expression()?;
        self.consume(TokenType::CParen, "Expect ')' after expression.")
    }

    fn number(&mut self) -> Result<(), ()> {
        let value: f64 = self.previous.lexeme.parse().unwrap();
        self.emit_const(Value::Number(value));
        Ok(())
    }

    fn string(&mut self) -> Result<(), ()> {
        let lexeme = self.previous.lexeme;
        let chars = lexeme[1..lexeme.len() - 1].to_string();
        let string = self.strings.intern(self.heap, chars);
        self.emit_const(Value::Obj(string));
        Ok(())
    }

    fn literal(&mut self) -> Result<(), ()> {
        match self.previous.typ {
            TokenType::True => self.emit(Instruction::True),
            TokenType::False => self.emit(Instruction::False),
            TokenType::Nil => self.emit(Instruction::Nil),
            _ => unreachable!(),
        }
        Ok(())
    }

    fn variable(&mut self, can_assign: bool) -> Result<(), ()> {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign)
    }

    fn unary(&mut self) -> Result<(), ()> {
        let typ = self.previous.typ;
        self.parse_precedence(Precedence::Unary)?;

        match typ {
            TokenType::Minus => self.emit(Instruction::Negate),
            TokenType::Bang => self.emit(Instruction::Not),
            _ => unreachable!(),
        }
        Ok(())
    }

    fn binary(&mut self) -> Result<(), ()> {
        let typ = self.previous.typ;
        self.parse_precedence(get_rule(typ).precedence.next())?;

        match typ {
            TokenType::Plus => self.emit(Instruction::Add),
            TokenType::Minus => self.emit(Instruction::Subtract),
            TokenType::Star => self.emit(Instruction::Multiply),
            TokenType::Slash => self.emit(Instruction::Divide),
            TokenType::DEqual => self.emit(Instruction::Equal),
            TokenType::BangEqual => {
                self.emit(Instruction::Equal);
                self.emit(Instruction::Not);
            }
            TokenType::Greater => self.emit(Instruction::Greater),
            TokenType::GreaterEqual => {
                self.emit(Instruction::Less);
                self.emit(Instruction::Not);
            }
            TokenType::Less => self.emit(Instruction::Less),
            TokenType::LessEqual => {
                self.emit(Instruction::Greater);
                self.emit(Instruction::Not);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn and(&mut self) -> Result<(), ()> {
        let end_jump = self.emit_jump(Instruction::JumpIfFalse);
        self.emit(Instruction::Pop);
        self.parse_precedence(Precedence::And)?;
        self.patch_jump(end_jump);
        Ok(())
    }

    /// Falls through to the right operand only when the left is falsy.
    fn or(&mut self) -> Result<(), ()> {
        let else_jump = self.emit_jump(Instruction::JumpIfFalse);
        let end_jump = self.emit_jump(Instruction::Jump);
        self.patch_jump(else_jump);
        self.emit(Instruction::Pop);
        self.parse_precedence(Precedence::Or)?;
        self.patch_jump(end_jump);
        Ok(())
    }

    fn call(&mut self) -> Result<(), ()> {
        let argc = self.argument_list()?;
        self.emit(Instruction::Call);
        self.emit_byte(argc);
        Ok(())
    }

    fn argument_list(&mut self) -> Result<u8, ()> {
        let mut count: usize = 0;
        if !self.check(TokenType::CParen) {
            loop {
                self.expression()?;
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                    return Err(());
                }
                count += 1;
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::CParen, "Expect ')' after arguments.")?;
        Ok(count as u8)
    }

    //<<

    //>> Declarations and statements

    fn declaration(&mut self) {
        let result = if self.matches(TokenType::Function) {
            self.fun_declaration()
        } else if self.matches(TokenType::Var) {
            self.var_declaration()
        } else {
            self.statement()
        };

        if result.is_err() || self.panic_mode {
            self.synchronize();
        }
    }

    fn fun_declaration(&mut self) -> Result<(), ()> {
        let global = self.parse_variable("Expect function name.")?;
        // Initialized before the body so the function can call itself.
        self.mark_initialized();
        self.function(FunctionType::Function)?;
        self.define_variable(global);
        Ok(())
    }

    fn function(&mut self, typ: FunctionType) -> Result<(), ()> {
        let name = self.strings.intern(self.heap, self.previous.lexeme.to_string());
        self.states.push(CompilerState::new(typ, Some(name)));
        self.begin_scope();

        self.consume(TokenType::OParen, "Expect '(' after function name.")?;
        if !self.check(TokenType::CParen) {
            loop {
                if self.state().function.arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                    return Err(());
                }
                self.state_mut().function.arity += 1;
                let param = self.parse_variable("Expect parameter name.")?;
                self.define_variable(param);
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::CParen, "Expect ')' after parameters.")?;
        self.consume(TokenType::OBrace, "Expect '{' before function body.")?;
        self.block()?;

        let (function, up_values) = self.end_state();
        let index = self.make_constant(Value::Obj(function));
        self.emit(Instruction::Closure);
        self.emit_byte(index);
        for up_value in up_values {
            self.emit_byte(up_value.is_local as u8);
            self.emit_byte(up_value.index);
        }
        Ok(())
    }

    fn var_declaration(&mut self) -> Result<(), ()> {
        let global = self.parse_variable("Expect variable name.")?;

        if self.matches(TokenType::Equal) {
            self.expression()?;
        } else {
            self.emit(Instruction::Nil);
        }
        self.consume(TokenType::Semicolon, "Expect ';' after variable declaration.")?;

        self.define_variable(global);
        Ok(())
    }

    fn statement(&mut self) -> Result<(), ()> {
        if self.matches(TokenType::Print) {
            self.print_statement()
        } else if self.matches(TokenType::For) {
            self.for_statement()
        } else if self.matches(TokenType::If) {
            self.if_statement()
        } else if self.matches(TokenType::Return) {
            self.return_statement()
        } else if self.matches(TokenType::While) {
            self.while_statement()
        } else if self.matches(TokenType::OBrace) {
            self.begin_scope();
            let result = self.block();
            self.end_scope();
            result
        } else {
            self.expression_statement()
        }
    }

    fn block(&mut self) -> Result<(), ()> {
        while !self.check(TokenType::CBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::CBrace, "Expect '}' after block.")
    }

    fn print_statement(&mut self) -> Result<(), ()> {
        self.expression()?;
        self.consume(TokenType::Semicolon, "Expect ';' after value.")?;
        self.emit(Instruction::Print);
        Ok(())
    }

    fn expression_statement(&mut self) -> Result<(), ()> {
        self.expression()?;
        self.consume(TokenType::Semicolon, "Expect ';' after expression.")?;
        self.emit(Instruction::Pop);
        Ok(())
    }

    fn if_statement(&mut self) -> Result<(), ()> {
        self.consume(TokenType::OParen, "Expect '(' after 'if'.")?;
        self.expression()?;
        self.consume(TokenType::CParen, "Expect ')' after condition.")?;

        let then_jump = self.emit_jump(Instruction::JumpIfFalse);
        self.emit(Instruction::Pop);
        self.statement()?;
        let else_jump = self.emit_jump(Instruction::Jump);

        self.patch_jump(then_jump);
        self.emit(Instruction::Pop);
        if self.matches(TokenType::Else) {
            self.statement()?;
        }
        self.patch_jump(else_jump);
        Ok(())
    }

    fn while_statement(&mut self) -> Result<(), ()> {
        let loop_start = self.chunk_mut().len();
        self.consume(TokenType::OParen, "Expect '(' after 'while'.")?;
        self.expression()?;
        self.consume(TokenType::CParen, "Expect ')' after condition.")?;

        let exit_jump = self.emit_jump(Instruction::JumpIfFalse);
        self.emit(Instruction::Pop);
        self.statement()?;
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit(Instruction::Pop);
        Ok(())
    }

    fn for_statement(&mut self) -> Result<(), ()> {
        self.begin_scope();
        let result = self.for_clauses_and_body();
        self.end_scope();
        result
    }

    fn for_clauses_and_body(&mut self) -> Result<(), ()> {
        self.consume(TokenType::OParen, "Expect '(' after 'for'.")?;
        if self.matches(TokenType::Semicolon) {
            // No initializer.
        } else if self.matches(TokenType::Var) {
            self.var_declaration()?;
        } else {
            self.expression_statement()?;
        }

        let mut loop_start = self.chunk_mut().len();
        let mut exit_jump = None;
        if !self.matches(TokenType::Semicolon) {
            self.expression()?;
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.")?;
            exit_jump = Some(self.emit_jump(Instruction::JumpIfFalse));
            self.emit(Instruction::Pop);
        }

        if !self.matches(TokenType::CParen) {
            // The increment textually precedes the body but runs after it:
            // jump over it into the body, loop back to it, then from it to
            // the top of the loop.
            let body_jump = self.emit_jump(Instruction::Jump);
            let increment_start = self.chunk_mut().len();
            self.expression()?;
            self.emit(Instruction::Pop);
            self.consume(TokenType::CParen, "Expect ')' after for clauses.")?;

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement()?;
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit(Instruction::Pop);
        }
        Ok(())
    }

    fn return_statement(&mut self) -> Result<(), ()> {
        if self.state().typ == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }

        if self.matches(TokenType::Semicolon) {
            self.emit_return();
        } else {
            self.expression()?;
            self.consume(TokenType::Semicolon, "Expect ';' after return value.")?;
            self.emit(Instruction::Return);
        }
        Ok(())
    }

    //<<
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::ErrorsTracker;
    use pretty_assertions::assert_eq;

    fn compile(source: &str) -> (Heap, Result<ObjRef, ()>, ErrorsTracker) {
        let mut heap = Heap::new();
        let mut strings = Table::new();
        let mut tracker = ErrorsTracker::new();
        let result = Compiler::new(source, &mut heap, &mut strings, &mut tracker).compile();
        (heap, result, tracker)
    }

    fn code_of(heap: &Heap, function: ObjRef) -> Vec<u8> {
        let chunk = &heap.function(function).chunk;
        (0..chunk.len()).map(|offset| chunk.byte_at(offset)).collect()
    }

    fn first_error(tracker: &ErrorsTracker) -> String {
        tracker.errors[0].msg.clone()
    }

    #[test]
    fn arithmetic_respects_precedence() {
        let (heap, result, _) = compile("print 1 + 2 * 3;");
        let script = result.unwrap();

        let constant: u8 = Instruction::Constant.into();
        assert_eq!(
            code_of(&heap, script),
            vec![
                constant,
                0,
                constant,
                1,
                constant,
                2,
                Instruction::Multiply.into(),
                Instruction::Add.into(),
                Instruction::Print.into(),
                Instruction::Nil.into(),
                Instruction::Return.into(),
            ]
        );
    }

    #[test]
    fn comparison_pairs_compile_to_negations() {
        let (heap, result, _) = compile("1 <= 2;");
        let script = result.unwrap();
        let code = code_of(&heap, script);
        // `<=` is GREATER then NOT.
        assert_eq!(
            &code[4..7],
            &[
                Instruction::Greater.into(),
                Instruction::Not.into(),
                Instruction::Pop.into()
            ]
        );
    }

    #[test]
    fn string_literals_are_interned_once() {
        let (heap, result, _) = compile("\"twin\"; \"twin\";");
        let script = result.unwrap();
        let chunk = &heap.function(script).chunk;
        assert_eq!(chunk.constant_at(0), chunk.constant_at(1));
    }

    #[test]
    fn functions_carry_arity_and_name() {
        let (heap, result, tracker) = compile("fun add(a, b) { return a + b; }");
        assert!(tracker.errors.is_empty());
        let script = result.unwrap();

        let function = heap.function(script).chunk.constant_at(1).as_obj();
        assert_eq!(heap.function(function).arity, 2);
        assert_eq!(heap.function_name(function), Some("add"));
    }

    #[test]
    fn closures_record_their_captures() {
        let (heap, result, tracker) =
            compile("fun outer() { var x = 1; fun inner() { return x; } }");
        assert!(tracker.errors.is_empty());
        let script = result.unwrap();

        let outer = heap.function(script).chunk.constant_at(1).as_obj();
        let outer_chunk = &heap.function(outer).chunk;
        let inner = outer_chunk.constant_at(1).as_obj();
        assert_eq!(heap.function(inner).up_values_count, 1);

        // The Closure instruction encodes one (is_local=1, index=1) pair.
        let code = code_of(&heap, outer);
        let closure_at = code
            .iter()
            .position(|byte| *byte == Instruction::Closure.into())
            .unwrap();
        assert_eq!(&code[closure_at + 2..closure_at + 4], &[1, 1]);
    }

    #[test]
    fn control_flow_disassembles_cleanly() {
        let (heap, result, _) =
            compile("var i = 0; while (i < 3) { i = i + 1; } if (i > 1) print i; else print 0;");
        let script = result.unwrap();
        let chunk = &heap.function(script).chunk;

        // Every decoded instruction lands inside the chunk and the decoding
        // consumes the code exactly.
        let mut offset = 0;
        while offset < chunk.len() {
            let (_, size) = chunk.disassemble_instr_at(&heap, offset);
            offset += size;
        }
        assert_eq!(offset, chunk.len());
    }

    #[test]
    fn missing_operand_reports_expect_expression() {
        let (_, result, tracker) = compile("print 1 +;");
        assert!(result.is_err());
        assert_eq!(first_error(&tracker), "Expect expression.");
        assert_eq!(
            tracker.errors[0].to_string(),
            "[line 1] Error at ';': Expect expression."
        );
    }

    #[test]
    fn invalid_assignment_target() {
        let (_, result, tracker) = compile("var a; var b; a * b = 1;");
        assert!(result.is_err());
        assert_eq!(first_error(&tracker), "Invalid assignment target.");
    }

    #[test]
    fn top_level_return_is_rejected() {
        let (_, result, tracker) = compile("return 1;");
        assert!(result.is_err());
        assert_eq!(first_error(&tracker), "Can't return from top-level code.");
    }

    #[test]
    fn reading_a_local_in_its_own_initializer() {
        let (_, result, tracker) = compile("{ var a = a; }");
        assert!(result.is_err());
        assert_eq!(
            first_error(&tracker),
            "Can't read local variable in its own initializer."
        );
    }

    #[test]
    fn duplicate_locals_in_one_scope() {
        let (_, result, tracker) = compile("{ var a = 1; var a = 2; }");
        assert!(result.is_err());
        assert_eq!(
            first_error(&tracker),
            "Already a variable with same name in this scope."
        );
    }

    #[test]
    fn global_redeclaration_is_allowed() {
        let (_, result, tracker) = compile("var a = 1; var a = 2;");
        assert!(result.is_ok());
        assert!(tracker.errors.is_empty());
    }

    #[test]
    fn shadowing_in_an_inner_scope_is_allowed() {
        let (_, result, tracker) = compile("{ var a = 1; { var a = 2; } }");
        assert!(result.is_ok());
        assert!(tracker.errors.is_empty());
    }

    #[test]
    fn error_recovery_reaches_later_statements() {
        // Both statements are bad; synchronization lets the second report.
        let (_, result, tracker) = compile("print 1 +;\nreturn 2;");
        assert!(result.is_err());
        assert_eq!(tracker.errors.len(), 2);
        assert_eq!(tracker.errors[1].msg, "Can't return from top-level code.");
    }

    #[test]
    fn scan_errors_surface_through_the_compiler() {
        let (_, result, tracker) = compile("var a = \"open;");
        assert!(result.is_err());
        assert_eq!(first_error(&tracker), "Unterminated string.");
    }
}
