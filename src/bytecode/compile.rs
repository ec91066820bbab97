use std::rc::Rc;

use crate::{
    bytecode::{
        CodeObject, Op,
        compile_error::CompileError,
        ir::{ClassProto, Constant, EnumProto, FunctionProto, InterfaceProto, MethodSig, Param},
        op::BinOp,
    },
    frontend::{Span, Spanned, Token},
    lang::{Generic, Type},
};

/// Binding power of infix operators, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Lowest,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    New,
    Unary,
    Call,
}

/// Where a pending `out`/`go` jump lands once its loop is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopLabel {
    Exit,
    Continue,
}

#[derive(Debug, Default)]
struct LoopContext {
    pending: Vec<(LoopLabel, usize)>,
}

/// A code object under construction plus its open loops.
struct CodeUnit {
    code: CodeObject,
    loops: Vec<LoopContext>,
}

impl CodeUnit {
    fn new(name: &str) -> Self {
        Self {
            code: CodeObject::new(name),
            loops: Vec::new(),
        }
    }
}

/// Single-pass compiler: a Pratt parser that emits bytecode as it reads
/// tokens, with no syntax tree in between.
///
/// Blocks are delimited by indentation. A block body starts on the line after
/// its header, indented deeper than the header, and runs for as long as new
/// lines keep that indentation.
///
/// Function and class bodies are compiled into their own `CodeObject`, which
/// becomes a constant of the enclosing one.
pub struct Compiler {
    tokens: Vec<Spanned>,
    pos: usize,
    /// Line of the most recently consumed token.
    line: usize,
    unit: CodeUnit,
    enclosing: Vec<CodeUnit>,
}

impl Compiler {
    pub fn new(mut tokens: Vec<Spanned>) -> Self {
        if !matches!(tokens.last(), Some(s) if s.token == Token::Eof) {
            let line = tokens.last().map(|s| s.span.line).unwrap_or(1);
            tokens.push(Spanned {
                token: Token::Eof,
                span: Span {
                    line,
                    col: 1,
                    indent: 0,
                },
            });
        }
        Self {
            tokens,
            pos: 0,
            line: 0,
            unit: CodeUnit::new("main"),
            enclosing: Vec::new(),
        }
    }

    /// Compile a whole program into a code object named `main`.
    pub fn compile(self) -> Result<CodeObject, CompileError> {
        self.compile_named("main")
    }

    pub fn compile_named(mut self, name: &str) -> Result<CodeObject, CompileError> {
        self.unit.code.name = name.to_string();

        if !self.check(&Token::Eof) {
            let indent = self.current().span.indent;
            self.statements(indent)?;
        }
        if !self.check(&Token::Eof) {
            return Err(self.unexpected("end of input"));
        }
        self.emit(Op::Return);

        if !self.enclosing.is_empty() {
            return Err(CompileError::internal("unclosed code unit at end of input"));
        }
        Ok(self.unit.code)
    }

    // =========================================================================
    // Token stream
    // =========================================================================

    fn current(&self) -> &Spanned {
        // `new` guarantees a trailing Eof, so the stream is never empty.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek(&self) -> &Token {
        &self.current().token
    }

    fn next_token(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos + 1)
    }

    /// Consume the current token. Eof is never consumed past.
    fn advance(&mut self) -> Spanned {
        let spanned = self.current().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        self.line = spanned.span.line;
        spanned
    }

    fn check(&self, token: &Token) -> bool {
        self.peek() == token
    }

    /// True when the current token sits on a later line than the last
    /// consumed one, or the input is exhausted.
    fn at_line_end(&self) -> bool {
        self.check(&Token::Eof) || self.current().span.line != self.line
    }

    fn unexpected(&self, expected: &str) -> CompileError {
        let current = self.current();
        if current.token == Token::Eof {
            CompileError::eof(self.line, expected)
        } else {
            CompileError::unexpected(current.span.line, &current.token, expected)
        }
    }

    fn expect(&mut self, token: Token, expected: &str) -> Result<Span, CompileError> {
        if self.check(&token) {
            Ok(self.advance().span)
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn expect_ident(&mut self, expected: &str) -> Result<(String, Span), CompileError> {
        match self.peek() {
            Token::Ident(name) => {
                let name = name.clone();
                let span = self.advance().span;
                Ok((name, span))
            }
            _ => Err(self.unexpected(expected)),
        }
    }

    // =========================================================================
    // Emission
    // =========================================================================

    fn emit(&mut self, op: Op) -> usize {
        let line = self.line;
        self.unit.code.emit(op, line)
    }

    fn emit_constant(&mut self, constant: Constant) {
        let idx = self.unit.code.add_constant(constant);
        self.emit(Op::Const(idx));
    }

    /// Backward jump to an already known target.
    fn emit_loop(&mut self, target: usize) {
        self.emit(Op::Jump(target));
        self.unit.code.jump_targets.insert(target);
    }

    /// Point the jump at `at` to the next instruction to be emitted.
    fn patch_here(&mut self, at: usize) {
        let here = self.unit.code.len();
        self.unit.code.patch_jump(at, here);
    }

    /// Compile an indented body into a fresh code object.
    fn body(&mut self, name: &str, header: Span) -> Result<CodeObject, CompileError> {
        let outer = std::mem::replace(&mut self.unit, CodeUnit::new(name));
        self.enclosing.push(outer);

        self.block(header)?;
        self.emit(Op::Return);

        let outer = self
            .enclosing
            .pop()
            .ok_or_else(|| CompileError::internal("code unit stack underflow"))?;
        Ok(std::mem::replace(&mut self.unit, outer).code)
    }

    // =========================================================================
    // Blocks
    // =========================================================================

    fn block(&mut self, header: Span) -> Result<(), CompileError> {
        let first = self.current().span;
        if self.check(&Token::Eof) {
            return Err(CompileError::no_block(header.line, "expected an indented body"));
        }
        if !self.at_line_end() {
            return Err(CompileError::no_block(
                first.line,
                "body must start on a new line",
            ));
        }
        if first.indent <= header.indent {
            return Err(CompileError::no_block(
                first.line,
                "body must be indented deeper than its header",
            ));
        }
        self.statements(first.indent)
    }

    fn statements(&mut self, indent: usize) -> Result<(), CompileError> {
        self.lines(indent, |c| {
            c.statement()?;
            c.statement_end()
        })
    }

    /// Run `item` for every line of a block whose lines start at `indent`.
    /// A shallower line ends the block; a deeper one is an error.
    fn lines<F>(&mut self, indent: usize, mut item: F) -> Result<(), CompileError>
    where
        F: FnMut(&mut Self) -> Result<(), CompileError>,
    {
        loop {
            item(self)?;

            if self.check(&Token::Eof) {
                return Ok(());
            }
            let span = self.current().span;
            if span.line == self.line {
                continue;
            }
            if span.indent < indent {
                return Ok(());
            }
            if span.indent > indent {
                return Err(CompileError::no_block(span.line, "unexpected indentation"));
            }
        }
    }

    fn statement_end(&mut self) -> Result<(), CompileError> {
        if self.check(&Token::Semicolon) {
            while self.check(&Token::Semicolon) {
                self.advance();
            }
            return Ok(());
        }
        if self.at_line_end() {
            Ok(())
        } else {
            Err(self.unexpected("end of statement"))
        }
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn statement(&mut self) -> Result<(), CompileError> {
        match self.peek() {
            Token::Def => self.def_statement(),
            Token::If => self.if_statement(),
            Token::Aop => self.aop_statement(),
            Token::For => self.for_statement(),
            Token::Out => self.loop_control(LoopLabel::Exit),
            Token::Go => self.loop_control(LoopLabel::Continue),
            Token::Ret => self.ret_statement(),
            Token::Use => self.use_statement(),
            Token::Ident(_) if self.is_declaration() => self.var_decl(),
            _ => self.expression_statement(),
        }
    }

    /// `name Type = ...` shorthand; only types starting with a name or `{`
    /// qualify, since `[` and `(` after a name are indexing and calls.
    fn is_declaration(&self) -> bool {
        let line = self.current().span.line;
        matches!(self.peek(), Token::Ident(_))
            && matches!(
                self.next_token(),
                Some(next) if next.span.line == line
                    && matches!(next.token, Token::Ident(_) | Token::LBrace)
            )
    }

    /// Declaration or expression, as allowed in a `for` initializer.
    fn simple_statement(&mut self) -> Result<(), CompileError> {
        match self.peek() {
            Token::Def => {
                self.advance();
                let (name, _) = self.expect_ident("a variable name")?;
                self.var_rest(name)
            }
            Token::Ident(_) if self.is_declaration() => self.var_decl(),
            _ => self.expression_statement(),
        }
    }

    fn expression_statement(&mut self) -> Result<(), CompileError> {
        self.parse_precedence(Precedence::Lowest, true)?;
        let assigned = self.unit.code.ops.last().is_some_and(Op::is_assignment);
        if !assigned {
            self.emit(Op::Pop);
        }
        Ok(())
    }

    fn var_decl(&mut self) -> Result<(), CompileError> {
        let (name, _) = self.expect_ident("a variable name")?;
        self.var_rest(name)
    }

    fn var_rest(&mut self, name: String) -> Result<(), CompileError> {
        let ty = self.parse_type()?;
        self.expect(Token::Assign, "'='")?;
        self.expression(Precedence::Lowest)?;

        let name = self.unit.code.add_name(&name);
        let ty = self.unit.code.add_type(ty);
        self.emit(Op::Store { name, ty });
        Ok(())
    }

    fn def_statement(&mut self) -> Result<(), CompileError> {
        let header = self.advance().span;

        let generics = if self.check(&Token::Lt) {
            self.generics()?
        } else {
            Vec::new()
        };

        if self.check(&Token::LParen) {
            return self.function(header, generics);
        }

        let (name, _) = self.expect_ident("a name after 'def'")?;
        if self.check(&Token::Def) {
            self.advance();
            return self.class(header, name, generics);
        }
        if !generics.is_empty() {
            return Err(CompileError::invalid_generic(
                header.line,
                "generics apply only to functions and classes",
            ));
        }
        if self.at_line_end() {
            return self.interface_or_enum(header, name);
        }
        self.var_rest(name)
    }

    /// `<T, N: int | float>`
    fn generics(&mut self) -> Result<Vec<Generic>, CompileError> {
        let open = self.advance().span;
        if self.check(&Token::Gt) {
            return Err(CompileError::invalid_generic(open.line, "empty generic list"));
        }

        let mut generics: Vec<Generic> = Vec::new();
        loop {
            let (name, span) = self.expect_ident("a generic name")?;
            if Type::is_primitive_name(&name) {
                return Err(CompileError::invalid_generic(
                    span.line,
                    format!("'{}' is a primitive type", name),
                ));
            }
            if generics.iter().any(|g| g.name == name) {
                return Err(CompileError::invalid_generic(
                    span.line,
                    format!("duplicate generic name '{}'", name),
                ));
            }

            let mut constraint = Vec::new();
            if self.check(&Token::Colon) {
                self.advance();
                constraint.push(self.parse_type()?);
                while self.check(&Token::Pipe) {
                    self.advance();
                    constraint.push(self.parse_type()?);
                }
            }
            generics.push(Generic { name, constraint });

            if self.check(&Token::Comma) {
                self.advance();
                continue;
            }
            self.expect(Token::Gt, "'>' or ','")?;
            return Ok(generics);
        }
    }

    /// ```text
    /// def <T> (a int, b, c float, rest ...int) name -> Ret
    ///     body
    /// ```
    fn function(&mut self, header: Span, generics: Vec<Generic>) -> Result<(), CompileError> {
        let (params, variadic) = self.params()?;
        let (name, _) = self.expect_ident("a function name")?;
        let ret = if self.check(&Token::Arrow) {
            self.advance();
            Some(self.parse_type()?)
        } else {
            None
        };

        let code = self.body(&name, header)?;
        let proto = FunctionProto {
            name,
            generics,
            params,
            variadic,
            ret,
            code: Rc::new(code),
        };
        let idx = self
            .unit
            .code
            .add_constant(Constant::Function(Rc::new(proto)));
        self.emit(Op::DefFunc(idx));
        Ok(())
    }

    fn params(&mut self) -> Result<(Vec<Param>, Option<Param>), CompileError> {
        self.advance();

        let mut params = Vec::new();
        let mut untyped: Vec<String> = Vec::new();
        let mut variadic = None;

        while !self.check(&Token::RParen) {
            if variadic.is_some() {
                return Err(CompileError::syntax(
                    self.current().span.line,
                    "variadic parameter must be last",
                ));
            }

            let (name, span) = self.expect_ident("a parameter name")?;
            if self.check(&Token::Ellipsis) {
                self.advance();
                if let Some(first) = untyped.first() {
                    return Err(CompileError::syntax(
                        span.line,
                        format!("parameter '{}' has no type", first),
                    ));
                }
                let ty = self.parse_type()?;
                variadic = Some(Param { name, ty });
            } else if self.check(&Token::Comma) || self.check(&Token::RParen) {
                untyped.push(name);
            } else {
                let ty = self.parse_type()?;
                for pending in untyped.drain(..) {
                    params.push(Param {
                        name: pending,
                        ty: ty.clone(),
                    });
                }
                params.push(Param { name, ty });
            }

            if !self.check(&Token::RParen) {
                self.expect(Token::Comma, "',' or ')'")?;
            }
        }

        if let Some(first) = untyped.first() {
            return Err(CompileError::syntax(
                self.line,
                format!("parameter '{}' has no type", first),
            ));
        }
        self.advance();
        Ok((params, variadic))
    }

    fn class(&mut self, header: Span, name: String, generics: Vec<Generic>) -> Result<(), CompileError> {
        let code = self.body(&name, header)?;
        let proto = ClassProto {
            name,
            generics,
            code: Rc::new(code),
        };
        let idx = self.unit.code.add_constant(Constant::Class(Rc::new(proto)));
        self.emit(Op::DefClass(idx));
        Ok(())
    }

    fn interface_or_enum(&mut self, header: Span, name: String) -> Result<(), CompileError> {
        let first = self.current().span;
        if self.check(&Token::Eof) || first.indent <= header.indent {
            return Err(CompileError::no_block(
                header.line,
                format!("'{}' needs an indented body", name),
            ));
        }

        if self.check(&Token::Backslash) {
            self.interface(name, first.indent)
        } else {
            self.enumeration(name, first.indent)
        }
    }

    /// Method lines: `\int, int\ add -> int`, `\\ reset`.
    fn interface(&mut self, name: String, indent: usize) -> Result<(), CompileError> {
        let mut methods = Vec::new();
        self.lines(indent, |c| {
            methods.push(c.method_sig()?);
            if c.at_line_end() {
                Ok(())
            } else {
                Err(c.unexpected("end of method signature"))
            }
        })?;

        let proto = InterfaceProto { name, methods };
        let idx = self
            .unit
            .code
            .add_constant(Constant::Interface(Rc::new(proto)));
        self.emit(Op::DefInterface(idx));
        Ok(())
    }

    fn method_sig(&mut self) -> Result<MethodSig, CompileError> {
        self.expect(Token::Backslash, "'\\' opening a method signature")?;
        let mut params = Vec::new();
        while !self.check(&Token::Backslash) {
            params.push(self.parse_type()?);
            if !self.check(&Token::Backslash) {
                self.expect(Token::Comma, "',' or '\\'")?;
            }
        }
        self.advance();

        let (name, _) = self.expect_ident("a method name")?;
        let ret = if self.check(&Token::Arrow) {
            self.advance();
            Some(self.parse_type()?)
        } else {
            None
        };
        Ok(MethodSig { name, params, ret })
    }

    fn enumeration(&mut self, name: String, indent: usize) -> Result<(), CompileError> {
        let mut members: Vec<String> = Vec::new();
        self.lines(indent, |c| loop {
            let (member, span) = c.expect_ident("an enum member")?;
            if members.contains(&member) {
                return Err(CompileError::syntax(
                    span.line,
                    format!("duplicate enum member '{}'", member),
                ));
            }
            members.push(member);
            if c.check(&Token::Comma) {
                c.advance();
            }
            if c.at_line_end() {
                return Ok(());
            }
        })?;

        let proto = EnumProto { name, members };
        let idx = self.unit.code.add_constant(Constant::Enum(Rc::new(proto)));
        self.emit(Op::DefEnum(idx));
        Ok(())
    }

    /// ```text
    /// if a          a; JumpIfFalse(L1)
    ///     x         x; Jump(END)
    /// ef b      L1: b; JumpIfFalse(L2)
    ///     y         y; Jump(END)
    /// nf        L2: z
    ///     z    END:
    /// ```
    fn if_statement(&mut self) -> Result<(), CompileError> {
        let header = self.advance().span;
        self.expression(Precedence::Lowest)?;
        let mut next_branch = Some(self.emit(Op::JumpIfFalse(0)));
        self.block(header)?;

        let mut exits = Vec::new();
        while self.continues_chain(header) {
            exits.push(self.emit(Op::Jump(0)));
            if let Some(at) = next_branch.take() {
                self.patch_here(at);
            }

            let branch = self.advance();
            if branch.token == Token::Ef {
                self.expression(Precedence::Lowest)?;
                next_branch = Some(self.emit(Op::JumpIfFalse(0)));
                self.block(branch.span)?;
            } else {
                self.block(branch.span)?;
                break;
            }
        }

        if let Some(at) = next_branch {
            self.patch_here(at);
        }
        for at in exits {
            self.patch_here(at);
        }
        Ok(())
    }

    fn continues_chain(&self, header: Span) -> bool {
        matches!(self.peek(), Token::Ef | Token::Nf)
            && self.at_line_end()
            && self.current().span.indent == header.indent
    }

    /// ```text
    /// aop cond    BEGIN: cond; JumpIfFalse(END)
    ///     body           body
    ///                    Jump(BEGIN)
    ///               END:
    /// ```
    /// `go` lands on BEGIN, `out` on END.
    fn aop_statement(&mut self) -> Result<(), CompileError> {
        let header = self.advance().span;
        let begin = self.unit.code.len();
        self.unit.loops.push(LoopContext::default());

        let exit = if self.check(&Token::Arrow) {
            self.advance();
            None
        } else if self.at_line_end() {
            None
        } else {
            self.expression(Precedence::Lowest)?;
            Some(self.emit(Op::JumpIfFalse(0)))
        };

        self.block(header)?;
        self.emit_loop(begin);

        let end = self.unit.code.len();
        if let Some(at) = exit {
            self.unit.code.patch_jump(at, end);
        }
        self.close_loop(begin, end);
        Ok(())
    }

    /// ```text
    /// for init; cond; update        init
    ///     body               BEGIN: cond; JumpIfFalse(END)
    ///                               Jump(BODY)
    ///                       UPDATE: update
    ///                               Jump(BEGIN)
    ///                         BODY: body
    ///                               Jump(UPDATE)
    ///                          END:
    /// ```
    /// `go` lands on UPDATE, `out` on END.
    fn for_statement(&mut self) -> Result<(), CompileError> {
        let header = self.advance().span;

        if !self.check(&Token::Semicolon) {
            self.simple_statement()?;
        }
        self.expect(Token::Semicolon, "';' after the loop initializer")?;

        let begin = self.unit.code.len();
        let exit = if self.check(&Token::Semicolon) {
            None
        } else {
            self.expression(Precedence::Lowest)?;
            Some(self.emit(Op::JumpIfFalse(0)))
        };
        self.expect(Token::Semicolon, "';' after the loop condition")?;
        let to_body = self.emit(Op::Jump(0));

        let update = self.unit.code.len();
        if !self.at_line_end() {
            self.expression_statement()?;
        }
        self.emit_loop(begin);
        self.patch_here(to_body);

        self.unit.loops.push(LoopContext::default());
        self.block(header)?;
        self.emit_loop(update);

        let end = self.unit.code.len();
        if let Some(at) = exit {
            self.unit.code.patch_jump(at, end);
        }
        self.close_loop(update, end);
        Ok(())
    }

    /// `out`/`go` followed by `->`, a condition, or nothing.
    fn loop_control(&mut self, label: LoopLabel) -> Result<(), CompileError> {
        let keyword = self.advance();
        if self.unit.loops.is_empty() {
            return Err(CompileError::outside_loop(
                keyword.span.line,
                keyword.token.to_string(),
            ));
        }

        let at = if self.check(&Token::Arrow) {
            self.advance();
            self.emit(Op::Jump(0))
        } else if self.at_line_end() || self.check(&Token::Semicolon) {
            self.emit(Op::Jump(0))
        } else {
            self.expression(Precedence::Lowest)?;
            self.emit(Op::JumpIfTrue(0))
        };

        if let Some(ctx) = self.unit.loops.last_mut() {
            ctx.pending.push((label, at));
        }
        Ok(())
    }

    fn close_loop(&mut self, continue_at: usize, exit_at: usize) {
        if let Some(ctx) = self.unit.loops.pop() {
            for (label, at) in ctx.pending {
                let target = match label {
                    LoopLabel::Exit => exit_at,
                    LoopLabel::Continue => continue_at,
                };
                self.unit.code.patch_jump(at, target);
            }
        }
    }

    fn ret_statement(&mut self) -> Result<(), CompileError> {
        self.advance();
        if self.check(&Token::Arrow) {
            self.advance();
            self.emit(Op::Return);
        } else if self.at_line_end() || self.check(&Token::Semicolon) {
            self.emit(Op::Return);
        } else {
            self.expression(Precedence::Lowest)?;
            self.emit(Op::ReturnValue);
        }
        Ok(())
    }

    /// `use a.b.c` or `use <- a.b.c`
    fn use_statement(&mut self) -> Result<(), CompileError> {
        self.advance();
        let merge = if self.check(&Token::LArrow) {
            self.advance();
            true
        } else {
            false
        };

        let (mut path, _) = self.expect_ident("a module path")?;
        while self.check(&Token::Dot) {
            self.advance();
            let (segment, _) = self.expect_ident("a module path segment")?;
            path.push('.');
            path.push_str(&segment);
        }

        let path = self.unit.code.add_name(&path);
        self.emit(Op::Use { path, merge });
        Ok(())
    }

    // =========================================================================
    // Types
    // =========================================================================

    fn parse_type(&mut self) -> Result<Type, CompileError> {
        let tok = self.advance();
        match tok.token {
            Token::Ident(name) => Ok(Type::from_name(&name)),
            Token::LBracket => {
                let elem = self.parse_type()?;
                self.expect(Token::RBracket, "']'")?;
                Ok(Type::Array(Box::new(elem)))
            }
            Token::LParen => {
                let elem = self.parse_type()?;
                self.expect(Token::RParen, "')'")?;
                Ok(Type::Tuple(Box::new(elem)))
            }
            Token::LBrace => {
                let key = self.parse_type()?;
                self.expect(Token::Colon, "':'")?;
                let value = self.parse_type()?;
                self.expect(Token::RBrace, "'}'")?;
                Ok(Type::Map(Box::new(key), Box::new(value)))
            }
            Token::Pipe => self.function_type(),
            Token::Eof => Err(CompileError::eof(tok.span.line, "a type")),
            other => Err(CompileError::unexpected(tok.span.line, other, "a type")),
        }
    }

    /// `|A, B, ...C| -> R`, the opening `|` already consumed.
    fn function_type(&mut self) -> Result<Type, CompileError> {
        let mut params = Vec::new();
        let mut variadic = None;

        while !self.check(&Token::Pipe) {
            if variadic.is_some() {
                return Err(CompileError::syntax(
                    self.current().span.line,
                    "variadic parameter must be last",
                ));
            }
            if self.check(&Token::Ellipsis) {
                self.advance();
                variadic = Some(Box::new(self.parse_type()?));
            } else {
                params.push(self.parse_type()?);
            }
            if !self.check(&Token::Pipe) {
                self.expect(Token::Comma, "',' or '|'")?;
            }
        }
        self.advance();

        let ret = if self.check(&Token::Arrow) {
            self.advance();
            Some(Box::new(self.parse_type()?))
        } else {
            None
        };
        Ok(Type::Function {
            params,
            variadic,
            ret,
        })
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn expression(&mut self, prec: Precedence) -> Result<(), CompileError> {
        self.parse_precedence(prec, false)
    }

    /// Assignment is only legal for a whole expression statement.
    fn parse_precedence(&mut self, prec: Precedence, can_assign: bool) -> Result<(), CompileError> {
        self.prefix(can_assign)?;

        while !self.at_line_end() && infix_precedence(self.peek()) > prec {
            self.infix(can_assign)?;
        }

        if !self.at_line_end() && (self.check(&Token::Assign) || self.peek().is_compound_assign()) {
            return Err(CompileError::InvalidAssignment {
                line: self.current().span.line,
            });
        }
        Ok(())
    }

    fn prefix(&mut self, can_assign: bool) -> Result<(), CompileError> {
        let tok = self.advance();
        match tok.token {
            Token::Int(n) => self.emit_constant(Constant::Int(n)),
            Token::Float(n) => self.emit_constant(Constant::Float(n)),
            Token::Char(c) => self.emit_constant(Constant::Char(c)),
            Token::Str(s) => self.emit_constant(Constant::Str(s)),
            Token::True => self.emit_constant(Constant::Bool(true)),
            Token::False => self.emit_constant(Constant::Bool(false)),
            Token::Nil => self.emit_constant(Constant::Nil),
            Token::Ident(name) => self.name(&name, can_assign)?,
            Token::LParen => self.group()?,
            Token::LBracket => {
                let count = self.sequence(Token::RBracket, "',' or ']'")?;
                self.emit(Op::BuildArray(count));
            }
            Token::LBrace => self.map()?,
            Token::Minus => {
                self.expression(Precedence::Unary)?;
                self.emit(Op::Neg);
            }
            Token::Bang => {
                self.expression(Precedence::Unary)?;
                self.emit(Op::Not);
            }
            Token::New => self.new_instance()?,
            Token::Eof => return Err(CompileError::eof(tok.span.line, "an expression")),
            other => return Err(CompileError::no_prefix(tok.span.line, other)),
        }
        Ok(())
    }

    fn infix(&mut self, can_assign: bool) -> Result<(), CompileError> {
        let tok = self.advance();
        match tok.token {
            Token::LParen => {
                let argc = self.sequence(Token::RParen, "',' or ')'")?;
                self.emit(Op::Call(argc));
            }
            Token::LBracket => self.index(can_assign)?,
            Token::Dot => self.member(can_assign)?,
            other => match binary_op(&other) {
                Some((op, prec)) => {
                    self.expression(prec)?;
                    self.emit(Op::Binary(op));
                }
                None => {
                    return Err(CompileError::unexpected(tok.span.line, other, "an operator"));
                }
            },
        }
        Ok(())
    }

    /// Consume `=` or a compound assignment operator if assignment is
    /// allowed here. `Some(None)` is plain `=`.
    fn match_assignment(&mut self, can_assign: bool) -> Option<Option<BinOp>> {
        if !can_assign || self.at_line_end() {
            return None;
        }
        let op = match self.peek() {
            Token::Assign => None,
            Token::PlusEq => Some(BinOp::Add),
            Token::MinusEq => Some(BinOp::Sub),
            Token::StarEq => Some(BinOp::Mul),
            Token::SlashEq => Some(BinOp::Div),
            Token::PercentEq => Some(BinOp::Mod),
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn name(&mut self, name: &str, can_assign: bool) -> Result<(), CompileError> {
        let idx = self.unit.code.add_name(name);
        match self.match_assignment(can_assign) {
            Some(None) => {
                self.expression(Precedence::Lowest)?;
                self.emit(Op::Assign(idx));
            }
            Some(Some(op)) => {
                self.expression(Precedence::Lowest)?;
                self.emit(Op::AssignOp(idx, op));
            }
            None => {
                self.emit(Op::Load(idx));
            }
        }
        Ok(())
    }

    /// `()`, `(e)`, `(e,)`, `(a, b, ...)`
    fn group(&mut self) -> Result<(), CompileError> {
        if self.check(&Token::RParen) {
            self.advance();
            self.emit(Op::BuildTuple(0));
            return Ok(());
        }

        self.expression(Precedence::Lowest)?;
        if self.check(&Token::RParen) {
            self.advance();
            return Ok(());
        }

        let mut count = 1;
        while self.check(&Token::Comma) {
            self.advance();
            if self.check(&Token::RParen) {
                break;
            }
            self.expression(Precedence::Lowest)?;
            count += 1;
        }
        self.expect(Token::RParen, "',' or ')'")?;
        self.emit(Op::BuildTuple(count));
        Ok(())
    }

    /// Comma-separated expressions up to `close`; returns how many.
    fn sequence(&mut self, close: Token, expected: &str) -> Result<usize, CompileError> {
        let mut count = 0;
        while !self.check(&close) {
            self.expression(Precedence::Lowest)?;
            count += 1;
            if !self.check(&close) {
                self.expect(Token::Comma, expected)?;
            }
        }
        self.advance();
        Ok(count)
    }

    /// `{k: v, ...}`
    fn map(&mut self) -> Result<(), CompileError> {
        let mut count = 0;
        while !self.check(&Token::RBrace) {
            self.expression(Precedence::Lowest)?;
            self.expect(Token::Colon, "':'")?;
            self.expression(Precedence::Lowest)?;
            count += 1;
            if !self.check(&Token::RBrace) {
                self.expect(Token::Comma, "',' or '}'")?;
            }
        }
        self.advance();
        self.emit(Op::BuildMap(count));
        Ok(())
    }

    /// `new T{field: e, ...}`
    fn new_instance(&mut self) -> Result<(), CompileError> {
        self.expression(Precedence::New)?;
        self.expect(Token::LBrace, "'{' after the class in 'new'")?;

        let mut fields = Vec::new();
        while !self.check(&Token::RBrace) {
            let (field, _) = self.expect_ident("a field name")?;
            self.expect(Token::Colon, "':'")?;
            self.expression(Precedence::Lowest)?;
            fields.push(self.unit.code.add_name(&field));
            if !self.check(&Token::RBrace) {
                self.expect(Token::Comma, "',' or '}'")?;
            }
        }
        self.advance();
        self.emit(Op::New(fields));
        Ok(())
    }

    fn index(&mut self, can_assign: bool) -> Result<(), CompileError> {
        self.expression(Precedence::Lowest)?;
        self.expect(Token::RBracket, "']'")?;
        match self.match_assignment(can_assign) {
            Some(None) => {
                self.expression(Precedence::Lowest)?;
                self.emit(Op::SetIndex);
            }
            Some(Some(op)) => {
                self.expression(Precedence::Lowest)?;
                self.emit(Op::IndexOp(op));
            }
            None => {
                self.emit(Op::Index);
            }
        }
        Ok(())
    }

    /// `x.name`, or `t.0` on tuples.
    fn member(&mut self, can_assign: bool) -> Result<(), CompileError> {
        let name = match self.peek() {
            Token::Ident(name) => name.clone(),
            Token::Int(n) if *n >= 0 => n.to_string(),
            _ => return Err(self.unexpected("a member name")),
        };
        self.advance();

        let idx = self.unit.code.add_name(&name);
        match self.match_assignment(can_assign) {
            Some(None) => {
                self.expression(Precedence::Lowest)?;
                self.emit(Op::SetMember(idx));
            }
            Some(Some(op)) => {
                self.expression(Precedence::Lowest)?;
                self.emit(Op::MemberOp(idx, op));
            }
            None => {
                self.emit(Op::GetMember(idx));
            }
        }
        Ok(())
    }
}

fn binary_op(token: &Token) -> Option<(BinOp, Precedence)> {
    let pair = match token {
        Token::Pipe => (BinOp::Or, Precedence::Or),
        Token::Amp => (BinOp::And, Precedence::And),
        Token::EqEq => (BinOp::Eq, Precedence::Equality),
        Token::NotEq => (BinOp::Ne, Precedence::Equality),
        Token::Gt => (BinOp::Gt, Precedence::Comparison),
        Token::GtEq => (BinOp::Ge, Precedence::Comparison),
        Token::Lt => (BinOp::Lt, Precedence::Comparison),
        Token::LtEq => (BinOp::Le, Precedence::Comparison),
        Token::Plus => (BinOp::Add, Precedence::Term),
        Token::Minus => (BinOp::Sub, Precedence::Term),
        Token::Star => (BinOp::Mul, Precedence::Factor),
        Token::Slash => (BinOp::Div, Precedence::Factor),
        Token::Percent => (BinOp::Mod, Precedence::Factor),
        _ => return None,
    };
    Some(pair)
}

fn infix_precedence(token: &Token) -> Precedence {
    match token {
        Token::LParen | Token::LBracket | Token::Dot => Precedence::Call,
        other => binary_op(other).map_or(Precedence::Lowest, |(_, prec)| prec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::Lexer;

    fn compile(source: &str) -> CodeObject {
        let tokens = Lexer::new(source).tokenize().unwrap();
        Compiler::new(tokens).compile().unwrap()
    }

    fn compile_err(source: &str) -> CompileError {
        let tokens = Lexer::new(source).tokenize().unwrap();
        Compiler::new(tokens).compile().unwrap_err()
    }

    fn assert_jumps_in_range(code: &CodeObject) {
        for op in &code.ops {
            if let Some(target) = op.jump_target() {
                assert!(target < code.len(), "jump to {} in {} ops", target, code.len());
            }
        }
        for child in code.children() {
            assert_jumps_in_range(child);
        }
    }

    // =========================================================================
    // Literals and precedence
    // =========================================================================

    #[test]
    fn test_literals_emit_one_constant_load() {
        let cases = [
            ("42", Constant::Int(42)),
            ("2.5", Constant::Float(2.5)),
            ("'a'", Constant::Char('a')),
            ("\"hi\"", Constant::Str("hi".to_string())),
        ];
        for (source, expected) in cases {
            let code = compile(source);
            assert_eq!(code.ops, vec![Op::Const(0), Op::Pop, Op::Return], "{}", source);
            assert_eq!(code.constants, vec![expected]);
        }
    }

    #[test]
    fn test_factor_binds_tighter_than_term() {
        let code = compile("1 + 2 * 3");
        assert_eq!(
            code.constants,
            vec![Constant::Int(1), Constant::Int(2), Constant::Int(3)]
        );
        assert_eq!(
            code.ops,
            vec![
                Op::Const(0),
                Op::Const(1),
                Op::Const(2),
                Op::Binary(BinOp::Mul),
                Op::Binary(BinOp::Add),
                Op::Pop,
                Op::Return,
            ]
        );
    }

    #[test]
    fn test_infix_must_share_the_line() {
        let code = compile("x int = 1\n-2");
        assert!(code.ops.contains(&Op::Neg));
        assert!(!code.ops.contains(&Op::Binary(BinOp::Sub)));
    }

    // =========================================================================
    // Declarations and assignment
    // =========================================================================

    #[test]
    fn test_declaration_and_assignment() {
        let code = compile("x int = 5\nx = x + 1");
        assert_eq!(code.names, vec!["x".to_string()]);
        assert_eq!(code.types, vec![Type::Int]);
        assert_eq!(
            code.ops,
            vec![
                Op::Const(0),
                Op::Store { name: 0, ty: 0 },
                Op::Load(0),
                Op::Const(1),
                Op::Binary(BinOp::Add),
                Op::Assign(0),
                Op::Return,
            ]
        );
    }

    #[test]
    fn test_def_and_shorthand_declarations_agree() {
        assert_eq!(compile("def m {string : int} = {}").ops, compile("m {string : int} = {}").ops);
    }

    #[test]
    fn test_semicolon_separates_statements() {
        let code = compile("x int = 1; y int = 2");
        let stores = code
            .ops
            .iter()
            .filter(|op| matches!(op, Op::Store { .. }))
            .count();
        assert_eq!(stores, 2);
    }

    #[test]
    fn test_index_and_member_assignment_leave_nothing() {
        let code = compile("a[0] = 1\np.x += 2");
        assert_eq!(
            code.ops,
            vec![
                Op::Load(0),
                Op::Const(0),
                Op::Const(1),
                Op::SetIndex,
                Op::Load(1),
                Op::Const(2),
                Op::MemberOp(2, BinOp::Add),
                Op::Return,
            ]
        );
    }

    #[test]
    fn test_tuple_member_by_position() {
        let code = compile("t.0");
        assert_eq!(code.names, vec!["t".to_string(), "0".to_string()]);
        assert_eq!(code.ops, vec![Op::Load(0), Op::GetMember(1), Op::Pop, Op::Return]);
    }

    #[test]
    fn test_invalid_assignment_target() {
        assert!(matches!(
            compile_err("1 + x = 2"),
            CompileError::InvalidAssignment { line: 1 }
        ));
        assert!(matches!(
            compile_err("f() = 1"),
            CompileError::InvalidAssignment { .. }
        ));
    }

    #[test]
    fn test_line_map() {
        let code = compile("x int = 1\n\ny int = 2");
        let stores: Vec<usize> = code
            .ops
            .iter()
            .enumerate()
            .filter(|(_, op)| matches!(op, Op::Store { .. }))
            .map(|(i, _)| code.line_at(i))
            .collect();
        assert_eq!(stores, vec![1, 3]);
    }

    // =========================================================================
    // Control flow
    // =========================================================================

    #[test]
    fn test_aop_layout() {
        let code = compile("i int = 0\naop i < 3\n    i += 1");
        assert_eq!(
            code.ops,
            vec![
                Op::Const(0),
                Op::Store { name: 0, ty: 0 },
                Op::Load(0),
                Op::Const(1),
                Op::Binary(BinOp::Lt),
                Op::JumpIfFalse(9),
                Op::Const(2),
                Op::AssignOp(0, BinOp::Add),
                Op::Jump(2),
                Op::Return,
            ]
        );
        assert!(code.jump_targets.contains(&2));
        assert!(code.jump_targets.contains(&9));
    }

    #[test]
    fn test_unconditional_loop_with_out() {
        let code = compile("aop ->\n    out");
        assert_eq!(code.ops, vec![Op::Jump(2), Op::Jump(0), Op::Return]);
    }

    #[test]
    fn test_for_layout() {
        let code = compile("for i int = 0; i < 3; i += 1\n    go i == 1");
        assert_eq!(code.ops[5], Op::JumpIfFalse(15));
        assert_eq!(code.ops[6], Op::Jump(10));
        assert_eq!(code.ops[9], Op::Jump(2));
        assert_eq!(code.ops[13], Op::JumpIfTrue(7));
        assert_eq!(code.ops[14], Op::Jump(7));
        assert_eq!(code.ops[15], Op::Return);
    }

    #[test]
    fn test_if_chain_patches_every_branch() {
        let code = compile("x int = 2\nif x == 1\n    x = 10\nef x == 2\n    x = 20\nnf\n    x = 30");
        assert_jumps_in_range(&code);
        let exits: Vec<usize> = code.ops.iter().filter_map(|op| match op {
            Op::Jump(t) => Some(*t),
            _ => None,
        }).collect();
        assert_eq!(exits.len(), 2);
        assert!(exits.iter().all(|t| *t == code.len() - 1));
    }

    #[test]
    fn test_nested_control_flow_targets_are_valid() {
        let source = "\
def (n int) f -> int
    t int = 0
    for i int = 0; i < n; i += 1
        if i % 2 == 0
            go ->
        ef i > 5
            aop t < 100
                t += i
                out t > 50
        nf
            t -= 1
    ret t
i int = 0
aop i < 3
    if i == 1
        i += 1
        go
    i += 1
";
        let code = compile(source);
        assert_jumps_in_range(&code);
    }

    #[test]
    fn test_loop_control_outside_loop() {
        assert!(matches!(
            compile_err("out"),
            CompileError::LoopControlOutsideLoop { line: 1, .. }
        ));
        // a function body is not inside the enclosing loop
        assert!(matches!(
            compile_err("aop ->\n    def () f\n        go"),
            CompileError::LoopControlOutsideLoop { line: 3, .. }
        ));
    }

    #[test]
    fn test_missing_block() {
        assert!(matches!(compile_err("if true\nx int = 1"), CompileError::NoBlock { .. }));
        assert!(matches!(compile_err("if true x = 1"), CompileError::NoBlock { .. }));
        assert!(matches!(compile_err("if true"), CompileError::NoBlock { .. }));
    }

    #[test]
    fn test_unexpected_indentation() {
        assert!(matches!(
            compile_err("x int = 1\n    y int = 2"),
            CompileError::NoBlock { line: 2, .. }
        ));
    }

    #[test]
    fn test_stray_ef_has_no_prefix() {
        assert!(matches!(compile_err("ef true"), CompileError::NoPrefix { .. }));
    }

    // =========================================================================
    // Definitions
    // =========================================================================

    #[test]
    fn test_function_prototype() {
        let code = compile("def (a, b int, rest ...float) f -> int\n    ret a");
        assert_eq!(code.ops, vec![Op::DefFunc(0), Op::Return]);

        let Constant::Function(proto) = &code.constants[0] else {
            panic!("expected a function constant");
        };
        assert_eq!(proto.name, "f");
        assert_eq!(
            proto.params,
            vec![
                Param { name: "a".to_string(), ty: Type::Int },
                Param { name: "b".to_string(), ty: Type::Int },
            ]
        );
        assert_eq!(
            proto.variadic,
            Some(Param { name: "rest".to_string(), ty: Type::Float })
        );
        assert_eq!(proto.ret, Some(Type::Int));
        assert_eq!(proto.code.ops, vec![Op::Load(0), Op::ReturnValue, Op::Return]);
    }

    #[test]
    fn test_untyped_trailing_parameter() {
        assert!(matches!(
            compile_err("def (a, b) f\n    ret"),
            CompileError::Syntax { .. }
        ));
    }

    #[test]
    fn test_generic_lists() {
        let code = compile("def <T, N: int | float> (a T, b N) f -> T\n    ret a");
        let Constant::Function(proto) = &code.constants[0] else {
            panic!("expected a function constant");
        };
        assert_eq!(proto.generics.len(), 2);
        assert_eq!(proto.generics[1].constraint, vec![Type::Int, Type::Float]);
        assert_eq!(proto.params[0].ty, Type::User("T".to_string()));
    }

    #[test]
    fn test_invalid_generics() {
        for source in [
            "def <T, T> (a T) f\n    ret a",
            "def <int> (a int) f\n    ret a",
            "def <> (a int) f\n    ret a",
        ] {
            assert!(
                matches!(compile_err(source), CompileError::InvalidGeneric { .. }),
                "{}",
                source
            );
        }
    }

    #[test]
    fn test_class_and_new() {
        let code = compile("def <T> Box def\n    v T = nil\nb Box = new Box{v: 1}");
        let Constant::Class(proto) = &code.constants[0] else {
            panic!("expected a class constant");
        };
        assert_eq!(proto.name, "Box");
        assert_eq!(proto.generics[0].name, "T");
        assert_eq!(code.ops[0], Op::DefClass(0));
        assert!(code.ops.iter().any(|op| matches!(op, Op::New(fields) if fields.len() == 1)));
    }

    #[test]
    fn test_interface_methods() {
        let code = compile("def Shape\n    \\\\ area -> float\n    \\int, int\\ scale");
        let Constant::Interface(proto) = &code.constants[0] else {
            panic!("expected an interface constant");
        };
        assert_eq!(
            proto.methods,
            vec![
                MethodSig { name: "area".to_string(), params: vec![], ret: Some(Type::Float) },
                MethodSig {
                    name: "scale".to_string(),
                    params: vec![Type::Int, Type::Int],
                    ret: None
                },
            ]
        );
        assert_eq!(code.ops, vec![Op::DefInterface(0), Op::Return]);
    }

    #[test]
    fn test_enum_members() {
        let code = compile("def Color\n    Red Green\n    Blue");
        let Constant::Enum(proto) = &code.constants[0] else {
            panic!("expected an enum constant");
        };
        assert_eq!(proto.members, vec!["Red", "Green", "Blue"]);
    }

    #[test]
    fn test_function_types() {
        let code = compile("def (f |int, int| -> int, a int) apply -> int\n    ret f(a, a)");
        let Constant::Function(proto) = &code.constants[0] else {
            panic!("expected a function constant");
        };
        assert_eq!(
            proto.params[0].ty,
            Type::Function {
                params: vec![Type::Int, Type::Int],
                variadic: None,
                ret: Some(Box::new(Type::Int)),
            }
        );
    }

    #[test]
    fn test_use_forms() {
        let code = compile("use a.b.c\nuse <- d");
        assert_eq!(code.names, vec!["a.b.c".to_string(), "d".to_string()]);
        assert_eq!(
            code.ops,
            vec![
                Op::Use { path: 0, merge: false },
                Op::Use { path: 1, merge: true },
                Op::Return,
            ]
        );
    }

    #[test]
    fn test_collections() {
        let code = compile("([1, 2], (1,), (), {\"a\": 1})");
        assert!(code.ops.contains(&Op::BuildArray(2)));
        assert!(code.ops.contains(&Op::BuildTuple(1)));
        assert!(code.ops.contains(&Op::BuildTuple(0)));
        assert!(code.ops.contains(&Op::BuildMap(1)));
        assert!(code.ops.contains(&Op::BuildTuple(4)));
    }

    #[test]
    fn test_unexpected_end_of_input() {
        assert!(matches!(compile_err("x int ="), CompileError::UnexpectedEof { .. }));
        assert!(matches!(compile_err("f(1, 2"), CompileError::UnexpectedEof { .. }));
    }
}
