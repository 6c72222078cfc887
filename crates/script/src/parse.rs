//! Hand-written recursive-descent parser for the script language.

use logos::Span;

use crate::{
	ast::*,
	lex::{self, Token},
	CompileError,
};

/// Parses one script source file into a [`Unit`].
/// Stops at the first error, reporting it with file/line/column.
pub fn parse(source: &str, path: &str) -> Result<Unit, CompileError> {
	let mut parser = Parser::new(source, path);
	let mut unit = Unit::default();

	while !parser.at_end() {
		unit.decls.push(parser.decl()?);
	}

	Ok(unit)
}

struct Parser<'src> {
	tokens: Vec<(Token, Span)>,
	pos: usize,
	path: &'src str,
	/// Byte offset of each line start, for span-to-position mapping.
	line_starts: Vec<usize>,
	source: &'src str,
}

impl<'src> Parser<'src> {
	fn new(source: &'src str, path: &'src str) -> Self {
		let mut line_starts = vec![0];

		for (i, b) in source.bytes().enumerate() {
			if b == b'\n' {
				line_starts.push(i + 1);
			}
		}

		Self {
			tokens: lex::scan(source),
			pos: 0,
			path,
			line_starts,
			source,
		}
	}

	fn source_pos(&self, offset: usize) -> SourcePos {
		let line = match self.line_starts.binary_search(&offset) {
			Ok(l) => l,
			Err(l) => l - 1,
		};

		SourcePos {
			line: (line + 1) as u32,
			col: (offset - self.line_starts[line] + 1) as u32,
		}
	}

	fn here(&self) -> SourcePos {
		let offset = self
			.tokens
			.get(self.pos)
			.map_or(self.source.len(), |(_, span)| span.start);

		self.source_pos(offset)
	}

	fn error(&self, message: impl Into<String>) -> CompileError {
		let pos = self.here();

		CompileError {
			path: self.path.to_string(),
			line: pos.line,
			col: pos.col,
			message: message.into(),
		}
	}

	fn at_end(&self) -> bool {
		self.pos >= self.tokens.len()
	}

	fn peek(&self) -> Option<Token> {
		self.tokens.get(self.pos).map(|(t, _)| *t)
	}

	fn peek2(&self) -> Option<Token> {
		self.tokens.get(self.pos + 1).map(|(t, _)| *t)
	}

	fn slice(&self) -> &'src str {
		let (_, span) = &self.tokens[self.pos - 1];
		&self.source[span.clone()]
	}

	fn advance(&mut self) -> Option<Token> {
		let t = self.peek()?;
		self.pos += 1;
		Some(t)
	}

	fn eat(&mut self, token: Token) -> bool {
		if self.peek() == Some(token) {
			self.pos += 1;
			true
		} else {
			false
		}
	}

	fn expect(&mut self, token: Token, what: &str) -> Result<(), CompileError> {
		if self.eat(token) {
			Ok(())
		} else {
			Err(self.error(format!("expected {what}")))
		}
	}

	fn expect_ident(&mut self, what: &str) -> Result<String, CompileError> {
		if self.peek() == Some(Token::Ident) {
			self.pos += 1;
			Ok(self.slice().to_string())
		} else {
			Err(self.error(format!("expected {what}")))
		}
	}

	fn expect_string(&mut self, what: &str) -> Result<String, CompileError> {
		if self.peek() == Some(Token::StringLit) {
			self.pos += 1;
			unescape(self.slice()).map_err(|msg| self.error(msg))
		} else {
			Err(self.error(format!("expected {what}")))
		}
	}

	// Declarations ////////////////////////////////////////////////////////////

	fn decl(&mut self) -> Result<Decl, CompileError> {
		match self.peek() {
			Some(Token::KwFunction) => self.fn_decl(false).map(Decl::Function),
			Some(Token::KwMethod) => self.fn_decl(true).map(Decl::Method),
			Some(Token::KwExternal) => self.external_decl(),
			Some(Token::KwOn) => self.event_decl(),
			_ => Ok(Decl::Stmt(self.stmt()?)),
		}
	}

	fn fn_decl(&mut self, method: bool) -> Result<FnDecl, CompileError> {
		let pos = self.here();
		self.advance();

		let what = if method { "method name" } else { "function name" };
		let name = self.expect_ident(what)?;

		self.expect(Token::ParenL, "`(`")?;
		let params = self.param_list()?;
		self.expect(Token::BraceL, "`{`")?;
		let body = self.block_body()?;

		Ok(FnDecl {
			pos,
			name,
			params,
			body,
		})
	}

	fn param_list(&mut self) -> Result<Vec<String>, CompileError> {
		let mut params = vec![];

		if self.eat(Token::ParenR) {
			return Ok(params);
		}

		loop {
			params.push(self.expect_ident("parameter name")?);

			if !self.eat(Token::Comma) {
				break;
			}
		}

		self.expect(Token::ParenR, "`)`")?;
		Ok(params)
	}

	fn external_decl(&mut self) -> Result<Decl, CompileError> {
		let pos = self.here();
		self.advance();

		let lib = self.expect_string("library name string")?;
		let name = self.expect_ident("external function name")?;
		self.expect(Token::ParenL, "`(`")?;
		let params = self.param_list()?;
		self.eat(Token::Semicolon);

		Ok(Decl::External {
			pos,
			lib,
			name,
			params,
		})
	}

	fn event_decl(&mut self) -> Result<Decl, CompileError> {
		let pos = self.here();
		self.advance();

		let name = self.expect_string("event name string")?;
		self.expect(Token::BraceL, "`{`")?;
		let body = self.block_body()?;

		Ok(Decl::Event { pos, name, body })
	}

	// Statements //////////////////////////////////////////////////////////////

	fn block_body(&mut self) -> Result<Vec<Stmt>, CompileError> {
		let mut stmts = vec![];

		while !self.eat(Token::BraceR) {
			if self.at_end() {
				return Err(self.error("unterminated block; expected `}`"));
			}

			stmts.push(self.stmt()?);
		}

		Ok(stmts)
	}

	fn stmt(&mut self) -> Result<Stmt, CompileError> {
		let pos = self.here();

		let kind = match self.peek() {
			Some(Token::BraceL) => {
				self.advance();
				StmtKind::Block(self.block_body()?)
			}
			Some(Token::KwVar) => {
				self.advance();
				let kind = self.var_decl(false)?;
				self.expect(Token::Semicolon, "`;`")?;
				kind
			}
			Some(Token::KwConst) => {
				self.advance();
				let kind = self.var_decl(true)?;
				self.expect(Token::Semicolon, "`;`")?;
				kind
			}
			Some(Token::KwGlobal) => {
				self.advance();
				let names = self.decl_names()?;
				self.expect(Token::Semicolon, "`;`")?;
				StmtKind::GlobalDecl { names }
			}
			Some(Token::KwIf) => self.if_stmt()?,
			Some(Token::KwWhile) => self.while_stmt()?,
			Some(Token::KwFor) => self.for_stmt()?,
			Some(Token::KwSwitch) => self.switch_stmt()?,
			Some(Token::KwBreak) => {
				self.advance();
				self.expect(Token::Semicolon, "`;`")?;
				StmtKind::Break
			}
			Some(Token::KwContinue) => {
				self.advance();
				self.expect(Token::Semicolon, "`;`")?;
				StmtKind::Continue
			}
			Some(Token::KwReturn) => {
				self.advance();

				let value = if self.peek() == Some(Token::Semicolon) {
					None
				} else {
					Some(self.expr()?)
				};

				self.expect(Token::Semicolon, "`;`")?;
				StmtKind::Return(value)
			}
			Some(Token::Semicolon) => {
				self.advance();
				StmtKind::Block(vec![])
			}
			Some(_) => {
				let kind = self.expr_or_assign()?;
				self.expect(Token::Semicolon, "`;`")?;
				kind
			}
			None => return Err(self.error("expected a statement")),
		};

		Ok(Stmt { pos, kind })
	}

	fn var_decl(&mut self, constant: bool) -> Result<StmtKind, CompileError> {
		let names = self.decl_names()?;

		if constant && names.iter().any(|(_, init)| init.is_none()) {
			return Err(self.error("`const` requires an initializer"));
		}

		Ok(StmtKind::VarDecl { constant, names })
	}

	fn decl_names(&mut self) -> Result<Vec<(String, Option<Expr>)>, CompileError> {
		let mut names = vec![];

		loop {
			let name = self.expect_ident("variable name")?;

			let init = if self.eat(Token::Eq) {
				Some(self.expr()?)
			} else {
				None
			};

			names.push((name, init));

			if !self.eat(Token::Comma) {
				break;
			}
		}

		Ok(names)
	}

	fn if_stmt(&mut self) -> Result<StmtKind, CompileError> {
		self.advance();
		self.expect(Token::ParenL, "`(`")?;
		let cond = self.expr()?;
		self.expect(Token::ParenR, "`)`")?;

		let then = vec![self.stmt()?];

		let alt = if self.eat(Token::KwElse) {
			vec![self.stmt()?]
		} else {
			vec![]
		};

		Ok(StmtKind::If { cond, then, alt })
	}

	fn while_stmt(&mut self) -> Result<StmtKind, CompileError> {
		self.advance();
		self.expect(Token::ParenL, "`(`")?;
		let cond = self.expr()?;
		self.expect(Token::ParenR, "`)`")?;
		let body = vec![self.stmt()?];

		Ok(StmtKind::While { cond, body })
	}

	fn for_stmt(&mut self) -> Result<StmtKind, CompileError> {
		self.advance();
		self.expect(Token::ParenL, "`(`")?;

		let init = if self.peek() == Some(Token::Semicolon) {
			None
		} else {
			let pos = self.here();

			let kind = if self.eat(Token::KwVar) {
				self.var_decl(false)?
			} else {
				self.expr_or_assign()?
			};

			Some(Box::new(Stmt { pos, kind }))
		};

		self.expect(Token::Semicolon, "`;`")?;

		let cond = if self.peek() == Some(Token::Semicolon) {
			None
		} else {
			Some(self.expr()?)
		};

		self.expect(Token::Semicolon, "`;`")?;

		let update = if self.peek() == Some(Token::ParenR) {
			None
		} else {
			let pos = self.here();
			let kind = self.expr_or_assign()?;
			Some(Box::new(Stmt { pos, kind }))
		};

		self.expect(Token::ParenR, "`)`")?;
		let body = vec![self.stmt()?];

		Ok(StmtKind::For {
			init,
			cond,
			update,
			body,
		})
	}

	fn switch_stmt(&mut self) -> Result<StmtKind, CompileError> {
		self.advance();
		self.expect(Token::ParenL, "`(`")?;
		let disc = self.expr()?;
		self.expect(Token::ParenR, "`)`")?;
		self.expect(Token::BraceL, "`{`")?;

		let mut cases = vec![];

		while !self.eat(Token::BraceR) {
			let value = match self.peek() {
				Some(Token::KwCase) => {
					self.advance();
					let v = self.expr()?;
					self.expect(Token::Colon, "`:`")?;
					Some(v)
				}
				Some(Token::KwDefault) => {
					self.advance();
					self.expect(Token::Colon, "`:`")?;
					None
				}
				_ => return Err(self.error("expected `case`, `default`, or `}`")),
			};

			let mut body = vec![];

			while !matches!(
				self.peek(),
				Some(Token::KwCase | Token::KwDefault | Token::BraceR) | None
			) {
				body.push(self.stmt()?);
			}

			cases.push(SwitchCase { value, body });
		}

		Ok(StmtKind::Switch { disc, cases })
	}

	/// An expression statement, possibly an assignment. Assignment is a
	/// statement form here, never a nested expression.
	fn expr_or_assign(&mut self) -> Result<StmtKind, CompileError> {
		let target = self.expr()?;

		let op = match self.peek() {
			Some(Token::Eq) => None,
			Some(Token::PlusEq) => Some(BinaryOp::Add),
			Some(Token::MinusEq) => Some(BinaryOp::Sub),
			Some(Token::AsteriskEq) => Some(BinaryOp::Mul),
			Some(Token::SlashEq) => Some(BinaryOp::Div),
			Some(Token::PercentEq) => Some(BinaryOp::Mod),
			_ => return Ok(StmtKind::Expr(target)),
		};

		if !matches!(
			target.kind,
			ExprKind::Ident(_) | ExprKind::Member { .. } | ExprKind::Index { .. }
		) {
			return Err(self.error("invalid assignment target"));
		}

		self.advance();
		let value = self.expr()?;

		Ok(StmtKind::Assign { target, op, value })
	}

	// Expressions /////////////////////////////////////////////////////////////

	fn expr(&mut self) -> Result<Expr, CompileError> {
		self.ternary()
	}

	fn ternary(&mut self) -> Result<Expr, CompileError> {
		let cond = self.logical_or()?;

		if !self.eat(Token::Question) {
			return Ok(cond);
		}

		let pos = cond.pos;
		let then = self.expr()?;
		self.expect(Token::Colon, "`:`")?;
		let alt = self.expr()?;

		Ok(Expr {
			pos,
			kind: ExprKind::Ternary {
				cond: Box::new(cond),
				then: Box::new(then),
				alt: Box::new(alt),
			},
		})
	}

	fn logical_or(&mut self) -> Result<Expr, CompileError> {
		let mut lhs = self.logical_and()?;

		while self.eat(Token::Pipe2) {
			let rhs = self.logical_and()?;
			let pos = lhs.pos;

			lhs = Expr {
				pos,
				kind: ExprKind::Logical {
					and: false,
					lhs: Box::new(lhs),
					rhs: Box::new(rhs),
				},
			};
		}

		Ok(lhs)
	}

	fn logical_and(&mut self) -> Result<Expr, CompileError> {
		let mut lhs = self.equality()?;

		while self.eat(Token::Ampersand2) {
			let rhs = self.equality()?;
			let pos = lhs.pos;

			lhs = Expr {
				pos,
				kind: ExprKind::Logical {
					and: true,
					lhs: Box::new(lhs),
					rhs: Box::new(rhs),
				},
			};
		}

		Ok(lhs)
	}

	fn equality(&mut self) -> Result<Expr, CompileError> {
		let mut lhs = self.relational()?;

		loop {
			let op = match self.peek() {
				Some(Token::Eq2) => BinaryOp::Eq,
				Some(Token::BangEq) => BinaryOp::Ne,
				Some(Token::Eq3) => BinaryOp::StrictEq,
				Some(Token::BangEq2) => BinaryOp::StrictNe,
				_ => break,
			};

			self.advance();
			let rhs = self.relational()?;
			lhs = binary(lhs, op, rhs);
		}

		Ok(lhs)
	}

	fn relational(&mut self) -> Result<Expr, CompileError> {
		let mut lhs = self.additive()?;

		loop {
			let op = match self.peek() {
				Some(Token::AngleL) => BinaryOp::Lt,
				Some(Token::AngleLEq) => BinaryOp::Le,
				Some(Token::AngleR) => BinaryOp::Gt,
				Some(Token::AngleREq) => BinaryOp::Ge,
				_ => break,
			};

			self.advance();
			let rhs = self.additive()?;
			lhs = binary(lhs, op, rhs);
		}

		Ok(lhs)
	}

	fn additive(&mut self) -> Result<Expr, CompileError> {
		let mut lhs = self.multiplicative()?;

		loop {
			let op = match self.peek() {
				Some(Token::Plus) => BinaryOp::Add,
				Some(Token::Minus) => BinaryOp::Sub,
				_ => break,
			};

			self.advance();
			let rhs = self.multiplicative()?;
			lhs = binary(lhs, op, rhs);
		}

		Ok(lhs)
	}

	fn multiplicative(&mut self) -> Result<Expr, CompileError> {
		let mut lhs = self.unary()?;

		loop {
			let op = match self.peek() {
				Some(Token::Asterisk) => BinaryOp::Mul,
				Some(Token::Slash) => BinaryOp::Div,
				Some(Token::Percent) => BinaryOp::Mod,
				_ => break,
			};

			self.advance();
			let rhs = self.unary()?;
			lhs = binary(lhs, op, rhs);
		}

		Ok(lhs)
	}

	fn unary(&mut self) -> Result<Expr, CompileError> {
		let pos = self.here();

		let op = match self.peek() {
			Some(Token::Minus) => Some(UnaryOp::Neg),
			Some(Token::Bang) => Some(UnaryOp::Not),
			_ => None,
		};

		if let Some(op) = op {
			self.advance();
			let operand = self.unary()?;

			return Ok(Expr {
				pos,
				kind: ExprKind::Unary {
					op,
					operand: Box::new(operand),
				},
			});
		}

		self.postfix()
	}

	fn postfix(&mut self) -> Result<Expr, CompileError> {
		let mut expr = self.primary()?;

		loop {
			if self.eat(Token::Dot) {
				let name = self.expect_ident("member name")?;
				let pos = expr.pos;

				expr = Expr {
					pos,
					kind: ExprKind::Member {
						object: Box::new(expr),
						name,
					},
				};
			} else if self.eat(Token::BracketL) {
				let index = self.expr()?;
				self.expect(Token::BracketR, "`]`")?;
				let pos = expr.pos;

				expr = Expr {
					pos,
					kind: ExprKind::Index {
						object: Box::new(expr),
						index: Box::new(index),
					},
				};
			} else if self.eat(Token::ParenL) {
				let args = self.arg_list()?;
				let pos = expr.pos;

				if !matches!(expr.kind, ExprKind::Ident(_) | ExprKind::Member { .. }) {
					return Err(self.error("only functions and methods can be called"));
				}

				expr = Expr {
					pos,
					kind: ExprKind::Call {
						callee: Box::new(expr),
						args,
					},
				};
			} else {
				break;
			}
		}

		Ok(expr)
	}

	fn arg_list(&mut self) -> Result<Vec<Expr>, CompileError> {
		let mut args = vec![];

		if self.eat(Token::ParenR) {
			return Ok(args);
		}

		loop {
			args.push(self.expr()?);

			if !self.eat(Token::Comma) {
				break;
			}
		}

		self.expect(Token::ParenR, "`)`")?;
		Ok(args)
	}

	fn primary(&mut self) -> Result<Expr, CompileError> {
		let pos = self.here();

		let kind = match self.advance() {
			Some(Token::KwNull) => ExprKind::Null,
			Some(Token::KwTrue) => ExprKind::Bool(true),
			Some(Token::KwFalse) => ExprKind::Bool(false),
			Some(Token::KwThis) => ExprKind::This,
			Some(Token::IntLit) => {
				let slice = self.slice();

				let value = if let Some(hex) = slice.strip_prefix("0x").or(slice.strip_prefix("0X"))
				{
					i64::from_str_radix(hex, 16)
				} else {
					slice.parse()
				};

				ExprKind::Int(value.map_err(|_| self.error("integer literal out of range"))?)
			}
			Some(Token::FloatLit) => {
				let value = self
					.slice()
					.parse()
					.map_err(|_| self.error("malformed float literal"))?;

				ExprKind::Float(value)
			}
			Some(Token::StringLit) => {
				let text = unescape(self.slice()).map_err(|msg| self.error(msg))?;
				ExprKind::Str(text)
			}
			Some(Token::Ident) => ExprKind::Ident(self.slice().to_string()),
			Some(Token::KwNew) => {
				let class = self.expect_ident("class name")?;
				self.expect(Token::ParenL, "`(`")?;
				let args = self.arg_list()?;

				ExprKind::New { class, args }
			}
			Some(Token::ParenL) => {
				let inner = self.expr()?;
				self.expect(Token::ParenR, "`)`")?;
				return Ok(inner);
			}
			Some(Token::BracketL) => {
				let mut items = vec![];

				if !self.eat(Token::BracketR) {
					loop {
						items.push(self.expr()?);

						if !self.eat(Token::Comma) {
							break;
						}
					}

					self.expect(Token::BracketR, "`]`")?;
				}

				ExprKind::ArrayLit(items)
			}
			_ => {
				self.pos = self.pos.saturating_sub(1);
				return Err(self.error("expected an expression"));
			}
		};

		Ok(Expr { pos, kind })
	}
}

fn binary(lhs: Expr, op: BinaryOp, rhs: Expr) -> Expr {
	let pos = lhs.pos;

	Expr {
		pos,
		kind: ExprKind::Binary {
			op,
			lhs: Box::new(lhs),
			rhs: Box::new(rhs),
		},
	}
}

/// Strips the quotes from a string literal and processes `\"`, `\\`,
/// `\n`, and `\t`.
fn unescape(quoted: &str) -> Result<String, String> {
	let inner = &quoted[1..quoted.len() - 1];
	let mut out = String::with_capacity(inner.len());
	let mut chars = inner.chars();

	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}

		match chars.next() {
			Some('"') => out.push('"'),
			Some('\\') => out.push('\\'),
			Some('n') => out.push('\n'),
			Some('t') => out.push('\t'),
			Some(other) => return Err(format!("unknown escape `\\{other}` in string literal")),
			None => return Err("dangling `\\` in string literal".to_string()),
		}
	}

	Ok(out)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn declarations() {
		const SOURCE: &str = r#"
		external "kernel32" Beep(freq, duration);
		var counter = 0;
		global worldState;

		function Bump(by) {
			counter = counter + by;
			return counter;
		}

		method Interact() {
			this.Talk("hello");
		}

		on "LeftClick" {
			Bump(1);
		}
		"#;

		let unit = parse(SOURCE, "test.script").unwrap();
		assert_eq!(unit.decls.len(), 6);

		assert!(matches!(&unit.decls[0], Decl::External { name, lib, params, .. }
			if name == "Beep" && lib == "kernel32" && params.len() == 2));
		assert!(matches!(&unit.decls[3], Decl::Function(f) if f.name == "Bump"));
		assert!(matches!(&unit.decls[4], Decl::Method(m) if m.name == "Interact"));
		assert!(matches!(&unit.decls[5], Decl::Event { name, .. } if name == "LeftClick"));
	}

	#[test]
	fn precedence() {
		let unit = parse("var x = 1 + 2 * 3 < 7 && !done;", "test.script").unwrap();

		let Decl::Stmt(stmt) = &unit.decls[0] else {
			panic!("expected a statement");
		};

		let StmtKind::VarDecl { names, .. } = &stmt.kind else {
			panic!("expected a var decl");
		};

		// `&&` must sit at the root: ((1 + (2 * 3)) < 7) && (!done)
		let init = names[0].1.as_ref().unwrap();
		assert!(matches!(&init.kind, ExprKind::Logical { and: true, .. }));
	}

	#[test]
	fn assignment_targets() {
		assert!(parse("x = 1;", "t").is_ok());
		assert!(parse("obj.prop = 1;", "t").is_ok());
		assert!(parse("arr[0] += 2;", "t").is_ok());
		assert!(parse("1 = 2;", "t").is_err());
		assert!(parse("Foo() = 2;", "t").is_err());
	}

	#[test]
	fn control_flow() {
		const SOURCE: &str = r#"
		for (var i = 0; i < 10; i += 1) {
			if (i % 2 == 0) continue;

			switch (i) {
				case 3:
					break;
				default:
					Game.Log(i);
			}
		}
		"#;

		parse(SOURCE, "test.script").unwrap();
	}

	#[test]
	fn error_positions() {
		let err = parse("var x = ;", "broken.script").unwrap_err();
		assert_eq!(err.path, "broken.script");
		assert_eq!(err.line, 1);
		assert!(err.col > 1);

		let err = parse("function f() {\n\tx = ;\n}", "broken.script").unwrap_err();
		assert_eq!(err.line, 2);
	}
}
