//! Lowers parsed source to a [`ScriptImage`]: name resolution, then
//! single-pass emission with jump back-patching.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
	ast::*,
	image::{ExternalEntry, FnEntry, ScriptImage},
	opcode::{Opcode, VarScope},
	parse, CompileError,
};

/// Source to image in one call. Reports the first error with
/// file/line/column.
pub fn compile(source: &str, path: &str) -> Result<ScriptImage, CompileError> {
	let unit = parse::parse(source, path)?;
	Compiler::new(path).run(unit)
}

struct Compiler<'p> {
	path: &'p str,
	code: Vec<u8>,
	lines: Vec<(u32, u32)>,
	symbols: Vec<String>,
	sym_map: FxHashMap<String, u32>,
	functions: Vec<FnEntry>,
	methods: Vec<FnEntry>,
	events: Vec<FnEntry>,
	externals: Vec<ExternalEntry>,
	/// Lower-cased top-level `var`/`const` names to (slot, is-const).
	script_vars: FxHashMap<String, (u32, bool)>,
	/// Lower-cased names declared `global` somewhere in this script.
	globals: FxHashSet<String>,
}

/// Per-function emission state.
struct FnCtx {
	kind: BodyKind,
	/// Innermost scope last. Values are (slot, is-const).
	scopes: Vec<FxHashMap<String, (u32, bool)>>,
	next_slot: u32,
	loops: Vec<LoopCtx>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BodyKind {
	/// The implicit function formed by top-level statements, and event
	/// handlers. Ends with `ReturnEvent`.
	Toplevel,
	/// `function`/`method` bodies. Ends with `Return`.
	Function,
}

struct LoopCtx {
	break_patches: Vec<usize>,
	continue_patches: Vec<usize>,
	/// `false` for `switch` frames: `break` binds to them, `continue`
	/// passes through to an enclosing loop.
	is_loop: bool,
}

impl LoopCtx {
	fn for_loop() -> Self {
		Self {
			break_patches: vec![],
			continue_patches: vec![],
			is_loop: true,
		}
	}

	fn for_switch() -> Self {
		Self {
			break_patches: vec![],
			continue_patches: vec![],
			is_loop: false,
		}
	}
}

/// Where an identifier load/store lands after resolution.
enum Slot {
	Local(u32, bool),
	Script(u32, bool),
	Global(u32),
}

impl<'p> Compiler<'p> {
	fn new(path: &'p str) -> Self {
		Self {
			path,
			code: vec![],
			lines: vec![],
			symbols: vec![],
			sym_map: FxHashMap::default(),
			functions: vec![],
			methods: vec![],
			events: vec![],
			externals: vec![],
			script_vars: FxHashMap::default(),
			globals: FxHashSet::default(),
		}
	}

	fn run(mut self, unit: Unit) -> Result<ScriptImage, CompileError> {
		// Declaration pass: externals, script variables, globals. Function
		// offsets are recorded as their bodies are emitted.
		for decl in &unit.decls {
			match decl {
				Decl::External {
					lib, name, params, ..
				} => {
					self.externals.push(ExternalEntry {
						lib: lib.clone(),
						name: name.clone(),
						params: params.len() as u8,
					});
				}
				Decl::Stmt(stmt) => match &stmt.kind {
					StmtKind::VarDecl { constant, names } => {
						for (name, _) in names {
							let slot = self.script_vars.len() as u32;
							self.script_vars
								.entry(name.to_ascii_lowercase())
								.or_insert((slot, *constant));
						}
					}
					StmtKind::GlobalDecl { names } => {
						for (name, _) in names {
							self.globals.insert(name.to_ascii_lowercase());
						}
					}
					_ => {}
				},
				_ => {}
			}
		}

		// Entry function: top-level statements in source order.
		let entry_stmts: Vec<&Stmt> = unit
			.decls
			.iter()
			.filter_map(|d| match d {
				Decl::Stmt(s) => Some(s),
				_ => None,
			})
			.collect();

		let entry = if entry_stmts.is_empty() {
			None
		} else {
			let offset = self.here();
			let mut ctx = FnCtx::new(BodyKind::Toplevel);

			for stmt in entry_stmts {
				self.toplevel_stmt(stmt, &mut ctx)?;
			}

			self.op(Opcode::PushNull);
			self.op(Opcode::ReturnEvent);
			Some(offset)
		};

		for decl in &unit.decls {
			match decl {
				Decl::Function(f) => {
					let entry = self.fn_body(f, BodyKind::Function)?;
					self.functions.push(entry);
				}
				Decl::Method(f) => {
					let entry = self.fn_body(f, BodyKind::Function)?;
					self.methods.push(entry);
				}
				Decl::Event { name, body, .. } => {
					let offset = self.here();
					let mut ctx = FnCtx::new(BodyKind::Toplevel);

					for stmt in body {
						self.stmt(stmt, &mut ctx)?;
					}

					self.op(Opcode::PushNull);
					self.op(Opcode::ReturnEvent);

					self.events.push(FnEntry {
						name: name.clone(),
						offset,
						params: 0,
					});
				}
				_ => {}
			}
		}

		let mut image = ScriptImage::empty(self.path);
		image.code = self.code;
		image.lines = self.lines;
		image.symbols = self.symbols;
		image.functions = self.functions;
		image.methods = self.methods;
		image.events = self.events;
		image.externals = self.externals;
		image.entry = entry;

		Ok(image.finish())
	}

	fn fn_body(&mut self, f: &FnDecl, kind: BodyKind) -> Result<FnEntry, CompileError> {
		let offset = self.here();
		let mut ctx = FnCtx::new(kind);

		for param in &f.params {
			let slot = ctx.next_slot;
			ctx.next_slot += 1;
			ctx.scopes
				.last_mut()
				.unwrap()
				.insert(param.to_ascii_lowercase(), (slot, false));
		}

		for stmt in &f.body {
			self.stmt(stmt, &mut ctx)?;
		}

		self.op(Opcode::PushNull);
		self.op(Opcode::Return);

		Ok(FnEntry {
			name: f.name.clone(),
			offset,
			params: f.params.len() as u8,
		})
	}

	/// Direct children of the file: `var` declarations store into script
	/// slots instead of frame locals. Everything else compiles as usual.
	fn toplevel_stmt(&mut self, stmt: &Stmt, ctx: &mut FnCtx) -> Result<(), CompileError> {
		if let StmtKind::VarDecl { names, .. } = &stmt.kind {
			self.line(stmt.pos);

			for (name, init) in names {
				let Some(init) = init else {
					continue;
				};

				let (slot, _) = self.script_vars[&name.to_ascii_lowercase()];
				self.expr(init, ctx)?;
				self.var_op(Opcode::PopVar, VarScope::Script, slot);
			}

			return Ok(());
		}

		self.stmt(stmt, ctx)
	}

	// Statements //////////////////////////////////////////////////////////////

	fn stmt(&mut self, stmt: &Stmt, ctx: &mut FnCtx) -> Result<(), CompileError> {
		self.line(stmt.pos);

		match &stmt.kind {
			StmtKind::Expr(e) => {
				self.expr(e, ctx)?;
				self.op(Opcode::PopEmpty);
			}
			StmtKind::Assign { target, op, value } => {
				self.assign(target, *op, value, ctx)?;
			}
			StmtKind::VarDecl { constant, names } => {
				for (name, init) in names {
					let slot = ctx.declare(name, *constant);

					if let Some(init) = init {
						self.expr(init, ctx)?;
						self.var_op(Opcode::PopVar, VarScope::Local, slot);
					}
				}
			}
			StmtKind::GlobalDecl { names } => {
				for (name, init) in names {
					let lower = name.to_ascii_lowercase();
					self.globals.insert(lower.clone());

					if let Some(init) = init {
						let sym = self.sym(&lower);
						self.expr(init, ctx)?;
						self.var_op(Opcode::PopVar, VarScope::Global, sym);
					}
				}
			}
			StmtKind::If { cond, then, alt } => {
				self.expr(cond, ctx)?;
				let to_else = self.jump(Opcode::JumpIfFalse);

				ctx.enter_scope();
				for s in then {
					self.stmt(s, ctx)?;
				}
				ctx.leave_scope();

				if alt.is_empty() {
					self.patch(to_else);
				} else {
					let to_end = self.jump(Opcode::Jump);
					self.patch(to_else);

					ctx.enter_scope();
					for s in alt {
						self.stmt(s, ctx)?;
					}
					ctx.leave_scope();

					self.patch(to_end);
				}
			}
			StmtKind::While { cond, body } => {
				let top = self.here();
				self.expr(cond, ctx)?;
				let to_end = self.jump(Opcode::JumpIfFalse);

				ctx.enter_scope();
				ctx.loops.push(LoopCtx::for_loop());

				for s in body {
					self.stmt(s, ctx)?;
				}

				let loop_ctx = ctx.loops.pop().unwrap();
				ctx.leave_scope();

				for at in loop_ctx.continue_patches {
					self.patch_to(at, top);
				}

				self.jump_to(Opcode::Jump, top);
				self.patch(to_end);

				for at in loop_ctx.break_patches {
					self.patch(at);
				}
			}
			StmtKind::For {
				init,
				cond,
				update,
				body,
			} => {
				ctx.enter_scope();

				if let Some(init) = init {
					self.stmt(init, ctx)?;
				}

				let top = self.here();

				let to_end = if let Some(cond) = cond {
					self.expr(cond, ctx)?;
					Some(self.jump(Opcode::JumpIfFalse))
				} else {
					None
				};

				ctx.loops.push(LoopCtx::for_loop());

				for s in body {
					self.stmt(s, ctx)?;
				}

				let loop_ctx = ctx.loops.pop().unwrap();

				// `continue` lands on the update expression.
				let update_at = self.here();

				for at in loop_ctx.continue_patches {
					self.patch_to(at, update_at);
				}

				if let Some(update) = update {
					self.stmt(update, ctx)?;
				}

				self.jump_to(Opcode::Jump, top);

				if let Some(to_end) = to_end {
					self.patch(to_end);
				}

				for at in loop_ctx.break_patches {
					self.patch(at);
				}

				ctx.leave_scope();
			}
			StmtKind::Switch { disc, cases } => {
				self.switch(disc, cases, ctx)?;
			}
			StmtKind::Break => {
				let at = self.jump(Opcode::Jump);

				let Some(loop_ctx) = ctx.loops.last_mut() else {
					return Err(self.err(stmt.pos, "`break` outside a loop or switch"));
				};

				loop_ctx.break_patches.push(at);
			}
			StmtKind::Continue => {
				let at = self.jump(Opcode::Jump);

				let Some(loop_ctx) = ctx.loops.iter_mut().rev().find(|l| l.is_loop) else {
					return Err(self.err(stmt.pos, "`continue` outside a loop"));
				};

				loop_ctx.continue_patches.push(at);
			}
			StmtKind::Return(value) => {
				if let Some(value) = value {
					self.expr(value, ctx)?;
				} else {
					self.op(Opcode::PushNull);
				}

				match ctx.kind {
					BodyKind::Function => self.op(Opcode::Return),
					BodyKind::Toplevel => self.op(Opcode::ReturnEvent),
				}
			}
			StmtKind::Block(body) => {
				ctx.enter_scope();

				for s in body {
					self.stmt(s, ctx)?;
				}

				ctx.leave_scope();
			}
		}

		Ok(())
	}

	/// Lowers to a linear chain of equality tests against the evaluated
	/// discriminant, held in an unnamed local.
	fn switch(
		&mut self,
		disc: &Expr,
		cases: &[SwitchCase],
		ctx: &mut FnCtx,
	) -> Result<(), CompileError> {
		let temp = ctx.next_slot;
		ctx.next_slot += 1;

		self.expr(disc, ctx)?;
		self.var_op(Opcode::PopVar, VarScope::Local, temp);

		let mut case_jumps = Vec::with_capacity(cases.len());

		for case in cases {
			let Some(value) = &case.value else {
				case_jumps.push(None);
				continue;
			};

			self.var_op(Opcode::PushVar, VarScope::Local, temp);
			self.expr(value, ctx)?;
			self.op(Opcode::Eq);
			case_jumps.push(Some(self.jump(Opcode::JumpIfTrue)));
		}

		// No test matched: fall to `default` if present, else past the end.
		let to_default = self.jump(Opcode::Jump);

		ctx.loops.push(LoopCtx::for_switch());

		let mut default_at = None;

		for (case, jump) in cases.iter().zip(&case_jumps) {
			let body_at = self.here();

			match jump {
				Some(at) => self.patch_to(*at, body_at),
				None => default_at = Some(body_at),
			}

			ctx.enter_scope();

			for s in &case.body {
				self.stmt(s, ctx)?;
			}

			ctx.leave_scope();
		}

		let end = self.here();
		self.patch_to(to_default, default_at.unwrap_or(end));

		let switch_ctx = ctx.loops.pop().unwrap();

		for at in switch_ctx.break_patches {
			self.patch_to(at, end);
		}

		Ok(())
	}

	fn assign(
		&mut self,
		target: &Expr,
		op: Option<BinaryOp>,
		value: &Expr,
		ctx: &mut FnCtx,
	) -> Result<(), CompileError> {
		match &target.kind {
			ExprKind::Ident(name) => {
				let slot = self.resolve(name, ctx);

				let (scope, index, constant) = match slot {
					Slot::Local(i, c) => (VarScope::Local, i, c),
					Slot::Script(i, c) => (VarScope::Script, i, c),
					Slot::Global(sym) => (VarScope::Global, sym, false),
				};

				if constant {
					return Err(
						self.err(target.pos, format!("cannot assign to constant `{name}`"))
					);
				}

				if let Some(op) = op {
					self.var_op(Opcode::PushVar, scope, index);
					self.expr(value, ctx)?;
					self.op(binary_opcode(op));
				} else {
					self.expr(value, ctx)?;
				}

				self.var_op(Opcode::PopVar, scope, index);
			}
			ExprKind::Member { object, name } => {
				let sym = self.name_sym(name);
				self.expr(object, ctx)?;

				if let Some(op) = op {
					self.expr(object, ctx)?;
					self.op(Opcode::GetProperty);
					self.u32(sym);
					self.expr(value, ctx)?;
					self.op(binary_opcode(op));
				} else {
					self.expr(value, ctx)?;
				}

				self.op(Opcode::SetProperty);
				self.u32(sym);
			}
			ExprKind::Index { object, index } => {
				self.element_assign(object, index, op, value, target.pos, ctx)?;
			}
			_ => return Err(self.err(target.pos, "invalid assignment target")),
		}

		Ok(())
	}

	/// `base[index] = value`. Arrays copy on assignment, so the updated
	/// array is written back to wherever the base came from.
	fn element_assign(
		&mut self,
		base: &Expr,
		index: &Expr,
		op: Option<BinaryOp>,
		value: &Expr,
		pos: SourcePos,
		ctx: &mut FnCtx,
	) -> Result<(), CompileError> {
		enum Base {
			Var(VarScope, u32),
			Prop(u32),
		}

		let target = match &base.kind {
			ExprKind::Ident(name) => {
				let (scope, index, constant) = match self.resolve(name, ctx) {
					Slot::Local(i, c) => (VarScope::Local, i, c),
					Slot::Script(i, c) => (VarScope::Script, i, c),
					Slot::Global(sym) => (VarScope::Global, sym, false),
				};

				if constant {
					return Err(self.err(pos, format!("cannot assign to constant `{name}`")));
				}

				Base::Var(scope, index)
			}
			ExprKind::Member { object, name } => {
				// Keep the receiver below the array so the write-back can
				// consume both.
				self.expr(object, ctx)?;
				Base::Prop(self.name_sym(name))
			}
			_ => {
				return Err(self.err(pos, "unsupported element assignment target"));
			}
		};

		// Load the array.
		match &target {
			Base::Var(scope, i) => self.var_op(Opcode::PushVar, *scope, *i),
			Base::Prop(sym) => {
				self.expr(base_object(base), ctx)?;
				self.op(Opcode::GetProperty);
				self.u32(*sym);
			}
		}

		self.expr(index, ctx)?;

		if let Some(op) = op {
			// Current element value, re-deriving array and index.
			match &target {
				Base::Var(scope, i) => self.var_op(Opcode::PushVar, *scope, *i),
				Base::Prop(sym) => {
					self.expr(base_object(base), ctx)?;
					self.op(Opcode::GetProperty);
					self.u32(*sym);
				}
			}

			self.expr(index, ctx)?;
			self.op(Opcode::GetElem);
			self.expr(value, ctx)?;
			self.op(binary_opcode(op));
		} else {
			self.expr(value, ctx)?;
		}

		self.op(Opcode::SetElem);

		// Write the updated array back.
		match target {
			Base::Var(scope, i) => self.var_op(Opcode::PopVar, scope, i),
			Base::Prop(sym) => {
				self.op(Opcode::SetProperty);
				self.u32(sym);
			}
		}

		Ok(())
	}

	// Expressions /////////////////////////////////////////////////////////////

	fn expr(&mut self, expr: &Expr, ctx: &mut FnCtx) -> Result<(), CompileError> {
		match &expr.kind {
			ExprKind::Null => self.op(Opcode::PushNull),
			ExprKind::Bool(b) => {
				self.op(Opcode::PushBool);
				self.code.push(u8::from(*b));
			}
			ExprKind::Int(i) => {
				self.op(Opcode::PushInt);
				self.code.extend_from_slice(&i.to_le_bytes());
			}
			ExprKind::Float(x) => {
				self.op(Opcode::PushFloat);
				self.code.extend_from_slice(&x.to_le_bytes());
			}
			ExprKind::Str(s) => {
				let sym = self.sym(s);
				self.op(Opcode::PushString);
				self.u32(sym);
			}
			ExprKind::This => self.op(Opcode::PushThis),
			ExprKind::Ident(name) => match self.resolve(name, ctx) {
				Slot::Local(i, _) => self.var_op(Opcode::PushVar, VarScope::Local, i),
				Slot::Script(i, _) => self.var_op(Opcode::PushVar, VarScope::Script, i),
				Slot::Global(sym) => self.var_op(Opcode::PushVar, VarScope::Global, sym),
			},
			ExprKind::ArrayLit(items) => {
				for item in items {
					self.expr(item, ctx)?;
				}

				self.op(Opcode::NewArray);
				self.code
					.extend_from_slice(&(items.len() as u16).to_le_bytes());
			}
			ExprKind::Unary { op, operand } => {
				self.expr(operand, ctx)?;

				match op {
					UnaryOp::Neg => self.op(Opcode::Neg),
					UnaryOp::Not => self.op(Opcode::Not),
				}
			}
			ExprKind::Binary { op, lhs, rhs } => {
				self.expr(lhs, ctx)?;
				self.expr(rhs, ctx)?;
				self.op(binary_opcode(*op));
			}
			ExprKind::Logical { and, lhs, rhs } => {
				// The left value short-circuits as the result; otherwise it
				// is discarded and the right value stands.
				self.expr(lhs, ctx)?;

				let over = if *and {
					self.jump(Opcode::JumpIfFalsePeek)
				} else {
					self.jump(Opcode::JumpIfTruePeek)
				};

				self.op(Opcode::PopEmpty);
				self.expr(rhs, ctx)?;
				self.patch(over);
			}
			ExprKind::Ternary { cond, then, alt } => {
				self.expr(cond, ctx)?;
				let to_alt = self.jump(Opcode::JumpIfFalse);
				self.expr(then, ctx)?;
				let to_end = self.jump(Opcode::Jump);
				self.patch(to_alt);
				self.expr(alt, ctx)?;
				self.patch(to_end);
			}
			ExprKind::Member { object, name } => {
				let sym = self.name_sym(name);
				self.expr(object, ctx)?;
				self.op(Opcode::GetProperty);
				self.u32(sym);
			}
			ExprKind::Index { object, index } => {
				self.expr(object, ctx)?;
				self.expr(index, ctx)?;
				self.op(Opcode::GetElem);
			}
			ExprKind::Call { callee, args } => {
				self.call(callee, args, expr.pos, ctx)?;
			}
			ExprKind::New { class, args } => {
				for arg in args {
					self.expr(arg, ctx)?;
				}

				let sym = self.name_sym(class);
				self.op(Opcode::NewObject);
				self.u32(sym);
				self.code.push(args.len() as u8);
			}
		}

		Ok(())
	}

	fn call(
		&mut self,
		callee: &Expr,
		args: &[Expr],
		pos: SourcePos,
		ctx: &mut FnCtx,
	) -> Result<(), CompileError> {
		match &callee.kind {
			ExprKind::Ident(name) => {
				let lower = name.to_ascii_lowercase();

				// The cooperative primitives read like calls in source.
				if lower == "sleep" {
					if args.len() != 1 {
						return Err(self.err(pos, "`Sleep` takes exactly one argument"));
					}

					self.expr(&args[0], ctx)?;
					self.op(Opcode::Sleep);
					self.op(Opcode::PushNull);
					return Ok(());
				}

				if lower == "yield" {
					if !args.is_empty() {
						return Err(self.err(pos, "`Yield` takes no arguments"));
					}

					self.op(Opcode::Yield);
					self.op(Opcode::PushNull);
					return Ok(());
				}

				for arg in args {
					self.expr(arg, ctx)?;
				}

				let sym = self.sym(&lower);
				self.op(Opcode::Call);
				self.u32(sym);
				self.code.push(args.len() as u8);
			}
			ExprKind::Member { object, name } => {
				self.expr(object, ctx)?;

				for arg in args {
					self.expr(arg, ctx)?;
				}

				let sym = self.name_sym(name);
				self.op(Opcode::CallMethod);
				self.u32(sym);
				self.code.push(args.len() as u8);
			}
			_ => return Err(self.err(pos, "only functions and methods can be called")),
		}

		Ok(())
	}

	// Name resolution /////////////////////////////////////////////////////////

	/// Locals, then enclosing function parameters (same scope chain), then
	/// script variables, then the global namespace. Undeclared names fall
	/// through to globals so that host singletons (`Game`, `Scene`) and
	/// `global`s declared by other scripts resolve at run time.
	fn resolve(&mut self, name: &str, ctx: &FnCtx) -> Slot {
		let lower = name.to_ascii_lowercase();

		for scope in ctx.scopes.iter().rev() {
			if let Some(&(slot, constant)) = scope.get(&lower) {
				return Slot::Local(slot, constant);
			}
		}

		if let Some(&(slot, constant)) = self.script_vars.get(&lower) {
			return Slot::Script(slot, constant);
		}

		Slot::Global(self.sym(&lower))
	}

	// Emission helpers ////////////////////////////////////////////////////////

	fn here(&self) -> u32 {
		self.code.len() as u32
	}

	fn op(&mut self, op: Opcode) {
		self.code.push(op as u8);
	}

	fn u32(&mut self, value: u32) {
		self.code.extend_from_slice(&value.to_le_bytes());
	}

	fn var_op(&mut self, op: Opcode, scope: VarScope, index: u32) {
		self.op(op);
		self.code.push(scope as u8);
		self.u32(index);
	}

	/// Emits a jump with a placeholder target; returns the patch position.
	fn jump(&mut self, op: Opcode) -> usize {
		self.op(op);
		let at = self.code.len();
		self.u32(0);
		at
	}

	fn jump_to(&mut self, op: Opcode, target: u32) {
		self.op(op);
		self.u32(target);
	}

	fn patch(&mut self, at: usize) {
		let here = self.here();
		self.code[at..at + 4].copy_from_slice(&here.to_le_bytes());
	}

	fn patch_to(&mut self, at: usize, target: u32) {
		self.code[at..at + 4].copy_from_slice(&target.to_le_bytes());
	}

	fn sym(&mut self, text: &str) -> u32 {
		if let Some(&ix) = self.sym_map.get(text) {
			return ix;
		}

		let ix = self.symbols.len() as u32;
		self.symbols.push(text.to_string());
		self.sym_map.insert(text.to_string(), ix);
		ix
	}

	/// Interns a property/method/class name, case-folded.
	fn name_sym(&mut self, name: &str) -> u32 {
		self.sym(&name.to_ascii_lowercase())
	}

	fn line(&mut self, pos: SourcePos) {
		let here = self.here();

		match self.lines.last_mut() {
			Some((offset, line)) if *offset == here => *line = pos.line,
			Some((_, line)) if *line == pos.line => {}
			_ => self.lines.push((here, pos.line)),
		}
	}

	fn err(&self, pos: SourcePos, message: impl Into<String>) -> CompileError {
		CompileError {
			path: self.path.to_string(),
			line: pos.line,
			col: pos.col,
			message: message.into(),
		}
	}
}

impl FnCtx {
	fn new(kind: BodyKind) -> Self {
		Self {
			kind,
			scopes: vec![FxHashMap::default()],
			next_slot: 0,
			loops: vec![],
		}
	}

	fn enter_scope(&mut self) {
		self.scopes.push(FxHashMap::default());
	}

	fn leave_scope(&mut self) {
		self.scopes.pop();
	}

	fn declare(&mut self, name: &str, constant: bool) -> u32 {
		let slot = self.next_slot;
		self.next_slot += 1;
		self.scopes
			.last_mut()
			.unwrap()
			.insert(name.to_ascii_lowercase(), (slot, constant));
		slot
	}
}

fn binary_opcode(op: BinaryOp) -> Opcode {
	match op {
		BinaryOp::Add => Opcode::Add,
		BinaryOp::Sub => Opcode::Sub,
		BinaryOp::Mul => Opcode::Mul,
		BinaryOp::Div => Opcode::Div,
		BinaryOp::Mod => Opcode::Mod,
		BinaryOp::Eq => Opcode::Eq,
		BinaryOp::Ne => Opcode::Ne,
		BinaryOp::StrictEq => Opcode::StrictEq,
		BinaryOp::StrictNe => Opcode::StrictNe,
		BinaryOp::Lt => Opcode::Lt,
		BinaryOp::Gt => Opcode::Gt,
		BinaryOp::Le => Opcode::Le,
		BinaryOp::Ge => Opcode::Ge,
	}
}

/// The receiver expression of a member base; only called for
/// `ExprKind::Member` targets.
fn base_object(base: &Expr) -> &Expr {
	match &base.kind {
		ExprKind::Member { object, .. } => object,
		_ => unreachable!("element assignment bases are pre-checked"),
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::image::ScriptImage;

	fn compile_ok(source: &str) -> ScriptImage {
		compile(source, "test.script").unwrap()
	}

	#[test]
	fn tables_populated() {
		let image = compile_ok(
			r#"
			external "stdlib" Random(min, max);
			var ticks = 0;

			function Advance(by) { ticks = ticks + by; return ticks; }
			method Reset() { ticks = 0; }
			on "Tick" { Advance(1); }
			"#,
		);

		assert!(image.entry.is_some());
		assert!(image.function("advance").is_some());
		assert!(image.method("RESET").is_some());
		assert!(image.event("tick").is_some());
		assert_eq!(image.externals.len(), 1);
		assert_eq!(image.externals[0].lib, "stdlib");
		assert!(!image.lines.is_empty());
	}

	#[test]
	fn image_round_trips_byte_equal() {
		let image = compile_ok(
			r#"
			var greeting = "hello" + " " + "world";
			function Greet(who) { return greeting + who; }
			"#,
		);

		let bytes = image.save();
		let reloaded = ScriptImage::load(&bytes).unwrap();
		assert_eq!(reloaded.save(), bytes);
	}

	#[test]
	fn scripts_without_toplevel_code_have_no_entry() {
		let image = compile_ok("function Noop() { }");
		assert!(image.entry.is_none());
		assert!(image.function("noop").is_some());
	}

	#[test]
	fn const_assignment_rejected() {
		let err = compile("const LIMIT = 5; LIMIT = 6;", "t.script").unwrap_err();
		assert!(err.message.contains("constant"));

		let err = compile("const LIMIT = 5; LIMIT += 1;", "t.script").unwrap_err();
		assert!(err.message.contains("constant"));
	}

	#[test]
	fn break_outside_loop_rejected() {
		assert!(compile("break;", "t.script").is_err());
		assert!(compile("continue;", "t.script").is_err());
		assert!(compile("while (true) { break; }", "t.script").is_ok());
		assert!(compile("switch (1) { case 1: continue; }", "t.script").is_err());
	}

	#[test]
	fn sleep_arity_checked() {
		assert!(compile("Sleep();", "t.script").is_err());
		assert!(compile("Sleep(100);", "t.script").is_ok());
		assert!(compile("Yield();", "t.script").is_ok());
		assert!(compile("Yield(1);", "t.script").is_err());
	}
}
