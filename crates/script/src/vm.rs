//! The step-driven interpreter.
//!
//! One call to [`ScriptInstance::step`] executes exactly one instruction.
//! Suspension is plain state: a blocked script records *what* it is
//! waiting for and returns to the scheduler; no thread ever parks. All
//! game-state access goes through the [`Host`] membrane.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
	image::ScriptImage,
	opcode::{Opcode, VarScope},
	scriptable::{CallCtx, CancelToken, ExternalOutcome, Host, MethodOutcome, ObjectId, ScriptId, Wait},
	stack::{CallStack, Frame, OperandStack, StackError},
	value::Value,
};

/// Top-level script variables, shared between a script's main instance and
/// the event/method instances spawned from it.
pub type SharedVars = Arc<Mutex<Vec<Value>>>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScriptState {
	/// Runnable in the next slice.
	Ready,
	/// Currently executing inside a slice.
	Running,
	Sleeping {
		until_ms: u64,
	},
	/// Blocked until the object's current activity completes.
	WaitingObject(ObjectId),
	/// Blocked until the instance finishes; receives its return value.
	WaitingScript(ScriptId),
	Finished,
	Error,
}

/// A method call that native dispatch declined; the scheduler tries the
/// receiver's attached-script methods next.
#[derive(Debug)]
pub struct PendingMethod {
	pub receiver: ObjectId,
	pub name: String,
	pub args: Vec<Value>,
}

/// What one step did, as seen by the slice loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
	Continue,
	/// The instance left the running state (sleep, wait, yield).
	Suspend,
	/// A [`PendingMethod`] needs scheduler resolution.
	Pending,
	Finish,
}

#[derive(Debug)]
pub struct ScriptInstance {
	pub id: ScriptId,
	pub image: Arc<ScriptImage>,
	pub state: ScriptState,
	pub owner: Option<ObjectId>,
	/// Thread of control: the instance this one was spawned from, if any.
	pub parent: Option<ScriptId>,
	pub paused: bool,
	pub cancel: CancelToken,
	pub pending_method: Option<PendingMethod>,
	/// Captured when the instance finishes; delivered to waiters.
	pub return_value: Value,

	ip: usize,
	operands: OperandStack,
	calls: CallStack,
	this: Value,
	vars: SharedVars,
}

impl ScriptInstance {
	#[must_use]
	pub fn new(
		id: ScriptId,
		image: Arc<ScriptImage>,
		entry: u32,
		this: Value,
		owner: Option<ObjectId>,
		vars: SharedVars,
		parent: Option<ScriptId>,
	) -> Self {
		Self::with_locals(id, image, entry, this, owner, vars, parent, vec![])
	}

	/// Spawns with the initial frame's locals pre-filled (method and
	/// function-call instances receive their arguments this way).
	#[allow(clippy::too_many_arguments)]
	#[must_use]
	pub fn with_locals(
		id: ScriptId,
		image: Arc<ScriptImage>,
		entry: u32,
		this: Value,
		owner: Option<ObjectId>,
		vars: SharedVars,
		parent: Option<ScriptId>,
		locals: Vec<Value>,
	) -> Self {
		let mut calls = CallStack::default();

		calls
			.push(Frame {
				return_addr: usize::MAX,
				saved_this: Value::Null,
				locals,
				watermark: 0,
			})
			.expect("a fresh call stack cannot overflow");

		Self {
			id,
			image,
			state: ScriptState::Ready,
			owner,
			parent,
			paused: false,
			cancel: CancelToken::default(),
			pending_method: None,
			return_value: Value::Null,
			ip: entry as usize,
			operands: OperandStack::default(),
			calls,
			this,
			vars,
		}
	}

	/// Pre-loads the operand stack; event payloads arrive this way.
	pub fn seed_operands(&mut self, values: impl IntoIterator<Item = Value>) {
		for value in values {
			if self.operands.push(value).is_err() {
				log::warn!("Event payload overflowed a fresh operand stack; truncated.");
				break;
			}
		}
	}

	#[must_use]
	pub fn is_live(&self) -> bool {
		!matches!(self.state, ScriptState::Finished | ScriptState::Error)
	}

	#[must_use]
	pub fn vars(&self) -> &SharedVars {
		&self.vars
	}

	/// Delivers the result of a cleared wait (the waited object's `null`,
	/// or a finished script's return value) and makes the instance
	/// runnable again.
	pub fn resume_with(&mut self, value: Value) {
		if self.operands.push(value).is_err() {
			log::warn!(
				"`{}`: operand stack overflow while resuming; discarding result.",
				self.image.path,
			);
		}

		self.state = ScriptState::Ready;
	}

	/// Executes instructions until the budget runs out or the instance
	/// leaves the running state. Returns the number executed.
	pub fn run_slice(&mut self, host: &mut dyn Host, clock_ms: u64, budget: u32) -> u32 {
		if self.state != ScriptState::Ready || self.paused {
			return 0;
		}

		self.state = ScriptState::Running;
		let mut executed = 0;

		while executed < budget {
			if self.cancel.is_cancelled() {
				self.state = ScriptState::Finished;
				break;
			}

			let offset = self.ip;

			match self.step(host, clock_ms) {
				Ok(Step::Continue) => executed += 1,
				Ok(Step::Suspend | Step::Pending | Step::Finish) => {
					executed += 1;
					break;
				}
				Err(err) => {
					self.fail(&err, offset);
					break;
				}
			}
		}

		if self.state == ScriptState::Running {
			self.state = ScriptState::Ready;
		}

		executed
	}

	/// For failures detected outside the step loop (unresolvable method
	/// dispatch in the scheduler).
	pub(crate) fn raise(&mut self, err: &VmError) {
		let offset = self.ip;
		self.fail(err, offset);
	}

	/// Runtime errors never cross into the host; they end the script and
	/// leave a diagnostic with the script's file and source line.
	fn fail(&mut self, err: &VmError, offset: usize) {
		match self.image.line_for(offset) {
			Some(line) => {
				log::error!("Runtime error in `{}` line {line}: {err}", self.image.path);
			}
			None => log::error!("Runtime error in `{}`: {err}", self.image.path),
		}

		self.state = ScriptState::Error;
		self.cancel.cancel();
	}

	/// Executes exactly one instruction.
	fn step(&mut self, host: &mut dyn Host, clock_ms: u64) -> Result<Step, VmError> {
		if self.ip >= self.image.code.len() {
			// One past the last instruction is the terminal position.
			return Ok(self.finish(Value::Null));
		}

		let opcode =
			Opcode::from_u8(self.image.code[self.ip]).ok_or(VmError::BadOpcode(self.image.code[self.ip]))?;

		self.ip += 1;

		match opcode {
			Opcode::PushInt => {
				let v = self.fetch_i64()?;
				self.operands.push(Value::Int(v))?;
			}
			Opcode::PushFloat => {
				let v = self.fetch_f64()?;
				self.operands.push(Value::Float(v))?;
			}
			Opcode::PushString => {
				let sym = self.fetch_u32()?;
				let s = self.symbol(sym)?.to_string();
				self.operands.push(Value::String(s))?;
			}
			Opcode::PushBool => {
				let v = self.fetch_u8()?;
				self.operands.push(Value::Bool(v != 0))?;
			}
			Opcode::PushNull => self.operands.push(Value::Null)?,
			Opcode::PushVar => {
				let (scope, index) = self.fetch_var()?;

				let value = match scope {
					VarScope::Local => self.calls.top()?.local(index as usize),
					VarScope::Script => {
						let vars = self.vars.lock();
						vars.get(index as usize).cloned().unwrap_or(Value::Null)
					}
					VarScope::Global => {
						let name = self.symbol(index)?.to_string();
						host.get_global(&name)
					}
				};

				self.operands.push(value)?;
			}
			Opcode::PopVar => {
				let (scope, index) = self.fetch_var()?;
				let value = self.operands.pop()?;

				match scope {
					VarScope::Local => self.calls.top_mut()?.set_local(index as usize, value),
					VarScope::Script => {
						let mut vars = self.vars.lock();
						let index = index as usize;

						if index >= vars.len() {
							vars.resize(index + 1, Value::Null);
						}

						vars[index] = value;
					}
					VarScope::Global => {
						let name = self.symbol(index)?.to_string();
						host.set_global(&name, value);
					}
				}
			}
			Opcode::PopEmpty => {
				self.operands.pop()?;
			}
			Opcode::PushThis => {
				let this = self.this.clone();
				self.operands.push(this)?;
			}
			Opcode::PopThis => {
				self.this = self.operands.pop()?;
			}
			Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
				let rhs = self.operands.pop()?;
				let lhs = self.operands.pop()?;

				let out = match opcode {
					Opcode::Add => lhs.add(&rhs),
					Opcode::Sub => lhs.sub(&rhs),
					Opcode::Mul => lhs.mul(&rhs),
					Opcode::Div => lhs.div(&rhs),
					_ => lhs.rem(&rhs),
				};

				self.operands.push(out)?;
			}
			Opcode::Neg => {
				let v = self.operands.pop()?;
				self.operands.push(v.neg())?;
			}
			Opcode::Eq | Opcode::Ne => {
				let rhs = normalize(self.operands.pop()?, host);
				let lhs = normalize(self.operands.pop()?, host);
				let eq = lhs.loose_eq(&rhs);
				self.operands
					.push(Value::Bool(if opcode == Opcode::Eq { eq } else { !eq }))?;
			}
			Opcode::StrictEq | Opcode::StrictNe => {
				let rhs = self.operands.pop()?;
				let lhs = self.operands.pop()?;
				let eq = lhs.strict_eq(&rhs);
				self.operands.push(Value::Bool(
					if opcode == Opcode::StrictEq { eq } else { !eq },
				))?;
			}
			Opcode::Lt | Opcode::Gt | Opcode::Le | Opcode::Ge => {
				use std::cmp::Ordering;

				let rhs = normalize(self.operands.pop()?, host);
				let lhs = normalize(self.operands.pop()?, host);
				let ord = lhs.loose_cmp(&rhs);

				let out = match opcode {
					Opcode::Lt => ord == Ordering::Less,
					Opcode::Gt => ord == Ordering::Greater,
					Opcode::Le => ord != Ordering::Greater,
					_ => ord != Ordering::Less,
				};

				self.operands.push(Value::Bool(out))?;
			}
			Opcode::Not => {
				let v = normalize(self.operands.pop()?, host);
				self.operands.push(Value::Bool(!v.truthy()))?;
			}
			Opcode::Jump => {
				self.ip = self.fetch_u32()? as usize;
			}
			Opcode::JumpIfFalse | Opcode::JumpIfTrue => {
				let target = self.fetch_u32()? as usize;
				let v = normalize(self.operands.pop()?, host);

				let jump = if opcode == Opcode::JumpIfFalse {
					!v.truthy()
				} else {
					v.truthy()
				};

				if jump {
					self.ip = target;
				}
			}
			Opcode::JumpIfFalsePeek | Opcode::JumpIfTruePeek => {
				let target = self.fetch_u32()? as usize;
				self.normalize_top(host)?;
				let truthy = self.operands.peek()?.truthy();

				let jump = if opcode == Opcode::JumpIfFalsePeek {
					!truthy
				} else {
					truthy
				};

				if jump {
					self.ip = target;
				}
			}
			Opcode::Call => {
				let sym = self.fetch_u32()?;
				let argc = self.fetch_u8()? as usize;
				let name = self.symbol(sym)?.to_string();
				let args = self.operands.pop_many(argc)?;

				if let Some(entry) = self.image.function(&name) {
					let offset = entry.offset as usize;

					self.calls.push(Frame {
						return_addr: self.ip,
						saved_this: self.this.clone(),
						locals: args,
						watermark: self.operands.depth(),
					})?;

					self.ip = offset;
				} else {
					let ctx = self.call_ctx();

					match host.call_external(&name, &args, &ctx) {
						ExternalOutcome::Value(v) => self.operands.push(v)?,
						ExternalOutcome::Suspend(wait) => {
							self.suspend(wait);
							return Ok(Step::Suspend);
						}
						ExternalOutcome::Missing => {
							return Err(VmError::ExternalMiss(name));
						}
					}
				}
			}
			Opcode::CallMethod => {
				let sym = self.fetch_u32()?;
				let argc = self.fetch_u8()? as usize;
				let name = self.symbol(sym)?.to_string();
				let args = self.operands.pop_many(argc)?;
				let receiver = self.operands.pop()?;

				match receiver {
					Value::Object(oid) => {
						if !host.object_alive(oid) {
							log::warn!(
								"`{}`: method `{name}` called on a destroyed object; yielding null.",
								self.image.path,
							);
							self.operands.push(Value::Null)?;
							return Ok(Step::Continue);
						}

						let ctx = self.call_ctx();

						match host.call_method(oid, &name, &args, &ctx) {
							MethodOutcome::Value(v) => self.operands.push(v)?,
							MethodOutcome::Suspend(wait) => {
								self.suspend(wait);
								return Ok(Step::Suspend);
							}
							MethodOutcome::Gone => {
								log::warn!(
									"`{}`: method `{name}` called on a destroyed object; yielding null.",
									self.image.path,
								);
								self.operands.push(Value::Null)?;
							}
							MethodOutcome::NotHandled => {
								self.pending_method = Some(PendingMethod {
									receiver: oid,
									name,
									args,
								});

								return Ok(Step::Pending);
							}
						}
					}
					Value::Null => return Err(VmError::NullCall(name)),
					other => {
						return Err(VmError::NotObject {
							name,
							found: other.type_name(),
						})
					}
				}
			}
			Opcode::Return | Opcode::ReturnEvent => {
				let value = self.operands.pop()?;

				if opcode == Opcode::ReturnEvent || self.calls.depth() <= 1 {
					return Ok(self.finish(value));
				}

				let frame = self.calls.pop()?;
				self.operands.truncate(frame.watermark);
				self.this = frame.saved_this;
				self.ip = frame.return_addr;
				self.operands.push(value)?;
			}
			Opcode::GetProperty => {
				let sym = self.fetch_u32()?;
				let name = self.symbol(sym)?.to_string();
				let receiver = self.operands.pop()?;

				let value = match receiver {
					Value::Object(oid) => {
						if host.object_alive(oid) {
							host.get_property(oid, &name).unwrap_or(Value::Null)
						} else {
							log::warn!(
								"`{}`: property `{name}` read from a destroyed object; yielding null.",
								self.image.path,
							);
							Value::Null
						}
					}
					Value::Array(ref items) => match name.as_str() {
						"length" => Value::Int(items.len() as i64),
						_ => Value::Null,
					},
					Value::String(ref s) => match name.as_str() {
						"length" => Value::Int(s.chars().count() as i64),
						_ => Value::Null,
					},
					Value::Null => return Err(VmError::NullProperty(name)),
					_ => Value::Null,
				};

				self.operands.push(value)?;
			}
			Opcode::SetProperty => {
				let sym = self.fetch_u32()?;
				let name = self.symbol(sym)?.to_string();
				let value = self.operands.pop()?;
				let receiver = self.operands.pop()?;

				match receiver {
					Value::Object(oid) => {
						if host.object_alive(oid) {
							if !host.set_property(oid, &name, value) {
								log::debug!(
									"`{}`: write to read-only property `{name}` ignored.",
									self.image.path,
								);
							}
						} else {
							log::warn!(
								"`{}`: property `{name}` written to a destroyed object; dropped.",
								self.image.path,
							);
						}
					}
					Value::Null => return Err(VmError::NullProperty(name)),
					_ => log::warn!(
						"`{}`: property `{name}` written to a non-object; dropped.",
						self.image.path,
					),
				}
			}
			Opcode::NewObject => {
				let sym = self.fetch_u32()?;
				let argc = self.fetch_u8()? as usize;
				let class = self.symbol(sym)?.to_string();
				let args = self.operands.pop_many(argc)?;

				match host.create_object(&class, args) {
					Some(v) => self.operands.push(v)?,
					None => return Err(VmError::UnknownClass(class)),
				}
			}
			Opcode::GetElem => {
				let index = self.operands.pop()?;
				let object = self.operands.pop()?;
				self.operands.push(object.index(&index))?;
			}
			Opcode::SetElem => {
				let value = self.operands.pop()?;
				let index = self.operands.pop()?;
				let mut object = self.operands.pop()?;

				if !object.set_index(&index, value) {
					log::warn!(
						"`{}`: element write to a {} dropped.",
						self.image.path,
						object.type_name(),
					);
				}

				self.operands.push(object)?;
			}
			Opcode::NewArray => {
				let count = self.fetch_u16()? as usize;
				let items = self.operands.pop_many(count)?;
				self.operands.push(Value::Array(items))?;
			}
			Opcode::Sleep => {
				let ms = self.operands.pop()?.as_int().max(0) as u64;

				self.state = ScriptState::Sleeping {
					until_ms: clock_ms + ms,
				};

				return Ok(Step::Suspend);
			}
			Opcode::Yield => {
				// State stays runnable; the slice just ends here.
				return Ok(Step::Suspend);
			}
		}

		Ok(Step::Continue)
	}

	fn finish(&mut self, value: Value) -> Step {
		self.return_value = value;
		self.operands.clear();
		self.calls.clear();
		self.state = ScriptState::Finished;
		Step::Finish
	}

	fn suspend(&mut self, wait: Wait) {
		self.state = match wait {
			Wait::Object(id) => ScriptState::WaitingObject(id),
			Wait::Script(id) => ScriptState::WaitingScript(id),
		};
	}

	fn call_ctx(&self) -> CallCtx {
		CallCtx {
			script: self.id,
			cancel: self.cancel.clone(),
		}
	}

	/// Maps a dead object reference on top of the stack to `null`, so that
	/// truthiness and comparisons see gone objects as gone.
	fn normalize_top(&mut self, host: &dyn Host) -> Result<(), VmError> {
		let top = self.operands.peek()?;

		if let Value::Object(oid) = top {
			if !host.object_alive(*oid) {
				let _ = self.operands.pop()?;
				self.operands.push(Value::Null)?;
			}
		}

		Ok(())
	}

	// Decoding ////////////////////////////////////////////////////////////////

	fn fetch_u8(&mut self) -> Result<u8, VmError> {
		let b = *self.image.code.get(self.ip).ok_or(VmError::Truncated)?;
		self.ip += 1;
		Ok(b)
	}

	fn fetch_u16(&mut self) -> Result<u16, VmError> {
		let bytes = self.fetch_bytes::<2>()?;
		Ok(u16::from_le_bytes(bytes))
	}

	fn fetch_u32(&mut self) -> Result<u32, VmError> {
		let bytes = self.fetch_bytes::<4>()?;
		Ok(u32::from_le_bytes(bytes))
	}

	fn fetch_i64(&mut self) -> Result<i64, VmError> {
		let bytes = self.fetch_bytes::<8>()?;
		Ok(i64::from_le_bytes(bytes))
	}

	fn fetch_f64(&mut self) -> Result<f64, VmError> {
		let bytes = self.fetch_bytes::<8>()?;
		Ok(f64::from_le_bytes(bytes))
	}

	fn fetch_bytes<const N: usize>(&mut self) -> Result<[u8; N], VmError> {
		let end = self.ip + N;

		if end > self.image.code.len() {
			return Err(VmError::Truncated);
		}

		let mut out = [0_u8; N];
		out.copy_from_slice(&self.image.code[self.ip..end]);
		self.ip = end;
		Ok(out)
	}

	fn fetch_var(&mut self) -> Result<(VarScope, u32), VmError> {
		let raw = self.fetch_u8()?;
		let scope = VarScope::from_u8(raw).ok_or(VmError::BadVarScope(raw))?;
		let index = self.fetch_u32()?;
		Ok((scope, index))
	}

	fn symbol(&self, index: u32) -> Result<&str, VmError> {
		self.image.symbol(index).ok_or(VmError::BadSymbol(index))
	}
}

/// Dead object references degrade to `null` wherever a value is *used* as
/// a condition or compared loosely.
fn normalize(value: Value, host: &dyn Host) -> Value {
	match value {
		Value::Object(oid) if !host.object_alive(oid) => Value::Null,
		other => other,
	}
}

#[derive(Debug)]
pub enum VmError {
	BadOpcode(u8),
	BadSymbol(u32),
	BadVarScope(u8),
	CallOverflow,
	ExternalMiss(String),
	NotObject { name: String, found: &'static str },
	NullCall(String),
	NullProperty(String),
	OperandOverflow,
	OperandUnderflow,
	Truncated,
	UnknownClass(String),
	UnknownMethod(String),
}

impl From<StackError> for VmError {
	fn from(err: StackError) -> Self {
		match err {
			StackError::OperandOverflow => Self::OperandOverflow,
			StackError::OperandUnderflow => Self::OperandUnderflow,
			StackError::CallOverflow | StackError::CallUnderflow => Self::CallOverflow,
		}
	}
}

impl std::error::Error for VmError {}

impl std::fmt::Display for VmError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::BadOpcode(b) => write!(f, "unknown opcode {b:#04X}"),
			Self::BadSymbol(s) => write!(f, "symbol index {s} out of range"),
			Self::BadVarScope(b) => write!(f, "unknown variable scope {b}"),
			Self::CallOverflow => write!(f, "call stack overflow"),
			Self::ExternalMiss(name) => {
				write!(f, "no function or external named `{name}` is registered")
			}
			Self::NotObject { name, found } => {
				write!(f, "method `{name}` called on a {found}, not an object")
			}
			Self::NullCall(name) => write!(f, "method `{name}` called on null"),
			Self::NullProperty(name) => write!(f, "property `{name}` accessed on null"),
			Self::OperandOverflow => write!(f, "operand stack overflow"),
			Self::OperandUnderflow => write!(f, "operand stack underflow"),
			Self::Truncated => write!(f, "instruction pointer ran off the code array"),
			Self::UnknownClass(name) => write!(f, "no constructible class named `{name}`"),
			Self::UnknownMethod(name) => write!(f, "object has no method named `{name}`"),
		}
	}
}
