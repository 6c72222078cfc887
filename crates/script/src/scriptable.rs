//! The membrane between script-land and the game.
//!
//! Scripts never hold pointers into game state. A [`Value::Object`] is an
//! [`ObjectId`]; everything the interpreter does to a game object goes
//! through [`Host`], and everything a game object exposes to scripts goes
//! through [`Scriptable`]. Property and method names are case-insensitive
//! on both sides.
//!
//! [`Value::Object`]: crate::value::Value::Object

use std::sync::{
	atomic::{AtomicBool, Ordering},
	Arc,
};

use crate::value::Value;

/// Stable identifier of a game object. Monotonic within a process, never
/// reused; a dangling one simply fails to resolve ("gone").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
	#[must_use]
	pub fn new(raw: u64) -> Self {
		Self(raw)
	}

	#[must_use]
	pub fn get(self) -> u64 {
		self.0
	}
}

/// Stable identifier of a script instance, in spawn order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptId(pub(crate) u64);

impl ScriptId {
	#[must_use]
	pub fn get(self) -> u64 {
		self.0
	}
}

/// Shared flag raised when a script is killed while a host call is waiting
/// on its behalf. The host side checks it to stop waiting and *not* push a
/// result.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
	pub fn cancel(&self) {
		self.0.store(true, Ordering::Relaxed);
	}

	#[must_use]
	pub fn is_cancelled(&self) -> bool {
		self.0.load(Ordering::Relaxed)
	}
}

/// What a suspended script is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
	/// An object to finish whatever it is doing (an actor mid-walk, a
	/// window mid-fade). Cleared by [`Host::object_ready`].
	Object(ObjectId),
	/// Another script instance to finish; its return value is delivered.
	Script(ScriptId),
}

/// Identifies the calling script to host methods, so that blocking calls
/// can be tied back to the right instance and cancellation token.
#[derive(Debug, Clone)]
pub struct CallCtx {
	pub script: ScriptId,
	pub cancel: CancelToken,
}

/// Outcome of a property read against a live object.
pub type GetOutcome = Option<Value>;

/// Outcome of a scripted method call against the host.
#[derive(Debug)]
pub enum MethodOutcome {
	/// Handled natively; the value goes on the caller's stack.
	Value(Value),
	/// Handled natively, but completion is deferred; the caller suspends
	/// and receives `null` when the wait clears.
	Suspend(Wait),
	/// The receiver id no longer resolves.
	Gone,
	/// Not a native method. The scheduler will try attached-script
	/// methods next; if those miss too, the caller errors.
	NotHandled,
}

/// Outcome of an `external` function call.
#[derive(Debug)]
pub enum ExternalOutcome {
	Value(Value),
	Suspend(Wait),
	/// No such function in the host registry; a runtime error for the
	/// calling script.
	Missing,
}

/// The uniform named-property / named-method protocol every script-visible
/// object implements. Names are matched case-insensitively.
///
/// Implementations dispatch class-known names first and fall back to a
/// per-instance property bag for ad-hoc script-set fields, so `set` on an
/// unknown name succeeds and round-trips.
pub trait Scriptable {
	/// `None` means the property is unknown to the class *and* absent from
	/// the property bag; the interpreter maps that to `null`.
	fn get(&self, name: &str) -> GetOutcome;

	/// Returns `false` for read-only properties. Unknown names land in the
	/// property bag and return `true`.
	fn set(&mut self, name: &str, value: Value) -> bool;

	/// `NotHandled` lets the caller fall back (attached scripts, then a
	/// runtime error).
	fn call(&mut self, name: &str, args: &[Value], ctx: &CallCtx) -> MethodOutcome;
}

/// Everything the interpreter and scheduler need from the surrounding
/// engine. This is the *only* channel from script execution into game
/// state.
pub trait Host {
	/// `true` while the id resolves to a live object.
	fn object_alive(&self, id: ObjectId) -> bool;

	/// `true` once a [`Wait::Object`] precondition has cleared.
	fn object_ready(&self, id: ObjectId) -> bool;

	fn get_property(&mut self, id: ObjectId, name: &str) -> Option<Value>;

	fn set_property(&mut self, id: ObjectId, name: &str, value: Value) -> bool;

	fn call_method(&mut self, id: ObjectId, name: &str, args: &[Value], ctx: &CallCtx)
		-> MethodOutcome;

	/// Resolves a call that no script-local function table satisfied.
	fn call_external(&mut self, name: &str, args: &[Value], ctx: &CallCtx) -> ExternalOutcome;

	/// Services the `new ClassName(...)` expression. `None` if the class
	/// name is unknown.
	fn create_object(&mut self, class: &str, args: Vec<Value>) -> Option<Value>;

	/// Host-wide named globals (`global` declarations). Absent names read
	/// as `null`.
	fn get_global(&mut self, name: &str) -> Value;

	fn set_global(&mut self, name: &str, value: Value);
}
