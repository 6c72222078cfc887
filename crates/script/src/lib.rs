//! # Wintermute Script
//!
//! The scripting toolchain and execution environment: a C-family source
//! language compiled to stack-machine bytecode, a cooperative step-driven
//! interpreter, and the scheduler that interleaves hundreds of script
//! instances with the frame loop. Game state is reached exclusively
//! through the [`scriptable`] membrane.

pub mod ast;
pub mod compile;
pub mod image;
pub mod lex;
pub mod opcode;
pub mod parse;
pub mod scheduler;
pub mod scriptable;
pub mod stack;
pub mod value;
pub mod vm;

#[cfg(test)]
mod test;

pub use self::{
	compile::compile,
	image::{ImageError, ScriptImage},
	scheduler::Scheduler,
	scriptable::{
		CallCtx, CancelToken, ExternalOutcome, Host, MethodOutcome, ObjectId, ScriptId,
		Scriptable, Wait,
	},
	value::Value,
	vm::{ScriptInstance, ScriptState},
};

/// A lexical, syntactic, or name-resolution failure, positioned in the
/// offending source file.
#[derive(Debug)]
pub struct CompileError {
	pub path: String,
	pub line: u32,
	pub col: u32,
	pub message: String,
}

impl std::error::Error for CompileError {}

impl std::fmt::Display for CompileError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"{}({},{}): {}",
			self.path, self.line, self.col, self.message
		)
	}
}
