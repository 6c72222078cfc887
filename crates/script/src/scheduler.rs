//! Owns every live script instance and hands out per-frame time slices.
//!
//! One tick: advance the clock and wake scripts whose preconditions
//! cleared, give each runnable script a slice in spawn order, release
//! finished scripts (delivering return values to waiters), then drain the
//! event queue into fresh handler instances. Handlers spawned this tick
//! run in the next one; events never interrupt a slice.

use std::{collections::VecDeque, sync::Arc};

use indexmap::IndexMap;

use crate::{
	image::ScriptImage,
	scriptable::{Host, ObjectId, ScriptId},
	value::Value,
	vm::{ScriptInstance, ScriptState, SharedVars, VmError},
};

/// Instructions per script per tick unless overridden.
pub const DEFAULT_SCRIPT_BUDGET: u32 = 4096;

#[derive(Debug)]
pub struct Scheduler {
	/// Keyed by spawn-ordered id; iteration order is the round-robin order.
	instances: IndexMap<ScriptId, ScriptInstance>,
	attachments: Vec<Attachment>,
	events: VecDeque<QueuedEvent>,
	next_script: u64,
	clock_ms: u64,
	budget_per_script: u32,
}

/// A script image registered against an object. Its `method` and `on`
/// tables service that object; instances spawned from it share one
/// top-level variable table.
#[derive(Debug)]
struct Attachment {
	owner: ObjectId,
	image: Arc<ScriptImage>,
	vars: SharedVars,
}

#[derive(Debug)]
struct QueuedEvent {
	target: ObjectId,
	name: String,
	args: Vec<Value>,
}

impl Default for Scheduler {
	fn default() -> Self {
		Self {
			instances: IndexMap::default(),
			attachments: vec![],
			events: VecDeque::new(),
			next_script: 0,
			clock_ms: 0,
			budget_per_script: DEFAULT_SCRIPT_BUDGET,
		}
	}
}

impl Scheduler {
	pub fn set_budget(&mut self, per_script: u32) {
		self.budget_per_script = per_script.max(1);
	}

	#[must_use]
	pub fn clock_ms(&self) -> u64 {
		self.clock_ms
	}

	#[must_use]
	pub fn script_count(&self) -> usize {
		self.instances.len()
	}

	#[must_use]
	pub fn is_live(&self, id: ScriptId) -> bool {
		self.instances.get(&id).is_some_and(ScriptInstance::is_live)
	}

	#[must_use]
	pub fn instance(&self, id: ScriptId) -> Option<&ScriptInstance> {
		self.instances.get(&id)
	}

	/// Spawns the script's top-level code as a fresh instance.
	pub fn load(&mut self, image: Arc<ScriptImage>, owner: Option<ObjectId>) -> ScriptId {
		let vars = SharedVars::default();
		self.spawn_entry(image, owner, vars, None)
	}

	/// Registers the image against `owner` (its methods and event handlers
	/// now service that object) and runs its top-level code.
	pub fn attach(&mut self, owner: ObjectId, image: Arc<ScriptImage>) -> ScriptId {
		let vars = SharedVars::default();

		self.attachments.push(Attachment {
			owner,
			image: image.clone(),
			vars: vars.clone(),
		});

		self.spawn_entry(image, Some(owner), vars, None)
	}

	fn spawn_entry(
		&mut self,
		image: Arc<ScriptImage>,
		owner: Option<ObjectId>,
		vars: SharedVars,
		parent: Option<ScriptId>,
	) -> ScriptId {
		let id = self.alloc_id();
		// No top-level code: start at the terminal position and finish on
		// the first step.
		let entry = image.entry.unwrap_or(image.code.len() as u32);
		let this = owner.map_or(Value::Null, Value::Object);
		let instance = ScriptInstance::new(id, image, entry, this, owner, vars, parent);

		self.instances.insert(id, instance);
		id
	}

	/// Drops every attachment to `owner` and kills its scripts. Called by
	/// the engine when the object is destroyed.
	pub fn detach_object(&mut self, owner: ObjectId) {
		self.attachments.retain(|att| att.owner != owner);

		for instance in self.instances.values_mut() {
			if instance.owner == Some(owner) && instance.is_live() {
				instance.cancel.cancel();
				instance.state = ScriptState::Finished;
			}
		}
	}

	/// Queues an event for FIFO dispatch at the end of the current tick.
	pub fn emit_event(&mut self, target: ObjectId, name: impl Into<String>, args: Vec<Value>) {
		self.events.push_back(QueuedEvent {
			target,
			name: name.into(),
			args,
		});
	}

	pub fn pause(&mut self, id: ScriptId) {
		if let Some(instance) = self.instances.get_mut(&id) {
			instance.paused = true;
		}
	}

	pub fn resume(&mut self, id: ScriptId) {
		if let Some(instance) = self.instances.get_mut(&id) {
			instance.paused = false;
		}
	}

	/// Finishes the script at the next instruction boundary. The shared
	/// cancellation token tells any in-flight blocking host call to stop
	/// waiting and not push a result.
	pub fn kill(&mut self, id: ScriptId) {
		if let Some(instance) = self.instances.get_mut(&id) {
			if instance.is_live() {
				instance.cancel.cancel();
				instance.state = ScriptState::Finished;
			}
		}
	}

	pub fn tick(&mut self, dt_ms: u64, host: &mut dyn Host) {
		self.clock_ms += dt_ms;
		let clock = self.clock_ms;

		// Wake pass.
		for instance in self.instances.values_mut() {
			if instance.paused {
				continue;
			}

			match instance.state {
				ScriptState::Sleeping { until_ms } if until_ms <= clock => {
					instance.state = ScriptState::Ready;
				}
				ScriptState::WaitingObject(oid) => {
					if !host.object_alive(oid) || host.object_ready(oid) {
						instance.resume_with(Value::Null);
					}
				}
				_ => {}
			}
		}

		// Runnable pass, round-robin in spawn order. Instances spawned
		// during the pass are not in the snapshot; they first run next
		// tick.
		let runnable: Vec<ScriptId> = self
			.instances
			.iter()
			.filter(|(_, i)| i.state == ScriptState::Ready && !i.paused)
			.map(|(id, _)| *id)
			.collect();

		for id in runnable {
			let budget = self.budget_per_script;

			let has_pending = {
				let Some(instance) = self.instances.get_mut(&id) else {
					continue;
				};

				instance.run_slice(host, clock, budget);
				instance.pending_method.is_some()
			};

			if has_pending {
				self.resolve_pending(id);
			}
		}

		self.reap();

		// Event drain: spawn one handler instance per subscribed
		// attachment, FIFO over the queue.
		let drained: Vec<QueuedEvent> = self.events.drain(..).collect();

		for event in drained {
			self.dispatch_event(&event);
		}
	}

	/// A method call that native dispatch declined: try the receiver's
	/// attached scripts; the caller waits for the spawned instance and
	/// receives its return value.
	fn resolve_pending(&mut self, caller: ScriptId) {
		let Some(instance) = self.instances.get_mut(&caller) else {
			return;
		};

		let Some(pending) = instance.pending_method.take() else {
			return;
		};

		let found = self.attachments.iter().find_map(|att| {
			if att.owner != pending.receiver {
				return None;
			}

			att.image
				.method(&pending.name)
				.map(|entry| (att.image.clone(), att.vars.clone(), entry.offset))
		});

		let Some((image, vars, offset)) = found else {
			let instance = self
				.instances
				.get_mut(&caller)
				.expect("pending caller vanished");

			instance.raise(&VmError::UnknownMethod(pending.name));
			return;
		};

		let child = self.alloc_id();

		let child_instance = ScriptInstance::with_locals(
			child,
			image,
			offset,
			Value::Object(pending.receiver),
			Some(pending.receiver),
			vars,
			Some(caller),
			pending.args,
		);

		self.instances.insert(child, child_instance);

		let instance = self
			.instances
			.get_mut(&caller)
			.expect("pending caller vanished");

		instance.state = ScriptState::WaitingScript(child);
	}

	fn dispatch_event(&mut self, event: &QueuedEvent) {
		// Collect first; spawning mutates `self.instances`.
		let matches: Vec<(Arc<ScriptImage>, SharedVars, u32)> = self
			.attachments
			.iter()
			.filter(|att| att.owner == event.target)
			.filter_map(|att| {
				att.image
					.event(&event.name)
					.map(|entry| (att.image.clone(), att.vars.clone(), entry.offset))
			})
			.collect();

		for (image, vars, offset) in matches {
			let id = self.alloc_id();

			let mut instance = ScriptInstance::new(
				id,
				image,
				offset,
				Value::Object(event.target),
				Some(event.target),
				vars,
				None,
			);

			instance.seed_operands(event.args.iter().cloned());
			self.instances.insert(id, instance);
		}
	}

	/// Removes finished and errored instances, delivering return values to
	/// any script waiting on them.
	fn reap(&mut self) {
		let done: Vec<(ScriptId, Value)> = self
			.instances
			.iter()
			.filter(|(_, i)| !i.is_live())
			.map(|(id, i)| (*id, i.return_value.clone()))
			.collect();

		if done.is_empty() {
			return;
		}

		for (done_id, ret) in &done {
			for instance in self.instances.values_mut() {
				if instance.state == ScriptState::WaitingScript(*done_id) {
					instance.resume_with(ret.clone());
				}
			}
		}

		for (done_id, _) in done {
			// Preserves spawn order for the survivors.
			self.instances.shift_remove(&done_id);
		}
	}

	fn alloc_id(&mut self) -> ScriptId {
		let id = ScriptId(self.next_script);
		self.next_script += 1;
		id
	}
}
