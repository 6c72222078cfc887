//! The tree of script-visible game entities.
//!
//! Ownership runs strictly parent to child, by id, through the central
//! [`Registry`]; anything else that wants to point at an object (a script
//! value, an inventory list, an actor's sprite set) stores an [`ObjectId`]
//! and resolves it at use time. Destroying an object destroys its subtree
//! and leaves every outstanding id dangling, which readers observe as
//! "gone".

mod build;
mod kind;

pub use self::{build::*, kind::*};

use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use wme_script::{CallCtx, MethodOutcome, ObjectId, Scriptable, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Point {
	pub x: i32,
	pub y: i32,
}

impl Point {
	#[must_use]
	pub fn new(x: i32, y: i32) -> Self {
		Self { x, y }
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
	pub left: i32,
	pub top: i32,
	pub right: i32,
	pub bottom: i32,
}

impl Rect {
	#[must_use]
	pub fn contains(&self, p: Point) -> bool {
		p.x >= self.left && p.x < self.right && p.y >= self.top && p.y < self.bottom
	}
}

/// Fields shared by every object in the tree, plus the specialization.
#[derive(Debug)]
pub struct GameObject {
	pub id: ObjectId,
	pub name: String,
	pub caption: String,
	pub visible: bool,
	pub active: bool,
	/// Render ordering within a scene; higher draws later.
	pub priority: i32,
	pub pos: Point,
	pub bounds: Rect,
	pub parent: Option<ObjectId>,
	pub children: Vec<ObjectId>,
	/// Ad-hoc fields scripts have set on this object.
	pub props: FxHashMap<String, Value>,
	pub kind: ObjectKind,
}

impl GameObject {
	#[must_use]
	pub fn new(id: ObjectId, kind: ObjectKind) -> Self {
		Self {
			id,
			name: String::new(),
			caption: String::new(),
			visible: true,
			active: true,
			priority: 0,
			pos: Point::default(),
			bounds: Rect::default(),
			parent: None,
			children: vec![],
			props: FxHashMap::default(),
			kind,
		}
	}

	/// Advances time-driven state (sprite playback, actor movement and
	/// speech). Returns `true` if the object finished a blocking activity
	/// this frame.
	pub fn update(&mut self, dt_ms: u64) -> bool {
		match &mut self.kind {
			ObjectKind::Sprite(sprite) => {
				sprite.update(dt_ms);
				false
			}
			ObjectKind::Actor(actor) => actor.update(dt_ms, &mut self.pos),
			_ => false,
		}
	}

	/// An actor mid-walk or mid-speech blocks scripts waiting on it.
	#[must_use]
	pub fn busy(&self) -> bool {
		match &self.kind {
			ObjectKind::Actor(actor) => actor.walk.is_some() || actor.speech.is_some(),
			_ => false,
		}
	}
}

impl Scriptable for GameObject {
	fn get(&self, name: &str) -> Option<Value> {
		let lower = name.to_ascii_lowercase();

		let common = match lower.as_str() {
			"id" => Some(Value::Int(self.id.get() as i64)),
			"type" => Some(Value::from(self.kind.class_name())),
			"name" => Some(Value::from(self.name.clone())),
			"caption" => Some(Value::from(self.caption.clone())),
			"visible" => Some(Value::Bool(self.visible)),
			"active" => Some(Value::Bool(self.active)),
			"priority" => Some(Value::Int(i64::from(self.priority))),
			"x" => Some(Value::Int(i64::from(self.pos.x))),
			"y" => Some(Value::Int(i64::from(self.pos.y))),
			"parent" => Some(self.parent.map_or(Value::Null, Value::Object)),
			_ => None,
		};

		common
			.or_else(|| self.kind.get(&lower))
			.or_else(|| self.props.get(&lower).cloned())
	}

	fn set(&mut self, name: &str, value: Value) -> bool {
		let lower = name.to_ascii_lowercase();

		match lower.as_str() {
			// Identity and lineage are read-only.
			"id" | "type" | "parent" => return false,
			"name" => self.name = value.to_display(),
			"caption" => self.caption = value.to_display(),
			"visible" => self.visible = value.truthy(),
			"active" => self.active = value.truthy(),
			"priority" => self.priority = value.as_int() as i32,
			"x" => self.pos.x = value.as_int() as i32,
			"y" => self.pos.y = value.as_int() as i32,
			_ => {
				if !self.kind.set(&lower, &value) {
					self.props.insert(lower, value);
				}
			}
		}

		true
	}

	/// Methods that only touch this object resolve here; anything that
	/// needs the wider engine (scene lookups, walking, scene changes)
	/// reports `NotHandled` and is dispatched by the engine context.
	fn call(&mut self, name: &str, args: &[Value], _ctx: &CallCtx) -> MethodOutcome {
		let lower = name.to_ascii_lowercase();

		match (&mut self.kind, lower.as_str()) {
			(ObjectKind::Sprite(sprite), "play") => {
				sprite.play();
				MethodOutcome::Value(Value::Null)
			}
			(ObjectKind::Sprite(sprite), "stop") => {
				sprite.stop();
				MethodOutcome::Value(Value::Null)
			}
			(ObjectKind::Sprite(sprite), "reset") => {
				sprite.reset();
				MethodOutcome::Value(Value::Null)
			}
			(ObjectKind::Window(_), "show") => {
				self.visible = true;
				MethodOutcome::Value(Value::Null)
			}
			(ObjectKind::Window(_), "hide") => {
				self.visible = false;
				MethodOutcome::Value(Value::Null)
			}
			(ObjectKind::Actor(actor), "turnto") => {
				if let Some(dir) = args.first() {
					actor.dir = (dir.as_int().rem_euclid(DIRECTION_COUNT as i64)) as u8;
				}

				MethodOutcome::Value(Value::Null)
			}
			(ObjectKind::Entity(_), "skipto") => {
				if let (Some(x), Some(y)) = (args.first(), args.get(1)) {
					self.pos = Point::new(x.as_int() as i32, y.as_int() as i32);
				}

				MethodOutcome::Value(Value::Null)
			}
			_ => MethodOutcome::NotHandled,
		}
	}
}

/// Central owner of every live object, keyed by stable id.
///
/// Ids are monotonic and never reused for the lifetime of the process, so
/// a stale id held by a script resolves to nothing rather than to some
/// unrelated newcomer.
#[derive(Debug, Default)]
pub struct Registry {
	objects: IndexMap<ObjectId, GameObject>,
	next_id: u64,
}

impl Registry {
	/// Creates and inserts an object with no parent.
	pub fn spawn(&mut self, kind: ObjectKind) -> ObjectId {
		self.next_id += 1;
		let id = ObjectId::new(self.next_id);
		self.objects.insert(id, GameObject::new(id, kind));
		id
	}

	/// Creates and inserts an object under `parent`.
	pub fn spawn_child(&mut self, parent: ObjectId, kind: ObjectKind) -> ObjectId {
		let id = self.spawn(kind);

		if self.objects.contains_key(&parent) {
			self.objects[&parent].children.push(id);
			self.objects[&id].parent = Some(parent);
		} else {
			log::warn!("Spawned object #{} under a dead parent.", id.get());
		}

		id
	}

	#[must_use]
	pub fn contains(&self, id: ObjectId) -> bool {
		self.objects.contains_key(&id)
	}

	#[must_use]
	pub fn get(&self, id: ObjectId) -> Option<&GameObject> {
		self.objects.get(&id)
	}

	#[must_use]
	pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut GameObject> {
		self.objects.get_mut(&id)
	}

	/// Removes the object and its whole subtree. Returns every removed id
	/// (so callers can release attached scripts and other registrations).
	pub fn destroy(&mut self, id: ObjectId) -> Vec<ObjectId> {
		let Some(object) = self.objects.get(&id) else {
			return vec![];
		};

		// Unlink from the parent's child list first.
		if let Some(parent) = object.parent {
			if let Some(parent_obj) = self.objects.get_mut(&parent) {
				parent_obj.children.retain(|&c| c != id);
			}
		}

		let mut removed = vec![];
		let mut stack = vec![id];

		while let Some(current) = stack.pop() {
			if let Some(object) = self.objects.shift_remove(&current) {
				stack.extend(object.children);
				removed.push(current);
			}
		}

		removed
	}

	/// Finds a direct or transitive child of `root` by name,
	/// case-insensitively.
	#[must_use]
	pub fn find_by_name(&self, root: ObjectId, name: &str) -> Option<ObjectId> {
		let mut stack = vec![root];

		while let Some(current) = stack.pop() {
			let object = self.objects.get(&current)?;

			if current != root && object.name.eq_ignore_ascii_case(name) {
				return Some(current);
			}

			stack.extend(object.children.iter().copied());
		}

		None
	}

	pub fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
		self.objects.keys().copied()
	}

	pub fn iter(&self) -> impl Iterator<Item = &GameObject> {
		self.objects.values()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.objects.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.objects.is_empty()
	}

	#[must_use]
	pub fn next_id(&self) -> u64 {
		self.next_id
	}

	/// Restores the id counter during load; never lower it.
	pub fn restore_next_id(&mut self, next_id: u64) {
		self.next_id = self.next_id.max(next_id);
	}

	/// Re-inserts a fully formed object during load.
	pub fn adopt(&mut self, object: GameObject) {
		self.next_id = self.next_id.max(object.id.get());
		self.objects.insert(object.id, object);
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn ids_are_never_reused() {
		let mut registry = Registry::default();
		let a = registry.spawn(ObjectKind::Entity(EntityData::default()));
		registry.destroy(a);

		let b = registry.spawn(ObjectKind::Entity(EntityData::default()));
		assert_ne!(a, b);
		assert!(!registry.contains(a));
		assert!(registry.contains(b));
	}

	#[test]
	fn destroy_takes_the_subtree() {
		let mut registry = Registry::default();
		let scene = registry.spawn(ObjectKind::Scene(SceneData::default()));
		let layer = registry.spawn_child(scene, ObjectKind::Layer(LayerData::default()));
		let door = registry.spawn_child(layer, ObjectKind::Entity(EntityData::default()));
		let other = registry.spawn(ObjectKind::Entity(EntityData::default()));

		let removed = registry.destroy(layer);
		assert_eq!(removed.len(), 2);
		assert!(registry.contains(scene));
		assert!(!registry.contains(layer));
		assert!(!registry.contains(door));
		assert!(registry.contains(other));
		assert!(registry.get(scene).unwrap().children.is_empty());
	}

	#[test]
	fn property_bag_round_trips() {
		let mut registry = Registry::default();
		let id = registry.spawn(ObjectKind::Item(ItemData::default()));
		let object = registry.get_mut(id).unwrap();

		assert!(object.set("CustomField", Value::Int(42)));
		assert!(object.get("customfield").unwrap().loose_eq(&Value::Int(42)));

		assert!(object.set("Name", Value::from("lantern")));
		assert!(object.get("NAME").unwrap().loose_eq(&Value::from("lantern")));

		assert!(!object.set("id", Value::Int(999)), "id is read-only");
		assert!(object.get("nosuch").is_none());
	}

	#[test]
	fn find_by_name_walks_the_tree() {
		let mut registry = Registry::default();
		let scene = registry.spawn(ObjectKind::Scene(SceneData::default()));
		let layer = registry.spawn_child(scene, ObjectKind::Layer(LayerData::default()));
		let door = registry.spawn_child(layer, ObjectKind::Entity(EntityData::default()));
		registry.get_mut(door).unwrap().name = "Door".to_string();

		assert_eq!(registry.find_by_name(scene, "door"), Some(door));
		assert_eq!(registry.find_by_name(scene, "DOOR"), Some(door));
		assert_eq!(registry.find_by_name(scene, "window"), None);
	}
}
