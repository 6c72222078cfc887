//! Turns parsed definition blocks into live objects in the registry.
//!
//! Builders do not touch the VFS or the catalog; resources a block refers
//! to (scripts, sprite definitions) come back as path lists for the engine
//! to resolve, so that definition parsing stays testable in isolation.

use wme_script::ObjectId;

use crate::defs::{DefBlock, DefValue};

use super::{
	ActorData, ButtonData, EntityData, Frame, GameObject, ItemData, LayerData, ObjectKind, Point,
	Region, Registry, ScaleLevel, SceneData, SpriteData, Subframe, WaypointGroup, WindowData,
};

/// What a scene build wants the engine to resolve afterwards.
#[derive(Debug)]
pub struct SceneBuild {
	pub scene: ObjectId,
	/// (object, script path): scripts to compile and attach.
	pub scripts: Vec<(ObjectId, String)>,
	/// Sprite definitions to load and bind.
	pub sprites: Vec<SpriteRef>,
}

impl SceneBuild {
	#[must_use]
	pub fn new(scene: ObjectId) -> Self {
		Self {
			scene,
			scripts: vec![],
			sprites: vec![],
		}
	}
}

#[derive(Debug)]
pub struct SpriteRef {
	pub owner: ObjectId,
	pub path: String,
	/// `None` binds as the owner's main sprite; `Some` keys into an
	/// actor's sprite set ("walk_2").
	pub key: Option<String>,
}

const SCENE_KEYS: &[&str] = &["name", "caption", "script"];
const LAYER_KEYS: &[&str] = &["name", "width", "height", "main"];
const ENTITY_KEYS: &[&str] = &[
	"name", "caption", "x", "y", "sprite", "script", "walk_to_x", "walk_to_y", "active",
	"priority",
];
const ACTOR_KEYS: &[&str] = &["name", "caption", "x", "y", "script", "walk_speed", "direction"];
const ANIMATION_KEYS: &[&str] = &["name", "direction", "sprite"];
const REGION_KEYS: &[&str] = &["name", "active", "point"];
const WAYPOINT_KEYS: &[&str] = &["name", "point"];
const SCALE_KEYS: &[&str] = &["y", "scale"];
const WINDOW_KEYS: &[&str] = &["name", "caption", "x", "y", "width", "height", "modal", "script"];
const BUTTON_KEYS: &[&str] = &[
	"name", "caption", "x", "y", "width", "height", "press_event", "script",
];
const SPRITE_KEYS: &[&str] = &["name", "looping"];
const FRAME_KEYS: &[&str] = &["delay"];
const SUBFRAME_KEYS: &[&str] = &["image", "offset_x", "offset_y", "mirror"];
const ITEM_KEYS: &[&str] = &["name", "caption", "description", "cursor", "script"];

/// Builds a whole scene subtree from a `SCENE` block.
pub fn build_scene(registry: &mut Registry, def: &DefBlock, path: &str) -> SceneBuild {
	def.warn_unknown_keys(path, SCENE_KEYS);

	let scene = registry.spawn(ObjectKind::Scene(SceneData {
		source_path: path.to_string(),
		..SceneData::default()
	}));

	let mut out = SceneBuild::new(scene);

	apply_common(registry.get_mut(scene).expect("just spawned"), def);
	push_script(&mut out.scripts, scene, def);

	for child in &def.children {
		if child.is("layer") {
			build_layer(registry, scene, child, path, &mut out);
		} else if child.is("waypoints") {
			child.warn_unknown_keys(path, WAYPOINT_KEYS);

			let group = WaypointGroup {
				name: child.get_str("name").unwrap_or_default().to_string(),
				points: points_of(child),
			};

			scene_data(registry, scene).waypoint_groups.push(group);
		} else if child.is("region") {
			child.warn_unknown_keys(path, REGION_KEYS);

			let region = Region {
				name: child.get_str("name").unwrap_or_default().to_string(),
				points: points_of(child),
				active: child.get_bool("active").unwrap_or(true),
			};

			scene_data(registry, scene).regions.push(region);
		} else if child.is("scale_level") {
			child.warn_unknown_keys(path, SCALE_KEYS);

			let level = ScaleLevel {
				y: child.get_int("y").unwrap_or(0) as i32,
				scale: child.get_float("scale").unwrap_or(100.0),
			};

			scene_data(registry, scene).scale_levels.push(level);
		} else if child.is("actor") {
			build_actor(registry, scene, child, path, &mut out);
		} else {
			log::warn!(
				"`{path}` line {}: unknown block `{}` in SCENE; ignored.",
				child.line,
				child.name,
			);
		}
	}

	out
}

fn build_layer(
	registry: &mut Registry,
	scene: ObjectId,
	def: &DefBlock,
	path: &str,
	out: &mut SceneBuild,
) {
	def.warn_unknown_keys(path, LAYER_KEYS);

	let layer = registry.spawn_child(
		scene,
		ObjectKind::Layer(LayerData {
			width: def.get_int("width").unwrap_or(0) as i32,
			height: def.get_int("height").unwrap_or(0) as i32,
			main: def.get_bool("main").unwrap_or(false),
		}),
	);

	apply_common(registry.get_mut(layer).expect("just spawned"), def);

	for child in &def.children {
		if child.is("entity") {
			build_entity(registry, layer, child, path, out);
		} else if child.is("actor") {
			build_actor(registry, layer, child, path, out);
		} else {
			log::warn!(
				"`{path}` line {}: unknown block `{}` in LAYER; ignored.",
				child.line,
				child.name,
			);
		}
	}
}

pub fn build_entity(
	registry: &mut Registry,
	parent: ObjectId,
	def: &DefBlock,
	path: &str,
	out: &mut SceneBuild,
) -> ObjectId {
	def.warn_unknown_keys(path, ENTITY_KEYS);

	let walk_to = match (def.get_int("walk_to_x"), def.get_int("walk_to_y")) {
		(Some(x), Some(y)) => Some(Point::new(x as i32, y as i32)),
		_ => None,
	};

	let entity = registry.spawn_child(
		parent,
		ObjectKind::Entity(EntityData {
			sprite: None,
			walk_to,
		}),
	);

	apply_common(registry.get_mut(entity).expect("just spawned"), def);

	if let Some(sprite) = def.get_str("sprite") {
		out.sprites.push(SpriteRef {
			owner: entity,
			path: sprite.to_string(),
			key: None,
		});
	}

	push_script(&mut out.scripts, entity, def);
	entity
}

pub fn build_actor(
	registry: &mut Registry,
	parent: ObjectId,
	def: &DefBlock,
	path: &str,
	out: &mut SceneBuild,
) -> ObjectId {
	def.warn_unknown_keys(path, ACTOR_KEYS);

	let mut data = ActorData::default();

	if let Some(speed) = def.get_float("walk_speed") {
		data.speed = speed.max(1.0);
	}

	if let Some(dir) = def.get_int("direction") {
		data.dir = dir.rem_euclid(i64::from(super::DIRECTION_COUNT)) as u8;
	}

	let actor = registry.spawn_child(parent, ObjectKind::Actor(data));
	apply_common(registry.get_mut(actor).expect("just spawned"), def);

	if let Some(obj) = registry.get(actor) {
		let pos = obj.pos;

		if let ObjectKind::Actor(data) = &mut registry.get_mut(actor).expect("just spawned").kind {
			data.fpos = (f64::from(pos.x), f64::from(pos.y));
		}
	}

	for child in &def.children {
		if child.is("animation") {
			child.warn_unknown_keys(path, ANIMATION_KEYS);

			let action = child.get_str("name").unwrap_or("idle").to_string();
			let dir = child.get_int("direction").unwrap_or(0);

			if let Some(sprite) = child.get_str("sprite") {
				out.sprites.push(SpriteRef {
					owner: actor,
					path: sprite.to_string(),
					key: Some(format!("{}_{dir}", action.to_ascii_lowercase())),
				});
			}
		} else {
			log::warn!(
				"`{path}` line {}: unknown block `{}` in ACTOR; ignored.",
				child.line,
				child.name,
			);
		}
	}

	push_script(&mut out.scripts, actor, def);
	actor
}

/// Builds a sprite object from a `SPRITE` block, optionally under an
/// owning entity or actor.
pub fn build_sprite(
	registry: &mut Registry,
	parent: Option<ObjectId>,
	def: &DefBlock,
	path: &str,
) -> ObjectId {
	def.warn_unknown_keys(path, SPRITE_KEYS);

	let mut data = SpriteData {
		looping: def.get_bool("looping").unwrap_or(true),
		..SpriteData::default()
	};

	for frame_def in def.children_named("frame") {
		frame_def.warn_unknown_keys(path, FRAME_KEYS);

		let mut frame = Frame {
			delay_ms: frame_def.get_int("delay").unwrap_or(100).max(1) as u64,
			subframes: vec![],
		};

		for sub_def in frame_def.children_named("subframe") {
			sub_def.warn_unknown_keys(path, SUBFRAME_KEYS);

			frame.subframes.push(Subframe {
				image: sub_def.get_str("image").unwrap_or_default().to_string(),
				offset: Point::new(
					sub_def.get_int("offset_x").unwrap_or(0) as i32,
					sub_def.get_int("offset_y").unwrap_or(0) as i32,
				),
				mirror: sub_def.get_bool("mirror").unwrap_or(false),
			});
		}

		data.frames.push(frame);
	}

	let kind = ObjectKind::Sprite(data);

	let sprite = match parent {
		Some(parent) => registry.spawn_child(parent, kind),
		None => registry.spawn(kind),
	};

	apply_common(registry.get_mut(sprite).expect("just spawned"), def);
	sprite
}

/// Builds a window and its buttons from a `WINDOW` block.
pub fn build_window(
	registry: &mut Registry,
	parent: ObjectId,
	def: &DefBlock,
	path: &str,
	out: &mut SceneBuild,
) -> ObjectId {
	def.warn_unknown_keys(path, WINDOW_KEYS);

	let window = registry.spawn_child(
		parent,
		ObjectKind::Window(WindowData {
			modal: def.get_bool("modal").unwrap_or(false),
		}),
	);

	apply_common(registry.get_mut(window).expect("just spawned"), def);
	apply_bounds(registry.get_mut(window).expect("just spawned"), def);
	push_script(&mut out.scripts, window, def);

	for child in &def.children {
		if child.is("button") {
			child.warn_unknown_keys(path, BUTTON_KEYS);

			let button = registry.spawn_child(
				window,
				ObjectKind::Button(ButtonData {
					caption: child.get_str("caption").unwrap_or_default().to_string(),
					press_event: child
						.get_str("press_event")
						.unwrap_or("Press")
						.to_string(),
				}),
			);

			apply_common(registry.get_mut(button).expect("just spawned"), child);
			apply_bounds(registry.get_mut(button).expect("just spawned"), child);
			push_script(&mut out.scripts, button, child);
		} else {
			log::warn!(
				"`{path}` line {}: unknown block `{}` in WINDOW; ignored.",
				child.line,
				child.name,
			);
		}
	}

	window
}

/// Builds an inventory item from an `ITEM` block.
pub fn build_item(
	registry: &mut Registry,
	parent: ObjectId,
	def: &DefBlock,
	path: &str,
	out: &mut SceneBuild,
) -> ObjectId {
	def.warn_unknown_keys(path, ITEM_KEYS);

	let item = registry.spawn_child(
		parent,
		ObjectKind::Item(ItemData {
			description: def.get_str("description").unwrap_or_default().to_string(),
			cursor: def.get_str("cursor").unwrap_or_default().to_string(),
		}),
	);

	apply_common(registry.get_mut(item).expect("just spawned"), def);
	push_script(&mut out.scripts, item, def);
	item
}

fn apply_common(object: &mut GameObject, def: &DefBlock) {
	if let Some(name) = def.get_str("name") {
		object.name = name.to_string();
	}

	if let Some(caption) = def.get_str("caption") {
		object.caption = caption.to_string();
	}

	if let Some(x) = def.get_int("x") {
		object.pos.x = x as i32;
	}

	if let Some(y) = def.get_int("y") {
		object.pos.y = y as i32;
	}

	if let Some(active) = def.get_bool("active") {
		object.active = active;
	}

	if let Some(priority) = def.get_int("priority") {
		object.priority = priority as i32;
	}
}

fn apply_bounds(object: &mut GameObject, def: &DefBlock) {
	let width = def.get_int("width").unwrap_or(0) as i32;
	let height = def.get_int("height").unwrap_or(0) as i32;

	object.bounds = super::Rect {
		left: object.pos.x,
		top: object.pos.y,
		right: object.pos.x + width,
		bottom: object.pos.y + height,
	};
}

fn push_script(scripts: &mut Vec<(ObjectId, String)>, object: ObjectId, def: &DefBlock) {
	for script in def.get_all("script").filter_map(DefValue::as_str) {
		scripts.push((object, script.to_string()));
	}
}

fn points_of(def: &DefBlock) -> Vec<Point> {
	def.get_all("point")
		.filter_map(DefValue::as_pair)
		.map(|(x, y)| Point::new(x as i32, y as i32))
		.collect()
}

fn scene_data<'r>(registry: &'r mut Registry, scene: ObjectId) -> &'r mut SceneData {
	match &mut registry.get_mut(scene).expect("scene lives for the build").kind {
		ObjectKind::Scene(data) => data,
		_ => unreachable!("scene id built from a SCENE block"),
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::defs;

	const SCENE_SRC: &str = r#"
	SCENE {
		NAME = "town"
		SCRIPT = "scenes\town.script"

		LAYER {
			NAME = "main"
			WIDTH = 1024; HEIGHT = 768; MAIN = TRUE

			ENTITY {
				NAME = "door"
				X = 640; Y = 300
				SPRITE = "sprites\door.sprite"
				SCRIPT = "scenes\door.script"
				WALK_TO_X = 600; WALK_TO_Y = 380
			}

			ACTOR {
				NAME = "sally"
				X = 100; Y = 500
				WALK_SPEED = 120.0

				ANIMATION { NAME = "walk"; DIRECTION = 2; SPRITE = "actors\sally\walk_r.sprite" }
				ANIMATION { NAME = "walk"; DIRECTION = 6; SPRITE = "actors\sally\walk_l.sprite" }
			}
		}

		WAYPOINTS {
			NAME = "main"
			POINT = 100, 600
			POINT = 400, 620
		}

		REGION {
			NAME = "exit"
			POINT = 0, 0
			POINT = 50, 0
			POINT = 50, 768
			POINT = 0, 768
		}

		SCALE_LEVEL { Y = 300; SCALE = 60 }
		SCALE_LEVEL { Y = 700; SCALE = 100 }
	}
	"#;

	#[test]
	fn scene_tree_takes_shape() {
		let blocks = defs::parse(SCENE_SRC, "town.scene").unwrap();
		let mut registry = Registry::default();
		let build = build_scene(&mut registry, &blocks[0], "town.scene");

		let scene = registry.get(build.scene).unwrap();
		assert_eq!(scene.name, "town");
		assert_eq!(scene.children.len(), 1, "one layer");

		let layer_id = scene.children[0];
		let layer = registry.get(layer_id).unwrap();
		assert_eq!(layer.children.len(), 2, "door and sally");

		let door = registry.find_by_name(build.scene, "door").unwrap();
		let door_obj = registry.get(door).unwrap();
		assert_eq!(door_obj.pos, Point::new(640, 300));

		let ObjectKind::Entity(entity) = &door_obj.kind else {
			panic!("door must be an entity");
		};

		assert_eq!(entity.walk_to, Some(Point::new(600, 380)));

		let ObjectKind::Scene(data) = &scene.kind else {
			panic!("scene kind");
		};

		assert_eq!(data.waypoint_groups.len(), 1);
		assert_eq!(data.waypoint_groups[0].points.len(), 2);
		assert_eq!(data.regions.len(), 1);
		assert_eq!(data.scale_levels.len(), 2);

		// Deferred resource resolution.
		assert_eq!(build.scripts.len(), 2);
		assert!(build
			.scripts
			.iter()
			.any(|(id, path)| *id == build.scene && path == "scenes\\town.script"));

		assert_eq!(build.sprites.len(), 3);
		assert!(build
			.sprites
			.iter()
			.any(|s| s.owner == door && s.key.is_none()));

		let sally = registry.find_by_name(build.scene, "sally").unwrap();
		assert!(build
			.sprites
			.iter()
			.any(|s| s.owner == sally && s.key.as_deref() == Some("walk_2")));
	}

	#[test]
	fn sprite_frames_parse() {
		const SRC: &str = r#"
		SPRITE {
			NAME = "door"
			LOOPING = FALSE

			FRAME {
				DELAY = 120
				SUBFRAME { IMAGE = "sprites\door_1.png"; OFFSET_X = -4 }
			}

			FRAME {
				DELAY = 80
				SUBFRAME { IMAGE = "sprites\door_2.png"; MIRROR = TRUE }
			}
		}
		"#;

		let blocks = defs::parse(SRC, "door.sprite").unwrap();
		let mut registry = Registry::default();
		let id = build_sprite(&mut registry, None, &blocks[0], "door.sprite");

		let ObjectKind::Sprite(sprite) = &registry.get(id).unwrap().kind else {
			panic!("sprite kind");
		};

		assert!(!sprite.looping);
		assert_eq!(sprite.frames.len(), 2);
		assert_eq!(sprite.frames[0].delay_ms, 120);
		assert_eq!(sprite.frames[0].subframes[0].offset.x, -4);
		assert!(sprite.frames[1].subframes[0].mirror);
	}

	#[test]
	fn window_with_buttons() {
		const SRC: &str = r#"
		WINDOW {
			NAME = "menu"
			X = 200; Y = 150; WIDTH = 400; HEIGHT = 300
			MODAL = TRUE

			BUTTON {
				NAME = "ok"
				CAPTION = "Continue"
				X = 220; Y = 400; WIDTH = 120; HEIGHT = 40
			}
		}
		"#;

		let blocks = defs::parse(SRC, "menu.window").unwrap();
		let mut registry = Registry::default();
		let root = registry.spawn(ObjectKind::Game(super::super::GameData::default()));
		let mut out = SceneBuild::new(root);
		let id = build_window(&mut registry, root, &blocks[0], "menu.window", &mut out);

		let window = registry.get(id).unwrap();
		assert_eq!(window.bounds.right, 600);

		let ObjectKind::Window(data) = &window.kind else {
			panic!("window kind");
		};

		assert!(data.modal);

		let ok = registry.find_by_name(id, "ok").unwrap();

		let ObjectKind::Button(button) = &registry.get(ok).unwrap().kind else {
			panic!("button kind");
		};

		assert_eq!(button.caption, "Continue");
		assert_eq!(button.press_event, "Press");
	}
}
