//! # Wintermute Engine
//!
//! The execution core of a point-and-click adventure runtime: a layered
//! package filesystem feeding a typed resource cache, a cooperative script
//! scheduler, and the reflective game-object tree scripts manipulate. The
//! renderer, audio mixer, and input capture are collaborators behind
//! narrow seams; everything here runs on the frame-loop thread.

pub mod catalog;
pub mod defs;
pub mod game;
pub mod persist;


use rustc_hash::FxHashMap;
use wme_script::{
	CallCtx, ExternalOutcome, Host, MethodOutcome, ObjectId, Scheduler, ScriptId, ScriptImage,
	Scriptable, Value, Wait,
};
use wme_vfs::{SourceId, VirtualFs};

use crate::{
	catalog::{Asset, Catalog, CatalogError},
	defs::DefBlock,
	game::{build_scene, build_sprite, GameData, GameObject, ObjectKind, Point, Registry},
	persist::{Persist, PersistError, Persistor, SaveHeader},
};

#[must_use]
pub fn version_string() -> String {
	format!("Wintermute Engine {}", env!("CARGO_PKG_VERSION"))
}

// Cached asset types //////////////////////////////////////////////////////////

/// Raw file contents, cached as-is.
#[derive(Debug)]
pub struct RawAsset(pub Vec<u8>);

impl Asset for RawAsset {
	fn byte_size(&self) -> usize {
		self.0.len()
	}
}

/// A parsed definition file.
#[derive(Debug)]
pub struct DefAsset {
	pub blocks: Vec<DefBlock>,
	size: usize,
}

impl Asset for DefAsset {
	fn byte_size(&self) -> usize {
		self.size
	}
}

impl Asset for ScriptImage {
	fn byte_size(&self) -> usize {
		self.code.len() + self.symbols.iter().map(String::len).sum::<usize>()
	}
}

// Engine //////////////////////////////////////////////////////////////////////

/// Scheduler work requested from inside a tick (where the scheduler is
/// busy driving scripts); applied once the tick returns.
#[derive(Debug)]
enum PendingOp {
	Attach { object: ObjectId, path: String },
	Emit {
		target: ObjectId,
		name: String,
		args: Vec<Value>,
	},
	ChangeScene(String),
	DetachScripts(ObjectId),
}

/// The one engine context. Constructed at startup, passed by reference
/// into everything; there is no ambient global.
pub struct Engine {
	vfs: VirtualFs,
	catalog: Catalog,
	scheduler: Scheduler,
	registry: Registry,
	globals: FxHashMap<String, Value>,
	string_table: FxHashMap<String, String>,
	game_id: ObjectId,
	current_scene: Option<ObjectId>,
	pending: Vec<PendingOp>,
	quit: bool,
	clock_ms: u64,
	game_version: u32,
	rng: u64,
}

impl Default for Engine {
	fn default() -> Self {
		Self::new()
	}
}

impl Engine {
	#[must_use]
	pub fn new() -> Self {
		let mut catalog = Catalog::default();

		catalog.register_loader::<RawAsset, _>(|bytes, _| Ok(RawAsset(bytes)));

		catalog.register_loader::<DefAsset, _>(|bytes, path| {
			let size = bytes.len();
			let source = text_of(bytes)?;
			let blocks = defs::parse(&source, path).map_err(|e| e.to_string())?;
			Ok(DefAsset { blocks, size })
		});

		// Script files arrive either precompiled (magic-tagged) or as
		// source; both load into the same image type.
		catalog.register_loader::<ScriptImage, _>(|bytes, path| {
			if bytes.starts_with(&wme_script::image::IMAGE_MAGIC.to_le_bytes()) {
				return ScriptImage::load(&bytes).map_err(|e| e.to_string());
			}

			let source = text_of(bytes)?;
			wme_script::compile(&source, path).map_err(|e| e.to_string())
		});

		let mut registry = Registry::default();
		let game_id = registry.spawn(ObjectKind::Game(GameData::default()));
		registry.get_mut(game_id).expect("just spawned").name = "Game".to_string();

		Self {
			vfs: VirtualFs::default(),
			catalog,
			scheduler: Scheduler::default(),
			registry,
			globals: FxHashMap::default(),
			string_table: FxHashMap::default(),
			game_id,
			current_scene: None,
			pending: vec![],
			quit: false,
			clock_ms: 0,
			game_version: 0,
			rng: 0x2545_F491_4F6C_DD1D,
		}
	}

	// Accessors ///////////////////////////////////////////////////////////////

	#[must_use]
	pub fn vfs(&self) -> &VirtualFs {
		&self.vfs
	}

	#[must_use]
	pub fn catalog(&self) -> &Catalog {
		&self.catalog
	}

	#[must_use]
	pub fn registry(&self) -> &Registry {
		&self.registry
	}

	#[must_use]
	pub fn scheduler(&self) -> &Scheduler {
		&self.scheduler
	}

	#[must_use]
	pub fn game_id(&self) -> ObjectId {
		self.game_id
	}

	#[must_use]
	pub fn current_scene(&self) -> Option<ObjectId> {
		self.current_scene
	}

	#[must_use]
	pub fn quit_requested(&self) -> bool {
		self.quit
	}

	pub fn request_quit(&mut self) {
		self.quit = true;
	}

	#[must_use]
	pub fn clock_ms(&self) -> u64 {
		self.clock_ms
	}

	/// Reads a script global by name (the compiler stores them
	/// case-folded).
	#[must_use]
	pub fn global(&self, name: &str) -> Value {
		self.globals
			.get(&name.to_ascii_lowercase())
			.cloned()
			.unwrap_or(Value::Null)
	}

	// Mounting and booting ////////////////////////////////////////////////////

	pub fn mount_package(
		&mut self,
		path: &std::path::Path,
		priority: Option<u8>,
	) -> Result<SourceId, Error> {
		self.vfs.mount(path, priority).map_err(Error::Vfs)
	}

	pub fn mount_dir(&mut self, path: &std::path::Path) -> Result<SourceId, Error> {
		self.vfs.mount_dir(path).map_err(Error::Vfs)
	}

	/// Reads the project's `GAME` definition: titles, version, string
	/// table, the game script, and the startup scene.
	pub fn boot(&mut self, project_path: &str) -> Result<(), Error> {
		let def = self
			.catalog
			.acquire::<DefAsset>(&self.vfs, project_path)
			.map_err(Error::Catalog)?;

		let game = def
			.blocks
			.iter()
			.find(|b| b.is("game"))
			.ok_or(Error::ProjectShape("no GAME block in the project file"))?;

		game.warn_unknown_keys(
			project_path,
			&[
				"name",
				"caption",
				"version",
				"script",
				"startup_scene",
				"string_table",
			],
		);

		{
			let game_obj = self
				.registry
				.get_mut(self.game_id)
				.expect("the game object lives as long as the engine");

			if let Some(name) = game.get_str("name") {
				game_obj.name = name.to_string();
			}

			if let Some(caption) = game.get_str("caption") {
				game_obj.caption = caption.to_string();
			}
		}

		self.game_version = game.get_int("version").unwrap_or(0) as u32;

		if let Some(table) = game.get_str("string_table").map(str::to_string) {
			self.load_string_table(&table)?;
		}

		let script = game.get_str("script").map(str::to_string);
		let startup = game.get_str("startup_scene").map(str::to_string);

		if let Some(script) = script {
			self.attach_script(self.game_id, &script)?;
		}

		if let Some(scene) = startup {
			if let ObjectKind::Game(data) = &mut self
				.registry
				.get_mut(self.game_id)
				.expect("game object")
				.kind
			{
				data.startup_scene = scene.clone();
			}

			self.change_scene_now(&scene)?;
		}

		log::info!("Booted project `{project_path}`.");
		Ok(())
	}

	fn load_string_table(&mut self, path: &str) -> Result<(), Error> {
		let def = self
			.catalog
			.acquire::<DefAsset>(&self.vfs, path)
			.map_err(Error::Catalog)?;

		let Some(table) = def.blocks.iter().find(|b| b.is("string_table")) else {
			return Err(Error::ProjectShape("no STRING_TABLE block in table file"));
		};

		for (key, value) in &table.entries {
			if let Some(text) = value.as_str() {
				self.string_table
					.insert(key.to_ascii_lowercase(), text.to_string());
			}
		}

		log::debug!("String table `{path}`: {} entries.", self.string_table.len());
		Ok(())
	}

	/// `/ID/fallback` resolves through the string table; anything else
	/// passes through unchanged.
	#[must_use]
	pub fn expand_string(&self, text: &str) -> String {
		let Some(rest) = text.strip_prefix('/') else {
			return text.to_string();
		};

		let Some((id, fallback)) = rest.split_once('/') else {
			return text.to_string();
		};

		match self.string_table.get(&id.to_ascii_lowercase()) {
			Some(resolved) => resolved.clone(),
			None => fallback.to_string(),
		}
	}

	// Scripts /////////////////////////////////////////////////////////////////

	/// Compiles (or loads precompiled) and attaches a script to an object.
	pub fn attach_script(&mut self, object: ObjectId, path: &str) -> Result<ScriptId, Error> {
		let image = self
			.catalog
			.acquire::<ScriptImage>(&self.vfs, path)
			.map_err(Error::Catalog)?;

		Ok(self.scheduler.attach(object, image.share()))
	}

	/// Compiles (or loads) and runs a free-standing script.
	pub fn load_script(&mut self, path: &str, owner: Option<ObjectId>) -> Result<ScriptId, Error> {
		let image = self
			.catalog
			.acquire::<ScriptImage>(&self.vfs, path)
			.map_err(Error::Catalog)?;

		Ok(self.scheduler.load(image.share(), owner))
	}

	pub fn emit_event(&mut self, target: ObjectId, name: &str, args: Vec<Value>) {
		self.scheduler.emit_event(target, name, args);
	}

	// Scenes //////////////////////////////////////////////////////////////////

	/// Tears down the current scene and builds the new one from its
	/// definition, resolving sprites and attaching scripts.
	pub fn change_scene_now(&mut self, path: &str) -> Result<ObjectId, Error> {
		if let Some(old) = self.current_scene.take() {
			self.destroy_object(old);
		}

		let def = self
			.catalog
			.acquire::<DefAsset>(&self.vfs, path)
			.map_err(Error::Catalog)?;

		let scene_def = def
			.blocks
			.iter()
			.find(|b| b.is("scene"))
			.ok_or(Error::ProjectShape("no SCENE block in scene file"))?;

		let build = build_scene(&mut self.registry, scene_def, path);

		// The scene hangs off the game object.
		self.registry
			.get_mut(self.game_id)
			.expect("game object")
			.children
			.push(build.scene);
		self.registry
			.get_mut(build.scene)
			.expect("just built")
			.parent = Some(self.game_id);

		for sprite_ref in &build.sprites {
			match self.load_sprite(sprite_ref.owner, &sprite_ref.path) {
				Ok(sprite) => self.bind_sprite(sprite_ref.owner, sprite, sprite_ref.key.as_deref()),
				Err(err) => {
					log::warn!(
						"Sprite `{}` for object #{} failed: {err}",
						sprite_ref.path,
						sprite_ref.owner.get(),
					);
				}
			}
		}

		for (object, script) in &build.scripts {
			if let Err(err) = self.attach_script(*object, script) {
				log::warn!(
					"Script `{script}` for object #{} failed: {err}",
					object.get(),
				);
			}
		}

		self.current_scene = Some(build.scene);
		log::info!("Entered scene `{path}`.");
		Ok(build.scene)
	}

	fn load_sprite(&mut self, owner: ObjectId, path: &str) -> Result<ObjectId, Error> {
		let def = self
			.catalog
			.acquire::<DefAsset>(&self.vfs, path)
			.map_err(Error::Catalog)?;

		let sprite_def = def
			.blocks
			.iter()
			.find(|b| b.is("sprite"))
			.ok_or(Error::ProjectShape("no SPRITE block in sprite file"))?;

		Ok(build_sprite(
			&mut self.registry,
			Some(owner),
			sprite_def,
			path,
		))
	}

	fn bind_sprite(&mut self, owner: ObjectId, sprite: ObjectId, key: Option<&str>) {
		let Some(object) = self.registry.get_mut(owner) else {
			return;
		};

		match (&mut object.kind, key) {
			(ObjectKind::Entity(entity), None) => entity.sprite = Some(sprite),
			(ObjectKind::Actor(actor), Some(key)) => {
				actor.sprites.insert(key.to_string(), sprite);
			}
			(ObjectKind::Actor(actor), None) => {
				actor.sprites.insert("idle_0".to_string(), sprite);
			}
			_ => log::warn!(
				"Object #{} cannot own sprite #{}.",
				owner.get(),
				sprite.get(),
			),
		}
	}

	/// Removes the object subtree and every script servicing it.
	pub fn destroy_object(&mut self, id: ObjectId) {
		for removed in self.registry.destroy(id) {
			self.scheduler.detach_object(removed);
		}
	}

	// The frame loop //////////////////////////////////////////////////////////

	/// One frame: scripts tick, deferred engine work applies, the object
	/// tree advances.
	pub fn frame(&mut self, dt_ms: u64) {
		self.clock_ms += dt_ms;

		// The scheduler drives scripts against `self` as the host, so it
		// steps out of the engine for the duration of the tick.
		let mut scheduler = std::mem::take(&mut self.scheduler);
		scheduler.tick(dt_ms, self);
		self.scheduler = scheduler;

		let pending = std::mem::take(&mut self.pending);

		for op in pending {
			match op {
				PendingOp::Attach { object, path } => {
					if let Err(err) = self.attach_script(object, &path) {
						log::warn!("Deferred attach of `{path}` failed: {err}");
					}
				}
				PendingOp::Emit { target, name, args } => {
					self.scheduler.emit_event(target, name, args);
				}
				PendingOp::ChangeScene(path) => {
					if let Err(err) = self.change_scene_now(&path) {
						log::error!("Scene change to `{path}` failed: {err}");
					}
				}
				PendingOp::DetachScripts(object) => {
					self.scheduler.detach_object(object);
				}
			}
		}

		let ids: Vec<ObjectId> = self.registry.ids().collect();

		for id in ids {
			if let Some(object) = self.registry.get_mut(id) {
				if object.active {
					object.update(dt_ms);
				}
			}
		}
	}

	// Persistence /////////////////////////////////////////////////////////////

	/// Serializes the whole game state behind a descriptive header.
	pub fn save_game(
		&mut self,
		name: &str,
		description: &str,
		timestamp: i64,
	) -> Result<Vec<u8>, PersistError> {
		let header = SaveHeader {
			game_version: self.game_version,
			name: name.to_string(),
			description: description.to_string(),
			timestamp,
			thumbnail: vec![],
		};

		let mut out = vec![];
		header.write(&mut out);

		let mut pm = Persistor::saver();
		self.persist_body(&mut pm)?;
		out.extend_from_slice(&pm.into_bytes());
		Ok(out)
	}

	/// Restores a save produced by [`Engine::save_game`]. Live state is
	/// untouched unless the whole file parses.
	pub fn load_game(&mut self, bytes: &[u8]) -> Result<SaveHeader, PersistError> {
		let (header, body_at) = SaveHeader::read(bytes)?;

		let mut pm = Persistor::loader(bytes[body_at..].to_vec());

		let mut staged = Staged::default();
		staged.read(&mut pm)?;

		// Reference fixup: drop ids that did not make it into the file.
		staged.validate();

		// Commit. Running scripts belong to the old world; they go.
		self.registry = staged.registry;
		self.globals = staged.globals;
		self.game_id = staged.game_id;
		self.current_scene = staged.current_scene;
		self.clock_ms = staged.clock_ms;
		self.scheduler = Scheduler::default();
		self.pending.clear();

		log::info!(
			"Loaded save `{}` ({} objects).",
			header.name,
			self.registry.len(),
		);

		Ok(header)
	}

	fn persist_body(&mut self, pm: &mut Persistor) -> Result<(), PersistError> {
		let mut game_id = self.game_id;
		pm.transfer_id("game id", &mut game_id)?;

		let mut scene = self.current_scene;
		pm.transfer_id_opt("current scene", &mut scene)?;

		let mut clock = self.clock_ms;
		pm.transfer_u64("clock", &mut clock)?;

		let mut next_id = self.registry.next_id();
		pm.transfer_u64("next id", &mut next_id)?;

		pm.transfer_props("globals", &mut self.globals)?;

		let mut count = self.registry.len() as u32;
		pm.transfer_u32("object count", &mut count)?;

		let ids: Vec<ObjectId> = self.registry.ids().collect();

		for id in ids {
			let object = self
				.registry
				.get_mut(id)
				.expect("id enumerated from this registry");

			let mut raw = object.id;
			pm.transfer_id("object id", &mut raw)?;

			let mut tag = object.kind.tag();
			pm.transfer_u8("object kind", &mut tag)?;

			object.persist(pm)?;
		}

		Ok(())
	}

	fn next_random(&mut self) -> u64 {
		// Plain xorshift; game-logic randomness has no quality bar.
		self.rng ^= self.rng << 13;
		self.rng ^= self.rng >> 7;
		self.rng ^= self.rng << 17;
		self.rng
	}

	/// Engine-level methods: everything a single object cannot answer by
	/// itself.
	fn engine_method(
		&mut self,
		id: ObjectId,
		name: &str,
		args: &[Value],
		_ctx: &CallCtx,
	) -> MethodOutcome {
		let Some(object) = self.registry.get(id) else {
			return MethodOutcome::Gone;
		};

		let class = object.kind.class_name();

		match (class, name) {
			("game", "msg") | ("game", "log") => {
				let line = args.first().map(Value::to_display).unwrap_or_default();
				log::info!(target: "script", "{}", self.expand_string(&line));
				MethodOutcome::Value(Value::Null)
			}
			("game", "quitgame") | ("game", "quit") => {
				self.quit = true;
				MethodOutcome::Value(Value::Null)
			}
			("game", "expandstring") => {
				let line = args.first().map(Value::to_display).unwrap_or_default();
				MethodOutcome::Value(Value::from(self.expand_string(&line)))
			}
			("game", "changescene") => {
				let Some(path) = args.first().map(Value::to_display) else {
					return MethodOutcome::Value(Value::Null);
				};

				self.pending.push(PendingOp::ChangeScene(path));
				MethodOutcome::Value(Value::Null)
			}
			("game", "takeitem") => {
				let taken = self.inventory_op(args, |inv, item| {
					if inv.contains(&item) {
						false
					} else {
						inv.push(item);
						true
					}
				});

				MethodOutcome::Value(Value::Bool(taken))
			}
			("game", "dropitem") => {
				let dropped = self.inventory_op(args, |inv, item| {
					let before = inv.len();
					inv.retain(|&i| i != item);
					before != inv.len()
				});

				MethodOutcome::Value(Value::Bool(dropped))
			}
			("game", "hasitem") => {
				let has = self.inventory_op(args, |inv, item| inv.contains(&item));
				MethodOutcome::Value(Value::Bool(has))
			}
			("scene", "getentity") | ("scene", "getnode") => {
				let Some(wanted) = args.first().map(Value::to_display) else {
					return MethodOutcome::Value(Value::Null);
				};

				let found = self.registry.find_by_name(id, &wanted);
				MethodOutcome::Value(found.map_or(Value::Null, Value::Object))
			}
			("scene", "getregionat") => {
				let x = args.first().map_or(0, |v| v.as_int()) as i32;
				let y = args.get(1).map_or(0, |v| v.as_int()) as i32;

				let ObjectKind::Scene(data) = &object.kind else {
					return MethodOutcome::Value(Value::Null);
				};

				let hit = data
					.region_at(Point::new(x, y))
					.map(|r| Value::from(r.name.clone()));

				MethodOutcome::Value(hit.unwrap_or(Value::Null))
			}
			("scene", "getscaleat") => {
				let y = args.first().map_or(0, |v| v.as_int()) as i32;

				let ObjectKind::Scene(data) = &object.kind else {
					return MethodOutcome::Value(Value::Null);
				};

				MethodOutcome::Value(Value::Float(data.scale_at(y)))
			}
			("actor", "walkto") | ("actor", "goto") => {
				let x = args.first().map_or(0, |v| v.as_int()) as i32;
				let y = args.get(1).map_or(0, |v| v.as_int()) as i32;

				let Some(object) = self.registry.get_mut(id) else {
					return MethodOutcome::Gone;
				};

				let from = object.pos;

				let ObjectKind::Actor(actor) = &mut object.kind else {
					return MethodOutcome::NotHandled;
				};

				actor.start_walk(from, Point::new(x, y));
				MethodOutcome::Suspend(Wait::Object(id))
			}
			("actor", "talk") | ("actor", "say") => {
				let line = args.first().map(Value::to_display).unwrap_or_default();
				let line = self.expand_string(&line);

				let Some(object) = self.registry.get_mut(id) else {
					return MethodOutcome::Gone;
				};

				let ObjectKind::Actor(actor) = &mut object.kind else {
					return MethodOutcome::NotHandled;
				};

				actor.start_speech(line);
				MethodOutcome::Suspend(Wait::Object(id))
			}
			("actor", "stopwalking") => {
				if let Some(object) = self.registry.get_mut(id) {
					if let ObjectKind::Actor(actor) = &mut object.kind {
						actor.walk = None;
					}
				}

				MethodOutcome::Value(Value::Null)
			}
			(_, "attachscript") => {
				let Some(path) = args.first().map(Value::to_display) else {
					return MethodOutcome::Value(Value::Bool(false));
				};

				self.pending.push(PendingOp::Attach { object: id, path });
				MethodOutcome::Value(Value::Bool(true))
			}
			(_, "detachscripts") => {
				self.pending.push(PendingOp::DetachScripts(id));
				MethodOutcome::Value(Value::Null)
			}
			(_, "emitevent") => {
				let Some(event) = args.first().map(Value::to_display) else {
					return MethodOutcome::Value(Value::Null);
				};

				self.pending.push(PendingOp::Emit {
					target: id,
					name: event,
					args: args[1..].to_vec(),
				});

				MethodOutcome::Value(Value::Null)
			}
			_ => MethodOutcome::NotHandled,
		}
	}

	/// Resolves the item argument (object reference or name) and applies
	/// `op` to the inventory.
	fn inventory_op(
		&mut self,
		args: &[Value],
		op: impl FnOnce(&mut Vec<ObjectId>, ObjectId) -> bool,
	) -> bool {
		let Some(arg) = args.first() else {
			return false;
		};

		let item = match arg {
			Value::Object(id) => Some(*id),
			other => self
				.registry
				.find_by_name(self.game_id, &other.to_display()),
		};

		let Some(item) = item.filter(|i| self.registry.contains(*i)) else {
			return false;
		};

		let Some(game) = self.registry.get_mut(self.game_id) else {
			return false;
		};

		let ObjectKind::Game(data) = &mut game.kind else {
			return false;
		};

		op(&mut data.inventory, item)
	}
}

/// Freshly loaded state, kept aside until the whole file parses.
struct Staged {
	registry: Registry,
	globals: FxHashMap<String, Value>,
	game_id: ObjectId,
	current_scene: Option<ObjectId>,
	clock_ms: u64,
}

impl Default for Staged {
	fn default() -> Self {
		Self {
			registry: Registry::default(),
			globals: FxHashMap::default(),
			game_id: ObjectId::new(0),
			current_scene: None,
			clock_ms: 0,
		}
	}
}

impl Staged {
	fn read(&mut self, pm: &mut Persistor) -> Result<(), PersistError> {
		pm.transfer_id("game id", &mut self.game_id)?;
		pm.transfer_id_opt("current scene", &mut self.current_scene)?;
		pm.transfer_u64("clock", &mut self.clock_ms)?;

		let mut next_id = 0_u64;
		pm.transfer_u64("next id", &mut next_id)?;

		pm.transfer_props("globals", &mut self.globals)?;

		let mut count = 0_u32;
		pm.transfer_u32("object count", &mut count)?;

		for _ in 0..count {
			let mut id = ObjectId::new(0);
			pm.transfer_id("object id", &mut id)?;

			let mut tag = 0_u8;
			pm.transfer_u8("object kind", &mut tag)?;

			let kind =
				ObjectKind::from_tag(tag).ok_or(PersistError::Corrupt("object kind tag"))?;

			let mut object = GameObject::new(id, kind);
			object.persist(pm)?;
			self.registry.adopt(object);
		}

		self.registry.restore_next_id(next_id);

		if !self.registry.contains(self.game_id) {
			return Err(PersistError::Corrupt("game object missing"));
		}

		Ok(())
	}

	/// Drops references to objects that are not in the file.
	fn validate(&mut self) {
		let live: Vec<ObjectId> = self.registry.ids().collect();

		for id in live {
			let present: Vec<ObjectId> = {
				let object = self.registry.get(id).expect("enumerated");
				object
					.children
					.iter()
					.copied()
					.filter(|c| self.registry.contains(*c))
					.collect()
			};

			let object = self.registry.get_mut(id).expect("enumerated");

			if present.len() != object.children.len() {
				log::warn!(
					"Save refers to missing children of object #{}; dropped.",
					id.get(),
				);
			}

			object.children = present;
		}

		if let Some(scene) = self.current_scene {
			if !self.registry.contains(scene) {
				log::warn!("Save's current scene is missing; cleared.");
				self.current_scene = None;
			}
		}
	}
}

impl Host for Engine {
	fn object_alive(&self, id: ObjectId) -> bool {
		self.registry.contains(id)
	}

	fn object_ready(&self, id: ObjectId) -> bool {
		self.registry.get(id).map_or(true, |o| !o.busy())
	}

	fn get_property(&mut self, id: ObjectId, name: &str) -> Option<Value> {
		if id == self.game_id && name == "currentscene" {
			return Some(self.current_scene.map_or(Value::Null, Value::Object));
		}

		self.registry.get(id).and_then(|o| o.get(name))
	}

	fn set_property(&mut self, id: ObjectId, name: &str, value: Value) -> bool {
		self.registry
			.get_mut(id)
			.map_or(false, |o| o.set(name, value))
	}

	fn call_method(
		&mut self,
		id: ObjectId,
		name: &str,
		args: &[Value],
		ctx: &CallCtx,
	) -> MethodOutcome {
		let local = match self.registry.get_mut(id) {
			Some(object) => object.call(name, args, ctx),
			None => return MethodOutcome::Gone,
		};

		match local {
			MethodOutcome::NotHandled => self.engine_method(id, name, args, ctx),
			handled => handled,
		}
	}

	fn call_external(&mut self, name: &str, args: &[Value], _ctx: &CallCtx) -> ExternalOutcome {
		match name {
			"print" | "log" => {
				let parts: Vec<String> = args.iter().map(Value::to_display).collect();
				log::info!(target: "script", "{}", parts.join(" "));
				ExternalOutcome::Value(Value::Null)
			}
			"random" => {
				let lo = args.first().map_or(0, Value::as_int);
				let hi = args.get(1).map_or(lo, Value::as_int);
				let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
				let span = (hi - lo + 1).max(1) as u64;
				let v = lo + (self.next_random() % span) as i64;
				ExternalOutcome::Value(Value::Int(v))
			}
			"abs" => {
				let v = match args.first() {
					Some(Value::Float(f)) => Value::Float(f.abs()),
					Some(other) => Value::Int(other.as_int().abs()),
					None => Value::Int(0),
				};

				ExternalOutcome::Value(v)
			}
			"toint" => {
				let v = args.first().map_or(0, Value::as_int);
				ExternalOutcome::Value(Value::Int(v))
			}
			"tostring" => {
				let v = args.first().map(Value::to_display).unwrap_or_default();
				ExternalOutcome::Value(Value::from(v))
			}
			_ => ExternalOutcome::Missing,
		}
	}

	fn create_object(&mut self, class: &str, args: Vec<Value>) -> Option<Value> {
		match class {
			"array" => {
				let array = match args.as_slice() {
					[] => Value::Array(vec![]),
					[Value::Int(n)] => Value::Array(vec![Value::Null; (*n).max(0) as usize]),
					_ => Value::Array(args),
				};

				Some(array)
			}
			"entity" | "item" | "window" => {
				let kind = match class {
					"entity" => ObjectKind::Entity(game::EntityData::default()),
					"item" => ObjectKind::Item(game::ItemData::default()),
					_ => ObjectKind::Window(game::WindowData::default()),
				};

				// Entities spawn into the scene; items and windows belong
				// to the game object directly.
				let parent = if class == "entity" {
					self.current_scene.unwrap_or(self.game_id)
				} else {
					self.game_id
				};

				let id = self.registry.spawn_child(parent, kind);

				if let Some(name) = args.first() {
					self.registry
						.get_mut(id)
						.expect("just spawned")
						.name = name.to_display();
				}

				Some(Value::Object(id))
			}
			_ => None,
		}
	}

	fn get_global(&mut self, name: &str) -> Value {
		match name {
			"game" => Value::Object(self.game_id),
			"scene" => self.current_scene.map_or(Value::Null, Value::Object),
			_ => self.globals.get(name).cloned().unwrap_or(Value::Null),
		}
	}

	fn set_global(&mut self, name: &str, value: Value) {
		self.globals.insert(name.to_string(), value);
	}
}

fn text_of(bytes: Vec<u8>) -> Result<String, String> {
	let mut bytes = bytes;

	if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
		bytes.drain(..3);
	}

	String::from_utf8(bytes).map_err(|_| "file is not UTF-8 text".to_string())
}

#[derive(Debug)]
pub enum Error {
	Vfs(wme_vfs::Error),
	Catalog(CatalogError),
	ProjectShape(&'static str),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Vfs(err) => write!(f, "filesystem error: {err}"),
			Self::Catalog(err) => err.fmt(f),
			Self::ProjectShape(msg) => write!(f, "project data malformed: {msg}"),
		}
	}
}
