//! Save-game serialization: one `persist` method per object, driven in
//! write mode to produce a save and in read mode to restore it.
//!
//! Object cross-references serialize as stable ids; after every object is
//! materialized, a fixup pass drops references whose targets did not make
//! it into the file. Loading never touches live state: callers build a
//! fresh registry aside and swap it in only on success.

use std::io;

use byteorder::{ByteOrder, LittleEndian};
use rustc_hash::FxHashMap;
use wme_script::{ObjectId, Value};

use crate::game::{
	ActorData, ButtonData, EntityData, Frame, GameData, GameObject, ItemData, LayerData,
	ObjectKind, Point, Region, ScaleLevel, SceneData, SpeechState, SpriteData, Subframe,
	WalkState, WaypointGroup, WindowData,
};

pub const SAVE_MAGIC: u32 = 0xDEC0_ADDE;
/// Engine save-format version.
pub const SAVE_VERSION: u32 = 2;

/// How a save or load ended, for the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveLoadResult {
	Ok,
	VersionTooOld,
	VersionTooNew,
	Corrupt,
	IoError,
}

#[derive(Debug)]
pub enum PersistError {
	VersionTooOld(u32),
	VersionTooNew(u32),
	/// Which field the stream ended or degenerated in.
	Corrupt(&'static str),
	Io(io::Error),
}

impl PersistError {
	#[must_use]
	pub fn result(&self) -> SaveLoadResult {
		match self {
			Self::VersionTooOld(_) => SaveLoadResult::VersionTooOld,
			Self::VersionTooNew(_) => SaveLoadResult::VersionTooNew,
			Self::Corrupt(_) => SaveLoadResult::Corrupt,
			Self::Io(_) => SaveLoadResult::IoError,
		}
	}
}

impl std::error::Error for PersistError {}

impl std::fmt::Display for PersistError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::VersionTooOld(v) => write!(f, "save format {v} predates the supported range"),
			Self::VersionTooNew(v) => write!(f, "save format {v} is from a newer engine"),
			Self::Corrupt(field) => write!(f, "save data is corrupt (at `{field}`)"),
			Self::Io(err) => write!(f, "save I/O failed: {err}"),
		}
	}
}

/// Fixed descriptive fields at the front of every save file.
#[derive(Debug, Clone, Default)]
pub struct SaveHeader {
	pub game_version: u32,
	pub name: String,
	pub description: String,
	pub timestamp: i64,
	pub thumbnail: Vec<u8>,
}

impl SaveHeader {
	pub fn write(&self, out: &mut Vec<u8>) {
		let mut word = [0_u8; 4];

		LittleEndian::write_u32(&mut word, SAVE_MAGIC);
		out.extend_from_slice(&word);
		LittleEndian::write_u32(&mut word, SAVE_VERSION);
		out.extend_from_slice(&word);
		LittleEndian::write_u32(&mut word, self.game_version);
		out.extend_from_slice(&word);

		write_str(out, &self.name);
		write_str(out, &self.description);

		let mut wide = [0_u8; 8];
		LittleEndian::write_i64(&mut wide, self.timestamp);
		out.extend_from_slice(&wide);

		LittleEndian::write_u32(&mut word, self.thumbnail.len() as u32);
		out.extend_from_slice(&word);
		out.extend_from_slice(&self.thumbnail);
	}

	/// Parses the header, returning it and the offset of the body.
	pub fn read(bytes: &[u8]) -> Result<(Self, usize), PersistError> {
		let mut pos = 0_usize;

		let magic = read_u32(bytes, &mut pos, "magic")?;

		if magic != SAVE_MAGIC {
			return Err(PersistError::Corrupt("magic"));
		}

		let version = read_u32(bytes, &mut pos, "version")?;

		if version < SAVE_VERSION {
			return Err(PersistError::VersionTooOld(version));
		}

		if version > SAVE_VERSION {
			return Err(PersistError::VersionTooNew(version));
		}

		let game_version = read_u32(bytes, &mut pos, "game version")?;
		let name = read_str(bytes, &mut pos, "name")?;
		let description = read_str(bytes, &mut pos, "description")?;

		if pos + 8 > bytes.len() {
			return Err(PersistError::Corrupt("timestamp"));
		}

		let timestamp = LittleEndian::read_i64(&bytes[pos..]);
		pos += 8;

		let thumb_len = read_u32(bytes, &mut pos, "thumbnail")? as usize;

		if pos + thumb_len > bytes.len() {
			return Err(PersistError::Corrupt("thumbnail"));
		}

		let thumbnail = bytes[pos..pos + thumb_len].to_vec();
		pos += thumb_len;

		Ok((
			Self {
				game_version,
				name,
				description,
				timestamp,
				thumbnail,
			},
			pos,
		))
	}
}

fn write_str(out: &mut Vec<u8>, s: &str) {
	let mut word = [0_u8; 4];
	LittleEndian::write_u32(&mut word, s.len() as u32);
	out.extend_from_slice(&word);
	out.extend_from_slice(s.as_bytes());
}

fn read_u32(bytes: &[u8], pos: &mut usize, field: &'static str) -> Result<u32, PersistError> {
	if *pos + 4 > bytes.len() {
		return Err(PersistError::Corrupt(field));
	}

	let v = LittleEndian::read_u32(&bytes[*pos..]);
	*pos += 4;
	Ok(v)
}

fn read_str(bytes: &[u8], pos: &mut usize, field: &'static str) -> Result<String, PersistError> {
	let len = read_u32(bytes, pos, field)? as usize;

	if *pos + len > bytes.len() {
		return Err(PersistError::Corrupt(field));
	}

	let s = String::from_utf8(bytes[*pos..*pos + len].to_vec())
		.map_err(|_| PersistError::Corrupt(field))?;

	*pos += len;
	Ok(s)
}

/// The bidirectional transfer context. In save mode every `transfer_*`
/// call appends; in load mode it reads into the same field.
#[derive(Debug)]
pub struct Persistor {
	saving: bool,
	buf: Vec<u8>,
	pos: usize,
}

impl Persistor {
	#[must_use]
	pub fn saver() -> Self {
		Self {
			saving: true,
			buf: vec![],
			pos: 0,
		}
	}

	#[must_use]
	pub fn loader(body: Vec<u8>) -> Self {
		Self {
			saving: false,
			buf: body,
			pos: 0,
		}
	}

	#[must_use]
	pub fn is_saving(&self) -> bool {
		self.saving
	}

	#[must_use]
	pub fn into_bytes(self) -> Vec<u8> {
		self.buf
	}

	/// Whether the load cursor consumed the whole body.
	#[must_use]
	pub fn exhausted(&self) -> bool {
		self.pos >= self.buf.len()
	}

	fn take(&mut self, n: usize, field: &'static str) -> Result<&[u8], PersistError> {
		if self.pos + n > self.buf.len() {
			return Err(PersistError::Corrupt(field));
		}

		let slice = &self.buf[self.pos..self.pos + n];
		self.pos += n;
		Ok(slice)
	}

	pub fn transfer_u8(&mut self, field: &'static str, v: &mut u8) -> Result<(), PersistError> {
		if self.saving {
			self.buf.push(*v);
		} else {
			*v = self.take(1, field)?[0];
		}

		Ok(())
	}

	pub fn transfer_bool(&mut self, field: &'static str, v: &mut bool) -> Result<(), PersistError> {
		let mut byte = u8::from(*v);
		self.transfer_u8(field, &mut byte)?;
		*v = byte != 0;
		Ok(())
	}

	pub fn transfer_u32(&mut self, field: &'static str, v: &mut u32) -> Result<(), PersistError> {
		if self.saving {
			let mut word = [0_u8; 4];
			LittleEndian::write_u32(&mut word, *v);
			self.buf.extend_from_slice(&word);
		} else {
			*v = LittleEndian::read_u32(self.take(4, field)?);
		}

		Ok(())
	}

	pub fn transfer_i32(&mut self, field: &'static str, v: &mut i32) -> Result<(), PersistError> {
		let mut raw = *v as u32;
		self.transfer_u32(field, &mut raw)?;
		*v = raw as i32;
		Ok(())
	}

	pub fn transfer_u64(&mut self, field: &'static str, v: &mut u64) -> Result<(), PersistError> {
		if self.saving {
			let mut wide = [0_u8; 8];
			LittleEndian::write_u64(&mut wide, *v);
			self.buf.extend_from_slice(&wide);
		} else {
			*v = LittleEndian::read_u64(self.take(8, field)?);
		}

		Ok(())
	}

	pub fn transfer_i64(&mut self, field: &'static str, v: &mut i64) -> Result<(), PersistError> {
		let mut raw = *v as u64;
		self.transfer_u64(field, &mut raw)?;
		*v = raw as i64;
		Ok(())
	}

	pub fn transfer_f64(&mut self, field: &'static str, v: &mut f64) -> Result<(), PersistError> {
		let mut raw = v.to_bits();
		self.transfer_u64(field, &mut raw)?;
		*v = f64::from_bits(raw);
		Ok(())
	}

	pub fn transfer_string(
		&mut self,
		field: &'static str,
		v: &mut String,
	) -> Result<(), PersistError> {
		if self.saving {
			write_str(&mut self.buf, v);
		} else {
			let len = {
				let mut len = 0_u32;
				self.transfer_u32(field, &mut len)?;
				len as usize
			};

			let bytes = self.take(len, field)?.to_vec();
			*v = String::from_utf8(bytes).map_err(|_| PersistError::Corrupt(field))?;
		}

		Ok(())
	}

	pub fn transfer_id(
		&mut self,
		field: &'static str,
		v: &mut ObjectId,
	) -> Result<(), PersistError> {
		let mut raw = v.get();
		self.transfer_u64(field, &mut raw)?;
		*v = ObjectId::new(raw);
		Ok(())
	}

	/// An optional reference: zero on the wire means `None` (live ids
	/// start at one).
	pub fn transfer_id_opt(
		&mut self,
		field: &'static str,
		v: &mut Option<ObjectId>,
	) -> Result<(), PersistError> {
		let mut raw = v.map_or(0, ObjectId::get);
		self.transfer_u64(field, &mut raw)?;
		*v = (raw != 0).then(|| ObjectId::new(raw));
		Ok(())
	}

	pub fn transfer_ids(
		&mut self,
		field: &'static str,
		v: &mut Vec<ObjectId>,
	) -> Result<(), PersistError> {
		let mut count = v.len() as u32;
		self.transfer_u32(field, &mut count)?;

		if self.saving {
			for id in v.iter_mut() {
				self.transfer_id(field, id)?;
			}
		} else {
			v.clear();

			for _ in 0..count {
				let mut id = ObjectId::new(0);
				self.transfer_id(field, &mut id)?;
				v.push(id);
			}
		}

		Ok(())
	}

	pub fn transfer_point(
		&mut self,
		field: &'static str,
		v: &mut Point,
	) -> Result<(), PersistError> {
		self.transfer_i32(field, &mut v.x)?;
		self.transfer_i32(field, &mut v.y)
	}

	pub fn transfer_value(
		&mut self,
		field: &'static str,
		v: &mut Value,
	) -> Result<(), PersistError> {
		if self.saving {
			match v {
				Value::Null => self.buf.push(0),
				Value::Bool(b) => {
					self.buf.push(1);
					self.buf.push(u8::from(*b));
				}
				Value::Int(i) => {
					self.buf.push(2);
					let mut raw = *i;
					self.transfer_i64(field, &mut raw)?;
				}
				Value::Float(x) => {
					self.buf.push(3);
					let mut raw = *x;
					self.transfer_f64(field, &mut raw)?;
				}
				Value::String(s) => {
					self.buf.push(4);
					write_str(&mut self.buf, s);
				}
				Value::Object(id) => {
					self.buf.push(5);
					let mut raw = *id;
					self.transfer_id(field, &mut raw)?;
				}
				Value::Array(items) => {
					self.buf.push(6);
					let mut count = items.len() as u32;
					self.transfer_u32(field, &mut count)?;

					for item in items {
						self.transfer_value(field, item)?;
					}
				}
			}

			return Ok(());
		}

		let tag = self.take(1, field)?[0];

		*v = match tag {
			0 => Value::Null,
			1 => Value::Bool(self.take(1, field)?[0] != 0),
			2 => {
				let mut raw = 0_i64;
				self.transfer_i64(field, &mut raw)?;
				Value::Int(raw)
			}
			3 => {
				let mut raw = 0.0_f64;
				self.transfer_f64(field, &mut raw)?;
				Value::Float(raw)
			}
			4 => {
				let mut s = String::new();
				self.transfer_string(field, &mut s)?;
				Value::String(s)
			}
			5 => {
				let mut id = ObjectId::new(0);
				self.transfer_id(field, &mut id)?;
				Value::Object(id)
			}
			6 => {
				let mut count = 0_u32;
				self.transfer_u32(field, &mut count)?;
				let mut items = Vec::with_capacity(count.min(0xFFFF) as usize);

				for _ in 0..count {
					let mut item = Value::Null;
					self.transfer_value(field, &mut item)?;
					items.push(item);
				}

				Value::Array(items)
			}
			_ => return Err(PersistError::Corrupt(field)),
		};

		Ok(())
	}

	/// Property bags and globals: written key-sorted so that identical
	/// state always produces identical bytes.
	pub fn transfer_props(
		&mut self,
		field: &'static str,
		v: &mut FxHashMap<String, Value>,
	) -> Result<(), PersistError> {
		let mut count = v.len() as u32;
		self.transfer_u32(field, &mut count)?;

		if self.saving {
			let mut keys: Vec<&String> = v.keys().collect();
			keys.sort();
			let keys: Vec<String> = keys.into_iter().cloned().collect();

			for key in keys {
				let mut k = key.clone();
				self.transfer_string(field, &mut k)?;
				let value = v.get_mut(&key).expect("key collected from this map");
				self.transfer_value(field, value)?;
			}
		} else {
			v.clear();

			for _ in 0..count {
				let mut key = String::new();
				self.transfer_string(field, &mut key)?;
				let mut value = Value::Null;
				self.transfer_value(field, &mut value)?;
				v.insert(key, value);
			}
		}

		Ok(())
	}
}

/// Implemented by everything that takes part in the save-file traversal.
pub trait Persist {
	fn persist(&mut self, pm: &mut Persistor) -> Result<(), PersistError>;
}

impl Persist for GameObject {
	fn persist(&mut self, pm: &mut Persistor) -> Result<(), PersistError> {
		pm.transfer_string("name", &mut self.name)?;
		pm.transfer_string("caption", &mut self.caption)?;
		pm.transfer_bool("visible", &mut self.visible)?;
		pm.transfer_bool("active", &mut self.active)?;
		pm.transfer_i32("priority", &mut self.priority)?;
		pm.transfer_point("pos", &mut self.pos)?;
		pm.transfer_i32("bounds.left", &mut self.bounds.left)?;
		pm.transfer_i32("bounds.top", &mut self.bounds.top)?;
		pm.transfer_i32("bounds.right", &mut self.bounds.right)?;
		pm.transfer_i32("bounds.bottom", &mut self.bounds.bottom)?;
		pm.transfer_id_opt("parent", &mut self.parent)?;
		pm.transfer_ids("children", &mut self.children)?;
		pm.transfer_props("props", &mut self.props)?;

		match &mut self.kind {
			ObjectKind::Game(data) => data.persist(pm),
			ObjectKind::Scene(data) => data.persist(pm),
			ObjectKind::Layer(data) => data.persist(pm),
			ObjectKind::Entity(data) => data.persist(pm),
			ObjectKind::Actor(data) => data.persist(pm),
			ObjectKind::Item(data) => data.persist(pm),
			ObjectKind::Window(data) => data.persist(pm),
			ObjectKind::Button(data) => data.persist(pm),
			ObjectKind::Sprite(data) => data.persist(pm),
		}
	}
}

impl Persist for GameData {
	fn persist(&mut self, pm: &mut Persistor) -> Result<(), PersistError> {
		pm.transfer_ids("inventory", &mut self.inventory)?;
		pm.transfer_string("startup scene", &mut self.startup_scene)
	}
}

impl Persist for SceneData {
	fn persist(&mut self, pm: &mut Persistor) -> Result<(), PersistError> {
		pm.transfer_string("scene path", &mut self.source_path)?;

		let mut groups = self.waypoint_groups.len() as u32;
		pm.transfer_u32("waypoint groups", &mut groups)?;

		if pm.is_saving() {
			for group in &mut self.waypoint_groups {
				group.persist(pm)?;
			}
		} else {
			self.waypoint_groups.clear();

			for _ in 0..groups {
				let mut group = WaypointGroup::default();
				group.persist(pm)?;
				self.waypoint_groups.push(group);
			}
		}

		let mut regions = self.regions.len() as u32;
		pm.transfer_u32("regions", &mut regions)?;

		if pm.is_saving() {
			for region in &mut self.regions {
				region.persist(pm)?;
			}
		} else {
			self.regions.clear();

			for _ in 0..regions {
				let mut region = Region::default();
				region.persist(pm)?;
				self.regions.push(region);
			}
		}

		let mut levels = self.scale_levels.len() as u32;
		pm.transfer_u32("scale levels", &mut levels)?;

		if pm.is_saving() {
			for level in &mut self.scale_levels {
				pm.transfer_i32("scale y", &mut level.y)?;
				pm.transfer_f64("scale", &mut level.scale)?;
			}
		} else {
			self.scale_levels.clear();

			for _ in 0..levels {
				let mut level = ScaleLevel::default();
				pm.transfer_i32("scale y", &mut level.y)?;
				pm.transfer_f64("scale", &mut level.scale)?;
				self.scale_levels.push(level);
			}
		}

		Ok(())
	}
}

impl Persist for WaypointGroup {
	fn persist(&mut self, pm: &mut Persistor) -> Result<(), PersistError> {
		pm.transfer_string("waypoint name", &mut self.name)?;
		transfer_points(pm, "waypoints", &mut self.points)
	}
}

impl Persist for Region {
	fn persist(&mut self, pm: &mut Persistor) -> Result<(), PersistError> {
		pm.transfer_string("region name", &mut self.name)?;
		pm.transfer_bool("region active", &mut self.active)?;
		transfer_points(pm, "region points", &mut self.points)
	}
}

fn transfer_points(
	pm: &mut Persistor,
	field: &'static str,
	points: &mut Vec<Point>,
) -> Result<(), PersistError> {
	let mut count = points.len() as u32;
	pm.transfer_u32(field, &mut count)?;

	if pm.is_saving() {
		for point in points.iter_mut() {
			pm.transfer_point(field, point)?;
		}
	} else {
		points.clear();

		for _ in 0..count {
			let mut point = Point::default();
			pm.transfer_point(field, &mut point)?;
			points.push(point);
		}
	}

	Ok(())
}

impl Persist for LayerData {
	fn persist(&mut self, pm: &mut Persistor) -> Result<(), PersistError> {
		pm.transfer_i32("layer width", &mut self.width)?;
		pm.transfer_i32("layer height", &mut self.height)?;
		pm.transfer_bool("layer main", &mut self.main)
	}
}

impl Persist for EntityData {
	fn persist(&mut self, pm: &mut Persistor) -> Result<(), PersistError> {
		pm.transfer_id_opt("entity sprite", &mut self.sprite)?;

		let mut has_walk_to = self.walk_to.is_some();
		pm.transfer_bool("walk-to flag", &mut has_walk_to)?;

		if has_walk_to {
			let mut point = self.walk_to.unwrap_or_default();
			pm.transfer_point("walk-to", &mut point)?;
			self.walk_to = Some(point);
		} else {
			self.walk_to = None;
		}

		Ok(())
	}
}

impl Persist for ActorData {
	fn persist(&mut self, pm: &mut Persistor) -> Result<(), PersistError> {
		pm.transfer_u8("actor dir", &mut self.dir)?;
		pm.transfer_string("actor action", &mut self.action)?;
		pm.transfer_f64("actor speed", &mut self.speed)?;
		pm.transfer_f64("actor fx", &mut self.fpos.0)?;
		pm.transfer_f64("actor fy", &mut self.fpos.1)?;

		// Sprite set, key-sorted for determinism.
		let mut count = self.sprites.len() as u32;
		pm.transfer_u32("actor sprites", &mut count)?;

		if pm.is_saving() {
			let mut keys: Vec<String> = self.sprites.keys().cloned().collect();
			keys.sort();

			for key in keys {
				let mut k = key.clone();
				pm.transfer_string("sprite key", &mut k)?;
				let mut id = self.sprites[&key];
				pm.transfer_id("sprite id", &mut id)?;
			}
		} else {
			self.sprites.clear();

			for _ in 0..count {
				let mut key = String::new();
				pm.transfer_string("sprite key", &mut key)?;
				let mut id = ObjectId::new(0);
				pm.transfer_id("sprite id", &mut id)?;
				self.sprites.insert(key, id);
			}
		}

		let mut walking = self.walk.is_some();
		pm.transfer_bool("walk flag", &mut walking)?;

		if walking {
			let mut target = self.walk.map(|w| w.target).unwrap_or_default();
			pm.transfer_point("walk target", &mut target)?;
			self.walk = Some(WalkState { target });
		} else {
			self.walk = None;
		}

		let mut talking = self.speech.is_some();
		pm.transfer_bool("speech flag", &mut talking)?;

		if talking {
			let (mut text, mut remaining) = match &self.speech {
				Some(s) => (s.text.clone(), s.remaining_ms),
				None => (String::new(), 0),
			};

			pm.transfer_string("speech text", &mut text)?;
			pm.transfer_u64("speech remaining", &mut remaining)?;

			self.speech = Some(SpeechState {
				text,
				remaining_ms: remaining,
			});
		} else {
			self.speech = None;
		}

		Ok(())
	}
}

impl Persist for ItemData {
	fn persist(&mut self, pm: &mut Persistor) -> Result<(), PersistError> {
		pm.transfer_string("item description", &mut self.description)?;
		pm.transfer_string("item cursor", &mut self.cursor)
	}
}

impl Persist for WindowData {
	fn persist(&mut self, pm: &mut Persistor) -> Result<(), PersistError> {
		pm.transfer_bool("window modal", &mut self.modal)
	}
}

impl Persist for ButtonData {
	fn persist(&mut self, pm: &mut Persistor) -> Result<(), PersistError> {
		pm.transfer_string("button caption", &mut self.caption)?;
		pm.transfer_string("button event", &mut self.press_event)
	}
}

impl Persist for SpriteData {
	fn persist(&mut self, pm: &mut Persistor) -> Result<(), PersistError> {
		pm.transfer_bool("sprite looping", &mut self.looping)?;
		pm.transfer_bool("sprite playing", &mut self.playing)?;
		pm.transfer_bool("sprite finished", &mut self.finished)?;

		let mut current = self.current as u32;
		pm.transfer_u32("sprite frame", &mut current)?;
		self.current = current as usize;

		pm.transfer_u64("sprite elapsed", &mut self.elapsed_ms)?;

		let mut frames = self.frames.len() as u32;
		pm.transfer_u32("sprite frames", &mut frames)?;

		if pm.is_saving() {
			for frame in &mut self.frames {
				frame.persist(pm)?;
			}
		} else {
			self.frames.clear();

			for _ in 0..frames {
				let mut frame = Frame::default();
				frame.persist(pm)?;
				self.frames.push(frame);
			}

			self.current = self.current.min(self.frames.len().saturating_sub(1));
		}

		Ok(())
	}
}

impl Persist for Frame {
	fn persist(&mut self, pm: &mut Persistor) -> Result<(), PersistError> {
		pm.transfer_u64("frame delay", &mut self.delay_ms)?;

		let mut subframes = self.subframes.len() as u32;
		pm.transfer_u32("subframes", &mut subframes)?;

		if pm.is_saving() {
			for sub in &mut self.subframes {
				pm.transfer_string("subframe image", &mut sub.image)?;
				pm.transfer_point("subframe offset", &mut sub.offset)?;
				pm.transfer_bool("subframe mirror", &mut sub.mirror)?;
			}
		} else {
			self.subframes.clear();

			for _ in 0..subframes {
				let mut sub = Subframe::default();
				pm.transfer_string("subframe image", &mut sub.image)?;
				pm.transfer_point("subframe offset", &mut sub.offset)?;
				pm.transfer_bool("subframe mirror", &mut sub.mirror)?;
				self.subframes.push(sub);
			}
		}

		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::game::Registry;

	fn sample_registry() -> Registry {
		let mut registry = Registry::default();
		let scene = registry.spawn(ObjectKind::Scene(SceneData::default()));
		let layer = registry.spawn_child(scene, ObjectKind::Layer(LayerData::default()));
		let actor = registry.spawn_child(layer, ObjectKind::Actor(ActorData::default()));

		{
			let obj = registry.get_mut(actor).unwrap();
			obj.name = "sally".to_string();
			obj.pos = Point::new(120, 450);
			obj.props
				.insert("mood".to_string(), Value::from("cheerful"));
			obj.props.insert(
				"steps".to_string(),
				Value::Array(vec![Value::Int(1), Value::Int(2)]),
			);

			let ObjectKind::Actor(data) = &mut obj.kind else {
				unreachable!()
			};

			data.start_walk(Point::new(120, 450), Point::new(300, 470));
			data.start_speech("hello there".to_string());
		}

		registry
	}

	fn save_all(registry: &mut Registry) -> Vec<u8> {
		let mut pm = Persistor::saver();
		let ids: Vec<_> = registry.ids().collect();

		let mut count = ids.len() as u32;
		pm.transfer_u32("objects", &mut count).unwrap();

		for id in ids {
			let object = registry.get_mut(id).unwrap();
			let mut raw = object.id;
			pm.transfer_id("object id", &mut raw).unwrap();
			let mut tag = object.kind.tag();
			pm.transfer_u8("object kind", &mut tag).unwrap();
			object.persist(&mut pm).unwrap();
		}

		pm.into_bytes()
	}

	fn load_all(bytes: Vec<u8>) -> Registry {
		let mut pm = Persistor::loader(bytes);
		let mut registry = Registry::default();

		let mut count = 0_u32;
		pm.transfer_u32("objects", &mut count).unwrap();

		for _ in 0..count {
			let mut id = ObjectId::new(0);
			pm.transfer_id("object id", &mut id).unwrap();
			let mut tag = 0_u8;
			pm.transfer_u8("object kind", &mut tag).unwrap();

			let kind = ObjectKind::from_tag(tag).unwrap();
			let mut object = GameObject::new(id, kind);
			object.persist(&mut pm).unwrap();
			registry.adopt(object);
		}

		assert!(pm.exhausted());
		registry
	}

	#[test]
	fn round_trip_is_byte_identical() {
		let mut registry = sample_registry();
		let first = save_all(&mut registry);

		let mut reloaded = load_all(first.clone());
		let second = save_all(&mut reloaded);

		assert_eq!(first, second);
	}

	#[test]
	fn loaded_state_matches() {
		let mut registry = sample_registry();
		let bytes = save_all(&mut registry);
		let reloaded = load_all(bytes);

		assert_eq!(reloaded.len(), registry.len());

		let sally_src = registry
			.iter()
			.find(|o| o.name == "sally")
			.expect("sally saved");

		let sally = reloaded
			.iter()
			.find(|o| o.name == "sally")
			.expect("sally loaded");

		assert_eq!(sally.id, sally_src.id);
		assert_eq!(sally.pos, sally_src.pos);
		assert_eq!(sally.parent, sally_src.parent);

		assert!(sally.props["mood"].loose_eq(&Value::from("cheerful")));

		let ObjectKind::Actor(data) = &sally.kind else {
			panic!("kind survived");
		};

		assert!(data.walk.is_some());
		assert!(data.speech.is_some());
		assert_eq!(data.action, "talk");
	}

	#[test]
	fn headers_gate_versions() {
		let header = SaveHeader {
			game_version: 7,
			name: "quick save".to_string(),
			description: "before the bridge".to_string(),
			timestamp: 1_700_000_000,
			thumbnail: vec![1, 2, 3],
		};

		let mut bytes = vec![];
		header.write(&mut bytes);

		let (parsed, body) = SaveHeader::read(&bytes).unwrap();
		assert_eq!(parsed.name, "quick save");
		assert_eq!(parsed.thumbnail, vec![1, 2, 3]);
		assert_eq!(body, bytes.len());

		let mut newer = bytes.clone();
		newer[4..8].copy_from_slice(&(SAVE_VERSION + 1).to_le_bytes());
		assert!(matches!(
			SaveHeader::read(&newer),
			Err(PersistError::VersionTooNew(_))
		));

		let mut older = bytes.clone();
		older[4..8].copy_from_slice(&(SAVE_VERSION - 1).to_le_bytes());
		assert!(matches!(
			SaveHeader::read(&older),
			Err(PersistError::VersionTooOld(_))
		));

		let mut garbage = bytes;
		garbage[0] = 0;
		assert!(matches!(
			SaveHeader::read(&garbage),
			Err(PersistError::Corrupt("magic"))
		));
	}

	#[test]
	fn truncated_bodies_are_corrupt() {
		let mut registry = sample_registry();
		let bytes = save_all(&mut registry);

		let truncated = bytes[..bytes.len() / 2].to_vec();
		let mut pm = Persistor::loader(truncated);

		let mut count = 0_u32;
		pm.transfer_u32("objects", &mut count).unwrap();

		let mut failed = false;

		for _ in 0..count {
			let mut id = ObjectId::new(0);

			if pm.transfer_id("object id", &mut id).is_err() {
				failed = true;
				break;
			}

			let mut tag = 0_u8;

			if pm.transfer_u8("object kind", &mut tag).is_err() {
				failed = true;
				break;
			}

			let Some(kind) = ObjectKind::from_tag(tag) else {
				failed = true;
				break;
			};

			let mut object = GameObject::new(id, kind);

			if object.persist(&mut pm).is_err() {
				failed = true;
				break;
			}
		}

		assert!(failed, "a half save must not load cleanly");
	}
}
