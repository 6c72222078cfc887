//! Per-kind state and behavior for the object tree.

use rustc_hash::FxHashMap;
use wme_script::{ObjectId, Value};

use super::Point;

/// Facing directions an actor distinguishes (45° steps, 0 = up).
pub const DIRECTION_COUNT: u8 = 8;

/// Default walking speed in pixels per second.
pub const DEFAULT_WALK_SPEED: f64 = 100.0;

/// Milliseconds of speech per character, plus a floor; stands in for the
/// audio collaborator's measured line length.
const SPEECH_MS_PER_CHAR: u64 = 60;
const SPEECH_MIN_MS: u64 = 800;

#[derive(Debug)]
pub enum ObjectKind {
	Game(GameData),
	Scene(SceneData),
	Layer(LayerData),
	Entity(EntityData),
	Actor(ActorData),
	Item(ItemData),
	Window(WindowData),
	Button(ButtonData),
	Sprite(SpriteData),
}

impl ObjectKind {
	#[must_use]
	pub fn class_name(&self) -> &'static str {
		match self {
			Self::Game(_) => "game",
			Self::Scene(_) => "scene",
			Self::Layer(_) => "layer",
			Self::Entity(_) => "entity",
			Self::Actor(_) => "actor",
			Self::Item(_) => "item",
			Self::Window(_) => "window",
			Self::Button(_) => "button",
			Self::Sprite(_) => "sprite",
		}
	}

	/// Stable tag for persistence.
	#[must_use]
	pub fn tag(&self) -> u8 {
		match self {
			Self::Game(_) => 0,
			Self::Scene(_) => 1,
			Self::Layer(_) => 2,
			Self::Entity(_) => 3,
			Self::Actor(_) => 4,
			Self::Item(_) => 5,
			Self::Window(_) => 6,
			Self::Button(_) => 7,
			Self::Sprite(_) => 8,
		}
	}

	/// A default-shaped kind for the loader to fill in.
	#[must_use]
	pub fn from_tag(tag: u8) -> Option<Self> {
		Some(match tag {
			0 => Self::Game(GameData::default()),
			1 => Self::Scene(SceneData::default()),
			2 => Self::Layer(LayerData::default()),
			3 => Self::Entity(EntityData::default()),
			4 => Self::Actor(ActorData::default()),
			5 => Self::Item(ItemData::default()),
			6 => Self::Window(WindowData::default()),
			7 => Self::Button(ButtonData::default()),
			8 => Self::Sprite(SpriteData::default()),
			_ => return None,
		})
	}

	/// Class-specific property reads; `name` arrives lower-cased.
	#[must_use]
	pub fn get(&self, name: &str) -> Option<Value> {
		match self {
			Self::Game(game) => match name {
				"inventorycount" => Some(Value::Int(game.inventory.len() as i64)),
				_ => None,
			},
			Self::Scene(_) => None,
			Self::Layer(layer) => match name {
				"width" => Some(Value::Int(i64::from(layer.width))),
				"height" => Some(Value::Int(i64::from(layer.height))),
				"main" => Some(Value::Bool(layer.main)),
				_ => None,
			},
			Self::Entity(entity) => match name {
				"walktox" => entity.walk_to.map(|p| Value::Int(i64::from(p.x))),
				"walktoy" => entity.walk_to.map(|p| Value::Int(i64::from(p.y))),
				_ => None,
			},
			Self::Actor(actor) => match name {
				"direction" => Some(Value::Int(i64::from(actor.dir))),
				"walkspeed" => Some(Value::Float(actor.speed)),
				"walking" => Some(Value::Bool(actor.walk.is_some())),
				"talking" => Some(Value::Bool(actor.speech.is_some())),
				_ => None,
			},
			Self::Item(item) => match name {
				"description" => Some(Value::from(item.description.clone())),
				"cursor" => Some(Value::from(item.cursor.clone())),
				_ => None,
			},
			Self::Window(window) => match name {
				"modal" => Some(Value::Bool(window.modal)),
				_ => None,
			},
			Self::Button(button) => match name {
				"text" => Some(Value::from(button.caption.clone())),
				"pressevent" => Some(Value::from(button.press_event.clone())),
				_ => None,
			},
			Self::Sprite(sprite) => match name {
				"framecount" => Some(Value::Int(sprite.frames.len() as i64)),
				"currentframe" => Some(Value::Int(sprite.current as i64)),
				"looping" => Some(Value::Bool(sprite.looping)),
				"playing" => Some(Value::Bool(sprite.playing)),
				"finished" => Some(Value::Bool(sprite.finished)),
				_ => None,
			},
		}
	}

	/// Class-specific property writes; returns `false` for names the kind
	/// does not own (the caller's property bag takes those).
	pub fn set(&mut self, name: &str, value: &Value) -> bool {
		match self {
			Self::Layer(layer) => match name {
				"width" => {
					layer.width = value.as_int() as i32;
					true
				}
				"height" => {
					layer.height = value.as_int() as i32;
					true
				}
				_ => false,
			},
			Self::Actor(actor) => match name {
				"direction" => {
					actor.dir = (value.as_int().rem_euclid(i64::from(DIRECTION_COUNT))) as u8;
					true
				}
				"walkspeed" => {
					actor.speed = value.as_float().max(1.0);
					true
				}
				_ => false,
			},
			Self::Item(item) => match name {
				"description" => {
					item.description = value.to_display();
					true
				}
				"cursor" => {
					item.cursor = value.to_display();
					true
				}
				_ => false,
			},
			Self::Window(window) => match name {
				"modal" => {
					window.modal = value.truthy();
					true
				}
				_ => false,
			},
			Self::Button(button) => match name {
				"text" => {
					button.caption = value.to_display();
					true
				}
				"pressevent" => {
					button.press_event = value.to_display();
					true
				}
				_ => false,
			},
			Self::Sprite(sprite) => match name {
				"looping" => {
					sprite.looping = value.truthy();
					true
				}
				"currentframe" => {
					let frame = value.as_int().max(0) as usize;
					sprite.current = frame.min(sprite.frames.len().saturating_sub(1));
					sprite.elapsed_ms = 0;
					true
				}
				_ => false,
			},
			_ => false,
		}
	}
}

// Game ////////////////////////////////////////////////////////////////////////

#[derive(Debug, Default)]
pub struct GameData {
	/// Item object ids the player carries.
	pub inventory: Vec<ObjectId>,
	pub startup_scene: String,
}

// Scene ///////////////////////////////////////////////////////////////////////

#[derive(Debug, Default)]
pub struct SceneData {
	pub source_path: String,
	pub waypoint_groups: Vec<WaypointGroup>,
	pub regions: Vec<Region>,
	pub scale_levels: Vec<ScaleLevel>,
}

impl SceneData {
	/// Actor scale at a given scene Y, interpolated between the two
	/// nearest scale levels.
	#[must_use]
	pub fn scale_at(&self, y: i32) -> f64 {
		if self.scale_levels.is_empty() {
			return 1.0;
		}

		let mut below: Option<&ScaleLevel> = None;
		let mut above: Option<&ScaleLevel> = None;

		for level in &self.scale_levels {
			if level.y <= y && below.map_or(true, |b| level.y > b.y) {
				below = Some(level);
			}

			if level.y > y && above.map_or(true, |a| level.y < a.y) {
				above = Some(level);
			}
		}

		match (below, above) {
			(Some(b), Some(a)) => {
				let span = f64::from(a.y - b.y);
				let t = f64::from(y - b.y) / span;
				(b.scale + (a.scale - b.scale) * t) / 100.0
			}
			(Some(b), None) => b.scale / 100.0,
			(None, Some(a)) => a.scale / 100.0,
			(None, None) => 1.0,
		}
	}

	/// Topmost active region containing the point, if any.
	#[must_use]
	pub fn region_at(&self, p: Point) -> Option<&Region> {
		self.regions
			.iter()
			.rev()
			.find(|r| r.active && r.contains(p))
	}
}

#[derive(Debug, Default)]
pub struct WaypointGroup {
	pub name: String,
	pub points: Vec<Point>,
}

#[derive(Debug, Default)]
pub struct Region {
	pub name: String,
	pub points: Vec<Point>,
	pub active: bool,
}

impl Region {
	/// Even-odd polygon containment.
	#[must_use]
	pub fn contains(&self, p: Point) -> bool {
		let mut inside = false;
		let n = self.points.len();

		if n < 3 {
			return false;
		}

		let mut j = n - 1;

		for i in 0..n {
			let a = self.points[i];
			let b = self.points[j];

			if (a.y > p.y) != (b.y > p.y) {
				let x = f64::from(b.x - a.x) * f64::from(p.y - a.y) / f64::from(b.y - a.y)
					+ f64::from(a.x);

				if f64::from(p.x) < x {
					inside = !inside;
				}
			}

			j = i;
		}

		inside
	}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ScaleLevel {
	pub y: i32,
	/// Percentage at that Y; 100 is unscaled.
	pub scale: f64,
}

// Layer ///////////////////////////////////////////////////////////////////////

#[derive(Debug, Default)]
pub struct LayerData {
	pub width: i32,
	pub height: i32,
	pub main: bool,
}

// Entity //////////////////////////////////////////////////////////////////////

#[derive(Debug, Default)]
pub struct EntityData {
	pub sprite: Option<ObjectId>,
	/// Where an actor stands to interact with this entity.
	pub walk_to: Option<Point>,
}

// Actor ///////////////////////////////////////////////////////////////////////

#[derive(Debug)]
pub struct ActorData {
	/// Facing, in 45° steps.
	pub dir: u8,
	/// Current animation action ("idle", "walk", "talk").
	pub action: String,
	/// Sprite object per "action_direction" key.
	pub sprites: FxHashMap<String, ObjectId>,
	/// Pixels per second.
	pub speed: f64,
	pub walk: Option<WalkState>,
	pub speech: Option<SpeechState>,
	/// Sub-pixel position; the object's integer position rounds this.
	pub fpos: (f64, f64),
}

impl Default for ActorData {
	fn default() -> Self {
		Self {
			dir: 2,
			action: "idle".to_string(),
			sprites: FxHashMap::default(),
			speed: DEFAULT_WALK_SPEED,
			walk: None,
			speech: None,
			fpos: (0.0, 0.0),
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct WalkState {
	pub target: Point,
}

#[derive(Debug, Clone)]
pub struct SpeechState {
	pub text: String,
	pub remaining_ms: u64,
}

impl SpeechState {
	#[must_use]
	pub fn for_line(text: String) -> Self {
		let remaining_ms = SPEECH_MIN_MS.max(text.chars().count() as u64 * SPEECH_MS_PER_CHAR);
		Self { text, remaining_ms }
	}
}

impl ActorData {
	pub fn start_walk(&mut self, from: Point, target: Point) {
		self.fpos = (f64::from(from.x), f64::from(from.y));
		self.walk = Some(WalkState { target });
		self.action = "walk".to_string();

		let dx = f64::from(target.x - from.x);
		let dy = f64::from(target.y - from.y);
		self.dir = direction_of(dx, dy);
	}

	pub fn start_speech(&mut self, text: String) {
		self.speech = Some(SpeechState::for_line(text));
		self.action = "talk".to_string();
	}

	/// Advances walking and speech. Returns `true` when a blocking
	/// activity completed this frame.
	pub fn update(&mut self, dt_ms: u64, pos: &mut Point) -> bool {
		let mut completed = false;

		if let Some(walk) = self.walk {
			let (mut fx, mut fy) = self.fpos;
			let dx = f64::from(walk.target.x) - fx;
			let dy = f64::from(walk.target.y) - fy;
			let dist = (dx * dx + dy * dy).sqrt();
			let step = self.speed * (dt_ms as f64) / 1000.0;

			if dist <= step || dist == 0.0 {
				*pos = walk.target;
				self.fpos = (f64::from(walk.target.x), f64::from(walk.target.y));
				self.walk = None;
				self.action = "idle".to_string();
				completed = true;
			} else {
				fx += dx / dist * step;
				fy += dy / dist * step;
				self.fpos = (fx, fy);
				*pos = Point::new(fx.round() as i32, fy.round() as i32);
			}
		}

		if let Some(speech) = &mut self.speech {
			if speech.remaining_ms <= dt_ms {
				self.speech = None;

				if self.walk.is_none() {
					self.action = "idle".to_string();
				}

				completed = true;
			} else {
				speech.remaining_ms -= dt_ms;
			}
		}

		completed
	}
}

/// Maps a movement vector to the nearest of the eight facings.
#[must_use]
fn direction_of(dx: f64, dy: f64) -> u8 {
	if dx == 0.0 && dy == 0.0 {
		return 2;
	}

	// atan2 with Y down; 0 = up, going clockwise.
	let angle = dx.atan2(-dy).to_degrees();
	let eighth = ((angle + 382.5) / 45.0) as u8 % DIRECTION_COUNT;
	eighth
}

// Item ////////////////////////////////////////////////////////////////////////

#[derive(Debug, Default)]
pub struct ItemData {
	pub description: String,
	pub cursor: String,
}

// Window //////////////////////////////////////////////////////////////////////

#[derive(Debug, Default)]
pub struct WindowData {
	pub modal: bool,
}

#[derive(Debug, Default)]
pub struct ButtonData {
	pub caption: String,
	/// Event emitted against the button when pressed.
	pub press_event: String,
}

// Sprite //////////////////////////////////////////////////////////////////////

#[derive(Debug)]
pub struct SpriteData {
	pub frames: Vec<Frame>,
	pub looping: bool,
	pub playing: bool,
	pub finished: bool,
	pub current: usize,
	pub elapsed_ms: u64,
}

impl Default for SpriteData {
	fn default() -> Self {
		Self {
			frames: vec![],
			looping: true,
			playing: true,
			finished: false,
			current: 0,
			elapsed_ms: 0,
		}
	}
}

#[derive(Debug, Default)]
pub struct Frame {
	pub delay_ms: u64,
	pub subframes: Vec<Subframe>,
}

#[derive(Debug, Default)]
pub struct Subframe {
	/// Image path served by the VFS; decoding is the renderer's business.
	pub image: String,
	pub offset: Point,
	pub mirror: bool,
}

impl SpriteData {
	pub fn play(&mut self) {
		self.playing = true;
		self.finished = false;
	}

	pub fn stop(&mut self) {
		self.playing = false;
	}

	pub fn reset(&mut self) {
		self.current = 0;
		self.elapsed_ms = 0;
		self.finished = false;
	}

	/// Advances playback; non-looping sprites hold their last frame and
	/// raise `finished`.
	pub fn update(&mut self, dt_ms: u64) {
		if !self.playing || self.frames.is_empty() {
			return;
		}

		self.elapsed_ms += dt_ms;

		loop {
			let delay = self.frames[self.current].delay_ms.max(1);

			if self.elapsed_ms < delay {
				break;
			}

			self.elapsed_ms -= delay;

			if self.current + 1 < self.frames.len() {
				self.current += 1;
			} else if self.looping {
				self.current = 0;
			} else {
				self.finished = true;
				self.playing = false;
				self.elapsed_ms = 0;
				break;
			}
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn sprite_playback() {
		let mut sprite = SpriteData {
			frames: vec![
				Frame {
					delay_ms: 100,
					subframes: vec![],
				},
				Frame {
					delay_ms: 100,
					subframes: vec![],
				},
			],
			looping: false,
			..SpriteData::default()
		};

		sprite.update(50);
		assert_eq!(sprite.current, 0);

		sprite.update(60);
		assert_eq!(sprite.current, 1);

		sprite.update(150);
		assert!(sprite.finished);
		assert!(!sprite.playing);
		assert_eq!(sprite.current, 1, "non-looping sprites hold the last frame");

		sprite.looping = true;
		sprite.play();
		sprite.update(100);
		assert_eq!(sprite.current, 0, "looping wraps");
	}

	#[test]
	fn actor_walks_and_arrives() {
		let mut actor = ActorData {
			speed: 100.0,
			..ActorData::default()
		};

		let mut pos = Point::new(0, 0);
		actor.start_walk(pos, Point::new(300, 0));
		assert!(actor.walk.is_some());

		// 1 s at 100 px/s.
		assert!(!actor.update(1000, &mut pos));
		assert_eq!(pos, Point::new(100, 0));

		assert!(!actor.update(1000, &mut pos));
		assert_eq!(pos, Point::new(200, 0));

		assert!(actor.update(2000, &mut pos), "arrival completes the walk");
		assert_eq!(pos, Point::new(300, 0));
		assert!(actor.walk.is_none());
		assert_eq!(actor.action, "idle");
	}

	#[test]
	fn directions_from_vectors() {
		assert_eq!(direction_of(0.0, -1.0), 0, "up");
		assert_eq!(direction_of(1.0, -1.0), 1, "up-right");
		assert_eq!(direction_of(1.0, 0.0), 2, "right");
		assert_eq!(direction_of(0.0, 1.0), 4, "down");
		assert_eq!(direction_of(-1.0, 0.0), 6, "left");
	}

	#[test]
	fn speech_duration_scales_with_text() {
		let short = SpeechState::for_line("hi".to_string());
		assert_eq!(short.remaining_ms, 800);

		let long = SpeechState::for_line("a".repeat(100));
		assert_eq!(long.remaining_ms, 6000);
	}

	#[test]
	fn scale_levels_interpolate() {
		let scene = SceneData {
			scale_levels: vec![
				ScaleLevel { y: 0, scale: 50.0 },
				ScaleLevel {
					y: 100,
					scale: 100.0,
				},
			],
			..SceneData::default()
		};

		assert!((scene.scale_at(0) - 0.5).abs() < 1e-9);
		assert!((scene.scale_at(50) - 0.75).abs() < 1e-9);
		assert!((scene.scale_at(100) - 1.0).abs() < 1e-9);
		assert!((scene.scale_at(500) - 1.0).abs() < 1e-9);
	}

	#[test]
	fn region_containment() {
		let region = Region {
			name: "square".to_string(),
			points: vec![
				Point::new(0, 0),
				Point::new(10, 0),
				Point::new(10, 10),
				Point::new(0, 10),
			],
			active: true,
		};

		assert!(region.contains(Point::new(5, 5)));
		assert!(!region.contains(Point::new(15, 5)));
		assert!(!region.contains(Point::new(-1, 5)));
	}
}
