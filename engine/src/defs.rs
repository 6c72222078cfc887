//! Parser for the textual definition format describing scenes, sprites,
//! windows, and the project itself.
//!
//! The grammar is a nesting key-value-block scheme:
//!
//! ```text
//! SCENE {
//!     NAME = "town"
//!     LAYER {
//!         WIDTH = 1024; HEIGHT = 768
//!         ENTITY { NAME = "door"; X = 100, Y = 200 }
//!     }
//! }
//! ```
//!
//! Consumers walk the returned block tree; unknown keys are their problem
//! to warn about (and tolerate), which keeps old engines forward-compatible
//! with new game data.

use std::fmt;

/// One parsed value on the right of a `KEY =`.
#[derive(Debug, Clone, PartialEq)]
pub enum DefValue {
	Int(i64),
	Float(f64),
	Str(String),
	/// A bare word such as `TRUE` or a resource alias.
	Ident(String),
	/// `KEY = 100, 200` parses into a tuple.
	Tuple(Vec<DefValue>),
}

impl DefValue {
	#[must_use]
	pub fn as_int(&self) -> Option<i64> {
		match self {
			Self::Int(i) => Some(*i),
			Self::Float(f) => Some(*f as i64),
			_ => None,
		}
	}

	#[must_use]
	pub fn as_float(&self) -> Option<f64> {
		match self {
			Self::Int(i) => Some(*i as f64),
			Self::Float(f) => Some(*f),
			_ => None,
		}
	}

	#[must_use]
	pub fn as_str(&self) -> Option<&str> {
		match self {
			Self::Str(s) | Self::Ident(s) => Some(s),
			_ => None,
		}
	}

	/// `TRUE`/`FALSE` idents and nonzero integers.
	#[must_use]
	pub fn as_bool(&self) -> Option<bool> {
		match self {
			Self::Int(i) => Some(*i != 0),
			Self::Ident(s) => {
				if s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("yes") {
					Some(true)
				} else if s.eq_ignore_ascii_case("false") || s.eq_ignore_ascii_case("no") {
					Some(false)
				} else {
					None
				}
			}
			_ => None,
		}
	}

	/// `X = 100, 200` or a single int; used for points and sizes.
	#[must_use]
	pub fn as_pair(&self) -> Option<(i64, i64)> {
		match self {
			Self::Tuple(items) if items.len() == 2 => {
				Some((items[0].as_int()?, items[1].as_int()?))
			}
			_ => None,
		}
	}
}

#[derive(Debug, Default)]
pub struct DefBlock {
	pub name: String,
	pub line: u32,
	pub entries: Vec<(String, DefValue)>,
	pub children: Vec<DefBlock>,
}

impl DefBlock {
	#[must_use]
	pub fn is(&self, name: &str) -> bool {
		self.name.eq_ignore_ascii_case(name)
	}

	/// First value under `key`, case-insensitive.
	#[must_use]
	pub fn get(&self, key: &str) -> Option<&DefValue> {
		self.entries
			.iter()
			.find(|(k, _)| k.eq_ignore_ascii_case(key))
			.map(|(_, v)| v)
	}

	/// Every value under `key`, in declaration order (`POINT = ...` lines
	/// repeat).
	pub fn get_all<'b>(&'b self, key: &'b str) -> impl Iterator<Item = &'b DefValue> {
		self.entries
			.iter()
			.filter(move |(k, _)| k.eq_ignore_ascii_case(key))
			.map(|(_, v)| v)
	}

	#[must_use]
	pub fn get_str(&self, key: &str) -> Option<&str> {
		self.get(key).and_then(DefValue::as_str)
	}

	#[must_use]
	pub fn get_int(&self, key: &str) -> Option<i64> {
		self.get(key).and_then(DefValue::as_int)
	}

	#[must_use]
	pub fn get_float(&self, key: &str) -> Option<f64> {
		self.get(key).and_then(DefValue::as_float)
	}

	#[must_use]
	pub fn get_bool(&self, key: &str) -> Option<bool> {
		self.get(key).and_then(DefValue::as_bool)
	}

	#[must_use]
	pub fn child(&self, name: &str) -> Option<&DefBlock> {
		self.children.iter().find(|c| c.is(name))
	}

	pub fn children_named<'b>(&'b self, name: &'b str) -> impl Iterator<Item = &'b DefBlock> {
		self.children.iter().filter(move |c| c.is(name))
	}

	/// Logs one warning per key outside `known`; forward-compatibility
	/// over strictness.
	pub fn warn_unknown_keys(&self, path: &str, known: &[&str]) {
		for (key, _) in &self.entries {
			if !known.iter().any(|k| k.eq_ignore_ascii_case(key)) {
				log::warn!(
					"`{path}` line {}: unknown key `{key}` in block `{}`; ignored.",
					self.line,
					self.name,
				);
			}
		}
	}
}

/// Parses a whole definition file into its top-level blocks.
pub fn parse(source: &str, path: &str) -> Result<Vec<DefBlock>, DefError> {
	let mut scanner = Scanner::new(source, path);
	let mut blocks = vec![];

	loop {
		scanner.skip_trivia();

		if scanner.at_end() {
			return Ok(blocks);
		}

		let name = scanner.ident()?;
		scanner.skip_trivia();
		scanner.expect('{')?;
		blocks.push(scanner.block(name)?);
	}
}

struct Scanner<'src> {
	src: &'src [u8],
	pos: usize,
	line: u32,
	path: &'src str,
}

impl<'src> Scanner<'src> {
	fn new(source: &'src str, path: &'src str) -> Self {
		Self {
			src: source.as_bytes(),
			pos: 0,
			line: 1,
			path,
		}
	}

	fn at_end(&self) -> bool {
		self.pos >= self.src.len()
	}

	fn peek(&self) -> Option<u8> {
		self.src.get(self.pos).copied()
	}

	fn bump(&mut self) -> Option<u8> {
		let b = self.peek()?;
		self.pos += 1;

		if b == b'\n' {
			self.line += 1;
		}

		Some(b)
	}

	fn skip_trivia(&mut self) {
		loop {
			match self.peek() {
				Some(b) if b.is_ascii_whitespace() => {
					self.bump();
				}
				Some(b'/') if self.src.get(self.pos + 1) == Some(&b'/') => {
					while let Some(b) = self.peek() {
						if b == b'\n' {
							break;
						}

						self.bump();
					}
				}
				Some(b'/') if self.src.get(self.pos + 1) == Some(&b'*') => {
					self.bump();
					self.bump();

					loop {
						match self.bump() {
							Some(b'*') if self.peek() == Some(b'/') => {
								self.bump();
								break;
							}
							Some(_) => {}
							None => break,
						}
					}
				}
				_ => break,
			}
		}
	}

	fn error(&self, message: impl Into<String>) -> DefError {
		DefError {
			path: self.path.to_string(),
			line: self.line,
			message: message.into(),
		}
	}

	fn expect(&mut self, want: char) -> Result<(), DefError> {
		if self.peek() == Some(want as u8) {
			self.bump();
			Ok(())
		} else {
			Err(self.error(format!("expected `{want}`")))
		}
	}

	fn ident(&mut self) -> Result<String, DefError> {
		let start = self.pos;

		while let Some(b) = self.peek() {
			if b.is_ascii_alphanumeric() || b == b'_' {
				self.pos += 1;
			} else {
				break;
			}
		}

		if start == self.pos {
			return Err(self.error("expected an identifier"));
		}

		Ok(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
	}

	/// Parses the inside of a block; the opening brace is already consumed.
	fn block(&mut self, name: String) -> Result<DefBlock, DefError> {
		let mut block = DefBlock {
			name,
			line: self.line,
			entries: vec![],
			children: vec![],
		};

		loop {
			self.skip_trivia();

			match self.peek() {
				None => return Err(self.error(format!("unterminated block `{}`", block.name))),
				Some(b'}') => {
					self.bump();
					return Ok(block);
				}
				Some(b';') => {
					self.bump();
				}
				_ => {
					let key = self.ident()?;
					self.skip_trivia();

					match self.peek() {
						Some(b'=') => {
							self.bump();
							let value = self.value_list()?;
							block.entries.push((key, value));
						}
						Some(b'{') => {
							self.bump();
							block.children.push(self.block(key)?);
						}
						_ => {
							return Err(self.error(format!("expected `=` or `{{` after `{key}`")))
						}
					}
				}
			}
		}
	}

	/// One value, or a comma-separated tuple of them.
	fn value_list(&mut self) -> Result<DefValue, DefError> {
		let mut values = vec![self.value()?];

		loop {
			self.skip_trivia();

			if self.peek() == Some(b',') {
				self.bump();
				values.push(self.value()?);
			} else {
				break;
			}
		}

		if values.len() == 1 {
			Ok(values.pop().unwrap())
		} else {
			Ok(DefValue::Tuple(values))
		}
	}

	fn value(&mut self) -> Result<DefValue, DefError> {
		self.skip_trivia();

		match self.peek() {
			Some(b'"') => {
				self.bump();
				let mut raw = Vec::new();

				loop {
					match self.bump() {
						Some(b'"') => break,
						Some(b'\\') => match self.bump() {
							Some(b'"') => raw.push(b'"'),
							Some(b'\\') => raw.push(b'\\'),
							Some(b'n') => raw.push(b'\n'),
							Some(other) => {
								raw.push(b'\\');
								raw.push(other);
							}
							None => return Err(self.error("unterminated string")),
						},
						Some(b) => raw.push(b),
						None => return Err(self.error("unterminated string")),
					}
				}

				Ok(DefValue::Str(String::from_utf8_lossy(&raw).into_owned()))
			}
			Some(b) if b == b'-' || b.is_ascii_digit() => {
				let start = self.pos;
				self.pos += 1;

				let mut float = false;

				while let Some(b) = self.peek() {
					if b.is_ascii_digit() {
						self.pos += 1;
					} else if b == b'.' && !float {
						float = true;
						self.pos += 1;
					} else {
						break;
					}
				}

				let text = std::str::from_utf8(&self.src[start..self.pos])
					.expect("digits and signs are ASCII");

				if float {
					text.parse()
						.map(DefValue::Float)
						.map_err(|_| self.error("malformed number"))
				} else {
					text.parse()
						.map(DefValue::Int)
						.map_err(|_| self.error("malformed number"))
				}
			}
			Some(b) if b.is_ascii_alphabetic() || b == b'_' => Ok(DefValue::Ident(self.ident()?)),
			_ => Err(self.error("expected a value")),
		}
	}
}

#[derive(Debug)]
pub struct DefError {
	pub path: String,
	pub line: u32,
	pub message: String,
}

impl std::error::Error for DefError {}

impl fmt::Display for DefError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}({}): {}", self.path, self.line, self.message)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn scene_shape() {
		const SOURCE: &str = r#"
		// town square
		SCENE {
			NAME = "town"
			SCRIPT = "scenes\town\town.script"

			LAYER {
				NAME = "background"
				WIDTH = 1024; HEIGHT = 768
				MAIN = TRUE

				ENTITY {
					NAME = "door"
					X = 100, 200
					SPRITE = "sprites\door.sprite"
				}
			}

			WAYPOINTS {
				NAME = "main"
				POINT = 100, 600
				POINT = 400, 620
			}

			SCALE_LEVEL { Y = 400; SCALE = 80 }
		}
		"#;

		let blocks = parse(SOURCE, "town.scene").unwrap();
		assert_eq!(blocks.len(), 1);

		let scene = &blocks[0];
		assert!(scene.is("scene"));
		assert!(scene.is("SCENE"));
		assert_eq!(scene.get_str("name"), Some("town"));

		let layer = scene.child("layer").unwrap();
		assert_eq!(layer.get_int("WIDTH"), Some(1024));
		assert_eq!(layer.get_bool("main"), Some(true));

		let entity = layer.child("entity").unwrap();
		assert_eq!(entity.get("x").unwrap().as_pair(), Some((100, 200)));

		let waypoints = scene.child("waypoints").unwrap();
		let points: Vec<_> = waypoints
			.get_all("point")
			.filter_map(DefValue::as_pair)
			.collect();
		assert_eq!(points, vec![(100, 600), (400, 620)]);

		assert_eq!(
			scene.child("scale_level").unwrap().get_int("scale"),
			Some(80)
		);
	}

	#[test]
	fn comments_and_floats() {
		const SOURCE: &str = r#"
		SPRITE {
			/* animation
			   speed */
			SPEED = 1.5
			LOOPING = FALSE  // once only
		}
		"#;

		let blocks = parse(SOURCE, "s.sprite").unwrap();
		assert_eq!(blocks[0].get_float("speed"), Some(1.5));
		assert_eq!(blocks[0].get_bool("looping"), Some(false));
	}

	#[test]
	fn errors_carry_position() {
		let err = parse("SCENE {\n  NAME ?\n}", "broken.scene").unwrap_err();
		assert_eq!(err.line, 2);
		assert!(err.message.contains("expected"));

		let err = parse("SCENE {", "broken.scene").unwrap_err();
		assert!(err.message.contains("unterminated"));
	}

	#[test]
	fn negative_numbers() {
		let blocks = parse("REGION { POINT = -5, 10 }", "r.def").unwrap();
		assert_eq!(blocks[0].get("point").unwrap().as_pair(), Some((-5, 10)));
	}
}
