//! The executable form of a compiled script: a code array plus its
//! symbol, function, method, event, and external tables.

use std::io::{Cursor, Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashMap;

pub const IMAGE_MAGIC: u32 = 0xDEC0_ADDE;
/// The format this crate writes.
pub const IMAGE_VERSION: u32 = 0x0102;
/// Older images back to here load with defaulted missing tables.
pub const IMAGE_VERSION_MIN: u32 = 0x0100;

const NO_ENTRY: u32 = u32::MAX;

/// A name/offset pair from the functions, methods, or events table.
#[derive(Debug, Clone)]
pub struct FnEntry {
	pub name: String,
	pub offset: u32,
	pub params: u8,
}

/// One `external "lib" name(...)` declaration.
#[derive(Debug, Clone)]
pub struct ExternalEntry {
	pub lib: String,
	pub name: String,
	pub params: u8,
}

/// Immutable once constructed. Instances share one image behind an `Arc`;
/// all mutable execution state lives in the instance.
#[derive(Debug)]
pub struct ScriptImage {
	/// Source path, for diagnostics.
	pub path: String,
	pub code: Vec<u8>,
	pub symbols: Vec<String>,
	pub functions: Vec<FnEntry>,
	pub methods: Vec<FnEntry>,
	pub events: Vec<FnEntry>,
	pub externals: Vec<ExternalEntry>,
	/// (code offset, source line), ascending by offset.
	pub lines: Vec<(u32, u32)>,
	/// Offset of the implicit top-level entry function, if the script has
	/// any top-level statements.
	pub entry: Option<u32>,

	fn_names: FxHashMap<String, usize>,
	method_names: FxHashMap<String, usize>,
	event_names: FxHashMap<String, usize>,
}

impl ScriptImage {
	/// Builds the case-insensitive lookup tables. Call after filling the
	/// public fields.
	#[must_use]
	pub fn finish(mut self) -> Self {
		self.fn_names = name_map(&self.functions);
		self.method_names = name_map(&self.methods);
		self.event_names = name_map(&self.events);
		self
	}

	#[must_use]
	pub fn empty(path: impl Into<String>) -> Self {
		Self {
			path: path.into(),
			code: vec![],
			symbols: vec![],
			functions: vec![],
			methods: vec![],
			events: vec![],
			externals: vec![],
			lines: vec![],
			entry: None,
			fn_names: FxHashMap::default(),
			method_names: FxHashMap::default(),
			event_names: FxHashMap::default(),
		}
	}

	#[must_use]
	pub fn symbol(&self, index: u32) -> Option<&str> {
		self.symbols.get(index as usize).map(String::as_str)
	}

	#[must_use]
	pub fn function(&self, name: &str) -> Option<&FnEntry> {
		self.fn_names
			.get(&name.to_ascii_lowercase())
			.map(|&i| &self.functions[i])
	}

	#[must_use]
	pub fn method(&self, name: &str) -> Option<&FnEntry> {
		self.method_names
			.get(&name.to_ascii_lowercase())
			.map(|&i| &self.methods[i])
	}

	#[must_use]
	pub fn event(&self, name: &str) -> Option<&FnEntry> {
		self.event_names
			.get(&name.to_ascii_lowercase())
			.map(|&i| &self.events[i])
	}

	/// Source line for a code offset, from the line table's floor entry.
	#[must_use]
	pub fn line_for(&self, offset: usize) -> Option<u32> {
		let offset = offset as u32;

		match self.lines.binary_search_by_key(&offset, |&(o, _)| o) {
			Ok(i) => Some(self.lines[i].1),
			Err(0) => None,
			Err(i) => Some(self.lines[i - 1].1),
		}
	}

	// Serialization ///////////////////////////////////////////////////////////

	/// Writes the binary image this crate's loader (and older loaders, for
	/// the table layout they know) can read back.
	#[must_use]
	pub fn save(&self) -> Vec<u8> {
		let mut out = Vec::new();

		out.write_u32::<LittleEndian>(IMAGE_MAGIC).unwrap();
		out.write_u32::<LittleEndian>(IMAGE_VERSION).unwrap();

		// Seven table offsets, patched once the tables land.
		let offsets_at = out.len();

		for _ in 0..7 {
			out.write_u32::<LittleEndian>(0).unwrap();
		}

		out.write_u32::<LittleEndian>(self.entry.unwrap_or(NO_ENTRY))
			.unwrap();
		write_str(&mut out, &self.path);

		let mut offsets = [0_u32; 7];

		offsets[0] = out.len() as u32;
		out.write_u32::<LittleEndian>(self.code.len() as u32).unwrap();
		out.extend_from_slice(&self.code);

		offsets[1] = out.len() as u32;
		write_fn_table(&mut out, &self.functions);

		offsets[2] = out.len() as u32;
		out.write_u32::<LittleEndian>(self.symbols.len() as u32)
			.unwrap();

		for sym in &self.symbols {
			write_str(&mut out, sym);
		}

		offsets[3] = out.len() as u32;
		write_fn_table(&mut out, &self.events);

		offsets[4] = out.len() as u32;
		out.write_u32::<LittleEndian>(self.externals.len() as u32)
			.unwrap();

		for ext in &self.externals {
			write_str(&mut out, &ext.lib);
			write_str(&mut out, &ext.name);
			out.push(ext.params);
		}

		offsets[5] = out.len() as u32;
		write_fn_table(&mut out, &self.methods);

		offsets[6] = out.len() as u32;
		out.write_u32::<LittleEndian>(self.lines.len() as u32).unwrap();

		for &(offset, line) in &self.lines {
			out.write_u32::<LittleEndian>(offset).unwrap();
			out.write_u32::<LittleEndian>(line).unwrap();
		}

		for (i, offset) in offsets.into_iter().enumerate() {
			let at = offsets_at + i * 4;
			out[at..at + 4].copy_from_slice(&offset.to_le_bytes());
		}

		out
	}

	/// Parses a binary image. A table offset of zero means the table is
	/// absent (older formats), which loads as empty.
	pub fn load(bytes: &[u8]) -> Result<Self, ImageError> {
		let mut cur = Cursor::new(bytes);

		let magic = cur.read_u32::<LittleEndian>().map_err(|_| ImageError::Truncated)?;

		if magic != IMAGE_MAGIC {
			return Err(ImageError::Magic { found: magic });
		}

		let version = cur.read_u32::<LittleEndian>().map_err(|_| ImageError::Truncated)?;

		if version > IMAGE_VERSION || version < IMAGE_VERSION_MIN {
			return Err(ImageError::Version { found: version });
		}

		let mut offsets = [0_u32; 7];

		for slot in &mut offsets {
			*slot = cur.read_u32::<LittleEndian>().map_err(|_| ImageError::Truncated)?;
		}

		let entry_raw = cur.read_u32::<LittleEndian>().map_err(|_| ImageError::Truncated)?;
		let path = read_str(&mut cur)?;

		let code = if offsets[0] != 0 {
			seek_to(&mut cur, offsets[0])?;
			let len = cur.read_u32::<LittleEndian>().map_err(|_| ImageError::Truncated)? as usize;
			let mut code = vec![0_u8; len];
			cur.read_exact(&mut code).map_err(|_| ImageError::Truncated)?;
			code
		} else {
			vec![]
		};

		let functions = read_fn_table(&mut cur, offsets[1])?;

		let symbols = if offsets[2] != 0 {
			seek_to(&mut cur, offsets[2])?;
			let count = cur.read_u32::<LittleEndian>().map_err(|_| ImageError::Truncated)?;
			let mut symbols = Vec::with_capacity(count as usize);

			for _ in 0..count {
				symbols.push(read_str(&mut cur)?);
			}

			symbols
		} else {
			vec![]
		};

		let events = read_fn_table(&mut cur, offsets[3])?;

		let externals = if offsets[4] != 0 {
			seek_to(&mut cur, offsets[4])?;
			let count = cur.read_u32::<LittleEndian>().map_err(|_| ImageError::Truncated)?;
			let mut externals = Vec::with_capacity(count as usize);

			for _ in 0..count {
				let lib = read_str(&mut cur)?;
				let name = read_str(&mut cur)?;
				let params = cur.read_u8().map_err(|_| ImageError::Truncated)?;

				externals.push(ExternalEntry { lib, name, params });
			}

			externals
		} else {
			vec![]
		};

		let methods = read_fn_table(&mut cur, offsets[5])?;

		let lines = if offsets[6] != 0 {
			seek_to(&mut cur, offsets[6])?;
			let count = cur.read_u32::<LittleEndian>().map_err(|_| ImageError::Truncated)?;
			let mut lines = Vec::with_capacity(count as usize);

			for _ in 0..count {
				let offset = cur.read_u32::<LittleEndian>().map_err(|_| ImageError::Truncated)?;
				let line = cur.read_u32::<LittleEndian>().map_err(|_| ImageError::Truncated)?;
				lines.push((offset, line));
			}

			lines
		} else {
			vec![]
		};

		let image = Self {
			path,
			code,
			symbols,
			functions,
			methods,
			events,
			externals,
			lines,
			entry: (entry_raw != NO_ENTRY).then_some(entry_raw),
			fn_names: FxHashMap::default(),
			method_names: FxHashMap::default(),
			event_names: FxHashMap::default(),
		};

		Ok(image.finish())
	}
}

fn name_map(entries: &[FnEntry]) -> FxHashMap<String, usize> {
	entries
		.iter()
		.enumerate()
		.map(|(i, e)| (e.name.to_ascii_lowercase(), i))
		.collect()
}

fn write_str(out: &mut Vec<u8>, s: &str) {
	out.write_u32::<LittleEndian>(s.len() as u32).unwrap();
	out.extend_from_slice(s.as_bytes());
}

fn write_fn_table(out: &mut Vec<u8>, entries: &[FnEntry]) {
	out.write_u32::<LittleEndian>(entries.len() as u32).unwrap();

	for entry in entries {
		write_str(out, &entry.name);
		out.write_u32::<LittleEndian>(entry.offset).unwrap();
		out.push(entry.params);
	}
}

fn read_str(cur: &mut Cursor<&[u8]>) -> Result<String, ImageError> {
	let len = cur.read_u32::<LittleEndian>().map_err(|_| ImageError::Truncated)? as usize;

	if len > cur.get_ref().len() {
		return Err(ImageError::Truncated);
	}

	let mut buf = vec![0_u8; len];
	cur.read_exact(&mut buf).map_err(|_| ImageError::Truncated)?;
	String::from_utf8(buf).map_err(|_| ImageError::BadString)
}

fn read_fn_table(cur: &mut Cursor<&[u8]>, offset: u32) -> Result<Vec<FnEntry>, ImageError> {
	if offset == 0 {
		return Ok(vec![]);
	}

	seek_to(cur, offset)?;

	let count = cur.read_u32::<LittleEndian>().map_err(|_| ImageError::Truncated)?;
	let mut entries = Vec::with_capacity(count as usize);

	for _ in 0..count {
		let name = read_str(cur)?;
		let offset = cur.read_u32::<LittleEndian>().map_err(|_| ImageError::Truncated)?;
		let params = cur.read_u8().map_err(|_| ImageError::Truncated)?;

		entries.push(FnEntry {
			name,
			offset,
			params,
		});
	}

	Ok(entries)
}

fn seek_to(cur: &mut Cursor<&[u8]>, offset: u32) -> Result<(), ImageError> {
	if offset as usize > cur.get_ref().len() {
		return Err(ImageError::Truncated);
	}

	cur.seek(SeekFrom::Start(u64::from(offset)))
		.map_err(|_| ImageError::Truncated)?;

	Ok(())
}

#[derive(Debug)]
pub enum ImageError {
	Magic { found: u32 },
	Version { found: u32 },
	Truncated,
	BadString,
}

impl std::error::Error for ImageError {}

impl std::fmt::Display for ImageError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Magic { found } => {
				write!(f, "not a compiled script (magic {found:#010X})")
			}
			Self::Version { found } => write!(
				f,
				"script image version {found:#06X} is outside the supported range \
				 {IMAGE_VERSION_MIN:#06X}..={IMAGE_VERSION:#06X}"
			),
			Self::Truncated => write!(f, "script image ends mid-structure"),
			Self::BadString => write!(f, "script image contains non-UTF-8 text"),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn sample() -> ScriptImage {
		let mut image = ScriptImage::empty("demo/init.script");
		image.code = vec![0, 1, 2, 3, 4, 5];
		image.symbols = vec!["print".to_string(), "hello".to_string()];

		image.functions.push(FnEntry {
			name: "Touch".to_string(),
			offset: 2,
			params: 1,
		});

		image.events.push(FnEntry {
			name: "LeftClick".to_string(),
			offset: 4,
			params: 0,
		});

		image.externals.push(ExternalEntry {
			lib: "game".to_string(),
			name: "Print".to_string(),
			params: 1,
		});

		image.lines = vec![(0, 1), (2, 3), (4, 7)];
		image.entry = Some(0);
		image.finish()
	}

	#[test]
	fn save_load_round_trip() {
		let image = sample();
		let bytes = image.save();
		let loaded = ScriptImage::load(&bytes).unwrap();

		assert_eq!(loaded.path, image.path);
		assert_eq!(loaded.code, image.code);
		assert_eq!(loaded.symbols, image.symbols);
		assert_eq!(loaded.entry, Some(0));
		assert_eq!(loaded.functions.len(), 1);
		assert_eq!(loaded.externals.len(), 1);
		assert_eq!(loaded.externals[0].name, "Print");

		// Case-insensitive lookups survive the round trip.
		assert!(loaded.function("touch").is_some());
		assert!(loaded.function("TOUCH").is_some());
		assert!(loaded.event("leftclick").is_some());
		assert!(loaded.method("touch").is_none());
	}

	#[test]
	fn line_table_floor_lookup() {
		let image = sample();
		assert_eq!(image.line_for(0), Some(1));
		assert_eq!(image.line_for(1), Some(1));
		assert_eq!(image.line_for(2), Some(3));
		assert_eq!(image.line_for(3), Some(3));
		assert_eq!(image.line_for(5), Some(7));
	}

	#[test]
	fn version_gate() {
		let mut bytes = sample().save();

		bytes[4..8].copy_from_slice(&0x0103_u32.to_le_bytes());
		assert!(matches!(
			ScriptImage::load(&bytes),
			Err(ImageError::Version { found: 0x0103 })
		));

		bytes[4..8].copy_from_slice(&0x00FF_u32.to_le_bytes());
		assert!(matches!(
			ScriptImage::load(&bytes),
			Err(ImageError::Version { found: 0x00FF })
		));

		bytes[0..4].copy_from_slice(&0xDEAD_BEEF_u32.to_le_bytes());
		assert!(matches!(
			ScriptImage::load(&bytes),
			Err(ImageError::Magic { .. })
		));
	}
}
