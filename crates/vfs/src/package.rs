//! Reading one package archive: header, directory table, entry payloads.

use std::{
	fs::File,
	io::{BufReader, Read, Seek, SeekFrom},
	path::{Path, PathBuf},
};

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt};
use flate2::read::ZlibDecoder;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::{Error, VPath, VPathBuf};

pub const MAGIC_1: u32 = 0xDEC0_ADDE;
pub const MAGIC_2: u32 = 0x4B4E_554A;

/// The lowest directory layout this reader understands.
pub const VERSION_MIN: u32 = 0x100;
/// Versions from here on carry a second per-entry timestamp.
pub const VERSION_TIMESTAMP2: u32 = 0x200;
/// The highest directory layout this reader understands.
pub const VERSION_MAX: u32 = 0x200;

/// Compressed payloads lead with a four-byte tag holding the uncompressed
/// length; the zlib stream starts after it. Stored payloads carry no tag.
pub const COMPRESSED_TAG_LEN: usize = 4;

bitflags! {
	/// Per-entry flag word. Only the signature bit has assigned meaning;
	/// unknown bits are preserved and ignored.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct EntryFlags: u32 {
		const SIGNATURE = 1;
	}
}

/// One archive contributing entries to the VFS at a fixed priority.
///
/// The directory table is held in memory in full; payloads are read on
/// demand. The backing file handle sits behind a [`Mutex`] so that many
/// callers can hold open streams without contending on its seek position —
/// every read produces a standalone buffer and releases the lock before
/// decompression finishes mattering to anyone else.
#[derive(Debug)]
pub struct Package {
	meta: PackageMeta,
	file: Mutex<File>,
	entries: IndexMap<VPathBuf, Entry>,
}

/// Everything the header declares about a package.
#[derive(Debug, Clone)]
pub struct PackageMeta {
	pub real_path: PathBuf,
	pub version: u32,
	pub game_version: u32,
	pub priority: u8,
	pub cd_number: u8,
	pub master_index: bool,
	pub created: u32,
	pub description: String,
}

/// Directory-table record for one stored file.
#[derive(Debug, Clone, Copy)]
pub struct Entry {
	pub offset: u32,
	/// Uncompressed payload size.
	pub length: u32,
	/// 0 means the payload is stored as-is.
	pub compressed: u32,
	pub flags: EntryFlags,
	pub timestamp: u32,
}

impl Entry {
	/// Stored entries either declare no compressed length at all or declare
	/// one equal to the uncompressed length; the format never deflates a
	/// payload into a buffer of identical size.
	#[must_use]
	pub fn is_stored(&self) -> bool {
		self.compressed == 0 || self.compressed == self.length
	}

	/// How many bytes the payload occupies inside the archive file.
	#[must_use]
	pub fn stored_len(&self) -> u32 {
		if self.is_stored() {
			self.length
		} else {
			self.compressed
		}
	}
}

impl Package {
	/// Opens the archive, validates the header, and reads the whole
	/// directory table into memory. The payloads stay on disk.
	pub fn open(real_path: &Path) -> Result<Self, Error> {
		let file = File::open(real_path).map_err(Error::FileOpen)?;
		let mut reader = BufReader::new(file);

		let meta = Self::read_header(&mut reader, real_path)?;
		let entries = Self::read_directory(&mut reader, meta.version)?;

		let mut file = reader.into_inner();
		file.rewind().map_err(Error::Seek)?;

		log::debug!(
			"Opened package `{}`: {} entries, priority {}.",
			real_path.display(),
			entries.len(),
			meta.priority,
		);

		Ok(Self {
			meta,
			file: Mutex::new(file),
			entries,
		})
	}

	fn read_header(reader: &mut impl Read, real_path: &Path) -> Result<PackageMeta, Error> {
		let magic1 = reader.read_u32::<LittleEndian>().map_err(Error::FileRead)?;
		let magic2 = reader.read_u32::<LittleEndian>().map_err(Error::FileRead)?;

		if magic1 != MAGIC_1 || magic2 != MAGIC_2 {
			return Err(Error::MagicMismatch {
				found: [magic1, magic2],
			});
		}

		let version = reader.read_u32::<LittleEndian>().map_err(Error::FileRead)?;

		if !(VERSION_MIN..=VERSION_MAX).contains(&version) {
			return Err(Error::VersionUnsupported(version));
		}

		let game_version = reader.read_u32::<LittleEndian>().map_err(Error::FileRead)?;
		let priority = reader.read_u8().map_err(Error::FileRead)?;
		let cd_number = reader.read_u8().map_err(Error::FileRead)?;
		let master_index = reader.read_u8().map_err(Error::FileRead)? != 0;
		let created = reader.read_u32::<LittleEndian>().map_err(Error::FileRead)?;

		let mut desc = [0_u8; 100];
		reader.read_exact(&mut desc).map_err(Error::FileRead)?;
		let desc_len = desc.iter().position(|&b| b == 0).unwrap_or(desc.len());
		let description = String::from_utf8_lossy(&desc[..desc_len]).into_owned();

		Ok(PackageMeta {
			real_path: real_path.to_path_buf(),
			version,
			game_version,
			priority,
			cd_number,
			master_index,
			created,
			description,
		})
	}

	fn read_directory(
		reader: &mut impl Read,
		version: u32,
	) -> Result<IndexMap<VPathBuf, Entry>, Error> {
		let dir_count = reader.read_u32::<LittleEndian>().map_err(Error::FileRead)?;
		let mut entries = IndexMap::new();

		for _ in 0..dir_count {
			let dir_name = read_name(reader)?;
			let _cd_number = reader.read_u8().map_err(Error::FileRead)?;
			let entry_count = reader.read_u32::<LittleEndian>().map_err(Error::FileRead)?;

			for _ in 0..entry_count {
				let name = read_name(reader)?;

				let offset = reader.read_u32::<LittleEndian>().map_err(Error::FileRead)?;
				let length = reader.read_u32::<LittleEndian>().map_err(Error::FileRead)?;
				let compressed = reader.read_u32::<LittleEndian>().map_err(Error::FileRead)?;
				let flags = reader.read_u32::<LittleEndian>().map_err(Error::FileRead)?;
				let timestamp = reader.read_u32::<LittleEndian>().map_err(Error::FileRead)?;

				if version >= VERSION_TIMESTAMP2 {
					let _timestamp2 = reader.read_u32::<LittleEndian>().map_err(Error::FileRead)?;
				}

				let vpath = if dir_name.is_empty() {
					VPathBuf::new(&name)
				} else {
					VPathBuf::new(format!("{dir_name}/{name}"))
				};

				entries.insert(
					vpath,
					Entry {
						offset,
						length,
						compressed,
						flags: EntryFlags::from_bits_retain(flags),
						timestamp,
					},
				);
			}
		}

		Ok(entries)
	}

	#[must_use]
	pub fn meta(&self) -> &PackageMeta {
		&self.meta
	}

	#[must_use]
	pub fn priority(&self) -> u8 {
		self.meta.priority
	}

	pub(crate) fn set_priority(&mut self, priority: u8) {
		self.meta.priority = priority;
	}

	#[must_use]
	pub fn contains(&self, path: &VPath) -> bool {
		self.entries.contains_key(path)
	}

	#[must_use]
	pub fn entry(&self, path: &VPath) -> Option<&Entry> {
		self.entries.get(path)
	}

	pub fn paths(&self) -> impl Iterator<Item = &VPath> {
		self.entries.keys().map(|k| -> &VPath { k })
	}

	#[must_use]
	pub fn entry_count(&self) -> usize {
		self.entries.len()
	}

	/// Performs one bounded read of the raw payload under the file-handle
	/// lock, then decompresses (if the entry is deflated) with the lock
	/// already released. The result never references the archive file.
	pub fn read_entry(&self, path: &VPath) -> Result<Vec<u8>, Error> {
		let entry = *self.entries.get(path).ok_or(Error::NotFound)?;

		let raw = {
			let mut guard = self.file.lock();

			guard
				.seek(SeekFrom::Start(u64::from(entry.offset)))
				.map_err(Error::Seek)?;

			let mut buf = vec![0_u8; entry.stored_len() as usize];
			guard.read_exact(&mut buf).map_err(Error::FileRead)?;
			buf
		};

		if entry.is_stored() {
			return Ok(raw);
		}

		if raw.len() < COMPRESSED_TAG_LEN {
			return Err(Error::EntryTooShort {
				path: path.to_owned(),
			});
		}

		let tagged = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);

		if tagged != entry.length {
			log::warn!(
				"Entry `{path}`: compression tag declares {tagged} bytes, directory declares {}.",
				entry.length,
			);
		}

		let mut out = Vec::with_capacity(entry.length as usize);
		ZlibDecoder::new(&raw[COMPRESSED_TAG_LEN..])
			.read_to_end(&mut out)
			.map_err(Error::Decompress)?;

		if out.len() != entry.length as usize {
			return Err(Error::SizeMismatch {
				path: path.to_owned(),
				expected: entry.length,
				actual: out.len(),
			});
		}

		Ok(out)
	}
}

fn read_name(reader: &mut impl Read) -> Result<String, Error> {
	let len = reader.read_u8().map_err(Error::FileRead)?;
	let mut buf = vec![0_u8; usize::from(len)];
	reader.read_exact(&mut buf).map_err(Error::FileRead)?;
	String::from_utf8(buf).map_err(Error::NameUtf8)
}
