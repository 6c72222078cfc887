//! # Wintermute VFS
//!
//! A read-only, priority-ordered union over package archives and loose disk
//! directories. Everything above this crate asks for logical paths and gets
//! back standalone in-memory streams; which archive (if any) a file came
//! from is invisible to callers, and a higher-priority source shadows any
//! lower-priority file at the same path.

mod package;
mod path;

#[cfg(test)]
mod test;

use std::{
	collections::BTreeSet,
	fs,
	io::{self, Cursor, Read, Seek, SeekFrom},
	path::{Path, PathBuf},
	string::FromUtf8Error,
};

use globset::GlobBuilder;

pub use self::{
	package::{Entry, EntryFlags, Package, PackageMeta},
	path::{VPath, VPathBuf},
};

#[derive(Debug, Default)]
pub struct VirtualFs {
	sources: Vec<Source>,
	next_id: u32,
}

/// Identifies one mounted source for the lifetime of the [`VirtualFs`]
/// which emitted it. Unmounting invalidates the ID; IDs are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u32);

#[derive(Debug)]
enum Source {
	Package { id: SourceId, package: Package },
	Directory { id: SourceId, root: PathBuf },
}

impl Source {
	#[must_use]
	fn id(&self) -> SourceId {
		match self {
			Self::Package { id, .. } => *id,
			Self::Directory { id, .. } => *id,
		}
	}

	/// Directories always lose to packages; between packages, the header
	/// priority decides. Mount order breaks ties (later mounts win).
	#[must_use]
	fn priority(&self) -> i32 {
		match self {
			Self::Package { package, .. } => i32::from(package.priority()),
			Self::Directory { .. } => -1,
		}
	}
}

impl VirtualFs {
	/// Mounts a package archive. `priority` overrides the priority declared
	/// in the archive header when given.
	///
	/// A malformed archive fails this mount only; previously mounted
	/// sources are unaffected.
	pub fn mount(&mut self, real_path: &Path, priority: Option<u8>) -> Result<SourceId, Error> {
		let mut package = Package::open(real_path)?;

		if let Some(p) = priority {
			package.set_priority(p);
		}

		let id = self.alloc_id();

		log::info!(
			"Mounted `{}` ({} entries, priority {}).",
			real_path.display(),
			package.entry_count(),
			package.priority(),
		);

		self.sources.push(Source::Package { id, package });
		self.sort_sources();
		Ok(id)
	}

	/// Mounts a loose directory, conventionally the on-disk game directory.
	/// Disk sources resolve after every package.
	pub fn mount_dir(&mut self, real_path: &Path) -> Result<SourceId, Error> {
		let canon = real_path.canonicalize().map_err(Error::Canonicalize)?;

		if !canon.is_dir() {
			return Err(Error::NotADirectory(canon));
		}

		let id = self.alloc_id();
		log::info!("Mounted directory `{}`.", canon.display());
		self.sources.push(Source::Directory { id, root: canon });
		self.sort_sources();
		Ok(id)
	}

	/// Returns `true` if a source was removed.
	pub fn unmount(&mut self, id: SourceId) -> bool {
		let before = self.sources.len();
		self.sources.retain(|source| source.id() != id);
		before != self.sources.len()
	}

	fn alloc_id(&mut self) -> SourceId {
		let id = SourceId(self.next_id);
		self.next_id += 1;
		id
	}

	/// Stable sort, descending priority. Later mounts sort before earlier
	/// ones at equal priority so that resolution can take the first hit.
	fn sort_sources(&mut self) {
		self.sources.sort_by_key(|source| {
			(
				std::cmp::Reverse(source.priority()),
				std::cmp::Reverse(source.id().0),
			)
		});
	}

	/// Opens a file as a standalone, seekable in-memory stream.
	///
	/// Absence is a value, not an error: `Ok(None)` means no mounted source
	/// has the path. `Err` is reserved for IO and format failures while
	/// actually reading a present entry.
	pub fn open(&self, path: impl AsRef<str>) -> Result<Option<FileStream>, Error> {
		let vpath = VPathBuf::new(path);

		for source in &self.sources {
			match source {
				Source::Package { package, .. } => {
					if package.contains(&vpath) {
						let bytes = package.read_entry(&vpath)?;
						return Ok(Some(FileStream::new(vpath, bytes)));
					}
				}
				Source::Directory { root, .. } => {
					if let Some(real) = resolve_on_disk(root, &vpath) {
						let bytes = fs::read(real).map_err(Error::FileRead)?;
						return Ok(Some(FileStream::new(vpath, bytes)));
					}
				}
			}
		}

		Ok(None)
	}

	#[must_use]
	pub fn exists(&self, path: impl AsRef<str>) -> bool {
		let vpath = VPathBuf::new(path);

		self.sources.iter().any(|source| match source {
			Source::Package { package, .. } => package.contains(&vpath),
			Source::Directory { root, .. } => resolve_on_disk(root, &vpath).is_some(),
		})
	}

	/// Uncompressed size of the file, without reading its payload.
	#[must_use]
	pub fn size(&self, path: impl AsRef<str>) -> Option<u64> {
		let vpath = VPathBuf::new(path);

		for source in &self.sources {
			match source {
				Source::Package { package, .. } => {
					if let Some(entry) = package.entry(&vpath) {
						return Some(u64::from(entry.length));
					}
				}
				Source::Directory { root, .. } => {
					if let Some(real) = resolve_on_disk(root, &vpath) {
						return fs::metadata(real).ok().map(|m| m.len());
					}
				}
			}
		}

		None
	}

	/// Yields the union of all matching paths, deduplicated by normalized
	/// path (so a shadowed file appears once), in path order.
	///
	/// Without `recursive`, only paths in the pattern's own directory
	/// match; with it, the pattern's file-name part is matched at any
	/// depth beneath that directory.
	pub fn enumerate(&self, pattern: &str, recursive: bool) -> Result<Vec<VPathBuf>, Error> {
		let pattern = VPathBuf::new(pattern);
		let (dir, name_pat) = split_dir(&pattern);

		let glob = GlobBuilder::new(name_pat)
			.literal_separator(true)
			.build()
			.map_err(Error::Glob)?
			.compile_matcher();

		let mut out = BTreeSet::new();

		let mut visit = |vpath: &VPath| {
			let (vdir, vname) = split_dir(vpath);

			let dir_ok = if recursive {
				dir.is_empty()
					|| vdir == dir
					|| (vdir.starts_with(dir) && vdir.as_bytes().get(dir.len()) == Some(&b'/'))
			} else {
				vdir == dir
			};

			if dir_ok && glob.is_match(vname) {
				out.insert(vpath.to_owned());
			}
		};

		for source in &self.sources {
			match source {
				Source::Package { package, .. } => {
					for vpath in package.paths() {
						visit(vpath);
					}
				}
				Source::Directory { root, .. } => {
					let mut stack = vec![(root.clone(), String::new())];

					while let Some((real, virt)) = stack.pop() {
						let iter = fs::read_dir(&real).map_err(Error::DirRead)?;

						for dentry in iter {
							let dentry = dentry.map_err(Error::DirRead)?;
							let name = dentry.file_name().to_string_lossy().into_owned();

							let child = if virt.is_empty() {
								name
							} else {
								format!("{virt}/{name}")
							};

							let ftype = dentry.file_type().map_err(Error::DirRead)?;

							if ftype.is_dir() {
								stack.push((dentry.path(), child));
							} else {
								visit(&VPathBuf::new(child));
							}
						}
					}
				}
			}
		}

		Ok(out.into_iter().collect())
	}

	/// Mounted sources in resolution order, for diagnostics.
	pub fn sources(&self) -> impl Iterator<Item = (SourceId, Option<&PackageMeta>)> {
		self.sources.iter().map(|source| match source {
			Source::Package { id, package } => (*id, Some(package.meta())),
			Source::Directory { id, .. } => (*id, None),
		})
	}

	#[must_use]
	pub fn source_count(&self) -> usize {
		self.sources.len()
	}
}

/// Case-insensitive walk from `root` down `vpath`'s components.
#[must_use]
fn resolve_on_disk(root: &Path, vpath: &VPath) -> Option<PathBuf> {
	let mut current = root.to_path_buf();

	for comp in vpath.components() {
		let found = fs::read_dir(&current).ok()?.find_map(|dentry| {
			let dentry = dentry.ok()?;

			dentry
				.file_name()
				.to_string_lossy()
				.eq_ignore_ascii_case(comp)
				.then(|| dentry.path())
		})?;

		current = found;
	}

	current.is_file().then_some(current)
}

/// Splits a normalized path into (directory part, file-name part).
/// The directory part has no trailing separator and may be empty.
#[must_use]
fn split_dir(vpath: &VPath) -> (&str, &str) {
	match vpath.as_str().rsplit_once('/') {
		Some((dir, name)) => (dir, name),
		None => ("", vpath.as_str()),
	}
}

/// An owned, seekable byte stream detached from whatever source produced
/// it. Callers may hold any number of these at once.
#[derive(Debug)]
pub struct FileStream {
	path: VPathBuf,
	cursor: Cursor<Vec<u8>>,
}

impl FileStream {
	#[must_use]
	fn new(path: VPathBuf, bytes: Vec<u8>) -> Self {
		Self {
			path,
			cursor: Cursor::new(bytes),
		}
	}

	#[must_use]
	pub fn path(&self) -> &VPath {
		&self.path
	}

	#[must_use]
	pub fn bytes(&self) -> &[u8] {
		self.cursor.get_ref()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.cursor.get_ref().len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.cursor.get_ref().is_empty()
	}

	#[must_use]
	pub fn into_bytes(self) -> Vec<u8> {
		self.cursor.into_inner()
	}

	/// The whole payload as UTF-8 text, BOM stripped if present.
	pub fn into_text(self) -> Result<String, Error> {
		let mut bytes = self.cursor.into_inner();

		if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
			bytes.drain(..3);
		}

		String::from_utf8(bytes).map_err(Error::NameUtf8)
	}
}

impl Read for FileStream {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		self.cursor.read(buf)
	}
}

impl Seek for FileStream {
	fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
		self.cursor.seek(pos)
	}
}

#[derive(Debug)]
pub enum Error {
	Canonicalize(io::Error),
	Decompress(io::Error),
	DirRead(io::Error),
	EntryTooShort { path: VPathBuf },
	FileOpen(io::Error),
	FileRead(io::Error),
	Glob(globset::Error),
	MagicMismatch { found: [u32; 2] },
	NameUtf8(FromUtf8Error),
	NotADirectory(PathBuf),
	NotFound,
	Seek(io::Error),
	SizeMismatch {
		path: VPathBuf,
		expected: u32,
		actual: usize,
	},
	VersionUnsupported(u32),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Canonicalize(err) => {
				write!(f, "could not resolve a mount path on disk: {err}")
			}
			Self::Decompress(err) => write!(f, "failed to inflate an archive entry: {err}"),
			Self::DirRead(err) => write!(f, "reading a game directory from disk failed: {err}"),
			Self::EntryTooShort { path } => write!(
				f,
				"entry `{path}` ends before its compression tag; the archive is damaged"
			),
			Self::FileOpen(err) => write!(f, "could not open a game data file: {err}"),
			Self::FileRead(err) => write!(f, "reading from a game data file failed: {err}"),
			Self::Glob(err) => write!(f, "invalid enumeration pattern: {err}"),
			Self::MagicMismatch { found } => write!(
				f,
				"not a package archive (magic {:#010X} {:#010X})",
				found[0], found[1]
			),
			Self::NameUtf8(err) => write!(f, "non-UTF-8 text in an archive: {err}"),
			Self::NotADirectory(p) => write!(f, "not a directory: {}", p.display()),
			Self::NotFound => write!(f, "no mounted source provides that path"),
			Self::Seek(err) => write!(f, "repositioning within an archive failed: {err}"),
			Self::SizeMismatch {
				path,
				expected,
				actual,
			} => write!(
				f,
				"entry `{path}` inflated to {actual} bytes, directory declares {expected}"
			),
			Self::VersionUnsupported(v) => {
				write!(f, "package directory version {v:#06X} is unsupported")
			}
		}
	}
}
