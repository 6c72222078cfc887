use std::{
	io::{Read, Write},
	path::{Path, PathBuf},
};

use byteorder::{LittleEndian, WriteBytesExt};
use flate2::{write::ZlibEncoder, Compression};

use super::*;

struct TempPackage {
	path: PathBuf,
}

impl TempPackage {
	fn write(name: &str, bytes: &[u8]) -> Self {
		let path = std::env::temp_dir().join(format!("wme-vfs-{}-{name}", std::process::id()));
		std::fs::write(&path, bytes).unwrap();
		Self { path }
	}

	fn path(&self) -> &Path {
		&self.path
	}
}

impl Drop for TempPackage {
	fn drop(&mut self) {
		let _ = std::fs::remove_file(&self.path);
	}
}

struct Spec<'a> {
	name: &'a str,
	payload: &'a [u8],
	deflate: bool,
}

/// Builds a complete archive image: header, one root directory, payloads.
fn build_package(priority: u8, version: u32, files: &[Spec]) -> Vec<u8> {
	const HEADER_LEN: usize = 4 + 4 + 4 + 4 + 1 + 1 + 1 + 4 + 100 + 4;

	let entry_fixed = if version >= package::VERSION_TIMESTAMP2 {
		1 + 4 * 6
	} else {
		1 + 4 * 5
	};

	let dir_len = (1 + 1 + 4)
		+ files
			.iter()
			.map(|spec| entry_fixed + spec.name.len())
			.sum::<usize>();

	let payload_base = HEADER_LEN + dir_len;

	let mut payloads = Vec::new();
	let mut records = Vec::new();

	for spec in files {
		let stored = if spec.deflate {
			// Tag first, zlib stream after, as the reader expects.
			let mut tagged = (spec.payload.len() as u32).to_le_bytes().to_vec();
			let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
			enc.write_all(spec.payload).unwrap();
			tagged.extend_from_slice(&enc.finish().unwrap());
			tagged
		} else {
			spec.payload.to_vec()
		};

		let compressed = if spec.deflate { stored.len() as u32 } else { 0 };

		records.push((
			spec.name,
			(payload_base + payloads.len()) as u32,
			spec.payload.len() as u32,
			compressed,
		));

		payloads.extend_from_slice(&stored);
	}

	let mut out = Vec::new();
	out.write_u32::<LittleEndian>(package::MAGIC_1).unwrap();
	out.write_u32::<LittleEndian>(package::MAGIC_2).unwrap();
	out.write_u32::<LittleEndian>(version).unwrap();
	out.write_u32::<LittleEndian>(0x0001_0000).unwrap();
	out.write_u8(priority).unwrap();
	out.write_u8(1).unwrap();
	out.write_u8(0).unwrap();
	out.write_u32::<LittleEndian>(0).unwrap();
	out.extend_from_slice(&[0_u8; 100]);
	out.write_u32::<LittleEndian>(1).unwrap();

	// Single root directory with an empty name.
	out.write_u8(0).unwrap();
	out.write_u8(1).unwrap();
	out.write_u32::<LittleEndian>(records.len() as u32).unwrap();

	for (name, offset, length, compressed) in records {
		out.write_u8(name.len() as u8).unwrap();
		out.extend_from_slice(name.as_bytes());
		out.write_u32::<LittleEndian>(offset).unwrap();
		out.write_u32::<LittleEndian>(length).unwrap();
		out.write_u32::<LittleEndian>(compressed).unwrap();
		out.write_u32::<LittleEndian>(0).unwrap();
		out.write_u32::<LittleEndian>(0).unwrap();

		if version >= package::VERSION_TIMESTAMP2 {
			out.write_u32::<LittleEndian>(0).unwrap();
		}
	}

	assert_eq!(out.len(), payload_base);
	out.extend_from_slice(&payloads);
	out
}

fn read_all(stream: FileStream) -> Vec<u8> {
	stream.into_bytes()
}

#[test]
fn vpath_normalization() {
	assert_eq!(
		VPathBuf::new("Scenes\\Town.scene").as_str(),
		"scenes/town.scene"
	);
	assert_eq!(
		VPathBuf::new("/scenes//town.scene").as_str(),
		"scenes/town.scene"
	);
	assert_eq!(VPathBuf::new("A.TXT").as_str(), "a.txt");
	assert_eq!(VPathBuf::new("a.txt").file_name(), "a.txt");
	assert_eq!(VPathBuf::new("dir/a.txt").extension(), Some("txt"));

	let vpb = VPathBuf::new("data\\Scenes\\town\\town.scene");
	let mut comps = vpb.components();
	assert_eq!(comps.next(), Some("data"));
	assert_eq!(comps.next(), Some("scenes"));
	assert_eq!(comps.next(), Some("town"));
	assert_eq!(comps.next(), Some("town.scene"));
	assert_eq!(comps.next(), None);
}

#[test]
fn priority_shadowing() {
	let pkg_a = build_package(
		10,
		0x100,
		&[Spec {
			name: "scenes\\town.scene",
			payload: b"A",
			deflate: false,
		}],
	);

	let pkg_b = build_package(
		20,
		0x100,
		&[Spec {
			name: "scenes\\town.scene",
			payload: b"B",
			deflate: false,
		}],
	);

	let tmp_a = TempPackage::write("shadow-a.dcp", &pkg_a);
	let tmp_b = TempPackage::write("shadow-b.dcp", &pkg_b);

	let mut vfs = VirtualFs::default();
	let id_a = vfs.mount(tmp_a.path(), None).unwrap();
	let id_b = vfs.mount(tmp_b.path(), None).unwrap();

	let stream = vfs.open("scenes/town.scene").unwrap().unwrap();
	assert_eq!(read_all(stream), b"B");

	assert!(vfs.unmount(id_b));
	let stream = vfs.open("scenes/town.scene").unwrap().unwrap();
	assert_eq!(read_all(stream), b"A");

	assert!(vfs.unmount(id_a));
	assert!(vfs.open("scenes/town.scene").unwrap().is_none());
	assert!(!vfs.unmount(id_a));
}

#[test]
fn enumerate_union() {
	let pkg_a = build_package(
		10,
		0x100,
		&[
			Spec {
				name: "a.txt",
				payload: b"from A",
				deflate: false,
			},
			Spec {
				name: "b.txt",
				payload: b"from A",
				deflate: false,
			},
		],
	);

	let pkg_b = build_package(
		20,
		0x100,
		&[
			Spec {
				name: "b.txt",
				payload: b"from B",
				deflate: false,
			},
			Spec {
				name: "c.txt",
				payload: b"from B",
				deflate: false,
			},
		],
	);

	let tmp_a = TempPackage::write("enum-a.dcp", &pkg_a);
	let tmp_b = TempPackage::write("enum-b.dcp", &pkg_b);

	let mut vfs = VirtualFs::default();
	vfs.mount(tmp_a.path(), None).unwrap();
	vfs.mount(tmp_b.path(), None).unwrap();

	let paths = vfs.enumerate("*.txt", false).unwrap();

	assert_eq!(
		paths,
		vec![
			VPathBuf::new("a.txt"),
			VPathBuf::new("b.txt"),
			VPathBuf::new("c.txt"),
		]
	);

	let stream = vfs.open("b.txt").unwrap().unwrap();
	assert_eq!(read_all(stream), b"from B");
}

#[test]
fn deflated_entries() {
	let payload = b"the quick brown fox jumps over the lazy dog".repeat(64);

	let pkg = build_package(
		0,
		0x200,
		&[
			Spec {
				name: "compressed.bin",
				payload: &payload,
				deflate: true,
			},
			Spec {
				name: "stored.bin",
				payload: b"plain",
				deflate: false,
			},
		],
	);

	let tmp = TempPackage::write("deflate.dcp", &pkg);

	let mut vfs = VirtualFs::default();
	vfs.mount(tmp.path(), None).unwrap();

	assert_eq!(vfs.size("compressed.bin"), Some(payload.len() as u64));

	let mut stream = vfs.open("COMPRESSED.BIN").unwrap().unwrap();
	let mut bytes = Vec::new();
	stream.read_to_end(&mut bytes).unwrap();
	assert_eq!(bytes, payload);

	let stream = vfs.open("stored.bin").unwrap().unwrap();
	assert_eq!(read_all(stream), b"plain");
}

#[test]
fn compressed_entries_shorter_than_their_tag_are_rejected() {
	let pkg = build_package(
		0,
		0x100,
		&[Spec {
			name: "tiny.bin",
			payload: b"abcdef",
			deflate: false,
		}],
	);

	// Rewrite the entry's compressed length to 2: now it reads as a
	// compressed payload with no room for the four-byte tag. The field
	// sits after the header (127 bytes), the directory preamble (6), the
	// entry name (1 + 8), and the offset/length words (8).
	let compressed_at = 127 + 6 + 1 + "tiny.bin".len() + 8;
	let mut pkg = pkg;
	pkg[compressed_at..compressed_at + 4].copy_from_slice(&2_u32.to_le_bytes());

	let tmp = TempPackage::write("tagless.dcp", &pkg);

	let mut vfs = VirtualFs::default();
	vfs.mount(tmp.path(), None).unwrap();

	assert!(matches!(
		vfs.open("tiny.bin"),
		Err(Error::EntryTooShort { .. })
	));
}

#[test]
fn malformed_mounts_rejected() {
	let tmp = TempPackage::write("garbage.dcp", b"this is not an archive, not even slightly");

	let mut vfs = VirtualFs::default();
	assert!(matches!(
		vfs.mount(tmp.path(), None),
		Err(Error::MagicMismatch { .. })
	));

	let mut bad_version = build_package(0, 0x100, &[]);
	// Patch the version word past the supported range.
	bad_version[8..12].copy_from_slice(&0x300_u32.to_le_bytes());
	let tmp = TempPackage::write("future.dcp", &bad_version);

	assert!(matches!(
		vfs.mount(tmp.path(), None),
		Err(Error::VersionUnsupported(0x300))
	));

	assert_eq!(vfs.source_count(), 0);
}

#[test]
fn priority_override() {
	let pkg = build_package(
		5,
		0x100,
		&[Spec {
			name: "x.bin",
			payload: b"low",
			deflate: false,
		}],
	);

	let tmp = TempPackage::write("override.dcp", &pkg);

	let mut vfs = VirtualFs::default();
	vfs.mount(tmp.path(), Some(99)).unwrap();

	let (_, meta) = vfs.sources().next().unwrap();
	assert_eq!(meta.unwrap().priority, 99);
}
