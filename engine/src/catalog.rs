//! The content-addressed resource cache between the VFS and everything
//! that wants typed assets.
//!
//! Cache keys are (logical path, asset type). Loads are de-duplicated per
//! key: the first acquirer runs the registered loader while any concurrent
//! acquirers of the same key block on a latch and share the outcome,
//! including a failure. Payloads live behind [`Arc`]s, so the reference
//! count the eviction pass consults *is* the number of outstanding
//! handles; entries with live handles are never evicted.

use std::{
	any::{Any, TypeId},
	sync::{
		atomic::{AtomicU64, AtomicUsize, Ordering},
		Arc,
	},
};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use wme_vfs::{VPathBuf, VirtualFs};

/// Default soft cap on cached bytes: 256 MiB.
pub const DEFAULT_BUDGET: usize = 256 * 1024 * 1024;

/// Anything the catalog can cache. `byte_size` feeds the eviction budget;
/// an estimate is fine.
pub trait Asset: Any + Send + Sync {
	fn byte_size(&self) -> usize;
}

type AnyPayload = Arc<dyn Any + Send + Sync>;
type LoaderFn = Box<dyn Fn(Vec<u8>, &str) -> Result<(AnyPayload, usize), String> + Send + Sync>;

/// A live reference to a cached asset. Dropping the handle releases the
/// reference; the entry then becomes eligible for eviction (but stays
/// cached until memory pressure trims it).
///
/// Handles carry the catalog generation they were issued under. A forced
/// [`Catalog::clear`] advances the generation, and any handle from before
/// it fails fast (panics) on its next use; [`Handle::is_valid`] probes
/// without failing.
#[derive(Debug)]
pub struct Handle<A: Asset> {
	payload: Arc<A>,
	generation: u64,
	epoch: Arc<AtomicU64>,
}

impl<A: Asset> Handle<A> {
	/// `false` once a forced clear has invalidated this handle.
	#[must_use]
	pub fn is_valid(&self) -> bool {
		self.generation == self.epoch.load(Ordering::Relaxed)
	}

	fn guard(&self) {
		assert!(
			self.is_valid(),
			"asset handle used after a forced cache clear",
		);
	}

	/// The shared payload itself, for collaborators that keep their own
	/// reference (the scheduler holds script images this way).
	#[must_use]
	pub fn share(&self) -> Arc<A> {
		self.guard();
		self.payload.clone()
	}
}

impl<A: Asset> Clone for Handle<A> {
	fn clone(&self) -> Self {
		Self {
			payload: self.payload.clone(),
			generation: self.generation,
			epoch: self.epoch.clone(),
		}
	}
}

impl<A: Asset> std::ops::Deref for Handle<A> {
	type Target = A;

	fn deref(&self) -> &Self::Target {
		self.guard();
		&self.payload
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
	path: VPathBuf,
	type_id: TypeId,
}

#[derive(Default)]
struct Latch {
	state: Mutex<LatchState>,
	cond: Condvar,
}

#[derive(Default)]
struct LatchState {
	done: bool,
	error: Option<String>,
}

enum Slot {
	Ready(Entry),
	Loading(Arc<Latch>),
}

struct Entry {
	payload: AnyPayload,
	size: usize,
	last_access: u64,
}

pub struct Catalog {
	slots: DashMap<CacheKey, Slot>,
	loaders: FxHashMap<TypeId, LoaderFn>,
	budget: AtomicUsize,
	bytes: AtomicUsize,
	access_counter: AtomicU64,
	/// Bumped by a forced clear; handles from older generations fail fast.
	epoch: Arc<AtomicU64>,
	hits: AtomicU64,
	misses: AtomicU64,
	evictions: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
	pub entries: usize,
	pub bytes: usize,
	pub hits: u64,
	pub misses: u64,
	pub evictions: u64,
}

impl Default for Catalog {
	fn default() -> Self {
		Self {
			slots: DashMap::default(),
			loaders: FxHashMap::default(),
			budget: AtomicUsize::new(DEFAULT_BUDGET),
			bytes: AtomicUsize::new(0),
			access_counter: AtomicU64::new(0),
			epoch: Arc::new(AtomicU64::new(0)),
			hits: AtomicU64::new(0),
			misses: AtomicU64::new(0),
			evictions: AtomicU64::new(0),
		}
	}
}

enum Action {
	Hit(AnyPayload),
	Wait(Arc<Latch>),
	Load(Arc<Latch>),
}

impl Catalog {
	/// Registers how to turn raw bytes into an `A`. One loader per asset
	/// type; later registrations replace earlier ones.
	pub fn register_loader<A, F>(&mut self, load: F)
	where
		A: Asset,
		F: Fn(Vec<u8>, &str) -> Result<A, String> + Send + Sync + 'static,
	{
		self.loaders.insert(
			TypeId::of::<A>(),
			Box::new(move |bytes, path| {
				let asset = load(bytes, path)?;
				let size = asset.byte_size();
				Ok((Arc::new(asset) as AnyPayload, size))
			}),
		);
	}

	pub fn set_budget(&self, bytes: usize) {
		self.budget.store(bytes, Ordering::Relaxed);
	}

	/// Returns a handle to the cached asset, loading it through the VFS on
	/// a miss. Exactly one load runs per key regardless of how many
	/// callers arrive at once.
	pub fn acquire<A: Asset>(&self, vfs: &VirtualFs, path: &str) -> Result<Handle<A>, CatalogError> {
		let key = CacheKey {
			path: VPathBuf::new(path),
			type_id: TypeId::of::<A>(),
		};

		loop {
			let action = match self.slots.entry(key.clone()) {
				dashmap::mapref::entry::Entry::Occupied(mut occupied) => match occupied.get_mut() {
					Slot::Ready(entry) => {
						entry.last_access = self.access_counter.fetch_add(1, Ordering::Relaxed);
						self.hits.fetch_add(1, Ordering::Relaxed);
						Action::Hit(entry.payload.clone())
					}
					Slot::Loading(latch) => Action::Wait(latch.clone()),
				},
				dashmap::mapref::entry::Entry::Vacant(vacant) => {
					let latch = Arc::new(Latch::default());
					vacant.insert(Slot::Loading(latch.clone()));
					self.misses.fetch_add(1, Ordering::Relaxed);
					Action::Load(latch)
				}
			};

			match action {
				Action::Hit(payload) => {
					return Ok(self.issue_handle(payload));
				}
				Action::Wait(latch) => {
					let mut state = latch.state.lock();

					while !state.done {
						latch.cond.wait(&mut state);
					}

					if let Some(message) = &state.error {
						return Err(CatalogError::Load {
							path: key.path.as_str().to_string(),
							message: message.clone(),
						});
					}

					// The loader succeeded; retry resolves to a hit.
				}
				Action::Load(latch) => {
					return self.run_load(vfs, &key, &latch);
				}
			}
		}
	}

	fn run_load<A: Asset>(
		&self,
		vfs: &VirtualFs,
		key: &CacheKey,
		latch: &Latch,
	) -> Result<Handle<A>, CatalogError> {
		let result = self.load_payload(vfs, key);

		match result {
			Ok((payload, size)) => {
				let entry = Entry {
					payload: payload.clone(),
					size,
					last_access: self.access_counter.fetch_add(1, Ordering::Relaxed),
				};

				self.slots.insert(key.clone(), Slot::Ready(entry));
				self.bytes.fetch_add(size, Ordering::Relaxed);

				{
					let mut state = latch.state.lock();
					state.done = true;
					latch.cond.notify_all();
				}

				self.trim();
				Ok(self.issue_handle(payload))
			}
			Err(err) => {
				// The key is not inserted; every waiter sees the failure.
				self.slots.remove(key);

				{
					let mut state = latch.state.lock();
					state.done = true;
					state.error = Some(err.to_string());
					latch.cond.notify_all();
				}

				Err(err)
			}
		}
	}

	fn issue_handle<A: Asset>(&self, payload: AnyPayload) -> Handle<A> {
		let arc = payload
			.downcast::<A>()
			.expect("cache key and payload type diverged");

		Handle {
			payload: arc,
			generation: self.epoch.load(Ordering::Relaxed),
			epoch: self.epoch.clone(),
		}
	}

	fn load_payload(
		&self,
		vfs: &VirtualFs,
		key: &CacheKey,
	) -> Result<(AnyPayload, usize), CatalogError> {
		let loader = self
			.loaders
			.get(&key.type_id)
			.ok_or(CatalogError::NoLoader)?;

		let stream = vfs
			.open(key.path.as_str())
			.map_err(CatalogError::Vfs)?
			.ok_or_else(|| CatalogError::NotFound(key.path.as_str().to_string()))?;

		loader(stream.into_bytes(), key.path.as_str()).map_err(|message| CatalogError::Load {
			path: key.path.as_str().to_string(),
			message,
		})
	}

	/// Evicts unreferenced entries, LRU first, until under the soft cap.
	fn trim(&self) {
		let budget = self.budget.load(Ordering::Relaxed);

		if self.bytes.load(Ordering::Relaxed) <= budget {
			return;
		}

		let mut candidates: Vec<(CacheKey, u64)> = self
			.slots
			.iter()
			.filter_map(|kv| match kv.value() {
				Slot::Ready(entry) if Arc::strong_count(&entry.payload) == 1 => {
					Some((kv.key().clone(), entry.last_access))
				}
				_ => None,
			})
			.collect();

		candidates.sort_by_key(|&(_, access)| access);

		for (key, _) in candidates {
			if self.bytes.load(Ordering::Relaxed) <= budget {
				break;
			}

			self.remove_if_unreferenced(&key);
		}
	}

	fn remove_if_unreferenced(&self, key: &CacheKey) {
		let removed = self.slots.remove_if(key, |_, slot| {
			matches!(slot, Slot::Ready(entry) if Arc::strong_count(&entry.payload) == 1)
		});

		if let Some((_, Slot::Ready(entry))) = removed {
			self.bytes.fetch_sub(entry.size, Ordering::Relaxed);
			self.evictions.fetch_add(1, Ordering::Relaxed);
		}
	}

	/// Drops cached entries. Without `force`, only unreferenced ones; with
	/// it, everything goes and the catalog generation advances, so every
	/// outstanding handle fails fast on its next use (the payload memory
	/// itself is freed once the last stale handle drops).
	pub fn clear(&self, force: bool) {
		if force {
			let removed: Vec<CacheKey> = self
				.slots
				.iter()
				.filter(|kv| matches!(kv.value(), Slot::Ready(_)))
				.map(|kv| kv.key().clone())
				.collect();

			for key in removed {
				if let Some((_, Slot::Ready(entry))) = self.slots.remove(&key) {
					self.bytes.fetch_sub(entry.size, Ordering::Relaxed);
				}
			}

			self.epoch.fetch_add(1, Ordering::Relaxed);
		} else {
			let candidates: Vec<CacheKey> = self
				.slots
				.iter()
				.filter_map(|kv| match kv.value() {
					Slot::Ready(entry) if Arc::strong_count(&entry.payload) == 1 => {
						Some(kv.key().clone())
					}
					_ => None,
				})
				.collect();

			for key in candidates {
				self.remove_if_unreferenced(&key);
			}
		}
	}

	/// Warms the cache; failures are logged and skipped.
	pub fn preload<A: Asset>(&self, vfs: &VirtualFs, paths: &[&str]) {
		for path in paths {
			if let Err(err) = self.acquire::<A>(vfs, path) {
				log::debug!("Preload of `{path}` skipped: {err}");
			}
		}
	}

	#[must_use]
	pub fn stats(&self) -> CacheStats {
		CacheStats {
			entries: self.slots.len(),
			bytes: self.bytes.load(Ordering::Relaxed),
			hits: self.hits.load(Ordering::Relaxed),
			misses: self.misses.load(Ordering::Relaxed),
			evictions: self.evictions.load(Ordering::Relaxed),
		}
	}
}

#[derive(Debug)]
pub enum CatalogError {
	/// No mounted source has the path. Recoverable.
	NotFound(String),
	/// No loader registered for the requested asset type.
	NoLoader,
	Load { path: String, message: String },
	Vfs(wme_vfs::Error),
}

impl std::error::Error for CatalogError {}

impl std::fmt::Display for CatalogError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::NotFound(path) => write!(f, "no mounted source provides `{path}`"),
			Self::NoLoader => write!(f, "no loader registered for the requested asset type"),
			Self::Load { path, message } => write!(f, "failed to load `{path}`: {message}"),
			Self::Vfs(err) => write!(f, "filesystem error: {err}"),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	use std::path::PathBuf;

	/// A trivially sized test asset.
	struct Blob(Vec<u8>);

	impl Asset for Blob {
		fn byte_size(&self) -> usize {
			self.0.len()
		}
	}

	struct TempDir(PathBuf);

	impl TempDir {
		fn new(tag: &str) -> Self {
			let path = std::env::temp_dir().join(format!("wme-catalog-{}-{tag}", std::process::id()));
			std::fs::create_dir_all(&path).unwrap();
			Self(path)
		}

		fn file(&self, name: &str, bytes: &[u8]) {
			std::fs::write(self.0.join(name), bytes).unwrap();
		}
	}

	impl Drop for TempDir {
		fn drop(&mut self) {
			let _ = std::fs::remove_dir_all(&self.0);
		}
	}

	fn catalog_with_blob_loader() -> Catalog {
		let mut catalog = Catalog::default();
		catalog.register_loader::<Blob, _>(|bytes, _| Ok(Blob(bytes)));
		catalog
	}

	#[test]
	fn hits_share_one_payload() {
		let dir = TempDir::new("hits");
		dir.file("a.bin", b"payload");

		let mut vfs = VirtualFs::default();
		vfs.mount_dir(&dir.0).unwrap();

		let catalog = catalog_with_blob_loader();

		let h1 = catalog.acquire::<Blob>(&vfs, "a.bin").unwrap();
		let h2 = catalog.acquire::<Blob>(&vfs, "A.BIN").unwrap();

		assert!(Arc::ptr_eq(&h1.share(), &h2.share()));
		assert_eq!((*h1).0, b"payload");

		let stats = catalog.stats();
		assert_eq!(stats.entries, 1);
		assert_eq!(stats.misses, 1);
		assert_eq!(stats.hits, 1);
	}

	#[test]
	fn missing_assets_are_recoverable() {
		let dir = TempDir::new("missing");

		let mut vfs = VirtualFs::default();
		vfs.mount_dir(&dir.0).unwrap();

		let catalog = catalog_with_blob_loader();

		assert!(matches!(
			catalog.acquire::<Blob>(&vfs, "absent.bin"),
			Err(CatalogError::NotFound(_))
		));

		assert_eq!(catalog.stats().entries, 0);
	}

	#[test]
	fn concurrent_acquires_run_one_load() {
		let dir = TempDir::new("racing");
		dir.file("shared.bin", b"only once");

		let mut vfs = VirtualFs::default();
		vfs.mount_dir(&dir.0).unwrap();

		let loads = Arc::new(AtomicUsize::new(0));
		let mut catalog = Catalog::default();

		{
			let loads = loads.clone();

			catalog.register_loader::<Blob, _>(move |bytes, _| {
				loads.fetch_add(1, Ordering::SeqCst);
				// Widen the race window.
				std::thread::sleep(std::time::Duration::from_millis(20));
				Ok(Blob(bytes))
			});
		}

		let catalog = &catalog;
		let vfs = &vfs;

		std::thread::scope(|scope| {
			let workers: Vec<_> = (0..8)
				.map(|_| scope.spawn(move || catalog.acquire::<Blob>(vfs, "shared.bin").unwrap()))
				.collect();

			let handles: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

			for pair in handles.windows(2) {
				assert!(Arc::ptr_eq(&pair[0].share(), &pair[1].share()));
			}
		});

		assert_eq!(loads.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn eviction_spares_referenced_entries() {
		let dir = TempDir::new("evict");
		dir.file("held.bin", &[1_u8; 1024]);
		dir.file("loose.bin", &[2_u8; 1024]);
		dir.file("third.bin", &[3_u8; 1024]);

		let mut vfs = VirtualFs::default();
		vfs.mount_dir(&dir.0).unwrap();

		let catalog = catalog_with_blob_loader();
		catalog.set_budget(2500);

		let held = catalog.acquire::<Blob>(&vfs, "held.bin").unwrap();
		drop(catalog.acquire::<Blob>(&vfs, "loose.bin").unwrap());

		// Third load pushes past the budget; only `loose` may go.
		let _third = catalog.acquire::<Blob>(&vfs, "third.bin").unwrap();

		let stats = catalog.stats();
		assert_eq!(stats.evictions, 1);
		assert_eq!(stats.entries, 2);
		assert!(stats.bytes <= 2500);

		// The held entry is still served from cache.
		let again = catalog.acquire::<Blob>(&vfs, "held.bin").unwrap();
		assert!(Arc::ptr_eq(&held.share(), &again.share()));
	}

	#[test]
	fn clear_respects_references_unless_forced() {
		let dir = TempDir::new("clear");
		dir.file("a.bin", b"a");
		dir.file("b.bin", b"b");

		let mut vfs = VirtualFs::default();
		vfs.mount_dir(&dir.0).unwrap();

		let catalog = catalog_with_blob_loader();

		let _held = catalog.acquire::<Blob>(&vfs, "a.bin").unwrap();
		drop(catalog.acquire::<Blob>(&vfs, "b.bin").unwrap());

		catalog.clear(false);
		assert_eq!(catalog.stats().entries, 1, "held entry must survive");

		catalog.clear(true);
		assert_eq!(catalog.stats().entries, 0);
	}

	#[test]
	fn forced_clear_invalidates_handles() {
		let dir = TempDir::new("invalidate");
		dir.file("a.bin", b"first");

		let mut vfs = VirtualFs::default();
		vfs.mount_dir(&dir.0).unwrap();

		let catalog = catalog_with_blob_loader();

		let held = catalog.acquire::<Blob>(&vfs, "a.bin").unwrap();
		assert!(held.is_valid());

		catalog.clear(true);
		assert!(!held.is_valid());

		// A soft clear does not invalidate.
		let fresh = catalog.acquire::<Blob>(&vfs, "a.bin").unwrap();
		catalog.clear(false);
		assert!(fresh.is_valid());
		assert_eq!((*fresh).0, b"first");
	}

	#[test]
	#[should_panic(expected = "forced cache clear")]
	fn stale_handles_fail_fast() {
		let dir = TempDir::new("stale");
		dir.file("a.bin", b"doomed");

		let mut vfs = VirtualFs::default();
		vfs.mount_dir(&dir.0).unwrap();

		let catalog = catalog_with_blob_loader();
		let held = catalog.acquire::<Blob>(&vfs, "a.bin").unwrap();

		catalog.clear(true);
		let _ = held.byte_size();
	}

	#[test]
	fn load_failures_do_not_insert() {
		let dir = TempDir::new("fail");
		dir.file("bad.bin", b"whatever");

		let mut vfs = VirtualFs::default();
		vfs.mount_dir(&dir.0).unwrap();

		let mut catalog = Catalog::default();
		catalog.register_loader::<Blob, _>(|_, _| Err("deliberately refused".to_string()));

		assert!(matches!(
			catalog.acquire::<Blob>(&vfs, "bad.bin"),
			Err(CatalogError::Load { .. })
		));

		assert_eq!(catalog.stats().entries, 0);
	}
}
