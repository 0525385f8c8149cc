// Copyright 2015-2020 Parity Technologies (UK) Ltd.
// This file is part of Parity.

// Parity is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Parity is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Parity.  If not, see <http://www.gnu.org/licenses/>.

// The engine. One `Db` owns one file. Mutations serialize behind a single
// write lock; reads share the lock and use positional I/O, so a reader
// never observes a torn record. The optional background worker flushes on a
// period and triggers the auto-GC rebuild, at most once a minute.
//
// Put protocol: validate key -> reserve an index tuple -> encode the value
// -> place it (free block, in-place overwrite, or end-of-file append with
// the preallocation multiplier) -> write -> confirm the tuple in place. A
// write failure rolls the reservation back, so a failed put leaves no
// phantom key.

use std::collections::HashMap;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::codec::{Codec, CompressionType, EncryptionType};
use crate::error::{Error, Result};
use crate::file::DbFile;
use crate::free::FreeSpace;
use crate::header::{
	data_start_position, index_header_offset, DatabaseHeader, FreeSpaceHeader, IndexBlock,
	IndexHeader, DATABASE_HEADER_SIZE, FREE_HEADER_OFFSET, FREE_HEADER_SIZE,
	INDEX_BLOCK_SIZE, INDEX_HEADER_SIZE, MAX_INDEX_PAGES,
};
use crate::index::{IndexManager, IndexStats};
use crate::options::Options;
use crate::shrink;
use crate::stats::{DbStats, ShrinkResult};
use crate::table;

pub(crate) fn now_ms() -> i64 {
	use std::time::{SystemTime, UNIX_EPOCH};
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as i64)
		.unwrap_or(0)
}

const AUTO_GC_COOLDOWN: Duration = Duration::from_secs(60);

pub(crate) struct DbShared {
	pub(crate) file: DbFile,
	pub(crate) header: DatabaseHeader,
	pub(crate) free: FreeSpace,
	pub(crate) index: IndexManager,
	pub(crate) data_start: u64,
	pub(crate) last_auto_gc: Option<Instant>,
}

struct DbInner {
	options: Options,
	codec: Codec,
	shared: RwLock<DbShared>,
	// Memory mode value map; repopulated lazily after reopen.
	memory: Option<Mutex<HashMap<String, Vec<u8>>>>,
}

pub struct Db {
	inner: Arc<DbInner>,
	worker: Option<(mpsc::Sender<()>, std::thread::JoinHandle<()>)>,
}

impl Db {
	pub fn open<P: AsRef<Path>>(path: P, options: Options) -> Result<Db> {
		options.validate()?;
		let codec = Codec::new(
			options.compression,
			options.encryption,
			options.encryption_key.as_deref(),
		)?;
		let path = path.as_ref();
		if let Some(parent) = path.parent() {
			if !parent.as_os_str().is_empty() && !parent.exists() {
				std::fs::create_dir_all(parent)?;
			}
		}
		Self::recover_interrupted_shrink(path)?;

		let file = DbFile::open(path)?;
		let now = now_ms();
		let mut shared = if file.len() == 0 {
			Self::create(file, &options, now)?
		} else {
			Self::load(file, &options, &codec, now)?
		};

		// A free-space geometry change cannot be applied in place; rebuild
		// into the new layout.
		if shared.free.enabled() != options.free_space_enabled()
			|| shared.header.region_bytes() != options.region_bytes()
		{
			log::info!(
				target: "ultrakv",
				"Free space configuration changed, rebuilding {}",
				path.display(),
			);
			shrink::rebuild(&mut shared, &options, &codec, now)?;
		}

		let memory =
			if options.enable_memory_mode { Some(Mutex::new(HashMap::new())) } else { None };
		let inner = Arc::new(DbInner {
			options: options.clone(),
			codec,
			shared: RwLock::new(shared),
			memory,
		});

		let worker = if options.gc_flush_interval > 0 {
			let (tx, rx) = mpsc::channel();
			let tick_inner = inner.clone();
			let period = Duration::from_secs(options.gc_flush_interval as u64);
			let handle = std::thread::Builder::new()
				.name("ultrakv-flush".into())
				.spawn(move || loop {
					match rx.recv_timeout(period) {
						Err(mpsc::RecvTimeoutError::Timeout) => tick_inner.tick(),
						_ => break,
					}
				})?;
			Some((tx, handle))
		} else {
			None
		};

		Ok(Db { inner, worker })
	}

	fn recover_interrupted_shrink(path: &Path) -> Result<()> {
		let bak = shrink::suffixed(path, ".bak");
		let tmp = shrink::suffixed(path, ".tmp");
		if !path.exists() && bak.exists() {
			log::warn!(
				target: "ultrakv",
				"Recovering {} from interrupted shrink",
				path.display(),
			);
			std::fs::rename(&bak, path)?;
		} else if bak.exists() {
			std::fs::remove_file(&bak)?;
		}
		if tmp.exists() {
			log::warn!(target: "ultrakv", "Removing stale {}", tmp.display());
			std::fs::remove_file(&tmp)?;
		}
		Ok(())
	}

	fn create(file: DbFile, options: &Options, now: i64) -> Result<DbShared> {
		log::info!(target: "ultrakv", "Creating database {}", file.path().display());
		let mut header = options.new_header(now, now);
		header.seal();
		file.write_at(&header.0, 0)?;

		let region = options.region_bytes();
		let data_start = data_start_position(region);
		let mut free = FreeSpace::new(options.free_space_enabled(), region as usize, data_start);
		free.clear();
		free.save(&file)?;

		let index = IndexManager::new(data_start, options.default_page_size(), now);
		index.write_meta(&file, now)?;
		file.grow(data_start)?;
		file.sync()?;
		Ok(DbShared { file, header, free, index, data_start, last_auto_gc: None })
	}

	fn load(file: DbFile, options: &Options, codec: &Codec, now: i64) -> Result<DbShared> {
		let mut buf = [0u8; DATABASE_HEADER_SIZE];
		file.read_at(&mut buf, 0)?;
		let header = DatabaseHeader::from_bytes(buf);
		header.validate()?;

		let compression = CompressionType::from_u8(header.compression())
			.ok_or_else(|| Error::Corruption("Unknown compression kind".into()))?;
		let encryption = EncryptionType::from_u8(header.encryption())
			.ok_or_else(|| Error::Corruption("Unknown encryption kind".into()))?;
		if compression != options.compression || encryption != options.encryption {
			return Err(Error::ConfigMismatch(format!(
				"File was created with {:?}/{:?}, configured {:?}/{:?}",
				compression, encryption, options.compression, options.encryption
			)));
		}

		let region = header.region_bytes();
		let data_start = data_start_position(region);

		let mut buf = [0u8; FREE_HEADER_SIZE];
		file.read_at(&mut buf, FREE_HEADER_OFFSET)?;
		let free_header = FreeSpaceHeader::from_bytes(buf);
		free_header.validate()?;
		let enabled = header.free_space_reuse() && region > 0;
		let mut free = FreeSpace::new(enabled, region as usize, data_start);
		free.load(&file, &free_header)?;

		let mut buf = [0u8; INDEX_HEADER_SIZE];
		file.read_at(&mut buf, index_header_offset(region))?;
		let index_header = IndexHeader::from_bytes(buf);
		index_header.validate()?;
		if index_header.data_start() != data_start as i64 {
			return Err(Error::Corruption("Index header disagrees with the layout".into()));
		}

		let mut blocks_buf = [0u8; MAX_INDEX_PAGES * INDEX_BLOCK_SIZE];
		file.read_at(&mut blocks_buf, index_header_offset(region) + INDEX_HEADER_SIZE as u64)?;
		let blocks: Vec<IndexBlock> =
			blocks_buf.chunks(INDEX_BLOCK_SIZE).map(IndexBlock::from_bytes).collect();

		let mut index = IndexManager::new(data_start, options.default_page_size(), now);
		index.load(&file, &index_header, &blocks, codec)?;

		log::info!(
			target: "ultrakv",
			"Opened database {}: {} keys, {} bytes",
			file.path().display(),
			index.len(),
			file.len(),
		);
		Ok(DbShared { file, header, free, index, data_start, last_auto_gc: None })
	}

	pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
		self.inner.put(key, value)
	}

	/// Never fails: a record that cannot be read or decoded is logged and
	/// reported as absent.
	pub fn get(&self, key: &str) -> Option<Vec<u8>> {
		self.inner.get(key)
	}

	/// Liveness check against the in-memory map only; no heap access.
	pub fn contains(&self, key: &str) -> bool {
		if let Err(e) = self.inner.ensure_keys() {
			log::warn!(target: "ultrakv", "Failed to check {}: {}", key, e);
			return false;
		}
		self.inner.shared.read().index.contains(key)
	}

	pub fn delete(&self, key: &str) -> Result<bool> {
		self.inner.delete_batch(std::iter::once(key)).map(|count| count > 0)
	}

	/// Delete many keys in one critical section. Returns how many existed.
	pub fn delete_batch<I, K>(&self, keys: I) -> Result<usize>
	where
		I: IntoIterator<Item = K>,
		K: AsRef<str>,
	{
		self.inner.delete_batch(keys)
	}

	/// Drop every record and truncate the heap. The file keeps its headers.
	pub fn clear(&self) -> Result<()> {
		self.inner.clear()
	}

	pub fn flush(&self) -> Result<()> {
		self.inner.flush()
	}

	/// Compact the file in place. With `force` false the pass is skipped
	/// (returning a zero-saving result) unless the GC trigger conditions
	/// hold.
	pub fn shrink(&self, force: bool) -> Result<ShrinkResult> {
		self.inner.shrink(force)
	}

	/// Advisory: is a shrink likely to pay off.
	pub fn should_shrink(&self) -> bool {
		let shared = self.inner.shared.read();
		let file_size = shared.file.len();
		let free = shared.free.total_free();
		let live = file_size as i64 - shared.data_start as i64 - free;
		file_size > 1024 * 1024 && live > 0 && free as f64 / live as f64 > 0.5
	}

	/// Snapshot of the live keys, in no particular order.
	pub fn get_all_keys(&self) -> Vec<String> {
		if let Err(e) = self.inner.ensure_keys() {
			log::warn!(target: "ultrakv", "Failed to list keys: {}", e);
			return Vec::new();
		}
		self.inner.shared.read().index.keys()
	}

	pub fn stats(&self) -> DbStats {
		let shared = self.inner.shared.read();
		let index = shared.index.stats();
		DbStats {
			// Page-level count: accurate even while stored keys are still
			// parked awaiting authentication.
			record_count: index.active_entries as usize,
			deleted_count: index.deleted_entries as usize,
			file_size: shared.file.len(),
			free_bytes: shared.free.total_free(),
			free_block_count: shared.free.block_count(),
			fragmentation: shared.free.fragmentation(),
			gc_total_count: shared.header.gc_total_count(),
			created_ms: shared.header.created_ms(),
			last_access_ms: shared.header.last_access_ms(),
			last_gc_ms: shared.header.last_gc_ms(),
		}
	}

	pub fn index_stats(&self) -> IndexStats {
		self.inner.shared.read().index.stats()
	}
}

impl Drop for Db {
	fn drop(&mut self) {
		if let Some((tx, handle)) = self.worker.take() {
			drop(tx);
			let _ = handle.join();
		}
		if let Err(e) = self.inner.flush() {
			log::warn!(target: "ultrakv", "Final flush failed: {}", e);
		}
	}
}

impl DbInner {
	/// Authenticate and fold in any stored keys deferred at open. The
	/// first operation that needs the plaintext key map pays for this;
	/// with a wrong encryption key it fails here, not at open.
	fn ensure_keys(&self) -> Result<()> {
		if !self.shared.read().index.has_pending_keys() {
			return Ok(());
		}
		let mut shared = self.shared.write();
		shared.index.materialize_keys(&self.codec)
	}

	fn put(&self, key: &str, value: &[u8]) -> Result<()> {
		let key_bytes = key.as_bytes();
		if key_bytes.is_empty() {
			return Err(Error::BadKey("Empty key".into()));
		}
		if key_bytes.len() > self.options.max_key_length as usize {
			return Err(Error::BadKey(format!(
				"Key of {} bytes exceeds the limit of {}",
				key_bytes.len(),
				self.options.max_key_length
			)));
		}
		let now = now_ms();
		let encoded_key = if self.codec.is_identity() {
			key_bytes.to_vec()
		} else {
			self.codec.encode(key_bytes)?
		};
		let record = table::encode_record(&self.codec, key_bytes, value, now)?;
		let record_len = record.len() as i64;

		let mut guard = self.shared.write();
		let shared = &mut *guard;
		let DbShared { ref file, ref mut free, ref mut index, .. } = *shared;

		index.materialize_keys(&self.codec)?;
		let reservation = index.reserve(file, key, &encoded_key, &self.codec, now)?;
		let old = reservation.entry;
		let in_place = reservation.existing
			&& old.is_confirmed()
			&& record_len <= old.value_allocated_length as i64;

		let (position, allocated) = if in_place {
			(old.value_position, old.value_allocated_length)
		} else {
			match free.try_reserve(record_len, now) {
				Some(mut block) => {
					// A merged giant block can exceed what the entry can
					// hold; keep the addressable prefix.
					if block.size > i32::max_value() as i64 {
						free.release(
							block.position + i32::max_value() as i64,
							block.size - i32::max_value() as i64,
							now,
						);
						block.size = i32::max_value() as i64;
					}
					(block.position, block.size as i32)
				}
				None => {
					let position = file.len() as i64;
					let target =
						(record_len as f64 * self.options.multiplier()).ceil() as i64;
					let allocated = target.max(record_len).min(i32::max_value() as i64);
					if let Err(e) = file.grow(position as u64 + allocated as u64) {
						index.rollback(key, &reservation, now);
						return Err(e);
					}
					(position, allocated as i32)
				}
			}
		};

		if let Err(e) = file.write_at(&record, position as u64) {
			log::warn!(target: "ultrakv", "Value write for {} failed: {}", key, e);
			if !in_place {
				free.release(position, allocated as i64, now);
			}
			index.rollback(key, &reservation, now);
			return Err(e);
		}

		let mut entry = reservation.entry;
		entry.is_deleted = false;
		entry.value_position = position;
		entry.value_length = record_len as i32;
		entry.value_allocated_length = allocated;
		entry.timestamp = now;
		index.confirm(key, entry, now)?;

		// The previous slot is released only after the new location is
		// live, so a failure above leaves the old value readable.
		if reservation.existing && old.is_confirmed() && !in_place {
			free.release(old.value_position, old.value_allocated_length as i64, now);
		}

		if self.options.enable_update_validation {
			let mut readback = vec![0u8; record.len()];
			file.read_at(&mut readback, position as u64)?;
			if readback != record {
				// A failed put must not leave a live key behind.
				index.remove(key, now);
				free.release(position, allocated as i64, now);
				return Err(Error::ValidationFailed(key.to_string()));
			}
		}
		drop(guard);

		if let Some(memory) = &self.memory {
			memory.lock().insert(key.to_string(), value.to_vec());
		}
		Ok(())
	}

	fn get(&self, key: &str) -> Option<Vec<u8>> {
		if let Some(memory) = &self.memory {
			if let Some(value) = memory.lock().get(key) {
				return Some(value.clone());
			}
		}
		if let Err(e) = self.ensure_keys() {
			log::warn!(target: "ultrakv", "Failed to read {}: {}", key, e);
			return None;
		}
		let shared = self.shared.read();
		let entry = shared.index.get(key)?;
		match table::read_record(&shared.file, &self.codec, &entry) {
			Ok(Some(value)) => {
				drop(shared);
				if let Some(memory) = &self.memory {
					memory.lock().insert(key.to_string(), value.clone());
				}
				Some(value)
			}
			Ok(None) => {
				// The record carries a tombstone the map missed; evict.
				drop(shared);
				let mut shared = self.shared.write();
				let stale = shared
					.index
					.get(key)
					.map_or(false, |e| e.value_position == entry.value_position);
				if stale {
					shared.index.remove(key, now_ms());
				}
				None
			}
			Err(e) => {
				log::warn!(target: "ultrakv", "Failed to read {}: {}", key, e);
				None
			}
		}
	}

	fn delete_batch<I, K>(&self, keys: I) -> Result<usize>
	where
		I: IntoIterator<Item = K>,
		K: AsRef<str>,
	{
		let now = now_ms();
		let mut guard = self.shared.write();
		let shared = &mut *guard;
		let DbShared { ref file, ref mut free, ref mut index, .. } = *shared;
		index.materialize_keys(&self.codec)?;
		let mut removed = 0;
		for key in keys {
			let key = key.as_ref();
			let entry = match index.remove(key, now) {
				Some(entry) => entry,
				None => continue,
			};
			if entry.is_confirmed() {
				table::write_tombstone(file, &self.codec, entry.value_position)?;
				free.release(entry.value_position, entry.value_allocated_length as i64, now);
			}
			if let Some(memory) = &self.memory {
				memory.lock().remove(key);
			}
			removed += 1;
		}
		Ok(removed)
	}

	fn clear(&self) -> Result<()> {
		let now = now_ms();
		let mut guard = self.shared.write();
		let shared = &mut *guard;
		log::info!(
			target: "ultrakv",
			"Clearing {} ({} keys)",
			shared.file.path().display(),
			shared.index.len(),
		);
		shared.index.clear();
		shared.free.clear();
		shared.file.truncate(shared.data_start)?;
		shared.index.write_meta(&shared.file, now)?;
		shared.free.save(&shared.file)?;
		shared.header.set_last_access_ms(now);
		shared.header.seal();
		shared.file.write_at(&shared.header.0, 0)?;
		shared.file.sync()?;
		if let Some(memory) = &self.memory {
			memory.lock().clear();
		}
		Ok(())
	}

	fn flush(&self) -> Result<()> {
		let now = now_ms();
		let mut guard = self.shared.write();
		let shared = &mut *guard;
		shared.header.set_last_access_ms(now);
		shared.header.seal();
		shared.file.write_at(&shared.header.0, 0)?;
		let DbShared { ref file, ref mut free, ref mut index, .. } = *shared;
		free.save(file)?;
		index.save(file, &self.codec, now)?;
		file.sync()?;
		Ok(())
	}

	fn shrink(&self, force: bool) -> Result<ShrinkResult> {
		let mut guard = self.shared.write();
		if !force && !self.should_trigger_gc(&guard) {
			return Ok(ShrinkResult::skipped(guard.file.len()));
		}
		shrink::rebuild(&mut guard, &self.options, &self.codec, now_ms())
	}

	/// GC trigger, satisfied by either the configured thresholds or the ones
	/// recorded in the database header.
	fn should_trigger_gc(&self, shared: &DbShared) -> bool {
		let file_size = shared.file.len();
		let trigger = |min_file_kb: i32, min_records: u16, threshold: u8| {
			file_size >= min_file_kb.max(0) as u64 * 1024
				&& shared.index.len() >= min_records as usize
				&& shared.free.total_free() as f64 / file_size as f64
					>= threshold as f64 / 100.0
		};
		trigger(
			self.options.gc_min_file_size_kb,
			self.options.gc_min_record_count,
			self.options.gc_free_space_threshold,
		) || trigger(
			shared.header.gc_min_file_size_kb(),
			shared.header.gc_min_record_count(),
			shared.header.gc_free_space_threshold(),
		)
	}

	/// Periodic worker body: flush, then maybe auto-GC. Errors never
	/// escape the timer.
	fn tick(&self) {
		if let Err(e) = self.flush() {
			log::warn!(target: "ultrakv", "Periodic flush failed: {}", e);
		}
		if !self.options.gc_auto_recycle {
			return;
		}
		let mut guard = self.shared.write();
		let cooling =
			guard.last_auto_gc.map_or(false, |at| at.elapsed() < AUTO_GC_COOLDOWN);
		if cooling || !self.should_trigger_gc(&guard) {
			return;
		}
		guard.last_auto_gc = Some(Instant::now());
		match shrink::rebuild(&mut guard, &self.options, &self.codec, now_ms()) {
			Ok(result) => log::info!(
				target: "ultrakv",
				"Auto GC saved {} bytes ({:.1}%)",
				result.saved_bytes,
				result.saved_percent,
			),
			Err(e) => log::warn!(target: "ultrakv", "Auto GC failed: {}", e),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	struct TempDir(std::path::PathBuf);

	impl TempDir {
		fn new(name: &'static str) -> TempDir {
			env_logger::try_init().ok();
			let mut path = std::env::temp_dir();
			path.push("ultrakv-test");
			path.push("db");
			path.push(name);

			if path.exists() {
				std::fs::remove_dir_all(&path).unwrap();
			}
			std::fs::create_dir_all(&path).unwrap();
			TempDir(path)
		}

		fn db_path(&self) -> std::path::PathBuf {
			let mut path = self.0.clone();
			path.push("db");
			path
		}

		fn open(&self, options: Options) -> Db {
			Db::open(self.db_path(), options).unwrap()
		}
	}

	impl Drop for TempDir {
		fn drop(&mut self) {
			if self.0.exists() {
				std::fs::remove_dir_all(&self.0).unwrap();
			}
		}
	}

	fn no_worker() -> Options {
		let mut options = Options::default();
		options.gc_flush_interval = 0;
		options
	}

	fn value(size: usize) -> Vec<u8> {
		use rand::RngCore;
		let mut result = vec![0u8; size];
		rand::thread_rng().fill_bytes(&mut result);
		result
	}

	#[test]
	fn put_update_get() {
		let dir = TempDir::new("put_update_get");
		let db = dir.open(no_worker());

		db.put("alpha", b"A").unwrap();
		db.put("alpha", b"AA").unwrap();
		assert_eq!(db.get("alpha").unwrap(), b"AA");

		let stats = db.stats();
		assert_eq!(stats.record_count, 1);
		assert_eq!(stats.deleted_count, 0);
		let index = db.index_stats();
		assert_eq!(index.total_entries, 1);
		assert_eq!(index.active_entries, 1);
	}

	#[test]
	fn delete_half_of_a_thousand() {
		let dir = TempDir::new("delete_half_of_a_thousand");
		let db = dir.open(no_worker());

		for i in 0..1000 {
			db.put(&format!("key_{}", i), format!("value_{}", i).as_bytes()).unwrap();
		}
		for i in (0..1000).step_by(2) {
			assert!(db.delete(&format!("key_{}", i)).unwrap());
		}
		assert_eq!(db.get_all_keys().len(), 500);
		assert!(db.contains("key_3"));
		assert!(!db.contains("key_4"));
		assert_eq!(db.get("key_3").unwrap(), b"value_3");
		assert_eq!(db.get("key_4"), None);
	}

	#[test]
	fn contains_agrees_with_get() {
		let dir = TempDir::new("contains_agrees_with_get");
		let db = dir.open(no_worker());

		for i in 0..50 {
			db.put(&format!("key_{}", i), b"x").unwrap();
		}
		for i in (0..50).step_by(3) {
			db.delete(&format!("key_{}", i)).unwrap();
		}
		for i in 0..60 {
			let key = format!("key_{}", i);
			assert_eq!(db.contains(&key), db.get(&key).is_some(), "{}", key);
		}
	}

	#[test]
	fn big_value_survives_reopen() {
		let dir = TempDir::new("big_value_survives_reopen");
		let big = value(5 * 1024 * 1024);
		{
			let db = dir.open(no_worker());
			db.put("big", &big).unwrap();
			assert_eq!(db.get("big").unwrap(), big);
		}
		let db = dir.open(no_worker());
		assert_eq!(db.get("big").unwrap(), big);
	}

	#[test]
	fn update_in_place_and_grow() {
		let dir = TempDir::new("update_in_place_and_grow");
		let db = dir.open(no_worker());

		db.put("key", &value(1000)).unwrap();
		let size_after_first = db.stats().file_size;
		// Smaller update fits the allocated slot, the file stays put.
		let smaller = value(500);
		db.put("key", &smaller).unwrap();
		assert_eq!(db.stats().file_size, size_after_first);
		assert_eq!(db.get("key").unwrap(), smaller);
		// Much larger update reallocates and frees the old slot.
		let bigger = value(100_000);
		db.put("key", &bigger).unwrap();
		assert_eq!(db.get("key").unwrap(), bigger);
		assert!(db.stats().free_bytes > 0);
	}

	#[test]
	fn deleted_slot_is_recycled() {
		let dir = TempDir::new("deleted_slot_is_recycled");
		let db = dir.open(no_worker());

		db.put("one", &value(10_000)).unwrap();
		db.delete("one").unwrap();
		let size = db.stats().file_size;
		db.put("two", &value(10_000)).unwrap();
		// Same-sized record goes into the freed slot.
		assert_eq!(db.stats().file_size, size);
		assert_eq!(db.stats().free_block_count, 0);
	}

	#[test]
	fn reuse_disabled_always_appends() {
		let dir = TempDir::new("reuse_disabled_always_appends");
		let mut options = no_worker();
		options.enable_free_space_reuse = false;
		let db = dir.open(options);

		db.put("one", &value(10_000)).unwrap();
		db.delete("one").unwrap();
		let size = db.stats().file_size;
		db.put("two", &value(10_000)).unwrap();
		assert!(db.stats().file_size > size);
		assert_eq!(db.stats().free_bytes, 0);
	}

	#[test]
	fn codec_mismatch_and_wrong_key() {
		let dir = TempDir::new("codec_mismatch_and_wrong_key");
		let mut options = no_worker();
		options.compression = CompressionType::Gzip;
		options.encryption = EncryptionType::Aes256Gcm;
		options.encryption_key = Some("correct horse battery staple".into());
		{
			let db = dir.open(options.clone());
			db.put("secret", b"topsecret").unwrap();
			assert_eq!(db.get("secret").unwrap(), b"topsecret");
		}

		// Opening with no codec at all is a configuration mismatch.
		match Db::open(dir.db_path(), no_worker()) {
			Err(Error::ConfigMismatch(_)) => (),
			other => panic!("Expected ConfigMismatch, got {:?}", other.map(|_| ())),
		}

		// Right codec kinds, wrong key: the open itself succeeds, the
		// first read trips the deferred key authentication. Reads never
		// throw, so the key reads as absent; mutations surface the
		// failure.
		{
			let mut wrong = options.clone();
			wrong.encryption_key = Some("not the right key at all".into());
			let db = Db::open(dir.db_path(), wrong).unwrap();
			assert_eq!(db.get("secret"), None);
			assert!(!db.contains("secret"));
			match db.put("other", b"x") {
				Err(Error::AuthFailed) => (),
				other => panic!("Expected AuthFailed, got {:?}", other),
			}
			match db.delete("secret") {
				Err(Error::AuthFailed) => (),
				other => panic!("Expected AuthFailed, got {:?}", other),
			}
		}

		// And the right key still works.
		let db = dir.open(options);
		assert_eq!(db.get("secret").unwrap(), b"topsecret");
	}

	#[test]
	fn encrypted_values_survive_reopen() {
		let dir = TempDir::new("encrypted_values_survive_reopen");
		let mut options = no_worker();
		options.compression = CompressionType::Zstd;
		options.encryption = EncryptionType::Aes256Gcm;
		options.encryption_key = Some("0123456789abcdef".into());
		let payload = value(200_000);
		{
			let db = dir.open(options.clone());
			db.put("blob", &payload).unwrap();
			db.put("blob", &payload).unwrap();
		}
		let db = dir.open(options);
		assert_eq!(db.get("blob").unwrap(), payload);
		assert_eq!(db.stats().record_count, 1);
	}

	#[test]
	fn shrink_reclaims_deleted_space() {
		let dir = TempDir::new("shrink_reclaims_deleted_space");
		let db = dir.open(no_worker());

		for i in 0..3000 {
			db.put(&format!("key_{:05}", i), &value(300)).unwrap();
		}
		let evens: Vec<String> = (0..3000).filter(|i| i % 3 != 0).map(|i| format!("key_{:05}", i)).collect();
		assert_eq!(db.delete_batch(&evens).unwrap(), 2000);

		assert!(db.should_shrink());
		let original = db.stats().file_size;
		let result = db.shrink(false).unwrap();
		assert_eq!(result.valid_records, 1000);
		assert_eq!(result.original_size, original);
		assert!(result.new_size < original * 6 / 10, "{} vs {}", result.new_size, original);
		assert_eq!(result.new_size, db.stats().file_size);

		// Everything left reads back, the free list is gone.
		assert_eq!(db.stats().free_bytes, 0);
		assert_eq!(db.stats().free_block_count, 0);
		assert_eq!(db.get_all_keys().len(), 1000);
		for i in (0..3000).step_by(3) {
			let key = format!("key_{:05}", i);
			assert_eq!(db.get(&key).unwrap().len(), 300, "{}", key);
		}
		assert_eq!(db.stats().gc_total_count, 1);

		// Second forced pass finds nothing more to reclaim.
		let again = db.shrink(true).unwrap();
		assert_eq!(again.saved_bytes, 0);
		assert_eq!(again.valid_records, 1000);
	}

	#[test]
	fn shrink_preserves_values_across_reopen() {
		let dir = TempDir::new("shrink_preserves_values_across_reopen");
		let mut payloads = std::collections::HashMap::new();
		{
			let db = dir.open(no_worker());
			for i in 0..200 {
				let key = format!("key_{}", i);
				let payload = value(50 + i);
				db.put(&key, &payload).unwrap();
				payloads.insert(key, payload);
			}
			for i in (0..200).step_by(2) {
				db.delete(&format!("key_{}", i)).unwrap();
				payloads.remove(&format!("key_{}", i));
			}
			db.shrink(true).unwrap();
			for (key, payload) in &payloads {
				assert_eq!(&db.get(key).unwrap(), payload);
			}
		}
		let db = dir.open(no_worker());
		for (key, payload) in &payloads {
			assert_eq!(&db.get(key).unwrap(), payload);
		}
	}

	#[test]
	fn unforced_shrink_honors_trigger() {
		let dir = TempDir::new("unforced_shrink_honors_trigger");
		let db = dir.open(no_worker());
		db.put("alpha", b"A").unwrap();
		// Tiny database: no trigger, nothing happens.
		let result = db.shrink(false).unwrap();
		assert_eq!(result.saved_bytes, 0);
		assert_eq!(result.valid_records, 0);
		assert_eq!(db.stats().gc_total_count, 0);
	}

	#[test]
	fn free_space_config_change_rebuilds() {
		let dir = TempDir::new("free_space_config_change_rebuilds");
		{
			let db = dir.open(no_worker());
			for i in 0..100 {
				db.put(&format!("key_{}", i), &value(100)).unwrap();
			}
		}
		// Disable reuse: different region geometry, open rebuilds.
		let mut options = no_worker();
		options.enable_free_space_reuse = false;
		{
			let db = dir.open(options.clone());
			assert_eq!(db.stats().gc_total_count, 1);
			assert_eq!(db.get_all_keys().len(), 100);
			assert_eq!(db.get("key_42").unwrap().len(), 100);
		}
		// Same config again: no further rebuild.
		let db = dir.open(options);
		assert_eq!(db.stats().gc_total_count, 1);
	}

	#[test]
	fn clear_empties_everything() {
		let dir = TempDir::new("clear_empties_everything");
		let db = dir.open(no_worker());
		for i in 0..100 {
			db.put(&format!("key_{}", i), &value(100)).unwrap();
		}
		db.delete("key_7").unwrap();
		db.clear().unwrap();

		assert_eq!(db.stats().record_count, 0);
		assert_eq!(db.stats().free_bytes, 0);
		assert!(!db.contains("key_8"));
		assert_eq!(db.get("key_8"), None);
		assert!(db.get_all_keys().is_empty());

		// Still usable afterwards.
		db.put("fresh", b"value").unwrap();
		assert_eq!(db.get("fresh").unwrap(), b"value");
	}

	#[test]
	fn bad_keys_rejected() {
		let dir = TempDir::new("bad_keys_rejected");
		let mut options = no_worker();
		options.max_key_length = 16;
		let db = dir.open(options);

		match db.put("", b"x") {
			Err(Error::BadKey(_)) => (),
			other => panic!("Expected BadKey, got {:?}", other),
		}
		match db.put("a key far longer than sixteen bytes", b"x") {
			Err(Error::BadKey(_)) => (),
			other => panic!("Expected BadKey, got {:?}", other),
		}
		assert!(!db.contains(""));
	}

	#[test]
	fn update_validation_roundtrip() {
		let dir = TempDir::new("update_validation_roundtrip");
		let mut options = no_worker();
		options.enable_update_validation = true;
		let db = dir.open(options);
		for i in 0..50 {
			db.put(&format!("key_{}", i), &value(500)).unwrap();
		}
		assert_eq!(db.stats().record_count, 50);
	}

	#[test]
	fn memory_mode_serves_reads() {
		let dir = TempDir::new("memory_mode_serves_reads");
		let mut options = no_worker();
		options.enable_memory_mode = true;
		{
			let db = dir.open(options.clone());
			db.put("alpha", b"A").unwrap();
			assert_eq!(db.get("alpha").unwrap(), b"A");
			db.delete("alpha").unwrap();
			assert_eq!(db.get("alpha"), None);
			db.put("beta", b"B").unwrap();
		}
		// Reopen: the map repopulates from disk on first access.
		let db = dir.open(options);
		assert_eq!(db.get("beta").unwrap(), b"B");
		assert_eq!(db.get("beta").unwrap(), b"B");
	}

	#[test]
	fn concurrent_writers_disjoint_prefixes() {
		let dir = TempDir::new("concurrent_writers_disjoint_prefixes");
		let db = std::sync::Arc::new(dir.open(no_worker()));

		let mut handles = Vec::new();
		for writer in 0..8 {
			let db = db.clone();
			handles.push(std::thread::spawn(move || {
				for i in 0..500 {
					let key = format!("w{}_key_{}", writer, i);
					db.put(&key, format!("first_{}_{}", writer, i).as_bytes()).unwrap();
				}
				for i in 0..500 {
					let key = format!("w{}_key_{}", writer, i);
					db.put(&key, format!("final_{}_{}", writer, i).as_bytes()).unwrap();
				}
			}));
		}
		for handle in handles {
			handle.join().unwrap();
		}

		assert_eq!(db.get_all_keys().len(), 8 * 500);
		for writer in 0..8 {
			for i in 0..500 {
				let key = format!("w{}_key_{}", writer, i);
				assert_eq!(
					db.get(&key).unwrap(),
					format!("final_{}_{}", writer, i).as_bytes(),
					"{}",
					key
				);
			}
		}
	}

	#[test]
	fn background_worker_keeps_data_intact() {
		let dir = TempDir::new("background_worker_keeps_data_intact");
		let mut options = Options::default();
		options.gc_flush_interval = 1;
		let db = dir.open(options);
		for i in 0..100 {
			db.put(&format!("key_{}", i), &value(100)).unwrap();
		}
		std::thread::sleep(Duration::from_millis(1500));
		for i in 0..100 {
			assert_eq!(db.get(&format!("key_{}", i)).unwrap().len(), 100);
		}
	}

	#[test]
	fn open_missing_directory_is_created() {
		let dir = TempDir::new("open_missing_directory_is_created");
		let mut path = dir.0.clone();
		path.push("nested");
		path.push("db");
		let db = Db::open(&path, no_worker()).unwrap();
		db.put("alpha", b"A").unwrap();
		assert_eq!(db.get("alpha").unwrap(), b"A");
	}

	#[test]
	fn corrupt_header_fails_open() {
		let dir = TempDir::new("corrupt_header_fails_open");
		{
			let db = dir.open(no_worker());
			db.put("alpha", b"A").unwrap();
		}
		// Flip a byte inside the database header.
		{
			use std::io::{Read, Seek, SeekFrom, Write};
			let mut file = std::fs::OpenOptions::new()
				.read(true)
				.write(true)
				.open(dir.db_path())
				.unwrap();
			let mut byte = [0u8; 1];
			file.seek(SeekFrom::Start(5)).unwrap();
			file.read_exact(&mut byte).unwrap();
			byte[0] ^= 0xff;
			file.seek(SeekFrom::Start(5)).unwrap();
			file.write_all(&byte).unwrap();
		}
		match Db::open(dir.db_path(), no_worker()) {
			Err(Error::Corruption(_)) => (),
			other => panic!("Expected Corruption, got {:?}", other.map(|_| ())),
		}
	}

	#[test]
	fn stale_tmp_is_cleaned_up() {
		let dir = TempDir::new("stale_tmp_is_cleaned_up");
		{
			let db = dir.open(no_worker());
			db.put("alpha", b"A").unwrap();
		}
		let tmp = shrink::suffixed(&dir.db_path(), ".tmp");
		std::fs::write(&tmp, b"junk").unwrap();
		let db = dir.open(no_worker());
		assert!(!tmp.exists());
		assert_eq!(db.get("alpha").unwrap(), b"A");
	}

	#[test]
	fn interrupted_swap_recovers_from_bak() {
		let dir = TempDir::new("interrupted_swap_recovers_from_bak");
		{
			let db = dir.open(no_worker());
			db.put("alpha", b"A").unwrap();
		}
		// Simulate a crash between the two renames: the database is only
		// present as the bak file.
		let bak = shrink::suffixed(&dir.db_path(), ".bak");
		std::fs::rename(dir.db_path(), &bak).unwrap();
		let db = dir.open(no_worker());
		assert_eq!(db.get("alpha").unwrap(), b"A");
		assert!(!bak.exists());
	}
}
