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

// On disk data layout for index pages.
//
// Page header (32 bytes):
// [MAGIC: 4][ENTRY_COUNT: 4][MAX_ENTRIES: 4][USED_SPACE: 4][FREE_SPACE: 4]
// [LAST_UPDATE_MS: 8][CHECKSUM: 4]
// USED_SPACE counts the header; USED_SPACE + FREE_SPACE == page size.
//
// The header is followed by (entry, key bytes) tuples appended in insertion
// order:
// [IS_DELETED: 1][PAGE_INDEX: 1][PAD: 2][KEY_LENGTH: 4][VALUE_POSITION: 8]
// [VALUE_LENGTH: 4][VALUE_ALLOCATED: 4][TIMESTAMP: 8][KEY: KEY_LENGTH]
//
// Keys are stored codec-encoded when any codec stage is active, so an
// encrypted database leaks no plaintext keys. Removal flips IS_DELETED in
// place; the bytes are reclaimed by compact(). A reservation is a tuple with
// VALUE_POSITION = -1, rewritten in place once the value lands.
//
// Up to 32 pages exist per database. The manager keeps a plaintext
// key -> (entry, tuple offset) map rebuilt at open; the map is authoritative
// for liveness and every page mutation updates it first.

use std::collections::HashMap;
use std::convert::TryInto;

use crate::codec::Codec;
use crate::display::hex;
use crate::error::{Error, Result};
use crate::file::DbFile;
use crate::header::{
	fnv1a, IndexBlock, IndexHeader, INDEX_BLOCK_SIZE, INDEX_ENTRY_SIZE, INDEX_HEADER_SIZE,
	INDEX_PAGE_HEADER_SIZE, MAX_INDEX_PAGES, PAGE_MAGIC,
};

pub const MIN_PAGE_SIZE: usize = 1024;
pub const MAX_PAGE_SIZE: usize = 2 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
	pub is_deleted: bool,
	pub page_index: u8,
	pub key_length: i32,
	pub value_position: i64,
	pub value_length: i32,
	pub value_allocated_length: i32,
	pub timestamp: i64,
}

impl Entry {
	pub fn reserved(page_index: u8, key_length: i32, timestamp: i64) -> Entry {
		Entry {
			is_deleted: false,
			page_index,
			key_length,
			value_position: -1,
			value_length: 0,
			value_allocated_length: 0,
			timestamp,
		}
	}

	pub fn is_confirmed(&self) -> bool {
		self.value_position >= 0
	}

	pub fn to_bytes(&self) -> [u8; INDEX_ENTRY_SIZE] {
		let mut buf = [0u8; INDEX_ENTRY_SIZE];
		buf[0] = self.is_deleted as u8;
		buf[1] = self.page_index;
		buf[4..8].copy_from_slice(&self.key_length.to_le_bytes());
		buf[8..16].copy_from_slice(&self.value_position.to_le_bytes());
		buf[16..20].copy_from_slice(&self.value_length.to_le_bytes());
		buf[20..24].copy_from_slice(&self.value_allocated_length.to_le_bytes());
		buf[24..32].copy_from_slice(&self.timestamp.to_le_bytes());
		buf
	}

	pub fn from_bytes(buf: &[u8]) -> Entry {
		Entry {
			is_deleted: buf[0] != 0,
			page_index: buf[1],
			key_length: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
			value_position: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
			value_length: i32::from_le_bytes(buf[16..20].try_into().unwrap()),
			value_allocated_length: i32::from_le_bytes(buf[20..24].try_into().unwrap()),
			timestamp: i64::from_le_bytes(buf[24..32].try_into().unwrap()),
		}
	}
}

pub struct IndexPage {
	index: u8,
	position: u64,
	buf: Vec<u8>,
	entry_count: u32,
	used_space: u32,
	deleted_count: u32,
	deleted_bytes: u32,
	last_update_ms: i64,
	dirty: bool,
}

impl IndexPage {
	pub fn new(index: u8, position: u64, size: usize, now: i64) -> IndexPage {
		IndexPage {
			index,
			position,
			buf: vec![0u8; size],
			entry_count: 0,
			used_space: INDEX_PAGE_HEADER_SIZE as u32,
			deleted_count: 0,
			deleted_bytes: 0,
			last_update_ms: now,
			dirty: true,
		}
	}

	pub fn from_bytes(index: u8, position: u64, buf: Vec<u8>) -> Result<IndexPage> {
		if buf.len() < INDEX_PAGE_HEADER_SIZE {
			return Err(Error::Corruption("Index page too small".into()));
		}
		let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
		if magic != PAGE_MAGIC {
			return Err(Error::Corruption(format!("Bad index page magic at {}", position)));
		}
		let checksum = u32::from_le_bytes(buf[28..32].try_into().unwrap());
		if checksum != fnv1a(&buf[0..28]) {
			return Err(Error::Corruption(format!(
				"Index page checksum mismatch at {}",
				position
			)));
		}
		let entry_count = u32::from_le_bytes(buf[4..8].try_into().unwrap());
		let used_space = u32::from_le_bytes(buf[12..16].try_into().unwrap());
		let free_space = u32::from_le_bytes(buf[16..20].try_into().unwrap());
		let last_update_ms = i64::from_le_bytes(buf[20..28].try_into().unwrap());
		if used_space as usize > buf.len()
			|| (used_space as usize) < INDEX_PAGE_HEADER_SIZE
			|| used_space as usize + free_space as usize != buf.len()
		{
			return Err(Error::Corruption(format!("Bad index page geometry at {}", position)));
		}
		let mut page = IndexPage {
			index,
			position,
			buf,
			entry_count,
			used_space,
			deleted_count: 0,
			deleted_bytes: 0,
			last_update_ms,
			dirty: false,
		};
		// Walk the tuples once to validate bounds and recount tombstones.
		let mut offset = INDEX_PAGE_HEADER_SIZE as u32;
		for _ in 0..entry_count {
			if offset + INDEX_ENTRY_SIZE as u32 > used_space {
				return Err(Error::Corruption(format!("Truncated entry at {}", position)));
			}
			let entry = page.entry_at(offset);
			let tuple_end =
				offset as u64 + INDEX_ENTRY_SIZE as u64 + entry.key_length.max(0) as u64;
			if entry.key_length <= 0 || tuple_end > used_space as u64 {
				return Err(Error::Corruption(format!(
					"Entry overruns page at {}",
					position
				)));
			}
			if entry.is_deleted {
				page.deleted_count += 1;
				page.deleted_bytes += INDEX_ENTRY_SIZE as u32 + entry.key_length as u32;
			}
			offset += INDEX_ENTRY_SIZE as u32 + entry.key_length as u32;
		}
		Ok(page)
	}

	pub fn index(&self) -> u8 {
		self.index
	}

	pub fn position(&self) -> u64 {
		self.position
	}

	pub fn size(&self) -> usize {
		self.buf.len()
	}

	pub fn entry_count(&self) -> u32 {
		self.entry_count
	}

	pub fn deleted_count(&self) -> u32 {
		self.deleted_count
	}

	pub fn used_space(&self) -> u32 {
		self.used_space
	}

	pub fn free_space(&self) -> u32 {
		self.buf.len() as u32 - self.used_space
	}

	pub fn has_room(&self, key_len: usize) -> bool {
		self.free_space() as usize >= INDEX_ENTRY_SIZE + key_len
	}

	/// True when compacting would make room for a tuple of `key_len` that
	/// does not fit now.
	pub fn has_room_after_compact(&self, key_len: usize) -> bool {
		self.deleted_bytes > 0
			&& (self.free_space() + self.deleted_bytes) as usize >= INDEX_ENTRY_SIZE + key_len
	}

	pub fn entry_at(&self, offset: u32) -> Entry {
		let offset = offset as usize;
		Entry::from_bytes(&self.buf[offset..offset + INDEX_ENTRY_SIZE])
	}

	fn key_at(&self, offset: u32, key_length: i32) -> &[u8] {
		let start = offset as usize + INDEX_ENTRY_SIZE;
		&self.buf[start..start + key_length as usize]
	}

	/// Append an (entry, key) tuple. Returns the tuple offset, or None when
	/// the page is out of room.
	pub fn append(&mut self, entry: &Entry, encoded_key: &[u8], now: i64) -> Option<u32> {
		if !self.has_room(encoded_key.len()) {
			return None;
		}
		let offset = self.used_space;
		let start = offset as usize;
		self.buf[start..start + INDEX_ENTRY_SIZE].copy_from_slice(&entry.to_bytes());
		self.buf[start + INDEX_ENTRY_SIZE..start + INDEX_ENTRY_SIZE + encoded_key.len()]
			.copy_from_slice(encoded_key);
		self.entry_count += 1;
		self.used_space += (INDEX_ENTRY_SIZE + encoded_key.len()) as u32;
		self.last_update_ms = now;
		self.dirty = true;
		Some(offset)
	}

	/// Rewrite the 32-byte entry at its stored offset. Used to confirm a
	/// reservation.
	pub fn write_entry_at(&mut self, offset: u32, entry: &Entry, now: i64) {
		let start = offset as usize;
		self.buf[start..start + INDEX_ENTRY_SIZE].copy_from_slice(&entry.to_bytes());
		self.last_update_ms = now;
		self.dirty = true;
	}

	pub fn mark_deleted_at(&mut self, offset: u32, now: i64) {
		let entry = self.entry_at(offset);
		if entry.is_deleted {
			return;
		}
		self.buf[offset as usize] = 1;
		self.deleted_count += 1;
		self.deleted_bytes += INDEX_ENTRY_SIZE as u32 + entry.key_length as u32;
		self.last_update_ms = now;
		self.dirty = true;
	}

	/// Remove the tuple at `offset`, which must be the last one appended.
	/// Rolls back a failed reservation without leaving a tombstone.
	pub fn truncate_last(&mut self, offset: u32, key_length: i32, now: i64) {
		let tuple_len = INDEX_ENTRY_SIZE as u32 + key_length as u32;
		debug_assert_eq!(offset + tuple_len, self.used_space);
		if offset + tuple_len != self.used_space {
			// Not the tail. Leave a tombstone instead.
			self.mark_deleted_at(offset, now);
			return;
		}
		let start = offset as usize;
		for b in &mut self.buf[start..start + tuple_len as usize] {
			*b = 0;
		}
		self.entry_count -= 1;
		self.used_space = offset;
		self.last_update_ms = now;
		self.dirty = true;
	}

	/// All tuples in order: (offset, entry, encoded key).
	pub fn tuples(&self) -> Vec<(u32, Entry, Vec<u8>)> {
		let mut result = Vec::with_capacity(self.entry_count as usize);
		let mut offset = INDEX_PAGE_HEADER_SIZE as u32;
		for _ in 0..self.entry_count {
			let entry = self.entry_at(offset);
			let key = self.key_at(offset, entry.key_length).to_vec();
			result.push((offset, entry, key));
			offset += (INDEX_ENTRY_SIZE + entry.key_length as usize) as u32;
		}
		result
	}

	pub fn should_compact(&self) -> bool {
		self.deleted_count > 0 && self.deleted_count * 10 >= self.entry_count * 3
	}

	/// Rebuild the buffer keeping only live tuples. Tuple offsets change;
	/// the manager refreshes its map afterwards.
	pub fn compact(&mut self, now: i64) {
		let live: Vec<_> =
			self.tuples().into_iter().filter(|(_, entry, _)| !entry.is_deleted).collect();
		log::debug!(
			target: "ultrakv",
			"Compacting index page {}: {} entries, {} deleted",
			self.index,
			self.entry_count,
			self.deleted_count,
		);
		let size = self.buf.len();
		let mut scratch = vec![0u8; size];
		let mut offset = INDEX_PAGE_HEADER_SIZE;
		for (_, entry, key) in &live {
			scratch[offset..offset + INDEX_ENTRY_SIZE].copy_from_slice(&entry.to_bytes());
			scratch[offset + INDEX_ENTRY_SIZE..offset + INDEX_ENTRY_SIZE + key.len()]
				.copy_from_slice(key);
			offset += INDEX_ENTRY_SIZE + key.len();
		}
		self.buf = scratch;
		self.entry_count = live.len() as u32;
		self.used_space = offset as u32;
		self.deleted_count = 0;
		self.deleted_bytes = 0;
		self.last_update_ms = now;
		self.dirty = true;
	}

	fn seal_header(&mut self) {
		let size = self.buf.len() as u32;
		let max_entries = (size - INDEX_PAGE_HEADER_SIZE as u32) / INDEX_ENTRY_SIZE as u32;
		self.buf[0..4].copy_from_slice(&PAGE_MAGIC.to_le_bytes());
		self.buf[4..8].copy_from_slice(&self.entry_count.to_le_bytes());
		self.buf[8..12].copy_from_slice(&max_entries.to_le_bytes());
		self.buf[12..16].copy_from_slice(&self.used_space.to_le_bytes());
		self.buf[16..20].copy_from_slice(&(size - self.used_space).to_le_bytes());
		self.buf[20..28].copy_from_slice(&self.last_update_ms.to_le_bytes());
		let checksum = fnv1a(&self.buf[0..28]);
		self.buf[28..32].copy_from_slice(&checksum.to_le_bytes());
	}

	pub fn persist(&mut self, file: &DbFile) -> Result<()> {
		if !self.dirty {
			return Ok(());
		}
		self.seal_header();
		file.write_at(&self.buf, self.position)?;
		self.dirty = false;
		Ok(())
	}
}

#[derive(Clone, Copy)]
pub struct Slot {
	pub entry: Entry,
	pub offset: u32,
}

pub struct Reservation {
	pub entry: Entry,
	pub offset: u32,
	pub existing: bool,
}

pub struct IndexStats {
	pub page_count: u8,
	pub max_pages: u8,
	pub total_index_bytes: i64,
	pub total_entries: u64,
	pub active_entries: u64,
	pub deleted_entries: u64,
	pub utilization: f64,
}

pub struct IndexManager {
	pages: Vec<IndexPage>,
	cache: HashMap<String, Slot>,
	// Tuples whose stored keys have not been decoded yet. Decoding needs
	// the right encryption key, so it is deferred until an operation needs
	// the plaintext map; see materialize_keys.
	pending: Vec<(u32, Entry, Vec<u8>)>,
	data_start: u64,
	default_page_size: usize,
	created_ms: i64,
	meta_dirty: bool,
}

impl IndexManager {
	pub fn new(data_start: u64, default_page_size: usize, now: i64) -> IndexManager {
		IndexManager {
			pages: Vec::new(),
			cache: HashMap::new(),
			pending: Vec::new(),
			data_start,
			default_page_size,
			created_ms: now,
			meta_dirty: true,
		}
	}

	pub(crate) fn adopt(
		data_start: u64,
		default_page_size: usize,
		created_ms: i64,
		page: IndexPage,
		cache: HashMap<String, Slot>,
	) -> IndexManager {
		IndexManager {
			pages: vec![page],
			cache,
			pending: Vec::new(),
			data_start,
			default_page_size,
			created_ms,
			meta_dirty: true,
		}
	}

	/// Load every page named by the block array and rebuild the key map.
	/// With an active codec the stored keys cannot be compared until they
	/// are decoded; those tuples are parked and authenticated lazily by
	/// `materialize_keys`, so an open with the wrong encryption key
	/// succeeds and the failure surfaces on first use.
	pub fn load(
		&mut self,
		file: &DbFile,
		header: &IndexHeader,
		blocks: &[IndexBlock],
		codec: &Codec,
	) -> Result<()> {
		self.created_ms = header.created_ms();
		for i in 0..header.page_count() as usize {
			let block = blocks
				.get(i)
				.ok_or_else(|| Error::Corruption("Missing index block".into()))?;
			if !block.is_valid() {
				return Err(Error::Corruption(format!("Invalid index block {}", i)));
			}
			let mut buf = vec![0u8; block.page_size as usize];
			file.read_at(&mut buf, block.page_position as u64)?;
			let page = IndexPage::from_bytes(i as u8, block.page_position as u64, buf)?;
			for (offset, entry, encoded_key) in page.tuples() {
				if entry.is_deleted {
					continue;
				}
				if entry.page_index as usize != i {
					return Err(Error::Corruption(format!(
						"Entry in page {} claims page {}",
						i, entry.page_index
					)));
				}
				if codec.is_identity() {
					let key = String::from_utf8(encoded_key)
						.map_err(|_| Error::Corruption("Stored key is not UTF-8".into()))?;
					self.cache.insert(key, Slot { entry, offset });
				} else {
					self.pending.push((offset, entry, encoded_key));
				}
			}
			self.pages.push(page);
		}
		self.meta_dirty = false;
		log::debug!(
			target: "ultrakv",
			"Loaded index: {} pages, {} live keys, {} deferred",
			self.pages.len(),
			self.cache.len(),
			self.pending.len(),
		);
		Ok(())
	}

	pub fn has_pending_keys(&self) -> bool {
		!self.pending.is_empty()
	}

	/// Decode the keys parked at load time and fold them into the map. A
	/// failure leaves the pending list untouched, so every caller fails
	/// the same way until a codec with the right key shows up.
	pub fn materialize_keys(&mut self, codec: &Codec) -> Result<()> {
		if self.pending.is_empty() {
			return Ok(());
		}
		let mut decoded = Vec::with_capacity(self.pending.len());
		for (offset, entry, encoded_key) in &self.pending {
			let plain = match codec.decode(encoded_key) {
				Ok(plain) => plain,
				Err(Error::AuthFailed) => {
					log::warn!(
						target: "ultrakv",
						"Page {}: key {} does not authenticate",
						entry.page_index,
						hex(encoded_key),
					);
					return Err(Error::AuthFailed);
				}
				Err(e) => return Err(e),
			};
			let key = String::from_utf8(plain)
				.map_err(|_| Error::Corruption("Stored key is not UTF-8".into()))?;
			decoded.push((key, Slot { entry: *entry, offset: *offset }));
		}
		for (key, slot) in decoded {
			self.cache.insert(key, slot);
		}
		self.pending.clear();
		log::debug!(
			target: "ultrakv",
			"Materialized deferred keys, {} live",
			self.cache.len(),
		);
		Ok(())
	}

	pub fn get(&self, key: &str) -> Option<Entry> {
		self.cache.get(key).map(|slot| slot.entry)
	}

	pub fn contains(&self, key: &str) -> bool {
		self.cache.contains_key(key)
	}

	pub fn len(&self) -> usize {
		self.cache.len()
	}

	pub fn keys(&self) -> Vec<String> {
		self.cache.keys().cloned().collect()
	}

	pub fn collect_active(&self) -> Vec<(String, Entry)> {
		self.cache.iter().map(|(key, slot)| (key.clone(), slot.entry)).collect()
	}

	pub fn page_count(&self) -> usize {
		self.pages.len()
	}

	pub fn total_index_bytes(&self) -> i64 {
		self.pages.iter().map(|p| p.size() as i64).sum()
	}

	/// Reserve an index slot for `key`. For a key already present this
	/// returns the live entry; the caller decides between overwriting the
	/// current slot and reallocating. For a new key a reservation tuple with
	/// `value_position = -1` is appended to a page with room, compacting or
	/// creating a page when necessary.
	pub fn reserve(
		&mut self,
		file: &DbFile,
		key: &str,
		encoded_key: &[u8],
		codec: &Codec,
		now: i64,
	) -> Result<Reservation> {
		if let Some(slot) = self.cache.get(key) {
			return Ok(Reservation { entry: slot.entry, offset: slot.offset, existing: true });
		}

		let key_len = encoded_key.len();
		let target = match self.pages.iter().position(|p| p.has_room(key_len)) {
			Some(i) => i,
			None => match self.pages.iter().position(|p| p.has_room_after_compact(key_len)) {
				Some(i) => {
					self.pages[i].compact(now);
					self.refresh_page(i, codec)?;
					i
				}
				None => self.create_page(file, now)?,
			},
		};

		let entry = Entry::reserved(target as u8, key_len as i32, now);
		let offset = self.pages[target]
			.append(&entry, encoded_key, now)
			.ok_or_else(|| Error::Corruption("Index page full after selection".into()))?;
		self.cache.insert(key.to_string(), Slot { entry, offset });
		self.meta_dirty = true;
		Ok(Reservation { entry, offset, existing: false })
	}

	/// Rewrite a reserved or live tuple in place with the final value
	/// position and lengths.
	pub fn confirm(&mut self, key: &str, entry: Entry, now: i64) -> Result<()> {
		let slot = self
			.cache
			.get_mut(key)
			.ok_or_else(|| Error::Corruption("Confirming an unknown key".into()))?;
		self.pages[entry.page_index as usize].write_entry_at(slot.offset, &entry, now);
		slot.entry = entry;
		self.meta_dirty = true;
		Ok(())
	}

	/// Undo a reservation after a failed value write. A fresh reservation is
	/// physically removed; an update reservation left the old tuple in place
	/// and needs no repair.
	pub fn rollback(&mut self, key: &str, reservation: &Reservation, now: i64) {
		if reservation.existing {
			return;
		}
		if let Some(slot) = self.cache.remove(key) {
			self.pages[slot.entry.page_index as usize].truncate_last(
				slot.offset,
				slot.entry.key_length,
				now,
			);
			self.meta_dirty = true;
		}
	}

	/// Drop a live key: evicts the map entry and tombstones the tuple.
	pub fn remove(&mut self, key: &str, now: i64) -> Option<Entry> {
		let slot = self.cache.remove(key)?;
		self.pages[slot.entry.page_index as usize].mark_deleted_at(slot.offset, now);
		self.meta_dirty = true;
		Some(slot.entry)
	}

	pub fn clear(&mut self) {
		self.pages.clear();
		self.cache.clear();
		self.pending.clear();
		self.meta_dirty = true;
	}

	fn create_page(&mut self, file: &DbFile, now: i64) -> Result<usize> {
		let size = if self.pages.is_empty() {
			self.default_page_size
		} else {
			(self.total_index_bytes() as usize * 2).max(MIN_PAGE_SIZE).min(MAX_PAGE_SIZE)
		};
		self.create_page_sized(file, size, now)
	}

	pub(crate) fn create_page_sized(
		&mut self,
		file: &DbFile,
		size: usize,
		now: i64,
	) -> Result<usize> {
		if self.pages.len() >= MAX_INDEX_PAGES {
			return Err(Error::IndexFull);
		}
		// The first page sits at the fixed data start; later pages append to
		// the end of the file.
		let position = if self.pages.is_empty() { self.data_start } else { file.len() };
		let index = self.pages.len();
		log::debug!(
			target: "ultrakv",
			"Creating index page {} at {}, {} bytes",
			index,
			position,
			size,
		);
		let mut page = IndexPage::new(index as u8, position, size, now);
		page.persist(file)?;
		self.pages.push(page);
		self.meta_dirty = true;
		Ok(index)
	}

	/// Re-derive map offsets for one page after a compact shuffled its
	/// tuples.
	fn refresh_page(&mut self, page_index: usize, codec: &Codec) -> Result<()> {
		let index = page_index as u8;
		self.cache.retain(|_, slot| slot.entry.page_index != index);
		for (offset, entry, encoded_key) in self.pages[page_index].tuples() {
			if entry.is_deleted {
				continue;
			}
			let plain =
				if codec.is_identity() { encoded_key } else { codec.decode(&encoded_key)? };
			let key = String::from_utf8(plain)
				.map_err(|_| Error::Corruption("Stored key is not UTF-8".into()))?;
			self.cache.insert(key, Slot { entry, offset });
		}
		Ok(())
	}

	pub fn stats(&self) -> IndexStats {
		let total: u64 = self.pages.iter().map(|p| p.entry_count() as u64).sum();
		let deleted: u64 = self.pages.iter().map(|p| p.deleted_count() as u64).sum();
		let active = total - deleted;
		IndexStats {
			page_count: self.pages.len() as u8,
			max_pages: MAX_INDEX_PAGES as u8,
			total_index_bytes: self.total_index_bytes(),
			total_entries: total,
			active_entries: active,
			deleted_entries: deleted,
			utilization: if total == 0 { 0.0 } else { active as f64 / total as f64 },
		}
	}

	/// Compact pages past the tombstone threshold, persist dirty pages and
	/// rewrite the index header and block array.
	pub fn save(&mut self, file: &DbFile, codec: &Codec, now: i64) -> Result<()> {
		// Compaction shuffles tuple offsets; with keys still parked the
		// pending offsets would go stale, so it waits until they are
		// materialized.
		if self.pending.is_empty() {
			for i in 0..self.pages.len() {
				if self.pages[i].should_compact() {
					self.pages[i].compact(now);
					self.refresh_page(i, codec)?;
					self.meta_dirty = true;
				}
			}
		}
		for page in self.pages.iter_mut() {
			page.persist(file)?;
		}
		if self.meta_dirty {
			self.write_meta(file, now)?;
			self.meta_dirty = false;
		}
		Ok(())
	}

	pub(crate) fn write_meta(&self, file: &DbFile, now: i64) -> Result<()> {
		let stats = self.stats();
		let mut header = IndexHeader::default();
		header.set_page_count(self.pages.len() as u8);
		header.set_total_index_bytes(self.total_index_bytes());
		header.set_data_start(self.data_start as i64);
		header.set_created_ms(self.created_ms);
		header.set_last_update_ms(now);
		header.set_total_entries(stats.total_entries as u32);
		header.set_active_entries(stats.active_entries as u32);
		header.set_deleted_entries(stats.deleted_entries as u32);
		header.seal();

		let meta_offset = self.data_start
			- (INDEX_HEADER_SIZE + MAX_INDEX_PAGES * INDEX_BLOCK_SIZE) as u64;
		file.write_at(&header.0, meta_offset)?;

		let mut blocks = [0u8; MAX_INDEX_PAGES * INDEX_BLOCK_SIZE];
		for (i, page) in self.pages.iter().enumerate() {
			let block = IndexBlock {
				page_position: page.position() as i64,
				page_size: page.size() as i64,
			};
			blocks[i * INDEX_BLOCK_SIZE..(i + 1) * INDEX_BLOCK_SIZE]
				.copy_from_slice(&block.to_bytes());
		}
		file.write_at(&blocks, meta_offset + INDEX_HEADER_SIZE as u64)?;
		Ok(())
	}
}
