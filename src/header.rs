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

// On disk file layout. All integers little-endian, all structures tightly
// packed.
//
// [0, 128)        DatabaseHeader, magic "UKVD"
// [128, 192)      FreeSpaceHeader, magic "FSPS"
// [192, 1024)     reserved, zero
// [1024, 1024+R)  free block records, 16 bytes each.
//                 R = free_space_region_size_kb * 1024
// [P0, P0+64)     IndexHeader, magic "IDXH". P0 = 1024 + R
// [P0+64, P0+576) 32 index block pointers, 16 bytes each
// [DS, ...)       index pages and value records, interleaved. DS = P0 + 576
//
// DatabaseHeader (128 bytes):
// [MAGIC: 4][VERSION: 1][COMPRESSION: 1][ENCRYPTION: 1][FREE_REUSE: 1]
// [MEMORY_MODE: 1][UPDATE_VALIDATION: 1][ALLOC_MULTIPLIER: 1][AUTO_RECYCLE: 1]
// [FREE_REGION_KB: 4][WRITE_BUF_KB: 4][READ_BUF_KB: 4][CREATED_MS: 8]
// [LAST_ACCESS_MS: 8][LAST_GC_MS: 8][GC_MIN_FILE_KB: 4][GC_FREE_PCT: 1]
// [PAD: 1][GC_MIN_RECORDS: 2][GC_FLUSH_SECS: 2][PAD: 2][GC_TOTAL: 4]
// [MAX_KEY_LEN: 4][PAGE_SIZE_KB: 4][RESERVED: 52][CHECKSUM: 4]
//
// FreeSpaceHeader (64 bytes):
// [MAGIC: 4][VERSION: 1][ENABLED: 1][PAD: 2][REGION_SIZE: 4][BLOCK_COUNT: 4]
// [ALLOC_COUNT: 4][RECYCLE_COUNT: 4][LAST_USED_MS: 8][TOTAL_RECYCLED: 8]
// [LARGEST_BLOCK: 8][RESERVED: 12][CHECKSUM: 4]
//
// IndexHeader (64 bytes):
// [MAGIC: 4][VERSION: 1][PAGE_COUNT: 1][PAD: 2][TOTAL_INDEX_BYTES: 8]
// [DATA_START: 8][CREATED_MS: 8][LAST_UPDATE_MS: 8][TOTAL_ENTRIES: 4]
// [ACTIVE_ENTRIES: 4][DELETED_ENTRIES: 4][RESERVED: 8][CHECKSUM: 4]
//
// Every header carries a 32-bit FNV-1a checksum over the preceding bytes.

use std::convert::TryInto;

use crate::error::{Error, Result};

pub const DB_MAGIC: u32 = 0x554B_5644; // "UKVD"
pub const FREE_MAGIC: u32 = 0x4653_5053; // "FSPS"
pub const INDEX_MAGIC: u32 = 0x4944_5848; // "IDXH"
pub const PAGE_MAGIC: u32 = 0x4944_5850; // "IDXP"
pub const CURRENT_VERSION: u8 = 1;

pub const DATABASE_HEADER_SIZE: usize = 128;
pub const FREE_HEADER_OFFSET: u64 = 128;
pub const FREE_HEADER_SIZE: usize = 64;
pub const FREE_REGION_OFFSET: u64 = 1024;
pub const FREE_BLOCK_SIZE: usize = 16;
pub const INDEX_HEADER_SIZE: usize = 64;
pub const INDEX_BLOCK_SIZE: usize = 16;
pub const MAX_INDEX_PAGES: usize = 32;
pub const INDEX_PAGE_HEADER_SIZE: usize = 32;
pub const INDEX_ENTRY_SIZE: usize = 32;

pub fn fnv1a(bytes: &[u8]) -> u32 {
	let mut hash: u32 = 2166136261;
	for b in bytes {
		hash ^= *b as u32;
		hash = hash.wrapping_mul(16777619);
	}
	hash
}

/// Offset of the IndexHeader for a given free-space region size in bytes.
pub fn index_header_offset(region_size: u64) -> u64 {
	FREE_REGION_OFFSET + region_size
}

/// Offset of the first index page. Index pages and value records are never
/// placed below this boundary.
pub fn data_start_position(region_size: u64) -> u64 {
	index_header_offset(region_size)
		+ INDEX_HEADER_SIZE as u64
		+ (MAX_INDEX_PAGES * INDEX_BLOCK_SIZE) as u64
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
	u16::from_le_bytes(buf[offset..offset + 2].try_into().unwrap())
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
	u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
	i32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn read_i64(buf: &[u8], offset: usize) -> i64 {
	i64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
	buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
	buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_i32(buf: &mut [u8], offset: usize, value: i32) {
	buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn write_i64(buf: &mut [u8], offset: usize, value: i64) {
	buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

macro_rules! accessors {
	($name: ident, $setter: ident, u8, $offset: expr) => {
		pub fn $name(&self) -> u8 {
			self.0[$offset]
		}
		pub fn $setter(&mut self, value: u8) {
			self.0[$offset] = value;
		}
	};
	($name: ident, $setter: ident, bool, $offset: expr) => {
		pub fn $name(&self) -> bool {
			self.0[$offset] != 0
		}
		pub fn $setter(&mut self, value: bool) {
			self.0[$offset] = value as u8;
		}
	};
	($name: ident, $setter: ident, u16, $offset: expr) => {
		pub fn $name(&self) -> u16 {
			read_u16(&self.0, $offset)
		}
		pub fn $setter(&mut self, value: u16) {
			write_u16(&mut self.0, $offset, value);
		}
	};
	($name: ident, $setter: ident, u32, $offset: expr) => {
		pub fn $name(&self) -> u32 {
			read_u32(&self.0, $offset)
		}
		pub fn $setter(&mut self, value: u32) {
			write_u32(&mut self.0, $offset, value);
		}
	};
	($name: ident, $setter: ident, i32, $offset: expr) => {
		pub fn $name(&self) -> i32 {
			read_i32(&self.0, $offset)
		}
		pub fn $setter(&mut self, value: i32) {
			write_i32(&mut self.0, $offset, value);
		}
	};
	($name: ident, $setter: ident, i64, $offset: expr) => {
		pub fn $name(&self) -> i64 {
			read_i64(&self.0, $offset)
		}
		pub fn $setter(&mut self, value: i64) {
			write_i64(&mut self.0, $offset, value);
		}
	};
}

#[derive(Clone, Copy)]
pub struct DatabaseHeader(pub [u8; DATABASE_HEADER_SIZE]);

impl Default for DatabaseHeader {
	fn default() -> Self {
		let mut header = DatabaseHeader([0u8; DATABASE_HEADER_SIZE]);
		header.set_magic(DB_MAGIC);
		header.set_version(CURRENT_VERSION);
		header
	}
}

impl DatabaseHeader {
	accessors!(magic, set_magic, u32, 0);
	accessors!(version, set_version, u8, 4);
	accessors!(compression, set_compression, u8, 5);
	accessors!(encryption, set_encryption, u8, 6);
	accessors!(free_space_reuse, set_free_space_reuse, bool, 7);
	accessors!(memory_mode, set_memory_mode, bool, 8);
	accessors!(update_validation, set_update_validation, bool, 9);
	accessors!(allocation_multiplier, set_allocation_multiplier, u8, 10);
	accessors!(gc_auto_recycle, set_gc_auto_recycle, bool, 11);
	accessors!(free_space_region_size_kb, set_free_space_region_size_kb, i32, 12);
	accessors!(write_buffer_size_kb, set_write_buffer_size_kb, i32, 16);
	accessors!(read_buffer_size_kb, set_read_buffer_size_kb, i32, 20);
	accessors!(created_ms, set_created_ms, i64, 24);
	accessors!(last_access_ms, set_last_access_ms, i64, 32);
	accessors!(last_gc_ms, set_last_gc_ms, i64, 40);
	accessors!(gc_min_file_size_kb, set_gc_min_file_size_kb, i32, 48);
	accessors!(gc_free_space_threshold, set_gc_free_space_threshold, u8, 52);
	accessors!(gc_min_record_count, set_gc_min_record_count, u16, 54);
	accessors!(gc_flush_interval, set_gc_flush_interval, u16, 56);
	accessors!(gc_total_count, set_gc_total_count, u32, 60);
	accessors!(max_key_length, set_max_key_length, i32, 64);
	accessors!(default_index_page_size_kb, set_default_index_page_size_kb, i32, 68);
	accessors!(checksum, set_checksum, u32, 124);

	pub fn from_bytes(bytes: [u8; DATABASE_HEADER_SIZE]) -> Self {
		DatabaseHeader(bytes)
	}

	pub fn seal(&mut self) {
		let checksum = fnv1a(&self.0[0..DATABASE_HEADER_SIZE - 4]);
		self.set_checksum(checksum);
	}

	pub fn is_valid(&self) -> bool {
		self.magic() == DB_MAGIC
			&& self.version() <= CURRENT_VERSION
			&& self.checksum() == fnv1a(&self.0[0..DATABASE_HEADER_SIZE - 4])
	}

	pub fn validate(&self) -> Result<()> {
		if self.magic() != DB_MAGIC {
			return Err(Error::Corruption("Bad database magic".into()));
		}
		if self.version() > CURRENT_VERSION {
			return Err(Error::Corruption(format!(
				"Unsupported database version {}",
				self.version()
			)));
		}
		if self.checksum() != fnv1a(&self.0[0..DATABASE_HEADER_SIZE - 4]) {
			return Err(Error::Corruption("Database header checksum mismatch".into()));
		}
		Ok(())
	}

	/// Free-space region size in bytes as laid out in this file. Zero when
	/// reuse is disabled.
	pub fn region_bytes(&self) -> u64 {
		if self.free_space_reuse() {
			self.free_space_region_size_kb().max(0) as u64 * 1024
		} else {
			0
		}
	}
}

#[derive(Clone, Copy)]
pub struct FreeSpaceHeader(pub [u8; FREE_HEADER_SIZE]);

impl Default for FreeSpaceHeader {
	fn default() -> Self {
		let mut header = FreeSpaceHeader([0u8; FREE_HEADER_SIZE]);
		header.set_magic(FREE_MAGIC);
		header.set_version(CURRENT_VERSION);
		header
	}
}

impl FreeSpaceHeader {
	accessors!(magic, set_magic, u32, 0);
	accessors!(version, set_version, u8, 4);
	accessors!(enabled, set_enabled, bool, 5);
	accessors!(region_size, set_region_size, i32, 8);
	accessors!(block_count, set_block_count, i32, 12);
	accessors!(alloc_count, set_alloc_count, u32, 16);
	accessors!(recycle_count, set_recycle_count, u32, 20);
	accessors!(last_used_ms, set_last_used_ms, i64, 24);
	accessors!(total_recycled, set_total_recycled, i64, 32);
	accessors!(largest_block, set_largest_block, i64, 40);
	accessors!(checksum, set_checksum, u32, 60);

	pub fn from_bytes(bytes: [u8; FREE_HEADER_SIZE]) -> Self {
		FreeSpaceHeader(bytes)
	}

	pub fn seal(&mut self) {
		let checksum = fnv1a(&self.0[0..FREE_HEADER_SIZE - 4]);
		self.set_checksum(checksum);
	}

	pub fn is_valid(&self) -> bool {
		self.magic() == FREE_MAGIC
			&& self.version() <= CURRENT_VERSION
			&& self.checksum() == fnv1a(&self.0[0..FREE_HEADER_SIZE - 4])
	}

	pub fn validate(&self) -> Result<()> {
		if self.is_valid() {
			Ok(())
		} else {
			Err(Error::Corruption("Bad free space header".into()))
		}
	}
}

#[derive(Clone, Copy)]
pub struct IndexHeader(pub [u8; INDEX_HEADER_SIZE]);

impl Default for IndexHeader {
	fn default() -> Self {
		let mut header = IndexHeader([0u8; INDEX_HEADER_SIZE]);
		header.set_magic(INDEX_MAGIC);
		header.set_version(CURRENT_VERSION);
		header
	}
}

impl IndexHeader {
	accessors!(magic, set_magic, u32, 0);
	accessors!(version, set_version, u8, 4);
	accessors!(page_count, set_page_count, u8, 5);
	accessors!(total_index_bytes, set_total_index_bytes, i64, 8);
	accessors!(data_start, set_data_start, i64, 16);
	accessors!(created_ms, set_created_ms, i64, 24);
	accessors!(last_update_ms, set_last_update_ms, i64, 32);
	accessors!(total_entries, set_total_entries, u32, 40);
	accessors!(active_entries, set_active_entries, u32, 44);
	accessors!(deleted_entries, set_deleted_entries, u32, 48);
	accessors!(checksum, set_checksum, u32, 60);

	pub fn from_bytes(bytes: [u8; INDEX_HEADER_SIZE]) -> Self {
		IndexHeader(bytes)
	}

	pub fn seal(&mut self) {
		let checksum = fnv1a(&self.0[0..INDEX_HEADER_SIZE - 4]);
		self.set_checksum(checksum);
	}

	pub fn is_valid(&self) -> bool {
		self.magic() == INDEX_MAGIC
			&& self.version() <= CURRENT_VERSION
			&& self.checksum() == fnv1a(&self.0[0..INDEX_HEADER_SIZE - 4])
	}

	pub fn validate(&self) -> Result<()> {
		if self.is_valid() {
			Ok(())
		} else {
			Err(Error::Corruption("Bad index header".into()))
		}
	}
}

/// Pointer to an index page. A zero-valued block is an empty slot.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct IndexBlock {
	pub page_position: i64,
	pub page_size: i64,
}

impl IndexBlock {
	pub fn is_valid(&self) -> bool {
		self.page_position > 0 && self.page_size > 0
	}

	pub fn to_bytes(&self) -> [u8; INDEX_BLOCK_SIZE] {
		let mut buf = [0u8; INDEX_BLOCK_SIZE];
		write_i64(&mut buf, 0, self.page_position);
		write_i64(&mut buf, 8, self.page_size);
		buf
	}

	pub fn from_bytes(buf: &[u8]) -> IndexBlock {
		IndexBlock {
			page_position: read_i64(buf, 0),
			page_size: read_i64(buf, 8),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn fnv1a_reference_values() {
		// Standard FNV-1a vectors.
		assert_eq!(fnv1a(b""), 2166136261);
		assert_eq!(fnv1a(b"a"), 0xe40c292c);
		assert_eq!(fnv1a(b"foobar"), 0xbf9cf968);
	}

	#[test]
	fn database_header_roundtrip() {
		let mut header = DatabaseHeader::default();
		header.set_compression(4);
		header.set_encryption(1);
		header.set_free_space_reuse(true);
		header.set_allocation_multiplier(20);
		header.set_free_space_region_size_kb(16);
		header.set_created_ms(1234567890123);
		header.set_gc_min_record_count(100);
		header.set_gc_flush_interval(5);
		header.set_max_key_length(4096);
		header.set_default_index_page_size_kb(64);
		header.seal();
		assert!(header.is_valid());

		let restored = DatabaseHeader::from_bytes(header.0);
		assert!(restored.validate().is_ok());
		assert_eq!(restored.compression(), 4);
		assert_eq!(restored.encryption(), 1);
		assert!(restored.free_space_reuse());
		assert_eq!(restored.allocation_multiplier(), 20);
		assert_eq!(restored.created_ms(), 1234567890123);
		assert_eq!(restored.gc_min_record_count(), 100);
		assert_eq!(restored.max_key_length(), 4096);
		assert_eq!(restored.region_bytes(), 16 * 1024);
	}

	#[test]
	fn corrupt_header_detected() {
		let mut header = DatabaseHeader::default();
		header.seal();
		header.0[5] ^= 0xff;
		assert!(!header.is_valid());
		assert!(header.validate().is_err());

		let mut header = DatabaseHeader::default();
		header.set_version(CURRENT_VERSION + 1);
		header.seal();
		assert!(!header.is_valid());

		let mut header = DatabaseHeader::default();
		header.set_magic(0xdeadbeef);
		header.seal();
		assert!(!header.is_valid());
	}

	#[test]
	fn free_space_header_roundtrip() {
		let mut header = FreeSpaceHeader::default();
		header.set_enabled(true);
		header.set_region_size(16 * 1024);
		header.set_block_count(3);
		header.set_total_recycled(1 << 33);
		header.set_largest_block(777);
		header.seal();
		let restored = FreeSpaceHeader::from_bytes(header.0);
		assert!(restored.is_valid());
		assert_eq!(restored.block_count(), 3);
		assert_eq!(restored.total_recycled(), 1 << 33);
		assert_eq!(restored.largest_block(), 777);
	}

	#[test]
	fn index_header_roundtrip() {
		let mut header = IndexHeader::default();
		header.set_page_count(2);
		header.set_total_index_bytes(128 * 1024);
		header.set_data_start(17984);
		header.set_active_entries(41);
		header.seal();
		let restored = IndexHeader::from_bytes(header.0);
		assert!(restored.validate().is_ok());
		assert_eq!(restored.page_count(), 2);
		assert_eq!(restored.data_start(), 17984);
		assert_eq!(restored.active_entries(), 41);
	}

	#[test]
	fn index_block_roundtrip() {
		let block = IndexBlock { page_position: 17984, page_size: 65536 };
		assert!(block.is_valid());
		assert_eq!(IndexBlock::from_bytes(&block.to_bytes()), block);
		assert!(!IndexBlock::default().is_valid());
	}

	#[test]
	fn layout_offsets() {
		// 16 KiB region: index header right behind it, data starts past the
		// block pointer array.
		assert_eq!(index_header_offset(16 * 1024), 1024 + 16 * 1024);
		assert_eq!(data_start_position(16 * 1024), 1024 + 16 * 1024 + 64 + 512);
		// Reuse disabled: the region collapses to nothing.
		assert_eq!(data_start_position(0), 1600);
	}
}
