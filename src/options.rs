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

use crate::codec::{CompressionType, EncryptionType, MIN_ENCRYPTION_KEY_LEN};
use crate::error::{Error, Result};
use crate::header::DatabaseHeader;

/// Database configuration. The codec and the free-space geometry are fixed
/// at creation time: reopening with a different codec fails, reopening with
/// different free-space settings rebuilds the file.
#[derive(Clone, Debug)]
pub struct Options {
	/// Track freed regions and hand them back out. When off every value
	/// appends at end of file and only shrink reclaims space.
	pub enable_free_space_reuse: bool,
	/// Serve reads from an in-memory value map.
	pub enable_memory_mode: bool,
	/// Read every put back and compare.
	pub enable_update_validation: bool,
	/// Maximum encoded key length in bytes.
	pub max_key_length: i32,
	pub default_index_page_size_kb: i32,
	/// Size of the free block region. Zero disables reuse.
	pub free_space_region_size_kb: i32,
	/// End-of-file allocations request `size * (1 + n/100)` bytes.
	pub allocation_multiplier: u8,
	pub compression: CompressionType,
	pub encryption: EncryptionType,
	pub encryption_key: Option<String>,
	pub write_buffer_size_kb: i32,
	pub read_buffer_size_kb: i32,
	pub gc_min_file_size_kb: i32,
	/// Percent of the file that must be free before auto-GC fires.
	pub gc_free_space_threshold: u8,
	pub gc_min_record_count: u16,
	pub gc_auto_recycle: bool,
	/// Background flush period in seconds. Zero disables the worker.
	pub gc_flush_interval: u16,
}

impl Default for Options {
	fn default() -> Options {
		Options {
			enable_free_space_reuse: true,
			enable_memory_mode: false,
			enable_update_validation: false,
			max_key_length: 4096,
			default_index_page_size_kb: 64,
			free_space_region_size_kb: 16,
			allocation_multiplier: 20,
			compression: CompressionType::NoCompression,
			encryption: EncryptionType::NoEncryption,
			encryption_key: None,
			write_buffer_size_kb: 64,
			read_buffer_size_kb: 64,
			gc_min_file_size_kb: 1024,
			gc_free_space_threshold: 50,
			gc_min_record_count: 100,
			gc_auto_recycle: false,
			gc_flush_interval: 5,
		}
	}
}

impl Options {
	pub fn validate(&self) -> Result<()> {
		if self.max_key_length < 1 {
			return Err(Error::InvalidConfiguration("max_key_length must be positive".into()));
		}
		if self.default_index_page_size_kb < 1 {
			return Err(Error::InvalidConfiguration(
				"default_index_page_size_kb must be at least 1".into(),
			));
		}
		if self.free_space_region_size_kb < 0 {
			return Err(Error::InvalidConfiguration(
				"free_space_region_size_kb must not be negative".into(),
			));
		}
		if self.write_buffer_size_kb < 4 || self.read_buffer_size_kb < 4 {
			return Err(Error::InvalidConfiguration(
				"Buffer sizes must be at least 4 KiB".into(),
			));
		}
		if self.encryption != EncryptionType::NoEncryption {
			match &self.encryption_key {
				None => {
					return Err(Error::InvalidConfiguration(
						"Encryption enabled without a key".into(),
					))
				}
				Some(key) if key.len() < MIN_ENCRYPTION_KEY_LEN => {
					return Err(Error::InvalidConfiguration(format!(
						"Encryption key must be at least {} bytes",
						MIN_ENCRYPTION_KEY_LEN
					)))
				}
				Some(_) => (),
			}
		}
		Ok(())
	}

	/// Whether the allocator is effectively on: the flag and a non-empty
	/// region are both required.
	pub fn free_space_enabled(&self) -> bool {
		self.enable_free_space_reuse && self.free_space_region_size_kb > 0
	}

	/// Free-space region size in bytes as it will be laid out on disk.
	pub fn region_bytes(&self) -> u64 {
		if self.free_space_enabled() {
			self.free_space_region_size_kb as u64 * 1024
		} else {
			0
		}
	}

	pub fn multiplier(&self) -> f64 {
		1.0 + self.allocation_multiplier as f64 / 100.0
	}

	pub fn default_page_size(&self) -> usize {
		self.default_index_page_size_kb as usize * 1024
	}

	/// Stamp a fresh database header for this configuration. The caller
	/// seals it.
	pub(crate) fn new_header(&self, created_ms: i64, now: i64) -> DatabaseHeader {
		let mut header = DatabaseHeader::default();
		header.set_compression(self.compression.as_u8());
		header.set_encryption(self.encryption.as_u8());
		header.set_free_space_reuse(self.free_space_enabled());
		header.set_memory_mode(self.enable_memory_mode);
		header.set_update_validation(self.enable_update_validation);
		header.set_allocation_multiplier(self.allocation_multiplier);
		header.set_gc_auto_recycle(self.gc_auto_recycle);
		header.set_free_space_region_size_kb(if self.free_space_enabled() {
			self.free_space_region_size_kb
		} else {
			0
		});
		header.set_write_buffer_size_kb(self.write_buffer_size_kb);
		header.set_read_buffer_size_kb(self.read_buffer_size_kb);
		header.set_created_ms(created_ms);
		header.set_last_access_ms(now);
		header.set_gc_min_file_size_kb(self.gc_min_file_size_kb);
		header.set_gc_free_space_threshold(self.gc_free_space_threshold);
		header.set_gc_min_record_count(self.gc_min_record_count);
		header.set_gc_flush_interval(self.gc_flush_interval);
		header.set_max_key_length(self.max_key_length);
		header.set_default_index_page_size_kb(self.default_index_page_size_kb);
		header
	}
}
