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

// On disk data layout for value records.
//
// The index entry is authoritative for the record's position and length;
// records are addressed, never scanned.
//
// Plain record (no codec):
// [KEY_LENGTH: 4][VALUE_LENGTH: 4][TIMESTAMP: 8][IS_DELETED: 1][KEY][VALUE]
//
// Sealed record (compression and/or encryption active):
// [ORIGINAL_SIZE: 4][SEALED_SIZE: 4][IS_DELETED: 1][PAD: 3][CODEC OUTPUT]
//
// Deletion flips the IS_DELETED byte in place (offset 16 in the plain
// layout, 8 in the sealed layout) and leaves the payload untouched; the
// space goes back to the free list and the bytes die at the next shrink.

use std::convert::TryInto;

use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::file::DbFile;
use crate::index::Entry;

pub const RECORD_HEADER_SIZE: usize = 17;
pub const SEALED_HEADER_SIZE: usize = 12;
const PLAIN_DELETED_OFFSET: u64 = 16;
const SEALED_DELETED_OFFSET: u64 = 8;

/// Largest encoded record the index entry can address.
pub const MAX_RECORD_SIZE: usize = i32::max_value() as usize;

/// Build the on-disk record for a value. The returned length is what goes
/// into `IndexEntry.value_length`.
pub fn encode_record(
	codec: &Codec,
	key_bytes: &[u8],
	value: &[u8],
	timestamp: i64,
) -> Result<Vec<u8>> {
	let record = if codec.is_identity() {
		let mut record =
			Vec::with_capacity(RECORD_HEADER_SIZE + key_bytes.len() + value.len());
		record.extend_from_slice(&(key_bytes.len() as u32).to_le_bytes());
		record.extend_from_slice(&(value.len() as u32).to_le_bytes());
		record.extend_from_slice(&timestamp.to_le_bytes());
		record.push(0);
		record.extend_from_slice(key_bytes);
		record.extend_from_slice(value);
		record
	} else {
		let sealed = codec.encode(value)?;
		let mut record = Vec::with_capacity(SEALED_HEADER_SIZE + sealed.len());
		record.extend_from_slice(&(value.len() as u32).to_le_bytes());
		record.extend_from_slice(&(sealed.len() as u32).to_le_bytes());
		record.push(0);
		record.extend_from_slice(&[0u8; 3]);
		record.extend_from_slice(&sealed);
		record
	};
	if record.len() > MAX_RECORD_SIZE {
		return Err(Error::InvalidConfiguration(format!(
			"Encoded record of {} bytes exceeds the addressable maximum",
			record.len()
		)));
	}
	Ok(record)
}

/// Decode a record buffer. Returns None for a tombstoned record.
pub fn decode_record(codec: &Codec, buf: &[u8]) -> Result<Option<Vec<u8>>> {
	if codec.is_identity() {
		if buf.len() < RECORD_HEADER_SIZE {
			return Err(Error::Corruption("Record shorter than its header".into()));
		}
		let key_length = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
		let value_length = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
		if buf[16] != 0 {
			return Ok(None);
		}
		let value_start = RECORD_HEADER_SIZE + key_length;
		if value_start + value_length > buf.len() {
			return Err(Error::Corruption("Record payload overruns its slot".into()));
		}
		Ok(Some(buf[value_start..value_start + value_length].to_vec()))
	} else {
		if buf.len() < SEALED_HEADER_SIZE {
			return Err(Error::Corruption("Record shorter than its header".into()));
		}
		let original_size = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
		let sealed_size = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
		if buf[8] != 0 {
			return Ok(None);
		}
		if SEALED_HEADER_SIZE + sealed_size > buf.len() {
			return Err(Error::Corruption("Record payload overruns its slot".into()));
		}
		let value = codec.decode(&buf[SEALED_HEADER_SIZE..SEALED_HEADER_SIZE + sealed_size])?;
		if value.len() != original_size {
			return Err(Error::Corruption(format!(
				"Decoded {} bytes, header says {}",
				value.len(),
				original_size
			)));
		}
		Ok(Some(value))
	}
}

/// Read and decode the record an index entry points at.
pub fn read_record(file: &DbFile, codec: &Codec, entry: &Entry) -> Result<Option<Vec<u8>>> {
	if !entry.is_confirmed() || entry.value_length <= 0 {
		return Ok(None);
	}
	let mut buf = vec![0u8; entry.value_length as usize];
	file.read_at(&mut buf, entry.value_position as u64)?;
	decode_record(codec, &buf)
}

/// Flip the tombstone byte of the record at `position`.
pub fn write_tombstone(file: &DbFile, codec: &Codec, position: i64) -> Result<()> {
	let offset = if codec.is_identity() { PLAIN_DELETED_OFFSET } else { SEALED_DELETED_OFFSET };
	file.write_at(&[1u8], position as u64 + offset)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::codec::{CompressionType, EncryptionType};
	use crate::index::Entry;

	struct TempDir(std::path::PathBuf);

	impl TempDir {
		fn new(name: &'static str) -> TempDir {
			env_logger::try_init().ok();
			let mut path = std::env::temp_dir();
			path.push("ultrakv-test");
			path.push("table");
			path.push(name);

			if path.exists() {
				std::fs::remove_dir_all(&path).unwrap();
			}
			std::fs::create_dir_all(&path).unwrap();
			TempDir(path)
		}

		fn file(&self) -> DbFile {
			let mut path = self.0.clone();
			path.push("db");
			DbFile::open(&path).unwrap()
		}
	}

	impl Drop for TempDir {
		fn drop(&mut self) {
			if self.0.exists() {
				std::fs::remove_dir_all(&self.0).unwrap();
			}
		}
	}

	fn identity() -> Codec {
		Codec::new(CompressionType::NoCompression, EncryptionType::NoEncryption, None).unwrap()
	}

	fn sealed() -> Codec {
		Codec::new(
			CompressionType::Lz4,
			EncryptionType::Aes256Gcm,
			Some("0123456789abcdef"),
		)
		.unwrap()
	}

	fn entry_for(position: i64, length: usize) -> Entry {
		Entry {
			is_deleted: false,
			page_index: 0,
			key_length: 5,
			value_position: position,
			value_length: length as i32,
			value_allocated_length: length as i32,
			timestamp: 7,
		}
	}

	#[test]
	fn plain_record_roundtrip() {
		let codec = identity();
		let record = encode_record(&codec, b"alpha", b"some value", 7).unwrap();
		assert_eq!(record.len(), RECORD_HEADER_SIZE + 5 + 10);
		assert_eq!(decode_record(&codec, &record).unwrap().unwrap(), b"some value");
	}

	#[test]
	fn sealed_record_roundtrip() {
		let codec = sealed();
		let value = vec![42u8; 10000];
		let record = encode_record(&codec, b"alpha", &value, 7).unwrap();
		// Compressible payload shrinks despite the AEAD overhead.
		assert!(record.len() < value.len());
		assert_eq!(decode_record(&codec, &record).unwrap().unwrap(), value);
	}

	#[test]
	fn tombstone_read_back_as_none() {
		let dir = TempDir::new("tombstone_read_back_as_none");
		let file = dir.file();
		for codec in [identity(), sealed()].iter() {
			let record = encode_record(codec, b"alpha", b"some value", 7).unwrap();
			file.write_at(&record, 0).unwrap();
			let entry = entry_for(0, record.len());
			assert_eq!(
				read_record(&file, codec, &entry).unwrap().unwrap(),
				b"some value"
			);

			write_tombstone(&file, codec, 0).unwrap();
			assert_eq!(read_record(&file, codec, &entry).unwrap(), None);
		}
	}

	#[test]
	fn unconfirmed_entry_reads_none() {
		let dir = TempDir::new("unconfirmed_entry_reads_none");
		let file = dir.file();
		let codec = identity();
		let entry = Entry::reserved(0, 5, 7);
		assert_eq!(read_record(&file, &codec, &entry).unwrap(), None);
	}

	#[test]
	fn truncated_record_is_corruption() {
		let codec = identity();
		let record = encode_record(&codec, b"alpha", b"some value", 7).unwrap();
		assert!(decode_record(&codec, &record[0..10]).is_err());
		// Header intact but payload cut short.
		let mut short = record.clone();
		short.truncate(RECORD_HEADER_SIZE + 5 + 4);
		assert!(decode_record(&codec, &short).is_err());
	}
}
