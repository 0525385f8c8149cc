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

// Crash-tolerant compaction.
//
// A complete replacement file is assembled at `path.tmp`: fresh headers, an
// empty free list, one consolidated index page holding every live entry,
// then the live value slots packed back to back. Only once the tmp file is
// synced does the swap happen: `path` -> `path.bak`, `tmp` -> `path`. A
// failure before the second rename leaves the original file untouched; a
// crash between the renames is healed at the next open by renaming the bak
// back. The bak file is deleted once the new file is installed.
//
// The rebuild is also the recovery path for a free-space configuration
// change at open: the target geometry comes from the incoming options, not
// from the old header.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::codec::Codec;
use crate::db::DbShared;
use crate::error::{Error, Result};
use crate::file::DbFile;
use crate::free::FreeSpace;
use crate::header::{
	data_start_position, DatabaseHeader, INDEX_ENTRY_SIZE, INDEX_PAGE_HEADER_SIZE,
};
use crate::index::{Entry, IndexManager, IndexPage, Slot};
use crate::options::Options;
use crate::stats::ShrinkResult;

pub fn suffixed(path: &Path, suffix: &str) -> PathBuf {
	let mut name = path.as_os_str().to_os_string();
	name.push(suffix);
	PathBuf::from(name)
}

pub fn rebuild(
	shared: &mut DbShared,
	options: &Options,
	codec: &Codec,
	now: i64,
) -> Result<ShrinkResult> {
	let start = std::time::Instant::now();
	let path = shared.file.path().to_path_buf();
	let tmp_path = suffixed(&path, ".tmp");
	let bak_path = suffixed(&path, ".bak");
	let original_size = shared.file.len();
	let total_processed = shared.index.stats().total_entries as usize;

	// The rebuild walks the live key map; keys still parked from open must
	// authenticate first or live records would be dropped.
	shared.index.materialize_keys(codec)?;

	log::info!(
		target: "ultrakv",
		"Rebuilding {}: {} bytes, {} live keys",
		path.display(),
		original_size,
		shared.index.len(),
	);

	let built = build_replacement(shared, options, codec, &tmp_path, now);
	let (tmp_file, header, free, index, data_start, valid_records) = match built {
		Ok(parts) => parts,
		Err(e) => {
			let _ = std::fs::remove_file(&tmp_path);
			return Err(match e {
				Error::ShrinkFailed(_) => e,
				other => Error::ShrinkFailed(other.to_string()),
			});
		}
	};

	// Swap. The original stays intact until the second rename succeeds.
	drop(tmp_file);
	if let Err(e) = std::fs::rename(&path, &bak_path) {
		let _ = std::fs::remove_file(&tmp_path);
		return Err(Error::ShrinkFailed(format!("Backup rename failed: {}", e)));
	}
	if let Err(e) = std::fs::rename(&tmp_path, &path) {
		let _ = std::fs::rename(&bak_path, &path);
		let _ = std::fs::remove_file(&tmp_path);
		return Err(Error::ShrinkFailed(format!("Install rename failed: {}", e)));
	}

	let new_file = match DbFile::open(&path) {
		Ok(file) => file,
		Err(e) => return Err(Error::ShrinkFailed(format!("Reopen failed: {}", e))),
	};
	let new_size = new_file.len();
	shared.file = new_file;
	shared.header = header;
	shared.free = free;
	shared.index = index;
	shared.data_start = data_start;

	if let Err(e) = std::fs::remove_file(&bak_path) {
		log::warn!(target: "ultrakv", "Leaving {}: {}", bak_path.display(), e);
	}

	let saved_bytes = original_size as i64 - new_size as i64;
	let result = ShrinkResult {
		original_size,
		new_size,
		saved_bytes,
		saved_percent: if original_size == 0 {
			0.0
		} else {
			saved_bytes as f64 * 100.0 / original_size as f64
		},
		valid_records,
		total_processed,
		elapsed_ms: start.elapsed().as_millis() as u64,
	};
	log::info!(
		target: "ultrakv",
		"Rebuilt {}: {} -> {} bytes ({:.1}% saved), {} records, {} ms",
		path.display(),
		result.original_size,
		result.new_size,
		result.saved_percent,
		result.valid_records,
		result.elapsed_ms,
	);
	Ok(result)
}

fn build_replacement(
	shared: &DbShared,
	options: &Options,
	codec: &Codec,
	tmp_path: &Path,
	now: i64,
) -> Result<(DbFile, DatabaseHeader, FreeSpace, IndexManager, u64, usize)> {
	if tmp_path.exists() {
		std::fs::remove_file(tmp_path)?;
	}
	let tmp = DbFile::open(tmp_path)?;
	tmp.truncate(0)?;

	let created_ms = shared.header.created_ms();
	let mut header = options.new_header(created_ms, now);
	header.set_last_gc_ms(now);
	header.set_gc_total_count(shared.header.gc_total_count() + 1);
	header.seal();
	tmp.write_at(&header.0, 0)?;

	let region = options.region_bytes();
	let data_start = data_start_position(region);
	let mut free = FreeSpace::new(options.free_space_enabled(), region as usize, data_start);
	free.clear();
	free.save(&tmp)?;

	// Merge every live entry into a single consolidated page.
	let mut entries = shared.index.collect_active();
	entries.retain(|(_, entry)| entry.is_confirmed());
	// Copy in file order.
	entries.sort_by_key(|(_, entry)| entry.value_position);

	let mut encoded: Vec<(String, Vec<u8>, Entry)> = Vec::with_capacity(entries.len());
	let mut total_size = INDEX_PAGE_HEADER_SIZE as u64;
	for (key, entry) in entries {
		let encoded_key =
			if codec.is_identity() { key.as_bytes().to_vec() } else { codec.encode(key.as_bytes())? };
		total_size += (INDEX_ENTRY_SIZE + encoded_key.len()) as u64;
		encoded.push((key, encoded_key, entry));
	}
	if total_size > i32::max_value() as u64 {
		return Err(Error::ShrinkFailed(format!(
			"Consolidated index of {} bytes cannot be addressed",
			total_size
		)));
	}
	let page_size = (total_size as usize)
		.max(options.default_page_size())
		.checked_add(1023)
		.map(|s| s / 1024 * 1024)
		.unwrap();

	let mut page = IndexPage::new(0, data_start, page_size, now);
	let mut cache = HashMap::with_capacity(encoded.len());
	let mut write_pos = data_start + page_size as u64;
	let mut copy_buf =
		vec![0u8; (options.read_buffer_size_kb.max(4) as usize * 1024).max(4096)];
	let mut valid_records = 0;

	for (key, encoded_key, old_entry) in encoded {
		let allocated = old_entry.value_allocated_length.max(old_entry.value_length) as u64;
		// Copy the whole slot, slack included, in buffer-sized chunks.
		let mut copied = 0u64;
		while copied < allocated {
			let chunk = ((allocated - copied) as usize).min(copy_buf.len());
			shared
				.file
				.read_at(&mut copy_buf[0..chunk], old_entry.value_position as u64 + copied)?;
			tmp.write_at(&copy_buf[0..chunk], write_pos + copied)?;
			copied += chunk as u64;
		}

		let mut entry = old_entry;
		entry.page_index = 0;
		entry.key_length = encoded_key.len() as i32;
		entry.value_position = write_pos as i64;
		entry.value_allocated_length = allocated as i32;
		entry.timestamp = now;
		let offset = page
			.append(&entry, &encoded_key, now)
			.ok_or_else(|| Error::ShrinkFailed("Consolidated page overflow".into()))?;
		cache.insert(key, Slot { entry, offset });
		write_pos += allocated;
		valid_records += 1;
	}

	page.persist(&tmp)?;
	let index =
		IndexManager::adopt(data_start, options.default_page_size(), created_ms, page, cache);
	index.write_meta(&tmp, now)?;

	tmp.truncate(write_pos.max(data_start + page_size as u64))?;
	tmp.sync()?;
	Ok((tmp, header, free, index, data_start, valid_records))
}
