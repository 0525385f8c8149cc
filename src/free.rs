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

// Free space tracking for the value heap.
//
// Freed regions are kept in memory sorted ascending by size; reservation is
// best-fit (first block large enough). A reserved block substantially larger
// than the request is split and the remainder is kept. Released regions are
// merged with any adjacent block until no adjacency remains, so the list
// never holds two touching blocks.
//
// The list persists into the fixed region at file offset 1024 as an array of
// [POSITION: 8][SIZE: 8] records, FreeSpaceHeader at offset 128. When the
// list outgrows the region the smallest blocks are dropped: they are the
// least useful and the cheapest to leak until the next shrink.

use std::convert::TryInto;

use crate::error::Result;
use crate::file::DbFile;
use crate::header::{
	FreeSpaceHeader, FREE_BLOCK_SIZE, FREE_HEADER_OFFSET, FREE_REGION_OFFSET,
};

/// Minimum split remainder; requests within this of the block size take the
/// whole block.
const WASTE_FLOOR: i64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
	pub position: i64,
	pub size: i64,
}

impl FreeBlock {
	pub fn end(&self) -> i64 {
		self.position + self.size
	}

	fn to_bytes(&self) -> [u8; FREE_BLOCK_SIZE] {
		let mut buf = [0u8; FREE_BLOCK_SIZE];
		buf[0..8].copy_from_slice(&self.position.to_le_bytes());
		buf[8..16].copy_from_slice(&self.size.to_le_bytes());
		buf
	}

	fn from_bytes(buf: &[u8]) -> FreeBlock {
		FreeBlock {
			position: i64::from_le_bytes(buf[0..8].try_into().unwrap()),
			size: i64::from_le_bytes(buf[8..16].try_into().unwrap()),
		}
	}
}

pub struct FreeSpace {
	enabled: bool,
	region_size: usize,
	data_start: i64,
	// Sorted ascending by size.
	blocks: Vec<FreeBlock>,
	dirty: bool,
	alloc_count: u32,
	recycle_count: u32,
	total_recycled: i64,
	largest_block: i64,
	last_used_ms: i64,
}

impl FreeSpace {
	pub fn new(enabled: bool, region_size: usize, data_start: u64) -> FreeSpace {
		FreeSpace {
			enabled: enabled && region_size >= FREE_BLOCK_SIZE,
			region_size,
			data_start: data_start as i64,
			blocks: Vec::new(),
			dirty: false,
			alloc_count: 0,
			recycle_count: 0,
			total_recycled: 0,
			largest_block: 0,
			last_used_ms: 0,
		}
	}

	pub fn enabled(&self) -> bool {
		self.enabled
	}

	pub fn capacity(&self) -> usize {
		self.region_size / FREE_BLOCK_SIZE
	}

	pub fn block_count(&self) -> usize {
		self.blocks.len()
	}

	pub fn total_free(&self) -> i64 {
		self.blocks.iter().map(|b| b.size).sum()
	}

	pub fn largest(&self) -> i64 {
		self.blocks.last().map_or(0, |b| b.size)
	}

	/// `1 - largest / (total / count)`; zero for an empty list.
	pub fn fragmentation(&self) -> f64 {
		if self.blocks.is_empty() {
			return 0.0;
		}
		let average = self.total_free() as f64 / self.blocks.len() as f64;
		1.0 - self.largest() as f64 / average
	}

	#[cfg(test)]
	pub fn blocks(&self) -> &[FreeBlock] {
		&self.blocks
	}

	/// Best-fit reservation. Returns a block of at least `size` bytes, or
	/// None when nothing fits and the caller must append at end of file.
	pub fn try_reserve(&mut self, size: i64, now: i64) -> Option<FreeBlock> {
		if !self.enabled || size <= 0 {
			return None;
		}
		let position = self.blocks.iter().position(|b| b.size >= size)?;
		let block = self.blocks.remove(position);
		let waste_threshold = WASTE_FLOOR.max(size / 4);
		let reserved = if block.size > size + waste_threshold {
			self.insert_sorted(FreeBlock {
				position: block.position + size,
				size: block.size - size,
			});
			FreeBlock { position: block.position, size }
		} else {
			block
		};
		log::trace!(
			target: "ultrakv",
			"Reserved {} bytes at {} from free block of {}",
			reserved.size,
			reserved.position,
			block.size,
		);
		self.alloc_count += 1;
		self.last_used_ms = now;
		self.dirty = true;
		Some(reserved)
	}

	/// Return a region to the list. Ignored when disabled, empty, or below
	/// the data start boundary. Merges with every adjacent block.
	pub fn release(&mut self, position: i64, size: i64, now: i64) {
		if !self.enabled || size <= 0 || position < self.data_start {
			return;
		}
		let mut merged = FreeBlock { position, size };
		loop {
			let adjacent = self
				.blocks
				.iter()
				.position(|b| b.end() == merged.position || merged.end() == b.position);
			match adjacent {
				Some(i) => {
					let other = self.blocks.remove(i);
					merged = FreeBlock {
						position: merged.position.min(other.position),
						size: merged.size + other.size,
					};
				}
				None => break,
			}
		}
		log::trace!(
			target: "ultrakv",
			"Released {} bytes at {}, merged block is {} bytes",
			size,
			position,
			merged.size,
		);
		self.largest_block = self.largest_block.max(merged.size);
		self.insert_sorted(merged);
		self.recycle_count += 1;
		self.total_recycled += size;
		self.last_used_ms = now;
		self.dirty = true;

		// Bounded region: drop the smallest blocks on overflow.
		let capacity = self.capacity();
		while self.blocks.len() > capacity {
			let dropped = self.blocks.remove(0);
			log::debug!(
				target: "ultrakv",
				"Free list full, dropping block of {} bytes at {}",
				dropped.size,
				dropped.position,
			);
		}
	}

	pub fn clear(&mut self) {
		self.blocks.clear();
		self.alloc_count = 0;
		self.recycle_count = 0;
		self.total_recycled = 0;
		self.largest_block = 0;
		self.dirty = true;
	}

	fn insert_sorted(&mut self, block: FreeBlock) {
		let at = self
			.blocks
			.binary_search_by(|b| b.size.cmp(&block.size))
			.unwrap_or_else(|i| i);
		self.blocks.insert(at, block);
	}

	/// Rewrite the header and the whole block region. No-op unless dirty.
	pub fn save(&mut self, file: &DbFile) -> Result<()> {
		if !self.dirty {
			return Ok(());
		}
		let mut header = FreeSpaceHeader::default();
		header.set_enabled(self.enabled);
		header.set_region_size(self.region_size as i32);
		header.set_block_count(self.blocks.len() as i32);
		header.set_alloc_count(self.alloc_count);
		header.set_recycle_count(self.recycle_count);
		header.set_last_used_ms(self.last_used_ms);
		header.set_total_recycled(self.total_recycled);
		header.set_largest_block(self.largest_block);
		header.seal();
		file.write_at(&header.0, FREE_HEADER_OFFSET)?;

		if self.region_size > 0 {
			let mut region = vec![0u8; self.region_size];
			for (i, block) in self.blocks.iter().enumerate() {
				region[i * FREE_BLOCK_SIZE..(i + 1) * FREE_BLOCK_SIZE]
					.copy_from_slice(&block.to_bytes());
			}
			file.write_at(&region, FREE_REGION_OFFSET)?;
		}
		self.dirty = false;
		Ok(())
	}

	/// Restore the list from the fixed region.
	pub fn load(&mut self, file: &DbFile, header: &FreeSpaceHeader) -> Result<()> {
		self.alloc_count = header.alloc_count();
		self.recycle_count = header.recycle_count();
		self.total_recycled = header.total_recycled();
		self.largest_block = header.largest_block();
		self.last_used_ms = header.last_used_ms();
		self.blocks.clear();
		let count = header.block_count().max(0) as usize;
		if count == 0 || !self.enabled {
			return Ok(());
		}
		let count = count.min(self.capacity());
		let mut region = vec![0u8; count * FREE_BLOCK_SIZE];
		file.read_at(&mut region, FREE_REGION_OFFSET)?;
		for chunk in region.chunks(FREE_BLOCK_SIZE) {
			let block = FreeBlock::from_bytes(chunk);
			if block.size > 0 && block.position >= self.data_start {
				self.insert_sorted(block);
			}
		}
		self.dirty = false;
		log::debug!(
			target: "ultrakv",
			"Loaded free list: {} blocks, {} bytes",
			self.blocks.len(),
			self.total_free(),
		);
		Ok(())
	}
}
