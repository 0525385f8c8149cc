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

/// Point-in-time snapshot of one engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct DbStats {
	pub record_count: usize,
	pub deleted_count: usize,
	pub file_size: u64,
	pub free_bytes: i64,
	pub free_block_count: usize,
	pub fragmentation: f64,
	pub gc_total_count: u32,
	pub created_ms: i64,
	pub last_access_ms: i64,
	pub last_gc_ms: i64,
}

/// Outcome of a shrink pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShrinkResult {
	pub original_size: u64,
	pub new_size: u64,
	pub saved_bytes: i64,
	pub saved_percent: f64,
	pub valid_records: usize,
	pub total_processed: usize,
	pub elapsed_ms: u64,
}

impl ShrinkResult {
	pub fn skipped(size: u64) -> ShrinkResult {
		ShrinkResult {
			original_size: size,
			new_size: size,
			..Default::default()
		}
	}
}
