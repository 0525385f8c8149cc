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

// Positional file access shared by the allocator, the index and the value
// heap. The handle is swapped in place after a successful shrink rename;
// everything else keeps going through the same `DbFile`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use fs2::FileExt;
use parking_lot::RwLock;

use crate::error::Result;

#[cfg(target_os = "macos")]
fn disable_read_ahead(file: &std::fs::File) -> Result<()> {
	use std::os::unix::io::AsRawFd;
	if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_RDAHEAD, 0) } != 0 {
		Err(std::io::Error::last_os_error())?
	} else {
		Ok(())
	}
}

#[cfg(not(target_os = "macos"))]
fn disable_read_ahead(_file: &std::fs::File) -> Result<()> {
	Ok(())
}

pub struct DbFile {
	path: PathBuf,
	file: RwLock<std::fs::File>,
	len: AtomicU64,
	dirty: AtomicBool,
}

impl DbFile {
	pub fn open(path: &Path) -> Result<DbFile> {
		let file = std::fs::OpenOptions::new()
			.create(true)
			.read(true)
			.write(true)
			.open(path)?;
		file.try_lock_exclusive()?;
		disable_read_ahead(&file)?;
		let len = file.metadata()?.len();
		Ok(DbFile {
			path: path.into(),
			file: RwLock::new(file),
			len: AtomicU64::new(len),
			dirty: AtomicBool::new(false),
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn len(&self) -> u64 {
		self.len.load(Ordering::Relaxed)
	}

	#[cfg(unix)]
	pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
		use std::os::unix::fs::FileExt;
		Ok(self.file.read().read_exact_at(buf, offset)?)
	}

	#[cfg(unix)]
	pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
		self.dirty.store(true, Ordering::Relaxed);
		let end = offset + buf.len() as u64;
		let file = self.file.read();
		{
			use std::os::unix::fs::FileExt;
			file.write_all_at(buf, offset)?;
		}
		self.len.fetch_max(end, Ordering::Relaxed);
		Ok(())
	}

	#[cfg(windows)]
	pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
		use std::os::windows::fs::FileExt;
		let file = self.file.read();
		let mut read = 0;
		while read < buf.len() {
			let n = file.seek_read(&mut buf[read..], offset + read as u64)?;
			if n == 0 {
				return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
			}
			read += n;
		}
		Ok(())
	}

	#[cfg(windows)]
	pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
		use std::os::windows::fs::FileExt;
		self.dirty.store(true, Ordering::Relaxed);
		let end = offset + buf.len() as u64;
		let file = self.file.read();
		let mut written = 0;
		while written < buf.len() {
			written += file.seek_write(&buf[written..], offset + written as u64)?;
		}
		self.len.fetch_max(end, Ordering::Relaxed);
		Ok(())
	}

	/// Extend the file to `new_len` bytes. Used by the end-of-file
	/// allocation path to preallocate the full multiplied slot.
	pub fn grow(&self, new_len: u64) -> Result<()> {
		if new_len <= self.len.load(Ordering::Relaxed) {
			return Ok(());
		}
		self.dirty.store(true, Ordering::Relaxed);
		self.file.read().set_len(new_len)?;
		self.len.fetch_max(new_len, Ordering::Relaxed);
		Ok(())
	}

	pub fn truncate(&self, new_len: u64) -> Result<()> {
		self.dirty.store(true, Ordering::Relaxed);
		self.file.read().set_len(new_len)?;
		self.len.store(new_len, Ordering::Relaxed);
		Ok(())
	}

	pub fn sync(&self) -> Result<()> {
		if let Ok(true) =
			self.dirty.compare_exchange(true, false, Ordering::Relaxed, Ordering::Relaxed)
		{
			self.file.read().sync_data()?;
		}
		Ok(())
	}
}
