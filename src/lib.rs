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

//! Embedded single-file key-value storage engine.
//!
//! One [`Db`] owns one file holding a fixed database header, a free-space
//! region, a paged key index and a value heap. String keys map to binary
//! values of up to 2 GiB; records can be compressed and sealed with
//! AES-256-GCM, both fixed at creation time. Deleted space is recycled
//! through a best-fit free list and fully reclaimed by [`Db::shrink`], a
//! crash-tolerant rebuild behind an atomic file swap.
//!
//! ```no_run
//! use ultrakv::{Db, Options};
//!
//! let db = Db::open("./my.db", Options::default())?;
//! db.put("alpha", b"value")?;
//! assert_eq!(db.get("alpha").as_deref(), Some(&b"value"[..]));
//! db.delete("alpha")?;
//! # Ok::<(), ultrakv::Error>(())
//! ```

mod codec;
mod db;
mod display;
mod error;
mod file;
mod free;
mod header;
mod index;
mod options;
mod shrink;
mod stats;
mod table;

pub use codec::{CompressionType, EncryptionType};
pub use db::Db;
pub use error::{Error, Result};
pub use index::IndexStats;
pub use options::Options;
pub use stats::{DbStats, ShrinkResult};
