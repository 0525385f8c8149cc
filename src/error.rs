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

#[derive(Debug)]
pub enum Error {
	Io(std::io::Error),
	/// Bad magic, unsupported version or a checksum mismatch in any on-disk header.
	Corruption(String),
	/// The codec recorded in the database header disagrees with the supplied options.
	ConfigMismatch(String),
	InvalidConfiguration(String),
	/// Empty key, or the encoded key exceeds the configured maximum.
	BadKey(String),
	/// All 32 index pages exist and none can take another entry.
	IndexFull,
	/// AEAD tag verification failed.
	AuthFailed,
	/// Post-put read-back returned different bytes.
	ValidationFailed(String),
	/// Compaction failed. The original file is left untouched.
	ShrinkFailed(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Error {
		Error::Io(e)
	}
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Error::Io(e) => write!(f, "IO Error: {}", e),
			Error::Corruption(e) => write!(f, "Corruption: {}", e),
			Error::ConfigMismatch(e) => write!(f, "Configuration mismatch: {}", e),
			Error::InvalidConfiguration(e) => write!(f, "Invalid configuration: {}", e),
			Error::BadKey(e) => write!(f, "Bad key: {}", e),
			Error::IndexFull => write!(f, "Index is full"),
			Error::AuthFailed => write!(f, "Authenticated decryption failed"),
			Error::ValidationFailed(e) => write!(f, "Update validation failed: {}", e),
			Error::ShrinkFailed(e) => write!(f, "Shrink failed: {}", e),
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Error::Io(e) => Some(e),
			_ => None,
		}
	}
}
