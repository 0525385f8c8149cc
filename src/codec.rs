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

// Record transform pipeline. Encode compresses then encrypts, decode
// reverses the order. The pipeline is fixed at database creation; the
// database header records both stages and open() rejects a disagreeing
// configuration.
//
// Sealed output layout when encryption is on: [NONCE: 12][AEAD output].
// The nonce is fresh random bytes per seal, so sealing is not
// deterministic and sealed byte strings must never be compared for
// equality.

use std::io::{Read, Write};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

use crate::error::{Error, Result};

pub const NONCE_SIZE: usize = 12;
pub const MIN_ENCRYPTION_KEY_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
	NoCompression,
	Gzip,
	Deflate,
	Brotli,
	Lz4,
	Zstd,
	Snappy,
	Lzma,
}

impl CompressionType {
	pub fn from_u8(value: u8) -> Option<CompressionType> {
		match value {
			0 => Some(CompressionType::NoCompression),
			1 => Some(CompressionType::Gzip),
			2 => Some(CompressionType::Deflate),
			3 => Some(CompressionType::Brotli),
			4 => Some(CompressionType::Lz4),
			5 => Some(CompressionType::Zstd),
			6 => Some(CompressionType::Snappy),
			7 => Some(CompressionType::Lzma),
			_ => None,
		}
	}

	pub fn as_u8(&self) -> u8 {
		match self {
			CompressionType::NoCompression => 0,
			CompressionType::Gzip => 1,
			CompressionType::Deflate => 2,
			CompressionType::Brotli => 3,
			CompressionType::Lz4 => 4,
			CompressionType::Zstd => 5,
			CompressionType::Snappy => 6,
			CompressionType::Lzma => 7,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
	NoEncryption,
	Aes256Gcm,
}

impl EncryptionType {
	pub fn from_u8(value: u8) -> Option<EncryptionType> {
		match value {
			0 => Some(EncryptionType::NoEncryption),
			1 => Some(EncryptionType::Aes256Gcm),
			_ => None,
		}
	}

	pub fn as_u8(&self) -> u8 {
		match self {
			EncryptionType::NoEncryption => 0,
			EncryptionType::Aes256Gcm => 1,
		}
	}
}

pub struct Codec {
	compression: CompressionType,
	encryption: EncryptionType,
	cipher: Option<Aes256Gcm>,
}

impl Codec {
	pub fn new(
		compression: CompressionType,
		encryption: EncryptionType,
		key: Option<&str>,
	) -> Result<Codec> {
		let cipher = match encryption {
			EncryptionType::NoEncryption => None,
			EncryptionType::Aes256Gcm => {
				let key = key.ok_or_else(|| {
					Error::InvalidConfiguration("Encryption enabled without a key".into())
				})?;
				if key.len() < MIN_ENCRYPTION_KEY_LEN {
					return Err(Error::InvalidConfiguration(format!(
						"Encryption key must be at least {} bytes",
						MIN_ENCRYPTION_KEY_LEN
					)));
				}
				let derived = blake2_rfc::blake2b::blake2b(32, &[], key.as_bytes());
				let cipher = Aes256Gcm::new_from_slice(derived.as_bytes()).map_err(|_| {
					Error::InvalidConfiguration("Failed to initialize cipher".into())
				})?;
				Some(cipher)
			}
		};
		Ok(Codec { compression, encryption, cipher })
	}

	pub fn compression(&self) -> CompressionType {
		self.compression
	}

	pub fn encryption(&self) -> EncryptionType {
		self.encryption
	}

	/// True when neither stage transforms bytes. Records then use the plain
	/// header layout and keys are stored verbatim.
	pub fn is_identity(&self) -> bool {
		self.compression == CompressionType::NoCompression && self.cipher.is_none()
	}

	pub fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
		let compressed = self.compress(data)?;
		match &self.cipher {
			None => Ok(compressed),
			Some(cipher) => {
				let mut nonce = [0u8; NONCE_SIZE];
				rand::thread_rng().fill_bytes(&mut nonce);
				let sealed = cipher
					.encrypt(Nonce::from_slice(&nonce), compressed.as_slice())
					.map_err(|_| Error::Corruption("AEAD seal failed".into()))?;
				let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
				out.extend_from_slice(&nonce);
				out.extend_from_slice(&sealed);
				Ok(out)
			}
		}
	}

	pub fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
		let compressed = match &self.cipher {
			None => data.to_vec(),
			Some(cipher) => {
				if data.len() < NONCE_SIZE {
					return Err(Error::AuthFailed);
				}
				let (nonce, sealed) = data.split_at(NONCE_SIZE);
				cipher
					.decrypt(Nonce::from_slice(nonce), sealed)
					.map_err(|_| Error::AuthFailed)?
			}
		};
		self.decompress(&compressed)
	}

	fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
		Ok(match self.compression {
			CompressionType::NoCompression => data.to_vec(),
			CompressionType::Gzip => {
				let mut encoder =
					flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
				encoder.write_all(data)?;
				encoder.finish()?
			}
			CompressionType::Deflate => {
				let mut encoder =
					flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
				encoder.write_all(data)?;
				encoder.finish()?
			}
			CompressionType::Brotli => {
				let mut out = Vec::new();
				let params = brotli::enc::BrotliEncoderParams::default();
				brotli::BrotliCompress(&mut &data[..], &mut out, &params)?;
				out
			}
			CompressionType::Lz4 => lz4::block::compress(data, None, true)?,
			CompressionType::Zstd => zstd::encode_all(data, 0)?,
			CompressionType::Snappy => snap::raw::Encoder::new()
				.compress_vec(data)
				.map_err(|e| Error::Corruption(format!("Snappy: {}", e)))?,
			CompressionType::Lzma => {
				let mut out = Vec::new();
				lzma_rs::lzma_compress(&mut &data[..], &mut out)?;
				out
			}
		})
	}

	fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
		Ok(match self.compression {
			CompressionType::NoCompression => data.to_vec(),
			CompressionType::Gzip => {
				let mut out = Vec::new();
				flate2::read::GzDecoder::new(data).read_to_end(&mut out)?;
				out
			}
			CompressionType::Deflate => {
				let mut out = Vec::new();
				flate2::read::DeflateDecoder::new(data).read_to_end(&mut out)?;
				out
			}
			CompressionType::Brotli => {
				let mut out = Vec::new();
				brotli::BrotliDecompress(&mut &data[..], &mut out)?;
				out
			}
			CompressionType::Lz4 => lz4::block::decompress(data, None)?,
			CompressionType::Zstd => zstd::decode_all(data)?,
			CompressionType::Snappy => snap::raw::Decoder::new()
				.decompress_vec(data)
				.map_err(|e| Error::Corruption(format!("Snappy: {}", e)))?,
			CompressionType::Lzma => {
				let mut out = Vec::new();
				lzma_rs::lzma_decompress(&mut &data[..], &mut out)
					.map_err(|e| Error::Corruption(format!("Lzma: {:?}", e)))?;
				out
			}
		})
	}
}
