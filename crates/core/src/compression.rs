//! Compression of spilled sort chunks.
//!
//! Chunk files can optionally be compressed to trade CPU for disk I/O:
//! - None: raw framed entries (fastest, largest)
//! - Gzip: flate2 at a fast level
//! - Zstd: level 1
//! - Brotli: quality 1
//!
//! The choice is made once per sort run. [`SpillWriter`] and [`SpillReader`]
//! wrap any byte sink/source, so chunk code reads and writes the same framed
//! stream regardless of the codec underneath.

use std::io::{self, BufReader, Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

const GZIP_LEVEL: u32 = 1;
const ZSTD_LEVEL: i32 = 1;
const BROTLI_QUALITY: u32 = 1;
const BROTLI_LGWIN: u32 = 22;
const BROTLI_BUFFER: usize = 64 * 1024;

/// Codec applied to spilled chunk files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Zstd,
    Brotli,
}

impl Compression {
    /// Parse compression from string (case-insensitive).
    ///
    /// Valid values: "none", "gzip", "zstd", "brotli"
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(Compression::None),
            "gzip" => Some(Compression::Gzip),
            "zstd" => Some(Compression::Zstd),
            "brotli" => Some(Compression::Brotli),
            _ => Option::None,
        }
    }

    /// Get a human-readable name for this compression type.
    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
            Compression::Brotli => "brotli",
        }
    }

    /// Wrap a byte sink in the matching encoder.
    pub fn writer<W: Write>(&self, inner: W) -> io::Result<SpillWriter<W>> {
        Ok(match self {
            Compression::None => SpillWriter::Plain(inner),
            Compression::Gzip => {
                SpillWriter::Gzip(GzEncoder::new(inner, flate2::Compression::new(GZIP_LEVEL)))
            }
            Compression::Zstd => SpillWriter::Zstd(zstd::Encoder::new(inner, ZSTD_LEVEL)?),
            Compression::Brotli => SpillWriter::Brotli(brotli::CompressorWriter::new(
                inner,
                BROTLI_BUFFER,
                BROTLI_QUALITY,
                BROTLI_LGWIN,
            )),
        })
    }

    /// Wrap a byte source in the matching decoder.
    pub fn reader<R: Read>(&self, inner: R) -> io::Result<SpillReader<R>> {
        Ok(match self {
            Compression::None => SpillReader::Plain(inner),
            Compression::Gzip => SpillReader::Gzip(GzDecoder::new(inner)),
            Compression::Zstd => SpillReader::Zstd(zstd::Decoder::new(inner)?),
            Compression::Brotli => {
                SpillReader::Brotli(brotli::Decompressor::new(inner, BROTLI_BUFFER))
            }
        })
    }
}

/// Encoder side of a spill stream.
pub enum SpillWriter<W: Write> {
    Plain(W),
    Gzip(GzEncoder<W>),
    Zstd(zstd::Encoder<'static, W>),
    Brotli(brotli::CompressorWriter<W>),
}

impl<W: Write> SpillWriter<W> {
    /// Write any trailer and return the underlying sink.
    pub fn finish(self) -> io::Result<W> {
        match self {
            SpillWriter::Plain(w) => Ok(w),
            SpillWriter::Gzip(w) => w.finish(),
            SpillWriter::Zstd(w) => w.finish(),
            SpillWriter::Brotli(w) => Ok(w.into_inner()),
        }
    }
}

impl<W: Write> Write for SpillWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SpillWriter::Plain(w) => w.write(buf),
            SpillWriter::Gzip(w) => w.write(buf),
            SpillWriter::Zstd(w) => w.write(buf),
            SpillWriter::Brotli(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SpillWriter::Plain(w) => w.flush(),
            SpillWriter::Gzip(w) => w.flush(),
            SpillWriter::Zstd(w) => w.flush(),
            SpillWriter::Brotli(w) => w.flush(),
        }
    }
}

/// Decoder side of a spill stream.
pub enum SpillReader<R: Read> {
    Plain(R),
    Gzip(GzDecoder<R>),
    Zstd(zstd::Decoder<'static, BufReader<R>>),
    Brotli(brotli::Decompressor<R>),
}

impl<R: Read> Read for SpillReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            SpillReader::Plain(r) => r.read(buf),
            SpillReader::Gzip(r) => r.read(buf),
            SpillReader::Zstd(r) => r.read(buf),
            SpillReader::Brotli(r) => r.read(buf),
        }
    }
}
