//! The compression codec registry.
//!
//! Codecs expose one uniform capability set: whole-buffer compression for
//! the writer ([`Compressor`]) and frame-incremental decompression for the
//! block cache ([`FrameDecoder`]). Codecs are addressed by name through
//! [`CodecRegistry`], seeded with the built-in set at startup; bindings
//! like `zstd:level=19` parse a codec name plus options.
//!
//! Compression that does not actually shrink the input is reported as
//! [`Error::is_bad_ratio`]; the writer decides whether to store such a
//! block uncompressed.

use std::{collections::BTreeMap, fmt, io::Read};

use crate::section::CompressAlgo;

type Result<T, E = Error> = std::result::Result<T, E>;

/// An error from creating or running a codec.
pub struct Error(Box<ErrorInner>);

#[derive(Debug)]
enum ErrorInner {
    UnknownCodec(String),
    Unsupported(&'static str),
    BadOptions(String),
    BadRatio { compressed: usize, original: usize },
    Codec(std::io::Error),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ErrorInner::UnknownCodec(name) => write!(f, "unknown compression codec: {name}"),
            ErrorInner::Unsupported(name) => {
                write!(f, "compression codec {name} is not supported by this build")
            }
            ErrorInner::BadOptions(msg) => write!(f, "bad codec options: {msg}"),
            ErrorInner::BadRatio { compressed, original } => write!(
                f,
                "bad compression ratio: {compressed} bytes compressed from {original}"
            ),
            ErrorInner::Codec(err) => write!(f, "codec failure: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::Codec(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ErrorInner> for Error {
    #[cold]
    fn from(inner: ErrorInner) -> Self {
        Self(Box::new(inner))
    }
}

impl Error {
    /// Whether this is the compressed-not-smaller condition, the only codec
    /// failure a writer is allowed to recover from.
    pub fn is_bad_ratio(&self) -> bool {
        matches!(&*self.0, ErrorInner::BadRatio { .. })
    }
}

/// A whole-buffer compressor bound to fixed parameters.
pub trait Compressor: Send + Sync {
    /// The on-disk algorithm tag written into section headers.
    fn algo(&self) -> CompressAlgo;

    /// A human-readable description including parameters.
    fn describe(&self) -> String;

    /// Compress `data`. Fails with a bad-ratio error if the output would
    /// not be strictly smaller than the input.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Names of category metadata entries this codec needs (for example a
    /// PCM sample layout). Empty for general-purpose codecs.
    fn metadata_requirements(&self) -> &[&'static str] {
        &[]
    }
}

/// Incremental decompression in caller-sized frames.
pub trait FrameDecoder: Send {
    /// Append up to `budget` decompressed bytes to `out`.
    ///
    /// Returns `true` once the compressed stream is exhausted. `out` is
    /// only ever appended to.
    fn decompress_frame(&mut self, out: &mut Vec<u8>, budget: usize) -> std::io::Result<bool>;
}

/// Create a frame decoder over an owned compressed payload.
pub fn decoder(algo: CompressAlgo, data: Vec<u8>) -> Result<Box<dyn FrameDecoder>, crate::section::Error> {
    match algo {
        CompressAlgo::NONE => Ok(Box::new(StoredDecoder { data, pos: 0 })),
        #[cfg(feature = "zstd")]
        CompressAlgo::ZSTD => {
            let rdr = zstd::stream::read::Decoder::new(std::io::Cursor::new(data))
                .map_err(crate::section::decompress_error)?;
            Ok(Box::new(ReaderDecoder(rdr)))
        }
        #[cfg(feature = "lzma")]
        CompressAlgo::LZMA => Ok(Box::new(ReaderDecoder(xz2::read::XzDecoder::new(
            std::io::Cursor::new(data),
        )))),
        #[cfg(feature = "brotli")]
        CompressAlgo::BROTLI => Ok(Box::new(ReaderDecoder(brotli::Decompressor::new(
            std::io::Cursor::new(data),
            1 << 16,
        )))),
        #[cfg(feature = "lz4")]
        CompressAlgo::LZ4 | CompressAlgo::LZ4HC => Ok(Box::new(Lz4Decoder(Some(data)))),
        algo => Err(crate::section::unsupported_compression(algo)),
    }
}

/// Decompress a whole payload, bounded by `size_limit`.
pub fn decompress(
    algo: CompressAlgo,
    data: &[u8],
    size_limit: usize,
) -> Result<Vec<u8>, crate::section::Error> {
    const FRAME: usize = 1 << 20;

    if algo == CompressAlgo::NONE {
        return Ok(data.to_vec());
    }
    let mut dec = decoder(algo, data.to_vec())?;
    let mut out = Vec::new();
    loop {
        let budget = FRAME.min(size_limit - out.len() + 1);
        match dec.decompress_frame(&mut out, budget) {
            Ok(true) if out.len() <= size_limit => return Ok(out),
            Ok(_) if out.len() > size_limit => {
                return Err(crate::section::decompress_error(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("decompressed payload exceeds {size_limit} bytes"),
                )));
            }
            Ok(_) => {}
            Err(err) => return Err(crate::section::decompress_error(err)),
        }
    }
}

struct StoredDecoder {
    data: Vec<u8>,
    pos: usize,
}

impl FrameDecoder for StoredDecoder {
    fn decompress_frame(&mut self, out: &mut Vec<u8>, budget: usize) -> std::io::Result<bool> {
        let n = budget.min(self.data.len() - self.pos);
        out.extend_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(self.pos == self.data.len())
    }
}

/// Adapts any streaming [`Read`] decompressor to frame-wise decoding.
struct ReaderDecoder<R>(R);

impl<R: Read + Send> FrameDecoder for ReaderDecoder<R> {
    fn decompress_frame(&mut self, out: &mut Vec<u8>, budget: usize) -> std::io::Result<bool> {
        let start = out.len();
        out.resize(start + budget, 0);
        let mut filled = 0;
        loop {
            match self.0.read(&mut out[start + filled..]) {
                Ok(0) => {
                    out.truncate(start + filled);
                    return Ok(true);
                }
                Ok(n) => {
                    filled += n;
                    if filled == budget {
                        return Ok(false);
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    out.truncate(start);
                    return Err(err);
                }
            }
        }
    }
}

/// LZ4 block format has no streaming decode; the whole block is one frame.
#[cfg(feature = "lz4")]
struct Lz4Decoder(Option<Vec<u8>>);

#[cfg(feature = "lz4")]
impl FrameDecoder for Lz4Decoder {
    fn decompress_frame(&mut self, out: &mut Vec<u8>, _budget: usize) -> std::io::Result<bool> {
        if let Some(data) = self.0.take() {
            let decoded = lz4::block::decompress(&data, None)?;
            out.extend_from_slice(&decoded);
        }
        Ok(true)
    }
}

fn check_ratio(compressed: Vec<u8>, original: usize) -> Result<Vec<u8>> {
    if compressed.len() < original {
        Ok(compressed)
    } else {
        bail!(ErrorInner::BadRatio { compressed: compressed.len(), original })
    }
}

/// The no-op codec: stores data verbatim and never reports a bad ratio.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullCompressor;

impl Compressor for NullCompressor {
    fn algo(&self) -> CompressAlgo {
        CompressAlgo::NONE
    }

    fn describe(&self) -> String {
        "null".into()
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

#[cfg(feature = "zstd")]
struct ZstdCompressor {
    level: i32,
}

#[cfg(feature = "zstd")]
impl Compressor for ZstdCompressor {
    fn algo(&self) -> CompressAlgo {
        CompressAlgo::ZSTD
    }

    fn describe(&self) -> String {
        format!("zstd [level={}]", self.level)
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let out = zstd::bulk::compress(data, self.level).map_err(ErrorInner::Codec)?;
        check_ratio(out, data.len())
    }
}

#[cfg(feature = "lzma")]
struct LzmaCompressor {
    preset: u32,
}

#[cfg(feature = "lzma")]
impl Compressor for LzmaCompressor {
    fn algo(&self) -> CompressAlgo {
        CompressAlgo::LZMA
    }

    fn describe(&self) -> String {
        format!("lzma [preset={}]", self.preset)
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        xz2::read::XzEncoder::new(data, self.preset)
            .read_to_end(&mut out)
            .map_err(ErrorInner::Codec)?;
        check_ratio(out, data.len())
    }
}

#[cfg(feature = "lz4")]
struct Lz4Compressor {
    /// `None` for fast mode, `Some(level)` for HC.
    hc_level: Option<i32>,
}

#[cfg(feature = "lz4")]
impl Compressor for Lz4Compressor {
    fn algo(&self) -> CompressAlgo {
        if self.hc_level.is_some() { CompressAlgo::LZ4HC } else { CompressAlgo::LZ4 }
    }

    fn describe(&self) -> String {
        match self.hc_level {
            Some(level) => format!("lz4hc [level={level}]"),
            None => "lz4".into(),
        }
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mode = match self.hc_level {
            Some(level) => lz4::block::CompressionMode::HIGHCOMPRESSION(level),
            None => lz4::block::CompressionMode::DEFAULT,
        };
        // The uncompressed size is prepended; the decoder relies on it.
        let out = lz4::block::compress(data, Some(mode), true).map_err(ErrorInner::Codec)?;
        check_ratio(out, data.len())
    }
}

#[cfg(feature = "brotli")]
struct BrotliCompressor {
    quality: u32,
    window: u32,
}

#[cfg(feature = "brotli")]
impl Compressor for BrotliCompressor {
    fn algo(&self) -> CompressAlgo {
        CompressAlgo::BROTLI
    }

    fn describe(&self) -> String {
        format!("brotli [quality={}, lgwin={}]", self.quality, self.window)
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let params = brotli::enc::BrotliEncoderParams {
            quality: self.quality as i32,
            lgwin: self.window as i32,
            ..Default::default()
        };
        let mut out = Vec::new();
        brotli::BrotliCompress(&mut &data[..], &mut out, &params).map_err(ErrorInner::Codec)?;
        check_ratio(out, data.len())
    }
}

/// Parsed `name[:key=value]...` codec binding options.
#[derive(Debug, Clone, Default)]
struct Options(BTreeMap<String, String>);

impl Options {
    fn parse(parts: std::str::Split<'_, char>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for part in parts {
            let (key, value) = match part.split_once('=') {
                Some(kv) => kv,
                // A bare value is shorthand for the codec's level knob.
                None => ("level", part),
            };
            if map.insert(key.to_owned(), value.to_owned()).is_some() {
                bail!(ErrorInner::BadOptions(format!("duplicate option {key}")));
            }
        }
        Ok(Self(map))
    }

    fn take_int<T: std::str::FromStr>(&mut self, key: &str) -> Result<Option<T>> {
        match self.0.remove(key) {
            None => Ok(None),
            Some(raw) => match raw.parse() {
                Ok(v) => Ok(Some(v)),
                Err(_) => bail!(ErrorInner::BadOptions(format!("invalid value for {key}: {raw}"))),
            },
        }
    }

    fn finish(self, codec: &str) -> Result<()> {
        if let Some(key) = self.0.into_keys().next() {
            bail!(ErrorInner::BadOptions(format!("unknown option {key} for codec {codec}")));
        }
        Ok(())
    }
}

type Factory = fn(Options) -> Result<Box<dyn Compressor>>;

/// The name-to-factory codec mapping.
///
/// [`CodecRegistry::default`] seeds every codec this build knows about,
/// including names that are recognized but unsupported (`flac`,
/// `ricepp`), which fail at creation time.
pub struct CodecRegistry {
    factories: BTreeMap<&'static str, Factory>,
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("codecs", &self.names().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut factories = BTreeMap::<&'static str, Factory>::new();
        factories.insert("null", |opts| {
            opts.finish("null")?;
            Ok(Box::new(NullCompressor))
        });
        #[cfg(feature = "zstd")]
        factories.insert("zstd", |mut opts| {
            let level = opts.take_int("level")?.unwrap_or(19);
            opts.finish("zstd")?;
            if !(-22..=22).contains(&level) {
                bail!(ErrorInner::BadOptions(format!("zstd level {level} out of range")));
            }
            Ok(Box::new(ZstdCompressor { level }))
        });
        #[cfg(feature = "lzma")]
        factories.insert("lzma", |mut opts| {
            let preset = opts.take_int("level")?.unwrap_or(9u32);
            opts.finish("lzma")?;
            if preset > 9 {
                bail!(ErrorInner::BadOptions(format!("lzma preset {preset} out of range")));
            }
            Ok(Box::new(LzmaCompressor { preset }))
        });
        #[cfg(feature = "lz4")]
        {
            factories.insert("lz4", |opts| {
                opts.finish("lz4")?;
                Ok(Box::new(Lz4Compressor { hc_level: None }))
            });
            factories.insert("lz4hc", |mut opts| {
                let level = opts.take_int("level")?.unwrap_or(9);
                opts.finish("lz4hc")?;
                if !(1..=12).contains(&level) {
                    bail!(ErrorInner::BadOptions(format!("lz4hc level {level} out of range")));
                }
                Ok(Box::new(Lz4Compressor { hc_level: Some(level) }))
            });
        }
        #[cfg(feature = "brotli")]
        factories.insert("brotli", |mut opts| {
            let quality = opts.take_int("quality")?.unwrap_or(9u32);
            let window = opts.take_int("lgwin")?.unwrap_or(22u32);
            opts.finish("brotli")?;
            if quality > 11 || !(10..=24).contains(&window) {
                bail!(ErrorInner::BadOptions("brotli quality 0..=11, lgwin 10..=24".into()));
            }
            Ok(Box::new(BrotliCompressor { quality, window }))
        });
        factories.insert("flac", |_| bail!(ErrorInner::Unsupported("flac")));
        factories.insert("ricepp", |_| bail!(ErrorInner::Unsupported("ricepp")));
        Self { factories }
    }
}

impl CodecRegistry {
    /// The names of all registered codecs.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    /// Create a compressor from a binding like `zstd:level=19` or `null`.
    pub fn create(&self, binding: &str) -> Result<Box<dyn Compressor>> {
        let mut parts = binding.split(':');
        let name = parts.next().unwrap_or("");
        // `none` is accepted as an alias on the command line.
        let name = if name == "none" { "null" } else { name };
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ErrorInner::UnknownCodec(name.to_owned()))?;
        factory(Options::parse(parts)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(binding: &str) {
        let reg = CodecRegistry::default();
        let c = reg.create(binding).unwrap();
        // Compressible input so no codec reports a bad ratio.
        let data = b"abcdefgh".repeat(1024);
        let compressed = c.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        let out = decompress(c.algo(), &compressed, data.len()).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn roundtrip_all_builtin() {
        for binding in ["zstd:level=3", "lzma:level=1", "lz4", "lz4hc:level=2", "brotli:quality=5"] {
            roundtrip(binding);
        }
    }

    #[test]
    fn frame_decode_in_small_budgets() {
        let data = b"0123456789".repeat(2000);
        let c = CodecRegistry::default().create("zstd").unwrap();
        let compressed = c.compress(&data).unwrap();
        let mut dec = decoder(CompressAlgo::ZSTD, compressed).unwrap();
        let mut out = Vec::new();
        let mut frames = 0;
        loop {
            frames += 1;
            if dec.decompress_frame(&mut out, 1000).unwrap() {
                break;
            }
        }
        assert_eq!(out, data);
        assert!(frames >= 20);
    }

    #[test]
    fn incompressible_is_bad_ratio() {
        let reg = CodecRegistry::default();
        let c = reg.create("zstd:level=1").unwrap();
        // Tiny input cannot shrink.
        let err = c.compress(b"x").unwrap_err();
        assert!(err.is_bad_ratio());
        // The null codec never reports a bad ratio.
        assert_eq!(reg.create("null").unwrap().compress(b"x").unwrap(), b"x");
    }

    #[test]
    fn unknown_and_unsupported() {
        let reg = CodecRegistry::default();
        assert!(reg.create("snappy").is_err());
        assert!(reg.create("flac").is_err());
        assert!(reg.create("zstd:level=999").is_err());
        assert!(reg.create("zstd:bogus=1").is_err());
    }
}
