//! Stream codecs used to store file contents in the backing directory.
//!
//! Every codec is a pure stream transformation: [`Codec::compress`] consumes plain bytes from a
//! reader and writes the encoded form, [`Codec::decompress`] does the reverse. Neither keeps the
//! whole file in memory.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::str::FromStr;

use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use weezl::BitOrder;

/// Literal code width used for LZW streams.
const LZW_LITERAL_WIDTH: u8 = 8;

/// Errors raised while encoding or decoding a stream.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The encoded input is malformed or truncated.
    #[error("corrupt {codec} stream: {source}")]
    Corrupt {
        /// Codec that rejected the stream.
        codec: Codec,
        /// Underlying decoder error.
        #[source]
        source: io::Error,
    },

    /// Reading the input or writing the output failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Classify an error surfaced while decoding with `codec`.
    fn from_decode(codec: Codec, e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof
                if e.raw_os_error().is_none() =>
            {
                Self::Corrupt { codec, source: e }
            }
            _ => Self::Io(e),
        }
    }
}

/// The compression algorithm applied to every file of a backing directory.
///
/// A backing directory must always be mounted with the codec it was populated with.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Codec {
    /// LZW, least-significant-bit first, 8 bit literals.
    Lzw,
    /// Raw DEFLATE tuned for speed.
    Flate1,
    /// Raw DEFLATE tuned for size.
    Flate9,
    /// GZIP at the best compression level.
    Gzip,
    /// ZLIB at the best compression level.
    Zlib,
}

impl Codec {
    /// All supported codecs, in the order they are advertised.
    pub const ALL: [Self; 5] = [Self::Lzw, Self::Flate1, Self::Flate9, Self::Gzip, Self::Zlib];

    /// The canonical name of this codec, as accepted on the command line.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Lzw => "lzw",
            Self::Flate1 => "flate1",
            Self::Flate9 => "flate9",
            Self::Gzip => "gzip",
            Self::Zlib => "zlib",
        }
    }

    fn level(self) -> Compression {
        match self {
            Self::Flate1 => Compression::fast(),
            Self::Lzw | Self::Flate9 | Self::Gzip | Self::Zlib => Compression::best(),
        }
    }

    /// Encode everything `input` yields into `output`.
    ///
    /// Returns the number of plain bytes consumed.
    pub fn compress<R: Read, W: Write>(self, input: R, mut output: W) -> Result<u64, CodecError> {
        let mut input = BufReader::new(input);
        let consumed = match self {
            Self::Lzw => {
                let mut encoder = weezl::encode::Encoder::new(BitOrder::Lsb, LZW_LITERAL_WIDTH);
                let result = encoder.into_stream(&mut output).encode_all(&mut input);
                result.status?;
                result.bytes_read as u64
            }
            Self::Flate1 | Self::Flate9 => {
                let mut encoder = flate2::write::DeflateEncoder::new(&mut output, self.level());
                let n = io::copy(&mut input, &mut encoder)?;
                encoder.finish()?;
                n
            }
            Self::Gzip => {
                let mut encoder = flate2::write::GzEncoder::new(&mut output, self.level());
                let n = io::copy(&mut input, &mut encoder)?;
                encoder.finish()?;
                n
            }
            Self::Zlib => {
                let mut encoder = flate2::write::ZlibEncoder::new(&mut output, self.level());
                let n = io::copy(&mut input, &mut encoder)?;
                encoder.finish()?;
                n
            }
        };
        output.flush()?;
        Ok(consumed)
    }

    /// Decode everything `input` yields into `output`.
    ///
    /// An empty input decodes to empty output for every codec. Returns the number of plain bytes
    /// produced.
    pub fn decompress<R: Read, W: Write>(
        self,
        input: R,
        mut output: W,
    ) -> Result<u64, CodecError> {
        let mut input = BufReader::new(input);
        if input.fill_buf()?.is_empty() {
            return Ok(0);
        }

        let produced = match self {
            Self::Lzw => {
                let mut decoder = weezl::decode::Decoder::new(BitOrder::Lsb, LZW_LITERAL_WIDTH);
                let result = decoder.into_stream(&mut output).decode_all(&mut input);
                result
                    .status
                    .map_err(|e| CodecError::from_decode(self, e))?;
                result.bytes_written as u64
            }
            Self::Flate1 | Self::Flate9 => {
                let mut decoder = flate2::bufread::DeflateDecoder::new(input);
                io::copy(&mut decoder, &mut output).map_err(|e| CodecError::from_decode(self, e))?
            }
            Self::Gzip => {
                let mut decoder = flate2::bufread::GzDecoder::new(input);
                io::copy(&mut decoder, &mut output).map_err(|e| CodecError::from_decode(self, e))?
            }
            Self::Zlib => {
                let mut decoder = flate2::bufread::ZlibDecoder::new(input);
                io::copy(&mut decoder, &mut output).map_err(|e| CodecError::from_decode(self, e))?
            }
        };
        output.flush()?;
        Ok(produced)
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when parsing an unknown codec name.
#[derive(Debug, Error)]
#[error("unknown codec '{0}', expected one of: lzw, flate1, flate9, gzip, zlib")]
pub struct UnknownCodec(pub String);

impl FromStr for Codec {
    type Err = UnknownCodec;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.name() == s.trim())
            .ok_or_else(|| UnknownCodec(s.to_owned()))
    }
}
