// Cinepak-family vector-quantisation video codec.
//
// Frames are tiled into 4x4-pixel macroblocks (2x2 YuvBlocks) and encoded
// as horizontal strips, each carrying up to two 256-entry codebooks: V1
// (one code per macroblock, upsampled 2x at decode) and V4 (one code per
// block), plus a per-macroblock selection stream. Inter frames can
// additionally skip macroblocks, reusing the decoder's previous
// reconstruction.
//
// CinepakEncoder is the encoder pipeline: perceptually-weighted colour
// handling, a PNN-seeded ELBG vector quantiser per codebook, a
// rate-distortion mode decision, and a bidirectional lookahead backed by
// an embedded CinepakDecoder running in lockstep, so inter-frame decisions
// are never biased by encoder-only state.

pub mod bitcode;
pub mod block;
pub mod decoder;
pub mod elbg;
pub mod encoder;
pub mod frame;
pub mod pnn;
pub mod rgbyuv;
pub mod riff;
pub mod y4m;

pub use block::{block_distortion, YuvBlock};
pub use decoder::{peek_header, CinepakDecoder, PacketInfo, DECDEBUG_CRYPTOMATTE};
pub use encoder::{CinepakEncoder, EncoderConfig, FrameInput};
pub use frame::{max_packet_size, FrameLayout};

// Codec failures. Malformed or truncated bitstreams are data errors and
// abort the frame cleanly; caller-contract violations (bad dimensions,
// pushing past the pipeline depth) are asserted instead, since no valid
// program reaches them.
#[derive(Debug)]
pub enum Error {
  // Corrupt or malformed data
  InvalidData(&'static str),
  // Valid data using a feature this implementation does not handle
  Unsupported(&'static str),
  // Data ended mid-structure
  UnexpectedEof,
  // Propagated from std::io
  Io(std::io::Error),
}

impl std::fmt::Display for Error {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Error::InvalidData(what) => write!(f, "invalid data: {}", what),
      Error::Unsupported(what) => write!(f, "unsupported: {}", what),
      Error::UnexpectedEof => write!(f, "unexpected end of data"),
      Error::Io(err) => write!(f, "io error: {}", err),
    }
  }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
  fn from(err: std::io::Error) -> Error {
    match err.kind() {
      std::io::ErrorKind::UnexpectedEof => Error::UnexpectedEof,
      _ => Error::Io(err),
    }
  }
}

pub type Result<T> = std::result::Result<T, Error>;
