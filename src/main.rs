use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::info;

use tinycvid::y4m::{Y4mReader, Y4mWriter};
use tinycvid::{
  peek_header, CinepakDecoder, CinepakEncoder, Error, FrameInput, FrameLayout, Result,
};
use tinycvid::riff::AviWriter;

#[derive(Parser)]
#[command(name = "tinycvid", about = "Cinepak-family vector-quantisation video codec")]
struct Args {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  #[command(about = "Encode a Y4M stream into a Cinepak AVI")]
  Encode {
    #[arg(help = "Input .y4m file (4:2:0, dimensions multiples of 4)")]
    input: PathBuf,
    #[arg(help = "Output .avi file")]
    output: PathBuf,
    #[arg(long, default_value_t = 1, help = "Quality factor: larger is coarser and smaller, 0 forces finest")]
    quality: u32,
    #[arg(long, default_value_t = 3, help = "Number of strips per frame")]
    strips: usize,
    #[arg(long, default_value_t = 25, help = "Frame rate written into the AVI headers")]
    fps: u32,
    #[arg(long, help = "Encode on the calling thread only")]
    no_threads: bool,
    #[arg(long, help = "Weight stable blocks higher in the quantisers")]
    forward_weight_boost: bool,
    #[arg(long, help = "Leave unchanged macroblocks out of codebook training")]
    skip_unchanged: bool,
  },
  #[command(about = "Decode a raw stream of concatenated frame packets back to Y4M")]
  Decode {
    #[arg(help = "Input file of concatenated frame packets")]
    input: PathBuf,
    #[arg(help = "Output .y4m file")]
    output: PathBuf,
  },
}

fn encode(
  input: &PathBuf,
  output: &PathBuf,
  quality: u32,
  strips: usize,
  fps: u32,
  no_threads: bool,
  forward_weight_boost: bool,
  skip_unchanged: bool,
) -> Result<()> {
  let mut y4m = Y4mReader::new(BufReader::new(File::open(input)?))?;
  let (width, height) = (y4m.width(), y4m.height());
  if width % 4 != 0 || height % 4 != 0 {
    return Err(Error::Unsupported("frame dimensions must be multiples of 4"));
  }
  let layout = FrameLayout::new(width, height);

  let mut encoder = CinepakEncoder::new(width, height, strips);
  encoder.config.quality_factor = quality;
  encoder.config.no_threads = no_threads;
  encoder.config.forward_weight_boost = forward_weight_boost;
  encoder.config.skip_unchanged = skip_unchanged;

  let mut avi = AviWriter::new(width as u32, height as u32, fps);
  let mut blocks = layout.alloc_blocks();
  let mut frames = 0u64;
  let mut payload = 0u64;
  while y4m.read_frame(layout, &mut blocks)? {
    encoder.push_frame(FrameInput::YuvBlocks(&blocks));
    if let Some(packet) = encoder.pull_frame() {
      payload += packet.len() as u64;
      avi.write_frame(&packet);
    }
    frames += 1;
  }
  if frames == 0 {
    return Err(Error::InvalidData("input stream holds no frames"));
  }
  // Flush the lookahead: repeat the last frame once
  encoder.push_frame(FrameInput::EndOfStream);
  if let Some(packet) = encoder.pull_frame() {
    payload += packet.len() as u64;
    avi.write_frame(&packet);
  }

  let data = avi.finish();
  File::create(output)?.write_all(&data)?;
  info!(
    "{} frames, {} bytes of packets, {} bytes of AVI",
    frames,
    payload,
    data.len()
  );
  Ok(())
}

fn decode(input: &PathBuf, output: &PathBuf) -> Result<()> {
  let mut data = Vec::new();
  File::open(input)?.read_to_end(&mut data)?;

  if data.is_empty() {
    return Err(Error::InvalidData("input holds no frame packets"));
  }
  // The stream dimensions come from the first packet header
  let first = peek_header(&data)?;
  if first.width == 0 || first.height == 0 || first.width % 4 != 0 || first.height % 4 != 0 {
    return Err(Error::InvalidData("bad frame dimensions in packet header"));
  }
  let layout = FrameLayout::new(first.width, first.height);
  let mut decoder = CinepakDecoder::new(first.width, first.height);
  let mut y4m = Y4mWriter::new(BufWriter::new(File::create(output)?), first.width, first.height)?;

  let mut pos = 0usize;
  let mut frames = 0u64;
  while pos < data.len() {
    let info = peek_header(&data[pos..])?;
    if pos + info.frame_size > data.len() {
      return Err(Error::UnexpectedEof);
    }
    decoder.decode_packet(&data[pos..pos + info.frame_size])?;
    y4m.write_frame(layout, decoder.frame())?;
    pos += info.frame_size;
    frames += 1;
  }
  info!("{} frames decoded", frames);
  Ok(())
}

fn run(args: Args) -> Result<()> {
  match &args.command {
    Command::Encode {
      input,
      output,
      quality,
      strips,
      fps,
      no_threads,
      forward_weight_boost,
      skip_unchanged,
    } => encode(
      input,
      output,
      *quality,
      *strips,
      *fps,
      *no_threads,
      *forward_weight_boost,
      *skip_unchanged,
    ),
    Command::Decode { input, output } => decode(input, output),
  }
}

fn main() -> ExitCode {
  env_logger::init();
  let args = Args::parse();
  match run(args) {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      eprintln!("error: {}", err);
      ExitCode::FAILURE
    }
  }
}
