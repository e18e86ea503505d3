// Y4M (YUV4MPEG2) reading and writing against the block frame model. The
// 4:2:0 chroma planes have exactly one sample per 2x2 pixel block, so they
// map one-to-one onto the per-block chroma pair; only the luma plane needs
// gathering into the 2x2 block quartets.

use std::io::{Read, Write};

use byteorder::ReadBytesExt;

use crate::block::YuvBlock;
use crate::frame::FrameLayout;
use crate::{Error, Result};

const Y4M_FILE_MAGIC: &[u8] = b"YUV4MPEG2 ";
const Y4M_FRAME_MAGIC: &[u8] = b"FRAME";

fn read_decimal<R: Read>(r: &mut R, first_after: &mut u8) -> Result<usize> {
  let mut value = 0usize;
  loop {
    let byte = r.read_u8()?;
    match byte {
      b'0'..=b'9' => {
        value = value * 10 + (byte - b'0') as usize;
      }
      _ => {
        *first_after = byte;
        return Ok(value);
      }
    }
  }
}

fn is_whitespace(byte: u8) -> bool {
  matches!(byte, b' ' | b'\t' | b'\n')
}

// Skip forward to the next whitespace character and return it
fn find_whitespace<R: Read>(r: &mut R) -> Result<u8> {
  loop {
    let byte = r.read_u8()?;
    if is_whitespace(byte) {
      return Ok(byte);
    }
  }
}

pub struct Y4mReader<R> {
  inner: R,
  width: usize,
  height: usize,
  planes: Vec<u8>,
}

impl<R: Read> Y4mReader<R> {
  pub fn new(mut inner: R) -> Result<Self> {
    let mut magic = [0u8; 10];
    inner.read_exact(&mut magic)?;
    if magic != Y4M_FILE_MAGIC {
      return Err(Error::InvalidData("not a YUV4MPEG2 stream"));
    }

    let mut width = 0;
    let mut height = 0;
    loop {
      match inner.read_u8()? {
        b'\n' => break,
        b' ' | b'\t' => continue,
        b'W' => {
          let mut after = 0;
          width = read_decimal(&mut inner, &mut after)?;
          if !is_whitespace(after) {
            return Err(Error::InvalidData("malformed width parameter"));
          }
          if after == b'\n' {
            break;
          }
        }
        b'H' => {
          let mut after = 0;
          height = read_decimal(&mut inner, &mut after)?;
          if !is_whitespace(after) {
            return Err(Error::InvalidData("malformed height parameter"));
          }
          if after == b'\n' {
            break;
          }
        }
        _ => {
          // Parameters we don't interpret (frame rate, interlacing,
          // colourspace); 4:2:0 layouts are all we accept on read anyway
          if find_whitespace(&mut inner)? == b'\n' {
            break;
          }
        }
      }
    }
    if width == 0 || height == 0 {
      return Err(Error::InvalidData("missing or zero Y4M dimensions"));
    }

    Ok(Self {
      inner: inner,
      width: width,
      height: height,
      planes: vec![0u8; width * height + (width / 2) * (height / 2) * 2],
    })
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn height(&self) -> usize {
    self.height
  }

  // Read the next frame into blocks. Returns false on a clean end of
  // stream before the frame header.
  pub fn read_frame(&mut self, layout: FrameLayout, blocks: &mut [YuvBlock]) -> Result<bool> {
    assert_eq!(layout.width(), self.width);
    assert_eq!(layout.height(), self.height);
    assert_eq!(blocks.len(), layout.total_blocks());

    let mut magic = [0u8; 5];
    match self.inner.read(&mut magic)? {
      0 => return Ok(false),
      5 => {}
      n => {
        self.inner.read_exact(&mut magic[n..])?;
      }
    }
    if magic != Y4M_FRAME_MAGIC {
      return Err(Error::InvalidData("bad Y4M frame header"));
    }
    // Frame parameters are legal but carry nothing we need
    while self.inner.read_u8()? != b'\n' {}

    self.inner.read_exact(&mut self.planes)?;
    let (y_plane, uv) = self.planes.split_at(self.width * self.height);
    let (u_plane, v_plane) = uv.split_at((self.width / 2) * (self.height / 2));

    let block_w = self.width / 2;
    for by in 0..self.height / 2 {
      for bx in 0..block_w {
        let top = bx * 2 + by * 2 * self.width;
        blocks[bx + by * block_w] = YuvBlock {
          weight: 0,
          u: u_plane[bx + by * block_w],
          v: v_plane[bx + by * block_w],
          ytl: y_plane[top],
          ytr: y_plane[top + 1],
          ybl: y_plane[top + self.width],
          ybr: y_plane[top + self.width + 1],
        };
      }
    }
    Ok(true)
  }
}

pub struct Y4mWriter<W> {
  inner: W,
  width: usize,
  height: usize,
  planes: Vec<u8>,
}

impl<W: Write> Y4mWriter<W> {
  pub fn new(mut inner: W, width: usize, height: usize) -> Result<Self> {
    inner.write_all(Y4M_FILE_MAGIC)?;
    write!(inner, "W{} H{} F25:1 Ip A1:1 C420\n", width, height).map_err(Error::from)?;
    Ok(Self {
      inner: inner,
      width: width,
      height: height,
      planes: vec![0u8; width * height + (width / 2) * (height / 2) * 2],
    })
  }

  pub fn write_frame(&mut self, layout: FrameLayout, blocks: &[YuvBlock]) -> Result<()> {
    assert_eq!(layout.width(), self.width);
    assert_eq!(layout.height(), self.height);
    assert_eq!(blocks.len(), layout.total_blocks());

    let (y_plane, uv) = self.planes.split_at_mut(self.width * self.height);
    let (u_plane, v_plane) = uv.split_at_mut((self.width / 2) * (self.height / 2));
    let block_w = self.width / 2;
    for by in 0..self.height / 2 {
      for bx in 0..block_w {
        let block = blocks[bx + by * block_w];
        let top = bx * 2 + by * 2 * self.width;
        y_plane[top] = block.ytl;
        y_plane[top + 1] = block.ytr;
        y_plane[top + self.width] = block.ybl;
        y_plane[top + self.width + 1] = block.ybr;
        u_plane[bx + by * block_w] = block.u;
        v_plane[bx + by * block_w] = block.v;
      }
    }

    self.inner.write_all(Y4M_FRAME_MAGIC)?;
    self.inner.write_all(b"\n")?;
    self.inner.write_all(&self.planes)?;
    Ok(())
  }

  pub fn into_inner(self) -> W {
    self.inner
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn frames_round_trip() {
    let layout = FrameLayout::new(8, 8);
    let blocks: Vec<YuvBlock> = (0..layout.total_blocks())
      .map(|i| YuvBlock {
        weight: 0,
        u: (i * 3) as u8,
        v: (i * 5) as u8,
        ytl: i as u8,
        ytr: (i + 1) as u8,
        ybl: (i + 2) as u8,
        ybr: (i + 3) as u8,
      })
      .collect();

    let mut file = Vec::new();
    {
      let mut writer = Y4mWriter::new(&mut file, 8, 8).unwrap();
      writer.write_frame(layout, &blocks).unwrap();
      writer.write_frame(layout, &blocks).unwrap();
    }

    let mut reader = Y4mReader::new(&file[..]).unwrap();
    assert_eq!((reader.width(), reader.height()), (8, 8));
    let mut decoded = vec![YuvBlock::default(); layout.total_blocks()];
    assert!(reader.read_frame(layout, &mut decoded).unwrap());
    assert_eq!(blocks, decoded);
    assert!(reader.read_frame(layout, &mut decoded).unwrap());
    assert!(!reader.read_frame(layout, &mut decoded).unwrap());
  }

  #[test]
  fn rejects_other_containers() {
    assert!(Y4mReader::new(&b"RIFF....AVI LIST"[..]).is_err());
  }
}
