// Copyright (c) 2025, The tinycvid contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/license/bsd-2-clause

use log::debug;

use crate::bitcode::*;
use crate::block::{clamp_u8, YuvBlock};
use crate::frame::FrameLayout;
use crate::rgbyuv;
use crate::{Error, Result};

// Replace codebook lookups with a synthetic luma-by-index palette so the
// decoded image shows which codes the decoder selected. Inspection only.
pub const DECDEBUG_CRYPTOMATTE: u32 = 1 << 0;

// Frame packet header fields, as parsed by peek_header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketInfo {
  pub keyframe: bool,
  // Declared total packet size, including the 10-byte frame header
  pub frame_size: usize,
  pub width: usize,
  pub height: usize,
  pub strip_count: usize,
}

// Parse a packet's frame header without touching decoder state. Useful to
// walk a stream of concatenated packets.
pub fn peek_header(data: &[u8]) -> Result<PacketInfo> {
  let mut packet = PacketReader::new(data);
  let frame_type = packet.read_u8()?;
  if frame_type != CHUNK_FRAME_INTRA && frame_type != CHUNK_FRAME_INTER {
    return Err(Error::InvalidData("not a frame packet"));
  }
  let frame_size = packet.read_u24()? as usize;
  let width = packet.read_u16()? as usize;
  let height = packet.read_u16()? as usize;
  let strip_count = packet.read_u16()? as usize;
  Ok(PacketInfo {
    keyframe: frame_type == CHUNK_FRAME_INTRA,
    frame_size: frame_size,
    width: width,
    height: height,
    strip_count: strip_count,
  })
}

fn cryptomatte_code_v4(i: u8) -> YuvBlock {
  let luma = clamp_u8(((i & 0xF0) + 8) as i32);
  YuvBlock {
    weight: 0,
    u: 64,
    v: clamp_u8(128 + 29 - ((i & 15) as i32 * 4)),
    ytl: luma,
    ytr: luma,
    ybl: luma,
    ybr: luma,
  }
}

fn cryptomatte_code_v1(i: u8) -> YuvBlock {
  YuvBlock { u: 192, ..cryptomatte_code_v4(i) }
}

// Cinepak-family decoder. Also embedded inside the encoder, which replays
// every packet it emits through this type so inter-frame decisions see
// exactly the reconstruction any conforming decoder would produce.
pub struct CinepakDecoder {
  layout: FrameLayout,
  frame: Box<[YuvBlock]>,
  codes_v1: Vec<Box<[YuvBlock; 256]>>,
  codes_v4: Vec<Box<[YuvBlock; 256]>>,
  debug_flags: u32,
}

impl CinepakDecoder {
  pub fn new(width: usize, height: usize) -> Self {
    let layout = FrameLayout::new(width, height);
    Self {
      frame: layout.alloc_blocks(),
      layout: layout,
      codes_v1: Vec::new(),
      codes_v4: Vec::new(),
      debug_flags: 0,
    }
  }

  pub fn set_debug_flags(&mut self, flags: u32) {
    self.debug_flags = flags;
  }

  pub fn layout(&self) -> FrameLayout {
    self.layout
  }

  // The reconstructed frame, in block order
  pub fn frame(&self) -> &[YuvBlock] {
    &self.frame
  }

  pub fn frame_to_rgb(&self, dst: &mut [u8]) {
    rgbyuv::yuv_to_rgb(dst, &self.frame, self.layout.mb_w * 2, self.layout.mb_h * 2);
  }

  pub fn frame_to_gray(&self, dst: &mut [u8]) {
    rgbyuv::yuv_to_gray(dst, &self.frame, self.layout.mb_w * 2, self.layout.mb_h * 2);
  }

  // Decode one frame packet into the internal frame buffer. Malformed data
  // aborts with an error; the packet is then lost but the decoder stays
  // usable for the next one.
  pub fn decode_packet(&mut self, data: &[u8]) -> Result<()> {
    let info = peek_header(data)?;
    if info.frame_size != data.len() {
      return Err(Error::InvalidData("frame size disagrees with packet length"));
    }
    if info.width != self.layout.width() || info.height != self.layout.height() {
      return Err(Error::InvalidData("frame dimensions disagree with decoder"));
    }
    if self.codes_v1.len() < info.strip_count {
      self.codes_v1.resize_with(info.strip_count, || Box::new([YuvBlock::default(); 256]));
      self.codes_v4.resize_with(info.strip_count, || Box::new([YuvBlock::default(); 256]));
    }

    let mut packet = PacketReader::new(data);
    for _ in 0..10 {
      packet.read_u8()?;
    }

    let mut prev_ybottom = 0usize;
    for stripno in 0..info.strip_count {
      let strip_start = packet.pos();
      let strip_type = packet.read_u8()?;
      if strip_type != CHUNK_STRIP_INTRA && strip_type != CHUNK_STRIP_INTER {
        return Err(Error::InvalidData("bad strip type"));
      }
      let strip_size = packet.read_u24()? as usize;
      if strip_size < 12 || strip_start + strip_size > data.len() {
        return Err(Error::InvalidData("strip size out of range"));
      }
      let mut ytop = packet.read_u16()? as usize;
      let xstart = packet.read_u16()? as usize;
      let mut ybottom = packet.read_u16()? as usize;
      let xend = packet.read_u16()? as usize;
      if ytop == 0 {
        // A zero top edge continues below the previous strip, with the
        // bottom field holding the strip height
        ytop = prev_ybottom;
        ybottom += ytop;
      }
      prev_ybottom = ybottom;
      if xstart != 0 || xend != self.layout.width() {
        return Err(Error::Unsupported("partial-width strip"));
      }
      if ytop >= ybottom || ybottom > self.layout.height() || ytop % 4 != 0 || ybottom % 4 != 0 {
        return Err(Error::InvalidData("bad strip extents"));
      }

      let strip_end = strip_start + strip_size;
      while packet.pos() < strip_end {
        let chunk_start = packet.pos();
        let chunk_type = packet.read_u8()?;
        let chunk_size = packet.read_u24()? as usize;
        let chunk_end = chunk_start + chunk_size;
        if chunk_size < 4 || chunk_end > strip_end {
          return Err(Error::InvalidData("chunk size out of range"));
        }
        match chunk_type {
          CHUNK_V4_COLOR_FULL..=CHUNK_V1_MONO_PARTIAL => {
            self.read_codebook(&mut packet, chunk_type, chunk_end, stripno)?;
          }
          CHUNK_IMAGE_INTRA | CHUNK_IMAGE_INTER | CHUNK_IMAGE_V1 => {
            self.read_image(&mut packet, chunk_type, stripno, ytop / 4, ybottom / 4)?;
          }
          _ => {
            debug!("bad chunk type {:#04x}", chunk_type);
            return Err(Error::InvalidData("bad chunk type"));
          }
        }
        if packet.pos() != chunk_end {
          return Err(Error::InvalidData("chunk contents disagree with its size"));
        }
      }
    }
    Ok(())
  }

  fn read_codebook(
    &mut self,
    packet: &mut PacketReader,
    chunk_type: u8,
    chunk_end: usize,
    stripno: usize,
  ) -> Result<()> {
    let codebook = if chunk_type & CB_V1_MASK != 0 {
      &mut self.codes_v1[stripno]
    } else {
      &mut self.codes_v4[stripno]
    };
    let partial = chunk_type & CB_PARTIAL_MASK != 0;
    let mono = chunk_type & CB_MONO_MASK != 0;

    let mut slot = 0usize;
    let mut bits = BitstreamReader::new(packet);
    while bits.pos() < chunk_end {
      if slot >= 256 {
        return Err(Error::InvalidData("codebook chunk rewrites too many slots"));
      }
      if !partial || bits.read_bit()? {
        let code = &mut codebook[slot];
        code.ytl = bits.read_u8()?;
        code.ytr = bits.read_u8()?;
        code.ybl = bits.read_u8()?;
        code.ybr = bits.read_u8()?;
        if mono {
          code.u = 128;
          code.v = 128;
        } else {
          code.u = bits.read_u8()? ^ 128;
          code.v = bits.read_u8()? ^ 128;
        }
      }
      slot += 1;
    }
    Ok(())
  }

  fn read_image(
    &mut self,
    packet: &mut PacketReader,
    chunk_type: u8,
    stripno: usize,
    mb_ytop: usize,
    mb_ybottom: usize,
  ) -> Result<()> {
    let cryptomatte = self.debug_flags & DECDEBUG_CRYPTOMATTE != 0;
    let mut bits = BitstreamReader::new(packet);
    for y in mb_ytop..mb_ybottom {
      for x in 0..self.layout.mb_w {
        if chunk_type == CHUNK_IMAGE_INTER && !bits.read_bit()? {
          // Skipped macroblock, reconstruction carries over
          continue;
        }
        let use_v1 = chunk_type == CHUNK_IMAGE_V1 || !bits.read_bit()?;
        let blk = [
          self.layout.blk_index(x * 2, y * 2),
          self.layout.blk_index(x * 2 + 1, y * 2),
          self.layout.blk_index(x * 2, y * 2 + 1),
          self.layout.blk_index(x * 2 + 1, y * 2 + 1),
        ];
        if use_v1 {
          let index = bits.read_u8()?;
          let code = if cryptomatte {
            cryptomatte_code_v1(index)
          } else {
            self.codes_v1[stripno][index as usize]
          };
          // Nearest-neighbour 2x upsample: each code luma covers a child block
          self.frame[blk[0]] = YuvBlock { ytr: code.ytl, ybl: code.ytl, ybr: code.ytl, ..code };
          self.frame[blk[1]] = YuvBlock { ytl: code.ytr, ybl: code.ytr, ybr: code.ytr, ..code };
          self.frame[blk[2]] = YuvBlock { ytl: code.ybl, ytr: code.ybl, ybr: code.ybl, ..code };
          self.frame[blk[3]] = YuvBlock { ytl: code.ybr, ytr: code.ybr, ybl: code.ybr, ..code };
        } else {
          for &b in &blk {
            let index = bits.read_u8()?;
            self.frame[b] = if cryptomatte {
              cryptomatte_code_v4(index)
            } else {
              self.codes_v4[stripno][index as usize]
            };
          }
        }
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn peek_rejects_garbage() {
    assert!(peek_header(&[0x55, 0, 0, 16]).is_err());
    assert!(peek_header(&[]).is_err());
  }

  #[test]
  fn truncated_packet_fails_cleanly() {
    // A plausible header claiming more data than present
    let data = [0x00, 0x00, 0x00, 0x20, 0x00, 0x10, 0x00, 0x10, 0x00, 0x01, 0x10];
    let mut dec = CinepakDecoder::new(16, 16);
    assert!(dec.decode_packet(&data).is_err());
  }

  #[test]
  fn rejects_mismatched_dimensions() {
    let data = [0x00, 0x00, 0x00, 0x0A, 0x00, 0x20, 0x00, 0x20, 0x00, 0x00];
    let mut dec = CinepakDecoder::new(16, 16);
    assert!(dec.decode_packet(&data).is_err());
  }
}
