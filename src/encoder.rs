// Copyright (c) 2025, The tinycvid contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/license/bsd-2-clause

use log::debug;
use rayon::prelude::*;

use crate::bitcode::*;
use crate::block::{block_distortion, macroblock_v1_distortion, YuvBlock, TOTAL_WEIGHT};
use crate::decoder::CinepakDecoder;
use crate::elbg::elbg_refine;
use crate::frame::{max_packet_size, FrameLayout};
use crate::pnn::pnn_seed;
use crate::rgbyuv;

// A keyframe, then this many inter frames
const INTER_FRAMES_PER_KEYFRAME: u32 = 60;

const CODEBOOK_SIZE: usize = 256;

// Encoder behaviour switches
#[derive(Clone, Copy, Debug)]
pub struct EncoderConfig {
  // Rate-distortion knob: larger values make mode costs matter more,
  // giving coarser output and smaller files. 0 disables the cost terms
  // entirely and always picks the lowest-distortion mode.
  pub quality_factor: u32,
  // Use the integer-matrix RGB conversion instead of the gamma-correct
  // luma-preserving one
  pub fast_rgb_to_yuv: bool,
  // Encode strips and codebooks on the calling thread only
  pub no_threads: bool,
  // Raise the quantiser weight of blocks that barely change toward the
  // next frame (they stay on screen longer, so their codes matter more).
  // Off by default pending tuning.
  pub forward_weight_boost: bool,
  // Leave unchanged macroblocks out of codebook training. Saves time on
  // static content but measurably hurts quality, so off by default.
  pub skip_unchanged: bool,
}

impl Default for EncoderConfig {
  fn default() -> Self {
    Self {
      quality_factor: 1,
      fast_rgb_to_yuv: false,
      no_threads: false,
      forward_weight_boost: false,
      skip_unchanged: false,
    }
  }
}

// One frame handed to push_frame
pub enum FrameInput<'a> {
  // Packed RGB, 3 bytes per pixel, row-major
  Rgb24(&'a [u8]),
  // 8-bit luminance, row-major; chroma is neutral
  Gray(&'a [u8]),
  // Pre-converted YUV blocks in block order
  YuvBlocks(&'a [YuvBlock]),
  // End of stream: flushes the lookahead by repeating the last frame
  EndOfStream,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum MacroMode {
  V1,
  V4,
  Skip,
  // Planning-only: skip now, but if the strip turns out intra this
  // macroblock is better served by V1 than V4
  SkipElseV1,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum StripType {
  V1Only,
  Intra,
  Inter,
}

// Everything needed to serialise one strip, produced by encode_strip.
struct StripEncoding {
  ytop: usize,
  height: usize,
  strip_type: StripType,
  mb_modes: Vec<MacroMode>,
  // Best V1 code per macroblock and best V4 code per block, valid for the
  // macroblocks whose final mode references them
  mb_v1: Vec<u8>,
  blk_v4: Vec<u8>,
  code_v1: Vec<YuvBlock>,
  code_v4: Vec<YuvBlock>,
}

// Cinepak-family encoder with a two-frame lookahead pipeline. Push two
// frames, then alternate push/pull; finish with an EndOfStream push and a
// final pull.
//
// The encoder carries a decoder replaying its own output, so skip
// decisions compare against the reconstruction an external decoder will
// actually hold, never against encoder-only state.
pub struct CinepakEncoder {
  layout: FrameLayout,
  max_strips: usize,
  pub config: EncoderConfig,
  cur_frame: Box<[YuvBlock]>,
  next_frame: Box<[YuvBlock]>,
  cur_frame_v1: Box<[YuvBlock]>,
  skip_mb_distortion: Box<[u32]>,
  decoder: CinepakDecoder,
  frame_count: u64,
  inter_frames_left: u32,
  frames_pushed: u32,
}

impl CinepakEncoder {
  pub fn new(width: usize, height: usize, max_strips: usize) -> Self {
    assert!(max_strips > 0, "at least one strip is required");
    assert!(width <= 65535 && height <= 65535, "frame dimensions exceed the 16-bit header fields");
    let layout = FrameLayout::new(width, height);
    Self {
      max_strips: max_strips,
      config: EncoderConfig::default(),
      cur_frame: layout.alloc_blocks(),
      next_frame: layout.alloc_blocks(),
      cur_frame_v1: layout.alloc_macroblocks(),
      skip_mb_distortion: vec![0u32; layout.total_macroblocks()].into_boxed_slice(),
      decoder: CinepakDecoder::new(width, height),
      layout: layout,
      frame_count: 0,
      inter_frames_left: 0,
      frames_pushed: 0,
    }
  }

  pub fn layout(&self) -> FrameLayout {
    self.layout
  }

  // Store a frame into the lookahead slot. Returns false if two frames
  // are already pending (pull one first).
  pub fn push_frame(&mut self, input: FrameInput) -> bool {
    if self.frames_pushed >= 2 {
      return false;
    }
    self.frames_pushed += 1;
    std::mem::swap(&mut self.cur_frame, &mut self.next_frame);
    let block_w = self.layout.mb_w * 2;
    let block_h = self.layout.mb_h * 2;
    match input {
      FrameInput::Rgb24(data) => {
        if self.config.fast_rgb_to_yuv {
          rgbyuv::rgb_to_yuv_fast(&mut self.next_frame, data, block_w, block_h);
        } else {
          rgbyuv::rgb_to_yuv_hq(&mut self.next_frame, data, block_w, block_h);
        }
      }
      FrameInput::Gray(data) => {
        rgbyuv::gray_to_yuv(&mut self.next_frame, data, block_w, block_h);
      }
      FrameInput::YuvBlocks(data) => {
        self.next_frame.copy_from_slice(data);
      }
      FrameInput::EndOfStream => {
        self.next_frame.copy_from_slice(&self.cur_frame);
      }
    }
    return true;
  }

  // Encode and return the oldest pending frame, or None until two frames
  // have been pushed
  pub fn pull_frame(&mut self) -> Option<Vec<u8>> {
    if self.frames_pushed < 2 {
      return None;
    }
    self.frames_pushed -= 1;
    let mut packet = PacketWriter::new();
    self.encode_frame(&mut packet);
    let packet = packet.into_vec();
    assert!(packet.len() <= max_packet_size(self.layout.width(), self.layout.height(), self.max_strips));
    Some(packet)
  }

  fn encode_frame(&mut self, packet: &mut PacketWriter) {
    let header_pos = packet.skip(10);

    let keyframe = if self.inter_frames_left == 0 || self.frame_count == 0 {
      self.inter_frames_left = INTER_FRAMES_PER_KEYFRAME;
      true
    } else {
      self.inter_frames_left -= 1;
      false
    };

    // Bidirectional lookahead: the forward difference (toward the next
    // input frame) sets the quantiser weights, the backward difference
    // (against the decoder's reconstruction) is the cost of skipping.
    let layout = self.layout;
    for y in 0..layout.mb_h {
      for x in 0..layout.mb_w {
        let blk = [
          layout.blk_index(x * 2, y * 2),
          layout.blk_index(x * 2 + 1, y * 2),
          layout.blk_index(x * 2, y * 2 + 1),
          layout.blk_index(x * 2 + 1, y * 2 + 1),
        ];
        let mut forward = 0u32;
        let mut backward = 0u32;
        for &b in &blk {
          forward += block_distortion(self.cur_frame[b], self.next_frame[b]);
          backward += block_distortion(self.cur_frame[b], self.decoder.frame()[b]);
        }
        // Skipping is impossible on a keyframe
        self.skip_mb_distortion[layout.mb_index(x, y)] = if keyframe { u32::MAX } else { backward };
        let weight: u16 = if self.config.forward_weight_boost && forward < 16 { 3 } else { 2 };
        for &b in &blk {
          self.cur_frame[b].weight = weight;
        }
      }
    }

    rgbyuv::yuv_downscale(&mut self.cur_frame_v1, &self.cur_frame, layout.mb_w, layout.mb_h);

    // Equal-height bands, the last one absorbing the remainder; never more
    // bands than macroblock rows
    let strips = self.max_strips.min(layout.mb_h);
    let mut bands = Vec::with_capacity(strips);
    let mut ytop = 0;
    for i in 0..strips {
      let height = if i == strips - 1 { layout.mb_h - ytop } else { layout.mb_h / strips };
      bands.push((ytop, height));
      ytop += height;
    }

    let enc: &Self = self;
    let encoded: Vec<StripEncoding> = if self.config.no_threads {
      bands.iter().map(|&(ytop, height)| enc.encode_strip(ytop, height, keyframe)).collect()
    } else {
      bands.par_iter().map(|&(ytop, height)| enc.encode_strip(ytop, height, keyframe)).collect()
    };
    for strip in &encoded {
      self.write_strip(packet, strip);
    }

    packet.patch_u8(header_pos, if keyframe { CHUNK_FRAME_INTRA } else { CHUNK_FRAME_INTER });
    packet.patch_u24(header_pos + 1, packet.len() as u32);
    packet.patch_u16(header_pos + 4, layout.width() as u16);
    packet.patch_u16(header_pos + 6, layout.height() as u16);
    packet.patch_u16(header_pos + 8, strips as u16);

    // Replay the packet so the next frame's skip decisions see the real
    // reconstruction
    self
      .decoder
      .decode_packet(packet.as_slice())
      .expect("freshly emitted packet must decode");
    self.frame_count += 1;
  }

  fn encode_strip(&self, ytop: usize, height: usize, keyframe: bool) -> StripEncoding {
    let mb_w = self.layout.mb_w;
    let strip_mbs = mb_w * height;
    // Strip-local block index, over a grid twice the macroblock grid
    let sblk = |x: usize, y: usize| x + y * mb_w * 2;

    let blk_start = self.layout.blk_index(0, ytop * 2);
    let image_v4 = &self.cur_frame[blk_start..blk_start + strip_mbs * 4];
    let mb_start = self.layout.mb_index(0, ytop);
    let image_v1 = &self.cur_frame_v1[mb_start..mb_start + strip_mbs];
    let skip_dist = &self.skip_mb_distortion[mb_start..mb_start + strip_mbs];

    let mut mb_modes = vec![MacroMode::V4; strip_mbs];
    let mut mb_v1 = vec![0u8; strip_mbs];
    let mut blk_v4 = vec![0u8; strip_mbs * 4];
    let mut code_v1: Vec<YuvBlock> = Vec::new();
    let mut code_v4: Vec<YuvBlock> = Vec::new();

    let mut v1_idx: Vec<u32> = Vec::new();
    let mut v4_idx: Vec<u32> = Vec::new();
    let mut whole_strip_skips = !keyframe;
    for i in 0..strip_mbs {
      if skip_dist[i] > 0 {
        whole_strip_skips = false;
      }
      if skip_dist[i] > 0 || keyframe || !self.config.skip_unchanged {
        let (x, y) = (i % mb_w, i / mb_w);
        v1_idx.push(i as u32);
        v4_idx.push(sblk(x * 2, y * 2) as u32);
        v4_idx.push(sblk(x * 2 + 1, y * 2) as u32);
        v4_idx.push(sblk(x * 2, y * 2 + 1) as u32);
        v4_idx.push(sblk(x * 2 + 1, y * 2 + 1) as u32);
      }
    }

    if whole_strip_skips {
      // Nothing in this strip changed: every macroblock skips and both
      // codebooks stay empty
      debug!("strip ytop={}: fully skipped", ytop);
      return StripEncoding {
        ytop: ytop,
        height: height,
        strip_type: StripType::Inter,
        mb_modes: vec![MacroMode::Skip; strip_mbs],
        mb_v1: mb_v1,
        blk_v4: blk_v4,
        code_v1: code_v1,
        code_v4: code_v4,
      };
    }

    // Build both codebooks, V1 concurrently with V4 when allowed
    let v1_run = |code_v1: &mut Vec<YuvBlock>, mb_v1: &mut Vec<u8>| {
      pnn_seed(code_v1, CODEBOOK_SIZE, image_v1, &v1_idx, Some(&mut mb_v1[..]));
      elbg_refine(code_v1, CODEBOOK_SIZE, image_v1, &v1_idx, Some(&mut mb_v1[..]));
    };
    let v4_run = |code_v4: &mut Vec<YuvBlock>, blk_v4: &mut Vec<u8>| {
      pnn_seed(code_v4, CODEBOOK_SIZE, image_v4, &v4_idx, Some(&mut blk_v4[..]));
      elbg_refine(code_v4, CODEBOOK_SIZE, image_v4, &v4_idx, Some(&mut blk_v4[..]));
    };
    if self.config.no_threads {
      v4_run(&mut code_v4, &mut blk_v4);
      v1_run(&mut code_v1, &mut mb_v1);
    } else {
      rayon::join(|| v1_run(&mut code_v1, &mut mb_v1), || v4_run(&mut code_v4, &mut blk_v4));
    }

    v1_idx.clear();
    v4_idx.clear();

    // Additive mode costs, in units of one macroblock of metric weight;
    // lower score wins
    let q = self.config.quality_factor as u64;
    let tw = TOTAL_WEIGHT as u64;
    let v1only_cost = 8 * tw * q;
    let intra_v1_cost = 9 * tw * q;
    let intra_v4_cost = 33 * tw * q;
    let inter_v1_cost = 10 * tw * q;
    let inter_v4_cost = 34 * tw * q;
    let inter_skip_cost = tw * q;

    let mut v1only_total = 0u64;
    let mut intra_total = 0u64;
    let mut inter_total = 0u64;
    for y in 0..height {
      for x in 0..mb_w {
        let mb = x + y * mb_w;
        let blk = [sblk(x * 2, y * 2), sblk(x * 2 + 1, y * 2), sblk(x * 2, y * 2 + 1), sblk(x * 2 + 1, y * 2 + 1)];
        let v1_distortion = macroblock_v1_distortion(
          image_v4[blk[0]],
          image_v4[blk[1]],
          image_v4[blk[2]],
          image_v4[blk[3]],
          code_v1[mb_v1[mb] as usize],
        ) as u64;
        let mut v4_distortion = 0u64;
        for &b in &blk {
          v4_distortion += block_distortion(image_v4[b], code_v4[blk_v4[b] as usize]) as u64;
        }
        let skip_distortion = skip_dist[mb] as u64;

        let v1only_score = v1_distortion + v1only_cost;
        let intra_v1_score = v1_distortion + intra_v1_cost;
        let intra_v4_score = v4_distortion + intra_v4_cost;
        let inter_v1_score = v1_distortion + inter_v1_cost;
        let inter_v4_score = v4_distortion + inter_v4_cost;
        let inter_skip_score = skip_distortion + inter_skip_cost;

        if !keyframe && inter_skip_score <= inter_v4_score && inter_skip_score <= inter_v1_score {
          if inter_v1_score <= inter_v4_score {
            mb_modes[mb] = MacroMode::SkipElseV1;
            intra_total += intra_v1_score;
          } else {
            mb_modes[mb] = MacroMode::Skip;
            intra_total += intra_v4_score;
          }
          inter_total += inter_skip_score;
        } else if inter_v1_score <= inter_v4_score {
          mb_modes[mb] = MacroMode::V1;
          v1_idx.push(mb as u32);
          intra_total += intra_v1_score;
          inter_total += inter_v1_score;
        } else {
          mb_modes[mb] = MacroMode::V4;
          for &b in &blk {
            v4_idx.push(b as u32);
          }
          intra_total += intra_v4_score;
          inter_total += inter_v4_score;
        }
        v1only_total += v1only_score;
      }
    }

    let strip_type;
    if v1only_total <= inter_total && (keyframe || v1only_total <= intra_total) {
      // The whole strip as V1 indices beats per-macroblock modes
      strip_type = StripType::V1Only;
      v4_idx.clear();
      for i in 0..strip_mbs {
        if mb_modes[i] != MacroMode::V1 {
          mb_modes[i] = MacroMode::V1;
          v1_idx.push(i as u32);
        }
      }
    } else if inter_total < intra_total && !keyframe {
      strip_type = StripType::Inter;
    } else {
      strip_type = StripType::Intra;
      if !keyframe {
        // Keyframes never planned any skips, nothing to demote there
        for i in 0..strip_mbs {
          match mb_modes[i] {
            MacroMode::SkipElseV1 => {
              mb_modes[i] = MacroMode::V1;
              v1_idx.push(i as u32);
            }
            MacroMode::Skip => {
              mb_modes[i] = MacroMode::V4;
              let (x, y) = (i % mb_w, i / mb_w);
              v4_idx.push(sblk(x * 2, y * 2) as u32);
              v4_idx.push(sblk(x * 2 + 1, y * 2) as u32);
              v4_idx.push(sblk(x * 2, y * 2 + 1) as u32);
              v4_idx.push(sblk(x * 2 + 1, y * 2 + 1) as u32);
            }
            _ => {}
          }
        }
      }
    }

    debug!(
      "strip ytop={}: v1={} v4={} skip={}{}",
      ytop,
      v1_idx.len(),
      v4_idx.len() / 4,
      strip_mbs - (v1_idx.len() + v4_idx.len() / 4),
      if keyframe { " KEY" } else { "" }
    );

    // Retrain each codebook against exactly the vectors that ended up
    // referencing it
    if v4_idx.is_empty() {
      code_v4.clear();
    } else {
      elbg_refine(&mut code_v4, CODEBOOK_SIZE, image_v4, &v4_idx, Some(&mut blk_v4[..]));
    }
    if v1_idx.is_empty() {
      code_v1.clear();
    } else {
      elbg_refine(&mut code_v1, CODEBOOK_SIZE, image_v1, &v1_idx, Some(&mut mb_v1[..]));
    }

    StripEncoding {
      ytop: ytop,
      height: height,
      strip_type: strip_type,
      mb_modes: mb_modes,
      mb_v1: mb_v1,
      blk_v4: blk_v4,
      code_v1: code_v1,
      code_v4: code_v4,
    }
  }

  fn write_codebook(&self, packet: &mut PacketWriter, book: &[YuvBlock], is_v4: bool) {
    let header_pos = packet.skip(4);
    for code in book {
      packet.write_u8(code.ytl);
      packet.write_u8(code.ytr);
      packet.write_u8(code.ybl);
      packet.write_u8(code.ybr);
      // Neutral chroma is 0x00 on the wire
      packet.write_u8(code.u ^ 128);
      packet.write_u8(code.v ^ 128);
    }
    let size = packet.len() - header_pos;
    packet.patch_u8(header_pos, if is_v4 { CHUNK_V4_COLOR_FULL } else { CHUNK_V1_COLOR_FULL });
    packet.patch_u24(header_pos + 1, size as u32);
  }

  fn write_strip(&self, packet: &mut PacketWriter, strip: &StripEncoding) {
    let mb_w = self.layout.mb_w;
    let sblk = |x: usize, y: usize| x + y * mb_w * 2;
    let header_pos = packet.skip(12);

    self.write_codebook(packet, &strip.code_v1, false);
    self.write_codebook(packet, &strip.code_v4, true);

    let image_pos = packet.skip(4);
    let mut bits = BitstreamWriter::new(packet);
    for y in 0..strip.height {
      for x in 0..mb_w {
        let mb = x + y * mb_w;
        match strip.mb_modes[mb] {
          MacroMode::V1 => {
            if strip.strip_type == StripType::Inter {
              bits.put_bit(true);
            }
            if strip.strip_type != StripType::V1Only {
              bits.put_bit(false);
            }
            bits.write_u8(strip.mb_v1[mb]);
          }
          MacroMode::V4 => {
            debug_assert!(strip.strip_type != StripType::V1Only);
            if strip.strip_type == StripType::Inter {
              bits.put_bit(true);
            }
            bits.put_bit(true);
            bits.write_u8(strip.blk_v4[sblk(x * 2, y * 2)]);
            bits.write_u8(strip.blk_v4[sblk(x * 2 + 1, y * 2)]);
            bits.write_u8(strip.blk_v4[sblk(x * 2, y * 2 + 1)]);
            bits.write_u8(strip.blk_v4[sblk(x * 2 + 1, y * 2 + 1)]);
          }
          MacroMode::Skip | MacroMode::SkipElseV1 => {
            debug_assert!(strip.strip_type == StripType::Inter);
            bits.put_bit(false);
          }
        }
      }
    }
    bits.flush();

    let image_size = packet.len() - image_pos;
    packet.patch_u8(
      image_pos,
      match strip.strip_type {
        StripType::Inter => CHUNK_IMAGE_INTER,
        StripType::Intra => CHUNK_IMAGE_INTRA,
        StripType::V1Only => CHUNK_IMAGE_V1,
      },
    );
    packet.patch_u24(image_pos + 1, image_size as u32);

    let strip_size = packet.len() - header_pos;
    packet.patch_u8(
      header_pos,
      if strip.strip_type == StripType::Inter { CHUNK_STRIP_INTER } else { CHUNK_STRIP_INTRA },
    );
    packet.patch_u24(header_pos + 1, strip_size as u32);
    packet.patch_u16(header_pos + 4, (strip.ytop * 4) as u16);
    packet.patch_u16(header_pos + 6, 0);
    packet.patch_u16(header_pos + 8, ((strip.ytop + strip.height) * 4) as u16);
    packet.patch_u16(header_pos + 10, (mb_w * 4) as u16);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn uniform_frame(layout: FrameLayout, y: u8, u: u8, v: u8) -> Vec<YuvBlock> {
    vec![
      YuvBlock { weight: 0, u: u, v: v, ytl: y, ytr: y, ybl: y, ybr: y };
      layout.total_blocks()
    ]
  }

  #[test]
  fn pipeline_needs_two_pushes() {
    let mut enc = CinepakEncoder::new(16, 16, 1);
    assert!(enc.pull_frame().is_none());
    let layout = enc.layout();
    let frame = uniform_frame(layout, 40, 128, 128);
    assert!(enc.push_frame(FrameInput::YuvBlocks(&frame)));
    assert!(enc.pull_frame().is_none());
    assert!(enc.push_frame(FrameInput::EndOfStream));
    let packet = enc.pull_frame().expect("two pushes buffered");
    assert!(!packet.is_empty());
    // A third push without a pull is rejected
    assert!(enc.push_frame(FrameInput::YuvBlocks(&frame)));
    assert!(!enc.push_frame(FrameInput::YuvBlocks(&frame)));
  }

  #[test]
  fn keyframe_cadence_is_61_frames() {
    let mut enc = CinepakEncoder::new(16, 16, 1);
    let layout = enc.layout();
    let frame = uniform_frame(layout, 90, 128, 128);
    let mut keyframes = Vec::new();
    enc.push_frame(FrameInput::YuvBlocks(&frame));
    for i in 0..70 {
      enc.push_frame(FrameInput::YuvBlocks(&frame));
      let packet = enc.pull_frame().unwrap();
      if crate::decoder::peek_header(&packet).unwrap().keyframe {
        keyframes.push(i);
      }
    }
    assert_eq!(keyframes, vec![0, 61]);
  }

  #[test]
  fn packets_fit_the_declared_bound() {
    let mut enc = CinepakEncoder::new(32, 32, 2);
    let layout = enc.layout();
    // Busy content pushes codebooks to full size
    let frame: Vec<YuvBlock> = (0..layout.total_blocks())
      .map(|i| {
        let i = i as u32;
        YuvBlock {
          weight: 0,
          u: (i * 37 % 256) as u8,
          v: (i * 101 % 256) as u8,
          ytl: (i * 13 % 256) as u8,
          ytr: (i * 29 % 256) as u8,
          ybl: (i * 53 % 256) as u8,
          ybr: (i * 71 % 256) as u8,
        }
      })
      .collect();
    enc.push_frame(FrameInput::YuvBlocks(&frame));
    enc.push_frame(FrameInput::EndOfStream);
    let packet = enc.pull_frame().unwrap();
    assert!(packet.len() <= max_packet_size(32, 32, 2));
  }
}
