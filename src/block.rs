// Copyright (c) 2025, The tinycvid contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/license/bsd-2-clause

use bytemuck::{Pod, Zeroable};

// Component weights of the distortion metric
pub const Y_WEIGHT: u32 = 1;
pub const U_WEIGHT: u32 = 2;
pub const V_WEIGHT: u32 = 2;

// One macroblock-worth of metric weight; the unit in which the mode
// decision's additive costs are expressed
pub const TOTAL_WEIGHT: u32 = 4 * Y_WEIGHT + U_WEIGHT + V_WEIGHT;

// One 2x2-pixel YUV block: four luma samples, a shared chroma pair stored
// with a +128 bias, and the quantiser weight (0 = ignored, larger values
// pull centroids harder).
//
// The struct is exactly 8 bytes with no padding, so a block fits in a
// single machine word and the quantisers can index its colour components
// by byte offset. This layout is part of the quantiser contract, not of
// the bitstream.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct YuvBlock {
  pub weight: u16,
  pub u: u8,
  pub v: u8,
  pub ytl: u8,
  pub ytr: u8,
  pub ybl: u8,
  pub ybr: u8,
}

// Number of colour components a block has; the valid axis range for
// YuvBlock::component
pub const NUM_COMPONENTS: usize = 6;

impl YuvBlock {
  // Colour component by axis index. The axis order (u, v, then the four
  // lumas) is the tie-break order the k-d tree uses when several
  // components share the largest extent.
  #[inline]
  pub fn component(self, axis: usize) -> u8 {
    match axis {
      0 => self.u,
      1 => self.v,
      2 => self.ytl,
      3 => self.ytr,
      4 => self.ybl,
      5 => self.ybr,
      _ => panic!("YuvBlock component axis out of range (axis {})", axis),
    }
  }
}

#[inline]
pub fn clamp_u8(x: i32) -> u8 {
  x.clamp(0, 255) as u8
}

// Weights saturate at 255 even though the field is 16 bits wide; this keeps
// the PNN interpolation factor arithmetic in range.
#[inline]
pub fn saturate_weight(w: u32) -> u16 {
  w.min(255) as u16
}

#[inline]
fn square(x: i32) -> u32 {
  (x * x) as u32
}

// Weighted sum-of-squared-differences over the colour components of two
// blocks. Chroma differences use the stored biased values (the bias
// cancels). This single kernel drives every mode decision and every
// quantiser.
#[inline]
pub fn block_distortion(a: YuvBlock, b: YuvBlock) -> u32 {
  (square(a.ytl as i32 - b.ytl as i32)
    + square(a.ytr as i32 - b.ytr as i32)
    + square(a.ybl as i32 - b.ybl as i32)
    + square(a.ybr as i32 - b.ybr as i32))
    * Y_WEIGHT
    + square(a.u as i32 - b.u as i32) * U_WEIGHT
    + square(a.v as i32 - b.v as i32) * V_WEIGHT
}

// Expand one luma sample of a V1 code into the child block a decoder would
// reconstruct from it: the luma replicated over all four positions, chroma
// shared with the code
#[inline]
pub fn v1_child_block(code: YuvBlock, luma: u8) -> YuvBlock {
  YuvBlock {
    weight: 0,
    u: code.u,
    v: code.v,
    ytl: luma,
    ytr: luma,
    ybl: luma,
    ybr: luma,
  }
}

// Distortion of a whole macroblock against a single V1 code: each of the
// code's four lumas is replicated across the corresponding 2x2 child block
// (nearest-neighbour 2x upsample), chroma is shared
#[inline]
pub fn macroblock_v1_distortion(
  tl: YuvBlock,
  tr: YuvBlock,
  bl: YuvBlock,
  br: YuvBlock,
  code: YuvBlock,
) -> u32 {
  block_distortion(tl, v1_child_block(code, code.ytl))
    + block_distortion(tr, v1_child_block(code, code.ytr))
    + block_distortion(bl, v1_child_block(code, code.ybl))
    + block_distortion(br, v1_child_block(code, code.ybr))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn block_is_one_machine_word() {
    assert_eq!(std::mem::size_of::<YuvBlock>(), 8);
  }

  #[test]
  fn distortion_is_zero_on_identical_blocks() {
    let a = YuvBlock { weight: 2, u: 100, v: 200, ytl: 1, ytr: 2, ybl: 3, ybr: 4 };
    assert_eq!(block_distortion(a, a), 0);
  }

  #[test]
  fn distortion_weights_chroma() {
    let a = YuvBlock { weight: 1, u: 128, v: 128, ytl: 0, ytr: 0, ybl: 0, ybr: 0 };
    let du = YuvBlock { u: 131, ..a };
    let dy = YuvBlock { ytl: 3, ..a };
    assert_eq!(block_distortion(a, du), 9 * U_WEIGHT);
    assert_eq!(block_distortion(a, dy), 9 * Y_WEIGHT);
  }

  #[test]
  fn v1_distortion_collapses_lumas() {
    let code = YuvBlock { weight: 0, u: 128, v: 128, ytl: 10, ytr: 20, ybl: 30, ybr: 40 };
    // A macroblock whose child blocks are exactly the V1 expansion has zero distortion.
    let tl = v1_child_block(code, code.ytl);
    let tr = v1_child_block(code, code.ytr);
    let bl = v1_child_block(code, code.ybl);
    let br = v1_child_block(code, code.ybr);
    assert_eq!(macroblock_v1_distortion(tl, tr, bl, br, code), 0);
  }
}
