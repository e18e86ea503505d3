use bytemuck::allocation::zeroed_slice_box;

use crate::block::YuvBlock;

// Macroblock/block geometry of a frame, shared by the encoder and the
// decoder. Widths and heights are in pixels and must be multiples of 4;
// a macroblock is 4x4 pixels (2x2 blocks) and blocks are stored in
// block-row-major order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameLayout {
  pub mb_w: usize,
  pub mb_h: usize,
}

impl FrameLayout {
  pub fn new(width: usize, height: usize) -> Self {
    assert!(width > 0 && height > 0, "frame dimensions must be nonzero");
    assert!(
      width % 4 == 0 && height % 4 == 0,
      "frame dimensions must be multiples of 4 ({}x{})",
      width,
      height
    );
    Self { mb_w: width / 4, mb_h: height / 4 }
  }

  pub fn width(&self) -> usize {
    self.mb_w * 4
  }

  pub fn height(&self) -> usize {
    self.mb_h * 4
  }

  pub fn total_macroblocks(&self) -> usize {
    self.mb_w * self.mb_h
  }

  pub fn total_blocks(&self) -> usize {
    self.total_macroblocks() * 4
  }

  #[inline]
  pub fn mb_index(&self, x: usize, y: usize) -> usize {
    x + y * self.mb_w
  }

  #[inline]
  pub fn blk_index(&self, x: usize, y: usize) -> usize {
    x + y * self.mb_w * 2
  }

  // Zeroed block buffer covering the full frame
  pub fn alloc_blocks(&self) -> Box<[YuvBlock]> {
    zeroed_slice_box(self.total_blocks())
  }

  // Zeroed buffer with one block per macroblock (the V1-resolution view)
  pub fn alloc_macroblocks(&self) -> Box<[YuvBlock]> {
    zeroed_slice_box(self.total_macroblocks())
  }
}

// Worst-case size of one encoded frame packet: the 10-byte frame header,
// one index byte per block, the per-macroblock prefix bits, and per strip
// a 12-byte strip header, three 4-byte chunk headers, two full codebooks,
// and the final partially-filled 32-bit word of the image bitstream.
pub fn max_packet_size(width: usize, height: usize, strips: usize) -> usize {
  10 + (width * height) / 4 + (width * height + 63) / 64 + strips * (12 + 4 * 3 + 1536 * 2 + 4)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn layout_indexing() {
    let layout = FrameLayout::new(64, 32);
    assert_eq!(layout.mb_w, 16);
    assert_eq!(layout.mb_h, 8);
    assert_eq!(layout.total_macroblocks(), 128);
    assert_eq!(layout.total_blocks(), 512);
    // Blocks are row-major over a grid twice as wide as the macroblock grid.
    assert_eq!(layout.blk_index(0, 1), 32);
    assert_eq!(layout.mb_index(3, 2), 35);
  }

  #[test]
  #[should_panic]
  fn layout_rejects_unaligned_dimensions() {
    FrameLayout::new(30, 16);
  }
}
