// Enhanced LBG vector quantiser: Voronoi partition / weighted centroid
// iteration, plus SoCA shifts that move under-utilised codewords into
// high-distortion regions, plus perturbation splits to grow the codebook
// up to the target size.

use log::trace;

use crate::block::{block_distortion, clamp_u8, YuvBlock};

pub(crate) const LBG_ITERATIONS: usize = 200;
const SPLIT_ITERATIONS: usize = 3;
const SOCA_ITERATIONS: usize = 3;

// Assign every selected vector to its nearest codeword. The argmin uses
// the raw block distortion; the per-code accumulation and the returned
// total are scaled by the vector's weight. Partition lists and the
// distortion accumulators must be cleared by the caller.
pub fn voronoi_partition(
  codebook: &[YuvBlock],
  data: &[YuvBlock],
  indices: &[u32],
  code_distortion: &mut [u64],
  partition: &mut [Vec<u32>],
) -> u64 {
  debug_assert!(code_distortion.len() >= codebook.len());
  debug_assert!(partition.len() >= codebook.len());

  let mut total: u64 = 0;
  for &i in indices {
    let vec = data[i as usize];
    let mut best_code = 0usize;
    let mut lowest = u32::MAX;
    for (j, &code) in codebook.iter().enumerate() {
      let distortion = block_distortion(vec, code);
      if distortion < lowest {
        lowest = distortion;
        best_code = j;
      }
    }
    let weighted = lowest as u64 * vec.weight as u64;
    code_distortion[best_code] += weighted;
    total += weighted;
    partition[best_code].push(i);
  }
  return total;
}

// Weighted mean of a partition, each component rounded half up
pub fn calculate_centroid(data: &[YuvBlock], partition: &[u32]) -> YuvBlock {
  let mut ytl = 0u64;
  let mut ytr = 0u64;
  let mut ybl = 0u64;
  let mut ybr = 0u64;
  let mut u = 0u64;
  let mut v = 0u64;
  let mut total_weight = 0u64;
  for &j in partition {
    let block = data[j as usize];
    let w = block.weight as u64;
    ytl += block.ytl as u64 * w;
    ytr += block.ytr as u64 * w;
    ybl += block.ybl as u64 * w;
    ybr += block.ybr as u64 * w;
    u += block.u as u64 * w;
    v += block.v as u64 * w;
    total_weight += w;
  }
  assert!(total_weight > 0);
  let round = |sum: u64| ((sum + (total_weight >> 1)) / total_weight) as u8;
  YuvBlock {
    weight: 0,
    u: round(u),
    v: round(v),
    ytl: round(ytl),
    ytr: round(ytr),
    ybl: round(ybl),
    ybr: round(ybr),
  }
}

// Candidate codeword pair for a SoCA shift, from the bounding box of the
// target partition: one code a quarter of the range above the minimum and
// one a quarter below the maximum, per component.
fn bbox_candidates(data: &[YuvBlock], indices: &[u32]) -> (YuvBlock, YuvBlock) {
  let mut lo = [255u8; 6];
  let mut hi = [0u8; 6];
  for &idx in indices {
    let block = data[idx as usize];
    for axis in 0..6 {
      let c = block.component(axis);
      lo[axis] = lo[axis].min(c);
      hi[axis] = hi[axis].max(c);
    }
  }
  let off: Vec<u8> = (0..6).map(|axis| (hi[axis] - lo[axis]) >> 2).collect();
  let near_min = YuvBlock {
    weight: 0,
    u: clamp_u8(lo[0] as i32 + off[0] as i32),
    v: clamp_u8(lo[1] as i32 + off[1] as i32),
    ytl: clamp_u8(lo[2] as i32 + off[2] as i32),
    ytr: clamp_u8(lo[3] as i32 + off[3] as i32),
    ybl: clamp_u8(lo[4] as i32 + off[4] as i32),
    ybr: clamp_u8(lo[5] as i32 + off[5] as i32),
  };
  let near_max = YuvBlock {
    weight: 0,
    u: clamp_u8(hi[0] as i32 - off[0] as i32),
    v: clamp_u8(hi[1] as i32 - off[1] as i32),
    ytl: clamp_u8(hi[2] as i32 - off[2] as i32),
    ytr: clamp_u8(hi[3] as i32 - off[3] as i32),
    ybl: clamp_u8(hi[4] as i32 - off[4] as i32),
    ybr: clamp_u8(hi[5] as i32 - off[5] as i32),
  };
  (near_min, near_max)
}

// Attempt to shift codeword `from` into the region covered by `to`:
// `from`'s partition is absorbed by the nearest remaining codeword, and
// `to`'s partition is split between two refined candidates. Accepted only
// when the summed distortion strictly improves; on rejection no state is
// touched.
fn try_shift(
  codebook: &[YuvBlock],
  data: &[YuvBlock],
  from: usize,
  to: usize,
  code_distortion: &mut [u64],
  partition: &mut [Vec<u32>],
) -> bool {
  if code_distortion[from] > code_distortion[to] {
    return false;
  }
  // A shift needs a populated region to move into; both sub-partitions of
  // an empty one would come up empty anyway
  if partition[to].is_empty() {
    return false;
  }
  let target_distortion = code_distortion[from] + code_distortion[to];

  // Codeword that will absorb from's partition
  let mut replace = 0usize;
  let mut nearest = u32::MAX;
  for i in 0..codebook.len() {
    if i == from || i == to {
      continue;
    }
    let distortion = block_distortion(codebook[from], codebook[i]);
    if distortion < nearest {
      replace = i;
      nearest = distortion;
    }
  }
  let mut replace_partition = Vec::with_capacity(partition[from].len() + partition[replace].len());
  replace_partition.extend_from_slice(&partition[from]);
  replace_partition.extend_from_slice(&partition[replace]);
  let new_replace = if replace_partition.is_empty() {
    codebook[from]
  } else {
    calculate_centroid(data, &replace_partition)
  };
  let mut from_distortion = 0u64;
  for &idx in &replace_partition {
    let block = data[idx as usize];
    from_distortion += block_distortion(new_replace, block) as u64 * block.weight as u64;
  }
  if from_distortion > target_distortion {
    return false;
  }

  // Split to's partition between the two bounding-box candidates and
  // refine them on that partition alone
  let (c0, c1) = bbox_candidates(data, &partition[to]);
  let mut adjust_codes = [c0, c1];
  let mut adjust_distortion = [0u64; 2];
  let mut adjust_partition = [Vec::new(), Vec::new()];
  for _ in 0..SOCA_ITERATIONS {
    adjust_partition[0].clear();
    adjust_partition[1].clear();
    adjust_distortion = [0, 0];
    voronoi_partition(&adjust_codes, data, &partition[to], &mut adjust_distortion, &mut adjust_partition);
    if adjust_partition[0].is_empty() || adjust_partition[1].is_empty() {
      return false;
    }
    adjust_codes[0] = calculate_centroid(data, &adjust_partition[0]);
    adjust_codes[1] = calculate_centroid(data, &adjust_partition[1]);
  }
  adjust_partition[0].clear();
  adjust_partition[1].clear();
  adjust_distortion = [0, 0];
  let to_distortion =
    voronoi_partition(&adjust_codes, data, &partition[to], &mut adjust_distortion, &mut adjust_partition);

  if to_distortion + from_distortion >= target_distortion {
    return false;
  }
  trace!(
    "soca shift {} -> {} accepted: {} + {} < {}",
    from, to, from_distortion, to_distortion, target_distortion
  );

  // Commit: the actual codewords are rewritten by the caller's centroid
  // update from these partitions
  let from_partition = std::mem::take(&mut partition[from]);
  partition[replace].extend_from_slice(&from_partition);
  let [p0, p1] = adjust_partition;
  partition[from] = p0;
  code_distortion[from] = adjust_distortion[0];
  partition[to] = p1;
  code_distortion[to] = adjust_distortion[1];
  return true;
}

fn perturb(code: YuvBlock, delta: i32) -> YuvBlock {
  YuvBlock {
    weight: 0,
    u: clamp_u8(code.u as i32 + delta),
    v: clamp_u8(code.v as i32 + delta),
    ytl: clamp_u8(code.ytl as i32 + delta),
    ytr: clamp_u8(code.ytr as i32 + delta),
    ybl: clamp_u8(code.ybl as i32 + delta),
    ybr: clamp_u8(code.ybr as i32 + delta),
  }
}

// Refine the codebook against the selected vectors, growing it to
// target_size entries by perturbation splits if it starts smaller. Fills
// closest_out (indexed by raw data index) with the final assignment and
// returns the total weighted distortion.
//
// An iteration whose total distortion matches the previous one with no
// accepted SoCA shift is a fixed point (partitions and shift decisions are
// pure functions of the codebook), so the remaining budget is skipped.
pub fn elbg_refine(
  codebook: &mut Vec<YuvBlock>,
  target_size: usize,
  data: &[YuvBlock],
  indices: &[u32],
  closest_out: Option<&mut [u8]>,
) -> u64 {
  assert!(target_size >= 1);
  assert!(target_size <= 256);

  let mut iterations_left =
    if codebook.len() * 2 > target_size { LBG_ITERATIONS } else { SPLIT_ITERATIONS };
  if codebook.is_empty() {
    // Initial codeword; any value works, the first centroid update fixes it
    codebook.push(YuvBlock::default());
  }

  let mut partition: Vec<Vec<u32>> = Vec::new();
  let mut code_distortion = [0u64; 256];
  let mut last_total = u64::MAX;
  loop {
    if partition.len() < codebook.len() {
      partition.resize_with(codebook.len(), Vec::new);
    }
    for p in partition.iter_mut() {
      p.clear();
    }
    code_distortion.fill(0);

    let total = voronoi_partition(codebook, data, indices, &mut code_distortion, &mut partition);

    let mut shifted = false;
    if codebook.len() >= 8 {
      // SoCA: dead codewords (zero accumulated distortion) take over the
      // worst-performing regions, from the bottom of the ranking upward
      let mut rank: Vec<usize> = (0..codebook.len()).collect();
      rank.sort_unstable_by_key(|&i| (code_distortion[i], i));
      let mut upmost = codebook.len() - 1;
      for i in 0..codebook.len() {
        if code_distortion[rank[i]] > 0 {
          break;
        }
        if i >= upmost {
          break;
        }
        if try_shift(codebook, data, rank[i], rank[upmost], &mut code_distortion, &mut partition) {
          upmost -= 1;
          shifted = true;
        }
      }
    }

    for i in 0..codebook.len() {
      if partition[i].is_empty() {
        continue;
      }
      codebook[i] = calculate_centroid(data, &partition[i]);
    }

    if total == last_total && !shifted {
      iterations_left = 1;
    }
    last_total = total;

    iterations_left -= 1;
    if iterations_left == 0 {
      let mut grew = false;
      let split_max = codebook.len();
      for i in 0..split_max {
        if codebook.len() >= target_size {
          break;
        }
        let code = codebook[i];
        codebook.push(perturb(code, 2));
        codebook[i] = perturb(code, -2);
        grew = true;
      }
      if !grew {
        break;
      }
      iterations_left =
        if codebook.len() == target_size { LBG_ITERATIONS } else { SPLIT_ITERATIONS };
      last_total = u64::MAX;
    }
  }

  // Final assignment against the settled codebook
  if partition.len() < codebook.len() {
    partition.resize_with(codebook.len(), Vec::new);
  }
  for p in partition.iter_mut() {
    p.clear();
  }
  code_distortion.fill(0);
  let total = voronoi_partition(codebook, data, indices, &mut code_distortion, &mut partition);
  if let Some(out) = closest_out {
    for (code, part) in partition.iter().enumerate() {
      for &idx in part {
        out[idx as usize] = code as u8;
      }
    }
  }
  return total;
}

#[cfg(test)]
mod tests {
  use super::*;

  // Small deterministic pseudo-random block set
  fn test_blocks(n: usize, seed: u32) -> Vec<YuvBlock> {
    let mut state = seed;
    let mut step = move || {
      state = state.wrapping_mul(1664525).wrapping_add(1013904223);
      (state >> 24) as u8
    };
    (0..n)
      .map(|_| YuvBlock {
        weight: 1 + (step() % 3) as u16,
        u: step(),
        v: step(),
        ytl: step(),
        ytr: step(),
        ybl: step(),
        ybr: step(),
      })
      .collect()
  }

  fn total_distortion(codebook: &[YuvBlock], data: &[YuvBlock], indices: &[u32]) -> u64 {
    let mut dist = [0u64; 256];
    let mut partition: Vec<Vec<u32>> = vec![Vec::new(); codebook.len()];
    voronoi_partition(codebook, data, indices, &mut dist, &mut partition)
  }

  // The weighted centroid minimises the summed weighted distortion of its
  // partition, to within integer rounding: nudging any component by one
  // must not improve it.
  #[test]
  fn centroid_minimises_weighted_distortion() {
    let data = test_blocks(23, 7);
    let indices: Vec<u32> = (0..23).collect();
    let centroid = calculate_centroid(&data, &indices);
    let cost = |c: YuvBlock| -> u64 {
      indices
        .iter()
        .map(|&i| block_distortion(data[i as usize], c) as u64 * data[i as usize].weight as u64)
        .sum()
    };
    let base = cost(centroid);
    for axis in 0..6 {
      for delta in [-1i32, 1] {
        let mut nudged = centroid;
        match axis {
          0 => nudged.u = clamp_u8(nudged.u as i32 + delta),
          1 => nudged.v = clamp_u8(nudged.v as i32 + delta),
          2 => nudged.ytl = clamp_u8(nudged.ytl as i32 + delta),
          3 => nudged.ytr = clamp_u8(nudged.ytr as i32 + delta),
          4 => nudged.ybl = clamp_u8(nudged.ybl as i32 + delta),
          _ => nudged.ybr = clamp_u8(nudged.ybr as i32 + delta),
        }
        assert!(cost(nudged) >= base, "axis {} delta {}", axis, delta);
      }
    }
  }

  #[test]
  fn refinement_never_increases_distortion() {
    let data = test_blocks(200, 99);
    let indices: Vec<u32> = (0..200).collect();
    let mut codebook = Vec::new();
    let first = elbg_refine(&mut codebook, 16, &data, &indices, None);
    assert_eq!(codebook.len(), 16);
    assert_eq!(first, total_distortion(&codebook, &data, &indices));
    // A second refinement starting from the settled codebook may only improve
    let second = elbg_refine(&mut codebook, 16, &data, &indices, None);
    assert!(second <= first, "{} > {}", second, first);
  }

  #[test]
  fn assignments_point_at_nearest_codeword() {
    let data = test_blocks(64, 3);
    let indices: Vec<u32> = (0..64).collect();
    let mut codebook = Vec::new();
    let mut closest = vec![0u8; 64];
    elbg_refine(&mut codebook, 8, &data, &indices, Some(&mut closest[..]));
    for &i in &indices {
      let assigned = closest[i as usize] as usize;
      let d_assigned = block_distortion(data[i as usize], codebook[assigned]);
      for &code in codebook.iter() {
        assert!(block_distortion(data[i as usize], code) >= d_assigned);
      }
    }
  }
}
