// Fast pairwise-nearest-neighbour codebook seeding. The input vectors are
// copied into a scratch buffer and organised by a k-d tree; each round,
// every leaf proposes its cheapest intra-leaf pair merge and the cheaper
// half of all proposals is carried out, so merges only ever pair vectors
// that are already spatially close. The tree is rebalanced between rounds.

use crate::block::{block_distortion, clamp_u8, saturate_weight, YuvBlock, NUM_COMPONENTS};
use crate::elbg::voronoi_partition;

const LEAF_SIZE: usize = 8;
const REBALANCE_RATIO: usize = 2;

// The tree is a strict ownership tree over the scratch buffer: leaves hold
// a span of it, internal nodes exclusively own their two children. Split
// axis and threshold are only needed while building, so nodes store
// structure alone.
enum KdNode {
  Leaf { start: usize, fill: usize },
  Branch { lower: Box<KdNode>, upper: Box<KdNode> },
}

// Axis with the largest min-max extent; ties resolve to the lowest axis.
fn widest_axis(blocks: &[YuvBlock]) -> usize {
  let mut lo = [255u8; NUM_COMPONENTS];
  let mut hi = [0u8; NUM_COMPONENTS];
  for block in blocks {
    for axis in 0..NUM_COMPONENTS {
      let c = block.component(axis);
      lo[axis] = lo[axis].min(c);
      hi[axis] = hi[axis].max(c);
    }
  }
  let mut best = 0;
  for axis in 1..NUM_COMPONENTS {
    if hi[axis] - lo[axis] > hi[best] - lo[best] {
      best = axis;
    }
  }
  return best;
}

// Returns the subtree and its leaf count.
fn build(scratch: &mut [YuvBlock], start: usize, end: usize) -> (KdNode, usize) {
  let count = end - start;
  assert!(count > 0);
  if count <= LEAF_SIZE {
    return (KdNode::Leaf { start: start, fill: count }, 1);
  }
  let axis = widest_axis(&scratch[start..end]);
  let median = count / 2;
  scratch[start..end].select_nth_unstable_by_key(median, |b| b.component(axis));
  let (lower, lower_leaves) = build(scratch, start, start + median);
  let (upper, upper_leaves) = build(scratch, start + median, end);
  let node = KdNode::Branch { lower: Box::new(lower), upper: Box::new(upper) };
  (node, lower_leaves + upper_leaves)
}

fn leftmost_start(node: &KdNode) -> usize {
  match node {
    KdNode::Leaf { start, .. } => *start,
    KdNode::Branch { lower, .. } => leftmost_start(lower),
  }
}

// In-order walk compacting the subtree's vectors to a contiguous run
// beginning at `dst`; returns the number of vectors copied. Leaves are
// visited left to right and `dst` never exceeds a leaf's own start, so the
// copies move data only downwards.
fn flatten(node: &KdNode, scratch: &mut [YuvBlock], dst: usize) -> usize {
  match node {
    KdNode::Leaf { start, fill } => {
      if *start != dst {
        scratch.copy_within(*start..*start + *fill, dst);
      }
      *fill
    }
    KdNode::Branch { lower, upper } => {
      let copied = flatten(lower, scratch, dst);
      copied + flatten(upper, scratch, dst + copied)
    }
  }
}

// Bottom-up housekeeping between merge rounds: sibling leaves whose
// combined fill fits one leaf are coalesced, and a branch whose subtree
// sizes differ by more than the ratio is flattened and rebuilt in place.
// Returns the subtree's vector count.
fn rebalance(node: &mut KdNode, scratch: &mut [YuvBlock]) -> usize {
  let (lower_size, upper_size) = match node {
    KdNode::Leaf { fill, .. } => return *fill,
    KdNode::Branch { lower, upper } => (rebalance(lower, scratch), rebalance(upper, scratch)),
  };

  // Coalesce a pair of sibling leaves that fit in one
  let mut coalesce = None;
  if let KdNode::Branch { lower, upper } = node {
    if let (KdNode::Leaf { start: lstart, fill: lfill }, KdNode::Leaf { start: ustart, fill: ufill }) =
      (&**lower, &**upper)
    {
      if lfill + ufill <= LEAF_SIZE {
        coalesce = Some((*lstart, *lfill, *ustart, *ufill));
      }
    }
  }
  if let Some((lstart, lfill, ustart, ufill)) = coalesce {
    scratch.copy_within(ustart..ustart + ufill, lstart + lfill);
    *node = KdNode::Leaf { start: lstart, fill: lfill + ufill };
    return lfill + ufill;
  }

  let total = lower_size + upper_size;
  if lower_size > REBALANCE_RATIO * upper_size || upper_size > REBALANCE_RATIO * lower_size {
    let start = leftmost_start(node);
    let copied = flatten(node, scratch, start);
    debug_assert_eq!(copied, total);
    let (rebuilt, _) = build(scratch, start, start + total);
    *node = rebuilt;
  }
  return total;
}

// Cheapest merge within one leaf, scored by weighted Ward linkage.
struct MergeProposal {
  score: u32,
  first: u8,
  second: u8,
  // Interpolation factor of the merged centroid toward the first member
  inter_weight: u8,
}

fn leaf_proposal(scratch: &[YuvBlock], start: usize, fill: usize) -> Option<MergeProposal> {
  if fill < 2 {
    return None;
  }
  let mut lowest = u64::MAX;
  let mut best = (0usize, 1usize);
  for i in 0..fill - 1 {
    let a = scratch[start + i];
    for j in i + 1..fill {
      let b = scratch[start + j];
      let wa = a.weight as u64;
      let wb = b.weight as u64;
      let distortion = block_distortion(a, b) as u64 * ((wa * wb) / (wa + wb));
      if distortion < lowest {
        lowest = distortion;
        best = (i, j);
      }
    }
  }
  let wa = scratch[start + best.0].weight as u32;
  let wb = scratch[start + best.1].weight as u32;
  let inter_weight = clamp_u8(((511 * wa + wb) / (2 * (wa + wb))) as i32);
  Some(MergeProposal {
    score: lowest.min(u32::MAX as u64) as u32,
    first: best.0 as u8,
    second: best.1 as u8,
    inter_weight: inter_weight,
  })
}

fn collect_proposals(node: &KdNode, scratch: &[YuvBlock], out: &mut Vec<MergeProposal>) {
  match node {
    KdNode::Leaf { start, fill } => {
      if let Some(proposal) = leaf_proposal(scratch, *start, *fill) {
        out.push(proposal);
      }
    }
    KdNode::Branch { lower, upper } => {
      collect_proposals(lower, scratch, out);
      collect_proposals(upper, scratch, out);
    }
  }
}

// Replace the pair with its weighted centroid and close the gap in the
// leaf. The centroid interpolates toward the heavier member; the +255 bias
// rounds the 8-bit fixed-point blend upward like the original.
fn do_merge(scratch: &mut [YuvBlock], start: usize, fill: &mut usize, merge: &MergeProposal) {
  let i = merge.first as usize;
  let j = merge.second as usize;
  debug_assert!(i < j && j < *fill);
  let aw = merge.inter_weight as u32;
  let bw = 255 - aw;
  let a = scratch[start + i];
  let b = scratch[start + j];
  let mix = |x: u8, y: u8| ((x as u32 * aw + y as u32 * bw + 255) / 256) as u8;
  scratch[start + i] = YuvBlock {
    weight: saturate_weight(a.weight as u32 + b.weight as u32),
    u: mix(a.u, b.u),
    v: mix(a.v, b.v),
    ytl: mix(a.ytl, b.ytl),
    ytr: mix(a.ytr, b.ytr),
    ybl: mix(a.ybl, b.ybl),
    ybr: mix(a.ybr, b.ybr),
  };
  scratch.copy_within(start + j + 1..start + *fill, start + j);
  *fill -= 1;
}

// Second walk over the same leaf order as collect_proposals, carrying out
// the chosen merges until the budget runs out.
fn apply_merges(
  node: &mut KdNode,
  scratch: &mut [YuvBlock],
  proposals: &[MergeProposal],
  chosen: &[bool],
  cursor: &mut usize,
  budget: &mut usize,
  merged_distortion: &mut u64,
) {
  match node {
    KdNode::Leaf { start, fill } => {
      if *fill >= 2 {
        let k = *cursor;
        *cursor += 1;
        if chosen[k] && *budget > 0 {
          do_merge(scratch, *start, fill, &proposals[k]);
          *merged_distortion += proposals[k].score as u64;
          *budget -= 1;
        }
      }
    }
    KdNode::Branch { lower, upper } => {
      apply_merges(lower, scratch, proposals, chosen, cursor, budget, merged_distortion);
      apply_merges(upper, scratch, proposals, chosen, cursor, budget, merged_distortion);
    }
  }
}

// Seed a codebook of at most target_size entries by agglomerative merging
// of the selected vectors. When closest_out is given it is filled (indexed
// by raw data index) with each vector's nearest seed codeword and the
// returned value is that assignment's total weighted distortion; otherwise
// the return is the accumulated merge cost, an approximation good enough
// for diagnostics.
pub fn pnn_seed(
  codebook: &mut Vec<YuvBlock>,
  target_size: usize,
  data: &[YuvBlock],
  indices: &[u32],
  closest_out: Option<&mut [u8]>,
) -> u64 {
  assert!(target_size >= 1);
  assert!(!indices.is_empty());
  codebook.clear();

  let mut scratch: Vec<YuvBlock> = indices.iter().map(|&i| data[i as usize]).collect();
  let len = scratch.len();
  let (mut root, _leaves) = build(&mut scratch, 0, len);
  let mut vector_count = rebalance(&mut root, &mut scratch);

  let mut merged_distortion = 0u64;
  let mut proposals: Vec<MergeProposal> = Vec::new();
  while vector_count > target_size {
    proposals.clear();
    collect_proposals(&root, &scratch, &mut proposals);
    assert!(!proposals.is_empty());
    let merge_count = proposals.len();
    let budget = vector_count - target_size;

    let mut order: Vec<usize> = (0..merge_count).collect();
    let chosen_count = if vector_count - merge_count / 2 < target_size {
      // Final round: order the proposals fully so exactly the cheapest
      // merges run and the codebook lands on the target size
      order.sort_unstable_by_key(|&k| (proposals[k].score, k));
      budget.min(merge_count)
    } else {
      // Cheaper half of the proposals, median included
      let nth = merge_count / 2;
      if nth < merge_count - 1 {
        order.select_nth_unstable_by_key(nth, |&k| (proposals[k].score, k));
      }
      nth + 1
    };
    let mut chosen = vec![false; merge_count];
    for &k in &order[..chosen_count] {
      chosen[k] = true;
    }

    let performed = budget.min(chosen_count);
    let mut cursor = 0usize;
    let mut left = performed;
    apply_merges(&mut root, &mut scratch, &proposals, &chosen, &mut cursor, &mut left, &mut merged_distortion);
    debug_assert_eq!(cursor, merge_count);
    debug_assert_eq!(left, 0);
    vector_count -= performed;

    if vector_count > target_size {
      vector_count = rebalance(&mut root, &mut scratch);
    }
  }

  let copied = flatten(&root, &mut scratch, 0);
  debug_assert_eq!(copied, vector_count);
  codebook.extend_from_slice(&scratch[..vector_count]);

  if let Some(out) = closest_out {
    let mut code_distortion = vec![0u64; codebook.len()];
    let mut partition: Vec<Vec<u32>> = vec![Vec::new(); codebook.len()];
    let total = voronoi_partition(codebook, data, indices, &mut code_distortion, &mut partition);
    for (code, part) in partition.iter().enumerate() {
      for &idx in part {
        out[idx as usize] = code as u8;
      }
    }
    return total;
  }
  return merged_distortion;
}

#[cfg(test)]
mod tests {
  use super::*;

  fn test_blocks(n: usize, seed: u32) -> Vec<YuvBlock> {
    let mut state = seed;
    let mut step = move || {
      state = state.wrapping_mul(1664525).wrapping_add(1013904223);
      (state >> 24) as u8
    };
    (0..n)
      .map(|_| YuvBlock {
        weight: 1 + (step() % 4) as u16,
        u: step(),
        v: step(),
        ytl: step(),
        ytr: step(),
        ybl: step(),
        ybr: step(),
      })
      .collect()
  }

  #[test]
  fn seeds_exactly_the_target_size() {
    let data = test_blocks(600, 42);
    let indices: Vec<u32> = (0..600).collect();
    let mut codebook = Vec::new();
    let mut closest = vec![0u8; 600];
    pnn_seed(&mut codebook, 64, &data, &indices, Some(&mut closest[..]));
    assert_eq!(codebook.len(), 64);
    for &c in &closest {
      assert!((c as usize) < codebook.len());
    }
  }

  #[test]
  fn small_inputs_pass_through() {
    let data = test_blocks(5, 1);
    let indices: Vec<u32> = (0..5).collect();
    let mut codebook = Vec::new();
    pnn_seed(&mut codebook, 256, &data, &indices, None);
    assert_eq!(codebook.len(), 5);
    // No merging happened, so the seed is the input set itself
    for block in &codebook {
      assert!(data.contains(block));
    }
  }

  #[test]
  fn merging_concentrates_weight() {
    // Two tight clusters must collapse into two codewords
    let mut data = Vec::new();
    for i in 0..32u8 {
      data.push(YuvBlock { weight: 2, u: 128, v: 128, ytl: 10 + (i % 2), ytr: 10, ybl: 10, ybr: 10 });
      data.push(YuvBlock { weight: 2, u: 128, v: 128, ytl: 200 + (i % 2), ytr: 200, ybl: 200, ybr: 200 });
    }
    let indices: Vec<u32> = (0..data.len() as u32).collect();
    let mut codebook = Vec::new();
    pnn_seed(&mut codebook, 2, &data, &indices, None);
    assert_eq!(codebook.len(), 2);
    let mut lumas: Vec<u8> = codebook.iter().map(|c| c.ytl).collect();
    lumas.sort_unstable();
    assert!(lumas[0] <= 12, "dark cluster centroid at {}", lumas[0]);
    assert!(lumas[1] >= 199, "bright cluster centroid at {}", lumas[1]);
  }
}
