//! Rateless XOR forward error correction (C7): a Luby-Transform-style encoder/decoder pair used
//! to recover lost UDP packets without retransmission.
//!
//! Grounded on `lt/lt_shuffle.{hpp,cpp}`, `lt/lt_encode.{hpp,cpp}`, `lt/lt_decode.{hpp,cpp}`.
//! [`Shuffler`] draws indices without replacement from a pool that refills once exhausted,
//! guaranteeing every data block is covered at least once every `total_elements` picks.
//! [`Encoder`] XORs `num_xor_blocks` shuffled data blocks into one FEC block. [`Decoder`] runs a
//! belief-propagation-style resolution: each FEC block tracks which data block indices still
//! contribute to it, and a block with exactly one contributor left can be solved directly;
//! solving it may, in turn, shrink other FEC blocks down to one contributor, so resolution
//! cascades through a worklist until no block shrinks further (spec §8).

fn xor_block(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// Park-Miller minimal-standard LCG, matching the period/update rule of `std::minstd_rand`
/// (the shuffle only needs to be deterministic given a seed, not bit-compatible with any other
/// implementation).
struct MinStdRand(u64);

impl MinStdRand {
    const MODULUS: u64 = 2_147_483_647;
    const MULTIPLIER: u64 = 48_271;

    fn new(seed: u32) -> Self {
        let s = if seed == 0 { 1 } else { seed as u64 % Self::MODULUS };
        MinStdRand(s)
    }

    fn next(&mut self) -> u32 {
        self.0 = (self.0 * Self::MULTIPLIER) % Self::MODULUS;
        self.0 as u32
    }
}

/// Draws indices in `0..total_elements` without replacement, refilling the pool from scratch
/// once it empties so every index is revisited roughly as often as every other.
pub struct Shuffler {
    rng: MinStdRand,
    data: Vec<u32>,
    entries: usize,
}

impl Shuffler {
    pub fn new() -> Self {
        Shuffler {
            rng: MinStdRand::new(1),
            data: Vec::new(),
            entries: 0,
        }
    }

    pub fn seed(&mut self, seed: u32) {
        self.rng = MinStdRand::new(seed);
    }

    /// Drop the current pool; the next [`Shuffler::begin`] call will refill it unconditionally.
    pub fn flush(&mut self) {
        self.entries = 0;
    }

    /// Prepare to draw `selected_elements` (without replacement) out of `total_elements`. Refills
    /// the pool with `0..total_elements` whenever fewer than `selected_elements` entries remain,
    /// so a caller can draw `selected_elements` every time without checking for exhaustion itself.
    pub fn begin(&mut self, total_elements: u32, selected_elements: u32) {
        assert!(total_elements >= selected_elements);
        let total = total_elements as usize;
        if self.data.len() < total {
            self.data.resize(total, 0);
        }
        if self.entries < selected_elements as usize {
            for (i, slot) in self.data.iter_mut().enumerate().take(total) {
                *slot = i as u32;
            }
            self.entries = total;
        }
    }

    /// Draw one index, removing it from the pool (swap-with-last-and-shrink).
    pub fn pick(&mut self) -> u32 {
        assert!(self.entries > 0, "Shuffler::pick called with an empty pool");
        let index = self.rng.next() as usize % self.entries;
        let ret = self.data[index];
        self.entries -= 1;
        self.data[index] = self.data[self.entries];
        ret
    }
}

impl Default for Shuffler {
    fn default() -> Self {
        Self::new()
    }
}

/// XORs a pseudo-random subset of a block-aligned input buffer's blocks into one output FEC
/// block. The trailing input block, if short, is zero-padded.
pub struct Encoder {
    shuffler: Shuffler,
    block_size: usize,
}

impl Encoder {
    pub fn new() -> Self {
        Encoder {
            shuffler: Shuffler::new(),
            block_size: 0,
        }
    }

    pub fn set_block_size(&mut self, size: usize) {
        self.block_size = size;
    }

    pub fn seed(&mut self, seed: u32) {
        self.shuffler.seed(seed);
    }

    pub fn flush(&mut self) {
        self.shuffler.flush();
    }

    /// Fill `xor_data` (exactly `block_size` bytes) with the XOR of `num_xor_blocks` blocks drawn
    /// from `input_data`.
    pub fn generate(&mut self, xor_data: &mut [u8], input_data: &[u8], num_xor_blocks: u32) {
        assert_eq!(xor_data.len(), self.block_size);
        let block_size = self.block_size;
        let size = input_data.len();
        let input_blocks = ((size + block_size - 1) / block_size) as u32;
        self.shuffler.begin(input_blocks, num_xor_blocks);

        for i in 0..num_xor_blocks {
            let idx = self.shuffler.pick() as usize;
            let start = idx * block_size;
            let is_last = idx + 1 == input_blocks as usize;
            let copy_size = if is_last { size - start } else { block_size };

            if i == 0 {
                xor_data[..copy_size].copy_from_slice(&input_data[start..start + copy_size]);
                for b in &mut xor_data[copy_size..] {
                    *b = 0;
                }
            } else {
                xor_block(&mut xor_data[..copy_size], &input_data[start..start + copy_size]);
            }
        }
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

struct EncodedLink {
    data: Option<Vec<u8>>,
    indices: Vec<u16>,
    resolved_indices: Vec<u16>,
}

/// Reassembles an output buffer from a mix of raw (unprotected) blocks and FEC blocks, each of
/// which XORs together `num_xor_blocks` data blocks chosen the same way the encoder chose them
/// (same seed, same shuffle sequence).
pub struct Decoder {
    shuffler: Shuffler,
    block_size: usize,
    output: Vec<u8>,
    output_blocks: usize,
    decoded_blocks: usize,
    decoded_mask: Vec<bool>,
    links: Vec<EncodedLink>,
    ready: Vec<usize>,
}

impl Decoder {
    pub fn new() -> Self {
        Decoder {
            shuffler: Shuffler::new(),
            block_size: 0,
            output: Vec::new(),
            output_blocks: 0,
            decoded_blocks: 0,
            decoded_mask: Vec::new(),
            links: Vec::new(),
            ready: Vec::new(),
        }
    }

    pub fn set_block_size(&mut self, size: usize) {
        self.block_size = size;
    }

    /// The reassembled output, valid regardless of whether decoding is complete -- undecoded
    /// blocks read as zero.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn is_complete(&self) -> bool {
        self.decoded_blocks == self.output_blocks
    }

    /// Start a new decode of `size` bytes (a multiple of the block size), seeding one FEC slot
    /// per entry of `xor_block_counts` (slot `i` covers `xor_block_counts[i]` data blocks), with
    /// the same `seed` the encoder used. Slots may cover different numbers of blocks -- the
    /// encoder alternates even/odd XOR counts across FEC blocks (spec §4.8), which the original
    /// single-count-for-all-slots `begin_decode` signature can't express; this is a deliberate
    /// generalization of it.
    pub fn begin_decode(&mut self, seed: u32, size: usize, xor_block_counts: &[usize]) {
        assert_eq!(size % self.block_size, 0);
        self.output = vec![0u8; size];
        self.output_blocks = size / self.block_size;
        self.decoded_blocks = 0;
        self.decoded_mask = vec![false; self.output_blocks];
        self.ready.clear();

        self.shuffler.seed(seed);
        self.shuffler.flush();
        self.links = xor_block_counts.iter().map(|&count| self.seed_link(count)).collect();
    }

    fn seed_link(&mut self, num_xor_blocks: usize) -> EncodedLink {
        self.shuffler.begin(self.output_blocks as u32, num_xor_blocks as u32);
        let indices = (0..num_xor_blocks).map(|_| self.shuffler.pick() as u16).collect();
        EncodedLink {
            data: None,
            indices,
            resolved_indices: Vec::new(),
        }
    }

    /// Feed in FEC block `index`'s payload. Returns `true` once the whole output is decoded.
    pub fn push_fec_block(&mut self, index: usize, data: &[u8]) -> bool {
        assert_eq!(data.len(), self.block_size);
        let resolved = std::mem::take(&mut self.links[index].resolved_indices);
        let mut buf = data.to_vec();
        for ri in resolved {
            let start = ri as usize * self.block_size;
            xor_block(&mut buf, &self.output[start..start + self.block_size]);
        }
        self.links[index].data = Some(buf);

        if self.links[index].indices.len() == 1 {
            self.ready.push(index);
        }
        self.drain_ready_blocks();
        self.is_complete()
    }

    /// Feed in data block `index` directly (no FEC involved). Returns `true` once the whole
    /// output is decoded.
    pub fn push_raw_block(&mut self, index: usize, data: &[u8]) -> bool {
        assert_eq!(data.len(), self.block_size);
        let start = index * self.block_size;
        self.output[start..start + self.block_size].copy_from_slice(data);
        if self.mark_decoded_block(index) {
            self.propagate_decoded_block(index);
        }
        self.drain_ready_blocks();
        self.is_complete()
    }

    fn mark_decoded_block(&mut self, index: usize) -> bool {
        if self.decoded_mask[index] {
            return false;
        }
        self.decoded_mask[index] = true;
        self.decoded_blocks += 1;
        true
    }

    /// Tell every FEC link still covering `index` that it is now known: XOR it out of links that
    /// already have data, or remember it for links that don't have data yet (`push_fec_block`
    /// will fold it in when the payload arrives).
    fn propagate_decoded_block(&mut self, index: usize) {
        let block_size = self.block_size;
        let start = index * block_size;
        let output_block = self.output[start..start + block_size].to_vec();

        for i in 0..self.links.len() {
            let link = &mut self.links[i];
            if let Some(pos) = link.indices.iter().position(|&x| x as usize == index) {
                link.indices.swap_remove(pos);
                match link.data.as_mut() {
                    Some(data) => xor_block(data, &output_block),
                    None => link.resolved_indices.push(index as u16),
                }
                if link.indices.len() == 1 && link.data.is_some() {
                    self.ready.push(i);
                }
            }
        }
    }

    fn drain_ready_blocks(&mut self) {
        while let Some(i) = self.ready.pop() {
            self.drain_ready_block(i);
        }
    }

    fn drain_ready_block(&mut self, link_idx: usize) {
        let resolved = {
            let link = &mut self.links[link_idx];
            if link.indices.is_empty() {
                // Redundant wakeup: already solved (or solved and drained) by another path.
                None
            } else {
                let decoded_index = link.indices[0] as usize;
                link.indices.clear();
                Some((decoded_index, link.data.take()))
            }
        };

        if let Some((decoded_index, data)) = resolved {
            if self.mark_decoded_block(decoded_index) {
                if let Some(data) = data {
                    let start = decoded_index * self.block_size;
                    self.output[start..start + self.block_size].copy_from_slice(&data);
                }
                self.propagate_decoded_block(decoded_index);
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_SIZE: usize = 16;

    fn sample_data(blocks: usize) -> Vec<u8> {
        (0..blocks * BLOCK_SIZE).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn decodes_with_no_losses_from_raw_blocks_alone() {
        let data = sample_data(8);
        let mut decoder = Decoder::new();
        decoder.set_block_size(BLOCK_SIZE);
        decoder.begin_decode(42, data.len(), &[]);

        for (i, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
            let complete = decoder.push_raw_block(i, chunk);
            assert_eq!(complete, i + 1 == 8);
        }
        assert_eq!(decoder.output(), data.as_slice());
    }

    #[test]
    fn recovers_one_erasure_from_a_single_fec_block_covering_it() {
        let data = sample_data(4);
        let num_xor_blocks = 4u32;
        let mut encoder = Encoder::new();
        encoder.set_block_size(BLOCK_SIZE);
        encoder.seed(7);
        let mut fec_block = vec![0u8; BLOCK_SIZE];
        encoder.generate(&mut fec_block, &data, num_xor_blocks);

        let mut decoder = Decoder::new();
        decoder.set_block_size(BLOCK_SIZE);
        decoder.begin_decode(7, data.len(), &[num_xor_blocks as usize]);

        // Deliver every raw block except index 2, then the single FEC block that covers all 4 --
        // it should resolve the missing one.
        let mut complete = false;
        for (i, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
            if i == 2 {
                continue;
            }
            complete = decoder.push_raw_block(i, chunk);
        }
        assert!(!complete);
        complete = decoder.push_fec_block(0, &fec_block);
        assert!(complete);
        assert_eq!(decoder.output(), data.as_slice());
    }

    #[test]
    fn redundant_fec_block_after_full_raw_delivery_is_a_no_op() {
        let data = sample_data(4);
        let mut encoder = Encoder::new();
        encoder.set_block_size(BLOCK_SIZE);
        encoder.seed(3);
        let mut fec_block = vec![0u8; BLOCK_SIZE];
        encoder.generate(&mut fec_block, &data, 4);

        let mut decoder = Decoder::new();
        decoder.set_block_size(BLOCK_SIZE);
        decoder.begin_decode(3, data.len(), &[4]);

        let mut complete = false;
        for (i, chunk) in data.chunks(BLOCK_SIZE).enumerate() {
            complete = decoder.push_raw_block(i, chunk);
        }
        assert!(complete);
        // Must not panic or corrupt already-decoded output.
        let still_complete = decoder.push_fec_block(0, &fec_block);
        assert!(still_complete);
        assert_eq!(decoder.output(), data.as_slice());
    }
}
