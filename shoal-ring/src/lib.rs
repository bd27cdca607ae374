//! Consistent hash ring for shard selection.
//!
//! Keys map to shard indices through virtual nodes placed on a 32-bit hash
//! circle. Adding or removing a shard remaps only ~1/N of the key space
//! instead of reshuffling everything.

/// Virtual nodes per unit of weight.
const POINTS_PER_WEIGHT: usize = 160;

/// Immutable consistent hash ring.
///
/// Construction sorts all virtual node points once; routing is a binary
/// search over the sorted points. The ring is cheap to clone wholesale,
/// which is how membership changes are published: build a new ring and
/// swap it in, never mutate in place.
#[derive(Clone, Debug)]
pub struct HashRing {
    /// Sorted (hash point, shard index) pairs.
    points: Box<[(u32, u16)]>,
    shard_count: u16,
}

impl HashRing {
    /// Build a ring over equally-weighted shards identified by their
    /// address strings.
    pub fn build<S: AsRef<str>>(shards: &[S]) -> Self {
        let mut builder = RingBuilder::new();
        for shard in shards {
            builder.shard(shard.as_ref(), 1);
        }
        builder.build()
    }

    /// Map a key to a shard index in `0..shard_count`.
    ///
    /// The key's hash point selects the first virtual node at or after it
    /// on the circle, wrapping past the top back to the first point.
    #[inline]
    pub fn route(&self, key: &[u8]) -> usize {
        if self.shard_count <= 1 {
            return 0;
        }
        let hash = fold(fnv1a(key));
        let idx = self.points.partition_point(|&(point, _)| point < hash);
        let idx = if idx == self.points.len() { 0 } else { idx };
        self.points[idx].1 as usize
    }

    /// Number of shards on the ring.
    pub fn shard_count(&self) -> usize {
        self.shard_count as usize
    }

    /// Total number of virtual node points.
    pub fn point_count(&self) -> usize {
        self.points.len()
    }
}

/// Builder for a [`HashRing`] with per-shard weights.
#[derive(Default)]
pub struct RingBuilder {
    shards: Vec<(String, u32)>,
}

impl RingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a shard. Weight W places `160 * W` virtual nodes for it, so a
    /// double-weight shard receives roughly double the key space.
    pub fn shard(&mut self, identity: &str, weight: u32) -> &mut Self {
        self.shards.push((identity.to_owned(), weight));
        self
    }

    /// Build the immutable ring.
    ///
    /// # Panics
    ///
    /// Panics if no shards were added.
    pub fn build(&self) -> HashRing {
        assert!(!self.shards.is_empty(), "ring needs at least one shard");

        let mut points = Vec::new();
        for (shard_idx, (identity, weight)) in self.shards.iter().enumerate() {
            let num_points = POINTS_PER_WEIGHT * (*weight as usize);
            for i in 0..num_points {
                let label = format!("{identity}#{i}");
                points.push((fold(fnv1a(label.as_bytes())), shard_idx as u16));
            }
        }
        points.sort_unstable();

        HashRing {
            points: points.into_boxed_slice(),
            shard_count: self.shards.len() as u16,
        }
    }
}

/// 64-bit FNV-1a.
#[inline]
fn fnv1a(data: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Fold a 64-bit hash onto the 32-bit circle, mixing the high half in so
/// both halves contribute to the point position.
#[inline]
fn fold(hash: u64) -> u32 {
    ((hash >> 32) ^ hash) as u32
}
