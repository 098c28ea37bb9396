//! Fragment ordering before packing.
//!
//! The order fragments enter blocks decides how well the compressor can
//! exploit cross-file redundancy. All modes are deterministic: the same
//! inputs produce the same permutation, and therefore byte-identical
//! images.

use std::num::NonZeroU32;

use bstr::BString;

use crate::{Error, Result, nilsimsa, parse_size};

/// How unique fragments are permuted before packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderMode {
    /// Keep insertion (scan) order.
    None,
    /// Lexicographic by path.
    Path,
    /// Reverse lexicographic by path.
    RevPath,
    /// Size-bucketed ordering on a cheap minhash sketch. Files larger
    /// than `max-similarity-size` are emitted first, largest first.
    #[default]
    Similarity,
    /// Nilsimsa ordering: cluster by locality-sensitive digest distance.
    Nilsimsa { max_children: NonZeroU32, max_cluster_size: NonZeroU32 },
}

pub const DEFAULT_NILSIMSA_MAX_CHILDREN: u32 = 16;
pub const DEFAULT_NILSIMSA_MAX_CLUSTER_SIZE: u32 = 128;

impl std::str::FromStr for OrderMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let mode = parts.next().unwrap_or("");
        let mut opts: Vec<&str> = parts.collect();
        let only_bare = |opts: &[&str], mode: &str| -> Result<()> {
            if opts.is_empty() {
                Ok(())
            } else {
                Err(Error::bad_args(format!("order mode {mode} takes no options")))
            }
        };
        Ok(match mode {
            "none" => {
                only_bare(&opts, mode)?;
                Self::None
            }
            "path" => {
                only_bare(&opts, mode)?;
                Self::Path
            }
            "revpath" => {
                only_bare(&opts, mode)?;
                Self::RevPath
            }
            "similarity" => {
                only_bare(&opts, mode)?;
                Self::Similarity
            }
            "nilsimsa" => {
                let mut max_children = DEFAULT_NILSIMSA_MAX_CHILDREN;
                let mut max_cluster_size = DEFAULT_NILSIMSA_MAX_CLUSTER_SIZE;
                for opt in opts.drain(..) {
                    let (key, value) = opt
                        .split_once('=')
                        .ok_or_else(|| Error::bad_args(format!("bad order option: {opt}")))?;
                    let value = u32::try_from(parse_size(value)?)
                        .map_err(|_| Error::bad_args(format!("value too large: {opt}")))?;
                    match key {
                        "max-children" => max_children = value,
                        "max-cluster-size" => max_cluster_size = value,
                        _ => bail!(Error::bad_args(format!("unknown order option: {key}"))),
                    }
                }
                let invalid =
                    |what: &str| Error::bad_args(format!("{what} must be positive"));
                Self::Nilsimsa {
                    max_children: NonZeroU32::new(max_children)
                        .ok_or_else(|| invalid("max-children"))?,
                    max_cluster_size: NonZeroU32::new(max_cluster_size)
                        .ok_or_else(|| invalid("max-cluster-size"))?,
                }
            }
            _ => bail!(Error::bad_args(format!("unknown order mode: {s}"))),
        })
    }
}

/// Per-fragment inputs to ordering. `sketch` and `digest` are computed
/// while the content is read for hashing anyway.
#[derive(Debug, Clone)]
pub struct OrderKey {
    pub path: BString,
    pub size: u64,
    pub sketch: [u64; 4],
    pub digest: nilsimsa::Digest,
}

/// A cheap minhash sketch over 8-byte shingles. Fragments with similar
/// content agree on most lanes, so a lexicographic sort clusters them.
pub fn sketch(data: &[u8]) -> [u64; 4] {
    let mut mins = [u64::MAX; 4];
    for win in data.windows(8).step_by(4) {
        let h = xxhash_rust::xxh3::xxh3_64(win);
        // Four lanes keyed by the low bits, min over each lane.
        let lane = (h & 3) as usize;
        mins[lane] = mins[lane].min(h >> 2);
    }
    mins
}

/// Compute the packing permutation: indices into `keys` in emission
/// order.
pub fn order_fragments(
    mode: OrderMode,
    max_similarity_size: Option<u64>,
    keys: &[OrderKey],
) -> Vec<u32> {
    let mut idx: Vec<u32> = (0..keys.len() as u32).collect();
    match mode {
        OrderMode::None => idx,
        OrderMode::Path => {
            idx.sort_by(|&a, &b| keys[a as usize].path.cmp(&keys[b as usize].path));
            idx
        }
        OrderMode::RevPath => {
            idx.sort_by(|&a, &b| keys[b as usize].path.cmp(&keys[a as usize].path));
            idx
        }
        OrderMode::Similarity => {
            let threshold = max_similarity_size.unwrap_or(u64::MAX);
            let (mut large, mut rest): (Vec<u32>, Vec<u32>) =
                idx.into_iter().partition(|&i| keys[i as usize].size > threshold);
            // Large files first, by descending size.
            large.sort_by(|&a, &b| {
                let (ka, kb) = (&keys[a as usize], &keys[b as usize]);
                kb.size.cmp(&ka.size).then_with(|| ka.path.cmp(&kb.path))
            });
            // The rest bucketed by size magnitude, similar sketches
            // adjacent within a bucket.
            rest.sort_by(|&a, &b| {
                let (ka, kb) = (&keys[a as usize], &keys[b as usize]);
                let bucket = |k: &OrderKey| 64 - k.size.max(1).leading_zeros();
                bucket(kb)
                    .cmp(&bucket(ka))
                    .then_with(|| ka.sketch.cmp(&kb.sketch))
                    .then_with(|| ka.path.cmp(&kb.path))
            });
            large.extend(rest);
            large
        }
        OrderMode::Nilsimsa { max_children, max_cluster_size } => {
            let mut out = Vec::with_capacity(keys.len());
            emit_cluster(keys, idx, max_children.get(), max_cluster_size.get(), &mut out);
            out
        }
    }
}

/// Recursive cluster emission for nilsimsa ordering.
///
/// Oversized clusters are split around the first element as pivot into at
/// most `max_children` groups of ascending pivot distance; leaf clusters
/// are emitted as a greedy nearest-neighbor chain.
fn emit_cluster(
    keys: &[OrderKey],
    mut cluster: Vec<u32>,
    max_children: u32,
    max_cluster_size: u32,
    out: &mut Vec<u32>,
) {
    if cluster.len() <= max_cluster_size as usize {
        // Greedy chain: always hop to the nearest unemitted digest.
        let mut rest = cluster;
        let mut cur = match rest.first() {
            Some(_) => rest.remove(0),
            None => return,
        };
        out.push(cur);
        while !rest.is_empty() {
            let cur_digest = &keys[cur as usize].digest;
            let (pos, _) = rest
                .iter()
                .enumerate()
                .min_by_key(|&(_, &i)| (nilsimsa::distance(cur_digest, &keys[i as usize].digest), i))
                .expect("nonempty");
            cur = rest.remove(pos);
            out.push(cur);
        }
        return;
    }

    let pivot = cluster[0];
    let pivot_digest = keys[pivot as usize].digest;
    cluster.sort_by_key(|&i| (nilsimsa::distance(&pivot_digest, &keys[i as usize].digest), i));

    // With a single child allowed, fall back to sequential slabs so the
    // recursion always shrinks.
    let group_size = if max_children > 1 {
        cluster.len().div_ceil(max_children as usize)
    } else {
        max_cluster_size as usize
    };
    for group in cluster.chunks(group_size.max(1)) {
        emit_cluster(keys, group.to_vec(), max_children, max_cluster_size, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str, size: u64, fill: u8) -> OrderKey {
        let data = vec![fill; size as usize];
        OrderKey {
            path: path.into(),
            size,
            sketch: sketch(&data),
            digest: nilsimsa::digest(&data),
        }
    }

    #[test]
    fn parse_modes() {
        assert_eq!("none".parse::<OrderMode>().unwrap(), OrderMode::None);
        assert_eq!("revpath".parse::<OrderMode>().unwrap(), OrderMode::RevPath);
        match "nilsimsa:max-children=4:max-cluster-size=1k".parse::<OrderMode>().unwrap() {
            OrderMode::Nilsimsa { max_children, max_cluster_size } => {
                assert_eq!(max_children.get(), 4);
                assert_eq!(max_cluster_size.get(), 1024);
            }
            other => panic!("wrong mode {other:?}"),
        }
        assert!("nilsimsa:max-children=0".parse::<OrderMode>().is_err());
        assert!("path:oops=1".parse::<OrderMode>().is_err());
        assert!("zigzag".parse::<OrderMode>().is_err());
    }

    #[test]
    fn path_orders() {
        let keys = [key("b", 1, 0), key("a", 1, 0), key("c", 1, 0)];
        assert_eq!(order_fragments(OrderMode::Path, None, &keys), [1, 0, 2]);
        assert_eq!(order_fragments(OrderMode::RevPath, None, &keys), [2, 0, 1]);
        assert_eq!(order_fragments(OrderMode::None, None, &keys), [0, 1, 2]);
    }

    #[test]
    fn similarity_puts_large_files_first_descending() {
        let keys = [
            key("small1", 100, 1),
            key("big1", 5000, 2),
            key("small2", 150, 1),
            key("big2", 9000, 3),
            key("mid", 1001, 4),
        ];
        let order = order_fragments(OrderMode::Similarity, Some(1000), &keys);
        let sizes: Vec<u64> = order.iter().map(|&i| keys[i as usize].size).collect();
        assert_eq!(&sizes[..3], &[9000, 5000, 1001]);
        assert!(sizes[..3].windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn nilsimsa_is_deterministic_and_complete() {
        let keys: Vec<OrderKey> = (0..500)
            .map(|i| key(&format!("f{i:03}"), 64 + (i % 7), (i % 11) as u8))
            .collect();
        let mode = "nilsimsa:max-children=4:max-cluster-size=16".parse().unwrap();
        let a = order_fragments(mode, None, &keys);
        let b = order_fragments(mode, None, &keys);
        assert_eq!(a, b);

        let mut seen = a.clone();
        seen.sort();
        assert_eq!(seen, (0..500).collect::<Vec<u32>>());
    }

    #[test]
    fn nilsimsa_single_child_terminates() {
        let keys: Vec<OrderKey> = (0..100).map(|i| key(&format!("{i}"), 32, i as u8)).collect();
        let mode = "nilsimsa:max-children=1:max-cluster-size=8".parse().unwrap();
        let order = order_fragments(mode, None, &keys);
        assert_eq!(order.len(), 100);
    }
}
