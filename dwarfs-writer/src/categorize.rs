//! The categorizer boundary.
//!
//! Categorizers are opaque classifiers: given a file's content they split
//! it into [`Fragment`]s, each tagged with a category name (for example
//! `pcmaudio/waveform` or `incompressible`). Categories drive per-block
//! compressor selection; the writer itself never interprets the tags.
//!
//! This crate ships only the trivial built-in `incompressible`
//! categorizer; richer ones (audio, images) plug in through the
//! [`Categorizer`] trait.

use bstr::BStr;
use indexmap::IndexSet;

use crate::{Error, Result};

/// Interned category tag. Id 0 is always the default category.
pub type CategoryId = u32;

/// The name of the implicit default category.
pub const DEFAULT_CATEGORY: &str = "<default>";

/// A contiguous byte range of one file sharing a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    pub offset: u64,
    pub len: u64,
    pub category: CategoryId,
}

/// Interner for category names. Ids are dense and stable in first-use
/// order; they index the per-category packer state and end up in the
/// image's category table.
#[derive(Debug)]
pub struct CategoryRegistry {
    names: IndexSet<String>,
}

impl Default for CategoryRegistry {
    fn default() -> Self {
        let mut names = IndexSet::new();
        names.insert(DEFAULT_CATEGORY.to_owned());
        Self { names }
    }
}

impl CategoryRegistry {
    pub fn intern(&mut self, name: &str) -> CategoryId {
        self.names.insert_full(name.to_owned()).0 as CategoryId
    }

    pub fn lookup(&self, name: &str) -> Option<CategoryId> {
        self.names.get_index_of(name).map(|i| i as CategoryId)
    }

    pub fn name(&self, id: CategoryId) -> &str {
        self.names.get_index(id as usize).expect("interned id")
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = &str> {
        self.names.iter().map(|s| s.as_str())
    }
}

/// An opaque content classifier.
pub trait Categorizer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Split `data` into tagged fragments covering the whole file, or
    /// `None` if this categorizer does not apply. Fragments must be
    /// contiguous and in order.
    fn categorize(
        &self,
        path: &BStr,
        data: &[u8],
        categories: &mut CategoryRegistry,
    ) -> Option<Vec<Fragment>>;
}

/// Create a built-in categorizer by name.
pub fn create_categorizer(name: &str) -> Result<Box<dyn Categorizer>> {
    match name {
        "incompressible" => Ok(Box::new(Incompressible)),
        _ => Err(Error::bad_args(format!("unknown categorizer: {name}"))),
    }
}

/// An ordered set of categorizers; the first one that applies wins, and
/// files nothing claims become one default-category fragment.
#[derive(Default)]
pub struct CategorizerSet {
    list: Vec<Box<dyn Categorizer>>,
}

impl std::fmt::Debug for CategorizerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.list.iter().map(|c| c.name())).finish()
    }
}

impl CategorizerSet {
    /// Build from a comma separated list of categorizer names.
    pub fn from_names(names: &str) -> Result<Self> {
        let mut this = Self::default();
        for name in names.split(',').filter(|n| !n.is_empty()) {
            this.list.push(create_categorizer(name)?);
        }
        Ok(this)
    }

    /// Append a categorizer, tried after the ones already present.
    pub fn push(&mut self, categorizer: Box<dyn Categorizer>) {
        self.list.push(categorizer);
    }

    pub fn categorize(
        &self,
        path: &BStr,
        data: &[u8],
        categories: &mut CategoryRegistry,
    ) -> Vec<Fragment> {
        for c in &self.list {
            if let Some(fragments) = c.categorize(path, data, categories) {
                debug_assert_eq!(
                    fragments.iter().map(|f| f.len).sum::<u64>(),
                    data.len() as u64,
                    "fragments from {} do not cover the file",
                    c.name(),
                );
                return fragments;
            }
        }
        vec![Fragment { offset: 0, len: data.len() as u64, category: 0 }]
    }
}

/// Tags whole files that do not compress as `incompressible`, so they can
/// be bound to the null codec instead of wasting compressor time.
struct Incompressible;

impl Categorizer for Incompressible {
    fn name(&self) -> &'static str {
        "incompressible"
    }

    fn categorize(
        &self,
        _path: &BStr,
        data: &[u8],
        categories: &mut CategoryRegistry,
    ) -> Option<Vec<Fragment>> {
        const SAMPLE: usize = 16 << 10;
        if data.is_empty() {
            return None;
        }
        let sample = &data[..data.len().min(SAMPLE)];
        let compressed = zstd_sample_len(sample)?;
        // Within 2% of the input: treat as incompressible.
        if compressed * 100 >= sample.len() * 98 {
            let category = categories.intern("incompressible");
            Some(vec![Fragment { offset: 0, len: data.len() as u64, category }])
        } else {
            None
        }
    }
}

fn zstd_sample_len(sample: &[u8]) -> Option<usize> {
    zstd::bulk::compress(sample, 1).ok().map(|v| v.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_category_is_zero() {
        let mut reg = CategoryRegistry::default();
        assert_eq!(reg.lookup(DEFAULT_CATEGORY), Some(0));
        let pcm = reg.intern("pcmaudio/waveform");
        assert_eq!(reg.intern("pcmaudio/waveform"), pcm);
        assert_eq!(reg.name(pcm), "pcmaudio/waveform");
    }

    #[test]
    fn uncategorized_files_get_one_default_fragment() {
        let set = CategorizerSet::default();
        let mut reg = CategoryRegistry::default();
        let frags = set.categorize(BStr::new("x"), b"hello", &mut reg);
        assert_eq!(frags, [Fragment { offset: 0, len: 5, category: 0 }]);
    }

    #[test]
    fn incompressible_detection() {
        let set = CategorizerSet::from_names("incompressible").unwrap();
        let mut reg = CategoryRegistry::default();

        let compressible = b"abcdefgh".repeat(4096);
        let frags = set.categorize(BStr::new("a"), &compressible, &mut reg);
        assert_eq!(frags[0].category, 0);

        // A pseudo-random buffer does not shrink.
        let mut x = 0x9e3779b97f4a7c15u64;
        let random: Vec<u8> = std::iter::repeat_with(|| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            x as u8
        })
        .take(32 << 10)
        .collect();
        let frags = set.categorize(BStr::new("b"), &random, &mut reg);
        assert_eq!(reg.name(frags[0].category), "incompressible");
    }
}
