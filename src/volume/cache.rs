use linked_hash_map::LinkedHashMap;

use super::mft::AttrType;
use crate::error::{Error, Result};

/// Identifies one `PAGE_SIZE` page of a non-resident attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageKey {
    /// Base record of the file owning the attribute.
    pub record: u64,
    pub ty: AttrType,
    pub name: String,
    pub index: u64,
}

impl PageKey {
    pub(crate) fn belongs_to(&self, record: u64, ty: AttrType, name: &str) -> bool {
        self.record == record && self.ty == ty && self.name == name
    }
}

struct CachedPage {
    data: Vec<u8>,
    pins: u32,
}

/// LRU cache of attribute pages.
///
/// Pages are only accessible while pinned and pinned pages are never evicted.
/// The cache can therefore temporarily hold more pages than its capacity.
pub struct PageCache {
    pages: LinkedHashMap<PageKey, CachedPage>,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl PageCache {
    pub fn new(capacity: usize) -> PageCache {
        PageCache {
            pages: LinkedHashMap::new(),
            capacity: capacity.max(1),
            hits: 0,
            misses: 0,
        }
    }

    /// Pin an already cached page. Returns false if the page has to be loaded.
    pub fn pin(&mut self, key: &PageKey) -> bool {
        if let Some(page) = self.pages.get_refresh(key) {
            page.pins += 1;
            self.hits += 1;
            true
        } else {
            self.misses += 1;
            false
        }
    }

    pub fn insert_pinned(&mut self, key: PageKey, data: Vec<u8>) {
        self.pages.insert(key, CachedPage { data, pins: 1 });
        self.evict();
    }

    pub fn unpin(&mut self, key: &PageKey) -> Result<()> {
        match self.pages.get_mut(key) {
            Some(page) if page.pins > 0 => {
                page.pins -= 1;
            }
            _ => {
                return Err(Error::IoError(format!(
                    "page {} of record {} is not mapped",
                    key.index, key.record
                )))
            }
        }
        self.evict();
        Ok(())
    }

    pub fn page(&self, key: &PageKey) -> Option<&[u8]> {
        self.pages
            .get(key)
            .filter(|p| p.pins > 0)
            .map(|p| p.data.as_slice())
    }

    pub fn page_mut(&mut self, key: &PageKey) -> Option<&mut [u8]> {
        self.pages
            .get_mut(key)
            .filter(|p| p.pins > 0)
            .map(|p| p.data.as_mut_slice())
    }

    /// Drop all unpinned pages matching `pred`.
    pub fn invalidate<F>(&mut self, pred: F)
    where
        F: Fn(&PageKey) -> bool,
    {
        let stale: Vec<PageKey> = self
            .pages
            .iter()
            .filter(|(k, p)| p.pins == 0 && pred(*k))
            .map(|(k, _)| k.clone())
            .collect();
        for k in stale {
            self.pages.remove(&k);
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn pinned(&self) -> usize {
        self.pages.iter().filter(|(_, p)| p.pins > 0).count()
    }

    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    fn evict(&mut self) {
        while self.pages.len() > self.capacity {
            // Iteration starts at the least recently used page
            let victim = self
                .pages
                .iter()
                .find(|(_, p)| p.pins == 0)
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => {
                    self.pages.remove(&k);
                }
                None => break,
            }
        }
    }
}
