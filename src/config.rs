use serde_derive::{Deserialize, Serialize};

use crate::collation::Collation;
use crate::entry::IndexKind;
use crate::error::{Error, Result};
use crate::layout::PAGE_SIZE;

/// Geometry of the simulated volume the indexes live on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub cluster_size: u32,
    pub clusters: u64,
    pub record_size: u32,
    pub cache_pages: usize,
    /// Number of bytes an index bitmap grows by when it has no clear bit left.
    pub bitmap_growth: u32,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            cluster_size: 4096,
            clusters: 4096,
            record_size: 1024,
            cache_pages: 64,
            bitmap_growth: 8,
        }
    }
}

impl VolumeConfig {
    pub fn cluster_size(mut self, cluster_size: u32) -> Self {
        self.cluster_size = cluster_size;
        self
    }

    pub fn clusters(mut self, clusters: u64) -> Self {
        self.clusters = clusters;
        self
    }

    pub fn record_size(mut self, record_size: u32) -> Self {
        self.record_size = record_size;
        self
    }

    pub fn cache_pages(mut self, cache_pages: usize) -> Self {
        self.cache_pages = cache_pages;
        self
    }

    pub fn bitmap_growth(mut self, bitmap_growth: u32) -> Self {
        self.bitmap_growth = bitmap_growth;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.cluster_size.is_power_of_two() || !(512..=65536).contains(&self.cluster_size) {
            return Err(Error::InvalidConfig(format!(
                "cluster size {} is not a power of two between 512 and 65536",
                self.cluster_size
            )));
        }
        if !self.record_size.is_power_of_two() || !(1024..=4096).contains(&self.record_size) {
            return Err(Error::InvalidConfig(format!(
                "record size {} is not 1024, 2048 or 4096",
                self.record_size
            )));
        }
        if self.bitmap_growth == 0 || self.bitmap_growth % 8 != 0 {
            return Err(Error::InvalidConfig(
                "bitmap growth must be a non-zero multiple of 8 bytes".to_string(),
            ));
        }
        if self.cache_pages == 0 {
            return Err(Error::InvalidConfig("page cache needs at least one page".to_string()));
        }
        Ok(())
    }
}

/// Parameters fixed when an index is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub name: String,
    pub kind: IndexKind,
    pub collation: Collation,
    pub block_size: u32,
}

impl IndexConfig {
    /// Configuration of a directory index (`$I30`).
    pub fn directory() -> Self {
        Self {
            name: "$I30".to_string(),
            kind: IndexKind::Directory,
            collation: Collation::FileName,
            block_size: 4096,
        }
    }

    /// Configuration of a view index such as `$SDH` or `$SII`.
    pub fn view(name: &str, collation: Collation) -> Self {
        Self {
            name: name.to_string(),
            kind: IndexKind::View,
            collation,
            block_size: 4096,
        }
    }

    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub(crate) fn validate(&self, volume: &VolumeConfig) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("index needs a name".to_string()));
        }
        if !self.block_size.is_power_of_two()
            || self.block_size < 512
            || self.block_size as usize > PAGE_SIZE
        {
            return Err(Error::InvalidConfig(format!(
                "index block size {} is not a power of two between 512 and {}",
                self.block_size, PAGE_SIZE
            )));
        }
        // During promotion the complete root is copied into one block
        if self.block_size < volume.record_size {
            return Err(Error::InvalidConfig(format!(
                "index block size {} is smaller than the record size {}",
                self.block_size, volume.record_size
            )));
        }
        Ok(())
    }
}
