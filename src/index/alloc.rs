//! Block allocator.
//!
//! Bit `n` of the `$BITMAP` attribute is set while block `n` of the
//! `$INDEX_ALLOCATION` attribute is part of the tree. A clear bit always
//! means the block is unused, whatever the allocation size says.

use tracing::{debug, trace};

use super::Index;
use crate::bitmap;
use crate::error::{Error, Result};
use crate::layout;
use crate::volume::mft::{AttrType, AttrValue};
use crate::volume::AttrLoc;

fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

impl<'v> Index<'v> {
    pub(crate) fn allocation_loc(&self) -> Result<Option<AttrLoc>> {
        self.vol
            .find_attribute(self.mft, AttrType::IndexAllocation, &self.name)
    }

    pub(crate) fn bitmap_loc(&self) -> Result<Option<AttrLoc>> {
        self.vol.find_attribute(self.mft, AttrType::Bitmap, &self.name)
    }

    pub(crate) fn vcn_of_block(&self, n: u64) -> u64 {
        n * (self.block_size / self.vcn_size) as u64
    }

    pub(crate) fn block_of_vcn(&self, vcn: u64) -> u64 {
        vcn / (self.block_size / self.vcn_size) as u64
    }

    pub(crate) fn read_bitmap(&self) -> Result<Vec<u8>> {
        let loc = match self.bitmap_loc()? {
            Some(loc) => loc,
            None => return Ok(Vec::new()),
        };
        let len = self.vol.attribute(loc)?.value_len().try_into()?;
        let mut bits = Vec::new();
        bits.try_reserve_exact(len)?;
        bits.resize(len, 0);
        self.vol.read_attribute(loc, 0, &mut bits)?;
        Ok(bits)
    }

    pub(crate) fn highest_set_bit(&self) -> Result<Option<u64>> {
        let bits = self.read_bitmap()?;
        Ok(bitmap::find_last_set(&bits, bits.len() as u64 * 8))
    }

    fn set_block_bit(&mut self, n: u64, used: bool) -> Result<()> {
        let loc = self
            .bitmap_loc()?
            .ok_or_else(|| Error::corrupt("index has no bitmap"))?;
        let mut byte = [0u8];
        self.vol.read_attribute(loc, n / 8, &mut byte)?;
        if used {
            bitmap::set_bit(&mut byte, n % 8);
        } else {
            bitmap::clear_bit(&mut byte, n % 8);
        }
        self.vol.write_attribute(loc, n / 8, &byte)
    }

    /// Resize the bitmap value. A resident bitmap that cannot grow in its
    /// record is moved out of it.
    fn set_bitmap_len(&mut self, len: u64) -> Result<()> {
        let cs = self.vol.config().cluster_size as u64;
        let mut loc = self
            .bitmap_loc()?
            .ok_or_else(|| Error::corrupt("index has no bitmap"))?;
        if self.vol.attribute(loc)?.is_resident() {
            match self.vol.resize_attribute_value(loc, len.try_into()?) {
                Err(Error::OutOfSpace) => {
                    self.vol.make_non_resident(loc)?;
                    debug!(record = self.mft, index = %self.name, "bitmap made non-resident");
                    loc = self
                        .bitmap_loc()?
                        .ok_or_else(|| Error::corrupt("index bitmap vanished"))?;
                }
                r => return r,
            }
        }
        let allocated = match &self.vol.attribute(loc)?.value {
            AttrValue::NonResident(nr) => nr.allocated_clusters(),
            AttrValue::Resident(_) => return Err(Error::corrupt("index bitmap is resident")),
        };
        let clusters = div_ceil(len, cs);
        if clusters > allocated {
            self.vol.set_allocated_clusters(loc, clusters)?;
            self.vol.set_data_size(loc, len)
        } else {
            self.vol.set_data_size(loc, len)?;
            self.vol.set_allocated_clusters(loc, clusters)
        }
    }

    /// Allocate a block and lay out an empty leaf node in it.
    pub(crate) fn allocate_block(&mut self) -> Result<u64> {
        let bits = self.read_bitmap()?;
        let old_len = bits.len() as u64;
        let n = match bitmap::find_first_clear(&bits, 0) {
            Some(n) => n,
            None => {
                let growth = self.vol.config().bitmap_growth as u64;
                self.set_bitmap_len(old_len + growth)?;
                old_len * 8
            }
        };
        if let Err(e) = self.set_block_bit(n, true) {
            self.release_bit(n, old_len);
            return Err(e);
        }
        let vcn = self.vcn_of_block(n);
        if let Err(e) = self.init_block(n, vcn) {
            self.release_bit(n, old_len);
            return Err(e);
        }
        if self.bmp_highest.map_or(true, |h| n > h) {
            self.bmp_highest = Some(n);
        }
        trace!(record = self.mft, index = %self.name, vcn, "index block allocated");
        Ok(vcn)
    }

    /// Undo a partial allocation of block `n`, giving back bitmap growth.
    fn release_bit(&mut self, n: u64, bitmap_len: u64) {
        if let Err(e) = self.set_block_bit(n, false) {
            debug!(block = n, error = %e, "could not clear the bit of a failed allocation");
        }
        let r = self
            .read_bitmap()
            .and_then(|bits| {
                if bits.len() as u64 > bitmap_len {
                    self.set_bitmap_len(bitmap_len)
                } else {
                    Ok(())
                }
            })
            .and_then(|_| self.shrink_allocation());
        if let Err(e) = r {
            debug!(error = %e, "rolling back a block allocation left the index larger");
        }
    }

    fn init_block(&mut self, n: u64, vcn: u64) -> Result<()> {
        let cs = self.vol.config().cluster_size as u64;
        let bs = self.block_size as u64;
        let loc = self
            .allocation_loc()?
            .ok_or_else(|| Error::corrupt("index has no allocation"))?;
        let (allocated, data_size) = match &self.vol.attribute(loc)?.value {
            AttrValue::NonResident(nr) => (nr.allocated_clusters() * cs, nr.data_size),
            AttrValue::Resident(_) => return Err(Error::corrupt("index allocation is resident")),
        };
        let end = (n + 1) * bs;
        if end > allocated {
            self.vol.set_allocated_clusters(loc, div_ceil(end, cs))?;
        }
        if end > data_size {
            self.vol.set_data_size(loc, end)?;
        }

        let (key, ofs) = self.block_page(vcn)?;
        self.vol.map_page(&key)?;
        let r = self.vol.page_mut(&key).and_then(|page| {
            let block = page
                .get_mut(ofs..ofs + bs as usize)
                .ok_or_else(|| Error::IoError(format!("block {} crosses its page", vcn)))?;
            layout::init_index_block(block, vcn);
            Ok(())
        });
        let unmapped = self.vol.unmap_page(&key, r.is_ok());
        r.and(unmapped)
    }

    /// Return a block to the bitmap. Shrinking the attributes afterwards is
    /// best effort.
    pub(crate) fn free_block(&mut self, vcn: u64) -> Result<()> {
        let n = self.block_of_vcn(vcn);
        self.set_block_bit(n, false)?;
        trace!(record = self.mft, index = %self.name, vcn, "index block freed");
        if self.bmp_highest == Some(n) {
            let bits = self.read_bitmap()?;
            self.bmp_highest = bitmap::find_last_set(&bits, n);
            if let Err(e) = self.shrink_allocation() {
                debug!(record = self.mft, index = %self.name, error = %e,
                    "index allocation not shrunk");
            }
        }
        Ok(())
    }

    /// Shrink the allocation (and a non-resident bitmap) to the highest block in use.
    fn shrink_allocation(&mut self) -> Result<()> {
        let cs = self.vol.config().cluster_size as u64;
        let growth = self.vol.config().bitmap_growth as u64;
        let blocks = self.bmp_highest.map_or(0, |h| h + 1);
        let end = blocks * self.block_size as u64;

        if let Some(loc) = self.allocation_loc()? {
            let (allocated, data_size) = match &self.vol.attribute(loc)?.value {
                AttrValue::NonResident(nr) => (nr.allocated_clusters(), nr.data_size),
                AttrValue::Resident(_) => return Ok(()),
            };
            if data_size > end {
                self.vol.set_data_size(loc, end)?;
            }
            if div_ceil(end, cs) < allocated {
                self.vol.set_allocated_clusters(loc, div_ceil(end, cs))?;
            }
        }
        if let Some(loc) = self.bitmap_loc()? {
            let attr = self.vol.attribute(loc)?;
            let len = div_ceil(div_ceil(blocks, 8), growth) * growth;
            if !attr.is_resident() && len < attr.value_len() {
                self.set_bitmap_len(len)?;
            }
        }
        Ok(())
    }

    /// Drop all blocks when the index returns to its small form.
    pub(crate) fn reset_allocation(&mut self) -> Result<()> {
        if let Some(loc) = self.allocation_loc()? {
            self.vol.set_data_size(loc, 0)?;
            self.vol.set_allocated_clusters(loc, 0)?;
        }
        if self.bitmap_loc()?.is_some() {
            self.set_bitmap_len(0)?;
        }
        self.bmp_highest = None;
        debug!(record = self.mft, index = %self.name, "index demoted to small form");
        Ok(())
    }
}
