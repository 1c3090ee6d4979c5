//! The environment index operations run against.
//!
//! A [`Volume`] simulates the collaborators an index engine needs from a
//! filesystem: a block device (a memory map), a cluster allocator, MFT
//! records holding attributes, non-resident attribute I/O and a page cache
//! handing out pinned pages of index allocations.

mod attrlist;
pub mod cache;
pub mod mft;

use std::fs::File;

use memmap2::{MmapMut, MmapOptions};
use tracing::trace;

use crate::bitmap;
use crate::config::VolumeConfig;
use crate::error::{Error, Result};
use crate::layout::{align8, PAGE_SIZE};

pub use attrlist::{AttrListEntry, MoveLog};
use cache::{PageCache, PageKey};
use mft::{AttrType, AttrValue, Attribute, MftRecord, NonResident, Run};

const STANDARD_INFORMATION_LEN: usize = 72;

/// Position of an attribute: the record holding it and its slot in that record.
///
/// Slots shift when attributes are added or removed, so locations are
/// resolved again instead of being kept across volume operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrLoc {
    pub record: u64,
    pub idx: usize,
}

pub struct Volume {
    config: VolumeConfig,
    disk: MmapMut,
    _file: Option<File>,
    cluster_bitmap: Vec<u8>,
    free_clusters: u64,
    records: Vec<MftRecord>,
    cache: PageCache,
    needs_check: bool,
    #[cfg(test)]
    fault: Option<Fault>,
}

/// Volume operation a [`Fault`] applies to.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultOp {
    MapPage(u64),
    Write,
    Resize,
}

/// A single failure armed for tests. The matching operation fails with an
/// `IoError` once `skip` earlier matches have passed.
#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fault {
    pub op: FaultOp,
    pub ty: AttrType,
    pub skip: usize,
}

impl Volume {
    /// Create a volume backed by anonymous memory.
    pub fn new(config: VolumeConfig) -> Result<Volume> {
        config.validate()?;
        let len = Self::device_len(&config)?;
        let disk = MmapMut::map_anon(len.max(1))?;
        Ok(Self::with_disk(config, disk, None))
    }

    /// Create a volume backed by an unnamed temporary file.
    pub fn with_temporary_file(config: VolumeConfig) -> Result<Volume> {
        config.validate()?;
        let len = Self::device_len(&config)?;
        let file = tempfile::tempfile()?;
        file.set_len(len.max(1).try_into()?)?;
        // SAFETY: the file is unnamed, nobody else can truncate or modify it
        let disk = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(Self::with_disk(config, disk, Some(file)))
    }

    fn device_len(config: &VolumeConfig) -> Result<usize> {
        let len = config
            .clusters
            .checked_mul(config.cluster_size as u64)
            .ok_or_else(|| Error::InvalidConfig("volume too large".to_string()))?;
        Ok(len.try_into()?)
    }

    fn with_disk(config: VolumeConfig, disk: MmapMut, file: Option<File>) -> Volume {
        let total = config.clusters;
        let mut cluster_bitmap = vec![0u8; ((total + 7) / 8) as usize];
        // Bits past the end of the device are never free
        for n in total..(cluster_bitmap.len() as u64 * 8) {
            bitmap::set_bit(&mut cluster_bitmap, n);
        }
        let cache = PageCache::new(config.cache_pages);
        Volume {
            config,
            disk,
            _file: file,
            cluster_bitmap,
            free_clusters: total,
            records: Vec::new(),
            cache,
            needs_check: false,
            #[cfg(test)]
            fault: None,
        }
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    pub fn free_clusters(&self) -> u64 {
        self.free_clusters
    }

    /// Whether a fatal error was observed and the volume needs a consistency check.
    pub fn needs_check(&self) -> bool {
        self.needs_check
    }

    pub(crate) fn mark_needs_check(&mut self) {
        self.needs_check = true;
    }

    #[cfg(test)]
    pub(crate) fn arm_fault(&mut self, fault: Fault) {
        self.fault = Some(fault);
    }

    #[cfg(test)]
    fn inject(&mut self, op: FaultOp, ty: AttrType) -> Result<()> {
        match &mut self.fault {
            Some(f) if f.op == op && f.ty == ty => {
                if f.skip > 0 {
                    f.skip -= 1;
                    return Ok(());
                }
                self.fault = None;
                Err(Error::IoError(format!("injected failure of {:?} on {:?}", op, ty)))
            }
            _ => Ok(()),
        }
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    // --- records

    /// Create a new base record holding a standard information attribute.
    pub fn create_record(&mut self) -> Result<u64> {
        let no = self.new_record(None);
        self.record_mut(no)?.insert_sorted(Attribute::resident(
            AttrType::StandardInformation,
            "",
            vec![0; STANDARD_INFORMATION_LEN],
        ));
        Ok(no)
    }

    pub(crate) fn create_extension_record(&mut self, base: u64) -> Result<u64> {
        self.record(base)?;
        Ok(self.new_record(Some(base)))
    }

    fn new_record(&mut self, base: Option<u64>) -> u64 {
        if let Some(r) = self.records.iter_mut().find(|r| !r.in_use) {
            let no = r.number;
            *r = MftRecord::new(no, base);
            return no;
        }
        let no = self.records.len() as u64;
        self.records.push(MftRecord::new(no, base));
        no
    }

    pub(crate) fn release_record(&mut self, no: u64) -> Result<()> {
        let r = self.record_mut(no)?;
        if r.base.is_none() || !r.attrs.is_empty() {
            return Err(Error::IoError(format!("record {} is still in use", no)));
        }
        r.in_use = false;
        Ok(())
    }

    pub fn record(&self, no: u64) -> Result<&MftRecord> {
        self.records
            .get(no as usize)
            .filter(|r| r.in_use)
            .ok_or_else(|| Error::IoError(format!("record {} is not in use", no)))
    }

    pub(crate) fn record_mut(&mut self, no: u64) -> Result<&mut MftRecord> {
        self.records
            .get_mut(no as usize)
            .filter(|r| r.in_use)
            .ok_or_else(|| Error::IoError(format!("record {} is not in use", no)))
    }

    /// Bytes still available in a record.
    pub fn record_free(&self, no: u64) -> Result<usize> {
        let used = self.record(no)?.bytes_in_use();
        Ok((self.config.record_size as usize).saturating_sub(used))
    }

    /// Extension records belonging to a base record.
    pub fn extension_records(&self, base: u64) -> Vec<u64> {
        self.records
            .iter()
            .filter(|r| r.in_use && r.base == Some(base))
            .map(|r| r.number)
            .collect()
    }

    pub(crate) fn map_record(&mut self, no: u64) -> Result<()> {
        self.record_mut(no)?.map_count += 1;
        Ok(())
    }

    pub(crate) fn unmap_record(&mut self, no: u64, dirty: bool) -> Result<()> {
        let r = self.record_mut(no)?;
        if r.map_count == 0 {
            return Err(Error::IoError(format!("record {} is not mapped", no)));
        }
        r.map_count -= 1;
        if dirty {
            r.dirty = true;
        }
        Ok(())
    }

    pub(crate) fn mark_record_dirty(&mut self, no: u64) -> Result<()> {
        self.record_mut(no)?.dirty = true;
        Ok(())
    }

    /// Write back all dirty records. Index blocks are written when they are unmapped.
    pub fn sync(&mut self) {
        for r in self.records.iter_mut().filter(|r| r.in_use && r.dirty) {
            trace!(record = r.number, "writing record");
            r.dirty = false;
        }
    }

    fn base_of(&self, record: u64) -> Result<u64> {
        Ok(self.record(record)?.base.unwrap_or(record))
    }

    // --- attributes

    /// Find an attribute of a file, following its attribute list if present.
    pub fn find_attribute(&self, base: u64, ty: AttrType, name: &str) -> Result<Option<AttrLoc>> {
        let rec = self.record(base)?;
        if let Some(idx) = rec.find(ty, name) {
            return Ok(Some(AttrLoc { record: base, idx }));
        }
        if rec.find(AttrType::AttributeList, "").is_none() {
            return Ok(None);
        }
        for entry in self.attribute_list(base)? {
            if entry.ty == ty && entry.name == name && entry.record != base {
                let idx = self.record(entry.record)?.find(ty, name).ok_or_else(|| {
                    Error::corrupt(format!(
                        "attribute list points to record {} which lacks the attribute",
                        entry.record
                    ))
                })?;
                return Ok(Some(AttrLoc {
                    record: entry.record,
                    idx,
                }));
            }
        }
        Ok(None)
    }

    pub fn attribute(&self, loc: AttrLoc) -> Result<&Attribute> {
        self.record(loc.record)?
            .attrs
            .get(loc.idx)
            .ok_or_else(|| Error::IoError(format!("no attribute at {:?}", loc)))
    }

    pub(crate) fn attribute_mut(&mut self, loc: AttrLoc) -> Result<&mut Attribute> {
        self.record_mut(loc.record)?
            .attrs
            .get_mut(loc.idx)
            .ok_or_else(|| Error::IoError(format!("no attribute at {:?}", loc)))
    }

    /// Add an attribute to the base record of a file.
    pub fn add_attribute(&mut self, base: u64, attr: Attribute) -> Result<AttrLoc> {
        if self.record(base)?.base.is_some() {
            return Err(Error::IoError(format!("record {} is not a base record", base)));
        }
        let has_list = self.has_attribute_list(base)?;
        let list_growth = if has_list {
            AttrListEntry::len_for(&attr.name)
        } else {
            0
        };
        if self.record_free(base)? < attr.record_len() + list_growth {
            return Err(Error::OutOfSpace);
        }
        let (ty, name) = (attr.ty, attr.name.clone());
        self.record_mut(base)?.insert_sorted(attr);
        if has_list {
            self.add_list_entry(
                base,
                AttrListEntry {
                    ty,
                    name: name.clone(),
                    record: base,
                },
            )?;
        }
        self.mark_record_dirty(base)?;
        self.find_attribute(base, ty, &name)?
            .ok_or_else(|| Error::IoError("added attribute vanished".to_string()))
    }

    /// Remove an attribute, releasing its clusters and cached pages.
    pub(crate) fn remove_attribute(&mut self, base: u64, ty: AttrType, name: &str) -> Result<()> {
        let loc = match self.find_attribute(base, ty, name)? {
            Some(loc) => loc,
            None => return Ok(()),
        };
        let attr = self.record_mut(loc.record)?.attrs.remove(loc.idx);
        if let AttrValue::NonResident(nr) = &attr.value {
            self.free_runs(&nr.runs);
        }
        self.cache.invalidate(|k| k.belongs_to(base, ty, name));
        self.mark_record_dirty(loc.record)?;
        if loc.record != base {
            self.remove_list_entry(base, ty, name)?;
            if self.record(loc.record)?.attrs.is_empty() {
                self.release_record(loc.record)?;
            }
        } else if self.has_attribute_list(base)? {
            self.remove_list_entry(base, ty, name)?;
        }
        Ok(())
    }

    /// Grow or shrink the value of a resident attribute in place.
    pub fn resize_attribute_value(&mut self, loc: AttrLoc, new_len: usize) -> Result<()> {
        #[cfg(test)]
        {
            let ty = self.attribute(loc)?.ty;
            self.inject(FaultOp::Resize, ty)?;
        }
        let record_size = self.config.record_size as usize;
        let rec = self.record(loc.record)?;
        let in_use = rec.bytes_in_use();
        let old_len = match &self.attribute(loc)?.value {
            AttrValue::Resident(v) => v.len(),
            AttrValue::NonResident(_) => {
                return Err(Error::IoError(
                    "cannot resize the value of a non-resident attribute in place".to_string(),
                ))
            }
        };
        if align8(new_len) > align8(old_len) && in_use + align8(new_len) - align8(old_len) > record_size
        {
            return Err(Error::OutOfSpace);
        }
        if let AttrValue::Resident(v) = &mut self.attribute_mut(loc)?.value {
            if new_len > v.len() {
                v.try_reserve(new_len - v.len())?;
            }
            v.resize(new_len, 0);
        }
        self.mark_record_dirty(loc.record)
    }

    /// Move the value of a resident attribute out of its record into clusters.
    pub(crate) fn make_non_resident(&mut self, loc: AttrLoc) -> Result<()> {
        let cs = self.config.cluster_size as u64;
        let record_size = self.config.record_size as usize;
        let attr = self.attribute(loc)?;
        let value = match &attr.value {
            AttrValue::Resident(v) => v.clone(),
            AttrValue::NonResident(_) => return Ok(()),
        };
        let (ty, name, old_len) = (attr.ty, attr.name.clone(), attr.record_len());
        let clusters = (value.len() as u64 + cs - 1) / cs;
        let runs = self.allocate_runs(clusters, 0)?;
        let nr = NonResident {
            runs,
            data_size: value.len() as u64,
            initialized_size: value.len() as u64,
        };
        let new_len = Attribute {
            ty,
            name,
            value: AttrValue::NonResident(nr.clone()),
        }
        .record_len();
        let in_use = self.record(loc.record)?.bytes_in_use();
        if in_use + new_len > record_size + old_len {
            self.free_runs(&nr.runs);
            return Err(Error::OutOfSpace);
        }
        write_runs(&mut self.disk, cs, &nr, 0, &value)?;
        self.attribute_mut(loc)?.value = AttrValue::NonResident(nr);
        trace!(record = loc.record, "attribute made non-resident");
        self.mark_record_dirty(loc.record)
    }

    /// Resize the cluster allocation of a non-resident attribute.
    pub(crate) fn set_allocated_clusters(&mut self, loc: AttrLoc, clusters: u64) -> Result<()> {
        let cs = self.config.cluster_size as u64;
        let record_size = self.config.record_size as usize;
        let (ty, name, nr) = match &self.attribute(loc)? {
            Attribute {
                ty,
                name,
                value: AttrValue::NonResident(nr),
            } => (*ty, name.clone(), nr.clone()),
            _ => return Err(Error::IoError("attribute is resident".to_string())),
        };
        let current = nr.allocated_clusters();
        let mut new_nr = nr.clone();

        if clusters > current {
            let extension = self.allocate_runs(clusters - current, current)?;
            for run in extension {
                match new_nr.runs.last_mut() {
                    Some(last) if last.lcn + last.len == run.lcn && last.vcn + last.len == run.vcn => {
                        last.len += run.len;
                    }
                    _ => new_nr.runs.push(run),
                }
            }
            let old_pairs = align8(mft::mapping_pairs_len(&nr.runs));
            let new_pairs = align8(mft::mapping_pairs_len(&new_nr.runs));
            let in_use = self.record(loc.record)?.bytes_in_use();
            if in_use + new_pairs > record_size + old_pairs {
                let added: Vec<Run> = runs_from(&new_nr.runs, current);
                self.free_runs(&added);
                return Err(Error::OutOfSpace);
            }
        } else if clusters < current {
            let freed = runs_from(&nr.runs, clusters);
            new_nr.runs = runs_below(&nr.runs, clusters);
            self.free_runs(&freed);
            let limit = clusters * cs;
            new_nr.data_size = new_nr.data_size.min(limit);
            new_nr.initialized_size = new_nr.initialized_size.min(limit);
            let base = self.base_of(loc.record)?;
            self.cache.invalidate(|k| {
                k.belongs_to(base, ty, &name) && k.index * PAGE_SIZE as u64 >= limit
            });
        } else {
            return Ok(());
        }
        trace!(record = loc.record, from = current, to = clusters, "attribute reallocated");
        self.attribute_mut(loc)?.value = AttrValue::NonResident(new_nr);
        self.mark_record_dirty(loc.record)
    }

    /// Set the data size of a non-resident attribute, zeroing newly exposed bytes.
    pub(crate) fn set_data_size(&mut self, loc: AttrLoc, size: u64) -> Result<()> {
        let cs = self.config.cluster_size as u64;
        let nr = match &self.attribute(loc)?.value {
            AttrValue::NonResident(nr) => nr.clone(),
            AttrValue::Resident(_) => {
                return Err(Error::IoError("attribute is resident".to_string()))
            }
        };
        if size > nr.allocated_clusters() * cs {
            return Err(Error::IoError(format!(
                "data size {} exceeds the allocation",
                size
            )));
        }
        if size > nr.initialized_size {
            let zeros = vec![0u8; (size - nr.initialized_size).try_into()?];
            write_runs(&mut self.disk, cs, &nr, nr.initialized_size, &zeros)?;
        }
        if let AttrValue::NonResident(nr) = &mut self.attribute_mut(loc)?.value {
            nr.data_size = size;
            nr.initialized_size = size;
        }
        self.mark_record_dirty(loc.record)
    }

    /// Read part of an attribute value. Bytes past its end read as zero.
    pub fn read_attribute(&self, loc: AttrLoc, offset: u64, buf: &mut [u8]) -> Result<()> {
        let cs = self.config.cluster_size as u64;
        match &self.attribute(loc)?.value {
            AttrValue::Resident(v) => {
                buf.fill(0);
                let start = (offset as usize).min(v.len());
                let end = (start + buf.len()).min(v.len());
                buf[..end - start].copy_from_slice(&v[start..end]);
                Ok(())
            }
            AttrValue::NonResident(nr) => read_runs(&self.disk, cs, nr, offset, buf),
        }
    }

    pub(crate) fn write_attribute(&mut self, loc: AttrLoc, offset: u64, data: &[u8]) -> Result<()> {
        #[cfg(test)]
        {
            let ty = self.attribute(loc)?.ty;
            self.inject(FaultOp::Write, ty)?;
        }
        let cs = self.config.cluster_size as u64;
        let record = loc.record;
        let attr = self
            .records
            .get_mut(record as usize)
            .and_then(|r| r.attrs.get_mut(loc.idx))
            .ok_or_else(|| Error::IoError(format!("no attribute at {:?}", loc)))?;
        match &mut attr.value {
            AttrValue::Resident(v) => {
                let start = offset as usize;
                let target = v.get_mut(start..start + data.len()).ok_or_else(|| {
                    Error::IoError("write past the end of a resident attribute".to_string())
                })?;
                target.copy_from_slice(data);
            }
            AttrValue::NonResident(nr) => write_runs(&mut self.disk, cs, nr, offset, data)?,
        }
        self.mark_record_dirty(record)
    }

    // --- clusters

    fn allocate_runs(&mut self, count: u64, start_vcn: u64) -> Result<Vec<Run>> {
        if count > self.free_clusters {
            return Err(Error::OutOfSpace);
        }
        let total = self.config.clusters;
        let mut runs = Vec::new();
        let mut vcn = start_vcn;
        let mut needed = count;
        let mut from = 0;
        while needed > 0 {
            let lcn = match bitmap::find_first_clear(&self.cluster_bitmap, from) {
                Some(lcn) if lcn < total => lcn,
                _ => {
                    self.free_runs(&runs);
                    return Err(Error::OutOfSpace);
                }
            };
            let mut len = 0;
            while needed > 0 && lcn + len < total && !bitmap::test_bit(&self.cluster_bitmap, lcn + len)
            {
                bitmap::set_bit(&mut self.cluster_bitmap, lcn + len);
                len += 1;
                needed -= 1;
            }
            self.free_clusters -= len;
            runs.push(Run { vcn, lcn, len });
            vcn += len;
            from = lcn + len;
        }
        Ok(runs)
    }

    fn free_runs(&mut self, runs: &[Run]) {
        for r in runs {
            for lcn in r.lcn..r.lcn + r.len {
                if bitmap::test_bit(&self.cluster_bitmap, lcn) {
                    bitmap::clear_bit(&mut self.cluster_bitmap, lcn);
                    self.free_clusters += 1;
                }
            }
        }
    }

    // --- pages

    /// Pin a page of a non-resident attribute, loading it on a cache miss.
    pub(crate) fn map_page(&mut self, key: &PageKey) -> Result<()> {
        #[cfg(test)]
        self.inject(FaultOp::MapPage(key.index), key.ty)?;
        if self.cache.pin(key) {
            return Ok(());
        }
        let loc = self
            .find_attribute(key.record, key.ty, &key.name)?
            .ok_or_else(|| Error::IoError(format!("no attribute {} to map", key.name)))?;
        let mut data = Vec::new();
        data.try_reserve_exact(PAGE_SIZE)?;
        data.resize(PAGE_SIZE, 0);
        self.read_attribute(loc, key.index * PAGE_SIZE as u64, &mut data)?;
        trace!(record = key.record, page = key.index, "page loaded");
        self.cache.insert_pinned(key.clone(), data);
        Ok(())
    }

    /// Unpin a page, writing it through to the device if it was modified.
    pub(crate) fn unmap_page(&mut self, key: &PageKey, dirty: bool) -> Result<()> {
        if dirty {
            self.write_back(key)?;
        }
        self.cache.unpin(key)
    }

    fn write_back(&mut self, key: &PageKey) -> Result<()> {
        let cs = self.config.cluster_size as u64;
        let loc = self
            .find_attribute(key.record, key.ty, &key.name)?
            .ok_or_else(|| Error::IoError(format!("no attribute {} to write", key.name)))?;
        let nr = match &self.attribute(loc)?.value {
            AttrValue::NonResident(nr) => nr.clone(),
            AttrValue::Resident(_) => {
                return Err(Error::IoError("cannot page a resident attribute".to_string()))
            }
        };
        let start = key.index * PAGE_SIZE as u64;
        let allocated = nr.allocated_clusters() * cs;
        if start >= allocated {
            return Err(Error::IoError(format!(
                "page {} lies outside of the allocation",
                key.index
            )));
        }
        let len = (allocated - start).min(PAGE_SIZE as u64) as usize;
        let page = self
            .cache
            .page(key)
            .ok_or_else(|| Error::IoError(format!("page {} is not mapped", key.index)))?;
        write_runs(&mut self.disk, cs, &nr, start, &page[..len])
    }

    pub(crate) fn page(&self, key: &PageKey) -> Result<&[u8]> {
        self.cache
            .page(key)
            .ok_or_else(|| Error::IoError(format!("page {} is not mapped", key.index)))
    }

    pub(crate) fn page_mut(&mut self, key: &PageKey) -> Result<&mut [u8]> {
        self.cache
            .page_mut(key)
            .ok_or_else(|| Error::IoError(format!("page {} is not mapped", key.index)))
    }
}

/// Runs (or parts of runs) starting at cluster `vcn` and above.
fn runs_from(runs: &[Run], vcn: u64) -> Vec<Run> {
    runs.iter()
        .filter(|r| r.vcn + r.len > vcn)
        .map(|r| {
            let skip = vcn.saturating_sub(r.vcn);
            Run {
                vcn: r.vcn + skip,
                lcn: r.lcn + skip,
                len: r.len - skip,
            }
        })
        .collect()
}

/// Runs (or parts of runs) below cluster `vcn`.
fn runs_below(runs: &[Run], vcn: u64) -> Vec<Run> {
    runs.iter()
        .filter(|r| r.vcn < vcn)
        .map(|r| Run {
            vcn: r.vcn,
            lcn: r.lcn,
            len: r.len.min(vcn - r.vcn),
        })
        .collect()
}

fn read_runs(disk: &[u8], cs: u64, nr: &NonResident, offset: u64, buf: &mut [u8]) -> Result<()> {
    let mut done = 0;
    while done < buf.len() {
        let pos = offset + done as u64;
        let in_cluster = (pos % cs) as usize;
        let chunk = (cs as usize - in_cluster).min(buf.len() - done);
        match nr.lcn_of(pos / cs) {
            Some(lcn) if pos < nr.initialized_size => {
                let start: usize = (lcn * cs).try_into()?;
                let src = disk
                    .get(start + in_cluster..start + in_cluster + chunk)
                    .ok_or_else(|| Error::IoError(format!("cluster {} outside device", lcn)))?;
                buf[done..done + chunk].copy_from_slice(src);
            }
            _ => buf[done..done + chunk].fill(0),
        }
        done += chunk;
    }
    Ok(())
}

fn write_runs(disk: &mut [u8], cs: u64, nr: &NonResident, offset: u64, data: &[u8]) -> Result<()> {
    let mut done = 0;
    while done < data.len() {
        let pos = offset + done as u64;
        let in_cluster = (pos % cs) as usize;
        let chunk = (cs as usize - in_cluster).min(data.len() - done);
        let lcn = nr.lcn_of(pos / cs).ok_or_else(|| {
            Error::IoError(format!("write at offset {} past the allocation", pos))
        })?;
        let start: usize = (lcn * cs).try_into()?;
        let dst = disk
            .get_mut(start + in_cluster..start + in_cluster + chunk)
            .ok_or_else(|| Error::IoError(format!("cluster {} outside device", lcn)))?;
        dst.copy_from_slice(&data[done..done + chunk]);
        done += chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests;
