//! B+tree indexes stored in the `$INDEX_ROOT`, `$INDEX_ALLOCATION` and
//! `$BITMAP` attributes of a file.
//!
//! A small index lives completely inside its root. When the root outgrows
//! the record it is promoted: its entries move into an allocation block and
//! the root keeps a single end entry pointing at that block. Deleting the
//! last entry demotes the index back to the small form.

mod alloc;
mod context;
mod delete;
mod insert;
mod lookup;
mod node;
mod verify;

use binary_layout::prelude::*;
use tracing::{debug, error};

pub use context::Context;
pub use delete::DeleteStatus;
pub use lookup::Lookup;
pub use verify::IndexStats;

use crate::collation::Collation;
use crate::config::IndexConfig;
use crate::entry::{self, IndexKind};
use crate::error::{Error, Result};
use crate::layout::{
    self, index_header, index_root, END_ENTRY_LEN, END_ENTRY_NODE_LEN, INDEXED_FILE_NAME,
    INDEX_BLOCK_HEADER_LEN, INDEX_HEADER_LEN, INDEX_ROOT_HEADER_LEN, NODE_INTERNAL, PAGE_SIZE,
    VCN_LEN,
};
use crate::volume::mft::{AttrType, AttrValue, Attribute};
use crate::volume::{AttrListEntry, AttrLoc, Volume};
use context::{CtxId, NodeLoc};

/// Handle to one index of a file.
///
/// The handle borrows the volume exclusively, so there is at most one writer
/// per volume at any time.
pub struct Index<'v> {
    vol: &'v mut Volume,
    mft: u64,
    name: String,
    kind: IndexKind,
    collation: Collation,
    block_size: u32,
    /// Size of the unit VCNs are counted in.
    vcn_size: u32,
    /// Cached highest set bit of the block bitmap.
    bmp_highest: Option<u64>,
    /// Bumped by every modification, invalidates older contexts.
    generation: u64,
    unusable: bool,
}

fn vcn_size_for(block_size: u32, cluster_size: u32) -> u32 {
    if block_size >= cluster_size {
        cluster_size
    } else {
        512
    }
}

impl<'v> Index<'v> {
    /// Create a new, empty index in the record `mft`.
    pub fn create(vol: &'v mut Volume, mft: u64, config: IndexConfig) -> Result<Index<'v>> {
        config.validate(vol.config())?;
        if vol
            .find_attribute(mft, AttrType::IndexRoot, &config.name)?
            .is_some()
        {
            return Err(Error::InvalidConfig(format!(
                "index {} already exists in record {}",
                config.name, mft
            )));
        }
        let vcn_size = vcn_size_for(config.block_size, vol.config().cluster_size);

        let mut value = vec![0u8; INDEX_ROOT_HEADER_LEN + INDEX_HEADER_LEN + END_ENTRY_LEN];
        let indexed_type = match config.kind {
            IndexKind::Directory => INDEXED_FILE_NAME,
            IndexKind::View => 0,
        };
        index_root::indexed_type::write(&mut value, indexed_type);
        index_root::collation_rule::write(&mut value, config.collation.rule());
        index_root::block_size::write(&mut value, config.block_size);
        index_root::clusters_per_block::write(&mut value, (config.block_size / vcn_size).try_into()?);
        layout::init_node(
            &mut value[INDEX_ROOT_HEADER_LEN..],
            (INDEX_HEADER_LEN + END_ENTRY_LEN) as u32,
            false,
            0,
        );

        let root = Attribute::resident(AttrType::IndexRoot, &config.name, value);
        let needed = root.record_len() + AttrListEntry::len_for(&config.name);
        if vol.record_free(mft)? < needed {
            vol.make_space(mft, mft, needed, &[])?;
        }
        vol.add_attribute(mft, root)?;
        debug!(record = mft, name = %config.name, "index created");

        Ok(Index {
            vol,
            mft,
            name: config.name,
            kind: config.kind,
            collation: config.collation,
            block_size: config.block_size,
            vcn_size,
            bmp_highest: None,
            generation: 0,
            unusable: false,
        })
    }

    /// Open an existing index of the record `mft`.
    pub fn open(vol: &'v mut Volume, mft: u64, name: &str) -> Result<Index<'v>> {
        let loc = vol
            .find_attribute(mft, AttrType::IndexRoot, name)?
            .ok_or(Error::NotFound)?;
        let header = match &vol.attribute(loc)?.value {
            AttrValue::Resident(v) if v.len() >= INDEX_ROOT_HEADER_LEN + INDEX_HEADER_LEN => {
                v[..INDEX_ROOT_HEADER_LEN].to_vec()
            }
            _ => {
                vol.mark_needs_check();
                return Err(Error::corrupt(format!("index root {} is unreadable", name)));
            }
        };
        let kind = if index_root::indexed_type::read(&header) == INDEXED_FILE_NAME {
            IndexKind::Directory
        } else {
            IndexKind::View
        };
        let block_size = index_root::block_size::read(&header);
        let collation = Collation::from_rule(index_root::collation_rule::read(&header));
        let collation = match collation {
            Ok(c) if block_size.is_power_of_two() && (512..=PAGE_SIZE as u32).contains(&block_size) => c,
            Ok(_) => {
                vol.mark_needs_check();
                return Err(Error::corrupt(format!("invalid index block size {}", block_size)));
            }
            Err(e) => {
                vol.mark_needs_check();
                return Err(e);
            }
        };
        let vcn_size = vcn_size_for(block_size, vol.config().cluster_size);
        let mut index = Index {
            vol,
            mft,
            name: name.to_string(),
            kind,
            collation,
            block_size,
            vcn_size,
            bmp_highest: None,
            generation: 0,
            unusable: false,
        };
        let highest = index.highest_set_bit();
        index.bmp_highest = index.escalate(highest)?;
        Ok(index)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    pub fn collation(&self) -> Collation {
        self.collation
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn record(&self) -> u64 {
        self.mft
    }

    pub fn volume(&self) -> &Volume {
        self.vol
    }

    /// False once a fatal error was observed, mutations are refused from then on.
    pub fn is_usable(&self) -> bool {
        !self.unusable
    }

    /// Whether the index uses allocation blocks.
    pub fn is_large(&self) -> Result<bool> {
        let v = self.root_value()?;
        Ok(index_header::flags::read(&v[INDEX_ROOT_HEADER_LEN..]) & NODE_INTERNAL != 0)
    }

    /// Data size of the `$INDEX_ALLOCATION` attribute.
    pub fn allocation_size(&self) -> Result<u64> {
        self.attribute_size(AttrType::IndexAllocation)
    }

    /// Size of the block bitmap in bytes.
    pub fn bitmap_size(&self) -> Result<u64> {
        self.attribute_size(AttrType::Bitmap)
    }

    fn attribute_size(&self, ty: AttrType) -> Result<u64> {
        match self.vol.find_attribute(self.mft, ty, &self.name)? {
            Some(loc) => Ok(self.vol.attribute(loc)?.value_len()),
            None => Ok(0),
        }
    }

    // --- error policy

    pub(crate) fn check_usable(&self) -> Result<()> {
        if self.unusable {
            return Err(Error::IndexUnusable);
        }
        Ok(())
    }

    /// Flag the volume and refuse further changes when an error is fatal.
    pub(crate) fn escalate<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                if !self.unusable {
                    error!(record = self.mft, index = %self.name, error = %e,
                        "index damaged, the volume needs a consistency check");
                }
                self.unusable = true;
                self.vol.mark_needs_check();
            }
        }
        result
    }

    /// Unlock a context at the end of a public operation.
    pub(crate) fn finish<T>(&mut self, ctx: &mut Context, result: Result<T>) -> Result<T> {
        let unlocked = self.unlock_all(ctx);
        let result = result.and_then(|v| unlocked.map(|_| v));
        self.escalate(result)
    }

    // --- node storage

    pub(crate) fn root_loc(&self) -> Result<AttrLoc> {
        self.vol
            .find_attribute(self.mft, AttrType::IndexRoot, &self.name)?
            .ok_or_else(|| Error::corrupt(format!("index root {} is missing", self.name)))
    }

    fn root_value(&self) -> Result<&[u8]> {
        match &self.vol.attribute(self.root_loc()?)?.value {
            AttrValue::Resident(v) if v.len() >= INDEX_ROOT_HEADER_LEN + INDEX_HEADER_LEN => Ok(v),
            _ => Err(Error::corrupt("index root is not a resident node")),
        }
    }

    fn root_value_mut(&mut self) -> Result<&mut Vec<u8>> {
        let loc = self.root_loc()?;
        match &mut self.vol.attribute_mut(loc)?.value {
            AttrValue::Resident(v) if v.len() >= INDEX_ROOT_HEADER_LEN + INDEX_HEADER_LEN => Ok(v),
            _ => Err(Error::corrupt("index root is not a resident node")),
        }
    }

    /// Bytes of a locked node, starting at its index header.
    pub(crate) fn node_buf(&self, ctx: &Context, id: CtxId) -> Result<&[u8]> {
        let n = ctx.node(id)?;
        if n.lock == context::LockState::Unlocked {
            return Err(Error::IoError("node accessed while unlocked".to_string()));
        }
        match n.loc {
            NodeLoc::Root => Ok(&self.root_value()?[INDEX_ROOT_HEADER_LEN..]),
            NodeLoc::Block(vcn) => {
                let key = n
                    .page
                    .as_ref()
                    .ok_or_else(|| Error::IoError(format!("block {} is not mapped", vcn)))?;
                let start = n.page_ofs + INDEX_BLOCK_HEADER_LEN;
                let end = n.page_ofs + self.block_size as usize;
                self.vol
                    .page(key)?
                    .get(start..end)
                    .ok_or_else(|| Error::IoError(format!("block {} crosses its page", vcn)))
            }
        }
    }

    pub(crate) fn node_buf_mut(&mut self, ctx: &Context, id: CtxId) -> Result<&mut [u8]> {
        let n = ctx.node(id)?;
        if n.lock == context::LockState::Unlocked {
            return Err(Error::IoError("node modified while unlocked".to_string()));
        }
        match n.loc {
            NodeLoc::Root => Ok(&mut self.root_value_mut()?[INDEX_ROOT_HEADER_LEN..]),
            NodeLoc::Block(vcn) => {
                let key = n
                    .page
                    .as_ref()
                    .ok_or_else(|| Error::IoError(format!("block {} is not mapped", vcn)))?;
                let start = n.page_ofs + INDEX_BLOCK_HEADER_LEN;
                let end = n.page_ofs + self.block_size as usize;
                self.vol
                    .page_mut(key)?
                    .get_mut(start..end)
                    .ok_or_else(|| Error::IoError(format!("block {} crosses its page", vcn)))
            }
        }
    }

    /// Resize the root node to `len` bytes, counted from its index header.
    fn set_root_len(&mut self, len: usize) -> Result<()> {
        let loc = self.root_loc()?;
        self.vol
            .resize_attribute_value(loc, INDEX_ROOT_HEADER_LEN + len)?;
        let v = self.root_value_mut()?;
        index_header::allocated_size::write(&mut v[INDEX_ROOT_HEADER_LEN..], len.try_into()?);
        Ok(())
    }

    /// Usable bytes of an allocation block node.
    pub(crate) fn block_capacity(&self) -> usize {
        self.block_size as usize - INDEX_BLOCK_HEADER_LEN
    }

    /// Largest entry accepted. Three entries in internal form always fit
    /// into one block, so any split leaves two non-empty halves.
    pub fn max_entry_len(&self) -> usize {
        ((self.block_capacity() - INDEX_HEADER_LEN - END_ENTRY_NODE_LEN) / 3 - VCN_LEN) & !7
    }

    /// Whether `need` more bytes fit into a node. The root may grow within its record.
    pub(crate) fn fits(&self, ctx: &Context, id: CtxId, need: usize) -> Result<bool> {
        let n = ctx.node(id)?;
        let buf = self.node_buf(ctx, id)?;
        let used = index_header::index_length::read(buf) as usize;
        if n.is_root() {
            Ok(need <= self.vol.record_free(n.record)?)
        } else {
            let allocated = index_header::allocated_size::read(buf) as usize;
            Ok(used + need <= allocated)
        }
    }

    pub(crate) fn entry_bytes(&self, ctx: &Context, id: CtxId, idx: usize) -> Result<Vec<u8>> {
        let ofs = *ctx
            .node(id)?
            .entries
            .get(idx)
            .ok_or_else(|| Error::corrupt(format!("no entry {} in node", idx)))?;
        let buf = self.node_buf(ctx, id)?;
        let len = entry::length(&buf[ofs..]);
        Ok(buf[ofs..ofs + len].to_vec())
    }

    /// Copies of all entries of a node, end entry included.
    pub(crate) fn node_entries(&self, ctx: &Context, id: CtxId) -> Result<Vec<Vec<u8>>> {
        let count = ctx.node(id)?.entries.len();
        let mut entries = Vec::new();
        entries.try_reserve_exact(count)?;
        for idx in 0..count {
            entries.push(self.entry_bytes(ctx, id, idx)?);
        }
        Ok(entries)
    }

    /// Replace the entries `from..to` of a node by `new`, optionally changing
    /// the node type. `to` may be one past the end entry to replace it too.
    pub(crate) fn replace_entries(
        &mut self,
        ctx: &mut Context,
        id: CtxId,
        from: usize,
        to: usize,
        new: &[Vec<u8>],
        internal: Option<bool>,
    ) -> Result<()> {
        let (is_root, start, end_ofs) = {
            let n = ctx.node(id)?;
            let start = *n
                .entries
                .get(from)
                .ok_or_else(|| Error::corrupt(format!("no entry {} in node", from)))?;
            (n.is_root(), start, n.entries.get(to).copied())
        };
        let buf = self.node_buf(ctx, id)?;
        let used = index_header::index_length::read(buf) as usize;
        let allocated = index_header::allocated_size::read(buf) as usize;
        let end = end_ofs.unwrap_or(used);
        let new_len = node::entries_len(new);
        let new_used = used - (end - start) + new_len;

        if new_used > allocated {
            if is_root {
                self.set_root_len(new_used)?;
            } else {
                debug_assert!(new_used <= allocated, "block overflow");
                return Err(Error::corrupt(format!(
                    "{} bytes do not fit into a block of {} bytes",
                    new_used, allocated
                )));
            }
        }
        {
            let buf = self.node_buf_mut(ctx, id)?;
            buf.copy_within(end..used, start + new_len);
            let mut ofs = start;
            for e in new {
                buf[ofs..ofs + e.len()].copy_from_slice(e);
                ofs += e.len();
            }
            index_header::index_length::write(buf, new_used.try_into()?);
            if let Some(internal) = internal {
                let flags = index_header::flags::read(buf);
                let flags = if internal {
                    flags | NODE_INTERNAL
                } else {
                    flags & !NODE_INTERNAL
                };
                index_header::flags::write(buf, flags);
            }
        }
        if is_root && new_used < allocated {
            self.set_root_len(new_used)?;
        }
        ctx.node_mut(id)?.dirty = true;
        self.rescan(ctx, id)
    }

    /// Point entry `idx` of an internal node at `vcn`.
    pub(crate) fn set_child(&mut self, ctx: &mut Context, id: CtxId, idx: usize, vcn: u64) -> Result<()> {
        let ofs = *ctx
            .node(id)?
            .entries
            .get(idx)
            .ok_or_else(|| Error::corrupt(format!("no entry {} in node", idx)))?;
        let buf = self.node_buf_mut(ctx, id)?;
        let len = entry::length(&buf[ofs..]);
        entry::set_child_vcn(&mut buf[ofs..ofs + len], vcn)?;
        ctx.node_mut(id)?.dirty = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests;
