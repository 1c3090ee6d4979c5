//! Lookup engine: key search, positional search and in-order iteration.

use std::cmp::Ordering;

use super::context::{Context, CtxId};
use super::Index;
use crate::entry::{self, IndexEntry};
use crate::error::{Error, Result};

/// No valid tree on a volume gets anywhere near this deep.
pub(crate) const MAX_DEPTH: usize = 64;

/// Outcome of a lookup.
///
/// If the key was not found, `ctx` is positioned at the entry the key would
/// be inserted in front of.
#[derive(Debug)]
pub struct Lookup {
    pub found: bool,
    pub ctx: Context,
}

impl<'v> Index<'v> {
    /// Search the index for `key`.
    pub fn lookup(&mut self, key: &[u8]) -> Result<Lookup> {
        self.collation.validate_key(key)?;
        let mut ctx = self.new_context();
        let r = self.lookup_in(&mut ctx, key);
        let found = self.finish(&mut ctx, r)?;
        Ok(Lookup { found, ctx })
    }

    /// Get the entry stored for `key`.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<IndexEntry>> {
        self.collation.validate_key(key)?;
        let mut ctx = self.new_context();
        let r = self.lookup_in(&mut ctx, key).and_then(|found| {
            if found {
                self.current_entry(&ctx).map(Some)
            } else {
                Ok(None)
            }
        });
        self.finish(&mut ctx, r)
    }

    /// Position a context at the `n`-th entry in key order, counting from zero.
    pub fn lookup_by_position(&mut self, n: u64) -> Result<Lookup> {
        let mut ctx = self.new_context();
        let r = self.position_in(&mut ctx, n);
        let found = self.finish(&mut ctx, r)?;
        Ok(Lookup { found, ctx })
    }

    /// Advance a context to the following entry. Returns false at the end of the index.
    pub fn lookup_next(&mut self, ctx: &mut Context) -> Result<bool> {
        self.check_context(ctx)?;
        let r = self.lock_path(ctx).and_then(|_| self.advance(ctx));
        self.finish(ctx, r)
    }

    /// The entry a context is positioned at.
    pub fn entry(&mut self, ctx: &mut Context) -> Result<IndexEntry> {
        self.check_context(ctx)?;
        let r = self.lock_path(ctx).and_then(|_| self.current_entry(ctx));
        self.finish(ctx, r)
    }

    /// All entries in key order.
    pub fn entries(&mut self) -> Result<Vec<IndexEntry>> {
        let mut ctx = self.new_context();
        let r = self.collect_entries(&mut ctx);
        self.finish(&mut ctx, r)
    }

    fn collect_entries(&mut self, ctx: &mut Context) -> Result<Vec<IndexEntry>> {
        let mut entries = Vec::new();
        let mut more = self.first(ctx)?;
        while more {
            entries.try_reserve(1)?;
            entries.push(self.current_entry(ctx)?);
            more = self.advance(ctx)?;
        }
        Ok(entries)
    }

    fn position_in(&mut self, ctx: &mut Context, n: u64) -> Result<bool> {
        if !self.first(ctx)? {
            return Ok(false);
        }
        for _ in 0..n {
            if !self.advance(ctx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Walk from the root down to `key`, leaving the path locked.
    pub(crate) fn lookup_in(&mut self, ctx: &mut Context, key: &[u8]) -> Result<bool> {
        let mut id = ctx.push_root();
        self.lock(ctx, id)?;
        for _ in 0..MAX_DEPTH {
            let (pos, found) = self.search_node(ctx, id, key)?;
            ctx.node_mut(id)?.entry_idx = pos;
            if found || !ctx.node(id)?.internal {
                return Ok(found);
            }
            let vcn = self.child_of(ctx, id, pos)?;
            id = self.descend(ctx, id, vcn)?;
        }
        Err(Error::corrupt("index tree exceeds the maximum depth"))
    }

    /// Binary search over the real entries of a node.
    fn search_node(&self, ctx: &Context, id: CtxId, key: &[u8]) -> Result<(usize, bool)> {
        let n = ctx.node(id)?;
        let buf = self.node_buf(ctx, id)?;
        let (mut lo, mut hi) = (0, n.real_entries());
        while lo < hi {
            let mid = (lo + hi) / 2;
            let probe = entry::key(&buf[n.entries[mid]..])?;
            match self.collation.collate(key, probe)? {
                Ordering::Equal => return Ok((mid, true)),
                Ordering::Less => hi = mid,
                Ordering::Greater => lo = mid + 1,
            }
        }
        Ok((lo, false))
    }

    pub(crate) fn child_of(&self, ctx: &Context, id: CtxId, idx: usize) -> Result<u64> {
        let ofs = *ctx
            .node(id)?
            .entries
            .get(idx)
            .ok_or_else(|| Error::corrupt(format!("no entry {} in node", idx)))?;
        entry::child_vcn(&self.node_buf(ctx, id)?[ofs..])
    }

    pub(crate) fn current_entry(&self, ctx: &Context) -> Result<IndexEntry> {
        let bottom = ctx.bottom()?;
        let n = ctx.node(bottom)?;
        if n.entry_idx >= n.real_entries() {
            return Err(Error::NotFound);
        }
        let raw = self.entry_bytes(ctx, bottom, n.entry_idx)?;
        IndexEntry::decode(&raw, self.kind)
    }

    /// Position a fresh context at the first entry of the index.
    pub(crate) fn first(&mut self, ctx: &mut Context) -> Result<bool> {
        let root = ctx.push_root();
        self.lock(ctx, root)?;
        let leaf = self.descend_leftmost(ctx, root)?;
        Ok(ctx.node(leaf)?.real_entries() > 0)
    }

    /// Descend through the entries at the current positions down to a leaf,
    /// taking the first entry of every node below `id`.
    fn descend_leftmost(&mut self, ctx: &mut Context, mut id: CtxId) -> Result<CtxId> {
        for _ in 0..MAX_DEPTH {
            let n = ctx.node(id)?;
            if !n.internal {
                return Ok(id);
            }
            let vcn = self.child_of(ctx, id, n.entry_idx)?;
            id = self.descend(ctx, id, vcn)?;
            ctx.node_mut(id)?.entry_idx = 0;
        }
        Err(Error::corrupt("index tree exceeds the maximum depth"))
    }

    /// Move a locked, positioned context to the next entry in key order.
    pub(crate) fn advance(&mut self, ctx: &mut Context) -> Result<bool> {
        let bottom = ctx.bottom()?;
        let (internal, idx, real) = {
            let n = ctx.node(bottom)?;
            (n.internal, n.entry_idx, n.real_entries())
        };
        if idx >= real && ctx.parent(bottom)?.is_none() && !internal {
            return Ok(false);
        }
        if internal {
            // The entries following an internal entry start in the subtree right of it
            if idx >= real {
                return Ok(false);
            }
            ctx.node_mut(bottom)?.entry_idx = idx + 1;
            self.descend_leftmost(ctx, bottom)?;
            return Ok(true);
        }
        if idx + 1 < real {
            ctx.node_mut(bottom)?.entry_idx = idx + 1;
            return Ok(true);
        }

        let mut id = bottom;
        loop {
            match ctx.parent(id)? {
                None => {
                    let n = ctx.node_mut(id)?;
                    n.entry_idx = n.real_entries();
                    return Ok(false);
                }
                Some(parent) => {
                    self.unlock(ctx, id)?;
                    ctx.release(id)?;
                    let n = ctx.node(parent)?;
                    if n.entry_idx < n.real_entries() {
                        return Ok(true);
                    }
                    id = parent;
                }
            }
        }
    }
}
