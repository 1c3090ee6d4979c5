//! Tree path tracking and node locking.
//!
//! A [`Context`] owns the nodes visited by an operation. Nodes live in an
//! arena and refer to each other by slot, forming a circular doubly linked
//! list from the root (top) down to the current node (bottom): `up` of the
//! root wraps around to the bottom and `down` of the bottom wraps to the root.
//! Nodes are located by logical position (root or block VCN) plus byte
//! offsets, so nothing has to be fixed up when a node is mapped again.

use binary_layout::prelude::*;

use super::node;
use super::Index;
use crate::error::{Error, Result};
use crate::layout::{index_block, INDEX_BLOCK_HEADER_LEN, INDEX_BLOCK_MAGIC, PAGE_SIZE};
use crate::volume::cache::PageKey;
use crate::volume::mft::AttrType;

pub(crate) type CtxId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeLoc {
    Root,
    Block(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockState {
    Unlocked,
    Owned,
    /// Block on a page already pinned by another node of the same context.
    Shared(CtxId),
}

/// An entry waiting to be inserted into a node.
#[derive(Debug, Clone)]
pub(crate) struct PendingInsert {
    pub bytes: Vec<u8>,
    pub pos: usize,
    /// New child of the entry following the inserted one, set when the entry
    /// is the median of a split child.
    pub right_child: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct SplitPlan {
    pub median: usize,
    pub new_vcn: u64,
}

#[derive(Debug, Clone)]
pub(crate) struct NodeCtx {
    pub loc: NodeLoc,
    up: CtxId,
    down: CtxId,
    pub entries: Vec<usize>,
    pub internal: bool,
    pub entry_idx: usize,
    pub lock: LockState,
    pub dirty: bool,
    /// Allows an empty leaf while a new block is being filled.
    pub fresh: bool,
    pub page: Option<PageKey>,
    pub page_ofs: usize,
    /// Record holding the root while it is locked.
    pub record: u64,
    pub insert: Option<PendingInsert>,
    pub split: Option<SplitPlan>,
}

impl NodeCtx {
    pub fn real_entries(&self) -> usize {
        self.entries.len().saturating_sub(1)
    }

    pub fn is_root(&self) -> bool {
        self.loc == NodeLoc::Root
    }

    /// Position in the lock order: blocks by VCN, the root after all of them.
    fn order_of(loc: NodeLoc) -> (bool, u64) {
        match loc {
            NodeLoc::Root => (true, 0),
            NodeLoc::Block(vcn) => (false, vcn),
        }
    }

    fn lock_order(&self) -> (bool, u64) {
        NodeCtx::order_of(self.loc)
    }

    pub fn vcn(&self) -> Result<u64> {
        match self.loc {
            NodeLoc::Block(vcn) => Ok(vcn),
            NodeLoc::Root => Err(Error::corrupt("the index root has no VCN")),
        }
    }
}

/// Position inside an index, returned by lookups.
///
/// A context is only valid until the index is modified through another
/// context. It holds no locks between calls.
#[derive(Debug)]
pub struct Context {
    nodes: Vec<Option<NodeCtx>>,
    root: Option<CtxId>,
    pub(crate) generation: u64,
    /// Nodes in the order their storage was mapped.
    #[cfg(test)]
    pub(crate) pins: Vec<NodeLoc>,
}

impl Context {
    pub(crate) fn new(generation: u64) -> Context {
        Context {
            nodes: Vec::new(),
            root: None,
            generation,
            #[cfg(test)]
            pins: Vec::new(),
        }
    }

    /// Number of nodes on the path from the root to the current node.
    pub fn depth(&self) -> usize {
        self.path().len()
    }

    /// Create a node that is not linked into the path.
    pub(crate) fn alloc(&mut self, loc: NodeLoc) -> CtxId {
        let id = self
            .nodes
            .iter()
            .position(|n| n.is_none())
            .unwrap_or(self.nodes.len());
        let node = NodeCtx {
            loc,
            up: id,
            down: id,
            entries: Vec::new(),
            internal: false,
            entry_idx: 0,
            lock: LockState::Unlocked,
            dirty: false,
            fresh: false,
            page: None,
            page_ofs: 0,
            record: 0,
            insert: None,
            split: None,
        };
        if id == self.nodes.len() {
            self.nodes.push(Some(node));
        } else {
            self.nodes[id] = Some(node);
        }
        id
    }

    pub(crate) fn push_root(&mut self) -> CtxId {
        let id = self.alloc(NodeLoc::Root);
        self.root = Some(id);
        id
    }

    pub(crate) fn root(&self) -> Result<CtxId> {
        self.root
            .ok_or_else(|| Error::IoError("context is not positioned".to_string()))
    }

    pub(crate) fn bottom(&self) -> Result<CtxId> {
        Ok(self.node(self.root()?)?.up)
    }

    pub(crate) fn node(&self, id: CtxId) -> Result<&NodeCtx> {
        self.nodes
            .get(id)
            .and_then(|n| n.as_ref())
            .ok_or_else(|| Error::IoError(format!("context slot {} is empty", id)))
    }

    pub(crate) fn node_mut(&mut self, id: CtxId) -> Result<&mut NodeCtx> {
        self.nodes
            .get_mut(id)
            .and_then(|n| n.as_mut())
            .ok_or_else(|| Error::IoError(format!("context slot {} is empty", id)))
    }

    pub(crate) fn parent(&self, id: CtxId) -> Result<Option<CtxId>> {
        if Some(id) == self.root {
            return Ok(None);
        }
        let up = self.node(id)?.up;
        Ok(if up == id { None } else { Some(up) })
    }

    pub(crate) fn child(&self, id: CtxId) -> Result<Option<CtxId>> {
        let down = self.node(id)?.down;
        Ok(if Some(down) == self.root || down == id {
            None
        } else {
            Some(down)
        })
    }

    /// Link a detached node directly below `parent`.
    pub(crate) fn link_below(&mut self, parent: CtxId, id: CtxId) -> Result<()> {
        let below = self.node(parent)?.down;
        self.node_mut(id)?.up = parent;
        self.node_mut(id)?.down = below;
        self.node_mut(parent)?.down = id;
        self.node_mut(below)?.up = id;
        Ok(())
    }

    /// Take a node out of the path, leaving its neighbours linked to each other.
    pub(crate) fn disconnect(&mut self, id: CtxId) -> Result<()> {
        let (up, down) = {
            let n = self.node(id)?;
            (n.up, n.down)
        };
        if up != id {
            self.node_mut(up)?.down = down;
            self.node_mut(down)?.up = up;
        }
        let n = self.node_mut(id)?;
        n.up = id;
        n.down = id;
        Ok(())
    }

    /// Move a node to sit directly below `dst`.
    pub(crate) fn splice(&mut self, id: CtxId, dst: CtxId) -> Result<()> {
        self.disconnect(id)?;
        self.link_below(dst, id)
    }

    pub(crate) fn release(&mut self, id: CtxId) -> Result<()> {
        if self.node(id)?.lock != LockState::Unlocked {
            return Err(Error::IoError(format!("releasing locked context slot {}", id)));
        }
        self.disconnect(id)?;
        self.nodes[id] = None;
        Ok(())
    }

    /// Nodes on the path, from the root down.
    pub(crate) fn path(&self) -> Vec<CtxId> {
        let mut path = Vec::new();
        let mut id = self.root;
        while let Some(current) = id {
            path.push(current);
            id = self.child(current).ok().flatten();
        }
        path
    }

    fn live(&self) -> Vec<CtxId> {
        (0..self.nodes.len())
            .filter(|id| self.nodes[*id].is_some())
            .collect()
    }

    fn owner_of(&self, key: &PageKey, except: CtxId) -> Option<CtxId> {
        self.live().into_iter().find(|id| {
            *id != except
                && self.nodes[*id].as_ref().map_or(false, |n| {
                    n.lock == LockState::Owned && n.page.as_ref() == Some(key)
                })
        })
    }
}

impl<'v> Index<'v> {
    pub(crate) fn new_context(&self) -> Context {
        Context::new(self.generation)
    }

    pub(crate) fn check_context(&self, ctx: &Context) -> Result<()> {
        if ctx.generation != self.generation || ctx.root.is_none() {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    /// Page and offset of an allocation block.
    pub(crate) fn block_page(&self, vcn: u64) -> Result<(PageKey, usize)> {
        let pos = vcn
            .checked_mul(self.vcn_size as u64)
            .ok_or_else(|| Error::corrupt(format!("VCN {} is out of range", vcn)))?;
        let key = PageKey {
            record: self.mft,
            ty: AttrType::IndexAllocation,
            name: self.name.clone(),
            index: pos / PAGE_SIZE as u64,
        };
        Ok((key, (pos % PAGE_SIZE as u64) as usize))
    }

    /// Reject a child pointer that does not name a block of the allocation.
    pub(crate) fn check_vcn(&self, vcn: u64) -> Result<()> {
        let per_block = (self.block_size / self.vcn_size) as u64;
        if vcn % per_block != 0 {
            return Err(Error::corrupt(format!("VCN {} does not start a block", vcn)));
        }
        let end = self
            .block_of_vcn(vcn)
            .checked_add(1)
            .and_then(|blocks| blocks.checked_mul(self.block_size as u64))
            .ok_or_else(|| Error::corrupt(format!("VCN {} is out of range", vcn)))?;
        let size = match self.allocation_loc()? {
            Some(loc) => self.vol.attribute(loc)?.value_len(),
            None => 0,
        };
        if end > size {
            return Err(Error::corrupt(format!(
                "block at VCN {} lies past the allocation of {} bytes",
                vcn, size
            )));
        }
        Ok(())
    }

    /// Lock a node.
    ///
    /// Locks are always taken in ascending storage order with the root last.
    /// Nodes of the context that are held and sort after `id` are unlocked
    /// first and locked again afterwards.
    pub(crate) fn lock(&mut self, ctx: &mut Context, id: CtxId) -> Result<()> {
        let (lock, order) = {
            let n = ctx.node(id)?;
            (n.lock, n.lock_order())
        };
        if lock != LockState::Unlocked {
            return Ok(());
        }
        let mut later = Vec::new();
        for h in ctx.live() {
            let n = ctx.node(h)?;
            if n.lock != LockState::Unlocked && n.lock_order() > order {
                later.push((n.lock_order(), h));
            }
        }
        later.sort_unstable();
        for (_, h) in &later {
            self.unlock(ctx, *h)?;
        }
        self.map_node(ctx, id)?;
        for (_, h) in later {
            self.map_node(ctx, h)?;
        }
        Ok(())
    }

    /// Map the storage of an unlocked node and scan its entries.
    fn map_node(&mut self, ctx: &mut Context, id: CtxId) -> Result<()> {
        let loc = ctx.node(id)?.loc;
        debug_assert!(
            ctx.live().iter().all(|h| ctx.node(*h).map_or(true, |n| {
                n.lock == LockState::Unlocked || n.lock_order() <= NodeCtx::order_of(loc)
            })),
            "{:?} locked out of order",
            loc
        );
        match loc {
            NodeLoc::Root => {
                let loc = self.root_loc()?;
                self.vol.map_record(loc.record)?;
                let n = ctx.node_mut(id)?;
                n.record = loc.record;
                n.lock = LockState::Owned;
            }
            NodeLoc::Block(vcn) => {
                self.check_vcn(vcn)?;
                let (key, ofs) = self.block_page(vcn)?;
                let lock = match ctx.owner_of(&key, id) {
                    Some(owner) => LockState::Shared(owner),
                    None => {
                        self.vol.map_page(&key)?;
                        LockState::Owned
                    }
                };
                let n = ctx.node_mut(id)?;
                n.lock = lock;
                n.page = Some(key);
                n.page_ofs = ofs;
                self.check_block_header(ctx, id, vcn)?;
            }
        }
        #[cfg(test)]
        ctx.pins.push(loc);
        self.rescan(ctx, id)
    }

    /// Lock two nodes, the one that sorts first first.
    pub(crate) fn lock_two(&mut self, ctx: &mut Context, a: CtxId, b: CtxId) -> Result<()> {
        if ctx.node(a)?.lock_order() <= ctx.node(b)?.lock_order() {
            self.lock(ctx, a)?;
            self.lock(ctx, b)
        } else {
            self.lock(ctx, b)?;
            self.lock(ctx, a)
        }
    }

    /// Lock every node on the path in storage order, the root last.
    pub(crate) fn lock_path(&mut self, ctx: &mut Context) -> Result<()> {
        let mut path = Vec::new();
        for id in ctx.path() {
            path.push((ctx.node(id)?.lock_order(), id));
        }
        path.sort_unstable();
        for (_, id) in path {
            self.lock(ctx, id)?;
        }
        Ok(())
    }

    pub(crate) fn unlock(&mut self, ctx: &mut Context, id: CtxId) -> Result<()> {
        let (lock, dirty, loc, record, page) = {
            let n = ctx.node(id)?;
            (n.lock, n.dirty, n.loc, n.record, n.page.clone())
        };
        match lock {
            LockState::Unlocked => return Ok(()),
            LockState::Shared(owner) => {
                if dirty {
                    ctx.node_mut(owner)?.dirty = true;
                }
            }
            LockState::Owned => match (loc, page) {
                (NodeLoc::Root, _) => self.vol.unmap_record(record, dirty)?,
                (NodeLoc::Block(_), Some(key)) => {
                    let sharers: Vec<CtxId> = ctx
                        .live()
                        .into_iter()
                        .filter(|s| {
                            ctx.node(*s).map_or(false, |n| n.lock == LockState::Shared(id))
                        })
                        .collect();
                    match sharers.split_first() {
                        Some((heir, rest)) => {
                            // The pin moves on to the next node of the page
                            let h = ctx.node_mut(*heir)?;
                            h.lock = LockState::Owned;
                            h.dirty |= dirty;
                            for s in rest {
                                ctx.node_mut(*s)?.lock = LockState::Shared(*heir);
                            }
                        }
                        None => self.vol.unmap_page(&key, dirty)?,
                    }
                }
                (NodeLoc::Block(vcn), None) => {
                    return Err(Error::IoError(format!("block {} locked without a page", vcn)))
                }
            },
        }
        let n = ctx.node_mut(id)?;
        n.lock = LockState::Unlocked;
        n.dirty = false;
        Ok(())
    }

    /// Unlock every node of the context, reporting the first failure.
    pub(crate) fn unlock_all(&mut self, ctx: &mut Context) -> Result<()> {
        let mut result = Ok(());
        for id in ctx.live() {
            let r = self.unlock(ctx, id);
            if result.is_ok() {
                result = r;
            }
        }
        result
    }

    /// Unlock and drop all nodes of the path below `id`.
    pub(crate) fn truncate_below(&mut self, ctx: &mut Context, id: CtxId) -> Result<()> {
        while let Some(child) = ctx.child(id)? {
            self.unlock(ctx, child)?;
            ctx.release(child)?;
        }
        Ok(())
    }

    /// Descend from `parent` into the child block `vcn`, making it the new bottom.
    pub(crate) fn descend(&mut self, ctx: &mut Context, parent: CtxId, vcn: u64) -> Result<CtxId> {
        if !ctx.node(parent)?.internal {
            return Err(Error::corrupt("descending from a leaf node"));
        }
        let id = ctx.alloc(NodeLoc::Block(vcn));
        ctx.link_below(parent, id)?;
        self.lock(ctx, id)?;
        Ok(id)
    }

    fn check_block_header(&self, ctx: &Context, id: CtxId, vcn: u64) -> Result<()> {
        let n = ctx.node(id)?;
        let key = n
            .page
            .as_ref()
            .ok_or_else(|| Error::IoError(format!("block {} is not mapped", vcn)))?;
        let block = self
            .vol
            .page(key)?
            .get(n.page_ofs..n.page_ofs + self.block_size as usize)
            .ok_or_else(|| Error::corrupt(format!("block {} crosses its page", vcn)))?;
        if index_block::magic::read(block) != INDEX_BLOCK_MAGIC {
            return Err(Error::corrupt(format!("block {} has no INDX signature", vcn)));
        }
        if index_block::vcn::read(block) != vcn {
            return Err(Error::corrupt(format!(
                "block {} claims to be at VCN {}",
                vcn,
                index_block::vcn::read(block)
            )));
        }
        if index_block::usa_ofs::read(block) as usize != INDEX_BLOCK_HEADER_LEN {
            return Err(Error::corrupt(format!("block {} has a bad header", vcn)));
        }
        Ok(())
    }

    /// Refresh the entry offsets of a locked node.
    pub(crate) fn rescan(&mut self, ctx: &mut Context, id: CtxId) -> Result<()> {
        let allow_empty = {
            let n = ctx.node(id)?;
            n.is_root() || n.fresh
        };
        let scan = node::scan(self.node_buf(ctx, id)?, self.kind, allow_empty)?;
        let n = ctx.node_mut(id)?;
        n.entries = scan.entries;
        n.internal = scan.internal;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_links() {
        let mut ctx = Context::new(0);
        let root = ctx.push_root();
        assert_eq!(root, ctx.bottom().unwrap());
        assert_eq!(None, ctx.parent(root).unwrap());
        assert_eq!(None, ctx.child(root).unwrap());

        let a = ctx.alloc(NodeLoc::Block(0));
        ctx.link_below(root, a).unwrap();
        let b = ctx.alloc(NodeLoc::Block(8));
        ctx.link_below(a, b).unwrap();
        assert_eq!(vec![root, a, b], ctx.path());
        assert_eq!(b, ctx.bottom().unwrap());
        assert_eq!(Some(a), ctx.parent(b).unwrap());
        assert_eq!(None, ctx.child(b).unwrap());

        // Inserting in the middle keeps the chain intact
        let c = ctx.alloc(NodeLoc::Block(16));
        ctx.link_below(root, c).unwrap();
        assert_eq!(vec![root, c, a, b], ctx.path());

        ctx.disconnect(a).unwrap();
        assert_eq!(vec![root, c, b], ctx.path());
        ctx.splice(a, b).unwrap();
        assert_eq!(vec![root, c, b, a], ctx.path());
        assert_eq!(a, ctx.bottom().unwrap());

        ctx.release(c).unwrap();
        assert_eq!(vec![root, b, a], ctx.path());
        // Freed slots are reused
        assert_eq!(c, ctx.alloc(NodeLoc::Block(24)));
    }
}
