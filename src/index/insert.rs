//! Insertion, node splits and root promotion.
//!
//! Growing the tree happens in two phases. Planning walks up from the node
//! that received an entry, promotes the root or splits blocks until a node
//! with enough room is found, and allocates every new block on the way.
//! Nothing visible changes while planning, so a failure only has to free the
//! allocated blocks. Committing then writes the nodes from the top down.

use tracing::{debug, error, trace};

use super::context::{Context, CtxId, NodeLoc, PendingInsert, SplitPlan};
use super::node;
use super::Index;
use crate::entry::{self, IndexEntry};
use crate::error::{Error, Result};
use crate::layout::{END_ENTRY_LEN, END_ENTRY_NODE_LEN};
use crate::volume::mft::{AttrType, AttrValue, Attribute};
use crate::volume::{AttrListEntry, MoveLog};

/// What a root promotion changed, so it can be taken back.
#[derive(Default)]
struct PromotionUndo {
    created: Vec<AttrType>,
    moves: MoveLog,
    block: Option<u64>,
}

impl<'v> Index<'v> {
    /// Insert an entry. Keys are unique.
    pub fn insert(&mut self, entry: IndexEntry) -> Result<()> {
        self.check_usable()?;
        self.collation.validate_key(&entry.key)?;
        let raw = entry.encode(self.kind)?;
        let max = self.max_entry_len();
        if raw.len() > max {
            return Err(Error::EntryTooLarge {
                size: raw.len(),
                max,
            });
        }
        let mut ctx = self.new_context();
        let r = self.insert_in(&mut ctx, &entry.key, raw);
        self.generation += 1;
        self.finish(&mut ctx, r)
    }

    fn insert_in(&mut self, ctx: &mut Context, key: &[u8], raw: Vec<u8>) -> Result<()> {
        if self.lookup_in(ctx, key)? {
            return Err(Error::DuplicateKey);
        }
        let leaf = ctx.bottom()?;
        let pos = ctx.node(leaf)?.entry_idx;
        ctx.node_mut(leaf)?.insert = Some(PendingInsert {
            bytes: raw,
            pos,
            right_child: None,
        });
        self.grow(ctx, leaf, false)
    }

    /// Apply the pending insert of `start`, splitting and promoting as needed.
    ///
    /// With `force` the node `start` is split (or, for the root, promoted)
    /// even if it needs no room.
    pub(crate) fn grow(&mut self, ctx: &mut Context, start: CtxId, force: bool) -> Result<()> {
        let top = match self.plan_growth(ctx, start, force) {
            Ok(top) => top,
            Err(e) => {
                self.abandon_growth(ctx);
                return Err(e);
            }
        };
        self.commit_growth(ctx, top)
    }

    fn plan_growth(&mut self, ctx: &mut Context, start: CtxId, mut force: bool) -> Result<CtxId> {
        let mut id = start;
        loop {
            self.lock(ctx, id)?;
            let need = ctx.node(id)?.insert.as_ref().map(|p| p.bytes.len());
            if !force {
                match need {
                    None => return Ok(id),
                    Some(need) if self.fits(ctx, id, need)? => return Ok(id),
                    Some(_) => {}
                }
            }
            force = false;

            if ctx.node(id)?.is_root() {
                id = self.promote_root(ctx, id)?;
                continue;
            }

            let internal = ctx.node(id)?.internal;
            let v = self.virtual_entries(ctx, id)?;
            let median = node::choose_median(&v, internal, self.block_capacity())?;
            let new_vcn = self.allocate_block()?;
            let vcn = ctx.node(id)?.vcn()?;
            ctx.node_mut(id)?.split = Some(SplitPlan { median, new_vcn });
            trace!(vcn, new_vcn, median, "planned index block split");

            let parent = ctx
                .parent(id)?
                .ok_or_else(|| Error::corrupt(format!("block {} has no parent", vcn)))?;
            let pos = ctx.node(parent)?.entry_idx;
            ctx.node_mut(parent)?.insert = Some(PendingInsert {
                bytes: entry::with_child(&v[median], vcn)?,
                pos,
                right_child: Some(new_vcn),
            });
            id = parent;
        }
    }

    /// Drop all planned changes, freeing the blocks allocated for splits.
    fn abandon_growth(&mut self, ctx: &mut Context) {
        for id in ctx.path() {
            let split = match ctx.node_mut(id) {
                Ok(n) => {
                    n.insert = None;
                    n.split.take()
                }
                Err(_) => None,
            };
            if let Some(plan) = split {
                if let Err(e) = self.free_block(plan.new_vcn) {
                    debug!(vcn = plan.new_vcn, error = %e, "could not free a planned block");
                }
            }
        }
    }

    fn commit_growth(&mut self, ctx: &mut Context, top: CtxId) -> Result<()> {
        let mut next = Some(top);
        let mut committed = false;
        while let Some(id) = next {
            let (insert, split) = {
                let n = ctx.node(id)?;
                (n.insert.clone(), n.split)
            };
            let r = match split {
                Some(plan) => self.apply_split(ctx, id, insert.as_ref(), plan),
                None => match &insert {
                    Some(insert) => self.apply_insert(ctx, id, insert),
                    None => Ok(()),
                },
            };
            if let Err(e) = r {
                if !committed {
                    self.abandon_growth(ctx);
                    return Err(e);
                }
                error!(error = %e, "index update failed after nodes were written");
                return Err(Error::IoError(format!(
                    "index update failed after partial commit: {}",
                    e
                )));
            }
            committed = true;
            let n = ctx.node_mut(id)?;
            n.insert = None;
            n.split = None;
            next = ctx.child(id)?;
        }
        Ok(())
    }

    /// Entries of a node with its pending insert applied, end entry included.
    fn virtual_entries(&self, ctx: &Context, id: CtxId) -> Result<Vec<Vec<u8>>> {
        let insert = ctx.node(id)?.insert.clone();
        self.entries_with(ctx, id, insert.as_ref())
    }

    fn entries_with(&self, ctx: &Context, id: CtxId, insert: Option<&PendingInsert>) -> Result<Vec<Vec<u8>>> {
        let mut v = self.node_entries(ctx, id)?;
        if let Some(ins) = insert {
            if ins.pos >= v.len() {
                return Err(Error::corrupt(format!("insert position {} past the end entry", ins.pos)));
            }
            v.try_reserve(1)?;
            v.insert(ins.pos, ins.bytes.clone());
            if let Some(right) = ins.right_child {
                entry::set_child_vcn(&mut v[ins.pos + 1], right)?;
            }
        }
        Ok(v)
    }

    fn apply_insert(&mut self, ctx: &mut Context, id: CtxId, ins: &PendingInsert) -> Result<()> {
        self.replace_entries(ctx, id, ins.pos, ins.pos, std::slice::from_ref(&ins.bytes), None)?;
        if let Some(right) = ins.right_child {
            self.set_child(ctx, id, ins.pos + 1, right)?;
        }
        Ok(())
    }

    /// Split a node: entries before the median stay, the ones after it move
    /// to the new block. The median itself is already pending in the parent.
    fn apply_split(
        &mut self,
        ctx: &mut Context,
        id: CtxId,
        insert: Option<&PendingInsert>,
        plan: SplitPlan,
    ) -> Result<()> {
        let internal = ctx.node(id)?.internal;
        let v = self.entries_with(ctx, id, insert)?;
        let m = plan.median;
        if m == 0 || m + 1 >= v.len() {
            debug_assert!(false, "median {} of {} entries", m, v.len());
            return Err(Error::corrupt(format!("invalid split position {}", m)));
        }
        let left_end = if internal {
            node::end_entry(Some(entry::child_vcn(&v[m])?))
        } else {
            node::end_entry(None)
        };

        let sibling = ctx.alloc(NodeLoc::Block(plan.new_vcn));
        ctx.node_mut(sibling)?.fresh = true;
        let filled = self
            .lock_two(ctx, sibling, id)
            .and_then(|_| self.replace_entries(ctx, sibling, 0, 1, &v[m + 1..], Some(internal)));
        let unlocked = self.unlock(ctx, sibling);
        ctx.release(sibling)?;
        filled?;
        unlocked?;

        let mut left = Vec::new();
        left.try_reserve_exact(m + 1)?;
        left.extend_from_slice(&v[..m]);
        left.push(left_end);
        let count = ctx.node(id)?.entries.len();
        self.replace_entries(ctx, id, 0, count, &left, None)?;
        trace!(vcn = ctx.node(id)?.vcn()?, new_vcn = plan.new_vcn, "index block split");
        Ok(())
    }

    /// Move the entries of the root into a new block and let the root point at it.
    ///
    /// Returns the context of the new block, linked directly below the root
    /// and carrying over the root's pending changes. Every step is undone if
    /// the promotion fails.
    fn promote_root(&mut self, ctx: &mut Context, root: CtxId) -> Result<CtxId> {
        // Attributes may move between records, so the root is mapped again later
        self.unlock(ctx, root)?;
        let original = self.root_value()?.to_vec();
        let mut undo = PromotionUndo::default();
        let mut block = None;
        let r = self.promote_root_into(ctx, root, &mut undo, &mut block);
        match r {
            Ok(id) => {
                debug!(record = self.mft, index = %self.name, vcn = ?undo.block, "index root promoted");
                Ok(id)
            }
            Err(e) => {
                if let Some(id) = block {
                    let unlocked = self.unlock(ctx, id);
                    if let Err(e2) = unlocked.and(ctx.release(id)) {
                        debug!(error = %e2, "could not drop the block of a failed promotion");
                    }
                }
                if let Err(e2) = self.unlock(ctx, root) {
                    debug!(error = %e2, "could not unlock the root of a failed promotion");
                }
                match self.rollback_promotion(original, undo) {
                    Ok(()) => Err(e),
                    Err(undo_err) => Err(Error::IoError(format!(
                        "root promotion failed ({}) and could not be undone: {}",
                        e, undo_err
                    ))),
                }
            }
        }
    }

    fn promote_root_into(
        &mut self,
        ctx: &mut Context,
        root: CtxId,
        undo: &mut PromotionUndo,
        block: &mut Option<CtxId>,
    ) -> Result<CtxId> {
        self.ensure_allocation_attrs(undo)?;
        let vcn = self.allocate_block()?;
        undo.block = Some(vcn);

        let id = ctx.alloc(NodeLoc::Block(vcn));
        *block = Some(id);
        ctx.node_mut(id)?.fresh = true;
        self.lock_two(ctx, id, root)?;

        let entries = self.node_entries(ctx, root)?;
        let internal = ctx.node(root)?.internal;
        self.replace_entries(ctx, id, 0, 1, &entries, Some(internal))?;
        self.replace_entries(ctx, root, 0, entries.len(), &[node::end_entry(Some(vcn))], Some(true))?;

        let (insert, split, entry_idx) = {
            let r = ctx.node_mut(root)?;
            let moved = (r.insert.take(), r.split.take(), r.entry_idx);
            r.entry_idx = 0;
            moved
        };
        let b = ctx.node_mut(id)?;
        b.insert = insert;
        b.split = split;
        b.entry_idx = entry_idx;
        b.fresh = false;
        ctx.link_below(root, id)?;
        Ok(id)
    }

    /// Add `$INDEX_ALLOCATION` and `$BITMAP` if the index has none yet,
    /// moving other attributes out of the base record if it is full.
    fn ensure_allocation_attrs(&mut self, undo: &mut PromotionUndo) -> Result<()> {
        let mut missing = Vec::new();
        if self.allocation_loc()?.is_none() {
            missing.push(Attribute::non_resident(AttrType::IndexAllocation, &self.name));
        }
        if self.bitmap_loc()?.is_none() {
            let growth = self.vol.config().bitmap_growth as usize;
            missing.push(Attribute::resident(AttrType::Bitmap, &self.name, vec![0; growth]));
        }
        if missing.is_empty() {
            return Ok(());
        }

        let base = self.mft;
        let needed = missing
            .iter()
            .map(|a| a.record_len() + AttrListEntry::len_for(&a.name))
            .sum::<usize>()
            + (END_ENTRY_NODE_LEN - END_ENTRY_LEN);
        if self.vol.record_free(base)? < needed {
            let name = self.name.clone();
            let keep = [
                (AttrType::IndexRoot, name.as_str()),
                (AttrType::IndexAllocation, name.as_str()),
                (AttrType::Bitmap, name.as_str()),
            ];
            match self.vol.make_space(base, base, needed, &keep) {
                Ok(log) => undo.moves.append(log),
                Err(Error::OutOfSpace) => {
                    if self.root_loc()?.record == base {
                        let log = self
                            .vol
                            .move_to_extension(base, AttrType::IndexRoot, &name)?;
                        undo.moves.append(log);
                        debug!(record = base, index = %name, "index root moved to an extension record");
                    }
                    if self.vol.record_free(base)? < needed {
                        undo.moves.append(self.vol.make_space(base, base, needed, &keep)?);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        for attr in missing {
            let ty = attr.ty;
            self.vol.add_attribute(base, attr)?;
            undo.created.push(ty);
        }
        Ok(())
    }

    fn rollback_promotion(&mut self, original: Vec<u8>, undo: PromotionUndo) -> Result<()> {
        if let Some(vcn) = undo.block {
            self.free_block(vcn)?;
        }
        for ty in undo.created.iter().rev() {
            self.vol.remove_attribute(self.mft, *ty, &self.name)?;
        }
        if undo.created.contains(&AttrType::Bitmap) {
            self.bmp_highest = None;
        }
        let loc = self.root_loc()?;
        self.vol.resize_attribute_value(loc, original.len())?;
        match &mut self.vol.attribute_mut(loc)?.value {
            AttrValue::Resident(v) => v.copy_from_slice(&original),
            AttrValue::NonResident(_) => return Err(Error::corrupt("index root is not resident")),
        }
        self.vol.mark_record_dirty(loc.record)?;
        self.vol.undo_moves(self.mft, undo.moves)
    }
}
