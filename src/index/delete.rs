//! Deletion and merging.
//!
//! Leaves other than the root are never empty. When the only entry of a leaf
//! goes away, the separating entry of its parent is pulled down into a
//! neighbouring sibling and the leaf is dropped. If that leaves the parent
//! without real entries the same happens one level up, until a node keeps an
//! entry or the root is reached.

use tracing::trace;

use super::context::{Context, CtxId, NodeLoc};
use super::lookup::MAX_DEPTH;
use super::node;
use super::Index;
use crate::entry::{self, IndexEntry};
use crate::error::{Error, Result};

const MAX_RESTARTS: usize = 16;

/// Outcome of [`Index::delete`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteStatus {
    Done,
    /// The tree was reshaped to make room and nothing was deleted. Look up
    /// `key` again and repeat the delete.
    Restart { key: Vec<u8> },
}

/// Pulling one separator down into a sibling.
struct MergeStep {
    sibling: CtxId,
    /// The separator goes in front of the sibling's entries, else behind them.
    right: bool,
    separator: Vec<u8>,
    /// New child of the sibling's end entry when merging left on an internal level.
    end_child: Option<u64>,
}

enum MergeTop {
    /// The separator is removed from a node that keeps enough entries.
    Absorb {
        parent: CtxId,
        sep_idx: usize,
        right: bool,
        sibling_vcn: u64,
    },
    /// The root has no real entry left: it points at `child` from now on, or
    /// becomes an empty leaf.
    Collapse { root: CtxId, child: Option<u64> },
}

enum MergePlan {
    Merge {
        steps: Vec<MergeStep>,
        top: MergeTop,
        emptied: Vec<CtxId>,
    },
    /// A sibling has no room for its separator and has to be split first.
    SplitFirst {
        sibling: CtxId,
        parent: CtxId,
        sib_idx: usize,
        others: Vec<CtxId>,
    },
}

impl<'v> Index<'v> {
    /// Delete the entry a context is positioned at.
    pub fn delete(&mut self, ctx: &mut Context) -> Result<DeleteStatus> {
        self.check_usable()?;
        self.check_context(ctx)?;
        let r = self.lock_path(ctx).and_then(|_| self.delete_in(ctx));
        self.generation += 1;
        self.finish(ctx, r)
    }

    /// Delete the entry stored for `key`, restarting as often as needed.
    pub fn remove(&mut self, key: &[u8]) -> Result<IndexEntry> {
        self.collation.validate_key(key)?;
        for _ in 0..MAX_RESTARTS {
            let mut found = self.lookup(key)?;
            if !found.found {
                return Err(Error::NotFound);
            }
            let entry = self.entry(&mut found.ctx)?;
            match self.delete(&mut found.ctx)? {
                DeleteStatus::Done => return Ok(entry),
                DeleteStatus::Restart { .. } => trace!("delete restarted"),
            }
        }
        self.escalate(Err(Error::corrupt("delete keeps restarting")))
    }

    fn delete_in(&mut self, ctx: &mut Context) -> Result<DeleteStatus> {
        let bottom = ctx.bottom()?;
        let (idx, real, internal) = {
            let n = ctx.node(bottom)?;
            (n.entry_idx, n.real_entries(), n.internal)
        };
        if idx >= real {
            return Err(Error::NotFound);
        }
        let raw = self.entry_bytes(ctx, bottom, idx)?;
        let key = entry::key(&raw)?.to_vec();
        if internal {
            self.delete_internal(ctx, bottom, raw, key)
        } else {
            self.delete_leaf(ctx, bottom, key)
        }
    }

    fn delete_leaf(&mut self, ctx: &mut Context, leaf: CtxId, key: Vec<u8>) -> Result<DeleteStatus> {
        let (idx, real, is_root) = {
            let n = ctx.node(leaf)?;
            (n.entry_idx, n.real_entries(), n.is_root())
        };
        if is_root || real > 1 {
            self.replace_entries(ctx, leaf, idx, idx + 1, &[], None)?;
            return Ok(DeleteStatus::Done);
        }
        match self.plan_merge(ctx, leaf)? {
            MergePlan::SplitFirst {
                sibling,
                parent,
                sib_idx,
                others,
            } => {
                self.split_sibling(ctx, sibling, parent, sib_idx, others)?;
                Ok(DeleteStatus::Restart { key })
            }
            plan => {
                self.execute_merge(ctx, plan)?;
                Ok(DeleteStatus::Done)
            }
        }
    }

    /// Replace an internal entry by its in-order predecessor, which is the
    /// last entry of the rightmost leaf of its left subtree.
    fn delete_internal(
        &mut self,
        ctx: &mut Context,
        node_id: CtxId,
        target: Vec<u8>,
        key: Vec<u8>,
    ) -> Result<DeleteStatus> {
        let t_idx = ctx.node(node_id)?.entry_idx;
        let left = entry::child_vcn(&target)?;
        let mut id = self.descend(ctx, node_id, left)?;
        for _ in 0..MAX_DEPTH {
            let (internal, last) = {
                let n = ctx.node(id)?;
                (n.internal, n.real_entries())
            };
            if !internal {
                break;
            }
            ctx.node_mut(id)?.entry_idx = last;
            let vcn = self.child_of(ctx, id, last)?;
            id = self.descend(ctx, id, vcn)?;
        }
        let leaf = id;
        let real = ctx.node(leaf)?.real_entries();
        if ctx.node(leaf)?.internal || real == 0 {
            return Err(Error::corrupt("no predecessor below an internal entry"));
        }
        ctx.node_mut(leaf)?.entry_idx = real - 1;

        let pred = self.entry_bytes(ctx, leaf, real - 1)?;
        let lifted = entry::with_child(&pred, left)?;
        if lifted.len() > target.len() && !self.fits(ctx, node_id, lifted.len() - target.len())? {
            self.truncate_below(ctx, node_id)?;
            self.grow(ctx, node_id, true)?;
            return Ok(DeleteStatus::Restart { key });
        }
        self.replace_entries(ctx, node_id, t_idx, t_idx + 1, std::slice::from_ref(&lifted), None)?;

        if real > 1 {
            self.replace_entries(ctx, leaf, real - 1, real, &[], None)?;
            return Ok(DeleteStatus::Done);
        }
        match self.plan_merge(ctx, leaf)? {
            MergePlan::SplitFirst {
                sibling,
                parent,
                sib_idx,
                others,
            } => {
                self.replace_entries(ctx, node_id, t_idx, t_idx + 1, &[target], None)?;
                self.split_sibling(ctx, sibling, parent, sib_idx, others)?;
                Ok(DeleteStatus::Restart { key })
            }
            plan => {
                self.execute_merge(ctx, plan)?;
                Ok(DeleteStatus::Done)
            }
        }
    }

    /// Plan the removal of the non-root node `c`, whose last real entry is going away.
    fn plan_merge(&mut self, ctx: &mut Context, mut c: CtxId) -> Result<MergePlan> {
        let mut steps: Vec<MergeStep> = Vec::new();
        let mut emptied = Vec::new();
        // The child `c` is left with once its real entries are gone
        let mut g: Option<u64> = None;

        for _ in 0..MAX_DEPTH {
            emptied.push(c);
            let p = ctx
                .parent(c)?
                .ok_or_else(|| Error::corrupt("merging the root"))?;
            let (j, nreal, p_root) = {
                let n = ctx.node(p)?;
                (n.entry_idx, n.real_entries(), n.is_root())
            };
            if nreal == 0 {
                if p_root {
                    return Ok(MergePlan::Merge {
                        steps,
                        top: MergeTop::Collapse { root: p, child: g },
                        emptied,
                    });
                }
                return Err(Error::corrupt("internal node without entries"));
            }

            let right = j < nreal;
            let (sep_idx, sib_idx) = if right { (j, j + 1) } else { (j - 1, j - 1) };
            let sep_raw = self.entry_bytes(ctx, p, sep_idx)?;
            let sibling_vcn = self.child_of(ctx, p, sib_idx)?;
            let sibling = ctx.alloc(NodeLoc::Block(sibling_vcn));
            self.lock_two(ctx, sibling, c)?;
            if ctx.node(sibling)?.internal != g.is_some() {
                return Err(Error::corrupt(format!(
                    "block {} lies on another level than its sibling",
                    sibling_vcn
                )));
            }

            let (separator, end_child) = match g {
                None => (entry::without_child(&sep_raw)?, None),
                Some(g) if right => (entry::with_child(&sep_raw, g)?, None),
                Some(g) => {
                    let end = ctx.node(sibling)?.real_entries();
                    let old = self.child_of(ctx, sibling, end)?;
                    (entry::with_child(&sep_raw, old)?, Some(g))
                }
            };
            if !self.fits(ctx, sibling, separator.len())? {
                return Ok(MergePlan::SplitFirst {
                    sibling,
                    parent: p,
                    sib_idx,
                    others: steps.iter().map(|s| s.sibling).collect(),
                });
            }
            steps.push(MergeStep {
                sibling,
                right,
                separator,
                end_child,
            });
            if p_root || nreal > 1 {
                return Ok(MergePlan::Merge {
                    steps,
                    top: MergeTop::Absorb {
                        parent: p,
                        sep_idx,
                        right,
                        sibling_vcn,
                    },
                    emptied,
                });
            }
            g = Some(sibling_vcn);
            c = p;
        }
        Err(Error::corrupt("index tree exceeds the maximum depth"))
    }

    fn execute_merge(&mut self, ctx: &mut Context, plan: MergePlan) -> Result<()> {
        let (steps, top, emptied) = match plan {
            MergePlan::Merge {
                steps,
                top,
                emptied,
            } => (steps, top, emptied),
            MergePlan::SplitFirst { .. } => {
                return Err(Error::corrupt("merge plan needs a split first"))
            }
        };
        let mut committed = false;
        let r = self.write_merge(ctx, &steps, &top, &mut committed);
        if let Err(e) = r {
            return Err(if committed {
                Error::IoError(format!("merge failed after partial commit: {}", e))
            } else {
                e
            });
        }
        trace!(levels = steps.len(), "index nodes merged");

        // Blocks are given back only after everything referring to them is written
        let mut vcns = Vec::new();
        for id in &emptied {
            vcns.push(ctx.node(*id)?.vcn()?);
        }
        self.unlock_all(ctx)?;
        for id in emptied {
            ctx.release(id)?;
        }
        match top {
            MergeTop::Collapse { child: None, .. } => self.reset_allocation(),
            _ => {
                for vcn in vcns {
                    self.free_block(vcn)?;
                }
                Ok(())
            }
        }
    }

    fn write_merge(
        &mut self,
        ctx: &mut Context,
        steps: &[MergeStep],
        top: &MergeTop,
        committed: &mut bool,
    ) -> Result<()> {
        for step in steps {
            if step.right {
                self.replace_entries(ctx, step.sibling, 0, 0, std::slice::from_ref(&step.separator), None)?;
            } else {
                let end = ctx.node(step.sibling)?.real_entries();
                self.replace_entries(ctx, step.sibling, end, end, std::slice::from_ref(&step.separator), None)?;
                if let Some(child) = step.end_child {
                    self.set_child(ctx, step.sibling, end + 1, child)?;
                }
            }
            *committed = true;
        }
        match *top {
            MergeTop::Absorb {
                parent,
                sep_idx,
                right,
                sibling_vcn,
            } => {
                self.replace_entries(ctx, parent, sep_idx, sep_idx + 1, &[], None)?;
                if !right {
                    self.set_child(ctx, parent, sep_idx, sibling_vcn)?;
                }
            }
            MergeTop::Collapse { root, child: Some(child) } => {
                self.set_child(ctx, root, 0, child)?;
            }
            MergeTop::Collapse { root, child: None } => {
                let count = ctx.node(root)?.entries.len();
                self.replace_entries(ctx, root, 0, count, &[node::end_entry(None)], Some(false))?;
            }
        }
        Ok(())
    }

    /// Split a sibling that has no room for a separator, leaving the
    /// context useless for anything but a restart.
    fn split_sibling(
        &mut self,
        ctx: &mut Context,
        sibling: CtxId,
        parent: CtxId,
        sib_idx: usize,
        others: Vec<CtxId>,
    ) -> Result<()> {
        for id in others {
            self.unlock(ctx, id)?;
            ctx.release(id)?;
        }
        self.truncate_below(ctx, parent)?;
        ctx.node_mut(parent)?.entry_idx = sib_idx;
        ctx.splice(sibling, parent)?;
        self.grow(ctx, sibling, true)
    }
}
