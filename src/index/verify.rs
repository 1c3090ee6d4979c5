//! Structural check of a whole index.

use std::cmp::Ordering;

use super::context::{Context, NodeLoc};
use super::Index;
use crate::bitmap;
use crate::entry;
use crate::error::{Error, Result};

/// Shape of an index, as found by [`Index::verify`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub entries: u64,
    /// Allocation blocks in the tree.
    pub blocks: u64,
    /// Number of levels, the root included.
    pub depth: usize,
    /// Whether the root points to allocation blocks.
    pub large: bool,
    pub root_entries: usize,
}

/// A node still to visit with the key range its entries have to lie in.
struct Visit {
    loc: NodeLoc,
    low: Option<Vec<u8>>,
    high: Option<Vec<u8>>,
    depth: usize,
}

impl<'v> Index<'v> {
    /// Walk the complete tree and check that keys are ordered, all leaves
    /// are on the same level and non-empty, and that the bitmap marks exactly
    /// the blocks of the tree.
    pub fn verify(&mut self) -> Result<IndexStats> {
        let mut ctx = self.new_context();
        let r = self.verify_in(&mut ctx);
        self.finish(&mut ctx, r)
    }

    /// Number of entries in the index.
    pub fn len(&mut self) -> Result<u64> {
        Ok(self.verify()?.entries)
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        let mut ctx = self.new_context();
        let root = ctx.push_root();
        let r = self.lock(&mut ctx, root).and_then(|_| {
            let n = ctx.node(root)?;
            Ok(!n.internal && n.real_entries() == 0)
        });
        self.finish(&mut ctx, r)
    }

    fn verify_in(&mut self, ctx: &mut Context) -> Result<IndexStats> {
        let bits = self.read_bitmap()?;
        let mut seen = vec![0u8; bits.len()];

        let root = ctx.push_root();
        self.lock(ctx, root)?;
        let mut stats = IndexStats {
            large: ctx.node(root)?.internal,
            root_entries: ctx.node(root)?.real_entries(),
            ..IndexStats::default()
        };
        let mut leaf_depth = None;
        let mut stack = vec![Visit {
            loc: NodeLoc::Root,
            low: None,
            high: None,
            depth: 1,
        }];

        while let Some(visit) = stack.pop() {
            let id = match visit.loc {
                NodeLoc::Root => root,
                NodeLoc::Block(vcn) => {
                    self.check_vcn(vcn)?;
                    let n = self.block_of_vcn(vcn);
                    if !bitmap::test_bit(&bits, n) {
                        return Err(Error::corrupt(format!("block {} is used but free in the bitmap", vcn)));
                    }
                    if bitmap::test_bit(&seen, n) {
                        return Err(Error::corrupt(format!("block {} is referenced twice", vcn)));
                    }
                    bitmap::set_bit(&mut seen, n);
                    stats.blocks += 1;
                    let id = ctx.alloc(visit.loc);
                    self.lock(ctx, id)?;
                    id
                }
            };

            let internal = ctx.node(id)?.internal;
            let mut prev = visit.low.clone();
            for raw in self.node_entries(ctx, id)? {
                let child_low = prev.clone();
                let child_high = if entry::is_end(&raw) {
                    visit.high.clone()
                } else {
                    let key = entry::key(&raw)?.to_vec();
                    if let Some(p) = &prev {
                        if self.collation.collate(p, &key)? != Ordering::Less {
                            return Err(Error::corrupt("index keys out of order"));
                        }
                    }
                    if let Some(h) = &visit.high {
                        if self.collation.collate(&key, h)? != Ordering::Less {
                            return Err(Error::corrupt("index key outside of its subtree range"));
                        }
                    }
                    stats.entries += 1;
                    prev = Some(key.clone());
                    Some(key)
                };
                if internal {
                    stack.push(Visit {
                        loc: NodeLoc::Block(entry::child_vcn(&raw)?),
                        low: child_low,
                        high: child_high,
                        depth: visit.depth + 1,
                    });
                }
            }

            if !internal {
                match leaf_depth {
                    None => leaf_depth = Some(visit.depth),
                    Some(d) if d != visit.depth => {
                        return Err(Error::corrupt("leaves on different levels"));
                    }
                    Some(_) => {}
                }
            }
            if id != root {
                self.unlock(ctx, id)?;
                ctx.release(id)?;
            }
        }

        stats.depth = leaf_depth.unwrap_or(1);
        if bitmap::count_set(&bits) != stats.blocks {
            return Err(Error::corrupt("bitmap marks blocks outside of the tree"));
        }
        Ok(stats)
    }
}
