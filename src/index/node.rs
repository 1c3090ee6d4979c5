//! Node accessor: validates the entries of a node and locates them.
//!
//! A node is addressed from the start of its index header, both for the root
//! (inside the `$INDEX_ROOT` value) and for allocation blocks (after the
//! block header). All entry offsets are relative to that position.

use binary_layout::prelude::*;

use crate::entry::{self, IndexKind};
use crate::error::{Error, Result};
use crate::layout::{
    index_entry, index_header, view_data, END_ENTRY_LEN, END_ENTRY_NODE_LEN, ENTRY_END,
    ENTRY_HEADER_LEN, ENTRY_NODE, INDEX_HEADER_LEN, NODE_INTERNAL, VCN_LEN,
};

/// Result of scanning a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NodeScan {
    /// Offsets of all entries, the last one is the end entry.
    pub entries: Vec<usize>,
    pub internal: bool,
    pub index_length: usize,
    pub allocated: usize,
}

impl NodeScan {
    pub fn real_entries(&self) -> usize {
        self.entries.len() - 1
    }
}

/// Scan and validate a node.
///
/// Empty leaves are only accepted when `allow_empty_leaf` is set, which is
/// the case for the root and for blocks that are being filled.
pub(crate) fn scan(node: &[u8], kind: IndexKind, allow_empty_leaf: bool) -> Result<NodeScan> {
    if node.len() < INDEX_HEADER_LEN {
        return Err(Error::corrupt("node is smaller than its header"));
    }
    let entries_offset = index_header::entries_offset::read(node) as usize;
    let index_length = index_header::index_length::read(node) as usize;
    let allocated = index_header::allocated_size::read(node) as usize;
    let internal = index_header::flags::read(node) & NODE_INTERNAL != 0;

    if entries_offset < INDEX_HEADER_LEN || entries_offset % 8 != 0 {
        return Err(Error::corrupt(format!(
            "invalid entries offset {}",
            entries_offset
        )));
    }
    if index_length > allocated || allocated > node.len() {
        return Err(Error::corrupt(format!(
            "used length {} and allocated size {} exceed the node size {}",
            index_length,
            allocated,
            node.len()
        )));
    }

    let mut entries = Vec::new();
    let mut ofs = entries_offset;
    loop {
        if ofs + ENTRY_HEADER_LEN > index_length {
            return Err(Error::corrupt(format!(
                "entry at {} lies outside of the used length {}",
                ofs, index_length
            )));
        }
        let len = entry::length(&node[ofs..]);
        if len < ENTRY_HEADER_LEN || len % 8 != 0 || ofs + len > index_length {
            return Err(Error::corrupt(format!(
                "entry at {} has an invalid length of {}",
                ofs, len
            )));
        }
        let raw = &node[ofs..ofs + len];
        let is_end = entry::is_end(raw);
        let has_child = entry::has_child(raw);
        if has_child != internal {
            return Err(Error::corrupt(if internal {
                format!("leaf entry at {} in an internal node", ofs)
            } else {
                format!("internal entry at {} in a leaf node", ofs)
            }));
        }
        check_entry(raw, kind, is_end, has_child)
            .map_err(|e| Error::corrupt(format!("entry at {}: {}", ofs, e)))?;
        entries.try_reserve(1)?;
        entries.push(ofs);
        if is_end {
            if ofs + len != index_length {
                return Err(Error::corrupt("data after the end entry"));
            }
            break;
        }
        ofs += len;
    }

    if !internal && !allow_empty_leaf && entries.len() == 1 {
        return Err(Error::corrupt("empty leaf node"));
    }
    Ok(NodeScan {
        entries,
        internal,
        index_length,
        allocated,
    })
}

fn check_entry(raw: &[u8], kind: IndexKind, is_end: bool, has_child: bool) -> std::result::Result<(), String> {
    let len = raw.len();
    let tail = if has_child { VCN_LEN } else { 0 };
    let key_end = ENTRY_HEADER_LEN + index_entry::key_length::read(raw) as usize;
    if is_end {
        if ENTRY_HEADER_LEN + tail > len {
            return Err("end entry too short for its child pointer".to_string());
        }
        return Ok(());
    }
    if key_end + tail > len {
        return Err(format!("key ends at {} beyond the entry length {}", key_end, len));
    }
    if kind == IndexKind::View {
        let data_offset = view_data::data_offset::read(raw) as usize;
        let data_end = data_offset + view_data::data_length::read(raw) as usize;
        if data_offset < key_end || data_end + tail > len {
            return Err(format!(
                "data at {}..{} outside of the entry length {}",
                data_offset, data_end, len
            ));
        }
    }
    Ok(())
}

/// An end entry, internal if it has a child.
pub(crate) fn end_entry(child: Option<u64>) -> Vec<u8> {
    let len = match child {
        Some(_) => END_ENTRY_NODE_LEN,
        None => END_ENTRY_LEN,
    };
    let mut buf = vec![0u8; len];
    index_entry::length::write(&mut buf, len as u16);
    index_entry::key_length::write(&mut buf, 0);
    match child {
        Some(vcn) => {
            index_entry::flags::write(&mut buf, ENTRY_END | ENTRY_NODE);
            buf[len - VCN_LEN..].copy_from_slice(&vcn.to_le_bytes());
        }
        None => index_entry::flags::write(&mut buf, ENTRY_END),
    }
    buf
}

pub(crate) fn entries_len(entries: &[Vec<u8>]) -> usize {
    entries.iter().map(|e| e.len()).sum()
}

/// Choose the median of an overflowing node.
///
/// `entries` holds all entries of the node as they would be after the pending
/// insertion, end entry included. The median stays in the middle by position
/// unless one of the halves would not fit into `capacity` bytes, in which case
/// the closest byte balanced position that fits is taken.
pub(crate) fn choose_median(entries: &[Vec<u8>], internal: bool, capacity: usize) -> Result<usize> {
    let real = entries.len().saturating_sub(1);
    if real < 3 {
        debug_assert!(real >= 3, "splitting a node with {} entries", real);
        return Err(Error::corrupt(format!(
            "cannot split a node with {} entries",
            real
        )));
    }
    let end_len = if internal {
        END_ENTRY_NODE_LEN
    } else {
        END_ENTRY_LEN
    };
    let halves = |median: usize| {
        let left = INDEX_HEADER_LEN + entries_len(&entries[..median]) + end_len;
        let right = INDEX_HEADER_LEN + entries_len(&entries[median + 1..]);
        (left, right)
    };
    let fits = |median: usize| {
        let (left, right) = halves(median);
        left <= capacity && right <= capacity
    };

    let median = real / 2;
    if fits(median) {
        return Ok(median);
    }
    (1..real - 1)
        .filter(|m| fits(*m))
        .min_by_key(|m| {
            let (left, right) = halves(*m);
            (left as isize - right as isize).abs()
        })
        .ok_or_else(|| Error::corrupt("no split position leaves both halves within a block"))
}
