//! On-disk structures of index attributes.
//!
//! All multi-byte fields are little endian. Offsets inside a node (entry
//! offsets, `index_length`, `allocated_size`) are relative to the start of
//! the node's `index_header`, both for the root and for index blocks.

use binary_layout::prelude::*;

/// Unit in which the page cache maps attribute data.
pub const PAGE_SIZE: usize = 4096;

pub const INDEX_ROOT_HEADER_LEN: usize = 16;
pub const INDEX_HEADER_LEN: usize = 16;
pub const INDEX_BLOCK_HEADER_LEN: usize = 24;
pub const ENTRY_HEADER_LEN: usize = 16;
pub const VCN_LEN: usize = 8;

/// Length of an end entry without and with a trailing child pointer.
pub const END_ENTRY_LEN: usize = ENTRY_HEADER_LEN;
pub const END_ENTRY_NODE_LEN: usize = ENTRY_HEADER_LEN + VCN_LEN;

/// `"INDX"` read as a little endian `u32`.
pub const INDEX_BLOCK_MAGIC: u32 = u32::from_le_bytes(*b"INDX");

/// Entry flag: a child pointer trails the entry.
pub const ENTRY_NODE: u16 = 0x01;
/// Entry flag: this is the terminal entry of a node.
pub const ENTRY_END: u16 = 0x02;

/// Node flag: entries of this node carry child pointers.
pub const NODE_INTERNAL: u8 = 0x01;

/// Value of `indexed_type` for directory indexes (FILE_NAME keys).
pub const INDEXED_FILE_NAME: u32 = 0x30;

// Value of an $INDEX_ROOT attribute, followed by an index_header.
define_layout!(index_root, LittleEndian, {
    indexed_type: u32,
    collation_rule: u32,
    block_size: u32,
    clusters_per_block: u8,
    reserved: [u8; 3],
});

define_layout!(index_header, LittleEndian, {
    entries_offset: u32,
    index_length: u32,
    allocated_size: u32,
    flags: u8,
    reserved: [u8; 3],
});

// Start of every block of an $INDEX_ALLOCATION attribute, followed by an index_header.
define_layout!(index_block, LittleEndian, {
    magic: u32,
    usa_ofs: u16,
    usa_count: u16,
    lsn: u64,
    vcn: u64,
});

// Common header of every index entry. The first eight bytes are a union:
// directory entries store the file reference of the indexed file there,
// view entries store the location of their data (see `view_data`).
define_layout!(index_entry, LittleEndian, {
    file_ref: u64,
    length: u16,
    key_length: u16,
    flags: u16,
    reserved: u16,
});

define_layout!(view_data, LittleEndian, {
    data_offset: u16,
    data_length: u16,
    reserved: u32,
});

// One entry of an $ATTRIBUTE_LIST value, followed by the UTF-16 name.
define_layout!(attr_list_entry, LittleEndian, {
    attr_type: u32,
    length: u16,
    name_length: u8,
    name_offset: u8,
    lowest_vcn: u64,
    mft_reference: u64,
    instance: u16,
});

pub const ATTR_LIST_ENTRY_HEADER_LEN: usize = 26;

pub const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Write an empty node header followed by a single end entry into `node`.
pub fn init_node(node: &mut [u8], allocated_size: u32, internal: bool, child: u64) {
    let end_len = if internal {
        END_ENTRY_NODE_LEN
    } else {
        END_ENTRY_LEN
    };
    node[..INDEX_HEADER_LEN + end_len].fill(0);
    index_header::entries_offset::write(node, INDEX_HEADER_LEN as u32);
    index_header::index_length::write(node, (INDEX_HEADER_LEN + end_len) as u32);
    index_header::allocated_size::write(node, allocated_size);
    index_header::flags::write(node, if internal { NODE_INTERNAL } else { 0 });

    let end = &mut node[INDEX_HEADER_LEN..INDEX_HEADER_LEN + end_len];
    index_entry::length::write(end, end_len as u16);
    index_entry::key_length::write(end, 0);
    if internal {
        index_entry::flags::write(end, ENTRY_END | ENTRY_NODE);
        end[end_len - VCN_LEN..].copy_from_slice(&child.to_le_bytes());
    } else {
        index_entry::flags::write(end, ENTRY_END);
    }
}

/// Write the `INDX` header of the block at `vcn` and an empty leaf node after it.
pub fn init_index_block(block: &mut [u8], vcn: u64) {
    block[..INDEX_BLOCK_HEADER_LEN].fill(0);
    index_block::magic::write(block, INDEX_BLOCK_MAGIC);
    index_block::usa_ofs::write(block, INDEX_BLOCK_HEADER_LEN as u16);
    index_block::usa_count::write(block, 0);
    index_block::lsn::write(block, 0);
    index_block::vcn::write(block, vcn);
    let allocated = (block.len() - INDEX_BLOCK_HEADER_LEN) as u32;
    init_node(&mut block[INDEX_BLOCK_HEADER_LEN..], allocated, false, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_block_layout() {
        let mut block = vec![0xffu8; 4096];
        init_index_block(&mut block, 8);

        assert_eq!(b"INDX", &block[0..4]);
        assert_eq!(8, index_block::vcn::read(&block));

        let node = &block[INDEX_BLOCK_HEADER_LEN..];
        assert_eq!(16, index_header::entries_offset::read(node));
        assert_eq!(32, index_header::index_length::read(node));
        assert_eq!(4096 - 24, index_header::allocated_size::read(node));
        assert_eq!(0, index_header::flags::read(node));

        let end = &node[16..];
        assert_eq!(16, index_entry::length::read(end));
        assert_eq!(ENTRY_END, index_entry::flags::read(end));
    }

    #[test]
    fn internal_end_entry_carries_child() {
        let mut node = vec![0u8; 64];
        init_node(&mut node, 40, true, 0x1234);
        assert_eq!(40, index_header::index_length::read(&node));
        assert_eq!(NODE_INTERNAL, index_header::flags::read(&node));
        let end = &node[16..40];
        assert_eq!(24, index_entry::length::read(end));
        assert_eq!(ENTRY_END | ENTRY_NODE, index_entry::flags::read(end));
        assert_eq!(0x1234u64.to_le_bytes(), end[16..24]);
    }

    #[test]
    fn alignment() {
        assert_eq!(0, align8(0));
        assert_eq!(8, align8(1));
        assert_eq!(40, align8(40));
        assert_eq!(48, align8(41));
    }
}
