use binary_layout::prelude::*;
use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::layout::{
    align8, index_entry, view_data, ENTRY_END, ENTRY_HEADER_LEN, ENTRY_NODE, VCN_LEN,
};

/// What an index maps its keys to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    /// Directory index: keys are FILE_NAME values, the payload is the file reference.
    Directory,
    /// View index ($SDH, $SII, $O, $Q, ...): keys and payload are opaque bytes.
    View,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryValue {
    FileRef(u64),
    Data(Vec<u8>),
}

/// A key with its payload, decoded from or ready to be encoded into a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Vec<u8>,
    pub value: EntryValue,
}

impl IndexEntry {
    pub fn file(key: Vec<u8>, file_ref: u64) -> IndexEntry {
        IndexEntry {
            key,
            value: EntryValue::FileRef(file_ref),
        }
    }

    pub fn view(key: Vec<u8>, data: Vec<u8>) -> IndexEntry {
        IndexEntry {
            key,
            value: EntryValue::Data(data),
        }
    }

    /// Size of the encoded leaf entry.
    pub fn encoded_len(&self) -> usize {
        match &self.value {
            EntryValue::FileRef(_) => align8(ENTRY_HEADER_LEN + self.key.len()),
            EntryValue::Data(data) => align8(ENTRY_HEADER_LEN + self.key.len() + data.len()),
        }
    }

    /// Encode as a leaf entry of an index of the given kind.
    pub fn encode(&self, kind: IndexKind) -> Result<Vec<u8>> {
        let key_len: u16 = self.key.len().try_into()?;
        let len = self.encoded_len();
        let length: u16 = len.try_into()?;
        let mut buf = Vec::new();
        buf.try_reserve_exact(len + VCN_LEN)?;
        buf.resize(len, 0);

        match (&self.value, kind) {
            (EntryValue::FileRef(file_ref), IndexKind::Directory) => {
                index_entry::file_ref::write(&mut buf, *file_ref);
            }
            (EntryValue::Data(data), IndexKind::View) => {
                let data_offset = ENTRY_HEADER_LEN + self.key.len();
                view_data::data_offset::write(&mut buf, data_offset.try_into()?);
                view_data::data_length::write(&mut buf, data.len().try_into()?);
                buf[data_offset..data_offset + data.len()].copy_from_slice(data);
            }
            _ => {
                return Err(Error::InvalidConfig(format!(
                    "entry payload does not match {:?} index",
                    kind
                )))
            }
        }
        index_entry::length::write(&mut buf, length);
        index_entry::key_length::write(&mut buf, key_len);
        index_entry::flags::write(&mut buf, 0);
        buf[ENTRY_HEADER_LEN..ENTRY_HEADER_LEN + self.key.len()].copy_from_slice(&self.key);
        Ok(buf)
    }

    /// Decode a real (non-end) entry previously validated by the node accessor.
    pub fn decode(raw: &[u8], kind: IndexKind) -> Result<IndexEntry> {
        let key = key(raw)?.to_vec();
        let value = match kind {
            IndexKind::Directory => EntryValue::FileRef(index_entry::file_ref::read(raw)),
            IndexKind::View => {
                let ofs = view_data::data_offset::read(raw) as usize;
                let len = view_data::data_length::read(raw) as usize;
                let data = raw
                    .get(ofs..ofs + len)
                    .ok_or_else(|| Error::corrupt("entry data outside of entry"))?;
                EntryValue::Data(data.to_vec())
            }
        };
        Ok(IndexEntry { key, value })
    }
}

// Accessors for raw entries. `raw` always starts at the entry header and is
// at least as long as the entry's declared length.

pub(crate) fn length(raw: &[u8]) -> usize {
    index_entry::length::read(raw) as usize
}

pub(crate) fn flags(raw: &[u8]) -> u16 {
    index_entry::flags::read(raw)
}

pub(crate) fn is_end(raw: &[u8]) -> bool {
    flags(raw) & ENTRY_END != 0
}

pub(crate) fn has_child(raw: &[u8]) -> bool {
    flags(raw) & ENTRY_NODE != 0
}

pub(crate) fn key(raw: &[u8]) -> Result<&[u8]> {
    let key_len = index_entry::key_length::read(raw) as usize;
    raw.get(ENTRY_HEADER_LEN..ENTRY_HEADER_LEN + key_len)
        .ok_or_else(|| Error::corrupt("entry key outside of entry"))
}

pub(crate) fn child_vcn(raw: &[u8]) -> Result<u64> {
    if !has_child(raw) {
        return Err(Error::corrupt("entry has no child node"));
    }
    let len = length(raw);
    Ok(u64::from_le_bytes(raw[len - VCN_LEN..len].try_into()?))
}

pub(crate) fn set_child_vcn(raw: &mut [u8], vcn: u64) -> Result<()> {
    if !has_child(raw) {
        return Err(Error::corrupt("cannot set child of a leaf entry"));
    }
    let len = length(raw);
    raw[len - VCN_LEN..len].copy_from_slice(&vcn.to_le_bytes());
    Ok(())
}

/// Copy of `raw` in internal form, pointing at `vcn`.
pub(crate) fn with_child(raw: &[u8], vcn: u64) -> Result<Vec<u8>> {
    let len = length(raw);
    let mut out = Vec::new();
    if has_child(raw) {
        out.try_reserve_exact(len)?;
        out.extend_from_slice(&raw[..len]);
    } else {
        out.try_reserve_exact(len + VCN_LEN)?;
        out.extend_from_slice(&raw[..len]);
        out.resize(len + VCN_LEN, 0);
        index_entry::length::write(&mut out, (len + VCN_LEN).try_into()?);
        index_entry::flags::write(&mut out, flags(raw) | ENTRY_NODE);
    }
    set_child_vcn(&mut out, vcn)?;
    Ok(out)
}

/// Copy of `raw` in leaf form.
pub(crate) fn without_child(raw: &[u8]) -> Result<Vec<u8>> {
    let len = length(raw);
    let mut out = Vec::new();
    if has_child(raw) {
        out.try_reserve_exact(len - VCN_LEN)?;
        out.extend_from_slice(&raw[..len - VCN_LEN]);
        index_entry::length::write(&mut out, (len - VCN_LEN).try_into()?);
        index_entry::flags::write(&mut out, flags(raw) & !ENTRY_NODE);
    } else {
        out.try_reserve_exact(len)?;
        out.extend_from_slice(&raw[..len]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collation::file_name_key;

    #[test]
    fn view_entry_layout() {
        let e = IndexEntry::view(7u32.to_le_bytes().to_vec(), vec![1; 20]);
        let raw = e.encode(IndexKind::View).unwrap();
        assert_eq!(40, raw.len());
        assert_eq!(40, length(&raw));
        assert_eq!(20, view_data::data_offset::read(&raw));
        assert_eq!(20, view_data::data_length::read(&raw));
        assert!(!has_child(&raw));
        assert!(!is_end(&raw));
        assert_eq!(e, IndexEntry::decode(&raw, IndexKind::View).unwrap());
    }

    #[test]
    fn directory_entry_layout() {
        let e = IndexEntry::file(file_name_key(5, "hello.txt"), 0x0001_0000_0000_0042);
        let raw = e.encode(IndexKind::Directory).unwrap();
        assert_eq!(align8(16 + 66 + 18), raw.len());
        assert_eq!(0x0001_0000_0000_0042, index_entry::file_ref::read(&raw));
        assert_eq!(e, IndexEntry::decode(&raw, IndexKind::Directory).unwrap());

        // Payload kind must match the index kind
        assert!(e.encode(IndexKind::View).is_err());
    }

    #[test]
    fn child_pointer_conversion() {
        let e = IndexEntry::view(vec![1, 2, 3, 4], vec![9; 4]);
        let leaf = e.encode(IndexKind::View).unwrap();
        assert!(child_vcn(&leaf).is_err());

        let internal = with_child(&leaf, 16).unwrap();
        assert_eq!(leaf.len() + 8, internal.len());
        assert!(has_child(&internal));
        assert_eq!(16, child_vcn(&internal).unwrap());

        // Re-pointing keeps the size
        let moved = with_child(&internal, 32).unwrap();
        assert_eq!(internal.len(), moved.len());
        assert_eq!(32, child_vcn(&moved).unwrap());

        let back = without_child(&moved).unwrap();
        assert_eq!(leaf, back);
        assert_eq!(e, IndexEntry::decode(&back, IndexKind::View).unwrap());
    }
}
