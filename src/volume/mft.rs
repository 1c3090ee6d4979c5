use serde_derive::{Deserialize, Serialize};

use crate::layout::align8;

pub const RECORD_HEADER_LEN: usize = 56;
pub const RECORD_END_LEN: usize = 8;
const RESIDENT_HEADER_LEN: usize = 24;
const NON_RESIDENT_HEADER_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AttrType {
    StandardInformation,
    AttributeList,
    FileName,
    ObjectId,
    SecurityDescriptor,
    Data,
    IndexRoot,
    IndexAllocation,
    Bitmap,
    ReparsePoint,
}

impl AttrType {
    pub fn code(&self) -> u32 {
        match self {
            AttrType::StandardInformation => 0x10,
            AttrType::AttributeList => 0x20,
            AttrType::FileName => 0x30,
            AttrType::ObjectId => 0x40,
            AttrType::SecurityDescriptor => 0x50,
            AttrType::Data => 0x80,
            AttrType::IndexRoot => 0x90,
            AttrType::IndexAllocation => 0xa0,
            AttrType::Bitmap => 0xb0,
            AttrType::ReparsePoint => 0xc0,
        }
    }

    pub fn from_code(code: u32) -> Option<AttrType> {
        let t = match code {
            0x10 => AttrType::StandardInformation,
            0x20 => AttrType::AttributeList,
            0x30 => AttrType::FileName,
            0x40 => AttrType::ObjectId,
            0x50 => AttrType::SecurityDescriptor,
            0x80 => AttrType::Data,
            0x90 => AttrType::IndexRoot,
            0xa0 => AttrType::IndexAllocation,
            0xb0 => AttrType::Bitmap,
            0xc0 => AttrType::ReparsePoint,
            _ => return None,
        };
        Some(t)
    }
}

/// A contiguous range of clusters backing part of a non-resident attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub vcn: u64,
    pub lcn: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NonResident {
    pub runs: Vec<Run>,
    pub data_size: u64,
    pub initialized_size: u64,
}

impl NonResident {
    pub fn allocated_clusters(&self) -> u64 {
        self.runs.iter().map(|r| r.len).sum()
    }

    pub fn lcn_of(&self, vcn: u64) -> Option<u64> {
        self.runs
            .iter()
            .find(|r| vcn >= r.vcn && vcn < r.vcn + r.len)
            .map(|r| r.lcn + (vcn - r.vcn))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Resident(Vec<u8>),
    NonResident(NonResident),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub ty: AttrType,
    pub name: String,
    pub value: AttrValue,
}

impl Attribute {
    pub fn resident(ty: AttrType, name: &str, value: Vec<u8>) -> Attribute {
        Attribute {
            ty,
            name: name.to_string(),
            value: AttrValue::Resident(value),
        }
    }

    pub fn non_resident(ty: AttrType, name: &str) -> Attribute {
        Attribute {
            ty,
            name: name.to_string(),
            value: AttrValue::NonResident(NonResident::default()),
        }
    }

    pub fn is(&self, ty: AttrType, name: &str) -> bool {
        self.ty == ty && self.name == name
    }

    pub fn name_len(&self) -> usize {
        self.name.encode_utf16().count()
    }

    /// Bytes this attribute occupies inside its record.
    pub fn record_len(&self) -> usize {
        let name = 2 * self.name_len();
        match &self.value {
            AttrValue::Resident(v) => align8(RESIDENT_HEADER_LEN + name) + align8(v.len()),
            AttrValue::NonResident(nr) => {
                align8(NON_RESIDENT_HEADER_LEN + name) + align8(mapping_pairs_len(&nr.runs))
            }
        }
    }

    /// Length of the attribute value (data size for non-resident attributes).
    pub fn value_len(&self) -> u64 {
        match &self.value {
            AttrValue::Resident(v) => v.len() as u64,
            AttrValue::NonResident(nr) => nr.data_size,
        }
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.value, AttrValue::Resident(_))
    }
}

fn signed_len(v: i64) -> usize {
    let mut n = 1;
    while n < 8 {
        let bound = 1i64 << (8 * n - 1);
        if v >= -bound && v < bound {
            break;
        }
        n += 1;
    }
    n
}

/// Size of the encoded run list of a non-resident attribute.
pub fn mapping_pairs_len(runs: &[Run]) -> usize {
    let mut prev_lcn = 0i64;
    let mut len = 1;
    for r in runs {
        let lcn = r.lcn as i64;
        len += 1 + signed_len(r.len as i64) + signed_len(lcn - prev_lcn);
        prev_lcn = lcn;
    }
    len
}

#[derive(Debug, Clone)]
pub struct MftRecord {
    pub number: u64,
    /// Base record for extension records.
    pub base: Option<u64>,
    pub in_use: bool,
    pub attrs: Vec<Attribute>,
    pub(crate) dirty: bool,
    pub(crate) map_count: u32,
}

impl MftRecord {
    pub(crate) fn new(number: u64, base: Option<u64>) -> MftRecord {
        MftRecord {
            number,
            base,
            in_use: true,
            attrs: Vec::new(),
            dirty: true,
            map_count: 0,
        }
    }

    pub fn bytes_in_use(&self) -> usize {
        RECORD_HEADER_LEN + self.attrs.iter().map(|a| a.record_len()).sum::<usize>() + RECORD_END_LEN
    }

    pub fn find(&self, ty: AttrType, name: &str) -> Option<usize> {
        self.attrs.iter().position(|a| a.is(ty, name))
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Insert keeping attributes sorted by type, like on disk.
    pub(crate) fn insert_sorted(&mut self, attr: Attribute) -> usize {
        let pos = self
            .attrs
            .iter()
            .position(|a| (a.ty, &a.name) > (attr.ty, &attr.name))
            .unwrap_or(self.attrs.len());
        self.attrs.insert(pos, attr);
        pos
    }
}
