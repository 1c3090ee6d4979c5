use binary_layout::prelude::*;
use tracing::debug;

use super::mft::{AttrType, AttrValue, Attribute};
use super::{AttrLoc, Volume};
use crate::error::{Error, Result};
use crate::layout::{align8, attr_list_entry, ATTR_LIST_ENTRY_HEADER_LEN};

/// One entry of an `$ATTRIBUTE_LIST`: which record holds an attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrListEntry {
    pub ty: AttrType,
    pub name: String,
    pub record: u64,
}

impl AttrListEntry {
    pub(crate) fn len_for(name: &str) -> usize {
        align8(ATTR_LIST_ENTRY_HEADER_LEN + 2 * name.encode_utf16().count())
    }

    pub fn encoded_len(&self) -> usize {
        Self::len_for(&self.name)
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        let start = out.len();
        let len = self.encoded_len();
        out.try_reserve(len)?;
        out.resize(start + len, 0);
        let buf = &mut out[start..];
        let units: Vec<u16> = self.name.encode_utf16().collect();
        attr_list_entry::attr_type::write(buf, self.ty.code());
        attr_list_entry::length::write(buf, len.try_into()?);
        attr_list_entry::name_length::write(buf, units.len().try_into()?);
        attr_list_entry::name_offset::write(buf, ATTR_LIST_ENTRY_HEADER_LEN as u8);
        attr_list_entry::lowest_vcn::write(buf, 0);
        attr_list_entry::mft_reference::write(buf, self.record);
        attr_list_entry::instance::write(buf, 0);
        for (i, u) in units.iter().enumerate() {
            let o = ATTR_LIST_ENTRY_HEADER_LEN + 2 * i;
            buf[o..o + 2].copy_from_slice(&u.to_le_bytes());
        }
        Ok(())
    }

    fn decode_all(mut buf: &[u8]) -> Result<Vec<AttrListEntry>> {
        let mut entries = Vec::new();
        while !buf.is_empty() {
            if buf.len() < ATTR_LIST_ENTRY_HEADER_LEN {
                return Err(Error::corrupt("truncated attribute list entry"));
            }
            let len = attr_list_entry::length::read(buf) as usize;
            let name_len = attr_list_entry::name_length::read(buf) as usize;
            let name_ofs = attr_list_entry::name_offset::read(buf) as usize;
            if len < ATTR_LIST_ENTRY_HEADER_LEN || len > buf.len() || name_ofs + 2 * name_len > len {
                return Err(Error::corrupt(format!(
                    "attribute list entry of length {} is malformed",
                    len
                )));
            }
            let code = attr_list_entry::attr_type::read(buf);
            let ty = AttrType::from_code(code)
                .ok_or_else(|| Error::corrupt(format!("unknown attribute type {:#x}", code)))?;
            let units: Vec<u16> = buf[name_ofs..name_ofs + 2 * name_len]
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            let name = String::from_utf16(&units)
                .map_err(|_| Error::corrupt("attribute list entry name is not UTF-16"))?;
            entries.push(AttrListEntry {
                ty,
                name,
                record: attr_list_entry::mft_reference::read(buf),
            });
            buf = &buf[len..];
        }
        Ok(entries)
    }
}

#[derive(Debug, Clone)]
struct Move {
    ty: AttrType,
    name: String,
    from: u64,
    to: u64,
}

/// Attribute relocations done to make room in a record, so they can be undone.
#[derive(Debug, Default)]
pub struct MoveLog {
    moves: Vec<Move>,
    list_created: bool,
}

impl MoveLog {
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty() && !self.list_created
    }

    pub fn moved(&self) -> usize {
        self.moves.len()
    }

    pub(crate) fn append(&mut self, other: MoveLog) {
        self.moves.extend(other.moves);
        self.list_created |= other.list_created;
    }
}

impl Volume {
    pub(crate) fn has_attribute_list(&self, base: u64) -> Result<bool> {
        Ok(self.record(base)?.find(AttrType::AttributeList, "").is_some())
    }

    /// Entries of the attribute list of a file, empty if it has none.
    pub fn attribute_list(&self, base: u64) -> Result<Vec<AttrListEntry>> {
        let rec = self.record(base)?;
        match rec.find(AttrType::AttributeList, "") {
            None => Ok(Vec::new()),
            Some(idx) => match &rec.attrs[idx].value {
                AttrValue::Resident(v) => AttrListEntry::decode_all(v),
                AttrValue::NonResident(_) => Err(Error::IoError(
                    "non-resident attribute lists are not supported".to_string(),
                )),
            },
        }
    }

    fn write_attribute_list(&mut self, base: u64, entries: &[AttrListEntry]) -> Result<()> {
        let mut value = Vec::new();
        for e in entries {
            e.encode_into(&mut value)?;
        }
        let idx = self
            .record(base)?
            .find(AttrType::AttributeList, "")
            .ok_or_else(|| Error::IoError(format!("record {} has no attribute list", base)))?;
        let loc = AttrLoc { record: base, idx };
        self.resize_attribute_value(loc, value.len())?;
        self.write_attribute(loc, 0, &value)
    }

    pub(crate) fn add_list_entry(&mut self, base: u64, entry: AttrListEntry) -> Result<()> {
        let mut entries = self.attribute_list(base)?;
        let pos = entries
            .iter()
            .position(|e| (e.ty, &e.name) > (entry.ty, &entry.name))
            .unwrap_or(entries.len());
        entries.insert(pos, entry);
        self.write_attribute_list(base, &entries)
    }

    pub(crate) fn remove_list_entry(&mut self, base: u64, ty: AttrType, name: &str) -> Result<()> {
        let mut entries = self.attribute_list(base)?;
        let before = entries.len();
        entries.retain(|e| !(e.ty == ty && e.name == name));
        if entries.len() == before {
            return Ok(());
        }
        self.write_attribute_list(base, &entries)
    }

    fn set_list_record(&mut self, base: u64, ty: AttrType, name: &str, record: u64) -> Result<()> {
        let mut entries = self.attribute_list(base)?;
        let entry = entries
            .iter_mut()
            .find(|e| e.ty == ty && e.name == name)
            .ok_or_else(|| Error::corrupt(format!("attribute list lacks {:?} {}", ty, name)))?;
        entry.record = record;
        self.write_attribute_list(base, &entries)
    }

    /// Record length of the attribute list a file would get if it had none yet.
    fn new_list_len(&self, base: u64) -> Result<usize> {
        let mut len = 0;
        for r in std::iter::once(base).chain(self.extension_records(base)) {
            len += self
                .record(r)?
                .attrs
                .iter()
                .map(|a| AttrListEntry::len_for(&a.name))
                .sum::<usize>();
        }
        Ok(Attribute::resident(AttrType::AttributeList, "", vec![0; len]).record_len())
    }

    fn create_attribute_list(&mut self, base: u64, log: &mut MoveLog) -> Result<()> {
        let mut entries = Vec::new();
        for r in std::iter::once(base).chain(self.extension_records(base)) {
            for a in &self.record(r)?.attrs {
                entries.push(AttrListEntry {
                    ty: a.ty,
                    name: a.name.clone(),
                    record: r,
                });
            }
        }
        entries.sort_by(|a, b| (a.ty, &a.name).cmp(&(b.ty, &b.name)));
        let mut value = Vec::new();
        for e in &entries {
            e.encode_into(&mut value)?;
        }
        let list = Attribute::resident(AttrType::AttributeList, "", value);
        if self.record_free(base)? < list.record_len() {
            return Err(Error::OutOfSpace);
        }
        self.record_mut(base)?.insert_sorted(list);
        self.mark_record_dirty(base)?;
        log.list_created = true;
        Ok(())
    }

    /// An extension record of `base`, other than `exclude`, with `len` free bytes.
    fn extension_with_room(&mut self, base: u64, exclude: u64, len: usize) -> Result<u64> {
        for r in self.extension_records(base) {
            if r != exclude && self.record_free(r)? >= len {
                return Ok(r);
            }
        }
        let r = self.create_extension_record(base)?;
        if self.record_free(r)? < len {
            self.release_record(r)?;
            return Err(Error::OutOfSpace);
        }
        Ok(r)
    }

    /// Move an attribute of a file to an extension record.
    pub(crate) fn move_to_extension(&mut self, base: u64, ty: AttrType, name: &str) -> Result<MoveLog> {
        let loc = self
            .find_attribute(base, ty, name)?
            .ok_or_else(|| Error::IoError(format!("no attribute {:?} {} to move", ty, name)))?;
        if loc.record == base && !self.has_attribute_list(base)? {
            let free = self.record_free(base)? + self.attribute(loc)?.record_len();
            if free < self.new_list_len(base)? {
                return Err(Error::OutOfSpace);
            }
        }
        self.relocate(base, loc.record, vec![(ty, name.to_string())])
    }

    /// Make `needed` bytes available in `record` by moving other attributes of
    /// the file out to extension records. Attributes named in `keep` stay put.
    pub(crate) fn make_space(
        &mut self,
        base: u64,
        record: u64,
        needed: usize,
        keep: &[(AttrType, &str)],
    ) -> Result<MoveLog> {
        let free = self.record_free(record)?;
        if free >= needed {
            return Ok(MoveLog::default());
        }
        let list_cost = if record == base && !self.has_attribute_list(base)? {
            self.new_list_len(base)?
        } else {
            0
        };
        let mut candidates: Vec<(AttrType, String, usize)> = self
            .record(record)?
            .attrs
            .iter()
            .filter(|a| {
                a.ty != AttrType::StandardInformation
                    && a.ty != AttrType::AttributeList
                    && !keep.iter().any(|(t, n)| a.is(*t, n))
            })
            .map(|a| (a.ty, a.name.clone(), a.record_len()))
            .collect();
        candidates.sort_by(|a, b| b.2.cmp(&a.2));

        let mut gained = 0;
        let mut victims = Vec::new();
        for (ty, name, len) in candidates {
            if free + gained >= needed + list_cost {
                break;
            }
            gained += len;
            victims.push((ty, name));
        }
        if free + gained < needed + list_cost {
            return Err(Error::OutOfSpace);
        }
        let log = self.relocate(base, record, victims)?;
        debug!(
            record,
            moved = log.moved(),
            list_created = log.list_created,
            "made room in record"
        );
        Ok(log)
    }

    fn relocate(&mut self, base: u64, record: u64, victims: Vec<(AttrType, String)>) -> Result<MoveLog> {
        let has_list = self.has_attribute_list(base)?;
        if !has_list && record != base {
            return Err(Error::corrupt(format!(
                "extension record {} without an attribute list",
                record
            )));
        }
        let mut log = MoveLog::default();
        let result = self.relocate_into(base, record, victims, has_list, &mut log);
        if let Err(e) = result {
            self.undo_moves(base, log)?;
            return Err(e);
        }
        Ok(log)
    }

    fn relocate_into(
        &mut self,
        base: u64,
        record: u64,
        victims: Vec<(AttrType, String)>,
        has_list: bool,
        log: &mut MoveLog,
    ) -> Result<()> {
        for (ty, name) in victims {
            let idx = self
                .record(record)?
                .find(ty, &name)
                .ok_or_else(|| Error::IoError(format!("no attribute {:?} {} to move", ty, name)))?;
            let len = self.record(record)?.attrs[idx].record_len();
            let target = self.extension_with_room(base, record, len)?;
            let attr = self.record_mut(record)?.attrs.remove(idx);
            self.record_mut(target)?.insert_sorted(attr);
            self.mark_record_dirty(target)?;
            self.mark_record_dirty(record)?;
            log.moves.push(Move {
                ty,
                name: name.clone(),
                from: record,
                to: target,
            });
            if has_list {
                self.set_list_record(base, ty, &name, target)?;
            }
        }
        if !has_list {
            self.create_attribute_list(base, log)?;
        }
        Ok(())
    }

    /// Put relocated attributes back where they were.
    pub(crate) fn undo_moves(&mut self, base: u64, log: MoveLog) -> Result<()> {
        if log.list_created {
            if let Some(idx) = self.record(base)?.find(AttrType::AttributeList, "") {
                self.record_mut(base)?.attrs.remove(idx);
            }
        }
        let has_list = self.has_attribute_list(base)?;
        for m in log.moves.iter().rev() {
            let idx = self.record(m.to)?.find(m.ty, &m.name).ok_or_else(|| {
                Error::IoError(format!("moved attribute {} vanished from record {}", m.name, m.to))
            })?;
            let len = self.record(m.to)?.attrs[idx].record_len();
            if self.record_free(m.from)? < len {
                return Err(Error::IoError(format!(
                    "no room to move attribute {} back to record {}",
                    m.name, m.from
                )));
            }
            let attr = self.record_mut(m.to)?.attrs.remove(idx);
            self.record_mut(m.from)?.insert_sorted(attr);
            if has_list {
                self.set_list_record(base, m.ty, &m.name, m.from)?;
            }
            if self.record(m.to)?.attrs.is_empty() {
                self.release_record(m.to)?;
            }
        }
        self.mark_record_dirty(base)
    }
}
