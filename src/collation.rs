use std::cmp::Ordering;

use serde_derive::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Offset of the name length inside a FILE_NAME attribute value.
const FILE_NAME_LENGTH_OFFSET: usize = 64;
/// Offset of the UTF-16 name inside a FILE_NAME attribute value.
const FILE_NAME_OFFSET: usize = 66;
/// Revision, sub-authority count and identifier authority of a SID.
const SID_HEADER_LEN: usize = 8;

/// Ordering rule used to compare the keys of an index.
///
/// The discriminants are the values stored in the `collation_rule` field of
/// the index root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Collation {
    /// Plain byte comparison, shorter key first on a common prefix.
    Binary,
    /// Keys are FILE_NAME attribute values, compared by their names.
    FileName,
    /// Keys are bare UTF-16LE strings.
    UnicodeString,
    /// Keys are a single little endian `u32`.
    NtofsUlong,
    /// Keys are security identifiers.
    NtofsSid,
    /// Keys are a security descriptor hash followed by its id, both `u32`.
    NtofsSecurityHash,
    /// Keys are a sequence of little endian `u32` values.
    NtofsUlongs,
}

impl Collation {
    pub fn from_rule(rule: u32) -> Result<Collation> {
        match rule {
            0x00 => Ok(Collation::Binary),
            0x01 => Ok(Collation::FileName),
            0x02 => Ok(Collation::UnicodeString),
            0x10 => Ok(Collation::NtofsUlong),
            0x11 => Ok(Collation::NtofsSid),
            0x12 => Ok(Collation::NtofsSecurityHash),
            0x13 => Ok(Collation::NtofsUlongs),
            _ => Err(Error::corrupt(format!("unknown collation rule {:#x}", rule))),
        }
    }

    pub fn rule(&self) -> u32 {
        match self {
            Collation::Binary => 0x00,
            Collation::FileName => 0x01,
            Collation::UnicodeString => 0x02,
            Collation::NtofsUlong => 0x10,
            Collation::NtofsSid => 0x11,
            Collation::NtofsSecurityHash => 0x12,
            Collation::NtofsUlongs => 0x13,
        }
    }

    /// Check that a caller supplied key has the shape the rule compares.
    ///
    /// Malformed keys found on disk are reported by [`Collation::collate`]
    /// as corruption instead.
    pub fn validate_key(&self, key: &[u8]) -> Result<()> {
        let bad = |what: &str| -> Result<()> {
            Err(Error::InvalidKey(format!("{} key of {} bytes", what, key.len())))
        };
        match self {
            Collation::Binary => Ok(()),
            Collation::NtofsUlong if key.len() != 4 => bad("ULONG"),
            Collation::NtofsSecurityHash if key.len() != 8 => bad("SECURITY_HASH"),
            Collation::NtofsUlongs if key.is_empty() || key.len() % 4 != 0 => bad("ULONGS"),
            Collation::UnicodeString if key.len() % 2 != 0 => bad("UTF-16"),
            Collation::FileName => match key.get(FILE_NAME_LENGTH_OFFSET) {
                Some(len) if key.len() >= FILE_NAME_OFFSET + 2 * *len as usize => Ok(()),
                _ => bad("FILE_NAME"),
            },
            Collation::NtofsSid => match key.get(1) {
                Some(count) if key.len() == SID_HEADER_LEN + 4 * *count as usize => Ok(()),
                _ => bad("SID"),
            },
            _ => Ok(()),
        }
    }

    /// Compare two keys.
    ///
    /// Name based rules compare case-insensitively first and fall back to an
    /// exact comparison, so two names that only differ in case are distinct
    /// keys with a stable order.
    pub fn collate(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        match self {
            Collation::Binary | Collation::NtofsSid => Ok(a.cmp(b)),
            Collation::FileName => Ok(compare_names(file_name(a)?, file_name(b)?)),
            Collation::UnicodeString => Ok(compare_names(utf16(a)?, utf16(b)?)),
            Collation::NtofsUlong => Ok(ulong(a, 0)?.cmp(&ulong(b, 0)?)),
            Collation::NtofsSecurityHash => {
                let hash = ulong(a, 0)?.cmp(&ulong(b, 0)?);
                Ok(hash.then(ulong(a, 4)?.cmp(&ulong(b, 4)?)))
            }
            Collation::NtofsUlongs => {
                if a.len() % 4 != 0 || b.len() % 4 != 0 {
                    return Err(Error::corrupt("ULONGS key is not a multiple of 4 bytes"));
                }
                let a = a.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]));
                let b = b.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]));
                Ok(a.cmp(b))
            }
        }
    }
}

fn ulong(key: &[u8], offset: usize) -> Result<u32> {
    let bytes = key
        .get(offset..offset + 4)
        .ok_or_else(|| Error::corrupt("ULONG key too short"))?;
    Ok(u32::from_le_bytes(bytes.try_into()?))
}

fn utf16(key: &[u8]) -> Result<Vec<u16>> {
    if key.len() % 2 != 0 {
        return Err(Error::corrupt("UTF-16 key has odd length"));
    }
    Ok(key
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

fn file_name(key: &[u8]) -> Result<Vec<u16>> {
    let len = *key
        .get(FILE_NAME_LENGTH_OFFSET)
        .ok_or_else(|| Error::corrupt("FILE_NAME key too short"))? as usize;
    let name = key
        .get(FILE_NAME_OFFSET..FILE_NAME_OFFSET + 2 * len)
        .ok_or_else(|| Error::corrupt("FILE_NAME key shorter than its name"))?;
    utf16(name)
}

fn upcase(unit: u16) -> u16 {
    match char::from_u32(unit as u32) {
        Some(c) => {
            let mut upper = c.to_uppercase();
            match (upper.next(), upper.next()) {
                (Some(u), None) if (u as u32) <= 0xffff => u as u16,
                _ => unit,
            }
        }
        // Unpaired surrogates are compared as they are
        None => unit,
    }
}

fn compare_names(a: Vec<u16>, b: Vec<u16>) -> Ordering {
    let folded = a
        .iter()
        .map(|u| upcase(*u))
        .cmp(b.iter().map(|u| upcase(*u)));
    folded.then_with(|| a.cmp(&b))
}

/// Build the FILE_NAME attribute value used as the key of a directory entry.
pub fn file_name_key(parent_ref: u64, name: &str) -> Vec<u8> {
    let units: Vec<u16> = name.encode_utf16().take(255).collect();
    let mut key = vec![0u8; FILE_NAME_OFFSET + 2 * units.len()];
    key[0..8].copy_from_slice(&parent_ref.to_le_bytes());
    key[FILE_NAME_LENGTH_OFFSET] = units.len() as u8;
    // POSIX namespace, names are case sensitive
    key[FILE_NAME_LENGTH_OFFSET + 1] = 0;
    for (i, u) in units.iter().enumerate() {
        let o = FILE_NAME_OFFSET + 2 * i;
        key[o..o + 2].copy_from_slice(&u.to_le_bytes());
    }
    key
}

/// Decode the name stored in a FILE_NAME key.
pub fn file_name_of(key: &[u8]) -> Result<String> {
    let units = file_name(key)?;
    Ok(String::from_utf16_lossy(&units))
}
