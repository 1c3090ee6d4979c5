#![no_main]
use libfuzzer_sys::fuzz_target;

use std::collections::BTreeMap;
use ntfs_index::{Collation, EntryValue, Error, Index, IndexConfig, IndexEntry, Volume, VolumeConfig};

fuzz_target!(|data: (Vec<(bool, u16, u8)>, bool)| {
    let block_size = if data.1 { 1024 } else { 4096 };
    let mut m = BTreeMap::default();
    let mut vol = Volume::new(VolumeConfig::default()).unwrap();
    let mft = vol.create_record().unwrap();
    let mut fixture = Index::create(
        &mut vol,
        mft,
        IndexConfig::view("$O", Collation::NtofsUlong).block_size(block_size),
    )
    .unwrap();

    for (insert, key, len) in data.0 {
        let key = key as u32;
        if insert {
            let value = vec![len; len as usize % 64];
            match fixture.insert(IndexEntry::view(key.to_le_bytes().to_vec(), value.clone())) {
                Ok(()) => assert!(m.insert(key, value).is_none()),
                Err(Error::DuplicateKey) => assert!(m.contains_key(&key)),
                Err(e) => panic!("{}", e),
            }
        } else {
            match fixture.remove(&key.to_le_bytes()) {
                Ok(entry) => assert_eq!(m.remove(&key).map(EntryValue::Data), Some(entry.value)),
                Err(Error::NotFound) => assert!(!m.contains_key(&key)),
                Err(e) => panic!("{}", e),
            }
        }
    }

    // Structure and contents have to match the map
    assert_eq!(m.len() as u64, fixture.verify().unwrap().entries);
    let m: Vec<_> = m
        .into_iter()
        .map(|(k, v)| IndexEntry::view(k.to_le_bytes().to_vec(), v))
        .collect();
    assert_eq!(m, fixture.entries().unwrap());
});
