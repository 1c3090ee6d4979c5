#![no_main]
use fake::{Fake, StringFaker};
use libfuzzer_sys::fuzz_target;
use rand::SeedableRng;
use ntfs_index::{file_name_key, EntryValue, Index, IndexConfig, IndexEntry, Volume, VolumeConfig};

fuzz_target!(|seed: u64| {
    // Create a directory with random names
    let n_entries = 2000;
    let mut rng = rand::rngs::SmallRng::seed_from_u64(seed);
    const ASCII: &str = "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let name_faker = StringFaker::with(Vec::from(ASCII), 1..32);

    let mut vol = Volume::new(VolumeConfig::default()).unwrap();
    let dir = vol.create_record().unwrap();
    let mut index = Index::create(&mut vol, dir, IndexConfig::directory().block_size(1024)).unwrap();

    for i in 0..n_entries {
        let name: String = name_faker.fake_with_rng(&mut rng);
        let _ = index.insert(IndexEntry::file(file_name_key(5, &name), i));
    }
    // Generate and insert a known name
    let search_name: String = name_faker.fake_with_rng(&mut rng);
    let search_key = file_name_key(5, &format!("{}.txt", search_name));
    let _ = index.remove(&search_key);
    index.insert(IndexEntry::file(search_key.clone(), 4711)).unwrap();

    let found = index.get(&search_key).unwrap().unwrap();
    assert_eq!(EntryValue::FileRef(4711), found.value);
    index.verify().unwrap();
});
