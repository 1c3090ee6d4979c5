use std::collections::BTreeMap;

use debug_tree::TreeBuilder;
use rand::{Rng, SeedableRng};

use super::*;
use crate::collation::file_name_key;
use crate::config::VolumeConfig;
use crate::entry::{EntryValue, IndexEntry};
use crate::layout::{index_entry, ENTRY_NODE};
use crate::volume::{Fault, FaultOp};

fn print_tree(index: &mut Index) -> Result<()> {
    let mut b = TreeBuilder::new();
    let mut ctx = index.new_context();
    let root = ctx.push_root();
    let r = index
        .lock(&mut ctx, root)
        .and_then(|_| print_tree_node(&mut b, index, &mut ctx, root));
    index.finish(&mut ctx, r)?;
    b.print();
    Ok(())
}

fn print_tree_node(
    builder: &mut TreeBuilder,
    index: &mut Index,
    ctx: &mut Context,
    id: CtxId,
) -> Result<()> {
    let entries = index.node_entries(ctx, id)?;
    let (internal, label) = {
        let n = ctx.node(id)?;
        let label = match n.loc {
            NodeLoc::Root => format!("(root with {} entries)", n.real_entries()),
            NodeLoc::Block(vcn) => format!("(block {} with {} entries)", vcn, n.real_entries()),
        };
        (n.internal, label)
    };
    let mut branch = builder.add_branch(&label);
    for (i, raw) in entries.iter().enumerate() {
        if internal {
            let child = ctx.alloc(NodeLoc::Block(entry::child_vcn(raw)?));
            index.lock(ctx, child)?;
            print_tree_node(builder, index, ctx, child)?;
            index.unlock(ctx, child)?;
            ctx.release(child)?;
        }
        if !entry::is_end(raw) {
            builder.add_leaf(&format!("{:?} ({}. key)", entry::key(raw)?, i));
        }
    }
    branch.release();
    Ok(())
}

fn check_order(index: &mut Index) {
    let mut previous: Option<Vec<u8>> = None;
    for e in index.entries().unwrap() {
        if let Some(previous) = previous {
            assert_eq!(
                std::cmp::Ordering::Less,
                index.collation().collate(&previous, &e.key).unwrap()
            );
        }
        previous = Some(e.key);
    }
}

fn quota_entry(k: u32) -> IndexEntry {
    IndexEntry::view(k.to_le_bytes().to_vec(), vec![k as u8; 20])
}

fn key(k: u32) -> Vec<u8> {
    k.to_le_bytes().to_vec()
}

fn quota_config(block_size: u32) -> IndexConfig {
    IndexConfig::view("$Q", Collation::NtofsUlong).block_size(block_size)
}

fn setup() -> (Volume, u64) {
    let mut vol = Volume::new(VolumeConfig::default()).unwrap();
    let mft = vol.create_record().unwrap();
    (vol, mft)
}

#[test]
fn small_index_lives_in_the_root() {
    let (mut vol, mft) = setup();
    let mut index = Index::create(&mut vol, mft, quota_config(4096)).unwrap();
    assert!(index.is_empty().unwrap());
    for k in [5, 3, 1, 4, 2] {
        index.insert(quota_entry(k)).unwrap();
    }
    let stats = index.verify().unwrap();
    assert_eq!(5, stats.entries);
    assert_eq!(0, stats.blocks);
    assert_eq!(1, stats.depth);
    assert!(!stats.large);
    assert_eq!(0, index.allocation_size().unwrap());
    assert!(!index.is_empty().unwrap());

    let keys: Vec<Vec<u8>> = index.entries().unwrap().into_iter().map(|e| e.key).collect();
    assert_eq!((1..=5).map(key).collect::<Vec<_>>(), keys);

    let l = index.lookup(&key(3)).unwrap();
    assert!(l.found);
    assert_eq!(1, l.ctx.depth());
    assert!(!index.lookup(&key(6)).unwrap().found);
}

#[test]
fn root_promotion_moves_the_root_out_of_the_base_record() {
    let (mut vol, mft) = setup();
    let mut index = Index::create(&mut vol, mft, quota_config(4096)).unwrap();

    for k in 1..=19 {
        index.insert(quota_entry(k)).unwrap();
    }
    assert!(!index.is_large().unwrap());
    assert_eq!(24, index.vol.record_free(mft).unwrap());

    // The root no longer fits, and neither do the new attributes
    index.insert(quota_entry(20)).unwrap();
    let stats = index.verify().unwrap();
    assert!(stats.large);
    assert_eq!(1, stats.blocks);
    assert_eq!(2, stats.depth);
    assert_eq!(0, stats.root_entries);
    assert_eq!(20, stats.entries);
    assert!(index.vol.has_attribute_list(mft).unwrap());
    assert_ne!(mft, index.root_loc().unwrap().record);
    assert_eq!(4096, index.allocation_size().unwrap());

    for k in 21..=100 {
        index.insert(quota_entry(k)).unwrap();
    }
    let found = index.get(&key(57)).unwrap().unwrap();
    assert_eq!(EntryValue::Data(vec![57; 20]), found.value);

    let mut l = index.lookup_by_position(56).unwrap();
    assert!(l.found);
    assert_eq!(key(57), index.entry(&mut l.ctx).unwrap().key);
    assert_eq!(100, index.verify().unwrap().entries);
}

#[test]
fn duplicate_keys_are_rejected() {
    let (mut vol, mft) = setup();
    let mut index = Index::create(&mut vol, mft, quota_config(4096)).unwrap();
    index.insert(quota_entry(7)).unwrap();
    assert!(matches!(
        index.insert(IndexEntry::view(key(7), vec![1; 4])),
        Err(Error::DuplicateKey)
    ));
    assert!(index.is_usable());
    assert_eq!(EntryValue::Data(vec![7; 20]), index.get(&key(7)).unwrap().unwrap().value);
}

#[test]
fn entries_larger_than_a_third_block_are_rejected() {
    let (mut vol, mft) = setup();
    let mut index = Index::create(&mut vol, mft, quota_config(4096)).unwrap();
    assert_eq!(1336, index.max_entry_len());
    let r = index.insert(IndexEntry::view(key(1), vec![0; 2000]));
    assert!(matches!(r, Err(Error::EntryTooLarge { max: 1336, .. })));
    assert!(index.is_usable());
    assert!(index.is_empty().unwrap());
}

#[test]
fn ascending_inserts_grow_the_tree() {
    let (mut vol, mft) = setup();
    let mut index = Index::create(&mut vol, mft, quota_config(1024)).unwrap();
    for k in 0..500 {
        index.insert(quota_entry(k)).unwrap();
    }
    print_tree(&mut index).unwrap();
    let stats = index.verify().unwrap();
    assert_eq!(500, stats.entries);
    assert!(stats.depth >= 3);
    check_order(&mut index);
    for k in (0..500).step_by(37) {
        assert!(index.lookup(&key(k)).unwrap().found);
    }
    assert!(!index.lookup(&key(500)).unwrap().found);
}

#[test]
fn lookup_next_walks_in_key_order() {
    let (mut vol, mft) = setup();
    let mut index = Index::create(&mut vol, mft, quota_config(1024)).unwrap();
    let mut rng = rand::rngs::SmallRng::seed_from_u64(4711);
    let mut keys: Vec<u32> = (0..200).map(|k| k * 3).collect();
    for i in (1..keys.len()).rev() {
        keys.swap(i, rng.gen_range(0..=i));
    }
    for k in &keys {
        index.insert(quota_entry(*k)).unwrap();
    }

    let mut l = index.lookup_by_position(0).unwrap();
    assert!(l.found);
    let mut visited = Vec::new();
    loop {
        visited.push(index.entry(&mut l.ctx).unwrap().key);
        if !index.lookup_next(&mut l.ctx).unwrap() {
            break;
        }
    }
    let expected: Vec<Vec<u8>> = (0..200).map(|k| key(k * 3)).collect();
    assert_eq!(expected, visited);

    assert!(!index.lookup(&key(31)).unwrap().found);

    assert!(!index.lookup_by_position(200).unwrap().found);
}

#[test]
fn stale_contexts_are_refused() {
    let (mut vol, mft) = setup();
    let mut index = Index::create(&mut vol, mft, quota_config(4096)).unwrap();
    index.insert(quota_entry(5)).unwrap();
    let mut l = index.lookup(&key(5)).unwrap();
    index.insert(quota_entry(6)).unwrap();
    assert!(matches!(index.entry(&mut l.ctx), Err(Error::NotFound)));
    assert!(matches!(index.delete(&mut l.ctx), Err(Error::NotFound)));
    assert!(index.is_usable());
}

#[test]
fn median_is_lifted_into_the_root() {
    for (extra, separator) in [(115, 115), (5, 110)] {
        let (mut vol, mft) = setup();
        let mut index = Index::create(&mut vol, mft, quota_config(1024)).unwrap();
        // 24 entries fill a single leaf
        for k in (0..=230).step_by(10) {
            index.insert(quota_entry(k)).unwrap();
        }
        assert_eq!(1, index.verify().unwrap().blocks);

        index.insert(quota_entry(extra)).unwrap();
        let stats = index.verify().unwrap();
        assert_eq!(2, stats.blocks);
        assert_eq!(1, stats.root_entries);
        assert_eq!(25, stats.entries);

        let l = index.lookup(&key(separator)).unwrap();
        assert!(l.found);
        assert_eq!(1, l.ctx.depth());
        let l = index.lookup(&key(extra)).unwrap();
        assert!(l.found);
    }
}

fn delete_all(keys: impl Iterator<Item = u32>) {
    let (mut vol, mft) = setup();
    let mut index = Index::create(&mut vol, mft, quota_config(1024)).unwrap();
    for k in 1..=200 {
        index.insert(quota_entry(k)).unwrap();
    }
    assert!(index.verify().unwrap().depth >= 2);

    for (i, k) in keys.enumerate() {
        let removed = index.remove(&key(k)).unwrap();
        assert_eq!(EntryValue::Data(vec![k as u8; 20]), removed.value);
        assert!(!index.lookup(&key(k)).unwrap().found);
        if i % 10 == 0 {
            assert_eq!(199 - i as u64, index.verify().unwrap().entries);
        }
    }
    assert!(!index.is_large().unwrap());
    assert!(index.is_empty().unwrap());
    assert_eq!(0, index.allocation_size().unwrap());
    assert_eq!(0, index.bitmap_size().unwrap());
    assert_eq!(
        IndexStats {
            depth: 1,
            ..IndexStats::default()
        },
        index.verify().unwrap()
    );
    assert!(matches!(index.remove(&key(1)), Err(Error::NotFound)));
    assert!(index.is_usable());

    // The demoted index can grow again
    for k in 1..=50 {
        index.insert(quota_entry(k)).unwrap();
    }
    assert_eq!(50, index.verify().unwrap().entries);
}

#[test]
fn delete_descending() {
    delete_all((1..=200).rev());
}

#[test]
fn delete_ascending() {
    delete_all(1..=200);
}

#[test]
fn last_entry_demotes_the_index() {
    let (mut vol, mft) = setup();
    let mut index = Index::create(&mut vol, mft, quota_config(4096)).unwrap();
    for k in 1..=100 {
        index.insert(quota_entry(k)).unwrap();
    }
    for k in (2..=100).rev() {
        index.remove(&key(k)).unwrap();
    }
    let stats = index.verify().unwrap();
    assert!(stats.large);
    assert_eq!(1, stats.blocks);
    assert_eq!(0, stats.root_entries);
    assert_eq!(1, stats.entries);

    index.remove(&key(1)).unwrap();
    assert!(!index.is_large().unwrap());
    assert_eq!(0, index.allocation_size().unwrap());
    assert_eq!(0, index.bitmap_size().unwrap());
    assert_eq!(None, index.bmp_highest);
}

#[test]
fn delete_through_a_context() {
    let (mut vol, mft) = setup();
    let mut index = Index::create(&mut vol, mft, quota_config(1024)).unwrap();
    for k in 0..300 {
        index.insert(quota_entry(k)).unwrap();
    }
    let mut restarts = 0;
    for k in (0..300).filter(|k| k % 3 != 0) {
        loop {
            let mut l = index.lookup(&key(k)).unwrap();
            assert!(l.found);
            match index.delete(&mut l.ctx).unwrap() {
                DeleteStatus::Done => break,
                DeleteStatus::Restart { key: restart } => {
                    assert_eq!(key(k), restart);
                    restarts += 1;
                    assert!(restarts < 1000);
                }
            }
        }
    }
    assert_eq!(100, index.verify().unwrap().entries);
    check_order(&mut index);
    for k in 0..300 {
        assert_eq!(k % 3 == 0, index.lookup(&key(k)).unwrap().found);
    }
}

#[test]
fn random_operations_match_a_btreemap() {
    let (mut vol, mft) = setup();
    let mut index = Index::create(&mut vol, mft, quota_config(1024)).unwrap();
    let mut expected = BTreeMap::new();
    let mut rng = rand::rngs::SmallRng::seed_from_u64(1971428643569665);

    for i in 0..2000 {
        let k: u32 = rng.gen_range(0..500);
        if rng.gen_bool(0.6) {
            let r = index.insert(quota_entry(k));
            if expected.insert(k, vec![k as u8; 20]).is_some() {
                assert!(matches!(r, Err(Error::DuplicateKey)));
            } else {
                r.unwrap();
            }
        } else {
            match expected.remove(&k) {
                Some(data) => {
                    assert_eq!(EntryValue::Data(data), index.remove(&key(k)).unwrap().value)
                }
                None => assert!(matches!(index.remove(&key(k)), Err(Error::NotFound))),
            }
        }
        if i % 200 == 0 {
            assert_eq!(expected.len() as u64, index.verify().unwrap().entries);
        }
    }

    let keys: Vec<Vec<u8>> = index.entries().unwrap().into_iter().map(|e| e.key).collect();
    let expected_keys: Vec<Vec<u8>> = expected.keys().map(|k| key(*k)).collect();
    assert_eq!(expected_keys, keys);
    assert!(index.is_usable());
}

#[test]
fn failed_promotion_is_rolled_back() {
    let mut vol = Volume::new(VolumeConfig::default().clusters(16)).unwrap();
    let mft = vol.create_record().unwrap();
    let other = vol.create_record().unwrap();
    let filler = vol
        .add_attribute(other, Attribute::non_resident(AttrType::Data, ""))
        .unwrap();
    vol.set_allocated_clusters(filler, 16).unwrap();
    assert_eq!(0, vol.free_clusters());

    let mut index = Index::create(&mut vol, mft, quota_config(4096)).unwrap();
    for k in 1..=19 {
        index.insert(quota_entry(k)).unwrap();
    }
    assert!(matches!(index.insert(quota_entry(20)), Err(Error::OutOfSpace)));
    assert!(index.is_usable());
    assert!(!index.volume().needs_check());

    let stats = index.verify().unwrap();
    assert_eq!(19, stats.entries);
    assert!(!stats.large);
    assert_eq!(mft, index.root_loc().unwrap().record);
    assert!(!index.vol.has_attribute_list(mft).unwrap());
    assert!(index.allocation_loc().unwrap().is_none());
    assert!(index.bitmap_loc().unwrap().is_none());
    assert!(index.vol.extension_records(mft).is_empty());

    let filler = index
        .vol
        .find_attribute(other, AttrType::Data, "")
        .unwrap()
        .unwrap();
    index.vol.set_allocated_clusters(filler, 15).unwrap();
    index.insert(quota_entry(20)).unwrap();
    let stats = index.verify().unwrap();
    assert!(stats.large);
    assert_eq!(20, stats.entries);
}

#[test]
fn file_names_differing_in_case_are_distinct() {
    let (mut vol, mft) = setup();
    let mut index = Index::create(&mut vol, mft, IndexConfig::directory()).unwrap();
    index
        .insert(IndexEntry::file(file_name_key(5, "readme.txt"), 42))
        .unwrap();
    index
        .insert(IndexEntry::file(file_name_key(5, "README.TXT"), 43))
        .unwrap();
    assert!(matches!(
        index.insert(IndexEntry::file(file_name_key(5, "readme.txt"), 44)),
        Err(Error::DuplicateKey)
    ));
    let found = index.get(&file_name_key(5, "README.TXT")).unwrap().unwrap();
    assert_eq!(EntryValue::FileRef(43), found.value);
    assert_eq!(2, index.verify().unwrap().entries);
}

#[test]
fn bitmap_grows_with_the_allocation() {
    let (mut vol, mft) = setup();
    let mut index = Index::create(&mut vol, mft, quota_config(1024)).unwrap();
    for k in 0..1500 {
        index.insert(quota_entry(k)).unwrap();
    }
    let stats = index.verify().unwrap();
    assert!(stats.blocks > 64);
    assert!(index.bitmap_size().unwrap() >= 16);
    assert_eq!(0, index.bitmap_size().unwrap() % 8);
    assert!(index.allocation_size().unwrap() >= stats.blocks * 1024);
}

#[test]
fn open_existing_index() {
    let (mut vol, mft) = setup();
    {
        let mut index = Index::create(&mut vol, mft, quota_config(1024)).unwrap();
        for k in 0..100 {
            index.insert(quota_entry(k)).unwrap();
        }
    }
    assert!(matches!(
        Index::create(&mut vol, mft, quota_config(1024)),
        Err(Error::InvalidConfig(_))
    ));
    assert!(matches!(
        Index::open(&mut vol, mft, "$O"),
        Err(Error::NotFound)
    ));

    let mut index = Index::open(&mut vol, mft, "$Q").unwrap();
    assert_eq!(IndexKind::View, index.kind());
    assert_eq!(Collation::NtofsUlong, index.collation());
    assert_eq!(1024, index.block_size());
    assert_eq!(100, index.len().unwrap());
    let highest = index.bmp_highest;
    assert_eq!(index.highest_set_bit().unwrap(), highest);

    index.insert(quota_entry(100)).unwrap();
    assert_eq!(101, index.verify().unwrap().entries);
}

/// Point the end entry of the root at `vcn`.
fn redirect_root_end(index: &mut Index, vcn: u64) {
    let mut ctx = index.new_context();
    let root = ctx.push_root();
    index.lock(&mut ctx, root).unwrap();
    let end = ctx.node(root).unwrap().real_entries();
    index.set_child(&mut ctx, root, end, vcn).unwrap();
    index.unlock_all(&mut ctx).unwrap();
}

/// Overwrite the first entry of the block at `vcn`.
fn damage_first_entry(index: &mut Index, vcn: u64, damage: impl FnOnce(&mut [u8])) {
    let mut ctx = index.new_context();
    let b = ctx.alloc(NodeLoc::Block(vcn));
    index.lock(&mut ctx, b).unwrap();
    let first = ctx.node(b).unwrap().entries[0];
    damage(&mut index.node_buf_mut(&ctx, b).unwrap()[first..]);
    ctx.node_mut(b).unwrap().dirty = true;
    index.unlock_all(&mut ctx).unwrap();
}

fn leaf_of(index: &mut Index, k: u32) -> (u64, usize) {
    let l = index.lookup(&key(k)).unwrap();
    assert!(l.found);
    let n = l.ctx.node(l.ctx.bottom().unwrap()).unwrap();
    (n.vcn().unwrap(), n.real_entries())
}

fn assert_unusable(index: &mut Index) {
    assert!(index.volume().needs_check());
    assert!(!index.is_usable());
    assert!(matches!(index.insert(quota_entry(4711)), Err(Error::IndexUnusable)));
    let mut ctx = index.new_context();
    assert!(matches!(index.delete(&mut ctx), Err(Error::IndexUnusable)));
}

#[test]
fn corrupt_child_pointers_are_reported() {
    // VCNs that do not start a block or lie past the allocation
    for bad_vcn in [7, u64::MAX, u64::MAX - 1, 64] {
        let (mut vol, mft) = setup();
        let mut index = Index::create(&mut vol, mft, quota_config(1024)).unwrap();
        for k in 0..30 {
            index.insert(quota_entry(k)).unwrap();
        }
        assert_eq!(2, index.verify().unwrap().blocks);
        redirect_root_end(&mut index, bad_vcn);

        assert!(matches!(index.lookup(&key(1000)), Err(Error::CorruptIndex(_))));
        assert_unusable(&mut index);
    }
}

#[test]
fn damaged_blocks_make_the_index_unusable() {
    let damages: [fn(&mut [u8]); 2] = [
        |e| index_entry::length::write(e, 0),
        |e| {
            let flags = index_entry::flags::read(&*e);
            index_entry::flags::write(e, flags | ENTRY_NODE);
        },
    ];
    for damage in damages {
        let (mut vol, mft) = setup();
        let mut index = Index::create(&mut vol, mft, quota_config(1024)).unwrap();
        for k in 0..30 {
            index.insert(quota_entry(k)).unwrap();
        }
        let (vcn, _) = leaf_of(&mut index, 29);
        damage_first_entry(&mut index, vcn, damage);

        assert!(matches!(index.lookup(&key(29)), Err(Error::CorruptIndex(_))));
        assert_unusable(&mut index);
        // Reading is still allowed where the tree is intact
        assert!(index.lookup(&key(1)).unwrap().found);
    }
}

#[test]
fn malformed_keys_leave_the_index_usable() {
    let (mut vol, mft) = setup();
    let mut index = Index::create(&mut vol, mft, quota_config(1024)).unwrap();
    assert!(matches!(
        index.insert(IndexEntry::view(vec![1, 2], vec![0; 4])),
        Err(Error::InvalidKey(_))
    ));
    assert!(index.is_empty().unwrap());

    for k in 0..30 {
        index.insert(quota_entry(k)).unwrap();
    }
    assert!(matches!(index.lookup(&[1, 2]), Err(Error::InvalidKey(_))));
    assert!(matches!(index.get(&[1, 2, 3, 4, 5]), Err(Error::InvalidKey(_))));
    assert!(matches!(index.remove(&[]), Err(Error::InvalidKey(_))));
    assert!(index.is_usable());
    assert!(!index.volume().needs_check());

    index.insert(quota_entry(30)).unwrap();
    assert_eq!(31, index.verify().unwrap().entries);
}

#[test]
fn locks_are_taken_in_storage_order() {
    let (mut vol, mft) = setup();
    let mut index = Index::create(&mut vol, mft, quota_config(1024)).unwrap();
    for k in 0..2000 {
        index.insert(quota_entry(k)).unwrap();
    }
    let order = |loc: &NodeLoc| match *loc {
        NodeLoc::Root => (true, 0),
        NodeLoc::Block(vcn) => (false, vcn),
    };

    let mut deep_paths = 0;
    for k in (0..2000).step_by(97) {
        let mut l = index.lookup(&key(k)).unwrap();
        assert!(l.found);
        l.ctx.pins.clear();
        index.lock_path(&mut l.ctx).unwrap();
        let pins = l.ctx.pins.clone();
        index.unlock_all(&mut l.ctx).unwrap();

        assert_eq!(l.ctx.depth(), pins.len());
        assert_eq!(Some(&NodeLoc::Root), pins.last());
        let mut sorted = pins.clone();
        sorted.sort_by_key(order);
        assert_eq!(sorted, pins);
        if pins.len() >= 3 {
            deep_paths += 1;
        }
    }
    assert!(deep_paths > 0);
    assert_eq!(0, index.volume().cache().pinned());
}

#[test]
fn failed_split_after_the_parent_was_written_is_fatal() {
    let (mut vol, mft) = setup();
    let mut index = Index::create(&mut vol, mft, quota_config(4096)).unwrap();
    for k in 0..20 {
        index.insert(quota_entry(k)).unwrap();
    }
    assert!(index.is_large().unwrap());
    // Block 1 is mapped once to lay it out and once more to fill it
    index.vol.arm_fault(Fault {
        op: FaultOp::MapPage(1),
        ty: AttrType::IndexAllocation,
        skip: 1,
    });

    let mut failure = None;
    for k in 20..1000 {
        if let Err(e) = index.insert(quota_entry(k)) {
            failure = Some(e);
            break;
        }
    }
    match failure {
        Some(Error::IoError(msg)) => assert!(msg.contains("partial commit"), "{}", msg),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_unusable(&mut index);
}

#[test]
fn failed_merge_after_the_sibling_was_written_is_fatal() {
    let (mut vol, mft) = setup();
    let mut index = Index::create(&mut vol, mft, quota_config(1024)).unwrap();
    for k in 0..30 {
        index.insert(quota_entry(k)).unwrap();
    }
    // Empty the right leaf down to a single entry
    let mut k = 29;
    while leaf_of(&mut index, k).1 > 1 {
        index.remove(&key(k)).unwrap();
        k -= 1;
    }
    assert_eq!(1, index.verify().unwrap().root_entries);

    // The separator moves into the left leaf, then shrinking the root fails
    index.vol.arm_fault(Fault {
        op: FaultOp::Resize,
        ty: AttrType::IndexRoot,
        skip: 0,
    });
    match index.remove(&key(k)) {
        Err(Error::IoError(msg)) => assert!(msg.contains("partial commit"), "{}", msg),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_unusable(&mut index);
}

#[test]
fn failed_bitmap_update_gives_the_growth_back() {
    let (mut vol, mft) = setup();
    let mut index = Index::create(&mut vol, mft, quota_config(4096)).unwrap();
    for k in 0..20 {
        index.insert(quota_entry(k)).unwrap();
    }
    assert_eq!(8, index.bitmap_size().unwrap());
    for _ in 1..64 {
        index.allocate_block().unwrap();
    }
    let allocation = index.allocation_size().unwrap();
    assert_eq!(64 * 4096, allocation);

    // The bitmap grows, then setting the bit of block 64 fails
    index.vol.arm_fault(Fault {
        op: FaultOp::Write,
        ty: AttrType::Bitmap,
        skip: 0,
    });
    assert!(matches!(index.allocate_block(), Err(Error::IoError(_))));
    assert_eq!(8, index.bitmap_size().unwrap());
    assert_eq!(allocation, index.allocation_size().unwrap());

    assert_eq!(64, index.allocate_block().unwrap());
    assert_eq!(16, index.bitmap_size().unwrap());
}
