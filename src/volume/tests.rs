use super::*;

fn small_volume() -> Volume {
    Volume::new(
        VolumeConfig::default()
            .cluster_size(512)
            .clusters(64)
            .cache_pages(4),
    )
    .unwrap()
}

fn filler(vol: &mut Volume, base: u64, name: &str, len: usize) {
    vol.add_attribute(base, Attribute::resident(AttrType::Data, name, vec![0xab; len]))
        .unwrap();
}

#[test]
fn records_are_reused() {
    let mut vol = small_volume();
    let a = vol.create_record().unwrap();
    let ext = vol.create_extension_record(a).unwrap();
    assert_eq!(vec![ext], vol.extension_records(a));
    // 56 header + 96 standard information + 8 end marker
    assert_eq!(1024 - 160, vol.record_free(a).unwrap());
    vol.release_record(ext).unwrap();
    assert!(vol.record(ext).is_err());
    let b = vol.create_record().unwrap();
    assert_eq!(ext, b);
    assert!(vol.release_record(a).is_err());
}

#[test]
fn resident_resize_respects_record_size() {
    let mut vol = small_volume();
    let base = vol.create_record().unwrap();
    let loc = vol
        .add_attribute(base, Attribute::resident(AttrType::Data, "", vec![1; 8]))
        .unwrap();
    vol.resize_attribute_value(loc, 200).unwrap();
    assert_eq!(200, vol.attribute(loc).unwrap().value_len());
    assert!(matches!(
        vol.resize_attribute_value(loc, 2000),
        Err(Error::OutOfSpace)
    ));
    assert_eq!(200, vol.attribute(loc).unwrap().value_len());

    let mut buf = [0u8; 4];
    vol.read_attribute(loc, 6, &mut buf).unwrap();
    assert_eq!([1, 1, 0, 0], buf);
}

#[test]
fn non_resident_io_spans_runs() {
    let mut vol = small_volume();
    let base = vol.create_record().unwrap();
    // Fragment the free space so the attribute gets two runs
    let hole = vol.allocate_runs(1, 0).unwrap();
    let _keep = vol.allocate_runs(1, 0).unwrap();
    vol.free_runs(&hole);

    let loc = vol
        .add_attribute(base, Attribute::non_resident(AttrType::Data, "stream"))
        .unwrap();
    vol.set_allocated_clusters(loc, 3).unwrap();
    vol.set_data_size(loc, 1536).unwrap();
    match &vol.attribute(loc).unwrap().value {
        AttrValue::NonResident(nr) => {
            assert_eq!(2, nr.runs.len());
            assert_eq!(3, nr.allocated_clusters());
        }
        _ => panic!("resident"),
    }
    assert_eq!(60, vol.free_clusters());

    let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
    vol.write_attribute(loc, 300, &data).unwrap();
    let mut back = vec![0u8; 1000];
    vol.read_attribute(loc, 300, &mut back).unwrap();
    assert_eq!(data, back);

    assert!(vol.write_attribute(loc, 1500, &[0; 100]).is_err());

    vol.set_allocated_clusters(loc, 1).unwrap();
    assert_eq!(62, vol.free_clusters());
    assert_eq!(512, vol.attribute(loc).unwrap().value_len());
}

#[test]
fn volume_runs_out_of_clusters() {
    let mut vol = small_volume();
    let base = vol.create_record().unwrap();
    let loc = vol
        .add_attribute(base, Attribute::non_resident(AttrType::Data, ""))
        .unwrap();
    assert!(matches!(
        vol.set_allocated_clusters(loc, 65),
        Err(Error::OutOfSpace)
    ));
    assert_eq!(64, vol.free_clusters());
    vol.set_allocated_clusters(loc, 64).unwrap();
    assert_eq!(0, vol.free_clusters());
}

#[test]
fn make_non_resident_keeps_value() {
    let mut vol = small_volume();
    let base = vol.create_record().unwrap();
    let loc = vol
        .add_attribute(base, Attribute::resident(AttrType::Bitmap, "$I30", vec![0x0f; 8]))
        .unwrap();
    vol.make_non_resident(loc).unwrap();
    assert!(!vol.attribute(loc).unwrap().is_resident());
    let mut buf = [0u8; 8];
    vol.read_attribute(loc, 0, &mut buf).unwrap();
    assert_eq!([0x0f; 8], buf);
}

#[test]
fn pages_write_through_on_dirty_unmap() {
    let mut vol = small_volume();
    let base = vol.create_record().unwrap();
    let loc = vol
        .add_attribute(
            base,
            Attribute::non_resident(AttrType::IndexAllocation, "$I30"),
        )
        .unwrap();
    vol.set_allocated_clusters(loc, 2).unwrap();
    vol.set_data_size(loc, 1024).unwrap();

    let key = PageKey {
        record: base,
        ty: AttrType::IndexAllocation,
        name: "$I30".to_string(),
        index: 0,
    };
    vol.map_page(&key).unwrap();
    vol.page_mut(&key).unwrap()[700] = 42;
    vol.unmap_page(&key, true).unwrap();
    assert!(vol.page(&key).is_err());

    let mut b = [0u8; 1];
    vol.read_attribute(loc, 700, &mut b).unwrap();
    assert_eq!(42, b[0]);

    // A clean unmap leaves the device alone
    vol.map_page(&key).unwrap();
    vol.page_mut(&key).unwrap()[700] = 7;
    vol.unmap_page(&key, false).unwrap();
    vol.read_attribute(loc, 700, &mut b).unwrap();
    assert_eq!(42, b[0]);
}

#[test]
fn make_space_moves_largest_attributes() {
    let mut vol = small_volume();
    let base = vol.create_record().unwrap();
    filler(&mut vol, base, "a", 100);
    filler(&mut vol, base, "b", 400);
    filler(&mut vol, base, "c", 200);
    let free = vol.record_free(base).unwrap();

    let log = vol
        .make_space(base, base, free + 200, &[(AttrType::Data, "b")])
        .unwrap();
    assert!(!log.is_empty());
    assert!(vol.record_free(base).unwrap() >= free + 200);
    assert!(vol.record(base).unwrap().find(AttrType::Data, "b").is_some());
    assert!(vol.record(base).unwrap().find(AttrType::Data, "c").is_none());

    // Moved attributes are still found through the attribute list
    let c = vol.find_attribute(base, AttrType::Data, "c").unwrap().unwrap();
    assert_ne!(base, c.record);
    assert_eq!(200, vol.attribute(c).unwrap().value_len());
    let list = vol.attribute_list(base).unwrap();
    assert!(list.iter().any(|e| e.name == "c" && e.record == c.record));

    vol.undo_moves(base, log).unwrap();
    assert_eq!(free, vol.record_free(base).unwrap());
    assert!(!vol.has_attribute_list(base).unwrap());
    assert!(vol.extension_records(base).is_empty());
}

#[test]
fn make_space_fails_without_candidates() {
    let mut vol = small_volume();
    let base = vol.create_record().unwrap();
    filler(&mut vol, base, "a", 100);
    assert!(matches!(
        vol.make_space(base, base, 1000, &[(AttrType::Data, "a")]),
        Err(Error::OutOfSpace)
    ));
    assert!(vol.extension_records(base).is_empty());
}

#[test]
fn removing_attributes_updates_the_list() {
    let mut vol = small_volume();
    let base = vol.create_record().unwrap();
    filler(&mut vol, base, "a", 300);
    let log = vol.move_to_extension(base, AttrType::Data, "a").unwrap();
    assert_eq!(1, log.moved());
    let ext = vol.extension_records(base)[0];

    vol.remove_attribute(base, AttrType::Data, "a").unwrap();
    assert!(vol.find_attribute(base, AttrType::Data, "a").unwrap().is_none());
    assert!(vol.record(ext).is_err());
    assert!(!vol
        .attribute_list(base)
        .unwrap()
        .iter()
        .any(|e| e.ty == AttrType::Data));
}

#[test]
fn temporary_file_backing() {
    let mut vol = Volume::with_temporary_file(VolumeConfig::default().clusters(16)).unwrap();
    let base = vol.create_record().unwrap();
    let loc = vol
        .add_attribute(base, Attribute::non_resident(AttrType::Data, ""))
        .unwrap();
    vol.set_allocated_clusters(loc, 1).unwrap();
    vol.set_data_size(loc, 10).unwrap();
    vol.write_attribute(loc, 0, b"persistent").unwrap();
    let mut buf = [0u8; 10];
    vol.read_attribute(loc, 0, &mut buf).unwrap();
    assert_eq!(b"persistent", &buf);
    vol.sync();
    assert!(!vol.record(base).unwrap().is_dirty());
}
