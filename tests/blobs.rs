use bundledb::{
    BinaryValue, BundleDb, ChangeLog, Config, Name, NodeId, NodePropBundle, PropertyEntry,
    PropertyValue, Result,
};
use tempfile::TempDir;

fn open_engine(dir: &TempDir, external_blobs: bool) -> Result<BundleDb> {
    let mut config = Config::new(
        dir.path().join("workspace"),
        dir.path().join("repo.db").to_string_lossy().to_string(),
    );
    config.min_blob_size = 16;
    config.external_blobs = external_blobs;
    BundleDb::init(config)
}

fn binary_bundle(db: &BundleDb, id: NodeId, data: Vec<u8>) -> Result<NodePropBundle> {
    let ns = db.ns_index().index("")?;
    let nt = db.name_index().index("file")?;
    let prop = db.name_index().index("data")?;
    let mut bundle = NodePropBundle::new(id, Name::new(ns, nt));
    bundle.put_property(PropertyEntry::single(
        Name::new(ns, prop),
        PropertyValue::Binary(BinaryValue::Inline(data)),
    ));
    Ok(bundle)
}

fn binval_rows(dir: &TempDir) -> usize {
    let conn = rusqlite::Connection::open(dir.path().join("repo.db")).unwrap();
    conn.query_row("select count(*) from BINVAL", [], |row| row.get::<_, i64>(0))
        .unwrap() as usize
}

#[test]
fn large_binary_is_externalized_to_binval() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open_engine(&dir, false)?;

    let id = NodeId::from_halves(1, 1);
    let bundle = binary_bundle(&db, id, vec![0xaa; 32])?;
    let mut log = ChangeLog::default();
    log.added(bundle);
    db.store(&log)?;

    assert_eq!(binval_rows(&dir), 1);

    let loaded = db.load_bundle(id)?.expect("bundle present");
    let entry = &loaded.properties[0];
    let PropertyValue::Binary(BinaryValue::External(blob_id)) = &entry.values[0] else {
        panic!("expected the value to reference a blob");
    };
    let data = db.blob_store().get(blob_id)?.read_to_vec()?;
    assert_eq!(data, vec![0xaa; 32]);
    Ok(())
}

#[test]
fn small_binary_stays_in_the_bundle() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open_engine(&dir, false)?;

    let id = NodeId::from_halves(1, 2);
    let bundle = binary_bundle(&db, id, vec![0x5a; 15])?;
    let mut log = ChangeLog::default();
    log.added(bundle);
    db.store(&log)?;

    assert_eq!(binval_rows(&dir), 0);

    let loaded = db.load_bundle(id)?.expect("bundle present");
    assert_eq!(
        loaded.properties[0].values[0],
        PropertyValue::Binary(BinaryValue::Inline(vec![0x5a; 15]))
    );
    Ok(())
}

#[test]
fn destroying_a_bundle_removes_its_blobs() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open_engine(&dir, false)?;

    let id = NodeId::from_halves(2, 1);
    let bundle = binary_bundle(&db, id, vec![0x11; 64])?;
    let mut log = ChangeLog::default();
    log.added(bundle);
    db.store(&log)?;
    assert_eq!(binval_rows(&dir), 1);

    let loaded = db.load_bundle(id)?.expect("bundle present");
    let mut log = ChangeLog::default();
    log.deleted(loaded);
    db.store(&log)?;

    assert!(!db.exists_bundle(id)?);
    assert_eq!(binval_rows(&dir), 0);
    Ok(())
}

#[test]
fn filesystem_backend_round_trips() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open_engine(&dir, true)?;

    let id = NodeId::from_halves(3, 1);
    let bundle = binary_bundle(&db, id, vec![0xcc; 100])?;
    let mut log = ChangeLog::default();
    log.added(bundle);
    db.store(&log)?;

    // external blobs land under the workspace, not in the database
    let blob_root = dir.path().join("workspace").join("blobs");
    assert!(blob_root.exists());
    let conn = rusqlite::Connection::open(dir.path().join("repo.db")).unwrap();
    let binval: Option<String> = conn
        .query_row(
            "select name from sqlite_master where type = 'table' and name = 'BINVAL'",
            [],
            |row| row.get(0),
        )
        .ok();
    assert!(binval.is_none());

    let loaded = db.load_bundle(id)?.expect("bundle present");
    let PropertyValue::Binary(BinaryValue::External(blob_id)) = &loaded.properties[0].values[0]
    else {
        panic!("expected the value to reference a blob");
    };
    let data = db.blob_store().get(blob_id)?.read_to_vec()?;
    assert_eq!(data, vec![0xcc; 100]);
    let blob_id = blob_id.clone();

    let mut log = ChangeLog::default();
    log.deleted(loaded);
    db.store(&log)?;
    assert!(db.blob_store().get(&blob_id).is_err());
    Ok(())
}

#[test]
fn blob_ids_follow_property_identity() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open_engine(&dir, false)?;

    let id = NodeId::from_halves(4, 1);
    let bundle = binary_bundle(&db, id, vec![0xee; 32])?;
    let name = bundle.properties[0].name;
    let mut log = ChangeLog::default();
    log.added(bundle);
    db.store(&log)?;

    let loaded = db.load_bundle(id)?.expect("bundle present");
    let PropertyValue::Binary(BinaryValue::External(blob_id)) = &loaded.properties[0].values[0]
    else {
        panic!("expected the value to reference a blob");
    };
    assert_eq!(
        blob_id,
        &format!("{}.{}.{}.0", id, name.namespace, name.local)
    );
    Ok(())
}
