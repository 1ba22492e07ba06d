use bundledb::{
    BundleDb, BundleError, ChangeLog, Config, Name, NodeId, NodePropBundle, NodeReferences,
    PropertyEntry, PropertyValue, Result,
};
use tempfile::TempDir;

fn open_engine(dir: &TempDir) -> Result<BundleDb> {
    let config = Config::new(
        dir.path().join("workspace"),
        dir.path().join("repo.db").to_string_lossy().to_string(),
    );
    BundleDb::init(config)
}

fn simple_bundle(db: &BundleDb, id: NodeId) -> Result<NodePropBundle> {
    let ns = db.ns_index().index("")?;
    let nt = db.name_index().index("node")?;
    Ok(NodePropBundle::new(id, Name::new(ns, nt)))
}

#[test]
fn failed_change_log_leaves_no_trace() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open_engine(&dir)?;

    let id1 = NodeId::from_halves(1, 1);
    let id2 = NodeId::from_halves(1, 2);

    let b1 = simple_bundle(&db, id1)?;
    // marked modified, but no row exists - the second write must fail
    let mut b2 = simple_bundle(&db, id2)?;
    b2.mark_old();

    let mut log = ChangeLog::default();
    log.added(b1).modified(b2);
    let err = db.store(&log).unwrap_err();
    assert!(matches!(err, BundleError::NoSuchItem(_)));

    assert!(!db.exists_bundle(id1)?);
    assert!(!db.exists_bundle(id2)?);
    Ok(())
}

#[test]
fn duplicate_insert_rolls_back_the_whole_log() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open_engine(&dir)?;

    let id1 = NodeId::from_halves(2, 1);
    let id2 = NodeId::from_halves(2, 2);
    let mut log = ChangeLog::default();
    log.added(simple_bundle(&db, id2)?);
    db.store(&log)?;

    // second insert collides with the existing row
    let mut log = ChangeLog::default();
    log.added(simple_bundle(&db, id1)?)
        .added(simple_bundle(&db, id2)?);
    let err = db.store(&log).unwrap_err();
    assert!(matches!(err, BundleError::Store(_)));

    assert!(!db.exists_bundle(id1)?);
    assert!(db.exists_bundle(id2)?);
    Ok(())
}

#[test]
fn change_log_applies_its_net_effect() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open_engine(&dir)?;
    let ns = db.ns_index().index("")?;
    let prop = db.name_index().index("n")?;

    let id1 = NodeId::from_halves(3, 1);
    let id2 = NodeId::from_halves(3, 2);
    let target = NodeId::from_halves(3, 9);

    let mut b1 = simple_bundle(&db, id1)?;
    b1.put_property(PropertyEntry::single(
        Name::new(ns, prop),
        PropertyValue::Long(1),
    ));
    let b2 = simple_bundle(&db, id2)?;
    let mut refs = NodeReferences::new(target);
    refs.add(format!("{id1}.{ns}.{prop}"));

    let mut log = ChangeLog::default();
    log.added(b1.clone()).added(b2.clone()).modified_refs(refs.clone());
    db.store(&log)?;

    assert!(db.exists_bundle(id1)?);
    assert!(db.exists_bundle(id2)?);
    assert_eq!(db.load_references(target)?, refs);

    // second log: delete b1, rewrite b2, empty the reference set
    let mut b2 = db.load_bundle(id2)?.expect("bundle present");
    b2.put_property(PropertyEntry::single(
        Name::new(ns, prop),
        PropertyValue::Long(2),
    ));
    let mut log = ChangeLog::default();
    log.deleted(b1)
        .modified(b2.clone())
        .modified_refs(NodeReferences::new(target));
    db.store(&log)?;

    assert!(!db.exists_bundle(id1)?);
    assert_eq!(db.load_bundle(id2)?.expect("bundle present"), b2);
    assert!(!db.exists_references(target)?);
    assert!(matches!(
        db.load_references(target),
        Err(BundleError::NoSuchItem(_))
    ));
    Ok(())
}

#[test]
fn reference_sets_update_in_place() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open_engine(&dir)?;

    let target = NodeId::from_halves(4, 1);
    let mut refs = NodeReferences::new(target);
    refs.add("00000000-0000-0000-0000-000000000001.1.2");
    db.store_references(&refs)?;
    assert!(db.exists_references(target)?);

    refs.add("00000000-0000-0000-0000-000000000002.1.2");
    refs.remove("00000000-0000-0000-0000-000000000001.1.2");
    db.store_references(&refs)?;

    let loaded = db.load_references(target)?;
    assert_eq!(loaded, refs);
    assert_eq!(loaded.references.len(), 1);

    db.destroy_references(target)?;
    assert!(!db.exists_references(target)?);
    Ok(())
}

#[test]
fn deletions_apply_before_insertions() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = open_engine(&dir)?;

    // replace a bundle by deleting and re-adding it in one log; the
    // delete-first ordering makes the insert legal again
    let id = NodeId::from_halves(5, 1);
    let mut log = ChangeLog::default();
    log.added(simple_bundle(&db, id)?);
    db.store(&log)?;

    let old = db.load_bundle(id)?.expect("bundle present");
    let mut replacement = simple_bundle(&db, id)?;
    replacement.referenceable = true;
    let mut log = ChangeLog::default();
    log.deleted(old).added(replacement.clone());
    db.store(&log)?;

    assert_eq!(db.load_bundle(id)?.expect("bundle present"), replacement);
    Ok(())
}
