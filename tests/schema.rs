use bundledb::{
    BundleDb, BundleError, ChangeLog, Config, Name, NodeId, NodePropBundle, Result,
};
use tempfile::TempDir;

fn config_with_prefix(dir: &TempDir, prefix: &str) -> Config {
    let mut config = Config::new(
        dir.path().join("workspace"),
        dir.path().join("repo.db").to_string_lossy().to_string(),
    );
    config.schema_object_prefix = prefix.into();
    config
}

fn table_exists(dir: &TempDir, table: &str) -> bool {
    let conn = rusqlite::Connection::open(dir.path().join("repo.db")).unwrap();
    conn.query_row(
        "select name from sqlite_master where type = 'table' and name = ?1",
        [table],
        |_| Ok(()),
    )
    .is_ok()
}

#[test]
fn prefix_is_uppercased_and_escaped() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let db = BundleDb::init(config_with_prefix(&dir, "a-b"))?;

    assert!(table_exists(&dir, "A_x002d_BBUNDLE"));
    assert!(table_exists(&dir, "A_x002d_BREFS"));
    assert!(table_exists(&dir, "A_x002d_BBINVAL"));

    // the engine operates against the escaped names
    let ns = db.ns_index().index("")?;
    let nt = db.name_index().index("node")?;
    let id = NodeId::from_halves(1, 1);
    let mut log = ChangeLog::default();
    log.added(NodePropBundle::new(id, Name::new(ns, nt)));
    db.store(&log)?;
    assert!(db.exists_bundle(id)?);
    Ok(())
}

#[test]
fn unknown_schema_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_with_prefix(&dir, "");
    config.schema = "oracle".into();
    assert!(matches!(
        BundleDb::init(config),
        Err(BundleError::Schema(_))
    ));
}

#[test]
fn double_init_on_one_workspace_is_refused() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let first = BundleDb::init(config_with_prefix(&dir, ""))?;
    assert!(matches!(
        BundleDb::init(config_with_prefix(&dir, "")),
        Err(BundleError::AlreadyInitialized)
    ));
    first.close()?;
    let second = BundleDb::init(config_with_prefix(&dir, ""))?;
    second.close()?;
    Ok(())
}

#[test]
fn bootstrap_is_idempotent_across_reopens() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let id = NodeId::from_halves(2, 2);
    {
        let db = BundleDb::init(config_with_prefix(&dir, "WS1_"))?;
        let ns = db.ns_index().index("")?;
        let nt = db.name_index().index("node")?;
        let mut log = ChangeLog::default();
        log.added(NodePropBundle::new(id, Name::new(ns, nt)));
        db.store(&log)?;
        db.close()?;
    }
    {
        // second init sees the tables and must not re-run the DDL
        let db = BundleDb::init(config_with_prefix(&dir, "WS1_"))?;
        assert!(db.exists_bundle(id)?);
    }
    Ok(())
}
