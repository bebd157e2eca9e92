//! Partition and migration planning without a database

use chrono::Utc;
use tenant_forge::error::TenantForgeError;
use tenant_forge::migration::{parse_migration, plan};
use tenant_forge::partition::plan::initial_partitions;
use tenant_forge::partition::{PartitionBounds, PartitionStrategy};

#[test]
fn test_hash_partitions_cover_every_remainder() {
    let specs = initial_partitions("t", &PartitionStrategy::Hash { partitions: 4 }, Utc::now()).unwrap();
    assert_eq!(specs.len(), 4);

    let pairs: Vec<(u32, u32)> = specs
        .iter()
        .map(|s| match s.bounds {
            PartitionBounds::Hash { modulus, remainder } => (modulus, remainder),
            ref other => panic!("unexpected bounds {:?}", other),
        })
        .collect();
    assert_eq!(pairs, vec![(4, 0), (4, 1), (4, 2), (4, 3)]);

    let sql = specs[2].create_sql("module_vendas", "t").unwrap();
    assert!(sql.contains("FOR VALUES WITH (MODULUS 4, REMAINDER 2)"));
}

#[test]
fn test_dependency_cycle_is_rejected() {
    let a = parse_migration("vendas", "001_a.sql", "-- depends: 002\nCREATE TABLE a (id INT);").unwrap();
    let b = parse_migration("vendas", "002_b.sql", "-- depends: 001\nCREATE TABLE b (id INT);").unwrap();

    let err = plan::detect_cycle("vendas", &[a, b]).unwrap_err();
    assert!(matches!(err, TenantForgeError::MigrationDependencyCycle { .. }));
}

#[test]
fn test_dependencies_override_version_order() {
    let first = parse_migration("vendas", "001_first.sql", "-- depends: 002\nSELECT 1;").unwrap();
    let second = parse_migration("vendas", "002_second.sql", "SELECT 2;").unwrap();

    let ordered = plan::order("vendas", vec![first, second], &Default::default()).unwrap();
    let versions: Vec<&str> = ordered.iter().map(|m| m.version.as_str()).collect();
    assert_eq!(versions, vec!["002", "001"]);
}

#[test]
fn test_registration_is_idempotent_until_applied() {
    use tenant_forge::migration::{MigrationStatus, Reconcile};

    let migration = parse_migration("vendas", "001_init.sql", "CREATE TABLE c (id INT);").unwrap();
    let same = migration.checksum.clone();
    assert_eq!(
        plan::reconcile(Some((&same, MigrationStatus::Applied)), &migration).unwrap(),
        Reconcile::Unchanged
    );
    assert_eq!(
        plan::reconcile(Some(("other", MigrationStatus::Pending)), &migration).unwrap(),
        Reconcile::Replace
    );
    assert!(matches!(
        plan::reconcile(Some(("other", MigrationStatus::Applied)), &migration),
        Err(TenantForgeError::MigrationChecksumMismatch { .. })
    ));
}
