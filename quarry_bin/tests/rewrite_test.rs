mod common;

use common::{ids, open_db, page_keys, tagged, tagged_schema};
use quarry::{Column, Record, Schema, Value};
use quarry_bin::{StorageError, Table};

fn people(t: &common::TestDb) -> Table {
    let schema = Schema::new(
        vec![Column::int("id"), Column::char_var("name", 16), Column::int("age")],
        0,
    )
    .unwrap();
    let table = t.db.create_table("people", schema).unwrap();
    for (id, name, age) in [(1, "ann", 31), (2, "bob", 25), (3, "cy", 40)] {
        table
            .insert(Record::new(vec![Value::Int(id), Value::from(name), Value::Int(age)]))
            .unwrap();
    }
    table
}

fn temp_tables(t: &common::TestDb) -> usize {
    t.db
        .tables()
        .iter()
        .filter(|(_, name)| name.starts_with('#'))
        .count()
}

#[test]
fn test_alter_add_uses_default() {
    for index_mode in [false, true] {
        let t = open_db(128, index_mode);
        let mut table = people(&t);
        table
            .alter_add(Column::double("score").with_default(0.0))
            .unwrap();

        let schema = table.schema().unwrap();
        assert_eq!(schema.len(), 4);
        assert!(schema.columns()[3].nullable);
        for record in table.scan().unwrap() {
            assert_eq!(record.values[3], Value::Double(0.0));
        }
        assert_eq!(table.name().unwrap(), "people");
        assert_eq!(t.db.table("people").unwrap().id(), table.id());
        assert_eq!(temp_tables(&t), 0);
        if index_mode {
            assert_eq!(table.index().unwrap().unwrap().entries().unwrap().len(), 3);
        }
    }
}

#[test]
fn test_alter_errors() {
    let t = open_db(128, false);
    let mut table = people(&t);
    assert!(matches!(
        table.alter_add(Column::int("age")),
        Err(StorageError::ColumnExists(_))
    ));
    assert!(matches!(
        table.alter_drop("id"),
        Err(StorageError::PrimaryKeyColumn(_))
    ));
    assert!(matches!(
        table.alter_drop("height"),
        Err(StorageError::ColumnNotFound(_))
    ));

    table.alter_drop("name").unwrap();
    let schema = table.schema().unwrap();
    assert_eq!(schema.len(), 2);
    assert_eq!(schema.columns()[1].name, "age");
    assert_eq!(
        table.get(&Value::Int(2)).unwrap(),
        Some(Record::new(vec![Value::Int(2), Value::Int(25)]))
    );
}

#[test]
fn test_too_many_columns() {
    let t = open_db(4096, false);
    let columns = (0..32).map(|i| Column::int(format!("c{i}"))).collect();
    let mut table = t.db.create_table("wide", Schema::new(columns, 0).unwrap()).unwrap();
    assert!(matches!(
        table.alter_add(Column::int("c32")),
        Err(StorageError::TooManyColumns)
    ));
}

#[test]
fn test_delete_matching() {
    let t = open_db(64, false);
    let mut table = t.db.create_table("t", tagged_schema()).unwrap();
    for id in 0..20 {
        table.insert(tagged(id)).unwrap();
    }
    let old_id = table.id();
    let removed = table
        .delete_matching(|r| r.values[0].as_int().is_some_and(|id| id >= 10))
        .unwrap();
    assert_eq!(removed, 10);
    assert_ne!(table.id(), old_id);
    assert_eq!(ids(&table.scan().unwrap()), (0..10).collect::<Vec<_>>());
    assert_eq!(temp_tables(&t), 0);

    let unchanged_id = table.id();
    assert_eq!(table.delete_matching(|_| false).unwrap(), 0);
    assert_eq!(table.id(), unchanged_id);
    assert_eq!(temp_tables(&t), 0);
}

#[test]
fn test_update_matching() {
    for index_mode in [false, true] {
        let t = open_db(128, index_mode);
        let mut table = people(&t);
        let updated = table
            .update_matching(
                |r| r.values[2].as_int().is_some_and(|age| age > 30),
                |r| r.values[2] = Value::Int(0),
            )
            .unwrap();
        assert_eq!(updated, 2);
        let ages: Vec<Value> = table.scan().unwrap().into_iter().map(|r| r.values[2].clone()).collect();
        assert_eq!(ages, vec![Value::Int(0), Value::Int(25), Value::Int(0)]);

        // Moving a key onto another one is rejected and changes nothing.
        let before = table.scan().unwrap();
        let err = table
            .update_matching(|r| r.values[0] == Value::Int(3), |r| r.values[0] = Value::Int(1))
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateKey(Value::Int(1))));
        assert_eq!(table.scan().unwrap(), before);
        assert_eq!(temp_tables(&t), 0);

        // Moving a key to a free value reorders the table.
        table
            .update_matching(|r| r.values[0] == Value::Int(1), |r| r.values[0] = Value::Int(9))
            .unwrap();
        assert_eq!(ids(&table.scan().unwrap()), vec![2, 3, 9]);
        assert!(table.get(&Value::Int(9)).unwrap().is_some());
    }
}

#[test]
fn test_derived_tables() {
    let t = open_db(128, false);
    let table = people(&t);

    let adults = table
        .to_filtered(|r| r.values[2].as_int().is_some_and(|age| age >= 30))
        .unwrap();
    assert_eq!(ids(&adults.scan().unwrap()), vec![1, 3]);
    assert!(adults.schema().unwrap().columns().iter().all(|c| c.nullable));
    adults
        .append(Record::new(vec![Value::Int(0), Value::from("zed"), Value::Int(50)]))
        .unwrap();
    assert_eq!(ids(&adults.scan().unwrap()), vec![1, 3, 0]);

    // Selected columns keep table order and repeats collapse.
    let names = table.to_selected(&[2, 0, 2]).unwrap();
    let schema = names.schema().unwrap();
    let columns: Vec<&str> = schema.columns().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(columns, vec!["id", "age"]);
    assert_eq!(
        names.scan().unwrap()[0],
        Record::new(vec![Value::Int(1), Value::Int(31)])
    );
    assert!(matches!(
        table.to_selected(&[5]),
        Err(StorageError::ColumnNotFound(_))
    ));

    assert_eq!(temp_tables(&t), 2);
    drop(adults);
    drop(names);
    assert_eq!(temp_tables(&t), 0);
}

#[test]
fn test_merge() {
    let t = open_db(256, false);
    let a = people(&t);
    let pets_schema = Schema::new(vec![Column::int("id"), Column::char_fixed("kind", 4)], 0).unwrap();
    let b = t.db.create_table("pets", pets_schema).unwrap();
    for (id, kind) in [(10, "cat"), (11, "dog")] {
        b.insert(Record::new(vec![Value::Int(id), Value::from(kind)])).unwrap();
    }

    let merged = Table::merge(&a, &b).unwrap();
    let schema = merged.schema().unwrap();
    let names: Vec<&str> = schema.columns().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["people.id", "people.name", "people.age", "pets.id", "pets.kind"]);
    let rows = merged.scan().unwrap();
    assert_eq!(rows.len(), 6);
    assert_eq!(
        rows[1],
        Record::new(vec![
            Value::Int(1),
            Value::from("ann"),
            Value::Int(31),
            Value::Int(11),
            Value::from("dog"),
        ])
    );

    let tags = t.db.create_table("tags", tagged_schema()).unwrap();
    tags.insert(tagged(7)).unwrap();
    let triple = Table::merge_n(&[&a, &b, &tags]).unwrap();
    let schema = triple.schema().unwrap();
    assert_eq!(schema.len(), 7);
    assert_eq!(schema.columns()[5].name, "tags.id");
    assert_eq!(triple.len().unwrap(), 6);

    let single = Table::merge_n(&[&a]).unwrap();
    assert_eq!(single.scan().unwrap(), a.scan().unwrap());
    assert!(matches!(Table::merge_n(&[]), Err(StorageError::InvalidSchema(_))));

    let kept = merged.persist("people_pets").unwrap();
    drop(triple);
    drop(single);
    let names: Vec<String> = t.db.tables().into_iter().map(|(_, n)| n).collect();
    assert_eq!(names, vec!["people", "pets", "people_pets", "tags"]);
    assert_eq!(t.db.table("people_pets").unwrap().id(), kept.id());
}

#[test]
fn test_drop_table_removes_storage() {
    let t = open_db(64, true);
    let table = t.db.create_table("t", tagged_schema()).unwrap();
    for id in 0..12 {
        table.insert(tagged(id)).unwrap();
    }
    assert!(page_keys(&t.db, &table).len() > 1);
    t.db.drop_table("t").unwrap();
    assert!(matches!(t.db.table("t"), Err(StorageError::TableNotFound(_))));
    assert!(matches!(table.pages(), Err(StorageError::TableNotFound(_))));
}

#[test]
fn test_temp_names_are_reserved() {
    let t = open_db(128, false);
    assert!(matches!(
        t.db.create_table("#tmp1", tagged_schema()),
        Err(StorageError::InvalidName(_))
    ));
    let mut table = people(&t);
    assert!(matches!(
        t.db.rename_table("people", "#tmp2"),
        Err(StorageError::InvalidName(_))
    ));

    let young = table
        .to_filtered(|r| r.values[2].as_int().is_some_and(|age| age < 30))
        .unwrap();
    assert!(matches!(young.persist("#young"), Err(StorageError::InvalidName(_))));
    assert_eq!(temp_tables(&t), 0);

    assert_eq!(table.delete_matching(|r| r.values[0] == Value::Int(1)).unwrap(), 1);
    assert_eq!(ids(&table.scan().unwrap()), vec![2, 3]);
}

#[test]
fn test_rebuild_leaves_other_handles_stale() {
    let t = open_db(128, true);
    let mut table = people(&t);
    let other = table.clone();
    let old_id = table.id();

    table.alter_drop("age").unwrap();
    assert_ne!(table.id(), old_id);
    assert!(matches!(other.scan(), Err(StorageError::TableNotFound(_))));

    let reopened = t.db.table("people").unwrap();
    assert_eq!(reopened.id(), table.id());
    assert_eq!(reopened.schema().unwrap().len(), 2);
    assert_eq!(ids(&reopened.scan().unwrap()), vec![1, 2, 3]);
}
