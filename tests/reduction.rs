use hemofit::prelude::*;
use hemofit::structs::weights::Weights;
use rusqlite::types::Value;

fn point(id: i64, sys: f64, dia: f64, sv: f64) -> Row {
    Row::new()
        .with("id", id)
        .with("sys", sys)
        .with("sys_target", 100.0)
        .with("dia", dia)
        .with("dia_target", 50.0)
        .with("sv", sv)
        .with("generic_params.period", 0.8)
        .with("ecg.t1", 0.05)
        .with("ecg.t2", 0.2)
        .with("ecg.t3", 0.4)
        .with("ecg.t4", 0.5)
}

fn settings(dir: &tempfile::TempDir) -> Settings {
    let mut settings = Settings::default();
    settings.store.path = dir.path().join("reduce.db").display().to_string();
    settings.store.max_tries = 5;
    settings
}

#[test]
fn test_weights_follow_inverse_loss() {
    let weights = Weights::from_losses(&[0.02, 0.04, 0.08]).unwrap();
    let expected = [0.573, 0.286, 0.141];
    for (w, e) in weights.iter().zip(expected) {
        assert!((w - e).abs() < 1e-3, "{} != {}", w, e);
    }
    assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-12);
}

#[test]
fn test_reduce_writes_one_row_per_subject() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(&dir);
    let store = settings.store.open();

    // Subject 1 has losses 0.02, 0.04 and 0.08 against sys/dia = 100/50
    let points = vec![
        point(1, 101.0, 50.5, 70.0),
        point(1, 102.0, 51.0, 80.0),
        point(1, 104.0, 52.0, 90.0),
        point(2, 110.0, 50.0, 60.0),
        point(2, 90.0, 50.0, 65.0),
    ];
    store
        .write(&settings.reduction.table, &points, WriteMode::Append)
        .unwrap();

    let written = hemofit::reduce(settings.clone(), Partition::default()).unwrap();
    assert_eq!(written, 2);

    let rows = store
        .select(Query::new(format!(
            "SELECT * FROM {} ORDER BY id",
            settings.reduction.output_table
        )))
        .unwrap();
    assert_eq!(rows.len(), 2);

    let first = &rows[0];
    let sv = first.get_f64("sv").unwrap();
    assert!((sv - (4.0 * 70.0 + 2.0 * 80.0 + 90.0) / 7.0).abs() < 1e-9);
    assert_eq!(first.get_f64("sys_target"), Some(100.0));
    assert_eq!(first.get_f64("ecg.t3"), Some(0.4));

    // Equal losses split the weight evenly
    let second = &rows[1];
    assert_eq!(second.get("id"), Some(&Value::Integer(2)));
    assert!((second.get_f64("sv").unwrap() - 62.5).abs() < 1e-9);
    assert!((second.get_f64("sys").unwrap() - 100.0).abs() < 1e-9);
}

#[test]
fn test_unusable_subject_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(&dir);
    let store = settings.store.open();

    let points = vec![
        point(1, 101.0, 50.5, 70.0),
        point(2, 101.0, 50.5, 70.0).with("sys_target", 0.0),
        point(3, 101.0, 50.5, 70.0).with("sv", Value::Null),
    ];
    store
        .write(&settings.reduction.table, &points, WriteMode::Append)
        .unwrap();

    let written = hemofit::reduce(settings.clone(), Partition::default()).unwrap();
    assert_eq!(written, 1);
}

#[test]
fn test_missing_columns_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(&dir);
    let store = settings.store.open();
    store
        .write(
            &settings.reduction.table,
            &[Row::new().with("id", 1i64).with("sys", 100.0)],
            WriteMode::Append,
        )
        .unwrap();

    let err = hemofit::reduce(settings, Partition::default()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FitError>(),
        Some(FitError::Config(_))
    ));
}
