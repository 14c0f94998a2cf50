use hemofit::prelude::*;
use hemofit::routines::optimization::REJECTED_LOSS;
use rusqlite::types::Value;
use serde_json::json;

/// Inputs on a coarse grid so a fit stays fast
fn coarse() -> ModelInputs {
    let mut inputs = ModelInputs::default();
    inputs.generic_params.nstep = 400;
    inputs.generic_params.ncycle = 8;
    inputs.generic_params.max_step = 1e-3;
    inputs
}

fn blood_pressure_spec(optimizer: Optimizer, objective: Objective) -> OptimizationSpec {
    OptimizationSpec {
        inputs: coarse(),
        free: vec![
            FreeParameter::new("generic_params.r_scale", 0.1, 10.0, 1.0),
            FreeParameter::new("generic_params.c_scale", 0.1, 10.0, 1.0),
        ],
        targets: vec![
            Target::new(Metric::Systolic, 120.0),
            Target::new(Metric::Diastolic, 80.0),
        ],
        budget: 200,
        workers: 1,
        objective,
        tol: 1e-4,
        optimizer,
        seed: 347,
    }
}

#[test]
fn test_nelder_mead_reaches_blood_pressure_targets() {
    let spec = blood_pressure_spec(Optimizer::NelderMead, Objective::Single);
    let outcome = Driver::new(&LumpedModel).run(&spec).unwrap();
    let best = outcome.best();

    assert_eq!(outcome.len(), 1);
    assert!(
        (best.metrics.sys - 120.0).abs() / 120.0 < 0.05,
        "systolic {}",
        best.metrics.sys
    );
    assert!(
        (best.metrics.dia - 80.0).abs() / 80.0 < 0.05,
        "diastolic {}",
        best.metrics.dia
    );
    for (path, value) in &best.values {
        assert!((0.1..=10.0).contains(value), "{} = {}", path, value);
        assert_eq!(best.inputs.get(path), Some(*value));
    }
}

#[test]
fn test_pareto_set_is_sorted_by_loss() {
    let mut spec = blood_pressure_spec(Optimizer::DifferentialEvolution, Objective::Multi);
    spec.budget = 80;
    spec.workers = 2;
    let outcome = Driver::new(&LumpedModel).run(&spec).unwrap();

    assert!(!outcome.is_empty());
    let set = outcome.recommendations();
    for (i, r) in set.iter().enumerate() {
        assert_eq!(r.pareto_index, i);
        assert!(r.loss < REJECTED_LOSS);
    }
    for pair in set.windows(2) {
        assert!(pair[0].loss <= pair[1].loss);
    }
    assert_eq!(outcome.best().loss, set[0].loss);
}

#[test]
fn test_evolution_is_reproducible_for_a_seed() {
    let mut spec = blood_pressure_spec(Optimizer::DifferentialEvolution, Objective::Single);
    spec.budget = 40;
    let driver = Driver::new(&LumpedModel);
    let a = driver.run(&spec).unwrap();
    let b = driver.run(&spec).unwrap();
    assert_eq!(a.best().values, b.best().values);
}

fn input_row(id: i64, temp: &str, t: f64, hr: Option<f64>) -> Row {
    Row::new()
        .with("id", id)
        .with("temp", temp.to_string())
        .with("t", t)
        .with("sv", 70.0)
        .with("sys", 118.0)
        .with("dia", 76.0)
        .with("hr", hr)
        .with("pr", 0.16)
        .with("qrs", 0.09)
        .with("qt", 0.38)
        .with("core", Value::Null)
        .with("core_ref", Value::Null)
        .with("skin", Value::Null)
        .with("skin_ref", Value::Null)
}

fn settings(dir: &tempfile::TempDir) -> Settings {
    let mut settings = Settings::default();
    settings.store.path = dir.path().join("fit.db").display().to_string();
    settings.store.max_tries = 5;
    settings.fit.budget = 20;
    settings.fit.inputs = json!({
        "generic_params": { "nstep": 200, "ncycle": 4, "max_step": 1e-3 }
    });
    settings
}

#[test]
fn test_fit_job_writes_one_row_per_usable_record() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(&dir);
    let store = settings.store.open();
    let rows = vec![
        input_row(1, "cold", 0.0, Some(70.0)),
        input_row(1, "cold", 60.0, Some(72.0)),
        input_row(1, "cold", 120.0, None),
        input_row(2, "warm", 0.0, Some(65.0)),
    ];
    store
        .write(&settings.store.input_table, &rows, WriteMode::Append)
        .unwrap();

    let written = hemofit::fit(settings.clone(), Partition::default()).unwrap();
    assert_eq!(written, 3);

    let columns = store.columns(&settings.store.output_table).unwrap();
    for expected in [
        "id",
        "temp",
        "t",
        "sys",
        "sys_target",
        "dia",
        "dia_target",
        "sv",
        "sv_target",
        "loss",
        "pareto_index",
        "generic_params.r_scale",
        "ecg.t2",
    ] {
        assert!(columns.iter().any(|c| c == expected), "missing {}", expected);
    }

    let output = store
        .select(Query::new(format!(
            "SELECT * FROM {} ORDER BY id, t",
            settings.store.output_table
        )))
        .unwrap();
    assert_eq!(output.len(), 3);
    assert_eq!(output[2].get("id"), Some(&Value::Integer(2)));
    assert_eq!(output[0].get_f64("sys_target"), Some(118.0));
    // The period follows the heart rate of each record
    let period = output[1].get_f64("generic_params.period").unwrap();
    assert!((period - 60.0 / 72.0).abs() < 1e-9);
}

#[test]
fn test_replace_mode_drops_previous_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(&dir);
    let store = settings.store.open();
    store
        .write(
            &settings.store.input_table,
            &[input_row(1, "cold", 0.0, Some(70.0))],
            WriteMode::Append,
        )
        .unwrap();

    hemofit::fit(settings.clone(), Partition::default()).unwrap();
    hemofit::fit(settings.clone(), Partition::default()).unwrap();
    let count = store
        .fetch_one(Query::new(format!(
            "SELECT count(*) FROM {}",
            settings.store.output_table
        )))
        .unwrap();
    assert_eq!(count, Some(Value::Integer(2)));

    settings.store.write_mode = WriteMode::Replace;
    hemofit::fit(settings.clone(), Partition::default()).unwrap();
    let count = store
        .fetch_one(Query::new(format!(
            "SELECT count(*) FROM {}",
            settings.store.output_table
        )))
        .unwrap();
    assert_eq!(count, Some(Value::Integer(1)));
}

#[test]
fn test_unusable_vital_skips_only_its_stage() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(&dir);
    let store = settings.store.open();
    let rows: Vec<Row> = [70.0, 0.0, 70.0]
        .into_iter()
        .enumerate()
        .map(|(i, sv)| input_row(1, "cold", 60.0 * i as f64, Some(70.0)).with("sv", sv))
        .collect();
    store
        .write(&settings.store.input_table, &rows, WriteMode::Append)
        .unwrap();

    let written = hemofit::fit(settings.clone(), Partition::default()).unwrap();
    assert_eq!(written, 3);
}

#[test]
fn test_non_positive_pressure_skips_the_record() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(&dir);
    let store = settings.store.open();
    let rows = vec![
        input_row(1, "cold", 0.0, Some(70.0)),
        input_row(1, "cold", 60.0, Some(70.0)).with("dia", -5.0),
        input_row(1, "cold", 120.0, Some(70.0)),
    ];
    store
        .write(&settings.store.input_table, &rows, WriteMode::Append)
        .unwrap();

    let written = hemofit::fit(settings.clone(), Partition::default()).unwrap();
    assert_eq!(written, 2);
}

#[test]
fn test_table_without_intervals_or_temperatures() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(&dir);
    settings.fit.algorithm = Algorithm::Pareto;
    settings.fit.optimizer = Optimizer::DifferentialEvolution;
    settings.fit.budget = 20;
    let store = settings.store.open();
    let rows: Vec<Row> = [(1, 60.0), (2, 76.0)]
        .into_iter()
        .map(|(id, hr)| {
            Row::new()
                .with("id", id as i64)
                .with("temp", "rest".to_string())
                .with("t", 0.0)
                .with("sys", 121.0)
                .with("dia", 79.0)
                .with("hr", hr)
        })
        .collect();
    store
        .write(&settings.store.input_table, &rows, WriteMode::Append)
        .unwrap();

    let written = hemofit::fit(settings.clone(), Partition::default()).unwrap();
    assert!(written >= 2);

    let output = store
        .select(Query::new(format!(
            "SELECT id, \"ecg.t1\", \"ecg.t4\", \"generic_params.period\" FROM {} WHERE pareto_index = 0 ORDER BY id",
            settings.store.output_table
        )))
        .unwrap();
    assert_eq!(output.len(), 2);
    // Landmarks scale with the heart rate when the intervals are unknown
    assert!((output[0].get_f64("ecg.t1").unwrap() - 0.044 * 76.0 / 60.0).abs() < 1e-9);
    assert!((output[1].get_f64("ecg.t4").unwrap() - 0.588).abs() < 1e-9);
    assert!((output[0].get_f64("generic_params.period").unwrap() - 1.0).abs() < 1e-9);
}

#[test]
fn test_pareto_fit_persists_the_front() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(&dir);
    settings.fit.algorithm = Algorithm::Pareto;
    settings.fit.optimizer = Optimizer::DifferentialEvolution;
    settings.fit.budget = 40;
    let store = settings.store.open();
    store
        .write(
            &settings.store.input_table,
            &[input_row(1, "cold", 0.0, Some(70.0))],
            WriteMode::Append,
        )
        .unwrap();

    let written = hemofit::fit(settings.clone(), Partition::default()).unwrap();
    assert!(written >= 1);

    let output = store
        .select(Query::new(format!(
            "SELECT pareto_index, loss FROM {} ORDER BY pareto_index",
            settings.store.output_table
        )))
        .unwrap();
    assert_eq!(output.len(), written);
    for (i, row) in output.iter().enumerate() {
        assert_eq!(row.get("pareto_index"), Some(&Value::Integer(i as i64)));
    }
}

#[test]
fn test_missing_input_table_is_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(&dir);
    let err = hemofit::fit(settings, Partition::default()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<FitError>(),
        Some(FitError::Config(_))
    ));
}

#[test]
fn test_pareto_with_nelder_mead_is_rejected() {
    let mut settings = Settings::default();
    settings.fit.algorithm = Algorithm::Pareto;
    assert!(matches!(settings.validate(), Err(FitError::Config(_))));
}
