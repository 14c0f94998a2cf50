use std::io::Write;

use eyre::Result;
use hemofit::prelude::*;

fn read(toml: &str) -> Result<Settings> {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
    file.write_all(toml.as_bytes())?;
    Settings::read(Some(file.path()))
}

/// An empty file yields the defaults
#[test]
fn test_defaults() -> Result<()> {
    let settings = read("")?;
    assert_eq!(settings.store.path, "hemofit.db");
    assert_eq!(settings.store.input_table, "Model_Inputs");
    assert_eq!(settings.store.output_table, "Model_Outputs");
    assert_eq!(settings.store.write_mode, WriteMode::Append);
    assert!(!settings.store.policy().is_bounded());
    assert_eq!(settings.fit.algorithm, Algorithm::Staged);
    assert_eq!(settings.fit.optimizer, Optimizer::NelderMead);
    assert_eq!(settings.fit.budget, 1000);
    assert_eq!(settings.fit.tol, 1e-3);
    assert_eq!(settings.fit.group_policy, GroupPolicy::Both);
    assert_eq!(settings.bounds.e_scale, (0.25, 4.0));
    assert_eq!(settings.bounds.k_dil, (37.0, 113.0, 75.0));
    settings.validate()?;
    Ok(())
}

#[test]
fn test_file_overrides() -> Result<()> {
    let settings = read(
        r#"
        [store]
        path = "cohort.db"
        max_tries = 3
        timeout = 0.5
        write_mode = "replace"

        [fit]
        algorithm = "pareto"
        optimizer = "differential_evolution"
        budget = 200
        workers = 4
        group_policy = "either"

        [fit.inputs.generic_params]
        nstep = 500

        [bounds]
        r_scale = [0.2, 5.0]
        "#,
    )?;
    settings.validate()?;

    assert_eq!(settings.store.path, "cohort.db");
    let policy = settings.store.policy();
    assert_eq!(policy.max_tries, 3);
    assert_eq!(policy.timeout, std::time::Duration::from_millis(500));
    assert_eq!(settings.store.write_mode, WriteMode::Replace);
    assert_eq!(settings.fit.algorithm, Algorithm::Pareto);
    assert_eq!(settings.fit.workers, 4);
    assert_eq!(settings.fit.group_policy, GroupPolicy::Either);
    assert_eq!(settings.bounds.r_scale, (0.2, 5.0));
    assert_eq!(settings.bounds.c_scale, (0.1, 10.0));

    let inputs = settings.fit.base_inputs()?;
    assert_eq!(inputs.generic_params.nstep, 500);
    assert_eq!(inputs.generic_params.ncycle, ModelInputs::default().generic_params.ncycle);
    Ok(())
}

#[test]
fn test_unknown_model_input_is_rejected() -> Result<()> {
    let settings = read(
        r#"
        [fit.inputs.generic_params]
        no_such_key = 1.0
        "#,
    )?;
    assert!(matches!(settings.validate(), Err(FitError::Simulation(_))));
    Ok(())
}

#[test]
fn test_inconsistent_settings_are_rejected() {
    let mut settings = Settings::default();
    settings.bounds.r_scale = (2.0, 1.0);
    assert!(matches!(settings.validate(), Err(FitError::Config(_))));

    let mut settings = Settings::default();
    settings.fit.workers = 2;
    assert!(matches!(settings.validate(), Err(FitError::Config(_))));

    let mut settings = Settings::default();
    settings.bounds.k_con = (0.25, 0.75, 0.9);
    assert!(matches!(settings.validate(), Err(FitError::Config(_))));

    let mut settings = Settings::default();
    settings.fit.checkpoint = 0;
    assert!(matches!(settings.validate(), Err(FitError::Config(_))));
}

#[test]
fn test_missing_file_is_an_error() {
    assert!(Settings::read(Some(std::path::Path::new("/nonexistent/hemofit.toml"))).is_err());
}

#[test]
fn test_settings_serialization() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("settings.json");
    let mut settings = Settings::default();
    settings.fit.budget = 42;
    settings.write(&path)?;

    let json = std::fs::read_to_string(&path)?;
    assert!(json.contains("\"budget\": 42"));
    let deserialized: Settings = serde_json::from_str(&json)?;
    assert_eq!(deserialized.fit.budget, 42);
    Ok(())
}
