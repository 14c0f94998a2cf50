use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use config::Config as eConfig;
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::algorithms::Algorithm;
use crate::routines::optimization::{FitError, FreeParameter, Optimizer};
use crate::routines::store::{RetryPolicy, Store, WriteMode};
use crate::simulator::{merge, ModelInputs};
use crate::structs::memory::{GroupPolicy, TRACKED};
use crate::structs::record::Columns;

/// Settings of a run
///
/// Every field has a default, so an empty configuration file is valid. Environment variables
/// prefixed with `HEMOFIT__` override the file, for example `HEMOFIT__STORE__PATH=run.db` or
/// `HEMOFIT__FIT__BUDGET=200`.
#[derive(Debug, Deserialize, Clone, Serialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub fit: FitSettings,
    #[serde(default)]
    pub bounds: Bounds,
    #[serde(default)]
    pub reduction: ReductionSettings,
    #[serde(default)]
    pub log: Log,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct StoreSettings {
    #[serde(default = "default_db")]
    pub path: String,
    /// Attempts per store operation, negative retries forever
    #[serde(default = "default_max_tries")]
    pub max_tries: i64,
    /// Per-attempt busy timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default = "default_input_table")]
    pub input_table: String,
    #[serde(default = "default_output_table")]
    pub output_table: String,
    #[serde(default)]
    pub write_mode: WriteMode,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: default_db(),
            max_tries: default_max_tries(),
            timeout: default_timeout(),
            input_table: default_input_table(),
            output_table: default_output_table(),
            write_mode: WriteMode::default(),
        }
    }
}

impl StoreSettings {
    pub fn policy(&self) -> RetryPolicy {
        let timeout = Duration::from_secs_f64(self.timeout.max(0.0));
        if self.max_tries < 0 {
            RetryPolicy::unbounded(timeout)
        } else {
            RetryPolicy::bounded(self.max_tries, timeout)
        }
    }

    pub fn open(&self) -> Store {
        Store::new(&self.path, self.policy())
    }
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct FitSettings {
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub optimizer: Optimizer,
    #[serde(default = "default_budget")]
    pub budget: usize,
    /// Threads evaluating trials of one optimization
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_tol")]
    pub tol: f64,
    #[serde(default = "default_seed")]
    pub seed: u32,
    #[serde(default)]
    pub group_policy: GroupPolicy,
    /// Records between two progress reports
    #[serde(default = "default_checkpoint")]
    pub checkpoint: usize,
    #[serde(default)]
    pub columns: Columns,
    /// Free parameters of the Pareto fit
    #[serde(default = "default_pareto_free")]
    pub free: Vec<String>,
    /// Model input overrides, `{ group = { key = value } }`
    #[serde(default)]
    pub inputs: serde_json::Value,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            optimizer: Optimizer::default(),
            budget: default_budget(),
            workers: default_workers(),
            tol: default_tol(),
            seed: default_seed(),
            group_policy: GroupPolicy::default(),
            checkpoint: default_checkpoint(),
            columns: Columns::default(),
            free: default_pareto_free(),
            inputs: serde_json::Value::Null,
        }
    }
}

impl FitSettings {
    /// Model inputs shared by every record
    pub fn base_inputs(&self) -> Result<ModelInputs, FitError> {
        Ok(merge(&ModelInputs::default(), &self.inputs)?)
    }
}

/// Admissible ranges of the fitted parameters
///
/// Scaling ranges are `[min, max]`, the seed comes from the parameter memory. Thermal gains are
/// `[min, max, seed]`.
#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct Bounds {
    #[serde(default = "default_resistance")]
    pub r_scale: (f64, f64),
    #[serde(default = "default_resistance")]
    pub c_scale: (f64, f64),
    #[serde(default = "default_elastance")]
    pub e_scale: (f64, f64),
    #[serde(default = "default_volume")]
    pub v_scale: (f64, f64),
    #[serde(default = "default_k_dil")]
    pub k_dil: (f64, f64, f64),
    #[serde(default = "default_k_con")]
    pub k_con: (f64, f64, f64),
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            r_scale: default_resistance(),
            c_scale: default_resistance(),
            e_scale: default_elastance(),
            v_scale: default_volume(),
            k_dil: default_k_dil(),
            k_con: default_k_con(),
        }
    }
}

impl Bounds {
    /// Range of a parameter by path
    pub fn range(&self, path: &str) -> Option<(f64, f64)> {
        match path {
            "generic_params.r_scale" => Some(self.r_scale),
            "generic_params.c_scale" => Some(self.c_scale),
            "generic_params.e_scale" => Some(self.e_scale),
            "generic_params.v_scale" => Some(self.v_scale),
            "thermal_system.k_dil" => Some((self.k_dil.0, self.k_dil.1)),
            "thermal_system.k_con" => Some((self.k_con.0, self.k_con.1)),
            _ => None,
        }
    }

    /// Ranges of the parameters carried between records
    pub fn tracked(&self) -> Vec<(&'static str, (f64, f64))> {
        TRACKED
            .iter()
            .filter_map(|&path| self.range(path).map(|r| (path, r)))
            .collect()
    }

    /// Thermal gains, always seeded from their configured seed
    pub fn thermal(&self) -> Vec<FreeParameter> {
        vec![
            FreeParameter::new("thermal_system.k_dil", self.k_dil.0, self.k_dil.1, self.k_dil.2),
            FreeParameter::new("thermal_system.k_con", self.k_con.0, self.k_con.1, self.k_con.2),
        ]
    }

    fn validate(&self) -> Result<(), FitError> {
        let seeded = [("thermal_system.k_dil", self.k_dil), ("thermal_system.k_con", self.k_con)];
        for path in TRACKED.iter().chain(seeded.iter().map(|(p, _)| p)) {
            if let Some((lo, hi)) = self.range(path) {
                if !(lo.is_finite() && hi.is_finite() && lo < hi) {
                    return Err(FitError::Config(format!(
                        "bounds of {} must satisfy min < max, got [{}, {}]",
                        path, lo, hi
                    )));
                }
            }
        }
        for (path, (lo, hi, seed)) in seeded {
            if !(seed >= lo && seed <= hi) {
                return Err(FitError::Config(format!(
                    "seed {} of {} lies outside [{}, {}]",
                    seed, path, lo, hi
                )));
            }
        }
        for (path, (lo, hi)) in self.tracked() {
            if !(lo..=hi).contains(&1.0) {
                return Err(FitError::Config(format!(
                    "the range of {} must contain the neutral value 1, got [{}, {}]",
                    path, lo, hi
                )));
            }
        }
        Ok(())
    }
}

/// Reduction of Pareto fronts to one row per subject
#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct ReductionSettings {
    #[serde(default = "default_output_table")]
    pub table: String,
    #[serde(default = "default_reduced_table")]
    pub output_table: String,
    #[serde(default = "default_id")]
    pub id_column: String,
    /// Measured column to target column
    #[serde(default = "default_targets")]
    pub targets: BTreeMap<String, String>,
    /// Columns constant within a subject, copied from the first point
    #[serde(default = "default_static_columns")]
    pub static_columns: Vec<String>,
    /// Column averaged with the loss weights
    #[serde(default = "default_var_column")]
    pub var_column: String,
}

impl Default for ReductionSettings {
    fn default() -> Self {
        Self {
            table: default_output_table(),
            output_table: default_reduced_table(),
            id_column: default_id(),
            targets: default_targets(),
            static_columns: default_static_columns(),
            var_column: default_var_column(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file, written in addition to stdout
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Settings {
    /// Read settings from an optional TOML file and the environment
    pub fn read(path: Option<&Path>) -> Result<Settings> {
        let mut builder = eConfig::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        let parsed = builder
            .add_source(config::Environment::with_prefix("HEMOFIT").separator("__"))
            .build()
            .wrap_err("Unable to read the configuration")?;

        let settings: Settings = parsed
            .try_deserialize()
            .wrap_err("Invalid configuration")?;
        Ok(settings)
    }

    /// Reject settings that cannot produce a valid fit
    pub fn validate(&self) -> Result<(), FitError> {
        self.bounds.validate()?;
        self.fit.base_inputs()?;
        if self.fit.checkpoint == 0 {
            return Err(FitError::Config("checkpoint must be at least 1".to_string()));
        }
        if self.fit.workers == 0 {
            return Err(FitError::Config("at least one fit worker is required".to_string()));
        }
        if self.fit.optimizer == Optimizer::NelderMead && self.fit.workers > 1 {
            return Err(FitError::Config(format!(
                "Nelder-Mead is sequential, set fit.workers = 1 instead of {}",
                self.fit.workers
            )));
        }
        if self.fit.algorithm == Algorithm::Pareto && self.fit.optimizer == Optimizer::NelderMead {
            return Err(FitError::Config(
                "the Pareto fit needs the differential_evolution optimizer".to_string(),
            ));
        }
        if self.fit.algorithm == Algorithm::Pareto {
            if self.fit.free.is_empty() {
                return Err(FitError::Config("the Pareto fit has no free parameter".to_string()));
            }
            for path in &self.fit.free {
                if self.bounds.range(path).is_none() {
                    return Err(FitError::Config(format!(
                        "no bounds are configured for '{}'",
                        path
                    )));
                }
            }
        }
        if self.reduction.targets.is_empty() {
            return Err(FitError::Config(
                "the reduction needs at least one measured/target column pair".to_string(),
            ));
        }
        Ok(())
    }

    /// Write the effective settings as JSON
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let serialized = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), serialized)
            .wrap_err_with(|| format!("Unable to write settings to {}", path.as_ref().display()))?;
        Ok(())
    }
}

// *********************************
// Default values for deserializing
// *********************************
fn default_db() -> String {
    "hemofit.db".to_string()
}

fn default_max_tries() -> i64 {
    -1
}

fn default_timeout() -> f64 {
    10.0
}

fn default_input_table() -> String {
    "Model_Inputs".to_string()
}

fn default_output_table() -> String {
    "Model_Outputs".to_string()
}

fn default_reduced_table() -> String {
    "single_outputs".to_string()
}

fn default_budget() -> usize {
    1000
}

fn default_workers() -> usize {
    1
}

fn default_tol() -> f64 {
    1e-3
}

fn default_seed() -> u32 {
    347
}

fn default_checkpoint() -> usize {
    10
}

fn default_pareto_free() -> Vec<String> {
    vec![
        "generic_params.r_scale".to_string(),
        "generic_params.c_scale".to_string(),
        "generic_params.e_scale".to_string(),
    ]
}

fn default_resistance() -> (f64, f64) {
    (0.1, 10.0)
}

fn default_elastance() -> (f64, f64) {
    (0.25, 4.0)
}

fn default_volume() -> (f64, f64) {
    (0.5, 2.0)
}

fn default_k_dil() -> (f64, f64, f64) {
    (37.0, 113.0, 75.0)
}

fn default_k_con() -> (f64, f64, f64) {
    (0.25, 0.75, 0.5)
}

fn default_id() -> String {
    "id".to_string()
}

fn default_targets() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("sys".to_string(), "sys_target".to_string()),
        ("dia".to_string(), "dia_target".to_string()),
    ])
}

fn default_static_columns() -> Vec<String> {
    ["generic_params.period", "ecg.t1", "ecg.t2", "ecg.t3", "ecg.t4"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}

fn default_var_column() -> String {
    "sv".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.store.input_table, "Model_Inputs");
        assert_eq!(settings.reduction.output_table, "single_outputs");
        assert_eq!(settings.bounds.tracked().len(), 4);
        assert!(!settings.store.policy().is_bounded());
    }

    #[test]
    fn test_pareto_requires_evolution() {
        let mut settings = Settings::default();
        settings.fit.algorithm = Algorithm::Pareto;
        assert!(matches!(settings.validate(), Err(FitError::Config(_))));
        settings.fit.optimizer = Optimizer::DifferentialEvolution;
        settings.validate().unwrap();
    }

    #[test]
    fn test_bad_bounds_are_rejected() {
        let mut settings = Settings::default();
        settings.bounds.e_scale = (2.0, 0.5);
        assert!(matches!(settings.validate(), Err(FitError::Config(_))));

        let mut settings = Settings::default();
        settings.bounds.k_dil = (37.0, 113.0, 120.0);
        assert!(matches!(settings.validate(), Err(FitError::Config(_))));
    }
}
