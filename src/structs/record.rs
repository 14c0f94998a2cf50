use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use crate::routines::optimization::FitError;
use crate::routines::store::{as_f64, quote, Query, Row};
use crate::simulator::{Metric, ModelInputs};

/// Names of the identity columns of the input and output tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Columns {
    #[serde(default = "default_id")]
    pub id: String,
    #[serde(default = "default_condition")]
    pub condition: String,
    #[serde(default = "default_time")]
    pub time: String,
}

impl Default for Columns {
    fn default() -> Self {
        Self {
            id: default_id(),
            condition: default_condition(),
            time: default_time(),
        }
    }
}

fn default_id() -> String {
    "id".to_string()
}

fn default_condition() -> String {
    "temp".to_string()
}

fn default_time() -> String {
    "t".to_string()
}

/// Measured columns every input table must carry
pub const REQUIRED: [&str; 3] = ["sys", "dia", "hr"];

/// Measured columns read when the input table has them
pub const OPTIONAL: [&str; 8] = [
    "sv", "pr", "qrs", "qt", "core", "core_ref", "skin", "skin_ref",
];

/// ECG landmarks at a heart rate of 76 bpm, used when a record has no intervals
const LANDMARKS_AT_76: [f64; 4] = [0.044, 0.184, 0.500, 0.588];

/// One measurement row of a subject under a condition
///
/// Vitals are optional, a null in the store becomes `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: Value,
    pub condition: Value,
    /// Elapsed time in seconds
    pub t: f64,
    pub sv: Option<f64>,
    pub sys: Option<f64>,
    pub dia: Option<f64>,
    pub hr: Option<f64>,
    pub pr: Option<f64>,
    pub qrs: Option<f64>,
    pub qt: Option<f64>,
    pub core: Option<f64>,
    pub core_ref: Option<f64>,
    pub skin: Option<f64>,
    pub skin_ref: Option<f64>,
}

impl Record {
    /// Query reading every record whose id lies in `[first, last]`, in processing order
    ///
    /// Optional measured columns missing from `available` are left out and read as `None`.
    pub fn select(
        table: &str,
        columns: &Columns,
        available: &[String],
        first: &Value,
        last: &Value,
    ) -> Query {
        let mut names = vec![
            quote(&columns.id),
            quote(&columns.condition),
            quote(&columns.time),
        ];
        names.extend(REQUIRED.iter().map(|c| quote(c)));
        names.extend(
            OPTIONAL
                .iter()
                .filter(|c| available.iter().any(|a| a == *c))
                .map(|c| quote(c)),
        );
        Query::new(format!(
            "SELECT {} FROM {} WHERE {} BETWEEN ?1 AND ?2 ORDER BY {}, {}, {}",
            names.join(", "),
            quote(table),
            quote(&columns.id),
            quote(&columns.id),
            quote(&columns.condition),
            quote(&columns.time),
        ))
        .bind(first.clone())
        .bind(last.clone())
    }

    pub fn from_row(row: &Row, columns: &Columns) -> Result<Self, FitError> {
        let value = |name: &str| {
            row.get(name)
                .cloned()
                .ok_or_else(|| FitError::Config(format!("input row has no column '{}'", name)))
        };
        let t = as_f64(&value(&columns.time)?).ok_or_else(|| {
            FitError::Config(format!("column '{}' must hold numeric times", columns.time))
        })?;
        let measured = |name: &str| row.get(name).and_then(as_f64);

        Ok(Record {
            id: value(&columns.id)?,
            condition: value(&columns.condition)?,
            t,
            sv: measured("sv"),
            sys: measured("sys"),
            dia: measured("dia"),
            hr: measured("hr"),
            pr: measured("pr"),
            qrs: measured("qrs"),
            qt: measured("qt"),
            core: measured("core"),
            core_ref: measured("core_ref"),
            skin: measured("skin"),
            skin_ref: measured("skin_ref"),
        })
    }

    /// Measured value of a fitted metric, `None` unless it is positive and finite
    pub fn target(&self, metric: Metric) -> Option<f64> {
        let value = match metric {
            Metric::Systolic => self.sys,
            Metric::Diastolic => self.dia,
            Metric::StrokeVolume => self.sv,
        };
        value.filter(|v| v.is_finite() && *v > 0.0)
    }

    /// Model inputs of this record on top of `base`
    ///
    /// The cardiac period follows the heart rate. The ECG landmarks follow the PR, QRS and QT
    /// intervals when all three are known and scale with the heart rate otherwise. Temperatures
    /// are only applied when present.
    pub fn model_inputs(&self, base: &ModelInputs) -> Result<ModelInputs, FitError> {
        let mut inputs = base.clone();

        let hr = self
            .hr
            .filter(|hr| hr.is_finite() && *hr > 0.0)
            .ok_or_else(|| self.invalid("a positive heart rate"))?;
        inputs.generic_params.period = 60.0 / hr;

        let ecg = &mut inputs.ecg;
        if let (Some(pr), Some(qrs), Some(qt)) = (self.pr, self.qrs, self.qt) {
            ecg.t1 = pr / 3.0;
            ecg.t2 = pr + qrs / 2.0;
            ecg.t3 = pr + qrs + 0.75 * (qt - qrs);
            ecg.t4 = pr + qt;
        } else {
            let [t1, t2, t3, t4] = LANDMARKS_AT_76.map(|t| t * 76.0 / hr);
            ecg.t1 = t1;
            ecg.t2 = t2;
            ecg.t3 = t3;
            ecg.t4 = t4;
        }

        let thermal = &mut inputs.thermal_system;
        if let Some(core) = self.core {
            thermal.t_cr = core;
        }
        if let Some(core_ref) = self.core_ref {
            thermal.t_cr_ref = core_ref;
        }
        if let Some(skin) = self.skin {
            thermal.t_sk = skin;
        }
        if let Some(skin_ref) = self.skin_ref {
            thermal.t_sk_ref = skin_ref;
        }
        Ok(inputs)
    }

    fn invalid(&self, what: &str) -> FitError {
        FitError::Record {
            id: format!("{:?}", self.id),
            t: self.t,
            reason: format!("record needs {}", what),
        }
    }
}
