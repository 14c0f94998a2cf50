use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::SimulationError;

/// Simulation and scaling parameters shared by the whole circulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenericParams {
    /// Number of output samples
    pub nstep: usize,
    /// Cardiac period in seconds
    pub period: f64,
    /// Number of simulated cardiac cycles
    pub ncycle: usize,
    /// Largest internal integration step in seconds
    pub max_step: f64,
    pub r_scale: f64,
    pub c_scale: f64,
    pub e_scale: f64,
    pub v_scale: f64,
}

impl Default for GenericParams {
    fn default() -> Self {
        Self {
            nstep: 2000,
            period: 0.9,
            ncycle: 10,
            max_step: 5e-4,
            r_scale: 1.0,
            c_scale: 1.0,
            e_scale: 1.0,
            v_scale: 1.0,
        }
    }
}

/// ECG landmarks within one cardiac cycle, in seconds
///
/// - `t1`: P peak
/// - `t2`: R peak, onset of ventricular contraction
/// - `t3`: T peak, end of contraction
/// - `t4`: T offset, end of relaxation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Ecg {
    pub t1: f64,
    pub t2: f64,
    pub t3: f64,
    pub t4: f64,
}

impl Default for Ecg {
    fn default() -> Self {
        Self {
            t1: 0.0,
            t2: 0.142,
            t3: 0.462,
            t4: 0.522,
        }
    }
}

/// Time-varying elastance chamber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Chamber {
    /// Diastolic elastance (mmHg/ml)
    pub emin: f64,
    /// End-systolic elastance (mmHg/ml)
    pub emax: f64,
    /// Unstressed volume (ml)
    pub v0: f64,
    /// Initial volume (ml)
    pub v_ini: f64,
}

impl Default for Chamber {
    fn default() -> Self {
        Self {
            emin: 0.06,
            emax: 2.5,
            v0: 10.0,
            v_ini: 120.0,
        }
    }
}

/// Systemic circulation, lumped into an arterial and a venous compliance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Vascular {
    /// Peripheral resistance (mmHg s/ml)
    pub r_sys: f64,
    /// Arterial compliance (ml/mmHg)
    pub c_art: f64,
    /// Venous compliance (ml/mmHg)
    pub c_ven: f64,
    /// Total stressed blood volume (ml)
    pub v_stressed: f64,
}

impl Default for Vascular {
    fn default() -> Self {
        Self {
            r_sys: 1.0,
            c_art: 1.5,
            c_ven: 40.0,
            v_stressed: 550.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Valve {
    /// Forward resistance (mmHg s/ml)
    pub r_open: f64,
    /// Regurgitant resistance (mmHg s/ml)
    pub r_closed: f64,
}

impl Valve {
    fn aortic() -> Self {
        Self {
            r_open: 0.01,
            r_closed: 1e3,
        }
    }

    fn mitral() -> Self {
        Self {
            r_open: 0.015,
            r_closed: 1e3,
        }
    }

    /// Flow through the valve for a pressure drop `dp` across it
    #[inline]
    pub fn flow(&self, dp: f64) -> f64 {
        if dp > 0.0 {
            dp / self.r_open
        } else {
            dp / self.r_closed
        }
    }
}

/// Skin blood flow control driving systemic vasodilation and vasoconstriction
///
/// Skin blood flow follows `(basal_flow + k_dil * warm) / (1 + k_con * cold)`, where `warm` is the
/// core temperature excess over its reference and `cold` the skin temperature deficit under its
/// reference. The skin bed carries `skin_fraction` of the systemic conductance at basal flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThermalSystem {
    pub t_cr: f64,
    pub t_cr_ref: f64,
    pub t_sk: f64,
    pub t_sk_ref: f64,
    pub k_dil: f64,
    pub k_con: f64,
    pub basal_flow: f64,
    pub skin_fraction: f64,
}

impl Default for ThermalSystem {
    fn default() -> Self {
        Self {
            t_cr: 36.8,
            t_cr_ref: 36.8,
            t_sk: 34.1,
            t_sk_ref: 34.1,
            k_dil: 75.0,
            k_con: 0.5,
            basal_flow: 6.3,
            skin_fraction: 0.05,
        }
    }
}

impl ThermalSystem {
    /// Multiplier applied to the peripheral resistance
    pub fn resistance_factor(&self) -> f64 {
        let warm = (self.t_cr - self.t_cr_ref).max(0.0);
        let cold = (self.t_sk_ref - self.t_sk).max(0.0);
        let skin_flow = (self.basal_flow + self.k_dil * warm) / (1.0 + self.k_con * cold);
        let conductance =
            (1.0 - self.skin_fraction) + self.skin_fraction * skin_flow / self.basal_flow;
        1.0 / conductance
    }
}

/// Fully resolved parameter bundle for the forward model
///
/// Every group falls back to its documented defaults, see [merge] to apply partial overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelInputs {
    pub generic_params: GenericParams,
    pub ecg: Ecg,
    pub left_ventricle: Chamber,
    pub systemic: Vascular,
    pub aortic_valve: Valve,
    pub mitral_valve: Valve,
    pub thermal_system: ThermalSystem,
}

impl Default for ModelInputs {
    fn default() -> Self {
        Self {
            generic_params: GenericParams::default(),
            ecg: Ecg::default(),
            left_ventricle: Chamber::default(),
            systemic: Vascular::default(),
            aortic_valve: Valve::aortic(),
            mitral_valve: Valve::mitral(),
            thermal_system: ThermalSystem::default(),
        }
    }
}

/// Declares the real-valued parameters addressable as `<group>.<name>`
macro_rules! parameter_paths {
    ($($group:ident . $field:ident),* $(,)?) => {
        impl ModelInputs {
            /// Every real-valued parameter path, in declaration order
            pub const PATHS: &'static [&'static str] = &[
                $(concat!(stringify!($group), ".", stringify!($field)),)*
            ];

            /// Read a parameter by its `<group>.<name>` path
            pub fn get(&self, path: &str) -> Option<f64> {
                match path {
                    $(concat!(stringify!($group), ".", stringify!($field)) => Some(self.$group.$field),)*
                    _ => None,
                }
            }

            /// Overwrite a parameter by its `<group>.<name>` path
            pub fn set(&mut self, path: &str, value: f64) -> Result<(), SimulationError> {
                match path {
                    $(concat!(stringify!($group), ".", stringify!($field)) => {
                        self.$group.$field = value;
                        Ok(())
                    })*
                    _ => Err(SimulationError::UnknownParameter(path.to_string())),
                }
            }
        }
    };
}

parameter_paths!(
    generic_params.period,
    generic_params.max_step,
    generic_params.r_scale,
    generic_params.c_scale,
    generic_params.e_scale,
    generic_params.v_scale,
    ecg.t1,
    ecg.t2,
    ecg.t3,
    ecg.t4,
    left_ventricle.emin,
    left_ventricle.emax,
    left_ventricle.v0,
    left_ventricle.v_ini,
    systemic.r_sys,
    systemic.c_art,
    systemic.c_ven,
    systemic.v_stressed,
    aortic_valve.r_open,
    aortic_valve.r_closed,
    mitral_valve.r_open,
    mitral_valve.r_closed,
    thermal_system.t_cr,
    thermal_system.t_cr_ref,
    thermal_system.t_sk,
    thermal_system.t_sk_ref,
    thermal_system.k_dil,
    thermal_system.k_con,
    thermal_system.basal_flow,
    thermal_system.skin_fraction,
);

impl ModelInputs {
    /// Flatten the bundle into `(<group>.<name>, value)` pairs, integer settings first
    pub fn flatten(&self) -> Vec<(String, f64)> {
        let mut flat = vec![
            (
                "generic_params.nstep".to_string(),
                self.generic_params.nstep as f64,
            ),
            (
                "generic_params.ncycle".to_string(),
                self.generic_params.ncycle as f64,
            ),
        ];
        flat.extend(
            Self::PATHS
                .iter()
                .filter_map(|path| self.get(path).map(|value| (path.to_string(), value))),
        );
        flat
    }
}

/// Merge partial overrides into a set of defaults
///
/// `overrides` is a nested object `{ group: { key: value } }`. Groups and keys absent from the
/// overrides keep their default value; groups or keys unknown to [ModelInputs] are rejected.
pub fn merge(defaults: &ModelInputs, overrides: &Value) -> Result<ModelInputs, SimulationError> {
    let mut base = serde_json::to_value(defaults)
        .map_err(|e| SimulationError::InvalidInput(e.to_string()))?;
    merge_value(&mut base, overrides, "")?;
    serde_json::from_value(base).map_err(|e| SimulationError::InvalidInput(e.to_string()))
}

fn merge_value(base: &mut Value, overrides: &Value, prefix: &str) -> Result<(), SimulationError> {
    let overrides: &Map<String, Value> = match overrides {
        Value::Object(map) => map,
        Value::Null => return Ok(()),
        other => {
            return Err(SimulationError::InvalidInput(format!(
                "expected a table of overrides at '{}', found {}",
                prefix, other
            )))
        }
    };

    for (key, value) in overrides {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        let slot = base
            .get_mut(key)
            .ok_or_else(|| SimulationError::UnknownParameter(path.clone()))?;
        if slot.is_object() {
            merge_value(slot, value, &path)?;
        } else {
            *slot = value.clone();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_keeps_defaults() {
        let defaults = ModelInputs::default();
        let merged = merge(
            &defaults,
            &json!({"generic_params": {"period": 0.75}, "ecg": {"t2": 0.2}}),
        )
        .unwrap();

        assert_eq!(merged.generic_params.period, 0.75);
        assert_eq!(merged.ecg.t2, 0.2);
        assert_eq!(merged.ecg.t3, defaults.ecg.t3);
        assert_eq!(merged.systemic, defaults.systemic);
        assert_eq!(merged.aortic_valve, Valve::aortic());
        assert_eq!(merged.mitral_valve, Valve::mitral());
    }

    #[test]
    fn test_merge_rejects_unknown_keys() {
        let defaults = ModelInputs::default();
        assert!(merge(&defaults, &json!({"systemic": {"r_scale": 2.0}})).is_err());
        assert!(merge(&defaults, &json!({"right_atrium": {"emin": 0.1}})).is_err());
    }

    #[test]
    fn test_paths_roundtrip() {
        let mut inputs = ModelInputs::default();
        inputs.set("generic_params.r_scale", 2.5).unwrap();
        assert_eq!(inputs.get("generic_params.r_scale"), Some(2.5));
        assert!(inputs.set("generic_params.nope", 1.0).is_err());

        let flat = inputs.flatten();
        assert_eq!(flat.len(), ModelInputs::PATHS.len() + 2);
        assert!(flat
            .iter()
            .any(|(k, v)| k == "generic_params.r_scale" && *v == 2.5));
    }

    #[test]
    fn test_thermal_neutral_is_identity() {
        let thermal = ThermalSystem::default();
        assert!((thermal.resistance_factor() - 1.0).abs() < 1e-12);

        let warm = ThermalSystem {
            t_cr: 37.3,
            ..ThermalSystem::default()
        };
        assert!(warm.resistance_factor() < 1.0);

        let cold = ThermalSystem {
            t_sk: 30.0,
            ..ThermalSystem::default()
        };
        assert!(cold.resistance_factor() > 1.0);
    }
}
