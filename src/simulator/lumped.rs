use std::f64::consts::PI;

use ndarray::Array2;
use ode_solvers::{Rk4, System, Vector3};

use super::inputs::ModelInputs;
use super::{Channel, ForwardModel, SimulationError, Solution};

type State = Vector3<f64>;
type Time = f64;

/// Closed-loop lumped circulation: a time-varying elastance left ventricle ejecting through the
/// aortic valve into a systemic arterial compliance, draining through the peripheral resistance
/// into a venous compliance that refills the ventricle through the mitral valve.
///
/// State is `[V_lv, V_art, V_ven]` in ml. Total stressed volume is conserved.
#[derive(Debug, Clone, Copy, Default)]
pub struct LumpedModel;

#[derive(Debug, Clone)]
struct Circulation {
    period: f64,
    contraction: f64,
    relaxation: f64,
    onset: f64,
    emin: f64,
    emax: f64,
    v0: f64,
    r_sys: f64,
    c_art: f64,
    c_ven: f64,
    aortic: super::inputs::Valve,
    mitral: super::inputs::Valve,
}

impl Circulation {
    fn new(inputs: &ModelInputs) -> Self {
        let gp = &inputs.generic_params;
        let lv = &inputs.left_ventricle;
        let ecg = &inputs.ecg;
        Circulation {
            period: gp.period,
            contraction: ecg.t3 - ecg.t2,
            relaxation: ecg.t4 - ecg.t2,
            onset: ecg.t2,
            emin: lv.emin,
            emax: lv.emax * gp.e_scale,
            v0: lv.v0,
            r_sys: inputs.systemic.r_sys * gp.r_scale * inputs.thermal_system.resistance_factor(),
            c_art: inputs.systemic.c_art * gp.c_scale,
            c_ven: inputs.systemic.c_ven,
            aortic: inputs.aortic_valve.clone(),
            mitral: inputs.mitral_valve.clone(),
        }
    }

    /// Ventricular activation in [0, 1], rising from the R peak to the T peak and
    /// falling back to zero at the T offset
    fn activation(&self, t: Time) -> f64 {
        let s = (t - self.onset).rem_euclid(self.period);
        if s < self.contraction {
            0.5 * (1.0 - (PI * s / self.contraction).cos())
        } else if s < self.relaxation {
            0.5 * (1.0 + (PI * (s - self.contraction) / (self.relaxation - self.contraction)).cos())
        } else {
            0.0
        }
    }

    fn elastance(&self, t: Time) -> f64 {
        self.emin + (self.emax - self.emin) * self.activation(t)
    }

    /// Pressures and valve flows at time `t`
    fn observe(&self, t: Time, y: &State) -> [f64; 6] {
        let e = self.elastance(t);
        let p_lv = e * (y[0] - self.v0);
        let p_art = y[1] / self.c_art;
        let p_ven = y[2] / self.c_ven;
        let q_av = self.aortic.flow(p_lv - p_art);
        let q_mv = self.mitral.flow(p_ven - p_lv);
        [p_lv, p_art, p_ven, q_av, q_mv, e]
    }
}

impl System<Time, State> for Circulation {
    fn system(&self, t: Time, y: &State, dy: &mut State) {
        let [_, p_art, p_ven, q_av, q_mv, _] = self.observe(t, y);
        let q_sys = (p_art - p_ven) / self.r_sys;
        dy[0] = q_mv - q_av;
        dy[1] = q_av - q_sys;
        dy[2] = q_sys - q_mv;
    }
}

fn validate(inputs: &ModelInputs) -> Result<(), SimulationError> {
    let gp = &inputs.generic_params;
    let ecg = &inputs.ecg;
    let positive = [
        ("generic_params.period", gp.period),
        ("generic_params.max_step", gp.max_step),
        ("generic_params.r_scale", gp.r_scale),
        ("generic_params.c_scale", gp.c_scale),
        ("generic_params.e_scale", gp.e_scale),
        ("generic_params.v_scale", gp.v_scale),
        ("left_ventricle.emin", inputs.left_ventricle.emin),
        ("left_ventricle.emax", inputs.left_ventricle.emax),
        ("systemic.r_sys", inputs.systemic.r_sys),
        ("systemic.c_art", inputs.systemic.c_art),
        ("systemic.c_ven", inputs.systemic.c_ven),
        ("systemic.v_stressed", inputs.systemic.v_stressed),
        ("aortic_valve.r_open", inputs.aortic_valve.r_open),
        ("aortic_valve.r_closed", inputs.aortic_valve.r_closed),
        ("mitral_valve.r_open", inputs.mitral_valve.r_open),
        ("mitral_valve.r_closed", inputs.mitral_valve.r_closed),
        ("thermal_system.basal_flow", inputs.thermal_system.basal_flow),
    ];
    for (name, value) in positive {
        if !(value.is_finite() && value > 0.0) {
            return Err(SimulationError::InvalidInput(format!(
                "{} must be positive and finite, got {}",
                name, value
            )));
        }
    }
    if gp.nstep < 2 || gp.ncycle == 0 {
        return Err(SimulationError::InvalidInput(format!(
            "need at least 2 samples and 1 cycle, got nstep={} ncycle={}",
            gp.nstep, gp.ncycle
        )));
    }
    let contraction = ecg.t3 - ecg.t2;
    let relaxation = ecg.t4 - ecg.t2;
    if !(contraction > 0.0 && relaxation > contraction && relaxation < gp.period) {
        return Err(SimulationError::InvalidInput(format!(
            "ECG timings t2={}, t3={}, t4={} are inconsistent with a period of {}",
            ecg.t2, ecg.t3, ecg.t4, gp.period
        )));
    }
    Ok(())
}

impl ForwardModel for LumpedModel {
    fn solve(&self, inputs: &ModelInputs) -> Result<Solution, SimulationError> {
        validate(inputs)?;
        let gp = &inputs.generic_params;
        let model = Circulation::new(inputs);

        // Start from a uniform vascular pressure, the loop settles within a few cycles
        let total = inputs.systemic.v_stressed * gp.v_scale;
        let v_lv = inputs.left_ventricle.v_ini.min(0.25 * total);
        let p0 = (total - v_lv) / (model.c_art + model.c_ven);
        let y0 = State::new(v_lv, p0 * model.c_art, p0 * model.c_ven);

        let t_end = gp.ncycle as f64 * gp.period;
        let dt_out = t_end / (gp.nstep - 1) as f64;
        let substeps = (dt_out / gp.max_step).ceil().max(1.0) as usize;
        let h = dt_out / substeps as f64;

        let mut stepper = Rk4::new(model.clone(), 0.0, y0, t_end, h);
        stepper
            .integrate()
            .map_err(|e| SimulationError::Integration(format!("{:?}", e)))?;
        let states = stepper.y_out();
        if states.is_empty() {
            return Err(SimulationError::Integration(
                "integrator produced no output".to_string(),
            ));
        }

        let mut channels = Array2::<f64>::zeros((Channel::ALL.len(), gp.nstep));
        for k in 0..gp.nstep {
            let idx = (k * substeps).min(states.len() - 1);
            let t = k as f64 * dt_out;
            let y = &states[idx];
            let [p_lv, p_art, p_ven, q_av, q_mv, e] = model.observe(t, y);
            let sample = [t, p_lv, y[0], p_art, p_ven, q_av, q_mv, e];
            if sample.iter().any(|v| !v.is_finite()) {
                return Err(SimulationError::NonFinite { time: t });
            }
            if y[0] < 0.0 || y[1] < 0.0 || y[2] < 0.0 {
                return Err(SimulationError::NonPhysical { time: t });
            }
            for (channel, value) in Channel::ALL.iter().zip(sample) {
                channels[[channel.index(), k]] = value;
            }
        }

        Ok(Solution::new(channels, gp.period))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_circulation_is_physiological() {
        let solution = LumpedModel.solve(&ModelInputs::default()).unwrap();
        let (sys, dia) = solution.systolic_diastolic();
        let sv = solution.stroke_volume();

        assert_eq!(solution.samples(), 2000);
        assert!(sys > dia, "systolic {} must exceed diastolic {}", sys, dia);
        assert!((80.0..200.0).contains(&sys), "systolic {}", sys);
        assert!((40.0..130.0).contains(&dia), "diastolic {}", dia);
        assert!((20.0..150.0).contains(&sv), "stroke volume {}", sv);
    }

    #[test]
    fn test_volume_is_conserved() {
        let inputs = ModelInputs::default();
        let solution = LumpedModel.solve(&inputs).unwrap();
        let c_art = inputs.systemic.c_art;
        let c_ven = inputs.systemic.c_ven;
        let total = solution.channel(Channel::LvVolume)[1500]
            + solution.channel(Channel::ArterialPressure)[1500] * c_art
            + solution.channel(Channel::VenousPressure)[1500] * c_ven;
        assert!((total - inputs.systemic.v_stressed).abs() < 1e-6 * total);
    }

    #[test]
    fn test_resistance_raises_pressure() {
        let mut inputs = ModelInputs::default();
        let (base_sys, base_dia) = LumpedModel.solve(&inputs).unwrap().systolic_diastolic();
        inputs.generic_params.r_scale = 1.5;
        let (sys, dia) = LumpedModel.solve(&inputs).unwrap().systolic_diastolic();
        assert!(sys > base_sys);
        assert!(dia > base_dia);
    }

    #[test]
    fn test_inconsistent_ecg_is_rejected() {
        let mut inputs = ModelInputs::default();
        inputs.ecg.t3 = inputs.ecg.t2;
        assert!(matches!(
            LumpedModel.solve(&inputs),
            Err(SimulationError::InvalidInput(_))
        ));
    }
}
