//! Forward model of the circulation
//!
//! The pipeline only relies on the [ForwardModel] contract: a pure function from a fully resolved
//! [ModelInputs] bundle to a [Solution], a fixed-length multi-channel waveform. [LumpedModel] is
//! the bundled implementation.

pub mod inputs;
pub mod lumped;

use ndarray::{s, Array2, ArrayView1};
use thiserror::Error;

pub use inputs::{merge, ModelInputs};
pub use lumped::LumpedModel;

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("invalid model input: {0}")]
    InvalidInput(String),
    #[error("unknown model parameter '{0}'")]
    UnknownParameter(String),
    #[error("integration failed: {0}")]
    Integration(String),
    #[error("non-finite state at t = {time:.4} s")]
    NonFinite { time: f64 },
    #[error("negative compartment volume at t = {time:.4} s")]
    NonPhysical { time: f64 },
}

/// A physiological simulator, parameter bundle in, waveform out
pub trait ForwardModel: Sync {
    fn solve(&self, inputs: &ModelInputs) -> Result<Solution, SimulationError>;
}

impl<F> ForwardModel for F
where
    F: Fn(&ModelInputs) -> Result<Solution, SimulationError> + Sync,
{
    fn solve(&self, inputs: &ModelInputs) -> Result<Solution, SimulationError> {
        self(inputs)
    }
}

/// Channels of a [Solution]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Time,
    LvPressure,
    LvVolume,
    ArterialPressure,
    VenousPressure,
    AorticFlow,
    MitralFlow,
    Elastance,
}

impl Channel {
    pub const ALL: [Channel; 8] = [
        Channel::Time,
        Channel::LvPressure,
        Channel::LvVolume,
        Channel::ArterialPressure,
        Channel::VenousPressure,
        Channel::AorticFlow,
        Channel::MitralFlow,
        Channel::Elastance,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            Channel::Time => "Time (s)",
            Channel::LvPressure => "Left Ventricle Pressure",
            Channel::LvVolume => "Left Ventricle Volume",
            Channel::ArterialPressure => "Systemic Artery Pressure",
            Channel::VenousPressure => "Systemic Vein Pressure",
            Channel::AorticFlow => "Aortic Valve Flow",
            Channel::MitralFlow => "Mitral Valve Flow",
            Channel::Elastance => "Left Ventricle Elastance",
        }
    }
}

/// Simulated waveform, one row per [Channel] and one column per sample
#[derive(Debug, Clone)]
pub struct Solution {
    channels: Array2<f64>,
    period: f64,
}

impl Solution {
    pub fn new(channels: Array2<f64>, period: f64) -> Self {
        Self { channels, period }
    }

    pub fn samples(&self) -> usize {
        self.channels.ncols()
    }

    pub fn channel(&self, channel: Channel) -> ArrayView1<'_, f64> {
        self.channels.row(channel.index())
    }

    /// Samples of `channel` within the last simulated cardiac cycle
    pub fn last_cycle(&self, channel: Channel) -> ArrayView1<'_, f64> {
        let time = self.channel(Channel::Time);
        let t_end = time[time.len() - 1];
        let first = time
            .iter()
            .position(|&t| t >= t_end - self.period)
            .unwrap_or(0);
        self.channels.slice(s![channel.index(), first..])
    }

    /// Systemic arterial systolic and diastolic pressure over the last cycle (mmHg)
    pub fn systolic_diastolic(&self) -> (f64, f64) {
        extrema(self.last_cycle(Channel::ArterialPressure))
    }

    /// Left ventricular stroke volume over the last cycle (ml)
    pub fn stroke_volume(&self) -> f64 {
        let (max, min) = extrema(self.last_cycle(Channel::LvVolume));
        max - min
    }
}

fn extrema(values: ArrayView1<'_, f64>) -> (f64, f64) {
    values.iter().fold((f64::MIN, f64::MAX), |(max, min), &v| {
        (max.max(v), min.min(v))
    })
}

/// Clinical metrics derived from a [Solution] and fitted against measured targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Metric {
    Systolic,
    Diastolic,
    StrokeVolume,
}

impl Metric {
    /// Column name of the fitted metric in output tables, the target column adds `_target`
    pub fn column(&self) -> &'static str {
        match self {
            Metric::Systolic => "sys",
            Metric::Diastolic => "dia",
            Metric::StrokeVolume => "sv",
        }
    }
}
