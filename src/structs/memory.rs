use std::collections::BTreeMap;

use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use super::record::Record;
use crate::simulator::ModelInputs;

/// Scaling parameters carried from one record to the next
pub const TRACKED: [&str; 4] = [
    "generic_params.e_scale",
    "generic_params.v_scale",
    "generic_params.r_scale",
    "generic_params.c_scale",
];

/// Neutral value every tracked parameter relaxes toward
pub const NEUTRAL: f64 = 1.0;

/// Subject and condition of a record
#[derive(Debug, Clone, PartialEq)]
pub struct GroupKey {
    pub subject: Value,
    pub condition: Value,
}

/// When two consecutive records belong to different groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    /// Both the subject and the condition changed
    #[default]
    Both,
    /// Either the subject or the condition changed
    Either,
}

impl GroupPolicy {
    pub fn is_new_group(&self, previous: Option<&GroupKey>, next: &GroupKey) -> bool {
        let Some(previous) = previous else {
            return true;
        };
        let subject = previous.subject != next.subject;
        let condition = previous.condition != next.condition;
        match self {
            GroupPolicy::Both => subject && condition,
            GroupPolicy::Either => subject || condition,
        }
    }
}

/// What [ParameterMemory::carry_over] did with a record
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CarryOver {
    Reset,
    Advanced { dt: f64 },
}

/// Blending weight of the previous value after `dt` seconds
///
/// One at 60 s, one half at 300 s and below one percent after half an hour. Capped at one so a
/// shorter gap never amplifies a deviation.
pub fn decay(dt: f64) -> f64 {
    (-std::f64::consts::LN_2 / 4.0 * (dt / 60.0 - 1.0)).exp().min(1.0)
}

/// Best-fit scaling parameters of the current subject group
#[derive(Debug, Clone)]
pub struct ParameterMemory {
    values: BTreeMap<String, f64>,
    bounds: BTreeMap<String, (f64, f64)>,
    group: Option<GroupKey>,
    last_t: f64,
}

impl ParameterMemory {
    /// A memory over `bounds`, every parameter starting at [NEUTRAL]
    pub fn new<I, S>(bounds: I) -> Self
    where
        I: IntoIterator<Item = (S, (f64, f64))>,
        S: Into<String>,
    {
        let bounds: BTreeMap<String, (f64, f64)> =
            bounds.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let values = bounds
            .iter()
            .map(|(k, &(lo, hi))| (k.clone(), NEUTRAL.clamp(lo, hi)))
            .collect();
        Self {
            values,
            bounds,
            group: None,
            last_t: 0.0,
        }
    }

    /// Start a new group at time `t`
    pub fn reset(&mut self, subject: Value, condition: Value, t: f64) {
        for (name, value) in self.values.iter_mut() {
            let (lo, hi) = self.bounds[name];
            *value = NEUTRAL.clamp(lo, hi);
        }
        self.group = Some(GroupKey { subject, condition });
        self.last_t = t;
    }

    /// Relax every parameter toward [NEUTRAL] after `dt` seconds
    pub fn advance(&mut self, dt: f64) {
        let w = decay(dt);
        for (name, value) in self.values.iter_mut() {
            let (lo, hi) = self.bounds[name];
            *value = (w * *value + (1.0 - w) * NEUTRAL).clamp(lo, hi);
        }
    }

    /// Overwrite tracked parameters from a fit, restricted to `subset` when given
    ///
    /// Paths that are not tracked are ignored.
    pub fn commit<'a, I>(&mut self, values: I, subset: Option<&[&str]>)
    where
        I: IntoIterator<Item = (&'a String, &'a f64)>,
    {
        for (name, &value) in values {
            if let Some(subset) = subset {
                if !subset.contains(&name.as_str()) {
                    continue;
                }
            }
            if let (Some(slot), Some(&(lo, hi))) = (self.values.get_mut(name), self.bounds.get(name))
            {
                *slot = value.clamp(lo, hi);
            }
        }
    }

    /// Prepare the memory for `record`
    pub fn carry_over(&mut self, record: &Record, policy: GroupPolicy) -> CarryOver {
        let key = GroupKey {
            subject: record.id.clone(),
            condition: record.condition.clone(),
        };
        if policy.is_new_group(self.group.as_ref(), &key) {
            self.reset(key.subject, key.condition, record.t);
            return CarryOver::Reset;
        }
        let dt = record.t - self.last_t;
        self.advance(dt);
        self.group = Some(key);
        self.last_t = record.t;
        CarryOver::Advanced { dt }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn bounds(&self, name: &str) -> Option<(f64, f64)> {
        self.bounds.get(name).copied()
    }

    pub fn values(&self) -> &BTreeMap<String, f64> {
        &self.values
    }

    pub fn group(&self) -> Option<&GroupKey> {
        self.group.as_ref()
    }

    /// Copy the remembered values into `inputs`
    pub fn apply(&self, inputs: &mut ModelInputs) -> Result<(), crate::simulator::SimulationError> {
        for (name, value) in &self.values {
            inputs.set(name, *value)?;
        }
        Ok(())
    }
}
