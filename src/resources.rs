//! Resource vectors: named non-negative scalars.
//!
//! The same type represents both resources available on an agent and
//! resources required by a job. An agent "fits" a job iff every requested
//! component is at most the agent's available component.

use std::collections::BTreeMap;

use crate::error::{GridError, Result};
use crate::proto;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Resources(BTreeMap<String, f64>);

impl Resources {
    pub fn new(values: impl IntoIterator<Item = (String, f64)>) -> Result<Self> {
        let map: BTreeMap<String, f64> = values.into_iter().collect();
        for (name, value) in &map {
            if !value.is_finite() || *value < 0.0 {
                return Err(GridError::InvalidJob(format!(
                    "resource {name} has non-finite or negative value {value}"
                )));
            }
        }
        Ok(Self(map))
    }

    pub fn from_proto(resources: &[proto::Resource]) -> Result<Self> {
        Self::new(resources.iter().map(|r| (r.name.clone(), r.value)))
    }

    pub fn to_proto(&self) -> Vec<proto::Resource> {
        self.0
            .iter()
            .map(|(name, value)| proto::Resource {
                name: name.clone(),
                value: *value,
            })
            .collect()
    }

    pub fn get(&self, name: &str) -> f64 {
        self.0.get(name).copied().unwrap_or(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(name, value)| (name.as_str(), *value))
    }

    /// True iff every component of `required` is available in `self`.
    pub fn fits(&self, required: &Resources) -> bool {
        required.0.iter().all(|(name, value)| self.get(name) >= *value)
    }

    /// Subtracts "resources required" from self, interpreted as "resources
    /// available". Returns None if the requirement does not fit.
    pub fn subtract(&self, required: &Resources) -> Option<Resources> {
        if !self.fits(required) {
            return None;
        }
        let mut result = self.0.clone();
        for (name, value) in &required.0 {
            *result.entry(name.clone()).or_insert(0.0) -= value;
        }
        Some(Resources(result))
    }

    /// Adds back "resources required" to self.
    pub fn add(&self, returned: &Resources) -> Resources {
        let mut result = self.0.clone();
        for (name, value) in &returned.0 {
            *result.entry(name.clone()).or_insert(0.0) += value;
        }
        Resources(result)
    }

    /// Total of the components, used to order agents tightest-fit-first.
    pub fn magnitude(&self) -> f64 {
        self.0.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(pairs: &[(&str, f64)]) -> Resources {
        Resources::new(pairs.iter().map(|(n, v)| (n.to_string(), *v))).unwrap()
    }

    #[test]
    fn subtract_fails_when_component_missing() {
        let available = res(&[("cpu", 4.0)]);
        let required = res(&[("cpu", 2.0), ("gpu", 1.0)]);
        assert!(available.subtract(&required).is_none());
    }

    #[test]
    fn subtract_then_add_round_trips() {
        let available = res(&[("cpu", 4.0), ("memory", 16.0)]);
        let required = res(&[("cpu", 2.0), ("memory", 8.0)]);
        let remaining = available.subtract(&required).unwrap();
        assert_eq!(remaining.get("cpu"), 2.0);
        assert_eq!(remaining.add(&required), available);
    }

    #[test]
    fn zero_requirement_always_fits() {
        let available = res(&[]);
        let required = res(&[("cpu", 0.0)]);
        assert!(available.fits(&required));
    }

    #[test]
    fn negative_values_rejected() {
        assert!(Resources::new([("cpu".to_string(), -1.0)]).is_err());
        assert!(Resources::new([("cpu".to_string(), f64::NAN)]).is_err());
    }
}
