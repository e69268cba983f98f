//! Node placement inputs: selectors and tolerations
//!
//! Selectors are `key=value`. Tolerations are `key=value:effect` (operator
//! `Equal`) or `key:effect` (operator `Exists`, any value). No toleration
//! input at all means "tolerate every taint", so placement is driven by the
//! selector alone unless the caller opts into stricter scheduling.

use k8s_openapi::api::core::v1::Toleration;
use std::collections::BTreeMap;

const EFFECTS: &[&str] = &["NoSchedule", "PreferNoSchedule", "NoExecute"];

/// Errors from parsing placement inputs
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlacementError {
    #[error("invalid node selector '{0}', expected key=value")]
    InvalidSelector(String),

    #[error("invalid toleration '{0}', expected key=value:effect or key:effect")]
    InvalidToleration(String),

    #[error("invalid taint effect '{effect}' in '{input}', expected one of NoSchedule, PreferNoSchedule, NoExecute")]
    InvalidEffect { input: String, effect: String },
}

/// Toleration matching every taint
pub fn tolerate_all() -> Toleration {
    Toleration {
        operator: Some("Exists".to_string()),
        ..Default::default()
    }
}

/// Parse `key=value` node selector entries
pub fn parse_node_selectors<S: AsRef<str>>(
    inputs: &[S],
) -> Result<BTreeMap<String, String>, PlacementError> {
    let mut selector = BTreeMap::new();
    for input in inputs {
        let input = input.as_ref().trim();
        let (key, value) = input
            .split_once('=')
            .ok_or_else(|| PlacementError::InvalidSelector(input.to_string()))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(PlacementError::InvalidSelector(input.to_string()));
        }
        selector.insert(key.to_string(), value.trim().to_string());
    }
    Ok(selector)
}

/// Parse toleration entries; an empty list tolerates every taint
pub fn parse_tolerations<S: AsRef<str>>(inputs: &[S]) -> Result<Vec<Toleration>, PlacementError> {
    if inputs.is_empty() {
        return Ok(vec![tolerate_all()]);
    }
    inputs.iter().map(|i| parse_toleration(i.as_ref())).collect()
}

fn parse_toleration(input: &str) -> Result<Toleration, PlacementError> {
    let input = input.trim();
    let invalid = || PlacementError::InvalidToleration(input.to_string());

    let (selector, effect) = input.rsplit_once(':').ok_or_else(invalid)?;
    let effect = effect.trim();
    if !EFFECTS.contains(&effect) {
        return Err(PlacementError::InvalidEffect {
            input: input.to_string(),
            effect: effect.to_string(),
        });
    }

    let (key, operator, value) = match selector.split_once('=') {
        Some((key, value)) => (key.trim(), "Equal", Some(value.trim().to_string())),
        None => (selector.trim(), "Exists", None),
    };
    if key.is_empty() {
        return Err(invalid());
    }

    Ok(Toleration {
        key: Some(key.to_string()),
        operator: Some(operator.to_string()),
        value,
        effect: Some(effect.to_string()),
        ..Default::default()
    })
}
