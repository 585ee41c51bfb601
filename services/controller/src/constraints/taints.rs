//! Taints and tolerations.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::Incompatibility;

/// Taint effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

/// A taint on a node repelling pods that do not tolerate it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub effect: TaintEffect,
}

impl Taint {
    pub fn new(key: impl Into<String>, value: Option<&str>, effect: TaintEffect) -> Self {
        Self {
            key: key.into(),
            value: value.map(str::to_string),
            effect,
        }
    }
}

impl fmt::Display for Taint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "{}={}:{:?}", self.key, v, self.effect),
            None => write!(f, "{}:{:?}", self.key, self.effect),
        }
    }
}

/// Toleration operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TolerationOperator {
    Exists,
    Equal,
}

/// A pod's toleration of matching taints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Toleration {
    /// `None` with `Exists` tolerates every taint.
    pub key: Option<String>,
    pub operator: TolerationOperator,
    pub value: Option<String>,
    /// `None` matches every effect.
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    pub fn exists(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            operator: TolerationOperator::Exists,
            value: None,
            effect: None,
        }
    }

    pub fn equal(key: impl Into<String>, value: impl Into<String>, effect: TaintEffect) -> Self {
        Self {
            key: Some(key.into()),
            operator: TolerationOperator::Equal,
            value: Some(value.into()),
            effect: Some(effect),
        }
    }

    pub fn tolerates(&self, taint: &Taint) -> bool {
        if self.effect.is_some_and(|e| e != taint.effect) {
            return false;
        }

        match (&self.key, self.operator) {
            (None, TolerationOperator::Exists) => true,
            (None, TolerationOperator::Equal) => false,
            (Some(key), _) if *key != taint.key => false,
            (Some(_), TolerationOperator::Exists) => true,
            (Some(_), TolerationOperator::Equal) => self.value == taint.value,
        }
    }
}

/// Checks that every scheduling-relevant taint is tolerated.
///
/// `PreferNoSchedule` is a soft preference and never rejects.
pub fn check_taints(taints: &[Taint], tolerations: &[Toleration]) -> Result<(), Incompatibility> {
    let untolerated = taints
        .iter()
        .filter(|t| t.effect != TaintEffect::PreferNoSchedule)
        .find(|t| !tolerations.iter().any(|tol| tol.tolerates(t)));

    match untolerated {
        Some(taint) => Err(Incompatibility::Taint(taint.clone())),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untolerated_taint_rejects() {
        let taints = vec![Taint::new("gpu", Some("true"), TaintEffect::NoSchedule)];
        let err = check_taints(&taints, &[]).unwrap_err();
        assert!(matches!(err, Incompatibility::Taint(t) if t.key == "gpu"));
    }

    #[test]
    fn test_equal_toleration() {
        let taint = Taint::new("gpu", Some("true"), TaintEffect::NoSchedule);
        assert!(Toleration::equal("gpu", "true", TaintEffect::NoSchedule).tolerates(&taint));
        assert!(!Toleration::equal("gpu", "false", TaintEffect::NoSchedule).tolerates(&taint));
        assert!(!Toleration::equal("gpu", "true", TaintEffect::NoExecute).tolerates(&taint));
    }

    #[test]
    fn test_wildcard_toleration() {
        let wildcard = Toleration {
            key: None,
            operator: TolerationOperator::Exists,
            value: None,
            effect: None,
        };
        let taints = vec![
            Taint::new("a", None, TaintEffect::NoSchedule),
            Taint::new("b", Some("x"), TaintEffect::NoExecute),
        ];
        assert!(check_taints(&taints, &[wildcard]).is_ok());
    }

    #[test]
    fn test_prefer_no_schedule_ignored() {
        let taints = vec![Taint::new("spot", None, TaintEffect::PreferNoSchedule)];
        assert!(check_taints(&taints, &[]).is_ok());
    }
}
