//! Label requirements.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::Incompatibility;

/// Labels on a node or pod.
pub type Labels = BTreeMap<String, String>;

/// A requirement operator and its operands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "operator", content = "values", rename_all = "snake_case")]
pub enum Operator {
    In(BTreeSet<String>),
    NotIn(BTreeSet<String>),
    Exists,
    DoesNotExist,
    Gt(i64),
    Lt(i64),
}

/// A single predicate over one label key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
}

fn value_set<I, S>(values: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    values.into_iter().map(Into::into).collect()
}

impl Requirement {
    pub fn new(key: impl Into<String>, operator: Operator) -> Self {
        Self {
            key: key.into(),
            operator,
        }
    }

    pub fn in_values<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(key, Operator::In(value_set(values)))
    }

    pub fn not_in<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(key, Operator::NotIn(value_set(values)))
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Self::new(key, Operator::Exists)
    }

    pub fn does_not_exist(key: impl Into<String>) -> Self {
        Self::new(key, Operator::DoesNotExist)
    }

    pub fn gt(key: impl Into<String>, bound: i64) -> Self {
        Self::new(key, Operator::Gt(bound))
    }

    pub fn lt(key: impl Into<String>, bound: i64) -> Self {
        Self::new(key, Operator::Lt(bound))
    }

    /// Evaluates the requirement against the value of its key, if any.
    pub fn allows(&self, value: Option<&str>) -> bool {
        match (&self.operator, value) {
            (Operator::In(values), Some(v)) => values.contains(v),
            (Operator::In(_), None) => false,
            (Operator::NotIn(values), Some(v)) => !values.contains(v),
            (Operator::NotIn(_), None) => true,
            (Operator::Exists, v) => v.is_some(),
            (Operator::DoesNotExist, v) => v.is_none(),
            (Operator::Gt(bound), Some(v)) => v.parse::<i64>().is_ok_and(|n| n > *bound),
            (Operator::Lt(bound), Some(v)) => v.parse::<i64>().is_ok_and(|n| n < *bound),
            (Operator::Gt(_) | Operator::Lt(_), None) => false,
        }
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.allows(labels.get(&self.key).map(String::as_str))
    }

    /// Returns true if some label value (or its absence) satisfies both
    /// requirements. Only meaningful for requirements on the same key.
    pub fn intersects(&self, other: &Requirement) -> bool {
        use Operator::*;

        match (&self.operator, &other.operator) {
            (In(values), _) => values.iter().any(|v| other.allows(Some(v))),
            (_, In(values)) => values.iter().any(|v| self.allows(Some(v))),
            (DoesNotExist, DoesNotExist | NotIn(_)) | (NotIn(_), DoesNotExist) => true,
            (DoesNotExist, _) | (_, DoesNotExist) => false,
            (Gt(low), Lt(high)) | (Lt(high), Gt(low)) => (*high as i128) - (*low as i128) > 1,
            // Remaining pairs leave infinitely many values open.
            _ => true,
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |values: &BTreeSet<String>| values.iter().cloned().collect::<Vec<_>>().join(",");
        match &self.operator {
            Operator::In(values) => write!(f, "{} in [{}]", self.key, join(values)),
            Operator::NotIn(values) => write!(f, "{} not in [{}]", self.key, join(values)),
            Operator::Exists => write!(f, "{} exists", self.key),
            Operator::DoesNotExist => write!(f, "{} does not exist", self.key),
            Operator::Gt(bound) => write!(f, "{} > {}", self.key, bound),
            Operator::Lt(bound) => write!(f, "{} < {}", self.key, bound),
        }
    }
}

/// A conjunction of requirements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Requirements(Vec<Requirement>);

impl Requirements {
    pub fn new(requirements: Vec<Requirement>) -> Self {
        Self(requirements)
    }

    /// Exact-match requirements for every label.
    pub fn from_labels(labels: &Labels) -> Self {
        Self(
            labels
                .iter()
                .map(|(k, v)| Requirement::in_values(k.clone(), [v.clone()]))
                .collect(),
        )
    }

    pub fn push(&mut self, requirement: Requirement) {
        self.0.push(requirement);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Requirement> {
        self.0.iter()
    }

    /// Checks every requirement against concrete labels.
    pub fn matches(&self, labels: &Labels) -> Result<(), Incompatibility> {
        match self.0.iter().find(|r| !r.matches(labels)) {
            Some(r) => Err(Incompatibility::Requirement(r.clone())),
            None => Ok(()),
        }
    }

    /// Returns true if every requirement on `key` accepts `value`.
    pub fn allows(&self, key: &str, value: Option<&str>) -> bool {
        self.0
            .iter()
            .filter(|r| r.key == key)
            .all(|r| r.allows(value))
    }

    /// Checks that both sets can be satisfied by the same labels.
    ///
    /// Requirements are compared pairwise per key, so a contradiction
    /// spread over three or more requirements on one key may go unnoticed
    /// until the concrete label check.
    pub fn compatible(&self, other: &Requirements) -> Result<(), Incompatibility> {
        for mine in &self.0 {
            if let Some(theirs) = other
                .0
                .iter()
                .find(|r| r.key == mine.key && !mine.intersects(r))
            {
                return Err(Incompatibility::Requirement(theirs.clone()));
            }
        }
        Ok(())
    }
}

impl FromIterator<Requirement> for Requirements {
    fn from_iter<T: IntoIterator<Item = Requirement>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[rstest]
    #[case(Requirement::in_values("zone", ["a", "b"]), Some("a"), true)]
    #[case(Requirement::in_values("zone", ["a", "b"]), None, false)]
    #[case(Requirement::not_in("zone", ["a"]), None, true)]
    #[case(Requirement::not_in("zone", ["a"]), Some("a"), false)]
    #[case(Requirement::exists("gpu"), Some("x"), true)]
    #[case(Requirement::does_not_exist("gpu"), Some("x"), false)]
    #[case(Requirement::gt("generation", 5), Some("6"), true)]
    #[case(Requirement::gt("generation", 5), Some("five"), false)]
    #[case(Requirement::lt("generation", 5), Some("4"), true)]
    #[case(Requirement::lt("generation", 5), None, false)]
    fn test_allows(#[case] req: Requirement, #[case] value: Option<&str>, #[case] expected: bool) {
        assert_eq!(req.allows(value), expected);
    }

    #[rstest]
    #[case(Requirement::in_values("k", ["a"]), Requirement::in_values("k", ["a", "b"]), true)]
    #[case(Requirement::in_values("k", ["a"]), Requirement::not_in("k", ["a"]), false)]
    #[case(Requirement::exists("k"), Requirement::does_not_exist("k"), false)]
    #[case(Requirement::not_in("k", ["a"]), Requirement::does_not_exist("k"), true)]
    #[case(Requirement::gt("k", 3), Requirement::lt("k", 5), true)]
    #[case(Requirement::gt("k", 3), Requirement::lt("k", 4), false)]
    #[case(Requirement::gt("k", 3), Requirement::in_values("k", ["2"]), false)]
    fn test_intersects(#[case] a: Requirement, #[case] b: Requirement, #[case] expected: bool) {
        assert_eq!(a.intersects(&b), expected);
        assert_eq!(b.intersects(&a), expected);
    }

    #[test]
    fn test_matches_reports_failing_requirement() {
        let reqs = Requirements::new(vec![
            Requirement::exists("zone"),
            Requirement::in_values("arch", ["arm64"]),
        ]);
        let err = reqs
            .matches(&labels(&[("zone", "a"), ("arch", "amd64")]))
            .unwrap_err();
        assert_eq!(
            err,
            Incompatibility::Requirement(Requirement::in_values("arch", ["arm64"]))
        );
    }

    #[test]
    fn test_compatible() {
        let pool = Requirements::new(vec![Requirement::in_values("zone", ["a", "b"])]);
        let pod_ok = Requirements::new(vec![Requirement::in_values("zone", ["b", "c"])]);
        let pod_bad = Requirements::new(vec![Requirement::in_values("zone", ["c"])]);

        assert!(pool.compatible(&pod_ok).is_ok());
        assert!(pool.compatible(&pod_bad).is_err());
        assert!(pool.compatible(&Requirements::default()).is_ok());
    }

    #[test]
    fn test_display() {
        let req = Requirement::in_values("zone", ["b", "a"]);
        assert_eq!(req.to_string(), "zone in [a,b]");
    }
}
