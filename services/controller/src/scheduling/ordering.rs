//! Comparing candidate sets of new nodes.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prices closer than this are considered equal.
const PRICE_EPSILON: f64 = 1e-9;

/// How two candidate sets of new nodes are ranked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProposalOrdering {
    /// Fewest nodes, then lowest aggregate price.
    #[default]
    CountThenPrice,
    /// Lowest aggregate price, then fewest nodes.
    PriceThenCount,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown proposal ordering {0:?}, expected count-then-price or price-then-count")]
pub struct UnknownOrdering(String);

impl ProposalOrdering {
    /// Compare `(node count, total price)` pairs. `Less` means `a` is
    /// preferred.
    pub fn compare(&self, a: (usize, f64), b: (usize, f64)) -> Ordering {
        let count = a.0.cmp(&b.0);
        let price = compare_price(a.1, b.1);
        match self {
            ProposalOrdering::CountThenPrice => count.then(price),
            ProposalOrdering::PriceThenCount => price.then(count),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalOrdering::CountThenPrice => "count-then-price",
            ProposalOrdering::PriceThenCount => "price-then-count",
        }
    }
}

fn compare_price(a: f64, b: f64) -> Ordering {
    if (a - b).abs() < PRICE_EPSILON {
        Ordering::Equal
    } else {
        a.total_cmp(&b)
    }
}

impl FromStr for ProposalOrdering {
    type Err = UnknownOrdering;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "count-then-price" => Ok(ProposalOrdering::CountThenPrice),
            "price-then-count" => Ok(ProposalOrdering::PriceThenCount),
            _ => Err(UnknownOrdering(s.to_string())),
        }
    }
}

impl fmt::Display for ProposalOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ProposalOrdering::CountThenPrice, (2, 1.0), (3, 0.5), Ordering::Less)]
    #[case(ProposalOrdering::PriceThenCount, (2, 1.0), (3, 0.5), Ordering::Greater)]
    #[case(ProposalOrdering::CountThenPrice, (3, 0.9), (3, 1.05), Ordering::Less)]
    #[case(ProposalOrdering::PriceThenCount, (2, 0.9), (3, 0.9), Ordering::Less)]
    fn test_compare(
        #[case] ordering: ProposalOrdering,
        #[case] a: (usize, f64),
        #[case] b: (usize, f64),
        #[case] expected: Ordering,
    ) {
        assert_eq!(ordering.compare(a, b), expected);
    }

    #[test]
    fn test_float_noise_is_a_tie() {
        let a = 0.1 + 0.2;
        assert_eq!(
            ProposalOrdering::CountThenPrice.compare((1, a), (1, 0.3)),
            Ordering::Equal
        );
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            "price-then-count".parse::<ProposalOrdering>().unwrap(),
            ProposalOrdering::PriceThenCount
        );
        assert_eq!(
            " Count-Then-Price ".parse::<ProposalOrdering>().unwrap(),
            ProposalOrdering::CountThenPrice
        );
        assert!("cheapest".parse::<ProposalOrdering>().is_err());
    }
}
