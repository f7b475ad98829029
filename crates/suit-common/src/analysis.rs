//! Strongly-typed analysis parameters: factors, constraints and the job request.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AreaOfInterest, LayerId, SuitError, SuitResult};

/// Allowed deviation of the factor weight sum from 100.
pub const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

/// Normalization direction of a factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    HigherIsBetter,
    LowerIsBetter,
}

impl Direction {
    pub fn from_higher_is_better(flag: bool) -> Self {
        if flag {
            Direction::HigherIsBetter
        } else {
            Direction::LowerIsBetter
        }
    }
}

/// One weighted factor in the overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorSpec {
    pub layer: LayerId,
    /// Percentage weight; all factors of a job sum to 100.
    pub weight: f64,
    /// Falls back to the layer's `higher_is_better` flag when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    /// Normalization bounds overriding the layer's value range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<(f64, f64)>,
}

impl FactorSpec {
    pub fn new(layer: impl Into<String>, weight: f64) -> Self {
        Self {
            layer: LayerId::new(layer),
            weight,
            direction: None,
            domain: None,
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    pub fn with_domain(mut self, min: f64, max: f64) -> Self {
        self.domain = Some((min, max));
        self
    }
}

/// Comparison operator of a constraint rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum Comparison {
    Gt(f64),
    Lt(f64),
    Ge(f64),
    Le(f64),
    Eq(f64),
    InSet(Vec<f64>),
}

impl Comparison {
    /// Whether `value` satisfies the comparison.
    ///
    /// Equality tests use a small absolute epsilon since class codes
    /// arrive as floats after alignment.
    pub fn matches(&self, value: f64) -> bool {
        const EPS: f64 = 1e-6;
        match self {
            Comparison::Gt(t) => value > *t,
            Comparison::Lt(t) => value < *t,
            Comparison::Ge(t) => value >= *t,
            Comparison::Le(t) => value <= *t,
            Comparison::Eq(t) => (value - t).abs() < EPS,
            Comparison::InSet(set) => set.iter().any(|t| (value - t).abs() < EPS),
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparison::Gt(_) => ">",
            Comparison::Lt(_) => "<",
            Comparison::Ge(_) => ">=",
            Comparison::Le(_) => "<=",
            Comparison::Eq(_) => "==",
            Comparison::InSet(_) => "in",
        }
    }
}

/// Exclusion rule: cells where `layer <op> threshold` holds are excluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSpec {
    pub layer: LayerId,
    pub comparison: Comparison,
}

impl ConstraintSpec {
    pub fn new(layer: impl Into<String>, comparison: Comparison) -> Self {
        Self {
            layer: LayerId::new(layer),
            comparison,
        }
    }
}

/// Job descriptor delivered by the API layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: Uuid,
    pub project_id: Uuid,
    pub aoi: AreaOfInterest,
    pub factors: Vec<FactorSpec>,
    #[serde(default)]
    pub constraints: Vec<ConstraintSpec>,
}

impl JobRequest {
    pub fn new(aoi: AreaOfInterest, factors: Vec<FactorSpec>, constraints: Vec<ConstraintSpec>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            project_id: aoi.project_id,
            aoi,
            factors,
            constraints,
        }
    }

    /// Sum of factor weights.
    pub fn weight_sum(&self) -> f64 {
        self.factors.iter().map(|f| f.weight).sum()
    }

    /// Check the factor list shape: non-empty, non-negative weights summing to 100.
    pub fn validate_weights(&self) -> SuitResult<()> {
        if self.factors.is_empty() {
            return Err(SuitError::Validation("at least one factor is required".into()));
        }
        if let Some(f) = self
            .factors
            .iter()
            .find(|f| !f.weight.is_finite() || f.weight < 0.0)
        {
            return Err(SuitError::Validation(format!(
                "factor '{}' has invalid weight {}",
                f.layer, f.weight
            )));
        }
        let sum = self.weight_sum();
        if (sum - 100.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(SuitError::Validation(format!(
                "factor weights must sum to 100, got {}",
                sum
            )));
        }
        if let Some(f) = self
            .factors
            .iter()
            .find(|f| {
                matches!(f.domain, Some((lo, hi)) if !(lo.is_finite() && hi.is_finite() && lo < hi))
            })
        {
            return Err(SuitError::Validation(format!(
                "factor '{}' has an empty or unbounded normalization domain",
                f.layer
            )));
        }
        Ok(())
    }

    /// Every layer id referenced by factors and constraints, deduplicated, in first-use order.
    pub fn referenced_layers(&self) -> Vec<LayerId> {
        let mut layers: Vec<LayerId> = Vec::new();
        let ids = self
            .factors
            .iter()
            .map(|f| &f.layer)
            .chain(self.constraints.iter().map(|c| &c.layer));
        for id in ids {
            if !layers.contains(id) {
                layers.push(id.clone());
            }
        }
        layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoundingBox;

    fn request(weights: &[f64]) -> JobRequest {
        let aoi = AreaOfInterest::from_bbox(Uuid::nil(), &BoundingBox::new(0.0, 0.0, 0.1, 0.1));
        let factors = weights
            .iter()
            .enumerate()
            .map(|(i, w)| FactorSpec::new(format!("layer{}", i), *w))
            .collect();
        JobRequest::new(aoi, factors, Vec::new())
    }

    #[test]
    fn test_weight_sum_validation() {
        assert!(request(&[70.0, 30.0]).validate_weights().is_ok());
        assert!(request(&[70.0, 30.005]).validate_weights().is_ok());
        assert!(request(&[70.0, 29.0]).validate_weights().is_err());
        assert!(request(&[]).validate_weights().is_err());
        assert!(request(&[110.0, -10.0]).validate_weights().is_err());
    }

    #[test]
    fn test_inverted_domain_rejected() {
        let mut req = request(&[100.0]);
        req.factors[0] = req.factors[0].clone().with_domain(10.0, 0.0);
        assert!(matches!(req.validate_weights(), Err(SuitError::Validation(_))));
    }

    #[test]
    fn test_unbounded_domain_rejected() {
        let mut req = request(&[100.0]);
        req.factors[0] = req.factors[0].clone().with_domain(0.0, f64::INFINITY);
        assert!(matches!(req.validate_weights(), Err(SuitError::Validation(_))));
        req.factors[0] = req.factors[0].clone().with_domain(f64::NEG_INFINITY, 10.0);
        assert!(matches!(req.validate_weights(), Err(SuitError::Validation(_))));
        req.factors[0] = req.factors[0].clone().with_domain(f64::NAN, 10.0);
        assert!(matches!(req.validate_weights(), Err(SuitError::Validation(_))));
    }

    #[test]
    fn test_comparison_matches() {
        assert!(Comparison::Gt(15.0).matches(20.0));
        assert!(!Comparison::Gt(15.0).matches(15.0));
        assert!(Comparison::Ge(15.0).matches(15.0));
        assert!(Comparison::Lt(1.0).matches(0.5));
        assert!(Comparison::Le(1.0).matches(1.0));
        assert!(Comparison::Eq(50.0).matches(50.0));
        assert!(Comparison::InSet(vec![50.0, 80.0]).matches(80.0));
        assert!(!Comparison::InSet(vec![50.0, 80.0]).matches(40.0));
    }

    #[test]
    fn test_comparison_serde_shape() {
        let json = serde_json::to_string(&Comparison::InSet(vec![50.0, 80.0])).unwrap();
        assert_eq!(json, r#"{"op":"in_set","value":[50.0,80.0]}"#);
    }

    #[test]
    fn test_referenced_layers_dedup() {
        let mut req = request(&[70.0, 30.0]);
        req.constraints.push(ConstraintSpec::new("layer1", Comparison::Gt(15.0)));
        req.constraints.push(ConstraintSpec::new("lulc", Comparison::InSet(vec![50.0])));
        let ids: Vec<String> = req.referenced_layers().iter().map(|l| l.to_string()).collect();
        assert_eq!(ids, vec!["layer0", "layer1", "lulc"]);
    }
}
