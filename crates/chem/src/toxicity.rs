//! Acute oral toxicity estimation.
//!
//! The model is a deterministic log-linear fit over [`Descriptors`]. It gives a
//! reproducible screening estimate of rat oral LD50, not a regulatory value.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::descriptors::Descriptors;
use crate::error::ChemError;
use crate::smiles::parse_smiles;

/// A calculator that turns one SMILES string into a property map.
///
/// Implementations must be pure: the same input always yields the same output.
pub trait PropertyCalculator: Send + Sync + 'static {
    /// Short identifier recorded alongside results.
    fn name(&self) -> &str;

    fn calculate(&self, smiles: &str) -> Result<Map<String, Value>, ChemError>;
}

/// GHS acute oral toxicity category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GhsCategory {
    Category1,
    Category2,
    Category3,
    Category4,
    Category5,
    NotClassified,
}

impl GhsCategory {
    /// Classify an LD50 (mg/kg body weight).
    pub fn from_ld50(ld50_mg_per_kg: f64) -> Self {
        match ld50_mg_per_kg {
            v if v <= 5.0 => Self::Category1,
            v if v <= 50.0 => Self::Category2,
            v if v <= 300.0 => Self::Category3,
            v if v <= 2000.0 => Self::Category4,
            v if v <= 5000.0 => Self::Category5,
            _ => Self::NotClassified,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Category1 => "1",
            Self::Category2 => "2",
            Self::Category3 => "3",
            Self::Category4 => "4",
            Self::Category5 => "5",
            Self::NotClassified => "not classified",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToxicityPrediction {
    pub ld50_mg_per_kg: f64,
    pub ghs_category: GhsCategory,
}

/// Log-linear LD50 model.
#[derive(Debug, Clone)]
pub struct ToxicityModel {
    intercept: f64,
    logp_weight: f64,
    halogen_weight: f64,
    aromatic_weight: f64,
    weight_per_100_da: f64,
}

impl Default for ToxicityModel {
    fn default() -> Self {
        Self {
            intercept: 3.1,
            logp_weight: -0.18,
            halogen_weight: -0.14,
            aromatic_weight: -0.02,
            weight_per_100_da: 0.05,
        }
    }
}

impl ToxicityModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn predict(&self, d: &Descriptors) -> ToxicityPrediction {
        let log_ld50 = self.intercept
            + self.logp_weight * d.logp
            + self.halogen_weight * d.halogens as f64
            + self.aromatic_weight * d.aromatic_atoms as f64
            + self.weight_per_100_da * (d.molecular_weight - 200.0) / 100.0;
        // 1 mg/kg .. ~31.6 g/kg
        let ld50_mg_per_kg = 10f64.powf(log_ld50.clamp(0.0, 4.5));

        ToxicityPrediction {
            ld50_mg_per_kg,
            ghs_category: GhsCategory::from_ld50(ld50_mg_per_kg),
        }
    }
}

impl PropertyCalculator for ToxicityModel {
    fn name(&self) -> &str {
        "toxicity-loglinear-v1"
    }

    fn calculate(&self, smiles: &str) -> Result<Map<String, Value>, ChemError> {
        let molecule = parse_smiles(smiles)?;
        let descriptors = Descriptors::from_molecule(&molecule)?;
        let prediction = self.predict(&descriptors);

        if !prediction.ld50_mg_per_kg.is_finite() {
            return Err(ChemError::Calculation("non-finite LD50".to_string()));
        }

        let properties = json!({
            "LD50": round3(prediction.ld50_mg_per_kg),
            "LD50_units": "mg/kg",
            "GHS_category": prediction.ghs_category.label(),
            "molecular_weight": round3(descriptors.molecular_weight),
            "logP": round3(descriptors.logp),
            "heavy_atoms": descriptors.heavy_atoms,
        });

        match properties {
            Value::Object(map) => Ok(map),
            _ => Err(ChemError::Calculation("property map is not an object".to_string())),
        }
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ghs_thresholds_are_inclusive() {
        assert_eq!(GhsCategory::from_ld50(5.0), GhsCategory::Category1);
        assert_eq!(GhsCategory::from_ld50(5.1), GhsCategory::Category2);
        assert_eq!(GhsCategory::from_ld50(300.0), GhsCategory::Category3);
        assert_eq!(GhsCategory::from_ld50(2000.0), GhsCategory::Category4);
        assert_eq!(GhsCategory::from_ld50(5000.0), GhsCategory::Category5);
        assert_eq!(GhsCategory::from_ld50(5000.1), GhsCategory::NotClassified);
    }

    #[test]
    fn calculator_emits_ld50_property() {
        let model = ToxicityModel::new();
        let props = model.calculate("CC(=O)OC1=CC=CC=C1C(=O)O").unwrap();
        let ld50 = props["LD50"].as_f64().unwrap();
        assert!(ld50 > 1.0 && ld50 < 31_623.0);
        assert_eq!(props["LD50_units"], "mg/kg");
        assert!(props.contains_key("GHS_category"));
    }

    #[test]
    fn halogenation_lowers_predicted_ld50() {
        let model = ToxicityModel::new();
        let plain = model.calculate("CCCC").unwrap()["LD50"].as_f64().unwrap();
        let chlorinated = model.calculate("ClCC(Cl)CCl").unwrap()["LD50"].as_f64().unwrap();
        assert!(chlorinated < plain);
    }

    #[test]
    fn invalid_smiles_fails_only_that_molecule() {
        let model = ToxicityModel::new();
        assert!(matches!(
            model.calculate("C1CC"),
            Err(ChemError::InvalidSmiles { .. })
        ));
        assert!(model.calculate("CCO").is_ok());
    }

    proptest! {
        #[test]
        fn alkane_predictions_stay_in_model_range(n in 1usize..40) {
            let smiles = "C".repeat(n);
            let props = ToxicityModel::new().calculate(&smiles).unwrap();
            let ld50 = props["LD50"].as_f64().unwrap();
            prop_assert!((1.0..=31_623.0).contains(&ld50));
        }
    }
}
