use serde::{Deserialize, Serialize};

use crate::error::ChemError;
use crate::smiles::{atomic_weight, Molecule};

const HYDROGEN_WEIGHT: f64 = 1.008;

/// Whole-molecule descriptors used by the property models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptors {
    pub molecular_weight: f64,
    pub heavy_atoms: usize,
    pub hetero_atoms: usize,
    pub halogens: usize,
    pub rings: usize,
    pub aromatic_atoms: usize,
    pub hbond_donors: usize,
    pub hbond_acceptors: usize,
    /// Crude atom-contribution octanol/water partition coefficient.
    pub logp: f64,
}

impl Descriptors {
    pub fn from_molecule(mol: &Molecule) -> Result<Self, ChemError> {
        let mut molecular_weight = 0.0;
        let mut heavy_atoms = 0;
        let mut hetero_atoms = 0;
        let mut halogens = 0;
        let mut aromatic_atoms = 0;
        let mut hbond_donors = 0;
        let mut hbond_acceptors = 0;
        let mut logp = 0.0;

        for (idx, atom) in mol.atoms.iter().enumerate() {
            let weight = atomic_weight(atom.element)
                .ok_or_else(|| ChemError::UnknownElement(atom.element.to_string()))?;
            let hydrogens = mol.hydrogens(idx);
            molecular_weight += weight + f64::from(hydrogens) * HYDROGEN_WEIGHT;

            if atom.element != "H" {
                heavy_atoms += 1;
            }
            if !matches!(atom.element, "C" | "H") {
                hetero_atoms += 1;
            }
            if matches!(atom.element, "F" | "Cl" | "Br" | "I") {
                halogens += 1;
            }
            if atom.aromatic {
                aromatic_atoms += 1;
            }
            if matches!(atom.element, "N" | "O") {
                hbond_acceptors += 1;
                if hydrogens > 0 {
                    hbond_donors += 1;
                }
            }

            logp += atom_logp(atom.element, atom.aromatic, hydrogens, atom.charge);
        }

        Ok(Self {
            molecular_weight,
            heavy_atoms,
            hetero_atoms,
            halogens,
            rings: mol.ring_count(),
            aromatic_atoms,
            hbond_donors,
            hbond_acceptors,
            logp,
        })
    }
}

fn atom_logp(element: &str, aromatic: bool, hydrogens: u32, charge: i8) -> f64 {
    let base = match (element, aromatic) {
        ("C", true) => 0.29,
        ("C", false) => 0.14,
        ("N", _) => -0.75,
        ("O", _) => -0.55,
        ("S", _) => 0.25,
        ("P", _) => -0.2,
        ("F", _) => 0.38,
        ("Cl", _) => 0.68,
        ("Br", _) => 0.88,
        ("I", _) => 1.1,
        _ => 0.0,
    };
    let h = f64::from(hydrogens);
    let hydrogen_term = if element == "C" { 0.12 * h } else { -0.18 * h };
    base + hydrogen_term - 1.0 * f64::from(charge.unsigned_abs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smiles::parse_smiles;

    fn describe(smiles: &str) -> Descriptors {
        Descriptors::from_molecule(&parse_smiles(smiles).unwrap()).unwrap()
    }

    #[test]
    fn molecular_weights_match_reference_values() {
        for (smiles, expected) in [
            ("CCO", 46.069),
            ("c1ccccc1", 78.114),
            ("CC(=O)OC1=CC=CC=C1C(=O)O", 180.159),
            ("[Na+].[Cl-]", 58.44),
        ] {
            let d = describe(smiles);
            assert!(
                (d.molecular_weight - expected).abs() < 0.05,
                "{smiles}: {} vs {expected}",
                d.molecular_weight
            );
        }
    }

    #[test]
    fn counts_heteroatoms_halogens_and_hbonding() {
        let d = describe("OC(Cl)(Cl)C(F)(F)F");
        assert_eq!(d.heavy_atoms, 8);
        assert_eq!(d.hetero_atoms, 6);
        assert_eq!(d.halogens, 5);
        assert_eq!(d.hbond_donors, 1);
        assert_eq!(d.hbond_acceptors, 1);
    }

    #[test]
    fn aromatic_rings_are_more_lipophilic_than_alcohols() {
        assert!(describe("c1ccccc1").logp > describe("CCO").logp);
        assert_eq!(describe("c1ccc2ccccc2c1").rings, 2);
    }
}
