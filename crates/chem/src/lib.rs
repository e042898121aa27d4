//! `molflow-chem`
//!
//! **Responsibility:** the chemistry property calculators that executions invoke.
//!
//! This crate is intentionally **not** aware of executions:
//! - It must not depend on the execution core.
//! - It performs no IO and keeps no state between calls.
//! - A bad input fails only the molecule it belongs to ([`ChemError`]).

pub mod descriptors;
pub mod error;
pub mod smiles;
pub mod toxicity;

pub use descriptors::Descriptors;
pub use error::ChemError;
pub use smiles::{parse_smiles, Atom, Bond, BondOrder, Molecule};
pub use toxicity::{GhsCategory, PropertyCalculator, ToxicityModel, ToxicityPrediction};
