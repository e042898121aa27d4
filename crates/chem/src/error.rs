use thiserror::Error;

/// Failure to compute properties for a single molecule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChemError {
    #[error("invalid SMILES at position {position}: {reason}")]
    InvalidSmiles { position: usize, reason: String },

    #[error("unknown element: {0}")]
    UnknownElement(String),

    #[error("property calculation failed: {0}")]
    Calculation(String),
}

impl ChemError {
    pub(crate) fn syntax(position: usize, reason: impl Into<String>) -> Self {
        Self::InvalidSmiles {
            position,
            reason: reason.into(),
        }
    }
}
