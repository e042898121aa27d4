//! Minimal SMILES reader.
//!
//! Supports the organic subset, bracket atoms (isotope, chirality, hydrogen
//! count, charge, atom class), aromatic atoms, explicit bonds, branches, ring
//! closures (`1`-`9` and `%nn`) and disconnected components (`.`).
//! Stereo bond markers (`/`, `\`) are read as single bonds.

use std::collections::HashMap;

use crate::error::ChemError;

/// Bond multiplicity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondOrder {
    Single,
    Double,
    Triple,
    Quadruple,
    Aromatic,
}

impl BondOrder {
    /// Contribution to an atom's valence; aromatic bonds count as 1.5.
    pub fn valence(self) -> f64 {
        match self {
            BondOrder::Single => 1.0,
            BondOrder::Double => 2.0,
            BondOrder::Triple => 3.0,
            BondOrder::Quadruple => 4.0,
            BondOrder::Aromatic => 1.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Atom {
    /// Element symbol with canonical capitalisation (`"C"`, `"Cl"`, `"Se"`).
    pub element: &'static str,
    pub aromatic: bool,
    /// Written in brackets: hydrogens are explicit, no implicit ones are added.
    pub bracket: bool,
    /// Hydrogen count from a bracket atom (`[NH4+]` -> 4).
    pub explicit_hydrogens: u8,
    pub charge: i8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bond {
    pub from: usize,
    pub to: usize,
    pub order: BondOrder,
}

/// Parsed molecular graph.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Molecule {
    pub atoms: Vec<Atom>,
    pub bonds: Vec<Bond>,
    /// Number of disconnected components (salts, mixtures).
    pub components: usize,
}

impl Molecule {
    /// Sum of bond valences touching `atom`.
    pub fn bond_valence(&self, atom: usize) -> f64 {
        self.bonds
            .iter()
            .filter(|b| b.from == atom || b.to == atom)
            .map(|b| b.order.valence())
            .sum()
    }

    /// Total hydrogens on `atom` (explicit for bracket atoms, implicit otherwise).
    pub fn hydrogens(&self, atom: usize) -> u32 {
        let a = &self.atoms[atom];
        if a.bracket {
            return u32::from(a.explicit_hydrogens);
        }
        let used = self.bond_valence(atom).floor() as u32;
        default_valences(a.element)
            .iter()
            .find(|&&v| v >= used)
            .map(|&v| v - used)
            .unwrap_or(0)
    }

    /// Independent cycles in the graph (edges - vertices + components).
    pub fn ring_count(&self) -> usize {
        (self.bonds.len() + self.components).saturating_sub(self.atoms.len())
    }
}

/// Element symbol, standard atomic weight.
const ELEMENTS: &[(&str, f64)] = &[
    ("H", 1.008),
    ("Li", 6.94),
    ("B", 10.81),
    ("C", 12.011),
    ("N", 14.007),
    ("O", 15.999),
    ("F", 18.998),
    ("Na", 22.990),
    ("Mg", 24.305),
    ("Al", 26.982),
    ("Si", 28.085),
    ("P", 30.974),
    ("S", 32.06),
    ("Cl", 35.45),
    ("K", 39.098),
    ("Ca", 40.078),
    ("Fe", 55.845),
    ("Cu", 63.546),
    ("Zn", 65.38),
    ("As", 74.922),
    ("Se", 78.971),
    ("Br", 79.904),
    ("Sn", 118.71),
    ("I", 126.904),
    ("Pt", 195.084),
    ("Hg", 200.592),
];

/// Atomic weight of a known element.
pub fn atomic_weight(element: &str) -> Option<f64> {
    ELEMENTS
        .iter()
        .find(|(symbol, _)| *symbol == element)
        .map(|(_, weight)| *weight)
}

/// Largest formal charge accepted on a bracket atom.
const MAX_CHARGE: i8 = 15;

fn canonical_element(symbol: &str) -> Option<&'static str> {
    ELEMENTS
        .iter()
        .find(|(s, _)| *s == symbol)
        .map(|(s, _)| *s)
}

fn default_valences(element: &str) -> &'static [u32] {
    match element {
        "B" => &[3],
        "C" => &[4],
        "N" => &[3, 5],
        "O" => &[2],
        "P" => &[3, 5],
        "S" => &[2, 4, 6],
        "F" | "Cl" | "Br" | "I" => &[1],
        _ => &[],
    }
}

/// Parse a SMILES string into a [`Molecule`].
pub fn parse_smiles(input: &str) -> Result<Molecule, ChemError> {
    Parser::new(input).parse()
}

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    input: &'a str,
    mol: Molecule,
    prev: Option<usize>,
    pending_bond: Option<BondOrder>,
    branches: Vec<Option<usize>>,
    open_rings: HashMap<u32, (usize, Option<BondOrder>)>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
            input,
            mol: Molecule::default(),
            prev: None,
            pending_bond: None,
            branches: Vec::new(),
            open_rings: HashMap::new(),
        }
    }

    fn parse(mut self) -> Result<Molecule, ChemError> {
        if self.input.trim().is_empty() {
            return Err(ChemError::syntax(0, "empty SMILES"));
        }
        self.mol.components = 1;

        while let Some(c) = self.peek() {
            match c {
                '(' => {
                    if self.prev.is_none() {
                        return Err(ChemError::syntax(self.pos, "branch without a preceding atom"));
                    }
                    self.branches.push(self.prev);
                    self.pos += 1;
                }
                ')' => {
                    if self.pending_bond.is_some() {
                        return Err(ChemError::syntax(self.pos, "bond before ')'"));
                    }
                    self.prev = self
                        .branches
                        .pop()
                        .ok_or_else(|| ChemError::syntax(self.pos, "unbalanced ')'"))?;
                    self.pos += 1;
                }
                '-' | '=' | '#' | '$' | ':' | '/' | '\\' => {
                    if self.prev.is_none() || self.pending_bond.is_some() {
                        return Err(ChemError::syntax(self.pos, format!("unexpected bond '{c}'")));
                    }
                    self.pending_bond = Some(match c {
                        '=' => BondOrder::Double,
                        '#' => BondOrder::Triple,
                        '$' => BondOrder::Quadruple,
                        ':' => BondOrder::Aromatic,
                        _ => BondOrder::Single,
                    });
                    self.pos += 1;
                }
                '.' => {
                    if self.prev.is_none() || self.pending_bond.is_some() {
                        return Err(ChemError::syntax(self.pos, "unexpected '.'"));
                    }
                    self.prev = None;
                    self.mol.components += 1;
                    self.pos += 1;
                }
                '%' | '0'..='9' => self.ring_closure()?,
                '[' => {
                    let atom = self.bracket_atom()?;
                    self.add_atom(atom);
                }
                _ => {
                    let atom = self.organic_atom()?;
                    self.add_atom(atom);
                }
            }
        }

        if self.pending_bond.is_some() {
            return Err(ChemError::syntax(self.pos, "dangling bond"));
        }
        if self.prev.is_none() {
            return Err(ChemError::syntax(self.pos, "trailing '.'"));
        }
        if !self.branches.is_empty() {
            return Err(ChemError::syntax(self.pos, "unbalanced '('"));
        }
        if let Some(ring) = self.open_rings.keys().min() {
            return Err(ChemError::syntax(self.pos, format!("ring {ring} is not closed")));
        }
        Ok(self.mol)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn add_atom(&mut self, atom: Atom) {
        let idx = self.mol.atoms.len();
        self.mol.atoms.push(atom);
        if let Some(prev) = self.prev {
            let order = self
                .pending_bond
                .take()
                .unwrap_or_else(|| self.implicit_bond(prev, idx));
            self.mol.bonds.push(Bond {
                from: prev,
                to: idx,
                order,
            });
        }
        self.prev = Some(idx);
    }

    fn implicit_bond(&self, a: usize, b: usize) -> BondOrder {
        if self.mol.atoms[a].aromatic && self.mol.atoms[b].aromatic {
            BondOrder::Aromatic
        } else {
            BondOrder::Single
        }
    }

    fn ring_closure(&mut self) -> Result<(), ChemError> {
        let start = self.pos;
        let Some(atom) = self.prev else {
            return Err(ChemError::syntax(start, "ring closure without a preceding atom"));
        };

        let number = if self.peek() == Some('%') {
            let digits: String = self.chars[self.pos + 1..].iter().take(2).collect();
            if digits.len() != 2 || !digits.chars().all(|d| d.is_ascii_digit()) {
                return Err(ChemError::syntax(start, "'%' must be followed by two digits"));
            }
            self.pos += 3;
            digits.parse::<u32>().unwrap_or_default()
        } else {
            let digit = self.peek().and_then(|d| d.to_digit(10)).unwrap_or_default();
            self.pos += 1;
            digit
        };

        let bond = self.pending_bond.take();
        match self.open_rings.remove(&number) {
            Some((other, opening_bond)) => {
                if other == atom {
                    return Err(ChemError::syntax(start, "ring closure onto the same atom"));
                }
                let order = bond
                    .or(opening_bond)
                    .unwrap_or_else(|| self.implicit_bond(other, atom));
                self.mol.bonds.push(Bond {
                    from: other,
                    to: atom,
                    order,
                });
            }
            None => {
                self.open_rings.insert(number, (atom, bond));
            }
        }
        Ok(())
    }

    fn organic_atom(&mut self) -> Result<Atom, ChemError> {
        let start = self.pos;
        let c = self.peek().unwrap_or_default();
        let next = self.chars.get(self.pos + 1).copied();

        let (element, aromatic, width) = match (c, next) {
            ('C', Some('l')) => ("Cl", false, 2),
            ('B', Some('r')) => ("Br", false, 2),
            ('B', _) => ("B", false, 1),
            ('C', _) => ("C", false, 1),
            ('N', _) => ("N", false, 1),
            ('O', _) => ("O", false, 1),
            ('P', _) => ("P", false, 1),
            ('S', _) => ("S", false, 1),
            ('F', _) => ("F", false, 1),
            ('I', _) => ("I", false, 1),
            ('b', _) => ("B", true, 1),
            ('c', _) => ("C", true, 1),
            ('n', _) => ("N", true, 1),
            ('o', _) => ("O", true, 1),
            ('p', _) => ("P", true, 1),
            ('s', _) => ("S", true, 1),
            _ => {
                return Err(ChemError::syntax(start, format!("unexpected character '{c}'")));
            }
        };
        self.pos += width;

        Ok(Atom {
            element,
            aromatic,
            bracket: false,
            explicit_hydrogens: 0,
            charge: 0,
        })
    }

    fn bracket_atom(&mut self) -> Result<Atom, ChemError> {
        let start = self.pos;
        let close = self.chars[self.pos..]
            .iter()
            .position(|&c| c == ']')
            .map(|offset| self.pos + offset)
            .ok_or_else(|| ChemError::syntax(start, "unterminated '['"))?;
        let body: Vec<char> = self.chars[self.pos + 1..close].to_vec();
        self.pos = close + 1;

        let mut i = 0;
        // isotope
        while body.get(i).is_some_and(char::is_ascii_digit) {
            i += 1;
        }

        let first = *body
            .get(i)
            .ok_or_else(|| ChemError::syntax(start, "bracket atom without an element"))?;
        let aromatic = first.is_ascii_lowercase();
        let mut symbol = first.to_ascii_uppercase().to_string();
        i += 1;
        if let Some(&second) = body.get(i) {
            if second.is_ascii_lowercase() {
                let candidate = format!("{symbol}{second}");
                if canonical_element(&candidate).is_some() {
                    symbol = candidate;
                    i += 1;
                }
            }
        }
        let element =
            canonical_element(&symbol).ok_or_else(|| ChemError::UnknownElement(symbol.clone()))?;

        while body.get(i) == Some(&'@') {
            i += 1;
        }

        let mut explicit_hydrogens = 0u8;
        if body.get(i) == Some(&'H') {
            i += 1;
            explicit_hydrogens = 1;
            if let Some(d) = body.get(i).and_then(|d| d.to_digit(10)) {
                explicit_hydrogens = d as u8;
                i += 1;
            }
        }

        let mut charge = 0i8;
        while let Some(&sign) = body.get(i) {
            let unit: i8 = match sign {
                '+' => 1,
                '-' => -1,
                _ => break,
            };
            let term_at = start + 1 + i;
            i += 1;
            let magnitude = match body.get(i).and_then(|d| d.to_digit(10)) {
                Some(d) => {
                    i += 1;
                    d as i8
                }
                None => 1,
            };
            charge = charge
                .checked_add(unit * magnitude)
                .filter(|c| c.abs() <= MAX_CHARGE)
                .ok_or_else(|| ChemError::syntax(term_at, "formal charge out of range"))?;
        }

        if body.get(i) == Some(&':') {
            i += 1;
            while body.get(i).is_some_and(char::is_ascii_digit) {
                i += 1;
            }
        }

        if i != body.len() {
            return Err(ChemError::syntax(start + 1 + i, "unexpected content in bracket atom"));
        }

        Ok(Atom {
            element,
            aromatic,
            bracket: true,
            explicit_hydrogens,
            charge,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hydrogens(mol: &Molecule) -> u32 {
        (0..mol.atoms.len()).map(|i| mol.hydrogens(i)).sum()
    }

    #[test]
    fn ethanol_has_six_hydrogens() {
        let mol = parse_smiles("CCO").unwrap();
        assert_eq!(mol.atoms.len(), 3);
        assert_eq!(mol.bonds.len(), 2);
        assert_eq!(hydrogens(&mol), 6);
        assert_eq!(mol.ring_count(), 0);
    }

    #[test]
    fn aromatic_benzene_closes_one_ring() {
        let mol = parse_smiles("c1ccccc1").unwrap();
        assert_eq!(mol.ring_count(), 1);
        assert!(mol.bonds.iter().all(|b| b.order == BondOrder::Aromatic));
        assert_eq!(hydrogens(&mol), 6);
    }

    #[test]
    fn kekule_aspirin_has_eight_hydrogens() {
        let mol = parse_smiles("CC(=O)OC1=CC=CC=C1C(=O)O").unwrap();
        assert_eq!(mol.atoms.len(), 13);
        assert_eq!(hydrogens(&mol), 8);
        assert_eq!(mol.ring_count(), 1);
    }

    #[test]
    fn two_letter_organic_atoms() {
        let mol = parse_smiles("ClCBr").unwrap();
        let elements: Vec<_> = mol.atoms.iter().map(|a| a.element).collect();
        assert_eq!(elements, vec!["Cl", "C", "Br"]);
        assert_eq!(hydrogens(&mol), 2);
    }

    #[test]
    fn bracket_atoms_carry_hydrogens_and_charge() {
        let mol = parse_smiles("[NH4+].[Cl-]").unwrap();
        assert_eq!(mol.components, 2);
        assert_eq!(mol.atoms[0].explicit_hydrogens, 4);
        assert_eq!(mol.atoms[0].charge, 1);
        assert_eq!(mol.atoms[1].charge, -1);
        assert_eq!(hydrogens(&mol), 4);
    }

    #[test]
    fn bracket_isotope_chirality_and_class() {
        let mol = parse_smiles("N[C@@H](C)C(=O)O").unwrap();
        assert_eq!(mol.atoms[1].explicit_hydrogens, 1);
        let labelled = parse_smiles("[13CH4:2]").unwrap();
        assert_eq!(labelled.atoms[0].explicit_hydrogens, 4);
    }

    #[test]
    fn percent_ring_closures() {
        let mol = parse_smiles("C%10CCCCC%10").unwrap();
        assert_eq!(mol.ring_count(), 1);
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["", "C(C", "CC)", "C1CC", "C==C", "Xe", "[Zz]", "C[CH", "=C", "C."] {
            assert!(parse_smiles(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn runaway_bracket_charge_is_a_syntax_error() {
        let runaway = format!("[C{}]", "+9".repeat(15));
        assert!(matches!(
            parse_smiles(&runaway),
            Err(ChemError::InvalidSmiles { .. })
        ));
        assert!(parse_smiles(&format!("[C{}]", "-9".repeat(15))).is_err());

        let mol = parse_smiles("[Fe+3]").unwrap();
        assert_eq!(mol.atoms[0].charge, 3);
        let mol = parse_smiles("[O--]").unwrap();
        assert_eq!(mol.atoms[0].charge, -2);
    }

    #[test]
    fn unknown_bracket_element_is_reported() {
        assert_eq!(
            parse_smiles("[Qq]").unwrap_err(),
            ChemError::UnknownElement("Q".to_string())
        );
    }
}
