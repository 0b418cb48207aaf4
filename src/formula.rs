use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

static ELEMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Z][a-z]?)(\d*)").expect("valid element pattern"));

/// Element counts of a flat molecular formula such as `C6H12O6`.
pub fn parse_formula(formula: &str) -> BTreeMap<String, u32> {
    let compact: String = formula.chars().filter(|ch| !ch.is_whitespace()).collect();
    let mut counts = BTreeMap::new();
    for caps in ELEMENT.captures_iter(&compact) {
        let count = match &caps[2] {
            "" => 1,
            digits => digits.parse::<u32>().unwrap_or(1),
        };
        *counts.entry(caps[1].to_string()).or_insert(0) += count;
    }
    counts
}

/// Hill-system ordering: carbon, then hydrogen, then the rest alphabetically.
/// Formulas without carbon are fully alphabetical.
pub fn canonicalize_formula(formula: &str) -> String {
    let counts = parse_formula(formula);
    if counts.is_empty() {
        return formula.trim().to_string();
    }

    let mut ordered: Vec<&str> = Vec::with_capacity(counts.len());
    if counts.contains_key("C") {
        ordered.push("C");
        if counts.contains_key("H") {
            ordered.push("H");
        }
        ordered.extend(
            counts
                .keys()
                .map(String::as_str)
                .filter(|el| *el != "C" && *el != "H"),
        );
    } else {
        ordered.extend(counts.keys().map(String::as_str));
    }

    let mut out = String::new();
    for element in ordered {
        out.push_str(element);
        match counts[element] {
            1 => {}
            n => out.push_str(&n.to_string()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hill_order_with_carbon() {
        assert_eq!(canonicalize_formula("H12 C6 O6"), "C6H12O6");
        assert_eq!(canonicalize_formula("O2C"), "CO2");
        assert_eq!(canonicalize_formula("ClCH3"), "CH3Cl");
    }

    #[test]
    fn alphabetical_without_carbon() {
        assert_eq!(canonicalize_formula("H2 O"), "H2O");
        assert_eq!(canonicalize_formula("O4SH2"), "H2O4S");
    }

    #[test]
    fn repeated_elements_are_summed() {
        assert_eq!(canonicalize_formula("CH3CH2OH"), "C2H6O");
    }
}
