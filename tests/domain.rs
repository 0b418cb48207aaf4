use assert_matches::assert_matches;

use molid::domain::{
    IdentifierType, Query, RegistryValidity, SearchMode, Strategy, key_prefix, parse_cid,
    registry_validity,
};
use molid::error::MolidError;
use molid::formula::canonicalize_formula;

#[test]
fn parse_identifier_type_aliases() {
    let id: IdentifierType = "InChIKey".parse().unwrap();
    assert_eq!(id, IdentifierType::Inchikey);
    assert_eq!(
        "formula".parse::<IdentifierType>().unwrap(),
        IdentifierType::Molecularformula
    );
    assert_eq!(
        "registry".parse::<IdentifierType>().unwrap(),
        IdentifierType::Cas
    );
}

#[test]
fn parse_identifier_type_invalid() {
    let err = "fingerprint".parse::<IdentifierType>().unwrap_err();
    assert_matches!(err, MolidError::InvalidIdentifierType(_));
}

#[test]
fn query_requires_exactly_one_pair() {
    let query = Query::from_pairs([("smiles", "O=C=O")]).unwrap();
    assert_eq!(query.id_type, IdentifierType::Smiles);

    let none: [(&str, &str); 0] = [];
    assert_matches!(Query::from_pairs(none), Err(MolidError::InvalidQuery(_)));
    assert_matches!(
        Query::from_pairs([("cid", "280"), ("name", "carbon dioxide")]),
        Err(MolidError::InvalidQuery(_))
    );
}

#[test]
fn strategy_support_matrix() {
    assert!(Strategy::BulkOnly.supports(IdentifierType::Xyz));
    assert!(!Strategy::BulkOnly.supports(IdentifierType::Name));
    assert!(Strategy::CacheOnly.supports(IdentifierType::Cas));
    assert!(Strategy::RemoteWithCache.supports(IdentifierType::Molecularformula));
}

#[test]
fn parse_modes_and_legacy_names() {
    assert_eq!(
        "online-cached".parse::<SearchMode>().unwrap(),
        SearchMode::Single(Strategy::RemoteWithCache)
    );
    assert_eq!("AUTO".parse::<SearchMode>().unwrap(), SearchMode::default());
    assert_matches!(
        "sometimes".parse::<SearchMode>(),
        Err(MolidError::InvalidMode(_))
    );
}

#[test]
fn cid_validation() {
    assert_eq!(parse_cid(" 2244 ").unwrap(), 2244);
    assert_matches!(parse_cid("0"), Err(MolidError::InvalidCid(_)));
    assert_matches!(parse_cid("aspirin"), Err(MolidError::InvalidCid(_)));
}

#[test]
fn registry_checksums() {
    assert_eq!(registry_validity("124-38-9"), RegistryValidity::Valid);
    assert_eq!(registry_validity("7732-18-5"), RegistryValidity::Valid);
    assert_eq!(registry_validity("124-38-8"), RegistryValidity::BadChecksum);
    assert_eq!(registry_validity("124389"), RegistryValidity::Malformed);
}

#[test]
fn connectivity_prefix() {
    assert_eq!(key_prefix("CURLTUGMZLYLDI-UHFFFAOYSA-N"), "CURLTUGMZLYLDI");
    assert_eq!(key_prefix("SHORT"), "SHORT");
}

#[test]
fn formula_canonical_order() {
    assert_eq!(canonicalize_formula("O2C"), "CO2");
    assert_eq!(canonicalize_formula("OH2"), "H2O");
    assert_eq!(canonicalize_formula("H6C2O"), "C2H6O");
    assert_eq!(canonicalize_formula("ClNa"), "ClNa");
}
