use std::borrow::Cow;

use ledger_import::transform::string_ops::{
    collapse_whitespace, fold_caseless, looks_like_path, normalize_path, snake_case, substring,
};

#[test]
fn snake_case_reuses_when_no_change() {
    assert!(matches!(snake_case("posted_on"), Cow::Borrowed(_)));
    assert_eq!(snake_case("Posted On").as_ref(), "posted_on");
    assert_eq!(snake_case("AccountID").as_ref(), "account_id");
}

#[test]
fn substring_counts_characters() {
    assert_eq!(substring("Café au lait", 3, 4).as_ref(), "é au");
    assert_eq!(substring("short", 10, 2).as_ref(), "");
    assert!(matches!(substring("whole", 0, 99), Cow::Borrowed("whole")));
}

#[test]
fn whitespace_collapses_and_borrows_clean_input() {
    assert_eq!(collapse_whitespace("  Office \t supplies\n").as_ref(), "Office supplies");
    assert!(matches!(collapse_whitespace("Rent"), Cow::Borrowed("Rent")));
}

#[test]
fn caseless_folding_drops_accents() {
    assert_eq!(fold_caseless("  Crédit Agricole "), "credit agricole");
    assert_eq!(fold_caseless("STRASSE"), fold_caseless("strasse"));
}

#[test]
fn hierarchical_names_normalize_to_one_spelling() {
    assert!(looks_like_path(r"Assets\Cash"));
    assert!(!looks_like_path("Cash"));
    assert_eq!(normalize_path(r"Assets\ Current\Cash").as_ref(), "Assets > Current > Cash");
    assert_eq!(normalize_path("Assets>Current >  Cash").as_ref(), "Assets > Current > Cash");
    assert!(matches!(normalize_path("Assets > Cash"), Cow::Borrowed(_)));
}
