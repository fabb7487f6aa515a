use std::borrow::Cow;

use heck::ToSnakeCase;
use unicode_normalization::{UnicodeNormalization, char::is_combining_mark};

/// Field name for a spreadsheet header; borrows headers that are already snake_case.
pub fn snake_case(input: &str) -> Cow<'_, str> {
    let converted = input.to_snake_case();
    if converted == input { Cow::Borrowed(input) } else { Cow::Owned(converted) }
}

/// Character-indexed slice of `value`; out-of-range requests yield an empty string.
pub fn substring(value: &str, start: usize, length: usize) -> Cow<'_, str> {
    let byte_at = |nth: usize| {
        value
            .char_indices()
            .map(|(idx, _)| idx)
            .chain(std::iter::once(value.len()))
            .nth(nth)
    };
    let Some(from) = byte_at(start) else {
        return Cow::Borrowed("");
    };
    let to = byte_at(start.saturating_add(length)).unwrap_or(value.len());
    Cow::Borrowed(&value[from..to])
}

/// Collapses internal whitespace runs to single spaces and trims the ends.
pub fn collapse_whitespace(input: &str) -> Cow<'_, str> {
    let trimmed = input.trim();
    let needs_work = trimmed
        .chars()
        .zip(trimmed.chars().skip(1))
        .any(|(a, b)| a.is_whitespace() && b.is_whitespace())
        || trimmed.chars().any(|c| c.is_whitespace() && c != ' ');
    if !needs_work {
        return Cow::Borrowed(trimmed);
    }
    Cow::Owned(trimmed.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// Case- and accent-insensitive folding: NFKD, combining marks removed, lowercased.
pub fn fold_caseless(input: &str) -> String {
    input
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect::<String>()
        .trim()
        .to_string()
}

/// True when a value uses one of the hierarchical separators `>` or `\`.
pub fn looks_like_path(input: &str) -> bool {
    input.contains('>') || input.contains('\\')
}

/// Canonical `A > B > C` form for hierarchical names written with `\`, `>` or
/// irregular spacing.
pub fn normalize_path(input: &str) -> Cow<'_, str> {
    if !looks_like_path(input) {
        return collapse_whitespace(input);
    }
    let joined = input
        .split(['>', '\\'])
        .map(|segment| collapse_whitespace(segment).into_owned())
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join(" > ");
    if joined == input {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_become_field_names() {
        assert!(matches!(snake_case("account_code"), Cow::Borrowed(_)));
        assert_eq!(snake_case("Posting Date").as_ref(), "posting_date");
    }

    #[test]
    fn substring_slices_by_character() {
        let memo = "Crème brûlée supplies";
        assert_eq!(substring(memo, 0, 5).as_ref(), "Crème");
        assert_eq!(substring(memo, 6, 6).as_ref(), "brûlée");
        assert_eq!(substring(memo, 13, 99).as_ref(), "supplies");
        assert_eq!(substring(memo, 40, 2).as_ref(), "");
    }

    #[test]
    fn caseless_folding_strips_accents() {
        assert_eq!(fold_caseless("Café Crème"), "cafe creme");
        assert_eq!(fold_caseless("ÉCOLE"), fold_caseless("ecole"));
    }

    #[test]
    fn path_separators_normalize_to_one_form() {
        let expected = "Assets > Bank > Checking";
        assert_eq!(normalize_path("Assets>Bank>Checking"), expected);
        assert_eq!(normalize_path("Assets\\Bank\\Checking"), expected);
        assert_eq!(normalize_path("Assets  >   Bank >Checking"), expected);
        assert!(matches!(normalize_path(expected), Cow::Borrowed(_)));
    }

    #[test]
    fn collapse_whitespace_trims_and_squeezes() {
        assert_eq!(collapse_whitespace("  a   b\tc "), "a b c");
        assert!(matches!(collapse_whitespace("a b"), Cow::Borrowed(_)));
    }
}
