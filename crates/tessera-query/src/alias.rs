//! Deterministic table alias assignment.
//!
//! A child alias is its parent's alias followed by a short local alias of the
//! association property. Aliases that happen to spell an SQL keyword get an
//! underscore suffix.

use std::collections::HashMap;

const RESERVED: &[&str] = &[
    "as", "at", "by", "do", "go", "if", "in", "is", "no", "of", "on", "or", "to", "add", "all",
    "and", "any", "asc", "end", "for", "key", "not", "set", "top", "use",
];

/// Whether `alias` collides with a reserved word.
pub fn is_reserved(alias: &str) -> bool {
    RESERVED.iter().any(|w| w.eq_ignore_ascii_case(alias))
}

/// Alias of a child node.
pub fn child_alias(parent: &str, local: &str) -> String {
    let alias = format!("{}{}", parent, local);
    if is_reserved(&alias) {
        alias + "_"
    } else {
        alias
    }
}

/// Local aliases for association names in declaration order.
///
/// The first letter of each name, with a numeric suffix (starting at 2) when
/// an earlier name already took that letter.
pub fn local_aliases<'a>(names: impl IntoIterator<Item = &'a str>) -> HashMap<String, String> {
    let mut taken: HashMap<char, usize> = HashMap::new();
    let mut out = HashMap::new();
    for name in names {
        let letter = name
            .chars()
            .find(char::is_ascii_alphabetic)
            .map_or('x', |c| c.to_ascii_lowercase());
        let count = taken.entry(letter).or_insert(0);
        *count += 1;
        let local = if *count == 1 {
            letter.to_string()
        } else {
            format!("{}{}", letter, count)
        };
        out.insert(name.to_string(), local);
    }
    out
}
