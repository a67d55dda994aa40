use deunicode::deunicode;

/// Fold a string for matching: transliterate to Latin, lowercase, collapse
/// whitespace ("Иван  Петров" -> "ivan petrov").
pub fn normalize(s: &str) -> String {
    deunicode(s)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Escape LIKE wildcards; used with `ESCAPE '\'`.
fn escape_like(normalized: &str) -> String {
    normalized
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

pub fn contains_pattern(normalized: &str) -> String {
    format!("%{}%", escape_like(normalized))
}

pub fn prefix_pattern(normalized: &str) -> String {
    format!("{}%", escape_like(normalized))
}

pub fn suffix_pattern(normalized: &str) -> String {
    format!("%{}", escape_like(normalized))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_scripts_and_case() {
        assert_eq!(normalize("Иван Петров"), "ivan petrov");
        assert_eq!(normalize("  José   García "), "jose garcia");
        assert_eq!(normalize("BROWN"), "brown");
    }

    #[test]
    fn patterns_escape_wildcards() {
        assert_eq!(contains_pattern("a%b"), "%a\\%b%");
        assert_eq!(prefix_pattern("a_b"), "a\\_b%");
        assert_eq!(suffix_pattern("a\\b"), "%a\\\\b");
    }
}
