/// Category used when normalization leaves nothing behind.
pub const FALLBACK_CATEGORY: &str = "uncategorized";

/// Turn a provider category into a single flat directory name.
///
/// Lower-cases, joins whitespace runs with `-` and strips everything that is
/// not an ASCII alphanumeric or a hyphen. Never returns an empty string, and
/// never a value containing a path separator or `.`.
pub fn normalize_category(category: &str) -> String {
    let lowered = category.to_lowercase();
    let normalized: String = lowered
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();

    if normalized.chars().all(|c| c == '-') {
        FALLBACK_CATEGORY.to_string()
    } else {
        normalized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_category() {
        assert_eq!(normalize_category("Sci-Fi Character!"), "sci-fi-character");
        assert_eq!(normalize_category("Landscapes"), "landscapes");
        assert_eq!(normalize_category("  3D   Renders "), "3d-renders");
        assert_eq!(normalize_category("animals/cats"), "animalscats");
        assert_eq!(normalize_category("../etc"), "etc");
    }

    #[test]
    fn test_normalize_category_is_never_empty() {
        assert_eq!(normalize_category(""), FALLBACK_CATEGORY);
        assert_eq!(normalize_category("!!!"), FALLBACK_CATEGORY);
        assert_eq!(normalize_category(" - "), FALLBACK_CATEGORY);
        assert_eq!(normalize_category("日本"), FALLBACK_CATEGORY);
    }
}
