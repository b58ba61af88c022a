//! Numbers to factor, one per line. Expressions the engine understands
//! (`2^997-1`, `(10^71-1)/9`, `0x1f`) are passed through untouched.

use tracing::warn;

const ALLOWED: &str = "0123456789abcdefx+-*/^%!#.(){}[]\" ";

/// Strip quotes and validate one input line. `None` for comments, blanks
/// and anything with characters the engine would reject.
pub fn parse_number(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    if !line.chars().all(|c| ALLOWED.contains(c)) {
        return None;
    }
    let n = line.trim_matches('"').trim();
    (!n.is_empty()).then(|| n.to_string())
}

/// Valid numbers from `text`, warning about lines that are skipped.
pub fn read_numbers(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match parse_number(trimmed) {
            Some(n) => out.push(n),
            None => warn!(line = i + 1, text = trimmed, "skipping invalid input line"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_engine_expressions() {
        assert_eq!(parse_number("2^997-1").as_deref(), Some("2^997-1"));
        assert_eq!(parse_number("  (10^71-1)/9 ").as_deref(), Some("(10^71-1)/9"));
        assert_eq!(parse_number("\"637#+1\"").as_deref(), Some("637#+1"));
        assert_eq!(parse_number("0x1f").as_deref(), Some("0x1f"));
    }

    #[test]
    fn rejects_comments_blanks_and_stray_characters() {
        assert_eq!(parse_number("# 12345"), None);
        assert_eq!(parse_number("   "), None);
        assert_eq!(parse_number("12345; rm -rf"), None);
        assert_eq!(parse_number("N=91"), None);
        assert_eq!(parse_number("\"\""), None);
    }

    #[test]
    fn reads_list_in_order() {
        let text = "91\n# comment\n\n2^67-1\nbogus!line\n1000000016000000063\n";
        assert_eq!(read_numbers(text), vec!["91", "2^67-1", "1000000016000000063"]);
    }
}
