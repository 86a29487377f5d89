/// Find a contiguous window of `lines` matching `pattern`, trying match modes
/// of decreasing strictness: exact equality, then ignoring trailing
/// whitespace, then ignoring leading and trailing whitespace.
///
/// An empty `pattern` matches at index 0; a pattern longer than the input
/// cannot match.
pub(crate) fn find_block(lines: &[&str], pattern: &[&str]) -> Option<usize> {
    if pattern.is_empty() {
        return Some(0);
    }
    if pattern.len() > lines.len() {
        return None;
    }

    for mode in [MatchMode::Exact, MatchMode::TrimEnd, MatchMode::Trim] {
        for start in 0..=(lines.len() - pattern.len()) {
            if window_matches(lines, pattern, start, mode) {
                return Some(start);
            }
        }
    }
    None
}

#[derive(Clone, Copy)]
enum MatchMode {
    Exact,
    TrimEnd,
    Trim,
}

fn window_matches(lines: &[&str], pattern: &[&str], start: usize, mode: MatchMode) -> bool {
    pattern.iter().enumerate().all(|(offset, want)| {
        let have = lines[start + offset];
        match mode {
            MatchMode::Exact => have == *want,
            MatchMode::TrimEnd => have.trim_end() == want.trim_end(),
            MatchMode::Trim => have.trim() == want.trim(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::find_block;

    #[test]
    fn exact_window_is_preferred() {
        let lines = ["fn a() {", "    body();", "}"];
        assert_eq!(find_block(&lines, &["    body();", "}"]), Some(1));
    }

    #[test]
    fn trailing_whitespace_is_ignored_on_second_pass() {
        let lines = ["let x = 1;   ", "let y = 2;\t"];
        assert_eq!(find_block(&lines, &["let x = 1;", "let y = 2;"]), Some(0));
    }

    #[test]
    fn indentation_is_ignored_on_last_pass() {
        let lines = ["        return None;"];
        assert_eq!(find_block(&lines, &["return None;"]), Some(0));
    }

    #[test]
    fn oversized_pattern_cannot_match() {
        assert_eq!(find_block(&["one"], &["one", "two"]), None);
    }

    #[test]
    fn empty_pattern_matches_at_origin() {
        assert_eq!(find_block(&["anything"], &[]), Some(0));
    }
}
