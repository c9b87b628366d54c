//! CJK-aware text helpers used by the extraction pipeline and pre-scanner.
//!
//! All length arithmetic in this crate is in Unicode scalar values, never
//! bytes: a Chinese chapter is mostly 3-byte UTF-8 sequences and byte slicing
//! would split code points.

/// Number of Unicode scalar values in `s`.
pub fn char_count(s: &str) -> usize {
    s.chars().count()
}

/// Truncate `s` to at most `max_chars` scalar values.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// True for CJK Unified Ideographs (including extension A).
pub fn is_han(c: char) -> bool {
    matches!(c, '\u{4E00}'..='\u{9FFF}' | '\u{3400}'..='\u{4DBF}')
}

/// True if any character of `s` is a Han ideograph.
pub fn contains_han(s: &str) -> bool {
    s.chars().any(is_han)
}

/// Split text into non-empty paragraphs on blank lines or single newlines.
///
/// Chinese web novels are typically one paragraph per line, so a plain
/// newline split is the correct segmentation boundary.
pub fn split_paragraphs(text: &str) -> Vec<&str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect()
}

/// Split a text into contiguous segments of at most `max_chars` scalar
/// values each, breaking only at paragraph boundaries. A single paragraph
/// longer than the budget becomes its own segment.
pub fn segment_at_paragraphs(text: &str, max_chars: usize) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for para in split_paragraphs(text) {
        let para_len = char_count(para);
        if current_len > 0 && current_len + para_len > max_chars {
            segments.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(para);
        current_len += para_len;
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// Extract maximal runs of consecutive Han characters.
pub fn han_runs(text: &str) -> Vec<&str> {
    let mut runs = Vec::new();
    let mut start: Option<usize> = None;
    for (idx, c) in text.char_indices() {
        if is_han(c) {
            if start.is_none() {
                start = Some(idx);
            }
        } else if let Some(s) = start.take() {
            runs.push(&text[s..idx]);
        }
    }
    if let Some(s) = start {
        runs.push(&text[s..]);
    }
    runs
}

/// All n-grams of `len` scalar values over a Han run.
pub fn ngrams(run: &str, len: usize) -> Vec<&str> {
    let indices: Vec<usize> = run
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(run.len()))
        .collect();
    if indices.len() <= len {
        return Vec::new();
    }
    (0..indices.len() - len)
        .map(|i| &run[indices[i]..indices[i + len]])
        .collect()
}

/// Parse a small Chinese numeral ("三", "十二", "半") or an ASCII integer.
///
/// Used by the narrative-distance parser ("三天路程"). Returns `None` for
/// anything it does not recognize; callers fall back to a default distance.
pub fn parse_cn_number(s: &str) -> Option<f64> {
    if let Ok(n) = s.parse::<f64>() {
        return Some(n);
    }
    const DIGITS: [(&str, f64); 11] = [
        ("零", 0.0),
        ("一", 1.0),
        ("二", 2.0),
        ("两", 2.0),
        ("三", 3.0),
        ("四", 4.0),
        ("五", 5.0),
        ("六", 6.0),
        ("七", 7.0),
        ("八", 8.0),
        ("九", 9.0),
    ];
    let digit = |c: &str| DIGITS.iter().find(|(d, _)| *d == c).map(|(_, v)| *v);

    if s == "半" {
        return Some(0.5);
    }
    let chars: Vec<String> = s.chars().map(|c| c.to_string()).collect();
    match chars.as_slice() {
        [one] => digit(one),
        // 十, 十三
        [ten] if ten == "十" => Some(10.0),
        [ten, ones] if ten == "十" => Some(10.0 + digit(ones)?),
        // 三十, 三十五
        [tens, ten] if ten == "十" => Some(digit(tens)? * 10.0),
        [tens, ten, ones] if ten == "十" => Some(digit(tens)? * 10.0 + digit(ones)?),
        // 三百
        [hundreds, hundred] if hundred == "百" => Some(digit(hundreds)? * 100.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars_on_boundary() {
        let s = "韩立来到七玄门";
        assert_eq!(truncate_chars(s, 2), "韩立");
        assert_eq!(truncate_chars(s, 100), s);
    }

    #[test]
    fn test_segment_at_paragraphs_respects_budget() {
        let text = "第一段内容在此。\n第二段内容在此。\n第三段内容在此。";
        let segments = segment_at_paragraphs(text, 10);
        assert_eq!(segments.len(), 3);
        for seg in &segments {
            assert!(char_count(seg) <= 10);
        }
    }

    #[test]
    fn test_segment_keeps_oversized_paragraph_whole() {
        let long = "很".repeat(50);
        let segments = segment_at_paragraphs(&long, 10);
        assert_eq!(segments.len(), 1);
    }

    #[test]
    fn test_han_runs_skip_punctuation() {
        let runs = han_runs("韩立，来到七玄门。");
        assert_eq!(runs, vec!["韩立", "来到七玄门"]);
    }

    #[test]
    fn test_ngrams() {
        assert_eq!(ngrams("韩立道", 2), vec!["韩立", "立道"]);
        assert!(ngrams("韩", 2).is_empty());
    }

    #[test]
    fn test_parse_cn_number() {
        assert_eq!(parse_cn_number("三"), Some(3.0));
        assert_eq!(parse_cn_number("十"), Some(10.0));
        assert_eq!(parse_cn_number("十二"), Some(12.0));
        assert_eq!(parse_cn_number("三十五"), Some(35.0));
        assert_eq!(parse_cn_number("半"), Some(0.5));
        assert_eq!(parse_cn_number("7"), Some(7.0));
        assert_eq!(parse_cn_number("不知"), None);
    }
}
