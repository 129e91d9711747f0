/// Lightweight sanitizer that bounds OCR text for the LLM while preserving
/// line breaks.
///
/// Steps, in order: optional zoning (drop top/bottom boilerplate lines),
/// line-wise whitespace normalization, removal of known noise lines, and
/// truncation at a line boundary.
pub fn sanitize_for_llm(
    text: &str,
    max_chars: usize,
    strip_top: usize,
    strip_bottom: usize,
) -> String {
    let lines: Vec<&str> = text.lines().collect();

    // Zoning is skipped on very short documents where it would eat content.
    let zoned: &[&str] = if lines.len() > strip_top + strip_bottom + 5 {
        &lines[strip_top..lines.len() - strip_bottom]
    } else {
        &lines
    };

    let mut kept: Vec<String> = Vec::with_capacity(zoned.len());
    for line in zoned {
        let normalized = normalize_whitespace(line);
        if normalized.is_empty() || is_noise_line(&normalized) {
            continue;
        }
        kept.push(normalized);
    }
    let joined = kept.join("\n");

    let max_chars = max_chars.max(1000);
    if joined.chars().count() <= max_chars {
        return joined;
    }

    // Truncate to whole lines, never mid-line.
    let mut out = String::new();
    for line in joined.lines() {
        let next_len = if out.is_empty() {
            line.chars().count()
        } else {
            out.chars().count() + 1 + line.chars().count()
        };
        if next_len > max_chars {
            break;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(line);
    }
    if out.is_empty() {
        // A single line longer than the budget still gets truncated.
        out = joined.chars().take(max_chars).collect();
    }
    out
}

fn normalize_whitespace(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Short denylist of page-number / scanner-footer patterns.
fn is_noise_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    if lower == "confidential" {
        return true;
    }
    if lower.starts_with("invoice scanned by") {
        return true;
    }
    is_page_counter(&lower)
}

/// Matches "page N of M" without a regex dependency.
fn is_page_counter(lower: &str) -> bool {
    let mut parts = lower.split_whitespace();
    matches!(
        (
            parts.next(),
            parts.next().map(|p| p.chars().all(|c| c.is_ascii_digit())),
            parts.next(),
            parts.next().map(|p| p.chars().all(|c| c.is_ascii_digit())),
            parts.next(),
        ),
        (Some("page"), Some(true), Some("of"), Some(true), None)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_line_breaks_and_collapses_spaces() {
        let out = sanitize_for_llm("Total:\t  100,00\n\nVAT   21%\n", 5000, 0, 0);
        assert_eq!(out, "Total: 100,00\nVAT 21%");
    }

    #[test]
    fn strips_noise_lines() {
        let input = "Invoice INV-1\nPage 1 of 3\nCONFIDENTIAL\nAmount due 10.00";
        let out = sanitize_for_llm(input, 5000, 0, 0);
        assert_eq!(out, "Invoice INV-1\nAmount due 10.00");
    }

    #[test]
    fn zoning_skipped_on_short_documents() {
        let input = "a\nb\nc";
        assert_eq!(sanitize_for_llm(input, 5000, 2, 2), "a\nb\nc");
    }

    #[test]
    fn zoning_drops_top_and_bottom_lines() {
        let lines: Vec<String> = (0..12).map(|i| format!("line{i}")).collect();
        let out = sanitize_for_llm(&lines.join("\n"), 5000, 2, 1);
        assert!(out.starts_with("line2"));
        assert!(out.ends_with("line10"));
    }

    #[test]
    fn truncates_at_line_boundary() {
        let input = (0..100)
            .map(|i| format!("line number {i:03}"))
            .collect::<Vec<_>>()
            .join("\n");
        let out = sanitize_for_llm(&input, 1000, 0, 0);
        assert!(out.chars().count() <= 1000);
        assert!(!out.ends_with('\n'));
        assert!(out.lines().last().unwrap().starts_with("line number"));
    }
}
