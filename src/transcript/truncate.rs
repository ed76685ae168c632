//! Collective size cap for tool-result text blocks.

/// Appended to every block that loses text to the cap.
pub const TRUNCATION_SUFFIX: &str = "\n\n⚠️ [Content truncated during persistence — original exceeded size limit. Use offset/limit parameters or request specific sections for large content.]";

/// Cap the blocks' total character count at `max_total_chars`.
///
/// Each block is truncated proportionally to its share of the total, so a
/// huge block absorbs most of the cut while small blocks survive intact.
/// The cut prefers the last newline when it falls within the final 20% of
/// the block's budget, keeping the tail of the kept text line-aligned.
pub fn cap_text_blocks(texts: &mut [String], max_total_chars: usize) -> bool {
    let lengths: Vec<usize> = texts.iter().map(|text| text.chars().count()).collect();
    let total: usize = lengths.iter().sum();
    if total <= max_total_chars || total == 0 {
        return false;
    }

    let mut truncated_any = false;
    for (text, length) in texts.iter_mut().zip(lengths) {
        // Proportional share of the budget, by character count.
        let budget = max_total_chars.saturating_mul(length) / total;
        if length <= budget {
            continue;
        }
        *text = truncate_at(text, budget);
        text.push_str(TRUNCATION_SUFFIX);
        truncated_any = true;
    }
    truncated_any
}

/// Truncate to `budget` characters, preferring a newline cut in the last
/// fifth of the budget.
fn truncate_at(text: &str, budget: usize) -> String {
    let kept: String = text.chars().take(budget).collect();
    let floor = budget.saturating_mul(4) / 5;
    match kept.rfind('\n') {
        Some(newline_at) if kept[..newline_at].chars().count() >= floor => {
            kept[..newline_at].to_string()
        }
        _ => kept,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn under_cap_is_untouched() {
        let mut blocks = vec!["short".to_string()];
        assert!(!cap_text_blocks(&mut blocks, 100));
        assert_eq!(blocks[0], "short");
    }

    #[test]
    fn oversized_block_is_cut_with_suffix() {
        let mut blocks = vec!["x".repeat(1_000)];
        assert!(cap_text_blocks(&mut blocks, 100));
        assert!(blocks[0].starts_with(&"x".repeat(100)));
        assert!(blocks[0].ends_with(TRUNCATION_SUFFIX));
        let kept = blocks[0].trim_end_matches(TRUNCATION_SUFFIX);
        assert_eq!(kept.chars().count(), 100);
    }

    #[test]
    fn cut_is_proportional_to_share() {
        let mut blocks = vec!["a".repeat(900), "b".repeat(100)];
        cap_text_blocks(&mut blocks, 500);

        let kept_a = blocks[0].trim_end_matches(TRUNCATION_SUFFIX).len();
        let kept_b = blocks[1].trim_end_matches(TRUNCATION_SUFFIX).len();
        assert_eq!(kept_a, 450);
        assert_eq!(kept_b, 50);
    }

    #[test]
    fn newline_near_budget_end_wins() {
        // Newline at 95% of a 100-char budget: the cut lands there.
        let text = format!("{}\n{}", "x".repeat(95), "y".repeat(500));
        let mut blocks = vec![text];
        cap_text_blocks(&mut blocks, 100);

        let kept = blocks[0].trim_end_matches(TRUNCATION_SUFFIX);
        assert_eq!(kept, "x".repeat(95));
    }

    #[test]
    fn newline_too_early_is_ignored() {
        // Newline at 10% of the budget: plain character cut instead.
        let text = format!("{}\n{}", "x".repeat(10), "y".repeat(500));
        let mut blocks = vec![text];
        cap_text_blocks(&mut blocks, 100);

        let kept = blocks[0].trim_end_matches(TRUNCATION_SUFFIX);
        assert_eq!(kept.chars().count(), 100);
    }

    #[test]
    fn multibyte_text_cuts_on_char_boundaries() {
        let mut blocks = vec!["界".repeat(300)];
        cap_text_blocks(&mut blocks, 100);
        let kept = blocks[0].trim_end_matches(TRUNCATION_SUFFIX);
        assert_eq!(kept.chars().count(), 100);
    }
}
