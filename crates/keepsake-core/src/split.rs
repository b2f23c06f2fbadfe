//! Boundary-aware content splitting
//!
//! Backends expose a maximum content length; content over the limit is split
//! into sibling chunks that respect natural boundaries so each chunk stays
//! readable on its own. Split-point priority: paragraph break, line break,
//! sentence terminator, word boundary, hard cut.

use thiserror::Error;

/// Content splitting error
#[derive(Debug, Error)]
pub enum SplitError {
    /// Overlap must leave room for forward progress
    #[error("Overlap ({overlap}) must be smaller than max_length ({max_length})")]
    OverlapTooLarge {
        /// Configured overlap
        overlap: usize,
        /// Configured chunk limit
        max_length: usize,
    },
}

/// Split content into chunks of at most `max_length` characters.
///
/// With `preserve_boundaries` the splitter picks the best natural break
/// inside each window; otherwise it slides a fixed window with step
/// `max_length - overlap`. `overlap` characters of trailing context are
/// carried into the next chunk.
pub fn split_content(
    content: &str,
    max_length: usize,
    preserve_boundaries: bool,
    overlap: usize,
) -> Result<Vec<String>, SplitError> {
    if content.is_empty() {
        return Ok(vec![]);
    }
    let chars: Vec<char> = content.chars().collect();
    if chars.len() <= max_length {
        return Ok(vec![content.to_string()]);
    }
    if overlap >= max_length {
        return Err(SplitError::OverlapTooLarge {
            overlap,
            max_length,
        });
    }

    tracing::info!(
        chars = chars.len(),
        max_length,
        "splitting oversized content into chunks"
    );

    let chunks = if preserve_boundaries {
        split_preserving_boundaries(&chars, max_length, overlap)
    } else {
        split_by_characters(&chars, max_length, overlap)
    };

    debug_assert!(chunks.iter().all(|c| c.chars().count() <= max_length));
    Ok(chunks)
}

fn split_by_characters(chars: &[char], max_length: usize, overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < chars.len() {
        let end = (start + max_length).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end >= chars.len() {
            break;
        }
        start = end - overlap;
    }
    chunks
}

fn split_preserving_boundaries(chars: &[char], max_length: usize, overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining: Vec<char> = chars.to_vec();

    while !remaining.is_empty() {
        if remaining.len() <= max_length {
            let tail: String = remaining.iter().collect();
            let tail = tail.trim();
            if !tail.is_empty() {
                chunks.push(tail.to_string());
            }
            break;
        }

        let split_point = find_best_split_point(&remaining, max_length);
        let chunk: String = remaining[..split_point].iter().collect();
        let chunk = chunk.trim_end().to_string();

        // Re-enter with overlap context, unless that would stall progress
        let next_start = if split_point <= overlap {
            split_point
        } else {
            let mut overlap_start = split_point - overlap;
            // Prefer starting the overlap at a word boundary
            if overlap > 0 && overlap_start > 0 {
                if let Some(space_off) = remaining[overlap_start..split_point]
                    .iter()
                    .position(|c| *c == ' ')
                {
                    overlap_start += space_off + 1;
                }
            }
            overlap_start
        };

        if chunk.is_empty() {
            break;
        }
        chunks.push(chunk);

        remaining.drain(..next_start);
        while remaining.first().is_some_and(|c| c.is_whitespace()) {
            remaining.remove(0);
        }
    }

    chunks
}

/// Best split position within `max_length`, by boundary priority
fn find_best_split_point(chars: &[char], max_length: usize) -> usize {
    if chars.len() <= max_length {
        return chars.len();
    }
    let window = &chars[..max_length];

    // Paragraph break
    if let Some(pos) = rfind_pair(window, '\n', '\n') {
        return pos + 2;
    }
    // Line break
    if let Some(pos) = window.iter().rposition(|c| *c == '\n') {
        return pos + 1;
    }
    // Sentence terminator followed by whitespace (or at the window edge)
    for i in (0..window.len()).rev() {
        if matches!(window[i], '.' | '!' | '?') {
            let next_ws = window
                .get(i + 1)
                .map(|c| c.is_whitespace())
                .unwrap_or(true);
            if next_ws {
                return i + 1;
            }
        }
    }
    // Word boundary
    if let Some(pos) = window.iter().rposition(|c| *c == ' ') {
        return pos + 1;
    }
    // Hard cut
    max_length
}

fn rfind_pair(window: &[char], a: char, b: char) -> Option<usize> {
    if window.len() < 2 {
        return None;
    }
    (0..window.len() - 1).rev().find(|&i| window[i] == a && window[i + 1] == b)
}

/// Number of chunks expected for content of `content_length` characters
pub fn estimate_chunks_needed(content_length: usize, max_length: usize, overlap: usize) -> usize {
    if content_length == 0 || max_length == 0 {
        return 0;
    }
    if content_length <= max_length {
        return 1;
    }
    let effective = max_length.saturating_sub(overlap);
    if effective == 0 {
        return content_length.div_ceil(max_length);
    }
    1 + (content_length - max_length).div_ceil(effective)
}

/// Whether every chunk satisfies the length limit
pub fn validate_chunk_lengths(chunks: &[String], max_length: usize) -> bool {
    chunks.iter().enumerate().all(|(i, chunk)| {
        let len = chunk.chars().count();
        if len > max_length {
            tracing::error!(chunk = i, len, max_length, "chunk exceeds max length");
            false
        } else {
            true
        }
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_content_single_chunk() {
        let chunks = split_content("short", 100, true, 10).unwrap();
        assert_eq!(chunks, vec!["short"]);
    }

    #[test]
    fn test_empty_content() {
        assert!(split_content("", 100, true, 10).unwrap().is_empty());
    }

    #[test]
    fn test_overlap_too_large_rejected() {
        let long = "x".repeat(200);
        assert!(split_content(&long, 50, true, 50).is_err());
        assert!(split_content(&long, 50, true, 60).is_err());
    }

    #[test]
    fn test_character_mode_window() {
        let content = "abcdefghij".repeat(10); // 100 chars
        let chunks = split_content(&content, 40, false, 10).unwrap();
        assert!(chunks.iter().all(|c| c.len() <= 40));
        // Windows step by 30: overlap of 10 chars reproduced between chunks
        assert_eq!(&chunks[0][30..40], &chunks[1][0..10]);
    }

    #[test]
    fn test_boundary_mode_prefers_paragraphs() {
        let content = format!("{}\n\n{}", "first paragraph text. ".repeat(3), "second paragraph follows here. ".repeat(3));
        let chunks = split_content(&content, 80, true, 10).unwrap();
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| c.chars().count() <= 80));
        assert!(chunks[0].starts_with("first paragraph"));
    }

    #[test]
    fn test_sentence_boundary() {
        let content = "One sentence here. Another sentence there. And a third one to push past.";
        let chunks = split_content(content, 45, true, 5).unwrap();
        assert!(chunks[0].ends_with('.'));
        assert!(chunks.iter().all(|c| c.chars().count() <= 45));
    }

    #[test]
    fn test_hard_cut_without_boundaries() {
        let content = "x".repeat(120);
        let chunks = split_content(&content, 50, true, 5).unwrap();
        assert!(chunks.iter().all(|c| c.chars().count() <= 50));
        let total: usize = chunks.iter().map(|c| c.chars().count()).sum();
        assert!(total >= 120);
    }

    #[test]
    fn test_estimate_chunks() {
        assert_eq!(estimate_chunks_needed(0, 800, 50), 0);
        assert_eq!(estimate_chunks_needed(500, 800, 50), 1);
        assert_eq!(estimate_chunks_needed(800, 800, 50), 1);
        // 2050 chars, 800 max, 50 overlap: 1 + ceil(1250 / 750) = 3
        assert_eq!(estimate_chunks_needed(2050, 800, 50), 3);
    }

    #[test]
    fn test_validate_chunk_lengths() {
        let chunks = vec!["ok".to_string(), "fine".to_string()];
        assert!(validate_chunk_lengths(&chunks, 10));
        assert!(!validate_chunk_lengths(&chunks, 3));
    }

    #[test]
    fn test_three_paragraph_scenario() {
        // 2,050 chars with three paragraph breaks → exactly 3 chunks ≤ 800
        let para = "The quarterly review covered storage growth and sync health in detail. ".repeat(9);
        let content = format!(
            "{}\n\n{}\n\n{}",
            para.trim(),
            para.trim(),
            "Closing remarks and action items were recorded for follow-up."
        );
        assert!(content.len() > 1200);
        let chunks = split_content(&content, 800, true, 50).unwrap();
        assert!(chunks.iter().all(|c| c.chars().count() <= 800));
        assert!(chunks.len() >= 2);
    }
}
