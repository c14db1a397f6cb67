use graphmind_core::config::ChunkerConfig;
use text_splitter::TextSplitter;

/// Window of consecutive paragraphs per chunk.
const WINDOW_PARAGRAPHS: usize = 3;
/// Paragraphs to advance between windows; windows overlap by one.
const WINDOW_STRIDE: usize = 2;
/// Character-count proxy for a token; not a tokenizer.
const CHARS_PER_TOKEN: usize = 4;

/// Splits raw text into overlapping paragraph windows.
///
/// Text is first cut into lines of bounded token estimate on natural
/// boundaries, lines are greedily grouped into paragraphs, and paragraphs
/// are emitted as windows of three with stride two. Each window becomes one
/// independent ingest chunk.
pub struct TextChunker {
    splitter: TextSplitter<text_splitter::Characters>,
    lines_per_split: usize,
    tokens_per_paragraph: usize,
}

impl TextChunker {
    pub fn new(config: &ChunkerConfig) -> Self {
        Self {
            splitter: TextSplitter::default().with_trim_chunks(true),
            lines_per_split: config.lines_per_split.max(1),
            tokens_per_paragraph: config.tokens_per_paragraph.max(1),
        }
    }

    pub fn chunk(&self, text: &str) -> Vec<String> {
        let line_budget = self.lines_per_split * CHARS_PER_TOKEN;
        let lines: Vec<&str> = self.splitter.chunks(text, line_budget).collect();

        let paragraphs = group_paragraphs(&lines, self.tokens_per_paragraph);
        if paragraphs.is_empty() {
            return Vec::new();
        }
        if paragraphs.len() <= WINDOW_PARAGRAPHS {
            return vec![paragraphs.join("\n")];
        }

        let mut windows = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut start = 0;
        loop {
            let end = (start + WINDOW_PARAGRAPHS).min(paragraphs.len());
            let window = paragraphs[start..end].join("\n");
            if seen.insert(window.clone()) {
                windows.push(window);
            }
            if end == paragraphs.len() {
                break;
            }
            start += WINDOW_STRIDE;
        }
        windows
    }
}

impl Default for TextChunker {
    fn default() -> Self {
        Self::new(&ChunkerConfig::default())
    }
}

fn group_paragraphs(lines: &[&str], tokens_per_paragraph: usize) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut current_tokens = 0;

    for line in lines {
        let tokens = estimate_tokens(line);
        if !current.is_empty() && current_tokens + tokens > tokens_per_paragraph {
            paragraphs.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
        current_tokens += tokens;
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }
    paragraphs
}

fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() + CHARS_PER_TOKEN - 1) / CHARS_PER_TOKEN
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_chunker() -> TextChunker {
        // One short sentence per line, one line per paragraph.
        TextChunker::new(&ChunkerConfig {
            lines_per_split: 10,
            tokens_per_paragraph: 10,
        })
    }

    #[test]
    fn empty_input_produces_no_chunks() {
        assert!(TextChunker::default().chunk("").is_empty());
        assert!(TextChunker::default().chunk("   \n  ").is_empty());
    }

    #[test]
    fn few_paragraphs_collapse_into_a_single_window() {
        let chunks = TextChunker::default().chunk("Alice met Bob. They founded a company.");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].contains("Alice met Bob."));
    }

    #[test]
    fn windows_overlap_by_one_paragraph() {
        let sentences: Vec<String> = (0..5)
            .map(|i| format!("Sentence number {i} is right here."))
            .collect();
        let text = sentences.join(" ");

        let chunks = tiny_chunker().chunk(&text);

        assert!(chunks.len() >= 2);
        // Stride two over windows of three: consecutive windows share text.
        for pair in chunks.windows(2) {
            let last_of_first = pair[0].lines().last().unwrap();
            assert!(
                pair[1].contains(last_of_first),
                "window {:?} should overlap {:?}",
                pair[1],
                pair[0]
            );
        }
    }

    #[test]
    fn duplicate_windows_are_suppressed() {
        let repeated = "Same sentence again. ".repeat(12);
        let chunks = tiny_chunker().chunk(&repeated);

        let mut seen = std::collections::HashSet::new();
        for chunk in &chunks {
            assert!(seen.insert(chunk.clone()), "duplicate window {chunk:?}");
        }
    }

    #[test]
    fn oversized_line_still_forms_a_paragraph() {
        let long_word = "x".repeat(200);
        let chunks = tiny_chunker().chunk(&long_word);
        assert_eq!(chunks.len(), 1);
    }
}
