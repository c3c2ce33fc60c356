use crate::TextSplitter;

/// Splits text on blank lines and packs paragraphs into chunks of at most
/// `max_segment_chars` characters.
///
/// Paragraphs longer than the budget are split between words, and single words
/// longer than the budget are cut. When a new chunk starts, up to `overlap_chars`
/// characters from the end of the previous chunk (starting at a word boundary) are
/// repeated in front of it if they fit.
///
/// Lengths are counted in `char`s, not bytes.
#[derive(Debug, Clone)]
pub struct ParagraphSplitter {
    max_segment_chars: usize,
    overlap_chars: usize,
}

impl ParagraphSplitter {
    /// # Panics
    ///
    /// Panics if `max_segment_chars` is zero or `overlap_chars >= max_segment_chars`.
    pub fn new(max_segment_chars: usize, overlap_chars: usize) -> Self {
        assert!(max_segment_chars > 0, "max_segment_chars must be > 0");
        assert!(
            overlap_chars < max_segment_chars,
            "overlap_chars must be < max_segment_chars"
        );
        Self {
            max_segment_chars,
            overlap_chars,
        }
    }

    pub fn max_segment_chars(&self) -> usize {
        self.max_segment_chars
    }

    pub fn overlap_chars(&self) -> usize {
        self.overlap_chars
    }

    /// Paragraph pieces, each within budget, with the separator that precedes them.
    fn pieces(&self, text: &str) -> Vec<(&'static str, String)> {
        let normalized = text.replace("\r\n", "\n");
        let mut pieces = Vec::new();
        for paragraph in normalized.split("\n\n") {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }
            if char_len(paragraph) <= self.max_segment_chars {
                pieces.push(("\n\n", paragraph.to_string()));
                continue;
            }
            for (i, piece) in self.split_long(paragraph).into_iter().enumerate() {
                pieces.push((if i == 0 { "\n\n" } else { " " }, piece));
            }
        }
        pieces
    }

    fn split_long(&self, paragraph: &str) -> Vec<String> {
        let max = self.max_segment_chars;
        let mut out = Vec::new();
        let mut current = String::new();
        for word in paragraph.split_whitespace() {
            let words: Vec<String> = if char_len(word) > max {
                hard_split(word, max)
            } else {
                vec![word.to_string()]
            };
            for word in words {
                if current.is_empty() {
                    current = word;
                } else if char_len(&current) + 1 + char_len(&word) <= max {
                    current.push(' ');
                    current.push_str(&word);
                } else {
                    out.push(std::mem::replace(&mut current, word));
                }
            }
        }
        if !current.is_empty() {
            out.push(current);
        }
        out
    }
}

impl TextSplitter for ParagraphSplitter {
    fn split_text(&self, text: &str) -> Vec<String> {
        let max = self.max_segment_chars;
        let mut chunks = Vec::new();
        let mut current = String::new();

        for (separator, piece) in self.pieces(text) {
            if current.is_empty() {
                current = piece;
                continue;
            }
            if char_len(&current) + char_len(separator) + char_len(&piece) <= max {
                current.push_str(separator);
                current.push_str(&piece);
                continue;
            }

            let tail = overlap_tail(&current, self.overlap_chars).to_string();
            chunks.push(std::mem::take(&mut current));
            current = if !tail.is_empty() && char_len(&tail) + 1 + char_len(&piece) <= max {
                format!("{tail} {piece}")
            } else {
                piece
            };
        }

        if !current.is_empty() {
            chunks.push(current);
        }
        chunks
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn hard_split(word: &str, max: usize) -> Vec<String> {
    let chars: Vec<char> = word.chars().collect();
    chars.chunks(max).map(|c| c.iter().collect()).collect()
}

/// The last `n` chars of `s`, moved forward to the next word boundary.
fn overlap_tail(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    let len = char_len(s);
    if n >= len {
        return s.trim();
    }
    let start = s
        .char_indices()
        .nth(len - n)
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let tail = &s[start..];
    let mid_word = !s[..start].ends_with(char::is_whitespace)
        && !tail.starts_with(char::is_whitespace);
    let tail = if mid_word {
        match tail.find(char::is_whitespace) {
            Some(i) => &tail[i..],
            None => "",
        }
    } else {
        tail
    };
    tail.trim()
}
