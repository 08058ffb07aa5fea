//! Sentence segmentation over incremental text.
//!
//! Boundaries:
//! - a run of `!` / `?`
//! - a run of `.` not immediately followed by a digit or a lowercase
//!   letter (so `$3.14` and `example.com` stay whole)
//! - a blank line (`\n\n`)
//!
//! Punctuation at the very end of the buffer is held until more text shows
//! what follows it. Fragments without any alphanumeric character are dropped.

#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    buffer: String,
}

impl SentenceSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a delta and return every sentence it completed.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);

        let mut sentences = Vec::new();
        while let Some(end) = find_boundary(&self.buffer) {
            let raw: String = self.buffer.drain(..end).collect();
            if let Some(sentence) = speakable(&raw) {
                sentences.push(sentence);
            }
        }
        sentences
    }

    /// Flush whatever is left at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        speakable(&rest)
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }
}

fn speakable(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    trimmed
        .chars()
        .any(char::is_alphanumeric)
        .then(|| trimmed.to_string())
}

/// Byte offset just past the first complete sentence, if any.
fn find_boundary(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match c {
            '!' | '?' => {
                let mut end = i + 1;
                while let Some(&(j, n)) = chars.peek() {
                    if n != '!' && n != '?' {
                        break;
                    }
                    end = j + 1;
                    chars.next();
                }
                // The run may continue in the next delta
                return chars.peek().map(|_| end);
            }
            '.' => {
                let mut end = i + 1;
                while let Some(&(j, '.')) = chars.peek() {
                    end = j + 1;
                    chars.next();
                }
                match chars.peek() {
                    // Wait for the next delta
                    None => return None,
                    Some(&(_, n)) if n.is_ascii_digit() || n.is_lowercase() => {}
                    Some(_) => return Some(end),
                }
            }
            '\n' => {
                if let Some(&(j, '\n')) = chars.peek() {
                    return Some(j + 1);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment_all(deltas: &[&str]) -> Vec<String> {
        let mut segmenter = SentenceSegmenter::new();
        let mut out: Vec<String> = deltas.iter().flat_map(|d| segmenter.push(d)).collect();
        out.extend(segmenter.finish());
        out
    }

    const PRICE: &str = "The cost is $3.14. Visit example.com today! Great.";

    #[test]
    fn decimals_and_domains_stay_whole() {
        assert_eq!(
            segment_all(&[PRICE]),
            vec!["The cost is $3.14.", "Visit example.com today!", "Great."]
        );
    }

    #[test]
    fn char_by_char_matches_whole() {
        let deltas: Vec<String> = PRICE.chars().map(String::from).collect();
        let refs: Vec<&str> = deltas.iter().map(String::as_str).collect();
        assert_eq!(segment_all(&refs), segment_all(&[PRICE]));
    }

    #[test]
    fn split_punctuation_run_matches_whole() {
        assert_eq!(segment_all(&["Really?", "! Yes"]), vec!["Really?!", "Yes"]);
        assert_eq!(
            segment_all(&["Wait!", "!", "? Ok"]),
            segment_all(&["Wait!!? Ok"])
        );

        let text = "Really?! Yes!!! Sure? ok";
        let deltas: Vec<String> = text.chars().map(String::from).collect();
        let refs: Vec<&str> = deltas.iter().map(String::as_str).collect();
        assert_eq!(segment_all(&refs), segment_all(&[text]));
    }

    #[test]
    fn trailing_question_is_held() {
        let mut s = SentenceSegmenter::new();
        assert!(s.push("Ready?").is_empty());
        assert_eq!(s.push(" Go"), vec!["Ready?"]);
        assert_eq!(s.finish().as_deref(), Some("Go"));
    }

    #[test]
    fn trailing_period_is_held() {
        let mut s = SentenceSegmenter::new();
        assert!(s.push("It costs 3.").is_empty());
        assert_eq!(s.pending(), "It costs 3.");
        assert!(s.push("5 dollars").is_empty());
        assert_eq!(s.finish().as_deref(), Some("It costs 3.5 dollars"));
    }

    #[test]
    fn held_period_released_by_next_delta() {
        let mut s = SentenceSegmenter::new();
        assert!(s.push("Done.").is_empty());
        assert_eq!(s.push(" Next"), vec!["Done."]);
    }

    #[test]
    fn question_and_exclamation_runs() {
        assert_eq!(
            segment_all(&["Really?! Yes!!! ok"]),
            vec!["Really?!", "Yes!!!", "ok"]
        );
    }

    #[test]
    fn ellipsis_is_one_boundary() {
        assert_eq!(segment_all(&["Well... Fine."]), vec!["Well...", "Fine."]);
    }

    #[test]
    fn blank_line_forces_boundary() {
        assert_eq!(
            segment_all(&["Summary\n", "\nFirst point"]),
            vec!["Summary", "First point"]
        );
    }

    #[test]
    fn fragments_without_alphanumerics_are_dropped() {
        assert_eq!(segment_all(&["!!! ... Hi."]), vec!["Hi."]);
        assert!(segment_all(&["  \n\n  "]).is_empty());
    }

    #[test]
    fn multibyte_text() {
        assert_eq!(
            segment_all(&["Café au lait? Très bien."]),
            vec!["Café au lait?", "Très bien."]
        );
    }
}
