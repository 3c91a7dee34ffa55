//! Sentence aggregation for synthesis.
//!
//! Responders stream text in arbitrary chunks; speech engines sound better
//! when given whole sentences. The aggregator buffers chunks and releases text
//! at sentence boundaries.

const TERMINATORS: [char; 6] = ['.', '!', '?', ';', '\n', '。'];

#[derive(Debug, Default)]
pub struct SentenceAggregator {
    buffer: String,
    min_chars: usize,
}

impl SentenceAggregator {
    /// `min_chars` keeps very short fragments ("Hi.") joined to what follows.
    pub fn new(min_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            min_chars,
        }
    }

    /// Adds a chunk and returns every sentence it completed, in order.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut sentences = Vec::new();
        loop {
            let boundary = self
                .buffer
                .char_indices()
                .filter(|(_, c)| TERMINATORS.contains(c))
                .map(|(i, c)| i + c.len_utf8())
                .find(|&end| self.is_boundary(end) && self.buffer[..end].trim().len() >= self.min_chars);
            let Some(end) = boundary else {
                break;
            };
            let sentence = self.buffer[..end].trim().to_string();
            self.buffer.drain(..end);
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
        }
        sentences
    }

    /// Returns whatever is left, e.g. at the end of a response.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    /// A terminator only ends a sentence once the next character is known to
    /// be whitespace, so "3.5" and "e.g" stay intact while streaming.
    fn is_boundary(&self, end: usize) -> bool {
        match self.buffer[end..].chars().next() {
            Some(next) => next.is_whitespace(),
            None => self.buffer[..end].ends_with('\n'),
        }
    }
}
