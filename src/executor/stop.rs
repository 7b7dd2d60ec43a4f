//! Stop-token sequence matching.

/// Matches any of a set of stop-token sequences against a growing stream of
/// sampled ids. One detector instance per candidate.
#[derive(Debug, Clone)]
pub struct StopTokenDetector {
    stop_sequences: Vec<Vec<u32>>,
    window: Vec<u32>,
}

impl StopTokenDetector {
    pub fn new(stop_sequences: Vec<Vec<u32>>) -> Self {
        let max_len = stop_sequences.iter().map(Vec::len).max().unwrap_or(0);
        Self {
            stop_sequences,
            window: Vec::with_capacity(max_len),
        }
    }

    /// Pushes a newly sampled id and reports whether a full stop sequence
    /// has now been matched.
    pub fn push(&mut self, id: u32) -> bool {
        self.window.push(id);
        let max_len = self.stop_sequences.iter().map(Vec::len).max().unwrap_or(0);
        if self.window.len() > max_len {
            let overflow = self.window.len() - max_len;
            self.window.drain(0..overflow);
        }
        self.stop_sequences
            .iter()
            .any(|seq| !seq.is_empty() && self.window.ends_with(seq))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn detects_a_single_token_stop_sequence() {
        let mut detector = StopTokenDetector::new(vec![vec![2]]);
        assert!(!detector.push(5));
        assert!(detector.push(2));
    }

    #[test]
    fn detects_a_multi_token_stop_sequence_across_calls() {
        let mut detector = StopTokenDetector::new(vec![vec![9, 10]]);
        assert!(!detector.push(9));
        assert!(detector.push(10));
    }

    #[test]
    fn unrelated_tokens_never_match() {
        let mut detector = StopTokenDetector::new(vec![vec![9, 10]]);
        for id in [1, 2, 3, 9, 3, 9] {
            assert!(!detector.push(id));
        }
    }
}
