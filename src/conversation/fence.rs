//! Streaming tool-call fence scanner: a two-state (`Outside` / `InsideFence`)
//! scan over accumulated decoded text with a moving cursor, so a fence can be
//! detected even when its start/end markers straddle two decode steps.

/// One unit of text the scanner has finished classifying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FenceEvent {
    /// Plain text outside any fence.
    Text(String),
    /// A complete fenced block, markers included.
    ToolBlock(String),
}

/// Length of the longest suffix of `a` that is also a prefix of `b` — used to
/// detect a fence marker that has started but not yet fully arrived at the
/// end of the buffer (`internal_callback_util.cc`'s `SuffixPrefixOverlap`).
pub fn suffix_prefix_overlap(a: &str, b: &str) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let max_overlap = a.len().min(b.len());
    for len in (1..=max_overlap).rev() {
        if a.as_bytes()[a.len() - len..] == b.as_bytes()[..len] {
            return len;
        }
    }
    0
}

pub struct FenceParser {
    start: String,
    end: String,
    buffer: String,
    cursor: usize,
    inside: bool,
}

impl FenceParser {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            buffer: String::new(),
            cursor: 0,
            inside: false,
        }
    }

    /// Feeds one newly decoded chunk, returning every event the scan can now
    /// resolve. Text that might be the start of a fence marker is held back
    /// until either a full match or a full mismatch is known.
    pub fn feed(&mut self, chunk: &str) -> Vec<FenceEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        loop {
            if self.cursor >= self.buffer.len() {
                break;
            }

            if !self.inside {
                match self.buffer[self.cursor..].find(self.start.as_str()) {
                    Some(rel_pos) => {
                        let abs_pos = self.cursor + rel_pos;
                        if abs_pos > self.cursor {
                            events.push(FenceEvent::Text(self.buffer[self.cursor..abs_pos].to_string()));
                        }
                        self.cursor = abs_pos;
                        self.inside = true;
                    }
                    None => {
                        let overlap = suffix_prefix_overlap(&self.buffer[self.cursor..], &self.start);
                        if overlap > 0 {
                            let possible_start = self.buffer.len() - overlap;
                            if possible_start > self.cursor {
                                events.push(FenceEvent::Text(
                                    self.buffer[self.cursor..possible_start].to_string(),
                                ));
                            }
                            self.cursor = possible_start;
                            break;
                        } else {
                            events.push(FenceEvent::Text(self.buffer[self.cursor..].to_string()));
                            self.cursor = self.buffer.len();
                            break;
                        }
                    }
                }
            }

            if self.inside {
                let search_from = self.cursor + self.start.len();
                match self.buffer.get(search_from..).and_then(|s| s.find(self.end.as_str())) {
                    Some(rel_pos) => {
                        let abs_end = search_from + rel_pos + self.end.len();
                        events.push(FenceEvent::ToolBlock(self.buffer[self.cursor..abs_end].to_string()));
                        self.cursor = abs_end;
                        self.inside = false;
                    }
                    None => break,
                }
            }
        }

        events
    }

    /// Called once the decode stream has reached a terminal state: flushes
    /// whatever is left unresolved as plain text rather than failing — an
    /// unterminated fence at end of stream degrades to text.
    pub fn finish(&mut self) -> Option<FenceEvent> {
        if self.cursor < self.buffer.len() {
            let rest = self.buffer[self.cursor..].to_string();
            self.cursor = self.buffer.len();
            Some(FenceEvent::Text(rest))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn suffix_prefix_overlap_finds_longest_match() {
        assert_eq!(suffix_prefix_overlap("text```tool_", "```tool_code\n"), 8);
        assert_eq!(suffix_prefix_overlap("text", "```tool_code\n"), 0);
        assert_eq!(suffix_prefix_overlap("", "```"), 0);
    }

    #[test]
    fn single_chunk_with_full_fence_yields_text_then_block() {
        let mut parser = FenceParser::new("```tool_code\n", "\n```");
        let events = parser.feed("hi ```tool_code\nfoo(x=1)\n``` bye");
        assert_eq!(
            events,
            vec![
                FenceEvent::Text("hi ".to_string()),
                FenceEvent::ToolBlock("```tool_code\nfoo(x=1)\n```".to_string()),
                FenceEvent::Text(" bye".to_string()),
            ]
        );
    }

    #[test]
    fn fence_marker_split_across_chunk_boundary_is_not_lost() {
        let mut parser = FenceParser::new("```tool_code\n", "\n```");

        let e1 = parser.feed("text```tool_");
        assert_eq!(e1, vec![FenceEvent::Text("text".to_string())]);

        let e2 = parser.feed("code\n");
        assert!(e2.is_empty(), "still inside the fence start, nothing to emit yet");

        let e3 = parser.feed("tool_name(x=1)");
        assert!(e3.is_empty());

        let e4 = parser.feed("\n```");
        assert_eq!(
            e4,
            vec![FenceEvent::ToolBlock("```tool_code\ntool_name(x=1)\n```".to_string())]
        );
    }

    #[test]
    fn unterminated_fence_at_stream_end_flushes_as_text() {
        let mut parser = FenceParser::new("```tool_code\n", "\n```");
        parser.feed("```tool_code\nfoo()");
        assert_eq!(
            parser.finish(),
            Some(FenceEvent::Text("```tool_code\nfoo()".to_string()))
        );
        assert_eq!(parser.finish(), None);
    }

    #[test]
    fn plain_text_with_no_fence_passes_through_untouched() {
        let mut parser = FenceParser::new("```tool_code\n", "\n```");
        let events = parser.feed("just some plain text");
        assert_eq!(events, vec![FenceEvent::Text("just some plain text".to_string())]);
    }
}
