//! Incremental sentence chunking for streamed model output.
//!
//! Fragments arrive in arbitrary pieces (`"Hel"`, `"lo. Ho"`, `"w are"`), so
//! the chunker buffers text until it sees a boundary and only then emits a
//! [`SpeakableUnit`]. Boundaries are:
//!
//! - `.`, `!` or `?`, plus any trailing closers (`"`, `)`, `*`, …), followed
//!   by whitespace. A terminator at the very end of the buffer waits for the
//!   next fragment, since `3.` may still become `3.14`.
//! - a newline.
//! - the safety valve: unpunctuated text longer than `max_len` bytes is cut at
//!   the last space in the window, or hard-split when there is none.
//!
//! Markdown blocks are kept whole so the speech cleaner sees all of them. A
//! ```` ``` ```` fence is its own unit, held back until the closing fence
//! arrives, and a run of `|…|` table rows is emitted as one unit once a line
//! that isn't a row follows. Neither is subject to the safety valve.
//!
//! Units are trimmed and never empty. Whitespace between units is dropped.

use crate::types::SpeakableUnit;

/// Default maximum unit length in bytes.
pub const DEFAULT_MAX_UNIT_LEN: usize = 200;

const TERMINATORS: &[char] = &['.', '!', '?'];
const CLOSERS: &[char] = &['.', ':', ';', '!', '?', ')', '*', '"', '\'', '\u{201d}', '\u{2019}'];

/// Accumulates fragments and yields speakable units in order.
#[derive(Debug)]
pub struct TextChunker {
    buffer: String,
    max_len: usize,
    next_index: usize,
}

impl Default for TextChunker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_UNIT_LEN)
    }
}

impl TextChunker {
    pub fn new(max_len: usize) -> Self {
        Self {
            buffer: String::new(),
            max_len: max_len.max(1),
            next_index: 0,
        }
    }

    /// Append a fragment and return every unit it completed.
    pub fn feed(&mut self, fragment: &str) -> Vec<SpeakableUnit> {
        self.buffer.push_str(fragment);

        let mut units = Vec::new();
        loop {
            let cut = match scan(&self.buffer) {
                Scan::Block(end) => end,
                Scan::Hold => break,
                Scan::Sentence(end) if end <= self.max_len => end,
                _ if self.buffer.len() > self.max_len => {
                    force_split_point(&self.buffer, self.max_len)
                }
                _ => break,
            };

            let head: String = self.buffer.drain(..cut).collect();
            let rest_start = self.buffer.len() - self.buffer.trim_start().len();
            self.buffer.drain(..rest_start);

            if let Some(unit) = self.make_unit(&head) {
                units.push(unit);
            }
        }
        units
    }

    /// Emit whatever is left as a final unit. Called once the stream ends.
    pub fn flush(&mut self) -> Option<SpeakableUnit> {
        let rest = std::mem::take(&mut self.buffer);
        self.make_unit(&rest)
    }

    /// Text received but not yet emitted.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    /// Number of units emitted so far; also the index the next unit will get.
    pub fn units_emitted(&self) -> usize {
        self.next_index
    }

    fn make_unit(&mut self, text: &str) -> Option<SpeakableUnit> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let unit = SpeakableUnit {
            index: self.next_index,
            text: text.to_string(),
        };
        self.next_index += 1;
        Some(unit)
    }
}

const FENCE: &str = "```";

/// Where the next unit of `text` ends.
#[derive(Debug, PartialEq, Eq)]
enum Scan {
    /// Sentence or line boundary; subject to the length limit.
    Sentence(usize),
    /// End of a complete fence or table; always honoured.
    Block(usize),
    /// Inside an unfinished fence or table.
    Hold,
    /// Plain text with no boundary yet.
    Open,
}

/// Find the first boundary in `text`. `text` never starts with whitespace.
fn scan(text: &str) -> Scan {
    if text.starts_with(FENCE) {
        return match text[FENCE.len()..].find(FENCE) {
            Some(close) => Scan::Block(FENCE.len() + close + FENCE.len()),
            None => Scan::Hold,
        };
    }
    if text.starts_with('|') {
        return table_end(text);
    }

    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if c == '\n' {
            return Scan::Sentence(i + 1);
        }
        // Text before a fence goes out on its own.
        if c == '`' && text[i..].starts_with(FENCE) {
            return Scan::Sentence(i);
        }
        if !TERMINATORS.contains(&c) {
            continue;
        }

        let mut end = i + c.len_utf8();
        while let Some(&(j, next)) = chars.peek() {
            if !CLOSERS.contains(&next) {
                break;
            }
            end = j + next.len_utf8();
            chars.next();
        }

        match chars.peek() {
            Some(&(_, next)) if next.is_whitespace() => return Scan::Sentence(end),
            Some(_) => continue,
            None => return Scan::Open,
        }
    }

    Scan::Open
}

/// End of the table starting at the top of `text`: just past the last row,
/// once the following line is known not to be a row.
fn table_end(text: &str) -> Scan {
    let mut line_start = 0;
    loop {
        let rest = &text[line_start..];
        let first = rest.trim_start_matches([' ', '\t']).chars().next();
        match first {
            // Next line undecided.
            None => return Scan::Hold,
            Some('|') => match rest.find('\n') {
                Some(nl) => line_start += nl + 1,
                None => return Scan::Hold,
            },
            Some(_) => return Scan::Block(line_start),
        }
    }
}

/// Where to cut unpunctuated text that outgrew `max_len`.
///
/// Prefers the last space in the window if it lies past a third of it,
/// otherwise hard-splits on the nearest char boundary.
fn force_split_point(text: &str, max_len: usize) -> usize {
    let mut window_end = max_len.min(text.len());
    while !text.is_char_boundary(window_end) {
        window_end -= 1;
    }
    if window_end == 0 {
        // A single char wider than max_len.
        return text.chars().next().map_or(text.len(), char::len_utf8);
    }

    match text[..window_end].rfind(' ') {
        Some(pos) if pos > 0 && pos >= max_len / 3 => pos,
        _ => window_end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text_prep::{clean_text_for_tts, is_speakable};

    fn texts(units: &[SpeakableUnit]) -> Vec<&str> {
        units.iter().map(|u| u.text.as_str()).collect()
    }

    fn run(fragments: &[&str], max_len: usize) -> Vec<SpeakableUnit> {
        let mut chunker = TextChunker::new(max_len);
        let mut units = Vec::new();
        for f in fragments {
            units.extend(chunker.feed(f));
        }
        units.extend(chunker.flush());
        units
    }

    #[test]
    fn boundary_then_flush() {
        let mut chunker = TextChunker::default();
        let first = chunker.feed("Hello world. ");
        assert_eq!(texts(&first), vec!["Hello world."]);
        assert!(chunker.feed("How are you?").is_empty());
        let last = chunker.flush().unwrap();
        assert_eq!(last.text, "How are you?");
        assert_eq!(last.index, 1);
    }

    #[test]
    fn sentence_split_across_fragments() {
        let mut chunker = TextChunker::default();
        assert!(chunker.feed("Hel").is_empty());
        assert!(chunker.feed("lo wor").is_empty());
        let units = chunker.feed("ld. How");
        assert_eq!(texts(&units), vec!["Hello world."]);
        assert_eq!(chunker.pending(), "How");
    }

    #[test]
    fn terminator_at_buffer_end_waits() {
        let mut chunker = TextChunker::default();
        assert!(chunker.feed("Pi is about 3.").is_empty());
        let units = chunker.feed("14 in most cases. Next");
        assert_eq!(texts(&units), vec!["Pi is about 3.14 in most cases."]);
    }

    #[test]
    fn closers_stay_with_their_sentence() {
        let units = run(&["He said \"stop!\" Then (quietly.) he left."], 200);
        assert_eq!(
            texts(&units),
            vec!["He said \"stop!\"", "Then (quietly.)", "he left."]
        );
    }

    #[test]
    fn several_sentences_in_one_fragment() {
        let units = run(&["Really? Yes! OK. Done"], 200);
        assert_eq!(texts(&units), vec!["Really?", "Yes!", "OK.", "Done"]);
        let indices: Vec<usize> = units.iter().map(|u| u.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn newline_is_a_boundary() {
        let units = run(&["## Title\n", "Body without a period"], 200);
        assert_eq!(texts(&units), vec!["## Title", "Body without a period"]);
    }

    #[test]
    fn whitespace_only_is_absorbed() {
        let mut chunker = TextChunker::default();
        assert!(chunker.feed("   \n\n  ").is_empty());
        assert!(chunker.feed("\t").is_empty());
        assert_eq!(chunker.flush(), None);
        assert_eq!(chunker.units_emitted(), 0);
    }

    #[test]
    fn flush_clears_state() {
        let mut chunker = TextChunker::default();
        chunker.feed("trailing words");
        assert!(chunker.flush().is_some());
        assert_eq!(chunker.pending(), "");
        assert_eq!(chunker.flush(), None);
    }

    #[test]
    fn safety_valve_cuts_at_word_boundary() {
        let text = "word ".repeat(60);
        let mut chunker = TextChunker::new(40);
        let units = chunker.feed(&text);
        assert!(units.len() >= 5);
        for unit in &units {
            assert!(unit.text.len() <= 40, "unit too long: {}", unit.text.len());
            assert!(!unit.text.starts_with(' ') && !unit.text.ends_with(' '));
        }
    }

    #[test]
    fn safety_valve_hard_splits_long_words() {
        let units = run(&[&"a".repeat(100)], 30);
        let lens: Vec<usize> = units.iter().map(|u| u.text.len()).collect();
        assert_eq!(lens, vec![30, 30, 30, 10]);
    }

    #[test]
    fn hard_split_respects_char_boundaries() {
        let units = run(&[&"é".repeat(50)], 15);
        assert!(!units.is_empty());
        for unit in &units {
            assert!(unit.text.len() <= 15);
        }
        let joined: String = units.iter().map(|u| u.text.as_str()).collect();
        assert_eq!(joined, "é".repeat(50));
    }

    #[test]
    fn tiny_max_len_still_makes_progress() {
        let units = run(&["ab cd"], 1);
        let joined: String = units.iter().map(|u| u.text.as_str()).collect();
        assert_eq!(joined, "abcd");
    }

    /// What the renderer would be asked to say.
    fn spoken(units: &[SpeakableUnit]) -> Vec<String> {
        units
            .iter()
            .map(|u| clean_text_for_tts(&u.text))
            .filter(|t| is_speakable(t))
            .collect()
    }

    #[test]
    fn code_fence_is_one_unit() {
        let units = run(
            &["Here is code:\n", "```rust\n", "let x = compute(1, 2);\n", "```\n", "Done."],
            200,
        );
        assert_eq!(
            texts(&units),
            vec!["Here is code:", "```rust\nlet x = compute(1, 2);\n```", "Done."]
        );
        assert_eq!(
            spoken(&units),
            vec!["Here is code:", "See the code in our conversation.", "Done."]
        );
    }

    #[test]
    fn open_fence_holds_until_closed() {
        let mut chunker = TextChunker::new(20);
        assert_eq!(texts(&chunker.feed("Look. ``")), vec!["Look."]);
        assert!(chunker.feed("`\nfn long_function_name() {}\n").is_empty());
        assert!(chunker.feed("let y = 2;\n").is_empty());
        let units = chunker.feed("```\nAfter");
        assert_eq!(units.len(), 1);
        assert!(units[0].text.starts_with("```") && units[0].text.ends_with("```"));
        assert_eq!(chunker.pending(), "After");
    }

    #[test]
    fn text_before_a_fence_is_cut_off() {
        let units = run(&["Run ```ls``` now"], 200);
        assert_eq!(texts(&units), vec!["Run", "```ls```", "now"]);
    }

    #[test]
    fn unclosed_fence_is_flushed_whole() {
        let units = run(&["```\n", &"x = 1\n".repeat(20)], 16);
        assert_eq!(units.len(), 1);
        assert_eq!(spoken(&units), vec!["See the code in our conversation."]);
    }

    #[test]
    fn table_rows_form_one_unit() {
        let fragments = [
            "Scores:\n",
            "| name | pts |\n",
            "|---|---|\n",
            "| ann | 3 |\n",
            "| bo",
            "b | 5 |\n",
            "That's all.",
        ];
        let units = run(&fragments, 200);
        assert_eq!(units.len(), 3);
        assert_eq!(units[1].text.lines().count(), 4);
        let said = spoken(&units);
        let pointers = said
            .iter()
            .filter(|t| t.contains("See the table in our conversation."))
            .count();
        assert_eq!(pointers, 1);
        assert_eq!(said.last().map(String::as_str), Some("That's all."));
    }

    #[test]
    fn table_waits_for_the_next_line() {
        let mut chunker = TextChunker::default();
        assert!(chunker.feed("| a | b |\n").is_empty());
        assert!(chunker.feed("  ").is_empty());
        let units = chunker.feed("\nNext line.");
        assert_eq!(texts(&units), vec!["| a | b |"]);
        assert_eq!(chunker.flush().unwrap().text, "Next line.");
    }

    #[test]
    fn concatenated_units_reproduce_the_text() {
        let samples = [
            "Hello world. How are you? I'm fine!\nThanks for asking.",
            "Version 2.5 shipped. Prices rose by 3.5% (roughly.) Fine",
            "No punctuation at all just a long run of words that keeps going and going",
            "  leading space. trailing space.  ",
            "See:\n```sh\nmake all\n```\n| k | v |\n| a | 1 |\nend.",
        ];
        let strip = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();

        for text in samples {
            for width in 1..=7 {
                let chars: Vec<char> = text.chars().collect();
                let fragments: Vec<String> =
                    chars.chunks(width).map(|c| c.iter().collect()).collect();
                let refs: Vec<&str> = fragments.iter().map(String::as_str).collect();

                let units = run(&refs, 24);
                for (i, unit) in units.iter().enumerate() {
                    assert_eq!(unit.index, i);
                    assert!(!unit.text.trim().is_empty());
                    assert_eq!(unit.text, unit.text.trim());
                }
                let joined: String = units.iter().map(|u| u.text.as_str()).collect();
                assert_eq!(strip(&joined), strip(text), "width {width}: {text}");
            }
        }
    }
}
