//! Frame boundary detection for the streamed XML wire format.
//!
//! The wire carries a sequence of top-level XML elements with no length
//! prefix and no enclosing document. The scanner walks bytes as they
//! arrive, tracks element nesting and quoting, and reports the byte range
//! of each complete top-level element. It is resumable: scanning stops when
//! the buffer is exhausted and picks up at the same point after more bytes
//! are appended.
//!
//! Recovery rules:
//! - text outside any element is reported once per run and skipped;
//! - a closing tag that does not match the open element discards the frame;
//! - the start of a known top-level tag inside an open frame truncates that
//!   frame and starts a new one;
//! - a frame larger than the limit is reported and then skipped up to its
//!   end without being buffered.

use std::ops::Range;

use crate::error::ProtocolError;

/// Tags that may only appear at the top level of the stream.
pub(crate) fn is_top_level(name: &str) -> bool {
    if matches!(name, "getProperties" | "delProperty" | "message" | "enableBLOB") {
        return true;
    }
    ["def", "set", "new"].iter().any(|verb| {
        name.strip_prefix(verb)
            .and_then(|rest| rest.strip_suffix("Vector"))
            .is_some_and(|kind| matches!(kind, "Text" | "Number" | "Switch" | "Light" | "BLOB"))
    })
}

fn is_name_start(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_' || byte == b':' || byte >= 0x80
}

fn is_name_char(byte: u8) -> bool {
    is_name_start(byte) || byte.is_ascii_digit() || byte == b'-' || byte == b'.'
}

/// Outcome of one scanning step.
#[derive(Debug)]
pub(crate) enum Scan {
    /// A complete top-level element occupies this buffer range.
    Frame(Range<usize>),
    /// Input was skipped.
    Error(ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lex {
    Text,
    Open,
    Bang,
    Comment { dashes: u8 },
    CData { brackets: u8 },
    Declaration,
    Instruction { question: bool },
    StartName,
    Attributes { quote: Option<u8>, slash: bool },
    EndName,
    EndTail,
}

#[derive(Debug)]
pub(crate) struct FrameScanner {
    buffer: Vec<u8>,
    pos: usize,
    lex: Lex,
    name: String,
    bang: Vec<u8>,
    tag_start: usize,
    frame_start: Option<usize>,
    stack: Vec<String>,
    in_garbage: bool,
    skipping: bool,
    max_frame: usize,
}

impl FrameScanner {
    pub(crate) fn new(max_frame: usize) -> Self {
        Self {
            buffer: Vec::new(),
            pos: 0,
            lex: Lex::Text,
            name: String::new(),
            bang: Vec::new(),
            tag_start: 0,
            frame_start: None,
            stack: Vec::new(),
            in_garbage: false,
            skipping: false,
            max_frame,
        }
    }

    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub(crate) fn slice(&self, range: Range<usize>) -> &[u8] {
        &self.buffer[range]
    }

    /// Bytes held back waiting for the rest of a frame.
    pub(crate) fn pending(&self) -> &[u8] {
        &self.buffer[self.keep_from()..self.pos]
    }

    /// Advances until a frame completes, input is skipped, or the buffer is
    /// exhausted (`None`).
    pub(crate) fn scan(&mut self) -> Option<Scan> {
        self.compact();
        while self.pos < self.buffer.len() {
            let at = self.pos;
            let byte = self.buffer[at];
            self.pos += 1;

            if let Some(found) = self.step(byte, at) {
                return Some(found);
            }
            if let Some(start) = self.frame_start
                && self.pos - start > self.max_frame
            {
                self.frame_start = None;
                self.skipping = true;
                return Some(Scan::Error(ProtocolError::FrameTooLarge {
                    max: self.max_frame,
                }));
            }
        }
        None
    }

    /// Drops bytes that can no longer be part of a frame.
    fn compact(&mut self) {
        let keep_from = self.keep_from();
        if keep_from == 0 {
            return;
        }
        self.buffer.drain(..keep_from);
        self.pos -= keep_from;
        self.tag_start = self.tag_start.saturating_sub(keep_from);
        if let Some(start) = self.frame_start.as_mut() {
            *start -= keep_from;
        }
    }

    fn keep_from(&self) -> usize {
        match (self.frame_start, self.lex) {
            (Some(start), _) => start,
            (None, Lex::Text) => self.pos,
            (None, _) => self.tag_start.min(self.pos),
        }
    }

    fn step(&mut self, byte: u8, at: usize) -> Option<Scan> {
        match self.lex {
            Lex::Text => {
                if byte == b'<' {
                    self.tag_start = at;
                    self.lex = Lex::Open;
                    self.in_garbage = false;
                } else if self.stack.is_empty() && !byte.is_ascii_whitespace() && !self.in_garbage {
                    self.in_garbage = true;
                    return Some(Scan::Error(ProtocolError::parse(
                        "stream",
                        "unexpected text between frames",
                    )));
                }
            }
            Lex::Open => match byte {
                b'/' => {
                    self.name.clear();
                    self.lex = Lex::EndName;
                }
                b'?' => self.lex = Lex::Instruction { question: false },
                b'!' => {
                    self.bang.clear();
                    self.lex = Lex::Bang;
                }
                b if is_name_start(b) => {
                    self.name.clear();
                    self.name.push(char::from(b));
                    self.lex = Lex::StartName;
                }
                _ => {
                    self.lex = Lex::Text;
                    if self.stack.is_empty() {
                        self.in_garbage = true;
                        return Some(Scan::Error(ProtocolError::parse(
                            "stream",
                            "stray '<' between frames",
                        )));
                    }
                }
            },
            Lex::Bang => {
                self.bang.push(byte);
                self.lex = if self.bang == b"--" {
                    Lex::Comment { dashes: 0 }
                } else if self.bang == b"[CDATA[" {
                    Lex::CData { brackets: 0 }
                } else if byte == b'>' {
                    Lex::Text
                } else if b"--".starts_with(&self.bang) || b"[CDATA[".starts_with(&self.bang) {
                    Lex::Bang
                } else {
                    Lex::Declaration
                };
            }
            Lex::Comment { dashes } => {
                self.lex = match byte {
                    b'-' => Lex::Comment {
                        dashes: (dashes + 1).min(2),
                    },
                    b'>' if dashes >= 2 => Lex::Text,
                    _ => Lex::Comment { dashes: 0 },
                };
            }
            Lex::CData { brackets } => {
                self.lex = match byte {
                    b']' => Lex::CData {
                        brackets: (brackets + 1).min(2),
                    },
                    b'>' if brackets >= 2 => Lex::Text,
                    _ => Lex::CData { brackets: 0 },
                };
            }
            Lex::Declaration => {
                if byte == b'>' {
                    self.lex = Lex::Text;
                }
            }
            Lex::Instruction { question } => {
                self.lex = match byte {
                    b'>' if question => Lex::Text,
                    b'?' => Lex::Instruction { question: true },
                    _ => Lex::Instruction { question: false },
                };
            }
            Lex::StartName => {
                if is_name_char(byte) {
                    self.name.push(char::from(byte));
                } else {
                    self.lex = Lex::Attributes {
                        quote: None,
                        slash: false,
                    };
                    if let Some(truncated) = self.open_element() {
                        // Re-read the terminator in attribute state.
                        self.pos = at;
                        return Some(truncated);
                    }
                    return self.attribute_byte(byte);
                }
            }
            Lex::Attributes { .. } => return self.attribute_byte(byte),
            Lex::EndName => {
                if is_name_char(byte) {
                    self.name.push(char::from(byte));
                } else if byte == b'>' {
                    self.lex = Lex::Text;
                    return self.close_element(true);
                } else {
                    self.lex = Lex::EndTail;
                }
            }
            Lex::EndTail => {
                if byte == b'>' {
                    self.lex = Lex::Text;
                    return self.close_element(true);
                }
            }
        }
        None
    }

    fn attribute_byte(&mut self, byte: u8) -> Option<Scan> {
        let Lex::Attributes { quote, slash } = self.lex else {
            return None;
        };
        match (quote, byte) {
            (Some(q), b) if b == q => {
                self.lex = Lex::Attributes {
                    quote: None,
                    slash: false,
                }
            }
            (Some(_), _) => {}
            (None, b'"' | b'\'') => {
                self.lex = Lex::Attributes {
                    quote: Some(byte),
                    slash: false,
                }
            }
            (None, b'/') => {
                self.lex = Lex::Attributes {
                    quote: None,
                    slash: true,
                }
            }
            (None, b'>') => {
                self.lex = Lex::Text;
                if slash {
                    return self.close_element(false);
                }
            }
            (None, _) => {
                self.lex = Lex::Attributes {
                    quote: None,
                    slash: false,
                }
            }
        }
        None
    }

    /// Pushes the element whose name was just read.
    fn open_element(&mut self) -> Option<Scan> {
        let name = std::mem::take(&mut self.name);
        let mut truncated = None;
        if !self.stack.is_empty() && is_top_level(&name) {
            if !self.skipping {
                truncated = Some(Scan::Error(ProtocolError::parse(
                    self.stack[0].clone(),
                    format!("truncated by <{name}>"),
                )));
            }
            self.stack.clear();
            self.skipping = false;
        }
        if self.stack.is_empty() && !self.skipping {
            self.frame_start = Some(self.tag_start);
        }
        self.stack.push(name);
        truncated
    }

    /// Pops an element. `explicit` is false for self-closing tags.
    fn close_element(&mut self, explicit: bool) -> Option<Scan> {
        let closing = std::mem::take(&mut self.name);
        let Some(open) = self.stack.pop() else {
            return Some(Scan::Error(ProtocolError::parse(
                closing,
                "closing tag without an open element",
            )));
        };

        if explicit && closing != open {
            let outer = self.stack.first().cloned().unwrap_or_else(|| open.clone());
            self.stack.clear();
            self.frame_start = None;
            let was_skipping = std::mem::take(&mut self.skipping);
            return (!was_skipping).then(|| {
                Scan::Error(ProtocolError::parse(
                    outer,
                    format!("expected </{open}>, found </{closing}>"),
                ))
            });
        }

        if !self.stack.is_empty() {
            return None;
        }
        let start = self.frame_start.take();
        if std::mem::take(&mut self.skipping) {
            return None;
        }
        start.map(|start| Scan::Frame(start..self.pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(scanner: &mut FrameScanner) -> Vec<Result<String, String>> {
        let mut out = Vec::new();
        while let Some(scan) = scanner.scan() {
            out.push(match scan {
                Scan::Frame(range) => {
                    Ok(String::from_utf8_lossy(scanner.slice(range)).into_owned())
                }
                Scan::Error(e) => Err(e.to_string()),
            });
        }
        out
    }

    fn scan_all(input: &str) -> Vec<Result<String, String>> {
        let mut scanner = FrameScanner::new(1024);
        scanner.extend(input.as_bytes());
        frames(&mut scanner)
    }

    #[test]
    fn splits_consecutive_frames() {
        let out = scan_all("<getProperties version='1.7'/>\n<delProperty device=\"A\"/>");
        assert_eq!(
            out,
            vec![
                Ok("<getProperties version='1.7'/>".to_string()),
                Ok("<delProperty device=\"A\"/>".to_string()),
            ]
        );
    }

    #[test]
    fn byte_at_a_time_feeding() {
        let input = "<setTextVector device=\"A\" name=\"P\"><oneText name=\"T\">a &gt; b</oneText></setTextVector>";
        let mut scanner = FrameScanner::new(1024);
        let mut out = Vec::new();
        for byte in input.as_bytes() {
            scanner.extend(std::slice::from_ref(byte));
            out.extend(frames(&mut scanner));
        }
        assert_eq!(out, vec![Ok(input.to_string())]);
    }

    #[test]
    fn quoted_gt_does_not_end_tag() {
        let out = scan_all("<message device=\"A\" message=\"x > y/\"/>");
        assert_eq!(out.len(), 1);
        assert!(out[0].is_ok());
    }

    #[test]
    fn comments_and_declarations_are_skipped() {
        let out = scan_all("<?xml version=\"1.0\"?><!-- <hello> --><enableBLOB>Also</enableBLOB>");
        assert_eq!(out, vec![Ok("<enableBLOB>Also</enableBLOB>".to_string())]);
    }

    #[test]
    fn garbage_between_frames_is_reported_once() {
        let out = scan_all("<delProperty device=\"A\"/>junk junk<delProperty device=\"B\"/>");
        assert_eq!(out.len(), 3);
        assert!(out[0].is_ok());
        assert!(out[1].is_err());
        assert!(out[2].is_ok());
    }

    #[test]
    fn truncated_frame_resyncs_at_next_top_level_tag() {
        let out = scan_all(
            "<defTextVector device=\"A\" name=\"P\"><defText name=\"T\">x<delProperty device=\"A\"/>",
        );
        assert_eq!(out.len(), 2);
        assert!(out[0].as_ref().is_err_and(|e| e.contains("truncated")));
        assert_eq!(out[1], Ok("<delProperty device=\"A\"/>".to_string()));
    }

    #[test]
    fn mismatched_close_discards_frame() {
        let out = scan_all("<setTextVector><oneText>x</oneNumber><delProperty device=\"A\"/>");
        assert!(out[0].as_ref().is_err_and(|e| e.contains("expected </oneText>")));
        assert_eq!(out.last(), Some(&Ok("<delProperty device=\"A\"/>".to_string())));
    }

    #[test]
    fn oversized_frame_is_skipped() {
        let mut scanner = FrameScanner::new(64);
        let big = format!(
            "<setBLOBVector device=\"A\" name=\"P\"><oneBLOB name=\"B\">{}</oneBLOB></setBLOBVector><delProperty device=\"A\"/>",
            "Q".repeat(500)
        );
        for chunk in big.as_bytes().chunks(16) {
            scanner.extend(chunk);
        }
        let out = frames(&mut scanner);
        assert_eq!(out.len(), 2);
        assert!(out[0].as_ref().is_err_and(|e| e.contains("too large")));
        assert_eq!(out[1], Ok("<delProperty device=\"A\"/>".to_string()));
    }

    #[test]
    fn top_level_names() {
        assert!(is_top_level("defBLOBVector"));
        assert!(is_top_level("newSwitchVector"));
        assert!(is_top_level("enableBLOB"));
        assert!(!is_top_level("oneText"));
        assert!(!is_top_level("defBlobVector"));
    }
}
