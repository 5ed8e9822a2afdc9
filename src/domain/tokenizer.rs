//! Name and path templates.
//!
//! A template is literal text with `{key}` or `{key:format}` placeholders.
//! `{{` and `}}` stand for literal braces outside placeholders. The format
//! part is itself tokenized, so it may contain further placeholders; nesting
//! is bounded by a maximum depth where top-level placeholders count as 1.
//!
//! Tokenizing is pure. Values are substituted later by the action executor,
//! so one parsed template serves every file in a pass.

use crate::error::{Result, SorterError};

pub const DEFAULT_MAX_DEPTH: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    Placeholder(Placeholder),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Placeholder {
    pub key: String,
    /// Sub-format; its literal segments are date patterns.
    pub format: Option<Vec<Segment>>,
}

/// A parsed template together with its source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self> {
        Self::parse_with_depth(source, DEFAULT_MAX_DEPTH)
    }

    pub fn parse_with_depth(source: &str, max_depth: usize) -> Result<Self> {
        Ok(Self {
            source: source.to_string(),
            segments: tokenize(source, max_depth)?,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn has_placeholders(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Placeholder(_)))
    }
}

/// Splits a template into literal and placeholder segments.
pub fn tokenize(template: &str, max_depth: usize) -> Result<Vec<Segment>> {
    let mut parser = Parser {
        template,
        chars: template.char_indices().collect(),
        pos: 0,
        max_depth,
    };
    parser.segments(0)
}

struct Parser<'a> {
    template: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
    max_depth: usize,
}

impl Parser<'_> {
    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).map(|&(_, c)| c)
    }

    fn peek(&self) -> Option<char> {
        self.peek_at(0)
    }

    /// Byte offset of the current position.
    fn offset(&self) -> usize {
        self.chars
            .get(self.pos)
            .map_or(self.template.len(), |&(offset, _)| offset)
    }

    fn malformed(&self, position: usize, reason: &'static str) -> SorterError {
        SorterError::MalformedTemplate {
            template: self.template.to_string(),
            position,
            reason,
        }
    }

    /// Reads segments until the input ends or, inside a format
    /// (`depth > 0`), until the closing brace of the enclosing placeholder.
    fn segments(&mut self, depth: usize) -> Result<Vec<Segment>> {
        let mut segments = Vec::new();
        let mut literal = String::new();

        while let Some(c) = self.peek() {
            match c {
                '{' if depth == 0 && self.peek_at(1) == Some('{') => {
                    literal.push('{');
                    self.pos += 2;
                }
                '{' => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    let placeholder = self.placeholder(depth + 1)?;
                    segments.push(Segment::Placeholder(placeholder));
                }
                '}' if depth > 0 => break,
                '}' if self.peek_at(1) == Some('}') => {
                    literal.push('}');
                    self.pos += 2;
                }
                '}' => return Err(self.malformed(self.offset(), "unmatched '}'")),
                _ => {
                    literal.push(c);
                    self.pos += 1;
                }
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(segments)
    }

    fn placeholder(&mut self, depth: usize) -> Result<Placeholder> {
        let start = self.offset();
        if depth > self.max_depth {
            return Err(SorterError::TemplateTooDeep {
                template: self.template.to_string(),
                max_depth: self.max_depth,
            });
        }
        // opening brace
        self.pos += 1;

        let mut key = String::new();
        let has_format = loop {
            match self.peek() {
                None => return Err(self.malformed(start, "unclosed placeholder")),
                Some('}') => {
                    self.pos += 1;
                    break false;
                }
                Some(':') => {
                    self.pos += 1;
                    break true;
                }
                Some('{') => return Err(self.malformed(self.offset(), "'{' inside placeholder key")),
                Some(c) => {
                    key.push(c);
                    self.pos += 1;
                }
            }
        };

        let key = key.trim().to_string();
        if key.is_empty() {
            return Err(self.malformed(start, "empty placeholder key"));
        }

        if !has_format {
            return Ok(Placeholder { key, format: None });
        }

        let format = self.segments(depth)?;
        if self.peek() != Some('}') {
            return Err(self.malformed(start, "unclosed placeholder"));
        }
        self.pos += 1;

        Ok(Placeholder {
            key,
            format: Some(format),
        })
    }
}

/// Translates an LDML date pattern (`yyyy-MM-dd`) into a chrono format string.
///
/// Unknown pattern letters are kept literally; text in single quotes is
/// literal and `''` is a single quote.
pub fn ldml_to_strftime(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '\'' {
            if chars.get(i + 1) == Some(&'\'') {
                out.push('\'');
                i += 2;
                continue;
            }
            i += 1;
            while i < chars.len() && chars[i] != '\'' {
                push_literal(&mut out, chars[i]);
                i += 1;
            }
            // closing quote
            i += 1;
            continue;
        }

        if !c.is_ascii_alphabetic() {
            push_literal(&mut out, c);
            i += 1;
            continue;
        }

        let run = chars[i..].iter().take_while(|&&x| x == c).count();
        let spec = match (c, run) {
            ('y', 2) => "%y",
            ('y', _) => "%Y",
            ('M', 1) => "%-m",
            ('M', 2) => "%m",
            ('M', 3) => "%b",
            ('M', _) => "%B",
            ('d', 1) => "%-d",
            ('d', _) => "%d",
            ('D', _) => "%j",
            ('E', 1..=3) => "%a",
            ('E', _) => "%A",
            ('H', 1) => "%-H",
            ('H', _) => "%H",
            ('h', 1) => "%-I",
            ('h', _) => "%I",
            ('m', 1) => "%-M",
            ('m', _) => "%M",
            ('s', 1) => "%-S",
            ('s', _) => "%S",
            ('a', _) => "%p",
            ('Z', _) => "%z",
            ('z', _) => "%Z",
            _ => "",
        };

        if spec.is_empty() {
            for _ in 0..run {
                push_literal(&mut out, c);
            }
        } else {
            out.push_str(spec);
        }
        i += run;
    }

    out
}

fn push_literal(out: &mut String, c: char) {
    if c == '%' {
        out.push_str("%%");
    } else {
        out.push(c);
    }
}
