//! CQ-code text encoding (`[CQ:type,key=value,...]` embedded in plain text).

use regex::Regex;
use serde_json::Value;

use crate::element::{Element, RawSegment};

const TEXT_ESCAPES: [(&str, &str); 3] = [("&", "&amp;"), ("[", "&#91;"), ("]", "&#93;")];
const PARAM_ESCAPES: [(&str, &str); 1] = [(",", "&#44;")];

/// Escapes plain text so it cannot be mistaken for a CQ code.
pub fn escape(text: &str) -> String {
    TEXT_ESCAPES
        .iter()
        .fold(text.to_string(), |acc, (raw, escaped)| acc.replace(raw, escaped))
}

/// Escapes a CQ-code parameter value, which additionally cannot contain commas.
pub fn escape_param(value: &str) -> String {
    PARAM_ESCAPES
        .iter()
        .fold(escape(value), |acc, (raw, escaped)| acc.replace(raw, escaped))
}

/// Reverses [`escape_param`]; `&amp;` is restored last.
pub fn unescape(text: &str) -> String {
    PARAM_ESCAPES
        .iter()
        .chain(TEXT_ESCAPES.iter().rev())
        .fold(text.to_string(), |acc, (raw, escaped)| acc.replace(escaped, raw))
}

/// Parser for CQ-code messages.
#[derive(Debug, Clone)]
pub struct CqCodec {
    pattern: Regex,
}

impl CqCodec {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(r"\[CQ:([A-Za-z0-9_.\-]+)((?:,[^\]]*)?)\]")?,
        })
    }

    /// Splits `text` into segments, keeping plain text between codes.
    pub fn parse(&self, text: &str) -> Vec<Element> {
        let mut elements = Vec::new();
        let mut cursor = 0;
        for captures in self.pattern.captures_iter(text) {
            let Some(whole) = captures.get(0) else {
                continue;
            };
            push_text(&mut elements, &text[cursor..whole.start()]);

            let mut segment = RawSegment::new(&captures[1]);
            if let Some(params) = captures.get(2) {
                for pair in params.as_str().split(',').filter(|pair| !pair.is_empty()) {
                    if let Some((key, value)) = pair.split_once('=') {
                        segment
                            .data
                            .insert(key.trim().to_string(), Value::String(unescape(value)));
                    }
                }
            }
            elements.push(Element::from(segment));
            cursor = whole.end();
        }
        push_text(&mut elements, &text[cursor..]);
        elements
    }
}

/// Renders segments as CQ-code text, as used for OneBot `raw_message`.
pub fn render_message(elements: &[Element]) -> String {
    let mut rendered = String::new();
    for element in elements {
        if let Element::Text { text } = element {
            rendered.push_str(&escape(text));
            continue;
        }
        let segment = RawSegment::from(element.clone());
        rendered.push_str("[CQ:");
        rendered.push_str(&segment.kind);
        for (key, value) in &segment.data {
            let value = match value {
                Value::String(value) => value.clone(),
                other => other.to_string(),
            };
            rendered.push(',');
            rendered.push_str(key);
            rendered.push('=');
            rendered.push_str(&escape_param(&value));
        }
        rendered.push(']');
    }
    rendered
}

fn push_text(elements: &mut Vec<Element>, raw: &str) {
    if raw.is_empty() {
        return;
    }
    elements.push(Element::text(unescape(raw)));
}
