//! Message segments in the OneBot array format (`{"type": .., "data": {..}}`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Ordered message content.
pub type Message = Vec<Element>;

/// One message segment.
///
/// Kinds the bridge does not translate are kept verbatim in `Unsupported` so
/// they survive a decode/encode cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawSegment", into = "RawSegment")]
pub enum Element {
    Text {
        text: String,
    },
    Image {
        file: String,
        url: Option<String>,
    },
    At {
        qq: String,
    },
    Reply {
        id: String,
    },
    Face {
        id: String,
    },
    Record {
        file: String,
    },
    Video {
        file: String,
    },
    Unsupported {
        kind: String,
        data: Map<String, Value>,
    },
}

impl Element {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Image segment pointing at a remote URL.
    pub fn image_url(url: impl Into<String>) -> Self {
        let url = url.into();
        Self::Image {
            file: url.clone(),
            url: Some(url),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::At { .. } => "at",
            Self::Reply { .. } => "reply",
            Self::Face { .. } => "face",
            Self::Record { .. } => "record",
            Self::Video { .. } => "video",
            Self::Unsupported { kind, .. } => kind.as_str(),
        }
    }
}

/// Wire form shared by the JSON and CQ-code encodings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSegment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl RawSegment {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data: Map::new(),
        }
    }

    fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.data.insert(key.to_string(), Value::String(value.into()));
        self
    }

    fn required(&self, key: &str) -> String {
        self.field(key).unwrap_or_default()
    }

    /// Reads a field that producers send either as a string or as a number.
    fn field(&self, key: &str) -> Option<String> {
        match self.data.get(key)? {
            Value::String(value) => Some(value.clone()),
            Value::Number(value) => Some(value.to_string()),
            Value::Bool(value) => Some(value.to_string()),
            _ => None,
        }
    }
}

impl From<RawSegment> for Element {
    fn from(raw: RawSegment) -> Self {
        match raw.kind.as_str() {
            "text" => Element::Text {
                text: raw.required("text"),
            },
            "image" => Element::Image {
                file: raw.required("file"),
                url: raw.field("url").filter(|url| !url.is_empty()),
            },
            "at" => Element::At { qq: raw.required("qq") },
            "reply" => Element::Reply { id: raw.required("id") },
            "face" => Element::Face { id: raw.required("id") },
            "record" => Element::Record {
                file: raw.required("file"),
            },
            "video" => Element::Video {
                file: raw.required("file"),
            },
            _ => Element::Unsupported {
                kind: raw.kind,
                data: raw.data,
            },
        }
    }
}

impl From<Element> for RawSegment {
    fn from(element: Element) -> Self {
        match element {
            Element::Text { text } => RawSegment::new("text").with("text", text),
            Element::Image { file, url } => {
                let segment = RawSegment::new("image").with("file", file);
                match url {
                    Some(url) => segment.with("url", url),
                    None => segment,
                }
            }
            Element::At { qq } => RawSegment::new("at").with("qq", qq),
            Element::Reply { id } => RawSegment::new("reply").with("id", id),
            Element::Face { id } => RawSegment::new("face").with("id", id),
            Element::Record { file } => RawSegment::new("record").with("file", file),
            Element::Video { file } => RawSegment::new("video").with("file", file),
            Element::Unsupported { kind, data } => RawSegment { kind, data },
        }
    }
}
