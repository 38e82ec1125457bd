//! Streamed decoding of wire frames into typed messages.

use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::{debug, trace};

use indibus_core::{
    BlobEnable, BlobValue, DefElement, DefVector, DelProperty, EnableBlob, GetProperties, Message,
    NewVector, NumberFormat, OneElement, PropertyKind, SetVector, TextMessage, WireValue,
    parse_number,
};

use crate::MAX_FRAME_SIZE;
use crate::error::{ProtocolError, ProtocolResult};
use crate::scanner::{FrameScanner, Scan};

/// Incremental decoder for the wire stream.
///
/// Bytes are pushed with [`feed`](Self::feed) in chunks of any size;
/// [`next_message`](Self::next_message) yields every message that is
/// complete so far. Malformed frames come out as recoverable errors and
/// decoding continues with the next frame. Frames with unknown tags are
/// dropped silently.
#[derive(Debug)]
pub struct StreamDecoder {
    scanner: FrameScanner,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Creates a decoder that discards frames larger than `max` bytes.
    pub fn with_max_frame_size(max: usize) -> Self {
        Self {
            scanner: FrameScanner::new(max),
        }
    }

    /// Appends received bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.scanner.extend(bytes);
    }

    /// Returns true if part of a frame is buffered.
    pub fn has_partial_frame(&self) -> bool {
        self.scanner
            .pending()
            .iter()
            .any(|b| !b.is_ascii_whitespace())
    }

    /// Returns the next decoded message, or `None` if more input is needed.
    pub fn next_message(&mut self) -> Option<ProtocolResult<Message>> {
        loop {
            match self.scanner.scan()? {
                Scan::Error(e) => return Some(Err(e)),
                Scan::Frame(range) => match parse_frame(self.scanner.slice(range)) {
                    Ok(Some(message)) => return Some(Ok(message)),
                    Ok(None) => continue,
                    Err(e) => return Some(Err(e)),
                },
            }
        }
    }
}

/// Decodes one complete frame.
///
/// Returns `Ok(None)` for well-formed frames with an unknown tag.
pub fn parse_frame(bytes: &[u8]) -> ProtocolResult<Option<Message>> {
    let node = XmlNode::parse(bytes)?;
    let message = match node.name.as_str() {
        "getProperties" => Some(Message::GetProperties(GetProperties {
            version: node.attr("version").map(str::to_string),
            device: node.attr("device").map(str::to_string),
            name: node.attr("name").map(str::to_string),
        })),
        "delProperty" => Some(Message::Delete(DelProperty {
            device: node.required("device")?.to_string(),
            name: node.attr("name").map(str::to_string),
            timestamp: node.attr("timestamp").map(str::to_string),
            message: node.attr("message").map(str::to_string),
        })),
        "message" => Some(Message::Notify(TextMessage {
            device: node.attr("device").map(str::to_string),
            timestamp: node.attr("timestamp").map(str::to_string),
            message: node.attr("message").unwrap_or_default().to_string(),
        })),
        "enableBLOB" => Some(Message::EnableBlob(EnableBlob {
            device: node.attr("device").map(str::to_string),
            name: node.attr("name").map(str::to_string),
            policy: node.token::<BlobEnable>(node.text.trim())?,
        })),
        other => match split_vector_tag(other) {
            Some(("def", kind)) => Some(Message::Define(def_vector(&node, kind)?)),
            Some(("set", kind)) => Some(Message::Set(set_vector(&node, kind)?)),
            Some(("new", kind)) => Some(Message::New(new_vector(&node, kind)?)),
            _ => {
                trace!(tag = %other, "skipping unknown frame");
                None
            }
        },
    };
    Ok(message)
}

fn split_vector_tag(tag: &str) -> Option<(&'static str, PropertyKind)> {
    ["def", "set", "new"].into_iter().find_map(|verb| {
        let fragment = tag.strip_prefix(verb)?.strip_suffix("Vector")?;
        PropertyKind::from_tag_fragment(fragment).map(|kind| (verb, kind))
    })
}

fn def_vector(node: &XmlNode, kind: PropertyKind) -> ProtocolResult<DefVector> {
    let child_tag = format!("def{}", kind.tag_fragment());
    let elements = node
        .children
        .iter()
        .filter(|c| c.name == child_tag)
        .map(|child| {
            let number = match kind {
                PropertyKind::Number => Some(NumberFormat {
                    format: child.attr("format").unwrap_or("%g").to_string(),
                    min: child.number("min")?.unwrap_or(0.0),
                    max: child.number("max")?.unwrap_or(0.0),
                    step: child.number("step")?.unwrap_or(0.0),
                }),
                _ => None,
            };
            Ok(DefElement {
                name: child.required("name")?.to_string(),
                label: child.attr("label").map(str::to_string),
                value: child.scalar(),
                number,
            })
        })
        .collect::<ProtocolResult<Vec<_>>>()?;

    Ok(DefVector {
        kind,
        device: node.required("device")?.to_string(),
        name: node.required("name")?.to_string(),
        label: node.attr("label").map(str::to_string),
        group: node.attr("group").map(str::to_string),
        state: node
            .attr("state")
            .map(|s| node.token(s))
            .transpose()?
            .unwrap_or_default(),
        permission: node.attr("perm").map(|s| node.token(s)).transpose()?,
        rule: node.attr("rule").map(|s| node.token(s)).transpose()?,
        timeout: node.number("timeout")?,
        timestamp: node.attr("timestamp").map(str::to_string),
        message: node.attr("message").map(str::to_string),
        elements,
    })
}

fn one_elements(node: &XmlNode, kind: PropertyKind) -> ProtocolResult<Vec<OneElement>> {
    let child_tag = format!("one{}", kind.tag_fragment());
    node.children
        .iter()
        .filter(|c| c.name == child_tag)
        .map(|child| {
            let name = child.required("name")?.to_string();
            let value = match kind {
                PropertyKind::Blob => WireValue::Blob(child.blob()?),
                _ => child.scalar(),
            };
            Ok(OneElement { name, value })
        })
        .collect()
}

fn set_vector(node: &XmlNode, kind: PropertyKind) -> ProtocolResult<SetVector> {
    Ok(SetVector {
        kind,
        device: node.required("device")?.to_string(),
        name: node.required("name")?.to_string(),
        state: node.attr("state").map(|s| node.token(s)).transpose()?,
        timeout: node.number("timeout")?,
        timestamp: node.attr("timestamp").map(str::to_string),
        message: node.attr("message").map(str::to_string),
        elements: one_elements(node, kind)?,
    })
}

fn new_vector(node: &XmlNode, kind: PropertyKind) -> ProtocolResult<NewVector> {
    Ok(NewVector {
        kind,
        device: node.required("device")?.to_string(),
        name: node.required("name")?.to_string(),
        timestamp: node.attr("timestamp").map(str::to_string),
        elements: one_elements(node, kind)?,
    })
}

/// A parsed element with its attributes, text and children.
#[derive(Debug, Default)]
struct XmlNode {
    name: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<XmlNode>,
}

impl XmlNode {
    fn parse(bytes: &[u8]) -> ProtocolResult<Self> {
        let mut reader = Reader::from_reader(bytes);
        let mut buf = Vec::new();
        let mut stack: Vec<XmlNode> = Vec::new();

        loop {
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|e| ProtocolError::parse(frame_tag(&stack), e.to_string()))?;
            match event {
                Event::Start(start) => stack.push(Self::open(&start)?),
                Event::Empty(start) => {
                    let node = Self::open(&start)?;
                    if let Some(done) = attach(&mut stack, node) {
                        return Ok(done);
                    }
                }
                Event::End(_) => {
                    let node = stack
                        .pop()
                        .ok_or_else(|| ProtocolError::parse("frame", "unbalanced end tag"))?;
                    if let Some(done) = attach(&mut stack, node) {
                        return Ok(done);
                    }
                }
                Event::Text(text) => {
                    if let Some(top) = stack.last_mut() {
                        let text = text
                            .unescape()
                            .map_err(|e| ProtocolError::parse(top.name.clone(), e.to_string()))?;
                        top.text.push_str(&text);
                    }
                }
                Event::CData(data) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Event::Eof => {
                    return Err(ProtocolError::parse(
                        frame_tag(&stack),
                        "unexpected end of frame",
                    ));
                }
                _ => {}
            }
            buf.clear();
        }
    }

    fn open(start: &BytesStart<'_>) -> ProtocolResult<Self> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attribute in start.attributes() {
            let attribute = attribute.map_err(|e| ProtocolError::parse(name.clone(), e.to_string()))?;
            let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
            let value = attribute
                .unescape_value()
                .map_err(|e| ProtocolError::parse(name.clone(), e.to_string()))?
                .into_owned();
            attributes.push((key, value));
        }
        Ok(Self {
            name,
            attributes,
            ..Self::default()
        })
    }

    fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn required(&self, key: &str) -> ProtocolResult<&str> {
        self.attr(key)
            .ok_or_else(|| ProtocolError::parse(self.name.clone(), format!("missing attribute {key}")))
    }

    fn token<T>(&self, value: &str) -> ProtocolResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        value
            .parse()
            .map_err(|e: T::Err| ProtocolError::parse(self.name.clone(), e.to_string()))
    }

    fn number(&self, key: &str) -> ProtocolResult<Option<f64>> {
        self.attr(key)
            .map(|raw| {
                parse_number(raw).ok_or_else(|| {
                    ProtocolError::parse(self.name.clone(), format!("invalid {key}: {raw:?}"))
                })
            })
            .transpose()
    }

    /// Scalar values travel with surrounding whitespace that carries no meaning.
    fn scalar(&self) -> WireValue {
        WireValue::Scalar(self.text.trim().to_string())
    }

    fn blob(&self) -> ProtocolResult<BlobValue> {
        let encoded: Vec<u8> = self
            .text
            .bytes()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        let data = BASE64
            .decode(&encoded)
            .map_err(|e| ProtocolError::parse(self.name.clone(), format!("bad base64: {e}")))?;
        let size = match self.attr("size") {
            Some(raw) => raw.trim().parse().map_err(|_| {
                ProtocolError::parse(self.name.clone(), format!("invalid size: {raw:?}"))
            })?,
            None => data.len(),
        };
        if size != data.len() {
            debug!(
                element = %self.attr("name").unwrap_or_default(),
                declared = size,
                decoded = data.len(),
                "BLOB size differs from payload (compressed format?)"
            );
        }
        Ok(BlobValue {
            format: self.attr("format").unwrap_or_default().to_string(),
            size,
            data,
        })
    }
}

fn attach(stack: &mut [XmlNode], node: XmlNode) -> Option<XmlNode> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(node);
            None
        }
        None => Some(node),
    }
}

fn frame_tag(stack: &[XmlNode]) -> String {
    stack
        .first()
        .map(|n| n.name.clone())
        .unwrap_or_else(|| "frame".to_string())
}
