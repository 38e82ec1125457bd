//! Rendering of typed messages into wire frames.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use quick_xml::Writer;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};

use indibus_core::{
    DefElement, DefVector, DelProperty, EnableBlob, GetProperties, Message, NumberFormat,
    OneElement, PropertyKind, SetVector, TextMessage, WireValue,
};

use crate::error::{ProtocolError, ProtocolResult};

/// Encodes one message as a newline-terminated frame.
pub fn encode_message(message: &Message) -> ProtocolResult<Vec<u8>> {
    let mut out = FrameWriter::default();
    match message {
        Message::GetProperties(m) => out.empty(get_properties(m))?,
        Message::Define(m) => def_vector(&mut out, m)?,
        Message::Set(m) => set_vector(&mut out, m)?,
        Message::New(m) => {
            let mut start = BytesStart::new(message.tag_name());
            start.push_attribute(("device", m.device.as_str()));
            start.push_attribute(("name", m.name.as_str()));
            push_opt(&mut start, "timestamp", m.timestamp.as_deref());
            one_elements(&mut out, start, m.kind, &m.elements)?;
        }
        Message::Delete(m) => out.empty(del_property(m))?,
        Message::Notify(m) => out.empty(text_message(m))?,
        Message::EnableBlob(m) => enable_blob(&mut out, m)?,
    }
    Ok(out.finish())
}

fn get_properties(m: &GetProperties) -> BytesStart<'_> {
    let mut start = BytesStart::new("getProperties");
    push_opt(&mut start, "version", m.version.as_deref());
    push_opt(&mut start, "device", m.device.as_deref());
    push_opt(&mut start, "name", m.name.as_deref());
    start
}

fn del_property(m: &DelProperty) -> BytesStart<'_> {
    let mut start = BytesStart::new("delProperty");
    start.push_attribute(("device", m.device.as_str()));
    push_opt(&mut start, "name", m.name.as_deref());
    push_opt(&mut start, "timestamp", m.timestamp.as_deref());
    push_opt(&mut start, "message", m.message.as_deref());
    start
}

fn text_message(m: &TextMessage) -> BytesStart<'_> {
    let mut start = BytesStart::new("message");
    push_opt(&mut start, "device", m.device.as_deref());
    push_opt(&mut start, "timestamp", m.timestamp.as_deref());
    start.push_attribute(("message", m.message.as_str()));
    start
}

fn enable_blob(out: &mut FrameWriter, m: &EnableBlob) -> ProtocolResult<()> {
    let mut start = BytesStart::new("enableBLOB");
    push_opt(&mut start, "device", m.device.as_deref());
    push_opt(&mut start, "name", m.name.as_deref());
    out.text_element(start, m.policy.as_str())
}

fn def_vector(out: &mut FrameWriter, m: &DefVector) -> ProtocolResult<()> {
    let tag = format!("def{}Vector", m.kind.tag_fragment());
    let mut start = BytesStart::new(tag.as_str());
    start.push_attribute(("device", m.device.as_str()));
    start.push_attribute(("name", m.name.as_str()));
    push_opt(&mut start, "label", m.label.as_deref());
    push_opt(&mut start, "group", m.group.as_deref());
    start.push_attribute(("state", m.state.as_str()));
    push_opt(&mut start, "perm", m.permission.map(|p| p.as_str()));
    push_opt(&mut start, "rule", m.rule.map(|r| r.as_str()));
    push_opt(&mut start, "timeout", m.timeout.map(|t| t.to_string()).as_deref());
    push_opt(&mut start, "timestamp", m.timestamp.as_deref());
    push_opt(&mut start, "message", m.message.as_deref());

    out.open(start)?;
    let child_tag = format!("def{}", m.kind.tag_fragment());
    for element in &m.elements {
        def_element(out, &child_tag, m.kind, element)?;
    }
    out.close(&tag)
}

fn def_element(
    out: &mut FrameWriter,
    tag: &str,
    kind: PropertyKind,
    element: &DefElement,
) -> ProtocolResult<()> {
    let mut start = BytesStart::new(tag);
    start.push_attribute(("name", element.name.as_str()));
    push_opt(&mut start, "label", element.label.as_deref());
    if kind == PropertyKind::Number {
        let NumberFormat {
            format,
            min,
            max,
            step,
        } = element.number.clone().unwrap_or_default();
        start.push_attribute(("format", format.as_str()));
        start.push_attribute(("min", min.to_string().as_str()));
        start.push_attribute(("max", max.to_string().as_str()));
        start.push_attribute(("step", step.to_string().as_str()));
    }

    out.indent();
    match (&element.value, kind) {
        (WireValue::Blob(_), _) | (_, PropertyKind::Blob) => out.empty(start),
        (WireValue::Scalar(text), _) => out.text_element(start, text),
    }
}

fn set_vector(out: &mut FrameWriter, m: &SetVector) -> ProtocolResult<()> {
    let tag = format!("set{}Vector", m.kind.tag_fragment());
    let mut start = BytesStart::new(tag.as_str());
    start.push_attribute(("device", m.device.as_str()));
    start.push_attribute(("name", m.name.as_str()));
    push_opt(&mut start, "state", m.state.map(|s| s.as_str()));
    push_opt(&mut start, "timeout", m.timeout.map(|t| t.to_string()).as_deref());
    push_opt(&mut start, "timestamp", m.timestamp.as_deref());
    push_opt(&mut start, "message", m.message.as_deref());
    one_elements(out, start, m.kind, &m.elements)
}

fn one_elements(
    out: &mut FrameWriter,
    start: BytesStart<'_>,
    kind: PropertyKind,
    elements: &[OneElement],
) -> ProtocolResult<()> {
    let tag = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    out.open(start)?;
    let child_tag = format!("one{}", kind.tag_fragment());
    for element in elements {
        let mut child = BytesStart::new(child_tag.as_str());
        child.push_attribute(("name", element.name.as_str()));
        out.indent();
        match &element.value {
            WireValue::Scalar(text) => out.text_element(child, text)?,
            WireValue::Blob(blob) => {
                child.push_attribute(("size", blob.size.to_string().as_str()));
                child.push_attribute(("format", blob.format.as_str()));
                out.text_element(child, &BASE64.encode(&blob.data))?;
            }
        }
    }
    out.close(&tag)
}

fn push_opt(start: &mut BytesStart<'_>, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        start.push_attribute((key, value));
    }
}

/// Thin wrapper over the XML writer that lays out one frame.
struct FrameWriter {
    writer: Writer<Vec<u8>>,
}

impl Default for FrameWriter {
    fn default() -> Self {
        Self {
            writer: Writer::new(Vec::new()),
        }
    }
}

impl FrameWriter {
    fn write(&mut self, event: Event<'_>) -> ProtocolResult<()> {
        self.writer
            .write_event(event)
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    fn newline(&mut self) {
        self.writer.get_mut().push(b'\n');
    }

    fn indent(&mut self) {
        self.writer.get_mut().extend_from_slice(b"  ");
    }

    fn empty(&mut self, start: BytesStart<'_>) -> ProtocolResult<()> {
        self.write(Event::Empty(start))?;
        self.newline();
        Ok(())
    }

    fn open(&mut self, start: BytesStart<'_>) -> ProtocolResult<()> {
        self.write(Event::Start(start))?;
        self.newline();
        Ok(())
    }

    fn close(&mut self, tag: &str) -> ProtocolResult<()> {
        self.write(Event::End(BytesEnd::new(tag)))?;
        self.newline();
        Ok(())
    }

    fn text_element(&mut self, start: BytesStart<'_>, text: &str) -> ProtocolResult<()> {
        let tag = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        self.write(Event::Start(start))?;
        self.write(Event::Text(BytesText::new(text)))?;
        self.close(&tag)
    }

    fn finish(self) -> Vec<u8> {
        self.writer.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::parse_frame;
    use indibus_core::{
        BlobEnable, BlobValue, NewVector, PropertyPermission, PropertyState, SwitchRule,
        SwitchStatus,
    };

    fn render(message: &Message) -> String {
        String::from_utf8(encode_message(message).unwrap()).unwrap()
    }

    #[test]
    fn switch_definition_layout() {
        let def = DefVector {
            kind: PropertyKind::Switch,
            device: "Camera".into(),
            name: "EXPOSE".into(),
            label: Some("Expose".into()),
            group: Some("Main".into()),
            state: PropertyState::Idle,
            permission: Some(PropertyPermission::ReadWrite),
            rule: Some(SwitchRule::OneOfMany),
            timeout: Some(60.0),
            timestamp: Some("2025-01-01T00:00:00".into()),
            message: None,
            elements: vec![
                DefElement {
                    name: "START".into(),
                    label: Some("Start".into()),
                    value: WireValue::Scalar("Off".into()),
                    number: None,
                },
                DefElement {
                    name: "STOP".into(),
                    label: Some("Stop".into()),
                    value: WireValue::Scalar("On".into()),
                    number: None,
                },
            ],
        };
        insta::assert_snapshot!(render(&Message::Define(def)), @r#"
        <defSwitchVector device="Camera" name="EXPOSE" label="Expose" group="Main" state="Idle" perm="rw" rule="OneOfMany" timeout="60" timestamp="2025-01-01T00:00:00">
          <defSwitch name="START" label="Start">Off</defSwitch>
          <defSwitch name="STOP" label="Stop">On</defSwitch>
        </defSwitchVector>
        "#);
    }

    #[test]
    fn number_definition_carries_format() {
        let def = DefVector {
            kind: PropertyKind::Number,
            device: "Mount".into(),
            name: "COORD".into(),
            label: None,
            group: None,
            state: PropertyState::Ok,
            permission: Some(PropertyPermission::ReadOnly),
            rule: None,
            timeout: None,
            timestamp: None,
            message: None,
            elements: vec![DefElement {
                name: "RA".into(),
                label: None,
                value: WireValue::Scalar("12.5".into()),
                number: Some(NumberFormat {
                    format: "%10.6m".into(),
                    min: 0.0,
                    max: 24.0,
                    step: 0.5,
                }),
            }],
        };
        insta::assert_snapshot!(render(&Message::Define(def)), @r#"
        <defNumberVector device="Mount" name="COORD" state="Ok" perm="ro">
          <defNumber name="RA" format="%10.6m" min="0" max="24" step="0.5">12.5</defNumber>
        </defNumberVector>
        "#);
    }

    #[test]
    fn small_messages_are_single_line() {
        let get = render(&Message::GetProperties(GetProperties::device("Camera")));
        assert_eq!(get, "<getProperties version=\"1.7\" device=\"Camera\"/>\n");

        let enable = render(&Message::EnableBlob(EnableBlob {
            device: Some("Camera".into()),
            name: None,
            policy: BlobEnable::Also,
        }));
        assert_eq!(enable, "<enableBLOB device=\"Camera\">Also</enableBLOB>\n");

        let del = render(&Message::Delete(DelProperty::property("Camera", "IMAGE")));
        assert_eq!(del, "<delProperty device=\"Camera\" name=\"IMAGE\"/>\n");
    }

    #[test]
    fn escapes_markup_in_text_and_attributes() {
        let message = render(&Message::Notify(TextMessage {
            device: None,
            timestamp: None,
            message: "a < b & \"c\"".into(),
        }));
        assert!(!message.contains("a < b"));
        match parse_frame(message.as_bytes()).unwrap() {
            Some(Message::Notify(m)) => assert_eq!(m.message, "a < b & \"c\""),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn blob_elements_are_base64() {
        let set = SetVector {
            kind: PropertyKind::Blob,
            device: "Camera".into(),
            name: "IMAGE".into(),
            state: Some(PropertyState::Ok),
            timeout: None,
            timestamp: None,
            message: None,
            elements: vec![OneElement::blob(
                "FRAME",
                BlobValue::new(".txt", b"hello".to_vec()),
            )],
        };
        let text = render(&Message::Set(set.clone()));
        assert!(text.contains(r#"<oneBLOB name="FRAME" size="5" format=".txt">aGVsbG8=</oneBLOB>"#));
        assert_eq!(
            parse_frame(text.as_bytes()).unwrap(),
            Some(Message::Set(set))
        );
    }

    #[test]
    fn blob_definition_has_empty_elements() {
        let def = DefVector {
            kind: PropertyKind::Blob,
            device: "Camera".into(),
            name: "IMAGE".into(),
            label: None,
            group: None,
            state: PropertyState::Idle,
            permission: Some(PropertyPermission::ReadOnly),
            rule: None,
            timeout: Some(0.0),
            timestamp: None,
            message: None,
            elements: vec![DefElement {
                name: "FRAME".into(),
                label: None,
                value: WireValue::Scalar(String::new()),
                number: None,
            }],
        };
        let text = render(&Message::Define(def));
        assert!(text.contains("  <defBLOB name=\"FRAME\"/>\n"));
    }

    #[test]
    fn change_request_is_decodable() {
        let request = Message::New(
            NewVector::new(PropertyKind::Switch, "Camera", "EXPOSE")
                .with_timestamp("2025-01-01T00:00:00")
                .with_element(OneElement::switch("START", SwitchStatus::On)),
        );
        let text = render(&request);
        assert!(text.ends_with("</newSwitchVector>\n"));
        assert_eq!(parse_frame(text.as_bytes()).unwrap(), Some(request));
    }
}
