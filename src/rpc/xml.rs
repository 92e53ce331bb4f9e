// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Legacy XML-RPC binding.
//!
//! aria2 speaks the classic XML-RPC dialect at `/rpc`. Values are mapped onto
//! `serde_json::Value` so both transports hand identical results upward:
//!
//! | XML-RPC                          | JSON                 |
//! |----------------------------------|----------------------|
//! | `string`, untyped, `base64`, `dateTime.iso8601` | string |
//! | `int`, `i4`, `i8`                | integer              |
//! | `double`                         | float                |
//! | `boolean`                        | bool                 |
//! | `nil`                            | null                 |
//! | `array`                          | array                |
//! | `struct`                         | object               |
//!
//! A `<fault>` becomes [`Aria2Error::Daemon`] carrying `faultCode` and
//! `faultString`.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::{Map, Number, Value};

use super::{classify_send_error, Transport};
use crate::error::Aria2Error;

/// Default timeout for establishing a connection (in seconds).
const CONNECTION_TIMEOUT_SECS: u64 = 5;

/// Transport bound to one XML-RPC endpoint.
pub struct XmlRpcTransport {
    url: String,
    client: reqwest::blocking::Client,
}

impl XmlRpcTransport {
    /// Create a transport bound to `url` (e.g. `http://127.0.0.1:6800/rpc`).
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECTION_TIMEOUT_SECS).min(timeout))
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

impl Transport for XmlRpcTransport {
    fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let body = encode_call(method, &params);

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "text/xml")
            .body(body)
            .send()
            .map_err(|e| classify_send_error(e, &self.url))?;

        let status = response.status();
        let text = response.text().unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!(Aria2Error::Http {
                status: status.as_u16(),
                body: text,
            }));
        }

        decode_response(&text)
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Serialize a `methodCall` document.
pub fn encode_call(method: &str, params: &[Value]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?><methodCall><methodName>");
    out.push_str(&escape(method));
    out.push_str("</methodName><params>");
    for param in params {
        out.push_str("<param>");
        encode_value(param, &mut out);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>");
    out
}

fn encode_value(value: &Value, out: &mut String) {
    out.push_str("<value>");
    match value {
        Value::Null => out.push_str("<nil/>"),
        Value::Bool(b) => {
            out.push_str(if *b { "<boolean>1</boolean>" } else { "<boolean>0</boolean>" })
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i32::try_from(i).is_ok() {
                    out.push_str(&format!("<int>{}</int>", i));
                } else {
                    out.push_str(&format!("<i8>{}</i8>", i));
                }
            } else {
                out.push_str(&format!("<double>{}</double>", n.as_f64().unwrap_or(0.0)));
            }
        }
        Value::String(s) => {
            out.push_str("<string>");
            out.push_str(&escape(s));
            out.push_str("</string>");
        }
        Value::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                encode_value(item, out);
            }
            out.push_str("</data></array>");
        }
        Value::Object(map) => {
            out.push_str("<struct>");
            for (name, member) in map {
                out.push_str("<member><name>");
                out.push_str(&escape(name));
                out.push_str("</name>");
                encode_value(member, out);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
    }
    out.push_str("</value>");
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

// =============================================================================
// Decoding
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Start(String),
    End(String),
    Empty(String),
    Text(String),
}

fn malformed(msg: impl Into<String>) -> anyhow::Error {
    anyhow!(Aria2Error::Malformed(msg.into()))
}

/// Split a document into tags and text. Declarations, comments and
/// attributes are skipped; CDATA sections are kept verbatim as text.
fn tokenize(input: &str) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    let mut rest = input;

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("<?") {
            let end = after.find("?>").ok_or_else(|| malformed("unterminated declaration"))?;
            rest = &after[end + 2..];
        } else if let Some(after) = rest.strip_prefix("<!--") {
            let end = after.find("-->").ok_or_else(|| malformed("unterminated comment"))?;
            rest = &after[end + 3..];
        } else if let Some(after) = rest.strip_prefix("<![CDATA[") {
            let end = after.find("]]>").ok_or_else(|| malformed("unterminated CDATA section"))?;
            push_text(&mut events, &after[..end]);
            rest = &after[end + 3..];
        } else if let Some(after) = rest.strip_prefix("<!") {
            let end = after.find('>').ok_or_else(|| malformed("unterminated directive"))?;
            rest = &after[end + 1..];
        } else if let Some(after) = rest.strip_prefix("</") {
            let end = after.find('>').ok_or_else(|| malformed("unterminated end tag"))?;
            events.push(Event::End(after[..end].trim().to_string()));
            rest = &after[end + 1..];
        } else if let Some(after) = rest.strip_prefix('<') {
            let end = after.find('>').ok_or_else(|| malformed("unterminated tag"))?;
            let inner = after[..end].trim();
            let (inner, empty) = match inner.strip_suffix('/') {
                Some(stripped) => (stripped.trim_end(), true),
                None => (inner, false),
            };
            let name = inner.split_whitespace().next().unwrap_or_default().to_string();
            events.push(if empty { Event::Empty(name) } else { Event::Start(name) });
            rest = &after[end + 1..];
        } else {
            let end = rest.find('<').unwrap_or(rest.len());
            push_text(&mut events, &unescape(&rest[..end])?);
            rest = &rest[end..];
        }
    }

    Ok(events)
}

/// Adjacent text runs (plain text next to CDATA) form one event.
fn push_text(events: &mut Vec<Event>, text: &str) {
    if let Some(Event::Text(last)) = events.last_mut() {
        last.push_str(text);
    } else {
        events.push(Event::Text(text.to_string()));
    }
}

fn unescape(text: &str) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let end = after.find(';').ok_or_else(|| malformed("unterminated entity"))?;
        let entity = &after[..end];
        let decoded = match entity {
            "amp" => '&',
            "lt" => '<',
            "gt" => '>',
            "quot" => '"',
            "apos" => '\'',
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse::<u32>().ok()
                } else {
                    None
                };
                code.and_then(char::from_u32)
                    .ok_or_else(|| malformed(format!("unknown entity &{};", entity)))?
            }
        };
        out.push(decoded);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Cursor over tokenized events.
struct Reader {
    events: Vec<Event>,
    pos: usize,
}

impl Reader {
    fn peek(&self) -> Option<&Event> {
        self.events.get(self.pos)
    }

    fn next(&mut self) -> Option<Event> {
        let event = self.events.get(self.pos).cloned();
        self.pos += 1;
        event
    }

    fn skip_whitespace(&mut self) {
        while let Some(Event::Text(t)) = self.peek() {
            if !t.trim().is_empty() {
                break;
            }
            self.pos += 1;
        }
    }

    fn open(&mut self, name: &str) -> Result<()> {
        self.skip_whitespace();
        match self.next() {
            Some(Event::Start(tag)) if tag == name => Ok(()),
            other => Err(malformed(format!("expected <{}>, found {:?}", name, other))),
        }
    }

    fn close(&mut self, name: &str) -> Result<()> {
        self.skip_whitespace();
        match self.next() {
            Some(Event::End(tag)) if tag == name => Ok(()),
            other => Err(malformed(format!("expected </{}>, found {:?}", name, other))),
        }
    }

    /// Text content up to `</name>`, consuming the end tag.
    fn text_until(&mut self, name: &str) -> Result<String> {
        let mut text = String::new();
        loop {
            match self.next() {
                Some(Event::Text(t)) => text.push_str(&t),
                Some(Event::End(tag)) if tag == name => return Ok(text),
                other => {
                    return Err(malformed(format!("unexpected {:?} inside <{}>", other, name)))
                }
            }
        }
    }

    fn value(&mut self) -> Result<Value> {
        self.skip_whitespace();
        match self.next() {
            Some(Event::Empty(tag)) if tag == "value" => return Ok(Value::String(String::new())),
            Some(Event::Start(tag)) if tag == "value" => {}
            other => return Err(malformed(format!("expected <value>, found {:?}", other))),
        }

        // Untyped content is a string, whitespace included.
        let leading = match self.peek() {
            Some(Event::Text(t)) => {
                let t = t.clone();
                self.pos += 1;
                t
            }
            _ => String::new(),
        };
        if let Some(Event::End(tag)) = self.peek() {
            if tag == "value" {
                self.pos += 1;
                return Ok(Value::String(leading));
            }
        }
        if !leading.trim().is_empty() {
            return Err(malformed("text mixed with a typed value"));
        }

        let value = match self.next() {
            Some(Event::Empty(tag)) => match tag.as_str() {
                "nil" => Value::Null,
                "string" | "base64" => Value::String(String::new()),
                "array" => Value::Array(Vec::new()),
                "struct" => Value::Object(Map::new()),
                other => return Err(malformed(format!("empty <{}/>", other))),
            },
            Some(Event::Start(tag)) => self.typed(&tag)?,
            other => return Err(malformed(format!("unexpected {:?} in <value>", other))),
        };
        self.close("value")?;
        Ok(value)
    }

    fn typed(&mut self, tag: &str) -> Result<Value> {
        match tag {
            "string" | "base64" | "dateTime.iso8601" => Ok(Value::String(self.text_until(tag)?)),
            "int" | "i4" | "i8" => {
                let text = self.text_until(tag)?;
                let n: i64 = text
                    .trim()
                    .parse()
                    .map_err(|_| malformed(format!("bad integer '{}'", text)))?;
                Ok(Value::Number(n.into()))
            }
            "double" => {
                let text = self.text_until(tag)?;
                let f: f64 = text
                    .trim()
                    .parse()
                    .map_err(|_| malformed(format!("bad double '{}'", text)))?;
                Number::from_f64(f)
                    .map(Value::Number)
                    .ok_or_else(|| malformed(format!("non-finite double '{}'", text)))
            }
            "boolean" => match self.text_until(tag)?.trim() {
                "1" => Ok(Value::Bool(true)),
                "0" => Ok(Value::Bool(false)),
                other => Err(malformed(format!("bad boolean '{}'", other))),
            },
            "nil" => {
                self.close("nil")?;
                Ok(Value::Null)
            }
            "array" => {
                self.skip_whitespace();
                let mut items = Vec::new();
                match self.next() {
                    Some(Event::Empty(t)) if t == "data" => {}
                    Some(Event::Start(t)) if t == "data" => loop {
                        self.skip_whitespace();
                        if let Some(Event::End(t)) = self.peek() {
                            if t == "data" {
                                self.pos += 1;
                                break;
                            }
                        }
                        items.push(self.value()?);
                    },
                    other => return Err(malformed(format!("expected <data>, found {:?}", other))),
                }
                self.close("array")?;
                Ok(Value::Array(items))
            }
            "struct" => {
                let mut map = Map::new();
                loop {
                    self.skip_whitespace();
                    if let Some(Event::End(t)) = self.peek() {
                        if t == "struct" {
                            self.pos += 1;
                            break;
                        }
                    }
                    self.open("member")?;
                    self.open("name")?;
                    let name = self.text_until("name")?;
                    let member = self.value()?;
                    self.close("member")?;
                    map.insert(name, member);
                }
                Ok(Value::Object(map))
            }
            other => Err(malformed(format!("unsupported type <{}>", other))),
        }
    }
}

/// Parse a `methodResponse` document.
pub fn decode_response(text: &str) -> Result<Value> {
    let mut reader = Reader {
        events: tokenize(text)?,
        pos: 0,
    };

    reader.open("methodResponse")?;
    reader.skip_whitespace();
    match reader.next() {
        Some(Event::Start(tag)) if tag == "params" => {
            reader.open("param")?;
            let value = reader.value()?;
            reader.close("param")?;
            reader.close("params")?;
            Ok(value)
        }
        Some(Event::Start(tag)) if tag == "fault" => {
            let fault = reader.value()?;
            let code = fault["faultCode"].as_i64().unwrap_or(0);
            let message = fault["faultString"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| fault.to_string());
            Err(anyhow!(Aria2Error::Daemon { code, message }))
        }
        other => Err(malformed(format!("expected <params> or <fault>, found {:?}", other))),
    }
}
