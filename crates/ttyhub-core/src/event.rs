//! Typed viewer events parsed from decoded `<name> <data>` frames.

use serde_json::Value;

use crate::counter;
use crate::error::{HubError, HubResult};

/// Terminal geometry as reported by a viewer. `None` means unknown.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Geometry {
    pub rows: Option<u16>,
    pub cols: Option<u16>,
    pub pixel_height: Option<u16>,
    pub pixel_width: Option<u16>,
}

impl Geometry {
    /// Rows and columns, when both are known.
    pub fn cells(&self) -> Option<(u16, u16)> {
        Some((self.rows?, self.cols?))
    }
}

/// A control event sent in-band by a viewer.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    /// `WS rows cols pixh pixw`
    WindowSize(Geometry),
    /// `VERSION <client identifier>`
    Version(String),
    /// `RECEIVED <count>`, already masked to 28 bits.
    Received(u32),
    /// `KEY meta\tmeta\t<json>`: `raw` is the whole payload (echoed back in
    /// canonical mode), `key` the decoded key text.
    Key { raw: String, key: String },
    /// `SESSION-NAME ..."<json string>"`
    SessionName(String),
    /// `OPEN-WINDOW <query>`
    OpenWindow {
        request: String,
        geometry: Option<String>,
    },
    /// `DETACH 0|1`: true means preserve the session on close.
    Detach(bool),
    Focused,
    /// `LINK <json object>`
    Link(Value),
    /// `WINDOW-CONTENTS count,snapshot`
    WindowContents { count: u32, snapshot: String },
    /// `ECHO-URGENT <json string>`
    EchoUrgent(String),
    /// Anything else; ignored by the session.
    Unknown(String),
}

impl ViewerEvent {
    /// Parse an event from its name and payload.
    pub fn parse(name: &str, data: &str) -> HubResult<Self> {
        let event = match name {
            "WS" => ViewerEvent::WindowSize(parse_geometry(data)?),
            "VERSION" => ViewerEvent::Version(data.to_string()),
            "RECEIVED" => ViewerEvent::Received(parse_count(data)?),
            "KEY" => parse_key(data)?,
            "SESSION-NAME" => {
                let quote = data
                    .find('"')
                    .ok_or_else(|| invalid(name, "missing quoted name"))?;
                ViewerEvent::SessionName(json_string(&data[quote..])?)
            }
            "OPEN-WINDOW" => ViewerEvent::OpenWindow {
                request: data.to_string(),
                geometry: query_param(data, "geometry"),
            },
            "DETACH" => ViewerEvent::Detach(data != "0"),
            "FOCUSED" => ViewerEvent::Focused,
            "LINK" => {
                let value: Value = serde_json::from_str(data)?;
                if !value.is_object() {
                    return Err(invalid(name, "expected a JSON object"));
                }
                ViewerEvent::Link(value)
            }
            "WINDOW-CONTENTS" => {
                let (count, snapshot) = data
                    .split_once(',')
                    .ok_or_else(|| invalid(name, "missing ','"))?;
                ViewerEvent::WindowContents {
                    count: parse_count(count)?,
                    snapshot: snapshot.to_string(),
                }
            }
            "ECHO-URGENT" => ViewerEvent::EchoUrgent(json_string(data)?),
            other => ViewerEvent::Unknown(other.to_string()),
        };
        Ok(event)
    }
}

fn invalid(name: &str, reason: &str) -> HubError {
    HubError::InvalidEvent(format!("{name}: {reason}"))
}

fn parse_count(data: &str) -> HubResult<u32> {
    let n: i64 = data
        .trim()
        .parse()
        .map_err(|_| invalid("count", data))?;
    Ok(counter::wrap(n as u64))
}

fn parse_geometry(data: &str) -> HubResult<Geometry> {
    let fields: Vec<&str> = data.split_whitespace().collect();
    if fields.len() != 4 {
        return Err(invalid("WS", "expected 4 fields"));
    }
    let cell = |s: &str| -> HubResult<Option<u16>> {
        let n: i64 = s.parse().map_err(|_| invalid("WS", s))?;
        Ok(u16::try_from(n).ok().filter(|&n| n > 0))
    };
    // Pixel sizes may be fractional.
    let pixel = |s: &str| -> HubResult<Option<u16>> {
        let f: f64 = s.parse().map_err(|_| invalid("WS", s))?;
        Ok((f >= 0.0 && f <= f64::from(u16::MAX)).then(|| f as u16))
    };
    Ok(Geometry {
        rows: cell(fields[0])?,
        cols: cell(fields[1])?,
        pixel_height: pixel(fields[2])?,
        pixel_width: pixel(fields[3])?,
    })
}

fn parse_key(data: &str) -> HubResult<ViewerEvent> {
    let mut parts = data.splitn(3, '\t');
    let json = match (parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(_), Some(json)) => json,
        _ => return Err(invalid("KEY", "expected two tab separators")),
    };
    Ok(ViewerEvent::Key {
        raw: data.to_string(),
        key: json_string(json)?,
    })
}

fn json_string(s: &str) -> HubResult<String> {
    match serde_json::from_str::<Value>(s)? {
        Value::String(text) => Ok(text),
        _ => Err(HubError::InvalidEvent(format!("expected JSON string: {s}"))),
    }
}

/// Value of `key=` in an `&`-separated query string.
fn query_param(query: &str, key: &str) -> Option<String> {
    let needle = format!("{key}=");
    let start = query.find(&needle)? + needle.len();
    let rest = &query[start..];
    let end = rest.find('&').unwrap_or(rest.len());
    Some(rest[..end].to_string())
}
