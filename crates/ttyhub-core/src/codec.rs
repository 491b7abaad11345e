//! In-band event framing for the viewer → session byte stream.
//!
//! Wire format: literal bytes are PTY input. A separator (`0x92`, or its
//! UTF-8 encoding `0xC2 0x92`) introduces a named event terminated by a
//! newline: `<sep><name> <data>\n`. An event whose newline has not arrived
//! yet is kept until the next [`EventDecoder::feed`].

/// The separator byte ("Private Use 2", U+0092).
pub const SEPARATOR: u8 = 0x92;

/// First byte of the UTF-8 encoding of U+0092.
const UTF8_LEAD: u8 = 0xC2;

/// One decoded piece of the inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Bytes to write to the PTY verbatim.
    Input(Vec<u8>),
    /// A named control event.
    Event { name: String, data: String },
}

/// Streaming decoder: accumulates bytes and yields input runs and events.
#[derive(Debug, Default)]
pub struct EventDecoder {
    buffer: Vec<u8>,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes into the decoder and return everything that is complete.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Inbound> {
        self.buffer.extend_from_slice(data);
        let (items, consumed) = decode(&self.buffer);
        self.buffer.drain(..consumed);
        items
    }

    /// Discard any retained partial frame.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of bytes retained awaiting more input.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Decode as much of `buf` as possible.
///
/// Returns the decoded items and the number of bytes consumed; the caller
/// keeps `buf[consumed..]` and prepends it to the next chunk.
pub fn decode(buf: &[u8]) -> (Vec<Inbound>, usize) {
    let mut items = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < buf.len() {
        let sep_len = match buf[i] {
            SEPARATOR => 1,
            UTF8_LEAD => match buf.get(i + 1) {
                Some(&SEPARATOR) => 2,
                Some(_) => 0,
                None => {
                    // Possibly the first half of a two-byte separator.
                    push_input(&mut items, &buf[start..i]);
                    return (items, i);
                }
            },
            _ => 0,
        };
        if sep_len == 0 {
            i += 1;
            continue;
        }

        push_input(&mut items, &buf[start..i]);
        let body = i + sep_len;
        match buf[body..].iter().position(|&c| c == b'\n') {
            Some(rel) => {
                let eol = body + rel;
                items.push(parse_frame(&buf[body..eol]));
                i = eol + 1;
                start = i;
            }
            None => return (items, i),
        }
    }

    push_input(&mut items, &buf[start..]);
    (items, buf.len())
}

fn push_input(items: &mut Vec<Inbound>, bytes: &[u8]) {
    if !bytes.is_empty() {
        items.push(Inbound::Input(bytes.to_vec()));
    }
}

/// Split `<name> <data>` at the first space, skipping any further spaces.
fn parse_frame(frame: &[u8]) -> Inbound {
    let name_end = frame.iter().position(|&c| c == b' ').unwrap_or(frame.len());
    let data_start = frame[name_end..]
        .iter()
        .position(|&c| c != b' ')
        .map_or(frame.len(), |p| name_end + p);
    Inbound::Event {
        name: String::from_utf8_lossy(&frame[..name_end]).into_owned(),
        data: String::from_utf8_lossy(&frame[data_start..]).into_owned(),
    }
}
