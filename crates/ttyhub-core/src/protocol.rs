//! Outbound control sequences written into a viewer's byte stream.
//!
//! Control payloads are wrapped either in the urgent envelope (processed by
//! the viewer ahead of queued output) or the out-of-band envelope (never
//! counted as received output). Everything here appends to a [`GrowBuf`].

use crate::buffer::GrowBuf;

pub const PROTOCOL_VERSION: &str = "1";

pub const URGENT_START: &[u8] = b"\x13\x16";
pub const OUT_OF_BAND_START: &[u8] = b"\x13\x17";
pub const URGENT_END: &[u8] = b"\x14";

pub const START_REPLAY: &[u8] = b"\x1b[97u";
pub const END_REPLAY: &[u8] = b"\x1b[98u";

/// Detach notice codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachCode {
    /// More than one viewer is attached.
    Shared = 0,
    /// Sole viewer; the session ends when it closes.
    Sole = 1,
    /// Sole viewer; the session is preserved when it closes.
    SolePreserved = 2,
}

/// Terminal local-mode flags reported in packet mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalModes {
    pub icanon: bool,
    pub echo: bool,
    pub extproc: bool,
    pub lflag: u32,
}

fn urgent(buf: &mut GrowBuf, args: std::fmt::Arguments<'_>) {
    buf.append(URGENT_START);
    buf.append_fmt(args);
    buf.append(URGENT_END);
}

fn out_of_band(buf: &mut GrowBuf, args: std::fmt::Arguments<'_>) {
    buf.append(OUT_OF_BAND_START);
    buf.append_fmt(args);
    buf.append(URGENT_END);
}

/// Wrap arbitrary text in the urgent envelope.
pub fn urgent_text(buf: &mut GrowBuf, text: &str) {
    urgent(buf, format_args!("{text}"));
}

/// Session announcement: child pid, session number, name uniqueness and
/// optionally the name.
pub fn session_metadata(
    buf: &mut GrowBuf,
    pid: u32,
    session_number: u32,
    name_unique: bool,
    name: Option<&str>,
) {
    let unique = u8::from(name_unique);
    match name {
        Some(name) => urgent(
            buf,
            format_args!("\x1b]31;{pid}\x07\x1b[91;{session_number};{unique}\x07\x1b]30;{name}\x07"),
        ),
        None => urgent(
            buf,
            format_args!("\x1b]31;{pid}\x07\x1b[91;{session_number};{unique}\x07"),
        ),
    }
}

/// Saved snapshot together with the count it is anchored at.
pub fn snapshot(buf: &mut GrowBuf, count: u32, contents: &str) {
    urgent(buf, format_args!("\x1b]103;{count},{contents}\x07"));
}

/// Preserved output replayed between begin/end markers.
pub fn replay(buf: &mut GrowBuf, window: &[u8]) {
    buf.append(START_REPLAY);
    buf.append(window);
    buf.append(END_REPLAY);
}

/// Ask the viewer to acknowledge `count` bytes.
pub fn ack_request(buf: &mut GrowBuf, count: u32) {
    out_of_band(buf, format_args!("\x1b[96;{count}u"));
}

/// Window update; `slot` is 0 for a sole viewer, else window number + 1.
pub fn window_update(buf: &mut GrowBuf, session_number: u32, name_unique: bool, slot: u32) {
    let unique = u8::from(name_unique);
    urgent(buf, format_args!("\x1b[91;{session_number};{unique};{slot}u"));
}

/// Settings upload as a JSON document.
pub fn settings(buf: &mut GrowBuf, json: &str) {
    urgent(buf, format_args!("\x1b]89;{json}\x07"));
}

pub fn detach_notice(buf: &mut GrowBuf, code: DetachCode) {
    urgent(buf, format_args!("\x1b[82;{}u", code as u8));
}

/// Ask the viewer to report its window contents.
pub fn request_contents(buf: &mut GrowBuf) {
    out_of_band(buf, format_args!("\x1b[81u"));
}

/// The session has ended.
pub fn end_of_stream(buf: &mut GrowBuf) {
    urgent(buf, format_args!("\x1b[99;99u"));
}

/// Echo a key event back for local line editing; code 74 when the terminal
/// echoes, 73 when it does not.
pub fn key_echo(buf: &mut GrowBuf, echoing: bool, raw: &str) {
    let code = if echoing { 74 } else { 73 };
    urgent(buf, format_args!("\x1b]{code};{raw}\x07"));
}

/// Terminal mode report generated from a packet-mode ioctl notification.
pub fn terminal_modes(buf: &mut GrowBuf, modes: LocalModes) {
    let icanon = if modes.icanon { "icanon" } else { "-icanon" };
    let echo = if modes.echo { "echo" } else { "-echo" };
    let extproc = if modes.extproc { " extproc" } else { "" };
    urgent(
        buf,
        format_args!("\x1b]71; {icanon} {echo}{extproc} lflag:{:x}\x07", modes.lflag),
    );
}

/// Value of the identity variable exported to child processes.
pub fn identity_value(tty_name: Option<&str>, session_number: u32) -> String {
    let mut value = format!("version={PROTOCOL_VERSION};");
    if let Some(tty) = tty_name {
        value.push_str(&format!("tty={tty};"));
    }
    value.push_str(&format!("session#={session_number}"));
    value
}
