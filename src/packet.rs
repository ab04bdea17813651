//! Socket.io packet implementation and text codec.
//!
//! Each frame is a single engine.io packet carried as a websocket text
//! message. The first ASCII digit is the engine.io type; when it is `4` a
//! second digit selects the socket.io subtype:
//!
//! | Prefix | Usage                                               |
//! |--------|-----------------------------------------------------|
//! | `0`    | engine.io open, carries the session header          |
//! | `1`    | engine.io close                                     |
//! | `2`    | engine.io ping                                      |
//! | `3`    | engine.io pong                                      |
//! | `40`   | socket.io connect (namespace join / join ack)       |
//! | `41`   | socket.io namespace close                           |
//! | `42`   | socket.io event, optionally requesting an ack       |
//! | `43`   | socket.io ack response                              |
//! | `44`   | socket.io error                                     |

use serde::Deserialize;
use serde_json::Value;

use crate::errors::{DecodeError, EncodeError};
use crate::ON_CONNECTION;

/// Ping frame written by the egress loop at every ping interval.
pub(crate) const PING_FRAME: &str = "2";
/// Pong frame written in response to a server ping.
pub(crate) const PONG_FRAME: &str = "3";

/// The socket.io packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PacketKind {
    Open,
    Close,
    Ping,
    Pong,
    Empty,
    Emit,
    AckRequest,
    AckResponse,
    NamespaceConnect,
    Error,
}

/// A decoded (or to-be-encoded) wire frame.
///
/// `data` holds the raw JSON payload: the argument array for events and ack
/// responses, the session header for open packets. `source` retains the
/// undecoded wire text for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Packet {
    pub kind: PacketKind,
    /// Namespace as transmitted, `""` for the default namespace.
    pub nsp: String,
    /// Event name; empty for non-event kinds. For [`PacketKind::NamespaceConnect`]
    /// it carries the namespace to join.
    pub event: String,
    pub ack_id: Option<i64>,
    pub data: String,
    pub source: String,
}

impl Packet {
    fn new(kind: PacketKind) -> Self {
        Self {
            kind,
            nsp: String::new(),
            event: String::new(),
            ack_id: None,
            data: String::new(),
            source: String::new(),
        }
    }

    /// Create an event packet for the given namespace.
    pub fn event(nsp: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            nsp: nsp.into(),
            event: event.into(),
            ..Self::new(PacketKind::Emit)
        }
    }

    /// Create an ack-requesting event packet for the given namespace.
    pub fn ack_request(nsp: impl Into<String>, event: impl Into<String>, ack_id: i64) -> Self {
        Self {
            nsp: nsp.into(),
            event: event.into(),
            ack_id: Some(ack_id),
            ..Self::new(PacketKind::AckRequest)
        }
    }

    /// Create an ack response packet. `data` must already be a JSON array.
    pub fn ack_response(ack_id: i64, data: String) -> Self {
        Self {
            ack_id: Some(ack_id),
            data,
            ..Self::new(PacketKind::AckResponse)
        }
    }

    /// Create a namespace join packet for a non-default namespace.
    pub fn namespace_connect(nsp: impl Into<String>) -> Self {
        Self {
            event: nsp.into(),
            ..Self::new(PacketKind::NamespaceConnect)
        }
    }
}

/// Engine.io session header conveyed by the open packet.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHeader {
    /// The session id.
    pub sid: String,
    /// Transports the server would accept an upgrade to.
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Server-advertised ping interval, in milliseconds.
    pub ping_interval: u64,
    /// Server-advertised ping timeout, in milliseconds.
    pub ping_timeout: u64,
}

/// Decode a single text frame.
pub(crate) fn decode(source: &str) -> Result<Packet, DecodeError> {
    if source.is_empty() {
        return Err(DecodeError::WrongMessageType);
    }

    let mut packet = Packet {
        source: source.to_owned(),
        ..Packet::new(PacketKind::Open)
    };

    if source.as_bytes()[0] == b'0' {
        packet.data = source[1..].to_owned();
        return Ok(packet);
    }

    packet.kind = message_kind(source)?;

    if packet.kind == PacketKind::Empty {
        packet.event = ON_CONNECTION.to_owned();
    }

    let mut rest = "";
    if source.len() > 2 {
        // The prefix must be ASCII; a multibyte character in the first two
        // bytes is not a valid frame.
        if !source.is_char_boundary(2) {
            return Err(DecodeError::WrongMessageType);
        }
        let (nsp, r) = extract_namespace(&source[2..]);
        packet.nsp = nsp.to_owned();
        rest = r;
    }

    match packet.kind {
        PacketKind::Close
        | PacketKind::Ping
        | PacketKind::Pong
        | PacketKind::Empty
        | PacketKind::Error => return Ok(packet),
        _ => {}
    }

    if source.as_bytes()[0] != b'4' {
        return Err(DecodeError::UnknownType(source.chars().next().unwrap_or('?')));
    }

    if packet.kind == PacketKind::AckResponse {
        let (ack_id, data) = ack_from_packet(rest)?;
        packet.ack_id = Some(ack_id);
        packet.data = data.to_owned();
        return Ok(packet);
    }

    // An event frame whose payload carries a leading ack id is a request for
    // an acknowledgement; a bare argument array is a plain emit.
    let (ack_id, rest) = split_ack_id(rest);
    packet.ack_id = ack_id;
    packet.kind = if ack_id.is_some() {
        PacketKind::AckRequest
    } else {
        PacketKind::Emit
    };

    let (event, data) = decode_args(rest)?;
    packet.event = event;
    packet.data = data;
    Ok(packet)
}

fn message_kind(data: &str) -> Result<PacketKind, DecodeError> {
    match data.as_bytes()[0] {
        b'0' => Ok(PacketKind::Open),
        b'1' => Ok(PacketKind::Close),
        b'2' => Ok(PacketKind::Ping),
        b'3' => Ok(PacketKind::Pong),
        b'4' => regular_message_kind(data),
        _ => Err(DecodeError::WrongMessageType),
    }
}

fn regular_message_kind(data: &str) -> Result<PacketKind, DecodeError> {
    if data.len() == 1 {
        return Err(DecodeError::WrongMessageType);
    }

    match data.as_bytes()[1] {
        b'0' => Ok(PacketKind::Empty),
        b'1' => Ok(PacketKind::Close),
        b'2' => Ok(PacketKind::AckRequest),
        b'3' => Ok(PacketKind::AckResponse),
        b'4' => Ok(PacketKind::Error),
        _ => Err(DecodeError::WrongMessageType),
    }
}

/// Split an optional namespace off the payload: everything up to the first
/// `,`. A `"` before any `,` means the payload starts immediately and there
/// is no namespace.
fn extract_namespace(data: &str) -> (&str, &str) {
    if data.is_empty() {
        return ("", "");
    }

    let mut pos = 0;
    for (i, c) in data.char_indices() {
        if c == ',' {
            pos = i;
            break;
        }
        if c == '"' {
            return ("", data);
        }
    }

    let namespace = &data[..pos];
    let rest = data.get(pos + 1..).unwrap_or("");
    (namespace, rest)
}

/// Split an ack response payload at the first `[`: the prefix is the ack id,
/// the suffix is the reply argument array.
fn ack_from_packet(text: &str) -> Result<(i64, &str), DecodeError> {
    if text.len() < 2 {
        return Err(DecodeError::WrongPacket);
    }

    let pos = text.find('[').ok_or(DecodeError::WrongPacket)?;
    let ack_id = text[..pos].parse::<i64>()?;
    Ok((ack_id, &text[pos..]))
}

/// Take the ack id digits, if any, off the front of an event payload.
fn split_ack_id(input: &str) -> (Option<i64>, &str) {
    let digits = input.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return (None, input);
    }

    let (id, rest) = input.split_at(digits);
    if !rest.starts_with('[') {
        return (None, input);
    }

    match id.parse() {
        Ok(id) => (Some(id), rest),
        Err(_) => (None, input),
    }
}

/// Parse the leading JSON-encoded event name out of the argument array and
/// rebuild `data` as the array of the remaining arguments.
fn decode_args(input: &str) -> Result<(String, String), DecodeError> {
    let (mut start, mut end, mut rest) = (0, 0, 0);
    let mut quotes = 0u32;

    for (i, c) in input.char_indices() {
        if c == '"' {
            match quotes {
                0 => start = i + 1,
                1 => {
                    end = i;
                    rest = i + 1;
                }
                _ => return Err(DecodeError::WrongPacket),
            }
            quotes += 1;
        }

        if c == ',' {
            if quotes < 2 {
                continue;
            }
            rest = i + 1;
            break;
        }
    }

    if end < start || rest >= input.len() {
        return Err(DecodeError::WrongPacket);
    }

    Ok((input[start..end].to_owned(), format!("[{}", &input[rest..])))
}

/// Encode a packet to its wire text. For event kinds, `args` supplies the
/// arguments following the event name: a JSON array is spread into the
/// socket.io argument list, any other value becomes the single argument, and
/// `None` produces the short `<prefix><namespace>,["<event>"]` form.
pub(crate) fn encode(packet: &Packet, args: Option<&Value>) -> Result<String, EncodeError> {
    let mut result = kind_prefix(packet.kind)?.to_owned();

    if matches!(
        packet.kind,
        PacketKind::Empty | PacketKind::Ping | PacketKind::Pong
    ) {
        return Ok(result);
    }

    if matches!(packet.kind, PacketKind::AckRequest | PacketKind::AckResponse) {
        result.push_str(&packet.ack_id.unwrap_or(0).to_string());
    }

    if matches!(packet.kind, PacketKind::Open | PacketKind::Close) {
        result.push_str(&packet.data);
        return Ok(result);
    }

    if packet.kind == PacketKind::AckResponse {
        result.push_str(&packet.data);
        return Ok(result);
    }

    if packet.kind == PacketKind::NamespaceConnect {
        result.push_str(&packet.event);
        return Ok(result);
    }

    let Some(args) = args else {
        return Ok(format!("{result}{},[\"{}\"]", packet.nsp, packet.event));
    };

    let mut array = vec![Value::String(packet.event.clone())];
    match args {
        Value::Array(items) => array.extend(items.iter().cloned()),
        value => array.push(value.clone()),
    }
    let json = serde_json::to_string(&array)?;

    if packet.nsp.is_empty() {
        Ok(format!("{result}{json}"))
    } else {
        Ok(format!("{result}{},{json}", packet.nsp))
    }
}

fn kind_prefix(kind: PacketKind) -> Result<&'static str, EncodeError> {
    match kind {
        PacketKind::Open => Ok("0"),
        PacketKind::Close => Ok("1"),
        PacketKind::Ping => Ok("2"),
        PacketKind::Pong => Ok("3"),
        PacketKind::Empty | PacketKind::NamespaceConnect => Ok("40"),
        PacketKind::Emit | PacketKind::AckRequest => Ok("42"),
        PacketKind::AckResponse => Ok("43"),
        PacketKind::Error => Err(EncodeError::WrongMessageType),
    }
}
