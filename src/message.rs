//! Wire message codec
//!
//! Every datagram is a type token followed by separator-delimited header
//! fields; payload-bearing kinds end the header with one more separator and
//! carry raw bytes after it:
//!
//! ```text
//! WHO_HAS___:<torrent>___:<file>___:<piece>
//! PIECE_DATA___:<torrent>___:<file>___:<piece>___:<raw bytes...>
//! ```
//!
//! The sender address and reply port are not part of the datagram; they are
//! attached by the transport when the packet is received (see [`Envelope`]).

use std::fmt;
use std::net::IpAddr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, SwarmError};

/// Field separator. No type token, decimal integer, torrent ID or relative
/// path may contain it.
pub const SEPARATOR: &[u8] = b"___:";

/// Longest torrent ID or filename a header may carry, in bytes.
pub const MAX_IDENTIFIER_LEN: usize = 100;

/// Length of the longest type token (`TORRENT_REQUEST`).
const LONGEST_KIND_LEN: usize = 15;

/// Upper bound of a header: type, four separators and three identifiers.
pub const MAX_HEADER_LEN: usize = LONGEST_KIND_LEN + SEPARATOR.len() * 4 + MAX_IDENTIFIER_LEN * 3;

/// Message kinds, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MessageKind {
    Hello,
    TimedOut,
    ListRequest,
    ListResponse,
    TorrentRequest,
    TorrentFile,
    WhoHas,
    IHave,
    PieceRequest,
    PieceData,
}

impl MessageKind {
    pub const ALL: [MessageKind; 10] = [
        Self::Hello,
        Self::TimedOut,
        Self::ListRequest,
        Self::ListResponse,
        Self::TorrentRequest,
        Self::TorrentFile,
        Self::WhoHas,
        Self::IHave,
        Self::PieceRequest,
        Self::PieceData,
    ];

    /// Wire token
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::TimedOut => "TIMED_OUT",
            Self::ListRequest => "LIST_REQUEST",
            Self::ListResponse => "LIST_RESPONSE",
            Self::TorrentRequest => "TORRENT_REQUEST",
            Self::TorrentFile => "TORRENT_FILE",
            Self::WhoHas => "WHO_HAS",
            Self::IHave => "I_HAVE",
            Self::PieceRequest => "PIECE_REQUEST",
            Self::PieceData => "PIECE_DATA",
        }
    }

    fn from_token(token: &[u8]) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str().as_bytes() == token)
    }

    /// Number of header fields after the type token
    pub fn field_count(&self) -> usize {
        match self {
            Self::Hello | Self::TimedOut => 0,
            Self::ListRequest => 1,
            Self::ListResponse | Self::TorrentRequest | Self::TorrentFile => 2,
            Self::WhoHas | Self::IHave | Self::PieceRequest | Self::PieceData => 3,
        }
    }

    /// Whether raw bytes follow the header
    pub fn has_payload(&self) -> bool {
        matches!(self, Self::ListResponse | Self::TorrentFile | Self::PieceData)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one piece of one file of a torrent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PieceRef {
    pub torrent: String,
    pub file: String,
    pub piece: u32,
}

impl PieceRef {
    pub fn new(torrent: impl Into<String>, file: impl Into<String>, piece: u32) -> Self {
        Self {
            torrent: torrent.into(),
            file: file.into(),
            piece,
        }
    }
}

/// A protocol message. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Heartbeat
    Hello,
    /// Local pseudo-message: no datagram arrived before the receive timeout
    TimedOut,
    /// Ask for one chunk of the peer's catalog listing
    ListRequest { piece: u32 },
    /// One chunk of a catalog listing
    ListResponse { piece: u32, total: u32, data: Bytes },
    /// Ask for one chunk of a torrent descriptor
    TorrentRequest { torrent: String, piece: u32 },
    /// One chunk of a torrent descriptor
    TorrentFile { torrent: String, piece: u32, data: Bytes },
    /// Does anyone hold this piece?
    WhoHas(PieceRef),
    /// The sender holds this piece
    IHave(PieceRef),
    /// Send me this piece
    PieceRequest(PieceRef),
    /// Piece contents
    PieceData { piece: PieceRef, data: Bytes },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Hello => MessageKind::Hello,
            Self::TimedOut => MessageKind::TimedOut,
            Self::ListRequest { .. } => MessageKind::ListRequest,
            Self::ListResponse { .. } => MessageKind::ListResponse,
            Self::TorrentRequest { .. } => MessageKind::TorrentRequest,
            Self::TorrentFile { .. } => MessageKind::TorrentFile,
            Self::WhoHas(_) => MessageKind::WhoHas,
            Self::IHave(_) => MessageKind::IHave,
            Self::PieceRequest(_) => MessageKind::PieceRequest,
            Self::PieceData { .. } => MessageKind::PieceData,
        }
    }

    /// Unit index carried by the message (0 for kinds without one)
    pub fn piece_index(&self) -> u32 {
        match self {
            Self::Hello | Self::TimedOut => 0,
            Self::ListRequest { piece }
            | Self::ListResponse { piece, .. }
            | Self::TorrentRequest { piece, .. }
            | Self::TorrentFile { piece, .. } => *piece,
            Self::WhoHas(r) | Self::IHave(r) | Self::PieceRequest(r) => r.piece,
            Self::PieceData { piece, .. } => piece.piece,
        }
    }

    /// Reassembly order: by kind, then by unit index.
    pub fn order_key(&self) -> (MessageKind, u32) {
        (self.kind(), self.piece_index())
    }

    /// Payload bytes, for payload-bearing kinds
    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            Self::ListResponse { data, .. }
            | Self::TorrentFile { data, .. }
            | Self::PieceData { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Serialize to a datagram
    pub fn encode(&self) -> Bytes {
        let payload_len = self.payload().map_or(0, |p| p.len());
        let mut buf = BytesMut::with_capacity(MAX_HEADER_LEN + payload_len);
        buf.put_slice(self.kind().as_str().as_bytes());

        let mut field = |value: &[u8]| {
            buf.put_slice(SEPARATOR);
            buf.put_slice(value);
        };

        match self {
            Self::Hello | Self::TimedOut => {}
            Self::ListRequest { piece } => {
                field(piece.to_string().as_bytes());
            }
            Self::ListResponse { piece, total, .. } => {
                field(piece.to_string().as_bytes());
                field(total.to_string().as_bytes());
            }
            Self::TorrentRequest { torrent, piece } | Self::TorrentFile { torrent, piece, .. } => {
                field(torrent.as_bytes());
                field(piece.to_string().as_bytes());
            }
            Self::WhoHas(r) | Self::IHave(r) | Self::PieceRequest(r) | Self::PieceData { piece: r, .. } => {
                field(r.torrent.as_bytes());
                field(r.file.as_bytes());
                field(r.piece.to_string().as_bytes());
            }
        }

        if let Some(payload) = self.payload() {
            buf.put_slice(SEPARATOR);
            buf.put_slice(payload);
        }

        buf.freeze()
    }

    /// Parse a datagram.
    ///
    /// Fails with a format error when the type token is unknown, the number of
    /// header fields does not match the kind, or a numeric field does not parse.
    pub fn decode(datagram: &[u8]) -> Result<Self> {
        let kind_end = find(datagram, SEPARATOR).unwrap_or(datagram.len());
        let token = &datagram[..kind_end];
        let kind = MessageKind::from_token(token).ok_or_else(|| {
            SwarmError::format(format!(
                "message type {:?} not recognized",
                String::from_utf8_lossy(token)
            ))
        })?;

        let rest = &datagram[kind_end..];
        let (fields, payload) = if kind.has_payload() {
            split_with_payload(rest, kind)?
        } else {
            (split_fields(rest, kind)?, Bytes::new())
        };

        let message = match kind {
            MessageKind::Hello => Self::Hello,
            MessageKind::TimedOut => Self::TimedOut,
            MessageKind::ListRequest => Self::ListRequest {
                piece: fields[0].parse()?,
            },
            MessageKind::ListResponse => Self::ListResponse {
                piece: fields[0].parse()?,
                total: fields[1].parse()?,
                data: payload,
            },
            MessageKind::TorrentRequest => Self::TorrentRequest {
                torrent: fields[0].clone(),
                piece: fields[1].parse()?,
            },
            MessageKind::TorrentFile => Self::TorrentFile {
                torrent: fields[0].clone(),
                piece: fields[1].parse()?,
                data: payload,
            },
            MessageKind::WhoHas => Self::WhoHas(piece_ref(&fields)?),
            MessageKind::IHave => Self::IHave(piece_ref(&fields)?),
            MessageKind::PieceRequest => Self::PieceRequest(piece_ref(&fields)?),
            MessageKind::PieceData => Self::PieceData {
                piece: piece_ref(&fields)?,
                data: payload,
            },
        };

        Ok(message)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WhoHas(r) | Self::IHave(r) | Self::PieceRequest(r) | Self::PieceData { piece: r, .. } => {
                write!(f, "{{{} {} {} {}}}", self.kind(), r.torrent, r.file, r.piece)
            }
            Self::TorrentRequest { torrent, piece } | Self::TorrentFile { torrent, piece, .. } => {
                write!(f, "{{{} {} {}}}", self.kind(), torrent, piece)
            }
            _ => write!(f, "{{{} {}}}", self.kind(), self.piece_index()),
        }
    }
}

/// A received message with the transport-level origin attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message: Message,
    /// Sender's address (the peer's identity)
    pub sender: IpAddr,
    /// Source port of the datagram; replies go here
    pub port: u16,
}

impl Envelope {
    pub fn new(message: Message, sender: IpAddr, port: u16) -> Self {
        Self {
            message,
            sender,
            port,
        }
    }
}

fn piece_ref(fields: &[String]) -> Result<PieceRef> {
    Ok(PieceRef {
        torrent: fields[0].clone(),
        file: fields[1].clone(),
        piece: fields[2].parse()?,
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn to_field(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| SwarmError::format("header field is not valid UTF-8"))
}

fn wrong_count(kind: MessageKind, got: usize) -> SwarmError {
    SwarmError::format(format!(
        "expected {} fields for {}, got {}",
        kind.field_count(),
        kind,
        got
    ))
}

/// Split `___:a___:b` into its fields; `rest` holds everything after the type token.
fn split_fields(rest: &[u8], kind: MessageKind) -> Result<Vec<String>> {
    let mut fields = Vec::with_capacity(kind.field_count());
    let mut remaining = rest;
    while !remaining.is_empty() {
        // Invariant: remaining starts with a separator
        remaining = &remaining[SEPARATOR.len()..];
        let end = find(remaining, SEPARATOR).unwrap_or(remaining.len());
        fields.push(to_field(&remaining[..end])?);
        remaining = &remaining[end..];
        if fields.len() > kind.field_count() {
            break;
        }
    }

    if fields.len() != kind.field_count() {
        return Err(wrong_count(kind, fields.len()));
    }
    Ok(fields)
}

/// Take exactly `field_count` fields, then the payload after the closing separator.
fn split_with_payload(rest: &[u8], kind: MessageKind) -> Result<(Vec<String>, Bytes)> {
    let mut fields = Vec::with_capacity(kind.field_count());
    let mut remaining = rest;
    for _ in 0..kind.field_count() {
        if !remaining.starts_with(SEPARATOR) {
            return Err(wrong_count(kind, fields.len()));
        }
        remaining = &remaining[SEPARATOR.len()..];
        let end = find(remaining, SEPARATOR).ok_or_else(|| wrong_count(kind, fields.len() + 1))?;
        fields.push(to_field(&remaining[..end])?);
        remaining = &remaining[end..];
    }

    // remaining now starts with the separator closing the header
    if !remaining.starts_with(SEPARATOR) {
        return Err(wrong_count(kind, fields.len()));
    }
    let payload = Bytes::copy_from_slice(&remaining[SEPARATOR.len()..]);
    Ok((fields, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_messages() -> Vec<Message> {
        let r = PieceRef::new("movies", "season1/ep01.mkv", 42);
        vec![
            Message::Hello,
            Message::TimedOut,
            Message::ListRequest { piece: 3 },
            Message::ListResponse {
                piece: 1,
                total: 2,
                data: Bytes::from_static(b"movies\n120\n1\nep01.mkv\n"),
            },
            Message::TorrentRequest {
                torrent: "movies".into(),
                piece: 0,
            },
            Message::TorrentFile {
                torrent: "movies".into(),
                piece: 7,
                data: Bytes::from_static(&[0, 1, 2, 255]),
            },
            Message::WhoHas(r.clone()),
            Message::IHave(r.clone()),
            Message::PieceRequest(r.clone()),
            Message::PieceData {
                piece: r,
                data: Bytes::from(vec![9u8; 300]),
            },
        ]
    }

    #[test]
    fn test_round_trip_every_kind() {
        for message in all_messages() {
            let decoded = Message::decode(&message.encode()).unwrap();
            assert_eq!(decoded, message, "kind {}", message.kind());
        }
    }

    #[test]
    fn test_wire_layout() {
        let who = Message::WhoHas(PieceRef::new("t", "f.txt", 5));
        assert_eq!(&who.encode()[..], b"WHO_HAS___:t___:f.txt___:5");

        assert_eq!(&Message::Hello.encode()[..], b"HELLO");

        let data = Message::ListResponse {
            piece: 0,
            total: 1,
            data: Bytes::from_static(b"abc"),
        };
        assert_eq!(&data.encode()[..], b"LIST_RESPONSE___:0___:1___:abc");
    }

    #[test]
    fn test_payload_may_contain_separator() {
        let message = Message::PieceData {
            piece: PieceRef::new("t", "f", 1),
            data: Bytes::from_static(b"x___:y___:z"),
        };
        let decoded = Message::decode(&message.encode()).unwrap();
        assert_eq!(decoded.payload().unwrap().as_ref(), b"x___:y___:z");
    }

    #[test]
    fn test_empty_payload() {
        let message = Message::TorrentFile {
            torrent: "t".into(),
            piece: 0,
            data: Bytes::new(),
        };
        let decoded = Message::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = Message::decode(b"GOODBYE___:1").unwrap_err();
        assert!(matches!(err, SwarmError::Format { .. }));
        assert!(Message::decode(b"").is_err());
    }

    #[test]
    fn test_wrong_field_count_rejected() {
        assert!(Message::decode(b"HELLO___:x").is_err());
        assert!(Message::decode(b"LIST_REQUEST").is_err());
        assert!(Message::decode(b"LIST_REQUEST___:1___:2").is_err());
        assert!(Message::decode(b"WHO_HAS___:t___:1").is_err());
        assert!(Message::decode(b"PIECE_DATA___:t___:f___:1").is_err());
        assert!(Message::decode(b"LIST_RESPONSE___:0___:1").is_err());
    }

    #[test]
    fn test_bad_integer_rejected() {
        assert!(Message::decode(b"LIST_REQUEST___:-1").is_err());
        assert!(Message::decode(b"TORRENT_REQUEST___:t___:one").is_err());
    }

    #[test]
    fn test_order_key() {
        let mut messages = vec![
            Message::ListResponse { piece: 2, total: 3, data: Bytes::new() },
            Message::Hello,
            Message::ListResponse { piece: 0, total: 3, data: Bytes::new() },
            Message::ListRequest { piece: 9 },
        ];
        messages.sort_by_key(|m| m.order_key());
        let keys: Vec<_> = messages.iter().map(|m| m.order_key()).collect();
        assert_eq!(
            keys,
            vec![
                (MessageKind::Hello, 0),
                (MessageKind::ListRequest, 9),
                (MessageKind::ListResponse, 0),
                (MessageKind::ListResponse, 2),
            ]
        );
    }

    #[test]
    fn test_max_header_len_covers_longest_kind() {
        let longest = MessageKind::ALL
            .iter()
            .map(|k| k.as_str().len())
            .max()
            .unwrap();
        assert_eq!(longest, LONGEST_KIND_LEN);

        let id = "i".repeat(MAX_IDENTIFIER_LEN);
        let header = Message::PieceData {
            piece: PieceRef::new(id.clone(), id, 0),
            data: Bytes::new(),
        }
        .encode();
        assert!(header.len() <= MAX_HEADER_LEN);
    }
}
