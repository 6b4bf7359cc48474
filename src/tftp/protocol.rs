//! TFTP wire format (RFC 1350) with option extension (RFC 2347),
//! blksize (RFC 2348), timeout and tsize (RFC 2349)

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Well-known TFTP port
pub const DEFAULT_PORT: u16 = 69;
pub const DEFAULT_BLOCK_SIZE: usize = 512;
pub const MIN_BLOCK_SIZE: usize = 8;
pub const MAX_BLOCK_SIZE: usize = 65464;
/// Largest datagram either side will ever receive
pub const MAX_PACKET_SIZE: usize = MAX_BLOCK_SIZE + 4;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    Oack = 6,
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Rrq),
            2 => Some(Self::Wrq),
            3 => Some(Self::Data),
            4 => Some(Self::Ack),
            5 => Some(Self::Error),
            6 => Some(Self::Oack),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTid = 5,
    FileExists = 6,
    NoSuchUser = 7,
    OptionNegotiation = 8,
}

impl ErrorCode {
    /// Unknown codes collapse to `NotDefined`
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Self::FileNotFound,
            2 => Self::AccessViolation,
            3 => Self::DiskFull,
            4 => Self::IllegalOperation,
            5 => Self::UnknownTid,
            6 => Self::FileExists,
            7 => Self::NoSuchUser,
            8 => Self::OptionNegotiation,
            _ => Self::NotDefined,
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            Self::NotDefined => "Not defined",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTid => "Unknown transfer ID",
            Self::FileExists => "File already exists",
            Self::NoSuchUser => "No such user",
            Self::OptionNegotiation => "Option negotiation failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", *self as u16, self.default_message())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferMode {
    #[default]
    Octet,
    Netascii,
    Mail,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Octet => "octet",
            Self::Netascii => "netascii",
            Self::Mail => "mail",
        }
    }
}

impl FromStr for TransferMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "octet" => Ok(Self::Octet),
            "netascii" => Ok(Self::Netascii),
            "mail" => Ok(Self::Mail),
            other => Err(ProtocolError(format!("unknown transfer mode '{}'", other))),
        }
    }
}

/// RRQ/WRQ body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub filename: String,
    pub mode: TransferMode,
    /// Option names are lowercased; order is preserved
    pub options: Vec<(String, String)>,
}

impl Request {
    pub fn read(filename: impl Into<String>, mode: TransferMode) -> Self {
        Self {
            filename: filename.into(),
            mode,
            options: Vec::new(),
        }
    }

    pub fn with_option(mut self, name: &str, value: impl ToString) -> Self {
        self.options.push((name.to_ascii_lowercase(), value.to_string()));
        self
    }

    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq(Request),
    Wrq(Request),
    Data { block: u16, data: Vec<u8> },
    Ack { block: u16 },
    Error { code: ErrorCode, message: String },
    Oack { options: Vec<(String, String)> },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed packet: {0}")]
pub struct ProtocolError(pub String);

fn push_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

/// Split a NUL-terminated field list; the trailing NUL is mandatory
fn split_fields(body: &[u8]) -> Result<Vec<String>, ProtocolError> {
    if body.last() != Some(&0) {
        return Err(ProtocolError("missing NUL terminator".to_string()));
    }
    body[..body.len() - 1]
        .split(|b| *b == 0)
        .map(|field| {
            std::str::from_utf8(field)
                .map(str::to_string)
                .map_err(|_| ProtocolError("non UTF-8 field".to_string()))
        })
        .collect()
}

fn parse_options(fields: &[String]) -> Result<Vec<(String, String)>, ProtocolError> {
    if fields.len() % 2 != 0 {
        return Err(ProtocolError("option without value".to_string()));
    }
    Ok(fields
        .chunks(2)
        .map(|pair| (pair[0].to_ascii_lowercase(), pair[1].clone()))
        .collect())
}

fn parse_request(body: &[u8]) -> Result<Request, ProtocolError> {
    let fields = split_fields(body)?;
    if fields.len() < 2 {
        return Err(ProtocolError("request needs filename and mode".to_string()));
    }
    if fields[0].is_empty() {
        return Err(ProtocolError("empty filename".to_string()));
    }
    Ok(Request {
        filename: fields[0].clone(),
        mode: fields[1].parse()?,
        options: parse_options(&fields[2..])?,
    })
}

fn read_u16(buf: &[u8], at: usize) -> Result<u16, ProtocolError> {
    buf.get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| ProtocolError("truncated packet".to_string()))
}

impl Packet {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Rrq(_) => Opcode::Rrq,
            Self::Wrq(_) => Opcode::Wrq,
            Self::Data { .. } => Opcode::Data,
            Self::Ack { .. } => Opcode::Ack,
            Self::Error { .. } => Opcode::Error,
            Self::Oack { .. } => Opcode::Oack,
        }
    }

    /// Error packet carrying the code's standard message
    pub fn error(code: ErrorCode) -> Self {
        Self::Error {
            code,
            message: code.default_message().to_string(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 512);
        buf.extend_from_slice(&(self.opcode() as u16).to_be_bytes());
        match self {
            Self::Rrq(req) | Self::Wrq(req) => {
                push_str(&mut buf, &req.filename);
                push_str(&mut buf, req.mode.as_str());
                for (k, v) in &req.options {
                    push_str(&mut buf, k);
                    push_str(&mut buf, v);
                }
            }
            Self::Data { block, data } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Self::Ack { block } => buf.extend_from_slice(&block.to_be_bytes()),
            Self::Error { code, message } => {
                buf.extend_from_slice(&(*code as u16).to_be_bytes());
                push_str(&mut buf, message);
            }
            Self::Oack { options } => {
                for (k, v) in options {
                    push_str(&mut buf, k);
                    push_str(&mut buf, v);
                }
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let raw = read_u16(buf, 0)?;
        let opcode = Opcode::from_u16(raw)
            .ok_or_else(|| ProtocolError(format!("unknown opcode {}", raw)))?;
        let body = &buf[2..];

        match opcode {
            Opcode::Rrq => Ok(Self::Rrq(parse_request(body)?)),
            Opcode::Wrq => Ok(Self::Wrq(parse_request(body)?)),
            Opcode::Data => Ok(Self::Data {
                block: read_u16(buf, 2)?,
                data: buf[4..].to_vec(),
            }),
            Opcode::Ack => Ok(Self::Ack { block: read_u16(buf, 2)? }),
            Opcode::Error => {
                let code = ErrorCode::from_u16(read_u16(buf, 2)?);
                // Some stacks omit the terminator on the message
                let msg = &buf[4..];
                let msg = msg.strip_suffix(b"\0").unwrap_or(msg);
                Ok(Self::Error {
                    code,
                    message: String::from_utf8_lossy(msg).to_string(),
                })
            }
            Opcode::Oack => {
                let fields = if body.is_empty() { Vec::new() } else { split_fields(body)? };
                Ok(Self::Oack { options: parse_options(&fields)? })
            }
        }
    }
}

// =========================================================================
// Option negotiation
// =========================================================================

/// Effective parameters of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    pub blksize: usize,
    pub timeout: Duration,
    pub tsize: Option<u64>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            blksize: DEFAULT_BLOCK_SIZE,
            timeout: DEFAULT_TIMEOUT,
            tsize: None,
        }
    }
}

/// Server side of RFC 2347: accept what we support, drop what we don't.
///
/// Returns the effective options and the list to echo in an OACK (empty
/// means no OACK is sent and data starts at block 1 right away).
pub fn negotiate(
    requested: &[(String, String)],
    file_size: u64,
    default_timeout: Duration,
) -> (TransferOptions, Vec<(String, String)>) {
    let mut effective = TransferOptions {
        timeout: default_timeout,
        ..TransferOptions::default()
    };
    let mut acked = Vec::new();

    for (name, value) in requested {
        match name.as_str() {
            "blksize" => {
                if let Ok(size) = value.parse::<usize>() {
                    if size >= MIN_BLOCK_SIZE {
                        let size = size.min(MAX_BLOCK_SIZE);
                        effective.blksize = size;
                        acked.push((name.clone(), size.to_string()));
                    }
                }
            }
            "timeout" => {
                if let Ok(secs) = value.parse::<u64>() {
                    if (1..=255).contains(&secs) {
                        effective.timeout = Duration::from_secs(secs);
                        acked.push((name.clone(), secs.to_string()));
                    }
                }
            }
            "tsize" => {
                effective.tsize = Some(file_size);
                acked.push((name.clone(), file_size.to_string()));
            }
            _ => {}
        }
    }

    (effective, acked)
}

// =========================================================================
// netascii
// =========================================================================

/// Host text to netascii: LF → CR LF, bare CR → CR NUL
pub fn netascii_encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len() + input.len() / 16);
    for &b in input {
        match b {
            b'\n' => out.extend_from_slice(b"\r\n"),
            b'\r' => out.extend_from_slice(b"\r\0"),
            _ => out.push(b),
        }
    }
    out
}

/// netascii to host text
pub fn netascii_decode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut iter = input.iter().peekable();
    while let Some(&b) = iter.next() {
        if b == b'\r' {
            match iter.peek() {
                Some(b'\n') => {
                    iter.next();
                    out.push(b'\n');
                }
                Some(0) => {
                    iter.next();
                    out.push(b'\r');
                }
                _ => out.push(b'\r'),
            }
        } else {
            out.push(b);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rrq_with_options() {
        let raw = b"\x00\x01zxic_ping\x00OCTET\x00BLKSIZE\x001428\x00tsize\x000\x00";
        let packet = Packet::decode(raw).unwrap();
        let Packet::Rrq(req) = packet else { panic!("expected RRQ") };
        assert_eq!(req.filename, "zxic_ping");
        assert_eq!(req.mode, TransferMode::Octet);
        assert_eq!(req.option("blksize"), Some("1428"));
        assert_eq!(req.option("tsize"), Some("0"));
    }

    #[test]
    fn test_encode_rrq_layout() {
        let req = Request::read("zxic_ping", TransferMode::Octet).with_option("blksize", 1024);
        assert_eq!(
            Packet::Rrq(req).encode(),
            b"\x00\x01zxic_ping\x00octet\x00blksize\x001024\x00".to_vec()
        );
    }

    #[test]
    fn test_encode_data_and_ack() {
        let data = Packet::Data { block: 0x0102, data: vec![0xde, 0xad] }.encode();
        assert_eq!(data, vec![0, 3, 1, 2, 0xde, 0xad]);
        assert_eq!(Packet::Ack { block: 7 }.encode(), vec![0, 4, 0, 7]);
    }

    #[test]
    fn test_decode_empty_data_block() {
        assert_eq!(
            Packet::decode(&[0, 3, 0, 9]).unwrap(),
            Packet::Data { block: 9, data: Vec::new() }
        );
    }

    #[test]
    fn test_error_packet() {
        let encoded = Packet::error(ErrorCode::FileNotFound).encode();
        assert_eq!(&encoded[..4], &[0, 5, 0, 1]);
        assert_eq!(
            Packet::decode(&encoded).unwrap(),
            Packet::Error { code: ErrorCode::FileNotFound, message: "File not found".to_string() }
        );
        // unterminated message from a sloppy peer
        assert_eq!(
            Packet::decode(b"\x00\x05\x00\x02denied").unwrap(),
            Packet::Error { code: ErrorCode::AccessViolation, message: "denied".to_string() }
        );
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(Packet::decode(&[0]).is_err());
        assert!(Packet::decode(&[0, 9, 0, 0]).is_err());
        assert!(Packet::decode(&[0, 4, 0]).is_err());
        assert!(Packet::decode(b"\x00\x01file\x00octet").is_err());
        assert!(Packet::decode(b"\x00\x01file\x00").is_err());
        assert!(Packet::decode(b"\x00\x01file\x00binary\x00").is_err());
        assert!(Packet::decode(b"\x00\x01file\x00octet\x00blksize\x00").is_err());
    }

    #[test]
    fn test_negotiate_blksize_and_tsize() {
        let requested = vec![
            ("blksize".to_string(), "1428".to_string()),
            ("tsize".to_string(), "0".to_string()),
            ("windowsize".to_string(), "4".to_string()),
        ];
        let (opts, acked) = negotiate(&requested, 4096, DEFAULT_TIMEOUT);
        assert_eq!(opts.blksize, 1428);
        assert_eq!(opts.tsize, Some(4096));
        assert_eq!(
            acked,
            vec![
                ("blksize".to_string(), "1428".to_string()),
                ("tsize".to_string(), "4096".to_string()),
            ]
        );
    }

    #[test]
    fn test_negotiate_clamps_and_ignores_bad_values() {
        let requested = vec![
            ("blksize".to_string(), "100000".to_string()),
            ("timeout".to_string(), "0".to_string()),
        ];
        let (opts, acked) = negotiate(&requested, 0, DEFAULT_TIMEOUT);
        assert_eq!(opts.blksize, MAX_BLOCK_SIZE);
        assert_eq!(opts.timeout, DEFAULT_TIMEOUT);
        assert_eq!(acked.len(), 1);

        let (opts, acked) = negotiate(&[("blksize".to_string(), "4".to_string())], 0, DEFAULT_TIMEOUT);
        assert_eq!(opts.blksize, DEFAULT_BLOCK_SIZE);
        assert!(acked.is_empty());
    }

    #[test]
    fn test_netascii() {
        let text = b"line one\nbare\rcr\n";
        let wire = netascii_encode(text);
        assert_eq!(wire, b"line one\r\nbare\r\0cr\r\n".to_vec());
        assert_eq!(netascii_decode(&wire), text.to_vec());
    }

    #[test]
    fn test_error_code_from_wire() {
        assert_eq!(ErrorCode::from_u16(1), ErrorCode::FileNotFound);
        assert_eq!(ErrorCode::from_u16(42), ErrorCode::NotDefined);
        assert_eq!(ErrorCode::FileNotFound.to_string(), "1 (File not found)");
    }
}
