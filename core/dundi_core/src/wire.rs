//! DUNDi wire format
//!
//! # Frame layout
//!
//! ```text
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! | strans (u16 BE) | dtrans (u16 BE) | iseqno | oseqno | cmdresp| cmdflg |
//! +--------+--------+--------+--------+--------+--------+--------+--------+
//! | IE type | IE len | IE value ...                                       |
//! +---------+--------+----------------------------------------------------+
//! ```
//!
//! The top bit of `cmdresp` marks the final message of a dialog, the low
//! seven bits carry the command. Information elements are type/length/value
//! triples. A length byte of `0xff` announces an extended length: the real
//! length follows as a big-endian `u16`.

use std::fmt;

use crate::eid::{Eid, EID_LEN};

// ============================================================================
// Constants
// ============================================================================

/// Default UDP port
pub const DUNDI_PORT: u16 = 4520;

/// Protocol version carried in the VERSION IE
pub const DEFAULT_VERSION: u16 = 1;

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 8;

/// Largest datagram we build or accept
pub const MAX_PACKET_SIZE: usize = 8192;

/// Final-message marker in `cmdresp`
pub const FLAG_FINAL: u8 = 0x80;

/// Marks an IE length as extended (u16 follows)
const EXTENDED_LEN: u8 = 0xff;

/// Largest IE value the codec can express
pub const MAX_IE_LEN: usize = u16::MAX as usize;

/// Transaction ids are 15-bit
pub const TRANS_ID_MASK: u16 = 0x7fff;

// ============================================================================
// Commands
// ============================================================================

/// DUNDi commands. Responses carry the 0x40 bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Ack = 0x40,
    DpDiscover = 0x01,
    DpResponse = 0x42,
    EidQuery = 0x03,
    EidResponse = 0x44,
    PrecacheRq = 0x05,
    PrecacheRp = 0x46,
    Invalid = 0x47,
    Unknown = 0x48,
    Null = 0x09,
    RegReq = 0x0a,
    RegResponse = 0x4b,
    Cancel = 0x0c,
    Encrypt = 0x0d,
    EncRej = 0x4e,
}

impl Command {
    pub fn from_code(code: u8) -> Option<Self> {
        let cmd = match code & !FLAG_FINAL {
            0x40 => Command::Ack,
            0x01 => Command::DpDiscover,
            0x42 => Command::DpResponse,
            0x03 => Command::EidQuery,
            0x44 => Command::EidResponse,
            0x05 => Command::PrecacheRq,
            0x46 => Command::PrecacheRp,
            0x47 => Command::Invalid,
            0x48 => Command::Unknown,
            0x09 => Command::Null,
            0x0a => Command::RegReq,
            0x4b => Command::RegResponse,
            0x0c => Command::Cancel,
            0x0d => Command::Encrypt,
            0x4e => Command::EncRej,
            _ => return None,
        };
        Some(cmd)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::Ack => "ACK",
            Command::DpDiscover => "DPDISCOVER",
            Command::DpResponse => "DPRESPONSE",
            Command::EidQuery => "EIDQUERY",
            Command::EidResponse => "EIDRESPONSE",
            Command::PrecacheRq => "PRECACHERQ",
            Command::PrecacheRp => "PRECACHERP",
            Command::Invalid => "INVALID",
            Command::Unknown => "UNKNOWN",
            Command::Null => "NULL",
            Command::RegReq => "REGREQ",
            Command::RegResponse => "REGRESPONSE",
            Command::Cancel => "CANCEL",
            Command::Encrypt => "ENCRYPT",
            Command::EncRej => "ENCREJ",
        }
    }

    /// Commands that may open a new dialog from a remote peer
    pub fn opens_dialog(self) -> bool {
        matches!(
            self,
            Command::DpDiscover
                | Command::EidQuery
                | Command::PrecacheRq
                | Command::RegReq
                | Command::Null
                | Command::Encrypt
        )
    }

    /// Commands whose payload travels inside ENCRYPT when a session key is active
    pub fn is_encryptable(self) -> bool {
        matches!(
            self,
            Command::RegReq
                | Command::RegResponse
                | Command::DpDiscover
                | Command::DpResponse
                | Command::EidQuery
                | Command::EidResponse
                | Command::PrecacheRq
                | Command::PrecacheRp
        )
    }
}

/// Human-readable name of a raw `cmdresp` byte
pub fn command_name(code: u8) -> String {
    match Command::from_code(code) {
        Some(cmd) => cmd.name().to_string(),
        None => format!("Unknown ({:#04x})", code & !FLAG_FINAL),
    }
}

// ============================================================================
// Information element types and flag values
// ============================================================================

/// Information element type codes
pub mod ie {
    pub const EID: u8 = 1;
    pub const CALLED_CONTEXT: u8 = 2;
    pub const CALLED_NUMBER: u8 = 3;
    pub const EID_DIRECT: u8 = 4;
    pub const ANSWER: u8 = 5;
    pub const TTL: u8 = 6;
    pub const VERSION: u8 = 10;
    pub const EXPIRATION: u8 = 11;
    pub const UNKNOWN: u8 = 12;
    pub const CAUSE: u8 = 14;
    pub const REQEID: u8 = 15;
    pub const ENCDATA: u8 = 16;
    pub const SHAREDKEY: u8 = 17;
    pub const SIGNATURE: u8 = 18;
    pub const KEYCRC32: u8 = 19;
    pub const HINT: u8 = 20;
    pub const DEPARTMENT: u8 = 21;
    pub const ORGANIZATION: u8 = 22;
    pub const LOCALITY: u8 = 23;
    pub const STATE_PROV: u8 = 24;
    pub const COUNTRY: u8 = 25;
    pub const EMAIL: u8 = 26;
    pub const PHONE: u8 = 27;
    pub const IPADDR: u8 = 28;
    pub const CACHEBYPASS: u8 = 29;
}

/// Answer flags
pub mod flags {
    pub const EXISTS: u16 = 1 << 0;
    pub const MATCHMORE: u16 = 1 << 1;
    pub const CANMATCH: u16 = 1 << 2;
    pub const IGNOREPAT: u16 = 1 << 3;
    pub const RESIDENTIAL: u16 = 1 << 4;
    pub const COMMERCIAL: u16 = 1 << 5;
    pub const MOBILE: u16 = 1 << 6;
    pub const NOUNSOLICITED: u16 = 1 << 7;
    pub const NOCOMUNSOLICIT: u16 = 1 << 8;
}

/// Hint flags
pub mod hint {
    pub const TTL_EXPIRED: u16 = 1 << 0;
    pub const DONT_ASK: u16 = 1 << 1;
    pub const UNAFFECTED: u16 = 1 << 2;
}

/// Cause codes carried by the CAUSE IE
pub mod cause {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL: u8 = 1;
    pub const DYNAMIC: u8 = 2;
    pub const NOAUTH: u8 = 3;
    pub const DUPLICATE: u8 = 4;
    pub const TTL_EXPIRED: u8 = 5;
    pub const NEEDKEY: u8 = 6;
    pub const BADENCRYPT: u8 = 7;
}

/// Render answer flags the way operators read them
pub fn flags_to_string(value: u16) -> String {
    let names = [
        (flags::EXISTS, "EXISTS"),
        (flags::MATCHMORE, "MATCHMORE"),
        (flags::CANMATCH, "CANMATCH"),
        (flags::IGNOREPAT, "IGNOREPAT"),
        (flags::RESIDENTIAL, "RESIDENCE"),
        (flags::COMMERCIAL, "COMMERCIAL"),
        (flags::MOBILE, "MOBILE"),
        (flags::NOUNSOLICITED, "NOUNSLCTD"),
        (flags::NOCOMUNSOLICIT, "NOCOMUNSLTD"),
    ];
    let set: Vec<&str> = names
        .iter()
        .filter(|(bit, _)| value & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if set.is_empty() {
        "NONE".to_string()
    } else {
        set.join("|")
    }
}

pub fn hint_flags_to_string(value: u16) -> String {
    let names = [
        (hint::TTL_EXPIRED, "TTLEXPIRED"),
        (hint::DONT_ASK, "DONTASK"),
        (hint::UNAFFECTED, "UNAFFECTED"),
    ];
    let set: Vec<&str> = names
        .iter()
        .filter(|(bit, _)| value & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if set.is_empty() {
        "NONE".to_string()
    } else {
        set.join("|")
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while decoding frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Datagram shorter than the fixed header
    TruncatedHeader(usize),
    /// IE claims more bytes than remain in the buffer
    TruncatedIe { ie: u8, claimed: usize, remaining: usize },
    /// IE has a length that is invalid for its type
    BadIeLength { ie: u8, len: usize },
    /// Value too large to encode
    TooLarge(usize),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::TruncatedHeader(len) => write!(f, "frame too short for header ({} bytes)", len),
            WireError::TruncatedIe { ie, claimed, remaining } => write!(
                f,
                "IE {} claims {} bytes but only {} remain",
                ie, claimed, remaining
            ),
            WireError::BadIeLength { ie, len } => write!(f, "IE {} has invalid length {}", ie, len),
            WireError::TooLarge(len) => write!(f, "IE value too large: {} bytes", len),
        }
    }
}

impl std::error::Error for WireError {}

// ============================================================================
// Header
// ============================================================================

/// Fixed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub strans: u16,
    pub dtrans: u16,
    pub iseqno: u8,
    pub oseqno: u8,
    /// Raw command byte including the final bit
    pub cmdresp: u8,
    pub cmdflags: u8,
}

impl Header {
    /// Command byte with the final bit stripped
    pub fn command_code(&self) -> u8 {
        self.cmdresp & !FLAG_FINAL
    }

    pub fn command(&self) -> Option<Command> {
        Command::from_code(self.cmdresp)
    }

    pub fn is_final(&self) -> bool {
        self.cmdresp & FLAG_FINAL != 0
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        encode_header(
            self.strans,
            self.dtrans,
            self.iseqno,
            self.oseqno,
            self.cmdresp & !FLAG_FINAL,
            self.cmdflags,
            self.is_final(),
        )
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::TruncatedHeader(buf.len()));
        }
        Ok(Header {
            strans: u16::from_be_bytes([buf[0], buf[1]]),
            dtrans: u16::from_be_bytes([buf[2], buf[3]]),
            iseqno: buf[4],
            oseqno: buf[5],
            cmdresp: buf[6],
            cmdflags: buf[7],
        })
    }
}

/// Encode a header; the final flag lands in the top bit of the command byte
pub fn encode_header(
    strans: u16,
    dtrans: u16,
    iseqno: u8,
    oseqno: u8,
    cmd: u8,
    cmdflags: u8,
    final_: bool,
) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..2].copy_from_slice(&strans.to_be_bytes());
    buf[2..4].copy_from_slice(&dtrans.to_be_bytes());
    buf[4] = iseqno;
    buf[5] = oseqno;
    buf[6] = (cmd & !FLAG_FINAL) | if final_ { FLAG_FINAL } else { 0 };
    buf[7] = cmdflags;
    buf
}

/// Split a datagram into header and IE body
pub fn decode_frame(buf: &[u8]) -> Result<(Header, &[u8]), WireError> {
    let header = Header::decode(buf)?;
    Ok((header, &buf[HEADER_LEN..]))
}

/// Build a datagram from a header and an encoded IE body
pub fn encode_frame(header: &Header, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(body);
    buf
}

// ============================================================================
// Information elements
// ============================================================================

/// One answer: who answered, how to reach the number, and how good it is
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub eid: Eid,
    pub protocol: u16,
    pub flags: u16,
    pub weight: u16,
    pub destination: String,
}

/// Hint: flags plus the longest prefix the flags apply to
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Hint {
    pub flags: u16,
    pub data: String,
}

/// Cause: code plus optional description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cause {
    pub code: u8,
    pub description: String,
}

/// A decoded information element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ie {
    Eid(Eid),
    EidDirect(Eid),
    CalledContext(String),
    CalledNumber(String),
    Answer(Answer),
    Ttl(u16),
    Version(u16),
    Expiration(u16),
    /// Command byte we did not understand
    Unknown(u8),
    Cause(Cause),
    ReqEid(Eid),
    /// 16-byte IV followed by the encrypted block
    EncData { iv: [u8; 16], data: Vec<u8> },
    SharedKey(Vec<u8>),
    Signature(Vec<u8>),
    KeyCrc32(u32),
    Hint(Hint),
    Department(String),
    Organization(String),
    Locality(String),
    StateProv(String),
    Country(String),
    Email(String),
    Phone(String),
    IpAddr(String),
    CacheBypass,
}

/// Append a raw IE to `buf`
pub fn append_ie(buf: &mut Vec<u8>, ie_type: u8, payload: &[u8]) -> Result<(), WireError> {
    if payload.len() > MAX_IE_LEN {
        return Err(WireError::TooLarge(payload.len()));
    }
    buf.push(ie_type);
    if payload.len() >= EXTENDED_LEN as usize {
        buf.push(EXTENDED_LEN);
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        buf.push(payload.len() as u8);
    }
    buf.extend_from_slice(payload);
    Ok(())
}

impl Ie {
    /// Type code of this element
    pub fn ie_type(&self) -> u8 {
        match self {
            Ie::Eid(_) => ie::EID,
            Ie::EidDirect(_) => ie::EID_DIRECT,
            Ie::CalledContext(_) => ie::CALLED_CONTEXT,
            Ie::CalledNumber(_) => ie::CALLED_NUMBER,
            Ie::Answer(_) => ie::ANSWER,
            Ie::Ttl(_) => ie::TTL,
            Ie::Version(_) => ie::VERSION,
            Ie::Expiration(_) => ie::EXPIRATION,
            Ie::Unknown(_) => ie::UNKNOWN,
            Ie::Cause(_) => ie::CAUSE,
            Ie::ReqEid(_) => ie::REQEID,
            Ie::EncData { .. } => ie::ENCDATA,
            Ie::SharedKey(_) => ie::SHAREDKEY,
            Ie::Signature(_) => ie::SIGNATURE,
            Ie::KeyCrc32(_) => ie::KEYCRC32,
            Ie::Hint(_) => ie::HINT,
            Ie::Department(_) => ie::DEPARTMENT,
            Ie::Organization(_) => ie::ORGANIZATION,
            Ie::Locality(_) => ie::LOCALITY,
            Ie::StateProv(_) => ie::STATE_PROV,
            Ie::Country(_) => ie::COUNTRY,
            Ie::Email(_) => ie::EMAIL,
            Ie::Phone(_) => ie::PHONE,
            Ie::IpAddr(_) => ie::IPADDR,
            Ie::CacheBypass => ie::CACHEBYPASS,
        }
    }

    /// Append this element to `buf`
    pub fn append(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        let ty = self.ie_type();
        match self {
            Ie::Eid(eid) | Ie::EidDirect(eid) | Ie::ReqEid(eid) => append_ie(buf, ty, eid.as_bytes()),
            Ie::CalledContext(s)
            | Ie::CalledNumber(s)
            | Ie::Department(s)
            | Ie::Organization(s)
            | Ie::Locality(s)
            | Ie::StateProv(s)
            | Ie::Country(s)
            | Ie::Email(s)
            | Ie::Phone(s)
            | Ie::IpAddr(s) => append_ie(buf, ty, s.as_bytes()),
            Ie::Ttl(v) | Ie::Version(v) | Ie::Expiration(v) => append_ie(buf, ty, &v.to_be_bytes()),
            Ie::Unknown(cmd) => append_ie(buf, ty, &[*cmd]),
            Ie::KeyCrc32(v) => append_ie(buf, ty, &v.to_be_bytes()),
            Ie::SharedKey(raw) | Ie::Signature(raw) => append_ie(buf, ty, raw),
            Ie::CacheBypass => append_ie(buf, ty, &[]),
            Ie::Answer(answer) => {
                let mut payload = Vec::with_capacity(EID_LEN + 6 + answer.destination.len());
                payload.extend_from_slice(answer.eid.as_bytes());
                payload.extend_from_slice(&answer.protocol.to_be_bytes());
                payload.extend_from_slice(&answer.flags.to_be_bytes());
                payload.extend_from_slice(&answer.weight.to_be_bytes());
                payload.extend_from_slice(answer.destination.as_bytes());
                append_ie(buf, ty, &payload)
            }
            Ie::Hint(hint) => {
                let mut payload = Vec::with_capacity(2 + hint.data.len());
                payload.extend_from_slice(&hint.flags.to_be_bytes());
                payload.extend_from_slice(hint.data.as_bytes());
                append_ie(buf, ty, &payload)
            }
            Ie::Cause(cause) => {
                let mut payload = Vec::with_capacity(1 + cause.description.len());
                payload.push(cause.code);
                payload.extend_from_slice(cause.description.as_bytes());
                append_ie(buf, ty, &payload)
            }
            Ie::EncData { iv, data } => {
                let mut payload = Vec::with_capacity(16 + data.len());
                payload.extend_from_slice(iv);
                payload.extend_from_slice(data);
                append_ie(buf, ty, &payload)
            }
        }
    }

    /// Decode a single element. `Ok(None)` means the type is unknown and was skipped.
    fn decode(ty: u8, value: &[u8]) -> Result<Option<Ie>, WireError> {
        let bad = || WireError::BadIeLength { ie: ty, len: value.len() };
        let text = || String::from_utf8_lossy(value).into_owned();
        let short = || -> Result<u16, WireError> {
            if value.len() != 2 {
                return Err(bad());
            }
            Ok(u16::from_be_bytes([value[0], value[1]]))
        };
        let eid = || Eid::from_slice(value).ok_or_else(bad);

        let parsed = match ty {
            ie::EID => Ie::Eid(eid()?),
            ie::EID_DIRECT => Ie::EidDirect(eid()?),
            ie::REQEID => Ie::ReqEid(eid()?),
            ie::CALLED_CONTEXT => Ie::CalledContext(text()),
            ie::CALLED_NUMBER => Ie::CalledNumber(text()),
            ie::DEPARTMENT => Ie::Department(text()),
            ie::ORGANIZATION => Ie::Organization(text()),
            ie::LOCALITY => Ie::Locality(text()),
            ie::STATE_PROV => Ie::StateProv(text()),
            ie::COUNTRY => Ie::Country(text()),
            ie::EMAIL => Ie::Email(text()),
            ie::PHONE => Ie::Phone(text()),
            ie::IPADDR => Ie::IpAddr(text()),
            ie::TTL => Ie::Ttl(short()?),
            ie::VERSION => Ie::Version(short()?),
            ie::EXPIRATION => Ie::Expiration(short()?),
            ie::UNKNOWN => {
                if value.len() != 1 {
                    return Err(bad());
                }
                Ie::Unknown(value[0])
            }
            ie::KEYCRC32 => {
                if value.len() != 4 {
                    return Err(bad());
                }
                Ie::KeyCrc32(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
            }
            ie::SHAREDKEY => Ie::SharedKey(value.to_vec()),
            ie::SIGNATURE => Ie::Signature(value.to_vec()),
            ie::CACHEBYPASS => Ie::CacheBypass,
            ie::ANSWER => {
                if value.len() < EID_LEN + 6 {
                    return Err(bad());
                }
                let eid = Eid::from_slice(&value[..EID_LEN]).ok_or_else(bad)?;
                let rest = &value[EID_LEN..];
                Ie::Answer(Answer {
                    eid,
                    protocol: u16::from_be_bytes([rest[0], rest[1]]),
                    flags: u16::from_be_bytes([rest[2], rest[3]]),
                    weight: u16::from_be_bytes([rest[4], rest[5]]),
                    destination: String::from_utf8_lossy(&rest[6..]).into_owned(),
                })
            }
            ie::HINT => {
                if value.len() < 2 {
                    return Err(bad());
                }
                Ie::Hint(Hint {
                    flags: u16::from_be_bytes([value[0], value[1]]),
                    data: String::from_utf8_lossy(&value[2..]).into_owned(),
                })
            }
            ie::CAUSE => {
                if value.is_empty() {
                    return Err(bad());
                }
                Ie::Cause(Cause {
                    code: value[0],
                    description: String::from_utf8_lossy(&value[1..]).into_owned(),
                })
            }
            ie::ENCDATA => {
                if value.len() < 16 || (value.len() - 16) % 16 != 0 {
                    return Err(bad());
                }
                let mut iv = [0u8; 16];
                iv.copy_from_slice(&value[..16]);
                Ie::EncData { iv, data: value[16..].to_vec() }
            }
            _ => return Ok(None),
        };
        Ok(Some(parsed))
    }
}

/// Encode a list of elements into one IE body
pub fn encode_ies(ies: &[Ie]) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    for element in ies {
        element.append(&mut buf)?;
    }
    Ok(buf)
}

/// Parse an IE body.
///
/// Unknown IE types are skipped so newer peers can add elements. Any length
/// that runs past the end of the buffer rejects the whole body.
pub fn parse_ies(mut buf: &[u8]) -> Result<Vec<Ie>, WireError> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 2 {
            return Err(WireError::TruncatedIe { ie: buf[0], claimed: 1, remaining: 0 });
        }
        let ty = buf[0];
        let (len, offset) = if buf[1] == EXTENDED_LEN {
            if buf.len() < 4 {
                return Err(WireError::TruncatedIe { ie: ty, claimed: 2, remaining: buf.len() - 2 });
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as usize, 4)
        } else {
            (buf[1] as usize, 2)
        };
        let remaining = buf.len() - offset;
        if len > remaining {
            return Err(WireError::TruncatedIe { ie: ty, claimed: len, remaining });
        }
        let value = &buf[offset..offset + len];
        match Ie::decode(ty, value)? {
            Some(element) => out.push(element),
            None => log::debug!("Skipping unknown IE type {} ({} bytes)", ty, len),
        }
        buf = &buf[offset + len..];
    }
    Ok(out)
}

// ============================================================================
// Aggregated view
// ============================================================================

/// The elements of one frame, gathered by meaning
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IeSet {
    /// EIDs in order of appearance, flagged when sent as EID_DIRECT
    pub eids: Vec<(Eid, bool)>,
    pub called_context: Option<String>,
    pub called_number: Option<String>,
    pub answers: Vec<Answer>,
    pub ttl: Option<u16>,
    pub version: Option<u16>,
    pub expiration: Option<u16>,
    pub unknown_cmd: Option<u8>,
    pub cause: Option<Cause>,
    pub reqeid: Option<Eid>,
    pub encdata: Option<([u8; 16], Vec<u8>)>,
    pub shared_key: Option<Vec<u8>>,
    pub signature: Option<Vec<u8>>,
    pub key_crc32: Option<u32>,
    pub hint: Option<Hint>,
    pub department: Option<String>,
    pub organization: Option<String>,
    pub locality: Option<String>,
    pub stateprov: Option<String>,
    pub country: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub ipaddr: Option<String>,
    pub cache_bypass: bool,
}

impl IeSet {
    pub fn parse(buf: &[u8]) -> Result<Self, WireError> {
        Ok(Self::from_ies(parse_ies(buf)?))
    }

    pub fn from_ies(ies: Vec<Ie>) -> Self {
        let mut set = IeSet::default();
        for element in ies {
            match element {
                Ie::Eid(eid) => set.eids.push((eid, false)),
                Ie::EidDirect(eid) => set.eids.push((eid, true)),
                Ie::CalledContext(s) => set.called_context = Some(s),
                Ie::CalledNumber(s) => set.called_number = Some(s),
                Ie::Answer(a) => set.answers.push(a),
                Ie::Ttl(v) => set.ttl = Some(v),
                Ie::Version(v) => set.version = Some(v),
                Ie::Expiration(v) => set.expiration = Some(v),
                Ie::Unknown(c) => set.unknown_cmd = Some(c),
                Ie::Cause(c) => set.cause = Some(c),
                Ie::ReqEid(eid) => set.reqeid = Some(eid),
                Ie::EncData { iv, data } => set.encdata = Some((iv, data)),
                Ie::SharedKey(k) => set.shared_key = Some(k),
                Ie::Signature(s) => set.signature = Some(s),
                Ie::KeyCrc32(c) => set.key_crc32 = Some(c),
                Ie::Hint(h) => set.hint = Some(h),
                Ie::Department(s) => set.department = Some(s),
                Ie::Organization(s) => set.organization = Some(s),
                Ie::Locality(s) => set.locality = Some(s),
                Ie::StateProv(s) => set.stateprov = Some(s),
                Ie::Country(s) => set.country = Some(s),
                Ie::Email(s) => set.email = Some(s),
                Ie::Phone(s) => set.phone = Some(s),
                Ie::IpAddr(s) => set.ipaddr = Some(s),
                Ie::CacheBypass => set.cache_bypass = true,
            }
        }
        set
    }

    /// First EID in the list: the peer that sent the frame
    pub fn sender(&self) -> Option<Eid> {
        self.eids.first().map(|(eid, _)| *eid)
    }

    /// Cause code, treating a missing CAUSE as success
    pub fn cause_code(&self) -> u8 {
        self.cause.as_ref().map(|c| c.code).unwrap_or(cause::SUCCESS)
    }
}

/// One-line summary of a frame for debug output
pub fn describe_frame(header: &Header, body: &[u8]) -> String {
    let mut line = format!(
        "{}{} strans={:05} dtrans={:05} iseq={:03} oseq={:03}",
        command_name(header.cmdresp),
        if header.is_final() { " (F)" } else { "" },
        header.strans,
        header.dtrans,
        header.iseqno,
        header.oseqno,
    );
    match parse_ies(body) {
        Ok(ies) => {
            for element in ies {
                line.push_str(&format!(" {:?}", element));
            }
        }
        Err(e) => line.push_str(&format!(" <{}>", e)),
    }
    line
}
