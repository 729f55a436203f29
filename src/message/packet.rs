use std::collections::BTreeMap;
use std::convert::TryFrom;
use std::fmt;
use std::io;

use super::header::{Header, MessageClass, MessageType};
use super::options::{decode_uint, encode_uint, BlockValue, CoapOption, ContentFormat};

pub const PAYLOAD_MARKER: u8 = 0xFF;
pub const MAX_TOKEN_LENGTH: usize = 8;

/// Failure to turn bytes into a [`Packet`] or a [`Packet`] into bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    InvalidHeader,
    UnsupportedVersion(u8),
    InvalidTokenLength,
    InvalidOptionDelta,
    InvalidOptionLength,
    InvalidOptionNumber,
    MissingPayload,
    InvalidEmptyMessage,
    MessageIdUnset,
    Io(io::ErrorKind),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            CodecError::InvalidHeader => write!(f, "CoAP error: invalid header"),
            CodecError::UnsupportedVersion(v) => write!(f, "CoAP error: unsupported version {}", v),
            CodecError::InvalidTokenLength => write!(f, "CoAP error: invalid token length"),
            CodecError::InvalidOptionDelta => write!(f, "CoAP error: invalid option delta"),
            CodecError::InvalidOptionLength => write!(f, "CoAP error: invalid option length"),
            CodecError::InvalidOptionNumber => write!(f, "CoAP error: option number overflow"),
            CodecError::MissingPayload => write!(f, "CoAP error: payload marker without payload"),
            CodecError::InvalidEmptyMessage => write!(f, "CoAP error: empty message is not empty"),
            CodecError::MessageIdUnset => write!(f, "CoAP error: message id not assigned"),
            CodecError::Io(kind) => write!(f, "CoAP error: io {:?}", kind),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> CodecError {
        CodecError::Io(e.kind())
    }
}

/// A CoAP message on the wire: header, token, options and payload.
///
/// Options are kept sorted by number; values sharing a number keep their
/// insertion order.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Packet {
    pub header: Header,
    token: Vec<u8>,
    options: BTreeMap<u16, Vec<Vec<u8>>>,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new() -> Packet {
        Default::default()
    }

    pub fn set_token(&mut self, token: Vec<u8>) {
        self.token = token;
    }

    pub fn get_token(&self) -> &[u8] {
        &self.token
    }

    /// Replaces all values of `tp`.
    pub fn set_option(&mut self, tp: CoapOption, value: Vec<Vec<u8>>) {
        if value.is_empty() {
            self.options.remove(&tp.number());
        } else {
            self.options.insert(tp.number(), value);
        }
    }

    pub fn add_option(&mut self, tp: CoapOption, value: Vec<u8>) {
        self.options.entry(tp.number()).or_default().push(value);
    }

    pub fn get_option(&self, tp: CoapOption) -> Option<&Vec<Vec<u8>>> {
        self.options.get(&tp.number())
    }

    pub fn get_first_option(&self, tp: CoapOption) -> Option<&[u8]> {
        self.get_option(tp).and_then(|list| list.first()).map(|v| &v[..])
    }

    pub fn has_option(&self, tp: CoapOption) -> bool {
        self.options.contains_key(&tp.number())
    }

    pub fn clear_option(&mut self, tp: CoapOption) {
        self.options.remove(&tp.number());
    }

    pub fn options(&self) -> impl Iterator<Item = (CoapOption, &Vec<Vec<u8>>)> {
        self.options.iter().map(|(number, values)| (CoapOption::from(*number), values))
    }

    pub fn set_option_uint(&mut self, tp: CoapOption, value: u32) {
        self.set_option(tp, vec![encode_uint(value)]);
    }

    pub fn get_option_uint(&self, tp: CoapOption) -> Option<u32> {
        self.get_first_option(tp).and_then(decode_uint)
    }

    pub fn set_content_format(&mut self, cf: ContentFormat) {
        self.set_option_uint(CoapOption::ContentFormat, u16::from(cf) as u32);
    }

    pub fn get_content_format(&self) -> Option<ContentFormat> {
        self.get_option_uint(CoapOption::ContentFormat)
            .and_then(|n| u16::try_from(n).ok())
            .map(ContentFormat::from)
    }

    pub fn set_block1(&mut self, block: BlockValue) {
        self.set_option(CoapOption::Block1, vec![block.into()]);
    }

    /// The Block1 option, if present and well formed.
    pub fn get_block1(&self) -> Option<BlockValue> {
        self.get_block(CoapOption::Block1)
    }

    pub fn set_block2(&mut self, block: BlockValue) {
        self.set_option(CoapOption::Block2, vec![block.into()]);
    }

    pub fn get_block2(&self) -> Option<BlockValue> {
        self.get_block(CoapOption::Block2)
    }

    fn get_block(&self, tp: CoapOption) -> Option<BlockValue> {
        self.get_first_option(tp)
            .and_then(|value| BlockValue::try_from(value).ok())
    }

    /// The first critical option this endpoint does not recognize.
    pub fn unrecognized_critical_option(&self) -> Option<u16> {
        self.options
            .keys()
            .map(|number| CoapOption::from(*number))
            .find(|option| option.is_critical() && !option.is_known())
            .map(|option| option.number())
    }

    /// Decodes a byte slice and constructs the equivalent Packet.
    pub fn from_bytes(buf: &[u8]) -> Result<Packet, CodecError> {
        if buf.len() < 4 {
            return Err(CodecError::InvalidHeader);
        }

        let version = buf[0] >> 6;
        if version != 1 {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let mut header = Header::new();
        header.set_version(version);
        header.set_type(MessageType::from_bits(buf[0] >> 4));
        header.code = MessageClass::from(buf[1]);
        header.set_message_id(u16::from_be_bytes([buf[2], buf[3]]));

        let token_length = (buf[0] & 0x0F) as usize;
        if header.code == MessageClass::Empty {
            if buf.len() != 4 || token_length != 0 {
                return Err(CodecError::InvalidEmptyMessage);
            }
            return Ok(Packet {
                header,
                ..Default::default()
            });
        }

        if token_length > MAX_TOKEN_LENGTH {
            return Err(CodecError::InvalidTokenLength);
        }
        let options_start = 4 + token_length;
        if options_start > buf.len() {
            return Err(CodecError::InvalidTokenLength);
        }
        let token = buf[4..options_start].to_vec();

        let mut idx = options_start;
        let mut option_number: u32 = 0;
        let mut options: BTreeMap<u16, Vec<Vec<u8>>> = BTreeMap::new();
        let mut payload = Vec::new();

        while idx < buf.len() {
            let byte = buf[idx];
            idx += 1;

            if byte == PAYLOAD_MARKER {
                if idx == buf.len() {
                    return Err(CodecError::MissingPayload);
                }
                payload = buf[idx..].to_vec();
                break;
            }

            let delta = read_extended(buf, &mut idx, byte >> 4)
                .ok_or(CodecError::InvalidOptionDelta)?;
            let length = read_extended(buf, &mut idx, byte & 0x0F)
                .ok_or(CodecError::InvalidOptionLength)?;

            option_number += delta;
            let number = u16::try_from(option_number).map_err(|_| CodecError::InvalidOptionNumber)?;

            let end = idx + length as usize;
            if end > buf.len() {
                return Err(CodecError::InvalidOptionLength);
            }
            options.entry(number).or_default().push(buf[idx..end].to_vec());
            idx = end;
        }

        Ok(Packet {
            header,
            token,
            options,
            payload,
        })
    }

    /// Returns a vector of bytes representing the Packet.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let message_id = self.header.get_message_id().ok_or(CodecError::MessageIdUnset)?;
        if self.token.len() > MAX_TOKEN_LENGTH {
            return Err(CodecError::InvalidTokenLength);
        }
        if self.header.code == MessageClass::Empty
            && !(self.token.is_empty() && self.options.is_empty() && self.payload.is_empty())
        {
            return Err(CodecError::InvalidEmptyMessage);
        }

        let mut buf: Vec<u8> = Vec::with_capacity(4 + self.token.len() + self.payload.len() + 16);
        buf.push(
            self.header.get_version() << 6
                | self.header.get_type().bits() << 4
                | self.token.len() as u8,
        );
        buf.push(u8::from(self.header.code));
        buf.extend_from_slice(&message_id.to_be_bytes());
        buf.extend_from_slice(&self.token);

        let mut last_number: u16 = 0;
        for (number, values) in self.options.iter() {
            for value in values.iter() {
                let delta = (number - last_number) as usize;
                let (delta_nibble, delta_ext) = extended(delta).ok_or(CodecError::InvalidOptionDelta)?;
                let (length_nibble, length_ext) =
                    extended(value.len()).ok_or(CodecError::InvalidOptionLength)?;

                buf.push(delta_nibble << 4 | length_nibble);
                buf.extend_from_slice(&delta_ext);
                buf.extend_from_slice(&length_ext);
                buf.extend_from_slice(value);
                last_number = *number;
            }
        }

        if !self.payload.is_empty() {
            buf.push(PAYLOAD_MARKER);
            buf.extend_from_slice(&self.payload);
        }

        Ok(buf)
    }
}

/// Reads the extended delta or length that follows an option header byte.
fn read_extended(buf: &[u8], idx: &mut usize, nibble: u8) -> Option<u32> {
    match nibble {
        13 => {
            let value = *buf.get(*idx)? as u32 + 13;
            *idx += 1;
            Some(value)
        }
        14 => {
            let bytes = buf.get(*idx..*idx + 2)?;
            *idx += 2;
            Some(u16::from_be_bytes([bytes[0], bytes[1]]) as u32 + 269)
        }
        15 => None,
        n => Some(n as u32),
    }
}

fn extended(value: usize) -> Option<(u8, Vec<u8>)> {
    if value <= 12 {
        Some((value as u8, vec![]))
    } else if value < 269 {
        Some((13, vec![(value - 13) as u8]))
    } else if value - 269 <= u16::MAX as usize {
        Some((14, ((value - 269) as u16).to_be_bytes().to_vec()))
    } else {
        None
    }
}
