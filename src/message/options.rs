use std::convert::TryFrom;
use std::fmt;

/// Registered CoAP options (RFC 7252, RFC 7641, RFC 7959, RFC 7967).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
pub enum CoapOption {
    IfMatch,
    UriHost,
    ETag,
    IfNoneMatch,
    Observe,
    UriPort,
    LocationPath,
    UriPath,
    ContentFormat,
    MaxAge,
    UriQuery,
    Accept,
    LocationQuery,
    Block2,
    Block1,
    Size2,
    ProxyUri,
    ProxyScheme,
    Size1,
    NoResponse,
    Unknown(u16),
}

/// Value format of an option, as given by its registry entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OptionFormat {
    Empty,
    Opaque,
    Integer,
    String,
    Unknown,
}

impl From<u16> for CoapOption {
    fn from(number: u16) -> CoapOption {
        match number {
            1 => CoapOption::IfMatch,
            3 => CoapOption::UriHost,
            4 => CoapOption::ETag,
            5 => CoapOption::IfNoneMatch,
            6 => CoapOption::Observe,
            7 => CoapOption::UriPort,
            8 => CoapOption::LocationPath,
            11 => CoapOption::UriPath,
            12 => CoapOption::ContentFormat,
            14 => CoapOption::MaxAge,
            15 => CoapOption::UriQuery,
            17 => CoapOption::Accept,
            20 => CoapOption::LocationQuery,
            23 => CoapOption::Block2,
            27 => CoapOption::Block1,
            28 => CoapOption::Size2,
            35 => CoapOption::ProxyUri,
            39 => CoapOption::ProxyScheme,
            60 => CoapOption::Size1,
            258 => CoapOption::NoResponse,
            n => CoapOption::Unknown(n),
        }
    }
}

impl From<CoapOption> for u16 {
    fn from(option: CoapOption) -> u16 {
        match option {
            CoapOption::IfMatch => 1,
            CoapOption::UriHost => 3,
            CoapOption::ETag => 4,
            CoapOption::IfNoneMatch => 5,
            CoapOption::Observe => 6,
            CoapOption::UriPort => 7,
            CoapOption::LocationPath => 8,
            CoapOption::UriPath => 11,
            CoapOption::ContentFormat => 12,
            CoapOption::MaxAge => 14,
            CoapOption::UriQuery => 15,
            CoapOption::Accept => 17,
            CoapOption::LocationQuery => 20,
            CoapOption::Block2 => 23,
            CoapOption::Block1 => 27,
            CoapOption::Size2 => 28,
            CoapOption::ProxyUri => 35,
            CoapOption::ProxyScheme => 39,
            CoapOption::Size1 => 60,
            CoapOption::NoResponse => 258,
            CoapOption::Unknown(n) => n,
        }
    }
}

impl CoapOption {
    pub fn number(&self) -> u16 {
        u16::from(*self)
    }

    pub fn format(&self) -> OptionFormat {
        match *self {
            CoapOption::IfNoneMatch => OptionFormat::Empty,
            CoapOption::IfMatch | CoapOption::ETag => OptionFormat::Opaque,
            CoapOption::UriHost
            | CoapOption::LocationPath
            | CoapOption::UriPath
            | CoapOption::UriQuery
            | CoapOption::LocationQuery
            | CoapOption::ProxyUri
            | CoapOption::ProxyScheme => OptionFormat::String,
            CoapOption::Observe
            | CoapOption::UriPort
            | CoapOption::ContentFormat
            | CoapOption::MaxAge
            | CoapOption::Accept
            | CoapOption::Block2
            | CoapOption::Block1
            | CoapOption::Size2
            | CoapOption::Size1
            | CoapOption::NoResponse => OptionFormat::Integer,
            CoapOption::Unknown(_) => OptionFormat::Unknown,
        }
    }

    pub fn is_repeatable(&self) -> bool {
        matches!(
            *self,
            CoapOption::IfMatch
                | CoapOption::ETag
                | CoapOption::LocationPath
                | CoapOption::UriPath
                | CoapOption::UriQuery
                | CoapOption::LocationQuery
        )
    }

    pub fn is_known(&self) -> bool {
        !matches!(*self, CoapOption::Unknown(_))
    }

    /// Odd option numbers are critical: a receiver that does not
    /// understand one must reject the message.
    pub fn is_critical(&self) -> bool {
        self.number() & 0x01 == 0x01
    }

    pub fn is_unsafe(&self) -> bool {
        self.number() & 0x02 == 0x02
    }

    pub fn is_no_cache_key(&self) -> bool {
        self.number() & 0x1E == 0x1C
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ContentFormat {
    TextPlain,
    ApplicationLinkFormat,
    ApplicationXML,
    ApplicationOctetStream,
    ApplicationEXI,
    ApplicationJSON,
    ApplicationCBOR,
    ApplicationSenmlJSON,
    ApplicationSenmlCBOR,
    Other(u16),
}

impl From<u16> for ContentFormat {
    fn from(value: u16) -> Self {
        match value {
            0 => ContentFormat::TextPlain,
            40 => ContentFormat::ApplicationLinkFormat,
            41 => ContentFormat::ApplicationXML,
            42 => ContentFormat::ApplicationOctetStream,
            47 => ContentFormat::ApplicationEXI,
            50 => ContentFormat::ApplicationJSON,
            60 => ContentFormat::ApplicationCBOR,
            110 => ContentFormat::ApplicationSenmlJSON,
            112 => ContentFormat::ApplicationSenmlCBOR,
            n => ContentFormat::Other(n),
        }
    }
}

impl From<ContentFormat> for u16 {
    fn from(format: ContentFormat) -> u16 {
        match format {
            ContentFormat::TextPlain => 0,
            ContentFormat::ApplicationLinkFormat => 40,
            ContentFormat::ApplicationXML => 41,
            ContentFormat::ApplicationOctetStream => 42,
            ContentFormat::ApplicationEXI => 47,
            ContentFormat::ApplicationJSON => 50,
            ContentFormat::ApplicationCBOR => 60,
            ContentFormat::ApplicationSenmlJSON => 110,
            ContentFormat::ApplicationSenmlCBOR => 112,
            ContentFormat::Other(n) => n,
        }
    }
}

/// Encodes an unsigned integer option value with the minimal number of
/// bytes (zero is the empty value).
pub fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

/// Decodes an unsigned integer option value of at most four bytes.
pub fn decode_uint(value: &[u8]) -> Option<u32> {
    if value.len() > 4 {
        return None;
    }
    Some(value.iter().fold(0u32, |acc, b| acc << 8 | *b as u32))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidBlockValue {
    NumberOutOfRange(u32),
    SizeExponentOutOfRange(u8),
    UnsupportedSize(usize),
    ValueTooLong(usize),
}

impl fmt::Display for InvalidBlockValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            InvalidBlockValue::NumberOutOfRange(num) => write!(f, "block number {} out of range", num),
            InvalidBlockValue::SizeExponentOutOfRange(szx) => {
                write!(f, "block size exponent {} out of range", szx)
            }
            InvalidBlockValue::UnsupportedSize(size) => write!(f, "unsupported block size {}", size),
            InvalidBlockValue::ValueTooLong(len) => write!(f, "block option value of {} bytes", len),
        }
    }
}

impl std::error::Error for InvalidBlockValue {}

/// Largest block number representable in the three byte block option.
pub const MAX_BLOCK_NUM: u32 = (1 << 20) - 1;

/// Decomposed Block1 / Block2 option value (RFC 7959 §2.2).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BlockValue {
    pub num: u32,
    pub more: bool,
    pub size_exponent: u8,
}

impl BlockValue {
    pub fn new(num: u32, more: bool, size_exponent: u8) -> Result<Self, InvalidBlockValue> {
        if num > MAX_BLOCK_NUM {
            return Err(InvalidBlockValue::NumberOutOfRange(num));
        }
        if size_exponent > 6 {
            return Err(InvalidBlockValue::SizeExponentOutOfRange(size_exponent));
        }
        Ok(Self {
            num,
            more,
            size_exponent,
        })
    }

    /// Block size in bytes: `2^(SZX + 4)`.
    pub fn size(&self) -> usize {
        1 << (self.size_exponent + 4)
    }

    /// Byte offset of this block within the whole body.
    pub fn offset(&self) -> usize {
        self.num as usize * self.size()
    }

    /// Converts a block size in bytes to its SZX.
    pub fn size_to_exponent(size: usize) -> Result<u8, InvalidBlockValue> {
        match size {
            16 => Ok(0),
            32 => Ok(1),
            64 => Ok(2),
            128 => Ok(3),
            256 => Ok(4),
            512 => Ok(5),
            1024 => Ok(6),
            other => Err(InvalidBlockValue::UnsupportedSize(other)),
        }
    }
}

impl From<BlockValue> for Vec<u8> {
    fn from(block_value: BlockValue) -> Vec<u8> {
        let scalar = block_value.num << 4
            | u32::from(block_value.more) << 3
            | u32::from(block_value.size_exponent & 0x7);
        encode_uint(scalar)
    }
}

impl TryFrom<&[u8]> for BlockValue {
    type Error = InvalidBlockValue;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() > 3 {
            return Err(InvalidBlockValue::ValueTooLong(value.len()));
        }
        let scalar = decode_uint(value).ok_or(InvalidBlockValue::ValueTooLong(value.len()))?;

        BlockValue::new(scalar >> 4, scalar >> 3 & 0x1 == 0x1, (scalar & 0x7) as u8)
    }
}

impl fmt::Display for BlockValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}/{}", self.num, u8::from(self.more), self.size())
    }
}
