use std::fmt;

/// The four CoAP message types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    pub fn from_bits(bits: u8) -> MessageType {
        match bits & 0x3 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }

    pub fn bits(&self) -> u8 {
        match *self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }

    pub fn short_name(&self) -> &'static str {
        match *self {
            MessageType::Confirmable => "CON",
            MessageType::NonConfirmable => "NON",
            MessageType::Acknowledgement => "ACK",
            MessageType::Reset => "RST",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RequestType {
    Get,
    Post,
    Put,
    Delete,
    Fetch,
    Patch,
    IPatch,
    UnKnown(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResponseType {
    // 200 Codes
    Created,
    Deleted,
    Valid,
    Changed,
    Content,
    Continue,

    // 400 Codes
    BadRequest,
    Unauthorized,
    BadOption,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    NotAcceptable,
    RequestEntityIncomplete,
    PreconditionFailed,
    RequestEntityTooLarge,
    UnsupportedContentFormat,
    TooManyRequests,

    // 500 Codes
    InternalServerError,
    NotImplemented,
    BadGateway,
    ServiceUnavailable,
    GatewayTimeout,
    ProxyingNotSupported,

    UnKnown(u8),
}

impl ResponseType {
    pub fn is_success(&self) -> bool {
        (u8::from(MessageClass::Response(*self)) >> 5) == 2
    }
}

/// Code field of the header, split into the classes the stack dispatches on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageClass {
    Empty,
    Request(RequestType),
    Response(ResponseType),
    Reserved(u8),
}

impl Default for MessageClass {
    fn default() -> Self {
        MessageClass::Empty
    }
}

impl From<u8> for MessageClass {
    fn from(code: u8) -> MessageClass {
        match code {
            0x00 => MessageClass::Empty,

            0x01 => MessageClass::Request(RequestType::Get),
            0x02 => MessageClass::Request(RequestType::Post),
            0x03 => MessageClass::Request(RequestType::Put),
            0x04 => MessageClass::Request(RequestType::Delete),
            0x05 => MessageClass::Request(RequestType::Fetch),
            0x06 => MessageClass::Request(RequestType::Patch),
            0x07 => MessageClass::Request(RequestType::IPatch),
            0x08..=0x1F => MessageClass::Request(RequestType::UnKnown(code)),

            0x41 => MessageClass::Response(ResponseType::Created),
            0x42 => MessageClass::Response(ResponseType::Deleted),
            0x43 => MessageClass::Response(ResponseType::Valid),
            0x44 => MessageClass::Response(ResponseType::Changed),
            0x45 => MessageClass::Response(ResponseType::Content),
            0x5F => MessageClass::Response(ResponseType::Continue),

            0x80 => MessageClass::Response(ResponseType::BadRequest),
            0x81 => MessageClass::Response(ResponseType::Unauthorized),
            0x82 => MessageClass::Response(ResponseType::BadOption),
            0x83 => MessageClass::Response(ResponseType::Forbidden),
            0x84 => MessageClass::Response(ResponseType::NotFound),
            0x85 => MessageClass::Response(ResponseType::MethodNotAllowed),
            0x86 => MessageClass::Response(ResponseType::NotAcceptable),
            0x88 => MessageClass::Response(ResponseType::RequestEntityIncomplete),
            0x8C => MessageClass::Response(ResponseType::PreconditionFailed),
            0x8D => MessageClass::Response(ResponseType::RequestEntityTooLarge),
            0x8F => MessageClass::Response(ResponseType::UnsupportedContentFormat),
            0x9D => MessageClass::Response(ResponseType::TooManyRequests),

            0xA0 => MessageClass::Response(ResponseType::InternalServerError),
            0xA1 => MessageClass::Response(ResponseType::NotImplemented),
            0xA2 => MessageClass::Response(ResponseType::BadGateway),
            0xA3 => MessageClass::Response(ResponseType::ServiceUnavailable),
            0xA4 => MessageClass::Response(ResponseType::GatewayTimeout),
            0xA5 => MessageClass::Response(ResponseType::ProxyingNotSupported),
            0x40..=0xBF => MessageClass::Response(ResponseType::UnKnown(code)),

            _ => MessageClass::Reserved(code),
        }
    }
}

impl From<MessageClass> for u8 {
    fn from(class: MessageClass) -> u8 {
        match class {
            MessageClass::Empty => 0x00,

            MessageClass::Request(RequestType::Get) => 0x01,
            MessageClass::Request(RequestType::Post) => 0x02,
            MessageClass::Request(RequestType::Put) => 0x03,
            MessageClass::Request(RequestType::Delete) => 0x04,
            MessageClass::Request(RequestType::Fetch) => 0x05,
            MessageClass::Request(RequestType::Patch) => 0x06,
            MessageClass::Request(RequestType::IPatch) => 0x07,
            MessageClass::Request(RequestType::UnKnown(code)) => code,

            MessageClass::Response(ResponseType::Created) => 0x41,
            MessageClass::Response(ResponseType::Deleted) => 0x42,
            MessageClass::Response(ResponseType::Valid) => 0x43,
            MessageClass::Response(ResponseType::Changed) => 0x44,
            MessageClass::Response(ResponseType::Content) => 0x45,
            MessageClass::Response(ResponseType::Continue) => 0x5F,

            MessageClass::Response(ResponseType::BadRequest) => 0x80,
            MessageClass::Response(ResponseType::Unauthorized) => 0x81,
            MessageClass::Response(ResponseType::BadOption) => 0x82,
            MessageClass::Response(ResponseType::Forbidden) => 0x83,
            MessageClass::Response(ResponseType::NotFound) => 0x84,
            MessageClass::Response(ResponseType::MethodNotAllowed) => 0x85,
            MessageClass::Response(ResponseType::NotAcceptable) => 0x86,
            MessageClass::Response(ResponseType::RequestEntityIncomplete) => 0x88,
            MessageClass::Response(ResponseType::PreconditionFailed) => 0x8C,
            MessageClass::Response(ResponseType::RequestEntityTooLarge) => 0x8D,
            MessageClass::Response(ResponseType::UnsupportedContentFormat) => 0x8F,
            MessageClass::Response(ResponseType::TooManyRequests) => 0x9D,

            MessageClass::Response(ResponseType::InternalServerError) => 0xA0,
            MessageClass::Response(ResponseType::NotImplemented) => 0xA1,
            MessageClass::Response(ResponseType::BadGateway) => 0xA2,
            MessageClass::Response(ResponseType::ServiceUnavailable) => 0xA3,
            MessageClass::Response(ResponseType::GatewayTimeout) => 0xA4,
            MessageClass::Response(ResponseType::ProxyingNotSupported) => 0xA5,
            MessageClass::Response(ResponseType::UnKnown(code)) => code,

            MessageClass::Reserved(code) => code,
        }
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&code_to_str(u8::from(*self)))
    }
}

/// Renders a raw code in the dotted `c.dd` notation.
pub fn code_to_str(code: u8) -> String {
    let class_code = (0xE0 & code) >> 5;
    let detail_code = 0x1F & code;

    format!("{}.{:02}", class_code, detail_code)
}

/// The fixed four-byte CoAP header (the token length lives with the token).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    version: u8,
    message_type: MessageType,
    pub code: MessageClass,
    message_id: Option<u16>,
}

impl Default for Header {
    fn default() -> Self {
        Header {
            version: 1,
            message_type: MessageType::Confirmable,
            code: MessageClass::Empty,
            message_id: None,
        }
    }
}

impl Header {
    pub fn new() -> Header {
        Default::default()
    }

    #[inline]
    pub fn set_version(&mut self, v: u8) {
        self.version = v & 0x3;
    }

    #[inline]
    pub fn get_version(&self) -> u8 {
        self.version
    }

    #[inline]
    pub fn set_type(&mut self, t: MessageType) {
        self.message_type = t;
    }

    #[inline]
    pub fn get_type(&self) -> MessageType {
        self.message_type
    }

    /// Sets the code from its dotted notation, e.g. `"2.05"`.
    ///
    /// Returns `false` and leaves the code untouched if `code` is not a
    /// valid `c.dd` string.
    pub fn set_code(&mut self, code: &str) -> bool {
        let mut parts = code.split('.');
        let (class_code, detail_code) = match (parts.next(), parts.next(), parts.next()) {
            (Some(c), Some(d), None) => match (c.parse::<u8>(), d.parse::<u8>()) {
                (Ok(c), Ok(d)) if c <= 0x7 && d <= 0x1F => (c, d),
                _ => return false,
            },
            _ => return false,
        };

        self.code = MessageClass::from(class_code << 5 | detail_code);
        true
    }

    pub fn get_code(&self) -> String {
        self.code.to_string()
    }

    #[inline]
    pub fn set_message_id(&mut self, message_id: u16) {
        self.message_id = Some(message_id);
    }

    /// The MID, or `None` while the stack has not assigned one yet.
    #[inline]
    pub fn get_message_id(&self) -> Option<u16> {
        self.message_id
    }

    #[inline]
    pub fn clear_message_id(&mut self) {
        self.message_id = None;
    }
}
