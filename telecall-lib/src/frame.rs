//! Binary request/response frames carried over the data channel.
//!
//! ```text
//! request:  [version][from][apiCode][dataType][subscribe][sessionId][more][payload..]
//! response: [version][from][apiCode][dataType][sessionId][responseCode][more][payload..]
//! ```
//!
//! Bit 0x80 of `from` is clear for requests and set for responses.

use bytes::{BufMut, Bytes, BytesMut};
use getset::{CopyGetters, Getters};

use crate::error::FrameError;

pub const HEADER_LEN: usize = 7;
pub const VERSION: u8 = 1;

const MORE_NO: i8 = 0;
const MORE_YES: i8 = -1;

/// Returns `true` if `buf` holds a request frame.
pub fn is_request(buf: &[u8]) -> bool {
    buf.get(1).map_or(false, |from| from & 0x80 == 0)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Web,
    Mobile,
}

impl Role {
    fn request_byte(self) -> i8 {
        match self {
            Role::Web => 1,
            Role::Mobile => 2,
        }
    }

    fn response_byte(self) -> i8 {
        -self.request_byte()
    }

    fn from_request_byte(value: i8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(Role::Web),
            2 => Ok(Role::Mobile),
            _ => Err(FrameError::InvalidField {
                field: "from",
                value,
            }),
        }
    }

    fn from_response_byte(value: i8) -> Result<Self, FrameError> {
        Self::from_request_byte(value.wrapping_neg())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    String,
    Binary,
}

impl From<DataType> for i8 {
    fn from(value: DataType) -> Self {
        match value {
            DataType::String => 0,
            DataType::Binary => 1,
        }
    }
}

impl TryFrom<i8> for DataType {
    type Error = FrameError;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DataType::String),
            1 => Ok(DataType::Binary),
            _ => Err(FrameError::InvalidField {
                field: "dataType",
                value,
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subscribe {
    Register,
    Unregister,
    None,
}

impl From<Subscribe> for i8 {
    fn from(value: Subscribe) -> Self {
        match value {
            Subscribe::Register => 0,
            Subscribe::Unregister => -1,
            Subscribe::None => 1,
        }
    }
}

impl TryFrom<i8> for Subscribe {
    type Error = FrameError;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Subscribe::Register),
            -1 => Ok(Subscribe::Unregister),
            1 => Ok(Subscribe::None),
            _ => Err(FrameError::InvalidField {
                field: "subscribe",
                value,
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ApiCode {
    DeviceInfo,
    DeviceState,
    DevicePhoto,
}

impl ApiCode {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(ApiCode::DeviceInfo),
            1 => Some(ApiCode::DeviceState),
            2 => Some(ApiCode::DevicePhoto),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            ApiCode::DeviceInfo => 0,
            ApiCode::DeviceState => 1,
            ApiCode::DevicePhoto => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseCode {
    Success,
    FailUnknown,
    FailCheckAuthorization,
    FailUnknownApiType,
    FailDecodeParam,
    FailDecrypt,
}

impl From<ResponseCode> for i8 {
    fn from(value: ResponseCode) -> Self {
        match value {
            ResponseCode::Success => 0,
            ResponseCode::FailUnknown => -101,
            ResponseCode::FailCheckAuthorization => -1,
            ResponseCode::FailUnknownApiType => -2,
            ResponseCode::FailDecodeParam => -3,
            ResponseCode::FailDecrypt => -4,
        }
    }
}

impl TryFrom<i8> for ResponseCode {
    type Error = FrameError;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ResponseCode::Success),
            -101 => Ok(ResponseCode::FailUnknown),
            -1 => Ok(ResponseCode::FailCheckAuthorization),
            -2 => Ok(ResponseCode::FailUnknownApiType),
            -3 => Ok(ResponseCode::FailDecodeParam),
            -4 => Ok(ResponseCode::FailDecrypt),
            _ => Err(FrameError::InvalidField {
                field: "responseCode",
                value,
            }),
        }
    }
}

fn more_byte(more: bool) -> i8 {
    if more {
        MORE_YES
    } else {
        MORE_NO
    }
}

#[derive(Clone, Debug, PartialEq, Eq, CopyGetters, Getters)]
pub struct DcRequest {
    #[getset(get_copy = "pub")]
    version: u8,
    #[getset(get_copy = "pub")]
    from: Role,
    #[getset(get_copy = "pub")]
    api_code: u8,
    #[getset(get_copy = "pub")]
    data_type: DataType,
    #[getset(get_copy = "pub")]
    subscribe: Subscribe,
    #[getset(get_copy = "pub")]
    session_id: u8,
    #[getset(get_copy = "pub")]
    more: bool,
    #[getset(get = "pub")]
    payload: Bytes,
}

impl DcRequest {
    pub fn builder() -> DcRequestBuilder {
        DcRequestBuilder {
            request: DcRequest {
                version: VERSION,
                from: Role::Mobile,
                api_code: 0,
                data_type: DataType::String,
                subscribe: Subscribe::None,
                session_id: 0,
                more: false,
                payload: Bytes::new(),
            },
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.version);
        buf.put_i8(self.from.request_byte());
        buf.put_u8(self.api_code);
        buf.put_i8(self.data_type.into());
        buf.put_i8(self.subscribe.into());
        buf.put_u8(self.session_id);
        buf.put_i8(more_byte(self.more));
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

pub struct DcRequestBuilder {
    request: DcRequest,
}

impl DcRequestBuilder {
    pub fn version(mut self, version: u8) -> Self {
        self.request.version = version;
        self
    }

    pub fn from(mut self, from: Role) -> Self {
        self.request.from = from;
        self
    }

    pub fn api_code(mut self, api_code: u8) -> Self {
        self.request.api_code = api_code;
        self
    }

    pub fn data_type(mut self, data_type: DataType) -> Self {
        self.request.data_type = data_type;
        self
    }

    pub fn subscribe(mut self, subscribe: Subscribe) -> Self {
        self.request.subscribe = subscribe;
        self
    }

    pub fn session_id(mut self, session_id: u8) -> Self {
        self.request.session_id = session_id;
        self
    }

    pub fn more(mut self, more: bool) -> Self {
        self.request.more = more;
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.request.payload = payload.into();
        self
    }

    pub fn build(self) -> DcRequest {
        self.request
    }
}

#[derive(Clone, Debug, PartialEq, Eq, CopyGetters, Getters)]
pub struct DcResponse {
    #[getset(get_copy = "pub")]
    version: u8,
    #[getset(get_copy = "pub")]
    from: Role,
    #[getset(get_copy = "pub")]
    api_code: u8,
    #[getset(get_copy = "pub")]
    data_type: DataType,
    #[getset(get_copy = "pub")]
    session_id: u8,
    #[getset(get_copy = "pub")]
    response_code: ResponseCode,
    #[getset(get_copy = "pub")]
    more: bool,
    #[getset(get = "pub")]
    payload: Bytes,
}

impl DcResponse {
    pub fn builder() -> DcResponseBuilder {
        DcResponseBuilder {
            response: DcResponse {
                version: VERSION,
                from: Role::Mobile,
                api_code: 0,
                data_type: DataType::String,
                session_id: 0,
                response_code: ResponseCode::Success,
                more: false,
                payload: Bytes::new(),
            },
        }
    }

    /// Starts a response that answers `request`: version, api code and
    /// session id are carried over.
    pub fn reply_to(request: &DcRequest) -> DcResponseBuilder {
        Self::builder()
            .version(request.version)
            .api_code(request.api_code)
            .session_id(request.session_id)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.version);
        buf.put_i8(self.from.response_byte());
        buf.put_u8(self.api_code);
        buf.put_i8(self.data_type.into());
        buf.put_u8(self.session_id);
        buf.put_i8(self.response_code.into());
        buf.put_i8(more_byte(self.more));
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

pub struct DcResponseBuilder {
    response: DcResponse,
}

impl DcResponseBuilder {
    pub fn version(mut self, version: u8) -> Self {
        self.response.version = version;
        self
    }

    pub fn from(mut self, from: Role) -> Self {
        self.response.from = from;
        self
    }

    pub fn api_code(mut self, api_code: u8) -> Self {
        self.response.api_code = api_code;
        self
    }

    pub fn data_type(mut self, data_type: DataType) -> Self {
        self.response.data_type = data_type;
        self
    }

    pub fn session_id(mut self, session_id: u8) -> Self {
        self.response.session_id = session_id;
        self
    }

    pub fn response_code(mut self, response_code: ResponseCode) -> Self {
        self.response.response_code = response_code;
        self
    }

    pub fn more(mut self, more: bool) -> Self {
        self.response.more = more;
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.response.payload = payload.into();
        self
    }

    pub fn build(self) -> DcResponse {
        self.response
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DcFrame {
    Request(DcRequest),
    Response(DcResponse),
}

impl DcFrame {
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::TooShort { len: buf.len() });
        }
        let byte = |idx: usize| buf[idx] as i8;
        let payload = Bytes::copy_from_slice(&buf[HEADER_LEN..]);
        let more = byte(6) != MORE_NO;
        if is_request(buf) {
            Ok(DcFrame::Request(DcRequest {
                version: buf[0],
                from: Role::from_request_byte(byte(1))?,
                api_code: buf[2],
                data_type: DataType::try_from(byte(3))?,
                subscribe: Subscribe::try_from(byte(4))?,
                session_id: buf[5],
                more,
                payload,
            }))
        } else {
            Ok(DcFrame::Response(DcResponse {
                version: buf[0],
                from: Role::from_response_byte(byte(1))?,
                api_code: buf[2],
                data_type: DataType::try_from(byte(3))?,
                session_id: buf[4],
                response_code: ResponseCode::try_from(byte(5))?,
                more,
                payload,
            }))
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            DcFrame::Request(request) => request.encode(),
            DcFrame::Response(response) => response.encode(),
        }
    }
}

impl TryFrom<DcFrame> for DcRequest {
    type Error = FrameError;

    fn try_from(frame: DcFrame) -> Result<Self, Self::Error> {
        match frame {
            DcFrame::Request(request) => Ok(request),
            DcFrame::Response(_) => Err(FrameError::UnexpectedKind("response")),
        }
    }
}

impl TryFrom<DcFrame> for DcResponse {
    type Error = FrameError;

    fn try_from(frame: DcFrame) -> Result<Self, Self::Error> {
        match frame {
            DcFrame::Response(response) => Ok(response),
            DcFrame::Request(_) => Err(FrameError::UnexpectedKind("request")),
        }
    }
}
