// lib.rs

mod client;
mod engine;
mod modbus_tcp;
mod pdu;
mod transport;

pub use client::{
    ClientConfig, ClientConfigBuilder, ConfigError, ModbusClient, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_PORT, DEFAULT_RESPONSE_TIMEOUT,
};
pub use engine::{EngineState, ProtocolEngine, Received};
pub use modbus_tcp::{
    decode_response, encode_request, unwrap_tcp, MbapHeader, TransactionIds,
    DEFAULT_TRANSACTION_ID, DEFAULT_UNIT_ID, MAX_ADU_LEN, MBAP_HEADER_LEN, PROTOCOL_ID,
};
pub use pdu::{
    decode_pdu, pack_bits, unpack_bits, CoilValue, DecodeError, ExceptionCode, FrameError,
    FunctionCode, InvalidRequest, Request, Response, WrittenCoil, WrittenRange, WrittenRegister,
    EXCEPTION_BIT, MAX_READ_BITS, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};
pub use transport::{Connection, Readiness, TransportError};

/// Outward status vocabulary. Every outcome of a send or receive maps to
/// exactly one of these.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    InvalidFunction,
    WrongValue,
    CommunicationProblem,
    NoAnswerYet,
    IllegalFunction,
    IllegalAddress,
    GeneralError,
    WrongDataReturned,
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Invalid request: {0}")]
    Invalid(#[from] InvalidRequest),

    #[error("Response to {0:?} request still pending")]
    ResponsePending(FunctionCode),

    #[error("Communication problem: {0}")]
    Communication(#[from] TransportError),
}

impl RequestError {
    pub fn status(&self) -> Status {
        match self {
            RequestError::Invalid(InvalidRequest::InvalidFunction(_)) => Status::InvalidFunction,
            RequestError::Invalid(_) => Status::WrongValue,
            RequestError::ResponsePending(_) => Status::GeneralError,
            RequestError::Communication(_) => Status::CommunicationProblem,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error("Modbus exception: function code {function:#04x}, exception {code:?}")]
    Exception { function: u8, code: ExceptionCode },

    #[error("Wrong data returned: {0}")]
    WrongDataReturned(#[from] FrameError),

    #[error("No request pending")]
    NoRequestPending,

    #[error("Pending {pending:?} request is not answered by this response kind")]
    UnexpectedResponseKind { pending: FunctionCode },

    #[error("Communication problem: {0}")]
    Communication(#[from] TransportError),
}

impl ResponseError {
    pub fn status(&self) -> Status {
        match self {
            ResponseError::Exception {
                code: ExceptionCode::IllegalFunction,
                ..
            } => Status::IllegalFunction,
            ResponseError::Exception {
                code: ExceptionCode::IllegalDataAddress,
                ..
            } => Status::IllegalAddress,
            ResponseError::Exception { .. } => Status::GeneralError,
            ResponseError::WrongDataReturned(_) => Status::WrongDataReturned,
            ResponseError::NoRequestPending | ResponseError::UnexpectedResponseKind { .. } => {
                Status::GeneralError
            }
            ResponseError::Communication(_) => Status::CommunicationProblem,
        }
    }

    /// Communication failures leave the connection closed; every other
    /// error keeps it usable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ResponseError::Communication(_))
    }
}

impl TransportError {
    pub fn status(&self) -> Status {
        Status::CommunicationProblem
    }
}
