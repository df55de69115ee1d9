use thiserror::Error;

/// Largest quantity accepted by Read Coils / Read Discrete Inputs.
pub const MAX_READ_BITS: u16 = 0x07D0;
/// Largest quantity accepted by Read Holding / Input Registers.
pub const MAX_READ_REGISTERS: u16 = 0x007D;
/// Largest quantity accepted by Write Multiple Coils.
pub const MAX_WRITE_COILS: u16 = 0x07B0;
/// Largest quantity accepted by Write Multiple Registers.
pub const MAX_WRITE_REGISTERS: u16 = 0x007B;

/// Set in the function code byte of every exception response.
pub const EXCEPTION_BIT: u8 = 0x80;

const COIL_ON_WORD: u16 = 0xFF00;
const COIL_OFF_WORD: u16 = 0x0000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidRequest {
    #[error("Function code {0:#04x} is not valid for this request")]
    InvalidFunction(u8),

    #[error("Quantity {quantity} out of range 1..={max} for {function:?}")]
    InvalidQuantity {
        function: FunctionCode,
        quantity: usize,
        max: u16,
    },

    #[error("Invalid range: {address} + {quantity} > 65536")]
    RangeOverflow { address: u16, quantity: usize },

    #[error("Invalid coil value {0:#06x}, expected 0xFF00 or 0x0000")]
    InvalidCoilValue(u16),
}

/// Reasons a received frame could not be turned into a response.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),

    #[error("Invalid protocol ID: {0}")]
    InvalidProtocolId(u16),

    #[error("Unit ID mismatch: expected {expected}, received {received}")]
    UnitIdMismatch { expected: u8, received: u8 },

    #[error("Transaction ID mismatch: expected {expected:#06x}, received {received:#06x}")]
    TransactionIdMismatch { expected: u16, received: u16 },

    #[error("Invalid MBAP length {declared} for a {received} byte frame")]
    LengthMismatch { declared: u16, received: usize },

    #[error("Unexpected function code: expected {expected:#04x}, got {received:#04x}")]
    UnexpectedFunctionCode { expected: u8, received: u8 },

    #[error(
        "Byte count {declared} does not match expected {expected} ({available} bytes available)"
    )]
    ByteCountMismatch {
        declared: u8,
        expected: usize,
        available: usize,
    },

    #[error("Odd byte count {0} in a register response")]
    OddRegisterByteCount(u8),

    #[error("Coil echo {0:#06x} is neither ON nor OFF")]
    InvalidCoilEcho(u16),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Reads answered with packed bits rather than registers.
    pub fn is_bit_read(self) -> bool {
        matches!(self, FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs)
    }

    pub fn is_register_read(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters
        )
    }

    pub fn is_write_multiple(self) -> bool {
        matches!(
            self,
            FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters
        )
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = InvalidRequest;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x01 => Ok(FunctionCode::ReadCoils),
            0x02 => Ok(FunctionCode::ReadDiscreteInputs),
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x04 => Ok(FunctionCode::ReadInputRegisters),
            0x05 => Ok(FunctionCode::WriteSingleCoil),
            0x06 => Ok(FunctionCode::WriteSingleRegister),
            0x0F => Ok(FunctionCode::WriteMultipleCoils),
            0x10 => Ok(FunctionCode::WriteMultipleRegisters),
            other => Err(InvalidRequest::InvalidFunction(other)),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CoilValue {
    On,
    Off,
}

impl CoilValue {
    /// Wire encoding used by Write Single Coil.
    pub fn word(self) -> u16 {
        match self {
            CoilValue::On => COIL_ON_WORD,
            CoilValue::Off => COIL_OFF_WORD,
        }
    }
}

impl From<bool> for CoilValue {
    fn from(on: bool) -> Self {
        if on { CoilValue::On } else { CoilValue::Off }
    }
}

impl TryFrom<u16> for CoilValue {
    type Error = InvalidRequest;

    fn try_from(word: u16) -> Result<Self, Self::Error> {
        match word {
            COIL_ON_WORD => Ok(CoilValue::On),
            COIL_OFF_WORD => Ok(CoilValue::Off),
            other => Err(InvalidRequest::InvalidCoilValue(other)),
        }
    }
}

/// Exception codes carried by exception responses. Only the two codes the
/// client distinguishes get their own variant.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    Unknown(u8),
}

impl From<u8> for ExceptionCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalDataAddress,
            other => ExceptionCode::Unknown(other),
        }
    }
}

/// One request, carrying only the fields its function code uses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    ReadCoils { address: u16, quantity: u16 },
    ReadDiscreteInputs { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    ReadInputRegisters { address: u16, quantity: u16 },
    /// `value` is the raw wire word; only 0xFF00 and 0x0000 are accepted.
    WriteSingleCoil { address: u16, value: u16 },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, coils: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
}

impl Request {
    /// Builds one of the four read requests from a function code chosen at
    /// runtime.
    pub fn read(
        function: FunctionCode,
        address: u16,
        quantity: u16,
    ) -> Result<Self, InvalidRequest> {
        match function {
            FunctionCode::ReadCoils => Ok(Request::ReadCoils { address, quantity }),
            FunctionCode::ReadDiscreteInputs => {
                Ok(Request::ReadDiscreteInputs { address, quantity })
            }
            FunctionCode::ReadHoldingRegisters => {
                Ok(Request::ReadHoldingRegisters { address, quantity })
            }
            FunctionCode::ReadInputRegisters => {
                Ok(Request::ReadInputRegisters { address, quantity })
            }
            other => Err(InvalidRequest::InvalidFunction(other.code())),
        }
    }

    pub fn write_single_coil(address: u16, value: CoilValue) -> Self {
        Request::WriteSingleCoil {
            address,
            value: value.word(),
        }
    }

    pub fn function(&self) -> FunctionCode {
        match self {
            Request::ReadCoils { .. } => FunctionCode::ReadCoils,
            Request::ReadDiscreteInputs { .. } => FunctionCode::ReadDiscreteInputs,
            Request::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Request::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            Request::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Request::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Request::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            Request::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    pub fn address(&self) -> u16 {
        match self {
            Request::ReadCoils { address, .. }
            | Request::ReadDiscreteInputs { address, .. }
            | Request::ReadHoldingRegisters { address, .. }
            | Request::ReadInputRegisters { address, .. }
            | Request::WriteSingleCoil { address, .. }
            | Request::WriteSingleRegister { address, .. }
            | Request::WriteMultipleCoils { address, .. }
            | Request::WriteMultipleRegisters { address, .. } => *address,
        }
    }

    /// Number of coils or registers addressed, 1 for single writes.
    pub fn quantity(&self) -> usize {
        match self {
            Request::ReadCoils { quantity, .. }
            | Request::ReadDiscreteInputs { quantity, .. }
            | Request::ReadHoldingRegisters { quantity, .. }
            | Request::ReadInputRegisters { quantity, .. } => *quantity as usize,
            Request::WriteSingleCoil { .. } | Request::WriteSingleRegister { .. } => 1,
            Request::WriteMultipleCoils { coils, .. } => coils.len(),
            Request::WriteMultipleRegisters { values, .. } => values.len(),
        }
    }

    pub fn validate(&self) -> Result<(), InvalidRequest> {
        let function = self.function();
        let max = match function {
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => MAX_READ_BITS,
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                MAX_READ_REGISTERS
            }
            FunctionCode::WriteMultipleCoils => MAX_WRITE_COILS,
            FunctionCode::WriteMultipleRegisters => MAX_WRITE_REGISTERS,
            FunctionCode::WriteSingleCoil => {
                if let Request::WriteSingleCoil { value, .. } = self {
                    CoilValue::try_from(*value)?;
                }
                return Ok(());
            }
            FunctionCode::WriteSingleRegister => return Ok(()),
        };

        let quantity = self.quantity();
        if quantity == 0 || quantity > max as usize {
            return Err(InvalidRequest::InvalidQuantity {
                function,
                quantity,
                max,
            });
        }

        let address = self.address();
        if address as usize + quantity > 0x1_0000 {
            return Err(InvalidRequest::RangeOverflow { address, quantity });
        }
        Ok(())
    }

    /// Validates the request and encodes its PDU (function code and body).
    pub fn encode_pdu(&self) -> Result<Vec<u8>, InvalidRequest> {
        self.validate()?;

        let mut pdu = Vec::with_capacity(6 + self.data_len());
        pdu.push(self.function().code());
        push_u16(&mut pdu, self.address());

        match self {
            Request::ReadCoils { quantity, .. }
            | Request::ReadDiscreteInputs { quantity, .. }
            | Request::ReadHoldingRegisters { quantity, .. }
            | Request::ReadInputRegisters { quantity, .. } => push_u16(&mut pdu, *quantity),
            Request::WriteSingleCoil { value, .. } | Request::WriteSingleRegister { value, .. } => {
                push_u16(&mut pdu, *value)
            }
            Request::WriteMultipleCoils { coils, .. } => {
                let packed = pack_bits(coils);
                push_u16(&mut pdu, coils.len() as u16);
                pdu.push(packed.len() as u8);
                pdu.extend(packed);
            }
            Request::WriteMultipleRegisters { values, .. } => {
                push_u16(&mut pdu, values.len() as u16);
                pdu.push((values.len() * 2) as u8);
                for value in values {
                    push_u16(&mut pdu, *value);
                }
            }
        }
        Ok(pdu)
    }

    fn data_len(&self) -> usize {
        match self {
            Request::WriteMultipleCoils { coils, .. } => coils.len().div_ceil(8),
            Request::WriteMultipleRegisters { values, .. } => values.len() * 2,
            _ => 0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WrittenCoil {
    pub address: u16,
    pub value: CoilValue,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WrittenRegister {
    pub address: u16,
    pub value: u16,
}

/// Echo of a write-multiple request: start address and how many coils or
/// registers the server wrote.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WrittenRange {
    pub address: u16,
    pub quantity: u16,
}

/// Decoded success payload of one response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    /// Packed coil or discrete input bits, exactly as sent by the server.
    Bits(Vec<u8>),
    Registers(Vec<u16>),
    SingleCoil(WrittenCoil),
    SingleRegister(WrittenRegister),
    Multiple(WrittenRange),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Modbus exception: function code {function:#04x}, exception {code:?}")]
    Exception { function: u8, code: ExceptionCode },

    #[error(transparent)]
    Malformed(#[from] FrameError),
}

/// Decodes the PDU answering `request`. Exception responses stop decoding at
/// the exception code.
pub fn decode_pdu(request: &Request, pdu: &[u8]) -> Result<Response, DecodeError> {
    let Some(&function_code) = pdu.first() else {
        return Err(FrameError::TooShort(0).into());
    };

    let function = request.function();
    if function_code & !EXCEPTION_BIT != function.code() {
        return Err(FrameError::UnexpectedFunctionCode {
            expected: function.code(),
            received: function_code,
        }
        .into());
    }

    if function_code & EXCEPTION_BIT != 0 {
        let Some(&code) = pdu.get(1) else {
            return Err(FrameError::TooShort(pdu.len()).into());
        };
        return Err(DecodeError::Exception {
            function: function_code,
            code: ExceptionCode::from(code),
        });
    }

    let response = match function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            let data = read_data(pdu, request.quantity().div_ceil(8))?;
            Response::Bits(data.to_vec())
        }
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            if pdu.len() > 1 && pdu[1] % 2 != 0 {
                return Err(FrameError::OddRegisterByteCount(pdu[1]).into());
            }
            let data = read_data(pdu, request.quantity() * 2)?;
            Response::Registers(
                data.chunks_exact(2)
                    .map(|pair| ((pair[0] as u16) << 8) | pair[1] as u16)
                    .collect(),
            )
        }
        FunctionCode::WriteSingleCoil => {
            let (address, word) = read_echo(pdu)?;
            let value =
                CoilValue::try_from(word).map_err(|_| FrameError::InvalidCoilEcho(word))?;
            Response::SingleCoil(WrittenCoil { address, value })
        }
        FunctionCode::WriteSingleRegister => {
            let (address, value) = read_echo(pdu)?;
            Response::SingleRegister(WrittenRegister { address, value })
        }
        FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters => {
            let (address, quantity) = read_echo(pdu)?;
            Response::Multiple(WrittenRange { address, quantity })
        }
    };
    Ok(response)
}

/// Byte count at offset 1, data after it.
fn read_data(pdu: &[u8], expected: usize) -> Result<&[u8], FrameError> {
    if pdu.len() < 2 {
        return Err(FrameError::TooShort(pdu.len()));
    }
    let declared = pdu[1];
    let available = pdu.len() - 2;
    if declared as usize != expected || available < expected {
        return Err(FrameError::ByteCountMismatch {
            declared,
            expected,
            available,
        });
    }
    Ok(&pdu[2..2 + expected])
}

/// Two big-endian words after the function code.
fn read_echo(pdu: &[u8]) -> Result<(u16, u16), FrameError> {
    if pdu.len() < 5 {
        return Err(FrameError::TooShort(pdu.len()));
    }
    Ok((read_u16(&pdu[1..3]), read_u16(&pdu[3..5])))
}

pub(crate) fn push_u16(buffer: &mut Vec<u8>, value: u16) {
    buffer.push((value >> 8) as u8);
    buffer.push(value as u8);
}

pub(crate) fn read_u16(bytes: &[u8]) -> u16 {
    ((bytes[0] as u16) << 8) | bytes[1] as u16
}

/// Packs coil states LSB-first: coil `i` is bit `i % 8` of byte `i / 8`.
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; bits.len().div_ceil(8)];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Expands the first `count` bits of a packed coil/discrete input payload.
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count.min(bytes.len() * 8))
        .map(|i| (bytes[i / 8] >> (i % 8)) & 0x01 == 0x01)
        .collect()
}
