use super::*;
use crate::pdu::{push_u16, read_u16};

pub const MBAP_HEADER_LEN: usize = 7;
/// Largest Modbus TCP ADU: 7 byte header plus a 253 byte PDU.
pub const MAX_ADU_LEN: usize = 260;
pub const PROTOCOL_ID: u16 = 0x0000;
pub const DEFAULT_TRANSACTION_ID: u16 = 0x0102;
pub const DEFAULT_UNIT_ID: u8 = 0x01;

/// How transaction ids are assigned to outgoing requests.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransactionIds {
    /// Every request carries the same id and responses are not matched on it.
    Fixed(u16),
    /// Wrapping counter starting at 1; responses must echo the request's id.
    Incrementing,
}

impl Default for TransactionIds {
    fn default() -> Self {
        TransactionIds::Fixed(DEFAULT_TRANSACTION_ID)
    }
}

/// MBAP header. `length` counts the unit id plus the PDU.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn for_pdu(transaction_id: u16, unit_id: u8, pdu_len: usize) -> Self {
        MbapHeader {
            transaction_id,
            protocol_id: PROTOCOL_ID,
            length: (pdu_len + 1) as u16,
            unit_id,
        }
    }

    pub fn parse(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() < MBAP_HEADER_LEN {
            return Err(FrameError::TooShort(frame.len()));
        }
        Ok(MbapHeader {
            transaction_id: read_u16(&frame[0..2]),
            protocol_id: read_u16(&frame[2..4]),
            length: read_u16(&frame[4..6]),
            unit_id: frame[6],
        })
    }

    fn write(&self, frame: &mut Vec<u8>) {
        push_u16(frame, self.transaction_id);
        push_u16(frame, self.protocol_id);
        push_u16(frame, self.length);
        frame.push(self.unit_id);
    }
}

/// Validates `request` and wraps its PDU into a complete ADU.
pub fn encode_request(
    transaction_id: u16,
    unit_id: u8,
    request: &Request,
) -> Result<Vec<u8>, InvalidRequest> {
    let pdu = request.encode_pdu()?;
    Ok(wrap_tcp(transaction_id, unit_id, pdu))
}

fn wrap_tcp(transaction_id: u16, unit_id: u8, pdu: Vec<u8>) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    MbapHeader::for_pdu(transaction_id, unit_id, pdu.len()).write(&mut frame);
    frame.extend(pdu);
    frame
}

/// Checks the MBAP header of a received ADU and returns its PDU. Bytes past
/// the declared length are ignored.
pub fn unwrap_tcp<'a>(
    frame: &'a [u8],
    unit_id: u8,
    transaction_id: Option<u16>,
) -> Result<&'a [u8], FrameError> {
    // header plus at least the function code
    if frame.len() < MBAP_HEADER_LEN + 1 {
        return Err(FrameError::TooShort(frame.len()));
    }
    let header = MbapHeader::parse(frame)?;

    if header.protocol_id != PROTOCOL_ID {
        return Err(FrameError::InvalidProtocolId(header.protocol_id));
    }
    if header.unit_id != unit_id {
        return Err(FrameError::UnitIdMismatch {
            expected: unit_id,
            received: header.unit_id,
        });
    }
    if let Some(expected) = transaction_id {
        if header.transaction_id != expected {
            return Err(FrameError::TransactionIdMismatch {
                expected,
                received: header.transaction_id,
            });
        }
    }

    let end = MBAP_HEADER_LEN - 1 + header.length as usize;
    if header.length < 2 || frame.len() < end {
        return Err(FrameError::LengthMismatch {
            declared: header.length,
            received: frame.len(),
        });
    }
    Ok(&frame[MBAP_HEADER_LEN..end])
}

/// Decodes a complete response ADU answering `request`.
pub fn decode_response(
    frame: &[u8],
    unit_id: u8,
    transaction_id: Option<u16>,
    request: &Request,
) -> Result<Response, DecodeError> {
    let pdu = unwrap_tcp(frame, unit_id, transaction_id)?;
    decode_pdu(request, pdu)
}
