//! Typed Modbus RTU requests and responses for the register subset the ZBM
//! speaks: ReadHoldingRegisters (0x03) and WriteSingleRegister (0x06).
//!
//! Request frames are generated through `rmodbus`; inbound frames are decoded
//! by hand so exception codes and echo payloads stay visible to the caller.

use anyhow::Result;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rmodbus::{client::ModbusRequest, ModbusProto};

/// Function codes used on the ZBM bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FunctionCode {
    ReadHoldingRegisters = 0x03,
    WriteSingleRegister = 0x06,
}

/// Standard Modbus exception codes the ZBM can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    DeviceFailure = 0x04,
}

/// One Modbus interaction, consumed exactly once by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub function: FunctionCode,
    pub slave: u8,
    pub start_register: u16,
    /// Register count for reads, register value for writes.
    pub count_or_value: u16,
}

impl Request {
    pub fn read_holding_registers(slave: u8, start_register: u16, count: u16) -> Self {
        Self {
            function: FunctionCode::ReadHoldingRegisters,
            slave,
            start_register,
            count_or_value: count,
        }
    }

    pub fn write_single_register(slave: u8, register: u16, value: u16) -> Self {
        Self {
            function: FunctionCode::WriteSingleRegister,
            slave,
            start_register: register,
            count_or_value: value,
        }
    }

    /// Build the wire frame including the trailing CRC.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut request = ModbusRequest::new(self.slave, ModbusProto::Rtu);
        let mut raw = Vec::with_capacity(8);
        match self.function {
            FunctionCode::ReadHoldingRegisters => {
                request.generate_get_holdings(self.start_register, self.count_or_value, &mut raw)?
            }
            FunctionCode::WriteSingleRegister => {
                request.generate_set_holding(self.start_register, self.count_or_value, &mut raw)?
            }
        }
        Ok(raw)
    }
}

/// Decoded payload of a successful response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    /// Register words from a ReadHoldingRegisters response.
    Registers(Vec<u16>),
    /// Echoed (register, value) pair from a WriteSingleRegister response.
    Echo { register: u16, value: u16 },
}

/// Why a request did not complete with a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseError {
    Timeout,
    CrcMismatch,
    Exception(u8),
    Framing,
}

/// Completion of one request, delivered to the originating client.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub function: FunctionCode,
    pub slave: u8,
    pub payload: Option<ResponsePayload>,
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn completed(request: &Request, payload: ResponsePayload) -> Self {
        Self {
            function: request.function,
            slave: request.slave,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failed(request: &Request, error: ResponseError) -> Self {
        Self {
            function: request.function,
            slave: request.slave,
            payload: None,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn registers(&self) -> Option<&[u16]> {
        match &self.payload {
            Some(ResponsePayload::Registers(values)) => Some(values),
            _ => None,
        }
    }

    pub fn echo(&self) -> Option<(u16, u16)> {
        match &self.payload {
            Some(ResponsePayload::Echo { register, value }) => Some((*register, *value)),
            _ => None,
        }
    }
}

/// Decode one CRC-valid inbound frame against the outstanding request.
///
/// Returns `None` when the frame belongs to another slave or echoes a function
/// we are not waiting for; the transport keeps listening in that case. A frame
/// that matches but is internally inconsistent yields a `Framing` response.
pub fn decode_response(request: &Request, frame: &[u8]) -> Option<Response> {
    if frame.len() < 4 || frame[0] != request.slave {
        return None;
    }
    let function: u8 = request.function.into();
    if frame[1] == function | 0x80 {
        if frame.len() != 5 {
            return Some(Response::failed(request, ResponseError::Framing));
        }
        return Some(Response::failed(request, ResponseError::Exception(frame[2])));
    }
    if frame[1] != function {
        return None;
    }
    match request.function {
        FunctionCode::ReadHoldingRegisters => {
            let byte_count = frame[2] as usize;
            if byte_count != request.count_or_value as usize * 2
                || frame.len() != 3 + byte_count + 2
            {
                return Some(Response::failed(request, ResponseError::Framing));
            }
            let values = frame[3..3 + byte_count]
                .chunks_exact(2)
                .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
                .collect::<Vec<_>>();
            Some(Response::completed(request, ResponsePayload::Registers(values)))
        }
        FunctionCode::WriteSingleRegister => {
            if frame.len() != 8 {
                return Some(Response::failed(request, ResponseError::Framing));
            }
            let register = u16::from_be_bytes([frame[2], frame[3]]);
            let value = u16::from_be_bytes([frame[4], frame[5]]);
            if register != request.start_register {
                // Stale echo of an earlier write; keep listening.
                log::debug!("write echo for register 0x{register:04X}, waiting on 0x{:04X}", request.start_register);
                return None;
            }
            Some(Response::completed(request, ResponsePayload::Echo { register, value }))
        }
    }
}
