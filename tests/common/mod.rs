//! Shared test harness: an in-memory transport on the far end of the job
//! channel, plus a scripted ZBM device model.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;

use redflow_bridge::device::registers::{
    REG_ALARMS, REG_DEVICE_ADDRESS, REG_DEVICE_ID, REG_FIRMWARE_VERSION, REG_MEASUREMENTS,
    REG_SERIAL, REG_STATUS,
};
use redflow_bridge::protocol::{
    ArbiterHandle, FunctionCode, Request, Response, ResponseError, ResponsePayload, TransportJob,
};

pub type RequestLog = Arc<Mutex<Vec<(Instant, Request)>>>;

/// Stand up an arbiter whose transport is the given handler. Every request is
/// appended to the returned log before the handler answers it.
pub fn start_bus<H>(mut handler: H) -> (ArbiterHandle, RequestLog)
where
    H: FnMut(&Request) -> Response + Send + 'static,
{
    let (jobs_tx, jobs_rx) = flume::unbounded::<TransportJob>();
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
    let handler_log = log.clone();
    tokio::spawn(async move {
        while let Ok(job) = jobs_rx.recv_async().await {
            handler_log.lock().push((Instant::now(), job.request.clone()));
            let response = handler(&job.request);
            let _ = job.completion.send(response);
        }
    });
    (ArbiterHandle::start(jobs_tx), log)
}

pub fn registers(request: &Request, values: &[u16]) -> Response {
    Response::completed(request, ResponsePayload::Registers(values.to_vec()))
}

pub fn echo(request: &Request) -> Response {
    Response::completed(
        request,
        ResponsePayload::Echo {
            register: request.start_register,
            value: request.count_or_value,
        },
    )
}

pub fn timeout(request: &Request) -> Response {
    Response::failed(request, ResponseError::Timeout)
}

pub fn exception(request: &Request, code: u8) -> Response {
    Response::failed(request, ResponseError::Exception(code))
}

/// Scripted bus model: a set of ZBM devices addressable by slave id.
#[derive(Clone, Default)]
pub struct MockBus {
    inner: Arc<Mutex<MockBusState>>,
}

#[derive(Default)]
struct MockBusState {
    devices: Vec<MockDevice>,
}

pub struct MockDevice {
    pub address: u8,
    pub serial: [u16; 2],
    /// Stops answering while true.
    pub silent: bool,
    /// Answers alarm-block reads with IllegalDataAddress while true.
    pub alarms_unsupported: bool,
    /// Refuses (times out on) address writes while true.
    pub reject_address_writes: bool,
}

impl MockDevice {
    pub fn new(address: u8, serial_number: u32) -> Self {
        Self {
            address,
            serial: [(serial_number >> 16) as u16, serial_number as u16],
            silent: false,
            alarms_unsupported: false,
            reject_address_writes: false,
        }
    }
}

impl MockBus {
    pub fn new(devices: Vec<MockDevice>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockBusState { devices })),
        }
    }

    pub fn handler(&self) -> impl FnMut(&Request) -> Response + Send + 'static {
        let inner = self.inner.clone();
        move |request| inner.lock().answer(request)
    }

    pub fn set_silent(&self, address: u8, silent: bool) {
        let mut inner = self.inner.lock();
        if let Some(device) = inner.devices.iter_mut().find(|d| d.address == address) {
            device.silent = silent;
        }
    }

    pub fn addresses(&self) -> Vec<u8> {
        self.inner.lock().devices.iter().map(|d| d.address).collect()
    }
}

impl MockBusState {
    fn answer(&mut self, request: &Request) -> Response {
        let Some(device) = self
            .devices
            .iter_mut()
            .find(|d| d.address == request.slave && !d.silent)
        else {
            return timeout(request);
        };
        match request.function {
            FunctionCode::ReadHoldingRegisters => {
                let count = request.count_or_value as usize;
                match request.start_register {
                    REG_DEVICE_ID => registers(request, &[0x5A01]),
                    REG_SERIAL => registers(request, &device.serial.clone()),
                    REG_FIRMWARE_VERSION => registers(request, &[0x0102, 0x0003]),
                    REG_MEASUREMENTS => registers(
                        request,
                        &[0x0050, 0x0258, 0x00C8, 0xFF9C, 0x00F5, 0x00E1][..count],
                    ),
                    REG_STATUS => registers(request, &[2, 1, 0x2648][..count]),
                    REG_ALARMS => {
                        if device.alarms_unsupported {
                            exception(request, 0x02)
                        } else {
                            registers(request, &[0b0001, 0b0100][..count])
                        }
                    }
                    _ => exception(request, 0x02),
                }
            }
            FunctionCode::WriteSingleRegister => {
                if request.start_register == REG_DEVICE_ADDRESS {
                    if device.reject_address_writes {
                        return timeout(request);
                    }
                    device.address = request.count_or_value as u8;
                }
                echo(request)
            }
        }
    }
}
