//! Modbus RTU transport: owns the serial line and executes one request at a
//! time on a dedicated worker thread.
//!
//! A request is written immediately and a ~1 second timer is armed. The
//! transport then collects inbound bytes, sizes the frame, and completes the
//! request on the first CRC-valid frame that matches the outstanding slave and
//! function (payload or exception). CRC-invalid frames are logged and dropped
//! as if nothing was received; the timer keeps running. Port-level failures
//! are not surfaced per-request: they go out on the fatal channel and the
//! worker exits, since the daemon cannot continue without its only link.

use std::io::{Read, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::Utc;
use rmodbus::{guess_response_frame_len, ModbusProto};
use serialport::SerialPort;

use super::frame::{decode_response, Request, Response, ResponseError};
use crate::protocol::crc::verify_crc;

/// Per-request completion deadline.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// One unit of work for the transport thread.
pub struct TransportJob {
    pub request: Request,
    pub completion: flume::Sender<Response>,
}

/// Spawn the transport worker. Returns the job queue; the worker exits when
/// every sender is dropped or the port fails (after reporting on `fatal`).
pub fn spawn(
    port: Box<dyn SerialPort>,
    fatal: flume::Sender<anyhow::Error>,
) -> flume::Sender<TransportJob> {
    let (jobs_tx, jobs_rx) = flume::unbounded();
    std::thread::Builder::new()
        .name("modbus-transport".into())
        .spawn(move || run(port, jobs_rx, fatal))
        .expect("spawning the transport thread cannot fail");
    jobs_tx
}

fn run(
    mut port: Box<dyn SerialPort>,
    jobs: flume::Receiver<TransportJob>,
    fatal: flume::Sender<anyhow::Error>,
) {
    while let Ok(job) = jobs.recv() {
        match execute(&mut *port, &job.request, REQUEST_TIMEOUT) {
            Ok(response) => {
                let _ = job.completion.send(response);
            }
            Err(err) => {
                log::error!("serial transport failed: {err:#}");
                let _ = fatal.send(err);
                return;
            }
        }
    }
    log::debug!("transport queue closed, worker exiting");
}

/// Execute one request on the port. `Err` means the port itself failed;
/// protocol-level outcomes (timeout, CRC, exception) come back as `Response`.
pub fn execute<P>(port: &mut P, request: &Request, timeout: Duration) -> Result<Response>
where
    P: Read + Write + ?Sized,
{
    let frame = request.encode().context("failed to encode request frame")?;
    if log::log_enabled!(log::Level::Debug) {
        log::debug!("tx {}", hex(&frame));
    }
    port.write_all(&frame).context("serial write failed")?;
    port.flush().context("serial flush failed")?;

    let deadline = Utc::now()
        + chrono::Duration::from_std(timeout).context("invalid request timeout")?;
    let mut collected: Vec<u8> = Vec::with_capacity(256);
    let mut saw_crc_mismatch = false;
    let mut saw_framing = false;

    loop {
        if Utc::now() > deadline {
            // The retry budget for garbled frames is the remainder of the
            // request window; report what was seen, else a plain timeout.
            let error = if saw_crc_mismatch {
                ResponseError::CrcMismatch
            } else if saw_framing {
                ResponseError::Framing
            } else {
                ResponseError::Timeout
            };
            return Ok(Response::failed(request, error));
        }

        read_until(port, &mut collected, 2).context("serial read failed")?;
        if collected.len() < 2 {
            continue;
        }

        let expected = match guess_frame_length(&collected) {
            Some(len) => len,
            None => {
                let next_len = collected.len() + 1;
                read_until(port, &mut collected, next_len)
                    .context("serial read failed")?;
                continue;
            }
        };
        if !(4..=256).contains(&expected) {
            log::warn!("implausible frame length {expected}, dropping {} bytes", collected.len());
            saw_framing = true;
            collected.clear();
            continue;
        }

        read_until(port, &mut collected, expected).context("serial read failed")?;
        if collected.len() < expected {
            continue;
        }

        let inbound = Bytes::copy_from_slice(&collected[..expected]);
        if !verify_crc(&inbound) {
            log::warn!("CRC mismatch on inbound frame {}", hex(&inbound));
            saw_crc_mismatch = true;
            collected.clear();
            continue;
        }

        if log::log_enabled!(log::Level::Debug) {
            log::debug!("rx {}", hex(&inbound));
        }
        match decode_response(request, &inbound) {
            Some(response) => return Ok(response),
            None => {
                log::debug!("ignoring unrelated frame {}", hex(&inbound));
                collected.drain(..expected);
            }
        }
    }
}

/// Read until `target` holds `need` bytes or the port has nothing more for
/// now. The port's own read timeout paces this loop; timeouts and empty reads
/// are not errors here, they just return control to the deadline check.
fn read_until<P>(port: &mut P, target: &mut Vec<u8>, need: usize) -> std::io::Result<()>
where
    P: Read + ?Sized,
{
    while target.len() < need {
        let mut buf = [0u8; 64];
        let want = (need - target.len()).min(buf.len());
        match port.read(&mut buf[..want]) {
            Ok(0) => break,
            Ok(n) => target.extend_from_slice(&buf[..n]),
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => break,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Size the inbound frame from the bytes collected so far. `None` means more
/// bytes are needed before the length is decidable.
fn guess_frame_length(collected: &[u8]) -> Option<usize> {
    if collected.len() >= 6 {
        if let Ok(len) = guess_response_frame_len(&collected[..6], ModbusProto::Rtu) {
            return Some(len as usize);
        }
    }
    let function = *collected.get(1)?;
    if function & 0x80 != 0 {
        // Exception: slave + function + code + crc.
        return Some(5);
    }
    match function {
        0x03 => collected.get(2).map(|&count| 5 + count as usize),
        0x06 => Some(8),
        _ => None,
    }
}

fn hex(frame: &[u8]) -> String {
    frame
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}
