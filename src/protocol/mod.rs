pub mod arbiter;
pub mod crc;
pub mod frame;
pub mod transport;

pub use arbiter::{ArbiterClient, ArbiterHandle, ClientId};
pub use frame::{ExceptionCode, FunctionCode, Request, Response, ResponseError, ResponsePayload};
pub use transport::{TransportJob, REQUEST_TIMEOUT};
