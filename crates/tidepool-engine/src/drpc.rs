//! Local control protocol over a Unix domain socket.
//!
//! Frames are length-prefixed: `len u32 | module_id u8 | method_id u8 |
//! body`. Bodies are JSON; only the method identities and field semantics
//! are stable, the framing is private to this engine and its local agent.

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tidepool_error::{Result, StoreError};
use tracing::debug;

/// Module id of the engine control service.
pub const MODULE_ENGINE: u8 = 1;

/// Maximum accepted body size.
const MAX_BODY: u32 = 1 << 20;

/// Control methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    GetAttachInfo,
    PoolConnect,
    PoolDisconnect,
    PoolMonitor,
    NotifyExit,
    SetupClientTelemetry,
}

impl Method {
    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Method::GetAttachInfo => 1,
            Method::PoolConnect => 2,
            Method::PoolDisconnect => 3,
            Method::PoolMonitor => 4,
            Method::NotifyExit => 5,
            Method::SetupClientTelemetry => 6,
        }
    }

    pub fn from_raw(raw: u8) -> Result<Method> {
        Ok(match raw {
            1 => Method::GetAttachInfo,
            2 => Method::PoolConnect,
            3 => Method::PoolDisconnect,
            4 => Method::PoolMonitor,
            5 => Method::NotifyExit,
            6 => Method::SetupClientTelemetry,
            other => {
                return Err(StoreError::invalid(format!(
                    "unknown control method {other}"
                )))
            }
        })
    }
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub module_id: u8,
    pub method_id: u8,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn request<T: Serialize>(method: Method, body: &T) -> Result<Frame> {
        Ok(Frame {
            module_id: MODULE_ENGINE,
            method_id: method.to_raw(),
            body: serde_json::to_vec(body)
                .map_err(|e| StoreError::invalid(format!("encode body: {e}")))?,
        })
    }

    pub fn parse_body<'de, T: Deserialize<'de>>(&'de self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| StoreError::invalid(format!("decode body: {e}")))
    }
}

/// Write one frame.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<()> {
    let len = 2 + frame.body.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&[frame.module_id, frame.method_id])?;
    writer.write_all(&frame.body)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf);
    if !(2..=MAX_BODY).contains(&len) {
        return Err(StoreError::invalid(format!("bad frame length {len}")));
    }
    let mut head = [0u8; 2];
    reader.read_exact(&mut head)?;
    let mut body = vec![0u8; len as usize - 2];
    reader.read_exact(&mut body)?;
    Ok(Frame {
        module_id: head[0],
        method_id: head[1],
        body,
    })
}

// ---------------------------------------------------------------------------
// Method bodies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetAttachInfoReq {
    pub system: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GetAttachInfoResp {
    pub provider: Option<String>,
    pub interface: Option<String>,
    pub domain: Option<String>,
    pub ranks: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConnectReq {
    pub pool_id: uuid::Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConnectResp {
    pub connected: bool,
    pub cont_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolDisconnectReq {
    pub pool_id: uuid::Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolMonitorResp {
    pub nzones: u32,
    pub total_chunks: u64,
    pub free_chunks: u64,
    pub gc_akeys: u64,
    pub gc_objs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetupClientTelemetryReq {
    pub enabled: bool,
}

/// Request dispatcher implemented by the engine.
pub trait ControlHandler {
    fn handle(&mut self, method: Method, frame: &Frame) -> Result<Frame>;
}

/// Serve one connection until the peer sends `NotifyExit` or hangs up.
pub fn serve_connection<H: ControlHandler>(stream: &mut UnixStream, handler: &mut H) -> Result<()> {
    loop {
        let frame = match read_frame(stream) {
            Ok(frame) => frame,
            Err(StoreError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(())
            }
            Err(err) => return Err(err),
        };
        let method = Method::from_raw(frame.method_id)?;
        debug!(?method, "control request");
        if method == Method::NotifyExit {
            return Ok(());
        }
        let resp = handler.handle(method, &frame)?;
        write_frame(stream, &resp)?;
    }
}

/// Bind the control socket.
pub fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(UnixListener::bind(path)?)
}

/// Blocking client for the control socket.
pub struct ControlClient {
    stream: UnixStream,
}

impl ControlClient {
    pub fn connect(path: &Path) -> Result<ControlClient> {
        Ok(ControlClient {
            stream: UnixStream::connect(path)?,
        })
    }

    /// Send a request and wait for its response.
    pub fn call<T: Serialize>(&mut self, method: Method, body: &T) -> Result<Frame> {
        write_frame(&mut self.stream, &Frame::request(method, body)?)?;
        read_frame(&mut self.stream)
    }

    /// Tell the engine this client is going away. No response expected.
    pub fn notify_exit(&mut self) -> Result<()> {
        write_frame(
            &mut self.stream,
            &Frame::request(Method::NotifyExit, &serde_json::json!({}))?,
        )
    }
}
