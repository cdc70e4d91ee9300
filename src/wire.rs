//! Wire formats for the control protocol and the variable data bus.
//!
//! Two planes with different encodings:
//!
//! - **Control plane** (RFSM request/reply): event and response payloads are
//!   small JSON documents, one struct per message type.
//! - **Data plane** (PUB/SUB variable exchange): each published message is a
//!   4-byte header — publishing slave ID and variable ID, both u16
//!   little-endian — followed by a type-specific little-endian payload.
//!   The fixed-size header doubles as the subscription prefix.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{DataType, ScalarValue};
use crate::types::{SlaveId, StepId, TimeDuration, TimePoint, VariableId};

/// First request frame of every RFSM event.
pub const EVENT_FRAME: &[u8] = b"EVENT";

/// Event identifiers sent by the master.
pub mod event {
    pub const HELLO: &[u8] = b"HELLO";
    pub const SETUP: &[u8] = b"SETUP";
    pub const DESCRIBE: &[u8] = b"DESCRIBE";
    pub const SET_VAR: &[u8] = b"SET_VAR";
    pub const GET_VAR: &[u8] = b"GET_VAR";
    pub const SET_PEERS: &[u8] = b"SET_PEERS";
    pub const START_SIM: &[u8] = b"START_SIM";
    pub const STEP: &[u8] = b"STEP";
    pub const ACCEPT_STEP: &[u8] = b"ACCEPT_STEP";
    pub const TERMINATE: &[u8] = b"TERMINATE";
}

/// Response identifiers sent by the slave.
pub mod response {
    pub const HELLO: &[u8] = b"HELLO";
    pub const OK: &[u8] = b"OK";
    pub const STEP_FAILED: &[u8] = b"STEP_FAILED";
    pub const ERROR: &[u8] = b"ERROR";
}

/// Payload of the SETUP event.
///
/// `stop_time` is `None` when the simulation has no predefined end
/// (`ETERNITY` does not survive a JSON round trip).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetupData {
    pub slave_id: SlaveId,
    pub slave_name: String,
    pub execution_name: String,
    pub start_time: TimePoint,
    #[serde(default)]
    pub stop_time: Option<TimePoint>,
    #[serde(default)]
    pub adaptive_step_size: bool,
    #[serde(default = "default_relative_tolerance")]
    pub relative_tolerance: f64,
    /// How long the slave waits for peer variable frames each step.
    #[serde(default)]
    pub variable_recv_timeout_ms: Option<u64>,
}

fn default_relative_tolerance() -> f64 {
    1.0
}

/// A remote output variable, identified the way data-bus frames identify it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVariable {
    pub slave: SlaveId,
    pub variable: u16,
}

/// Payload of the SET_VAR event: assign a value to a variable and/or couple
/// an input variable to a remote output.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetVarData {
    pub variable: VariableId,
    #[serde(default)]
    pub value: Option<ScalarValue>,
    #[serde(default)]
    pub connect_to: Option<RemoteVariable>,
}

/// Payload of the GET_VAR event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetVarData {
    pub variable: VariableId,
}

/// Payload of the SET_PEERS event: the publisher endpoints of all peers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetPeersData {
    pub peers: Vec<String>,
}

/// Payload of the STEP event.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct StepData {
    pub step_id: StepId,
    pub time: TimePoint,
    pub step_size: TimeDuration,
}

/// Encodes a control payload as JSON bytes.
pub fn encode<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

/// Decodes a control payload, mapping malformed input to a protocol error.
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::Protocol(format!("malformed payload: {e}")))
}

/// Size of the data-frame header.
pub const FRAME_HEADER_SIZE: usize = 4;

/// A data-frame header: the (slave, variable) pair a published value
/// belongs to.  Used both as message prefix and subscription filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameHeader {
    pub slave: SlaveId,
    pub variable: u16,
}

impl FrameHeader {
    pub fn to_bytes(self) -> [u8; FRAME_HEADER_SIZE] {
        let s = self.slave.to_le_bytes();
        let v = self.variable.to_le_bytes();
        [s[0], s[1], v[0], v[1]]
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(Error::Protocol("data frame shorter than header".into()));
        }
        Ok(Self {
            slave: u16::from_le_bytes([bytes[0], bytes[1]]),
            variable: u16::from_le_bytes([bytes[2], bytes[3]]),
        })
    }
}

impl From<RemoteVariable> for FrameHeader {
    fn from(r: RemoteVariable) -> Self {
        Self {
            slave: r.slave,
            variable: r.variable,
        }
    }
}

/// Encodes one published data frame: header followed by the value payload.
pub fn encode_data_frame(header: FrameHeader, value: &ScalarValue) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + 8);
    frame.extend_from_slice(&header.to_bytes());
    match value {
        ScalarValue::Real(v) => frame.extend_from_slice(&v.to_le_bytes()),
        ScalarValue::Integer(v) => frame.extend_from_slice(&v.to_le_bytes()),
        ScalarValue::Boolean(v) => frame.push(u8::from(*v)),
        ScalarValue::String(v) => frame.extend_from_slice(v.as_bytes()),
    }
    frame
}

/// Splits a received data frame into header and decoded value.  The value
/// type must be known from the subscription (the frame itself is untyped).
pub fn decode_data_frame(frame: &[u8], data_type: DataType) -> Result<(FrameHeader, ScalarValue)> {
    let header = FrameHeader::from_bytes(frame)?;
    let payload = &frame[FRAME_HEADER_SIZE..];
    let value = decode_value(payload, data_type)?;
    Ok((header, value))
}

fn decode_value(payload: &[u8], data_type: DataType) -> Result<ScalarValue> {
    match data_type {
        DataType::Real => {
            let bytes: [u8; 8] = payload
                .try_into()
                .map_err(|_| Error::Protocol("real payload must be 8 bytes".into()))?;
            Ok(ScalarValue::Real(f64::from_le_bytes(bytes)))
        }
        DataType::Integer => {
            let bytes: [u8; 4] = payload
                .try_into()
                .map_err(|_| Error::Protocol("integer payload must be 4 bytes".into()))?;
            Ok(ScalarValue::Integer(i32::from_le_bytes(bytes)))
        }
        DataType::Boolean => match payload {
            [0] => Ok(ScalarValue::Boolean(false)),
            [1] => Ok(ScalarValue::Boolean(true)),
            _ => Err(Error::Protocol("boolean payload must be one byte".into())),
        },
        DataType::String => {
            let s = std::str::from_utf8(payload)
                .map_err(|_| Error::Protocol("string payload is not valid UTF-8".into()))?;
            Ok(ScalarValue::String(s.to_string()))
        }
    }
}
