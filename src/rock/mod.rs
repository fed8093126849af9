//! Rock RPC: a length-prefixed binary envelope used for gateway-to-backend calls.
//!
//! Framing is grounded on `flux-network`'s `tcp::stream` module in the example
//! pack, which reads a fixed header (magic + length) before the variable-length
//! payload rather than delimiter-scanning a stream; the body codec reuses
//! [`crate::buffer::ByteBuf`]'s varint/length-prefixed-string primitives instead of
//! inventing a second one. Command dispatch and JSON bodies mirror the donor's
//! presence module (`crate::presence`), which is itself Rock RPC's first consumer.

use serde::{de::DeserializeOwned, Serialize};

use crate::{
    buffer::ByteBuf,
    errors::Error,
    stream::SocketStream,
};

const MAGIC: u16 = 0xABCD;
const VERSION: u8 = 0x01;
const HEADER_LEN: usize = 8;
const MAX_BODY_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Request,
    Response,
    Notify,
}

impl FrameType {
    fn from_u8(byte: u8) -> Result<Self, Error> {
        Ok(match byte {
            0 => FrameType::Request,
            1 => FrameType::Response,
            2 => FrameType::Notify,
            other => return Err(Error::Protocol(format!("unknown rock frame type {other}"))),
        })
    }

    fn as_u8(self) -> u8 {
        match self {
            FrameType::Request => 0,
            FrameType::Response => 1,
            FrameType::Notify => 2,
        }
    }
}

/// A decoded Rock envelope: an 8-byte header (magic, version, type, big-endian
/// length) followed by `length` bytes of body.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub frame_type: FrameType,
    pub body: Vec<u8>,
}

/// Reads one envelope off `stream`, validating the magic/version/length bounds.
pub async fn read_envelope(stream: &mut SocketStream) -> Result<Envelope, Error> {
    let mut header = [0u8; HEADER_LEN];
    stream.read_fix_size(&mut header).await?;

    let magic = u16::from_be_bytes([header[0], header[1]]);
    if magic != MAGIC {
        return Err(Error::Protocol(format!("bad rock magic {magic:#06x}")));
    }
    let version = header[2];
    if version != VERSION {
        return Err(Error::Protocol(format!("unsupported rock version {version}")));
    }
    let frame_type = FrameType::from_u8(header[3])?;
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_BODY_LEN {
        return Err(Error::Resource(format!("rock body length {len} exceeds {MAX_BODY_LEN}")));
    }

    let mut body = vec![0u8; len as usize];
    if !body.is_empty() {
        stream.read_fix_size(&mut body).await?;
    }
    Ok(Envelope { frame_type, body })
}

/// Writes one envelope to `stream`.
pub async fn write_envelope(stream: &mut SocketStream, frame_type: FrameType, body: &[u8]) -> Result<(), Error> {
    if body.len() > MAX_BODY_LEN as usize {
        return Err(Error::Resource(format!(
            "rock body length {} exceeds {MAX_BODY_LEN}",
            body.len()
        )));
    }
    let mut header = [0u8; HEADER_LEN];
    header[0..2].copy_from_slice(&MAGIC.to_be_bytes());
    header[2] = VERSION;
    header[3] = frame_type.as_u8();
    header[4..8].copy_from_slice(&(body.len() as u32).to_be_bytes());
    stream.write_fix_size(&header).await?;
    if !body.is_empty() {
        stream.write_fix_size(body).await?;
    }
    Ok(())
}

/// A Rock RPC request body: a sequence number for correlating the eventual
/// response, a command code dispatching to a handler, a trace id for
/// cross-service log correlation, and a JSON-encoded payload.
#[derive(Debug, Clone)]
pub struct RequestMessage {
    pub sn: u32,
    pub cmd: u32,
    pub trace_id: String,
    pub payload: Vec<u8>,
}

/// A Rock RPC response body: the sequence number it answers, a result code
/// (`200` success, non-2xx failure, mirroring `PresenceResult::code`), a
/// human-readable result string (`"ok"`, `"unhandled"`, ...), the trace id
/// carried over from the request, and a JSON-encoded result payload.
#[derive(Debug, Clone)]
pub struct ResponseMessage {
    pub sn: u32,
    pub result: u32,
    pub result_str: String,
    pub trace_id: String,
    pub payload: Vec<u8>,
}

impl RequestMessage {
    /// Encodes `sn` (u32), `cmd` (u32), a varint-length-prefixed `trace_id`, then a
    /// varint-length-prefixed JSON payload, using the C1 buffer's codecs directly.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = ByteBuf::new();
        buf.write_u32(self.sn);
        buf.write_u32(self.cmd);
        buf.write_string_vint(&self.trace_id);
        buf.write_varint_u64(self.payload.len() as u64);
        buf.write(&self.payload);
        buf.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut buf = ByteBuf::new();
        buf.write(bytes);
        let sn = buf.read_u32().map_err(Error::Buffer)?;
        let cmd = buf.read_u32().map_err(Error::Buffer)?;
        let trace_id = buf.read_string_vint().map_err(Error::Buffer)?;
        let len = buf.read_varint_u64().map_err(Error::Buffer)? as usize;
        let mut payload = vec![0u8; len];
        if buf.read(&mut payload) != len {
            return Err(Error::Protocol("truncated rock request payload".to_string()));
        }
        Ok(Self { sn, cmd, trace_id, payload })
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.payload).map_err(|e| Error::Protocol(format!("malformed rock payload: {e}")))
    }

    pub fn with_json_payload<T: Serialize>(sn: u32, cmd: u32, payload: &T) -> Result<Self, Error> {
        let payload = serde_json::to_vec(payload).map_err(|e| Error::Protocol(e.to_string()))?;
        Ok(Self {
            sn,
            cmd,
            trace_id: String::new(),
            payload,
        })
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }
}

impl ResponseMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = ByteBuf::new();
        buf.write_u32(self.sn);
        buf.write_u32(self.result);
        buf.write_string_vint(&self.result_str);
        buf.write_string_vint(&self.trace_id);
        buf.write_varint_u64(self.payload.len() as u64);
        buf.write(&self.payload);
        buf.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut buf = ByteBuf::new();
        buf.write(bytes);
        let sn = buf.read_u32().map_err(Error::Buffer)?;
        let result = buf.read_u32().map_err(Error::Buffer)?;
        let result_str = buf.read_string_vint().map_err(Error::Buffer)?;
        let trace_id = buf.read_string_vint().map_err(Error::Buffer)?;
        let len = buf.read_varint_u64().map_err(Error::Buffer)? as usize;
        let mut payload = vec![0u8; len];
        if buf.read(&mut payload) != len {
            return Err(Error::Protocol("truncated rock response payload".to_string()));
        }
        Ok(Self {
            sn,
            result,
            result_str,
            trace_id,
            payload,
        })
    }

    pub fn with_json_payload<T: Serialize>(sn: u32, result: u32, payload: &T) -> Result<Self, Error> {
        let payload = serde_json::to_vec(payload).map_err(|e| Error::Protocol(e.to_string()))?;
        Ok(Self {
            sn,
            result,
            result_str: String::new(),
            trace_id: String::new(),
            payload,
        })
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// The canned response for a command with no registered handler: `result=500`,
    /// `result_str="unhandled"`, matching the donor's fallback for an unrecognized
    /// presence command.
    pub fn unhandled(sn: u32) -> Self {
        Self {
            sn,
            result: 500,
            result_str: "unhandled".to_string(),
            trace_id: String::new(),
            payload: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let req = RequestMessage::with_json_payload(7, 201, &serde_json::json!({"uid": 42})).unwrap();
        let encoded = req.encode();
        let decoded = RequestMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.sn, 7);
        assert_eq!(decoded.cmd, 201);
        let value: serde_json::Value = decoded.payload_as().unwrap();
        assert_eq!(value["uid"], 42);
    }

    #[test]
    fn response_round_trips() {
        let resp = ResponseMessage::with_json_payload(7, 200, &serde_json::json!({"ok": true})).unwrap();
        let encoded = resp.encode();
        let decoded = ResponseMessage::decode(&encoded).unwrap();
        assert_eq!(decoded.sn, 7);
        assert_eq!(decoded.result, 200);
    }

    #[tokio::test]
    async fn envelope_round_trips_over_a_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let mut server = SocketStream::from_connected(server).unwrap();
        let mut client = SocketStream::from_connected(client).unwrap();

        let req = RequestMessage::with_json_payload(1, 201, &serde_json::json!({"uid": 1})).unwrap();
        write_envelope(&mut client, FrameType::Request, &req.encode()).await.unwrap();

        let envelope = read_envelope(&mut server).await.unwrap();
        assert_eq!(envelope.frame_type, FrameType::Request);
        let decoded = RequestMessage::decode(&envelope.body).unwrap();
        assert_eq!(decoded.cmd, 201);
    }

    #[test]
    fn unhandled_response_is_500() {
        let resp = ResponseMessage::unhandled(9);
        assert_eq!(resp.result, 500);
        assert_eq!(resp.sn, 9);
        assert_eq!(resp.result_str, "unhandled");
    }

    #[test]
    fn trace_id_round_trips_through_encode_decode() {
        let req = RequestMessage::with_json_payload(3, 201, &serde_json::json!({}))
            .unwrap()
            .with_trace_id("trace-abc");
        let decoded = RequestMessage::decode(&req.encode()).unwrap();
        assert_eq!(decoded.trace_id, "trace-abc");

        let resp = ResponseMessage::with_json_payload(3, 200, &serde_json::json!({}))
            .unwrap()
            .with_trace_id("trace-abc");
        let decoded = ResponseMessage::decode(&resp.encode()).unwrap();
        assert_eq!(decoded.trace_id, "trace-abc");
        assert_eq!(decoded.result_str, "");
    }

    #[tokio::test]
    async fn client_request_correlates_with_server_response_by_sn() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client_sock = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server_sock, _) = listener.accept().await.unwrap();
        let mut client = SocketStream::from_connected(client_sock).unwrap();
        let mut server = SocketStream::from_connected(server_sock).unwrap();

        let server_task = tokio::spawn(async move {
            let envelope = read_envelope(&mut server).await.unwrap();
            assert_eq!(envelope.frame_type, FrameType::Request);
            let req = RequestMessage::decode(&envelope.body).unwrap();
            assert_eq!(req.sn, 42);
            assert_eq!(req.cmd, 501);
            let uid: serde_json::Value = req.payload_as().unwrap();
            assert_eq!(uid["uid"], 7);

            let resp = ResponseMessage::with_json_payload(req.sn, 200, &serde_json::json!({"ok": true})).unwrap();
            write_envelope(&mut server, FrameType::Response, &resp.encode()).await.unwrap();
        });

        let req = RequestMessage::with_json_payload(42, 501, &serde_json::json!({"uid": 7})).unwrap();
        write_envelope(&mut client, FrameType::Request, &req.encode()).await.unwrap();

        let envelope = read_envelope(&mut client).await.unwrap();
        assert_eq!(envelope.frame_type, FrameType::Response);
        let resp = ResponseMessage::decode(&envelope.body).unwrap();
        assert_eq!(resp.sn, 42);
        assert_eq!(resp.result, 200);

        server_task.await.unwrap();
    }
}
