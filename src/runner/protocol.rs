//! Wire format between the loader and runner processes.
//!
//! Each frame is a big-endian `u64` payload length followed by a bincode
//! payload. Lengths above the configured limit are rejected before any
//! allocation. Requests carry an id that the response echoes, so calls
//! can be pipelined.

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::{Device, RunnerOpts, TensorMap};

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Oldest protocol version a runner may answer with.
pub const MIN_PROTOCOL_VERSION: u32 = 1;

pub fn is_supported_version(version: u32) -> bool {
    (MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version)
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: usize },

    #[error("Connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Identifies a sealed batch held by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SealHandleId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub data: RequestData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    pub data: ResponseData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestData {
    Handshake {
        protocol_version: u32,
        runner_opts: Option<RunnerOpts>,
        visible_device: Device,
    },
    Load {
        model_dir: PathBuf,
        runner_name: String,
        required_framework_version: String,
        runner_compat_version: u64,
        /// sha256 of the archive's MANIFEST, if it has one.
        manifest_sha256: Option<String>,
    },
    Seal {
        tensors: TensorMap,
    },
    InferWithTensors {
        tensors: TensorMap,
    },
    InferWithHandle {
        handle: SealHandleId,
    },
    /// A sealed batch was dropped without being consumed.
    Discard {
        handle: SealHandleId,
    },
    Unload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseData {
    HandshakeAck {
        protocol_version: u32,
        runner_name: String,
        framework_version: String,
        runner_compat_version: u64,
    },
    Loaded,
    Sealed {
        handle: SealHandleId,
    },
    Infer {
        tensors: TensorMap,
    },
    Discarded,
    Unloaded,
    Error {
        e: String,
    },
}

impl ResponseData {
    pub fn kind(&self) -> &'static str {
        match self {
            ResponseData::HandshakeAck { .. } => "HandshakeAck",
            ResponseData::Loaded => "Loaded",
            ResponseData::Sealed { .. } => "Sealed",
            ResponseData::Infer { .. } => "Infer",
            ResponseData::Discarded => "Discarded",
            ResponseData::Unloaded => "Unloaded",
            ResponseData::Error { .. } => "Error",
        }
    }
}

/// Encode a frame: length prefix plus bincode payload.
pub fn encode_frame<T: Serialize>(message: &T, max: usize) -> Result<Vec<u8>, ProtocolError> {
    let payload =
        bincode::serialize(message).map_err(|e| ProtocolError::InvalidFormat(e.to_string()))?;
    if payload.len() > max {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len() as u64,
            max,
        });
    }
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode a frame payload (without the length prefix).
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8], max: usize) -> Result<T, ProtocolError> {
    if bytes.len() > max {
        return Err(ProtocolError::FrameTooLarge {
            size: bytes.len() as u64,
            max,
        });
    }
    bincode::deserialize(bytes).map_err(|e| ProtocolError::InvalidFormat(e.to_string()))
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T, max: usize) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(message, max)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` on a clean EOF between frames.
pub async fn read_frame<R, T>(reader: &mut R, max: usize) -> Result<Option<T>, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 8];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u64::from_be_bytes(len_buf);
    if len > max as u64 {
        return Err(ProtocolError::FrameTooLarge { size: len, max });
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    decode_payload(&payload, max).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RunnerOpt, Tensor};
    use std::collections::BTreeMap;

    const MAX: usize = 1024 * 1024;

    #[test]
    fn test_version_support() {
        assert!(is_supported_version(PROTOCOL_VERSION));
        assert!(!is_supported_version(0));
        assert!(!is_supported_version(PROTOCOL_VERSION + 1));
    }

    #[test]
    fn test_frame_has_length_prefix() {
        let msg = RpcRequest {
            id: 7,
            data: RequestData::Unload,
        };
        let frame = encode_frame(&msg, MAX).unwrap();
        let len = u64::from_be_bytes(frame[..8].try_into().unwrap());
        assert_eq!(len as usize, frame.len() - 8);
        let back: RpcRequest = decode_payload(&frame[8..], MAX).unwrap();
        assert_eq!(back.id, 7);
        assert!(matches!(back.data, RequestData::Unload));
    }

    #[test]
    fn test_handshake_carries_opts_and_device() {
        let msg = RpcRequest {
            id: 1,
            data: RequestData::Handshake {
                protocol_version: PROTOCOL_VERSION,
                runner_opts: Some(BTreeMap::from([(
                    "threads".to_string(),
                    RunnerOpt::Integer(2),
                )])),
                visible_device: Device::Gpu(1),
            },
        };
        let frame = encode_frame(&msg, MAX).unwrap();
        let back: RpcRequest = decode_payload(&frame[8..], MAX).unwrap();
        match back.data {
            RequestData::Handshake {
                runner_opts,
                visible_device,
                ..
            } => {
                assert_eq!(visible_device, Device::Gpu(1));
                assert_eq!(runner_opts.unwrap()["threads"], RunnerOpt::Integer(2));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_oversized_frame_rejected_on_encode() {
        let msg = RpcRequest {
            id: 1,
            data: RequestData::InferWithTensors {
                tensors: BTreeMap::from([("x".to_string(), Tensor::bytes(vec![0u8; 2048]))]),
            },
        };
        assert!(matches!(
            encode_frame(&msg, 1024),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_garbage_payload_is_an_error() {
        let result: Result<RpcResponse, _> = decode_payload(&[0xff; 5], MAX);
        assert!(matches!(result, Err(ProtocolError::InvalidFormat(_))));
    }

    #[tokio::test]
    async fn test_read_frame_eof_and_limit() {
        let mut empty: &[u8] = &[];
        let none: Option<RpcResponse> = read_frame(&mut empty, MAX).await.unwrap();
        assert!(none.is_none());

        let mut huge: &[u8] = &u64::MAX.to_be_bytes();
        let err = read_frame::<_, RpcResponse>(&mut huge, MAX).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_read_frame_across_short_reads() {
        let msg = RpcResponse {
            id: 4,
            data: ResponseData::Loaded,
        };
        let frame = encode_frame(&msg, MAX).unwrap();
        let mut reader = tokio_test::io::Builder::new()
            .read(&frame[..3])
            .read(&frame[3..9])
            .read(&frame[9..])
            .build();
        let back: RpcResponse = read_frame(&mut reader, MAX).await.unwrap().unwrap();
        assert_eq!(back.id, 4);
        let eof: Option<RpcResponse> = read_frame(&mut reader, MAX).await.unwrap();
        assert!(eof.is_none());

        // A frame cut off mid-payload is an error, not a clean EOF.
        let mut truncated = tokio_test::io::Builder::new()
            .read(&frame[..frame.len() - 1])
            .build();
        assert!(read_frame::<_, RpcResponse>(&mut truncated, MAX).await.is_err());
    }

    #[tokio::test]
    async fn test_write_then_read_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let msg = RpcResponse {
            id: 3,
            data: ResponseData::Sealed {
                handle: SealHandleId(9),
            },
        };
        write_frame(&mut a, &msg, MAX).await.unwrap();
        let back: RpcResponse = read_frame(&mut b, MAX).await.unwrap().unwrap();
        assert_eq!(back.id, 3);
        assert!(matches!(
            back.data,
            ResponseData::Sealed {
                handle: SealHandleId(9)
            }
        ));
    }
}
