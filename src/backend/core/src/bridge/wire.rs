//! Frames exchanged between a [`super::WorkerService`] and a [`super::WorkerHost`].
//!
//! Each frame is one JSON document inside a length-delimited frame.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{ErrorCode, Result, TasklineError};

/// Largest accepted frame.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Request {
        id: u64,
        pattern: String,
        data: serde_json::Value,
    },
    Response {
        id: u64,
        outcome: Outcome,
    },
}

/// Result of one request as seen on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Ok { value: serde_json::Value },
    Err { code: ErrorCode, message: String },
}

impl Outcome {
    pub fn failure(error: &TasklineError) -> Self {
        Self::Err {
            code: error.code(),
            message: error.user_message().to_string(),
        }
    }

    pub fn into_result(self) -> Result<serde_json::Value> {
        match self {
            Self::Ok { value } => Ok(value),
            Self::Err { code, message } => Err(TasklineError::new(code, message)),
        }
    }
}

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub fn framed<T: AsyncRead + AsyncWrite>(io: T) -> Framed<T, LengthDelimitedCodec> {
    Framed::new(io, codec())
}

pub fn encode(frame: &Frame) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(frame)?))
}

pub fn decode(bytes: &[u8]) -> Result<Frame> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let frame = Frame::Response {
            id: 7,
            outcome: Outcome::Err {
                code: ErrorCode::WorkerPatternNotRegistered,
                message: "nope".into(),
            },
        };
        let json: serde_json::Value = serde_json::from_slice(&encode(&frame).unwrap()).unwrap();
        assert_eq!(json["type"], "response");
        assert_eq!(json["outcome"]["status"], "err");
        assert_eq!(json["outcome"]["code"], "WORKER_PATTERN_NOT_REGISTERED");
        assert_eq!(decode(&encode(&frame).unwrap()).unwrap(), frame);
    }

    #[test]
    fn test_error_outcome_keeps_code() {
        let err = Outcome::Err {
            code: ErrorCode::WorkerHandlerFailed,
            message: "boom".into(),
        }
        .into_result()
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::WorkerHandlerFailed);
        assert_eq!(err.user_message(), "boom");
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(decode(b"{not json").is_err());
    }
}
