//! Unary gRPC framing.
//!
//! A message travels as one length-prefixed frame: a compression flag
//! byte, a big-endian `u32` length, then the prost encoding. Only
//! uncompressed frames are accepted. A successful answer is one data frame
//! followed by `grpc-status: 0` trailers; a failure is a trailers-only
//! response built from the `Status`.

use bytes::{BufMut, Bytes, BytesMut};
use http_body::{Body, Frame};
use http_body_util::BodyExt;
use prost::Message;
use std::pin::Pin;
use std::task::{Context, Poll};
use tonic::body::BoxBody;
use tonic::codegen::http::{header, HeaderMap, HeaderValue, Response, StatusCode};
use tonic::codegen::StdError;
use tonic::Status;

/// Flag byte plus `u32` length.
const PREFIX_LEN: usize = 5;

struct Prefix {
    compressed: bool,
    len: usize,
}

impl Prefix {
    fn parse(buf: &[u8]) -> Option<Self> {
        let head = buf.get(..PREFIX_LEN)?;
        Some(Self {
            compressed: head[0] != 0,
            len: u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize,
        })
    }

    fn frame_len(&self) -> usize {
        PREFIX_LEN + self.len
    }
}

/// Buffer a request body until one whole frame is present and decode it.
pub(crate) async fn read_unary<M, B>(body: B) -> Result<M, Status>
where
    M: Message + Default,
    B: Body,
    B::Data: Into<Bytes>,
    B::Error: Into<StdError>,
{
    let mut buf = BytesMut::new();
    let mut body = std::pin::pin!(body);

    while let Some(frame) = body.as_mut().frame().await {
        let frame = frame.map_err(|e| {
            let err: StdError = e.into();
            tracing::warn!(error = %err, "request body failed");
            Status::internal("failed to read request body")
        })?;
        // Anything but data is the trailers: the body is over.
        let Ok(chunk) = frame.into_data() else {
            break;
        };
        let chunk: Bytes = chunk.into();
        buf.extend_from_slice(&chunk);
        if Prefix::parse(&buf).is_some_and(|prefix| buf.len() >= prefix.frame_len()) {
            break;
        }
    }

    decode(&buf)
}

#[allow(clippy::result_large_err)]
pub(crate) fn decode<M: Message + Default>(buf: &[u8]) -> Result<M, Status> {
    let prefix =
        Prefix::parse(buf).ok_or_else(|| Status::invalid_argument("gRPC message too short"))?;
    if prefix.compressed {
        return Err(Status::unimplemented("compressed gRPC messages are not supported"));
    }
    let payload = buf.get(PREFIX_LEN..prefix.frame_len()).ok_or_else(|| {
        Status::invalid_argument(format!(
            "gRPC message truncated: expected {} bytes, got {}",
            prefix.len,
            buf.len() - PREFIX_LEN
        ))
    })?;
    M::decode(payload).map_err(|e| Status::invalid_argument(format!("decode error: {}", e)))
}

pub(crate) fn encode<M: Message>(message: &M) -> Bytes {
    let len = message.encoded_len();
    let mut buf = BytesMut::with_capacity(PREFIX_LEN + len);
    buf.put_u8(0);
    buf.put_u32(len as u32);
    // BytesMut grows on demand, so encoding cannot run out of room.
    let _ = message.encode(&mut buf);
    buf.freeze()
}

/// `200 OK` carrying `message`, then `grpc-status: 0`.
pub(crate) fn message_response<M: Message>(message: &M) -> Response<BoxBody> {
    let body = UnaryBody {
        frame: Some(encode(message)),
        trailers_sent: false,
    };
    let mut response = Response::new(BoxBody::new(body));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/grpc"),
    );
    response
}

/// Trailers-only response for a failed call.
pub(crate) fn status_response(status: Status) -> Response<BoxBody> {
    status.into_http()
}

struct UnaryBody {
    frame: Option<Bytes>,
    trailers_sent: bool,
}

impl Body for UnaryBody {
    type Data = Bytes;
    type Error = Status;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Status>>> {
        if let Some(data) = self.frame.take() {
            return Poll::Ready(Some(Ok(Frame::data(data))));
        }
        if self.trailers_sent {
            return Poll::Ready(None);
        }
        self.trailers_sent = true;
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", HeaderValue::from_static("0"));
        Poll::Ready(Some(Ok(Frame::trailers(trailers))))
    }

    fn is_end_stream(&self) -> bool {
        self.frame.is_none() && self.trailers_sent
    }
}
