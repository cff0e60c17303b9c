//! Request/response framing on a control-channel byte stream.

use std::io;

use bytes::{Bytes, BytesMut};
use ipvs_common::frame::{
    REQUEST_HEADER_LEN, RESPONSE_HEADER_LEN, RequestHeader, ResponseHeader,
};
use ipvs_common::sockopt::MAX_REPLY_LEN;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

fn invalid_data(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

/// Read one request header. `Ok(None)` means the peer closed the stream
/// between requests.
pub async fn read_request_header<R>(reader: &mut R) -> io::Result<Option<RequestHeader>>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; REQUEST_HEADER_LEN];
    match reader.read_exact(&mut raw).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    RequestHeader::decode(&mut &raw[..])
        .map(Some)
        .map_err(invalid_data)
}

/// Read exactly `len` payload bytes.
pub async fn read_payload<R>(reader: &mut R, len: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

pub async fn write_response<W>(writer: &mut W, status: i32, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = ResponseHeader {
        status,
        payload_len: u32::try_from(payload.len()).map_err(invalid_data)?,
    };
    let mut buf = BytesMut::with_capacity(RESPONSE_HEADER_LEN + payload.len());
    header.encode(&mut buf);
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await
}

pub async fn write_request<W>(writer: &mut W, header: &RequestHeader, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(REQUEST_HEADER_LEN + payload.len());
    header.encode(&mut buf);
    buf.extend_from_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Read one response. Oversized payload lengths are rejected before
/// allocating.
pub async fn read_response<R>(reader: &mut R) -> io::Result<(i32, Bytes)>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; RESPONSE_HEADER_LEN];
    reader.read_exact(&mut raw).await?;
    let header = ResponseHeader::decode(&mut &raw[..]).map_err(invalid_data)?;
    let len = header.payload_len as usize;
    if len > MAX_REPLY_LEN {
        return Err(invalid_data(format!(
            "response payload of {len} bytes exceeds {MAX_REPLY_LEN}"
        )));
    }
    let payload = read_payload(reader, len).await?;
    Ok((header.status, Bytes::from(payload)))
}
