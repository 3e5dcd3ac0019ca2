//! Wire framing: decoding frontend messages and encoding backend messages
//! per "[Frontend/Backend Protocol: Message Formats][1]" in the PostgreSQL
//! reference.
//!
//! Startup negotiation (the length-prefixed, tag-less messages exchanged
//! before the regular tag+length+payload framing begins) is decoded by
//! [`decode_startup`] directly off the raw stream; everything after that
//! goes through [`Codec`], a `tokio_util::codec::Decoder`/`Encoder` pair
//! plugged into a `tokio_util::codec::Framed`.
//!
//! [1]: https://www.postgresql.org/docs/11/protocol-message-formats.html

use crate::message::{
    BackendMessage, ErrorResponse, FieldDescription, FrontendMessage, FrontendStartupMessage,
    VERSION_CANCEL, VERSION_GSSENC, VERSION_SSL,
};
use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use common::error::{PgError, Result};
use futures::sink::{Buffer, SinkExt};
use futures::TryStreamExt;
use pgrepr::{Format, Type, Value};
use std::collections::HashMap;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::{Decoder, Encoder, Framed};

/// The byte written back to a client that asked for `SSLRequest`: "no, this
/// server doesn't support SSL".
pub const REJECT_ENCRYPTION: u8 = b'N';

/// Reads one startup-phase message directly off `conn`: a 4-byte length
/// followed by a 4-byte code, then the rest of the frame.
///
/// This precedes ordinary message framing entirely, so it does not go
/// through [`Codec`].
pub async fn decode_startup<A>(mut conn: A) -> Result<Option<FrontendStartupMessage>>
where
    A: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match conn.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(PgError::from(e)),
    }
    let frame_len = parse_frame_len(&len_bytes)
        .map_err(|e| PgError::protocol(e.to_string()))?;

    let mut buf = BytesMut::with_capacity(frame_len);
    buf.resize(frame_len, 0);
    conn.read_exact(&mut buf).await?;

    let mut cur = pgrepr::buf::Cursor::new(&buf);
    let version = cur.read_i32()?;
    let message = match version {
        VERSION_CANCEL => FrontendStartupMessage::CancelRequest {
            conn_id: cur.read_u32()?,
            secret_key: cur.read_u32()?,
        },
        VERSION_SSL => FrontendStartupMessage::SslRequest,
        VERSION_GSSENC => FrontendStartupMessage::GssEncRequest,
        version => {
            let mut params = HashMap::new();
            while !cur.is_empty() && cur.remaining()[0] != 0 {
                let name = cur.read_cstr()?.to_string();
                let value = cur.read_cstr()?.to_string();
                params.insert(name, value);
            }
            FrontendStartupMessage::Startup { version, params }
        }
    };
    Ok(Some(message))
}

/// A connection that frames raw bytes into [`FrontendMessage`]s and
/// [`BackendMessage`]s, buffering writes until [`FramedConn::flush`] is
/// called.
pub struct FramedConn<A> {
    inner: Buffer<Framed<A, Codec>, BackendMessage>,
}

impl<A> FramedConn<A>
where
    A: AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    pub fn new(inner: A) -> FramedConn<A> {
        FramedConn {
            inner: Framed::new(inner, Codec::default()).buffer(32),
        }
    }

    /// Reads and decodes one frontend message. Returns `None` if the client
    /// closed the connection.
    pub async fn recv(&mut self) -> Result<Option<FrontendMessage>> {
        Ok(self.inner.try_next().await?)
    }

    /// Encodes and queues one backend message. Does not flush; call
    /// [`FramedConn::flush`] once a whole response is queued.
    pub async fn send<M>(&mut self, message: M) -> Result<()>
    where
        M: Into<BackendMessage>,
    {
        Ok(self.inner.send(message.into()).await?)
    }

    pub async fn send_all(&mut self, messages: impl IntoIterator<Item = BackendMessage>) -> Result<()> {
        for m in messages {
            self.send(m).await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await?;
        Ok(())
    }
}

fn parse_frame_len(src: &[u8]) -> std::result::Result<usize, io::Error> {
    let n = BigEndian::read_u32(src) as usize;
    if n < 4 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid frame length"));
    }
    Ok(n - 4)
}

struct Codec {
    decode_state: DecodeState,
}

enum DecodeState {
    Head,
    Data(u8, usize),
}

impl Default for Codec {
    fn default() -> Self {
        Codec {
            decode_state: DecodeState::Head,
        }
    }
}

impl Decoder for Codec {
    type Item = FrontendMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.decode_state {
                DecodeState::Head => {
                    if src.len() < 5 {
                        return Ok(None);
                    }
                    let msg_type = src[0];
                    let frame_len = parse_frame_len(&src[1..5])?;
                    src.advance(5);
                    src.reserve(frame_len);
                    self.decode_state = DecodeState::Data(msg_type, frame_len);
                }
                DecodeState::Data(msg_type, frame_len) => {
                    if src.len() < frame_len {
                        return Ok(None);
                    }
                    let payload = src.split_to(frame_len);
                    let msg = decode_message(msg_type, &payload)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                    self.decode_state = DecodeState::Head;
                    return Ok(Some(msg));
                }
            }
        }
    }
}

/// Dispatches on the one-byte message tag.
fn decode_message(tag: u8, payload: &[u8]) -> Result<FrontendMessage> {
    let mut cur = pgrepr::buf::Cursor::new(payload);
    Ok(match tag {
        b'Q' => FrontendMessage::Query {
            sql: cur.read_cstr()?.to_string(),
        },
        b'P' => decode_parse(&mut cur)?,
        b'B' => decode_bind(&mut cur)?,
        b'D' => match cur.read_u8()? {
            b'S' => FrontendMessage::DescribeStatement {
                name: cur.read_cstr()?.to_string(),
            },
            b'P' => FrontendMessage::DescribePortal {
                name: cur.read_cstr()?.to_string(),
            },
            other => {
                return Err(PgError::protocol(format!(
                    "invalid Describe target {:?}",
                    other as char
                )))
            }
        },
        b'E' => FrontendMessage::Execute {
            portal: cur.read_cstr()?.to_string(),
            max_rows: cur.read_i32()?,
        },
        b'C' => match cur.read_u8()? {
            b'S' => FrontendMessage::CloseStatement {
                name: cur.read_cstr()?.to_string(),
            },
            b'P' => FrontendMessage::ClosePortal {
                name: cur.read_cstr()?.to_string(),
            },
            other => {
                return Err(PgError::protocol(format!(
                    "invalid Close target {:?}",
                    other as char
                )))
            }
        },
        b'H' => FrontendMessage::Flush,
        b'S' => FrontendMessage::Sync,
        b'X' => FrontendMessage::Terminate,
        b'p' => FrontendMessage::PasswordMessage {
            password: cur.read_cstr()?.to_string(),
        },
        other => {
            return Err(PgError::protocol(format!(
                "unknown message tag {:?}",
                other as char
            )))
        }
    })
}

fn decode_parse(cur: &mut pgrepr::buf::Cursor) -> Result<FrontendMessage> {
    let name = cur.read_cstr()?.to_string();
    let sql = cur.read_cstr()?.to_string();
    let n = cur.read_i16()?;
    let mut param_oids = Vec::with_capacity(n.max(0) as usize);
    for _ in 0..n {
        param_oids.push(cur.read_i32()?);
    }
    Ok(FrontendMessage::Parse {
        name,
        sql,
        param_oids,
    })
}

fn decode_bind(cur: &mut pgrepr::buf::Cursor) -> Result<FrontendMessage> {
    let portal = cur.read_cstr()?.to_string();
    let statement = cur.read_cstr()?.to_string();

    let nf = cur.read_i16()?;
    let mut param_formats = Vec::with_capacity(nf.max(0) as usize);
    for _ in 0..nf {
        param_formats.push(Format::from(cur.read_i16()?));
    }

    let np = cur.read_i16()?;
    let mut params = Vec::with_capacity(np.max(0) as usize);
    for _ in 0..np {
        let len = cur.read_i32()?;
        if len < 0 {
            params.push(None);
        } else {
            params.push(Some(cur.read_bytes(len as usize)?.to_vec()));
        }
    }

    let nr = cur.read_i16()?;
    let mut result_formats = Vec::with_capacity(nr.max(0) as usize);
    for _ in 0..nr {
        result_formats.push(Format::from(cur.read_i16()?));
    }

    Ok(FrontendMessage::Bind {
        portal,
        statement,
        param_formats,
        params,
        result_formats,
    })
}

/// Decodes one raw Bind parameter: text parameters are UTF-8, with a
/// `{...}`-shaped value split into an array; binary parameters are decoded
/// per the statement's declared OID, not blindly as a big-endian integer.
///
/// `format` is already broadcast/defaulted by the caller (`NF < NP`
/// broadcasts `format[0]`, or defaults to text).
pub fn decode_param(raw: Option<&[u8]>, format: Format, oid: Option<i32>) -> Result<Value> {
    let Some(bytes) = raw else {
        return Ok(Value::Null);
    };
    let ty = oid.and_then(Type::from_oid).unwrap_or(Type::Unknown);
    match format {
        Format::Text => ty.decode_text(bytes),
        Format::Binary => ty.decode_binary(bytes),
    }
}

impl Encoder<BackendMessage> for Codec {
    type Error = io::Error;

    fn encode(&mut self, msg: BackendMessage, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        let tag = tag_for(&msg);
        dst.put_u8(tag);
        let base = dst.len();
        dst.put_u32(0);
        encode_body(msg, dst);
        let len = (dst.len() - base) as i32;
        dst[base..base + 4].copy_from_slice(&len.to_be_bytes());
        Ok(())
    }
}

fn tag_for(msg: &BackendMessage) -> u8 {
    match msg {
        BackendMessage::AuthenticationOk | BackendMessage::AuthenticationMd5Password { .. } => b'R',
        BackendMessage::ParameterStatus { .. } => b'S',
        BackendMessage::BackendKeyData { .. } => b'K',
        BackendMessage::ReadyForQuery(_) => b'Z',
        BackendMessage::RowDescription(_) => b'T',
        BackendMessage::DataRow(_) => b'D',
        BackendMessage::CommandComplete { .. } => b'C',
        BackendMessage::EmptyQueryResponse => b'I',
        BackendMessage::ErrorResponse(_) => b'E',
        BackendMessage::NoticeResponse(_) => b'N',
        BackendMessage::ParseComplete => b'1',
        BackendMessage::BindComplete => b'2',
        BackendMessage::CloseComplete => b'3',
        BackendMessage::NoData => b'n',
        BackendMessage::PortalSuspended => b's',
    }
}

fn encode_body(msg: BackendMessage, dst: &mut BytesMut) {
    use pgrepr::buf::PgBufMut;
    match msg {
        BackendMessage::AuthenticationOk => dst.put_i32(0),
        BackendMessage::AuthenticationMd5Password { salt } => {
            dst.put_i32(5);
            dst.put_slice(&salt);
        }
        BackendMessage::ParameterStatus { name, value } => {
            dst.put_cstr(&name);
            dst.put_cstr(&value);
        }
        BackendMessage::BackendKeyData { conn_id, secret_key } => {
            dst.put_i32(conn_id as i32);
            dst.put_i32(secret_key as i32);
        }
        BackendMessage::ReadyForQuery(status) => dst.put_u8(status as u8),
        BackendMessage::RowDescription(fields) => {
            dst.put_i16(fields.len() as i16);
            for f in fields {
                dst.put_cstr(&f.name);
                dst.put_i32(0); // table_oid: none of these columns belong to a real catalog relation.
                dst.put_i16(0); // attribute number, same reason.
                dst.put_i32(f.type_oid);
                dst.put_i16(f.type_len);
                dst.put_i32(0); // type modifier: unused by every type in this table.
                dst.put_i16(i16::from(f.format));
            }
        }
        BackendMessage::DataRow(values) => {
            dst.put_i16(values.len() as i16);
            for v in values {
                dst.put_field(v.as_deref());
            }
        }
        BackendMessage::CommandComplete { tag } => dst.put_cstr(&tag),
        BackendMessage::EmptyQueryResponse => {}
        BackendMessage::ErrorResponse(err) | BackendMessage::NoticeResponse(err) => {
            encode_error_fields(&err, dst);
        }
        BackendMessage::ParseComplete
        | BackendMessage::BindComplete
        | BackendMessage::CloseComplete
        | BackendMessage::NoData
        | BackendMessage::PortalSuspended => {}
    }
}

fn encode_error_fields(err: &ErrorResponse, dst: &mut BytesMut) {
    use pgrepr::buf::PgBufMut;
    dst.put_u8(b'S');
    dst.put_cstr(err.severity.as_str());
    dst.put_u8(b'C');
    dst.put_cstr(err.code.code());
    dst.put_u8(b'M');
    dst.put_cstr(&err.message);
    if let Some(detail) = &err.detail {
        dst.put_u8(b'D');
        dst.put_cstr(detail);
    }
    if let Some(hint) = &err.hint {
        dst.put_u8(b'H');
        dst.put_cstr(hint);
    }
    if let Some(position) = &err.position {
        dst.put_u8(b'P');
        dst.put_cstr(&position.to_string());
    }
    dst.put_u8(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Severity, SqlState};

    #[test]
    fn encodes_ready_for_query() {
        let mut codec = Codec::default();
        let mut dst = BytesMut::new();
        codec
            .encode(BackendMessage::ReadyForQuery('I'), &mut dst)
            .unwrap();
        assert_eq!(dst[0], b'Z');
        assert_eq!(BigEndian::read_i32(&dst[1..5]), 5);
        assert_eq!(dst[5], b'I');
    }

    #[test]
    fn decodes_a_simple_query() {
        let mut payload = BytesMut::new();
        payload.put_slice(b"SELECT 1\0");
        let msg = decode_message(b'Q', &payload).unwrap();
        assert!(matches!(msg, FrontendMessage::Query { sql } if sql == "SELECT 1"));
    }

    #[test]
    fn error_response_ends_with_trailing_nul() {
        let mut codec = Codec::default();
        let mut dst = BytesMut::new();
        let err = ErrorResponse::error(SqlState::SYNTAX_ERROR, "bad sql");
        codec
            .encode(BackendMessage::ErrorResponse(err), &mut dst)
            .unwrap();
        assert_eq!(dst[0], b'E');
        assert_eq!(*dst.last().unwrap(), 0);
    }

    #[test]
    fn decode_bind_round_trips_param_bytes() {
        let mut payload = BytesMut::new();
        payload.put_slice(b"p\0s\0"); // portal, statement
        payload.put_i16(0); // no explicit param formats -> default text
        payload.put_i16(1); // one param
        payload.put_i32(1);
        payload.put_slice(b"7");
        payload.put_i16(0); // no explicit result formats
        let msg = decode_message(b'B', &payload).unwrap();
        match msg {
            FrontendMessage::Bind { params, .. } => {
                assert_eq!(params, vec![Some(b"7".to_vec())]);
            }
            _ => panic!("expected Bind"),
        }
    }
}
