//! Payloads carried inside request and result frames.
//!
//! ```text
//! request: id u32 | qtype u16 | qclass u16 | name (u16 len + bytes)
//! result:  id u32 | status u8 | answer            (status 0)
//!                             | message (u16 len + bytes)  (otherwise)
//! ```

use crate::error::{ChannelError, ContextError, ErrorCode};
use crate::query::{Answer, Query, RecordClass, RecordType};
use crate::registry::QueryId;
use bytes::{Buf, BufMut, BytesMut};

const FLAG_HAVEDATA: u8 = 0x01;
const FLAG_NXDOMAIN: u8 = 0x02;
const FLAG_SECURE: u8 = 0x04;
const FLAG_BOGUS: u8 = 0x08;

/// A query on its way to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: QueryId,
    pub query: Query,
}

impl Request {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(12 + self.query.name().len());
        buf.put_u32(self.id.0);
        buf.put_u16(self.query.rtype().0);
        buf.put_u16(self.query.class().0);
        put_str(&mut buf, self.query.name());
        buf.to_vec()
    }

    /// # Errors
    ///
    /// Returns [`ChannelError::Protocol`] on truncated input, trailing bytes
    /// or a query that does not pass syntax checks.
    pub fn decode(mut buf: &[u8]) -> Result<Self, ChannelError> {
        let id = QueryId(get_u32(&mut buf)?);
        let rtype = RecordType(get_u16(&mut buf)?);
        let class = RecordClass(get_u16(&mut buf)?);
        let name = get_str(&mut buf)?;
        finish(buf)?;
        let query = Query::new(&name, rtype, class)
            .map_err(|e| ChannelError::Protocol(format!("request {id}: {e}")))?;
        Ok(Self { id, query })
    }
}

/// The worker's answer to one request.
#[derive(Debug)]
pub struct Response {
    pub id: QueryId,
    pub outcome: Result<Answer, ContextError>,
}

impl Response {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32(self.id.0);
        match &self.outcome {
            Ok(answer) => {
                buf.put_u8(ErrorCode::NoError.status());
                put_answer(&mut buf, answer);
            }
            Err(err) => {
                buf.put_u8(err.code().status());
                put_str(&mut buf, &err.wire_message());
            }
        }
        buf.to_vec()
    }

    /// Reads just the id, so a frame can be routed even if its body is bad.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Protocol`] if the frame is shorter than an id.
    pub fn peek_id(mut buf: &[u8]) -> Result<QueryId, ChannelError> {
        get_u32(&mut buf).map(QueryId)
    }

    /// # Errors
    ///
    /// Returns [`ChannelError::Protocol`] on truncated input, trailing bytes
    /// or an unknown status byte.
    pub fn decode(mut buf: &[u8]) -> Result<Self, ChannelError> {
        let id = QueryId(get_u32(&mut buf)?);
        let status = get_u8(&mut buf)?;
        let code = ErrorCode::from_status(status)
            .ok_or_else(|| ChannelError::Protocol(format!("unknown status byte {status}")))?;
        let outcome = if code == ErrorCode::NoError {
            Ok(get_answer(&mut buf)?)
        } else {
            Err(ContextError::from_wire(code, get_str(&mut buf)?))
        };
        finish(buf)?;
        Ok(Self { id, outcome })
    }
}

fn put_answer(buf: &mut BytesMut, answer: &Answer) {
    put_str(buf, &answer.qname);
    buf.put_u16(answer.qtype);
    buf.put_u16(answer.qclass);
    put_len(buf, answer.data.len());
    for rdata in &answer.data {
        put_bytes(buf, rdata);
    }
    put_opt_str(buf, answer.canonname.as_deref());
    buf.put_u16(answer.rcode);
    let mut flags = 0;
    for (set, bit) in [
        (answer.havedata, FLAG_HAVEDATA),
        (answer.nxdomain, FLAG_NXDOMAIN),
        (answer.secure, FLAG_SECURE),
        (answer.bogus, FLAG_BOGUS),
    ] {
        if set {
            flags |= bit;
        }
    }
    buf.put_u8(flags);
    put_opt_str(buf, answer.why_bogus.as_deref());
    buf.put_u32(answer.ttl);
}

fn get_answer(buf: &mut &[u8]) -> Result<Answer, ChannelError> {
    let qname = get_str(buf)?;
    let qtype = get_u16(buf)?;
    let qclass = get_u16(buf)?;
    let count = get_u16(buf)?;
    let mut data = Vec::with_capacity(usize::from(count).min(buf.len()));
    for _ in 0..count {
        data.push(get_bytes(buf)?);
    }
    let canonname = get_opt_str(buf)?;
    let rcode = get_u16(buf)?;
    let flags = get_u8(buf)?;
    let why_bogus = get_opt_str(buf)?;
    let ttl = get_u32(buf)?;
    Ok(Answer {
        qname,
        qtype,
        qclass,
        data,
        canonname,
        rcode,
        havedata: flags & FLAG_HAVEDATA != 0,
        nxdomain: flags & FLAG_NXDOMAIN != 0,
        secure: flags & FLAG_SECURE != 0,
        bogus: flags & FLAG_BOGUS != 0,
        why_bogus,
        ttl,
    })
}

// Lengths are u16; longer fields are cut at the limit. Frame size limits
// keep real payloads far below it.
#[allow(clippy::cast_possible_truncation)]
fn put_len(buf: &mut BytesMut, len: usize) {
    buf.put_u16(len.min(usize::from(u16::MAX)) as u16);
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    let bytes = &bytes[..bytes.len().min(usize::from(u16::MAX))];
    put_len(buf, bytes.len());
    buf.put_slice(bytes);
}

fn put_str(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

fn put_opt_str(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s);
        }
        None => buf.put_u8(0),
    }
}

fn need(buf: &[u8], n: usize) -> Result<(), ChannelError> {
    if buf.remaining() < n {
        return Err(ChannelError::Protocol(format!(
            "payload truncated: need {n} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, ChannelError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8]) -> Result<u16, ChannelError> {
    need(buf, 2)?;
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut &[u8]) -> Result<u32, ChannelError> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, ChannelError> {
    let len = usize::from(get_u16(buf)?);
    need(buf, len)?;
    let out = buf[..len].to_vec();
    buf.advance(len);
    Ok(out)
}

fn get_str(buf: &mut &[u8]) -> Result<String, ChannelError> {
    String::from_utf8(get_bytes(buf)?)
        .map_err(|_| ChannelError::Protocol("string field is not UTF-8".into()))
}

fn get_opt_str(buf: &mut &[u8]) -> Result<Option<String>, ChannelError> {
    match get_u8(buf)? {
        0 => Ok(None),
        1 => get_str(buf).map(Some),
        other => Err(ChannelError::Protocol(format!("bad option tag {other}"))),
    }
}

fn finish(buf: &[u8]) -> Result<(), ChannelError> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(ChannelError::Protocol(format!(
            "{} trailing bytes after payload",
            buf.len()
        )))
    }
}
