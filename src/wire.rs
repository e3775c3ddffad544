//! # Wire Protocol
//!
//! Every message on a connection is a frame: a little-endian `u16` length
//! followed by the payload. A payload starts with the message tag as a
//! string; strings are a big-endian `u16` byte length plus UTF-8, integers
//! are big-endian `u64`, booleans a single byte.
//!
//! A `STREAM_START` frame switches the connection into raw mode for exactly
//! `finish - start` bytes, which follow the frame unframed. The codec keeps
//! track of how many raw bytes are still owed and hands them out as
//! [`Inbound::StreamData`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::ids::{ContentId, EventId, ShareId, UserId};

/// Largest payload a single frame can carry.
pub const MAX_FRAME: usize = u16::MAX as usize;

/// Largest body a `STREAM_START` may announce.
pub const MAX_STREAM_SESSION: u64 = 500 * 1024;

/// Room left in batched messages for the `FORWARD` envelope a relay adds.
pub const FORWARD_RESERVE: usize = 512;

/// Greeting exchanged at the start of every handshake.
pub const GREETING: &str = "slymesh:0.1:Hello!";

const HELLO: &str = "HELLO";
const AUTH: &str = "AUTH";
const REGISTER: &str = "REGISTER";
const ADD_CONTACTS: &str = "ADD_CONTACTS";
const REMOVE_CONTACTS: &str = "REMOVE_CONTACTS";
const FORWARD: &str = "FORWARD";
const CONTACT_UPDATE: &str = "CONTACT_UPDATE";
const CONTACT_DISCONNECT: &str = "CONTACT_DISCONNECT";
const NETWORK_MIRROR: &str = "NETWORK_MIRROR";
const SYNC: &str = "SYNC";
const SYNC_NOTIFY: &str = "SYNC_NOTIFY";
const EVENT: &str = "EVENT";
const DATA_REQUEST: &str = "DATA_REQUEST";
const DATA_QUERY: &str = "DATA_QUERY";
const DATA_RESPONSE: &str = "DATA_RESPONSE";
const DATA_BLOCK: &str = "DATA_BLOCK";
const STREAM_START: &str = "STREAM_START";
const INVITE: &str = "INVITE";
const INVITE_RESPONSE: &str = "INVITE_RESPONSE";

/// Byte range of a blob within one share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRange {
    pub share: ShareId,
    pub content: ContentId,
    pub start: u64,
    pub finish: u64,
}

/// Header announcing `finish - start` raw bytes of a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub to: UserId,
    pub from: UserId,
    pub share: ShareId,
    pub content: ContentId,
    pub start: u64,
    pub finish: u64,
}

impl StreamHeader {
    pub fn len(&self) -> u64 {
        self.finish.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Protocol messages exchanged between nodes and lookup servers
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// First handshake message: greeting, the user we expect on the other
    /// end (empty for anyone) and our nonce
    Hello { greeting: String, target: String, nonce: String },
    /// Second handshake message: armored identity and armored nonce proof,
    /// both empty for anonymous endpoints
    Auth { identity: String, proof: String },
    /// Publish our identity to a lookup server
    Register { identity: String },
    AddContacts { users: Vec<UserId> },
    RemoveContacts { users: Vec<UserId> },
    /// Relay an encoded message to another user
    Forward { to: UserId, from: UserId, payload: Bytes },
    ContactUpdate { identities: Vec<String> },
    ContactDisconnect { user: UserId },
    NetworkMirror { addresses: Vec<String> },
    Sync { share: ShareId, heads: Vec<(UserId, EventId)> },
    SyncNotify { share: ShareId, heads: Vec<(UserId, EventId)> },
    /// Binary signed event records
    Event { share: ShareId, events: Vec<Bytes> },
    DataRequest(DataRange),
    DataQuery(DataRange),
    DataResponse(DataRange),
    DataBlock { range: DataRange, data: Bytes },
    StreamStart(StreamHeader),
    Invite { share: ShareId, name: String, greeting: String },
    InviteResponse { share: ShareId, accept: bool },
}

impl Message {
    /// Wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => HELLO,
            Message::Auth { .. } => AUTH,
            Message::Register { .. } => REGISTER,
            Message::AddContacts { .. } => ADD_CONTACTS,
            Message::RemoveContacts { .. } => REMOVE_CONTACTS,
            Message::Forward { .. } => FORWARD,
            Message::ContactUpdate { .. } => CONTACT_UPDATE,
            Message::ContactDisconnect { .. } => CONTACT_DISCONNECT,
            Message::NetworkMirror { .. } => NETWORK_MIRROR,
            Message::Sync { .. } => SYNC,
            Message::SyncNotify { .. } => SYNC_NOTIFY,
            Message::Event { .. } => EVENT,
            Message::DataRequest(_) => DATA_REQUEST,
            Message::DataQuery(_) => DATA_QUERY,
            Message::DataResponse(_) => DATA_RESPONSE,
            Message::DataBlock { .. } => DATA_BLOCK,
            Message::StreamStart(_) => STREAM_START,
            Message::Invite { .. } => INVITE,
            Message::InviteResponse { .. } => INVITE_RESPONSE,
        }
    }

    /// The share a message belongs to, if any.
    pub fn share(&self) -> Option<&ShareId> {
        match self {
            Message::Sync { share, .. }
            | Message::SyncNotify { share, .. }
            | Message::Event { share, .. }
            | Message::Invite { share, .. }
            | Message::InviteResponse { share, .. } => Some(share),
            Message::DataRequest(r) | Message::DataQuery(r) | Message::DataResponse(r) => {
                Some(&r.share)
            }
            Message::DataBlock { range, .. } => Some(&range.share),
            Message::StreamStart(h) => Some(&h.share),
            _ => None,
        }
    }

    /// Encode the payload of this message (without the frame length).
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        put_str(&mut buf, self.kind())?;
        match self {
            Message::Hello { greeting, target, nonce } => {
                put_str(&mut buf, greeting)?;
                put_str(&mut buf, target)?;
                put_str(&mut buf, nonce)?;
            }
            Message::Auth { identity, proof } => {
                put_str(&mut buf, identity)?;
                put_str(&mut buf, proof)?;
            }
            Message::Register { identity } => put_str(&mut buf, identity)?,
            Message::AddContacts { users } | Message::RemoveContacts { users } => {
                for user in users {
                    put_str(&mut buf, user.as_str())?;
                }
            }
            Message::Forward { to, from, payload } => {
                put_str(&mut buf, to.as_str())?;
                put_str(&mut buf, from.as_str())?;
                buf.put_slice(payload);
            }
            Message::ContactUpdate { identities } => {
                for identity in identities {
                    put_str(&mut buf, identity)?;
                }
            }
            Message::ContactDisconnect { user } => put_str(&mut buf, user.as_str())?,
            Message::NetworkMirror { addresses } => {
                for address in addresses {
                    put_str(&mut buf, address)?;
                }
            }
            Message::Sync { share, heads } | Message::SyncNotify { share, heads } => {
                put_str(&mut buf, share.as_str())?;
                for (user, head) in heads {
                    put_str(&mut buf, user.as_str())?;
                    put_str(&mut buf, head.as_str())?;
                }
            }
            Message::Event { share, events } => {
                put_str(&mut buf, share.as_str())?;
                for event in events {
                    put_blob(&mut buf, event)?;
                }
            }
            Message::DataRequest(range) | Message::DataQuery(range) | Message::DataResponse(range) => {
                put_range(&mut buf, range)?;
            }
            Message::DataBlock { range, data } => {
                put_range(&mut buf, range)?;
                buf.put_slice(data);
            }
            Message::StreamStart(header) => {
                put_str(&mut buf, header.to.as_str())?;
                put_str(&mut buf, header.from.as_str())?;
                put_str(&mut buf, header.share.as_str())?;
                put_str(&mut buf, &header.content.to_string())?;
                buf.put_u64(header.start);
                buf.put_u64(header.finish);
            }
            Message::Invite { share, name, greeting } => {
                put_str(&mut buf, share.as_str())?;
                put_str(&mut buf, name)?;
                put_str(&mut buf, greeting)?;
            }
            Message::InviteResponse { share, accept } => {
                put_str(&mut buf, share.as_str())?;
                buf.put_u8(u8::from(*accept));
            }
        }
        if buf.len() > MAX_FRAME {
            return Err(Error::protocol(format!(
                "{} message of {} bytes exceeds the frame limit",
                self.kind(),
                buf.len()
            )));
        }
        Ok(buf.freeze())
    }

    /// Decode a frame payload.
    pub fn decode(payload: &[u8]) -> Result<Message> {
        let mut r = WireReader::new(payload);
        let kind = r.read_str()?;
        let message = match kind.as_str() {
            HELLO => Message::Hello {
                greeting: r.read_str()?,
                target: r.read_str()?,
                nonce: r.read_str()?,
            },
            AUTH => Message::Auth {
                identity: r.read_str()?,
                proof: r.read_str()?,
            },
            REGISTER => Message::Register { identity: r.read_str()? },
            ADD_CONTACTS => Message::AddContacts { users: read_users(&mut r)? },
            REMOVE_CONTACTS => Message::RemoveContacts { users: read_users(&mut r)? },
            FORWARD => Message::Forward {
                to: UserId::new(r.read_str()?),
                from: UserId::new(r.read_str()?),
                payload: Bytes::copy_from_slice(r.rest()),
            },
            CONTACT_UPDATE => Message::ContactUpdate { identities: read_strings(&mut r)? },
            CONTACT_DISCONNECT => Message::ContactDisconnect {
                user: UserId::new(r.read_str()?),
            },
            NETWORK_MIRROR => Message::NetworkMirror { addresses: read_strings(&mut r)? },
            SYNC | SYNC_NOTIFY => {
                let share = ShareId::parse(&r.read_str()?)?;
                let mut heads = Vec::new();
                while !r.is_empty() {
                    let user = UserId::new(r.read_str()?);
                    let head = EventId::parse(&r.read_str()?)?;
                    heads.push((user, head));
                }
                if kind == SYNC {
                    Message::Sync { share, heads }
                } else {
                    Message::SyncNotify { share, heads }
                }
            }
            EVENT => {
                let share = ShareId::parse(&r.read_str()?)?;
                let mut events = Vec::new();
                while !r.is_empty() {
                    events.push(Bytes::copy_from_slice(r.read_blob()?));
                }
                Message::Event { share, events }
            }
            DATA_REQUEST => Message::DataRequest(read_range(&mut r)?),
            DATA_QUERY => Message::DataQuery(read_range(&mut r)?),
            DATA_RESPONSE => Message::DataResponse(read_range(&mut r)?),
            DATA_BLOCK => {
                let range = read_range(&mut r)?;
                let data = Bytes::copy_from_slice(r.rest());
                if data.len() as u64 != range.finish.saturating_sub(range.start) {
                    return Err(Error::protocol(format!(
                        "data block carries {} bytes for range {}..{}",
                        data.len(),
                        range.start,
                        range.finish
                    )));
                }
                Message::DataBlock { range, data }
            }
            STREAM_START => Message::StreamStart(StreamHeader {
                to: UserId::new(r.read_str()?),
                from: UserId::new(r.read_str()?),
                share: ShareId::parse(&r.read_str()?)?,
                content: ContentId::parse(&r.read_str()?)?,
                start: r.read_u64()?,
                finish: r.read_u64()?,
            }),
            INVITE => Message::Invite {
                share: ShareId::parse(&r.read_str()?)?,
                name: r.read_str()?,
                greeting: r.read_str()?,
            },
            INVITE_RESPONSE => Message::InviteResponse {
                share: ShareId::parse(&r.read_str()?)?,
                accept: r.read_bool()?,
            },
            other => return Err(Error::protocol(format!("unknown message type '{}'", other))),
        };
        Ok(message)
    }
}

/// Split a list of encoded events into `EVENT` messages that each fit in a
/// frame, even when wrapped in a `FORWARD`.
pub fn event_batches(share: &ShareId, events: Vec<Bytes>) -> Vec<Message> {
    let overhead = 2 + EVENT.len() + 2 + share.as_str().len();
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut size = overhead;
    for event in events {
        let entry = 2 + event.len();
        if !current.is_empty() && size + entry > MAX_FRAME - FORWARD_RESERVE {
            batches.push(Message::Event {
                share: share.clone(),
                events: std::mem::take(&mut current),
            });
            size = overhead;
        }
        size += entry;
        current.push(event);
    }
    if !current.is_empty() {
        batches.push(Message::Event {
            share: share.clone(),
            events: current,
        });
    }
    batches
}

/// Write a `u16`-prefixed UTF-8 string.
pub fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| Error::protocol(format!("string of {} bytes is too long", s.len())))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Write a `u16`-prefixed byte blob.
pub fn put_blob(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len())
        .map_err(|_| Error::protocol(format!("blob of {} bytes is too long", data.len())))?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

fn put_range(buf: &mut BytesMut, range: &DataRange) -> Result<()> {
    put_str(buf, range.share.as_str())?;
    put_str(buf, &range.content.to_string())?;
    buf.put_u64(range.start);
    buf.put_u64(range.finish);
    Ok(())
}

fn read_range(r: &mut WireReader<'_>) -> Result<DataRange> {
    let range = DataRange {
        share: ShareId::parse(&r.read_str()?)?,
        content: ContentId::parse(&r.read_str()?)?,
        start: r.read_u64()?,
        finish: r.read_u64()?,
    };
    if range.finish < range.start {
        return Err(Error::protocol(format!(
            "inverted range {}..{}",
            range.start, range.finish
        )));
    }
    Ok(range)
}

fn read_strings(r: &mut WireReader<'_>) -> Result<Vec<String>> {
    let mut out = Vec::new();
    while !r.is_empty() {
        out.push(r.read_str()?);
    }
    Ok(out)
}

fn read_users(r: &mut WireReader<'_>) -> Result<Vec<UserId>> {
    Ok(read_strings(r)?.into_iter().map(UserId::new).collect())
}

/// Bounds-checked reader over a payload.
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::protocol(format!(
                "truncated payload: wanted {} bytes, {} left",
                n,
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let mut b = self.read_bytes(2)?;
        Ok(b.get_u16())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut b = self.read_bytes(4)?;
        Ok(b.get_u32())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut b = self.read_bytes(8)?;
        Ok(b.get_u64())
    }

    pub fn read_blob(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u16()? as usize;
        self.read_bytes(len)
    }

    pub fn read_str(&mut self) -> Result<String> {
        let raw = self.read_blob()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::protocol("string field is not valid UTF-8"))
    }

    /// Everything that has not been read yet.
    pub fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }
}

/// Items produced by [`FrameCodec`] when reading.
#[derive(Debug)]
pub enum Inbound {
    Message(Message),
    /// Raw bytes following a `STREAM_START` header
    StreamData(Bytes),
}

/// Items accepted by [`FrameCodec`] when writing.
#[derive(Debug)]
pub enum Outbound {
    Message(Message),
    /// A `STREAM_START` header immediately followed by its raw body
    Stream { header: StreamHeader, body: Bytes },
}

/// Length-prefixed frame codec with a raw streaming sub-mode.
#[derive(Debug, Default)]
pub struct FrameCodec {
    raw_remaining: u64,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the codec is in the middle of a raw stream.
    pub fn is_streaming(&self) -> bool {
        self.raw_remaining > 0
    }
}

impl Decoder for FrameCodec {
    type Item = Inbound;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>> {
        if self.raw_remaining > 0 {
            if src.is_empty() {
                return Ok(None);
            }
            let n = (src.len() as u64).min(self.raw_remaining) as usize;
            self.raw_remaining -= n as u64;
            return Ok(Some(Inbound::StreamData(src.split_to(n).freeze())));
        }

        if src.len() < 2 {
            return Ok(None);
        }
        let len = u16::from_le_bytes([src[0], src[1]]) as usize;
        if src.len() < 2 + len {
            src.reserve(2 + len - src.len());
            return Ok(None);
        }
        src.advance(2);
        let payload = src.split_to(len);
        let message = Message::decode(&payload)?;
        if let Message::StreamStart(header) = &message {
            if header.finish < header.start {
                return Err(Error::protocol("stream header with inverted range"));
            }
            if header.len() > MAX_STREAM_SESSION {
                return Err(Error::protocol(format!(
                    "stream session of {} bytes exceeds {}",
                    header.len(),
                    MAX_STREAM_SESSION
                )));
            }
            self.raw_remaining = header.len();
        }
        Ok(Some(Inbound::Message(message)))
    }
}

impl Encoder<Outbound> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<()> {
        match item {
            Outbound::Message(message) => {
                if matches!(message, Message::StreamStart(_)) {
                    return Err(Error::protocol("stream headers must be sent with their body"));
                }
                write_frame(&message, dst)
            }
            Outbound::Stream { header, body } => {
                if header.len() > MAX_STREAM_SESSION {
                    return Err(Error::protocol("stream session too large"));
                }
                if body.len() as u64 != header.len() {
                    return Err(Error::protocol(format!(
                        "stream body of {} bytes for a {} byte header",
                        body.len(),
                        header.len()
                    )));
                }
                write_frame(&Message::StreamStart(header), dst)?;
                dst.extend_from_slice(&body);
                Ok(())
            }
        }
    }
}

fn write_frame(message: &Message, dst: &mut BytesMut) -> Result<()> {
    let payload = message.encode()?;
    dst.reserve(2 + payload.len());
    dst.put_u16_le(payload.len() as u16);
    dst.extend_from_slice(&payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    fn share() -> ShareId {
        ShareId::parse("owner:1234").unwrap()
    }

    fn range(start: u64, finish: u64) -> DataRange {
        DataRange {
            share: share(),
            content: ContentId::new("abcd", 100),
            start,
            finish,
        }
    }

    #[test]
    fn test_frame_layout() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Outbound::Message(Message::ContactDisconnect { user: UserId::new("u1") }),
                &mut buf,
            )
            .unwrap();

        // u16 LE frame length, then u16 BE tag length
        let payload_len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        assert_eq!(payload_len, buf.len() - 2);
        assert_eq!(&buf[2..4], &(CONTACT_DISCONNECT.len() as u16).to_be_bytes());
        assert_eq!(&buf[4..4 + CONTACT_DISCONNECT.len()], CONTACT_DISCONNECT.as_bytes());
    }

    #[test]
    fn test_sync_decodes_pairs_until_exhausted() {
        let heads = vec![
            (UserId::new("a"), EventId::parse("a:1").unwrap()),
            (UserId::new("b"), EventId::root()),
        ];
        let msg = Message::SyncNotify { share: share(), heads: heads.clone() };
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, Message::SyncNotify { share: share(), heads });
    }

    #[test]
    fn test_data_block_length_must_match_range() {
        let msg = Message::DataBlock {
            range: range(0, 4),
            data: Bytes::from_static(b"abc"),
        };
        let payload = msg.encode().unwrap();
        assert_matches!(Message::decode(&payload), Err(Error::Protocol(_)));
    }

    #[test]
    fn test_unknown_tag_is_protocol_violation() {
        let mut buf = BytesMut::new();
        put_str(&mut buf, "BOGUS").unwrap();
        assert_matches!(Message::decode(&buf), Err(Error::Protocol(_)));
    }

    #[test]
    fn test_truncated_payload() {
        let payload = Message::DataQuery(range(0, 10)).encode().unwrap();
        let cut = &payload[..payload.len() - 3];
        assert_matches!(Message::decode(cut), Err(Error::Protocol(_)));
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut codec = FrameCodec::new();
        let mut full = BytesMut::new();
        codec
            .encode(Outbound::Message(Message::DataQuery(range(1, 2))), &mut full)
            .unwrap();

        let mut partial = BytesMut::from(&full[..5]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[5..]);
        assert_matches!(
            codec.decode(&mut partial).unwrap(),
            Some(Inbound::Message(Message::DataQuery(_)))
        );
    }

    #[test]
    fn test_stream_switches_to_raw_mode() {
        let mut codec = FrameCodec::new();
        let header = StreamHeader {
            to: UserId::new("b"),
            from: UserId::new("a"),
            share: share(),
            content: ContentId::new("abcd", 10),
            start: 2,
            finish: 8,
        };
        let mut buf = BytesMut::new();
        codec
            .encode(
                Outbound::Stream { header: header.clone(), body: Bytes::from_static(b"raw!!!") },
                &mut buf,
            )
            .unwrap();
        codec
            .encode(Outbound::Message(Message::ContactDisconnect { user: UserId::new("x") }), &mut buf)
            .unwrap();

        assert_matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Inbound::Message(Message::StreamStart(h))) if h == header
        );
        assert!(codec.is_streaming());
        assert_matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Inbound::StreamData(data)) if &data[..] == b"raw!!!"
        );
        assert!(!codec.is_streaming());
        assert_matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Inbound::Message(Message::ContactDisconnect { .. }))
        );
    }

    #[test]
    fn test_stream_body_must_match_header() {
        let mut codec = FrameCodec::new();
        let header = StreamHeader {
            to: UserId::new("b"),
            from: UserId::new("a"),
            share: share(),
            content: ContentId::new("abcd", 10),
            start: 0,
            finish: 10,
        };
        let mut buf = BytesMut::new();
        let result = codec.encode(
            Outbound::Stream { header, body: Bytes::from_static(b"short") },
            &mut buf,
        );
        assert_matches!(result, Err(Error::Protocol(_)));
    }

    #[test]
    fn test_oversized_stream_header_is_rejected() {
        let header = StreamHeader {
            to: UserId::new("b"),
            from: UserId::new("a"),
            share: share(),
            content: ContentId::new("abcd", 1 << 50),
            start: 0,
            finish: 1 << 50,
        };
        let mut buf = BytesMut::new();
        write_frame(&Message::StreamStart(header), &mut buf).unwrap();
        buf.extend_from_slice(&[0u8; 16]);

        let mut codec = FrameCodec::new();
        assert_matches!(codec.decode(&mut buf), Err(Error::Protocol(_)));
        assert!(!codec.is_streaming());
    }

    #[test]
    fn test_event_batches_respect_frame_limit() {
        let events: Vec<Bytes> = (0..40).map(|_| Bytes::from(vec![7u8; 4000])).collect();
        let batches = event_batches(&share(), events);
        assert!(batches.len() > 1);
        let mut total = 0;
        for batch in &batches {
            assert!(batch.encode().is_ok());
            if let Message::Event { events, .. } = batch {
                total += events.len();
            }
        }
        assert_eq!(total, 40);
    }

    #[tokio::test]
    async fn test_framed_read_over_mock_io() {
        let mut codec = FrameCodec::new();
        let mut wire = BytesMut::new();
        codec
            .encode(
                Outbound::Message(Message::Invite {
                    share: share(),
                    name: "Photos".to_string(),
                    greeting: "Hello!".to_string(),
                }),
                &mut wire,
            )
            .unwrap();

        // Deliver the frame in two reads
        let mock = tokio_test::io::Builder::new()
            .read(&wire[..3])
            .read(&wire[3..])
            .build();
        let mut framed = FramedRead::new(mock, FrameCodec::new());
        let item = framed.next().await.unwrap().unwrap();
        assert_matches!(item, Inbound::Message(Message::Invite { name, .. }) if name == "Photos");
        assert!(framed.next().await.is_none());
    }
}
