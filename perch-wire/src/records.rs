//! The protocol's record types.
//!
//! Field order is wire-significant; every struct encodes and decodes its
//! fields in declaration order.

use crate::codec::{
    Decode, DecodeError, Encode, Reader, write_bool, write_buffer, write_i32, write_i64,
    write_string, write_string_vec,
};

fn read_record_vec<T: Decode>(r: &mut Reader<'_>) -> Result<Vec<T>, DecodeError> {
    let count = r.read_i32()?;
    if count == -1 {
        return Ok(Vec::new());
    }
    if count < 0 {
        return Err(DecodeError::NegativeLength(count));
    }
    let mut out = Vec::with_capacity((count as usize).min(1024));
    for _ in 0..count {
        out.push(T::decode(r)?);
    }
    Ok(out)
}

fn write_record_vec<T: Encode>(out: &mut Vec<u8>, v: &[T]) {
    write_i32(out, v.len() as i32);
    for item in v {
        item.encode(out);
    }
}

/// The session-establishing request, sent as the first frame on every fresh
/// socket. Carries no [`RequestHeader`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectRequest {
    pub protocol_version: i32,
    pub last_zxid_seen: i64,
    pub timeout_ms: i32,
    pub session_id: i64,
    pub passwd: Vec<u8>,
}

impl Encode for ConnectRequest {
    fn encode(&self, out: &mut Vec<u8>) {
        write_i32(out, self.protocol_version);
        write_i64(out, self.last_zxid_seen);
        write_i32(out, self.timeout_ms);
        write_i64(out, self.session_id);
        write_buffer(out, &self.passwd);
    }
}

impl Decode for ConnectRequest {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            protocol_version: r.read_i32()?,
            last_zxid_seen: r.read_i64()?,
            timeout_ms: r.read_i32()?,
            session_id: r.read_i64()?,
            passwd: r.read_buffer()?,
        })
    }
}

/// The server's answer to [`ConnectRequest`]. A `timeout_ms` of zero means
/// the session is expired and the server wants nothing more to do with it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectResponse {
    pub protocol_version: i32,
    pub timeout_ms: i32,
    pub session_id: i64,
    pub passwd: Vec<u8>,
}

impl Encode for ConnectResponse {
    fn encode(&self, out: &mut Vec<u8>) {
        write_i32(out, self.protocol_version);
        write_i32(out, self.timeout_ms);
        write_i64(out, self.session_id);
        write_buffer(out, &self.passwd);
    }
}

impl Decode for ConnectResponse {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            protocol_version: r.read_i32()?,
            timeout_ms: r.read_i32()?,
            session_id: r.read_i64()?,
            passwd: r.read_buffer()?,
        })
    }
}

/// Precedes every request body except the connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestHeader {
    pub xid: i32,
    pub op: i32,
}

impl RequestHeader {
    pub fn new(xid: i32, op: crate::OpCode) -> Self {
        Self { xid, op: op.code() }
    }
}

impl Encode for RequestHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        write_i32(out, self.xid);
        write_i32(out, self.op);
    }
}

impl Decode for RequestHeader {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            xid: r.read_i32()?,
            op: r.read_i32()?,
        })
    }
}

/// Precedes every reply body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplyHeader {
    pub xid: i32,
    pub zxid: i64,
    pub err: i32,
}

impl Encode for ReplyHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        write_i32(out, self.xid);
        write_i64(out, self.zxid);
        write_i32(out, self.err);
    }
}

impl Decode for ReplyHeader {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            xid: r.read_i32()?,
            zxid: r.read_i64()?,
            err: r.read_i32()?,
        })
    }
}

/// Credential replayed to the server, sent with xid [`crate::xid::AUTH`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthPacket {
    pub auth_type: i32,
    pub scheme: String,
    pub auth: Vec<u8>,
}

impl Encode for AuthPacket {
    fn encode(&self, out: &mut Vec<u8>) {
        write_i32(out, self.auth_type);
        write_string(out, &self.scheme);
        write_buffer(out, &self.auth);
    }
}

impl Decode for AuthPacket {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            auth_type: r.read_i32()?,
            scheme: r.read_string()?,
            auth: r.read_buffer()?,
        })
    }
}

/// A watch notification, the body of a reply with xid
/// [`crate::xid::NOTIFICATION`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WatcherEvent {
    pub event_type: i32,
    pub state: i32,
    pub path: String,
}

impl Encode for WatcherEvent {
    fn encode(&self, out: &mut Vec<u8>) {
        write_i32(out, self.event_type);
        write_i32(out, self.state);
        write_string(out, &self.path);
    }
}

impl Decode for WatcherEvent {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            event_type: r.read_i32()?,
            state: r.read_i32()?,
            path: r.read_string()?,
        })
    }
}

/// Re-registers the outstanding watches after a reconnect, sent with xid
/// [`crate::xid::SET_WATCHES`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SetWatches {
    pub relative_zxid: i64,
    pub data_watches: Vec<String>,
    pub exist_watches: Vec<String>,
    pub child_watches: Vec<String>,
}

impl Encode for SetWatches {
    fn encode(&self, out: &mut Vec<u8>) {
        write_i64(out, self.relative_zxid);
        write_string_vec(out, &self.data_watches);
        write_string_vec(out, &self.exist_watches);
        write_string_vec(out, &self.child_watches);
    }
}

impl Decode for SetWatches {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            relative_zxid: r.read_i64()?,
            data_watches: r.read_string_vec()?,
            exist_watches: r.read_string_vec()?,
            child_watches: r.read_string_vec()?,
        })
    }
}

/// Node metadata, embedded in most operation responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    pub czxid: i64,
    pub mzxid: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub version: i32,
    pub cversion: i32,
    pub aversion: i32,
    pub ephemeral_owner: i64,
    pub data_length: i32,
    pub num_children: i32,
    pub pzxid: i64,
}

impl Encode for Stat {
    fn encode(&self, out: &mut Vec<u8>) {
        write_i64(out, self.czxid);
        write_i64(out, self.mzxid);
        write_i64(out, self.ctime);
        write_i64(out, self.mtime);
        write_i32(out, self.version);
        write_i32(out, self.cversion);
        write_i32(out, self.aversion);
        write_i64(out, self.ephemeral_owner);
        write_i32(out, self.data_length);
        write_i32(out, self.num_children);
        write_i64(out, self.pzxid);
    }
}

impl Decode for Stat {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            czxid: r.read_i64()?,
            mzxid: r.read_i64()?,
            ctime: r.read_i64()?,
            mtime: r.read_i64()?,
            version: r.read_i32()?,
            cversion: r.read_i32()?,
            aversion: r.read_i32()?,
            ephemeral_owner: r.read_i64()?,
            data_length: r.read_i32()?,
            num_children: r.read_i32()?,
            pzxid: r.read_i64()?,
        })
    }
}

/// An identity an [`Acl`] entry grants permissions to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Id {
    pub scheme: String,
    pub id: String,
}

impl Encode for Id {
    fn encode(&self, out: &mut Vec<u8>) {
        write_string(out, &self.scheme);
        write_string(out, &self.id);
    }
}

impl Decode for Id {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            scheme: r.read_string()?,
            id: r.read_string()?,
        })
    }
}

/// One access-control entry on a node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Acl {
    pub perms: i32,
    pub id: Id,
}

impl Encode for Acl {
    fn encode(&self, out: &mut Vec<u8>) {
        write_i32(out, self.perms);
        self.id.encode(out);
    }
}

impl Decode for Acl {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            perms: r.read_i32()?,
            id: Id::decode(r)?,
        })
    }
}

// Operation records. The engine never interprets these; they exist so the
// facade has typed bodies to hand to `queue_packet`.

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetDataRequest {
    pub path: String,
    pub watch: bool,
}

impl Encode for GetDataRequest {
    fn encode(&self, out: &mut Vec<u8>) {
        write_string(out, &self.path);
        write_bool(out, self.watch);
    }
}

impl Decode for GetDataRequest {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            path: r.read_string()?,
            watch: r.read_bool()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetDataResponse {
    pub data: Vec<u8>,
    pub stat: Stat,
}

impl Encode for GetDataResponse {
    fn encode(&self, out: &mut Vec<u8>) {
        write_buffer(out, &self.data);
        self.stat.encode(out);
    }
}

impl Decode for GetDataResponse {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            data: r.read_buffer()?,
            stat: Stat::decode(r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExistsRequest {
    pub path: String,
    pub watch: bool,
}

impl Encode for ExistsRequest {
    fn encode(&self, out: &mut Vec<u8>) {
        write_string(out, &self.path);
        write_bool(out, self.watch);
    }
}

impl Decode for ExistsRequest {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            path: r.read_string()?,
            watch: r.read_bool()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExistsResponse {
    pub stat: Stat,
}

impl Encode for ExistsResponse {
    fn encode(&self, out: &mut Vec<u8>) {
        self.stat.encode(out);
    }
}

impl Decode for ExistsResponse {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self { stat: Stat::decode(r)? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreateRequest {
    pub path: String,
    pub data: Vec<u8>,
    pub acl: Vec<Acl>,
    pub flags: i32,
}

impl Encode for CreateRequest {
    fn encode(&self, out: &mut Vec<u8>) {
        write_string(out, &self.path);
        write_buffer(out, &self.data);
        write_record_vec(out, &self.acl);
        write_i32(out, self.flags);
    }
}

impl Decode for CreateRequest {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            path: r.read_string()?,
            data: r.read_buffer()?,
            acl: read_record_vec(r)?,
            flags: r.read_i32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CreateResponse {
    pub path: String,
}

impl Encode for CreateResponse {
    fn encode(&self, out: &mut Vec<u8>) {
        write_string(out, &self.path);
    }
}

impl Decode for CreateResponse {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self { path: r.read_string()? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SetDataRequest {
    pub path: String,
    pub data: Vec<u8>,
    pub version: i32,
}

impl Encode for SetDataRequest {
    fn encode(&self, out: &mut Vec<u8>) {
        write_string(out, &self.path);
        write_buffer(out, &self.data);
        write_i32(out, self.version);
    }
}

impl Decode for SetDataRequest {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            path: r.read_string()?,
            data: r.read_buffer()?,
            version: r.read_i32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SetDataResponse {
    pub stat: Stat,
}

impl Encode for SetDataResponse {
    fn encode(&self, out: &mut Vec<u8>) {
        self.stat.encode(out);
    }
}

impl Decode for SetDataResponse {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self { stat: Stat::decode(r)? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeleteRequest {
    pub path: String,
    pub version: i32,
}

impl Encode for DeleteRequest {
    fn encode(&self, out: &mut Vec<u8>) {
        write_string(out, &self.path);
        write_i32(out, self.version);
    }
}

impl Decode for DeleteRequest {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            path: r.read_string()?,
            version: r.read_i32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetChildrenRequest {
    pub path: String,
    pub watch: bool,
}

impl Encode for GetChildrenRequest {
    fn encode(&self, out: &mut Vec<u8>) {
        write_string(out, &self.path);
        write_bool(out, self.watch);
    }
}

impl Decode for GetChildrenRequest {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            path: r.read_string()?,
            watch: r.read_bool()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetChildrenResponse {
    pub children: Vec<String>,
}

impl Encode for GetChildrenResponse {
    fn encode(&self, out: &mut Vec<u8>) {
        write_string_vec(out, &self.children);
    }
}

impl Decode for GetChildrenResponse {
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            children: r.read_string_vec()?,
        })
    }
}
