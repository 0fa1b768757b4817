//! Wire protocol messages.
//!
//! Every message is framed by a 16-byte little-endian header
//! (`message_length`, `request_id`, `response_to`, `op_code`) followed by an
//! op-specific body. Documents inside bodies are length-prefixed JSON objects:
//! an `i32` total length (including the prefix) then UTF-8 JSON bytes.
//!
//! The driver core only needs three operations: `Query` (replyable),
//! `Insert` (fire-and-forget) and the `Reply` sent back for queries.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// A document exchanged with the server.
pub type Document = Map<String, Value>;

/// Size of the fixed message header in bytes.
pub const HEADER_LENGTH: usize = 16;
/// Largest frame the driver accepts from or sends to a server.
pub const MAX_MESSAGE_SIZE: usize = 48_000_000;

/// Database that serves administrative commands.
pub const ADMIN_DATABASE: &str = "admin";
/// Pseudo-collection commands are issued against.
pub const COMMAND_COLLECTION: &str = "$cmd";
/// Command key of the status check issued by every refresh.
pub const STATUS_COMMAND: &str = "ismaster";

static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

fn next_request_id() -> i32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// The `{ "ismaster": 1 }` selector sent by `Server::refresh`.
pub fn default_status_command() -> Document {
    let mut selector = Document::new();
    selector.insert(STATUS_COMMAND.to_string(), Value::from(1));
    selector
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum OpCode {
    Reply = 1,
    Insert = 2002,
    Query = 2004,
}

impl OpCode {
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            1 => Some(OpCode::Reply),
            2002 => Some(OpCode::Insert),
            2004 => Some(OpCode::Query),
            _ => None,
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpCode::Reply => write!(f, "OP_REPLY"),
            OpCode::Insert => write!(f, "OP_INSERT"),
            OpCode::Query => write!(f, "OP_QUERY"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub fn write(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.message_length.to_le_bytes());
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.response_to.to_le_bytes());
        buf.extend_from_slice(&self.op_code.to_le_bytes());
    }

    pub fn parse(bytes: &[u8; HEADER_LENGTH]) -> Self {
        let field = |i: usize| i32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Self {
            message_length: field(0),
            request_id: field(4),
            response_to: field(8),
            op_code: field(12),
        }
    }

    /// Number of body bytes that follow the header, validated against
    /// [`MAX_MESSAGE_SIZE`].
    pub fn body_length(&self) -> Result<usize> {
        let total = usize::try_from(self.message_length)
            .map_err(|_| Error::Protocol(format!("negative message length {}", self.message_length)))?;
        if total < HEADER_LENGTH {
            return Err(Error::Protocol(format!("message length {total} shorter than header")));
        }
        if total > MAX_MESSAGE_SIZE {
            return Err(Error::Protocol(format!(
                "message length {total} exceeds maximum {MAX_MESSAGE_SIZE}"
            )));
        }
        Ok(total - HEADER_LENGTH)
    }
}

/// An outbound protocol message.
pub trait Message: Send + Sync + fmt::Debug {
    fn op_code(&self) -> OpCode;

    fn request_id(&self) -> i32;

    /// Append the op-specific body (everything after the header).
    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()>;

    /// Whether the server answers this message with a [`Reply`].
    fn replyable(&self) -> bool;

    /// Append the complete framed message (header + body) to `buf`.
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<()> {
        let start = buf.len();
        MessageHeader {
            message_length: 0,
            request_id: self.request_id(),
            response_to: 0,
            op_code: self.op_code() as i32,
        }
        .write(buf);
        self.write_body(buf)?;

        let length = buf.len() - start;
        if length > MAX_MESSAGE_SIZE {
            return Err(Error::Protocol(format!(
                "{} of {length} bytes exceeds maximum {MAX_MESSAGE_SIZE}",
                self.op_code()
            )));
        }
        // Bounded by MAX_MESSAGE_SIZE above.
        buf[start..start + 4].copy_from_slice(&(length as i32).to_le_bytes());
        Ok(())
    }
}

/// A query against `database.collection`. Commands are queries against
/// `database.$cmd` with `limit = -1`.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    request_id: i32,
    pub namespace: String,
    pub selector: Document,
    pub flags: i32,
    pub skip: i32,
    pub limit: i32,
}

impl Query {
    pub fn new(database: &str, collection: &str, selector: Document) -> Self {
        Self {
            request_id: next_request_id(),
            namespace: format!("{database}.{collection}"),
            selector,
            flags: 0,
            skip: 0,
            limit: 0,
        }
    }

    /// A single-batch command against `database.$cmd`.
    pub fn command(database: &str, selector: Document) -> Self {
        Self {
            limit: -1,
            ..Self::new(database, COMMAND_COLLECTION, selector)
        }
    }

    /// The status check command against the admin database.
    pub fn status_command(selector: Document) -> Self {
        Self::command(ADMIN_DATABASE, selector)
    }

    pub fn with_limit(mut self, limit: i32) -> Self {
        self.limit = limit;
        self
    }
}

impl Message for Query {
    fn op_code(&self) -> OpCode {
        OpCode::Query
    }

    fn request_id(&self) -> i32 {
        self.request_id
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&self.flags.to_le_bytes());
        write_cstring(buf, &self.namespace)?;
        buf.extend_from_slice(&self.skip.to_le_bytes());
        buf.extend_from_slice(&self.limit.to_le_bytes());
        encode_document(&self.selector, buf)
    }

    fn replyable(&self) -> bool {
        true
    }
}

/// Insert documents into `database.collection`. The server sends no reply.
#[derive(Clone, Debug, PartialEq)]
pub struct Insert {
    request_id: i32,
    pub namespace: String,
    pub documents: Vec<Document>,
    pub flags: i32,
}

impl Insert {
    pub fn new(database: &str, collection: &str, documents: Vec<Document>) -> Self {
        Self {
            request_id: next_request_id(),
            namespace: format!("{database}.{collection}"),
            documents,
            flags: 0,
        }
    }
}

impl Message for Insert {
    fn op_code(&self) -> OpCode {
        OpCode::Insert
    }

    fn request_id(&self) -> i32 {
        self.request_id
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&self.flags.to_le_bytes());
        write_cstring(buf, &self.namespace)?;
        for doc in &self.documents {
            encode_document(doc, buf)?;
        }
        Ok(())
    }

    fn replyable(&self) -> bool {
        false
    }
}

/// A server reply to a query.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    pub header: MessageHeader,
    pub flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<Document>,
}

impl Reply {
    /// Fixed part of an `OP_REPLY` body before the documents.
    const PREAMBLE_LENGTH: usize = 20;

    pub fn decode(header: MessageHeader, body: &[u8]) -> Result<Self> {
        if header.op_code != OpCode::Reply as i32 {
            return Err(Error::Protocol(format!(
                "expected OP_REPLY, got op code {}",
                header.op_code
            )));
        }
        if body.len() < Self::PREAMBLE_LENGTH {
            return Err(Error::Protocol(format!("reply body of {} bytes is truncated", body.len())));
        }

        let flags = read_i32(body, 0);
        let cursor_id = i64::from_le_bytes([
            body[4], body[5], body[6], body[7], body[8], body[9], body[10], body[11],
        ]);
        let starting_from = read_i32(body, 12);
        let number_returned = read_i32(body, 16);

        let mut documents = Vec::new();
        let mut rest = &body[Self::PREAMBLE_LENGTH..];
        while !rest.is_empty() {
            let (doc, consumed) = decode_document(rest)?;
            documents.push(doc);
            rest = &rest[consumed..];
        }

        if usize::try_from(number_returned).ok() != Some(documents.len()) {
            return Err(Error::Protocol(format!(
                "reply announced {number_returned} documents but carried {}",
                documents.len()
            )));
        }

        Ok(Self {
            header,
            flags,
            cursor_id,
            starting_from,
            documents,
        })
    }

    /// Frame a reply answering `response_to`, as a server sends it.
    pub fn encode(response_to: i32, documents: &[Document]) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&0i64.to_le_bytes());
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&(documents.len() as i32).to_le_bytes());
        for doc in documents {
            encode_document(doc, &mut body)?;
        }

        let mut buf = Vec::with_capacity(HEADER_LENGTH + body.len());
        MessageHeader {
            message_length: (HEADER_LENGTH + body.len()) as i32,
            request_id: next_request_id(),
            response_to,
            op_code: OpCode::Reply as i32,
        }
        .write(&mut buf);
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    pub fn first_document(&self) -> Option<&Document> {
        self.documents.first()
    }
}

pub fn encode_document(doc: &Document, buf: &mut Vec<u8>) -> Result<()> {
    let json = serde_json::to_vec(doc)
        .map_err(|e| Error::Protocol(format!("document encoding: {e}")))?;
    let length = i32::try_from(json.len() + 4)
        .map_err(|_| Error::Protocol("document too large".to_string()))?;
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&json);
    Ok(())
}

/// Decode one document from the front of `bytes`, returning it with the
/// number of bytes consumed.
pub fn decode_document(bytes: &[u8]) -> Result<(Document, usize)> {
    if bytes.len() < 4 {
        return Err(Error::Protocol("truncated document length".to_string()));
    }
    let length = usize::try_from(read_i32(bytes, 0))
        .map_err(|_| Error::Protocol("negative document length".to_string()))?;
    if length < 4 || length > bytes.len() {
        return Err(Error::Protocol(format!(
            "document length {length} out of bounds ({} bytes left)",
            bytes.len()
        )));
    }
    let doc: Document = serde_json::from_slice(&bytes[4..length])
        .map_err(|e| Error::Protocol(format!("document decoding: {e}")))?;
    Ok((doc, length))
}

fn write_cstring(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.as_bytes().contains(&0) {
        return Err(Error::Protocol(format!("namespace '{s}' contains a NUL byte")));
    }
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    Ok(())
}

fn read_i32(bytes: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
