//! Decoder for PostgreSQL pgoutput logical replication messages.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-logicalrep-message-formats.html

use std::io::{self, Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use thiserror::Error;

/// Decoding failures. The decoder never panics; malformed input always
/// surfaces as one of these.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown pgoutput message type 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("truncated pgoutput message")]
    TruncatedMessage,

    #[error("unsupported column format 0x{0:02X}")]
    UnsupportedColumnType(u8),

    #[error("unexpected tuple marker 0x{0:02X}")]
    UnexpectedTupleMarker(u8),
}

impl From<io::Error> for DecodeError {
    fn from(_: io::Error) -> Self {
        DecodeError::TruncatedMessage
    }
}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// A decoded pgoutput message. Every variable-length field is an owned
/// copy; the input buffer can be dropped as soon as `decode` returns.
#[derive(Debug, Clone)]
pub enum PgOutputMessage {
    Begin(BeginMessage),
    Commit(CommitMessage),
    Relation(RelationMessage),
    Insert(InsertMessage),
    Update(UpdateMessage),
    Delete(DeleteMessage),
}

#[derive(Debug, Clone)]
pub struct BeginMessage {
    pub final_lsn: u64,
    /// Microseconds since 2000-01-01 00:00:00 UTC.
    pub commit_time: i64,
    pub xid: u32,
}

#[derive(Debug, Clone)]
pub struct CommitMessage {
    pub flags: u8,
    pub commit_lsn: u64,
    pub end_lsn: u64,
    pub commit_time: i64,
}

#[derive(Debug, Clone)]
pub struct RelationMessage {
    pub relation_id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: ReplicaIdentity,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaIdentity {
    Default, // 'd' - primary key
    Nothing, // 'n'
    Full,    // 'f' - entire old row
    Index,   // 'i'
}

impl From<u8> for ReplicaIdentity {
    fn from(b: u8) -> Self {
        match b {
            b'n' => ReplicaIdentity::Nothing,
            b'f' => ReplicaIdentity::Full,
            b'i' => ReplicaIdentity::Index,
            _ => ReplicaIdentity::Default,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    /// 1 when the column is part of the replica identity key.
    pub flags: u8,
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

#[derive(Debug, Clone)]
pub struct InsertMessage {
    pub relation_id: u32,
    pub new: TupleData,
}

/// UPDATE carries the new row and, depending on REPLICA IDENTITY, either a
/// `'K'` key tuple or an `'O'` full old tuple (or neither).
#[derive(Debug, Clone)]
pub struct UpdateMessage {
    pub relation_id: u32,
    pub key: Option<TupleData>,
    pub old: Option<TupleData>,
    pub new: TupleData,
}

/// DELETE carries exactly one of a `'K'` key tuple or an `'O'` old tuple.
#[derive(Debug, Clone)]
pub struct DeleteMessage {
    pub relation_id: u32,
    pub key: Option<TupleData>,
    pub old: Option<TupleData>,
}

#[derive(Debug, Clone)]
pub struct TupleData {
    pub columns: Vec<ColumnValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    /// TOASTed value not included in the message; same as the prior value.
    UnchangedToast,
    Text(String),
}

/// Decoder for pgoutput binary protocol messages.
pub struct PgOutputDecoder;

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Decode exactly one pgoutput message from a payload buffer.
    pub fn decode(&self, data: &[u8]) -> DecodeResult<PgOutputMessage> {
        if data.is_empty() {
            return Err(DecodeError::TruncatedMessage);
        }

        let payload = &data[1..];
        match data[0] {
            b'B' => self.decode_begin(payload),
            b'C' => self.decode_commit(payload),
            b'R' => self.decode_relation(payload),
            b'I' => self.decode_insert(payload),
            b'U' => self.decode_update(payload),
            b'D' => self.decode_delete(payload),
            other => Err(DecodeError::UnknownMessageType(other)),
        }
    }

    fn decode_begin(&self, data: &[u8]) -> DecodeResult<PgOutputMessage> {
        let mut cursor = Cursor::new(data);
        let final_lsn = cursor.read_u64::<BigEndian>()?;
        let commit_time = cursor.read_i64::<BigEndian>()?;
        let xid = cursor.read_u32::<BigEndian>()?;

        Ok(PgOutputMessage::Begin(BeginMessage {
            final_lsn,
            commit_time,
            xid,
        }))
    }

    fn decode_commit(&self, data: &[u8]) -> DecodeResult<PgOutputMessage> {
        let mut cursor = Cursor::new(data);
        let flags = cursor.read_u8()?;
        let commit_lsn = cursor.read_u64::<BigEndian>()?;
        let end_lsn = cursor.read_u64::<BigEndian>()?;
        let commit_time = cursor.read_i64::<BigEndian>()?;

        Ok(PgOutputMessage::Commit(CommitMessage {
            flags,
            commit_lsn,
            end_lsn,
            commit_time,
        }))
    }

    fn decode_relation(&self, data: &[u8]) -> DecodeResult<PgOutputMessage> {
        let mut cursor = Cursor::new(data);
        let relation_id = cursor.read_u32::<BigEndian>()?;
        let namespace = self.read_string(&mut cursor)?;
        let name = self.read_string(&mut cursor)?;
        let replica_identity = cursor.read_u8()?.into();
        let num_columns = cursor.read_u16::<BigEndian>()? as usize;

        let mut columns = Vec::with_capacity(num_columns);
        for _ in 0..num_columns {
            let flags = cursor.read_u8()?;
            let col_name = self.read_string(&mut cursor)?;
            let type_oid = cursor.read_u32::<BigEndian>()?;
            let type_modifier = cursor.read_i32::<BigEndian>()?;

            columns.push(ColumnInfo {
                flags,
                name: col_name,
                type_oid,
                type_modifier,
            });
        }

        Ok(PgOutputMessage::Relation(RelationMessage {
            relation_id,
            namespace,
            name,
            replica_identity,
            columns,
        }))
    }

    fn decode_insert(&self, data: &[u8]) -> DecodeResult<PgOutputMessage> {
        let mut cursor = Cursor::new(data);
        let relation_id = cursor.read_u32::<BigEndian>()?;

        let marker = cursor.read_u8()?;
        if marker != b'N' {
            return Err(DecodeError::UnexpectedTupleMarker(marker));
        }
        let new = self.decode_tuple(&mut cursor)?;

        Ok(PgOutputMessage::Insert(InsertMessage { relation_id, new }))
    }

    fn decode_update(&self, data: &[u8]) -> DecodeResult<PgOutputMessage> {
        let mut cursor = Cursor::new(data);
        let relation_id = cursor.read_u32::<BigEndian>()?;

        let mut key = None;
        let mut old = None;
        let mut marker = cursor.read_u8()?;
        match marker {
            b'K' => {
                key = Some(self.decode_tuple(&mut cursor)?);
                marker = cursor.read_u8()?;
            }
            b'O' => {
                old = Some(self.decode_tuple(&mut cursor)?);
                marker = cursor.read_u8()?;
            }
            _ => {}
        }
        if marker != b'N' {
            return Err(DecodeError::UnexpectedTupleMarker(marker));
        }
        let new = self.decode_tuple(&mut cursor)?;

        Ok(PgOutputMessage::Update(UpdateMessage {
            relation_id,
            key,
            old,
            new,
        }))
    }

    fn decode_delete(&self, data: &[u8]) -> DecodeResult<PgOutputMessage> {
        let mut cursor = Cursor::new(data);
        let relation_id = cursor.read_u32::<BigEndian>()?;

        let marker = cursor.read_u8()?;
        let (key, old) = match marker {
            b'K' => (Some(self.decode_tuple(&mut cursor)?), None),
            b'O' => (None, Some(self.decode_tuple(&mut cursor)?)),
            other => return Err(DecodeError::UnexpectedTupleMarker(other)),
        };

        Ok(PgOutputMessage::Delete(DeleteMessage {
            relation_id,
            key,
            old,
        }))
    }

    fn decode_tuple(&self, cursor: &mut Cursor<&[u8]>) -> DecodeResult<TupleData> {
        // Counts are u16 on the wire; reading them signed would let a
        // corrupt message turn into a huge capacity request.
        let num_columns = cursor.read_u16::<BigEndian>()? as usize;
        let mut columns = Vec::with_capacity(num_columns);

        for _ in 0..num_columns {
            let value = match cursor.read_u8()? {
                b'n' => ColumnValue::Null,
                b'u' => ColumnValue::UnchangedToast,
                b't' => {
                    let len = cursor.read_i32::<BigEndian>()? as usize;
                    let mut buf = vec![0u8; len];
                    cursor.read_exact(&mut buf)?;
                    ColumnValue::Text(String::from_utf8_lossy(&buf).into_owned())
                }
                b'b' => return Err(DecodeError::UnsupportedColumnType(b'b')),
                other => return Err(DecodeError::UnexpectedTupleMarker(other)),
            };
            columns.push(value);
        }

        Ok(TupleData { columns })
    }

    /// Read a null-terminated string.
    fn read_string(&self, cursor: &mut Cursor<&[u8]>) -> DecodeResult<String> {
        let mut bytes = Vec::new();
        loop {
            let b = cursor.read_u8()?;
            if b == 0 {
                break;
            }
            bytes.push(b);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl Default for PgOutputDecoder {
    fn default() -> Self {
        Self::new()
    }
}
