//! CopyBoth framing for the streaming replication protocol.
//!
//! After `START_REPLICATION` the connection switches to CopyBoth mode: the
//! server pushes `'w'` XLogData and `'k'` keepalive frames, the client
//! answers with `'r'` standby status updates. All integers are big-endian;
//! timestamps are microseconds since 2000-01-01 00:00:00 UTC.

use std::io::Cursor;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio_postgres::{Client, CopyBothDuplex, NoTls};
use tracing::{debug, error, info};

use super::lsn::format_lsn;
use crate::error::{PgError, PgResult};

/// Microseconds between the Unix and PostgreSQL epochs.
const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// Size of an encoded standby status update: tag + 4 × 8-byte fields + flag.
const STATUS_UPDATE_LEN: usize = 34;

/// One WAL data frame carrying a single pgoutput message.
#[derive(Debug, Clone)]
pub struct XLogData {
    pub wal_start: u64,
    pub wal_end: u64,
    /// Server clock, microseconds since the PostgreSQL epoch.
    pub timestamp: i64,
    pub payload: Bytes,
}

/// Server heartbeat; `reply_requested` demands an immediate status update.
#[derive(Debug, Clone, Copy)]
pub struct PrimaryKeepalive {
    pub wal_end: u64,
    pub timestamp: i64,
    pub reply_requested: bool,
}

/// A parsed CopyBoth frame from the server.
#[derive(Debug, Clone)]
pub enum ReplicationFrame {
    XLogData(XLogData),
    Keepalive(PrimaryKeepalive),
}

/// Outbound standby status update.
#[derive(Debug, Clone, Copy)]
pub struct StatusUpdate {
    pub wal_write: u64,
    pub wal_flush: u64,
    pub wal_apply: u64,
    pub reply_requested: bool,
}

impl StatusUpdate {
    /// Status update acknowledging a single position for write/flush/apply.
    pub fn acknowledging(lsn: u64) -> Self {
        Self {
            wal_write: lsn,
            wal_flush: lsn,
            wal_apply: lsn,
            reply_requested: false,
        }
    }
}

/// One streaming-replication connection.
///
/// There is no internal retry: every I/O failure surfaces as a typed error
/// and the caller is expected to rebuild the connection (or the process) to
/// resume from the slot's confirmed position.
pub struct ReplicationConnection {
    client: Client,
    stream: Option<Pin<Box<CopyBothDuplex<Bytes>>>>,
}

impl ReplicationConnection {
    /// Open a connection in logical replication mode.
    pub async fn connect(conn_string: &str) -> PgResult<Self> {
        let replication_string = format!("{} replication=database gssencmode=disable", conn_string);

        let (client, connection) = tokio_postgres::connect(&replication_string, NoTls)
            .await
            .map_err(|e| PgError::ConnectionFailed(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "replication connection error");
            }
        });

        Ok(Self {
            client,
            stream: None,
        })
    }

    /// Issue `START_REPLICATION` and switch the connection into CopyBoth
    /// mode. The slot and publication must already exist.
    pub async fn start_replication(
        &mut self,
        slot: &str,
        publication: &str,
        start_lsn: u64,
    ) -> PgResult<()> {
        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {} (proto_version '1', publication_names '{}')",
            slot,
            format_lsn(start_lsn),
            publication
        );
        info!(slot, publication, start_lsn = %format_lsn(start_lsn), "starting replication");

        let duplex = self
            .client
            .copy_both_simple::<Bytes>(&query)
            .await
            .map_err(|e| PgError::StartReplicationFailed(e.to_string()))?;
        self.stream = Some(Box::pin(duplex));

        Ok(())
    }

    /// Wait up to `timeout` for one CopyBoth frame.
    ///
    /// Returns `None` if no complete frame arrived in time; the
    /// caller owns the deadline so it can layer its own batching windows.
    pub async fn receive_message(&mut self, timeout: Duration) -> PgResult<Option<ReplicationFrame>> {
        let stream = self.stream_mut()?;

        match tokio::time::timeout(timeout, stream.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(PgError::StreamClosed),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(Some(Ok(frame))) => parse_frame(frame).map(Some),
        }
    }

    /// Write one standby status update and flush it.
    pub async fn send_status_update(&mut self, update: StatusUpdate) -> PgResult<()> {
        let message = encode_status_update(&update, pg_epoch_micros());
        debug!(
            wal_flush = %format_lsn(update.wal_flush),
            reply_requested = update.reply_requested,
            "sending standby status update"
        );

        let stream = self.stream_mut()?;
        stream
            .send(message)
            .await
            .map_err(|e| PgError::SendFeedbackFailed(e.to_string()))
    }

    fn stream_mut(&mut self) -> PgResult<&mut Pin<Box<CopyBothDuplex<Bytes>>>> {
        self.stream
            .as_mut()
            .ok_or_else(|| PgError::InvalidMessage("replication has not been started".to_string()))
    }
}

/// Parse one CopyBoth payload into a frame.
fn parse_frame(frame: Bytes) -> PgResult<ReplicationFrame> {
    let mut cursor = Cursor::new(frame.as_ref());
    let tag = cursor
        .read_u8()
        .map_err(|_| PgError::InvalidMessage("empty frame".to_string()))?;

    match tag {
        b'w' => {
            let wal_start = read_u64(&mut cursor)?;
            let wal_end = read_u64(&mut cursor)?;
            let timestamp = read_i64(&mut cursor)?;
            let payload = frame.slice(cursor.position() as usize..);
            Ok(ReplicationFrame::XLogData(XLogData {
                wal_start,
                wal_end,
                timestamp,
                payload,
            }))
        }
        b'k' => {
            let wal_end = read_u64(&mut cursor)?;
            let timestamp = read_i64(&mut cursor)?;
            let reply_requested = cursor
                .read_u8()
                .map_err(|_| PgError::InvalidMessage("truncated keepalive frame".to_string()))?
                != 0;
            Ok(ReplicationFrame::Keepalive(PrimaryKeepalive {
                wal_end,
                timestamp,
                reply_requested,
            }))
        }
        other => Err(PgError::InvalidMessage(format!(
            "unknown frame tag 0x{:02X}",
            other
        ))),
    }
}

fn read_u64(cursor: &mut Cursor<&[u8]>) -> PgResult<u64> {
    cursor
        .read_u64::<BigEndian>()
        .map_err(|_| PgError::InvalidMessage("truncated frame".to_string()))
}

fn read_i64(cursor: &mut Cursor<&[u8]>) -> PgResult<i64> {
    cursor
        .read_i64::<BigEndian>()
        .map_err(|_| PgError::InvalidMessage("truncated frame".to_string()))
}

/// Encode the 34-byte `'r'` standby status update.
fn encode_status_update(update: &StatusUpdate, client_time_micros: i64) -> Bytes {
    let mut buf = BytesMut::with_capacity(STATUS_UPDATE_LEN);
    buf.put_u8(b'r');
    buf.put_u64(update.wal_write);
    buf.put_u64(update.wal_flush);
    buf.put_u64(update.wal_apply);
    buf.put_i64(client_time_micros);
    buf.put_u8(u8::from(update.reply_requested));
    buf.freeze()
}

/// Current wall clock as microseconds since the PostgreSQL epoch.
fn pg_epoch_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64 - PG_EPOCH_OFFSET_MICROS)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_xlogdata_frame() {
        let mut frame = vec![b'w'];
        frame.extend_from_slice(&0x16_B374_D848u64.to_be_bytes()); // wal_start
        frame.extend_from_slice(&0x16_B374_D900u64.to_be_bytes()); // wal_end
        frame.extend_from_slice(&789i64.to_be_bytes()); // timestamp
        frame.extend_from_slice(b"payload-bytes");

        match parse_frame(Bytes::from(frame)).unwrap() {
            ReplicationFrame::XLogData(x) => {
                assert_eq!(x.wal_start, 0x16_B374_D848);
                assert_eq!(x.wal_end, 0x16_B374_D900);
                assert_eq!(x.timestamp, 789);
                assert_eq!(&x.payload[..], b"payload-bytes");
            }
            other => panic!("expected XLogData, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_keepalive_frame() {
        let mut frame = vec![b'k'];
        frame.extend_from_slice(&42u64.to_be_bytes());
        frame.extend_from_slice(&7i64.to_be_bytes());
        frame.push(1);

        match parse_frame(Bytes::from(frame)).unwrap() {
            ReplicationFrame::Keepalive(k) => {
                assert_eq!(k.wal_end, 42);
                assert_eq!(k.timestamp, 7);
                assert!(k.reply_requested);
            }
            other => panic!("expected Keepalive, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_keepalive_without_reply_request() {
        let mut frame = vec![b'k'];
        frame.extend_from_slice(&42u64.to_be_bytes());
        frame.extend_from_slice(&7i64.to_be_bytes());
        frame.push(0);

        match parse_frame(Bytes::from(frame)).unwrap() {
            ReplicationFrame::Keepalive(k) => assert!(!k.reply_requested),
            other => panic!("expected Keepalive, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_frame_tag() {
        assert!(matches!(
            parse_frame(Bytes::from_static(b"z1234")),
            Err(PgError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_parse_truncated_frame() {
        assert!(matches!(
            parse_frame(Bytes::from_static(b"")),
            Err(PgError::InvalidMessage(_))
        ));
        assert!(matches!(
            parse_frame(Bytes::from_static(b"w\x00\x00")),
            Err(PgError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_encode_status_update_layout() {
        let update = StatusUpdate {
            wal_write: 0x0102_0304_0506_0708,
            wal_flush: 0x1112_1314_1516_1718,
            wal_apply: 0x2122_2324_2526_2728,
            reply_requested: true,
        };
        let encoded = encode_status_update(&update, 0x3132_3334_3536_3738);

        assert_eq!(encoded.len(), STATUS_UPDATE_LEN);
        assert_eq!(encoded[0], b'r');
        assert_eq!(&encoded[1..9], &0x0102_0304_0506_0708u64.to_be_bytes());
        assert_eq!(&encoded[9..17], &0x1112_1314_1516_1718u64.to_be_bytes());
        assert_eq!(&encoded[17..25], &0x2122_2324_2526_2728u64.to_be_bytes());
        assert_eq!(&encoded[25..33], &0x3132_3334_3536_3738i64.to_be_bytes());
        assert_eq!(encoded[33], 1);
    }

    #[test]
    fn test_encode_status_update_no_reply() {
        let encoded = encode_status_update(&StatusUpdate::acknowledging(5), 0);
        assert_eq!(encoded[33], 0);
        assert_eq!(&encoded[1..9], &5u64.to_be_bytes());
        assert_eq!(&encoded[9..17], &5u64.to_be_bytes());
        assert_eq!(&encoded[17..25], &5u64.to_be_bytes());
    }
}
