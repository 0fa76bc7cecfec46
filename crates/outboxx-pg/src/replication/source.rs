//! Streaming change-event source.
//!
//! Drives the replication protocol, assembles decoded pgoutput messages
//! into whole-transaction runs of change events, and reports LSN feedback.
//! Events from a transaction become visible only after its Commit, so an
//! acknowledged LSN can never sit inside an open transaction.

use std::mem;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use outboxx_core::{ChangeEvent, EventData, Meta, Operation, RowData, Value};

use super::lsn::format_lsn;
use super::pgoutput::{
    ColumnInfo, ColumnValue, DecodeError, DeleteMessage, InsertMessage, PgOutputDecoder,
    PgOutputMessage, TupleData, UpdateMessage,
};
use super::protocol::{ReplicationConnection, ReplicationFrame, StatusUpdate};
use super::registry::{RelationInfo, RelationRegistry};
use crate::error::{PgError, PgResult};

/// Seconds between the Unix and PostgreSQL epochs.
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

/// Whole transactions' worth of change events plus the position to
/// acknowledge once every one of them is durably published.
#[derive(Debug)]
pub struct ChangeBatch {
    pub changes: Vec<ChangeEvent>,
    /// `end_lsn` of the last Commit contained in (or before) this batch.
    pub last_lsn: u64,
}

/// The transaction currently being staged between Begin and Commit.
struct OpenTransaction {
    xid: u32,
    /// Commit time from Begin, microseconds since the PostgreSQL epoch.
    commit_time: i64,
    events: Vec<ChangeEvent>,
}

/// Assembles decoded messages into committed event runs.
///
/// Kept separate from the connection so transaction semantics are testable
/// without a server.
struct EventAssembler {
    registry: RelationRegistry,
    txn: Option<OpenTransaction>,
    /// Committed events not yet handed out in a batch.
    ready: Vec<ChangeEvent>,
    /// `end_lsn` of the most recent Commit.
    committed_lsn: u64,
}

impl EventAssembler {
    fn new() -> Self {
        Self {
            registry: RelationRegistry::new(),
            txn: None,
            ready: Vec::new(),
            committed_lsn: 0,
        }
    }

    /// Apply one decoded message. `frame_lsn` is the WAL start of the frame
    /// that carried it and becomes the event's `meta.lsn`.
    fn apply(&mut self, msg: PgOutputMessage, frame_lsn: u64) -> PgResult<()> {
        match msg {
            PgOutputMessage::Begin(begin) => {
                if self.txn.is_some() {
                    warn!(xid = begin.xid, "begin while a transaction is open, discarding prior state");
                }
                self.txn = Some(OpenTransaction {
                    xid: begin.xid,
                    commit_time: begin.commit_time,
                    events: Vec::new(),
                });
            }
            PgOutputMessage::Commit(commit) => match self.txn.take() {
                Some(txn) => {
                    debug!(
                        xid = txn.xid,
                        count = txn.events.len(),
                        end_lsn = %format_lsn(commit.end_lsn),
                        "transaction committed"
                    );
                    self.ready.extend(txn.events);
                    self.committed_lsn = commit.end_lsn;
                }
                None => warn!("commit without begin, ignoring"),
            },
            PgOutputMessage::Relation(relation) => {
                debug!(
                    relation_id = relation.relation_id,
                    schema = %relation.namespace,
                    table = %relation.name,
                    "registering relation metadata"
                );
                self.registry.register(&relation);
            }
            PgOutputMessage::Insert(insert) => {
                let event = self.insert_event(&insert, frame_lsn)?;
                self.stage(event);
            }
            PgOutputMessage::Update(update) => {
                let event = self.update_event(&update, frame_lsn)?;
                self.stage(event);
            }
            PgOutputMessage::Delete(delete) => {
                let event = self.delete_event(&delete, frame_lsn)?;
                self.stage(event);
            }
        }
        Ok(())
    }

    fn stage(&mut self, event: ChangeEvent) {
        match self.txn.as_mut() {
            Some(txn) => txn.events.push(event),
            None => warn!(
                resource = %event.meta.resource,
                "row change outside a transaction, dropping"
            ),
        }
    }

    fn take_batch(&mut self) -> ChangeBatch {
        ChangeBatch {
            changes: mem::take(&mut self.ready),
            last_lsn: self.committed_lsn,
        }
    }

    fn lookup(&self, relation_id: u32) -> PgResult<&RelationInfo> {
        self.registry
            .get(relation_id)
            .ok_or(PgError::UnknownRelation(relation_id))
    }

    fn insert_event(&self, msg: &InsertMessage, lsn: u64) -> PgResult<ChangeEvent> {
        let relation = self.lookup(msg.relation_id)?;
        let row = tuple_to_row(&msg.new, &relation.columns);
        Ok(ChangeEvent {
            op: Operation::Insert,
            data: EventData::Row(row),
            meta: self.meta(relation, lsn),
        })
    }

    fn update_event(&self, msg: &UpdateMessage, lsn: u64) -> PgResult<ChangeEvent> {
        let relation = self.lookup(msg.relation_id)?;
        let new = tuple_to_row(&msg.new, &relation.columns);
        let old = msg
            .old
            .as_ref()
            .or(msg.key.as_ref())
            .map(|tuple| tuple_to_row(tuple, &relation.columns))
            .unwrap_or_default();
        Ok(ChangeEvent {
            op: Operation::Update,
            data: EventData::Diff { new, old },
            meta: self.meta(relation, lsn),
        })
    }

    fn delete_event(&self, msg: &DeleteMessage, lsn: u64) -> PgResult<ChangeEvent> {
        let relation = self.lookup(msg.relation_id)?;
        let tuple = msg.key.as_ref().or(msg.old.as_ref()).ok_or_else(|| {
            PgError::InvalidMessage("delete without key or old tuple".to_string())
        })?;
        let row = tuple_to_row(tuple, &relation.columns);
        Ok(ChangeEvent {
            op: Operation::Delete,
            data: EventData::Row(row),
            meta: self.meta(relation, lsn),
        })
    }

    fn meta(&self, relation: &RelationInfo, lsn: u64) -> Meta {
        Meta::postgres(
            relation.namespace.as_str(),
            relation.name.as_str(),
            self.event_timestamp(),
            Some(format_lsn(lsn)),
        )
    }

    /// Commit time of the open transaction as Unix seconds; wall clock if a
    /// row somehow arrives outside one.
    fn event_timestamp(&self) -> i64 {
        match self.txn.as_ref() {
            Some(txn) => pg_micros_to_unix_secs(txn.commit_time),
            None => chrono::Utc::now().timestamp(),
        }
    }
}

/// Convert a decoded tuple into an ordered row using the relation's column
/// names. Unchanged TOAST values are represented as null.
fn tuple_to_row(tuple: &TupleData, columns: &[ColumnInfo]) -> RowData {
    let mut row = RowData::with_capacity(tuple.columns.len());
    for (value, info) in tuple.columns.iter().zip(columns.iter()) {
        let value = match value {
            ColumnValue::Null | ColumnValue::UnchangedToast => Value::Null,
            ColumnValue::Text(s) => text_to_value(s, info.type_oid),
        };
        row.push(info.name.as_str(), value);
    }
    row
}

/// Map a text-format value to a typed one for common type OIDs; anything
/// unrecognized keeps PostgreSQL's canonical text rendering.
fn text_to_value(s: &str, type_oid: u32) -> Value {
    match type_oid {
        16 => Value::Bool(s == "t" || s == "true"), // bool
        20 | 21 | 23 => s
            .parse::<i64>()
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Text(s.to_string())), // int8, int2, int4
        700 | 701 | 1700 => s
            .parse::<f64>()
            .map(Value::Float)
            .unwrap_or_else(|_| Value::Text(s.to_string())), // float4, float8, numeric
        114 | 3802 => serde_json::from_str::<serde_json::Value>(s)
            .map(Value::from)
            .unwrap_or_else(|_| Value::Text(s.to_string())), // json, jsonb
        _ => Value::Text(s.to_string()),
    }
}

fn pg_micros_to_unix_secs(micros: i64) -> i64 {
    micros / 1_000_000 + PG_EPOCH_OFFSET_SECS
}

/// Next position to acknowledge. The source may advance to the observed
/// server position only once everything it handed out has been fed back
/// and no transaction is staged; otherwise it holds at the delivered LSN so
/// no unflushed change is confirmed. The staged-transaction check matters
/// because the observed WAL end already covers frames of a transaction
/// whose Commit has not been decoded yet.
fn ack_position(delivered: u64, committed: u64, observed: u64, txn_open: bool) -> u64 {
    if txn_open || delivered < committed {
        delivered
    } else {
        delivered.max(observed)
    }
}

/// The streaming source: protocol loop, batching, and LSN feedback.
pub struct PostgresSource {
    conn: ReplicationConnection,
    decoder: PgOutputDecoder,
    assembler: EventAssembler,
    /// Last LSN the processor fed back after a successful publish.
    delivered_lsn: u64,
    /// High-water server WAL end seen in frames and keepalives.
    observed_wal_end: u64,
}

impl PostgresSource {
    /// Connect in replication mode and start streaming from `start_lsn`.
    pub async fn connect(
        conn_string: &str,
        slot: &str,
        publication: &str,
        start_lsn: u64,
    ) -> PgResult<Self> {
        let mut conn = ReplicationConnection::connect(conn_string).await?;
        conn.start_replication(slot, publication, start_lsn).await?;

        info!(slot, publication, start_lsn = %format_lsn(start_lsn), "streaming source connected");

        Ok(Self {
            conn,
            decoder: PgOutputDecoder::new(),
            assembler: EventAssembler::new(),
            delivered_lsn: start_lsn,
            observed_wal_end: start_lsn,
        })
    }

    /// Collect change events until `target_size` is reached or `deadline`
    /// elapses, whichever comes first. Only whole transactions are returned;
    /// a batch may exceed `target_size` when a single transaction does.
    pub async fn receive_batch(
        &mut self,
        target_size: usize,
        deadline: Duration,
    ) -> PgResult<ChangeBatch> {
        let deadline_at = Instant::now() + deadline;

        while self.assembler.ready.len() < target_size {
            let remaining = deadline_at.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match self.conn.receive_message(remaining).await? {
                None => break,
                Some(ReplicationFrame::Keepalive(keepalive)) => {
                    self.observed_wal_end = self.observed_wal_end.max(keepalive.wal_end);
                    if keepalive.reply_requested {
                        self.send_status().await?;
                    }
                }
                Some(ReplicationFrame::XLogData(xlog)) => {
                    self.observed_wal_end = self.observed_wal_end.max(xlog.wal_end);
                    match self.decoder.decode(&xlog.payload) {
                        Ok(msg) => self.assembler.apply(msg, xlog.wal_start)?,
                        // Future message types from a newer server are
                        // skipped; structural errors break transaction
                        // boundaries and are fatal.
                        Err(DecodeError::UnknownMessageType(tag)) => {
                            warn!(tag = %format_args!("0x{:02X}", tag), "skipping unknown pgoutput message");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        Ok(self.assembler.take_batch())
    }

    /// Acknowledge everything at or before `lsn` as durably published.
    /// Clamped so the confirmed position never regresses.
    pub async fn send_feedback(&mut self, lsn: u64) -> PgResult<()> {
        self.delivered_lsn = self.delivered_lsn.max(lsn);
        self.send_status().await
    }

    async fn send_status(&mut self) -> PgResult<()> {
        let lsn = ack_position(
            self.delivered_lsn,
            self.assembler.committed_lsn,
            self.observed_wal_end,
            self.assembler.txn.is_some(),
        );
        self.conn
            .send_status_update(StatusUpdate::acknowledging(lsn))
            .await
    }
}
