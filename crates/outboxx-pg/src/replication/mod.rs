//! Streaming logical replication over the PostgreSQL wire protocol.
//!
//! The server pushes row-level changes in pgoutput format over a CopyBoth
//! session; this module decodes them and turns them into change events.

pub mod lsn;
pub mod pgoutput;
pub mod preflight;
pub mod protocol;
pub mod registry;
pub mod source;

pub use lsn::{format_lsn, parse_lsn};
pub use pgoutput::{DecodeError, PgOutputDecoder, PgOutputMessage};
pub use preflight::{check_replication_setup, ensure_replication_setup, ReplicationSetup};
pub use protocol::{ReplicationConnection, ReplicationFrame, StatusUpdate};
pub use registry::{RelationInfo, RelationRegistry};
pub use source::{ChangeBatch, PostgresSource};
