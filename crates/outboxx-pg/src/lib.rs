//! PostgreSQL streaming logical replication: the CopyBoth protocol client,
//! the pgoutput binary decoder, the relation registry, and the change-event
//! source that assembles whole transactions into batches.

mod error;
pub mod replication;

pub use error::{PgError, PgResult};
pub use replication::lsn::{format_lsn, parse_lsn};
pub use replication::preflight::{ensure_replication_setup, ReplicationSetup};
pub use replication::source::{ChangeBatch, PostgresSource};
