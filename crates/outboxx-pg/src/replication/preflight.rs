//! Startup checks against a regular (non-replication) connection.
//!
//! The pipeline never creates slots or publications; it verifies they exist
//! and reads the slot's confirmed position, so a misconfigured deployment
//! fails with a clear error instead of a rejected START_REPLICATION.

use tokio_postgres::NoTls;
use tracing::{error, info};

use super::lsn::{format_lsn, parse_lsn};
use crate::error::{PgError, PgResult};

/// What the server reports about the configured slot and publication.
#[derive(Debug, Clone)]
pub struct ReplicationSetup {
    pub slot_exists: bool,
    pub publication_exists: bool,
    /// The slot's `confirmed_flush_lsn`, when the slot exists and has one.
    pub confirmed_flush_lsn: Option<u64>,
}

/// Query the server for the slot and publication state.
pub async fn check_replication_setup(
    conn_string: &str,
    slot: &str,
    publication: &str,
) -> PgResult<ReplicationSetup> {
    let (client, connection) = tokio_postgres::connect(conn_string, NoTls)
        .await
        .map_err(|e| PgError::ConnectionFailed(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!(error = %e, "postgres connection error");
        }
    });

    let slot_row = client
        .query_opt(
            "SELECT confirmed_flush_lsn::text FROM pg_replication_slots WHERE slot_name = $1",
            &[&slot],
        )
        .await?;
    let (slot_exists, confirmed_flush_lsn) = match slot_row {
        Some(row) => {
            let lsn: Option<String> = row.get(0);
            (true, lsn.as_deref().map(parse_lsn).transpose()?)
        }
        None => (false, None),
    };

    let publication_exists: bool = client
        .query_one(
            "SELECT EXISTS(SELECT 1 FROM pg_publication WHERE pubname = $1)",
            &[&publication],
        )
        .await?
        .get(0);

    Ok(ReplicationSetup {
        slot_exists,
        publication_exists,
        confirmed_flush_lsn,
    })
}

/// Fail fast when the slot or publication is missing.
pub async fn ensure_replication_setup(
    conn_string: &str,
    slot: &str,
    publication: &str,
) -> PgResult<ReplicationSetup> {
    let setup = check_replication_setup(conn_string, slot, publication).await?;

    if !setup.slot_exists {
        return Err(PgError::SlotNotFound(slot.to_string()));
    }
    if !setup.publication_exists {
        return Err(PgError::PublicationNotFound(publication.to_string()));
    }

    info!(
        slot,
        publication,
        confirmed_flush_lsn = ?setup.confirmed_flush_lsn.map(format_lsn),
        "replication setup verified"
    );
    Ok(setup)
}
