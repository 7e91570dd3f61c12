//! SQLite implementation of the session store

use std::fs;
use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::records::{
    CommitReceipt, CommitRequest, EnqueueOutcome, HistoryRecord, Lease, NewHistoryRecord, NewSignal, ProjectionRecord,
    SignalRecord, SignalStatus, SnapshotRecord, TicketRecord,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS instance_snapshot (
        instance_id TEXT PRIMARY KEY,
        generation INTEGER NOT NULL,
        version INTEGER NOT NULL,
        stage TEXT NOT NULL,
        terminal INTEGER NOT NULL,
        body TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS activity_history (
        instance_id TEXT NOT NULL,
        sequence_no INTEGER NOT NULL,
        generation INTEGER NOT NULL,
        version INTEGER NOT NULL,
        kind TEXT NOT NULL,
        task_id TEXT,
        payload TEXT NOT NULL,
        recorded_at INTEGER NOT NULL,
        PRIMARY KEY (instance_id, sequence_no)
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_history_task_id
        ON activity_history(task_id) WHERE task_id IS NOT NULL;

    CREATE TABLE IF NOT EXISTS signal_queue (
        instance_id TEXT NOT NULL,
        signal_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        critical INTEGER NOT NULL,
        status TEXT NOT NULL,
        payload TEXT NOT NULL,
        received_at INTEGER NOT NULL,
        PRIMARY KEY (instance_id, signal_id)
    );

    CREATE INDEX IF NOT EXISTS idx_signal_queue_pending
        ON signal_queue(instance_id, status, critical, seq);

    CREATE TABLE IF NOT EXISTS leases (
        instance_id TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        token TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS tickets (
        ticket_id TEXT PRIMARY KEY,
        instance_id TEXT NOT NULL,
        body TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        delivered_at INTEGER
    );

    CREATE TABLE IF NOT EXISTS projections (
        instance_id TEXT PRIMARY KEY,
        generation INTEGER NOT NULL,
        version INTEGER NOT NULL,
        body TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    );
";

const SNAPSHOT_COLUMNS: &str = "instance_id, generation, version, stage, terminal, body, updated_at";
const HISTORY_COLUMNS: &str = "instance_id, sequence_no, generation, version, kind, task_id, payload, recorded_at";
const SIGNAL_COLUMNS: &str = "instance_id, signal_id, seq, critical, status, payload, received_at";
const TICKET_COLUMNS: &str = "ticket_id, instance_id, body, created_at, delivered_at";

type RawSnapshot = (String, i64, i64, String, bool, String, i64);
type RawHistory = (String, i64, i64, i64, String, Option<String>, String, i64);
type RawSignal = (String, String, i64, bool, String, String, i64);
type RawTicket = (String, String, String, i64, Option<i64>);

/// Durable store backed by a single SQLite database
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database file at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "open: called");
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "Opened session store");
        Ok(store)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        debug!("open_in_memory: called");
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    // === Instances ===

    /// Create an instance, or start a new generation of a terminal one
    ///
    /// Fails with `AlreadyExists` while a non-terminal instance has the same id.
    pub fn create_instance(
        &mut self,
        snapshot: SnapshotRecord,
        history: Vec<NewHistoryRecord>,
    ) -> Result<CommitReceipt, StoreError> {
        debug!(instance_id = %snapshot.instance_id, generation = snapshot.generation, "create_instance: called");
        let tx = self.conn.transaction()?;

        if let Some(existing) = load_snapshot_in(&tx, &snapshot.instance_id)? {
            if !existing.terminal {
                return Err(StoreError::AlreadyExists(snapshot.instance_id));
            }
            if snapshot.generation <= existing.generation {
                return Err(StoreError::InvalidCommit(format!(
                    "restart of {} must use a generation above {}",
                    snapshot.instance_id, existing.generation
                )));
            }
            let stale = tx.execute(
                "UPDATE signal_queue SET status = 'dropped' WHERE instance_id = ?1 AND status = 'pending'",
                params![snapshot.instance_id],
            )?;
            if stale > 0 {
                warn!(instance_id = %snapshot.instance_id, stale, "Dropped signals left over from previous generation");
            }
            tx.execute("DELETE FROM leases WHERE instance_id = ?1", params![snapshot.instance_id])?;
        }

        write_snapshot(&tx, &snapshot)?;
        let last_sequence_no = append_history(&tx, &snapshot.instance_id, snapshot.generation, snapshot.version, &history)?;
        tx.commit()?;

        info!(instance_id = %snapshot.instance_id, generation = snapshot.generation, "Instance created");
        Ok(CommitReceipt {
            version: snapshot.version,
            last_sequence_no,
        })
    }

    /// Latest snapshot for an instance
    pub fn load_snapshot(&self, instance_id: &str) -> Result<Option<SnapshotRecord>, StoreError> {
        debug!(%instance_id, "load_snapshot: called");
        load_snapshot_in(&self.conn, instance_id)
    }

    /// All snapshots, optionally excluding terminal instances
    pub fn list_snapshots(&self, include_terminal: bool) -> Result<Vec<SnapshotRecord>, StoreError> {
        debug!(include_terminal, "list_snapshots: called");
        let sql = if include_terminal {
            format!("SELECT {SNAPSHOT_COLUMNS} FROM instance_snapshot ORDER BY instance_id")
        } else {
            format!("SELECT {SNAPSHOT_COLUMNS} FROM instance_snapshot WHERE terminal = 0 ORDER BY instance_id")
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let raws = stmt
            .query_map([], read_snapshot_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(snapshot_from_raw).collect()
    }

    // === History ===

    /// History of an instance ordered by sequence number, optionally for one generation
    pub fn read_history(&self, instance_id: &str, generation: Option<u32>) -> Result<Vec<HistoryRecord>, StoreError> {
        debug!(%instance_id, ?generation, "read_history: called");
        let raws = match generation {
            Some(generation) => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {HISTORY_COLUMNS} FROM activity_history
                     WHERE instance_id = ?1 AND generation = ?2 ORDER BY sequence_no"
                ))?;
                stmt.query_map(params![instance_id, i64::from(generation)], read_history_row)?
                    .collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = self.conn.prepare(&format!(
                    "SELECT {HISTORY_COLUMNS} FROM activity_history WHERE instance_id = ?1 ORDER BY sequence_no"
                ))?;
                stmt.query_map(params![instance_id], read_history_row)?
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        raws.into_iter().map(history_from_raw).collect()
    }

    /// Recorded completion for a task id, if any
    pub fn find_task_completion(&self, task_id: &str) -> Result<Option<HistoryRecord>, StoreError> {
        debug!(%task_id, "find_task_completion: called");
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {HISTORY_COLUMNS} FROM activity_history WHERE task_id = ?1"),
                params![task_id],
                read_history_row,
            )
            .optional()?;
        raw.map(history_from_raw).transpose()
    }

    // === Leases ===

    /// Take the exclusive lease on an instance
    ///
    /// An unexpired lease held under another token fails with `LeaseHeld`.
    pub fn acquire_lease(
        &mut self,
        instance_id: &str,
        owner: &str,
        token: &str,
        now: i64,
        ttl_ms: i64,
    ) -> Result<Lease, StoreError> {
        debug!(%instance_id, %owner, "acquire_lease: called");
        let tx = self.conn.transaction()?;

        if load_snapshot_in(&tx, instance_id)?.is_none() {
            return Err(StoreError::NotFound(instance_id.to_string()));
        }

        let held: Option<(String, String, i64)> = tx
            .query_row(
                "SELECT owner, token, expires_at FROM leases WHERE instance_id = ?1",
                params![instance_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        if let Some((holder, held_token, expires_at)) = held {
            if held_token != token && expires_at > now {
                debug!(%instance_id, %holder, expires_at, "acquire_lease: lease busy");
                return Err(StoreError::LeaseHeld {
                    instance_id: instance_id.to_string(),
                    owner: holder,
                    expires_at,
                });
            }
        }

        let expires_at = now + ttl_ms;
        tx.execute(
            "INSERT INTO leases (instance_id, owner, token, expires_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(instance_id) DO UPDATE SET
                owner = excluded.owner, token = excluded.token, expires_at = excluded.expires_at",
            params![instance_id, owner, token, expires_at],
        )?;
        tx.commit()?;

        Ok(Lease {
            instance_id: instance_id.to_string(),
            owner: owner.to_string(),
            token: token.to_string(),
            expires_at,
        })
    }

    /// Push out the expiry of a lease still held under its token
    ///
    /// Returns the new expiry; `LeaseLost` once another owner has taken over.
    pub fn renew_lease(&mut self, lease: &Lease, now: i64, ttl_ms: i64) -> Result<i64, StoreError> {
        debug!(instance_id = %lease.instance_id, owner = %lease.owner, "renew_lease: called");
        let expires_at = now + ttl_ms;
        let updated = self.conn.execute(
            "UPDATE leases SET expires_at = MAX(expires_at, ?3) WHERE instance_id = ?1 AND token = ?2",
            params![lease.instance_id, lease.token, expires_at],
        )?;
        if updated == 0 {
            return Err(StoreError::LeaseLost(lease.instance_id.clone()));
        }
        Ok(expires_at)
    }

    /// Drop a lease; returns false if it was no longer ours
    pub fn release_lease(&mut self, lease: &Lease) -> Result<bool, StoreError> {
        debug!(instance_id = %lease.instance_id, owner = %lease.owner, "release_lease: called");
        let removed = self.conn.execute(
            "DELETE FROM leases WHERE instance_id = ?1 AND token = ?2",
            params![lease.instance_id, lease.token],
        )?;
        Ok(removed > 0)
    }

    // === Commits ===

    /// Apply one engine step atomically
    ///
    /// Checks lease ownership and `(generation, version)` before writing. On any
    /// error nothing is written.
    pub fn commit(&mut self, req: CommitRequest) -> Result<CommitReceipt, StoreError> {
        debug!(
            instance_id = %req.instance_id,
            expected_version = req.expected_version,
            advances = req.snapshot.is_some(),
            history = req.history.len(),
            acks = req.ack_signals.len(),
            "commit: called"
        );
        let tx = self.conn.transaction()?;

        let token: Option<String> = tx
            .query_row(
                "SELECT token FROM leases WHERE instance_id = ?1",
                params![req.instance_id],
                |row| row.get(0),
            )
            .optional()?;
        if token.as_deref() != Some(req.lease_token.as_str()) {
            return Err(StoreError::LeaseLost(req.instance_id));
        }

        let current =
            load_snapshot_in(&tx, &req.instance_id)?.ok_or_else(|| StoreError::NotFound(req.instance_id.clone()))?;
        if current.generation != req.expected_generation || current.version != req.expected_version {
            return Err(StoreError::VersionConflict {
                instance_id: req.instance_id,
                expected_generation: req.expected_generation,
                expected_version: req.expected_version,
                actual_generation: current.generation,
                actual_version: current.version,
            });
        }

        let version = match &req.snapshot {
            Some(snapshot) => {
                if snapshot.instance_id != req.instance_id
                    || snapshot.generation != req.expected_generation
                    || snapshot.version != req.expected_version + 1
                {
                    return Err(StoreError::InvalidCommit(format!(
                        "snapshot {}/{} does not follow {}/{}",
                        snapshot.generation, snapshot.version, req.expected_generation, req.expected_version
                    )));
                }
                write_snapshot(&tx, snapshot)?;
                snapshot.version
            }
            None => req.expected_version,
        };

        let last_sequence_no = append_history(&tx, &req.instance_id, req.expected_generation, version, &req.history)?;

        for signal_id in &req.ack_signals {
            let updated = tx.execute(
                "UPDATE signal_queue SET status = 'acked'
                 WHERE instance_id = ?1 AND signal_id = ?2 AND status = 'pending'",
                params![req.instance_id, signal_id],
            )?;
            if updated == 0 {
                warn!(instance_id = %req.instance_id, %signal_id, "commit: acked signal was not pending");
            }
        }

        for ticket in &req.tickets {
            tx.execute(
                &format!("INSERT OR IGNORE INTO tickets ({TICKET_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5)"),
                params![
                    ticket.ticket_id,
                    ticket.instance_id,
                    serde_json::to_string(&ticket.body)?,
                    ticket.created_at,
                    ticket.delivered_at
                ],
            )?;
        }

        tx.execute(
            "UPDATE leases SET expires_at = ?2 WHERE instance_id = ?1",
            params![req.instance_id, req.now + req.lease_ttl_ms],
        )?;
        tx.commit()?;

        debug!(instance_id = %req.instance_id, version, last_sequence_no, "commit: applied");
        Ok(CommitReceipt {
            version,
            last_sequence_no,
        })
    }

    // === Signals ===

    /// Offer a signal to an instance queue
    ///
    /// Duplicate ids are reported, not stored. When `capacity` pending signals
    /// already exist the oldest non-critical one is dropped; critical signals
    /// are always accepted.
    pub fn enqueue_signal(&mut self, signal: NewSignal, capacity: usize) -> Result<EnqueueOutcome, StoreError> {
        debug!(instance_id = %signal.instance_id, signal_id = %signal.signal_id, critical = signal.critical, "enqueue_signal: called");
        let tx = self.conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM signal_queue WHERE instance_id = ?1 AND signal_id = ?2)",
            params![signal.instance_id, signal.signal_id],
            |row| row.get(0),
        )?;
        if exists {
            debug!(signal_id = %signal.signal_id, "enqueue_signal: duplicate");
            return Ok(EnqueueOutcome::Duplicate);
        }

        let pending: i64 = tx.query_row(
            "SELECT COUNT(*) FROM signal_queue WHERE instance_id = ?1 AND status = 'pending'",
            params![signal.instance_id],
            |row| row.get(0),
        )?;
        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM signal_queue WHERE instance_id = ?1",
            params![signal.instance_id],
            |row| row.get(0),
        )?;

        let mut status = SignalStatus::Pending;
        let mut dropped = None;
        if pending as usize >= capacity {
            let oldest: Option<String> = tx
                .query_row(
                    "SELECT signal_id FROM signal_queue
                     WHERE instance_id = ?1 AND status = 'pending' AND critical = 0
                     ORDER BY seq LIMIT 1",
                    params![signal.instance_id],
                    |row| row.get(0),
                )
                .optional()?;
            match oldest {
                Some(victim) => {
                    tx.execute(
                        "UPDATE signal_queue SET status = 'dropped' WHERE instance_id = ?1 AND signal_id = ?2",
                        params![signal.instance_id, victim],
                    )?;
                    warn!(instance_id = %signal.instance_id, dropped = %victim, "Signal queue full, dropped oldest signal");
                    dropped = Some(victim);
                }
                None if !signal.critical => {
                    warn!(instance_id = %signal.instance_id, signal_id = %signal.signal_id, "Signal queue full of critical signals, rejecting");
                    status = SignalStatus::Dropped;
                }
                None => {}
            }
        }

        tx.execute(
            &format!("INSERT INTO signal_queue ({SIGNAL_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                signal.instance_id,
                signal.signal_id,
                seq,
                signal.critical,
                status.to_string(),
                serde_json::to_string(&signal.payload)?,
                signal.received_at
            ],
        )?;
        tx.commit()?;

        if status == SignalStatus::Dropped {
            return Ok(EnqueueOutcome::Rejected);
        }
        Ok(EnqueueOutcome::Accepted {
            seq: seq as u64,
            dropped,
        })
    }

    /// Pending signals, critical first, then in arrival order
    pub fn pending_signals(&self, instance_id: &str) -> Result<Vec<SignalRecord>, StoreError> {
        debug!(%instance_id, "pending_signals: called");
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SIGNAL_COLUMNS} FROM signal_queue
             WHERE instance_id = ?1 AND status = 'pending'
             ORDER BY critical DESC, seq ASC"
        ))?;
        let raws = stmt
            .query_map(params![instance_id], read_signal_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(signal_from_raw).collect()
    }

    /// Take a pending signal out of the queue without consuming it
    ///
    /// Returns false when the signal was not pending.
    pub fn drop_signal(&mut self, instance_id: &str, signal_id: &str) -> Result<bool, StoreError> {
        debug!(%instance_id, %signal_id, "drop_signal: called");
        let updated = self.conn.execute(
            "UPDATE signal_queue SET status = 'dropped'
             WHERE instance_id = ?1 AND signal_id = ?2 AND status = 'pending'",
            params![instance_id, signal_id],
        )?;
        Ok(updated > 0)
    }

    /// Look up one signal regardless of status
    pub fn get_signal(&self, instance_id: &str, signal_id: &str) -> Result<Option<SignalRecord>, StoreError> {
        debug!(%instance_id, %signal_id, "get_signal: called");
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {SIGNAL_COLUMNS} FROM signal_queue WHERE instance_id = ?1 AND signal_id = ?2"),
                params![instance_id, signal_id],
                read_signal_row,
            )
            .optional()?;
        raw.map(signal_from_raw).transpose()
    }

    // === Tickets ===

    /// Tickets, optionally for one instance and/or only undelivered ones
    pub fn list_tickets(&self, instance_id: Option<&str>, undelivered_only: bool) -> Result<Vec<TicketRecord>, StoreError> {
        debug!(?instance_id, undelivered_only, "list_tickets: called");
        let mut sql = format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE (?1 IS NULL OR instance_id = ?1)");
        if undelivered_only {
            sql.push_str(" AND delivered_at IS NULL");
        }
        sql.push_str(" ORDER BY created_at, ticket_id");
        let mut stmt = self.conn.prepare(&sql)?;
        let raws = stmt
            .query_map(params![instance_id], read_ticket_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(ticket_from_raw).collect()
    }

    /// Record that the external sink accepted a ticket
    pub fn mark_ticket_delivered(&mut self, ticket_id: &str, now: i64) -> Result<(), StoreError> {
        debug!(%ticket_id, "mark_ticket_delivered: called");
        let updated = self.conn.execute(
            "UPDATE tickets SET delivered_at = COALESCE(delivered_at, ?2) WHERE ticket_id = ?1",
            params![ticket_id, now],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("ticket {ticket_id}")));
        }
        Ok(())
    }

    // === Projections ===

    /// Publish a projection unless a newer one is already stored
    ///
    /// At equal versions the later timestamp wins; turn progress is committed
    /// without a version bump.
    ///
    /// Returns true when the record was written.
    pub fn put_projection(&mut self, projection: &ProjectionRecord) -> Result<bool, StoreError> {
        debug!(instance_id = %projection.instance_id, version = projection.version, "put_projection: called");
        let written = self.conn.execute(
            "INSERT INTO projections (instance_id, generation, version, body, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(instance_id) DO UPDATE SET
                generation = excluded.generation,
                version = excluded.version,
                body = excluded.body,
                updated_at = excluded.updated_at
             WHERE excluded.generation > projections.generation
                OR (excluded.generation = projections.generation AND excluded.version > projections.version)
                OR (excluded.generation = projections.generation AND excluded.version = projections.version
                    AND excluded.updated_at >= projections.updated_at)",
            params![
                projection.instance_id,
                i64::from(projection.generation),
                projection.version as i64,
                serde_json::to_string(&projection.body)?,
                projection.updated_at
            ],
        )?;
        Ok(written > 0)
    }

    /// Latest published projection
    pub fn load_projection(&self, instance_id: &str) -> Result<Option<ProjectionRecord>, StoreError> {
        debug!(%instance_id, "load_projection: called");
        let raw: Option<(String, i64, i64, String, i64)> = self
            .conn
            .query_row(
                "SELECT instance_id, generation, version, body, updated_at FROM projections WHERE instance_id = ?1",
                params![instance_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?;
        raw.map(|(instance_id, generation, version, body, updated_at)| {
            Ok(ProjectionRecord {
                instance_id,
                generation: generation as u32,
                version: version as u64,
                body: serde_json::from_str(&body)?,
                updated_at,
            })
        })
        .transpose()
    }
}

fn load_snapshot_in(conn: &Connection, instance_id: &str) -> Result<Option<SnapshotRecord>, StoreError> {
    let raw = conn
        .query_row(
            &format!("SELECT {SNAPSHOT_COLUMNS} FROM instance_snapshot WHERE instance_id = ?1"),
            params![instance_id],
            read_snapshot_row,
        )
        .optional()?;
    raw.map(snapshot_from_raw).transpose()
}

fn write_snapshot(conn: &Connection, snapshot: &SnapshotRecord) -> Result<(), StoreError> {
    conn.execute(
        &format!(
            "INSERT INTO instance_snapshot ({SNAPSHOT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(instance_id) DO UPDATE SET
                generation = excluded.generation,
                version = excluded.version,
                stage = excluded.stage,
                terminal = excluded.terminal,
                body = excluded.body,
                updated_at = excluded.updated_at"
        ),
        params![
            snapshot.instance_id,
            i64::from(snapshot.generation),
            snapshot.version as i64,
            snapshot.stage,
            snapshot.terminal,
            serde_json::to_string(&snapshot.body)?,
            snapshot.updated_at
        ],
    )?;
    Ok(())
}

/// Append records after the current tail; returns the last sequence number
fn append_history(
    conn: &Connection,
    instance_id: &str,
    generation: u32,
    version: u64,
    records: &[NewHistoryRecord],
) -> Result<u64, StoreError> {
    let mut next: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sequence_no), 0) + 1 FROM activity_history WHERE instance_id = ?1",
        params![instance_id],
        |row| row.get(0),
    )?;

    for record in records {
        if let Some(task_id) = &record.task_id {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM activity_history WHERE task_id = ?1)",
                params![task_id],
                |row| row.get(0),
            )?;
            if exists {
                return Err(StoreError::DuplicateTask(task_id.clone()));
            }
        }
        conn.execute(
            &format!("INSERT INTO activity_history ({HISTORY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                instance_id,
                next,
                i64::from(generation),
                version as i64,
                record.kind,
                record.task_id,
                serde_json::to_string(&record.payload)?,
                record.recorded_at
            ],
        )?;
        next += 1;
    }

    Ok((next - 1) as u64)
}

fn read_snapshot_row(row: &Row<'_>) -> rusqlite::Result<RawSnapshot> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn snapshot_from_raw(raw: RawSnapshot) -> Result<SnapshotRecord, StoreError> {
    let (instance_id, generation, version, stage, terminal, body, updated_at) = raw;
    Ok(SnapshotRecord {
        instance_id,
        generation: generation as u32,
        version: version as u64,
        stage,
        terminal,
        body: serde_json::from_str(&body)?,
        updated_at,
    })
}

fn read_history_row(row: &Row<'_>) -> rusqlite::Result<RawHistory> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn history_from_raw(raw: RawHistory) -> Result<HistoryRecord, StoreError> {
    let (instance_id, sequence_no, generation, version, kind, task_id, payload, recorded_at) = raw;
    Ok(HistoryRecord {
        instance_id,
        sequence_no: sequence_no as u64,
        generation: generation as u32,
        version: version as u64,
        kind,
        task_id,
        payload: serde_json::from_str(&payload)?,
        recorded_at,
    })
}

fn read_signal_row(row: &Row<'_>) -> rusqlite::Result<RawSignal> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn signal_from_raw(raw: RawSignal) -> Result<SignalRecord, StoreError> {
    let (instance_id, signal_id, seq, critical, status, payload, received_at) = raw;
    Ok(SignalRecord {
        instance_id,
        signal_id,
        seq: seq as u64,
        critical,
        status: SignalStatus::parse(&status),
        payload: serde_json::from_str(&payload)?,
        received_at,
    })
}

fn read_ticket_row(row: &Row<'_>) -> rusqlite::Result<RawTicket> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn ticket_from_raw(raw: RawTicket) -> Result<TicketRecord, StoreError> {
    let (ticket_id, instance_id, body, created_at, delivered_at) = raw;
    Ok(TicketRecord {
        ticket_id,
        instance_id,
        body: serde_json::from_str(&body)?,
        created_at,
        delivered_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn snapshot(id: &str, generation: u32, version: u64, stage: &str, terminal: bool) -> SnapshotRecord {
        SnapshotRecord {
            instance_id: id.to_string(),
            generation,
            version,
            stage: stage.to_string(),
            terminal,
            body: json!({ "stage": stage }),
            updated_at: 1_000 + version as i64,
        }
    }

    fn event(kind: &str, task_id: Option<&str>) -> NewHistoryRecord {
        NewHistoryRecord {
            kind: kind.to_string(),
            task_id: task_id.map(String::from),
            payload: json!({ "kind": kind }),
            recorded_at: 1_000,
        }
    }

    fn signal(id: &str, signal_id: &str, critical: bool) -> NewSignal {
        NewSignal {
            instance_id: id.to_string(),
            signal_id: signal_id.to_string(),
            critical,
            payload: json!({ "text": signal_id }),
            received_at: 1_000,
        }
    }

    fn commit_req(lease: &Lease, version: u64, advance: bool) -> CommitRequest {
        CommitRequest {
            instance_id: lease.instance_id.clone(),
            lease_token: lease.token.clone(),
            expected_generation: 1,
            expected_version: version,
            snapshot: advance.then(|| snapshot(&lease.instance_id, 1, version + 1, "PREFERENCES", false)),
            history: vec![event("transition", None)],
            ack_signals: vec![],
            tickets: vec![],
            now: 2_000,
            lease_ttl_ms: 30_000,
        }
    }

    fn started(store: &mut Store, id: &str) {
        store
            .create_instance(snapshot(id, 1, 0, "ONBOARDING", false), vec![event("started", None)])
            .unwrap();
    }

    #[test]
    fn test_create_and_load_snapshot() {
        let mut store = Store::open_in_memory().unwrap();
        started(&mut store, "inst-1");

        let loaded = store.load_snapshot("inst-1").unwrap().unwrap();
        assert_eq!(loaded.stage, "ONBOARDING");
        assert_eq!(loaded.version, 0);
        assert!(store.load_snapshot("missing").unwrap().is_none());

        let history = store.read_history("inst-1", None).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].sequence_no, 1);
    }

    #[test]
    fn test_create_rejects_live_instance() {
        let mut store = Store::open_in_memory().unwrap();
        started(&mut store, "inst-1");

        let err = store
            .create_instance(snapshot("inst-1", 2, 0, "ONBOARDING", false), vec![])
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[test]
    fn test_restart_terminal_instance_new_generation() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .create_instance(snapshot("inst-1", 1, 4, "COMPLETED", true), vec![event("started", None)])
            .unwrap();
        store.enqueue_signal(signal("inst-1", "late", false), 8).unwrap();

        let same_generation = store.create_instance(snapshot("inst-1", 1, 0, "ONBOARDING", false), vec![]);
        assert!(matches!(same_generation, Err(StoreError::InvalidCommit(_))));

        store
            .create_instance(snapshot("inst-1", 2, 0, "ONBOARDING", false), vec![event("started", None)])
            .unwrap();
        let loaded = store.load_snapshot("inst-1").unwrap().unwrap();
        assert_eq!(loaded.generation, 2);
        assert!(!loaded.terminal);
        assert!(store.pending_signals("inst-1").unwrap().is_empty());

        assert_eq!(store.read_history("inst-1", None).unwrap().len(), 2);
        assert_eq!(store.read_history("inst-1", Some(2)).unwrap().len(), 1);
    }

    #[test]
    fn test_lease_exclusive_until_expiry() {
        let mut store = Store::open_in_memory().unwrap();
        started(&mut store, "inst-1");

        let lease = store.acquire_lease("inst-1", "worker-a", "tok-a", 1_000, 500).unwrap();
        assert_eq!(lease.expires_at, 1_500);

        let busy = store.acquire_lease("inst-1", "worker-b", "tok-b", 1_200, 500);
        assert!(matches!(busy, Err(StoreError::LeaseHeld { .. })));

        let taken = store.acquire_lease("inst-1", "worker-b", "tok-b", 1_600, 500).unwrap();
        assert_eq!(taken.owner, "worker-b");

        // the original holder lost it
        assert!(!store.release_lease(&lease).unwrap());
        assert!(store.release_lease(&taken).unwrap());
    }

    #[test]
    fn test_renewed_lease_outlives_its_first_expiry() {
        let mut store = Store::open_in_memory().unwrap();
        started(&mut store, "inst-1");
        let lease = store.acquire_lease("inst-1", "worker-a", "tok-a", 1_000, 500).unwrap();

        assert_eq!(store.renew_lease(&lease, 1_400, 500).unwrap(), 1_900);
        let busy = store.acquire_lease("inst-1", "worker-b", "tok-b", 1_600, 500);
        assert!(matches!(busy, Err(StoreError::LeaseHeld { expires_at: 1_900, .. })));

        let taken = store.acquire_lease("inst-1", "worker-b", "tok-b", 2_000, 500).unwrap();
        assert!(matches!(store.renew_lease(&lease, 2_100, 500), Err(StoreError::LeaseLost(_))));
        assert!(store.release_lease(&taken).unwrap());
    }

    #[test]
    fn test_lease_on_missing_instance() {
        let mut store = Store::open_in_memory().unwrap();
        let err = store.acquire_lease("nope", "w", "t", 0, 10).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_commit_advances_version() {
        let mut store = Store::open_in_memory().unwrap();
        started(&mut store, "inst-1");
        let lease = store.acquire_lease("inst-1", "w", "tok", 1_000, 1_000).unwrap();

        let receipt = store.commit(commit_req(&lease, 0, true)).unwrap();
        assert_eq!(receipt.version, 1);
        assert_eq!(receipt.last_sequence_no, 2);

        let loaded = store.load_snapshot("inst-1").unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.stage, "PREFERENCES");

        let history = store.read_history("inst-1", Some(1)).unwrap();
        assert_eq!(history.last().unwrap().version, 1);
    }

    #[test]
    fn test_commit_without_snapshot_keeps_version() {
        let mut store = Store::open_in_memory().unwrap();
        started(&mut store, "inst-1");
        let lease = store.acquire_lease("inst-1", "w", "tok", 1_000, 1_000).unwrap();

        let receipt = store.commit(commit_req(&lease, 0, false)).unwrap();
        assert_eq!(receipt.version, 0);
        assert_eq!(store.load_snapshot("inst-1").unwrap().unwrap().version, 0);
    }

    #[test]
    fn test_commit_version_conflict() {
        let mut store = Store::open_in_memory().unwrap();
        started(&mut store, "inst-1");
        let lease = store.acquire_lease("inst-1", "w", "tok", 1_000, 1_000).unwrap();

        store.commit(commit_req(&lease, 0, true)).unwrap();
        let err = store.commit(commit_req(&lease, 0, true)).unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected_version: 0,
                actual_version: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_commit_requires_lease() {
        let mut store = Store::open_in_memory().unwrap();
        started(&mut store, "inst-1");
        let lease = store.acquire_lease("inst-1", "w", "tok", 1_000, 1_000).unwrap();
        store.release_lease(&lease).unwrap();

        let err = store.commit(commit_req(&lease, 0, true)).unwrap_err();
        assert!(matches!(err, StoreError::LeaseLost(_)));
        assert_eq!(store.load_snapshot("inst-1").unwrap().unwrap().version, 0);
    }

    #[test]
    fn test_commit_is_atomic_on_duplicate_task() {
        let mut store = Store::open_in_memory().unwrap();
        started(&mut store, "inst-1");
        let lease = store.acquire_lease("inst-1", "w", "tok", 1_000, 1_000).unwrap();
        store.enqueue_signal(signal("inst-1", "sig-1", false), 8).unwrap();

        let mut first = commit_req(&lease, 0, false);
        first.history = vec![event("activity_completed", Some("task-1"))];
        store.commit(first).unwrap();

        let mut second = commit_req(&lease, 0, true);
        second.history = vec![event("activity_completed", Some("task-1")), event("transition", None)];
        second.ack_signals = vec!["sig-1".to_string()];
        let err = store.commit(second).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateTask(_)));

        assert_eq!(store.load_snapshot("inst-1").unwrap().unwrap().version, 0);
        assert_eq!(store.read_history("inst-1", None).unwrap().len(), 2);
        assert_eq!(store.pending_signals("inst-1").unwrap().len(), 1);
        assert!(store.find_task_completion("task-1").unwrap().is_some());
        assert!(store.find_task_completion("task-2").unwrap().is_none());
    }

    #[test]
    fn test_commit_acks_signals_and_stores_tickets() {
        let mut store = Store::open_in_memory().unwrap();
        started(&mut store, "inst-1");
        let lease = store.acquire_lease("inst-1", "w", "tok", 1_000, 1_000).unwrap();
        store.enqueue_signal(signal("inst-1", "sig-1", false), 8).unwrap();

        let mut req = commit_req(&lease, 0, true);
        req.ack_signals = vec!["sig-1".to_string()];
        req.tickets = vec![TicketRecord {
            ticket_id: "tkt-1".to_string(),
            instance_id: "inst-1".to_string(),
            body: json!({ "reason": "stuck" }),
            created_at: 2_000,
            delivered_at: None,
        }];
        store.commit(req).unwrap();

        assert!(store.pending_signals("inst-1").unwrap().is_empty());
        let acked = store.get_signal("inst-1", "sig-1").unwrap().unwrap();
        assert_eq!(acked.status, SignalStatus::Acked);

        let open = store.list_tickets(Some("inst-1"), true).unwrap();
        assert_eq!(open.len(), 1);
        store.mark_ticket_delivered("tkt-1", 3_000).unwrap();
        assert!(store.list_tickets(None, true).unwrap().is_empty());
        assert_eq!(store.list_tickets(None, false).unwrap()[0].delivered_at, Some(3_000));
    }

    #[test]
    fn test_signal_dedup_and_priority() {
        let mut store = Store::open_in_memory().unwrap();
        started(&mut store, "inst-1");

        assert!(matches!(
            store.enqueue_signal(signal("inst-1", "a", false), 8).unwrap(),
            EnqueueOutcome::Accepted { seq: 1, dropped: None }
        ));
        assert_eq!(
            store.enqueue_signal(signal("inst-1", "a", false), 8).unwrap(),
            EnqueueOutcome::Duplicate
        );
        store.enqueue_signal(signal("inst-1", "b", false), 8).unwrap();
        store.enqueue_signal(signal("inst-1", "cancel", true), 8).unwrap();

        let ids: Vec<String> = store
            .pending_signals("inst-1")
            .unwrap()
            .into_iter()
            .map(|s| s.signal_id)
            .collect();
        assert_eq!(ids, vec!["cancel", "a", "b"]);
    }

    #[test]
    fn test_signal_overflow_drops_oldest_non_critical() {
        let mut store = Store::open_in_memory().unwrap();
        started(&mut store, "inst-1");

        store.enqueue_signal(signal("inst-1", "esc", true), 2).unwrap();
        store.enqueue_signal(signal("inst-1", "a", false), 2).unwrap();
        let outcome = store.enqueue_signal(signal("inst-1", "b", false), 2).unwrap();
        assert_eq!(
            outcome,
            EnqueueOutcome::Accepted {
                seq: 3,
                dropped: Some("a".to_string())
            }
        );

        // full of critical plus b; b is dropped to make room for another critical
        store.enqueue_signal(signal("inst-1", "cancel", true), 2).unwrap();
        let pending: Vec<String> = store
            .pending_signals("inst-1")
            .unwrap()
            .into_iter()
            .map(|s| s.signal_id)
            .collect();
        assert_eq!(pending, vec!["esc", "cancel"]);

        let rejected = store.enqueue_signal(signal("inst-1", "c", false), 2).unwrap();
        assert_eq!(rejected, EnqueueOutcome::Rejected);

        // critical signals still get in
        store.enqueue_signal(signal("inst-1", "esc-2", true), 2).unwrap();
        assert_eq!(store.pending_signals("inst-1").unwrap().len(), 3);
    }

    #[test]
    fn test_dropped_signal_frees_capacity() {
        let mut store = Store::open_in_memory().unwrap();
        started(&mut store, "inst-1");
        store.enqueue_signal(signal("inst-1", "a", false), 2).unwrap();
        store.enqueue_signal(signal("inst-1", "b", false), 2).unwrap();

        assert!(store.drop_signal("inst-1", "a").unwrap());
        assert!(!store.drop_signal("inst-1", "a").unwrap());
        assert_eq!(store.get_signal("inst-1", "a").unwrap().unwrap().status, SignalStatus::Dropped);

        let outcome = store.enqueue_signal(signal("inst-1", "c", false), 2).unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Accepted { dropped: None, .. }));
        let pending: Vec<String> = store
            .pending_signals("inst-1")
            .unwrap()
            .into_iter()
            .map(|s| s.signal_id)
            .collect();
        assert_eq!(pending, vec!["b", "c"]);
    }

    #[test]
    fn test_projection_only_moves_forward() {
        let mut store = Store::open_in_memory().unwrap();
        let mut projection = ProjectionRecord {
            instance_id: "inst-1".to_string(),
            generation: 1,
            version: 3,
            body: json!({ "stage": "BUDGET" }),
            updated_at: 1,
        };
        assert!(store.put_projection(&projection).unwrap());

        projection.version = 2;
        projection.body = json!({ "stage": "PREFERENCES" });
        assert!(!store.put_projection(&projection).unwrap());

        let loaded = store.load_projection("inst-1").unwrap().unwrap();
        assert_eq!(loaded.version, 3);
        assert_eq!(loaded.body["stage"], "BUDGET");

        projection.version = 3;
        projection.updated_at = 5;
        projection.body = json!({ "stage": "BUDGET", "turn_open": true });
        assert!(store.put_projection(&projection).unwrap());

        projection.generation = 2;
        projection.version = 0;
        assert!(store.put_projection(&projection).unwrap());
    }

    #[test]
    fn test_reopen_file_keeps_state() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("nested").join("sessions.db");
        {
            let mut store = Store::open(&path).unwrap();
            started(&mut store, "inst-1");
        }
        let store = Store::open(&path).unwrap();
        assert!(store.load_snapshot("inst-1").unwrap().is_some());
        assert_eq!(store.list_snapshots(false).unwrap().len(), 1);
    }
}
