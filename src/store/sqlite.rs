//! SQLite-backed store (feature `sqlite`).
//!
//! Each [`Store`] method runs in one `BEGIN IMMEDIATE` transaction, so the write lock is
//! taken up front and a concurrent writer in another process waits on the busy timeout
//! instead of failing mid-unit. Successor uniqueness is a `UNIQUE` constraint on
//! `batches.parent_id`; identity dedup is a partial unique index over non-duplicate rows.
//! Busy and locked errors surface as [`StoreError::Transient`]; constraint violations as
//! [`StoreError::Conflict`].

use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{
    ffi, params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior,
};
use tracing::debug;

use super::{
    BatchDraft, BatchSnapshot, Charge, ConsumeOutcome, HaltKind, HaltSignal, RecordOutcome, Store,
};
use crate::{
    Arm, ArmId, Batch, BatchId, CumulativePi, NewResponse, Outcome, PosteriorParams, Response,
    ResponseId, StoreError,
};

const SCHEMA_VERSION: i64 = 1;
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS arms (
    id       INTEGER PRIMARY KEY,
    label    TEXT NOT NULL UNIQUE,
    position INTEGER NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS batches (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_id INTEGER UNIQUE REFERENCES batches(id),
    capacity  INTEGER NOT NULL CHECK (capacity >= 1),
    remaining INTEGER NOT NULL CHECK (remaining >= 0),
    active    INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS batch_arms (
    batch_id INTEGER NOT NULL REFERENCES batches(id),
    arm_id   INTEGER NOT NULL REFERENCES arms(id),
    alpha    REAL NOT NULL,
    beta     REAL NOT NULL,
    pi       REAL NOT NULL,
    PRIMARY KEY (batch_id, arm_id)
);
CREATE TABLE IF NOT EXISTS responses (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    arm_id           INTEGER NOT NULL REFERENCES arms(id),
    batch_id         INTEGER NOT NULL REFERENCES batches(id),
    context_batch_id INTEGER NOT NULL REFERENCES batches(id),
    outcome          TEXT NOT NULL,
    garbage          INTEGER NOT NULL,
    duplicate        INTEGER NOT NULL,
    identity         TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS responses_identity
    ON responses(identity) WHERE duplicate = 0 AND identity IS NOT NULL;
CREATE INDEX IF NOT EXISTS responses_batch ON responses(batch_id);
CREATE TABLE IF NOT EXISTS no_consent (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id INTEGER NOT NULL REFERENCES batches(id)
);
CREATE TABLE IF NOT EXISTS halts (
    kind         TEXT PRIMARY KEY,
    detail       TEXT NOT NULL,
    batch_id     INTEGER,
    acknowledged INTEGER NOT NULL
);
";

const BATCH_COLUMNS: &str = "id, parent_id, capacity, remaining, active";
const RESPONSE_COLUMNS: &str =
    "id, arm_id, batch_id, context_batch_id, outcome, garbage, duplicate, identity";

/// Durable [`Store`] over a single SQLite connection.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref()).map_err(map_db)?;
        conn.execute_batch("PRAGMA journal_mode = wal;").map_err(map_db)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory().map_err(map_db)?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(map_db)?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT).map_err(map_db)?;
        initialize_schema(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` in an immediate transaction, committing on success.
    fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_db)?;
        let out = f(&tx)?;
        tx.commit().map_err(map_db)?;
        Ok(out)
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let conn = self.conn.lock();
        f(&*conn)
    }
}

fn initialize_schema(conn: &mut Connection) -> Result<(), StoreError> {
    let tx = conn.transaction().map_err(map_db)?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS store_meta (version INTEGER NOT NULL);")
        .map_err(map_db)?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM store_meta LIMIT 1", [], |row| row.get(0))
        .optional()
        .map_err(map_db)?;
    match version {
        None => {
            tx.execute_batch(SCHEMA).map_err(map_db)?;
            tx.execute(
                "INSERT INTO store_meta (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )
            .map_err(map_db)?;
        }
        Some(SCHEMA_VERSION) => {}
        Some(other) => {
            return Err(StoreError::Corrupt(format!(
                "unsupported schema version {other}"
            )));
        }
    }
    tx.commit().map_err(map_db)
}

fn map_db(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            StoreError::Transient(err.to_string())
        }
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.extended_code,
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            ) =>
        {
            StoreError::Conflict(err.to_string())
        }
        // Foreign key, CHECK and NOT NULL failures are bad input, not lost races.
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            StoreError::Invalid(err.to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

fn to_sql(v: u64) -> Result<i64, StoreError> {
    i64::try_from(v).map_err(|_| StoreError::Invalid(format!("{v} does not fit in an i64")))
}

fn from_sql(v: i64, what: &str) -> Result<u64, StoreError> {
    u64::try_from(v).map_err(|_| StoreError::Corrupt(format!("negative {what}: {v}")))
}

fn outcome_str(o: Outcome) -> &'static str {
    match o {
        Outcome::Success => "success",
        Outcome::Failure => "failure",
        Outcome::Unknown => "unknown",
    }
}

fn parse_outcome(s: &str) -> Result<Outcome, StoreError> {
    match s {
        "success" => Ok(Outcome::Success),
        "failure" => Ok(Outcome::Failure),
        "unknown" => Ok(Outcome::Unknown),
        other => Err(StoreError::Corrupt(format!("unknown outcome `{other}`"))),
    }
}

type BatchRow = (i64, Option<i64>, i64, i64, bool);

fn batch_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BatchRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_batch((id, parent, capacity, remaining, active): BatchRow) -> Result<Batch, StoreError> {
    Ok(Batch {
        id: BatchId(from_sql(id, "batch id")?),
        parent: parent
            .map(|p| from_sql(p, "parent id").map(BatchId))
            .transpose()?,
        capacity: from_sql(capacity, "capacity")?,
        remaining: from_sql(remaining, "remaining")?,
        active,
    })
}

type ResponseRow = (i64, i64, i64, i64, String, bool, bool, Option<String>);

fn response_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResponseRow> {
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

fn into_response(
    (id, arm, batch, context, outcome, garbage, duplicate, identity): ResponseRow,
) -> Result<Response, StoreError> {
    let arm = u32::try_from(arm)
        .map_err(|_| StoreError::Corrupt(format!("arm id out of range: {arm}")))?;
    Ok(Response {
        id: ResponseId(from_sql(id, "response id")?),
        arm: ArmId(arm),
        batch: BatchId(from_sql(batch, "batch id")?),
        context_batch: BatchId(from_sql(context, "context batch id")?),
        outcome: parse_outcome(&outcome)?,
        garbage,
        duplicate,
        identity,
    })
}

fn query_batches(conn: &Connection, filter: &str) -> Result<Vec<Batch>, StoreError> {
    let sql = format!("SELECT {BATCH_COLUMNS} FROM batches {filter} ORDER BY id");
    let mut stmt = conn.prepare_cached(&sql).map_err(map_db)?;
    let rows = stmt
        .query_map([], batch_from_row)
        .map_err(map_db)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(map_db)?;
    rows.into_iter().map(into_batch).collect()
}

fn load_batch(conn: &Connection, id: BatchId) -> Result<Option<Batch>, StoreError> {
    let sql = format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = ?1");
    conn.query_row(&sql, params![to_sql(id.0)?], batch_from_row)
        .optional()
        .map_err(map_db)?
        .map(into_batch)
        .transpose()
}

fn query_responses(
    conn: &Connection,
    filter: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<Response>, StoreError> {
    let sql = format!("SELECT {RESPONSE_COLUMNS} FROM responses {filter} ORDER BY id");
    let mut stmt = conn.prepare_cached(&sql).map_err(map_db)?;
    let rows = stmt
        .query_map(args, response_from_row)
        .map_err(map_db)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(map_db)?;
    rows.into_iter().map(into_response).collect()
}

fn load_arms(conn: &Connection) -> Result<Vec<Arm>, StoreError> {
    let mut stmt = conn
        .prepare_cached("SELECT id, label, position FROM arms ORDER BY position")
        .map_err(map_db)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
        })
        .map_err(map_db)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(map_db)?;
    rows.into_iter()
        .map(|(id, label, position)| {
            let id = u32::try_from(id)
                .map_err(|_| StoreError::Corrupt(format!("arm id out of range: {id}")))?;
            let position = usize::try_from(position)
                .map_err(|_| StoreError::Corrupt(format!("negative arm position {position}")))?;
            Ok(Arm {
                id: ArmId(id),
                label,
                position,
            })
        })
        .collect()
}

fn insert_batch(tx: &Transaction<'_>, draft: &BatchDraft, arms: &[Arm]) -> Result<Batch, StoreError> {
    let parent = draft.parent.map(|p| to_sql(p.0)).transpose()?;
    let capacity = to_sql(draft.capacity)?;
    tx.execute(
        "INSERT INTO batches (parent_id, capacity, remaining, active) VALUES (?1, ?2, ?2, 1)",
        params![parent, capacity],
    )
    .map_err(map_db)?;
    let id = BatchId(from_sql(tx.last_insert_rowid(), "batch id")?);
    let mut stmt = tx
        .prepare_cached(
            "INSERT INTO batch_arms (batch_id, arm_id, alpha, beta, pi) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .map_err(map_db)?;
    for ((arm, post), pi) in arms.iter().zip(&draft.posteriors).zip(draft.pi.as_slice()) {
        stmt.execute(params![to_sql(id.0)?, arm.id.0, post.alpha, post.beta, pi])
            .map_err(map_db)?;
    }
    debug!(batch = %id, parent = ?draft.parent, capacity = draft.capacity, "batch row committed");
    Ok(Batch {
        id,
        parent: draft.parent,
        capacity: draft.capacity,
        remaining: draft.capacity,
        active: true,
    })
}

fn consume_in(tx: &Transaction<'_>, id: BatchId) -> Result<ConsumeOutcome, StoreError> {
    let key = to_sql(id.0)?;
    let changed = tx
        .execute(
            "UPDATE batches SET remaining = remaining - 1,
                                active = CASE WHEN remaining - 1 <= 0 THEN 0 ELSE active END
             WHERE id = ?1 AND active = 1 AND remaining > 0",
            params![key],
        )
        .map_err(map_db)?;
    if changed == 0 {
        return match load_batch(tx, id)? {
            Some(_) => Ok(ConsumeOutcome::AlreadyExhausted),
            None => Err(StoreError::NotFound(format!("{id}"))),
        };
    }
    let remaining: i64 = tx
        .query_row("SELECT remaining FROM batches WHERE id = ?1", params![key], |r| r.get(0))
        .map_err(map_db)?;
    let remaining = from_sql(remaining, "remaining")?;
    Ok(ConsumeOutcome::Landed {
        remaining,
        exhausted: remaining == 0,
    })
}

fn insert_response(
    tx: &Transaction<'_>,
    r: &NewResponse,
    batch: BatchId,
    duplicate: bool,
) -> Result<Response, StoreError> {
    tx.execute(
        "INSERT INTO responses (arm_id, batch_id, context_batch_id, outcome, garbage, duplicate, identity)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            r.arm.0,
            to_sql(batch.0)?,
            to_sql(r.context_batch.0)?,
            outcome_str(r.outcome),
            r.garbage || duplicate,
            duplicate,
            r.identity,
        ],
    )
    .map_err(map_db)?;
    Ok(Response {
        id: ResponseId(from_sql(tx.last_insert_rowid(), "response id")?),
        arm: r.arm,
        batch,
        context_batch: r.context_batch,
        outcome: r.outcome,
        garbage: r.garbage || duplicate,
        duplicate,
        identity: r.identity.clone(),
    })
}

impl Store for SqliteStore {
    fn arms(&self) -> Result<Vec<Arm>, StoreError> {
        self.read(load_arms)
    }

    fn initialize(&self, labels: &[String], draft: &BatchDraft) -> Result<Batch, StoreError> {
        if draft.parent.is_some() {
            return Err(StoreError::Invalid("first batch cannot have a parent".into()));
        }
        draft.check(labels.len())?;
        self.write(|tx| {
            let existing: i64 = tx
                .query_row("SELECT COUNT(*) FROM arms", [], |r| r.get(0))
                .map_err(map_db)?;
            if existing > 0 {
                return Err(StoreError::Conflict("experiment already initialized".into()));
            }
            let mut arms = Vec::with_capacity(labels.len());
            for (i, label) in labels.iter().enumerate() {
                let arm = Arm {
                    id: ArmId(i as u32 + 1),
                    label: label.clone(),
                    position: i,
                };
                tx.execute(
                    "INSERT INTO arms (id, label, position) VALUES (?1, ?2, ?3)",
                    params![arm.id.0, arm.label, i as i64],
                )
                .map_err(map_db)?;
                arms.push(arm);
            }
            insert_batch(tx, draft, &arms)
        })
    }

    fn create_successor(&self, draft: &BatchDraft) -> Result<Batch, StoreError> {
        let Some(parent) = draft.parent else {
            return Err(StoreError::Invalid("successor draft needs a parent".into()));
        };
        self.write(|tx| {
            let arms = load_arms(tx)?;
            draft.check(arms.len())?;
            if load_batch(tx, parent)?.is_none() {
                return Err(StoreError::NotFound(format!("{parent}")));
            }
            // The UNIQUE(parent_id) constraint reports a second successor as Conflict.
            insert_batch(tx, draft, &arms)
        })
    }

    fn batch(&self, id: BatchId) -> Result<Option<Batch>, StoreError> {
        self.read(|c| load_batch(c, id))
    }

    fn batches(&self) -> Result<Vec<Batch>, StoreError> {
        self.read(|c| query_batches(c, ""))
    }

    fn first_batch(&self) -> Result<Option<Batch>, StoreError> {
        self.read(|c| Ok(query_batches(c, "WHERE id = (SELECT MIN(id) FROM batches)")?.pop()))
    }

    fn latest_batch(&self) -> Result<Option<Batch>, StoreError> {
        self.read(|c| Ok(query_batches(c, "WHERE id = (SELECT MAX(id) FROM batches)")?.pop()))
    }

    fn successor_of(&self, parent: BatchId) -> Result<Option<Batch>, StoreError> {
        let key = to_sql(parent.0)?;
        self.read(|c| {
            let sql = format!("SELECT {BATCH_COLUMNS} FROM batches WHERE parent_id = ?1");
            c.query_row(&sql, params![key], batch_from_row)
                .optional()
                .map_err(map_db)?
                .map(into_batch)
                .transpose()
        })
    }

    fn eligible_batches(&self) -> Result<Vec<Batch>, StoreError> {
        self.read(|c| query_batches(c, "WHERE active = 1 AND remaining > 0"))
    }

    fn deactivate(&self, id: BatchId) -> Result<bool, StoreError> {
        let key = to_sql(id.0)?;
        self.write(|tx| {
            if load_batch(tx, id)?.is_none() {
                return Err(StoreError::NotFound(format!("{id}")));
            }
            let changed = tx
                .execute(
                    "UPDATE batches SET active = 0 WHERE id = ?1 AND active = 1",
                    params![key],
                )
                .map_err(map_db)?;
            Ok(changed > 0)
        })
    }

    fn consume(&self, id: BatchId) -> Result<ConsumeOutcome, StoreError> {
        self.write(|tx| consume_in(tx, id))
    }

    fn snapshot(&self, id: BatchId) -> Result<Option<BatchSnapshot>, StoreError> {
        self.read(|c| {
            let Some(batch) = load_batch(c, id)? else {
                return Ok(None);
            };
            let mut stmt = c
                .prepare_cached(
                    "SELECT ba.alpha, ba.beta, ba.pi FROM batch_arms ba
                     JOIN arms a ON a.id = ba.arm_id
                     WHERE ba.batch_id = ?1 ORDER BY a.position",
                )
                .map_err(map_db)?;
            let rows = stmt
                .query_map(params![to_sql(id.0)?], |r| {
                    Ok((r.get::<_, f64>(0)?, r.get::<_, f64>(1)?, r.get::<_, f64>(2)?))
                })
                .map_err(map_db)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(map_db)?;
            if rows.is_empty() {
                return Err(StoreError::Corrupt(format!("{id} has no snapshot rows")));
            }
            let posteriors = rows
                .iter()
                .map(|&(a, b, _)| PosteriorParams::new(a, b))
                .collect();
            let pi = CumulativePi::new(rows.iter().map(|r| r.2).collect())
                .map_err(|e| StoreError::Corrupt(format!("{id}: {e}")))?;
            Ok(Some(BatchSnapshot {
                batch,
                posteriors,
                pi,
            }))
        })
    }

    fn record(&self, response: &NewResponse, charge: Charge) -> Result<RecordOutcome, StoreError> {
        self.write(|tx| {
            let arm_known: Option<i64> = tx
                .query_row(
                    "SELECT id FROM arms WHERE id = ?1",
                    params![response.arm.0],
                    |r| r.get(0),
                )
                .optional()
                .map_err(map_db)?;
            if arm_known.is_none() {
                return Err(StoreError::Invalid(format!("unknown {}", response.arm)));
            }
            if load_batch(tx, response.context_batch)?.is_none() {
                return Err(StoreError::Invalid(format!(
                    "unknown context {}",
                    response.context_batch
                )));
            }
            if load_batch(tx, response.batch)?.is_none() {
                return Err(StoreError::Invalid(format!("unknown {}", response.batch)));
            }

            if let Some(identity) = &response.identity {
                let seen: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM responses WHERE identity = ?1 AND duplicate = 0",
                        params![identity],
                        |r| r.get(0),
                    )
                    .optional()
                    .map_err(map_db)?;
                if seen.is_some() {
                    let row = insert_response(tx, response, response.batch, true)?;
                    return Ok(RecordOutcome::Duplicate(row));
                }
            }

            match charge {
                Charge::None => Ok(RecordOutcome::Recorded(insert_response(
                    tx,
                    response,
                    response.batch,
                    false,
                )?)),
                Charge::Consume(batch) => match consume_in(tx, batch)? {
                    ConsumeOutcome::AlreadyExhausted => Ok(RecordOutcome::BatchExhausted),
                    ConsumeOutcome::Landed {
                        remaining,
                        exhausted,
                    } => Ok(RecordOutcome::Charged {
                        response: insert_response(tx, response, batch, false)?,
                        remaining,
                        exhausted,
                    }),
                },
            }
        })
    }

    fn responses_for_batch(&self, id: BatchId) -> Result<Vec<Response>, StoreError> {
        let key = to_sql(id.0)?;
        self.read(|c| query_responses(c, "WHERE batch_id = ?1", &[&key]))
    }

    fn responses(&self) -> Result<Vec<Response>, StoreError> {
        self.read(|c| query_responses(c, "", &[]))
    }

    fn response_count(&self, include_garbage: bool) -> Result<u64, StoreError> {
        let sql = if include_garbage {
            "SELECT COUNT(*) FROM responses"
        } else {
            "SELECT COUNT(*) FROM responses WHERE garbage = 0"
        };
        self.read(|c| {
            let n: i64 = c.query_row(sql, [], |r| r.get(0)).map_err(map_db)?;
            from_sql(n, "count")
        })
    }

    fn record_no_consent(&self, batch: BatchId) -> Result<ResponseId, StoreError> {
        self.write(|tx| {
            if load_batch(tx, batch)?.is_none() {
                return Err(StoreError::Invalid(format!("unknown {batch}")));
            }
            tx.execute(
                "INSERT INTO no_consent (batch_id) VALUES (?1)",
                params![to_sql(batch.0)?],
            )
            .map_err(map_db)?;
            Ok(ResponseId(from_sql(tx.last_insert_rowid(), "no-consent id")?))
        })
    }

    fn no_consent_count(&self) -> Result<u64, StoreError> {
        self.read(|c| {
            let n: i64 = c
                .query_row("SELECT COUNT(*) FROM no_consent", [], |r| r.get(0))
                .map_err(map_db)?;
            from_sql(n, "count")
        })
    }

    fn mark_halt(
        &self,
        kind: HaltKind,
        detail: &str,
        batch: Option<BatchId>,
    ) -> Result<bool, StoreError> {
        let batch = batch.map(|b| to_sql(b.0)).transpose()?;
        self.write(|tx| {
            let inserted = tx
                .execute(
                    "INSERT INTO halts (kind, detail, batch_id, acknowledged) VALUES (?1, ?2, ?3, 0)
                     ON CONFLICT(kind) DO NOTHING",
                    params![kind.as_str(), detail, batch],
                )
                .map_err(map_db)?;
            Ok(inserted > 0)
        })
    }

    fn halts(&self) -> Result<Vec<HaltSignal>, StoreError> {
        self.read(|c| {
            let mut stmt = c
                .prepare_cached(
                    "SELECT kind, detail, batch_id, acknowledged FROM halts ORDER BY kind",
                )
                .map_err(map_db)?;
            let rows = stmt
                .query_map([], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, Option<i64>>(2)?,
                        r.get::<_, bool>(3)?,
                    ))
                })
                .map_err(map_db)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(map_db)?;
            let mut out = rows
                .into_iter()
                .map(|(kind, detail, batch, acknowledged)| {
                    let kind = HaltKind::parse(&kind)
                        .ok_or_else(|| StoreError::Corrupt(format!("unknown halt kind `{kind}`")))?;
                    Ok(HaltSignal {
                        kind,
                        detail,
                        batch: batch.map(|b| from_sql(b, "batch id").map(BatchId)).transpose()?,
                        acknowledged,
                    })
                })
                .collect::<Result<Vec<_>, StoreError>>()?;
            out.sort_by_key(|h| h.kind);
            Ok(out)
        })
    }

    fn acknowledge_halt(&self, kind: HaltKind) -> Result<(), StoreError> {
        self.write(|tx| {
            let changed = tx
                .execute(
                    "UPDATE halts SET acknowledged = 1 WHERE kind = ?1",
                    params![kind.as_str()],
                )
                .map_err(map_db)?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("halt `{}`", kind.as_str())));
            }
            Ok(())
        })
    }
}
