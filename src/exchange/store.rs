use std::path::{Path, PathBuf};
use std::str::FromStr as _;
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension as _, Row, params};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{
    DepositKey, ExchangeRequest, ExchangeStatus, OutputAddress, PaymentRecord, PriceSnapshot,
    SettlementJob,
};
use crate::asset::Asset;
use crate::chain::PaymentClassification;
use crate::error::Error;

const REQUEST_COLUMNS: &str = r#"
  id,
  btc_amount,
  output_currency,
  output_addresses,
  payment_address,
  fee,
  estimated_output,
  final_output,
  status,
  created_at,
  updated_at
"#;

const DEPOSIT_KEY_COLUMNS: &str = "address, nonce, ciphertext, request_id, active, created_at";

const PAYMENT_COLUMNS: &str = r#"
  id,
  request_id,
  address,
  amount_sats,
  txid,
  confirmations,
  classification,
  detected_at
"#;

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create store dir {}", dir.display()))?;
        }

        let conn =
            Connection::open(&path).with_context(|| format!("open sqlite {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("set sqlite busy_timeout")?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("configure sqlite pragmas")?;

        migrate(&conn).context("migrate sqlite schema")?;

        Ok(Self { conn, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // --- deposit keys ---

    pub fn insert_deposit_key(&mut self, key: &DepositKey) -> Result<()> {
        self.conn
            .execute(
                r#"
INSERT INTO deposit_keys (address, nonce, ciphertext, request_id, active, created_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
"#,
                params![
                    &key.address,
                    &key.nonce[..],
                    &key.ciphertext,
                    key.request_id.map(|id| id.to_string()),
                    key.active,
                    key.created_at.timestamp_millis(),
                ],
            )
            .with_context(|| format!("insert deposit key {}", key.address))?;
        Ok(())
    }

    pub fn get_active_deposit_key(&self, address: &str) -> Result<Option<DepositKey>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {DEPOSIT_KEY_COLUMNS} FROM deposit_keys WHERE address = ?1 AND active = 1"
                ),
                params![address],
                deposit_key_from_row,
            )
            .optional()
            .with_context(|| format!("get deposit key {address}"))
    }

    pub fn active_deposit_key_for_request(&self, request_id: Uuid) -> Result<Option<DepositKey>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {DEPOSIT_KEY_COLUMNS} FROM deposit_keys WHERE request_id = ?1 AND active = 1"
                ),
                params![request_id.to_string()],
                deposit_key_from_row,
            )
            .optional()
            .with_context(|| format!("get deposit key for request {request_id}"))
    }

    pub fn list_active_deposit_keys(&self) -> Result<Vec<DepositKey>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {DEPOSIT_KEY_COLUMNS} FROM deposit_keys WHERE active = 1 ORDER BY created_at"
            ))
            .context("prepare list deposit keys")?;
        let rows = stmt
            .query_map([], deposit_key_from_row)
            .context("query list deposit keys")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read deposit key row")?);
        }
        Ok(out)
    }

    pub fn deactivate_deposit_key(&mut self, address: &str) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE deposit_keys SET active = 0 WHERE address = ?1",
                params![address],
            )
            .with_context(|| format!("deactivate deposit key {address}"))?;
        if rows == 0 {
            return Err(Error::NotFound(format!("deposit key {address}")).into());
        }
        Ok(())
    }

    // --- exchange requests ---

    /// Persists a new request, binds its deposit key and enqueues its
    /// settlement job in one transaction.
    pub fn create_request(&mut self, request: &ExchangeRequest, job: &SettlementJob) -> Result<()> {
        let output_addresses =
            serde_json::to_string(&request.output_addresses).context("encode output addresses")?;

        let tx = self.conn.transaction().context("begin create request")?;
        tx.execute(
            &format!(
                "INSERT INTO exchange_requests ({REQUEST_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                request.id.to_string(),
                request.btc_amount.to_string(),
                request.output_currency.symbol(),
                output_addresses,
                &request.payment_address,
                request.fee.to_string(),
                request.estimated_output.to_string(),
                request.final_output.map(|v| v.to_string()),
                request.status.as_str(),
                request.created_at.timestamp_millis(),
                request.updated_at.timestamp_millis(),
            ],
        )
        .with_context(|| format!("insert exchange request {}", request.id))?;

        let bound = tx
            .execute(
                r#"
UPDATE deposit_keys SET request_id = ?2
WHERE address = ?1 AND active = 1 AND request_id IS NULL
"#,
                params![&request.payment_address, request.id.to_string()],
            )
            .with_context(|| format!("bind deposit key {}", request.payment_address))?;
        anyhow::ensure!(
            bound == 1,
            "deposit address {} is unknown or already assigned",
            request.payment_address
        );

        tx.execute(
            "INSERT INTO settlement_jobs (request_id, next_poll_at, deadline) VALUES (?1, ?2, ?3)",
            params![
                job.request_id.to_string(),
                job.next_poll_at.timestamp_millis(),
                job.deadline.timestamp_millis(),
            ],
        )
        .with_context(|| format!("insert settlement job {}", job.request_id))?;

        tx.commit().context("commit create request")?;
        Ok(())
    }

    pub fn get_request(&self, id: Uuid) -> Result<Option<ExchangeRequest>> {
        self.conn
            .query_row(
                &format!("SELECT {REQUEST_COLUMNS} FROM exchange_requests WHERE id = ?1"),
                params![id.to_string()],
                request_from_row,
            )
            .optional()
            .with_context(|| format!("get exchange request {id}"))
    }

    /// Newest first.
    pub fn list_requests(&self, limit: u32, offset: u32) -> Result<Vec<ExchangeRequest>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {REQUEST_COLUMNS} FROM exchange_requests ORDER BY created_at DESC, id LIMIT ?1 OFFSET ?2"
            ))
            .context("prepare list requests")?;
        let rows = stmt
            .query_map(params![limit, offset], request_from_row)
            .context("query list requests")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read exchange request row")?);
        }
        Ok(out)
    }

    /// Moves a request to `status` if the transition is allowed and returns
    /// the previous status.
    pub fn update_status(
        &mut self,
        id: Uuid,
        status: ExchangeStatus,
        now: DateTime<Utc>,
    ) -> Result<ExchangeStatus> {
        let tx = self.conn.transaction().context("begin update status")?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM exchange_requests WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("read status {id}"))?;
        let Some(current) = current else {
            return Err(Error::NotFound(format!("exchange request {id}")).into());
        };
        let current = ExchangeStatus::from_str(&current).map_err(anyhow::Error::msg)?;
        if !current.can_transition_to(status) {
            return Err(Error::InvalidTransition {
                from: current,
                to: status,
            }
            .into());
        }

        let rows = tx
            .execute(
                "UPDATE exchange_requests SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), status.as_str(), now.timestamp_millis()],
            )
            .with_context(|| format!("update status {id}"))?;
        anyhow::ensure!(rows == 1, "status update touched {rows} rows for {id}");

        tx.commit().context("commit update status")?;
        Ok(current)
    }

    /// Sets `final_output` exactly once.
    pub fn set_final_output(&mut self, id: Uuid, amount: Decimal, now: DateTime<Utc>) -> Result<()> {
        let rows = self
            .conn
            .execute(
                r#"
UPDATE exchange_requests SET final_output = ?2, updated_at = ?3
WHERE id = ?1 AND final_output IS NULL
"#,
                params![id.to_string(), amount.to_string(), now.timestamp_millis()],
            )
            .with_context(|| format!("set final output {id}"))?;
        if rows == 1 {
            return Ok(());
        }
        match self.get_request(id)? {
            None => Err(Error::NotFound(format!("exchange request {id}")).into()),
            Some(_) => anyhow::bail!("final output already set for {id}"),
        }
    }

    // --- payments ---

    pub fn insert_payment(&mut self, payment: &PaymentRecord) -> Result<()> {
        let amount_sats = i64::try_from(payment.amount_sats).context("amount_sats overflows i64")?;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO payment_records ({PAYMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    payment.id.to_string(),
                    payment.request_id.to_string(),
                    &payment.address,
                    amount_sats,
                    &payment.txid,
                    payment.confirmations,
                    payment.classification.as_str(),
                    payment.detected_at.timestamp_millis(),
                ],
            )
            .with_context(|| format!("insert payment for {}", payment.request_id))?;
        Ok(())
    }

    pub fn payments_for_request(&self, request_id: Uuid) -> Result<Vec<PaymentRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {PAYMENT_COLUMNS} FROM payment_records WHERE request_id = ?1 ORDER BY detected_at, id"
            ))
            .context("prepare list payments")?;
        let rows = stmt
            .query_map(params![request_id.to_string()], payment_from_row)
            .context("query list payments")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read payment row")?);
        }
        Ok(out)
    }

    // --- price snapshots ---

    pub fn upsert_price_snapshot(&mut self, snapshot: &PriceSnapshot) -> Result<()> {
        self.conn
            .execute(
                r#"
INSERT INTO price_snapshots (symbol, price_usd, last_updated) VALUES (?1, ?2, ?3)
ON CONFLICT(symbol) DO UPDATE SET price_usd = excluded.price_usd, last_updated = excluded.last_updated
"#,
                params![
                    snapshot.asset.symbol(),
                    snapshot.price_usd.to_string(),
                    snapshot.last_updated.timestamp_millis(),
                ],
            )
            .with_context(|| format!("upsert price snapshot {}", snapshot.asset))?;
        Ok(())
    }

    pub fn list_price_snapshots(&self) -> Result<Vec<PriceSnapshot>> {
        let mut stmt = self
            .conn
            .prepare("SELECT symbol, price_usd, last_updated FROM price_snapshots ORDER BY symbol")
            .context("prepare list price snapshots")?;
        let rows = stmt
            .query_map([], |row| {
                let symbol: String = row.get(0)?;
                let asset = Asset::from_str(&symbol).map_err(|e| conversion_error(0, Type::Text, e))?;
                Ok(PriceSnapshot {
                    asset,
                    price_usd: decimal_column(row, 1)?,
                    last_updated: timestamp_column(row, 2)?,
                })
            })
            .context("query list price snapshots")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read price snapshot row")?);
        }
        Ok(out)
    }

    // --- settlement jobs ---

    pub fn due_jobs(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<SettlementJob>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
SELECT request_id, next_poll_at, deadline FROM settlement_jobs
WHERE next_poll_at <= ?1 OR deadline <= ?1
ORDER BY next_poll_at
LIMIT ?2
"#,
            )
            .context("prepare due jobs")?;
        let rows = stmt
            .query_map(params![now.timestamp_millis(), limit], job_from_row)
            .context("query due jobs")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("read settlement job row")?);
        }
        Ok(out)
    }

    pub fn get_job(&self, request_id: Uuid) -> Result<Option<SettlementJob>> {
        self.conn
            .query_row(
                "SELECT request_id, next_poll_at, deadline FROM settlement_jobs WHERE request_id = ?1",
                params![request_id.to_string()],
                job_from_row,
            )
            .optional()
            .with_context(|| format!("get settlement job {request_id}"))
    }

    pub fn reschedule_job(&mut self, request_id: Uuid, next_poll_at: DateTime<Utc>) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE settlement_jobs SET next_poll_at = ?2 WHERE request_id = ?1",
                params![request_id.to_string(), next_poll_at.timestamp_millis()],
            )
            .with_context(|| format!("reschedule settlement job {request_id}"))?;
        if rows == 0 {
            return Err(Error::NotFound(format!("settlement job {request_id}")).into());
        }
        Ok(())
    }

    /// Idempotent.
    pub fn delete_job(&mut self, request_id: Uuid) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM settlement_jobs WHERE request_id = ?1",
                params![request_id.to_string()],
            )
            .with_context(|| format!("delete settlement job {request_id}"))?;
        Ok(())
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS exchange_requests (
  id TEXT PRIMARY KEY,
  btc_amount TEXT NOT NULL,
  output_currency TEXT NOT NULL,
  output_addresses TEXT NOT NULL,
  payment_address TEXT NOT NULL UNIQUE,
  fee TEXT NOT NULL,
  estimated_output TEXT NOT NULL,
  final_output TEXT,
  status TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS exchange_requests_status_idx ON exchange_requests(status);
CREATE INDEX IF NOT EXISTS exchange_requests_created_idx ON exchange_requests(created_at);

CREATE TABLE IF NOT EXISTS deposit_keys (
  address TEXT PRIMARY KEY,
  nonce BLOB NOT NULL,
  ciphertext BLOB NOT NULL,
  request_id TEXT REFERENCES exchange_requests(id),
  active INTEGER NOT NULL DEFAULT 1,
  created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS deposit_keys_request_idx ON deposit_keys(request_id);

CREATE TABLE IF NOT EXISTS payment_records (
  id TEXT PRIMARY KEY,
  request_id TEXT NOT NULL REFERENCES exchange_requests(id),
  address TEXT NOT NULL,
  amount_sats INTEGER NOT NULL,
  txid TEXT,
  confirmations INTEGER NOT NULL,
  classification TEXT NOT NULL,
  detected_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS payment_records_request_idx ON payment_records(request_id);

CREATE TABLE IF NOT EXISTS price_snapshots (
  symbol TEXT PRIMARY KEY,
  price_usd TEXT NOT NULL,
  last_updated INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS settlement_jobs (
  request_id TEXT PRIMARY KEY REFERENCES exchange_requests(id),
  next_poll_at INTEGER NOT NULL,
  deadline INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS settlement_jobs_due_idx ON settlement_jobs(next_poll_at);
"#,
    )
    .context("create tables")?;
    Ok(())
}

fn conversion_error(
    col: usize,
    ty: Type,
    msg: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(col, ty, msg.into())
}

fn uuid_column(row: &Row<'_>, col: usize) -> rusqlite::Result<Uuid> {
    let s: String = row.get(col)?;
    Uuid::parse_str(&s).map_err(|e| conversion_error(col, Type::Text, format!("invalid uuid {s}: {e}")))
}

fn decimal_column(row: &Row<'_>, col: usize) -> rusqlite::Result<Decimal> {
    let s: String = row.get(col)?;
    Decimal::from_str(&s)
        .map_err(|e| conversion_error(col, Type::Text, format!("invalid decimal {s}: {e}")))
}

fn timestamp_column(row: &Row<'_>, col: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(col)?;
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| conversion_error(col, Type::Integer, format!("invalid timestamp {millis}")))
}

fn u64_column(row: &Row<'_>, col: usize) -> rusqlite::Result<u64> {
    let v: i64 = row.get(col)?;
    u64::try_from(v).map_err(|_| conversion_error(col, Type::Integer, format!("invalid u64 {v}")))
}

fn u32_column(row: &Row<'_>, col: usize) -> rusqlite::Result<u32> {
    let v: i64 = row.get(col)?;
    u32::try_from(v).map_err(|_| conversion_error(col, Type::Integer, format!("invalid u32 {v}")))
}

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<ExchangeRequest> {
    let currency: String = row.get(2)?;
    let output_currency =
        Asset::from_str(&currency).map_err(|e| conversion_error(2, Type::Text, e))?;
    let outputs_json: String = row.get(3)?;
    let output_addresses: Vec<OutputAddress> = serde_json::from_str(&outputs_json)
        .map_err(|e| conversion_error(3, Type::Text, format!("invalid output addresses: {e}")))?;
    let final_output: Option<String> = row.get(7)?;
    let final_output = final_output
        .map(|s| {
            Decimal::from_str(&s)
                .map_err(|e| conversion_error(7, Type::Text, format!("invalid decimal {s}: {e}")))
        })
        .transpose()?;
    let status_str: String = row.get(8)?;
    let status =
        ExchangeStatus::from_str(&status_str).map_err(|e| conversion_error(8, Type::Text, e))?;

    Ok(ExchangeRequest {
        id: uuid_column(row, 0)?,
        btc_amount: decimal_column(row, 1)?,
        output_currency,
        output_addresses,
        payment_address: row.get(4)?,
        fee: decimal_column(row, 5)?,
        estimated_output: decimal_column(row, 6)?,
        final_output,
        status,
        created_at: timestamp_column(row, 9)?,
        updated_at: timestamp_column(row, 10)?,
    })
}

fn deposit_key_from_row(row: &Row<'_>) -> rusqlite::Result<DepositKey> {
    let nonce: Vec<u8> = row.get(1)?;
    let nonce: [u8; 12] = nonce
        .try_into()
        .map_err(|v: Vec<u8>| conversion_error(1, Type::Blob, format!("nonce must be 12 bytes, got {}", v.len())))?;
    let request_id: Option<String> = row.get(3)?;
    let request_id = request_id
        .map(|s| {
            Uuid::parse_str(&s)
                .map_err(|e| conversion_error(3, Type::Text, format!("invalid uuid {s}: {e}")))
        })
        .transpose()?;

    Ok(DepositKey {
        address: row.get(0)?,
        nonce,
        ciphertext: row.get(2)?,
        request_id,
        active: row.get(4)?,
        created_at: timestamp_column(row, 5)?,
    })
}

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<PaymentRecord> {
    let classification: String = row.get(6)?;
    let classification = PaymentClassification::from_str(&classification)
        .map_err(|e| conversion_error(6, Type::Text, e))?;

    Ok(PaymentRecord {
        id: uuid_column(row, 0)?,
        request_id: uuid_column(row, 1)?,
        address: row.get(2)?,
        amount_sats: u64_column(row, 3)?,
        txid: row.get(4)?,
        confirmations: u32_column(row, 5)?,
        classification,
        detected_at: timestamp_column(row, 7)?,
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<SettlementJob> {
    Ok(SettlementJob {
        request_id: uuid_column(row, 0)?,
        next_poll_at: timestamp_column(row, 1)?,
        deadline: timestamp_column(row, 2)?,
    })
}
