#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use rusqlite::{params, Connection};
use yatai_register_core::{
    format_sheet_timestamp, now_jst, LedgerSchema, LedgerStore, RawTable, RegisterError,
};

const LEDGER_MIGRATION_VERSION: i64 = 1;

const SCHEMA_LEDGER_V1: &str = r"
CREATE TABLE IF NOT EXISTS ledger_header (
  position INTEGER PRIMARY KEY,
  name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS ledger_rows (
  row_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  appended_at TEXT NOT NULL,
  cells_json TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_ledger_rows_no_update
BEFORE UPDATE ON ledger_rows
BEGIN
  SELECT RAISE(FAIL, 'ledger_rows is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_ledger_rows_no_delete
BEFORE DELETE ON ledger_rows
BEGIN
  SELECT RAISE(FAIL, 'ledger_rows is append-only');
END;
";

/// Local sqlite deployment of the ledger-store interface: a dumb tabular
/// store holding a header row and append-only data rows. Rows are stored as
/// JSON cell arrays so the column set can evolve without SQL migrations.
pub struct SqliteLedgerStore {
    conn: Connection,
}

impl SqliteLedgerStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Applies the store schema and synchronizes the header with the in-code
    /// ledger schema. Existing header columns are never renamed or removed;
    /// columns the schema added since the last run are appended at the end.
    pub fn migrate(&self, schema: &LedgerSchema) -> Result<()> {
        schema
            .validate()
            .map_err(|err| anyhow!("invalid ledger schema: {err}"))?;

        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_LEDGER_V1)
            .context("failed to apply ledger store schema")?;

        let now = format_sheet_timestamp(now_jst()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEDGER_MIGRATION_VERSION, now],
            )
            .context("failed to register ledger store migration")?;

        self.sync_header(schema)
    }

    fn sync_header(&self, schema: &LedgerSchema) -> Result<()> {
        let stored = self.header()?;
        let declared = schema.columns();

        for (position, name) in stored.iter().enumerate() {
            if let Some(expected) = declared.get(position) {
                if expected != name {
                    bail!(
                        "ledger header diverges at position {position}: stored {name}, schema {expected}"
                    );
                }
            }
        }

        let mut appended = 0_usize;
        for (position, name) in declared.iter().enumerate().skip(stored.len()) {
            self.conn
                .execute(
                    "INSERT INTO ledger_header(position, name) VALUES (?1, ?2)",
                    params![i64::try_from(position).unwrap_or(i64::MAX), name],
                )
                .with_context(|| format!("failed to append header column {name}"))?;
            appended += 1;
        }

        if appended > 0 {
            tracing::info!(
                appended,
                schema_version = schema.version(),
                "extended ledger header"
            );
        }
        Ok(())
    }

    fn header(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM ledger_header ORDER BY position ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        collect_rows(rows)
    }

    /// Appends one row; whole-row atomic. Cells must follow the header's
    /// declared column order exactly.
    pub fn append_row(&mut self, cells: &[String]) -> Result<i64> {
        let header_len = self.header()?.len();
        if header_len == 0 {
            bail!("ledger store is not migrated: header is empty");
        }
        if cells.len() != header_len {
            bail!(
                "row has {} cells but the ledger header has {header_len} columns",
                cells.len()
            );
        }

        let appended_at = format_sheet_timestamp(now_jst()).map_err(|err| anyhow!(err.to_string()))?;
        let payload = serde_json::to_string(cells).context("failed to serialize row cells")?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start append transaction")?;
        tx.execute(
            "INSERT INTO ledger_rows(appended_at, cells_json) VALUES (?1, ?2)",
            params![appended_at, payload],
        )
        .context("failed to append ledger row")?;
        let row_seq = tx.last_insert_rowid();
        tx.commit().context("failed to commit append transaction")?;

        tracing::debug!(row_seq, "appended ledger row");
        Ok(row_seq)
    }

    /// Reads the whole ledger in append order, header first.
    pub fn read_table(&self) -> Result<RawTable> {
        let header = self.header()?;

        let mut stmt = self
            .conn
            .prepare("SELECT cells_json FROM ledger_rows ORDER BY row_seq ASC")?;
        let payloads = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut rows = Vec::new();
        for payload in payloads {
            let payload = payload?;
            let cells: Vec<String> =
                serde_json::from_str(&payload).context("invalid stored row cells")?;
            rows.push(cells);
        }

        tracing::debug!(rows = rows.len(), "read ledger table");
        Ok(RawTable { header, rows })
    }

    pub fn row_count(&self) -> Result<usize> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM ledger_rows", [], |row| {
                row.get::<_, i64>(0)
            })
            .context("failed to count ledger rows")?;
        usize::try_from(count).with_context(|| format!("invalid ledger row count: {count}"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl LedgerStore for SqliteLedgerStore {
    fn append(&mut self, cells: &[String]) -> Result<(), RegisterError> {
        self.append_row(cells)
            .map(|_| ())
            .map_err(|err| RegisterError::StoreAppend(format!("{err:#}")))
    }

    fn read_all(&self) -> Result<RawTable, RegisterError> {
        self.read_table()
            .map_err(|err| RegisterError::StoreUnavailable(format!("{err:#}")))
    }
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
