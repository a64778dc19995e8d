//! SQLite-backed sink for the indexer's rows.
//!
//! Every table shares the same shape of definition so the CREATE and INSERT
//! statements are generated from one place. The database file is tagged with
//! an application id; a file tagged by someone else is refused, and a stale
//! schema version wipes the known tables before anything is inserted.

use crate::IndexError;
use log::{info, warn};
use rusqlite::types::ToSql;
use rusqlite::{Connection, OpenFlags};
use std::fmt::Write as _;
use std::path::Path;

/// SQLite `application_id` identifying this program's databases.
pub const APPLICATION_ID: i64 = 0x012f_834b;

/// Bumped whenever the schema changes; a mismatch drops and recreates all
/// known tables.
pub const USER_VERSION: i64 = 3;

#[derive(Clone, Copy)]
enum ColumnType {
    Integer,
    Real,
    Text,
}

impl ColumnType {
    fn sql_name(self) -> &'static str {
        match self {
            ColumnType::Integer => "INT",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
        }
    }
}

struct ColumnDef {
    name: &'static str,
    constraints: &'static str,
    ty: ColumnType,
}

struct TableDef {
    name: &'static str,
    columns: &'static [ColumnDef],
}

macro_rules! column {
    ($name:literal, $constraints:literal, $ty:ident) => {
        ColumnDef {
            name: $name,
            constraints: $constraints,
            ty: ColumnType::$ty,
        }
    };
}

static FILES: TableDef = TableDef {
    name: "files",
    columns: &[
        column!("name", "NOT NULL", Text),
        column!("size", "NOT NULL", Integer),
    ],
};

static PATS: TableDef = TableDef {
    name: "pats",
    columns: &[
        column!("file_rowid", "NOT NULL", Integer),
        column!("tsid", "NOT NULL", Integer),
        column!("version", "NOT NULL", Integer),
    ],
};

static PMTS: TableDef = TableDef {
    name: "pmts",
    columns: &[
        column!("pat_rowid", "NOT NULL", Integer),
        column!("program_number", "NOT NULL", Integer),
        column!("version", "NOT NULL", Integer),
        column!("pcr_pid", "NOT NULL", Integer),
    ],
};

static ELEM_STREAMS: TableDef = TableDef {
    name: "elem_streams",
    columns: &[
        column!("pmt_rowid", "NOT NULL", Integer),
        column!("stream_type", "NOT NULL", Integer),
        column!("pid", "NOT NULL", Integer),
    ],
};

static LANG_SPECS: TableDef = TableDef {
    name: "lang_specs",
    columns: &[
        column!("elem_stream_rowid", "NOT NULL", Integer),
        column!("language", "NOT NULL", Text),
        column!("audio_type", "NOT NULL", Integer),
    ],
};

static TTX_PAGES: TableDef = TableDef {
    name: "ttx_pages",
    columns: &[
        column!("elem_stream_rowid", "NOT NULL", Integer),
        column!("language", "NOT NULL", Text),
        column!("teletext_type", "NOT NULL", Integer),
        column!("magazine_number", "NOT NULL", Integer),
        column!("page_number", "NOT NULL", Integer),
    ],
};

static SUBTITLE_CONTENTS: TableDef = TableDef {
    name: "subtitle_contents",
    columns: &[
        column!("elem_stream_rowid", "NOT NULL", Integer),
        column!("language", "NOT NULL", Text),
        column!("subtitling_type", "NOT NULL", Integer),
        column!("composition_page_id", "NOT NULL", Integer),
        column!("ancillary_page_id", "NOT NULL", Integer),
    ],
};

static SDTS: TableDef = TableDef {
    name: "sdts",
    columns: &[
        column!("pat_rowid", "NOT NULL", Integer),
        column!("version", "NOT NULL", Integer),
        column!("onid", "NOT NULL", Integer),
    ],
};

static SERVICES: TableDef = TableDef {
    name: "services",
    columns: &[
        column!("sdt_rowid", "NOT NULL", Integer),
        column!("program_number", "NOT NULL", Integer),
        column!("running_status", "NOT NULL", Integer),
        column!("scrambled", "NOT NULL", Integer),
        column!("name", "", Text),
        column!("provider_name", "", Text),
    ],
};

static NETWORKS: TableDef = TableDef {
    name: "networks",
    columns: &[
        column!("file_rowid", "NOT NULL", Integer),
        column!("network_id", "NOT NULL", Integer),
        column!("network_name", "", Text),
    ],
};

static TRANSPORT_STREAMS: TableDef = TableDef {
    name: "transport_streams",
    columns: &[
        column!("network_rowid", "NOT NULL", Integer),
        column!("tsid", "NOT NULL", Integer),
        column!("onid", "NOT NULL", Integer),
    ],
};

static TS_SERVICES: TableDef = TableDef {
    name: "ts_services",
    columns: &[
        column!("ts_rowid", "NOT NULL", Integer),
        column!("service_id", "NOT NULL", Integer),
        column!("service_type", "NOT NULL", Integer),
    ],
};

static VID_STREAMS: TableDef = TableDef {
    name: "vid_streams",
    columns: &[
        column!("file_rowid", "NOT NULL", Integer),
        column!("pid", "NOT NULL", Integer),
        column!("fmt", "", Text),
        column!("width", "", Integer),
        column!("height", "", Integer),
        column!("fps", "", Real),
        column!("bitrate", "", Integer),
    ],
};

static AUD_STREAMS: TableDef = TableDef {
    name: "aud_streams",
    columns: &[
        column!("file_rowid", "NOT NULL", Integer),
        column!("pid", "NOT NULL", Integer),
        column!("fmt", "", Text),
        column!("channels", "", Integer),
        column!("sample_rate", "", Integer),
        column!("bitrate", "", Integer),
    ],
};

static TABLES: [&TableDef; 14] = [
    &AUD_STREAMS,
    &VID_STREAMS,
    &PATS,
    &PMTS,
    &ELEM_STREAMS,
    &SDTS,
    &SERVICES,
    &FILES,
    &LANG_SPECS,
    &TTX_PAGES,
    &SUBTITLE_CONTENTS,
    &NETWORKS,
    &TRANSPORT_STREAMS,
    &TS_SERVICES,
];

fn create_sql(table: &TableDef) -> String {
    let mut sql = format!("CREATE TABLE IF NOT EXISTS {} (", table.name);
    for (i, column) in table.columns.iter().enumerate() {
        if i > 0 {
            sql.push(',');
        }
        let _ = write!(
            sql,
            "{} {} {}",
            column.name,
            column.ty.sql_name(),
            column.constraints
        );
    }
    sql.push(')');
    sql
}

fn insert_sql(table: &TableDef) -> String {
    let mut sql = format!("INSERT INTO {} VALUES (", table.name);
    for i in 0..table.columns.len() {
        if i > 0 {
            sql.push(',');
        }
        sql.push('?');
    }
    sql.push(')');
    sql
}

/// Result of [`Store::ensure_schema`].
#[derive(Debug, PartialEq)]
pub enum SchemaOutcome {
    /// A new database, or one whose stale tables were dropped and recreated.
    Fresh,
    /// An up-to-date database from a previous run.
    Reused,
}

/// Handle to the SQLite index database.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create the database file. [`Store::ensure_schema`] must run
    /// before any insertion.
    pub fn open(path: &Path) -> rusqlite::Result<Store> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
                | OpenFlags::SQLITE_OPEN_PRIVATE_CACHE,
        )?;
        Ok(Store { conn })
    }

    /// In-memory database, mainly for tests.
    pub fn open_in_memory() -> rusqlite::Result<Store> {
        Ok(Store {
            conn: Connection::open_in_memory()?,
        })
    }

    /// Verify the application id, wipe stale schemas, and create any missing
    /// tables.
    pub fn ensure_schema(&self) -> Result<SchemaOutcome, IndexError> {
        let mut fresh = false;
        let application_id: i64 =
            self.conn
                .pragma_query_value(None, "application_id", |row| row.get(0))?;
        if application_id == 0 {
            self.conn
                .pragma_update(None, "application_id", APPLICATION_ID)?;
            fresh = true;
        } else if application_id != APPLICATION_ID {
            return Err(IndexError::ForeignDatabase {
                found: application_id,
            });
        }

        let user_version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;
        if user_version != USER_VERSION {
            if !fresh {
                info!(
                    "schema version {} is stale, rebuilding the index",
                    user_version
                );
            }
            for table in TABLES.iter() {
                self.conn
                    .execute_batch(&format!("DROP TABLE IF EXISTS {}", table.name))?;
            }
            self.conn.pragma_update(None, "user_version", USER_VERSION)?;
            fresh = true;
        }

        for table in TABLES.iter() {
            self.conn.execute_batch(&create_sql(table))?;
        }
        Ok(if fresh {
            SchemaOutcome::Fresh
        } else {
            SchemaOutcome::Reused
        })
    }

    /// Open a transaction bracket around a multi-row emission.
    pub fn begin(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch("BEGIN TRANSACTION")
    }

    /// Close the bracket opened by [`Store::begin`].
    pub fn end(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch("END TRANSACTION")
    }

    /// Abandon the bracket opened by [`Store::begin`] after a failed insert.
    pub fn rollback(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch("ROLLBACK TRANSACTION")
    }

    fn insert_row(&self, table: &TableDef, values: &[&dyn ToSql]) -> rusqlite::Result<i64> {
        debug_assert_eq!(values.len(), table.columns.len());
        let mut stmt = self.conn.prepare_cached(&insert_sql(table))?;
        stmt.execute(values)?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Whether a file of this basename and size is already indexed.
    pub fn has_file(&self, name: &str, size: u64) -> rusqlite::Result<bool> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT rowid FROM files WHERE name = ? AND size = ?")?;
        stmt.exists((name, size as i64))
    }

    pub fn insert_file(&self, name: &str, size: u64) -> rusqlite::Result<i64> {
        self.insert_row(&FILES, &[&name, &(size as i64)])
    }

    pub fn insert_pat(&self, file_rowid: i64, tsid: u16, version: u8) -> rusqlite::Result<i64> {
        self.insert_row(&PATS, &[&file_rowid, &tsid, &version])
    }

    pub fn insert_pmt(
        &self,
        pat_rowid: i64,
        program_number: u16,
        version: u8,
        pcr_pid: u16,
    ) -> rusqlite::Result<i64> {
        self.insert_row(&PMTS, &[&pat_rowid, &program_number, &version, &pcr_pid])
    }

    pub fn insert_elem_stream(
        &self,
        pmt_rowid: i64,
        stream_type: u8,
        pid: u16,
    ) -> rusqlite::Result<i64> {
        self.insert_row(&ELEM_STREAMS, &[&pmt_rowid, &stream_type, &pid])
    }

    pub fn insert_lang_spec(
        &self,
        elem_stream_rowid: i64,
        language: &str,
        audio_type: u8,
    ) -> rusqlite::Result<i64> {
        self.insert_row(&LANG_SPECS, &[&elem_stream_rowid, &language, &audio_type])
    }

    pub fn insert_ttx_page(
        &self,
        elem_stream_rowid: i64,
        language: &str,
        teletext_type: u8,
        magazine_number: u8,
        page_number: u8,
    ) -> rusqlite::Result<i64> {
        self.insert_row(
            &TTX_PAGES,
            &[
                &elem_stream_rowid,
                &language,
                &teletext_type,
                &magazine_number,
                &page_number,
            ],
        )
    }

    pub fn insert_subtitle_content(
        &self,
        elem_stream_rowid: i64,
        language: &str,
        subtitling_type: u8,
        composition_page_id: u16,
        ancillary_page_id: u16,
    ) -> rusqlite::Result<i64> {
        self.insert_row(
            &SUBTITLE_CONTENTS,
            &[
                &elem_stream_rowid,
                &language,
                &subtitling_type,
                &composition_page_id,
                &ancillary_page_id,
            ],
        )
    }

    pub fn insert_sdt(&self, pat_rowid: i64, version: u8, onid: u16) -> rusqlite::Result<i64> {
        self.insert_row(&SDTS, &[&pat_rowid, &version, &onid])
    }

    pub fn insert_service(
        &self,
        sdt_rowid: i64,
        program_number: u16,
        running_status: u8,
        scrambled: bool,
        name: Option<&str>,
        provider_name: Option<&str>,
    ) -> rusqlite::Result<i64> {
        self.insert_row(
            &SERVICES,
            &[
                &sdt_rowid,
                &program_number,
                &running_status,
                &scrambled,
                &name,
                &provider_name,
            ],
        )
    }

    pub fn insert_network(
        &self,
        file_rowid: i64,
        network_id: u16,
        network_name: Option<&str>,
    ) -> rusqlite::Result<i64> {
        self.insert_row(&NETWORKS, &[&file_rowid, &network_id, &network_name])
    }

    pub fn insert_transport_stream(
        &self,
        network_rowid: i64,
        tsid: u16,
        onid: u16,
    ) -> rusqlite::Result<i64> {
        self.insert_row(&TRANSPORT_STREAMS, &[&network_rowid, &tsid, &onid])
    }

    pub fn insert_ts_service(
        &self,
        ts_rowid: i64,
        service_id: u16,
        service_type: u8,
    ) -> rusqlite::Result<i64> {
        self.insert_row(&TS_SERVICES, &[&ts_rowid, &service_id, &service_type])
    }

    pub fn insert_vid_stream(
        &self,
        file_rowid: i64,
        pid: u16,
        fmt: Option<&str>,
    ) -> rusqlite::Result<i64> {
        /* width, height, fps, and bitrate need payload decoding the prober
         * does not do */
        let absent: Option<i64> = None;
        let absent_real: Option<f64> = None;
        self.insert_row(
            &VID_STREAMS,
            &[&file_rowid, &pid, &fmt, &absent, &absent, &absent_real, &absent],
        )
    }

    pub fn insert_aud_stream(
        &self,
        file_rowid: i64,
        pid: u16,
        fmt: Option<&str>,
    ) -> rusqlite::Result<i64> {
        let absent: Option<i64> = None;
        self.insert_row(
            &AUD_STREAMS,
            &[&file_rowid, &pid, &fmt, &absent, &absent, &absent],
        )
    }

    /// Count rows of an arbitrary table, for tests and the final summary.
    pub fn count_rows(&self, table: &str) -> rusqlite::Result<i64> {
        debug_assert!(TABLES.iter().any(|t| t.name == table));
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                row.get(0)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_then_reused() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.ensure_schema().unwrap(), SchemaOutcome::Fresh);
        assert_eq!(store.ensure_schema().unwrap(), SchemaOutcome::Reused);
    }

    #[test]
    fn foreign_application_id_is_refused() {
        let store = Store::open_in_memory().unwrap();
        store
            .conn
            .pragma_update(None, "application_id", 0xdead_i64)
            .unwrap();
        match store.ensure_schema() {
            Err(IndexError::ForeignDatabase { found }) => assert_eq!(found, 0xdead),
            other => panic!("unexpected result {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn stale_user_version_wipes_tables() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_schema().unwrap();
        store.insert_file("old.ts", 188).unwrap();
        store
            .conn
            .pragma_update(None, "user_version", USER_VERSION - 1)
            .unwrap();
        assert_eq!(store.ensure_schema().unwrap(), SchemaOutcome::Fresh);
        assert_eq!(store.count_rows("files").unwrap(), 0);
    }

    #[test]
    fn has_file_matches_name_and_size() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_schema().unwrap();
        assert!(!store.has_file("a.ts", 376).unwrap());
        store.insert_file("a.ts", 376).unwrap();
        assert!(store.has_file("a.ts", 376).unwrap());
        assert!(!store.has_file("a.ts", 188).unwrap());
        assert!(!store.has_file("b.ts", 376).unwrap());
    }

    #[test]
    fn child_rows_reference_fresh_rowids() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_schema().unwrap();
        let file = store.insert_file("a.ts", 188).unwrap();
        let pat = store.insert_pat(file, 1, 0).unwrap();
        let pmt = store.insert_pmt(pat, 1, 0, 0x100).unwrap();
        let es = store.insert_elem_stream(pmt, 0x1b, 0x101).unwrap();
        store.insert_lang_spec(es, "deu", 0).unwrap();
        assert!(pat != pmt && pmt != es);
        assert_eq!(store.count_rows("lang_specs").unwrap(), 1);
    }

    #[test]
    fn service_names_may_be_null() {
        let store = Store::open_in_memory().unwrap();
        store.ensure_schema().unwrap();
        let file = store.insert_file("a.ts", 188).unwrap();
        let pat = store.insert_pat(file, 1, 0).unwrap();
        let sdt = store.insert_sdt(pat, 0, 1).unwrap();
        store
            .insert_service(sdt, 101, 4, false, None, Some("prov"))
            .unwrap();
        let name: Option<String> = store
            .conn
            .query_row("SELECT name FROM services", [], |row| row.get(0))
            .unwrap();
        assert!(name.is_none());
    }
}
