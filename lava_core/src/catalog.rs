use crate::model::{
    AttackPoint, AttackPointId, AttackPointKind, Bug, BugId, BugKind, Build, BuildId, ByteRange,
    Dua, DuaBytes, DuaBytesId, DuaId, LabelSet, LabelSetId, Loc, LvalId, Run, SourceLocation,
    SourceLval,
};
use rand::seq::SliceRandom;
use rand_core::RngCore;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Errors raised while reading or appending catalog rows.
#[derive(Error, Debug)]
pub enum CatalogError {
    /// A referenced row does not exist.
    #[error("{table} row {id} not found in catalog")]
    NotFound { table: &'static str, id: u64 },

    /// A stored integer code does not map to a known variant.
    #[error("Invalid {what} code {code} in catalog")]
    InvalidCode { what: &'static str, code: i64 },

    #[error("Catalog storage error: {0}")]
    Storage(String),

    #[error("Catalog I/O error: {0}")]
    Io(String),

    #[error("Catalog serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for CatalogError {
    fn from(err: std::io::Error) -> Self {
        CatalogError::Io(err.to_string())
    }
}
impl From<serde_json::Error> for CatalogError {
    fn from(err: serde_json::Error) -> Self {
        CatalogError::Serialization(format!("JSON operation error: {err}"))
    }
}
impl From<rusqlite::Error> for CatalogError {
    fn from(err: rusqlite::Error) -> Self {
        CatalogError::Storage(err.to_string())
    }
}

/// The bug corpus plus the append-only history of builds and runs.
///
/// Every cross reference is an id; callers resolve it explicitly through the
/// read methods. Upstream entities are never modified, and `Build`/`Run`
/// rows are only ever appended.
pub trait Catalog: Send + Sync {
    fn source_lval(&self, id: LvalId) -> Result<SourceLval, CatalogError>;
    fn label_set(&self, id: LabelSetId) -> Result<LabelSet, CatalogError>;
    fn dua(&self, id: DuaId) -> Result<Dua, CatalogError>;
    fn dua_bytes(&self, id: DuaBytesId) -> Result<DuaBytes, CatalogError>;
    fn attack_point(&self, id: AttackPointId) -> Result<AttackPoint, CatalogError>;
    fn bug(&self, id: BugId) -> Result<Bug, CatalogError>;

    fn bugs(&self, ids: &[BugId]) -> Result<Vec<Bug>, CatalogError> {
        ids.iter().map(|&id| self.bug(id)).collect()
    }

    /// The DUA a bug's trigger bytes were cut from.
    fn trigger_dua(&self, bug: &Bug) -> Result<Dua, CatalogError> {
        let bytes = self.dua_bytes(bug.trigger)?;
        self.dua(bytes.dua)
    }

    /// Bugs that appear in no build and whose trigger DUA has the given
    /// `fake` flag, in an order shuffled by `rng`.
    fn select_uninjected(
        &self,
        fake: bool,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Bug>, CatalogError>;

    fn record_build(
        &mut self,
        bugs: &[BugId],
        compiled: bool,
        output: &str,
    ) -> Result<Build, CatalogError>;

    fn record_run(
        &mut self,
        build: BuildId,
        fuzzed: Option<BugId>,
        exit_code: i32,
        output: &str,
        success: bool,
    ) -> Result<Run, CatalogError>;

    fn builds(&self) -> Result<Vec<Build>, CatalogError>;
    fn runs(&self) -> Result<Vec<Run>, CatalogError>;
}

/// Serializable image of a whole catalog, used to seed an in-memory catalog
/// from disk and to persist it again after a session.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CatalogSnapshot {
    #[serde(default)]
    pub source_lvals: Vec<SourceLval>,
    #[serde(default)]
    pub label_sets: Vec<LabelSet>,
    #[serde(default)]
    pub duas: Vec<Dua>,
    #[serde(default)]
    pub dua_bytes: Vec<DuaBytes>,
    #[serde(default)]
    pub attack_points: Vec<AttackPoint>,
    #[serde(default)]
    pub bugs: Vec<Bug>,
    #[serde(default)]
    pub builds: Vec<Build>,
    #[serde(default)]
    pub runs: Vec<Run>,
}

impl CatalogSnapshot {
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let file = File::open(path)
            .map_err(|e| CatalogError::Io(format!("Failed to open snapshot {path:?}: {e}")))?;
        let snapshot = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            CatalogError::Serialization(format!("Failed to parse snapshot {path:?}: {e}"))
        })?;
        Ok(snapshot)
    }

    pub fn save(&self, path: &Path) -> Result<(), CatalogError> {
        let file = File::create(path)
            .map_err(|e| CatalogError::Io(format!("Failed to create snapshot {path:?}: {e}")))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }
}

fn shuffled(mut bugs: Vec<Bug>, rng: &mut dyn RngCore) -> Vec<Bug> {
    bugs.shuffle(rng);
    bugs
}

/// Catalog held entirely in memory. Iteration order is by id, so selection
/// is reproducible for a given rng seed.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    source_lvals: BTreeMap<LvalId, SourceLval>,
    label_sets: BTreeMap<LabelSetId, LabelSet>,
    duas: BTreeMap<DuaId, Dua>,
    dua_bytes: BTreeMap<DuaBytesId, DuaBytes>,
    attack_points: BTreeMap<AttackPointId, AttackPoint>,
    bugs: BTreeMap<BugId, Bug>,
    builds: Vec<Build>,
    runs: Vec<Run>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: CatalogSnapshot) -> Self {
        let mut catalog = Self::new();
        for lval in snapshot.source_lvals {
            catalog.add_source_lval(lval);
        }
        for label_set in snapshot.label_sets {
            catalog.add_label_set(label_set);
        }
        for dua in snapshot.duas {
            catalog.add_dua(dua);
        }
        for bytes in snapshot.dua_bytes {
            catalog.add_dua_bytes(bytes);
        }
        for atp in snapshot.attack_points {
            catalog.add_attack_point(atp);
        }
        for bug in snapshot.bugs {
            catalog.add_bug(bug);
        }
        catalog.builds = snapshot.builds;
        catalog.runs = snapshot.runs;
        catalog
    }

    pub fn snapshot(&self) -> CatalogSnapshot {
        CatalogSnapshot {
            source_lvals: self.source_lvals.values().cloned().collect(),
            label_sets: self.label_sets.values().cloned().collect(),
            duas: self.duas.values().cloned().collect(),
            dua_bytes: self.dua_bytes.values().cloned().collect(),
            attack_points: self.attack_points.values().cloned().collect(),
            bugs: self.bugs.values().cloned().collect(),
            builds: self.builds.clone(),
            runs: self.runs.clone(),
        }
    }

    pub fn add_source_lval(&mut self, lval: SourceLval) {
        self.source_lvals.insert(lval.id, lval);
    }

    pub fn add_label_set(&mut self, label_set: LabelSet) {
        self.label_sets.insert(label_set.id, label_set);
    }

    pub fn add_dua(&mut self, dua: Dua) {
        self.duas.insert(dua.id, dua);
    }

    pub fn add_dua_bytes(&mut self, bytes: DuaBytes) {
        self.dua_bytes.insert(bytes.id, bytes);
    }

    pub fn add_attack_point(&mut self, atp: AttackPoint) {
        self.attack_points.insert(atp.id, atp);
    }

    pub fn add_bug(&mut self, bug: Bug) {
        self.bugs.insert(bug.id, bug);
    }

    fn lookup<T: Clone>(
        map: &BTreeMap<u64, T>,
        table: &'static str,
        id: u64,
    ) -> Result<T, CatalogError> {
        map.get(&id)
            .cloned()
            .ok_or(CatalogError::NotFound { table, id })
    }
}

impl Catalog for InMemoryCatalog {
    fn source_lval(&self, id: LvalId) -> Result<SourceLval, CatalogError> {
        Self::lookup(&self.source_lvals, "sourcelval", id)
    }

    fn label_set(&self, id: LabelSetId) -> Result<LabelSet, CatalogError> {
        Self::lookup(&self.label_sets, "labelset", id)
    }

    fn dua(&self, id: DuaId) -> Result<Dua, CatalogError> {
        Self::lookup(&self.duas, "dua", id)
    }

    fn dua_bytes(&self, id: DuaBytesId) -> Result<DuaBytes, CatalogError> {
        Self::lookup(&self.dua_bytes, "duabytes", id)
    }

    fn attack_point(&self, id: AttackPointId) -> Result<AttackPoint, CatalogError> {
        Self::lookup(&self.attack_points, "attackpoint", id)
    }

    fn bug(&self, id: BugId) -> Result<Bug, CatalogError> {
        Self::lookup(&self.bugs, "bug", id)
    }

    fn select_uninjected(
        &self,
        fake: bool,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Bug>, CatalogError> {
        let injected: HashSet<BugId> = self
            .builds
            .iter()
            .flat_map(|build| build.bugs.iter().copied())
            .collect();

        let mut candidates = Vec::new();
        for bug in self.bugs.values() {
            if injected.contains(&bug.id) || !self.attack_points.contains_key(&bug.atp) {
                continue;
            }
            if self.trigger_dua(bug)?.fake == fake {
                candidates.push(bug.clone());
            }
        }
        Ok(shuffled(candidates, rng))
    }

    fn record_build(
        &mut self,
        bugs: &[BugId],
        compiled: bool,
        output: &str,
    ) -> Result<Build, CatalogError> {
        let build = Build {
            id: self.builds.iter().map(|build| build.id).max().unwrap_or(0) + 1,
            bugs: bugs.to_vec(),
            compile: compiled,
            output: output.to_string(),
        };
        self.builds.push(build.clone());
        Ok(build)
    }

    fn record_run(
        &mut self,
        build: BuildId,
        fuzzed: Option<BugId>,
        exit_code: i32,
        output: &str,
        success: bool,
    ) -> Result<Run, CatalogError> {
        let run = Run {
            id: self.runs.iter().map(|run| run.id).max().unwrap_or(0) + 1,
            build,
            fuzzed,
            exit_code,
            output: output.to_string(),
            success,
        };
        self.runs.push(run.clone());
        Ok(run)
    }

    fn builds(&self) -> Result<Vec<Build>, CatalogError> {
        Ok(self.builds.clone())
    }

    fn runs(&self) -> Result<Vec<Run>, CatalogError> {
        Ok(self.runs.clone())
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sourcelval (
    id            INTEGER PRIMARY KEY,
    filename      TEXT NOT NULL,
    begin_line    INTEGER NOT NULL,
    begin_column  INTEGER NOT NULL,
    end_line      INTEGER NOT NULL,
    end_column    INTEGER NOT NULL,
    ast_name      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS labelset (
    id         INTEGER PRIMARY KEY,
    ptr        INTEGER NOT NULL,
    inputfile  TEXT NOT NULL,
    labels     TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS dua (
    id               INTEGER PRIMARY KEY,
    lval             INTEGER NOT NULL REFERENCES sourcelval(id),
    all_labels       TEXT NOT NULL DEFAULT '[]',
    inputfile        TEXT NOT NULL,
    max_tcn          INTEGER NOT NULL,
    max_cardinality  INTEGER NOT NULL,
    instr            INTEGER NOT NULL,
    fake_dua         INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS dua_viable_bytes (
    object_id  INTEGER NOT NULL REFERENCES dua(id),
    idx        INTEGER NOT NULL,
    value      INTEGER NOT NULL REFERENCES labelset(id),
    PRIMARY KEY (object_id, idx)
);

CREATE TABLE IF NOT EXISTS duabytes (
    id             INTEGER PRIMARY KEY,
    dua            INTEGER NOT NULL REFERENCES dua(id),
    selected_low   INTEGER NOT NULL,
    selected_high  INTEGER NOT NULL,
    all_labels     TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS attackpoint (
    id            INTEGER PRIMARY KEY,
    filename      TEXT NOT NULL,
    begin_line    INTEGER NOT NULL,
    begin_column  INTEGER NOT NULL,
    end_line      INTEGER NOT NULL,
    end_column    INTEGER NOT NULL,
    type          INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS bug (
    id            INTEGER PRIMARY KEY,
    type          INTEGER NOT NULL,
    trigger_id    INTEGER NOT NULL REFERENCES duabytes(id),
    trigger_lval  INTEGER REFERENCES sourcelval(id),
    atp           INTEGER NOT NULL REFERENCES attackpoint(id),
    max_liveness  REAL NOT NULL DEFAULT 0,
    extra_duas    TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS build (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    compile  INTEGER NOT NULL,
    output   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS build_bugs (
    object_id  INTEGER NOT NULL REFERENCES build(id),
    idx        INTEGER NOT NULL,
    value      INTEGER NOT NULL REFERENCES bug(id),
    PRIMARY KEY (object_id, idx)
);

CREATE INDEX IF NOT EXISTS idx_build_bugs_value ON build_bugs(value);

CREATE TABLE IF NOT EXISTS run (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    build     INTEGER NOT NULL REFERENCES build(id),
    fuzzed    INTEGER REFERENCES bug(id),
    exitcode  INTEGER NOT NULL,
    output    TEXT NOT NULL,
    success   INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_run_build ON run(build);
";

fn id_param(id: u64) -> i64 {
    id as i64
}

fn id_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    row.get::<_, i64>(idx).map(|v| v as u64)
}

fn json_column<T: for<'de> Deserialize<'de>>(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn location_columns(row: &Row<'_>, first: usize) -> rusqlite::Result<SourceLocation> {
    Ok(SourceLocation {
        filename: row.get(first)?,
        begin: Loc {
            line: row.get(first + 1)?,
            column: row.get(first + 2)?,
        },
        end: Loc {
            line: row.get(first + 3)?,
            column: row.get(first + 4)?,
        },
    })
}

/// Catalog backed by a SQLite database laid out like the relational schema
/// the corpus generator writes: one table per entity plus the ordered
/// association tables `dua_viable_bytes` and `build_bugs`.
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        let conn = Connection::open(path).map_err(|e| {
            CatalogError::Storage(format!("Failed to open catalog at {path:?}: {e}"))
        })?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, CatalogError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, CatalogError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, CatalogError> {
        self.conn
            .lock()
            .map_err(|_| CatalogError::Storage("catalog connection lock poisoned".to_string()))
    }

    /// Loads every upstream entity of `snapshot`, followed by its builds and runs.
    pub fn import_snapshot(&self, snapshot: &CatalogSnapshot) -> Result<(), CatalogError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        for lval in &snapshot.source_lvals {
            tx.execute(
                "INSERT INTO sourcelval (id, filename, begin_line, begin_column, end_line, end_column, ast_name)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id_param(lval.id),
                    lval.loc.filename,
                    lval.loc.begin.line,
                    lval.loc.begin.column,
                    lval.loc.end.line,
                    lval.loc.end.column,
                    lval.ast_name,
                ],
            )?;
        }
        for label_set in &snapshot.label_sets {
            tx.execute(
                "INSERT INTO labelset (id, ptr, inputfile, labels) VALUES (?1, ?2, ?3, ?4)",
                params![
                    id_param(label_set.id),
                    id_param(label_set.ptr),
                    label_set.input_file,
                    serde_json::to_string(&label_set.labels)?,
                ],
            )?;
        }
        for dua in &snapshot.duas {
            tx.execute(
                "INSERT INTO dua (id, lval, all_labels, inputfile, max_tcn, max_cardinality, instr, fake_dua)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id_param(dua.id),
                    id_param(dua.lval),
                    serde_json::to_string(&dua.all_labels)?,
                    dua.input_file,
                    dua.max_tcn,
                    dua.max_cardinality,
                    id_param(dua.instr),
                    dua.fake,
                ],
            )?;
            for (idx, label_set) in dua.viable_bytes.iter().enumerate() {
                tx.execute(
                    "INSERT INTO dua_viable_bytes (object_id, idx, value) VALUES (?1, ?2, ?3)",
                    params![id_param(dua.id), idx as i64, id_param(*label_set)],
                )?;
            }
        }
        for bytes in &snapshot.dua_bytes {
            tx.execute(
                "INSERT INTO duabytes (id, dua, selected_low, selected_high, all_labels)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id_param(bytes.id),
                    id_param(bytes.dua),
                    bytes.selected.low,
                    bytes.selected.high,
                    serde_json::to_string(&bytes.all_labels)?,
                ],
            )?;
        }
        for atp in &snapshot.attack_points {
            tx.execute(
                "INSERT INTO attackpoint (id, filename, begin_line, begin_column, end_line, end_column, type)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id_param(atp.id),
                    atp.loc.filename,
                    atp.loc.begin.line,
                    atp.loc.begin.column,
                    atp.loc.end.line,
                    atp.loc.end.column,
                    atp.kind.code(),
                ],
            )?;
        }
        for bug in &snapshot.bugs {
            tx.execute(
                "INSERT INTO bug (id, type, trigger_id, trigger_lval, atp, max_liveness, extra_duas)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id_param(bug.id),
                    bug.kind.code(),
                    id_param(bug.trigger),
                    bug.trigger_lval.map(id_param),
                    id_param(bug.atp),
                    bug.max_liveness,
                    serde_json::to_string(&bug.extra_duas)?,
                ],
            )?;
        }
        for build in &snapshot.builds {
            Self::insert_build(&tx, Some(build.id), &build.bugs, build.compile, &build.output)?;
        }
        for run in &snapshot.runs {
            tx.execute(
                "INSERT INTO run (id, build, fuzzed, exitcode, output, success)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id_param(run.id),
                    id_param(run.build),
                    run.fuzzed.map(id_param),
                    run.exit_code,
                    run.output,
                    run.success,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_build(
        conn: &Connection,
        id: Option<BuildId>,
        bugs: &[BugId],
        compiled: bool,
        output: &str,
    ) -> Result<BuildId, CatalogError> {
        conn.execute(
            "INSERT INTO build (id, compile, output) VALUES (?1, ?2, ?3)",
            params![id.map(id_param), compiled, output],
        )?;
        let build_id = conn.last_insert_rowid() as BuildId;
        for (idx, bug) in bugs.iter().enumerate() {
            conn.execute(
                "INSERT INTO build_bugs (object_id, idx, value) VALUES (?1, ?2, ?3)",
                params![id_param(build_id), idx as i64, id_param(*bug)],
            )?;
        }
        Ok(build_id)
    }

    fn build_bugs(conn: &Connection, build: BuildId) -> Result<Vec<BugId>, CatalogError> {
        let mut stmt =
            conn.prepare("SELECT value FROM build_bugs WHERE object_id = ?1 ORDER BY idx")?;
        let rows = stmt.query_map(params![id_param(build)], |row| id_column(row, 0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn bug_from_row(row: &Row<'_>) -> rusqlite::Result<(Bug, i64)> {
        let code: i64 = row.get(1)?;
        let bug = Bug {
            id: id_column(row, 0)?,
            // Replaced below once the code is validated.
            kind: BugKind::PointerAdd,
            trigger: id_column(row, 2)?,
            trigger_lval: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
            atp: id_column(row, 4)?,
            max_liveness: row.get(5)?,
            extra_duas: json_column(row, 6)?,
        };
        Ok((bug, code))
    }

    fn load_bug(conn: &Connection, id: BugId) -> Result<Bug, CatalogError> {
        let (mut bug, code) = conn
            .query_row(
                "SELECT id, type, trigger_id, trigger_lval, atp, max_liveness, extra_duas
                 FROM bug WHERE id = ?1",
                params![id_param(id)],
                Self::bug_from_row,
            )
            .optional()?
            .ok_or(CatalogError::NotFound { table: "bug", id })?;
        bug.kind = BugKind::from_code(code).ok_or(CatalogError::InvalidCode {
            what: "bug type",
            code,
        })?;
        Ok(bug)
    }
}

impl Catalog for SqliteCatalog {
    fn source_lval(&self, id: LvalId) -> Result<SourceLval, CatalogError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT filename, begin_line, begin_column, end_line, end_column, ast_name
             FROM sourcelval WHERE id = ?1",
            params![id_param(id)],
            |row| {
                Ok(SourceLval {
                    id,
                    loc: location_columns(row, 0)?,
                    ast_name: row.get(5)?,
                })
            },
        )
        .optional()?
        .ok_or(CatalogError::NotFound {
            table: "sourcelval",
            id,
        })
    }

    fn label_set(&self, id: LabelSetId) -> Result<LabelSet, CatalogError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT ptr, inputfile, labels FROM labelset WHERE id = ?1",
            params![id_param(id)],
            |row| {
                Ok(LabelSet {
                    id,
                    ptr: id_column(row, 0)?,
                    input_file: row.get(1)?,
                    labels: json_column(row, 2)?,
                })
            },
        )
        .optional()?
        .ok_or(CatalogError::NotFound {
            table: "labelset",
            id,
        })
    }

    fn dua(&self, id: DuaId) -> Result<Dua, CatalogError> {
        let conn = self.conn()?;
        let mut dua = conn
            .query_row(
                "SELECT lval, all_labels, inputfile, max_tcn, max_cardinality, instr, fake_dua
                 FROM dua WHERE id = ?1",
                params![id_param(id)],
                |row| {
                    Ok(Dua {
                        id,
                        lval: id_column(row, 0)?,
                        all_labels: json_column(row, 1)?,
                        input_file: row.get(2)?,
                        max_tcn: row.get(3)?,
                        max_cardinality: row.get(4)?,
                        instr: id_column(row, 5)?,
                        fake: row.get(6)?,
                        viable_bytes: Vec::new(),
                    })
                },
            )
            .optional()?
            .ok_or(CatalogError::NotFound { table: "dua", id })?;

        let mut stmt =
            conn.prepare("SELECT value FROM dua_viable_bytes WHERE object_id = ?1 ORDER BY idx")?;
        let rows = stmt.query_map(params![id_param(id)], |row| id_column(row, 0))?;
        dua.viable_bytes = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(dua)
    }

    fn dua_bytes(&self, id: DuaBytesId) -> Result<DuaBytes, CatalogError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT dua, selected_low, selected_high, all_labels FROM duabytes WHERE id = ?1",
            params![id_param(id)],
            |row| {
                Ok(DuaBytes {
                    id,
                    dua: id_column(row, 0)?,
                    selected: ByteRange {
                        low: row.get(1)?,
                        high: row.get(2)?,
                    },
                    all_labels: json_column(row, 3)?,
                })
            },
        )
        .optional()?
        .ok_or(CatalogError::NotFound {
            table: "duabytes",
            id,
        })
    }

    fn attack_point(&self, id: AttackPointId) -> Result<AttackPoint, CatalogError> {
        let conn = self.conn()?;
        let (loc, code) = conn
            .query_row(
                "SELECT filename, begin_line, begin_column, end_line, end_column, type
                 FROM attackpoint WHERE id = ?1",
                params![id_param(id)],
                |row| Ok((location_columns(row, 0)?, row.get::<_, i64>(5)?)),
            )
            .optional()?
            .ok_or(CatalogError::NotFound {
                table: "attackpoint",
                id,
            })?;
        let kind = AttackPointKind::from_code(code).ok_or(CatalogError::InvalidCode {
            what: "attack point type",
            code,
        })?;
        Ok(AttackPoint { id, loc, kind })
    }

    fn bug(&self, id: BugId) -> Result<Bug, CatalogError> {
        let conn = self.conn()?;
        Self::load_bug(&conn, id)
    }

    fn select_uninjected(
        &self,
        fake: bool,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Bug>, CatalogError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT bug.id FROM bug
             JOIN attackpoint ON attackpoint.id = bug.atp
             JOIN duabytes ON duabytes.id = bug.trigger_id
             JOIN dua ON dua.id = duabytes.dua
             WHERE dua.fake_dua = ?1
               AND NOT EXISTS (SELECT 1 FROM build_bugs WHERE build_bugs.value = bug.id)
             ORDER BY bug.id",
        )?;
        let ids = stmt
            .query_map(params![fake], |row| id_column(row, 0))?
            .collect::<Result<Vec<_>, _>>()?;
        let bugs = ids
            .into_iter()
            .map(|id| Self::load_bug(&conn, id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(shuffled(bugs, rng))
    }

    fn record_build(
        &mut self,
        bugs: &[BugId],
        compiled: bool,
        output: &str,
    ) -> Result<Build, CatalogError> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let id = Self::insert_build(&tx, None, bugs, compiled, output)?;
        tx.commit()?;
        Ok(Build {
            id,
            bugs: bugs.to_vec(),
            compile: compiled,
            output: output.to_string(),
        })
    }

    fn record_run(
        &mut self,
        build: BuildId,
        fuzzed: Option<BugId>,
        exit_code: i32,
        output: &str,
        success: bool,
    ) -> Result<Run, CatalogError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO run (build, fuzzed, exitcode, output, success) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id_param(build),
                fuzzed.map(id_param),
                exit_code,
                output,
                success
            ],
        )?;
        Ok(Run {
            id: conn.last_insert_rowid() as u64,
            build,
            fuzzed,
            exit_code,
            output: output.to_string(),
            success,
        })
    }

    fn builds(&self) -> Result<Vec<Build>, CatalogError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, compile, output FROM build ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    id_column(row, 0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(id, compile, output)| {
                Ok(Build {
                    id,
                    bugs: Self::build_bugs(&conn, id)?,
                    compile,
                    output,
                })
            })
            .collect()
    }

    fn runs(&self) -> Result<Vec<Run>, CatalogError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, build, fuzzed, exitcode, output, success FROM run ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Run {
                id: id_column(row, 0)?,
                build: id_column(row, 1)?,
                fuzzed: row.get::<_, Option<i64>>(2)?.map(|v| v as u64),
                exit_code: row.get(3)?,
                output: row.get(4)?,
                success: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

/// Shared fixtures for tests across the crate.
#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;

    pub const INPUT_FILE: &str = "testsmall.bin";

    pub fn location(filename: &str, line: u32) -> SourceLocation {
        SourceLocation {
            filename: filename.to_string(),
            begin: Loc { line, column: 1 },
            end: Loc {
                line,
                column: 20,
            },
        }
    }

    /// One real bug (id 42) and one control bug (id 43), each with its own
    /// DUA over `testsmall.bin` offsets 4..8, plus an extra leak bug (id 44)
    /// with an auxiliary DUA at offsets 8..12.
    pub fn sample_snapshot() -> CatalogSnapshot {
        let lvals = vec![
            SourceLval {
                id: 1,
                loc: location("src/file.c", 100),
                ast_name: "buf".to_string(),
            },
            SourceLval {
                id: 2,
                loc: location("src/readelf.c", 40),
                ast_name: "hdr->e_shnum".to_string(),
            },
        ];
        let label_sets = (0..4u64)
            .map(|i| LabelSet {
                id: 10 + i,
                ptr: 0x1000 + i,
                input_file: INPUT_FILE.to_string(),
                labels: vec![4 + i as u32],
            })
            .collect();
        let dua = |id: DuaId, fake: bool| Dua {
            id,
            lval: 1,
            all_labels: vec![4, 5, 6, 7],
            input_file: INPUT_FILE.to_string(),
            max_tcn: 2,
            max_cardinality: 4,
            instr: 777,
            fake,
            viable_bytes: vec![10, 11, 12, 13],
        };
        let duas = vec![dua(100, false), dua(101, true), {
            let mut extra = dua(102, false);
            extra.all_labels = vec![8, 9, 10, 11];
            extra.viable_bytes = Vec::new();
            extra
        }];
        let dua_bytes = vec![
            DuaBytes {
                id: 200,
                dua: 100,
                selected: ByteRange { low: 0, high: 4 },
                all_labels: vec![4, 5, 6, 7],
            },
            DuaBytes {
                id: 201,
                dua: 101,
                selected: ByteRange { low: 0, high: 4 },
                all_labels: vec![4, 5, 6, 7],
            },
            DuaBytes {
                id: 202,
                dua: 102,
                selected: ByteRange { low: 0, high: 4 },
                all_labels: vec![8, 9, 10, 11],
            },
        ];
        let attack_points = vec![
            AttackPoint {
                id: 300,
                loc: location("src/file.c", 120),
                kind: AttackPointKind::PointerWrite,
            },
            AttackPoint {
                id: 301,
                loc: location("src/readelf.c", 90),
                kind: AttackPointKind::FunctionCall,
            },
        ];
        let bugs = vec![
            Bug {
                id: 42,
                kind: BugKind::PointerAdd,
                trigger: 200,
                trigger_lval: Some(1),
                atp: 300,
                max_liveness: 1.5,
                extra_duas: Vec::new(),
            },
            Bug {
                id: 43,
                kind: BugKind::RelativeWrite,
                trigger: 201,
                trigger_lval: Some(1),
                atp: 300,
                max_liveness: 0.0,
                extra_duas: Vec::new(),
            },
            Bug {
                id: 44,
                kind: BugKind::PrintfLeak,
                trigger: 200,
                trigger_lval: None,
                atp: 301,
                max_liveness: 3.0,
                extra_duas: vec![202],
            },
        ];
        CatalogSnapshot {
            source_lvals: lvals,
            label_sets,
            duas,
            dua_bytes,
            attack_points,
            bugs,
            builds: Vec::new(),
            runs: Vec::new(),
        }
    }

    pub fn sample_catalog() -> InMemoryCatalog {
        InMemoryCatalog::from_snapshot(sample_snapshot())
    }
}
