//! The persistent relational store used as the exchange medium between
//! pipeline stages.
//!
//! The store is single-writer: exactly one pipeline process owns it. Every
//! stage recreates the tables it owns through [`Store::reset_tables`], so a
//! stage can always be re-run against an existing store. The projections
//! `orthos_all`, `blocks_all` and `breaks_all` are views recreated by
//! [`Store::refresh_views`] and carry no independent state.

use chrono::Utc;
use color_eyre::eyre::{Report, Result, WrapErr};
use log::debug;
use rusqlite::Connection;
use std::path::Path;

// ----------------------------------------------------------------------------
// Schema

/// Base tables. `CREATE TABLE IF NOT EXISTS` throughout so the batch can be
/// replayed after any subset of tables was dropped.
const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS genes (
    pid           TEXT PRIMARY KEY,
    sp            TEXT NOT NULL,
    gpart         TEXT NOT NULL,
    pnum_all      INTEGER NOT NULL,
    pnum_CDS      INTEGER NOT NULL,
    pnum_display  INTEGER NOT NULL,
    feat          TEXT NOT NULL,
    loc_start     INTEGER NOT NULL,
    loc_end       INTEGER NOT NULL,
    strand        INTEGER NOT NULL,
    length        INTEGER NOT NULL,
    product       TEXT,
    GC            REAL,
    delta_GC      REAL,
    paralogs_n    INTEGER NOT NULL DEFAULT 0,
    paralogs      TEXT
);
CREATE INDEX IF NOT EXISTS idx_genes_sp_gpart ON genes (sp, gpart, pnum_all);
CREATE INDEX IF NOT EXISTS idx_genes_sp_cds ON genes (sp, pnum_CDS);

CREATE TABLE IF NOT EXISTS genomes (
    sp                TEXT PRIMARY KEY,
    name              TEXT,
    strain            TEXT,
    taxonomy          TEXT,
    GC                REAL,
    max_pnum_display  INTEGER
);

CREATE TABLE IF NOT EXISTS genome_parts (
    sp     TEXT NOT NULL,
    gpart  TEXT NOT NULL,
    min    INTEGER NOT NULL,
    max    INTEGER NOT NULL,
    PRIMARY KEY (sp, gpart)
);

CREATE TABLE IF NOT EXISTS orthos (
    oid          INTEGER PRIMARY KEY,
    pid1         TEXT NOT NULL,
    pid2         TEXT NOT NULL,
    o_ident      REAL NOT NULL,
    o_alen       INTEGER NOT NULL,
    pnum_order1  INTEGER,
    pnum_order2  INTEGER,
    noblock      INTEGER NOT NULL DEFAULT 0,
    UNIQUE (pid1, pid2)
);
CREATE INDEX IF NOT EXISTS idx_orthos_pid1 ON orthos (pid1);
CREATE INDEX IF NOT EXISTS idx_orthos_pid2 ON orthos (pid2);

CREATE TABLE IF NOT EXISTS pairs (
    pairid     INTEGER PRIMARY KEY,
    sp1        TEXT NOT NULL,
    sp2        TEXT NOT NULL,
    oid_start  INTEGER NOT NULL,
    oid_end    INTEGER NOT NULL,
    direction  INTEGER NOT NULL,
    inblocks1  INTEGER NOT NULL,
    inblocks2  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pairs_sp ON pairs (sp1, sp2);

CREATE TABLE IF NOT EXISTS blocks (
    blockid       INTEGER PRIMARY KEY,
    sp1           TEXT NOT NULL,
    sp2           TEXT NOT NULL,
    oid_start     INTEGER NOT NULL,
    oid_end       INTEGER NOT NULL,
    direction     INTEGER NOT NULL,
    block_size    INTEGER NOT NULL,
    block_order1  INTEGER NOT NULL,
    block_order2  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_blocks_sp ON blocks (sp1, sp2);
CREATE INDEX IF NOT EXISTS idx_blocks_bucket ON blocks (sp1, sp2, direction, block_order1);

CREATE TABLE IF NOT EXISTS breaks (
    breakid      INTEGER PRIMARY KEY,
    sp1          TEXT NOT NULL,
    sp2          TEXT NOT NULL,
    left_block   INTEGER NOT NULL REFERENCES blocks (blockid),
    right_block  INTEGER NOT NULL REFERENCES blocks (blockid),
    direction    INTEGER NOT NULL,
    break_size1  INTEGER NOT NULL,
    break_size2  INTEGER NOT NULL,
    inblocks1    INTEGER NOT NULL,
    inblocks2    INTEGER NOT NULL,
    opposite     INTEGER REFERENCES breaks (breakid) ON DELETE CASCADE,
    break_sum    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_breaks_sp ON breaks (sp1, sp2);
CREATE INDEX IF NOT EXISTS idx_breaks_sum ON breaks (break_sum);

CREATE TABLE IF NOT EXISTS breaks_genes (
    breakid   INTEGER NOT NULL REFERENCES breaks (breakid) ON DELETE CASCADE,
    pid       TEXT NOT NULL,
    side      INTEGER NOT NULL,
    ortho     TEXT,
    ortho_in  INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (breakid, pid)
);
CREATE INDEX IF NOT EXISTS idx_breaks_genes_breakid ON breaks_genes (breakid);

CREATE TABLE IF NOT EXISTS breaks_ranking (
    breakid        INTEGER PRIMARY KEY REFERENCES breaks (breakid) ON DELETE CASCADE,
    real_size1     INTEGER NOT NULL,
    real_size2     INTEGER NOT NULL,
    tRNA_both      INTEGER NOT NULL,
    tRNA_both_ext  INTEGER NOT NULL,
    content1       TEXT NOT NULL,
    content2       TEXT NOT NULL,
    paralogs1      INTEGER NOT NULL,
    paralogs2      INTEGER NOT NULL,
    delta_GC1      REAL NOT NULL,
    delta_GC2      REAL NOT NULL,
    cycle          INTEGER NOT NULL DEFAULT 0,
    graphid        INTEGER
);

CREATE TABLE IF NOT EXISTS breaks_graph (
    graphid    INTEGER NOT NULL,
    from_name  TEXT NOT NULL,
    to_name    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS goc (
    sp1    TEXT NOT NULL,
    sp2    TEXT NOT NULL,
    pos    INTEGER NOT NULL,
    score  REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS info (
    key    TEXT PRIMARY KEY,
    value  TEXT
);
";

/// Derived projections. Views reflect their base tables, so dropping and
/// recreating them after a schema change is all "materialization" takes.
const VIEWS_SQL: &str = "
DROP VIEW IF EXISTS breaks_all;
DROP VIEW IF EXISTS blocks_all;
DROP VIEW IF EXISTS orthos_all;

CREATE VIEW orthos_all AS
SELECT o.oid, o.pid1, o.pid2, o.o_ident, o.o_alen,
       o.pnum_order1, o.pnum_order2, o.noblock,
       g1.sp sp1, g2.sp sp2,
       g1.gpart gpart1, g2.gpart gpart2,
       g1.pnum_CDS pnum_CDS1, g2.pnum_CDS pnum_CDS2,
       g1.pnum_all pnum_all1, g2.pnum_all pnum_all2,
       g1.pnum_display pnum_display1, g2.pnum_display pnum_display2,
       g1.loc_start loc_start1, g1.loc_end loc_end1, g1.strand strand1,
       g2.loc_start loc_start2, g2.loc_end loc_end2, g2.strand strand2
FROM orthos o
JOIN genes g1 ON o.pid1 = g1.pid
JOIN genes g2 ON o.pid2 = g2.pid;

CREATE VIEW blocks_all AS
SELECT b.blockid, b.sp1, b.sp2, b.oid_start, b.oid_end, b.direction,
       b.block_size, b.block_order1, b.block_order2,
       os.gpart1 gpart1, os.gpart2 gpart2,
       os.pid1 pid_start1, os.pid2 pid_start2,
       oe.pid1 pid_end1, oe.pid2 pid_end2,
       os.pnum_CDS1 pnum_CDS_start1, oe.pnum_CDS1 pnum_CDS_end1,
       os.pnum_CDS2 pnum_CDS_start2, oe.pnum_CDS2 pnum_CDS_end2,
       os.pnum_display1 pnum_display_start1, oe.pnum_display1 pnum_display_end1,
       os.pnum_display2 pnum_display_start2, oe.pnum_display2 pnum_display_end2
FROM blocks b
JOIN orthos_all os ON b.oid_start = os.oid
JOIN orthos_all oe ON b.oid_end = oe.oid;

CREATE VIEW breaks_all AS
SELECT k.breakid, k.sp1, k.sp2, k.direction,
       k.left_block, k.right_block,
       k.break_size1, k.break_size2, k.inblocks1, k.inblocks2,
       k.opposite, k.break_sum,
       bl.gpart1 gpart1, bl.gpart2 gpart2,
       bl.pid_end1 left1, br.pid_start1 right1,
       bl.pid_end2 left2, br.pid_start2 right2,
       bl.pnum_display_end1 pnum_display_left1,
       br.pnum_display_start1 pnum_display_right1,
       bl.pnum_display_end2 pnum_display_left2,
       br.pnum_display_start2 pnum_display_right2,
       r.real_size1, r.real_size2, r.tRNA_both, r.tRNA_both_ext,
       r.content1, r.content2, r.paralogs1, r.paralogs2,
       r.delta_GC1, r.delta_GC2, r.cycle, r.graphid
FROM breaks k
JOIN blocks_all bl ON k.left_block = bl.blockid
JOIN blocks_all br ON k.right_block = br.blockid
LEFT JOIN breaks_ranking r ON k.breakid = r.breakid;
";

// ----------------------------------------------------------------------------
// Store

/// Handle over the SQLite store shared by all pipeline stages.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a store at the given path.
    pub fn open<P>(path: P) -> Result<Self, Report>
    where
        P: AsRef<Path>,
    {
        let conn = Connection::open(path.as_ref())
            .wrap_err_with(|| format!("Failed to open store: {:?}", path.as_ref()))?;
        let store = Store { conn };
        store.initialize()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self, Report> {
        let store = Store { conn: Connection::open_in_memory()? };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<(), Report> {
        self.conn.execute_batch(
            "PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;
        self.conn.execute_batch(SCHEMA_SQL)?;
        self.conn.execute_batch(VIEWS_SQL)?;
        Ok(())
    }

    /// Direct access to the connection, for stage-owned queries.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Drop and recreate a stage's tables, then restore the projections.
    /// This is what makes stage re-entry idempotent.
    pub fn reset_tables(&self, tables: &[&str]) -> Result<(), Report> {
        for table in tables {
            debug!("Resetting table: {table}");
            self.conn.execute_batch(&format!("DROP TABLE IF EXISTS {table};"))?;
        }
        self.conn.execute_batch(SCHEMA_SQL)?;
        self.refresh_views()?;
        Ok(())
    }

    /// Drop and recreate the `orthos_all`, `blocks_all` and `breaks_all`
    /// projections.
    pub fn refresh_views(&self) -> Result<(), Report> {
        self.conn.execute_batch(VIEWS_SQL)?;
        Ok(())
    }

    /// Upsert a key into the `info` table.
    pub fn set_info(&self, key: &str, value: &str) -> Result<(), Report> {
        self.conn.execute(
            "INSERT INTO info (key, value) VALUES (?1, ?2)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    pub fn get_info(&self, key: &str) -> Result<Option<String>, Report> {
        use rusqlite::OptionalExtension;
        let value = self
            .conn
            .query_row("SELECT value FROM info WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    /// Record that a stage ran, with its parameters, for provenance.
    pub fn record_stage(&self, stage: &str, params: &str) -> Result<(), Report> {
        self.set_info(&format!("stage_{stage}"), params)?;
        self.set_info(&format!("stage_{stage}_date"), &Utc::now().to_rfc3339())?;
        self.set_info("version", env!("CARGO_PKG_VERSION"))?;
        Ok(())
    }
}
