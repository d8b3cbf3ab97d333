use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, OptionalExtension, params};

pub const CATALOG_FILE: &str = "metadata.db";

/// Per-episode row of the `episodes` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeRecord {
    pub id: u32,
    /// Session directory the episode was converted from.
    pub key: String,
    pub file_path: String,
    pub recording_folderpath: String,
    pub steps: u32,
}

/// A JPEG-encoded image of one camera view at one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub step_index: u32,
    pub camera: &'static str,
    pub jpeg: Vec<u8>,
}

/// `metadata.db` alongside the step shards.
///
/// Schema:
/// - episodes(id INTEGER PRIMARY KEY, key TEXT, file_path TEXT, recording_folderpath TEXT, steps INT)
/// - frames(episode_id INT, step_index INT, camera TEXT, jpeg BLOB)
/// - session(meta_key TEXT PRIMARY KEY, meta_value TEXT)
pub struct EpisodeCatalog {
    path: PathBuf,
    conn: Connection,
}

impl EpisodeCatalog {
    /// Create a fresh catalog in `dir`.
    pub fn create(dir: &Path, overwrite: bool) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(CATALOG_FILE);
        if path.exists() {
            if !overwrite {
                bail!("{CATALOG_FILE} already exists in {} (use overwrite option)", dir.display());
            }
            for stale in [path.clone(), path.with_extension("db-wal"), path.with_extension("db-shm")] {
                if stale.exists() {
                    fs::remove_file(&stale)
                        .with_context(|| format!("failed to remove {}", stale.display()))?;
                }
            }
        }
        let conn =
            Connection::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS episodes (
                id INTEGER PRIMARY KEY,
                key TEXT NOT NULL,
                file_path TEXT NOT NULL,
                recording_folderpath TEXT NOT NULL,
                steps INT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS frames (
                episode_id INT NOT NULL,
                step_index INT NOT NULL,
                camera TEXT NOT NULL,
                jpeg BLOB NOT NULL,
                PRIMARY KEY (episode_id, step_index, camera)
            );
            CREATE TABLE IF NOT EXISTS session (
                meta_key TEXT PRIMARY KEY,
                meta_value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self { path, conn })
    }

    /// Open an existing catalog.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(CATALOG_FILE);
        if !path.is_file() {
            bail!("no {CATALOG_FILE} in {}", dir.display());
        }
        let conn =
            Connection::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self { path, conn })
    }

    /// Insert an episode and all of its frames in one transaction.
    pub fn insert_episode(&mut self, record: &EpisodeRecord, frames: &[EncodedFrame]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO episodes (id, key, file_path, recording_folderpath, steps) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id as i64,
                record.key,
                record.file_path,
                record.recording_folderpath,
                record.steps as i64
            ],
        )
        .with_context(|| format!("failed to insert episode {} ({})", record.id, record.key))?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO frames (episode_id, step_index, camera, jpeg) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for frame in frames {
                stmt.execute(params![
                    record.id as i64,
                    frame.step_index as i64,
                    frame.camera,
                    frame.jpeg
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Set a session meta value by key (stored as TEXT; put JSON if needed).
    pub fn set_meta<K: AsRef<str>, V: AsRef<str>>(&mut self, key: K, value: V) -> Result<()> {
        self.conn.execute(
            "INSERT INTO session (meta_key, meta_value) VALUES (?1, ?2)
             ON CONFLICT(meta_key) DO UPDATE SET meta_value=excluded.meta_value",
            params![key.as_ref(), value.as_ref()],
        )?;
        Ok(())
    }

    pub fn get_meta<K: AsRef<str>>(&self, key: K) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT meta_value FROM session WHERE meta_key = ?1",
                params![key.as_ref()],
                |row| row.get::<_, String>(0),
            )
            .optional()?)
    }

    /// All episodes ordered by id.
    pub fn episodes(&self) -> Result<Vec<EpisodeRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, key, file_path, recording_folderpath, steps FROM episodes ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(EpisodeRecord {
                id: row.get::<_, i64>(0)? as u32,
                key: row.get(1)?,
                file_path: row.get(2)?,
                recording_folderpath: row.get(3)?,
                steps: row.get::<_, i64>(4)? as u32,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn frame(&self, episode_id: u32, step_index: u32, camera: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .conn
            .query_row(
                "SELECT jpeg FROM frames WHERE episode_id = ?1 AND step_index = ?2 AND camera = ?3",
                params![episode_id as i64, step_index as i64, camera],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
