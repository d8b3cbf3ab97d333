//! Rotating `.npy` shard writer for structured step rows.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use npyz::{NpyWriter, WriteOptions, WriterBuilder};

use crate::schema::StructuredRow;

/// Shard file name prefix for step rows.
pub const STEPS_PREFIX: &str = "steps";

/// Writes `<prefix>.npy` (unbounded) or `<prefix>-NNNNN.npy` shards of at
/// most `rows_per_shard` rows. Shards are written to a `.tmp` path and renamed
/// once complete.
pub struct ShardedRowWriter<T: StructuredRow> {
    out_dir: PathBuf,
    prefix: String,
    rows_per_shard: Option<usize>,
    next_shard: usize,
    shards_written: usize,
    rows_written: usize,
    current: Option<Shard<T>>,
}

impl<T: StructuredRow> ShardedRowWriter<T> {
    /// Prepare `out_dir`, clearing earlier shards when `overwrite` is set and
    /// refusing to clobber them otherwise.
    pub fn create(
        out_dir: &Path,
        prefix: &str,
        rows_per_shard: Option<usize>,
        overwrite: bool,
    ) -> Result<Self> {
        if rows_per_shard == Some(0) {
            bail!("rows_per_shard must be > 0 when specified");
        }
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;
        let existing = existing_shards(out_dir, prefix)?;
        if !existing.is_empty() {
            if !overwrite {
                bail!(
                    "found existing {prefix} shards in {} (use overwrite option)",
                    out_dir.display()
                );
            }
            for path in existing {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
            }
        }
        Ok(Self {
            out_dir: out_dir.to_path_buf(),
            prefix: prefix.to_string(),
            rows_per_shard,
            next_shard: 0,
            shards_written: 0,
            rows_written: 0,
            current: None,
        })
    }

    /// Append rows, rotating to a fresh shard whenever one fills up.
    pub fn write(&mut self, rows: &[T]) -> Result<()> {
        let limit = self.rows_per_shard.unwrap_or(usize::MAX);
        let mut start = 0usize;
        while start < rows.len() {
            let shard = match self.current.as_mut() {
                Some(shard) => shard,
                None => {
                    let shard = Shard::create(&self.out_dir, &self.shard_name())?;
                    self.next_shard += 1;
                    self.current.insert(shard)
                }
            };
            let take = (limit - shard.rows).min(rows.len() - start);
            shard.write(&rows[start..start + take])?;
            start += take;
            self.rows_written += take;
            if shard.rows >= limit {
                if let Some(full) = self.current.take() {
                    full.finish()?;
                    self.shards_written += 1;
                }
            }
        }
        Ok(())
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    /// Finalise the open shard and return the number of shards on disk.
    pub fn finish(mut self) -> Result<usize> {
        if let Some(shard) = self.current.take() {
            shard.finish()?;
            self.shards_written += 1;
        }
        Ok(self.shards_written)
    }

    fn shard_name(&self) -> String {
        match self.rows_per_shard {
            Some(_) => format!("{}-{:05}.npy", self.prefix, self.next_shard),
            None => format!("{}.npy", self.prefix),
        }
    }
}

/// `<prefix>.npy` and `<prefix>-*.npy` in `dir`, sorted.
pub fn existing_shards(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let single = format!("{prefix}.npy");
    let numbered = format!("{prefix}-");
    let mut shards: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_str()?;
            let is_shard =
                name == single || (name.starts_with(&numbered) && name.ends_with(".npy"));
            is_shard.then(|| entry.path())
        })
        .collect();
    shards.sort();
    Ok(shards)
}

struct Shard<T: StructuredRow> {
    writer: NpyWriter<T, BufWriter<File>>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    rows: usize,
}

impl<T: StructuredRow> Shard<T> {
    fn create(out_dir: &Path, name: &str) -> Result<Self> {
        let final_path = out_dir.join(name);
        let tmp_path = final_path.with_extension("npy.tmp");
        let file = File::create(&tmp_path)
            .with_context(|| format!("failed to create {}", tmp_path.display()))?;
        let writer = WriteOptions::new()
            .dtype(T::dtype())
            .writer(BufWriter::new(file))
            .begin_1d()?;
        Ok(Self {
            writer,
            tmp_path,
            final_path,
            rows: 0,
        })
    }

    fn write(&mut self, rows: &[T]) -> Result<()> {
        self.writer.extend(rows.iter().copied())?;
        self.rows += rows.len();
        Ok(())
    }

    fn finish(self) -> Result<()> {
        let Shard {
            writer,
            tmp_path,
            final_path,
            ..
        } = self;
        writer.finish()?;
        fs::rename(&tmp_path, &final_path).with_context(|| {
            format!(
                "failed to rename {} -> {}",
                tmp_path.display(),
                final_path.display()
            )
        })?;
        Ok(())
    }
}
