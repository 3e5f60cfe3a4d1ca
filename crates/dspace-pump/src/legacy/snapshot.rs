use super::{LegacyTable, RecordSource, SourceRecord};
use crate::error::{MigrateError, Result};
use crate::relational::{quote_ident, windowed, RelationalSource};
use async_trait::async_trait;
use serde_json::Value;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Rows per read while exporting.
const EXPORT_CHUNK: u64 = 20_000;

/// Reads `<dir>/<table>.json` files holding a JSON array of row objects.
pub struct SnapshotRecords {
    dir: PathBuf,
}

impl SnapshotRecords {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, table: &LegacyTable) -> PathBuf {
        self.dir.join(format!("{}.json", table.name))
    }
}

#[async_trait]
impl RecordSource for SnapshotRecords {
    async fn load(&mut self, table: &LegacyTable) -> Result<Vec<SourceRecord>> {
        let path = self.path_for(table);
        if !path.exists() {
            warn!("Snapshot {} not found, treating {} as empty", path.display(), table.name);
            return Ok(Vec::new());
        }
        let content = tokio::fs::read_to_string(&path).await?;
        let rows: Vec<Value> = serde_json::from_str(&content)
            .map_err(|e| MigrateError::Config(format!("{}: {}", path.display(), e)))?;
        debug!("{}: {} rows from snapshot", table.name, rows.len());

        rows.into_iter()
            .map(|row| match row {
                Value::Object(attrs) => SourceRecord::from_object(table, attrs),
                other => Err(MigrateError::Config(format!(
                    "{}: expected row objects, found {}",
                    path.display(),
                    other
                ))),
            })
            .collect()
    }

    fn describe(&self) -> String {
        format!("snapshots in {}", self.dir.display())
    }
}

/// Dump `table` to `<dir>/<table>.json`, reading in id-ordered windows.
/// The file is written under a temporary name and renamed when complete.
pub async fn export_table(
    source: &mut RelationalSource,
    table: &LegacyTable,
    dir: &Path,
) -> Result<u64> {
    let started = Instant::now();
    let quoted = quote_ident(table.name);
    let total = source
        .fetch_one(&format!("SELECT COUNT(*) FROM {}", quoted))
        .await?
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
        .max(0) as u64;
    info!("[EXPORT] {}: start rows={}", table.name, total);

    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.json", table.name));
    let temp_path = path.with_extension("json.tmp");
    let mut out = BufWriter::new(std::fs::File::create(&temp_path)?);

    let base = format!(
        "SELECT * FROM {} ORDER BY {}",
        quoted,
        quote_ident(table.id_column)
    );
    out.write_all(b"[")?;
    let mut exported = 0u64;
    let mut offset = 0u64;
    loop {
        let rows = source
            .query(&windowed(&base, EXPORT_CHUNK, offset), &[])
            .await?;
        let got = rows.len() as u64;
        for row in rows.to_json_objects() {
            if exported > 0 {
                out.write_all(b",")?;
            }
            serde_json::to_writer(&mut out, &row)?;
            exported += 1;
        }
        if got < EXPORT_CHUNK {
            break;
        }
        offset += EXPORT_CHUNK;
    }
    out.write_all(b"]")?;
    out.flush()?;
    drop(out);
    std::fs::rename(&temp_path, &path)?;

    info!(
        "[EXPORT] {}: done rows={}/{} elapsed={:.1}s",
        table.name,
        exported,
        total,
        started.elapsed().as_secs_f64()
    );
    Ok(exported)
}
