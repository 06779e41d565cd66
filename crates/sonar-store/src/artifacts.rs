use serde::Serialize;
use tracing::instrument;

use sonar_core::artifact::{url_path_for, ArtifactEvent};
use sonar_core::DeviceName;

use crate::database::Database;
use crate::error::StoreError;

/// Upper bound on rows returned by a single history query.
pub const MAX_HISTORY_LIMIT: u32 = 500;
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

/// A row to append after an upload has been written to disk.
#[derive(Clone, Debug, Default)]
pub struct NewArtifact {
    pub timestamp: String,
    pub device_name: String,
    pub latitude: String,
    pub longitude: String,
    pub original_name: String,
    pub filename: String,
    pub size: u64,
    pub mime_type: String,
    pub path: String,
    pub client_ip: String,
}

impl NewArtifact {
    /// The live notification matching what a later history query returns for this row.
    pub fn to_event(&self) -> ArtifactEvent {
        ArtifactEvent::new(&self.device_name, &self.timestamp, &self.filename, self.size)
            .with_location(Some(self.latitude.clone()), Some(self.longitude.clone()))
    }
}

/// History entry as served by `GET /api/audios`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub timestamp: String,
    pub device_name: String,
    pub filename: String,
    pub size: u64,
    pub url_path: String,
    pub latitude: String,
    pub longitude: String,
}

pub struct ArtifactRepo {
    db: Database,
}

impl ArtifactRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append one row. Rows are never updated or deleted.
    #[instrument(skip_all, fields(device = %artifact.device_name, filename = %artifact.filename))]
    pub fn append(&self, artifact: &NewArtifact) -> Result<i64, StoreError> {
        let device_key = DeviceName::normalize(&artifact.device_name)
            .map(|d| d.as_str().to_owned())
            .unwrap_or_default();
        let size = i64::try_from(artifact.size).unwrap_or(i64::MAX);

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO artifacts (timestamp, device_name, device_key, latitude, longitude,
                                        original_name, filename, size, mime_type, path, client_ip)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                rusqlite::params![
                    artifact.timestamp,
                    artifact.device_name,
                    device_key,
                    artifact.latitude,
                    artifact.longitude,
                    artifact.original_name,
                    artifact.filename,
                    size,
                    artifact.mime_type,
                    artifact.path,
                    artifact.client_ip,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Most recent artifacts for a device, newest first.
    ///
    /// `limit` is clamped to `1..=MAX_HISTORY_LIMIT`.
    #[instrument(skip(self), fields(device = %device))]
    pub fn list_for_device(
        &self,
        device: &DeviceName,
        limit: u32,
    ) -> Result<Vec<ArtifactRecord>, StoreError> {
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp, device_name, filename, size, latitude, longitude
                 FROM artifacts
                 WHERE device_key = ?1
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![device.as_str(), limit], |row| {
                let filename: String = row.get(2)?;
                let size: i64 = row.get(3)?;
                Ok(ArtifactRecord {
                    timestamp: row.get(0)?,
                    device_name: row.get(1)?,
                    url_path: url_path_for(&filename),
                    filename,
                    size: u64::try_from(size).unwrap_or_default(),
                    latitude: row.get(4)?,
                    longitude: row.get(5)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        self.db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM artifacts", [], |r| r.get(0))?))
    }
}
