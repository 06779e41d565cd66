use serde::{Deserialize, Serialize};

use crate::device::DeviceName;

/// URL prefix under which stored artifacts are served.
pub const ARTIFACT_URL_PREFIX: &str = "/audios";

/// A newly recorded audio artifact, as handed over by the upload path.
///
/// Ephemeral: built once per upload, fanned out, then dropped. The device name
/// keeps the uploader's original spelling for display; matching always goes
/// through [`ArtifactEvent::device`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactEvent {
    pub device_name: String,
    pub timestamp: String,
    pub filename: String,
    pub size: u64,
    pub url_path: String,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
}

impl ArtifactEvent {
    /// Build an event whose access locator is derived from the filename.
    pub fn new(
        device_name: impl Into<String>,
        timestamp: impl Into<String>,
        filename: impl Into<String>,
        size: u64,
    ) -> Self {
        let filename = filename.into();
        Self {
            device_name: device_name.into(),
            timestamp: timestamp.into(),
            url_path: url_path_for(&filename),
            filename,
            size,
            latitude: None,
            longitude: None,
        }
    }

    pub fn with_location(mut self, latitude: Option<String>, longitude: Option<String>) -> Self {
        self.latitude = latitude.filter(|v| !v.is_empty());
        self.longitude = longitude.filter(|v| !v.is_empty());
        self
    }

    /// Normalized subscription target, `None` when the raw name is blank.
    pub fn device(&self) -> Option<DeviceName> {
        DeviceName::normalize(&self.device_name)
    }
}

/// Public locator for a stored artifact file.
pub fn url_path_for(filename: &str) -> String {
    format!("{ARTIFACT_URL_PREFIX}/{filename}")
}
