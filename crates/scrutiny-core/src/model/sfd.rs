// ── Firmware descriptions ──
//
// A Scrutiny Firmware Description (SFD) maps a firmware id to the aliases
// and variables of that firmware. The server installs them and loads the
// one matching the connected device.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An installed firmware description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SfdInfo {
    pub firmware_id: String,
    pub metadata: Option<SfdMetadata>,
    /// Size of the file on the server, in bytes.
    pub filesize: Option<u64>,
}

/// Free-form description of the firmware. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SfdMetadata {
    pub project_name: Option<String>,
    pub author: Option<String>,
    pub version: Option<String>,
    pub generation_info: SfdGenerationInfo,
}

/// Environment the description was generated in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SfdGenerationInfo {
    pub timestamp: Option<DateTime<Utc>>,
    pub python_version: Option<String>,
    pub scrutiny_version: Option<String>,
    pub system_type: Option<String>,
}

impl SfdInfo {
    /// Project name and version, or the firmware id when both are missing.
    pub fn display_name(&self) -> String {
        let meta = self.metadata.as_ref();
        let name = meta.and_then(|m| m.project_name.as_deref());
        let version = meta.and_then(|m| m.version.as_deref());
        match (name, version) {
            (Some(name), Some(version)) => format!("{name} {version}"),
            (Some(name), None) => name.to_owned(),
            (None, _) => self.firmware_id.clone(),
        }
    }
}
