//! Drive API types
//!
//! Defines resource descriptors and the wire types of Drive v3 and Sheets v4 responses.

use serde::{Deserialize, Deserializer, Serialize};

/// MIME type Drive reports for folders
pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
/// MIME type Drive reports for spreadsheets
pub const SPREADSHEET_MIME: &str = "application/vnd.google-apps.spreadsheet";
/// MIME type Drive reports for documents
pub const DOCUMENT_MIME: &str = "application/vnd.google-apps.document";

/// Deserialize a version that might be encoded as a number, a string or null.
/// Drive returns `version` as a decimal string (e.g. "1536964279000").
/// Anything that does not parse as an integer becomes `None` rather than an
/// error so one odd entry cannot fail a whole listing.
fn deserialize_flexible_version<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct FlexibleVersionVisitor;

    impl<'de> de::Visitor<'de> for FlexibleVersionVisitor {
        type Value = Option<i64>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("an integer, a string containing an integer, or null")
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<Option<i64>, E> {
            Ok(i64::try_from(value).ok())
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<Option<i64>, E> {
            Ok(Some(value))
        }

        fn visit_f64<E: de::Error>(self, _value: f64) -> Result<Option<i64>, E> {
            Ok(None)
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<Option<i64>, E> {
            Ok(value.trim().parse::<i64>().ok())
        }

        fn visit_none<E: de::Error>(self) -> Result<Option<i64>, E> {
            Ok(None)
        }

        fn visit_unit<E: de::Error>(self) -> Result<Option<i64>, E> {
            Ok(None)
        }

        fn visit_some<D2: Deserializer<'de>>(self, deserializer: D2) -> Result<Option<i64>, D2::Error> {
            deserializer.deserialize_any(self)
        }
    }

    deserializer.deserialize_any(FlexibleVersionVisitor)
}

/// Kind of a remote resource, derived from its MIME type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceKind {
    /// Folder; its payload is the list of its children
    Container,
    /// Spreadsheet; its payload is one row list per sheet
    Table,
    /// Document; its payload is exported html
    RichText,
    /// Anything else, keeping the reported MIME type
    Unrecognized(String),
}

impl ResourceKind {
    /// MIME type this kind is reported as
    pub fn mime_type(&self) -> &str {
        match self {
            ResourceKind::Container => FOLDER_MIME,
            ResourceKind::Table => SPREADSHEET_MIME,
            ResourceKind::RichText => DOCUMENT_MIME,
            ResourceKind::Unrecognized(mime) => mime,
        }
    }
}

impl From<String> for ResourceKind {
    fn from(mime: String) -> Self {
        match mime.as_str() {
            FOLDER_MIME => ResourceKind::Container,
            SPREADSHEET_MIME => ResourceKind::Table,
            DOCUMENT_MIME => ResourceKind::RichText,
            _ => ResourceKind::Unrecognized(mime),
        }
    }
}

impl From<ResourceKind> for String {
    fn from(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Unrecognized(mime) => mime,
            other => other.mime_type().to_string(),
        }
    }
}

/// A remote file as reported by a listing call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    /// Globally unique file ID
    pub id: String,
    /// Display name
    pub name: String,
    /// Resource kind (serialized as the Drive MIME type)
    #[serde(rename = "mimeType")]
    pub kind: ResourceKind,
    /// Monotonic version; `None` when Drive sent something unparsable
    #[serde(default, deserialize_with = "deserialize_flexible_version")]
    pub version: Option<i64>,
    /// IDs of parent folders (zero or more)
    #[serde(default)]
    pub parents: Vec<String>,
}

impl ResourceDescriptor {
    /// Check if this resource lists `folder_id` among its parents
    pub fn has_parent(&self, folder_id: &str) -> bool {
        self.parents.iter().any(|p| p == folder_id)
    }
}

/// Response from files.list
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilesResponse {
    /// Files on this page
    #[serde(default)]
    pub files: Vec<ResourceDescriptor>,
    /// Token for the next page (None if no more files)
    pub next_page_token: Option<String>,
}

/// Response from spreadsheets.get restricted to sheet titles
#[derive(Debug, Deserialize)]
pub struct SpreadsheetResponse {
    #[serde(default)]
    pub sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
pub struct SheetEntry {
    pub properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
pub struct SheetProperties {
    pub title: String,
}

/// One A1 range of cell values
#[derive(Debug, Clone, Deserialize)]
pub struct ValueRange {
    /// Resolved range, e.g. `'Sheet 1'!A1:Z100`
    #[serde(default)]
    pub range: String,
    /// Rows of cells; absent for an empty sheet
    #[serde(default)]
    pub values: Vec<Vec<serde_json::Value>>,
}

/// Response from spreadsheets.values.batchGet
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchGetResponse {
    #[serde(default)]
    pub value_ranges: Vec<ValueRange>,
}
