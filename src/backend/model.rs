use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

/// Reported when the backend stored the row but returned no primary key.
pub const UNKNOWN_REMOTE_ID: &str = "unknown";

/// Subset of the CDN upload response we rely on.
#[derive(Deserialize, Debug)]
pub struct UploadResponse {
    pub secure_url: String,
    #[serde(default)]
    pub public_id: Option<String>,
}

/// Extract the primary key of the first row returned by a
/// `Prefer: return=representation` insert.
pub fn inserted_id(rows: &Value) -> Option<String> {
    let first = match rows {
        Value::Array(items) => items.first()?,
        Value::Object(_) => rows,
        _ => return None,
    };
    match first.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Remote id for a successful insert. The row is already stored, so a
/// missing key is logged instead of failing the submission.
pub fn remote_id(rows: &Value) -> String {
    match inserted_id(rows) {
        Some(id) => id,
        None => {
            warn!(response = %rows, "insert succeeded without a returned row id");
            UNKNOWN_REMOTE_ID.to_string()
        }
    }
}
