//! File extension → `Content-Type`.

use std::path::Path;

/// Served when the extension is unknown.
pub const UNKNOWN_CONTENT_TYPE: &str = "application/unknown";

/// Content type for `path`, with `charset=utf-8` on `text/*` types.
pub fn content_type(path: &Path) -> String {
    match mime_guess::from_path(path).first() {
        Some(mime) if mime.type_() == mime_guess::mime::TEXT => {
            format!("{}; charset=utf-8", mime.essence_str())
        }
        Some(mime) => mime.essence_str().to_string(),
        None => UNKNOWN_CONTENT_TYPE.to_string(),
    }
}
