use serde::Deserialize;
use std::collections::HashMap;

/// §3: directory entry as returned by `folder()`/`dir_list()`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    #[serde(default)]
    pub size: u64,
    pub mtime: i64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
}

/// Metadata returned by `file(path)`.
#[derive(Debug, Clone, Deserialize)]
pub struct FileMeta {
    pub kind: EntryKind,
    #[serde(default)]
    pub size: u64,
    pub mtime: i64,
}

/// §3: blob descriptor returned by the upload endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobDescriptor {
    pub hash: String,
    pub size: u64,
}

/// Plain-text multipart upload response: `hash;size[;error...]`.
/// More than two semicolon-separated fields indicates a server-reported
/// error (§6).
pub fn parse_blob_response(body: &str) -> Result<BlobDescriptor, String> {
    let fields: Vec<&str> = body.trim().split(';').collect();
    if fields.len() > 2 {
        return Err(format!("upload error: {}", fields[2..].join(";")));
    }
    let [hash, size] = fields.as_slice() else {
        return Err(format!("malformed upload response: {body:?}"));
    };
    let size: u64 = size
        .parse()
        .map_err(|_| format!("malformed upload size: {size:?}"))?;
    Ok(BlobDescriptor {
        hash: (*hash).to_string(),
        size,
    })
}

/// Disk-space accounting, in 1 KiB units (§4.C `space()`).
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Space {
    pub total: u64,
    pub used: u64,
}

/// Role → base URL map returned by `dispatcher()` (§3).
pub type DispatcherMap = HashMap<String, String>;

/// Conflict-resolution policy accepted by create/rename-style operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    Strict,
    Rename,
}

impl Conflict {
    pub fn as_str(self) -> &'static str {
        match self {
            Conflict::Strict => "strict",
            Conflict::Rename => "rename",
        }
    }
}

/// `file_exists()` convenience result (§4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Existence {
    Absent,
    File,
    Folder,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_blob_response() {
        let d = parse_blob_response("abc123;4096").unwrap();
        assert_eq!(d, BlobDescriptor { hash: "abc123".into(), size: 4096 });
    }

    #[test]
    fn rejects_error_tagged_response() {
        assert!(parse_blob_response("abc123;4096;quota_exceeded").is_err());
    }

    #[test]
    fn rejects_malformed_response() {
        assert!(parse_blob_response("onlyonefield").is_err());
        assert!(parse_blob_response("abc;notanumber").is_err());
    }
}
