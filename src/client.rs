use crate::credentials::Credentials;
use crate::error::RemoteError;
use crate::http::HttpSession;
use crate::retry;
use crate::wire::{BlobDescriptor, Conflict, DirEntry, DispatcherMap, EntryKind, Existence, FileMeta, Space};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::fs::File;
use std::io::Read;
use std::sync::OnceLock;

const PAGE_SIZE: u32 = 500;

/// The set of remote operations the FUSE adapter and cache layer depend on
/// (§4.C's operation table). Implemented for real by [`RemoteClient`]; a
/// fake in-memory implementation is used in tests so the cache/adapter
/// layers are exercised without a network dependency.
pub trait RemoteStore: Send + Sync {
    fn folder(&self, path: &str, page: u32) -> Result<(Vec<DirEntry>, u64, u64), RemoteError>;
    fn file(&self, path: &str) -> Result<FileMeta, RemoteError>;
    fn file_exists(&self, path: &str) -> Result<Existence, RemoteError> {
        match self.file(path) {
            Ok(meta) => Ok(match meta.kind {
                EntryKind::File => Existence::File,
                EntryKind::Folder => Existence::Folder,
            }),
            Err(RemoteError::NotFound) => Ok(Existence::Absent),
            Err(e) => Err(e),
        }
    }
    fn zip(&self, paths: &[String]) -> Result<Vec<u8>, RemoteError>;
    fn blob_upload(&self, source: File) -> Result<BlobDescriptor, RemoteError>;
    fn file_add(
        &self,
        path: &str,
        blob: &BlobDescriptor,
        conflict: Conflict,
    ) -> Result<String, RemoteError>;
    fn file_move(&self, path: &str, target_dir: &str, conflict: Conflict) -> Result<(), RemoteError>;
    fn file_remove(&self, path: &str) -> Result<(), RemoteError>;
    fn folder_add(&self, path: &str, conflict: Conflict) -> Result<String, RemoteError>;
    fn file_rename(&self, path: &str, new_name: &str, conflict: Conflict) -> Result<String, RemoteError>;
    fn space(&self) -> Result<Space, RemoteError>;
    fn get_file_reader(&self, path: &str) -> Result<Box<dyn Read + Send>, RemoteError>;

    /// §4.C `dir_list`: fetch page 0, compute total pages, fetch the rest
    /// sequentially, concatenate in page order. The page-count formula
    /// below intentionally yields zero extra pages for `total <= 500` (§9
    /// Open Questions) — preserved rather than "fixed".
    fn dir_list(&self, path: &str) -> Result<Vec<DirEntry>, RemoteError> {
        let (mut entries, files, folders) = self.folder(path, 0)?;
        let total = files + folders;
        let pages = (total.saturating_sub(1)) / PAGE_SIZE as u64;
        for page in 1..=pages {
            let (mut more, _, _) = self.folder(path, page as u32)?;
            entries.append(&mut more);
        }
        Ok(entries)
    }
}

/// Remote-store client: session bring-up, CSRF/upload-token acquisition,
/// dispatcher-based endpoint discovery, and the operation set from §4.C.
pub struct RemoteClient {
    http: HttpSession,
    api_base: String,
    csrf: String,
    dispatcher: OnceLock<DispatcherMap>,
    upload_token: OnceLock<String>,
}

impl RemoteClient {
    /// Runs the strict initialization sequence from §4.C:
    /// 1. POST login form; success requires HTTP 200 *and* a matching
    ///    post-redirect landed URL.
    /// 2. POST to the CSRF endpoint; extract `body.token`.
    /// Dispatcher and upload token are left unfetched (lazy, memoized on
    /// first use).
    pub fn new(api_base: &str, creds: &Credentials, expected_landing: &str) -> Result<Self, RemoteError> {
        let http = HttpSession::new();
        let api_base = api_base.trim_end_matches('/').to_string();

        retry::call("login", || {
            let (status, landed_url) = http.post_form_raw(
                &format!("{api_base}/auth"),
                &[("login", creds.login.as_str()), ("password", creds.password.as_str())],
            )?;
            if status != reqwest::StatusCode::OK || landed_url != expected_landing {
                return Err(RemoteError::ServerError(format!(
                    "login failed: status={status} landed={landed_url}"
                )));
            }
            Ok(())
        })?;

        let csrf = retry::call("csrf", || {
            let resp = http.post_form(&format!("{api_base}/csrf"), &[("api", "2")])?;
            let token = resp
                .get("body")
                .and_then(|b| b.get("token"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            if token.is_empty() {
                return Err(RemoteError::ServerError("empty CSRF token".into()));
            }
            Ok(token)
        })?;

        Ok(Self {
            http,
            api_base,
            csrf,
            dispatcher: OnceLock::new(),
            upload_token: OnceLock::new(),
        })
    }

    fn base_params(&self) -> Vec<(&str, String)> {
        vec![("api", "2".to_string()), ("token", self.csrf.clone())]
    }

    fn dispatcher_map(&self) -> Result<&DispatcherMap, RemoteError> {
        if let Some(d) = self.dispatcher.get() {
            return Ok(d);
        }
        let fetched = retry::call("dispatcher", || self.fetch_dispatcher())?;
        Ok(self.dispatcher.get_or_init(|| fetched))
    }

    fn fetch_dispatcher(&self) -> Result<DispatcherMap, RemoteError> {
        let body = self
            .http
            .get_json(&format!("{}/dispatcher", self.api_base), &self.base_params())?;
        serde_json::from_value(body.get("body").cloned().unwrap_or(body)).map_err(Into::into)
    }

    fn upload_token_value(&self) -> Result<&str, RemoteError> {
        if let Some(t) = self.upload_token.get() {
            return Ok(t);
        }
        let fetched = retry::call("tokens/download", || self.fetch_upload_token())?;
        Ok(self.upload_token.get_or_init(|| fetched))
    }

    fn fetch_upload_token(&self) -> Result<String, RemoteError> {
        let body = self
            .http
            .post_form(&format!("{}/tokens/download", self.api_base), &[("api", "2"), ("token", self.csrf.as_str())])?;
        let token = body
            .get("body")
            .and_then(|b| b.get("token"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        if token.is_empty() {
            return Err(RemoteError::ServerError("empty upload token".into()));
        }
        Ok(token)
    }

    fn resource_error(body: &serde_json::Value, resource: &str) -> Option<String> {
        body.get("body")
            .and_then(|b| b.get(resource))
            .and_then(|r| r.get("error"))
            .and_then(|e| e.as_str())
            .map(str::to_string)
    }
}

impl RemoteStore for RemoteClient {
    fn folder(&self, path: &str, page: u32) -> Result<(Vec<DirEntry>, u64, u64), RemoteError> {
        retry::call("folder", || {
            let mut params = self.base_params();
            params.push(("path", path.to_string()));
            params.push(("offset", (PAGE_SIZE as u64 * page as u64).to_string()));
            params.push(("limit", PAGE_SIZE.to_string()));
            let resp = self.http.get_json_tolerant(&format!("{}/folder", self.api_base), &params)?;

            if let Some(err) = Self::resource_error(&resp, "home") {
                return Err(if err == "not_exists" {
                    RemoteError::NotFound
                } else {
                    RemoteError::ServerError(format!("folder: {err}"))
                });
            }

            let body = resp.get("body").ok_or_else(|| {
                RemoteError::ServerError("folder: missing body".into())
            })?;
            let kind = body.get("kind").and_then(|v| v.as_str()).unwrap_or("");
            if kind != "folder" {
                return Err(RemoteError::ServerError(format!(
                    "folder: expected kind=folder, got {kind:?}"
                )));
            }
            let list: Vec<DirEntry> = serde_json::from_value(
                body.get("list").cloned().unwrap_or(serde_json::Value::Array(vec![])),
            )?;
            let files = body
                .get("count")
                .and_then(|c| c.get("files"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            let folders = body
                .get("count")
                .and_then(|c| c.get("folders"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            Ok((list, files, folders))
        })
    }

    fn file(&self, path: &str) -> Result<FileMeta, RemoteError> {
        retry::call("file", || {
            let mut params = self.base_params();
            params.push(("path", path.to_string()));
            let resp = self.http.get_json_tolerant(&format!("{}/file", self.api_base), &params)?;

            if let Some(err) = Self::resource_error(&resp, "home") {
                return Err(if err == "not_exists" {
                    RemoteError::NotFound
                } else {
                    RemoteError::ServerError(format!("file: {err}"))
                });
            }

            let body = resp.get("body").ok_or_else(|| {
                RemoteError::ServerError("file: missing body".into())
            })?;
            serde_json::from_value(body.clone()).map_err(Into::into)
        })
    }

    fn zip(&self, paths: &[String]) -> Result<Vec<u8>, RemoteError> {
        retry::call("zip", || {
            if paths.is_empty() {
                return Err(RemoteError::ServerError("zip: empty path list".into()));
            }
            let encoded = serde_json::to_string(paths)?;
            let mut params = self.base_params();
            params.push(("paths", encoded));
            let mut reader = self
                .http
                .get_stream(&format!("{}/zip?{}", self.api_base, to_query(&params)), true)?;
            let mut buf = Vec::new();
            reader
                .read_to_end(&mut buf)
                .map_err(|e| RemoteError::ServerError(format!("reading zip body: {e}")))?;
            Ok(buf)
        })
    }

    fn blob_upload(&self, source: File) -> Result<BlobDescriptor, RemoteError> {
        let upload_base = self.dispatcher_map()?.get("upload").cloned().ok_or_else(|| {
            RemoteError::ServerError("dispatcher missing `upload` role".into())
        })?;
        let upload_token = self.upload_token_value()?.to_string();
        retry::call("blob_upload", || {
            let cloned = source
                .try_clone()
                .map_err(|e| RemoteError::ServerError(format!("cloning upload source: {e}")))?;
            let expected_len = cloned
                .metadata()
                .map_err(|e| RemoteError::ServerError(format!("stat upload source: {e}")))?
                .len();
            let url = format!(
                "{}/upload?api=2&token={}&uploadtoken={}",
                upload_base.trim_end_matches('/'),
                self.csrf,
                upload_token
            );
            let body = self.http.post_multipart_file(&url, "file", "blob", cloned, 0)?;
            let descriptor = crate::wire::parse_blob_response(&body).map_err(RemoteError::ServerError)?;
            if descriptor.size != expected_len {
                return Err(RemoteError::ServerError(format!(
                    "blob_upload: size mismatch (uploaded {expected_len}, server reported {})",
                    descriptor.size
                )));
            }
            Ok(descriptor)
        })
    }

    fn file_add(&self, path: &str, blob: &BlobDescriptor, conflict: Conflict) -> Result<String, RemoteError> {
        retry::call("file_add", || {
            let hash = blob.hash.clone();
            let size = blob.size.to_string();
            let body = self.http.post_form_tolerant(
                &format!("{}/file/add", self.api_base),
                &[
                    ("api", "2"),
                    ("token", self.csrf.as_str()),
                    ("path", path),
                    ("hash", &hash),
                    ("size", &size),
                    ("conflict", conflict.as_str()),
                ],
            )?;
            if let Some(err) = Self::resource_error(&body, "home") {
                return Err(if err == "exists" {
                    RemoteError::AlreadyExists
                } else {
                    RemoteError::ServerError(format!("file_add: {err}"))
                });
            }
            body.get("body")
                .and_then(|b| b.get("name"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| RemoteError::ServerError("file_add: missing name".into()))
        })
    }

    fn file_move(&self, path: &str, target_dir: &str, conflict: Conflict) -> Result<(), RemoteError> {
        retry::call("file_move", || {
            self.http.post_form(
                &format!("{}/file/move", self.api_base),
                &[
                    ("api", "2"),
                    ("token", self.csrf.as_str()),
                    ("path", path),
                    ("target", target_dir),
                    ("conflict", conflict.as_str()),
                ],
            )?;
            Ok(())
        })
    }

    fn file_remove(&self, path: &str) -> Result<(), RemoteError> {
        // The remote tolerates removing an already-missing path with a 200;
        // a 404 here is not specially translated and is retried as a
        // ServerError like any other non-2xx status (§9 Open Questions).
        retry::call("file_remove", || {
            self.http.post_form(
                &format!("{}/file/remove", self.api_base),
                &[("api", "2"), ("token", self.csrf.as_str()), ("path", path)],
            )?;
            Ok(())
        })
    }

    fn folder_add(&self, path: &str, conflict: Conflict) -> Result<String, RemoteError> {
        retry::call("folder_add", || {
            let body = self.http.post_form_tolerant(
                &format!("{}/folder/add", self.api_base),
                &[
                    ("api", "2"),
                    ("token", self.csrf.as_str()),
                    ("path", path),
                    ("conflict", conflict.as_str()),
                ],
            )?;
            if let Some(err) = Self::resource_error(&body, "home") {
                return Err(if err == "exists" {
                    RemoteError::AlreadyExists
                } else {
                    RemoteError::ServerError(format!("folder_add: {err}"))
                });
            }
            body.get("body")
                .and_then(|b| b.get("name"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| RemoteError::ServerError("folder_add: missing name".into()))
        })
    }

    fn file_rename(&self, path: &str, new_name: &str, conflict: Conflict) -> Result<String, RemoteError> {
        retry::call("file_rename", || {
            let body = self.http.post_form_tolerant(
                &format!("{}/file/rename", self.api_base),
                &[
                    ("api", "2"),
                    ("token", self.csrf.as_str()),
                    ("path", path),
                    ("name", new_name),
                    ("conflict", conflict.as_str()),
                ],
            )?;
            if let Some(err) = Self::resource_error(&body, "home") {
                return Err(match err.as_str() {
                    "not_exists" => RemoteError::NotFound,
                    "exists" => RemoteError::AlreadyExists,
                    _ => RemoteError::ServerError(format!("file_rename: {err}")),
                });
            }
            body.get("body")
                .and_then(|b| b.get("name"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| RemoteError::ServerError("file_rename: missing name".into()))
        })
    }

    fn space(&self) -> Result<Space, RemoteError> {
        retry::call("space", || {
            let resp = self.http.get_json(&format!("{}/space", self.api_base), &self.base_params())?;
            let body = resp.get("body").ok_or_else(|| {
                RemoteError::ServerError("space: missing body".into())
            })?;
            serde_json::from_value(body.clone()).map_err(Into::into)
        })
    }

    fn get_file_reader(&self, path: &str) -> Result<Box<dyn Read + Send>, RemoteError> {
        let get_base = self.dispatcher_map()?.get("get").cloned().ok_or_else(|| {
            RemoteError::ServerError("dispatcher missing `get` role".into())
        })?;
        // Percent-encode path segments per §6 ("implementations MUST
        // percent-encode non-ASCII bytes in the path").
        let encoded: String = path
            .split('/')
            .map(|seg| utf8_percent_encode(seg, NON_ALPHANUMERIC).to_string())
            .collect::<Vec<_>>()
            .join("/");
        let url = format!("{}{}", get_base.trim_end_matches('/'), encoded);
        retry::call("get_file_reader", || self.http.get_stream(&url, true))
    }
}

fn to_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={}", utf8_percent_encode(v, NON_ALPHANUMERIC)))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeRemote;

    #[test]
    fn dir_list_paginates_at_boundaries() {
        for n in [0usize, 1, 499, 500, 501, 1000] {
            let remote = FakeRemote::new();
            remote.populate("/big", n);
            let entries = remote.dir_list("/big").unwrap();
            assert_eq!(entries.len(), n, "N={n}");
            let mut names: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
            names.sort();
            names.dedup();
            assert_eq!(names.len(), n, "no duplicates for N={n}");
        }
    }

    #[test]
    fn file_remove_tolerates_missing_path() {
        let remote = FakeRemote::new();
        assert!(remote.file_remove("/does/not/exist").is_ok());
    }

    #[test]
    fn file_exists_reports_absent_file_folder() {
        let remote = FakeRemote::new();
        remote.folders.borrow_mut().insert("/d".to_string());
        remote.files.borrow_mut().insert("/d/f".to_string(), vec![1, 2, 3]);
        assert_eq!(remote.file_exists("/d").unwrap(), Existence::Folder);
        assert_eq!(remote.file_exists("/d/f").unwrap(), Existence::File);
        assert_eq!(remote.file_exists("/nope").unwrap(), Existence::Absent);
    }
}
