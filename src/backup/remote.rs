//! GitHub contents-API client for snapshot blobs.
//!
//! The remote tier is an append-only log of snapshot files plus one mutable
//! pointer, all living under a branch of a hosted repository. Writes use the
//! content `sha` as a compare-and-swap token: updating an existing path
//! without the server's current sha is rejected.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::GithubConfig;

const USER_AGENT: &str = "botforge";
const ACCEPT: &str = "application/vnd.github.v3+json";

/// Inline `content` is omitted by the API above roughly this size; larger
/// blobs are fetched through `download_url` instead.
pub const INLINE_CONTENT_LIMIT: u64 = 1024 * 1024;

/// Error kinds at the remote boundary. Nothing here is a corruption signal:
/// `Unavailable` and `Conflict` are retryable at the next natural trigger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    #[error("version conflict at {path}")]
    Conflict { path: String },

    #[error("not found: {path}")]
    NotFound { path: String },
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound { .. })
    }
}

/// One stored snapshot blob; immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBlobRef {
    pub path: String,
    pub version_token: String,
    pub branch: String,
}

/// Directory entry from `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Serialize)]
struct PutContentsRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    sha: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    download_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PutContentsResponse {
    content: PutContentInfo,
}

#[derive(Debug, Deserialize)]
struct PutContentInfo {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct EntryResponse {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(rename = "type")]
    kind: String,
}

/// Blocking client for the contents surface of a hosted repository.
pub struct RemoteRepo {
    client: reqwest::blocking::Client,
    api_base: String,
    owner: String,
    repo: String,
    branch: String,
    token: String,
}

impl std::fmt::Debug for RemoteRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteRepo")
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("branch", &self.branch)
            .finish_non_exhaustive()
    }
}

impl RemoteRepo {
    pub fn new(
        api_base: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        branch: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            owner: owner.into(),
            repo: repo.into(),
            branch: branch.into(),
            token: token.into(),
        }
    }

    pub fn from_config(config: &GithubConfig, timeout: Duration) -> Self {
        Self::new(
            config.api_base.clone(),
            config.owner.clone(),
            config.repo.clone(),
            config.branch.clone(),
            config.token.clone(),
            timeout,
        )
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Store `content` at `path`, creating or overwriting.
    ///
    /// When `expected_token` is None and the path already exists, the current
    /// sha is probed first; the server rejects an update without it. A sha
    /// mismatch on the server side maps to `Conflict` and is never retried
    /// here; the caller re-probes at its next trigger.
    pub fn put(
        &self,
        path: &str,
        content: &[u8],
        message: &str,
        expected_token: Option<&str>,
    ) -> Result<RemoteBlobRef, RemoteError> {
        let token = match expected_token {
            Some(token) => Some(token.to_string()),
            None => self.probe_token(path)?,
        };

        let body = PutContentsRequest {
            message,
            content: BASE64.encode(content),
            branch: &self.branch,
            sha: token.as_deref(),
        };

        let response = self
            .request(reqwest::Method::PUT, &self.contents_url(path))
            .json(&body)
            .send()
            .map_err(|err| RemoteError::Unavailable(format!("put {path}: {err}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::CONFLICT
            || status == reqwest::StatusCode::UNPROCESSABLE_ENTITY
        {
            return Err(RemoteError::Conflict {
                path: path.to_string(),
            });
        }
        if !status.is_success() {
            return Err(RemoteError::Unavailable(format!(
                "put {path}: HTTP {status}"
            )));
        }

        let parsed = response.json::<PutContentsResponse>().map_err(|err| {
            RemoteError::Unavailable(format!("put {path}: parse response: {err}"))
        })?;
        Ok(RemoteBlobRef {
            path: path.to_string(),
            version_token: parsed.content.sha,
            branch: self.branch.clone(),
        })
    }

    /// Fetch a blob's bytes and its current version token.
    ///
    /// The API omits inline content above a size threshold; in that case the
    /// raw `download_url` is fetched instead. Absence of both is a transient
    /// failure, not corruption.
    pub fn get(&self, path: &str) -> Result<(Vec<u8>, String), RemoteError> {
        let response = self
            .request(reqwest::Method::GET, &self.contents_url(path))
            .send()
            .map_err(|err| RemoteError::Unavailable(format!("get {path}: {err}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound {
                path: path.to_string(),
            });
        }
        if !status.is_success() {
            return Err(RemoteError::Unavailable(format!(
                "get {path}: HTTP {status}"
            )));
        }

        let parsed = response.json::<ContentsResponse>().map_err(|err| {
            RemoteError::Unavailable(format!("get {path}: parse response: {err}"))
        })?;

        let inline = parsed
            .content
            .as_deref()
            .map(|raw| raw.trim())
            .filter(|raw| !raw.is_empty());

        if let Some(encoded) = inline {
            let cleaned: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
            let bytes = BASE64.decode(cleaned.as_bytes()).map_err(|err| {
                RemoteError::Unavailable(format!("get {path}: decode content: {err}"))
            })?;
            return Ok((bytes, parsed.sha));
        }

        if let Some(download_url) = parsed.download_url.as_deref() {
            tracing::debug!(path, size = parsed.size, "inline content omitted, fetching raw");
            let bytes = self.fetch_raw(download_url)?;
            return Ok((bytes, parsed.sha));
        }

        Err(RemoteError::Unavailable(format!(
            "get {path}: response carries neither content nor download_url"
        )))
    }

    /// List blobs directly under `prefix`, sorted by name ascending. A
    /// missing directory is an empty listing, not an error.
    pub fn list(&self, prefix: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let response = self
            .request(reqwest::Method::GET, &self.contents_url(prefix))
            .send()
            .map_err(|err| RemoteError::Unavailable(format!("list {prefix}: {err}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(RemoteError::Unavailable(format!(
                "list {prefix}: HTTP {status}"
            )));
        }

        let entries = response.json::<Vec<EntryResponse>>().map_err(|err| {
            RemoteError::Unavailable(format!("list {prefix}: parse response: {err}"))
        })?;

        let mut files: Vec<RemoteEntry> = entries
            .into_iter()
            .filter(|entry| entry.kind == "file")
            .map(|entry| RemoteEntry {
                name: entry.name,
                size: entry.size,
            })
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Current version token of an existing blob, or None when absent.
    fn probe_token(&self, path: &str) -> Result<Option<String>, RemoteError> {
        let url = format!(
            "{}?ref={}",
            self.contents_url(path),
            urlencoding::encode(&self.branch)
        );
        let response = self
            .request(reqwest::Method::GET, &url)
            .send()
            .map_err(|err| RemoteError::Unavailable(format!("probe {path}: {err}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(RemoteError::Unavailable(format!(
                "probe {path}: HTTP {status}"
            )));
        }

        let parsed = response.json::<ContentsResponse>().map_err(|err| {
            RemoteError::Unavailable(format!("probe {path}: parse response: {err}"))
        })?;
        Ok(Some(parsed.sha))
    }

    fn fetch_raw(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        let response = self
            .request(reqwest::Method::GET, url)
            .header("Accept", "application/octet-stream")
            .send()
            .map_err(|err| RemoteError::Unavailable(format!("raw fetch: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Unavailable(format!("raw fetch: HTTP {status}")));
        }
        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| RemoteError::Unavailable(format!("raw fetch read: {err}")))
    }

    fn contents_url(&self, path: &str) -> String {
        let encoded: Vec<String> = path
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_base,
            self.owner,
            self.repo,
            encoded.join("/")
        )
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::blocking::RequestBuilder {
        self.client
            .request(method, url)
            .header("User-Agent", USER_AGENT)
            .header("Accept", ACCEPT)
            .bearer_auth(&self.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn repo_for(server: &MockServer) -> RemoteRepo {
        RemoteRepo::new(
            server.base_url(),
            "owner",
            "state",
            "main",
            "test-token",
            Duration::from_secs(5),
        )
    }

    fn contents_body(sha: &str, payload: &[u8]) -> serde_json::Value {
        json!({
            "sha": sha,
            "size": payload.len(),
            "content": BASE64.encode(payload),
            "encoding": "base64",
        })
    }

    #[test]
    fn put_creates_when_path_absent() {
        let server = MockServer::start();
        let probe = server.mock(|when, then| {
            when.method(GET).path("/repos/owner/state/contents/b/x.db");
            then.status(404).json_body(json!({"message": "Not Found"}));
        });
        let put = server.mock(|when, then| {
            when.method(PUT)
                .path("/repos/owner/state/contents/b/x.db")
                .json_body_includes(r#"{"branch": "main"}"#)
                .body_excludes("\"sha\"");
            then.status(201)
                .json_body(json!({"content": {"sha": "newsha"}, "commit": {"sha": "c1"}}));
        });

        let repo = repo_for(&server);
        let blob = repo.put("b/x.db", b"payload", "backup", None).unwrap();
        assert_eq!(blob.version_token, "newsha");
        assert_eq!(blob.path, "b/x.db");
        probe.assert();
        put.assert();
    }

    #[test]
    fn put_probes_existing_sha_before_overwrite() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/repos/owner/state/contents/b/latest.txt");
            then.status(200).json_body(contents_body("oldsha", b"old"));
        });
        let put = server.mock(|when, then| {
            when.method(PUT)
                .path("/repos/owner/state/contents/b/latest.txt")
                .json_body_includes(r#"{"sha": "oldsha"}"#);
            then.status(200)
                .json_body(json!({"content": {"sha": "nextsha"}, "commit": {"sha": "c2"}}));
        });

        let repo = repo_for(&server);
        let blob = repo.put("b/latest.txt", b"new", "pointer", None).unwrap();
        assert_eq!(blob.version_token, "nextsha");
        put.assert();
    }

    #[test]
    fn put_with_stale_token_is_conflict() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(PUT).path("/repos/owner/state/contents/b/latest.txt");
            then.status(409).json_body(json!({"message": "sha mismatch"}));
        });

        let repo = repo_for(&server);
        let err = repo
            .put("b/latest.txt", b"new", "pointer", Some("stale"))
            .unwrap_err();
        assert_eq!(
            err,
            RemoteError::Conflict {
                path: "b/latest.txt".to_string()
            }
        );
    }

    #[test]
    fn put_server_error_is_unavailable() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(PUT).path("/repos/owner/state/contents/b/x.db");
            then.status(502);
        });

        let repo = repo_for(&server);
        let err = repo.put("b/x.db", b"p", "backup", Some("t")).unwrap_err();
        assert!(matches!(err, RemoteError::Unavailable(_)));
    }

    #[test]
    fn get_decodes_inline_base64() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/repos/owner/state/contents/b/x.db");
            then.status(200).json_body(contents_body("sha1", b"hello"));
        });

        let repo = repo_for(&server);
        let (bytes, sha) = repo.get("b/x.db").unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(sha, "sha1");
    }

    #[test]
    fn get_falls_back_to_download_url_when_content_omitted() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/raw/b/big.db");
            then.status(200).body("raw-bytes");
        });
        let raw_url = format!("{}/raw/b/big.db", server.base_url());
        server.mock(|when, then| {
            when.method(GET).path("/repos/owner/state/contents/b/big.db");
            then.status(200).json_body(json!({
                "sha": "bigsha",
                "size": 2 * INLINE_CONTENT_LIMIT,
                "content": "",
                "encoding": "none",
                "download_url": raw_url,
            }));
        });

        let repo = repo_for(&server);
        let (bytes, sha) = repo.get("b/big.db").unwrap();
        assert_eq!(bytes, b"raw-bytes");
        assert_eq!(sha, "bigsha");
    }

    #[test]
    fn get_without_content_or_download_url_is_unavailable() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/repos/owner/state/contents/b/x.db");
            then.status(200)
                .json_body(json!({"sha": "s", "size": 9, "content": "", "encoding": "none"}));
        });

        let repo = repo_for(&server);
        let err = repo.get("b/x.db").unwrap_err();
        assert!(matches!(err, RemoteError::Unavailable(_)));
    }

    #[test]
    fn get_missing_path_is_not_found() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/repos/owner/state/contents/b/x.db");
            then.status(404).json_body(json!({"message": "Not Found"}));
        });

        let repo = repo_for(&server);
        let err = repo.get("b/x.db").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn list_filters_files_and_sorts_by_name() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/repos/owner/state/contents/b");
            then.status(200).json_body(json!([
                {"name": "state_20250102_000000.db", "size": 20, "type": "file"},
                {"name": "nested", "size": 0, "type": "dir"},
                {"name": "state_20250101_000000.db", "size": 10, "type": "file"},
            ]));
        });

        let repo = repo_for(&server);
        let entries = repo.list("b").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "state_20250101_000000.db");
        assert_eq!(entries[1].name, "state_20250102_000000.db");
    }

    #[test]
    fn list_missing_prefix_is_empty() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/repos/owner/state/contents/b");
            then.status(404).json_body(json!({"message": "Not Found"}));
        });

        let repo = repo_for(&server);
        assert!(repo.list("b").unwrap().is_empty());
    }
}
