//! S3-compatible backup mirror.
//!
//! Talks the S3 REST API directly over `reqwest` with SigV4 request signing,
//! which keeps the same client working against AWS, MinIO, and R2-style
//! endpoints. Upload failures are surfaced to the caller, who logs them;
//! a cloud outage never fails a local write.

use chrono::Utc;
use hmac::{Hmac, Mac};
use recall_core::{RecallError, Result, env_bool, env_str};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

static COMMON_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<CommonPrefixes>\s*<Prefix>([^<]+)</Prefix>").unwrap());
static OBJECT_KEY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<Key>([^<]+)</Key>").unwrap());

/// A folder-like snapshot prefix in the bucket.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RemoteSnapshot {
    pub name: String,
    pub prefix: String,
}

/// Result of an upload, mirrored to the sync endpoints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UploadReport {
    pub backup_name: String,
    pub files_uploaded: usize,
}

/// Result of a download.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DownloadReport {
    pub backup_name: String,
    pub files_downloaded: usize,
    pub local_path: String,
}

pub struct CloudSync {
    bucket: String,
    prefix: String,
    region: String,
    endpoint: Option<String>,
    access_key: String,
    secret_key: String,
    client: reqwest::Client,
}

impl CloudSync {
    pub fn new(
        bucket: String,
        prefix: String,
        region: String,
        endpoint: Option<String>,
        access_key: String,
        secret_key: String,
    ) -> Self {
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        info!(
            bucket = %bucket,
            prefix = %prefix,
            region = %region,
            endpoint = endpoint.as_deref().unwrap_or("default"),
            "CloudSync initialized"
        );
        Self {
            bucket,
            prefix,
            region,
            endpoint,
            access_key,
            secret_key,
            client: reqwest::Client::new(),
        }
    }

    /// Build from `CLOUD_SYNC_*` env vars; `None` when disabled or
    /// incompletely configured.
    pub fn from_env() -> Option<Self> {
        if !env_bool("CLOUD_SYNC_ENABLED", false) {
            debug!("Cloud sync disabled (CLOUD_SYNC_ENABLED != true)");
            return None;
        }
        let bucket = match env_str("CLOUD_SYNC_BUCKET") {
            Some(bucket) => bucket,
            None => {
                warn!("CLOUD_SYNC_BUCKET not set - cloud sync disabled");
                return None;
            }
        };
        let (access_key, secret_key) = match (
            env_str("CLOUD_SYNC_ACCESS_KEY"),
            env_str("CLOUD_SYNC_SECRET_KEY"),
        ) {
            (Some(a), Some(s)) => (a, s),
            _ => {
                warn!("Cloud sync credentials missing - cloud sync disabled");
                return None;
            }
        };
        Some(Self::new(
            bucket,
            env_str("CLOUD_SYNC_PREFIX").unwrap_or_else(|| "memories".to_string()),
            env_str("CLOUD_SYNC_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            env_str("CLOUD_SYNC_ENDPOINT"),
            access_key,
            secret_key,
        ))
    }

    fn host_and_path(&self, key: &str) -> (String, String) {
        match &self.endpoint {
            // Custom endpoints (MinIO, R2) use path-style addressing.
            Some(endpoint) => {
                let trimmed = endpoint.trim_end_matches('/');
                let host = trimmed
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .to_string();
                (host, format!("/{}/{}", self.bucket, key))
            }
            None => (
                format!("{}.s3.{}.amazonaws.com", self.bucket, self.region),
                format!("/{key}"),
            ),
        }
    }

    fn scheme(&self) -> &str {
        match &self.endpoint {
            Some(endpoint) if endpoint.starts_with("http://") => "http",
            _ => "https",
        }
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        key: &str,
        query: &[(&str, String)],
        body: Vec<u8>,
    ) -> Result<reqwest::Response> {
        let (host, path) = self.host_and_path(key);
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();

        let payload_hash = hex::encode(Sha256::digest(&body));

        let mut query_pairs: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (k.to_string(), uri_encode(v, true)))
            .collect();
        query_pairs.sort();
        let canonical_query = query_pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");

        let canonical_headers = format!(
            "host:{host}\nx-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n"
        );
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";
        let canonical_path = uri_encode(&path, false);
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.as_str(),
            canonical_path,
            canonical_query,
            canonical_headers,
            signed_headers,
            payload_hash,
        );

        let scope = format!("{date_stamp}/{}/s3/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes())),
        );

        let k_date = hmac_sha256(
            format!("AWS4{}", self.secret_key).as_bytes(),
            date_stamp.as_bytes(),
        );
        let k_region = hmac_sha256(&k_date, self.region.as_bytes());
        let k_service = hmac_sha256(&k_region, b"s3");
        let k_signing = hmac_sha256(&k_service, b"aws4_request");
        let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.access_key,
        );

        let mut url = format!("{}://{host}{canonical_path}", self.scheme());
        if !canonical_query.is_empty() {
            url.push('?');
            url.push_str(&canonical_query);
        }

        self.client
            .request(method, &url)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .header("authorization", authorization)
            .body(body)
            .send()
            .await
            .map_err(|e| RecallError::cloud(format!("request failed: {e}")))
    }

    async fn expect_success(response: reqwest::Response, action: &str) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(RecallError::cloud(format!(
            "{action} failed with {status}: {}",
            body.chars().take(300).collect::<String>()
        )))
    }

    /// Upload every file of a snapshot directory under `prefix/<name>/`.
    pub async fn upload_backup(&self, backup_path: &Path) -> Result<UploadReport> {
        if !tokio::fs::try_exists(backup_path).await.unwrap_or(false) {
            return Err(RecallError::not_found(
                "backup",
                backup_path.display().to_string(),
            ));
        }
        let backup_name = backup_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| RecallError::invalid_argument("backup path has no name"))?;

        let mut uploaded = 0usize;
        let mut entries = tokio::fs::read_dir(backup_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().to_string();
            let key = format!("{}{backup_name}/{file_name}", self.prefix);
            let body = tokio::fs::read(entry.path()).await?;
            debug!(key = %key, "uploading backup file");
            let response = self
                .signed_request(reqwest::Method::PUT, &key, &[], body)
                .await?;
            Self::expect_success(response, "upload").await?;
            uploaded += 1;
        }

        Ok(UploadReport {
            backup_name,
            files_uploaded: uploaded,
        })
    }

    /// Download a backup into `<dest_dir>/<name>/`.
    pub async fn download_backup(&self, backup_name: &str, dest_dir: &Path) -> Result<DownloadReport> {
        crate::snapshot::validate_backup_name(backup_name)?;

        let target = dest_dir.join(backup_name);
        tokio::fs::create_dir_all(&target).await?;

        let folder_prefix = format!("{}{backup_name}/", self.prefix);
        let keys = self.list_keys(&folder_prefix).await?;
        if keys.is_empty() {
            return Err(RecallError::not_found("backup", backup_name));
        }

        let mut downloaded = 0usize;
        for key in keys {
            let file_name = match key.rsplit('/').next() {
                Some(name) if !name.is_empty() => name.to_string(),
                _ => continue, // directory markers
            };
            let response = self
                .signed_request(reqwest::Method::GET, &key, &[], Vec::new())
                .await?;
            let response = Self::expect_success(response, "download").await?;
            let bytes = response
                .bytes()
                .await
                .map_err(|e| RecallError::cloud(format!("download body: {e}")))?;
            tokio::fs::write(target.join(&file_name), &bytes).await?;
            downloaded += 1;
        }

        Ok(DownloadReport {
            backup_name: backup_name.to_string(),
            files_downloaded: downloaded,
            local_path: target.display().to_string(),
        })
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let response = self
            .signed_request(
                reqwest::Method::GET,
                "",
                &[
                    ("list-type", "2".to_string()),
                    ("prefix", prefix.to_string()),
                ],
                Vec::new(),
            )
            .await?;
        let response = Self::expect_success(response, "list").await?;
        let body = response
            .text()
            .await
            .map_err(|e| RecallError::cloud(format!("list body: {e}")))?;
        Ok(OBJECT_KEY
            .captures_iter(&body)
            .map(|capture| capture[1].to_string())
            .collect())
    }

    /// List folder-like snapshot prefixes, sorted descending by name (names
    /// encode the timestamp).
    pub async fn list_remote_snapshots(&self) -> Result<Vec<RemoteSnapshot>> {
        let response = self
            .signed_request(
                reqwest::Method::GET,
                "",
                &[
                    ("delimiter", "/".to_string()),
                    ("list-type", "2".to_string()),
                    ("prefix", self.prefix.clone()),
                ],
                Vec::new(),
            )
            .await?;
        let response = Self::expect_success(response, "list snapshots").await?;
        let body = response
            .text()
            .await
            .map_err(|e| RecallError::cloud(format!("list body: {e}")))?;

        let mut snapshots: Vec<RemoteSnapshot> = COMMON_PREFIX
            .captures_iter(&body)
            .filter_map(|capture| {
                let prefix = capture[1].to_string();
                let name = prefix.trim_end_matches('/').rsplit('/').next()?.to_string();
                (!name.is_empty()).then_some(RemoteSnapshot { name, prefix })
            })
            .collect();
        snapshots.sort_by(|a, b| b.name.cmp(&a.name));
        Ok(snapshots)
    }

    /// Name of the most recent remote snapshot, if any.
    pub async fn latest_snapshot(&self) -> Result<Option<String>> {
        Ok(self
            .list_remote_snapshots()
            .await?
            .into_iter()
            .next()
            .map(|snapshot| snapshot.name))
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// AWS-style percent encoding: unreserved characters pass through, `/` only
/// when encoding a path.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync() -> CloudSync {
        CloudSync::new(
            "bucket".to_string(),
            "memories".to_string(),
            "us-east-1".to_string(),
            None,
            "AKIDEXAMPLE".to_string(),
            "secret".to_string(),
        )
    }

    #[test]
    fn test_prefix_normalized_with_trailing_slash() {
        let sync = sync();
        assert_eq!(sync.prefix, "memories/");
    }

    #[test]
    fn test_host_and_path_virtual_host_style() {
        let sync = sync();
        let (host, path) = sync.host_and_path("memories/b1/metadata.json");
        assert_eq!(host, "bucket.s3.us-east-1.amazonaws.com");
        assert_eq!(path, "/memories/b1/metadata.json");
    }

    #[test]
    fn test_host_and_path_custom_endpoint_is_path_style() {
        let sync = CloudSync::new(
            "bucket".to_string(),
            "memories/".to_string(),
            "us-east-1".to_string(),
            Some("http://localhost:9000".to_string()),
            "key".to_string(),
            "secret".to_string(),
        );
        let (host, path) = sync.host_and_path("memories/b1/config.json");
        assert_eq!(host, "localhost:9000");
        assert_eq!(path, "/bucket/memories/b1/config.json");
        assert_eq!(sync.scheme(), "http");
    }

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("a b/c", false), "a%20b/c");
        assert_eq!(uri_encode("a b/c", true), "a%20b%2Fc");
        assert_eq!(uri_encode("safe-._~", true), "safe-._~");
    }

    #[test]
    fn test_common_prefix_parsing() {
        let body = r#"<?xml version="1.0"?><ListBucketResult>
            <Prefix>memories/</Prefix>
            <CommonPrefixes><Prefix>memories/auto_20250101_000000/</Prefix></CommonPrefixes>
            <CommonPrefixes><Prefix>memories/auto_20250201_000000/</Prefix></CommonPrefixes>
        </ListBucketResult>"#;
        let names: Vec<String> = COMMON_PREFIX
            .captures_iter(body)
            .map(|c| c[1].to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "memories/auto_20250101_000000/",
                "memories/auto_20250201_000000/"
            ]
        );
    }

    #[tokio::test]
    async fn test_download_rejects_traversal_names() {
        let sync = sync();
        let dir = tempfile::tempdir().unwrap();
        for bad in ["../up", "a/b", "a\\b"] {
            let err = sync.download_backup(bad, dir.path()).await.unwrap_err();
            assert!(matches!(err, RecallError::InvalidArgument(_)), "{bad}");
        }
    }
}
