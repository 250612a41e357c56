//! S3-compatible object storage over HTTP.
//!
//! Requests are signed with AWS Signature Version 4 and addressed either
//! path-style (`endpoint/bucket/key`) or virtual-hosted (`bucket.endpoint/key`).
//! Objects are sent as multipart uploads: the body is cut into parts of at
//! least `part_size` bytes, each signed with its own hash, so memory stays
//! bounded and the total length never has to be known up front.

use super::{Bucket, ByteStream, LifecycleRule, ObjectStore};
use crate::config::UrlStyle;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use base64::Engine as _;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use md5::Md5;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Method, StatusCode, Url};
use sha2::{Digest, Sha256};
use std::io;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Part size used when none is configured
pub const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

/// Characters left alone by SigV4 URI encoding
const URI_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

struct S3Client {
    http: reqwest::Client,
    endpoint: Url,
    region: String,
    access_key: String,
    access_secret: String,
    url_style: UrlStyle,
    part_size: usize,
}

/// Client for one S3-compatible endpoint
pub struct S3Store {
    client: Arc<S3Client>,
}

impl S3Store {
    pub fn new(
        endpoint: &str,
        region: &str,
        access_key: &str,
        access_secret: &str,
        url_style: UrlStyle,
    ) -> Result<Self> {
        if endpoint.is_empty() {
            return Err(BackupError::ClientInit("storage.endpoint is not set".into()));
        }
        let endpoint = Url::parse(endpoint).map_err(|e| {
            BackupError::ClientInit(format!("invalid endpoint {}: {}", endpoint, e))
        })?;
        if !matches!(endpoint.scheme(), "http" | "https") || endpoint.host_str().is_none() {
            return Err(BackupError::ClientInit(format!(
                "endpoint {} must be an http(s) URL with a host",
                endpoint
            )));
        }
        if access_key.is_empty() || access_secret.is_empty() {
            return Err(BackupError::ClientInit(
                "access key and secret must both be set".into(),
            ));
        }

        let http = reqwest::Client::builder()
            .user_agent(concat!("nightly-backup/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BackupError::ClientInit(e.to_string()))?;

        Ok(Self {
            client: Arc::new(S3Client {
                http,
                endpoint,
                region: region.to_string(),
                access_key: access_key.to_string(),
                access_secret: access_secret.to_string(),
                url_style,
                part_size: DEFAULT_PART_SIZE,
            }),
        })
    }

    /// Bytes buffered per uploaded part. The config layer enforces the
    /// S3 minimum; smaller values are only useful against test servers.
    pub fn with_part_size(mut self, part_size: usize) -> Self {
        if let Some(client) = Arc::get_mut(&mut self.client) {
            client.part_size = part_size.max(1);
        }
        self
    }
}

/// Canonical request parts that get signed
struct SigningRequest<'a> {
    method: &'a str,
    /// Already URI-encoded
    path: &'a str,
    /// Already canonical (sorted, encoded)
    query: &'a str,
    /// Lowercase names; `host`, `x-amz-date` and `x-amz-content-sha256`
    /// must be present
    headers: Vec<(String, String)>,
    payload_hash: &'a str,
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length, so this cannot fail
    let mut mac = match Hmac::<Sha256>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA256 accepts any key length"),
    };
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn derive_signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// `Authorization` header value for `req`
fn sign_v4(
    req: &SigningRequest<'_>,
    access_key: &str,
    secret: &str,
    region: &str,
    now: DateTime<Utc>,
) -> String {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let scope = format!("{}/{}/s3/aws4_request", date_stamp, region);

    let mut headers = req.headers.clone();
    headers.sort();
    let canonical_headers: String = headers
        .iter()
        .map(|(name, value)| format!("{}:{}\n", name, value.trim()))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        req.method, req.path, req.query, canonical_headers, signed_headers, req.payload_hash
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        hex_sha256(canonical_request.as_bytes())
    );

    let key = derive_signing_key(secret, &date_stamp, region, "s3");
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        access_key, scope, signed_headers, signature
    )
}

/// URI-encode an object key, keeping `/` separators
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| utf8_percent_encode(segment, URI_ENCODE_SET).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Text of the first `<tag>` element in `xml`
fn xml_text(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = start + xml[start..].find(&close)?;
    Some(xml_unescape(&xml[start..end]))
}

/// Body of a CompleteMultipartUpload request; `parts` are `(number, etag)`
fn complete_xml(parts: &[(usize, String)]) -> String {
    let mut xml = String::from("<CompleteMultipartUpload>");
    for (number, etag) in parts {
        xml.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            number,
            xml_escape(etag)
        ));
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

fn lifecycle_xml(rule: &LifecycleRule) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
<LifecycleConfiguration><Rule><ID>{}</ID><Filter><Prefix>{}</Prefix></Filter>\
<Status>Enabled</Status><Expiration><Days>{}</Days></Expiration></Rule>\
</LifecycleConfiguration>",
        xml_escape(&rule.id),
        xml_escape(&rule.prefix),
        rule.expiration_days
    )
}

/// Cuts a body stream into upload parts
struct PartReader {
    body: ByteStream,
    buf: BytesMut,
    part_size: usize,
    ended: bool,
}

impl PartReader {
    fn new(body: ByteStream, part_size: usize) -> Self {
        Self {
            body,
            buf: BytesMut::new(),
            part_size,
            ended: false,
        }
    }

    /// Next part of at least `part_size` bytes. Only the last part may be
    /// shorter. `None` once the body is exhausted.
    async fn next_part(&mut self) -> io::Result<Option<Bytes>> {
        while !self.ended && self.buf.len() < self.part_size {
            match self.body.next().await {
                Some(chunk) => self.buf.extend_from_slice(&chunk?),
                None => self.ended = true,
            }
        }
        if self.buf.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.buf.split().freeze()))
        }
    }
}

impl S3Client {
    fn endpoint_host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    /// Host and URI-encoded path for a bucket, or an object in it
    fn locate(&self, bucket: &str, key: Option<&str>) -> (String, String) {
        let key_path = key.map(encode_key);
        match self.url_style {
            UrlStyle::Path => {
                let mut path = format!("/{}", encode_key(bucket));
                if let Some(key_path) = key_path {
                    path.push('/');
                    path.push_str(&key_path);
                }
                (self.endpoint_host(), path)
            }
            UrlStyle::Virtual => (
                format!("{}.{}", bucket, self.endpoint_host()),
                format!("/{}", key_path.unwrap_or_default()),
            ),
        }
    }

    /// Build a signed request. `query` must already be canonical and
    /// `extra_headers` must use lowercase names.
    fn request(
        &self,
        method: Method,
        bucket: &str,
        key: Option<&str>,
        query: &str,
        payload_hash: &str,
        extra_headers: Vec<(String, String)>,
    ) -> std::result::Result<reqwest::RequestBuilder, String> {
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let (host, path) = self.locate(bucket, key);

        let mut headers = extra_headers;
        headers.push(("host".to_string(), host.clone()));
        headers.push(("x-amz-content-sha256".to_string(), payload_hash.to_string()));
        headers.push(("x-amz-date".to_string(), amz_date));

        let method_name = method.to_string();
        let signing = SigningRequest {
            method: &method_name,
            path: &path,
            query,
            headers,
            payload_hash,
        };
        let authorization = sign_v4(
            &signing,
            &self.access_key,
            &self.access_secret,
            &self.region,
            now,
        );

        let mut url = format!("{}://{}{}", self.endpoint.scheme(), host, path);
        if !query.is_empty() {
            url.push('?');
            url.push_str(query);
        }
        let url = Url::parse(&url).map_err(|e| format!("invalid request URL {}: {}", url, e))?;

        let mut builder = self.http.request(method, url);
        for (name, value) in signing.headers {
            // reqwest sets Host from the URL
            if name != "host" {
                builder = builder.header(name, value);
            }
        }
        Ok(builder.header(reqwest::header::AUTHORIZATION, authorization))
    }
}

async fn error_body(resp: reqwest::Response) -> String {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    let text: String = text.chars().take(512).collect();
    if text.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, text)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn open_bucket(&self, name: &str) -> Result<Arc<dyn Bucket>> {
        let request = self
            .client
            .request(Method::HEAD, name, None, "", &hex_sha256(b""), Vec::new())
            .map_err(|e| BackupError::bucket(name, e))?;

        let resp = request
            .send()
            .await
            .map_err(|e| BackupError::bucket(name, e))?;

        match resp.status() {
            s if s.is_success() => {
                debug!(bucket = %name, "Bucket is reachable");
                Ok(Arc::new(S3Bucket {
                    client: Arc::clone(&self.client),
                    name: name.to_string(),
                }))
            }
            StatusCode::NOT_FOUND => Err(BackupError::bucket(name, "bucket does not exist")),
            StatusCode::FORBIDDEN => Err(BackupError::bucket(name, "access denied")),
            s => Err(BackupError::bucket(name, format!("unexpected status {}", s))),
        }
    }
}

/// A bucket on an S3-compatible endpoint
pub struct S3Bucket {
    client: Arc<S3Client>,
    name: String,
}

impl S3Bucket {
    async fn create_upload(&self, key: &str) -> std::result::Result<String, String> {
        let resp = self
            .client
            .request(
                Method::POST,
                &self.name,
                Some(key),
                "uploads=",
                &hex_sha256(b""),
                vec![(
                    "content-type".to_string(),
                    "application/octet-stream".to_string(),
                )],
            )?
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("create multipart upload: {}", error_body(resp).await));
        }
        let text = resp.text().await.map_err(|e| e.to_string())?;
        xml_text(&text, "UploadId").ok_or_else(|| "create multipart upload: no UploadId".into())
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        number: usize,
        part: Bytes,
    ) -> std::result::Result<String, String> {
        let query = format!("partNumber={}&uploadId={}", number, encode_component(upload_id));
        let len = part.len();
        let resp = self
            .client
            .request(
                Method::PUT,
                &self.name,
                Some(key),
                &query,
                &hex_sha256(&part),
                Vec::new(),
            )?
            .body(part)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("part {}: {}", number, error_body(resp).await));
        }
        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| format!("part {}: response has no ETag", number))?;
        debug!(key = %key, part = number, bytes = len, "Part uploaded");
        Ok(etag)
    }

    async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(usize, String)],
    ) -> std::result::Result<(), String> {
        let body = complete_xml(parts);
        let query = format!("uploadId={}", encode_component(upload_id));
        let resp = self
            .client
            .request(
                Method::POST,
                &self.name,
                Some(key),
                &query,
                &hex_sha256(body.as_bytes()),
                vec![("content-type".to_string(), "application/xml".to_string())],
            )?
            .body(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("complete multipart upload: {}", error_body(resp).await));
        }
        // A 200 response can still carry an error document
        let text = resp.text().await.map_err(|e| e.to_string())?;
        if text.contains("<Error>") {
            let text: String = text.chars().take(512).collect();
            return Err(format!("complete multipart upload: {}", text));
        }
        Ok(())
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) {
        let query = format!("uploadId={}", encode_component(upload_id));
        let result = match self.client.request(
            Method::DELETE,
            &self.name,
            Some(key),
            &query,
            &hex_sha256(b""),
            Vec::new(),
        ) {
            Ok(request) => match request.send().await {
                Ok(resp) if resp.status().is_success() => Ok(()),
                Ok(resp) => Err(error_body(resp).await),
                Err(e) => Err(e.to_string()),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(key = %key, upload_id = %upload_id, error = %e, "Failed to abort multipart upload");
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        body: ByteStream,
    ) -> std::result::Result<(), String> {
        let mut reader = PartReader::new(body, self.client.part_size);
        let mut parts = Vec::new();
        while let Some(part) = reader.next_part().await.map_err(|e| e.to_string())? {
            let number = parts.len() + 1;
            let etag = self.upload_part(key, upload_id, number, part).await?;
            parts.push((number, etag));
        }
        if parts.is_empty() {
            // Completing needs at least one part
            let etag = self.upload_part(key, upload_id, 1, Bytes::new()).await?;
            parts.push((1, etag));
        }
        self.complete_upload(key, upload_id, &parts).await
    }
}

/// URI-encode a single query value
fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, URI_ENCODE_SET).to_string()
}

#[async_trait]
impl Bucket for S3Bucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put_object(&self, key: &str, body: ByteStream) -> Result<()> {
        let upload_id = self
            .create_upload(key)
            .await
            .map_err(|e| BackupError::upload(key, e))?;
        debug!(key = %key, upload_id = %upload_id, "Multipart upload started");

        match self.upload_parts(key, &upload_id, body).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.abort_upload(key, &upload_id).await;
                Err(BackupError::upload(key, e))
            }
        }
    }

    async fn put_lifecycle(&self, rule: &LifecycleRule) -> Result<()> {
        let body = lifecycle_xml(rule);
        let content_md5 =
            base64::engine::general_purpose::STANDARD.encode(Md5::digest(body.as_bytes()));

        let request = self
            .client
            .request(
                Method::PUT,
                &self.name,
                None,
                "lifecycle=",
                &hex_sha256(body.as_bytes()),
                vec![
                    ("content-md5".to_string(), content_md5),
                    ("content-type".to_string(), "application/xml".to_string()),
                ],
            )
            .map_err(|e| BackupError::bucket(&self.name, e))?;

        let resp = request
            .body(body)
            .send()
            .await
            .map_err(|e| BackupError::bucket(&self.name, e))?;

        if resp.status().is_success() {
            info!(
                bucket = %self.name,
                prefix = %rule.prefix,
                days = rule.expiration_days,
                "Lifecycle expiration rule applied"
            );
            Ok(())
        } else {
            Err(BackupError::bucket(
                &self.name,
                format!("lifecycle rule rejected: {}", error_body(resp).await),
            ))
        }
    }
}
