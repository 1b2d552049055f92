use crate::config::Config;
use crate::image_reference::RegistryLocation;
use crate::secret_string::SecretString;
use anyhow::{Context, Result};
use regex::Regex;
use reqwest::header::{ACCEPT, CONTENT_TYPE, LINK, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Certificate, Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::future::Future;
use std::sync::Mutex;
use tracing::{debug, info};

static OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
static OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
static DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
static DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

fn accepted_manifest_types() -> String {
    [OCI_MANIFEST, OCI_INDEX, DOCKER_MANIFEST, DOCKER_MANIFEST_LIST].join(", ")
}

/// Credentials presented to a registry when it challenges a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authenticator {
    Anonymous,
    Basic {
        username: String,
        password: SecretString,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawManifest {
    pub media_type: String,
    /// Set for manifests referenced by digest from an index.
    pub digest: Option<String>,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub digest: String,
    pub content: Vec<u8>,
}

/// A fully downloaded image: top-level manifest, the child manifests of an
/// index, and every blob they reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHandle {
    pub manifest: RawManifest,
    pub children: Vec<RawManifest>,
    pub blobs: Vec<Blob>,
}

pub trait RegistryClient: Send + Sync {
    /// Tags of a repository. A repository that does not exist has no tags.
    fn list_tags(
        &self,
        location: &RegistryLocation,
        auth: &Authenticator,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Whether the repository holds a manifest for `reference`, a tag or a digest.
    fn manifest_exists(
        &self,
        location: &RegistryLocation,
        reference: &str,
        auth: &Authenticator,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Downloads the image addressed by `reference`, a tag or a digest.
    fn pull(
        &self,
        location: &RegistryLocation,
        reference: &str,
        auth: &Authenticator,
    ) -> impl Future<Output = Result<ImageHandle>> + Send;

    /// Uploads `image` and publishes its manifest under `reference`, a tag or
    /// the digest of the manifest itself.
    fn push(
        &self,
        location: &RegistryLocation,
        reference: &str,
        image: &ImageHandle,
        auth: &Authenticator,
    ) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    #[serde(default)]
    media_type: Option<String>,
    digest: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestDocument {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    config: Option<Descriptor>,
    #[serde(default)]
    layers: Vec<Descriptor>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

impl ManifestDocument {
    fn blob_digests(&self) -> impl Iterator<Item = &str> {
        self.config
            .iter()
            .chain(self.layers.iter())
            .map(|d| d.digest.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

#[derive(Debug, Clone)]
enum CachedCredential {
    Basic,
    Bearer(String),
}

pub fn create_client(config: &Config) -> Result<OciRegistryClient> {
    info!("Initializing OCI Registry HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    let mut client_builder = Client::builder();

    for file_path in &config.tls.ca_certificate_paths {
        let file_content = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        let cert = Certificate::from_pem(&file_content).context("Failed to parse certificate")?;
        client_builder = client_builder.add_root_certificate(cert);
    }

    let http_client = client_builder
        .build()
        .context("Failed to build HTTP client")?;

    Ok(OciRegistryClient::new(
        http_client,
        config.tls.insecure_registries.iter().cloned(),
    ))
}

/// OCI Distribution API client.
pub struct OciRegistryClient {
    http: Client,
    insecure_registries: HashSet<String>,
    // keyed by registry/repository
    credentials: Mutex<HashMap<String, CachedCredential>>,
}

impl OciRegistryClient {
    pub fn new(http: Client, insecure_registries: impl IntoIterator<Item = String>) -> Self {
        Self {
            http,
            insecure_registries: insecure_registries.into_iter().collect(),
            credentials: Mutex::new(HashMap::new()),
        }
    }

    fn base_url(&self, location: &RegistryLocation) -> Result<Url> {
        let scheme = if self.insecure_registries.contains(&location.registry) {
            "http"
        } else {
            "https"
        };
        let url = format!("{}://{}/v2/{}/", scheme, location.registry, location.repository);
        Url::parse(&url).with_context(|| format!("Invalid registry URL {}", url))
    }

    fn endpoint(&self, location: &RegistryLocation, path: &str) -> Result<Url> {
        self.base_url(location)?
            .join(path)
            .with_context(|| format!("Invalid registry path {} for {}", path, location))
    }

    fn cached_credential(&self, key: &str) -> Option<CachedCredential> {
        self.credentials
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    fn cache_credential(&self, key: String, credential: CachedCredential) {
        self.credentials
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, credential);
    }

    /// Sends a request, answering a single authentication challenge if the
    /// registry raises one. The builder is called again for the retry.
    async fn send<F>(
        &self,
        location: &RegistryLocation,
        auth: &Authenticator,
        build: F,
    ) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let cache_key = location.to_string();
        let cached = self.cached_credential(&cache_key);
        let request = match &cached {
            Some(credential) => apply_credential(build(), credential, auth),
            None => build(),
        };
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to send request to registry {}", location.registry))?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|h| h.to_str().ok())
            .map(parse_challenge)
            .transpose()?
            .flatten();

        let credential = match challenge {
            Some(Challenge::Bearer {
                realm,
                service,
                scope,
            }) => {
                let token = self
                    .fetch_token(&realm, service.as_deref(), scope.as_deref(), auth)
                    .await?;
                CachedCredential::Bearer(token)
            }
            Some(Challenge::Basic) if matches!(auth, Authenticator::Basic { .. }) => {
                CachedCredential::Basic
            }
            _ => return Ok(response),
        };

        debug!("Answering authentication challenge of registry {}", location.registry);
        self.cache_credential(cache_key, credential.clone());
        apply_credential(build(), &credential, auth)
            .send()
            .await
            .with_context(|| format!("Failed to send request to registry {}", location.registry))
    }

    async fn fetch_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scope: Option<&str>,
        auth: &Authenticator,
    ) -> Result<String> {
        let mut url = Url::parse(realm).with_context(|| format!("Invalid token realm {}", realm))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = service {
                query.append_pair("service", service);
            }
            if let Some(scope) = scope {
                query.append_pair("scope", scope);
            }
        }

        let mut request = self.http.get(url);
        if let Authenticator::Basic { username, password } = auth {
            request = request.basic_auth(username, Some(password.expose_secret()));
        }
        let response = request
            .send()
            .await
            .context("Failed to send request to fetch registry token")?;
        if !response.status().is_success() {
            anyhow::bail!(
                "Token endpoint {} returned error status {}",
                realm,
                response.status()
            );
        }

        let body: TokenResponse = response
            .json()
            .await
            .context("Failed to parse registry token response")?;
        body.token
            .or(body.access_token)
            .context("Registry token response contains neither token nor access_token")
    }

    async fn get_manifest(
        &self,
        location: &RegistryLocation,
        reference: &str,
        auth: &Authenticator,
    ) -> Result<(RawManifest, ManifestDocument)> {
        let url = self.endpoint(location, &format!("manifests/{}", reference))?;
        info!("Fetching image manifest from URL {}", url);
        let accept = accepted_manifest_types();
        let response = self
            .send(location, auth, || {
                self.http.get(url.clone()).header(ACCEPT, accept.as_str())
            })
            .await?;
        let response = ensure_success(response, location, "fetching image manifest")?;

        let header_media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);
        let content = response
            .bytes()
            .await
            .context("Failed to read image manifest body")?
            .to_vec();
        let document: ManifestDocument =
            serde_json::from_slice(&content).context("Failed to parse image manifest")?;

        let media_type = document
            .media_type
            .clone()
            .or(header_media_type)
            .unwrap_or_else(|| OCI_MANIFEST.to_string());

        Ok((
            RawManifest {
                media_type,
                digest: None,
                content,
            },
            document,
        ))
    }

    async fn get_blob(
        &self,
        location: &RegistryLocation,
        digest: &str,
        auth: &Authenticator,
    ) -> Result<Blob> {
        let url = self.endpoint(location, &format!("blobs/{}", digest))?;
        debug!("Fetching blob {} from {}", digest, location);
        let response = self.send(location, auth, || self.http.get(url.clone())).await?;
        let response = ensure_success(response, location, "fetching blob")?;
        let content = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read blob {}", digest))?
            .to_vec();
        Ok(Blob {
            digest: digest.to_string(),
            content,
        })
    }

    async fn blob_exists(
        &self,
        location: &RegistryLocation,
        digest: &str,
        auth: &Authenticator,
    ) -> Result<bool> {
        let url = self.endpoint(location, &format!("blobs/{}", digest))?;
        let response = self.send(location, auth, || self.http.head(url.clone())).await?;
        Ok(response.status().is_success())
    }

    async fn upload_blob(
        &self,
        location: &RegistryLocation,
        blob: &Blob,
        auth: &Authenticator,
    ) -> Result<()> {
        if self.blob_exists(location, &blob.digest, auth).await? {
            debug!("Blob {} already present in {}", blob.digest, location);
            return Ok(());
        }

        let start_url = self.endpoint(location, "blobs/uploads/")?;
        let response = self
            .send(location, auth, || self.http.post(start_url.clone()))
            .await?;
        let response = ensure_success(response, location, "starting blob upload")?;
        let upload_location = response
            .headers()
            .get(LOCATION)
            .context("Blob upload response does not contain HTTP header Location")?
            .to_str()
            .context("Received invalid UTF-8 content in Location header")?;

        let mut upload_url = start_url
            .join(upload_location)
            .with_context(|| format!("Invalid blob upload location {}", upload_location))?;
        upload_url
            .query_pairs_mut()
            .append_pair("digest", &blob.digest);

        debug!("Uploading blob {} to {}", blob.digest, location);
        let response = self
            .send(location, auth, || {
                self.http
                    .put(upload_url.clone())
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(blob.content.clone())
            })
            .await?;
        ensure_success(response, location, "uploading blob")?;
        Ok(())
    }

    async fn put_manifest(
        &self,
        location: &RegistryLocation,
        reference: &str,
        manifest: &RawManifest,
        auth: &Authenticator,
    ) -> Result<()> {
        let url = self.endpoint(location, &format!("manifests/{}", reference))?;
        info!("Pushing image manifest to URL {}", url);
        let response = self
            .send(location, auth, || {
                self.http
                    .put(url.clone())
                    .header(CONTENT_TYPE, manifest.media_type.as_str())
                    .body(manifest.content.clone())
            })
            .await?;
        ensure_success(response, location, "pushing image manifest")?;
        Ok(())
    }
}

impl RegistryClient for OciRegistryClient {
    async fn list_tags(
        &self,
        location: &RegistryLocation,
        auth: &Authenticator,
    ) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some(self.endpoint(location, "tags/list")?);

        while let Some(url) = next.take() {
            if !visited.insert(url.clone()) {
                anyhow::bail!(
                    "Registry {} returned a tag list page twice: {}",
                    location.registry,
                    url
                );
            }
            debug!("Listing tags from URL {}", url);
            let response = self.send(location, auth, || self.http.get(url.clone())).await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(tags);
            }
            let response = ensure_success(response, location, "listing tags")?;

            next = response
                .headers()
                .get(LINK)
                .and_then(|h| h.to_str().ok())
                .map(parse_next_link)
                .transpose()?
                .flatten()
                .map(|link| url.join(&link))
                .transpose()
                .context("Invalid pagination link in tag list response")?;

            let page: TagList = response
                .json()
                .await
                .context("Failed to parse tag list response")?;
            tags.extend(page.tags.unwrap_or_default());
        }

        Ok(tags)
    }

    async fn manifest_exists(
        &self,
        location: &RegistryLocation,
        reference: &str,
        auth: &Authenticator,
    ) -> Result<bool> {
        let url = self.endpoint(location, &format!("manifests/{}", reference))?;
        debug!("Checking image manifest at URL {}", url);
        let accept = accepted_manifest_types();
        let response = self
            .send(location, auth, || {
                self.http.head(url.clone()).header(ACCEPT, accept.as_str())
            })
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        ensure_success(response, location, "checking image manifest")?;
        Ok(true)
    }

    async fn pull(
        &self,
        location: &RegistryLocation,
        reference: &str,
        auth: &Authenticator,
    ) -> Result<ImageHandle> {
        let (manifest, document) = self.get_manifest(location, reference, auth).await?;

        let mut children = Vec::new();
        let mut digests: Vec<String> = document.blob_digests().map(str::to_string).collect();
        for child in &document.manifests {
            let (mut child_manifest, child_document) =
                self.get_manifest(location, &child.digest, auth).await?;
            if let Some(media_type) = &child.media_type {
                child_manifest.media_type = media_type.clone();
            }
            child_manifest.digest = Some(child.digest.clone());
            digests.extend(child_document.blob_digests().map(str::to_string));
            children.push(child_manifest);
        }

        let mut seen = HashSet::new();
        digests.retain(|digest| seen.insert(digest.clone()));

        let mut blobs = Vec::with_capacity(digests.len());
        for digest in &digests {
            blobs.push(self.get_blob(location, digest, auth).await?);
        }

        info!(
            "Pulled image {}:{} with {} manifests and {} blobs",
            location,
            reference,
            children.len() + 1,
            blobs.len()
        );
        Ok(ImageHandle {
            manifest,
            children,
            blobs,
        })
    }

    async fn push(
        &self,
        location: &RegistryLocation,
        reference: &str,
        image: &ImageHandle,
        auth: &Authenticator,
    ) -> Result<()> {
        for blob in &image.blobs {
            self.upload_blob(location, blob, auth).await?;
        }
        for child in &image.children {
            let digest = child
                .digest
                .as_deref()
                .context("Child manifest of an image index has no digest")?;
            self.put_manifest(location, digest, child, auth).await?;
        }
        self.put_manifest(location, reference, &image.manifest, auth).await
    }
}

fn apply_credential(
    request: RequestBuilder,
    credential: &CachedCredential,
    auth: &Authenticator,
) -> RequestBuilder {
    match (credential, auth) {
        (CachedCredential::Bearer(token), _) => request.bearer_auth(token),
        (CachedCredential::Basic, Authenticator::Basic { username, password }) => {
            request.basic_auth(username, Some(password.expose_secret()))
        }
        (CachedCredential::Basic, Authenticator::Anonymous) => request,
    }
}

fn ensure_success(response: Response, location: &RegistryLocation, action: &str) -> Result<Response> {
    if !response.status().is_success() {
        anyhow::bail!(
            "Registry {} returned error status {} while {}",
            location.registry,
            response.status(),
            action
        );
    }
    Ok(response)
}

/// Parses a `WWW-Authenticate` header value. Unknown schemes yield `None`.
fn parse_challenge(header: &str) -> Result<Option<Challenge>> {
    let header = header.trim();
    let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));

    if scheme.eq_ignore_ascii_case("basic") {
        return Ok(Some(Challenge::Basic));
    }
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Ok(None);
    }

    let re = Regex::new(r#"(\w+)="([^"]*)""#).context("Invalid regex pattern for auth challenge")?;
    let params: HashMap<String, String> = re
        .captures_iter(params)
        .map(|caps| (caps[1].to_ascii_lowercase(), caps[2].to_string()))
        .collect();

    let realm = params
        .get("realm")
        .cloned()
        .context("Bearer challenge does not contain a realm")?;
    Ok(Some(Challenge::Bearer {
        realm,
        service: params.get("service").cloned(),
        scope: params.get("scope").cloned(),
    }))
}

/// Extracts the target of a `rel="next"` entry from a `Link` header.
fn parse_next_link(header: &str) -> Result<Option<String>> {
    let re = Regex::new(r#"<([^>]+)>\s*;\s*rel="?next"?"#)
        .context("Invalid regex pattern for Link header")?;
    Ok(re.captures(header).map(|caps| caps[1].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, Method, Uri};
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::routing::any;
    use std::sync::Arc;

    #[test]
    fn test_parse_bearer_challenge() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull""#;
        assert_eq!(
            parse_challenge(header).unwrap(),
            Some(Challenge::Bearer {
                realm: "https://auth.docker.io/token".to_string(),
                service: Some("registry.docker.io".to_string()),
                scope: Some("repository:library/nginx:pull".to_string()),
            })
        );
    }

    #[test]
    fn test_parse_basic_and_unknown_challenges() {
        assert_eq!(
            parse_challenge(r#"Basic realm="Registry""#).unwrap(),
            Some(Challenge::Basic)
        );
        assert_eq!(parse_challenge("Negotiate").unwrap(), None);
        assert!(parse_challenge(r#"Bearer service="x""#).is_err());
    }

    #[test]
    fn test_parse_next_link() {
        let header = r#"</v2/backup/app/tags/list?last=v2&n=2>; rel="next""#;
        assert_eq!(
            parse_next_link(header).unwrap().as_deref(),
            Some("/v2/backup/app/tags/list?last=v2&n=2")
        );
        assert_eq!(parse_next_link(r#"</other>; rel="prev""#).unwrap(), None);
    }

    #[derive(Default)]
    struct FakeRegistry {
        manifests: HashMap<(String, String), (String, Vec<u8>)>,
        blobs: HashMap<String, Vec<u8>>,
        next_upload: usize,
        tag_list_status: Option<StatusCode>,
        tag_list_link: Option<String>,
    }

    type SharedRegistry = Arc<Mutex<FakeRegistry>>;

    /// In-memory subset of the OCI Distribution API, enough for pull and push.
    async fn serve(
        State(registry): State<SharedRegistry>,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> AxumResponse {
        let path = uri.path().trim_start_matches("/v2/").to_string();
        let mut registry = registry.lock().unwrap();

        if let Some(repository) = path.strip_suffix("/tags/list") {
            if let Some(status) = registry.tag_list_status {
                return status.into_response();
            }
            let tags: Vec<String> = registry
                .manifests
                .keys()
                .filter(|(repo, reference)| repo == repository && !reference.starts_with("sha256:"))
                .map(|(_, reference)| reference.clone())
                .collect();
            if tags.is_empty() {
                return StatusCode::NOT_FOUND.into_response();
            }
            let body = axum::Json(serde_json::json!({ "name": repository, "tags": tags }));
            return match &registry.tag_list_link {
                Some(link) => ([(LINK, link.clone())], body).into_response(),
                None => body.into_response(),
            };
        }

        if let Some((repository, reference)) = path.rsplit_once("/manifests/") {
            let key = (repository.to_string(), reference.to_string());
            return match method {
                Method::HEAD if registry.manifests.contains_key(&key) => {
                    StatusCode::OK.into_response()
                }
                Method::HEAD => StatusCode::NOT_FOUND.into_response(),
                Method::GET => match registry.manifests.get(&key) {
                    Some((media_type, content)) => {
                        ([(CONTENT_TYPE, media_type.clone())], content.clone()).into_response()
                    }
                    None => StatusCode::NOT_FOUND.into_response(),
                },
                Method::PUT => {
                    let media_type = headers
                        .get(CONTENT_TYPE)
                        .and_then(|h| h.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    registry.manifests.insert(key, (media_type, body.to_vec()));
                    StatusCode::CREATED.into_response()
                }
                _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
            };
        }

        if let Some((repository, upload)) = path.split_once("/blobs/uploads/") {
            return match method {
                Method::POST => {
                    registry.next_upload += 1;
                    let location = format!("/v2/{}/blobs/uploads/{}", repository, registry.next_upload);
                    (StatusCode::ACCEPTED, [(LOCATION, location)]).into_response()
                }
                Method::PUT if !upload.is_empty() => {
                    let digest = uri
                        .query()
                        .and_then(|q| q.strip_prefix("digest="))
                        .unwrap_or_default()
                        .replace("%3A", ":");
                    registry.blobs.insert(digest, body.to_vec());
                    StatusCode::CREATED.into_response()
                }
                _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
            };
        }

        if let Some((_, digest)) = path.rsplit_once("/blobs/") {
            return match registry.blobs.get(digest) {
                Some(_) if method == Method::HEAD => StatusCode::OK.into_response(),
                Some(content) => content.clone().into_response(),
                None => StatusCode::NOT_FOUND.into_response(),
            };
        }

        StatusCode::NOT_FOUND.into_response()
    }

    async fn start_fake_registry(registry: SharedRegistry) -> String {
        let app = Router::new()
            .route("/v2/{*path}", any(serve))
            .with_state(registry);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }

    #[tokio::test]
    async fn test_pull_push_and_list_tags_against_registry() {
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": { "mediaType": "application/vnd.oci.image.config.v1+json", "digest": "sha256:config", "size": 2 },
            "layers": [
                { "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip", "digest": "sha256:layer", "size": 5 }
            ]
        });
        let mut seeded = FakeRegistry::default();
        seeded.manifests.insert(
            ("myrepo/app".to_string(), "v1".to_string()),
            (OCI_MANIFEST.to_string(), serde_json::to_vec(&manifest).unwrap()),
        );
        seeded.blobs.insert("sha256:config".to_string(), b"{}".to_vec());
        seeded.blobs.insert("sha256:layer".to_string(), b"layer".to_vec());
        let registry = Arc::new(Mutex::new(seeded));
        let host = start_fake_registry(registry.clone()).await;

        let client = OciRegistryClient::new(Client::new(), [host.clone()]);
        let source = RegistryLocation {
            registry: host.clone(),
            repository: "myrepo/app".to_string(),
        };
        let destination = RegistryLocation {
            registry: host.clone(),
            repository: "backup/app".to_string(),
        };
        let auth = Authenticator::Anonymous;

        assert!(client.list_tags(&destination, &auth).await.unwrap().is_empty());

        let image = client.pull(&source, "v1", &auth).await.unwrap();
        assert_eq!(image.manifest.media_type, OCI_MANIFEST);
        assert!(image.children.is_empty());
        let digests: Vec<&str> = image.blobs.iter().map(|b| b.digest.as_str()).collect();
        assert_eq!(digests, vec!["sha256:config", "sha256:layer"]);

        client.push(&destination, "v1", &image, &auth).await.unwrap();

        assert_eq!(
            client.list_tags(&destination, &auth).await.unwrap(),
            vec!["v1".to_string()]
        );
        let registry = registry.lock().unwrap();
        let (media_type, content) = registry
            .manifests
            .get(&("backup/app".to_string(), "v1".to_string()))
            .unwrap();
        assert_eq!(media_type, OCI_MANIFEST);
        assert_eq!(content, &image.manifest.content);
    }

    #[tokio::test]
    async fn test_pull_image_index_includes_child_manifests() {
        let child = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "config": { "digest": "sha256:config" },
            "layers": [{ "digest": "sha256:layer" }]
        });
        let index = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": OCI_INDEX,
            "manifests": [{ "mediaType": OCI_MANIFEST, "digest": "sha256:child" }]
        });
        let mut seeded = FakeRegistry::default();
        seeded.manifests.insert(
            ("library/nginx".to_string(), "1.27".to_string()),
            (OCI_INDEX.to_string(), serde_json::to_vec(&index).unwrap()),
        );
        seeded.manifests.insert(
            ("library/nginx".to_string(), "sha256:child".to_string()),
            (OCI_MANIFEST.to_string(), serde_json::to_vec(&child).unwrap()),
        );
        seeded.blobs.insert("sha256:config".to_string(), b"{}".to_vec());
        seeded.blobs.insert("sha256:layer".to_string(), b"layer".to_vec());
        let registry = Arc::new(Mutex::new(seeded));
        let host = start_fake_registry(registry.clone()).await;

        let client = OciRegistryClient::new(Client::new(), [host.clone()]);
        let source = RegistryLocation {
            registry: host.clone(),
            repository: "library/nginx".to_string(),
        };
        let destination = RegistryLocation {
            registry: host,
            repository: "backup/nginx".to_string(),
        };

        let image = client
            .pull(&source, "1.27", &Authenticator::Anonymous)
            .await
            .unwrap();
        assert_eq!(image.manifest.media_type, OCI_INDEX);
        assert_eq!(image.children.len(), 1);
        assert_eq!(image.children[0].digest.as_deref(), Some("sha256:child"));
        assert_eq!(image.blobs.len(), 2);

        client
            .push(&destination, "1.27", &image, &Authenticator::Anonymous)
            .await
            .unwrap();
        let registry = registry.lock().unwrap();
        assert!(
            registry
                .manifests
                .contains_key(&("backup/nginx".to_string(), "sha256:child".to_string()))
        );
    }

    fn seeded_repository(repository: &str, tags: &[&str]) -> FakeRegistry {
        let mut seeded = FakeRegistry::default();
        for tag in tags {
            seeded.manifests.insert(
                (repository.to_string(), tag.to_string()),
                (OCI_MANIFEST.to_string(), b"{}".to_vec()),
            );
        }
        seeded
    }

    #[tokio::test]
    async fn test_list_tags_missing_repository_is_empty_but_errors_fail() {
        let registry = Arc::new(Mutex::new(FakeRegistry::default()));
        let host = start_fake_registry(registry.clone()).await;
        let client = OciRegistryClient::new(Client::new(), [host.clone()]);
        let location = RegistryLocation {
            registry: host,
            repository: "backup/app".to_string(),
        };

        let tags = client
            .list_tags(&location, &Authenticator::Anonymous)
            .await
            .unwrap();
        assert!(tags.is_empty());

        registry.lock().unwrap().tag_list_status = Some(StatusCode::INTERNAL_SERVER_ERROR);
        let err = client
            .list_tags(&location, &Authenticator::Anonymous)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_list_tags_stops_on_repeated_page() {
        let mut seeded = seeded_repository("backup/app", &["v1"]);
        seeded.tag_list_link = Some(r#"</v2/backup/app/tags/list>; rel="next""#.to_string());
        let registry = Arc::new(Mutex::new(seeded));
        let host = start_fake_registry(registry).await;
        let client = OciRegistryClient::new(Client::new(), [host.clone()]);
        let location = RegistryLocation {
            registry: host,
            repository: "backup/app".to_string(),
        };

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            client.list_tags(&location, &Authenticator::Anonymous),
        )
        .await
        .expect("tag listing should terminate");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_manifest_exists_by_tag_and_digest() {
        let registry = Arc::new(Mutex::new(seeded_repository(
            "backup/app",
            &["v1", "sha256:aaaa"],
        )));
        let host = start_fake_registry(registry).await;
        let client = OciRegistryClient::new(Client::new(), [host.clone()]);
        let location = RegistryLocation {
            registry: host,
            repository: "backup/app".to_string(),
        };
        let auth = Authenticator::Anonymous;

        assert!(client.manifest_exists(&location, "v1", &auth).await.unwrap());
        assert!(client.manifest_exists(&location, "sha256:aaaa", &auth).await.unwrap());
        assert!(!client.manifest_exists(&location, "sha256:bbbb", &auth).await.unwrap());
    }
}
