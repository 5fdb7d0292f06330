use anyhow::{Context, Result};
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::error::SourceError;

const PLEX_TV_BASE_URL: &str = "https://plex.tv";
const CLIENT_IDENTIFIER: &str = "watchsync";
const LIBRARY_IDENTIFIER: &str = "com.plexapp.plugins.library";

/// Reads are retried this many times at most; mutations never are.
const MAX_READ_ATTEMPTS: u32 = 10;

/// Plex metadata type codes used by `/library/sections/{key}/all?type=`.
pub const TYPE_MOVIE: u8 = 1;
pub const TYPE_SHOW: u8 = 2;
pub const TYPE_EPISODE: u8 = 4;
pub const TYPE_TRACK: u8 = 10;

#[derive(Debug, Clone)]
pub struct LibraryInfo {
    pub key: String,
    pub type_: String,
    pub title: String,
    pub agent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AccountInfo {
    pub id: String,
    pub username: Option<String>,
    pub email: Option<String>,
    pub title: Option<String>,
}

/// A shared user's grant on this server.
#[derive(Debug, Clone)]
pub struct SharedServerGrant {
    pub user_id: String,
    pub username: Option<String>,
    pub email: Option<String>,
    pub access_token: Option<String>,
    pub section_keys: Vec<String>,
}

pub struct PlexHttpClient {
    client: Client,
    server_url: String,
    token: String,
    page_size: u32,
    plex_tv_base_url: String,
}

impl PlexHttpClient {
    pub fn new(server_url: &str, token: String, timeout: Duration, page_size: u32) -> Result<Self> {
        let client = Client::builder()
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::ACCEPT,
                    reqwest::header::HeaderValue::from_static("application/json"),
                );
                headers.insert(
                    reqwest::header::HeaderName::from_static("x-plex-client-identifier"),
                    reqwest::header::HeaderValue::from_static(CLIENT_IDENTIFIER),
                );
                headers.insert(
                    reqwest::header::HeaderName::from_static("x-plex-product"),
                    reqwest::header::HeaderValue::from_static(CLIENT_IDENTIFIER),
                );
                headers
            })
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            server_url: server_url.trim_end_matches('/').to_string(),
            token,
            page_size: page_size.max(1),
            plex_tv_base_url: PLEX_TV_BASE_URL.to_string(),
        })
    }

    pub fn owner_token(&self) -> &str {
        &self.token
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    async fn send(&self, request: RequestBuilder, token: &str, what: &str) -> Result<Response> {
        let response = request
            .header("X-Plex-Token", token)
            .send()
            .await
            .map_err(SourceError::from)
            .with_context(|| format!("Failed to {}", what))?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(SourceError::from_status(status, format!("{}: {}", what, body.trim())).into())
        }
    }

    async fn get(&self, url: &str, headers: &[(&str, String)], token: &str, what: &str) -> Result<Response> {
        self.read(Method::GET, url, headers, None, token, what).await
    }

    /// A request that changes nothing, with exponential backoff on throttling,
    /// gateway errors and dropped connections.
    async fn read(
        &self,
        method: Method,
        url: &str,
        headers: &[(&str, String)],
        body: Option<&Value>,
        token: &str,
        what: &str,
    ) -> Result<Response> {
        let mut attempt = 0u32;
        let operation = || {
            attempt += 1;
            let attempt = attempt;
            let method = method.clone();
            async move {
                let mut request = self.client.request(method, url).header("X-Plex-Token", token);
                for (name, value) in headers {
                    request = request.header(*name, value.as_str());
                }
                if let Some(body) = body {
                    request = request.json(body);
                }
                let outcome = match request.send().await {
                    Ok(response) if response.status().is_success() => return Ok(response),
                    Ok(response) => {
                        let status = response.status();
                        let body = response.text().await.unwrap_or_default();
                        let error = SourceError::from_status(status, format!("{}: {}", what, body.trim()));
                        (is_retryable_status(status), anyhow::Error::new(error))
                    }
                    Err(e) => {
                        let retryable = e.is_connect() || e.is_timeout();
                        let error = anyhow::Error::new(SourceError::from(e)).context(format!("Failed to {}", what));
                        (retryable, error)
                    }
                };
                match outcome {
                    (true, error) if attempt < MAX_READ_ATTEMPTS => Err(backoff::Error::transient(error)),
                    (_, error) => Err(backoff::Error::permanent(error)),
                }
            }
        };
        backoff::future::retry_notify(read_backoff(), operation, |error: anyhow::Error, wait: Duration| {
            warn!("Plex API: {} failed ({:#}), retrying in {:?}", what, error, wait);
        })
        .await
    }

    async fn get_json(&self, url: &str, token: &str, what: &str) -> Result<Value> {
        trace!("Plex API: GET {}", url);
        let response = self.get(url, &[], token, what).await?;
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", what))
    }

    /// `GET /` on the server: machine identifier, name and version.
    pub async fn get_server_identity(&self) -> Result<(String, String, Option<String>)> {
        let url = format!("{}/", self.server_url);
        let json = self.get_json(&url, &self.token, "read server identity").await?;
        let container = json.get("MediaContainer").unwrap_or(&Value::Null);

        let identifier = str_field(container, "machineIdentifier")
            .ok_or_else(|| anyhow::anyhow!("Server response has no machineIdentifier"))?;
        let name = str_field(container, "friendlyName").unwrap_or_else(|| identifier.clone());
        let version = str_field(container, "version");
        Ok((identifier, name, version))
    }

    pub async fn get_libraries(&self) -> Result<Vec<LibraryInfo>> {
        let url = format!("{}/library/sections", self.server_url);
        let json = self.get_json(&url, &self.token, "list libraries").await?;

        let libraries = json
            .get("MediaContainer")
            .and_then(|mc| mc.get("Directory"))
            .and_then(|d| d.as_array())
            .map(|dirs| {
                dirs.iter()
                    .map(|dir| LibraryInfo {
                        key: str_field(dir, "key").unwrap_or_default(),
                        type_: str_field(dir, "type").unwrap_or_default(),
                        title: str_field(dir, "title").unwrap_or_default(),
                        agent: str_field(dir, "agent"),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(libraries)
    }

    /// Every item of `plex_type` in a section, as seen by `token`'s user.
    pub async fn get_section_items(&self, token: &str, section_key: &str, plex_type: u8) -> Result<Vec<Value>> {
        let url = format!(
            "{}/library/sections/{}/all?type={}&includeGuids=1",
            self.server_url, section_key, plex_type
        );

        let mut items = Vec::new();
        let mut start: u64 = 0;
        loop {
            let paging = [
                ("X-Plex-Container-Start", start.to_string()),
                ("X-Plex-Container-Size", self.page_size.to_string()),
            ];
            let response = self.get(&url, &paging, token, "list section items").await?;
            let json: Value = response
                .json()
                .await
                .context("Failed to parse section items response")?;

            let container = json.get("MediaContainer").unwrap_or(&Value::Null);
            let page = container
                .get("Metadata")
                .and_then(|m| m.as_array())
                .cloned()
                .unwrap_or_default();
            let total = container
                .get("totalSize")
                .and_then(as_u64_lenient)
                .unwrap_or(start + page.len() as u64);

            let fetched = page.len() as u64;
            items.extend(page);
            start += fetched;

            debug!(
                "Plex API: section {} page fetched ({} items, {}/{})",
                section_key, fetched, start, total
            );
            if fetched == 0 || start >= total {
                break;
            }
        }

        Ok(items)
    }

    pub async fn get_metadata(&self, token: &str, rating_key: &str) -> Result<Value> {
        let url = format!("{}/library/metadata/{}", self.server_url, rating_key);
        let json = self.get_json(&url, token, "read item metadata").await?;
        first_metadata(&json).ok_or_else(|| SourceError::NotFound(format!("metadata item {}", rating_key)).into())
    }

    /// Item with its children inlined (seasons of a show, episodes of a season).
    pub async fn get_metadata_with_children(&self, token: &str, rating_key: &str) -> Result<Value> {
        let url = format!(
            "{}/library/metadata/{}?includeChildren=1&episodeOrder=tvdbAiring",
            self.server_url,
            urlencoding::encode(rating_key)
        );
        let json = self.get_json(&url, token, "read item with children").await?;
        first_metadata(&json).ok_or_else(|| SourceError::NotFound(format!("metadata item {}", rating_key)).into())
    }

    /// Best match of a metadata service for an old-agent GUID, if it knows one.
    pub async fn match_guid(&self, token: &str, plex_type: u8, guid: &str) -> Result<Option<Value>> {
        let url = format!("{}/library/metadata/matches", self.server_url);
        let body = serde_json::json!({
            "type": plex_type,
            "excludeElements": "Media",
            "guid": guid,
        });
        trace!("Plex API: POST {} ({})", url, guid);
        let response = self
            .read(Method::POST, &url, &[], Some(&body), token, "match metadata")
            .await?;
        let json: Value = response.json().await.context("Failed to parse metadata match response")?;
        Ok(first_metadata(&json))
    }

    pub async fn get_account(&self) -> Result<AccountInfo> {
        let url = format!("{}/api/v2/user", self.plex_tv_base_url);
        let json = self.get_json(&url, &self.token, "read account").await?;
        parse_account(&json).ok_or_else(|| anyhow::anyhow!("Account response has no id"))
    }

    pub async fn get_friends(&self) -> Result<Vec<AccountInfo>> {
        let url = format!("{}/api/v2/friends", self.plex_tv_base_url);
        let json = self.get_json(&url, &self.token, "list shared users").await?;
        Ok(json
            .as_array()
            .map(|friends| friends.iter().filter_map(parse_account).collect())
            .unwrap_or_default())
    }

    pub async fn get_shared_servers(&self, machine_identifier: &str) -> Result<Vec<SharedServerGrant>> {
        let url = format!(
            "{}/api/servers/{}/shared_servers",
            self.plex_tv_base_url, machine_identifier
        );
        let json = self.get_json(&url, &self.token, "list shared server grants").await?;
        Ok(parse_shared_servers(&json))
    }

    async fn library_action(&self, token: &str, path: &str, rating_key: &str, extra: &str, what: &str) -> Result<()> {
        let mut url = format!(
            "{}/:/{}?identifier={}&key={}",
            self.server_url,
            path,
            LIBRARY_IDENTIFIER,
            urlencoding::encode(rating_key)
        );
        if !extra.is_empty() {
            url.push('&');
            url.push_str(extra);
        }
        debug!("Plex API: {} ({})", what, url);
        let request = if path == "rate" {
            self.client.put(&url)
        } else {
            self.client.get(&url)
        };
        self.send(request, token, what).await?;
        Ok(())
    }

    pub async fn scrobble(&self, token: &str, rating_key: &str) -> Result<()> {
        self.library_action(token, "scrobble", rating_key, "", "mark as watched")
            .await
    }

    pub async fn unscrobble(&self, token: &str, rating_key: &str) -> Result<()> {
        self.library_action(token, "unscrobble", rating_key, "", "mark as unwatched")
            .await
    }

    pub async fn set_rating(&self, token: &str, rating_key: &str, rating: f32) -> Result<()> {
        let extra = format!("rating={}", rating);
        self.library_action(token, "rate", rating_key, &extra, "set rating").await
    }

    pub async fn update_progress(&self, token: &str, rating_key: &str, time_ms: u64) -> Result<()> {
        let extra = format!("time={}&state=stopped", time_ms);
        self.library_action(token, "progress", rating_key, &extra, "update progress").await
    }
}

/// Throttling and transient server-side failures; anything else will not improve on a retry.
pub(crate) fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504)
}

fn read_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(250))
        .with_max_interval(Duration::from_secs(10))
        .with_max_elapsed_time(Some(Duration::from_secs(120)))
        .build()
}

fn first_metadata(json: &Value) -> Option<Value> {
    json.get("MediaContainer")
        .and_then(|mc| mc.get("Metadata"))
        .and_then(|m| m.as_array())
        .and_then(|m| m.first())
        .cloned()
}

pub(crate) fn str_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Plex sends some numbers as strings depending on the endpoint.
pub(crate) fn as_u64_lenient(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

pub(crate) fn u64_field(value: &Value, key: &str) -> Option<u64> {
    value.get(key).and_then(as_u64_lenient)
}

pub(crate) fn f64_field(value: &Value, key: &str) -> Option<f64> {
    let field = value.get(key)?;
    field
        .as_f64()
        .or_else(|| field.as_str().and_then(|s| s.parse().ok()))
}

pub(crate) fn parse_timestamp(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    value
        .get(key)
        .and_then(|t| t.as_i64().or_else(|| t.as_str().and_then(|s| s.parse().ok())))
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}

/// GUIDs from the `Guid` array plus the item's own `guid`.
pub(crate) fn parse_guids(item: &Value) -> Vec<String> {
    let mut guids = Vec::new();
    if let Some(primary) = item.get("guid").and_then(|g| g.as_str()) {
        guids.push(primary.to_string());
    }
    match item.get("Guid") {
        Some(Value::Array(entries)) => {
            for entry in entries {
                if let Some(id) = entry.get("id").and_then(|i| i.as_str()).or_else(|| entry.as_str()) {
                    guids.push(id.to_string());
                }
            }
        }
        Some(Value::Object(entry)) => {
            if let Some(id) = entry.get("id").and_then(|i| i.as_str()) {
                guids.push(id.to_string());
            }
        }
        _ => {}
    }
    guids
}

fn parse_account(value: &Value) -> Option<AccountInfo> {
    Some(AccountInfo {
        id: str_field(value, "id")?,
        username: str_field(value, "username"),
        email: str_field(value, "email"),
        title: str_field(value, "title").or_else(|| str_field(value, "friendlyName")),
    })
}

fn parse_shared_servers(json: &Value) -> Vec<SharedServerGrant> {
    let entries = json
        .get("MediaContainer")
        .and_then(|mc| mc.get("SharedServer"))
        .or_else(|| json.get("SharedServer"))
        .or(Some(json));

    let Some(Value::Array(entries)) = entries else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let user_id = str_field(entry, "userID").or_else(|| str_field(entry, "userId"))?;
            let section_keys = entry
                .get("Section")
                .or_else(|| entry.get("sections"))
                .and_then(|s| s.as_array())
                .map(|sections| {
                    sections
                        .iter()
                        .filter(|s| is_shared(s))
                        .filter_map(|s| str_field(s, "key").or_else(|| str_field(s, "id")))
                        .collect()
                })
                .unwrap_or_default();
            Some(SharedServerGrant {
                user_id,
                username: str_field(entry, "username"),
                email: str_field(entry, "email"),
                access_token: str_field(entry, "accessToken"),
                section_keys,
            })
        })
        .collect()
}

fn is_shared(section: &Value) -> bool {
    match section.get("shared") {
        None => true,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_u64() == Some(1),
        Some(Value::String(s)) => s == "1" || s.eq_ignore_ascii_case("true"),
        Some(_) => false,
    }
}
