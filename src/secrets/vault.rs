//! Placeholder substitution against the tenant's secret vault.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue};
use moka::future::Cache;
use regex::Regex;
use url::Url;

use crate::error::ProxyError;
use crate::secrets::envelope;
use crate::store::{ConfigStore, SecretRecord};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{([^{}]+)\}\}").unwrap_or_else(|_| unreachable!()));

/// Source of key-encryption-key material, looked up by key version.
pub trait KekSource: Send + Sync {
    fn kek(&self, version: &str) -> Option<Vec<u8>>;
}

/// Reads KEKs from environment variables named by version, base64-encoded.
pub struct EnvKekSource;

impl KekSource for EnvKekSource {
    fn kek(&self, version: &str) -> Option<Vec<u8>> {
        use base64::Engine;
        let raw = std::env::var(version).ok()?;
        base64::engine::general_purpose::STANDARD.decode(raw).ok()
    }
}

/// Fixed key map, for tests and fixtures.
pub struct StaticKekSource(pub HashMap<String, Vec<u8>>);

impl KekSource for StaticKekSource {
    fn kek(&self, version: &str) -> Option<Vec<u8>> {
        self.0.get(version).cloned()
    }
}

/// On-demand secret decryption with two short-TTL cache layers: the
/// (encrypted) secret set per application, and decrypted DEKs keyed by
/// their ciphertext. A DEK is immutable once created.
pub struct SecretVault {
    store: Arc<dyn ConfigStore>,
    kek: Arc<dyn KekSource>,
    secret_sets: Cache<String, Arc<Vec<SecretRecord>>>,
    deks: Cache<String, Arc<Vec<u8>>>,
}

impl SecretVault {
    pub fn new(store: Arc<dyn ConfigStore>, kek: Arc<dyn KekSource>) -> Self {
        Self {
            store,
            kek,
            secret_sets: Cache::builder()
                .max_capacity(1_000)
                .time_to_live(Duration::from_secs(60))
                .build(),
            deks: Cache::builder()
                .max_capacity(1_000)
                .time_to_live(Duration::from_secs(60))
                .build(),
        }
    }

    /// Replace `{{name}}` placeholders in query values and header values
    /// with decrypted secret values. Inputs without placeholders are
    /// returned untouched without any store traffic. Placeholders with no
    /// matching secret stay as-is; decryption failures are fatal.
    pub async fn substitute(
        &self,
        url: Url,
        headers: HeaderMap,
        application_id: Option<&str>,
    ) -> Result<(Url, HeaderMap), ProxyError> {
        let Some(application_id) = application_id else {
            return Ok((url, headers));
        };

        let names = collect_placeholders(&url, &headers);
        if names.is_empty() {
            return Ok((url, headers));
        }

        let values = self.decrypt_named(application_id, &names).await?;

        let url = rewrite_query(url, &values);
        let headers = rewrite_headers(headers, &values)?;
        Ok((url, headers))
    }

    async fn decrypt_named(
        &self,
        application_id: &str,
        names: &HashSet<String>,
    ) -> Result<HashMap<String, String>, ProxyError> {
        let records = self.secret_set(application_id).await?;

        let mut values = HashMap::new();
        for record in records.iter().filter(|r| names.contains(&r.name)) {
            let dek = self.decrypted_dek(record).await?;
            let plain = envelope::decrypt(&record.data, &dek)
                .map_err(|err| ProxyError::Decryption(format!("secret {}: {err}", record.name)))?;
            let plain = String::from_utf8(plain).map_err(|_| {
                ProxyError::Decryption(format!("secret {} is not valid UTF-8", record.name))
            })?;
            values.insert(record.name.clone(), plain);
        }
        Ok(values)
    }

    async fn secret_set(
        &self,
        application_id: &str,
    ) -> Result<Arc<Vec<SecretRecord>>, ProxyError> {
        let store = self.store.clone();
        let id = application_id.to_string();
        self.secret_sets
            .try_get_with(id.clone(), async move {
                store
                    .secrets_for_application(&id)
                    .await
                    .map(Arc::new)
            })
            .await
            .map_err(|err| ProxyError::Unknown(format!("secret lookup failed: {err}")))
    }

    async fn decrypted_dek(&self, record: &SecretRecord) -> Result<Arc<Vec<u8>>, ProxyError> {
        let kek_version = record.kek_version.clone();
        let dek_blob = record.dek.clone();
        let kek_source = self.kek.clone();
        let name = record.name.clone();

        self.deks
            .try_get_with(record.dek.encrypted.clone(), async move {
                let kek = kek_source.kek(&kek_version).ok_or_else(|| {
                    ProxyError::Decryption(format!("no KEK for version {kek_version}"))
                })?;
                envelope::decrypt(&dek_blob, &kek)
                    .map(Arc::new)
                    .map_err(|err| ProxyError::Decryption(format!("DEK for {name}: {err}")))
            })
            .await
            .map_err(|err: Arc<ProxyError>| ProxyError::Decryption(err.to_string()))
    }
}

fn collect_placeholders(url: &Url, headers: &HeaderMap) -> HashSet<String> {
    let mut names = HashSet::new();
    for (_, value) in url.query_pairs() {
        for capture in PLACEHOLDER.captures_iter(&value) {
            names.insert(capture[1].to_string());
        }
    }
    for value in headers.values() {
        if let Ok(value) = value.to_str() {
            for capture in PLACEHOLDER.captures_iter(value) {
                names.insert(capture[1].to_string());
            }
        }
    }
    names
}

fn replace_placeholders(input: &str, values: &HashMap<String, String>) -> String {
    PLACEHOLDER
        .replace_all(input, |caps: &regex::Captures<'_>| {
            values
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn rewrite_query(mut url: Url, values: &HashMap<String, String>) -> Url {
    let pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), replace_placeholders(&v, values)))
        .collect();
    if !pairs.is_empty() {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    url
}

fn rewrite_headers(
    headers: HeaderMap,
    values: &HashMap<String, String>,
) -> Result<HeaderMap, ProxyError> {
    let mut rewritten = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        let value = match value.to_str() {
            Ok(text) if PLACEHOLDER.is_match(text) => {
                let replaced = replace_placeholders(text, values);
                HeaderValue::from_str(&replaced).map_err(|_| {
                    ProxyError::Decryption(format!(
                        "substituted value for header {name} is not a valid header value"
                    ))
                })?
            }
            _ => value.clone(),
        };
        rewritten.append(name.clone(), value);
    }
    Ok(rewritten)
}
