//! REST client for Azure-Table-compatible services (Azure Storage, Azurite).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Method, StatusCode};
use serde_json::{Map, Value};
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::codec::{FieldValue, TableRecord};
use super::remote::{TableClient, TableOperation};
use crate::error::{FeedscopeError, Result};

const API_VERSION: &str = "2019-02-02";
const ACCEPT_JSON: &str = "application/json;odata=minimalmetadata";
const DATA_SERVICE_VERSION: &str = "3.0;NetFx";
const QUERY_PAGE_SIZE: usize = 1000;
const DEFAULT_TIMEOUT_SECS: u64 = 30;

const DEV_ACCOUNT: &str = "devstoreaccount1";
const DEV_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
const DEV_ENDPOINT: &str = "http://127.0.0.1:10002/devstoreaccount1";

const CONTINUATION_PARTITION: &str = "x-ms-continuation-NextPartitionKey";
const CONTINUATION_ROW: &str = "x-ms-continuation-NextRowKey";

enum Credentials {
    SharedKey { account: String, key: Vec<u8> },
    Sas(Vec<(String, String)>),
}

pub struct AzureTableClient {
    endpoint: Url,
    credentials: Credentials,
    client: reqwest::Client,
}

impl AzureTableClient {
    /// Build a client from a storage connection string, e.g.
    /// `DefaultEndpointsProtocol=https;AccountName=acct;AccountKey=...;EndpointSuffix=core.windows.net`.
    pub fn from_connection_string(connection_string: &str) -> Result<Self> {
        let settings: HashMap<String, String> = connection_string
            .split(';')
            .filter_map(|part| {
                let (k, v) = part.trim().split_once('=')?;
                Some((k.trim().to_string(), v.trim().to_string()))
            })
            .collect();

        if settings
            .get("UseDevelopmentStorage")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
        {
            return Self::new(
                DEV_ENDPOINT,
                Credentials::SharedKey {
                    account: DEV_ACCOUNT.to_string(),
                    key: decode_key(DEV_KEY)?,
                },
            );
        }

        let account = settings.get("AccountName").cloned();
        let endpoint = match (settings.get("TableEndpoint"), &account) {
            (Some(endpoint), _) => endpoint.clone(),
            (None, Some(account)) => {
                let protocol = settings
                    .get("DefaultEndpointsProtocol")
                    .map(String::as_str)
                    .unwrap_or("https");
                let suffix = settings
                    .get("EndpointSuffix")
                    .map(String::as_str)
                    .unwrap_or("core.windows.net");
                format!("{}://{}.table.{}", protocol, account, suffix)
            }
            (None, None) => {
                return Err(FeedscopeError::Configuration(
                    "connection string needs AccountName or TableEndpoint".to_string(),
                ))
            }
        };

        let credentials = match (account, settings.get("AccountKey"), settings.get("SharedAccessSignature")) {
            (Some(account), Some(key), _) => Credentials::SharedKey {
                account,
                key: decode_key(key)?,
            },
            (_, _, Some(sas)) => Credentials::Sas(
                url::form_urlencoded::parse(sas.trim_start_matches('?').as_bytes())
                    .into_owned()
                    .collect(),
            ),
            _ => {
                return Err(FeedscopeError::Configuration(
                    "connection string needs AccountName and AccountKey, or SharedAccessSignature"
                        .to_string(),
                ))
            }
        };

        Self::new(&endpoint, credentials)
    }

    fn new(endpoint: &str, credentials: Credentials) -> Result<Self> {
        let endpoint = Url::parse(endpoint).map_err(|e| {
            FeedscopeError::Configuration(format!("invalid table endpoint {}: {}", endpoint, e))
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(FeedscopeError::Configuration(format!(
                "invalid table endpoint {}",
                endpoint
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            endpoint,
            credentials,
            client,
        })
    }

    fn resource_url(&self, resource: &str) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| FeedscopeError::Configuration(format!("invalid table endpoint {}", self.endpoint)))?
            .pop_if_empty()
            .push(resource);
        Ok(url)
    }

    fn entity_url(&self, table: &str, partition: &str, row_key: &str) -> Result<Url> {
        self.resource_url(&format!(
            "{}(PartitionKey='{}',RowKey='{}')",
            table,
            quote_key(partition),
            quote_key(row_key)
        ))
    }

    /// SharedKeyLite signature over the date and canonicalized resource.
    fn sign(account: &str, key: &[u8], date: &str, path: &str) -> Result<String> {
        let string_to_sign = format!("{}\n/{}{}", date, account, path);
        let mut mac = Hmac::<Sha256>::new_from_slice(key)
            .map_err(|e| FeedscopeError::Configuration(format!("invalid account key: {}", e)))?;
        mac.update(string_to_sign.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    fn request(&self, method: Method, mut url: Url) -> Result<reqwest::RequestBuilder> {
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();

        let authorization = match &self.credentials {
            Credentials::SharedKey { account, key } => {
                let signature = Self::sign(account, key, &date, url.path())?;
                Some(format!("SharedKeyLite {}:{}", account, signature))
            }
            Credentials::Sas(pairs) => {
                url.query_pairs_mut().extend_pairs(pairs.iter());
                None
            }
        };

        let mut builder = self
            .client
            .request(method, url)
            .header("x-ms-date", date)
            .header("x-ms-version", API_VERSION)
            .header("Accept", ACCEPT_JSON)
            .header("DataServiceVersion", DATA_SERVICE_VERSION)
            .header("MaxDataServiceVersion", DATA_SERVICE_VERSION);
        if let Some(authorization) = authorization {
            builder = builder.header("Authorization", authorization);
        }
        Ok(builder)
    }
}

fn decode_key(key: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(key)
        .map_err(|e| FeedscopeError::Configuration(format!("AccountKey is not base64: {}", e)))
}

fn quote_key(key: &str) -> String {
    key.replace('\'', "''")
}

async fn service_error(context: &str, response: reqwest::Response) -> FeedscopeError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    FeedscopeError::Storage(format!("{} failed with {}: {}", context, status, body))
}

fn entity_to_json(record: &TableRecord) -> Value {
    let mut object = Map::new();
    object.insert("PartitionKey".to_string(), Value::String(record.partition_key.clone()));
    object.insert("RowKey".to_string(), Value::String(record.row_key.clone()));

    for (name, value) in &record.fields {
        let (json, edm_type) = match value {
            FieldValue::Bool(b) => (Value::Bool(*b), None),
            FieldValue::Int(n) => (Value::String(n.to_string()), Some("Edm.Int64")),
            FieldValue::Double(d) => (serde_json::json!(d), None),
            FieldValue::Text(s) => (Value::String(s.clone()), None),
            FieldValue::Binary(bytes) => (Value::String(STANDARD.encode(bytes)), Some("Edm.Binary")),
        };
        if let Some(edm_type) = edm_type {
            object.insert(format!("{}@odata.type", name), Value::String(edm_type.to_string()));
        }
        object.insert(name.clone(), json);
    }

    Value::Object(object)
}

fn entity_from_json(object: &Map<String, Value>) -> Option<TableRecord> {
    let partition_key = object.get("PartitionKey")?.as_str()?.to_string();
    let row_key = object.get("RowKey")?.as_str()?.to_string();

    let mut fields = BTreeMap::new();
    for (name, value) in object {
        if name.starts_with("odata.")
            || name.contains('@')
            || matches!(name.as_str(), "PartitionKey" | "RowKey" | "Timestamp")
        {
            continue;
        }

        let edm_type = object
            .get(&format!("{}@odata.type", name))
            .and_then(Value::as_str);

        let field = match (edm_type, value) {
            (Some("Edm.Int64"), Value::String(s)) => s.parse().ok().map(FieldValue::Int),
            (Some("Edm.Binary"), Value::String(s)) => STANDARD.decode(s).ok().map(FieldValue::Binary),
            (Some("Edm.Double"), Value::String(s)) => s.parse().ok().map(FieldValue::Double),
            (_, Value::Bool(b)) => Some(FieldValue::Bool(*b)),
            (_, Value::Number(n)) => n
                .as_i64()
                .map(FieldValue::Int)
                .or_else(|| n.as_f64().map(FieldValue::Double)),
            (_, Value::String(s)) => Some(FieldValue::Text(s.clone())),
            _ => None,
        };

        match field {
            Some(field) => {
                fields.insert(name.clone(), field);
            }
            None => warn!("Dropping unreadable property {} of {}/{}", name, partition_key, row_key),
        }
    }

    Some(TableRecord {
        partition_key,
        row_key,
        fields,
    })
}

fn combine_filter(partition: Option<&str>, filter: Option<&str>) -> Option<String> {
    match (partition, filter) {
        (Some(p), Some(f)) => Some(format!("PartitionKey eq '{}' and ({})", quote_key(p), f)),
        (Some(p), None) => Some(format!("PartitionKey eq '{}'", quote_key(p))),
        (None, Some(f)) => Some(f.to_string()),
        (None, None) => None,
    }
}

/// Multipart body of an entity group transaction.
fn batch_body(
    batch_boundary: &str,
    changeset_boundary: &str,
    operations: &[(Method, Url, Option<String>)],
) -> String {
    let mut body = String::new();
    body.push_str(&format!("--{}\r\n", batch_boundary));
    body.push_str(&format!(
        "Content-Type: multipart/mixed; boundary={}\r\n\r\n",
        changeset_boundary
    ));

    for (method, url, payload) in operations {
        body.push_str(&format!("--{}\r\n", changeset_boundary));
        body.push_str("Content-Type: application/http\r\n");
        body.push_str("Content-Transfer-Encoding: binary\r\n\r\n");
        body.push_str(&format!("{} {} HTTP/1.1\r\n", method, url));
        body.push_str(&format!("Accept: {}\r\n", ACCEPT_JSON));
        body.push_str(&format!("DataServiceVersion: {}\r\n", DATA_SERVICE_VERSION));
        match payload {
            Some(payload) => {
                body.push_str("Content-Type: application/json\r\n");
                body.push_str(&format!("Content-Length: {}\r\n\r\n", payload.len()));
                body.push_str(payload);
                body.push_str("\r\n");
            }
            None => body.push_str("If-Match: *\r\n\r\n"),
        }
    }

    body.push_str(&format!("--{}--\r\n", changeset_boundary));
    body.push_str(&format!("--{}--\r\n", batch_boundary));
    body
}

/// First failing sub-response of a batch reply, if any.
fn failed_sub_response(reply: &str) -> Option<String> {
    reply
        .lines()
        .filter_map(|line| line.trim().strip_prefix("HTTP/1.1 "))
        .find(|status| {
            status
                .split_whitespace()
                .next()
                .and_then(|code| code.parse::<u16>().ok())
                .is_some_and(|code| code >= 400)
        })
        .map(str::to_string)
}

#[async_trait::async_trait]
impl TableClient for AzureTableClient {
    async fn create_table_if_not_exists(&self, table: &str) -> Result<()> {
        let url = self.resource_url("Tables")?;
        let response = self
            .request(Method::POST, url)?
            .header("Content-Type", "application/json")
            .header("Prefer", "return-no-content")
            .body(serde_json::json!({ "TableName": table }).to_string())
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                debug!("Created table '{}'", table);
                Ok(())
            }
            StatusCode::CONFLICT => Ok(()),
            _ => Err(service_error(&format!("create table '{}'", table), response).await),
        }
    }

    async fn get_entity(
        &self,
        table: &str,
        partition: &str,
        row_key: &str,
    ) -> Result<Option<TableRecord>> {
        let url = self.entity_url(table, partition, row_key)?;
        let response = self.request(Method::GET, url)?.send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(service_error(&format!("get {}/{}", partition, row_key), response).await);
        }

        let body: Value = response.json().await?;
        match body.as_object().and_then(entity_from_json) {
            Some(record) => Ok(Some(record)),
            None => {
                warn!("Entity {}/{} in '{}' has no keys", partition, row_key, table);
                Ok(None)
            }
        }
    }

    async fn query_entities(
        &self,
        table: &str,
        partition: Option<&str>,
        filter: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<TableRecord>> {
        let filter = combine_filter(partition, filter);
        let mut records = Vec::new();
        let mut continuation: Option<(String, Option<String>)> = None;

        loop {
            let remaining = limit.map(|l| l.saturating_sub(records.len()));
            if remaining == Some(0) {
                break;
            }

            let mut url = self.resource_url(&format!("{}()", table))?;
            {
                let mut query = url.query_pairs_mut();
                if let Some(filter) = &filter {
                    query.append_pair("$filter", filter);
                }
                let page = remaining.map_or(QUERY_PAGE_SIZE, |r| r.min(QUERY_PAGE_SIZE));
                query.append_pair("$top", &page.to_string());
                if let Some((next_partition, next_row)) = &continuation {
                    query.append_pair("NextPartitionKey", next_partition);
                    if let Some(next_row) = next_row {
                        query.append_pair("NextRowKey", next_row);
                    }
                }
            }

            let response = self.request(Method::GET, url)?.send().await?;
            if !response.status().is_success() {
                return Err(service_error(&format!("query '{}'", table), response).await);
            }

            let header = |name: &str| {
                response
                    .headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            let next_partition = header(CONTINUATION_PARTITION);
            let next_row = header(CONTINUATION_ROW);

            let body: Value = response.json().await?;
            let page = body
                .get("value")
                .and_then(Value::as_array)
                .ok_or_else(|| FeedscopeError::Storage(format!("query '{}' returned no value array", table)))?;
            records.extend(page.iter().filter_map(Value::as_object).filter_map(entity_from_json));

            match next_partition {
                Some(next_partition) => continuation = Some((next_partition, next_row)),
                None => break,
            }
        }

        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn submit_transaction(
        &self,
        table: &str,
        partition: &str,
        operations: &[TableOperation],
    ) -> Result<()> {
        if operations.is_empty() {
            return Ok(());
        }

        let mut parts = Vec::with_capacity(operations.len());
        for operation in operations {
            match operation {
                TableOperation::Upsert(record) => parts.push((
                    Method::PUT,
                    self.entity_url(table, partition, &record.row_key)?,
                    Some(entity_to_json(record).to_string()),
                )),
                TableOperation::Delete { row_key } => parts.push((
                    Method::DELETE,
                    self.entity_url(table, partition, row_key)?,
                    None,
                )),
            }
        }

        let batch_boundary = format!("batch_{}", uuid::Uuid::new_v4());
        let changeset_boundary = format!("changeset_{}", uuid::Uuid::new_v4());
        let body = batch_body(&batch_boundary, &changeset_boundary, &parts);

        let url = self.resource_url("$batch")?;
        let response = self
            .request(Method::POST, url)?
            .header(
                "Content-Type",
                format!("multipart/mixed; boundary={}", batch_boundary),
            )
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(service_error(&format!("batch on '{}'", table), response).await);
        }

        let reply = response.text().await?;
        if let Some(status) = failed_sub_response(&reply) {
            return Err(FeedscopeError::Storage(format!(
                "batch on '{}' partition '{}' rejected: {}",
                table, partition, status
            )));
        }
        debug!(
            "Committed {} operations to '{}' partition '{}'",
            operations.len(),
            table,
            partition
        );
        Ok(())
    }
}
