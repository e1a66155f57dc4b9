//! Flag store backed by the Couchbase Query Service.
//!
//! Every operation is a N1QL statement posted to `{query_url}/query/service`
//! with named parameters passed as `$name` request fields.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, error, instrument};

use super::{FlagReader, FlagWriter, StoreError};
use crate::flags::{Record, FLAGS_SCOPE};
use crate::query::{build_update, fully_qualified_name, ConditionOp, Statement, Update, Where};

const READ_TIMEOUT: Duration = Duration::from_millis(3000);
const WRITE_TIMEOUT: Duration = Duration::from_millis(5000);

// DML errors reported for an INSERT on an existing key
const DUPLICATE_KEY_CODES: [i64; 2] = [12009, 17012];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CouchbaseConfig {
    /// Base URL of the query service, e.g. `http://127.0.0.1:8093`.
    pub query_url: String,
    pub bucket: String,
    pub username: String,
    pub password: String,
}

pub struct CouchbaseStore {
    client: reqwest::Client,
    endpoint: String,
    fqn: String,
    username: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    errors: Vec<QueryServiceError>,
    #[serde(default)]
    metrics: Option<QueryMetrics>,
}

#[derive(Debug, Deserialize)]
struct QueryServiceError {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryMetrics {
    #[serde(default)]
    mutation_count: u64,
}

impl CouchbaseStore {
    pub fn new(config: CouchbaseConfig) -> Result<Self, StoreError> {
        let mut missing = Vec::new();
        if config.query_url.trim().is_empty() {
            missing.push("query url");
        }
        if config.bucket.trim().is_empty() {
            missing.push("bucket");
        }
        if !missing.is_empty() {
            return Err(StoreError::MissingDependencies(missing));
        }

        // leave room for the server-side timeout to fire first
        let client = reqwest::Client::builder()
            .timeout(WRITE_TIMEOUT + Duration::from_secs(1))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/query/service", config.query_url.trim_end_matches('/')),
            fqn: fully_qualified_name(&config.bucket, FLAGS_SCOPE),
            username: config.username,
            password: config.password,
        })
    }

    /// Keyspace this store reads and writes.
    pub fn fqn(&self) -> &str {
        &self.fqn
    }

    async fn execute(&self, stmt: &Statement, timeout: Duration) -> Result<QueryResponse, StoreError> {
        let mut body = Map::new();
        body.insert("statement".to_string(), json!(stmt.text));
        body.insert("timeout".to_string(), json!(format!("{}ms", timeout.as_millis())));
        body.insert("scan_consistency".to_string(), json!("request_plus"));
        for (name, value) in &stmt.params {
            body.insert(format!("${}", name), value.clone());
        }
        debug!(
            statement = %stmt.text,
            params = ?stmt.params.keys().collect::<Vec<_>>(),
            "executing query"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await?;

        // the query service reports failures in the body, whatever the status
        let status = response.status();
        let parsed: QueryResponse = response.json().await?;
        if let Some(first) = parsed.errors.first() {
            return Err(StoreError::Backend {
                code: first.code,
                message: first.msg.clone(),
            });
        }
        if !status.is_success() || (!parsed.status.is_empty() && parsed.status != "success") {
            return Err(StoreError::Backend {
                code: i64::from(status.as_u16()),
                message: format!("query status {:?}", parsed.status),
            });
        }

        Ok(parsed)
    }

    fn keyed(&self, text: String, id: &str) -> Statement {
        let mut params = Map::new();
        params.insert("id".to_string(), json!(id));
        Statement { text, params }
    }
}

#[async_trait]
impl FlagReader for CouchbaseStore {
    #[instrument(skip(self))]
    async fn get(&self, id: &str) -> Result<Record, StoreError> {
        let stmt = self.keyed(format!("SELECT f.* FROM {} AS f USE KEYS $id", self.fqn), id);
        let response = self.execute(&stmt, READ_TIMEOUT).await.map_err(|e| {
            error!(error = %e, "unable to get record");
            e
        })?;

        let doc = response
            .results
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(serde_json::from_value(doc)?)
    }
}

#[async_trait]
impl FlagWriter for CouchbaseStore {
    #[instrument(skip(self, record), fields(id = %record.id))]
    async fn create(&self, record: &Record) -> Result<(), StoreError> {
        let mut stmt = self.keyed(
            format!("INSERT INTO {} (KEY, VALUE) VALUES ($id, $record)", self.fqn),
            &record.id,
        );
        stmt.params
            .insert("record".to_string(), serde_json::to_value(record)?);

        match self.execute(&stmt, WRITE_TIMEOUT).await {
            Ok(_) => Ok(()),
            Err(StoreError::Backend { code, .. }) if DUPLICATE_KEY_CODES.contains(&code) => {
                Err(StoreError::AlreadyExists(record.id.clone()))
            }
            Err(e) => {
                error!(error = %e, "unable to create record");
                Err(e)
            }
        }
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        // USE KEYS on a missing key mutates nothing and succeeds
        let stmt = self.keyed(format!("DELETE FROM {} USE KEYS $id", self.fqn), id);
        self.execute(&stmt, WRITE_TIMEOUT).await.map_err(|e| {
            error!(error = %e, "unable to delete record");
            e
        })?;
        Ok(())
    }

    #[instrument(skip(self, updates))]
    async fn update_fields(&self, id: &str, updates: &[Update]) -> Result<(), StoreError> {
        let stmt = build_update(
            &self.fqn,
            updates,
            Some(&[Where::new("id", ConditionOp::Eq, id)]),
            Some(1),
        )?;

        let response = self.execute(&stmt, WRITE_TIMEOUT).await.map_err(|e| {
            error!(error = %e, "unable to update record");
            e
        })?;

        match response.metrics {
            Some(metrics) if metrics.mutation_count == 0 => Err(StoreError::NotFound(id.to_string())),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(server: &MockServer) -> CouchbaseStore {
        CouchbaseStore::new(CouchbaseConfig {
            query_url: server.uri(),
            bucket: "local".to_string(),
            username: "Administrator".to_string(),
            password: "password".to_string(),
        })
        .unwrap()
    }

    fn record() -> Record {
        Record {
            id: "flag-1".to_string(),
            name: "ff".to_string(),
            default_value: false,
            rule_blocks: None,
        }
    }

    #[test]
    fn test_missing_dependencies() {
        let err = CouchbaseStore::new(CouchbaseConfig::default()).err().unwrap();
        match err {
            StoreError::MissingDependencies(missing) => assert_eq!(missing, vec!["query url", "bucket"]),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_get_record() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/query/service"))
            .and(header_exists("authorization"))
            .and(body_partial_json(json!({
                "statement": "SELECT f.* FROM `local`.`users`.`flags` AS f USE KEYS $id",
                "$id": "flag-1",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "results": [{"id": "flag-1", "name": "ff", "defaultValue": false}],
            })))
            .mount(&server)
            .await;

        assert_eq!(store(&server).get("flag-1").await.unwrap(), record());
    }

    #[tokio::test]
    async fn test_get_missing_record() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/query/service"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "results": [],
            })))
            .mount(&server)
            .await;

        assert!(matches!(
            store(&server).get("flag-1").await,
            Err(StoreError::NotFound(id)) if id == "flag-1"
        ));
    }

    #[tokio::test]
    async fn test_create_duplicate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/query/service"))
            .and(body_partial_json(json!({
                "$id": "flag-1",
                "$record": {"id": "flag-1", "name": "ff", "defaultValue": false},
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "errors",
                "errors": [{"code": 12009, "msg": "DML Error, possible causes include concurrent modification. Failed to perform INSERT - cause: Duplicate Key flag-1"}],
            })))
            .mount(&server)
            .await;

        assert!(matches!(
            store(&server).create(&record()).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_update_fields_statement() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/query/service"))
            .and(body_partial_json(json!({
                "statement": "UPDATE `local`.`users`.`flags` SET `defaultValue` = $qs__defaultValue WHERE `id` = $qw__id LIMIT 1",
                "$qs__defaultValue": true,
                "$qw__id": "flag-1",
                "scan_consistency": "request_plus",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "results": [],
                "metrics": {"mutationCount": 1},
            })))
            .expect(1)
            .mount(&server)
            .await;

        store(&server)
            .update_fields("flag-1", &[Update::new("defaultValue", true)])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_update_fields_without_match() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/query/service"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "results": [],
                "metrics": {"mutationCount": 0},
            })))
            .mount(&server)
            .await;

        assert!(matches!(
            store(&server)
                .update_fields("flag-1", &[Update::new("defaultValue", true)])
                .await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_backend_failure_is_forwarded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/query/service"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "status": "fatal",
                "errors": [{"code": 5000, "msg": "internal error"}],
            })))
            .mount(&server)
            .await;

        assert!(matches!(
            store(&server).delete("flag-1").await,
            Err(StoreError::Backend { code: 5000, .. })
        ));
    }
}
