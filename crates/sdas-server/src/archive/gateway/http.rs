//! JSON-over-HTTP client for the control-plane gateway
//!
//! One base URL fronts the catalog (`/catalog/...`), the job runner
//! (`/jobs/...`), the query engine (`/queries/...`) and the secret store
//! (`/secrets/...`). `404` maps to [`GatewayError::NotFound`] and `409` to
//! [`GatewayError::AlreadyExists`]; any other non-success status is
//! [`GatewayError::Rejected`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    CatalogConnection, CatalogDatabase, CatalogGateway, CatalogTable, ConnectionInput,
    DatabaseInput, GatewayError, GatewayResult, JobDefinition, JobRun, JobRunRequest, JobRunner,
    QueryContext, QueryEngine, QueryExecution, ResultPage, SecretStore,
};
use crate::config::GatewayConfig;

#[derive(Debug, Deserialize)]
struct JobRunStarted {
    job_run_id: String,
}

#[derive(Debug, Serialize)]
struct StartQuery<'a> {
    sql: &'a str,
    context: QueryContext,
}

#[derive(Debug, Deserialize)]
struct QueryStarted {
    execution_id: String,
}

#[derive(Debug, Deserialize)]
struct TablePage {
    tables: Vec<CatalogTable>,
    #[serde(default)]
    next_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateSecret<'a> {
    name: &'a str,
    value: &'a str,
}

#[derive(Debug, Deserialize)]
struct SecretCreated {
    reference: String,
}

#[derive(Debug, Deserialize)]
struct SecretValue {
    value: String,
}

#[derive(Clone)]
pub struct HttpGateway {
    client: Client,
    base: Url,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> GatewayResult<Self> {
        let base = Url::parse(&config.url).map_err(|e| {
            GatewayError::Transport(format!("invalid gateway URL {}: {e}", config.url))
        })?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, base })
    }

    fn url(&self, segments: &[&str]) -> GatewayResult<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                GatewayError::Transport(format!("gateway URL {} cannot take a path", self.base))
            })?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str], what: &str) -> GatewayResult<T> {
        let url = self.url(segments)?;
        debug!(%url, "GET");
        let response = self.client.get(url).send().await?;
        decode(response, what).await
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        segments: &[&str],
        body: &B,
    ) -> GatewayResult<Response> {
        let url = self.url(segments)?;
        debug!(%url, "POST");
        Ok(self.client.post(url).json(body).send().await?)
    }
}

async fn check(response: Response, what: &str) -> GatewayResult<Response> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(GatewayError::NotFound(what.to_string())),
        StatusCode::CONFLICT => Err(GatewayError::AlreadyExists(what.to_string())),
        status => {
            let body = response.text().await.unwrap_or_default();
            Err(GatewayError::Rejected(format!("{what}: {status} {body}")))
        },
    }
}

async fn decode<T: DeserializeOwned>(response: Response, what: &str) -> GatewayResult<T> {
    let response = check(response, what).await?;
    response
        .json::<T>()
        .await
        .map_err(|e| GatewayError::Transport(format!("invalid response for {what}: {e}")))
}

#[async_trait]
impl CatalogGateway for HttpGateway {
    async fn get_connection(&self, name: &str) -> GatewayResult<CatalogConnection> {
        self.get(&["catalog", "connections", name], name).await
    }

    async fn create_connection(&self, input: ConnectionInput) -> GatewayResult<()> {
        let response = self.post(&["catalog", "connections"], &input).await?;
        check(response, &input.name).await.map(|_| ())
    }

    async fn get_database(&self, name: &str) -> GatewayResult<CatalogDatabase> {
        self.get(&["catalog", "databases", name], name).await
    }

    async fn create_database(&self, input: DatabaseInput) -> GatewayResult<()> {
        let response = self.post(&["catalog", "databases"], &input).await?;
        check(response, &input.name).await.map(|_| ())
    }

    async fn get_table(&self, database: &str, name: &str) -> GatewayResult<CatalogTable> {
        self.get(&["catalog", "databases", database, "tables", name], name)
            .await
    }

    async fn create_table(&self, database: &str, table: CatalogTable) -> GatewayResult<()> {
        let response = self
            .post(&["catalog", "databases", database, "tables"], &table)
            .await?;
        check(response, &table.name).await.map(|_| ())
    }

    async fn list_tables(&self, database: &str) -> GatewayResult<Vec<CatalogTable>> {
        let mut tables = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let mut url = self.url(&["catalog", "databases", database, "tables"])?;
            if let Some(token) = &next_token {
                url.query_pairs_mut().append_pair("next_token", token);
            }
            let response = self.client.get(url).send().await?;
            let page: TablePage = decode(response, database).await?;
            tables.extend(page.tables);

            match page.next_token {
                Some(token) if !token.is_empty() => next_token = Some(token),
                _ => break,
            }
        }

        Ok(tables)
    }

    async fn delete_table(&self, database: &str, name: &str) -> GatewayResult<()> {
        let url = self.url(&["catalog", "databases", database, "tables", name])?;
        let response = self.client.delete(url).send().await?;
        check(response, name).await.map(|_| ())
    }
}

#[async_trait]
impl JobRunner for HttpGateway {
    async fn get_job(&self, name: &str) -> GatewayResult<JobDefinition> {
        self.get(&["jobs", name], name).await
    }

    async fn create_job(&self, definition: JobDefinition) -> GatewayResult<()> {
        let response = self.post(&["jobs"], &definition).await?;
        check(response, &definition.name).await.map(|_| ())
    }

    async fn start_job_run(&self, request: JobRunRequest) -> GatewayResult<String> {
        let response = self
            .post(&["jobs", &request.job_name, "runs"], &request)
            .await?;
        let started: JobRunStarted = decode(response, &request.job_name).await?;
        Ok(started.job_run_id)
    }

    async fn get_job_run(&self, job_name: &str, job_run_id: &str) -> GatewayResult<JobRun> {
        self.get(&["jobs", job_name, "runs", job_run_id], job_run_id)
            .await
    }
}

#[async_trait]
impl QueryEngine for HttpGateway {
    async fn start_query(&self, sql: &str, context: QueryContext) -> GatewayResult<String> {
        let response = self.post(&["queries"], &StartQuery { sql, context }).await?;
        let started: QueryStarted = decode(response, "query").await?;
        Ok(started.execution_id)
    }

    async fn get_query_execution(&self, execution_id: &str) -> GatewayResult<QueryExecution> {
        self.get(&["queries", execution_id], execution_id).await
    }

    async fn get_query_results(
        &self,
        execution_id: &str,
        next_token: Option<&str>,
        max_results: usize,
    ) -> GatewayResult<ResultPage> {
        let mut url = self.url(&["queries", execution_id, "results"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("max_results", &max_results.to_string());
            if let Some(token) = next_token {
                query.append_pair("next_token", token);
            }
        }
        let response = self.client.get(url).send().await?;
        decode(response, execution_id).await
    }
}

#[async_trait]
impl SecretStore for HttpGateway {
    async fn create_secret(&self, name: &str, value: &str) -> GatewayResult<String> {
        let response = self.post(&["secrets"], &CreateSecret { name, value }).await?;
        let created: SecretCreated = decode(response, name).await?;
        Ok(created.reference)
    }

    async fn get_secret(&self, reference: &str) -> GatewayResult<String> {
        let secret: SecretValue = self.get(&["secrets", reference], reference).await?;
        Ok(secret.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::naming::JobCorrelation;
    use crate::archive::types::QueryState;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(server: &MockServer) -> HttpGateway {
        HttpGateway::new(&GatewayConfig {
            url: server.uri(),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_not_found_and_conflict_mapping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/catalog/connections/a-db-connection"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/catalog/databases"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let gateway = gateway(&server);
        assert!(matches!(
            gateway.get_connection("a-db-connection").await,
            Err(GatewayError::NotFound(_))
        ));
        assert!(matches!(
            gateway
                .create_database(DatabaseInput {
                    name: "a-db-database".to_string(),
                    description: String::new(),
                })
                .await,
            Err(GatewayError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_start_job_run_sends_correlation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jobs/a1-db-orders/runs"))
            .and(body_partial_json(json!({
                "correlation": {"archive_id": "a1", "database": "db", "table": "orders"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"job_run_id": "jr_42"})))
            .expect(1)
            .mount(&server)
            .await;

        let run_id = gateway(&server)
            .start_job_run(JobRunRequest {
                job_name: "a1-db-orders".to_string(),
                arguments: Default::default(),
                worker_type: "Standard".to_string(),
                worker_count: 2,
                timeout_minutes: 2880,
                correlation: JobCorrelation::new("a1", "db", "orders"),
            })
            .await
            .unwrap();
        assert_eq!(run_id, "jr_42");
    }

    #[tokio::test]
    async fn test_list_tables_follows_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/catalog/databases/a1-db-database/tables"))
            .and(query_param("next_token", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tables": [{
                    "name": "recent",
                    "kind": "VIRTUAL_VIEW",
                    "view_original_text": "SELECT 1"
                }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/catalog/databases/a1-db-database/tables"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tables": [{"name": "a1-db-orders-table", "kind": "EXTERNAL_TABLE"}],
                "next_token": "p2"
            })))
            .mount(&server)
            .await;

        let tables = gateway(&server).list_tables("a1-db-database").await.unwrap();
        assert_eq!(tables.len(), 2);
        assert!(tables[1].is_view());
    }

    #[tokio::test]
    async fn test_query_execution_and_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/queries/q-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "execution_id": "q-1",
                "state": "SUCCEEDED",
                "output_location": "s3://results/q-1.csv"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/queries/q-1/results"))
            .and(query_param("max_results", "51"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "rows": [{"data": ["_col0"]}, {"data": ["7"]}]
            })))
            .mount(&server)
            .await;

        let gateway = gateway(&server);
        let execution = gateway.get_query_execution("q-1").await.unwrap();
        assert_eq!(execution.state, QueryState::Succeeded);

        let page = gateway.get_query_results("q-1", None, 51).await.unwrap();
        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.rows[1].data, vec![Some("7".to_string())]);
        assert_eq!(page.next_token, None);
    }

    #[tokio::test]
    async fn test_server_error_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/queries"))
            .respond_with(ResponseTemplate::new(500).set_body_string("engine down"))
            .mount(&server)
            .await;

        let result = gateway(&server)
            .start_query("SELECT 1", QueryContext::default())
            .await;
        match result {
            Err(GatewayError::Rejected(message)) => assert!(message.contains("engine down")),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
