//! S3 access for query output downloads and archive data expiration

use anyhow::{anyhow, Context, Result};
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::Region,
    error::ProvideErrorMetadata,
    presigning::PresigningConfig,
    primitives::DateTime as S3DateTime,
    types::{
        BucketLifecycleConfiguration, ExpirationStatus, LifecycleExpiration, LifecycleRule,
        LifecycleRuleFilter,
    },
    Client,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, instrument};

pub mod config;

/// Expiry of presigned download links
pub const DOWNLOAD_URL_EXPIRY: Duration = Duration::from_secs(600);

/// S3 client; every operation names the bucket it acts on
#[derive(Clone)]
pub struct Storage {
    client: Client,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObjectMetadata {
    pub key: String,
    pub size: i64,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl Storage {
    pub async fn new(config: config::StorageConfig) -> Result<Self> {
        debug!("Initializing storage with config: {:?}", config);

        let mut s3_config_builder = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials =
                    Credentials::new(access_key, secret_key, None, None, "sdas-storage");
                aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(credentials)
                    .region(Region::new(config.region.clone()))
            },
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        };

        s3_config_builder = s3_config_builder.force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!(region = %config.region, endpoint = ?config.endpoint, "Storage client initialized");

        Ok(Self { client })
    }

    /// Presigned GET URL for an `s3://bucket/key` location
    #[instrument(skip(self))]
    pub async fn presigned_download(
        &self,
        location: &str,
        expires_in: Duration,
    ) -> Result<String> {
        let (bucket, key) = parse_s3_uri(location)?;

        let presigning_config = PresigningConfig::expires_in(expires_in)
            .context("Failed to create presigning config")?;

        let presigned_request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .presigned(presigning_config)
            .await
            .context("Failed to generate presigned URL")?;

        Ok(presigned_request.uri().to_string())
    }

    #[instrument(skip(self))]
    pub async fn get_metadata(&self, location: &str) -> Result<ObjectMetadata> {
        let (bucket, key) = parse_s3_uri(location)?;

        let response = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .context(format!("Failed to get metadata from S3: {}", location))?;

        Ok(ObjectMetadata {
            key: key.to_string(),
            size: response.content_length().unwrap_or(0),
            content_type: response.content_type().map(|s| s.to_string()),
            last_modified: response
                .last_modified()
                .and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())),
        })
    }

    /// Install or update the expiration rule `rule_id` on `bucket`
    ///
    /// Other rules on the bucket are preserved. Without a date the rule keeps
    /// its current expiration; disabling a rule that never existed is a no-op.
    #[instrument(skip(self))]
    pub async fn put_expiration_rule(
        &self,
        bucket: &str,
        rule_id: &str,
        prefix: &str,
        date: Option<NaiveDate>,
        enabled: bool,
    ) -> Result<()> {
        let mut rules = self.lifecycle_rules(bucket).await?;
        let existing = rules
            .iter()
            .position(|r| r.id() == Some(rule_id))
            .map(|i| rules.remove(i));

        let expiration = match date {
            Some(date) => Some(
                LifecycleExpiration::builder()
                    .date(S3DateTime::from_secs(
                        date.and_time(NaiveTime::MIN).and_utc().timestamp(),
                    ))
                    .build(),
            ),
            None => existing.as_ref().and_then(|r| r.expiration().cloned()),
        };

        let Some(expiration) = expiration else {
            if enabled {
                return Err(anyhow!("An expiration date is required to enable rule {rule_id}"));
            }
            debug!(rule_id, "No expiration rule to disable");
            return Ok(());
        };

        let status = if enabled {
            ExpirationStatus::Enabled
        } else {
            ExpirationStatus::Disabled
        };
        let rule = LifecycleRule::builder()
            .id(rule_id)
            .filter(LifecycleRuleFilter::builder().prefix(prefix).build())
            .expiration(expiration)
            .status(status)
            .build()
            .context("Failed to build lifecycle rule")?;
        rules.push(rule);

        let configuration = BucketLifecycleConfiguration::builder()
            .set_rules(Some(rules))
            .build()
            .context("Failed to build lifecycle configuration")?;

        self.client
            .put_bucket_lifecycle_configuration()
            .bucket(bucket)
            .lifecycle_configuration(configuration)
            .send()
            .await
            .context(format!("Failed to update lifecycle of s3://{bucket}"))?;

        info!(rule_id, prefix, enabled, "Lifecycle rule updated on s3://{}", bucket);
        Ok(())
    }

    async fn lifecycle_rules(&self, bucket: &str) -> Result<Vec<LifecycleRule>> {
        match self
            .client
            .get_bucket_lifecycle_configuration()
            .bucket(bucket)
            .send()
            .await
        {
            Ok(output) => Ok(output.rules().to_vec()),
            Err(e) if e.code() == Some("NoSuchLifecycleConfiguration") => Ok(Vec::new()),
            Err(e) => Err(anyhow!("Failed to read lifecycle of s3://{bucket}: {e}")),
        }
    }
}

/// Split `s3://bucket/key` into bucket and key
pub fn parse_s3_uri(location: &str) -> Result<(&str, &str)> {
    let rest = location
        .strip_prefix("s3://")
        .ok_or_else(|| anyhow!("Not an s3:// location: {location}"))?;
    match rest.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok((bucket, key)),
        _ => Err(anyhow!("S3 location has no object key: {location}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const NO_LIFECYCLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Error>
  <Code>NoSuchLifecycleConfiguration</Code>
  <Message>The lifecycle configuration does not exist</Message>
</Error>"#;

    #[test]
    fn test_parse_s3_uri() {
        let (bucket, key) = parse_s3_uri("s3://results/sdas/q-1.csv").unwrap();
        assert_eq!(bucket, "results");
        assert_eq!(key, "sdas/q-1.csv");
    }

    #[test]
    fn test_parse_s3_uri_rejects_malformed() {
        assert!(parse_s3_uri("https://results/q-1.csv").is_err());
        assert!(parse_s3_uri("s3://results").is_err());
        assert!(parse_s3_uri("s3://results/").is_err());
        assert!(parse_s3_uri("s3:///key").is_err());
    }

    #[tokio::test]
    async fn test_presign_with_static_credentials() {
        let storage = Storage::new(config::StorageConfig::for_minio("http://localhost:9000"))
            .await
            .unwrap();

        let url = storage
            .presigned_download("s3://results/out/q-1.csv", DOWNLOAD_URL_EXPIRY)
            .await
            .unwrap();
        assert!(url.starts_with("http://localhost:9000/results/out/q-1.csv?"));
        assert!(url.contains("X-Amz-Expires=600"));
    }

    #[tokio::test]
    async fn test_expiration_rule_lands_on_named_bucket() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/archive-data"))
            .and(query_param("lifecycle", ""))
            .respond_with(
                ResponseTemplate::new(404)
                    .insert_header("content-type", "application/xml")
                    .set_body_string(NO_LIFECYCLE),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/archive-data"))
            .and(query_param("lifecycle", ""))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let storage = Storage::new(config::StorageConfig::for_minio(server.uri()))
            .await
            .unwrap();
        storage
            .put_expiration_rule(
                "archive-data",
                "a-1",
                "a-1/",
                NaiveDate::from_ymd_opt(2031, 1, 31),
                true,
            )
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        assert!(requests.iter().all(|r| r.url.path() == "/archive-data"));
        let body = String::from_utf8_lossy(&requests[1].body);
        assert!(body.contains("<ID>a-1</ID>"));
        assert!(body.contains("<Prefix>a-1/</Prefix>"));
    }

    #[tokio::test]
    async fn test_enabling_rule_without_date_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(404)
                    .insert_header("content-type", "application/xml")
                    .set_body_string(NO_LIFECYCLE),
            )
            .mount(&server)
            .await;

        let storage = Storage::new(config::StorageConfig::for_minio(server.uri()))
            .await
            .unwrap();
        assert!(storage
            .put_expiration_rule("archive-data", "a-1", "a-1/", None, true)
            .await
            .is_err());
        // disabling a rule that was never installed writes nothing
        storage
            .put_expiration_rule("archive-data", "a-1", "a-1/", None, false)
            .await
            .unwrap();
        let requests = server.received_requests().await.unwrap();
        assert!(requests.iter().all(|r| r.method.as_str() == "GET"));
    }
}
