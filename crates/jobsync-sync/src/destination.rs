use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use jobsync_core::{NormalizedRecord, PublishOutcome};
use reqwest::StatusCode;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};

/// Authenticated write client for the content system postings end up in.
#[async_trait]
pub trait DestinationPublisher: Send + Sync {
    async fn authenticate(&self) -> bool;

    async fn publish(&self, record: &NormalizedRecord) -> PublishOutcome;
}

#[derive(Debug, Error)]
pub enum PublisherError {
    #[error("{0} is not configured")]
    MissingSetting(&'static str),
    #[error("building destination client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordPressConfig {
    pub site_url: Option<String>,
    pub username: String,
    pub app_password: String,
    pub post_type_route: String,
    pub listing_ttl_days: u64,
}

/// WP Job Manager listings via the WordPress REST API.
#[derive(Debug, Clone)]
pub struct WordPressPublisher {
    client: reqwest::Client,
    endpoint: String,
    users_me: String,
    username: String,
    app_password: String,
    listing_ttl_days: u64,
}

const DUPLICATE_CODES: [&str; 3] = ["term_exists", "duplicate_post", "rest_post_exists"];

impl WordPressPublisher {
    pub fn new(config: &WordPressConfig, timeout: Duration, user_agent: &str) -> Result<Self, PublisherError> {
        let site = config
            .site_url
            .as_deref()
            .map(|s| s.trim().trim_end_matches('/'))
            .filter(|s| !s.is_empty())
            .ok_or(PublisherError::MissingSetting("WP_SITE_URL"))?;
        if config.username.is_empty() {
            return Err(PublisherError::MissingSetting("WP_USERNAME"));
        }
        if config.app_password.is_empty() {
            return Err(PublisherError::MissingSetting("WP_APP_PASSWORD"));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent.to_string())
            .build()?;
        let route = config.post_type_route.trim_matches('/');

        Ok(Self {
            client,
            endpoint: format!("{site}/wp-json/wp/v2/{route}"),
            users_me: format!("{site}/wp-json/wp/v2/users/me"),
            username: config.username.clone(),
            app_password: config.app_password.clone(),
            listing_ttl_days: config.listing_ttl_days,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl DestinationPublisher for WordPressPublisher {
    async fn authenticate(&self) -> bool {
        let response = self
            .client
            .get(&self.users_me)
            .basic_auth(&self.username, Some(&self.app_password))
            .send()
            .await;
        match response {
            Ok(resp) if resp.status().is_success() => {
                info!(endpoint = %self.users_me, "destination authentication ok");
                true
            }
            Ok(resp) => {
                warn!(status = resp.status().as_u16(), "destination rejected credentials");
                false
            }
            Err(err) => {
                warn!(error = %err, "destination authentication request failed");
                false
            }
        }
    }

    async fn publish(&self, record: &NormalizedRecord) -> PublishOutcome {
        let payload = build_payload(record, Utc::now().date_naive(), self.listing_ttl_days);
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.app_password))
            .json(&payload)
            .send()
            .await;

        match response {
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                classify_response(status, &body)
            }
            Err(err) => PublishOutcome::TransientError(format!("request failed: {err}")),
        }
    }
}

fn is_remote(record: &NormalizedRecord) -> bool {
    record.location.to_lowercase().contains("remote")
        || record.description.to_lowercase().contains("work from home")
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

pub fn build_payload(record: &NormalizedRecord, today: NaiveDate, listing_ttl_days: u64) -> JsonValue {
    let expires = today
        .checked_add_days(Days::new(listing_ttl_days))
        .unwrap_or(today)
        .format("%Y-%m-%d")
        .to_string();

    let mut meta = json!({
        "_company_name": record.company,
        "_job_location": record.location,
        "_job_expires": expires,
        "_filled": "0",
        "_featured": "0",
        "_remote_position": flag(is_remote(record)),
        "_application_method": "external",
        "_job_applying_url": record.source_url,
    });
    if !record.salary.is_empty() {
        meta["_job_salary"] = JsonValue::String(record.salary.clone());
    }

    json!({
        "title": record.title,
        "content": record.description,
        "status": "publish",
        "meta": meta,
    })
}

pub fn classify_response(status: StatusCode, body: &str) -> PublishOutcome {
    if status.is_success() {
        return PublishOutcome::Success;
    }
    let code = serde_json::from_str::<JsonValue>(body)
        .ok()
        .and_then(|v| v.get("code").and_then(JsonValue::as_str).map(str::to_string))
        .unwrap_or_default();
    let detail = format!("http {}: {}", status.as_u16(), if code.is_empty() { "no error code" } else { code.as_str() });

    if status == StatusCode::CONFLICT || DUPLICATE_CODES.contains(&code.as_str()) {
        PublishOutcome::AlreadyExists
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        PublishOutcome::AuthRejected
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        PublishOutcome::TransientError(detail)
    } else {
        PublishOutcome::PermanentError(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> NormalizedRecord {
        NormalizedRecord {
            title: "Site Engineer".into(),
            company: "Thames Build".into(),
            location: "London (Remote friendly)".into(),
            description: "Oversee works.".into(),
            salary: String::new(),
            job_type: String::new(),
            requirements: String::new(),
            benefits: String::new(),
            source_url: "https://www.jobservicehub.com/jobs/site-engineer-london".into(),
            source_name: "jobservicehub".into(),
        }
    }

    #[test]
    fn payload_carries_job_manager_meta() {
        let today = NaiveDate::from_ymd_opt(2026, 1, 20).unwrap();
        let payload = build_payload(&record(), today, 30);
        assert_eq!(payload["title"], "Site Engineer");
        assert_eq!(payload["status"], "publish");
        assert_eq!(payload["meta"]["_company_name"], "Thames Build");
        assert_eq!(payload["meta"]["_job_expires"], "2026-02-19");
        assert_eq!(payload["meta"]["_remote_position"], "1");
        assert_eq!(payload["meta"]["_application_method"], "external");
        assert_eq!(
            payload["meta"]["_job_applying_url"],
            "https://www.jobservicehub.com/jobs/site-engineer-london"
        );
        assert!(payload["meta"].get("_job_salary").is_none());

        let mut paid = record();
        paid.salary = "£45,000".into();
        paid.location = "London".into();
        let payload = build_payload(&paid, today, 30);
        assert_eq!(payload["meta"]["_job_salary"], "£45,000");
        assert_eq!(payload["meta"]["_remote_position"], "0");
    }

    #[test]
    fn response_classification() {
        assert_eq!(classify_response(StatusCode::CREATED, "{}"), PublishOutcome::Success);
        assert_eq!(classify_response(StatusCode::CONFLICT, ""), PublishOutcome::AlreadyExists);
        assert_eq!(
            classify_response(StatusCode::BAD_REQUEST, r#"{"code":"term_exists"}"#),
            PublishOutcome::AlreadyExists
        );
        assert_eq!(classify_response(StatusCode::UNAUTHORIZED, ""), PublishOutcome::AuthRejected);
        assert_eq!(classify_response(StatusCode::FORBIDDEN, ""), PublishOutcome::AuthRejected);
        assert!(matches!(
            classify_response(StatusCode::SERVICE_UNAVAILABLE, ""),
            PublishOutcome::TransientError(_)
        ));
        assert!(matches!(
            classify_response(StatusCode::TOO_MANY_REQUESTS, ""),
            PublishOutcome::TransientError(_)
        ));
        assert_eq!(
            classify_response(StatusCode::BAD_REQUEST, r#"{"code":"rest_invalid_param"}"#),
            PublishOutcome::PermanentError("http 400: rest_invalid_param".into())
        );
    }

    #[test]
    fn missing_site_url_is_a_config_error() {
        let config = WordPressConfig {
            site_url: None,
            username: "bot".into(),
            app_password: "xxxx".into(),
            post_type_route: "job-listings".into(),
            listing_ttl_days: 30,
        };
        let err = WordPressPublisher::new(&config, Duration::from_secs(5), "jobsync-test").unwrap_err();
        assert!(matches!(err, PublisherError::MissingSetting("WP_SITE_URL")));

        let ok = WordPressPublisher::new(
            &WordPressConfig {
                site_url: Some("https://jobs.example.org/".into()),
                ..config
            },
            Duration::from_secs(5),
            "jobsync-test",
        )
        .unwrap();
        assert_eq!(ok.endpoint(), "https://jobs.example.org/wp-json/wp/v2/job-listings");
    }
}
