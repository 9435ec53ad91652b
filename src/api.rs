//! HTTP boundary to the Guildhall server.
//!
//! `RemoteApi` is the seam the coordinator programs against; `HttpApi` is the
//! production implementation. Rate-limited (429) and transient transport
//! failures retry with jittered backoff; timeouts surface as failures so the
//! coordinator can roll optimistic state back.

use crate::config::Config;
use crate::error::SyncError;
use crate::types::{Activity, Community, Identity, NewActivity, NewProject, Project};
use async_trait::async_trait;
use rand::{thread_rng, Rng};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn fetch_identity(&self) -> Result<Identity, SyncError>;
    async fn fetch_projects(&self) -> Result<Vec<Project>, SyncError>;
    async fn fetch_communities(&self) -> Result<Vec<Community>, SyncError>;
    async fn fetch_activity(&self) -> Result<Vec<Activity>, SyncError>;
    async fn create_project(&self, input: &NewProject) -> Result<Project, SyncError>;
    async fn join_community(&self, community_id: &str) -> Result<(), SyncError>;
    async fn leave_community(&self, community_id: &str) -> Result<(), SyncError>;
    async fn follow(&self, target_id: &str) -> Result<(), SyncError>;
    async fn unfollow(&self, target_id: &str) -> Result<(), SyncError>;
    async fn post_activity(&self, input: &NewActivity) -> Result<(), SyncError>;
}

pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
    retries: u32,
}

impl HttpApi {
    pub fn new(cfg: &Config) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.http_timeout_ms))
            .build()
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: cfg.api_url.trim_end_matches('/').to_string(),
            auth_token: cfg.auth_token.clone(),
            retries: cfg.http_retries,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut rb = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = &self.auth_token {
            rb = rb.bearer_auth(token);
        }
        rb
    }

    async fn send(&self, rb: RequestBuilder, label: &str) -> Result<Response, SyncError> {
        let response = send_with_backoff(rb, label, self.retries).await?;
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED => Err(SyncError::Unauthenticated),
            status => Err(SyncError::Rejected(format!("{label}: HTTP {status}"))),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, label: &str) -> Result<T, SyncError> {
        self.send(self.request(Method::GET, path), label)
            .await?
            .json()
            .await
            .map_err(|e| SyncError::Decode(e.to_string()))
    }

    async fn post_ack(&self, path: &str, label: &str) -> Result<(), SyncError> {
        self.send(self.request(Method::POST, path), label).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteApi for HttpApi {
    async fn fetch_identity(&self) -> Result<Identity, SyncError> {
        self.get_json("/api/me", "fetch_identity").await
    }

    async fn fetch_projects(&self) -> Result<Vec<Project>, SyncError> {
        self.get_json("/api/projects", "fetch_projects").await
    }

    async fn fetch_communities(&self) -> Result<Vec<Community>, SyncError> {
        self.get_json("/api/communities", "fetch_communities").await
    }

    async fn fetch_activity(&self) -> Result<Vec<Activity>, SyncError> {
        self.get_json("/api/activity", "fetch_activity").await
    }

    async fn create_project(&self, input: &NewProject) -> Result<Project, SyncError> {
        self.send(
            self.request(Method::POST, "/api/projects").json(input),
            "create_project",
        )
        .await?
        .json()
        .await
        .map_err(|e| SyncError::Decode(e.to_string()))
    }

    async fn join_community(&self, community_id: &str) -> Result<(), SyncError> {
        self.post_ack(
            &format!("/api/communities/{community_id}/join"),
            "join_community",
        )
        .await
    }

    async fn leave_community(&self, community_id: &str) -> Result<(), SyncError> {
        self.post_ack(
            &format!("/api/communities/{community_id}/leave"),
            "leave_community",
        )
        .await
    }

    async fn follow(&self, target_id: &str) -> Result<(), SyncError> {
        self.post_ack(&format!("/api/follow/{target_id}"), "follow")
            .await
    }

    async fn unfollow(&self, target_id: &str) -> Result<(), SyncError> {
        self.send(
            self.request(Method::DELETE, &format!("/api/follow/{target_id}")),
            "unfollow",
        )
        .await?;
        Ok(())
    }

    async fn post_activity(&self, input: &NewActivity) -> Result<(), SyncError> {
        self.send(
            self.request(Method::POST, "/api/activity").json(input),
            "post_activity",
        )
        .await?;
        Ok(())
    }
}

/// Rate-limit friendly send: retry 429s and transient transport errors with
/// jittered backoff, bounded by `max_retries`.
async fn send_with_backoff(
    rb: RequestBuilder,
    label: &str,
    max_retries: u32,
) -> Result<Response, reqwest::Error> {
    let mut attempt = 0u32;
    loop {
        let this = match rb.try_clone() {
            Some(clone) => clone,
            // Non-cloneable bodies get a single attempt.
            None => return rb.send().await,
        };
        match this.send().await {
            Ok(response) => {
                if response.status().as_u16() == 429 && attempt < max_retries {
                    attempt += 1;
                    let back_ms = backoff_delay_ms(attempt);
                    log::warn!("429 {label} retry={attempt} backoff={back_ms}ms");
                    tokio::time::sleep(Duration::from_millis(back_ms)).await;
                    continue;
                }
                return Ok(response);
            }
            Err(e) => {
                if attempt < max_retries && !e.is_timeout() {
                    attempt += 1;
                    let back_ms = backoff_delay_ms(attempt);
                    log::warn!("err {label} retry={attempt} backoff={back_ms}ms : {e}");
                    tokio::time::sleep(Duration::from_millis(back_ms)).await;
                    continue;
                }
                return Err(e);
            }
        }
    }
}

fn backoff_delay_ms(attempt: u32) -> u64 {
    let base = 300u64.saturating_mul(1u64 << (attempt.min(5) - 1)); // 300,600,1200,2400, capped at 4800
    let jitter: u64 = thread_rng().gen_range(0..=250);
    base + jitter
}
