#![allow(dead_code)]

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{HeaderMap, Method, Request, StatusCode, header},
};
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{EncodingKey, Header, encode};
use rowgate::{
    AppConfig, AppState, MemoryOptions, MemoryRepository, PolicySet, auth::Claims, create_router,
    policy::Resource, repository::Row, retry::RetryPolicy,
};
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use tower::ServiceExt;
use uuid::Uuid;

/// An in-process app over the policy-enforcing memory store.
pub struct TestApp {
    pub router: Router,
    pub repo: MemoryRepository,
    pub config: AppConfig,
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

pub fn test_config() -> AppConfig {
    AppConfig {
        retry: RetryPolicy {
            max_retries: 1,
            base_backoff: Duration::from_millis(1),
        },
        acquire_timeout: Duration::from_millis(200),
        ..AppConfig::default()
    }
}

pub fn spawn_app() -> TestApp {
    spawn_app_with(test_config())
}

pub fn spawn_app_with(config: AppConfig) -> TestApp {
    let repo = MemoryRepository::new(
        Arc::new(PolicySet::portal().unwrap()),
        MemoryOptions {
            max_connections: config.max_connections as usize,
            acquire_timeout: config.acquire_timeout,
        },
    );
    let state = AppState::new(Arc::new(repo.clone()), config.clone());
    TestApp {
        router: create_router(state),
        repo,
        config,
    }
}

pub fn token_with(config: &AppConfig, claims: &Claims) -> String {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(config.storage_key.as_bytes()),
    )
    .unwrap()
}

pub fn token_for(config: &AppConfig, subject: Uuid) -> String {
    token_with(
        config,
        &Claims {
            sub: Some(subject),
            role: Some("authenticated".to_string()),
            exp: (Utc::now() + ChronoDuration::hours(1)).timestamp() as usize,
            iat: Some(Utc::now().timestamp() as usize),
        },
    )
}

impl TestApp {
    pub fn token(&self, subject: Uuid) -> String {
        token_for(&self.config, subject)
    }

    pub async fn call(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> Reply {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> Reply {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).into_owned())
            })
        };
        Reply {
            status,
            headers,
            body,
        }
    }

    pub fn seed_project(&self, owner: Uuid, is_public: bool, title: &str) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.repo.seed(
            Resource::Projects,
            row(json!({
                "id": id,
                "owner_id": owner,
                "title": title,
                "summary": null,
                "is_public": is_public,
                "created_at": now,
                "updated_at": now,
            })),
        );
        id
    }

    pub fn seed_comment(&self, project: Uuid, author: Uuid, body: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.repo.seed(
            Resource::Comments,
            row(json!({
                "id": id,
                "project_id": project,
                "author_id": author,
                "body": body,
                "created_at": Utc::now(),
            })),
        );
        id
    }

    pub fn stored(&self, resource: Resource, id: Uuid) -> Option<Row> {
        self.repo
            .rows(resource)
            .into_iter()
            .find(|r| r.get("id") == Some(&Value::String(id.to_string())))
    }
}

pub fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}
