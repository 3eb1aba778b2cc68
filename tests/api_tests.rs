mod common;

use axum::http::{Method, StatusCode, header};
use common::{TestApp, spawn_app};
use rowgate::{Identity, policy::Resource, repository::Repository};
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use uuid::Uuid;

fn ids(body: &Value) -> Vec<String> {
    body.as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_str().unwrap().to_string())
        .collect()
}

fn assert_not_found(reply: &common::Reply) {
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(reply.body["code"], "not_found");
    assert_eq!(reply.body["retryable"], false);
}

// --- Liveness & Headers ---

#[tokio::test]
async fn test_health_check() {
    let app = spawn_app();
    let reply = app.call(Method::GET, "/health", None, None).await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(app.repo.sessions_opened(), 0);
}

#[tokio::test]
async fn test_responses_are_never_cacheable() {
    let app = spawn_app();
    let reply = app.call(Method::GET, "/projects", None, None).await;

    assert_eq!(reply.headers[header::CACHE_CONTROL], "private, no-store");
    assert!(
        reply
            .headers
            .get_all(header::VARY)
            .iter()
            .any(|v| v == "Authorization, Cookie")
    );
    assert!(reply.headers.contains_key("x-request-id"));
}

// --- Reads ---

#[tokio::test]
async fn test_anonymous_sees_only_public_projects() {
    let app = spawn_app();
    let owner = Uuid::new_v4();
    let public = app.seed_project(owner, true, "public");
    let private = app.seed_project(owner, false, "private");

    let reply = app.call(Method::GET, "/projects", None, None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(ids(&reply.body), vec![public.to_string()]);

    let reply = app
        .call(Method::GET, &format!("/projects/{public}"), None, None)
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["title"], "public");

    let reply = app
        .call(Method::GET, &format!("/projects/{private}"), None, None)
        .await;
    assert_not_found(&reply);
}

#[tokio::test]
async fn test_owner_sees_own_private_projects() {
    let app = spawn_app();
    let owner = Uuid::new_v4();
    let private = app.seed_project(owner, false, "draft");
    let _foreign = app.seed_project(Uuid::new_v4(), false, "someone else's draft");
    let token = app.token(owner);

    let reply = app
        .call(Method::GET, "/projects", Some(&token), None)
        .await;
    assert_eq!(ids(&reply.body), vec![private.to_string()]);

    let reply = app
        .call(Method::GET, "/projects?mine=true", Some(&token), None)
        .await;
    assert_eq!(ids(&reply.body), vec![private.to_string()]);
}

#[tokio::test]
async fn test_mine_is_empty_for_anonymous() {
    let app = spawn_app();
    app.seed_project(Uuid::new_v4(), true, "public");

    let reply = app.call(Method::GET, "/projects?mine=true", None, None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, json!([]));
    assert_eq!(app.repo.sessions_opened(), 0);
}

#[tokio::test]
async fn test_limit_is_validated_and_applied() {
    let app = spawn_app();
    for n in 0..3 {
        app.seed_project(Uuid::new_v4(), true, &format!("p{n}"));
    }

    let reply = app.call(Method::GET, "/projects?limit=2", None, None).await;
    assert_eq!(reply.body.as_array().unwrap().len(), 2);

    for bad in ["limit=0", "limit=abc", "limit=500", "sort=title"] {
        let reply = app
            .call(Method::GET, &format!("/projects?{bad}"), None, None)
            .await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST, "{bad}");
        assert_eq!(reply.body["code"], "validation_failed");
    }
}

// --- Writes ---

#[tokio::test]
async fn test_anonymous_create_is_refused_without_writing() {
    let app = spawn_app();

    let reply = app
        .call(
            Method::POST,
            "/projects",
            None,
            Some(json!({ "title": "sneaky", "is_public": true })),
        )
        .await;

    assert_not_found(&reply);
    assert!(app.repo.rows(Resource::Projects).is_empty());
}

#[tokio::test]
async fn test_create_takes_owner_from_identity() {
    let app = spawn_app();
    let me = Uuid::new_v4();
    let token = app.token(me);

    let reply = app
        .call(
            Method::POST,
            "/projects",
            Some(&token),
            Some(json!({ "title": "Row-level security", "summary": "notes" })),
        )
        .await;

    assert_eq!(reply.status, StatusCode::CREATED);
    assert_eq!(reply.body["owner_id"], me.to_string());
    assert_eq!(reply.body["is_public"], false);

    let id: Uuid = reply.body["id"].as_str().unwrap().parse().unwrap();
    assert!(app.stored(Resource::Projects, id).is_some());
}

#[tokio::test]
async fn test_owner_cannot_be_supplied_by_client() {
    let app = spawn_app();
    let token = app.token(Uuid::new_v4());

    let reply = app
        .call(
            Method::POST,
            "/projects",
            Some(&token),
            Some(json!({ "title": "x", "owner_id": Uuid::new_v4() })),
        )
        .await;

    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.body["violations"][0]["field"], "owner_id");
    assert_eq!(reply.body["violations"][0]["code"], "unknown_field");
    assert_eq!(app.repo.sessions_opened(), 0);
}

#[tokio::test]
async fn test_missing_required_field_lists_violations() {
    let app = spawn_app();
    let token = app.token(Uuid::new_v4());

    let reply = app
        .call(
            Method::POST,
            "/projects",
            Some(&token),
            Some(json!({ "summary": "no title", "is_public": "yes" })),
        )
        .await;

    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.body["code"], "validation_failed");
    let violations = reply.body["violations"].as_array().unwrap();
    assert_eq!(violations.len(), 2);
    assert_eq!(violations[0]["field"], "title");
    assert_eq!(violations[0]["code"], "required");
    assert_eq!(violations[1]["field"], "is_public");

    // The gate stopped the request before the service layer ran.
    assert_eq!(app.repo.sessions_opened(), 0);
    assert!(app.repo.rows(Resource::Projects).is_empty());
}

#[tokio::test]
async fn test_malformed_inputs_are_validation_failures() {
    let app = spawn_app();
    let token = app.token(Uuid::new_v4());

    let reply = app
        .call(Method::GET, "/projects/not-a-uuid", None, None)
        .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.body["violations"][0]["field"], "id");

    let request = axum::http::Request::builder()
        .method(Method::POST)
        .uri("/projects")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(axum::body::Body::from("{ not json"))
        .unwrap();
    let reply = app.send(request).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.body["violations"][0]["code"], "malformed");

    assert_eq!(app.repo.sessions_opened(), 0);
}

#[tokio::test]
async fn test_patch_on_foreign_row_is_not_found_and_unchanged() {
    let app = spawn_app();
    let owner = Uuid::new_v4();
    let project = app.seed_project(owner, true, "original");
    let intruder = app.token(Uuid::new_v4());

    let reply = app
        .call(
            Method::PATCH,
            &format!("/projects/{project}"),
            Some(&intruder),
            Some(json!({ "title": "defaced" })),
        )
        .await;

    assert_not_found(&reply);
    let stored = app.stored(Resource::Projects, project).unwrap();
    assert_eq!(stored["title"], "original");
}

#[tokio::test]
async fn test_refusal_and_absence_look_identical() {
    let app = spawn_app();
    let project = app.seed_project(Uuid::new_v4(), false, "hidden");
    let token = app.token(Uuid::new_v4());

    let refused = app
        .call(Method::DELETE, &format!("/projects/{project}"), Some(&token), None)
        .await;
    let missing = app
        .call(
            Method::DELETE,
            &format!("/projects/{}", Uuid::new_v4()),
            Some(&token),
            None,
        )
        .await;

    assert_eq!(refused.status, missing.status);
    assert_eq!(refused.body, missing.body);
}

#[tokio::test]
async fn test_owner_updates_and_deletes() {
    let app = spawn_app();
    let owner = Uuid::new_v4();
    let project = app.seed_project(owner, false, "draft");
    let token = app.token(owner);

    let reply = app
        .call(
            Method::PATCH,
            &format!("/projects/{project}"),
            Some(&token),
            Some(json!({ "is_public": true })),
        )
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["is_public"], true);
    assert_eq!(reply.body["title"], "draft");

    let reply = app
        .call(
            Method::PATCH,
            &format!("/projects/{project}"),
            Some(&token),
            Some(json!({})),
        )
        .await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);

    let reply = app
        .call(Method::DELETE, &format!("/projects/{project}"), Some(&token), None)
        .await;
    assert_eq!(reply.status, StatusCode::NO_CONTENT);
    assert!(app.stored(Resource::Projects, project).is_none());
}

// --- Comments ---

#[tokio::test]
async fn test_comment_thread_follows_project_visibility() {
    let app = spawn_app();
    let owner = Uuid::new_v4();
    let public = app.seed_project(owner, true, "public");
    let private = app.seed_project(owner, false, "private");
    let shown = app.seed_comment(public, owner, "hello");
    app.seed_comment(private, owner, "secret");

    let reply = app
        .call(Method::GET, &format!("/projects/{public}/comments"), None, None)
        .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(ids(&reply.body), vec![shown.to_string()]);

    let reply = app
        .call(Method::GET, &format!("/projects/{private}/comments"), None, None)
        .await;
    assert_not_found(&reply);

    let token = app.token(owner);
    let reply = app
        .call(
            Method::GET,
            &format!("/projects/{private}/comments"),
            Some(&token),
            None,
        )
        .await;
    assert_eq!(reply.body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_comments_are_written_as_the_caller() {
    let app = spawn_app();
    let public = app.seed_project(Uuid::new_v4(), true, "public");
    let private = app.seed_project(Uuid::new_v4(), false, "private");
    let me = Uuid::new_v4();
    let token = app.token(me);

    let reply = app
        .call(
            Method::POST,
            &format!("/projects/{public}/comments"),
            Some(&token),
            Some(json!({ "body": "nice" })),
        )
        .await;
    assert_eq!(reply.status, StatusCode::CREATED);
    assert_eq!(reply.body["author_id"], me.to_string());

    let reply = app
        .call(
            Method::POST,
            &format!("/projects/{private}/comments"),
            Some(&token),
            Some(json!({ "body": "let me in" })),
        )
        .await;
    assert_not_found(&reply);

    let reply = app
        .call(
            Method::POST,
            &format!("/projects/{public}/comments"),
            None,
            Some(json!({ "body": "anonymous" })),
        )
        .await;
    assert_not_found(&reply);

    assert_eq!(app.repo.rows(Resource::Comments).len(), 1);
}

#[tokio::test]
async fn test_only_author_deletes_comment() {
    let app = spawn_app();
    let author = Uuid::new_v4();
    let project = app.seed_project(Uuid::new_v4(), true, "public");
    let comment = app.seed_comment(project, author, "mine");

    let other = app.token(Uuid::new_v4());
    let reply = app
        .call(Method::DELETE, &format!("/comments/{comment}"), Some(&other), None)
        .await;
    assert_not_found(&reply);
    assert!(app.stored(Resource::Comments, comment).is_some());

    let reply = app
        .call(
            Method::DELETE,
            &format!("/comments/{comment}"),
            Some(&app.token(author)),
            None,
        )
        .await;
    assert_eq!(reply.status, StatusCode::NO_CONTENT);
    assert!(app.stored(Resource::Comments, comment).is_none());
}

#[tokio::test]
async fn test_deleting_project_removes_its_comments() {
    let app = spawn_app();
    let owner = Uuid::new_v4();
    let project = app.seed_project(owner, true, "public");
    let comment = app.seed_comment(project, Uuid::new_v4(), "reply");

    let reply = app
        .call(
            Method::DELETE,
            &format!("/projects/{project}"),
            Some(&app.token(owner)),
            None,
        )
        .await;
    assert_eq!(reply.status, StatusCode::NO_CONTENT);
    assert!(app.stored(Resource::Comments, comment).is_none());
}

// --- Storage Availability ---

#[tokio::test]
async fn test_outage_during_read_retries_once_then_fails() {
    let app = spawn_app();
    app.seed_project(Uuid::new_v4(), true, "public");

    app.repo.fail_next_opens(2);
    let reply = app.call(Method::GET, "/projects", None, None).await;

    assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(reply.headers[header::RETRY_AFTER], "1");
    assert_eq!(reply.body["code"], "unavailable");
    assert_eq!(reply.body["retryable"], true);
}

#[tokio::test]
async fn test_single_blip_is_absorbed_by_retry() {
    let app = spawn_app();
    app.seed_project(Uuid::new_v4(), true, "public");

    app.repo.fail_next_opens(1);
    let reply = app.call(Method::GET, "/projects", None, None).await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_writes_are_not_retried() {
    let app = spawn_app();
    let token = app.token(Uuid::new_v4());

    app.repo.fail_next_opens(1);
    let reply = app
        .call(
            Method::POST,
            "/projects",
            Some(&token),
            Some(json!({ "title": "once" })),
        )
        .await;

    assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(app.repo.rows(Resource::Projects).is_empty());
}

#[tokio::test]
async fn test_connections_return_to_pool() {
    let app = spawn_app();
    let owner = Uuid::new_v4();
    let project = app.seed_project(owner, true, "public");
    let token = app.token(owner);
    let max = app.repo.max_connections();

    // success, refusal and failure paths
    app.call(Method::GET, "/projects", None, None).await;
    app.call(Method::DELETE, &format!("/projects/{project}"), None, None)
        .await;
    app.call(
        Method::PATCH,
        &format!("/projects/{}", Uuid::new_v4()),
        Some(&token),
        Some(json!({ "title": "ghost" })),
    )
    .await;
    assert_eq!(app.repo.idle_connections(), max);

    // exhaust the pool, then abandon a request that is waiting for a connection
    let mut held = Vec::new();
    for _ in 0..max {
        held.push(app.repo.open(&Identity::Anonymous).await.unwrap());
    }
    let waiting = tokio::time::timeout(
        Duration::from_millis(20),
        app.call(Method::GET, "/projects", None, None),
    )
    .await;
    assert!(waiting.is_err());

    let reply = app.call(Method::GET, "/projects", None, None).await;
    assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);

    drop(held);
    assert_eq!(app.repo.idle_connections(), max);

    let reply = app.call(Method::GET, "/projects", None, None).await;
    assert_eq!(reply.status, StatusCode::OK);
}

// --- Identity ---

#[tokio::test]
async fn test_me_reflects_credentials() {
    let app = spawn_app();
    let me = Uuid::new_v4();

    let reply = app.call(Method::GET, "/me", None, None).await;
    assert_eq!(reply.body, json!({ "role": "anon", "subject_id": null }));

    let reply = app.call(Method::GET, "/me", Some(&app.token(me)), None).await;
    assert_eq!(
        reply.body,
        json!({ "role": "authenticated", "subject_id": me.to_string() })
    );

    let reply = app.call(Method::GET, "/me", Some("garbage"), None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["role"], "anon");
}

#[tokio::test]
async fn test_session_cookie_is_accepted() {
    let app = spawn_app();
    let me = Uuid::new_v4();

    let request = axum::http::Request::builder()
        .uri("/me")
        .header(
            header::COOKIE,
            format!("theme=dark; sb-access-token={}", app.token(me)),
        )
        .body(axum::body::Body::empty())
        .unwrap();
    let reply = app.send(request).await;

    assert_eq!(reply.body["subject_id"], me.to_string());
}

#[tokio::test]
async fn test_concurrent_identities_stay_separate() {
    let app = Arc::new(spawn_app());
    let mut callers = Vec::new();
    for _ in 0..16 {
        let subject = Uuid::new_v4();
        let project = app.seed_project(subject, false, "private");
        callers.push((subject, project));
    }

    let tasks: Vec<_> = callers
        .iter()
        .map(|(subject, project)| {
            let app: Arc<TestApp> = app.clone();
            let subject = *subject;
            let project = *project;
            tokio::spawn(async move {
                let token = app.token(subject);
                let me = app.call(Method::GET, "/me", Some(&token), None).await;
                let mine = app
                    .call(Method::GET, "/projects", Some(&token), None)
                    .await;
                (subject, project, me.body, mine.body)
            })
        })
        .collect();

    for task in tasks {
        let (subject, project, me, mine) = task.await.unwrap();
        assert_eq!(me["subject_id"], subject.to_string());
        assert_eq!(ids(&mine), vec![project.to_string()]);
    }
    assert_eq!(app.repo.idle_connections(), app.repo.max_connections());
}
