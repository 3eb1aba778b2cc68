use axum::http::{HeaderMap, HeaderValue, header};
use chrono::{Duration, Utc};
use jsonwebtoken::{EncodingKey, Header, encode};
use rowgate::{Identity, TokenVerifier, auth::Claims};
use uuid::Uuid;

const SECRET: &str = "auth-test-secret";

fn sign(claims: &Claims, secret: &str) -> String {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

fn claims(sub: Option<Uuid>, role: Option<&str>, expires_in: Duration) -> Claims {
    Claims {
        sub,
        role: role.map(str::to_string),
        exp: (Utc::now() + expires_in).timestamp() as usize,
        iat: Some(Utc::now().timestamp() as usize),
    }
}

fn bearer(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
    );
    headers
}

#[test]
fn test_valid_token_resolves_subject() {
    let verifier = TokenVerifier::new(SECRET);
    let subject = Uuid::new_v4();
    let token = sign(
        &claims(Some(subject), Some("authenticated"), Duration::hours(1)),
        SECRET,
    );

    assert_eq!(
        verifier.resolve(&bearer(&token)),
        Identity::Authenticated {
            subject_id: subject
        }
    );
}

#[test]
fn test_token_without_role_claim_is_authenticated() {
    let verifier = TokenVerifier::new(SECRET);
    let subject = Uuid::new_v4();
    let token = sign(&claims(Some(subject), None, Duration::hours(1)), SECRET);

    assert_eq!(verifier.resolve(&bearer(&token)).subject_id(), Some(subject));
}

#[test]
fn test_missing_credentials_are_anonymous() {
    let verifier = TokenVerifier::new(SECRET);
    assert_eq!(verifier.resolve(&HeaderMap::new()), Identity::Anonymous);

    let mut basic = HeaderMap::new();
    basic.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
    assert_eq!(verifier.resolve(&basic), Identity::Anonymous);
}

#[test]
fn test_unusable_tokens_fall_back_to_anonymous() {
    let verifier = TokenVerifier::new(SECRET);
    let subject = Some(Uuid::new_v4());

    let cases = [
        // expired beyond the validation leeway
        sign(&claims(subject, Some("authenticated"), Duration::hours(-1)), SECRET),
        // signed with another key
        sign(&claims(subject, Some("authenticated"), Duration::hours(1)), "other-secret"),
        // anon tokens and tokens without a subject
        sign(&claims(subject, Some("anon"), Duration::hours(1)), SECRET),
        sign(&claims(None, Some("authenticated"), Duration::hours(1)), SECRET),
        // roles this service does not serve
        sign(&claims(subject, Some("service_role"), Duration::hours(1)), SECRET),
        "not.a.jwt".to_string(),
    ];

    for token in cases {
        assert_eq!(
            verifier.resolve(&bearer(&token)),
            Identity::Anonymous,
            "{token}"
        );
    }
}

#[test]
fn test_bearer_wins_over_cookie() {
    let verifier = TokenVerifier::new(SECRET);
    let from_header = Uuid::new_v4();
    let from_cookie = Uuid::new_v4();

    let mut headers = bearer(&sign(
        &claims(Some(from_header), None, Duration::hours(1)),
        SECRET,
    ));
    let cookie = format!(
        "sb-access-token={}",
        sign(&claims(Some(from_cookie), None, Duration::hours(1)), SECRET)
    );
    headers.insert(header::COOKIE, HeaderValue::from_str(&cookie).unwrap());

    assert_eq!(verifier.resolve(&headers).subject_id(), Some(from_header));

    headers.remove(header::AUTHORIZATION);
    assert_eq!(verifier.resolve(&headers).subject_id(), Some(from_cookie));
}
