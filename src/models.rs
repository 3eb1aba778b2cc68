use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use ts_rs::TS;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::validation::{Field, Schema};

// --- Stored Rows ---

/// Project
///
/// A row of `public.projects`. Public projects are readable by anyone; the owner
/// reads, edits and deletes their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct Project {
    pub id: Uuid,
    // Always the subject id of the caller that created the row.
    pub owner_id: Uuid,
    pub title: String,
    pub summary: Option<String>,
    pub is_public: bool,

    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
    #[ts(type = "string")]
    pub updated_at: DateTime<Utc>,
}

/// Comment
///
/// A row of `public.comments`. Visible exactly when its project is visible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct Comment {
    pub id: Uuid,
    pub project_id: Uuid,
    pub author_id: Uuid,
    pub body: String,
    #[ts(type = "string")]
    pub created_at: DateTime<Utc>,
}

/// Me
///
/// The identity the current request resolved to (GET /me).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct Me {
    /// `anon` or `authenticated`.
    pub role: String,
    pub subject_id: Option<Uuid>,
}

// --- Request Payloads ---

/// NewProject
///
/// Input payload for POST /projects. The owner is never part of the payload; it is
/// taken from the caller's identity.
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct NewProject {
    #[schema(example = "Row-level security in practice")]
    pub title: String,
    pub summary: Option<String>,
    /// Defaults to `false`.
    pub is_public: Option<bool>,
}

/// ProjectChanges
///
/// Input payload for PATCH /projects/{id}. Absent (or null) fields are left as they are.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct ProjectChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_public: Option<bool>,
}

/// NewComment
#[derive(Debug, Clone, Serialize, Deserialize, TS, ToSchema)]
#[ts(export)]
pub struct NewComment {
    #[schema(example = "Great write-up.")]
    pub body: String,
}

/// ListProjects
///
/// Query parameters of GET /projects.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
#[serde(deny_unknown_fields)]
pub struct ListProjects {
    /// Page size, 1 to 100. Defaults to 50.
    pub limit: Option<i64>,
    /// Only the caller's own projects. Anonymous callers own nothing.
    pub mine: Option<bool>,
}

// --- Validation Schemas ---

pub const TITLE_MAX: usize = 200;
pub const TEXT_MAX: usize = 4000;

pub static NEW_PROJECT: LazyLock<Schema> = LazyLock::new(|| {
    Schema::new("new_project")
        .field(Field::string("title").required().non_blank().max_len(TITLE_MAX))
        .field(Field::string("summary").max_len(TEXT_MAX))
        .field(Field::boolean("is_public"))
});

pub static PROJECT_CHANGES: LazyLock<Schema> = LazyLock::new(|| {
    Schema::new("project_changes")
        .field(Field::string("title").non_blank().max_len(TITLE_MAX))
        .field(Field::string("summary").max_len(TEXT_MAX))
        .field(Field::boolean("is_public"))
        .require_any()
});

pub static NEW_COMMENT: LazyLock<Schema> = LazyLock::new(|| {
    Schema::new("new_comment").field(Field::string("body").required().non_blank().max_len(TEXT_MAX))
});

pub static LIST_PROJECTS: LazyLock<Schema> = LazyLock::new(|| {
    Schema::new("list_projects")
        .field(Field::integer("limit").range(1, 100))
        .field(Field::boolean("mine"))
});
