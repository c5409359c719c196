/**
 * ERREURS KERNEL - Taxonomie unique des erreurs métier
 *
 * RÔLE : Chaque opération du kernel (realms, live state, synthèse, rétention)
 * retourne un `KernelError`. La couche HTTP le convertit en réponse JSON
 * avec le code HTTP correspondant.
 *
 * RÈGLE : toute mutation valide d'abord, écrit ensuite. Une erreur signifie
 * donc "aucun effet" côté store.
 */

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{entity} named '{name}' already exists")]
    DuplicateName { entity: &'static str, name: String },

    #[error("moving realm {realm} under {parent} would create a cycle")]
    WouldCreateCycle { realm: String, parent: String },

    #[error("parent realm not found: {0}")]
    ParentNotFound(String),

    #[error("field '{0}' is computed by the backend and cannot be updated")]
    ForbiddenFieldUpdate(String),

    #[error("realm {0} is not visible to the caller")]
    PermissionDenied(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("an If-Match header is required for this request")]
    PreconditionRequired,

    #[error("missing or invalid API key")]
    Unauthorized,

    #[error("storage error: {0}")]
    Storage(String),
}

pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }

    pub fn stale_etag(entity: &'static str, id: &str) -> Self {
        Self::Conflict(format!("{entity} {id} was modified concurrently, fetch it again"))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            KernelError::NotFound { .. } => StatusCode::NOT_FOUND,
            KernelError::Conflict(_)
            | KernelError::DuplicateName { .. }
            | KernelError::WouldCreateCycle { .. } => StatusCode::CONFLICT,
            KernelError::ParentNotFound(_) | KernelError::Validation(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            KernelError::ForbiddenFieldUpdate(_) => StatusCode::PRECONDITION_FAILED,
            KernelError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            KernelError::PreconditionRequired => StatusCode::PRECONDITION_REQUIRED,
            KernelError::Unauthorized => StatusCode::UNAUTHORIZED,
            KernelError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for KernelError {
    fn from(e: std::io::Error) -> Self {
        KernelError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(e: serde_json::Error) -> Self {
        KernelError::Storage(e.to_string())
    }
}

/// Vérifie le jeton optimiste fourni par l'appelant (None = appel interne)
pub fn check_etag(entity: &'static str, id: &str, current: &str, expected: Option<&str>) -> KernelResult<()> {
    match expected {
        Some(etag) if etag.trim_matches('"') != current => Err(KernelError::stale_etag(entity, id)),
        _ => Ok(()),
    }
}

impl IntoResponse for KernelError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("[http] {}", self);
        } else {
            tracing::debug!("[http] request rejected ({}): {}", status.as_u16(), self);
        }
        let body = serde_json::json!({
            "_status": "ERR",
            "_error": { "code": status.as_u16(), "message": self.to_string() }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(KernelError::not_found("realm", "x").status(), StatusCode::NOT_FOUND);
        assert_eq!(KernelError::Conflict("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(KernelError::ForbiddenFieldUpdate("_level".into()).status(), StatusCode::PRECONDITION_FAILED);
        assert_eq!(KernelError::PermissionDenied("r".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(KernelError::Validation("bad".into()).status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_check_etag() {
        assert!(check_etag("realm", "r1", "abc", None).is_ok());
        assert!(check_etag("realm", "r1", "abc", Some("abc")).is_ok());
        assert!(check_etag("realm", "r1", "abc", Some("\"abc\"")).is_ok());
        assert!(matches!(check_etag("realm", "r1", "abc", Some("def")), Err(KernelError::Conflict(_))));
    }
}
