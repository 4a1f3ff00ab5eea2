use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::{error, trace};

use tandem_gateway::blocking;
use tandem_types::api::Claims;

use crate::state::AppState;

/// Token from an `Authorization: Bearer` header, if present and well formed.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.token().to_string())
}

pub fn decode_claims(secret: &str, token: &str) -> Option<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()
    .map(|data| data.claims)
}

/// Validate the bearer JWT, record the caller's display fields, and expose
/// the claims to handlers as an extension.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = bearer_token(req.headers()).ok_or(StatusCode::UNAUTHORIZED)?;
    let claims = decode_claims(&state.jwt_secret, &token).ok_or(StatusCode::UNAUTHORIZED)?;
    trace!("Authenticated {} ({})", claims.name, claims.sub);

    let db = state.db.clone();
    let (id, name, avatar_url) = (claims.sub, claims.name.clone(), claims.avatar_url.clone());
    blocking(move || db.upsert_user(id, &name, avatar_url.as_deref()))
        .await
        .map_err(|e| {
            error!("Failed to record user {}: {}", id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use uuid::Uuid;

    #[test]
    fn decodes_only_tokens_signed_with_our_secret() {
        let claims = Claims {
            sub: Uuid::new_v4(),
            name: "alice".into(),
            avatar_url: None,
            exp: (chrono::Utc::now().timestamp() + 600) as usize,
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(b"right")).unwrap();

        assert_eq!(decode_claims("right", &token).unwrap().sub, claims.sub);
        assert!(decode_claims("wrong", &token).is_none());
    }

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(bearer_token(&headers).is_none());
        headers.insert(header::AUTHORIZATION, "Bearer abc.def".parse().unwrap());
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc.def"));
    }
}
