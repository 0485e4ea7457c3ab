// SPDX-License-Identifier: MIT
//! OAuth2/OIDC login callback.
//!
//! The IdP redirects here with an authorization code; we exchange it at the
//! token endpoint, validate the returned `id_token` against the IdP's JWKS,
//! and mint a `session` cookie backed by a row in the `sessions` table.
//! Everything downstream (the WebSocket, the admin switch) trusts only that
//! cookie.

use crate::config::AuthConfig;
use crate::AppContext;
use anyhow::{bail, Context as _, Result};
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Redirect, Response},
};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    id_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: Option<String>,
    kty: String,
    n: Option<String>,
    e: Option<String>,
}

/// The claims we consume from the id_token. `sub` becomes the userid.
#[derive(Debug, Deserialize)]
struct IdClaims {
    sub: String,
}

/// `GET /auth` — the authorization-code callback.
pub async fn callback(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    if let Some(err) = query.error {
        warn!(
            error = %err,
            description = query.error_description.as_deref().unwrap_or(""),
            "idp returned an error"
        );
        return (StatusCode::BAD_REQUEST, "login failed\n").into_response();
    }
    let Some(code) = query.code else {
        return (StatusCode::BAD_REQUEST, "missing authorization code\n").into_response();
    };

    match login(&ctx, &code).await {
        Ok(response) => response,
        Err(e) => {
            warn!("login failed: {e:#}");
            (StatusCode::BAD_GATEWAY, "login failed\n").into_response()
        }
    }
}

async fn login(ctx: &AppContext, code: &str) -> Result<Response> {
    let auth = &ctx.config.auth;
    let client = reqwest::Client::new();

    // Exchange the code for tokens.
    let redirect_uri = format!("{}/auth", ctx.config.url);
    let token: TokenResponse = client
        .post(&auth.token_url)
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", auth.client_id.as_str()),
            ("client_secret", auth.secret.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
        ])
        .send()
        .await
        .context("token endpoint request")?
        .error_for_status()
        .context("token endpoint status")?
        .json()
        .await
        .context("decode token response")?;
    let id_token = token
        .id_token
        .context("token response carried no id_token")?;

    let userid = validate_id_token(&client, auth, &id_token).await?;

    // Mint the session cookie.
    let cookie = Uuid::new_v4().to_string();
    let expr = chrono::Utc::now().timestamp() + auth.cookie_expiry_secs;
    ctx.storage
        .insert_auth_session(&cookie, &userid, expr)
        .await
        .context("store session cookie")?;
    info!(user = %userid, "login complete");

    let attrs = cookie_attributes(&cookie, auth.cookie_expiry_secs, ctx.config.prod);
    Ok(([(header::SET_COOKIE, attrs)], Redirect::to("/")).into_response())
}

/// Validate signature, audience and expiry; return the subject.
async fn validate_id_token(
    client: &reqwest::Client,
    auth: &AuthConfig,
    token: &str,
) -> Result<String> {
    let header = decode_header(token).context("decode id_token header")?;
    let jwks: Jwks = client
        .get(&auth.jwks_url)
        .send()
        .await
        .context("fetch jwks")?
        .error_for_status()
        .context("jwks status")?
        .json()
        .await
        .context("decode jwks")?;

    let jwk = select_key(&jwks, header.kid.as_deref())
        .context("no matching signing key in jwks")?;
    let (Some(n), Some(e)) = (&jwk.n, &jwk.e) else {
        bail!("jwks key is missing RSA components");
    };
    let key = DecodingKey::from_rsa_components(n, e).context("build decoding key")?;

    let mut validation = Validation::new(match header.alg {
        alg @ (Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512) => alg,
        other => bail!("unsupported id_token algorithm {other:?}"),
    });
    validation.set_audience(&[&auth.client_id]);

    let data = decode::<IdClaims>(token, &key, &validation).context("validate id_token")?;
    Ok(data.claims.sub)
}

/// Pick the RSA key matching `kid`; with no `kid` in the header, the first
/// RSA key wins.
fn select_key<'a>(jwks: &'a Jwks, kid: Option<&str>) -> Option<&'a Jwk> {
    jwks.keys.iter().find(|k| {
        k.kty == "RSA"
            && match kid {
                Some(kid) => k.kid.as_deref() == Some(kid),
                None => true,
            }
    })
}

fn cookie_attributes(cookie: &str, expiry_secs: i64, prod: bool) -> String {
    let mut attrs =
        format!("session={cookie}; Path=/; HttpOnly; SameSite=Lax; Max-Age={expiry_secs}");
    if prod {
        attrs.push_str("; Secure");
    }
    attrs
}
