// Authorization-code + PKCE flow and refresh-token grant, shared by every
// OAuth backend. Endpoint specifics (client id, scope, extras) come in via
// OAuthProvider so the flow itself stays backend-agnostic.

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::Digest;

#[derive(Debug, Clone)]
pub struct OAuthProvider {
    pub auth_url: String,
    pub token_url: String,
    pub client_id: String,
    pub scope: String,
    pub callback_port: u16,
    // Backend-specific authorize-URL extras, e.g. ("access_type", "offline").
    pub extra_params: Vec<(String, String)>,
}

impl OAuthProvider {
    pub fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}/auth/callback", self.callback_port)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdClaims {
    pub sub: Option<String>,
    pub email: Option<String>,
}

pub fn generate_pkce_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

pub fn pkce_challenge_s256(verifier: &str) -> String {
    let digest = sha2::Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

pub fn generate_state() -> String {
    let mut bytes = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

pub fn build_authorize_url(
    provider: &OAuthProvider,
    state: &str,
    code_challenge: &str,
) -> Result<String, String> {
    let redirect_uri = provider.redirect_uri();
    let mut params: Vec<(&str, &str)> = vec![
        ("response_type", "code"),
        ("client_id", provider.client_id.as_str()),
        ("scope", provider.scope.as_str()),
        ("redirect_uri", redirect_uri.as_str()),
        ("code_challenge", code_challenge),
        ("code_challenge_method", "S256"),
        ("state", state),
    ];
    for (k, v) in &provider.extra_params {
        params.push((k.as_str(), v.as_str()));
    }

    let url = url::Url::parse_with_params(&provider.auth_url, &params)
        .map_err(|e| format!("Invalid authorize URL: {}", e))?;
    Ok(url.to_string())
}

pub async fn exchange_code(
    provider: &OAuthProvider,
    code: &str,
    code_verifier: &str,
) -> Result<TokenResponse, String> {
    let client = reqwest::Client::new();
    let redirect_uri = provider.redirect_uri();
    let params: Vec<(&str, &str)> = vec![
        ("grant_type", "authorization_code"),
        ("client_id", provider.client_id.as_str()),
        ("code", code),
        ("redirect_uri", redirect_uri.as_str()),
        ("code_verifier", code_verifier),
    ];

    let response = client
        .post(&provider.token_url)
        .form(&params)
        .send()
        .await
        .map_err(|e| format!("Token exchange request failed: {}", e))?;

    if response.status().is_success() {
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| format!("Token parsing failed: {}", e))
    } else {
        let error_text = response.text().await.unwrap_or_default();
        Err(format!("Token exchange failed: {}", error_text))
    }
}

// Refresh grant. A non-2xx answer is returned as Err with the body verbatim;
// the caller decides whether that latches the account invalid.
pub async fn refresh_access_token(
    token_url: &str,
    client_id: &str,
    refresh_token: &str,
) -> Result<TokenResponse, String> {
    let client = reqwest::Client::new();
    let params: Vec<(&str, &str)> = vec![
        ("grant_type", "refresh_token"),
        ("client_id", client_id),
        ("refresh_token", refresh_token),
    ];

    let response = client
        .post(token_url)
        .form(&params)
        .send()
        .await
        .map_err(|e| format!("Refresh request failed: {}", e))?;

    if response.status().is_success() {
        let mut token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| format!("Refresh data parsing failed: {}", e))?;
        // Providers may omit the refresh token on rotation; keep the old one.
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token.to_string());
        }
        Ok(token)
    } else {
        let error_text = response.text().await.unwrap_or_default();
        Err(format!("Refresh failed: {}", error_text))
    }
}

// Pulls email/sub from an id_token payload without signature validation; the
// claims are only a naming hint for the account id.
pub fn decode_id_token_claims(id_token: &str) -> Option<IdClaims> {
    let payload = id_token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    Some(IdClaims {
        sub: claims
            .get("sub")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        email: claims
            .get("email")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    })
}

// Stable account identifier: email when known, subject otherwise, synthetic
// as the last resort.
pub fn derive_account_id(claims: Option<&IdClaims>) -> String {
    if let Some(claims) = claims {
        if let Some(email) = &claims.email {
            return email.clone();
        }
        if let Some(sub) = &claims.sub {
            return sub.clone();
        }
    }
    format!("account-{}", uuid::Uuid::new_v4())
}

// Full authorization-code flow: emit the authorize URL, wait for the local
// callback (5-minute absolute timeout), exchange the code, and derive the
// account id from the id_token claims when present.
pub async fn run_authorization_flow(
    provider: &OAuthProvider,
) -> Result<(TokenResponse, String), String> {
    let code_verifier = generate_pkce_verifier();
    let code_challenge = pkce_challenge_s256(&code_verifier);
    let state = generate_state();
    let authorize_url = build_authorize_url(provider, &state, &code_challenge)?;
    tracing::info!("Open this URL to authorize: {}", authorize_url);

    let code = crate::auth::callback::wait_for_code(provider.callback_port, &state).await?;
    let token = exchange_code(provider, &code, &code_verifier).await?;

    let claims = token
        .id_token
        .as_deref()
        .and_then(decode_id_token_claims);
    let account_id = derive_account_id(claims.as_ref());
    Ok((token, account_id))
}
