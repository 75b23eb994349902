//! OAuth 1.0a request signing (HMAC-SHA1)

use crate::credentials::Credential;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::distr::{Alphanumeric, SampleString};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

/// Per-request values that would otherwise be random or time based
#[derive(Debug, Clone)]
pub struct OAuthNonce {
    pub nonce: String,
    pub timestamp: i64,
}

impl OAuthNonce {
    pub fn fresh() -> Self {
        Self {
            nonce: Alphanumeric.sample_string(&mut rand::rng(), 32),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

fn encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Computes the base64 HMAC-SHA1 signature of a request
///
/// `base_url` must not contain a query string; `params` holds both the
/// request parameters and the `oauth_*` protocol parameters.
pub fn signature(
    credential: &Credential,
    method: &str,
    base_url: &str,
    params: &[(String, String)],
) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (encode(k), encode(v)))
        .collect();
    encoded.sort();

    let param_string = encoded
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let base_string = format!(
        "{}&{}&{}",
        method.to_uppercase(),
        encode(base_url),
        encode(&param_string)
    );
    let key = format!(
        "{}&{}",
        encode(&credential.consumer_secret),
        encode(&credential.token_secret)
    );

    // HMAC accepts keys of any length
    let mut mac = match HmacSha1::new_from_slice(key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(base_string.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Builds the `Authorization` header value for a request
pub fn authorization_header(
    credential: &Credential,
    method: &str,
    base_url: &str,
    request_params: &[(String, String)],
    nonce: &OAuthNonce,
) -> String {
    let mut oauth_params = vec![
        ("oauth_consumer_key".to_string(), credential.consumer_key.clone()),
        ("oauth_nonce".to_string(), nonce.nonce.clone()),
        ("oauth_signature_method".to_string(), "HMAC-SHA1".to_string()),
        ("oauth_timestamp".to_string(), nonce.timestamp.to_string()),
        ("oauth_token".to_string(), credential.token_key.clone()),
        ("oauth_version".to_string(), "1.0".to_string()),
    ];

    let mut all_params = oauth_params.clone();
    all_params.extend(request_params.iter().cloned());
    let signature = signature(credential, method, base_url, &all_params);
    oauth_params.push(("oauth_signature".to_string(), signature));
    oauth_params.sort();

    let fields = oauth_params
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", encode(k), encode(v)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("OAuth {}", fields)
}
