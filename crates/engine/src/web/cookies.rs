//! Cookie handling and language negotiation
//!
//! The engine uses two cookies: `cpx_id` (the session id) and `cpx_lang`
//! (the UI language, renegotiated on every request from `Accept-Language`
//! against the translation files actually on disk).

use std::collections::HashMap;
use std::path::Path;

use axum::http::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, COOKIE, SET_COOKIE};

pub const SESSION_COOKIE: &str = "cpx_id";
pub const LANG_COOKIE: &str = "cpx_lang";

/// Parse the request's `Cookie` headers into a map.
pub fn parse_cookies(headers: &HeaderMap) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for header in headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else { continue };
        for pair in raw.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                cookies.insert(name.trim().to_string(), value.trim().to_string());
            }
        }
    }
    cookies
}

/// The `cpx_id` cookie value, if any.
pub fn session_id(headers: &HeaderMap) -> Option<String> {
    parse_cookies(headers).remove(SESSION_COOKIE)
}

/// Append a session cookie to a response header map.
pub fn set_session_cookie(headers: &mut HeaderMap, session_id: &str) {
    if let Ok(value) = HeaderValue::from_str(&format!("{SESSION_COOKIE}={session_id}; path=/")) {
        headers.append(SET_COOKIE, value);
    }
}

/// Append a language cookie to a response header map.
pub fn set_lang_cookie(headers: &mut HeaderMap, lang: &str) {
    if let Ok(value) = HeaderValue::from_str(&format!("{LANG_COOKIE}={lang}; path=/")) {
        headers.append(SET_COOKIE, value);
    }
}

/// Negotiate the UI language: every `Accept-Language` entry is checked
/// against `<www_root>/agent/application/nls/<lang>/labels.js`, then its
/// bare prefix (`en-US` → `en`), and finally everything falls back to
/// `"en"`.
pub async fn negotiate_language(headers: &HeaderMap, www_root: &Path) -> String {
    let accepted = headers
        .get(ACCEPT_LANGUAGE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    for entry in accepted.split(',') {
        let lang = entry.split(';').next().unwrap_or("").trim();
        if lang.is_empty() || lang == "*" {
            continue;
        }
        if labels_exist(www_root, lang).await {
            return lang.to_string();
        }
        if let Some(prefix) = lang.split('-').next() {
            if prefix != lang && labels_exist(www_root, prefix).await {
                return prefix.to_string();
            }
        }
    }

    "en".to_string()
}

async fn labels_exist(www_root: &Path, lang: &str) -> bool {
    if lang.contains(['/', '\\', '.']) {
        return false;
    }
    let path = www_root
        .join("agent")
        .join("application")
        .join("nls")
        .join(lang)
        .join("labels.js");
    tokio::fs::try_exists(&path).await.unwrap_or(false)
}
