//! Upload form and one-shot flash messages

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
};

use crate::error::Error;
use crate::server::state::AppState;

const INDEX_TEMPLATE: &str = include_str!("../../../templates/index.html");

/// Flash key set when an upload exceeds the size limit
pub const FLASH_TOO_LARGE: &str = "too_large";

/// Message shown for a flash key
pub fn flash_message(key: &str) -> Option<String> {
    match key {
        FLASH_TOO_LARGE => Some(Error::PayloadTooLarge.to_string()),
        _ => None,
    }
}

fn read_cookie<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Human-readable byte size
fn format_size(bytes: usize) -> String {
    const MIB: usize = 1024 * 1024;
    if bytes >= MIB && bytes % MIB == 0 {
        format!("{} MiB", bytes / MIB)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Render the form
pub fn render_index(models: &[String], default_model: &str, max_size: usize, flash: Option<&str>) -> String {
    let options: String = models
        .iter()
        .map(|model| {
            let selected = if model == default_model { " selected" } else { "" };
            format!(
                "<option value=\"{0}\"{1}>{0}</option>",
                escape_html(model),
                selected
            )
        })
        .collect::<Vec<_>>()
        .join("\n            ");

    let flash_html = flash
        .map(|message| format!("<div class=\"flash error\">{}</div>", escape_html(message)))
        .unwrap_or_default();

    INDEX_TEMPLATE
        .replace("{{FLASH}}", &flash_html)
        .replace("{{MODEL_OPTIONS}}", &options)
        .replace("{{MAX_SIZE}}", &format_size(max_size))
        .replace("{{MAX_BYTES}}", &max_size.to_string())
}

/// Set-Cookie value carrying a flash key to the next page view
pub fn flash_cookie(name: &str, key: &str) -> String {
    format!("{}={}; Path=/; Max-Age=60; HttpOnly; SameSite=Lax", name, key)
}

/// GET / - Upload form
pub async fn index(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let config = state.config();
    let cookie_name = &config.server.flash_cookie;
    let flash = read_cookie(&headers, cookie_name).and_then(flash_message);

    let page = render_index(
        &config.pipeline.available_models,
        &config.pipeline.default_model,
        config.server.max_upload_size,
        flash.as_deref(),
    );

    let mut response = Html(page).into_response();
    if flash.is_some() {
        let clear = format!("{}=; Path=/; Max-Age=0", cookie_name);
        if let Ok(value) = HeaderValue::from_str(&clear) {
            response.headers_mut().insert(header::SET_COOKIE, value);
        }
    }
    response
}

/// Rewrites any 413 into a redirect to the form with a flashed message
pub async fn redirect_too_large(State(state): State<AppState>, response: Response) -> Response {
    if response.status() != StatusCode::PAYLOAD_TOO_LARGE {
        return response;
    }

    tracing::warn!("Upload rejected: body exceeds {} bytes", state.config().server.max_upload_size);
    let cookie = flash_cookie(&state.config().server.flash_cookie, FLASH_TOO_LARGE);
    match HeaderValue::from_str(&cookie) {
        Ok(value) => (
            StatusCode::SEE_OTHER,
            [(header::LOCATION, HeaderValue::from_static("/")), (header::SET_COOKIE, value)],
        )
            .into_response(),
        Err(_) => response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_lists_models_and_size() {
        let models = vec!["htdemucs".to_string(), "mdx<x>".to_string()];
        let page = render_index(&models, "htdemucs", 512 * 1024 * 1024, None);

        assert!(page.contains("<option value=\"htdemucs\" selected>htdemucs</option>"));
        assert!(page.contains("mdx&lt;x&gt;"));
        assert!(page.contains("512 MiB"));
        assert!(!page.contains("{{"));
        assert!(!page.contains("flash error"));
    }

    #[test]
    fn test_render_flash() {
        let page = render_index(&[], "htdemucs", 1024, Some("Too big & heavy"));
        assert!(page.contains("<div class=\"flash error\">Too big &amp; heavy</div>"));
        assert!(page.contains("1024 bytes"));
    }

    #[test]
    fn test_read_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; salsa_milk_flash=too_large"),
        );
        assert_eq!(read_cookie(&headers, "salsa_milk_flash"), Some("too_large"));
        assert_eq!(read_cookie(&headers, "missing"), None);
        assert_eq!(
            flash_message(FLASH_TOO_LARGE).as_deref(),
            Some("The uploaded file is too large for the server to process.")
        );
        assert!(flash_message("other").is_none());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(3 * 1024 * 1024 / 2), "1.5 MiB");
        assert_eq!(format_size(10), "10 bytes");
    }
}
