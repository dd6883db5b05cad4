use scraper::{Html, Selector};

use crate::error::{Error, Result};

/// Reads the value of the hidden `CSRF_TOKEN` input of a portal page.
pub fn extract_csrf_token(html: &str) -> Result<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse(r#"input[name="CSRF_TOKEN"]"#).map_err(|e| Error::auth(format!("invalid CSRF selector: {}", e)))?;

    document
        .select(&selector)
        .filter_map(|input| input.value().attr("value"))
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::auth("CSRF_TOKEN not found in the provided HTML content"))
}
