//! Recovery from HTML interstitial pages.
//!
//! Some file hosts answer a download request with a "this file is too large
//! to scan" page instead of the payload. The page (or the original URL)
//! usually carries enough information to rebuild a direct download link.

use scraper::{Html, Selector};
use url::Url;

/// Form inputs carried over when a form is recomposed into a URL.
const FORM_FIELDS: &[&str] = &["id", "export", "confirm", "uuid"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BypassMatch {
    NoMatch,
    FormBypass { url: Url },
    AnchorBypass { url: Url },
    ConfirmParamBypass { url: Url },
}

impl BypassMatch {
    #[must_use]
    pub fn url(&self) -> Option<&Url> {
        match self {
            Self::NoMatch => None,
            Self::FormBypass { url }
            | Self::AnchorBypass { url }
            | Self::ConfirmParamBypass { url } => Some(url),
        }
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::NoMatch => "none",
            Self::FormBypass { .. } => "form",
            Self::AnchorBypass { .. } => "anchor",
            Self::ConfirmParamBypass { .. } => "confirm-param",
        }
    }
}

/// Try each recovery strategy in order and return the first match.
#[must_use]
pub fn resolve(html: &str, page_url: &Url, original_url: &Url) -> BypassMatch {
    let document = Html::parse_document(html);

    if let Some(url) = form_bypass(&document, page_url) {
        return BypassMatch::FormBypass { url };
    }
    if let Some(url) = anchor_bypass(&document, page_url) {
        return BypassMatch::AnchorBypass { url };
    }
    if let Some(url) = confirm_param_bypass(original_url) {
        return BypassMatch::ConfirmParamBypass { url };
    }
    BypassMatch::NoMatch
}

/// A form whose action, combined with its `id`/`confirm`/`uuid` inputs, is a
/// direct download link.
#[must_use]
pub fn form_bypass(document: &Html, page_url: &Url) -> Option<Url> {
    let form_sel = Selector::parse("form[action]").ok()?;
    let input_sel = Selector::parse("input[name]").ok()?;

    document.select(&form_sel).find_map(|form| {
        let action = form.value().attr("action")?.trim();
        let mut url = page_url.join(action).ok()?;

        let fields: Vec<(&str, &str)> = form
            .select(&input_sel)
            .filter_map(|input| {
                let name = input.value().attr("name")?;
                let value = input.value().attr("value").unwrap_or_default();
                FORM_FIELDS.contains(&name).then_some((name, value))
            })
            .collect();

        if !fields
            .iter()
            .any(|(name, _)| *name == "id" || *name == "confirm")
        {
            return None;
        }

        url.query_pairs_mut().extend_pairs(fields);
        Some(url)
    })
}

/// The first anchor whose href mentions "download".
#[must_use]
pub fn anchor_bypass(document: &Html, page_url: &Url) -> Option<Url> {
    let anchor_sel = Selector::parse("a[href]").ok()?;

    document
        .select(&anchor_sel)
        .filter_map(|anchor| anchor.value().attr("href"))
        .map(str::trim)
        .filter(|href| href.to_ascii_lowercase().contains("download"))
        .find_map(|href| page_url.join(href).ok())
        .filter(|url| url != page_url)
}

/// Rebuild a confirmed download link from a file id in the original URL.
///
/// The id is taken from an `id` query parameter or from a `/d/<id>` path
/// segment.
#[must_use]
pub fn confirm_param_bypass(original_url: &Url) -> Option<Url> {
    let id = original_url
        .query_pairs()
        .find(|(key, _)| key == "id")
        .map(|(_, value)| value.into_owned())
        .or_else(|| id_from_path(original_url))
        .filter(|id| !id.is_empty())?;

    let mut url = original_url.clone();
    if url.query_pairs().all(|(key, _)| key != "id") {
        url.set_path("/uc");
    }
    let kept: Vec<(String, String)> = original_url
        .query_pairs()
        .filter(|(key, _)| key != "id" && key != "export" && key != "confirm")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    url.set_query(None);
    url.query_pairs_mut()
        .append_pair("id", &id)
        .append_pair("export", "download")
        .append_pair("confirm", "t")
        .extend_pairs(kept);
    Some(url)
}

fn id_from_path(url: &Url) -> Option<String> {
    let mut segments = url.path_segments()?;
    segments.find(|segment| *segment == "d")?;
    segments.next().map(ToString::to_string)
}
