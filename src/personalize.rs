//! Per-recipient rewrite of a campaign's rendered HTML.
//!
//! Everything HTML-aware lives behind [`personalize`]; callers never see the
//! regular expressions, so the rewrite can move to a real HTML tree later.

use crate::{domain::UNSUBSCRIBE_PLACEHOLDER, tracking_links::TrackingLinks};
use askama_axum::Template;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use uuid::Uuid;

static ANCHOR_HREF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)(<a\b[^>]*?\shref\s*=\s*)(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .expect("anchor pattern is valid")
});
static CHARACTER_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"&(?:#(\d{1,7})|#[xX]([0-9a-fA-F]{1,6})|([a-zA-Z]+));")
        .expect("character reference pattern is valid")
});
static BODY_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<body\b[^>]*>").expect("body pattern is valid"));
static BODY_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</body\s*>").expect("closing body pattern is valid"));

const UNTRACKED_PREFIXES: [&str; 3] = ["mailto:", "#", "tel:"];

pub struct PersonalizationContext<'a> {
    pub campaign_id: Uuid,
    pub recipient: &'a str,
    pub preheader: Option<&'a str>,
    pub links: &'a TrackingLinks,
    /// Test sends keep the unsubscribe link and preheader but skip open and
    /// click tracking.
    pub tracking: bool,
}

#[derive(Template)]
#[template(
    source = r#"<div style="display:none;max-height:0;overflow:hidden;mso-hide:all;">{{ preheader }}</div>"#,
    ext = "html"
)]
struct PreheaderBlock<'a> {
    preheader: &'a str,
}

#[derive(Template)]
#[template(
    source = r#"<img src="{{ src|safe }}" width="1" height="1" alt="" style="display:block;border:0;" />"#,
    ext = "html"
)]
struct OpenBeacon<'a> {
    src: &'a str,
}

pub fn personalize(html: &str, ctx: &PersonalizationContext<'_>) -> Result<String, anyhow::Error> {
    let mut document = if ctx.tracking {
        rewrite_links(html, ctx)
    } else {
        html.to_owned()
    };

    let unsubscribe_url = ctx.links.unsubscribe(ctx.recipient, Some(ctx.campaign_id));
    document = document.replace(UNSUBSCRIBE_PLACEHOLDER, unsubscribe_url.as_str());

    if ctx.tracking {
        let src = ctx.links.open(ctx.campaign_id, ctx.recipient);
        let beacon = OpenBeacon { src: src.as_str() }.render()?;
        document = insert_before_body_close(&document, &beacon);
    }

    if let Some(preheader) = ctx.preheader.filter(|p| !p.trim().is_empty()) {
        let block = PreheaderBlock { preheader }.render()?;
        document = insert_after_body_open(&document, &block);
    }

    Ok(document)
}

fn rewrite_links(html: &str, ctx: &PersonalizationContext<'_>) -> String {
    let mut link_index = 0;

    ANCHOR_HREF
        .replace_all(html, |caps: &Captures<'_>| {
            let (href, quote) = match (caps.get(2), caps.get(3), caps.get(4)) {
                (Some(href), _, _) => (href.as_str(), '"'),
                (None, Some(href), _) => (href.as_str(), '\''),
                (None, None, Some(href)) => (href.as_str(), '"'),
                (None, None, None) => return caps[0].to_owned(),
            };
            let href = decode_attribute(href);

            if !is_trackable(&href) {
                return caps[0].to_owned();
            }

            let tracked = ctx
                .links
                .click(ctx.campaign_id, link_index, &href, ctx.recipient);
            link_index += 1;
            format!("{}{quote}{tracked}{quote}", &caps[1])
        })
        .into_owned()
}

/// Resolves character references in an attribute value, so `&amp;` between
/// query parameters reaches the redirect as a plain `&`. Unknown references
/// are left as written.
fn decode_attribute(value: &str) -> String {
    CHARACTER_REFERENCE
        .replace_all(value, |caps: &Captures<'_>| {
            let decoded = if let Some(decimal) = caps.get(1) {
                decimal.as_str().parse().ok().and_then(char::from_u32)
            } else if let Some(hex) = caps.get(2) {
                u32::from_str_radix(hex.as_str(), 16).ok().and_then(char::from_u32)
            } else {
                match caps[3].to_ascii_lowercase().as_str() {
                    "amp" => Some('&'),
                    "quot" => Some('"'),
                    "apos" => Some('\''),
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "nbsp" => Some('\u{a0}'),
                    _ => None,
                }
            };
            decoded.map_or_else(|| caps[0].to_owned(), String::from)
        })
        .into_owned()
}

fn is_trackable(href: &str) -> bool {
    let href = href.trim();
    let lowered = href.to_ascii_lowercase();

    !href.is_empty()
        && !href.contains(UNSUBSCRIBE_PLACEHOLDER)
        && !UNTRACKED_PREFIXES.iter().any(|p| lowered.starts_with(p))
}

fn insert_after_body_open(document: &str, block: &str) -> String {
    match BODY_OPEN.find(document) {
        Some(tag) => {
            let mut out = String::with_capacity(document.len() + block.len());
            out.push_str(&document[..tag.end()]);
            out.push_str(block);
            out.push_str(&document[tag.end()..]);
            out
        }
        None => format!("{block}{document}"),
    }
}

fn insert_before_body_close(document: &str, block: &str) -> String {
    match BODY_CLOSE.find_iter(document).last() {
        Some(tag) => {
            let mut out = String::with_capacity(document.len() + block.len());
            out.push_str(&document[..tag.start()]);
            out.push_str(block);
            out.push_str(&document[tag.start()..]);
            out
        }
        None => format!("{document}{block}"),
    }
}
