//! Conditional-GET protocol of the virtual stylesheet.
//!
//! Everything here is a pure function of the theme, the document's modification
//! time and the inbound headers, so the caching behaviour can be checked without
//! a running site.

use axum::http::{
    HeaderMap, HeaderName, HeaderValue,
    header::{
        CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH,
        InvalidHeaderValue, LAST_MODIFIED,
    },
};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::model::CustomCssPost;

pub const FILE_NAME: &str = "custom.css";

/// 2000-01-01T00:00:00Z, used when a theme has no custom CSS document.
pub const SENTINEL_LAST_MODIFIED: i64 = 946_684_800;

const X_ROBOTS_TAG: HeaderName = HeaderName::from_static("x-robots-tag");

/// Modification time of the document, or the sentinel when there is none.
pub fn last_modified(post: Option<&CustomCssPost>) -> i64 {
    let Some(post) = post else {
        return SENTINEL_LAST_MODIFIED;
    };

    post.modified_timestamp().unwrap_or_else(|| {
        tracing::warn!(
            post_id = post.id,
            modified_gmt = %post.modified_gmt,
            "unparseable modification time, using sentinel"
        );
        SENTINEL_LAST_MODIFIED
    })
}

/// 32 hex chars derived from the modification time and the theme, never from the CSS.
///
/// This is the first 16 bytes of SHA-256 over `"{last_modified}{theme}"`. It is
/// not an md5 digest, so tags issued by an md5-based deployment never match.
pub fn etag(last_modified: i64, theme: &str) -> String {
    let digest = Sha256::digest(format!("{}{}", last_modified, theme).as_bytes());
    hex::encode(&digest[..16])
}

/// IMF-fixdate, e.g. `Sat, 01 Jan 2000 00:00:00 GMT`.
pub fn http_date(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .unwrap_or_default()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validators {
    pub etag: String,
    pub last_modified: String,
}

impl Validators {
    pub fn new(last_modified: i64, theme: &str) -> Self {
        Validators {
            etag: etag(last_modified, theme),
            last_modified: http_date(last_modified),
        }
    }

    /// Headers of a stylesheet response carrying these validators.
    pub fn headers(&self) -> Result<Vec<(HeaderName, HeaderValue)>, InvalidHeaderValue> {
        Ok(vec![
            (X_ROBOTS_TAG, HeaderValue::from_static("noindex, follow")),
            (CONTENT_TYPE, HeaderValue::from_static("text/css")),
            (
                CONTENT_DISPOSITION,
                HeaderValue::from_str(&format!("inline; filename=\"{}\"", FILE_NAME))?,
            ),
            (CACHE_CONTROL, HeaderValue::from_static("public")),
            (ETAG, HeaderValue::from_str(&format!("\"{}\"", self.etag))?),
            (LAST_MODIFIED, HeaderValue::from_str(&self.last_modified)?),
        ])
    }

    /// Whether the client's cached copy is current.
    ///
    /// `If-Modified-Since` must equal Last-Modified byte for byte. `If-None-Match`
    /// is compared after removing backslash escapes and every double quote.
    /// Anything unreadable counts as a mismatch.
    pub fn matches(&self, inbound: &HeaderMap) -> bool {
        let header = |name: HeaderName| inbound.get(name).and_then(|v| v.to_str().ok());

        let modified_since = header(IF_MODIFIED_SINCE).is_some_and(|v| v == self.last_modified);
        let none_match = header(IF_NONE_MATCH)
            .is_some_and(|v| strip_slashes(v).replace('"', "") == self.etag);

        modified_since || none_match
    }
}

/// Removes backslash escapes: `\"` becomes `"` and `\\` becomes `\`.
pub fn strip_slashes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }

    out
}

/// Drops markup tags and comments from `s`, keeping the text between them.
///
/// A `<` followed by whitespace is text, and a `>` outside a tag is kept, so CSS
/// child combinators survive. A `<` ending the input opens a tag and is dropped.
pub fn strip_tags(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];

        let starts_tag = tail[1..].chars().next().is_none_or(|c| !c.is_whitespace());
        if !starts_tag {
            out.push('<');
            rest = &tail[1..];
            continue;
        }

        if let Some(comment) = tail.strip_prefix("<!--") {
            rest = match comment.find("-->") {
                Some(end) => &comment[end + 3..],
                None => "",
            };
            continue;
        }

        rest = match tag_end(tail) {
            Some(end) => &tail[end + 1..],
            None => "",
        };
    }

    out.push_str(rest);
    out
}

/// Byte offset of the `>` closing the tag that opens `tail`, honoring quotes and nesting.
fn tag_end(tail: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for (i, c) in tail.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') if depth > 0 => quote = Some(c),
            (None, '<') => depth += 1,
            (None, '>') => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(modified_gmt: &str) -> CustomCssPost {
        CustomCssPost {
            id: 7,
            theme: "mytheme".to_string(),
            css: "body{color:red}".to_string(),
            modified_gmt: modified_gmt.to_string(),
        }
    }

    #[test]
    fn test_last_modified_falls_back_to_sentinel() {
        assert_eq!(last_modified(None), SENTINEL_LAST_MODIFIED);
        assert_eq!(last_modified(None), last_modified(None));
        assert_eq!(last_modified(Some(&post("garbage"))), SENTINEL_LAST_MODIFIED);
        assert_eq!(last_modified(Some(&post("2017-03-04 12:30:00"))), 1488630600);
    }

    #[test]
    fn test_etag_is_deterministic() {
        let tag = etag(1488630600, "mytheme");

        assert_eq!(tag.len(), 32);
        assert!(tag.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(tag, etag(1488630600, "mytheme"));
        assert_ne!(tag, etag(1488630601, "mytheme"));
        assert_ne!(tag, etag(1488630600, "othertheme"));
    }

    #[test]
    fn test_etag_is_truncated_sha256() {
        let tag = etag(SENTINEL_LAST_MODIFIED, "mytheme");

        assert_eq!(tag, "901a46ab407796796ac4c27d4b192f9e");
        // md5 of the same input
        assert_ne!(tag, "7a4b885374a2121097cbb4c6319d106e");
    }

    #[test]
    fn test_http_date() {
        assert_eq!(http_date(SENTINEL_LAST_MODIFIED), "Sat, 01 Jan 2000 00:00:00 GMT");
        assert_eq!(http_date(1488630600), "Sat, 04 Mar 2017 12:30:00 GMT");
    }

    #[test]
    fn test_headers() {
        let validators = Validators::new(SENTINEL_LAST_MODIFIED, "mytheme");
        let headers: HeaderMap = validators.headers().unwrap().into_iter().collect();

        assert_eq!(headers["x-robots-tag"], "noindex, follow");
        assert_eq!(headers[CONTENT_TYPE], "text/css");
        assert_eq!(headers[CONTENT_DISPOSITION], "inline; filename=\"custom.css\"");
        assert_eq!(headers[CACHE_CONTROL], "public");
        assert_eq!(headers[ETAG], format!("\"{}\"", validators.etag).as_str());
        assert_eq!(headers[LAST_MODIFIED], "Sat, 01 Jan 2000 00:00:00 GMT");
    }

    #[test]
    fn test_matches_if_modified_since_exactly() {
        let validators = Validators::new(1488630600, "mytheme");
        let mut inbound = HeaderMap::new();

        inbound.insert(IF_MODIFIED_SINCE, HeaderValue::from_static("Sat, 04 Mar 2017 12:30:00 GMT"));
        assert!(validators.matches(&inbound));

        // Semantically later but textually different dates do not count.
        inbound.insert(IF_MODIFIED_SINCE, HeaderValue::from_static("Sun, 05 Mar 2017 12:30:00 GMT"));
        assert!(!validators.matches(&inbound));
    }

    #[test]
    fn test_matches_if_none_match() {
        let validators = Validators::new(1488630600, "mytheme");
        let mut inbound = HeaderMap::new();

        for value in [
            format!("\"{}\"", validators.etag),
            validators.etag.clone(),
            format!("\\\"{}\\\"", validators.etag),
        ] {
            inbound.insert(IF_NONE_MATCH, HeaderValue::from_str(&value).unwrap());
            assert!(validators.matches(&inbound), "value {}", value);
        }

        inbound.insert(IF_NONE_MATCH, HeaderValue::from_static("\"deadbeef\""));
        assert!(!validators.matches(&inbound));
        inbound.insert(IF_NONE_MATCH, HeaderValue::from_static("*"));
        assert!(!validators.matches(&inbound));
    }

    #[test]
    fn test_unreadable_headers_do_not_match() {
        let validators = Validators::new(1488630600, "mytheme");
        let mut inbound = HeaderMap::new();
        inbound.insert(IF_NONE_MATCH, HeaderValue::from_bytes(b"\xff\xfe").unwrap());

        assert!(!validators.matches(&inbound));
        assert!(!validators.matches(&HeaderMap::new()));
    }

    #[test]
    fn test_strip_slashes() {
        assert_eq!(strip_slashes(r#"\"abc\""#), "\"abc\"");
        assert_eq!(strip_slashes(r"a\\b"), r"a\b");
        assert_eq!(strip_slashes(r"trailing\"), "trailing");
    }

    #[test]
    fn test_strip_tags() {
        assert_eq!(
            strip_tags("</style><script>alert(1)</script>body{color:red}"),
            "alert(1)body{color:red}"
        );
        assert_eq!(strip_tags("ul > li { margin: 0 }"), "ul > li { margin: 0 }");
        assert_eq!(strip_tags("a < b"), "a < b");
        assert_eq!(strip_tags("p{}<!-- hidden <b> -->h1{}"), "p{}h1{}");
        assert_eq!(strip_tags("<a title=\"x>y\">link</a>"), "link");
        assert_eq!(strip_tags("body{}<unterminated"), "body{}");
        assert_eq!(strip_tags("body{}<"), "body{}");
        assert_eq!(strip_tags("a <\nb"), "a <\nb");
        assert_eq!(strip_tags("body{color:red}"), "body{color:red}");
    }
}
