use std::collections::HashMap;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};

use crate::hooks::HookRegistry;
use crate::rewrite::{QueryVars, parse_query_string};

/// Query parameter present while a page renders inside the customizer preview.
pub const CUSTOMIZE_PREVIEW_PARAM: &str = "customize_changeset_uuid";

#[derive(Debug, Clone)]
pub struct SiteRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl SiteRequest {
    pub fn get(uri: &str) -> Self {
        SiteRequest {
            method: Method::GET,
            uri: uri.parse().unwrap_or_default(),
            headers: HeaderMap::new(),
        }
    }
}

/// What a callback wants the site to do next.
#[derive(Debug)]
pub enum Flow {
    Continue,
    /// Stop handling the request and send this response as is.
    Terminate(SiteResponse),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Query {
    main: bool,
}

impl Query {
    pub fn main() -> Self {
        Query { main: true }
    }

    pub fn secondary() -> Self {
        Query { main: false }
    }

    pub fn is_main_query(&self) -> bool {
        self.main
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueuedStyle {
    pub handle: String,
    pub url: String,
}

#[derive(Debug, Clone, Default)]
pub struct StyleQueue {
    styles: Vec<EnqueuedStyle>,
}

impl StyleQueue {
    /// Queues a stylesheet; a handle already queued keeps its first URL.
    pub fn enqueue(&mut self, handle: &str, url: &str) {
        if self.styles.iter().any(|s| s.handle == handle) {
            return;
        }
        self.styles.push(EnqueuedStyle {
            handle: handle.to_string(),
            url: url.to_string(),
        });
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnqueuedStyle> {
        self.styles.iter()
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.styles.iter().any(|s| s.handle == handle)
    }
}

#[derive(Debug, Default)]
pub struct SiteResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl IntoResponse for SiteResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Response under construction. Headers and status are frozen once output starts.
#[derive(Debug, Default)]
pub struct ResponseBuffer {
    response: SiteResponse,
    headers_sent: bool,
}

impl ResponseBuffer {
    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        if self.headers_sent {
            tracing::warn!(header = %name, "cannot modify header, output already started");
            return;
        }
        self.response.headers.insert(name, value);
    }

    pub fn set_status(&mut self, status: StatusCode) {
        if self.headers_sent {
            tracing::warn!(status = %status, "cannot set status, output already started");
            return;
        }
        self.response.status = status;
    }

    pub fn echo(&mut self, output: &str) {
        if output.is_empty() {
            return;
        }
        self.headers_sent = true;
        self.response.body.push_str(output);
    }

    pub fn status(&self) -> StatusCode {
        self.response.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.response.headers
    }

    pub fn body(&self) -> &str {
        &self.response.body
    }

    pub fn take(&mut self) -> SiteResponse {
        std::mem::take(&mut self.response)
    }
}

/// Everything the site and its callbacks know about the request being handled.
#[derive(Debug)]
pub struct RequestContext {
    pub method: Method,
    pub request_uri: Option<String>,
    pub path: String,
    pub query_string: Option<String>,
    pub headers: HeaderMap,
    /// Slug of the active theme.
    pub theme: String,
    pub hooks: HookRegistry,
    /// Recognized query vars; `None` until the site's router exists.
    pub router: Option<QueryVars>,
    pub query_vars: HashMap<String, String>,
    pub styles: StyleQueue,
    pub widgets: Vec<&'static str>,
    pub response: ResponseBuffer,
}

impl RequestContext {
    pub fn new(req: SiteRequest, hooks: HookRegistry, theme: &str) -> Self {
        let request_uri = req.uri.path_and_query().map(|pq| pq.as_str().to_string());

        RequestContext {
            method: req.method,
            request_uri,
            path: req.uri.path().to_string(),
            query_string: req.uri.query().map(|q| q.to_string()),
            headers: req.headers,
            theme: theme.to_string(),
            hooks,
            router: Some(QueryVars::default()),
            query_vars: HashMap::new(),
            styles: StyleQueue::default(),
            widgets: Vec::new(),
            response: ResponseBuffer::default(),
        }
    }

    pub fn get_query_var(&self, name: &str) -> Option<&str> {
        self.query_vars.get(name).map(String::as_str)
    }

    /// A query var counts as set when it is non-empty and not `"0"`.
    pub fn is_query_var_set(&self, name: &str) -> bool {
        matches!(self.get_query_var(name), Some(v) if !v.is_empty() && v != "0")
    }

    pub fn is_customize_preview(&self) -> bool {
        self.query_string
            .as_deref()
            .map(|q| parse_query_string(q).contains_key(CUSTOMIZE_PREVIEW_PARAM))
            .unwrap_or(false)
    }
}
