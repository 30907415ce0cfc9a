//! Stylesheet redirector.
//!
//! Moves a theme's custom CSS out of the page head and into a virtual
//! stylesheet served at `/custom.css`:
//!
//! - pages stop inlining the CSS and enqueue the stylesheet URL instead, except
//!   in the customizer preview where unsaved edits must show up immediately
//! - requests routed to the stylesheet are answered with the CSS itself, with
//!   ETag and Last-Modified validators so browsers can revalidate cheaply
//!
//! The [`Outsourcer`] is built once at start-up. Its methods are wired to the
//! site through [`Outsourcer::add_hooks`] and never touch global state.

use axum::http::StatusCode;
use semver::Version;

use crate::config::{self, Permalinks};
use crate::db::Database;
use crate::error::SiteError;
use crate::hooks::{Callback, CoreHook, HookRegistry, RedirectorHook, Stage};
use crate::request::{Flow, Query, RequestContext, StyleQueue};
use crate::rewrite::{Position, QueryVars, Rewrite};
use crate::stylesheet::{self, FILE_NAME, Validators};

/// Query var set on requests routed to the virtual stylesheet.
pub const QUERY_VAR: &str = "custom_css_file";

/// Handle of the queued stylesheet.
pub const FILE_HANDLE: &str = "wp-custom";

/// Oldest host version the redirector hooks into.
pub const MIN_HOST_VERSION: &str = "4.7-beta";

/// Rewrite pattern of the virtual stylesheet.
pub fn rewrite_pattern() -> String {
    format!("{}$", FILE_NAME.replace('.', r"\."))
}

pub fn rewrite_query() -> String {
    format!("index.php?{}=1", QUERY_VAR)
}

/// Parses loose versions such as `6.4`, `4.7-beta`, `4.7-RC1-39480` or `6.4.2`,
/// padding missing components with zeros.
///
/// The pre-release tag is rewritten into numeric identifiers by
/// [`pre_release_identifiers`], so `dev < alpha < beta < RC` holds whatever the
/// spelling.
pub fn parse_host_version(version: &str) -> Option<Version> {
    let version = version.trim();
    let (numbers, pre) = match version.split_once('-') {
        Some((numbers, pre)) => (numbers, Some(pre)),
        None => (version, None),
    };

    let mut parts: Vec<&str> = numbers.split('.').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    while parts.len() < 3 {
        parts.push("0");
    }

    let normalized = match pre {
        Some(pre) => format!("{}-{}", parts.join("."), pre_release_identifiers(pre)?),
        None => parts.join("."),
    };
    Version::parse(&normalized).ok()
}

/// Rank of a pre-release word; unknown words sort below `dev`.
fn pre_release_rank(word: &str) -> u64 {
    match word.to_ascii_lowercase().as_str() {
        "dev" => 1,
        "alpha" | "a" => 2,
        "beta" | "b" => 3,
        "rc" => 4,
        _ => 0,
    }
}

/// Turns `RC1-39480` into `4.1.39480`: words become their rank, digit runs
/// stay numbers, and separators or letter/digit boundaries split identifiers.
fn pre_release_identifiers(pre: &str) -> Option<String> {
    let mut identifiers = Vec::new();
    let mut rest = pre;

    while let Some(c) = rest.chars().next() {
        if matches!(c, '-' | '.' | '_' | '+') {
            rest = &rest[1..];
            continue;
        }

        let digits = c.is_ascii_digit();
        let end = rest
            .find(|ch: char| ch.is_ascii_digit() != digits || matches!(ch, '-' | '.' | '_' | '+'))
            .unwrap_or(rest.len());
        let (run, tail) = rest.split_at(end);

        if digits {
            identifiers.push(run.parse::<u64>().ok()?.to_string());
        } else {
            identifiers.push(pre_release_rank(run).to_string());
        }
        rest = tail;
    }

    if identifiers.is_empty() {
        None
    } else {
        Some(identifiers.join("."))
    }
}

#[derive(Debug, Clone)]
pub struct Outsourcer {
    stylesheet_url: String,
}

impl Outsourcer {
    pub fn new(site: &config::Site) -> Self {
        Outsourcer {
            stylesheet_url: Self::stylesheet_url(site.home_url(), site.permalinks),
        }
    }

    /// URL of the virtual stylesheet. It has to be one the route table maps to
    /// [`QUERY_VAR`], or the browser's request would render a page instead.
    pub fn stylesheet_url(home_url: &str, permalinks: Permalinks) -> String {
        let segment = if permalinks.using_index_permalinks() {
            "/index.php/"
        } else {
            "/"
        };
        format!("{}{}{}", home_url.trim_end_matches('/'), segment, FILE_NAME)
    }

    pub fn url(&self) -> &str {
        &self.stylesheet_url
    }

    /// Wires the redirector into `hooks`. Must only be called once.
    ///
    /// Hosts older than [`MIN_HOST_VERSION`], or whose version cannot be read,
    /// get no hooks at all. Returns whether the hooks were added.
    pub fn add_hooks(&self, hooks: &mut HookRegistry, host_version: &str) -> bool {
        let Some(min) = parse_host_version(MIN_HOST_VERSION) else {
            return false;
        };

        match parse_host_version(host_version) {
            Some(version) if version >= min => {}
            _ => {
                tracing::warn!(
                    host_version = %host_version,
                    required = MIN_HOST_VERSION,
                    "host too old, stylesheet redirector stays dormant"
                );
                return false;
            }
        }

        use RedirectorHook::*;
        hooks.add(Stage::TemplateRedirect, Callback::Redirector(MaybeOutsourceCss), 1);
        hooks.add(Stage::PreGetPosts, Callback::Redirector(MaybePrintStylesheet), 1);
        hooks.add(Stage::AfterSetupTheme, Callback::Redirector(MaybeReduceQueryLoad), 99);
        hooks.add(Stage::Init, Callback::Redirector(AddQueryVar), 1);
        hooks.add(Stage::Init, Callback::Redirector(AddRewriteRule), 1);
        hooks.add(Stage::RedirectCanonical, Callback::Redirector(FixCanonical), 10);

        tracing::info!(url = %self.stylesheet_url, "stylesheet redirector hooked");
        true
    }

    /// Swaps the inline CSS for the queued stylesheet, unless in a customizer preview.
    pub fn maybe_outsource_css(&self, ctx: &mut RequestContext) {
        if ctx.is_customize_preview() {
            tracing::debug!("customizer preview, keeping custom css inline");
            return;
        }

        ctx.hooks
            .remove(Stage::WpHead, Callback::Core(CoreHook::CustomCss), 11);
        ctx.hooks.add(
            Stage::WpEnqueueScripts,
            Callback::Redirector(RedirectorHook::EnqueueStylesheet),
            11,
        );
    }

    pub fn enqueue_stylesheet(&self, styles: &mut StyleQueue) {
        styles.enqueue(FILE_HANDLE, &self.stylesheet_url);
    }

    /// Answers the request with the stylesheet when the main query carries the route flag.
    pub async fn maybe_print_stylesheet(
        &self,
        query: &Query,
        ctx: &mut RequestContext,
        db: &Database,
    ) -> Result<Flow, SiteError> {
        if !query.is_main_query() {
            return Ok(Flow::Continue);
        }

        if !ctx.is_query_var_set(QUERY_VAR) {
            return Ok(Flow::Continue);
        }

        self.print_stylesheet(ctx, db).await
    }

    /// Builds the stylesheet response and ends the request.
    ///
    /// Validators depend on the active theme and its document's modification
    /// time. A matching conditional request ends with an empty 304. If output
    /// already started no headers are touched and the CSS is appended as is.
    pub async fn print_stylesheet(
        &self,
        ctx: &mut RequestContext,
        db: &Database,
    ) -> Result<Flow, SiteError> {
        let theme = ctx.theme.clone();

        if !ctx.response.headers_sent() {
            let post = db.custom_css_post(&theme, &theme).await?;
            let validators = Validators::new(stylesheet::last_modified(post.as_ref()), &theme);

            for (name, value) in validators.headers()? {
                ctx.response.set_header(name, value);
            }

            if validators.matches(&ctx.headers) {
                tracing::debug!(theme = %theme, etag = %validators.etag, "stylesheet not modified");
                ctx.response.set_status(StatusCode::NOT_MODIFIED);
                return Ok(Flow::Terminate(ctx.response.take()));
            }

            ctx.response.set_status(StatusCode::OK);
        } else {
            tracing::warn!(theme = %theme, "output already started, serving stylesheet without cache headers");
        }

        if let Some(css) = db.custom_css(&theme, &theme).await? {
            ctx.response.echo(&stylesheet::strip_tags(&css));
        }

        ctx.hooks.remove_all(Stage::WpFooter);
        tracing::debug!(theme = %theme, "stylesheet served");
        Ok(Flow::Terminate(ctx.response.take()))
    }

    /// Skips widget registration when the raw request URI mentions the stylesheet.
    pub fn maybe_reduce_query_load(&self, ctx: &mut RequestContext) {
        let Some(uri) = ctx.request_uri.as_deref() else {
            return;
        };

        if !uri.to_ascii_lowercase().contains(FILE_NAME) {
            return;
        }

        ctx.hooks.remove_all(Stage::WidgetsInit);
    }

    /// Makes [`QUERY_VAR`] a recognized query var. Does nothing without a router.
    pub fn add_query_var(&self, router: Option<&mut QueryVars>) {
        let Some(router) = router else {
            return;
        };

        router.add(QUERY_VAR);
    }

    pub fn add_rewrite_rule(&self, rewrite: &mut Rewrite) {
        rewrite.add_rule(&rewrite_pattern(), &rewrite_query(), Position::Top);
    }

    /// Cancels the canonical redirect of stylesheet requests.
    pub fn fix_canonical(&self, ctx: &RequestContext, redirect: Option<String>) -> Option<String> {
        if !ctx.is_query_var_set(QUERY_VAR) {
            return redirect;
        }

        None
    }

    pub fn activate(&self, rewrite: &mut Rewrite) {
        self.add_rewrite_rule(rewrite);
        rewrite.flush();
    }

    pub fn deactivate(&self, rewrite: &mut Rewrite) {
        rewrite.remove_rule(&rewrite_pattern());
        rewrite.flush();
    }
}
