//! The site: fires every [`Stage`] of a request in order and renders pages.

use std::sync::{Arc, RwLock};

use axum::http::{HeaderValue, Method, StatusCode, header};

use crate::config;
use crate::db::Database;
use crate::error::SiteError;
use crate::hooks::{Callback, CoreHook, DEFAULT_PRIORITY, HookRegistry, RedirectorHook, Stage};
use crate::outsourcer::{Outsourcer, rewrite_pattern};
use crate::request::{Flow, Query, RequestContext, SiteRequest, SiteResponse};
use crate::rewrite::Rewrite;
use crate::stylesheet::strip_tags;

/// Version reported by the site to its extensions.
pub const HOST_VERSION: &str = "4.7.0";

const RECENT_POSTS_WIDGET: &str = "recent-posts";

pub struct Site {
    db: Arc<Database>,
    settings: config::Site,
    hooks: HookRegistry,
    rewrite: RwLock<Rewrite>,
    outsourcer: Option<Outsourcer>,
}

impl Site {
    pub fn new(db: Arc<Database>, settings: config::Site) -> Self {
        let mut hooks = HookRegistry::new();
        hooks.add(Stage::WidgetsInit, Callback::Core(CoreHook::RegisterWidgets), DEFAULT_PRIORITY);
        hooks.add(Stage::WpHead, Callback::Core(CoreHook::CustomCss), 11);
        hooks.add(Stage::WpFooter, Callback::Core(CoreHook::FooterCredits), 20);

        let rewrite = RwLock::new(Rewrite::new(settings.permalinks));

        Site {
            db,
            settings,
            hooks,
            rewrite,
            outsourcer: None,
        }
    }

    pub fn settings(&self) -> &config::Site {
        &self.settings
    }

    /// Activates the redirector, or deactivates it when `enabled` is false.
    ///
    /// Activation registers the stylesheet route and flushes the route table
    /// even when the host version keeps the redirector's hooks dormant.
    pub fn install(&mut self, outsourcer: Outsourcer, enabled: bool) -> Result<(), SiteError> {
        let mut rewrite = self
            .rewrite
            .write()
            .map_err(|e| SiteError::Lock(e.to_string()))?;

        if !enabled {
            outsourcer.deactivate(&mut rewrite);
            tracing::info!("stylesheet redirector deactivated");
            return Ok(());
        }

        outsourcer.activate(&mut rewrite);
        if outsourcer.add_hooks(&mut self.hooks, &self.settings.host_version) {
            self.outsourcer = Some(outsourcer);
        }
        Ok(())
    }

    /// Whether the stylesheet route is part of the active route table.
    pub fn is_route_active(&self) -> Result<bool, SiteError> {
        let rewrite = self
            .rewrite
            .read()
            .map_err(|e| SiteError::Lock(e.to_string()))?;
        Ok(rewrite.is_active(&rewrite_pattern()))
    }

    pub async fn handle(&self, req: SiteRequest) -> Result<SiteResponse, SiteError> {
        let mut ctx = RequestContext::new(req, self.hooks.clone(), &self.settings.theme);

        for stage in [Stage::AfterSetupTheme, Stage::Init, Stage::WidgetsInit] {
            if let Flow::Terminate(response) = self.do_action(stage, &mut ctx, None).await? {
                return Ok(response);
            }
        }

        self.parse_request(&mut ctx)?;

        let main = Query::main();
        if let Flow::Terminate(response) = self.do_action(Stage::PreGetPosts, &mut ctx, Some(&main)).await? {
            return Ok(response);
        }

        if let Some(location) = self.redirect_canonical(&ctx) {
            tracing::debug!(from = %ctx.path, to = %location, "canonical redirect");
            let mut response = SiteResponse {
                status: StatusCode::MOVED_PERMANENTLY,
                ..SiteResponse::default()
            };
            response
                .headers
                .insert(header::LOCATION, HeaderValue::from_str(&location)?);
            return Ok(response);
        }

        if let Flow::Terminate(response) = self.do_action(Stage::TemplateRedirect, &mut ctx, None).await? {
            return Ok(response);
        }

        self.render_page(&mut ctx).await
    }

    fn parse_request(&self, ctx: &mut RequestContext) -> Result<(), SiteError> {
        let rewrite = self
            .rewrite
            .read()
            .map_err(|e| SiteError::Lock(e.to_string()))?;

        let Some(router) = ctx.router.as_ref() else {
            return Ok(());
        };

        ctx.query_vars = rewrite.parse_request(
            &ctx.path,
            ctx.query_string.as_deref(),
            self.settings.base_path(),
            router,
        );
        Ok(())
    }

    /// Canonical URL for the request, after the `RedirectCanonical` filter.
    ///
    /// Pretty URLs are canonical with a trailing slash.
    fn redirect_canonical(&self, ctx: &RequestContext) -> Option<String> {
        if ctx.method != Method::GET && ctx.method != Method::HEAD {
            return None;
        }

        let mut candidate = None;
        if self.settings.trailing_slash && self.settings.permalinks.using_rewrite_rules() {
            let relative = ctx
                .path
                .strip_prefix(self.settings.base_path())
                .unwrap_or(&ctx.path);
            if !relative.is_empty() && relative != "/" && !relative.ends_with('/') {
                let query = ctx
                    .query_string
                    .as_deref()
                    .map(|q| format!("?{}", q))
                    .unwrap_or_default();
                candidate = Some(format!("{}{}/{}", self.settings.home_url(), relative, query));
            }
        }

        for callback in ctx.hooks.callbacks(Stage::RedirectCanonical) {
            if let (Callback::Redirector(RedirectorHook::FixCanonical), Some(outsourcer)) =
                (callback, &self.outsourcer)
            {
                candidate = outsourcer.fix_canonical(ctx, candidate);
            }
        }

        candidate.filter(|url| !url.is_empty())
    }

    async fn do_action(
        &self,
        stage: Stage,
        ctx: &mut RequestContext,
        query: Option<&Query>,
    ) -> Result<Flow, SiteError> {
        for callback in ctx.hooks.callbacks(stage) {
            if let Flow::Terminate(response) = self.dispatch(callback, ctx, query).await? {
                return Ok(Flow::Terminate(response));
            }
        }
        Ok(Flow::Continue)
    }

    async fn dispatch(
        &self,
        callback: Callback,
        ctx: &mut RequestContext,
        query: Option<&Query>,
    ) -> Result<Flow, SiteError> {
        match callback {
            Callback::Core(hook) => self.run_core(hook, ctx).await,
            Callback::Redirector(hook) => match &self.outsourcer {
                Some(outsourcer) => self.run_redirector(outsourcer, hook, ctx, query).await,
                None => Ok(Flow::Continue),
            },
        }
    }

    async fn run_core(&self, hook: CoreHook, ctx: &mut RequestContext) -> Result<Flow, SiteError> {
        match hook {
            CoreHook::RegisterWidgets => ctx.widgets.push(RECENT_POSTS_WIDGET),
            CoreHook::CustomCss => {
                let theme = ctx.theme.clone();
                let css = self.db.custom_css(&theme, &theme).await?.unwrap_or_default();
                if !css.is_empty() {
                    ctx.response.echo(&format!(
                        "<style type=\"text/css\" id=\"wp-custom-css\">\n{}\n</style>\n",
                        strip_tags(&css)
                    ));
                }
            }
            CoreHook::FooterCredits => ctx.response.echo("<footer>Proudly self-hosted</footer>\n"),
        }
        Ok(Flow::Continue)
    }

    async fn run_redirector(
        &self,
        outsourcer: &Outsourcer,
        hook: RedirectorHook,
        ctx: &mut RequestContext,
        query: Option<&Query>,
    ) -> Result<Flow, SiteError> {
        match hook {
            RedirectorHook::MaybeReduceQueryLoad => outsourcer.maybe_reduce_query_load(ctx),
            RedirectorHook::AddQueryVar => outsourcer.add_query_var(ctx.router.as_mut()),
            RedirectorHook::AddRewriteRule => {
                let registered = self
                    .rewrite
                    .read()
                    .map_err(|e| SiteError::Lock(e.to_string()))?
                    .has_rule(&rewrite_pattern());
                if !registered {
                    let mut rewrite = self
                        .rewrite
                        .write()
                        .map_err(|e| SiteError::Lock(e.to_string()))?;
                    outsourcer.add_rewrite_rule(&mut rewrite);
                }
            }
            RedirectorHook::MaybePrintStylesheet => {
                if let Some(query) = query {
                    return outsourcer.maybe_print_stylesheet(query, ctx, &self.db).await;
                }
            }
            // Filters run through `redirect_canonical`.
            RedirectorHook::FixCanonical => {}
            RedirectorHook::MaybeOutsourceCss => outsourcer.maybe_outsource_css(ctx),
            RedirectorHook::EnqueueStylesheet => outsourcer.enqueue_stylesheet(&mut ctx.styles),
        }
        Ok(Flow::Continue)
    }

    async fn render_page(&self, ctx: &mut RequestContext) -> Result<SiteResponse, SiteError> {
        ctx.response.set_status(StatusCode::OK);
        ctx.response.set_header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=UTF-8"),
        );

        if let Flow::Terminate(response) = self.do_action(Stage::WpEnqueueScripts, ctx, None).await? {
            return Ok(response);
        }

        ctx.response.echo("<!doctype html>\n<html>\n<head>\n");
        let links: Vec<String> = ctx
            .styles
            .iter()
            .map(|s| {
                format!(
                    "<link rel=\"stylesheet\" id=\"{}-css\" href=\"{}\" type=\"text/css\" media=\"all\" />\n",
                    s.handle, s.url
                )
            })
            .collect();
        for link in links {
            ctx.response.echo(&link);
        }

        if let Flow::Terminate(response) = self.do_action(Stage::WpHead, ctx, None).await? {
            return Ok(response);
        }
        ctx.response.echo("</head>\n<body>\n");

        let title = ctx
            .get_query_var("pagename")
            .map(|p| p.to_string())
            .unwrap_or_else(|| "home".to_string());
        ctx.response.echo(&format!("<main><h1>{}</h1></main>\n", escape_html(&title)));

        for widget in ctx.widgets.clone() {
            let secondary = Query::secondary();
            if let Flow::Terminate(response) =
                self.do_action(Stage::PreGetPosts, ctx, Some(&secondary)).await?
            {
                return Ok(response);
            }
            ctx.response
                .echo(&format!("<aside class=\"widget widget-{}\"></aside>\n", widget));
        }

        if let Flow::Terminate(response) = self.do_action(Stage::WpFooter, ctx, None).await? {
            return Ok(response);
        }
        ctx.response.echo("</body>\n</html>\n");

        Ok(ctx.response.take())
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Permalinks;

    async fn site(settings: config::Site, enabled: bool) -> (Site, Arc<Database>) {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let mut site = Site::new(db.clone(), settings.clone());
        site.install(Outsourcer::new(&settings), enabled).unwrap();
        (site, db)
    }

    fn settings() -> config::Site {
        config::Site {
            url: "http://example.com".to_string(),
            theme: "mytheme".to_string(),
            ..config::Site::default()
        }
    }

    #[tokio::test]
    async fn test_page_references_external_stylesheet() {
        let (site, db) = site(settings(), true).await;
        db.upsert_custom_css("mytheme", "body{color:red}").await.unwrap();

        let response = site.handle(SiteRequest::get("/about/")).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert!(response.body.contains(
            "<link rel=\"stylesheet\" id=\"wp-custom-css\" href=\"http://example.com/custom.css\""
        ));
        assert!(!response.body.contains("body{color:red}"));
        assert!(response.body.contains("widget-recent-posts"));
        assert!(response.body.contains("<footer>"));
    }

    #[tokio::test]
    async fn test_preview_keeps_inline_css() {
        let (site, db) = site(settings(), true).await;
        db.upsert_custom_css("mytheme", "body{color:red}").await.unwrap();

        let response = site
            .handle(SiteRequest::get("/about/?customize_changeset_uuid=42"))
            .await
            .unwrap();

        assert!(response.body.contains("<style type=\"text/css\" id=\"wp-custom-css\">"));
        assert!(response.body.contains("body{color:red}"));
        assert!(!response.body.contains("custom.css"));
    }

    #[tokio::test]
    async fn test_disabled_redirector_inlines_css() {
        let (site, db) = site(settings(), false).await;
        db.upsert_custom_css("mytheme", "body{color:red}").await.unwrap();

        assert!(!site.is_route_active().unwrap());
        let response = site.handle(SiteRequest::get("/about/")).await.unwrap();
        assert!(response.body.contains("body{color:red}"));
    }

    #[tokio::test]
    async fn test_dormant_on_old_host() {
        let mut old = settings();
        old.host_version = "4.6.1".to_string();
        let (site, db) = site(old, true).await;
        db.upsert_custom_css("mytheme", "body{color:red}").await.unwrap();

        let response = site.handle(SiteRequest::get("/about/")).await.unwrap();
        assert!(response.body.contains("<style type=\"text/css\" id=\"wp-custom-css\">"));

        // Without the query var hook the flag never survives parsing.
        let response = site.handle(SiteRequest::get("/?custom_css_file=1")).await.unwrap();
        assert!(response.body.starts_with("<!doctype html>"));
    }

    #[tokio::test]
    async fn test_stylesheet_is_not_canonically_redirected() {
        let (site, db) = site(settings(), true).await;
        db.upsert_custom_css("mytheme", "body{color:red}").await.unwrap();

        let response = site.handle(SiteRequest::get("/custom.css")).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, "body{color:red}");

        let response = site.handle(SiteRequest::get("/about")).await.unwrap();
        assert_eq!(response.status, StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers[header::LOCATION], "http://example.com/about/");
    }

    #[tokio::test]
    async fn test_index_permalinks() {
        let mut index = settings();
        index.permalinks = Permalinks::Index;
        let (site, db) = site(index, true).await;
        db.upsert_custom_css("mytheme", "p{}").await.unwrap();

        let page = site.handle(SiteRequest::get("/index.php/about/")).await.unwrap();
        assert!(page.body.contains("href=\"http://example.com/index.php/custom.css\""));

        let css = site.handle(SiteRequest::get("/index.php/custom.css")).await.unwrap();
        assert_eq!(css.body, "p{}");
    }

    #[tokio::test]
    async fn test_plain_permalinks_use_query_string() {
        let mut plain = settings();
        plain.permalinks = Permalinks::Plain;
        let (site, db) = site(plain, true).await;
        db.upsert_custom_css("mytheme", "p{}").await.unwrap();

        let css = site.handle(SiteRequest::get("/?custom_css_file=1")).await.unwrap();
        assert_eq!(css.headers[header::CONTENT_TYPE], "text/css");
        assert_eq!(css.body, "p{}");
    }
}
