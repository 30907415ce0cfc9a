use std::collections::HashMap;

use regex_lite::Regex;

use crate::config::Permalinks;

const INDEX: &str = "index.php";

/// Query vars the site recognizes before any callback adds its own.
const CORE_QUERY_VARS: &[&str] = &["p", "page", "paged", "pagename", "s"];

/// Rules the site generates on every flush, after the top rules.
const CORE_RULES: &[(&str, &str)] = &[
    (r"^page/?([0-9]{1,})/?$", "index.php?paged=$1"),
    (r"^(.+?)(?:/([0-9]+))?/?$", "index.php?pagename=$1&page=$2"),
];

/// Where an extra rule lands relative to the site's own rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Top,
    Bottom,
}

/// Query vars a request may set, either through its query string or a matched rule.
#[derive(Debug, Clone)]
pub struct QueryVars {
    public: Vec<String>,
}

impl Default for QueryVars {
    fn default() -> Self {
        QueryVars {
            public: CORE_QUERY_VARS.iter().map(|v| v.to_string()).collect(),
        }
    }
}

impl QueryVars {
    pub fn add(&mut self, name: &str) {
        if !self.contains(name) {
            self.public.push(name.to_string());
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.public.iter().any(|v| v == name)
    }
}

#[derive(Debug, Clone)]
struct Rule {
    regex: Regex,
    query: String,
}

impl Rule {
    fn compile(pattern: &str, query: &str) -> Option<Rule> {
        match Regex::new(pattern) {
            Ok(regex) => Some(Rule {
                regex,
                query: query.to_string(),
            }),
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "skipping invalid rewrite rule");
                None
            }
        }
    }

    /// Query string of the rule with `$n` replaced by the n-th capture, if `path` matches.
    fn apply(&self, path: &str) -> Option<String> {
        let caps = self.regex.captures(path)?;
        let mut query = self.query.clone();

        for i in (1..caps.len()).rev() {
            let value = caps.get(i).map(|m| m.as_str()).unwrap_or("");
            query = query.replace(&format!("${}", i), value);
        }

        Some(query)
    }
}

/// The site's route table.
///
/// Rules added with [`Rewrite::add_rule`] are only registered; requests are
/// matched against the table produced by the last [`Rewrite::flush`]. A table
/// that was never flushed is generated on the fly.
#[derive(Debug)]
pub struct Rewrite {
    permalinks: Permalinks,
    extra_rules_top: Vec<(String, String)>,
    extra_rules: Vec<(String, String)>,
    rules: Option<Vec<Rule>>,
}

impl Rewrite {
    pub fn new(permalinks: Permalinks) -> Self {
        Rewrite {
            permalinks,
            extra_rules_top: Vec::new(),
            extra_rules: Vec::new(),
            rules: None,
        }
    }

    /// Registers `pattern -> query`. A pattern maps to a single query: adding it
    /// again replaces the previous query in place.
    pub fn add_rule(&mut self, pattern: &str, query: &str, position: Position) {
        let rules = match position {
            Position::Top => &mut self.extra_rules_top,
            Position::Bottom => &mut self.extra_rules,
        };

        match rules.iter_mut().find(|(p, _)| p == pattern) {
            Some(existing) => existing.1 = query.to_string(),
            None => rules.push((pattern.to_string(), query.to_string())),
        }
    }

    pub fn has_rule(&self, pattern: &str) -> bool {
        self.extra_rules_top
            .iter()
            .chain(self.extra_rules.iter())
            .any(|(p, _)| p == pattern)
    }

    pub fn remove_rule(&mut self, pattern: &str) -> bool {
        let before = self.extra_rules_top.len() + self.extra_rules.len();
        self.extra_rules_top.retain(|(p, _)| p != pattern);
        self.extra_rules.retain(|(p, _)| p != pattern);
        before != self.extra_rules_top.len() + self.extra_rules.len()
    }

    fn generate(&self) -> Vec<Rule> {
        let core = CORE_RULES.iter().map(|(p, q)| (p.to_string(), q.to_string()));

        self.extra_rules_top
            .iter()
            .cloned()
            .chain(core)
            .chain(self.extra_rules.iter().cloned())
            .filter_map(|(pattern, query)| Rule::compile(&pattern, &query))
            .collect()
    }

    /// Rebuilds the active route table from the registered rules.
    pub fn flush(&mut self) {
        let rules = self.generate();
        tracing::info!(rules = rules.len(), "rewrite rules flushed");
        self.rules = Some(rules);
    }

    /// Whether `pattern` is part of the active route table.
    pub fn is_active(&self, pattern: &str) -> bool {
        match &self.rules {
            Some(rules) => rules.iter().any(|r| r.regex.as_str() == pattern),
            None => self.has_rule(pattern),
        }
    }

    /// Query string of the first active rule matching `path`.
    pub fn match_path(&self, path: &str) -> Option<String> {
        match &self.rules {
            Some(rules) => rules.iter().find_map(|r| r.apply(path)),
            None => self.generate().iter().find_map(|r| r.apply(path)),
        }
    }

    /// Resolves the query vars of a request.
    ///
    /// `path` is the raw request path; `base_path` the path of the site URL.
    /// Query-string values win over values from a matched rule, and only vars
    /// known to `public` are kept.
    pub fn parse_request(
        &self,
        path: &str,
        query: Option<&str>,
        base_path: &str,
        public: &QueryVars,
    ) -> HashMap<String, String> {
        let relative = path.strip_prefix(base_path).unwrap_or(path);
        let relative = relative.trim_matches('/');
        let relative = relative
            .strip_prefix(INDEX)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(relative);

        let mut perma_vars = HashMap::new();
        if self.permalinks.using_rewrite_rules() && !relative.is_empty() {
            if let Some(matched) = self.match_path(relative) {
                let matched = matched
                    .split_once('?')
                    .map(|(_, q)| q.to_string())
                    .unwrap_or(matched);
                perma_vars = parse_query_string(&matched);
            }
        }

        let get_vars = query.map(parse_query_string).unwrap_or_default();

        let mut vars = HashMap::new();
        for name in &public.public {
            let value = get_vars.get(name).or_else(|| perma_vars.get(name));
            if let Some(value) = value {
                vars.insert(name.clone(), value.clone());
            }
        }
        vars
    }
}

/// Decodes `a=1&b=two%20words` into pairs. Later duplicates win.
pub fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode(key), decode(value))
        })
        .collect()
}

fn decode(s: &str) -> String {
    let s = s.replace('+', " ");
    urlencoding::decode(&s)
        .map(|v| v.into_owned())
        .unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSS_RULE: &str = r"custom\.css$";
    const CSS_QUERY: &str = "index.php?custom_css_file=1";

    fn public_with_flag() -> QueryVars {
        let mut vars = QueryVars::default();
        vars.add("custom_css_file");
        vars
    }

    #[test]
    fn test_top_rule_wins_over_catch_all() {
        let mut rewrite = Rewrite::new(Permalinks::Pretty);
        rewrite.add_rule(CSS_RULE, CSS_QUERY, Position::Top);
        rewrite.flush();

        let vars = rewrite.parse_request("/custom.css", None, "", &public_with_flag());
        assert_eq!(vars.get("custom_css_file").map(String::as_str), Some("1"));
        assert!(!vars.contains_key("pagename"));
    }

    #[test]
    fn test_bottom_rule_loses_to_catch_all() {
        let mut rewrite = Rewrite::new(Permalinks::Pretty);
        rewrite.add_rule(CSS_RULE, CSS_QUERY, Position::Bottom);
        rewrite.flush();

        let vars = rewrite.parse_request("/custom.css", None, "", &public_with_flag());
        assert_eq!(vars.get("pagename").map(String::as_str), Some("custom.css"));
        assert!(!vars.contains_key("custom_css_file"));
    }

    #[test]
    fn test_rule_inactive_until_flushed() {
        let mut rewrite = Rewrite::new(Permalinks::Pretty);
        rewrite.flush();
        rewrite.add_rule(CSS_RULE, CSS_QUERY, Position::Top);

        assert!(rewrite.has_rule(CSS_RULE));
        assert!(!rewrite.is_active(CSS_RULE));
        let vars = rewrite.parse_request("/custom.css", None, "", &public_with_flag());
        assert!(!vars.contains_key("custom_css_file"));

        rewrite.flush();
        assert!(rewrite.is_active(CSS_RULE));
    }

    #[test]
    fn test_never_flushed_table_is_generated() {
        let mut rewrite = Rewrite::new(Permalinks::Pretty);
        rewrite.add_rule(CSS_RULE, CSS_QUERY, Position::Top);

        let vars = rewrite.parse_request("/custom.css", None, "", &public_with_flag());
        assert_eq!(vars.get("custom_css_file").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_add_rule_is_idempotent() {
        let mut rewrite = Rewrite::new(Permalinks::Pretty);
        rewrite.add_rule(CSS_RULE, CSS_QUERY, Position::Top);
        rewrite.add_rule(CSS_RULE, CSS_QUERY, Position::Top);
        rewrite.flush();

        assert_eq!(rewrite.generate().len(), CORE_RULES.len() + 1);
        assert!(rewrite.remove_rule(CSS_RULE));
        assert!(!rewrite.has_rule(CSS_RULE));
    }

    #[test]
    fn test_index_prefix_and_base_path_are_stripped() {
        let mut rewrite = Rewrite::new(Permalinks::Index);
        rewrite.add_rule(CSS_RULE, CSS_QUERY, Position::Top);
        rewrite.flush();

        let vars = rewrite.parse_request("/blog/index.php/custom.css", None, "/blog", &public_with_flag());
        assert_eq!(vars.get("custom_css_file").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_plain_permalinks_ignore_rules() {
        let mut rewrite = Rewrite::new(Permalinks::Plain);
        rewrite.add_rule(CSS_RULE, CSS_QUERY, Position::Top);
        rewrite.flush();

        let public = public_with_flag();
        assert!(rewrite.parse_request("/custom.css", None, "", &public).is_empty());

        let vars = rewrite.parse_request("/", Some("custom_css_file=1"), "", &public);
        assert_eq!(vars.get("custom_css_file").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_unknown_vars_are_dropped() {
        let rewrite = Rewrite::new(Permalinks::Pretty);
        let vars = rewrite.parse_request("/", Some("custom_css_file=1&s=red+shoes"), "", &QueryVars::default());

        assert!(!vars.contains_key("custom_css_file"));
        assert_eq!(vars.get("s").map(String::as_str), Some("red shoes"));
    }

    #[test]
    fn test_query_string_wins_over_rule() {
        let mut rewrite = Rewrite::new(Permalinks::Pretty);
        rewrite.add_rule(CSS_RULE, CSS_QUERY, Position::Top);

        let vars = rewrite.parse_request("/custom.css", Some("custom_css_file=0"), "", &public_with_flag());
        assert_eq!(vars.get("custom_css_file").map(String::as_str), Some("0"));
    }
}
