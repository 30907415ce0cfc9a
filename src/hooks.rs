//! Extension points fired by the site while it handles a request.
//!
//! A [`HookRegistry`] maps each [`Stage`] to an ordered list of callbacks. The
//! site builds one registry at start-up and every request works on its own clone,
//! so callbacks may add or remove hooks for the rest of that request only.

use std::collections::HashMap;

pub const DEFAULT_PRIORITY: i32 = 10;

/// Stages in the order the site fires them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    AfterSetupTheme,
    Init,
    WidgetsInit,
    /// Fired for the main query and for every secondary query.
    PreGetPosts,
    /// Filter over the canonical redirect target.
    RedirectCanonical,
    TemplateRedirect,
    WpEnqueueScripts,
    WpHead,
    WpFooter,
}

/// Callbacks owned by the site itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreHook {
    RegisterWidgets,
    /// Prints the custom CSS inline in the page head.
    CustomCss,
    FooterCredits,
}

/// Callbacks owned by the stylesheet redirector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectorHook {
    MaybeReduceQueryLoad,
    AddQueryVar,
    AddRewriteRule,
    MaybePrintStylesheet,
    FixCanonical,
    MaybeOutsourceCss,
    EnqueueStylesheet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callback {
    Core(CoreHook),
    Redirector(RedirectorHook),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Registration {
    priority: i32,
    callback: Callback,
}

#[derive(Debug, Clone, Default)]
pub struct HookRegistry {
    hooks: HashMap<Stage, Vec<Registration>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` on `stage`. Registering the same callback at the same
    /// priority twice has no effect. Callbacks sharing a priority run in
    /// registration order.
    pub fn add(&mut self, stage: Stage, callback: Callback, priority: i32) {
        let entries = self.hooks.entry(stage).or_default();
        let registration = Registration { priority, callback };

        if entries.contains(&registration) {
            return;
        }

        let at = entries
            .iter()
            .position(|r| r.priority > priority)
            .unwrap_or(entries.len());
        entries.insert(at, registration);
    }

    pub fn remove(&mut self, stage: Stage, callback: Callback, priority: i32) -> bool {
        let Some(entries) = self.hooks.get_mut(&stage) else {
            return false;
        };

        let before = entries.len();
        entries.retain(|r| !(r.callback == callback && r.priority == priority));
        before != entries.len()
    }

    pub fn remove_all(&mut self, stage: Stage) {
        self.hooks.remove(&stage);
    }

    pub fn priority_of(&self, stage: Stage, callback: Callback) -> Option<i32> {
        self.hooks
            .get(&stage)?
            .iter()
            .find(|r| r.callback == callback)
            .map(|r| r.priority)
    }

    pub fn has(&self, stage: Stage, callback: Callback) -> bool {
        self.priority_of(stage, callback).is_some()
    }

    /// Snapshot of the callbacks of `stage` in execution order.
    pub fn callbacks(&self, stage: Stage) -> Vec<Callback> {
        self.hooks
            .get(&stage)
            .map(|entries| entries.iter().map(|r| r.callback).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAD: Callback = Callback::Core(CoreHook::CustomCss);
    const ENQUEUE: Callback = Callback::Redirector(RedirectorHook::EnqueueStylesheet);
    const CREDITS: Callback = Callback::Core(CoreHook::FooterCredits);

    #[test]
    fn test_callbacks_run_by_priority() {
        let mut hooks = HookRegistry::new();
        hooks.add(Stage::WpHead, HEAD, 11);
        hooks.add(Stage::WpHead, ENQUEUE, 1);
        hooks.add(Stage::WpHead, CREDITS, 11);

        assert_eq!(hooks.callbacks(Stage::WpHead), vec![ENQUEUE, HEAD, CREDITS]);
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut hooks = HookRegistry::new();
        hooks.add(Stage::WpEnqueueScripts, ENQUEUE, 11);
        hooks.add(Stage::WpEnqueueScripts, ENQUEUE, 11);

        assert_eq!(hooks.callbacks(Stage::WpEnqueueScripts), vec![ENQUEUE]);
    }

    #[test]
    fn test_remove_requires_matching_priority() {
        let mut hooks = HookRegistry::new();
        hooks.add(Stage::WpHead, HEAD, 11);

        assert!(!hooks.remove(Stage::WpHead, HEAD, DEFAULT_PRIORITY));
        assert!(hooks.has(Stage::WpHead, HEAD));
        assert!(hooks.remove(Stage::WpHead, HEAD, 11));
        assert!(hooks.callbacks(Stage::WpHead).is_empty());
    }

    #[test]
    fn test_remove_all_clears_only_that_stage() {
        let mut hooks = HookRegistry::new();
        hooks.add(Stage::WpFooter, CREDITS, 20);
        hooks.add(Stage::WpHead, HEAD, 11);

        hooks.remove_all(Stage::WpFooter);

        assert!(hooks.callbacks(Stage::WpFooter).is_empty());
        assert_eq!(hooks.priority_of(Stage::WpHead, HEAD), Some(11));
    }

    #[test]
    fn test_clone_is_independent() {
        let mut base = HookRegistry::new();
        base.add(Stage::WpHead, HEAD, 11);

        let mut request = base.clone();
        request.remove(Stage::WpHead, HEAD, 11);

        assert!(base.has(Stage::WpHead, HEAD));
        assert!(!request.has(Stage::WpHead, HEAD));
    }
}
