//! Span creation.

use crate::attributes::AttributeLimits;
use crate::clock;
use crate::condition::TimeoutExecutor;
use crate::context;
use crate::prioritized::{Prioritized, PrioritizedSet, NORM_PRIORITY};
use crate::processor::SpanProcessor;
use crate::span::{
    Span, SpanCategory, SpanContext, SpanEnv, SpanInit, SpanKind, SpanMetrics, ATTR_FIRST_CLASS,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;

/// Runs on the creating thread for every new span, after its primary
/// attributes are set and before it is returned.
///
/// Time spent here counts towards the span's duration. A panicking callback
/// is logged and skipped.
pub trait OnSpanStartCallback: Send + Sync {
    fn on_span_start(&self, span: &Span);
}

impl<F> OnSpanStartCallback for F
where
    F: Fn(&Span) + Send + Sync,
{
    fn on_span_start(&self, span: &Span) {
        self(span);
    }
}

/// Options for a new span.
///
/// # Example
///
/// ```ignore
/// let options = SpanOptions::default()
///     .with_start_time(start)
///     .with_kind(SpanKind::Client)
///     .make_context(false);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct SpanOptions {
    pub start_time: Option<u64>,
    /// Explicit parent. `Some(SpanContext::INVALID)` forces a root span;
    /// `None` uses the calling thread's current context.
    pub parent: Option<SpanContext>,
    /// Push the span onto the calling thread's context stack.
    pub make_context: bool,
    pub first_class: Option<bool>,
    pub kind: SpanKind,
    pub metrics: Option<SpanMetrics>,
}

impl Default for SpanOptions {
    fn default() -> Self {
        Self {
            start_time: None,
            parent: None,
            make_context: true,
            first_class: None,
            kind: SpanKind::Internal,
            metrics: None,
        }
    }
}

impl SpanOptions {
    pub fn with_start_time(mut self, ticks: u64) -> Self {
        self.start_time = Some(ticks);
        self
    }

    pub fn with_parent(mut self, parent: SpanContext) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn without_parent(self) -> Self {
        self.with_parent(SpanContext::INVALID)
    }

    pub fn make_context(mut self, make_context: bool) -> Self {
        self.make_context = make_context;
        self
    }

    pub fn first_class(mut self, first_class: bool) -> Self {
        self.first_class = Some(first_class);
        self
    }

    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_metrics(mut self, metrics: SpanMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Creates spans wired to a processor.
///
/// Clones share their start callbacks.
#[derive(Clone)]
pub struct SpanFactory {
    env: Arc<SpanEnv>,
    start_callbacks: Arc<PrioritizedSet<dyn OnSpanStartCallback>>,
}

impl SpanFactory {
    /// A factory whose spans cannot be blocked by conditions.
    pub fn new(processor: Arc<dyn SpanProcessor>, limits: AttributeLimits) -> Self {
        Self {
            env: Arc::new(SpanEnv {
                processor,
                timeouts: None,
                limits,
            }),
            start_callbacks: Arc::default(),
        }
    }

    /// A factory whose spans support [`Span::block`].
    pub fn with_timeouts(
        processor: Arc<dyn SpanProcessor>,
        limits: AttributeLimits,
        timeouts: Arc<TimeoutExecutor>,
    ) -> Self {
        Self {
            env: Arc::new(SpanEnv {
                processor,
                timeouts: Some(timeouts),
                limits,
            }),
            start_callbacks: Arc::default(),
        }
    }

    pub fn attribute_limits(&self) -> AttributeLimits {
        self.env.limits
    }

    /// Registers `callback` at [`NORM_PRIORITY`]. Returns `false` if this
    /// callback was already registered.
    pub fn add_on_start_callback(&self, callback: Arc<dyn OnSpanStartCallback>) -> bool {
        self.start_callbacks.add(NORM_PRIORITY, callback)
    }

    /// Registers `callback`; lower priorities run first.
    pub fn add_on_start_callback_with_priority(
        &self,
        priority: i32,
        callback: Arc<dyn OnSpanStartCallback>,
    ) -> bool {
        self.start_callbacks.add(priority, callback)
    }

    pub(crate) fn add_start_callbacks(
        &self,
        callbacks: impl IntoIterator<Item = Prioritized<dyn OnSpanStartCallback>>,
    ) -> usize {
        self.start_callbacks.add_all(callbacks)
    }

    /// Creates a custom span.
    pub fn create_span(&self, name: impl Into<String>, options: SpanOptions) -> Arc<Span> {
        self.create_span_with_category(name, SpanCategory::Custom, options)
    }

    pub fn create_span_with_category(
        &self,
        name: impl Into<String>,
        category: SpanCategory,
        options: SpanOptions,
    ) -> Arc<Span> {
        let span = self.build(name.into(), category, options);
        self.run_start_callbacks(&span);
        span
    }

    fn build(&self, name: String, category: SpanCategory, options: SpanOptions) -> Arc<Span> {
        let parent = match options.parent {
            Some(explicit) => explicit.is_valid().then_some(explicit),
            None => context::current_context(),
        };
        let first_class = options.first_class.unwrap_or(parent.is_none());

        let span = Span::new(
            SpanInit {
                name,
                kind: options.kind,
                category,
                start_time: options.start_time.unwrap_or_else(clock::now),
                trace_id: parent.map_or(0, |p| p.trace_id),
                parent_span_id: parent.map_or(0, |p| p.span_id),
                make_context: options.make_context,
                metrics: options.metrics,
            },
            Arc::clone(&self.env),
        );

        if category.has_first_class_marker() {
            span.set_internal_attribute(ATTR_FIRST_CLASS, first_class);
        }
        span
    }

    /// A client span around an outgoing HTTP request, named `[HTTP/VERB]`.
    pub fn create_network_span(&self, url: &str, verb: &str, options: SpanOptions) -> Arc<Span> {
        let verb = verb.to_uppercase();
        let span = self.build(
            format!("[HTTP/{verb}]"),
            SpanCategory::Network,
            options.with_kind(SpanKind::Client),
        );
        span.set_internal_attribute("http.url", url);
        span.set_internal_attribute("http.method", verb);
        self.run_start_callbacks(&span);
        span
    }

    /// A span covering the load of one view, named `[ViewLoad/<type>]<name>`.
    pub fn create_view_load_span(
        &self,
        view_type: &str,
        view_name: &str,
        options: SpanOptions,
    ) -> Arc<Span> {
        let span = self.build(
            format!("[ViewLoad/{view_type}]{view_name}"),
            SpanCategory::ViewLoad,
            options,
        );
        span.set_internal_attribute("bugsnag.view.type", view_type);
        span.set_internal_attribute("bugsnag.view.name", view_name);
        self.run_start_callbacks(&span);
        span
    }

    fn run_start_callbacks(&self, span: &Span) {
        let callbacks = self.start_callbacks.snapshot();
        for callback in callbacks.iter() {
            if catch_unwind(AssertUnwindSafe(|| callback.value.on_span_start(span))).is_err() {
                warn!(span_name = %span.name(), "span start callback panicked");
            }
        }
    }
}

impl std::fmt::Debug for SpanFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanFactory")
            .field("limits", &self.env.limits)
            .field("blockable", &self.env.timeouts.is_some())
            .field("start_callbacks", &self.start_callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::AttributeValue;
    use crate::processor::NoopSpanProcessor;
    use crate::span::ATTR_CATEGORY;

    fn factory() -> SpanFactory {
        SpanFactory::new(Arc::new(NoopSpanProcessor), AttributeLimits::default())
    }

    #[test]
    fn test_root_span_is_first_class() {
        let factory = factory();
        let root = factory.create_span("root", SpanOptions::default());
        assert_eq!(root.parent_span_id(), 0);
        assert_eq!(root.is_first_class(), Some(true));
        assert_ne!(root.trace_id(), 0);
        root.end();
    }

    #[test]
    fn test_child_inherits_trace_from_current_context() {
        let factory = factory();
        let parent = factory.create_span("parent", SpanOptions::default());
        let child = factory.create_span("child", SpanOptions::default());

        assert_eq!(child.trace_id(), parent.trace_id());
        assert_eq!(child.parent_span_id(), parent.span_id());
        assert_eq!(child.is_first_class(), Some(false));
        assert_eq!(context::current_context(), Some(child.context()));

        child.end();
        assert_eq!(context::current_context(), Some(parent.context()));
        parent.end();
        assert!(context::current_context().is_none());
    }

    #[test]
    fn test_without_parent_ignores_context() {
        let factory = factory();
        let outer = factory.create_span("outer", SpanOptions::default());
        let detached = factory.create_span(
            "detached",
            SpanOptions::default().without_parent().make_context(false),
        );
        assert_eq!(detached.parent_span_id(), 0);
        assert_ne!(detached.trace_id(), outer.trace_id());
        // make_context(false) leaves the stack alone
        assert_eq!(context::current_context(), Some(outer.context()));
        outer.end();
    }

    #[test]
    fn test_explicit_first_class_and_start_time() {
        let factory = factory();
        let span = factory.create_span(
            "explicit",
            SpanOptions::default()
                .with_start_time(42)
                .first_class(false)
                .make_context(false),
        );
        assert_eq!(span.start_time(), 42);
        assert_eq!(span.is_first_class(), Some(false));
    }

    #[test]
    fn test_network_span() {
        let factory = factory();
        let span = factory.create_network_span(
            "https://example.com/api",
            "post",
            SpanOptions::default().make_context(false),
        );
        assert_eq!(span.name(), "[HTTP/POST]");
        assert_eq!(span.kind(), SpanKind::Client);
        assert_eq!(span.category(), SpanCategory::Network);
        assert_eq!(span.attribute(ATTR_CATEGORY), Some(AttributeValue::from("network")));
        assert_eq!(span.attribute("http.method"), Some(AttributeValue::from("POST")));
        // Network spans carry no first-class marker
        assert_eq!(span.is_first_class(), None);
    }

    #[test]
    fn test_view_load_span() {
        let factory = factory();
        let span = factory.create_view_load_span(
            "Activity",
            "MainActivity",
            SpanOptions::default().make_context(false),
        );
        assert_eq!(span.name(), "[ViewLoad/Activity]MainActivity");
        assert_eq!(span.attribute(ATTR_CATEGORY), Some(AttributeValue::from("view_load")));
        assert_eq!(span.is_first_class(), Some(true));
    }

    #[test]
    fn test_block_unavailable_without_timeouts() {
        let span = factory().create_span("s", SpanOptions::default().make_context(false));
        assert!(span.block(std::time::Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_start_callbacks_run_in_priority_order() {
        use crate::prioritized::{HIGH_PRIORITY, LOW_PRIORITY};
        use std::sync::Mutex;

        let factory = factory();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for (priority, tag) in [(LOW_PRIORITY, "low"), (HIGH_PRIORITY, "high"), (NORM_PRIORITY, "norm")] {
            let seen = Arc::clone(&seen);
            factory.add_on_start_callback_with_priority(
                priority,
                Arc::new(move |span: &Span| seen.lock().unwrap().push((tag, span.name()))),
            );
        }

        let span = factory.create_span("checkout", SpanOptions::default().make_context(false));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("high", "checkout".to_owned()), ("norm", "checkout".to_owned()), ("low", "checkout".to_owned())]
        );
        span.end();
    }

    #[test]
    fn test_start_callback_sees_primary_attributes() {
        let factory = factory();
        factory.add_on_start_callback(Arc::new(|span: &Span| {
            let method = span
                .attribute("http.method")
                .and_then(|m| m.as_str().map(str::to_owned))
                .unwrap_or_default();
            span.set_attribute("seen.method", method);
        }));

        let span = factory.create_network_span(
            "https://example.com",
            "get",
            SpanOptions::default().make_context(false),
        );
        assert_eq!(span.attribute("seen.method"), Some(AttributeValue::from("GET")));
    }

    #[test]
    fn test_panicking_start_callback_is_contained() {
        let factory = factory();
        factory.add_on_start_callback_with_priority(0, Arc::new(|_: &Span| panic!("boom")));
        factory.add_on_start_callback(Arc::new(|span: &Span| span.set_attribute("after", true)));

        let span = factory.create_span("survivor", SpanOptions::default().make_context(false));
        assert_eq!(span.attribute("after"), Some(AttributeValue::Bool(true)));
        assert!(!span.is_ended());
    }

    #[test]
    fn test_start_callback_registered_once() {
        let factory = factory();
        let callback: Arc<dyn OnSpanStartCallback> = Arc::new(|_: &Span| {});
        assert!(factory.add_on_start_callback(Arc::clone(&callback)));
        assert!(!factory.clone().add_on_start_callback(callback));
    }
}
