//! Compile-time plugins.
//!
//! Plugins are listed in [`PipelineConfig::plugins`] and go through two
//! phases:
//!
//! 1. **install**, synchronously inside [`Pipeline::start`], where a plugin
//!    registers span callbacks through its [`PluginContext`];
//! 2. **start**, on the worker thread once the pipeline is running, for any
//!    background work the plugin needs.
//!
//! A plugin that panics while installing contributes nothing and is not
//! started. A panic in `start` is logged and the remaining plugins still start.
//!
//! [`Pipeline::start`]: crate::pipeline::Pipeline::start

use crate::config::PipelineConfig;
use crate::factory::{OnSpanStartCallback, SpanFactory};
use crate::prioritized::{Prioritized, NORM_PRIORITY};
use crate::processor::{OnSpanEndCallback, Tracer};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

pub trait Plugin: Send + Sync {
    /// Registers the plugin's callbacks.
    fn install(&self, ctx: &mut PluginContext<'_>) {
        let _ = ctx;
    }

    /// Starts any background work. Runs after every plugin is installed.
    fn start(&self) {}

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// What a plugin can see and register while it is installed.
pub struct PluginContext<'a> {
    config: &'a PipelineConfig,
    start_callbacks: Vec<Prioritized<dyn OnSpanStartCallback>>,
    end_callbacks: Vec<Prioritized<dyn OnSpanEndCallback>>,
}

impl<'a> PluginContext<'a> {
    fn new(config: &'a PipelineConfig) -> Self {
        Self {
            config,
            start_callbacks: Vec::new(),
            end_callbacks: Vec::new(),
        }
    }

    pub fn configuration(&self) -> &PipelineConfig {
        self.config
    }

    pub fn add_on_span_start_callback(&mut self, callback: Arc<dyn OnSpanStartCallback>) {
        self.add_on_span_start_callback_with_priority(NORM_PRIORITY, callback);
    }

    /// Lower priorities run first.
    pub fn add_on_span_start_callback_with_priority(
        &mut self,
        priority: i32,
        callback: Arc<dyn OnSpanStartCallback>,
    ) {
        self.start_callbacks.push(Prioritized::new(priority, callback));
    }

    pub fn add_on_span_end_callback(&mut self, callback: Arc<dyn OnSpanEndCallback>) {
        self.add_on_span_end_callback_with_priority(NORM_PRIORITY, callback);
    }

    /// Lower priorities run first.
    pub fn add_on_span_end_callback_with_priority(
        &mut self,
        priority: i32,
        callback: Arc<dyn OnSpanEndCallback>,
    ) {
        self.end_callbacks.push(Prioritized::new(priority, callback));
    }
}

/// The plugins a pipeline is built with.
#[derive(Clone, Default)]
pub struct PluginTable {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginTable {
    pub fn push(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.plugins.iter()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl fmt::Debug for PluginTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|p| p.name()))
            .finish()
    }
}

/// Drives plugins through install and start.
pub struct PluginManager {
    plugins: Vec<Arc<dyn Plugin>>,
    installed: Vec<Arc<dyn Plugin>>,
}

impl PluginManager {
    pub fn new(table: &PluginTable) -> Self {
        Self {
            plugins: table.iter().cloned().collect(),
            installed: Vec::new(),
        }
    }

    /// Installs every plugin not installed yet and registers their callbacks
    /// with `factory` and `tracer`. The same plugin listed twice is
    /// installed once.
    pub fn install(&mut self, config: &PipelineConfig, factory: &SpanFactory, tracer: &Tracer) {
        for plugin in &self.plugins {
            if self.installed.iter().any(|p| Arc::ptr_eq(p, plugin)) {
                continue;
            }
            let mut ctx = PluginContext::new(config);
            if catch_unwind(AssertUnwindSafe(|| plugin.install(&mut ctx))).is_err() {
                warn!(plugin = plugin.name(), "plugin failed to install");
                continue;
            }

            let PluginContext {
                start_callbacks,
                end_callbacks,
                ..
            } = ctx;
            let starts = factory.add_start_callbacks(start_callbacks);
            let ends = tracer.add_end_callbacks(end_callbacks);
            debug!(plugin = plugin.name(), starts, ends, "plugin installed");
            self.installed.push(Arc::clone(plugin));
        }
    }

    /// Starts every installed plugin.
    pub fn start(&self) {
        for plugin in &self.installed {
            if catch_unwind(AssertUnwindSafe(|| plugin.start())).is_err() {
                warn!(plugin = plugin.name(), "plugin failed to start");
            }
        }
    }

    pub fn installed(&self) -> usize {
        self.installed.len()
    }
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins", &self.plugins.len())
            .field("installed", &self.installed.len())
            .finish()
    }
}
