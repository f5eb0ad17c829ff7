//! Plugin manager (C10) — brings up the compiled-in plugin set once at
//! startup: topological order by declared dependency, then
//! beforeInitialize -> initialize -> afterInitialize per plugin. Any
//! failure aborts the whole bring-up; no partially-initialized plugin's
//! tools are ever exposed to a run.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use agentrt_domain::error::{Error, Result};
use agentrt_domain::hook::{Hook, HookRegistry};
use agentrt_domain::tool::{Tool, ToolRegistry};
use async_trait::async_trait;

/// One compiled-in plugin. `name()` must be unique among the enabled set.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Names of other plugins that must initialize before this one.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    async fn before_initialize(&self, _ctx: &mut PluginInitContext) -> Result<()> {
        Ok(())
    }

    async fn initialize(&self, ctx: &mut PluginInitContext) -> Result<()>;

    async fn after_initialize(&self, _ctx: &mut PluginInitContext) -> Result<()> {
        Ok(())
    }
}

/// What a plugin's lifecycle methods are handed. Registrations are
/// append-only and only ever made during bring-up, never from a running run.
#[derive(Default)]
pub struct PluginInitContext {
    tools: ToolRegistry,
    hooks: HookRegistry,
    services: HashMap<String, Arc<dyn Any + Send + Sync>>,
    config: HashMap<String, serde_json::Value>,
}

impl PluginInitContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_tool(&mut self, tool: Arc<dyn Tool>) {
        self.tools.register(tool);
    }

    pub fn register_tools(&mut self, tools: impl IntoIterator<Item = Arc<dyn Tool>>) {
        self.tools.register_many(tools);
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn get_tools(&self) -> Vec<String> {
        self.tools.tool_names()
    }

    pub fn register_hook(&mut self, hook: Arc<dyn Hook>) {
        self.hooks.register(hook);
    }

    pub fn register_service<T: Any + Send + Sync>(&mut self, name: impl Into<String>, value: Arc<T>) {
        self.services.insert(name.into(), value);
    }

    pub fn get_service<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.services.get(name)?.clone().downcast::<T>().ok()
    }

    pub fn set_config(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.config.insert(key.into(), value);
    }

    pub fn get_config(&self, key: &str) -> Option<&serde_json::Value> {
        self.config.get(key)
    }
}

/// The immutable result of a successful bring-up: a read-only tool/hook/
/// service snapshot shared by every run for the lifetime of the process.
pub struct PluginManager {
    tools: Arc<ToolRegistry>,
    hooks: Arc<HookRegistry>,
    services: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl PluginManager {
    pub fn tools(&self) -> Arc<ToolRegistry> {
        self.tools.clone()
    }

    pub fn hooks(&self) -> Arc<HookRegistry> {
        self.hooks.clone()
    }

    pub fn get_service<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.services.get(name)?.clone().downcast::<T>().ok()
    }
}

/// Bring up `enabled` (in the order given by `domain::config::PluginsConfig`)
/// out of the `available` compiled-in plugins.
pub async fn initialize(available: &[Arc<dyn Plugin>], enabled: &[String]) -> Result<PluginManager> {
    let mut selected = Vec::with_capacity(enabled.len());
    for name in enabled {
        let plugin = available
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| Error::Config(format!("plugin not found: {name}")))?;
        selected.push(plugin.clone());
    }

    let order = topo_sort(&selected)?;

    let mut ctx = PluginInitContext::new();
    for plugin in &order {
        tracing::debug!(plugin = plugin.name(), "initializing plugin");
        if let Err(e) = run_lifecycle(plugin.as_ref(), &mut ctx).await {
            tracing::error!(plugin = plugin.name(), error = %e, "plugin initialization failed, aborting bring-up");
            return Err(e);
        }
    }

    Ok(PluginManager {
        tools: Arc::new(ctx.tools),
        hooks: Arc::new(ctx.hooks),
        services: ctx.services,
    })
}

async fn run_lifecycle(plugin: &dyn Plugin, ctx: &mut PluginInitContext) -> Result<()> {
    plugin.before_initialize(ctx).await?;
    plugin.initialize(ctx).await?;
    plugin.after_initialize(ctx).await?;
    Ok(())
}

enum VisitState {
    Visiting,
    Done,
}

fn topo_sort(plugins: &[Arc<dyn Plugin>]) -> Result<Vec<Arc<dyn Plugin>>> {
    let by_name: HashMap<&str, &Arc<dyn Plugin>> =
        plugins.iter().map(|p| (p.name(), p)).collect();

    for p in plugins {
        for dep in p.dependencies() {
            if !by_name.contains_key(dep.as_str()) {
                return Err(Error::Config(format!(
                    "plugin '{}' depends on missing plugin '{}'",
                    p.name(),
                    dep
                )));
            }
        }
    }

    fn visit<'a>(
        name: &'a str,
        by_name: &HashMap<&'a str, &'a Arc<dyn Plugin>>,
        state: &mut HashMap<&'a str, VisitState>,
        order: &mut Vec<Arc<dyn Plugin>>,
    ) -> Result<()> {
        match state.get(name) {
            Some(VisitState::Done) => return Ok(()),
            Some(VisitState::Visiting) => {
                return Err(Error::Config(format!("plugin dependency cycle at '{name}'")));
            }
            None => {}
        }
        state.insert(name, VisitState::Visiting);
        let plugin = by_name[name];
        for dep in plugin.dependencies() {
            visit(&dep, by_name, state, order)?;
        }
        state.insert(name, VisitState::Done);
        order.push((*plugin).clone());
        Ok(())
    }

    let mut state = HashMap::new();
    let mut order = Vec::new();
    for p in plugins {
        visit(p.name(), &by_name, &mut state, &mut order)?;
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named {
        name: &'static str,
        deps: Vec<&'static str>,
        fail: bool,
    }

    #[async_trait]
    impl Plugin for Named {
        fn name(&self) -> &str {
            self.name
        }
        fn dependencies(&self) -> Vec<String> {
            self.deps.iter().map(|s| s.to_string()).collect()
        }
        async fn initialize(&self, ctx: &mut PluginInitContext) -> Result<()> {
            if self.fail {
                return Err(Error::Other(format!("{} failed", self.name)));
            }
            ctx.set_config(self.name, serde_json::json!(true));
            Ok(())
        }
    }

    fn plugin(name: &'static str, deps: &[&'static str]) -> Arc<dyn Plugin> {
        Arc::new(Named {
            name,
            deps: deps.to_vec(),
            fail: false,
        })
    }

    #[test]
    fn topo_sort_orders_dependency_before_dependent() {
        let a = plugin("a", &["b"]);
        let b = plugin("b", &[]);
        let order = topo_sort(&[a, b]).unwrap();
        let names: Vec<&str> = order.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn topo_sort_errors_on_missing_dependency() {
        let a = plugin("a", &["ghost"]);
        let err = topo_sort(&[a]).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn topo_sort_errors_on_cycle() {
        let a = plugin("a", &["b"]);
        let b = plugin("b", &["a"]);
        let err = topo_sort(&[a, b]).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[tokio::test]
    async fn initialize_exposes_tools_and_services_after_success() {
        let available: Vec<Arc<dyn Plugin>> = vec![plugin("a", &[])];
        let manager = initialize(&available, &["a".to_string()]).await.unwrap();
        assert_eq!(manager.tools().len(), 0);
    }

    #[tokio::test]
    async fn initialize_aborts_on_failure() {
        let failing: Arc<dyn Plugin> = Arc::new(Named {
            name: "bad",
            deps: vec![],
            fail: true,
        });
        let err = initialize(&[failing], &["bad".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("bad"));
    }

    #[tokio::test]
    async fn initialize_errors_when_enabled_plugin_not_supplied() {
        let err = initialize(&[], &["missing".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
