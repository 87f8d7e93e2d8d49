// Configuration Providers
// Opaque config objects passed through unmodified to the wire payload, plus
// working-directory resolution. Both are external collaborators; the engine
// only defines the contracts and trivial defaults.

use serde_json::Value;

/// Supplies the opaque configuration blobs attached to execution requests.
/// Each is forwarded to the agent service exactly as returned.
pub trait ConfigProvider: Send + Sync {
    fn model_config(&self) -> Option<Value> {
        None
    }
    fn sandbox_config(&self) -> Option<Value> {
        None
    }
    fn skills_config(&self) -> Option<Value> {
        None
    }
    fn mcp_config(&self) -> Option<Value> {
        None
    }
}

/// Fixed configuration, useful for embedders with static settings and for
/// tests.
#[derive(Debug, Clone, Default)]
pub struct StaticConfig {
    pub model: Option<Value>,
    pub sandbox: Option<Value>,
    pub skills: Option<Value>,
    pub mcp: Option<Value>,
}

impl ConfigProvider for StaticConfig {
    fn model_config(&self) -> Option<Value> {
        self.model.clone()
    }
    fn sandbox_config(&self) -> Option<Value> {
        self.sandbox.clone()
    }
    fn skills_config(&self) -> Option<Value> {
        self.skills.clone()
    }
    fn mcp_config(&self) -> Option<Value> {
        self.mcp.clone()
    }
}

/// Resolves the working directory sent as `workDir` on execution requests.
pub trait WorkDirResolver: Send + Sync {
    fn resolve(&self, task_id: &str, override_dir: Option<&str>) -> String;
}

/// Resolver that always answers with a fixed directory unless an override is
/// given.
#[derive(Debug, Clone)]
pub struct FixedWorkDir(pub String);

impl WorkDirResolver for FixedWorkDir {
    fn resolve(&self, _task_id: &str, override_dir: Option<&str>) -> String {
        override_dir.map(str::to_string).unwrap_or_else(|| self.0.clone())
    }
}
