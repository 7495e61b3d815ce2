//! 动作注册表
//!
//! 每个动作描述「调用方的一次调用如何变成一条发往后端的消息」：主题模板、参数定义、回复格式。
//! 在配置加载后编译一次，按名查找。

mod format;
mod schema;

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::BridgeError;

pub use format::ResponseFormat;
pub use schema::{ActionDefinition, ActionSchema, BoundAction, ParamKind, ParameterSpec};

#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<ActionSchema>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 编译全部定义；任何一个无效则整体失败
    pub fn from_definitions(definitions: &[ActionDefinition]) -> Result<Self, BridgeError> {
        let mut registry = Self::new();
        for definition in definitions {
            registry.register(ActionSchema::compile(definition.clone())?)?;
        }
        tracing::info!(count = registry.len(), "action schemas compiled");
        Ok(registry)
    }

    pub fn register(&mut self, schema: ActionSchema) -> Result<(), BridgeError> {
        let name = schema.name().to_string();
        if self.actions.contains_key(&name) {
            return Err(BridgeError::ConfigError(format!("duplicate action '{name}'")));
        }
        self.actions.insert(name, Arc::new(schema));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<ActionSchema>, BridgeError> {
        self.actions
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownAction(name.to_string()))
    }

    pub fn action_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.actions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}
