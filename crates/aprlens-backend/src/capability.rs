//! Capability registry.
//!
//! Workers invoke named operations while the backend executes their run.
//! Every operation is registered here once, with a typed descriptor, and the
//! backend dispatches tool calls through [`CapabilityRegistry::dispatch`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use aprlens_core::CapabilityDescriptor;

use crate::error::CapabilityError;

/// Handler for one capability.
///
/// Implement this trait to expose an operation to workers.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// Typed description of the operation.
    fn descriptor(&self) -> &CapabilityDescriptor;

    /// Invoke the operation with arguments already validated against
    /// [`descriptor`](Self::descriptor).
    async fn invoke(&self, args: CapabilityArgs) -> Result<String, CapabilityError>;
}

/// Validated arguments of one capability call.
#[derive(Debug, Clone)]
pub struct CapabilityArgs {
    name: String,
    value: Value,
}

impl CapabilityArgs {
    /// Wrap raw arguments for capability `name`.
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// A required string argument.
    pub fn str(&self, key: &str) -> Result<&str, CapabilityError> {
        self.opt_str(key).ok_or_else(|| self.invalid(key, "string"))
    }

    /// An optional string argument.
    pub fn opt_str(&self, key: &str) -> Option<&str> {
        self.value.get(key).and_then(Value::as_str)
    }

    /// A required integer argument; numeric strings are accepted.
    pub fn integer(&self, key: &str) -> Result<i64, CapabilityError> {
        let value = self.value.get(key);
        value
            .and_then(Value::as_i64)
            .or_else(|| {
                value
                    .and_then(Value::as_str)
                    .and_then(|s| s.trim().parse().ok())
            })
            .ok_or_else(|| self.invalid(key, "integer"))
    }

    fn invalid(&self, key: &str, ty: &str) -> CapabilityError {
        CapabilityError::InvalidArguments {
            name: self.name.clone(),
            reason: format!("'{}' must be a {}", key, ty),
        }
    }
}

/// Lookup table from capability name to handler.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    handlers: BTreeMap<String, Arc<dyn CapabilityHandler>>,
}

impl CapabilityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its descriptor's name.
    pub fn register(&mut self, handler: Arc<dyn CapabilityHandler>) -> Result<(), CapabilityError> {
        let name = handler.descriptor().name.clone();
        if self.handlers.contains_key(&name) {
            return Err(CapabilityError::Duplicate(name));
        }
        debug!(capability = %name, "Registered capability");
        self.handlers.insert(name, handler);
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, handler: Arc<dyn CapabilityHandler>) -> Result<Self, CapabilityError> {
        self.register(handler)?;
        Ok(self)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Returns true if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Descriptor of a registered capability.
    pub fn descriptor(&self, name: &str) -> Option<&CapabilityDescriptor> {
        self.handlers.get(name).map(|h| h.descriptor())
    }

    /// Tool definitions for a worker's capability set.
    ///
    /// Fails on the first name that is not registered.
    pub fn definitions_for(&self, names: &[String]) -> Result<Vec<Value>, CapabilityError> {
        names
            .iter()
            .map(|name| {
                self.descriptor(name)
                    .map(CapabilityDescriptor::to_tool_definition)
                    .ok_or_else(|| CapabilityError::Unknown(name.clone()))
            })
            .collect()
    }

    /// Validate `raw_args` (a JSON document) and invoke `name`.
    pub async fn dispatch(&self, name: &str, raw_args: &str) -> Result<String, CapabilityError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| CapabilityError::Unknown(name.to_string()))?;

        let value: Value = if raw_args.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(raw_args).map_err(|e| CapabilityError::InvalidArguments {
                name: name.to_string(),
                reason: format!("arguments are not valid JSON: {}", e),
            })?
        };

        handler
            .descriptor()
            .validate_args(&value)
            .map_err(|reason| CapabilityError::InvalidArguments {
                name: name.to_string(),
                reason,
            })?;

        handler.invoke(CapabilityArgs::new(name, value)).await
    }

    /// Like [`dispatch`](Self::dispatch), but failures become text the worker
    /// can read instead of failing its run.
    pub async fn dispatch_to_output(&self, name: &str, raw_args: &str) -> String {
        match self.dispatch(name, raw_args).await {
            Ok(output) => output,
            Err(e) => {
                warn!(capability = %name, error = %e, "Capability call failed");
                format!("Error: {}", e)
            }
        }
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &self.names())
            .finish()
    }
}
