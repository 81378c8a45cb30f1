//! Message Transformers
//!
//! A bridge may rewrite each message before it is sent. Transformers are
//! injected directly or looked up by identifier in a [`TransformerRegistry`]
//! when a bridge is built from configuration.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::config::TransformerConfig;
use crate::message::{Message, PropertyValue};

/// Transformer failure; stops the bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// No transformer registered under this identifier
    Unknown(String),
    /// The transformer rejected the message
    Failed(String),
    /// The transformer cannot be built from its settings
    Invalid(String),
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformError::Unknown(id) => write!(f, "unknown transformer '{}'", id),
            TransformError::Failed(msg) => write!(f, "transform failed: {}", msg),
            TransformError::Invalid(msg) => write!(f, "invalid transformer: {}", msg),
        }
    }
}

impl std::error::Error for TransformError {}

/// Rewrites a message before it is forwarded
pub trait Transformer: Send + Sync {
    fn transform(&self, message: Message) -> Result<Message, TransformError>;
}

impl<F> Transformer for F
where
    F: Fn(Message) -> Result<Message, TransformError> + Send + Sync,
{
    fn transform(&self, message: Message) -> Result<Message, TransformError> {
        self(message)
    }
}

/// Sets a string property to a fixed value, overwriting any previous value
#[derive(Debug, Clone)]
pub struct SetProperty {
    key: String,
    value: PropertyValue,
}

impl SetProperty {
    pub fn new(key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Transformer for SetProperty {
    fn transform(&self, mut message: Message) -> Result<Message, TransformError> {
        message.properties.insert(self.key.clone(), self.value.clone());
        Ok(message)
    }
}

/// Replaces every occurrence of a byte pattern in the body
#[derive(Debug, Clone)]
pub struct ReplaceBody {
    from: Vec<u8>,
    to: Vec<u8>,
}

impl ReplaceBody {
    /// Fails on an empty `from` pattern
    pub fn new(from: impl AsRef<[u8]>, to: impl AsRef<[u8]>) -> Result<Self, TransformError> {
        let from = from.as_ref();
        if from.is_empty() {
            return Err(TransformError::Invalid("empty body pattern".to_string()));
        }
        Ok(Self {
            from: from.to_vec(),
            to: to.as_ref().to_vec(),
        })
    }
}

impl Transformer for ReplaceBody {
    fn transform(&self, mut message: Message) -> Result<Message, TransformError> {
        let body = &message.body[..];
        let mut out = Vec::with_capacity(body.len());
        let mut i = 0;
        while i < body.len() {
            if body[i..].starts_with(&self.from) {
                out.extend_from_slice(&self.to);
                i += self.from.len();
            } else {
                out.push(body[i]);
                i += 1;
            }
        }
        message.body = Bytes::from(out);
        Ok(message)
    }
}

/// Applies transformers in order
pub struct Chain(Vec<Arc<dyn Transformer>>);

impl Chain {
    pub fn new(transformers: Vec<Arc<dyn Transformer>>) -> Self {
        Self(transformers)
    }
}

impl Transformer for Chain {
    fn transform(&self, message: Message) -> Result<Message, TransformError> {
        self.0.iter().try_fold(message, |msg, t| t.transform(msg))
    }
}

/// Transformers addressable by identifier
#[derive(Default, Clone)]
pub struct TransformerRegistry {
    transformers: HashMap<String, Arc<dyn Transformer>>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transformer, replacing any previous one with this id
    pub fn register(&mut self, id: impl Into<String>, transformer: Arc<dyn Transformer>) {
        self.transformers.insert(id.into(), transformer);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Transformer>, TransformError> {
        self.transformers
            .get(id)
            .cloned()
            .ok_or_else(|| TransformError::Unknown(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.transformers.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.transformers.keys().map(String::as_str)
    }

    /// Registry with one chain per configured transformer
    ///
    /// Property assignments run before body replacements. Fails on the first
    /// transformer whose settings are invalid.
    pub fn from_config(configs: &[TransformerConfig]) -> Result<Self, TransformError> {
        let mut registry = Self::new();
        for config in configs {
            let mut steps: Vec<Arc<dyn Transformer>> = Vec::new();
            for (key, value) in &config.set_property {
                steps.push(Arc::new(SetProperty::new(key.clone(), value.clone())));
            }
            for replacement in &config.replace_body {
                let step = ReplaceBody::new(&replacement.from, &replacement.to).map_err(|e| {
                    TransformError::Invalid(format!("transformer '{}': {}", config.name, e))
                })?;
                steps.push(Arc::new(step));
            }
            registry.register(config.name.clone(), Arc::new(Chain::new(steps)));
        }
        Ok(registry)
    }
}

impl fmt::Debug for TransformerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&str> = self.ids().collect();
        ids.sort_unstable();
        f.debug_struct("TransformerRegistry").field("ids", &ids).finish()
    }
}
