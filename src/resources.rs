//! Resources bound to a node instance and the codec that turns them into
//! queue-transportable primitives.

use crate::core::errors::{Result, TreeError};
use serde_json::{Number, Value};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// One opaque domain value
pub type Resource = Arc<dyn Any + Send + Sync>;

/// Ordered resources of a node instance. Order is part of the identity.
#[derive(Clone, Default)]
pub struct ResourceSet {
    values: Vec<Resource>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    pub fn from_values<T, I>(values: I) -> Self
    where
        T: Any + Send + Sync,
        I: IntoIterator<Item = T>,
    {
        Self {
            values: values.into_iter().map(|v| Arc::new(v) as Resource).collect(),
        }
    }

    pub fn from_resources(values: Vec<Resource>) -> Self {
        Self { values }
    }

    pub fn with<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.values.push(Arc::new(value));
        self
    }

    pub fn get<T: Any>(&self, index: usize) -> Option<&T> {
        self.values.get(index)?.downcast_ref::<T>()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for ResourceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceSet")
            .field("len", &self.values.len())
            .finish()
    }
}

/// Converts between domain resources and primitive arguments.
///
/// `deserialize(serialize(r))` must produce resources that serialize to the
/// same arguments again, otherwise keys decoded from storage stop matching.
pub trait ResourceCodec: Send + Sync {
    fn serialize(&self, resources: &ResourceSet) -> Result<Vec<Value>>;

    fn deserialize(&self, args: &[Value]) -> Result<ResourceSet>;
}

/// Codec for plain values: integers, floats, booleans, strings and JSON.
///
/// Integers come back as `i64` (`u64` above `i64::MAX`), strings as
/// `String`, other numbers as `f64`, anything else as `serde_json::Value`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrimitiveCodec;

impl PrimitiveCodec {
    fn to_primitive(resource: &Resource) -> Result<Value> {
        let any: &(dyn Any + Send + Sync) = resource.as_ref();
        if let Some(v) = any.downcast_ref::<i64>() {
            return Ok(Value::from(*v));
        }
        if let Some(v) = any.downcast_ref::<u64>() {
            return Ok(Value::from(*v));
        }
        if let Some(v) = any.downcast_ref::<i32>() {
            return Ok(Value::from(*v));
        }
        if let Some(v) = any.downcast_ref::<f64>() {
            return Number::from_f64(*v)
                .map(Value::Number)
                .ok_or_else(|| TreeError::codec(format!("non-finite float resource: {}", v)));
        }
        if let Some(v) = any.downcast_ref::<bool>() {
            return Ok(Value::Bool(*v));
        }
        if let Some(v) = any.downcast_ref::<String>() {
            return Ok(Value::String(v.clone()));
        }
        if let Some(v) = any.downcast_ref::<&'static str>() {
            return Ok(Value::String((*v).to_string()));
        }
        if let Some(v) = any.downcast_ref::<Value>() {
            return Ok(v.clone());
        }
        Err(TreeError::codec("unsupported resource type"))
    }

    fn from_primitive(value: &Value) -> Resource {
        match value {
            Value::Number(n) if n.is_i64() => Arc::new(n.as_i64().unwrap_or_default()),
            Value::Number(n) if n.is_u64() => Arc::new(n.as_u64().unwrap_or_default()),
            Value::Number(n) => Arc::new(n.as_f64().unwrap_or_default()),
            Value::Bool(b) => Arc::new(*b),
            Value::String(s) => Arc::new(s.clone()),
            other => Arc::new(other.clone()),
        }
    }
}

impl ResourceCodec for PrimitiveCodec {
    fn serialize(&self, resources: &ResourceSet) -> Result<Vec<Value>> {
        resources.iter().map(Self::to_primitive).collect()
    }

    fn deserialize(&self, args: &[Value]) -> Result<ResourceSet> {
        Ok(ResourceSet::from_resources(
            args.iter().map(Self::from_primitive).collect(),
        ))
    }
}
