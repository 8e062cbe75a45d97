//! Registered RPC methods and their descriptors.
//!
//! APIs are traits annotated with [`crate::api`]; the attribute declares the
//! namespace and derives every method's wire name and parameter types at
//! compile time, generating an `export` function that fills an
//! [`ApiRegistry`].

use std::{collections::HashMap, sync::Arc};

use foldhash::fast::RandomState;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{
    Context, Session,
    envelope::Params,
    error::{Error, ErrorKind, Result},
    identity::NodeIdentity,
};

pub const NAMESPACE_SEPARATOR: char = '.';

/// Declared type of a method parameter, used for coercion before dispatch.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Bool,
    Integer,
    Float,
    Uuid,
    Identity,
    Array,
    Json,
}

impl ParamType {
    /// Coerces `value` to this type, naming `param` on failure.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidArgument` if the value cannot represent the type.
    pub fn coerce(self, param: &str, value: Value) -> Result<Value> {
        let mismatch = |value: &Value| {
            Error::invalid_argument(param, format!("expected {self:?}, got {value}"))
        };
        match (self, value) {
            (ParamType::Json, value) => Ok(value),
            (ParamType::String, Value::String(s)) => Ok(Value::String(s)),
            (ParamType::String, value @ (Value::Number(_) | Value::Bool(_))) => {
                Ok(Value::String(value.to_string()))
            }
            (ParamType::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
            (ParamType::Bool, Value::String(s)) => match s.as_str() {
                "true" | "1" => Ok(Value::Bool(true)),
                "false" | "0" => Ok(Value::Bool(false)),
                _ => Err(mismatch(&Value::String(s))),
            },
            (ParamType::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => {
                Ok(Value::Number(n))
            }
            (ParamType::Integer, Value::String(s)) => {
                if let Ok(n) = s.trim().parse::<i64>() {
                    Ok(Value::from(n))
                } else if let Ok(n) = s.trim().parse::<u64>() {
                    Ok(Value::from(n))
                } else {
                    Err(mismatch(&Value::String(s)))
                }
            }
            (ParamType::Float, Value::Number(n)) => Ok(Value::Number(n)),
            (ParamType::Float, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| mismatch(&Value::String(s))),
            (ParamType::Uuid, Value::String(s)) => Uuid::parse_str(s.trim())
                .map(|uuid| Value::String(uuid.to_string()))
                .map_err(|e| Error::invalid_argument(param, e)),
            (ParamType::Identity, Value::String(s)) => {
                let uuid =
                    Uuid::parse_str(s.trim()).map_err(|e| Error::invalid_argument(param, e))?;
                Ok(serde_json::to_value(NodeIdentity::new(uuid, uuid.to_string()))?)
            }
            (ParamType::Identity, Value::Object(map)) => {
                serde_json::from_value::<NodeIdentity>(Value::Object(map))
                    .map_err(|e| Error::invalid_argument(param, e))
                    .and_then(|identity| Ok(serde_json::to_value(identity)?))
            }
            (ParamType::Array, Value::Array(values)) => Ok(Value::Array(values)),
            (_, value) => Err(mismatch(&value)),
        }
    }
}

/// Maps a Rust parameter type to its declared [`ParamType`].
pub trait RpcParam {
    const PARAM_TYPE: ParamType;
    const OPTIONAL: bool = false;
}

macro_rules! impl_rpc_param {
    ($param_type:ident => $($ty:ty),+) => {
        $(impl RpcParam for $ty {
            const PARAM_TYPE: ParamType = ParamType::$param_type;
        })+
    };
}

impl_rpc_param!(String => String);
impl_rpc_param!(Bool => bool);
impl_rpc_param!(Integer => i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);
impl_rpc_param!(Float => f32, f64);
impl_rpc_param!(Uuid => Uuid);
impl_rpc_param!(Identity => NodeIdentity);
impl_rpc_param!(Json => Value, Map<String, Value>);

impl<T> RpcParam for Vec<T> {
    const PARAM_TYPE: ParamType = ParamType::Array;
}

impl<T: RpcParam> RpcParam for Option<T> {
    const PARAM_TYPE: ParamType = T::PARAM_TYPE;
    const OPTIONAL: bool = true;
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ParamDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub optional: bool,
}

impl ParamDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>, param_type: ParamType, optional: bool) -> Self {
        Self {
            name: name.into(),
            param_type,
            optional,
        }
    }

    #[must_use]
    pub fn of<T: RpcParam>(name: &str) -> Self {
        Self::new(name, T::PARAM_TYPE, T::OPTIONAL)
    }
}

/// `namespace.method` plus its parameter signature.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RpcMethodDescriptor {
    pub namespace: String,
    pub name: String,
    pub params: Vec<ParamDescriptor>,
}

impl RpcMethodDescriptor {
    #[must_use]
    pub fn new(namespace: &str, name: &str, params: Vec<ParamDescriptor>) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            params,
        }
    }

    #[must_use]
    pub fn key(&self) -> String {
        format!("{}{NAMESPACE_SEPARATOR}{}", self.namespace, self.name)
    }

    /// Orders and coerces the supplied parameters to this signature.
    ///
    /// Positional parameters are matched by index, keyed ones by name.
    /// Missing optional parameters become `null`.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidArgument` naming the first offending parameter.
    pub fn coerce(&self, params: Params) -> Result<Vec<Value>> {
        let mut supplied: Vec<Option<Value>> = match params {
            Params::None => vec![None; self.params.len()],
            Params::Array(values) => {
                if values.len() > self.params.len() {
                    return Err(Error::new(
                        ErrorKind::InvalidArgument,
                        format!(
                            "{} expects at most {} parameters, got {}",
                            self.key(),
                            self.params.len(),
                            values.len()
                        ),
                    ));
                }
                let mut supplied: Vec<Option<Value>> = values.into_iter().map(Some).collect();
                supplied.resize(self.params.len(), None);
                supplied
            }
            Params::Object(mut map) => {
                let supplied = self
                    .params
                    .iter()
                    .map(|param| map.remove(&param.name))
                    .collect();
                if let Some(unknown) = map.keys().next() {
                    return Err(Error::invalid_argument(
                        unknown,
                        format!("unknown parameter for {}", self.key()),
                    ));
                }
                supplied
            }
        };

        self.params
            .iter()
            .zip(supplied.iter_mut())
            .map(|(param, value)| match value.take() {
                None | Some(Value::Null) if param.optional => Ok(Value::Null),
                None | Some(Value::Null) => Err(Error::invalid_argument(
                    &param.name,
                    "missing required parameter",
                )),
                Some(value) => param.param_type.coerce(&param.name, value),
            })
            .collect()
    }
}

pub type MethodFuture = BoxFuture<'static, Result<Value>>;
pub type Method = Arc<dyn Fn(Context, Vec<Value>) -> MethodFuture + Send + Sync>;

#[derive(Clone)]
pub struct RegisteredMethod {
    pub descriptor: RpcMethodDescriptor,
    pub method: Method,
}

/// namespace.method → handler.
#[derive(Default, Clone)]
pub struct ApiRegistry {
    methods: HashMap<String, RegisteredMethod, RandomState>,
}

impl ApiRegistry {
    /// Registers one method. A duplicate key replaces the earlier
    /// registration.
    pub fn add_method(&mut self, descriptor: RpcMethodDescriptor, method: Method) {
        let key = descriptor.key();
        if self
            .methods
            .insert(key.clone(), RegisteredMethod { descriptor, method })
            .is_some()
        {
            tracing::debug!("replacing registered method {key}");
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&RegisteredMethod> {
        self.methods.get(key)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &String> {
        self.methods.keys()
    }

    /// All descriptors, sorted by key.
    #[must_use]
    pub fn descriptors(&self) -> Vec<RpcMethodDescriptor> {
        let mut descriptors: Vec<_> = self
            .methods
            .values()
            .map(|registered| registered.descriptor.clone())
            .collect();
        descriptors.sort_by_key(RpcMethodDescriptor::key);
        descriptors
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Typed access to the APIs of another node.
///
/// Every trait annotated with [`crate::api`] is implemented for `Remote`;
/// calls go out over `session`, optionally routed to `target`.
#[derive(Clone, Debug)]
pub struct Remote {
    session: Arc<Session>,
    target: Option<String>,
}

impl Remote {
    #[must_use]
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            target: None,
        }
    }

    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// # Errors
    ///
    /// Transport failures, the remote error, or an undecodable result.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T> {
        let value = self
            .session
            .call(method, Params::Array(params), self.target.clone())
            .await?
            .into_result()?;
        Ok(serde_json::from_value(value)?)
    }
}

impl std::fmt::Debug for ApiRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiRegistry")
            .field("methods", &self.methods.keys())
            .finish()
    }
}
