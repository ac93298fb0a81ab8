//! Descriptor-based parameter binding.
//!
//! Handlers declare their parameter shape once, at registration time, as an
//! ordered list of [`ParamRole`]s. At dispatch time the binder walks the
//! descriptor and produces one [`BoundValue`] per role from the request
//! context. Binding never fails; a role the context cannot satisfy binds to
//! [`BoundValue::Zero`].

use crate::binder::convert;
use crate::binder::inject::{Injectable, Injector};
use crate::logging::RequestLogger;
use crate::server::request::{merge_encoded_pairs, ArgMap, HttpRequest};
use crate::websocket::WsConnection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::sync::Arc;
use thiserror::Error;

/// Opaque per-connection session state produced by a WebSocket open handler.
pub type SessionValue = Arc<dyn Any + Send + Sync>;

/// What a handler parameter wants from the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamRole {
    /// The merged argument map. At most one per descriptor; later `Input`
    /// roles bind to zero.
    Input,
    /// The request headers as a JSON object.
    Headers,
    /// The parsed request itself.
    Request,
    /// The per-request logger.
    Logger,
    /// The live WebSocket connection handle (WebSocket handlers only).
    Connection,
    /// The connection's session value (WebSocket handlers only).
    Session,
    /// A value from the injection registry, by type.
    Injected(TypeId),
}

impl ParamRole {
    /// Role for an injected value of type `T`.
    pub fn injected<T: Injectable + 'static>() -> Self {
        ParamRole::Injected(TypeId::of::<T>())
    }
}

/// Registration-time parameter classification for one handler.
#[derive(Debug, Clone, Default)]
pub struct HandlerDescriptor {
    roles: Vec<ParamRole>,
}

impl HandlerDescriptor {
    pub fn new(roles: Vec<ParamRole>) -> Self {
        Self { roles }
    }

    pub fn roles(&self) -> &[ParamRole] {
        &self.roles
    }
}

/// One materialized handler parameter.
#[derive(Clone)]
pub enum BoundValue {
    Input(Value),
    Headers(Value),
    Request(Arc<HttpRequest>),
    Logger(RequestLogger),
    Connection(Arc<dyn WsConnection>),
    Session(SessionValue),
    Injected(Arc<dyn Injectable>),
    /// The context could not satisfy the role.
    Zero,
}

/// The bound parameters for one handler invocation, with typed accessors.
#[derive(Clone, Default)]
pub struct BoundParams(Vec<BoundValue>);

impl BoundParams {
    pub fn new(values: Vec<BoundValue>) -> Self {
        Self(values)
    }

    /// The raw argument map bound to the `Input` role, if any.
    pub fn input_value(&self) -> Option<&Value> {
        self.0.iter().find_map(|v| match v {
            BoundValue::Input(value) => Some(value),
            _ => None,
        })
    }

    /// The `Input` argument map leniently converted into `T`. Missing or
    /// unconvertible fields keep `T::default()` values.
    pub fn input<T>(&self) -> T
    where
        T: Default + Serialize + DeserializeOwned,
    {
        match self.input_value() {
            Some(value) => convert::lenient(value),
            None => T::default(),
        }
    }

    pub fn headers(&self) -> Option<&Value> {
        self.0.iter().find_map(|v| match v {
            BoundValue::Headers(value) => Some(value),
            _ => None,
        })
    }

    pub fn request(&self) -> Option<Arc<HttpRequest>> {
        self.0.iter().find_map(|v| match v {
            BoundValue::Request(req) => Some(req.clone()),
            _ => None,
        })
    }

    pub fn logger(&self) -> Option<RequestLogger> {
        self.0.iter().find_map(|v| match v {
            BoundValue::Logger(logger) => Some(logger.clone()),
            _ => None,
        })
    }

    pub fn connection(&self) -> Option<Arc<dyn WsConnection>> {
        self.0.iter().find_map(|v| match v {
            BoundValue::Connection(conn) => Some(conn.clone()),
            _ => None,
        })
    }

    /// The session value downcast to `T`.
    pub fn session<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.0.iter().find_map(|v| match v {
            BoundValue::Session(session) => session.clone().downcast::<T>().ok(),
            _ => None,
        })
    }

    /// The first injected value downcast to `T`.
    pub fn injected<T: Injectable + 'static>(&self) -> Option<Arc<T>> {
        self.0.iter().find_map(|v| match v {
            BoundValue::Injected(obj) => obj.clone().as_any_arc().downcast::<T>().ok(),
            _ => None,
        })
    }
}

/// What a handler produced.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerResult {
    /// Nothing: no body is written and no ACCESS record is emitted.
    None,
    /// Written verbatim.
    Text(String),
    /// Written verbatim.
    Bytes(Vec<u8>),
    /// Serialized to JSON with a `application/json` content type.
    Json(Value),
}

/// A registered HTTP handler: its descriptor plus the callable.
#[derive(Clone)]
pub struct HttpHandlerSpec {
    pub descriptor: HandlerDescriptor,
    pub func: Arc<dyn Fn(BoundParams) -> Result<HandlerResult, anyhow::Error> + Send + Sync>,
}

impl HttpHandlerSpec {
    pub fn new<F>(descriptor: HandlerDescriptor, func: F) -> Self
    where
        F: Fn(BoundParams) -> Result<HandlerResult, anyhow::Error> + Send + Sync + 'static,
    {
        Self {
            descriptor,
            func: Arc::new(func),
        }
    }
}

/// Everything the binder may draw on for one invocation.
pub struct BindContext<'a> {
    pub args: &'a ArgMap,
    pub request: Option<Arc<HttpRequest>>,
    pub logger: RequestLogger,
    pub connection: Option<Arc<dyn WsConnection>>,
    pub session: Option<SessionValue>,
    pub injector: &'a Injector,
    pub request_id: &'a str,
}

/// Walk `descriptor` and materialize one value per role.
pub fn bind(descriptor: &HandlerDescriptor, ctx: &BindContext<'_>) -> BoundParams {
    let mut input_taken = false;
    let values = descriptor
        .roles()
        .iter()
        .map(|role| match role {
            ParamRole::Input => {
                if input_taken {
                    return BoundValue::Zero;
                }
                input_taken = true;
                BoundValue::Input(Value::Object(ctx.args.clone()))
            }
            ParamRole::Headers => match &ctx.request {
                Some(req) => {
                    let map = req
                        .headers
                        .iter()
                        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                        .collect();
                    BoundValue::Headers(Value::Object(map))
                }
                None => BoundValue::Zero,
            },
            ParamRole::Request => match &ctx.request {
                Some(req) => BoundValue::Request(req.clone()),
                None => BoundValue::Zero,
            },
            ParamRole::Logger => {
                let logger = ctx.logger.clone();
                BoundValue::Logger(logger)
            }
            ParamRole::Connection => match &ctx.connection {
                Some(conn) => BoundValue::Connection(conn.clone()),
                None => BoundValue::Zero,
            },
            ParamRole::Session => match &ctx.session {
                Some(session) => BoundValue::Session(session.clone()),
                None => BoundValue::Zero,
            },
            ParamRole::Injected(type_id) => match ctx.injector.get(*type_id, ctx.request_id) {
                Some(obj) => {
                    obj.set_logger(&ctx.logger);
                    BoundValue::Injected(obj)
                }
                None => BoundValue::Zero,
            },
        })
        .collect();
    BoundParams::new(values)
}

/// Argument-map assembly failure.
#[derive(Debug, Error)]
pub enum ArgError {
    #[error("malformed JSON body: {0}")]
    MalformedJson(#[from] serde_json::Error),
}

/// Assemble the argument map for `req`, seeding it with the router's path
/// captures. Later sources overwrite earlier ones: captures, then the
/// original target's query when a rewrite replaced the path, then the query
/// string, then a url-encoded form body, then a JSON body. A JSON body that
/// is not an object lands under the `"request"` key.
pub fn assemble_args(
    req: &HttpRequest,
    captures: &[(String, String)],
) -> Result<ArgMap, ArgError> {
    let mut args = ArgMap::new();
    for (name, value) in captures {
        args.insert(name.clone(), Value::String(value.clone()));
    }

    // A rewrite collaborator replaced the path; the query of the original
    // target still contributes arguments, at lower precedence.
    if !req.raw_target.contains(&req.path) {
        if let Some((_, original_query)) = req.raw_target.split_once('?') {
            merge_encoded_pairs(&mut args, original_query);
        }
    }

    if let Some(query) = &req.query {
        merge_encoded_pairs(&mut args, query);
    }

    let content_type = req.content_type().unwrap_or_default();
    if let Some(body) = &req.body {
        if content_type == "application/x-www-form-urlencoded" {
            let text = String::from_utf8_lossy(body);
            merge_encoded_pairs(&mut args, &text);
        } else if content_type == "application/json" || content_type.ends_with("+json") {
            let trimmed: &[u8] = body;
            if !trimmed.is_empty() {
                let parsed: Value = serde_json::from_slice(trimmed)?;
                match parsed {
                    Value::Object(map) => {
                        for (k, v) in map {
                            args.insert(k, v);
                        }
                    }
                    other => {
                        args.insert("request".to_string(), other);
                    }
                }
            }
        }
    }

    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use serde::Deserialize;
    use serde_json::json;

    fn post_json(target: &str, body: &str) -> HttpRequest {
        let mut req = HttpRequest::new(Method::POST, target);
        req.set_header("content-type", "application/json");
        req.body = Some(body.as_bytes().to_vec());
        req
    }

    #[test]
    fn captures_come_before_everything() {
        let req = HttpRequest::new(Method::GET, "/users/42?x=1");
        let args = assemble_args(&req, &[("id".to_string(), "42".to_string())]).unwrap();
        assert_eq!(args["id"], json!("42"));
        assert_eq!(args["x"], json!("1"));
    }

    #[test]
    fn json_body_overwrites_query() {
        let req = post_json("/a?k=query", r#"{"k": "body", "n": 7}"#);
        let args = assemble_args(&req, &[]).unwrap();
        assert_eq!(args["k"], json!("body"));
        assert_eq!(args["n"], json!(7));
    }

    #[test]
    fn non_object_json_body_wraps_under_request() {
        let req = post_json("/a", "[1, 2, 3]");
        let args = assemble_args(&req, &[]).unwrap();
        assert_eq!(args["request"], json!([1, 2, 3]));
    }

    #[test]
    fn malformed_json_is_an_error() {
        let req = post_json("/a", "{not json");
        assert!(assemble_args(&req, &[]).is_err());
    }

    #[test]
    fn form_body_merges() {
        let mut req = HttpRequest::new(Method::POST, "/a");
        req.set_header("content-type", "application/x-www-form-urlencoded");
        req.body = Some(b"a=1&b=two".to_vec());
        let args = assemble_args(&req, &[]).unwrap();
        assert_eq!(args["a"], json!("1"));
        assert_eq!(args["b"], json!("two"));
    }

    #[test]
    fn rewritten_path_keeps_original_query_at_low_precedence() {
        let mut req = HttpRequest::new(Method::GET, "/old?from=original&k=old");
        req.path = "/new".to_string();
        req.query = Some("k=new".to_string());
        let args = assemble_args(&req, &[]).unwrap();
        assert_eq!(args["from"], json!("original"));
        assert_eq!(args["k"], json!("new"));
    }

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Params {
        id: u64,
        name: String,
    }

    #[test]
    fn bound_input_converts_leniently() {
        let mut args = ArgMap::new();
        args.insert("id".to_string(), json!("42"));
        args.insert("name".to_string(), json!("alice"));
        args.insert("extra".to_string(), json!(true));
        let injector = Injector::new();
        let ctx = BindContext {
            args: &args,
            request: None,
            logger: RequestLogger::new("r1"),
            connection: None,
            session: None,
            injector: &injector,
            request_id: "r1",
        };
        let descriptor = HandlerDescriptor::new(vec![ParamRole::Input]);
        let params = bind(&descriptor, &ctx);
        let parsed: Params = params.input();
        assert_eq!(
            parsed,
            Params {
                id: 42,
                name: "alice".to_string()
            }
        );
    }

    #[test]
    fn second_input_role_binds_to_zero() {
        let args = ArgMap::new();
        let injector = Injector::new();
        let ctx = BindContext {
            args: &args,
            request: None,
            logger: RequestLogger::new("r1"),
            connection: None,
            session: None,
            injector: &injector,
            request_id: "r1",
        };
        let descriptor = HandlerDescriptor::new(vec![ParamRole::Input, ParamRole::Input]);
        let params = bind(&descriptor, &ctx);
        assert!(matches!(params.0[0], BoundValue::Input(_)));
        assert!(matches!(params.0[1], BoundValue::Zero));
    }
}
