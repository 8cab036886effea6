/*!
Transport-facing dispatcher: turns a normalized request descriptor into a
status code and an optional JSON payload
*/

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::core::{
    accounts::AccountManager,
    checks::CheckManager,
    error::{ServiceError, ServiceResult},
    models::{AccountChanges, CheckFields, Registration},
    sessions::SessionManager,
};

/// One inbound operation as handed over by the transport layer
#[derive(Debug, Clone)]
pub struct Request {
    /// Lower-cased HTTP method
    pub method: String,
    /// Path with every `/` removed
    pub path: String,
    /// Header names are lower-cased
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    /// Always a JSON object
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub payload: Option<Value>,
}

impl Request {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_lowercase(),
            path: normalize_path(path),
            headers: HashMap::new(),
            query: HashMap::new(),
            payload: json!({}),
        }
    }

    /// Build a request from raw transport pieces. A malformed or absent body
    /// becomes an empty object.
    pub fn from_raw(
        method: &str,
        path: &str,
        headers: HashMap<String, String>,
        query: HashMap<String, String>,
        body: &str,
    ) -> Self {
        let mut request = Self::new(method, path);
        request.headers = headers
            .into_iter()
            .map(|(name, value)| (name.to_lowercase(), value))
            .collect();
        request.query = query;
        request.payload = parse_payload(body);
        request
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_lowercase(), value.to_string());
        self
    }

    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.query.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = if payload.is_object() { payload } else { json!({}) };
        self
    }

    fn token(&self) -> &str {
        self.headers.get("token").map(String::as_str).unwrap_or_default()
    }

    fn query_param(&self, name: &str) -> &str {
        self.query.get(name).map(String::as_str).unwrap_or_default()
    }

    /// A payload field converted with `convert`. Absent and `null` fields
    /// are `None`; a field of the wrong type is invalid input.
    fn field<T>(
        &self,
        name: &str,
        convert: impl FnOnce(&Value) -> Option<T>,
    ) -> ServiceResult<Option<T>> {
        match self.payload.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => convert(value)
                .map(Some)
                .ok_or_else(|| ServiceError::InvalidInput(format!("Invalid value for {name}"))),
        }
    }

    fn text(&self, name: &str) -> ServiceResult<Option<String>> {
        self.field(name, |value| value.as_str().map(str::to_string))
    }

    fn flag(&self, name: &str) -> ServiceResult<Option<bool>> {
        self.field(name, Value::as_bool)
    }

    fn integer(&self, name: &str) -> ServiceResult<Option<i64>> {
        self.field(name, Value::as_i64)
    }

    /// An array of integers; any non-integer element makes the whole field
    /// invalid
    fn integers(&self, name: &str) -> ServiceResult<Option<Vec<i64>>> {
        self.field(name, |value| {
            value
                .as_array()
                .and_then(|items| items.iter().map(Value::as_i64).collect())
        })
    }

    fn check_fields(&self) -> ServiceResult<CheckFields> {
        Ok(CheckFields {
            protocol: self.text("protocol")?,
            url: self.text("url")?,
            method: self.text("method")?,
            success_codes: self.integers("successCodes")?,
            timeout_seconds: self.integer("timeoutSeconds")?,
        })
    }
}

impl Response {
    pub fn ok() -> Self {
        Self {
            status: 200,
            payload: None,
        }
    }

    pub fn json<T: Serialize>(value: &T) -> ServiceResult<Self> {
        let payload = serde_json::to_value(value)
            .map_err(|e| ServiceError::Internal(format!("could not encode response: {e}")))?;
        Ok(Self {
            status: 200,
            payload: Some(payload),
        })
    }

    pub fn not_found() -> Self {
        Self {
            status: 404,
            payload: None,
        }
    }

    pub fn from_error(err: &ServiceError) -> Self {
        Self {
            status: err.status_code(),
            payload: Some(json!({ "Error": err.public_message() })),
        }
    }

    /// Serialized body; an absent payload is sent as `{}`
    pub fn body(&self) -> String {
        self.payload
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_else(|| "{}".to_string())
    }
}

pub fn normalize_path(path: &str) -> String {
    path.replace('/', "")
}

pub fn parse_payload(body: &str) -> Value {
    match serde_json::from_str::<Value>(body) {
        Ok(value) if value.is_object() => value,
        _ => json!({}),
    }
}

/// Trait for request handlers mounted on a path
#[async_trait]
pub trait Handler: Send + Sync {
    /// Normalized path this handler serves
    fn name(&self) -> &'static str;

    async fn handle(&self, request: &Request) -> ServiceResult<Response>;
}

/// Routes requests to handlers by normalized path
pub struct Router {
    handlers: HashMap<&'static str, Box<dyn Handler>>,
}

impl Router {
    pub fn new(
        accounts: Arc<AccountManager>,
        sessions: Arc<SessionManager>,
        checks: Arc<CheckManager>,
    ) -> Self {
        let handlers: Vec<Box<dyn Handler>> = vec![
            Box::new(PingHandler),
            Box::new(UsersHandler { accounts }),
            Box::new(TokensHandler { sessions }),
            Box::new(ChecksHandler { checks }),
        ];

        Self {
            handlers: handlers
                .into_iter()
                .map(|handler| (handler.name(), handler))
                .collect(),
        }
    }

    pub async fn dispatch(&self, request: &Request) -> Response {
        let response = match self.handlers.get(request.path.as_str()) {
            Some(handler) => match handler.handle(request).await {
                Ok(response) => response,
                Err(e) => {
                    if e.status_code() >= 500 {
                        error!("{} /{} failed: {}", request.method, request.path, e);
                    }
                    Response::from_error(&e)
                }
            },
            None => Response::not_found(),
        };

        if response.status == 200 {
            info!("{} /{} {}", request.method.to_uppercase(), request.path, response.status);
        } else {
            warn!("{} /{} {}", request.method.to_uppercase(), request.path, response.status);
        }
        response
    }
}

struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    fn name(&self) -> &'static str {
        "ping"
    }

    async fn handle(&self, _request: &Request) -> ServiceResult<Response> {
        Ok(Response::ok())
    }
}

struct UsersHandler {
    accounts: Arc<AccountManager>,
}

#[async_trait]
impl Handler for UsersHandler {
    fn name(&self) -> &'static str {
        "users"
    }

    async fn handle(&self, request: &Request) -> ServiceResult<Response> {
        match request.method.as_str() {
            "post" => {
                let registration = Registration {
                    first_name: request.text("firstName")?,
                    last_name: request.text("lastName")?,
                    phone: request.text("phone")?,
                    password: request.text("password")?,
                    tos_agreement: request.flag("tosAgreement")?,
                };
                self.accounts.register(registration).await?;
                Ok(Response::ok())
            }
            "get" => {
                let account = self
                    .accounts
                    .get(request.query_param("phone"), request.token())
                    .await?;
                Response::json(&account)
            }
            "put" => {
                let phone = request.text("phone")?.unwrap_or_default();
                let changes = AccountChanges {
                    first_name: request.text("firstName")?,
                    last_name: request.text("lastName")?,
                    password: request.text("password")?,
                };
                let account = self.accounts.update(&phone, request.token(), changes).await?;
                Response::json(&account)
            }
            "delete" => {
                self.accounts
                    .delete(request.query_param("phone"), request.token())
                    .await?;
                Ok(Response::ok())
            }
            _ => Err(ServiceError::MethodNotAllowed),
        }
    }
}

struct TokensHandler {
    sessions: Arc<SessionManager>,
}

#[async_trait]
impl Handler for TokensHandler {
    fn name(&self) -> &'static str {
        "tokens"
    }

    async fn handle(&self, request: &Request) -> ServiceResult<Response> {
        match request.method.as_str() {
            "post" => {
                let phone = request.text("phone")?.unwrap_or_default();
                let password = request.text("password")?.unwrap_or_default();
                let token = self.sessions.login(&phone, &password).await?;
                Response::json(&token)
            }
            "get" => {
                let token = self.sessions.lookup(request.query_param("id")).await?;
                Response::json(&token)
            }
            "put" => {
                let id = request.text("id")?.unwrap_or_default();
                if request.flag("extend")? != Some(true) {
                    return Err(ServiceError::missing_fields());
                }
                let token = self.sessions.extend(&id).await?;
                Response::json(&token)
            }
            "delete" => {
                self.sessions.revoke(request.query_param("id")).await?;
                Ok(Response::ok())
            }
            _ => Err(ServiceError::MethodNotAllowed),
        }
    }
}

struct ChecksHandler {
    checks: Arc<CheckManager>,
}

#[async_trait]
impl Handler for ChecksHandler {
    fn name(&self) -> &'static str {
        "checks"
    }

    async fn handle(&self, request: &Request) -> ServiceResult<Response> {
        match request.method.as_str() {
            "post" => {
                let check = self
                    .checks
                    .create(request.token(), request.check_fields()?)
                    .await?;
                Response::json(&check)
            }
            "get" => {
                let check = self
                    .checks
                    .get(request.query_param("id"), request.token())
                    .await?;
                Response::json(&check)
            }
            "put" => {
                let id = request.text("id")?.unwrap_or_default();
                let check = self
                    .checks
                    .update(&id, request.token(), request.check_fields()?)
                    .await?;
                Response::json(&check)
            }
            "delete" => {
                self.checks
                    .delete(request.query_param("id"), request.token())
                    .await?;
                Ok(Response::ok())
            }
            _ => Err(ServiceError::MethodNotAllowed),
        }
    }
}
