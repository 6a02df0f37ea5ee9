//! Handler registry: one table serving native frame types and virtual-HTTP
//! routes through a single match algorithm.
//!
//! Route patterns are regexes with named captures, pre-compiled at
//! registration; lookup is a linear scan (O(routes), first match wins).
//! Every entry carries a scope constraint that the router checks against
//! the session before the handler runs.

use chan_protocol::{ClientFrame, EndpointRequest, HttpMethod, InjectedIdentity, Scope, ServerFrame};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

use crate::error::GatewayError;
use crate::state::AppState;
use crate::tables::Session;

/// Named captures extracted from a matched route pattern.
pub type RouteParams = HashMap<String, String>;

/// Evaluation context for a native frame handler.  Runs on the request
/// worker that owns the connection.
pub struct NativeContext {
    pub state: AppState,
    pub fd: u64,
    pub remote_addr: String,
    pub trace_id: String,
    pub session: Option<Session>,
    pub frame: ClientFrame,
}

/// Evaluation context for a virtual-HTTP endpoint handler.  Built fresh per
/// task from the dispatch envelope; nothing leaks between frames.
pub struct EndpointContext {
    pub state: AppState,
    /// The executing task worker's own cache plane (private L1, shared L2).
    pub cache: crate::cache::CachePlane,
    pub request: EndpointRequest,
    pub params: RouteParams,
    pub identity: Option<InjectedIdentity>,
    /// True only for server-originated calls; gates `Scope::System`.
    pub internal: bool,
    pub trace_id: String,
}

pub type NativeResult = Result<Option<ServerFrame>, GatewayError>;
pub type NativeFuture = Pin<Box<dyn Future<Output = NativeResult> + Send>>;
pub type NativeHandler = Arc<dyn Fn(NativeContext) -> NativeFuture + Send + Sync>;

pub type EndpointResult = Result<Value, GatewayError>;
pub type EndpointFuture = Pin<Box<dyn Future<Output = EndpointResult> + Send>>;
pub type EndpointHandler = Arc<dyn Fn(EndpointContext) -> EndpointFuture + Send + Sync>;

pub struct NativeEntry {
    pub scope: Scope,
    pub handler: NativeHandler,
}

pub struct EndpointEntry {
    pub methods: Vec<HttpMethod>,
    pub scope: Scope,
    pub handler: EndpointHandler,
    pattern: Regex,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid route pattern '{pattern}': {detail}")]
    InvalidPattern { pattern: String, detail: String },
    #[error("duplicate native frame type '{0}'")]
    DuplicateNative(String),
}

#[derive(Default)]
pub struct HandlerRegistry {
    native: HashMap<String, NativeEntry>,
    endpoints: Vec<EndpointEntry>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a native frame type by exact name.
    pub fn register_native(
        &mut self,
        frame_type: &str,
        scope: Scope,
        handler: NativeHandler,
    ) -> Result<(), RegistryError> {
        if self.native.contains_key(frame_type) {
            return Err(RegistryError::DuplicateNative(frame_type.to_owned()));
        }
        self.native
            .insert(frame_type.to_owned(), NativeEntry { scope, handler });
        Ok(())
    }

    /// Register a virtual-HTTP route.  The pattern is anchored to the whole
    /// path and may contain named captures, e.g. `/edc/v1/forms/(?P<id>\d+)`.
    pub fn register(
        &mut self,
        methods: &[HttpMethod],
        pattern: &str,
        scope: Scope,
        handler: EndpointHandler,
    ) -> Result<(), RegistryError> {
        let anchored = format!("^{pattern}$");
        let compiled = Regex::new(&anchored).map_err(|e| RegistryError::InvalidPattern {
            pattern: pattern.to_owned(),
            detail: e.to_string(),
        })?;
        self.endpoints.push(EndpointEntry {
            methods: methods.to_vec(),
            scope,
            handler,
            pattern: compiled,
        });
        Ok(())
    }

    pub fn native_entry(&self, frame_type: &str) -> Option<&NativeEntry> {
        self.native.get(frame_type)
    }

    /// First registered entry whose method set and pattern match, plus its
    /// capture map.
    pub fn match_endpoint(
        &self,
        method: HttpMethod,
        path: &str,
    ) -> Option<(&EndpointEntry, RouteParams)> {
        self.endpoints
            .iter()
            .filter(|entry| entry.methods.contains(&method))
            .find_map(|entry| {
                let captures = entry.pattern.captures(path)?;
                let params = entry
                    .pattern
                    .capture_names()
                    .flatten()
                    .filter_map(|name| {
                        captures
                            .name(name)
                            .map(|m| (name.to_owned(), m.as_str().to_owned()))
                    })
                    .collect();
                Some((entry, params))
            })
    }
}

/// Enforce an entry's scope against the caller.
///
/// `Public` always passes; `System` requires a server-originated call and is
/// never reachable from a client connection; everything else requires an
/// authenticated session.
pub fn check_scope(scope: Scope, session_present: bool, internal: bool) -> Result<(), GatewayError> {
    match scope {
        Scope::Public => Ok(()),
        Scope::System => {
            if internal {
                Ok(())
            } else {
                Err(GatewayError::Unauthorized)
            }
        }
        Scope::Read | Scope::Write | Scope::Private => {
            if session_present {
                Ok(())
            } else {
                Err(GatewayError::Unauthenticated)
            }
        }
    }
}
