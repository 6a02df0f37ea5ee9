//! Built-in handler registrations: the eight native frame types plus the
//! `/_internal` system endpoints.

pub mod native;
pub mod system;

use chan_protocol::{HttpMethod, Scope};
use std::sync::Arc;

use crate::registry::{HandlerRegistry, RegistryError};

/// The registry every gateway starts from.  Deployments append their own
/// virtual-HTTP endpoints before handing the registry to `AppState::new`.
pub fn builtin() -> Result<HandlerRegistry, RegistryError> {
    let mut registry = HandlerRegistry::new();

    registry.register_native("auth", Scope::Public, Arc::new(|ctx| Box::pin(native::auth(ctx))))?;
    registry.register_native("ping", Scope::Public, Arc::new(|ctx| Box::pin(native::ping(ctx))))?;
    registry.register_native(
        "subscribe",
        Scope::Read,
        Arc::new(|ctx| Box::pin(native::subscribe(ctx))),
    )?;
    registry.register_native(
        "unsubscribe",
        Scope::Read,
        Arc::new(|ctx| Box::pin(native::unsubscribe(ctx))),
    )?;
    registry.register_native(
        "publish",
        Scope::Write,
        Arc::new(|ctx| Box::pin(native::publish(ctx))),
    )?;
    registry.register_native("ack", Scope::Write, Arc::new(|ctx| Box::pin(native::ack(ctx))))?;
    registry.register_native(
        "pending",
        Scope::Read,
        Arc::new(|ctx| Box::pin(native::pending(ctx))),
    )?;
    registry.register_native(
        "fingerprint",
        Scope::Private,
        Arc::new(|ctx| Box::pin(native::fingerprint(ctx))),
    )?;

    registry.register(
        &[HttpMethod::Get],
        "/_internal/cache/get",
        Scope::System,
        Arc::new(|ctx| Box::pin(system::cache_get(ctx))),
    )?;
    registry.register(
        &[HttpMethod::Post],
        "/_internal/cache/set",
        Scope::System,
        Arc::new(|ctx| Box::pin(system::cache_set(ctx))),
    )?;
    registry.register(
        &[HttpMethod::Post, HttpMethod::Delete],
        "/_internal/cache/delete",
        Scope::System,
        Arc::new(|ctx| Box::pin(system::cache_delete(ctx))),
    )?;
    registry.register(
        &[HttpMethod::Post],
        "/_internal/flush",
        Scope::System,
        Arc::new(|ctx| Box::pin(system::flush(ctx))),
    )?;

    Ok(registry)
}
