//! Resolves the caller once per request and stores the resulting
//! `ActorIdentity` in request extensions. Never rejects a request.

use crate::services::actor_resolver::ActorResolver;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

pub async fn resolve_actor(
    State(resolver): State<Arc<ActorResolver>>,
    mut request: Request,
    next: Next,
) -> Response {
    let actor = resolver.resolve(request.headers()).await;
    request.extensions_mut().insert(actor);
    next.run(request).await
}
