//! Engine connection
//!
//! Wraps a [`Transport`] with the retry interceptor and records the change
//! list of every response into the calling context's change scope.

use serde_json::Value;
use std::sync::Arc;
use tracing::trace;

use crate::context::RequestContext;
use crate::error::Result;
use crate::retry::RetryInterceptor;
use crate::rpc::{Handle, RpcRequest};
use crate::transport::Transport;

pub struct EngineConnection {
    transport: Arc<dyn Transport>,
    interceptor: RetryInterceptor,
}

impl EngineConnection {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            interceptor: RetryInterceptor::new(),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Invoke `method` on `handle` within `ctx`.
    ///
    /// Each attempt is bounded by the context. Changes reported by every
    /// attempt land in the context's change scope, errors carry the method
    /// and handle.
    pub async fn call(
        &self,
        ctx: &RequestContext,
        handle: Handle,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        let request = RpcRequest::new(handle, method, params);
        let transport = &self.transport;

        let response = self
            .interceptor
            .invoke(ctx, || {
                let request = request.clone();
                async move {
                    let response = ctx.run(transport.call(request)).await?;
                    ctx.changes().record(response.changes());
                    Ok(response)
                }
            })
            .await
            .map_err(|e| e.context(format!("{} on handle {}", method, handle)))?;

        trace!(handle, method, "Call completed");

        response
            .into_result()
            .map_err(|e| e.context(format!("{} on handle {}", method, handle)))
    }
}
