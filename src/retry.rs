//! Retry interceptor for single engine calls
//!
//! The engine answers with "generic aborted" when a request was cancelled on
//! its side, typically because a newer request superseded it. Those calls are
//! safe to repeat immediately. Anything else is returned as-is.

use std::future::Future;
use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::error::Result;
use crate::rpc::{RpcResponse, GENERIC_ABORTED};

/// Additional attempts after the first one.
pub const MAX_RETRIES: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct RetryInterceptor {
    max_retries: usize,
}

impl Default for RetryInterceptor {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
        }
    }
}

impl RetryInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoke `call`, repeating it while the engine answers "generic aborted".
    ///
    /// Transport errors and every other response short-circuit. When the
    /// retries run out the last response is returned.
    pub async fn invoke<F, Fut>(&self, ctx: &RequestContext, mut call: F) -> Result<RpcResponse>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<RpcResponse>>,
    {
        let mut retries = 0;
        loop {
            let response = call().await?;

            if response.error_code() != Some(GENERIC_ABORTED) || ctx.retries_disabled() {
                return Ok(response);
            }

            if retries >= self.max_retries {
                warn!(
                    attempts = retries + 1,
                    "Request aborted by engine, retries exhausted"
                );
                return Ok(response);
            }

            retries += 1;
            debug!(retry = retries, "Request aborted by engine, retrying");
        }
    }
}
