use anyhow::Result;
use async_trait::async_trait;

use super::{DispatchOutcome, Handler};
use crate::platform::NormalizedMessage;

/// Last stage of the chain: claims everything, replies to nothing.
pub struct FallbackHandler;

#[async_trait]
impl Handler for FallbackHandler {
    fn name(&self) -> &'static str {
        "FallbackHandler"
    }

    async fn handle(&self, _msg: &NormalizedMessage) -> Result<DispatchOutcome> {
        Ok(DispatchOutcome::claimed(None))
    }
}
