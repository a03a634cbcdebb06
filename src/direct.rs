//! Direct egress: dial the requested target with no protocol wrapping.

use async_trait::async_trait;
use url::Url;

use crate::addr::TargetAddr;
use crate::error::Result;
use crate::registry::Client;
use crate::stream::BoxedStream;

pub const NAME: &str = "direct";

pub struct DirectClient;

impl DirectClient {
    pub fn new(_url: &Url) -> DirectClient {
        DirectClient
    }
}

#[async_trait]
impl Client for DirectClient {
    fn name(&self) -> &'static str {
        NAME
    }

    fn addr(&self) -> &str {
        // No relay: the supervisor dials the target itself.
        NAME
    }

    async fn handshake(&self, underlay: BoxedStream, _target: &TargetAddr) -> Result<BoxedStream> {
        Ok(underlay)
    }
}
