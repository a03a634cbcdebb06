//! Protocol interfaces and URL-driven instantiation.
//!
//! The registry is an explicit value built during startup and handed
//! immutably to the supervisor. Known schemes dispatch through a
//! compile-time match; extra schemes can be registered as extension
//! factories before the registry is frozen behind an `Arc`.

use std::collections::HashMap;

use async_trait::async_trait;
use url::Url;

use crate::addr::TargetAddr;
use crate::direct::DirectClient;
use crate::error::{Error, Result};
use crate::shadowsocks::{ShadowsocksClient, ShadowsocksServer};
use crate::socks5::Socks5Server;
use crate::stream::BoxedStream;
use crate::tls::TlsClient;
use crate::trojan::TrojanClient;
use crate::vless::VlessClient;
use crate::{direct, shadowsocks, socks5, trojan, vless};

/// An egress protocol: wraps a dialed connection for one target.
#[async_trait]
pub trait Client: Send + Sync {
    fn name(&self) -> &'static str;

    /// Relay address this client dials (`host:port`); direct clients
    /// have no fixed address and are dialed against the target itself.
    fn addr(&self) -> &str;

    /// Apply the outbound protocol on `underlay` for `target` and
    /// return the wrapped connection.
    async fn handshake(&self, underlay: BoxedStream, target: &TargetAddr) -> Result<BoxedStream>;
}

/// An ingress protocol: terminates the local side of a connection.
#[async_trait]
pub trait Server: Send + Sync {
    fn name(&self) -> &'static str;

    /// Listen address, `host:port`.
    fn addr(&self) -> &str;

    /// Accept-side handshake; yields the wrapped connection and the
    /// target the application asked for.
    async fn handshake(&self, underlay: BoxedStream) -> Result<(BoxedStream, TargetAddr)>;
}

pub type ClientFactory = Box<dyn Fn(&Url) -> Result<Box<dyn Client>> + Send + Sync>;
pub type ServerFactory = Box<dyn Fn(&Url) -> Result<Box<dyn Server>> + Send + Sync>;

/// Scheme → factory tables. Built once at startup, read-only after.
#[derive(Default)]
pub struct Registry {
    client_ext: HashMap<String, ClientFactory>,
    server_ext: HashMap<String, ServerFactory>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Register an extension client scheme. Startup-time only.
    pub fn register_client(&mut self, scheme: &str, factory: ClientFactory) {
        self.client_ext.insert(scheme.to_ascii_lowercase(), factory);
    }

    /// Register an extension server scheme. Startup-time only.
    pub fn register_server(&mut self, scheme: &str, factory: ServerFactory) {
        self.server_ext.insert(scheme.to_ascii_lowercase(), factory);
    }

    pub fn client(&self, s: &str) -> Result<Box<dyn Client>> {
        let url = Url::parse(s).map_err(|e| Error::config(format!("can not parse client url {}: {}", s, e)))?;
        self.client_from_url(&url)
    }

    pub fn client_from_url(&self, url: &Url) -> Result<Box<dyn Client>> {
        // The url crate lowercases schemes on parse.
        match url.scheme() {
            direct::NAME => Ok(Box::new(DirectClient::new(url))),
            shadowsocks::NAME => Ok(Box::new(ShadowsocksClient::new(url)?)),
            vless::NAME => Ok(Box::new(VlessClient::new(url)?)),
            trojan::NAME => Ok(Box::new(TrojanClient::new(url)?)),
            "vlesss" | "trojans" => {
                let inner = self.client_from_url(&strip_tls_suffix(url)?)?;
                Ok(Box::new(TlsClient::new(url, inner)?))
            }
            scheme => match self.client_ext.get(scheme) {
                Some(factory) => factory(url),
                None => Err(Error::unsupported(format!(
                    "unknown client scheme '{}'",
                    scheme
                ))),
            },
        }
    }

    pub fn server(&self, s: &str) -> Result<Box<dyn Server>> {
        let url = Url::parse(s).map_err(|e| Error::config(format!("can not parse server url {}: {}", s, e)))?;
        self.server_from_url(&url)
    }

    pub fn server_from_url(&self, url: &Url) -> Result<Box<dyn Server>> {
        match url.scheme() {
            socks5::NAME => Ok(Box::new(Socks5Server::new(url)?)),
            shadowsocks::NAME => Ok(Box::new(ShadowsocksServer::new(url)?)),
            scheme => match self.server_ext.get(scheme) {
                Some(factory) => factory(url),
                None => Err(Error::unsupported(format!(
                    "unknown server scheme '{}'",
                    scheme
                ))),
            },
        }
    }
}

/// `vlesss` → `vless`, `trojans` → `trojan`: same URL minus the TLS
/// scheme suffix.
fn strip_tls_suffix(url: &Url) -> Result<Url> {
    let scheme = url.scheme();
    let stripped = &scheme[..scheme.len() - 1];
    let mut inner = url.clone();
    inner
        .set_scheme(stripped)
        .map_err(|_| Error::config(format!("can not derive inner scheme from '{}'", scheme)))?;
    Ok(inner)
}

/// `host:port` of a URL; both parts are required.
pub(crate) fn url_host_port(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::config(format!("missing host in {}", url)))?;
    let port = url
        .port()
        .ok_or_else(|| Error::config(format!("missing port in {}", url)))?;
    Ok(format!("{}:{}", host, port))
}
