// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The ORB: process-wide POA vector, the table of outbound sessions, the
//! inbound acceptors for each enabled transport, and the configuration
//! consumed by them (plus the knobs the external HTTP/QUIC/SSR adapters
//! read).
//!
//! There are no process-wide singletons: the application creates a
//! [`Runtime`] through [`RpcBuilder`] and threads it through the dispatch
//! path explicitly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use log::*;

use crate::endpoint::{EndPoint, EndPointType};
use crate::object::{Object, ObjectActivationFlags, ObjectId};
use crate::poa::Poa;
use crate::session::Session;
use crate::transport::{shm, tcp, udp, ws};
use crate::Error;

/// Gate on the runtime's own per-call logging, separate from the `log`
/// filter so `RUST_LOG=debug` alone does not flood call traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DebugLevel {
    None,
    Critical,
    EveryCall,
    EveryMessageContent,
}

/// Everything `RpcBuilder` collects. The HTTP/QUIC/SSR fields are carried
/// for the external adapters; the core consumes the TCP/WS/UDP/SHM
/// settings only.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub hostname: String,
    pub debug_level: DebugLevel,
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
    pub ws_port: Option<u16>,
    pub http_port: Option<u16>,
    pub quic_port: Option<u16>,
    pub shm_listener_name: Option<String>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub static_root: Option<PathBuf>,
    pub ssr_handler_dir: Option<PathBuf>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            debug_level: DebugLevel::None,
            tcp_port: None,
            udp_port: None,
            ws_port: None,
            http_port: None,
            quic_port: None,
            shm_listener_name: None,
            tls_cert_path: None,
            tls_key_path: None,
            static_root: None,
            ssr_handler_dir: None,
        }
    }
}

/// Fluent runtime construction. Ports may be 0 to request an ephemeral
/// port; read the bound port back from the runtime.
#[derive(Default)]
pub struct RpcBuilder {
    cfg: RpcConfig,
}

impl RpcBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.cfg.hostname = hostname.into();
        self
    }

    pub fn set_debug_level(mut self, level: DebugLevel) -> Self {
        self.cfg.debug_level = level;
        self
    }

    pub fn with_tcp(mut self, port: u16) -> Self {
        self.cfg.tcp_port = Some(port);
        self
    }

    pub fn with_udp(mut self, port: u16) -> Self {
        self.cfg.udp_port = Some(port);
        self
    }

    pub fn with_websocket(mut self, port: u16) -> Self {
        self.cfg.ws_port = Some(port);
        self
    }

    pub fn with_http(mut self, port: u16) -> Self {
        self.cfg.http_port = Some(port);
        self
    }

    pub fn with_quic(mut self, port: u16) -> Self {
        self.cfg.quic_port = Some(port);
        self
    }

    pub fn with_shared_memory(mut self, listener_name: impl Into<String>) -> Self {
        self.cfg.shm_listener_name = Some(listener_name.into());
        self
    }

    pub fn with_tls(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.cfg.tls_cert_path = Some(cert.into());
        self.cfg.tls_key_path = Some(key.into());
        self
    }

    pub fn with_static_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cfg.static_root = Some(root.into());
        self
    }

    pub fn with_ssr_handlers(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cfg.ssr_handler_dir = Some(dir.into());
        self
    }

    /// Bind every enabled acceptor and hand back the running ORB.
    pub fn build(self) -> Result<Arc<Runtime>, Error> {
        let rt = Arc::new(Runtime {
            cfg: self.cfg,
            poas: RwLock::new(Vec::new()),
            sessions: Mutex::new(HashMap::new()),
            tcp: Mutex::new(None),
            ws: Mutex::new(None),
            udp: Mutex::new(None),
            shm: Mutex::new(None),
        });

        if let Some(port) = rt.cfg.tcp_port {
            *rt.tcp.lock().unwrap() = Some(tcp::start_server(&rt, port)?);
        }
        if let Some(port) = rt.cfg.ws_port {
            *rt.ws.lock().unwrap() = Some(ws::start_server(&rt, port)?);
        }
        if let Some(port) = rt.cfg.udp_port {
            *rt.udp.lock().unwrap() = Some(udp::start_server(&rt, port)?);
        }
        if let Some(name) = rt.cfg.shm_listener_name.clone() {
            *rt.shm.lock().unwrap() = Some(shm::start_server(&rt, &name)?);
        }

        Ok(rt)
    }
}

pub struct Runtime {
    cfg: RpcConfig,
    poas: RwLock<Vec<Arc<Poa>>>,
    sessions: Mutex<HashMap<EndPoint, Arc<dyn Session>>>,
    tcp: Mutex<Option<tcp::AcceptorHandle>>,
    ws: Mutex<Option<tcp::AcceptorHandle>>,
    udp: Mutex<Option<tcp::AcceptorHandle>>,
    shm: Mutex<Option<shm::ShmAcceptorHandle>>,
}

impl Runtime {
    pub fn builder() -> RpcBuilder {
        RpcBuilder::new()
    }

    pub fn config(&self) -> &RpcConfig {
        &self.cfg
    }

    pub fn debug_level(&self) -> DebugLevel {
        self.cfg.debug_level
    }

    pub fn hostname(&self) -> &str {
        &self.cfg.hostname
    }

    /// The actually-bound TCP port, once the acceptor is up.
    pub fn tcp_port(&self) -> Option<u16> {
        self.tcp.lock().unwrap().as_ref().map(|a| a.port())
    }

    pub fn ws_port(&self) -> Option<u16> {
        self.ws.lock().unwrap().as_ref().map(|a| a.port())
    }

    pub fn udp_port(&self) -> Option<u16> {
        self.udp.lock().unwrap().as_ref().map(|a| a.port())
    }

    pub fn shm_listener_name(&self) -> Option<String> {
        self.shm.lock().unwrap().as_ref().map(|a| a.name().to_string())
    }

    /// Append a POA to the process-wide vector (append-only after
    /// startup) and hand it its index.
    pub(crate) fn register_poa(&self, make: impl FnOnce(u16) -> Poa) -> Arc<Poa> {
        let mut poas = self.poas.write().unwrap();
        let index = poas.len() as u16;
        let poa = Arc::new(make(index));
        poas.push(Arc::clone(&poa));
        poa
    }

    pub fn get_poa(&self, idx: u16) -> Option<Arc<Poa>> {
        self.poas.read().unwrap().get(idx as usize).cloned()
    }

    /// The endpoint URLs a fresh activation advertises, filtered by its
    /// activation flags and by which listeners are actually running.
    pub(crate) fn advertised_urls(&self, flags: ObjectActivationFlags) -> Vec<String> {
        let mut urls = Vec::new();

        if flags.contains(ObjectActivationFlags::ALLOW_SHARED_MEMORY) {
            if let Some(name) = self.shm_listener_name() {
                urls.push(format!("mem://{name}"));
            }
        }
        if flags.contains(ObjectActivationFlags::ALLOW_TCP) {
            if let Some(port) = self.tcp_port() {
                urls.push(format!("tcp://{}:{}", self.cfg.hostname, port));
            }
        }
        if flags.contains(ObjectActivationFlags::ALLOW_WEBSOCKET) {
            if let Some(port) = self.ws_port() {
                urls.push(format!("ws://{}:{}", self.cfg.hostname, port));
            }
        }
        if flags.contains(ObjectActivationFlags::ALLOW_UDP) {
            if let Some(port) = self.udp_port() {
                urls.push(format!("udp://{}:{}", self.cfg.hostname, port));
            }
        }

        urls
    }

    /// The outbound session for `endpoint`, from the table or freshly
    /// constructed. Closed sessions are evicted and replaced.
    pub fn get_session(self: &Arc<Self>, endpoint: &EndPoint) -> Result<Arc<dyn Session>, Error> {
        {
            let sessions = self.sessions.lock().unwrap();
            if let Some(session) = sessions.get(endpoint) {
                if !session.is_closed() {
                    return Ok(Arc::clone(session));
                }
            }
        }

        let session: Arc<dyn Session> = match endpoint.type_() {
            EndPointType::Tcp => tcp::TcpSession::connect(endpoint)?,
            EndPointType::WebSocket | EndPointType::SecuredWebSocket => {
                ws::WsSession::connect(endpoint)?
            }
            EndPointType::Udp => udp::UdpSession::connect(endpoint)?,
            EndPointType::SharedMemory => shm::ShmSession::connect(endpoint)?,
            EndPointType::Http | EndPointType::SecuredHttp | EndPointType::Quic => {
                // Served by the external front-end adapters, not the core.
                return Err(Error::BadInput);
            }
        };

        debug!("session established with {endpoint}");

        let mut sessions = self.sessions.lock().unwrap();
        if let Some(stale) = sessions.insert(endpoint.clone(), Arc::clone(&session)) {
            if !stale.is_closed() {
                stale.close();
            }
        }
        Ok(session)
    }

    /// Build a proxy reference from a marshalled object identity
    /// (`None` for the invalid/null reference).
    pub fn create_object_from_id(self: &Arc<Self>, data: ObjectId) -> Option<Arc<Object>> {
        if !data.is_valid() {
            return None;
        }
        Some(Object::new(Arc::clone(self), data))
    }

    /// Stop every acceptor and close every outbound session. POAs stay
    /// registered (the vector is append-only for the process lifetime).
    pub fn destroy(&self) {
        if let Some(mut acceptor) = self.tcp.lock().unwrap().take() {
            acceptor.stop();
        }
        if let Some(mut acceptor) = self.ws.lock().unwrap().take() {
            acceptor.stop();
        }
        if let Some(mut acceptor) = self.udp.lock().unwrap().take() {
            acceptor.stop();
        }
        if let Some(mut acceptor) = self.shm.lock().unwrap().take() {
            acceptor.stop();
        }

        for (_, session) in self.sessions.lock().unwrap().drain() {
            session.close();
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_config() {
        let builder = RpcBuilder::new()
            .set_hostname("10.1.1.1")
            .set_debug_level(DebugLevel::EveryCall)
            .with_http(8080)
            .with_quic(8443)
            .with_tls("/tmp/cert.pem", "/tmp/key.pem")
            .with_static_root("/srv/www");

        let cfg = &builder.cfg;
        assert_eq!(cfg.hostname, "10.1.1.1");
        assert_eq!(cfg.debug_level, DebugLevel::EveryCall);
        assert_eq!(cfg.http_port, Some(8080));
        assert_eq!(cfg.quic_port, Some(8443));
        assert!(cfg.tls_cert_path.is_some());
        assert!(cfg.static_root.is_some());
        assert_eq!(cfg.tcp_port, None);
    }

    #[test]
    fn debug_levels_are_ordered() {
        assert!(DebugLevel::None < DebugLevel::Critical);
        assert!(DebugLevel::Critical < DebugLevel::EveryCall);
        assert!(DebugLevel::EveryCall < DebugLevel::EveryMessageContent);
    }
}
