// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Endpoint URLs. Stream and datagram schemes require an explicit port;
//! `mem://` carries a channel (listener) id instead.

use std::fmt;
use std::str::FromStr;

use crate::Error;

pub const TCP_PREFIX: &str = "tcp://";
pub const WS_PREFIX: &str = "ws://";
pub const WSS_PREFIX: &str = "wss://";
pub const HTTP_PREFIX: &str = "http://";
pub const HTTPS_PREFIX: &str = "https://";
pub const UDP_PREFIX: &str = "udp://";
pub const QUIC_PREFIX: &str = "quic://";
pub const MEM_PREFIX: &str = "mem://";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndPointType {
    Tcp,
    WebSocket,
    SecuredWebSocket,
    Http,
    SecuredHttp,
    Udp,
    Quic,
    SharedMemory,
}

impl EndPointType {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Tcp => TCP_PREFIX,
            Self::WebSocket => WS_PREFIX,
            Self::SecuredWebSocket => WSS_PREFIX,
            Self::Http => HTTP_PREFIX,
            Self::SecuredHttp => HTTPS_PREFIX,
            Self::Udp => UDP_PREFIX,
            Self::Quic => QUIC_PREFIX,
            Self::SharedMemory => MEM_PREFIX,
        }
    }

    fn requires_port(self) -> bool {
        !matches!(self, Self::SharedMemory)
    }
}

/// One reachable address of an object. For `SharedMemory` the `hostname`
/// holds the listener/channel id and the port is unused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndPoint {
    type_: EndPointType,
    hostname: String,
    port: u16,
}

impl EndPoint {
    pub fn new(type_: EndPointType, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            type_,
            hostname: hostname.into(),
            port,
        }
    }

    pub fn type_(&self) -> EndPointType {
        self.type_
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_ssl(&self) -> bool {
        matches!(
            self.type_,
            EndPointType::SecuredWebSocket | EndPointType::SecuredHttp
        )
    }

    /// For shared memory endpoints, the channel id (stored in `hostname`).
    pub fn memory_channel_id(&self) -> Option<&str> {
        if self.type_ == EndPointType::SharedMemory {
            Some(&self.hostname)
        } else {
            None
        }
    }

    /// `host:port` (or just the channel id for shared memory), without
    /// the scheme prefix.
    pub fn authority(&self) -> String {
        if self.type_ == EndPointType::SharedMemory {
            self.hostname.clone()
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}", self.type_.prefix(), self.authority())
    }
}

impl FromStr for EndPoint {
    type Err = Error;

    fn from_str(url: &str) -> Result<Self, Error> {
        if url.is_empty() {
            return Err(Error::BadInput);
        }

        const TYPES: [EndPointType; 8] = [
            // Longest prefixes first so `wss://` is not mistaken for `ws://`.
            EndPointType::SecuredHttp,
            EndPointType::SecuredWebSocket,
            EndPointType::Http,
            EndPointType::WebSocket,
            EndPointType::Quic,
            EndPointType::Tcp,
            EndPointType::Udp,
            EndPointType::SharedMemory,
        ];

        let (type_, rest) = TYPES
            .iter()
            .find_map(|&t| url.strip_prefix(t.prefix()).map(|rest| (t, rest)))
            .ok_or(Error::BadInput)?;

        match rest.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(Error::BadInput);
                }
                let port = port.parse::<u16>().map_err(|_| Error::BadInput)?;
                Ok(Self::new(type_, host, port))
            }
            None => {
                if type_.requires_port() || rest.is_empty() {
                    return Err(Error::BadInput);
                }
                Ok(Self::new(type_, rest, 0))
            }
        }
    }
}
