// This file is part of cfxmpp.
// Copyright (c) 2019, Cloudflare. All rights reserved.
// See LICENSE for licensing information.

//! TLS contexts and sessions as the reactor consumes them.
//!
//! The crypto itself is rustls; this module only narrows the API to what the connection state
//! machine drives: handshake pumping via `read_tls`/`write_tls`, plaintext transfer, and
//! interest hints via `wants_read`/`wants_write`.

use rustls::internal::pemfile;
use rustls::{
    Certificate, ClientConfig, ClientSession, NoClientAuth, PrivateKey, ServerConfig,
    ServerSession, Session,
};

use std::fs::File;
use std::io;
use std::io::{BufReader, Read, Write};
use std::sync::Arc;

/// A TLS configuration a connection or listener holds on to. Accepted sockets inherit the
/// listener's; outgoing connections carry their own.
#[derive(Clone)]
pub enum TlsConfig {
    Server(Arc<ServerConfig>),
    Client(Arc<ClientConfig>),
}

/// Build a server-side context from already-loaded certificate chain and key.
pub fn make_server_config(
    certs: Vec<Certificate>,
    key: PrivateKey,
) -> Result<Arc<ServerConfig>, rustls::TLSError> {
    let mut config = ServerConfig::new(NoClientAuth::new());
    config.set_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Build a client-side context trusting the bundled web roots.
pub fn make_client_config() -> Arc<ClientConfig> {
    let mut config = ClientConfig::new();
    config
        .root_store
        .add_server_trust_anchors(&webpki_roots::TLS_SERVER_ROOTS);
    Arc::new(config)
}

/// Read a PEM certificate chain.
pub fn load_certs(filename: &str) -> Result<Vec<Certificate>, io::Error> {
    let file = File::open(filename)?;
    pemfile::certs(&mut BufReader::new(file)).map_err(|()| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("cannot parse TLS certificates from {}", filename),
        )
    })
}

/// Read the first PKCS#8 private key from a PEM file.
pub fn load_private_key(filename: &str) -> Result<PrivateKey, io::Error> {
    let file = File::open(filename)?;
    let mut keys = pemfile::pkcs8_private_keys(&mut BufReader::new(file)).map_err(|()| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("cannot parse TLS private keys from {}", filename),
        )
    })?;
    if keys.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no TLS private key found in {}", filename),
        ));
    }
    Ok(keys.remove(0))
}

/// A live session of either direction, driven uniformly by the connection state machine.
pub(crate) enum TlsSession {
    Server(ServerSession),
    Client(ClientSession),
}

impl TlsSession {
    pub fn new_server(config: &Arc<ServerConfig>) -> TlsSession {
        TlsSession::Server(ServerSession::new(config))
    }

    /// Client sessions verify against the SNI name, so one is required here.
    pub fn new_client(config: &Arc<ClientConfig>, servername: &str) -> Result<TlsSession, io::Error> {
        let dns_name = webpki::DNSNameRef::try_from_ascii_str(servername).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid TLS server name {:?}", servername),
            )
        })?;
        Ok(TlsSession::Client(ClientSession::new(config, dns_name)))
    }

    pub fn wants_read(&self) -> bool {
        match self {
            TlsSession::Server(s) => s.wants_read(),
            TlsSession::Client(s) => s.wants_read(),
        }
    }

    pub fn wants_write(&self) -> bool {
        match self {
            TlsSession::Server(s) => s.wants_write(),
            TlsSession::Client(s) => s.wants_write(),
        }
    }

    pub fn is_handshaking(&self) -> bool {
        match self {
            TlsSession::Server(s) => s.is_handshaking(),
            TlsSession::Client(s) => s.is_handshaking(),
        }
    }

    pub fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        match self {
            TlsSession::Server(s) => s.read_tls(rd),
            TlsSession::Client(s) => s.read_tls(rd),
        }
    }

    pub fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        match self {
            TlsSession::Server(s) => s.write_tls(wr),
            TlsSession::Client(s) => s.write_tls(wr),
        }
    }

    pub fn process_new_packets(&mut self) -> Result<(), rustls::TLSError> {
        match self {
            TlsSession::Server(s) => s.process_new_packets(),
            TlsSession::Client(s) => s.process_new_packets(),
        }
    }

    /// Drain all decrypted plaintext into `buf`, returning the byte count.
    pub fn read_plaintext(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        match self {
            TlsSession::Server(s) => s.read_to_end(buf),
            TlsSession::Client(s) => s.read_to_end(buf),
        }
    }

    /// Queue plaintext for encryption. May accept fewer bytes than offered; the caller keeps
    /// the remainder buffered.
    pub fn write_plaintext(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            TlsSession::Server(s) => s.write(data),
            TlsSession::Client(s) => s.write(data),
        }
    }

    pub fn send_close_notify(&mut self) {
        match self {
            TlsSession::Server(s) => s.send_close_notify(),
            TlsSession::Client(s) => s.send_close_notify(),
        }
    }

    /// The SNI name the peer asked for, available on server sessions after the client hello.
    pub fn sni_hostname(&self) -> Option<String> {
        match self {
            TlsSession::Server(s) => s.get_sni_hostname().map(String::from),
            TlsSession::Client(_) => None,
        }
    }
}
