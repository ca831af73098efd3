use std::{
    collections::HashMap, fs::File, io::BufReader, net::SocketAddr, sync::Arc,
    time::Duration,
};

use anyhow::{bail, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{
    rustls::{self, Certificate, PrivateKey},
    TlsAcceptor,
};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
        Message,
    },
};
use tracing::{debug, info, warn};

use crate::{
    acl::IpAllowList,
    auth::TokenVerifier,
    bridge,
    config::{Config, GroupDef},
    pbx::PbxParser,
    registry::ClientRegistry,
    router::{self, RouteError},
    session::{AsyncStream, CallState, WsStream},
};

/// Grace period after a BUSY verdict so the refused client can read it
/// before the socket closes.
const BUSY_CLOSE_DELAY: Duration = Duration::from_millis(100);

/// Everything a connection handler needs, built once at startup.
pub struct GatewayService {
    pub config: Config,
    pub groups: HashMap<String, GroupDef>,
    pub registry: ClientRegistry,
    pub parser: PbxParser,
    pub verifier: TokenVerifier,
    pub browser_acl: IpAllowList,
    pub pbx_acl: IpAllowList,
}

impl GatewayService {
    pub fn new(
        config: Config,
        groups: HashMap<String, GroupDef>,
    ) -> Result<GatewayService> {
        let parser = PbxParser::new(&config)?;
        let verifier = TokenVerifier::new(&config.token_secret);
        let browser_acl = IpAllowList::parse(&config.allowed_browser_ips)?;
        let pbx_acl = IpAllowList::parse(&config.allowed_pbx_ips)?;
        Ok(GatewayService {
            config,
            groups,
            registry: ClientRegistry::new(),
            parser,
            verifier,
            browser_acl,
            pbx_acl,
        })
    }
}

pub struct GatewayServer {
    service: Arc<GatewayService>,
}

impl GatewayServer {
    pub fn new(service: Arc<GatewayService>) -> GatewayServer {
        GatewayServer { service }
    }

    pub async fn run(&self) -> Result<()> {
        let pbx_listener =
            TcpListener::bind(&self.service.config.pbx_addr).await?;
        info!(addr = %self.service.config.pbx_addr, "pbx server listening");
        let service = self.service.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = pbx_listener.accept().await else {
                    continue;
                };
                let service = service.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        handle_pbx_connection(service, stream, peer).await
                    {
                        debug!(remote = %peer, %err, "pbx connection ended");
                    }
                });
            }
        });

        let tls_config = tls_server_config(&self.service.config)?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));
        let listener =
            TcpListener::bind(&self.service.config.browser_addr).await?;
        info!(addr = %self.service.config.browser_addr, "browser server listening (tls)");
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                continue;
            };
            let service = self.service.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Err(err) =
                    handle_browser_connection(service, acceptor, stream, peer).await
                {
                    debug!(remote = %peer, %err, "browser connection ended");
                }
            });
        }
    }
}

fn tls_server_config(config: &Config) -> Result<rustls::ServerConfig> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(
        &config.cert_file,
    )?))?
    .into_iter()
    .map(Certificate)
    .collect();
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(
        File::open(&config.key_file)?,
    ))?;
    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut BufReader::new(File::open(
            &config.key_file,
        )?))?;
    }
    if keys.is_empty() {
        bail!("no private key in {}", config.key_file);
    }
    let tls = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, PrivateKey(keys.remove(0)))?;
    Ok(tls)
}

fn reject(status: StatusCode) -> ErrorResponse {
    let mut response = ErrorResponse::new(None);
    *response.status_mut() = status;
    response
}

fn query_token(req: &Request) -> Option<&str> {
    req.uri()
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
}

fn origin_allowed(allowed: &[String], req: &Request) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match req.headers().get("Origin").and_then(|v| v.to_str().ok()) {
        Some(origin) => allowed.iter().any(|a| a == origin),
        None => false,
    }
}

fn authorize_browser(
    service: &GatewayService,
    req: &Request,
    peer: SocketAddr,
) -> Result<String, StatusCode> {
    if req.uri().path() != "/phone" {
        return Err(StatusCode::NOT_FOUND);
    }
    if !service.browser_acl.allows(peer.ip()) {
        warn!(remote = %peer, "blocked browser address");
        return Err(StatusCode::FORBIDDEN);
    }
    let token = match query_token(req) {
        Some(token) if !token.is_empty() => token,
        _ => return Err(StatusCode::UNAUTHORIZED),
    };
    let ext = match service.verifier.verify(token) {
        Ok(ext) => ext,
        Err(err) => {
            warn!(remote = %peer, %err, "token verification failed");
            return Err(StatusCode::UNAUTHORIZED);
        }
    };
    // the origin gate belongs to the upgrade itself, after the token
    if !origin_allowed(&service.config.allowed_origins, req) {
        warn!(remote = %peer, "blocked origin");
        return Err(StatusCode::FORBIDDEN);
    }
    Ok(ext)
}

async fn handle_browser_connection(
    service: Arc<GatewayService>,
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let tls_stream = acceptor.accept(stream).await?;
    let mut ext = String::new();
    let callback = |req: &Request, response: Response| {
        match authorize_browser(&service, req, peer) {
            Ok(claimed) => {
                ext = claimed;
                Ok(response)
            }
            Err(status) => Err(reject(status)),
        }
    };
    let ws =
        accept_hdr_async(Box::new(tls_stream) as Box<dyn AsyncStream>, callback)
            .await?;
    info!(ext = %ext, remote = %peer, "auth success");
    run_browser_session(service, ws, ext).await;
    Ok(())
}

/// The life of one authenticated browser connection: register, pump
/// frames into the session's channels, clean up on disconnect.
pub async fn run_browser_session(
    service: Arc<GatewayService>,
    ws: WsStream,
    ext: String,
) {
    let (sink, mut read) = ws.split();
    let session = match service.registry.register(&ext, sink).await {
        Ok(session) => session,
        Err(mut sink) => {
            let _ = sink.send(Message::Text("BUSY".to_string())).await;
            tokio::time::sleep(BUSY_CLOSE_DELAY).await;
            let _ = sink.close().await;
            return;
        }
    };

    while let Some(Ok(msg)) = read.next().await {
        match msg {
            Message::Text(cmd) => {
                session.push_control(cmd);
            }
            Message::Binary(data) => {
                if session.state().await == CallState::Talking {
                    session.push_audio(data);
                }
            }
            _ => {}
        }
    }

    info!(ext = %ext, "browser disconnected");
    // unwind whichever router still owns the session
    let hangup_session = session.clone();
    tokio::spawn(async move { hangup_session.send_internal_hangup().await });
    service.registry.unregister(&ext).await;
}

async fn handle_pbx_connection(
    service: Arc<GatewayService>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let callback = |_req: &Request, response: Response| {
        if !service.pbx_acl.allows(peer.ip()) {
            warn!(remote = %peer, "blocked pbx address");
            return Err(reject(StatusCode::FORBIDDEN));
        }
        Ok(response)
    };
    let ws = accept_hdr_async(Box::new(stream) as Box<dyn AsyncStream>, callback)
        .await?;
    serve_pbx(service, ws).await;
    Ok(())
}

/// The life of one PBX call leg: read the hello, route to a group or a
/// single extension, then hand the socket to the bridge.
pub async fn serve_pbx(service: Arc<GatewayService>, mut ws: WsStream) {
    let Some(Ok(first)) = ws.next().await else {
        return;
    };
    let Ok(raw) = first.into_text() else {
        return;
    };
    let Some(hello) = service.parser.parse_hello(&raw) else {
        warn!(msg = %raw, "no target extension in pbx hello");
        return;
    };

    let (session, is_group) = if let Some(def) = service.groups.get(&hello.target)
    {
        match router::ring_group(&service.registry, &hello.target, def).await {
            Ok(winner) => (winner, true),
            Err(err) => {
                warn!(ext = %hello.target, %err, "group call failed");
                let _ = ws.send(service.parser.command("HANGUP")).await;
                return;
            }
        }
    } else {
        match router::claim_direct(&service.registry, &hello.target).await {
            Ok(session) => (session, false),
            Err(RouteError::Offline) => {
                warn!(ext = %hello.target, "target offline");
                return;
            }
            Err(_) => {
                debug!(ext = %hello.target, "target busy");
                let _ = ws.send(service.parser.command("HANGUP")).await;
                return;
            }
        }
    };

    bridge::run(ws, session, is_group, hello.media_start, &service.parser).await;
}
