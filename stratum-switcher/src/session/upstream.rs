//! Signing a session up with a back-end pool server.
//!
//! The client already believes it is subscribed; the back-end has to be told
//! the same story. The client's subscribe is replayed with the session id and
//! client IP appended, and its authorize is replayed under the coin-suffixed
//! worker name (falling back to the bare name) until the back-end accepts it.

use bytes::BytesMut;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use super::handshake::{ethereum_protocol, set_param, ClientHello};
use super::{read_line, Session, CONNECT_TIMEOUT, READ_RESPONSE_TIMEOUT};
use crate::error::{Error, Result};
use crate::stratum::{method, JsonRpcRequest, JsonRpcResponse, StratumError};
use crate::tracing::prelude::*;
use crate::types::{ChainType, Dialect};

/// Authorize passes (coin-suffixed name, then bare name) before giving up.
pub const AUTHORIZE_PASSES: usize = 5;

pub const AUTHORIZE_RETRY_DELAY: Duration = Duration::from_secs(3);

/// How long a session waits for its subaccount to be registered.
pub const AUTO_REG_TIMEOUT: Duration = Duration::from_secs(15);

/// A freshly dialed back-end connection during sign-up.
struct ServerConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    /// Server notifications that arrived ahead of a response, kept in order
    /// for the client.
    deferred: BytesMut,
}

impl ServerConn {
    async fn send(&mut self, request: &JsonRpcRequest) -> Result<()> {
        self.writer.write_all(&request.to_line()?).await?;
        Ok(())
    }

    /// Read the next response, setting aside notifications sent before it.
    async fn response(&mut self) -> Result<(JsonRpcResponse, Vec<u8>)> {
        tokio::time::timeout(READ_RESPONSE_TIMEOUT, self.next_response())
            .await
            .map_err(|_| Error::Timeout("server response"))?
    }

    async fn next_response(&mut self) -> Result<(JsonRpcResponse, Vec<u8>)> {
        loop {
            let line = read_line(&mut self.reader, "server").await?;
            let value: Value = serde_json::from_slice(&line)?;
            if value.get("method").is_some() {
                self.deferred.extend_from_slice(&line);
                continue;
            }
            return Ok((serde_json::from_value(value)?, line));
        }
    }
}

impl Session {
    /// Read the subaccount's coin from the watch store. The watch on it is
    /// left to the proxy.
    ///
    /// With `reply`, a failure is also reported to the client.
    pub(super) async fn find_mining_coin(&self, reply: bool) -> Result<()> {
        let hello = self.hello.get().ok_or(Error::NotRunning)?;
        let path = self.ctx.config.coin_path(&hello.worker.subaccount);
        let store = self.ctx.watch.store();

        let mut found = store.get(&path).await;
        if matches!(found, Err(Error::NoNode(_))) && self.ctx.auto_reg.is_some() {
            found = match self.request_auto_reg(hello).await {
                Ok(()) => store.get(&path).await,
                Err(e) => Err(e),
            };
        }

        let coin = found.map(|value| String::from_utf8_lossy(&value).trim().to_string());
        match coin {
            Ok(coin) if !coin.is_empty() => {
                debug!(session = %self.id_hex, %coin, "Found mining coin.");
                self.state.lock().mining_coin = coin;
                Ok(())
            }
            other => {
                let reason = match other {
                    Err(e) => e.to_string(),
                    Ok(_) => "empty value".to_string(),
                };
                error!(session = %self.id_hex, %path, %reason, "Find mining coin failed.");
                if reply {
                    self.reply_error(&StratumError::MINING_COIN_NOT_FOUND).await;
                }
                Err(StratumError::MINING_COIN_NOT_FOUND.into())
            }
        }
    }

    /// Ask the registrar to create the subaccount and wait for it to finish.
    ///
    /// The request is an ephemeral node under `ZKAutoRegWatchDir`; the
    /// registrar deletes it once the subaccount and its coin key exist.
    async fn request_auto_reg(&self, hello: &ClientHello) -> Result<()> {
        let slots = self.ctx.auto_reg.as_ref().ok_or(Error::NotRunning)?;
        let _permit = slots
            .try_acquire()
            .map_err(|_| Error::Store("too many users waiting for auto registration".into()))?;

        let path = format!(
            "{}{}",
            self.ctx.config.zk_auto_reg_watch_dir, hello.worker.subaccount
        );
        let request = json!({
            "SessionID": self.id.as_u32(),
            "Worker": hello.worker.full(),
            "ClientAddr": self.client_addr.to_string(),
        });

        let store = self.ctx.watch.store();
        match store.create_ephemeral(&path, request.to_string().as_bytes()).await {
            Ok(()) => info!(session = %self.id_hex, %path, "Requested subaccount registration."),
            Err(Error::NodeExists(_)) => debug!(%path, "Registration already requested."),
            Err(e) => return Err(e),
        }

        let wait = async {
            loop {
                match store.get_and_watch(&path).await {
                    Ok((_, changed)) => {
                        changed.await;
                    }
                    Err(Error::NoNode(_)) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        };

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::NotRunning),
            r = tokio::time::timeout(AUTO_REG_TIMEOUT, wait) => {
                r.map_err(|_| Error::Timeout("subaccount registration"))?
            }
        }
    }

    /// Dial the server of the current coin and sign up there.
    ///
    /// When `reconnecting`, the client already considers itself signed up:
    /// nothing is sent to it except server notifications.
    pub(super) async fn connect_stratum_server(&self, reconnecting: bool) -> Result<()> {
        let hello = self.hello.get().ok_or(Error::NotRunning)?;
        let coin = self.mining_coin();

        let Some(server) = self.ctx.config.stratum_servers.get(&coin) else {
            error!(session = %self.id_hex, %coin, "Stratum server not found.");
            if !reconnecting {
                self.reply_error(&StratumError::STRATUM_SERVER_NOT_FOUND).await;
            }
            return Err(StratumError::STRATUM_SERVER_NOT_FOUND.into());
        };

        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&server.url)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                error!(session = %self.id_hex, %coin, url = %server.url, error = %e, "Connect stratum server failed.");
                if !reconnecting {
                    self.reply_error(&StratumError::CONNECT_STRATUM_SERVER_FAILED).await;
                }
                return Err(StratumError::CONNECT_STRATUM_SERVER_FAILED.into());
            }
            Err(_) => {
                error!(session = %self.id_hex, %coin, url = %server.url, "Connect stratum server timed out.");
                if !reconnecting {
                    self.reply_error(&StratumError::CONNECT_STRATUM_SERVER_FAILED).await;
                }
                return Err(StratumError::CONNECT_STRATUM_SERVER_FAILED.into());
            }
        };
        let _ = stream.set_nodelay(true);
        trace!(session = %self.id_hex, %coin, url = %server.url, "Connected stratum server.");

        let (read, writer) = stream.into_split();
        let mut conn = ServerConn {
            reader: BufReader::new(read),
            writer,
            deferred: BytesMut::new(),
        };

        if let Some(mask) = hello.version_mask {
            self.configure_server(&mut conn, mask).await?;
        }
        self.subscribe_server(&mut conn, hello).await?;

        let (authorized, name, response) =
            self.authorize_server(&mut conn, hello, &server.user_suffix).await?;

        // The back-end's answer stands in for the reply the client is owed.
        let mut to_client = std::mem::take(&mut conn.deferred);
        if !reconnecting {
            if let Some(response) = response {
                to_client.extend_from_slice(&response);
            }
        }
        if !to_client.is_empty() {
            self.write_to_client(&to_client).await?;
        }

        if !authorized {
            warn!(session = %self.id_hex, worker = %name, %coin, "Authorize failed.");
            return Err(Error::AuthorizeFailed(name));
        }

        info!(
            session = %self.id_hex,
            client = %self.client_addr,
            %coin,
            worker = %name,
            user_agent = %hello.user_agent(),
            "Authorize success."
        );

        *self.server_reader.lock().await = Some(conn.reader);
        *self.server_writer.lock().await = Some(conn.writer);
        Ok(())
    }

    async fn configure_server(&self, conn: &mut ServerConn, mask: u32) -> Result<()> {
        let request = JsonRpcRequest::new(
            json!("configure"),
            method::CONFIGURE,
            vec![
                json!(["version-rolling"]),
                json!({ "version-rolling.mask": format!("{:08x}", mask) }),
            ],
        );
        conn.send(&request).await?;
        let (response, _) = conn.response().await?;
        trace!(session = %self.id_hex, result = %response.result, "Configure response.");
        Ok(())
    }

    /// The client's subscribe, rewritten to carry the session id and IP.
    fn upstream_subscribe(&self, hello: &ClientHello) -> JsonRpcRequest {
        let mut subscribe = hello.subscribe.clone();
        let user_agent = hello.user_agent().to_string();
        let ip = json!(self.client_ip_u32());

        subscribe.params = match self.ctx.config.chain_type {
            ChainType::Bitcoin => vec![json!(user_agent), json!(self.id_hex), ip],
            ChainType::Ethereum => vec![
                json!(user_agent),
                json!(ethereum_protocol(hello)),
                json!(self.id_hex),
                ip,
            ],
        };
        subscribe.worker = None;
        subscribe
    }

    async fn subscribe_server(&self, conn: &mut ServerConn, hello: &ClientHello) -> Result<()> {
        conn.send(&self.upstream_subscribe(hello)).await?;
        let (response, line) = conn.response().await?;

        match hello.dialect {
            Dialect::BitcoinStratum | Dialect::EthereumStratumNiceHash => {
                let returned = response
                    .result
                    .as_array()
                    .filter(|result| result.len() >= 2)
                    .ok_or_else(|| {
                        Error::SubscribeResponse("result is not an array of two or more".into())
                    })?[1]
                    .as_str()
                    .ok_or_else(|| Error::SubscribeResponse("result[1] is not a string".into()))?;

                if returned != self.id_hex {
                    warn!(session = %self.id_hex, %returned, "Session id inconformity.");
                    return Err(Error::SessionIdInconformity {
                        returned: returned.to_string(),
                        expected: self.id_hex.clone(),
                    });
                }
            }
            _ => {
                if !response.is_true() {
                    return Err(Error::SubscribeResponse(format!(
                        "result is not true: {}",
                        response.result
                    )));
                }
            }
        }

        trace!(
            session = %self.id_hex,
            response = %String::from_utf8_lossy(&line).trim_end(),
            "Subscribe success."
        );
        Ok(())
    }

    /// Returns whether a name was accepted, the last name tried, and the
    /// last authorize response line.
    async fn authorize_server(
        &self,
        conn: &mut ServerConn,
        hello: &ClientHello,
        user_suffix: &str,
    ) -> Result<(bool, String, Option<Vec<u8>>)> {
        let suffixed = hello.worker.with_coin_suffix(user_suffix);
        let bare = hello.worker.full();
        let mut last_response = None;

        for pass in 0..AUTHORIZE_PASSES {
            for name in [&suffixed, &bare] {
                trace!(session = %self.id_hex, worker = %name, pass, "Authorize.");
                let mut authorize = hello.authorize.clone();
                set_param(&mut authorize, 0, Value::String(name.clone()));
                authorize.worker = None;

                conn.send(&authorize).await?;
                match conn.response().await {
                    Ok((response, line)) => {
                        last_response = Some(line);
                        if response.is_true() {
                            return Ok((true, name.clone(), last_response));
                        }
                    }
                    Err(e) => {
                        warn!(session = %self.id_hex, worker = %name, error = %e, "Read authorize response failed.");
                        return Ok((false, name.clone(), last_response));
                    }
                }
            }

            if pass + 1 < AUTHORIZE_PASSES {
                self.pause(AUTHORIZE_RETRY_DELAY).await?;
            }
        }

        Ok((false, bare, last_response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::WorkerName;
    use crate::stratum::DEFAULT_USER_AGENT;

    #[test]
    fn test_default_user_agent() {
        let hello = ClientHello {
            dialect: Dialect::EthereumProxy,
            agent: false,
            subscribe: JsonRpcRequest::new(json!(1), method::SUBSCRIBE, vec![]),
            authorize: JsonRpcRequest::new(json!(1), method::ETH_SUBMIT_LOGIN, vec![]),
            worker: WorkerName::parse("a").unwrap(),
            version_mask: None,
        };
        assert_eq!(hello.user_agent(), DEFAULT_USER_AGENT);
        assert_eq!(ethereum_protocol(&hello), "");
    }
}
