//! Client handshake: dialect classification and subscribe/authorize parsing.
//!
//! [`Handshake`] is a pure state machine fed one decoded request at a time.
//! It answers what the switcher can answer on its own (subscribe, configure,
//! protocol errors) and holds back the authorize reply, which comes from the
//! back-end once the session has signed up there. The same machine replays
//! saved requests when sessions are restored after an upgrade, with replies
//! discarded.

use regex::Regex;
use serde_json::{json, Value};
use std::sync::OnceLock;

use crate::stratum::{
    self, method, JsonRpcRequest, JsonRpcResponse, StratumError,
    AGENT_USER_AGENT_PREFIX, DEFAULT_USER_AGENT, NICEHASH_PROTOCOL,
    NICEHASH_PROTOCOL_PREFIX, VERSION_ROLLING_MASK,
};
use crate::types::{ChainType, Dialect, SessionId};

/// Authorization progress of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connected,
    Subscribed,
    Authorized,
}

/// A worker name split into subaccount and miner parts.
///
/// `alice.rig01` has subaccount `alice` and miner suffix `.rig01`; a name
/// without a dot is all subaccount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerName {
    pub subaccount: String,
    pub miner_suffix: String,
}

impl WorkerName {
    pub fn parse(raw: &str) -> Result<Self, StratumError> {
        let full = raw.trim();
        let (subaccount, miner_suffix) = match full.find('.') {
            Some(pos) => full.split_at(pos),
            None => (full, ""),
        };
        if subaccount.is_empty() {
            return Err(StratumError::WORKER_NAME_START_WRONG);
        }
        Ok(Self {
            subaccount: subaccount.to_string(),
            miner_suffix: miner_suffix.to_string(),
        })
    }

    /// The name as the miner sent it (after normalization).
    pub fn full(&self) -> String {
        format!("{}{}", self.subaccount, self.miner_suffix)
    }

    /// `<subaccount>_<suffix><miner>`, the name pool servers know the
    /// worker by when the subaccount was created for a specific coin.
    pub fn with_coin_suffix(&self, suffix: &str) -> String {
        format!("{}_{}{}", self.subaccount, suffix, self.miner_suffix)
    }
}

fn eth_address() -> Option<&'static Regex> {
    static ETH_ADDRESS: OnceLock<Option<Regex>> = OnceLock::new();
    ETH_ADDRESS
        .get_or_init(|| Regex::new(r"^(0x)?[0-9a-fA-F]{40}\.?").ok())
        .as_ref()
}

/// Strip a leading Ethereum wallet address (and the dot after it).
pub fn strip_eth_address(name: &str) -> &str {
    match eth_address().and_then(|re| re.find(name)) {
        Some(m) => &name[m.end()..],
        None => name,
    }
}

/// What a client established during its handshake.
#[derive(Debug, Clone)]
pub struct ClientHello {
    pub dialect: Dialect,
    /// Client multiplexes many miners over its connection.
    pub agent: bool,
    /// The client's subscribe, or a synthesized one for ETHProxy clients.
    pub subscribe: JsonRpcRequest,
    pub authorize: JsonRpcRequest,
    pub worker: WorkerName,
    /// Version-rolling mask granted via `mining.configure`.
    pub version_mask: Option<u32>,
}

impl ClientHello {
    pub fn user_agent(&self) -> &str {
        self.subscribe.param_str(0).unwrap_or(DEFAULT_USER_AGENT)
    }

    /// Subscribe to save for a restore, if the client actually sent one.
    pub fn saved_subscribe(&self) -> Option<JsonRpcRequest> {
        (self.dialect != Dialect::EthereumProxy).then(|| self.subscribe.clone())
    }

    /// Authorize to save for a restore, carrying the normalized worker name.
    pub fn saved_authorize(&self) -> JsonRpcRequest {
        let mut authorize = self.authorize.clone();
        set_param(&mut authorize, 0, Value::String(self.worker.full()));
        authorize.worker = None;
        authorize
    }
}

/// Set `params[index]`, padding with nulls as needed.
pub fn set_param(request: &mut JsonRpcRequest, index: usize, value: Value) {
    if request.params.len() <= index {
        request.params.resize(index + 1, Value::Null);
    }
    request.params[index] = value;
}

pub struct Handshake {
    chain: ChainType,
    server_id: u8,
    session_hex: String,
    dialect: Dialect,
    stage: Stage,
    agent: bool,
    subscribe: Option<JsonRpcRequest>,
    authorize: Option<JsonRpcRequest>,
    worker: Option<WorkerName>,
    version_mask: Option<u32>,
}

impl Handshake {
    pub fn new(chain: ChainType, id: SessionId) -> Self {
        Self {
            chain,
            server_id: id.server_id(chain),
            session_hex: id.wire_hex(chain),
            dialect: Dialect::default_for(chain),
            stage: Stage::Connected,
            agent: false,
            subscribe: None,
            authorize: None,
            worker: None,
            version_mask: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Restore a version mask negotiated before an upgrade.
    pub fn restore_version_mask(&mut self, mask: Option<u32>) {
        self.version_mask = mask;
    }

    /// Consume one request; returns the reply to send, if any.
    pub fn handle(&mut self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let result = match request.method.as_str() {
            method::SUBSCRIBE if self.subscribe.is_some() => {
                Err(StratumError::DUPLICATE_SUBSCRIBED)
            }
            method::SUBSCRIBE => Ok(Some(self.subscribe(&request))),
            method::ETH_SUBMIT_LOGIN if self.chain == ChainType::Ethereum => {
                if self.stage == Stage::Connected {
                    self.synthesize_subscribe(&request);
                }
                self.authorize(&request).map(|()| None)
            }
            method::AUTHORIZE if self.stage == Stage::Connected => {
                Err(StratumError::NEED_SUBSCRIBED)
            }
            method::AUTHORIZE => self.authorize(&request).map(|()| None),
            method::CONFIGURE if self.chain == ChainType::Bitcoin => {
                Ok(Some(self.configure(&request)))
            }
            _ if self.stage == Stage::Connected => Err(StratumError::NEED_SUBSCRIBED),
            _ => Err(StratumError::NEED_AUTHORIZE),
        };

        match result {
            Ok(Some(value)) => Some(JsonRpcResponse::reply_to(&request, value)),
            Ok(None) => None,
            Err(e) => Some(JsonRpcResponse::error_to(&request, &e, self.server_id)),
        }
    }

    fn subscribe(&mut self, request: &JsonRpcRequest) -> Value {
        self.stage = Stage::Subscribed;
        self.subscribe = Some(request.clone());

        match self.chain {
            ChainType::Bitcoin => {
                self.dialect = Dialect::BitcoinStratum;
                self.agent = request
                    .param_str(0)
                    .map(|ua| ua.to_ascii_lowercase().starts_with(AGENT_USER_AGENT_PREFIX))
                    .unwrap_or(false);
                stratum::bitcoin_subscribe_result(&self.session_hex)
            }
            ChainType::Ethereum => {
                let nicehash = request
                    .param_str(1)
                    .map(|p| p.to_ascii_lowercase().starts_with(NICEHASH_PROTOCOL_PREFIX))
                    .unwrap_or(false);
                if nicehash {
                    self.dialect = Dialect::EthereumStratumNiceHash;
                    stratum::nicehash_subscribe_result(&self.session_hex)
                } else {
                    self.dialect = Dialect::EthereumStratum;
                    Value::Bool(true)
                }
            }
        }
    }

    fn synthesize_subscribe(&mut self, login: &JsonRpcRequest) {
        self.dialect = Dialect::EthereumProxy;
        self.stage = Stage::Subscribed;
        self.subscribe = Some(JsonRpcRequest::new(
            login.id.clone(),
            method::SUBSCRIBE,
            vec![json!("ETHProxy"), json!("ETHProxy/1.0.0")],
        ));
    }

    fn authorize(&mut self, request: &JsonRpcRequest) -> Result<(), StratumError> {
        let name = match request.params.first() {
            None => return Err(StratumError::TOO_FEW_PARAMS),
            Some(Value::String(name)) => name.as_str(),
            Some(_) => return Err(StratumError::WORKER_NAME_MUST_BE_STRING),
        };

        let worker = if self.dialect.is_ethereum() {
            let name = match request.worker_field() {
                Some(worker) => format!("{}.{}", name, worker),
                None => name.to_string(),
            };
            WorkerName::parse(strip_eth_address(name.trim()))?
        } else {
            WorkerName::parse(name)?
        };

        self.worker = Some(worker);
        self.authorize = Some(request.clone());
        self.stage = Stage::Authorized;
        Ok(())
    }

    fn configure(&mut self, request: &JsonRpcRequest) -> Value {
        let wants_version_rolling = request
            .params
            .first()
            .and_then(Value::as_array)
            .map(|extensions| extensions.iter().any(|e| e == "version-rolling"))
            .unwrap_or(false);
        if !wants_version_rolling {
            return json!({});
        }

        let requested = request
            .params
            .get(1)
            .and_then(|options| options.get("version-rolling.mask"))
            .and_then(Value::as_str)
            .and_then(stratum::parse_version_mask)
            .unwrap_or(u32::MAX);
        let mask = requested & VERSION_ROLLING_MASK;
        self.version_mask = Some(mask);

        json!({
            "version-rolling": true,
            "version-rolling.mask": format!("{:08x}", mask),
        })
    }

    /// Everything needed to sign up with a back-end, once authorized.
    pub fn finish(self) -> Option<ClientHello> {
        if self.stage != Stage::Authorized {
            return None;
        }
        Some(ClientHello {
            dialect: self.dialect,
            agent: self.agent,
            subscribe: self.subscribe?,
            authorize: self.authorize?,
            worker: self.worker?,
            version_mask: self.version_mask,
        })
    }
}

/// Protocol string to present upstream for an Ethereum client.
pub fn ethereum_protocol(hello: &ClientHello) -> &str {
    match hello.subscribe.param_str(1) {
        Some(protocol) => protocol,
        None if hello.dialect == Dialect::EthereumStratumNiceHash => NICEHASH_PROTOCOL,
        None => "",
    }
}
