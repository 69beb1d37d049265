use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::{fs, thread};

use bitcoin::{BlockHash, Txid};
use bitcoin_hashes::hex::{FromHex, ToHex};
use native_tls::{Identity, TlsAcceptor, TlsStream};
use serde_json::{from_value, Value};

use bitcoincore_rpc::{Client as RpcClient, RpcApi};

use crate::electrum::status_hash_json;
use crate::error::{fmt_error_chain, Context, EpsError, OptionExt, Result};
use crate::headers::HeaderTracker;
use crate::merkle::{convert_core_proof, merkle_root_from_branch};
use crate::monitor::TransactionMonitor;
use crate::types::ScriptHash;
use crate::util::banner::{self, DONATION_ADDR};
use crate::util::bitcoincore_ext::RpcApiExt;
use crate::util::{make_fee_histogram, Subnet};
use crate::EPS_VERSION;

pub const PROTOCOL_VERSION_MAX: f64 = 1.4;
pub const PROTOCOL_VERSION_MIN: f64 = 1.1;

const MAX_HEADERS: u32 = 2016;
const RETARGET_INTERVAL: u32 = 2016;
const MAX_LINE_BYTES: usize = 1024 * 1024;
const ACCEPT_PAUSE: Duration = Duration::from_millis(200);
const IDLE_SLICE: Duration = Duration::from_millis(250);

const LT: &str = "eps::electrum";

pub struct ServerOptions {
    pub bind_addr: SocketAddr,
    pub ip_whitelist: Vec<Subnet>,
    pub poll_interval_listening: Duration,
    pub poll_interval_connected: Duration,
    pub certfile: PathBuf,
    pub keyfile: PathBuf,
}

/// Serves the Electrum wire protocol to a single wallet at a time.
///
/// The server is deliberately single-threaded: the wallet issues requests
/// serially and the node RPC is the bottleneck, so the accept loop, the
/// session loop and both heartbeats all run cooperatively on one thread,
/// driven by socket timeouts.
pub struct ElectrumServer {
    rpc: Arc<RpcClient>,
    monitor: TransactionMonitor,
    headers: HeaderTracker,
    num_wallets: usize,
    tls: TlsAcceptor,
    options: ServerOptions,
}

impl ElectrumServer {
    pub fn new(
        rpc: Arc<RpcClient>,
        monitor: TransactionMonitor,
        headers: HeaderTracker,
        num_wallets: usize,
        options: ServerOptions,
    ) -> Result<Self> {
        let tls = load_tls_acceptor(&options.certfile, &options.keyfile)?;
        Ok(ElectrumServer {
            rpc,
            monitor,
            headers,
            num_wallets,
            tls,
            options,
        })
    }

    /// Accept wallet sessions until the shutdown flag is raised. Timeouts on
    /// the idle listener fire the listening heartbeat.
    pub fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let listener = TcpListener::bind(self.options.bind_addr)
            .with_context(|| format!("bind({}) failed", self.options.bind_addr))?;
        listener
            .set_nonblocking(true)
            .context("failed to configure the listening socket")?;
        info!(
            target: LT,
            "Electrum RPC server running on {} (protocol {}-{})",
            self.options.bind_addr,
            PROTOCOL_VERSION_MIN,
            PROTOCOL_VERSION_MAX
        );

        while !shutdown.load(Ordering::SeqCst) {
            let (stream, addr) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    self.listening_heartbeat();
                    self.idle_wait(&shutdown);
                    continue;
                }
                Err(err) => return Err(err).context("accept failed"),
            };

            if !self.ip_allowed(&addr.ip()) {
                debug!(target: LT, "{} not in whitelist, closing", addr);
                continue;
            }

            let stream = match self.establish(stream) {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(target: LT, "[{}] TLS setup failed: {}", addr, fmt_error_chain(&err));
                    continue;
                }
            };

            info!(target: LT, "[{}] wallet connected", addr);
            match self.serve(stream, addr, &shutdown) {
                Err(e) if e.downcast_ref::<EpsError>().is_some() => {
                    info!(target: LT, "[{}] {}", addr, e)
                }
                Err(e) => warn!(target: LT, "[{}] session failed: {}", addr, fmt_error_chain(&e)),
                Ok(()) => (),
            }
            info!(target: LT, "[{}] wallet disconnected", addr);
            self.monitor.unsubscribe_all_addresses();
            thread::sleep(ACCEPT_PAUSE);
        }

        info!(target: LT, "shutting down");
        Ok(())
    }

    fn ip_allowed(&self, ip: &IpAddr) -> bool {
        self.options.ip_whitelist.iter().any(|net| net.contains(ip))
    }

    fn establish(&self, stream: TcpStream) -> Result<TlsStream<TcpStream>> {
        // the listener's non-blocking mode is inherited on some platforms
        stream
            .set_nonblocking(false)
            .context("failed to configure the wallet socket")?;
        stream
            .set_read_timeout(Some(self.options.poll_interval_connected))
            .context("failed to set the read timeout")?;
        self.tls
            .accept(stream)
            .map_err(|err| anyhow!("TLS handshake failed: {}", err))
    }

    fn serve(
        &mut self,
        stream: TlsStream<TcpStream>,
        addr: SocketAddr,
        shutdown: &AtomicBool,
    ) -> Result<()> {
        Connection {
            rpc: Arc::clone(&self.rpc),
            monitor: &mut self.monitor,
            headers: &mut self.headers,
            num_wallets: self.num_wallets,
            shutdown,
            stream,
            addr,
            protocol_version: 0.0,
            raw_headers: false,
            headers_subscribed: false,
            txid_blockhash_map: HashMap::new(),
            recv_buffer: Vec::new(),
        }
        .run()
    }

    fn listening_heartbeat(&mut self) {
        trace!(target: LT, "heartbeat listening");
        if let Err(e) = self.monitor.check_for_updated_txes() {
            warn!(target: LT, "wallet poll failed: {:?}", e);
        }
    }

    fn idle_wait(&self, shutdown: &AtomicBool) {
        let mut remaining = self.options.poll_interval_listening;
        while remaining > Duration::from_secs(0) && !shutdown.load(Ordering::SeqCst) {
            let slice = remaining.min(IDLE_SLICE);
            thread::sleep(slice);
            remaining -= slice;
        }
    }
}

struct Connection<'a> {
    rpc: Arc<RpcClient>,
    monitor: &'a mut TransactionMonitor,
    headers: &'a mut HeaderTracker,
    num_wallets: usize,
    shutdown: &'a AtomicBool,
    stream: TlsStream<TcpStream>,
    addr: SocketAddr,
    // negotiated session state
    protocol_version: f64,
    raw_headers: bool,
    headers_subscribed: bool,
    // lets `blockchain.transaction.get` work on pruned nodes for txids the
    // client learned through `id_from_pos`
    txid_blockhash_map: HashMap<Txid, BlockHash>,
    recv_buffer: Vec<u8>,
}

impl<'a> Connection<'a> {
    fn run(&mut self) -> Result<()> {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(EpsError::Disconnected.into()),
                Ok(n) => {
                    self.recv_buffer.extend_from_slice(&chunk[..n]);
                    if self.recv_buffer.len() > MAX_LINE_BYTES {
                        bail!(EpsError::OversizedRequest(MAX_LINE_BYTES));
                    }
                    self.drain_lines()?;
                }
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    self.heartbeat()?;
                }
                Err(err) => return Err(err).context("wallet socket read failed"),
            }
        }
    }

    fn drain_lines(&mut self) -> Result<()> {
        while let Some(pos) = self.recv_buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.recv_buffer.drain(..=pos).collect();
            let line = String::from_utf8(line).context("invalid UTF8")?;
            let line = line.trim();
            if !line.is_empty() {
                self.handle_line(line)?;
            }
        }
        Ok(())
    }

    fn handle_line(&mut self, line: &str) -> Result<()> {
        // a malformed request line terminates the session
        let mut cmd: Value = serde_json::from_str(line).context("invalid JSON format")?;
        let (method, params, id) = match (cmd["method"].take(), cmd["params"].take(), cmd["id"].take())
        {
            (Value::String(method), params, id) => (method, params, id),
            _ => bail!("invalid command: {}", line),
        };

        if let Some(reply) = self.handle_command(&method, params, id)? {
            self.send_value(&reply)?;
        }
        Ok(())
    }

    fn handle_command(&mut self, method: &str, params: Value, id: Value) -> Result<Option<Value>> {
        match method {
            "server.ping"
            | "blockchain.scripthash.subscribe"
            | "blockchain.estimatefee"
            | "mempool.get_fee_histogram" => {
                trace!(target: LT, "rpc #{} <- {} {}", id, method, params);
            }
            _ => {
                debug!(target: LT, "rpc #{} <- {} {}", id, method, params);
            }
        }

        // version negotiation can refuse the client, closing the session
        if method == "server.version" {
            return self.server_version(params, id).map(Some);
        }

        let reply = match method {
            "server.ping" => Ok(response(&id, Value::Null)),
            "server.banner" => self.server_banner(&id),
            "server.donation_address" => Ok(response(&id, json!(DONATION_ADDR))),
            "server.peers.subscribe" => Ok(response(&id, json!([]))),
            "blockchain.headers.subscribe" => self.blockchain_headers_subscribe(params, &id),
            "blockchain.block.header" => self.blockchain_block_header(params, &id),
            "blockchain.block.get_header" => self.blockchain_block_get_header(params, &id),
            "blockchain.block.headers" => self.blockchain_block_headers(params, &id),
            "blockchain.block.get_chunk" => self.blockchain_block_get_chunk(params, &id),
            "blockchain.transaction.get" => self.blockchain_transaction_get(params, &id),
            "blockchain.transaction.get_merkle" => {
                self.blockchain_transaction_get_merkle(params, &id)
            }
            "blockchain.transaction.id_from_pos" => {
                self.blockchain_transaction_id_from_pos(params, &id)
            }
            "blockchain.transaction.broadcast" => {
                self.blockchain_transaction_broadcast(params, &id)
            }
            "blockchain.scripthash.subscribe" => self.blockchain_scripthash_subscribe(params, &id),
            "blockchain.scripthash.get_history" => {
                self.blockchain_scripthash_get_history(params, &id)
            }
            "blockchain.estimatefee" => self.blockchain_estimatefee(params, &id),
            "blockchain.relayfee" => self.blockchain_relayfee(&id),
            "mempool.get_fee_histogram" => self.mempool_get_fee_histogram(&id),
            _ => {
                // unanswered, but the session stays open
                error!(
                    target: LT,
                    "*** not handling method: {} params={}", method, params
                );
                return Ok(None);
            }
        };

        Ok(Some(match reply {
            Ok(reply) => {
                trace!(target: LT, "rpc #{} -> {}", id, reply);
                reply
            }
            Err(e) => {
                warn!(target: LT, "rpc #{} {} failed: {:?}", id, method, e);
                error_reply(&id, json!({ "message": fmt_error_chain(&e) }))
            }
        }))
    }

    fn server_version(&mut self, params: Value, id: Value) -> Result<Value> {
        let version_param = params.get(1).or_err("missing protocol version")?;
        let (client_min, client_max) = parse_version_range(version_param)?;

        match negotiate_version(client_min, client_max) {
            Some(negotiated) => {
                self.protocol_version = negotiated;
                debug!(target: LT, "negotiated protocol version {}", negotiated);
                Ok(response(
                    &id,
                    json!([format!("ElectrumPersonalServer {}", EPS_VERSION), negotiated]),
                ))
            }
            None => {
                error!(
                    target: LT,
                    "*** client protocol version {} not supported, update needed", version_param
                );
                bail!(EpsError::ProtocolMismatch(version_param.to_string()))
            }
        }
    }

    fn server_banner(&mut self, id: &Value) -> Result<Value> {
        let banner_text =
            banner::get_welcome_banner(&self.rpc, self.num_wallets, self.monitor.num_addresses())?;
        Ok(response(id, json!(banner_text)))
    }

    fn blockchain_headers_subscribe(&mut self, params: Value, id: &Value) -> Result<Value> {
        self.raw_headers = raw_headers_for(
            self.protocol_version,
            params.get(0).and_then(Value::as_bool),
        );
        debug!(target: LT, "raw_headers = {}", self.raw_headers);
        self.headers_subscribed = true;
        let (_, header) = self.headers.current_header(self.raw_headers)?;
        Ok(response(id, header))
    }

    fn blockchain_block_header(&mut self, params: Value, id: &Value) -> Result<Value> {
        let height = height_param(&params)?;
        Ok(match self.headers.header_hex_at(height) {
            Ok(hex) => response(id, json!(hex)),
            Err(_) => height_out_of_range(id, height),
        })
    }

    // deprecated as of 1.3, can only return structured headers
    fn blockchain_block_get_header(&mut self, params: Value, id: &Value) -> Result<Value> {
        let height = height_param(&params)?;
        Ok(match self.headers.header_json_at(height, false) {
            Ok(header) => response(id, header),
            Err(_) => height_out_of_range(id, height),
        })
    }

    fn blockchain_block_headers(&mut self, params: Value, id: &Value) -> Result<Value> {
        let start_height = height_param(&params)?;
        let count = params
            .get(1)
            .and_then(Value::as_u64)
            .or_err("missing count")? as u32;
        let count = count.min(MAX_HEADERS);
        let (headers_hex, n) = self.headers.headers_hex(start_height, count)?;
        Ok(response(
            id,
            json!({ "hex": headers_hex, "count": n, "max": MAX_HEADERS }),
        ))
    }

    fn blockchain_block_get_chunk(&mut self, params: Value, id: &Value) -> Result<Value> {
        let index = height_param(&params)?;
        let tip_height = self.headers.chain_height()?;
        let next_height = tip_height + 1;
        let start_height = (index.saturating_mul(RETARGET_INTERVAL)).min(next_height);
        let count = (next_height - start_height).min(RETARGET_INTERVAL);
        let (headers_hex, _) = self.headers.headers_hex(start_height, count)?;
        Ok(response(id, json!(headers_hex)))
    }

    fn blockchain_transaction_get(&mut self, params: Value, id: &Value) -> Result<Value> {
        let txid: Txid = from_value(params.get(0).cloned().or_err("missing txid")?)
            .context("invalid txid")?;

        if let Ok(gtx) = self.rpc.get_transaction(&txid, Some(true)) {
            return Ok(response(id, json!(gtx.hex.to_hex())));
        }
        // not a wallet tx, but may still be recoverable when the client told
        // us which block it came from
        if let Some(blockhash) = self.txid_blockhash_map.get(&txid) {
            if let Ok(tx_hex) = self.rpc.get_raw_transaction_hex(&txid, Some(blockhash)) {
                return Ok(response(id, json!(tx_hex)));
            }
        }
        Ok(error_reply(id, json!({ "message": "txid not found" })))
    }

    fn blockchain_transaction_get_merkle(&mut self, params: Value, id: &Value) -> Result<Value> {
        let txid: Txid = from_value(params.get(0).cloned().or_err("missing txid")?)
            .context("invalid txid")?;

        let reply = match self.build_merkle_proof(&txid) {
            Ok(proof) => proof,
            Err(e) => {
                warn!(
                    target: LT,
                    "merkle proof failed for {}: {}",
                    txid,
                    fmt_error_chain(&e)
                );
                // reply with an invalid proof, which electrum accepts without
                // disconnecting us
                json!({ "block_height": 1, "pos": 0, "merkle": [txid] })
            }
        };
        Ok(response(id, reply))
    }

    fn build_merkle_proof(&self, txid: &Txid) -> Result<Value> {
        let gtx = self.rpc.get_transaction(txid, Some(true))?;
        let blockhash = gtx.info.blockhash.or_err("transaction is not confirmed")?;

        let proof_hex = self.rpc.get_tx_out_proof_hex(txid, &blockhash)?;
        let proof = convert_core_proof(&Vec::<u8>::from_hex(&proof_hex)?)?;

        let implied_root = merkle_root_from_branch(txid, proof.pos, &proof.merkle);
        ensure!(
            implied_root == proof.merkle_root,
            "merkle branch does not recombine to the block's merkle root"
        );

        let header_info = self.rpc.get_block_header_info(&blockhash)?;
        Ok(json!({
            "block_height": header_info.height,
            "pos": proof.pos,
            "merkle": proof.merkle,
        }))
    }

    fn blockchain_transaction_id_from_pos(&mut self, params: Value, id: &Value) -> Result<Value> {
        let height = height_param(&params)?;
        let tx_pos = params
            .get(1)
            .and_then(Value::as_u64)
            .or_err("missing tx position")? as usize;
        let want_merkle = params.get(2).and_then(Value::as_bool).unwrap_or(false);

        Ok(match self.tx_id_from_pos(height, tx_pos, want_merkle) {
            Ok(result) => response(id, result),
            Err(e) => error_reply(id, json!({ "message": fmt_error_chain(&e) })),
        })
    }

    fn tx_id_from_pos(&mut self, height: u32, tx_pos: usize, want_merkle: bool) -> Result<Value> {
        let blockhash = self.rpc.get_block_hash(height as u64)?;
        let block_info = self.rpc.get_block_info(&blockhash)?;
        let txid = *block_info.tx.get(tx_pos).or_err(format!(
            "no tx in position #{} in block #{}",
            tx_pos, height
        ))?;

        self.txid_blockhash_map.insert(txid, blockhash);

        Ok(if want_merkle {
            let proof_hex = self.rpc.get_tx_out_proof_hex(&txid, &blockhash)?;
            let proof = convert_core_proof(&Vec::<u8>::from_hex(&proof_hex)?)?;
            json!({ "tx_hash": txid, "merkle": proof.merkle })
        } else {
            json!(txid)
        })
    }

    fn blockchain_transaction_broadcast(&mut self, params: Value, id: &Value) -> Result<Value> {
        let tx_hex: String = from_value(params.get(0).cloned().or_err("missing tx hex")?)?;

        // broadcast failures are reported as the *result* so the wallet
        // displays the node's message to the user
        let result = match self.rpc.send_raw_transaction(tx_hex.as_str()) {
            Ok(txid) => json!(txid),
            Err(e) => json!(e.to_string()),
        };
        debug!(target: LT, "tx broadcast result = {}", result);
        Ok(response(id, result))
    }

    fn blockchain_scripthash_subscribe(&mut self, params: Value, id: &Value) -> Result<Value> {
        let scripthash: ScriptHash = from_value(params.get(0).cloned().or_err("missing scripthash")?)
            .context("invalid scripthash")?;

        let status_hash = if self.monitor.subscribe_address(&scripthash) {
            self.monitor.status_hash(&scripthash)
        } else {
            warn!(
                target: LT,
                "electrum is requesting information about {}, which is missing from the \
                 configured master public keys and watch-only addresses",
                scripthash
            );
            None
        };
        Ok(response(id, status_hash_json(status_hash)))
    }

    fn blockchain_scripthash_get_history(&mut self, params: Value, id: &Value) -> Result<Value> {
        let scripthash: ScriptHash = from_value(params.get(0).cloned().or_err("missing scripthash")?)
            .context("invalid scripthash")?;

        let history = self.monitor.get_electrum_history(&scripthash).unwrap_or_else(|| {
            warn!(target: LT, "history requested for unknown script {}", scripthash);
            vec![]
        });
        Ok(response(id, json!(history)))
    }

    fn blockchain_estimatefee(&mut self, params: Value, id: &Value) -> Result<Value> {
        let target = params
            .get(0)
            .and_then(Value::as_u64)
            .or_err("missing confirmation target")? as u16;

        let estimate = self.rpc.estimate_smart_fee(target, None)?;
        // BTC/kB, with a floor value when the node has no estimate yet
        let fee_rate = estimate.fee_rate.map_or(0.0001, |rate| rate.as_btc());
        Ok(response(id, json!(fee_rate)))
    }

    fn blockchain_relayfee(&mut self, id: &Value) -> Result<Value> {
        let relay_fee = self.rpc.get_network_info()?.relay_fee.as_btc();
        Ok(response(id, json!(relay_fee)))
    }

    fn mempool_get_fee_histogram(&mut self, id: &Value) -> Result<Value> {
        let histogram = make_fee_histogram(self.rpc.get_raw_mempool_entries()?);
        Ok(response(id, json!(histogram)))
    }

    /// The connected heartbeat: check the tip, run the polling step and push
    /// subscription updates, headers first.
    fn heartbeat(&mut self) -> Result<()> {
        trace!(target: LT, "heartbeat connected");
        if self.shutdown.load(Ordering::SeqCst) {
            bail!(EpsError::ShutdownRequested);
        }

        match self.headers.check_for_new_tip(self.raw_headers) {
            Ok((true, header)) => {
                debug!(target: LT, "blockchain tip updated");
                if self.headers_subscribed {
                    self.send_value(&json!({
                        "jsonrpc": "2.0",
                        "method": "blockchain.headers.subscribe",
                        "params": [header],
                    }))?;
                }
            }
            Ok((false, _)) => (),
            Err(e) => warn!(target: LT, "tip check failed: {:?}", e),
        }

        let updated_scripthashes = match self.monitor.check_for_updated_txes() {
            Ok(updated) => updated,
            Err(e) => {
                warn!(target: LT, "wallet poll failed: {:?}", e);
                vec![]
            }
        };
        for scripthash in updated_scripthashes {
            if self.monitor.is_subscribed(&scripthash) {
                let status_hash = self.monitor.status_hash(&scripthash);
                self.send_value(&json!({
                    "jsonrpc": "2.0",
                    "method": "blockchain.scripthash.subscribe",
                    "params": [scripthash, status_hash_json(status_hash)],
                }))?;
            }
        }
        Ok(())
    }

    fn send_value(&mut self, value: &Value) -> Result<()> {
        trace!(target: LT, "[{}] <= {}", self.addr, value);
        let line = value.to_string() + "\n";
        self.stream
            .write_all(line.as_bytes())
            .context("failed to send reply to the wallet")?;
        Ok(())
    }
}

fn response(id: &Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_reply(id: &Value, error: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

fn height_out_of_range(id: &Value, height: u32) -> Value {
    error_reply(
        id,
        json!({ "message": format!("height {} out of range", height), "code": -1 }),
    )
}

fn height_param(params: &Value) -> Result<u32> {
    Ok(params
        .get(0)
        .and_then(Value::as_u64)
        .or_err("missing height")? as u32)
}

// The client advertises either a single version or a [min, max] range.
fn parse_version_range(param: &Value) -> Result<(f64, f64)> {
    Ok(match param {
        Value::Array(range) => {
            let min = version_number(range.get(0).or_err("empty version range")?)?;
            let max = version_number(range.get(1).unwrap_or(&range[0]))?;
            (min, max)
        }
        scalar => {
            let version = version_number(scalar)?;
            (version, version)
        }
    })
}

fn version_number(value: &Value) -> Result<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .or_err(format!("invalid protocol version {}", value))
}

fn negotiate_version(client_min: f64, client_max: f64) -> Option<f64> {
    let negotiated = client_max.min(PROTOCOL_VERSION_MAX);
    iif!(
        negotiated < client_min.max(PROTOCOL_VERSION_MIN),
        None,
        Some(negotiated)
    )
}

// 1.4 always gets raw headers, 1.2/1.3 choose via the optional param
// (defaulting per version), everything older gets structured headers.
fn raw_headers_for(protocol_version: f64, raw_param: Option<bool>) -> bool {
    if protocol_version == 1.2 || protocol_version == 1.3 {
        raw_param.unwrap_or(protocol_version == 1.3)
    } else {
        protocol_version == 1.4
    }
}

fn load_tls_acceptor(certfile: &PathBuf, keyfile: &PathBuf) -> Result<TlsAcceptor> {
    let cert_pem = fs::read(certfile)
        .with_context(|| format!("cannot read TLS certificate {}", certfile.display()))?;
    let key_pem = fs::read(keyfile)
        .with_context(|| format!("cannot read TLS key {}", keyfile.display()))?;
    let identity = Identity::from_pkcs8(&cert_pem, &key_pem)
        .context("invalid TLS identity (expecting a PEM certificate and a PKCS#8 key)")?;
    Ok(TlsAcceptor::new(identity).context("failed setting up the TLS acceptor")?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_negotiation() {
        assert_eq!(negotiate_version(1.4, 1.4), Some(1.4));
        assert_eq!(negotiate_version(1.1, 1.1), Some(1.1));
        assert_eq!(negotiate_version(1.1, 1.4), Some(1.4));
        // client wants something newer than we speak
        assert_eq!(negotiate_version(1.5, 1.6), None);
        // or older
        assert_eq!(negotiate_version(0.10, 0.10), None);
        // overlapping ranges meet at our maximum
        assert_eq!(negotiate_version(1.2, 99.0), Some(1.4));
    }

    #[test]
    fn test_version_range_parsing() {
        let (min, max) = parse_version_range(&json!("1.4")).unwrap();
        assert_eq!((min, max), (1.4, 1.4));

        let (min, max) = parse_version_range(&json!(["1.1", "1.4"])).unwrap();
        assert_eq!((min, max), (1.1, 1.4));

        let (min, max) = parse_version_range(&json!([1.2])).unwrap();
        assert_eq!((min, max), (1.2, 1.2));

        assert!(parse_version_range(&json!("electrum")).is_err());
        assert!(parse_version_range(&json!([])).is_err());
    }

    #[test]
    fn test_raw_headers_rule() {
        assert!(raw_headers_for(1.4, None));
        assert!(raw_headers_for(1.4, Some(false))); // 1.4 ignores the param
        assert!(!raw_headers_for(1.2, None));
        assert!(raw_headers_for(1.2, Some(true)));
        assert!(raw_headers_for(1.3, None));
        assert!(!raw_headers_for(1.3, Some(false)));
        assert!(!raw_headers_for(1.1, None));
        assert!(!raw_headers_for(0.0, None)); // nothing negotiated yet
    }

    #[test]
    fn test_reply_shapes() {
        let ok = response(&json!(7), json!("result"));
        assert_eq!(ok, json!({"jsonrpc": "2.0", "id": 7, "result": "result"}));

        let err = height_out_of_range(&json!(3), 12345);
        assert_eq!(
            err,
            json!({"jsonrpc": "2.0", "id": 3, "error": {"message": "height 12345 out of range", "code": -1}})
        );
    }
}
