//! Ethereum Classic test networks on geth.
//!
//! Build walks the conventional stages:
//!
//! 1. Accounts are drawn from the key pool and imported on every node
//! 2. A genesis file allocating a balance to every account is rendered per node
//! 3. A mining geth daemon is started on every node
//! 4. Each node's enode is collected (barrier), with its address substituted
//! 5. Every node is told about every other node via `admin_addPeer`
//! 6. RPC coordinates are exposed and account unlocks are deferred
//!
//! Adding nodes replays the same stages on the new nodes only, reusing the
//! configuration, accounts and enodes stored by the original build.

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::error::{BuildError, KeyPoolError, Result};
use crate::families::helpers;
use crate::models::{KeyPair, Network, Node, ParameterSet};
use crate::orchestrator::{retry_until_success, ArtifactKey, BuildContext, BuildStage, NodeSelection};
use crate::registry::{BuildStrategy, ParamKind, ParamSchema};
use crate::remote::RemoteExecutor;
use crate::services::{self, Service};

pub const FAMILY: &str = "ethclassic";
pub const ALIAS: &str = "etc";

pub const RPC_PORT: u16 = 8545;
const PASSWORD: &str = "password";
const PASSWORD_FILE: &str = "/geth/passwd";
const CHAIN_FILE: &str = "/geth/chain.json";
const OUTPUT_FILE: &str = "/output.log";
/// Where the scrape config is written on every host; the prometheus service mounts it.
pub const PROMETHEUS_CONFIG_PATH: &str = "/etc/ledgerforge/prometheus.yml";
const PROMETHEUS_CONFIG_DIR: &str = "/etc/ledgerforge";

pub const ETC_CONF: ArtifactKey<EtcConf> = ArtifactKey::new("etcconf");
pub const ACCOUNTS: ArtifactKey<Vec<KeyPair>> = ArtifactKey::new("accounts");
pub const GENESIS: ArtifactKey<Value> = ArtifactKey::new("genesis");
pub const STATIC_NODES: ArtifactKey<Vec<String>> = ArtifactKey::new("staticNodes");
pub const PROMETHEUS_CONFIG: ArtifactKey<String> = ArtifactKey::new("prometheusConfig");

pub const EXT_NETWORK_ID: ArtifactKey<u64> = ArtifactKey::new("networkID");
pub const EXT_PORT: ArtifactKey<u16> = ArtifactKey::new("port");
pub const EXT_NAMESPACE: ArtifactKey<String> = ArtifactKey::new("namespace");
pub const EXT_PASSWORD: ArtifactKey<String> = ArtifactKey::new("password");
pub const EXT_ACCOUNTS: ArtifactKey<Vec<String>> = ArtifactKey::new("accounts");

static ENODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"enode://[A-Za-z0-9]+@(\[::\]|[0-9.]+):[0-9]+").expect("valid enode regex")
});

static ENODE_ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[::\]|[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}").expect("valid address regex")
});

static ETHKEY_SECRET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"secret:\s+([0-9a-fA-F]{64})").expect("valid secret regex"));

static ETHKEY_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"address:\s+([0-9a-fA-F]{40})").expect("valid address regex"));

const CHAIN_TEMPLATE: &str = r#"{
  "identity": "{{identity}}",
  "name": "{{name}}",
  "network": {{network}},
  "chainId": {{network}},
  "consensus": "{{consensus}}",
  "genesis": {
    "difficulty": "{{difficulty}}",
    "gasLimit": "{{gasLimit}}",
    "nonce": "{{nonce}}",
    "timestamp": "0x0",
    "mixhash": "{{mixhash}}",
    "extraData": "{{extraData}}",
    "alloc": {{alloc}}
  },
  "consensusParams": {{consensusParams}},
  "bootstrap": []
}"#;

/// Typed ethclassic parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EtcConf {
    pub network_id: u64,
    /// `ethash` or `clique`
    pub consensus: String,
    /// Wei allocated to every account in the genesis block
    pub init_balance: String,
    /// Accounts created beyond one per node
    pub extra_accounts: u64,
    pub max_peers: u64,
    pub gas_limit: u64,
    pub difficulty: u64,
    pub identity: String,
    pub name: String,
    pub block_period_seconds: u64,
    pub epoch: u64,
}

impl Default for EtcConf {
    fn default() -> Self {
        EtcConf {
            network_id: 15468,
            consensus: "ethash".to_string(),
            init_balance: "100000000000000000000".to_string(),
            extra_accounts: 0,
            max_peers: 1000,
            gas_limit: 4_000_000,
            difficulty: 100_000,
            identity: "ledgerforge".to_string(),
            name: "ledgerforge".to_string(),
            block_period_seconds: 5,
            epoch: 30_000,
        }
    }
}

impl EtcConf {
    pub fn from_params(params: &ParameterSet) -> Result<Self> {
        let conf: EtcConf = params.decode()?;
        match conf.consensus.as_str() {
            "ethash" | "clique" => Ok(conf),
            other => {
                let err = BuildError::Config(format!("unrecognized consensus mode '{}'", other));
                log::error!("{}", err);
                Err(err)
            }
        }
    }
}

/// Steps of a fresh build of `n` nodes.
pub fn build_steps(n: u64) -> u64 {
    3 + 3 * n + n * n.saturating_sub(1)
}

/// Steps of adding `new` nodes to a network of `prior` nodes.
pub fn add_steps(prior: u64, new: u64) -> u64 {
    if new == 0 {
        return 3;
    }
    3 + 3 * new + new * (prior + new - 1)
}

/// Find the enode in geth output and point it at `address`.
pub fn parse_enode(output: &str, address: &str) -> Result<String> {
    let enode = ENODE.find(output).ok_or_else(|| {
        let err = BuildError::Parse {
            what: "enode".to_string(),
            output: output.trim().to_string(),
        };
        log::error!("{}", err);
        err
    })?;
    Ok(ENODE_ADDRESS.replace_all(enode.as_str(), address).into_owned())
}

/// Key generator running `ethkey generate random` on the host.
pub fn key_generator(host: Arc<dyn RemoteExecutor>) -> BoxFuture<'static, std::result::Result<KeyPair, KeyPoolError>> {
    Box::pin(async move {
        let output = host
            .run("ethkey generate random")
            .await
            .map_err(|e| KeyPoolError::Generation(e.to_string()))?;
        parse_ethkey(&output)
    })
}

fn parse_ethkey(output: &str) -> std::result::Result<KeyPair, KeyPoolError> {
    let secret = ETHKEY_SECRET.captures(output).map(|c| c[1].to_lowercase());
    let address = ETHKEY_ADDRESS.captures(output).map(|c| c[1].to_lowercase());
    match (secret, address) {
        (Some(private_key), Some(address)) => Ok(KeyPair {
            private_key,
            public_key: format!("0x{}", address),
        }),
        _ => Err(KeyPoolError::Generation(format!(
            "unexpected ethkey output: {}",
            output.trim()
        ))),
    }
}

/// Genesis values shared by every node's chain file.
pub fn genesis_context(conf: &EtcConf, accounts: &[KeyPair]) -> Result<Value> {
    let mut alloc = Map::new();
    for account in accounts {
        alloc.insert(
            strip_hex(&account.public_key).to_string(),
            json!({ "balance": conf.init_balance }),
        );
    }

    let (consensus_params, extra_data) = match conf.consensus.as_str() {
        "clique" => {
            let signer = accounts.first().ok_or_else(|| {
                BuildError::Config("clique needs at least one signer account".to_string())
            })?;
            let extra = format!(
                "0x{}{}{}",
                "0".repeat(64),
                strip_hex(&signer.public_key),
                "0".repeat(130)
            );
            (json!({ "period": conf.block_period_seconds, "epoch": conf.epoch }), extra)
        }
        _ => (json!({ "difficulty": conf.difficulty }), "0x".to_string()),
    };

    Ok(json!({
        "identity": conf.identity,
        "name": conf.name,
        "network": conf.network_id,
        "consensus": conf.consensus,
        "difficulty": format!("0x0{:x}", conf.difficulty),
        "gasLimit": format!("0x{:x}", conf.gas_limit),
        "nonce": format!("0x{:016x}", 0x42),
        "mixhash": format!("0x{}", "0".repeat(64)),
        "extraData": extra_data,
        "alloc": Value::Object(alloc),
        "consensusParams": consensus_params,
    }))
}

fn strip_hex(s: &str) -> &str {
    s.strip_prefix("0x").unwrap_or(s)
}

pub struct EthClassic;

impl BuildStrategy for EthClassic {
    fn name(&self) -> &str {
        FAMILY
    }

    fn build<'a>(&'a self, ctx: &'a BuildContext<'a>) -> BoxFuture<'a, Result<()>> {
        Box::pin(build(ctx))
    }

    fn add_nodes<'a>(&'a self, ctx: &'a BuildContext<'a>) -> BoxFuture<'a, Result<()>> {
        Box::pin(add(ctx))
    }

    fn defaults(&self) -> ParameterSet {
        let mut params = ParameterSet::new(FAMILY, 0);
        if let Ok(Value::Object(values)) = serde_json::to_value(EtcConf::default()) {
            params.values = values;
        }
        params
    }

    fn params_schema(&self) -> ParamSchema {
        ParamSchema::default()
            .field("networkId", ParamKind::Integer, "chain and network id")
            .field("consensus", ParamKind::String, "ethash or clique")
            .field("initBalance", ParamKind::String, "wei allocated to every account")
            .field("extraAccounts", ParamKind::Integer, "accounts beyond one per node")
            .field("maxPeers", ParamKind::Integer, "")
            .field("gasLimit", ParamKind::Integer, "")
            .field("difficulty", ParamKind::Integer, "")
            .field("identity", ParamKind::String, "")
            .field("name", ParamKind::String, "")
            .field("blockPeriodSeconds", ParamKind::Integer, "clique block period")
            .field("epoch", ParamKind::Integer, "clique epoch length")
    }

    fn services(&self) -> Vec<Service> {
        vec![services::prometheus_service(services::PROMETHEUS_PORT, PROMETHEUS_CONFIG_PATH)]
    }

    fn sidecars(&self, network: &Network) -> Vec<String> {
        match EtcConf::from_params(&network.params().with_defaults(&self.defaults())) {
            Ok(conf) if conf.consensus == "ethash" => vec!["geth".to_string()],
            _ => Vec::new(),
        }
    }
}

async fn build(ctx: &BuildContext<'_>) -> Result<()> {
    let conf = EtcConf::from_params(&ctx.params)?;
    let nodes = ctx.network.node_count() as u64;
    let state = &ctx.state;

    state.set_total_steps(build_steps(nodes));
    state.enter(BuildStage::DeclaringSteps);

    state.enter(BuildStage::DistributingSecrets);
    let accounts = acquire_accounts(ctx, (nodes + conf.extra_accounts) as usize).await?;
    helpers::mkdir_all_nodes(ctx, "/geth").await?;
    helpers::copy_bytes_to_all_nodes(ctx, &password_file(accounts.len()), PASSWORD_FILE).await?;
    state.increment_progress();
    let accounts = Arc::new(accounts);
    import_accounts(ctx, NodeSelection::All, &accounts).await?;
    state.put(ACCOUNTS, &accounts)?;

    state.enter(BuildStage::CreatingGenesis);
    let genesis = genesis_context(&conf, &accounts)?;
    let renderer = Arc::clone(&ctx.renderer);
    helpers::create_configs(ctx, CHAIN_FILE, |_| renderer.render(CHAIN_TEMPLATE, &genesis)).await?;
    state.put(GENESIS, &genesis)?;
    state.put(ETC_CONF, &conf)?;
    state.increment_progress();

    state.enter(BuildStage::InitializingDaemons);
    start_daemons(ctx, NodeSelection::All, &conf, &accounts).await?;

    state.enter(BuildStage::CollectingPeers);
    let mut static_nodes = vec![String::new(); ctx.network.node_count()];
    for (index, enode) in collect_enodes(ctx, NodeSelection::All).await? {
        static_nodes[index] = enode;
    }
    state.put(STATIC_NODES, &static_nodes)?;

    state.enter(BuildStage::BroadcastingPeers);
    ctx.pause(ctx.peering_delay).await?;
    log::debug!("peering {} nodes: {:?}", static_nodes.len(), static_nodes);
    peer_nodes(ctx, NodeSelection::All, Arc::new(static_nodes)).await?;

    state.enter(BuildStage::ExposingArtifacts);
    expose(ctx, &conf, &accounts).await?;
    defer_unlocks(ctx, NodeSelection::All, &accounts);
    state.increment_progress();
    Ok(())
}

async fn add(ctx: &BuildContext<'_>) -> Result<()> {
    let state = &ctx.state;
    let conf = require_artifact(ctx, ETC_CONF)?;
    let accounts = Arc::new(require_artifact(ctx, ACCOUNTS)?);
    let genesis = require_artifact(ctx, GENESIS)?;
    let mut static_nodes = require_artifact(ctx, STATIC_NODES)?;

    let new = ctx.network.new_nodes().len() as u64;
    let prior = ctx.network.prior_nodes().len() as u64;
    state.set_total_steps(add_steps(prior, new));
    state.enter(BuildStage::DeclaringSteps);

    state.enter(BuildStage::DistributingSecrets);
    helpers::mkdir_new_nodes(ctx, "/geth").await?;
    helpers::copy_bytes_to_new_nodes(ctx, &password_file(accounts.len()), PASSWORD_FILE).await?;
    state.increment_progress();
    import_accounts(ctx, NodeSelection::NewlyAdded, &accounts).await?;

    state.enter(BuildStage::CreatingGenesis);
    let renderer = Arc::clone(&ctx.renderer);
    helpers::create_configs_new_nodes(ctx, CHAIN_FILE, |_| renderer.render(CHAIN_TEMPLATE, &genesis)).await?;
    state.increment_progress();

    state.enter(BuildStage::InitializingDaemons);
    start_daemons(ctx, NodeSelection::NewlyAdded, &conf, &accounts).await?;

    state.enter(BuildStage::CollectingPeers);
    static_nodes.resize(ctx.network.node_count(), String::new());
    for (index, enode) in collect_enodes(ctx, NodeSelection::NewlyAdded).await? {
        static_nodes[index] = enode;
    }
    state.put(STATIC_NODES, &static_nodes)?;

    state.enter(BuildStage::BroadcastingPeers);
    ctx.pause(ctx.peering_delay).await?;
    peer_nodes(ctx, NodeSelection::NewlyAdded, Arc::new(static_nodes)).await?;

    state.enter(BuildStage::ExposingArtifacts);
    expose(ctx, &conf, &accounts).await?;
    defer_unlocks(ctx, NodeSelection::NewlyAdded, &accounts);
    state.increment_progress();
    Ok(())
}

fn require_artifact<T: serde::de::DeserializeOwned>(ctx: &BuildContext<'_>, key: ArtifactKey<T>) -> Result<T> {
    ctx.state.fetch(key)?.ok_or_else(|| {
        let err = BuildError::Artifact {
            key: key.name().to_string(),
            reason: "missing from the prior build".to_string(),
        };
        log::error!("{}", err);
        err
    })
}

fn password_file(accounts: usize) -> String {
    format!("{}\n", PASSWORD).repeat(accounts)
}

async fn acquire_accounts(ctx: &BuildContext<'_>, count: usize) -> Result<Vec<KeyPair>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let host = ctx
        .network
        .nodes()
        .first()
        .and_then(|node| ctx.network.host_for(node))
        .ok_or_else(|| BuildError::Config("no host available to create accounts on".to_string()))?;

    let ids: Vec<String> = (0..count).map(|i| format!("account{}", i)).collect();
    let mut mapped = ctx.key_pool.lock().await.get_mapped_key_pairs(&ids, &host).await?;
    Ok(ids.iter().filter_map(|id| mapped.remove(id)).collect())
}

async fn import_accounts(ctx: &BuildContext<'_>, selection: NodeSelection, accounts: &Arc<Vec<KeyPair>>) -> Result<()> {
    let accounts = Arc::clone(accounts);
    let state = Arc::clone(&ctx.state);
    ctx.for_nodes(selection, move |host, node| {
        let accounts = Arc::clone(&accounts);
        let state = Arc::clone(&state);
        async move {
            for (i, account) in accounts.iter().enumerate() {
                let command = format!(
                    "echo '{}' > /geth/pk{i} && geth --datadir /geth/ --password {} account import /geth/pk{i}",
                    strip_hex(&account.private_key),
                    PASSWORD_FILE,
                    i = i
                );
                host.exec(&node, &command).await?;
            }
            state.increment_progress();
            Ok(())
        }
    })
    .await
}

async fn start_daemons(
    ctx: &BuildContext<'_>,
    selection: NodeSelection,
    conf: &EtcConf,
    accounts: &Arc<Vec<KeyPair>>,
) -> Result<()> {
    let unlock = accounts
        .iter()
        .map(|a| a.public_key.as_str())
        .collect::<Vec<_>>()
        .join(",");
    let accounts = Arc::clone(accounts);
    let conf = conf.clone();
    let state = Arc::clone(&ctx.state);

    ctx.for_nodes(selection, move |host, node| {
        let etherbase = match accounts.len() {
            0 => None,
            len => Some(accounts[node.absolute_index % len].public_key.clone()),
        };
        let command = geth_command(&conf, &node, &unlock, etherbase.as_deref());
        let state = Arc::clone(&state);
        async move {
            host.exec(&node, &command).await?;
            state.increment_progress();
            Ok(())
        }
    })
    .await
}

fn geth_command(conf: &EtcConf, node: &Node, unlock: &str, etherbase: Option<&str>) -> String {
    let mut command = format!(
        "nohup geth --datadir=/geth/ --network-id={} --chain={} --maxpeers={} --nodiscover \
         --rpc --rpcaddr={} --rpcport={} --rpcapi=\"admin,web3,db,eth,net,personal,miner,txpool\" \
         --rpccorsdomain=\"0.0.0.0\"",
        conf.network_id, CHAIN_FILE, conf.max_peers, node.address, RPC_PORT
    );
    if let Some(etherbase) = etherbase {
        command.push_str(&format!(
            " --mine --unlock=\"{}\" --password={} --etherbase={}",
            unlock, PASSWORD_FILE, etherbase
        ));
    }
    command.push_str(&format!(" > {} 2>&1 &", OUTPUT_FILE));
    command
}

/// Each selected node's enode, keyed by absolute index.
async fn collect_enodes(ctx: &BuildContext<'_>, selection: NodeSelection) -> Result<Vec<(usize, String)>> {
    let retry = ctx.retry;
    let cancel = ctx.cancel.clone();
    let state = Arc::clone(&ctx.state);

    ctx.map_selected(selection, move |host, node| {
        let cancel = cancel.clone();
        let state = Arc::clone(&state);
        async move {
            let (host, node_ref) = (&host, &node);
            let enode = retry_until_success(retry, &cancel, move |_| async move {
                let output = host
                    .exec(node_ref, "geth attach /geth/geth.ipc --exec admin.nodeInfo.enode")
                    .await?;
                parse_enode(&output, &node_ref.address)
            })
            .await?;
            log::debug!("node {} enode {}", node.absolute_index, enode);
            state.increment_progress();
            Ok((node.absolute_index, enode))
        }
    })
    .await
}

/// Have every selected node add every other known enode as a peer.
async fn peer_nodes(ctx: &BuildContext<'_>, selection: NodeSelection, enodes: Arc<Vec<String>>) -> Result<()> {
    let retry = ctx.retry;
    let cancel = ctx.cancel.clone();
    let state = Arc::clone(&ctx.state);

    ctx.for_nodes(selection, move |host, node| {
        let enodes = Arc::clone(&enodes);
        let cancel = cancel.clone();
        let state = Arc::clone(&state);
        async move {
            for (index, enode) in enodes.iter().enumerate() {
                if index == node.absolute_index || enode.is_empty() {
                    continue;
                }
                let command = rpc_call(&node.address, "admin_addPeer", &json!([enode]), 1);
                crate::orchestrator::run_retrying(&host, &command, retry, &cancel).await?;
                state.increment_progress();
            }
            Ok(())
        }
    })
    .await
}

fn rpc_call(address: &str, method: &str, params: &Value, id: u32) -> String {
    let body = json!({ "method": method, "params": params, "id": id, "jsonrpc": "2.0" });
    format!(
        "curl -sS -X POST http://{}:{} -H \"Content-Type: application/json\" -d '{}'",
        address, RPC_PORT, body
    )
}

async fn expose(ctx: &BuildContext<'_>, conf: &EtcConf, accounts: &[KeyPair]) -> Result<()> {
    let state = &ctx.state;
    let addresses: Vec<String> = accounts.iter().map(|a| a.public_key.clone()).collect();
    state.put_external(EXT_NETWORK_ID, &conf.network_id)?;
    state.put_external(EXT_PORT, &RPC_PORT)?;
    state.put_external(EXT_NAMESPACE, &"eth".to_string())?;
    state.put_external(EXT_PASSWORD, &PASSWORD.to_string())?;
    state.put_external(EXT_ACCOUNTS, &addresses)?;

    let scrape = services::prometheus_scrape_config(
        ctx.network,
        ctx.renderer.as_ref(),
        services::PROMETHEUS_INSTRUMENTATION_PORT,
    )?;
    state.put(PROMETHEUS_CONFIG, &scrape)?;
    write_prometheus_config(ctx, &scrape).await
}

/// Write the scrape config to every host carrying nodes, where the
/// prometheus service picks it up.
async fn write_prometheus_config(ctx: &BuildContext<'_>, scrape: &str) -> Result<()> {
    let command = format!(
        "mkdir -p {} && {}",
        PROMETHEUS_CONFIG_DIR,
        helpers::write_file_command(PROMETHEUS_CONFIG_PATH, scrape)
    );
    for host in ctx.network.node_hosts() {
        log::debug!("writing {} on host {}", PROMETHEUS_CONFIG_PATH, host.host());
        ctx.run_retrying(&host, &command).await?;
    }
    Ok(())
}

/// Unlock every account on every selected node once the build concludes.
/// Nodes keep working with locked accounts, so failures are only logged.
fn defer_unlocks(ctx: &BuildContext<'_>, selection: NodeSelection, accounts: &[KeyPair]) {
    let addresses: Vec<String> = accounts.iter().map(|a| a.public_key.clone()).collect();
    for node in crate::orchestrator::select_nodes(ctx.network, selection) {
        let Some(host) = ctx.network.host_for(&node) else {
            continue;
        };
        let addresses = addresses.clone();
        ctx.state.defer(move || async move {
            let mut first_error = None;
            for address in &addresses {
                let command = rpc_call(&node.address, "personal_unlockAccount", &json!([address, PASSWORD, 0]), 3);
                if let Err(e) = host.run(&command).await {
                    first_error.get_or_insert(e);
                }
            }
            match first_error {
                Some(e) => Err(BuildError::from(e)),
                None => Ok(()),
            }
        });
    }
}
