use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use ethers::providers::{Http, Provider};
use ethers::types::{Address, Bytes};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use userop_kit::chain::{chain_id_from_url, chain_info};
use userop_kit::encoding::{self, parse_bytes, parse_h256, user_op_to_json};
use userop_kit::fees::ProviderFeeOracle;
use userop_kit::{
    BundlerClient, Call, Dispatcher, LocalSigner, PartialUserOperation, PaymasterClient, Quantity,
    SdkConfig, SimpleAccount, SmartAccount, UserOpSigner, UserOperation, UserOperationHash,
};

// In `--json` mode stdout carries a single JSON document; everything
// human-readable goes to stderr.
macro_rules! outln {
    ($machine_mode:expr, $($arg:tt)*) => {{
        if $machine_mode {
            eprintln!($($arg)*);
        } else {
            println!($($arg)*);
        }
    }};
}

#[derive(Parser, Debug)]
#[command(name = "userop-kit", version)]
struct Cli {
    /// JSON config file (camelCase keys); USEROP_KIT_* variables override it.
    #[arg(long, global = true, env = "USEROP_KIT_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `userop_kit=trace`. Beats the config's logLevel and RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Print a single JSON object to stdout.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute the hash of a UserOperation read from a JSON file.
    Hash(HashArgs),

    /// Extract the chain id from a `/api/v<N>/<chainId>/<key>` service URL.
    ChainId(ChainIdArgs),

    /// Build, sign and send a UserOperation from the configured smart account.
    Send(SendArgs),

    /// Wait for the receipt of a submitted UserOperation.
    Receipt(ReceiptArgs),
}

#[derive(Args, Debug)]
struct HashArgs {
    /// UserOperation JSON (camelCase, hex quantities).
    file: PathBuf,

    /// Overrides the configured chain id.
    #[arg(long)]
    chain_id: Option<u64>,

    /// Overrides the configured EntryPoint.
    #[arg(long)]
    entry_point: Option<String>,

    /// Also print the signature-layout encoding that is hashed.
    #[arg(long, default_value_t = false)]
    packed: bool,
}

#[derive(Args, Debug)]
struct ChainIdArgs {
    url: String,
}

#[derive(Args, Debug)]
struct SendArgs {
    /// Smart account owner private key.
    #[arg(long, env = "USEROP_KIT_OWNER_PRIVATE_KEY", hide_env_values = true)]
    owner_private_key: String,

    /// Call target (single call mode).
    #[arg(long, conflicts_with = "batch", required_unless_present = "batch")]
    to: Option<String>,

    /// Wei to send with the call, decimal or 0x hex.
    #[arg(long, default_value = "0")]
    value: String,

    /// Calldata for the call, 0x hex.
    #[arg(long, default_value = "0x")]
    data: String,

    /// JSON array of `{ "to", "value", "data" }` calls, sent with executeBatch.
    #[arg(long)]
    batch: Option<PathBuf>,

    /// Ask the configured paymaster to sponsor gas.
    #[arg(long, default_value_t = false)]
    sponsor_gas: bool,

    /// Optional webhookData to include in paymaster requests.
    #[arg(long, env = "USEROP_KIT_WEBHOOK_DATA")]
    webhook_data: Option<String>,

    /// Build, estimate and sign, but do not send.
    #[arg(long)]
    dry_run: bool,

    /// Do not wait for the receipt.
    #[arg(long)]
    no_wait: bool,

    /// Max seconds to wait for the receipt. 0 disables the timeout.
    #[arg(long)]
    max_wait_seconds: Option<u64>,
}

#[derive(Args, Debug)]
struct ReceiptArgs {
    /// UserOperation hash.
    hash: String,

    /// Max seconds to wait. 0 disables the timeout.
    #[arg(long)]
    max_wait_seconds: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let cfg = load_config(cli.config.as_deref())?;
    init_tracing(cli.log_level.as_deref().or(cfg.log_level.as_deref()));

    match cli.cmd {
        Command::Hash(args) => cmd_hash(&cfg, args, cli.json),
        Command::ChainId(args) => cmd_chain_id(args, cli.json),
        Command::Send(args) => cmd_send(&cfg, args, cli.json).await,
        Command::Receipt(args) => cmd_receipt(&cfg, args, cli.json).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<SdkConfig> {
    let mut cfg = match path {
        Some(p) => SdkConfig::load(p)?,
        None => SdkConfig::default(),
    };
    cfg.apply_env()?;
    Ok(cfg)
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(l) => tracing_subscriber::EnvFilter::new(l),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "info".into()),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        // Always write logs to stderr so stdout can be used for script-friendly outputs.
        .with_writer(std::io::stderr)
        .init();
}

fn cmd_hash(cfg: &SdkConfig, args: HashArgs, json: bool) -> Result<()> {
    let raw = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let op: UserOperation = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse UserOperation at {}", args.file.display()))?;

    let chain_id = args.chain_id.unwrap_or(cfg.chain_id);
    if chain_id == 0 {
        return Err(anyhow!("chain id required: pass --chain-id or set chainId in the config"));
    }
    let entry_point: Address = args
        .entry_point
        .as_deref()
        .unwrap_or(&cfg.entry_point)
        .parse()
        .context("invalid entry point address")?;

    let hash = op.hash(entry_point, chain_id);
    let packed = args
        .packed
        .then(|| encoding::fmt_bytes(&encoding::pack_for_signature(&op)));

    if json {
        println!(
            "{}",
            serde_json::json!({
                "userOpHash": hash.to_string(),
                "entryPoint": encoding::fmt_address(entry_point),
                "chainId": chain_id,
                "packed": packed,
            })
        );
    } else {
        println!("userOpHash: {hash}");
        if let Some(p) = packed {
            println!("packed:     {p}");
        }
    }
    Ok(())
}

fn cmd_chain_id(args: ChainIdArgs, json: bool) -> Result<()> {
    let id = chain_id_from_url(&args.url)?;
    let name = chain_info(id).map(|c| c.name);
    if json {
        println!("{}", serde_json::json!({ "chainId": id, "name": name }));
    } else {
        match name {
            Some(n) => println!("{id} ({n})"),
            None => println!("{id}"),
        }
    }
    Ok(())
}

async fn cmd_send(cfg: &SdkConfig, args: SendArgs, json: bool) -> Result<()> {
    let settings = cfg.validate().context("invalid configuration")?;
    let calls = read_calls(&args)?;

    let provider = Provider::<Http>::try_from(settings.rpc_url.as_str())
        .with_context(|| format!("invalid rpc url {}", settings.rpc_url))?;
    let client = Arc::new(provider);

    let signer = LocalSigner::from_private_key(&args.owner_private_key, settings.chain_id)?;
    let account = SimpleAccount::connect(
        client.clone(),
        settings.entry_point,
        settings.factory,
        signer.address(),
        settings.salt,
    )
    .await
    .context("failed to resolve smart account address")?;

    outln!(json, "chainId:      {}", settings.chain_id);
    outln!(json, "entryPoint:   {:?}", settings.entry_point);
    outln!(json, "owner:        {:?}", signer.address());
    outln!(json, "smartAccount: {:?}", account.address());

    let bundler = BundlerClient::new(settings.bundler_url.clone(), settings.entry_point);
    let mut builder = Dispatcher::builder(Arc::new(account), bundler, settings.chain_id)
        .signer(Arc::new(signer))
        .fee_oracle(Arc::new(ProviderFeeOracle::new(
            client,
            settings.gas_multiplier_bps,
        )))
        .poll(settings.poll);

    if args.sponsor_gas {
        let url = settings
            .paymaster_url
            .clone()
            .ok_or_else(|| {
                anyhow!("--sponsor-gas requires paymasterUrl (or USEROP_KIT_PAYMASTER_URL)")
            })?;
        let mut pm = PaymasterClient::new(url);
        if let Some(policy) = &settings.policy_id {
            pm = pm.with_policy(policy.clone());
        }
        if let Some(wd) = &args.webhook_data {
            pm = pm.with_webhook_data(wd.clone());
        }
        builder = builder.paymaster_client(pm);
    }
    let dispatcher = builder.build()?;

    let signed = dispatcher.prepare(&calls, PartialUserOperation::new()).await?;
    outln!(
        json,
        "\nUserOperation (final):\n{}",
        serde_json::to_string_pretty(&user_op_to_json(&signed.op))?
    );
    outln!(json, "\nuserOpHash: {}", signed.hash);

    if args.dry_run {
        outln!(json, "\n--dry-run set: not sending user operation.");
        print_json(json, &signed.hash, &signed.op, None)?;
        return Ok(());
    }

    let mut pending = dispatcher.submit(signed).await?;
    if args.no_wait {
        outln!(json, "--no-wait set: not waiting for receipt.");
        print_json(json, &pending.hash(), pending.user_operation(), None)?;
        return Ok(());
    }

    if let Some(secs) = args.max_wait_seconds {
        pending = pending.with_poll(settings.poll.with_timeout(Duration::from_secs(secs)));
    }
    let cancel = cancel_on_ctrl_c();
    let receipt = pending.wait_with_cancel(&cancel).await?;
    let receipt_json = serde_json::to_value(&receipt)?;

    outln!(
        json,
        "\nUserOp receipt:\n{}",
        serde_json::to_string_pretty(&receipt_json)?
    );
    print_json(json, &pending.hash(), pending.user_operation(), Some(receipt_json))
}

async fn cmd_receipt(cfg: &SdkConfig, args: ReceiptArgs, json: bool) -> Result<()> {
    let settings = cfg.validate().context("invalid configuration")?;
    let hash = UserOperationHash(parse_h256(&args.hash)?);
    let bundler = BundlerClient::new(settings.bundler_url.clone(), settings.entry_point);

    let mut poll = settings.poll;
    if let Some(secs) = args.max_wait_seconds {
        poll = poll.with_timeout(Duration::from_secs(secs));
    }
    let cancel = cancel_on_ctrl_c();
    let receipt = bundler
        .wait_for_receipt(hash, &poll, Some(&cancel))
        .await
        .context("failed waiting for userOp receipt")?;

    let out = serde_json::to_string_pretty(&receipt)?;
    if json {
        println!("{}", serde_json::to_string(&receipt)?);
    } else {
        println!("{out}");
    }
    if !receipt.success {
        return Err(anyhow!(
            "user operation {hash} reverted: {}",
            receipt.reason.unwrap_or_default()
        ));
    }
    Ok(())
}

fn read_calls(args: &SendArgs) -> Result<Vec<Call>> {
    if let Some(path) = &args.batch {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let calls: Vec<Call> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse calls at {}", path.display()))?;
        if calls.is_empty() {
            return Err(anyhow!("{} contains no calls", path.display()));
        }
        return Ok(calls);
    }

    let to: Address = args
        .to
        .as_deref()
        .ok_or_else(|| anyhow!("--to or --batch is required"))?
        .parse()
        .context("invalid --to address")?;
    let value = Quantity::Text(args.value.clone())
        .normalize("value")?
        .unwrap_or_default();
    let data: Bytes = parse_bytes("data", &args.data)?;
    Ok(vec![Call::new(to, value, data)])
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; stop waiting for receipt");
            child.cancel();
        }
    });
    token
}

fn print_json(
    json: bool,
    hash: &UserOperationHash,
    op: &UserOperation,
    receipt: Option<serde_json::Value>,
) -> Result<()> {
    if json {
        let out = serde_json::json!({
            "userOpHash": hash.to_string(),
            "userOperation": user_op_to_json(op),
            "receipt": receipt,
        });
        println!("{}", serde_json::to_string(&out)?);
    }
    Ok(())
}
