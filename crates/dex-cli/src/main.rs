mod config;

use alloy::primitives::{Address, U256};
use clap::{ArgAction, Args, Parser, Subcommand};
use color_eyre::eyre::{eyre, Context, Result};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use config::AppConfig;
use dex_data::types::{NativeToken, User, UserType};
use dex_data::{AlloyChainReader, BlockRange, ChainClients, DexPair, LogFetcher, RequestLog, Store};
use dex_trade::{
    recover_pending, BalanceRefresher, Caller, ConfirmationWorker, Confirmer, GasOverrides,
    HttpCustodySigner, NativeTokenCache, PairService, SellOutcome, TradeService,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct AppContext {
    db_path: String,
    config: AppConfig,
}

#[derive(Parser, Debug)]
#[command(name = "dex")]
#[command(about = "EVM DEX trading and log retrieval toolkit")]
#[command(version)]
struct Cli {
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    /// Overrides `db_path` from the config file.
    #[arg(long, global = true)]
    db_path: Option<String>,

    /// Config file; `dex.toml` is used when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch event logs, splitting ranges the provider refuses.
    FetchLogs(FetchLogsArgs),
    /// Register a chain and its wrapped native token.
    AddChain(AddChainArgs),
    /// Create or update a user, binding a wallet on one chain.
    AddUser(AddUserArgs),
    /// Register the token/native pair deployed at an address.
    CreatePair(CreatePairArgs),
    /// Refresh a stored pair from the chain.
    SyncPair(PairIdArgs),
    PreviewBuy(PreviewArgs),
    PreviewSell(PreviewArgs),
    /// Print an unlimited approval payload for a client-side wallet.
    ComposeApprove(ComposeArgs),
    ComposeBuy(ComposeArgs),
    ComposeSell(ComposeArgs),
    /// Buy through the custody signer.
    Buy(BuyArgs),
    /// Sell through the custody signer, approving first when needed.
    Sell(TradeArgs),
    /// Approve the router for an exact amount and wait for the receipt.
    Approve(TradeArgs),
    /// Transfer native currency out of a custody wallet.
    Withdraw(WithdrawArgs),
    RefreshBalances(UserIdArgs),
    /// List recorded signer requests.
    Requests(RequestsArgs),
    /// Re-run confirmation for every pending request.
    ResumePending,
}

fn parse_address(raw: &str) -> Result<Address, String> {
    raw.parse::<Address>().map_err(|e| format!("invalid address {raw:?}: {e}"))
}

fn parse_wei(raw: &str) -> Result<U256, String> {
    U256::from_str_radix(raw.trim(), 10).map_err(|e| format!("invalid wei amount {raw:?}: {e}"))
}

#[derive(Args, Debug)]
struct FetchLogsArgs {
    #[arg(long)]
    chain_id: u64,

    #[arg(long = "address")]
    addresses: Vec<String>,

    /// topic0 values, OR-ed.
    #[arg(long = "topic")]
    topics: Vec<String>,

    #[arg(long)]
    from_block: u64,

    /// Defaults to the chain head.
    #[arg(long)]
    to_block: Option<u64>,

    #[arg(long, default_value = "table")]
    output: String,
}

#[derive(Args, Debug)]
struct AddChainArgs {
    #[arg(long)]
    chain_id: u64,

    #[arg(long)]
    name: String,

    #[arg(long, value_parser = parse_address)]
    native_address: Address,

    #[arg(long)]
    native_symbol: String,

    /// Defaults to `native-<chain_id>`.
    #[arg(long)]
    native_token_id: Option<String>,
}

#[derive(Args, Debug)]
struct AddUserArgs {
    #[arg(long)]
    user_id: String,

    /// `custody` or `external`.
    #[arg(long, default_value = "custody")]
    user_type: String,

    #[arg(long)]
    chain_id: u64,

    #[arg(long, value_parser = parse_address)]
    wallet: Address,

    #[arg(long)]
    slippage_bps: Option<u32>,

    #[arg(long, value_parser = parse_wei)]
    default_buy_wei: Option<U256>,

    #[arg(long, value_parser = parse_wei)]
    confirm_threshold_wei: Option<U256>,
}

#[derive(Args, Debug)]
struct CreatePairArgs {
    #[arg(long)]
    chain_id: u64,

    #[arg(long, default_value = "uniswap_v2")]
    pair_type: String,

    #[arg(long, value_parser = parse_address)]
    address: Address,
}

#[derive(Args, Debug)]
struct PairIdArgs {
    #[arg(long)]
    pair_id: String,
}

#[derive(Args, Debug)]
struct UserIdArgs {
    #[arg(long)]
    user_id: String,
}

#[derive(Args, Debug)]
struct PreviewArgs {
    #[arg(long)]
    pair_id: String,

    #[arg(long, value_parser = parse_wei)]
    amount_in: Option<U256>,

    #[arg(long, value_parser = parse_wei)]
    amount_out: Option<U256>,
}

#[derive(Args, Debug)]
struct ComposeArgs {
    #[arg(long)]
    user_id: String,

    #[arg(long)]
    pair_id: String,

    #[arg(long, value_parser = parse_wei)]
    amount: Option<U256>,

    #[arg(long, value_parser = parse_wei)]
    min_out: Option<U256>,
}

#[derive(Args, Debug, Clone)]
struct CallerArgs {
    #[arg(long)]
    user_id: String,

    /// Signer bearer token; falls back to `DEX_SIGNER_TOKEN`.
    #[arg(long)]
    auth_token: Option<String>,

    #[arg(long, default_value = "127.0.0.1")]
    client_ip: String,
}

#[derive(Args, Debug)]
struct TradeArgs {
    #[command(flatten)]
    caller: CallerArgs,

    #[arg(long)]
    pair_id: String,

    #[arg(long, value_parser = parse_wei)]
    amount: Option<U256>,

    #[arg(long, value_parser = parse_wei)]
    min_out: Option<U256>,
}

#[derive(Args, Debug)]
struct BuyArgs {
    #[command(flatten)]
    trade: TradeArgs,

    #[arg(long)]
    gas_price: Option<u128>,

    #[arg(long)]
    gas_limit: Option<u64>,
}

#[derive(Args, Debug)]
struct WithdrawArgs {
    #[command(flatten)]
    caller: CallerArgs,

    #[arg(long)]
    chain_id: u64,

    #[arg(long, value_parser = parse_address)]
    to: Address,

    #[arg(long, value_parser = parse_wei)]
    amount: Option<U256>,
}

#[derive(Args, Debug)]
struct RequestsArgs {
    #[arg(long)]
    user_id: Option<String>,

    #[arg(long, default_value_t = 20)]
    limit: usize,

    #[arg(long, default_value = "table")]
    output: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet)?;

    let config = AppConfig::load(cli.config.as_deref())?.with_env();
    let ctx = AppContext {
        db_path: cli
            .db_path
            .or_else(|| config.db_path.clone())
            .unwrap_or_else(|| "data/dex.sqlite".to_string()),
        config,
    };

    match cli.command {
        Commands::FetchLogs(args) => handle_fetch_logs(&ctx, args).await,
        Commands::AddChain(args) => handle_add_chain(&ctx, args),
        Commands::AddUser(args) => handle_add_user(&ctx, args),
        Commands::CreatePair(args) => handle_create_pair(&ctx, args).await,
        Commands::SyncPair(args) => handle_sync_pair(&ctx, args).await,
        Commands::PreviewBuy(args) => handle_preview(&ctx, args, true),
        Commands::PreviewSell(args) => handle_preview(&ctx, args, false),
        Commands::ComposeApprove(args) => handle_compose_approve(&ctx, args).await,
        Commands::ComposeBuy(args) => handle_compose(&ctx, args, true),
        Commands::ComposeSell(args) => handle_compose(&ctx, args, false),
        Commands::Buy(args) => handle_buy(&ctx, args).await,
        Commands::Sell(args) => handle_sell(&ctx, args).await,
        Commands::Approve(args) => handle_approve(&ctx, args).await,
        Commands::Withdraw(args) => handle_withdraw(&ctx, args).await,
        Commands::RefreshBalances(args) => handle_refresh_balances(&ctx, args).await,
        Commands::Requests(args) => handle_requests(&ctx, args),
        Commands::ResumePending => handle_resume_pending(&ctx).await,
    }
}

fn init_tracing(verbose: u8, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::WARN
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str()))
        .wrap_err("failed to initialize tracing filter")?;

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn open_store(ctx: &AppContext) -> Result<Arc<Store>> {
    if let Some(parent) = std::path::Path::new(&ctx.db_path).parent() {
        if !parent.as_os_str().is_empty() && ctx.db_path != ":memory:" {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
        }
    }
    Ok(Arc::new(
        Store::new(&ctx.db_path).wrap_err("failed to open SQLite store")?,
    ))
}

fn spinner(message: &'static str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .wrap_err("failed to create progress style")?,
    );
    pb.set_message(message);
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    Ok(pb)
}

/// Connects every configured chain plus `extra`, which may only be reachable
/// through `DEX_RPC_URL`.
async fn connect_chains(ctx: &AppContext, extra: Option<u64>) -> Result<ChainClients> {
    let mut chain_ids = ctx.config.chain_ids()?;
    if let Some(chain_id) = extra {
        if !chain_ids.contains(&chain_id) {
            chain_ids.push(chain_id);
        }
    }

    let mut clients = ChainClients::new();
    for chain_id in chain_ids {
        let rpc_url = ctx.config.rpc_url(chain_id).ok_or_else(|| {
            eyre!("no RPC URL for chain {chain_id}: set DEX_RPC_URL or add [chains.{chain_id}]")
        })?;
        let reader = AlloyChainReader::connect(chain_id, &rpc_url)
            .await
            .wrap_err_with(|| format!("failed to connect to chain {chain_id}"))?;
        clients.insert(chain_id, Arc::new(reader));
    }
    Ok(clients)
}

fn pair_chain(store: &Store, pair_id: &str) -> Result<u64> {
    store
        .get_pair(pair_id)
        .wrap_err("failed to query pair")?
        .map(|pair| pair.chain_id)
        .ok_or_else(|| eyre!("pair {pair_id} not found"))
}

/// Trade service wired to a running confirmation worker.
struct Runtime {
    store: Arc<Store>,
    chains: ChainClients,
    trade: TradeService,
    worker: JoinHandle<()>,
    cancel: CancellationToken,
}

impl Runtime {
    async fn start(ctx: &AppContext, extra_chain: Option<u64>) -> Result<Self> {
        let store = open_store(ctx)?;
        let chains = connect_chains(ctx, extra_chain).await?;
        let signer = Arc::new(
            HttpCustodySigner::new(&ctx.config.signer).wrap_err("failed to build signer client")?,
        );
        let cancel = CancellationToken::new();
        let confirmer = Confirmer::new(
            store.clone(),
            chains.clone(),
            signer.clone(),
            ctx.config.receipts,
        );
        let (worker, queue) = ConfirmationWorker::new(confirmer, cancel.clone());
        let trade = TradeService::new(
            store.clone(),
            chains.clone(),
            signer,
            queue,
            ctx.config.trade_config()?,
        );

        Ok(Self {
            store,
            chains,
            trade,
            worker: worker.spawn(),
            cancel,
        })
    }

    /// Waits for background approvals and queued confirmations; Ctrl-C
    /// abandons them, leaving their request logs pending.
    async fn finish(self) -> Result<()> {
        let Runtime {
            trade,
            worker,
            cancel,
            ..
        } = self;

        let pb = spinner("waiting for confirmations")?;
        let tasks = trade.tasks().clone();
        tasks.close();
        let drain = async move {
            tasks.wait().await;
            drop(trade);
            worker.await
        };
        tokio::pin!(drain);

        tokio::select! {
            result = &mut drain => {
                result.wrap_err("confirmation worker failed")?;
                pb.finish_with_message("confirmations finished");
            }
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                pb.finish_with_message("interrupted; pending requests can be resumed later");
            }
        }
        Ok(())
    }
}

fn auth_token(ctx: &AppContext, args: &CallerArgs) -> Result<String> {
    args.auth_token
        .clone()
        .or_else(|| ctx.config.service_token.clone())
        .ok_or_else(|| eyre!("--auth-token or DEX_SIGNER_TOKEN is required"))
}

fn caller(ctx: &AppContext, args: &CallerArgs) -> Result<Caller> {
    Ok(Caller {
        user_id: args.user_id.clone(),
        auth_token: auth_token(ctx, args)?,
        client_ip: args.client_ip.clone(),
    })
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json_str = serde_json::to_string_pretty(value).wrap_err("failed to serialize JSON")?;
    println!("{}", json_str);
    Ok(())
}

fn print_pair(pair: &DexPair) {
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Field", "Value"]);
    table.add_row(vec!["Pair ID", pair.id.as_str()]);
    table.add_row(vec!["Type", pair.pair_type.as_str()]);
    table.add_row(vec!["Chain", &pair.chain_id.to_string()]);
    table.add_row(vec!["Contract", &pair.contract_address.to_string()]);
    table.add_row(vec!["Token", &pair.token.contract_address.to_string()]);
    table.add_row(vec![
        "Symbol",
        &format!("{} ({} decimals)", pair.token.symbol, pair.token.decimals),
    ]);
    let reserves = pair.reserves();
    table.add_row(vec!["Token Reserve", &reserves.token_reserve.to_string()]);
    table.add_row(vec!["Native Reserve", &reserves.native_reserve.to_string()]);
    table.add_row(vec!["LP Supply", &pair.total_supply.to_string()]);
    table.add_row(vec![
        "Renounced",
        if pair.token.is_renounced { "yes" } else { "no" },
    ]);
    println!("{}\n", table);
}

fn format_timestamp(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "N/A".to_string())
}

async fn handle_fetch_logs(ctx: &AppContext, args: FetchLogsArgs) -> Result<()> {
    let range = BlockRange::new(args.from_block, args.to_block)?;
    let chains = connect_chains(ctx, Some(args.chain_id)).await?;
    let reader = chains
        .get(args.chain_id)
        .ok_or_else(|| eyre!("chain {} is not connected", args.chain_id))?;
    let fetcher = LogFetcher::new(args.chain_id, reader, ctx.config.log_fetch.clone());

    let pb = spinner("fetching logs")?;
    let logs = fetcher.fetch(&args.addresses, &args.topics, range, 0).await;
    pb.finish_with_message(format!("fetched {} logs", logs.len()));

    if args.output == "json" {
        return print_json(&logs);
    }

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Block", "Tx Hash", "Address", "Topic0"]);
    for log in &logs {
        table.add_row(vec![
            log.block_number.map(|n| n.to_string()).unwrap_or_default(),
            log.transaction_hash.map(|h| h.to_string()).unwrap_or_default(),
            log.address().to_string(),
            log.topics().first().map(|t| t.to_string()).unwrap_or_default(),
        ]);
    }
    println!("{}\n", table);

    info!(chain_id = args.chain_id, range = %range, logs = logs.len(), "fetch-logs finished");
    Ok(())
}

fn handle_add_chain(ctx: &AppContext, args: AddChainArgs) -> Result<()> {
    let store = open_store(ctx)?;
    let native = NativeToken {
        chain_id: args.chain_id,
        token_id: args
            .native_token_id
            .unwrap_or_else(|| format!("native-{}", args.chain_id)),
        contract_address: args.native_address,
        symbol: args.native_symbol,
    };
    store
        .upsert_chain(args.chain_id, &args.name, &native)
        .wrap_err("failed to store chain")?;
    info!(chain_id = args.chain_id, symbol = %native.symbol, "chain registered");
    Ok(())
}

fn handle_add_user(ctx: &AppContext, args: AddUserArgs) -> Result<()> {
    let user_type = UserType::parse(&args.user_type)
        .ok_or_else(|| eyre!("unknown user type {:?}", args.user_type))?;
    let store = open_store(ctx)?;

    let mut user = store
        .get_user(&args.user_id)
        .wrap_err("failed to query user")?
        .unwrap_or_else(|| User {
            id: args.user_id.clone(),
            user_type,
            default_chain_id: args.chain_id,
            wallets: Default::default(),
            settings: Default::default(),
        });
    user.user_type = user_type;
    user.wallets.insert(args.chain_id, args.wallet);

    let mut settings = user.settings_for(args.chain_id);
    if let Some(bps) = args.slippage_bps {
        settings.max_slippage_bps = bps;
    }
    if let Some(amount) = args.default_buy_wei {
        settings.default_buy_amount_wei = amount;
    }
    if args.confirm_threshold_wei.is_some() {
        settings.confirmation_gas_threshold_wei = args.confirm_threshold_wei;
    }
    user.settings.insert(args.chain_id, settings);

    store.upsert_user(&user).wrap_err("failed to store user")?;
    info!(user_id = %user.id, chain_id = args.chain_id, wallet = %args.wallet, "user saved");
    Ok(())
}

async fn handle_create_pair(ctx: &AppContext, args: CreatePairArgs) -> Result<()> {
    let store = open_store(ctx)?;
    let chains = connect_chains(ctx, Some(args.chain_id)).await?;
    let pairs = PairService::new(store.clone(), chains, NativeTokenCache::new(store));

    let pair = pairs
        .create_pair_from_address(args.chain_id, &args.pair_type, args.address)
        .await
        .wrap_err("failed to create pair")?;
    print_pair(&pair);
    Ok(())
}

async fn handle_sync_pair(ctx: &AppContext, args: PairIdArgs) -> Result<()> {
    let store = open_store(ctx)?;
    let pair = store
        .get_pair(&args.pair_id)
        .wrap_err("failed to query pair")?
        .ok_or_else(|| eyre!("pair {} not found", args.pair_id))?;
    let chains = connect_chains(ctx, Some(pair.chain_id)).await?;
    let pairs = PairService::new(store.clone(), chains, NativeTokenCache::new(store));

    let pair = pairs.sync_pair(pair).await.wrap_err("failed to sync pair")?;
    print_pair(&pair);
    Ok(())
}

fn handle_preview(ctx: &AppContext, args: PreviewArgs, buy: bool) -> Result<()> {
    let trade = offline_trade_service(ctx)?;
    let (pair, amount) = if buy {
        trade.preview_buy(&args.pair_id, args.amount_in, args.amount_out)
    } else {
        trade.preview_sell(&args.pair_id, args.amount_in, args.amount_out)
    }
    .wrap_err("preview failed")?;

    let (known, derived) = match (args.amount_in, buy) {
        (Some(_), true) => ("native in", "token out"),
        (Some(_), false) => ("token in", "native out"),
        (None, true) => ("token out", "native in"),
        (None, false) => ("native out", "token in"),
    };
    let given = args.amount_in.or(args.amount_out).unwrap_or_default();

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Pair", known, derived]);
    table.add_row(vec![pair.id, given.to_string(), amount.to_string()]);
    println!("{}\n", table);
    Ok(())
}

/// Trade service for commands that never reach a chain or the signer.
fn offline_trade_service(ctx: &AppContext) -> Result<TradeService> {
    let store = open_store(ctx)?;
    let signer = Arc::new(
        HttpCustodySigner::new(&ctx.config.signer).wrap_err("failed to build signer client")?,
    );
    let confirmer = Confirmer::new(
        store.clone(),
        ChainClients::new(),
        signer.clone(),
        ctx.config.receipts,
    );
    let (_worker, queue) = ConfirmationWorker::new(confirmer, CancellationToken::new());
    Ok(TradeService::new(
        store,
        ChainClients::new(),
        signer,
        queue,
        ctx.config.trade_config()?,
    ))
}

async fn handle_compose_approve(ctx: &AppContext, args: ComposeArgs) -> Result<()> {
    let store = open_store(ctx)?;
    let chain_id = pair_chain(&store, &args.pair_id)?;
    let runtime = Runtime::start(ctx, Some(chain_id)).await?;

    let payload = runtime
        .trade
        .compose_approve(&args.user_id, &args.pair_id, args.amount)
        .await
        .wrap_err("failed to compose approval")?;
    match payload {
        Some(payload) => print_json(&payload)?,
        None => println!("allowance already covers {}", args.amount.unwrap_or_default()),
    }
    runtime.finish().await
}

fn handle_compose(ctx: &AppContext, args: ComposeArgs, buy: bool) -> Result<()> {
    let trade = offline_trade_service(ctx)?;
    let payload = if buy {
        trade.compose_buy(&args.user_id, &args.pair_id, args.amount, args.min_out)
    } else {
        trade.compose_sell(&args.user_id, &args.pair_id, args.amount, args.min_out)
    }
    .wrap_err("failed to compose payload")?;
    print_json(&payload)
}

async fn handle_buy(ctx: &AppContext, args: BuyArgs) -> Result<()> {
    let caller = caller(ctx, &args.trade.caller)?;
    let chain_id = pair_chain(&*open_store(ctx)?, &args.trade.pair_id)?;
    let runtime = Runtime::start(ctx, Some(chain_id)).await?;

    let gas = GasOverrides {
        gas_price: args.gas_price,
        gas_limit: args.gas_limit,
    };
    let preflight = runtime
        .trade
        .preflight_buy(&caller.user_id, &args.trade.pair_id, args.trade.amount)
        .await
        .wrap_err("buy preflight failed")?;
    if preflight.needs_confirmation && gas.gas_price.is_none() {
        tracing::warn!(
            gas_price = preflight.transaction.gas_price,
            gas_limit = preflight.transaction.gas_limit,
            "gas cost reaches the confirmation threshold"
        );
    }

    let returned_id = runtime
        .trade
        .buy(
            &caller,
            &args.trade.pair_id,
            args.trade.amount,
            args.trade.min_out,
            gas,
        )
        .await
        .wrap_err("buy failed")?;
    println!("submitted buy: {returned_id}");
    runtime.finish().await
}

async fn handle_sell(ctx: &AppContext, args: TradeArgs) -> Result<()> {
    let caller = caller(ctx, &args.caller)?;
    let chain_id = pair_chain(&*open_store(ctx)?, &args.pair_id)?;
    let runtime = Runtime::start(ctx, Some(chain_id)).await?;

    let outcome = runtime
        .trade
        .sell(&caller, &args.pair_id, args.amount, args.min_out)
        .await
        .wrap_err("sell failed")?;
    match outcome {
        SellOutcome::Submitted(returned_id) => println!("submitted sell: {returned_id}"),
        SellOutcome::ApprovalScheduled => println!("approval scheduled; sell follows once it confirms"),
    }
    runtime.finish().await
}

async fn handle_approve(ctx: &AppContext, args: TradeArgs) -> Result<()> {
    let caller = caller(ctx, &args.caller)?;
    let chain_id = pair_chain(&*open_store(ctx)?, &args.pair_id)?;
    let runtime = Runtime::start(ctx, Some(chain_id)).await?;

    let pb = spinner("waiting for approval receipt")?;
    let result = runtime
        .trade
        .approve_sync(&caller, &args.pair_id, args.amount)
        .await;
    pb.finish_and_clear();

    runtime.finish().await?;
    let hash = result.map_err(|error| eyre!("{} ({})", error, error.code()))?;
    println!("approved: {hash}");
    Ok(())
}

async fn handle_withdraw(ctx: &AppContext, args: WithdrawArgs) -> Result<()> {
    let caller = caller(ctx, &args.caller)?;
    let runtime = Runtime::start(ctx, Some(args.chain_id)).await?;

    let returned_id = runtime
        .trade
        .withdraw(&caller, args.chain_id, args.to, args.amount)
        .await
        .wrap_err("withdraw failed")?;
    println!("submitted withdrawal: {returned_id}");
    runtime.finish().await
}

async fn handle_refresh_balances(ctx: &AppContext, args: UserIdArgs) -> Result<()> {
    let store = open_store(ctx)?;
    let user = store
        .get_user(&args.user_id)
        .wrap_err("failed to query user")?
        .ok_or_else(|| eyre!("user {} not found", args.user_id))?;
    let chains = connect_chains(ctx, Some(user.default_chain_id)).await?;

    let balances = BalanceRefresher::new(store, chains)
        .refresh(&user)
        .await
        .wrap_err("failed to refresh balances")?;

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Chain", "Pair", "Token", "Balance (wei)"]);
    for balance in &balances {
        table.add_row(vec![
            balance.chain_id.to_string(),
            balance.pair_id.clone(),
            balance.token_address.to_string(),
            balance.balance_wei.to_string(),
        ]);
    }
    println!("{}\n", table);
    Ok(())
}

fn handle_requests(ctx: &AppContext, args: RequestsArgs) -> Result<()> {
    let store = open_store(ctx)?;
    let logs: Vec<RequestLog> = store
        .list_request_logs(args.user_id.as_deref(), args.limit)
        .wrap_err("failed to query request logs")?;

    if args.output == "json" {
        return print_json(&logs);
    }

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec![
        "Created", "Returned ID", "User", "Kind", "Amount", "Status", "Tx Hash / Reason",
    ]);
    for log in &logs {
        table.add_row(vec![
            format_timestamp(log.created_at),
            log.returned_id.clone(),
            log.user_id.clone(),
            log.business_type.as_str().to_string(),
            log.amount.clone(),
            log.status.as_str().to_string(),
            log.tx_hash
                .clone()
                .or_else(|| log.failure_reason.clone())
                .unwrap_or_default(),
        ]);
    }
    println!("{}\n", table);
    Ok(())
}

async fn handle_resume_pending(ctx: &AppContext) -> Result<()> {
    let token = ctx
        .config
        .service_token
        .clone()
        .ok_or_else(|| eyre!("service_token or DEX_SIGNER_TOKEN is required to resume"))?;
    let runtime = Runtime::start(ctx, None).await?;

    let queued = recover_pending(&runtime.store, runtime.trade.queue(), &token)?;
    info!(queued, chains = runtime.chains.chain_ids().count(), "resuming pending requests");
    runtime.finish().await
}
