//! Custody-mediated trading flows and wallet payload composition.
//!
//! Every custody flow walks `compose -> estimate -> nonce -> gas price ->
//! submit`, records a request log and hands confirmation to the
//! [`ConfirmationQueue`]. Only [`TradeService::approve_sync`] waits for the
//! receipt itself.

use alloy::primitives::{Address, Bytes, B256, U256};
use dex_data::types::{
    DexPair, PendingTransaction, RequestLog, RequestStatus, SignerTransaction, TxKind, User, UserType,
};
use dex_data::{ChainClients, ChainReader, ChainReaderExt, Store};
use serde_json::json;
use std::sync::Arc;
use tokio_util::task::TaskTracker;

use crate::amount::{Direction, SwapRequest};
use crate::calldata::{self, CalldataComposer, WalletSignPayload};
use crate::config::{RouterConfig, TradeConfig};
use crate::confirm::{self, ConfirmationJob, ConfirmationQueue, ReceiptOutcome};
use crate::error::{TradeError, TradeResult};
use crate::nonce::NonceSequencer;
use crate::signer::{CustodySigner, SignerError};

/// Identity of the party driving a custody flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    /// Bearer token forwarded to the signer.
    pub auth_token: String,
    pub client_ip: String,
}

/// Caller-suggested gas settings for a buy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GasOverrides {
    pub gas_price: Option<u128>,
    pub gas_limit: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SellOutcome {
    /// Allowance was sufficient; the sell went to the signer.
    Submitted(String),
    /// An approval runs first; the sell follows once it confirms.
    ApprovalScheduled,
}

/// Buy transaction built without submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Preflight {
    /// Gas cost reaches the user's confirmation threshold.
    pub needs_confirmation: bool,
    pub transaction: PendingTransaction,
}

/// Validated inputs of a pair-scoped flow.
#[derive(Clone)]
struct PairContext {
    user: User,
    pair: DexPair,
    wallet: Address,
    router: RouterConfig,
    chain: Arc<dyn ChainReader>,
}

struct Draft {
    request_id: String,
    from: Address,
    to: Address,
    chain_id: u64,
    data: Bytes,
    value: U256,
    kind: TxKind,
}

fn require_amount(amount: Option<U256>) -> TradeResult<U256> {
    match amount {
        Some(amount) if !amount.is_zero() => Ok(amount),
        _ => Err(TradeError::InvalidAmount),
    }
}

fn require_custody(user: &User) -> TradeResult<()> {
    match user.user_type {
        UserType::Custody => Ok(()),
        UserType::External => Err(TradeError::InvalidWalletType(user.id.clone())),
    }
}

fn bound_wallet(user: &User, chain_id: u64) -> TradeResult<Address> {
    user.wallet_address(chain_id)
        .ok_or_else(|| TradeError::NoBoundWallet {
            user_id: user.id.clone(),
            chain_id,
        })
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Clone)]
pub struct TradeService {
    store: Arc<Store>,
    chains: ChainClients,
    signer: Arc<dyn CustodySigner>,
    queue: ConfirmationQueue,
    config: Arc<TradeConfig>,
    nonces: NonceSequencer,
    composer: CalldataComposer,
    tasks: TaskTracker,
}

impl TradeService {
    pub fn new(
        store: Arc<Store>,
        chains: ChainClients,
        signer: Arc<dyn CustodySigner>,
        queue: ConfirmationQueue,
        config: TradeConfig,
    ) -> Self {
        Self {
            nonces: NonceSequencer::new(store.clone()),
            composer: CalldataComposer::new(config.deadline_ttl()),
            config: Arc::new(config),
            store,
            chains,
            signer,
            queue,
            tasks: TaskTracker::new(),
        }
    }

    /// Background approve-then-sell chains spawned by [`sell`](Self::sell).
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    pub fn queue(&self) -> &ConfirmationQueue {
        &self.queue
    }

    fn load_user(&self, user_id: &str) -> TradeResult<User> {
        self.store
            .get_user(user_id)?
            .ok_or_else(|| TradeError::not_found("user", user_id))
    }

    fn load_pair(&self, pair_id: &str) -> TradeResult<DexPair> {
        self.store
            .get_pair(pair_id)?
            .ok_or_else(|| TradeError::not_found("pair", pair_id))
    }

    fn chain(&self, chain_id: u64) -> TradeResult<Arc<dyn ChainReader>> {
        self.chains
            .get(chain_id)
            .ok_or(TradeError::UnsupportedChain(chain_id))
    }

    /// Store-only validation; no chain or signer call happens before it passes.
    fn pair_context(&self, user_id: &str, pair_id: &str, custody: bool) -> TradeResult<PairContext> {
        let pair = self.load_pair(pair_id)?;
        let user = self.load_user(user_id)?;
        if custody {
            require_custody(&user)?;
        }
        let wallet = bound_wallet(&user, pair.chain_id)?;
        let router = self.config.router(pair.chain_id)?.clone();
        let chain = self.chain(pair.chain_id)?;
        Ok(PairContext {
            user,
            pair,
            wallet,
            router,
            chain,
        })
    }

    /// Estimates gas, picks the nonce and prices the transaction.
    async fn assemble(
        &self,
        chain: &dyn ChainReader,
        user_id: &str,
        draft: Draft,
        gas: GasOverrides,
    ) -> TradeResult<PendingTransaction> {
        let estimate = chain
            .estimate_gas(draft.from, draft.to, draft.data.clone(), draft.value)
            .await?;
        let nonce = self
            .nonces
            .next_nonce(chain, draft.chain_id, user_id, draft.from)
            .await?;
        let gas_price = match gas.gas_price {
            Some(price) => price,
            None => chain.gas_price().await?,
        };

        Ok(PendingTransaction {
            request_id: draft.request_id,
            from: draft.from,
            to: draft.to,
            chain_id: draft.chain_id,
            data: draft.data,
            nonce,
            gas_price,
            gas_limit: gas.gas_limit.unwrap_or(estimate),
            value: draft.value,
            kind: draft.kind,
        })
    }

    /// Hands `tx` to the signer, reserves the next nonce and records the
    /// request log. A log that cannot be written does not fail the call.
    async fn submit(
        &self,
        caller: &Caller,
        tx: &PendingTransaction,
        amount: U256,
        token_id: Option<String>,
    ) -> TradeResult<String> {
        let wire = SignerTransaction::from(tx);
        let returned_id = self
            .signer
            .submit(&tx.request_id, &caller.auth_token, &wire)
            .await?;
        self.nonces
            .record_submission(tx.chain_id, &caller.user_id, tx.nonce);

        let log = RequestLog::new(
            &tx.request_id,
            &returned_id,
            &caller.user_id,
            tx.kind,
            amount,
            &caller.client_ip,
            token_id,
            wire,
        );
        if let Err(error) = self.store.create_request_log(&log) {
            tracing::warn!(returned_id = %returned_id, error = %error, "failed to create request log");
        }

        tracing::info!(
            returned_id = %returned_id,
            kind = tx.kind.as_str(),
            nonce = tx.nonce,
            chain_id = tx.chain_id,
            "transaction submitted"
        );
        Ok(returned_id)
    }

    fn enqueue(&self, caller: &Caller, chain_id: u64, returned_id: &str) {
        self.queue.enqueue(ConfirmationJob {
            returned_id: returned_id.to_string(),
            chain_id,
            auth_token: caller.auth_token.clone(),
        });
    }

    async fn buy_transaction(
        &self,
        ctx: &PairContext,
        amount_in: Option<U256>,
        min_out: Option<U256>,
        gas: GasOverrides,
    ) -> TradeResult<(PendingTransaction, U256)> {
        let settings = ctx.user.settings_for(ctx.pair.chain_id);
        let amount = amount_in.unwrap_or(settings.default_buy_amount_wei);
        let request_id = new_request_id();
        let min_out = calldata::resolve_min_out(&ctx.pair, Direction::Buy, amount, min_out, &settings);
        let data = self.composer.buy(
            &request_id,
            min_out,
            ctx.pair.token.contract_address,
            ctx.wallet,
            self.composer.deadline(ctx.router.deadline_unit),
        );
        let draft = Draft {
            request_id,
            from: ctx.wallet,
            to: ctx.router.address,
            chain_id: ctx.pair.chain_id,
            data,
            value: amount,
            kind: TxKind::Buy,
        };
        let tx = self.assemble(ctx.chain.as_ref(), &ctx.user.id, draft, gas).await?;
        Ok((tx, amount))
    }

    /// Buys the pair's token with native currency; returns the signer's
    /// tracking id. Without `amount_in` the user's default buy amount is
    /// spent. Confirmation continues in the background.
    ///
    /// # Errors
    /// Validation errors before any I/O; chain and signer failures up to
    /// submission.
    #[tracing::instrument(skip(self, caller), fields(user_id = %caller.user_id))]
    pub async fn buy(
        &self,
        caller: &Caller,
        pair_id: &str,
        amount_in: Option<U256>,
        min_out: Option<U256>,
        gas: GasOverrides,
    ) -> TradeResult<String> {
        if amount_in.is_some_and(|amount| amount.is_zero()) {
            return Err(TradeError::InvalidAmount);
        }
        let ctx = self.pair_context(&caller.user_id, pair_id, true)?;
        let (tx, amount) = self.buy_transaction(&ctx, amount_in, min_out, gas).await?;
        let returned_id = self
            .submit(caller, &tx, amount, Some(ctx.pair.token.id.clone()))
            .await?;
        self.enqueue(caller, ctx.pair.chain_id, &returned_id);
        Ok(returned_id)
    }

    /// Builds the buy a custody user would submit and checks its gas cost
    /// against the user's confirmation threshold.
    ///
    /// # Errors
    /// Same as [`buy`](Self::buy), minus signer failures.
    #[tracing::instrument(skip(self))]
    pub async fn preflight_buy(
        &self,
        user_id: &str,
        pair_id: &str,
        amount_in: Option<U256>,
    ) -> TradeResult<Preflight> {
        let ctx = self.pair_context(user_id, pair_id, false)?;
        let (transaction, _) = self
            .buy_transaction(&ctx, amount_in, None, GasOverrides::default())
            .await?;

        let cost = U256::from(transaction.gas_price) * U256::from(transaction.gas_limit);
        let needs_confirmation = ctx
            .user
            .settings_for(ctx.pair.chain_id)
            .confirmation_gas_threshold_wei
            .is_some_and(|threshold| threshold <= cost);

        Ok(Preflight {
            needs_confirmation,
            transaction,
        })
    }

    async fn submit_sell(
        &self,
        caller: &Caller,
        ctx: &PairContext,
        amount: U256,
        min_out: Option<U256>,
    ) -> TradeResult<String> {
        let settings = ctx.user.settings_for(ctx.pair.chain_id);
        let request_id = new_request_id();
        let min_out = calldata::resolve_min_out(&ctx.pair, Direction::Sell, amount, min_out, &settings);
        let data = self.composer.sell(
            &request_id,
            amount,
            min_out,
            ctx.pair.token.contract_address,
            ctx.wallet,
            self.composer.deadline(ctx.router.deadline_unit),
        );
        let draft = Draft {
            request_id,
            from: ctx.wallet,
            to: ctx.router.address,
            chain_id: ctx.pair.chain_id,
            data,
            value: U256::ZERO,
            kind: TxKind::Sell,
        };
        let tx = self
            .assemble(ctx.chain.as_ref(), &ctx.user.id, draft, GasOverrides::default())
            .await?;
        let returned_id = self
            .submit(caller, &tx, amount, Some(ctx.pair.token.id.clone()))
            .await?;
        self.enqueue(caller, ctx.pair.chain_id, &returned_id);
        Ok(returned_id)
    }

    /// Sells `amount_in` of the pair's token.
    ///
    /// With enough router allowance the sell is submitted right away.
    /// Otherwise an approval is dry-run here, then approved and sold on a
    /// background task; failures there are only logged.
    ///
    /// # Errors
    /// Validation errors, the allowance read, the approval dry run, or the
    /// immediate sell submission.
    #[tracing::instrument(skip(self, caller), fields(user_id = %caller.user_id))]
    pub async fn sell(
        &self,
        caller: &Caller,
        pair_id: &str,
        amount_in: Option<U256>,
        min_out: Option<U256>,
    ) -> TradeResult<SellOutcome> {
        let amount = require_amount(amount_in)?;
        let ctx = self.pair_context(&caller.user_id, pair_id, true)?;
        let token = ctx.pair.token.contract_address;

        let allowance = ctx.chain.allowance(token, ctx.wallet, ctx.router.address).await?;
        if allowance >= amount {
            let returned_id = self.submit_sell(caller, &ctx, amount, min_out).await?;
            return Ok(SellOutcome::Submitted(returned_id));
        }

        // Dry run only: proves the approval can execute before returning.
        let approve = self.composer.approve(ctx.router.address, Some(amount));
        ctx.chain
            .estimate_gas(ctx.wallet, token, approve, U256::ZERO)
            .await?;

        tracing::info!(%allowance, %amount, "allowance too low, scheduling approval");
        let service = self.clone();
        let caller = caller.clone();
        let pair_id = pair_id.to_string();
        self.tasks.spawn(async move {
            if let Err(error) = service.approve_sync(&caller, &pair_id, Some(amount)).await {
                tracing::warn!(pair_id = %pair_id, user_id = %caller.user_id, code = error.code(), error = %error, "failed to approve pair");
                return;
            }
            if let Err(error) = service.submit_sell(&caller, &ctx, amount, min_out).await {
                tracing::warn!(pair_id = %pair_id, user_id = %caller.user_id, code = error.code(), error = %error, "failed to sell pair");
            }
        });

        Ok(SellOutcome::ApprovalScheduled)
    }

    /// Approves exactly `amount` of the pair's token to the router and waits
    /// for the receipt.
    ///
    /// # Errors
    /// [`TradeError::TransactionReverted`] when the receipt reports a revert
    /// or never shows up; validation, chain and signer errors otherwise.
    #[tracing::instrument(skip(self, caller), fields(user_id = %caller.user_id))]
    pub async fn approve_sync(
        &self,
        caller: &Caller,
        pair_id: &str,
        amount: Option<U256>,
    ) -> TradeResult<B256> {
        let amount = require_amount(amount)?;
        let ctx = self.pair_context(&caller.user_id, pair_id, true)?;

        let draft = Draft {
            request_id: new_request_id(),
            from: ctx.wallet,
            to: ctx.pair.token.contract_address,
            chain_id: ctx.pair.chain_id,
            data: self.composer.approve(ctx.router.address, Some(amount)),
            value: U256::ZERO,
            kind: TxKind::Approve,
        };
        let tx = self
            .assemble(ctx.chain.as_ref(), &ctx.user.id, draft, GasOverrides::default())
            .await?;
        let returned_id = self
            .submit(caller, &tx, amount, Some(ctx.pair.token.id.clone()))
            .await?;

        let tx_hash = match self
            .signer
            .poll_by_request_id(&returned_id, &caller.auth_token)
            .await
        {
            Ok(hash) => hash,
            Err(SignerError::Failed { tracking_id, reason }) => {
                if let Err(error) = self.store.update_request_log_by_returned_id(
                    &returned_id,
                    RequestStatus::Failed,
                    None,
                    Some(&reason),
                ) {
                    tracing::error!(returned_id = %returned_id, error = %error, "failed to update request log");
                }
                return Err(SignerError::Failed { tracking_id, reason }.into());
            }
            Err(error) => return Err(error.into()),
        };

        let outcome = confirm::poll_receipt(ctx.chain.as_ref(), tx_hash, self.config.receipts).await?;
        confirm::record_outcome(&self.store, &returned_id, outcome);
        match outcome {
            ReceiptOutcome::Confirmed(hash) => Ok(hash),
            failed => Err(TradeError::TransactionReverted(
                failed.failure_reason().unwrap_or_default().to_string(),
            )),
        }
    }

    /// Sends `amount` of native currency from the user's wallet to `to`.
    ///
    /// # Errors
    /// Validation errors before any I/O; chain and signer failures up to
    /// submission.
    #[tracing::instrument(skip(self, caller), fields(user_id = %caller.user_id))]
    pub async fn withdraw(
        &self,
        caller: &Caller,
        chain_id: u64,
        to: Address,
        amount: Option<U256>,
    ) -> TradeResult<String> {
        let amount = require_amount(amount)?;
        let user = self.load_user(&caller.user_id)?;
        require_custody(&user)?;
        let wallet = bound_wallet(&user, chain_id)?;
        let chain = self.chain(chain_id)?;

        let draft = Draft {
            request_id: new_request_id(),
            from: wallet,
            to,
            chain_id,
            data: Bytes::new(),
            value: amount,
            kind: TxKind::Withdraw,
        };
        let tx = self
            .assemble(chain.as_ref(), &user.id, draft, GasOverrides::default())
            .await?;
        let returned_id = self.submit(caller, &tx, amount, None).await?;
        self.enqueue(caller, chain_id, &returned_id);
        Ok(returned_id)
    }

    /// Unlimited approval payload, or `None` when the current allowance
    /// already covers `amount`.
    ///
    /// # Errors
    /// Validation errors or a failed allowance read.
    #[tracing::instrument(skip(self))]
    pub async fn compose_approve(
        &self,
        user_id: &str,
        pair_id: &str,
        amount: Option<U256>,
    ) -> TradeResult<Option<WalletSignPayload>> {
        let amount = require_amount(amount)?;
        let ctx = self.pair_context(user_id, pair_id, false)?;
        let token = ctx.pair.token.contract_address;

        let allowance = ctx.chain.allowance(token, ctx.wallet, ctx.router.address).await?;
        if allowance >= amount {
            return Ok(None);
        }

        Ok(Some(WalletSignPayload {
            to_address: token,
            chain_id: ctx.pair.chain_id,
            method: calldata::APPROVE_METHOD.to_string(),
            value_in_wei: "0".to_string(),
            call_data: json!({
                "spender": ctx.router.address.to_string(),
                "amount": format!("{:#x}", U256::MAX),
            }),
            data: self.composer.approve(ctx.router.address, None),
        }))
    }

    /// Buy payload for a client-side wallet.
    ///
    /// # Errors
    /// Validation errors only.
    #[tracing::instrument(skip(self))]
    pub fn compose_buy(
        &self,
        user_id: &str,
        pair_id: &str,
        amount_in: Option<U256>,
        min_out: Option<U256>,
    ) -> TradeResult<WalletSignPayload> {
        if amount_in.is_some_and(|amount| amount.is_zero()) {
            return Err(TradeError::InvalidAmount);
        }
        let ctx = self.pair_context(user_id, pair_id, false)?;
        let settings = ctx.user.settings_for(ctx.pair.chain_id);
        let amount = amount_in.unwrap_or(settings.default_buy_amount_wei);
        let min_out = calldata::resolve_min_out(&ctx.pair, Direction::Buy, amount, min_out, &settings);
        let request_id = new_request_id();
        let token = ctx.pair.token.contract_address;
        let deadline = self.composer.deadline(ctx.router.deadline_unit);

        Ok(WalletSignPayload {
            to_address: ctx.router.address,
            chain_id: ctx.pair.chain_id,
            method: calldata::BUY_METHOD.to_string(),
            value_in_wei: amount.to_string(),
            call_data: json!({
                "requestId": request_id,
                "amountOutMin": min_out.to_string(),
                "tokenAddress": token.to_string(),
                "to": ctx.wallet.to_string(),
                "deadline": deadline.to_string(),
            }),
            data: self.composer.buy(&request_id, min_out, token, ctx.wallet, deadline),
        })
    }

    /// Sell payload for a client-side wallet.
    ///
    /// # Errors
    /// Validation errors only.
    #[tracing::instrument(skip(self))]
    pub fn compose_sell(
        &self,
        user_id: &str,
        pair_id: &str,
        amount_in: Option<U256>,
        min_out: Option<U256>,
    ) -> TradeResult<WalletSignPayload> {
        let amount = require_amount(amount_in)?;
        let ctx = self.pair_context(user_id, pair_id, false)?;
        let settings = ctx.user.settings_for(ctx.pair.chain_id);
        let min_out = calldata::resolve_min_out(&ctx.pair, Direction::Sell, amount, min_out, &settings);
        let request_id = new_request_id();
        let token = ctx.pair.token.contract_address;
        let deadline = self.composer.deadline(ctx.router.deadline_unit);

        Ok(WalletSignPayload {
            to_address: ctx.router.address,
            chain_id: ctx.pair.chain_id,
            method: calldata::SELL_METHOD.to_string(),
            value_in_wei: "0".to_string(),
            call_data: json!({
                "requestId": request_id,
                "amountIn": amount.to_string(),
                "amountOutMin": min_out.to_string(),
                "tokenAddress": token.to_string(),
                "to": ctx.wallet.to_string(),
                "deadline": deadline.to_string(),
            }),
            data: self
                .composer
                .sell(&request_id, amount, min_out, token, ctx.wallet, deadline),
        })
    }

    /// Token amount for a native input (or the native input needed for a
    /// token output) at the pair's stored reserves.
    ///
    /// # Errors
    /// `NotFound` for an unknown pair; `InvalidAmount` without amounts.
    pub fn preview_buy(
        &self,
        pair_id: &str,
        amount_in: Option<U256>,
        amount_out: Option<U256>,
    ) -> TradeResult<(DexPair, U256)> {
        self.preview(Direction::Buy, pair_id, amount_in, amount_out)
    }

    /// # Errors
    /// Same as [`preview_buy`](Self::preview_buy).
    pub fn preview_sell(
        &self,
        pair_id: &str,
        amount_in: Option<U256>,
        amount_out: Option<U256>,
    ) -> TradeResult<(DexPair, U256)> {
        self.preview(Direction::Sell, pair_id, amount_in, amount_out)
    }

    fn preview(
        &self,
        direction: Direction,
        pair_id: &str,
        amount_in: Option<U256>,
        amount_out: Option<U256>,
    ) -> TradeResult<(DexPair, U256)> {
        let pair = self.load_pair(pair_id)?;
        let amount = SwapRequest {
            direction,
            amount_in,
            amount_out,
        }
        .quote_pair(&pair)?;
        Ok((pair, amount))
    }

    /// Native balance of the user's wallet on `chain_id`; zero when none is
    /// bound.
    ///
    /// # Errors
    /// `NotFound` for an unknown user; chain failures.
    #[tracing::instrument(skip(self))]
    pub async fn native_balance(&self, chain_id: u64, user_id: &str) -> TradeResult<U256> {
        let user = self.load_user(user_id)?;
        let Some(wallet) = user.wallet_address(chain_id) else {
            return Ok(U256::ZERO);
        };
        Ok(self.chain(chain_id)?.native_balance(wallet).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::{ConfirmationWorker, Confirmer};
    use crate::config::{DeadlineUnit, ReceiptPolicy};
    use crate::test_support::{RecordingSigner, ScriptedChain};
    use dex_data::chain::ReceiptStatus;
    use dex_data::contracts::IERC20;
    use dex_data::types::{PairType, Token, UserSettings};
    use alloy::sol_types::SolCall;
    use std::collections::BTreeMap;
    use tokio_util::sync::CancellationToken;

    const CHAIN: u64 = 56;

    fn router() -> Address {
        Address::repeat_byte(0x55)
    }

    fn token() -> Address {
        Address::repeat_byte(0x11)
    }

    fn wallet() -> Address {
        Address::repeat_byte(0xaa)
    }

    fn user(id: &str, user_type: UserType, wallets: &[(u64, Address)]) -> User {
        User {
            id: id.to_string(),
            user_type,
            default_chain_id: CHAIN,
            wallets: wallets.iter().copied().collect(),
            settings: BTreeMap::new(),
        }
    }

    fn caller(user_id: &str) -> Caller {
        Caller {
            user_id: user_id.to_string(),
            auth_token: "jwt".to_string(),
            client_ip: "10.0.0.1".to_string(),
        }
    }

    struct Harness {
        service: TradeService,
        store: Arc<Store>,
        chain: Arc<ScriptedChain>,
        signer: Arc<RecordingSigner>,
        // Held so the queue stays open; never run, so it cannot race the
        // flows for scripted receipts.
        _worker: ConfirmationWorker,
    }

    fn harness(chain: ScriptedChain) -> Harness {
        let store = Arc::new(Store::new(":memory:").expect("in-memory store should always open"));
        store
            .upsert_user(&user("custody", UserType::Custody, &[(CHAIN, wallet())]))
            .expect("user");
        store
            .upsert_user(&user("external", UserType::External, &[(CHAIN, wallet())]))
            .expect("user");
        store
            .upsert_user(&user("unbound", UserType::Custody, &[]))
            .expect("user");
        store
            .upsert_pair(&DexPair {
                id: "pair-1".to_string(),
                pair_type: PairType::UniswapV2,
                chain_id: CHAIN,
                contract_address: Address::repeat_byte(0x22),
                token: Token::new("token-1", CHAIN, token()),
                native_token_address: Address::repeat_byte(0x33),
                token_is_token0: true,
                reserve0: U256::from(1_000_000_000u64),
                reserve1: U256::from(1_000_000_000u64),
                total_supply: U256::ZERO,
                burned_supply: U256::ZERO,
            })
            .expect("pair");

        let chain = Arc::new(chain);
        let signer = Arc::new(RecordingSigner::new());
        let chains = ChainClients::new().with(CHAIN, chain.clone());
        let confirmer = Confirmer::new(store.clone(), chains.clone(), signer.clone(), ReceiptPolicy::default());
        let (worker, queue) = ConfirmationWorker::new(confirmer, CancellationToken::new());
        let config = TradeConfig::default().with_router(
            CHAIN,
            RouterConfig {
                address: router(),
                deadline_unit: DeadlineUnit::Milliseconds,
            },
        );

        Harness {
            service: TradeService::new(store.clone(), chains, signer.clone(), queue, config),
            store,
            chain,
            signer,
            _worker: worker,
        }
    }

    fn receipt(status: u64) -> Option<ReceiptStatus> {
        Some(ReceiptStatus {
            transaction_hash: B256::repeat_byte(0xee),
            status,
            block_number: Some(10),
        })
    }

    #[tokio::test]
    async fn sell_with_enough_allowance_submits_immediately() {
        let h = harness(ScriptedChain::new().with_allowance(token(), U256::from(1_000u64)));

        let outcome = h
            .service
            .sell(&caller("custody"), "pair-1", Some(U256::from(500u64)), None)
            .await
            .expect("sell");

        assert_eq!(outcome, SellOutcome::Submitted("track-1".to_string()));
        let submissions = h.signer.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].transaction.to, router());
        assert_eq!(submissions[0].transaction.value, "0x0");
        assert!(h.chain.estimates().iter().all(|call| call.to == router()));

        let log = h
            .store
            .get_request_log_by_returned_id("track-1")
            .expect("query")
            .expect("log written");
        assert_eq!(log.business_type, TxKind::Sell);
        assert_eq!(log.amount, "500");
        assert_eq!(log.token_id.as_deref(), Some("token-1"));
        assert_eq!(log.status, RequestStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn sell_without_allowance_approves_before_selling() {
        let h = harness(
            ScriptedChain::new()
                .with_allowance(token(), U256::ZERO)
                .with_nonce(5)
                .with_receipt(receipt(1)),
        );

        let outcome = h
            .service
            .sell(&caller("custody"), "pair-1", Some(U256::from(500u64)), None)
            .await
            .expect("sell");
        assert_eq!(outcome, SellOutcome::ApprovalScheduled);

        // Pilot estimate targets the token with an exact approval.
        let pilot = &h.chain.estimates()[0];
        assert_eq!(pilot.to, token());
        let decoded = IERC20::approveCall::abi_decode(&pilot.data, true).expect("approve calldata");
        assert_eq!(decoded.amount, U256::from(500u64));

        h.service.tasks().close();
        h.service.tasks().wait().await;

        let submissions = h.signer.submissions();
        assert_eq!(submissions.len(), 2);
        assert_eq!(submissions[0].transaction.to, token());
        assert_eq!(submissions[0].transaction.nonce, 5);
        assert_eq!(submissions[1].transaction.to, router());
        assert_eq!(submissions[1].transaction.nonce, 6);

        let approval = h
            .store
            .get_request_log_by_returned_id("track-1")
            .expect("query")
            .expect("approval log");
        assert_eq!(approval.business_type, TxKind::Approve);
        assert_eq!(approval.status, RequestStatus::Confirmed);
    }

    #[tokio::test]
    async fn validation_fails_before_any_chain_or_signer_call() {
        let h = harness(ScriptedChain::new());
        let amount = Some(U256::from(1u64));

        let cases = [
            h.service.sell(&caller("custody"), "pair-1", None, None).await.map(|_| ()),
            h.service.sell(&caller("external"), "pair-1", amount, None).await.map(|_| ()),
            h.service.sell(&caller("unbound"), "pair-1", amount, None).await.map(|_| ()),
            h.service
                .buy(&caller("external"), "pair-1", amount, None, GasOverrides::default())
                .await
                .map(|_| ()),
            h.service
                .withdraw(&caller("unbound"), CHAIN, wallet(), amount)
                .await
                .map(|_| ()),
            h.service.approve_sync(&caller("missing"), "pair-1", amount).await.map(|_| ()),
        ];
        let codes: Vec<_> = cases
            .iter()
            .map(|result| result.as_ref().expect_err("rejected").code())
            .collect();
        assert_eq!(
            codes,
            [
                "InvalidAmountFailure",
                "InvalidWalletType",
                "NoBoundWalletFailure",
                "InvalidWalletType",
                "NoBoundWalletFailure",
                "NotFound",
            ]
        );

        assert_eq!(h.chain.call_count(), 0);
        assert!(h.chain.estimates().is_empty());
        assert!(h.signer.submissions().is_empty());
    }

    #[tokio::test]
    async fn buy_honours_gas_overrides_and_reserves_next_nonce() {
        let h = harness(ScriptedChain::new().with_nonce(3).with_gas_estimate(150_000));
        let gas = GasOverrides {
            gas_price: Some(7_000_000_000),
            gas_limit: Some(300_000),
        };

        let returned_id = h
            .service
            .buy(&caller("custody"), "pair-1", None, None, gas)
            .await
            .expect("buy");

        let submitted = &h.signer.submissions()[0];
        assert_eq!(submitted.auth_token, "jwt");
        assert_eq!(submitted.transaction.gas_price, "0x1a13b8600");
        assert_eq!(submitted.transaction.gas_limit, "0x493e0");
        assert_eq!(
            submitted.transaction.value,
            format!("0x{:x}", UserSettings::default().default_buy_amount_wei)
        );
        assert_eq!(h.store.reserved_nonce(CHAIN, "custody").expect("query"), Some(4));

        let log = h
            .store
            .get_request_log_by_returned_id(&returned_id)
            .expect("query")
            .expect("log written");
        assert_eq!(log.business_type, TxKind::Buy);
        assert_eq!(log.client_ip, "10.0.0.1");
    }

    #[tokio::test(start_paused = true)]
    async fn approve_sync_surfaces_reverted_receipt() {
        let h = harness(ScriptedChain::new().with_receipt(receipt(0)));

        let error = h
            .service
            .approve_sync(&caller("custody"), "pair-1", Some(U256::from(9u64)))
            .await
            .expect_err("reverted");

        assert!(matches!(&error, TradeError::TransactionReverted(reason) if reason == "reverted transaction"));
        let log = h
            .store
            .get_request_log_by_returned_id("track-1")
            .expect("query")
            .expect("log");
        assert_eq!(log.status, RequestStatus::Failed);
        assert_eq!(log.failure_reason.as_deref(), Some("reverted transaction"));
    }

    #[tokio::test(start_paused = true)]
    async fn approve_sync_gives_up_without_receipt() {
        let h = harness(ScriptedChain::new());

        let error = h
            .service
            .approve_sync(&caller("custody"), "pair-1", Some(U256::from(9u64)))
            .await
            .expect_err("no receipt");

        assert!(matches!(&error, TradeError::TransactionReverted(reason) if reason == "no receipt from block"));
        assert_eq!(h.chain.receipt_calls(), 5);
    }

    #[tokio::test]
    async fn withdraw_is_a_plain_native_transfer() {
        let h = harness(ScriptedChain::new());
        let to = Address::repeat_byte(0x77);

        h.service
            .withdraw(&caller("custody"), CHAIN, to, Some(U256::from(255u64)))
            .await
            .expect("withdraw");

        let submitted = &h.signer.submissions()[0].transaction;
        assert_eq!(submitted.to, to);
        assert_eq!(submitted.from, wallet());
        assert!(submitted.data.is_empty());
        assert_eq!(submitted.value, "0xff");

        let log = h
            .store
            .get_request_log_by_returned_id("track-1")
            .expect("query")
            .expect("log");
        assert_eq!(log.business_type, TxKind::Withdraw);
        assert_eq!(log.token_id, None);
    }

    #[tokio::test]
    async fn compose_approve_is_unlimited_and_skipped_when_covered() {
        let low = harness(ScriptedChain::new().with_allowance(token(), U256::from(10u64)));
        let payload = low
            .service
            .compose_approve("external", "pair-1", Some(U256::from(11u64)))
            .await
            .expect("compose")
            .expect("payload");
        assert_eq!(payload.to_address, token());
        assert_eq!(payload.method, "approve");
        let decoded = IERC20::approveCall::abi_decode(&payload.data, true).expect("approve calldata");
        assert_eq!(decoded.amount, U256::MAX);
        assert_eq!(decoded.spender, router());

        let covered = low
            .service
            .compose_approve("external", "pair-1", Some(U256::from(10u64)))
            .await
            .expect("compose");
        assert!(covered.is_none());
    }

    #[test]
    fn compose_sell_derives_min_out_from_slippage() {
        let h = harness(ScriptedChain::new());
        let payload = h
            .service
            .compose_sell("external", "pair-1", Some(U256::from(1_000u64)), None)
            .expect("compose");

        // 1000 in at 30 bps fee → 996 out; 5% slippage → 946.
        assert_eq!(payload.call_data["amountOutMin"], "946");
        assert_eq!(payload.value_in_wei, "0");
        assert_eq!(payload.to_address, router());
    }

    #[test]
    fn compose_buy_rejects_zero_amount() {
        let h = harness(ScriptedChain::new());
        let error = h
            .service
            .compose_buy("external", "pair-1", Some(U256::ZERO), None)
            .expect_err("rejected");
        assert_eq!(error.code(), "InvalidAmountFailure");
    }

    #[tokio::test]
    async fn preflight_flags_expensive_buys() {
        let h = harness(ScriptedChain::new().with_gas_price(10).with_gas_estimate(100));
        let mut user = user("custody", UserType::Custody, &[(CHAIN, wallet())]);
        user.settings.insert(
            CHAIN,
            UserSettings {
                confirmation_gas_threshold_wei: Some(U256::from(1_000u64)),
                ..UserSettings::default()
            },
        );
        h.store.upsert_user(&user).expect("user");

        let preflight = h
            .service
            .preflight_buy("custody", "pair-1", Some(U256::from(5u64)))
            .await
            .expect("preflight");
        assert!(preflight.needs_confirmation);
        assert_eq!(preflight.transaction.gas_limit, 100);
        assert!(h.signer.submissions().is_empty());
    }

    #[tokio::test]
    async fn native_balance_is_zero_without_wallet() {
        let h = harness(ScriptedChain::new().with_native_balance(wallet(), U256::from(42u64)));
        assert_eq!(
            h.service.native_balance(CHAIN, "unbound").await.expect("balance"),
            U256::ZERO
        );
        assert_eq!(
            h.service.native_balance(CHAIN, "custody").await.expect("balance"),
            U256::from(42u64)
        );
    }

    #[test]
    fn preview_rejects_missing_amounts() {
        let h = harness(ScriptedChain::new());
        let error = h.service.preview_buy("pair-1", None, None).expect_err("rejected");
        assert_eq!(error.code(), "InvalidAmountFailure");

        let (pair, out) = h
            .service
            .preview_sell("pair-1", Some(U256::from(1_000u64)), None)
            .expect("preview");
        assert_eq!(pair.id, "pair-1");
        assert_eq!(out, U256::from(996u64));
    }
}
