//! Shared fixtures for the end-to-end trading tests.
//!
//! A world is one chain (56) with a registered wrapped native token, one
//! custody user bound to [`WALLET`] and a router at [`ROUTER`].

#![allow(dead_code)]

use alloy::primitives::{Address, U256};
use dex_data::types::{NativeToken, User, UserType};
use dex_data::{ChainClients, DexPair, Store};
use dex_trade::test_support::{RecordingSigner, ScriptedChain};
use dex_trade::{
    Caller, ConfirmationWorker, Confirmer, DeadlineUnit, NativeTokenCache, PairService,
    ReceiptPolicy, RouterConfig, TradeConfig, TradeService,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const CHAIN: u64 = 56;
pub const PAIR: Address = Address::repeat_byte(0x22);
pub const TOKEN: Address = Address::repeat_byte(0x11);
pub const WBNB: Address = Address::repeat_byte(0x33);
pub const ROUTER: Address = Address::repeat_byte(0x55);
pub const WALLET: Address = Address::repeat_byte(0xaa);
pub const USER: &str = "alice";

/// Creates an in-memory store with chain 56 and its native token registered.
pub fn test_store() -> Arc<Store> {
    let store = Store::new(":memory:").expect("in-memory store should always open");
    store
        .upsert_chain(
            CHAIN,
            "bsc",
            &NativeToken {
                chain_id: CHAIN,
                token_id: "wbnb".to_string(),
                contract_address: WBNB,
                symbol: "WBNB".to_string(),
            },
        )
        .expect("chain");
    store
        .upsert_user(&User {
            id: USER.to_string(),
            user_type: UserType::Custody,
            default_chain_id: CHAIN,
            wallets: BTreeMap::from([(CHAIN, WALLET)]),
            settings: BTreeMap::new(),
        })
        .expect("user");
    Arc::new(store)
}

/// Chain scripted with a WBNB/token pair holding 1e18 of each side.
pub fn pair_chain() -> ScriptedChain {
    let reserve = U256::from(1_000_000_000_000_000_000u64);
    ScriptedChain::new()
        .with_pair(PAIR, WBNB, TOKEN, reserve, reserve)
        .with_total_supply(PAIR, U256::from(1_000u64))
        .with_total_supply(TOKEN, U256::from(1_000_000_000u64))
        .with_owner(TOKEN, Address::repeat_byte(0x77))
        .with_metadata(TOKEN, "Test Token", "TST", 18)
}

pub fn caller(auth_token: &str) -> Caller {
    Caller {
        user_id: USER.to_string(),
        auth_token: auth_token.to_string(),
        client_ip: "127.0.0.1".to_string(),
    }
}

pub fn trade_config() -> TradeConfig {
    TradeConfig::default().with_router(
        CHAIN,
        RouterConfig {
            address: ROUTER,
            deadline_unit: DeadlineUnit::Seconds,
        },
    )
}

/// Discovers the pair at [`PAIR`] and stores it.
pub async fn create_pair(store: &Arc<Store>, chains: &ChainClients) -> DexPair {
    PairService::new(store.clone(), chains.clone(), NativeTokenCache::new(store.clone()))
        .create_pair_from_address(CHAIN, "pancakeswap_v2", PAIR)
        .await
        .expect("pair created")
}

/// Trade service plus its confirmation worker.
pub struct World {
    pub service: TradeService,
    pub worker: ConfirmationWorker,
    pub cancel: CancellationToken,
}

pub fn world(store: &Arc<Store>, chains: &ChainClients, signer: Arc<RecordingSigner>) -> World {
    let cancel = CancellationToken::new();
    let confirmer = Confirmer::new(store.clone(), chains.clone(), signer.clone(), ReceiptPolicy::default());
    let (worker, queue) = ConfirmationWorker::new(confirmer, cancel.clone());
    World {
        service: TradeService::new(store.clone(), chains.clone(), signer, queue, trade_config()),
        worker,
        cancel,
    }
}

/// Drops the service's queue and waits for the worker to drain.
pub async fn drain(service: TradeService, worker: JoinHandle<()>) {
    service.tasks().close();
    service.tasks().wait().await;
    drop(service);
    worker.await.expect("worker exits");
}
