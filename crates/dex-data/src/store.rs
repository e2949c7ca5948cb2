//! SQLite persistence for users, pairs, balances, nonce reservations and
//! request logs.
//!
//! 256-bit quantities are stored as `0x`-prefixed hex text, addresses as
//! checksummed text. Every public method is a single statement or a single
//! SQLite transaction, which is all the atomicity the trade services rely on.

use alloy::primitives::{Address, U256};
use eyre::{eyre, Result, WrapErr};
use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use crate::types::{
    DexPair, NativeToken, PairType, RequestLog, RequestStatus, Token, TokenBalance, TxKind, User,
    UserSettings, UserType,
};

pub struct Store {
    conn: Mutex<Connection>,
}

fn hex(value: U256) -> String {
    format!("{value:#x}")
}

fn parse_u256(raw: &str) -> Result<U256> {
    U256::from_str(raw).wrap_err_with(|| format!("invalid stored quantity {raw:?}"))
}

fn parse_address(raw: &str) -> Result<Address> {
    Address::from_str(raw).wrap_err_with(|| format!("invalid stored address {raw:?}"))
}

const PAIR_COLUMNS: &str = "
    p.id, p.pair_type, p.chain_id, p.contract_address, p.native_token_address,
    p.token_is_token0, p.reserve0, p.reserve1, p.total_supply, p.burned_supply,
    t.id, t.contract_address, t.name, t.symbol, t.decimals, t.total_supply, t.is_renounced,
    t.market_cap_in_native
";

const REQUEST_LOG_COLUMNS: &str = "
    request_id, returned_id, user_id, business_type, amount, client_ip, token_id,
    tx_json, status, tx_hash, failure_reason, created_at, updated_at
";

struct RawToken {
    id: String,
    chain_id: u64,
    contract_address: String,
    name: String,
    symbol: String,
    decimals: u8,
    total_supply: String,
    is_renounced: bool,
    market_cap_in_native: String,
}

impl RawToken {
    fn into_token(self) -> Result<Token> {
        Ok(Token {
            id: self.id,
            chain_id: self.chain_id,
            contract_address: parse_address(&self.contract_address)?,
            name: self.name,
            symbol: self.symbol,
            decimals: self.decimals,
            total_supply: parse_u256(&self.total_supply)?,
            is_renounced: self.is_renounced,
            market_cap_in_native: parse_u256(&self.market_cap_in_native)?,
        })
    }
}

struct RawPair {
    id: String,
    pair_type: String,
    chain_id: u64,
    contract_address: String,
    native_token_address: String,
    token_is_token0: bool,
    reserve0: String,
    reserve1: String,
    total_supply: String,
    burned_supply: String,
    token: RawToken,
}

impl RawPair {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let chain_id = row.get(2)?;
        Ok(Self {
            id: row.get(0)?,
            pair_type: row.get(1)?,
            chain_id,
            contract_address: row.get(3)?,
            native_token_address: row.get(4)?,
            token_is_token0: row.get(5)?,
            reserve0: row.get(6)?,
            reserve1: row.get(7)?,
            total_supply: row.get(8)?,
            burned_supply: row.get(9)?,
            token: RawToken {
                id: row.get(10)?,
                chain_id,
                contract_address: row.get(11)?,
                name: row.get(12)?,
                symbol: row.get(13)?,
                decimals: row.get(14)?,
                total_supply: row.get(15)?,
                is_renounced: row.get(16)?,
                market_cap_in_native: row.get(17)?,
            },
        })
    }

    fn into_pair(self) -> Result<DexPair> {
        let pair_type = PairType::parse(&self.pair_type)
            .ok_or_else(|| eyre!("unknown stored pair type {:?}", self.pair_type))?;
        Ok(DexPair {
            id: self.id,
            pair_type,
            chain_id: self.chain_id,
            contract_address: parse_address(&self.contract_address)?,
            token: self.token.into_token()?,
            native_token_address: parse_address(&self.native_token_address)?,
            token_is_token0: self.token_is_token0,
            reserve0: parse_u256(&self.reserve0)?,
            reserve1: parse_u256(&self.reserve1)?,
            total_supply: parse_u256(&self.total_supply)?,
            burned_supply: parse_u256(&self.burned_supply)?,
        })
    }
}

struct RawRequestLog {
    request_id: String,
    returned_id: String,
    user_id: String,
    business_type: String,
    amount: String,
    client_ip: String,
    token_id: Option<String>,
    tx_json: String,
    status: String,
    tx_hash: Option<String>,
    failure_reason: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl RawRequestLog {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            request_id: row.get(0)?,
            returned_id: row.get(1)?,
            user_id: row.get(2)?,
            business_type: row.get(3)?,
            amount: row.get(4)?,
            client_ip: row.get(5)?,
            token_id: row.get(6)?,
            tx_json: row.get(7)?,
            status: row.get(8)?,
            tx_hash: row.get(9)?,
            failure_reason: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_log(self) -> Result<RequestLog> {
        Ok(RequestLog {
            business_type: TxKind::parse(&self.business_type)
                .ok_or_else(|| eyre!("unknown business type {:?}", self.business_type))?,
            status: RequestStatus::parse(&self.status)
                .ok_or_else(|| eyre!("unknown request status {:?}", self.status))?,
            transaction: serde_json::from_str(&self.tx_json)
                .wrap_err("invalid stored signer transaction")?,
            request_id: self.request_id,
            returned_id: self.returned_id,
            user_id: self.user_id,
            amount: self.amount,
            client_ip: self.client_ip,
            token_id: self.token_id,
            tx_hash: self.tx_hash,
            failure_reason: self.failure_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl Store {
    /// Creates or opens a SQLite database with WAL mode enabled.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or migrations fail.
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path).wrap_err_with(|| format!("failed to open {path}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| eyre!("store connection mutex poisoned"))
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS chains (
                chain_id INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS native_tokens (
                chain_id INTEGER PRIMARY KEY,
                token_id TEXT NOT NULL,
                contract_address TEXT NOT NULL,
                symbol TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                user_type TEXT NOT NULL,
                default_chain_id INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_wallets (
                user_id TEXT NOT NULL,
                chain_id INTEGER NOT NULL,
                address TEXT NOT NULL,
                PRIMARY KEY (user_id, chain_id)
            );

            CREATE TABLE IF NOT EXISTS user_settings (
                user_id TEXT NOT NULL,
                chain_id INTEGER NOT NULL,
                max_slippage_bps INTEGER NOT NULL,
                default_buy_amount_wei TEXT NOT NULL,
                confirmation_gas_threshold_wei TEXT,
                PRIMARY KEY (user_id, chain_id)
            );

            CREATE TABLE IF NOT EXISTS tokens (
                id TEXT PRIMARY KEY,
                chain_id INTEGER NOT NULL,
                contract_address TEXT NOT NULL,
                name TEXT NOT NULL,
                symbol TEXT NOT NULL,
                decimals INTEGER NOT NULL,
                total_supply TEXT NOT NULL,
                is_renounced INTEGER NOT NULL,
                market_cap_in_native TEXT NOT NULL DEFAULT '0x0',
                UNIQUE (chain_id, contract_address)
            );

            CREATE TABLE IF NOT EXISTS pairs (
                id TEXT PRIMARY KEY,
                pair_type TEXT NOT NULL,
                chain_id INTEGER NOT NULL,
                contract_address TEXT NOT NULL,
                token_id TEXT NOT NULL REFERENCES tokens(id),
                native_token_address TEXT NOT NULL,
                token_is_token0 INTEGER NOT NULL,
                reserve0 TEXT NOT NULL,
                reserve1 TEXT NOT NULL,
                total_supply TEXT NOT NULL,
                burned_supply TEXT NOT NULL DEFAULT '0x0',
                UNIQUE (chain_id, contract_address)
            );

            CREATE TABLE IF NOT EXISTS token_balances (
                user_id TEXT NOT NULL,
                chain_id INTEGER NOT NULL,
                pair_id TEXT NOT NULL,
                token_address TEXT NOT NULL,
                balance_wei TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, chain_id, token_address)
            );

            CREATE TABLE IF NOT EXISTS nonce_reservations (
                chain_id INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                next_nonce INTEGER NOT NULL,
                PRIMARY KEY (chain_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS request_logs (
                request_id TEXT PRIMARY KEY,
                returned_id TEXT NOT NULL UNIQUE,
                user_id TEXT NOT NULL,
                business_type TEXT NOT NULL,
                amount TEXT NOT NULL,
                client_ip TEXT NOT NULL,
                token_id TEXT,
                tx_json TEXT NOT NULL,
                status TEXT NOT NULL,
                tx_hash TEXT,
                failure_reason TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_request_logs_status ON request_logs(status);
            ",
        )?;
        Ok(())
    }

    // ---- chains -----------------------------------------------------------

    /// Registers a chain together with its wrapped native token.
    ///
    /// # Errors
    /// Returns error if the insert fails.
    pub fn upsert_chain(&self, chain_id: u64, name: &str, native: &NativeToken) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO chains (chain_id, name) VALUES (?1, ?2)
             ON CONFLICT(chain_id) DO UPDATE SET name = excluded.name",
            rusqlite::params![chain_id, name],
        )?;
        tx.execute(
            "INSERT INTO native_tokens (chain_id, token_id, contract_address, symbol)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(chain_id) DO UPDATE SET
                token_id = excluded.token_id,
                contract_address = excluded.contract_address,
                symbol = excluded.symbol",
            rusqlite::params![
                native.chain_id,
                native.token_id,
                native.contract_address.to_string(),
                native.symbol,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Wrapped native token of `chain_id`, if the chain is registered.
    ///
    /// # Errors
    /// Returns error if the query fails or the stored address is malformed.
    pub fn retrieve_native_token(&self, chain_id: u64) -> Result<Option<NativeToken>> {
        let row = self
            .conn()?
            .query_row(
                "SELECT token_id, contract_address, symbol FROM native_tokens WHERE chain_id = ?1",
                [chain_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(token_id, address, symbol)| {
            Ok(NativeToken {
                chain_id,
                token_id,
                contract_address: parse_address(&address)?,
                symbol,
            })
        })
        .transpose()
    }

    // ---- users ------------------------------------------------------------

    /// Inserts or replaces a user with all wallets and settings.
    ///
    /// # Errors
    /// Returns error if any insert fails; nothing is written in that case.
    pub fn upsert_user(&self, user: &User) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO users (id, user_type, default_chain_id) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                user_type = excluded.user_type,
                default_chain_id = excluded.default_chain_id",
            rusqlite::params![user.id, user.user_type.as_str(), user.default_chain_id],
        )?;
        tx.execute("DELETE FROM user_wallets WHERE user_id = ?1", [&user.id])?;
        tx.execute("DELETE FROM user_settings WHERE user_id = ?1", [&user.id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO user_wallets (user_id, chain_id, address) VALUES (?1, ?2, ?3)",
            )?;
            for (chain_id, address) in &user.wallets {
                stmt.execute(rusqlite::params![user.id, chain_id, address.to_string()])?;
            }

            let mut stmt = tx.prepare(
                "INSERT INTO user_settings (
                    user_id, chain_id, max_slippage_bps, default_buy_amount_wei,
                    confirmation_gas_threshold_wei
                ) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (chain_id, settings) in &user.settings {
                stmt.execute(rusqlite::params![
                    user.id,
                    chain_id,
                    settings.max_slippage_bps,
                    hex(settings.default_buy_amount_wei),
                    settings.confirmation_gas_threshold_wei.map(hex),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// # Errors
    /// Returns error if the query fails or a stored row is malformed.
    pub fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let conn = self.conn()?;
        let Some((user_type, default_chain_id)) = conn
            .query_row(
                "SELECT user_type, default_chain_id FROM users WHERE id = ?1",
                [user_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)),
            )
            .optional()?
        else {
            return Ok(None);
        };

        let user_type = UserType::parse(&user_type)
            .ok_or_else(|| eyre!("unknown stored user type {user_type:?}"))?;

        let mut wallets = BTreeMap::new();
        let mut stmt =
            conn.prepare("SELECT chain_id, address FROM user_wallets WHERE user_id = ?1")?;
        let rows = stmt
            .query_map([user_id], |row| {
                Ok((row.get::<_, u64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (chain_id, address) in rows {
            wallets.insert(chain_id, parse_address(&address)?);
        }

        let mut settings = BTreeMap::new();
        let mut stmt = conn.prepare(
            "SELECT chain_id, max_slippage_bps, default_buy_amount_wei, confirmation_gas_threshold_wei
             FROM user_settings WHERE user_id = ?1",
        )?;
        let rows = stmt
            .query_map([user_id], |row| {
                Ok((
                    row.get::<_, u64>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (chain_id, max_slippage_bps, default_buy, threshold) in rows {
            settings.insert(
                chain_id,
                UserSettings {
                    max_slippage_bps,
                    default_buy_amount_wei: parse_u256(&default_buy)?,
                    confirmation_gas_threshold_wei: threshold
                        .as_deref()
                        .map(parse_u256)
                        .transpose()?,
                },
            );
        }

        Ok(Some(User {
            id: user_id.to_string(),
            user_type,
            default_chain_id,
            wallets,
            settings,
        }))
    }

    // ---- tokens & pairs ---------------------------------------------------

    /// Inserts or updates a token keyed by id.
    ///
    /// # Errors
    /// Returns error if the insert fails.
    pub fn upsert_token(&self, token: &Token) -> Result<()> {
        Self::write_token(&*self.conn()?, token)
    }

    fn write_token(conn: &Connection, token: &Token) -> Result<()> {
        conn.execute(
            "INSERT INTO tokens (
                id, chain_id, contract_address, name, symbol, decimals, total_supply, is_renounced,
                market_cap_in_native
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                symbol = excluded.symbol,
                decimals = excluded.decimals,
                total_supply = excluded.total_supply,
                is_renounced = excluded.is_renounced,
                market_cap_in_native = excluded.market_cap_in_native",
            rusqlite::params![
                token.id,
                token.chain_id,
                token.contract_address.to_string(),
                token.name,
                token.symbol,
                token.decimals,
                hex(token.total_supply),
                token.is_renounced,
                hex(token.market_cap_in_native),
            ],
        )?;
        Ok(())
    }

    /// # Errors
    /// Returns error if the query fails or the stored row is malformed.
    pub fn get_token_by_address(&self, chain_id: u64, address: Address) -> Result<Option<Token>> {
        let raw = self
            .conn()?
            .query_row(
                "SELECT id, name, symbol, decimals, total_supply, is_renounced, market_cap_in_native
                 FROM tokens WHERE chain_id = ?1 AND contract_address = ?2",
                rusqlite::params![chain_id, address.to_string()],
                |row| {
                    Ok(RawToken {
                        id: row.get(0)?,
                        chain_id,
                        contract_address: address.to_string(),
                        name: row.get(1)?,
                        symbol: row.get(2)?,
                        decimals: row.get(3)?,
                        total_supply: row.get(4)?,
                        is_renounced: row.get(5)?,
                        market_cap_in_native: row.get(6)?,
                    })
                },
            )
            .optional()?;
        raw.map(RawToken::into_token).transpose()
    }

    /// Inserts or updates a pair and its token in one transaction.
    ///
    /// # Errors
    /// Returns error if either write fails; nothing is written in that case.
    pub fn upsert_pair(&self, pair: &DexPair) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        Self::write_token(&tx, &pair.token)?;
        tx.execute(
            "INSERT INTO pairs (
                id, pair_type, chain_id, contract_address, token_id, native_token_address,
                token_is_token0, reserve0, reserve1, total_supply, burned_supply
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                reserve0 = excluded.reserve0,
                reserve1 = excluded.reserve1,
                total_supply = excluded.total_supply,
                burned_supply = excluded.burned_supply",
            rusqlite::params![
                pair.id,
                pair.pair_type.as_str(),
                pair.chain_id,
                pair.contract_address.to_string(),
                pair.token.id,
                pair.native_token_address.to_string(),
                pair.token_is_token0,
                hex(pair.reserve0),
                hex(pair.reserve1),
                hex(pair.total_supply),
                hex(pair.burned_supply),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// # Errors
    /// Returns error if the query fails or the stored row is malformed.
    pub fn get_pair(&self, pair_id: &str) -> Result<Option<DexPair>> {
        let sql = format!(
            "SELECT {PAIR_COLUMNS} FROM pairs p JOIN tokens t ON t.id = p.token_id WHERE p.id = ?1"
        );
        let raw = self
            .conn()?
            .query_row(&sql, [pair_id], RawPair::from_row)
            .optional()?;
        raw.map(RawPair::into_pair).transpose()
    }

    /// # Errors
    /// Returns error if the query fails or the stored row is malformed.
    pub fn get_pair_by_address(&self, chain_id: u64, address: Address) -> Result<Option<DexPair>> {
        let sql = format!(
            "SELECT {PAIR_COLUMNS} FROM pairs p JOIN tokens t ON t.id = p.token_id
             WHERE p.chain_id = ?1 AND p.contract_address = ?2"
        );
        let raw = self
            .conn()?
            .query_row(
                &sql,
                rusqlite::params![chain_id, address.to_string()],
                RawPair::from_row,
            )
            .optional()?;
        raw.map(RawPair::into_pair).transpose()
    }

    /// Pair trading `token_address` on `chain_id`, if any.
    ///
    /// # Errors
    /// Returns error if the query fails or the stored row is malformed.
    pub fn get_pair_by_token(&self, chain_id: u64, token_address: Address) -> Result<Option<DexPair>> {
        let sql = format!(
            "SELECT {PAIR_COLUMNS} FROM pairs p JOIN tokens t ON t.id = p.token_id
             WHERE p.chain_id = ?1 AND t.contract_address = ?2
             ORDER BY p.id LIMIT 1"
        );
        let raw = self
            .conn()?
            .query_row(
                &sql,
                rusqlite::params![chain_id, token_address.to_string()],
                RawPair::from_row,
            )
            .optional()?;
        raw.map(RawPair::into_pair).transpose()
    }

    /// # Errors
    /// Returns error if the query fails or a stored row is malformed.
    pub fn list_pairs(&self, chain_id: u64) -> Result<Vec<DexPair>> {
        let sql = format!(
            "SELECT {PAIR_COLUMNS} FROM pairs p JOIN tokens t ON t.id = p.token_id
             WHERE p.chain_id = ?1 ORDER BY p.id"
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([chain_id], RawPair::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawPair::into_pair).collect()
    }

    // ---- balances ---------------------------------------------------------

    /// Batch upsert of token balances.
    ///
    /// # Errors
    /// Returns error if any write fails; the batch is rolled back in that case.
    pub fn update_token_balances(&self, balances: &[TokenBalance]) -> Result<usize> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO token_balances (
                    user_id, chain_id, pair_id, token_address, balance_wei, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(user_id, chain_id, token_address) DO UPDATE SET
                    pair_id = excluded.pair_id,
                    balance_wei = excluded.balance_wei,
                    updated_at = excluded.updated_at",
            )?;
            for b in balances {
                stmt.execute(rusqlite::params![
                    b.user_id,
                    b.chain_id,
                    b.pair_id,
                    b.token_address.to_string(),
                    hex(b.balance_wei),
                    now,
                ])?;
            }
        }
        let count = balances.len();
        tx.commit()?;
        Ok(count)
    }

    /// Non-zero balances of `user_id`, optionally restricted to one chain.
    ///
    /// # Errors
    /// Returns error if the query fails or a stored row is malformed.
    pub fn retrieve_positive_token_balances(
        &self,
        user_id: &str,
        chain_id: Option<u64>,
    ) -> Result<Vec<TokenBalance>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT chain_id, pair_id, token_address, balance_wei FROM token_balances
             WHERE user_id = ?1 AND balance_wei != '0x0' AND (?2 IS NULL OR chain_id = ?2)
             ORDER BY chain_id, token_address",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![user_id, chain_id], |row| {
                Ok((
                    row.get::<_, u64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(chain_id, pair_id, token_address, balance)| {
                Ok(TokenBalance {
                    user_id: user_id.to_string(),
                    chain_id,
                    pair_id,
                    token_address: parse_address(&token_address)?,
                    balance_wei: parse_u256(&balance)?,
                })
            })
            .collect()
    }

    // ---- nonce reservations -----------------------------------------------

    /// Reserved next nonce for `user_id` on `chain_id`, if one was recorded.
    ///
    /// # Errors
    /// Returns error if the query fails.
    pub fn reserved_nonce(&self, chain_id: u64, user_id: &str) -> Result<Option<u64>> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT next_nonce FROM nonce_reservations WHERE chain_id = ?1 AND user_id = ?2",
                rusqlite::params![chain_id, user_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// # Errors
    /// Returns error if the write fails.
    pub fn reserve_nonce(&self, chain_id: u64, user_id: &str, next_nonce: u64) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO nonce_reservations (chain_id, user_id, next_nonce) VALUES (?1, ?2, ?3)
             ON CONFLICT(chain_id, user_id) DO UPDATE SET next_nonce = excluded.next_nonce",
            rusqlite::params![chain_id, user_id, next_nonce],
        )?;
        Ok(())
    }

    // ---- request logs -----------------------------------------------------

    /// # Errors
    /// Returns error if the insert fails (e.g. duplicate request id).
    pub fn create_request_log(&self, log: &RequestLog) -> Result<()> {
        let tx_json = serde_json::to_string(&log.transaction)?;
        self.conn()?.execute(
            "INSERT INTO request_logs (
                request_id, returned_id, user_id, business_type, amount, client_ip, token_id,
                tx_json, status, tx_hash, failure_reason, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                log.request_id,
                log.returned_id,
                log.user_id,
                log.business_type.as_str(),
                log.amount,
                log.client_ip,
                log.token_id,
                tx_json,
                log.status.as_str(),
                log.tx_hash,
                log.failure_reason,
                log.created_at,
                log.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Moves a pending log to a terminal state.
    ///
    /// Returns `false` when no pending log carries `returned_id`; terminal
    /// logs are never rewritten.
    ///
    /// # Errors
    /// Returns error if the update fails.
    pub fn update_request_log_by_returned_id(
        &self,
        returned_id: &str,
        status: RequestStatus,
        tx_hash: Option<&str>,
        failure_reason: Option<&str>,
    ) -> Result<bool> {
        let changed = self.conn()?.execute(
            "UPDATE request_logs
             SET status = ?2, tx_hash = ?3, failure_reason = ?4, updated_at = ?5
             WHERE returned_id = ?1 AND status = 'pending'",
            rusqlite::params![
                returned_id,
                status.as_str(),
                tx_hash,
                failure_reason,
                chrono::Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(changed > 0)
    }

    /// # Errors
    /// Returns error if the query fails or the stored row is malformed.
    pub fn get_request_log_by_returned_id(&self, returned_id: &str) -> Result<Option<RequestLog>> {
        let sql = format!("SELECT {REQUEST_LOG_COLUMNS} FROM request_logs WHERE returned_id = ?1");
        let raw = self
            .conn()?
            .query_row(&sql, [returned_id], RawRequestLog::from_row)
            .optional()?;
        raw.map(RawRequestLog::into_log).transpose()
    }

    /// Most recent logs first, optionally for one user.
    ///
    /// # Errors
    /// Returns error if the query fails or a stored row is malformed.
    pub fn list_request_logs(&self, user_id: Option<&str>, limit: usize) -> Result<Vec<RequestLog>> {
        let sql = format!(
            "SELECT {REQUEST_LOG_COLUMNS} FROM request_logs
             WHERE (?1 IS NULL OR user_id = ?1)
             ORDER BY created_at DESC, request_id LIMIT ?2"
        );
        self.query_logs(&sql, rusqlite::params![user_id, limit as i64])
    }

    /// Every log still waiting for a terminal outcome, oldest first.
    ///
    /// # Errors
    /// Returns error if the query fails or a stored row is malformed.
    pub fn pending_request_logs(&self) -> Result<Vec<RequestLog>> {
        let sql = format!(
            "SELECT {REQUEST_LOG_COLUMNS} FROM request_logs
             WHERE status = 'pending' ORDER BY created_at, request_id"
        );
        self.query_logs(&sql, [])
    }

    fn query_logs(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<RequestLog>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, RawRequestLog::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawRequestLog::into_log).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignerTransaction;

    fn store() -> Store {
        Store::new(":memory:").expect("in-memory store should always open")
    }

    fn sample_pair() -> DexPair {
        let mut token = Token::new("tok-1", 56, Address::repeat_byte(0x11));
        token.symbol = "CAKE".to_string();
        token.decimals = 18;
        token.market_cap_in_native = U256::from(123_456u64);
        DexPair {
            id: "pair-1".to_string(),
            pair_type: PairType::PancakeSwapV2,
            chain_id: 56,
            contract_address: Address::repeat_byte(0x22),
            token,
            native_token_address: Address::repeat_byte(0x33),
            token_is_token0: false,
            reserve0: U256::from(10u64).pow(U256::from(20u64)),
            reserve1: U256::from(5_000u64),
            total_supply: U256::from(77u64),
            burned_supply: U256::from(7u64),
        }
    }

    fn sample_log(request_id: &str, returned_id: &str) -> RequestLog {
        RequestLog::new(
            request_id,
            returned_id,
            "user-1",
            TxKind::Buy,
            U256::from(1_000u64),
            "127.0.0.1",
            Some("tok-1".to_string()),
            SignerTransaction {
                from: Address::repeat_byte(1),
                to: Address::repeat_byte(2),
                chain_id: 56,
                data: Default::default(),
                nonce: 3,
                gas_price: "0x1".to_string(),
                gas_limit: "0x5208".to_string(),
                tx_type: 0,
                value: "0x3e8".to_string(),
            },
        )
    }

    #[test]
    fn migrations_create_tables() {
        let store = store();
        let conn = store.conn().expect("lock");
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("query should prepare");

        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .expect("query_map should succeed")
            .collect::<Result<Vec<_>, _>>()
            .expect("all rows should parse");

        for expected in [
            "chains",
            "native_tokens",
            "nonce_reservations",
            "pairs",
            "request_logs",
            "token_balances",
            "tokens",
            "user_settings",
            "user_wallets",
            "users",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn user_round_trips_with_wallets_and_settings() {
        let store = store();
        let mut user = User {
            id: "user-1".to_string(),
            user_type: UserType::Custody,
            default_chain_id: 56,
            wallets: BTreeMap::from([(56, Address::repeat_byte(0xaa))]),
            settings: BTreeMap::new(),
        };
        user.settings.insert(
            56,
            UserSettings {
                max_slippage_bps: 200,
                default_buy_amount_wei: U256::from(5u64),
                confirmation_gas_threshold_wei: Some(U256::from(1_000_000u64)),
            },
        );
        store.upsert_user(&user).expect("upsert");

        let loaded = store.get_user("user-1").expect("query").expect("present");
        assert_eq!(loaded, user);
        assert!(store.get_user("nobody").expect("query").is_none());
    }

    #[test]
    fn pair_round_trips_through_token_join() {
        let store = store();
        let pair = sample_pair();
        store.upsert_pair(&pair).expect("upsert");

        assert_eq!(store.get_pair("pair-1").expect("query"), Some(pair.clone()));
        assert_eq!(
            store
                .get_pair_by_address(56, pair.contract_address)
                .expect("query")
                .map(|p| p.id),
            Some("pair-1".to_string())
        );
        assert_eq!(
            store
                .get_pair_by_token(56, pair.token.contract_address)
                .expect("query")
                .map(|p| p.id),
            Some("pair-1".to_string())
        );
        assert_eq!(store.list_pairs(56).expect("list").len(), 1);
        assert!(store.list_pairs(1).expect("list").is_empty());
    }

    #[test]
    fn positive_balances_skip_zero_rows() {
        let store = store();
        let balance = |token: u8, wei: u64| TokenBalance {
            user_id: "user-1".to_string(),
            chain_id: 56,
            pair_id: format!("pair-{token}"),
            token_address: Address::repeat_byte(token),
            balance_wei: U256::from(wei),
        };
        let written = store
            .update_token_balances(&[balance(1, 10), balance(2, 0), balance(3, 30)])
            .expect("batch");
        assert_eq!(written, 3);

        let positive = store
            .retrieve_positive_token_balances("user-1", Some(56))
            .expect("query");
        assert_eq!(positive.len(), 2);
        assert!(positive.iter().all(|b| b.balance_wei > U256::ZERO));
        assert!(store
            .retrieve_positive_token_balances("user-1", Some(1))
            .expect("query")
            .is_empty());
    }

    #[test]
    fn nonce_reservation_upserts() {
        let store = store();
        assert_eq!(store.reserved_nonce(56, "user-1").expect("query"), None);
        store.reserve_nonce(56, "user-1", 7).expect("reserve");
        store.reserve_nonce(56, "user-1", 8).expect("reserve");
        assert_eq!(store.reserved_nonce(56, "user-1").expect("query"), Some(8));
    }

    #[test]
    fn request_log_transitions_only_from_pending() {
        let store = store();
        store
            .create_request_log(&sample_log("req-1", "track-1"))
            .expect("create");
        assert_eq!(store.pending_request_logs().expect("pending").len(), 1);

        let updated = store
            .update_request_log_by_returned_id(
                "track-1",
                RequestStatus::Confirmed,
                Some("0xabc"),
                None,
            )
            .expect("update");
        assert!(updated);

        let again = store
            .update_request_log_by_returned_id(
                "track-1",
                RequestStatus::Failed,
                None,
                Some("reverted transaction"),
            )
            .expect("update");
        assert!(!again, "terminal logs must not transition");

        let log = store
            .get_request_log_by_returned_id("track-1")
            .expect("query")
            .expect("present");
        assert_eq!(log.status, RequestStatus::Confirmed);
        assert_eq!(log.tx_hash.as_deref(), Some("0xabc"));
        assert_eq!(log.transaction.nonce, 3);
        assert!(store.pending_request_logs().expect("pending").is_empty());
    }

    #[test]
    fn native_token_lookup_by_chain() {
        let store = store();
        let native = NativeToken {
            chain_id: 56,
            token_id: "wbnb".to_string(),
            contract_address: Address::repeat_byte(0x33),
            symbol: "WBNB".to_string(),
        };
        store.upsert_chain(56, "bsc", &native).expect("upsert");
        assert_eq!(store.retrieve_native_token(56).expect("query"), Some(native));
        assert_eq!(store.retrieve_native_token(1).expect("query"), None);
    }
}
