use liftoff_execution::{fair::MAX_CRASH_POINT, solvency};
use liftoff_types::{is_valid_address, normalize_address, Address, Multiplier, Wei};
use serde::{Deserialize, Serialize};
use std::{num::NonZeroU32, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::Level;

pub mod backend;
pub mod cashier;
pub mod chain;
pub mod deposits;
pub mod engine;
pub mod monitor;
pub mod payout;

/// Basis points in one whole.
const BPS: u32 = 10_000;

/// Configuration for the `liftoff-node` binary.
#[derive(Deserialize, Serialize)]
pub struct Config {
    pub port: u16,
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,

    pub mailbox_size: usize,
    /// Events retained for replay on reconnect.
    pub event_buffer: usize,

    pub engine: EngineConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    pub solvency: SolvencyConfig,
    pub payout: PayoutConfig,
    pub deposits: DepositConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    pub devnet: DevnetConfig,
}

#[derive(Deserialize, Serialize)]
pub struct EngineConfig {
    pub betting_ms: u64,
    pub cooldown_ms: u64,
    pub grace_ms: u64,
    pub tick_ms: u64,
    #[serde(with = "liftoff_types::wei")]
    pub min_bet: Wei,
    #[serde(with = "liftoff_types::wei")]
    pub max_bet: Wei,
    /// Hundredths (`10000` == 100.00x).
    pub max_payout: u64,
    pub client_seed: String,
}

#[derive(Deserialize, Serialize)]
pub struct LedgerConfig {
    pub max_attempts: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_attempts: liftoff_execution::ledger::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Deserialize, Serialize)]
pub struct SolvencyConfig {
    #[serde(with = "liftoff_types::wei")]
    pub min_reserve: Wei,
    pub max_liability_bps: u32,
    pub high_water_bps: u32,
    /// Utilization under which the bankroll monitor lifts emergency mode.
    pub low_water_bps: u32,
}

#[derive(Deserialize, Serialize)]
pub struct PayoutConfig {
    pub hot_wallet: String,
    pub fee_bump_bps: u32,
    pub max_attempts: u32,
    pub receipt_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub rpc_timeout_ms: u64,
}

#[derive(Deserialize, Serialize)]
pub struct DepositConfig {
    pub address: String,
    pub start_block: u64,
    pub reorg_buffer: u64,
    pub max_span: u64,
    pub poll_interval_ms: u64,
    /// Also credit new heads as they are announced.
    #[serde(default)]
    pub watch: bool,
}

#[derive(Deserialize, Serialize)]
pub struct GatewayConfig {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_multiple: u32,
    pub sync_interval_ms: u64,
    pub rate_limit_replenish_ms: u64,
    pub rate_limit_burst: u32,
    pub messages_per_second: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let defaults = liftoff_gateway::Config::default();
        Self {
            heartbeat_interval_ms: defaults.heartbeat_interval.as_millis() as u64,
            heartbeat_timeout_multiple: defaults.heartbeat_timeout_multiple,
            sync_interval_ms: defaults.sync_interval.as_millis() as u64,
            rate_limit_replenish_ms: defaults.rate_limit_replenish_ms,
            rate_limit_burst: defaults.rate_limit_burst,
            messages_per_second: defaults.messages_per_second.get(),
        }
    }
}

#[derive(Deserialize, Serialize)]
pub struct MonitorConfig {
    pub audit_interval_ms: u64,
    pub house_funds_interval_ms: u64,
    pub nonce_interval_ms: u64,
    pub reconcile_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            audit_interval_ms: 60_000,
            house_funds_interval_ms: 30_000,
            nonce_interval_ms: 60_000,
            reconcile_interval_ms: 15_000,
        }
    }
}

/// The in-process chain the node settles on.
#[derive(Clone, Deserialize, Serialize)]
pub struct DevnetConfig {
    #[serde(with = "liftoff_types::wei")]
    pub house_funds: Wei,
    pub block_time_ms: u64,
    #[serde(with = "liftoff_types::wei")]
    pub gas_price: Wei,
    /// Wallets that deposit `faucet_amount` into the collection address at startup.
    #[serde(default)]
    pub faucet: Vec<String>,
    #[serde(default, with = "liftoff_types::wei")]
    pub faucet_amount: Wei,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid log level: {value}")]
    InvalidLogLevel { value: String },
    #[error("{field} must be > 0 (got {value})")]
    InvalidNonZero { field: &'static str, value: u128 },
    #[error("{field} is not an address: {value}")]
    InvalidAddress { field: &'static str, value: String },
    #[error("{field} is out of range: {reason}")]
    InvalidRange { field: &'static str, reason: String },
}

pub struct ValidatedConfig {
    pub port: u16,
    pub log_level: Level,
    pub json_logs: bool,
    pub event_buffer: usize,

    pub engine: engine::Config,
    pub ledger_attempts: usize,
    pub solvency: solvency::Config,
    pub hot_wallet: Address,
    pub payout: payout::Config,
    pub deposits: deposits::Config,
    pub watch_heads: bool,
    pub gateway: liftoff_gateway::Config,
    pub monitor: monitor::Config,
    pub devnet: DevnetConfig,
}

fn non_zero(field: &'static str, value: impl Into<u128>) -> Result<(), ConfigError> {
    let value = value.into();
    if value == 0 {
        return Err(ConfigError::InvalidNonZero { field, value });
    }
    Ok(())
}

fn address(field: &'static str, value: &str) -> Result<Address, ConfigError> {
    if !is_valid_address(value) {
        return Err(ConfigError::InvalidAddress {
            field,
            value: value.to_string(),
        });
    }
    Ok(normalize_address(value))
}

fn range(field: &'static str, ok: bool, reason: impl FnOnce() -> String) -> Result<(), ConfigError> {
    if !ok {
        return Err(ConfigError::InvalidRange {
            field,
            reason: reason(),
        });
    }
    Ok(())
}

fn millis(value: u64) -> Duration {
    Duration::from_millis(value)
}

impl Config {
    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        let log_level =
            Level::from_str(&self.log_level).map_err(|_| ConfigError::InvalidLogLevel {
                value: self.log_level.clone(),
            })?;
        non_zero("mailbox_size", self.mailbox_size as u64)?;
        non_zero("event_buffer", self.event_buffer as u64)?;

        let engine = &self.engine;
        non_zero("engine.betting_ms", engine.betting_ms)?;
        non_zero("engine.tick_ms", engine.tick_ms)?;
        non_zero("engine.min_bet", engine.min_bet)?;
        range("engine.max_bet", engine.min_bet <= engine.max_bet, || {
            format!("{} is below min_bet {}", engine.max_bet, engine.min_bet)
        })?;
        let max_payout = Multiplier(engine.max_payout);
        range(
            "engine.max_payout",
            max_payout > Multiplier::ONE && max_payout <= MAX_CRASH_POINT,
            || format!("{max_payout} must be above 1.00x and at most {MAX_CRASH_POINT}"),
        )?;
        range("engine.client_seed", !engine.client_seed.is_empty(), || {
            "must not be empty".to_string()
        })?;

        non_zero("ledger.max_attempts", self.ledger.max_attempts as u64)?;

        let solvency = &self.solvency;
        range(
            "solvency.max_liability_bps",
            solvency.max_liability_bps > 0 && solvency.max_liability_bps <= BPS,
            || format!("{} must be in 1..={BPS}", solvency.max_liability_bps),
        )?;
        range(
            "solvency.high_water_bps",
            solvency.high_water_bps > 0 && solvency.high_water_bps <= BPS,
            || format!("{} must be in 1..={BPS}", solvency.high_water_bps),
        )?;
        range(
            "solvency.low_water_bps",
            solvency.low_water_bps < solvency.high_water_bps,
            || {
                format!(
                    "{} must be below high_water_bps {}",
                    solvency.low_water_bps, solvency.high_water_bps
                )
            },
        )?;

        let payout = &self.payout;
        let hot_wallet = address("payout.hot_wallet", &payout.hot_wallet)?;
        range("payout.fee_bump_bps", payout.fee_bump_bps > BPS, || {
            format!("{} must exceed {BPS}", payout.fee_bump_bps)
        })?;
        non_zero("payout.max_attempts", payout.max_attempts)?;
        non_zero("payout.receipt_timeout_ms", payout.receipt_timeout_ms)?;
        non_zero("payout.poll_interval_ms", payout.poll_interval_ms)?;
        non_zero("payout.rpc_timeout_ms", payout.rpc_timeout_ms)?;

        let deposits = &self.deposits;
        let deposit_address = address("deposits.address", &deposits.address)?;
        non_zero("deposits.poll_interval_ms", deposits.poll_interval_ms)?;
        range(
            "deposits.max_span",
            deposits.max_span > deposits.reorg_buffer,
            || {
                format!(
                    "{} must exceed reorg_buffer {}",
                    deposits.max_span, deposits.reorg_buffer
                )
            },
        )?;

        let gateway = &self.gateway;
        non_zero("gateway.heartbeat_interval_ms", gateway.heartbeat_interval_ms)?;
        non_zero(
            "gateway.heartbeat_timeout_multiple",
            gateway.heartbeat_timeout_multiple,
        )?;
        non_zero("gateway.sync_interval_ms", gateway.sync_interval_ms)?;
        non_zero("gateway.rate_limit_replenish_ms", gateway.rate_limit_replenish_ms)?;
        non_zero("gateway.rate_limit_burst", gateway.rate_limit_burst)?;
        let messages_per_second = NonZeroU32::new(gateway.messages_per_second).ok_or(
            ConfigError::InvalidNonZero {
                field: "gateway.messages_per_second",
                value: 0,
            },
        )?;

        let monitor = &self.monitor;
        non_zero("monitor.audit_interval_ms", monitor.audit_interval_ms)?;
        non_zero("monitor.house_funds_interval_ms", monitor.house_funds_interval_ms)?;
        non_zero("monitor.nonce_interval_ms", monitor.nonce_interval_ms)?;
        non_zero("monitor.reconcile_interval_ms", monitor.reconcile_interval_ms)?;

        non_zero("devnet.block_time_ms", self.devnet.block_time_ms)?;
        let mut devnet = self.devnet.clone();
        devnet.faucet = devnet
            .faucet
            .iter()
            .map(|wallet| address("devnet.faucet", wallet))
            .collect::<Result<_, _>>()?;

        let rpc_timeout = millis(payout.rpc_timeout_ms);
        Ok(ValidatedConfig {
            port: self.port,
            log_level,
            json_logs: self.json_logs,
            event_buffer: self.event_buffer,
            engine: engine::Config {
                betting: millis(engine.betting_ms),
                cooldown: millis(engine.cooldown_ms),
                grace: millis(engine.grace_ms),
                tick: millis(engine.tick_ms),
                min_bet: engine.min_bet,
                max_bet: engine.max_bet,
                max_payout,
                client_seed: engine.client_seed.clone(),
                mailbox_size: self.mailbox_size,
            },
            ledger_attempts: self.ledger.max_attempts,
            solvency: solvency::Config {
                min_reserve: solvency.min_reserve,
                max_liability_bps: solvency.max_liability_bps,
                high_water_bps: solvency.high_water_bps,
                low_water_bps: solvency.low_water_bps,
                max_payout,
            },
            hot_wallet,
            payout: payout::Config {
                fee_bump_bps: payout.fee_bump_bps,
                max_attempts: payout.max_attempts,
                receipt_timeout: millis(payout.receipt_timeout_ms),
                poll_interval: millis(payout.poll_interval_ms),
                rpc_timeout,
            },
            deposits: deposits::Config {
                address: deposit_address,
                start_block: deposits.start_block,
                reorg_buffer: deposits.reorg_buffer,
                max_span: deposits.max_span,
                poll_interval: millis(deposits.poll_interval_ms),
                rpc_timeout,
            },
            watch_heads: deposits.watch,
            gateway: liftoff_gateway::Config {
                heartbeat_interval: millis(gateway.heartbeat_interval_ms),
                heartbeat_timeout_multiple: gateway.heartbeat_timeout_multiple,
                sync_interval: millis(gateway.sync_interval_ms),
                rate_limit_replenish_ms: gateway.rate_limit_replenish_ms,
                rate_limit_burst: gateway.rate_limit_burst,
                messages_per_second,
            },
            monitor: monitor::Config {
                audit_interval: millis(monitor.audit_interval_ms),
                house_funds_interval: millis(monitor.house_funds_interval_ms),
                nonce_interval: millis(monitor.nonce_interval_ms),
                reconcile_interval: millis(monitor.reconcile_interval_ms),
                rpc_timeout,
            },
            devnet,
        })
    }
}
