// =============================================================================
// Configuration — YAML document, env overrides, per-strategy profile merge.
// =============================================================================
//
// Grounded in the teacher's `runtime_config.rs` load/save shape (serde with
// `#[serde(default = "...")]` per-field defaults, `anyhow::Context`-chained
// load errors) reworked for the YAML document of the original source's
// `config.py::Settings`. Environment overrides and the per-strategy deep
// merge are implemented as a small recursive `serde_yaml::Value` walk rather
// than pulling in a generic config-merge crate — this is domain logic, not
// an ambient concern.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_yaml::Value as Yaml;

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// app / binance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSection {
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_env() -> String {
    "dev".to_string()
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for AppSection {
    fn default() -> Self {
        Self { env: default_env(), timezone: default_timezone(), log_level: default_log_level() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsReconnectConfig {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for WsReconnectConfig {
    fn default() -> Self {
        Self { max_retries: 0, base_delay_ms: default_base_delay_ms(), max_delay_ms: default_max_delay_ms() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinanceConfig {
    #[serde(default = "default_rest_base")]
    pub rest_base: String,
    #[serde(default = "default_ws_base")]
    pub ws_base: String,
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_intervals")]
    pub intervals: Vec<String>,
    #[serde(default)]
    pub ws_reconnect: WsReconnectConfig,
}

fn default_rest_base() -> String {
    "https://fapi.binance.com".to_string()
}
fn default_ws_base() -> String {
    "wss://fstream.binance.com".to_string()
}
fn default_symbol() -> String {
    "BTCUSDT".to_string()
}
fn default_intervals() -> Vec<String> {
    vec!["15m".to_string(), "1h".to_string()]
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            rest_base: default_rest_base(),
            ws_base: default_ws_base(),
            symbol: default_symbol(),
            intervals: default_intervals(),
            ws_reconnect: WsReconnectConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// sim / risk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default = "default_initial_capital")]
    pub initial_capital: f64,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,
    #[serde(default)]
    pub slippage: f64,
}

fn default_initial_capital() -> f64 {
    1000.0
}
fn default_max_leverage() -> f64 {
    20.0
}
fn default_fee_rate() -> f64 {
    0.0004
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            initial_capital: default_initial_capital(),
            max_leverage: default_max_leverage(),
            fee_rate: default_fee_rate(),
            slippage: 0.0,
        }
    }
}

/// One maintenance-margin tier: `notional_usdt` is the tier's inclusive upper
/// bound; tiers are consulted in ascending order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MmrTier {
    pub notional_usdt: f64,
    pub mmr: f64,
    #[serde(default)]
    pub maint_amount: f64,
}

fn default_mmr_tiers() -> Vec<MmrTier> {
    vec![
        MmrTier { notional_usdt: 5_000.0, mmr: 0.004, maint_amount: 0.0 },
        MmrTier { notional_usdt: 50_000.0, mmr: 0.004, maint_amount: 0.0 },
        MmrTier { notional_usdt: 250_000.0, mmr: 0.005, maint_amount: 50.0 },
        MmrTier { notional_usdt: 1_000_000.0, mmr: 0.01, maint_amount: 900.0 },
        MmrTier { notional_usdt: 1_000_000_000.0, mmr: 0.025, maint_amount: 10_000.0 },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_position_notional")]
    pub max_position_notional: f64,
    #[serde(default = "default_max_position_pct_equity")]
    pub max_position_pct_equity: f64,
    #[serde(default)]
    pub liquidation_buffer_pct: f64,
    #[serde(default = "default_true")]
    pub allow_reduce_only: bool,
    #[serde(default = "default_mmr_tiers")]
    pub mmr_tiers: Vec<MmrTier>,
}

fn default_max_position_notional() -> f64 {
    20_000.0
}
fn default_max_position_pct_equity() -> f64 {
    1.0
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position_notional: default_max_position_notional(),
            max_position_pct_equity: default_max_position_pct_equity(),
            liquidation_buffer_pct: 0.0,
            allow_reduce_only: true,
            mmr_tiers: default_mmr_tiers(),
        }
    }
}

// ---------------------------------------------------------------------------
// indicators / cooldown / strategy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorConfig {
    #[serde(default)]
    pub rsi: HashMap<String, Yaml>,
    #[serde(default)]
    pub ema_fast: HashMap<String, Yaml>,
    #[serde(default)]
    pub ema_slow: HashMap<String, Yaml>,
    #[serde(default)]
    pub macd: HashMap<String, Yaml>,
    #[serde(default)]
    pub atr: HashMap<String, Yaml>,
    #[serde(default)]
    pub ema_trend: HashMap<String, Yaml>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bars_after_exit")]
    pub bars_after_exit: i64,
    #[serde(default = "default_min_ms_after_exit")]
    pub min_ms_after_exit: i64,
}

fn default_bars_after_exit() -> i64 {
    2
}
fn default_min_ms_after_exit() -> i64 {
    900_000
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bars_after_exit: default_bars_after_exit(),
            min_ms_after_exit: default_min_ms_after_exit(),
        }
    }
}

/// Global strategy-parameter defaults, overridden per-type by the registry
/// and per-instance by `StrategyEntryConfig::params`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDefaultsConfig {
    #[serde(default = "default_trend_strength_min")]
    pub trend_strength_min: f64,
    #[serde(default = "default_atr_stop_mult")]
    pub atr_stop_mult: f64,
    #[serde(default = "default_cooldown_after_stop")]
    pub cooldown_after_stop: i64,
    #[serde(default = "default_rsi_long_lower")]
    pub rsi_long_lower: f64,
    #[serde(default = "default_rsi_long_upper")]
    pub rsi_long_upper: f64,
    #[serde(default = "default_rsi_short_upper")]
    pub rsi_short_upper: f64,
    #[serde(default = "default_rsi_short_lower")]
    pub rsi_short_lower: f64,
    #[serde(default = "default_true")]
    pub rsi_slope_required: bool,
}

fn default_trend_strength_min() -> f64 {
    0.003
}
fn default_atr_stop_mult() -> f64 {
    1.5
}
fn default_cooldown_after_stop() -> i64 {
    4
}
fn default_rsi_long_lower() -> f64 {
    50.0
}
fn default_rsi_long_upper() -> f64 {
    60.0
}
fn default_rsi_short_upper() -> f64 {
    50.0
}
fn default_rsi_short_lower() -> f64 {
    40.0
}

impl Default for StrategyDefaultsConfig {
    fn default() -> Self {
        Self {
            trend_strength_min: default_trend_strength_min(),
            atr_stop_mult: default_atr_stop_mult(),
            cooldown_after_stop: default_cooldown_after_stop(),
            rsi_long_lower: default_rsi_long_lower(),
            rsi_long_upper: default_rsi_long_upper(),
            rsi_short_upper: default_rsi_short_upper(),
            rsi_short_lower: default_rsi_short_lower(),
            rsi_slope_required: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyEntryConfig {
    #[serde(default = "default_strategy_id")]
    pub id: String,
    #[serde(default = "default_strategy_type")]
    pub r#type: String,
    #[serde(default)]
    pub initial_capital: Option<f64>,
    #[serde(default)]
    pub config_path: Option<String>,
    #[serde(default)]
    pub params: HashMap<String, Yaml>,
}

fn default_strategy_id() -> String {
    "default".to_string()
}
fn default_strategy_type() -> String {
    "test".to_string()
}

impl Default for StrategyEntryConfig {
    fn default() -> Self {
        Self {
            id: default_strategy_id(),
            r#type: default_strategy_type(),
            initial_capital: None,
            config_path: None,
            params: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KlineCacheConfig {
    #[serde(default = "default_max_bars_15m")]
    pub max_bars_15m: usize,
    #[serde(default = "default_max_bars_1h")]
    pub max_bars_1h: usize,
    #[serde(default = "default_warmup_extra_bars")]
    pub warmup_extra_bars: usize,
    #[serde(default = "default_warmup_buffer_mult")]
    pub warmup_buffer_mult: f64,
}

fn default_max_bars_15m() -> usize {
    2000
}
fn default_max_bars_1h() -> usize {
    2000
}
fn default_warmup_extra_bars() -> usize {
    200
}
fn default_warmup_buffer_mult() -> f64 {
    3.0
}

impl Default for KlineCacheConfig {
    fn default() -> Self {
        Self {
            max_bars_15m: default_max_bars_15m(),
            max_bars_1h: default_max_bars_1h(),
            warmup_extra_bars: default_warmup_extra_bars(),
            warmup_buffer_mult: default_warmup_buffer_mult(),
        }
    }
}

// ---------------------------------------------------------------------------
// alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramAlertConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub chat_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BarkAlertConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeComAlertConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub webhook: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_dedup_ttl_ms")]
    pub dedup_ttl_ms: i64,
    #[serde(default)]
    pub telegram: TelegramAlertConfig,
    #[serde(default)]
    pub bark: BarkAlertConfig,
    #[serde(default)]
    pub wecom: WeComAlertConfig,
}

fn default_dedup_ttl_ms() -> i64 {
    300_000
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dedup_ttl_ms: default_dedup_ttl_ms(),
            telegram: TelegramAlertConfig::default(),
            bark: BarkAlertConfig::default(),
            wecom: WeComAlertConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// storage / api / frontend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

fn default_sqlite_path() -> String {
    "./db/app.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { sqlite_path: default_sqlite_path() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_cors_origins")]
    pub cors_allow_origins: Vec<String>,
    #[serde(default = "default_ws_push_interval")]
    pub ws_push_interval: String,
    #[serde(default)]
    pub base_path: String,
    #[serde(default)]
    pub auth_token: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_ws_push_interval() -> String {
    "raw".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_allow_origins: default_cors_origins(),
            ws_push_interval: default_ws_push_interval(),
            base_path: String::new(),
            auth_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendConfig {
    #[serde(default = "default_static_path")]
    pub static_path: String,
    #[serde(default = "default_dev_server_url")]
    pub dev_server_url: String,
}

fn default_static_path() -> String {
    "./frontend/dist".to_string()
}
fn default_dev_server_url() -> String {
    "http://localhost:5173".to_string()
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self { static_path: default_static_path(), dev_server_url: default_dev_server_url() }
    }
}

fn default_strategies() -> Vec<StrategyEntryConfig> {
    vec![StrategyEntryConfig::default()]
}

// ---------------------------------------------------------------------------
// Top-level document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub binance: BinanceConfig,
    #[serde(default)]
    pub sim: SimConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub indicators: IndicatorConfig,
    #[serde(default)]
    pub cooldown: CooldownConfig,
    #[serde(default)]
    pub strategy: StrategyDefaultsConfig,
    #[serde(default = "default_strategies")]
    pub strategies: Vec<StrategyEntryConfig>,
    #[serde(default)]
    pub kline_cache: KlineCacheConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub frontend: FrontendConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            binance: BinanceConfig::default(),
            sim: SimConfig::default(),
            risk: RiskConfig::default(),
            indicators: IndicatorConfig::default(),
            cooldown: CooldownConfig::default(),
            strategy: StrategyDefaultsConfig::default(),
            strategies: default_strategies(),
            kline_cache: KlineCacheConfig::default(),
            alerts: AlertsConfig::default(),
            storage: StorageConfig::default(),
            api: ApiConfig::default(),
            frontend: FrontendConfig::default(),
        }
    }
}

const ROOT_KEYS: &[&str] = &[
    "app", "binance", "sim", "risk", "indicators", "cooldown", "strategy", "strategies",
    "kline_cache", "alerts", "storage", "api", "frontend",
];

impl AppConfig {
    /// Load the YAML document at `path`, apply `KEY__NESTED__PATH`-style
    /// environment overrides, and deserialize into a typed tree. Missing
    /// file is not an error — an empty document (all defaults) is used,
    /// matching the original source's `load_settings` behaviour.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut doc: Yaml = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config from {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("failed to parse config yaml at {}", path.display()))?
        } else {
            Yaml::Mapping(Default::default())
        };

        apply_env_overrides(&mut doc, std::env::vars());

        let config: Self = serde_yaml::from_value(doc)
            .with_context(|| format!("failed to deserialize config from {}", path.display()))?;
        Ok(config)
    }

    /// Build a strategy's merged profile bundle: registry defaults for its
    /// declared `type` → optional `config_path` YAML → inline `params` →
    /// explicit `initial_capital`. Returns the merged `{sim, risk, strategy,
    /// indicators, kline_cache}` document strategies receive via `configure`.
    pub fn build_profile(
        &self,
        entry: &StrategyEntryConfig,
        strategy_defaults: &HashMap<String, serde_json::Value>,
        indicator_defaults: &HashMap<String, serde_json::Value>,
    ) -> Result<Yaml> {
        let mut merged = yaml_mapping();
        insert(&mut merged, "sim", to_yaml(&self.sim)?);
        insert(&mut merged, "risk", to_yaml(&self.risk)?);
        insert(&mut merged, "kline_cache", to_yaml(&self.kline_cache)?);

        let mut strategy_params = to_yaml(&self.strategy)?;
        for (k, v) in strategy_defaults {
            deep_merge(&mut strategy_params, &yaml_mapping_of(k, json_to_yaml(v)));
        }
        insert(&mut merged, "strategy", strategy_params);

        let mut indicator_params = to_yaml(&self.indicators)?;
        for (k, v) in indicator_defaults {
            deep_merge(&mut indicator_params, &yaml_mapping_of(k, json_to_yaml(v)));
        }
        insert(&mut merged, "indicators", indicator_params);

        if let Some(config_path) = &entry.config_path {
            if Path::new(config_path).exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("failed to read strategy config {config_path}"))?;
                let overlay: Yaml = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse strategy config {config_path}"))?;
                deep_merge(&mut merged, &overlay);
            }
        }

        if !entry.params.is_empty() {
            let mut params_overlay = yaml_mapping();
            insert(&mut params_overlay, "strategy", Yaml::Mapping({
                let mut m = serde_yaml::Mapping::new();
                for (k, v) in &entry.params {
                    m.insert(Yaml::String(k.clone()), v.clone());
                }
                m
            }));
            deep_merge(&mut merged, &params_overlay);
        }

        if let Some(capital) = entry.initial_capital.or(Some(self.sim.initial_capital)) {
            insert(&mut merged, "initial_capital", Yaml::Number(capital.into()));
        }

        Ok(merged)
    }
}

fn yaml_mapping() -> Yaml {
    Yaml::Mapping(serde_yaml::Mapping::new())
}

fn yaml_mapping_of(key: &str, value: Yaml) -> Yaml {
    let mut m = serde_yaml::Mapping::new();
    m.insert(Yaml::String(key.to_string()), value);
    let mut wrapper = serde_yaml::Mapping::new();
    wrapper.insert(Yaml::String("strategy".to_string()), Yaml::Mapping(m));
    Yaml::Mapping(wrapper)
}

fn insert(doc: &mut Yaml, key: &str, value: Yaml) {
    if let Yaml::Mapping(map) = doc {
        map.insert(Yaml::String(key.to_string()), value);
    }
}

fn to_yaml<T: Serialize>(value: &T) -> Result<Yaml> {
    Ok(serde_yaml::to_value(value)?)
}

fn json_to_yaml(value: &serde_json::Value) -> Yaml {
    serde_yaml::to_value(value).unwrap_or(Yaml::Null)
}

/// Recursively merge `src` into `dst`; later (src) keys win, but two mapping
/// values at the same key are merged rather than replaced wholesale.
fn deep_merge(dst: &mut Yaml, src: &Yaml) {
    match (dst, src) {
        (Yaml::Mapping(dst_map), Yaml::Mapping(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(k) {
                    Some(existing) if matches!(existing, Yaml::Mapping(_)) && matches!(v, Yaml::Mapping(_)) => {
                        deep_merge(existing, v);
                    }
                    _ => {
                        dst_map.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val.clone();
        }
    }
}

/// Walk `KEY__NESTED__PATH=value` environment variables whose first segment
/// (lower-cased) names a top-level config section, and apply them as string
/// overrides onto the YAML document before typed deserialization.
fn apply_env_overrides(doc: &mut Yaml, vars: impl Iterator<Item = (String, String)>) {
    if !matches!(doc, Yaml::Mapping(_)) {
        *doc = yaml_mapping();
    }
    for (key, value) in vars {
        if !key.contains("__") {
            continue;
        }
        let parts: Vec<String> =
            key.split("__").map(|p| p.trim().to_lowercase()).filter(|p| !p.is_empty()).collect();
        let Some(root) = parts.first() else { continue };
        if !ROOT_KEYS.contains(&root.as_str()) {
            continue;
        }
        set_path(doc, &parts, Yaml::String(value));
    }
}

fn set_path(doc: &mut Yaml, parts: &[String], value: Yaml) {
    let Yaml::Mapping(map) = doc else { return };
    if parts.len() == 1 {
        map.insert(Yaml::String(parts[0].clone()), value);
        return;
    }
    let key = Yaml::String(parts[0].clone());
    let entry = map.entry(key).or_insert_with(yaml_mapping);
    if !matches!(entry, Yaml::Mapping(_)) {
        *entry = yaml_mapping();
    }
    set_path(entry, &parts[1..], value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_source_literals() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.sim.fee_rate, 0.0004);
        assert_eq!(cfg.sim.max_leverage, 20.0);
        assert_eq!(cfg.risk.max_position_notional, 20_000.0);
        assert_eq!(cfg.risk.mmr_tiers.len(), 5);
    }

    #[test]
    fn env_override_sets_nested_path() {
        let mut doc = yaml_mapping();
        apply_env_overrides(
            &mut doc,
            vec![("BINANCE__SYMBOL".to_string(), "ETHUSDT".to_string())].into_iter(),
        );
        let cfg: AppConfig = serde_yaml::from_value(doc).unwrap();
        assert_eq!(cfg.binance.symbol, "ETHUSDT");
    }

    #[test]
    fn env_override_ignores_unknown_root() {
        let mut doc = yaml_mapping();
        apply_env_overrides(&mut doc, vec![("PATH__FOO".to_string(), "bar".to_string())].into_iter());
        assert_eq!(doc, yaml_mapping());
    }

    #[test]
    fn deep_merge_recurses_into_mappings_and_lets_later_keys_win() {
        let mut dst: Yaml = serde_yaml::from_str("a: {x: 1, y: 2}").unwrap();
        let src: Yaml = serde_yaml::from_str("a: {y: 3, z: 4}").unwrap();
        deep_merge(&mut dst, &src);
        let merged: serde_yaml::Mapping = match dst {
            Yaml::Mapping(m) => match m.get(&Yaml::String("a".into())).unwrap() {
                Yaml::Mapping(inner) => inner.clone(),
                _ => panic!("expected mapping"),
            },
            _ => panic!("expected mapping"),
        };
        assert_eq!(merged.get(&Yaml::String("x".into())).unwrap(), &Yaml::Number(1.into()));
        assert_eq!(merged.get(&Yaml::String("y".into())).unwrap(), &Yaml::Number(3.into()));
        assert_eq!(merged.get(&Yaml::String("z".into())).unwrap(), &Yaml::Number(4.into()));
    }
}
