// =============================================================================
// Strategy registry — tag -> factory + default param blocks.
// =============================================================================
//
// Ported from `backend/strategy/registry.py`: a frozen registration record
// per tag, a lazy `ensure_builtins_registered` guard, and `replace` support
// so a caller can override a built-in tag before first use.

use std::collections::HashMap;
use std::sync::OnceLock;

use parking_lot::Mutex;
use serde_json::{json, Value as Json};

use super::ma_cross::MaCrossStrategy;
use super::rsi_overtrade::SimpleRsiOvertradeStrategy;
use super::test_strategy::TestStrategy;
use super::Strategy;

pub type StrategyFactory = fn(id: &str) -> Box<dyn Strategy>;

#[derive(Clone)]
pub struct StrategyRegistration {
    pub factory: StrategyFactory,
    pub strategy_defaults: HashMap<String, Json>,
    pub indicator_defaults: HashMap<String, Json>,
}

fn registry() -> &'static Mutex<HashMap<String, StrategyRegistration>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, StrategyRegistration>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn builtins_registered() -> &'static Mutex<bool> {
    static FLAG: OnceLock<Mutex<bool>> = OnceLock::new();
    FLAG.get_or_init(|| Mutex::new(false))
}

pub fn register_strategy(
    type_tag: &str,
    factory: StrategyFactory,
    strategy_defaults: HashMap<String, Json>,
    indicator_defaults: HashMap<String, Json>,
    replace: bool,
) {
    let mut reg = registry().lock();
    if reg.contains_key(type_tag) && !replace {
        return;
    }
    reg.insert(
        type_tag.to_string(),
        StrategyRegistration { factory, strategy_defaults, indicator_defaults },
    );
}

fn ensure_builtins_registered() {
    let mut flag = builtins_registered().lock();
    if *flag {
        return;
    }
    *flag = true;

    register_strategy(
        "test",
        |id| Box::new(TestStrategy::new(id)),
        HashMap::from([
            ("trend_strength_min".to_string(), json!(0.003)),
            ("atr_stop_mult".to_string(), json!(1.5)),
            ("cooldown_after_stop".to_string(), json!(4)),
            ("rsi_long_lower".to_string(), json!(50.0)),
            ("rsi_long_upper".to_string(), json!(60.0)),
            ("rsi_short_upper".to_string(), json!(50.0)),
            ("rsi_short_lower".to_string(), json!(40.0)),
            ("rsi_slope_required".to_string(), json!(true)),
            ("realtime_entry".to_string(), json!(false)),
            ("realtime_exit".to_string(), json!(false)),
        ]),
        HashMap::new(),
        false,
    );

    register_strategy(
        "ma_cross",
        |id| Box::new(MaCrossStrategy::new(id)),
        HashMap::from([
            ("atr_stop_mult".to_string(), json!(1.2)),
            ("cooldown_after_stop".to_string(), json!(2)),
            ("realtime_entry".to_string(), json!(false)),
            ("realtime_exit".to_string(), json!(false)),
        ]),
        HashMap::new(),
        false,
    );

    register_strategy(
        "simple_rsi_overtrade_strategy",
        |id| Box::new(SimpleRsiOvertradeStrategy::new(id)),
        HashMap::from([
            ("rsi_low".to_string(), json!(30.0)),
            ("rsi_high".to_string(), json!(70.0)),
            ("stop_loss_pct".to_string(), json!(0.01)),
            ("rr".to_string(), json!(1.5)),
            ("realtime_entry".to_string(), json!(false)),
            ("realtime_exit".to_string(), json!(true)),
        ]),
        HashMap::new(),
        false,
    );
}

pub fn create_strategy(type_tag: &str, id: &str) -> Option<Box<dyn Strategy>> {
    ensure_builtins_registered();
    let reg = registry().lock();
    reg.get(type_tag).map(|r| (r.factory)(id))
}

pub fn get_strategy_defaults(type_tag: &str) -> Option<(HashMap<String, Json>, HashMap<String, Json>)> {
    ensure_builtins_registered();
    let reg = registry().lock();
    reg.get(type_tag)
        .map(|r| (r.strategy_defaults.clone(), r.indicator_defaults.clone()))
}

pub fn list_strategy_types() -> Vec<String> {
    ensure_builtins_registered();
    registry().lock().keys().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered_lazily() {
        let types = list_strategy_types();
        assert!(types.contains(&"test".to_string()));
        assert!(types.contains(&"ma_cross".to_string()));
        assert!(types.contains(&"simple_rsi_overtrade_strategy".to_string()));
    }

    #[test]
    fn create_strategy_returns_none_for_unknown_tag() {
        assert!(create_strategy("nonexistent", "sid").is_none());
    }

    #[test]
    fn defaults_include_cooldown_after_stop() {
        let (strategy_defaults, _) = get_strategy_defaults("ma_cross").unwrap();
        assert_eq!(strategy_defaults["cooldown_after_stop"], json!(2));
    }
}
