//! Simulated execution costs: slippage, taker fee and gas.
//!
//! Every ledger fill is priced through [`ExecutionCosts::price_fill`]. Slippage
//! is sampled from a [`SlippageModel`] so tests can pin it while the paper
//! engine draws it uniformly from a configured band.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde::Deserialize;

use crate::types::TradeSide;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    /// Fee charged on every fill's notional.
    pub taker_fee_rate: Decimal,
    pub slippage_min: Decimal,
    pub slippage_max: Decimal,
    pub gas_limit: u64,
    pub gas_price_gwei: Decimal,
    /// USD price of the chain's native token used to pay gas.
    pub native_token_usd: Decimal,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            taker_fee_rate: dec!(0.002),
            slippage_min: dec!(0.001),
            slippage_max: dec!(0.005),
            gas_limit: 200_000,
            gas_price_gwei: dec!(50),
            native_token_usd: dec!(0.50),
        }
    }
}

impl CostConfig {
    /// Flat gas charge per fill in quote currency.
    pub fn gas_cost(&self) -> Decimal {
        Decimal::from(self.gas_limit) * self.gas_price_gwei * dec!(0.000000001) * self.native_token_usd
    }

    /// Most a BUY of `notional` can debit: full slippage band, fee and gas.
    pub fn max_buy_cost(&self, notional: Decimal) -> Decimal {
        notional * (Decimal::ONE + self.slippage_max) * (Decimal::ONE + self.taker_fee_rate) + self.gas_cost()
    }

    /// Largest notional whose [`max_buy_cost`](Self::max_buy_cost) fits in `budget`.
    pub fn notional_within(&self, budget: Decimal) -> Decimal {
        let per_unit = (Decimal::ONE + self.slippage_max) * (Decimal::ONE + self.taker_fee_rate);
        ((budget - self.gas_cost()) / per_unit)
            .round_dp_with_strategy(6, RoundingStrategy::ToZero)
            .max(Decimal::ZERO)
    }
}

// ---------------------------------------------------------------------------
// Slippage models
// ---------------------------------------------------------------------------

/// Source of per-fill slippage fractions.
pub trait SlippageModel: Send {
    /// Next slippage as a non-negative fraction of the quoted price.
    fn sample(&mut self) -> Decimal;
}

/// Uniform draw from `[min, max]`.
pub struct UniformSlippage {
    rng: StdRng,
    min: f64,
    max: f64,
}

impl UniformSlippage {
    /// Seeded for reproducible runs; entropy-seeded otherwise.
    pub fn new(min: Decimal, max: Decimal, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let min = min.to_f64().unwrap_or(0.0);
        let max = max.to_f64().unwrap_or(min).max(min);
        Self { rng, min, max }
    }
}

impl SlippageModel for UniformSlippage {
    fn sample(&mut self) -> Decimal {
        if self.max <= self.min {
            return Decimal::from_f64(self.min).unwrap_or(Decimal::ZERO);
        }
        let draw = self.rng.gen_range(self.min..=self.max);
        Decimal::from_f64(draw).unwrap_or(Decimal::ZERO).round_dp(6)
    }
}

/// Constant slippage.
pub struct FixedSlippage(pub Decimal);

impl SlippageModel for FixedSlippage {
    fn sample(&mut self) -> Decimal {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Fill pricing
// ---------------------------------------------------------------------------

/// Fully-costed fill before it touches the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct FillPricing {
    pub quoted_price: Decimal,
    pub executed_price: Decimal,
    pub slippage: Decimal,
    pub amount: Decimal,
    pub fees: Decimal,
    pub gas_cost: Decimal,
    pub total_cost: Decimal,
}

/// Cost engine owned by the ledger.
pub struct ExecutionCosts {
    config: CostConfig,
    slippage: Box<dyn SlippageModel>,
}

impl ExecutionCosts {
    pub fn new(config: CostConfig, slippage: Box<dyn SlippageModel>) -> Self {
        Self { config, slippage }
    }

    /// Uniform slippage from the configured band.
    pub fn uniform(config: CostConfig, seed: Option<u64>) -> Self {
        let model = UniformSlippage::new(config.slippage_min, config.slippage_max, seed);
        Self::new(config, Box::new(model))
    }

    /// Deterministic slippage, mainly for tests and replays.
    pub fn fixed(config: CostConfig, slippage: Decimal) -> Self {
        Self::new(config, Box::new(FixedSlippage(slippage)))
    }

    pub fn config(&self) -> &CostConfig {
        &self.config
    }

    /// Price a fill: BUY executes at `quoted * (1 + s)`, SELL at `quoted * (1 - s)`.
    pub fn price_fill(&mut self, side: TradeSide, shares: Decimal, quoted_price: Decimal) -> FillPricing {
        let slippage = self.slippage.sample();
        let executed_price = match side {
            TradeSide::Buy => quoted_price * (Decimal::ONE + slippage),
            TradeSide::Sell => (quoted_price * (Decimal::ONE - slippage)).max(Decimal::ZERO),
        };
        let amount = shares * executed_price;
        let fees = amount * self.config.taker_fee_rate;
        let gas_cost = self.config.gas_cost();

        FillPricing {
            quoted_price,
            executed_price,
            slippage,
            amount,
            fees,
            gas_cost,
            total_cost: amount + fees + gas_cost,
        }
    }
}

impl std::fmt::Debug for ExecutionCosts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCosts")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
