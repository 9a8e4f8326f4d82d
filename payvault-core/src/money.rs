//! Money value object and the fixed currency converter.
//!
//! All arithmetic is decimal (`rust_decimal`), rounded half-up to two places.
//! The rate table maps an ISO 4217 code to the euro value of one unit of that
//! currency and is loaded once per process.

use crate::error::CurrencyError;
use once_cell::sync::Lazy;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Canonical currency all amounts are compared in.
pub const BASE_CURRENCY: &str = "EUR";

/// Decimal places kept for every monetary amount.
pub const MONEY_SCALE: u32 = 2;

/// Round half-up (away from zero) to two decimal places.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Displayed compensation: euro amount plus commission.
pub fn displayed(euro_amount: Decimal, commission: Decimal) -> Decimal {
    round_money(euro_amount + commission)
}

/// Process-wide default rate table.
pub static DEFAULT_RATES: Lazy<RateTable> = Lazy::new(RateTable::default_table);

/// Fixed conversion table, euro value per unit of currency.
#[derive(Debug, Clone, PartialEq)]
pub struct RateTable {
    rates: HashMap<String, Decimal>,
}

impl RateTable {
    /// Build a table from `(code, euro_per_unit)` pairs. The base currency is
    /// always present with a rate of one.
    pub fn new<I, S>(rates: I) -> Self
    where
        I: IntoIterator<Item = (S, Decimal)>,
        S: AsRef<str>,
    {
        let mut table: HashMap<String, Decimal> = rates
            .into_iter()
            .map(|(code, rate)| (code.as_ref().trim().to_ascii_uppercase(), rate))
            .collect();
        table.insert(BASE_CURRENCY.to_string(), Decimal::ONE);
        Self { rates: table }
    }

    /// The rates compensation records are converted with.
    pub fn default_table() -> Self {
        Self::new([
            ("USD", Decimal::new(92, 2)),
            ("GBP", Decimal::new(117, 2)),
            ("CHF", Decimal::new(104, 2)),
            ("SEK", Decimal::new(87, 3)),
            ("NOK", Decimal::new(86, 3)),
            ("DKK", Decimal::new(134, 3)),
            ("PLN", Decimal::new(23, 2)),
            ("CZK", Decimal::new(40, 3)),
            ("HUF", Decimal::new(25, 4)),
            ("RON", Decimal::new(20, 2)),
            ("BGN", Decimal::new(51, 2)),
            ("JPY", Decimal::new(61, 4)),
            ("CAD", Decimal::new(68, 2)),
            ("AUD", Decimal::new(61, 2)),
        ])
    }

    /// Look up the euro rate for a currency code (case-insensitive).
    pub fn rate(&self, currency_code: &str) -> Result<Decimal, CurrencyError> {
        let code = currency_code.trim().to_ascii_uppercase();
        self.rates
            .get(&code)
            .copied()
            .ok_or(CurrencyError::UnsupportedCurrency {
                code: currency_code.to_string(),
            })
    }

    /// Convert a local-currency amount into euros.
    pub fn convert(&self, amount: Decimal, currency_code: &str) -> Result<Decimal, CurrencyError> {
        let rate = self.rate(currency_code)?;
        Ok(round_money(amount * rate))
    }

    pub fn supports(&self, currency_code: &str) -> bool {
        self.rate(currency_code).is_ok()
    }

    /// Supported codes, sorted.
    pub fn codes(&self) -> Vec<&str> {
        let mut codes: Vec<&str> = self.rates.keys().map(String::as_str).collect();
        codes.sort_unstable();
        codes
    }
}

impl Default for RateTable {
    fn default() -> Self {
        Self::default_table()
    }
}

/// A converted compensation figure.
///
/// Constructed only through [`Money::from_local`] / [`Money::from_euro`], so
/// `displayed == round(euro_amount + commission, 2)` always holds. Derived
/// figures are never mutated in place; a change produces a new value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "MoneyParts")]
pub struct Money {
    local_amount: Decimal,
    currency_code: String,
    euro_amount: Decimal,
    commission: Decimal,
    displayed: Decimal,
}

impl Money {
    /// Convert a local amount with the given table.
    pub fn from_local(
        local_amount: Decimal,
        currency_code: &str,
        commission: Decimal,
        rates: &RateTable,
    ) -> Result<Self, CurrencyError> {
        let euro_amount = rates.convert(local_amount, currency_code)?;
        let commission = round_money(commission);
        Ok(Self {
            local_amount: round_money(local_amount),
            currency_code: currency_code.trim().to_ascii_uppercase(),
            euro_amount,
            commission,
            displayed: displayed(euro_amount, commission),
        })
    }

    /// Money already denominated in the base currency.
    pub fn from_euro(euro_amount: Decimal, commission: Decimal) -> Self {
        let euro_amount = round_money(euro_amount);
        let commission = round_money(commission);
        Self {
            local_amount: euro_amount,
            currency_code: BASE_CURRENCY.to_string(),
            euro_amount,
            commission,
            displayed: displayed(euro_amount, commission),
        }
    }

    pub fn local_amount(&self) -> Decimal {
        self.local_amount
    }

    pub fn currency_code(&self) -> &str {
        &self.currency_code
    }

    pub fn euro_amount(&self) -> Decimal {
        self.euro_amount
    }

    pub fn commission(&self) -> Decimal {
        self.commission
    }

    pub fn displayed(&self) -> Decimal {
        self.displayed
    }

    /// Same local amount and currency with a different commission.
    pub fn with_commission(&self, commission: Decimal) -> Self {
        let commission = round_money(commission);
        Self {
            local_amount: self.local_amount,
            currency_code: self.currency_code.clone(),
            euro_amount: self.euro_amount,
            commission,
            displayed: displayed(self.euro_amount, commission),
        }
    }
}

/// Wire shape of [`Money`], validated on the way in.
#[derive(Deserialize)]
struct MoneyParts {
    local_amount: Decimal,
    currency_code: String,
    euro_amount: Decimal,
    commission: Decimal,
    displayed: Decimal,
}

impl TryFrom<MoneyParts> for Money {
    type Error = CurrencyError;

    fn try_from(parts: MoneyParts) -> Result<Self, Self::Error> {
        if displayed(parts.euro_amount, parts.commission) != parts.displayed {
            return Err(CurrencyError::InconsistentAmount {
                euro: parts.euro_amount.to_string(),
                commission: parts.commission.to_string(),
                displayed: parts.displayed.to_string(),
            });
        }
        Ok(Self {
            local_amount: parts.local_amount,
            currency_code: parts.currency_code,
            euro_amount: parts.euro_amount,
            commission: parts.commission,
            displayed: parts.displayed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_rounds_half_up() {
        let table = RateTable::new([("XTS", Decimal::new(5, 1))]);
        // 0.05 * 0.5 = 0.025 -> 0.03
        assert_eq!(
            table.convert(Decimal::new(5, 2), "XTS"),
            Ok(Decimal::new(3, 2))
        );
        // 0.03 * 0.5 = 0.015 -> 0.02
        assert_eq!(
            table.convert(Decimal::new(3, 2), "xts"),
            Ok(Decimal::new(2, 2))
        );
    }

    #[test]
    fn test_convert_unsupported_currency() {
        let err = DEFAULT_RATES
            .convert(Decimal::ONE_HUNDRED, "XYZ")
            .expect_err("XYZ is not in the table");
        assert_eq!(
            err,
            CurrencyError::UnsupportedCurrency {
                code: "XYZ".to_string()
            }
        );
    }

    #[test]
    fn test_base_currency_always_present() {
        let table = RateTable::new(Vec::<(&str, Decimal)>::new());
        assert_eq!(table.rate("eur"), Ok(Decimal::ONE));
        assert_eq!(table.codes(), vec!["EUR"]);
    }

    #[test]
    fn test_money_from_local() {
        let money = Money::from_local(
            Decimal::new(50_000, 0),
            "usd",
            Decimal::new(500, 0),
            &DEFAULT_RATES,
        )
        .expect("USD is supported");
        assert_eq!(money.currency_code(), "USD");
        assert_eq!(money.euro_amount(), Decimal::new(4_600_000, 2));
        assert_eq!(money.displayed(), Decimal::new(4_650_000, 2));
    }

    #[test]
    fn test_with_commission_keeps_salary() {
        let money = Money::from_euro(Decimal::new(40_000, 0), Decimal::new(500, 0));
        let changed = money.with_commission(Decimal::new(750, 0));
        assert_eq!(changed.euro_amount(), money.euro_amount());
        assert_eq!(changed.displayed(), Decimal::new(40_750, 0));
        assert_eq!(money.displayed(), Decimal::new(40_500, 0));
    }

    #[test]
    fn test_deserialize_rejects_inconsistent_displayed() {
        let json = r#"{"local_amount":"100","currency_code":"EUR","euro_amount":"100","commission":"5","displayed":"999"}"#;
        assert!(serde_json::from_str::<Money>(json).is_err());

        let money = Money::from_euro(Decimal::new(100, 0), Decimal::new(5, 0));
        let encoded = serde_json::to_string(&money).expect("serialize");
        let decoded: Money = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded, money);
    }
}
