use std::fs;

use anyhow::Context;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::Deserialize;

fn default_timezone() -> Tz {
    chrono_tz::UTC
}

#[derive(Clone, Debug, Deserialize)]
pub struct ContractMonth {
    /// Front-month contract code, e.g. "NQZ5".
    pub code: String,
    pub expiry: NaiveDateTime,
}

/// Operator-authored instruction describing how an expiring contract rolls.
#[derive(Clone, Debug, Deserialize)]
pub struct RollInstruction {
    pub roll_on_next_start: bool,
    pub from: String,
    pub to: String,
    /// Roll date, interpreted in the instrument's exchange timezone.
    pub date: NaiveDate,
    /// Price offset applied to replacement stop orders.
    pub offset: f64,
    /// Net position the operator expects to carry across the roll.
    pub net_position: i64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Instrument {
    pub market: String,
    pub symbol: String,
    pub front_month: ContractMonth,
    pub tick_size: f64,
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
    #[serde(default)]
    pub roll_instruction: Option<RollInstruction>,
}

impl Instrument {
    pub fn today_in_exchange_tz(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.timezone).date_naive()
    }
}

/// Contract-month metadata consulted on outbound orders and at roll time.
///
/// Loaded once at startup and injected into the OMS core.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct InstrumentRepository {
    #[serde(default)]
    instruments: Vec<Instrument>,
}

impl InstrumentRepository {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read instrument file at {path}"))?;
        let repo: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to deserialize instrument TOML at {path}"))?;
        Ok(repo)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn instruments(&self) -> &[Instrument] {
        &self.instruments
    }

    pub fn find(&self, market: &str, symbol: &str) -> Option<&Instrument> {
        self.instruments
            .iter()
            .find(|i| i.market == market && i.symbol == symbol)
    }

    /// Contract code to put on the wire for `(market, symbol)`. Unknown
    /// symbols trade under their own name.
    pub fn order_symbol(&self, market: &str, symbol: &str) -> String {
        match self.find(market, symbol) {
            Some(instrument) => instrument.front_month.code.clone(),
            None => symbol.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
        [[instruments]]
        market = "CME"
        symbol = "NQ"
        tick_size = 0.25
        timezone = "America/Chicago"
        front_month = { code = "NQZ5", expiry = "2025-12-19T00:00:00" }

        [instruments.roll_instruction]
        roll_on_next_start = true
        from = "NQU5"
        to = "NQZ5"
        date = "2025-09-12"
        offset = 25.0
        net_position = 3

        [[instruments]]
        market = "CME"
        symbol = "ES"
        tick_size = 0.25
        front_month = { code = "ESZ5", expiry = "2025-12-19T00:00:00" }
    "#;

    #[test]
    fn parse_repository_toml() {
        let repo: InstrumentRepository = toml::from_str(DOC).unwrap();
        assert_eq!(repo.instruments().len(), 2);

        let nq = repo.find("CME", "NQ").unwrap();
        assert_eq!(nq.front_month.code, "NQZ5");
        assert_eq!(nq.timezone, chrono_tz::America::Chicago);
        let roll = nq.roll_instruction.as_ref().unwrap();
        assert_eq!(roll.from, "NQU5");
        assert_eq!(roll.net_position, 3);

        let es = repo.find("CME", "ES").unwrap();
        assert_eq!(es.timezone, chrono_tz::UTC);
        assert!(es.roll_instruction.is_none());
    }

    #[test]
    fn order_symbol_substitutes_front_month() {
        let repo: InstrumentRepository = toml::from_str(DOC).unwrap();
        assert_eq!(repo.order_symbol("CME", "NQ"), "NQZ5");
        assert_eq!(repo.order_symbol("CME", "CL"), "CL");
        assert_eq!(repo.order_symbol("EUREX", "NQ"), "NQ");
    }
}
