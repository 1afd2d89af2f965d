//! Settings & Market Config.
//!
//! Grounded in `cooprefr-bettersys::models::Config::from_env` (env-driven,
//! `dotenv`-loaded, typed accessors with fallback defaults) generalized to
//! the environment/alias table this system needs, and in
//! `original_source/config.py::DatabaseConfig` for the alias set itself
//! (`wcmkt3`/`wcmkt2` i.e. prod/test, `sde`, `fittings`, each with a local
//! path plus an optional Turso remote URL/token pair).

use crate::error::{CoreError, CoreResult};
use std::collections::HashMap;
use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    fn from_str(s: &str) -> CoreResult<Self> {
        match s {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(CoreError::Config(format!(
                "unknown app.environment '{other}', expected 'development' or 'production'"
            ))),
        }
    }
}

/// Region/system/structure scope of the tracked market, per spec.md §4.1.
#[derive(Debug, Clone)]
pub struct MarketIdentity {
    pub region_id: i64,
    pub system_id: i64,
    pub structure_id: i64,
    pub market_name: String,
}

/// On-disk file, remote replica URL/token, for one database alias.
#[derive(Debug, Clone)]
pub struct DbAlias {
    pub file_name: String,
    pub remote_url: Option<String>,
    pub remote_token: Option<String>,
}

impl DbAlias {
    pub fn is_replicated(&self) -> bool {
        self.remote_url.is_some()
    }
}

/// Headers and endpoints for the upstream ESI-like API.
#[derive(Debug, Clone)]
pub struct EsiConfig {
    pub base_url: String,
    pub compatibility_date: String,
    pub user_agent: String,
    pub tenant: String,
}

impl EsiConfig {
    pub fn market_orders_structure_url(&self, structure_id: i64) -> String {
        format!("{}/markets/structures/{}", self.base_url, structure_id)
    }

    pub fn market_orders_region_url(&self, region_id: i64) -> String {
        format!("{}/markets/{}/orders", self.base_url, region_id)
    }

    pub fn market_history_url(&self, region_id: i64) -> String {
        format!("{}/markets/{}/history", self.base_url, region_id)
    }

    pub fn universe_names_url(&self) -> String {
        format!("{}/universe/names/", self.base_url)
    }

    pub fn token_url(&self) -> String {
        "https://login.eveonline.com/v2/oauth/token".to_string()
    }
}

/// Enumerated, finite set of database aliases the system knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbAliasName {
    WcmktProd,
    WcmktTest,
    Sde,
    Fittings,
}

impl DbAliasName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WcmktProd => "wcmkt_prod",
            Self::WcmktTest => "wcmkt_test",
            Self::Sde => "sde",
            Self::Fittings => "fittings",
        }
    }

    fn all() -> [Self; 4] {
        [Self::WcmktProd, Self::WcmktTest, Self::Sde, Self::Fittings]
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub environment: Environment,
    pub market: MarketIdentity,
    pub esi: EsiConfig,
    aliases: HashMap<DbAliasName, DbAlias>,
}

impl Settings {
    pub fn from_env() -> CoreResult<Self> {
        dotenv::dotenv().ok();

        let environment = Environment::from_str(
            &env::var("APP_ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        )?;

        let market = MarketIdentity {
            region_id: parse_required_i64("MARKET_REGION_ID")?,
            system_id: parse_required_i64("MARKET_SYSTEM_ID")?,
            structure_id: parse_required_i64("MARKET_STRUCTURE_ID")?,
            market_name: env::var("MARKET_NAME").unwrap_or_else(|_| "unnamed-market".to_string()),
        };

        let esi = EsiConfig {
            base_url: env::var("ESI_BASE_URL")
                .unwrap_or_else(|_| "https://esi.evetech.net/latest".to_string()),
            compatibility_date: env::var("ESI_COMPATIBILITY_DATE")
                .unwrap_or_else(|_| "2025-08-26".to_string()),
            user_agent: env::var("ESI_USER_AGENT")
                .unwrap_or_else(|_| "mkts-core/0.1 (contact: ops@example.invalid)".to_string()),
            tenant: env::var("ESI_TENANT").unwrap_or_else(|_| "tranquility".to_string()),
        };

        let mut aliases = HashMap::new();
        for name in DbAliasName::all() {
            let upper = name.as_str().to_uppercase();
            let file_name = env::var(format!("{upper}_DB_FILE"))
                .unwrap_or_else(|_| format!("{}.db", name.as_str()));
            let remote_url = env::var(format!("{upper}_URL")).ok();
            let remote_token = env::var(format!("{upper}_TOKEN")).ok();
            aliases.insert(
                name,
                DbAlias {
                    file_name,
                    remote_url,
                    remote_token,
                },
            );
        }

        Ok(Self {
            environment,
            market,
            esi,
            aliases,
        })
    }

    /// Fails fast on an unknown alias, per spec.md §4.1.
    pub fn alias(&self, name: DbAliasName) -> CoreResult<&DbAlias> {
        self.aliases
            .get(&name)
            .ok_or_else(|| CoreError::Config(format!("unknown database alias '{}'", name.as_str())))
    }

    /// The market store alias selected for the current environment.
    pub fn market_db_alias(&self) -> DbAliasName {
        match self.environment {
            Environment::Development => DbAliasName::WcmktTest,
            Environment::Production => DbAliasName::WcmktProd,
        }
    }
}

fn parse_required_i64(key: &str) -> CoreResult<i64> {
    env::var(key)
        .map_err(|_| CoreError::Config(format!("missing required setting '{key}'")))?
        .parse()
        .map_err(|_| CoreError::Config(format!("setting '{key}' is not a valid integer")))
}
