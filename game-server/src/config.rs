//! The server configuration. The settings live in `ServerConfig.json` next to the
//! binary and can be hot reloaded over the `/reload` route, so operational knobs
//! can be turned without restarting the service.

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

/// The keep alive expectations towards the clients.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct KeepAliveConfig {
    /// How often a client is supposed to send its ping beat.
    pub beat_interval_ms: u64,
    /// After this much inbound silence a connection is considered gone.
    pub timeout_ms: u64,
}

impl Default for KeepAliveConfig {
    fn default() -> KeepAliveConfig {
        KeepAliveConfig {
            beat_interval_ms: 25_000,
            timeout_ms: 90_000,
        }
    }
}

/// The rating parameters, consumed by the external profile service.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EloConfig {
    /// The rating a fresh player starts with.
    pub default: f64,
    /// The slope used while a player is still in calibration.
    pub max_log_slope: f64,
    /// The slope used after calibration.
    pub normal_log_slope: f64,
    /// The amount of games a player calibrates over.
    pub calibration_games: u32,
}

impl Default for EloConfig {
    fn default() -> EloConfig {
        EloConfig {
            default: 1200.0,
            max_log_slope: 800.0,
            normal_log_slope: 400.0,
            calibration_games: 10,
        }
    }
}

/// Knobs of the live game rules themselves.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RulesConfig {
    /// The amount of seconds one manual time gift hands to the opponent.
    pub secs_added_manually: i64,
}

impl Default for RulesConfig {
    fn default() -> RulesConfig {
        RulesConfig {
            secs_added_manually: 15,
        }
    }
}

/// Limits against challenge spamming, consumed by the external challenge service.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LimitsConfig {
    pub max_total_active_challenges: u32,
    pub max_same_callee_active_challenges: u32,
}

impl Default for LimitsConfig {
    fn default() -> LimitsConfig {
        LimitsConfig {
            max_total_active_challenges: 20,
            max_same_callee_active_challenges: 3,
        }
    }
}

/// The full configuration tree. Every section falls back to its default when the
/// file does not mention it.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub keep_alive: KeepAliveConfig,
    pub elo: EloConfig,
    pub rules: RulesConfig,
    pub limits: LimitsConfig,
    /// The oldest client build the server still talks to.
    pub min_client_build: u32,
    /// The build number the server reports about itself.
    pub server_build: u32,
}

/// Reloads the configuration file and swaps the shared configuration in one go.
pub async fn reload_config(slot: &RwLock<ServerConfig>) -> Result<(), String> {
    let json_content = fs::read_to_string("ServerConfig.json")
        .await
        .map_err(|e| format!("Failed to read file: {}", e))?;
    let fresh: ServerConfig =
        serde_json::from_str(&json_content).map_err(|e| format!("Failed to parse JSON: {}", e))?;

    {
        let mut config = slot.write().await;
        *config = fresh; // Replace all.
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_the_defaults() {
        let config: ServerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.rules.secs_added_manually, 15);
        assert_eq!(config.keep_alive.timeout_ms, 90_000);
    }

    #[test]
    fn partial_sections_only_override_their_fields() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"rules": {"secs_added_manually": 30}, "server_build": 7}"#)
                .unwrap();
        assert_eq!(config.rules.secs_added_manually, 30);
        assert_eq!(config.server_build, 7);
        assert_eq!(config.limits.max_total_active_challenges, 20);
    }
}
