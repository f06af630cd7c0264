//! Configuration value fallbacks
//! Resolves single settings that can come from a flag, a file or the environment

use std::fmt::Display;
use std::str::FromStr;
use tracing::{debug, warn};

/// Get configuration value with priority: explicit > ENV > Default
///
/// # Arguments
/// * `explicit` - Value given on the command line or in a config file
/// * `env_var` - Environment variable name to check
/// * `default` - Default value to use as fallback
pub fn get_config_value<T>(explicit: Option<T>, env_var: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    // Priority 1: explicit value
    if let Some(val) = explicit {
        debug!("Using explicit {}", env_var);
        return val;
    }

    // Priority 2: Environment variable
    if let Ok(env_str) = std::env::var(env_var) {
        match env_str.parse::<T>() {
            Ok(val) => {
                debug!("Using {} from environment: {}", env_var, env_str);
                return val;
            },
            Err(e) => {
                warn!("Failed to parse {} from environment: {}", env_var, e);
            },
        }
    }

    // Priority 3: Default value
    debug!("Using default value for {}", env_var);
    default
}

/// Get string configuration value with priority: explicit > ENV > Default
///
/// Empty strings count as unset.
pub fn get_string_config(explicit: Option<String>, env_var: &str, default: &str) -> String {
    if let Some(val) = explicit.filter(|v| !v.is_empty()) {
        return val;
    }

    if let Ok(env_val) = std::env::var(env_var) {
        if !env_val.is_empty() {
            debug!("Using {} from environment", env_var);
            return env_val;
        }
    }

    default.to_string()
}
