//! Environment-driven configuration
//!
//! Every knob can be set either as a CLI flag or through the environment
//! variable named in its `env` attribute; defaults match the values the
//! orchestrator ships with.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Orchestrator configuration
#[derive(Parser, Clone, Debug)]
#[command(name = "urumi-orchestrator", version, about = "Store lifecycle orchestrator")]
pub struct Settings {
    /// HTTP listen address
    #[arg(long, env = "ORCH_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: SocketAddr,

    /// Path to the packaged application chart
    #[arg(long, env = "CHART_PATH", default_value = "../charts/ecommerce-store")]
    pub chart_path: PathBuf,

    /// Base values file merged under per-store overrides
    #[arg(
        long,
        env = "VALUES_FILE",
        default_value = "../charts/ecommerce-store/values-local.yaml"
    )]
    pub values_file: PathBuf,

    /// Domain under which store hostnames are minted
    #[arg(long, env = "STORE_BASE_DOMAIN", default_value = "127.0.0.1.nip.io")]
    pub base_domain: String,

    /// Preferred ingress class; falls back to what the cluster offers
    #[arg(long, env = "INGRESS_CLASS", default_value = "nginx")]
    pub ingress_class: String,

    /// Storage class for store volumes; empty means detect the cluster default
    #[arg(long, env = "STORAGE_CLASS", default_value = "")]
    pub storage_class: String,

    /// Admin account user name handed to the chart
    #[arg(long, env = "WP_ADMIN_USER", default_value = "admin")]
    pub admin_user: String,

    /// Admin account email handed to the chart
    #[arg(long, env = "WP_ADMIN_EMAIL", default_value = "admin@example.com")]
    pub admin_email: String,

    /// Fixed admin password; empty means generate one per store
    #[arg(long, env = "WP_ADMIN_PASSWORD", default_value = "")]
    pub admin_password: String,

    /// Registry persistence file
    #[arg(long, env = "STORE_FILE", default_value = "data/stores.json")]
    pub store_file: PathBuf,

    /// Hard deadline for one provision or delete task
    #[arg(long, env = "PROVISION_TIMEOUT", default_value = "8m", value_parser = humantime::parse_duration)]
    pub provision_timeout: Duration,

    /// Size of the provision/delete permit pool
    #[arg(long, env = "MAX_CONCURRENT_PROVISIONS", default_value_t = 2)]
    pub max_concurrent_jobs: usize,

    /// Global cap on non-deleting stores; 0 disables the check
    #[arg(long, env = "MAX_STORES_TOTAL", default_value_t = 20)]
    pub max_stores_total: usize,

    /// Per-source cap on non-deleting stores; 0 disables the check
    #[arg(long, env = "MAX_STORES_PER_IP", default_value_t = 5)]
    pub max_stores_per_ip: usize,

    /// Write requests allowed per source within the rate-limit window; 0 disables
    #[arg(long, env = "RATE_LIMIT_MAX", default_value_t = 15)]
    pub rate_limit_max: u32,

    /// Sliding-window length for the rate limiter
    #[arg(long, env = "RATE_LIMIT_WINDOW", default_value = "1m", value_parser = humantime::parse_duration)]
    pub rate_limit_window: Duration,

    /// Append-only audit log path
    #[arg(long, env = "AUDIT_LOG_FILE", default_value = "data/audit.log")]
    pub audit_log_file: PathBuf,

    /// Append-only activity log path
    #[arg(long, env = "ACTIVITY_LOG_FILE", default_value = "data/activity.log")]
    pub activity_log_file: PathBuf,

    /// Number of trailing activity lines served by the API
    #[arg(long, env = "ACTIVITY_LIMIT", default_value_t = 50)]
    pub activity_limit: usize,

    /// Provision retries after the first failed attempt
    #[arg(long, env = "MAX_PROVISION_RETRIES", default_value_t = 1)]
    pub max_provision_retries: u32,

    /// Pause between provision attempts
    #[arg(long, env = "PROVISION_RETRY_BACKOFF", default_value = "10s", value_parser = humantime::parse_duration)]
    pub provision_retry_backoff: Duration,

    /// Install the configured plugin list into new stores
    #[arg(long, env = "AUTO_INSTALL_PLUGINS", default_value_t = false, action = clap::ArgAction::Set)]
    pub auto_install_plugins: bool,

    /// Comma-separated plugin list
    #[arg(long, env = "PLUGINS", default_value = "")]
    pub plugins: String,

    /// File with one plugin per line; takes precedence over --plugins
    #[arg(long, env = "PLUGINS_FILE", default_value = "")]
    pub plugins_file: String,
}

impl Settings {
    /// Total provision attempts the job runner budgets for
    pub fn max_provision_attempts(&self) -> u32 {
        self.max_provision_retries.saturating_add(1)
    }

    /// Resolve the plugin list for new stores.
    ///
    /// Empty unless auto-install is enabled. The plugins file wins over the
    /// inline list; blank lines and `#` comments are ignored.
    pub fn plugin_list(&self) -> Vec<String> {
        if !self.auto_install_plugins {
            return Vec::new();
        }
        if !self.plugins_file.is_empty() {
            if let Ok(contents) = std::fs::read_to_string(&self.plugins_file) {
                let entries = parse_plugins_file(&contents);
                if !entries.is_empty() {
                    return entries;
                }
            }
        }
        self.plugins
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect()
    }
}

fn parse_plugins_file(contents: &str) -> Vec<String> {
    contents
        .lines()
        .filter_map(|line| {
            let entry = line.split('#').next().unwrap_or("").trim();
            if entry.is_empty() {
                None
            } else {
                Some(entry.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_settings() -> Settings {
        Settings::parse_from(["urumi-orchestrator"])
    }

    #[test]
    fn defaults_match_the_shipping_configuration() {
        let settings = base_settings();
        assert_eq!(settings.listen_addr.port(), 8080);
        assert_eq!(settings.base_domain, "127.0.0.1.nip.io");
        assert_eq!(settings.ingress_class, "nginx");
        assert_eq!(settings.provision_timeout, Duration::from_secs(8 * 60));
        assert_eq!(settings.max_concurrent_jobs, 2);
        assert_eq!(settings.max_stores_total, 20);
        assert_eq!(settings.max_stores_per_ip, 5);
        assert_eq!(settings.rate_limit_max, 15);
        assert_eq!(settings.rate_limit_window, Duration::from_secs(60));
        assert_eq!(settings.max_provision_retries, 1);
        assert_eq!(settings.provision_retry_backoff, Duration::from_secs(10));
        assert_eq!(settings.activity_limit, 50);
    }

    #[test]
    fn durations_accept_human_readable_values() {
        let settings = Settings::parse_from([
            "urumi-orchestrator",
            "--provision-timeout",
            "90s",
            "--rate-limit-window",
            "2m",
        ]);
        assert_eq!(settings.provision_timeout, Duration::from_secs(90));
        assert_eq!(settings.rate_limit_window, Duration::from_secs(120));
    }

    #[test]
    fn attempt_budget_is_retries_plus_one() {
        let mut settings = base_settings();
        settings.max_provision_retries = 2;
        assert_eq!(settings.max_provision_attempts(), 3);
        settings.max_provision_retries = 0;
        assert_eq!(settings.max_provision_attempts(), 1);
    }

    #[test]
    fn plugin_list_is_empty_unless_enabled() {
        let mut settings = base_settings();
        settings.plugins = "seo,cache".to_string();
        assert!(settings.plugin_list().is_empty());
        settings.auto_install_plugins = true;
        assert_eq!(settings.plugin_list(), vec!["seo", "cache"]);
    }

    #[test]
    fn plugins_file_wins_and_strips_comments() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# header").unwrap();
        writeln!(file, "seo-toolkit").unwrap();
        writeln!(file, "cache-warmer  # inline note").unwrap();
        writeln!(file).unwrap();

        let mut settings = base_settings();
        settings.auto_install_plugins = true;
        settings.plugins = "ignored".to_string();
        settings.plugins_file = file.path().to_string_lossy().to_string();
        assert_eq!(settings.plugin_list(), vec!["seo-toolkit", "cache-warmer"]);
    }

    #[test]
    fn parse_plugins_file_handles_comment_only_content() {
        assert!(parse_plugins_file("# a\n   # b\n\n").is_empty());
    }
}
