use super::Config;

impl Config {
    pub fn apply_env_overrides(&mut self) {
        if let Ok(retries) = std::env::var("HELMSMAN_MAX_RETRIES")
            && let Ok(retries) = retries.parse::<u32>()
        {
            self.engine.max_retries = retries;
        }

        if let Ok(timeout) = std::env::var("HELMSMAN_APPROVAL_TIMEOUT_SECS")
            && let Ok(timeout) = timeout.parse::<u64>()
            && timeout > 0
        {
            self.approval.timeout_secs = timeout;
        }

        if let Ok(backend) = std::env::var("HELMSMAN_OBSERVABILITY")
            && !backend.is_empty()
        {
            self.observability.backend = backend;
        }
    }
}
