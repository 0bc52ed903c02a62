use super::*;

impl Default for Config {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            logging: LoggingConfig::default(),
            retry: RetryConfig::default(),
            devices: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/tmp/helios.log".to_string(),
            format: "structured".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 5000,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: "Olife Wallbox".to_string(),
            host: "192.168.1.100".to_string(),
            port: 502,
            slave_id: 1,
            poll_interval_ms: 5000,
            request_timeout_ms: 2000,
            connect_timeout_ms: 5000,
            failure_threshold: 3,
            read_only: false,
            solar: SolarConfig::default(),
        }
    }
}

impl Default for SolarConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            source: String::new(),
            phases: 1,
            min_current_offset: 0,
            nominal_voltage: 230.0,
            hysteresis_amps: 0.5,
            cooldown_secs: 10,
            connector: ConnectorSelect::A,
        }
    }
}
