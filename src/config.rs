//! Configuration for the ring log and the secure log

/// Configuration for a flash ring log instance
#[derive(Debug, Clone)]
pub struct RingLogConfig {
    /// Label of the flash region, also the control block's metadata key
    pub label: String,
    /// Metadata namespace holding control blocks
    pub meta_namespace: String,
}

impl Default for RingLogConfig {
    fn default() -> Self {
        Self {
            label: "log_secure".to_string(),
            meta_namespace: "rb_log".to_string(),
        }
    }
}

impl RingLogConfig {
    /// Default configuration bound to a different region label
    pub fn with_label(label: &str) -> Self {
        Self {
            label: label.to_string(),
            ..Self::default()
        }
    }
}

/// Configuration for the secure log
#[derive(Debug, Clone)]
pub struct SecureLogConfig {
    /// Ring log the secure records are stored in
    pub ring: RingLogConfig,
    /// Metadata namespace holding key material
    pub key_namespace: String,
    /// Blob name of the key material
    pub key_blob: String,
    /// Largest plaintext (formatted entry plus newline) per record
    pub max_plaintext_len: usize,
}

impl Default for SecureLogConfig {
    fn default() -> Self {
        Self {
            ring: RingLogConfig::default(),
            key_namespace: "log_secure_nvs".to_string(),
            key_blob: "meta".to_string(),
            max_plaintext_len: 256,
        }
    }
}
