#![no_main]

use libfuzzer_sys::fuzz_target;
use kms_keymanager::KmsConfig;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    // Decoding must never panic; whatever decodes has passed validation
    if let Ok(config) = KmsConfig::from_json(text) {
        assert!(config.validate().is_ok());
        assert!(!config.region.is_empty());
        assert!(config.cleanup_timeout().as_millis() > 0);
        assert!(format!("{:?}", config).contains("[REDACTED]"));
    }
});
