#![no_main]

use estela::TracerConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Parsing and validation must reject bad input without panicking
        if let Ok(config) = TracerConfig::from_toml_str(input) {
            let _ = config.validate();
            let _ = config.to_toml();
        }
    }
});
