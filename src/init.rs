//! Applies the bootloader's parsed `BootConfig` to the core. The INI text
//! itself is parsed by the out-of-scope bootloader; this is the consuming
//! side of that external interface.

use crate::boot::BootConfig;
use crate::lib::printk::set_min_level;

pub fn apply_boot_config(config: &BootConfig) {
    set_min_level(config.log_level);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::printk::LogLevel;

    #[test]
    fn applies_requested_log_level() {
        let mut config = BootConfig::default();
        config.log_level = LogLevel::Debug;
        apply_boot_config(&config);
    }
}
