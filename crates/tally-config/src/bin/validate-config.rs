//! Config validation CLI tool
//!
//! Validates a tallyd configuration file and reports any errors.

use std::path::PathBuf;
use std::process::ExitCode;
use tally_util::default_config_path;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            let default_path = default_config_path();
            eprintln!("Usage: validate-config [config-file]");
            eprintln!();
            eprintln!("Validates a tallyd configuration file.");
            eprintln!();
            eprintln!("Example:");
            eprintln!("  validate-config {}", default_path.display());
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match tally_config::load_config(&config_path) {
        Ok(settings) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Summary:");
            println!("  Config version: {}", tally_config::CURRENT_CONFIG_VERSION);
            println!("  Timezone: {}", settings.service.timezone);
            println!("  Meters: {}", settings.meters.len());
            println!("  Series: {}", settings.series_count());

            for meter in &settings.meters {
                println!();
                let window = if meter.time_window.always_active() {
                    "always".to_string()
                } else {
                    format!(
                        "days {:?} {}-{}",
                        meter.time_window.days().indices(),
                        meter.time_window.start(),
                        meter.time_window.end()
                    )
                };
                println!("  - {} [{}] window: {}", meter.id, meter.kind, window);
                if let Some(condition) = &meter.condition {
                    println!("    condition: {}", condition);
                }
                for series in &meter.series {
                    println!("    * {} resets: {}", series.id, series.reset);
                }
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed");
            eprintln!();
            match &e {
                tally_config::ConfigError::ReadError(io_err) => {
                    eprintln!("Failed to read file: {}", io_err);
                }
                tally_config::ConfigError::ParseError(parse_err) => {
                    eprintln!("TOML parse error:");
                    eprintln!("  {}", parse_err);
                }
                tally_config::ConfigError::ValidationFailed { errors } => {
                    eprintln!("Validation errors ({}):", errors.len());
                    for err in errors {
                        eprintln!("  - {}", err);
                    }
                }
                tally_config::ConfigError::UnsupportedVersion(ver) => {
                    eprintln!(
                        "Unsupported config version: {} (expected {})",
                        ver,
                        tally_config::CURRENT_CONFIG_VERSION
                    );
                }
            }
            ExitCode::from(1)
        }
    }
}
