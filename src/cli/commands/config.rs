//! `conductor config`: print the effective configuration.

use anyhow::Result;

use crate::domain::models::Config;

/// The config has already been loaded and validated by `main`.
pub fn execute(config: &Config, json: bool) -> Result<()> {
    println!("{}", render(config, json)?);
    Ok(())
}

fn render(config: &Config, json: bool) -> Result<String> {
    if json {
        Ok(serde_json::to_string_pretty(config)?)
    } else {
        Ok(serde_yaml::to_string(config)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_render_round_trips() {
        let mut config = Config::default();
        config.qa.max_concurrent = 3;
        let yaml = render(&config, false).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.qa.max_concurrent, 3);
        assert!(render(&config, true).unwrap().starts_with('{'));
    }
}
