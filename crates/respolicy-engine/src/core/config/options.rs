//! Config utils.

use std::collections::HashMap;

/// Parses a config value string consisting of a name and an optional
/// bracketed options part, e.g. `highprio[policy=fifo,priority=42]` splits
/// into `highprio` and `"policy=fifo,priority=42"`.
pub fn parse_config_value(config_str: &str) -> (String, Option<String>) {
    match config_str.split_once('[') {
        Some((l, r)) => (l.to_string(), Some(r.to_string().replace(']', ""))),
        None => (config_str.to_string(), None),
    }
}

/// Parses an options string into a name/value map.
pub fn parse_options(options_str: &str) -> HashMap<String, String> {
    let mut options = HashMap::new();
    for option_str in options_str.split(',') {
        if let Some((name, value)) = option_str.split_once('=') {
            options.insert(name.to_string(), value.to_string());
        }
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_name_and_options() {
        let (name, options) = parse_config_value("lowlatency[minCPUs=2,maxCPUs=4]");
        assert_eq!(name, "lowlatency");
        let options = parse_options(&options.unwrap());
        assert_eq!(options.get("minCPUs").unwrap(), "2");
        assert_eq!(options.get("maxCPUs").unwrap(), "4");
        assert_eq!(options.get("other"), None);
    }

    #[test]
    fn plain_name_has_no_options() {
        let (name, options) = parse_config_value("balloons");
        assert_eq!(name, "balloons");
        assert_eq!(options, None);
    }
}
